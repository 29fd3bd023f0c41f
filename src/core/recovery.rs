//! 错误恢复引擎
//!
//! 根据 BotError 类型返回 RecoveryAction，供续写循环决定是让模型自我修正、提示用户还是终止。

use crate::core::{BotError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 提示用户 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作；面向用户的文本不包含解释器内部信息
    pub fn handle(&self, err: &BotError) -> RecoveryAction {
        match err {
            BotError::Validation(detail) => RecoveryAction::RetryWithPrompt(format!(
                "上一段代码调用 teamwork API 时参数校验失败: {detail}。\
                请检查必填参数及其类型（例如 project_id 必须是数字，title 必须是字符串），\
                然后只输出修正后的完整 JavaScript 代码。"
            )),
            BotError::Syntax(detail) => RecoveryAction::RetryWithPrompt(format!(
                "上一段代码存在语法问题: {detail}。\
                map() 回调返回对象时必须写成 `x => ({{ ... }})` 或在代码块中使用 return。\
                请只输出修正后的完整 JavaScript 代码。"
            )),
            BotError::Runtime(_) => RecoveryAction::NotifyUser(
                "⚠️ 执行时出现错误，操作没有完成，请换个说法再试一次。".to_string(),
            ),
            BotError::Timeout(secs) => RecoveryAction::NotifyUser(format!(
                "⏰ 计算耗时过长（超过 {secs} 秒），已停止。请简化请求后重试。"
            )),
            BotError::NotFound(_) => {
                RecoveryAction::Abort("操作不存在或已经处理过。".to_string())
            }
            BotError::Unauthorized(_) => {
                RecoveryAction::Abort("你没有权限执行这个操作。".to_string())
            }
            BotError::Storage(_) | BotError::Llm(_) | BotError::Messaging(_) | BotError::Config(_) => {
                RecoveryAction::NotifyUser("❌ 处理请求时发生内部错误，请稍后再试。".to_string())
            }
        }
    }

    /// 是否应把该错误反馈给模型自我修正（而不是直接展示给用户）
    pub fn is_self_correctable(&self, err: &BotError) -> bool {
        matches!(self.handle(err), RecoveryAction::RetryWithPrompt(_))
    }
}
