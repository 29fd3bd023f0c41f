//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 BotError 决定 RetryWithPrompt / NotifyUser / Abort。

use thiserror::Error;

/// 运行过程中可能出现的错误：脚本故障（校验、语法、运行时、超时）、确认流程故障（不存在、无权限）与协作方故障
#[derive(Error, Debug, Clone)]
pub enum BotError {
    /// 能力调用参数缺失或类型错误，在创建待确认操作之前即报错
    #[error("Validation error: {0}")]
    Validation(String),

    /// Syntax Guard 发现无法自动修复的结构问题，不执行
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Script runtime error: {0}")]
    Runtime(String),

    #[error("Script timed out after {0}s")]
    Timeout(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 故障分类（用于审计日志与恢复决策）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Validation,
    Syntax,
    Runtime,
    Timeout,
    NotFound,
    Unauthorized,
    Collaborator,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Validation => "validation",
            FaultKind::Syntax => "syntax",
            FaultKind::Runtime => "runtime",
            FaultKind::Timeout => "timeout",
            FaultKind::NotFound => "not_found",
            FaultKind::Unauthorized => "unauthorized",
            FaultKind::Collaborator => "collaborator",
        }
    }
}

impl BotError {
    pub fn kind(&self) -> FaultKind {
        match self {
            BotError::Validation(_) => FaultKind::Validation,
            BotError::Syntax(_) => FaultKind::Syntax,
            BotError::Runtime(_) => FaultKind::Runtime,
            BotError::Timeout(_) => FaultKind::Timeout,
            BotError::NotFound(_) => FaultKind::NotFound,
            BotError::Unauthorized(_) => FaultKind::Unauthorized,
            BotError::Storage(_)
            | BotError::Llm(_)
            | BotError::Messaging(_)
            | BotError::Config(_) => FaultKind::Collaborator,
        }
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(e: rusqlite::Error) -> Self {
        BotError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Config(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 将纠错提示注入下一轮，让模型重新生成代码
    RetryWithPrompt(String),
    /// 向用户展示简短提示（完整细节只写入日志）
    NotifyUser(String),
    /// 终止针对该操作的处理，附带给用户的简短说明
    Abort(String),
}
