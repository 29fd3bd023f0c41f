//! Teamwork - 对话式项目 / 任务助手
//!
//! 模型生成 JavaScript，在 QuickJS 沙箱中通过受限的能力面读写项目数据；
//! 所有修改先登记为待确认操作，由用户点击确认后执行。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与恢复引擎
//! - **store**: 持久化（SQLite）
//! - **operations**: 待确认操作、注册表与执行器
//! - **sandbox**: 能力面、脚本沙箱、语法检查
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 本轮对话上下文
//! - **messaging**: 消息发送抽象（控制台 / 测试记录）
//! - **conversation**: Planner、续写循环、Assistant 入口

pub mod config;
pub mod conversation;
pub mod core;
pub mod llm;
pub mod memory;
pub mod messaging;
pub mod observability;
pub mod operations;
pub mod sandbox;
pub mod store;

pub use conversation::{Assistant, CallbackOutcome, IncomingMessage};
