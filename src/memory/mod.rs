//! 记忆层：本轮对话上下文（持久化历史由 Store 负责）

pub mod conversation;

pub use conversation::{ConversationMemory, Message, Role};
