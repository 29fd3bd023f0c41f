//! 消息协作方：向用户发送文本、带按钮的消息、确认请求
//!
//! 核心不依赖具体聊天协议；控制台实现用于本地运行，RecordingMessenger 用于测试。

pub mod console;
pub mod recording;

use async_trait::async_trait;

use crate::core::BotError;
use crate::operations::{Button, CallbackAction, PendingOperation};

pub use console::ConsoleMessenger;
pub use recording::{RecordingMessenger, SentMessage};

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), BotError>;

    /// buttons 的 action 即回调数据
    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[Button],
    ) -> Result<(), BotError>;

    /// 默认实现：发送操作描述 + 确认 / 取消两个按钮
    async fn request_confirmation(
        &self,
        chat_id: i64,
        op: &PendingOperation,
    ) -> Result<(), BotError> {
        self.send_with_buttons(chat_id, &confirmation_text(op), &confirmation_buttons(op))
            .await
    }
}

pub fn confirmation_text(op: &PendingOperation) -> String {
    format!("🔔 需要确认\n\n{}\n\n是否执行？", op.description)
}

pub fn confirmation_buttons(op: &PendingOperation) -> Vec<Button> {
    vec![
        Button::new("✅ 确认", CallbackAction::confirm_data(&op.id)),
        Button::new("❌ 取消", CallbackAction::cancel_data(&op.id)),
    ]
}
