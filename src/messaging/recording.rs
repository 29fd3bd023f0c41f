//! 记录所有发出的消息（测试用）

use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::BotError;
use crate::messaging::Messenger;
use crate::operations::Button;

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub buttons: Vec<Button>,
}

#[derive(Debug, Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// 按发送顺序返回文本
    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.text).collect()
    }

    pub fn texts_for(&self, chat_id: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| m.text)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut s) = self.sent.lock() {
            s.clear();
        }
    }

    fn push(&self, msg: SentMessage) -> Result<(), BotError> {
        self.sent
            .lock()
            .map_err(|_| BotError::Messaging("recorder lock poisoned".to_string()))?
            .push(msg);
        Ok(())
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        self.push(SentMessage {
            chat_id,
            text: text.to_string(),
            buttons: Vec::new(),
        })
    }

    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[Button],
    ) -> Result<(), BotError> {
        self.push(SentMessage {
            chat_id,
            text: text.to_string(),
            buttons: buttons.to_vec(),
        })
    }
}
