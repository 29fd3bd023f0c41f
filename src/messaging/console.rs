//! 控制台消息输出：打印到 stdout，按钮按每行两个排列

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::BotError;
use crate::messaging::{confirmation_buttons, confirmation_text, Messenger};
use crate::operations::{Button, PendingOperation};

/// 控制台 Messenger；记住最近一次确认请求，供 /yes /no 使用
#[derive(Debug, Default)]
pub struct ConsoleMessenger {
    last_confirmation: Mutex<Option<String>>,
}

impl ConsoleMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出最近一次等待确认的操作 id
    pub fn take_last_confirmation(&self) -> Option<String> {
        self.last_confirmation.lock().ok().and_then(|mut g| g.take())
    }

    fn write(&self, text: &str) -> Result<(), BotError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{text}").map_err(|e| BotError::Messaging(e.to_string()))?;
        out.flush().map_err(|e| BotError::Messaging(e.to_string()))
    }
}

fn render_buttons(buttons: &[Button]) -> String {
    buttons
        .chunks(2)
        .map(|row| {
            row.iter()
                .map(|b| format!("[{}] ({})", b.text, b.action))
                .collect::<Vec<_>>()
                .join("  ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Messenger for ConsoleMessenger {
    async fn send_text(&self, _chat_id: i64, text: &str) -> Result<(), BotError> {
        self.write(&format!("🤖 {text}\n"))
    }

    async fn send_with_buttons(
        &self,
        _chat_id: i64,
        text: &str,
        buttons: &[Button],
    ) -> Result<(), BotError> {
        self.write(&format!("🤖 {text}\n{}\n", render_buttons(buttons)))
    }

    async fn request_confirmation(
        &self,
        chat_id: i64,
        op: &PendingOperation,
    ) -> Result<(), BotError> {
        if let Ok(mut last) = self.last_confirmation.lock() {
            *last = Some(op.id.clone());
        }
        let text = format!("{}\n（输入 /yes 确认，/no 取消）", confirmation_text(op));
        self.send_with_buttons(chat_id, &text, &confirmation_buttons(op))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buttons_two_per_row() {
        let buttons = vec![
            Button::new("A", "a"),
            Button::new("B", "b"),
            Button::new("C", "c"),
        ];
        let rendered = render_buttons(&buttons);
        assert_eq!(rendered.lines().count(), 2);
        assert!(rendered.starts_with("[A] (a)  [B] (b)"));
    }
}
