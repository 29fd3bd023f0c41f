//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复；用完后回复一段只发一条提示消息的脚本。同时记录每次收到的消息，便于断言提示内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::Message;

const FALLBACK_REPLY: &str = "```javascript\nmessage('(mock) 没有更多预设回复');\n```";

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条预设回复
    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut r) = self.replies.lock() {
            r.push_back(reply.into());
        }
    }

    /// 每次 complete 收到的完整消息列表
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(messages.to_vec());
        }
        let reply = self
            .replies
            .lock()
            .map_err(|_| "mock reply queue poisoned".to_string())?
            .pop_front();
        Ok(reply.unwrap_or_else(|| FALLBACK_REPLY.to_string()))
    }
}
