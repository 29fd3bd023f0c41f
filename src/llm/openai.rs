//! OpenAI 兼容的 chat completion 客户端
//!
//! 模型名、采样温度和回复长度上限来自 [llm] 配置段；base_url 可指向任意兼容端点。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::core::BotError;
use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// 累计 token 计数，克隆后共享同一组计数器
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    counters: Arc<[AtomicU64; 2]>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.counters[0].fetch_add(prompt, Ordering::Relaxed);
        self.counters[1].fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.counters[0].load(Ordering::Relaxed);
        let completion = self.counters[1].load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn from_config(cfg: &LlmSection) -> Self {
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("No LLM api key configured; requests will likely be rejected");
        }

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = &cfg.base_url {
            config = config.with_api_base(url);
        }

        Self {
            client: Client::with_config(config),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            usage: TokenUsage::new(),
        }
    }

    fn build_request(&self, messages: &[Message]) -> Result<CreateChatCompletionRequest, BotError> {
        let messages = messages
            .iter()
            .map(convert_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages);
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        if let Some(n) = self.max_tokens {
            args.max_completion_tokens(n);
        }
        args.build()
            .map_err(|e| BotError::Llm(format!("invalid completion request: {e}")))
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, BotError> {
        let request = self.build_request(messages)?;
        let started = Instant::now();
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| BotError::Llm(format!("{} request failed: {e}", self.model)))?;

        if let Some(u) = &response.usage {
            self.usage.add(u64::from(u.prompt_tokens), u64::from(u.completion_tokens));
            tracing::debug!(
                model = %self.model,
                prompt_tokens = u.prompt_tokens,
                completion_tokens = u.completion_tokens,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Completion received"
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| BotError::Llm(format!("{} returned an empty completion", self.model)))
    }
}

fn convert_message(m: &Message) -> Result<ChatCompletionRequestMessage, BotError> {
    let text = m.content.clone();
    let built = match m.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(text)
            .build()
            .map(ChatCompletionRequestMessage::System),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()
            .map(ChatCompletionRequestMessage::User),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(text)
            .build()
            .map(ChatCompletionRequestMessage::Assistant),
    };
    built.map_err(|e| BotError::Llm(format!("invalid {:?} message: {e}", m.role)))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.chat(messages).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section() -> LlmSection {
        LlmSection {
            model: "deepseek-chat".into(),
            base_url: Some("http://127.0.0.1:9/v1".into()),
            api_key: Some("sk-test".into()),
            temperature: Some(0.2),
            max_tokens: Some(1024),
            ..LlmSection::default()
        }
    }

    fn conversation() -> Vec<Message> {
        vec![
            Message { role: Role::System, content: "你是助手".into() },
            Message { role: Role::User, content: "列出项目".into() },
            Message { role: Role::Assistant, content: "```javascript\nteamwork.listProjects()\n```".into() },
        ]
    }

    #[test]
    fn test_request_carries_configured_sampling() {
        let client = OpenAiClient::from_config(&section());
        let request = client.build_request(&conversation()).unwrap();
        assert_eq!(request.model, "deepseek-chat");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_completion_tokens, Some(1024));
        assert_eq!(request.messages.len(), 3);
        assert!(matches!(request.messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(request.messages[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn test_unset_limits_left_to_server() {
        let cfg = LlmSection {
            temperature: None,
            max_tokens: None,
            ..section()
        };
        let request = OpenAiClient::from_config(&cfg).build_request(&conversation()).unwrap();
        assert_eq!(request.temperature, None);
        assert_eq!(request.max_completion_tokens, None);
    }

    #[test]
    fn test_usage_shared_between_clones() {
        let usage = TokenUsage::new();
        let shared = usage.clone();
        usage.add(10, 4);
        shared.add(1, 1);
        assert_eq!(usage.get(), (11, 5, 16));
    }
}
