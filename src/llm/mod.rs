//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use crate::config::LlmSection;

/// 按 [llm].provider 创建客户端：openai（默认）/ mock
pub fn create_client(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    match cfg.provider.as_str() {
        "mock" => Arc::new(MockLlmClient::default()),
        other => {
            if other != "openai" {
                tracing::warn!(provider = other, "Unknown LLM provider, using OpenAI-compatible client");
            }
            Arc::new(OpenAiClient::from_config(cfg))
        }
    }
}
