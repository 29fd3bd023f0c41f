//! Planner：调用 LLM 生成代码，并从回复中提取脚本
//!
//! 脚本来源（按优先级）：```javascript / ```js 代码块，或 JSON `{"code": "...", "timeout_seconds": N}`。
//! 两者都没有时，整段回复作为普通文本直接转发给用户。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::BotError;
use crate::llm::LlmClient;
use crate::memory::Message;

/// 模型一轮输出的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Script {
        code: String,
        timeout_secs: Option<u64>,
    },
    Reply(String),
}

#[derive(Deserialize)]
struct CodeEnvelope {
    code: String,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// 解析 LLM 输出：代码块优先，其次 JSON 信封，否则为普通回复
pub fn parse_generation(output: &str) -> Generation {
    let trimmed = output.trim();

    if let Some(code) = extract_fenced_script(trimmed) {
        if !code.trim().is_empty() {
            return Generation::Script {
                code: code.trim().to_string(),
                timeout_secs: None,
            };
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(env) = serde_json::from_str::<CodeEnvelope>(&trimmed[start..=end]) {
                if !env.code.trim().is_empty() {
                    return Generation::Script {
                        code: env.code.trim().to_string(),
                        timeout_secs: env.timeout_seconds,
                    };
                }
            }
        }
    }

    Generation::Reply(trimmed.to_string())
}

/// 提取第一个 ```javascript 或 ```js 代码块的内容
fn extract_fenced_script(text: &str) -> Option<&str> {
    let lower = text.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(rel) = lower[search_from..].find("```") {
        let fence = search_from + rel;
        let after = &lower[fence + 3..];
        let tag_len = if after.starts_with("javascript") {
            Some("javascript".len())
        } else if after.starts_with("js")
            && after[2..].starts_with(|c: char| c.is_whitespace())
        {
            Some(2)
        } else {
            None
        };
        match tag_len {
            Some(n) => {
                let body_start = fence + 3 + n;
                let rest = &text[body_start..];
                return Some(match rest.find("```") {
                    Some(end) => &rest[..end],
                    None => rest,
                });
            }
            None => search_from = fence + 3,
        }
    }
    None
}

/// 持有 LLM，拼接 system + 对话后调用
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn plan(&self, system: &str, messages: &[Message]) -> Result<String, BotError> {
        let mut full_messages = Vec::with_capacity(messages.len() + 1);
        full_messages.push(Message::system(system.to_string()));
        full_messages.extend_from_slice(messages);
        self.llm.complete(&full_messages).await.map_err(BotError::Llm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_javascript_fence() {
        let out = "好的：\n```javascript\nmessage('hi');\n```\n完成";
        assert_eq!(
            parse_generation(out),
            Generation::Script {
                code: "message('hi');".into(),
                timeout_secs: None
            }
        );
    }

    #[test]
    fn test_js_fence_not_json_fence() {
        let out = "```js\noutput(1)\n```";
        assert!(matches!(parse_generation(out), Generation::Script { .. }));
        let out = "```json\n{\"answer\": 1}\n```";
        assert!(matches!(parse_generation(out), Generation::Reply(_)));
    }

    #[test]
    fn test_json_envelope_with_timeout() {
        let out = r#"{"code": "message(1)", "timeout_seconds": 30}"#;
        assert_eq!(
            parse_generation(out),
            Generation::Script {
                code: "message(1)".into(),
                timeout_secs: Some(30)
            }
        );
    }

    #[test]
    fn test_plain_reply() {
        assert_eq!(
            parse_generation("  你好！有什么可以帮你？ "),
            Generation::Reply("你好！有什么可以帮你？".into())
        );
    }

    #[test]
    fn test_unterminated_fence_takes_rest() {
        let out = "```javascript\nmessage('x');";
        assert!(matches!(parse_generation(out), Generation::Script { ref code, .. } if code == "message('x');"));
    }
}
