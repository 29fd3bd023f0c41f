//! 脚本可用的网络请求：仅 http/https，响应体上限，超时由沙箱剩余预算决定
//!
//! 超出上限的响应体被截断（truncated=true），不报错。

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use reqwest::{Client, Method};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::BotError;

const USER_AGENT: &str = "Teamwork-Bot/1.0";

/// fetch(url, options) 的 options
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct FetchOptions {
    /// GET（默认）/ POST / PUT / PATCH / DELETE / HEAD
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 字符串原样发送，其他值按 JSON 编码
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub body: Option<Value>,
}

/// 交给脚本的响应（prelude 再包装出 text() / json()）
#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub ok: bool,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub truncated: bool,
}

/// 共享 reqwest Client，按调用传入超时
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    max_bytes: usize,
}

impl Fetcher {
    pub fn new(max_bytes: usize) -> Result<Self, BotError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BotError::Config(format!("http client: {e}")))?;
        Ok(Self { client, max_bytes })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
        timeout: Duration,
    ) -> Result<FetchResponse, BotError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| BotError::Runtime(format!("invalid url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BotError::Runtime(format!(
                "unsupported url scheme: {}",
                parsed.scheme()
            )));
        }
        let method = match options.method.as_deref() {
            None | Some("") => Method::GET,
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| BotError::Runtime(format!("invalid http method: {m}")))?,
        };

        let mut req = self.client.request(method.clone(), parsed).timeout(timeout);
        for (k, v) in &options.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        match options.body {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => req = req.body(s),
            Some(other) => req = req.json(&other),
        }

        let mut resp = req
            .send()
            .await
            .map_err(|e| BotError::Runtime(format!("request failed: {e}")))?;

        let status = resp.status();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let mut buf: Vec<u8> = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| BotError::Runtime(format!("read body: {e}")))?
        {
            let room = self.max_bytes.saturating_sub(buf.len());
            if chunk.len() > room {
                buf.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        tracing::debug!(
            method = %method,
            url,
            status = status.as_u16(),
            bytes = buf.len(),
            truncated,
            "Script fetch completed"
        );

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            ok: status.is_success(),
            headers,
            body: String::from_utf8_lossy(&buf).into_owned(),
            truncated,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 本地单次 HTTP 服务，返回固定 body；返回 URL
    pub(crate) async fn serve_once(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut req = [0u8; 4096];
                let _ = sock.read(&mut req).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(body.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}/data")
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let url = serve_once(r#"{"n":1}"#.to_string()).await;
        let f = Fetcher::new(1024).unwrap();
        let resp = f
            .fetch(&url, FetchOptions::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.ok);
        assert_eq!(resp.body, r#"{"n":1}"#);
        assert!(!resp.truncated);
        assert_eq!(
            resp.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_fetch_truncates_body() {
        let url = serve_once("x".repeat(5000)).await;
        let f = Fetcher::new(100).unwrap();
        let resp = f
            .fetch(&url, FetchOptions::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.body.len(), 100);
        assert!(resp.truncated);
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http() {
        let f = Fetcher::new(100).unwrap();
        let err = f
            .fetch("file:///etc/passwd", FetchOptions::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Runtime(_)));
    }
}
