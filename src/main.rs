//! Teamwork 控制台入口
//!
//! 从 stdin 逐行读取消息交给 Assistant；/yes、/no 确认或取消最近一次待确认操作，
//! /btn <action> 模拟点击自定义按钮，/quit 退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use teamwork::{
    config::load_config,
    llm::create_client,
    messaging::ConsoleMessenger,
    observability,
    operations::CallbackAction,
    store::SqliteStore,
    Assistant, IncomingMessage,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_USER_ID: i64 = 1;
const CONSOLE_CHAT_ID: i64 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let store = Arc::new(
        SqliteStore::open(&cfg.storage.sqlite_path)
            .with_context(|| format!("Failed to open {}", cfg.storage.sqlite_path.display()))?,
    );
    let llm = create_client(&cfg.llm);
    let messenger = Arc::new(ConsoleMessenger::new());
    let assistant = Assistant::new(&cfg, store, llm, messenger.clone())
        .context("Failed to create assistant")?;

    let user_name = std::env::var("USER").unwrap_or_else(|_| "console".to_string());
    tracing::info!(model = %cfg.llm.model, "Teamwork console started");
    println!("输入消息开始对话（/yes 确认，/no 取消，/quit 退出）");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        let callback = match text {
            "/yes" | "/no" => match messenger.take_last_confirmation() {
                Some(id) if text == "/yes" => Some(CallbackAction::confirm_data(&id)),
                Some(id) => Some(CallbackAction::cancel_data(&id)),
                None => {
                    println!("当前没有等待确认的操作");
                    continue;
                }
            },
            _ => text
                .strip_prefix("/btn ")
                .map(|action| CallbackAction::custom_data(action.trim())),
        };

        let result = match callback {
            Some(data) => assistant
                .handle_callback(CONSOLE_USER_ID, CONSOLE_CHAT_ID, &data)
                .await
                .map(|_| ()),
            None => assistant
                .handle_message(IncomingMessage {
                    user_id: CONSOLE_USER_ID,
                    chat_id: CONSOLE_CHAT_ID,
                    user_name: user_name.clone(),
                    text: text.to_string(),
                })
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to handle input");
            println!("❌ 处理失败，请稍后再试");
        }
    }

    let (prompt, completion, total) = assistant.token_usage();
    tracing::info!(prompt, completion, total, "Token usage");
    Ok(())
}
