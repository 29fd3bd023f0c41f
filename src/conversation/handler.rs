//! Assistant：消息入口与按钮回调入口
//!
//! 同一会话的消息与回调由每会话一把锁串行处理，不同会话之间互不阻塞。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::{BotError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, Role};
use crate::messaging::Messenger;
use crate::operations::{
    CallbackAction, Decision, OperationExecutor, OperationOutcome, PendingRegistry,
};
use crate::sandbox::{Identity, Sandbox};
use crate::store::Store;

use super::loop_::{ContinuationLoop, TurnReport};
use super::planner::Planner;
use super::prompt::build_system_prompt;

/// 来自聊天平台的一条文本消息
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: i64,
    pub chat_id: i64,
    pub user_name: String,
    pub text: String,
}

/// 按钮回调的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Executed(OperationOutcome),
    Cancelled,
    /// 操作不存在 / 已处理 / 无权限
    Rejected(String),
    /// 自定义按钮，只记入对话历史
    CustomButton(String),
    Ignored,
}

pub struct Assistant {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    registry: PendingRegistry,
    executor: OperationExecutor,
    turns: ContinuationLoop,
    recovery: RecoveryEngine,
    history_limit: usize,
    chat_locks: ChatLocks,
}

type ChatLocks = Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>;

fn lock_table(locks: &ChatLocks) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<tokio::sync::Mutex<()>>>> {
    match locks.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// 持有中的会话锁；释放时若已无等待者则把条目移出表
struct ChatTurn<'a> {
    locks: &'a ChatLocks,
    chat_id: i64,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ChatTurn<'_> {
    fn drop(&mut self) {
        let mut table = lock_table(self.locks);
        drop(self.guard.take());
        if table.get(&self.chat_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            table.remove(&self.chat_id);
        }
    }
}

impl Assistant {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self, BotError> {
        let registry = PendingRegistry::in_memory(Duration::from_secs(config.registry.ttl_secs));
        let sandbox = Sandbox::new(store.clone(), registry.clone(), config.sandbox.clone())?;
        let executor = OperationExecutor::new(store.clone(), messenger.clone());
        let turns = ContinuationLoop::new(Planner::new(llm), sandbox, messenger.clone());
        Ok(Self {
            store,
            messenger,
            registry,
            executor,
            turns,
            recovery: RecoveryEngine::new(),
            history_limit: config.app.history_limit,
            chat_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    /// 累计 token 使用（prompt, completion, total）
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.turns.planner().token_usage()
    }

    async fn enter_chat(&self, chat_id: i64) -> ChatTurn<'_> {
        let lock = lock_table(&self.chat_locks).entry(chat_id).or_default().clone();
        let guard = lock.lock_owned().await;
        ChatTurn {
            locks: &self.chat_locks,
            chat_id,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn active_chat_locks(&self) -> usize {
        lock_table(&self.chat_locks).len()
    }

    /// 处理一条用户消息；返回本轮报告，/start 时为 None
    pub async fn handle_message(&self, msg: IncomingMessage) -> Result<Option<TurnReport>, BotError> {
        let _turn = self.enter_chat(msg.chat_id).await;

        let turn_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("turn", %turn_id, user_id = msg.user_id, chat_id = msg.chat_id);
        self.run_turn(msg).instrument(span).await
    }

    async fn run_turn(&self, msg: IncomingMessage) -> Result<Option<TurnReport>, BotError> {
        let (user, created) = self.store.ensure_user(msg.user_id, &msg.user_name).await?;
        if created {
            tracing::info!(user_id = user.id, "New user registered");
        }

        if msg.text.trim() == "/start" {
            self.messenger
                .send_text(msg.chat_id, &welcome_text(&user.name))
                .await?;
            return Ok(None);
        }

        self.store
            .append_message(msg.user_id, msg.chat_id, Role::User.as_str(), &msg.text)
            .await?;
        let history = self
            .store
            .recent_messages(msg.chat_id, self.history_limit)
            .await?;
        let mut memory = ConversationMemory::from_history(&history, self.history_limit);

        let current = self.store.current_project(msg.user_id).await?;
        let system = build_system_prompt(&user.name, current.as_ref(), Utc::now());

        let identity = Identity {
            user_id: msg.user_id,
            chat_id: msg.chat_id,
        };
        let report = self.turns.run(&system, &mut memory, identity).await?;
        tracing::info!(
            outcome = ?report.outcome,
            rounds = report.state.round,
            repairs = report.state.repairs,
            "Turn finished"
        );

        if !report.relayed.is_empty() {
            self.store
                .append_message(
                    msg.user_id,
                    msg.chat_id,
                    Role::Assistant.as_str(),
                    &report.relayed.join("\n"),
                )
                .await?;
        }
        let pruned = self
            .store
            .prune_messages(msg.chat_id, self.history_limit)
            .await?;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned conversation history");
        }
        Ok(Some(report))
    }

    /// 处理按钮回调：confirm_<id> / cancel_<id> / custom_button_<action>
    pub async fn handle_callback(
        &self,
        user_id: i64,
        chat_id: i64,
        data: &str,
    ) -> Result<CallbackOutcome, BotError> {
        let _turn = self.enter_chat(chat_id).await;

        let (op_id, decision) = match CallbackAction::parse(data) {
            Some(CallbackAction::Confirm(id)) => (id, Decision::Confirm),
            Some(CallbackAction::Cancel(id)) => (id, Decision::Cancel),
            Some(CallbackAction::CustomButton(action)) => {
                tracing::info!(user_id, chat_id, action = %action, "Custom button pressed");
                self.store
                    .append_message(user_id, chat_id, Role::User.as_str(), &action)
                    .await?;
                return Ok(CallbackOutcome::CustomButton(action));
            }
            None => {
                tracing::warn!(user_id, chat_id, data, "Unrecognized callback data");
                return Ok(CallbackOutcome::Ignored);
            }
        };

        let resolution = match self
            .registry
            .resolve(&op_id, user_id, decision, &self.executor)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let text = match self.recovery.handle(&e) {
                    RecoveryAction::Abort(t) | RecoveryAction::NotifyUser(t) => t,
                    RecoveryAction::RetryWithPrompt(_) => {
                        "❌ 处理请求时发生内部错误，请稍后再试。".to_string()
                    }
                };
                self.messenger.send_text(chat_id, &text).await?;
                return Ok(CallbackOutcome::Rejected(text));
            }
        };

        let (text, outcome) = match resolution.outcome {
            Some(outcome) => (outcome.message.clone(), CallbackOutcome::Executed(outcome)),
            None => (
                format!("❌ 已取消：{}", resolution.operation.description),
                CallbackOutcome::Cancelled,
            ),
        };
        self.messenger.send_text(chat_id, &text).await?;
        self.store
            .append_message(user_id, chat_id, Role::Assistant.as_str(), &text)
            .await?;
        Ok(outcome)
    }
}

fn welcome_text(name: &str) -> String {
    format!(
        "👋 你好，{name}！我是团队项目助手。\n\n\
         你可以直接用自然语言让我：\n\
         • 查看或创建项目\n\
         • 添加、更新任务\n\
         • 切换当前项目\n\n\
         所有修改都会先请你确认再执行。"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::TurnOutcome;
    use crate::llm::MockLlmClient;
    use crate::messaging::RecordingMessenger;
    use crate::store::SqliteStore;

    fn assistant(replies: Vec<&str>) -> (Assistant, Arc<SqliteStore>, Arc<RecordingMessenger>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let messenger = Arc::new(RecordingMessenger::new());
        let llm = Arc::new(MockLlmClient::new(replies));
        let a = Assistant::new(&AppConfig::default(), store.clone(), llm, messenger.clone()).unwrap();
        (a, store, messenger)
    }

    fn incoming(text: &str) -> IncomingMessage {
        IncomingMessage {
            user_id: 1,
            chat_id: 100,
            user_name: "alice".into(),
            text: text.into(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_sends_welcome_without_turn() {
        let (a, store, messenger) = assistant(vec![]);
        let report = a.handle_message(incoming("/start")).await.unwrap();
        assert!(report.is_none());
        assert!(messenger.texts()[0].contains("alice"));
        assert!(store.recent_messages(100, 50).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_turn_saves_history() {
        let (a, store, _) = assistant(vec!["```javascript\nmessage('嗨');\n```"]);
        a.handle_message(incoming("你好")).await.unwrap();
        let history = store.recent_messages(100, 50).await.unwrap();
        let pairs: Vec<_> = history.iter().map(|h| (h.role.as_str(), h.content.as_str())).collect();
        assert_eq!(pairs, vec![("user", "你好"), ("assistant", "嗨")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_callback_removes_operation() {
        let (a, store, messenger) = assistant(vec!["```javascript\nteamwork.createProject('Docs');\n```"]);
        let report = a.handle_message(incoming("建个项目")).await.unwrap().unwrap();
        let op_id = match report.outcome {
            TurnOutcome::AwaitingConfirmation(ids) => ids[0].clone(),
            other => panic!("unexpected outcome {other:?}"),
        };
        messenger.clear();

        let outcome = a.handle_callback(1, 100, &format!("cancel_{op_id}")).await.unwrap();
        assert_eq!(outcome, CallbackOutcome::Cancelled);
        assert!(a.registry().is_empty());
        assert!(store.list_projects(1, None).await.unwrap().is_empty());
        assert!(messenger.texts()[0].starts_with("❌ 已取消"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_custom_button_saved_as_user_message() {
        let (a, store, messenger) = assistant(vec![]);
        let outcome = a.handle_callback(1, 100, "custom_button_show_tasks").await.unwrap();
        assert_eq!(outcome, CallbackOutcome::CustomButton("show_tasks".into()));
        assert!(messenger.sent().is_empty());
        let history = store.recent_messages(100, 50).await.unwrap();
        assert_eq!(history[0].content, "show_tasks");
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_chat_locks_released_after_use() {
        let (a, _, _) = assistant(vec!["```javascript\nmessage('ok');\n```"]);
        a.handle_message(incoming("你好")).await.unwrap();
        assert_eq!(a.active_chat_locks(), 0);

        for chat_id in 0..20 {
            a.handle_callback(1, chat_id, "cancel_op_missing").await.unwrap();
        }
        assert_eq!(a.active_chat_locks(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_waiting_turn_keeps_chat_lock() {
        let (a, _, _) = assistant(vec![]);
        let a = Arc::new(a);
        let held = a.enter_chat(100).await;

        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.handle_callback(1, 100, "noise").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(a.active_chat_locks(), 1);

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), CallbackOutcome::Ignored);
        assert_eq!(a.active_chat_locks(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_operation_rejected() {
        let (a, _, messenger) = assistant(vec![]);
        let outcome = a.handle_callback(1, 100, "confirm_op_missing").await.unwrap();
        assert!(matches!(outcome, CallbackOutcome::Rejected(_)));
        assert_eq!(messenger.texts().len(), 1);
    }
}
