//! 续写循环
//!
//! Plan -> Guard -> Execute -> 转发消息 / 续写下一轮 / 挂起待确认操作。
//! 状态显式保存在 TurnState 中；续写轮次受 max_hops 限制，修正轮次受 max_repairs 限制，两者互不占用。

use std::sync::Arc;

use crate::core::{BotError, RecoveryAction, RecoveryEngine};
use crate::memory::{ConversationMemory, Message};
use crate::messaging::Messenger;
use crate::sandbox::{guard, Identity, Invocation, Sandbox, ScriptResult};

use super::planner::{parse_generation, Generation, Planner};
use super::prompt::continuation_message;

/// 预算耗尽时转发给用户的输出最大字符数
const RELAY_MAX_CHARS: usize = 3500;
const TRUNCATED_SUFFIX: &str = "...[truncated]";

pub const NO_VISIBLE_RESULT: &str = "代码已运行，但没有产生可见结果。";
const REPAIR_EXHAUSTED: &str = "⚠️ 生成的代码多次未通过检查，请换个说法再试一次。";

/// 一轮对话的显式状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnState {
    /// 已完成的续写次数
    pub round: usize,
    /// 交给下一次执行的 prev_output
    pub continuation_input: Vec<String>,
    /// 已使用的修正次数
    pub repairs: usize,
}

/// 一轮对话如何结束
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// 模型直接回复了文本
    Replied,
    /// 脚本消息已转发
    Relayed,
    /// 有待确认的操作，等待用户回调
    AwaitingConfirmation(Vec<String>),
    /// 续写预算耗尽，剩余输出已截断转发
    HopBudgetExhausted,
    /// 没有任何可见结果，已发送诊断提示
    NoVisibleResult,
    /// 执行失败，已按恢复动作通知用户
    Failed,
}

/// 一轮对话的报告：发给用户的文本按发送顺序排列
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub relayed: Vec<String>,
    pub state: TurnState,
}

pub struct ContinuationLoop {
    planner: Planner,
    sandbox: Sandbox,
    messenger: Arc<dyn Messenger>,
    recovery: RecoveryEngine,
    max_hops: usize,
    max_repairs: usize,
}

impl ContinuationLoop {
    pub fn new(planner: Planner, sandbox: Sandbox, messenger: Arc<dyn Messenger>) -> Self {
        let max_hops = sandbox.limits().max_hops;
        let max_repairs = sandbox.limits().max_repairs;
        Self {
            planner,
            sandbox,
            messenger,
            recovery: RecoveryEngine::new(),
            max_hops,
            max_repairs,
        }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// 运行一轮对话；memory 中追加本轮的中间消息（生成的代码、续写输入、修正提示）
    pub async fn run(
        &self,
        system: &str,
        memory: &mut ConversationMemory,
        identity: Identity,
    ) -> Result<TurnReport, BotError> {
        let mut state = TurnState::default();
        let mut relayed = Vec::new();

        loop {
            let raw = match self.planner.plan(system, memory.messages()).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(chat_id = identity.chat_id, error = %e, "Planning failed");
                    let outcome = self.notify_failure(&e, identity, &mut relayed).await?;
                    return Ok(TurnReport { outcome, relayed, state });
                }
            };

            let (code, timeout_secs) = match parse_generation(&raw) {
                Generation::Reply(text) => {
                    memory.push(Message::assistant(text.clone()));
                    self.relay(identity.chat_id, &text, &mut relayed).await?;
                    return Ok(TurnReport {
                        outcome: TurnOutcome::Replied,
                        relayed,
                        state,
                    });
                }
                Generation::Script { code, timeout_secs } => (code, timeout_secs),
            };
            memory.push(Message::assistant(format!("```javascript\n{code}\n```")));

            let executed = match guard::check(&code) {
                Ok(report) => {
                    if report.changed() {
                        tracing::info!(fixes = ?report.fixes, "Syntax guard repaired generated code");
                    }
                    self.sandbox
                        .execute(Invocation {
                            code: report.code,
                            prev_output: state.continuation_input.clone(),
                            timeout_secs,
                            identity,
                        })
                        .await
                }
                Err(e) => Err(e),
            };

            let result = match executed {
                Ok(r) => r,
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::RetryWithPrompt(prompt) if state.repairs < self.max_repairs => {
                        state.repairs += 1;
                        tracing::info!(
                            chat_id = identity.chat_id,
                            repairs = state.repairs,
                            fault = e.kind().as_str(),
                            "Feeding corrective prompt back to the model"
                        );
                        memory.push(Message::user(prompt));
                        continue;
                    }
                    _ => {
                        let outcome = self.notify_failure(&e, identity, &mut relayed).await?;
                        return Ok(TurnReport { outcome, relayed, state });
                    }
                },
            };

            if !result.proposals.is_empty() {
                let mut ids = Vec::with_capacity(result.proposals.len());
                for op in &result.proposals {
                    self.messenger.request_confirmation(identity.chat_id, op).await?;
                    relayed.push(op.description.clone());
                    ids.push(op.id.clone());
                }
                return Ok(TurnReport {
                    outcome: TurnOutcome::AwaitingConfirmation(ids),
                    relayed,
                    state,
                });
            }

            for m in &result.messages {
                self.relay(identity.chat_id, m, &mut relayed).await?;
            }

            if let Some(output) = result.continuation() {
                if state.round < self.max_hops {
                    state.round += 1;
                    state.continuation_input = output.to_vec();
                    memory.push(Message::user(continuation_message(output, state.round)));
                    tracing::debug!(chat_id = identity.chat_id, round = state.round, "Continuing with script output");
                    continue;
                }
                tracing::info!(chat_id = identity.chat_id, hops = state.round, "Continuation budget exhausted");
                if !result.implicit_output {
                    let text = truncate_chars(&output.join("\n"), RELAY_MAX_CHARS);
                    self.relay(identity.chat_id, &text, &mut relayed).await?;
                }
                if relayed.is_empty() {
                    self.relay(identity.chat_id, NO_VISIBLE_RESULT, &mut relayed).await?;
                }
                return Ok(TurnReport {
                    outcome: TurnOutcome::HopBudgetExhausted,
                    relayed,
                    state,
                });
            }

            let outcome = if no_visible_result(&result, &relayed) {
                self.relay(identity.chat_id, NO_VISIBLE_RESULT, &mut relayed).await?;
                TurnOutcome::NoVisibleResult
            } else {
                TurnOutcome::Relayed
            };
            return Ok(TurnReport { outcome, relayed, state });
        }
    }

    async fn relay(&self, chat_id: i64, text: &str, relayed: &mut Vec<String>) -> Result<(), BotError> {
        self.messenger.send_text(chat_id, text).await?;
        relayed.push(text.to_string());
        Ok(())
    }

    /// 按恢复动作给用户发送简短提示；详细错误只进日志
    async fn notify_failure(
        &self,
        err: &BotError,
        identity: Identity,
        relayed: &mut Vec<String>,
    ) -> Result<TurnOutcome, BotError> {
        tracing::warn!(
            user_id = identity.user_id,
            chat_id = identity.chat_id,
            fault = err.kind().as_str(),
            error = %err,
            "Turn ended with a fault"
        );
        let text = match self.recovery.handle(err) {
            RecoveryAction::RetryWithPrompt(_) => REPAIR_EXHAUSTED.to_string(),
            RecoveryAction::NotifyUser(t) | RecoveryAction::Abort(t) => t,
        };
        self.relay(identity.chat_id, &text, relayed).await?;
        Ok(TurnOutcome::Failed)
    }
}

fn no_visible_result(result: &ScriptResult, relayed: &[String]) -> bool {
    result.messages.is_empty() && relayed.is_empty()
}

/// 按字符截断，超出时追加截断标记
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str(TRUNCATED_SUFFIX);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::SandboxSection;
    use crate::llm::MockLlmClient;
    use crate::messaging::RecordingMessenger;
    use crate::operations::PendingRegistry;
    use crate::store::SqliteStore;

    fn build(replies: Vec<&str>) -> (ContinuationLoop, Arc<MockLlmClient>, Arc<RecordingMessenger>) {
        let llm = Arc::new(MockLlmClient::new(replies));
        let messenger = Arc::new(RecordingMessenger::default());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = PendingRegistry::in_memory(Duration::from_secs(60));
        let sandbox = Sandbox::new(store, registry, SandboxSection::default()).unwrap();
        let lp = ContinuationLoop::new(Planner::new(llm.clone()), sandbox, messenger.clone());
        (lp, llm, messenger)
    }

    fn identity() -> Identity {
        Identity {
            user_id: 1,
            chat_id: 10,
        }
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("你好世界", 2), "你好...[truncated]");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_plain_reply_relayed() {
        let (lp, _, messenger) = build(vec!["你好！"]);
        let mut mem = ConversationMemory::new(50);
        mem.push(Message::user("hi"));
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Replied);
        assert_eq!(messenger.texts(), vec!["你好！"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_continuation_hop_feeds_prev_output() {
        let (lp, llm, messenger) = build(vec![
            "```javascript\noutput('42');\n```",
            "```javascript\nmessage('答案是 ' + prev_output[0]);\n```",
        ]);
        let mut mem = ConversationMemory::new(50);
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Relayed);
        assert_eq!(report.state.round, 1);
        assert_eq!(messenger.texts(), vec!["答案是 42"]);
        let second = &llm.requests()[1];
        assert!(second.last().unwrap().content.contains("prev_output[0]:\n42"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hop_budget_relays_truncated_output() {
        let big = "x".repeat(5000);
        let script = format!("```javascript\noutput('{big}');\n```");
        let (lp, llm, messenger) = build(vec![&script, &script, &script, &script]);
        let mut mem = ConversationMemory::new(50);
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::HopBudgetExhausted);
        assert_eq!(llm.call_count(), 3);
        let texts = messenger.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].ends_with("...[truncated]"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_syntax_repair_then_success() {
        let (lp, llm, messenger) = build(vec![
            "```javascript\nconst rows = [1].map(x => {\n  id: x,\n  name: 'n'\n});\n```",
            "```javascript\nmessage('fixed');\n```",
        ]);
        let mut mem = ConversationMemory::new(50);
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        assert_eq!(report.state.repairs, 1);
        assert_eq!(report.state.round, 0);
        assert_eq!(messenger.texts(), vec!["fixed"]);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repair_budget_exhausted_notifies_user() {
        let (lp, _, messenger) = build(vec![
            "```javascript\nteamwork.createProject(42);\n```",
            "```javascript\nteamwork.createProject();\n```",
        ]);
        let mut mem = ConversationMemory::new(50);
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Failed);
        assert_eq!(messenger.texts(), vec![REPAIR_EXHAUSTED]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runtime_error_hides_details() {
        let (lp, _, messenger) = build(vec!["```javascript\nundefinedFn();\n```"]);
        let mut mem = ConversationMemory::new(50);
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Failed);
        let texts = messenger.texts();
        assert_eq!(texts.len(), 1);
        assert!(!texts[0].contains("ReferenceError"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_visible_result_diagnostic() {
        let (lp, _, messenger) = build(vec!["```javascript\nlet x = 1;\n```"]);
        let mut mem = ConversationMemory::new(50);
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::NoVisibleResult);
        assert_eq!(messenger.texts(), vec![NO_VISIBLE_RESULT]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_proposal_stops_turn() {
        let (lp, llm, messenger) = build(vec![
            "```javascript\nmessage('准备创建');\nteamwork.createProject('Website');\n```",
        ]);
        let mut mem = ConversationMemory::new(50);
        let report = lp.run("sys", &mut mem, identity()).await.unwrap();
        let ids = match report.outcome {
            TurnOutcome::AwaitingConfirmation(ids) => ids,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(ids.len(), 1);
        assert!(lp.sandbox().registry().contains(&ids[0]));
        assert_eq!(llm.call_count(), 1);
        let sent = messenger.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].buttons.len(), 2);
        assert!(sent[0].text.contains("Website"));
    }
}
