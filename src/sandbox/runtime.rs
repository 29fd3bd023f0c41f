//! 脚本执行：每次调用新建 QuickJS Runtime + Context，在阻塞线程上运行
//!
//! 调用方用 tokio::time::timeout 等待；解释器同时带有中断回调（截止时间 + 取消令牌），
//! 超时后 worker 会在下一次中断检查时停下。内存与栈大小有上限。

use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, CaughtError, Context, Runtime, Value};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxSection;
use crate::core::BotError;
use crate::operations::{PendingOperation, PendingRegistry};
use crate::sandbox::bindings;
use crate::sandbox::fetch::Fetcher;
use crate::sandbox::guard;
use crate::sandbox::host::{HostApi, Identity, Journal};
use crate::store::Store;

/// 一次脚本调用的输入
#[derive(Debug, Clone)]
pub struct Invocation {
    pub code: String,
    /// 上一轮的续写输出（脚本中的 prev_output）
    pub prev_output: Vec<String>,
    /// 模型请求的超时秒数；None 使用默认值，越界时截断
    pub timeout_secs: Option<u64>,
    pub identity: Identity,
}

/// 成功执行的结果
#[derive(Debug, Clone, Default)]
pub struct ScriptResult {
    pub messages: Vec<String>,
    pub output: Vec<String>,
    pub proposals: Vec<PendingOperation>,
    /// output 来自最终表达式的值（脚本没有调用 message / output）
    pub implicit_output: bool,
}

impl ScriptResult {
    /// 隐式输出为 undefined / null，即没有任何可用结果
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.proposals.is_empty()
            && (self.output.is_empty()
                || (self.implicit_output
                    && self
                        .output
                        .iter()
                        .all(|o| matches!(o.trim(), "undefined" | "null"))))
    }

    /// 需要交给下一轮的续写数据
    pub fn continuation(&self) -> Option<&[String]> {
        if self.output.is_empty() || self.is_empty() {
            None
        } else {
            Some(&self.output)
        }
    }
}

/// 沙箱：持有协作方与限制，按调用创建 HostApi 与解释器
#[derive(Clone)]
pub struct Sandbox {
    store: Arc<dyn Store>,
    registry: PendingRegistry,
    fetcher: Fetcher,
    limits: SandboxSection,
}

impl Sandbox {
    pub fn new(
        store: Arc<dyn Store>,
        registry: PendingRegistry,
        limits: SandboxSection,
    ) -> Result<Self, BotError> {
        let fetcher = Fetcher::new(limits.fetch_max_bytes)?;
        Ok(Self {
            store,
            registry,
            fetcher,
            limits,
        })
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &SandboxSection {
        &self.limits
    }

    /// 执行一段脚本；失败时撤回本次登记的所有提案
    pub async fn execute(&self, inv: Invocation) -> Result<ScriptResult, BotError> {
        let timeout = self.limits.clamp_timeout(inv.timeout_secs);
        let started = Instant::now();
        let deadline = started + timeout;
        let cancel = CancellationToken::new();
        let host = Arc::new(HostApi::new(
            inv.identity,
            self.store.clone(),
            self.registry.clone(),
            self.fetcher.clone(),
            Handle::current(),
            deadline,
        ));

        let code = guard::strip_top_level_return(&inv.code);
        let worker = {
            let host = host.clone();
            let cancel = cancel.clone();
            let prev_output = inv.prev_output.clone();
            let limits = WorkerLimits {
                memory_limit_bytes: self.limits.memory_limit_bytes,
                max_stack_bytes: self.limits.max_stack_bytes,
                deadline,
                timeout,
            };
            tokio::task::spawn_blocking(move || run_script(&code, &prev_output, host, limits, cancel))
        };

        let outcome = match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(r)) => r,
            Ok(Err(join_err)) => Err(BotError::Runtime(format!("sandbox worker failed: {join_err}"))),
            Err(_) => {
                cancel.cancel();
                Err(BotError::Timeout(timeout.as_secs()))
            }
        };

        let journal = host.close();
        let result = self.assemble(outcome, journal);
        audit(&inv, started.elapsed(), &result);
        result
    }

    fn assemble(
        &self,
        outcome: Result<Option<String>, BotError>,
        journal: Journal,
    ) -> Result<ScriptResult, BotError> {
        match outcome {
            Ok(final_value) => {
                let mut result = ScriptResult {
                    messages: journal.messages,
                    output: journal.output,
                    proposals: journal.proposals,
                    implicit_output: false,
                };
                if result.messages.is_empty() && result.output.is_empty() {
                    result.output.push(final_value.unwrap_or_else(|| "undefined".to_string()));
                    result.implicit_output = true;
                }
                Ok(result)
            }
            Err(err) => {
                let ids: Vec<String> = journal.proposals.iter().map(|p| p.id.clone()).collect();
                self.registry.discard(&ids);
                // 校验失败被脚本自身吞掉时仍算运行时错误
                match (err, journal.validation_fault) {
                    (BotError::Runtime(_), Some(detail)) => Err(BotError::Validation(detail)),
                    (err, _) => Err(err),
                }
            }
        }
    }
}

struct WorkerLimits {
    memory_limit_bytes: usize,
    max_stack_bytes: usize,
    deadline: Instant,
    timeout: Duration,
}

/// 在阻塞线程上运行；返回最终表达式值的缩进 JSON
fn run_script(
    code: &str,
    prev_output: &[String],
    host: Arc<HostApi>,
    limits: WorkerLimits,
    cancel: CancellationToken,
) -> Result<Option<String>, BotError> {
    let rt = Runtime::new().map_err(|e| BotError::Runtime(format!("create runtime: {e}")))?;
    rt.set_memory_limit(limits.memory_limit_bytes);
    rt.set_max_stack_size(limits.max_stack_bytes);
    let deadline = limits.deadline;
    let token = cancel.clone();
    rt.set_interrupt_handler(Some(Box::new(move || {
        Instant::now() >= deadline || token.is_cancelled()
    })));
    let ctx = Context::full(&rt).map_err(|e| BotError::Runtime(format!("create context: {e}")))?;

    ctx.with(|ctx| {
        bindings::install(&ctx, host, prev_output)
            .map_err(|e| BotError::Runtime(format!("install capabilities: {e}")))?;

        let value: Value = match ctx.eval::<Value, _>(code).catch(&ctx) {
            Ok(v) => v,
            Err(caught) => {
                if cancel.is_cancelled() || Instant::now() >= deadline {
                    return Err(BotError::Timeout(limits.timeout.as_secs()));
                }
                return Err(classify(caught));
            }
        };

        let rendered = bindings::to_script_arg(&ctx, &value)
            .map(|v| v.render_pretty())
            .unwrap_or_else(|_| "undefined".to_string());
        bindings::run_due_timers(&ctx);
        Ok(Some(rendered))
    })
}

/// 解释器异常归类：SyntaxError 交给模型修正，其余为运行时错误
fn classify(caught: CaughtError<'_>) -> BotError {
    match &caught {
        CaughtError::Exception(ex) => {
            let name: Option<String> = ex.get("name").ok();
            let message = ex.message().unwrap_or_default();
            let detail = match ex.stack() {
                Some(stack) if !stack.is_empty() => format!("{message}\n{stack}"),
                _ => message.clone(),
            };
            if name.as_deref() == Some("SyntaxError") {
                BotError::Syntax(message)
            } else {
                BotError::Runtime(detail)
            }
        }
        _ => BotError::Runtime(caught.to_string()),
    }
}

fn audit(inv: &Invocation, elapsed: Duration, result: &Result<ScriptResult, BotError>) {
    let (ok, outcome) = match result {
        Ok(_) => (true, "ok"),
        Err(e) => (false, e.kind().as_str()),
    };
    let (messages, output, proposals) = match result {
        Ok(r) => (r.messages.len(), r.output.len(), r.proposals.len()),
        Err(_) => (0, 0, 0),
    };
    let audit = serde_json::json!({
        "event": "script_audit",
        "user_id": inv.identity.user_id,
        "chat_id": inv.identity.chat_id,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "messages": messages,
        "output": output,
        "proposals": proposals,
        "code_preview": code_preview(&inv.code),
    });
    tracing::info!(audit = %audit.to_string(), "script");
    if let Err(e) = result {
        tracing::warn!(user_id = inv.identity.user_id, error = %e, "Script invocation failed");
    }
}

fn code_preview(code: &str) -> String {
    const MAX: usize = 200;
    let flat = code.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > MAX {
        format!("{}...", flat.chars().take(MAX).collect::<String>())
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn sandbox() -> Sandbox {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = PendingRegistry::in_memory(Duration::from_secs(60));
        Sandbox::new(store, registry, SandboxSection::default()).unwrap()
    }

    fn inv(code: &str) -> Invocation {
        Invocation {
            code: code.to_string(),
            prev_output: Vec::new(),
            timeout_secs: Some(5),
            identity: Identity {
                user_id: 1,
                chat_id: 1,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_messages_in_order() {
        let r = sandbox()
            .execute(inv("message('a'); message('b', 2); message({x: 1});"))
            .await
            .unwrap();
        assert_eq!(r.messages, vec!["a", "b 2", r#"{"x":1}"#]);
        assert!(r.output.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_implicit_output_from_final_value() {
        let r = sandbox().execute(inv("const a = [1, 2]; a.length")).await.unwrap();
        assert!(r.implicit_output);
        assert_eq!(r.output, vec!["2"]);
        assert!(!r.is_empty());

        let r = sandbox().execute(inv("let x = 1;")).await.unwrap();
        assert_eq!(r.output, vec!["undefined"]);
        assert!(r.is_empty());
        assert!(r.continuation().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prev_output_visible() {
        let mut i = inv("output(prev_output.length + ':' + inputData)");
        i.prev_output = vec!["first".into(), "second".into()];
        let r = sandbox().execute(i).await.unwrap();
        assert_eq!(r.output, vec!["2:first"]);
        assert!(!r.implicit_output);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_top_level_return() {
        let r = sandbox().execute(inv("const n = 3;\nreturn n * 2;")).await.unwrap();
        assert_eq!(r.output, vec!["6"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runtime_error_is_structured() {
        let err = sandbox().execute(inv("null.foo")).await.unwrap_err();
        assert!(matches!(err, BotError::Runtime(_)));
        let err = sandbox().execute(inv("let = ;")).await.unwrap_err();
        assert!(matches!(err, BotError::Syntax(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_invocation_discards_proposals() {
        let sb = sandbox();
        let err = sb
            .execute(inv("teamwork.createProject('A'); throw new Error('boom');"))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Runtime(_)));
        assert!(sb.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validation_fault_surfaces() {
        let err = sandbox()
            .execute(inv("teamwork.deleteTask('abc');"))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_infinite_loop_times_out() {
        let mut i = inv("while (true) {}");
        i.timeout_secs = Some(1);
        let start = Instant::now();
        let err = sandbox().execute(i).await.unwrap_err();
        assert!(matches!(err, BotError::Timeout(1)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_due_timers_run_after_body() {
        let r = sandbox()
            .execute(inv(
                "setTimeout(() => message('later'), 0); setTimeout(() => message('never'), 60000); message('now');",
            ))
            .await
            .unwrap();
        assert_eq!(r.messages, vec!["now", "later"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_ambient_host_access() {
        let r = sandbox()
            .execute(inv("typeof require + ',' + typeof process + ',' + typeof std"))
            .await
            .unwrap();
        assert_eq!(r.output, vec![r#""undefined,undefined,undefined""#]);
    }

    #[test]
    fn test_code_preview_truncates() {
        let long = "x".repeat(500);
        assert!(code_preview(&long).ends_with("..."));
        assert_eq!(code_preview("a\n  b"), "a b");
    }
}
