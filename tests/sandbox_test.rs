//! 沙箱集成测试：隔离、超时、读取幂等、提案不落库、语法修复

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use teamwork::config::SandboxSection;
    use teamwork::core::BotError;
    use teamwork::operations::PendingRegistry;
    use teamwork::sandbox::{guard, Identity, Invocation, Sandbox};
    use teamwork::store::{SqliteStore, Store};

    fn setup() -> (Sandbox, Arc<SqliteStore>, PendingRegistry) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = PendingRegistry::in_memory(Duration::from_secs(3600));
        let sandbox = Sandbox::new(store.clone(), registry.clone(), SandboxSection::default()).unwrap();
        (sandbox, store, registry)
    }

    fn invocation(code: &str, user_id: i64) -> Invocation {
        Invocation {
            code: code.to_string(),
            prev_output: Vec::new(),
            timeout_secs: Some(5),
            identity: Identity {
                user_id,
                chat_id: user_id * 10,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_projects_message() {
        let (sandbox, _, _) = setup();
        let code = r#"
const projects = teamwork.listProjects();
if (projects.length === 0) {
  message("你还没有任何项目");
} else {
  message(`共 ${projects.length} 个项目`);
}
"#;
        let r = sandbox.execute(invocation(code, 1)).await.unwrap();
        assert_eq!(r.messages, vec!["你还没有任何项目"]);
        assert!(r.proposals.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_project_only_proposes() {
        let (sandbox, store, registry) = setup();
        let code = r#"
const p = teamwork.createProject("Website", "company site");
output(`${p.requiresConfirmation}|${p.type}|${p.operationID.startsWith("op_")}`);
"#;
        let r = sandbox.execute(invocation(code, 1)).await.unwrap();
        assert_eq!(r.output, vec!["true|create_project|true"]);
        assert_eq!(r.proposals.len(), 1);
        assert!(registry.contains(&r.proposals[0].id));
        assert!(store.list_projects(1, None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fault_does_not_leak_into_next_invocation() {
        let (sandbox, _, registry) = setup();
        let failing = r#"
globalThis.leaked = 1;
teamwork.createProject("Draft");
throw new Error("boom");
"#;
        let err = sandbox.execute(invocation(failing, 1)).await.unwrap_err();
        assert!(matches!(err, BotError::Runtime(_)));
        assert!(registry.is_empty());

        let r = sandbox
            .execute(invocation("output(typeof leaked)", 1))
            .await
            .unwrap();
        assert_eq!(r.output, vec!["undefined"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_infinite_loop_times_out() {
        let (sandbox, _, _) = setup();
        let mut inv = invocation("while (true) {}", 1);
        inv.timeout_secs = Some(2);
        let started = Instant::now();
        let err = sandbox.execute(inv).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BotError::Timeout(2)));
        assert!(elapsed >= Duration::from_millis(1900));
        assert!(elapsed < Duration::from_millis(3500), "took {elapsed:?}");

        let r = sandbox.execute(invocation("message('still alive')", 1)).await.unwrap();
        assert_eq!(r.messages, vec!["still alive"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reads_are_idempotent_and_scoped() {
        let (sandbox, store, _) = setup();
        store.create_project(1, "Alpha", "").await.unwrap();
        store.create_project(2, "Beta", "").await.unwrap();

        let code = "output(teamwork.listProjects().map(p => p.title))";
        let first = sandbox.execute(invocation(code, 1)).await.unwrap();
        let second = sandbox.execute(invocation(code, 1)).await.unwrap();
        assert_eq!(first.output, vec![r#"["Alpha"]"#]);
        assert_eq!(first.output, second.output);
        assert_eq!(store.list_projects(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_map_object_body_repaired_before_execution() {
        let (sandbox, _, _) = setup();
        let generated = "const rows = [1, 2].map(x => { id: x })\noutput(rows)";
        let report = guard::check(generated).unwrap();
        assert!(report.changed());
        let r = sandbox.execute(invocation(&report.code, 1)).await.unwrap();
        assert_eq!(r.output, vec![r#"[{"id":1},{"id":2}]"#]);
    }

    /// 本地 HTTP 服务：收到请求后延迟 hold 再响应
    async fn slow_server(hold: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(hold).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await;
            }
        });
        format!("http://{addr}/slow")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timed_out_worker_cannot_leave_proposals() {
        let (sandbox, store, registry) = setup();
        let url = slow_server(Duration::from_secs(5)).await;
        let code = format!(
            "try {{ fetch('{url}'); }} catch (e) {{}}\nteamwork.createProject('Leak');\nmessage('late');"
        );
        let mut inv = invocation(&code, 1);
        inv.timeout_secs = Some(1);

        let err = sandbox.execute(inv).await.unwrap_err();
        assert!(matches!(err, BotError::Timeout(1)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.is_empty());
        assert!(store.list_projects(1, None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_top_level_return_of_object_literal() {
        let (sandbox, _, _) = setup();
        let r = sandbox
            .execute(invocation("const n = 2;\nreturn { count: n };", 1))
            .await
            .unwrap();
        assert!(r.implicit_output);
        let value: serde_json::Value = serde_json::from_str(&r.output[0]).unwrap();
        assert_eq!(value, serde_json::json!({"count": 2}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_invocations_keep_their_own_journal() {
        let (sandbox, _, _) = setup();
        let mut handles = Vec::new();
        for user in 1..=4i64 {
            let sandbox = sandbox.clone();
            handles.push(tokio::spawn(async move {
                let code = format!("message('u{user}-a'); message('u{user}-b');");
                sandbox.execute(invocation(&code, user)).await
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            let r = h.await.unwrap().unwrap();
            let user = i + 1;
            assert_eq!(r.messages, vec![format!("u{user}-a"), format!("u{user}-b")]);
        }
    }
}
