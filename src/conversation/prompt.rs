//! System prompt：按优先级拼接的模块
//!
//! 角色 → 代码规则 → 能力参考（含参数 JSON Schema）→ 续写用法 → 当前项目。

use chrono::{DateTime, Utc};
use schemars::schema_for;

use crate::operations::{
    Button, ProjectUpdateOptions, TaskCreateOptions, TaskListFilter, TaskUpdateOptions,
};
use crate::sandbox::FetchOptions;
use crate::store::{Project, ProjectStatus, TaskPriority, TaskStatus, DEADLINE_FORMAT};

/// 一个 prompt 模块；priority 越小越靠前
#[derive(Debug, Clone)]
pub struct PromptSection {
    pub name: &'static str,
    pub priority: u8,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct SystemPrompt {
    sections: Vec<PromptSection>,
}

impl SystemPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_section(mut self, name: &'static str, priority: u8, content: impl Into<String>) -> Self {
        self.sections.push(PromptSection {
            name,
            priority,
            content: content.into(),
        });
        self
    }

    pub fn section_names(&self) -> Vec<&'static str> {
        let mut sections: Vec<_> = self.sections.iter().collect();
        sections.sort_by_key(|s| s.priority);
        sections.into_iter().map(|s| s.name).collect()
    }

    pub fn render(&self) -> String {
        let mut sections: Vec<_> = self.sections.iter().collect();
        sections.sort_by_key(|s| s.priority);
        sections
            .into_iter()
            .map(|s| s.content.trim().to_string())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

const ROLE: &str = r#"你是团队项目助手，通过 JavaScript 代码调用 teamwork API 帮用户管理项目和任务。"#;

const RULES: &str = r#"## 回复规则
- 需要查询或修改数据时，只输出一个 ```javascript 代码块，不要输出其他文字。
- 闲聊或无需数据的问题可以直接用文字回答。
- 用 message("...") 给用户发消息，每次调用是一条独立消息，按调用顺序送达。
- 修改类操作（创建 / 更新 / 删除 / 切换当前项目 / 带按钮消息）不会立即生效，会返回
  {requiresConfirmation: true, operationID, description, type}，由用户点击确认后执行。
- map() 返回对象时写成 `x => ({ ... })` 或在代码块中使用 return。
- 不要在顶层使用 return；最后一个表达式的值会作为输出。"#;

const CONTINUATION: &str = r#"## 两阶段处理（output / prev_output）
- output(value) 把数据交给下一轮：系统会带着这些数据再次请求你生成代码。
- 下一轮代码中可以通过 prev_output（字符串数组）读取上一轮的输出。
- 典型用法：先 fetch 并 output 原始数据，下一轮解析 prev_output[0] 后用 message 回复。

```javascript
if (prev_output.length > 0) {
  const data = JSON.parse(prev_output[0]);
  message(`共 ${data.length} 条`);
} else {
  output(fetch("https://example.com/api").text());
}
```"#;

fn enum_list<T: std::fmt::Display>(values: &[T]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" / ")
}

fn schema_json<T: schemars::JsonSchema>() -> String {
    serde_json::to_string(&schema_for!(T)).unwrap_or_default()
}

/// 能力参考：函数签名 + 参数 Schema
pub fn capability_reference() -> String {
    format!(
        r#"## 可用函数
读取（立即返回数据）：
- teamwork.listProjects(status?) → 项目数组；status: {project_status}
- teamwork.listTasks(filter?) → 任务数组；filter schema: {list_filter}
- teamwork.getCurrentProject() → {{current_project, has_current}}

修改（返回待确认提案）：
- teamwork.createProject(title, description?)
- teamwork.updateProject(project_id, changes)；changes schema: {project_update}
- teamwork.deleteProject(project_id)
- teamwork.createTask(title, options)；options schema: {task_create}
- teamwork.updateTask(task_id, changes)；changes schema: {task_update}
- teamwork.deleteTask(task_id)
- teamwork.setCurrentProject(project_id)
- teamwork.sendMessageWithButtons(message, buttons)；1 到 6 个按钮，每个按钮 schema: {button}

任务状态：{task_status}；优先级：{priority}；截止时间格式：{deadline}

工具：
- message(...args)：发送一条消息（多个参数以空格连接）
- output(value)：把数据交给下一轮
- debug(value)：把格式化后的值交给下一轮（带 DEBUG: 前缀）
- console.log(...)：只写入运行日志
- fetch(url, options?) → {{status, statusText, ok, headers, text(), json()}}，同步返回，响应体最多 1 MiB；options schema: {fetch}
- setTimeout(fn, ms)：主体代码结束时已到期的回调会执行一次，不会等待"#,
        project_status = enum_list(ProjectStatus::all()),
        list_filter = schema_json::<TaskListFilter>(),
        project_update = schema_json::<ProjectUpdateOptions>(),
        task_create = schema_json::<TaskCreateOptions>(),
        task_update = schema_json::<TaskUpdateOptions>(),
        button = schema_json::<Button>(),
        task_status = enum_list(TaskStatus::all()),
        priority = enum_list(TaskPriority::all()),
        deadline = "YYYY-MM-DD HH:MM",
        fetch = schema_json::<FetchOptions>(),
    )
}

fn current_project_section(project: &Project) -> String {
    format!(
        "## 当前项目\n- ID: {}\n- 名称: {}\n- 描述: {}\n- 状态: {}\n- 你的角色: {}\n\n创建任务时如果用户没有指定项目，默认使用这个项目。",
        project.id,
        project.title,
        if project.description.is_empty() { "（无）" } else { project.description.as_str() },
        project.status,
        project.user_role,
    )
}

/// 为一轮对话构建 system prompt
pub fn build_system_prompt(
    user_name: &str,
    current_project: Option<&Project>,
    now: DateTime<Utc>,
) -> String {
    let mut prompt = SystemPrompt::new()
        .with_section("role", 1, format!("{ROLE}\n用户：{user_name}"))
        .with_section("rules", 2, RULES)
        .with_section("capabilities", 3, capability_reference())
        .with_section("continuation", 4, CONTINUATION)
        .with_section(
            "clock",
            6,
            format!("当前时间（UTC）：{}", now.format(DEADLINE_FORMAT)),
        );
    if let Some(p) = current_project {
        prompt = prompt.with_section("current_project", 5, current_project_section(p));
    }
    prompt.render()
}

/// 续写轮次：把上一轮 output 交给模型
pub fn continuation_message(output: &[String], round: usize) -> String {
    let items = output
        .iter()
        .enumerate()
        .map(|(i, o)| format!("prev_output[{i}]:\n{o}"))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "第 {round} 轮代码的输出如下，代码中可以通过 prev_output 读取。\n\
         请根据这些数据生成下一段代码，用 message() 把结果告诉用户。\n\n{items}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProjectRole;

    #[test]
    fn test_sections_sorted_by_priority() {
        let p = SystemPrompt::new()
            .with_section("b", 2, "second")
            .with_section("a", 1, "first");
        assert_eq!(p.render(), "first\n\nsecond");
        assert_eq!(p.section_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_capability_reference_embeds_schemas() {
        let reference = capability_reference();
        assert!(reference.contains("teamwork.createTask"));
        assert!(reference.contains("\"project_id\""));
        assert!(reference.contains("in_progress"));
    }

    #[test]
    fn test_current_project_injected() {
        let now = Utc::now();
        let project = Project {
            id: 7,
            title: "Website".into(),
            description: String::new(),
            status: ProjectStatus::Active,
            created_at: now,
            updated_at: now,
            user_role: ProjectRole::Owner,
        };
        let with = build_system_prompt("alice", Some(&project), now);
        assert!(with.contains("## 当前项目"));
        assert!(with.contains("Website"));
        let without = build_system_prompt("alice", None, now);
        assert!(!without.contains("## 当前项目"));
    }

    #[test]
    fn test_continuation_message_lists_outputs() {
        let msg = continuation_message(&["a".into(), "b".into()], 1);
        assert!(msg.contains("prev_output[0]:\na"));
        assert!(msg.contains("prev_output[1]:\nb"));
    }
}
