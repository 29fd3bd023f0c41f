//! 待确认操作的类型：操作种类、参数、提案、确认结果

use chrono::{DateTime, NaiveDateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{ProjectStatus, TaskPriority, TaskStatus, DEADLINE_FORMAT};

/// 操作种类（序列化为 snake_case，也是提案中的 `type` 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateProject,
    UpdateProject,
    DeleteProject,
    CreateTask,
    UpdateTask,
    DeleteTask,
    SetCurrentProject,
    SendMessageWithButtons,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateProject => "create_project",
            OperationKind::UpdateProject => "update_project",
            OperationKind::DeleteProject => "delete_project",
            OperationKind::CreateTask => "create_task",
            OperationKind::UpdateTask => "update_task",
            OperationKind::DeleteTask => "delete_task",
            OperationKind::SetCurrentProject => "set_current_project",
            OperationKind::SendMessageWithButtons => "send_message_with_buttons",
        }
    }
}

/// 交互按钮：显示文本 + 回调动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Button {
    /// 按钮上显示的文字
    pub text: String,
    /// 点击后回传的动作标识
    pub action: String,
}

impl Button {
    pub fn new(text: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: action.into(),
        }
    }
}

/// updateProject 的可选字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectUpdateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// planning / active / paused / completed / cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub status: Option<ProjectStatus>,
}

/// createTask 的选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskCreateOptions {
    pub project_id: i64,
    #[serde(default)]
    pub description: String,
    /// low / medium / high / urgent，缺省 medium
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub priority: TaskPriority,
    /// 格式 `YYYY-MM-DD HH:MM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub deadline: Option<NaiveDateTime>,
}

/// updateTask 的可选字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskUpdateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// todo / in_progress / review / done / cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub deadline: Option<NaiveDateTime>,
}

/// listTasks 的过滤条件（project_id 优先于 status）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// 已校验的操作请求；参数按种类强类型保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum OperationRequest {
    CreateProject {
        title: String,
        description: String,
    },
    UpdateProject {
        project_id: i64,
        #[serde(flatten)]
        changes: ProjectUpdateOptions,
    },
    DeleteProject {
        project_id: i64,
    },
    CreateTask {
        title: String,
        #[serde(flatten)]
        options: TaskCreateOptions,
    },
    UpdateTask {
        task_id: i64,
        #[serde(flatten)]
        changes: TaskUpdateOptions,
    },
    DeleteTask {
        task_id: i64,
    },
    SetCurrentProject {
        project_id: i64,
    },
    SendMessageWithButtons {
        message: String,
        buttons: Vec<Button>,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::CreateProject { .. } => OperationKind::CreateProject,
            OperationRequest::UpdateProject { .. } => OperationKind::UpdateProject,
            OperationRequest::DeleteProject { .. } => OperationKind::DeleteProject,
            OperationRequest::CreateTask { .. } => OperationKind::CreateTask,
            OperationRequest::UpdateTask { .. } => OperationKind::UpdateTask,
            OperationRequest::DeleteTask { .. } => OperationKind::DeleteTask,
            OperationRequest::SetCurrentProject { .. } => OperationKind::SetCurrentProject,
            OperationRequest::SendMessageWithButtons { .. } => OperationKind::SendMessageWithButtons,
        }
    }

    /// 参数的 JSON 视图（审计与提示用）
    pub fn params(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("params").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// 给用户看的操作描述
    pub fn describe(&self) -> String {
        match self {
            OperationRequest::CreateProject { title, description } => {
                if description.is_empty() {
                    format!("创建项目「{title}」")
                } else {
                    format!("创建项目「{title}」（{description}）")
                }
            }
            OperationRequest::UpdateProject { project_id, changes } => {
                let mut parts = Vec::new();
                if let Some(t) = &changes.title {
                    parts.push(format!("名称 → {t}"));
                }
                if let Some(d) = &changes.description {
                    parts.push(format!("描述 → {d}"));
                }
                if let Some(s) = &changes.status {
                    parts.push(format!("状态 → {s}"));
                }
                if parts.is_empty() {
                    format!("更新项目 #{project_id}")
                } else {
                    format!("更新项目 #{project_id}：{}", parts.join("，"))
                }
            }
            OperationRequest::DeleteProject { project_id } => {
                format!("删除项目 #{project_id}（其中的任务也会被删除）")
            }
            OperationRequest::CreateTask { title, options } => {
                let mut s = format!(
                    "在项目 #{} 中创建任务「{title}」，优先级 {}",
                    options.project_id, options.priority
                );
                if let Some(d) = &options.deadline {
                    s.push_str(&format!("，截止 {}", d.format(DEADLINE_FORMAT)));
                }
                s
            }
            OperationRequest::UpdateTask { task_id, changes } => {
                let mut parts = Vec::new();
                if let Some(t) = &changes.title {
                    parts.push(format!("名称 → {t}"));
                }
                if let Some(s) = &changes.status {
                    parts.push(format!("状态 → {s}"));
                }
                if let Some(p) = &changes.priority {
                    parts.push(format!("优先级 → {p}"));
                }
                if let Some(d) = &changes.deadline {
                    parts.push(format!("截止 → {}", d.format(DEADLINE_FORMAT)));
                }
                if changes.description.is_some() {
                    parts.push("描述".to_string());
                }
                if parts.is_empty() {
                    format!("更新任务 #{task_id}")
                } else {
                    format!("更新任务 #{task_id}：{}", parts.join("，"))
                }
            }
            OperationRequest::DeleteTask { task_id } => format!("删除任务 #{task_id}"),
            OperationRequest::SetCurrentProject { project_id } => {
                format!("将项目 #{project_id} 设为当前项目")
            }
            OperationRequest::SendMessageWithButtons { message, buttons } => {
                format!("发送带 {} 个按钮的消息：{message}", buttons.len())
            }
        }
    }
}

/// 登记前的操作（尚无 id）
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub user_id: i64,
    pub chat_id: i64,
    pub request: OperationRequest,
    pub description: String,
}

impl NewOperation {
    pub fn new(user_id: i64, chat_id: i64, request: OperationRequest) -> Self {
        let description = request.describe();
        Self {
            user_id,
            chat_id,
            request,
            description,
        }
    }
}

/// 已登记、等待用户确认的操作
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub request: OperationRequest,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    /// 返回给脚本的提案对象
    pub fn proposal(&self) -> Proposal {
        Proposal {
            requires_confirmation: true,
            operation_id: self.id.clone(),
            description: self.description.clone(),
            kind: self.kind(),
        }
    }
}

/// 写能力调用的返回值：不是修改结果，而是指向待确认操作的引用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    #[serde(rename = "requiresConfirmation")]
    pub requires_confirmation: bool,
    #[serde(rename = "operationID")]
    pub operation_id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
}

/// 用户对待确认操作的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Cancel,
}

/// 确认后执行的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
}

impl OperationOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// 一次 resolve 的结果；取消时 outcome 为 None
#[derive(Debug, Clone)]
pub struct Resolution {
    pub operation: PendingOperation,
    pub decision: Decision,
    pub outcome: Option<OperationOutcome>,
}
