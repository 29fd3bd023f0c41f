//! 能力面（Host API）：脚本访问宿主的唯一通道
//!
//! 每次调用新建一个 HostApi，绑定当前用户 / 会话身份。参数与返回值都是 JSON，
//! 不依赖具体解释器；bindings 负责把它注入 QuickJS。
//!
//! - 读能力：立即查询 Store，按用户隔离；无权限 / 未知过滤条件 / 空结果都返回空集合
//! - 写能力：同步校验参数，登记待确认操作，返回提案
//! - 工具能力：message / output / debug / console.log / fetch

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::runtime::Handle;

use crate::core::BotError;
use crate::operations::{
    Button, NewOperation, OperationRequest, PendingOperation, PendingRegistry,
    ProjectUpdateOptions, TaskCreateOptions, TaskUpdateOptions,
};
use crate::sandbox::fetch::{FetchOptions, Fetcher};
use crate::store::{parse_deadline, ProjectStatus, Store, TaskFilter, TaskPriority, TaskStatus};

/// sendMessageWithButtons 最多允许的按钮数
pub const MAX_BUTTONS: usize = 6;

/// 脚本中的身份（所有能力调用都以此限定范围）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub chat_id: i64,
}

/// 从脚本传入的参数：undefined 与 JSON 值区分开
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptArg {
    Undefined,
    Json(Value),
}

pub static UNDEFINED: ScriptArg = ScriptArg::Undefined;

impl ScriptArg {
    /// 字符串原样输出，其他值为紧凑 JSON，undefined 输出 "undefined"
    pub fn render(&self) -> String {
        match self {
            ScriptArg::Undefined => "undefined".to_string(),
            ScriptArg::Json(Value::String(s)) => s.clone(),
            ScriptArg::Json(v) => v.to_string(),
        }
    }

    /// 缩进 JSON（debug 与隐式输出）
    pub fn render_pretty(&self) -> String {
        match self {
            ScriptArg::Undefined => "undefined".to_string(),
            ScriptArg::Json(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
        }
    }

    fn is_absent(&self) -> bool {
        matches!(self, ScriptArg::Undefined | ScriptArg::Json(Value::Null))
    }

    fn as_json(&self) -> Option<&Value> {
        match self {
            ScriptArg::Json(v) => Some(v),
            ScriptArg::Undefined => None,
        }
    }
}

pub fn arg(args: &[ScriptArg], i: usize) -> &ScriptArg {
    args.get(i).unwrap_or(&UNDEFINED)
}

/// 一次调用中累积的副作用
#[derive(Debug, Default)]
pub struct Journal {
    pub messages: Vec<String>,
    pub output: Vec<String>,
    pub proposals: Vec<PendingOperation>,
    /// 最近一次参数校验失败；脚本因此失败时归类为 Validation
    pub validation_fault: Option<String>,
    closed: bool,
}

pub struct HostApi {
    identity: Identity,
    store: Arc<dyn Store>,
    registry: PendingRegistry,
    fetcher: Fetcher,
    handle: Handle,
    deadline: Instant,
    journal: Mutex<Journal>,
}

impl HostApi {
    pub fn new(
        identity: Identity,
        store: Arc<dyn Store>,
        registry: PendingRegistry,
        fetcher: Fetcher,
        handle: Handle,
        deadline: Instant,
    ) -> Self {
        Self {
            identity,
            store,
            registry,
            fetcher,
            handle,
            deadline,
            journal: Mutex::new(Journal::default()),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 关闭能力面并取出累积结果；之后的写能力调用一律失败
    pub fn close(&self) -> Journal {
        let mut j = self.journal();
        let taken = std::mem::take(&mut *j);
        j.closed = true;
        taken
    }

    pub fn is_closed(&self) -> bool {
        self.journal().closed
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    fn reject(&self, detail: impl Into<String>) -> BotError {
        let detail = detail.into();
        self.journal().validation_fault = Some(detail.clone());
        BotError::Validation(detail)
    }

    // ---------- 读能力 ----------

    /// listProjects(status?)
    pub fn list_projects(&self, status: &ScriptArg) -> Result<Value, BotError> {
        let filter = match status {
            s if s.is_absent() => None,
            ScriptArg::Json(Value::String(s)) if s.trim().is_empty() => None,
            ScriptArg::Json(Value::String(s)) => match s.parse::<ProjectStatus>() {
                Ok(st) => Some(st),
                Err(_) => return Ok(json!([])),
            },
            _ => return Ok(json!([])),
        };
        let projects = self.block_on(self.store.list_projects(self.identity.user_id, filter))?;
        to_json(&projects)
    }

    /// listTasks({project_id} | {status})
    pub fn list_tasks(&self, filter: &ScriptArg) -> Result<Value, BotError> {
        let filter = match filter.as_json() {
            None | Some(Value::Null) => TaskFilter::All,
            Some(Value::Object(obj)) => {
                if let Some(id) = obj.get("project_id").filter(|v| !v.is_null()) {
                    match as_integer(id) {
                        Some(id) => TaskFilter::Project(id),
                        None => return Ok(json!([])),
                    }
                } else if let Some(status) = obj.get("status").filter(|v| !v.is_null()) {
                    match status.as_str().map(str::parse::<TaskStatus>) {
                        Some(Ok(st)) => TaskFilter::Status(st),
                        _ => return Ok(json!([])),
                    }
                } else {
                    TaskFilter::All
                }
            }
            Some(_) => return Ok(json!([])),
        };
        let tasks = self.block_on(self.store.list_tasks(self.identity.user_id, filter))?;
        to_json(&tasks)
    }

    /// getCurrentProject() → {current_project, has_current}
    pub fn get_current_project(&self) -> Result<Value, BotError> {
        let current = self.block_on(self.store.current_project(self.identity.user_id))?;
        Ok(json!({
            "has_current": current.is_some(),
            "current_project": to_json(&current)?,
        }))
    }

    // ---------- 写能力 ----------

    /// createProject(title, description?)
    pub fn create_project(&self, title: &ScriptArg, description: &ScriptArg) -> Result<Value, BotError> {
        let title = self.require_title(title, "title")?;
        let description = self.optional_text(description, "description")?.unwrap_or_default();
        self.propose(OperationRequest::CreateProject { title, description })
    }

    /// updateProject(project_id, {title?, description?, status?})
    pub fn update_project(&self, project_id: &ScriptArg, changes: &ScriptArg) -> Result<Value, BotError> {
        let project_id = self.require_id(project_id, "project_id")?;
        let fields = self.optional_object(changes, "changes")?;
        let changes = ProjectUpdateOptions {
            title: self.field_text(&fields, "title")?,
            description: self.field_text(&fields, "description")?,
            status: self.field_enum::<ProjectStatus>(&fields, "status")?,
        };
        self.propose(OperationRequest::UpdateProject {
            project_id,
            changes,
        })
    }

    /// deleteProject(project_id)
    pub fn delete_project(&self, project_id: &ScriptArg) -> Result<Value, BotError> {
        let project_id = self.require_id(project_id, "project_id")?;
        self.propose(OperationRequest::DeleteProject { project_id })
    }

    /// createTask(title, {project_id, description?, priority?, deadline?})
    pub fn create_task(&self, title: &ScriptArg, options: &ScriptArg) -> Result<Value, BotError> {
        let title = self.require_title(title, "title")?;
        let fields = self.optional_object(options, "options")?;
        let project_id = match fields.get("project_id") {
            Some(v) => self.require_id(&ScriptArg::Json(v.clone()), "project_id")?,
            None => return Err(self.reject("createTask requires options.project_id (number)")),
        };
        let options = TaskCreateOptions {
            project_id,
            description: self.field_text(&fields, "description")?.unwrap_or_default(),
            priority: self
                .field_enum::<TaskPriority>(&fields, "priority")?
                .unwrap_or_default(),
            deadline: self.field_deadline(&fields)?,
        };
        self.propose(OperationRequest::CreateTask { title, options })
    }

    /// updateTask(task_id, {title?, description?, status?, priority?, deadline?})
    pub fn update_task(&self, task_id: &ScriptArg, changes: &ScriptArg) -> Result<Value, BotError> {
        let task_id = self.require_id(task_id, "task_id")?;
        let fields = self.optional_object(changes, "changes")?;
        let changes = TaskUpdateOptions {
            title: self.field_text(&fields, "title")?,
            description: self.field_text(&fields, "description")?,
            status: self.field_enum::<TaskStatus>(&fields, "status")?,
            priority: self.field_enum::<TaskPriority>(&fields, "priority")?,
            deadline: self.field_deadline(&fields)?,
        };
        self.propose(OperationRequest::UpdateTask { task_id, changes })
    }

    /// deleteTask(task_id)
    pub fn delete_task(&self, task_id: &ScriptArg) -> Result<Value, BotError> {
        let task_id = self.require_id(task_id, "task_id")?;
        self.propose(OperationRequest::DeleteTask { task_id })
    }

    /// setCurrentProject(project_id)
    pub fn set_current_project(&self, project_id: &ScriptArg) -> Result<Value, BotError> {
        let project_id = self.require_id(project_id, "project_id")?;
        self.propose(OperationRequest::SetCurrentProject { project_id })
    }

    /// sendMessageWithButtons(message, [{text, action}, ...])
    pub fn send_message_with_buttons(&self, message: &ScriptArg, buttons: &ScriptArg) -> Result<Value, BotError> {
        let message = self.require_title(message, "message")?;
        let items = match buttons.as_json() {
            Some(Value::Array(items)) => items,
            _ => return Err(self.reject("buttons must be an array of {text, action}")),
        };
        if items.is_empty() || items.len() > MAX_BUTTONS {
            return Err(self.reject(format!(
                "buttons must contain 1 to {MAX_BUTTONS} entries, got {}",
                items.len()
            )));
        }
        let mut parsed = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let text = item.get("text").and_then(Value::as_str).map(str::trim);
            let action = item.get("action").and_then(Value::as_str).map(str::trim);
            match (text, action) {
                (Some(t), Some(a)) if !t.is_empty() && !a.is_empty() => {
                    parsed.push(Button::new(t, a))
                }
                _ => {
                    return Err(self.reject(format!(
                        "buttons[{i}] must have non-empty string text and action"
                    )))
                }
            }
        }
        self.propose(OperationRequest::SendMessageWithButtons {
            message,
            buttons: parsed,
        })
    }

    fn propose(&self, request: OperationRequest) -> Result<Value, BotError> {
        let mut j = self.journal();
        if j.closed {
            return Err(BotError::Runtime("script invocation already finished".to_string()));
        }
        let op = self.registry.register(NewOperation::new(
            self.identity.user_id,
            self.identity.chat_id,
            request,
        ));
        let proposal = to_json(&op.proposal())?;
        j.proposals.push(op);
        Ok(proposal)
    }

    // ---------- 工具能力 ----------

    /// message(...args)：一次调用 = 一条用户可见消息
    pub fn message(&self, args: &[ScriptArg]) {
        let text = args.iter().map(ScriptArg::render).collect::<Vec<_>>().join(" ");
        let mut j = self.journal();
        if !j.closed {
            j.messages.push(text);
        }
    }

    /// output(value)：追加一条续写数据
    pub fn output(&self, value: &ScriptArg) {
        let mut j = self.journal();
        if !j.closed {
            j.output.push(value.render());
        }
    }

    /// debug(value)：以 DEBUG: 前缀写入续写数据
    pub fn debug(&self, value: &ScriptArg) {
        let text = format!("DEBUG: {}", value.render_pretty());
        let mut j = self.journal();
        if !j.closed {
            j.output.push(text);
        }
    }

    /// console.log：只写运行日志
    pub fn log(&self, level: &str, args: &[ScriptArg]) {
        let text = args.iter().map(ScriptArg::render).collect::<Vec<_>>().join(" ");
        let user_id = self.identity.user_id;
        match level {
            "error" => tracing::error!(user_id, script_log = %text, "console"),
            "warn" => tracing::warn!(user_id, script_log = %text, "console"),
            _ => tracing::info!(user_id, script_log = %text, "console"),
        }
    }

    /// 剩余预算减 1 秒，至少 1 秒
    pub fn fetch_timeout(&self) -> Duration {
        self.deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    }

    /// fetch(url, options?)
    pub fn fetch(&self, url: &ScriptArg, options: &ScriptArg) -> Result<Value, BotError> {
        let url = match url.as_json() {
            Some(Value::String(u)) if !u.trim().is_empty() => u.trim().to_string(),
            _ => return Err(BotError::Runtime("fetch requires a url string".to_string())),
        };
        let options: FetchOptions = match options.as_json() {
            None | Some(Value::Null) => FetchOptions::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| BotError::Runtime(format!("invalid fetch options: {e}")))?,
        };
        let timeout = self.fetch_timeout();
        let resp = self.block_on(self.fetcher.fetch(&url, options, timeout))?;
        to_json(&resp)
    }

    // ---------- 参数校验 ----------

    fn require_title(&self, v: &ScriptArg, name: &str) -> Result<String, BotError> {
        match v.as_json() {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(Value::String(_)) => Err(self.reject(format!("{name} must not be empty"))),
            _ => Err(self.reject(format!("{name} is required and must be a string"))),
        }
    }

    fn require_id(&self, v: &ScriptArg, name: &str) -> Result<i64, BotError> {
        match v.as_json().and_then(as_integer) {
            Some(id) => Ok(id),
            None => Err(self.reject(format!(
                "{name} is required and must be a number, got {}",
                v.render()
            ))),
        }
    }

    fn optional_text(&self, v: &ScriptArg, name: &str) -> Result<Option<String>, BotError> {
        match v {
            v if v.is_absent() => Ok(None),
            ScriptArg::Json(Value::String(s)) => Ok(Some(s.clone())),
            _ => Err(self.reject(format!("{name} must be a string"))),
        }
    }

    fn optional_object(&self, v: &ScriptArg, name: &str) -> Result<Map<String, Value>, BotError> {
        match v {
            v if v.is_absent() => Ok(Map::new()),
            ScriptArg::Json(Value::Object(m)) => Ok(m.clone()),
            _ => Err(self.reject(format!("{name} must be an object"))),
        }
    }

    fn field_text(&self, fields: &Map<String, Value>, key: &str) -> Result<Option<String>, BotError> {
        match fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.reject(format!("{key} must be a string"))),
        }
    }

    fn field_enum<T>(&self, fields: &Map<String, Value>, key: &str) -> Result<Option<T>, BotError>
    where
        T: std::str::FromStr<Err = String>,
    {
        match fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => s.parse::<T>().map(Some).map_err(|e| self.reject(e)),
            Some(other) => Err(self.reject(format!("{key} must be a string, got {other}"))),
        }
    }

    fn field_deadline(
        &self,
        fields: &Map<String, Value>,
    ) -> Result<Option<chrono::NaiveDateTime>, BotError> {
        match fields.get("deadline") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => parse_deadline(s).map(Some).ok_or_else(|| {
                self.reject(format!("deadline must use format YYYY-MM-DD HH:MM, got {s}"))
            }),
            Some(other) => Err(self.reject(format!("deadline must be a string, got {other}"))),
        }
    }
}

/// JS 数字可能是 3 或 3.0；只接受整数值
fn as_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        _ => None,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, BotError> {
    serde_json::to_value(value).map_err(|e| BotError::Runtime(format!("serialize result: {e}")))
}
