//! 持久化层：按用户隔离的项目 / 任务 / 当前项目 / 对话历史接口
//!
//! 核心只依赖 Store trait 的签名与结果（成功 / NotFound / Unauthorized / Storage），不关心 SQL。

pub mod models;
pub mod sqlite;

use async_trait::async_trait;

use crate::core::BotError;

pub use models::{
    parse_deadline, HistoryEntry, NewTask, Project, ProjectPatch, ProjectRole, ProjectStatus,
    Task, TaskFilter, TaskPatch, TaskPriority, TaskStatus, User, DEADLINE_FORMAT,
};
pub use sqlite::SqliteStore;

/// 持久化协作方接口；所有查询与修改都以 user_id 限定范围
#[async_trait]
pub trait Store: Send + Sync {
    /// 查找或创建用户，返回 (用户, 是否新建)
    async fn ensure_user(&self, user_id: i64, name: &str) -> Result<(User, bool), BotError>;

    /// 用户参与的项目；status 为 None 时返回全部
    async fn list_projects(
        &self,
        user_id: i64,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<Project>, BotError>;

    /// 用户可见的单个项目；无权限或不存在时为 None
    async fn get_project(&self, user_id: i64, project_id: i64) -> Result<Option<Project>, BotError>;

    /// 创建项目并把创建者设为 owner（同一事务）
    async fn create_project(
        &self,
        user_id: i64,
        title: &str,
        description: &str,
    ) -> Result<Project, BotError>;

    /// 仅 owner / admin 可修改
    async fn update_project(
        &self,
        user_id: i64,
        project_id: i64,
        patch: ProjectPatch,
    ) -> Result<Project, BotError>;

    /// 仅 owner 可删除
    async fn delete_project(&self, user_id: i64, project_id: i64) -> Result<(), BotError>;

    async fn list_tasks(&self, user_id: i64, filter: TaskFilter) -> Result<Vec<Task>, BotError>;

    async fn get_task(&self, user_id: i64, task_id: i64) -> Result<Option<Task>, BotError>;

    async fn create_task(&self, user_id: i64, task: NewTask) -> Result<Task, BotError>;

    async fn update_task(
        &self,
        user_id: i64,
        task_id: i64,
        patch: TaskPatch,
    ) -> Result<Task, BotError>;

    /// owner / admin 或任务创建者可删除
    async fn delete_task(&self, user_id: i64, task_id: i64) -> Result<(), BotError>;

    async fn current_project(&self, user_id: i64) -> Result<Option<Project>, BotError>;

    async fn set_current_project(&self, user_id: i64, project_id: i64) -> Result<(), BotError>;

    async fn append_message(
        &self,
        user_id: i64,
        chat_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), BotError>;

    /// 最近 limit 条消息，按时间正序
    async fn recent_messages(&self, chat_id: i64, limit: usize)
        -> Result<Vec<HistoryEntry>, BotError>;

    /// 只保留最近 keep 条，返回删除条数
    async fn prune_messages(&self, chat_id: i64, keep: usize) -> Result<usize, BotError>;
}
