//! SQLite 持久化（rusqlite，同步连接 + Mutex）
//!
//! 表：users / projects / project_users（角色）/ tasks / messages。
//! 权限规则：修改项目需 owner/admin，删除项目需 owner，任务读写需项目成员，删除任务需 owner/admin 或创建者。

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::BotError;
use crate::store::{
    HistoryEntry, NewTask, Project, ProjectPatch, ProjectRole, ProjectStatus, Store, Task,
    TaskFilter, TaskPatch, TaskStatus, User,
};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id                 INTEGER PRIMARY KEY,
    name               TEXT NOT NULL DEFAULT '',
    current_project_id INTEGER,
    created_at         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title       TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL DEFAULT 'planning',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS project_users (
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    user_id    INTEGER NOT NULL,
    role       TEXT NOT NULL,
    joined_at  TEXT NOT NULL,
    PRIMARY KEY (project_id, user_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id   INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    user_id      INTEGER NOT NULL,
    title        TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    status       TEXT NOT NULL DEFAULT 'todo',
    priority     TEXT NOT NULL DEFAULT 'medium',
    deadline     TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    INTEGER NOT NULL,
    chat_id    INTEGER NOT NULL,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, id);
"#;

const PROJECT_COLUMNS: &str =
    "p.id, p.title, p.description, p.status, p.created_at, p.updated_at, pu.role";

const TASK_COLUMNS: &str = "t.id, t.project_id, t.user_id, t.title, t.description, t.status, \
     t.priority, t.deadline, t.created_at, t.updated_at, t.completed_at, p.title";

/// SQLite 实现：单连接，所有语句在锁内同步执行
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BotError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BotError::Storage(format!("create db dir: {e}")))?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, BotError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BotError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, BotError>,
    ) -> Result<T, BotError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| BotError::Storage("connection lock poisoned".to_string()))?;
        f(&mut guard)
    }
}

fn text_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: text_col(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        user_role: text_col(row, 6)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: text_col(row, 5)?,
        priority: text_col(row, 6)?,
        deadline: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        completed_at: row.get(10)?,
        project_title: row.get(11)?,
    })
}

fn role_of(conn: &Connection, project_id: i64, user_id: i64) -> Result<Option<ProjectRole>, BotError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT role FROM project_users WHERE project_id = ?1 AND user_id = ?2",
            params![project_id, user_id],
            |r| r.get(0),
        )
        .optional()?;
    raw.map(|r| r.parse::<ProjectRole>().map_err(BotError::Storage))
        .transpose()
}

fn project_exists(conn: &Connection, project_id: i64) -> Result<bool, BotError> {
    Ok(conn
        .query_row("SELECT 1 FROM projects WHERE id = ?1", params![project_id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn load_project(conn: &Connection, user_id: i64, project_id: i64) -> Result<Option<Project>, BotError> {
    let sql = format!(
        "SELECT {PROJECT_COLUMNS} FROM projects p \
         JOIN project_users pu ON pu.project_id = p.id \
         WHERE pu.user_id = ?1 AND p.id = ?2"
    );
    Ok(conn
        .query_row(&sql, params![user_id, project_id], project_from_row)
        .optional()?)
}

fn load_task(conn: &Connection, user_id: i64, task_id: i64) -> Result<Option<Task>, BotError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks t \
         JOIN projects p ON p.id = t.project_id \
         JOIN project_users pu ON pu.project_id = t.project_id AND pu.user_id = ?1 \
         WHERE t.id = ?2"
    );
    Ok(conn
        .query_row(&sql, params![user_id, task_id], task_from_row)
        .optional()?)
}

fn task_exists(conn: &Connection, task_id: i64) -> Result<bool, BotError> {
    Ok(conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![task_id], |_| Ok(()))
        .optional()?
        .is_some())
}

/// 项目存在但无访问权限时为 Unauthorized，不存在为 NotFound
fn require_role(
    conn: &Connection,
    user_id: i64,
    project_id: i64,
) -> Result<ProjectRole, BotError> {
    match role_of(conn, project_id, user_id)? {
        Some(role) => Ok(role),
        None if project_exists(conn, project_id)? => Err(BotError::Unauthorized(format!(
            "user {user_id} has no access to project #{project_id}"
        ))),
        None => Err(BotError::NotFound(format!("project #{project_id}"))),
    }
}

fn require_task(conn: &Connection, user_id: i64, task_id: i64) -> Result<Task, BotError> {
    match load_task(conn, user_id, task_id)? {
        Some(task) => Ok(task),
        None if task_exists(conn, task_id)? => Err(BotError::Unauthorized(format!(
            "user {user_id} has no access to task #{task_id}"
        ))),
        None => Err(BotError::NotFound(format!("task #{task_id}"))),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn ensure_user(&self, user_id: i64, name: &str) -> Result<(User, bool), BotError> {
        self.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, name, current_project_id FROM users WHERE id = ?1",
                    params![user_id],
                    |r| {
                        Ok(User {
                            id: r.get(0)?,
                            name: r.get(1)?,
                            current_project_id: r.get(2)?,
                        })
                    },
                )
                .optional()?;
            if let Some(user) = existing {
                return Ok((user, false));
            }
            conn.execute(
                "INSERT INTO users (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, name, Utc::now()],
            )?;
            Ok((
                User {
                    id: user_id,
                    name: name.to_string(),
                    current_project_id: None,
                },
                true,
            ))
        })
    }

    async fn list_projects(
        &self,
        user_id: i64,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<Project>, BotError> {
        self.with_conn(|conn| {
            let base = format!(
                "SELECT {PROJECT_COLUMNS} FROM projects p \
                 JOIN project_users pu ON pu.project_id = p.id \
                 WHERE pu.user_id = ?1"
            );
            let projects = match status {
                Some(s) => {
                    let sql = format!("{base} AND p.status = ?2 ORDER BY p.id");
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![user_id, s.as_str()], project_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let sql = format!("{base} ORDER BY p.id");
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![user_id], project_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(projects)
        })
    }

    async fn get_project(&self, user_id: i64, project_id: i64) -> Result<Option<Project>, BotError> {
        self.with_conn(|conn| load_project(conn, user_id, project_id))
    }

    async fn create_project(
        &self,
        user_id: i64,
        title: &str,
        description: &str,
    ) -> Result<Project, BotError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO projects (title, description, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![title, description, ProjectStatus::Planning.as_str(), now],
            )?;
            let project_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO project_users (project_id, user_id, role, joined_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![project_id, user_id, ProjectRole::Owner.as_str(), now],
            )?;
            tx.commit()?;
            load_project(conn, user_id, project_id)?
                .ok_or_else(|| BotError::Storage(format!("project #{project_id} vanished")))
        })
    }

    async fn update_project(
        &self,
        user_id: i64,
        project_id: i64,
        patch: ProjectPatch,
    ) -> Result<Project, BotError> {
        self.with_conn(|conn| {
            let role = require_role(conn, user_id, project_id)?;
            if !role.can_manage() {
                return Err(BotError::Unauthorized(format!(
                    "role {role} cannot update project #{project_id}"
                )));
            }
            let current = load_project(conn, user_id, project_id)?
                .ok_or_else(|| BotError::NotFound(format!("project #{project_id}")))?;
            conn.execute(
                "UPDATE projects SET title = ?1, description = ?2, status = ?3, updated_at = ?4 \
                 WHERE id = ?5",
                params![
                    patch.title.unwrap_or(current.title),
                    patch.description.unwrap_or(current.description),
                    patch.status.unwrap_or(current.status).as_str(),
                    Utc::now(),
                    project_id
                ],
            )?;
            load_project(conn, user_id, project_id)?
                .ok_or_else(|| BotError::NotFound(format!("project #{project_id}")))
        })
    }

    async fn delete_project(&self, user_id: i64, project_id: i64) -> Result<(), BotError> {
        self.with_conn(|conn| {
            let role = require_role(conn, user_id, project_id)?;
            if role != ProjectRole::Owner {
                return Err(BotError::Unauthorized(format!(
                    "only the owner can delete project #{project_id}"
                )));
            }
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE users SET current_project_id = NULL WHERE current_project_id = ?1",
                params![project_id],
            )?;
            tx.execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn list_tasks(&self, user_id: i64, filter: TaskFilter) -> Result<Vec<Task>, BotError> {
        self.with_conn(|conn| {
            let base = format!(
                "SELECT {TASK_COLUMNS} FROM tasks t \
                 JOIN projects p ON p.id = t.project_id \
                 JOIN project_users pu ON pu.project_id = t.project_id AND pu.user_id = ?1"
            );
            let tasks = match filter {
                TaskFilter::All => {
                    let mut stmt = conn.prepare(&format!("{base} ORDER BY t.id"))?;
                    let rows = stmt.query_map(params![user_id], task_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                TaskFilter::Project(project_id) => {
                    let mut stmt =
                        conn.prepare(&format!("{base} WHERE t.project_id = ?2 ORDER BY t.id"))?;
                    let rows = stmt.query_map(params![user_id, project_id], task_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                TaskFilter::Status(status) => {
                    let mut stmt =
                        conn.prepare(&format!("{base} WHERE t.status = ?2 ORDER BY t.id"))?;
                    let rows = stmt.query_map(params![user_id, status.as_str()], task_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(tasks)
        })
    }

    async fn get_task(&self, user_id: i64, task_id: i64) -> Result<Option<Task>, BotError> {
        self.with_conn(|conn| load_task(conn, user_id, task_id))
    }

    async fn create_task(&self, user_id: i64, task: NewTask) -> Result<Task, BotError> {
        self.with_conn(|conn| {
            require_role(conn, user_id, task.project_id)?;
            let now = Utc::now();
            conn.execute(
                "INSERT INTO tasks (project_id, user_id, title, description, status, priority, \
                 deadline, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    task.project_id,
                    user_id,
                    task.title,
                    task.description,
                    TaskStatus::Todo.as_str(),
                    task.priority.as_str(),
                    task.deadline,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            load_task(conn, user_id, id)?
                .ok_or_else(|| BotError::Storage(format!("task #{id} vanished")))
        })
    }

    async fn update_task(
        &self,
        user_id: i64,
        task_id: i64,
        patch: TaskPatch,
    ) -> Result<Task, BotError> {
        self.with_conn(|conn| {
            let current = require_task(conn, user_id, task_id)?;
            let status = patch.status.unwrap_or(current.status);
            // 进入 done 时记录完成时间，离开 done 时清空
            let completed_at: Option<DateTime<Utc>> = match (current.status, status) {
                (TaskStatus::Done, TaskStatus::Done) => current.completed_at,
                (_, TaskStatus::Done) => Some(Utc::now()),
                _ => None,
            };
            conn.execute(
                "UPDATE tasks SET title = ?1, description = ?2, status = ?3, priority = ?4, \
                 deadline = ?5, completed_at = ?6, updated_at = ?7 WHERE id = ?8",
                params![
                    patch.title.unwrap_or(current.title),
                    patch.description.unwrap_or(current.description),
                    status.as_str(),
                    patch.priority.unwrap_or(current.priority).as_str(),
                    patch.deadline.or(current.deadline),
                    completed_at,
                    Utc::now(),
                    task_id
                ],
            )?;
            load_task(conn, user_id, task_id)?
                .ok_or_else(|| BotError::NotFound(format!("task #{task_id}")))
        })
    }

    async fn delete_task(&self, user_id: i64, task_id: i64) -> Result<(), BotError> {
        self.with_conn(|conn| {
            let task = require_task(conn, user_id, task_id)?;
            let role = require_role(conn, user_id, task.project_id)?;
            if !role.can_manage() && task.user_id != user_id {
                return Err(BotError::Unauthorized(format!(
                    "insufficient permissions to delete task #{task_id}"
                )));
            }
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            Ok(())
        })
    }

    async fn current_project(&self, user_id: i64) -> Result<Option<Project>, BotError> {
        self.with_conn(|conn| {
            let current: Option<Option<i64>> = conn
                .query_row(
                    "SELECT current_project_id FROM users WHERE id = ?1",
                    params![user_id],
                    |r| r.get(0),
                )
                .optional()?;
            match current.flatten() {
                Some(project_id) => load_project(conn, user_id, project_id),
                None => Ok(None),
            }
        })
    }

    async fn set_current_project(&self, user_id: i64, project_id: i64) -> Result<(), BotError> {
        self.with_conn(|conn| {
            if load_project(conn, user_id, project_id)?.is_none() {
                return Err(BotError::NotFound(format!("project #{project_id}")));
            }
            let changed = conn.execute(
                "UPDATE users SET current_project_id = ?1 WHERE id = ?2",
                params![project_id, user_id],
            )?;
            if changed == 0 {
                conn.execute(
                    "INSERT INTO users (id, name, current_project_id, created_at) \
                     VALUES (?1, '', ?2, ?3)",
                    params![user_id, project_id, Utc::now()],
                )?;
            }
            Ok(())
        })
    }

    async fn append_message(
        &self,
        user_id: i64,
        chat_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), BotError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (user_id, chat_id, role, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, chat_id, role, content, Utc::now()],
            )?;
            Ok(())
        })
    }

    async fn recent_messages(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, BotError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, created_at FROM messages \
                 WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![chat_id, limit as i64], |r| {
                Ok(HistoryEntry {
                    role: r.get(0)?,
                    content: r.get(1)?,
                    created_at: r.get(2)?,
                })
            })?;
            let mut entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            entries.reverse();
            Ok(entries)
        })
    }

    async fn prune_messages(&self, chat_id: i64, keep: usize) -> Result<usize, BotError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM messages WHERE chat_id = ?1 AND id NOT IN \
                 (SELECT id FROM messages WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2)",
                params![chat_id, keep as i64],
            )?;
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{parse_deadline, TaskPriority};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn add_member(store: &SqliteStore, project_id: i64, user_id: i64, role: ProjectRole) {
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO project_users (project_id, user_id, role, joined_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![project_id, user_id, role.as_str(), Utc::now()],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_project_assigns_owner() {
        let s = store();
        let p = s.create_project(1, "Site", "desc").await.unwrap();
        assert_eq!(p.title, "Site");
        assert_eq!(p.user_role, ProjectRole::Owner);
        assert_eq!(p.status, ProjectStatus::Planning);
        assert_eq!(s.list_projects(1, None).await.unwrap().len(), 1);
        assert!(s.list_projects(2, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_projects_by_status() {
        let s = store();
        let p = s.create_project(1, "A", "").await.unwrap();
        s.create_project(1, "B", "").await.unwrap();
        s.update_project(
            1,
            p.id,
            ProjectPatch {
                status: Some(ProjectStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let active = s.list_projects(1, Some(ProjectStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "A");
    }

    #[tokio::test]
    async fn test_update_project_keeps_unchanged_fields() {
        let s = store();
        let p = s.create_project(1, "A", "keep me").await.unwrap();
        let updated = s
            .update_project(
                1,
                p.id,
                ProjectPatch {
                    title: Some("B".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "B");
        assert_eq!(updated.description, "keep me");
    }

    #[tokio::test]
    async fn test_project_permissions() {
        let s = store();
        let p = s.create_project(1, "A", "").await.unwrap();
        add_member(&s, p.id, 2, ProjectRole::Member);
        add_member(&s, p.id, 3, ProjectRole::Admin);

        let err = s
            .update_project(2, p.id, ProjectPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Unauthorized(_)));
        assert!(s.update_project(3, p.id, ProjectPatch::default()).await.is_ok());

        let err = s.delete_project(3, p.id).await.unwrap_err();
        assert!(matches!(err, BotError::Unauthorized(_)));
        let err = s.delete_project(9, p.id).await.unwrap_err();
        assert!(matches!(err, BotError::Unauthorized(_)));
        let err = s.delete_project(1, 999).await.unwrap_err();
        assert!(matches!(err, BotError::NotFound(_)));

        s.delete_project(1, p.id).await.unwrap();
        assert!(s.get_project(1, p.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let s = store();
        let p = s.create_project(1, "A", "").await.unwrap();
        let t = s
            .create_task(
                1,
                NewTask {
                    project_id: p.id,
                    title: "Write docs".into(),
                    description: String::new(),
                    priority: TaskPriority::default(),
                    deadline: parse_deadline("2025-03-01 18:00"),
                },
            )
            .await
            .unwrap();
        assert_eq!(t.priority, TaskPriority::Medium);
        assert_eq!(t.status, TaskStatus::Todo);
        assert_eq!(t.project_title, "A");
        assert!(t.deadline.is_some());

        let done = s
            .update_task(
                1,
                t.id,
                TaskPatch {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.title, "Write docs");
        assert!(done.deadline.is_some());

        let reopened = s
            .update_task(
                1,
                t.id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(reopened.completed_at.is_none());

        assert_eq!(
            s.list_tasks(1, TaskFilter::Status(TaskStatus::InProgress))
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(s.list_tasks(1, TaskFilter::Project(p.id)).await.unwrap().len(), 1);
        assert!(s.list_tasks(2, TaskFilter::All).await.unwrap().is_empty());

        s.delete_task(1, t.id).await.unwrap();
        assert!(s.get_task(1, t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_task_requires_membership() {
        let s = store();
        let p = s.create_project(1, "A", "").await.unwrap();
        let err = s
            .create_task(
                2,
                NewTask {
                    project_id: p.id,
                    title: "x".into(),
                    description: String::new(),
                    priority: TaskPriority::Low,
                    deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_delete_task_by_creator_member() {
        let s = store();
        let p = s.create_project(1, "A", "").await.unwrap();
        add_member(&s, p.id, 2, ProjectRole::Member);
        add_member(&s, p.id, 3, ProjectRole::Member);
        let t = s
            .create_task(
                2,
                NewTask {
                    project_id: p.id,
                    title: "mine".into(),
                    description: String::new(),
                    priority: TaskPriority::High,
                    deadline: None,
                },
            )
            .await
            .unwrap();
        let err = s.delete_task(3, t.id).await.unwrap_err();
        assert!(matches!(err, BotError::Unauthorized(_)));
        s.delete_task(2, t.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_current_project() {
        let s = store();
        s.ensure_user(1, "alice").await.unwrap();
        assert!(s.current_project(1).await.unwrap().is_none());
        let p = s.create_project(1, "A", "").await.unwrap();
        s.set_current_project(1, p.id).await.unwrap();
        assert_eq!(s.current_project(1).await.unwrap().unwrap().id, p.id);

        let other = s.create_project(2, "B", "").await.unwrap();
        let err = s.set_current_project(1, other.id).await.unwrap_err();
        assert!(matches!(err, BotError::NotFound(_)));

        s.delete_project(1, p.id).await.unwrap();
        assert!(s.current_project(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_user_reports_new() {
        let s = store();
        assert!(s.ensure_user(7, "bob").await.unwrap().1);
        let (user, is_new) = s.ensure_user(7, "bob").await.unwrap();
        assert!(!is_new);
        assert_eq!(user.name, "bob");
    }

    #[tokio::test]
    async fn test_history_prune_keeps_latest() {
        let s = store();
        for i in 0..5 {
            s.append_message(1, 10, "user", &format!("m{i}")).await.unwrap();
        }
        s.append_message(1, 11, "user", "other chat").await.unwrap();
        assert_eq!(s.prune_messages(10, 3).await.unwrap(), 2);
        let recent = s.recent_messages(10, 50).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(s.recent_messages(11, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bot.db");
        {
            let s = SqliteStore::open(&path).unwrap();
            s.create_project(1, "Persisted", "").await.unwrap();
        }
        let s = SqliteStore::open(&path).unwrap();
        assert_eq!(s.list_projects(1, None).await.unwrap()[0].title, "Persisted");
    }
}
