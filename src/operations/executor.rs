//! 确认后的执行：把已确认的操作交给 Store / Messenger 完成真正的修改

use std::sync::Arc;

use crate::core::BotError;
use crate::messaging::Messenger;
use crate::operations::{
    Button, CallbackAction, OperationOutcome, OperationRequest, PendingOperation,
};
use crate::store::{NewTask, ProjectPatch, Store, TaskPatch};

/// 执行已确认的操作；失败时返回 success=false 的结果而不是错误
#[derive(Clone)]
pub struct OperationExecutor {
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
}

impl OperationExecutor {
    pub fn new(store: Arc<dyn Store>, messenger: Arc<dyn Messenger>) -> Self {
        Self { store, messenger }
    }

    pub async fn execute(&self, op: &PendingOperation) -> OperationOutcome {
        match self.apply(op).await {
            Ok(message) => OperationOutcome::ok(message),
            Err(e) => {
                tracing::warn!(
                    op_id = %op.id,
                    user_id = op.user_id,
                    kind = op.kind().as_str(),
                    error = %e,
                    "Confirmed operation failed"
                );
                OperationOutcome::failed(failure_text(&e))
            }
        }
    }

    async fn apply(&self, op: &PendingOperation) -> Result<String, BotError> {
        let user_id = op.user_id;
        match &op.request {
            OperationRequest::CreateProject { title, description } => {
                let p = self.store.create_project(user_id, title, description).await?;
                Ok(format!("✅ 项目「{}」已创建（ID: {}）", p.title, p.id))
            }
            OperationRequest::UpdateProject {
                project_id,
                changes,
            } => {
                let patch = ProjectPatch {
                    title: changes.title.clone(),
                    description: changes.description.clone(),
                    status: changes.status,
                };
                let p = self.store.update_project(user_id, *project_id, patch).await?;
                Ok(format!("✅ 项目「{}」已更新", p.title))
            }
            OperationRequest::DeleteProject { project_id } => {
                self.store.delete_project(user_id, *project_id).await?;
                Ok(format!("✅ 项目 #{project_id} 已删除"))
            }
            OperationRequest::CreateTask { title, options } => {
                let task = NewTask {
                    project_id: options.project_id,
                    title: title.clone(),
                    description: options.description.clone(),
                    priority: options.priority,
                    deadline: options.deadline,
                };
                let t = self.store.create_task(user_id, task).await?;
                Ok(format!(
                    "✅ 任务「{}」已添加到项目「{}」（ID: {}）",
                    t.title, t.project_title, t.id
                ))
            }
            OperationRequest::UpdateTask { task_id, changes } => {
                let patch = TaskPatch {
                    title: changes.title.clone(),
                    description: changes.description.clone(),
                    status: changes.status,
                    priority: changes.priority,
                    deadline: changes.deadline,
                };
                let t = self.store.update_task(user_id, *task_id, patch).await?;
                Ok(format!("✅ 任务「{}」已更新（状态: {}）", t.title, t.status))
            }
            OperationRequest::DeleteTask { task_id } => {
                self.store.delete_task(user_id, *task_id).await?;
                Ok(format!("✅ 任务 #{task_id} 已删除"))
            }
            OperationRequest::SetCurrentProject { project_id } => {
                let project = self
                    .store
                    .get_project(user_id, *project_id)
                    .await?
                    .ok_or_else(|| BotError::NotFound(format!("project #{project_id}")))?;
                self.store.set_current_project(user_id, project.id).await?;
                Ok(format!("✅ 当前项目已切换为「{}」", project.title))
            }
            OperationRequest::SendMessageWithButtons { message, buttons } => {
                let tagged: Vec<Button> = buttons
                    .iter()
                    .map(|b| Button::new(b.text.clone(), CallbackAction::custom_data(&b.action)))
                    .collect();
                self.messenger
                    .send_with_buttons(op.chat_id, message, &tagged)
                    .await?;
                Ok("✅ 消息已发送".to_string())
            }
        }
    }
}

fn failure_text(err: &BotError) -> String {
    match err {
        BotError::NotFound(_) => "❌ 操作失败：目标不存在或你无权访问。".to_string(),
        BotError::Unauthorized(_) => "❌ 操作失败：你没有足够的权限。".to_string(),
        _ => "❌ 操作没有完成，请稍后再试。".to_string(),
    }
}
