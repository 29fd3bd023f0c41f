//! 待确认操作登记表
//!
//! 存储通过 PendingStore 注入；查找、所有者校验与删除在同一把锁内完成，保证同一 id 最多执行一次。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::core::BotError;
use crate::operations::{
    Decision, NewOperation, OperationExecutor, PendingOperation, Resolution,
};

/// 登记表的底层存储；单进程用内存实现，多实例部署可换成带 TTL 的外部 KV
pub trait PendingStore: Send + Sync {
    /// 插入新记录；id 已存在时返回 false 且不覆盖
    fn insert(&self, op: PendingOperation) -> bool;

    /// 原子地取出属于 user_id 的记录；不存在为 NotFound，所有者不符为 Unauthorized（记录保留）
    fn take_owned(&self, id: &str, user_id: i64) -> Result<PendingOperation, BotError>;

    fn remove(&self, id: &str) -> Option<PendingOperation>;

    fn contains(&self, id: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 删除 cutoff 之前创建的记录，返回删除条数
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize;
}

/// 内存存储：Mutex<HashMap>
#[derive(Debug, Default)]
pub struct InMemoryPendingStore {
    ops: Mutex<HashMap<String, PendingOperation>>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingOperation>> {
        // 锁内只做 HashMap 操作，不会在持锁时 panic；中毒时沿用内部数据
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PendingStore for InMemoryPendingStore {
    fn insert(&self, op: PendingOperation) -> bool {
        let mut ops = self.lock();
        if ops.contains_key(&op.id) {
            return false;
        }
        ops.insert(op.id.clone(), op);
        true
    }

    fn take_owned(&self, id: &str, user_id: i64) -> Result<PendingOperation, BotError> {
        let mut ops = self.lock();
        match ops.get(id) {
            None => Err(BotError::NotFound(format!("pending operation {id}"))),
            Some(op) if op.user_id != user_id => Err(BotError::Unauthorized(format!(
                "pending operation {id} belongs to another user"
            ))),
            Some(_) => ops
                .remove(id)
                .ok_or_else(|| BotError::NotFound(format!("pending operation {id}"))),
        }
    }

    fn remove(&self, id: &str) -> Option<PendingOperation> {
        self.lock().remove(id)
    }

    fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut ops = self.lock();
        let before = ops.len();
        ops.retain(|_, op| op.created_at >= cutoff);
        before - ops.len()
    }
}

/// 待确认操作登记表：register / resolve / discard / purge_expired
#[derive(Clone)]
pub struct PendingRegistry {
    store: Arc<dyn PendingStore>,
    ttl: Duration,
}

impl PendingRegistry {
    pub fn new(store: Arc<dyn PendingStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// 内存存储 + 给定 TTL
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryPendingStore::new()), ttl)
    }

    /// 登记新操作，id 形如 `op_<unix纳秒>`，冲突时追加 `_<n>`
    pub fn register(&self, new_op: NewOperation) -> PendingOperation {
        let base = format!("op_{}", unix_nanos());
        let mut op = PendingOperation {
            id: base.clone(),
            user_id: new_op.user_id,
            chat_id: new_op.chat_id,
            request: new_op.request,
            description: new_op.description,
            created_at: Utc::now(),
        };
        let mut n = 1u32;
        while !self.store.insert(op.clone()) {
            op.id = format!("{base}_{n}");
            n += 1;
        }
        tracing::info!(
            op_id = %op.id,
            user_id = op.user_id,
            chat_id = op.chat_id,
            kind = op.kind().as_str(),
            "Pending operation registered"
        );
        op
    }

    /// 处理确认 / 取消。确认时先移除记录再执行，无论执行成败记录都不再存在
    pub async fn resolve(
        &self,
        id: &str,
        user_id: i64,
        decision: Decision,
        executor: &OperationExecutor,
    ) -> Result<Resolution, BotError> {
        self.purge_expired();
        let operation = match self.store.take_owned(id, user_id) {
            Ok(op) => op,
            Err(e) => {
                tracing::warn!(op_id = id, user_id, error = %e, "Pending operation resolution rejected");
                return Err(e);
            }
        };

        match decision {
            Decision::Cancel => {
                tracing::info!(op_id = id, user_id, "Pending operation cancelled");
                Ok(Resolution {
                    operation,
                    decision,
                    outcome: None,
                })
            }
            Decision::Confirm => {
                let outcome = executor.execute(&operation).await;
                tracing::info!(
                    op_id = id,
                    user_id,
                    kind = operation.kind().as_str(),
                    success = outcome.success,
                    "Pending operation executed"
                );
                Ok(Resolution {
                    operation,
                    decision,
                    outcome: Some(outcome),
                })
            }
        }
    }

    /// 丢弃一批记录（脚本失败时撤回其提案）
    pub fn discard(&self, ids: &[String]) -> usize {
        let removed = ids.iter().filter(|id| self.store.remove(id).is_some()).count();
        if removed > 0 {
            tracing::debug!(removed, "Discarded pending operations");
        }
        removed
    }

    /// 清理超过 TTL 的记录
    pub fn purge_expired(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_older_than(cutoff);
        if purged > 0 {
            tracing::info!(purged, "Expired pending operations purged");
        }
        purged
    }

    pub fn contains(&self, id: &str) -> bool {
        self.store.contains(id)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
