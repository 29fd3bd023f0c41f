//! 待确认操作：类型、登记表、确认后执行、按钮回调协议
//!
//! 写能力只生成提案并登记；真正的修改在用户点击确认后由 OperationExecutor 完成。

pub mod callback;
pub mod executor;
pub mod registry;
pub mod types;

pub use callback::CallbackAction;
pub use executor::OperationExecutor;
pub use registry::{InMemoryPendingStore, PendingRegistry, PendingStore};
pub use types::{
    Button, Decision, NewOperation, OperationKind, OperationOutcome, OperationRequest,
    PendingOperation, ProjectUpdateOptions, Proposal, Resolution, TaskCreateOptions,
    TaskListFilter, TaskUpdateOptions,
};
