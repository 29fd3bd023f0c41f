//! 脚本沙箱：能力面、QuickJS 绑定、网络请求、Syntax Guard 与执行器
//!
//! 生成的代码只能通过 HostApi 访问宿主；每次调用都是全新的解释器实例。

pub mod bindings;
pub mod fetch;
pub mod guard;
pub mod host;
pub mod runtime;

pub use fetch::{FetchOptions, FetchResponse, Fetcher};
pub use guard::GuardReport;
pub use host::{HostApi, Identity, ScriptArg};
pub use runtime::{Invocation, Sandbox, ScriptResult};
