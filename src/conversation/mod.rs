//! 对话层：Planner、System prompt、续写循环与 Assistant 入口

pub mod handler;
pub mod loop_;
pub mod planner;
pub mod prompt;

pub use handler::{Assistant, CallbackOutcome, IncomingMessage};
pub use loop_::{ContinuationLoop, TurnOutcome, TurnReport, TurnState};
pub use planner::{parse_generation, Generation, Planner};
pub use prompt::{build_system_prompt, SystemPrompt};
