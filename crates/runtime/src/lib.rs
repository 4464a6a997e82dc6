//! Orchestration: the [`Engine`] owns every capability, runs the per-turn
//! flow, and bounds background observer tasks.

mod conversation;
mod engine;
mod prompt;

pub use conversation::{ConversationLog, LogRecord};
pub use engine::{Engine, EngineStats};
pub use prompt::build_system_prompt;
