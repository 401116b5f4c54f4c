//! Shared types, template engine, and grimoire/spell loading for the
//! daemon and control CLI (spec Sections 3, 4.2, 4.4).

pub mod config;
pub mod duration;
pub mod events;
pub mod globmatch;
pub mod grimoire;
pub mod spell;
pub mod template;
pub mod types;

pub use config::Config;
pub use events::{BrokerEvent, EventKind};
pub use grimoire::GrimoireError;
pub use spell::SpellError;
pub use template::{TemplateError, WhenError};
pub use types::{
    AgentRecord, AgentStatus, EventRecord, Grimoire, HistoryEntry, Id, LoopState, OnFail,
    OnMaxIterations, OnSuccess, Question, StepAction, StepDef, StepResult, StepType, Task,
    TaskStatus, WorkflowState, WorkflowStatus,
};
