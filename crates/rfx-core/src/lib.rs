//! Multi-agent answer verification for technical questionnaires.
//!
//! An [`OrchestrationController`] drives each question through an Answerer,
//! an AnswerChecker, a LinkChecker and a Manager, looping with feedback until
//! the answer is approved or the iteration cap is reached.

pub mod agents;
pub mod config;
pub mod error;
pub mod events;
pub mod links;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod scope;
pub mod search;
pub mod security;
pub mod session;
pub mod telemetry;

mod eval;
mod logging;
mod trace;
mod workflow;

pub use agents::{Agent, AgentOptions, AgentRoster, Answer, CheckVerdict, RetryPolicy};
pub use config::{Config, ConfigLoader};
pub use error::{CycleError, GenerationError, RfxError, SearchError};
pub use eval::{EvaluationHarness, EvaluationMetrics};
pub use events::{CycleEvent, CycleStatus, EventCollector};
pub use links::{HttpLinkValidator, LinkCheckSettings, LinkReason, LinkReport, LinkValidator, LinkVerdict};
pub use logging::{CycleLog, CycleLogEntry};
pub use orchestrator::{
    ControllerOptions, CycleFailure, CycleReport, CycleStage, CycleState, OrchestrationController,
};
pub use scope::{ResearchContext, SiteFilters, focus_phrase, scope};
pub use security::{SecretValue, require_env};
pub use session::{ConversationSession, ConversationTurn, TurnRole};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{Monologue, MonologueStep, persist_monologue};
pub use workflow::{
    ControllerSetup, build_controller, build_link_validator, build_models, build_search,
    controller_with, resolve_contexts,
};

pub use tokio_util::sync::CancellationToken;
