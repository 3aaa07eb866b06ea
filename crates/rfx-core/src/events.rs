//! Live progress of a question cycle.
//!
//! The controller emits [`CycleEvent`]s through an [`EventCollector`] so a host
//! can render progress while the cycle is still running.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::orchestrator::CycleStage;
use crate::session::TurnRole;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    /// The state machine entered a stage.
    StageEntered {
        session_id: String,
        iteration: u32,
        stage: CycleStage,
    },
    /// An agent produced its message for this iteration.
    AgentMessage {
        session_id: String,
        iteration: u32,
        role: TurnRole,
        content: String,
    },
    /// The cycle reached a terminal state or was cancelled.
    Finished {
        session_id: String,
        iterations: u32,
        status: CycleStatus,
    },
}

impl CycleEvent {
    pub fn session_id(&self) -> &str {
        match self {
            CycleEvent::StageEntered { session_id, .. }
            | CycleEvent::AgentMessage { session_id, .. }
            | CycleEvent::Finished { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Approved,
    Failed,
    Cancelled,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Approved => "approved",
            CycleStatus::Failed => "failed",
            CycleStatus::Cancelled => "cancelled",
        }
    }
}

/// Sending half handed to the controller. Cloning shares the channel.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<CycleEvent>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Publish an event. A dropped receiver is not an error for the cycle.
    pub fn emit(&self, event: CycleEvent) {
        if let Err(err) = self.sender.send(event) {
            tracing::trace!(error = %err, "cycle event receiver dropped");
        }
    }
}
