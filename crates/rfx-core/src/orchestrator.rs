//! Bounded state machine that drives one question through the four agents.
//!
//! ```text
//! AwaitingAnswer -> CheckingAnswer -> CheckingLinks -> AwaitingManagerDecision -> Approved
//!        ^               |                 |                     |
//!        +---------------+-----------------+---------------------+  (rejected, under cap)
//!                                                                    -> Failed (at cap)
//! ```
//!
//! Every rejection, whatever stage raised it, consumes the same iteration
//! budget. The session is only written to once the cycle is terminal.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agents::{Agent, AgentContext, AgentOutcome, AgentResponse, AgentRoster, Answer, CheckVerdict};
use crate::error::{CycleError, GenerationError};
use crate::events::{CycleEvent, CycleStatus, EventCollector};
use crate::links::LinkReport;
use crate::logging::{CycleLog, CycleLogEntry};
use crate::session::{ConversationSession, ConversationTurn, TurnRole};

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    AwaitingAnswer,
    CheckingAnswer,
    CheckingLinks,
    AwaitingManagerDecision,
    Approved,
    Failed,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::AwaitingAnswer => "awaiting_answer",
            CycleStage::CheckingAnswer => "checking_answer",
            CycleStage::CheckingLinks => "checking_links",
            CycleStage::AwaitingManagerDecision => "awaiting_manager_decision",
            CycleStage::Approved => "approved",
            CycleStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStage::Approved | CycleStage::Failed)
    }
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub iteration: u32,
    /// Stage that rejected the iteration.
    pub rejected_at: CycleStage,
    pub answer: Option<Answer>,
    pub feedback: String,
}

/// Per-question working state, owned by the controller for the life of one cycle.
#[derive(Debug, Clone)]
pub struct CycleState {
    iteration: u32,
    max_iterations: u32,
    stage: CycleStage,
    last_answer: Option<Answer>,
    last_feedback: Option<String>,
    attempts: Vec<Attempt>,
}

impl CycleState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 1,
            max_iterations: max_iterations.max(1),
            stage: CycleStage::AwaitingAnswer,
            last_answer: None,
            last_feedback: None,
            attempts: Vec::new(),
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn stage(&self) -> CycleStage {
        self.stage
    }

    pub fn last_answer(&self) -> Option<&Answer> {
        self.last_answer.as_ref()
    }

    pub fn last_feedback(&self) -> Option<&str> {
        self.last_feedback.as_deref()
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    fn advance(&mut self, next: CycleStage) {
        debug_assert!(!self.stage.is_terminal());
        self.stage = next;
    }

    /// Record a rejection and move to the next iteration, or to `Failed` at the cap.
    fn reject(&mut self, answer: Option<Answer>, feedback: String) {
        let rejected_at = self.stage;
        self.attempts.push(Attempt {
            iteration: self.iteration,
            rejected_at,
            answer: answer.clone(),
            feedback: feedback.clone(),
        });
        if answer.is_some() {
            self.last_answer = answer;
        }
        self.last_feedback = Some(feedback);

        if self.iteration < self.max_iterations {
            self.iteration += 1;
            self.stage = CycleStage::AwaitingAnswer;
        } else {
            self.stage = CycleStage::Failed;
        }
    }

    fn approve(&mut self, answer: Answer) {
        self.last_answer = Some(answer);
        self.stage = CycleStage::Approved;
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub max_iterations: u32,
    /// Upper bound for a single model-backed agent invocation. Link checks are
    /// bounded per URL instead.
    pub agent_timeout: Duration,
    /// Question/answer exchanges of earlier cycles shown to the Answerer.
    pub history_window: usize,
    /// Include intermediate agent messages in reports.
    pub expose_monologue: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            agent_timeout: Duration::from_secs(120),
            history_window: 5,
            expose_monologue: false,
        }
    }
}

/// An approved answer.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub session_id: String,
    pub answer: Answer,
    pub iterations: u32,
    pub attempts: Vec<Attempt>,
    /// Intermediate agent messages; empty unless monologue exposure is enabled.
    pub monologue: Vec<ConversationTurn>,
}

/// A cycle that ran out of iterations.
#[derive(Debug, Clone)]
pub struct CycleFailure {
    pub session_id: String,
    pub iterations: u32,
    pub objections: Vec<String>,
    pub last_answer: Option<Answer>,
    pub monologue: Vec<ConversationTurn>,
}

impl CycleFailure {
    /// Human-readable account of why no answer was approved.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "No answer was approved after {} iteration(s). Outstanding objections:",
            self.iterations
        )];
        for (index, objection) in self.objections.iter().enumerate() {
            lines.push(format!("{}. {objection}", index + 1));
        }
        lines.join("\n")
    }
}

enum CycleOutcome {
    Approved(CycleReport),
    Failed(CycleFailure),
}

pub struct OrchestrationController {
    agents: AgentRoster,
    options: ControllerOptions,
    events: Option<EventCollector>,
    cycle_log: Option<CycleLog>,
}

impl OrchestrationController {
    pub fn new(agents: AgentRoster, options: ControllerOptions) -> Self {
        Self {
            agents,
            options,
            events: None,
            cycle_log: None,
        }
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cycle_log(mut self, cycle_log: CycleLog) -> Self {
        self.cycle_log = Some(cycle_log);
        self
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn set_expose_monologue(&mut self, expose: bool) {
        self.options.expose_monologue = expose;
    }

    /// Answer `question` within `session`.
    ///
    /// On approval the session gains the question and the answer; on failure
    /// only the question; on cancellation nothing.
    #[instrument(
        skip(self, session, question, cancel),
        fields(session_id = %session.id(), max_iterations = self.options.max_iterations)
    )]
    pub async fn ask(
        &self,
        session: &mut ConversationSession,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        info!("question received");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = self.run_cycle(session, question) => Some(outcome),
        };

        match outcome {
            None => {
                info!("cycle cancelled; session left unchanged");
                self.emit(CycleEvent::Finished {
                    session_id: session.id().to_string(),
                    iterations: 0,
                    status: CycleStatus::Cancelled,
                });
                Err(CycleError::Cancelled)
            }
            Some(CycleOutcome::Approved(report)) => {
                session.append(ConversationTurn::new(TurnRole::User, question));
                session.append(ConversationTurn::new(TurnRole::Answerer, report.answer.text.clone()));
                info!(iterations = report.iterations, citations = report.answer.citations.len(), "answer approved");
                self.finish(CycleLogEntry {
                    session_id: report.session_id.clone(),
                    question: question.to_string(),
                    status: CycleStatus::Approved,
                    iterations: report.iterations,
                    answer: Some(report.answer.text.clone()),
                    citations: report.answer.citations.clone(),
                    objections: report.attempts.iter().map(|a| a.feedback.clone()).collect(),
                })
                .await;
                Ok(report)
            }
            Some(CycleOutcome::Failed(failure)) => {
                session.append(ConversationTurn::new(TurnRole::User, question));
                warn!(
                    iterations = failure.iterations,
                    objections = failure.objections.len(),
                    "no answer approved within the iteration cap"
                );
                self.finish(CycleLogEntry {
                    session_id: failure.session_id.clone(),
                    question: question.to_string(),
                    status: CycleStatus::Failed,
                    iterations: failure.iterations,
                    answer: failure.last_answer.as_ref().map(|a| a.text.clone()),
                    citations: failure
                        .last_answer
                        .as_ref()
                        .map(|a| a.citations.clone())
                        .unwrap_or_default(),
                    objections: failure.objections.clone(),
                })
                .await;
                Err(CycleError::IterationExhausted(Box::new(failure)))
            }
        }
    }

    async fn run_cycle(&self, session: &ConversationSession, question: &str) -> CycleOutcome {
        let session_id = session.id().to_string();
        let focus = session.focus();
        let filters = session.site_filters();
        let history = session.recent_exchanges(self.options.history_window);

        let mut state = CycleState::new(self.options.max_iterations);
        let mut monologue: Vec<ConversationTurn> = Vec::new();
        let mut current: Option<Answer> = None;
        let mut answer_check: Option<CheckVerdict> = None;
        let mut links: Option<LinkReport> = None;

        loop {
            let stage = state.stage();
            self.emit(CycleEvent::StageEntered {
                session_id: session_id.clone(),
                iteration: state.iteration(),
                stage,
            });
            debug!(iteration = state.iteration(), %stage, "entering stage");

            let mut ctx = AgentContext::new(question, &focus, &filters);
            ctx.history = &history;

            match stage {
                CycleStage::AwaitingAnswer => {
                    answer_check = None;
                    links = None;
                    ctx.previous_answer = state.last_answer();
                    ctx.feedback = state.last_feedback();
                    match self.invoke(&self.agents.answerer, &ctx).await {
                        Ok(AgentResponse {
                            role,
                            message,
                            outcome: AgentOutcome::Answer(answer),
                        }) => {
                            self.note(&session_id, &state, &mut monologue, role, message);
                            current = Some(answer);
                            state.advance(CycleStage::CheckingAnswer);
                        }
                        Ok(other) => {
                            warn!(role = %other.role, "answerer returned an unexpected outcome");
                            state.reject(None, retry_request("The answer could not be produced"));
                        }
                        Err(err) => {
                            warn!(error = %err, iteration = state.iteration(), "answer generation failed");
                            self.note(&session_id, &state, &mut monologue, TurnRole::Answerer, format!("({err})"));
                            state.reject(None, retry_request(&format!("The answer could not be produced ({err})")));
                        }
                    }
                }
                CycleStage::CheckingAnswer => {
                    ctx.answer = current.as_ref();
                    let verdict = self
                        .review(&self.agents.answer_checker, &ctx, &session_id, &state, &mut monologue)
                        .await;
                    if verdict.approved {
                        answer_check = Some(verdict);
                        state.advance(CycleStage::CheckingLinks);
                    } else {
                        state.reject(current.take(), verdict.feedback);
                    }
                }
                CycleStage::CheckingLinks => {
                    ctx.answer = current.as_ref();
                    // Bounded per URL inside the link checker, so no stage-wide timeout.
                    let report = match self.agents.link_checker.respond(&ctx).await {
                        Ok(AgentResponse {
                            role,
                            message,
                            outcome: AgentOutcome::Links(report),
                        }) => {
                            self.note(&session_id, &state, &mut monologue, role, message);
                            Some(report)
                        }
                        Ok(_) => None,
                        Err(err) => {
                            warn!(error = %err, "link check did not complete");
                            self.note(&session_id, &state, &mut monologue, TurnRole::LinkChecker, format!("({err})"));
                            None
                        }
                    };
                    match report {
                        Some(report) if report.all_links_valid() => {
                            links = Some(report);
                            state.advance(CycleStage::AwaitingManagerDecision);
                        }
                        Some(report) => {
                            for verdict in report.invalid() {
                                info!(url = %verdict.url, reason = verdict.reason.as_str(), "citation unreachable");
                            }
                            state.reject(current.take(), report.feedback());
                        }
                        None => state.reject(
                            current.take(),
                            retry_request("The cited links could not be checked"),
                        ),
                    }
                }
                CycleStage::AwaitingManagerDecision => {
                    ctx.answer = current.as_ref();
                    ctx.answer_check = answer_check.as_ref();
                    ctx.links = links.as_ref();
                    let verdict = self
                        .review(&self.agents.manager, &ctx, &session_id, &state, &mut monologue)
                        .await;
                    let all_checks_pass = verdict.approved
                        && answer_check.as_ref().is_some_and(|check| check.approved)
                        && links.as_ref().is_some_and(LinkReport::all_links_valid);
                    match current.take() {
                        Some(answer) if all_checks_pass => state.approve(answer),
                        answer => state.reject(answer, verdict.feedback),
                    }
                }
                CycleStage::Approved => {
                    let Some(answer) = state.last_answer.take() else {
                        // approve() always stores the answer
                        state.stage = CycleStage::Failed;
                        continue;
                    };
                    return CycleOutcome::Approved(CycleReport {
                        session_id,
                        answer,
                        iterations: state.iteration,
                        attempts: state.attempts,
                        monologue: self.exposed(monologue),
                    });
                }
                CycleStage::Failed => {
                    return CycleOutcome::Failed(CycleFailure {
                        session_id,
                        iterations: state.iteration,
                        objections: state.attempts.into_iter().map(|attempt| attempt.feedback).collect(),
                        last_answer: state.last_answer,
                        monologue: self.exposed(monologue),
                    });
                }
            }
        }
    }

    async fn invoke(&self, agent: &Agent, ctx: &AgentContext<'_>) -> Result<AgentResponse, GenerationError> {
        match tokio::time::timeout(self.options.agent_timeout, agent.respond(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(role = %agent.role(), timeout_ms = self.options.agent_timeout.as_millis() as u64, "agent timed out");
                Err(GenerationError::Timeout(self.options.agent_timeout.as_millis() as u64))
            }
        }
    }

    /// Run a checker role. Anything but an explicit approval is a rejection.
    async fn review(
        &self,
        agent: &Agent,
        ctx: &AgentContext<'_>,
        session_id: &str,
        state: &CycleState,
        monologue: &mut Vec<ConversationTurn>,
    ) -> CheckVerdict {
        let role = agent.role();
        match self.invoke(agent, ctx).await {
            Ok(AgentResponse {
                role,
                message,
                outcome: AgentOutcome::Verdict(verdict),
            }) => {
                self.note(session_id, state, monologue, role, message);
                verdict
            }
            Ok(other) => {
                self.note(session_id, state, monologue, other.role, other.message);
                CheckVerdict::unparseable(role.as_str())
            }
            Err(err) => {
                self.note(session_id, state, monologue, role, format!("({err})"));
                CheckVerdict::unparseable(role.as_str())
            }
        }
    }

    fn note(
        &self,
        session_id: &str,
        state: &CycleState,
        monologue: &mut Vec<ConversationTurn>,
        role: TurnRole,
        message: String,
    ) {
        self.emit(CycleEvent::AgentMessage {
            session_id: session_id.to_string(),
            iteration: state.iteration(),
            role,
            content: message.clone(),
        });
        monologue.push(ConversationTurn::new(role, message));
    }

    fn exposed(&self, monologue: Vec<ConversationTurn>) -> Vec<ConversationTurn> {
        if self.options.expose_monologue {
            monologue
        } else {
            Vec::new()
        }
    }

    fn emit(&self, event: CycleEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    async fn finish(&self, entry: CycleLogEntry) {
        crate::metrics::record_cycle(entry.status.as_str(), entry.iterations);
        self.emit(CycleEvent::Finished {
            session_id: entry.session_id.clone(),
            iterations: entry.iterations,
            status: entry.status,
        });
        let Some(log) = self.cycle_log.clone() else {
            return;
        };
        // File appends and retention pruning block; keep them off the runtime threads.
        match tokio::task::spawn_blocking(move || log.record(&entry)).await {
            Ok(Ok(path)) => debug!(path = %path.display(), "cycle logged"),
            Ok(Err(err)) => warn!(error = %err, "failed to write cycle log"),
            Err(err) => warn!(error = %err, "cycle log task did not complete"),
        }
    }
}

fn retry_request(reason: &str) -> String {
    format!("{reason}. Please retry and answer the question again.")
}
