//! The four agent roles.
//!
//! [`Agent`] is a tagged variant: each role carries its collaborators and is
//! driven through the single [`Agent::respond`] operation. Model-backed
//! checkers never fail on bad output; an unparseable reply becomes a
//! not-approved [`CheckVerdict`].

mod prompts;
mod verdict;

pub use verdict::{CheckVerdict, parse_answer_check, parse_manager_decision};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::GenerationError;
use crate::links::{self, DynLinkValidator, LinkCheckSettings, LinkReport, extract_urls};
use crate::llm::{Capabilities, ChatMessage, ChatModel, DynChatModel, ModelReply};
use crate::scope::SiteFilters;
use crate::search::{DynSearchProvider, SearchQuery, format_results};
use crate::session::{Exchange, TurnRole};

/// A generated answer and the URLs it cites, in order of appearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<String>,
}

impl Answer {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let citations = extract_urls(&text);
        Self { text, citations }
    }
}

/// Retry policy for throttled or dropped model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
        }
    }
}

/// Everything an agent may look at for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct AgentContext<'a> {
    pub question: &'a str,
    pub focus: &'a str,
    pub history: &'a [Exchange<'a>],
    pub filters: &'a SiteFilters,
    /// Rejected answer from the previous iteration, if any.
    pub previous_answer: Option<&'a Answer>,
    /// Feedback from the previous iteration, if any.
    pub feedback: Option<&'a str>,
    /// Answer under review in the current iteration.
    pub answer: Option<&'a Answer>,
    pub answer_check: Option<&'a CheckVerdict>,
    pub links: Option<&'a LinkReport>,
}

impl<'a> AgentContext<'a> {
    pub fn new(question: &'a str, focus: &'a str, filters: &'a SiteFilters) -> Self {
        Self {
            question,
            focus,
            history: &[],
            filters,
            previous_answer: None,
            feedback: None,
            answer: None,
            answer_check: None,
            links: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Answer(Answer),
    Verdict(CheckVerdict),
    Links(LinkReport),
}

/// What an agent said, and what it means for the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub role: TurnRole,
    pub message: String,
    pub outcome: AgentOutcome,
}

impl AgentResponse {
    fn verdict(role: TurnRole, message: impl Into<String>, verdict: CheckVerdict) -> Self {
        Self {
            role,
            message: message.into(),
            outcome: AgentOutcome::Verdict(verdict),
        }
    }
}

pub enum Agent {
    Answerer {
        model: DynChatModel,
        search: DynSearchProvider,
        max_search_rounds: u32,
        retry: RetryPolicy,
    },
    AnswerChecker {
        model: DynChatModel,
        retry: RetryPolicy,
    },
    LinkChecker {
        validator: DynLinkValidator,
        max_concurrent: usize,
        /// Budget for each URL; an overrun is that URL's verdict, not the stage's.
        link_timeout: Duration,
    },
    Manager {
        model: DynChatModel,
        retry: RetryPolicy,
    },
}

impl Agent {
    pub fn role(&self) -> TurnRole {
        match self {
            Agent::Answerer { .. } => TurnRole::Answerer,
            Agent::AnswerChecker { .. } => TurnRole::Checker,
            Agent::LinkChecker { .. } => TurnRole::LinkChecker,
            Agent::Manager { .. } => TurnRole::Manager,
        }
    }

    /// Tools the underlying model may call. Only the Answerer searches.
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Agent::Answerer { .. } => Capabilities::SEARCH,
            _ => Capabilities::READ_ONLY,
        }
    }

    /// System instruction for model-backed roles.
    pub fn instruction(&self, focus: &str) -> Option<String> {
        match self {
            Agent::Answerer { .. } => Some(prompts::answerer_instruction(focus)),
            Agent::AnswerChecker { .. } => Some(prompts::answer_checker_instruction(focus)),
            Agent::LinkChecker { .. } => None,
            Agent::Manager { .. } => Some(prompts::manager_instruction()),
        }
    }

    /// Run this role against `ctx`.
    ///
    /// Only the Answerer returns `Err`, when no answer text could be produced.
    /// Checkers turn model failures and unparseable replies into rejections.
    #[instrument(skip_all, fields(role = %self.role()))]
    pub async fn respond(&self, ctx: &AgentContext<'_>) -> Result<AgentResponse, GenerationError> {
        match self {
            Agent::Answerer {
                model,
                search,
                max_search_rounds,
                retry,
            } => {
                let text = self
                    .answer(ctx, model.as_ref(), search, *max_search_rounds, retry)
                    .await?;
                Ok(AgentResponse {
                    role: TurnRole::Answerer,
                    message: text.clone(),
                    outcome: AgentOutcome::Answer(Answer::from_text(text)),
                })
            }
            Agent::AnswerChecker { model, retry } => {
                let Some(answer) = ctx.answer else {
                    return Ok(missing_answer(TurnRole::Checker));
                };
                let messages = [
                    ChatMessage::system(prompts::answer_checker_instruction(ctx.focus)),
                    ChatMessage::user(prompts::answer_check_request(ctx.question, answer)),
                ];
                Ok(self
                    .review(model.as_ref(), &messages, retry, "answer checker", parse_answer_check)
                    .await)
            }
            Agent::LinkChecker {
                validator,
                max_concurrent,
                link_timeout,
            } => {
                let citations: &[String] = ctx.answer.map(|a| a.citations.as_slice()).unwrap_or(&[]);
                let report =
                    links::check_all(validator.as_ref(), citations, *max_concurrent, *link_timeout).await;
                debug!(
                    citations = citations.len(),
                    all_valid = report.all_links_valid(),
                    "link check finished"
                );
                Ok(AgentResponse {
                    role: TurnRole::LinkChecker,
                    message: report.summary(),
                    outcome: AgentOutcome::Links(report),
                })
            }
            Agent::Manager { model, retry } => {
                let (Some(answer), Some(check), Some(links)) = (ctx.answer, ctx.answer_check, ctx.links)
                else {
                    return Ok(missing_answer(TurnRole::Manager));
                };
                let messages = [
                    ChatMessage::system(prompts::manager_instruction()),
                    ChatMessage::user(prompts::manager_request(ctx.question, answer, check, links)),
                ];
                Ok(self
                    .review(model.as_ref(), &messages, retry, "manager", parse_manager_decision)
                    .await)
            }
        }
    }

    async fn answer(
        &self,
        ctx: &AgentContext<'_>,
        model: &dyn ChatModel,
        search: &DynSearchProvider,
        max_search_rounds: u32,
        retry: &RetryPolicy,
    ) -> Result<String, GenerationError> {
        let mut messages = vec![
            ChatMessage::system(prompts::answerer_instruction(ctx.focus)),
            ChatMessage::user(prompts::answerer_request(
                ctx.question,
                ctx.history,
                ctx.previous_answer,
                ctx.feedback,
            )),
        ];

        for round in 1..=max_search_rounds {
            match generate(model, &messages, Capabilities::SEARCH, retry).await? {
                ModelReply::Text(text) => return non_empty(text),
                ModelReply::Search(call) => {
                    debug!(round, query = %call.query, up_to_date = call.up_to_date, "answerer requested search");
                    let query = SearchQuery::new(call.query.clone()).up_to_date(call.up_to_date);
                    let content = match search.search(&query, ctx.filters).await {
                        Ok(results) => format_results(&results),
                        Err(err) => {
                            warn!(error = %err, query = %call.query, "search failed; continuing without results");
                            prompts::search_feedback(&err)
                        }
                    };
                    messages.push(ChatMessage::search_request(call.clone()));
                    messages.push(ChatMessage::search_result(call, content));
                }
            }
        }

        messages.push(ChatMessage::user(
            "The search budget for this answer is used up. Write the final answer now from the results above.",
        ));
        match generate(model, &messages, Capabilities::READ_ONLY, retry).await? {
            ModelReply::Text(text) => non_empty(text),
            ModelReply::Search(_) => Err(GenerationError::Malformed(
                "model requested a search after the search budget was used up".to_string(),
            )),
        }
    }

    async fn review(
        &self,
        model: &dyn ChatModel,
        messages: &[ChatMessage],
        retry: &RetryPolicy,
        reviewer: &str,
        parse: fn(&str) -> CheckVerdict,
    ) -> AgentResponse {
        let role = self.role();
        match generate(model, messages, Capabilities::READ_ONLY, retry).await {
            Ok(ModelReply::Text(reply)) => {
                let verdict = parse(&reply);
                if !verdict.approved {
                    debug!(reviewer, feedback = %verdict.feedback, "review rejected the answer");
                }
                AgentResponse::verdict(role, reply, verdict)
            }
            Ok(ModelReply::Search(call)) => {
                warn!(reviewer, query = %call.query, "read-only reviewer attempted a search");
                let verdict = CheckVerdict::unparseable(reviewer);
                AgentResponse::verdict(role, verdict.feedback.clone(), verdict)
            }
            Err(err) => {
                warn!(reviewer, error = %err, "review call failed; treating as not approved");
                let verdict = CheckVerdict::unparseable(reviewer);
                AgentResponse::verdict(role, format!("({err})"), verdict)
            }
        }
    }
}

fn missing_answer(role: TurnRole) -> AgentResponse {
    let verdict = CheckVerdict::reject("There was no answer to review. Please produce an answer.");
    AgentResponse::verdict(role, verdict.feedback.clone(), verdict)
}

fn non_empty(text: String) -> Result<String, GenerationError> {
    if text.trim().is_empty() {
        Err(GenerationError::Empty)
    } else {
        Ok(text)
    }
}

async fn generate(
    model: &dyn ChatModel,
    messages: &[ChatMessage],
    capabilities: Capabilities,
    retry: &RetryPolicy,
) -> Result<ModelReply, GenerationError> {
    let mut attempt = 0;
    let mut backoff = retry.initial_backoff;
    loop {
        match model.generate(messages, capabilities).await {
            Ok(reply) => return Ok(reply),
            Err(err) if attempt < retry.max_retries && err.is_retryable() => {
                attempt += 1;
                warn!(error = %err, attempt, backoff_ms = backoff.as_millis() as u64, "model call failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(retry.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Options shared by the roster's roles.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_search_rounds: u32,
    pub max_concurrent_links: usize,
    pub link_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_search_rounds: 3,
            max_concurrent_links: 8,
            link_timeout: LinkCheckSettings::default().verdict_budget(),
            retry: RetryPolicy::default(),
        }
    }
}

/// One agent per role, as driven by the controller.
pub struct AgentRoster {
    pub answerer: Agent,
    pub answer_checker: Agent,
    pub link_checker: Agent,
    pub manager: Agent,
}

impl AgentRoster {
    /// `manager_model` lets the Manager run on a different (smaller) deployment.
    pub fn new(
        model: DynChatModel,
        manager_model: Option<DynChatModel>,
        search: DynSearchProvider,
        validator: DynLinkValidator,
        options: AgentOptions,
    ) -> Self {
        let manager_model = manager_model.unwrap_or_else(|| model.clone());
        Self {
            answerer: Agent::Answerer {
                model: model.clone(),
                search,
                max_search_rounds: options.max_search_rounds,
                retry: options.retry.clone(),
            },
            answer_checker: Agent::AnswerChecker {
                model,
                retry: options.retry.clone(),
            },
            link_checker: Agent::LinkChecker {
                validator,
                max_concurrent: options.max_concurrent_links,
                link_timeout: options.link_timeout,
            },
            manager: Agent::Manager {
                model: manager_model,
                retry: options.retry,
            },
        }
    }
}
