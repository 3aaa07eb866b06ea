//! Scripted collaborators for driving the controller without a network.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rfx_core::llm::{Capabilities, ChatMessage, ChatModel, ModelReply, SearchCall};
use rfx_core::search::{SearchProvider, SearchQuery, SearchResult};
use rfx_core::{
    AgentOptions, AgentRoster, ControllerOptions, GenerationError, LinkReason, LinkValidator,
    LinkVerdict, OrchestrationController, RetryPolicy, SearchError, SiteFilters,
};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Answerer,
    Checker,
    Manager,
}

impl Role {
    fn of(messages: &[ChatMessage]) -> Role {
        let system = messages.first().map(|m| m.content.as_str()).unwrap_or_default();
        if system.starts_with("You verify answers") {
            Role::Checker
        } else if system.contains("final sign-off") {
            Role::Manager
        } else {
            Role::Answerer
        }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Say(String),
    Search(String),
    Fail,
    Hang,
}

pub fn say(text: &str) -> Step {
    Step::Say(text.to_string())
}

/// A model whose replies are scripted per role. An exhausted script fails the call.
#[derive(Default)]
pub struct ScriptedModel {
    answerer: Mutex<VecDeque<Step>>,
    checker: Mutex<VecDeque<Step>>,
    manager: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(Role, Vec<ChatMessage>)>>,
}

impl ScriptedModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, role: Role, steps: impl IntoIterator<Item = Step>) -> &Self {
        self.queue(role).lock().unwrap().extend(steps);
        self
    }

    fn queue(&self, role: Role) -> &Mutex<VecDeque<Step>> {
        match role {
            Role::Answerer => &self.answerer,
            Role::Checker => &self.checker,
            Role::Manager => &self.manager,
        }
    }

    pub fn calls(&self, role: Role) -> Vec<Vec<ChatMessage>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, messages)| messages.clone())
            .collect()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _capabilities: Capabilities,
    ) -> Result<ModelReply, GenerationError> {
        let role = Role::of(messages);
        self.calls.lock().unwrap().push((role, messages.to_vec()));
        let step = self.queue(role).lock().unwrap().pop_front();
        match step {
            Some(Step::Say(text)) => Ok(ModelReply::Text(text)),
            Some(Step::Search(query)) => Ok(ModelReply::Search(SearchCall {
                call_id: format!("call-{query}"),
                query,
                up_to_date: false,
            })),
            Some(Step::Fail) | None => Err(GenerationError::Malformed("scripted failure".into())),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Search that records the filters it was called with.
#[derive(Default)]
pub struct RecordingSearch {
    pub results: Vec<SearchResult>,
    pub seen: Mutex<Vec<(SearchQuery, SiteFilters)>>,
}

#[async_trait]
impl SearchProvider for RecordingSearch {
    async fn search(
        &self,
        query: &SearchQuery,
        filters: &SiteFilters,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.seen.lock().unwrap().push((query.clone(), filters.clone()));
        if self.results.is_empty() {
            Err(SearchError::NoResults)
        } else {
            Ok(self.results.clone())
        }
    }
}

/// Every URL is reachable unless listed as dead.
#[derive(Default)]
pub struct FakeLinks {
    dead: HashSet<String>,
    pub checks: AtomicUsize,
}

impl FakeLinks {
    pub fn with_dead(urls: &[&str]) -> Self {
        Self {
            dead: urls.iter().map(|url| url.to_string()).collect(),
            checks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LinkValidator for FakeLinks {
    async fn validate(&self, url: &str) -> LinkVerdict {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.dead.contains(url) {
            LinkVerdict::unreachable(url, LinkReason::NotFound, "HTTP 404").with_status(404)
        } else {
            LinkVerdict::reachable(url, 200)
        }
    }
}

/// Signals when a check starts, then never completes. Records whether the
/// in-flight check was dropped.
#[derive(Default)]
pub struct StalledLinks {
    pub started: Arc<Notify>,
    pub abandoned: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkValidator for StalledLinks {
    async fn validate(&self, _url: &str) -> LinkVerdict {
        let _flag = DropFlag(self.abandoned.clone());
        self.started.notify_one();
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Reachable, except that URLs listed as stalled never get a verdict.
#[derive(Default)]
pub struct HangingLinks {
    stalled: HashSet<String>,
}

impl HangingLinks {
    pub fn stalling(urls: &[&str]) -> Self {
        Self {
            stalled: urls.iter().map(|url| url.to_string()).collect(),
        }
    }
}

#[async_trait]
impl LinkValidator for HangingLinks {
    async fn validate(&self, url: &str) -> LinkVerdict {
        if self.stalled.contains(url) {
            std::future::pending::<()>().await;
        }
        LinkVerdict::reachable(url, 200)
    }
}

pub fn options(max_iterations: u32) -> ControllerOptions {
    ControllerOptions {
        max_iterations,
        agent_timeout: Duration::from_secs(30),
        history_window: 5,
        expose_monologue: true,
    }
}

pub fn controller(
    model: Arc<ScriptedModel>,
    search: Arc<dyn SearchProvider>,
    links: Arc<dyn LinkValidator>,
    options: ControllerOptions,
) -> OrchestrationController {
    let agents = AgentRoster::new(
        model,
        None,
        search,
        links,
        AgentOptions {
            max_search_rounds: 2,
            max_concurrent_links: 4,
            link_timeout: Duration::from_secs(5),
            retry: RetryPolicy::none(),
        },
    );
    OrchestrationController::new(agents, options)
}
