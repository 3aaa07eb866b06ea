//! Conversation history for one chat session.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scope::{ResearchContext, SiteFilters, focus_phrase, scope};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnRole {
    User,
    Answerer,
    Checker,
    LinkChecker,
    Manager,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Answerer => "answerer",
            TurnRole::Checker => "checker",
            TurnRole::LinkChecker => "link-checker",
            TurnRole::Manager => "manager",
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single utterance. Fields are private so a turn cannot change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    role: TurnRole,
    content: String,
    timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn role(&self) -> TurnRole {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A completed question/answer pair drawn from the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange<'a> {
    pub question: &'a str,
    pub answer: &'a str,
}

/// Ordered, append-only turn history plus the user's research selection.
///
/// Only the orchestration controller appends turns; callers own the session's
/// lifetime and hand it to the controller by `&mut` for each question, which
/// keeps a single question in flight per session.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    id: String,
    turns: Vec<ConversationTurn>,
    contexts: BTreeSet<ResearchContext>,
}

impl ConversationSession {
    pub fn new(contexts: BTreeSet<ResearchContext>) -> Self {
        Self::with_id(format!("session-{}", Uuid::new_v4()), contexts)
    }

    pub fn with_id(id: impl Into<String>, contexts: BTreeSet<ResearchContext>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
            contexts,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn contexts(&self) -> &BTreeSet<ResearchContext> {
        &self.contexts
    }

    pub fn set_contexts(&mut self, contexts: BTreeSet<ResearchContext>) {
        self.contexts = contexts;
    }

    pub fn site_filters(&self) -> SiteFilters {
        scope(&self.contexts)
    }

    pub fn focus(&self) -> String {
        focus_phrase(&self.contexts)
    }

    pub(crate) fn append(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    /// The most recent `limit` user questions paired with the answer that followed.
    /// Unanswered questions are skipped.
    pub fn recent_exchanges(&self, limit: usize) -> Vec<Exchange<'_>> {
        let mut exchanges: Vec<Exchange<'_>> = self
            .turns
            .windows(2)
            .filter(|pair| pair[0].role == TurnRole::User && pair[1].role == TurnRole::Answerer)
            .map(|pair| Exchange {
                question: &pair[0].content,
                answer: &pair[1].content,
            })
            .collect();
        let skip = exchanges.len().saturating_sub(limit);
        exchanges.drain(..skip);
        exchanges
    }
}
