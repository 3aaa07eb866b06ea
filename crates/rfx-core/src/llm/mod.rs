//! Conversational model seam.
//!
//! Agents talk to a [`ChatModel`]; the production implementation is
//! [`AzureOpenAiClient`]. A model reply is either final text or a request to
//! run the web-search tool, which the calling agent resolves.

mod azure;

pub use azure::{AzureOpenAiClient, AzureOpenAiSettings};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

pub const SEARCH_TOOL_NAME: &str = "web_search";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A search invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCall {
    pub call_id: String,
    pub query: String,
    #[serde(default)]
    pub up_to_date: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Set on assistant messages that requested a tool call, and on the tool
    /// message answering it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_call: Option<SearchCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn search_request(call: SearchCall) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: String::new(),
            search_call: Some(call),
        }
    }

    pub fn search_result(call: SearchCall, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            search_call: Some(call),
        }
    }

    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            search_call: None,
        }
    }
}

/// Tools the model may invoke on this call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub web_search: bool,
}

impl Capabilities {
    pub const READ_ONLY: Capabilities = Capabilities { web_search: false };
    pub const SEARCH: Capabilities = Capabilities { web_search: true };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    Text(String),
    Search(SearchCall),
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        capabilities: Capabilities,
    ) -> Result<ModelReply, GenerationError>;
}

pub type DynChatModel = Arc<dyn ChatModel>;
