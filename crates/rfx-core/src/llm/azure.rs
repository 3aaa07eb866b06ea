//! Azure OpenAI chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use super::{Capabilities, ChatMessage, ChatModel, ChatRole, ModelReply, SEARCH_TOOL_NAME, SearchCall};
use crate::error::GenerationError;
use crate::security::SecretValue;
use crate::RfxError;

#[derive(Debug, Clone)]
pub struct AzureOpenAiSettings {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    pub api_key: SecretValue,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

/// One deployment of an Azure OpenAI resource.
pub struct AzureOpenAiClient {
    client: Client,
    settings: AzureOpenAiSettings,
}

impl AzureOpenAiClient {
    pub fn new(settings: AzureOpenAiSettings) -> Result<Self, RfxError> {
        if settings.endpoint.trim().is_empty() {
            return Err(RfxError::InvalidConfiguration(
                "Azure OpenAI endpoint is required".to_string(),
            ));
        }
        if settings.deployment.trim().is_empty() {
            return Err(RfxError::InvalidConfiguration(
                "Azure OpenAI deployment name is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| {
                RfxError::InvalidConfiguration(format!("failed to build model client: {err}"))
            })?;

        Ok(Self { client, settings })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.deployment,
            self.settings.api_version
        )
    }

    fn build_request(&self, messages: &[ChatMessage], capabilities: Capabilities) -> WireRequest {
        let tools = capabilities.web_search.then(|| vec![search_tool_definition()]);
        WireRequest {
            messages: messages.iter().map(WireMessage::from).collect(),
            tool_choice: tools.as_ref().map(|_| "auto"),
            tools,
            temperature: self.settings.temperature,
        }
    }
}

#[async_trait]
impl ChatModel for AzureOpenAiClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        capabilities: Capabilities,
    ) -> Result<ModelReply, GenerationError> {
        debug!(
            deployment = %self.settings.deployment,
            messages = messages.len(),
            web_search = capabilities.web_search,
            "sending chat request to Azure OpenAI"
        );

        let request = self.build_request(messages, capabilities);
        let response = self
            .client
            .post(self.chat_url())
            .header("api-key", self.settings.api_key.expose())
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                error!(error = %err, "failed to send request to Azure OpenAI");
                if err.is_timeout() {
                    GenerationError::Timeout(self.settings.timeout.as_millis() as u64)
                } else {
                    GenerationError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        let payload: WireResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::Malformed(err.to_string()))?;

        convert_response(payload)
    }
}

fn convert_response(payload: WireResponse) -> Result<ModelReply, GenerationError> {
    let message = payload
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| GenerationError::Malformed("response contained no choices".to_string()))?;

    if let Some(call) = message.tool_calls.unwrap_or_default().into_iter().next() {
        if call.function.name != SEARCH_TOOL_NAME {
            return Err(GenerationError::Malformed(format!(
                "model requested unknown tool `{}`",
                call.function.name
            )));
        }
        let arguments: SearchArguments = serde_json::from_str(&call.function.arguments)
            .map_err(|err| GenerationError::Malformed(format!("invalid tool arguments: {err}")))?;
        return Ok(ModelReply::Search(SearchCall {
            call_id: call.id,
            query: arguments.query,
            up_to_date: arguments.up_to_date,
        }));
    }

    match message.content {
        Some(text) if !text.trim().is_empty() => Ok(ModelReply::Text(text)),
        _ => Err(GenerationError::Empty),
    }
}

fn search_tool_definition() -> serde_json::Value {
    json!({
        "type": "function",
        "function": {
            "name": SEARCH_TOOL_NAME,
            "description": "Search the web for current, relevant information. Results are restricted to the selected documentation sites.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query in concise terms"
                    },
                    "up_to_date": {
                        "type": "boolean",
                        "description": "Whether the most recent information is needed"
                    }
                },
                "required": ["query"]
            }
        }
    })
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Serialize)]
struct WireRequest {
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct WireMessage {
    role: ChatRole,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        match (&message.role, &message.search_call) {
            (ChatRole::Assistant, Some(call)) => WireMessage {
                role: ChatRole::Assistant,
                content: None,
                tool_calls: Some(vec![WireToolCall {
                    id: call.call_id.clone(),
                    kind: "function".to_string(),
                    function: WireFunction {
                        name: SEARCH_TOOL_NAME.to_string(),
                        arguments: json!({
                            "query": call.query,
                            "up_to_date": call.up_to_date,
                        })
                        .to_string(),
                    },
                }]),
                tool_call_id: None,
            },
            (ChatRole::Tool, call) => WireMessage {
                role: ChatRole::Tool,
                content: Some(message.content.clone()),
                tool_calls: None,
                tool_call_id: call.as_ref().map(|call| call.call_id.clone()),
            },
            (role, _) => WireMessage {
                role: *role,
                content: Some(message.content.clone()),
                tool_calls: None,
                tool_call_id: None,
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "default_tool_kind")]
    kind: String,
    function: WireFunction,
}

fn default_tool_kind() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct SearchArguments {
    query: String,
    #[serde(default)]
    up_to_date: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(endpoint: &str) -> AzureOpenAiClient {
        AzureOpenAiClient::new(AzureOpenAiSettings {
            endpoint: endpoint.to_string(),
            deployment: "gpt-4o".to_string(),
            api_version: "2024-06-01".to_string(),
            api_key: SecretValue::new("test-key"),
            timeout: Duration::from_secs(5),
            temperature: None,
        })
        .expect("client")
    }

    async fn mount(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt-4o/chat/completions"))
            .and(query_param("api-version", "2024-06-01"))
            .and(header("api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn text_reply_is_returned() {
        let server = MockServer::start().await;
        mount(
            &server,
            json!({"choices": [{"message": {"role": "assistant", "content": "ANSWER CORRECT"}}]}),
        )
        .await;

        let reply = client(&server.uri())
            .generate(&[ChatMessage::user("check this")], Capabilities::READ_ONLY)
            .await
            .expect("reply");
        assert_eq!(reply, ModelReply::Text("ANSWER CORRECT".to_string()));

        let requests = server.received_requests().await.expect("recording enabled");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn tool_call_becomes_search_request() {
        let server = MockServer::start().await;
        mount(
            &server,
            json!({"choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "web_search", "arguments": "{\"query\":\"fabric capacity units\"}"}
                }]
            }}]}),
        )
        .await;

        let reply = client(&server.uri())
            .generate(&[ChatMessage::user("question")], Capabilities::SEARCH)
            .await
            .expect("reply");
        assert_eq!(
            reply,
            ModelReply::Search(SearchCall {
                call_id: "call_1".to_string(),
                query: "fabric capacity units".to_string(),
                up_to_date: false,
            })
        );

        let requests = server.received_requests().await.expect("recording enabled");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], SEARCH_TOOL_NAME);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .generate(&[ChatMessage::user("q")], Capabilities::READ_ONLY)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Status { status: 429, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_or_garbled_replies_are_errors() {
        let server = MockServer::start().await;
        mount(&server, json!({"choices": [{"message": {"content": "   "}}]})).await;
        let err = client(&server.uri())
            .generate(&[ChatMessage::user("q")], Capabilities::READ_ONLY)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Empty));

        let garbled = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&garbled)
            .await;
        let err = client(&garbled.uri())
            .generate(&[ChatMessage::user("q")], Capabilities::READ_ONLY)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Malformed(_)));
    }

    #[test]
    fn tool_round_trip_messages_serialize_for_the_wire() {
        let call = SearchCall {
            call_id: "call_9".to_string(),
            query: "copilot studio licensing".to_string(),
            up_to_date: true,
        };
        let request = WireMessage::from(&ChatMessage::search_request(call.clone()));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["tool_calls"][0]["id"], "call_9");

        let result = WireMessage::from(&ChatMessage::search_result(call, "1. content: ..."));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_9");
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let result = AzureOpenAiClient::new(AzureOpenAiSettings {
            endpoint: " ".to_string(),
            deployment: "gpt-4o".to_string(),
            api_version: "2024-06-01".to_string(),
            api_key: SecretValue::new("k"),
            timeout: Duration::from_secs(1),
            temperature: None,
        });
        assert!(result.is_err());
    }
}
