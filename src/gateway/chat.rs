//! OpenAI-compatible chat completions with per-tool authorization.
//!
//! Before a model runs, every auth-requiring tool it may call gets a
//! credential from [`ToolAuthManager`], one tool at a time. If any of them
//! needs a login, the whole turn is answered with an assistant message
//! carrying the login link instead of an HTTP error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::auth_info::AuthInformation;
use super::mcp::RemoteToolClient;
use crate::auth::{AuthFailure, AuthorizationNeeded, Credential, ToolAuthManager};
use crate::config::{Config, ModelConfig, ToolConfig};
use crate::{Error, Result};

/// Upper bound on model → remote tool → model round trips per request.
const MAX_TOOL_ROUNDS: usize = 5;

// ============================================================================
// Wire types
// ============================================================================

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, `assistant` or `tool`
    pub role: String,
    /// String or content-part array
    #[serde(default)]
    pub content: Value,
    /// Tool calls requested by the assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call answered by a `tool` message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Fields passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Assistant message with plain text content.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", Value::String(content.into()))
    }

    /// Result of tool call `call_id`.
    #[must_use]
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::with_role("tool", Value::String(content.into()));
        message.tool_call_id = Some(call_id.into());
        message
    }

    fn with_role(role: &str, content: Value) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            extra: Map::new(),
        }
    }

    /// Text content, joining the `text` parts of an array.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, echoed by the tool result message
    pub id: String,
    /// Always `function`
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    /// Function name and JSON-encoded arguments
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

/// Function name plus arguments as a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Tool name
    pub name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    pub arguments: String,
}

/// `POST /v1/chat/completions` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Gateway model id
    pub model: String,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Answer as server-sent events
    #[serde(default)]
    pub stream: bool,
    /// Sampling parameters, tool definitions and the rest, passed through
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One completion choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Position in `choices`
    #[serde(default)]
    pub index: u32,
    /// Generated message
    pub message: ChatMessage,
    /// `stop`, `tool_calls`, ...
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Non-streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Completion id
    pub id: String,
    /// Always `chat.completion`
    #[serde(default = "completion_object")]
    pub object: String,
    /// Unix seconds
    #[serde(default)]
    pub created: i64,
    /// Model id reported to the client
    pub model: String,
    /// Generated choices
    pub choices: Vec<Choice>,
    /// Token accounting from the upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

fn completion_object() -> String {
    "chat.completion".to_string()
}

impl ChatCompletionResponse {
    /// Single-choice completion whose content is `content`.
    #[must_use]
    pub fn assistant(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: completion_object(),
            created: Utc::now().timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant(content),
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        }
    }

    /// First choice's message.
    #[must_use]
    pub fn message(&self) -> Option<&ChatMessage> {
        self.choices.first().map(|c| &c.message)
    }

    /// The whole completion as streaming chunks, one per choice.
    #[must_use]
    pub fn into_chunks(self) -> Vec<ChatCompletionChunk> {
        self.choices
            .into_iter()
            .map(|choice| ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![ChunkChoice {
                    index: choice.index,
                    delta: choice.message,
                    finish_reason: choice.finish_reason,
                }],
            })
            .collect()
    }
}

/// One server-sent event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion id, shared by all chunks
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Model id
    pub model: String,
    /// Deltas
    pub choices: Vec<ChunkChoice>,
}

/// Delta for one choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// Message delta
    pub delta: ChatMessage,
    /// Set on the final chunk of a choice
    pub finish_reason: Option<String>,
}

// ============================================================================
// Backends
// ============================================================================

/// Per-request inputs a backend may need besides the request body.
#[derive(Debug, Clone, Default)]
pub struct CompletionContext {
    /// Caller identity
    pub auth: AuthInformation,
    /// Credentials resolved for the model's tools, by tool name
    pub credentials: HashMap<String, Credential>,
}

/// Produces completions for one model.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Complete `request`.
    ///
    /// Returning [`Error::Authorization`] is answered in-band like a tool
    /// authorization failure.
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
        context: &CompletionContext,
    ) -> Result<ChatCompletionResponse>;
}

// ============================================================================
// Manager
// ============================================================================

/// Routes chat completions to model backends after authorizing their tools.
pub struct ChatCompletionManager {
    config: Arc<Config>,
    tools: Arc<ToolAuthManager>,
    remote: RemoteToolClient,
    backends: HashMap<String, Arc<dyn CompletionBackend>>,
}

impl ChatCompletionManager {
    /// Create a manager with no backends.
    #[must_use]
    pub fn new(config: Arc<Config>, tools: Arc<ToolAuthManager>, remote: RemoteToolClient) -> Self {
        Self {
            config,
            tools,
            remote,
            backends: HashMap::new(),
        }
    }

    /// Serve `model` with `backend`.
    #[must_use]
    pub fn with_backend(mut self, model: impl Into<String>, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backends.insert(model.into(), backend);
        self
    }

    /// Model ids with a backend, sorted.
    #[must_use]
    pub fn model_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Complete `request` for the caller described by `auth`.
    ///
    /// # Errors
    ///
    /// Unknown models, configuration and upstream failures. Authorization
    /// failures never surface here; they become the assistant message.
    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        auth: &AuthInformation,
    ) -> Result<ChatCompletionResponse> {
        let model = self
            .config
            .models
            .get(&request.model)
            .ok_or_else(|| Error::ModelNotFound(request.model.clone()))?;
        let backend = self
            .backends
            .get(&request.model)
            .ok_or_else(|| Error::Config(format!("No backend registered for model '{}'", request.model)))?;

        match self.run(request, model, backend.as_ref(), auth).await {
            Err(Error::Authorization(needed)) => {
                let needed = self.with_login_link(needed, auth);
                info!(
                    model = %request.model,
                    reason = needed.kind.label(),
                    audiences = ?needed.audiences,
                    "Answering with login message"
                );
                Ok(ChatCompletionResponse::assistant(&request.model, needed.user_message()))
            }
            other => other,
        }
    }

    /// Resolve credentials for the model's auth-requiring tools, in order.
    ///
    /// Tools marked `auth_optional` are left out instead of failing the turn.
    ///
    /// # Errors
    ///
    /// The first tool's [`Error::Authorization`], or a configuration error.
    pub async fn authorize_tools(
        &self,
        model: &ModelConfig,
        auth: &AuthInformation,
    ) -> Result<HashMap<String, Credential>> {
        let mut credentials = HashMap::new();
        for (name, tool) in self.config.tools_for_model(model) {
            if !tool.auth {
                continue;
            }
            let message = format!("The tool '{name}' requires you to log in.");
            let resolved = self
                .tools
                .get_token_for_tool(
                    auth.authorization.as_deref(),
                    &message,
                    name,
                    tool,
                    self.referrer(auth),
                )
                .await;
            match resolved {
                Ok(credential) => {
                    credentials.insert(name.to_string(), credential);
                }
                Err(Error::Authorization(needed)) if tool.auth_optional => {
                    debug!(tool = %name, reason = needed.kind.label(), "Optional tool left without credential");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(credentials)
    }

    async fn run(
        &self,
        request: &ChatCompletionRequest,
        model: &ModelConfig,
        backend: &dyn CompletionBackend,
        auth: &AuthInformation,
    ) -> Result<ChatCompletionResponse> {
        let credentials = self.authorize_tools(model, auth).await?;
        let context = CompletionContext {
            auth: auth.clone(),
            credentials,
        };

        let mut request = request.clone();
        for round in 0..MAX_TOOL_ROUNDS {
            let response = backend.complete(&request, &context).await?;
            let Some(message) = response.message() else {
                return Ok(response);
            };
            let remote: Vec<_> = message
                .tool_calls
                .iter()
                .filter_map(|call| self.remote_tool(model, &call.function.name).map(|tool| (call, tool)))
                .collect();
            // Calls to tools the gateway cannot reach belong to the client
            if remote.is_empty() || remote.len() != message.tool_calls.len() {
                return Ok(response);
            }

            request.messages.push(message.clone());
            for (call, (name, tool)) in remote {
                let output = self
                    .remote
                    .call(name, tool, context.credentials.get(name), &call.function.arguments)
                    .await?;
                request.messages.push(ChatMessage::tool(&call.id, output));
            }
            debug!(model = %request.model, round, "Executed remote tool calls");
        }

        Err(Error::Internal(format!(
            "Model '{}' kept calling tools after {MAX_TOOL_ROUNDS} rounds",
            request.model
        )))
    }

    fn remote_tool<'a>(&'a self, model: &'a ModelConfig, name: &str) -> Option<(&'a str, &'a ToolConfig)> {
        self.config
            .tools_for_model(model)
            .find(|(tool_name, tool)| *tool_name == name && tool.url.is_some())
    }

    /// The caller's referrer, if a finished login may return there.
    fn referrer<'a>(&self, auth: &'a AuthInformation) -> Option<&'a str> {
        auth.referrer
            .as_deref()
            .filter(|referrer| self.config.is_allowed_referrer(referrer))
    }

    fn with_login_link(&self, needed: AuthorizationNeeded, auth: &AuthInformation) -> AuthorizationNeeded {
        if needed.login_url.is_some() || matches!(needed.kind, AuthFailure::McpUnauthorized { .. }) {
            return needed;
        }
        match needed.audiences.first() {
            Some(audience) => {
                let url = self.tools.auth().login_url(audience, self.referrer(auth));
                needed.with_login_url(url)
            }
            None => needed,
        }
    }
}
