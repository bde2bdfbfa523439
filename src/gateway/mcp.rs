//! Remote tool calls over MCP's HTTP transport.

use std::collections::BTreeMap;

use reqwest::{Client, StatusCode, header};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::{AuthorizationNeeded, Credential};
use crate::config::ToolConfig;
use crate::{Error, Result};

/// Calls `tools/call` on remote tool endpoints with the tool's credential attached.
#[derive(Clone)]
pub struct RemoteToolClient {
    http: Client,
}

impl RemoteToolClient {
    /// Create a client.
    #[must_use]
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Invoke `name` at `tool.url` with JSON-encoded `arguments`.
    ///
    /// Returns the tool's text output. JSON-RPC errors are returned as text
    /// so the model can react to them.
    ///
    /// # Errors
    ///
    /// [`Error::Authorization`] with an `McpUnauthorized` failure when the
    /// endpoint answers 401. Other non-success statuses are upstream errors.
    pub async fn call(
        &self,
        name: &str,
        tool: &ToolConfig,
        credential: Option<&Credential>,
        arguments: &str,
    ) -> Result<String> {
        let url = tool
            .url
            .as_deref()
            .ok_or_else(|| Error::Config(format!("Tool '{name}' has no url")))?;
        let arguments: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)?
        };

        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments},
        });
        let mut request = self
            .http
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(&body);
        if let Some(bearer) = credential.and_then(Credential::bearer) {
            request = request.bearer_auth(bearer);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let headers: BTreeMap<String, String> = response
                .headers()
                .get_all(header::WWW_AUTHENTICATE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(|v| (header::WWW_AUTHENTICATE.as_str().to_string(), v.to_string()))
                .collect();
            warn!(tool = %name, url = %url, "Remote tool rejected credential");
            return Err(AuthorizationNeeded::mcp_unauthorized(url, headers).into());
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let reply: Value = response.json().await?;
        debug!(tool = %name, "Remote tool answered");
        Ok(tool_output(&reply))
    }
}

/// Text of a JSON-RPC `tools/call` reply.
fn tool_output(reply: &Value) -> String {
    if let Some(error) = reply.get("error") {
        let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return format!("Tool error: {message}");
    }
    let result = reply.get("result").unwrap_or(&Value::Null);
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if texts.is_empty() {
        result.to_string()
    } else {
        texts.join("\n")
    }
}
