use orchcore::{HttpNodeData, NodeError};
use serde_json::{Map, Value};
use std::time::Duration;

/// Sends the request configured on an HTTP node
#[derive(Clone)]
pub struct HttpRequester {
    client: reqwest::Client,
}

impl HttpRequester {
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Issue the request. Non-2xx responses and transport errors are failures.
    pub async fn send(&self, node: &HttpNodeData) -> Result<Value, NodeError> {
        let method = reqwest::Method::from_bytes(node.method.to_uppercase().as_bytes())
            .map_err(|_| NodeError::ExecutionFailed(format!("Unsupported method: {}", node.method)))?;

        tracing::debug!("{} {}", method, node.url);

        let mut request = self.client.request(method.clone(), &node.url);
        for (key, value) in &node.headers {
            request = request.header(key, value);
        }
        request = match &node.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(json) => request.json(json),
        };

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(NodeError::ExecutionFailed(format!(
                "{} {} returned {}",
                method, node.url, status
            )));
        }

        let body = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        Ok(serde_json::json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }
}
