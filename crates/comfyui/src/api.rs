//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the queue/history snapshot endpoints, prompt submission,
//! queue/history mutation, and the `/view` media URL builder using
//! [`reqwest`].

use serde::Deserialize;

use promptdeck_core::job::OutputKind;

use crate::snapshot::{
    parse_history_response, parse_queue_response, HistorySnapshot, QueueSnapshot,
};

/// HTTP client for a single ComfyUI instance.
pub struct ComfyApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the `/prompt` endpoint after successfully
/// queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A response body could not be parsed into the expected shape.
    #[error("Malformed response: {0}")]
    Parse(#[from] serde_json::Error),

    /// A URL could not be constructed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ComfyApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    /// Fetch the current running/pending queue snapshot.
    ///
    /// Sends a `GET /queue` request.
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ComfyApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(parse_queue_response(body)?)
    }

    /// Fetch up to `max_items` most recent history entries.
    ///
    /// Sends a `GET /history?max_items=N` request.
    pub async fn get_history(&self, max_items: usize) -> Result<HistorySnapshot, ComfyApiError> {
        let response = self
            .client
            .get(format!("{}/history", self.api_url))
            .query(&[("max_items", max_items)])
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(parse_history_response(body)?)
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn queue_prompt(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Remove a queued (not yet running) prompt from the backend queue.
    ///
    /// Sends a `POST /queue` request with a delete directive.
    pub async fn delete_queue_entry(&self, prompt_id: &str) -> Result<(), ComfyApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Remove a single history entry.
    ///
    /// Sends a `POST /history` request with a delete directive.
    pub async fn delete_history_entry(&self, prompt_id: &str) -> Result<(), ComfyApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });

        let response = self
            .client
            .post(format!("{}/history", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Drop every pending entry from the backend queue.
    pub async fn clear_queue(&self) -> Result<(), ComfyApiError> {
        let body = serde_json::json!({ "clear": true });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Drop the backend's entire history.
    pub async fn clear_history(&self) -> Result<(), ComfyApiError> {
        let body = serde_json::json!({ "clear": true });

        let response = self
            .client
            .post(format!("{}/history", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt the currently running execution immediately.
    ///
    /// Sends a `POST /interrupt` request. This does not target a
    /// specific prompt -- it interrupts whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), ComfyApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Build a fetchable URL for an output file.
    ///
    /// Query parameters are percent-encoded, so filenames with spaces
    /// or unicode are safe.
    pub fn view_url(
        &self,
        filename: &str,
        subfolder: &str,
        kind: OutputKind,
    ) -> Result<String, ComfyApiError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/view", self.api_url),
            &[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", kind.as_str()),
            ],
        )
        .map_err(|e| ComfyApiError::InvalidUrl(e.to_string()))?;
        Ok(url.to_string())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyApiError::Api`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ComfyApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_url_encodes_query() {
        let api = ComfyApi::new("http://localhost:8188".to_string());
        let url = api
            .view_url("my image.png", "gen", OutputKind::Output)
            .unwrap();
        assert!(url.starts_with("http://localhost:8188/view?"));
        // Spaces are form-encoded as `+` in query pairs.
        assert!(url.contains("filename=my+image.png"));
        assert!(url.contains("subfolder=gen"));
        assert!(url.contains("type=output"));
    }

    #[test]
    fn view_url_encodes_reserved_characters() {
        let api = ComfyApi::new("http://localhost:8188".to_string());
        let url = api.view_url("a&b.png", "", OutputKind::Output).unwrap();
        assert!(url.contains("filename=a%26b.png"));
    }

    #[test]
    fn view_url_temp_kind() {
        let api = ComfyApi::new("http://localhost:8188".to_string());
        let url = api.view_url("a.png", "", OutputKind::Temp).unwrap();
        assert!(url.contains("type=temp"));
    }
}
