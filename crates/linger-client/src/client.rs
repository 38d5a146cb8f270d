//! HTTP client for a linger server.
//!
//! `LingerClient` wraps the remote session API. Errors the server reports as
//! `{error, code}` come back as the matching [`LingerError`] variant.

use crate::sse::SseDecoder;
use linger_core::messages::{
    CreatePtyRequest, CreatePtyResponse, ErrorResponse, HealthResponse, InputRequest,
    ResizeRequest, SnapshotResponse, StreamEvent, StreamQuery, SuccessResponse,
};
use linger_core::{LingerError, LingerResult, SessionEntry};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Default server URL.
pub const DEFAULT_URL: &str = "http://127.0.0.1:7681";

#[derive(Debug, Clone)]
pub struct LingerClient {
    base: String,
    http: reqwest::Client,
}

impl LingerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self {
            base,
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Host and port the client talks to, if the base URL names them.
    pub fn server_addr(&self) -> Option<(String, u16)> {
        let url = reqwest::Url::parse(&self.base).ok()?;
        Some((url.host_str()?.to_string(), url.port_or_known_default()?))
    }

    fn pty_url(&self, group: &str, id: &str, action: &str) -> String {
        let mut url = format!("{}/session/{group}/pty/{id}", self.base);
        if !action.is_empty() {
            url.push('/');
            url.push_str(action);
        }
        url
    }

    pub async fn health(&self) -> LingerResult<HealthResponse> {
        let resp = self
            .http
            .get(format!("{}/health", self.base))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }

    pub async fn create(
        &self,
        group: &str,
        req: &CreatePtyRequest,
    ) -> LingerResult<CreatePtyResponse> {
        let url = format!("{}/session/{group}/pty", self.base);
        debug!(%url, cmd = ?req.cmd, "creating session");
        let resp = self.http.post(url).json(req).send().await.map_err(transport)?;
        decode(resp).await
    }

    pub async fn list(&self, group: &str) -> LingerResult<Vec<SessionEntry>> {
        let url = format!("{}/session/{group}/pty", self.base);
        let resp = self.http.get(url).send().await.map_err(transport)?;
        decode(resp).await
    }

    /// Kill every live session of a group.
    pub async fn kill_all(&self, group: &str) -> LingerResult<bool> {
        let url = format!("{}/session/{group}/pty", self.base);
        let resp = self.http.delete(url).send().await.map_err(transport)?;
        Ok(decode::<SuccessResponse>(resp).await?.success)
    }

    /// Returns `false` if the process has exited.
    pub async fn input(&self, group: &str, id: &str, data: &str) -> LingerResult<bool> {
        let resp = self
            .http
            .post(self.pty_url(group, id, "input"))
            .json(&InputRequest {
                data: data.to_string(),
            })
            .send()
            .await
            .map_err(transport)?;
        Ok(decode::<SuccessResponse>(resp).await?.success)
    }

    pub async fn resize(&self, group: &str, id: &str, cols: u16, rows: u16) -> LingerResult<bool> {
        let resp = self
            .http
            .post(self.pty_url(group, id, "resize"))
            .json(&ResizeRequest { cols, rows })
            .send()
            .await
            .map_err(transport)?;
        Ok(decode::<SuccessResponse>(resp).await?.success)
    }

    pub async fn snapshot(&self, group: &str, id: &str) -> LingerResult<SnapshotResponse> {
        let resp = self
            .http
            .get(self.pty_url(group, id, "snapshot"))
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }

    /// Returns `false` if the process was already gone.
    pub async fn kill(&self, group: &str, id: &str) -> LingerResult<bool> {
        let resp = self
            .http
            .post(self.pty_url(group, id, "kill"))
            .send()
            .await
            .map_err(transport)?;
        Ok(decode::<SuccessResponse>(resp).await?.success)
    }

    /// Kill (if alive) and delete a session.
    pub async fn remove(&self, group: &str, id: &str) -> LingerResult<bool> {
        let resp = self
            .http
            .delete(self.pty_url(group, id, ""))
            .send()
            .await
            .map_err(transport)?;
        Ok(decode::<SuccessResponse>(resp).await?.success)
    }

    /// Open a session's event stream.
    pub async fn stream(
        &self,
        group: &str,
        id: &str,
        query: &StreamQuery,
    ) -> LingerResult<EventStream> {
        let resp = self
            .http
            .get(self.pty_url(group, id, "stream"))
            .query(query)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(transport)?;
        let resp = check(resp).await?;
        Ok(EventStream {
            response: resp,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        })
    }
}

/// Events of one session stream. Dropping it detaches.
pub struct EventStream {
    response: reqwest::Response,
    decoder: SseDecoder,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl EventStream {
    /// Next event, or `None` when the server closed the stream.
    pub async fn next(&mut self) -> LingerResult<Option<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            match self.response.chunk().await.map_err(transport)? {
                Some(chunk) => self.pending.extend(self.decoder.feed(&chunk)?),
                None => self.done = true,
            }
        }
    }
}

fn transport(e: reqwest::Error) -> LingerError {
    LingerError::Transport(e.to_string())
}

/// Turn a non-success response into the error it carries.
async fn check(resp: reqwest::Response) -> LingerResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let Ok(err) = serde_json::from_str::<ErrorResponse>(&body) else {
        return Err(LingerError::Transport(format!("HTTP {status}: {body}")));
    };
    // The server renders the variant's display form; keep only its detail.
    let detail = match err.error.split_once(": ") {
        Some((_, detail)) => detail.to_string(),
        None => err.error.clone(),
    };
    Err(match err.code.as_str() {
        "not_found" => LingerError::NotFound(detail),
        "invalid_request" => LingerError::InvalidRequest(detail),
        "already_exited" => LingerError::AlreadyExited(detail),
        "spawn_failed" => LingerError::SpawnFailed(detail),
        "resize_unsupported" => LingerError::ResizeUnsupported(detail),
        _ => LingerError::Other(format!("HTTP {status}: {}", err.error)),
    })
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> LingerResult<T> {
    check(resp)
        .await?
        .json::<T>()
        .await
        .map_err(|e| LingerError::Transport(format!("invalid response: {e}")))
}
