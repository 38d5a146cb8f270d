//! HTTP + SSE interface over the session manager.
//!
//! Sessions are addressed as `/session/{sid}/pty/{id}`, where `sid` is the
//! session group and `id` the session id. Output is streamed as server-sent
//! events: one `snapshot`, then `data` chunks, then `exit`.

use crate::session::{
    AttachOptions, Attachment, CreateOptions, OutputEvent, Replay, SessionManager,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::{self, BoxStream, StreamExt};
use linger_core::messages::{
    encode_blob, CreatePtyRequest, CreatePtyResponse, ErrorResponse, HealthResponse,
    InputRequest, ResizeRequest, SnapshotResponse, StreamEvent, StreamQuery, SuccessResponse,
};
use linger_core::{LingerError, SessionEntry};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

pub type AppState = Arc<SessionManager>;

/// Error returned by handlers, rendered as `{error, code}`.
#[derive(Debug)]
pub struct ApiError(LingerError);

impl From<LingerError> for ApiError {
    fn from(e: LingerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LingerError::NotFound(_) => StatusCode::NOT_FOUND,
            LingerError::InvalidRequest(_) | LingerError::ResizeUnsupported(_) => {
                StatusCode::BAD_REQUEST
            }
            LingerError::AlreadyExited(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(manager: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/session/{sid}/pty",
            post(create_pty).get(list_ptys).delete(kill_all),
        )
        .route("/session/{sid}/pty/{id}", delete(remove_pty))
        .route("/session/{sid}/pty/{id}/stream", get(stream_pty))
        .route("/session/{sid}/pty/{id}/input", post(input))
        .route("/session/{sid}/pty/{id}/resize", post(resize))
        .route("/session/{sid}/pty/{id}/snapshot", get(snapshot))
        .route("/session/{sid}/pty/{id}/kill", post(kill))
        .with_state(manager)
}

pub async fn health(State(manager): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        sessions: manager.count().await,
    })
}

pub async fn create_pty(
    State(manager): State<AppState>,
    Path(sid): Path<String>,
    Json(req): Json<CreatePtyRequest>,
) -> ApiResult<CreatePtyResponse> {
    let session = manager
        .create(CreateOptions {
            name: req.name,
            group: Some(sid),
            command: req.cmd,
            cwd: req.cwd.map(PathBuf::from),
            env: req.env.unwrap_or_default(),
            cols: req.cols,
            rows: req.rows,
            mode: req.mode.unwrap_or_default(),
        })
        .await?;
    Ok(Json(CreatePtyResponse {
        pty_id: session.id,
        pid: session.pid,
        log_file_path: session.log_file_path,
    }))
}

pub async fn list_ptys(
    State(manager): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Vec<SessionEntry>> {
    Ok(Json(manager.list_group(&sid).await?))
}

pub async fn kill_all(
    State(manager): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<SuccessResponse> {
    let killed = manager.kill_group(&sid).await?;
    debug!(group = %sid, killed, "killed group");
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn remove_pty(
    State(manager): State<AppState>,
    Path((sid, id)): Path<(String, String)>,
) -> ApiResult<SuccessResponse> {
    manager.remove_id(&sid, &id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// `success` is `false` when the process was already gone.
pub async fn kill(
    State(manager): State<AppState>,
    Path((sid, id)): Path<(String, String)>,
) -> ApiResult<SuccessResponse> {
    let killed = manager.kill_id(&sid, &id).await?;
    Ok(Json(SuccessResponse { success: killed }))
}

pub async fn input(
    State(manager): State<AppState>,
    Path((sid, id)): Path<(String, String)>,
    Json(req): Json<InputRequest>,
) -> ApiResult<SuccessResponse> {
    let delivered = manager.write(&sid, &id, req.data.as_bytes()).await?;
    Ok(Json(SuccessResponse { success: delivered }))
}

pub async fn resize(
    State(manager): State<AppState>,
    Path((sid, id)): Path<(String, String)>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<SuccessResponse> {
    let resized = manager.resize(&sid, &id, req.cols, req.rows).await?;
    Ok(Json(SuccessResponse { success: resized }))
}

pub async fn snapshot(
    State(manager): State<AppState>,
    Path((sid, id)): Path<(String, String)>,
) -> ApiResult<SnapshotResponse> {
    let snap = manager.snapshot(&sid, &id).await?;
    Ok(Json(SnapshotResponse {
        data: encode_blob(&snap.bytes),
        cols: snap.cols,
        rows: snap.rows,
    }))
}

fn sse_event(event: StreamEvent) -> Result<Event, Infallible> {
    Ok(Event::default().event(event.name()).data(event.payload()))
}

fn lines_blob(lines: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Stream a session. Sessions that are not hosted here get their stored
/// output as the snapshot; the stream then ends with `exit` if the process is
/// gone, or without it if the process runs elsewhere.
pub async fn stream_pty(
    State(manager): State<AppState>,
    Path((sid, id)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let opts = AttachOptions {
        lines: query.lines,
        search: query.search,
        interactive: false,
    };
    let attachment = manager.attach_id(&sid, &id, opts).await?;

    let events: BoxStream<'static, Result<Event, Infallible>> = match attachment {
        Attachment::Replay {
            session,
            lines,
            process_alive,
        } => {
            let mut events = vec![sse_event(StreamEvent::Snapshot(lines_blob(&lines)))];
            if !process_alive {
                let code = session.exit_code.unwrap_or(-1);
                events.push(sse_event(StreamEvent::Exit(code)));
            }
            stream::iter(events).boxed()
        }
        Attachment::Live(live) => {
            let replay = match live.replay {
                Replay::Snapshot(snap) => snap.bytes,
                Replay::Lines(lines) => lines_blob(&lines),
            };
            let first = stream::once(async move { sse_event(StreamEvent::Snapshot(replay)) });
            let rest = stream::unfold(Some(live.observer), |state| async move {
                let mut observer = state?;
                match observer.recv().await? {
                    OutputEvent::Data(data) => Some((sse_event(StreamEvent::Data(data)), Some(observer))),
                    OutputEvent::Exit(reason) => {
                        Some((sse_event(StreamEvent::Exit(reason.code())), None))
                    }
                }
            });
            first.chain(rest).boxed()
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use linger_client::{EventStream, LingerClient};
    use linger_core::{LingerError, SessionStatus, SpawnMode, StatePaths, SystemProbe};
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    async fn serve(dir: &TempDir) -> LingerClient {
        let mut config = SessionConfig::new(StatePaths::new(dir.path()));
        config.kill_timeout = Duration::from_secs(2);
        let manager = Arc::new(SessionManager::new(config, Arc::new(SystemProbe)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(manager)).await.unwrap();
        });
        LingerClient::new(format!("http://{addr}"))
    }

    async fn next(stream: &mut EventStream) -> StreamEvent {
        tokio::time::timeout(WAIT, stream.next())
            .await
            .expect("timed out waiting for event")
            .unwrap()
            .expect("stream ended")
    }

    async fn read_until(stream: &mut EventStream, needle: &str) {
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains(needle) {
            match next(stream).await {
                StreamEvent::Data(chunk) => seen.extend_from_slice(&chunk),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let dir = TempDir::new().unwrap();
        let client = serve(&dir).await;
        assert_eq!(client.health().await.unwrap().sessions, 0);

        let created = client
            .create(
                "g1",
                &CreatePtyRequest {
                    cmd: vec!["sh".into()],
                    name: Some("api-shell".into()),
                    mode: Some(SpawnMode::Pipes),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(created.pid > 0);

        let listed = client.list("g1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].alive);
        assert_eq!(listed[0].session.name, "api-shell");
        assert!(client.list("other").await.unwrap().is_empty());

        let mut stream = client
            .stream("g1", &created.pty_id, &StreamQuery::default())
            .await
            .unwrap();
        assert!(matches!(next(&mut stream).await, StreamEvent::Snapshot(_)));

        assert!(client
            .input("g1", &created.pty_id, "echo hi-$((1+1))\n")
            .await
            .unwrap());
        read_until(&mut stream, "hi-2").await;

        assert!(client.resize("g1", &created.pty_id, 100, 30).await.unwrap());
        let snap = client.snapshot("g1", &created.pty_id).await.unwrap();
        assert_eq!((snap.cols, snap.rows), (100, 30));

        assert!(client.kill("g1", &created.pty_id).await.unwrap());
        loop {
            match next(&mut stream).await {
                StreamEvent::Data(_) => continue,
                StreamEvent::Exit(code) => {
                    assert!(code > 128, "{code}");
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(stream.next().await.unwrap().is_none());

        assert!(!client.input("g1", &created.pty_id, "ls\n").await.unwrap());
        let listed = client.list("g1").await.unwrap();
        assert!(!listed[0].alive);
        assert_eq!(listed[0].session.status, SessionStatus::Killed);

        // A finished session streams its history and the exit code.
        let mut replay = client
            .stream("g1", &created.pty_id, &StreamQuery::default())
            .await
            .unwrap();
        match next(&mut replay).await {
            StreamEvent::Snapshot(bytes) => assert!(String::from_utf8_lossy(&bytes).contains("hi-2")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next(&mut replay).await, StreamEvent::Exit(_)));

        assert!(client.remove("g1", &created.pty_id).await.unwrap());
        assert!(client.list("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let dir = TempDir::new().unwrap();
        let client = serve(&dir).await;

        let err = client.snapshot("g1", "missing").await.unwrap_err();
        assert!(matches!(err, LingerError::NotFound(_)), "{err:?}");

        let err = client
            .create("g1", &CreatePtyRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LingerError::InvalidRequest(_)), "{err:?}");

        let err = client
            .create(
                "g1",
                &CreatePtyRequest {
                    cmd: vec!["/nonexistent/linger-test".into()],
                    mode: Some(SpawnMode::Pipes),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LingerError::SpawnFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn line_replay_with_search() {
        let dir = TempDir::new().unwrap();
        let client = serve(&dir).await;
        let created = client
            .create(
                "g1",
                &CreatePtyRequest {
                    cmd: vec![
                        "sh".into(),
                        "-c".into(),
                        "echo match-1; echo other; echo match-2; exec cat".into(),
                    ],
                    mode: Some(SpawnMode::Pipes),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let query = StreamQuery {
            lines: Some(1),
            search: Some("match".into()),
        };
        let mut replay = Vec::new();
        for _ in 0..100 {
            let mut stream = client.stream("g1", &created.pty_id, &query).await.unwrap();
            if let StreamEvent::Snapshot(bytes) = next(&mut stream).await {
                replay = bytes;
            }
            if replay == b"match-2\r\n" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(replay, b"match-2\r\n");
        assert!(client.kill_all("g1").await.unwrap());
    }
}
