//! Purpose: Provide the HTTP server that streams stored documents as JSON.
//! Exports: `ServeConfig`, `serve`, `validate_config`.
//! Role: Axum-based loopback server over a `DirectoryStore`.
//! Invariants: Response bodies are the raw streamer output; nothing is re-encoded.
//! Invariants: A stream that fails after headers are sent aborts the body instead of ending it.
//! Invariants: Loopback-only unless explicitly allowed.

use std::future::IntoFuture;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use docstream::api::{
    CancelToken, DirectoryStore, DocQuery, Error, ErrorKind, JsonStreamer, StreamOptions,
    stream_many_query, stream_one_query,
};

const PIPE_BYTES: usize = 64 * 1024;
const BODY_CHANNEL_DEPTH: usize = 16;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub doc_dir: PathBuf,
    pub allow_non_loopback: bool,
    pub payload_only: bool,
    pub max_concurrent_streams: usize,
    pub stream_options: StreamOptions,
}

struct AppState {
    store: DirectoryStore,
    streamer: JsonStreamer,
    stream_semaphore: Arc<Semaphore>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    let mut store = DirectoryStore::new(config.doc_dir.clone());
    if config.payload_only {
        store = store.payload_only();
    }
    let state = Arc::new(AppState {
        store,
        streamer: JsonStreamer::new(config.stream_options.clone()),
        stream_semaphore: Arc::new(Semaphore::new(config.max_concurrent_streams)),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/docs", get(list_documents))
        .route("/v0/docs/:id", get(get_document))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(bind = %config.bind, dir = %config.doc_dir.display(), "serving documents");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_concurrent_streams == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-concurrent-streams must be greater than zero")
            .with_hint("Use a positive value like 64."));
    }

    if !config.doc_dir.is_dir() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message(format!(
                "document directory {} does not exist",
                config.doc_dir.display()
            ))
            .with_hint("Pass an existing directory with --dir."));
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn list_documents(State(state): State<Arc<AppState>>) -> Response {
    let permit = match acquire_stream(&state) {
        Ok(permit) => permit,
        Err(err) => return error_response(err),
    };
    document_response(state, DocQuery::All, permit)
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.store.contains(&id).await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(
                Error::new(ErrorKind::NotFound).with_message(format!("document {id} not found")),
            );
        }
        Err(err) => return error_response(err),
    }
    let permit = match acquire_stream(&state) {
        Ok(permit) => permit,
        Err(err) => return error_response(err),
    };
    document_response(state, DocQuery::ById(id), permit)
}

fn acquire_stream(state: &AppState) -> Result<OwnedSemaphorePermit, Error> {
    state
        .stream_semaphore
        .clone()
        .try_acquire_owned()
        .map_err(|_| {
            Error::new(ErrorKind::Busy)
                .with_message("too many concurrent document streams")
                .with_hint("Try again later or raise --max-concurrent-streams.")
        })
}

/// Runs the streamer on its own task, piping its output into the response body.
fn document_response(state: Arc<AppState>, query: DocQuery, permit: OwnedSemaphorePermit) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(BODY_CHANNEL_DEPTH);
    let cancel = CancelToken::new();

    tokio::spawn(async move {
        let _permit = permit;
        let (mut reader, writer) = tokio::io::duplex(PIPE_BYTES);
        let produce = produce_documents(&state, &query, writer, &cancel);
        let pump = pump_body(&mut reader, &tx, &cancel);
        let (result, ()) = tokio::join!(produce, pump);
        if let Err(err) = result {
            if err.is_cancelled() {
                info!(query = ?query, "client went away; stream cancelled");
            } else {
                warn!(query = ?query, error = %err, "document stream failed");
            }
            let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    response
        .headers_mut()
        .insert("docstream-version", HeaderValue::from_static("0"));
    response
}

async fn produce_documents(
    state: &AppState,
    query: &DocQuery,
    mut writer: DuplexStream,
    cancel: &CancelToken,
) -> Result<(), Error> {
    match query {
        DocQuery::All => {
            stream_many_query(&state.store, query, &state.streamer, &mut writer, cancel).await?;
        }
        DocQuery::ById(id) => {
            let found =
                stream_one_query(&state.store, query, &state.streamer, &mut writer, cancel).await?;
            if !found {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message(format!("document {id} disappeared while streaming")));
            }
        }
    }
    Ok(())
}

async fn pump_body(
    reader: &mut DuplexStream,
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    cancel: &CancelToken,
) {
    let mut buf = vec![0u8; PIPE_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..read]))).await.is_err() {
                    cancel.cancel();
                    break;
                }
            }
            Err(err) => {
                cancel.cancel();
                let _ = tx.send(Err(err)).await;
                break;
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("docstream-version", HeaderValue::from_static("0"));
    response
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Busy => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("docstream-version", HeaderValue::from_static("0"));
    response
}

#[cfg(test)]
mod tests {
    use super::{ServeConfig, serve, validate_config};
    use docstream::api::{ErrorKind, StreamOptions};

    fn config(bind: &str, doc_dir: std::path::PathBuf) -> ServeConfig {
        ServeConfig {
            bind: bind.parse().expect("bind"),
            doc_dir,
            allow_non_loopback: false,
            payload_only: false,
            max_concurrent_streams: 64,
            stream_options: StreamOptions::default(),
        }
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = serve(config("0.0.0.0:0", temp.path().to_path_buf()))
            .await
            .expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_loopback_with_opt_in_is_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("0.0.0.0:0", temp.path().to_path_buf());
        config.allow_non_loopback = true;
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn stream_limit_must_be_positive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("127.0.0.1:0", temp.path().to_path_buf());
        config.max_concurrent_streams = 0;
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn missing_document_dir_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config("127.0.0.1:0", temp.path().join("absent"));
        let err = validate_config(&config).expect_err("expected not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
