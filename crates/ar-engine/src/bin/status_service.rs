use std::sync::Arc;

use ar_engine::{default_run_dir, JournalStore, RunStore};
use ar_types::{ArError, ObjectiveWeights, RunError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("AUTORAG_STATUS_ADDR").unwrap_or_else(|_| "0.0.0.0:8082".to_string());
    let run_dir = std::env::var("AUTORAG_RUN_DIR")
        .map(Into::into)
        .unwrap_or_else(|_| default_run_dir());

    let store = Arc::new(JournalStore::new(&run_dir));
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, run_dir = %run_dir.display(), "AutoRAG status service listening");

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let store = Arc::clone(&store);

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            let n = match socket.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to read request");
                    return;
                }
            };
            let request = String::from_utf8_lossy(&buffer[..n]);
            let request_line = request.lines().next().unwrap_or_default().to_string();
            debug!(%peer, request = %request_line, "status request");

            let (status, body) = tokio::task::spawn_blocking(move || route(&store, &request_line))
                .await
                .unwrap_or_else(|e| (500, error_body(&e.to_string())));

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                status_line(status),
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
    }
}

/// Map a request line to a status code and JSON body.
fn route(store: &JournalStore, request_line: &str) -> (u16, String) {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return (400, error_body("malformed request"));
    };
    if method != "GET" {
        return (405, error_body("only GET is supported"));
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["health"] => (200, r#"{"status":"ok","service":"autorag-status"}"#.to_string()),
        ["runs"] => match store.run_ids() {
            Ok(ids) => (200, to_json(&ids)),
            Err(e) => (500, error_body(&e.to_string())),
        },
        ["runs", id] => {
            let Ok(run_id) = id.parse::<Uuid>() else {
                return (400, error_body("run id must be a UUID"));
            };
            match store.load(run_id) {
                Ok(state) => (200, to_json(&state.progress(&ObjectiveWeights::default()))),
                Err(ArError::Run(RunError::NotFound { .. })) => {
                    (404, error_body(&format!("run {run_id} not found")))
                }
                Err(e) => (500, error_body(&e.to_string())),
            }
        }
        _ => (404, error_body("not found")),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| error_body(&e.to_string()))
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        _ => "500 Internal Server Error",
    }
}
