//! Local JSON request socket for companion tools such as a web UI.
//!
//! One request per connection, one response, then the connection closes:
//!
//! ```text
//! {"command": "get_state"}               -> {"status": "ok", "nfc_id": "aa:bb:cc", "spool_id": 3, ...}
//! {"command": "get_spools"}              -> {"status": "ok", "spools": [...]}
//! {"command": "set_nfc_id", "spool": 7}  -> {"status": "ok"}
//! anything else                          -> {"status": "error", "message": "..."}
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::inventory::NfcBinder;
use crate::scan::ScanState;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Request {
    GetState,
    GetSpools,
    SetNfcId { spool: u32 },
}

#[derive(Clone)]
pub struct IpcServer {
    state: watch::Receiver<ScanState>,
    binder: Arc<dyn NfcBinder>,
}

impl IpcServer {
    pub fn new(state: watch::Receiver<ScanState>, binder: Arc<dyn NfcBinder>) -> Self {
        Self { state, binder }
    }

    /// Answer one raw request. Never fails; errors become error responses.
    pub async fn handle_request(&self, raw: &str) -> Value {
        let request: Request = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => return error_response(format!("Invalid request: {}", e)),
        };
        debug!(?request, "IPC request");

        match request {
            Request::GetState => {
                let state = self.state.borrow().clone();
                json!({
                    "status": "ok",
                    "nfc_id": state.nfc_id,
                    "spool_id": state.spool_id,
                    "filament_id": state.filament_id,
                    "outcome": state.outcome,
                    "updated_at": state.updated_at,
                })
            }
            Request::GetSpools => match self.binder.list_spools().await {
                Ok(spools) => json!({ "status": "ok", "spools": spools }),
                Err(e) => {
                    error!(error = %e, "Failed to list spools");
                    error_response(format!("Failed to list spools: {}", e))
                }
            },
            Request::SetNfcId { spool } => self.set_nfc_id(spool).await,
        }
    }

    async fn set_nfc_id(&self, spool: u32) -> Value {
        let nfc_id = self.state.borrow().nfc_id.clone();
        let Some(nfc_id) = nfc_id else {
            return error_response("No nfc_id to write".to_string());
        };

        info!(%nfc_id, spool, "Binding last scanned tag to spool");
        match self.binder.bind_nfc_id(spool, &nfc_id).await {
            Ok(true) => json!({ "status": "ok" }),
            Ok(false) => error_response(format!("Spool #{} not found", spool)),
            Err(e) => {
                error!(error = %e, "Failed to bind nfc_id");
                error_response(format!("Failed to send nfc_id to inventory: {}", e))
            }
        }
    }

    /// Listen on `path` until the task is dropped. A stale socket file is
    /// replaced.
    pub async fn serve(self, path: &Path) -> Result<()> {
        let listener = bind(path)?;
        info!(path = %path.display(), "IPC socket listening");

        loop {
            let (stream, _) = listener.accept().await.context("Failed to accept IPC connection")?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!(error = %e, "IPC connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let raw = read_request(&mut stream).await?;
        let response = self.handle_request(&raw).await;
        stream.write_all(response.to_string().as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

fn error_response(message: String) -> Value {
    json!({ "status": "error", "message": message })
}

fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create socket directory {}", dir.display()))?;
    }
    if path.exists() {
        debug!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

/// Read until the bytes form one JSON document, the peer stops writing, or
/// the size limit is hit. Clients are not required to close their side.
async fn read_request(stream: &mut UnixStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if serde_json::from_slice::<Value>(&buf).is_ok() || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Removes the socket file when dropped.
pub struct SocketGuard(PathBuf);

impl SocketGuard {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
