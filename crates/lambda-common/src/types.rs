use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Metadata extracted from a code snapshot: what to install, what the
/// handler is likely to import (a warm-start hint), and an optional
/// per-function timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMeta {
    pub installs: Vec<String>,
    pub imports: Vec<String>,
    /// Per-function timeout in milliseconds; `<= 0` means unset.
    pub timeout_ms: i64,
}

/// Cooperative cancellation flag carried by every request.
///
/// The timeout broker trips it when a request overruns its deadline;
/// sandboxes are expected to watch it while proxying. Tripping the flag does
/// not forcibly unblock an in-flight `send_request` call.
#[derive(Debug, Default)]
pub struct RequestContext {
    cancelled: AtomicBool,
    notify: Notify,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            // re-check: cancel may have landed between the load and notified()
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// An inbound invocation request as the dispatch core sees it.
#[derive(Debug, Clone)]
pub struct LambdaRequest {
    pub body: Bytes,
    pub context: Arc<RequestContext>,
}

impl LambdaRequest {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            context: Arc::new(RequestContext::new()),
        }
    }
}

/// The response accumulated for one invocation. Status and body are written
/// in place as the invocation moves through the pipeline, then handed back to
/// the caller in one piece.
#[derive(Debug, Clone)]
pub struct LambdaResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl LambdaResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            body: Vec::new(),
        }
    }

    pub fn reply(status: StatusCode, body: impl AsRef<[u8]>) -> Self {
        Self {
            status,
            body: body.as_ref().to_vec(),
        }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Appends to the body, like writing to a streaming response.
    pub fn write(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl Default for LambdaResponse {
    fn default() -> Self {
        Self::new()
    }
}
