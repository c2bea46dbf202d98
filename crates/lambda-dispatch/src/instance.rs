//! A virtual sandbox slot. Each instance task owns at most one real sandbox,
//! serves requests drained from the shared work queue, and pauses the
//! sandbox whenever the queue runs dry.
//!
//! Failure handling:
//!
//! 1. pause/unpause errors: discard the sandbox, create a new one for the
//!    next request;
//! 2. create errors: propagate HTTP 500 to the client, retry on the next
//!    request;
//! 3. errors inside the sandbox: whatever the runtime wrote is passed
//!    through to the client untouched.

use std::sync::Arc;
use std::time::Duration;

use lambda_common::http::StatusCode;
use lambda_common::{Result, Sandbox};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::function::{CodeSnapshot, FuncCore};
use crate::timeout::{effective_timeout_ms, is_finite_timeout, TimeoutBroker};

const TIMEOUT_BODY: &[u8] = b"ERROR: Lambda took too long to respond, and has timed out.\n";

/// The coordinator's grip on one instance.
pub(crate) struct InstanceHandle {
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl InstanceHandle {
    /// Signal the instance to die; the returned receiver resolves once it
    /// has destroyed its sandbox and exited.
    pub(crate) async fn async_kill(&self) -> oneshot::Receiver<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.kill_tx.send(ack_tx).await;
        ack_rx
    }
}

pub(crate) struct InstanceTask {
    core: Arc<FuncCore>,
    /// Snapshot of the function's code at creation time; never rotated.
    code: CodeSnapshot,
    kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

impl InstanceTask {
    pub(crate) fn spawn(core: Arc<FuncCore>, code: CodeSnapshot) -> InstanceHandle {
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let task = Self {
            core,
            code,
            kill_rx,
        };
        tokio::spawn(task.run());
        InstanceHandle { kill_tx }
    }

    async fn run(self) {
        let Self {
            core,
            code,
            mut kill_rx,
        } = self;

        let mut sandbox: Option<Box<dyn Sandbox>> = None;

        loop {
            // wait for a request (blocking) before readying the sandbox, or
            // die if the kill signal arrives first
            let first = tokio::select! {
                Some(ack) = kill_rx.recv() => {
                    if let Some(sandbox) = sandbox.take() {
                        sandbox.destroy().await;
                    }
                    let _ = ack.send(());
                    return;
                }
                work = core.recv_work() => match work {
                    Some(invocation) => invocation,
                    None => {
                        // the coordinator is gone and took the queue with it
                        if let Some(sandbox) = sandbox.take() {
                            sandbox.destroy().await;
                        }
                        return;
                    }
                },
            };

            // Unpause failures are routine: evictors prefer paused sandboxes
            // over inactive ones, so ours may already have been reclaimed.
            // Treat it as lost and build a fresh one.
            if let Some(existing) = sandbox.as_deref() {
                if let Err(e) = existing.unpause().await {
                    info!(
                        "[FUNC {}] discard sandbox {} due to unpause error: {}",
                        core.name,
                        existing.id(),
                        e
                    );
                    sandbox = None;
                }
            }

            let mut current = Some(first);

            if sandbox.is_none() {
                match create_sandbox(&core, &code).await {
                    Ok(created) => sandbox = Some(created),
                    Err(e) => {
                        if let Some(mut invocation) = current.take() {
                            invocation
                                .response
                                .set_status(StatusCode::INTERNAL_SERVER_ERROR);
                            invocation
                                .response
                                .write(format!("could not create Sandbox: {e}\n").as_bytes());
                            if core.done_tx.send(invocation).await.is_err() {
                                return;
                            }
                        }
                        // wait for another request before retrying
                        continue;
                    }
                }
            }

            // below here the sandbox exists and is unpaused
            let mut discard = false;
            {
                let ready = match sandbox.as_deref() {
                    Some(ready) => ready,
                    None => continue,
                };

                // serve until the work queue runs dry
                while let Some(mut invocation) = current.take() {
                    let chosen = effective_timeout_ms(
                        core.subsystems.config.limits.max_timeout_ms,
                        code.meta.timeout_ms,
                    );

                    let broker = if is_finite_timeout(chosen) {
                        Some(TimeoutBroker::arm(
                            Duration::from_millis(chosen as u64),
                            invocation.request.context.clone(),
                            ready.id().to_string(),
                        ))
                    } else {
                        None
                    };

                    let started = Instant::now();
                    ready
                        .send_request(&invocation.request, &mut invocation.response)
                        .await;

                    let timed_out = match &broker {
                        Some(broker) => {
                            broker.disarm();
                            broker.fired()
                        }
                        None => false,
                    };

                    if timed_out {
                        // reclaim the wedged runtime; the stale handle is
                        // shed later through the pause-failure path
                        ready.destroy().await;
                        invocation.response.write(TIMEOUT_BODY);
                    }

                    invocation.exec_ms = started.elapsed().as_millis() as u64;
                    if core.done_tx.send(invocation).await.is_err() {
                        return;
                    }

                    // shutdown check (non-blocking)
                    if let Ok(ack) = kill_rx.try_recv() {
                        ready.destroy().await;
                        let _ = ack.send(());
                        return;
                    }

                    // grab another request (non-blocking)
                    current = core.try_recv_work();
                }

                if let Err(e) = ready.pause().await {
                    info!(
                        "[FUNC {}] discard sandbox {} due to pause error: {}",
                        core.name,
                        ready.id(),
                        e
                    );
                    discard = true;
                }
            }
            if discard {
                sandbox = None;
            }
        }
    }
}

/// Create a sandbox for the instance's code snapshot, trying the import
/// cache first when one is wired in.
async fn create_sandbox(core: &FuncCore, code: &CodeSnapshot) -> Result<Box<dyn Sandbox>> {
    let subsystems = &core.subsystems;

    if let Some(import_cache) = &subsystems.import_cache {
        let scratch_dir = subsystems.scratch_dirs.make(&core.name);
        // no parent given; the import cache picks one itself
        match import_cache
            .create(
                subsystems.sandbox_pool.as_ref(),
                true,
                &code.dir,
                &scratch_dir,
                &code.meta,
            )
            .await
        {
            Ok(sandbox) => return Ok(sandbox),
            Err(e) => {
                warn!(
                    "[FUNC {}] failed to get sandbox from import cache: {}",
                    core.name, e
                );
            }
        }
    }

    // import cache is either disabled or it failed
    let scratch_dir = subsystems.scratch_dirs.make(&core.name);
    subsystems
        .sandbox_pool
        .create(None, true, &code.dir, &scratch_dir, &code.meta)
        .await
}
