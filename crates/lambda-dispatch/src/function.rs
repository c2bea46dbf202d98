//! Per-function coordinator: admission, code refresh, autoscaling, and
//! ordered asynchronous teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lambda_common::http::StatusCode;
use lambda_common::{LambdaRequest, LambdaResponse, Result, SandboxMeta};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::instance::{InstanceHandle, InstanceTask};
use crate::meta::parse_meta;
use crate::registry::Subsystems;
use crate::stats::RollingAverage;

/// Capacity of each hop in the per-function pipeline.
pub(crate) const CHANNEL_CAP: usize = 32;

/// Minimum spacing between two scaling actions for one function.
const ADJUST_FREQ: Duration = Duration::from_secs(1);

const ROLLING_WINDOW: usize = 10;

/// One request in flight through the pipeline. The response is written in
/// place as the invocation moves; `finish` hands it back to the caller, and
/// the oneshot makes a second release impossible.
pub(crate) struct Invocation {
    pub(crate) request: LambdaRequest,
    pub(crate) response: LambdaResponse,
    done: oneshot::Sender<LambdaResponse>,
    /// Milliseconds the sandbox call took. Queue time and sandbox init do
    /// not count.
    pub(crate) exec_ms: u64,
}

impl Invocation {
    fn new(request: LambdaRequest, done: oneshot::Sender<LambdaResponse>) -> Self {
        Self {
            request,
            response: LambdaResponse::new(),
            done,
            exec_ms: 0,
        }
    }

    /// Release the client.
    pub(crate) fn finish(self) {
        let _ = self.done.send(self.response);
    }
}

/// The function state shared between the coordinator task and its instances:
/// the work queue's single receiver (taken in turns), the done queue sender,
/// and the worker subsystems.
pub(crate) struct FuncCore {
    pub(crate) name: String,
    pub(crate) subsystems: Arc<Subsystems>,
    work_rx: Mutex<mpsc::Receiver<Invocation>>,
    pub(crate) done_tx: mpsc::Sender<Invocation>,
}

impl FuncCore {
    pub(crate) async fn recv_work(&self) -> Option<Invocation> {
        self.work_rx.lock().await.recv().await
    }

    /// Non-blocking grab of the next work item. Contention on the receiver
    /// counts as "nothing queued".
    pub(crate) fn try_recv_work(&self) -> Option<Invocation> {
        self.work_rx.try_lock().ok()?.try_recv().ok()
    }
}

/// The function's active code at a point in time. Instances capture a clone
/// at creation and keep it for life; the coordinator may rotate to a new
/// snapshot at any time.
#[derive(Clone)]
pub(crate) struct CodeSnapshot {
    pub(crate) dir: PathBuf,
    pub(crate) meta: Arc<SandboxMeta>,
}

/// Client-facing handle for one registered function.
pub struct LambdaFunction {
    name: String,
    admit_tx: mpsc::Sender<Invocation>,
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl LambdaFunction {
    /// Build the pipeline and spawn the coordinator task.
    pub(crate) fn launch(name: &str, subsystems: Arc<Subsystems>) -> Arc<Self> {
        let (admit_tx, admit_rx) = mpsc::channel(CHANNEL_CAP);
        let (work_tx, work_rx) = mpsc::channel(CHANNEL_CAP);
        let (done_tx, done_rx) = mpsc::channel(CHANNEL_CAP);
        let (kill_tx, kill_rx) = mpsc::channel(1);

        let core = Arc::new(FuncCore {
            name: name.to_string(),
            subsystems,
            work_rx: Mutex::new(work_rx),
            done_tx,
        });

        let task = FunctionTask {
            core,
            admit_rx,
            work_tx,
            done_rx,
            kill_rx,
            code: None,
            last_pull: None,
            instances: Vec::new(),
        };
        tokio::spawn(task.run());

        Arc::new(Self {
            name: name.to_string(),
            admit_tx,
            kill_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit one invocation and wait for its response. A full admit queue is
    /// an immediate 429; everything else resolves when the pipeline releases
    /// the invocation.
    pub async fn invoke(&self, request: LambdaRequest) -> LambdaResponse {
        let (done_tx, done_rx) = oneshot::channel();
        let invocation = Invocation::new(request, done_tx);

        match self.admit_tx.try_send(invocation) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(mut invocation)) => {
                invocation.response.set_status(StatusCode::TOO_MANY_REQUESTS);
                invocation.response.write(b"lambda function queue is full");
                invocation.finish();
            }
            Err(mpsc::error::TrySendError::Closed(invocation)) => {
                // task already gone; dropping the invocation drops its
                // oneshot, surfaced below as the shutdown reply
                drop(invocation);
            }
        }

        match done_rx.await {
            Ok(response) => response,
            Err(_) => LambdaResponse::reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "lambda function is shutting down\n",
            ),
        }
    }

    /// Stop the coordinator and every instance; returns once the cleanup
    /// stream has drained.
    pub async fn kill(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.kill_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Items on the async cleanup stream. The stream is FIFO and drained by one
/// task, so a directory delete enqueued after a set of kill handles runs
/// only once every one of those kills has acked.
enum CleanupOp {
    RemoveDir(PathBuf),
    AwaitKill(oneshot::Receiver<()>),
}

fn spawn_cleanup_task(name: String, mut rx: mpsc::Receiver<CleanupOp>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                CleanupOp::RemoveDir(path) => {
                    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                        warn!(
                            "[FUNC {}] async cleanup could not delete {} even after all instances using it were killed: {}",
                            name,
                            path.display(),
                            e
                        );
                    }
                }
                CleanupOp::AwaitKill(ack) => {
                    let _ = ack.await;
                }
            }
        }
    })
}

enum Event {
    Tick,
    Admit(Invocation),
    Done(Invocation),
    Kill(oneshot::Sender<()>),
    Closed,
}

/// The single-consumer coordinator loop behind a [`LambdaFunction`].
struct FunctionTask {
    core: Arc<FuncCore>,
    admit_rx: mpsc::Receiver<Invocation>,
    work_tx: mpsc::Sender<Invocation>,
    done_rx: mpsc::Receiver<Invocation>,
    kill_rx: mpsc::Receiver<oneshot::Sender<()>>,

    code: Option<CodeSnapshot>,
    last_pull: Option<Instant>,

    /// Tail is newest; the tail instance is always the eviction target.
    instances: Vec<InstanceHandle>,
}

impl FunctionTask {
    /// Receives invocations, fetches new code as needed, and dispatches to
    /// the instances. Also watches outstanding work and scales the instance
    /// count up or down.
    ///
    /// For one invocation the four handoffs are: admit queue, work queue,
    /// done queue, the invocation's own done channel. A full admit or work
    /// queue is answered with 429 instead of blocking.
    async fn run(mut self) {
        // Cleanup actions (killing instances, deleting replaced code dirs)
        // must happen asynchronously but in order, so they go through a
        // bounded FIFO drained by a single task.
        let (cleanup_tx, cleanup_rx) = mpsc::channel(CHANNEL_CAP);
        let cleanup_task = spawn_cleanup_task(self.core.name.clone(), cleanup_rx);

        let mut outstanding: usize = 0;
        let mut exec_ms = RollingAverage::new(ROLLING_WINDOW);
        let mut last_scaling: Option<Instant> = None;
        // fire immediately so the policy runs once even before any request
        let mut tick_at: Option<Instant> = Some(Instant::now());

        loop {
            let event = tokio::select! {
                _ = tick_future(tick_at) => Event::Tick,
                admitted = self.admit_rx.recv() => match admitted {
                    Some(invocation) => Event::Admit(invocation),
                    // handle dropped without a kill; tear down unacked
                    None => Event::Closed,
                },
                Some(invocation) = self.done_rx.recv() => Event::Done(invocation),
                Some(ack) = self.kill_rx.recv() => Event::Kill(ack),
            };

            match event {
                Event::Tick => {
                    tick_at = None;
                    if self.code.is_none() {
                        continue;
                    }
                }
                Event::Admit(invocation) => {
                    if !self
                        .handle_admission(invocation, &cleanup_tx, &mut outstanding)
                        .await
                    {
                        continue;
                    }
                }
                Event::Done(invocation) => {
                    exec_ms.add(invocation.exec_ms);
                    outstanding = outstanding.saturating_sub(1);
                    invocation.finish();
                }
                Event::Kill(ack) => {
                    self.kill_instances(&cleanup_tx).await;
                    // the active code dir is not enqueued for deletion; the
                    // embedding worker reclaims it with the code DirMaker
                    drop(cleanup_tx);
                    let _ = cleanup_task.await;
                    let _ = ack.send(());
                    return;
                }
                Event::Closed => {
                    // every handle is gone; nobody can ack
                    self.kill_instances(&cleanup_tx).await;
                    drop(cleanup_tx);
                    let _ = cleanup_task.await;
                    return;
                }
            }

            // POLICY: how many instances (virtual sandboxes) should we have?

            // STEP 1: aim for one instance per second of queued work, capped
            // by the number of outstanding requests, with a floor of one.
            let desired = desired_instances(outstanding, exec_ms.avg());

            // STEP 2: move one step toward the goal, at most once per second.
            let now = Instant::now();
            if let Some(last) = last_scaling {
                let elapsed = now.duration_since(last);
                if elapsed < ADJUST_FREQ {
                    if desired != self.instances.len() {
                        tick_at = Some(last + ADJUST_FREQ);
                    }
                    continue;
                }
            }

            if self.instances.len() < desired {
                if let Some(code) = self.code.clone() {
                    info!(
                        "[FUNC {}] increase instances to {}",
                        self.core.name,
                        self.instances.len() + 1
                    );
                    self.instances
                        .push(InstanceTask::spawn(self.core.clone(), code));
                    last_scaling = Some(now);
                }
            } else if self.instances.len() > desired {
                info!(
                    "[FUNC {}] reduce instances to {}",
                    self.core.name,
                    self.instances.len() - 1
                );
                if let Some(tail) = self.instances.pop() {
                    let wait = tail.async_kill().await;
                    let _ = cleanup_tx.send(CleanupOp::AwaitKill(wait)).await;
                }
                last_scaling = Some(now);
            }

            if self.instances.len() != desired {
                // only one step per pass, so revisit soon even if no request
                // shows up
                tick_at = Some(now + ADJUST_FREQ);
            }
        }
    }

    /// One admission from the admit queue: refresh code, rotate instances if
    /// the code moved, then push the invocation at the instances. Returns
    /// `false` when the autoscaling block should be skipped this pass.
    async fn handle_admission(
        &mut self,
        mut invocation: Invocation,
        cleanup_tx: &mpsc::Sender<CleanupOp>,
        outstanding: &mut usize,
    ) -> bool {
        let old_dir = self.code.as_ref().map(|code| code.dir.clone());

        if let Err(e) = self.pull_handler_if_stale().await {
            error!(
                "[FUNC {}] error checking for new lambda code: {}",
                self.core.name, e
            );
            invocation
                .response
                .set_status(StatusCode::INTERNAL_SERVER_ERROR);
            invocation.response.write(format!("{e}\n").as_bytes());
            invocation.finish();
            return false;
        }

        if let (Some(old), Some(new)) = (&old_dir, self.code.as_ref()) {
            if *old != new.dir {
                // the replaced snapshot may still be referenced by live
                // instances; kill them all, and only then (FIFO) delete it
                self.kill_instances(cleanup_tx).await;
                let _ = cleanup_tx.send(CleanupOp::RemoveDir(old.clone())).await;
            }
        }

        if let Some(code) = &self.code {
            self.core.subsystems.dep_tracer.trace_invocation(&code.dir);
        }

        match self.work_tx.try_send(invocation) {
            Ok(()) => *outstanding += 1,
            Err(mpsc::error::TrySendError::Full(mut invocation)) => {
                invocation.response.set_status(StatusCode::TOO_MANY_REQUESTS);
                invocation.response.write(b"lambda instance queue is full");
                invocation.finish();
            }
            Err(mpsc::error::TrySendError::Closed(mut invocation)) => {
                invocation
                    .response
                    .set_status(StatusCode::INTERNAL_SERVER_ERROR);
                invocation.response.write(b"lambda work queue is closed\n");
                invocation.finish();
            }
        }
        true
    }

    /// Check the registry for newer code and swap it in.
    ///
    /// On any error nothing is switched and the pull time is not updated, so
    /// the next admission retries.
    async fn pull_handler_if_stale(&mut self) -> Result<()> {
        let now = Instant::now();
        let cache_window =
            Duration::from_millis(self.core.subsystems.config.registry_cache_ms);

        if let Some(last) = self.last_pull {
            if now.duration_since(last) < cache_window {
                return Ok(());
            }
        }

        let subsystems = self.core.subsystems.clone();
        let code_dir = subsystems.handler_puller.pull(&self.core.name).await?;

        if Some(code_dir.as_path()) == self.code.as_ref().map(|code| code.dir.as_path()) {
            // same snapshot; the pull time stays anchored to the last actual
            // rotation check
            return Ok(());
        }

        match self.ingest_snapshot(&code_dir).await {
            Ok(meta) => {
                self.code = Some(CodeSnapshot {
                    dir: code_dir,
                    meta: Arc::new(meta),
                });
                self.last_pull = Some(now);
                Ok(())
            }
            Err(e) => {
                // the candidate dir is already dirtied (package symlinks), so
                // drop it and force the puller to materialise a fresh one
                // next time even if the code bytes are unchanged
                if tokio::fs::remove_dir_all(&code_dir).await.is_err() {
                    warn!(
                        "[FUNC {}] could not clean up {} after failed pull",
                        self.core.name,
                        code_dir.display()
                    );
                }
                subsystems.handler_puller.reset(&self.core.name).await;
                Err(e)
            }
        }
    }

    /// Inspect a candidate snapshot: parse its directives, install the
    /// dependency closure, record the trace.
    async fn ingest_snapshot(&self, code_dir: &Path) -> Result<SandboxMeta> {
        let subsystems = &self.core.subsystems;
        let mut meta = parse_meta(code_dir).await?;
        meta.installs = subsystems
            .package_puller
            .install_recursive(meta.installs)
            .await?;
        subsystems.dep_tracer.trace_function(code_dir, &meta.installs);
        Ok(meta)
    }

    /// Async-kill every instance, queueing each ack on the cleanup stream so
    /// later stream entries wait for the kills.
    async fn kill_instances(&mut self, cleanup_tx: &mpsc::Sender<CleanupOp>) {
        for instance in self.instances.drain(..) {
            let wait = instance.async_kill().await;
            let _ = cleanup_tx.send(CleanupOp::AwaitKill(wait)).await;
        }
    }
}

async fn tick_future(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One instance per second of in-progress work, never more than the number
/// of pending work units, and always at least one.
fn desired_instances(outstanding: usize, avg_exec_ms: u64) -> usize {
    let in_progress_ms = outstanding as u64 * avg_exec_ms;
    let desired = (in_progress_ms / 1000) as usize;
    desired.min(outstanding).max(1)
}
