//! Mock worker subsystems for the dispatch integration tests.

// not every test binary touches every helper
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lambda_common::{
    DepTracer, DirMaker, HandlerPuller, ImportCache, LambdaRequest, LambdaResponse, PackagePuller,
    Result, Sandbox, SandboxMeta, SandboxPool, WorkerConfig, WorkerError,
};
use lambda_dispatch::{FunctionRegistry, Subsystems};

/// Ordered record of interesting calls, for teardown-order assertions.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn index_of(&self, needle: &str) -> Option<usize> {
        self.snapshot().iter().position(|e| e.contains(needle))
    }
}

/// Behavior knobs shared by every sandbox the mock pool builds. Flip them
/// mid-test to simulate evictions, slow handlers, and wedged runtimes.
#[derive(Default)]
pub struct SandboxKnobs {
    pub exec_delay_ms: AtomicU64,
    pub destroy_delay_ms: AtomicU64,
    pub hang_until_cancelled: AtomicBool,
    pub fail_unpause: AtomicBool,
    pub fail_pause: AtomicBool,
}

pub struct SandboxState {
    pub id: String,
    pub code_dir: PathBuf,
    pub meta: SandboxMeta,
    pub paused: AtomicBool,
    pub destroyed: AtomicBool,
}

pub struct MockSandbox {
    state: Arc<SandboxState>,
    knobs: Arc<SandboxKnobs>,
    events: EventLog,
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.state.id
    }

    async fn pause(&self) -> Result<()> {
        if self.state.destroyed.load(Ordering::SeqCst) {
            return Err(WorkerError::Sandbox(format!(
                "{} is already destroyed",
                self.state.id
            )));
        }
        if self.knobs.fail_pause.load(Ordering::SeqCst) {
            return Err(WorkerError::Sandbox(format!("cannot pause {}", self.state.id)));
        }
        self.state.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unpause(&self) -> Result<()> {
        if self.state.destroyed.load(Ordering::SeqCst) {
            return Err(WorkerError::Sandbox(format!(
                "{} is already destroyed",
                self.state.id
            )));
        }
        if self.knobs.fail_unpause.load(Ordering::SeqCst) {
            return Err(WorkerError::Sandbox(format!(
                "cannot unpause {}",
                self.state.id
            )));
        }
        self.state.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) {
        let delay = self.knobs.destroy_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.destroyed.store(true, Ordering::SeqCst);
        self.events.push(format!("destroy {}", self.state.id));
    }

    async fn send_request(&self, req: &LambdaRequest, resp: &mut LambdaResponse) {
        if self.state.destroyed.load(Ordering::SeqCst) {
            resp.write(b"sandbox is gone\n");
            return;
        }
        if self.knobs.hang_until_cancelled.load(Ordering::SeqCst) {
            req.context.cancelled().await;
            return;
        }
        let delay = self.knobs.exec_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        resp.write(format!("served from {}\n", self.state.code_dir.display()).as_bytes());
        resp.write(&req.body);
    }
}

pub struct MockPool {
    pub knobs: Arc<SandboxKnobs>,
    pub fail_create: AtomicBool,
    pub cleaned: AtomicBool,
    created: Mutex<Vec<Arc<SandboxState>>>,
    next_id: AtomicUsize,
    events: EventLog,
}

impl MockPool {
    pub fn new(events: EventLog) -> Self {
        Self {
            knobs: Arc::new(SandboxKnobs::default()),
            fail_create: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            events,
        }
    }

    pub fn sandboxes(&self) -> Vec<Arc<SandboxState>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn live_count(&self) -> usize {
        self.sandboxes()
            .iter()
            .filter(|s| !s.destroyed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl SandboxPool for MockPool {
    async fn create(
        &self,
        _parent: Option<&dyn Sandbox>,
        _leaf: bool,
        code_dir: &Path,
        _scratch_dir: &Path,
        meta: &SandboxMeta,
    ) -> Result<Box<dyn Sandbox>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(WorkerError::Sandbox("mock pool is out of memory".into()));
        }
        let state = Arc::new(SandboxState {
            id: format!("sb-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            code_dir: code_dir.to_path_buf(),
            meta: meta.clone(),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(state.clone());
        self.events.push(format!("create {}", state.id));
        Ok(Box::new(MockSandbox {
            state,
            knobs: self.knobs.clone(),
            events: self.events.clone(),
        }))
    }

    async fn cleanup(&self) {
        self.cleaned.store(true, Ordering::SeqCst);
        self.events.push("pool cleanup");
    }

    fn debug_string(&self) -> String {
        format!("mock pool: {} sandboxes created", self.created_count())
    }
}

pub struct MockImportCache {
    pub fail: AtomicBool,
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
    events: EventLog,
}

impl MockImportCache {
    pub fn new(events: EventLog) -> Self {
        Self {
            fail: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            events,
        }
    }
}

#[async_trait]
impl ImportCache for MockImportCache {
    async fn create(
        &self,
        pool: &dyn SandboxPool,
        leaf: bool,
        code_dir: &Path,
        scratch_dir: &Path,
        meta: &SandboxMeta,
    ) -> Result<Box<dyn Sandbox>> {
        if self.fail.load(Ordering::SeqCst) {
            self.misses.fetch_add(1, Ordering::SeqCst);
            return Err(WorkerError::Sandbox("no suitable zygote".into()));
        }
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.events.push("import cache create");
        pool.create(None, leaf, code_dir, scratch_dir, meta).await
    }

    async fn cleanup(&self) {
        self.events.push("import cache cleanup");
    }
}

pub struct MockPuller {
    dir: Mutex<PathBuf>,
    pub pulls: AtomicUsize,
    pub resets: AtomicUsize,
    pub fail_next: AtomicBool,
}

impl MockPuller {
    pub fn new(initial: PathBuf) -> Self {
        Self {
            dir: Mutex::new(initial),
            pulls: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn set_dir(&self, dir: PathBuf) {
        *self.dir.lock().unwrap() = dir;
    }
}

#[async_trait]
impl HandlerPuller for MockPuller {
    async fn pull(&self, _name: &str) -> Result<PathBuf> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(WorkerError::Pull("mock registry unavailable".into()));
        }
        Ok(self.dir.lock().unwrap().clone())
    }

    async fn reset(&self, _name: &str) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Echoes the install list back, pinning any unpinned spec to 9.9.9 so tests
/// can tell resolved output from raw input.
pub struct MockInstaller {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub fail: AtomicBool,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PackagePuller for MockInstaller {
    async fn install_recursive(&self, installs: Vec<String>) -> Result<Vec<String>> {
        self.calls.lock().unwrap().push(installs.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::Install("mock pip exploded".into()));
        }
        Ok(installs
            .into_iter()
            .map(|spec| {
                if spec.contains("==") {
                    spec
                } else {
                    format!("{spec}==9.9.9")
                }
            })
            .collect())
    }
}

pub struct MockTracer {
    pub function_traces: Mutex<Vec<(PathBuf, Vec<String>)>>,
    pub invocation_traces: AtomicUsize,
    events: EventLog,
}

impl MockTracer {
    pub fn new(events: EventLog) -> Self {
        Self {
            function_traces: Mutex::new(Vec::new()),
            invocation_traces: AtomicUsize::new(0),
            events,
        }
    }
}

impl DepTracer for MockTracer {
    fn trace_function(&self, code_dir: &Path, installs: &[String]) {
        self.function_traces
            .lock()
            .unwrap()
            .push((code_dir.to_path_buf(), installs.to_vec()));
    }

    fn trace_invocation(&self, _code_dir: &Path) {
        self.invocation_traces.fetch_add(1, Ordering::SeqCst);
    }

    fn cleanup(&self) {
        self.events.push("tracer cleanup");
    }
}

pub struct TempDirMaker {
    root: PathBuf,
    label: String,
    counter: AtomicUsize,
    events: EventLog,
}

impl TempDirMaker {
    pub fn new(root: PathBuf, label: &str, events: EventLog) -> Self {
        Self {
            root,
            label: label.to_string(),
            counter: AtomicUsize::new(0),
            events,
        }
    }
}

impl DirMaker for TempDirMaker {
    fn make(&self, subname: &str) -> PathBuf {
        let path = self.root.join(format!(
            "{}-{}",
            subname,
            self.counter.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::create_dir_all(&path);
        path
    }

    fn cleanup(&self) {
        self.events.push(format!("{} cleanup", self.label));
    }
}

/// A registry wired to mocks, plus handles on every mock for assertions.
pub struct TestEnv {
    pub registry: FunctionRegistry,
    pub pool: Arc<MockPool>,
    pub cache: Option<Arc<MockImportCache>>,
    pub puller: Arc<MockPuller>,
    pub installer: Arc<MockInstaller>,
    pub tracer: Arc<MockTracer>,
    pub events: EventLog,
    root: tempfile::TempDir,
}

impl TestEnv {
    pub fn new(config: WorkerConfig) -> Self {
        Self::build(config, false)
    }

    pub fn with_import_cache(config: WorkerConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: WorkerConfig, import_cache: bool) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let events = EventLog::default();
        let root = tempfile::tempdir().expect("tempdir");

        let pool = Arc::new(MockPool::new(events.clone()));
        let cache = import_cache.then(|| Arc::new(MockImportCache::new(events.clone())));
        let puller = Arc::new(MockPuller::new(root.path().join("unset")));
        let installer = Arc::new(MockInstaller::new());
        let tracer = Arc::new(MockTracer::new(events.clone()));

        let registry = FunctionRegistry::new(Subsystems {
            config,
            sandbox_pool: pool.clone(),
            import_cache: cache
                .clone()
                .map(|c| c as Arc<dyn ImportCache>),
            handler_puller: puller.clone(),
            package_puller: installer.clone(),
            dep_tracer: tracer.clone(),
            code_dirs: Arc::new(TempDirMaker::new(
                root.path().join("code"),
                "code dirs",
                events.clone(),
            )),
            scratch_dirs: Arc::new(TempDirMaker::new(
                root.path().join("scratch"),
                "scratch dirs",
                events.clone(),
            )),
        });

        Self {
            registry,
            pool,
            cache,
            puller,
            installer,
            tracer,
            events,
            root,
        }
    }

    /// Materialise a handler directory with the given `f.py` source and
    /// point the mock puller at it.
    pub fn publish_handler(&self, dir_name: &str, source: &str) -> PathBuf {
        let dir = self.write_handler(dir_name, source);
        self.puller.set_dir(dir.clone());
        dir
    }

    pub fn write_handler(&self, dir_name: &str, source: &str) -> PathBuf {
        let dir = self.root.path().join(dir_name);
        std::fs::create_dir_all(&dir).expect("handler dir");
        std::fs::write(dir.join("f.py"), source).expect("handler file");
        dir
    }
}

/// Default config for tests: no registry cache window, no global timeout.
pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        registry_cache_ms: 0,
        ..WorkerConfig::default()
    }
}

pub fn request(body: &str) -> LambdaRequest {
    LambdaRequest::new(bytes::Bytes::copy_from_slice(body.as_bytes()))
}
