//! Thread-safe access to live functions, plus the worker subsystems they
//! share.

use std::collections::HashMap;
use std::sync::Arc;

use lambda_common::{
    DepTracer, DirMaker, HandlerPuller, ImportCache, PackagePuller, SandboxPool, WorkerConfig,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::function::LambdaFunction;

/// The subsystems every function task and instance drives. The embedding
/// worker builds these once (pool, pullers, tracer, directory allocators);
/// the dispatch core only shares them.
pub struct Subsystems {
    pub config: WorkerConfig,
    pub sandbox_pool: Arc<dyn SandboxPool>,
    /// `None` disables warm starts; instances then always create through the
    /// pool.
    pub import_cache: Option<Arc<dyn ImportCache>>,
    pub handler_puller: Arc<dyn HandlerPuller>,
    pub package_puller: Arc<dyn PackagePuller>,
    pub dep_tracer: Arc<dyn DepTracer>,
    pub code_dirs: Arc<dyn DirMaker>,
    pub scratch_dirs: Arc<dyn DirMaker>,
}

/// Process-wide map from function name to its live coordinator task.
pub struct FunctionRegistry {
    subsystems: Arc<Subsystems>,
    functions: Arc<Mutex<HashMap<String, Arc<LambdaFunction>>>>,
}

impl FunctionRegistry {
    pub fn new(subsystems: Subsystems) -> Self {
        Self {
            subsystems: Arc::new(subsystems),
            functions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the function's live handle, creating and spawning its task on
    /// first reference.
    pub async fn get(&self, name: &str) -> Arc<LambdaFunction> {
        let mut functions = self.functions.lock().await;

        if let Some(existing) = functions.get(name) {
            return existing.clone();
        }

        let function = LambdaFunction::launch(name, self.subsystems.clone());
        functions.insert(name.to_string(), function.clone());
        function
    }

    pub fn debug_string(&self) -> String {
        format!("{}\n", self.subsystems.sandbox_pool.debug_string())
    }

    /// Kill every function, then tear down the subsystems in dependency
    /// order: import cache (its sandboxes sit on the pool), sandbox pool,
    /// dependency tracer, directory allocators.
    ///
    /// The registry lock is taken and never released, so a `get` arriving
    /// after shutdown suspends forever instead of being handed a function
    /// inside a dead worker.
    pub async fn shutdown_all(&self) {
        let guard = self.functions.clone().lock_owned().await;

        for function in guard.values() {
            info!("kill function: {}", function.name());
            function.kill().await;
        }

        if let Some(import_cache) = &self.subsystems.import_cache {
            import_cache.cleanup().await;
        }
        self.subsystems.sandbox_pool.cleanup().await; // assumes all sandboxes are gone
        self.subsystems.dep_tracer.cleanup();
        self.subsystems.code_dirs.cleanup();
        self.subsystems.scratch_dirs.cleanup();

        std::mem::forget(guard);
    }
}
