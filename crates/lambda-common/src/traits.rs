//! Contracts for the worker subsystems the dispatch core drives but does not
//! implement: sandbox runtimes, code and package pullers, the dependency
//! tracer, the import cache, and scratch/code directory allocation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::types::{LambdaRequest, LambdaResponse, SandboxMeta};
use crate::Result;

/// One isolated runtime able to serve a single request at a time.
///
/// A sandbox is paused between requests and unpaused to serve one. `destroy`
/// is terminal; calls on a destroyed sandbox are allowed to fail.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn pause(&self) -> Result<()>;

    async fn unpause(&self) -> Result<()>;

    async fn destroy(&self);

    /// Proxy one request into the runtime. Handler output and handler errors
    /// are both written into `resp`; implementations are expected to honour
    /// `req.context` cancellation.
    async fn send_request(&self, req: &LambdaRequest, resp: &mut LambdaResponse);
}

#[async_trait]
pub trait SandboxPool: Send + Sync {
    /// Create a sandbox rooted at `code_dir`. `parent` is an optional warm
    /// template to fork from; `leaf` marks a handler sandbox (as opposed to
    /// an import-cache intermediate).
    async fn create(
        &self,
        parent: Option<&dyn Sandbox>,
        leaf: bool,
        code_dir: &Path,
        scratch_dir: &Path,
        meta: &SandboxMeta,
    ) -> Result<Box<dyn Sandbox>>;

    /// Tear down the pool. Assumes all sandboxes are gone.
    async fn cleanup(&self);

    fn debug_string(&self) -> String;
}

/// Warm-start helper: creates sandboxes from a tree of pre-imported parents.
#[async_trait]
pub trait ImportCache: Send + Sync {
    /// The cache picks the parent sandbox itself.
    async fn create(
        &self,
        pool: &dyn SandboxPool,
        leaf: bool,
        code_dir: &Path,
        scratch_dir: &Path,
        meta: &SandboxMeta,
    ) -> Result<Box<dyn Sandbox>>;

    async fn cleanup(&self);
}

/// Fetches handler code from the registry, materialising it as a directory.
#[async_trait]
pub trait HandlerPuller: Send + Sync {
    /// Returns an existing or freshly materialised code directory.
    async fn pull(&self, name: &str) -> Result<PathBuf>;

    /// Forces the next `pull` to materialise afresh, even if the source
    /// bytes are unchanged.
    async fn reset(&self, name: &str);
}

#[async_trait]
pub trait PackagePuller: Send + Sync {
    /// Resolve `installs` and their transitive dependencies, returning the
    /// pinned closure.
    async fn install_recursive(&self, installs: Vec<String>) -> Result<Vec<String>>;
}

pub trait DepTracer: Send + Sync {
    fn trace_function(&self, code_dir: &Path, installs: &[String]);

    fn trace_invocation(&self, code_dir: &Path);

    fn cleanup(&self);
}

/// Allocates uniquely named directories under a managed root.
pub trait DirMaker: Send + Sync {
    fn make(&self, subname: &str) -> PathBuf;

    fn cleanup(&self);
}

/// Canonicalise a package spec before handing it to the installer. Names are
/// lowercased with `_` folded to `-`; an exact `==` version pin is kept as
/// written.
pub fn normalize_pkg(spec: &str) -> String {
    let spec = spec.trim();
    match spec.split_once("==") {
        Some((name, version)) => format!("{}=={}", normalize_name(name), version.trim()),
        None => normalize_name(spec),
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}
