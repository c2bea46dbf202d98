// Re-export dependencies used in public interfaces of common types

pub use bytes;
pub use http;

use thiserror::Error;

pub mod config;
pub mod traits;
pub mod types;

pub use config::{FeaturesConfig, LimitsConfig, WorkerConfig};
pub use traits::{
    normalize_pkg, DepTracer, DirMaker, HandlerPuller, ImportCache, PackagePuller, Sandbox,
    SandboxPool,
};
pub use types::{LambdaRequest, LambdaResponse, RequestContext, SandboxMeta};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Function Metadata Invalid: {0}")]
    Meta(String),

    #[error("Handler Pull Error: {0}")]
    Pull(String),

    #[error("Package Install Error: {0}")]
    Install(String),

    #[error("Sandbox Error: {0}")]
    Sandbox(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;
