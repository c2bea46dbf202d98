//! Per-function dispatch and autoscaling core of the lambda worker.
//!
//! Every registered function gets a coordinator task that admits HTTP
//! invocations onto a bounded pipeline, keeps the function's code fresh
//! against the registry, and sizes a pool of sandbox-backed instances to the
//! observed workload. Communication for one invocation:
//!
//! ```text
//! client -> admit queue -> work queue -> done queue -> client
//! ```
//!
//! Each hop is a bounded channel; a full hop is an immediate 429 back to the
//! client rather than backpressure on the caller.

pub mod function;
mod instance;
pub mod meta;
pub mod registry;
mod stats;
mod timeout;

pub use function::LambdaFunction;
pub use registry::{FunctionRegistry, Subsystems};
