//! Worker runtime: connects to a coordinator and executes registered
//! functions against assigned tasks.

pub mod cancel;
pub mod client;
pub mod registry;

pub use cancel::CancellationToken;
pub use client::WorkerClient;
pub use registry::{FunctionError, FunctionRegistry};
