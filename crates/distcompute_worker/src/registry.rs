//! The registered-function model: a worker executes a task by looking up
//! its `FunctionId` here rather than deserializing a closure.
//!
//! Rust has no stable way to ship a closure and its captured environment
//! across a wire, so `Dispatcher::map` submits a function name from a
//! registry shared by coordinator and worker instead of a serialized
//! callable. Built-ins cover the demo/test surface; embedding binaries
//! register more with [`FunctionRegistry::register`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use distcompute_protocol::{ArgValue, FunctionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("unknown function {0:?}")]
    Unknown(FunctionId),
    #[error("argument type mismatch: {0}")]
    BadArgument(String),
    #[error("{0}")]
    Failed(String),
}

type BoxedFn = Arc<dyn Fn(ArgValue) -> Result<ArgValue, FunctionError> + Send + Sync>;

/// Maps a [`FunctionId`] to the closure that executes it.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<FunctionId, BoxedFn>,
}

impl FunctionRegistry {
    /// A registry with the demo built-ins: `identity`, `square`,
    /// `sleep_ms`, `fail`.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };
        registry.register("identity", identity);
        registry.register("square", square);
        registry.register("sleep_ms", sleep_ms);
        registry.register("fail", fail);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(ArgValue) -> Result<ArgValue, FunctionError> + Send + Sync + 'static,
    ) {
        self.functions.insert(FunctionId::new(name), Arc::new(f));
    }

    pub fn call(&self, function: &FunctionId, arg: ArgValue) -> Result<ArgValue, FunctionError> {
        let f = self
            .functions
            .get(function)
            .ok_or_else(|| FunctionError::Unknown(function.clone()))?;
        f(arg)
    }
}

fn identity(arg: ArgValue) -> Result<ArgValue, FunctionError> {
    Ok(arg)
}

fn square(arg: ArgValue) -> Result<ArgValue, FunctionError> {
    match arg {
        ArgValue::Int(n) => Ok(ArgValue::Int(n * n)),
        ArgValue::Float(f) => Ok(ArgValue::Float(f * f)),
        other => Err(FunctionError::BadArgument(format!(
            "square expects Int or Float, got {other:?}"
        ))),
    }
}

/// Blocks the executing task for the given number of milliseconds, then
/// echoes the argument back. Used in tests to exercise in-flight
/// concurrency and worker-death mid-task scenarios.
fn sleep_ms(arg: ArgValue) -> Result<ArgValue, FunctionError> {
    let millis = match &arg {
        ArgValue::Int(n) => *n as u64,
        other => {
            return Err(FunctionError::BadArgument(format!(
                "sleep_ms expects Int, got {other:?}"
            )))
        }
    };
    std::thread::sleep(Duration::from_millis(millis));
    Ok(arg)
}

/// Always fails, carrying the argument's string form as the error message.
/// Used in tests to exercise job-fatal task-error propagation.
fn fail(arg: ArgValue) -> Result<ArgValue, FunctionError> {
    Err(FunctionError::Failed(format!("fail() called with {arg:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_doubles_correctly() {
        let registry = FunctionRegistry::with_builtins();
        let result = registry
            .call(&FunctionId::new("square"), ArgValue::Int(7))
            .unwrap();
        assert_eq!(result, ArgValue::Int(49));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry.call(&FunctionId::new("nope"), ArgValue::Int(1));
        assert!(matches!(err, Err(FunctionError::Unknown(_))));
    }

    #[test]
    fn fail_always_errors() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry.call(&FunctionId::new("fail"), ArgValue::Str("x".into()));
        assert!(matches!(err, Err(FunctionError::Failed(_))));
    }

    #[test]
    fn custom_registration_is_callable() {
        let mut registry = FunctionRegistry::with_builtins();
        registry.register("double_str", |arg| match arg {
            ArgValue::Str(s) => Ok(ArgValue::Str(s.repeat(2))),
            other => Err(FunctionError::BadArgument(format!("{other:?}"))),
        });
        let result = registry
            .call(&FunctionId::new("double_str"), ArgValue::Str("ab".into()))
            .unwrap();
        assert_eq!(result, ArgValue::Str("abab".into()));
    }
}
