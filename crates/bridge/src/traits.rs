//! Engine seam.
//!
//! The dispatcher never touches QuickJS directly. It talks to a
//! [`JsEngine`] built by an [`EngineFactory`], which lets tests swap in a
//! scripted engine and keeps `rquickjs` types confined to one module.

use crate::codec::{CallRequest, EngineOptions, EvalRequest, GlobalAssignment};
use crate::config::EngineConfig;
use crate::types::EngineHandle;
use crate::value::{EngineValue, FunctionRef};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// A JS exception: thrown value, syntax error, or interrupted execution.
    #[error("{message}")]
    Exception {
        message: String,
        name: Option<String>,
        stack: Option<String>,
        interrupted: bool,
    },

    /// The engine can no longer be trusted (out of memory, panic, failed init).
    #[error("engine fatal: {0}")]
    Fatal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The worker owning the engine has gone away.
    #[error("engine terminated")]
    Terminated,
}

impl EngineError {
    pub fn exception(message: impl Into<String>) -> Self {
        EngineError::Exception {
            message: message.into(),
            name: None,
            stack: None,
            interrupted: false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

/// Resource limits applied when an engine is created. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub memory_limit_bytes: u64,
    pub max_stack_size_bytes: u64,
    pub gc_threshold_bytes: u64,
    pub execution_timeout_ms: u64,
    pub settle_promises: bool,
    pub strict: bool,
    pub max_value_nodes: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl EngineLimits {
    /// Apply per-engine overrides from a `createEngine` payload.
    pub fn with_options(mut self, opts: &EngineOptions) -> Self {
        if let Some(v) = opts.memory_limit_bytes {
            self.memory_limit_bytes = v;
        }
        if let Some(v) = opts.max_stack_size_bytes {
            self.max_stack_size_bytes = v;
        }
        if let Some(v) = opts.execution_timeout_ms {
            self.execution_timeout_ms = v;
        }
        self
    }
}

/// One unit of work for an engine, already decoded from its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Eval(EvalRequest),
    Call(CallRequest),
    SetGlobal(GlobalAssignment),
    GetGlobal(String),
    Release(u64),
    RunJobs,
}

/// One engine context. Implementations are used from a single thread.
pub trait JsEngine {
    fn eval_script(&mut self, request: &EvalRequest) -> EngineResult<EngineValue>;

    /// Evaluate plain global code with the engine's default flags.
    fn eval(&mut self, source: &str) -> EngineResult<EngineValue> {
        self.eval_script(&EvalRequest::new(source))
    }

    fn call(&mut self, target: &FunctionRef, args: &[EngineValue]) -> EngineResult<EngineValue>;

    fn set_global(&mut self, name: &str, value: &EngineValue) -> EngineResult<()>;

    fn get_global(&mut self, name: &str) -> EngineResult<EngineValue>;

    /// Drop a retained function. Returns whether the id was known.
    fn release_function(&mut self, id: u64) -> bool;

    /// Drain the job queue, returning the number of jobs executed.
    fn execute_pending_jobs(&mut self) -> EngineResult<u64>;

    fn run(&mut self, command: EngineCommand) -> EngineResult<EngineValue> {
        match command {
            EngineCommand::Eval(request) => self.eval_script(&request),
            EngineCommand::Call(req) => self.call(&req.function, &req.args),
            EngineCommand::SetGlobal(assign) => self
                .set_global(&assign.name, &assign.value)
                .map(|_| EngineValue::Undefined),
            EngineCommand::GetGlobal(name) => self.get_global(&name),
            EngineCommand::Release(id) => Ok(EngineValue::Bool(self.release_function(id))),
            EngineCommand::RunJobs => self
                .execute_pending_jobs()
                .map(|n| EngineValue::Int(n as i64)),
        }
    }
}

/// Builds engines. Called on the worker thread that will own the engine.
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, handle: EngineHandle, limits: &EngineLimits) -> EngineResult<Box<dyn JsEngine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_override_limits() {
        let base = EngineLimits::default();
        let opts = EngineOptions {
            memory_limit_bytes: Some(1024),
            max_stack_size_bytes: None,
            execution_timeout_ms: Some(50),
        };
        let limits = base.with_options(&opts);
        assert_eq!(limits.memory_limit_bytes, 1024);
        assert_eq!(limits.max_stack_size_bytes, base.max_stack_size_bytes);
        assert_eq!(limits.execution_timeout_ms, 50);
    }

    #[test]
    fn test_default_limits_follow_engine_config() {
        let cfg = EngineConfig::default();
        let limits = EngineLimits::default();
        assert_eq!(limits.memory_limit_bytes, cfg.memory_limit_bytes);
        assert_eq!(limits.max_stack_size_bytes, cfg.max_stack_size_bytes);
        assert_eq!(limits.max_value_nodes, cfg.max_value_nodes);
        assert_eq!(limits.strict, cfg.strict);
    }

    #[test]
    fn test_exception_display_is_message() {
        let e = EngineError::exception("boom");
        assert_eq!(e.to_string(), "boom");
        assert!(!e.is_fatal());
        assert!(EngineError::Fatal("oom".into()).is_fatal());
    }
}
