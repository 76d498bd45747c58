//! Bridge dispatcher.
//!
//! Operations arrive as `{name, handle, payload}` and are resolved against a
//! handler table built once at construction. Payloads and success results
//! are binary documents produced by [`Codec`]; failures are
//! [`DispatchError`]s carrying a stable wire code.

use crate::codec::{
    decode_text, CallRequest, Codec, CodecError, EngineOptions, EvalRequest, GlobalAssignment,
};
use crate::config::DispatcherConfig;
use crate::context::BridgeContext;
use crate::traits::{EngineCommand, EngineError, EngineFactory, EngineLimits};
use crate::types::{EngineHandle, ErrorCode, ErrorInfo};
use crate::value::{EngineValue, FunctionRef};
use crate::worker::EngineWorker;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub const OP_CREATE_ENGINE: &str = "createEngine";
pub const OP_DISPOSE_ENGINE: &str = "disposeEngine";
pub const OP_EVAL_SCRIPT: &str = "evalScript";
pub const OP_CALL_FUNCTION: &str = "callFunction";
pub const OP_SET_GLOBAL: &str = "setGlobal";
pub const OP_GET_GLOBAL: &str = "getGlobal";
pub const OP_RELEASE_FUNCTION: &str = "releaseFunction";
pub const OP_EXECUTE_PENDING_JOBS: &str = "executePendingJobs";

/// A named request against the bridge. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub handle: Option<EngineHandle>,
    pub payload: Vec<u8>,
}

impl Operation {
    pub fn new(name: impl Into<String>, handle: Option<EngineHandle>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            handle,
            payload,
        }
    }
}

pub type DispatchResult = Result<Vec<u8>, DispatchError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown operation: `{0}`")]
    UnknownOperation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("{message}")]
    EngineException {
        message: String,
        name: Option<String>,
        stack: Option<String>,
        interrupted: bool,
    },

    #[error("engine fatal: {0}")]
    EngineFatal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DispatchError::UnknownOperation(_) => ErrorCode::UnknownOperation,
            DispatchError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            DispatchError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            DispatchError::EngineException { .. } => ErrorCode::EngineException,
            DispatchError::EngineFatal(_) => ErrorCode::EngineFatal,
            DispatchError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Structured extras for the wire form. `Null` when there are none.
    pub fn details(&self) -> serde_json::Value {
        match self {
            DispatchError::EngineException {
                name,
                stack,
                interrupted,
                ..
            } => {
                let mut details = serde_json::Map::new();
                if let Some(name) = name {
                    details.insert("name".into(), json!(name));
                }
                if let Some(stack) = stack {
                    details.insert("stack".into(), json!(stack));
                }
                if *interrupted {
                    details.insert("interrupted".into(), json!(true));
                }
                if details.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::Object(details)
                }
            }
            _ => serde_json::Value::Null,
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        let message = match self {
            DispatchError::EngineException { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorInfo {
            code: self.error_code(),
            message,
            details: self.details(),
        }
    }
}

impl From<CodecError> for DispatchError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Encode(msg) => DispatchError::Internal(msg),
            other => DispatchError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<EngineError> for DispatchError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Exception {
                message,
                name,
                stack,
                interrupted,
            } => DispatchError::EngineException {
                message,
                name,
                stack,
                interrupted,
            },
            EngineError::Fatal(msg) => DispatchError::EngineFatal(msg),
            EngineError::InvalidArgument(msg) => DispatchError::InvalidArgument(msg),
            EngineError::Terminated => DispatchError::InvalidHandle("engine has been disposed".into()),
        }
    }
}

type Handler = fn(&Dispatcher, &Operation) -> DispatchResult;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
    engines: Mutex<HashMap<EngineHandle, Arc<EngineWorker>>>,
    next_handle: AtomicU64,
    default_engine: Mutex<Option<EngineHandle>>,
    factory: Arc<dyn EngineFactory>,
    limits: EngineLimits,
    settings: DispatcherConfig,
    codec: Codec,
}

impl Dispatcher {
    pub fn new(ctx: &BridgeContext) -> Self {
        let config = ctx.config();
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert(OP_CREATE_ENGINE, op_create_engine);
        handlers.insert(OP_DISPOSE_ENGINE, op_dispose_engine);
        handlers.insert(OP_EVAL_SCRIPT, op_eval_script);
        handlers.insert(OP_CALL_FUNCTION, op_call_function);
        handlers.insert(OP_SET_GLOBAL, op_set_global);
        handlers.insert(OP_GET_GLOBAL, op_get_global);
        handlers.insert(OP_RELEASE_FUNCTION, op_release_function);
        handlers.insert(OP_EXECUTE_PENDING_JOBS, op_execute_pending_jobs);

        Self {
            handlers,
            engines: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            default_engine: Mutex::new(None),
            factory: ctx.factory(),
            limits: EngineLimits::from(&config.engine),
            settings: config.dispatcher.clone(),
            codec: Codec::new(config.dispatcher.max_payload_bytes),
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn factory_name(&self) -> &'static str {
        self.factory.name()
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort();
        names
    }

    pub fn supports(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn active_handles(&self) -> Vec<EngineHandle> {
        let mut handles: Vec<EngineHandle> = lock(&self.engines).keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn engine_count(&self) -> usize {
        lock(&self.engines).len()
    }

    pub fn default_handle(&self) -> Option<EngineHandle> {
        *lock(&self.default_engine)
    }

    /// Resolve and run one operation.
    pub fn dispatch(&self, op: &Operation) -> DispatchResult {
        let handler = self
            .handlers
            .get(op.name.as_str())
            .ok_or_else(|| DispatchError::UnknownOperation(op.name.clone()))?;
        if op.payload.len() as u64 > self.codec.limit() {
            return Err(DispatchError::InvalidArgument(format!(
                "payload of {} bytes exceeds limit of {}",
                op.payload.len(),
                self.codec.limit()
            )));
        }

        debug!(
            operation = %op.name,
            handle = ?op.handle,
            payload_len = op.payload.len(),
            "dispatch"
        );
        let result = handler(self, op);
        if let Err(e) = &result {
            debug!(operation = %op.name, code = %e.error_code(), error = %e, "dispatch failed");
        }
        result
    }

    // -----------------------------------------------------------------------
    // Typed wrappers (all go through `dispatch`)
    // -----------------------------------------------------------------------

    pub fn create_engine(&self, options: Option<&EngineOptions>) -> Result<EngineHandle, DispatchError> {
        let payload = match options {
            Some(opts) => self.codec.encode(opts)?,
            None => Vec::new(),
        };
        let value = self.dispatch_value(Operation::new(OP_CREATE_ENGINE, None, payload))?;
        value
            .as_i64()
            .and_then(|h| u64::try_from(h).ok())
            .ok_or_else(|| DispatchError::Internal(format!("createEngine returned {}", value)))
    }

    pub fn dispose_engine(&self, handle: EngineHandle) -> Result<(), DispatchError> {
        self.dispatch(&Operation::new(OP_DISPOSE_ENGINE, Some(handle), Vec::new()))
            .map(|_| ())
    }

    pub fn eval_script(
        &self,
        handle: Option<EngineHandle>,
        source: &str,
    ) -> Result<EngineValue, DispatchError> {
        self.dispatch_value(Operation::new(OP_EVAL_SCRIPT, handle, source.as_bytes().to_vec()))
    }

    /// `evalScript` with a file name, module mode or strictness override.
    pub fn eval_request(
        &self,
        handle: Option<EngineHandle>,
        request: &EvalRequest,
    ) -> Result<EngineValue, DispatchError> {
        let payload = self.codec.encode_eval(request)?;
        self.dispatch_value(Operation::new(OP_EVAL_SCRIPT, handle, payload))
    }

    pub fn call_function(
        &self,
        handle: Option<EngineHandle>,
        function: FunctionRef,
        args: Vec<EngineValue>,
    ) -> Result<EngineValue, DispatchError> {
        let payload = self.codec.encode(&CallRequest { function, args })?;
        self.dispatch_value(Operation::new(OP_CALL_FUNCTION, handle, payload))
    }

    pub fn set_global(
        &self,
        handle: Option<EngineHandle>,
        name: &str,
        value: EngineValue,
    ) -> Result<(), DispatchError> {
        let payload = self.codec.encode(&GlobalAssignment {
            name: name.to_string(),
            value,
        })?;
        self.dispatch_value(Operation::new(OP_SET_GLOBAL, handle, payload))
            .map(|_| ())
    }

    pub fn get_global(
        &self,
        handle: Option<EngineHandle>,
        name: &str,
    ) -> Result<EngineValue, DispatchError> {
        self.dispatch_value(Operation::new(OP_GET_GLOBAL, handle, name.as_bytes().to_vec()))
    }

    pub fn release_function(
        &self,
        handle: Option<EngineHandle>,
        id: u64,
    ) -> Result<bool, DispatchError> {
        let payload = self.codec.encode(&id)?;
        let value = self.dispatch_value(Operation::new(OP_RELEASE_FUNCTION, handle, payload))?;
        value
            .as_bool()
            .ok_or_else(|| DispatchError::Internal(format!("releaseFunction returned {}", value)))
    }

    pub fn execute_pending_jobs(&self, handle: Option<EngineHandle>) -> Result<u64, DispatchError> {
        let value = self.dispatch_value(Operation::new(OP_EXECUTE_PENDING_JOBS, handle, Vec::new()))?;
        value
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| DispatchError::Internal(format!("executePendingJobs returned {}", value)))
    }

    fn dispatch_value(&self, op: Operation) -> Result<EngineValue, DispatchError> {
        let bytes = self.dispatch(&op)?;
        self.codec
            .decode_value(&bytes)
            .map_err(|e| DispatchError::Internal(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Engine table
    // -----------------------------------------------------------------------

    fn spawn_engine(&self, limits: EngineLimits) -> Result<EngineHandle, DispatchError> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let worker = EngineWorker::spawn(
            handle,
            self.factory.clone(),
            limits,
            self.settings.worker_stack_size_bytes as usize,
        )
        .map_err(|e| match e {
            EngineError::Fatal(msg) => DispatchError::EngineFatal(msg),
            other => DispatchError::from(other),
        })?;
        lock(&self.engines).insert(handle, Arc::new(worker));
        info!(engine = handle, factory = self.factory.name(), "engine created");
        Ok(handle)
    }

    fn resolve(&self, handle: Option<EngineHandle>) -> Result<(EngineHandle, Arc<EngineWorker>), DispatchError> {
        if let Some(handle) = handle {
            return lock(&self.engines)
                .get(&handle)
                .cloned()
                .map(|worker| (handle, worker))
                .ok_or_else(|| DispatchError::InvalidHandle(format!("engine {} is not active", handle)));
        }

        if !self.settings.default_engine {
            return Err(DispatchError::InvalidHandle(
                "operation requires an engine handle".into(),
            ));
        }

        // Held across creation so concurrent callers share one default engine.
        let mut default = lock(&self.default_engine);
        if let Some(handle) = *default {
            if let Some(worker) = lock(&self.engines).get(&handle).cloned() {
                return Ok((handle, worker));
            }
        }
        let handle = self.spawn_engine(self.limits)?;
        *default = Some(handle);
        let worker = lock(&self.engines)
            .get(&handle)
            .cloned()
            .ok_or_else(|| DispatchError::InvalidHandle(format!("engine {} is not active", handle)))?;
        Ok((handle, worker))
    }

    /// Remove `handle` if it still maps to `worker`. Returns whether it did.
    fn retire(&self, handle: EngineHandle, worker: &Arc<EngineWorker>) -> bool {
        let removed = {
            let mut engines = lock(&self.engines);
            match engines.get(&handle) {
                Some(current) if Arc::ptr_eq(current, worker) => engines.remove(&handle),
                _ => None,
            }
        };
        let Some(removed) = removed else {
            return false;
        };
        self.clear_default(handle);
        removed.dispose();
        true
    }

    fn clear_default(&self, handle: EngineHandle) {
        let mut default = lock(&self.default_engine);
        if *default == Some(handle) {
            *default = None;
        }
    }

    fn run_on(&self, op: &Operation, command: EngineCommand) -> DispatchResult {
        let (handle, worker) = self.resolve(op.handle)?;
        match worker.run(command) {
            Ok(value) => Ok(self.codec.encode_value(&value)?),
            Err(EngineError::Fatal(msg)) => {
                warn!(engine = handle, operation = %op.name, error = %msg, "engine fatal, retiring handle");
                self.retire(handle, &worker);
                Err(DispatchError::EngineFatal(msg))
            }
            Err(EngineError::Terminated) => {
                let retired = self.retire(handle, &worker);
                if retired && !worker.has_failed() {
                    warn!(engine = handle, "engine worker stopped unexpectedly");
                    Err(DispatchError::EngineFatal("engine worker stopped unexpectedly".into()))
                } else {
                    Err(DispatchError::InvalidHandle(format!("engine {} is not active", handle)))
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    fn dispose_all(&self) {
        let drained: Vec<(EngineHandle, Arc<EngineWorker>)> = lock(&self.engines).drain().collect();
        *lock(&self.default_engine) = None;
        for (handle, worker) in drained {
            worker.dispose();
            debug!(engine = handle, "engine disposed with dispatcher");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

// ===========================================================================
// Handlers
// ===========================================================================

fn op_create_engine(d: &Dispatcher, op: &Operation) -> DispatchResult {
    let opts = d.codec.decode_options(&op.payload)?;
    let handle = d.spawn_engine(d.limits.with_options(&opts))?;
    Ok(d.codec.encode_value(&EngineValue::Int(handle as i64))?)
}

fn op_dispose_engine(d: &Dispatcher, op: &Operation) -> DispatchResult {
    let handle = op
        .handle
        .ok_or_else(|| DispatchError::InvalidArgument("disposeEngine requires a handle".into()))?;
    let worker = lock(&d.engines)
        .remove(&handle)
        .ok_or_else(|| DispatchError::InvalidHandle(format!("engine {} is not active", handle)))?;
    d.clear_default(handle);
    worker.dispose();
    info!(engine = handle, "engine disposed");
    Ok(d.codec.encode_value(&EngineValue::Undefined)?)
}

fn op_eval_script(d: &Dispatcher, op: &Operation) -> DispatchResult {
    let request = d.codec.decode_eval(&op.payload)?;
    d.run_on(op, EngineCommand::Eval(request))
}

fn op_call_function(d: &Dispatcher, op: &Operation) -> DispatchResult {
    let req: CallRequest = d.codec.decode(&op.payload)?;
    d.run_on(op, EngineCommand::Call(req))
}

fn op_set_global(d: &Dispatcher, op: &Operation) -> DispatchResult {
    let assign: GlobalAssignment = d.codec.decode(&op.payload)?;
    d.run_on(op, EngineCommand::SetGlobal(assign))
}

fn op_get_global(d: &Dispatcher, op: &Operation) -> DispatchResult {
    let name = decode_text(&op.payload)?;
    d.run_on(op, EngineCommand::GetGlobal(name))
}

fn op_release_function(d: &Dispatcher, op: &Operation) -> DispatchResult {
    let id: u64 = d.codec.decode(&op.payload)?;
    d.run_on(op, EngineCommand::Release(id))
}

fn op_execute_pending_jobs(d: &Dispatcher, op: &Operation) -> DispatchResult {
    d.run_on(op, EngineCommand::RunJobs)
}
