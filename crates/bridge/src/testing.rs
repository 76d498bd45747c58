//! Scripted engine for deterministic dispatcher and worker tests.

use crate::codec::EvalRequest;
use crate::traits::{EngineError, EngineFactory, EngineLimits, EngineResult, JsEngine};
use crate::types::EngineHandle;
use crate::value::{EngineValue, FunctionRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builds [`ScriptedEngine`]s. `eval_script` understands a handful of fixed
/// sources (`count`, `panic`, `fatal`, `throw`, `thread`, `sleep:<ms>`) and
/// echoes anything else back as a string.
#[derive(Debug, Default, Clone)]
pub struct ScriptedFactory {
    pub fail_create: bool,
    pub created: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicUsize>,
}

impl EngineFactory for ScriptedFactory {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create(&self, handle: EngineHandle, _limits: &EngineLimits) -> EngineResult<Box<dyn JsEngine>> {
        if self.fail_create {
            return Err(EngineError::Fatal("scripted creation failure".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            handle,
            counter: 0,
            globals: HashMap::new(),
            dropped: self.dropped.clone(),
        }))
    }
}

pub struct ScriptedEngine {
    handle: EngineHandle,
    counter: i64,
    globals: HashMap<String, EngineValue>,
    dropped: Arc<AtomicUsize>,
}

impl JsEngine for ScriptedEngine {
    fn eval_script(&mut self, request: &EvalRequest) -> EngineResult<EngineValue> {
        match request.source.as_str() {
            "count" => {
                self.counter += 1;
                Ok(EngineValue::Int(self.counter))
            }
            "handle" => Ok(EngineValue::Int(self.handle as i64)),
            "panic" => panic!("scripted panic"),
            "fatal" => Err(EngineError::Fatal("scripted fatal".into())),
            "throw" => Err(EngineError::exception("scripted throw")),
            "thread" => Ok(EngineValue::String(
                std::thread::current().name().unwrap_or_default().to_string(),
            )),
            other => match other.strip_prefix("sleep:").and_then(|ms| ms.parse().ok()) {
                Some(ms) => {
                    std::thread::sleep(Duration::from_millis(ms));
                    self.counter += 1;
                    Ok(EngineValue::Int(self.counter))
                }
                None => Ok(EngineValue::String(other.to_string())),
            },
        }
    }

    fn call(&mut self, target: &FunctionRef, args: &[EngineValue]) -> EngineResult<EngineValue> {
        match target {
            FunctionRef::Global(path) if path == "echo" => {
                Ok(EngineValue::Array(args.to_vec()))
            }
            _ => Err(EngineError::exception("not a function")),
        }
    }

    fn set_global(&mut self, name: &str, value: &EngineValue) -> EngineResult<()> {
        self.globals.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn get_global(&mut self, name: &str) -> EngineResult<EngineValue> {
        Ok(self
            .globals
            .get(name)
            .cloned()
            .unwrap_or(EngineValue::Undefined))
    }

    fn release_function(&mut self, _id: u64) -> bool {
        false
    }

    fn execute_pending_jobs(&mut self) -> EngineResult<u64> {
        Ok(0)
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}
