//! Host-facing method channel.
//!
//! Hosts speak JSON: `{method, arguments}` in, `{result}` or `{error}` out.
//! The channel turns a call into a binary [`Operation`], dispatches it and
//! renders the decoded value through its plain JSON view.

use crate::codec::{CallRequest, EngineOptions, EvalRequest, GlobalAssignment};
use crate::context::BridgeContext;
use crate::dispatcher::*;
use crate::types::*;
use crate::value::{EngineValue, FunctionRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelResponse {
    Result(Value),
    Error(ErrorInfo),
}

pub struct MethodChannel {
    name: String,
    dispatcher: Dispatcher,
}

impl MethodChannel {
    pub fn new(ctx: &BridgeContext) -> Self {
        Self {
            name: ctx.config().channel_name.clone(),
            dispatcher: Dispatcher::new(ctx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run one call and return its JSON result.
    pub fn invoke(&self, call: &MethodCall) -> Result<Value, DispatchError> {
        let op = self.to_operation(call)?;
        let bytes = self.dispatcher.dispatch(&op)?;
        let value = self
            .dispatcher
            .codec()
            .decode_value(&bytes)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        Ok(value.to_json())
    }

    pub fn handle(&self, call: &MethodCall) -> ChannelResponse {
        match self.invoke(call) {
            Ok(v) => ChannelResponse::Result(v),
            Err(e) => ChannelResponse::Error(e.to_error_info()),
        }
    }

    /// Run one call and wrap it in a timed [`CallResult`].
    pub fn execute(&self, method: &str, arguments: Value) -> CallResult {
        let run_id = new_run_id();
        let start = Instant::now();
        let call = MethodCall::new(method, arguments);
        let handle = handle_arg(&call.arguments).ok().flatten();

        let mut r = match self.invoke(&call) {
            Ok(data) => {
                let mut r = result_ok(method, &run_id, start.elapsed().as_millis() as u64);
                r.data = Some(data);
                r
            }
            Err(e) => result_err(
                method,
                &run_id,
                start.elapsed().as_millis() as u64,
                e.to_error_info(),
            ),
        };
        r.handle = handle;
        r
    }

    fn to_operation(&self, call: &MethodCall) -> Result<Operation, DispatchError> {
        if !self.dispatcher.supports(&call.method) {
            return Err(DispatchError::UnknownOperation(call.method.clone()));
        }
        let args = &call.arguments;
        if !(args.is_null() || args.is_object()) {
            return Err(DispatchError::InvalidArgument(
                "arguments must be an object".into(),
            ));
        }
        let handle = handle_arg(args)?;
        let codec = self.dispatcher.codec();

        let payload = match call.method.as_str() {
            OP_CREATE_ENGINE => {
                let opts = EngineOptions {
                    memory_limit_bytes: u64_arg(args, "memoryLimitBytes")?,
                    max_stack_size_bytes: u64_arg(args, "maxStackSizeBytes")?,
                    execution_timeout_ms: u64_arg(args, "executionTimeoutMs")?,
                };
                if opts == EngineOptions::default() {
                    Vec::new()
                } else {
                    codec.encode(&opts)?
                }
            }
            OP_EVAL_SCRIPT => {
                let request = EvalRequest {
                    source: required_str(args, "source")?.to_string(),
                    file_name: optional_str(args, "fileName")?.map(String::from),
                    module: bool_arg(args, "module")?.unwrap_or(false),
                    strict: bool_arg(args, "strict")?,
                };
                codec.encode_eval(&request)?
            }
            OP_CALL_FUNCTION => {
                let function = args
                    .get("function")
                    .and_then(FunctionRef::from_json)
                    .ok_or_else(|| {
                        DispatchError::InvalidArgument(
                            "`function` must be a global path or a function reference".into(),
                        )
                    })?;
                let call_args = match args.get("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.iter().map(EngineValue::from_json).collect(),
                    Some(_) => {
                        return Err(DispatchError::InvalidArgument("`args` must be an array".into()))
                    }
                };
                codec.encode(&CallRequest {
                    function,
                    args: call_args,
                })?
            }
            OP_SET_GLOBAL => codec.encode(&GlobalAssignment {
                name: required_str(args, "name")?.to_string(),
                value: args
                    .get("value")
                    .map(EngineValue::from_json)
                    .unwrap_or(EngineValue::Undefined),
            })?,
            OP_GET_GLOBAL => required_str(args, "name")?.as_bytes().to_vec(),
            OP_RELEASE_FUNCTION => match args.get("function").and_then(FunctionRef::from_json) {
                Some(FunctionRef::Retained(id)) => codec.encode(&id)?,
                _ => {
                    return Err(DispatchError::InvalidArgument(
                        "`function` must be a function id".into(),
                    ))
                }
            },
            // disposeEngine, executePendingJobs
            _ => Vec::new(),
        };

        Ok(Operation::new(call.method.clone(), handle, payload))
    }
}

fn handle_arg(args: &Value) -> Result<Option<EngineHandle>, DispatchError> {
    match args.get("handle") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| DispatchError::InvalidArgument("`handle` must be a positive integer".into())),
    }
}

fn u64_arg(args: &Value, key: &str) -> Result<Option<u64>, DispatchError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| DispatchError::InvalidArgument(format!("`{}` must be a non-negative integer", key))),
    }
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>, DispatchError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| DispatchError::InvalidArgument(format!("`{}` must be a string", key))),
    }
}

fn bool_arg(args: &Value, key: &str) -> Result<Option<bool>, DispatchError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| DispatchError::InvalidArgument(format!("`{}` must be a boolean", key))),
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, DispatchError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::InvalidArgument(format!("missing '{}' string field", key)))
}
