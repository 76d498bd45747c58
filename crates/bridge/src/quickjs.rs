//! QuickJS engine backed by `rquickjs`.
//!
//! Each [`QuickJsEngine`] owns one runtime and one full context. All
//! `rquickjs` types stay inside this module; values leave as
//! [`EngineValue`] and errors as [`EngineError`].

use crate::codec::EvalRequest;
use crate::traits::{EngineError, EngineFactory, EngineLimits, EngineResult, JsEngine};
use crate::types::EngineHandle;
use crate::value::{EngineValue, FunctionHandle, FunctionRef};
use rquickjs::context::EvalOptions;
use rquickjs::function::{Args, Rest};
use rquickjs::{
    qjs, Array, CaughtError, Coerced, Context, Ctx, Exception, Function, Module, Object,
    Persistent, Runtime, Type, Value,
};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// `tracing` target for script `console.*` output.
pub const CONSOLE_TARGET: &str = "js_console";

/// Nesting depth at which marshaling gives up (also catches cycles).
const MAX_DEPTH: usize = 64;

/// Module name used when `evalScript` runs a module without a file name.
const DEFAULT_MODULE_NAME: &str = "module.js";

/// QuickJS throws `null` when it cannot even allocate the out-of-memory
/// error. Within this distance of the limit such a throw counts as OOM.
const OOM_HEADROOM_BYTES: u64 = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct QuickJsFactory;

impl EngineFactory for QuickJsFactory {
    fn name(&self) -> &'static str {
        "quickjs"
    }

    fn create(&self, handle: EngineHandle, limits: &EngineLimits) -> EngineResult<Box<dyn JsEngine>> {
        Ok(Box::new(QuickJsEngine::new(handle, *limits)?))
    }
}

#[derive(Default)]
struct Retained {
    next_id: u64,
    functions: HashMap<u64, Persistent<Function<'static>>>,
}

impl Retained {
    fn insert(&mut self, func: Persistent<Function<'static>>) -> u64 {
        self.next_id += 1;
        self.functions.insert(self.next_id, func);
        self.next_id
    }
}

/// Per-call execution budget checked by the runtime interrupt handler.
#[derive(Clone, Default)]
struct Budget {
    deadline: Rc<Cell<Option<Instant>>>,
    tripped: Rc<Cell<bool>>,
}

impl Budget {
    fn arm(&self, timeout_ms: u64) {
        self.tripped.set(false);
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        self.deadline.set(deadline);
    }

    fn disarm(&self) {
        self.deadline.set(None);
        self.tripped.set(false);
    }

    fn check(&self) -> bool {
        match self.deadline.get() {
            Some(deadline) if Instant::now() >= deadline => {
                self.tripped.set(true);
                true
            }
            _ => false,
        }
    }

    fn tripped(&self) -> bool {
        self.tripped.get()
    }
}

pub struct QuickJsEngine {
    handle: EngineHandle,
    limits: EngineLimits,
    budget: Budget,
    // Field order is drop order: retained functions must go before the runtime.
    retained: Retained,
    context: Context,
    runtime: Runtime,
}

impl QuickJsEngine {
    pub fn new(handle: EngineHandle, limits: EngineLimits) -> EngineResult<Self> {
        let runtime = Runtime::new()
            .map_err(|e| EngineError::Fatal(format!("failed to create runtime: {}", e)))?;
        let context = Context::full(&runtime)
            .map_err(|e| EngineError::Fatal(format!("failed to create context: {}", e)))?;

        if limits.max_stack_size_bytes > 0 {
            runtime.set_max_stack_size(limits.max_stack_size_bytes as usize);
        }
        if limits.gc_threshold_bytes > 0 {
            runtime.set_gc_threshold(limits.gc_threshold_bytes as usize);
        }

        let budget = Budget::default();
        let watchdog = budget.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || watchdog.check())));

        context
            .with(|ctx| install_console(&ctx, handle))
            .map_err(|e| EngineError::Fatal(format!("failed to install console: {}", e)))?;

        // Applied last so the intrinsics above are not counted against scripts.
        if limits.memory_limit_bytes > 0 {
            let baseline = used_bytes(&runtime);
            if limits.memory_limit_bytes <= baseline {
                return Err(EngineError::InvalidArgument(format!(
                    "memory limit of {} bytes is below the engine's baseline of {} bytes",
                    limits.memory_limit_bytes, baseline
                )));
            }
            runtime.set_memory_limit(limits.memory_limit_bytes as usize);
        }

        info!(
            engine = handle,
            memory_limit = limits.memory_limit_bytes,
            stack_limit = limits.max_stack_size_bytes,
            timeout_ms = limits.execution_timeout_ms,
            "quickjs engine created"
        );

        Ok(Self {
            handle,
            limits,
            budget,
            retained: Retained::default(),
            context,
            runtime,
        })
    }

    pub fn retained_count(&self) -> usize {
        self.retained.functions.len()
    }

    /// Bytes currently allocated by the runtime.
    pub fn memory_used(&self) -> u64 {
        used_bytes(&self.runtime)
    }

    // Must run outside `Context::with`, which holds the runtime lock.
    fn classify<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        match result {
            Err(EngineError::Exception {
                ref message,
                name: None,
                ..
            }) if message == "null" && self.near_memory_limit() => {
                warn!(engine = self.handle, "null thrown at the memory limit");
                Err(EngineError::Fatal("out of memory".into()))
            }
            other => other,
        }
    }

    fn near_memory_limit(&self) -> bool {
        let limit = self.limits.memory_limit_bytes;
        limit > 0 && self.memory_used().saturating_add(OOM_HEADROOM_BYTES) >= limit
    }
}

fn used_bytes(runtime: &Runtime) -> u64 {
    runtime.memory_usage().malloc_size.max(0) as u64
}

impl JsEngine for QuickJsEngine {
    fn eval_script(&mut self, request: &EvalRequest) -> EngineResult<EngineValue> {
        if request.source.contains('\0') {
            return Err(EngineError::InvalidArgument("source must not contain NUL".into()));
        }
        let strict = request.strict.unwrap_or(self.limits.strict);
        let settle = self.limits.settle_promises;
        let max_nodes = self.limits.max_value_nodes;
        self.budget.arm(self.limits.execution_timeout_ms);
        let result = self.context.with(|ctx| {
            let mut scope = Scope::new(ctx, &mut self.retained, &self.budget, max_nodes);
            let value = if request.module {
                scope.eval_module(request)?
            } else {
                let value = scope.eval_global(request, strict)?;
                if settle { scope.settle(value)? } else { value }
            };
            scope.export(value, 0)
        });
        self.budget.disarm();
        self.classify(result)
    }

    fn call(&mut self, target: &FunctionRef, args: &[EngineValue]) -> EngineResult<EngineValue> {
        let settle = self.limits.settle_promises;
        let max_nodes = self.limits.max_value_nodes;
        self.budget.arm(self.limits.execution_timeout_ms);
        let result = self.context.with(|ctx| {
            let mut scope = Scope::new(ctx, &mut self.retained, &self.budget, max_nodes);
            let (func, this) = scope.resolve(target)?;
            let mut call_args = Args::new_unsized(scope.ctx.clone());
            call_args.this(this).map_err(|e| scope.fail(e))?;
            for arg in args {
                let value = scope.import(arg, 0)?;
                call_args.push_arg(value).map_err(|e| scope.fail(e))?;
            }
            let value = call_args
                .apply::<Value>(&func)
                .map_err(|e| scope.fail(e))?;
            let value = if settle { scope.settle(value)? } else { value };
            scope.export(value, 0)
        });
        self.budget.disarm();
        self.classify(result)
    }

    fn set_global(&mut self, name: &str, value: &EngineValue) -> EngineResult<()> {
        if name.is_empty() {
            return Err(EngineError::InvalidArgument("global name must not be empty".into()));
        }
        let max_nodes = self.limits.max_value_nodes;
        let result = self.context.with(|ctx| {
            let scope = Scope::new(ctx, &mut self.retained, &self.budget, max_nodes);
            let value = scope.import(value, 0)?;
            scope
                .ctx
                .globals()
                .set(name, value)
                .map_err(|e| scope.fail(e))
        });
        self.classify(result)
    }

    fn get_global(&mut self, name: &str) -> EngineResult<EngineValue> {
        if name.is_empty() {
            return Err(EngineError::InvalidArgument("global name must not be empty".into()));
        }
        let max_nodes = self.limits.max_value_nodes;
        let result = self.context.with(|ctx| {
            let mut scope = Scope::new(ctx, &mut self.retained, &self.budget, max_nodes);
            let value = scope
                .ctx
                .globals()
                .get::<_, Value>(name)
                .map_err(|e| scope.fail(e))?;
            scope.export(value, 0)
        });
        self.classify(result)
    }

    fn release_function(&mut self, id: u64) -> bool {
        self.retained.functions.remove(&id).is_some()
    }

    fn execute_pending_jobs(&mut self) -> EngineResult<u64> {
        self.budget.arm(self.limits.execution_timeout_ms);
        let mut count = 0u64;
        let result = loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => count += 1,
                Ok(false) => break Ok(count),
                Err(job) => {
                    let interrupted = self.budget.tripped();
                    break Err(job.0.with(|ctx| {
                        let thrown = ctx.catch();
                        let caught = match thrown
                            .as_object()
                            .and_then(|o| Exception::from_object(o.clone()))
                        {
                            Some(ex) => CaughtError::Exception(ex),
                            None => CaughtError::Value(thrown),
                        };
                        from_caught(&ctx, caught, interrupted)
                    }));
                }
            }
        };
        self.budget.disarm();
        self.classify(result)
    }
}

impl Drop for QuickJsEngine {
    fn drop(&mut self) {
        self.retained.functions.clear();
        debug!(engine = self.handle, "quickjs engine dropped");
    }
}

/// Borrowed view used while inside `Context::with`.
struct Scope<'a, 'js> {
    ctx: Ctx<'js>,
    retained: &'a mut Retained,
    budget: &'a Budget,
    /// Values still allowed in the current export.
    nodes_left: u64,
}

impl<'a, 'js> Scope<'a, 'js> {
    fn new(ctx: Ctx<'js>, retained: &'a mut Retained, budget: &'a Budget, max_nodes: u64) -> Self {
        Self {
            ctx,
            retained,
            budget,
            nodes_left: if max_nodes == 0 { u64::MAX } else { max_nodes },
        }
    }

    fn take_nodes(&mut self, count: u64) -> EngineResult<()> {
        if count > self.nodes_left {
            return Err(range_error("result has too many values to copy out of the engine"));
        }
        self.nodes_left -= count;
        Ok(())
    }

    fn fail(&self, err: rquickjs::Error) -> EngineError {
        let caught = CaughtError::from_error(&self.ctx, err);
        from_caught(&self.ctx, caught, self.budget.tripped())
    }

    fn eval_global(&self, request: &EvalRequest, strict: bool) -> EngineResult<Value<'js>> {
        let Some(file_name) = request.file_name.as_deref() else {
            let mut opts = EvalOptions::default();
            opts.strict = strict;
            return self
                .ctx
                .eval_with_options::<Value, _>(request.source.as_str(), opts)
                .map_err(|e| self.fail(e));
        };
        let source = CString::new(request.source.as_str())
            .map_err(|_| EngineError::InvalidArgument("source must not contain NUL".into()))?;
        let file_name = CString::new(file_name)
            .map_err(|_| EngineError::InvalidArgument("file name must not contain NUL".into()))?;
        let mut flags = qjs::JS_EVAL_TYPE_GLOBAL;
        if strict {
            flags |= qjs::JS_EVAL_FLAG_STRICT;
        }
        // SAFETY: both C strings outlive the call, the length excludes the
        // terminator, and `JS_Eval` returns an owned value for this context.
        let value = unsafe {
            let raw = qjs::JS_Eval(
                self.ctx.as_raw().as_ptr(),
                source.as_ptr(),
                request.source.len() as _,
                file_name.as_ptr(),
                flags as _,
            );
            Value::from_raw(self.ctx.clone(), raw)
        };
        if value.is_exception() {
            return Err(self.fail(rquickjs::Error::Exception));
        }
        Ok(value)
    }

    /// Evaluate an ES module and hand back its namespace object.
    fn eval_module(&self, request: &EvalRequest) -> EngineResult<Value<'js>> {
        let name = request.file_name.as_deref().unwrap_or(DEFAULT_MODULE_NAME);
        let declared = Module::declare(self.ctx.clone(), name, request.source.as_str())
            .map_err(|e| self.fail(e))?;
        let (module, done) = declared.eval().map_err(|e| self.fail(e))?;
        done.finish::<()>().map_err(|e| self.fail(e))?;
        module
            .namespace()
            .map(|ns| ns.into_value())
            .map_err(|e| self.fail(e))
    }

    /// Drive the job queue until a promise result settles.
    fn settle(&self, value: Value<'js>) -> EngineResult<Value<'js>> {
        match value.as_promise() {
            Some(promise) => promise.finish::<Value>().map_err(|e| self.fail(e)),
            None => Ok(value),
        }
    }

    fn resolve(&self, target: &FunctionRef) -> EngineResult<(Function<'js>, Value<'js>)> {
        match target {
            FunctionRef::Retained(id) => {
                let func = self.restore(*id)?;
                Ok((func, Value::new_undefined(self.ctx.clone())))
            }
            FunctionRef::Global(path) => {
                if path.is_empty() || path.split('.').any(str::is_empty) {
                    return Err(EngineError::InvalidArgument(format!(
                        "invalid function path `{}`",
                        path
                    )));
                }
                let mut parent = Value::new_undefined(self.ctx.clone());
                let mut current = self.ctx.globals().into_value();
                for segment in path.split('.') {
                    let next = match current.as_object() {
                        Some(obj) => obj.get::<_, Value>(segment).map_err(|e| self.fail(e))?,
                        None => return Err(type_error(format!("`{}` is not a function", path))),
                    };
                    parent = current;
                    current = next;
                }
                match current.into_function() {
                    Some(func) => Ok((func, parent)),
                    None => Err(type_error(format!("`{}` is not a function", path))),
                }
            }
        }
    }

    fn restore(&self, id: u64) -> EngineResult<Function<'js>> {
        let saved = self
            .retained
            .functions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown function id {}", id)))?;
        saved.restore(&self.ctx).map_err(|e| self.fail(e))
    }

    fn export(&mut self, value: Value<'js>, depth: usize) -> EngineResult<EngineValue> {
        if depth > MAX_DEPTH {
            return Err(range_error(format!("value nesting exceeds {} levels", MAX_DEPTH)));
        }
        self.take_nodes(1)?;
        let out = match value.type_of() {
            Type::Null => EngineValue::Null,
            Type::Bool => EngineValue::Bool(value.as_bool().unwrap_or_default()),
            Type::Int => EngineValue::Int(value.as_int().unwrap_or_default() as i64),
            Type::Float => EngineValue::from_f64(value.as_float().unwrap_or(f64::NAN)),
            Type::BigInt => {
                let digits = value
                    .get::<Coerced<String>>()
                    .map_err(|e| self.fail(e))?;
                EngineValue::BigInt(digits.0)
            }
            Type::String => EngineValue::String(value.get::<String>().map_err(|e| self.fail(e))?),
            Type::Array => match value.as_array() {
                Some(arr) => EngineValue::Array(self.export_items(arr, depth)?),
                None => EngineValue::Undefined,
            },
            Type::Function | Type::Constructor => match value.into_function() {
                Some(func) => self.retain(func),
                None => EngineValue::Undefined,
            },
            Type::Exception => match value.as_object() {
                Some(obj) => {
                    let mut props = self.export_props(obj, depth)?;
                    for key in ["name", "message", "stack"] {
                        if props.contains_key(key) {
                            continue;
                        }
                        if let Ok(Some(text)) = obj.get::<_, Option<String>>(key) {
                            props.insert(key.to_string(), EngineValue::String(text));
                        }
                    }
                    EngineValue::Object(props)
                }
                None => EngineValue::Undefined,
            },
            Type::Object | Type::Promise => match value.as_object() {
                Some(obj) => EngineValue::Object(self.export_props(obj, depth)?),
                None => EngineValue::Undefined,
            },
            // undefined, symbols, modules
            _ => EngineValue::Undefined,
        };
        Ok(out)
    }

    // `length` is script-controlled and may be up to 2^32 - 1 on a sparse array,
    // so it is checked against the node budget before any element is read.
    fn export_items(&mut self, arr: &Array<'js>, depth: usize) -> EngineResult<Vec<EngineValue>> {
        let length = arr
            .as_object()
            .get::<_, f64>("length")
            .map_err(|e| self.fail(e))?;
        if length > self.nodes_left as f64 {
            return Err(range_error(format!(
                "array of length {} has too many values to copy out of the engine",
                length
            )));
        }
        let mut items = Vec::new();
        for idx in 0..length as usize {
            let item = arr.get::<Value>(idx).map_err(|e| self.fail(e))?;
            items.push(self.export(item, depth + 1)?);
        }
        Ok(items)
    }

    fn export_props(
        &mut self,
        obj: &Object<'js>,
        depth: usize,
    ) -> EngineResult<BTreeMap<String, EngineValue>> {
        let mut props = BTreeMap::new();
        for entry in obj.props::<String, Value>() {
            let (key, item) = entry.map_err(|e| self.fail(e))?;
            props.insert(key, self.export(item, depth + 1)?);
        }
        Ok(props)
    }

    fn retain(&mut self, func: Function<'js>) -> EngineValue {
        let name = func
            .get::<_, Option<String>>("name")
            .ok()
            .flatten()
            .filter(|n| !n.is_empty());
        let id = self.retained.insert(Persistent::save(&self.ctx, func));
        EngineValue::Function(FunctionHandle { id, name })
    }

    fn import(&self, value: &EngineValue, depth: usize) -> EngineResult<Value<'js>> {
        if depth > MAX_DEPTH {
            return Err(EngineError::InvalidArgument(format!(
                "argument nesting exceeds {} levels",
                MAX_DEPTH
            )));
        }
        let ctx = &self.ctx;
        let out = match value {
            EngineValue::Undefined => Value::new_undefined(ctx.clone()),
            EngineValue::Null => Value::new_null(ctx.clone()),
            EngineValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
            EngineValue::Int(i) => match i32::try_from(*i) {
                Ok(small) => Value::new_int(ctx.clone(), small),
                Err(_) => Value::new_float(ctx.clone(), *i as f64),
            },
            EngineValue::Float(f) => Value::new_float(ctx.clone(), *f),
            EngineValue::BigInt(digits) => self.import_bigint(digits)?,
            EngineValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)
                .map_err(|e| self.fail(e))?
                .into_value(),
            EngineValue::Array(items) => {
                let arr = Array::new(ctx.clone()).map_err(|e| self.fail(e))?;
                for (idx, item) in items.iter().enumerate() {
                    let item = self.import(item, depth + 1)?;
                    arr.set(idx, item).map_err(|e| self.fail(e))?;
                }
                arr.into_value()
            }
            EngineValue::Object(props) => {
                let obj = Object::new(ctx.clone()).map_err(|e| self.fail(e))?;
                for (key, item) in props {
                    let item = self.import(item, depth + 1)?;
                    obj.set(key.as_str(), item).map_err(|e| self.fail(e))?;
                }
                obj.into_value()
            }
            EngineValue::Function(handle) => self.restore(handle.id)?.into_value(),
        };
        Ok(out)
    }

    fn import_bigint(&self, digits: &str) -> EngineResult<Value<'js>> {
        let unsigned = digits.strip_prefix('-').unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EngineError::InvalidArgument(format!(
                "`{}` is not a decimal BigInt",
                digits
            )));
        }
        let ctor = self
            .ctx
            .globals()
            .get::<_, Function>("BigInt")
            .map_err(|e| self.fail(e))?;
        ctor.call::<_, Value>((digits,)).map_err(|e| self.fail(e))
    }
}

fn type_error(message: String) -> EngineError {
    EngineError::Exception {
        message,
        name: Some("TypeError".into()),
        stack: None,
        interrupted: false,
    }
}

fn range_error(message: impl Into<String>) -> EngineError {
    EngineError::Exception {
        message: message.into(),
        name: Some("RangeError".into()),
        stack: None,
        interrupted: false,
    }
}

fn from_caught(ctx: &Ctx<'_>, caught: CaughtError<'_>, interrupted: bool) -> EngineError {
    match caught {
        CaughtError::Exception(ex) => {
            let message = ex.message().unwrap_or_default();
            let name = ex.get::<_, Option<String>>("name").ok().flatten();
            if name.as_deref() == Some("InternalError") && message == "out of memory" {
                return EngineError::Fatal("out of memory".into());
            }
            EngineError::Exception {
                message,
                name,
                stack: ex.stack().filter(|s| !s.is_empty()),
                interrupted,
            }
        }
        CaughtError::Value(thrown) => {
            let message = match thrown.get::<Coerced<String>>() {
                Ok(text) => text.0,
                Err(_) => {
                    ctx.catch();
                    "uncaught exception".to_string()
                }
            };
            EngineError::Exception {
                message,
                name: None,
                stack: None,
                interrupted,
            }
        }
        CaughtError::Error(rquickjs::Error::Allocation) => {
            EngineError::Fatal("allocation failed".into())
        }
        CaughtError::Error(rquickjs::Error::WouldBlock) => {
            EngineError::exception("promise cannot settle: job queue is empty")
        }
        CaughtError::Error(other) => EngineError::exception(other.to_string()),
    }
}

fn install_console(ctx: &Ctx<'_>, handle: EngineHandle) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    for level in ["log", "info", "debug", "warn", "error"] {
        console.set(level, console_method(ctx, level, handle)?)?;
    }
    ctx.globals().set("console", console)
}

fn console_method<'js>(
    ctx: &Ctx<'js>,
    level: &'static str,
    handle: EngineHandle,
) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
        let line = args
            .0
            .into_iter()
            .map(|arg| arg.0)
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            "error" => error!(target: CONSOLE_TARGET, engine = handle, "{}", line),
            "warn" => warn!(target: CONSOLE_TARGET, engine = handle, "{}", line),
            "debug" => debug!(target: CONSOLE_TARGET, engine = handle, "{}", line),
            _ => info!(target: CONSOLE_TARGET, engine = handle, "{}", line),
        }
    })
}
