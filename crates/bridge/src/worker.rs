//! Per-handle engine worker.
//!
//! Each engine lives on its own named thread for its whole life. Callers
//! queue jobs on an mpsc channel and block on a one-shot reply channel, so
//! jobs for one handle run strictly in arrival order while distinct handles
//! run in parallel.

use crate::traits::{EngineCommand, EngineError, EngineFactory, EngineLimits, EngineResult};
use crate::types::EngineHandle;
use crate::value::EngineValue;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

enum Job {
    Run {
        command: EngineCommand,
        reply: SyncSender<EngineResult<EngineValue>>,
    },
    Dispose {
        reply: SyncSender<()>,
    },
}

pub struct EngineWorker {
    handle: EngineHandle,
    sender: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Set by the worker before it reports a fatal error.
    failed: Arc<AtomicBool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineWorker {
    /// Start a worker thread and build the engine on it. Returns once the
    /// engine exists, or with the creation error.
    pub fn spawn(
        handle: EngineHandle,
        factory: Arc<dyn EngineFactory>,
        limits: EngineLimits,
        stack_size: usize,
    ) -> EngineResult<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<EngineResult<()>>(1);
        let failed = Arc::new(AtomicBool::new(false));
        let worker_failed = failed.clone();

        let mut builder = thread::Builder::new().name(format!("qjs-engine-{}", handle));
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }
        let thread = builder
            .spawn(move || worker_loop(handle, factory, limits, rx, ready_tx, worker_failed))
            .map_err(|e| EngineError::Fatal(format!("failed to spawn engine thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                handle,
                sender: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(thread)),
                failed,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(EngineError::Fatal("engine thread exited during startup".into()))
            }
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle
    }

    /// True once the engine reported a fatal error and stopped taking jobs.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.sender).is_some() && !self.has_failed()
    }

    /// Queue a command and wait for its result.
    pub fn run(&self, command: EngineCommand) -> EngineResult<EngineValue> {
        let sender = lock(&self.sender).clone().ok_or(EngineError::Terminated)?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        sender
            .send(Job::Run {
                command,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::Terminated)?;
        reply_rx.recv().map_err(|_| EngineError::Terminated)?
    }

    /// Queue disposal behind any pending jobs, wait for the engine to drop,
    /// then join the thread. Idempotent.
    pub fn dispose(&self) {
        if let Some(sender) = lock(&self.sender).take() {
            let (reply_tx, reply_rx) = mpsc::sync_channel(1);
            if sender.send(Job::Dispose { reply: reply_tx }).is_ok() {
                let _ = reply_rx.recv();
            }
        }
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!(engine = self.handle, "engine thread panicked outside a job");
            }
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn worker_loop(
    handle: EngineHandle,
    factory: Arc<dyn EngineFactory>,
    limits: EngineLimits,
    jobs: Receiver<Job>,
    ready: SyncSender<EngineResult<()>>,
    failed: Arc<AtomicBool>,
) {
    let created = panic::catch_unwind(AssertUnwindSafe(|| factory.create(handle, &limits)));
    let mut engine = match created {
        Ok(Ok(engine)) => engine,
        Ok(Err(e)) => {
            let _ = ready.send(Err(e));
            return;
        }
        Err(payload) => {
            let _ = ready.send(Err(EngineError::Fatal(format!(
                "engine creation panicked: {}",
                panic_message(payload.as_ref())
            ))));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    drop(ready);

    let mut dispose_reply = None;
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Run { command, reply } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.run(command)))
                    .unwrap_or_else(|payload| {
                        Err(EngineError::Fatal(format!(
                            "engine panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                let fatal = outcome.as_ref().is_err_and(EngineError::is_fatal);
                if fatal {
                    failed.store(true, Ordering::SeqCst);
                }
                let _ = reply.send(outcome);
                if fatal {
                    break;
                }
            }
            Job::Dispose { reply } => {
                dispose_reply = Some(reply);
                break;
            }
        }
    }

    // Anything still queued fails with a closed reply channel.
    drop(jobs);
    if panic::catch_unwind(AssertUnwindSafe(move || drop(engine))).is_err() {
        warn!(engine = handle, "engine panicked while dropping");
    }
    debug!(engine = handle, "engine worker stopped");
    if let Some(reply) = dispose_reply {
        let _ = reply.send(());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
