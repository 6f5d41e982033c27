//! Pinned debugger worker.
//!
//! The kernel requires that every tracing request for a tracee originates from the
//! OS thread that attached to it. The worker owns the debugger (and therefore the
//! tracing descriptor) on one dedicated thread: other components submit operations
//! as messages and block on the reply. Messages are processed in arrival order,
//! which also serializes run control against breakpoint edits.

use crate::debugger::error::Error;
use crate::debugger::Debugger;
use log::info;
use nix::unistd::Pid;
use std::sync::mpsc;
use std::thread;

type Job = Box<dyn FnOnce(&mut Debugger) + Send>;

/// Handle of the pinned worker thread that owns the debugger.
pub struct DebuggerWorker {
    tx: mpsc::Sender<Job>,
}

impl DebuggerWorker {
    /// Spawn the worker. The debugger (including the tracee spawn or attach) is
    /// constructed on the worker thread, so all subsequent tracing calls come from
    /// the thread the kernel expects.
    ///
    /// # Arguments
    ///
    /// * `init`: debugger constructor, executed on the worker thread
    pub fn spawn<F>(init: F) -> Result<(DebuggerWorker, Pid), Error>
    where
        F: FnOnce() -> Result<Debugger, Error> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job>();
        let (init_tx, init_rx) = mpsc::channel::<Result<Pid, Error>>();

        thread::Builder::new()
            .name("debugger-worker".to_string())
            .spawn(move || {
                let mut debugger = match init() {
                    Ok(debugger) => {
                        let _ = init_tx.send(Ok(debugger.process_pid()));
                        debugger
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                info!(target: "server", "debugger worker started");
                while let Ok(job) = rx.recv() {
                    job(&mut debugger);
                }
                info!(target: "server", "debugger worker done");
            })
            .expect("spawn worker thread");

        let pid = init_rx
            .recv()
            .map_err(|_| Error::Hook(anyhow::anyhow!("debugger worker died during init")))??;
        Ok((DebuggerWorker { tx }, pid))
    }

    /// Execute an operation on the worker thread and wait for its result.
    pub fn with_debugger<R, F>(&self, f: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut Debugger) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let job: Job = Box::new(move |debugger| {
            let _ = result_tx.send(f(debugger));
        });
        self.tx
            .send(job)
            .map_err(|_| Error::Hook(anyhow::anyhow!("debugger worker is gone")))?;
        result_rx
            .recv()
            .map_err(|_| Error::Hook(anyhow::anyhow!("debugger worker is gone")))
    }
}
