use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::PatchDbError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum LoaderCommand {
    Run(Job),
    /// Signals once everything queued before it, idle hook included, ran.
    Barrier(Sender<()>),
    Shutdown,
}

/// Submission side of the loader. Cheap to clone.
#[derive(Clone)]
pub(crate) struct LoaderQueue {
    commands: Sender<LoaderCommand>,
    pending: Arc<AtomicUsize>,
}

impl LoaderQueue {
    fn new() -> (Self, Receiver<LoaderCommand>) {
        let (tx, rx) = unbounded();
        (
            Self {
                commands: tx,
                pending: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Queues `job` behind everything submitted before it.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.commands.send(LoaderCommand::Run(Box::new(job))).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("patch loader is gone, dropping job");
            return false;
        }
        true
    }

    /// Jobs submitted but not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Single worker thread running jobs strictly in submission order.
pub(crate) struct Loader {
    queue: LoaderQueue,
    receiver: Option<Receiver<LoaderCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl Loader {
    pub fn new() -> Self {
        let (queue, receiver) = LoaderQueue::new();
        Self {
            queue,
            receiver: Some(receiver),
            handle: None,
        }
    }

    pub fn queue(&self) -> LoaderQueue {
        self.queue.clone()
    }

    /// Starts the worker. `on_idle` runs on the worker whenever it finished
    /// a job and nothing else is queued.
    pub fn start(
        &mut self,
        name: &str,
        on_idle: impl Fn() + Send + 'static,
    ) -> Result<(), PatchDbError> {
        let Some(receiver) = self.receiver.take() else {
            return Ok(());
        };
        let pending = Arc::clone(&self.queue.pending);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker(receiver, pending, on_idle))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Blocks until the queue is drained, including jobs that were queued by
    /// other jobs while waiting.
    ///
    /// Must not be called from a loader job.
    pub fn wait_idle(&self) -> Result<(), PatchDbError> {
        loop {
            let (tx, rx) = bounded(1);
            self.queue
                .commands
                .send(LoaderCommand::Barrier(tx))
                .map_err(|_| PatchDbError::LoaderExited)?;
            rx.recv().map_err(|_| PatchDbError::LoaderExited)?;
            if self.queue.pending() == 0 {
                return Ok(());
            }
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.queue.commands.send(LoaderCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(receiver: Receiver<LoaderCommand>, pending: Arc<AtomicUsize>, on_idle: impl Fn()) {
    while let Ok(command) = receiver.recv() {
        match command {
            LoaderCommand::Shutdown => break,
            LoaderCommand::Barrier(done) => {
                let _ = done.send(());
            }
            LoaderCommand::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("patch loader job panicked");
                }
                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    on_idle();
                }
            }
        }
    }
}
