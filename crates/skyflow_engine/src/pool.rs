//! Fixed-size worker pool for pipeline runs.
//!
//! Runs are queued on an unbounded channel, so submitting never blocks the
//! control plane; at most `size` runs execute at once. A panicking run is
//! contained and logged, the worker thread keeps serving the queue.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::ControlError;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(rx))?;
            workers.push(handle);
        }
        debug!("Started {} pool with {} workers", name, workers.len());
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task. Fails only once the pool is shut down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), ControlError> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(ControlError::PoolClosed)?;
        tx.send(Box::new(task)).map_err(|_| ControlError::PoolClosed)
    }

    /// Stop accepting tasks, let queued tasks finish, join the workers.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("Pool worker exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Task>>>) {
    loop {
        // Lock only for the receive so other workers can pick up tasks
        let task = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(task) = task else {
            break;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!("Pipeline task panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

/// Text of a panic payload, for the `panic!` forms that carry one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
