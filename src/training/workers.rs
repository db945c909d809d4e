//! Fixed-size worker pool that executes training jobs off the caller's thread.
//!
//! Jobs are queued over an mpsc channel and picked up by whichever worker is
//! free. The pool tracks in-flight work so callers can wait for quiescence,
//! and dropping it closes the queue and joins every worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(&self) {
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        *count += 1;
    }

    fn leave(&self) {
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct Pool {
    tx: Option<mpsc::Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    in_flight: Arc<InFlight>,
}

impl Pool {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let shared_rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(InFlight::default());

        let handles = (0..size.max(1))
            .map(|idx| {
                let rx = shared_rx.clone();
                let in_flight = in_flight.clone();
                thread::Builder::new()
                    .name(format!("retrain-worker-{idx}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = rx.lock().unwrap_or_else(|p| p.into_inner());
                            guard.recv()
                        };
                        match job {
                            Ok(job) => {
                                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                    tracing::error!(worker = idx, "training job panicked");
                                }
                                in_flight.leave();
                            }
                            Err(_) => break,
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::error!(error = %err, "failed to spawn worker thread");
                    None
                }
            })
            .collect();

        Self {
            tx: Some(tx),
            handles,
            in_flight,
        }
    }

    /// Queue a job. Runs inline when no worker thread is available.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_flight.enter();
        let job: Job = Box::new(job);
        let rejected = match &self.tx {
            Some(tx) if !self.handles.is_empty() => tx.send(job).err().map(|e| e.0),
            _ => Some(job),
        };
        if let Some(job) = rejected {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("training job panicked");
            }
            self.in_flight.leave();
        }
    }

    /// Jobs queued or executing.
    pub fn in_flight(&self) -> usize {
        *self
            .in_flight
            .count
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Block until no job is queued or running. `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .in_flight
            .count
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.in_flight.idle.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
