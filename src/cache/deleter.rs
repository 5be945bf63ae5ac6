//! Background deleter thread
//!
//! Evicted entries are released off the caller's thread: dropping the last
//! reference unmaps the payload and removes its backing file, which can take
//! milliseconds on a busy disk.

use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};

enum Job<T> {
    Discard(Vec<T>),
    Flush(Sender<()>),
}

/// Owns a worker thread that drops whatever it is handed
pub(crate) struct Deleter<T: Send + 'static> {
    tx: Option<Sender<Job<T>>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Deleter<T> {
    /// Spawn the worker; on spawn failure items are dropped inline instead
    pub fn spawn(name: &str) -> Self {
        let (tx, rx) = channel::unbounded::<Job<T>>();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-deleter", name))
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::Discard(items) => {
                            debug!("Deleting {} cache entries", items.len());
                            drop(items);
                        }
                        Job::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });

        match spawned {
            Ok(worker) => Self {
                tx: Some(tx),
                worker: Some(worker),
            },
            Err(e) => {
                warn!("Failed to spawn deleter thread for {}: {}", name, e);
                Self {
                    tx: None,
                    worker: None,
                }
            }
        }
    }

    /// Queue items for release
    pub fn discard(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        match &self.tx {
            Some(tx) => {
                if let Err(channel::SendError(Job::Discard(items))) =
                    tx.send(Job::Discard(items))
                {
                    drop(items);
                }
            }
            None => drop(items),
        }
    }

    /// Block until every item queued so far has been released
    pub fn wait_idle(&self) {
        if let Some(tx) = &self.tx {
            let (ack_tx, ack_rx) = channel::bounded(1);
            if tx.send(Job::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }
}

impl<T: Send + 'static> Drop for Deleter<T> {
    fn drop(&mut self) {
        // closing the channel ends the worker loop once the queue is drained
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Deleter thread panicked");
            }
        }
    }
}
