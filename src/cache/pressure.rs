//! System memory probing and the background pressure monitor

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use sysinfo::System;
use tracing::{debug, warn};

/// Source of physical memory figures, in bytes
pub trait SystemMemory: Send + Sync {
    fn total_ram(&self) -> u64;

    /// Memory the OS can hand out without swapping
    fn free_ram(&self) -> u64;
}

/// [`SystemMemory`] backed by `sysinfo`
pub struct SysinfoMemory {
    system: Mutex<System>,
}

impl SysinfoMemory {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemory for SysinfoMemory {
    fn total_ram(&self) -> u64 {
        self.system.lock().total_memory()
    }

    fn free_ram(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Fixed, settable memory figures
#[derive(Debug)]
pub struct StaticMemory {
    total: AtomicU64,
    free: AtomicU64,
}

impl StaticMemory {
    pub fn new(total: u64, free: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            free: AtomicU64::new(free),
        }
    }

    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl SystemMemory for StaticMemory {
    fn total_ram(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    fn free_ram(&self) -> u64 {
        self.free.load(Ordering::SeqCst)
    }
}

/// Periodically runs a memory check on its own thread
///
/// The check returns false to stop the monitor. Dropping the monitor stops
/// it and joins the thread.
pub struct PressureMonitor {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl PressureMonitor {
    pub fn spawn<F>(interval: Duration, mut check: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop, stopped) = channel::bounded::<()>(1);
        let spawned = std::thread::Builder::new()
            .name("cache-pressure".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !check() {
                            debug!("Pressure monitor target is gone");
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(worker) => Self {
                stop: Some(stop),
                worker: Some(worker),
            },
            Err(e) => {
                warn!("Failed to spawn pressure monitor: {}", e);
                Self {
                    stop: None,
                    worker: None,
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for PressureMonitor {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Pressure monitor thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for PressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureMonitor")
            .field("running", &self.is_running())
            .finish()
    }
}
