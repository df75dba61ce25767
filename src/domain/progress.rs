//! Periodic progress logging for long-running query phases.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// Counters shared between a running query and its ticker.
#[derive(Debug, Default)]
pub struct Progress {
    scanned: AtomicU64,
    results: AtomicU64,
}

impl Progress {
    pub fn add_scanned(&self, n: u64) {
        self.scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_result(&self) {
        self.results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scanned(&self) -> u64 {
        self.scanned.load(Ordering::Relaxed)
    }

    pub fn results(&self) -> u64 {
        self.results.load(Ordering::Relaxed)
    }
}

/// Background thread logging the counters every interval until stopped or
/// dropped.
#[derive(Debug)]
pub struct Ticker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Start ticking for `phase`. A zero interval disables the ticker.
    pub fn start(phase: &'static str, progress: Arc<Progress>, interval: Duration) -> Ticker {
        if interval.is_zero() {
            return Ticker {
                stop: None,
                handle: None,
            };
        }
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tracing::info!(
                        phase,
                        scanned = progress.scanned(),
                        results = progress.results(),
                        "query progress"
                    ),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Ticker {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        // closing the channel wakes the thread
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
