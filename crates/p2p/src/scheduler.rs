//! Supervised periodic loops.
//!
//! Each loop is a single task ticking on its own interval. A pass runs to
//! completion before the next tick is awaited, so passes of the same loop
//! never overlap. Errors and panics inside a pass are logged with the loop
//! name and tick number and the loop keeps going.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Handle to a running supervised loop.
pub struct LoopHandle {
    name: &'static str,
    is_running: Arc<RwLock<bool>>,
    ticks: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LoopHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of passes started so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        *self.is_running.read()
    }

    /// Stop the loop. Safe to call more than once.
    pub fn stop(&self) {
        *self.is_running.write() = false;
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            debug!(loop_name = self.name, "Stopped loop");
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `body` every `period`, starting one period from now.
pub fn spawn_supervised<F, Fut>(name: &'static str, period: Duration, mut body: F) -> LoopHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let is_running = Arc::new(RwLock::new(true));
    let ticks = Arc::new(AtomicU64::new(0));
    let running = is_running.clone();
    let counter = ticks.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !*running.read() {
                break;
            }
            let tick = counter.fetch_add(1, Ordering::Relaxed) + 1;

            match AssertUnwindSafe(body()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(loop_name = name, tick, error = %err, "Loop pass failed");
                }
                Err(panic) => {
                    error!(
                        loop_name = name,
                        tick,
                        panic = %panic_message(panic.as_ref()),
                        "Loop pass panicked"
                    );
                }
            }
        }
    });

    LoopHandle {
        name,
        is_running,
        ticks,
        handle: Mutex::new(Some(handle)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
