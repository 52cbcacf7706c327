use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::signal;

use crate::error::Error;

/// Cooperative cancellation shared by every plugin loop. Once triggered it
/// stays triggered.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn trigger(&self) {
        *self.flag() = true;
        self.inner.1.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag()
    }

    /// Blocks until triggered.
    pub fn wait(&self) {
        let mut triggered = self.flag();
        while !*triggered {
            triggered = self
                .inner
                .1
                .wait(triggered)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Sleeps until `deadline` unless triggered first. Returns true when
    /// triggered.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut triggered = self.flag();
        loop {
            if *triggered {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = self
                .inner
                .1
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Triggers `shutdown` on SIGINT or SIGTERM. The thread is detached by the
/// caller; it never returns if no signal arrives.
pub fn listen_for_signals(shutdown: Shutdown) -> Result<JoinHandle<()>, Error> {
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let name = wait_for_signal();
            info!("received {}, shutting down. waiting for complete...", name);
            shutdown.trigger();
        })
        .map_err(|source| Error::Spawn {
            name: "signals".into(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_times_out_without_trigger() {
        let shutdown = Shutdown::new();
        let start = Instant::now();
        assert!(!shutdown.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.wait_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert!(waiter.join().unwrap());
        shutdown.wait();
        assert!(shutdown.is_triggered());
    }
}
