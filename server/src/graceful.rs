//! Graceful shutdown for the daily loop.
//!
//! A shutdown stops the scheduler, cancels the in-flight rotation at its next
//! epoch boundary and waits (bounded) for it to unwind.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    shutdown_signal: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    active_rotations: Arc<AtomicUsize>,
    is_draining: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        let (shutdown_signal, shutdown_rx) = watch::channel(false);

        Self {
            shutdown_signal,
            shutdown_rx,
            active_rotations: Arc::new(AtomicUsize::new(0)),
            is_draining: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.is_draining.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active_rotations.load(Ordering::SeqCst)
    }

    /// Mark a rotation as in flight until the guard drops.
    pub fn register_rotation(&self) -> RotationGuard {
        self.active_rotations.fetch_add(1, Ordering::SeqCst);
        RotationGuard {
            active_rotations: self.active_rotations.clone(),
        }
    }

    /// Signal shutdown and wait for in-flight rotations or the drain timeout.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.is_draining.store(true, Ordering::SeqCst);
        let _ = self.shutdown_signal.send(true);

        let start = std::time::Instant::now();
        let check_interval = Duration::from_millis(100);

        loop {
            let active = self.active_rotations.load(Ordering::SeqCst);
            if active == 0 {
                break;
            }
            if start.elapsed() >= self.drain_timeout {
                warn!(
                    "Drain timeout reached with {} rotation(s) still running",
                    active
                );
                break;
            }
            tokio::time::sleep(check_interval).await;
        }

        info!(
            "Shutdown complete after {:.1}s",
            start.elapsed().as_secs_f32()
        );
    }
}

/// Decrements the in-flight rotation count on drop.
pub struct RotationGuard {
    active_rotations: Arc<AtomicUsize>,
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        self.active_rotations.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Trigger a shutdown on SIGTERM or SIGINT.
#[cfg(unix)]
pub fn setup_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    for (kind, name) in [
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::interrupt(), "SIGINT"),
    ] {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to register {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            info!("Received {}", name);
            coordinator.shutdown().await;
        });
    }
}

#[cfg(not(unix))]
pub fn setup_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            coordinator.shutdown().await;
        }
    });
}
