// Graceful shutdown handling for signal trapping

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How far shutdown has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Stop dispatching, drain in-flight work
    Draining,
    /// Terminate immediately
    Forced,
}

/// Shared shutdown state across the run.
///
/// Each interrupt advances the phase: the first asks for a drain, the second
/// forces termination.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    interrupts: Arc<AtomicUsize>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            interrupts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Record one interrupt and return the resulting phase
    pub fn request_shutdown(&self) -> ShutdownPhase {
        let count = self.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        let phase = Self::phase_for(count);
        match phase {
            ShutdownPhase::Draining => {
                log::info!("[Shutdown] Shutdown requested, draining in-flight work (interrupt again to force)")
            }
            ShutdownPhase::Forced => log::warn!("[Shutdown] Forced shutdown requested"),
            ShutdownPhase::Running => {}
        }
        phase
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst) > 0
    }

    pub fn is_force_requested(&self) -> bool {
        self.phase() == ShutdownPhase::Forced
    }

    pub fn phase(&self) -> ShutdownPhase {
        Self::phase_for(self.interrupts.load(Ordering::SeqCst))
    }

    fn phase_for(count: usize) -> ShutdownPhase {
        match count {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Forced,
        }
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => log::info!("[Shutdown] Received SIGINT (Ctrl+C)"),
                SIGTERM => log::info!("[Shutdown] Received SIGTERM"),
                SIGHUP => log::info!("[Shutdown] Received SIGHUP"),
                _ => continue,
            }
            state.request_shutdown();
        }
    });

    log::info!("[Shutdown] Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("[Shutdown] Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("[Shutdown] Signal handler registered (Ctrl+C)");
    Ok(())
}
