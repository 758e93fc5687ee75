//! Interrupt tracking.
//!
//! SIGINT, SIGTERM and SIGHUP are caught while a run holds resources. The
//! handler only stores the signal number; acquisition checks it between
//! steps, the foreground session receives terminal signals itself, and
//! teardown ignores it so no release is ever skipped.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

static RECEIVED: AtomicI32 = AtomicI32::new(0);

const CAUGHT: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

extern "C" fn record_signal(signal: libc::c_int) {
    RECEIVED.store(signal, Ordering::SeqCst);
}

/// Installs the recording handler; restores previous dispositions on drop.
pub struct InterruptGuard {
    previous: Vec<(Signal, SigAction)>,
}

impl InterruptGuard {
    pub fn install() -> nix::Result<Self> {
        RECEIVED.store(0, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        let mut previous = Vec::with_capacity(CAUGHT.len());
        for sig in CAUGHT {
            // SAFETY: the handler only performs an atomic store.
            let old = unsafe { signal::sigaction(sig, &action)? };
            previous.push((sig, old));
        }

        tracing::debug!("interrupt handlers installed");
        Ok(Self { previous })
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        for (sig, old) in self.previous.drain(..) {
            // SAFETY: restoring a disposition we previously read.
            if let Err(err) = unsafe { signal::sigaction(sig, &old) } {
                tracing::warn!("failed to restore handler for {sig}: {err}");
            }
        }
    }
}

/// Whether the current run has been asked to stop. Clones share one flag.
#[derive(Debug, Clone)]
pub struct Interrupt {
    local: Option<Arc<AtomicBool>>,
}

impl Interrupt {
    /// Backed by the process-wide signal handler.
    pub fn process() -> Self {
        Self { local: None }
    }

    /// Independent of process signals; set with [`Interrupt::trigger`].
    pub fn manual() -> Self {
        Self {
            local: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    pub fn trigger(&self) {
        match &self.local {
            Some(flag) => flag.store(true, Ordering::SeqCst),
            None => RECEIVED.store(libc::SIGINT, Ordering::SeqCst),
        }
    }

    pub fn is_requested(&self) -> bool {
        match &self.local {
            Some(flag) => flag.load(Ordering::SeqCst),
            None => RECEIVED.load(Ordering::SeqCst) != 0,
        }
    }

    /// Signal received by the process handler, if any.
    pub fn received_signal() -> Option<Signal> {
        Signal::try_from(RECEIVED.load(Ordering::SeqCst)).ok()
    }
}
