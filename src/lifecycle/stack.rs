//! LIFO ledger of acquired resources.

use crate::error::TeardownError;
use crate::process::CommandExecutor;

/// A resource handle that knows how to release itself.
pub trait Release {
    /// Short description used in logs and teardown reports.
    fn label(&self) -> String;

    fn release(&self, exec: &dyn CommandExecutor) -> Result<(), TeardownError>;
}

/// Outcome of one [`ResourceStack::drain`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Labels of every release attempted, in execution order.
    pub attempted: Vec<String>,
    /// `(label, error)` for each release that failed.
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered record of release actions, pushed right after each successful
/// acquisition and executed most-recent-first.
///
/// Dropping a stack that still holds actions drains it, so early returns and
/// panics release everything acquired so far.
pub struct ResourceStack<'a> {
    exec: &'a dyn CommandExecutor,
    actions: Vec<Box<dyn Release + 'a>>,
}

impl<'a> ResourceStack<'a> {
    pub fn new(exec: &'a dyn CommandExecutor) -> Self {
        Self {
            exec,
            actions: Vec::new(),
        }
    }

    /// Record a resource that has just been acquired.
    pub fn push(&mut self, action: impl Release + 'a) {
        tracing::debug!("acquired {}", action.label());
        self.actions.push(Box::new(action));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Release everything in reverse acquisition order.
    ///
    /// A failing release is logged and does not stop the ones after it.
    /// Each action is popped before it runs, so it is attempted exactly once
    /// and a second drain is a no-op.
    pub fn drain(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.is_empty() {
            return report;
        }

        tracing::info!("releasing {} resource(s)", self.actions.len());
        while let Some(action) = self.actions.pop() {
            let label = action.label();
            match action.release(self.exec) {
                Ok(()) => tracing::info!("released {label}"),
                Err(err) => {
                    tracing::warn!("failed to release {label}: {err}");
                    report.failures.push((label.clone(), err.to_string()));
                }
            }
            report.attempted.push(label);
        }

        report
    }
}

impl Drop for ResourceStack<'_> {
    fn drop(&mut self) {
        if !self.is_empty() {
            tracing::warn!(
                "resource stack dropped with {} resource(s) held; releasing",
                self.actions.len()
            );
            self.drain();
        }
    }
}
