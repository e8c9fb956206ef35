//! Compensation journal for multi-step operations.
//!
//! Each deployment step that leaves an artifact behind pushes an inverse
//! action. On failure the journal runs in reverse (LIFO); every compensator
//! executes even when earlier ones fail, and all failures are returned
//! jointly. A journal is scoped to exactly one top-level operation.

use futures::future::BoxFuture;

use crate::error::{Error, Result};

/// What a compensation undoes. Used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackKind {
    DirRemove,
    FileRemove,
    UnitRemove,
    UnitRestore,
    GatewayRemove,
    GatewayRestore,
    ServiceStateRestore,
}

impl RollbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackKind::DirRemove => "dir-remove",
            RollbackKind::FileRemove => "file-remove",
            RollbackKind::UnitRemove => "unit-remove",
            RollbackKind::UnitRestore => "unit-restore",
            RollbackKind::GatewayRemove => "gateway-remove",
            RollbackKind::GatewayRestore => "gateway-restore",
            RollbackKind::ServiceStateRestore => "service-state-restore",
        }
    }
}

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub struct RollbackEntry {
    kind: RollbackKind,
    description: String,
    compensate: Compensation,
}

/// Ordered stack of compensating actions for one in-flight operation.
#[derive(Default)]
pub struct Journal {
    entries: Vec<RollbackEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a compensation. `compensate` is a deferred async action; it
    /// must not borrow the operation's locals.
    pub fn push<F>(&mut self, kind: RollbackKind, description: impl Into<String>, compensate: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.entries.push(RollbackEntry {
            kind,
            description: description.into(),
            compensate: Box::new(compensate),
        });
    }

    /// Run all compensations in reverse order, consuming the journal.
    /// Individual failures are collected, never short-circuited.
    pub async fn rollback(mut self) -> Vec<Error> {
        if self.entries.is_empty() {
            return Vec::new();
        }

        tracing::warn!("rolling back {} operation(s)", self.entries.len());
        let mut failures = Vec::new();

        while let Some(entry) = self.entries.pop() {
            tracing::info!(
                kind = entry.kind.as_str(),
                "rolling back: {}",
                entry.description
            );
            if let Err(e) = (entry.compensate)().await {
                tracing::error!(
                    kind = entry.kind.as_str(),
                    "rollback of '{}' failed: {}",
                    entry.description,
                    e
                );
                failures.push(e);
            }
        }

        failures
    }

    /// Drop all recorded compensations. Called once the operation commits.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn rollback_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut journal = Journal::new();

        for label in ["dir", "archive", "unit"] {
            let order = Arc::clone(&order);
            let kind = match label {
                "dir" => RollbackKind::DirRemove,
                "archive" => RollbackKind::FileRemove,
                _ => RollbackKind::UnitRemove,
            };
            journal.push(kind, format!("remove {}", label), move || {
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                })
            });
        }

        let failures = journal.rollback().await;
        assert!(failures.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["unit", "archive", "dir"]);
    }

    #[tokio::test]
    async fn failures_do_not_stop_remaining_compensations() {
        let executed = Arc::new(AtomicUsize::new(0));
        let mut journal = Journal::new();

        for i in 0..3 {
            let executed = Arc::clone(&executed);
            journal.push(RollbackKind::FileRemove, format!("step {}", i), move || {
                Box::pin(async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        Err(Error::System("compensation failed".into()))
                    } else {
                        Ok(())
                    }
                })
            });
        }

        let failures = journal.rollback().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(executed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clear_drops_entries_without_running_them() {
        let executed = Arc::new(AtomicUsize::new(0));
        let mut journal = Journal::new();
        let counter = Arc::clone(&executed);
        journal.push(RollbackKind::GatewayRemove, "remove block", move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        assert_eq!(journal.len(), 1);
        journal.clear();
        assert!(journal.is_empty());

        let failures = journal.rollback().await;
        assert!(failures.is_empty());
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }
}
