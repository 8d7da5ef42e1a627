//! Ordered, non-transactional mutation batch.
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::k8s::{ClusterClient, Object, ObjectRef};

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert(Object),
    Delete(ObjectRef),
}

impl Change {
    pub fn describe(&self) -> String {
        match self {
            Change::Upsert(o) => format!("apply {}", o.to_ref()),
            Change::Delete(r) => format!("delete {r}"),
        }
    }
}

/// Staged changes applied in insertion order by `run`.
///
/// Every staged change is attempted even after a failure; failures are
/// reported together. Deleting something already gone is not a failure.
pub struct Batch<'a> {
    cluster: &'a dyn ClusterClient,
    changes: Vec<Change>,
}

impl<'a> Batch<'a> {
    pub fn new(cluster: &'a dyn ClusterClient) -> Self { Self { cluster, changes: Vec::new() } }

    pub fn stage(&mut self, object: Object) -> &mut Self {
        self.changes.push(Change::Upsert(object));
        self
    }

    pub fn stage_delete(&mut self, target: ObjectRef) -> &mut Self {
        self.changes.push(Change::Delete(target));
        self
    }

    pub fn changes(&self) -> &[Change] { &self.changes }

    pub async fn run(self, dry_run: bool) -> Result<()> {
        let total = self.changes.len();
        let mut failures = Vec::new();
        for change in self.changes {
            let what = change.describe();
            let outcome = match &change {
                Change::Upsert(o) => self.cluster.upsert(o, dry_run).await,
                Change::Delete(r) => match self.cluster.remove(r, dry_run).await {
                    Err(e) if e.is_not_found() => {
                        debug!(target = %r, "batch.delete.absent");
                        Ok(())
                    }
                    other => other,
                },
            };
            match outcome {
                Ok(()) => debug!(change = %what, dry_run, "batch.applied"),
                Err(e) => {
                    warn!(change = %what, error = %e, "batch.failed");
                    failures.push((what, e));
                }
            }
        }
        if failures.is_empty() { Ok(()) } else { Err(Error::Batch { total, failures }) }
    }
}
