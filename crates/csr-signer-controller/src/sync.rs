//! Per-key sync: cache lookup, idempotency guard, handler dispatch

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use csr_signer_common::Result;

use crate::cache::CsrLister;
use crate::handler::{CsrHandler, HandleOutcome};

/// Result of syncing one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The object is no longer in the cache
    Deleted,
    /// The object already carries a certificate
    AlreadySigned,
    /// The handler declined the unapproved request
    NotApproved,
    /// The handler enrolled the request
    Signed,
}

/// Resolves a key against the cache and hands unsigned requests to the handler
pub struct Syncer {
    lister: Arc<dyn CsrLister>,
    handler: Arc<dyn CsrHandler>,
}

impl Syncer {
    /// Create a syncer
    pub fn new(lister: Arc<dyn CsrLister>, handler: Arc<dyn CsrHandler>) -> Self {
        Self { lister, handler }
    }

    /// Sync the object stored under `key`
    pub async fn sync(&self, key: &str) -> Result<SyncOutcome> {
        let start = Instant::now();
        let outcome = self.sync_inner(key).await;
        debug!(
            key,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished syncing certificate request"
        );
        outcome
    }

    async fn sync_inner(&self, key: &str) -> Result<SyncOutcome> {
        let Some(cached) = self.lister.get(key)? else {
            debug!(key, "Certificate request has been deleted");
            return Ok(SyncOutcome::Deleted);
        };

        let signed = cached
            .status
            .as_ref()
            .and_then(|s| s.certificate.as_ref())
            .is_some_and(|c| !c.0.is_empty());
        if signed {
            return Ok(SyncOutcome::AlreadySigned);
        }

        // The cached object is shared; the handler gets its own copy.
        let snapshot = (*cached).clone();
        match self.handler.handle(snapshot).await? {
            HandleOutcome::NotApproved => Ok(SyncOutcome::NotApproved),
            HandleOutcome::Signed => Ok(SyncOutcome::Signed),
        }
    }
}
