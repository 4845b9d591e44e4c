//! CertificateSigningRequest reconciliation
//!
//! Watch events feed keys into a deduplicating work queue; a pool of workers
//! syncs each key against the local cache, gates on approval, enrolls with the
//! configured authority, and writes the issued chain to the request's status.

#![deny(missing_docs)]

pub mod approval;
pub mod cache;
pub mod controller;
pub mod handler;
pub mod status;
pub mod sync;
pub mod watcher;
pub mod worker;

pub use approval::{approval_state, is_certificate_request_approved, ApprovalState};
pub use cache::{object_key, CsrLister};
pub use controller::CertificateController;
pub use handler::{CsrHandler, HandleOutcome, SigningHandler};
pub use status::{CsrStatusWriter, KubeStatusWriter};
pub use sync::{SyncOutcome, Syncer};
pub use watcher::{DeletedObject, ObjectWatcher};
pub use worker::{process_next_work_item, WorkerPool};
