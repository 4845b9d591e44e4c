//! Watch event intake
//!
//! The watcher owns the cache writer. Every event is applied to the cache and
//! the affected object's key is handed to the work queue; nothing else happens
//! here.
//!
//! A relist (`Init` .. `InitDone`) replaces the cache wholesale. Keys seen
//! during the relist are enqueued once the new cache is in place, and objects
//! that vanished across the relist are reported as tombstones because their
//! delete events were never observed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

use csr_signer_queue::WorkQueue;

use crate::cache::object_key;

/// A deletion as observed by the watcher
#[derive(Debug, Clone)]
pub enum DeletedObject {
    /// The delete event carried the object's final state
    Final(CertificateSigningRequest),
    /// The delete was inferred; only the key and possibly a stale copy remain
    Tombstone {
        /// Key the object was cached under
        key: Option<String>,
        /// Last state seen before the delete
        last_known: Option<Arc<CertificateSigningRequest>>,
    },
}

impl DeletedObject {
    /// Recover the queue key, from the tombstone key or the object itself
    pub fn key(&self) -> Option<String> {
        match self {
            DeletedObject::Final(csr) => object_key(&csr.metadata),
            DeletedObject::Tombstone { key, last_known } => key
                .clone()
                .filter(|k| !k.is_empty())
                .or_else(|| last_known.as_ref().and_then(|c| object_key(&c.metadata))),
        }
    }
}

#[derive(Default)]
struct Relist {
    previous: HashMap<String, Arc<CertificateSigningRequest>>,
    seen: Vec<String>,
    seen_set: HashSet<String>,
}

/// Applies watch events to the cache and enqueues affected keys
pub struct ObjectWatcher {
    writer: Writer<CertificateSigningRequest>,
    queue: WorkQueue<String>,
    relist: Option<Relist>,
    span: Span,
}

impl ObjectWatcher {
    /// Create a watcher feeding `queue`
    pub fn new(queue: WorkQueue<String>, span: Span) -> Self {
        Self {
            writer: Writer::default(),
            queue,
            relist: None,
            span,
        }
    }

    /// Read handle on the cache this watcher maintains
    pub fn store(&self) -> Store<CertificateSigningRequest> {
        self.writer.as_reader()
    }

    /// Consume watch events until the stream ends or `cancel` fires
    pub async fn run<S>(mut self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<CertificateSigningRequest>, watcher::Error>>,
    {
        futures::pin_mut!(events);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(parent: &self.span, "Watcher cancelled");
                    break;
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => {
                        warn!(parent: &self.span, error = %e, "Watch error; the stream will retry with backoff");
                    }
                    None => {
                        warn!(parent: &self.span, "Watch stream ended");
                        break;
                    }
                },
            }
        }
    }

    /// Apply one event to the cache and enqueue the affected keys
    pub fn handle_event(&mut self, event: watcher::Event<CertificateSigningRequest>) {
        let _entered = self.span.clone().entered();
        match &event {
            watcher::Event::Apply(csr) => {
                let Some(key) = object_key(&csr.metadata) else {
                    warn!("Couldn't get key for object without a name");
                    return;
                };
                let known = self.store().get(&ObjectRef::from_obj(csr)).is_some();
                log_upsert(&key, known);
                self.writer.apply_watcher_event(&event);
                self.queue.add(key);
            }
            watcher::Event::Delete(csr) => {
                self.writer.apply_watcher_event(&event);
                self.on_delete(DeletedObject::Final(csr.clone()));
            }
            watcher::Event::Init => {
                debug!("Relist started");
                let previous = self
                    .store()
                    .state()
                    .into_iter()
                    .filter_map(|csr| object_key(&csr.metadata).map(|key| (key, csr)))
                    .collect();
                self.relist = Some(Relist {
                    previous,
                    ..Default::default()
                });
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(csr) => {
                let Some(key) = object_key(&csr.metadata) else {
                    warn!("Couldn't get key for object without a name");
                    return;
                };
                let relist = self.relist.get_or_insert_with(Relist::default);
                log_upsert(&key, relist.previous.contains_key(&key));
                if relist.seen_set.insert(key.clone()) {
                    relist.seen.push(key);
                }
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                let relist = self.relist.take().unwrap_or_default();
                debug!(objects = relist.seen.len(), "Relist complete");
                for (key, last_known) in relist.previous {
                    if !relist.seen_set.contains(&key) {
                        self.on_delete(DeletedObject::Tombstone {
                            key: Some(key),
                            last_known: Some(last_known),
                        });
                    }
                }
                for key in relist.seen {
                    self.queue.add(key);
                }
            }
        }
    }

    /// Enqueue a deleted object's key, or drop the event if no key can be recovered
    pub fn on_delete(&self, deleted: DeletedObject) {
        let _entered = self.span.clone().entered();
        match deleted.key() {
            Some(key) => {
                info!(csr = %key, "Deleting certificate request");
                self.queue.add(key);
            }
            None => warn!(deleted = ?deleted, "Couldn't get object from tombstone"),
        }
    }
}

fn log_upsert(key: &str, known: bool) {
    if known {
        info!(csr = %key, "Updating certificate request");
    } else {
        info!(csr = %key, "Adding certificate request");
    }
}
