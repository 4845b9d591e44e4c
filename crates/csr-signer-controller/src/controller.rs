//! Certificate controller: watch, queue, and workers wired together

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use tokio_util::sync::CancellationToken;
use tracing::{info, Span};

use csr_signer_common::telemetry::component_span;
use csr_signer_common::{Error, Result};
use csr_signer_queue::{default_controller_rate_limiter, WorkQueue};

use crate::handler::CsrHandler;
use crate::sync::Syncer;
use crate::watcher::ObjectWatcher;
use crate::worker::WorkerPool;

/// Name of the controller's work queue
pub const QUEUE_NAME: &str = "certificate";

/// A named CertificateSigningRequest controller
pub struct CertificateController {
    name: String,
    queue: WorkQueue<String>,
    watcher: ObjectWatcher,
    syncer: Arc<Syncer>,
    cache_sync_timeout: Duration,
    span: Span,
}

impl CertificateController {
    /// Create a controller that hands unsigned requests to `handler`
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn CsrHandler>,
        cache_sync_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let span = component_span("CertificateSigner");
        info!(parent: &span, controller = %name, "Creating certificate controller");

        let queue = WorkQueue::new(QUEUE_NAME, default_controller_rate_limiter());
        let watcher = ObjectWatcher::new(queue.clone(), span.clone());
        let syncer = Arc::new(Syncer::new(Arc::new(watcher.store()), handler));

        Self {
            name,
            queue,
            watcher,
            syncer,
            cache_sync_timeout,
            span,
        }
    }

    /// Read handle on the controller's object cache
    pub fn store(&self) -> Store<CertificateSigningRequest> {
        self.watcher.store()
    }

    /// Handle on the controller's work queue
    pub fn queue(&self) -> WorkQueue<String> {
        self.queue.clone()
    }

    /// Run until `cancel` fires
    ///
    /// Fails without starting workers if the cache does not sync within the
    /// configured deadline.
    pub async fn run<S>(self, events: S, workers: usize, cancel: CancellationToken) -> Result<()>
    where
        S: Stream<Item = std::result::Result<watcher::Event<CertificateSigningRequest>, watcher::Error>>
            + Send
            + 'static,
    {
        let Self {
            name,
            queue,
            watcher,
            syncer,
            cache_sync_timeout,
            span,
        } = self;
        info!(parent: &span, controller = %name, "Starting certificate controller");

        let store = watcher.store();
        let watch_cancel = cancel.child_token();
        let watch = tokio::spawn(watcher.run(events, watch_cancel.clone()));

        let cache = format!("{QUEUE_NAME}-{name}");
        info!(parent: &span, cache = %cache, "Waiting for cache to sync");
        let synced = tokio::select! {
            _ = cancel.cancelled() => None,
            synced = tokio::time::timeout(cache_sync_timeout, store.wait_until_ready()) => Some(synced),
        };
        match synced {
            None => {
                watch_cancel.cancel();
                let _ = watch.await;
                queue.shut_down();
                info!(parent: &span, controller = %name, "Cancelled before cache sync");
                return Ok(());
            }
            Some(Err(_)) => {
                watch_cancel.cancel();
                let _ = watch.await;
                queue.shut_down();
                return Err(Error::CacheSyncTimeout {
                    cache,
                    timeout: cache_sync_timeout,
                });
            }
            Some(Ok(Err(e))) => {
                queue.shut_down();
                return Err(Error::internal_with_context("watcher", e.to_string()));
            }
            Some(Ok(Ok(()))) => {}
        }
        info!(parent: &span, cache = %cache, "Caches are synced");

        let shutdown = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                queue.shut_down();
            })
        };

        info!(parent: &span, controller = %name, "Certificate controller started");
        WorkerPool::new(workers, span.clone())
            .run(queue, syncer, cancel.clone())
            .await;

        watch_cancel.cancel();
        let _ = watch.await;
        shutdown.abort();
        info!(parent: &span, controller = %name, "Shutting down certificate controller");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandleOutcome;
    use async_trait::async_trait;
    use futures::StreamExt;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestCondition, CertificateSigningRequestStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CsrHandler for CountingHandler {
        async fn handle(&self, _csr: CertificateSigningRequest) -> Result<HandleOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandleOutcome::Signed)
        }
    }

    fn csr(name: &str, certificate: Option<&[u8]>) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(CertificateSigningRequestStatus {
                certificate: certificate.map(|c| ByteString(c.to_vec())),
                conditions: Some(vec![CertificateSigningRequestCondition {
                    type_: "Approved".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_sync_timeout_is_fatal() {
        let handler = Arc::new(CountingHandler::default());
        let controller =
            CertificateController::new("test", handler.clone(), Duration::from_secs(60));
        let queue = controller.queue();

        let events = futures::stream::pending();
        let err = controller
            .run(events, 2, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CacheSyncTimeout { .. }));
        assert!(err.to_string().contains("certificate-test"));
        assert!(queue.is_shutting_down());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn signs_unsigned_requests_and_stops_on_cancel() {
        let handler = Arc::new(CountingHandler::default());
        let controller =
            CertificateController::new("test", handler.clone(), Duration::from_secs(5));
        let store = controller.store();

        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(csr("pending", None))),
            Ok(watcher::Event::InitApply(csr("done", Some(b"cert")))),
            Ok(watcher::Event::InitDone),
        ])
        .chain(futures::stream::pending());

        let cancel = CancellationToken::new();
        let running = tokio::spawn(controller.run(events, 2, cancel.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handler.calls.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "request was not handled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.state().len(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("controller should stop")
            .expect("controller task should not panic")
            .expect("controller should exit cleanly");
        // The already-signed request never reached the handler
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_sync_returns_ok() {
        let handler = Arc::new(CountingHandler::default());
        let controller = CertificateController::new("test", handler, Duration::from_secs(60));

        let cancel = CancellationToken::new();
        cancel.cancel();
        controller
            .run(futures::stream::pending(), 1, cancel)
            .await
            .expect("cancelled startup is not an error");
    }
}
