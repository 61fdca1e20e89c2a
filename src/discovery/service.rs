//! Background discovery: re-probe on an interval, fold results into the
//! registry, age stale entries and fan the online list out to subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::descriptor::ServerDescriptor;
use super::prober::Prober;
use super::registry::ServerRegistry;
use crate::error::DiscoveryError;

/// Callback invoked with the online server list after each successful round.
pub type Subscriber = Arc<dyn Fn(&[ServerDescriptor]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Pause between rounds.
    pub interval: Duration,
    /// Entries not refreshed for longer than this are marked offline.
    pub max_cache_age: Duration,
    /// Pause after a failed round before trying again.
    pub error_backoff: Duration,
    /// Upper bound [`DiscoveryService::stop`] waits for the loop.
    pub stop_grace: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_cache_age: Duration::from_secs(300),
            error_backoff: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
        }
    }
}

type SubscriberList = Arc<RwLock<Vec<(SubscriberId, Subscriber)>>>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the registry and is its only writer. Everyone else reads snapshots
/// through [`DiscoveryService::registry`].
pub struct DiscoveryService {
    registry: Arc<ServerRegistry>,
    prober: Prober,
    options: DiscoveryOptions,
    subscribers: SubscriberList,
    next_id: AtomicU64,
    running: Option<Running>,
}

impl DiscoveryService {
    pub fn new(prober: Prober, options: DiscoveryOptions) -> Self {
        Self::with_registry(Arc::new(ServerRegistry::new()), prober, options)
    }

    /// Uses an existing (for example seeded) registry.
    pub fn with_registry(
        registry: Arc<ServerRegistry>,
        prober: Prober,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            registry,
            prober,
            options,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
            running: None,
        }
    }

    pub fn registry(&self) -> Arc<ServerRegistry> {
        self.registry.clone()
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// One full round: probe, merge, sweep. Returns every known entry.
    pub async fn discover(&self) -> Result<Vec<ServerDescriptor>, DiscoveryError> {
        let found = self.prober.probe().await?;
        fold_round(&self.registry, found, self.options.max_cache_age);
        Ok(self.registry.list_all())
    }

    /// Same as [`discover`](Self::discover) with the short probe window.
    pub async fn quick_discover(&self) -> Result<Vec<ServerDescriptor>, DiscoveryError> {
        let found = self.prober.quick_probe().await?;
        fold_round(&self.registry, found, self.options.max_cache_age);
        Ok(self.registry.list_all())
    }

    pub fn add_subscriber<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&[ServerDescriptor]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawns the background loop. A second call while running only warns.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Continuous discovery already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(discovery_loop(
            self.registry.clone(),
            self.prober.clone(),
            self.options.clone(),
            self.subscribers.clone(),
            cancel.clone(),
        ));
        self.running = Some(Running { cancel, handle });
        info!(
            "Continuous discovery started (interval {:?})",
            self.options.interval
        );
    }

    /// Cancels the loop and waits at most `stop_grace` for it. Returns
    /// regardless of whether the task finished in time.
    pub async fn stop(&mut self) {
        let Some(Running { cancel, handle }) = self.running.take() else {
            return;
        };
        cancel.cancel();
        if tokio::time::timeout(self.options.stop_grace, handle)
            .await
            .is_err()
        {
            warn!(
                "Continuous discovery did not stop within {:?}; detaching",
                self.options.stop_grace
            );
        }
        info!("Continuous discovery stopped");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

fn fold_round(registry: &ServerRegistry, found: Vec<ServerDescriptor>, max_age: Duration) {
    let outcome = registry.merge(found);
    let marked = registry.sweep_offline(max_age);
    debug!(
        "Discovery round: {} new, {} refreshed, {} aged out",
        outcome.added, outcome.updated, marked
    );
}

async fn discovery_loop(
    registry: Arc<ServerRegistry>,
    prober: Prober,
    options: DiscoveryOptions,
    subscribers: SubscriberList,
    cancel: CancellationToken,
) {
    loop {
        let round = tokio::select! {
            _ = cancel.cancelled() => break,
            r = prober.probe() => r,
        };

        let wait = match round {
            Ok(found) => {
                fold_round(&registry, found, options.max_cache_age);
                let online = registry.list_online();
                if !online.is_empty() {
                    notify(&subscribers, &online);
                }
                options.interval
            }
            Err(e) => {
                error!(
                    "Discovery round failed: {}; retrying in {:?}",
                    e, options.error_backoff
                );
                options.error_backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }

    debug!("Continuous discovery loop exited");
}

/// Calls every subscriber in isolation: an error or a panic in one is
/// logged and the rest still run.
fn notify(subscribers: &SubscriberList, online: &[ServerDescriptor]) {
    let snapshot: Vec<(SubscriberId, Subscriber)> = subscribers.read().clone();
    for (id, callback) in snapshot {
        match catch_unwind(AssertUnwindSafe(|| callback(online))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Discovery subscriber {:?} failed: {:#}", id, e),
            Err(_) => error!("Discovery subscriber {:?} panicked", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::responder::{Responder, ResponderConfig};
    use crate::presence::OnlineCounter;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;

    async fn loopback_responder(name: &str, server_port: u16) -> Responder {
        let config = ResponderConfig {
            name: name.into(),
            server_port,
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_port: 0,
            ..ResponderConfig::default()
        };
        Responder::start(config, Arc::new(OnlineCounter::new()))
            .await
            .unwrap()
    }

    fn fast_options() -> DiscoveryOptions {
        DiscoveryOptions {
            interval: Duration::from_millis(100),
            max_cache_age: Duration::from_secs(300),
            error_backoff: Duration::from_millis(50),
            stop_grace: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn discover_folds_into_registry() {
        let mut responder = loopback_responder("Solo", 8100).await;
        let prober = Prober::new(responder.local_addr(), Duration::from_millis(300));
        let service = DiscoveryService::new(prober, fast_options());

        let all = service.discover().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Solo");
        assert_eq!(service.registry().list_online().len(), 1);

        responder.stop().await;
    }

    #[tokio::test]
    async fn failing_subscribers_do_not_stop_the_loop() {
        let mut responder = loopback_responder("Loop", 8101).await;
        let prober = Prober::new(responder.local_addr(), Duration::from_millis(100));
        let mut service = DiscoveryService::new(prober, fast_options());

        let calls = Arc::new(AtomicUsize::new(0));
        service.add_subscriber(|_| Err(anyhow::anyhow!("boom")));
        service.add_subscriber(|_| panic!("subscriber panic"));
        let seen = calls.clone();
        service.add_subscriber(move |servers| {
            assert_eq!(servers[0].name, "Loop");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        service.start();
        service.start();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(service.is_running());
        assert!(calls.load(Ordering::SeqCst) >= 2);

        service.stop().await;
        assert!(!service.is_running());
        let after = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after);

        responder.stop().await;
    }

    #[tokio::test]
    async fn removed_subscriber_is_not_called() {
        let mut responder = loopback_responder("Quiet", 8102).await;
        let prober = Prober::new(responder.local_addr(), Duration::from_millis(100));
        let mut service = DiscoveryService::new(prober, fast_options());

        let removed_calls = Arc::new(AtomicUsize::new(0));
        let kept_calls = Arc::new(AtomicUsize::new(0));
        let seen = removed_calls.clone();
        let id = service.add_subscriber(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let seen = kept_calls.clone();
        service.add_subscriber(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(service.remove_subscriber(id));
        assert!(!service.remove_subscriber(id));

        service.start();
        tokio::time::sleep(Duration::from_millis(800)).await;
        service.stop().await;

        assert!(kept_calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(removed_calls.load(Ordering::SeqCst), 0);

        responder.stop().await;
    }

    #[tokio::test]
    async fn socket_errors_back_off_and_retry() {
        // An IPv6 target from an IPv4 socket fails on every send.
        let prober = Prober::new("[::1]:37020".parse().unwrap(), Duration::from_millis(50));
        let mut service = DiscoveryService::new(prober, fast_options());
        assert!(service.discover().await.is_err());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        service.add_subscriber(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        service.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(service.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut service = DiscoveryService::new(Prober::default(), fast_options());
        service.stop().await;
        assert!(!service.is_running());
    }
}
