//! Collaborators consumed by the core: the server's user directory and the
//! client's presence updater.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use log::info;
use serde_json::json;

/// Source of the "users online" figure the discovery responder advertises.
///
/// Called once per discovery request from that request's own task.
pub trait UserDirectory: Send + Sync {
    fn online_users(&self) -> u32;
}

impl<F> UserDirectory for F
where
    F: Fn() -> u32 + Send + Sync,
{
    fn online_users(&self) -> u32 {
        self()
    }
}

/// A directory backed by a plain counter.
#[derive(Debug, Default)]
pub struct OnlineCounter(AtomicU32);

impl OnlineCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, count: u32) {
        self.0.store(count, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl UserDirectory for OnlineCounter {
    fn online_users(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Told when a session ends for good so the server can flip the user
/// offline. Failures are the caller's to log; they never change session
/// state.
pub trait PresenceUpdater: Send + Sync {
    fn mark_offline(&self, user_id: u64) -> BoxFuture<'_, Result<()>>;
}

/// Does nothing. For callers that track presence some other way.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPresence;

impl PresenceUpdater for NoopPresence {
    fn mark_offline(&self, _user_id: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Posts `{"user_id": N, "is_online": false}` to the server's
/// `/auth/status` endpoint.
#[derive(Debug, Clone)]
pub struct HttpPresence {
    client: reqwest::Client,
    endpoint: String,
}

const PRESENCE_TIMEOUT: Duration = Duration::from_secs(3);

impl HttpPresence {
    pub fn new(server: SocketAddr) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PRESENCE_TIMEOUT)
            .build()
            .context("building presence HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("http://{}/auth/status", server),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl PresenceUpdater for HttpPresence {
    fn mark_offline(&self, user_id: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&json!({ "user_id": user_id, "is_online": false }))
                .send()
                .await
                .with_context(|| format!("POST {}", self.endpoint))?;
            response
                .error_for_status()
                .with_context(|| format!("marking user {} offline", user_id))?;
            info!("Marked user {} offline", user_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_never_underflows() {
        let counter = OnlineCounter::new();
        counter.decrement();
        assert_eq!(counter.online_users(), 0);
        counter.increment();
        counter.increment();
        counter.decrement();
        assert_eq!(counter.online_users(), 1);
    }

    #[test]
    fn closures_are_directories() {
        let dir: Arc<dyn UserDirectory> = Arc::new(|| 7u32);
        assert_eq!(dir.online_users(), 7);
    }

    #[test]
    fn http_presence_targets_status_endpoint() {
        let p = HttpPresence::new("192.168.1.5:8000".parse().unwrap()).unwrap();
        assert_eq!(p.endpoint(), "http://192.168.1.5:8000/auth/status");
    }

    #[tokio::test]
    async fn http_presence_failure_is_an_error_not_a_panic() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let p = HttpPresence::new(addr).unwrap();
        assert!(p.mark_offline(1).await.is_err());
    }
}
