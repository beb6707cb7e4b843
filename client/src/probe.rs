//! Connectivity probe.
//!
//! Online means the backend accepts a TCP connection within the probe
//! timeout. Nothing is cached between calls.

use crate::http::{resolve_base_url, DEFAULT_BACKEND_PORT};
use aquapin_engine::{Connectivity, JsonStore};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct ProbeConnectivity {
    store: JsonStore,
    default_url: String,
    timeout: Duration,
}

impl ProbeConnectivity {
    pub fn new(store: JsonStore, default_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            default_url: default_url.into(),
            timeout,
        }
    }

    async fn target(&self) -> Option<(String, u16)> {
        let base = resolve_base_url(&self.store, &self.default_url).await;
        let url = reqwest::Url::parse(&base).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default().unwrap_or(DEFAULT_BACKEND_PORT);
        Some((host, port))
    }
}

#[async_trait]
impl Connectivity for ProbeConnectivity {
    async fn is_online(&self) -> bool {
        let Some((host, port)) = self.target().await else {
            tracing::warn!(url = %self.default_url, "Backend address is not a valid URL");
            return false;
        };

        match tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(host = %host, port, error = %e, "Backend unreachable");
                false
            }
            Err(_) => {
                tracing::debug!(host = %host, port, "Connectivity probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquapin_engine::MemoryStore;
    use tokio::net::TcpListener;

    fn store() -> JsonStore {
        JsonStore::new(MemoryStore::new_shared())
    }

    #[tokio::test]
    async fn listening_backend_is_online() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = ProbeConnectivity::new(
            store(),
            format!("http://{addr}"),
            Duration::from_millis(500),
        );
        assert!(probe.is_online().await);
    }

    #[tokio::test]
    async fn closed_port_is_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = ProbeConnectivity::new(
            store(),
            format!("http://{addr}"),
            Duration::from_millis(500),
        );
        assert!(!probe.is_online().await);
    }

    #[tokio::test]
    async fn invalid_url_is_offline() {
        let probe = ProbeConnectivity::new(store(), "not a url", Duration::from_millis(50));
        assert!(!probe.is_online().await);
    }
}
