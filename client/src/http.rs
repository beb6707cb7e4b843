//! HTTP transport for the engine's [`Remote`] boundary.
//!
//! The backend address is resolved on every request: a server override saved
//! under `SERVER_IP` wins over the configured default, so changing the
//! server in settings takes effect without a restart.

use aquapin_engine::{
    keys, ClientIdentity, JsonStore, Method, Remote, RemoteError, Request, CLIENT_ID_HEADER,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Port the backend listens on when only a host is saved.
pub const DEFAULT_BACKEND_PORT: u16 = 8000;

/// Resolve the backend base URL from the saved override or `default_url`.
///
/// A saved override may be a bare host (`192.168.1.20`), a host and port, or
/// a full URL.
pub async fn resolve_base_url(store: &JsonStore, default_url: &str) -> String {
    let saved = match store.get_raw(keys::SERVER_IP).await {
        Ok(saved) => saved,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read server override, using default");
            None
        }
    };

    match saved.as_deref().map(unquote).filter(|s| !s.is_empty()) {
        Some(ip) if ip.contains("://") => ip.trim_end_matches('/').to_string(),
        Some(ip) if ip.contains(':') => format!("http://{ip}"),
        Some(ip) => format!("http://{ip}:{DEFAULT_BACKEND_PORT}"),
        None => default_url.trim_end_matches('/').to_string(),
    }
}

/// Saved values may be plain text or a JSON string.
fn unquote(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim()
}

/// reqwest-backed [`Remote`].
#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    store: JsonStore,
    identity: Arc<ClientIdentity>,
    default_url: String,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("default_url", &self.default_url)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(
        store: JsonStore,
        identity: Arc<ClientIdentity>,
        default_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            store,
            identity,
            default_url: default_url.into(),
        })
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn execute(&self, request: &Request) -> Result<Value, RemoteError> {
        let base = resolve_base_url(&self.store, &self.default_url).await;
        let url = format!("{base}{}", request.path);

        let mut builder = self.client.request(Self::method(request.method), &url);
        match self.identity.get_or_create().await {
            Ok(client_id) => builder = builder.header(CLIENT_ID_HEADER, client_id),
            Err(e) => tracing::warn!(error = %e, "Sending request without client id"),
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!(method = %request.method, url = %url, "Sending request");
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let message = rejection_message(&text)
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_else(|| "request failed".to_string());
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        // A 2xx means the write was applied, whatever the body says.
        match serde_json::from_str(&text) {
            Ok(body) => Ok(body),
            Err(e) => {
                tracing::warn!(
                    url = %url,
                    status = status.as_u16(),
                    error = %e,
                    "Success response without a JSON body"
                );
                Ok(Value::String(text))
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(err.to_string())
    }
}

/// The backend reports failures as `{"detail": ...}`; validation errors put
/// a list there.
fn rejection_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquapin_engine::MemoryStore;

    fn store() -> JsonStore {
        JsonStore::new(MemoryStore::new_shared())
    }

    #[tokio::test]
    async fn default_url_without_override() {
        let store = store();
        assert_eq!(
            resolve_base_url(&store, "http://10.0.0.1:8000/").await,
            "http://10.0.0.1:8000"
        );
    }

    #[tokio::test]
    async fn saved_host_gets_backend_port() {
        let store = store();
        store.put_raw(keys::SERVER_IP, "192.168.1.20").await.unwrap();
        assert_eq!(
            resolve_base_url(&store, "http://127.0.0.1:8000").await,
            "http://192.168.1.20:8000"
        );

        store.put_raw(keys::SERVER_IP, "\"farm.local:9000\"").await.unwrap();
        assert_eq!(
            resolve_base_url(&store, "http://127.0.0.1:8000").await,
            "http://farm.local:9000"
        );

        store
            .put_raw(keys::SERVER_IP, "https://api.example.org/")
            .await
            .unwrap();
        assert_eq!(
            resolve_base_url(&store, "http://127.0.0.1:8000").await,
            "https://api.example.org"
        );
    }

    #[test]
    fn detail_extraction() {
        assert_eq!(
            rejection_message(r#"{"detail": "Pond not found"}"#),
            Some("Pond not found".into())
        );
        assert_eq!(
            rejection_message(r#"{"detail": [{"loc": ["body"]}]}"#),
            Some(r#"[{"loc":["body"]}]"#.into())
        );
        assert_eq!(rejection_message("Internal Server Error"), None);
    }
}
