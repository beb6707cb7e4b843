//! The network collaborator boundary.
//!
//! The engine never speaks HTTP itself. It builds [`Request`]s and hands them
//! to a [`Remote`], which returns the decoded response body or a typed
//! failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// HTTP verb of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Upper-case verb name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outgoing request: method, path relative to the backend root, body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Request {
    /// A GET without a body.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    /// A write with a JSON body.
    pub fn write(method: Method, path: impl Into<String>, body: Value) -> Self {
        Self {
            method,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// Why a request did not produce a response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The backend could not be reached (refused, DNS, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the allotted time.
    #[error("request timed out")]
    Timeout,

    /// The backend answered with a non-success status.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    /// True when the server saw the request and refused it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected { .. })
    }
}

/// Executes requests against the backend.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn execute(&self, request: &Request) -> Result<Value, RemoteError>;
}
