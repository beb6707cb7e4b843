//! Scripted collaborators shared by the unit tests.

use crate::remote::{Remote, RemoteError, Request};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

type Reply = Result<Value, RemoteError>;

/// A remote that answers from per-path scripts and records every request.
///
/// Each path holds a queue of replies. Replies are consumed in order; the
/// last one sticks. Unscripted paths fail with a transport error.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Request>>,
}

impl ScriptedRemote {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, path: &str, body: Value) {
        self.push(path, Ok(body));
    }

    pub fn fail(&self, path: &str, error: RemoteError) {
        self.push(path, Err(error));
    }

    pub fn calls(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, path: &str, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }
}

#[async_trait]
impl Remote for ScriptedRemote {
    async fn execute(&self, request: &Request) -> Result<Value, RemoteError> {
        self.calls.lock().unwrap().push(request.clone());

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&request.path) {
            Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
            Some(replies) if !replies.is_empty() => replies[0].clone(),
            _ => Err(RemoteError::Transport(format!("no route to {}", request.path))),
        }
    }
}
