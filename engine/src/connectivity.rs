//! Connectivity oracle.
//!
//! "Online" has exactly one meaning across the engine: the backend can be
//! reached at the transport level right now. Implementations answer that
//! question without keeping state between calls.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Answers "are we online right now".
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// A connectivity flag set by the caller.
///
/// Used in tests, and by hosts that learn reachability from the platform
/// and push it in.
#[derive(Debug)]
pub struct ManualConnectivity {
    online: AtomicBool,
}

impl ManualConnectivity {
    /// Create a flag with the given initial state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Create a flag wrapped in Arc for sharing.
    pub fn new_shared(online: bool) -> Arc<Self> {
        Arc::new(Self::new(online))
    }

    /// Change the reported state.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            if online {
                tracing::info!("Connectivity restored");
            } else {
                tracing::warn!("Connectivity lost");
            }
        }
    }
}

#[async_trait]
impl Connectivity for ManualConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
