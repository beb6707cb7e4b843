//! Cache invalidation.

use crate::error::Result;
use crate::store::JsonStore;

/// Remove every named cache entry.
///
/// Missing keys are fine. Every key is attempted even if an earlier removal
/// fails; the first failure is returned afterwards.
pub async fn invalidate<I, K>(store: &JsonStore, keys: I) -> Result<()>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut first_error = None;

    for key in keys {
        let key = key.as_ref();
        match store.remove(key).await {
            Ok(()) => tracing::debug!(key = %key, "Invalidated cache entry"),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to invalidate cache entry");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
