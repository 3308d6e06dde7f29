//! History store trait — conversational history as an external collaborator.
//!
//! Persistence of session history lives outside the core. Callers may also
//! pass history directly with a query, which is preferred: the pipeline then
//! works even when the store is down.

use crate::error::HistoryError;
use crate::message::Message;
use async_trait::async_trait;

/// Read-only access to prior session messages.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch the ordered message history for a session.
    async fn get_history(
        &self,
        session_id: &str,
    ) -> std::result::Result<Vec<Message>, HistoryError>;
}

/// A history store that always returns an empty history.
pub struct NoopHistoryStore;

#[async_trait]
impl HistoryStore for NoopHistoryStore {
    async fn get_history(
        &self,
        _session_id: &str,
    ) -> std::result::Result<Vec<Message>, HistoryError> {
        Ok(Vec::new())
    }
}
