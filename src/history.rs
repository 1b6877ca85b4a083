//! Read-only recent-activity lookup used by the risk scorer.

use crate::error::HistoryError;
use crate::types::transaction::Location;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Summary of a user's recent transactions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserHistory {
    /// Recent transaction amounts
    pub amounts: Vec<f64>,
    /// Places the user recently transacted from
    pub locations: Vec<Location>,
    /// Transactions inside the trailing velocity window
    pub recent_count: u32,
}

impl UserHistory {
    /// Mean of the recent amounts, if any
    pub fn trailing_average(&self) -> Option<f64> {
        if self.amounts.is_empty() {
            return None;
        }
        Some(self.amounts.iter().sum::<f64>() / self.amounts.len() as f64)
    }
}

/// Recent-activity collaborator keyed by user id.
///
/// `excluding` names the transaction being scored; a redelivered event must
/// not count towards its own history.
#[async_trait]
pub trait HistoryLookup: Send + Sync {
    async fn recent_activity(
        &self,
        user_id: &str,
        excluding: &str,
    ) -> Result<UserHistory, HistoryError>;
}

/// In-memory history, for tests and for seeding known profiles
#[derive(Default)]
pub struct InMemoryHistory {
    users: RwLock<HashMap<String, UserHistory>>,
    unavailable: AtomicBool,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the summary returned for a user
    pub fn insert(&self, user_id: &str, history: UserHistory) {
        if let Ok(mut users) = self.users.write() {
            users.insert(user_id.to_string(), history);
        }
    }

    /// Simulate an outage of the lookup
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryLookup for InMemoryHistory {
    async fn recent_activity(
        &self,
        user_id: &str,
        _excluding: &str,
    ) -> Result<UserHistory, HistoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(HistoryError::Unavailable("lookup disabled".to_string()));
        }
        let users = self
            .users
            .read()
            .map_err(|e| HistoryError::Unavailable(format!("lock poisoned: {}", e)))?;
        Ok(users.get(user_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_average() {
        let history = UserHistory {
            amounts: vec![40.0, 50.0, 60.0],
            ..Default::default()
        };
        assert_eq!(history.trailing_average(), Some(50.0));
        assert_eq!(UserHistory::default().trailing_average(), None);
    }

    #[tokio::test]
    async fn test_unknown_user_has_empty_history() {
        let lookup = InMemoryHistory::new();
        let history = lookup.recent_activity("nobody", "t1").await.unwrap();
        assert_eq!(history, UserHistory::default());
    }

    #[tokio::test]
    async fn test_outage_is_reported() {
        let lookup = InMemoryHistory::new();
        lookup.insert(
            "u1",
            UserHistory {
                recent_count: 2,
                ..Default::default()
            },
        );
        assert_eq!(lookup.recent_activity("u1", "t1").await.unwrap().recent_count, 2);

        lookup.set_available(false);
        assert!(lookup.recent_activity("u1", "t1").await.is_err());
    }
}
