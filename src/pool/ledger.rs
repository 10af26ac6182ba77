//! In-process ownership ledger: session id → credential username.
//!
//! The store's `credential_sessions` table is authoritative. The ledger
//! mirrors what this process acquired so a session asking twice is
//! rejected without a store round-trip, and so shutdown can report what
//! is still held.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

#[derive(Debug, Default)]
pub struct SessionLedger {
    holders: DashMap<String, String>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credential held by `session_id`, if this process acquired one.
    pub fn holder(&self, session_id: &str) -> Option<String> {
        self.holders.get(session_id).map(|r| r.value().clone())
    }

    /// Record ownership. Returns false if the session already holds a credential.
    pub fn record(&self, session_id: &str, username: &str) -> bool {
        match self.holders.entry(session_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(username.to_string());
                true
            }
        }
    }

    /// Forget ownership if it matches `username`.
    pub fn forget(&self, session_id: &str, username: &str) {
        self.holders
            .remove_if(session_id, |_, held| held.as_str() == username);
    }

    /// Forget ownership regardless of which credential was held.
    pub fn forget_session(&self, session_id: &str) -> Option<String> {
        self.holders.remove(session_id).map(|(_, username)| username)
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// Snapshot of (session, credential) pairs, sorted by session.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .holders
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_holds_at_most_one_credential() {
        let ledger = SessionLedger::new();
        assert!(ledger.record("s1", "alice"));
        assert!(!ledger.record("s1", "bob"));
        assert_eq!(ledger.holder("s1").as_deref(), Some("alice"));
    }

    #[test]
    fn test_forget_requires_matching_credential() {
        let ledger = SessionLedger::new();
        ledger.record("s1", "alice");
        ledger.forget("s1", "bob");
        assert_eq!(ledger.len(), 1);
        ledger.forget("s1", "alice");
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_snapshot_lists_holds_by_session() {
        let ledger = SessionLedger::new();
        ledger.record("s2", "bob");
        ledger.record("s1", "alice");
        ledger.record("s3", "alice");
        ledger.forget_session("s3");

        assert_eq!(
            ledger.snapshot(),
            vec![
                ("s1".to_string(), "alice".to_string()),
                ("s2".to_string(), "bob".to_string())
            ]
        );
    }
}
