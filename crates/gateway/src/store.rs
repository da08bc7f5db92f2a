//! Per-key in-memory state owned by the pipeline.
//!
//! Both stores are injected rather than global, and keyed on a `DashMap` so
//! that concurrent requests only contend on the same id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

use knowledge_hub_core::ChatMessage;

/// Lifecycle of a submitted chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Processing,
    Completed,
    Rejected,
    Failed,
    Cancelled,
}

/// State returned by `GET /chat/{request_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub status: RequestStatus,
    /// Pipeline stage that stopped the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn processing(
        request_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            status: RequestStatus::Processing,
            rejection_stage: None,
            message: None,
            model: None,
            provider: None,
            tokens_used: None,
            processing_time_ms: None,
            created_at: Utc::now(),
        }
    }

    /// Request stopped at `stage` before reaching a provider.
    pub fn rejected(
        request_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            status: RequestStatus::Rejected,
            rejection_stage: Some(stage.into()),
            ..Self::processing(request_id, conversation_id, user_id)
        }
    }
}

/// Request status by id.
#[derive(Debug, Default)]
pub struct RequestStore {
    records: DashMap<String, RequestRecord>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RequestRecord) {
        self.records.insert(record.request_id.clone(), record);
    }

    pub fn get(&self, request_id: &str) -> Option<RequestRecord> {
        self.records.get(request_id).map(|r| r.clone())
    }

    /// Apply `f` to a stored record. Returns false when the id is unknown.
    pub fn update(&self, request_id: &str, f: impl FnOnce(&mut RequestRecord)) -> bool {
        match self.records.get_mut(request_id) {
            Some(mut record) => {
                f(&mut record);
                true
            }
            None => false,
        }
    }

    /// Drop the message content of every request in a conversation,
    /// optionally only those of one user.
    pub fn purge_conversation(&self, conversation_id: &str, user_id: Option<&str>) -> usize {
        let mut purged = 0;
        for mut record in self.records.iter_mut() {
            let owned = user_id.map_or(true, |user| record.user_id == user);
            if owned && record.conversation_id == conversation_id && record.message.is_some() {
                record.message = None;
                purged += 1;
            }
        }
        purged
    }

    /// Forget finished requests created more than `max_age` ago.
    /// In-flight requests are kept.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let Some(cutoff) = cutoff(max_age) else {
            return 0;
        };
        let before = self.records.len();
        self.records
            .retain(|_, r| r.status == RequestStatus::Processing || r.created_at >= cutoff);
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The user/assistant turns of one user's conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation history, keyed by `(user_id, conversation_id)`.
///
/// Two users picking the same conversation id get separate histories.
#[derive(Debug)]
pub struct ConversationStore {
    conversations: DashMap<(String, String), Conversation>,
    max_turns: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(20)
    }
}

impl ConversationStore {
    /// Keep at most `max_turns` messages per conversation.
    pub fn new(max_turns: usize) -> Self {
        Self {
            conversations: DashMap::new(),
            max_turns,
        }
    }

    pub fn history(&self, user_id: &str, conversation_id: &str) -> Vec<ChatMessage> {
        self.conversations
            .get(&key(user_id, conversation_id))
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Append one completed exchange.
    pub fn append_exchange(
        &self,
        user_id: &str,
        conversation_id: &str,
        question: &str,
        answer: &str,
    ) {
        let mut entry = self
            .conversations
            .entry(key(user_id, conversation_id))
            .or_insert_with(|| Conversation {
                messages: Vec::new(),
                updated_at: Utc::now(),
            });
        entry.messages.push(ChatMessage::user(question));
        entry.messages.push(ChatMessage::assistant(answer));
        entry.updated_at = Utc::now();

        let overflow = entry.messages.len().saturating_sub(self.max_turns);
        if overflow > 0 {
            entry.messages.drain(..overflow);
        }
    }

    pub fn remove(&self, user_id: &str, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .remove(&key(user_id, conversation_id))
            .map(|(_, c)| c)
    }

    /// Remove a conversation id for every user. Returns the owners removed.
    pub fn remove_all(&self, conversation_id: &str) -> Vec<String> {
        let mut owners = Vec::new();
        self.conversations.retain(|(user, conversation), _| {
            if conversation == conversation_id {
                owners.push(user.clone());
                false
            } else {
                true
            }
        });
        owners
    }

    pub fn contains(&self, user_id: &str, conversation_id: &str) -> bool {
        self.conversations.contains_key(&key(user_id, conversation_id))
    }

    /// Drop conversations untouched for longer than `max_idle`.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = cutoff(max_idle) else {
            return 0;
        };
        let before = self.conversations.len();
        self.conversations.retain(|_, c| c.updated_at >= cutoff);
        before.saturating_sub(self.conversations.len())
    }
}

fn key(user_id: &str, conversation_id: &str) -> (String, String) {
    (user_id.to_string(), conversation_id.to_string())
}

fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).ok()?;
    Utc::now().checked_sub_signed(age)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_update_and_purge() {
        let store = RequestStore::new();
        store.insert(RequestRecord::processing("req-1", "conv_1", "alice"));
        assert!(store.update("req-1", |r| {
            r.status = RequestStatus::Completed;
            r.message = Some("Answer".into());
        }));
        assert!(!store.update("missing", |_| {}));

        assert_eq!(store.purge_conversation("conv_1", None), 1);
        let record = store.get("req-1").unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert!(record.message.is_none());
    }

    #[test]
    fn test_purge_scoped_to_user() {
        let store = RequestStore::new();
        for (id, user) in [("req-a", "alice"), ("req-b", "bob")] {
            let mut record = RequestRecord::processing(id, "conv_1", user);
            record.message = Some(format!("answer for {}", user));
            store.insert(record);
        }

        assert_eq!(store.purge_conversation("conv_1", Some("alice")), 1);
        assert!(store.get("req-a").unwrap().message.is_none());
        assert!(store.get("req-b").unwrap().message.is_some());
    }

    #[test]
    fn test_rejected_record() {
        let record = RequestRecord::rejected("req-1", "conv_1", "alice", "validation");
        assert_eq!(record.status, RequestStatus::Rejected);
        assert_eq!(record.rejection_stage.as_deref(), Some("validation"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["rejection_stage"], "validation");
    }

    #[test]
    fn test_prune_older_than_keeps_in_flight() {
        let store = RequestStore::new();
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);

        let mut old_done = RequestRecord::processing("old-done", "conv_1", "alice");
        old_done.status = RequestStatus::Completed;
        old_done.created_at = two_hours_ago;
        store.insert(old_done);

        let mut old_running = RequestRecord::processing("old-running", "conv_1", "alice");
        old_running.created_at = two_hours_ago;
        store.insert(old_running);

        store.insert(RequestRecord::rejected("fresh", "conv_1", "alice", "validation"));

        assert_eq!(store.prune_older_than(Duration::from_secs(3600)), 1);
        assert!(store.get("old-done").is_none());
        assert!(store.get("old-running").is_some());
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let store = ConversationStore::new(4);
        for i in 0..3 {
            store.append_exchange("alice", "conv_1", &format!("q{}", i), &format!("a{}", i));
        }
        let history = store.history("alice", "conv_1");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], ChatMessage::user("q1"));
        assert_eq!(history[3], ChatMessage::assistant("a2"));
    }

    #[test]
    fn test_same_conversation_id_is_per_user() {
        let store = ConversationStore::default();
        store.append_exchange("alice", "conv_1", "my salary is 250k", "noted");
        store.append_exchange("bob", "conv_1", "hello", "hi");

        let bob = store.history("bob", "conv_1");
        assert_eq!(bob, vec![ChatMessage::user("hello"), ChatMessage::assistant("hi")]);
        assert_eq!(store.history("alice", "conv_1").len(), 2);

        assert!(store.remove("bob", "conv_1").is_some());
        assert!(store.contains("alice", "conv_1"));
    }

    #[test]
    fn test_remove_all_and_prune() {
        let store = ConversationStore::default();
        store.append_exchange("alice", "conv_1", "q", "a");
        store.append_exchange("bob", "conv_1", "q", "a");
        store.append_exchange("bob", "conv_2", "q", "a");

        let mut owners = store.remove_all("conv_1");
        owners.sort();
        assert_eq!(owners, vec!["alice".to_string(), "bob".to_string()]);
        assert!(store.history("alice", "conv_1").is_empty());
        assert!(store.contains("bob", "conv_2"));

        assert_eq!(store.prune_idle(Duration::from_secs(3600)), 0);
        if let Some(mut c) = store.conversations.get_mut(&key("bob", "conv_2")) {
            c.updated_at = Utc::now() - chrono::Duration::hours(2);
        }
        assert_eq!(store.prune_idle(Duration::from_secs(3600)), 1);
        assert!(!store.contains("bob", "conv_2"));
    }
}
