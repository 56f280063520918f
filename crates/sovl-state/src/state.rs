//! Conversation history and the hashed state that wraps it.

use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use sovl_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

pub const STATE_VERSION: u32 = 1;
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Bounded history of one conversation. Oldest messages fall off first.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConversationHistory {
    pub conversation_id: String,
    pub messages: VecDeque<Message>,
    pub max_len: usize,
}

impl ConversationHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            messages: VecDeque::new(),
            max_len: max_len.max(1),
        }
    }

    fn push(&mut self, message: Message) {
        while self.messages.len() >= self.max_len {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }
}

/// The persisted form of a state. `state_hash` always matches `history`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub version: u32,
    pub state_hash: String,
    pub history: ConversationHistory,
}

impl StateSnapshot {
    fn fresh(max_history: usize) -> Self {
        let history = ConversationHistory::new(max_history);
        Self {
            version: STATE_VERSION,
            state_hash: compute_hash(&history),
            history,
        }
    }

    fn rehash(&mut self) {
        self.state_hash = compute_hash(&self.history);
    }

    /// Reject snapshots whose stored hash disagrees with their content.
    pub fn verify(&self) -> Result<()> {
        let expected = compute_hash(&self.history);
        if expected != self.state_hash {
            return Err(Error::State(format!(
                "state hash mismatch: stored {} but content hashes to {}",
                self.state_hash, expected
            )));
        }
        Ok(())
    }
}

/// SHA-256 over the canonical JSON of the history, hex encoded.
pub fn compute_hash(history: &ConversationHistory) -> String {
    let bytes = serde_json::to_vec(history).unwrap_or_default();
    let d = digest::digest(&digest::SHA256, &bytes);
    d.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SovlState {
    data: Mutex<StateSnapshot>,
}

impl SovlState {
    pub fn new(max_history: usize) -> Self {
        Self {
            data: Mutex::new(StateSnapshot::fresh(max_history)),
        }
    }

    pub fn from_snapshot(snapshot: StateSnapshot) -> Result<Self> {
        snapshot.verify()?;
        Ok(Self {
            data: Mutex::new(snapshot),
        })
    }

    /// Hold the state lock for a multi-step operation (load/save).
    pub(crate) fn lock(&self) -> MutexGuard<'_, StateSnapshot> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state_hash(&self) -> String {
        self.lock().state_hash.clone()
    }

    pub fn conversation_id(&self) -> String {
        self.lock().history.conversation_id.clone()
    }

    pub fn message_count(&self) -> usize {
        self.lock().history.messages.len()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().history.messages.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.lock().clone()
    }

    pub fn add_message(&self, message: Message) -> String {
        let mut data = self.lock();
        data.history.push(message);
        data.rehash();
        data.state_hash.clone()
    }

    /// Record a prompt/response pair as one atomic change.
    pub fn record_exchange(&self, prompt: &str, response: &str) -> String {
        let mut data = self.lock();
        data.history.push(Message::user(prompt));
        data.history.push(Message::assistant(response));
        data.rehash();
        data.state_hash.clone()
    }

    /// Start a new conversation, dropping the current history.
    pub fn reset_conversation(&self) -> String {
        let mut data = self.lock();
        let max_len = data.history.max_len;
        data.history = ConversationHistory::new(max_len);
        data.rehash();
        data.history.conversation_id.clone()
    }

    /// Replace the whole state with a verified snapshot.
    pub fn restore(&self, snapshot: StateSnapshot) -> Result<()> {
        snapshot.verify()?;
        *self.lock() = snapshot;
        Ok(())
    }
}

impl std::fmt::Debug for SovlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.lock();
        f.debug_struct("SovlState")
            .field("state_hash", &data.state_hash)
            .field("conversation_id", &data.history.conversation_id)
            .field("messages", &data.history.messages.len())
            .finish()
    }
}
