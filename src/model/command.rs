//! Operator commands delivered over pub/sub.

use serde::{Deserialize, Serialize};

/// A control message published on a queue's command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: CommandAction,
    pub target: CommandTarget,
    /// Opaque correlation key chosen by the sender.
    #[serde(default)]
    pub key: String,
}

impl Command {
    pub fn shutdown(target: CommandTarget) -> Self {
        Self {
            action: CommandAction::Shutdown,
            target,
            key: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Is this command addressed to `worker_id`?
    pub fn is_for(&self, worker_id: &str) -> bool {
        match &self.target {
            CommandTarget::All => true,
            CommandTarget::Worker(id) => id == worker_id,
        }
    }
}

/// Known actions. Unknown ones are kept so they can be logged and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandAction {
    Shutdown,
    Unknown(String),
}

impl From<String> for CommandAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "shutdown" => CommandAction::Shutdown,
            _ => CommandAction::Unknown(s),
        }
    }
}

impl From<CommandAction> for String {
    fn from(a: CommandAction) -> Self {
        match a {
            CommandAction::Shutdown => "shutdown".to_string(),
            CommandAction::Unknown(s) => s,
        }
    }
}

/// `"all"` or a single worker id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandTarget {
    All,
    Worker(String),
}

impl From<String> for CommandTarget {
    fn from(s: String) -> Self {
        if s == "all" {
            CommandTarget::All
        } else {
            CommandTarget::Worker(s)
        }
    }
}

impl From<CommandTarget> for String {
    fn from(t: CommandTarget) -> Self {
        match t {
            CommandTarget::All => "all".to_string(),
            CommandTarget::Worker(id) => id,
        }
    }
}
