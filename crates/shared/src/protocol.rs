use serde::{Deserialize, Serialize};

use crate::domain::Nation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Error,
}

/// One-way controller-to-presentation notifications. Exactly one
/// `Finished` is emitted per campaign session, on every terminal path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    Log {
        level: LogLevel,
        text: String,
    },
    /// Initial recipient list for the job (full list in one-shot mode,
    /// the first evaluation's list in continuous mode).
    JobSent {
        nations: Vec<Nation>,
    },
    /// Continuous mode resolved to nobody yet; delivery is idle until
    /// the refresh timer discovers recipients.
    JobWaiting,
    RecipientSent {
        nation: Nation,
    },
    RecipientFailed {
        nation: Nation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Previously-unseen nations discovered by a continuous refresh.
    NewRecipients {
        nations: Vec<Nation>,
    },
    Finished {
        cancelled: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_with_snake_case_tags() {
        let n = Notification::RecipientFailed {
            nation: Nation::new("testlandia"),
            detail: None,
        };
        let json = serde_json::to_string(&n).expect("serialize");
        assert!(json.contains("\"recipient_failed\""));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn finished_round_trips() {
        let n = Notification::Finished { cancelled: true };
        let json = serde_json::to_string(&n).expect("serialize");
        let back: Notification = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, n);
    }
}
