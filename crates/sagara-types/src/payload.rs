//! Transaction payload wire form and idempotency keys.
//!
//! Every handler dispatch receives a `TransactionPayload`. Its metadata
//! carries the idempotency key `<transaction_id>:<action>:<phase>` that
//! external completion uses to locate the step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::Phase;

/// Separator between idempotency key segments.
pub const KEY_SEPARATOR: char = ':';

/// Key injected into a child's payload data when its parent forwards its
/// response.
pub const RESPONSE_KEY: &str = "_response";

// ---------------------------------------------------------------------------
// PayloadMetadata
// ---------------------------------------------------------------------------

/// Routing and correlation metadata attached to every dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    /// The model id of the producing orchestrator.
    pub producer: String,
    /// Topic external workers reply to: `trans:<model_id>`.
    pub reply_to_topic: String,
    /// `<transaction_id>:<action>:<phase>`.
    pub idempotency_key: String,
    /// Action name being dispatched.
    pub action: String,
    /// Phase of the dispatch.
    pub action_type: Phase,
    /// 1-based attempt counter for this phase.
    pub attempt: u32,
    /// Dispatch timestamp.
    pub timestamp: DateTime<Utc>,
}

/// The payload handed to a step handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub metadata: PayloadMetadata,
    /// The transaction input, plus `_response` when the parent forwards its
    /// response.
    pub data: Value,
}

// ---------------------------------------------------------------------------
// IdempotencyKey
// ---------------------------------------------------------------------------

/// Parsed form of `<transaction_id>:<action>:<phase>`.
///
/// Transaction ids may themselves contain the separator; the action and
/// phase are always the last two segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub transaction_id: String,
    pub action: String,
    pub phase: Phase,
}

impl IdempotencyKey {
    pub fn new(transaction_id: impl Into<String>, action: impl Into<String>, phase: Phase) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            action: action.into(),
            phase,
        }
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.transaction_id, self.action, self.phase
        )
    }
}

impl std::str::FromStr for IdempotencyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, KEY_SEPARATOR);
        let phase = parts.next().ok_or_else(|| malformed(s))?;
        let action = parts.next().ok_or_else(|| malformed(s))?;
        let transaction_id = parts.next().ok_or_else(|| malformed(s))?;
        if transaction_id.is_empty() || action.is_empty() {
            return Err(malformed(s));
        }
        Ok(Self {
            transaction_id: transaction_id.to_string(),
            action: action.to_string(),
            phase: phase.parse().map_err(|_| malformed(s))?,
        })
    }
}

fn malformed(s: &str) -> String {
    format!("malformed idempotency key '{s}' (expected <transaction>:<action>:<phase>)")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_and_parse() {
        let key = IdempotencyKey::new("tx-1", "charge", Phase::Invoke);
        assert_eq!(key.to_string(), "tx-1:charge:invoke");

        let parsed: IdempotencyKey = "tx-1:charge:invoke".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn key_with_separator_in_transaction_id() {
        let parsed: IdempotencyKey = "order:2026:08:charge:compensate".parse().unwrap();
        assert_eq!(parsed.transaction_id, "order:2026:08");
        assert_eq!(parsed.action, "charge");
        assert_eq!(parsed.phase, Phase::Compensate);
    }

    #[test]
    fn malformed_keys_rejected() {
        assert!("charge:invoke".parse::<IdempotencyKey>().is_err());
        assert!("tx::invoke".parse::<IdempotencyKey>().is_err());
        assert!("tx:charge:rollback".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn payload_serde_shape() {
        let payload = TransactionPayload {
            metadata: PayloadMetadata {
                producer: "orders".to_string(),
                reply_to_topic: "trans:orders".to_string(),
                idempotency_key: "tx-1:charge:invoke".to_string(),
                action: "charge".to_string(),
                action_type: Phase::Invoke,
                attempt: 1,
                timestamp: Utc::now(),
            },
            data: serde_json::json!({"order": 7, "_response": {"reserved": true}}),
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"reply_to_topic\":\"trans:orders\""));
        assert!(json.contains("\"action_type\":\"invoke\""));
        let parsed: TransactionPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }
}
