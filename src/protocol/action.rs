//! Voice action model.
//!
//! Actions are the units of a response the voice peer can execute on behalf
//! of the caller: speak a line, collect slot values, or end the call. Agent
//! replies may carry them as a JSON envelope `{ "actions": [...] }`, either
//! bare or inside a fenced code block; [`parse_structured`] extracts and
//! validates them, rejecting whole candidates on any malformed member.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A single voice action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Speak a line to the caller
    Speak {
        message_id: String,
        text: String,
        #[serde(default = "default_barge_in")]
        barge_in: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice: Option<Voice>,
    },
    /// Collect slot values from the caller
    Collect { schema: CollectSchema },
    /// End the call, optionally transferring it
    End {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer: Option<Transfer>,
    },
}

fn default_barge_in() -> bool {
    true
}

/// Voice selection for a speak action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
}

/// Slot schema for a collect action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectSchema {
    pub fields: Vec<CollectField>,
}

/// One slot to collect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectField {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// Slot value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Datetime,
}

/// Call transfer target for an end action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TransferMode>,
}

/// Transfer handoff style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Warm,
    Cold,
}

/// Why an action failed validation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ActionError {
    #[error("speak requires a non-empty message_id")]
    EmptyMessageId,
    #[error("speak requires non-empty text")]
    EmptyText,
    #[error("end requires a non-empty reason")]
    EmptyReason,
    #[error("transfer requires a non-empty target")]
    EmptyTransferTarget,
    #[error("collect fields require non-empty keys")]
    EmptyFieldKey,
}

impl Action {
    /// Build a speak action with a fresh message id.
    pub fn speak(text: impl Into<String>) -> Self {
        Self::speak_with_id(Uuid::new_v4().to_string(), text)
    }

    /// Build a speak action reusing an existing message id (e.g. a queued
    /// message's id).
    pub fn speak_with_id(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Action::Speak {
            message_id: message_id.into(),
            text: text.into(),
            barge_in: true,
            voice: None,
        }
    }

    /// Enforce the invariants serde cannot: non-empty strings where the
    /// protocol requires them.
    pub fn validate(&self) -> Result<(), ActionError> {
        match self {
            Action::Speak {
                message_id, text, ..
            } => {
                if message_id.trim().is_empty() {
                    return Err(ActionError::EmptyMessageId);
                }
                if text.trim().is_empty() {
                    return Err(ActionError::EmptyText);
                }
            }
            Action::Collect { schema } => {
                if schema.fields.iter().any(|f| f.key.trim().is_empty()) {
                    return Err(ActionError::EmptyFieldKey);
                }
            }
            Action::End { reason, transfer } => {
                if reason.trim().is_empty() {
                    return Err(ActionError::EmptyReason);
                }
                if let Some(transfer) = transfer {
                    if transfer.to.trim().is_empty() {
                        return Err(ActionError::EmptyTransferTarget);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Try to read an agent reply as a structured action envelope.
///
/// Candidates are tried in order: the whole reply, then each fenced code
/// block. The first candidate that parses as `{ "actions": [...] }` with
/// every action valid wins. Returns `None` when the reply is plain prose
/// (the caller then falls back to heuristics and chunking).
pub fn parse_structured(reply: &str) -> Option<Vec<Action>> {
    let mut candidates = vec![reply.trim().to_string()];
    candidates.extend(fenced_blocks(reply));

    candidates.iter().find_map(|c| try_candidate(c))
}

fn try_candidate(candidate: &str) -> Option<Vec<Action>> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let raw_actions = value.as_object()?.get("actions")?.as_array()?;

    let mut actions = Vec::with_capacity(raw_actions.len());
    for raw in raw_actions {
        let action: Action = serde_json::from_value(raw.clone()).ok()?;
        action.validate().ok()?;
        actions.push(action);
    }
    Some(actions)
}

/// Contents of every fenced code block, language tags stripped.
fn fenced_blocks(reply: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in reply.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(block) => blocks.push(block),
                None => current = Some(String::new()),
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_speak_serializes_with_type_tag() {
        let action = Action::speak_with_id("m1", "Hello");
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "speak");
        assert_eq!(value["message_id"], "m1");
        assert_eq!(value["barge_in"], true);
        assert!(value.get("voice").is_none());
    }

    #[test]
    fn test_parse_whole_reply() {
        let reply = r#"{"actions":[{"type":"speak","message_id":"m1","text":"Hi"}]}"#;
        let actions = parse_structured(reply).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Speak { text, .. } if text == "Hi"));
    }

    #[test]
    fn test_parse_fenced_block() {
        let reply = "Here you go:\n```json\n{\"actions\":[{\"type\":\"end\",\"reason\":\"done\"}]}\n```\nThanks!";
        let actions = parse_structured(reply).unwrap();
        assert_eq!(
            actions,
            vec![Action::End {
                reason: "done".to_string(),
                transfer: None
            }]
        );
    }

    #[test]
    fn test_one_bad_action_rejects_the_envelope() {
        // Second action has an empty text, so the whole candidate is
        // rejected and the reply is treated as prose.
        let reply = r#"{"actions":[
            {"type":"speak","message_id":"m1","text":"ok"},
            {"type":"speak","message_id":"m2","text":"  "}
        ]}"#;
        assert!(parse_structured(reply).is_none());
    }

    #[test]
    fn test_unknown_type_rejects() {
        let reply = r#"{"actions":[{"type":"dance","text":"x"}]}"#;
        assert!(parse_structured(reply).is_none());
    }

    #[test]
    fn test_invalid_enum_member_rejects() {
        let reply = r#"{"actions":[{"type":"collect","schema":{"fields":[{"key":"city","type":"text"}]}}]}"#;
        assert!(parse_structured(reply).is_none());

        let reply = r#"{"actions":[{"type":"end","reason":"bye","transfer":{"to":"+123456789","mode":"hot"}}]}"#;
        assert!(parse_structured(reply).is_none());
    }

    #[test]
    fn test_prose_is_not_structured() {
        assert!(parse_structured("The weather is sunny today.").is_none());
        assert!(parse_structured("").is_none());
    }

    #[test]
    fn test_parse_reemit_is_fixed_point() {
        let reply = json!({
            "actions": [
                { "type": "speak", "message_id": "m1", "text": "Hi", "barge_in": false },
                { "type": "collect", "schema": { "fields": [
                    { "key": "city", "type": "string", "required": true }
                ]}},
                { "type": "end", "reason": "done",
                  "transfer": { "to": "+15550100", "mode": "warm" } }
            ]
        })
        .to_string();

        let first = parse_structured(&reply).unwrap();
        let reemitted = json!({ "actions": first }).to_string();
        let second = parse_structured(&reemitted).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_barge_in_defaults_true() {
        let reply = r#"{"actions":[{"type":"speak","message_id":"m1","text":"Hi"}]}"#;
        let actions = parse_structured(reply).unwrap();
        assert!(matches!(&actions[0], Action::Speak { barge_in: true, .. }));
    }

    #[test]
    fn test_first_valid_candidate_wins() {
        // The whole text is not JSON, the first fenced block is broken,
        // the second fenced block is valid.
        let reply = "prose\n```\n{\"actions\":[{\"type\":\"speak\"}]}\n```\nmore\n```\n{\"actions\":[{\"type\":\"speak\",\"message_id\":\"m9\",\"text\":\"yes\"}]}\n```";
        let actions = parse_structured(reply).unwrap();
        assert!(matches!(&actions[0], Action::Speak { message_id, .. } if message_id == "m9"));
    }
}
