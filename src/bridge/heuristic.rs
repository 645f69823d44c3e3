//! Collect-slot inference for plain-prose replies.
//!
//! Intentionally narrow: only the weather/city follow-up is recognised.
//! Anything broader belongs in the agent's own structured replies.

use crate::protocol::{Action, CollectField, CollectSchema, FieldType};

/// When the caller asked about weather and the agent's prose asks for a
/// city, emit a collect action for the `city` slot.
pub fn infer_city_collect(user_text: &str, reply: &str) -> Option<Action> {
    if !user_text.to_lowercase().contains("weather") {
        return None;
    }
    let reply_lower = reply.to_lowercase();
    if !reply_lower.contains("city") {
        return None;
    }

    let asks = reply.contains('?')
        || reply_lower.contains("which city")
        || reply_lower.contains("what city")
        || reply_lower.contains("could you tell me");

    asks.then(|| Action::Collect {
        schema: CollectSchema {
            fields: vec![CollectField {
                key: "city".to_string(),
                field_type: FieldType::String,
                required: Some(true),
            }],
        },
    })
}
