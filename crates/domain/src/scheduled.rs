//! The event an aggregate records when it asks for a command to run later.

use chrono::{DateTime, Utc};
use common::Precondition;
use serde::{Deserialize, Serialize};

/// Event type prefix for scheduling events.
///
/// A scheduling event for command `ChargeCreditCard` on an `Order` is stored
/// in the `Order` stream with type `Scheduled:ChargeCreditCard`, so a single
/// prefix interest picks up every command scheduled by one aggregate type.
pub const SCHEDULED_EVENT_PREFIX: &str = "Scheduled:";

/// Returns true if `event_type` names a scheduling event.
pub fn is_scheduled_event(event_type: &str) -> bool {
    event_type.starts_with(SCHEDULED_EVENT_PREFIX)
}

/// Body of a `Scheduled:<CommandName>` event.
///
/// The command targets the aggregate whose stream carries the event. The
/// scheduler keys the resulting scheduled command by that aggregate and the
/// event's sequence number, so replaying the event is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandScheduled {
    pub command_name: String,
    pub command: serde_json::Value,
    /// `None` means "as soon as possible".
    pub due_time: Option<DateTime<Utc>>,
    /// Clock the command is due against; the scheduler's default clock if unset.
    pub clock: Option<String>,
    #[serde(default)]
    pub delivery_depends_on: Option<Precondition>,
}

impl CommandScheduled {
    pub fn event_type(&self) -> String {
        format!("{SCHEDULED_EVENT_PREFIX}{}", self.command_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;

    #[test]
    fn event_type_carries_prefix() {
        let scheduled = CommandScheduled {
            command_name: "ChargeCreditCard".to_string(),
            command: serde_json::json!({}),
            due_time: None,
            clock: None,
            delivery_depends_on: None,
        };
        assert_eq!(scheduled.event_type(), "Scheduled:ChargeCreditCard");
        assert!(is_scheduled_event(&scheduled.event_type()));
        assert!(!is_scheduled_event("OrderPlaced"));
    }

    #[test]
    fn precondition_is_optional_in_json() {
        let json = serde_json::json!({
            "command_name": "Ship",
            "command": {"order_id": AggregateId::new()},
            "due_time": null,
            "clock": "default",
        });
        let scheduled: CommandScheduled = serde_json::from_value(json).unwrap();
        assert!(scheduled.delivery_depends_on.is_none());
        assert_eq!(scheduled.clock.as_deref(), Some("default"));
    }
}
