//! Domain events emitted to the broadcaster, and the result shape every
//! engine entry point returns.
//!
//! A flat set of plain serde payloads published over the keyed store's
//! pub/sub channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of any LowCard engine entry point: a result object rather than an
/// exception, so expected rejections (busy room, insufficient credits,
/// wrong phase) never unwind past an entry point.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: Option<String>,
    /// Shown privately to the caller rather than broadcast to the room.
    pub is_private: bool,
    /// Dropped with no chat output at all.
    pub silent: bool,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self { success: true, message: Some(message.into()), ..Default::default() }
    }

    pub fn private_error(message: impl Into<String>) -> Self {
        Self { success: false, message: Some(message.into()), is_private: true, ..Default::default() }
    }

    pub fn silent_reject() -> Self {
        Self { success: false, silent: true, ..Default::default() }
    }

    pub fn busy() -> Self {
        Self::private_error("Server busy, please try again.")
    }
}

/// Domain event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEvent {
    GameStarted,
    PlayerJoined,
    Countdown,
    RoundStarted,
    Draw,
    RoundTallied,
    Finished,
    Cancelled,
    ChatMessage,
    CreditsUpdated,
}

impl DomainEvent {
    pub fn as_wire_name(self) -> &'static str {
        match self {
            DomainEvent::GameStarted => "game:started",
            DomainEvent::PlayerJoined => "game:player:joined",
            DomainEvent::Countdown => "game:countdown",
            DomainEvent::RoundStarted => "game:round:started",
            DomainEvent::Draw => "game:draw",
            DomainEvent::RoundTallied => "game:round:tallied",
            DomainEvent::Finished => "game:finished",
            DomainEvent::Cancelled => "game:cancelled",
            DomainEvent::ChatMessage => "chat:message",
            DomainEvent::CreditsUpdated => "credits:updated",
        }
    }
}

/// `game:command` pub/sub payload (inbound).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingCommand {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// `game:chat:message` pub/sub payload (out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageOut {
    pub room_id: String,
    pub message_data: Value,
}

/// `game:credits:update` pub/sub payload (out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsUpdateOut {
    pub room_id: String,
    pub user_id: String,
    pub balance: i64,
}

/// `game:private:message` pub/sub payload (out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateMessageOut {
    pub room_id: String,
    pub user_id: String,
    pub message_data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_spec() {
        assert_eq!(DomainEvent::GameStarted.as_wire_name(), "game:started");
        assert_eq!(DomainEvent::RoundTallied.as_wire_name(), "game:round:tallied");
        assert_eq!(DomainEvent::CreditsUpdated.as_wire_name(), "credits:updated");
    }

    #[test]
    fn outcome_constructors_set_flags() {
        let busy = CommandOutcome::busy();
        assert!(!busy.success);
        assert!(busy.is_private);

        let silent = CommandOutcome::silent_reject();
        assert!(!silent.success);
        assert!(silent.silent);

        let ok = CommandOutcome::ok();
        assert!(ok.success);
        assert!(ok.message.is_none());
    }
}
