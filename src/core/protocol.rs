/// Wire messages spoken by the engine, the matchmaker and the terminal client.
/// Everything is JSON; game frames are tagged by `type`, matchmaking frames by `status`.
use serde::{Deserialize, Serialize};

use crate::core::error::ProtocolError;

/// The hint facts disclosed for a session. `None` is the "not shown" sentinel
/// and goes over the wire as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintView {
    pub is_even: Option<bool>,
    pub digit_sum: Option<u32>,
    pub is_prime: Option<bool>,
}

impl HintView {
    /// Number of facts that are actually shown
    pub fn disclosed(&self) -> usize {
        usize::from(self.is_even.is_some())
            + usize::from(self.digit_sum.is_some())
            + usize::from(self.is_prime.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Lose,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Guessed,
    Timeout,
    Disconnect,
    /// Nobody showed up to play against a waiting player
    Forfeit,
}

/// Server -> client frames on a game connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Waiting {
        message: String,
    },
    Start {
        message: String,
        #[serde(rename = "yourTurn")]
        your_turn: bool,
        min: u32,
        max: u32,
        hints: HintView,
    },
    Update {
        message: String,
        #[serde(rename = "yourTurn")]
        your_turn: bool,
        min: u32,
        max: u32,
        hints: HintView,
    },
    End {
        message: String,
        outcome: Outcome,
        reason: EndReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<u32>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn waiting() -> Self {
        ServerMessage::Waiting {
            message: "Waiting for another player...".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client -> server frames on a game connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Signed so that negative numbers still reach the range check
    Guess { number: i64 },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Waiting,
    Matched,
    Timeout,
    Error,
}

/// Matchmaking frame. `location` is only present when `status` is `matched`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub status: MatchStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl MatchResponse {
    pub fn waiting() -> Self {
        Self {
            status: MatchStatus::Waiting,
            message: "Waiting for opponent...".to_string(),
            location: None,
        }
    }

    pub fn matched(location: impl Into<String>) -> Self {
        Self {
            status: MatchStatus::Matched,
            message: "Opponent found!".to_string(),
            location: Some(location.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: MatchStatus::Timeout,
            message: "No opponent found. Please try again.".to_string(),
            location: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: MatchStatus::Error,
            message: message.into(),
            location: None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn guess_parses_from_tagged_json() {
        let msg = ClientMessage::parse(r#"{"type":"guess","number":42}"#).unwrap();
        assert_eq!(msg, ClientMessage::Guess { number: 42 });

        let negative = ClientMessage::parse(r#"{"type":"guess","number":-3}"#).unwrap();
        assert_eq!(negative, ClientMessage::Guess { number: -3 });
    }

    #[test]
    fn unknown_or_broken_frames_are_malformed() {
        assert!(ClientMessage::parse(r#"{"type":"chat","text":"hi"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"type":"guess"}"#).is_err());
    }

    #[test]
    fn undisclosed_hints_serialize_as_null() {
        let msg = ServerMessage::Start {
            message: "Game started! It's your turn".to_string(),
            your_turn: true,
            min: 1,
            max: 100,
            hints: HintView {
                is_even: Some(true),
                digit_sum: None,
                is_prime: None,
            },
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "start",
                "message": "Game started! It's your turn",
                "yourTurn": true,
                "min": 1,
                "max": 100,
                "hints": { "isEven": true, "digitSum": null, "isPrime": null }
            })
        );
    }

    #[test]
    fn end_frame_carries_outcome_and_reason() {
        let msg = ServerMessage::End {
            message: "Opponent disconnected. You win!".to_string(),
            outcome: Outcome::Win,
            reason: EndReason::Disconnect,
            target: None,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "end");
        assert_eq!(value["outcome"], "win");
        assert_eq!(value["reason"], "disconnect");
        assert!(value.get("target").is_none());
    }

    #[test]
    fn match_response_only_carries_location_when_matched() {
        let waiting = serde_json::to_value(MatchResponse::waiting()).unwrap();
        assert_eq!(waiting, json!({"status": "waiting", "message": "Waiting for opponent..."}));

        let matched = serde_json::to_value(MatchResponse::matched("ws://10.0.0.1:7777/game")).unwrap();
        assert_eq!(matched["status"], "matched");
        assert_eq!(matched["location"], "ws://10.0.0.1:7777/game");
    }
}
