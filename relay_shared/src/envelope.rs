//! Control envelope carried on the reliable channel.
//!
//! Every control message is a UTF-8 JSON object with two string fields,
//! `action` and `data`; `data` may itself hold a JSON-encoded sub-object.
//! The codec is tolerant: a missing `data` is fine, and unrecognized
//! actions parse to [`ControlMsg::Other`] so the dispatcher can drop them
//! with a diagnostic instead of failing.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::profile::{StatusUpdate, UserUpdate};

/// Greeting sent by the server right after accept.
pub const ACTION_WELCOME: &str = "Welcome!";
pub const ACTION_CREATE_UDP_CHANNEL: &str = "create_udp_channel";
pub const ACTION_UPDATE_USER: &str = "update_user";
pub const ACTION_UPDATE_STATUS: &str = "update_status";
pub const ACTION_LIST_CLIENTS: &str = "list_clients";
pub const ACTION_BROADCAST: &str = "broadcast";
/// Synthesized by the server when a scene peer posts `update_status`.
pub const ACTION_RIDER_STATUS_UPDATE: &str = "rider_status_update";

/// The `{action, data}` wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub data: String,
}

impl Envelope {
    pub fn new(action: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize envelope")
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("deserialize envelope")
    }
}

/// Control message keyed on the envelope `action`.
///
/// `Broadcast` carries no payload here: the relay forwards the original
/// framed bytes untouched, so the caller keeps them.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMsg {
    CreateUdpChannel,
    UpdateUser(UserUpdate),
    UpdateStatus(StatusUpdate),
    ListClients,
    Broadcast,
    Other(String),
}

impl ControlMsg {
    /// Parses the per-action payload out of an envelope. Unknown actions
    /// are not an error; malformed `data` for a known action is.
    pub fn parse(envelope: &Envelope) -> anyhow::Result<Self> {
        Ok(match envelope.action.as_str() {
            ACTION_CREATE_UDP_CHANNEL => Self::CreateUdpChannel,
            ACTION_UPDATE_USER => Self::UpdateUser(
                serde_json::from_str(&envelope.data).context("parse update_user data")?,
            ),
            ACTION_UPDATE_STATUS => Self::UpdateStatus(
                serde_json::from_str(&envelope.data).context("parse update_status data")?,
            ),
            ACTION_LIST_CLIENTS => Self::ListClients,
            ACTION_BROADCAST => Self::Broadcast,
            other => Self::Other(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(ACTION_BROADCAST, "hello riders");
        let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn missing_data_is_tolerated() {
        let env = Envelope::from_bytes(br#"{"action":"list_clients"}"#).unwrap();
        assert_eq!(env.action, ACTION_LIST_CLIENTS);
        assert_eq!(env.data, "");
        assert_eq!(ControlMsg::parse(&env).unwrap(), ControlMsg::ListClients);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Envelope::from_bytes(b"{not json").is_err());
    }

    #[test]
    fn unknown_action_is_not_an_error() {
        let env = Envelope::new("data", "free-form");
        assert_eq!(
            ControlMsg::parse(&env).unwrap(),
            ControlMsg::Other("data".to_string())
        );
    }

    #[test]
    fn update_status_payload_is_parsed() {
        let env = Envelope::new(
            ACTION_UPDATE_STATUS,
            r#"{"scene_id":"5","scene_pos":"12","speed":"28"}"#,
        );
        match ControlMsg::parse(&env).unwrap() {
            ControlMsg::UpdateStatus(update) => {
                assert_eq!(update.scene_id, "5");
                assert_eq!(update.scene_pos, "12");
                assert_eq!(update.speed, "28");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn bad_payload_for_known_action_is_an_error() {
        let env = Envelope::new(ACTION_UPDATE_USER, "not a json object");
        assert!(ControlMsg::parse(&env).is_err());
    }
}
