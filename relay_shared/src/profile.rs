//! Rider profile carried per connected client.
//!
//! The server never interprets these values beyond scene comparison; they
//! are merged from the client's `update_user` / `update_status` messages
//! and echoed back in roster listings and status fan-out.

use serde::{Deserialize, Serialize};

/// Sentinel for identity fields the client has not reported yet.
pub const UNKNOWN_USER: &str = "N/A";

/// Scene id of clients that have not joined a scene (admin clients stay
/// here and only hear each other).
pub const UNASSIGNED_SCENE: &str = "-1";

/// Identity fields posted via `update_user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub user_id: String,
    pub user_name: String,
    pub user_domain: String,
}

/// Position fields posted via `update_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub scene_id: String,
    pub scene_pos: String,
    pub speed: String,
}

/// Combined record fanned out as `rider_status_update`: the sender's
/// posted status plus the identity the server remembers for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiderStatus {
    pub scene_id: String,
    pub scene_pos: String,
    pub speed: String,
    pub user_id: String,
    pub user_name: String,
    pub user_domain: String,
}

/// Per-client profile. Scene comparison is byte-for-byte string equality;
/// `"-1"` is a scope like any other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiderProfile {
    pub user_id: String,
    pub user_name: String,
    pub user_domain: String,
    pub scene_id: String,
    pub scene_pos: String,
    pub speed: String,
}

impl Default for RiderProfile {
    fn default() -> Self {
        Self {
            user_id: UNKNOWN_USER.to_string(),
            user_name: UNKNOWN_USER.to_string(),
            user_domain: UNKNOWN_USER.to_string(),
            scene_id: UNASSIGNED_SCENE.to_string(),
            scene_pos: "0".to_string(),
            speed: "0".to_string(),
        }
    }
}

impl RiderProfile {
    /// Overwrites the identity fields.
    pub fn apply_user(&mut self, update: &UserUpdate) {
        self.user_id = update.user_id.clone();
        self.user_name = update.user_name.clone();
        self.user_domain = update.user_domain.clone();
    }

    /// Overwrites the scene/position fields.
    pub fn apply_status(&mut self, update: &StatusUpdate) {
        self.scene_id = update.scene_id.clone();
        self.scene_pos = update.scene_pos.clone();
        self.speed = update.speed.clone();
    }

    /// Builds the combined status record for fan-out.
    pub fn status_update(&self) -> RiderStatus {
        RiderStatus {
            scene_id: self.scene_id.clone(),
            scene_pos: self.scene_pos.clone(),
            speed: self.speed.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_domain: self.user_domain.clone(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sentinels() {
        let profile = RiderProfile::default();
        assert_eq!(profile.user_id, UNKNOWN_USER);
        assert_eq!(profile.user_name, UNKNOWN_USER);
        assert_eq!(profile.user_domain, UNKNOWN_USER);
        assert_eq!(profile.scene_id, UNASSIGNED_SCENE);
        assert_eq!(profile.scene_pos, "0");
        assert_eq!(profile.speed, "0");
    }

    #[test]
    fn updates_merge_independently() {
        let mut profile = RiderProfile::default();
        profile.apply_user(&UserUpdate {
            user_id: "u-17".into(),
            user_name: "ada".into(),
            user_domain: "west".into(),
        });
        assert_eq!(profile.scene_id, UNASSIGNED_SCENE);

        profile.apply_status(&StatusUpdate {
            scene_id: "7".into(),
            scene_pos: "42".into(),
            speed: "31".into(),
        });
        assert_eq!(profile.user_name, "ada");
        assert_eq!(profile.scene_id, "7");

        let status = profile.status_update();
        assert_eq!(status.scene_pos, "42");
        assert_eq!(status.user_id, "u-17");
    }

    #[test]
    fn roster_json_keeps_field_order() {
        let json = RiderProfile::default().to_json().unwrap();
        let user_id = json.find("user_id").unwrap();
        let scene_id = json.find("scene_id").unwrap();
        assert!(user_id < scene_id);
    }
}
