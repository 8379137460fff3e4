use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checker::endpoint::EndpointClass;

/// The fixed battery of checks every queued profile runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    AnimatedAvatar,
    AvatarFrame,
    MiniProfileBackground,
    ProfileBackground,
    SteamLevel,
    Friends,
    CsgoInventory,
}

impl CheckName {
    /// Declaration order is execution order within a profile.
    pub const ALL: [CheckName; 7] = [
        CheckName::AnimatedAvatar,
        CheckName::AvatarFrame,
        CheckName::MiniProfileBackground,
        CheckName::ProfileBackground,
        CheckName::SteamLevel,
        CheckName::Friends,
        CheckName::CsgoInventory,
    ];

    pub fn endpoint_class(&self) -> EndpointClass {
        match self {
            CheckName::AnimatedAvatar => EndpointClass::AnimatedAvatar,
            CheckName::AvatarFrame => EndpointClass::AvatarFrame,
            CheckName::MiniProfileBackground => EndpointClass::MiniProfileBackground,
            CheckName::ProfileBackground => EndpointClass::ProfileBackground,
            CheckName::SteamLevel => EndpointClass::SteamLevel,
            CheckName::Friends => EndpointClass::Friends,
            CheckName::CsgoInventory => EndpointClass::Inventory,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::AnimatedAvatar => "animated_avatar",
            CheckName::AvatarFrame => "avatar_frame",
            CheckName::MiniProfileBackground => "mini_profile_background",
            CheckName::ProfileBackground => "profile_background",
            CheckName::SteamLevel => "steam_level",
            CheckName::Friends => "friends",
            CheckName::CsgoInventory => "csgo_inventory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    ToCheck,
    Passed,
    Failed,
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub steam_id: String,
    pub username: String,
    /// Epoch milliseconds.
    pub enqueued_at: i64,
    pub checks: BTreeMap<CheckName, CheckStatus>,
}

impl Profile {
    pub fn new(steam_id: String, username: String) -> Self {
        let checks = CheckName::ALL
            .iter()
            .map(|c| (*c, CheckStatus::ToCheck))
            .collect();
        Self {
            steam_id,
            username,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            checks,
        }
    }

    pub fn status_of(&self, check: CheckName) -> CheckStatus {
        self.checks
            .get(&check)
            .copied()
            .unwrap_or(CheckStatus::ToCheck)
    }

    pub fn has_to_check(&self) -> bool {
        self.checks.values().any(|s| *s == CheckStatus::ToCheck)
    }

    pub fn has_deferred(&self) -> bool {
        self.checks.values().any(|s| *s == CheckStatus::Deferred)
    }

    pub fn any_failed(&self) -> bool {
        self.checks.values().any(|s| *s == CheckStatus::Failed)
    }

    pub fn all_passed(&self) -> bool {
        self.checks.values().all(|s| *s == CheckStatus::Passed)
    }

    /// Terminal means no check is still pending or deferred.
    pub fn all_terminal(&self) -> bool {
        self.checks
            .values()
            .all(|s| matches!(s, CheckStatus::Passed | CheckStatus::Failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_profile_has_all_seven_checks_pending() {
        let p = Profile::new("76561198000000001".into(), "alice".into());
        assert_eq!(p.checks.len(), 7);
        assert!(p.checks.values().all(|s| *s == CheckStatus::ToCheck));
        assert!(p.has_to_check());
        assert!(!p.all_terminal());
    }

    #[test]
    fn check_names_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&CheckName::CsgoInventory).unwrap(),
            "\"csgo_inventory\""
        );
        assert_eq!(
            serde_json::to_string(&CheckStatus::ToCheck).unwrap(),
            "\"to_check\""
        );
    }

    #[test]
    fn all_passed_requires_every_check() {
        let mut p = Profile::new("76561198000000001".into(), "alice".into());
        for c in CheckName::ALL {
            p.checks.insert(c, CheckStatus::Passed);
        }
        assert!(p.all_passed());
        p.checks.insert(CheckName::Friends, CheckStatus::Deferred);
        assert!(!p.all_passed());
        assert!(!p.all_terminal());
        assert!(p.has_deferred());
    }

    #[test]
    fn profile_round_trips_through_json() {
        let p = Profile::new("76561198000000001".into(), "alice".into());
        let raw = serde_json::to_string(&p).unwrap();
        let back: Profile = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.steam_id, p.steam_id);
        assert_eq!(back.checks.len(), 7);
    }
}
