use serde::{Deserialize, Serialize};

/// An equivalence class of upstream URLs sharing rate-limit state. The
/// provider throttles per endpoint family, not per URL, so cooldowns are
/// tracked at this granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    AnimatedAvatar,
    AvatarFrame,
    MiniProfileBackground,
    ProfileBackground,
    SteamLevel,
    Friends,
    Inventory,
    Other,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 8] = [
        EndpointClass::AnimatedAvatar,
        EndpointClass::AvatarFrame,
        EndpointClass::MiniProfileBackground,
        EndpointClass::ProfileBackground,
        EndpointClass::SteamLevel,
        EndpointClass::Friends,
        EndpointClass::Inventory,
        EndpointClass::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::AnimatedAvatar => "animated_avatar",
            EndpointClass::AvatarFrame => "avatar_frame",
            EndpointClass::MiniProfileBackground => "mini_profile_background",
            EndpointClass::ProfileBackground => "profile_background",
            EndpointClass::SteamLevel => "steam_level",
            EndpointClass::Friends => "friends",
            EndpointClass::Inventory => "inventory",
            EndpointClass::Other => "other",
        }
    }
}

/// Substring match, first hit wins.
const CLASS_TABLE: [(&str, EndpointClass); 7] = [
    ("GetFriendList", EndpointClass::Friends),
    ("inventory", EndpointClass::Inventory),
    ("GetSteamLevel", EndpointClass::SteamLevel),
    ("GetAnimatedAvatar", EndpointClass::AnimatedAvatar),
    ("GetAvatarFrame", EndpointClass::AvatarFrame),
    ("GetMiniProfileBackground", EndpointClass::MiniProfileBackground),
    ("GetProfileBackground", EndpointClass::ProfileBackground),
];

pub fn classify_url(url: &str) -> EndpointClass {
    for (marker, class) in CLASS_TABLE {
        if url.contains(marker) {
            return class;
        }
    }
    EndpointClass::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_web_api_urls() {
        assert_eq!(
            classify_url("https://api.steampowered.com/ISteamUser/GetFriendList/v1/?key=x&steamid=1"),
            EndpointClass::Friends
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetSteamLevel/v1/?steamid=1"),
            EndpointClass::SteamLevel
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetAnimatedAvatar/v1/"),
            EndpointClass::AnimatedAvatar
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetAvatarFrame/v1/"),
            EndpointClass::AvatarFrame
        );
    }

    #[test]
    fn mini_profile_background_wins_over_profile_background() {
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetMiniProfileBackground/v1/"),
            EndpointClass::MiniProfileBackground
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetProfileBackground/v1/"),
            EndpointClass::ProfileBackground
        );
    }

    #[test]
    fn classifies_community_inventory_url() {
        assert_eq!(
            classify_url("https://steamcommunity.com/inventory/76561198000000001/730/2?l=english&count=75"),
            EndpointClass::Inventory
        );
    }

    #[test]
    fn unknown_urls_fall_through_to_other() {
        assert_eq!(classify_url("https://example.com/api/nothing"), EndpointClass::Other);
    }

    #[test]
    fn classification_works_against_mock_hosts() {
        // Tests point the dispatcher at local mock servers; the class markers
        // must survive a host swap.
        assert_eq!(
            classify_url("http://127.0.0.1:499/ISteamUser/GetFriendList/v1/?steamid=1"),
            EndpointClass::Friends
        );
    }
}
