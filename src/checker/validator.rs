use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::checker::dispatcher::{DispatchOutcome, Dispatcher};
use crate::models::CheckName;

/// What a single check run produced. `private_profile` is set when the
/// steam_level check observed an empty response, which marks the whole
/// profile private for the scheduler's short-circuit.
#[derive(Debug)]
pub enum CheckOutcome {
    Completed {
        passed: bool,
        private_profile: bool,
        details: Value,
    },
    Deferred {
        wait_ms: u64,
    },
    TransportError {
        message: String,
    },
}

/// Maximum account level a passing profile may have.
const MAX_STEAM_LEVEL: i64 = 13;
/// Maximum friends-list size a passing profile may have.
const MAX_FRIENDS: usize = 60;

/// Stateless interpreter between check names and the dispatcher: builds the
/// upstream URL for each check and shape-checks the provider's response into
/// a pass/fail verdict.
pub struct Validator {
    dispatcher: Arc<Dispatcher>,
    api_base: String,
    community_base: String,
    api_key: String,
}

impl Validator {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        api_base: String,
        community_base: String,
        api_key: String,
    ) -> Self {
        Self {
            dispatcher,
            api_base: api_base.trim_end_matches('/').to_string(),
            community_base: community_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub async fn run_check(&self, check: CheckName, steam_id: &str) -> CheckOutcome {
        let url = self.url_for(check, steam_id);
        match self.dispatcher.request(&url).await {
            DispatchOutcome::Deferred { wait_ms, endpoint } => {
                debug!(
                    "[Validator] {} for {} deferred ({} cooled for {} ms)",
                    check.as_str(),
                    steam_id,
                    endpoint.as_str(),
                    wait_ms
                );
                CheckOutcome::Deferred { wait_ms }
            }
            DispatchOutcome::Failed { message, .. } => CheckOutcome::TransportError { message },
            DispatchOutcome::Ok { body, private, .. } => {
                self.interpret(check, &body, private)
            }
        }
    }

    fn url_for(&self, check: CheckName, steam_id: &str) -> String {
        match check {
            CheckName::AnimatedAvatar => self.player_service_url("GetAnimatedAvatar", steam_id),
            CheckName::AvatarFrame => self.player_service_url("GetAvatarFrame", steam_id),
            CheckName::MiniProfileBackground => {
                self.player_service_url("GetMiniProfileBackground", steam_id)
            }
            CheckName::ProfileBackground => {
                self.player_service_url("GetProfileBackground", steam_id)
            }
            CheckName::SteamLevel => self.player_service_url("GetSteamLevel", steam_id),
            CheckName::Friends => format!(
                "{}/ISteamUser/GetFriendList/v1/?key={}&steamid={}&relationship=friend",
                self.api_base, self.api_key, steam_id
            ),
            CheckName::CsgoInventory => format!(
                "{}/inventory/{}/730/2?l=english&count=75",
                self.community_base, steam_id
            ),
        }
    }

    fn player_service_url(&self, method: &str, steam_id: &str) -> String {
        format!(
            "{}/IPlayerService/{}/v1/?key={}&steamid={}",
            self.api_base, method, self.api_key, steam_id
        )
    }

    fn interpret(&self, check: CheckName, body: &str, private: bool) -> CheckOutcome {
        match check {
            CheckName::AnimatedAvatar => interpret_cosmetic(body, "avatar"),
            CheckName::AvatarFrame => interpret_cosmetic(body, "avatar_frame"),
            CheckName::MiniProfileBackground | CheckName::ProfileBackground => {
                interpret_cosmetic(body, "profile_background")
            }
            CheckName::SteamLevel => interpret_steam_level(body),
            CheckName::Friends => interpret_friends(body, private),
            CheckName::CsgoInventory => interpret_inventory(body, private),
        }
    }
}

/// A cosmetic check passes when the response carries the field and the field
/// holds nothing: an equipped cosmetic disqualifies the profile.
fn interpret_cosmetic(body: &str, field: &str) -> CheckOutcome {
    let Some(response) = parse_response_envelope(body) else {
        return unexpected_shape(body);
    };
    let passed = response
        .get(field)
        .map(is_empty_value)
        .unwrap_or(false);
    CheckOutcome::Completed {
        passed,
        private_profile: false,
        details: json!({ field: response.get(field).cloned().unwrap_or(Value::Null) }),
    }
}

/// An empty response means the profile is private, which passes and flags the
/// profile so later checks can be skipped.
fn interpret_steam_level(body: &str) -> CheckOutcome {
    let Some(response) = parse_response_envelope(body) else {
        return unexpected_shape(body);
    };
    if is_empty_value(&response) {
        return CheckOutcome::Completed {
            passed: true,
            private_profile: true,
            details: json!({ "private": true }),
        };
    }
    match response.get("player_level").and_then(Value::as_i64) {
        Some(level) => CheckOutcome::Completed {
            passed: level <= MAX_STEAM_LEVEL,
            private_profile: false,
            details: json!({ "player_level": level }),
        },
        None => unexpected_shape(body),
    }
}

fn interpret_friends(body: &str, private: bool) -> CheckOutcome {
    if private {
        return CheckOutcome::Completed {
            passed: true,
            private_profile: false,
            details: json!({ "private": true }),
        };
    }
    let Ok(root) = serde_json::from_str::<Value>(body) else {
        return unexpected_shape(body);
    };
    let friends = root
        .get("friendslist")
        .and_then(|f| f.get("friends"))
        .and_then(Value::as_array);
    match friends {
        Some(friends) => CheckOutcome::Completed {
            passed: friends.len() <= MAX_FRIENDS,
            private_profile: false,
            details: json!({ "friend_count": friends.len() }),
        },
        None => unexpected_shape(body),
    }
}

/// A desirable inventory is an invisible one: private (401/403) or empty both
/// pass, anything with items fails with the count.
fn interpret_inventory(body: &str, private: bool) -> CheckOutcome {
    if private {
        return CheckOutcome::Completed {
            passed: true,
            private_profile: false,
            details: json!({ "private": true }),
        };
    }
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return CheckOutcome::Completed {
            passed: true,
            private_profile: false,
            details: json!({ "item_count": 0 }),
        };
    }
    let Ok(root) = serde_json::from_str::<Value>(trimmed) else {
        return unexpected_shape(body);
    };
    if is_empty_value(&root) {
        return CheckOutcome::Completed {
            passed: true,
            private_profile: false,
            details: json!({ "item_count": 0 }),
        };
    }
    let item_count = root
        .get("total_inventory_count")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .or_else(|| root.get("assets").and_then(Value::as_array).map(Vec::len))
        .unwrap_or(0);
    CheckOutcome::Completed {
        passed: item_count == 0,
        private_profile: false,
        details: json!({ "item_count": item_count }),
    }
}

/// Steam Web API bodies wrap their payload in `{"response": …}`.
fn parse_response_envelope(body: &str) -> Option<Value> {
    let root: Value = serde_json::from_str(body).ok()?;
    root.get("response").cloned()
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn unexpected_shape(body: &str) -> CheckOutcome {
    let snippet: String = body.chars().take(120).collect();
    CheckOutcome::TransportError {
        message: format!("unexpected upstream response shape: {}", snippet),
    }
}
