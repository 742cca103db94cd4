use std::time::Duration;

use serde::Deserialize;

/// Realm presented to clients when none is configured.
pub const DEFAULT_REALM_NAME: &str = "Digest Default Realm";

/// Identity attribute holding the login name, used for account lookup.
pub const DEFAULT_LOGIN_NAME_ATTRIBUTE: &str = "loginName";

/// Lifetime of an issued nonce when none is configured.
pub const DEFAULT_NONCE_MAX_VALID: Duration = Duration::from_secs(300);

/// Settings of the digest authentication scheme.
///
/// All fields are optional when deserializing; durations use the humantime
/// notation (`"5m"`, `"90s"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// Protection space announced in the challenge
    pub realm: String,
    /// How long an issued nonce is accepted; also the sweep period
    #[serde(with = "humantime_serde")]
    pub nonce_max_valid: Duration,
    /// Identity attribute matched against the digest username
    pub login_name_attribute: String,
    /// Reject a nonce (or a nonce-count) that was already used
    pub replay_detection: bool,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            realm: DEFAULT_REALM_NAME.to_string(),
            nonce_max_valid: DEFAULT_NONCE_MAX_VALID,
            login_name_attribute: DEFAULT_LOGIN_NAME_ATTRIBUTE.to_string(),
            replay_detection: false,
        }
    }
}

impl DigestConfig {
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn with_nonce_max_valid(mut self, max_valid: Duration) -> Self {
        self.nonce_max_valid = max_valid;
        self
    }

    pub fn with_login_name_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.login_name_attribute = attribute.into();
        self
    }

    pub fn with_replay_detection(mut self, enabled: bool) -> Self {
        self.replay_detection = enabled;
        self
    }
}
