use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::DriverStatus;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub login: LoginConfig,
    /// Seed entries for the local driver roster
    #[serde(default)]
    pub drivers: Vec<DriverEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling server WebSocket URL tried first
    #[serde(default = "default_primary_url")]
    pub primary_url: String,
    /// Tried once when the primary cannot be reached
    pub fallback_url: Option<String>,
    /// Per-attempt connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// PEM certificate to pin for `wss://` servers (system roots are always loaded)
    pub tls_cert: Option<String>,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name attached to broadcast calls
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_room")]
    pub default_room: String,
    /// How long a failed peer connection may recover before it is removed
    #[serde(default = "default_failed_grace_ms")]
    pub failed_grace_ms: u64,
    /// Answer incoming broadcast calls without waiting for the user
    #[serde(default)]
    pub auto_answer: bool,
    /// Buffer size of the core event stream
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    #[serde(default = "default_login_endpoint")]
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEntry {
    pub employee_id: String,
    pub driver_name: String,
    #[serde(default)]
    pub vehicle: String,
    #[serde(default)]
    pub status: DriverStatus,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            fallback_url: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            tls_cert: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            default_room: default_room(),
            failed_grace_ms: default_failed_grace_ms(),
            auto_answer: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            endpoint: default_login_endpoint(),
        }
    }
}

impl DispatchConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the client should not start) or
    /// "WARNING:" (advisory, the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling URLs ---
        if !is_ws_url(&self.signaling.primary_url) {
            issues.push(format!(
                "ERROR: signaling.primary_url '{}' must start with 'ws://' or 'wss://'.",
                self.signaling.primary_url
            ));
        }
        if let Some(fallback) = &self.signaling.fallback_url {
            if !is_ws_url(fallback) {
                issues.push(format!(
                    "ERROR: signaling.fallback_url '{}' must start with 'ws://' or 'wss://'.",
                    fallback
                ));
            }
            if fallback == &self.signaling.primary_url {
                issues.push(
                    "WARNING: signaling.fallback_url is the same as primary_url. \
                     The fallback attempt will hit the same server."
                        .to_string(),
                );
            }
        }
        if self.signaling.connect_timeout_ms == 0 {
            issues.push("ERROR: signaling.connect_timeout_ms must be at least 1.".to_string());
        }

        // --- Session ---
        if self.session.failed_grace_ms == 0 {
            issues.push(
                "WARNING: session.failed_grace_ms is 0. Failed connections will be removed \
                 before ICE has a chance to recover."
                    .to_string(),
            );
        }
        if self.session.event_capacity == 0 {
            issues.push("ERROR: session.event_capacity must be at least 1.".to_string());
        }
        if self.session.default_room.trim().is_empty() {
            issues.push("ERROR: session.default_room must not be empty.".to_string());
        }

        // --- Media ---
        if !self.media.audio && !self.media.video {
            issues.push(
                "WARNING: media.audio and media.video are both disabled. \
                 Calls cannot be started without a capture stream."
                    .to_string(),
            );
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: ice.turn_urls is set without turn_username/turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }

        // --- Login ---
        if !self.login.endpoint.starts_with("http://") && !self.login.endpoint.starts_with("https://")
        {
            issues.push(format!(
                "ERROR: login.endpoint '{}' must start with 'http://' or 'https://'.",
                self.login.endpoint
            ));
        }

        // --- Drivers ---
        let mut seen = HashSet::new();
        for driver in &self.drivers {
            if driver.employee_id.trim().is_empty() {
                issues.push(format!(
                    "ERROR: driver '{}' has an empty employee_id.",
                    driver.driver_name
                ));
            } else if !seen.insert(driver.employee_id.as_str()) {
                issues.push(format!(
                    "ERROR: duplicate driver employee_id '{}'.",
                    driver.employee_id
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

fn default_primary_url() -> String {
    "ws://localhost:5000/ws".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_display_name() -> String {
    "Caller".to_string()
}
fn default_room() -> String {
    "default-room".to_string()
}
fn default_failed_grace_ms() -> u64 {
    5000
}
fn default_event_capacity() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_login_endpoint() -> String {
    "http://localhost:3000/login".to_string()
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: DispatchConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.signaling.primary_url, "ws://localhost:5000/ws");
        assert!(config.signaling.fallback_url.is_none());
        assert_eq!(config.signaling.connect_timeout_ms, 5000);
        assert!(config.signaling.tls_cert.is_none());

        assert_eq!(config.session.display_name, "Caller");
        assert_eq!(config.session.default_room, "default-room");
        assert_eq!(config.session.failed_grace_ms, 5000);
        assert!(!config.session.auto_answer);
        assert_eq!(config.session.event_capacity, 64);

        assert!(config.media.audio);
        assert!(config.media.video);
        assert_eq!(config.login.endpoint, "http://localhost:3000/login");
        assert!(config.drivers.is_empty());

        assert_eq!(
            config.ice.stun_urls,
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
            ]
        );
        assert!(config.ice.turn_urls.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_only_signaling_section() {
        let toml_str = r#"
[signaling]
primary_url = "wss://dispatch.example.com/ws"
fallback_url = "ws://192.168.68.53:5000/ws"
"#;
        let config: DispatchConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.signaling.primary_url, "wss://dispatch.example.com/ws");
        assert_eq!(
            config.signaling.fallback_url.as_deref(),
            Some("ws://192.168.68.53:5000/ws")
        );
        assert_eq!(config.signaling.connect_timeout_ms, 5000);
        assert_eq!(config.session.default_room, "default-room");
        assert_eq!(config.ice.stun_urls.len(), 2);
    }

    #[test]
    fn driver_roster_entries() {
        let toml_str = r#"
[[drivers]]
employee_id = "123"
driver_name = "Ana"
vehicle = "Ambulance"

[[drivers]]
employee_id = "456"
driver_name = "Ben"
vehicle = "Fire Truck"
status = "Busy"
"#;
        let config: DispatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.drivers.len(), 2);
        assert_eq!(config.drivers[0].status, DriverStatus::Available);
        assert_eq!(config.drivers[1].status, DriverStatus::Busy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let mut config = DispatchConfig::default();
        config.signaling.primary_url = "http://localhost:5000".to_string();
        config.ice.stun_urls = vec!["stun.l.google.com:19302".to_string()];
        config.ice.turn_urls = vec!["turn.example.com".to_string()];
        config.login.endpoint = "localhost:3000/login".to_string();

        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("primary_url")));
        assert!(issues.iter().any(|i| i.contains("STUN URL")));
        assert!(issues.iter().any(|i| i.contains("TURN URL")));
        assert!(issues.iter().any(|i| i.contains("login.endpoint")));
        assert!(issues.iter().all(|i| i.starts_with("ERROR:") || i.starts_with("WARNING:")));
    }

    #[test]
    fn validate_flags_fallback_equal_to_primary() {
        let mut config = DispatchConfig::default();
        config.signaling.fallback_url = Some(config.signaling.primary_url.clone());
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("WARNING:"));
    }

    #[test]
    fn validate_flags_zero_timeout_and_capacity() {
        let mut config = DispatchConfig::default();
        config.signaling.connect_timeout_ms = 0;
        config.session.event_capacity = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("connect_timeout_ms")));
        assert!(issues.iter().any(|i| i.contains("event_capacity")));
    }

    #[test]
    fn validate_flags_duplicate_drivers() {
        let mut config = DispatchConfig::default();
        let entry = DriverEntry {
            employee_id: "123".to_string(),
            driver_name: "Ana".to_string(),
            vehicle: String::new(),
            status: DriverStatus::Available,
        };
        config.drivers = vec![entry.clone(), entry];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("duplicate driver")));
    }

    #[test]
    fn validate_warns_when_all_media_disabled() {
        let mut config = DispatchConfig::default();
        config.media.audio = false;
        config.media.video = false;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:") && i.contains("media")));
    }
}
