use std::str::FromStr;
use std::time::Duration;

use chatline_shared::constants::{INITIAL_WINDOW, PAGE_INCREMENT, TYPING_IDLE, UPLOAD_FOLDER};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the companion HTTP endpoints (sign-upload, notify,
    /// call-token).
    /// Env: `CHATLINE_API_BASE`
    /// Default: `http://localhost:8080/api`
    pub api_base: String,

    /// Messages a conversation view opens with.
    /// Env: `CHATLINE_INITIAL_WINDOW`
    pub initial_window: usize,

    /// Messages added by each backward page load.
    /// Env: `CHATLINE_PAGE_INCREMENT`
    pub page_increment: usize,

    /// Idle time before a typing signal is withdrawn.
    /// Env: `CHATLINE_TYPING_IDLE_MS`
    pub typing_idle: Duration,

    /// Object storage folder uploads are placed in.
    /// Env: `CHATLINE_UPLOAD_FOLDER`
    pub upload_folder: String,

    /// Whether sends dispatch push notifications to the other participants.
    /// Env: `CHATLINE_NOTIFICATIONS` (true/false)
    pub notifications_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8080/api".to_string(),
            initial_window: INITIAL_WINDOW,
            page_increment: PAGE_INCREMENT,
            typing_idle: TYPING_IDLE,
            upload_folder: UPLOAD_FOLDER.to_string(),
            notifications_enabled: true,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(base) = lookup("CHATLINE_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        parse_into(&lookup, "CHATLINE_INITIAL_WINDOW", &mut config.initial_window);
        parse_into(&lookup, "CHATLINE_PAGE_INCREMENT", &mut config.page_increment);

        let mut idle_ms = config.typing_idle.as_millis() as u64;
        parse_into(&lookup, "CHATLINE_TYPING_IDLE_MS", &mut idle_ms);
        config.typing_idle = Duration::from_millis(idle_ms);

        if let Some(folder) = lookup("CHATLINE_UPLOAD_FOLDER") {
            config.upload_folder = folder;
        }
        if let Some(val) = lookup("CHATLINE_NOTIFICATIONS") {
            config.notifications_enabled = val != "false" && val != "0";
        }

        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.initial_window, 50);
        assert_eq!(config.typing_idle, Duration::from_secs(2));
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CHATLINE_API_BASE", "https://chat.example.com/api/"),
            ("CHATLINE_PAGE_INCREMENT", "25"),
            ("CHATLINE_TYPING_IDLE_MS", "1500"),
            ("CHATLINE_NOTIFICATIONS", "0"),
        ]));
        assert_eq!(config.api_base, "https://chat.example.com/api");
        assert_eq!(config.page_increment, 25);
        assert_eq!(config.typing_idle, Duration::from_millis(1500));
        assert!(!config.notifications_enabled);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[("CHATLINE_INITIAL_WINDOW", "lots")]));
        assert_eq!(config.initial_window, INITIAL_WINDOW);
    }
}
