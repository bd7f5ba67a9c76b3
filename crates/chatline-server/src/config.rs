use std::net::SocketAddr;

const UPLOAD_FOLDER: &str = "chat_media";

#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `CHATLINE_HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    // -- Object storage --

    /// Env: `CHATLINE_STORAGE_CLOUD_NAME`
    pub storage_cloud_name: String,

    /// Public key sent back to clients with every signature.
    /// Env: `CHATLINE_STORAGE_API_KEY`
    pub storage_api_key: String,

    /// Never leaves the server.
    /// Env: `CHATLINE_STORAGE_API_SECRET`
    pub storage_api_secret: Option<String>,

    /// Folder signed into uploads that do not name one.
    /// Env: `CHATLINE_UPLOAD_FOLDER`
    pub upload_folder: String,

    // -- Push notifications --

    /// Env: `CHATLINE_PUSH_URL`
    pub push_url: String,

    /// Env: `CHATLINE_PUSH_APP_ID`
    pub push_app_id: Option<String>,

    /// Env: `CHATLINE_PUSH_API_KEY`
    pub push_api_key: Option<String>,

    // -- Calls --

    /// Env: `CHATLINE_CALL_APP_ID`
    pub call_app_id: String,

    /// Env: `CHATLINE_CALL_SERVER_SECRET`
    pub call_server_secret: Option<String>,

    /// Env: `CHATLINE_CALL_TOKEN_TTL_SECS`
    /// Default: `3600`
    pub call_token_ttl_secs: i64,

    // -- Rate limiting --

    /// Sustained requests per second per client IP.
    /// Env: `CHATLINE_RATE_PER_SEC`
    pub rate_per_sec: f64,

    /// Env: `CHATLINE_RATE_BURST`
    pub rate_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            storage_cloud_name: "demo".to_string(),
            storage_api_key: String::new(),
            storage_api_secret: None,
            upload_folder: UPLOAD_FOLDER.to_string(),
            push_url: "https://onesignal.com/api/v1/notifications".to_string(),
            push_app_id: None,
            push_api_key: None,
            call_app_id: String::new(),
            call_server_secret: None,
            call_token_ttl_secs: 3600,
            rate_per_sec: 10.0,
            rate_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHATLINE_HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid CHATLINE_HTTP_ADDR, using default"),
            }
        }

        if let Some(name) = lookup("CHATLINE_STORAGE_CLOUD_NAME") {
            config.storage_cloud_name = name;
        }
        if let Some(key) = lookup("CHATLINE_STORAGE_API_KEY") {
            config.storage_api_key = key;
        }
        config.storage_api_secret = non_empty(lookup("CHATLINE_STORAGE_API_SECRET"));
        if let Some(folder) = non_empty(lookup("CHATLINE_UPLOAD_FOLDER")) {
            config.upload_folder = folder;
        }

        if let Some(url) = non_empty(lookup("CHATLINE_PUSH_URL")) {
            config.push_url = url;
        }
        config.push_app_id = non_empty(lookup("CHATLINE_PUSH_APP_ID"));
        config.push_api_key = non_empty(lookup("CHATLINE_PUSH_API_KEY"));

        if let Some(app_id) = lookup("CHATLINE_CALL_APP_ID") {
            config.call_app_id = app_id;
        }
        config.call_server_secret = non_empty(lookup("CHATLINE_CALL_SERVER_SECRET"));
        if let Some(ttl) = lookup("CHATLINE_CALL_TOKEN_TTL_SECS") {
            match ttl.parse::<i64>() {
                Ok(n) if n > 0 => config.call_token_ttl_secs = n,
                _ => tracing::warn!(value = %ttl, "Invalid CHATLINE_CALL_TOKEN_TTL_SECS, using default"),
            }
        }

        if let Some(rate) = lookup("CHATLINE_RATE_PER_SEC").and_then(|v| v.parse().ok()) {
            config.rate_per_sec = rate;
        }
        if let Some(burst) = lookup("CHATLINE_RATE_BURST").and_then(|v| v.parse().ok()) {
            config.rate_burst = burst;
        }

        config
    }

    pub fn upload_url(&self) -> String {
        format!(
            "https://api.cloudinary.com/v1_1/{}/auto/upload",
            self.storage_cloud_name
        )
    }

    pub fn push_configured(&self) -> bool {
        self.push_app_id.is_some() && self.push_api_key.is_some()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("storage_cloud_name", &self.storage_cloud_name)
            .field("storage_signing", &self.storage_api_secret.is_some())
            .field("upload_folder", &self.upload_folder)
            .field("push", &self.push_configured())
            .field("call_tokens", &self.call_server_secret.is_some())
            .field("call_token_ttl_secs", &self.call_token_ttl_secs)
            .finish()
    }
}
