use async_trait::async_trait;
use chatline_shared::api::CallTokenResponse;
use chatline_shared::types::UserId;
use chatline_shared::ChatError;
use tracing::debug;

/// Source of the opaque credential the media engine requires to join a
/// room. Asked once per join; tokens are never reused across calls.
#[async_trait]
pub trait CallTokenProvider: Send + Sync {
    async fn fetch_token(&self, user: &UserId) -> Result<String, ChatError>;
}

/// Fetches tokens from the companion server's `/call-token` endpoint.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenProvider {
    pub fn new(client: reqwest::Client, api_base: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/call-token", api_base.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CallTokenProvider for HttpTokenProvider {
    async fn fetch_token(&self, user: &UserId) -> Result<String, ChatError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("userID", user.as_str())])
            .send()
            .await
            .map_err(|e| ChatError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| ChatError::Http(e.to_string()))?;
        let body: CallTokenResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::Http(e.to_string()))?;
        debug!(user = %user.short(), "Fetched call token");
        Ok(body.token)
    }
}
