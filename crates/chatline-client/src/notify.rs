use async_trait::async_trait;
use chatline_shared::api::{NotifyRequest, NotifyResponse};
use chatline_shared::ChatError;

/// Push-notification dispatch. Best-effort: callers log failures and move
/// on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &NotifyRequest) -> Result<NotifyResponse, ChatError>;
}

/// Posts to the companion server's `/notify` endpoint.
pub struct PushClient {
    client: reqwest::Client,
    endpoint: String,
}

impl PushClient {
    pub fn new(client: reqwest::Client, api_base: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/notify", api_base.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Notifier for PushClient {
    async fn notify(&self, request: &NotifyRequest) -> Result<NotifyResponse, ChatError> {
        let response: NotifyResponse = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChatError::Http(e.to_string()))?;
        if !response.success {
            let reason = response.error.as_deref().unwrap_or("dispatch refused");
            return Err(ChatError::Http(reason.to_string()));
        }
        Ok(response)
    }
}
