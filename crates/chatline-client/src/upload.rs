//! Attachment upload to object storage.

use async_trait::async_trait;
use chatline_shared::api::{SignUploadRequest, SignUploadResponse};
use chatline_shared::models::Attachment;
use chatline_shared::ChatError;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

/// Turns a local attachment into a public URL.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, attachment: &Attachment) -> Result<String, ChatError>;
}

pub struct UploadClient {
    client: reqwest::Client,
    sign_endpoint: String,
    folder: String,
}

#[derive(Debug, Deserialize)]
struct UploadedAsset {
    secure_url: String,
}

impl UploadClient {
    pub fn new(client: reqwest::Client, api_base: &str, folder: impl Into<String>) -> Self {
        Self {
            client,
            sign_endpoint: format!("{}/sign-upload", api_base.trim_end_matches('/')),
            folder: folder.into(),
        }
    }

    async fn sign(&self, public_id: &str) -> Result<SignUploadResponse, ChatError> {
        let request = SignUploadRequest {
            folder: Some(self.folder.clone()),
            public_id: Some(public_id.to_string()),
        };
        self.client
            .post(&self.sign_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(upload_error)?
            .error_for_status()
            .map_err(upload_error)?
            .json()
            .await
            .map_err(upload_error)
    }
}

/// Multipart-free form the storage provider accepts: the blob as a data URI
/// plus the signed parameters.
fn form_fields(attachment: &Attachment, signed: &SignUploadResponse) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("file", attachment.preview_uri()),
        ("api_key", signed.api_key.clone()),
        ("timestamp", signed.timestamp.to_string()),
        ("signature", signed.signature.clone()),
    ];
    if let Some(folder) = &signed.folder {
        fields.push(("folder", folder.clone()));
    }
    if let Some(public_id) = &signed.public_id {
        fields.push(("public_id", public_id.clone()));
    }
    fields
}

fn upload_error(e: reqwest::Error) -> ChatError {
    ChatError::Upload(e.to_string())
}

#[async_trait]
impl MediaUploader for UploadClient {
    async fn upload(&self, attachment: &Attachment) -> Result<String, ChatError> {
        let public_id = Uuid::new_v4().to_string();
        let signed = self.sign(&public_id).await?;
        let asset: UploadedAsset = self
            .client
            .post(&signed.upload_url)
            .form(&form_fields(attachment, &signed))
            .send()
            .await
            .map_err(upload_error)?
            .error_for_status()
            .map_err(upload_error)?
            .json()
            .await
            .map_err(upload_error)?;
        debug!(
            bytes = attachment.data.len(),
            content_type = %attachment.content_type,
            "Uploaded attachment"
        );
        Ok(asset.secure_url)
    }
}
