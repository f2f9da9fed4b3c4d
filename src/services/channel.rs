// Outbound message channel.
//
// The engine never talks to a messaging provider directly; it goes
// through this interface. Delivery/read receipts arrive asynchronously
// through a separate event stream the engine does not own.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::SendError;

/// Acknowledgement returned by the channel on a successful hand-off.
#[derive(Debug, Clone)]
pub struct MessageReceipt {
    pub external_message_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Hand one rendered message to the delivery provider.
    async fn send(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        content: &str,
    ) -> Result<MessageReceipt, SendError>;
}

/// HTTP gateway implementation of the message channel.
pub struct HttpMessageChannel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

impl HttpMessageChannel {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl MessageChannel for HttpMessageChannel {
    async fn send(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        content: &str,
    ) -> Result<MessageReceipt, SendError> {
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "tenant_id": tenant_id,
                "contact_id": contact_id,
                "content": content,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout(0)
                } else {
                    SendError::Network(e.to_string())
                }
            })?;

        let status = response.status();

        if status.is_success() {
            let body: SendResponse = response
                .json()
                .await
                .map_err(|e| SendError::Network(e.to_string()))?;
            return Ok(MessageReceipt {
                external_message_id: body.message_id,
            });
        }

        let message = response.text().await.unwrap_or_default();

        // 5xx and 429 are worth retrying; everything else 4xx means the
        // provider rejected the message outright.
        if status.is_server_error() || status.as_u16() == 429 {
            Err(SendError::Transient {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(SendError::Permanent(format!(
                "channel rejected send (status {}): {}",
                status, message
            )))
        }
    }
}
