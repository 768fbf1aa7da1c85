//! Google Pub/Sub pull subscription over the REST API.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{PayloadDecodeSnafu, SourceClientSnafu, SourceError, SourceHttpSnafu};

use super::{AckId, MessageSource, RawMessage};

const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Upper bound on ack ids per acknowledge request.
const ACK_CHUNK: usize = 1000;

const MAX_ACK_DEADLINE_SECS: u64 = 600;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: Vec<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: Vec<&'a str>,
    ack_deadline_seconds: u32,
}

/// Pull subscription client.
pub struct PubSubSource {
    client: reqwest::Client,
    base_url: String,
    subscription: String,
    access_token: Option<String>,
}

impl PubSubSource {
    /// Build a client for the configured subscription.
    ///
    /// The endpoint is taken from config, then `PUBSUB_EMULATOR_HOST`, then
    /// the public API.
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let base_url = config
            .endpoint
            .clone()
            .or_else(|| {
                std::env::var("PUBSUB_EMULATOR_HOST")
                    .ok()
                    .map(|host| format!("http://{host}"))
            })
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .context(SourceClientSnafu)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            subscription: config.subscription.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/v1/{}:{}", self.base_url, self.subscription, method)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        body: &B,
    ) -> Result<reqwest::Response, SourceError> {
        let mut request = self.client.post(self.url(operation)).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context(SourceHttpSnafu { operation })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(SourceError::SourceStatus {
            operation,
            status: status.as_u16(),
            body,
        })
    }

    async fn modify_deadline(&self, ack_ids: &[AckId], seconds: u32) -> Result<(), SourceError> {
        for chunk in ack_ids.chunks(ACK_CHUNK) {
            let body = ModifyAckDeadlineRequest {
                ack_ids: chunk.iter().map(AckId::as_str).collect(),
                ack_deadline_seconds: seconds,
            };
            self.post("modifyAckDeadline", &body).await?;
        }
        Ok(())
    }
}

/// Convert a delivered message, keeping undecodable data as raw text so it
/// is rejected downstream instead of stalling the subscription.
fn into_raw_message(received: ReceivedMessage) -> RawMessage {
    let ReceivedMessage {
        ack_id,
        message,
        delivery_attempt,
    } = received;

    let payload = STANDARD
        .decode(message.data.as_bytes())
        .context(PayloadDecodeSnafu {
            message_id: message.message_id.as_str(),
        })
        .unwrap_or_else(|e| {
            warn!("{e}; passing raw data through");
            message.data.clone().into_bytes()
        });

    RawMessage {
        payload,
        ack_id: AckId::new(ack_id),
        message_id: message.message_id,
        publish_time: message.publish_time,
        delivery_attempt,
    }
}

#[async_trait]
impl MessageSource for PubSubSource {
    async fn pull(&self, max_messages: usize) -> Result<Vec<RawMessage>, SourceError> {
        let response = self.post("pull", &PullRequest { max_messages }).await?;
        let parsed: PullResponse = response
            .json()
            .await
            .context(SourceHttpSnafu { operation: "pull" })?;

        debug!(
            subscription = %self.subscription,
            count = parsed.received_messages.len(),
            "Pulled messages"
        );
        Ok(parsed
            .received_messages
            .into_iter()
            .map(into_raw_message)
            .collect())
    }

    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        for chunk in ack_ids.chunks(ACK_CHUNK) {
            let body = AcknowledgeRequest {
                ack_ids: chunk.iter().map(AckId::as_str).collect(),
            };
            self.post("acknowledge", &body).await?;
        }
        Ok(())
    }

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), SourceError> {
        self.modify_deadline(ack_ids, 0).await
    }

    async fn extend(&self, ack_ids: &[AckId], lease: Duration) -> Result<(), SourceError> {
        // The API takes whole seconds in 0..=600.
        let seconds = lease.as_secs().clamp(1, MAX_ACK_DEADLINE_SECS) as u32;
        self.modify_deadline(ack_ids, seconds).await
    }

    fn name(&self) -> &str {
        &self.subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_response_decoding() {
        let body = r#"{
            "receivedMessages": [{
                "ackId": "ack-1",
                "message": {
                    "data": "eyJpZCI6IjEifQ==",
                    "messageId": "101",
                    "publishTime": "2026-10-16T09:30:00.123Z"
                },
                "deliveryAttempt": 2
            }]
        }"#;
        let parsed: PullResponse = serde_json::from_str(body).unwrap();
        let messages: Vec<RawMessage> = parsed
            .received_messages
            .into_iter()
            .map(into_raw_message)
            .collect();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, br#"{"id":"1"}"#);
        assert_eq!(messages[0].ack_id.as_str(), "ack-1");
        assert_eq!(messages[0].message_id, "101");
        assert_eq!(messages[0].delivery_attempt, Some(2));
        assert!(messages[0].publish_time.is_some());
    }

    #[test]
    fn test_empty_pull_response() {
        let parsed: PullResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.received_messages.is_empty());
    }

    #[test]
    fn test_undecodable_data_passes_through() {
        let received = ReceivedMessage {
            ack_id: "ack-2".to_string(),
            message: PubsubMessage {
                data: "not base64!".to_string(),
                message_id: "102".to_string(),
                publish_time: None,
            },
            delivery_attempt: None,
        };
        let message = into_raw_message(received);
        assert_eq!(message.payload, b"not base64!");
    }

    #[test]
    fn test_subscription_urls() {
        let config = SourceConfig {
            subscription: "projects/acme/subscriptions/events-sub".to_string(),
            endpoint: Some("http://localhost:8085/".to_string()),
            access_token: None,
            max_messages: 100,
            workers: 1,
            pull_backoff_ms: 100,
            ack_deadline_secs: 10,
            max_lease_secs: 3600,
        };
        let source = PubSubSource::new(&config).unwrap();
        assert_eq!(
            source.url("pull"),
            "http://localhost:8085/v1/projects/acme/subscriptions/events-sub:pull"
        );
        assert_eq!(source.name(), "projects/acme/subscriptions/events-sub");
    }
}
