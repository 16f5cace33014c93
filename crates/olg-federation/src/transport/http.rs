//! HTTPS transport built on reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{Ack, CHANGES_PATH, Envelope, INBOX_PATH, Transport, TransportError};
use crate::storage::Instance;

/// Posts envelopes as JSON to `<endpoint>/federation/v1/...`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    timeout_secs: u64,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        // reqwest is built with `rustls-no-provider`; the `Err` case just
        // means a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("olg-federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Protocol(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            http,
            timeout_secs: request_timeout.as_secs(),
        })
    }

    fn url(peer: &Instance, path: &str) -> String {
        format!("{}{path}", peer.endpoint.trim_end_matches('/'))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        envelope: &Envelope,
    ) -> Result<T, TransportError> {
        let resp = self
            .http
            .post(url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout_secs)
                } else {
                    TransportError::Unreachable(e.to_string())
                }
            })?;

        let status = resp.status();
        debug!(url, status = status.as_u16(), message_id = %envelope.id, "Peer responded");
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        resp.json::<T>()
            .await
            .map_err(|e| TransportError::Protocol(format!("undecodable response: {e}")))
    }
}

/// Map a non-success HTTP status to a transport error.
pub(crate) fn status_error(status: StatusCode, body: &str) -> TransportError {
    let detail = format!("{} {}", status.as_u16(), body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthenticated(detail),
        StatusCode::BAD_REQUEST
        | StatusCode::UNSUPPORTED_MEDIA_TYPE
        | StatusCode::UNPROCESSABLE_ENTITY => TransportError::Protocol(detail),
        _ => TransportError::Unreachable(detail),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, peer: &Instance, envelope: &Envelope) -> Result<Ack, TransportError> {
        self.post(&Self::url(peer, INBOX_PATH), envelope).await
    }

    async fn fetch_changes(
        &self,
        peer: &Instance,
        request: &Envelope,
    ) -> Result<Envelope, TransportError> {
        self.post(&Self::url(peer, CHANGES_PATH), request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::{Classify, FederationErrorKind};

    #[test]
    fn auth_statuses_are_not_retryable() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            assert_eq!(status_error(status, "").kind(), FederationErrorKind::AuthFailure);
        }
    }

    #[test]
    fn schema_statuses_are_protocol_errors() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNPROCESSABLE_ENTITY] {
            assert_eq!(
                status_error(status, "bad").kind(),
                FederationErrorKind::ProtocolMismatch
            );
        }
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::NOT_FOUND,
        ] {
            assert_eq!(status_error(status, "").kind(), FederationErrorKind::Transient);
        }
    }

    #[tokio::test]
    async fn unreachable_peer_is_transient() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let peer = Instance {
            id: "i1".into(),
            domain: "peer.invalid".into(),
            public_key: String::new(),
            endpoint: "http://127.0.0.1:9".into(),
            description: String::new(),
            trust_level: crate::storage::TrustLevel::Unverified,
            active: true,
            flagged_for_review: false,
            last_contacted_at: None,
            created_at: 0,
            updated_at: 0,
            deactivated_at: None,
        };
        let env = Envelope::new(
            "m1",
            "a.example",
            "peer.invalid",
            crate::storage::MessageType::Notification,
            serde_json::json!({}),
        );
        let err = transport.send(&peer, &env).await.unwrap_err();
        assert_eq!(err.kind(), FederationErrorKind::Transient);
    }
}
