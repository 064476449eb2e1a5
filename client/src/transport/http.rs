//! HTTP calls shared by both transports.

use super::SendResult;
use crate::{
    config::SyncConfig,
    error::{ClientError, Result},
};
use cardsync_engine::{
    protocol::is_rejection_status, Error, MutationRequest, MutationResponse, PollResponse,
    Rejection, Timestamp,
};
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;

/// Header carrying the acting user's ID.
pub const USER_HEADER: &str = "x-user-id";

/// HTTP client for `GET /updates` and `POST /mutations`.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    updates_url: String,
    mutations_url: String,
    send_timeout: Duration,
}

impl HttpApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&config.user_id) {
            Ok(value) => {
                headers.insert(USER_HEADER, value);
            }
            Err(_) => tracing::warn!(user_id = %config.user_id, "User ID is not a valid header value"),
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.send_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            updates_url: config.updates_url(),
            mutations_url: config.mutations_url(),
            send_timeout: config.send_timeout,
        })
    }

    /// Fetch updates newer than `since`.
    pub async fn fetch_updates(&self, since: Timestamp) -> Result<PollResponse> {
        let request = self
            .client
            .get(&self.updates_url)
            .query(&[("since", since)])
            .send();

        let response = tokio::time::timeout(self.send_timeout, request)
            .await
            .map_err(|_| ClientError::InvalidResponse("poll timed out".into()))??;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::InvalidResponse(format!(
                "poll returned HTTP {}",
                status.as_u16()
            )));
        }

        Ok(response.json::<PollResponse>().await?)
    }

    /// Send a mutation, bounded by the send timeout.
    pub async fn send_mutation(&self, request: &MutationRequest) -> SendResult {
        let mutation_id = request.mutation_id.clone();

        let call = async {
            let response = self
                .client
                .post(&self.mutations_url)
                .json(request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        Error::SendTimeout(mutation_id.clone())
                    } else {
                        tracing::debug!(mutation_id = %mutation_id, "Send failed: {}", e);
                        Error::TransportUnavailable
                    }
                })?;

            let status = response.status().as_u16();
            if is_rejection_status(status) {
                let reason = match response.json::<Rejection>().await {
                    Ok(rejection) => rejection.reason,
                    Err(_) => format!("HTTP {}", status),
                };
                return Err(Error::SendRejected {
                    mutation_id: mutation_id.clone(),
                    reason,
                });
            }

            if !response.status().is_success() {
                tracing::debug!(mutation_id = %mutation_id, status, "Server failed to process mutation");
                return Err(Error::TransportUnavailable);
            }

            response.json::<MutationResponse>().await.map_err(|e| {
                tracing::warn!(mutation_id = %mutation_id, "Malformed mutation response: {}", e);
                Error::TransportUnavailable
            })
        };

        match tokio::time::timeout(self.send_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::SendTimeout(request.mutation_id.clone())),
        }
    }
}
