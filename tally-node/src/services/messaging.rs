//! The request/reply messaging fabric between nodes.
//!
//! All inter-node traffic goes through [`Messenger`]: JSON messages
//! posted to the target's `/message` endpoint over a shared HTTP client.
//! [`Messenger::send`] retries connection and timeout failures with a
//! linear backoff; an error status from the peer is deliberate and is
//! never retried. [`Messenger::broadcast`] fans a message out to many
//! endpoints with bounded concurrency and reports per-endpoint outcomes
//! without failing the broadcast. [`Messenger::request_response`] is a
//! single attempt with its own timeout, returning `None` on any failure.

use std::time::Duration;

use futures::StreamExt as _;
use tally_types::{
    NodeUid,
    api::MessageAck,
    message::{Message, MessageBody},
};

use crate::{
    config::NodeConfig,
    metrics::{METRICS_ID_NODE_BROADCAST_FAILURES, METRICS_ID_NODE_SEND_RETRIES},
};

/// Errors a message delivery can end in.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The peer answered with a non-success status; it rejected the
    /// message on purpose, so the delivery is not retried.
    #[error("endpoint {endpoint} answered {status}")]
    ErrorStatus {
        /// The target endpoint.
        endpoint: u16,
        /// The HTTP status the peer answered with.
        status: reqwest::StatusCode,
    },
    /// The endpoint stayed unreachable through all attempts.
    #[error("endpoint {endpoint} unreachable after {attempts} attempts")]
    RetriesExhausted {
        /// The target endpoint.
        endpoint: u16,
        /// How many attempts were made.
        attempts: usize,
        /// The last transport error.
        #[source]
        source: reqwest::Error,
    },
    /// Any other transport failure (e.g. a malformed reply body).
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Handle for sending messages to other nodes.
#[derive(Clone)]
pub struct Messenger {
    client: reqwest::Client,
    sender_uid: NodeUid,
    max_retries: usize,
    retry_backoff: Duration,
    request_timeout: Duration,
    max_concurrent: usize,
}

impl Messenger {
    /// Creates a messenger identifying itself as `sender_uid`.
    pub fn new(sender_uid: NodeUid, config: &NodeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            sender_uid,
            max_retries: config.send_retries,
            retry_backoff: config.send_retry_backoff,
            request_timeout: config.message_timeout,
            max_concurrent: config.max_concurrent_sends,
        }
    }

    fn message_url(endpoint: u16) -> String {
        format!("http://127.0.0.1:{endpoint}/message")
    }

    /// Sends a message with the default timeout, retrying transport
    /// failures.
    pub async fn send(&self, endpoint: u16, body: MessageBody) -> Result<MessageAck, SendError> {
        self.send_with_timeout(endpoint, body, self.request_timeout)
            .await
    }

    /// Sends a message, retrying connection and timeout failures up to
    /// the configured attempt count with a linearly growing backoff.
    pub async fn send_with_timeout(
        &self,
        endpoint: u16,
        body: MessageBody,
        timeout: Duration,
    ) -> Result<MessageAck, SendError> {
        let url = Self::message_url(endpoint);
        let message = Message::new(body, self.sender_uid);
        let mut attempt = 0usize;
        loop {
            match self
                .client
                .post(&url)
                .timeout(timeout)
                .json(&message)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        tracing::debug!(
                            "delivered {} message to endpoint {endpoint}",
                            message.body.kind()
                        );
                        return Ok(response.json::<MessageAck>().await?);
                    }
                    tracing::warn!(
                        "endpoint {endpoint} answered {status} to {} message",
                        message.body.kind()
                    );
                    return Err(SendError::ErrorStatus { endpoint, status });
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(SendError::RetriesExhausted {
                            endpoint,
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let backoff = self.retry_backoff * attempt as u32;
                    tracing::warn!(
                        "attempt {attempt} to endpoint {endpoint} failed ({err}), retrying in {backoff:?}"
                    );
                    ::metrics::counter!(METRICS_ID_NODE_SEND_RETRIES).increment(1);
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(SendError::Transport(err)),
            }
        }
    }

    /// Fans a message out to many endpoints with bounded concurrency.
    ///
    /// Per-endpoint failures are reported in the result list and never
    /// fail the broadcast as a whole.
    pub async fn broadcast(
        &self,
        endpoints: Vec<u16>,
        body: MessageBody,
    ) -> Vec<(u16, Result<MessageAck, SendError>)> {
        if endpoints.is_empty() {
            tracing::warn!("no endpoints to broadcast {} message to", body.kind());
            return Vec::new();
        }
        tracing::info!(
            "broadcasting {} message to {} nodes",
            body.kind(),
            endpoints.len()
        );
        let results = futures::stream::iter(endpoints.into_iter().map(|endpoint| {
            let body = body.clone();
            async move { (endpoint, self.send(endpoint, body).await) }
        }))
        .buffer_unordered(self.max_concurrent)
        .collect::<Vec<_>>()
        .await;
        let failures = results.iter().filter(|(_, r)| r.is_err()).count();
        if failures > 0 {
            ::metrics::counter!(METRICS_ID_NODE_BROADCAST_FAILURES).increment(failures as u64);
        }
        tracing::info!(
            "broadcast complete: {} delivered, {failures} failed",
            results.len() - failures
        );
        results
    }

    /// Sends a request as a single attempt with a dedicated timeout.
    ///
    /// Returns `None` on any failure instead of an error; the caller
    /// decides what a missing reply means.
    pub async fn request_response(
        &self,
        endpoint: u16,
        body: MessageBody,
        timeout: Duration,
    ) -> Option<MessageAck> {
        let url = Self::message_url(endpoint);
        let message = Message::new(body, self.sender_uid);
        match self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&message)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                tracing::warn!(
                    "endpoint {endpoint} answered {} to {} request",
                    response.status(),
                    message.body.kind()
                );
                None
            }
            Err(err) => {
                tracing::warn!("request to endpoint {endpoint} failed: {err}");
                None
            }
        }
    }
}
