//! PSBT Relay Client
//!
//! Client library for submitting `signetpsbt` messages to a relay node and
//! collecting the partial signatures it relays back.

use base64::{engine::general_purpose::STANDARD, Engine};
use bitcoin::p2p::Magic;
use futures_util::StreamExt;
use psbt_relay::SignetPsbtMessage;
use quorum_core::{Error, Result, RoundState, SigningRound};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, warn};

/// HTTP client for a relay node
pub struct RelayClient {
    /// HTTP client
    client: Client,
    /// Relay service URL
    url: String,
    /// Request timeout
    timeout: Duration,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// WebSocket endpoint of the node
    pub fn ws_url(&self) -> String {
        format!("{}/v1/ws", self.url.replacen("http", "ws", 1))
    }

    /// Check that the node is up
    pub async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        Ok(response.status().is_success())
    }

    /// Inject a message into the relay network through the node
    #[instrument(skip_all, fields(nonce = message.nonce))]
    pub async fn submit(&self, message: &SignetPsbtMessage) -> Result<SubmitResponse> {
        let req = SubmitRequest {
            message: STANDARD.encode(message.encode()),
        };

        let response = self
            .client
            .post(format!("{}/v1/psbt", self.url))
            .json(&req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "POST failed with status: {}",
                response.status()
            )));
        }

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        debug!(accepted = submitted.accepted, forwarded = submitted.forwarded, "Message submitted");
        Ok(submitted)
    }

    /// Session state tracked by the node
    pub async fn session(&self, nonce: u64) -> Result<Option<SessionStatus>> {
        let response = self
            .client
            .get(format!("{}/v1/session/{}", self.url, nonce))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "GET failed with status: {}",
                response.status()
            )));
        }

        let status = response
            .json()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        Ok(Some(status))
    }

    /// Join the relay network as a peer and receive every relayed message
    pub async fn subscribe(&self, magic: Magic) -> Result<Subscription> {
        let (stream, _) = tokio_tungstenite::connect_async(self.ws_url())
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        let (_, mut source) = stream.split();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let frame = match frame {
                    Ok(Message::Binary(frame)) => frame,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Relay connection failed");
                        break;
                    }
                };
                match SignetPsbtMessage::from_frame(&frame, magic) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed frame"),
                }
            }
        });

        Ok(Subscription { messages: rx })
    }
}

/// Messages relayed to a subscribed client
pub struct Subscription {
    messages: mpsc::Receiver<SignetPsbtMessage>,
}

impl Subscription {
    /// Next relayed message
    pub async fn next_message(&mut self, timeout: Duration) -> Result<SignetPsbtMessage> {
        match tokio::time::timeout(timeout, self.messages.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(Error::Relay("relay connection closed".into())),
            Err(_) => Err(Error::CollectionTimeout(timeout)),
        }
    }

    /// Merge relayed PSBTs of session `nonce` into `round` until it completes
    pub async fn collect_round(
        &mut self,
        round: &mut SigningRound,
        nonce: u64,
        timeout: Duration,
    ) -> Result<RoundState> {
        let (tx, mut rx) = mpsc::channel(16);
        let messages = &mut self.messages;
        let forward = async move {
            while let Some(message) = messages.recv().await {
                if message.nonce != nonce {
                    continue;
                }
                match message.parse_psbt() {
                    Ok(psbt) => {
                        if tx.send(psbt).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(nonce, error = %e, "Dropping unreadable PSBT"),
                }
            }
        };

        tokio::select! {
            result = round.collect(&mut rx, timeout) => result?,
            _ = forward => return Err(Error::Relay("relay connection closed".into())),
        }
        Ok(round.state())
    }

    #[cfg(test)]
    fn from_channel(messages: mpsc::Receiver<SignetPsbtMessage>) -> Self {
        Self { messages }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitRequest {
    message: String,
}

/// Result of injecting a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub nonce: u64,
    pub accepted: bool,
    pub forwarded: usize,
}

/// Session state reported by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub nonce: u64,
    pub state: RoundState,
    pub signatures: usize,
    /// Base64 PSBT
    pub psbt: String,
}

impl SessionStatus {
    /// Decode the merged PSBT
    pub fn psbt(&self) -> Result<bitcoin::psbt::Psbt> {
        let bytes = STANDARD
            .decode(&self.psbt)
            .map_err(|e| Error::Psbt(e.to_string()))?;
        Ok(bitcoin::psbt::Psbt::deserialize(&bytes)?)
    }
}
