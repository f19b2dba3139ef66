//! PSBT Relay Service
//!
//! Relay node for `signetpsbt` messages. Peers connect over WebSocket and
//! exchange P2P frames; a node configured with a signer descriptor adds its
//! signature to every template it has not signed yet and relays the result.

mod ws;

use anyhow::{bail, Context, Result};
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bitcoin::ScriptBuf;
use clap::Parser;
use psbt_relay::{DedupKey, Delivery, RelayDecision, RelayEngine, RelayNode, RelayPolicy, SignetPsbtMessage};
use quorum_core::signet::signet_magic;
use quorum_core::{LocalSigner, PsbtSigner, Quorum, QuorumDescriptor, SessionManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use ws::WsTransport;

/// Relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "psbt-relay-svc")]
#[command(about = "Relay node for partially signed signet block templates")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Peer relay WebSocket URLs (ws://host:port/v1/ws)
    #[arg(short, long)]
    peer: Vec<String>,

    /// Signet challenge (hex) this node enforces
    #[arg(long, env = "SIGNET_CHALLENGE")]
    signet_challenge: Option<String>,

    /// Quorum descriptor, optionally holding this node's private key
    #[arg(long, env = "SIGNER_DESCRIPTOR")]
    descriptor: Option<String>,

    /// Number of recently seen messages remembered for deduplication
    #[arg(long, default_value = "1024")]
    window: usize,

    /// Seconds a seen message is remembered
    #[arg(long, default_value = "3600")]
    ttl: u64,

    /// Dedup key: "nonce" or "nonce-and-signers"
    #[arg(long, default_value = "nonce-and-signers")]
    dedup: DedupKey,

    /// Do not forward messages to other peers
    #[arg(long)]
    no_flood: bool,

    /// Seconds between outbound reconnection attempts
    #[arg(long, default_value = "5")]
    retry: u64,
}

/// Application state
pub struct AppState {
    node: RelayNode<WsTransport>,
    quorum: Option<Arc<Quorum>>,
    sessions: Option<SessionManager>,
}

/// Request to inject a message
#[derive(Debug, Serialize, Deserialize)]
struct PostPsbtRequest {
    message: String, // base64 encoded message body
}

#[derive(Debug, Serialize, Deserialize)]
struct PostPsbtResponse {
    nonce: u64,
    accepted: bool,
    forwarded: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionResponse {
    nonce: u64,
    state: quorum_core::RoundState,
    signatures: usize,
    psbt: String, // base64 encoded
}

/// Node configuration resolved from the command line
struct Setup {
    challenge: ScriptBuf,
    descriptor: Option<QuorumDescriptor>,
}

fn resolve_setup(signet_challenge: Option<&str>, descriptor: Option<&str>) -> Result<Setup> {
    let descriptor = descriptor
        .map(QuorumDescriptor::parse)
        .transpose()
        .context("invalid signer descriptor")?;

    let challenge = match signet_challenge {
        Some(hex) => ScriptBuf::from_hex(hex).context("invalid signet challenge")?,
        None => match &descriptor {
            Some(descriptor) => descriptor.challenge().clone(),
            None => bail!("either --signet-challenge or --descriptor is required"),
        },
    };

    if let Some(descriptor) = &descriptor {
        if descriptor.challenge() != &challenge {
            bail!(
                "descriptor challenge {} does not match signet challenge {}",
                hex::encode(descriptor.challenge().as_bytes()),
                hex::encode(challenge.as_bytes())
            );
        }
        info!(
            descriptor = %descriptor,
            local_slot = ?descriptor.local_slot(),
            "Descriptor initialized successfully"
        );
    }

    Ok(Setup {
        challenge,
        descriptor,
    })
}

fn build_state(args: &Args, setup: &Setup) -> Result<(Arc<AppState>, mpsc::UnboundedReceiver<Delivery>, Option<LocalSigner>)> {
    let policy = RelayPolicy {
        capacity: args.window,
        ttl: Some(Duration::from_secs(args.ttl)),
        dedup: args.dedup,
        flood: !args.no_flood,
    };
    let mut engine = RelayEngine::new(policy, signet_magic(&setup.challenge));

    let quorum = setup.descriptor.as_ref().map(QuorumDescriptor::quorum);
    let signer = match &setup.descriptor {
        Some(descriptor) if descriptor.local_slot().is_some() => Some(LocalSigner::from_descriptor(descriptor)?),
        _ => None,
    };
    if let Some(quorum) = &quorum {
        engine = engine.with_quorum(quorum.clone());
    }
    if let Some(signer) = &signer {
        engine = engine.with_local_signer(signer.public_key());
    }

    let (node, deliveries) = RelayNode::new(Arc::new(engine), Arc::new(WsTransport::default()));
    let state = Arc::new(AppState {
        node,
        sessions: quorum.clone().map(SessionManager::new),
        quorum,
    });
    Ok((state, deliveries, signer))
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ws", get(websocket_handler))
        .route("/v1/psbt", post(post_psbt))
        .route("/v1/session/:nonce", get(get_session))
        .route("/v1/sessions", axum::routing::delete(surrender))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!(
        listen = %args.listen,
        peers = ?args.peer,
        window = args.window,
        ttl = args.ttl,
        dedup = %args.dedup,
        flood = !args.no_flood,
        "Starting PSBT relay service"
    );

    let setup = resolve_setup(args.signet_challenge.as_deref(), args.descriptor.as_deref())?;
    let (state, deliveries, signer) = build_state(&args, &setup)?;

    tokio::spawn(process_deliveries(state.clone(), deliveries, signer));

    // Spawn cleanup task
    let cleanup_engine = state.node.engine().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_engine.cleanup();
        }
    });

    for url in &args.peer {
        tokio::spawn(ws::maintain_outbound(
            url.clone(),
            state.clone(),
            Duration::from_secs(args.retry),
        ));
    }

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Merge accepted messages into their sessions and add the local signature
async fn process_deliveries(
    state: Arc<AppState>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    signer: Option<LocalSigner>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let nonce = delivery.message.nonce;
        match process(&state, delivery, signer.as_ref()) {
            Ok(Some(message)) => {
                if let Err(e) = state.node.broadcast(&message).await {
                    error!(nonce, error = %e, "Failed to relay signed PSBT");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(nonce, error = %e, "Failed to process PSBT"),
        }
    }
}

/// Returns the re-signed message to relay, if the local signer signed
fn process(
    state: &AppState,
    delivery: Delivery,
    signer: Option<&LocalSigner>,
) -> quorum_core::Result<Option<SignetPsbtMessage>> {
    let (Some(sessions), Some(quorum)) = (&state.sessions, &state.quorum) else {
        return Ok(None);
    };
    let message = delivery.message;
    let psbt = message.parse_psbt()?;
    let block = message.parse_block()?;
    let expected = quorum_core::signet::signet_psbt(&block, quorum.challenge())?;
    if psbt.unsigned_tx != expected.unsigned_tx {
        return Err(quorum_core::Error::Block(format!(
            "PSBT for nonce {} does not commit to its block template",
            message.nonce
        )));
    }
    let round_state = sessions.start(message.nonce, psbt)?;
    info!(nonce = message.nonce, state = ?round_state, "PSBT merged");

    let Some(signer) = signer.filter(|_| delivery.sign) else {
        return Ok(None);
    };

    let (psbt, slots) = sessions.with_round(message.nonce, |round| {
        round.apply(signer)?;
        Ok::<_, quorum_core::Error>((round.psbt().clone(), round.signed_slots()))
    })??;
    let short_ids = slots
        .into_iter()
        .filter_map(|slot| quorum.short_id(message.nonce, slot))
        .collect();

    info!(nonce = message.nonce, slot = %signer.slot(), "PSBT signed");
    Ok(Some(message.resigned(&psbt, short_ids)))
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "psbt-relay-svc",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Inject a message as if it came from a local peer
async fn post_psbt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PostPsbtRequest>,
) -> impl IntoResponse {
    let message = match b64::decode(&req.message) {
        Ok(bytes) => match SignetPsbtMessage::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e.to_string() })),
                );
            }
        },
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("Invalid base64: {}", e) })),
            );
        }
    };

    let frame = match state.node.engine().encode_frame(&message) {
        Ok(frame) => frame,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            );
        }
    };

    let decision = state.node.receive(None, &frame).await;
    let forwarded = match &decision {
        RelayDecision::Accept { forward_to, .. } => forward_to.len(),
        RelayDecision::Drop(_) => 0,
    };
    info!(nonce = message.nonce, ?decision, "Message injected");

    (
        StatusCode::OK,
        Json(serde_json::json!(PostPsbtResponse {
            nonce: message.nonce,
            accepted: decision.is_accepted(),
            forwarded,
        })),
    )
}

/// Current state of a signing session
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(nonce): Path<u64>,
) -> impl IntoResponse {
    let Some(sessions) = &state.sessions else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "node tracks no sessions" })),
        );
    };

    let session = sessions.with_round(nonce, |round| SessionResponse {
        nonce,
        state: round.state(),
        signatures: round.signature_count(),
        psbt: b64::encode(&round.psbt().serialize()),
    });
    match session {
        Ok(session) => (StatusCode::OK, Json(serde_json::json!(session))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

/// Drop every signing session (a block was found)
async fn surrender(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(sessions) = &state.sessions {
        sessions.end_all();
    }
    StatusCode::NO_CONTENT
}

/// WebSocket handler for relay peers
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| ws::serve_inbound(socket, state))
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};
    use quorum_core::{QuorumBuilder, SignerKeyPair};
    use tower::ServiceExt;

    fn args() -> Args {
        Args::parse_from(["psbt-relay-svc"])
    }

    fn keys() -> Vec<SignerKeyPair> {
        let secp = Secp256k1::new();
        (1..=3u8)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                let public = Keypair::from_secret_key(&secp, &sk).x_only_public_key().0;
                SignerKeyPair::public(public.to_string())
            })
            .collect()
    }

    #[test]
    fn test_challenge_override_must_match_descriptor() {
        let (descriptor, challenge) = QuorumBuilder::build(&keys(), 1).unwrap();
        let text = descriptor.as_str();

        assert!(resolve_setup(Some(&hex::encode(challenge.as_bytes())), Some(text)).is_ok());
        assert!(resolve_setup(None, Some(text)).is_ok());
        assert!(resolve_setup(Some("51"), Some(text)).is_err());
        assert!(resolve_setup(None, None).is_err());
        assert!(resolve_setup(None, Some("tr(invalid_key)")).is_err());
    }

    fn template(time: u32) -> bitcoin::Block {
        let mut block = bitcoin::blockdata::constants::genesis_block(bitcoin::Network::Regtest);
        let mut commitment = vec![0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
        commitment.extend_from_slice(&[0u8; 32]);
        block.txdata[0].output.push(bitcoin::TxOut {
            value: bitcoin::Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(commitment),
        });
        block.header.time = time;
        block.header.merkle_root = block.compute_merkle_root().unwrap();
        block
    }

    #[tokio::test]
    async fn test_psbt_must_match_block_template() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[2u8; 32]).unwrap();
        let wif = bitcoin::PrivateKey::new(sk, bitcoin::Network::Signet).to_wif();
        let mut members = keys();
        members[1] = SignerKeyPair::with_private(wif, sk.x_only_public_key(&secp).0.to_string());
        let views = QuorumBuilder::signer_views(&members, 1).unwrap();

        let setup = resolve_setup(None, Some(&views[0].descriptor)).unwrap();
        let (state, _deliveries, signer) = build_state(&args(), &setup).unwrap();
        let signer = signer.unwrap();
        let challenge = state.quorum.as_ref().unwrap().challenge().clone();

        let committed = template(1_700_000_000);
        let other = template(1_700_000_600);
        let psbt = quorum_core::signet::signet_psbt(&committed, &challenge).unwrap();

        let mismatched = Delivery {
            message: SignetPsbtMessage::new(5, &psbt, &other, vec![]),
            sign: true,
        };
        assert!(process(&state, mismatched, Some(&signer)).is_err());
        assert!(state.sessions.as_ref().unwrap().is_empty());

        let matching = Delivery {
            message: SignetPsbtMessage::new(6, &psbt, &committed, vec![]),
            sign: true,
        };
        let resigned = process(&state, matching, Some(&signer)).unwrap().unwrap();
        assert_eq!(resigned.signers_short_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_health_and_inject() {
        let setup = resolve_setup(Some("51"), None).unwrap();
        let (state, _deliveries, signer) = build_state(&args(), &setup).unwrap();
        assert!(signer.is_none());
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let message = SignetPsbtMessage {
            nonce: 77,
            psbt: vec![1],
            block_template: vec![2],
            signers_short_ids: vec![],
        };
        let body = serde_json::json!({ "message": b64::encode(&message.encode()) }).to_string();
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/v1/psbt")
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: PostPsbtResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed.accepted);

        let response = app.oneshot(request()).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: PostPsbtResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!parsed.accepted);
    }
}
