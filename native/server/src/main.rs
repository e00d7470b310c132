//! The prekey directory service (spec §6 "Directory service"): an HTTP
//! JSON counterpart to the account/message store the secure messaging
//! core needs, but no part of the cryptographic core itself — every
//! identity, prekey, and message frame it holds is opaque bytes to it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ed25519_dalek::{Signature, VerifyingKey};
use rusqlite::Connection;
use sentry::ClientInitGuard;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use x25519_dalek::PublicKey as X25519Public;

use proto::directory::{
    DirectoryError, InboxFrame, PreKeyBundleDto, PreKeyCountResponse, PublishKeysRequest,
    PublishKeysResponse, PullMessagesResponse, PushMessageRequest,
};

mod storage;

use storage::{SqliteDirectory, StoredIdentity};

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Clone)]
struct AppState {
    db: SqliteDirectory,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = Targets::from_str(std::env::var("RUST_LOG").as_deref().unwrap_or("info"))
        .expect("RUST_LOG should be a valid tracing filter");
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .finish()
        .with(filter)
        .try_init()?;

    let _guard: Option<ClientInitGuard> = if let Ok(dsn) = std::env::var("SENTRY_DSN") {
        info!("Creating Sentry guard.");
        Some(sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        )))
    } else {
        warn!("Not creating Sentry guard.");
        None
    };

    let dirs = directories::BaseDirs::new().expect("no home directory found for this platform");
    let db_path: PathBuf = if let Ok(db_dir) = std::env::var("DB") {
        [&db_dir, "directory.db3"].iter().collect()
    } else {
        let mut data_dir = PathBuf::from(dirs.data_dir());
        data_dir.push("secure-messaging-core");
        std::fs::create_dir_all(&data_dir)?;
        data_dir.push("directory.db3");
        data_dir
    };
    info!("Database path: {}", db_path.display());

    let db = SqliteDirectory::new(Connection::open(db_path)?)?;
    let state = Arc::new(AppState { db });

    let app = Router::new()
        .route("/v1/keys/:user_id", post(publish_keys))
        .route("/v1/keys/:user_id/count", get(key_count))
        .route("/v1/keys/:user_id/bundle", get(fetch_bundle))
        .route("/v1/messages/:user_id", post(push_message).get(pull_messages))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080));
    info!("Directory service listening at: {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn publish_keys(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<PublishKeysRequest>,
) -> Result<Json<PublishKeysResponse>, AppError> {
    let identity_public = decode_public(&body.identity_public)?;
    let identity_sign_public = decode_verifying(&body.identity_sign_public)?;
    let spk_public = decode_public(&body.spk_public)?;
    let spk_signature = decode_signature(&body.spk_signature)?;

    // The SPK signature is verified here, at the service boundary, so a
    // corrupt or malicious publish can never poison another user's X3DH.
    protocol::primitives::verify(spk_public.as_bytes(), &spk_signature, &identity_sign_public)
        .map_err(|e| anyhow::anyhow!("signed prekey failed verification: {e}"))?;

    state.db.put_identity(
        &user_id,
        &StoredIdentity {
            identity_public: *identity_public.as_bytes(),
            identity_sign_public: identity_sign_public.to_bytes(),
            spk_id: body.spk_id,
            spk_public: *spk_public.as_bytes(),
            spk_signature: spk_signature.to_bytes(),
        },
    )?;

    let mut accepted = 0u32;
    let mut keys = Vec::with_capacity(body.one_time_public_keys.len());
    for (id, encoded) in &body.one_time_public_keys {
        keys.push((*id, *decode_public(encoded)?.as_bytes()));
        accepted += 1;
    }
    state.db.add_one_time_keys(&user_id, &keys)?;

    Ok(Json(PublishKeysResponse {
        accepted_one_time_keys: accepted,
    }))
}

async fn key_count(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<PreKeyCountResponse>, AppError> {
    let count = state.db.one_time_key_count(&user_id)?;
    Ok(Json(PreKeyCountResponse { count }))
}

async fn fetch_bundle(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<PreKeyBundleDto>, AppError> {
    let identity = state
        .db
        .get_identity(&user_id)?
        .ok_or_else(|| anyhow::anyhow!("no such user: {user_id}"))?;
    let one_time = state.db.pop_one_time_key(&user_id)?;

    use base64::{engine::general_purpose::STANDARD, Engine};
    let dto = PreKeyBundleDto {
        identity_public: STANDARD.encode(identity.identity_public),
        identity_sign_public: STANDARD.encode(identity.identity_sign_public),
        spk_id: identity.spk_id,
        spk_public: STANDARD.encode(identity.spk_public),
        spk_signature: STANDARD.encode(identity.spk_signature),
        opk_id: one_time.as_ref().map(|(id, _)| *id),
        opk_public: one_time.as_ref().map(|(_, public)| STANDARD.encode(public)),
    };
    Ok(Json(dto))
}

async fn push_message(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<PushMessageRequest>,
) -> Result<StatusCode, AppError> {
    let frame = proto::directory::decode_frame(&body.frame).map_err(|e: DirectoryError| anyhow::anyhow!(e))?;
    state.db.add_message(&user_id, &body.sender_id, &frame)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pull_messages(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<PullMessagesResponse>, AppError> {
    let frames = state
        .db
        .take_messages(&user_id)?
        .into_iter()
        .map(|(sender_id, bytes)| InboxFrame {
            sender_id,
            frame: proto::directory::encode_frame(&bytes),
        })
        .collect();
    Ok(Json(PullMessagesResponse { frames }))
}

fn decode_public(value: &str) -> anyhow::Result<X25519Public> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let bytes = STANDARD.decode(value)?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected a 32-byte public key"))?;
    Ok(X25519Public::from(bytes))
}

fn decode_verifying(value: &str) -> anyhow::Result<VerifyingKey> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let bytes = STANDARD.decode(value)?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected a 32-byte verifying key"))?;
    Ok(VerifyingKey::from_bytes(&bytes)?)
}

fn decode_signature(value: &str) -> anyhow::Result<Signature> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let bytes = STANDARD.decode(value)?;
    let bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected a 64-byte signature"))?;
    Ok(Signature::from_bytes(&bytes))
}
