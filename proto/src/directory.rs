//! Request/response bodies for the directory service's HTTP JSON API
//! (spec §6): publish an identity + rotating prekeys, fetch another
//! user's current bundle (consuming one one-time key), and drop off /
//! collect opaque wire frames for offline delivery.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::PublicKey as X25519Public;

use protocol::PreKeyBundle;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid base64 in field {0}")]
    Base64(&'static str),
    #[error("invalid key length in field {0}")]
    KeyLength(&'static str),
    #[error("invalid signature in field {0}")]
    Signature(&'static str),
}

fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode_32(field: &'static str, value: &str) -> Result<[u8; 32], DirectoryError> {
    let bytes = STANDARD.decode(value).map_err(|_| DirectoryError::Base64(field))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| DirectoryError::KeyLength(field))
}

fn decode_64(field: &'static str, value: &str) -> Result<[u8; 64], DirectoryError> {
    let bytes = STANDARD.decode(value).map_err(|_| DirectoryError::Base64(field))?;
    <[u8; 64]>::try_from(bytes.as_slice()).map_err(|_| DirectoryError::KeyLength(field))
}

/// Wire form of `protocol::PreKeyBundle`, the public half of an X3DH bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundleDto {
    pub identity_public: String,
    pub identity_sign_public: String,
    pub spk_id: u32,
    pub spk_public: String,
    pub spk_signature: String,
    pub opk_id: Option<u32>,
    pub opk_public: Option<String>,
}

impl From<&PreKeyBundle> for PreKeyBundleDto {
    fn from(bundle: &PreKeyBundle) -> Self {
        Self {
            identity_public: encode(bundle.identity_public.as_bytes()),
            identity_sign_public: encode(bundle.identity_sign_public.as_bytes()),
            spk_id: bundle.spk_id,
            spk_public: encode(bundle.spk_public.as_bytes()),
            spk_signature: encode(&bundle.spk_signature.to_bytes()),
            opk_id: bundle.opk_id,
            opk_public: bundle.opk_public.map(|k| encode(k.as_bytes())),
        }
    }
}

impl TryFrom<&PreKeyBundleDto> for PreKeyBundle {
    type Error = DirectoryError;

    fn try_from(dto: &PreKeyBundleDto) -> Result<Self, Self::Error> {
        let identity_public = X25519Public::from(decode_32("identity_public", &dto.identity_public)?);
        let identity_sign_public_bytes = decode_32("identity_sign_public", &dto.identity_sign_public)?;
        let identity_sign_public = VerifyingKey::from_bytes(&identity_sign_public_bytes)
            .map_err(|_| DirectoryError::Signature("identity_sign_public"))?;
        let spk_public = X25519Public::from(decode_32("spk_public", &dto.spk_public)?);
        let spk_signature = Signature::from_bytes(&decode_64("spk_signature", &dto.spk_signature)?);
        let opk_public = match &dto.opk_public {
            Some(value) => Some(X25519Public::from(decode_32("opk_public", value)?)),
            None => None,
        };

        Ok(PreKeyBundle {
            identity_public,
            identity_sign_public,
            spk_id: dto.spk_id,
            spk_public,
            spk_signature,
            opk_id: dto.opk_id,
            opk_public,
        })
    }
}

/// `POST /v1/keys/{user_id}` — (re)publish identity, current SPK, and a
/// batch of fresh OTKs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishKeysRequest {
    pub identity_public: String,
    pub identity_sign_public: String,
    pub spk_id: u32,
    pub spk_public: String,
    pub spk_signature: String,
    /// `(id, base64 public key)` pairs.
    pub one_time_public_keys: Vec<(u32, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishKeysResponse {
    pub accepted_one_time_keys: u32,
}

/// `GET /v1/keys/{user_id}/count` — how many unconsumed OTKs remain
/// server-side, used to drive `KeyManager::needs_opk_refill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyCountResponse {
    pub count: u32,
}

/// `POST /v1/messages/{user_id}` — drop an opaque wire frame in a
/// recipient's mailbox. `sender_id` is transport metadata the core itself
/// never inspects (spec §4.5 "the transport hands it a frame plus
/// `(peer_id, device_id)`") — it lets the recipient route an inbound
/// `Whisper` frame to the right per-peer ratchet, since the frame bytes
/// carry no sender identity once a session is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessageRequest {
    pub sender_id: String,
    pub frame: String,
}

/// One queued frame together with the sender id it arrived under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxFrame {
    pub sender_id: String,
    pub frame: String,
}

/// `GET /v1/messages/{user_id}` — drain and return every queued frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullMessagesResponse {
    pub frames: Vec<InboxFrame>,
}

pub fn encode_frame(bytes: &[u8]) -> String {
    encode(bytes)
}

pub fn decode_frame(value: &str) -> Result<Vec<u8>, DirectoryError> {
    STANDARD.decode(value).map_err(|_| DirectoryError::Base64("frame"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_dto_round_trips() {
        let km = protocol::KeyManager::new(protocol::MemoryStore::new(), protocol::Config::default());
        let bundle = km.initialize(0).unwrap().bundle.unwrap();

        let dto = PreKeyBundleDto::from(&bundle);
        let round_tripped = PreKeyBundle::try_from(&dto).unwrap();

        assert_eq!(
            round_tripped.identity_public.as_bytes(),
            bundle.identity_public.as_bytes()
        );
        assert_eq!(round_tripped.spk_id, bundle.spk_id);
        assert_eq!(round_tripped.opk_id, bundle.opk_id);
    }
}
