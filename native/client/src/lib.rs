//! A demo secure-messaging client: a file-backed `SecureStore`, an HTTP
//! directory client speaking `native/server`'s JSON API, and the
//! `register`/`send_message`/`poll_inbox` operations the CLI in `main.rs`
//! drives, wired through `protocol::SessionManager` for full X3DH + Double
//! Ratchet sessions rather than one-shot X3DH encryption.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use proto::directory::{
    InboxFrame, PreKeyBundleDto, PreKeyCountResponse, PublishKeysRequest, PublishKeysResponse,
    PullMessagesResponse, PushMessageRequest,
};
use protocol::{CoreError, KeyManager, PreKeyBundle, SecureStore, SessionManager};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Directory(#[from] proto::directory::DirectoryError),
    #[error("local store i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// A `SecureStore` backed by one file per key under a per-user data
/// directory. No concurrent-writer locking beyond the filesystem's own
/// atomicity of a single `write` — adequate for a single-process demo CLI,
/// not a multi-process deployment.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name.replace('/', "__"))
    }
}

impl SecureStore for FileStore {
    fn get(&self, name: &str) -> protocol::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::StorageFailure(e.to_string())),
        }
    }

    fn set(&self, name: &str, bytes: &[u8]) -> protocol::Result<()> {
        fs::write(self.path_for(name), bytes).map_err(|e| CoreError::StorageFailure(e.to_string()))
    }

    fn remove(&self, name: &str) -> protocol::Result<()> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::StorageFailure(e.to_string())),
        }
    }

    fn clear(&self) -> protocol::Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CoreError::StorageFailure(e.to_string())),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::StorageFailure(e.to_string()))?;
            fs::remove_file(entry.path()).map_err(|e| CoreError::StorageFailure(e.to_string()))?;
        }
        Ok(())
    }
}

/// The per-user on-disk directory a `FileStore` lives under, rooted at the
/// platform data dir (spec §6 storage namespacing reinterpreted as one
/// subdirectory per local user identity rather than a single shared store).
pub fn data_dir_for(user_id: &str) -> io::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "secure-messaging-core")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory for this platform"))?;
    let mut path = dirs.data_dir().to_path_buf();
    path.push(user_id);
    Ok(path)
}

/// A thin HTTP client over `native/server`'s JSON directory API.
pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    pub async fn publish_keys<S: SecureStore>(
        &self,
        user_id: &str,
        keys: &KeyManager<S>,
        fresh_one_time_keys: &[(u32, x25519_dalek::PublicKey)],
    ) -> Result<u32, ClientError> {
        let identity = keys.identity()?;
        let spk = keys.current_signed_pre_key()?;
        let body = PublishKeysRequest {
            identity_public: STANDARD.encode(identity.dh_public.as_bytes()),
            identity_sign_public: STANDARD.encode(identity.sign_public.as_bytes()),
            spk_id: spk.id,
            spk_public: STANDARD.encode(spk.public.as_bytes()),
            spk_signature: STANDARD.encode(spk.signature.to_bytes()),
            one_time_public_keys: fresh_one_time_keys
                .iter()
                .map(|(id, public)| (*id, STANDARD.encode(public.as_bytes())))
                .collect(),
        };
        let response: PublishKeysResponse = self
            .http
            .post(format!("{}/v1/keys/{user_id}", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.accepted_one_time_keys)
    }

    pub async fn key_count(&self, user_id: &str) -> Result<u32, ClientError> {
        let response: PreKeyCountResponse = self
            .http
            .get(format!("{}/v1/keys/{user_id}/count", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.count)
    }

    pub async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, ClientError> {
        let dto: PreKeyBundleDto = self
            .http
            .get(format!("{}/v1/keys/{user_id}/bundle", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(PreKeyBundle::try_from(&dto)?)
    }

    pub async fn push_message(&self, recipient: &str, sender_id: &str, frame: &[u8]) -> Result<(), ClientError> {
        let body = PushMessageRequest {
            sender_id: sender_id.to_string(),
            frame: proto::directory::encode_frame(frame),
        };
        self.http
            .post(format!("{}/v1/messages/{recipient}", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn pull_messages(&self, user_id: &str) -> Result<Vec<(String, Vec<u8>)>, ClientError> {
        let response: PullMessagesResponse = self
            .http
            .get(format!("{}/v1/messages/{user_id}", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .frames
            .into_iter()
            .map(|InboxFrame { sender_id, frame }| {
                Ok((sender_id, proto::directory::decode_frame(&frame)?))
            })
            .collect()
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

/// Ensure a local identity exists, then publish (or republish, after
/// rotation/refill) keys to the directory so others can initiate a
/// session with `user_id`.
pub async fn register<S: SecureStore + Clone>(
    directory: &DirectoryClient,
    sessions: &SessionManager<S>,
    user_id: &str,
) -> Result<(), ClientError> {
    let km = sessions.key_manager();
    let init = km.initialize(now())?;
    km.rotate_signed_pre_key_if_needed(now())?;

    let server_count = directory.key_count(user_id).await.unwrap_or(0);
    let fresh_one_time_keys = if init.new_device || km.needs_opk_refill(server_count) {
        km.generate_one_time_pre_keys(protocol::Config::default().opk_batch_size)?
    } else {
        Vec::new()
    };

    directory.publish_keys(user_id, km, &fresh_one_time_keys).await?;
    Ok(())
}

/// Encrypt `plaintext` for `peer_id`, fetching a fresh prekey bundle from
/// the directory first if no session exists yet, and drop the resulting
/// frame in the peer's mailbox.
pub async fn send_message<S: SecureStore + Clone>(
    directory: &DirectoryClient,
    sessions: &SessionManager<S>,
    my_id: &str,
    peer_id: &str,
    plaintext: &[u8],
) -> Result<(), ClientError> {
    let bundle = if sessions.has_session(peer_id)? {
        None
    } else {
        Some(directory.fetch_bundle(peer_id).await?)
    };
    let frame = sessions.encrypt(peer_id, plaintext, bundle.as_ref())?;
    directory.push_message(peer_id, my_id, &frame).await?;
    Ok(())
}

/// Drain `my_id`'s mailbox and decrypt every frame against its sender's
/// session, returning `(sender_id, plaintext)` pairs in delivery order. A
/// frame that fails to decrypt is logged and skipped rather than aborting
/// the whole batch.
pub async fn poll_inbox<S: SecureStore + Clone>(
    directory: &DirectoryClient,
    sessions: &SessionManager<S>,
    my_id: &str,
) -> Result<Vec<(String, Vec<u8>)>, ClientError> {
    let mut out = Vec::new();
    for (sender_id, frame) in directory.pull_messages(my_id).await? {
        match sessions.decrypt(&sender_id, &frame) {
            Ok(plaintext) => out.push((sender_id, plaintext)),
            Err(e) => tracing::warn!(sender = %sender_id, error = %e, "dropping undecryptable inbound frame"),
        }
    }
    Ok(out)
}
