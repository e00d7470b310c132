//! HTTP JSON wire types exchanged with the prekey directory service
//! (spec §6 "Directory service"). Every binary field is base64-encoded,
//! matching the convention other services in this pack use for
//! JSON-transported key material (e.g. `rekindle-crypto`'s
//! `PreKeyBundle`).

pub mod directory;

pub use directory::{
    DirectoryError, PublishKeysRequest, PublishKeysResponse, PullMessagesResponse,
    PushMessageRequest, PreKeyBundleDto, PreKeyCountResponse,
};
