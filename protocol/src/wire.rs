//! L5 wire framing (spec §4.5 / §6): the byte layout exchanged between
//! peers, independent of the transport that carries it.
//!
//! `type_tag(1) | version(1) | [x3dh_header if PreKey] | ratchet_header(40) | ciphertext`,
//! all multi-byte integers big-endian.

use x25519_dalek::PublicKey as X25519Public;

use crate::error::{CoreError, Result};
use crate::ratchet::RatchetHeader;

pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// First message of a session: carries the X3DH header needed for
    /// the receiver to derive the shared secret.
    PreKey = 1,
    /// Any subsequent message on an established session.
    Whisper = 2,
}

impl FrameType {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(FrameType::PreKey),
            2 => Ok(FrameType::Whisper),
            other => Err(CoreError::Malformed(format!("unknown frame type tag {other}"))),
        }
    }
}

/// The X3DH header carried only on `PreKey` frames (spec §4.3/§4.5:
/// `ik_sender(32) | ek(32) | spk_id(4) | opk_id(4, optional)`). `spk_id`
/// lets the receiver select the exact signed prekey the sender used even
/// if it has since rotated to a newer one, honoring the grace period
/// during which a previous SPK must remain decryptable (spec §3
/// "SignedPreKey").
#[derive(Debug, Clone)]
pub struct X3dhHeader {
    pub sender_identity_public: X25519Public,
    pub sender_ephemeral_public: X25519Public,
    pub spk_id: u32,
    pub used_opk_id: Option<u32>,
}

impl X3dhHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.sender_identity_public.as_bytes());
        out.extend_from_slice(self.sender_ephemeral_public.as_bytes());
        out.extend_from_slice(&self.spk_id.to_be_bytes());
        match self.used_opk_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
    }

    fn decode(cur: &mut &[u8]) -> Result<Self> {
        let sender_identity_public = take_public(cur)?;
        let sender_ephemeral_public = take_public(cur)?;
        let spk_id = take_u32(cur)?;
        let flag = take_byte(cur)?;
        let used_opk_id = match flag {
            0 => None,
            1 => Some(take_u32(cur)?),
            _ => return Err(CoreError::Malformed("bad x3dh header opk flag".into())),
        };
        Ok(Self {
            sender_identity_public,
            sender_ephemeral_public,
            spk_id,
            used_opk_id,
        })
    }
}

/// A decoded wire frame.
pub struct Frame {
    pub frame_type: FrameType,
    pub x3dh: Option<X3dhHeader>,
    pub ratchet_header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

pub fn encode_whisper(ratchet_header: &RatchetHeader, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 40 + ciphertext.len());
    out.push(FrameType::Whisper as u8);
    out.push(WIRE_VERSION);
    out.extend_from_slice(&ratchet_header.encode());
    out.extend_from_slice(ciphertext);
    out
}

pub fn encode_prekey(x3dh: &X3dhHeader, ratchet_header: &RatchetHeader, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 73 + 40 + ciphertext.len());
    out.push(FrameType::PreKey as u8);
    out.push(WIRE_VERSION);
    x3dh.encode(&mut out);
    out.extend_from_slice(&ratchet_header.encode());
    out.extend_from_slice(ciphertext);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let mut cur = bytes;
    let tag = take_byte(&mut cur)?;
    let frame_type = FrameType::from_tag(tag)?;
    let version = take_byte(&mut cur)?;
    if version != WIRE_VERSION {
        return Err(CoreError::Malformed(format!("unsupported wire version {version}")));
    }

    let x3dh = match frame_type {
        FrameType::PreKey => Some(X3dhHeader::decode(&mut cur)?),
        FrameType::Whisper => None,
    };

    if cur.len() < 40 {
        return Err(CoreError::Malformed("frame truncated before ratchet header".into()));
    }
    let ratchet_header = RatchetHeader::decode(&cur[0..40])?;
    cur = &cur[40..];

    Ok(Frame {
        frame_type,
        x3dh,
        ratchet_header,
        ciphertext: cur.to_vec(),
    })
}

fn take_byte(cur: &mut &[u8]) -> Result<u8> {
    if cur.is_empty() {
        return Err(CoreError::Malformed("frame truncated".into()));
    }
    let value = cur[0];
    *cur = &cur[1..];
    Ok(value)
}

fn take_u32(cur: &mut &[u8]) -> Result<u32> {
    if cur.len() < 4 {
        return Err(CoreError::Malformed("frame truncated".into()));
    }
    let value = u32::from_be_bytes(cur[0..4].try_into().unwrap());
    *cur = &cur[4..];
    Ok(value)
}

fn take_public(cur: &mut &[u8]) -> Result<X25519Public> {
    if cur.len() < 32 {
        return Err(CoreError::Malformed("frame truncated".into()));
    }
    let bytes: [u8; 32] = cur[0..32].try_into().unwrap();
    *cur = &cur[32..];
    Ok(X25519Public::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives;

    #[test]
    fn normal_frame_round_trip() {
        let (dh_public, _) = primitives::generate_dh_keypair();
        let header = RatchetHeader {
            dh_public,
            n: 3,
            pn: 1,
        };
        let bytes = encode_whisper(&header, b"ciphertext-bytes");
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.frame_type, FrameType::Whisper);
        assert!(frame.x3dh.is_none());
        assert_eq!(frame.ratchet_header.n, 3);
        assert_eq!(frame.ciphertext, b"ciphertext-bytes");
    }

    #[test]
    fn prekey_frame_round_trip_with_and_without_opk() {
        let (identity_public, _) = primitives::generate_dh_keypair();
        let (ephemeral_public, _) = primitives::generate_dh_keypair();
        let (dh_public, _) = primitives::generate_dh_keypair();
        let header = RatchetHeader {
            dh_public,
            n: 0,
            pn: 0,
        };

        for used_opk_id in [None, Some(42u32)] {
            let x3dh = X3dhHeader {
                sender_identity_public: identity_public,
                sender_ephemeral_public: ephemeral_public,
                spk_id: 7,
                used_opk_id,
            };
            let bytes = encode_prekey(&x3dh, &header, b"hello");
            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.frame_type, FrameType::PreKey);
            let decoded_x3dh = frame.x3dh.unwrap();
            assert_eq!(decoded_x3dh.used_opk_id, used_opk_id);
            assert_eq!(frame.ciphertext, b"hello");
        }
    }

    #[test]
    fn rejects_unknown_type_tag() {
        let mut bytes = encode_whisper(
            &RatchetHeader {
                dh_public: primitives::generate_dh_keypair().0,
                n: 0,
                pn: 0,
            },
            b"x",
        );
        bytes[0] = 9;
        assert!(decode(&bytes).is_err());
    }
}
