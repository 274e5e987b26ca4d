// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Connectionless datagram framing. Every packet we handle begins with the
//! `0xFFFFFFFF` connectionless prefix and a one-byte kind; anything else on
//! the socket is counted and discarded.

use hmac::{Hmac, Mac};
use master_protocol::id::ServerAuthToken;
use sha2::Sha256;
use thiserror::Error;

pub const CONNECTIONLESS_PREFIX: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Master → server connection prompt / game-port challenge.
pub const KIND_CONNECT: u8 = b'H';
/// Server → master connection acknowledgement.
pub const KIND_CONNECT_REPLY: u8 = b'I';
/// Master → server signed request.
pub const KIND_SIGREQ1: u8 = b'T';

const CONNECT_MAGIC: &[u8] = b"connect\0";
const CONNECT_SUFFIX: u8 = 0x02;
pub const HMAC_LEN: usize = 32;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PacketError {
    #[error("not a connectionless datagram")]
    NotConnectionless,
    #[error("connectionless datagram truncated")]
    Truncated,
    #[error("connectionless payload malformed")]
    Malformed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// Prompts a game server to acknowledge a pending connection.
    ConnectPrompt { uid: u64 },
    /// Challenges a game port to prove it speaks the protocol.
    GetChallenge { uid: u64 },
    /// A game server acknowledging a prompt or challenge.
    ConnectReply {
        challenge: i32,
        uid: u64,
        data: Vec<u8>,
    },
    /// A signed master→server request; HMAC-SHA256 of the body.
    SigReq1 { hmac: [u8; HMAC_LEN], body: Vec<u8> },
    /// Connectionless, but not a kind this master handles.
    Unknown { kind: u8 },
}

fn frame(kind: u8, payload_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONNECTIONLESS_PREFIX.len() + 1 + payload_len);
    out.extend_from_slice(&CONNECTIONLESS_PREFIX);
    out.push(kind);
    out
}

/// `H` packet: `uid:u64le || 0x02`.
pub fn encode_connect(uid: u64) -> Vec<u8> {
    let mut out = frame(KIND_CONNECT, 9);
    out.extend_from_slice(&uid.to_le_bytes());
    out.push(CONNECT_SUFFIX);
    out
}

/// `H` packet: `"connect\0" || uid:u64le || 0x02`. Used by the registration
/// probe against the game port.
pub fn encode_getchallenge(uid: u64) -> Vec<u8> {
    let mut out = frame(KIND_CONNECT, CONNECT_MAGIC.len() + 9);
    out.extend_from_slice(CONNECT_MAGIC);
    out.extend_from_slice(&uid.to_le_bytes());
    out.push(CONNECT_SUFFIX);
    out
}

/// `I` packet, as a game server would send it. Only used by tests here, but
/// kept next to its decoder so the two cannot drift apart.
pub fn encode_connect_reply(challenge: i32, uid: u64, data: &[u8]) -> Vec<u8> {
    let mut out = frame(KIND_CONNECT_REPLY, 4 + 8 + CONNECT_MAGIC.len() + data.len());
    out.extend_from_slice(&challenge.to_le_bytes());
    out.extend_from_slice(&uid.to_le_bytes());
    out.extend_from_slice(CONNECT_MAGIC);
    out.extend_from_slice(data);
    out
}

/// Signs `body` the way game servers verify it: HMAC-SHA256 keyed with the
/// lowercase-hex rendering of the server's auth token.
pub fn sign(token: &ServerAuthToken, body: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = Hmac::<Sha256>::new_from_slice(token.to_string().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    mac.finalize().into_bytes().into()
}

/// `T` packet: `hmac(body) || body`.
pub fn encode_sigreq1(token: &ServerAuthToken, body: &[u8]) -> Vec<u8> {
    let mut out = frame(KIND_SIGREQ1, HMAC_LEN + body.len());
    out.extend_from_slice(&sign(token, body));
    out.extend_from_slice(body);
    out
}

fn read_u64le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

pub fn decode(plain: &[u8]) -> Result<Packet, PacketError> {
    if plain.len() < CONNECTIONLESS_PREFIX.len() + 1 {
        return Err(if plain.starts_with(&CONNECTIONLESS_PREFIX) {
            PacketError::Truncated
        } else {
            PacketError::NotConnectionless
        });
    }
    let (prefix, rest) = plain.split_at(CONNECTIONLESS_PREFIX.len());
    if prefix != CONNECTIONLESS_PREFIX {
        return Err(PacketError::NotConnectionless);
    }
    let kind = rest[0];
    let payload = &rest[1..];

    match kind {
        KIND_CONNECT => {
            if let Some(tail) = payload.strip_prefix(CONNECT_MAGIC) {
                if tail.len() < 8 {
                    return Err(PacketError::Truncated);
                }
                Ok(Packet::GetChallenge {
                    uid: read_u64le(tail),
                })
            } else {
                if payload.len() < 8 {
                    return Err(PacketError::Truncated);
                }
                Ok(Packet::ConnectPrompt {
                    uid: read_u64le(payload),
                })
            }
        }
        KIND_CONNECT_REPLY => {
            if payload.len() < 4 + 8 + CONNECT_MAGIC.len() {
                return Err(PacketError::Truncated);
            }
            let mut challenge = [0u8; 4];
            challenge.copy_from_slice(&payload[..4]);
            let uid = read_u64le(&payload[4..]);
            let tail = &payload[12..];
            if !tail.starts_with(CONNECT_MAGIC) {
                return Err(PacketError::Malformed);
            }
            Ok(Packet::ConnectReply {
                challenge: i32::from_le_bytes(challenge),
                uid,
                data: tail[CONNECT_MAGIC.len()..].to_vec(),
            })
        }
        KIND_SIGREQ1 => {
            if payload.len() < HMAC_LEN {
                return Err(PacketError::Truncated);
            }
            let mut hmac = [0u8; HMAC_LEN];
            hmac.copy_from_slice(&payload[..HMAC_LEN]);
            Ok(Packet::SigReq1 {
                hmac,
                body: payload[HMAC_LEN..].to_vec(),
            })
        }
        kind => Ok(Packet::Unknown { kind }),
    }
}
