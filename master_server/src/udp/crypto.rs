// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Packet encryption as dictated by the game's network library. The key and
//! associated data are protocol constants, not secrets; the AEAD's purpose
//! is framing integrity and keeping middleboxes from rewriting datagrams.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

/// Fixed 16-byte key from the game's network library. Cannot be changed.
pub const NETWORK_KEY: [u8; 16] = *b"X3V.bXCfe3EhN'wb";
/// Fixed associated-data constant, likewise baked into the protocol.
pub const NETWORK_AAD: [u8; 16] = *b"pNS1.1.connless\0";

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Bytes added to every plaintext on the wire.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CryptoError {
    #[error("datagram shorter than nonce and tag")]
    TooShort,
    #[error("datagram failed authentication")]
    BadTag,
}

/// Encrypts one datagram. Wire layout: `nonce || tag || ciphertext`, with a
/// fresh random nonce per packet.
pub fn seal(plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm::new((&NETWORK_KEY).into());
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    // aes-gcm appends the tag to the ciphertext; the wire wants it first.
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &NETWORK_AAD,
            },
        )
        .expect("aes-gcm encryption is infallible for datagram-sized input");
    let split = sealed.len() - TAG_LEN;

    let mut wire = Vec::with_capacity(NONCE_LEN + sealed.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&sealed[split..]);
    wire.extend_from_slice(&sealed[..split]);
    wire
}

/// Decrypts one datagram laid out as `nonce || tag || ciphertext`.
pub fn open(wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wire.len() < OVERHEAD {
        return Err(CryptoError::TooShort);
    }
    let (nonce, rest) = wire.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let mut sealed = Vec::with_capacity(rest.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let cipher = Aes128Gcm::new((&NETWORK_KEY).into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &sealed,
                aad: &NETWORK_AAD,
            },
        )
        .map_err(|_| CryptoError::BadTag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        for len in [0usize, 1, 13, 512, 1200] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let wire = seal(&plaintext);
            assert_eq!(wire.len(), plaintext.len() + OVERHEAD);
            assert_eq!(open(&wire).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonces_are_fresh_per_packet() {
        let a = seal(b"same plaintext");
        let b = seal(b"same plaintext");
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let mut wire = seal(b"do not touch");
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(open(&wire).unwrap_err(), CryptoError::BadTag);

        // Flipping a tag bit fails too.
        let mut wire = seal(b"do not touch");
        wire[NONCE_LEN] ^= 0x01;
        assert_eq!(open(&wire).unwrap_err(), CryptoError::BadTag);
    }

    #[test]
    fn short_datagrams_are_rejected() {
        assert_eq!(open(&[]).unwrap_err(), CryptoError::TooShort);
        assert_eq!(open(&[0u8; OVERHEAD - 1]).unwrap_err(), CryptoError::TooShort);
        // Exactly the overhead is an empty (valid-length) ciphertext, but a
        // zeroed tag never authenticates.
        assert_eq!(open(&[0u8; OVERHEAD]).unwrap_err(), CryptoError::BadTag);
    }
}
