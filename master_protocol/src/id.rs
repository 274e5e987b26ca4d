// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use rand::Rng;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;

/// 64-bit unsigned player identifier, globally unique within the game
/// ecosystem. Issued by the upstream platform, never minted here.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl Display for PlayerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PlayerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Identifies one registration of a game server, as a 32 character lowercase
/// hex string on the wire. Regenerated every time a server (re)registers.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GameServerId(pub u128);

impl GameServerId {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }
}

/// Credential minted per successful player authentication, 32 hex characters,
/// bound to an IP and expiring.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionToken(pub u128);

impl SessionToken {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }
}

/// Per-join credential handed to a specific game server, 31 hex characters.
/// The odd length is dictated by the game's token buffer.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct JoinToken(pub u128);

impl JoinToken {
    /// Number of hex characters on the wire.
    pub const LEN: usize = 31;

    pub fn generate() -> Self {
        // Top 4 bits stay clear so the value always renders in 31 nibbles.
        Self(rand::thread_rng().gen::<u128>() >> 4)
    }
}

/// Secret shared between the master and one registered game server. The
/// master signs outbound UDP requests with it; the server authenticates
/// HTTP callbacks from the master with it.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ServerAuthToken(pub u128);

impl ServerAuthToken {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Debug for ServerAuthToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Never log the secret itself.
        f.write_str("ServerAuthToken(..)")
    }
}

#[derive(Debug)]
pub struct InvalidHexId;

impl Display for InvalidHexId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("invalid hex id")
    }
}

impl std::error::Error for InvalidHexId {}

fn parse_fixed_hex(s: &str, len: usize) -> Result<u128, InvalidHexId> {
    if s.len() != len || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(InvalidHexId);
    }
    u128::from_str_radix(s, 16).map_err(|_| InvalidHexId)
}

macro_rules! hex_wire_impls {
    ($id:ident, $len:expr) => {
        impl Display for $id {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{:0width$x}", self.0, width = $len)
            }
        }

        impl FromStr for $id {
            type Err = InvalidHexId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_fixed_hex(s, $len).map(Self)
            }
        }

        impl Serialize for $id {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $id {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

hex_wire_impls!(GameServerId, 32);
hex_wire_impls!(SessionToken, 32);
hex_wire_impls!(JoinToken, 31);
hex_wire_impls!(ServerAuthToken, 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_id_round_trip() {
        let id: PlayerId = "1005930844007".parse().unwrap();
        assert_eq!(id, PlayerId(1005930844007));
        assert_eq!(id.to_string(), "1005930844007");
        assert!("x123".parse::<PlayerId>().is_err());
        assert!("-5".parse::<PlayerId>().is_err());
    }

    #[test]
    fn server_id_is_32_hex() {
        for _ in 0..64 {
            let id = GameServerId::generate();
            let s = id.to_string();
            assert_eq!(s.len(), 32);
            assert!(s.bytes().all(|b| b.is_ascii_hexdigit()));
            assert_eq!(s.parse::<GameServerId>().unwrap(), id);
        }
    }

    #[test]
    fn join_token_is_31_hex() {
        for _ in 0..64 {
            let token = JoinToken::generate();
            let s = token.to_string();
            assert_eq!(s.len(), JoinToken::LEN);
            assert_eq!(s.parse::<JoinToken>().unwrap(), token);
        }
    }

    #[test]
    fn zero_id_keeps_width() {
        assert_eq!(GameServerId(0).to_string(), "0".repeat(32));
        assert_eq!(JoinToken(0).to_string(), "0".repeat(31));
    }

    #[test]
    fn rejects_wrong_length_and_digits() {
        assert!("abc".parse::<SessionToken>().is_err());
        assert!("g".repeat(32).parse::<SessionToken>().is_err());
        assert!("a".repeat(33).parse::<SessionToken>().is_err());
        assert!("A0".repeat(16).parse::<SessionToken>().is_ok());
    }

    #[test]
    fn serde_as_string() {
        let id: GameServerId = "0123456789abcdef0123456789abcdef".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0123456789abcdef0123456789abcdef\"");
        let back: GameServerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn server_auth_token_debug_is_redacted() {
        let token = ServerAuthToken::generate();
        assert_eq!(format!("{:?}", token), "ServerAuthToken(..)");
    }
}
