// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Wire-level error codes. Game clients and launchers match on the exact
/// strings, so the names here are frozen.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "NO_GAMESERVER_RESPONSE")]
    NoGameServerResponse,
    #[serde(rename = "BAD_GAMESERVER_RESPONSE")]
    BadGameServerResponse,
    #[serde(rename = "UNAUTHORIZED_GAMESERVER")]
    UnauthorizedGameServer,
    #[serde(rename = "UNAUTHORIZED_GAME")]
    UnauthorizedGame,
    #[serde(rename = "UNAUTHORIZED_PWD")]
    UnauthorizedPwd,
    #[serde(rename = "PLAYER_NOT_FOUND")]
    PlayerNotFound,
    #[serde(rename = "INVALID_MASTERSERVER_TOKEN")]
    InvalidMasterServerToken,
    #[serde(rename = "JSON_PARSE_ERROR")]
    JsonParseError,
    #[serde(rename = "UNSUPPORTED_VERSION")]
    UnsupportedVersion,
    #[serde(rename = "DUPLICATE_SERVER")]
    DuplicateServer,
    #[serde(rename = "CONNECTION_REJECTED")]
    ConnectionRejected,
    #[serde(rename = "INTERNAL_SERVER_ERROR")]
    InternalServerError,
    #[serde(rename = "BAD_REQUEST")]
    BadRequest,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoGameServerResponse => "NO_GAMESERVER_RESPONSE",
            Self::BadGameServerResponse => "BAD_GAMESERVER_RESPONSE",
            Self::UnauthorizedGameServer => "UNAUTHORIZED_GAMESERVER",
            Self::UnauthorizedGame => "UNAUTHORIZED_GAME",
            Self::UnauthorizedPwd => "UNAUTHORIZED_PWD",
            Self::PlayerNotFound => "PLAYER_NOT_FOUND",
            Self::InvalidMasterServerToken => "INVALID_MASTERSERVER_TOKEN",
            Self::JsonParseError => "JSON_PARSE_ERROR",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::DuplicateServer => "DUPLICATE_SERVER",
            Self::ConnectionRejected => "CONNECTION_REJECTED",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::BadRequest => "BAD_REQUEST",
        }
    }

    /// The HTTP status the code renders with when no more specific status
    /// applies.
    pub fn http_status(self) -> u16 {
        match self {
            Self::NoGameServerResponse => 504,
            Self::BadGameServerResponse => 502,
            Self::UnauthorizedGameServer => 403,
            Self::UnauthorizedGame => 403,
            Self::UnauthorizedPwd => 401,
            Self::PlayerNotFound => 404,
            Self::InvalidMasterServerToken => 401,
            Self::JsonParseError => 500,
            Self::UnsupportedVersion => 400,
            Self::DuplicateServer => 409,
            Self::ConnectionRejected => 403,
            Self::InternalServerError => 500,
            Self::BadRequest => 400,
        }
    }

    /// Human-readable default message, sent when the handler has nothing
    /// more specific to say.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NoGameServerResponse => "game server did not respond",
            Self::BadGameServerResponse => "game server responded incorrectly",
            Self::UnauthorizedGameServer => "game server is not authorized to make that request",
            Self::UnauthorizedGame => "game not authorized on upstream account",
            Self::UnauthorizedPwd => "wrong server password",
            Self::PlayerNotFound => "no such player",
            Self::InvalidMasterServerToken => "invalid or expired masterserver token",
            Self::JsonParseError => "error parsing json response",
            Self::UnsupportedVersion => "launcher version is no longer supported",
            Self::DuplicateServer => "a server already exists at that address",
            Self::ConnectionRejected => "connection rejected by game server",
            Self::InternalServerError => "internal server error",
            Self::BadRequest => "bad request",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body shape shared by every endpoint:
/// `{"success": false, "error": CODE, "msg": "..."}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDto {
    pub success: bool,
    pub error: ErrorCode,
    pub msg: String,
}

impl ErrorDto {
    pub fn new(error: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error,
            msg: msg.into(),
        }
    }
}
