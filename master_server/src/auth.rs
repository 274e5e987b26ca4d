// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The player authentication pipeline: upstream entitlement, identity
//! resolution, session minting, and the hand-off that introduces a player to
//! the game server they picked.

use crate::account::{Account, AccountStore, SELF_SERVER_ID};
use crate::entitlement::{EntitlementError, EntitlementVerifier};
use crate::identity::IdentityResolver;
use crate::pdata::{default_pdata, PdataStore};
use crate::registry::{GameServer, ServerRegistry};
use crate::store::StoreError;
use crate::udp::UdpControl;
use crate::version::{version_allowed, LauncherVersion};
use master_protocol::error::ErrorCode;
use master_protocol::id::{GameServerId, JoinToken, PlayerId, SessionToken};
use master_protocol::get_unix_time_now;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Overall budget for either hand-off mode.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);
/// Cadence of sigreq1 resends within the hand-off budget.
const SIGREQ1_RESEND: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Session token lifetime.
    pub token_expiry: Duration,
    pub minimum_launcher_version: Option<LauncherVersion>,
    /// Dev escape hatch: skips entitlement and session-token validation.
    pub insecure_no_check_player_auth: bool,
    /// Overridable for tests; the protocol value is [`HANDOFF_TIMEOUT`].
    pub handoff_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expiry: Duration::from_secs(24 * 3600),
            minimum_launcher_version: None,
            insecure_no_check_player_auth: false,
            handoff_timeout: HANDOFF_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("launcher version is no longer supported")]
    UnsupportedVersion,
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
    #[error("no account for that uid")]
    PlayerNotFound,
    #[error("masterserver token missing, expired, or mismatched")]
    InvalidMasterServerToken,
    #[error("wrong password or unknown server")]
    UnauthorizedPwd,
    #[error("game server did not respond to the hand-off")]
    NoGameServerResponse,
    #[error("game server hand-off response was malformed")]
    BadGameServerResponse,
    /// The game server processed the hand-off and said no without a reason.
    #[error("game server did not accept the player")]
    GameServerAuthFailed,
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl AuthError {
    /// The wire code each variant renders as. `GameServerAuthFailed` maps to
    /// `JSON_PARSE_ERROR` for historical reasons; launchers match on it.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedVersion => ErrorCode::UnsupportedVersion,
            Self::Entitlement(e) => match e {
                EntitlementError::Upstream(_) | EntitlementError::UpstreamParse(_) => {
                    ErrorCode::InternalServerError
                }
                _ => ErrorCode::UnauthorizedGame,
            },
            Self::PlayerNotFound => ErrorCode::PlayerNotFound,
            Self::InvalidMasterServerToken => ErrorCode::InvalidMasterServerToken,
            Self::UnauthorizedPwd => ErrorCode::UnauthorizedPwd,
            Self::NoGameServerResponse => ErrorCode::NoGameServerResponse,
            Self::BadGameServerResponse => ErrorCode::BadGameServerResponse,
            Self::GameServerAuthFailed => ErrorCode::JsonParseError,
            Self::ConnectionRejected(_) => ErrorCode::ConnectionRejected,
            Self::Storage(_) => ErrorCode::InternalServerError,
        }
    }
}

/// What a successful `join` hands back to the client.
#[derive(Clone, Debug)]
pub struct JoinGrant {
    pub game_addr: SocketAddr,
    pub join_token: JoinToken,
}

/// Result of a game server depositing its hand-off verdict.
pub enum ConnectDeposit {
    /// Player accepted; here is the pdata the server asked for.
    Accepted(Arc<Vec<u8>>),
    Rejected,
    /// No hand-off in flight for that `(server, token)` pair.
    NoPending,
}

/// In-flight UDP hand-off, keyed by `(server_id, join_token)`.
struct PendingConnect {
    /// `None` deposited = accepted; `Some(reason)` = rejected.
    reply: oneshot::Sender<Option<String>>,
    pdata: Arc<Vec<u8>>,
}

/// `{"success": bool, "reject": string?}` from the game server's auth
/// listener.
#[derive(Deserialize)]
struct GameServerAuthResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    reject: String,
}

pub struct AuthPipeline {
    accounts: Arc<dyn AccountStore>,
    pdata: Arc<dyn PdataStore>,
    registry: Arc<ServerRegistry>,
    identity: IdentityResolver,
    entitlement: EntitlementVerifier,
    udp: Arc<UdpControl>,
    http: reqwest::Client,
    config: AuthConfig,
    connects: Mutex<HashMap<(GameServerId, JoinToken), PendingConnect>>,
}

impl AuthPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        pdata: Arc<dyn PdataStore>,
        registry: Arc<ServerRegistry>,
        identity: IdentityResolver,
        entitlement: EntitlementVerifier,
        udp: Arc<UdpControl>,
        http: reqwest::Client,
        config: AuthConfig,
    ) -> Self {
        Self {
            accounts,
            pdata,
            registry,
            identity,
            entitlement,
            udp,
            http,
            config,
            connects: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the player's upstream entitlement and mints a session
    /// token. Any prior session token for the uid stops being valid; one
    /// live session per player.
    pub async fn authenticate(
        &self,
        uid: PlayerId,
        entitlement_token: &str,
        remote_ip: IpAddr,
        user_agent: Option<&str>,
    ) -> Result<SessionToken, AuthError> {
        if !version_allowed(self.config.minimum_launcher_version, user_agent) {
            return Err(AuthError::UnsupportedVersion);
        }
        if !self.config.insecure_no_check_player_auth {
            self.entitlement.verify(uid, entitlement_token).await?;
        }

        let username = self.identity.lookup(uid).await;

        let mut account = match self.accounts.get(uid).await? {
            Some(account) => account,
            None => Account::new(uid),
        };
        if !username.is_empty() && account.username != username {
            if !account.username.is_empty() {
                log::info!(
                    "uid {} changed username from {:?} to {:?}",
                    uid,
                    account.username,
                    username
                );
            }
            account.username = username;
        }

        let session = SessionToken::generate();
        account.auth_token = Some(session);
        account.auth_token_expiry =
            get_unix_time_now() + self.config.token_expiry.as_millis() as u64;
        account.auth_ip = Some(remote_ip);
        self.accounts.save(account).await?;
        Ok(session)
    }

    /// Hands the player to a chosen game server: validates the session,
    /// mints a join token, delivers the pdata, and reports the grant.
    pub async fn join(
        &self,
        uid: PlayerId,
        session: &str,
        server_id: GameServerId,
        password: &str,
        remote_ip: IpAddr,
        user_agent: Option<&str>,
    ) -> Result<JoinGrant, AuthError> {
        if !version_allowed(self.config.minimum_launcher_version, user_agent) {
            return Err(AuthError::UnsupportedVersion);
        }
        // Unknown id and wrong password are deliberately the same error;
        // password probing must not double as server enumeration.
        let server = self
            .registry
            .get_by_id(server_id)
            .ok_or(AuthError::UnauthorizedPwd)?;
        if server.password != password {
            return Err(AuthError::UnauthorizedPwd);
        }

        let mut account = self
            .accounts
            .get(uid)
            .await?
            .ok_or(AuthError::PlayerNotFound)?;
        self.check_session(&account, session)?;

        let join_token = JoinToken::generate();
        let pdata = match self.pdata.get(uid).await? {
            Some(bytes) => bytes,
            None => default_pdata().to_vec(),
        };

        if server.has_auth_listener() {
            self.handoff_http(&server, uid, &account.username, join_token, &pdata)
                .await?;
        } else {
            self.handoff_udp(&server, uid, &account.username, join_token, pdata, remote_ip)
                .await?;
        }

        account.last_server_id = server_id.to_string();
        self.accounts.save(account).await?;
        Ok(JoinGrant {
            game_addr: server.game_addr,
            join_token,
        })
    }

    /// The self-hosted variant: no hand-off, the client is its own server.
    /// Returns the pdata (or the default blob) and a fresh token.
    pub async fn join_self(
        &self,
        uid: PlayerId,
        session: &str,
        user_agent: Option<&str>,
    ) -> Result<(Vec<u8>, JoinToken), AuthError> {
        if !version_allowed(self.config.minimum_launcher_version, user_agent) {
            return Err(AuthError::UnsupportedVersion);
        }
        let mut account = self
            .accounts
            .get(uid)
            .await?
            .ok_or(AuthError::PlayerNotFound)?;
        self.check_session(&account, session)?;
        let pdata = match self.pdata.get(uid).await? {
            Some(bytes) => bytes,
            None => default_pdata().to_vec(),
        };
        account.last_server_id = SELF_SERVER_ID.to_owned();
        self.accounts.save(account).await?;
        Ok((pdata, JoinToken::generate()))
    }

    /// Session validation: the raw token must parse and match the account's
    /// single live token. Skipped wholesale in insecure dev mode.
    fn check_session(&self, account: &Account, session: &str) -> Result<(), AuthError> {
        if self.config.insecure_no_check_player_auth {
            return Ok(());
        }
        let session: SessionToken = session
            .parse()
            .map_err(|_| AuthError::InvalidMasterServerToken)?;
        if !account.token_valid(session, get_unix_time_now()) {
            return Err(AuthError::InvalidMasterServerToken);
        }
        Ok(())
    }

    /// A game server depositing the verdict of a UDP hand-off, correlated
    /// by `(server, token)`. Removes the in-flight context either way.
    pub fn deposit_connect_reply(
        &self,
        server_id: GameServerId,
        token: JoinToken,
        reject: Option<String>,
    ) -> ConnectDeposit {
        let pending = self.connects.lock().unwrap().remove(&(server_id, token));
        match pending {
            None => ConnectDeposit::NoPending,
            Some(pending) => {
                let accepted = reject.is_none();
                let pdata = Arc::clone(&pending.pdata);
                // The waiter may have timed out a moment ago; nothing to do.
                let _ = pending.reply.send(reject);
                if accepted {
                    ConnectDeposit::Accepted(pdata)
                } else {
                    ConnectDeposit::Rejected
                }
            }
        }
    }

    async fn handoff_http(
        &self,
        server: &GameServer,
        uid: PlayerId,
        username: &str,
        join_token: JoinToken,
        pdata: &[u8],
    ) -> Result<(), AuthError> {
        let url = format!("http://{}/authenticate_incoming_player", server.auth_addr());
        let response = self
            .http
            .post(&url)
            .query(&[
                ("id", uid.to_string()),
                ("authToken", join_token.to_string()),
                ("serverAuthToken", server.server_auth_token.to_string()),
                ("username", username.to_owned()),
            ])
            .body(pdata.to_vec())
            .timeout(self.config.handoff_timeout)
            .send()
            .await
            .map_err(|e| {
                log::debug!("hand-off to {} failed: {}", server.auth_addr(), e);
                AuthError::NoGameServerResponse
            })?;
        let verdict: GameServerAuthResponse = response
            .json()
            .await
            .map_err(|_| AuthError::BadGameServerResponse)?;
        if !verdict.reject.is_empty() {
            return Err(AuthError::ConnectionRejected(verdict.reject));
        }
        if !verdict.success {
            return Err(AuthError::GameServerAuthFailed);
        }
        Ok(())
    }

    async fn handoff_udp(
        &self,
        server: &GameServer,
        uid: PlayerId,
        username: &str,
        join_token: JoinToken,
        pdata: Vec<u8>,
        remote_ip: IpAddr,
    ) -> Result<(), AuthError> {
        let key = (server.id, join_token);
        let (tx, mut rx) = oneshot::channel();
        self.connects.lock().unwrap().insert(
            key,
            PendingConnect {
                reply: tx,
                pdata: Arc::new(pdata),
            },
        );
        // Whatever path exits this function, the context must not linger.
        let _cleanup = ConnectCleanup {
            pipeline: self,
            key,
        };

        let body = serde_json::to_vec(&serde_json::json!({
            "type": "connect",
            "token": join_token.to_string(),
            "uid": uid.0,
            "username": username,
            "ip": remote_ip.to_string(),
            "time": get_unix_time_now() / 1000,
        }))
        .expect("connect body serialization is infallible");

        let target = server.auth_addr();
        let deadline = tokio::time::Instant::now() + self.config.handoff_timeout;
        let mut resend = tokio::time::interval(SIGREQ1_RESEND);
        resend.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                verdict = &mut rx => {
                    return match verdict {
                        Ok(None) => Ok(()),
                        Ok(Some(reason)) => Err(AuthError::ConnectionRejected(reason)),
                        // Sender dropped without a deposit; treat like silence.
                        Err(_) => Err(AuthError::NoGameServerResponse),
                    };
                }
                // First tick fires immediately, then every 250 ms; each send
                // seals with a fresh nonce.
                _ = resend.tick() => {
                    if let Err(e) = self
                        .udp
                        .send_sigreq1(target, &server.server_auth_token, &body)
                        .await
                    {
                        log::warn!("sigreq1 to {} failed: {}", target, e);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(AuthError::NoGameServerResponse);
                }
            }
        }
    }
}

struct ConnectCleanup<'a> {
    pipeline: &'a AuthPipeline,
    key: (GameServerId, JoinToken),
}

impl Drop for ConnectCleanup<'_> {
    fn drop(&mut self) {
        self.pipeline.connects.lock().unwrap().remove(&self.key);
    }
}
