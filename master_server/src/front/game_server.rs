// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Routes game servers call: registration, value updates, heartbeats,
//! removal, and the UDP hand-off callback. Registration, updates, and
//! heartbeats are one dispatch into the registry's hybrid entry point.

use crate::app::App;
use crate::auth::ConnectDeposit;
use crate::front::respond::{resp_json, ApiError};
use crate::registry::{GameServer, NewGameServer, ServerUpdate};
use axum::body::{boxed, Full};
use axum::extract::{ConnectInfo, Multipart, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use master_protocol::dto::{AddServerDto, ModInfoDto};
use master_protocol::error::ErrorCode;
use master_protocol::id::{GameServerId, JoinToken};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::Arc;

/// Exact body a game server's auth listener must return from `/verify`.
const VERIFY_RESPONSE: &str = "I am a northstar server!";
const MAX_MODINFO_LEN: usize = 256 * 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PutMode {
    Create,
    Update,
    Heartbeat,
}

#[derive(Deserialize)]
pub struct PutServerQuery {
    #[serde(default)]
    id: String,
    port: Option<u16>,
    #[serde(rename = "authPort", default)]
    auth_port: Option<u16>,
    name: Option<String>,
    description: Option<String>,
    map: Option<String>,
    playlist: Option<String>,
    #[serde(rename = "playerCount", default)]
    player_count: Option<u32>,
    #[serde(rename = "maxPlayers", default)]
    max_players: Option<u32>,
    password: Option<String>,
}

pub async fn add_server(
    state: State<Arc<App>>,
    source: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Query<PutServerQuery>,
    multipart: Option<Multipart>,
) -> Result<Response, ApiError> {
    put_server(state, source, headers, query, multipart, PutMode::Create).await
}

pub async fn update_values(
    state: State<Arc<App>>,
    source: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Query<PutServerQuery>,
    multipart: Option<Multipart>,
) -> Result<Response, ApiError> {
    put_server(state, source, headers, query, multipart, PutMode::Update).await
}

pub async fn heartbeat(
    state: State<Arc<App>>,
    source: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Query<PutServerQuery>,
    multipart: Option<Multipart>,
) -> Result<Response, ApiError> {
    put_server(state, source, headers, query, multipart, PutMode::Heartbeat).await
}

async fn put_server(
    State(app): State<Arc<App>>,
    ConnectInfo(source): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<PutServerQuery>,
    multipart: Option<Multipart>,
    mode: PutMode,
) -> Result<Response, ApiError> {
    server_util::http::check_content_length(&headers, MAX_MODINFO_LEN + 16 * 1024)
        .map_err(|_| ApiError::bad_request("request body too large"))?;
    let mod_info = read_mod_info(multipart).await?;

    let update = match mode {
        PutMode::Create => None,
        PutMode::Update | PutMode::Heartbeat => {
            if query.id.is_empty() {
                return Err(ApiError::bad_request("id is required"));
            }
            let id: GameServerId = query
                .id
                .parse()
                .map_err(|_| ApiError::bad_request("malformed server id"))?;
            Some(ServerUpdate {
                id,
                // Updates must come from the address the server registered
                // with; anything else is treated as a server we don't know.
                expect_ip: Some(source.ip()),
                heartbeat: mode == PutMode::Heartbeat,
                name: query.name.clone(),
                description: query.description.clone(),
                map: query.map.clone(),
                playlist: query.playlist.clone(),
                player_count: query.player_count,
                max_players: query.max_players,
                password: query.password.clone(),
                mod_info: mod_info.clone(),
            })
        }
    };

    // Registration input, doubling as the re-register fallback for updates
    // whose id the registry no longer recognizes.
    let new = query.port.map(|port| NewGameServer {
        game_addr: SocketAddr::new(source.ip(), port),
        auth_port: query.auth_port.and_then(NonZeroU16::new),
        name: query.name.clone().unwrap_or_default(),
        description: query.description.clone().unwrap_or_default(),
        map: query.map.clone().unwrap_or_default(),
        playlist: query.playlist.clone().unwrap_or_default(),
        password: query.password.clone().unwrap_or_default(),
        player_count: query.player_count.unwrap_or(0),
        max_players: query.max_players.unwrap_or(0),
        mod_info: mod_info.unwrap_or_default(),
    });
    if mode == PutMode::Create && new.is_none() {
        return Err(ApiError::bad_request("port is required to register"));
    }

    let server = app
        .registry
        .hybrid_update_put(update.as_ref(), new, &app.limits)?;

    if !server.verified {
        // A fresh registration is only listed once it proves reachable.
        let verified = verify_server(&app, &server).await;
        app.metrics.push_registration(verified.is_ok());
        if let Err(e) = verified {
            app.registry.remove_pending(server.id);
            log::info!(
                "server at {} failed verification: {} ({})",
                server.game_addr,
                e.msg,
                e.code
            );
            return Err(e);
        }
        return Ok(resp_json(
            StatusCode::OK,
            &AddServerDto {
                success: true,
                id: server.id,
                server_auth_token: server.server_auth_token,
            },
            false,
        ));
    }
    Ok(resp_json(StatusCode::OK, &json!({ "success": true }), false))
}

async fn read_mod_info(multipart: Option<Multipart>) -> Result<Option<ModInfoDto>, ApiError> {
    let mut multipart = match multipart {
        Some(multipart) => multipart,
        None => return Ok(None),
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("malformed multipart body"))?
    {
        if field.name() != Some("modinfo") {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|_| ApiError::bad_request("malformed multipart body"))?;
        if bytes.len() > MAX_MODINFO_LEN {
            return Err(ApiError::bad_request("modinfo exceeds 256 KiB"));
        }
        let info: ModInfoDto = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::bad_request(format!("modinfo is not valid json: {}", e)))?;
        return Ok(Some(info));
    }
    Ok(None)
}

/// The two-step reachability proof for a pending registration: the HTTP
/// `/verify` exchange (when the server has an auth listener) and the
/// encrypted game-port probe. Promotes to alive on success.
async fn verify_server(app: &App, server: &GameServer) -> Result<(), ApiError> {
    if server.has_auth_listener() {
        let url = format!("http://{}/verify", server.auth_addr());
        let response = app
            .http
            .get(&url)
            .timeout(app.verify_time)
            .send()
            .await
            .map_err(|e| {
                log::debug!("verify request to {} failed: {}", server.auth_addr(), e);
                ApiError::new(
                    ErrorCode::NoGameServerResponse,
                    "auth listener did not answer /verify",
                )
            })?;
        let text = response.text().await.map_err(|_| {
            ApiError::new(ErrorCode::BadGameServerResponse, "unreadable verify response")
        })?;
        if text.trim() != VERIFY_RESPONSE {
            return Err(ApiError::new(
                ErrorCode::BadGameServerResponse,
                "unexpected verify response",
            ));
        }
    }

    app.udp
        .probe(server.game_addr, app.verify_time)
        .await
        .map_err(|_| {
            ApiError::new(
                ErrorCode::NoGameServerResponse,
                "game port did not answer the probe",
            )
        })?;

    if !app.registry.verify(server.id) {
        // Replaced while we were probing; the newer registration wins.
        return Err(ApiError::bad_request("server re-registered during verification"));
    }
    Ok(())
}

#[derive(Deserialize)]
pub struct RemoveServerQuery {
    #[serde(default)]
    id: String,
}

pub async fn remove_server(
    State(app): State<Arc<App>>,
    ConnectInfo(source): ConnectInfo<SocketAddr>,
    Query(query): Query<RemoveServerQuery>,
) -> Result<Response, ApiError> {
    let id: GameServerId = query
        .id
        .parse()
        .map_err(|_| ApiError::bad_request("malformed server id"))?;
    let server = app
        .registry
        .get_by_id(id)
        .ok_or_else(|| ApiError::bad_request("no such game server"))?;
    if server.game_addr.ip() != source.ip() {
        return Err(ApiError::code(ErrorCode::UnauthorizedGameServer));
    }
    app.registry.delete_by_id(id);
    Ok(resp_json(StatusCode::OK, &json!({ "success": true }), false))
}

#[derive(Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "serverId", default)]
    server_id: String,
    #[serde(default)]
    token: String,
    reject: Option<String>,
}

/// A game server answering a UDP hand-off: deposits the verdict and, on
/// acceptance, receives the joining player's pdata as the response body.
pub async fn connect(
    State(app): State<Arc<App>>,
    ConnectInfo(source): ConnectInfo<SocketAddr>,
    Query(query): Query<ConnectQuery>,
) -> Result<Response, ApiError> {
    let server_id: GameServerId = query
        .server_id
        .parse()
        .map_err(|_| ApiError::bad_request("malformed server id"))?;
    let token: JoinToken = query
        .token
        .parse()
        .map_err(|_| ApiError::bad_request("malformed token"))?;

    // When the registry still knows the server, the deposit must come from
    // its registered address.
    if let Some(server) = app.registry.get_by_id(server_id) {
        if server.game_addr.ip() != source.ip() {
            return Err(ApiError::code(ErrorCode::UnauthorizedGameServer));
        }
    }

    let reject = query.reject.filter(|reason| !reason.is_empty());
    let deposit = app.pipeline.deposit_connect_reply(server_id, token, reject);
    if !matches!(deposit, ConnectDeposit::NoPending) {
        app.metrics.push_connect_deposit();
    }
    match deposit {
        ConnectDeposit::Accepted(pdata) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, pdata.len())
            .body(boxed(Full::from((*pdata).clone())))
            .expect("static response parts are valid")),
        ConnectDeposit::Rejected => {
            Ok(resp_json(StatusCode::OK, &json!({ "success": true }), false))
        }
        ConnectDeposit::NoPending => {
            Err(ApiError::bad_request("no pending connection for that token"))
        }
    }
}
