// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Routes the game client calls: promos, authentication, joining, and the
//! server browser.

use crate::app::App;
use crate::front::respond::{is_head, no_store, resp_json, ApiError, CONTENT_TYPE_JSON};
use axum::body::{boxed, Empty, Full};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT,
};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use master_protocol::dto::{AuthWithSelfDto, AuthWithServerDto, OriginAuthDto};
use master_protocol::error::{ErrorCode, ErrorDto};
use master_protocol::id::{GameServerId, PlayerId};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

pub(crate) fn parse_uid(s: &str) -> Result<PlayerId, ApiError> {
    s.parse()
        .map_err(|_| ApiError::new(ErrorCode::PlayerNotFound, "uid is not a number"))
}

pub(crate) fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(USER_AGENT).and_then(|value| value.to_str().ok())
}

pub async fn mainmenupromos(State(app): State<Arc<App>>, method: Method) -> Response {
    let promos = app.promos.fetch().await;
    resp_json(StatusCode::OK, &promos, is_head(&method))
}

#[derive(Deserialize)]
pub struct OriginAuthQuery {
    #[serde(default)]
    id: String,
    #[serde(default)]
    token: String,
}

pub async fn origin_auth(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<OriginAuthQuery>,
) -> Result<Response, ApiError> {
    let ip = addr.ip();
    if app.auth_limiter.lock().unwrap().should_limit(ip) {
        log::debug!("rate limiting authentication from {}", ip);
        return Ok(no_store(resp_json(
            StatusCode::TOO_MANY_REQUESTS,
            &ErrorDto::new(ErrorCode::BadRequest, "too many authentication attempts"),
            false,
        )));
    }

    let uid = parse_uid(&query.id)?;
    let outcome = app
        .pipeline
        .authenticate(uid, &query.token, ip, user_agent(&headers))
        .await;
    app.metrics.push_authenticate(outcome.is_ok());
    let token = outcome?;
    Ok(no_store(resp_json(
        StatusCode::OK,
        &OriginAuthDto {
            success: true,
            token,
        },
        false,
    )))
}

#[derive(Deserialize)]
pub struct AuthWithServerQuery {
    #[serde(default)]
    id: String,
    #[serde(rename = "playerToken", default)]
    player_token: String,
    #[serde(default)]
    server: String,
    #[serde(default)]
    password: String,
}

pub async fn auth_with_server(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AuthWithServerQuery>,
) -> Result<Response, ApiError> {
    let uid = parse_uid(&query.id)?;
    // A malformed server id reads the same as an unknown one.
    let server_id: GameServerId = query
        .server
        .parse()
        .map_err(|_| ApiError::code(ErrorCode::UnauthorizedPwd))?;

    let attempted = std::time::Instant::now();
    let outcome = app
        .pipeline
        .join(
            uid,
            &query.player_token,
            server_id,
            &query.password,
            addr.ip(),
            user_agent(&headers),
        )
        .await;
    app.metrics.push_join(outcome.is_ok(), attempted.elapsed());
    let grant = outcome?;
    Ok(no_store(resp_json(
        StatusCode::OK,
        &AuthWithServerDto {
            success: true,
            ip: grant.game_addr.ip().to_string(),
            port: grant.game_addr.port(),
            auth_token: grant.join_token,
        },
        false,
    )))
}

#[derive(Deserialize)]
pub struct AuthWithSelfQuery {
    #[serde(default)]
    id: String,
    #[serde(rename = "playerToken", default)]
    player_token: String,
}

pub async fn auth_with_self(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<AuthWithSelfQuery>,
) -> Result<Response, ApiError> {
    let uid = parse_uid(&query.id)?;
    let (pdata, token) = app
        .pipeline
        .join_self(uid, &query.player_token, user_agent(&headers))
        .await?;
    Ok(no_store(resp_json(
        StatusCode::OK,
        &AuthWithSelfDto {
            success: true,
            id: uid.to_string(),
            persistent_data: pdata,
            auth_token: token,
        },
        false,
    )))
}

/// The server browser. Everything interesting happened ahead of time in the
/// registry's cache; this handler moves bytes.
pub async fn servers(State(app): State<Arc<App>>, method: Method, headers: HeaderMap) -> Response {
    let gzipped = server_util::http::accepts_gzip(&headers);
    let body: Vec<u8> = if gzipped {
        (*app.registry.server_list_gzip()).clone()
    } else {
        (*app.registry.server_list_json()).clone()
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(CONTENT_LENGTH, body.len());
    if gzipped {
        builder = builder.header(CONTENT_ENCODING, "gzip");
    }
    let body = if is_head(&method) {
        boxed(Empty::new())
    } else {
        boxed(Full::from(body))
    };
    builder.body(body).expect("static response parts are valid")
}
