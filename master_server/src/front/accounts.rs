// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Account directory lookups and the persistence upload game servers (and
//! self-hosting clients) push profile blobs through.

use crate::account::{Account, SELF_SERVER_ID};
use crate::app::App;
use crate::front::client::parse_uid;
use crate::front::respond::{is_head, resp_json, ApiError};
use crate::pdata::MAX_PDATA_LEN;
use axum::extract::{ConnectInfo, Multipart, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use master_protocol::dto::{GetUsernameDto, LookupUidDto};
use master_protocol::error::ErrorCode;
use master_protocol::id::GameServerId;
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct WritePersistenceQuery {
    #[serde(default)]
    id: String,
    #[serde(rename = "serverId", default)]
    server_id: String,
}

pub async fn write_persistence(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WritePersistenceQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    // Refuse oversized uploads before buffering; the multipart envelope adds
    // a little on top of the blob cap.
    server_util::http::check_content_length(&headers, MAX_PDATA_LEN + 16 * 1024)
        .map_err(|_| ApiError::bad_request("pdata upload too large"))?;

    let uid = parse_uid(&query.id)?;
    let account = app
        .accounts
        .get(uid)
        .await?
        .ok_or_else(|| ApiError::code(ErrorCode::PlayerNotFound))?;
    authorize_writer(&app, &account, &query.server_id, addr.ip())?;

    let mut blob = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("malformed multipart body"))?
    {
        if field.name() == Some("pdata") {
            let bytes = field
                .bytes()
                .await
                .map_err(|_| ApiError::bad_request("malformed multipart body"))?;
            if bytes.len() > MAX_PDATA_LEN {
                return Err(ApiError::bad_request("pdata exceeds the 2 MiB cap"));
            }
            blob = Some(bytes);
            break;
        }
    }
    let blob = blob.ok_or_else(|| ApiError::bad_request("missing pdata field"))?;

    let stored = app.pdata.set(uid, &blob).await?;
    app.metrics.push_pdata_upload(blob.len());
    log::debug!(
        "stored {} byte(s) of pdata for {} ({} on disk)",
        blob.len(),
        uid,
        stored
    );
    Ok(resp_json(StatusCode::OK, &json!({ "success": true }), false))
}

/// The strict source check: a self-hosted session may only be written by the
/// IP the session was authenticated from; a server-side session only by the
/// registered game server the account is on.
fn authorize_writer(
    app: &App,
    account: &Account,
    server_id_param: &str,
    source: IpAddr,
) -> Result<(), ApiError> {
    let refused = || ApiError::code(ErrorCode::UnauthorizedGameServer);

    if account.last_server_id == SELF_SERVER_ID {
        if account.auth_ip != Some(source) {
            return Err(refused());
        }
        return Ok(());
    }

    let server_id: GameServerId = server_id_param.parse().map_err(|_| refused())?;
    if server_id.to_string() != account.last_server_id {
        return Err(refused());
    }
    let server = app.registry.get_by_id(server_id).ok_or_else(refused)?;
    if server.game_addr.ip() != source {
        return Err(refused());
    }
    Ok(())
}

#[derive(Deserialize)]
pub struct LookupUidQuery {
    #[serde(default)]
    username: String,
}

pub async fn lookup_uid(
    State(app): State<Arc<App>>,
    method: Method,
    Query(query): Query<LookupUidQuery>,
) -> Result<Response, ApiError> {
    let matches = app.accounts.get_uids_by_username(&query.username).await?;
    Ok(resp_json(
        StatusCode::OK,
        &LookupUidDto {
            success: true,
            username: query.username,
            matches,
        },
        is_head(&method),
    ))
}

#[derive(Deserialize)]
pub struct GetUsernameQuery {
    #[serde(default)]
    uid: String,
}

pub async fn get_username(
    State(app): State<Arc<App>>,
    method: Method,
    Query(query): Query<GetUsernameQuery>,
) -> Result<Response, ApiError> {
    let uid = parse_uid(&query.uid)?;
    let account = app
        .accounts
        .get(uid)
        .await?
        .ok_or_else(|| ApiError::code(ErrorCode::PlayerNotFound))?;
    let matches = if account.username.is_empty() {
        Vec::new()
    } else {
        vec![account.username]
    };
    Ok(resp_json(
        StatusCode::OK,
        &GetUsernameDto {
            success: true,
            uid,
            matches,
        },
        is_head(&method),
    ))
}
