// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Public, cacheable read projections over player profile blobs. Third-party
//! stat sites poll these, hence the weak ETags and the CDN-friendly cache
//! headers.

use crate::app::App;
use crate::front::client::parse_uid;
use crate::front::respond::{is_head, ApiError, CONTENT_TYPE_JSON};
use crate::pdata::project_fields;
use axum::body::{boxed, Empty, Full};
use axum::extract::{Query, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    ETAG, IF_NONE_MATCH,
};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use master_protocol::error::ErrorCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const PDATA_CACHE_CONTROL: &str = "public, max-age=30, stale-while-revalidate=15";

/// Top-level fields exposed by `/player/info`.
const INFO_FIELDS: &[&str] = &[
    "name",
    "gen",
    "xp",
    "credits",
    "netWorth",
    "activeCallingCardIndex",
    "activeCallsignIconIndex",
    "activeCallsignIconStyleIndex",
];

/// Top-level fields exposed by `/player/stats`.
const STATS_FIELDS: &[&str] = &[
    "gamesPlayed",
    "gamesWon",
    "gamesLost",
    "hoursPlayed",
    "kills",
    "deaths",
    "pilotKills",
    "titanKills",
    "gameStats",
    "mapStats",
    "weaponStats",
];

/// Top-level fields exposed by `/player/loadout`.
const LOADOUT_FIELDS: &[&str] = &[
    "activePilotLoadout",
    "activeTitanLoadout",
    "pilotLoadouts",
    "titanLoadouts",
];

#[derive(Deserialize)]
pub struct PlayerQuery {
    #[serde(default)]
    id: String,
}

pub async fn pdata(
    state: State<Arc<App>>,
    method: Method,
    headers: HeaderMap,
    query: Query<PlayerQuery>,
) -> Result<Response, ApiError> {
    projection(state, method, headers, query, None).await
}

pub async fn info(
    state: State<Arc<App>>,
    method: Method,
    headers: HeaderMap,
    query: Query<PlayerQuery>,
) -> Result<Response, ApiError> {
    projection(state, method, headers, query, Some(INFO_FIELDS)).await
}

pub async fn stats(
    state: State<Arc<App>>,
    method: Method,
    headers: HeaderMap,
    query: Query<PlayerQuery>,
) -> Result<Response, ApiError> {
    projection(state, method, headers, query, Some(STATS_FIELDS)).await
}

pub async fn loadout(
    state: State<Arc<App>>,
    method: Method,
    headers: HeaderMap,
    query: Query<PlayerQuery>,
) -> Result<Response, ApiError> {
    projection(state, method, headers, query, Some(LOADOUT_FIELDS)).await
}

async fn projection(
    State(app): State<Arc<App>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<PlayerQuery>,
    whitelist: Option<&[&str]>,
) -> Result<Response, ApiError> {
    let uid = parse_uid(&query.id)?;
    let hash = app
        .pdata
        .get_hash(uid)
        .await?
        .ok_or_else(|| ApiError::code(ErrorCode::PlayerNotFound))?;
    let etag = format!("W/\"{}\"", hex::encode(hash));

    if client_has_revision(&headers, &etag) {
        return Ok(common_headers(
            Response::builder().status(StatusCode::NOT_MODIFIED),
            &etag,
        )
        .body(boxed(Empty::new()))
        .expect("static response parts are valid"));
    }

    let bytes = app
        .pdata
        .get(uid)
        .await?
        .ok_or_else(|| ApiError::code(ErrorCode::PlayerNotFound))?;
    let decoded = app.codec.decode(&bytes).map_err(|e| {
        log::error!("pdata for {} is not decodable: {}", uid, e);
        ApiError::code(ErrorCode::InternalServerError)
    })?;
    let value = match whitelist {
        Some(fields) => Value::Object(project_fields(&decoded, fields)),
        None => Value::Object(decoded),
    };
    let body = serde_json::to_vec(&value).map_err(|e| {
        log::error!("pdata projection for {} failed to serialize: {}", uid, e);
        ApiError::code(ErrorCode::InternalServerError)
    })?;

    let (body, gzipped) = server_util::http::negotiate_gzip(&headers, body);
    let mut builder = common_headers(Response::builder().status(StatusCode::OK), &etag)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .header(CONTENT_LENGTH, body.len());
    if gzipped {
        builder = builder.header(CONTENT_ENCODING, "gzip");
    }
    let body = if is_head(&method) {
        boxed(Empty::new())
    } else {
        boxed(Full::from(body))
    };
    Ok(builder.body(body).expect("static response parts are valid"))
}

fn common_headers(
    builder: axum::http::response::Builder,
    etag: &str,
) -> axum::http::response::Builder {
    builder
        .header(ETAG, etag)
        .header(CACHE_CONTROL, PDATA_CACHE_CONTROL)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
}

/// Weak comparison against If-None-Match: strength prefixes are ignored.
fn client_has_revision(headers: &HeaderMap, etag: &str) -> bool {
    let current = etag.strip_prefix("W/").unwrap_or(etag);
    headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value.split(',').any(|candidate| {
                let candidate = candidate.trim();
                candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == current
            })
        })
        .unwrap_or(false)
}
