// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Route table and cross-cutting HTTP behavior: request logging, panic
//! containment, and OPTIONS handling.

pub mod accounts;
pub mod client;
pub mod game_server;
pub mod player;
pub mod promos;
pub mod respond;

use crate::app::App;
use crate::status::{StatusDto, CAUGHT_PANICS};
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, on, post, MethodFilter};
use axum::Router;
use master_protocol::error::{ErrorCode, ErrorDto};
use respond::{is_head, options_response, resp_json};
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route(
            "/client/mainmenupromos",
            get(client::mainmenupromos).options(allow_get),
        )
        // No HEAD here: authentication is never a cache-revalidation target.
        .route(
            "/client/origin_auth",
            on(MethodFilter::GET, client::origin_auth).options(allow_get_only),
        )
        .route(
            "/client/auth_with_server",
            post(client::auth_with_server).options(allow_post),
        )
        .route(
            "/client/auth_with_self",
            post(client::auth_with_self).options(allow_post),
        )
        .route("/client/servers", get(client::servers).options(allow_get))
        .route(
            "/server/add_server",
            post(game_server::add_server).options(allow_post),
        )
        .route(
            "/server/update_values",
            post(game_server::update_values).options(allow_post),
        )
        .route(
            "/server/heartbeat",
            post(game_server::heartbeat).options(allow_post),
        )
        .route(
            "/server/remove_server",
            delete(game_server::remove_server).options(allow_delete),
        )
        .route("/server/connect", post(game_server::connect).options(allow_post))
        .route(
            "/accounts/write_persistence",
            post(accounts::write_persistence).options(allow_post),
        )
        .route(
            "/accounts/lookup_uid",
            get(accounts::lookup_uid).options(allow_get),
        )
        .route(
            "/accounts/get_username",
            get(accounts::get_username).options(allow_get),
        )
        .route("/player/pdata", get(player::pdata).options(allow_get))
        .route("/player/info", get(player::info).options(allow_get))
        .route("/player/stats", get(player::stats).options(allow_get))
        .route("/player/loadout", get(player::loadout).options(allow_get))
        .route("/status", get(status).options(allow_get))
        .layer(middleware::from_fn(log_requests))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(app)
}

async fn allow_get() -> Response {
    options_response("GET, HEAD, OPTIONS")
}

async fn allow_get_only() -> Response {
    options_response("GET, OPTIONS")
}

async fn allow_post() -> Response {
    options_response("POST, OPTIONS")
}

async fn allow_delete() -> Response {
    options_response("DELETE, OPTIONS")
}

async fn status(State(app): State<Arc<App>>, method: Method) -> Response {
    let (alive_servers, pending_servers) = app.registry.counts();
    let status = StatusDto {
        uptime_secs: app.started.elapsed().as_secs(),
        alive_servers,
        pending_servers,
        dropped_datagrams: app.udp.dropped_datagrams(),
        caught_panics: CAUGHT_PANICS.load(Ordering::Relaxed),
        metrics: app.metrics.summarize(),
    };
    resp_json(StatusCode::OK, &status, is_head(&method))
}

static NEXT_REQUEST_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

async fn log_requests<B>(request: Request<B>, next: Next<B>) -> Response {
    let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let response = next.run(request).await;
    log::debug!("request {}: {} {} -> {}", id, method, path, response.status());
    response
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> axum::http::Response<axum::body::Full<axum::body::Bytes>> {
    CAUGHT_PANICS.fetch_add(1, Ordering::Relaxed);
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("opaque panic payload");
    log::error!("handler panicked: {}", detail);

    let body = serde_json::to_vec(&ErrorDto::new(
        ErrorCode::InternalServerError,
        ErrorCode::InternalServerError.default_message(),
    ))
    .unwrap_or_else(|_| b"{}".to_vec());
    axum::http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(axum::http::header::CONTENT_TYPE, respond::CONTENT_TYPE_JSON)
        .body(axum::body::Full::from(body))
        .expect("static response parts are valid")
}
