//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the [`Controller`] for business
//! logic and only translate between JSON and its types.

use std::collections::HashMap;
use std::convert::Infallible;

use async_stream::stream;
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, MethodRouter};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::api::response::{api_success, api_success_with_status};
use crate::api::AppState;
use crate::error::HearthampError;
use crate::state::{
    AnnounceRequest, GroupUpdate, PresetCommand, PresetState, PresetUpdate, SourceUpdate, State as CoreState, StreamUpdate, ZoneUpdate,
};

/// Creates the Axum router with every route from the HTTP control surface,
/// plus permissive CORS and trailing-slash tolerance on the state root.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("api-key")]);

    Router::new()
        .route("/api", opt(get(get_state)))
        .route("/api/", opt(get(get_state)))
        .route("/api/sources", opt(get(list_sources)))
        .route("/api/sources/{id}", opt(get(get_source).patch(patch_source)))
        .route("/api/zones", opt(get(list_zones).patch(patch_zones_bulk)))
        .route("/api/zones/{id}", opt(get(get_zone).patch(patch_zone)))
        .route("/api/groups", opt(get(list_groups).post(create_group)))
        .route("/api/group", opt(post(create_group)))
        .route("/api/groups/{id}", opt(patch(patch_group).delete(delete_group)))
        .route("/api/streams", opt(get(list_streams).post(create_stream)))
        .route("/api/stream", opt(post(create_stream)))
        .route("/api/streams/{id}", opt(patch(patch_stream).delete(delete_stream)))
        .route("/api/streams/{id}/{cmd}", opt(post(send_stream_cmd)))
        .route("/api/presets", opt(get(list_presets).post(create_preset)))
        .route("/api/preset", opt(post(create_preset)))
        .route("/api/presets/{id}", opt(patch(patch_preset).delete(delete_preset)))
        .route("/api/presets/{id}/load", opt(post(load_preset)))
        .route("/api/announce", opt(post(announce)))
        .route("/api/info", opt(get(get_info)))
        .route("/api/factory_reset", opt(post(factory_reset)))
        .route("/api/load", opt(post(load_config)))
        .route("/api/subscribe", opt(get(subscribe)))
        .layer(cors)
        .with_state(state)
}

/// Adds a plain-204 `OPTIONS` responder to `router`. `CorsLayer` only
/// short-circuits true preflights (requests carrying
/// `Access-Control-Request-Method`); a bare `OPTIONS` with no preflight
/// headers falls through to the router and needs its own handler.
fn opt(router: MethodRouter<AppState>) -> MethodRouter<AppState> {
    router.options(|| async { StatusCode::NO_CONTENT })
}

fn err(e: HearthampError) -> Response {
    e.into_response()
}

// ---- whole state / info ------------------------------------------------

async fn get_state(State(state): State<AppState>) -> Response {
    api_success(state.controller.state().await).into_response()
}

async fn get_info(State(state): State<AppState>) -> Response {
    api_success(state.controller.get_info().await).into_response()
}

async fn factory_reset(State(state): State<AppState>) -> Response {
    match state.controller.factory_reset().await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

async fn load_config(State(state): State<AppState>, Json(incoming): Json<CoreState>) -> Response {
    match state.controller.load_config(incoming).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

// ---- sources ------------------------------------------------------------

async fn list_sources(State(state): State<AppState>) -> Response {
    api_success(json!({ "sources": state.controller.get_sources().await })).into_response()
}

async fn get_source(State(state): State<AppState>, Path(id): Path<u32>) -> Response {
    match state.controller.get_source(id).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

async fn patch_source(State(state): State<AppState>, Path(id): Path<u32>, Json(update): Json<SourceUpdate>) -> Response {
    match state.controller.set_source(id, update).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

// ---- zones ----------------------------------------------------------------

async fn list_zones(State(state): State<AppState>) -> Response {
    api_success(json!({ "zones": state.controller.get_zones().await })).into_response()
}

async fn get_zone(State(state): State<AppState>, Path(id): Path<u32>) -> Response {
    match state.controller.get_zone(id).await {
        Ok(z) => api_success(z).into_response(),
        Err(e) => err(e),
    }
}

async fn patch_zone(State(state): State<AppState>, Path(id): Path<u32>, Json(update): Json<ZoneUpdate>) -> Response {
    match state.controller.set_zone(id, update).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

#[derive(Debug, Deserialize)]
struct ZonesBulkPatch {
    zones: Vec<u32>,
    update: ZoneUpdate,
}

async fn patch_zones_bulk(State(state): State<AppState>, Json(body): Json<ZonesBulkPatch>) -> Response {
    match state.controller.set_zones(&body.zones, body.update).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

// ---- groups -----------------------------------------------------------

async fn list_groups(State(state): State<AppState>) -> Response {
    api_success(json!({ "groups": state.controller.get_groups().await })).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateGroupBody {
    name: String,
    #[serde(default)]
    zones: Vec<u32>,
}

async fn create_group(State(state): State<AppState>, Json(body): Json<CreateGroupBody>) -> Response {
    match state.controller.create_group(body.name, body.zones).await {
        Ok(s) => api_success_with_status(StatusCode::CREATED, s).into_response(),
        Err(e) => err(e),
    }
}

async fn patch_group(State(state): State<AppState>, Path(id): Path<u32>, Json(update): Json<GroupUpdate>) -> Response {
    match state.controller.set_group(id, update).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

async fn delete_group(State(state): State<AppState>, Path(id): Path<u32>) -> Response {
    match state.controller.delete_group(id).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

// ---- streams ------------------------------------------------------------

async fn list_streams(State(state): State<AppState>) -> Response {
    api_success(json!({ "streams": state.controller.get_streams().await })).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateStreamBody {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    config: HashMap<String, serde_json::Value>,
}

async fn create_stream(State(state): State<AppState>, Json(body): Json<CreateStreamBody>) -> Response {
    match state.controller.create_stream(body.name, body.kind, body.config).await {
        Ok(s) => api_success_with_status(StatusCode::CREATED, s).into_response(),
        Err(e) => err(e),
    }
}

async fn patch_stream(State(state): State<AppState>, Path(id): Path<u32>, Json(update): Json<StreamUpdate>) -> Response {
    match state.controller.set_stream(id, update).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

async fn delete_stream(State(state): State<AppState>, Path(id): Path<u32>) -> Response {
    match state.controller.delete_stream(id).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

async fn send_stream_cmd(State(state): State<AppState>, Path((id, cmd)): Path<(u32, String)>) -> Response {
    match state.controller.send_stream_cmd(id, &cmd).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

// ---- presets ------------------------------------------------------------

async fn list_presets(State(state): State<AppState>) -> Response {
    api_success(json!({ "presets": state.controller.get_presets().await })).into_response()
}

#[derive(Debug, Deserialize)]
struct CreatePresetBody {
    name: String,
    #[serde(default)]
    state: Option<PresetState>,
    #[serde(default)]
    commands: Option<Vec<PresetCommand>>,
}

async fn create_preset(State(state): State<AppState>, Json(body): Json<CreatePresetBody>) -> Response {
    match state.controller.create_preset(body.name, body.state, body.commands).await {
        Ok(s) => api_success_with_status(StatusCode::CREATED, s).into_response(),
        Err(e) => err(e),
    }
}

async fn patch_preset(State(state): State<AppState>, Path(id): Path<u32>, Json(update): Json<PresetUpdate>) -> Response {
    match state.controller.set_preset(id, update).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

async fn delete_preset(State(state): State<AppState>, Path(id): Path<u32>) -> Response {
    match state.controller.delete_preset(id).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

async fn load_preset(State(state): State<AppState>, Path(id): Path<u32>) -> Response {
    match state.controller.load_preset(id).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

// ---- announce -------------------------------------------------------------

async fn announce(State(state): State<AppState>, Json(req): Json<AnnounceRequest>) -> Response {
    match state.controller.announce(req).await {
        Ok(s) => api_success(s).into_response(),
        Err(e) => err(e),
    }
}

// ---- subscribe (SSE) -------------------------------------------------------

/// Live state updates over server-sent events. The first frame is the
/// current snapshot; one frame follows every committed mutation.
async fn subscribe(State(state): State<AppState>) -> Response {
    let (sub_id, mut rx) = state.event_bus.subscribe();
    let event_bus = state.event_bus.clone();
    let initial = state.controller.state().await;

    let events = stream! {
        yield Ok::<_, Infallible>(Event::default().data(serde_json::to_string(&initial).unwrap_or_default()));

        while let Some(snapshot) = rx.recv().await {
            yield Ok(Event::default().data(serde_json::to_string(&*snapshot).unwrap_or_default()));
        }

        event_bus.unsubscribe(sub_id);
    };

    let mut response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    // axum's Sse sets content-type/no-cache; proxies still need telling not
    // to buffer the stream.
    response.headers_mut().insert(HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"));
    response
}
