use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::discovery_loop::DiscoveryLoop;
use crate::dto::{MoveCameraReq, PairDeviceReq};
use crate::object_store::ObjectStore;
use crate::pairing::PairingService;
use crate::ptz::PtzService;
use crate::pubsub::PubSub;
use crate::registry::{Camera, Recording, Registry};
use crate::Error;

/// View URLs presigned for this long; short enough that a leaked link is
/// useless within a day, long enough to cover a client holding a response.
const RECORDING_VIEW_URL_EXPIRY: Duration = Duration::from_secs(3600);

/// Shared state for the HTTP/SSE edge, mirroring the shape of the donor's
/// `AppState`: one `Arc` per service the router dispatches into.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub pairing: Arc<PairingService>,
    pub ptz: Arc<PtzService>,
    pub discovery: Arc<DiscoveryLoop>,
    pub pubsub: Arc<PubSub>,
    pub object_store: Arc<ObjectStore>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(e) => e.into(),
            Err(e) => ApiError {
                message: e.to_string(),
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// The HTTP/SSE surface: pairing, PTZ control, camera/recording reads, and
/// the two SSE streams (discovery events, per-camera recording events).
///
/// Grounded on the donor's `RestApi` (`api/rest.rs`): axum 0.6 router, a
/// permissive CORS layer, bind via `TcpListener` then serve.
pub struct EdgeApi {
    state: AppState,
    config: ApiConfig,
}

impl EdgeApi {
    pub fn new(state: AppState, config: ApiConfig) -> Self {
        Self { state, config }
    }

    pub async fn run(&self) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/v1/cameras/pair", post(pair_camera))
            .route("/v1/cameras/:uuid/unpair", post(unpair_camera))
            .route("/v1/cameras/:uuid/ptz/move", post(move_camera))
            .route("/v1/cameras", get(list_cameras))
            .route("/v1/cameras/:uuid", get(get_camera))
            .route("/v1/recordings/:id", get(get_recording))
            .route("/events/discovery", get(discovery_events))
            .route("/events/recordings/:uuid", get(recording_events))
            .layer(cors)
            .with_state(self.state.clone());

        let addr: SocketAddr = format!("{}:{}", self.config.address, self.config.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid api address/port: {e}")))?;

        info!(%addr, "edge api listening");
        let listener = TcpListener::bind(addr).await?;
        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }
}

async fn pair_camera(
    State(state): State<AppState>,
    Json(req): Json<PairDeviceReq>,
) -> ApiResult<Json<Camera>> {
    let camera = state.pairing.pair(&req).await?;
    Ok(Json(camera))
}

async fn unpair_camera(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.pairing.unpair(uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_camera(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(req): Json<MoveCameraReq>,
) -> ApiResult<StatusCode> {
    state.ptz.move_camera(uuid, &req).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    offset: Option<i64>,
    limit: Option<i64>,
}

async fn list_cameras(
    State(state): State<AppState>,
    Query(params): Query<PageQuery>,
) -> ApiResult<Json<Vec<Camera>>> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(100);
    let cameras = state.registry.find_many(offset, limit).await?;
    Ok(Json(cameras))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<Camera>> {
    let camera = state.registry.find_one(uuid).await?;
    Ok(Json(camera))
}

#[derive(Debug, Serialize)]
struct RecordingView {
    #[serde(flatten)]
    recording: Recording,
    view_url: Option<String>,
}

async fn get_recording(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RecordingView>> {
    let recording = state.registry.find_recording(id).await?;
    let view_url = match state
        .object_store
        .presigned_view_url(&recording.vid_key, RECORDING_VIEW_URL_EXPIRY)
        .await
    {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(id = %recording.id, "get_recording: failed to presign view url: {e}");
            None
        }
    };
    Ok(Json(RecordingView { recording, view_url }))
}

/// SSE stream of `DiscoveryEvent`s. A lagging subscriber only misses events;
/// the broadcast channel never closes on overflow.
async fn discovery_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.discovery.subscribe_sse();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        let event = item.ok()?;
        let body = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().data(body)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// SSE stream of a single camera's recording-event fan-out.
async fn recording_events(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.pubsub.subscribe(uuid);
    let stream = ReceiverStream::new(rx).map(|body| Ok(Event::default().data(body)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
