//! HTTP endpoints of the control surface.
//!
//! Setters validate bounds and answer 400 on violation (no silent
//! clamping); endpoints whose backing device is absent or fatally failed
//! answer 503.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use guider::config::GuideMethod;
use guider::GuideError;
use hardware::camera::{CameraSource, PixelMode};
use hardware::mount::{Direction, MountLink, Pier, SlewRate};
use shared::conversions::{lx200_dec_to_deg, lx200_ra_to_deg};

use crate::mjpeg::encode_bgr_png;
use crate::platesolve;
use crate::state::AppState;
use crate::ws;

/// Error payload with an explicit status code.
pub struct ApiError(pub StatusCode, pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.1 }));
        (self.0, body).into_response()
    }
}

impl From<GuideError> for ApiError {
    fn from(e: GuideError) -> Self {
        let code = match &e {
            GuideError::OutOfRange(..) => StatusCode::BAD_REQUEST,
            GuideError::NoFrame => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        ApiError(code, e.to_string())
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({ "status": "success" })))
}

fn ok_message(message: impl Into<String>) -> ApiResult {
    Ok(Json(
        json!({ "status": "success", "message": message.into() }),
    ))
}

fn mount_of(state: &AppState) -> Result<&Arc<MountLink>, ApiError> {
    state.mount.as_ref().ok_or_else(|| {
        ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "mount is not connected".to_string(),
        )
    })
}

fn camera_of(state: &AppState) -> Result<&Arc<CameraSource>, ApiError> {
    let camera = state.camera.as_ref().ok_or_else(|| {
        ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "camera is not connected".to_string(),
        )
    })?;
    if camera.is_fatal() {
        return Err(ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "camera stopped responding".to_string(),
        ));
    }
    Ok(camera)
}

fn mount_err(e: hardware::mount::MountError) -> ApiError {
    ApiError(StatusCode::BAD_GATEWAY, e.to_string())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/properties", get(properties))
        .route("/scope_info", get(scope_info))
        .route("/video_feed", get(video_feed))
        .route("/thresh_feed", get(thresh_feed))
        .route("/save_frame", post(save_frame))
        .route("/set_threshold", post(set_threshold))
        .route("/set_max_drift", post(set_max_drift))
        .route("/set_star_size", post(set_star_size))
        .route("/set_rotation_angle", post(set_rotation_angle))
        .route("/set_pixel_scale", post(set_pixel_scale))
        .route("/set_guide_interval", post(set_guide_interval))
        .route("/set_guide_pulse", post(set_guide_pulse))
        .route("/set_guide_method", post(set_guide_method))
        .route("/set_pid", post(set_pid))
        .route("/set_guiding", post(set_guiding))
        .route("/set_dec_guiding", post(set_dec_guiding))
        .route("/acquire", post(acquire))
        .route("/remove_star", post(remove_star))
        .route("/remove_all_stars", post(remove_all_stars))
        .route("/calibrate", post(calibrate))
        .route("/solve_field", post(solve_field))
        .route("/get_camera_properties", get(get_camera_properties))
        .route("/set_camera_properties", post(set_camera_properties))
        .route("/set_direct_camera_property", post(set_direct_camera_property))
        .route("/capture_hot_pixel_mask", post(capture_hot_pixel_mask))
        .route("/load_hot_pixel_mask", post(load_hot_pixel_mask))
        .route("/clear_hot_pixel_mask", post(clear_hot_pixel_mask))
        .route("/control_move", post(control_move))
        .route("/control_stop", post(control_stop))
        .route("/control_speed", post(control_speed))
        .route("/control_correction", post(control_correction))
        .route("/command_goto", post(command_goto))
        .route("/command_set_to", post(command_set_to))
        .route("/command_info", get(command_info))
        .route("/set_tracking", post(set_tracking))
        .route("/set_quiet", post(set_quiet))
        .route("/set_pier", post(set_pier))
        .route("/set_backlash", post(set_backlash))
        .route("/set_camera", post(set_camera))
        .route("/command_camera", post(command_camera))
        .route("/command_receivePEC", get(receive_pec))
        .route("/command_sendPEC", post(send_pec))
        .route("/set_pec_position", post(set_pec_position))
        .route("/command_reset", post(command_reset))
        .route("/command_upload", post(command_upload))
        .route("/autoguider_socket", get(ws::autoguider_socket))
        .route("/telescope_socket", get(ws::telescope_socket))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

// ---- status ----

pub fn properties_json(state: &AppState) -> serde_json::Value {
    let snapshot = state.guider.snapshot();
    let camera = state.camera.as_ref().map(|c| c.status());

    let (width, height) = camera
        .as_ref()
        .map(|c| (c.width as f64, c.height as f64))
        .unwrap_or((1.0, 1.0));

    let normalize = |points: &[(f64, f64)]| -> Vec<(f64, f64)> {
        points
            .iter()
            .map(|(x, y)| (x / width, y / height))
            .collect()
    };

    let centroid_image = state
        .guider
        .preview_image()
        .and_then(|preview| encode_bgr_png(&preview))
        .map(|png| base64::engine::general_purpose::STANDARD.encode(png));

    json!({
        "tracked_centroids": normalize(&snapshot.tracked),
        "current_centroids": normalize(&snapshot.current),
        "max_drift": snapshot.config.max_drift,
        "star_size": snapshot.config.star_size,
        "gray_threshold": snapshot.config.gray_threshold,
        "rotation_angle": snapshot.rotation.rotation_angle,
        "pixel_scale": snapshot.rotation.pixel_scale,
        "guiding": snapshot.guiding,
        "dec_guiding": snapshot.config.dec_guiding,
        "guide_method": snapshot.config.method,
        "guide_interval": snapshot.config.guide_interval,
        "guide_pulse": snapshot.config.guide_pulse,
        "max_distance": snapshot.config.max_distance,
        "calibrating": snapshot.calibrating,
        "star_locked": snapshot.star_locked,
        "last_correction": snapshot.last_correction,
        "focus_metric": snapshot.focus_metric,
        "last_loop_time": snapshot.last_loop_time,
        "last_status": state.status_log.last_status(),
        "pid_p": snapshot.pid_gains.0,
        "pid_i": snapshot.pid_gains.1,
        "pid_d": snapshot.pid_gains.2,
        "integrate_frames": camera.as_ref().map(|c| c.integrate_frames),
        "r_channel": camera.as_ref().map(|c| c.channel_gains.0),
        "g_channel": camera.as_ref().map(|c| c.channel_gains.1),
        "b_channel": camera.as_ref().map(|c| c.channel_gains.2),
        "camera_fps": camera.as_ref().map(|c| c.fps),
        "resolution": camera.as_ref().map(|c| json!({ "width": c.width, "height": c.height })),
        "video_mode": camera.as_ref().map(|c| c.mode.name()),
        "last_frame_time": camera.as_ref().map(|c| c.last_frame_time),
        "hot_pixels": camera.as_ref().map(|c| c.hot_pixel_count),
        "centroid_image": centroid_image,
    })
}

async fn properties(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(properties_json(&state))
}

async fn scope_info(State(state): State<Arc<AppState>>) -> ApiResult {
    let mount = mount_of(&state)?;
    Ok(Json(serde_json::to_value(mount.scope_info()).unwrap_or_default()))
}

async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    match camera_of(&state) {
        Ok(_) => state.video_feed.subscribe_response(),
        Err(e) => e.into_response(),
    }
}

async fn thresh_feed(State(state): State<Arc<AppState>>) -> Response {
    state.thresh_feed.subscribe_response()
}

async fn save_frame(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let camera = camera_of(&state)?;
    let frame = camera.current_frame().ok_or_else(|| {
        ApiError(StatusCode::BAD_REQUEST, "no frame available".to_string())
    })?;
    let png = match &frame.data {
        shared::frame::FrameData::Gray(a) => {
            let (h, w) = a.dim();
            let img =
                image::GrayImage::from_raw(w as u32, h as u32, a.iter().copied().collect())
                    .ok_or_else(|| {
                        ApiError(StatusCode::INTERNAL_SERVER_ERROR, "encode failed".to_string())
                    })?;
            let mut out = std::io::Cursor::new(Vec::new());
            img.write_to(&mut out, image::ImageFormat::Png)
                .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            out.into_inner()
        }
        shared::frame::FrameData::Color(a) => encode_bgr_png(a).ok_or_else(|| {
            ApiError(StatusCode::INTERNAL_SERVER_ERROR, "encode failed".to_string())
        })?,
    };
    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"saved_frame.png\"".to_string(),
            ),
        ],
        png,
    )
        .into_response())
}

// ---- guider setters ----

#[derive(Deserialize)]
struct ThresholdBody {
    threshold: i64,
}

async fn set_threshold(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ThresholdBody>,
) -> ApiResult {
    if !(0..=255).contains(&body.threshold) {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("gray_threshold {} out of range 0..=255", body.threshold),
        ));
    }
    state.guider.set_gray_threshold(body.threshold as u8);
    ok()
}

#[derive(Deserialize)]
struct MaxDriftBody {
    max_drift: f64,
}

async fn set_max_drift(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MaxDriftBody>,
) -> ApiResult {
    state.guider.set_max_drift(body.max_drift)?;
    ok()
}

#[derive(Deserialize)]
struct StarSizeBody {
    star_size: f64,
}

async fn set_star_size(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StarSizeBody>,
) -> ApiResult {
    state.guider.set_star_size(body.star_size)?;
    ok()
}

#[derive(Deserialize)]
struct RotationBody {
    rotation_angle: f64,
}

async fn set_rotation_angle(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RotationBody>,
) -> ApiResult {
    state.guider.set_rotation_angle(body.rotation_angle)?;
    ok()
}

#[derive(Deserialize)]
struct PixelScaleBody {
    pixel_scale: f64,
}

async fn set_pixel_scale(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PixelScaleBody>,
) -> ApiResult {
    state.guider.set_pixel_scale(body.pixel_scale)?;
    ok()
}

#[derive(Deserialize)]
struct GuideIntervalBody {
    guide_interval: f64,
}

async fn set_guide_interval(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GuideIntervalBody>,
) -> ApiResult {
    state.guider.set_guide_interval(body.guide_interval)?;
    ok()
}

#[derive(Deserialize)]
struct GuidePulseBody {
    guide_pulse: f64,
}

async fn set_guide_pulse(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GuidePulseBody>,
) -> ApiResult {
    state.guider.set_guide_pulse(body.guide_pulse)?;
    ok()
}

#[derive(Deserialize)]
struct GuideMethodBody {
    guide_method: GuideMethod,
}

async fn set_guide_method(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GuideMethodBody>,
) -> ApiResult {
    state.guider.set_guide_method(body.guide_method);
    ok()
}

#[derive(Deserialize)]
struct PidBody {
    pid_p: f64,
    pid_i: f64,
    pid_d: f64,
}

async fn set_pid(State(state): State<Arc<AppState>>, Json(body): Json<PidBody>) -> ApiResult {
    state.guider.set_pid_gains(body.pid_p, body.pid_i, body.pid_d);
    ok()
}

#[derive(Deserialize)]
struct GuidingBody {
    guiding: bool,
}

async fn set_guiding(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GuidingBody>,
) -> ApiResult {
    state.guider.enable_guiding(body.guiding)?;
    ok()
}

#[derive(Deserialize)]
struct DecGuidingBody {
    dec_guiding: bool,
}

async fn set_dec_guiding(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DecGuidingBody>,
) -> ApiResult {
    state.guider.enable_dec_guiding(body.dec_guiding);
    ok()
}

// ---- guider actions ----

#[derive(Deserialize)]
struct NormalizedPoint {
    /// 0..1, relative to the frame width.
    x: f64,
    /// 0..1, relative to the frame height.
    y: f64,
}

fn denormalize(state: &AppState, point: &NormalizedPoint) -> Result<(f64, f64), ApiError> {
    let camera = camera_of(state)?;
    let status = camera.status();
    Ok((
        point.x * status.width as f64,
        point.y * status.height as f64,
    ))
}

async fn acquire(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NormalizedPoint>,
) -> ApiResult {
    let hint = denormalize(&state, &body)?;
    let guider = Arc::clone(&state.guider);
    let centroid = tokio::task::spawn_blocking(move || guider.acquire(Some(hint)))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    ok_message(format!(
        "Acquisition triggered at ({:.1}, {:.1})",
        centroid.0, centroid.1
    ))
}

async fn remove_star(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NormalizedPoint>,
) -> ApiResult {
    let near = denormalize(&state, &body)?;
    state.guider.remove_star(near)?;
    ok()
}

async fn remove_all_stars(State(state): State<Arc<AppState>>) -> ApiResult {
    state.guider.remove_all_stars();
    ok()
}

#[derive(Deserialize)]
struct CalibrateBody {
    #[serde(default)]
    with_backlash: bool,
}

async fn calibrate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CalibrateBody>,
) -> ApiResult {
    let guider = Arc::clone(&state.guider);
    let timing = guider::calibration::CalibrationTiming::default();
    let result = tokio::task::spawn_blocking(move || {
        guider::calibration::calibrate(&guider, body.with_backlash, &timing)
    })
    .await
    .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    ok_message(format!(
        "Calibrated rotation angle: {:.1} degrees",
        result.rotation_angle
    ))
}

#[derive(Deserialize)]
struct SolveBody {
    image: String,
    #[serde(default = "default_downsample")]
    downsample: u32,
}

fn default_downsample() -> u32 {
    2
}

async fn solve_field(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SolveBody>,
) -> ApiResult {
    let path = std::path::PathBuf::from(&body.image);
    let result =
        tokio::task::spawn_blocking(move || platesolve::solve(&path, body.downsample, 50, 110, 60))
            .await
            .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .map_err(|e| ApiError(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    state.guider.set_rotation_angle(result.rotation_deg)?;
    state.guider.set_pixel_scale(result.pixel_scale)?;
    Ok(Json(json!({
        "status": "success",
        "ra": result.ra_deg,
        "dec": result.dec_deg,
        "rotation_angle": result.rotation_deg,
        "pixel_scale": result.pixel_scale,
    })))
}

// ---- camera ----

async fn get_camera_properties(State(state): State<Arc<AppState>>) -> ApiResult {
    let camera = camera_of(&state)?;
    let status = camera.status();
    Ok(Json(json!({
        "video_mode": status.mode.name(),
        "width": status.width,
        "height": status.height,
        "camera_fps": status.fps,
        "color": status.color,
        "integrate_frames": status.integrate_frames,
        "hot_pixels": status.hot_pixel_count,
    })))
}

#[derive(Deserialize)]
struct CameraPropertiesBody {
    width: Option<u32>,
    height: Option<u32>,
    video_mode: Option<String>,
    camera_fps: Option<f64>,
    r_channel: Option<f64>,
    g_channel: Option<f64>,
    b_channel: Option<f64>,
    integrate_frames: Option<u32>,
    camera_color: Option<bool>,
}

async fn set_camera_properties(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CameraPropertiesBody>,
) -> ApiResult {
    let camera = camera_of(&state)?;
    let status = camera.status();

    if let (Some(width), Some(height)) = (body.width, body.height) {
        camera
            .set_frame_size(width, height)
            .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    }
    if let Some(mode) = body.video_mode {
        let mode = PixelMode::from_name(&mode)
            .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
        camera
            .set_mode(mode)
            .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    }
    if let Some(fps) = body.camera_fps {
        camera
            .set_fps(fps)
            .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    }
    let gains = (
        body.r_channel.unwrap_or(status.channel_gains.0),
        body.g_channel.unwrap_or(status.channel_gains.1),
        body.b_channel.unwrap_or(status.channel_gains.2),
    );
    if gains != status.channel_gains {
        camera
            .set_channel_gains(gains.0, gains.1, gains.2)
            .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    }
    if let Some(n) = body.integrate_frames {
        camera
            .set_integration(n)
            .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    }
    if let Some(color) = body.camera_color {
        camera
            .set_color(color)
            .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    }
    ok()
}

#[derive(Deserialize)]
struct DirectControlBody {
    name: String,
    value: i64,
}

async fn set_direct_camera_property(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DirectControlBody>,
) -> ApiResult {
    let camera = camera_of(&state)?;
    camera
        .set_control(&body.name, body.value)
        .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    ok()
}

#[derive(Deserialize)]
struct HotPixelBody {
    #[serde(default = "default_dark_frames")]
    dark_frames: u32,
    #[serde(default = "default_hot_threshold")]
    threshold: f64,
}

fn default_dark_frames() -> u32 {
    10
}

fn default_hot_threshold() -> f64 {
    15.0
}

async fn capture_hot_pixel_mask(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HotPixelBody>,
) -> ApiResult {
    let camera = camera_of(&state)?;
    camera
        .capture_hot_pixel_mask(body.dark_frames, body.threshold)
        .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    ok_message("capturing hot pixel mask")
}

async fn load_hot_pixel_mask(State(state): State<Arc<AppState>>) -> ApiResult {
    let camera = camera_of(&state)?;
    camera
        .load_hot_pixel_mask()
        .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    ok()
}

async fn clear_hot_pixel_mask(State(state): State<Arc<AppState>>) -> ApiResult {
    let camera = camera_of(&state)?;
    camera
        .clear_hot_pixel_mask()
        .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    ok()
}

// ---- mount control ----

fn parse_direction(value: &str) -> Result<Direction, ApiError> {
    value
        .chars()
        .next()
        .and_then(Direction::from_char)
        .ok_or_else(|| {
            ApiError(
                StatusCode::BAD_REQUEST,
                format!("invalid direction {value:?}"),
            )
        })
}

#[derive(Deserialize)]
struct DirectionBody {
    direction: String,
}

async fn control_move(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DirectionBody>,
) -> ApiResult {
    let direction = parse_direction(&body.direction)?;
    mount_of(&state)?.send_move(direction).map_err(mount_err)?;
    ok()
}

#[derive(Deserialize)]
struct StopBody {
    #[serde(default)]
    direction: String,
}

async fn control_stop(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StopBody>,
) -> ApiResult {
    let direction = if body.direction.is_empty() {
        None
    } else {
        Some(parse_direction(&body.direction)?)
    };
    mount_of(&state)?.send_stop(direction).map_err(mount_err)?;
    ok()
}

#[derive(Deserialize)]
struct SpeedBody {
    speed: String,
}

async fn control_speed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SpeedBody>,
) -> ApiResult {
    let rate = body
        .speed
        .chars()
        .next()
        .and_then(SlewRate::from_char)
        .ok_or_else(|| {
            ApiError(StatusCode::BAD_REQUEST, format!("invalid speed {:?}", body.speed))
        })?;
    mount_of(&state)?.send_rate(rate).map_err(mount_err)?;
    ok()
}

async fn control_correction(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DirectionBody>,
) -> ApiResult {
    let direction = parse_direction(&body.direction)?;
    let mount = Arc::clone(mount_of(&state)?);
    let pulse = state.guider.config().guide_pulse;
    tokio::task::spawn_blocking(move || mount.send_correction(direction, pulse))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(mount_err)?;
    ok()
}

#[derive(Deserialize)]
struct CoordinatesBody {
    /// LX200 `HH:MM:SS`.
    ra: String,
    /// LX200 `±DD*MM:SS`.
    dec: String,
}

fn parse_coordinates(body: &CoordinatesBody) -> Result<(f64, f64), ApiError> {
    let ra = lx200_ra_to_deg(&body.ra)
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    let dec = lx200_dec_to_deg(&body.dec)
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((ra, dec))
}

async fn command_goto(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CoordinatesBody>,
) -> ApiResult {
    let (ra, dec) = parse_coordinates(&body)?;
    let mount = Arc::clone(mount_of(&state)?);
    tokio::task::spawn_blocking(move || mount.goto(ra, dec))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(mount_err)?;
    ok_message(format!("GOTO RA={} DEC={}", body.ra, body.dec))
}

async fn command_set_to(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CoordinatesBody>,
) -> ApiResult {
    let (ra, dec) = parse_coordinates(&body)?;
    let mount = Arc::clone(mount_of(&state)?);
    tokio::task::spawn_blocking(move || mount.sync_to(ra, dec))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(mount_err)?;
    ok_message(format!("SET TO RA={} DEC={}", body.ra, body.dec))
}

async fn command_info(State(state): State<Arc<AppState>>) -> ApiResult {
    let mount = Arc::clone(mount_of(&state)?);
    let info = tokio::task::spawn_blocking(move || mount.get_info())
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(mount_err)?;
    Ok(Json(json!({
        "status": "success",
        "info": serde_json::to_value(info).unwrap_or_default(),
    })))
}

#[derive(Deserialize)]
struct TrackingBody {
    tracking: bool,
}

async fn set_tracking(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TrackingBody>,
) -> ApiResult {
    mount_of(&state)?
        .set_tracking(body.tracking)
        .map_err(mount_err)?;
    ok_message(format!("Tracking set to {}", body.tracking))
}

#[derive(Deserialize)]
struct QuietBody {
    quiet: bool,
}

async fn set_quiet(State(state): State<Arc<AppState>>, Json(body): Json<QuietBody>) -> ApiResult {
    mount_of(&state)?.set_quiet(body.quiet);
    ok_message(format!("Quiet mode set to {}", body.quiet))
}

#[derive(Deserialize)]
struct PierBody {
    pier: String,
}

async fn set_pier(State(state): State<Arc<AppState>>, Json(body): Json<PierBody>) -> ApiResult {
    let pier = body.pier.chars().next().and_then(Pier::from_char).ok_or_else(|| {
        ApiError(StatusCode::BAD_REQUEST, format!("invalid pier {:?}", body.pier))
    })?;
    mount_of(&state)?.set_pier(pier).map_err(mount_err)?;
    ok_message(format!("Pier set to {}", body.pier))
}

#[derive(Deserialize)]
struct BacklashBody {
    ra: u16,
    dec: u16,
}

async fn set_backlash(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BacklashBody>,
) -> ApiResult {
    if body.ra > 999 || body.dec > 999 {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "backlash out of range 0..=999".to_string(),
        ));
    }
    let mount = mount_of(&state)?;
    mount.set_backlash_ra(body.ra).map_err(mount_err)?;
    mount.set_backlash_dec(body.dec).map_err(mount_err)?;
    ok_message("Backlash set")
}

#[derive(Deserialize)]
struct MountCameraBody {
    shots: u32,
    exposure: u32,
}

async fn set_camera(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MountCameraBody>,
) -> ApiResult {
    mount_of(&state)?
        .set_camera(body.shots, body.exposure)
        .map_err(mount_err)?;
    ok_message(format!(
        "Camera set to shots {} and exposure {}",
        body.shots, body.exposure
    ))
}

#[derive(Deserialize)]
struct CameraActionBody {
    action: String,
}

async fn command_camera(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CameraActionBody>,
) -> ApiResult {
    let start = match body.action.as_str() {
        "START" => true,
        "STOP" => false,
        other => {
            return Err(ApiError(
                StatusCode::BAD_REQUEST,
                format!("invalid camera action {other:?}"),
            ))
        }
    };
    mount_of(&state)?.camera_start(start).map_err(mount_err)?;
    ok_message(format!("Camera {}", body.action))
}

async fn receive_pec(State(state): State<Arc<AppState>>) -> ApiResult {
    let mount = Arc::clone(mount_of(&state)?);
    let table = tokio::task::spawn_blocking(move || mount.receive_pec_table())
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(mount_err)?;
    Ok(Json(json!({ "status": "success", "pec_table": table })))
}

#[derive(Deserialize)]
struct PecTableBody {
    pec_table: Vec<i16>,
}

async fn send_pec(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PecTableBody>,
) -> ApiResult {
    if body.pec_table.is_empty() || body.pec_table.len() % 2 != 0 {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "PEC table must hold an even, non-zero number of values".to_string(),
        ));
    }
    let mount = Arc::clone(mount_of(&state)?);
    let ack = tokio::task::spawn_blocking(move || mount.send_pec_table(&body.pec_table))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(mount_err)?;
    ok_message(ack)
}

#[derive(Deserialize)]
struct PecPositionBody {
    pec_position: f64,
}

async fn set_pec_position(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PecPositionBody>,
) -> ApiResult {
    let rounded = body.pec_position.round();
    if !(0.0..=99.0).contains(&rounded) {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("PEC position {} out of range 0..=99", body.pec_position),
        ));
    }
    mount_of(&state)?
        .set_pec_position(rounded as u8)
        .map_err(mount_err)?;
    ok_message(format!("PEC pos set to {rounded}"))
}

async fn command_reset(State(state): State<Arc<AppState>>) -> ApiResult {
    mount_of(&state)?.reset_controller().map_err(mount_err)?;
    ok_message("Mount controller reset")
}

async fn command_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult {
    let mount = Arc::clone(mount_of(&state)?);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some("firmware") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("firmware.hex").to_string();
        if !file_name.ends_with(".hex") {
            return Err(ApiError(
                StatusCode::BAD_REQUEST,
                "firmware must be a .hex file".to_string(),
            ));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
        let path = state.data_dir.join(&file_name);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        info!("flashing firmware {}", path.display());
        let flasher = state.flasher.clone();
        let mut args = state.flasher_args.clone();
        args.push(path.to_string_lossy().to_string());
        tokio::task::spawn_blocking(move || mount.upload_firmware(&flasher, &args))
            .await
            .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        return ok();
    }
    Err(ApiError(
        StatusCode::BAD_REQUEST,
        "no firmware file in request".to_string(),
    ))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> ApiResult {
    warn!("shutdown requested via /shutdown");
    state.shutdown.notify_waiters();
    ok_message("Server shutting down")
}
