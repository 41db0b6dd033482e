//! PipiTrek server entry point: builds the device stack, starts the
//! cooperating loops and the external surfaces, and tears everything down
//! in order on shutdown.

mod args;
mod mjpeg;
mod platesolve;
mod routes;
mod state;
mod stellarium;
mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use guider::config::GuideMethod;
use guider::{FrameSource, Guider, MountCommander};
use hardware::camera::{CameraConfig, CameraSource, PixelMode};
use hardware::mount::{MountBridge, MountLink, Pier, SidePort, TcpSerialServer};
use shared::settings::{GuideMethodSetting, PidGains, Settings};
use shared::{SettingsStore, StatusLog};

use crate::args::Args;
use crate::mjpeg::{encode_bgr_jpeg, encode_gray_jpeg, MjpegBroadcaster};
use crate::state::{AppState, CameraFrames, MountAdapter, NoFrames, NullMount, SlewRequest};

const VIDEO_FEED_INTERVAL: Duration = Duration::from_millis(500);

fn method_from_setting(setting: GuideMethodSetting) -> GuideMethod {
    match setting {
        GuideMethodSetting::Pulse => GuideMethod::Pulse,
        GuideMethodSetting::Speed => GuideMethod::Speed,
        GuideMethodSetting::Pid => GuideMethod::Pid,
    }
}

fn method_to_setting(method: GuideMethod) -> GuideMethodSetting {
    match method {
        GuideMethod::Pulse => GuideMethodSetting::Pulse,
        GuideMethod::Speed => GuideMethodSetting::Speed,
        GuideMethod::Pid => GuideMethodSetting::Pid,
    }
}

fn restore_guider(guider: &Guider, settings: &Settings) {
    let config = guider::GuideConfig {
        max_drift: settings.max_drift,
        star_size: settings.star_size,
        gray_threshold: settings.gray_threshold,
        guide_interval: settings.guide_interval,
        guide_pulse: settings.guide_pulse,
        max_distance: settings.max_distance,
        method: method_from_setting(settings.guide_method),
        dec_guiding: settings.dec_guiding,
    };
    let rotation = guider::RotationModel {
        rotation_angle: settings.rotation_angle,
        pixel_scale: settings.pixel_scale,
        backlash_ra: 0,
        backlash_dec: 0,
    };
    let pid = (settings.pid_ra.p, settings.pid_ra.i, settings.pid_ra.d);
    guider.restore(config, rotation, pid);
}

fn collect_settings(state: &AppState, previous: &Settings) -> Settings {
    let snapshot = state.guider.snapshot();
    let mut settings = previous.clone();

    settings.max_drift = snapshot.config.max_drift;
    settings.star_size = snapshot.config.star_size;
    settings.gray_threshold = snapshot.config.gray_threshold;
    settings.guide_interval = snapshot.config.guide_interval;
    settings.guide_pulse = snapshot.config.guide_pulse;
    settings.max_distance = snapshot.config.max_distance;
    settings.guide_method = method_to_setting(snapshot.config.method);
    settings.dec_guiding = snapshot.config.dec_guiding;
    settings.rotation_angle = snapshot.rotation.rotation_angle;
    settings.pixel_scale = snapshot.rotation.pixel_scale;
    let (p, i, d) = snapshot.pid_gains;
    settings.pid_ra = PidGains { p, i, d };
    settings.pid_dec = PidGains { p, i, d };

    if let Some(camera) = state.camera.as_ref() {
        let status = camera.status();
        settings.integrate_frames = status.integrate_frames;
        settings.r_channel = status.channel_gains.0;
        settings.g_channel = status.channel_gains.1;
        settings.b_channel = status.channel_gains.2;
        settings.cam_fps = status.fps;
        settings.width = status.width;
        settings.height = status.height;
        settings.cam_mode = status.mode.name().to_string();
        settings.camera_color = status.color;
    }

    if let Some(mount) = state.mount.as_ref() {
        settings.scope_info = serde_json::to_value(mount.scope_info()).unwrap_or_default();
    }

    settings
}

/// Re-apply the persisted mount state after the controller restarted.
fn restore_mount(mount: &MountLink, settings: &Settings) {
    let info: hardware::mount::ScopeInfo =
        match serde_json::from_value(settings.scope_info.clone()) {
            Ok(info) => info,
            Err(_) => return,
        };
    if let Err(e) = mount.set_pec_position(info.pec.progress) {
        warn!("failed to restore PEC position: {e}");
    }
    if let Some(pier) = info.pier {
        if let Err(e) = mount.set_pier(pier) {
            warn!("failed to restore pier {}: {e}", Pier::as_char(pier));
        }
    }
    if let Err(e) = mount.set_tracking(info.tracking) {
        warn!("failed to restore tracking: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    info!("PipiTrek server starting up");
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data dir {}", args.data_dir.display()))?;

    let settings_store = SettingsStore::new(args.settings.clone());
    let settings = settings_store.load();

    let status_log = Arc::new(StatusLog::new(args.data_dir.clone()));

    // ---- mount ----
    let mut bridge = None;
    let mut tcp_serial: Option<Arc<TcpSerialServer>> = None;
    let mount = if args.no_mount {
        None
    } else {
        match MountLink::connect(&args.serial_device, None) {
            Ok(link) => {
                let link = Arc::new(link);
                // The controller restarts with the serial connection.
                std::thread::sleep(Duration::from_secs(2));
                restore_mount(&link, &settings);

                let mut side_ports: Vec<Arc<dyn SidePort>> = Vec::new();
                match TcpSerialServer::start(&args.telescope_addr) {
                    Ok(server) => {
                        let server = Arc::new(server);
                        tcp_serial = Some(Arc::clone(&server));
                        side_ports.push(server);
                    }
                    Err(e) => warn!("telescope TCP server failed to start: {e}"),
                }
                #[cfg(feature = "bluetooth")]
                match hardware::mount::bt_serial::BtSerial::new(&args.bt_device, "gpiochip0", 22)
                {
                    Ok(bt) => side_ports.push(Arc::new(bt)),
                    Err(e) => warn!("bluetooth serial unavailable: {e}"),
                }

                bridge = Some(MountBridge::start(Arc::clone(&link), side_ports));
                Some(link)
            }
            Err(e) => {
                error!("mount connection failed: {e}");
                None
            }
        }
    };

    // ---- camera ----
    let camera = if args.no_camera {
        None
    } else {
        let config = CameraConfig {
            device_path: args.camera_device.clone(),
            mode: PixelMode::from_name(&settings.cam_mode).unwrap_or(PixelMode::Mjpg),
            width: settings.width,
            height: settings.height,
            fps: settings.cam_fps,
            color: settings.camera_color,
            controls: settings.camera_controls.clone(),
        };
        let gains = (settings.r_channel, settings.g_channel, settings.b_channel);
        match CameraSource::start(config, settings.integrate_frames, gains, args.data_dir.clone())
        {
            Ok(camera) => Some(Arc::new(camera)),
            Err(e) => {
                error!("camera startup failed: {e}");
                None
            }
        }
    };

    // ---- guider ----
    let commander: Arc<dyn MountCommander> = match mount.as_ref() {
        Some(link) => Arc::new(MountAdapter(Arc::clone(link))),
        None => Arc::new(NullMount),
    };
    let frames: Arc<dyn FrameSource> = match camera.as_ref() {
        Some(camera) => Arc::new(CameraFrames(Arc::clone(camera))),
        None => Arc::new(NoFrames),
    };
    let guider = Arc::new(Guider::new(commander, frames, Arc::clone(&status_log)));
    restore_guider(&guider, &settings);

    let guide_stop = Arc::new(AtomicBool::new(false));
    let guide_thread = {
        let guider = Arc::clone(&guider);
        let stop = Arc::clone(&guide_stop);
        std::thread::Builder::new()
            .name("guide-loop".to_string())
            .spawn(move || guider.run_loop(stop))
            .context("spawning guide loop")?
    };

    // ---- web state ----
    let (slew_tx, _) = broadcast::channel::<SlewRequest>(8);
    let state = Arc::new(AppState {
        guider: Arc::clone(&guider),
        camera: camera.clone(),
        mount: mount.clone(),
        settings_store,
        status_log: Arc::clone(&status_log),
        data_dir: args.data_dir.clone(),
        video_feed: MjpegBroadcaster::default(),
        thresh_feed: MjpegBroadcaster::default(),
        slew_requests: slew_tx,
        flasher: args.flasher.clone(),
        flasher_args: args.flasher_arg.clone(),
        shutdown: tokio::sync::Notify::new(),
    });

    // MJPEG pump: encode the current frame and threshold image for any
    // connected feed clients.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut last_seq = 0u64;
            loop {
                tokio::time::sleep(VIDEO_FEED_INTERVAL).await;
                if state.video_feed.subscriber_count() > 0 {
                    if let Some(frame) =
                        state.camera.as_ref().and_then(|c| c.current_frame())
                    {
                        if frame.seq != last_seq {
                            last_seq = frame.seq;
                            let jpeg = match &frame.data {
                                shared::frame::FrameData::Gray(a) => encode_gray_jpeg(a, 80),
                                shared::frame::FrameData::Color(a) => encode_bgr_jpeg(a, 80),
                            };
                            if let Some(jpeg) = jpeg {
                                state.video_feed.publish(jpeg);
                            }
                        }
                    }
                }
                if state.thresh_feed.subscriber_count() > 0 {
                    if let Some(threshold) = state.guider.threshold_image() {
                        if let Some(jpeg) = encode_gray_jpeg(&threshold, 80) {
                            state.thresh_feed.publish(jpeg);
                        }
                    }
                }
            }
        });
    }

    // Stellarium protocol server.
    tokio::spawn(stellarium::serve(
        args.stellarium_addr.clone(),
        Arc::clone(&state),
    ));

    // ---- HTTP / WebSocket surface ----
    let router = routes::router(Arc::clone(&state));
    let addr: SocketAddr = args
        .http_addr
        .parse()
        .with_context(|| format!("invalid http address {}", args.http_addr))?;
    let handle = axum_server::Handle::new();

    let server_task = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .context("loading TLS certificate")?;
            info!("https listening on {addr}");
            let handle = handle.clone();
            tokio::spawn(async move {
                axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
            })
        }
        _ => {
            info!("http listening on {addr}");
            let handle = handle.clone();
            tokio::spawn(async move {
                axum_server::bind(addr)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
            })
        }
    };

    // ---- wait for shutdown ----
    wait_for_shutdown(&state).await;
    info!("shutting down");

    // Save settings before touching any device.
    let settings = collect_settings(&state, &settings);
    if let Err(e) = state.settings_store.save(&settings) {
        warn!("failed to save settings: {e}");
    }

    // Stop the guide loop.
    guide_stop.store(true, Ordering::SeqCst);
    if guide_thread.join().is_err() {
        warn!("guide loop panicked during shutdown");
    }

    // Stop the camera.
    if let Some(camera) = camera.as_ref() {
        camera.stop();
    }

    // Park the mount state and close the serial line.
    if let Some(link) = mount.as_ref() {
        let _ = link.get_pec_position();
        // Tracking off so the worm position stays where we recorded it.
        if let Err(e) = link.set_tracking(false) {
            warn!("failed to disable tracking: {e}");
        }
    }
    if let Some(mut bridge) = bridge.take() {
        bridge.stop();
    }
    if let Some(server) = tcp_serial.take() {
        server.stop();
    }
    if let Some(link) = mount.as_ref() {
        link.close();
    }

    handle.graceful_shutdown(Some(Duration::from_secs(5)));
    let _ = server_task.await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(state: &AppState) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
        _ = state.shutdown.notified() => {}
    }
}
