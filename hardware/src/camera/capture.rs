//! Background capture loop and its public handle.
//!
//! The loop owns the V4L2 device and stream; everything else talks to it
//! through [`CameraSource`]: reconfiguration requests go over a channel
//! and are applied between integration rounds, the latest integrated frame
//! is published as an `Arc` swap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use ndarray::Array2;
use tracing::{error, info, warn};

use shared::hot_pixel_map::HotPixelMap;
use shared::Frame;

use super::dark::{average_frames, detect_hot_pixels, save_dark_frame};
use super::integrator::FrameAccumulator;
use super::v4l2::{self, CameraConfig, DecodedFrame, PixelMode};
use super::{CameraError, CameraResult};

const MAX_FAILURES: u32 = 5;
const MAX_RECOVERY_ATTEMPTS: u32 = 3;
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconfiguration and control requests handled between integration
/// rounds.
enum Request {
    SetMode(PixelMode),
    SetFrameSize(u32, u32),
    SetFps(f64),
    SetControl(String, i64),
    SetIntegration(u32),
    SetChannelGains(f64, f64, f64),
    SetColor(bool),
    CaptureHotPixelMask { dark_frames: u32, threshold: f64 },
    ClearHotPixelMask,
    LoadHotPixelMask,
    Stop,
}

/// Camera state visible to the web surface.
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub mode: PixelMode,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub color: bool,
    pub integrate_frames: u32,
    pub channel_gains: (f64, f64, f64),
    /// Wall-clock seconds the last integration round took.
    pub last_frame_time: f64,
    pub hot_pixel_count: usize,
}

struct Shared {
    frame: Mutex<Option<Arc<Frame>>>,
    status: Mutex<CameraStatus>,
    fatal: AtomicBool,
    seq: AtomicU64,
}

/// Handle to the background capture loop.
pub struct CameraSource {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CameraSource {
    /// Open the device and start the capture loop.
    ///
    /// `mask_dir` is where the hot-pixel mask and averaged dark frame are
    /// persisted.
    pub fn start(
        config: CameraConfig,
        integrate_frames: u32,
        channel_gains: (f64, f64, f64),
        mask_dir: PathBuf,
    ) -> CameraResult<Self> {
        let (device, width, height) = v4l2::open_device(&config)?;

        let status = CameraStatus {
            mode: config.mode,
            width,
            height,
            fps: config.fps,
            color: config.color,
            integrate_frames: integrate_frames.max(1),
            channel_gains,
            last_frame_time: 0.0,
            hot_pixel_count: 0,
        };
        let shared = Arc::new(Shared {
            frame: Mutex::new(None),
            status: Mutex::new(status),
            fatal: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let (tx, rx) = unbounded();
        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                let mut worker = CaptureWorker {
                    device: Some(device),
                    config,
                    shared: loop_shared,
                    requests: rx,
                    hot_pixels: load_mask(&mask_dir),
                    mask_dir,
                    failure_count: 0,
                    recovery_attempts: 0,
                };
                worker.publish_hot_pixel_count();
                worker.run();
            })
            .map_err(CameraError::Io)?;

        Ok(Self {
            shared,
            requests: tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Latest published frame, if any.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.shared.frame.lock().unwrap().clone()
    }

    pub fn status(&self) -> CameraStatus {
        self.shared.status.lock().unwrap().clone()
    }

    /// True when recovery is exhausted and the loop has terminated.
    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: PixelMode) -> CameraResult<()> {
        self.send(Request::SetMode(mode))
    }

    pub fn set_frame_size(&self, width: u32, height: u32) -> CameraResult<()> {
        self.send(Request::SetFrameSize(width, height))
    }

    pub fn set_fps(&self, fps: f64) -> CameraResult<()> {
        self.send(Request::SetFps(fps))
    }

    pub fn set_control(&self, name: &str, value: i64) -> CameraResult<()> {
        self.send(Request::SetControl(name.to_string(), value))
    }

    pub fn set_integration(&self, frames: u32) -> CameraResult<()> {
        self.send(Request::SetIntegration(frames.max(1)))
    }

    pub fn set_channel_gains(&self, r: f64, g: f64, b: f64) -> CameraResult<()> {
        self.send(Request::SetChannelGains(r, g, b))
    }

    pub fn set_color(&self, color: bool) -> CameraResult<()> {
        self.send(Request::SetColor(color))
    }

    pub fn capture_hot_pixel_mask(&self, dark_frames: u32, threshold: f64) -> CameraResult<()> {
        self.send(Request::CaptureHotPixelMask {
            dark_frames,
            threshold,
        })
    }

    pub fn load_hot_pixel_mask(&self) -> CameraResult<()> {
        self.send(Request::LoadHotPixelMask)
    }

    pub fn clear_hot_pixel_mask(&self) -> CameraResult<()> {
        self.send(Request::ClearHotPixelMask)
    }

    fn send(&self, request: Request) -> CameraResult<()> {
        self.requests
            .send(request)
            .map_err(|_| CameraError::NotRunning)
    }

    /// Ask the loop to exit and join it, bounded at 10 s.
    pub fn stop(&self) {
        let _ = self.requests.send(Request::Stop);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("camera capture thread stopped");
            } else {
                warn!("camera capture thread did not stop in time");
            }
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Stop);
    }
}

fn mask_path(dir: &std::path::Path) -> PathBuf {
    dir.join("hot_pixel_mask.json")
}

fn load_mask(dir: &std::path::Path) -> Option<HotPixelMap> {
    let path = mask_path(dir);
    if !path.exists() {
        return None;
    }
    match HotPixelMap::load(&path) {
        Ok(map) => {
            info!("loaded hot pixel mask with {} pixels", map.len());
            Some(map)
        }
        Err(e) => {
            warn!("failed to load hot pixel mask: {e}");
            None
        }
    }
}

struct CaptureWorker {
    device: Option<v4l::Device>,
    config: CameraConfig,
    shared: Arc<Shared>,
    requests: Receiver<Request>,
    hot_pixels: Option<HotPixelMap>,
    mask_dir: PathBuf,
    failure_count: u32,
    recovery_attempts: u32,
}

impl CaptureWorker {
    fn run(&mut self) {
        loop {
            match self.handle_requests() {
                ControlFlow::Stop => break,
                ControlFlow::Continue => {}
            }
            if let Err(e) = self.integrate_once() {
                match e {
                    CameraError::Unresponsive { attempts } => {
                        error!("camera unresponsive after {attempts} recovery attempts");
                        self.shared.fatal.store(true, Ordering::SeqCst);
                        break;
                    }
                    other => warn!("capture round failed: {other}"),
                }
            }
        }
        info!("camera capture loop exited");
    }

    fn handle_requests(&mut self) -> ControlFlow {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::Stop => return ControlFlow::Stop,
                Request::SetMode(mode) => {
                    self.config.mode = mode;
                    self.reopen_device();
                }
                Request::SetFrameSize(w, h) => {
                    self.config.width = w;
                    self.config.height = h;
                    self.reopen_device();
                }
                Request::SetFps(fps) => {
                    self.config.fps = fps;
                    self.reopen_device();
                }
                Request::SetControl(name, value) => {
                    self.config
                        .controls
                        .retain(|(existing, _)| existing != &name);
                    self.config.controls.push((name.clone(), value));
                    if let Some(device) = &self.device {
                        if let Err(e) = v4l2::apply_control_by_name(device, &name, value) {
                            warn!("set_control {name} failed: {e}");
                        }
                    }
                }
                Request::SetIntegration(n) => {
                    self.update_status(|s| s.integrate_frames = n);
                }
                Request::SetChannelGains(r, g, b) => {
                    self.update_status(|s| s.channel_gains = (r, g, b));
                }
                Request::SetColor(color) => {
                    self.config.color = color;
                    self.update_status(|s| s.color = color);
                }
                Request::CaptureHotPixelMask {
                    dark_frames,
                    threshold,
                } => {
                    if let Err(e) = self.capture_hot_pixel_mask(dark_frames, threshold) {
                        warn!("hot pixel mask capture failed: {e}");
                    }
                }
                Request::LoadHotPixelMask => {
                    self.hot_pixels = load_mask(&self.mask_dir);
                    self.publish_hot_pixel_count();
                }
                Request::ClearHotPixelMask => {
                    let path = mask_path(&self.mask_dir);
                    if path.exists() {
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!("failed to remove {}: {e}", path.display());
                        }
                    }
                    self.hot_pixels = None;
                    self.publish_hot_pixel_count();
                }
            }
        }
        ControlFlow::Continue
    }

    fn update_status(&self, f: impl FnOnce(&mut CameraStatus)) {
        f(&mut self.shared.status.lock().unwrap());
    }

    fn publish_hot_pixel_count(&self) {
        let count = self.hot_pixels.as_ref().map(HotPixelMap::len).unwrap_or(0);
        self.update_status(|s| s.hot_pixel_count = count);
    }

    fn reopen_device(&mut self) {
        self.device = None;
        match v4l2::open_device(&self.config) {
            Ok((device, width, height)) => {
                self.device = Some(device);
                self.update_status(|s| {
                    s.mode = self.config.mode;
                    s.width = width;
                    s.height = height;
                    s.fps = self.config.fps;
                });
            }
            Err(e) => warn!("camera reconfigure failed: {e}"),
        }
    }

    /// One integration round: capture N frames, accumulate, finalize and
    /// publish.
    fn integrate_once(&mut self) -> CameraResult<()> {
        let (n, gains) = {
            let status = self.shared.status.lock().unwrap();
            (status.integrate_frames.max(1), status.channel_gains)
        };
        let (width, height) = {
            let status = self.shared.status.lock().unwrap();
            (status.width as usize, status.height as usize)
        };

        let started = Instant::now();
        let mut acc = FrameAccumulator::new(width, height, self.config.color);
        for _ in 0..n {
            match self.capture_decoded() {
                Ok(frame) => {
                    acc.add(&frame)?;
                }
                Err(CameraError::Unresponsive { attempts }) => {
                    return Err(CameraError::Unresponsive { attempts });
                }
                Err(e) => {
                    warn!("frame capture failed mid-integration: {e}");
                    break;
                }
            }
        }

        if let Some(result) = acc.finalize(gains, self.hot_pixels.as_ref()) {
            let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let frame = match result {
                DecodedFrame::Gray(a) => Frame::new_gray(a, seq),
                DecodedFrame::Color(a) => Frame::new_color(a, seq),
            };
            *self.shared.frame.lock().unwrap() = Some(Arc::new(frame));
            self.update_status(|s| s.last_frame_time = started.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Capture one decoded frame, counting failures and escalating to
    /// device recovery.
    fn capture_decoded(&mut self) -> CameraResult<DecodedFrame> {
        loop {
            let (width, height) = {
                let status = self.shared.status.lock().unwrap();
                (status.width, status.height)
            };
            let attempt = match self.device.as_ref() {
                Some(device) => v4l2::mmap_stream(device).and_then(|mut stream| {
                    v4l2::read_decoded(
                        &mut stream,
                        self.config.mode,
                        width,
                        height,
                        self.config.color,
                    )
                }),
                None => Err(CameraError::ReadFailed),
            };
            match attempt {
                Ok(frame) => {
                    self.failure_count = 0;
                    return Ok(frame);
                }
                Err(e) => {
                    self.failure_count += 1;
                    warn!("no frame captured (failure #{}): {e}", self.failure_count);
                    if self.failure_count >= MAX_FAILURES {
                        self.attempt_recovery();
                    }
                    if self.recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
                        return Err(CameraError::Unresponsive {
                            attempts: self.recovery_attempts,
                        });
                    }
                }
            }
        }
    }

    fn attempt_recovery(&mut self) {
        self.recovery_attempts += 1;
        warn!(
            "max failures reached, recovery attempt #{}",
            self.recovery_attempts
        );
        self.device = None;
        std::thread::sleep(Duration::from_secs(1));
        match v4l2::open_device(&self.config) {
            Ok((device, width, height)) => {
                info!("camera reopened after recovery");
                self.device = Some(device);
                self.update_status(|s| {
                    s.width = width;
                    s.height = height;
                });
                self.failure_count = 0;
                self.recovery_attempts = 0;
            }
            Err(e) => warn!("recovery attempt failed: {e}"),
        }
    }

    /// Average `dark_frames` grayscale captures, persist the dark frame as
    /// PNG and the detected hot pixels as the mask file.
    fn capture_hot_pixel_mask(&mut self, dark_frames: u32, threshold: f64) -> CameraResult<()> {
        info!("capturing {dark_frames} dark frames for hot pixel detection");
        let mut frames: Vec<Array2<u8>> = Vec::with_capacity(dark_frames as usize);
        for _ in 0..dark_frames.max(1) {
            let (width, height) = {
                let status = self.shared.status.lock().unwrap();
                (status.width, status.height)
            };
            let device = self.device.as_ref().ok_or(CameraError::ReadFailed)?;
            let mut stream = v4l2::mmap_stream(device)?;
            match v4l2::read_decoded(&mut stream, self.config.mode, width, height, false)? {
                DecodedFrame::Gray(a) => frames.push(a),
                DecodedFrame::Color(_) => unreachable!("gray capture requested"),
            }
        }

        let avg = average_frames(&frames)
            .ok_or_else(|| CameraError::Decode("no dark frames captured".to_string()))?;
        save_dark_frame(&avg, &self.mask_dir.join("dark_frame_avg.png"))?;

        let pixels = detect_hot_pixels(&avg, threshold);
        info!("detected {} hot pixels", pixels.len());
        let map = HotPixelMap::new(pixels);
        map.save(&mask_path(&self.mask_dir))
            .map_err(|e| CameraError::Io(std::io::Error::other(e)))?;
        self.hot_pixels = Some(map);
        self.publish_hot_pixel_count();
        Ok(())
    }
}

enum ControlFlow {
    Continue,
    Stop,
}
