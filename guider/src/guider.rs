//! Guiding state machine and cadence loop.
//!
//! One guider owns the tracked-star set, the configuration snapshot
//! discipline and the guide-output dispatch. The cadence loop wakes every
//! 10 ms and runs an iteration when the guide interval has elapsed and a
//! new frame is available; calibration suspends it through the
//! `calibrating` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ndarray::{Array2, Array3};
use tracing::{debug, info, warn};

use shared::{Frame, StatusLog};

use crate::analyzer::{detect_stars, AnalyzerParams};
use crate::config::{Correction, GuideConfig, GuideMethod, RotationModel};
use crate::drift::compute_correction;
use crate::pid::PidController;
use crate::pulse::PulsePool;
use crate::{FrameSource, GuideError, GuideResult, MountCommander, PulseDirection};

const LOOP_TICK: Duration = Duration::from_millis(10);

struct State {
    /// Reference centroids; only an explicit acquire replaces them.
    tracked: Vec<(f64, f64)>,
    /// Last observed centroid per tracked star.
    current: Vec<(f64, f64)>,
    config: GuideConfig,
    rotation: RotationModel,
    guiding: bool,
    star_locked: bool,
    last_correction: Correction,
    ra_pid: PidController,
    dec_pid: PidController,
    focus_metric: f64,
    last_loop_time: f64,
    preview: Option<Array3<u8>>,
    threshold: Option<Array2<u8>>,
}

/// Read-only view of the guider state for the web surface.
#[derive(Debug, Clone)]
pub struct GuiderSnapshot {
    pub tracked: Vec<(f64, f64)>,
    pub current: Vec<(f64, f64)>,
    pub config: GuideConfig,
    pub rotation: RotationModel,
    pub guiding: bool,
    pub calibrating: bool,
    pub star_locked: bool,
    pub last_correction: Correction,
    pub focus_metric: f64,
    pub last_loop_time: f64,
    pub pid_gains: (f64, f64, f64),
}

/// The guiding core.
pub struct Guider {
    state: Mutex<State>,
    mount: Arc<dyn MountCommander>,
    frames: Arc<dyn FrameSource>,
    pulses: PulsePool,
    log: Arc<StatusLog>,
    calibrating: AtomicBool,
    data_ready: AtomicBool,
}

impl Guider {
    pub fn new(
        mount: Arc<dyn MountCommander>,
        frames: Arc<dyn FrameSource>,
        log: Arc<StatusLog>,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                tracked: Vec::new(),
                current: Vec::new(),
                config: GuideConfig::default(),
                rotation: RotationModel::default(),
                guiding: false,
                star_locked: false,
                last_correction: Correction::zero(),
                ra_pid: PidController::default(),
                dec_pid: PidController::default(),
                focus_metric: 0.0,
                last_loop_time: 0.0,
                preview: None,
                threshold: None,
            }),
            pulses: PulsePool::new(Arc::clone(&mount)),
            mount,
            frames,
            log,
            calibrating: AtomicBool::new(false),
            data_ready: AtomicBool::new(false),
        }
    }

    // ---- state access ----

    pub fn snapshot(&self) -> GuiderSnapshot {
        let state = self.state.lock().unwrap();
        GuiderSnapshot {
            tracked: state.tracked.clone(),
            current: state.current.clone(),
            config: state.config.clone(),
            rotation: state.rotation.clone(),
            guiding: state.guiding,
            calibrating: self.calibrating.load(Ordering::SeqCst),
            star_locked: state.star_locked,
            last_correction: state.last_correction,
            focus_metric: state.focus_metric,
            last_loop_time: state.last_loop_time,
            pid_gains: (state.ra_pid.kp, state.ra_pid.ki, state.ra_pid.kd),
        }
    }

    pub fn preview_image(&self) -> Option<Array3<u8>> {
        self.state.lock().unwrap().preview.clone()
    }

    pub fn threshold_image(&self) -> Option<Array2<u8>> {
        self.state.lock().unwrap().threshold.clone()
    }

    /// True once per published analysis round; consuming it arms the next
    /// WebSocket push.
    pub fn take_data_ready(&self) -> bool {
        self.data_ready.swap(false, Ordering::SeqCst)
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating.load(Ordering::SeqCst)
    }

    pub(crate) fn set_calibrating(&self, calibrating: bool) {
        self.calibrating.store(calibrating, Ordering::SeqCst);
    }

    pub(crate) fn mount(&self) -> &Arc<dyn MountCommander> {
        &self.mount
    }

    pub(crate) fn frames(&self) -> &Arc<dyn FrameSource> {
        &self.frames
    }

    pub(crate) fn status_log(&self) -> &Arc<StatusLog> {
        &self.log
    }

    // ---- configuration ----

    pub fn config(&self) -> GuideConfig {
        self.state.lock().unwrap().config.clone()
    }

    pub fn rotation(&self) -> RotationModel {
        self.state.lock().unwrap().rotation.clone()
    }

    pub fn set_gray_threshold(&self, value: u8) {
        self.state.lock().unwrap().config.gray_threshold = value;
    }

    pub fn set_max_drift(&self, value: f64) -> GuideResult<()> {
        let value = GuideConfig::validate_max_drift(value)?;
        self.state.lock().unwrap().config.max_drift = value;
        Ok(())
    }

    pub fn set_star_size(&self, value: f64) -> GuideResult<()> {
        let value = GuideConfig::validate_star_size(value)?;
        self.state.lock().unwrap().config.star_size = value;
        Ok(())
    }

    pub fn set_rotation_angle(&self, value: f64) -> GuideResult<()> {
        let value = RotationModel::validate_rotation_angle(value)?;
        self.state.lock().unwrap().rotation.rotation_angle = value;
        Ok(())
    }

    pub fn set_pixel_scale(&self, value: f64) -> GuideResult<()> {
        let value = RotationModel::validate_pixel_scale(value)?;
        self.state.lock().unwrap().rotation.pixel_scale = value;
        Ok(())
    }

    pub fn set_guide_interval(&self, value: f64) -> GuideResult<()> {
        let value = GuideConfig::validate_guide_interval(value)?;
        self.state.lock().unwrap().config.guide_interval = value;
        Ok(())
    }

    pub fn set_guide_pulse(&self, value: f64) -> GuideResult<()> {
        let value = GuideConfig::validate_guide_pulse(value)?;
        self.state.lock().unwrap().config.guide_pulse = value;
        Ok(())
    }

    pub fn set_max_distance(&self, value: f64) -> GuideResult<()> {
        let value = GuideConfig::validate_max_distance(value)?;
        self.state.lock().unwrap().config.max_distance = value;
        Ok(())
    }

    pub fn set_guide_method(&self, method: GuideMethod) {
        self.state.lock().unwrap().config.method = method;
    }

    pub fn set_pid_gains(&self, kp: f64, ki: f64, kd: f64) {
        let mut state = self.state.lock().unwrap();
        state.ra_pid.set_gains(kp, ki, kd);
        state.dec_pid.set_gains(kp, ki, kd);
    }

    /// Replace config and rotation wholesale (settings restore at
    /// startup).
    pub fn restore(&self, config: GuideConfig, rotation: RotationModel, pid: (f64, f64, f64)) {
        let mut state = self.state.lock().unwrap();
        state.config = config;
        state.rotation = rotation;
        state.ra_pid.set_gains(pid.0, pid.1, pid.2);
        state.dec_pid.set_gains(pid.0, pid.1, pid.2);
    }

    /// Calibration writes the full model it derived.
    pub(crate) fn set_rotation_model(&self, rotation: RotationModel) {
        self.state.lock().unwrap().rotation = rotation;
    }

    // ---- tracked stars ----

    fn find_nearby(tracked: &[(f64, f64)], centroid: (f64, f64), max_distance: f64) -> Option<usize> {
        tracked.iter().position(|t| {
            ((centroid.0 - t.0).powi(2) + (centroid.1 - t.1).powi(2)).sqrt() < max_distance
        })
    }

    /// Acquire a star: detect near the hint (or the brightest star) and
    /// append it to the tracked set unless one is already tracked there.
    pub fn acquire(&self, hint: Option<(f64, f64)>) -> GuideResult<(f64, f64)> {
        let (params, max_distance, tracked) = {
            let state = self.state.lock().unwrap();
            (
                analyzer_params(&state.config),
                state.config.max_distance,
                state.tracked.clone(),
            )
        };

        if let Some(hint) = hint {
            if Self::find_nearby(&tracked, hint, max_distance).is_some() {
                let status = format!("Star already tracked at ({:.1}, {:.1})", hint.0, hint.1);
                self.log.record(status);
                return Err(GuideError::AlreadyTracked(hint.0, hint.1));
            }
        }

        let frame = self.frames.current_frame().ok_or(GuideError::NoFrame)?;
        let gray = frame.to_gray();
        let hints_buf = hint.map(|h| vec![h]);
        let analysis = detect_stars(&gray, hints_buf.as_deref(), &params);

        match analysis.centroids.first().copied().flatten() {
            Some(centroid) => {
                let mut state = self.state.lock().unwrap();
                state.tracked.push(centroid);
                state.current.push(centroid);
                state.focus_metric = analysis.focus_metric;
                state.preview = analysis.preview;
                state.threshold = Some(analysis.threshold);
                drop(state);
                let status = format!("ADDED STAR at ({:.4}, {:.4})", centroid.0, centroid.1);
                info!("{status}");
                self.log.record(status);
                Ok(centroid)
            }
            None => {
                let status = match hint {
                    Some(h) => format!("NO STAR DETECTED at ({:.1}, {:.1})", h.0, h.1),
                    None => "NO STAR DETECTED".to_string(),
                };
                info!("{status}");
                self.log.record(status);
                Err(GuideError::NoStar)
            }
        }
    }

    /// Remove the tracked star within `max_distance` of `near`.
    pub fn remove_star(&self, near: (f64, f64)) -> GuideResult<()> {
        let mut state = self.state.lock().unwrap();
        let max_distance = state.config.max_distance;
        match Self::find_nearby(&state.tracked, near, max_distance) {
            Some(index) => {
                let removed = state.tracked.remove(index);
                state.current.remove(index);
                drop(state);
                let status = format!("REMOVED STAR at ({:.4}, {:.4})", removed.0, removed.1);
                self.log.record(status);
                Ok(())
            }
            None => {
                drop(state);
                self.log.record(format!(
                    "STAR NOT FOUND IN TRACKED STARS at ({:.1}, {:.1})",
                    near.0, near.1
                ));
                Err(GuideError::NotTracked(near.0, near.1))
            }
        }
    }

    pub fn remove_all_stars(&self) {
        let mut state = self.state.lock().unwrap();
        state.tracked.clear();
        state.current.clear();
        state.star_locked = false;
        drop(state);
        self.log.record("REMOVED ALL TRACKED STARS");
    }

    /// First tracked star's reference centroid, for calibration.
    pub fn first_tracked(&self) -> Option<(f64, f64)> {
        self.state.lock().unwrap().tracked.first().copied()
    }

    // ---- guiding on/off ----

    /// Toggling guiding on resets both PID controllers; toggling it off
    /// stops all mount motion.
    pub fn enable_guiding(&self, enable: bool) -> GuideResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if enable && !state.guiding {
                state.ra_pid.reset();
                state.dec_pid.reset();
            }
            state.guiding = enable;
        }
        if !enable {
            self.mount.stop_all().map_err(GuideError::Mount)?;
        }
        self.log
            .record(format!("GUIDING {}", if enable { "enabled" } else { "disabled" }));
        Ok(())
    }

    pub fn enable_dec_guiding(&self, enable: bool) {
        self.state.lock().unwrap().config.dec_guiding = enable;
    }

    pub fn guiding(&self) -> bool {
        self.state.lock().unwrap().guiding
    }

    pub(crate) fn set_guiding_flag(&self, guiding: bool) {
        self.state.lock().unwrap().guiding = guiding;
    }

    // ---- the guide iteration ----

    /// One guide iteration over `frame`: detect near the current
    /// centroids, reduce the per-star displacements to a correction and
    /// hand it to the selected guide output. Configuration is snapshotted
    /// once at the top; changes apply from the next iteration.
    pub fn guide_iteration(&self, frame: &Frame) {
        let (config, rotation, tracked, current, guiding) = {
            let state = self.state.lock().unwrap();
            (
                state.config.clone(),
                state.rotation.clone(),
                state.tracked.clone(),
                state.current.clone(),
                state.guiding,
            )
        };

        if tracked.is_empty() {
            // Acquisition mode: the largest star seeds the tracked set.
            let _ = self.acquire(None);
            self.data_ready.store(true, Ordering::SeqCst);
            return;
        }

        let gray = frame.to_gray();
        let params = analyzer_params(&config);
        let analysis = detect_stars(&gray, Some(&current), &params);

        let any_found = analysis.centroids.iter().any(Option::is_some);

        if !any_found {
            {
                let mut state = self.state.lock().unwrap();
                state.star_locked = false;
                state.last_correction = Correction::zero();
                state.preview = analysis.preview;
                state.threshold = Some(analysis.threshold);
                state.focus_metric = analysis.focus_metric;
            }
            if guiding {
                self.emit_zero_correction(&config);
            }
            let status = "LOST TRACKING: Tracked stars not detected.".to_string();
            debug!("{status}");
            self.log.record(status);
            self.data_ready.store(true, Ordering::SeqCst);
            return;
        }

        // Per-star displacements for the slots that were found.
        let displacements: Vec<(f64, f64)> = analysis
            .centroids
            .iter()
            .zip(&tracked)
            .filter_map(|(obs, reference)| {
                obs.map(|o| (o.0 - reference.0, o.1 - reference.1))
            })
            .collect();

        let mut correction =
            compute_correction(&displacements, &rotation, self.mount.declination_deg());

        if guiding {
            self.apply_guide_output(&config, &mut correction);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.star_locked = true;
            state.last_correction = correction;
            state.focus_metric = analysis.focus_metric;
            state.preview = analysis.preview;
            state.threshold = Some(analysis.threshold);
            // Found slots replace the current centroid; missing slots keep
            // their previous value.
            for (slot, obs) in state.current.iter_mut().zip(&analysis.centroids) {
                if let Some(o) = obs {
                    *slot = *o;
                }
            }
        }

        let status = format!(
            "TRACKING {} stars, ra px:{:.1}, dec px:{:.1}, ra arcsec:{:.1}, dec arcsec:{:.1}",
            displacements.len(),
            correction.ra_px,
            correction.dec_px,
            correction.ra_arcsec,
            correction.dec_arcsec,
        );
        self.log.record(status);
        self.data_ready.store(true, Ordering::SeqCst);
    }

    /// Zero-valued correction to halt motion (speed-based methods send an
    /// explicit zero-speed command; pulse mode has nothing to cancel).
    fn emit_zero_correction(&self, config: &GuideConfig) {
        match config.method {
            GuideMethod::Pulse => {}
            GuideMethod::Speed | GuideMethod::Pid => {
                if let Err(e) = self.mount.start_movement(0, 0) {
                    warn!("zero correction failed: {e}");
                }
            }
        }
    }

    /// Dispatch to the selected guide-output method, filling in the pulse
    /// directions or speeds the method chose.
    fn apply_guide_output(&self, config: &GuideConfig, correction: &mut Correction) {
        match config.method {
            GuideMethod::Pulse => self.guide_pulse(config, correction),
            GuideMethod::Speed => self.guide_speed(config, correction),
            GuideMethod::Pid => self.guide_pid(config, correction),
        }
    }

    /// Positive RA error (eastward drift) is cancelled by a westward
    /// pulse; same polarity on DEC with south.
    fn guide_pulse(&self, config: &GuideConfig, correction: &mut Correction) {
        let ra_err = correction.ra_arcsec;
        let dec_err = correction.dec_arcsec;

        correction.ra = if ra_err > config.max_drift {
            -1
        } else if ra_err < -config.max_drift {
            1
        } else {
            0
        };
        correction.dec = if !config.dec_guiding {
            0
        } else if dec_err > config.max_drift {
            -1
        } else if dec_err < -config.max_drift {
            1
        } else {
            0
        };

        if correction.ra == 0 && correction.dec == 0 {
            return;
        }

        // A still-outstanding pulse skips the whole iteration's output.
        if self.pulses.any_outstanding() {
            debug!("pulse still in progress, skipping correction");
            correction.ra = 0;
            correction.dec = 0;
            return;
        }

        if correction.ra != 0 {
            let direction = if correction.ra == -1 {
                PulseDirection::West
            } else {
                PulseDirection::East
            };
            self.pulses.submit(direction, config.guide_pulse);
        }
        if correction.dec != 0 {
            let direction = if correction.dec == -1 {
                PulseDirection::South
            } else {
                PulseDirection::North
            };
            self.pulses.submit(direction, config.guide_pulse);
        }
    }

    fn guide_speed(&self, config: &GuideConfig, correction: &mut Correction) {
        let ra_speed = (-correction.ra_arcsec) as i32;
        let mut dec_speed = (-correction.dec_arcsec) as i32;
        let ra_speed = ra_speed.clamp(-15, 15);
        dec_speed = dec_speed.clamp(-15, 15);
        if !config.dec_guiding {
            dec_speed = 0;
        }
        correction.ra_speed = ra_speed;
        correction.dec_speed = dec_speed;
        if let Err(e) = self.mount.start_movement(ra_speed, dec_speed) {
            warn!("speed correction failed: {e}");
        }
    }

    fn guide_pid(&self, config: &GuideConfig, correction: &mut Correction) {
        let (ra_speed, dec_speed) = {
            let mut state = self.state.lock().unwrap();
            let ra = state.ra_pid.compute(-correction.ra_arcsec);
            let dec = state.dec_pid.compute(-correction.dec_arcsec);
            (ra, dec)
        };
        let ra_speed = (ra_speed.clamp(-99.0, 99.0)) as i32;
        let mut dec_speed = (dec_speed.clamp(-99.0, 99.0)) as i32;
        if !config.dec_guiding {
            dec_speed = 0;
        }
        correction.ra_speed = ra_speed;
        correction.dec_speed = dec_speed;
        if let Err(e) = self.mount.start_movement(ra_speed, dec_speed) {
            warn!("pid correction failed: {e}");
        }
    }

    // ---- cadence loop ----

    /// Run the guide loop until `stop` is raised. Wakes every ~10 ms and
    /// runs an iteration when the guide interval has elapsed and a new
    /// frame has been published; sleeps through calibration.
    pub fn run_loop(&self, stop: Arc<AtomicBool>) {
        let mut last_iteration = Instant::now();
        let mut last_seq = 0u64;

        info!("guide loop started");
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(LOOP_TICK);

            if self.calibrating.load(Ordering::SeqCst) {
                continue;
            }

            let interval = {
                let state = self.state.lock().unwrap();
                Duration::from_secs_f64(state.config.guide_interval)
            };
            if last_iteration.elapsed() < interval {
                continue;
            }

            let frame = match self.frames.current_frame() {
                Some(frame) if frame.seq != last_seq => frame,
                _ => continue,
            };
            last_seq = frame.seq;

            let started = Instant::now();
            let loop_time = last_iteration.elapsed().as_secs_f64();
            last_iteration = started;

            self.guide_iteration(&frame);
            self.state.lock().unwrap().last_loop_time = (loop_time * 100.0).round() / 100.0;
        }
        info!("guide loop stopped");
    }
}

pub(crate) fn analyzer_params(config: &GuideConfig) -> AnalyzerParams {
    AnalyzerParams {
        gray_threshold: config.gray_threshold,
        star_size: config.star_size,
        max_distance: config.max_distance,
    }
}
