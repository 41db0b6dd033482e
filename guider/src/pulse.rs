//! Pulse worker pool.
//!
//! PULSE-mode corrections block for the pulse duration (move, hold,
//! stop), so they run on a small worker pool instead of the guide thread.
//! At most one pulse may be outstanding per axis; a new pulse is rejected,
//! never queued, while one is pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::warn;

use crate::{MountCommander, PulseDirection};

const WORKERS: usize = 4;

/// Mount axis a pulse acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Ra,
    Dec,
}

impl PulseDirection {
    pub fn axis(self) -> Axis {
        match self {
            PulseDirection::East | PulseDirection::West => Axis::Ra,
            PulseDirection::North | PulseDirection::South => Axis::Dec,
        }
    }
}

struct Job {
    direction: PulseDirection,
    seconds: f64,
}

/// Fixed pool of pulse workers with per-axis exclusion.
pub struct PulsePool {
    mount: Arc<dyn MountCommander>,
    jobs: Sender<Job>,
    ra_outstanding: Arc<AtomicBool>,
    dec_outstanding: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl PulsePool {
    pub fn new(mount: Arc<dyn MountCommander>) -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(WORKERS);
        let ra_outstanding = Arc::new(AtomicBool::new(false));
        let dec_outstanding = Arc::new(AtomicBool::new(false));

        let workers = (0..WORKERS)
            .map(|i| {
                let rx = rx.clone();
                let mount = Arc::clone(&mount);
                let ra = Arc::clone(&ra_outstanding);
                let dec = Arc::clone(&dec_outstanding);
                std::thread::Builder::new()
                    .name(format!("pulse-worker-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            if let Err(e) = mount.correction_pulse(job.direction, job.seconds) {
                                warn!("pulse {:?} failed: {e}", job.direction);
                            }
                            match job.direction.axis() {
                                Axis::Ra => ra.store(false, Ordering::SeqCst),
                                Axis::Dec => dec.store(false, Ordering::SeqCst),
                            }
                        }
                    })
                    .expect("failed to spawn pulse worker")
            })
            .collect();

        Self {
            mount,
            jobs: tx,
            ra_outstanding,
            dec_outstanding,
            workers,
        }
    }

    /// True while any pulse is still in flight on either axis.
    pub fn any_outstanding(&self) -> bool {
        self.ra_outstanding.load(Ordering::SeqCst) || self.dec_outstanding.load(Ordering::SeqCst)
    }

    /// Submit one pulse. Returns `false` (and does nothing) when a pulse
    /// is already outstanding on that axis.
    pub fn submit(&self, direction: PulseDirection, seconds: f64) -> bool {
        let flag = match direction.axis() {
            Axis::Ra => &self.ra_outstanding,
            Axis::Dec => &self.dec_outstanding,
        };
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.jobs.try_send(Job { direction, seconds }).is_err() {
            flag.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn mount(&self) -> &Arc<dyn MountCommander> {
        &self.mount
    }
}

impl Drop for PulsePool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        let (tx, _) = bounded(1);
        drop(std::mem::replace(&mut self.jobs, tx));
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingMount {
        pulses: Mutex<Vec<(PulseDirection, f64)>>,
        delay: Duration,
    }

    impl MountCommander for RecordingMount {
        fn correction_pulse(&self, direction: PulseDirection, seconds: f64) -> Result<(), String> {
            std::thread::sleep(self.delay);
            self.pulses.lock().unwrap().push((direction, seconds));
            Ok(())
        }

        fn start_movement(&self, _: i32, _: i32) -> Result<(), String> {
            Ok(())
        }

        fn stop_all(&self) -> Result<(), String> {
            Ok(())
        }

        fn set_guide_rate(&self) -> Result<(), String> {
            Ok(())
        }

        fn set_backlash(&self, _: u16, _: u16) -> Result<(), String> {
            Ok(())
        }

        fn set_quiet(&self, _: bool) {}

        fn quiet(&self) -> bool {
            false
        }

        fn declination_deg(&self) -> f64 {
            0.0
        }
    }

    #[test]
    fn pulse_runs_and_clears_outstanding_flag() {
        let mount = Arc::new(RecordingMount {
            pulses: Mutex::new(Vec::new()),
            delay: Duration::from_millis(10),
        });
        let pool = PulsePool::new(mount.clone());

        assert!(pool.submit(PulseDirection::West, 0.4));
        assert!(pool.any_outstanding());

        for _ in 0..100 {
            if !pool.any_outstanding() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!pool.any_outstanding());
        assert_eq!(
            *mount.pulses.lock().unwrap(),
            vec![(PulseDirection::West, 0.4)]
        );
    }

    #[test]
    fn second_pulse_on_same_axis_is_rejected() {
        let mount = Arc::new(RecordingMount {
            pulses: Mutex::new(Vec::new()),
            delay: Duration::from_millis(200),
        });
        let pool = PulsePool::new(mount.clone());

        assert!(pool.submit(PulseDirection::East, 0.1));
        // East and West share the RA axis.
        assert!(!pool.submit(PulseDirection::West, 0.1));
        // The DEC axis is still free.
        assert!(pool.submit(PulseDirection::North, 0.1));

        for _ in 0..100 {
            if !pool.any_outstanding() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(mount.pulses.lock().unwrap().len(), 2);
    }
}
