//! Mount bridge loop.
//!
//! Runs at ~20 Hz and does two jobs: keep the telemetry snapshot fresh
//! (RA/DEC every 4 s, PEC progress every 10 s, full info every 33 s) and
//! forward bytes between the mount and its side channels (Bluetooth serial,
//! TCP clients), so external planetarium software can talk to the mount
//! transparently.
//!
//! Telemetry polling is skipped while the link is paused (firmware upload)
//! or in quiet mode (calibration); byte forwarding uses the link's
//! try-variants so it never interleaves with an in-flight command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::MountLink;

const TICK: Duration = Duration::from_millis(50);
const RADEC_REFRESH: Duration = Duration::from_secs(4);
const PEC_REFRESH: Duration = Duration::from_secs(10);
const INFO_REFRESH: Duration = Duration::from_secs(33);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A byte channel multiplexed onto the mount serial line.
pub trait SidePort: Send + Sync {
    /// Bytes the external client wants to send to the mount; empty when
    /// nothing is pending.
    fn read_bytes(&self) -> Vec<u8>;
    /// Bytes the mount produced, fanned out to the client.
    fn write_bytes(&self, bytes: &[u8]);
}

/// Background bridge thread handle.
pub struct MountBridge {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MountBridge {
    pub fn start(link: Arc<MountLink>, side_ports: Vec<Arc<dyn SidePort>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("mount-bridge".to_string())
            .spawn(move || run_bridge(link, side_ports, stop_flag))
            .expect("failed to spawn mount bridge thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Ask the loop to exit and join it, bounded at 10 s.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("mount bridge thread did not stop in time");
            }
        }
    }
}

impl Drop for MountBridge {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn run_bridge(link: Arc<MountLink>, side_ports: Vec<Arc<dyn SidePort>>, stop: Arc<AtomicBool>) {
    let mut last_radec = Instant::now() - RADEC_REFRESH;
    let mut last_pec = Instant::now();
    let mut last_info = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        if link.bridge_paused() {
            std::thread::sleep(TICK);
            continue;
        }

        if !link.quiet() {
            let now = Instant::now();
            if now.duration_since(last_info) >= INFO_REFRESH {
                last_info = now;
                last_pec = now;
                last_radec = now;
                if let Err(e) = link.get_info() {
                    warn!("info refresh failed: {e}");
                }
            } else if now.duration_since(last_pec) >= PEC_REFRESH {
                last_pec = now;
                last_radec = now;
                if let Err(e) = refresh_radec(&link) {
                    warn!("RA/DEC refresh failed: {e}");
                } else if let Err(e) = link.get_pec_position() {
                    warn!("PEC refresh failed: {e}");
                }
            } else if now.duration_since(last_radec) >= RADEC_REFRESH {
                last_radec = now;
                if let Err(e) = refresh_radec(&link) {
                    warn!("RA/DEC refresh failed: {e}");
                }
            }
        }

        // Client -> mount.
        for port in &side_ports {
            let bytes = port.read_bytes();
            if bytes.is_empty() {
                continue;
            }
            debug!("bridge forwarding {} client bytes to mount", bytes.len());
            match link.try_write_raw(&bytes) {
                Ok(true) => {}
                Ok(false) => debug!("mount busy, dropping {} client bytes", bytes.len()),
                Err(e) => warn!("bridge write failed: {e}"),
            }
        }

        // Mount -> clients.
        match link.try_read_pending() {
            Ok(bytes) if !bytes.is_empty() => {
                debug!("bridge fanning out {} mount bytes", bytes.len());
                for port in &side_ports {
                    port.write_bytes(&bytes);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("bridge read failed: {e}"),
        }

        std::thread::sleep(TICK);
    }
}

fn refresh_radec(link: &MountLink) -> super::MountResult<()> {
    link.get_ra()?;
    link.get_dec()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakePort {
        inbound: Mutex<Vec<u8>>,
        outbound: Mutex<Vec<u8>>,
    }

    impl SidePort for FakePort {
        fn read_bytes(&self) -> Vec<u8> {
            std::mem::take(&mut *self.inbound.lock().unwrap())
        }

        fn write_bytes(&self, bytes: &[u8]) {
            self.outbound.lock().unwrap().extend_from_slice(bytes);
        }
    }

    #[test]
    fn side_port_contract() {
        let port = FakePort {
            inbound: Mutex::new(b":GR#".to_vec()),
            outbound: Mutex::new(Vec::new()),
        };
        assert_eq!(port.read_bytes(), b":GR#");
        assert!(port.read_bytes().is_empty());
        port.write_bytes(b"12:34:56#");
        assert_eq!(*port.outbound.lock().unwrap(), b"12:34:56#");
    }
}
