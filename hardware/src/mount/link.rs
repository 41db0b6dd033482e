//! Serial link to the mount controller.
//!
//! One command is in flight at a time: the port lives behind a mutex and
//! compound operations (`goto`, `sync_to`, PEC upload, firmware upload)
//! hold it across their whole command sequence, so bridge traffic can never
//! interleave with a half-finished exchange.
//!
//! On a serial failure the link closes the port, optionally rebinds the
//! USB device through sysfs, reopens and retries the command once; when
//! that fails too the caller gets `MountError::ConnectionFailed`.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, info, warn};

use shared::conversions::{deg_to_lx200_dec, deg_to_lx200_ra};

use super::command::{
    encode_pec_table, parse_hash_line, parse_info, parse_pec_table, parse_status_digit,
};
use super::{Command, Direction, MountError, MountResult, Pier, ResponseKind, ScopeInfo, SlewRate};

const BAUD_RATE: u32 = 9600;
/// Granularity of the response-polling reads.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Optional sysfs re-bind target used to power-cycle a wedged USB adapter.
#[derive(Debug, Clone)]
pub struct UsbRebind {
    /// Driver directory, e.g. `/sys/bus/usb/drivers/ftdi_sio`.
    pub driver_dir: PathBuf,
    /// Port identifier to write into `unbind`/`bind`, e.g. `1-1.2:1.0`.
    pub port_id: String,
}

struct LinkInner {
    port: Option<Box<dyn SerialPort>>,
    device: String,
    usb_rebind: Option<UsbRebind>,
}

/// Owns the serial channel to the mount.
pub struct MountLink {
    inner: Mutex<LinkInner>,
    info: Mutex<ScopeInfo>,
    /// Quiet mode suppresses the bridge's periodic telemetry polling.
    quiet: AtomicBool,
    /// Set while the firmware flasher owns the tty; the bridge sleeps.
    bridge_paused: AtomicBool,
}

fn open_port(device: &str) -> MountResult<Box<dyn SerialPort>> {
    let port = serialport::new(device, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(READ_SLICE)
        .open()?;
    Ok(port)
}

impl MountLink {
    /// Open the serial device and return the link.
    pub fn connect(device: &str, usb_rebind: Option<UsbRebind>) -> MountResult<Self> {
        let port = open_port(device)?;
        info!("mount serial connection opened on {device}");
        Ok(Self {
            inner: Mutex::new(LinkInner {
                port: Some(port),
                device: device.to_string(),
                usb_rebind,
            }),
            info: Mutex::new(ScopeInfo::default()),
            quiet: AtomicBool::new(false),
            bridge_paused: AtomicBool::new(false),
        })
    }

    pub fn quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::SeqCst);
    }

    pub fn bridge_paused(&self) -> bool {
        self.bridge_paused.load(Ordering::SeqCst)
    }

    /// Latest telemetry snapshot (updated by queries and the bridge).
    pub fn scope_info(&self) -> ScopeInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn update_scope_info(&self, f: impl FnOnce(&mut ScopeInfo)) {
        f(&mut self.info.lock().unwrap());
    }

    /// Declination in degrees from the cached telemetry.
    pub fn dec_deg(&self) -> f64 {
        self.info.lock().unwrap().dec_deg()
    }

    // ---- command execution ----

    /// Execute one command, reconnecting and retrying once on I/O failure.
    pub fn execute(&self, cmd: &Command) -> MountResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        self.execute_locked(&mut inner, cmd)
    }

    /// Execute a sequence atomically with respect to other port users.
    pub fn execute_seq(&self, cmds: &[Command]) -> MountResult<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        cmds.iter()
            .map(|c| self.execute_locked(&mut inner, c))
            .collect()
    }

    fn execute_locked(&self, inner: &mut LinkInner, cmd: &Command) -> MountResult<Vec<u8>> {
        match Self::transact(inner, cmd) {
            Err(MountError::Io(e)) => {
                warn!("serial failure ({e}), attempting reconnect");
                Self::reconnect(inner)?;
                Self::transact(inner, cmd)
            }
            other => other,
        }
    }

    fn transact(inner: &mut LinkInner, cmd: &Command) -> MountResult<Vec<u8>> {
        let port = inner
            .port
            .as_mut()
            .ok_or_else(|| MountError::ConnectionFailed("port not open".to_string()))?;

        debug!("mount send {:?}", String::from_utf8_lossy(&cmd.bytes));
        port.write_all(&cmd.bytes)?;
        port.flush()?;

        if cmd.response == ResponseKind::None {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + cmd.timeout;
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        while !cmd.response.is_complete(&reply) {
            if Instant::now() >= deadline {
                return Err(MountError::Timeout);
            }
            match port.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => reply.push(byte[0]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("mount recv {:?}", String::from_utf8_lossy(&reply));
        Ok(reply)
    }

    fn reconnect(inner: &mut LinkInner) -> MountResult<()> {
        inner.port = None;
        if let Some(rebind) = &inner.usb_rebind {
            let unbind = rebind.driver_dir.join("unbind");
            let bind = rebind.driver_dir.join("bind");
            if let Err(e) = std::fs::write(&unbind, &rebind.port_id) {
                warn!("usb unbind failed: {e}");
            }
            std::thread::sleep(Duration::from_millis(500));
            if let Err(e) = std::fs::write(&bind, &rebind.port_id) {
                warn!("usb bind failed: {e}");
            }
            std::thread::sleep(Duration::from_millis(500));
        }
        match open_port(&inner.device) {
            Ok(port) => {
                info!("mount serial connection reopened on {}", inner.device);
                inner.port = Some(port);
                Ok(())
            }
            Err(e) => Err(MountError::ConnectionFailed(format!(
                "reopen of {} failed: {e}",
                inner.device
            ))),
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.port = None;
        info!("mount serial connection closed");
    }

    // ---- raw access for the bridge ----

    /// Forward raw client bytes to the mount; returns `false` when a
    /// command currently owns the port.
    pub fn try_write_raw(&self, bytes: &[u8]) -> MountResult<bool> {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(false),
        };
        if let Some(port) = inner.port.as_mut() {
            port.write_all(bytes)?;
            port.flush()?;
        }
        Ok(true)
    }

    /// Drain any unsolicited bytes waiting on the port; empty when a
    /// command currently owns the port or nothing is pending.
    pub fn try_read_pending(&self) -> MountResult<Vec<u8>> {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(Vec::new()),
        };
        let port = match inner.port.as_mut() {
            Some(port) => port,
            None => return Ok(Vec::new()),
        };
        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        port.read_exact(&mut buf)?;
        Ok(buf)
    }

    // ---- typed operations ----

    pub fn send_move(&self, direction: Direction) -> MountResult<()> {
        self.execute(&Command::start_move(direction)).map(|_| ())
    }

    pub fn send_stop(&self, direction: Option<Direction>) -> MountResult<()> {
        self.execute(&Command::stop(direction)).map(|_| ())
    }

    pub fn send_rate(&self, rate: SlewRate) -> MountResult<()> {
        self.execute(&Command::set_rate(rate)).map(|_| ())
    }

    /// Move in `direction` for `seconds`, then stop that direction.
    ///
    /// The port lock is not held while sleeping, only around each of the
    /// two commands.
    pub fn send_correction(&self, direction: Direction, seconds: f64) -> MountResult<()> {
        self.send_move(direction)?;
        std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
        self.send_stop(Some(direction))
    }

    pub fn get_ra(&self) -> MountResult<String> {
        let reply = self.execute(&Command::get_ra())?;
        let ra = parse_hash_line(&reply)?;
        self.update_scope_info(|info| info.ra = ra.clone());
        Ok(ra)
    }

    pub fn get_dec(&self) -> MountResult<String> {
        let reply = self.execute(&Command::get_dec())?;
        let dec = parse_hash_line(&reply)?;
        self.update_scope_info(|info| info.dec = dec.clone());
        Ok(dec)
    }

    pub fn get_product(&self) -> MountResult<String> {
        let reply = self.execute(&Command::get_product())?;
        parse_hash_line(&reply)
    }

    pub fn get_version(&self) -> MountResult<String> {
        let reply = self.execute(&Command::get_version())?;
        parse_hash_line(&reply)
    }

    pub fn get_info(&self) -> MountResult<ScopeInfo> {
        let reply = self.execute(&Command::get_info())?;
        let info = parse_info(&reply)?;
        *self.info.lock().unwrap() = info.clone();
        Ok(info)
    }

    /// Set target coordinates and slew; all three commands execute under a
    /// single port acquisition and each must succeed.
    pub fn goto(&self, ra_deg: f64, dec_deg: f64) -> MountResult<()> {
        let ra = deg_to_lx200_ra(ra_deg);
        let dec = deg_to_lx200_dec(dec_deg);
        let replies = self.execute_seq(&[
            Command::set_ra(&ra),
            Command::set_dec(&dec),
            Command::slew(),
        ])?;
        if !parse_status_digit(&replies[0])? {
            return Err(MountError::Parse(format!("mount rejected RA {ra}")));
        }
        if !parse_status_digit(&replies[1])? {
            return Err(MountError::Parse(format!("mount rejected DEC {dec}")));
        }
        match replies[2].first() {
            Some(b'0') => Ok(()),
            Some(b'1') => {
                let reason = String::from_utf8_lossy(&replies[2][1..])
                    .trim_end_matches('#')
                    .trim()
                    .to_string();
                Err(MountError::SlewRefused(reason))
            }
            _ => Err(MountError::Parse(format!(
                "unexpected slew reply {:?}",
                String::from_utf8_lossy(&replies[2])
            ))),
        }
    }

    /// Set target coordinates and sync the mount onto them.
    pub fn sync_to(&self, ra_deg: f64, dec_deg: f64) -> MountResult<()> {
        let ra = deg_to_lx200_ra(ra_deg);
        let dec = deg_to_lx200_dec(dec_deg);
        let replies = self.execute_seq(&[
            Command::set_ra(&ra),
            Command::set_dec(&dec),
            Command::sync(),
        ])?;
        if !parse_status_digit(&replies[0])? || !parse_status_digit(&replies[1])? {
            return Err(MountError::Parse("mount rejected sync target".to_string()));
        }
        Ok(())
    }

    /// Start combined movement at per-axis speeds in arcsec per 10 s.
    pub fn send_start_movement_speed(&self, ra: i32, dec: i32) -> MountResult<()> {
        self.execute(&Command::start_movement(ra, dec)?).map(|_| ())
    }

    pub fn set_tracking(&self, enabled: bool) -> MountResult<()> {
        let result = self.execute(&Command::set_tracking(enabled)).map(|_| ());
        if result.is_ok() {
            self.update_scope_info(|info| info.tracking = enabled);
        }
        result
    }

    pub fn set_pier(&self, pier: Pier) -> MountResult<()> {
        let result = self.execute(&Command::set_pier(pier)).map(|_| ());
        if result.is_ok() {
            self.update_scope_info(|info| info.pier = Some(pier));
        }
        result
    }

    pub fn set_backlash_ra(&self, arcsec: u16) -> MountResult<()> {
        let result = self.execute(&Command::set_backlash_ra(arcsec)?).map(|_| ());
        if result.is_ok() {
            self.update_scope_info(|info| info.backlash_ra = arcsec);
        }
        result
    }

    pub fn set_backlash_dec(&self, arcsec: u16) -> MountResult<()> {
        let result = self.execute(&Command::set_backlash_dec(arcsec)?).map(|_| ());
        if result.is_ok() {
            self.update_scope_info(|info| info.backlash_dec = arcsec);
        }
        result
    }

    pub fn camera_start(&self, start: bool) -> MountResult<()> {
        self.execute(&Command::camera_start(start)).map(|_| ())
    }

    pub fn set_camera(&self, shots: u32, exposure: u32) -> MountResult<()> {
        self.execute_seq(&[
            Command::camera_shots(shots)?,
            Command::camera_exposure(exposure)?,
        ])
        .map(|_| ())
    }

    pub fn receive_pec_table(&self) -> MountResult<Vec<i16>> {
        let reply = self.execute(&Command::get_pec())?;
        parse_pec_table(&reply)
    }

    /// Upload a PEC table: `!PI#` then the table line, awaiting the ack
    /// line, all under one port acquisition.
    pub fn send_pec_table(&self, values: &[i16]) -> MountResult<String> {
        let table_line = encode_pec_table(values)?;
        let mut inner = self.inner.lock().unwrap();
        Self::transact(&mut inner, &Command::begin_pec_upload())?;
        let ack_wait = Command {
            bytes: table_line,
            response: ResponseKind::Sentinel,
            timeout: Duration::from_secs(10),
        };
        let reply = Self::transact(&mut inner, &ack_wait)?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    pub fn set_pec_position(&self, position: u8) -> MountResult<()> {
        let result = self.execute(&Command::set_pec_position(position)?).map(|_| ());
        if result.is_ok() {
            self.update_scope_info(|info| info.pec.progress = position);
        }
        result
    }

    pub fn get_pec_position(&self) -> MountResult<u8> {
        let reply = self.execute(&Command::get_pec_position())?;
        let text = String::from_utf8_lossy(&reply);
        let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
        let position = digits
            .parse::<u8>()
            .map_err(|_| MountError::Parse(format!("bad PEC position reply {text:?}")))?;
        self.update_scope_info(|info| info.pec.progress = position);
        Ok(position)
    }

    /// Pulse DTR to reset the mount controller.
    pub fn reset_controller(&self) -> MountResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let port = inner
            .port
            .as_mut()
            .ok_or_else(|| MountError::ConnectionFailed("port not open".to_string()))?;
        port.write_data_terminal_ready(false)?;
        std::thread::sleep(Duration::from_millis(100));
        port.write_data_terminal_ready(true)?;
        Ok(())
    }

    /// Flash new firmware with an external tool. The bridge is paused and
    /// the port released for the duration of the flash.
    pub fn upload_firmware(&self, flasher: &str, args: &[String]) -> MountResult<()> {
        self.bridge_paused.store(true, Ordering::SeqCst);
        let result = (|| {
            let device = {
                let mut inner = self.inner.lock().unwrap();
                inner.port = None;
                inner.device.clone()
            };
            info!("running firmware flasher {flasher} on {device}");
            let status = std::process::Command::new(flasher)
                .args(args)
                .status()
                .map_err(MountError::Io)?;
            if !status.success() {
                return Err(MountError::ConnectionFailed(format!(
                    "firmware flasher exited with {status}"
                )));
            }
            let mut inner = self.inner.lock().unwrap();
            Self::reconnect(&mut inner)
        })();
        self.bridge_paused.store(false, Ordering::SeqCst);
        result
    }
}
