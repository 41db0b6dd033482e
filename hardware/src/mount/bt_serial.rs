//! HC-05 Bluetooth serial side channel.
//!
//! The HC-05 module raises its STATE pin while a Bluetooth client is
//! paired; the pin is sampled through gpiod and the serial port is opened
//! and closed to follow it. While open, the module behaves as one more
//! byte channel bridged onto the mount line.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use gpiod::{Chip, Options};
use serialport::SerialPort;
use tracing::{info, warn};

use super::bridge::SidePort;
use super::MountResult;

const BAUD_RATE: u32 = 9600;

struct BtInner {
    port: Option<Box<dyn SerialPort>>,
    last_state: Option<bool>,
}

/// Bluetooth serial channel gated by the HC-05 STATE pin.
pub struct BtSerial {
    device: String,
    lines: gpiod::Lines<gpiod::Input>,
    inner: Mutex<BtInner>,
}

impl BtSerial {
    /// `chip` is the gpiochip name (e.g. `gpiochip0`), `state_pin` the
    /// line offset wired to the HC-05 STATE output.
    pub fn new(device: &str, chip: &str, state_pin: u32) -> MountResult<Self> {
        let chip = Chip::new(chip)?;
        let opts = Options::input([state_pin]).consumer("hc05-state");
        let lines = chip.request_lines(opts)?;
        Ok(Self {
            device: device.to_string(),
            lines,
            inner: Mutex::new(BtInner {
                port: None,
                last_state: None,
            }),
        })
    }

    fn connected(&self) -> bool {
        match self.lines.get_values([false; 1]) {
            Ok(values) => values[0],
            Err(e) => {
                warn!("failed to read HC-05 state pin: {e}");
                false
            }
        }
    }

    /// Follow the STATE pin: open the serial port on connect, close it on
    /// disconnect.
    fn sync_port(&self, inner: &mut BtInner) {
        let state = self.connected();
        if inner.last_state == Some(state) {
            return;
        }
        inner.last_state = Some(state);
        if state {
            info!("HC-05 connected, opening {}", self.device);
            match serialport::new(&self.device, BAUD_RATE)
                .timeout(Duration::from_millis(10))
                .open()
            {
                Ok(port) => inner.port = Some(port),
                Err(e) => warn!("failed to open bluetooth serial: {e}"),
            }
        } else {
            info!("HC-05 disconnected, closing {}", self.device);
            inner.port = None;
        }
    }
}

impl SidePort for BtSerial {
    fn read_bytes(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        self.sync_port(&mut inner);
        let port = match inner.port.as_mut() {
            Some(port) => port,
            None => return Vec::new(),
        };
        let pending = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(_) => return Vec::new(),
        };
        if pending == 0 {
            return Vec::new();
        }
        let mut buf = vec![0u8; pending];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(_) => Vec::new(),
        }
    }

    fn write_bytes(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        self.sync_port(&mut inner);
        if let Some(port) = inner.port.as_mut() {
            if port.write_all(bytes).is_err() {
                warn!("bluetooth serial write failed");
            }
        }
    }
}
