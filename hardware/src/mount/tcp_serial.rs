//! TCP byte channel to the mount.
//!
//! Planetarium software that speaks raw LX200 over TCP connects here; the
//! bridge forwards bytes between the connected client and the serial line.
//! A single client is served at a time; a new connection replaces the old
//! one.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use super::bridge::SidePort;

struct ClientSlot {
    stream: Option<TcpStream>,
}

/// Listens on a TCP port and exposes the connected client as a byte
/// channel.
pub struct TcpSerialServer {
    client: Arc<Mutex<ClientSlot>>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpSerialServer {
    /// Bind the listener and start accepting in the background.
    pub fn start(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("telescope TCP serial listening on {addr}");

        let client = Arc::new(Mutex::new(ClientSlot { stream: None }));
        let running = Arc::new(AtomicBool::new(true));

        let accept_client = Arc::clone(&client);
        let accept_running = Arc::clone(&running);
        let accept_thread = std::thread::Builder::new()
            .name("tcp-serial-accept".to_string())
            .spawn(move || {
                while accept_running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            info!("telescope TCP client connected from {addr}");
                            if stream.set_nonblocking(true).is_err() {
                                continue;
                            }
                            let mut slot = accept_client.lock().unwrap();
                            slot.stream = Some(stream);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        Err(e) => {
                            warn!("telescope TCP accept error: {e}");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })?;

        Ok(Self {
            client,
            running,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("telescope TCP accept thread panicked");
            }
        }
        self.client.lock().unwrap().stream = None;
        info!("telescope TCP serial stopped");
    }

    fn drop_client(slot: &mut ClientSlot) {
        info!("telescope TCP client disconnected");
        slot.stream = None;
    }
}

impl SidePort for TcpSerialServer {
    fn read_bytes(&self) -> Vec<u8> {
        let mut slot = self.client.lock().unwrap();
        let stream = match slot.stream.as_mut() {
            Some(stream) => stream,
            None => return Vec::new(),
        };
        let mut buf = [0u8; 1024];
        match stream.read(&mut buf) {
            Ok(0) => {
                Self::drop_client(&mut slot);
                Vec::new()
            }
            Ok(n) => buf[..n].to_vec(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Vec::new(),
            Err(_) => {
                Self::drop_client(&mut slot);
                Vec::new()
            }
        }
    }

    fn write_bytes(&self, bytes: &[u8]) {
        let mut slot = self.client.lock().unwrap();
        if let Some(stream) = slot.stream.as_mut() {
            if stream.write_all(bytes).is_err() {
                Self::drop_client(&mut slot);
            }
        }
    }
}

impl Drop for TcpSerialServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_bytes_both_ways() {
        let server = loop {
            match TcpSerialServer::start("127.0.0.1:15123") {
                Ok(s) => break s,
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        };

        let mut client = TcpStream::connect("127.0.0.1:15123").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        // Wait for the accept thread to pick the client up.
        std::thread::sleep(Duration::from_millis(300));

        client.write_all(b":GR#").unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut received = Vec::new();
        for _ in 0..20 {
            received.extend(server.read_bytes());
            if received.len() >= 4 {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(received, b":GR#");

        server.write_bytes(b"12:34:56#");
        let mut reply = [0u8; 9];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"12:34:56#");

        server.stop();
    }
}
