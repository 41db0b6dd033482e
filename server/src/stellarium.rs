//! Stellarium telescope-control protocol server.
//!
//! Little-endian binary TCP protocol: the server reports the current
//! position as 24-byte type-0 messages twice a second and accepts type-0
//! GOTO (20 bytes) and type-2 sync (16 bytes) messages. RA is encoded as
//! an unsigned 32-bit integer in units of rad·2³¹/π, DEC as the signed
//! equivalent.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use hardware::mount::MountLink;
use shared::conversions::{
    deg_to_lx200_dec, deg_to_lx200_ra, deg_to_stellarium_dec, deg_to_stellarium_ra,
    lx200_dec_to_deg, lx200_ra_to_deg, stellarium_dec_to_deg, stellarium_ra_to_deg,
};

use crate::state::{AppState, SlewRequest};

const POSITION_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// A decoded inbound message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inbound {
    Goto { ra_deg: f64, dec_deg: f64 },
    Sync { ra_deg: f64, dec_deg: f64 },
}

/// Encode the current position as a type-0 message.
pub fn pack_position(ra_deg: f64, dec_deg: f64, micros: u64) -> [u8; 24] {
    let mut buf = [0u8; 24];
    buf[0..2].copy_from_slice(&24u16.to_le_bytes());
    buf[2..4].copy_from_slice(&0u16.to_le_bytes());
    buf[4..12].copy_from_slice(&micros.to_le_bytes());
    buf[12..16].copy_from_slice(&deg_to_stellarium_ra(ra_deg).to_le_bytes());
    buf[16..20].copy_from_slice(&deg_to_stellarium_dec(dec_deg).to_le_bytes());
    // Remaining four bytes stay reserved/zero.
    buf
}

/// Decode one inbound message. Returns an error string on any shape
/// violation (the caller logs it and drops the message).
pub fn unpack_message(data: &[u8]) -> Result<Inbound, String> {
    if data.len() < 8 {
        return Err(format!("message too short: {} bytes", data.len()));
    }
    let size = u16::from_le_bytes([data[0], data[1]]) as usize;
    let msg_type = u16::from_le_bytes([data[2], data[3]]);
    if size != data.len() {
        return Err(format!("size field {size} does not match {} bytes", data.len()));
    }
    match msg_type {
        0 => {
            if data.len() < 20 {
                return Err(format!("type-0 message of {} bytes", data.len()));
            }
            let ra = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
            let dec = i32::from_le_bytes([data[16], data[17], data[18], data[19]]);
            Ok(Inbound::Goto {
                ra_deg: stellarium_ra_to_deg(ra),
                dec_deg: stellarium_dec_to_deg(dec),
            })
        }
        2 => {
            if data.len() != 16 {
                return Err(format!("type-2 message of {} bytes", data.len()));
            }
            let ra = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
            let dec = i32::from_le_bytes([data[12], data[13], data[14], data[15]]);
            Ok(Inbound::Sync {
                ra_deg: stellarium_ra_to_deg(ra),
                dec_deg: stellarium_dec_to_deg(dec),
            })
        }
        other => Err(format!("unknown message type {other}")),
    }
}

/// Serve the Stellarium protocol until the listener fails or the process
/// shuts down.
pub async fn serve(addr: String, state: Arc<AppState>) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("stellarium server failed to bind {addr}: {e}");
            return;
        }
    };
    info!("stellarium server listening on {addr}");

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!("stellarium client connected from {peer}");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, state).await {
                        info!("stellarium client disconnected: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("stellarium accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
    }
}

async fn handle_client(
    socket: tokio::net::TcpStream,
    state: Arc<AppState>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    // Writer half: report the mount position twice a second.
    let position_state = Arc::clone(&state);
    let writer_task = tokio::spawn(async move {
        loop {
            if let Some(mount) = position_state.mount.as_ref() {
                let info = mount.scope_info();
                if let (Ok(ra_deg), Ok(dec_deg)) =
                    (lx200_ra_to_deg(&info.ra), lx200_dec_to_deg(&info.dec))
                {
                    let micros = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_micros() as u64)
                        .unwrap_or(0);
                    let msg = pack_position(ra_deg, dec_deg, micros);
                    if writer.write_all(&msg).await.is_err() {
                        break;
                    }
                }
            }
            tokio::time::sleep(POSITION_INTERVAL).await;
        }
    });

    let mut buf = [0u8; 64];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        match unpack_message(&buf[..n]) {
            Ok(Inbound::Goto { ra_deg, dec_deg }) => {
                let ra = deg_to_lx200_ra(ra_deg);
                let dec = deg_to_lx200_dec(dec_deg);
                info!("stellarium GOTO RA={ra} DEC={dec}");
                let _ = state.slew_requests.send(SlewRequest {
                    ra: ra.clone(),
                    dec: dec.clone(),
                });
                if let Some(mount) = state.mount.as_ref() {
                    slew_mount(mount, ra_deg, dec_deg);
                }
            }
            Ok(Inbound::Sync { ra_deg, dec_deg }) => {
                info!(
                    "stellarium sync to RA={} DEC={}",
                    deg_to_lx200_ra(ra_deg),
                    deg_to_lx200_dec(dec_deg)
                );
                if let Some(mount) = state.mount.as_ref() {
                    let mount = Arc::clone(mount);
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = mount.sync_to(ra_deg, dec_deg) {
                            warn!("stellarium sync failed: {e}");
                        }
                    });
                }
            }
            Err(e) => warn!("stellarium protocol violation: {e}"),
        }
    }

    writer_task.abort();
    Ok(())
}

fn slew_mount(mount: &Arc<MountLink>, ra_deg: f64, dec_deg: f64) {
    let mount = Arc::clone(mount);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = mount.goto(ra_deg, dec_deg) {
            warn!("stellarium GOTO failed: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn goto_round_trip_for_known_integers() {
        // RA int 0x40000000 = 90 deg, DEC int 0x20000000 = 45 deg.
        let mut msg = vec![0u8; 20];
        msg[0..2].copy_from_slice(&20u16.to_le_bytes());
        msg[2..4].copy_from_slice(&0u16.to_le_bytes());
        msg[12..16].copy_from_slice(&0x4000_0000u32.to_le_bytes());
        msg[16..20].copy_from_slice(&0x2000_0000i32.to_le_bytes());

        match unpack_message(&msg).unwrap() {
            Inbound::Goto { ra_deg, dec_deg } => {
                assert_relative_eq!(ra_deg, 90.0, epsilon = 1e-6);
                assert_relative_eq!(dec_deg, 45.0, epsilon = 1e-6);
                assert_eq!(deg_to_lx200_ra(ra_deg), "06:00:00");
                assert_eq!(deg_to_lx200_dec(dec_deg), "+45*00:00");
            }
            other => panic!("expected goto, got {other:?}"),
        }
    }

    #[test]
    fn sync_requires_sixteen_bytes() {
        let mut msg = vec![0u8; 16];
        msg[0..2].copy_from_slice(&16u16.to_le_bytes());
        msg[2..4].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            unpack_message(&msg).unwrap(),
            Inbound::Sync { .. }
        ));

        let mut bad = vec![0u8; 20];
        bad[0..2].copy_from_slice(&20u16.to_le_bytes());
        bad[2..4].copy_from_slice(&2u16.to_le_bytes());
        assert!(unpack_message(&bad).is_err());
    }

    #[test]
    fn wrong_length_is_a_protocol_violation() {
        let mut msg = vec![0u8; 20];
        msg[0..2].copy_from_slice(&24u16.to_le_bytes());
        assert!(unpack_message(&msg).is_err());
        assert!(unpack_message(&[0u8; 4]).is_err());
    }

    #[test]
    fn position_message_encodes_header_and_coordinates() {
        let msg = pack_position(90.0, 45.0, 1_000_000);
        assert_eq!(u16::from_le_bytes([msg[0], msg[1]]), 24);
        assert_eq!(u16::from_le_bytes([msg[2], msg[3]]), 0);
        assert_eq!(u64::from_le_bytes(msg[4..12].try_into().unwrap()), 1_000_000);
        assert_eq!(
            u32::from_le_bytes(msg[12..16].try_into().unwrap()),
            0x4000_0000
        );
        assert_eq!(
            i32::from_le_bytes(msg[16..20].try_into().unwrap()),
            0x2000_0000
        );
    }
}
