//! Typed mount commands and reply parsers.
//!
//! Every command carries its encoded bytes, the shape of the expected
//! reply and a timeout. Three reply shapes exist on the wire:
//!
//! - none at all (move / stop / speed),
//! - a single line terminated by `#` (position queries, sync),
//! - the vendor sentinel `!\n` (info, PEC, camera control).
//!
//! `:Sr`/`:Sd` answer with a bare `0`/`1` digit and `:MS#` with either `0`
//! or `1<reason>#`, which get their own reply kinds.

use std::time::Duration;

use super::{CameraTimerState, Direction, MountError, MountResult, PecState, Pier, ScopeInfo, SlewRate};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shape of the reply a command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Fire and forget.
    None,
    /// Read until the buffer contains `#`.
    HashTerminated,
    /// Read until the buffer contains the vendor sentinel `!\n`.
    Sentinel,
    /// A single `0` or `1` digit (`:Sr#`, `:Sd#`).
    StatusDigit,
    /// `0` on success or `1<reason>#` on refusal (`:MS#`).
    SlewStatus,
}

impl ResponseKind {
    /// Whether `buf` already holds a complete reply of this kind.
    pub fn is_complete(self, buf: &[u8]) -> bool {
        match self {
            ResponseKind::None => true,
            ResponseKind::HashTerminated => buf.contains(&b'#'),
            ResponseKind::Sentinel => buf.windows(2).any(|w| w == b"!\n"),
            ResponseKind::StatusDigit => matches!(buf.first(), Some(b'0') | Some(b'1')),
            ResponseKind::SlewStatus => {
                matches!(buf.first(), Some(b'0')) || buf.contains(&b'#')
            }
        }
    }
}

/// One encoded command ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub bytes: Vec<u8>,
    pub response: ResponseKind,
    pub timeout: Duration,
}

impl Command {
    fn new(text: String, response: ResponseKind) -> Self {
        Self {
            bytes: text.into_bytes(),
            response,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // ---- LX200 family ----

    pub fn start_move(direction: Direction) -> Self {
        Self::new(format!(":M{}#", direction.as_char()), ResponseKind::None)
    }

    /// Stop motion on one axis direction, or all motion when `None`.
    pub fn stop(direction: Option<Direction>) -> Self {
        let dir = direction.map(|d| d.as_char().to_string()).unwrap_or_default();
        Self::new(format!(":Q{dir}#"), ResponseKind::None)
    }

    pub fn set_rate(rate: SlewRate) -> Self {
        Self::new(format!(":R{}#", rate.as_char()), ResponseKind::None)
    }

    /// `ra` must already be an LX200 `HH:MM:SS` string.
    pub fn set_ra(ra: &str) -> Self {
        Self::new(format!(":Sr{ra}#"), ResponseKind::StatusDigit)
    }

    /// `dec` must already be an LX200 `±DD*MM:SS` string.
    pub fn set_dec(dec: &str) -> Self {
        Self::new(format!(":Sd{dec}#"), ResponseKind::StatusDigit)
    }

    pub fn get_ra() -> Self {
        Self::new(":GR#".to_string(), ResponseKind::HashTerminated)
    }

    pub fn get_dec() -> Self {
        Self::new(":GD#".to_string(), ResponseKind::HashTerminated)
    }

    /// Sync the mount to the previously set target coordinates.
    pub fn sync() -> Self {
        Self::new(":CM#".to_string(), ResponseKind::HashTerminated)
    }

    /// Slew to the previously set target coordinates.
    pub fn slew() -> Self {
        Self::new(":MS#".to_string(), ResponseKind::SlewStatus)
    }

    pub fn get_product() -> Self {
        Self::new(":GVP#".to_string(), ResponseKind::HashTerminated)
    }

    pub fn get_version() -> Self {
        Self::new(":GVN#".to_string(), ResponseKind::HashTerminated)
    }

    // ---- Vendor family (replies end with `!\n`) ----

    pub fn get_info() -> Self {
        Self::new("!IN#".to_string(), ResponseKind::Sentinel)
    }

    pub fn set_pier(pier: Pier) -> Self {
        Self::new(format!("!M{}#", pier.as_char()), ResponseKind::Sentinel)
    }

    /// RA backlash compensation, whole arcseconds, 3 digits.
    pub fn set_backlash_ra(arcsec: u16) -> MountResult<Self> {
        if arcsec > 999 {
            return Err(MountError::InvalidArgument(format!(
                "RA backlash {arcsec} out of range 0..=999"
            )));
        }
        Ok(Self::new(format!("!PA{arcsec:03}#"), ResponseKind::Sentinel))
    }

    /// DEC backlash compensation, whole arcseconds, 3 digits.
    pub fn set_backlash_dec(arcsec: u16) -> MountResult<Self> {
        if arcsec > 999 {
            return Err(MountError::InvalidArgument(format!(
                "DEC backlash {arcsec} out of range 0..=999"
            )));
        }
        Ok(Self::new(format!("!PB{arcsec:03}#"), ResponseKind::Sentinel))
    }

    /// Start movement at signed per-axis speeds in arcsec per 10 s.
    pub fn start_movement(ra_speed: i32, dec_speed: i32) -> MountResult<Self> {
        if ra_speed.abs() > 99 || dec_speed.abs() > 99 {
            return Err(MountError::InvalidArgument(format!(
                "speed ({ra_speed}, {dec_speed}) out of range -99..=99"
            )));
        }
        let rs = if ra_speed >= 0 { '+' } else { '-' };
        let ds = if dec_speed >= 0 { '+' } else { '-' };
        Ok(Self::new(
            format!("!S{rs}{:02}{ds}{:02}#", ra_speed.abs(), dec_speed.abs()),
            ResponseKind::Sentinel,
        ))
    }

    pub fn get_pec() -> Self {
        Self::new("!PO#".to_string(), ResponseKind::Sentinel)
    }

    /// Announce a PEC table upload; the table itself follows as a separate
    /// `PEC <N> v1,...,v2N\n` line (see `MountLink::send_pec_table`).
    pub fn begin_pec_upload() -> Self {
        Self::new("!PI#".to_string(), ResponseKind::None)
    }

    pub fn set_pec_position(position: u8) -> MountResult<Self> {
        if position > 99 {
            return Err(MountError::InvalidArgument(format!(
                "PEC position {position} out of range 0..=99"
            )));
        }
        Ok(Self::new(format!("!PS{position:02}#"), ResponseKind::Sentinel))
    }

    pub fn get_pec_position() -> Self {
        Self::new("!PG#".to_string(), ResponseKind::Sentinel)
    }

    pub fn set_tracking(enabled: bool) -> Self {
        let cmd = if enabled { "!TE#" } else { "!TD#" };
        Self::new(cmd.to_string(), ResponseKind::Sentinel)
    }

    pub fn camera_start(start: bool) -> Self {
        let cmd = if start { "!CO#" } else { "!CX#" };
        Self::new(cmd.to_string(), ResponseKind::Sentinel)
    }

    pub fn camera_exposure(seconds: u32) -> MountResult<Self> {
        if seconds > 999 {
            return Err(MountError::InvalidArgument(format!(
                "exposure {seconds} out of range 0..=999"
            )));
        }
        Ok(Self::new(format!("!CE{seconds:03}#"), ResponseKind::Sentinel))
    }

    pub fn camera_shots(count: u32) -> MountResult<Self> {
        if count > 999 {
            return Err(MountError::InvalidArgument(format!(
                "shot count {count} out of range 0..=999"
            )));
        }
        Ok(Self::new(format!("!CN{count:03}#"), ResponseKind::Sentinel))
    }
}

/// Parse a `0`/`1` LX200 status reply.
pub fn parse_status_digit(reply: &[u8]) -> MountResult<bool> {
    match reply.first() {
        Some(b'1') => Ok(true),
        Some(b'0') => Ok(false),
        _ => Err(MountError::Parse(format!(
            "expected status digit, got {:?}",
            String::from_utf8_lossy(reply)
        ))),
    }
}

/// Strip the trailing `#` (and whitespace) from a single-line reply.
pub fn parse_hash_line(reply: &[u8]) -> MountResult<String> {
    let text = String::from_utf8_lossy(reply);
    match text.find('#') {
        Some(pos) => Ok(text[..pos].trim().to_string()),
        None => Err(MountError::Parse(format!("missing '#' in reply {text:?}"))),
    }
}

/// Parse the `!IN#` info dump.
///
/// The reply is `key value` lines followed by the `!` sentinel line:
///
/// ```text
/// soft PipiTrek 1.21
/// mem 1532
/// up 86400
/// loop 1250
/// track 3599
/// RA 12:34:56
/// DEC +45*00:00
/// pier E
/// PEC 42
/// BC 010 020
/// cam 1 030 005
/// tracking 1
/// !
/// ```
///
/// Unknown keys are ignored and missing keys keep their defaults, so older
/// firmware revisions still parse.
pub fn parse_info(reply: &[u8]) -> MountResult<ScopeInfo> {
    let text = String::from_utf8_lossy(reply);
    let mut info = ScopeInfo::default();
    let mut saw_any = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line == "!" {
            continue;
        }
        let (key, value) = match line.split_once(' ') {
            Some(kv) => kv,
            None => continue,
        };
        saw_any = true;
        match key {
            "soft" => info.software = value.to_string(),
            "mem" => info.free_memory = value.parse().unwrap_or(0),
            "up" => info.uptime_s = value.parse().unwrap_or(0),
            "loop" => info.looptime_us = value.parse().unwrap_or(0),
            "track" => info.tracktime_s = value.parse().unwrap_or(0),
            "RA" => info.ra = value.to_string(),
            "DEC" => info.dec = value.to_string(),
            "pier" => info.pier = value.chars().next().and_then(Pier::from_char),
            "PEC" => info.pec = PecState {
                progress: value.parse().unwrap_or(0),
            },
            "BC" => {
                let mut parts = value.split_whitespace();
                info.backlash_ra = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                info.backlash_dec = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            "cam" => {
                let mut parts = value.split_whitespace();
                info.camera = CameraTimerState {
                    active: parts.next() == Some("1"),
                    exposure_s: parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
                    shots: parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
                };
            }
            "tracking" => info.tracking = value == "1",
            _ => {}
        }
    }

    if saw_any {
        Ok(info)
    } else {
        Err(MountError::Parse(format!("empty info reply {text:?}")))
    }
}

/// Parse a `PEC <N> v1,...,v2N` reply into the value table.
///
/// The table length must be exactly 2N; anything else is a protocol
/// violation.
pub fn parse_pec_table(reply: &[u8]) -> MountResult<Vec<i16>> {
    let text = String::from_utf8_lossy(reply);
    let line = text
        .lines()
        .find(|l| l.trim_start().starts_with("PEC "))
        .ok_or_else(|| MountError::Parse(format!("no PEC line in reply {text:?}")))?;
    let line = line.trim().trim_end_matches("!").trim();

    let rest = &line[4..];
    let (count_str, values_str) = rest
        .split_once(' ')
        .ok_or_else(|| MountError::Parse(format!("malformed PEC line {line:?}")))?;
    let n: usize = count_str
        .parse()
        .map_err(|_| MountError::Parse(format!("bad PEC count {count_str:?}")))?;

    let values: Result<Vec<i16>, _> = values_str
        .trim_end_matches('#')
        .split(',')
        .map(|v| v.trim().parse::<i16>())
        .collect();
    let values =
        values.map_err(|_| MountError::Parse(format!("bad PEC values {values_str:?}")))?;

    if values.len() != 2 * n {
        return Err(MountError::Parse(format!(
            "PEC table length {} does not match 2x{}",
            values.len(),
            n
        )));
    }
    Ok(values)
}

/// Encode a PEC table as the `PEC <N> v1,...,v2N\n` upload line.
pub fn encode_pec_table(values: &[i16]) -> MountResult<Vec<u8>> {
    if values.is_empty() || values.len() % 2 != 0 {
        return Err(MountError::InvalidArgument(format!(
            "PEC table length {} must be an even non-zero count",
            values.len()
        )));
    }
    let n = values.len() / 2;
    let joined = values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    Ok(format!("PEC {n} {joined}\n").into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lx200_encodings() {
        assert_eq!(Command::start_move(Direction::West).bytes, b":Mw#");
        assert_eq!(Command::stop(None).bytes, b":Q#");
        assert_eq!(Command::stop(Some(Direction::North)).bytes, b":Qn#");
        assert_eq!(Command::set_rate(SlewRate::Guide).bytes, b":RG#");
        assert_eq!(Command::set_ra("06:00:00").bytes, b":Sr06:00:00#");
        assert_eq!(Command::set_dec("+45*00:00").bytes, b":Sd+45*00:00#");
        assert_eq!(Command::get_ra().bytes, b":GR#");
        assert_eq!(Command::slew().bytes, b":MS#");
    }

    #[test]
    fn vendor_encodings() {
        assert_eq!(Command::get_info().bytes, b"!IN#");
        assert_eq!(Command::set_pier(Pier::West).bytes, b"!MW#");
        assert_eq!(Command::set_backlash_ra(7).unwrap().bytes, b"!PA007#");
        assert_eq!(Command::start_movement(5, -2).unwrap().bytes, b"!S+05-02#");
        assert_eq!(Command::start_movement(-15, 0).unwrap().bytes, b"!S-15+00#");
        assert_eq!(Command::set_pec_position(7).unwrap().bytes, b"!PS07#");
        assert_eq!(Command::set_tracking(true).bytes, b"!TE#");
        assert_eq!(Command::set_tracking(false).bytes, b"!TD#");
        assert_eq!(Command::camera_exposure(30).unwrap().bytes, b"!CE030#");
    }

    #[test]
    fn out_of_range_arguments_are_rejected() {
        assert!(Command::start_movement(100, 0).is_err());
        assert!(Command::set_pec_position(100).is_err());
        assert!(Command::set_backlash_ra(1000).is_err());
        assert!(Command::camera_shots(1000).is_err());
    }

    #[test]
    fn response_completion() {
        assert!(ResponseKind::None.is_complete(b""));
        assert!(!ResponseKind::HashTerminated.is_complete(b"12:34:56"));
        assert!(ResponseKind::HashTerminated.is_complete(b"12:34:56#"));
        assert!(!ResponseKind::Sentinel.is_complete(b"PEC 2 1,2,3,4"));
        assert!(ResponseKind::Sentinel.is_complete(b"PEC 2 1,2,3,4!\n"));
        assert!(ResponseKind::StatusDigit.is_complete(b"1"));
        assert!(ResponseKind::SlewStatus.is_complete(b"0"));
        assert!(!ResponseKind::SlewStatus.is_complete(b"1below horizon"));
        assert!(ResponseKind::SlewStatus.is_complete(b"1below horizon#"));
    }

    #[test]
    fn parse_hash_line_strips_terminator() {
        assert_eq!(parse_hash_line(b"12:34:56#").unwrap(), "12:34:56");
        assert!(parse_hash_line(b"12:34:56").is_err());
    }

    #[test]
    fn parse_full_info_dump() {
        let reply = b"soft PipiTrek 1.21\nmem 1532\nup 86400\nloop 1250\ntrack 3599\n\
                      RA 12:34:56\nDEC +45*00:00\npier E\nPEC 42\nBC 010 020\n\
                      cam 1 030 005\ntracking 1\n!\n";
        let info = parse_info(reply).unwrap();
        assert_eq!(info.software, "PipiTrek 1.21");
        assert_eq!(info.free_memory, 1532);
        assert_eq!(info.uptime_s, 86400);
        assert_eq!(info.ra, "12:34:56");
        assert_eq!(info.dec, "+45*00:00");
        assert_eq!(info.pier, Some(Pier::East));
        assert_eq!(info.pec.progress, 42);
        assert_eq!(info.backlash_ra, 10);
        assert_eq!(info.backlash_dec, 20);
        assert!(info.camera.active);
        assert_eq!(info.camera.exposure_s, 30);
        assert!(info.tracking);
        assert_eq!(info.dec_deg(), 45.0);
    }

    #[test]
    fn parse_info_rejects_empty_reply() {
        assert!(parse_info(b"!\n").is_err());
    }

    #[test]
    fn pec_table_round_trip() {
        let reply = b"PEC 3 1,-2,3,-4,5,-6!\n";
        let table = parse_pec_table(reply).unwrap();
        assert_eq!(table, vec![1, -2, 3, -4, 5, -6]);

        let encoded = encode_pec_table(&table).unwrap();
        assert_eq!(encoded, b"PEC 3 1,-2,3,-4,5,-6\n");
        // get after set of the same array parses identically
        let mut echoed = encoded.clone();
        echoed.extend_from_slice(b"!\n");
        assert_eq!(parse_pec_table(&echoed).unwrap(), table);
    }

    #[test]
    fn pec_table_length_mismatch_is_rejected() {
        assert!(parse_pec_table(b"PEC 3 1,2,3,4!\n").is_err());
        assert!(encode_pec_table(&[1, 2, 3]).is_err());
        assert!(encode_pec_table(&[]).is_err());
    }
}
