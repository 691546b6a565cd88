//! Small shared helpers: wall-clock formatting and local-address discovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

/// Formats a `SystemTime` as an ISO-8601 timestamp with a `+00:00` offset,
/// millisecond precision (`2026-08-02T09:41:07.512+00:00`).
///
/// The wire protocol only ever *produces* timestamps; peers treat them as
/// opaque strings, so UTC with an explicit zero offset is sufficient.
pub fn iso8601_utc(t: SystemTime) -> String {
    let dur = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs();
    let millis = dur.subsec_millis();

    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);

    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}+00:00",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

/// Days-since-epoch to (year, month, day) in the proleptic Gregorian calendar.
///
/// Exact for the full `i64` day range we can encounter from `SystemTime`.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097; // [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365; // [0, 399]
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32; // [1, 31]
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32; // [1, 12]
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Discovers the local address a peer at `toward` would see us on.
///
/// Opens a connected UDP socket (no packets are sent) and reads its local
/// endpoint. Falls back to loopback when the route lookup fails, which is
/// correct for single-host deployments.
pub fn local_addr_toward(toward: SocketAddr) -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(sock) = UdpSocket::bind(("0.0.0.0", 0)) else {
        return fallback;
    };
    if sock.connect(toward).is_err() {
        return fallback;
    }
    sock.local_addr().map(|a| a.ip()).unwrap_or(fallback)
}

/// Process-chosen node identity: `c-<hostname>`, or `c-unknown` when the
/// hostname cannot be read.
pub fn node_id() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if rc != 0 {
        return "c-unknown".to_owned();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(host) if !host.is_empty() => format!("c-{host}"),
        _ => "c-unknown".to_owned(),
    }
}
