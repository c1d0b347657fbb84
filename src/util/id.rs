use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::Utc;

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

fn time_pid_mix() -> u128 {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let pid = std::process::id() as u128;
    now.as_nanos() ^ (pid << 32)
}

fn base36(mut v: u64) -> String {
    let alphabet = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".to_string();
    }
    let mut s = String::new();
    while v > 0 {
        s.push(alphabet[(v % 36) as usize] as char);
        v /= 36;
    }
    s.chars().rev().collect()
}

/// Opaque run id, collision-free across the process lifetime: a time⊕pid mix
/// plus a process-wide sequence number.
pub fn run_id() -> String {
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    let mix = (time_pid_mix() & 0xffff_ffff_ffff) as u64;
    format!("r{}{}", base36(mix), base36(0x1000 + seq))
}

/// Short hex suffix for container names.
pub fn short_hex8() -> String {
    let mix = (time_pid_mix() >> 8) as u64 ^ RUN_SEQ.fetch_add(1, Ordering::Relaxed).rotate_left(17);
    format!("{:08x}", (mix & 0xffff_ffff) as u32)
}

/// UTC timestamp safe for filenames and container names: no ':' or '.'.
pub fn timestamp_safe() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}
