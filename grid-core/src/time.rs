use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a monotonic clock immune to wall-clock adjustment.
/// All deadline arithmetic in this workspace uses this clock; 0 is reserved
/// as the "no deadline" sentinel, so the first reading is never 0.
pub fn safe_time_millis() -> u64 {
    let millis = EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64;
    millis + 1
}
