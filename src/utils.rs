use std::time::{SystemTime, UNIX_EPOCH};

pub fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert a bytes-per-second rate into megabits per second.
pub fn convert_speed_to_mbps(bytes_per_second: u64) -> u64 {
    (bytes_per_second as f64 / 1024.0 / 1024.0 * 8.0) as u64
}
