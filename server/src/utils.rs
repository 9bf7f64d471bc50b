use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use shared::get_timestamp;

/// Current unix time in whole seconds.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Period of one tick at the given rate, or `None` for a zero rate.
pub fn tick_period(tick_rate: u32) -> Option<Duration> {
    (tick_rate > 0).then(|| Duration::from_secs(1) / tick_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_period() {
        assert_eq!(tick_period(1), Some(Duration::from_secs(1)));
        assert_eq!(tick_period(0), None);
        let sixty = tick_period(60).unwrap();
        assert!(sixty > Duration::from_millis(16) && sixty < Duration::from_millis(17));
    }

    #[test]
    fn test_unix_seconds_tracks_timestamp() {
        let secs = unix_seconds();
        let millis = get_timestamp();
        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }
}
