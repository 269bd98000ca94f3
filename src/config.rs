use std::time::Duration;

/// Tunables for streaming and register access, loaded from `PSEYE_*`
/// environment variables with defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Number of bulk transfers kept in flight.
    pub transfer_count: usize,
    /// Size of each bulk transfer buffer.
    pub transfer_size: usize,
    /// Size of one UVC payload chunk inside a bulk transfer.
    pub payload_size: usize,
    /// Number of frame slots in the hand-off ring.
    pub ring_frames: usize,
    pub sensor_poll_attempts: u32,
    pub sensor_poll_interval: Duration,
    /// Delay after resetting the bridge or the sensor.
    pub settle_delay: Duration,
    pub control_timeout: Duration,
    /// How long a host tick waits for a frame before re-checking its state.
    pub frame_wait: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            transfer_count: 5,
            transfer_size: 0x10000,
            payload_size: 2 * 1024,
            ring_frames: 2,
            sensor_poll_attempts: 15,
            sensor_poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(100),
            control_timeout: Duration::from_millis(1000),
            frame_wait: Duration::from_millis(100),
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StreamConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = StreamConfig::default();
        let num = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let ms = |key: &str, default: Duration| -> Duration {
            Duration::from_millis(num(key, default.as_millis() as u64))
        };

        StreamConfig {
            transfer_count: num("PSEYE_TRANSFER_COUNT", d.transfer_count as u64).max(1) as usize,
            transfer_size: num("PSEYE_TRANSFER_SIZE", d.transfer_size as u64) as usize,
            payload_size: num("PSEYE_PAYLOAD_SIZE", d.payload_size as u64).max(1) as usize,
            ring_frames: num("PSEYE_RING_FRAMES", d.ring_frames as u64).max(2) as usize,
            sensor_poll_attempts: num("PSEYE_SENSOR_POLL_ATTEMPTS", d.sensor_poll_attempts as u64)
                .max(1) as u32,
            sensor_poll_interval: ms("PSEYE_SENSOR_POLL_INTERVAL_MS", d.sensor_poll_interval),
            settle_delay: ms("PSEYE_SETTLE_DELAY_MS", d.settle_delay),
            control_timeout: ms("PSEYE_CONTROL_TIMEOUT_MS", d.control_timeout),
            frame_wait: ms("PSEYE_FRAME_WAIT_MS", d.frame_wait),
        }
    }

    /// No sleeping anywhere; used against simulated hardware.
    pub fn immediate() -> Self {
        StreamConfig {
            sensor_poll_interval: Duration::ZERO,
            settle_delay: Duration::ZERO,
            frame_wait: Duration::from_millis(20),
            ..StreamConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_hardware_tuning() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.transfer_count, 5);
        assert_eq!(cfg.transfer_size, 64 * 1024);
        assert_eq!(cfg.payload_size, 2048);
        assert_eq!(cfg.sensor_poll_attempts, 15);
        assert_eq!(cfg.sensor_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("PSEYE_TRANSFER_COUNT", "8"),
            ("PSEYE_SETTLE_DELAY_MS", "5"),
            ("PSEYE_PAYLOAD_SIZE", "lots"),
            ("PSEYE_RING_FRAMES", "1"),
        ]
        .into_iter()
        .collect();
        let cfg = StreamConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.transfer_count, 8);
        assert_eq!(cfg.settle_delay, Duration::from_millis(5));
        assert_eq!(cfg.payload_size, 2048);
        assert_eq!(cfg.ring_frames, 2);
    }
}
