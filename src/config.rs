use std::time::Duration;

/// Tuning knobs for the hub and its sessions.
///
/// The defaults match the deployed values; `ping_period` must stay below
/// `pong_wait` or every client times out between pings.
#[derive(Clone, Debug)]
pub struct HubOptions {
    /// How often local presence entries are re-scored on the bus.
    pub scan_interval: Duration,
    /// Deadline applied to every transport write.
    pub write_wait: Duration,
    /// Read deadline; extended each time the peer answers a ping.
    pub pong_wait: Duration,
    /// Interval between server pings.
    pub ping_period: Duration,
    /// Sessions idle longer than this are disconnected.
    pub activity_timeout: Duration,
    /// Maximum inbound frame size in bytes. Also caps re-serialized
    /// control-envelope payloads.
    pub max_message_size: usize,
    /// Number of workers draining the inbound message queue.
    pub worker_count: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            scan_interval: Duration::from_secs(30),
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            activity_timeout: Duration::from_secs(120),
            max_message_size: 512,
            worker_count: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let opts = HubOptions::default();
        assert_eq!(opts.scan_interval, Duration::from_secs(30));
        assert_eq!(opts.write_wait, Duration::from_secs(10));
        assert_eq!(opts.pong_wait, Duration::from_secs(60));
        assert_eq!(opts.ping_period, Duration::from_secs(54));
        assert_eq!(opts.activity_timeout, Duration::from_secs(120));
        assert_eq!(opts.max_message_size, 512);
        assert_eq!(opts.worker_count, 1024);
    }

    #[test]
    fn ping_period_stays_under_pong_wait() {
        let opts = HubOptions::default();
        assert!(opts.ping_period < opts.pong_wait);
    }
}
