//! Tunnel statistics collection

/// Counters kept by a tunneling session
///
/// Updated by the session's background tasks. Callers get a snapshot through
/// `TunnelingSession::statistics`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStatistics {
    /// KNXnet/IP messages sent
    pub frames_sent: u64,
    /// KNXnet/IP messages received and decoded
    pub frames_received: u64,
    /// TUNNELING_ACKs sent for inbound tunneling requests
    pub tunneling_acks_sent: u64,
    /// Inbound datagrams that failed to decode
    pub decode_errors: u64,
    /// Requests whose response never arrived
    pub expired_expectations: u64,
    pub keepalives_sent: u64,
    pub keepalives_failed: u64,
}

impl TunnelStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters to zero
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn increment_frames_sent(&mut self) {
        self.frames_sent += 1;
    }

    pub fn increment_frames_received(&mut self) {
        self.frames_received += 1;
    }

    pub fn increment_tunneling_acks_sent(&mut self) {
        self.tunneling_acks_sent += 1;
    }

    pub fn increment_decode_errors(&mut self) {
        self.decode_errors += 1;
    }

    pub fn increment_expired_expectations(&mut self) {
        self.expired_expectations += 1;
    }

    pub fn increment_keepalives_sent(&mut self) {
        self.keepalives_sent += 1;
    }

    pub fn increment_keepalives_failed(&mut self) {
        self.keepalives_failed += 1;
    }

    /// Share of received datagrams that failed to decode, as a percentage
    pub fn decode_error_rate(&self) -> f64 {
        let total = self.frames_received + self.decode_errors;
        if total == 0 {
            0.0
        } else {
            (self.decode_errors as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_clear() {
        let mut stats = TunnelStatistics::new();
        stats.increment_frames_received();
        stats.increment_frames_received();
        stats.increment_frames_received();
        stats.increment_decode_errors();
        stats.increment_keepalives_sent();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.decode_error_rate(), 25.0);

        stats.clear();
        assert_eq!(stats, TunnelStatistics::default());
        assert_eq!(stats.decode_error_rate(), 0.0);
    }
}
