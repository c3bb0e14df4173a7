//! Liveness probing for a connected session.

use embassy_time::{Duration, Instant};

/// What the client has to do after polling the keepalive timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeepAliveAction {
    Idle,
    /// Nothing was exchanged for a full period; send PINGREQ.
    SendPing,
    /// The gateway stayed silent past the loss threshold.
    Lost,
}

/// Tracks traffic in both directions against the keepalive period.
///
/// Loss is measured from the last datagram received from the gateway, so the
/// client's own PINGREQs never keep a dead session alive. A zero period
/// disables the timer.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    period: Duration,
    ping: bool,
    last_received: Instant,
    last_sent: Instant,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepAlive {
    pub const fn new() -> Self {
        Self {
            period: Duration::from_ticks(0),
            ping: false,
            last_received: Instant::from_ticks(0),
            last_sent: Instant::from_ticks(0),
        }
    }

    /// Arms the timer. With `ping` unset only loss is detected, which is how
    /// a sleeping client is watched.
    pub fn start(&mut self, now: Instant, period: Duration, ping: bool) {
        self.period = period;
        self.ping = ping;
        self.last_received = now;
        self.last_sent = now;
    }

    pub fn stop(&mut self) {
        self.period = Duration::from_ticks(0);
    }

    pub fn is_armed(&self) -> bool {
        self.period.as_ticks() != 0
    }

    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn on_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Checks the timer. The session is lost once nothing has been received
    /// for `period * (retransmission_count + 1)`.
    pub fn poll(&mut self, now: Instant, retransmission_count: u8) -> KeepAliveAction {
        if !self.is_armed() {
            return KeepAliveAction::Idle;
        }

        let silence = now.saturating_duration_since(self.last_received);
        if silence >= self.period * (u32::from(retransmission_count) + 1) {
            self.stop();
            return KeepAliveAction::Lost;
        }

        let last_traffic = self.last_received.max(self.last_sent);
        if self.ping && now.saturating_duration_since(last_traffic) >= self.period {
            self.last_sent = now;
            return KeepAliveAction::SendPing;
        }
        KeepAliveAction::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    fn run(keepalive: &mut KeepAlive, until: u64, count: u8) -> (usize, Option<u64>) {
        let mut pings = 0;
        for secs in 1..=until {
            match keepalive.poll(at(secs), count) {
                KeepAliveAction::SendPing => pings += 1,
                KeepAliveAction::Lost => return (pings, Some(secs)),
                KeepAliveAction::Idle => {}
            }
        }
        (pings, None)
    }

    #[test]
    fn test_silent_gateway_is_lost_after_count_plus_one_periods() {
        let mut keepalive = KeepAlive::new();
        keepalive.start(at(0), Duration::from_secs(10), true);

        let (pings, lost_at) = run(&mut keepalive, 100, 3);
        assert_eq!(pings, 3);
        assert_eq!(lost_at, Some(40));
        assert!(!keepalive.is_armed());
    }

    #[test]
    fn test_received_traffic_defers_loss() {
        let mut keepalive = KeepAlive::new();
        keepalive.start(at(0), Duration::from_secs(10), true);

        assert_eq!(keepalive.poll(at(10), 1), KeepAliveAction::SendPing);
        keepalive.on_received(at(15));
        assert_eq!(keepalive.poll(at(20), 1), KeepAliveAction::Idle);
        assert_eq!(keepalive.poll(at(25), 1), KeepAliveAction::SendPing);
        assert_eq!(keepalive.poll(at(35), 1), KeepAliveAction::Lost);
    }

    #[test]
    fn test_outbound_traffic_postpones_ping() {
        let mut keepalive = KeepAlive::new();
        keepalive.start(at(0), Duration::from_secs(10), true);
        keepalive.on_sent(at(8));
        assert_eq!(keepalive.poll(at(10), 3), KeepAliveAction::Idle);
        assert_eq!(keepalive.poll(at(18), 3), KeepAliveAction::SendPing);
    }

    #[test]
    fn test_loss_only_mode_never_pings() {
        let mut keepalive = KeepAlive::new();
        keepalive.start(at(0), Duration::from_secs(5), false);
        let (pings, lost_at) = run(&mut keepalive, 30, 2);
        assert_eq!(pings, 0);
        assert_eq!(lost_at, Some(15));
    }

    #[test]
    fn test_zero_period_disables_timer() {
        let mut keepalive = KeepAlive::new();
        keepalive.start(at(0), Duration::from_secs(0), true);
        assert_eq!(run(&mut keepalive, 1000, 0), (0, None));
    }
}
