use std::time::Duration;

use rand::Rng;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// What a heartbeat tick asks the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Send,
    /// The previous heartbeat was never acknowledged.
    Zombie,
}

/// Tracks heartbeat acknowledgements for zombie-connection detection.
///
/// A connection is a zombie once the oldest unacknowledged heartbeat is a
/// full interval old. Until then a tick sends again but keeps the deadline of
/// the first unanswered beat.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    interval: Option<Duration>,
    awaiting_ack: bool,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatTracker {
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    pub fn on_tick(&mut self, now: Instant) -> Beat {
        if self.awaiting_ack && self.ack_overdue(now) {
            return Beat::Zombie;
        }
        self.force_send(now);
        Beat::Send
    }

    /// Heartbeat requested by the server outside the regular schedule.
    pub fn force_send(&mut self, now: Instant) {
        if !self.awaiting_ack {
            self.last_sent = Some(now);
        }
        self.awaiting_ack = true;
    }

    fn ack_overdue(&self, now: Instant) -> bool {
        match (self.interval, self.last_sent) {
            (Some(interval), Some(sent)) => now.saturating_duration_since(sent) >= interval,
            _ => true,
        }
    }

    /// Returns the round trip, or `None` for an unsolicited ack.
    pub fn on_ack(&mut self, now: Instant) -> Option<Duration> {
        if !self.awaiting_ack {
            return None;
        }
        self.awaiting_ack = false;
        let latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        if latency.is_some() {
            self.latency = latency;
        }
        latency
    }

    pub fn ack_received(&self) -> bool {
        !self.awaiting_ack
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn reset(&mut self) {
        self.awaiting_ack = false;
        self.last_sent = None;
    }
}

/// Ticks every `interval` on `tx` until cancelled or the receiver is gone.
///
/// The first tick is jittered within one interval so reconnecting shards do
/// not heartbeat in lockstep.
pub fn spawn_heartbeat(
    interval: Duration,
    tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let jitter = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + jitter, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if tx.send(()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ack_by_the_next_tick_is_a_zombie() {
        let start = Instant::now();
        let interval = Duration::from_millis(41_250);
        let mut hb = HeartbeatTracker::default();
        hb.set_interval(interval);

        assert_eq!(hb.on_tick(start), Beat::Send);
        assert_eq!(hb.on_tick(start + interval), Beat::Zombie);
    }

    #[test]
    fn server_requested_beat_right_before_a_tick_is_not_a_zombie() {
        let start = Instant::now();
        let interval = Duration::from_millis(41_250);
        let mut hb = HeartbeatTracker::default();
        hb.set_interval(interval);

        hb.force_send(start);
        assert_eq!(hb.on_tick(start + Duration::from_millis(100)), Beat::Send);
        assert!(!hb.ack_received());

        // The deadline stays with the first unanswered beat.
        assert_eq!(hb.on_tick(start + interval), Beat::Zombie);
    }

    #[test]
    fn ack_after_a_resend_measures_from_the_first_beat() {
        let start = Instant::now();
        let mut hb = HeartbeatTracker::default();
        hb.set_interval(Duration::from_secs(10));

        hb.force_send(start);
        assert_eq!(hb.on_tick(start + Duration::from_secs(1)), Beat::Send);
        assert_eq!(
            hb.on_ack(start + Duration::from_secs(2)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(hb.on_tick(start + Duration::from_secs(11)), Beat::Send);
    }

    #[test]
    fn acked_heartbeats_keep_the_connection_alive() {
        let start = Instant::now();
        let interval = Duration::from_millis(1_000);
        let mut hb = HeartbeatTracker::default();
        hb.set_interval(interval);

        for i in 0..10u32 {
            let sent = start + interval * i;
            assert_eq!(hb.on_tick(sent), Beat::Send);
            let rtt = Duration::from_millis(u64::from(i) * 10 + 5);
            assert_eq!(hb.on_ack(sent + rtt), Some(rtt));
        }
        assert!(hb.ack_received());
        assert_eq!(hb.on_ack(start), None);
    }

    #[test]
    fn late_ack_still_counts_before_the_boundary() {
        let start = Instant::now();
        let mut hb = HeartbeatTracker::default();
        hb.set_interval(Duration::from_millis(1000));
        hb.on_tick(start);
        hb.on_ack(start + Duration::from_millis(999));
        assert_eq!(hb.on_tick(start + Duration::from_millis(1000)), Beat::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_when_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(Duration::from_secs(1), tx, cancel.clone());

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        cancel.cancel();
        handle.await.unwrap();
        while rx.try_recv().is_ok() {}
        assert!(rx.recv().await.is_none());
    }
}
