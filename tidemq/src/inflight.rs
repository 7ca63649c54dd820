use std::collections::{BTreeSet, VecDeque};
use std::num::NonZeroU16;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};

use crate::codec::Publish;
use crate::net::MqttError;
use crate::types::{Origin, PacketId};
use crate::utils::{timestamp_millis, TimestampMillis};
use crate::Result;

/// Where an outbound QoS 1/2 delivery stands.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub enum MomentStatus {
    /// QoS 1, waiting for PUBACK
    UnAck,
    /// QoS 2, waiting for PUBREC
    UnReceived,
    /// QoS 2, PUBREL sent, waiting for PUBCOMP
    UnComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub from: Origin,
    pub status: MomentStatus,
    pub update_time: TimestampMillis,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: MomentStatus, from: Origin, publish: Publish) -> Self {
        Self { publish, from, status, update_time: timestamp_millis() }
    }

    #[inline]
    pub fn packet_id(&self) -> Option<PacketId> {
        self.publish.packet_id.map(|pid| pid.get())
    }

    #[inline]
    fn update_status(&mut self, status: MomentStatus) {
        self.update_time = timestamp_millis();
        self.status = status;
    }

    #[inline]
    fn touch(&mut self) {
        self.update_time = timestamp_millis();
    }

    #[inline]
    fn timeout(&self, interval: Duration) -> bool {
        !interval.is_zero() && (timestamp_millis() - self.update_time) >= interval.as_millis() as TimestampMillis
    }
}

/// Outbound deliveries awaiting acknowledgement, oldest first.
///
/// The retry interval grows exponentially between `retry_interval` and
/// `retry_max_interval` while the peer stays silent and is reset on every
/// acknowledgement.
pub struct OutInflight {
    cap: usize,
    next: u16,
    queues: VecDeque<(PacketId, OutInflightMessage)>,
    backoff: ExponentialBackoff,
    interval: Duration,
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize, retry_interval: Duration, retry_max_interval: Duration) -> Self {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(retry_interval)
            .with_max_interval(retry_max_interval.max(retry_interval))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();
        let interval = if retry_interval.is_zero() { Duration::ZERO } else { backoff.next_backoff().unwrap_or(retry_interval) };
        Self { cap, next: 1, queues: VecDeque::new(), backoff, interval }
    }

    /// Current retry interval, zero when retries are disabled.
    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time until the oldest delivery is due for a resend.
    #[inline]
    pub fn get_timeout(&self) -> Option<Duration> {
        if self.interval.is_zero() {
            return None;
        }
        self.queues.front().map(|(_, m)| {
            let elapsed = (timestamp_millis() - m.update_time).max(0) as u64;
            let t = (self.interval.as_millis() as u64).saturating_sub(elapsed).max(1);
            Duration::from_millis(t)
        })
    }

    /// Pops the oldest delivery if its retry interval has passed.
    #[inline]
    pub fn pop_front_timeout(&mut self) -> Option<OutInflightMessage> {
        let timed_out = self.queues.front().map(|(_, m)| m.timeout(self.interval)).unwrap_or_default();
        if timed_out {
            self.queues.pop_front().map(|(_, m)| m)
        } else {
            None
        }
    }

    /// Called once per round of resends.
    #[inline]
    pub fn backoff(&mut self) {
        if !self.interval.is_zero() {
            if let Some(next) = self.backoff.next_backoff() {
                self.interval = next;
            }
        }
    }

    #[inline]
    fn reset_backoff(&mut self) {
        if !self.interval.is_zero() {
            self.backoff.reset();
            if let Some(initial) = self.backoff.next_backoff() {
                self.interval = initial;
            }
        }
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.queues.iter().find(|(pid, _)| *pid == packet_id).map(|(_, m)| m)
    }

    /// Appends a delivery, refreshing its timestamp. A delivery with the
    /// same packet id is replaced.
    #[inline]
    pub fn push_back(&mut self, mut m: OutInflightMessage) {
        let Some(packet_id) = m.packet_id() else {
            log::warn!("packet_id is None, inflight message: {:?}", m);
            return;
        };
        self.queues.retain(|(pid, _)| *pid != packet_id);
        m.touch();
        self.queues.push_back((packet_id, m));
    }

    /// Removes an acknowledged delivery.
    #[inline]
    pub fn remove(&mut self, packet_id: PacketId) -> Option<OutInflightMessage> {
        let pos = self.queues.iter().position(|(pid, _)| *pid == packet_id)?;
        let removed = self.queues.remove(pos).map(|(_, m)| m);
        self.reset_backoff();
        removed
    }

    /// Moves a delivery to its next step; it goes to the back of the retry
    /// order.
    #[inline]
    pub fn update_status(&mut self, packet_id: PacketId, status: MomentStatus) -> bool {
        if let Some(pos) = self.queues.iter().position(|(pid, _)| *pid == packet_id) {
            if let Some((pid, mut m)) = self.queues.remove(pos) {
                m.update_status(status);
                self.queues.push_back((pid, m));
                self.reset_backoff();
                return true;
            }
        }
        false
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn exist(&self, packet_id: PacketId) -> bool {
        self.queues.iter().any(|(pid, _)| *pid == packet_id)
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap
    }

    #[inline]
    pub fn next_id(&mut self) -> Result<NonZeroU16> {
        for _ in 0..u16::MAX {
            let packet_id = self.next;
            self.next = self.next.wrapping_add(1);
            let Some(pid) = NonZeroU16::new(packet_id) else {
                continue;
            };
            if !self.exist(packet_id) {
                return Ok(pid);
            }
        }
        Err(MqttError::PacketIdExhausted.into())
    }

    /// Keeps `next_id` clear of ids restored from an earlier connection.
    #[inline]
    pub fn restore(&mut self, messages: Vec<OutInflightMessage>) {
        for m in messages {
            if let Some(pid) = m.packet_id() {
                self.next = self.next.max(pid.wrapping_add(1));
                self.queues.push_back((pid, m));
            }
        }
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &OutInflightMessage> {
        self.queues.iter().map(|(_, m)| m)
    }

    #[inline]
    pub fn drain(&mut self) -> Vec<OutInflightMessage> {
        self.queues.drain(..).map(|(_, m)| m).collect()
    }
}

/// Inbound QoS 2 packet ids that got PUBREC and wait for PUBREL.
#[derive(Debug, Default)]
pub struct InInflight {
    max: usize,
    pids: BTreeSet<PacketId>,
}

impl InInflight {
    #[inline]
    pub fn new(max: usize) -> Self {
        Self { max, pids: BTreeSet::new() }
    }

    /// `Ok(false)` for a duplicate of a packet id already awaiting PUBREL.
    #[inline]
    pub fn add(&mut self, packet_id: NonZeroU16) -> Result<bool> {
        if self.pids.contains(&packet_id.get()) {
            return Ok(false);
        }
        if self.max > 0 && self.pids.len() >= self.max {
            return Err(MqttError::PacketIdInUse(packet_id).into());
        }
        self.pids.insert(packet_id.get());
        Ok(true)
    }

    #[inline]
    pub fn remove(&mut self, packet_id: NonZeroU16) -> bool {
        self.pids.remove(&packet_id.get())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    #[inline]
    pub fn restore(&mut self, packet_ids: Vec<PacketId>) {
        self.pids.extend(packet_ids.into_iter().filter(|pid| *pid != 0));
    }

    #[inline]
    pub fn drain(&mut self) -> Vec<PacketId> {
        std::mem::take(&mut self.pids).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::QoS;

    fn msg(pid: u16, status: MomentStatus) -> OutInflightMessage {
        let p = Publish::new("a/b", "x", QoS::AtLeastOnce, false).packet_id(NonZeroU16::new(pid));
        OutInflightMessage::new(status, Origin::client("c".into()), p)
    }

    #[test]
    fn credit_and_ids() {
        let mut inflight = OutInflight::new(2, Duration::from_secs(20), Duration::from_secs(300));
        assert!(inflight.has_credit());
        let p1 = inflight.next_id().unwrap();
        inflight.push_back(msg(p1.get(), MomentStatus::UnAck));
        let p2 = inflight.next_id().unwrap();
        assert_ne!(p1, p2);
        inflight.push_back(msg(p2.get(), MomentStatus::UnReceived));
        assert!(!inflight.has_credit());

        assert!(inflight.update_status(p2.get(), MomentStatus::UnComplete));
        assert_eq!(inflight.get(p2.get()).unwrap().status, MomentStatus::UnComplete);
        assert!(inflight.remove(p1.get()).is_some());
        assert!(inflight.remove(p1.get()).is_none());
        assert_eq!(inflight.len(), 1);
        assert!(inflight.has_credit());
    }

    #[test]
    fn restored_ids_are_skipped() {
        let mut inflight = OutInflight::new(16, Duration::from_secs(1), Duration::from_secs(1));
        inflight.restore(vec![msg(1, MomentStatus::UnAck), msg(2, MomentStatus::UnComplete)]);
        assert_eq!(inflight.next_id().unwrap().get(), 3);
        assert_eq!(inflight.iter().count(), 2);
        assert_eq!(inflight.drain().len(), 2);
        assert!(inflight.is_empty());
    }

    #[test]
    fn retry_interval_backs_off_and_resets() {
        let mut inflight = OutInflight::new(16, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(inflight.interval(), Duration::from_secs(1));
        inflight.backoff();
        assert_eq!(inflight.interval(), Duration::from_secs(2));
        inflight.backoff();
        inflight.backoff();
        inflight.backoff();
        assert_eq!(inflight.interval(), Duration::from_secs(5));

        inflight.push_back(msg(9, MomentStatus::UnAck));
        inflight.remove(9);
        assert_eq!(inflight.interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_interval_disables_retry() {
        let mut inflight = OutInflight::new(16, Duration::ZERO, Duration::ZERO);
        inflight.push_back(msg(1, MomentStatus::UnAck));
        assert!(inflight.get_timeout().is_none());
        assert!(inflight.pop_front_timeout().is_none());
    }

    #[tokio::test]
    async fn timed_out_front_is_popped() {
        let mut inflight = OutInflight::new(16, Duration::from_millis(20), Duration::from_millis(100));
        inflight.push_back(msg(1, MomentStatus::UnAck));
        assert!(inflight.pop_front_timeout().is_none());
        assert!(inflight.get_timeout().unwrap() <= Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(inflight.pop_front_timeout().unwrap().packet_id(), Some(1));
    }

    #[test]
    fn inbound_duplicates() {
        let mut in_inflight = InInflight::new(2);
        let p1 = NonZeroU16::new(1).unwrap();
        assert!(in_inflight.add(p1).unwrap());
        assert!(!in_inflight.add(p1).unwrap());
        assert!(in_inflight.add(NonZeroU16::new(2).unwrap()).unwrap());
        assert!(in_inflight.add(NonZeroU16::new(3).unwrap()).is_err());
        assert!(in_inflight.remove(p1));
        assert_eq!(in_inflight.len(), 1);

        let mut successor = InInflight::new(2);
        successor.restore(in_inflight.drain());
        assert!(in_inflight.is_empty());
        assert!(!successor.add(NonZeroU16::new(2).unwrap()).unwrap());
    }
}
