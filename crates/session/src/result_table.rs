use std::time::{Duration, Instant};

use ahash::AHashMap;
use codec::{AddressKey, Dscp, TimePoint};

use crate::session::{ProbeId, SequenceNumber};

/// Identifies one outstanding PING/PONG round-trip.
pub type ResultKey = (AddressKey, ProbeId, SequenceNumber);

/// The outcome a [`ProbeResult`] is classified into once enough evidence has
/// arrived, or once the entry's deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    /// PONG received, DSCP matched, and a valid T2/T3 time report arrived.
    Ok,
    /// PONG received but the DSCP value observed on the wire does not match
    /// the session's configured DSCP — the network path remarked it.
    DscpError,
    /// PONG received but no usable T2/T3 time report arrived before the
    /// deadline.
    TimestampError,
    /// A time report arrived (so the peer did receive the PING and sent a
    /// PONG) but the PONG itself was never observed locally.
    PongLoss,
    /// Neither a PONG nor a time report arrived before the deadline.
    Timeout,
    /// A PONG arrived for a `(addr, probe_id, seq)` that was already
    /// finalized (or never sent at all).
    Duplicate,
}

/// The four timestamps of one round trip: T1 (local send), T2 (peer
/// receive), T3 (peer send of the reply), T4 (local receive). `t2`/`t3` are
/// only known once the TCP side-channel delivers the authoritative report;
/// until then they are `None`, distinct from `Some(TimePoint::ZERO)` which
/// means the peer's own timestamper reported no usable time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamps {
    pub t1: Option<TimePoint>,
    pub t2: Option<TimePoint>,
    pub t3: Option<TimePoint>,
    pub t4: Option<TimePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub addr: AddressKey,
    pub probe_id: ProbeId,
    pub seq: SequenceNumber,
    pub expected_dscp: Dscp,
    pub observed_dscp: Option<Dscp>,
    pub ts: Timestamps,
    created: Instant,
    got_pong: bool,
    got_time_report: bool,
}

impl ProbeResult {
    fn new(addr: AddressKey, probe_id: ProbeId, seq: SequenceNumber, expected_dscp: Dscp, t1: TimePoint, now: Instant) -> Self {
        Self {
            addr,
            probe_id,
            seq,
            expected_dscp,
            observed_dscp: None,
            ts: Timestamps {
                t1: Some(t1),
                ..Timestamps::default()
            },
            created: now,
            got_pong: false,
            got_time_report: false,
        }
    }

    fn classify_on_timeout(&self) -> FinalState {
        match (self.got_pong, self.got_time_report) {
            (true, true) => self.classify_complete(),
            (true, false) => FinalState::TimestampError,
            (false, true) => FinalState::PongLoss,
            (false, false) => FinalState::Timeout,
        }
    }

    fn classify_complete(&self) -> FinalState {
        if self.observed_dscp != Some(self.expected_dscp) {
            return FinalState::DscpError;
        }

        match self.rtt_nanos() {
            Some(rtt) if rtt >= 0 => FinalState::Ok,
            _ => FinalState::TimestampError,
        }
    }

    /// `(T4-T1) - (T3-T2)`: wall-clock round trip minus the peer's own
    /// processing delay. `None` if any timestamp is missing or is the wire
    /// zero sentinel (no usable timestamp was ever obtained for it).
    pub fn rtt_nanos(&self) -> Option<i128> {
        let (Some(t1), Some(t2), Some(t3), Some(t4)) = (self.ts.t1, self.ts.t2, self.ts.t3, self.ts.t4) else {
            return None;
        };
        if t1.is_zero() || t2.is_zero() || t3.is_zero() || t4.is_zero() {
            return None;
        }
        Some(t4.diff_nanos(&t1) - t3.diff_nanos(&t2))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedResult {
    pub key: ResultKey,
    pub state: FinalState,
    pub result: ProbeResult,
}

/// Joins `Sent`/`PongReceived`/`TimeReport` events into classified outcomes,
/// one entry per outstanding `(addr, probe_id, seq)`.
#[derive(Debug, Default)]
pub struct ResultTable {
    pending: AHashMap<ResultKey, ProbeResult>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self {
            pending: AHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every outstanding entry without emitting a terminal state for
    /// any of them. Used on a configuration reload, where the whole table
    /// is discarded in favor of a freshly built one.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Records that a PING was transmitted (T1 observed locally).
    pub fn record_sent(
        &mut self,
        addr: AddressKey,
        probe_id: ProbeId,
        seq: SequenceNumber,
        expected_dscp: Dscp,
        t1: TimePoint,
        now: Instant,
    ) {
        let key = (addr, probe_id, seq);
        self.pending
            .insert(key, ProbeResult::new(addr, probe_id, seq, expected_dscp, t1, now));
    }

    /// Records a PONG observed on the UDP socket (T4 observed locally).
    /// Returns `Some` immediately if this completes the classification, or
    /// if the PONG is a duplicate of an already-finalized or unknown probe.
    pub fn record_pong(
        &mut self,
        addr: AddressKey,
        probe_id: ProbeId,
        seq: SequenceNumber,
        t4: TimePoint,
        observed_dscp: Dscp,
    ) -> Option<FinishedResult> {
        let key = (addr, probe_id, seq);
        let Some(entry) = self.pending.get_mut(&key) else {
            return Some(FinishedResult {
                key,
                state: FinalState::Duplicate,
                result: ProbeResult::new(addr, probe_id, seq, observed_dscp, t4, Instant::now()),
            });
        };

        if entry.got_pong {
            let dup = *entry;
            return Some(FinishedResult {
                key,
                state: FinalState::Duplicate,
                result: dup,
            });
        }

        entry.got_pong = true;
        entry.ts.t4 = Some(t4);
        entry.observed_dscp = Some(observed_dscp);

        if entry.got_time_report {
            let finished = self.pending.remove(&key).unwrap();
            let state = finished.classify_complete();
            return Some(FinishedResult { key, state, result: finished });
        }
        None
    }

    /// Records the authoritative T2/T3 pair delivered over the side
    /// channel. A report for an unknown `(addr, probe_id, seq)` is dropped
    /// silently: it carries no claim about whether our own PONG arrived, so
    /// it cannot by itself be a duplicate.
    pub fn record_time_report(
        &mut self,
        addr: AddressKey,
        probe_id: ProbeId,
        seq: SequenceNumber,
        t2: TimePoint,
        t3: TimePoint,
    ) -> Option<FinishedResult> {
        let key = (addr, probe_id, seq);
        let entry = self.pending.get_mut(&key)?;

        if entry.got_time_report {
            return None;
        }
        entry.got_time_report = true;
        entry.ts.t2 = Some(t2);
        entry.ts.t3 = Some(t3);

        if entry.got_pong {
            let finished = self.pending.remove(&key).unwrap();
            let state = finished.classify_complete();
            return Some(FinishedResult { key, state, result: finished });
        }
        None
    }

    /// Sweeps entries older than `deadline`, finalizing each as
    /// `TimestampError`, `PongLoss`, or `Timeout` per whatever evidence it
    /// accumulated. Called once per scheduler tick.
    pub fn sweep_timeouts(&mut self, now: Instant, deadline: Duration) -> Vec<FinishedResult> {
        let expired: Vec<ResultKey> = self
            .pending
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.created) >= deadline)
            .map(|(k, _)| *k)
            .collect();

        expired
            .into_iter()
            .map(|key| {
                let result = self.pending.remove(&key).unwrap();
                let state = result.classify_on_timeout();
                FinishedResult { key, state, result }
            })
            .collect()
    }
}
