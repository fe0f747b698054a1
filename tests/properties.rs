use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use codec::{AddressKey, Dscp, TimePoint};
use session::{FinalState, MeasurementSession, ResultTable, SessionTable};

fn peer() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50)), 60666)
}

/// A session's sequence numbers are dense and strictly monotonic across its
/// whole lifetime, with no gaps, regardless of how many PINGs fire.
#[test]
fn session_sequence_numbers_stay_dense_and_monotonic() {
    let mut table = SessionTable::new();
    table.add(MeasurementSession::new(1, peer(), Duration::from_millis(1), Dscp::new(10)));
    table.get_mut(1).unwrap().mark_hello_received();

    let now = Instant::now();
    let seqs: Vec<u32> = (0..10).map(|_| table.get_mut(1).unwrap().emit_next(now)).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
}

/// Every `ResultTable` entry resolves to exactly one terminal state and is
/// removed from the table once it does — there is no lingering entry after
/// a `record_pong`/`record_time_report` pair, or after a timeout sweep.
#[test]
fn every_entry_resolves_to_exactly_one_terminal_state_and_is_removed() {
    let addr = AddressKey::from_ip(peer().ip());
    let mut table = ResultTable::new();
    let now = Instant::now();
    let dscp = Dscp::new(10);

    // Completed via pong + time report.
    table.record_sent(addr, 1, 1, dscp, TimePoint::new(1, 0), now);
    let _ = table.record_time_report(addr, 1, 1, TimePoint::new(1, 1), TimePoint::new(1, 2));
    let a = table.record_pong(addr, 1, 1, TimePoint::new(1, 3), dscp).unwrap();
    assert_eq!(a.state, FinalState::Ok);

    // Completed via timeout sweep.
    table.record_sent(addr, 1, 2, dscp, TimePoint::new(2, 0), now);
    let swept = table.sweep_timeouts(now + Duration::from_secs(10), Duration::from_secs(1));
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].state, FinalState::Timeout);

    assert!(table.is_empty(), "no entry should survive past its terminal classification");
}

/// `loss% = (timeout + pong_loss) / total`, computed from a mixed batch of
/// outcomes, matches a hand count of the same batch.
#[test]
fn aggregate_counters_match_a_hand_count_of_outcomes() {
    let addr = AddressKey::from_ip(peer().ip());
    let mut table = ResultTable::new();
    let now = Instant::now();
    let dscp = Dscp::new(10);
    let deadline = Duration::from_secs(1);
    let later = now + Duration::from_secs(10);

    // One Ok.
    table.record_sent(addr, 1, 1, dscp, TimePoint::new(1, 0), now);
    let _ = table.record_time_report(addr, 1, 1, TimePoint::new(1, 1), TimePoint::new(1, 2));
    let ok = table.record_pong(addr, 1, 1, TimePoint::new(1, 3), dscp).unwrap();

    // One PongLoss (time report only).
    table.record_sent(addr, 1, 2, dscp, TimePoint::new(2, 0), now);
    let _ = table.record_time_report(addr, 1, 2, TimePoint::new(2, 1), TimePoint::new(2, 2));

    // One Timeout (nothing).
    table.record_sent(addr, 1, 3, dscp, TimePoint::new(3, 0), now);

    let mut finished = vec![ok];
    finished.extend(table.sweep_timeouts(later, deadline));

    let total = finished.len() as f64;
    let timeout_like = finished
        .iter()
        .filter(|f| matches!(f.state, FinalState::Timeout | FinalState::PongLoss))
        .count() as f64;

    assert_eq!(finished.len(), 3);
    assert_eq!(timeout_like, 2.0);
    assert_eq!((timeout_like / total) * 100.0, 200.0 / 3.0);
}
