//! Turns classified [`FinishedResult`]s into output. Two sinks, matching
//! the original's interactive-vs-backgrounded split: a plain stdout line
//! per result plus an aggregate summary on Ctrl-C (no pipe configured), or
//! a fixed-size binary frame per result written to a named pipe for a
//! downstream collector to consume (daemon mode with `pipe_path` set).
//!
//! The original's own pipe-writer function wasn't among the retrieved
//! source files, so the frame layout below is this crate's own: one fixed
//! 33-byte record per result, in the same spirit as the UDP/TCP wire
//! formats in [`codec`].

use std::path::PathBuf;

use tokio::sync::mpsc;

use codec::AddressKey;
use session::{FinalState, FinishedResult};

const PIPE_FRAME_LEN: usize = 33;

#[derive(Debug, Default, Clone, Copy)]
struct Aggregate {
    ok: u64,
    dscp_error: u64,
    timestamp_error: u64,
    pong_loss: u64,
    timeout: u64,
    duplicate: u64,
    rtt_min_nanos: Option<i128>,
    rtt_max_nanos: Option<i128>,
    rtt_sum_nanos: i128,
    rtt_count: u64,
}

impl Aggregate {
    fn record(&mut self, finished: &FinishedResult) {
        match finished.state {
            FinalState::Ok => self.ok += 1,
            FinalState::DscpError => self.dscp_error += 1,
            FinalState::TimestampError => self.timestamp_error += 1,
            FinalState::PongLoss => self.pong_loss += 1,
            FinalState::Timeout => self.timeout += 1,
            FinalState::Duplicate => self.duplicate += 1,
        }

        if let Some(rtt) = round_trip_nanos(finished) {
            self.rtt_min_nanos = Some(self.rtt_min_nanos.map_or(rtt, |m| m.min(rtt)));
            self.rtt_max_nanos = Some(self.rtt_max_nanos.map_or(rtt, |m| m.max(rtt)));
            self.rtt_sum_nanos += rtt;
            self.rtt_count += 1;
        }
    }

    /// `total = ok + dscp_error + timestamp_error + timeout + pong_loss`
    /// (duplicates aren't outcomes of a probe this table ever tracked to
    /// completion, so they're excluded from the denominator).
    fn total(&self) -> u64 {
        self.ok + self.dscp_error + self.timestamp_error + self.timeout + self.pong_loss
    }

    fn loss_percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.timeout + self.pong_loss) as f64 / total as f64 * 100.0
    }

    fn summary(&self) -> String {
        let avg = if self.rtt_count > 0 {
            self.rtt_sum_nanos / self.rtt_count as i128
        } else {
            0
        };
        format!(
            "ok={} dscp_error={} timestamp_error={} pong_loss={} timeout={} duplicate={} rtt_min={}ns rtt_avg={}ns rtt_max={}ns loss={:.2}%",
            self.ok,
            self.dscp_error,
            self.timestamp_error,
            self.pong_loss,
            self.timeout,
            self.duplicate,
            self.rtt_min_nanos.unwrap_or(0),
            avg,
            self.rtt_max_nanos.unwrap_or(0),
            self.loss_percent(),
        )
    }
}

fn round_trip_nanos(finished: &FinishedResult) -> Option<i128> {
    finished.result.rtt_nanos()
}

pub struct Reporter {
    tx: mpsc::UnboundedSender<FinishedResult>,
}

impl Reporter {
    pub fn new(pipe_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        match pipe_path {
            Some(path) => {
                ensure_fifo(&path)?;
                tokio::spawn(run_pipe_sink(path, rx));
            }
            None => {
                tokio::spawn(run_interactive_sink(rx));
            }
        }

        Ok(Self { tx })
    }

    pub fn report(&self, finished: FinishedResult) {
        let _ = self.tx.send(finished);
    }
}

fn ensure_fifo(path: &std::path::Path) -> anyhow::Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())?;
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            anyhow::bail!("failed to create named pipe {}: {err}", path.display());
        }
    }
    Ok(())
}

fn format_line(finished: &FinishedResult) -> String {
    let addr = finished.result.addr.to_ipv6();
    let rtt = round_trip_nanos(finished).map(|n| format!("{n}ns")).unwrap_or_else(|| "n/a".to_string());
    format!(
        "{addr} probe={} seq={} state={:?} rtt={rtt}",
        finished.result.probe_id, finished.result.seq
    )
}

async fn run_interactive_sink(mut rx: mpsc::UnboundedReceiver<FinishedResult>) {
    let mut aggregate = Aggregate::default();
    loop {
        tokio::select! {
            maybe_finished = rx.recv() => {
                match maybe_finished {
                    Some(finished) => {
                        println!("{}", format_line(&finished));
                        aggregate.record(&finished);
                    }
                    None => return,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("{}", aggregate.summary());
                std::process::exit(0);
            }
        }
    }
}

async fn run_pipe_sink(path: PathBuf, mut rx: mpsc::UnboundedReceiver<FinishedResult>) {
    use tokio::io::AsyncWriteExt;

    // Opening a FIFO for writing blocks until a reader attaches, so this
    // happens on a blocking thread rather than stalling the whole task.
    let file = match tokio::task::spawn_blocking(move || std::fs::OpenOptions::new().write(true).open(&path)).await {
        Ok(Ok(file)) => file,
        Ok(Err(err)) => {
            log::error!("failed to open report pipe: {err}");
            return;
        }
        Err(err) => {
            log::error!("report pipe open task panicked: {err}");
            return;
        }
    };
    let mut file = tokio::fs::File::from_std(file);

    while let Some(finished) = rx.recv().await {
        let frame = encode_pipe_frame(&finished);
        if let Err(err) = file.write_all(&frame).await {
            log::error!("report pipe write failed: {err}");
            return;
        }
    }
}

fn encode_pipe_frame(finished: &FinishedResult) -> [u8; PIPE_FRAME_LEN] {
    let mut buf = [0u8; PIPE_FRAME_LEN];
    buf[0] = state_byte(finished.state);
    buf[1..17].copy_from_slice(&addr_bytes(finished.result.addr));
    buf[17..21].copy_from_slice(&finished.result.probe_id.to_be_bytes());
    buf[21..25].copy_from_slice(&finished.result.seq.to_be_bytes());
    let rtt = round_trip_nanos(finished).unwrap_or(0) as i64;
    buf[25..33].copy_from_slice(&rtt.to_be_bytes());
    buf
}

fn addr_bytes(addr: AddressKey) -> [u8; 16] {
    addr.to_ipv6().octets()
}

fn state_byte(state: FinalState) -> u8 {
    match state {
        FinalState::Ok => 0,
        FinalState::DscpError => 1,
        FinalState::TimestampError => 2,
        FinalState::PongLoss => 3,
        FinalState::Timeout => 4,
        FinalState::Duplicate => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{Dscp, TimePoint};
    use session::ResultTable;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn sample(dscp_matches: bool) -> FinishedResult {
        let addr = AddressKey::from_ip(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 3)));
        let expected = Dscp::new(10);
        let observed = if dscp_matches { expected } else { Dscp::new(0) };

        let mut table = ResultTable::new();
        let now = Instant::now();
        table.record_sent(addr, 1, 1, expected, TimePoint::new(1, 0), now);
        assert!(table
            .record_time_report(addr, 1, 1, TimePoint::new(1, 500), TimePoint::new(1, 600))
            .is_none());
        table
            .record_pong(addr, 1, 1, TimePoint::new(1, 1_000), observed)
            .expect("pong completes the entry")
    }

    #[test]
    fn aggregate_tracks_rtt_bounds_across_results() {
        let mut aggregate = Aggregate::default();
        aggregate.record(&sample(true));
        aggregate.record(&sample(false));
        assert_eq!(aggregate.ok, 1);
        assert_eq!(aggregate.dscp_error, 1);
        assert_eq!(aggregate.rtt_count, 2);
    }

    #[test]
    fn pipe_frame_round_trips_identifying_fields() {
        let finished = sample(true);
        let frame = encode_pipe_frame(&finished);
        assert_eq!(frame.len(), PIPE_FRAME_LEN);
        assert_eq!(frame[0], state_byte(FinalState::Ok));
        assert_eq!(u32::from_be_bytes(frame[17..21].try_into().unwrap()), 1);
    }

    #[test]
    fn loss_percent_counts_timeout_and_pong_loss_over_total() {
        let mut aggregate = Aggregate::default();
        aggregate.ok = 2;
        aggregate.timeout = 1;
        aggregate.pong_loss = 1;
        assert_eq!(aggregate.total(), 4);
        assert_eq!(aggregate.loss_percent(), 50.0);
    }

    #[test]
    fn loss_percent_is_zero_with_no_tracked_outcomes() {
        assert_eq!(Aggregate::default().loss_percent(), 0.0);
    }
}
