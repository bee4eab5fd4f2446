//! Observes locally listening TCP ports by polling `/proc/net/tcp` and
//! `/proc/net/tcp6` once a second.
//!
//! File format (space-delimited, hex-encoded; see
//! `Documentation/networking/proc_net_tcp.txt` in the kernel tree):
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
//!    0: 00000000:232C 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 86255494 ...
//! ```
//!
//! A row matters when `st` is `0A` (`TCP_LISTEN` in `include/net/tcp_states.h`);
//! the port is the hex field after the colon in `local_address`.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

const PROC_TCP: &str = "/proc/net/tcp";
const PROC_TCP6: &str = "/proc/net/tcp6";
const TCP_LISTEN: &str = "0A";

pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Parse one `/proc/net/tcp{,6}` listing into the ports of its LISTEN rows,
/// in row order. Malformed rows are skipped.
pub fn parse_proc_net_tcp(content: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[3] != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        ports.push(port);
    }
    ports
}

/// Periodic scanner over the procfs TCP tables.
pub struct ListenerScanner {
    tcp4: PathBuf,
    tcp6: PathBuf,
    interval: Duration,
}

impl ListenerScanner {
    pub fn new() -> Self {
        Self {
            tcp4: PROC_TCP.into(),
            tcp6: PROC_TCP6.into(),
            interval: SCAN_INTERVAL,
        }
    }

    /// Scan alternative table files (exercised by tests; containers normally
    /// have the standard procfs layout).
    pub fn with_sources(tcp4: impl Into<PathBuf>, tcp6: impl Into<PathBuf>) -> Self {
        Self {
            tcp4: tcp4.into(),
            tcp6: tcp6.into(),
            interval: SCAN_INTERVAL,
        }
    }

    /// One snapshot: the sorted, deduplicated union of the v4 and v6
    /// listeners. `None` when neither table could be read.
    pub fn scan(&self) -> Option<Vec<u16>> {
        let v4 = std::fs::read_to_string(&self.tcp4).ok();
        let v6 = std::fs::read_to_string(&self.tcp6).ok();
        if v4.is_none() && v6.is_none() {
            return None;
        }
        let mut ports = Vec::new();
        if let Some(content) = v4 {
            ports.extend(parse_proc_net_tcp(&content));
        }
        if let Some(content) = v6 {
            ports.extend(parse_proc_net_tcp(&content));
        }
        ports.sort_unstable();
        ports.dedup();
        Some(ports)
    }

    /// Emit the first snapshot immediately, then a snapshot per interval
    /// whenever the port set changed. A tick with no readable table emits
    /// nothing. Returns when the receiver is gone.
    pub async fn run(self, tx: mpsc::Sender<Vec<u16>>) {
        let interval = self.interval;
        watch(move || self.scan(), interval, tx).await;
    }
}

impl Default for ListenerScanner {
    fn default() -> Self {
        Self::new()
    }
}

async fn watch<F>(mut scan: F, interval: Duration, tx: mpsc::Sender<Vec<u16>>)
where
    F: FnMut() -> Option<Vec<u16>>,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous: Option<Vec<u16>> = None;

    loop {
        ticker.tick().await;
        let Some(current) = scan() else { continue };
        if previous.as_ref() == Some(&current) {
            continue;
        }
        trace!(ports = ?current, "listening ports changed");
        if tx.send(current.clone()).await.is_err() {
            return;
        }
        previous = Some(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const SAMPLE_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:232C 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 86255494 1 0000000000000000 100 0 0 10 0
   1: 00000000:006F 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 18129 1 0000000000000000 100 0 0 10 0
   2: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 86197589 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn parses_listen_rows_in_file_order() {
        assert_eq!(parse_proc_net_tcp(SAMPLE_TCP), vec![9004, 111, 80]);
    }

    #[test]
    fn skips_rows_in_other_states() {
        let content = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 100 1 0 100 0 0 10 0
   1: 0100007F:0050 01020304:1234 01 00000000:00000000 00:00000000 00000000  1000        0 200 1 0 100 0 0 10 0
   2: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 300 1 0 100 0 0 10 0
";
        assert_eq!(parse_proc_net_tcp(content), vec![22, 8080]);
    }

    #[test]
    fn skips_malformed_rows() {
        let content = "  sl  local_address rem_address   st
   garbage
   0: no_colon_here 00000000:0000 0A extra
   1: 00000000:ZZZZ 00000000:0000 0A extra
   2: 00000000:0016 00000000:0000 0A extra
";
        assert_eq!(parse_proc_net_tcp(content), vec![22]);
    }

    #[test]
    fn header_only_listing_is_empty() {
        let content = "  sl  local_address rem_address   st tx_queue\n";
        assert!(parse_proc_net_tcp(content).is_empty());
        assert!(parse_proc_net_tcp("").is_empty());
    }

    #[test]
    fn scan_merges_sorts_and_dedups_v4_and_v6() {
        let dir = std::env::temp_dir().join(format!("apf-scanner-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir failed");
        let tcp4 = dir.join("tcp");
        let tcp6 = dir.join("tcp6");
        std::fs::write(&tcp4, SAMPLE_TCP).expect("write failed");
        std::fs::write(
            &tcp6,
            "  sl  local_address rem_address st
   0: 00000000000000000000000001000000:0050 00000000000000000000000000000000:0000 0A extra
   1: 00000000000000000000000001000000:1F90 00000000000000000000000000000000:0000 0A extra
",
        )
        .expect("write failed");

        let scanner = ListenerScanner::with_sources(&tcp4, &tcp6);
        // 80 listens on both stacks and shows up once.
        assert_eq!(scanner.scan(), Some(vec![80, 111, 8080, 9004]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn scan_with_one_readable_table_still_reports() {
        let dir = std::env::temp_dir().join(format!("apf-scanner-v4only-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir failed");
        let tcp4 = dir.join("tcp");
        std::fs::write(&tcp4, SAMPLE_TCP).expect("write failed");

        let scanner = ListenerScanner::with_sources(&tcp4, dir.join("missing"));
        assert_eq!(scanner.scan(), Some(vec![80, 111, 9004]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn scan_with_no_readable_table_is_none() {
        let scanner =
            ListenerScanner::with_sources("/nonexistent/tcp", "/nonexistent/tcp6");
        assert_eq!(scanner.scan(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_suppresses_consecutive_equal_snapshots() {
        let mut script: VecDeque<Option<Vec<u16>>> = VecDeque::from(vec![
            Some(vec![80]),
            Some(vec![80]),
            Some(vec![80, 443]),
            None, // unreadable tick: nothing emitted, nothing forgotten
            Some(vec![80, 443]),
            Some(vec![80]),
        ]);

        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(watch(
            move || script.pop_front().unwrap_or(None),
            Duration::from_secs(1),
            tx,
        ));

        let mut emitted = Vec::new();
        for _ in 0..3 {
            emitted.push(rx.recv().await.expect("watch stopped early"));
        }
        assert_eq!(
            emitted,
            vec![vec![80], vec![80, 443], vec![80]],
            "first snapshot always emitted, repeats suppressed"
        );
        for pair in emitted.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }

        drop(rx);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn watch_stops_when_receiver_is_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(watch(
            || Some(vec![1, 2, 3]),
            Duration::from_secs(1),
            tx,
        ));
        drop(rx);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.is_finished());
    }
}
