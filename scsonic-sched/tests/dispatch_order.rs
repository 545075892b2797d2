//! Dispatch-order guarantees under load and backpressure: NTP order for
//! distinct times, schedule order for equal times, and no overtaking
//! across the retry path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scsonic_sched::ntp::{ntp_to_timetag, NtpClock};
use scsonic_sched::{
    DispatchSink, Prescheduler, PreschedulerConfig, SchedulerStats,
};
use scsonic_types::{Result, SourceId};

struct OrderSink {
    sent: Mutex<Vec<u32>>,
    full: AtomicBool,
    token: AtomicU32,
}

impl OrderSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            full: AtomicBool::new(false),
            token: AtomicU32::new(0),
        })
    }

    fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
        if !full {
            self.token.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sources(&self) -> Vec<u32> {
        self.sent.lock().unwrap().clone()
    }
}

impl DispatchSink for OrderSink {
    fn dispatch(&self, _payload: &[u8], source: SourceId) -> Result<()> {
        if self.full.load(Ordering::SeqCst) {
            return Err(scsonic_types::Error::BufferFull);
        }
        self.sent.lock().unwrap().push(source);
        Ok(())
    }

    fn space_token(&self) -> u32 {
        self.token.load(Ordering::SeqCst)
    }

    fn wait_for_space(&self, token: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.token.load(Ordering::SeqCst) != token {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn max_payload(&self) -> usize {
        1 << 16
    }
}

fn bundle_at(ntp: f64) -> Vec<u8> {
    let tag = ntp_to_timetag(ntp);
    let mut datagram = Vec::from(*b"#bundle\0");
    datagram.extend_from_slice(&tag.seconds.to_be_bytes());
    datagram.extend_from_slice(&tag.fractional.to_be_bytes());
    datagram
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn spawn(sink: Arc<OrderSink>, clock: NtpClock) -> Prescheduler {
    Prescheduler::spawn(
        sink,
        clock,
        PreschedulerConfig {
            capacity: 1024,
            lookahead: 0.05,
            slot_bytes: 8192,
        },
        Arc::new(SchedulerStats::new()),
    )
}

#[test]
fn shuffled_times_dispatch_in_ntp_order() {
    let sink = OrderSink::new();
    let clock = NtpClock::new();
    let sched = spawn(Arc::clone(&sink), clock.clone());

    // Schedule out of order; the source id encodes the expected rank.
    let base = clock.now() + 0.2;
    let order = [4u32, 1, 3, 0, 2, 6, 5, 9, 7, 8];
    for &rank in &order {
        sched
            .schedule(bundle_at(base + rank as f64 * 0.02), 1, None, rank)
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || sink.sources().len() == 10));
    assert_eq!(sink.sources(), (0..10).collect::<Vec<u32>>());
    assert_eq!(sched.stats().snapshot().dispatched, 10);
}

#[test]
fn equal_times_keep_schedule_order() {
    let sink = OrderSink::new();
    let clock = NtpClock::new();
    let sched = spawn(Arc::clone(&sink), clock.clone());

    let at = clock.now() + 0.15;
    for rank in 0..16u32 {
        sched.schedule(bundle_at(at), 1, None, rank).unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || sink.sources().len() == 16));
    assert_eq!(sink.sources(), (0..16).collect::<Vec<u32>>());
}

#[test]
fn retry_path_never_lets_later_events_overtake() {
    let sink = OrderSink::new();
    let clock = NtpClock::new();
    let sched = spawn(Arc::clone(&sink), clock.clone());

    // The first wave hits a full buffer and parks.
    sink.set_full(true);
    let base = clock.now() + 0.1;
    for rank in 0..4u32 {
        sched
            .schedule(bundle_at(base + rank as f64 * 0.01), 1, None, rank)
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(1), || {
        sched.stats().snapshot().retry_queued >= 1
    }));

    // A second wave becomes due while retries are parked; it must queue
    // behind them, not overtake.
    for rank in 4..8u32 {
        sched
            .schedule(bundle_at(base + rank as f64 * 0.01), 1, None, rank)
            .unwrap();
    }
    thread::sleep(Duration::from_millis(150));
    assert!(sink.sources().is_empty());

    sink.set_full(false);
    assert!(wait_until(Duration::from_secs(3), || sink.sources().len() == 8));
    assert_eq!(sink.sources(), (0..8).collect::<Vec<u32>>());
}
