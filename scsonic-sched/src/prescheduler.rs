//! Time-ordered dispatch queue for far-future bundles.
//!
//! A single worker thread owns a min-heap keyed on `(ntp_time, sequence)`
//! and a FIFO retry queue for buffer-full failures. The thread sleeps on
//! its command channel with a demand-driven deadline: the earliest event's
//! execution time minus the lookahead. Cancellation filters the heap by
//! run tag and/or session id; `cancel_all` acknowledges so `purge` can
//! proceed once the heap is provably empty.
//!
//! Ordering: events with distinct NTP times dispatch in NTP order; equal
//! times dispatch in schedule order (the sequence tiebreak). Once an event
//! parks in the retry queue, later events queue behind it rather than
//! overtake, so successful dispatches stay monotonic in NTP.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use scsonic_types::{Error, Result, SessionId, SourceId};

use crate::classify::bundle_timetag;
use crate::ntp::{timetag_to_ntp, NtpClock};
use crate::sink::DispatchSink;
use crate::stats::SchedulerStats;

/// Bundles timestamped further ahead than this are refused.
pub const MAX_SCHEDULE_AHEAD_SECS: f64 = 3600.0;

/// The space helper parks at most this long before reporting back, so a
/// stalled consumer cannot leave retries unserviced forever.
const SPACE_WAIT_SLICE: Duration = Duration::from_millis(250);

/// Prescheduler tuning, resolved from the session config and the engine
/// layout.
#[derive(Debug, Clone)]
pub struct PreschedulerConfig {
    /// Combined heap + retry-queue capacity (`max_pending`).
    pub capacity: usize,
    /// Dispatch lookahead in seconds.
    pub lookahead: f64,
    /// Engine scheduler slot size; larger bundles are refused.
    pub slot_bytes: usize,
}

struct ScheduledEvent {
    ntp_time: f64,
    seq: u64,
    session_id: SessionId,
    run_tag: Option<String>,
    payload: Vec<u8>,
    source: SourceId,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; the ordering is reversed so peek() yields the
// earliest (ntp_time, seq).
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .ntp_time
            .total_cmp(&self.ntp_time)
            .then(other.seq.cmp(&self.seq))
    }
}

struct RetryEntry {
    payload: Vec<u8>,
    context: &'static str,
    enqueued: Instant,
    source: SourceId,
}

enum SchedCmd {
    Schedule {
        datagram: Vec<u8>,
        session_id: SessionId,
        run_tag: Option<String>,
        source: SourceId,
        reply: Sender<Result<()>>,
    },
    /// Bypass traffic that lost the direct-write race; delivered through
    /// the blocking path, retry-parked on a full buffer.
    DirectDispatch {
        datagram: Vec<u8>,
        source: SourceId,
    },
    CancelTag(String),
    CancelSession(SessionId),
    CancelSessionTag(SessionId, String),
    CancelAll {
        ack: Option<Sender<()>>,
    },
    SpaceAvailable,
    Shutdown,
}

/// Handle to the scheduler worker. Cloneable senders are cheap; the
/// worker joins on drop.
pub struct Prescheduler {
    tx: Sender<SchedCmd>,
    stats: Arc<SchedulerStats>,
    handle: Option<JoinHandle<()>>,
}

impl Prescheduler {
    /// Spawn the worker thread.
    pub fn spawn(
        sink: Arc<dyn DispatchSink>,
        clock: NtpClock,
        config: PreschedulerConfig,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let worker = Worker {
            rx,
            tx: tx.clone(),
            sink,
            clock,
            config,
            heap: BinaryHeap::new(),
            retry: VecDeque::new(),
            next_seq: 0,
            next_dispatch_at: f64::INFINITY,
            waiting_for_space: false,
            stats: Arc::clone(&stats),
        };
        let handle = thread::Builder::new()
            .name("sched".into())
            .spawn(move || worker.run())
            .expect("failed to spawn sched thread");
        Self {
            tx,
            stats,
            handle: Some(handle),
        }
    }

    /// Queue a datagram for time-ordered dispatch. Rejections
    /// (`QueueFull`, `BundleTooLarge`, `BundleTooFarFuture`) come back
    /// synchronously.
    pub fn schedule(
        &self,
        datagram: Vec<u8>,
        session_id: SessionId,
        run_tag: Option<String>,
        source: SourceId,
    ) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(SchedCmd::Schedule {
                datagram,
                session_id,
                run_tag,
                source,
                reply,
            })
            .map_err(|_| Error::Disconnected("prescheduler"))?;
        rx.recv().map_err(|_| Error::Disconnected("prescheduler"))?
    }

    /// Hand over a bypass datagram that lost the direct-write race.
    pub fn direct_dispatch(&self, datagram: Vec<u8>, source: SourceId) -> Result<()> {
        self.stats
            .direct_fallback
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tx
            .send(SchedCmd::DirectDispatch { datagram, source })
            .map_err(|_| Error::Disconnected("prescheduler"))
    }

    pub fn cancel_tag(&self, tag: &str) {
        let _ = self.tx.send(SchedCmd::CancelTag(tag.to_string()));
    }

    pub fn cancel_session(&self, session_id: SessionId) {
        let _ = self.tx.send(SchedCmd::CancelSession(session_id));
    }

    pub fn cancel_session_tag(&self, session_id: SessionId, tag: &str) {
        let _ = self
            .tx
            .send(SchedCmd::CancelSessionTag(session_id, tag.to_string()));
    }

    /// Fire-and-forget cancel of everything pending.
    pub fn cancel_all(&self) {
        let _ = self.tx.send(SchedCmd::CancelAll { ack: None });
    }

    /// Cancel everything and wait until the worker confirms the heap is
    /// empty. Used by `purge`.
    pub fn cancel_all_acked(&self, timeout: Duration) -> Result<()> {
        let (ack, rx) = bounded(1);
        self.tx
            .send(SchedCmd::CancelAll { ack: Some(ack) })
            .map_err(|_| Error::Disconnected("prescheduler"))?;
        rx.recv_timeout(timeout)
            .map_err(|_| Error::Disconnected("prescheduler"))
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// A cloneable sending-side port for channel handles and other
    /// contexts that must not own the worker.
    pub fn port(&self) -> SchedulerPort {
        SchedulerPort {
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Schedule/dispatch access without ownership of the worker.
#[derive(Clone)]
pub struct SchedulerPort {
    tx: Sender<SchedCmd>,
    stats: Arc<SchedulerStats>,
}

impl SchedulerPort {
    pub fn schedule(
        &self,
        datagram: Vec<u8>,
        session_id: SessionId,
        run_tag: Option<String>,
        source: SourceId,
    ) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(SchedCmd::Schedule {
                datagram,
                session_id,
                run_tag,
                source,
                reply,
            })
            .map_err(|_| Error::Disconnected("prescheduler"))?;
        rx.recv().map_err(|_| Error::Disconnected("prescheduler"))?
    }

    pub fn direct_dispatch(&self, datagram: Vec<u8>, source: SourceId) -> Result<()> {
        self.stats
            .direct_fallback
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tx
            .send(SchedCmd::DirectDispatch { datagram, source })
            .map_err(|_| Error::Disconnected("prescheduler"))
    }
}

impl Drop for Prescheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(SchedCmd::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    rx: Receiver<SchedCmd>,
    /// Loop-back sender for the space helper.
    tx: Sender<SchedCmd>,
    sink: Arc<dyn DispatchSink>,
    clock: NtpClock,
    config: PreschedulerConfig,
    heap: BinaryHeap<ScheduledEvent>,
    retry: VecDeque<RetryEntry>,
    next_seq: u64,
    /// NTP time of the pending wakeup; +inf when idle.
    next_dispatch_at: f64,
    waiting_for_space: bool,
    stats: Arc<SchedulerStats>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let cmd = if self.next_dispatch_at.is_finite() {
                let delay = (self.next_dispatch_at - self.clock.now()).max(0.0);
                match self
                    .rx
                    .recv_timeout(Duration::from_secs_f64(delay.min(3600.0)))
                {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => {
                        self.tick();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                }
            };

            match cmd {
                SchedCmd::Schedule {
                    datagram,
                    session_id,
                    run_tag,
                    source,
                    reply,
                } => {
                    let result = self.handle_schedule(datagram, session_id, run_tag, source);
                    let _ = reply.send(result);
                }
                SchedCmd::DirectDispatch { datagram, source } => {
                    self.dispatch_or_park(datagram, source, "direct-dispatch");
                }
                SchedCmd::CancelTag(tag) => {
                    self.cancel_where(|e| e.run_tag.as_deref() == Some(tag.as_str()));
                }
                SchedCmd::CancelSession(sid) => {
                    self.cancel_where(|e| e.session_id == sid);
                }
                SchedCmd::CancelSessionTag(sid, tag) => {
                    self.cancel_where(|e| {
                        e.session_id == sid && e.run_tag.as_deref() == Some(tag.as_str())
                    });
                }
                SchedCmd::CancelAll { ack } => {
                    self.cancel_everything();
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                SchedCmd::SpaceAvailable => self.drain_retry(),
                SchedCmd::Shutdown => break,
            }
        }
    }

    fn pending(&self) -> usize {
        self.heap.len() + self.retry.len()
    }

    fn handle_schedule(
        &mut self,
        datagram: Vec<u8>,
        session_id: SessionId,
        run_tag: Option<String>,
        source: SourceId,
    ) -> Result<()> {
        let pending = self.pending();
        if pending >= self.config.capacity {
            self.stats
                .queue_full
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(Error::QueueFull {
                pending,
                capacity: self.config.capacity,
            });
        }

        // No timetag to honour: deliver through the blocking path now.
        let ntp_time = match bundle_timetag(&datagram) {
            Some((s, f)) if !(s == 0 && f <= 1) => timetag_to_ntp(s, f),
            _ => {
                self.dispatch_or_park(datagram, source, "schedule-immediate");
                return Ok(());
            }
        };

        if datagram.len() > self.config.slot_bytes {
            return Err(Error::BundleTooLarge {
                size: datagram.len(),
                limit: self.config.slot_bytes,
            });
        }
        let ahead = ntp_time - self.clock.now();
        if ahead > MAX_SCHEDULE_AHEAD_SECS {
            return Err(Error::BundleTooFarFuture {
                ahead,
                limit: MAX_SCHEDULE_AHEAD_SECS,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEvent {
            ntp_time,
            seq,
            session_id,
            run_tag,
            payload: datagram,
            source,
        });
        self.stats
            .scheduled
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.stats.set_pending(self.pending());
        self.reschedule();
        Ok(())
    }

    /// Recompute the wakeup deadline. The timer only moves earlier here;
    /// `tick` resets it after dispatching.
    fn reschedule(&mut self) {
        match self.heap.peek() {
            None => self.next_dispatch_at = f64::INFINITY,
            Some(peek) => {
                let target = peek.ntp_time - self.config.lookahead;
                if target < self.next_dispatch_at {
                    self.next_dispatch_at = target;
                }
            }
        }
    }

    fn tick(&mut self) {
        self.next_dispatch_at = f64::INFINITY;
        let now = self.clock.now();
        while let Some(peek) = self.heap.peek() {
            if peek.ntp_time > now + self.config.lookahead {
                break;
            }
            let event = self.heap.pop().expect("peeked event");
            let diff = event.ntp_time - now;
            if diff < 0.0 {
                self.stats.observe_late((-diff * 1000.0) as u32);
            } else {
                self.stats.observe_headroom((diff * 1000.0) as u32);
            }
            self.dispatch_or_park(event.payload, event.source, "scheduled");
        }
        self.stats.set_pending(self.pending());
        self.reschedule();
    }

    fn dispatch_or_park(&mut self, payload: Vec<u8>, source: SourceId, context: &'static str) {
        if !self.retry.is_empty() {
            // Nothing overtakes parked events; order stays monotonic.
            self.park(payload, source, context);
            return;
        }
        match self.sink.dispatch(&payload, source) {
            Ok(()) => {
                self.stats
                    .dispatched
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(Error::BufferFull) => self.park(payload, source, context),
            Err(e) => {
                log::warn!(target: "sched", "dropping {context} datagram from source {source}: {e}");
            }
        }
    }

    fn park(&mut self, payload: Vec<u8>, source: SourceId, context: &'static str) {
        self.retry.push_back(RetryEntry {
            payload,
            context,
            enqueued: Instant::now(),
            source,
        });
        self.stats
            .retry_queued
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.stats.set_pending(self.pending());
        self.arm_space_wait();
    }

    fn arm_space_wait(&mut self) {
        if self.waiting_for_space {
            return;
        }
        self.waiting_for_space = true;
        let token = self.sink.space_token();
        let sink = Arc::clone(&self.sink);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name("sched-space".into())
            .spawn(move || {
                sink.wait_for_space(token, SPACE_WAIT_SLICE);
                let _ = tx.send(SchedCmd::SpaceAvailable);
            });
        if spawned.is_err() {
            self.waiting_for_space = false;
            log::error!(target: "sched", "could not spawn space-wait helper");
        }
    }

    fn drain_retry(&mut self) {
        self.waiting_for_space = false;
        while let Some(front) = self.retry.front() {
            match self.sink.dispatch(&front.payload, front.source) {
                Ok(()) => {
                    let entry = self.retry.pop_front().expect("fronted entry");
                    self.stats
                        .retry_succeeded
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.stats
                        .dispatched
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    log::debug!(
                        target: "sched",
                        "retried {} datagram after {:?}",
                        entry.context,
                        entry.enqueued.elapsed()
                    );
                }
                Err(Error::BufferFull) => {
                    self.stats
                        .retry_requeued
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    let entry = self.retry.pop_front().expect("fronted entry");
                    log::warn!(
                        target: "sched",
                        "dropping {} datagram from source {}: {e}",
                        entry.context,
                        entry.source
                    );
                }
            }
        }
        self.stats.set_pending(self.pending());
        if !self.retry.is_empty() {
            self.arm_space_wait();
        }
    }

    fn cancel_where(&mut self, pred: impl Fn(&ScheduledEvent) -> bool) {
        let before = self.heap.len();
        let kept: Vec<ScheduledEvent> = self.heap.drain().filter(|e| !pred(e)).collect();
        self.heap = BinaryHeap::from(kept);
        let removed = before - self.heap.len();
        if removed > 0 {
            self.stats
                .cancelled
                .fetch_add(removed as u64, std::sync::atomic::Ordering::Relaxed);
        }
        self.stats.set_pending(self.pending());
        self.reschedule();
    }

    fn cancel_everything(&mut self) {
        let removed = self.heap.len();
        self.heap.clear();
        if removed > 0 {
            self.stats
                .cancelled
                .fetch_add(removed as u64, std::sync::atomic::Ordering::Relaxed);
        }
        if !self.retry.is_empty() {
            log::info!(target: "sched", "purge dropped {} parked retries", self.retry.len());
            self.retry.clear();
        }
        self.stats.set_pending(0);
        self.reschedule();
    }
}
