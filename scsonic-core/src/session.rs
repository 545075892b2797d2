//! Session lifecycle and the main client entry points.
//!
//! The session owns the shared region, the prescheduler, the reader
//! workers (shared-memory mode), the event dispatcher, and the caches
//! replayed on `reload`. It is a plain struct passed explicitly; nothing
//! here is a process-wide singleton.
//!
//! State machine: `Uninitialised → Initialising → Ready ⇄ Suspended`,
//! `Ready → Reloading → Ready`, `Ready → Shutdown → Destroyed`. `init`
//! is only legal from `Uninitialised`; operations that need a live
//! session fail with `NotInitialised` naming the state they found.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};

use scsonic_engine::{
    spawn_readers, AudioProcessor, EngineBatch, PostedSink, ProcessorCtl, ProcessorLink,
    ReaderEvent, ReaderHandles, SynthEngine,
};
use scsonic_sched::{
    DispatchSink, NtpClock, Prescheduler, PreschedulerConfig, SchedulerStats, SharedSink,
    StatsSnapshot,
};
use scsonic_shm::{status, RingWriter, SharedRegion};
use scsonic_types::metrics::METRIC_WORDS;
use scsonic_types::tree::TREE_WORDS;
use scsonic_types::{Config, Error, Event, Mode, NodeTree, OscArg, Result, StateSnapshot};

use crate::channel::{ChannelDescriptor, ChannelPath, OscChannel};
use crate::events::EventHub;
use crate::rewrite::SamplePool;

/// `sync` gives up after this long without a matching `/synced`.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `purge` waits for each acknowledgement.
const PURGE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialised,
    Initialising,
    Ready,
    Suspended,
    Reloading,
    Shutdown,
    Destroyed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Labels attached to outgoing datagrams.
#[derive(Debug, Clone, Default)]
pub struct SendMeta {
    pub session_id: scsonic_types::SessionId,
    pub run_tag: Option<String>,
    pub source: scsonic_types::SourceId,
}

type EngineFactory = Box<dyn FnMut() -> Box<dyn SynthEngine> + Send>;

/// Everything created per boot (and torn down on reload/destroy).
pub(crate) struct Runtime {
    pub(crate) region: Arc<SharedRegion>,
    pub(crate) clock: NtpClock,
    pub(crate) writer: Option<Arc<RingWriter>>,
    pub(crate) posted: Option<Arc<PostedSink>>,
    pub(crate) prescheduler: Prescheduler,
    pub(crate) link: ProcessorLink,
    processor: Option<AudioProcessor>,
    readers: Option<ReaderHandles>,
    dispatcher: Option<JoinHandle<()>>,
    engine_id: String,
    sample_rate: f64,
}

pub struct Session {
    config: Config,
    state: SessionState,
    hub: EventHub,
    stats: Arc<SchedulerStats>,
    factory: Option<EngineFactory>,
    pub(crate) runtime: Option<Runtime>,
    pub(crate) pool: Option<SamplePool>,
    sync_waiters: Arc<Mutex<HashMap<i32, Sender<()>>>>,
    next_sync_id: AtomicI32,
    /// Replies lost to sequence gaps (shared-memory mode).
    drops: Arc<AtomicU64>,
    /// `/d_recv` datagrams replayed on reload, in send order.
    pub(crate) def_cache: Vec<Vec<u8>>,
    /// Original buffer-alloc commands replayed (re-decoded) on reload.
    pub(crate) buffer_cache: Vec<(String, Vec<OscArg>)>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: SessionState::Uninitialised,
            hub: EventHub::new(),
            stats: Arc::new(SchedulerStats::new()),
            factory: None,
            runtime: None,
            pool: None,
            sync_waiters: Arc::new(Mutex::new(HashMap::new())),
            next_sync_id: AtomicI32::new(1),
            drops: Arc::new(AtomicU64::new(0)),
            def_cache: Vec::new(),
            buffer_cache: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventHub {
        &self.hub
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_ref(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// Engine sample rate for rewrites, before/after the runtime exists.
    pub(crate) fn sample_rate_hint(&self) -> f32 {
        self.runtime
            .as_ref()
            .map(|rt| rt.sample_rate as f32)
            .unwrap_or(48_000.0)
    }

    /// Replies lost to sequence gaps since init.
    pub fn dropped_replies(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn engine_id(&self) -> Option<&str> {
        self.runtime.as_ref().map(|rt| rt.engine_id.as_str())
    }

    pub(crate) fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| Error::NotInitialised(self.state.to_string()))
    }

    fn ensure_ready(&self) -> Result<&Runtime> {
        if self.state != SessionState::Ready {
            return Err(Error::NotInitialised(self.state.to_string()));
        }
        self.runtime()
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Bring the session up: build the engine, the region, the workers,
    /// then fire `setup` and `ready`. Only legal from `Uninitialised`.
    pub fn init(
        &mut self,
        factory: impl FnMut() -> Box<dyn SynthEngine> + Send + 'static,
        sample_rate: f64,
    ) -> Result<()> {
        if self.state != SessionState::Uninitialised {
            return Err(Error::NotInitialised(self.state.to_string()));
        }
        self.state = SessionState::Initialising;
        self.factory = Some(Box::new(factory));

        if let Err(e) = self.boot(sample_rate) {
            self.state = SessionState::Uninitialised;
            return Err(e);
        }

        self.hub.emit(&Event::Setup);
        self.state = SessionState::Ready;
        self.hub.emit(&Event::Ready);
        Ok(())
    }

    fn boot(&mut self, sample_rate: f64) -> Result<()> {
        let factory = self.factory.as_mut().expect("factory set before boot");
        let mut engine = factory();
        let layout = engine.layout();
        let region = Arc::new(SharedRegion::new(layout.clone())?);

        let clock = NtpClock::new();
        region.write_f64(layout.ntp_start_offset, clock.start_ntp());
        engine.init(&region, sample_rate, &self.config.world)?;
        let engine_id = engine.id_string().to_string();
        log::info!(target: "session", "engine up: {engine_id}");

        let (processor, link) = AudioProcessor::new(
            engine,
            Arc::clone(&region),
            self.config.mode,
            sample_rate,
            Duration::from_millis(self.config.snapshot_interval_ms),
        );

        let (writer, posted, sink, readers, reader_rx): (
            Option<Arc<RingWriter>>,
            Option<Arc<PostedSink>>,
            Arc<dyn DispatchSink>,
            Option<ReaderHandles>,
            Option<Receiver<ReaderEvent>>,
        ) = match self.config.mode {
            Mode::SharedMemory => {
                let writer = Arc::new(RingWriter::new(Arc::clone(&region)));
                let sink: Arc<dyn DispatchSink> =
                    Arc::new(SharedSink::new(Arc::clone(&writer)));
                let (tx, rx) = unbounded();
                let readers = spawn_readers(Arc::clone(&region), tx);
                (Some(writer), None, sink, Some(readers), Some(rx))
            }
            Mode::MessagePassing => {
                let posted = Arc::new(
                    link.posted_sink()
                        .expect("message-passing link always has a posted sink"),
                );
                let sink: Arc<dyn DispatchSink> = Arc::clone(&posted) as Arc<dyn DispatchSink>;
                (None, Some(posted), sink, None, None)
            }
        };

        let prescheduler = Prescheduler::spawn(
            sink,
            clock.clone(),
            PreschedulerConfig {
                capacity: self.config.prescheduler_capacity,
                lookahead: self.config.bypass_lookahead,
                slot_bytes: layout.scheduler_slot_bytes,
            },
            Arc::clone(&self.stats),
        );

        let dispatcher = spawn_dispatcher(
            self.hub.clone(),
            Arc::clone(&self.sync_waiters),
            Arc::clone(&self.drops),
            link.batch_rx.clone(),
            reader_rx,
        );

        self.pool = Some(SamplePool::new(layout.sample_pool));
        self.runtime = Some(Runtime {
            region,
            clock,
            writer,
            posted,
            prescheduler,
            link,
            processor: Some(processor),
            readers,
            dispatcher: Some(dispatcher),
            engine_id,
            sample_rate,
        });
        Ok(())
    }

    fn teardown(&mut self) {
        self.sync_waiters.lock().unwrap().clear();
        if let Some(mut rt) = self.runtime.take() {
            // Dropping the prescheduler joins its worker.
            drop(rt.prescheduler);
            if let Some(readers) = rt.readers.take() {
                readers.shutdown();
            }
            // If the host still owns the processor the dispatcher exits
            // once the host drops it; never block on that here.
            drop(rt.processor.take());
            drop(rt.dispatcher.take());
        }
        self.pool = None;
    }

    /// Hand the processor to the host driver (cpal, a worklet shim, or a
    /// test loop). Each boot creates exactly one.
    pub fn take_processor(&mut self) -> Option<AudioProcessor> {
        self.runtime.as_mut().and_then(|rt| rt.processor.take())
    }

    /// Pause: no new events fire and sends are refused until `resume`.
    pub fn suspend(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.state = SessionState::Suspended;
        log::info!(target: "session", "suspended");
        Ok(())
    }

    /// Purge stale work, restart, and re-sync. Emits `resumed`.
    pub fn resume(&mut self) -> Result<()> {
        if self.state != SessionState::Suspended {
            return Err(Error::NotInitialised(self.state.to_string()));
        }
        self.state = SessionState::Ready;
        self.purge()?;
        if let Err(e) = self.sync_with_timeout(Duration::from_secs(2)) {
            log::warn!(target: "session", "post-resume sync failed: {e}");
        }
        self.hub.emit(&Event::Resumed);
        Ok(())
    }

    /// Tear the engine down and rebuild it, replaying cached synth
    /// definitions and buffer loads, then fire `setup` so clients rebuild
    /// groups and routing.
    pub fn reload(&mut self) -> Result<()> {
        let sample_rate = self.runtime()?.sample_rate;
        if !matches!(self.state, SessionState::Ready | SessionState::Suspended) {
            return Err(Error::NotInitialised(self.state.to_string()));
        }
        self.state = SessionState::Reloading;
        self.teardown();
        if let Err(e) = self.boot(sample_rate) {
            self.state = SessionState::Shutdown;
            return Err(e);
        }

        // Definitions before buffers, as clients sent them originally.
        let defs: Vec<Vec<u8>> = self.def_cache.clone();
        for datagram in defs {
            if let Err(e) = self.deliver_bypass(&datagram, scsonic_types::MAIN_SOURCE) {
                log::warn!(target: "session", "definition replay failed: {e}");
            }
        }
        let buffers = std::mem::take(&mut self.buffer_cache);
        for (addr, args) in &buffers {
            if let Err(e) = self.replay_buffer_command(addr, args.clone()) {
                log::warn!(target: "session", "buffer replay of {addr} failed: {e}");
            }
        }
        self.buffer_cache = buffers;

        self.hub.emit(&Event::Setup);
        self.state = SessionState::Ready;
        self.hub.emit(&Event::Ready);
        Ok(())
    }

    /// Resume if possible, otherwise rebuild from scratch.
    pub fn recover(&mut self) -> Result<()> {
        match self.resume() {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(target: "session", "resume failed ({e}), reloading");
                self.reload()
            }
        }
    }

    /// Purge pending work and free every node under the root group.
    pub fn reset(&mut self) -> Result<()> {
        self.purge()?;
        self.send_message("/g_freeAll", vec![OscArg::I32(0)])?;
        if let Err(e) = self.sync_with_timeout(Duration::from_secs(2)) {
            log::warn!(target: "session", "post-reset sync failed: {e}");
        }
        Ok(())
    }

    /// Stop the engine and the workers. The session keeps its
    /// subscribers; `destroy` removes those too.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            let _ = self.send_message("/quit", vec![]);
        }
        self.teardown();
        self.state = SessionState::Shutdown;
        Ok(())
    }

    /// Release everything. The session is unusable afterwards.
    pub fn destroy(&mut self) {
        self.teardown();
        self.hub.remove_all(None);
        self.def_cache.clear();
        self.buffer_cache.clear();
        self.state = SessionState::Destroyed;
    }

    // ── Fences ────────────────────────────────────────────────────

    /// Round-trip fence: resolves when the engine answers `/synced`.
    pub fn sync(&self) -> Result<()> {
        self.sync_with_timeout(SYNC_TIMEOUT)
    }

    pub fn sync_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_ready()?;
        let id = self.next_sync_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.sync_waiters.lock().unwrap().insert(id, tx);

        if let Err(e) = self.send_message("/sync", vec![OscArg::I32(id)]) {
            self.sync_waiters.lock().unwrap().remove(&id);
            return Err(e);
        }
        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.sync_waiters.lock().unwrap().remove(&id);
                Err(Error::SyncTimeout(id))
            }
        }
    }

    /// Guarantee that nothing scheduled before this call can reach the
    /// engine: empty the prescheduler (acknowledged), then have the audio
    /// thread drain IN and clear the engine's internal scheduler
    /// (acknowledged on its next callback).
    pub fn purge(&self) -> Result<()> {
        let rt = self.ensure_ready()?;
        rt.prescheduler.cancel_all_acked(PURGE_ACK_TIMEOUT)?;

        let (ack, rx) = bounded(1);
        rt.link
            .ctl_tx
            .send(ProcessorCtl::ClearScheduler { ack })
            .map_err(|_| Error::Disconnected("audio processor"))?;
        rx.recv_timeout(PURGE_ACK_TIMEOUT)
            .map_err(|_| Error::Disconnected("audio processor"))
    }

    // ── Cancellation (fire-and-forget) ────────────────────────────

    pub fn cancel_tag(&self, tag: &str) -> Result<()> {
        Ok(self.runtime()?.prescheduler.cancel_tag(tag))
    }

    pub fn cancel_session(&self, session_id: scsonic_types::SessionId) -> Result<()> {
        Ok(self.runtime()?.prescheduler.cancel_session(session_id))
    }

    pub fn cancel_session_tag(
        &self,
        session_id: scsonic_types::SessionId,
        tag: &str,
    ) -> Result<()> {
        Ok(self
            .runtime()?
            .prescheduler
            .cancel_session_tag(session_id, tag))
    }

    pub fn cancel_all(&self) -> Result<()> {
        Ok(self.runtime()?.prescheduler.cancel_all())
    }

    // ── Observability ─────────────────────────────────────────────

    /// Read the node tree with the version/retry protocol.
    pub fn tree(&self) -> Result<NodeTree> {
        let rt = self.runtime()?;
        let layout = rt.region.layout();
        let mut bytes = vec![0u8; TREE_WORDS * 4];
        let version_cell = rt.region.atomic_at(layout.tree_offset + 4);

        let mut tree = NodeTree::default();
        for _ in 0..8 {
            let v1 = version_cell.load(Ordering::Acquire);
            rt.region.copy_out(layout.tree_offset, &mut bytes);
            let v2 = version_cell.load(Ordering::Acquire);
            let words: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            tree = NodeTree::from_words(&words);
            if v1 == v2 {
                return Ok(tree);
            }
        }
        log::warn!(target: "session", "tree read raced 8 times, returning last capture");
        Ok(tree)
    }

    /// A copy of the engine metrics block.
    pub fn metrics(&self) -> Result<Vec<u32>> {
        let rt = self.runtime()?;
        let layout = rt.region.layout();
        let mut bytes = vec![0u8; METRIC_WORDS * 4];
        rt.region.copy_out(layout.metrics_offset, &mut bytes);
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Capture metrics + tree right now and serialise them for tooling
    /// (diagnostics dumps, golden files).
    pub fn snapshot_json(&self) -> Result<String> {
        let snapshot = StateSnapshot {
            metrics: self.metrics()?,
            tree: self.tree()?,
        };
        serde_json::to_string_pretty(&snapshot).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Raw status flag word.
    pub fn status_flags(&self) -> Result<u32> {
        let rt = self.runtime()?;
        Ok(rt
            .region
            .control(scsonic_shm::ControlWord::Status)
            .load(Ordering::Acquire))
    }

    // ── Channels ──────────────────────────────────────────────────

    /// Mint a transferable input capability for another context.
    pub fn create_channel(
        &self,
        source: scsonic_types::SourceId,
        blocking: bool,
    ) -> Result<OscChannel> {
        let rt = self.ensure_ready()?;
        let path = match (&rt.writer, &rt.posted) {
            (Some(writer), _) => ChannelPath::Shared(Arc::clone(writer)),
            (None, Some(posted)) => ChannelPath::Posted(Arc::clone(posted)),
            _ => return Err(Error::NotInitialised(self.state.to_string())),
        };
        Ok(OscChannel {
            path,
            sched: rt.prescheduler.port(),
            clock: rt.clock.clone(),
            bypass_lookahead: self.config.bypass_lookahead,
            source,
            blocking,
        })
    }

    /// Reattach a descriptor minted by this session (or its twin on the
    /// other side of a context boundary).
    pub fn channel_from_descriptor(&self, descriptor: &ChannelDescriptor) -> Result<OscChannel> {
        if descriptor.mode != self.config.mode {
            return Err(Error::InvalidLayout(format!(
                "channel descriptor mode {:?} does not match session mode {:?}",
                descriptor.mode, self.config.mode
            )));
        }
        let mut channel = self.create_channel(descriptor.source, descriptor.blocking)?;
        channel.bypass_lookahead = descriptor.bypass_lookahead;
        Ok(channel)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ── Event dispatcher ──────────────────────────────────────────────

fn spawn_dispatcher(
    hub: EventHub,
    waiters: Arc<Mutex<HashMap<i32, Sender<()>>>>,
    drops: Arc<AtomicU64>,
    batch_rx: Receiver<EngineBatch>,
    reader_rx: Option<Receiver<ReaderEvent>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("events".into())
        .spawn(move || {
            let mut batch_rx = batch_rx;
            let mut batch_open = true;
            let mut reader_open = reader_rx.is_some();
            let mut reader_rx = reader_rx.unwrap_or_else(never);

            while batch_open || reader_open {
                select! {
                    recv(batch_rx) -> msg => match msg {
                        Ok(batch) => handle_batch(&hub, &waiters, batch),
                        Err(_) => {
                            batch_open = false;
                            batch_rx = never();
                        }
                    },
                    recv(reader_rx) -> msg => match msg {
                        Ok(event) => handle_reader_event(&hub, &waiters, &drops, event),
                        Err(_) => {
                            reader_open = false;
                            reader_rx = never();
                        }
                    },
                }
            }
        })
        .expect("failed to spawn events thread")
}

fn deliver_reply(
    hub: &EventHub,
    waiters: &Arc<Mutex<HashMap<i32, Sender<()>>>>,
    packet: rosc::OscPacket,
) {
    match packet {
        rosc::OscPacket::Message(msg) => {
            if msg.addr == "/synced" {
                if let Some(rosc::OscType::Int(id)) = msg.args.first() {
                    if let Some(tx) = waiters.lock().unwrap().remove(id) {
                        let _ = tx.send(());
                    }
                }
            }
            hub.emit(&Event::Reply(msg));
        }
        rosc::OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                deliver_reply(hub, waiters, inner);
            }
        }
    }
}

fn deliver_reply_bytes(
    hub: &EventHub,
    waiters: &Arc<Mutex<HashMap<i32, Sender<()>>>>,
    bytes: &[u8],
) {
    match rosc::decoder::decode_udp(bytes) {
        Ok((_, packet)) => deliver_reply(hub, waiters, packet),
        Err(e) => log::warn!(target: "session::events", "undecodable reply: {e}"),
    }
}

fn emit_status(hub: &EventHub, flags: u32) {
    hub.emit(&Event::Status { flags });
    if flags & status::ENGINE_ERROR != 0 {
        hub.emit(&Event::Error("engine signalled a fatal error".into()));
    }
}

fn handle_batch(
    hub: &EventHub,
    waiters: &Arc<Mutex<HashMap<i32, Sender<()>>>>,
    batch: EngineBatch,
) {
    match batch {
        EngineBatch::Replies(buf) => {
            for record in buf.records() {
                deliver_reply_bytes(hub, waiters, record);
            }
        }
        EngineBatch::Debug(buf) => {
            for record in buf.records() {
                hub.emit(&Event::Debug(scsonic_engine::readers::decode_debug_line(
                    record,
                )));
            }
        }
        EngineBatch::InLog(buf) => {
            for record in buf.records() {
                log::trace!(target: "session::osc", "in: {} bytes", record.len());
            }
        }
        EngineBatch::Snapshot(buf) => {
            let words: Vec<u32> = buf
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            if words.len() < METRIC_WORDS {
                return;
            }
            let snapshot = StateSnapshot {
                metrics: words[..METRIC_WORDS].to_vec(),
                tree: NodeTree::from_words(&words[METRIC_WORDS..]),
            };
            hub.emit(&Event::Snapshot(snapshot));
        }
        EngineBatch::Status { flags } => emit_status(hub, flags),
    }
}

fn handle_reader_event(
    hub: &EventHub,
    waiters: &Arc<Mutex<HashMap<i32, Sender<()>>>>,
    drops: &Arc<AtomicU64>,
    event: ReaderEvent,
) {
    match event {
        ReaderEvent::Replies(batch) => {
            for bytes in batch {
                deliver_reply_bytes(hub, waiters, &bytes);
            }
        }
        ReaderEvent::DebugLines(lines) => {
            for line in lines {
                hub.emit(&Event::Debug(line));
            }
        }
        ReaderEvent::Dropped { ring, count } => {
            drops.fetch_add(count as u64, Ordering::Relaxed);
            log::warn!(target: "session::events", "{count} records lost on {ring:?}");
        }
    }
}
