//! A stand-in engine for tests.
//!
//! `TestEngine` implements just enough engine behaviour to exercise the
//! transport end-to-end: `/status` and `/sync` replies, group/synth tree
//! mutation mirrored into the region with version bumps, an internal
//! bundle scheduler that honours clear-scheduler, `/b_allocPtr` buffer
//! registration, debug text, and the engine-side metrics counters. State
//! sits behind a mutex so tests keep a [`TestEngineControl`] for
//! injection and assertions while the processor owns the engine box.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use rosc::{OscMessage, OscPacket, OscType};

use scsonic_sched::ntp::timetag_to_ntp;
use scsonic_shm::{status, ControlWord, LayoutDescriptor, RingId, SharedRegion};
use scsonic_types::metrics::{MetricId, METRIC_UNSET};
use scsonic_types::tree::{NodeTreeEntry, TREE_ENTRY_WORDS, TREE_HEADER_WORDS};
use scsonic_types::{Error, Result, WorldOptions};

use crate::engine::SynthEngine;

/// A buffer the facade registered via `/b_allocPtr`.
#[derive(Debug, Clone, PartialEq)]
pub struct PtrBuffer {
    pub ptr: u64,
    pub frames: i32,
    pub channels: i32,
    pub sample_rate: f32,
    pub uuid: String,
}

struct SchedSlot {
    ntp: f64,
    seq: u64,
    content: Vec<OscPacket>,
}

struct Inner {
    sample_rate: f64,
    world: Option<WorldOptions>,
    nodes: Vec<NodeTreeEntry>,
    version: u32,
    /// Slots previously written to the mirror, so stale ones get blanked.
    mirrored: usize,
    sched: Vec<SchedSlot>,
    sched_seq: u64,
    defs_received: u32,
    buffers: HashMap<i32, PtrBuffer>,
    inject_error: bool,
    debug_queue: Vec<String>,
    callbacks: u64,
}

/// Test-side handle onto the engine's shared state.
#[derive(Clone)]
pub struct TestEngineControl {
    inner: Arc<Mutex<Inner>>,
}

impl TestEngineControl {
    /// Raise the engine-error status bit on the next block.
    pub fn inject_error(&self) {
        self.inner.lock().unwrap().inject_error = true;
    }

    /// Emit a diagnostics line on the next block.
    pub fn queue_debug(&self, line: &str) {
        self.inner.lock().unwrap().debug_queue.push(line.to_string());
    }

    pub fn defs_received(&self) -> u32 {
        self.inner.lock().unwrap().defs_received
    }

    /// The world options the engine was initialised with.
    pub fn world_options(&self) -> Option<WorldOptions> {
        self.inner.lock().unwrap().world.clone()
    }

    pub fn buffers(&self) -> Vec<(i32, PtrBuffer)> {
        let mut v: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .buffers
            .iter()
            .map(|(k, b)| (*k, b.clone()))
            .collect();
        v.sort_by_key(|(k, _)| *k);
        v
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.lock().unwrap().sched.len()
    }

    pub fn node_ids(&self) -> Vec<i32> {
        self.inner.lock().unwrap().nodes.iter().map(|n| n.id).collect()
    }
}

pub struct TestEngine {
    id: String,
    layout: LayoutDescriptor,
    inner: Arc<Mutex<Inner>>,
}

impl TestEngine {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            id: "scsonic test engine 0.1".to_string(),
            layout: LayoutDescriptor::packed(
                4096,
                32 * 1024,
                32 * 1024,
                16 * 1024,
                4096,
                1 << 20,
                2,
                128,
            ),
            inner: Arc::new(Mutex::new(Inner {
                sample_rate,
                world: None,
                nodes: Vec::new(),
                version: 0,
                mirrored: 0,
                sched: Vec::new(),
                sched_seq: 0,
                defs_received: 0,
                buffers: HashMap::new(),
                inject_error: false,
                debug_queue: Vec::new(),
                callbacks: 0,
            })),
        }
    }

    pub fn control(&self) -> TestEngineControl {
        TestEngineControl {
            inner: Arc::clone(&self.inner),
        }
    }

    fn metric_add(&self, region: &SharedRegion, id: MetricId, n: u32) {
        let off = self.layout.metrics_offset + (id as usize) * 4;
        region.atomic_at(off).fetch_add(n, Ordering::Relaxed);
    }

    fn metric_set(&self, region: &SharedRegion, id: MetricId, v: u32) {
        let off = self.layout.metrics_offset + (id as usize) * 4;
        region.atomic_at(off).store(v, Ordering::Relaxed);
    }
}

impl SynthEngine for TestEngine {
    fn id_string(&self) -> &str {
        &self.id
    }

    fn layout(&self) -> LayoutDescriptor {
        self.layout.clone()
    }

    fn init(
        &mut self,
        region: &SharedRegion,
        sample_rate: f64,
        options: &WorldOptions,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sample_rate = sample_rate;
        inner.world = Some(options.clone());

        // World options land at the head of the engine heap.
        let mut words = Vec::with_capacity(7);
        for v in [
            options.num_buffers,
            options.max_nodes,
            options.max_graph_defs,
            options.real_time_memory_kb,
            options.num_input_bus_channels,
            options.num_output_bus_channels,
            options.verbosity as u32,
        ] {
            words.extend_from_slice(&v.to_le_bytes());
        }
        region.copy_in(self.layout.engine_heap.offset, &words);

        // Root group 0 always exists.
        inner.nodes.clear();
        inner.nodes.push(NodeTreeEntry {
            id: 0,
            parent: -1,
            is_group: true,
            prev: -1,
            next: -1,
            head: -1,
            name: String::new(),
        });
        inner.version = 1;
        write_mirror(region, &self.layout, &mut inner);

        self.metric_set(region, MetricId::SampleRate, sample_rate as u32);
        self.metric_set(region, MetricId::BlockFrames, self.layout.block_frames as u32);
        self.metric_set(region, MetricId::InRingHeadroomMin, METRIC_UNSET);
        Ok(())
    }

    fn process(
        &mut self,
        region: &SharedRegion,
        clock_seconds: f64,
        out_channels: usize,
        _in_channels: usize,
    ) {
        let now_ntp = region.read_f64(self.layout.ntp_start_offset) + clock_seconds;

        // Pull everything currently in IN.
        let ring = region.ring(RingId::In);
        let mut datagrams: Vec<Vec<u8>> = Vec::new();
        let mut corrupted = 0u32;
        let mut bytes_in = 0u32;
        ring.drain(
            128,
            |info| {
                bytes_in += info.len as u32;
                datagrams.push(ring.payload(&info));
            },
            |_| corrupted += 1,
        );
        if corrupted > 0 {
            self.metric_add(region, MetricId::OscInCorrupted, corrupted);
        }
        if !datagrams.is_empty() {
            self.metric_add(region, MetricId::OscInReceived, datagrams.len() as u32);
            self.metric_add(region, MetricId::OscInBytes, bytes_in);
        }

        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        for datagram in &datagrams {
            match rosc::decoder::decode_udp(datagram) {
                Ok((_, packet)) => {
                    handle_packet(self, region, inner, now_ntp, packet);
                }
                Err(e) => {
                    self.metric_add(region, MetricId::OscInCorrupted, 1);
                    push_debug(self, region, &format!("FAILURE: malformed OSC ({e})"));
                }
            }
        }

        // Fire due internal-scheduler slots in time order.
        inner.sched.sort_by(|a, b| {
            a.ntp
                .total_cmp(&b.ntp)
                .then(a.seq.cmp(&b.seq))
        });
        while let Some(slot) = inner.sched.first() {
            if slot.ntp > now_ntp {
                break;
            }
            let slot = inner.sched.remove(0);
            for packet in slot.content {
                handle_packet(self, region, inner, now_ntp, packet);
            }
        }

        // Flush queued diagnostics.
        for line in std::mem::take(&mut inner.debug_queue) {
            push_debug(self, region, &line);
        }

        // A deterministic, quiet output block: per-channel ramp.
        let frames = self.layout.block_frames;
        let base = inner.callbacks as f32;
        inner.callbacks += 1;
        let bus = self.layout.output_bus_offset;
        for ch in 0..out_channels.min(self.layout.output_channels) {
            for frame in 0..frames {
                let v = ((base + frame as f32) % 1000.0) / 10_000.0;
                region.copy_f32_in(bus + (ch * frames + frame) * 4, &[v]);
            }
        }

        self.metric_add(region, MetricId::AudioCallbacks, 1);
        self.metric_set(region, MetricId::NodeCount, inner.nodes.len() as u32);
        self.metric_set(region, MetricId::TreeVersion, inner.version);
        self.metric_set(region, MetricId::SchedSlotsUsed, inner.sched.len() as u32);

        if inner.inject_error {
            inner.inject_error = false;
            region
                .control(ControlWord::Status)
                .fetch_or(status::ENGINE_ERROR, Ordering::AcqRel);
        }
        self.metric_set(
            region,
            MetricId::EngineStatus,
            region.control(ControlWord::Status).load(Ordering::Acquire),
        );
    }

    fn clear_scheduler(&mut self, _region: &SharedRegion) {
        self.inner.lock().unwrap().sched.clear();
    }

    fn input_bus_offset(&self) -> usize {
        self.layout.input_bus_offset
    }

    fn output_bus_offset(&self) -> usize {
        self.layout.output_bus_offset
    }
}

fn push_reply(engine: &TestEngine, region: &SharedRegion, msg: OscMessage) {
    match rosc::encoder::encode(&OscPacket::Message(msg)) {
        Ok(bytes) => match region.ring(RingId::Out).push(&bytes, 0) {
            Ok(()) => engine.metric_add(region, MetricId::OscOutSent, 1),
            Err(Error::BufferFull) => {
                region
                    .control(ControlWord::Status)
                    .fetch_or(status::OVERRUN, Ordering::AcqRel);
            }
            Err(e) => log::warn!(target: "engine::test", "reply push failed: {e}"),
        },
        Err(e) => log::warn!(target: "engine::test", "reply encode failed: {e}"),
    }
}

fn push_debug(engine: &TestEngine, region: &SharedRegion, line: &str) {
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(b'\n');
    if region.ring(RingId::Debug).push(&bytes, 0).is_ok() {
        engine.metric_add(region, MetricId::DebugLines, 1);
    }
}

fn handle_packet(
    engine: &TestEngine,
    region: &SharedRegion,
    inner: &mut Inner,
    now_ntp: f64,
    packet: OscPacket,
) {
    match packet {
        OscPacket::Message(msg) => handle_message(engine, region, inner, msg),
        OscPacket::Bundle(bundle) => {
            let t = bundle.timetag;
            let immediate = t.seconds == 0 && t.fractional <= 1;
            let ntp = timetag_to_ntp(t.seconds, t.fractional);
            if immediate || ntp <= now_ntp {
                for p in bundle.content {
                    handle_packet(engine, region, inner, now_ntp, p);
                }
            } else if inner.sched.len() < engine.layout.scheduler_slots {
                let seq = inner.sched_seq;
                inner.sched_seq += 1;
                inner.sched.push(SchedSlot {
                    ntp,
                    seq,
                    content: bundle.content,
                });
            } else {
                engine.metric_add(region, MetricId::SchedDropped, 1);
                push_debug(engine, region, "scheduler queue full, bundle dropped");
            }
        }
    }
}

fn handle_message(engine: &TestEngine, region: &SharedRegion, inner: &mut Inner, msg: OscMessage) {
    let arg_i32 = |i: usize| -> Option<i32> {
        match msg.args.get(i) {
            Some(OscType::Int(v)) => Some(*v),
            Some(OscType::Long(v)) => Some(*v as i32),
            Some(OscType::Float(v)) => Some(*v as i32),
            _ => None,
        }
    };

    match msg.addr.as_str() {
        "/status" => {
            let groups = inner.nodes.iter().filter(|n| n.is_group).count() as i32;
            let synths = inner.nodes.len() as i32 - groups;
            push_reply(
                engine,
                region,
                OscMessage {
                    addr: "/status.reply".to_string(),
                    args: vec![
                        OscType::Int(1),
                        OscType::Int(synths * 4),
                        OscType::Int(synths),
                        OscType::Int(groups),
                        OscType::Int(inner.defs_received as i32),
                        OscType::Float(0.7),
                        OscType::Float(1.9),
                        OscType::Double(inner.sample_rate),
                        OscType::Double(inner.sample_rate),
                    ],
                },
            );
        }
        "/sync" => {
            let id = arg_i32(0).unwrap_or(0);
            push_reply(
                engine,
                region,
                OscMessage {
                    addr: "/synced".to_string(),
                    args: vec![OscType::Int(id)],
                },
            );
        }
        "/notify" => {
            push_reply(
                engine,
                region,
                OscMessage {
                    addr: "/done".to_string(),
                    args: vec![OscType::String("/notify".into()), OscType::Int(0)],
                },
            );
        }
        "/g_new" => {
            let mut i = 0;
            while let (Some(id), Some(action), Some(target)) =
                (arg_i32(i), arg_i32(i + 1), arg_i32(i + 2))
            {
                add_node(inner, id, true, String::new(), action, target);
                i += 3;
            }
            write_mirror(region, &engine.layout, inner);
        }
        "/s_new" => {
            let name = match msg.args.first() {
                Some(OscType::String(s)) => s.clone(),
                _ => {
                    push_debug(engine, region, "FAILURE IN SERVER: /s_new bad args");
                    return;
                }
            };
            if let (Some(id), Some(action), Some(target)) = (arg_i32(1), arg_i32(2), arg_i32(3)) {
                add_node(inner, id, false, name, action, target);
                write_mirror(region, &engine.layout, inner);
            }
        }
        "/n_free" => {
            let mut i = 0;
            while let Some(id) = arg_i32(i) {
                free_node(inner, id);
                i += 1;
            }
            write_mirror(region, &engine.layout, inner);
        }
        "/n_set" => {
            // Parameters have no observable effect here.
        }
        "/g_freeAll" => {
            let mut i = 0;
            while let Some(group) = arg_i32(i) {
                let children: Vec<i32> = inner
                    .nodes
                    .iter()
                    .filter(|n| n.parent == group)
                    .map(|n| n.id)
                    .collect();
                for child in children {
                    free_node(inner, child);
                }
                i += 1;
            }
            write_mirror(region, &engine.layout, inner);
        }
        "/d_recv" => {
            inner.defs_received += 1;
            push_reply(
                engine,
                region,
                OscMessage {
                    addr: "/done".to_string(),
                    args: vec![OscType::String("/d_recv".into())],
                },
            );
        }
        "/b_allocPtr" => {
            let bufnum = arg_i32(0).unwrap_or(-1);
            let ptr = match msg.args.get(1) {
                Some(OscType::Long(v)) => *v as u64,
                Some(OscType::Int(v)) => *v as u64,
                _ => 0,
            };
            let frames = arg_i32(2).unwrap_or(0);
            let channels = arg_i32(3).unwrap_or(0);
            let sample_rate = match msg.args.get(4) {
                Some(OscType::Float(v)) => *v,
                Some(OscType::Int(v)) => *v as f32,
                _ => 0.0,
            };
            let uuid = match msg.args.get(5) {
                Some(OscType::String(s)) => s.clone(),
                _ => String::new(),
            };
            inner.buffers.insert(
                bufnum,
                PtrBuffer {
                    ptr,
                    frames,
                    channels,
                    sample_rate,
                    uuid,
                },
            );
            push_reply(
                engine,
                region,
                OscMessage {
                    addr: "/done".to_string(),
                    args: vec![OscType::String("/b_allocPtr".into()), OscType::Int(bufnum)],
                },
            );
        }
        "/b_free" => {
            let bufnum = arg_i32(0).unwrap_or(-1);
            inner.buffers.remove(&bufnum);
            push_reply(
                engine,
                region,
                OscMessage {
                    addr: "/done".to_string(),
                    args: vec![OscType::String("/b_free".into()), OscType::Int(bufnum)],
                },
            );
        }
        "/quit" => push_debug(engine, region, "/quit received, shutting down"),
        "/dumpOSC" | "/clearSched" | "/error" | "/latency" => {}
        other => {
            push_debug(
                engine,
                region,
                &format!("FAILURE IN SERVER: unknown command: {other}"),
            );
        }
    }
}

fn find(inner: &Inner, id: i32) -> Option<usize> {
    inner.nodes.iter().position(|n| n.id == id)
}

/// Insert a node per the scsynth add actions (0 head, 1 tail, 2 before,
/// 3 after). Unknown actions fall back to tail-of-root.
fn add_node(inner: &mut Inner, id: i32, is_group: bool, name: String, action: i32, target: i32) {
    if find(inner, id).is_some() {
        free_node(inner, id);
    }
    let mut node = NodeTreeEntry {
        id,
        parent: -1,
        is_group,
        prev: -1,
        next: -1,
        head: -1,
        name,
    };

    match action {
        0 | 1 => {
            let Some(group_idx) = find(inner, target) else {
                return;
            };
            node.parent = target;
            if action == 0 {
                let old_head = inner.nodes[group_idx].head;
                node.next = old_head;
                if let Some(h) = (old_head >= 0).then(|| find(inner, old_head)).flatten() {
                    inner.nodes[h].prev = id;
                }
                inner.nodes[group_idx].head = id;
            } else {
                // Walk to the last sibling.
                let mut cursor = inner.nodes[group_idx].head;
                if cursor < 0 {
                    inner.nodes[group_idx].head = id;
                } else {
                    loop {
                        let idx = find(inner, cursor).expect("linked sibling exists");
                        if inner.nodes[idx].next < 0 {
                            inner.nodes[idx].next = id;
                            node.prev = cursor;
                            break;
                        }
                        cursor = inner.nodes[idx].next;
                    }
                }
            }
        }
        2 | 3 => {
            let Some(t_idx) = find(inner, target) else {
                return;
            };
            node.parent = inner.nodes[t_idx].parent;
            if action == 2 {
                node.prev = inner.nodes[t_idx].prev;
                node.next = target;
                let old_prev = inner.nodes[t_idx].prev;
                inner.nodes[t_idx].prev = id;
                if old_prev >= 0 {
                    let p = find(inner, old_prev).expect("linked sibling exists");
                    inner.nodes[p].next = id;
                } else if node.parent >= 0 {
                    let g = find(inner, node.parent).expect("parent exists");
                    inner.nodes[g].head = id;
                }
            } else {
                node.prev = target;
                node.next = inner.nodes[t_idx].next;
                let old_next = inner.nodes[t_idx].next;
                inner.nodes[t_idx].next = id;
                if old_next >= 0 {
                    let n = find(inner, old_next).expect("linked sibling exists");
                    inner.nodes[n].prev = id;
                }
            }
        }
        _ => {
            node.parent = 0;
            if let Some(root) = find(inner, 0) {
                let mut cursor = inner.nodes[root].head;
                if cursor < 0 {
                    inner.nodes[root].head = id;
                } else {
                    loop {
                        let idx = find(inner, cursor).expect("linked sibling exists");
                        if inner.nodes[idx].next < 0 {
                            inner.nodes[idx].next = id;
                            node.prev = cursor;
                            break;
                        }
                        cursor = inner.nodes[idx].next;
                    }
                }
            }
        }
    }

    inner.nodes.push(node);
    inner.version += 1;
}

fn free_node(inner: &mut Inner, id: i32) {
    let Some(idx) = find(inner, id) else {
        return;
    };
    let node = inner.nodes[idx].clone();

    // Groups take their children with them.
    if node.is_group {
        let mut cursor = node.head;
        while cursor >= 0 {
            let next = find(inner, cursor).map(|i| inner.nodes[i].next).unwrap_or(-1);
            free_node(inner, cursor);
            cursor = next;
        }
    }

    // Unlink from siblings and parent.
    if node.prev >= 0 {
        if let Some(p) = find(inner, node.prev) {
            inner.nodes[p].next = node.next;
        }
    } else if node.parent >= 0 {
        if let Some(g) = find(inner, node.parent) {
            inner.nodes[g].head = node.next;
        }
    }
    if node.next >= 0 {
        if let Some(n) = find(inner, node.next) {
            inner.nodes[n].prev = node.prev;
        }
    }

    if let Some(idx) = find(inner, id) {
        inner.nodes.remove(idx);
        inner.version += 1;
    }
}

/// Publish the tree into the mirror: entries first, then node_count, then
/// the version word, so the readers' version/retry protocol observes
/// consistent captures.
fn write_mirror(region: &SharedRegion, layout: &LayoutDescriptor, inner: &mut Inner) {
    let base = layout.tree_offset + TREE_HEADER_WORDS * 4;
    let mut words = [0u32; TREE_ENTRY_WORDS];
    for (slot, node) in inner.nodes.iter().enumerate() {
        node.write_words(&mut words);
        let mut bytes = Vec::with_capacity(TREE_ENTRY_WORDS * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        region.copy_in(base + slot * TREE_ENTRY_WORDS * 4, &bytes);
    }
    // Blank slots that previously held entries.
    for slot in inner.nodes.len()..inner.mirrored {
        region.copy_in(
            base + slot * TREE_ENTRY_WORDS * 4,
            &(-1i32).to_le_bytes(),
        );
    }
    inner.mirrored = inner.nodes.len();

    region
        .atomic_at(layout.tree_offset)
        .store(inner.nodes.len() as u32, Ordering::Release);
    region
        .atomic_at(layout.tree_offset + 4)
        .store(inner.version, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use scsonic_types::NodeTree;
    use std::sync::Arc;

    fn booted() -> (TestEngine, Arc<SharedRegion>) {
        let mut engine = TestEngine::new(48_000.0);
        let region = Arc::new(SharedRegion::new(engine.layout()).unwrap());
        engine
            .init(&region, 48_000.0, &WorldOptions::default())
            .unwrap();
        (engine, region)
    }

    fn send(engine: &mut TestEngine, region: &SharedRegion, msg: OscMessage) {
        let bytes = rosc::encoder::encode(&OscPacket::Message(msg)).unwrap();
        region.ring(RingId::In).push(&bytes, 0).unwrap();
        engine.process(region, 0.0, 2, 2);
    }

    fn read_tree(region: &SharedRegion) -> NodeTree {
        let layout = region.layout();
        let span = layout.snapshot_span();
        let mut bytes = vec![0u8; span.size];
        region.copy_out(span.offset, &mut bytes);
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        NodeTree::from_words(&words[scsonic_types::metrics::METRIC_WORDS..])
    }

    #[test]
    fn status_reply_round_trips_through_out() {
        let (mut engine, region) = booted();
        send(
            &mut engine,
            &region,
            OscMessage {
                addr: "/status".into(),
                args: vec![],
            },
        );
        let ring = region.ring(RingId::Out);
        let mut replies = Vec::new();
        ring.drain(8, |i| replies.push(ring.payload(&i)), |_| {});
        assert_eq!(replies.len(), 1);
        let (_, packet) = rosc::decoder::decode_udp(&replies[0]).unwrap();
        match packet {
            OscPacket::Message(m) => assert_eq!(m.addr, "/status.reply"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn tree_mutations_bump_version_in_order() {
        let (mut engine, region) = booted();
        let v0 = read_tree(&region).version;

        send(
            &mut engine,
            &region,
            OscMessage {
                addr: "/g_new".into(),
                args: vec![OscType::Int(100), OscType::Int(0), OscType::Int(0)],
            },
        );
        let t1 = read_tree(&region);
        assert!(t1.version > v0);
        assert_eq!(t1.ids(), vec![0, 100]);

        send(
            &mut engine,
            &region,
            OscMessage {
                addr: "/s_new".into(),
                args: vec![
                    OscType::String("beep".into()),
                    OscType::Int(1000),
                    OscType::Int(0),
                    OscType::Int(100),
                ],
            },
        );
        let t2 = read_tree(&region);
        assert!(t2.version > t1.version);
        let entry = t2.get(1000).unwrap();
        assert_eq!(entry.parent, 100);
        assert_eq!(entry.name, "beep");

        send(
            &mut engine,
            &region,
            OscMessage {
                addr: "/n_free".into(),
                args: vec![OscType::Int(1000)],
            },
        );
        let t3 = read_tree(&region);
        assert!(t3.version > t2.version);
        assert_eq!(t3.ids(), vec![0, 100]);
    }

    #[test]
    fn freeing_a_group_frees_its_children() {
        let (mut engine, region) = booted();
        send(
            &mut engine,
            &region,
            OscMessage {
                addr: "/g_new".into(),
                args: vec![OscType::Int(100), OscType::Int(0), OscType::Int(0)],
            },
        );
        for id in [1000, 1001] {
            send(
                &mut engine,
                &region,
                OscMessage {
                    addr: "/s_new".into(),
                    args: vec![
                        OscType::String("beep".into()),
                        OscType::Int(id),
                        OscType::Int(1),
                        OscType::Int(100),
                    ],
                },
            );
        }
        send(
            &mut engine,
            &region,
            OscMessage {
                addr: "/n_free".into(),
                args: vec![OscType::Int(100)],
            },
        );
        assert_eq!(read_tree(&region).ids(), vec![0]);
    }

    #[test]
    fn future_bundles_park_until_due() {
        let (mut engine, region) = booted();
        region.write_f64(region.layout().ntp_start_offset, 1000.0);

        let bundle = rosc::encoder::encode(&OscPacket::Bundle(rosc::OscBundle {
            timetag: rosc::OscTime {
                seconds: 1005,
                fractional: 0,
            },
            content: vec![OscPacket::Message(OscMessage {
                addr: "/g_new".into(),
                args: vec![OscType::Int(200), OscType::Int(0), OscType::Int(0)],
            })],
        }))
        .unwrap();
        region.ring(RingId::In).push(&bundle, 0).unwrap();

        engine.process(&region, 1.0, 2, 2); // ntp 1001 < 1005
        assert_eq!(read_tree(&region).ids(), vec![0]);
        assert_eq!(engine.control().scheduled_count(), 1);

        engine.process(&region, 5.0, 2, 2); // ntp 1005: due
        assert_eq!(read_tree(&region).ids(), vec![0, 200]);
        assert_eq!(engine.control().scheduled_count(), 0);
    }

    #[test]
    fn clear_scheduler_discards_parked_bundles() {
        let (mut engine, region) = booted();
        region.write_f64(region.layout().ntp_start_offset, 1000.0);
        let bundle = rosc::encoder::encode(&OscPacket::Bundle(rosc::OscBundle {
            timetag: rosc::OscTime {
                seconds: 1005,
                fractional: 0,
            },
            content: vec![OscPacket::Message(OscMessage {
                addr: "/g_new".into(),
                args: vec![OscType::Int(200), OscType::Int(0), OscType::Int(0)],
            })],
        }))
        .unwrap();
        region.ring(RingId::In).push(&bundle, 0).unwrap();
        engine.process(&region, 0.0, 2, 2);
        engine.clear_scheduler(&region);
        engine.process(&region, 10.0, 2, 2);
        assert_eq!(read_tree(&region).ids(), vec![0]);
    }

    #[test]
    fn debug_lines_carry_trailing_newline() {
        let (mut engine, region) = booted();
        engine.control().queue_debug("late 0.021");
        engine.process(&region, 0.0, 2, 2);
        let ring = region.ring(RingId::Debug);
        let mut lines = Vec::new();
        ring.drain(8, |i| lines.push(ring.payload(&i)), |_| {});
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(b"\n"));
    }
}
