//! Buffer-command interception.
//!
//! The engine cannot own the sample-pool arena, so the allocating buffer
//! commands are serviced here: memory comes from the pool, audio files
//! are decoded client-side, samples are copied into the engine-visible
//! region, and the outbound message becomes
//! `/b_allocPtr (bufnum, ptr, frames, channels, sample_rate, uuid)`.
//! Commands that would make the engine touch a filesystem it does not
//! have fail loudly with a pointer at the supported path.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

use scsonic_shm::{RegionSpan, SharedRegion};
use scsonic_types::{Error, OscArg, Result};

/// Commands the engine must never see, with their remediation hints.
const BLOCKED: &[(&str, &str)] = &[
    ("/d_load", "the engine has no filesystem; send the compiled definition bytes with /d_recv"),
    ("/d_loadDir", "the engine has no filesystem; send each definition with /d_recv"),
    ("/b_read", "use /b_allocRead, which decodes client-side into the sample pool"),
    ("/b_readChannel", "use /b_allocReadChannel, which decodes client-side into the sample pool"),
];

/// `Some(hint)` when `addr` is on the blocked list.
pub fn blocked_hint(addr: &str) -> Option<&'static str> {
    BLOCKED
        .iter()
        .find(|(blocked, _)| *blocked == addr)
        .map(|(_, hint)| *hint)
}

/// One allocation in the sample pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAlloc {
    /// Absolute byte offset in the region: the engine-visible pointer.
    pub offset: usize,
    pub bytes: usize,
    pub uuid: String,
}

/// First-fit arena over the `[sample-pool]` span of the region.
pub struct SamplePool {
    span: RegionSpan,
    cursor: usize,
    free: Vec<(usize, usize)>,
    by_bufnum: HashMap<i32, PoolAlloc>,
    next_uuid: u64,
}

impl SamplePool {
    pub fn new(span: RegionSpan) -> Self {
        Self {
            span,
            cursor: 0,
            free: Vec::new(),
            by_bufnum: HashMap::new(),
            next_uuid: 1,
        }
    }

    /// Allocate `bytes` for `bufnum`. Re-allocating a live bufnum frees
    /// the old block first, as `/b_alloc` does on the server.
    pub fn alloc(&mut self, bufnum: i32, bytes: usize) -> Result<PoolAlloc> {
        self.release(bufnum);
        let aligned = bytes.div_ceil(8) * 8;

        let rel = if let Some(i) = self.free.iter().position(|&(_, len)| len >= aligned) {
            let (off, len) = self.free.remove(i);
            if len > aligned {
                self.free.push((off + aligned, len - aligned));
            }
            off
        } else if self.cursor + aligned <= self.span.size {
            let off = self.cursor;
            self.cursor += aligned;
            off
        } else {
            let free_total: usize = self.free.iter().map(|&(_, l)| l).sum();
            let reason = if free_total + (self.span.size - self.cursor) >= aligned {
                "fragmented"
            } else {
                "exhausted"
            };
            return Err(Error::EngineError(format!(
                "sample pool {reason}: {aligned} bytes requested, {} in arena",
                self.span.size
            )));
        };

        let alloc = PoolAlloc {
            offset: self.span.offset + rel,
            bytes: aligned,
            uuid: format!("buf-{:08x}", self.next_uuid),
        };
        self.next_uuid += 1;
        self.by_bufnum.insert(bufnum, alloc.clone());
        Ok(alloc)
    }

    /// Return a bufnum's block to the free list.
    pub fn release(&mut self, bufnum: i32) -> Option<PoolAlloc> {
        let alloc = self.by_bufnum.remove(&bufnum)?;
        self.free.push((alloc.offset - self.span.offset, alloc.bytes));
        Some(alloc)
    }

    pub fn get(&self, bufnum: i32) -> Option<&PoolAlloc> {
        self.by_bufnum.get(&bufnum)
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.free.clear();
        self.by_bufnum.clear();
    }
}

fn arg_i32(args: &[OscArg], i: usize) -> Option<i32> {
    match args.get(i) {
        Some(OscArg::I32(v)) => Some(*v),
        Some(OscArg::I64(v)) => Some(*v as i32),
        Some(OscArg::F32(v)) => Some(*v as i32),
        _ => None,
    }
}

fn arg_str<'a>(args: &'a [OscArg], i: usize) -> Option<&'a str> {
    match args.get(i) {
        Some(OscArg::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Decoded audio ready for the pool.
struct DecodedAudio {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: f32,
}

/// Decode a WAV file with bounded retries (the asset-fetch policy,
/// applied to the local loader).
fn load_wav(path: &str, max_retries: u32, retry_delay_ms: u64) -> Result<DecodedAudio> {
    let mut delay = retry_delay_ms;
    let mut attempt = 0;
    let reader = loop {
        match hound::WavReader::open(Path::new(path)) {
            Ok(reader) => break reader,
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(Error::EngineError(format!(
                        "could not open {path} after {attempt} attempts: {e}"
                    )));
                }
                log::warn!(target: "session::samples", "open {path} failed (attempt {attempt}): {e}");
                thread::sleep(Duration::from_millis(delay));
                delay *= 2;
            }
        }
    };

    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::EngineError(format!("decode {path}: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::EngineError(format!("decode {path}: {e}")))?
        }
    };

    Ok(DecodedAudio {
        samples,
        channels: spec.channels as usize,
        sample_rate: spec.sample_rate as f32,
    })
}

fn alloc_ptr_args(
    bufnum: i32,
    alloc: &PoolAlloc,
    frames: i32,
    channels: i32,
    sample_rate: f32,
) -> Vec<OscArg> {
    vec![
        OscArg::I32(bufnum),
        OscArg::I64(alloc.offset as i64),
        OscArg::I32(frames),
        OscArg::I32(channels),
        OscArg::F32(sample_rate),
        OscArg::Str(alloc.uuid.clone()),
    ]
}

/// Intercept a buffer command. Returns `None` for commands that pass
/// through untouched, `Some((addr, args))` for the rewritten message.
#[allow(clippy::too_many_arguments)]
pub fn rewrite_command(
    region: &SharedRegion,
    pool: &mut SamplePool,
    engine_sample_rate: f32,
    fetch_max_retries: u32,
    fetch_retry_delay_ms: u64,
    addr: &str,
    args: &[OscArg],
) -> Result<Option<(String, Vec<OscArg>)>> {
    match addr {
        "/b_alloc" => {
            let bufnum = arg_i32(args, 0)
                .ok_or_else(|| Error::Codec("/b_alloc needs a bufnum".into()))?;
            let frames = arg_i32(args, 1)
                .ok_or_else(|| Error::Codec("/b_alloc needs a frame count".into()))?;
            let channels = arg_i32(args, 2).unwrap_or(1).max(1);
            let bytes = frames as usize * channels as usize * 4;
            let alloc = pool.alloc(bufnum, bytes)?;
            region.fill(
                RegionSpan { offset: alloc.offset, size: alloc.bytes },
                0,
            );
            Ok(Some((
                "/b_allocPtr".to_string(),
                alloc_ptr_args(bufnum, &alloc, frames, channels, engine_sample_rate),
            )))
        }
        "/b_allocRead" | "/b_allocFile" => {
            let bufnum = arg_i32(args, 0)
                .ok_or_else(|| Error::Codec(format!("{addr} needs a bufnum")))?;
            let path = arg_str(args, 1)
                .ok_or_else(|| Error::Codec(format!("{addr} needs a file path")))?;
            let start = arg_i32(args, 2).unwrap_or(0).max(0) as usize;
            let want = arg_i32(args, 3).unwrap_or(0);

            let audio = load_wav(path, fetch_max_retries, fetch_retry_delay_ms)?;
            let total_frames = audio.samples.len() / audio.channels.max(1);
            let start = start.min(total_frames);
            let frames = if want <= 0 {
                total_frames - start
            } else {
                (want as usize).min(total_frames - start)
            };
            let slice = &audio.samples
                [start * audio.channels..(start + frames) * audio.channels];

            let alloc = pool.alloc(bufnum, slice.len() * 4)?;
            region.copy_f32_in(alloc.offset, slice);
            Ok(Some((
                "/b_allocPtr".to_string(),
                alloc_ptr_args(
                    bufnum,
                    &alloc,
                    frames as i32,
                    audio.channels as i32,
                    audio.sample_rate,
                ),
            )))
        }
        "/b_allocReadChannel" => {
            let bufnum = arg_i32(args, 0)
                .ok_or_else(|| Error::Codec("/b_allocReadChannel needs a bufnum".into()))?;
            let path = arg_str(args, 1)
                .ok_or_else(|| Error::Codec("/b_allocReadChannel needs a file path".into()))?;
            let start = arg_i32(args, 2).unwrap_or(0).max(0) as usize;
            let want = arg_i32(args, 3).unwrap_or(0);
            let wanted: Vec<usize> = (4..args.len())
                .filter_map(|i| arg_i32(args, i))
                .map(|c| c.max(0) as usize)
                .collect();

            let audio = load_wav(path, fetch_max_retries, fetch_retry_delay_ms)?;
            let source_channels = audio.channels.max(1);
            let channels: Vec<usize> = if wanted.is_empty() {
                (0..source_channels).collect()
            } else {
                wanted
                    .into_iter()
                    .filter(|&c| c < source_channels)
                    .collect()
            };
            if channels.is_empty() {
                return Err(Error::Codec(
                    "/b_allocReadChannel selected no valid channels".into(),
                ));
            }

            let total_frames = audio.samples.len() / source_channels;
            let start = start.min(total_frames);
            let frames = if want <= 0 {
                total_frames - start
            } else {
                (want as usize).min(total_frames - start)
            };

            let mut selected = Vec::with_capacity(frames * channels.len());
            for frame in start..start + frames {
                for &ch in &channels {
                    selected.push(audio.samples[frame * source_channels + ch]);
                }
            }

            let alloc = pool.alloc(bufnum, selected.len() * 4)?;
            region.copy_f32_in(alloc.offset, &selected);
            Ok(Some((
                "/b_allocPtr".to_string(),
                alloc_ptr_args(
                    bufnum,
                    &alloc,
                    frames as i32,
                    channels.len() as i32,
                    audio.sample_rate,
                ),
            )))
        }
        "/b_free" => {
            if let Some(bufnum) = arg_i32(args, 0) {
                pool.release(bufnum);
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scsonic_shm::LayoutDescriptor;

    fn pool_and_region() -> (SamplePool, SharedRegion) {
        let layout = LayoutDescriptor::packed(64, 1024, 256, 256, 64, 4096, 2, 128);
        let region = SharedRegion::new(layout.clone()).unwrap();
        (SamplePool::new(layout.sample_pool), region)
    }

    #[test]
    fn blocked_commands_carry_hints() {
        assert!(blocked_hint("/d_load").unwrap().contains("/d_recv"));
        assert!(blocked_hint("/b_read").unwrap().contains("/b_allocRead"));
        assert!(blocked_hint("/s_new").is_none());
    }

    #[test]
    fn alloc_rewrites_to_alloc_ptr() {
        let (mut pool, region) = pool_and_region();
        let out = rewrite_command(
            &region,
            &mut pool,
            48_000.0,
            0,
            1,
            "/b_alloc",
            &[OscArg::I32(3), OscArg::I32(64), OscArg::I32(2)],
        )
        .unwrap()
        .expect("must rewrite");
        assert_eq!(out.0, "/b_allocPtr");
        assert_eq!(out.1[0], OscArg::I32(3));
        match &out.1[1] {
            OscArg::I64(ptr) => {
                let span = region.layout().sample_pool;
                let ptr = *ptr as usize;
                assert!(ptr >= span.offset && ptr < span.end());
            }
            other => panic!("ptr must be i64, got {other:?}"),
        }
        assert_eq!(out.1[2], OscArg::I32(64));
        assert_eq!(out.1[3], OscArg::I32(2));
    }

    #[test]
    fn pool_reuses_released_blocks() {
        let (mut pool, _region) = pool_and_region();
        let a = pool.alloc(0, 1024).unwrap();
        pool.release(0);
        let b = pool.alloc(1, 1024).unwrap();
        assert_eq!(a.offset, b.offset);
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn pool_exhaustion_is_an_error() {
        let (mut pool, _region) = pool_and_region();
        pool.alloc(0, 4000).unwrap();
        assert!(pool.alloc(1, 4000).is_err());
    }

    #[test]
    fn realloc_same_bufnum_frees_old_block() {
        let (mut pool, _region) = pool_and_region();
        pool.alloc(0, 2048).unwrap();
        pool.alloc(0, 2048).unwrap();
        // A third distinct bufnum of the same size still fits because the
        // first block was recycled.
        pool.alloc(1, 2048).unwrap();
    }

    #[test]
    fn alloc_read_decodes_a_wav_file() {
        let (mut pool, region) = pool_and_region();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..100i32 {
            writer.write_sample((i * 100) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let out = rewrite_command(
            &region,
            &mut pool,
            48_000.0,
            0,
            1,
            "/b_allocRead",
            &[
                OscArg::I32(7),
                OscArg::Str(path.to_string_lossy().into_owned()),
                OscArg::I32(0),
                OscArg::I32(0),
            ],
        )
        .unwrap()
        .expect("must rewrite");
        assert_eq!(out.0, "/b_allocPtr");
        assert_eq!(out.1[2], OscArg::I32(100)); // frames
        assert_eq!(out.1[3], OscArg::I32(1)); // channels
        assert_eq!(out.1[4], OscArg::F32(44_100.0));

        // The decoded samples landed in the engine-visible region.
        let ptr = match out.1[1] {
            OscArg::I64(p) => p as usize,
            _ => unreachable!(),
        };
        let mut back = vec![0.0f32; 100];
        region.copy_f32_out(ptr, &mut back);
        assert_eq!(back[0], 0.0);
        assert!((back[1] - 100.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn missing_file_fails_after_retries() {
        let (mut pool, region) = pool_and_region();
        let err = rewrite_command(
            &region,
            &mut pool,
            48_000.0,
            2,
            1,
            "/b_allocRead",
            &[OscArg::I32(0), OscArg::Str("/nonexistent/x.wav".into())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("3 attempts"), "{err}");
    }
}
