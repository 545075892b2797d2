//! Outbound routing: encode, validate, classify, deliver.
//!
//! `send` builds a plain message from typed arguments; `send_raw` takes
//! an already-encoded datagram. Both end in the same pipeline: bundle
//! validation, classification against the session clock, then either the
//! direct-write fast path (with prescheduler fallback on contention) or
//! a prescheduler slot for far-future bundles.

use scsonic_sched::{bundle_timetag, classify, ntp::timetag_to_ntp, BundleCategory};
use scsonic_shm::WriteOptions;
use scsonic_types::{Error, OscArg, Result, SourceId};

use crate::rewrite::{blocked_hint, rewrite_command};
use crate::session::{SendMeta, Session};

/// No single message inside a bundle may exceed this.
pub const MAX_BUNDLE_MESSAGE_BYTES: usize = 64 * 1024;

/// Bundles beyond this horizon are refused outright.
const MAX_AHEAD_SECS: f64 = 3600.0;

fn encode_message(addr: &str, args: Vec<OscArg>) -> Result<Vec<u8>> {
    let message = rosc::OscMessage {
        addr: addr.to_string(),
        args: args.into_iter().map(OscArg::into_osc).collect(),
    };
    rosc::encoder::encode(&rosc::OscPacket::Message(message))
        .map_err(|e| Error::Codec(e.to_string()))
}

/// Walk the element sizes of an encoded bundle: `(size: u32 BE, bytes)`
/// pairs after the 16-byte header.
fn bundle_elements(datagram: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 16;
    std::iter::from_fn(move || {
        if pos + 4 > datagram.len() {
            return None;
        }
        let len = u32::from_be_bytes([
            datagram[pos],
            datagram[pos + 1],
            datagram[pos + 2],
            datagram[pos + 3],
        ]) as usize;
        let start = pos + 4;
        if start + len > datagram.len() {
            return None;
        }
        pos = start + len;
        Some(&datagram[start..start + len])
    })
}

impl Session {
    /// Encode and route one message. Buffer-allocating commands are
    /// rewritten against the sample pool; blocked commands fail with a
    /// remediation hint.
    pub fn send(&mut self, addr: &str, args: Vec<OscArg>) -> Result<()> {
        if let Some(hint) = blocked_hint(addr) {
            return Err(Error::BlockedCommand {
                addr: addr.to_string(),
                hint: hint.to_string(),
            });
        }

        let rewritten = self.intercept_buffer_command(addr, &args)?;
        let datagram = match &rewritten {
            Some((new_addr, new_args)) => encode_message(new_addr, new_args.clone())?,
            None => encode_message(addr, args.clone())?,
        };

        self.send_raw(datagram.clone(), SendMeta::default())?;

        // Cache after the send succeeded so reload replays reality.
        if addr == "/d_recv" {
            self.def_cache.push(datagram);
        }
        if rewritten.is_some() && addr != "/b_free" {
            self.buffer_cache.push((addr.to_string(), args));
        }
        Ok(())
    }

    /// Encode and route a plain message without interception. Used by
    /// internal traffic (`/sync`, `/quit`, `/g_freeAll`) that needs no
    /// rewrite pass.
    pub(crate) fn send_message(&self, addr: &str, args: Vec<OscArg>) -> Result<()> {
        let datagram = encode_message(addr, args)?;
        self.send_raw(datagram, SendMeta::default())
    }

    /// Route an already-encoded datagram.
    pub fn send_raw(&self, datagram: Vec<u8>, meta: SendMeta) -> Result<()> {
        let rt = self.runtime()?;
        if self.state() != crate::session::SessionState::Ready {
            return Err(Error::NotInitialised(self.state().to_string()));
        }

        self.validate_bundle(&datagram)?;

        let now = rt.clock.now();
        let category = classify(&datagram, Some(now), self.config().bypass_lookahead);
        self.note_category(category);

        if category.bypasses() {
            self.deliver_bypass(&datagram, meta.source)?;
        } else {
            rt.prescheduler
                .schedule(datagram, meta.session_id, meta.run_tag, meta.source)?;
        }
        self.stats_ref()
            .messages_sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Direct-write fast path with prescheduler fallback. Also used to
    /// replay caches during reload (hence no Ready check).
    pub(crate) fn deliver_bypass(&self, datagram: &[u8], source: SourceId) -> Result<()> {
        let rt = self.runtime()?;
        let direct = match (&rt.writer, &rt.posted) {
            (Some(writer), _) => writer.write(datagram, source, WriteOptions::main_thread()),
            (None, Some(posted)) => {
                use scsonic_sched::DispatchSink;
                posted.dispatch(datagram, source)
            }
            _ => Err(Error::NotInitialised(self.state().to_string())),
        };
        match direct {
            Ok(()) => Ok(()),
            // Contention and full buffers route through the blocking
            // path; the source id rides along.
            Err(Error::LockContended) | Err(Error::BufferFull) => {
                rt.prescheduler.direct_dispatch(datagram.to_vec(), source)
            }
            Err(e) => Err(e),
        }
    }

    fn validate_bundle(&self, datagram: &[u8]) -> Result<()> {
        let Some((seconds, fractional)) = bundle_timetag(datagram) else {
            return Ok(());
        };
        let rt = self.runtime()?;
        let slot_bytes = rt.region.layout().scheduler_slot_bytes;
        if datagram.len() > slot_bytes {
            return Err(Error::BundleTooLarge {
                size: datagram.len(),
                limit: slot_bytes,
            });
        }
        if !(seconds == 0 && fractional <= 1) {
            let ahead = timetag_to_ntp(seconds, fractional) - rt.clock.now();
            if ahead > MAX_AHEAD_SECS {
                return Err(Error::BundleTooFarFuture {
                    ahead,
                    limit: MAX_AHEAD_SECS,
                });
            }
        }
        for element in bundle_elements(datagram) {
            if element.len() > MAX_BUNDLE_MESSAGE_BYTES {
                return Err(Error::BundleTooLarge {
                    size: element.len(),
                    limit: MAX_BUNDLE_MESSAGE_BYTES,
                });
            }
        }
        Ok(())
    }

    fn note_category(&self, category: BundleCategory) {
        use std::sync::atomic::Ordering;
        let stats = self.stats_ref();
        match category {
            BundleCategory::NonBundle => {
                stats.bypass_non_bundle.fetch_add(1, Ordering::Relaxed);
            }
            BundleCategory::Immediate => {
                stats.bypass_immediate.fetch_add(1, Ordering::Relaxed);
            }
            BundleCategory::NearFuture => {
                stats.bypass_near_future.fetch_add(1, Ordering::Relaxed);
            }
            BundleCategory::Late => {
                stats.bypass_late.fetch_add(1, Ordering::Relaxed);
            }
            BundleCategory::FarFuture => {}
        }
    }

    fn intercept_buffer_command(
        &mut self,
        addr: &str,
        args: &[OscArg],
    ) -> Result<Option<(String, Vec<OscArg>)>> {
        let Some(rt) = self.runtime.as_ref() else {
            return Err(Error::NotInitialised(self.state().to_string()));
        };
        let region = std::sync::Arc::clone(&rt.region);
        let sample_rate = self.sample_rate_hint();
        let (retries, delay) = (
            self.config().fetch_max_retries,
            self.config().fetch_retry_delay_ms,
        );
        let Some(pool) = self.pool.as_mut() else {
            return Err(Error::NotInitialised("no sample pool".into()));
        };
        rewrite_command(&region, pool, sample_rate, retries, delay, addr, args)
    }

    pub(crate) fn replay_buffer_command(
        &mut self,
        addr: &str,
        args: Vec<OscArg>,
    ) -> Result<()> {
        let rewritten = self.intercept_buffer_command(addr, &args)?;
        let (new_addr, new_args) = rewritten.ok_or_else(|| {
            Error::Codec(format!("cached buffer command {addr} no longer rewrites"))
        })?;
        let datagram = encode_message(&new_addr, new_args)?;
        self.deliver_bypass(&datagram, scsonic_types::MAIN_SOURCE)
    }
}
