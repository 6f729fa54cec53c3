//! Reassembles fragments into complete encoded frames
//!
//! Fragments of the same frame may arrive in any order, duplicated, and
//! interleaved with fragments of other frames. Each frame is emitted
//! independently the moment its last missing fragment lands.
//!
//! Keyframes get special treatment: an incomplete keyframe older than a
//! threshold is reported once (and only once) so the caller can NACK the
//! missing fragments. P-frames are never chased; a later keyframe
//! resynchronizes the decoder.
//!
//! Entries are keyed by `(frame_id, type)` with 16-bit per-stream frame ids.
//! Wraparound is safe in practice because entries age out after 500 ms,
//! orders of magnitude below the ~36 min a wrap takes at 30 fps.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{Packet, PacketType, FLAG_KEYFRAME};
use crate::types::{EncodedPacket, FrameType};

/// Default age after which an incomplete keyframe is reported for NACK.
pub const NACK_AGE: Duration = Duration::from_millis(100);

/// Default age after which an incomplete frame is abandoned.
pub const STALE_TIMEOUT: Duration = Duration::from_millis(500);

/// An incomplete keyframe eligible for selective retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteKeyframe {
    pub frame_id: u16,
    pub frag_total: u16,
    pub missing: Vec<u16>,
}

struct FrameState {
    frame_id: u16,
    frag_total: u16,
    frags_received: u16,
    packet_type: PacketType,
    flags: u8,
    timestamp_us: u32,
    slots: Vec<Option<Bytes>>,
    created: Instant,
    nack_sent: bool,
}

/// Per-stream fragment buffer. Not thread-safe; owned by the recv thread.
pub struct Reassembler {
    pending: HashMap<(u16, PacketType), FrameState>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Feed one fragment; returns the assembled frame when it completes.
    ///
    /// Duplicates and fragments with inconsistent indices are dropped.
    pub fn feed(&mut self, packet: &Packet) -> Option<EncodedPacket> {
        let h = &packet.header;
        if h.frag_total == 0 || h.frag_idx >= h.frag_total {
            return None;
        }
        if !matches!(h.packet_type, PacketType::VideoData | PacketType::AudioData) {
            return None;
        }

        let key = (h.frame_id, h.packet_type);
        let state = self.pending.entry(key).or_insert_with(|| FrameState {
            frame_id: h.frame_id,
            frag_total: h.frag_total,
            frags_received: 0,
            packet_type: h.packet_type,
            flags: h.flags,
            timestamp_us: h.timestamp_us,
            slots: vec![None; h.frag_total as usize],
            created: Instant::now(),
            nack_sent: false,
        });

        if h.frag_idx >= state.frag_total {
            return None;
        }
        let slot = &mut state.slots[h.frag_idx as usize];
        if slot.is_some() {
            // Duplicate retransmit
            return None;
        }
        *slot = Some(packet.payload.clone());
        state.frags_received += 1;
        state.flags |= h.flags;

        if state.frags_received < state.frag_total {
            return None;
        }

        let state = self.pending.remove(&key)?;
        let total_len: usize = state.slots.iter().flatten().map(|s| s.len()).sum();
        let mut data = BytesMut::with_capacity(total_len);
        for slot in state.slots.iter().flatten() {
            data.extend_from_slice(slot);
        }

        let frame_type = if state.packet_type == PacketType::AudioData {
            FrameType::Audio
        } else if state.flags & FLAG_KEYFRAME != 0 {
            FrameType::VideoKeyframe
        } else {
            FrameType::VideoPFrame
        };

        Some(EncodedPacket {
            data: data.freeze(),
            frame_type,
            pts_us: state.timestamp_us as i64,
            frame_id: state.frame_id,
        })
    }

    /// Report incomplete keyframes older than `min_age`, at most once per
    /// entry lifetime.
    pub fn check_incomplete_keyframes(&mut self, min_age: Duration) -> Vec<IncompleteKeyframe> {
        let now = Instant::now();
        let mut result = Vec::new();

        for state in self.pending.values_mut() {
            if state.flags & FLAG_KEYFRAME == 0 {
                continue;
            }
            if state.nack_sent {
                continue;
            }
            if now.duration_since(state.created) < min_age {
                continue;
            }

            let missing: Vec<u16> = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.is_none())
                .map(|(i, _)| i as u16)
                .collect();

            if !missing.is_empty() {
                state.nack_sent = true;
                result.push(IncompleteKeyframe {
                    frame_id: state.frame_id,
                    frag_total: state.frag_total,
                    missing,
                });
            }
        }
        result
    }

    /// Drop entries older than `timeout`; keeps memory bounded for frames
    /// that will never complete.
    pub fn purge_stale(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.pending
            .retain(|_, state| now.duration_since(state.created) <= timeout);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
