//! Splits encoded frames into MTU-sized fragments

use std::sync::atomic::{AtomicU16, Ordering};
use tracing::warn;

use crate::protocol::{
    Packet, PacketHeader, PacketType, FLAG_FIRST, FLAG_KEYFRAME, FLAG_LAST, MAX_FRAGMENT_DATA,
};
use crate::types::{EncodedPacket, FrameType};

/// Stateless fragmenter; the datagram sequence counter lives with the
/// owning endpoint because control packets share it.
pub struct Fragmenter;

impl Fragmenter {
    /// Split `packet` into ordered fragments of at most
    /// [`MAX_FRAGMENT_DATA`] payload bytes each.
    ///
    /// The sequence counter is post-incremented once per fragment;
    /// wraparound is benign. An empty packet yields no fragments.
    pub fn fragment(packet: &EncodedPacket, sequence: &AtomicU16) -> Vec<Packet> {
        let data_len = packet.data.len();
        if data_len == 0 {
            return Vec::new();
        }

        let num_frags = data_len.div_ceil(MAX_FRAGMENT_DATA);
        if num_frags > u16::MAX as usize {
            warn!(
                "Frame {} too large to fragment: {} bytes",
                packet.frame_id, data_len
            );
            return Vec::new();
        }

        let (packet_type, base_flags) = match packet.frame_type {
            FrameType::VideoKeyframe => (PacketType::VideoData, FLAG_KEYFRAME),
            FrameType::VideoPFrame => (PacketType::VideoData, 0),
            FrameType::Audio => (PacketType::AudioData, 0),
        };

        let mut fragments = Vec::with_capacity(num_frags);
        for i in 0..num_frags {
            let mut flags = base_flags;
            if i == 0 {
                flags |= FLAG_FIRST;
            }
            if i == num_frags - 1 {
                flags |= FLAG_LAST;
            }

            let offset = i * MAX_FRAGMENT_DATA;
            let end = (offset + MAX_FRAGMENT_DATA).min(data_len);

            fragments.push(Packet {
                header: PacketHeader {
                    packet_type,
                    flags,
                    sequence: sequence.fetch_add(1, Ordering::Relaxed),
                    timestamp_us: packet.pts_us as u32,
                    frame_id: packet.frame_id,
                    frag_idx: i as u16,
                    frag_total: num_frags as u16,
                },
                payload: packet.data.slice(offset..end),
            });
        }
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_UDP_PAYLOAD;
    use bytes::Bytes;

    fn packet(data: Vec<u8>, frame_type: FrameType, frame_id: u16, pts_us: i64) -> EncodedPacket {
        EncodedPacket {
            data: Bytes::from(data),
            frame_type,
            pts_us,
            frame_id,
        }
    }

    #[test]
    fn small_frame_is_a_single_first_and_last_fragment() {
        let seq = AtomicU16::new(0);
        let p = packet(vec![0, 1, 2, 3, 4], FrameType::VideoPFrame, 1, 100_000);
        let frags = Fragmenter::fragment(&p, &seq);

        assert_eq!(frags.len(), 1);
        let h = &frags[0].header;
        assert_eq!(h.flags, FLAG_FIRST | FLAG_LAST);
        assert_eq!(h.frag_idx, 0);
        assert_eq!(h.frag_total, 1);
        assert_eq!(h.frame_id, 1);
        assert_eq!(h.timestamp_us, 100_000);
        assert_eq!(frags[0].payload.as_ref(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_frame_yields_no_fragments() {
        let seq = AtomicU16::new(0);
        let p = packet(vec![], FrameType::VideoPFrame, 1, 0);
        assert!(Fragmenter::fragment(&p, &seq).is_empty());
    }

    #[test]
    fn keyframe_splits_with_flags_and_sequential_payloads() {
        let seq = AtomicU16::new(10);
        // 3 full fragments plus 100 bytes
        let data: Vec<u8> = (0..3 * MAX_FRAGMENT_DATA + 100).map(|i| i as u8).collect();
        let p = packet(data.clone(), FrameType::VideoKeyframe, 7, 50_000);
        let frags = Fragmenter::fragment(&p, &seq);

        assert_eq!(frags.len(), 4);
        for (i, frag) in frags.iter().enumerate() {
            let h = &frag.header;
            assert_eq!(h.packet_type, PacketType::VideoData);
            assert_eq!(h.frag_idx, i as u16);
            assert_eq!(h.frag_total, 4);
            assert!(h.flags & FLAG_KEYFRAME != 0);
            assert_eq!(h.flags & FLAG_FIRST != 0, i == 0);
            assert_eq!(h.flags & FLAG_LAST != 0, i == 3);
            assert_eq!(h.sequence, 10 + i as u16);
        }
        assert_eq!(frags[3].payload.len(), 100);

        let rejoined: Vec<u8> = frags
            .iter()
            .flat_map(|f| f.payload.iter().copied())
            .collect();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn audio_uses_audio_data_type() {
        let seq = AtomicU16::new(0);
        let p = packet(vec![1; 100], FrameType::Audio, 3, 0);
        let frags = Fragmenter::fragment(&p, &seq);
        assert_eq!(frags[0].header.packet_type, PacketType::AudioData);
        assert_eq!(frags[0].header.flags & FLAG_KEYFRAME, 0);
    }

    #[test]
    fn every_fragment_respects_the_mtu_budget() {
        let seq = AtomicU16::new(0);
        let data: Vec<u8> = vec![0xCC; 10 * MAX_FRAGMENT_DATA + 1];
        let p = packet(data, FrameType::VideoKeyframe, 1, 0);
        for frag in Fragmenter::fragment(&p, &seq) {
            assert!(frag.serialize().len() <= MAX_UDP_PAYLOAD);
        }
    }

    #[test]
    fn sequence_wraps_around() {
        let seq = AtomicU16::new(u16::MAX);
        let p = packet(vec![0; MAX_FRAGMENT_DATA + 1], FrameType::VideoPFrame, 1, 0);
        let frags = Fragmenter::fragment(&p, &seq);
        assert_eq!(frags[0].header.sequence, u16::MAX);
        assert_eq!(frags[1].header.sequence, 0);
    }

    #[test]
    fn frames_beyond_255_fragments_are_representable() {
        let seq = AtomicU16::new(0);
        let data = vec![0u8; 300 * MAX_FRAGMENT_DATA];
        let p = packet(data, FrameType::VideoKeyframe, 9, 0);
        let frags = Fragmenter::fragment(&p, &seq);
        assert_eq!(frags.len(), 300);
        assert_eq!(frags[299].header.frag_idx, 299);
        assert_eq!(frags[299].header.frag_total, 300);
    }
}
