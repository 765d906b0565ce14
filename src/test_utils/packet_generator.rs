//! Synthetic packet generation for testing
//!
//! Builds Trigger 5 and Trigger 6 transaction streams with known payloads,
//! split across bulk packets the way the adapters' host drivers submit them.
//!
//! # Example
//!
//! ```rust,ignore
//! use trigger_dissect_lib::test_utils::{payload_pattern, PacketGenerator};
//!
//! let mut gen = PacketGenerator::default();
//!
//! // One 64 KiB video payload on session 0, in 16 KiB fragments
//! let packets = gen.t6_fragmented(0, &payload_pattern(65536, 1), 16384);
//!
//! // One Trigger 5 image
//! let packets = gen.t5_image(640, 480, &payload_pattern(4096, 2));
//! ```

use crate::framing::{HeaderRecord, SelectorRecord, T5_HEADER_LEN};
use crate::packet::{ConversationId, Direction, SetupFields, UsbPacket};

/// Trigger 5 bulk stream endpoint (OUT)
pub const T5_STREAM_EP: u8 = 1;
/// Trigger 5 notification endpoint (IN)
pub const T5_NOTIFY_EP: u8 = 4;
/// Trigger 6 bulk stream endpoint (OUT)
pub const T6_STREAM_EP: u8 = 2;
/// Trigger 6 bulk stream endpoint (IN)
pub const T6_STREAM_IN_EP: u8 = 1;
/// Trigger 6 notification endpoint (IN)
pub const T6_NOTIFY_EP: u8 = 3;

/// Deterministic, non-repeating-looking payload bytes
pub fn payload_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(u32::from(seed) * 7) as u8)
        .collect()
}

/// Cut a packet's captured bytes short, keeping its reported length
pub fn truncate_capture(mut packet: UsbPacket, captured: usize) -> UsbPacket {
    packet.data.truncate(captured);
    packet
}

/// Generates synthetic adapter traffic for one conversation
///
/// Sequence numbers increase across every packet the generator emits.
#[derive(Debug, Clone)]
pub struct PacketGenerator {
    /// Conversation every packet belongs to
    pub conversation: ConversationId,
    /// Maximum bytes per bulk packet
    pub max_packet_size: usize,
    next_sequence: u64,
    frame_counter: u16,
}

impl Default for PacketGenerator {
    fn default() -> Self {
        Self::new(ConversationId(1), 16384)
    }
}

impl PacketGenerator {
    /// Create a generator for a conversation with the given bulk packet size
    pub fn new(conversation: ConversationId, max_packet_size: usize) -> Self {
        Self {
            conversation,
            max_packet_size: max_packet_size.max(T5_HEADER_LEN + 1),
            next_sequence: 0,
            frame_counter: 0,
        }
    }

    /// Sequence number the next packet will get
    pub fn peek_sequence(&self) -> u64 {
        self.next_sequence
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Bulk OUT packet on an arbitrary endpoint
    pub fn bulk_out(&mut self, endpoint: u8, data: Vec<u8>) -> UsbPacket {
        let sequence = self.take_sequence();
        UsbPacket::bulk(self.conversation, sequence, Direction::Out, endpoint, data)
    }

    /// Bulk IN packet on an arbitrary endpoint
    pub fn bulk_in(&mut self, endpoint: u8, data: Vec<u8>) -> UsbPacket {
        let sequence = self.take_sequence();
        UsbPacket::bulk(self.conversation, sequence, Direction::In, endpoint, data)
    }

    fn chunks(&mut self, endpoint: u8, data: &[u8]) -> Vec<UsbPacket> {
        data.chunks(self.max_packet_size)
            .map(|chunk| self.bulk_out(endpoint, chunk.to_vec()))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Trigger 5
    // ------------------------------------------------------------------------

    /// Image header plus payload; the header shares its packet with the first bytes
    pub fn t5_image(&mut self, width: u16, height: u16, payload: &[u8]) -> Vec<UsbPacket> {
        let header = HeaderRecord::image(self.frame_counter, width, height, payload.len() as u32);
        self.frame_counter = self.frame_counter.wrapping_add(1) & 0x0FFF;
        self.t5_payload(&header, payload)
    }

    /// Arbitrary header followed by `payload`
    pub fn t5_payload(&mut self, header: &HeaderRecord, payload: &[u8]) -> Vec<UsbPacket> {
        let inline = payload.len().min(self.max_packet_size - T5_HEADER_LEN);
        let mut first = header.to_bytes().to_vec();
        first.extend_from_slice(&payload[..inline]);

        let mut packets = vec![self.bulk_out(T5_STREAM_EP, first)];
        packets.extend(self.chunks(T5_STREAM_EP, &payload[inline..]));
        packets
    }

    // ------------------------------------------------------------------------
    // Trigger 6
    // ------------------------------------------------------------------------

    /// Whole payload behind one selector, continuations in separate packets
    pub fn t6_session(&mut self, session: u32, payload: &[u8]) -> Vec<UsbPacket> {
        let selector = SelectorRecord::whole(session, payload.len() as u32);
        let mut packets = vec![self.bulk_out(T6_STREAM_EP, selector.to_bytes().to_vec())];
        packets.extend(self.chunks(T6_STREAM_EP, payload));
        packets
    }

    /// One fragment group: selector then its bytes
    pub fn t6_fragment(
        &mut self,
        session: u32,
        total_len: u32,
        fragment_offset: u32,
        fragment: &[u8],
    ) -> Vec<UsbPacket> {
        let selector =
            SelectorRecord::fragment(session, total_len, fragment_offset, fragment.len() as u32);
        let mut packets = vec![self.bulk_out(T6_STREAM_EP, selector.to_bytes().to_vec())];
        packets.extend(self.chunks(T6_STREAM_EP, fragment));
        packets
    }

    /// Payload split into selector-announced fragments of `fragment_len`
    pub fn t6_fragmented(
        &mut self,
        session: u32,
        payload: &[u8],
        fragment_len: usize,
    ) -> Vec<UsbPacket> {
        let total = payload.len() as u32;
        let mut packets = Vec::new();
        for (i, fragment) in payload.chunks(fragment_len.max(1)).enumerate() {
            let offset = (i * fragment_len.max(1)) as u32;
            packets.extend(self.t6_fragment(session, total, offset, fragment));
        }
        packets
    }

    /// Device-to-host session on EP1 IN: selector, then continuations
    pub fn t6_inbound(&mut self, session: u32, payload: &[u8]) -> Vec<UsbPacket> {
        let selector = SelectorRecord::whole(session, payload.len() as u32);
        let mut packets = vec![self.bulk_in(T6_STREAM_IN_EP, selector.to_bytes().to_vec())];
        for chunk in payload.chunks(self.max_packet_size) {
            packets.push(self.bulk_in(T6_STREAM_IN_EP, chunk.to_vec()));
        }
        packets
    }

    /// Video (session 0) and audio (session 3) fragments alternating on one endpoint
    pub fn t6_interleaved(
        &mut self,
        video: &[u8],
        audio: &[u8],
        fragment_len: usize,
    ) -> Vec<UsbPacket> {
        let step = fragment_len.max(1);
        let mut video_chunks = video.chunks(step).enumerate();
        let mut audio_chunks = audio.chunks(step).enumerate();
        let mut packets = Vec::new();

        loop {
            let next_video = video_chunks.next();
            let next_audio = audio_chunks.next();
            if next_video.is_none() && next_audio.is_none() {
                break;
            }
            if let Some((i, fragment)) = next_video {
                packets.extend(self.t6_fragment(0, video.len() as u32, (i * step) as u32, fragment));
            }
            if let Some((i, fragment)) = next_audio {
                packets.extend(self.t6_fragment(3, audio.len() as u32, (i * step) as u32, fragment));
            }
        }
        packets
    }

    // ------------------------------------------------------------------------
    // Control and interrupt
    // ------------------------------------------------------------------------

    /// Vendor OUT request with its data stage, plus the empty completion
    pub fn control_out(&mut self, request: u8, value: u16, index: u16, data: Vec<u8>) -> Vec<UsbPacket> {
        let setup = SetupFields::vendor(Direction::Out, request, value, index, data.len() as u16);
        let first = self.take_sequence();
        let second = self.take_sequence();
        vec![
            UsbPacket::control_setup(self.conversation, first, setup, data),
            UsbPacket::control_completion(self.conversation, second, setup, Vec::new()),
        ]
    }

    /// Vendor IN request: the setup stage, then the completion carrying `reply`
    pub fn control_in(&mut self, request: u8, value: u16, index: u16, reply: Vec<u8>) -> Vec<UsbPacket> {
        let setup = SetupFields::vendor(Direction::In, request, value, index, reply.len() as u16);
        let first = self.take_sequence();
        let second = self.take_sequence();
        vec![
            UsbPacket::control_setup(self.conversation, first, setup, Vec::new()),
            UsbPacket::control_completion(self.conversation, second, setup, reply),
        ]
    }

    /// Interrupt IN notification
    pub fn notification(&mut self, endpoint: u8, data: Vec<u8>) -> UsbPacket {
        let sequence = self.take_sequence();
        UsbPacket::interrupt(self.conversation, sequence, Direction::In, endpoint, data)
    }
}
