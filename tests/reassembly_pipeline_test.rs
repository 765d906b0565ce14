//! Integration tests for the complete dissection pipeline.
//!
//! ```text
//! Packets → Dissector → Classifier → Reassembly → FrameInfo + Units
//!                    └→ Control decoder → Timing decoder
//! ```
//!
//! Traffic is produced by `test_utils::PacketGenerator`, so no adapter or
//! recorded capture is needed.

use std::sync::Arc;

use trigger_dissect_lib::control::ControlContent;
use trigger_dissect_lib::framing::{HeaderRecord, SelectorRecord};
use trigger_dissect_lib::test_utils::{
    payload_pattern, truncate_capture, PacketGenerator, T5_NOTIFY_EP, T5_STREAM_EP,
    T6_NOTIFY_EP, T6_STREAM_EP, T6_STREAM_IN_EP,
};
use trigger_dissect_lib::{
    Completeness, ConversationId, Dissector, DissectorConfig, FrameClass, HardwarePlatform,
    ProtocolVariant, ReassembledUnit, StreamKey, UsbPacket,
};

type Units = Vec<Arc<ReassembledUnit>>;

fn t5_dissector() -> Dissector {
    Dissector::new(DissectorConfig::for_variant(ProtocolVariant::Trigger5))
}

fn run(dissector: &mut Dissector, packets: &[UsbPacket]) -> Units {
    let mut units = Units::new();
    for packet in packets {
        dissector.process_with(packet, &mut units);
    }
    units
}

/// Alternate packets from two streams, renumbering them in wire order
fn interleave(a: Vec<UsbPacket>, b: Vec<UsbPacket>) -> Vec<UsbPacket> {
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    let mut merged = Vec::new();
    loop {
        let (x, y) = (a.next(), b.next());
        if x.is_none() && y.is_none() {
            break;
        }
        merged.extend(x);
        merged.extend(y);
    }
    for (sequence, packet) in merged.iter_mut().enumerate() {
        packet.sequence = sequence as u64;
    }
    merged
}

fn hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

// ============================================================================
// Trigger 6: selector-driven sessions
// ============================================================================

#[test]
fn test_t6_single_packet_session() {
    let mut gen = PacketGenerator::default();
    let mut data = SelectorRecord::whole(0, 16).to_bytes().to_vec();
    data.extend_from_slice(&payload_pattern(16, 1));
    let packet = gen.bulk_out(T6_STREAM_EP, data);

    let mut dissector = Dissector::default();
    let units = run(&mut dissector, &[packet]);

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].key, StreamKey::Session(0));
    assert_eq!(units[0].status, Completeness::Complete);
    assert_eq!(units[0].data, payload_pattern(16, 1));
    assert_eq!(units[0].origin_sequence, units[0].closing_sequence);
}

#[test]
fn test_t6_three_continuations() {
    let mut gen = PacketGenerator::new(ConversationId(1), 100);
    let payload = payload_pattern(300, 2);
    let packets = gen.t6_session(0, &payload);
    assert_eq!(packets.len(), 4);

    let mut dissector = Dissector::default();
    let units = run(&mut dissector, &packets);

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].data, payload);
    assert_eq!(units[0].origin_sequence, 0);
    assert_eq!(units[0].closing_sequence, 3);

    let classes: Vec<FrameClass> = packets
        .iter()
        .map(|p| dissector.lookup_frame(p.conversation, p.sequence).unwrap().class)
        .collect();
    assert_eq!(
        classes,
        vec![
            FrameClass::Header,
            FrameClass::Continuation,
            FrameClass::Continuation,
            FrameClass::Continuation
        ]
    );
}

#[test]
fn test_t6_truncated_capture() {
    let mut gen = PacketGenerator::default();
    let selector = gen.bulk_out(T6_STREAM_EP, SelectorRecord::whole(0, 1000).to_bytes().to_vec());
    let continuation = truncate_capture(gen.bulk_out(T6_STREAM_EP, payload_pattern(1000, 3)), 50);

    let mut dissector = Dissector::default();
    dissector.process(&selector);
    let info = dissector.process(&continuation);

    assert!(info.truncated);
    assert_eq!(info.payload_remaining, 0);
    assert_eq!(info.units.len(), 1);
    let unit = &info.units[0];
    assert_eq!(unit.status, Completeness::Truncated);
    assert_eq!(unit.data, payload_pattern(50, 3));
    assert_eq!(unit.accounted_len, 1000);
    assert_eq!(dissector.stats().truncated_packets, 1);
}

#[test]
fn test_replay_is_idempotent() {
    let mut gen = PacketGenerator::new(ConversationId(1), 100);
    let packets = gen.t6_session(0, &payload_pattern(300, 4));

    let mut dissector = Dissector::default();
    let first: Vec<_> = packets.iter().map(|p| dissector.process(p)).collect();
    let stats = dissector.stats();

    let mut redelivered = Units::new();
    for (packet, original) in packets.iter().zip(&first) {
        let again = dissector.process_with(packet, &mut redelivered);
        assert_eq!(*again, **original);
    }
    assert!(redelivered.is_empty());
    assert_eq!(dissector.stats(), stats);
}

#[test]
fn test_t6_multi_fragment_video() {
    let mut gen = PacketGenerator::new(ConversationId(1), 4096);
    let payload = payload_pattern(65536, 5);
    let packets = gen.t6_fragmented(0, &payload, 16384);

    let mut dissector = Dissector::default();
    let units = run(&mut dissector, &packets);

    assert_eq!(units.len(), 1);
    assert!(units[0].is_complete());
    assert_eq!(units[0].data, payload);
    assert_eq!(dissector.stats().header_packets, 4);
    assert_eq!(dissector.stats().continuation_packets, 16);
}

#[test]
fn test_t6_interleaved_sessions() {
    let mut gen = PacketGenerator::new(ConversationId(1), 128);
    let video = payload_pattern(1000, 6);
    let audio = payload_pattern(300, 7);
    let packets = gen.t6_interleaved(&video, &audio, 200);

    let mut dissector = Dissector::default();
    let units = run(&mut dissector, &packets);

    assert_eq!(units.len(), 2);
    let audio_unit = units.iter().find(|u| u.key == StreamKey::Session(3)).unwrap();
    let video_unit = units.iter().find(|u| u.key == StreamKey::Session(0)).unwrap();
    assert_eq!(audio_unit.data, audio);
    assert_eq!(video_unit.data, video);
    assert!(audio_unit.is_complete() && video_unit.is_complete());
    // Audio finishes first: it needs only two fragments
    assert!(audio_unit.closing_sequence < video_unit.closing_sequence);
}

#[test]
fn test_t6_abandoned_lineage() {
    let mut gen = PacketGenerator::default();
    let mut packets = gen.t6_fragment(0, 500, 0, &payload_pattern(200, 8));
    let replacement = payload_pattern(400, 9);
    packets.extend(gen.t6_session(0, &replacement));

    let mut dissector = Dissector::default();
    let units = run(&mut dissector, &packets);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].status, Completeness::Abandoned);
    assert_eq!(units[0].data, payload_pattern(200, 8));
    assert_eq!(units[0].declared_len, 500);
    assert_eq!(units[1].status, Completeness::Complete);
    assert_eq!(units[1].data, replacement);
}

#[test]
fn test_finish_reports_open_lineages() {
    let mut gen = PacketGenerator::default();
    let mut packets = gen.t6_fragment(0, 1000, 0, &payload_pattern(400, 10));
    packets.extend(gen.t6_fragment(3, 64, 0, &payload_pattern(32, 11)));

    let mut dissector = Dissector::default();
    assert!(run(&mut dissector, &packets).is_empty());

    let mut units = Units::new();
    dissector.finish_with(&mut units);
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|u| u.status == Completeness::CaptureEnded));
    assert_eq!(units[0].key, StreamKey::Session(0));
    assert_eq!(units[0].data.len(), 400);
    assert_eq!(units[1].key, StreamKey::Session(3));
    assert_eq!(units[1].data.len(), 32);
}

#[test]
fn test_conversations_are_independent() {
    let mut gen_a = PacketGenerator::new(ConversationId(1), 64);
    let mut gen_b = PacketGenerator::new(ConversationId(2), 64);
    let a = gen_a.t6_session(0, &payload_pattern(150, 12));
    let b = gen_b.t6_session(0, &payload_pattern(90, 13));

    let mut dissector = Dissector::default();
    let mut units = Units::new();
    for packet in a.iter().zip(&b).flat_map(|(x, y)| [x, y]) {
        dissector.process_with(packet, &mut units);
    }
    for packet in a.iter().skip(b.len()) {
        dissector.process_with(packet, &mut units);
    }

    assert_eq!(units.len(), 2);
    let unit_a = units.iter().find(|u| u.conversation == ConversationId(1)).unwrap();
    let unit_b = units.iter().find(|u| u.conversation == ConversationId(2)).unwrap();
    assert_eq!(unit_a.data, payload_pattern(150, 12));
    assert_eq!(unit_b.data, payload_pattern(90, 13));
}

// ============================================================================
// Trigger 6: stream directions
// ============================================================================

#[test]
fn test_t6_in_bytes_do_not_continue_out_group() {
    let mut gen = PacketGenerator::default();
    let packets = vec![
        gen.bulk_out(T6_STREAM_EP, SelectorRecord::whole(0, 200).to_bytes().to_vec()),
        gen.bulk_out(T6_STREAM_EP, vec![0xAA; 100]),
        gen.bulk_in(T6_STREAM_IN_EP, vec![0xBB; 100]),
        gen.bulk_out(T6_STREAM_EP, vec![0xAA; 100]),
    ];

    let mut dissector = Dissector::default();
    let units = run(&mut dissector, &packets);

    let inbound = dissector.lookup_frame(ConversationId(1), 2).unwrap();
    assert_eq!(inbound.class, FrameClass::NotProtocol);
    assert_eq!(inbound.key, None);

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].endpoint, T6_STREAM_EP);
    assert!(units[0].is_complete());
    assert_eq!(units[0].data, vec![0xAA; 200]);
    assert_eq!(units[0].closing_sequence, 3);
}

#[test]
fn test_t6_in_and_out_sessions_interleave() {
    let mut gen = PacketGenerator::new(ConversationId(1), 128);
    let outbound = payload_pattern(600, 20);
    let inbound = payload_pattern(300, 21);
    let out_packets = gen.t6_fragmented(0, &outbound, 200);
    let in_packets = gen.t6_inbound(0, &inbound);
    let packets = interleave(out_packets, in_packets);

    let mut dissector = Dissector::default();
    let units = run(&mut dissector, &packets);

    assert_eq!(units.len(), 2);
    let out_unit = units.iter().find(|u| u.endpoint == T6_STREAM_EP).unwrap();
    let in_unit = units.iter().find(|u| u.endpoint == 0x80 | T6_STREAM_IN_EP).unwrap();
    assert_eq!(out_unit.key, StreamKey::Session(0));
    assert_eq!(in_unit.key, StreamKey::Session(0));
    assert!(out_unit.is_complete() && in_unit.is_complete());
    assert!(!out_unit.truncated && !in_unit.truncated);
    assert_eq!(out_unit.data, outbound);
    assert_eq!(in_unit.data, inbound);

    let conversation = dissector.registry().conversation(ConversationId(1)).unwrap();
    assert_eq!(conversation.in_progress(), 0);
    assert!(!conversation.has_active_group());
}

#[test]
fn test_finish_drains_every_direction() {
    let mut gen = PacketGenerator::default();
    let mut packets = gen.t6_fragment(0, 1000, 0, &payload_pattern(100, 22));
    packets.push(gen.bulk_in(
        T6_STREAM_IN_EP,
        SelectorRecord::whole(3, 500).to_bytes().to_vec(),
    ));
    packets.push(gen.bulk_in(T6_STREAM_IN_EP, payload_pattern(50, 23)));

    let mut dissector = Dissector::default();
    assert!(run(&mut dissector, &packets).is_empty());

    let units = dissector.finish();
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|u| u.status == Completeness::CaptureEnded));
    assert_eq!(units[0].endpoint, T6_STREAM_EP);
    assert_eq!(units[0].data, payload_pattern(100, 22));
    assert_eq!(units[1].endpoint, 0x80 | T6_STREAM_IN_EP);
    assert_eq!(units[1].data, payload_pattern(50, 23));
}

// ============================================================================
// Trigger 5: checksummed headers on one implicit stream
// ============================================================================

#[test]
fn test_t5_image_sequence() {
    let mut gen = PacketGenerator::new(ConversationId(1), 512);
    let first = payload_pattern(2000, 14);
    let second = payload_pattern(700, 15);
    let mut packets = gen.t5_image(40, 25, &first);
    packets.extend(gen.t5_image(20, 35, &second));

    let mut dissector = t5_dissector();
    let units = run(&mut dissector, &packets);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].key, StreamKey::Implicit);
    assert_eq!(units[0].data, first);
    assert_eq!(units[1].data, second);
    assert_eq!(dissector.stats().checksum_failures, 0);
}

#[test]
fn test_t5_non_header_packet_is_ignored() {
    let mut gen = PacketGenerator::default();
    let packet = gen.bulk_out(T5_STREAM_EP, vec![0xFB, 0x15, 0, 0, 0, 0]);

    let mut dissector = t5_dissector();
    let info = dissector.process(&packet);

    assert_eq!(info.class, FrameClass::NotProtocol);
    assert!(info.units.is_empty());
    assert_eq!(info.payload_remaining, 0);
    let conversation = dissector.registry().conversation(ConversationId(1)).unwrap();
    assert_eq!(conversation.in_progress(), 0);
}

#[test]
fn test_t5_checksum_mismatch_is_advisory() {
    let mut gen = PacketGenerator::default();
    let mut header = HeaderRecord::image(0, 4, 4, 8).to_bytes();
    header[19] ^= 0xFF;
    let mut data = header.to_vec();
    data.extend_from_slice(&payload_pattern(8, 16));
    let packet = gen.bulk_out(T5_STREAM_EP, data);

    let mut dissector = t5_dissector();
    let info = dissector.process(&packet);

    assert_eq!(info.class, FrameClass::Header);
    assert_eq!(info.checksum_valid, Some(false));
    assert_eq!(info.units.len(), 1);
    assert!(info.units[0].is_complete());
    assert_eq!(dissector.stats().checksum_failures, 1);
}

#[test]
fn test_t5_resync_abandons_partial_image() {
    let mut gen = PacketGenerator::new(ConversationId(1), 256);
    let mut packets = gen.t5_image(16, 16, &payload_pattern(1000, 17));
    // Lose the tail of the first image
    packets.truncate(2);
    let second = payload_pattern(300, 18);
    packets.extend(gen.t5_image(10, 10, &second));

    let mut dissector = t5_dissector();
    let units = run(&mut dissector, &packets);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].status, Completeness::Abandoned);
    assert_eq!(units[0].data.len(), 236 + 256);
    assert_eq!(units[1].status, Completeness::Complete);
    assert_eq!(units[1].data, second);
}

// ============================================================================
// Control and interrupt traffic
// ============================================================================

#[test]
fn test_t5_mode_set_timing() {
    let mut gen = PacketGenerator::default();
    let timing = hex("043807800897002b009300ff00ff077f04640004002300ff00ff0437012c1b28020000");
    let packets = gen.control_out(0xC3, 0x0010, 0, timing);

    let mut dissector = t5_dissector();
    let setup = dissector.process(&packets[0]);
    let completion = dissector.process(&packets[1]);

    assert_eq!(completion.class, FrameClass::Ignored);
    assert_eq!(setup.class, FrameClass::Control);
    let Some(ControlContent::VideoMode { index, timing }) = setup.control.as_ref() else {
        panic!("expected a video mode, got {:?}", setup.control);
    };
    assert_eq!(*index, Some(0x10));
    assert_eq!(timing.width(), 1920);
    assert_eq!(timing.height(), 1080);
    assert_eq!(timing.pixel_clock_hz(), Some(148_500_000));
    let refresh = timing.refresh_rate_hz.unwrap();
    assert!((refresh - 60.0).abs() < 1e-6, "refresh {}", refresh);
}

#[test]
fn test_t6_mode_set_uses_configured_platform() {
    let mut record = 148_500u32.to_le_bytes().to_vec();
    for word in [60u16, 2200, 1920, 2008, 44, 1125, 1080, 1084, 5, 3, 4] {
        record.extend_from_slice(&word.to_le_bytes());
    }
    record.extend_from_slice(&[24, 0x00, 0, 1, 0, 0x01]);

    let config = DissectorConfig {
        t6_platform: HardwarePlatform::SuperLite,
        ..DissectorConfig::default()
    };
    let mut dissector = Dissector::new(config);
    let mut gen = PacketGenerator::default();
    let packets = gen.control_out(0x12, 0, 0, record);
    let info = dissector.process(&packets[0]);

    let Some(ControlContent::VideoMode { timing, .. }) = info.control.as_ref() else {
        panic!("expected a video mode, got {:?}", info.control);
    };
    assert_eq!(timing.pixel_clock_hz(), Some(148_500_000));
    assert_eq!(timing.pll_clock_hz, Some(123_750_000));
}

#[test]
fn test_notifications_and_foreign_endpoints() {
    let mut gen = PacketGenerator::default();
    let t5_notify = gen.notification(T5_NOTIFY_EP, vec![0x01]);
    let t6_notify = gen.notification(T6_NOTIFY_EP, vec![0x01]);

    let mut t5 = t5_dissector();
    assert_eq!(t5.process(&t5_notify).class, FrameClass::Notification);
    assert_eq!(t5.process(&t6_notify).class, FrameClass::Ignored);

    let mut t6 = Dissector::default();
    assert_eq!(t6.process(&t6_notify).class, FrameClass::Notification);
    assert_eq!(t6.process(&t5_notify).class, FrameClass::Ignored);
}

#[test]
fn test_device_identification_drives_classification() {
    let mut gen = PacketGenerator::default();
    let payload = payload_pattern(64, 19);
    let packets = gen.t5_image(8, 4, &payload);

    let mut dissector = Dissector::default();
    assert_eq!(
        dissector.identify_device(ConversationId(1), 0x0711, 0x5800),
        Some(ProtocolVariant::Trigger5)
    );
    let units = run(&mut dissector, &packets);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].data, payload);
}
