//! Per-variant frame classification
//!
//! A [`FrameClassifier`] knows which endpoints carry the reassembled byte
//! stream for its protocol generation and how to recognise the record that
//! opens a fragment group. One classifier is chosen per conversation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use trigger_dissect_lib::classifier::classifier_for;
//!
//! let classifier = classifier_for(&config);
//! if classifier.carries_stream(&packet) {
//!     if let Some(header) = classifier.try_parse_header(&packet.data) {
//!         println!("{} bytes declared", header.total_len());
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::config::DissectorConfig;
use crate::framing::{
    parse_t5_header, parse_t6_selector, GoverningRecord, T5_HEADER_LEN, T6_SELECTOR_LEN,
};
use crate::packet::{Direction, ProtocolVariant, TransferType, UsbPacket};
use crate::reassembly::StreamKey;

const T5_STREAM_ENDPOINT: u8 = 1;
const T5_NOTIFY_ENDPOINT: u8 = 4;
const T6_STREAM_OUT_ENDPOINT: u8 = 2;
const T6_STREAM_IN_ENDPOINT: u8 = 1;
const T6_NOTIFY_ENDPOINT: u8 = 3;

/// A recognised header or selector at the start of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    /// Stream the record governs
    pub key: StreamKey,
    /// Parsed record, shared by every frame of the burst it governs
    pub record: Arc<GoverningRecord>,
    /// Bytes occupied by the record itself
    pub header_len: usize,
    /// Trigger 5 checksum result; `None` for records without a checksum
    pub checksum_valid: Option<bool>,
}

impl ParsedHeader {
    /// Declared length of the whole logical payload
    pub fn total_len(&self) -> u64 {
        self.record.total_len()
    }

    /// Offset of this fragment within the logical payload, for selector records
    pub fn fragment_offset(&self) -> Option<u64> {
        match self.record.as_ref() {
            GoverningRecord::Trigger5(_) => None,
            GoverningRecord::Trigger6(s) => Some(u64::from(s.fragment_offset)),
        }
    }

    /// Declared fragment length, for selector records
    pub fn fragment_len(&self) -> Option<u64> {
        match self.record.as_ref() {
            GoverningRecord::Trigger5(_) => None,
            GoverningRecord::Trigger6(s) => Some(u64::from(s.fragment_len)),
        }
    }
}

/// Protocol-variant capability used by the reassembly engine
pub trait FrameClassifier: fmt::Debug + Send {
    /// Protocol generation handled by this classifier
    fn variant(&self) -> ProtocolVariant;

    /// Whether the packet belongs to the reassembled bulk stream
    fn carries_stream(&self, packet: &UsbPacket) -> bool;

    /// Whether the packet is an interrupt notification from the device
    fn is_notification(&self, packet: &UsbPacket) -> bool;

    /// Recognise a header/selector at the start of `bytes`
    fn try_parse_header(&self, bytes: &[u8]) -> Option<ParsedHeader>;

    /// Buffer capacity to reserve once a lineage opened by `header` spans a second packet
    fn frame_size_hint(&self, header: &ParsedHeader) -> usize;

    /// Whether a header found inside an unfinished fragment group restarts the stream
    fn resyncs_on(&self, _header: &ParsedHeader) -> bool {
        false
    }
}

/// Upper bound on preallocated lineage buffers
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

fn bounded_hint(total_len: u64) -> usize {
    total_len.min(MAX_PREALLOCATION) as usize
}

/// Trigger 5: checksummed header on bulk EP1 OUT, one implicit stream
#[derive(Debug, Clone)]
pub struct Trigger5Classifier {
    resync_on_header: bool,
    max_payload_len: u64,
}

impl Trigger5Classifier {
    /// Create a classifier from the dissector configuration
    pub fn new(config: &DissectorConfig) -> Self {
        Self {
            resync_on_header: config.t5_resync_on_header,
            max_payload_len: config.max_payload_len,
        }
    }
}

impl FrameClassifier for Trigger5Classifier {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Trigger5
    }

    fn carries_stream(&self, packet: &UsbPacket) -> bool {
        packet.transfer_type == TransferType::Bulk
            && packet.direction == Direction::Out
            && packet.endpoint == T5_STREAM_ENDPOINT
    }

    fn is_notification(&self, packet: &UsbPacket) -> bool {
        packet.transfer_type == TransferType::Interrupt
            && packet.direction == Direction::In
            && packet.endpoint == T5_NOTIFY_ENDPOINT
    }

    fn try_parse_header(&self, bytes: &[u8]) -> Option<ParsedHeader> {
        let (header, checksum_valid) = parse_t5_header(bytes)?;
        let payload_len = u64::from(header.payload_len());
        if payload_len > self.max_payload_len {
            log::debug!(
                "T5 header declares {} bytes (limit {}), not treating as header",
                payload_len,
                self.max_payload_len
            );
            return None;
        }
        Some(ParsedHeader {
            key: StreamKey::Implicit,
            record: Arc::new(GoverningRecord::Trigger5(header)),
            header_len: T5_HEADER_LEN,
            checksum_valid: Some(checksum_valid),
        })
    }

    fn frame_size_hint(&self, header: &ParsedHeader) -> usize {
        bounded_hint(header.total_len())
    }

    fn resyncs_on(&self, header: &ParsedHeader) -> bool {
        self.resync_on_header && header.checksum_valid == Some(true)
    }
}

/// Trigger 6: selector-multiplexed sessions on bulk EP2 OUT and EP1 IN
#[derive(Debug, Clone)]
pub struct Trigger6Classifier {
    max_payload_len: u64,
}

impl Trigger6Classifier {
    /// Create a classifier from the dissector configuration
    pub fn new(config: &DissectorConfig) -> Self {
        Self {
            max_payload_len: config.max_payload_len,
        }
    }
}

impl FrameClassifier for Trigger6Classifier {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Trigger6
    }

    fn carries_stream(&self, packet: &UsbPacket) -> bool {
        if packet.transfer_type != TransferType::Bulk {
            return false;
        }
        matches!(
            (packet.direction, packet.endpoint),
            (Direction::Out, T6_STREAM_OUT_ENDPOINT) | (Direction::In, T6_STREAM_IN_ENDPOINT)
        )
    }

    fn is_notification(&self, packet: &UsbPacket) -> bool {
        packet.transfer_type == TransferType::Interrupt
            && packet.direction == Direction::In
            && packet.endpoint == T6_NOTIFY_ENDPOINT
    }

    fn try_parse_header(&self, bytes: &[u8]) -> Option<ParsedHeader> {
        let selector = parse_t6_selector(bytes)?;
        let total_len = u64::from(selector.total_len);
        if total_len > self.max_payload_len {
            log::debug!(
                "T6 selector declares {} bytes (limit {}), not treating as selector",
                total_len,
                self.max_payload_len
            );
            return None;
        }
        Some(ParsedHeader {
            key: StreamKey::Session(selector.session),
            record: Arc::new(GoverningRecord::Trigger6(selector)),
            header_len: T6_SELECTOR_LEN,
            checksum_valid: None,
        })
    }

    fn frame_size_hint(&self, header: &ParsedHeader) -> usize {
        bounded_hint(header.total_len())
    }
}

/// Build the classifier for the configured protocol variant
pub fn classifier_for(config: &DissectorConfig) -> Box<dyn FrameClassifier> {
    match config.variant {
        ProtocolVariant::Trigger5 => Box::new(Trigger5Classifier::new(config)),
        ProtocolVariant::Trigger6 => Box::new(Trigger6Classifier::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{HeaderRecord, SelectorRecord};
    use crate::packet::ConversationId;

    fn bulk(direction: Direction, endpoint: u8) -> UsbPacket {
        UsbPacket::bulk(ConversationId(1), 0, direction, endpoint, vec![0; 4])
    }

    #[test]
    fn test_t5_stream_endpoint() {
        let classifier = Trigger5Classifier::new(&DissectorConfig::default());
        assert!(classifier.carries_stream(&bulk(Direction::Out, 1)));
        assert!(!classifier.carries_stream(&bulk(Direction::In, 1)));
        assert!(!classifier.carries_stream(&bulk(Direction::Out, 2)));

        let interrupt = UsbPacket::interrupt(ConversationId(1), 0, Direction::In, 4, vec![1]);
        assert!(!classifier.carries_stream(&interrupt));
        assert!(classifier.is_notification(&interrupt));
    }

    #[test]
    fn test_t6_stream_endpoints() {
        let classifier = Trigger6Classifier::new(&DissectorConfig::default());
        assert!(classifier.carries_stream(&bulk(Direction::Out, 2)));
        assert!(classifier.carries_stream(&bulk(Direction::In, 1)));
        assert!(!classifier.carries_stream(&bulk(Direction::Out, 1)));
        assert!(!classifier.carries_stream(&bulk(Direction::In, 2)));

        let interrupt = UsbPacket::interrupt(ConversationId(1), 0, Direction::In, 3, vec![1]);
        assert!(classifier.is_notification(&interrupt));
    }

    #[test]
    fn test_t5_parse_header() {
        let classifier = Trigger5Classifier::new(&DissectorConfig::default());
        let bytes = HeaderRecord::image(1, 4, 4, 48).to_bytes();
        let parsed = classifier.try_parse_header(&bytes).unwrap();
        assert_eq!(parsed.key, StreamKey::Implicit);
        assert_eq!(parsed.header_len, 20);
        assert_eq!(parsed.total_len(), 48);
        assert_eq!(parsed.checksum_valid, Some(true));
        assert_eq!(parsed.fragment_offset(), None);
        assert_eq!(classifier.frame_size_hint(&parsed), 48);
        assert!(classifier.resyncs_on(&parsed));

        assert!(classifier.try_parse_header(&[0x00; 20]).is_none());
    }

    #[test]
    fn test_t5_resync_requires_valid_checksum() {
        let classifier = Trigger5Classifier::new(&DissectorConfig::default());
        let mut bytes = HeaderRecord::image(1, 4, 4, 48).to_bytes();
        bytes[19] ^= 0xFF;
        let parsed = classifier.try_parse_header(&bytes).unwrap();
        assert_eq!(parsed.checksum_valid, Some(false));
        assert!(!classifier.resyncs_on(&parsed));

        let config = DissectorConfig {
            t5_resync_on_header: false,
            ..DissectorConfig::default()
        };
        let classifier = Trigger5Classifier::new(&config);
        let parsed = classifier
            .try_parse_header(&HeaderRecord::image(1, 4, 4, 48).to_bytes())
            .unwrap();
        assert!(!classifier.resyncs_on(&parsed));
    }

    #[test]
    fn test_t6_parse_selector() {
        let classifier = Trigger6Classifier::new(&DissectorConfig::default());
        let bytes = SelectorRecord::fragment(3, 4096, 1024, 512).to_bytes();
        let parsed = classifier.try_parse_header(&bytes).unwrap();
        assert_eq!(parsed.key, StreamKey::Session(3));
        assert_eq!(parsed.header_len, 32);
        assert_eq!(parsed.fragment_offset(), Some(1024));
        assert_eq!(parsed.fragment_len(), Some(512));
        assert_eq!(parsed.checksum_valid, None);
        assert!(!classifier.resyncs_on(&parsed));
    }

    #[test]
    fn test_oversized_declaration_rejected() {
        let config = DissectorConfig {
            max_payload_len: 1000,
            ..DissectorConfig::default()
        };
        let t6 = Trigger6Classifier::new(&config);
        assert!(t6
            .try_parse_header(&SelectorRecord::whole(0, 1001).to_bytes())
            .is_none());
        assert!(t6
            .try_parse_header(&SelectorRecord::whole(0, 1000).to_bytes())
            .is_some());

        let t5 = Trigger5Classifier::new(&config);
        assert!(t5
            .try_parse_header(&HeaderRecord::image(0, 8, 8, 2000).to_bytes())
            .is_none());
    }

    #[test]
    fn test_size_hint_is_bounded() {
        let classifier = Trigger6Classifier::new(&DissectorConfig::default());
        let parsed = classifier
            .try_parse_header(&SelectorRecord::whole(0, 60 * 1024 * 1024).to_bytes())
            .unwrap();
        assert_eq!(classifier.frame_size_hint(&parsed), 16 * 1024 * 1024);
    }

    #[test]
    fn test_classifier_for_variant() {
        let t5 = classifier_for(&DissectorConfig::for_variant(ProtocolVariant::Trigger5));
        assert_eq!(t5.variant(), ProtocolVariant::Trigger5);
        let t6 = classifier_for(&DissectorConfig::default());
        assert_eq!(t6.variant(), ProtocolVariant::Trigger6);
    }
}
