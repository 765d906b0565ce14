//! Conversation registry and per-packet frame cache
//!
//! Owns every conversation's reassembly state and the [`FrameInfo`] computed
//! for each packet, keyed by sequence number. Looking a frame up again is a
//! pure read, which is what makes re-dissecting a capture idempotent.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::classifier::{classifier_for, FrameClassifier};
use crate::config::DissectorConfig;
use crate::control::ControlContent;
use crate::framing::GoverningRecord;
use crate::packet::{ConversationId, ProtocolVariant, UsbPacket};
use crate::reassembly::{
    Completeness, FrameClass, ReassembledUnit, StreamKey, StreamState, StreamStep,
};

/// Everything learned about one physical packet
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Sequence number of the packet
    pub sequence: u64,
    /// How the packet was classified
    pub class: FrameClass,
    /// Stream the packet was attributed to
    pub key: Option<StreamKey>,
    /// Record governing the packet's fragment group
    pub record: Option<Arc<GoverningRecord>>,
    /// Bytes still owed to the fragment group after this packet
    pub fragment_remaining: u64,
    /// Bytes still owed to the logical payload after this packet
    pub payload_remaining: u64,
    /// Trigger 5 header checksum result, for header packets
    pub checksum_valid: Option<bool>,
    /// Capture holds fewer bytes than the bus reported
    pub truncated: bool,
    /// Units completed or abandoned by this packet
    pub units: Vec<Arc<ReassembledUnit>>,
    /// Decoded control-transfer content
    pub control: Option<ControlContent>,
}

impl FrameInfo {
    /// Frame with no protocol meaning
    pub fn bare(sequence: u64, class: FrameClass, truncated: bool) -> Self {
        Self {
            sequence,
            class,
            key: None,
            record: None,
            fragment_remaining: 0,
            payload_remaining: 0,
            checksum_valid: None,
            truncated,
            units: Vec::new(),
            control: None,
        }
    }
}

/// Per-conversation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationStats {
    /// Packets processed forward
    pub packets: u64,
    /// Header/selector packets
    pub header_packets: u64,
    /// Continuation packets
    pub continuation_packets: u64,
    /// Stream packets that were not protocol traffic
    pub not_protocol_packets: u64,
    /// Control transfers decoded
    pub control_packets: u64,
    /// Interrupt notifications
    pub notification_packets: u64,
    /// Trigger 5 headers with a checksum mismatch
    pub checksum_failures: u64,
    /// Packets whose capture was cut short
    pub truncated_packets: u64,
    /// Units delivered complete
    pub complete_units: u64,
    /// Units delivered truncated
    pub truncated_units: u64,
    /// Units abandoned by a later header
    pub abandoned_units: u64,
    /// Units still open when the capture ended
    pub capture_ended_units: u64,
    /// Captured bytes delivered in units
    pub unit_bytes: u64,
}

impl ConversationStats {
    fn record_frame(&mut self, info: &FrameInfo) {
        self.packets += 1;
        match info.class {
            FrameClass::Header => self.header_packets += 1,
            FrameClass::Continuation => self.continuation_packets += 1,
            FrameClass::NotProtocol => self.not_protocol_packets += 1,
            FrameClass::Control => self.control_packets += 1,
            FrameClass::Notification => self.notification_packets += 1,
            FrameClass::Ignored => {}
        }
        if info.checksum_valid == Some(false) {
            self.checksum_failures += 1;
        }
        if info.truncated {
            self.truncated_packets += 1;
        }
        for unit in &info.units {
            self.record_unit(unit);
        }
    }

    pub(crate) fn record_unit(&mut self, unit: &ReassembledUnit) {
        match unit.status {
            Completeness::Complete => self.complete_units += 1,
            Completeness::Truncated => self.truncated_units += 1,
            Completeness::Abandoned => self.abandoned_units += 1,
            Completeness::CaptureEnded => self.capture_ended_units += 1,
        }
        self.unit_bytes += unit.data.len() as u64;
    }

    /// Units delivered, whatever their completeness
    pub fn total_units(&self) -> u64 {
        self.complete_units + self.truncated_units + self.abandoned_units + self.capture_ended_units
    }

    /// Add another conversation's counters to these
    pub fn merge(&mut self, other: &ConversationStats) {
        self.packets += other.packets;
        self.header_packets += other.header_packets;
        self.continuation_packets += other.continuation_packets;
        self.not_protocol_packets += other.not_protocol_packets;
        self.control_packets += other.control_packets;
        self.notification_packets += other.notification_packets;
        self.checksum_failures += other.checksum_failures;
        self.truncated_packets += other.truncated_packets;
        self.complete_units += other.complete_units;
        self.truncated_units += other.truncated_units;
        self.abandoned_units += other.abandoned_units;
        self.capture_ended_units += other.capture_ended_units;
        self.unit_bytes += other.unit_bytes;
    }
}

/// State of one conversation
#[derive(Debug)]
pub struct Conversation {
    id: ConversationId,
    classifier: Box<dyn FrameClassifier>,
    streams: HashMap<u8, StreamState>,
    frames: HashMap<u64, Arc<FrameInfo>>,
    highest_sequence: Option<u64>,
    stats: ConversationStats,
}

impl Conversation {
    fn new(id: ConversationId, classifier: Box<dyn FrameClassifier>) -> Self {
        log::debug!("{}: new {} conversation", id, classifier.variant());
        Self {
            id,
            classifier,
            streams: HashMap::new(),
            frames: HashMap::new(),
            highest_sequence: None,
            stats: ConversationStats::default(),
        }
    }

    /// Conversation identifier
    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Protocol variant of the conversation
    pub fn variant(&self) -> ProtocolVariant {
        self.classifier.variant()
    }

    /// Classifier chosen for the conversation
    pub fn classifier(&self) -> &dyn FrameClassifier {
        self.classifier.as_ref()
    }

    /// Cached frame for a sequence number
    pub fn frame(&self, sequence: u64) -> Option<Arc<FrameInfo>> {
        self.frames.get(&sequence).cloned()
    }

    /// Number of cached frames
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Counters for the conversation
    pub fn stats(&self) -> &ConversationStats {
        &self.stats
    }

    /// Whether `sequence` is below the highest sequence processed so far
    pub fn is_behind(&self, sequence: u64) -> bool {
        self.highest_sequence.is_some_and(|high| sequence < high)
    }

    /// Replace the classifier, allowed only before any packet was processed
    pub(crate) fn set_classifier(&mut self, classifier: Box<dyn FrameClassifier>) -> bool {
        if !self.frames.is_empty() {
            return false;
        }
        self.classifier = classifier;
        true
    }

    /// Reassembly state of one stream endpoint, by address with the direction bit
    pub fn stream(&self, endpoint: u8) -> Option<&StreamState> {
        self.streams.get(&endpoint)
    }

    /// Lineages awaiting more bytes, over every stream endpoint
    pub fn in_progress(&self) -> usize {
        self.streams.values().map(StreamState::in_progress).sum()
    }

    /// Whether any stream endpoint has a fragment group open
    pub fn has_active_group(&self) -> bool {
        self.streams.values().any(StreamState::has_active_group)
    }

    /// Run a stream-carrying packet through its endpoint's state machine
    pub(crate) fn process_stream(&mut self, packet: &UsbPacket) -> StreamStep {
        let id = self.id;
        let endpoint = packet.endpoint_address();
        self.streams
            .entry(endpoint)
            .or_insert_with(|| {
                log::debug!("{}: reassembling EP 0x{:02x}", id, endpoint);
                StreamState::new(id, endpoint)
            })
            .process(
                self.classifier.as_ref(),
                packet.sequence,
                &packet.data,
                packet.reported_len,
            )
    }

    /// Cache a freshly computed frame
    pub(crate) fn store_frame(&mut self, info: FrameInfo) -> Arc<FrameInfo> {
        self.stats.record_frame(&info);
        self.highest_sequence = Some(
            self.highest_sequence
                .map_or(info.sequence, |high| high.max(info.sequence)),
        );
        let info = Arc::new(info);
        self.frames.insert(info.sequence, Arc::clone(&info));
        info
    }

    /// Close open lineages at end of capture
    pub(crate) fn finish(&mut self) -> Vec<ReassembledUnit> {
        let units: Vec<ReassembledUnit> = self
            .streams
            .values_mut()
            .flat_map(StreamState::finish)
            .collect();
        for unit in &units {
            self.stats.record_unit(unit);
        }
        units
    }
}

/// Owner of every conversation seen in a capture
#[derive(Debug)]
pub struct Registry {
    config: DissectorConfig,
    conversations: HashMap<ConversationId, Conversation>,
}

impl Registry {
    /// Create an empty registry
    pub fn new(config: DissectorConfig) -> Self {
        Self {
            config,
            conversations: HashMap::new(),
        }
    }

    /// Configuration applied to new conversations
    pub fn config(&self) -> &DissectorConfig {
        &self.config
    }

    /// Get a conversation, creating it with the configured variant if new
    pub fn get_or_create(&mut self, id: ConversationId) -> &mut Conversation {
        let config = &self.config;
        self.conversations
            .entry(id)
            .or_insert_with(|| Conversation::new(id, classifier_for(config)))
    }

    /// Get a conversation, creating it with an explicit variant if new
    ///
    /// An existing conversation switches variant only if it has not
    /// processed any packet yet.
    pub fn get_or_create_with_variant(
        &mut self,
        id: ConversationId,
        variant: ProtocolVariant,
    ) -> &mut Conversation {
        let config = DissectorConfig {
            variant,
            ..self.config.clone()
        };
        let conversation = self.get_or_create(id);
        if conversation.variant() != variant
            && !conversation.set_classifier(classifier_for(&config))
        {
            log::warn!(
                "{}: already dissected as {}, ignoring switch to {}",
                id,
                conversation.variant(),
                variant
            );
        }
        conversation
    }

    /// Look up a conversation without creating it
    pub fn conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.get(&id)
    }

    /// Cached frame for a packet, if it was processed
    pub fn lookup_frame(&self, id: ConversationId, sequence: u64) -> Option<Arc<FrameInfo>> {
        self.conversations.get(&id)?.frame(sequence)
    }

    /// Conversations in identifier order
    pub fn conversations(&self) -> Vec<&Conversation> {
        let mut all: Vec<&Conversation> = self.conversations.values().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub(crate) fn conversations_mut(&mut self) -> impl Iterator<Item = &mut Conversation> {
        self.conversations.values_mut()
    }

    /// Counters summed over all conversations
    pub fn total_stats(&self) -> ConversationStats {
        let mut total = ConversationStats::default();
        for conversation in self.conversations.values() {
            total.merge(&conversation.stats);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut registry = Registry::new(DissectorConfig::default());
        registry.get_or_create(ConversationId(1));
        registry.get_or_create(ConversationId(1));
        registry.get_or_create(ConversationId(2));
        assert_eq!(registry.conversations().len(), 2);
        assert_eq!(
            registry.get_or_create(ConversationId(1)).variant(),
            ProtocolVariant::Trigger6
        );
    }

    #[test]
    fn test_lookup_frame() {
        let mut registry = Registry::new(DissectorConfig::default());
        assert!(registry.lookup_frame(ConversationId(1), 0).is_none());

        let conversation = registry.get_or_create(ConversationId(1));
        conversation.store_frame(FrameInfo::bare(5, FrameClass::Ignored, false));

        let cached = registry.lookup_frame(ConversationId(1), 5).unwrap();
        assert_eq!(cached.sequence, 5);
        assert!(registry.lookup_frame(ConversationId(1), 6).is_none());
        assert!(registry.lookup_frame(ConversationId(9), 5).is_none());
    }

    #[test]
    fn test_variant_switch_only_before_first_packet() {
        let mut registry = Registry::new(DissectorConfig::default());
        let conversation =
            registry.get_or_create_with_variant(ConversationId(3), ProtocolVariant::Trigger5);
        assert_eq!(conversation.variant(), ProtocolVariant::Trigger5);

        conversation.store_frame(FrameInfo::bare(0, FrameClass::NotProtocol, false));
        let conversation =
            registry.get_or_create_with_variant(ConversationId(3), ProtocolVariant::Trigger6);
        assert_eq!(conversation.variant(), ProtocolVariant::Trigger5);
    }

    #[test]
    fn test_stream_endpoints_keep_separate_state() {
        use crate::framing::SelectorRecord;
        use crate::packet::Direction;

        let mut registry = Registry::new(DissectorConfig::default());
        let conversation = registry.get_or_create(ConversationId(1));
        let selector = SelectorRecord::whole(0, 200).to_bytes().to_vec();

        let out = UsbPacket::bulk(ConversationId(1), 0, Direction::Out, 2, selector);
        let step = conversation.process_stream(&out);
        assert_eq!(step.class, FrameClass::Header);

        // Bytes on EP1 IN neither continue the open EP2 OUT group nor open one
        let inbound = UsbPacket::bulk(ConversationId(1), 1, Direction::In, 1, vec![0xBB; 100]);
        let step = conversation.process_stream(&inbound);
        assert_eq!(step.class, FrameClass::NotProtocol);

        assert!(conversation.stream(0x02).unwrap().has_active_group());
        assert_eq!(conversation.stream(0x02).unwrap().progress(StreamKey::Session(0)), Some((0, 200)));
        assert_eq!(conversation.stream(0x81).unwrap().in_progress(), 0);
        assert!(conversation.stream(0x01).is_none());
        assert_eq!(conversation.in_progress(), 1);

        let units = conversation.finish();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].endpoint, 0x02);
        assert_eq!(conversation.in_progress(), 0);
        assert!(!conversation.has_active_group());
    }

    #[test]
    fn test_highest_sequence_tracking() {
        let mut registry = Registry::new(DissectorConfig::default());
        let conversation = registry.get_or_create(ConversationId(1));
        assert!(!conversation.is_behind(0));
        conversation.store_frame(FrameInfo::bare(10, FrameClass::Ignored, false));
        assert!(conversation.is_behind(4));
        assert!(!conversation.is_behind(10));
        assert!(!conversation.is_behind(11));
    }

    #[test]
    fn test_stats_accumulate() {
        let mut registry = Registry::new(DissectorConfig::default());
        let conversation = registry.get_or_create(ConversationId(1));
        let mut info = FrameInfo::bare(1, FrameClass::Header, true);
        info.checksum_valid = Some(false);
        conversation.store_frame(info);
        conversation.store_frame(FrameInfo::bare(2, FrameClass::Control, false));

        let other = registry.get_or_create(ConversationId(2));
        other.store_frame(FrameInfo::bare(1, FrameClass::Continuation, false));

        let stats = registry.conversation(ConversationId(1)).unwrap().stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.header_packets, 1);
        assert_eq!(stats.control_packets, 1);
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(stats.truncated_packets, 1);

        let total = registry.total_stats();
        assert_eq!(total.packets, 3);
        assert_eq!(total.continuation_packets, 1);
        assert_eq!(total.total_units(), 0);
    }
}
