//! Packet-at-a-time entry point
//!
//! [`Dissector`] takes transaction records in wire order, routes each to its
//! conversation, and returns the [`FrameInfo`] computed for it. Units
//! finished by a packet are delivered to a [`UnitSink`] exactly once, on the
//! forward pass. Feeding a packet again returns the cached result.

use std::sync::Arc;

use crate::config::DissectorConfig;
use crate::control::decode_control;
use crate::packet::{ConversationId, ProtocolVariant, TransferType, UsbPacket};
use crate::reassembly::{FrameClass, ReassembledUnit};
use crate::registry::{ConversationStats, FrameInfo, Registry};
use crate::sink::{NullSink, UnitSink};

/// Reassembly engine for a whole capture
#[derive(Debug)]
pub struct Dissector {
    registry: Registry,
}

impl Dissector {
    /// Create a dissector with the given configuration
    pub fn new(config: DissectorConfig) -> Self {
        log::debug!(
            "Dissector created: default variant {}, T6 platform {:?}",
            config.variant,
            config.t6_platform
        );
        Self {
            registry: Registry::new(config),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &DissectorConfig {
        self.registry.config()
    }

    /// Conversation registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Select the protocol of a conversation from the adapter's USB IDs
    ///
    /// Returns the variant chosen, or `None` when the IDs are not an MCT
    /// adapter and the configured default stays in effect.
    pub fn identify_device(
        &mut self,
        conversation: ConversationId,
        vendor_id: u16,
        product_id: u16,
    ) -> Option<ProtocolVariant> {
        let variant = ProtocolVariant::from_usb_ids(vendor_id, product_id);
        match variant {
            Some(variant) => {
                log::info!(
                    "{}: {:04x}:{:04x} identified as {}",
                    conversation,
                    vendor_id,
                    product_id,
                    variant
                );
                self.set_variant(conversation, variant);
            }
            None => log::debug!(
                "{}: {:04x}:{:04x} is not a known adapter",
                conversation,
                vendor_id,
                product_id
            ),
        }
        variant
    }

    /// Force the protocol of a conversation before its first packet
    pub fn set_variant(&mut self, conversation: ConversationId, variant: ProtocolVariant) {
        self.registry.get_or_create_with_variant(conversation, variant);
    }

    /// Process one packet, discarding any finished units
    pub fn process(&mut self, packet: &UsbPacket) -> Arc<FrameInfo> {
        self.process_with(packet, &mut NullSink)
    }

    /// Process one packet, delivering finished units to `sink`
    pub fn process_with(&mut self, packet: &UsbPacket, sink: &mut dyn UnitSink) -> Arc<FrameInfo> {
        let platform = self.registry.config().t6_platform;
        let conversation = self.registry.get_or_create(packet.conversation);

        if let Some(cached) = conversation.frame(packet.sequence) {
            log::trace!("{} seq {}: cached", packet.conversation, packet.sequence);
            return cached;
        }

        if conversation.is_behind(packet.sequence) {
            log::warn!(
                "{} seq {}: arrived after a later packet, processing out of order",
                packet.conversation,
                packet.sequence
            );
        }

        let truncated = packet.is_truncated();
        let carries_stream = conversation.classifier().carries_stream(packet);
        let is_notification = conversation.classifier().is_notification(packet);

        let info = if packet.transfer_type == TransferType::Control {
            match decode_control(conversation.variant(), packet, platform) {
                Some(content) => FrameInfo {
                    control: Some(content),
                    ..FrameInfo::bare(packet.sequence, FrameClass::Control, truncated)
                },
                None => FrameInfo::bare(packet.sequence, FrameClass::Ignored, truncated),
            }
        } else if carries_stream {
            let step = conversation.process_stream(packet);
            FrameInfo {
                sequence: packet.sequence,
                class: step.class,
                key: step.key,
                record: step.record,
                fragment_remaining: step.fragment_remaining,
                payload_remaining: step.payload_remaining,
                checksum_valid: step.checksum_valid,
                truncated,
                units: step.units.into_iter().map(Arc::new).collect(),
                control: None,
            }
        } else if is_notification {
            FrameInfo::bare(packet.sequence, FrameClass::Notification, truncated)
        } else {
            FrameInfo::bare(packet.sequence, FrameClass::Ignored, truncated)
        };

        let info = conversation.store_frame(info);
        for unit in &info.units {
            log_unit(unit);
            sink.deliver(Arc::clone(unit));
        }
        info
    }

    /// Cached result for a packet already processed
    pub fn lookup_frame(&self, conversation: ConversationId, sequence: u64) -> Option<Arc<FrameInfo>> {
        self.registry.lookup_frame(conversation, sequence)
    }

    /// End the capture, returning every lineage still awaiting bytes
    pub fn finish(&mut self) -> Vec<Arc<ReassembledUnit>> {
        let mut units = Vec::new();
        self.finish_with(&mut units);
        units
    }

    /// End the capture, delivering every open lineage to `sink`
    ///
    /// Units are ordered by conversation, then by the sequence number of the
    /// packet that opened them.
    pub fn finish_with(&mut self, sink: &mut dyn UnitSink) {
        let mut units: Vec<ReassembledUnit> = self
            .registry
            .conversations_mut()
            .flat_map(|conversation| conversation.finish())
            .collect();
        units.sort_by_key(|unit| (unit.conversation, unit.origin_sequence));

        for unit in units {
            let unit = Arc::new(unit);
            log_unit(&unit);
            sink.deliver(unit);
        }
    }

    /// Counters summed over all conversations
    pub fn stats(&self) -> ConversationStats {
        self.registry.total_stats()
    }
}

impl Default for Dissector {
    fn default() -> Self {
        Self::new(DissectorConfig::default())
    }
}

fn log_unit(unit: &ReassembledUnit) {
    log::info!(
        "{} EP 0x{:02x} {}: unit from seq {} to {}, {} of {} bytes captured, {:?}",
        unit.conversation,
        unit.endpoint,
        unit.key,
        unit.origin_sequence,
        unit.closing_sequence,
        unit.data.len(),
        unit.declared_len,
        unit.status
    );
}
