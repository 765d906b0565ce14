//! Bulk stream reassembly
//!
//! Recovers logical payloads from bulk packets that were split at arbitrary
//! byte boundaries. A header (Trigger 5) or selector (Trigger 6) opens a
//! fragment group; the packets that follow are appended to the lineage of the
//! group's stream until the group's byte count runs out. Trigger 6 sessions
//! interleave on one endpoint by alternating fragment groups, so each stream
//! keeps its own lineage. Ordering only holds within one endpoint, so every
//! stream endpoint of a conversation gets its own [`StreamState`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use trigger_dissect_lib::reassembly::StreamState;
//!
//! let mut state = StreamState::new(conversation, packet.endpoint_address());
//! for packet in bulk_packets {
//!     let step = state.process(classifier.as_ref(), packet.sequence, &packet.data, packet.reported_len);
//!     for unit in step.units {
//!         handle_unit(unit);
//!     }
//! }
//! for unit in state.finish() {
//!     // lineages still open when the capture ended
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::classifier::{FrameClassifier, ParsedHeader};
use crate::framing::GoverningRecord;
use crate::packet::ConversationId;

/// Identifies one reassembly stream within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKey {
    /// Trigger 5: the single stream of the conversation
    Implicit,
    /// Trigger 6: selector session number
    Session(u32),
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Implicit => write!(f, "stream"),
            Self::Session(n) => write!(f, "session {}", n),
        }
    }
}

/// How a reassembled unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Completeness {
    /// Every declared byte was captured
    Complete,
    /// The declared length was reached but some bytes were never captured
    Truncated,
    /// A new header/selector restarted the stream first
    Abandoned,
    /// The capture ended first
    CaptureEnded,
}

/// Classification of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameClass {
    /// Starts with a header/selector
    Header,
    /// Continues an open fragment group
    Continuation,
    /// Stream packet that is neither header nor continuation
    NotProtocol,
    /// Control transfer
    Control,
    /// Interrupt notification from the device
    Notification,
    /// Not on any endpoint the protocol uses
    Ignored,
}

/// A logical payload recovered from one or more packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledUnit {
    /// Conversation the unit was carried on
    pub conversation: ConversationId,
    /// Endpoint address, with the direction bit, the unit was carried on
    pub endpoint: u8,
    /// Stream within the endpoint
    pub key: StreamKey,
    /// Sequence number of the packet that opened the lineage
    pub origin_sequence: u64,
    /// Sequence number of the last packet that contributed
    pub closing_sequence: u64,
    /// Record that opened the lineage
    pub record: Arc<GoverningRecord>,
    /// Declared payload length
    pub declared_len: u64,
    /// Payload bytes accounted for by reported packet lengths
    pub accounted_len: u64,
    /// Captured payload bytes, in order
    pub data: Vec<u8>,
    /// How the unit ended
    pub status: Completeness,
    /// Some payload bytes were lost to the capture (snaplen or a missing prefix)
    pub truncated: bool,
}

impl ReassembledUnit {
    /// Whether the unit holds the whole declared payload
    pub fn is_complete(&self) -> bool {
        self.status == Completeness::Complete
    }
}

/// Result of feeding one stream packet to [`StreamState::process`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStep {
    /// Header, continuation, or not protocol traffic
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
    /// Units completed or abandoned by this packet
    pub units: Vec<ReassembledUnit>,
}

impl StreamStep {
    fn not_protocol() -> Self {
        Self {
            class: FrameClass::NotProtocol,
            key: None,
            record: None,
            fragment_remaining: 0,
            payload_remaining: 0,
            checksum_valid: None,
            units: Vec::new(),
        }
    }
}

/// Append-only buffer for one in-progress logical payload
#[derive(Debug)]
struct Lineage {
    record: Arc<GoverningRecord>,
    origin_sequence: u64,
    last_sequence: u64,
    declared_len: u64,
    consumed: u64,
    buffer: Vec<u8>,
    /// Capacity still to reserve once the lineage outlives its first packet
    size_hint: Option<usize>,
    truncated: bool,
}

impl Lineage {
    fn new(header: &ParsedHeader, sequence: u64, size_hint: usize) -> Self {
        Self {
            record: Arc::clone(&header.record),
            origin_sequence: sequence,
            last_sequence: sequence,
            declared_len: header.total_len(),
            consumed: 0,
            buffer: Vec::new(),
            size_hint: Some(size_hint),
            truncated: false,
        }
    }

    /// Reserve the full hint once a second packet feeds the lineage
    fn reserve_for(&mut self, sequence: u64) {
        if sequence == self.origin_sequence {
            return;
        }
        if let Some(hint) = self.size_hint.take() {
            self.buffer.reserve(hint.saturating_sub(self.buffer.len()));
        }
    }

    fn owed(&self) -> u64 {
        self.declared_len.saturating_sub(self.consumed)
    }

    fn is_done(&self) -> bool {
        self.consumed >= self.declared_len
    }

    /// Append up to the group's remaining count; returns the padding dropped
    fn take(&mut self, group_remaining: &mut u64, captured: &[u8], reported: u64) -> u64 {
        let take = reported.min(*group_remaining).min(self.owed());
        let captured_take = (captured.len() as u64).min(take) as usize;
        self.buffer.extend_from_slice(&captured[..captured_take]);
        if (captured_take as u64) < take {
            self.truncated = true;
        }
        self.consumed += take;
        *group_remaining -= take;
        reported - take
    }

    fn into_unit(
        self,
        conversation: ConversationId,
        endpoint: u8,
        key: StreamKey,
        closing_sequence: u64,
        status: Completeness,
    ) -> ReassembledUnit {
        ReassembledUnit {
            conversation,
            endpoint,
            key,
            origin_sequence: self.origin_sequence,
            closing_sequence,
            record: self.record,
            declared_len: self.declared_len,
            accounted_len: self.consumed,
            data: self.buffer,
            status,
            truncated: self.truncated,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveGroup {
    key: StreamKey,
    record: Arc<GoverningRecord>,
    remaining: u64,
}

/// Reassembly state of one bulk stream endpoint of a conversation
#[derive(Debug)]
pub struct StreamState {
    conversation: ConversationId,
    endpoint: u8,
    active: Option<ActiveGroup>,
    lineages: HashMap<StreamKey, Lineage>,
}

impl StreamState {
    /// Create empty state for one endpoint address of a conversation
    pub fn new(conversation: ConversationId, endpoint: u8) -> Self {
        Self {
            conversation,
            endpoint,
            active: None,
            lineages: HashMap::new(),
        }
    }

    /// Endpoint address the state reassembles
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Number of lineages awaiting more bytes
    pub fn in_progress(&self) -> usize {
        self.lineages.len()
    }

    /// Whether the next stream packet continues a fragment group
    pub fn has_active_group(&self) -> bool {
        self.active.is_some()
    }

    /// Bytes consumed and declared for a stream's open lineage
    pub fn progress(&self, key: StreamKey) -> Option<(u64, u64)> {
        self.lineages
            .get(&key)
            .map(|l| (l.consumed, l.declared_len))
    }

    /// Feed one stream packet
    ///
    /// `reported_len` is the length the bus reported; `data` may be shorter
    /// when the capture cut it off. Counters always advance by the reported
    /// length so framing stays aligned.
    pub fn process(
        &mut self,
        classifier: &dyn FrameClassifier,
        sequence: u64,
        data: &[u8],
        reported_len: usize,
    ) -> StreamStep {
        let reported_len = reported_len.max(data.len()) as u64;

        if let Some(group) = self.active.take() {
            if let Some(header) = classifier.try_parse_header(data) {
                if classifier.resyncs_on(&header) {
                    log::warn!(
                        "{} EP 0x{:02x}: header inside unfinished {} group at seq {}, resynchronising",
                        self.conversation,
                        self.endpoint,
                        group.key,
                        sequence
                    );
                    return self.open_group(classifier, header, sequence, data, reported_len);
                }
            }
            return self.settle(
                group,
                sequence,
                data,
                reported_len,
                FrameClass::Continuation,
                None,
                Vec::new(),
            );
        }

        match classifier.try_parse_header(data) {
            Some(header) => self.open_group(classifier, header, sequence, data, reported_len),
            None => {
                log::debug!(
                    "{}: seq {} is not a header and no group is open, ignoring",
                    self.conversation,
                    sequence
                );
                StreamStep::not_protocol()
            }
        }
    }

    fn open_group(
        &mut self,
        classifier: &dyn FrameClassifier,
        header: ParsedHeader,
        sequence: u64,
        data: &[u8],
        reported_len: u64,
    ) -> StreamStep {
        let conversation = self.conversation;
        let endpoint = self.endpoint;
        let key = header.key;
        let mut units = Vec::new();

        if header.checksum_valid == Some(false) {
            log::warn!(
                "{}: header checksum mismatch at seq {}",
                conversation,
                sequence
            );
        }

        let continues = match (self.lineages.get(&key), header.fragment_offset()) {
            (Some(lineage), Some(offset)) => lineage.consumed == offset,
            _ => false,
        };

        let fresh = || {
            let mut lineage = Lineage::new(&header, sequence, classifier.frame_size_hint(&header));
            if let Some(offset) = header.fragment_offset().filter(|&o| o > 0) {
                log::warn!(
                    "{}: {} fragment at offset {} without its prefix (seq {})",
                    conversation,
                    key,
                    offset,
                    sequence
                );
                lineage.consumed = offset.min(lineage.declared_len);
                lineage.truncated = true;
            }
            lineage
        };

        let lineage = match self.lineages.entry(key) {
            Entry::Occupied(entry) if continues => entry.into_mut(),
            Entry::Occupied(mut entry) => {
                let prior = entry.insert(fresh());
                log::warn!(
                    "{}: {} lineage from seq {} abandoned at {}/{} bytes",
                    conversation,
                    key,
                    prior.origin_sequence,
                    prior.consumed,
                    prior.declared_len
                );
                let closing = prior.last_sequence;
                units.push(prior.into_unit(conversation, endpoint, key, closing, Completeness::Abandoned));
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(fresh()),
        };

        let owed = lineage.owed();
        let group_len = match header.fragment_len() {
            Some(len) if len > 0 && len <= owed => len,
            _ => owed,
        };
        log::debug!(
            "{}: seq {} opens {} group of {} bytes ({} of {} owed)",
            conversation,
            sequence,
            key,
            group_len,
            owed,
            lineage.declared_len
        );

        let payload = data.get(header.header_len..).unwrap_or(&[]);
        let group = ActiveGroup {
            key,
            record: Arc::clone(&header.record),
            remaining: group_len,
        };
        self.settle(
            group,
            sequence,
            payload,
            reported_len.saturating_sub(header.header_len as u64),
            FrameClass::Header,
            header.checksum_valid,
            units,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &mut self,
        mut group: ActiveGroup,
        sequence: u64,
        captured: &[u8],
        reported: u64,
        class: FrameClass,
        checksum_valid: Option<bool>,
        mut units: Vec<ReassembledUnit>,
    ) -> StreamStep {
        let conversation = self.conversation;
        let endpoint = self.endpoint;
        let key = group.key;

        let Some(lineage) = self.lineages.get_mut(&key) else {
            log::warn!(
                "{}: open group for {} has no lineage, dropping seq {}",
                conversation,
                key,
                sequence
            );
            return StreamStep::not_protocol();
        };

        lineage.last_sequence = sequence;
        lineage.reserve_for(sequence);
        let padding = lineage.take(&mut group.remaining, captured, reported);
        if padding > 0 {
            log::debug!(
                "{}: dropping {} padding bytes after {} group at seq {}",
                conversation,
                padding,
                key,
                sequence
            );
        }
        let payload_remaining = lineage.owed();

        if lineage.is_done() {
            if let Some(done) = self.lineages.remove(&key) {
                let status = if done.truncated {
                    log::warn!(
                        "{}: {} unit from seq {} truncated ({} of {} bytes captured)",
                        conversation,
                        key,
                        done.origin_sequence,
                        done.buffer.len(),
                        done.declared_len
                    );
                    Completeness::Truncated
                } else {
                    log::debug!(
                        "{}: {} unit complete, {} bytes (seq {}..={})",
                        conversation,
                        key,
                        done.declared_len,
                        done.origin_sequence,
                        sequence
                    );
                    Completeness::Complete
                };
                units.push(done.into_unit(conversation, endpoint, key, sequence, status));
            }
        }

        let fragment_remaining = group.remaining;
        let record = Arc::clone(&group.record);
        if group.remaining > 0 {
            self.active = Some(group);
        }

        StreamStep {
            class,
            key: Some(key),
            record: Some(record),
            fragment_remaining,
            payload_remaining,
            checksum_valid,
            units,
        }
    }

    /// Close every open lineage at end of capture
    pub fn finish(&mut self) -> Vec<ReassembledUnit> {
        self.active = None;
        let conversation = self.conversation;
        let endpoint = self.endpoint;
        let mut units: Vec<ReassembledUnit> = self
            .lineages
            .drain()
            .map(|(key, lineage)| {
                let closing = lineage.last_sequence;
                lineage.into_unit(conversation, endpoint, key, closing, Completeness::CaptureEnded)
            })
            .collect();
        units.sort_by_key(|u| u.origin_sequence);
        units
    }
}
