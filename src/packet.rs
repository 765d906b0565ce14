//! USB transaction records handed to the dissector
//!
//! Packets arrive already demultiplexed by an external USB transaction
//! source. Each record carries the captured bytes (possibly cut short by
//! the capture snaplen) plus the length the bus actually reported.

use serde::{Deserialize, Serialize};
use std::fmt;

/// MCT vendor ID
pub const MCT_USB_VID: u16 = 0x0711;
/// Insignia vendor ID used by rebadged Trigger 6 adapters
pub const INSIGNIA_USB_VID: u16 = 0x19FF;

const T5_PID_RANGE: std::ops::RangeInclusive<u16> = 0x5800..=0x581F;
const T6_PID_RANGE: std::ops::RangeInclusive<u16> = 0x5600..=0x561F;

/// Protocol generation spoken by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// Trigger 5: checksummed bulk header, one stream per conversation
    Trigger5,
    /// Trigger 6: selector-multiplexed sessions
    #[default]
    Trigger6,
}

impl ProtocolVariant {
    /// Identify the protocol from the device's USB IDs
    pub fn from_usb_ids(vendor_id: u16, product_id: u16) -> Option<Self> {
        match vendor_id {
            MCT_USB_VID if T5_PID_RANGE.contains(&product_id) => Some(Self::Trigger5),
            MCT_USB_VID | INSIGNIA_USB_VID if T6_PID_RANGE.contains(&product_id) => {
                Some(Self::Trigger6)
            }
            _ => None,
        }
    }

    /// Parse a variant name ("t5", "trigger5", "t6", "trigger6")
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "t5" | "trigger5" => Some(Self::Trigger5),
            "t6" | "trigger6" => Some(Self::Trigger6),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trigger5 => write!(f, "Trigger 5"),
            Self::Trigger6 => write!(f, "Trigger 6"),
        }
    }
}

/// Capture-lifetime identifier of a pair of communicating endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub u32);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conv#{}", self.0)
    }
}

/// USB transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    /// Control transfer
    Control,
    /// Bulk transfer
    Bulk,
    /// Interrupt transfer
    Interrupt,
}

impl TransferType {
    /// Decode the USB endpoint-attribute encoding (isochronous is unsupported)
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Control),
            2 => Some(Self::Bulk),
            3 => Some(Self::Interrupt),
            _ => None,
        }
    }

    /// USB endpoint-attribute encoding
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }
}

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Standard USB setup packet fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetupFields {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupFields {
    /// Vendor request with the given direction
    pub fn vendor(direction: Direction, request: u8, value: u16, index: u16, length: u16) -> Self {
        let dir_bit = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        Self {
            request_type: dir_bit | (2 << 5),
            request,
            value,
            index,
            length,
        }
    }

    /// Whether bmRequestType selects a vendor request
    pub fn is_vendor(&self) -> bool {
        (self.request_type >> 5) & 0x3 == 2
    }

    /// Serialize as the 8-byte setup packet
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    /// Parse the 8-byte setup packet
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// One physical packet with its transport metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbPacket {
    /// Conversation this packet belongs to
    pub conversation: ConversationId,
    /// Per-conversation sequence number, increasing in wire order
    pub sequence: u64,
    /// Transfer type
    pub transfer_type: TransferType,
    /// Direction
    pub direction: Direction,
    /// Endpoint number without the direction bit
    pub endpoint: u8,
    /// Setup fields of the control transfer this packet belongs to
    pub setup: Option<SetupFields>,
    /// For control transfers, whether this is the setup stage rather than the completion
    pub is_setup: bool,
    /// Length reported by the bus
    pub reported_len: usize,
    /// Captured bytes, never longer than `reported_len`
    pub data: Vec<u8>,
}

impl UsbPacket {
    /// Bulk packet whose captured length equals its reported length
    pub fn bulk(
        conversation: ConversationId,
        sequence: u64,
        direction: Direction,
        endpoint: u8,
        data: Vec<u8>,
    ) -> Self {
        Self {
            conversation,
            sequence,
            transfer_type: TransferType::Bulk,
            direction,
            endpoint,
            setup: None,
            is_setup: false,
            reported_len: data.len(),
            data,
        }
    }

    /// Interrupt packet
    pub fn interrupt(
        conversation: ConversationId,
        sequence: u64,
        direction: Direction,
        endpoint: u8,
        data: Vec<u8>,
    ) -> Self {
        Self {
            transfer_type: TransferType::Interrupt,
            ..Self::bulk(conversation, sequence, direction, endpoint, data)
        }
    }

    /// Control setup stage; `data` is the OUT data stage, if any
    pub fn control_setup(
        conversation: ConversationId,
        sequence: u64,
        setup: SetupFields,
        data: Vec<u8>,
    ) -> Self {
        let direction = if setup.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        Self {
            transfer_type: TransferType::Control,
            setup: Some(setup),
            is_setup: true,
            ..Self::bulk(conversation, sequence, direction, 0, data)
        }
    }

    /// Control completion; `data` is the IN data stage, if any
    pub fn control_completion(
        conversation: ConversationId,
        sequence: u64,
        setup: SetupFields,
        data: Vec<u8>,
    ) -> Self {
        Self {
            is_setup: false,
            ..Self::control_setup(conversation, sequence, setup, data)
        }
    }

    /// Override the reported length (capture truncated the data)
    pub fn with_reported_len(mut self, reported_len: usize) -> Self {
        self.reported_len = reported_len.max(self.data.len());
        self
    }

    /// Whether the capture holds fewer bytes than the bus reported
    pub fn is_truncated(&self) -> bool {
        self.data.len() < self.reported_len
    }

    /// Endpoint address with the direction bit
    pub fn endpoint_address(&self) -> u8 {
        match self.direction {
            Direction::In => self.endpoint | 0x80,
            Direction::Out => self.endpoint & 0x7F,
        }
    }
}
