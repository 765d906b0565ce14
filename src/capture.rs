//! USB transaction capture for offline dissection and replay testing.
//!
//! Records the packet stream handed to the dissector, together with its
//! transport metadata, so a session can be replayed later without the
//! adapter attached.
//!
//! # File Format
//!
//! - `capture_<id>.bin`: sequence of little-endian records
//!   ```text
//!   u32  conversation
//!   u64  sequence
//!   u8   transfer type (0 control, 2 bulk, 3 interrupt)
//!   u8   endpoint address (bit7 set for IN)
//!   u8   flags (bit0 set for a control setup stage)
//!   [8]  setup packet (zero for non-control transfers)
//!   u32  reported length
//!   u32  captured length
//!   [..] captured bytes
//!   ```
//! - `metadata_<id>.json`: device and capture information
//!
//! # Example
//!
//! ```ignore
//! let capture = CaptureState::new();
//! capture.start_capture(CaptureMetadata {
//!     vendor_id: 0x0711,
//!     product_id: 0x5601,
//!     ..Default::default()
//! })?;
//!
//! // For every transaction handed to the dissector:
//! capture.record_packet(&packet);
//!
//! // When done:
//! let result = capture.stop_capture(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

use crate::packet::{ConversationId, Direction, ProtocolVariant, SetupFields, TransferType, UsbPacket};

/// Size of the fixed part of a capture record
pub const RECORD_HEADER_LEN: usize = 31;

const FLAG_SETUP_STAGE: u8 = 0x01;

/// A capture record that could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid capture record at byte {offset}: {reason}")]
pub struct RecordError {
    /// Byte offset of the record within the file.
    pub offset: u64,
    /// What was wrong with it.
    pub reason: &'static str,
}

/// Errors that can occur during packet capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// Capture file holds a malformed record.
    #[error(transparent)]
    InvalidRecord(#[from] RecordError),
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session and device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// USB vendor ID of the adapter.
    pub vendor_id: u16,
    /// USB product ID of the adapter.
    pub product_id: u16,
    /// Protocol variant, when known.
    #[serde(default)]
    pub variant: Option<ProtocolVariant>,
    /// Total number of packets captured.
    #[serde(default)]
    pub total_packets: u64,
    /// Total captured bytes.
    #[serde(default)]
    pub total_bytes: u64,
    /// Reassembled units observed while capturing.
    #[serde(default)]
    pub total_units: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

impl CaptureMetadata {
    /// Protocol variant from the explicit field or the USB IDs.
    pub fn resolved_variant(&self) -> Option<ProtocolVariant> {
        self.variant
            .or_else(|| ProtocolVariant::from_usb_ids(self.vendor_id, self.product_id))
    }
}

/// Result returned when capture stops successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved capture file.
    pub capture_path: String,
    /// Path to the saved metadata file.
    pub metadata_path: String,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// Thread-safe state for recording USB transactions.
///
/// The recorder may be shared with the thread feeding the dissector; all
/// methods take `&self`.
pub struct CaptureState {
    /// Whether capture is currently active.
    is_capturing: AtomicBool,
    /// Recorded packets, in arrival order.
    packets: Mutex<Vec<UsbPacket>>,
    /// When the capture started.
    start_time: Mutex<Option<Instant>>,
    /// Metadata about the capture session.
    metadata: Mutex<CaptureMetadata>,
    /// Packet counter (lock-free fast path).
    packet_count: AtomicU64,
    /// Byte counter (lock-free fast path).
    byte_count: AtomicU64,
}

impl CaptureState {
    /// Creates a new capture state with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            packets: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Returns the current packet count.
    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    /// Returns the current captured byte count.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture session.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    /// Returns `CaptureError::LockError` if an internal mutex is poisoned.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        self.packets
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clear();

        self.packet_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);

        *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = Some(Instant::now());

        *self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = metadata;

        log::info!("Packet capture started");
        Ok(())
    }

    /// Records a packet during capture.
    ///
    /// Ignored when no capture is active.
    pub fn record_packet(&self, packet: &UsbPacket) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(packet.data.len() as u64, Ordering::Relaxed);

        if let Ok(mut packets) = self.packets.lock() {
            packets.push(packet.clone());
        } else {
            log::warn!("Failed to acquire lock for packet recording");
        }
    }

    /// Counts a reassembled unit in the metadata.
    pub fn record_unit(&self) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        if let Ok(mut meta) = self.metadata.lock() {
            meta.total_units += 1;
        }
    }

    /// Stops the capture and saves it to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` if file operations fail.
    /// Returns `CaptureError::Json` if metadata serialization fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.exists() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let duration_ms = self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let total_packets = self.packet_count.load(Ordering::Acquire);
        let total_bytes = self.byte_count.load(Ordering::Acquire);

        let metadata = {
            let mut meta = self
                .metadata
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            meta.duration_ms = duration_ms;
            meta.total_packets = total_packets;
            meta.total_bytes = total_bytes;
            meta.clone()
        };

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let capture_path = output_dir.join(format!("capture_{}.bin", timestamp));
        {
            let packets = self
                .packets
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            write_packets(&capture_path, &packets)?;
        }

        let metadata_path = output_dir.join(format!("metadata_{}.json", timestamp));
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Capture stopped: {} packets, {} bytes, {} ms",
            total_packets,
            total_bytes,
            duration_ms
        );

        Ok(CaptureResult {
            capture_path: capture_path.display().to_string(),
            metadata_path: metadata_path.display().to_string(),
            metadata,
        })
    }

    /// Cancels the current capture without saving.
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        if let Ok(mut packets) = self.packets.lock() {
            packets.clear();
        }
        log::info!("Capture cancelled");
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize one packet as a capture record.
pub fn encode_record(packet: &UsbPacket, out: &mut Vec<u8>) {
    let flags = if packet.is_setup { FLAG_SETUP_STAGE } else { 0 };
    let setup = packet.setup.unwrap_or_default().to_bytes();
    let reported = packet.reported_len.max(packet.data.len()) as u32;

    out.reserve(RECORD_HEADER_LEN + packet.data.len());
    out.extend_from_slice(&packet.conversation.0.to_le_bytes());
    out.extend_from_slice(&packet.sequence.to_le_bytes());
    out.push(packet.transfer_type.to_byte());
    out.push(packet.endpoint_address());
    out.push(flags);
    out.extend_from_slice(&setup);
    out.extend_from_slice(&reported.to_le_bytes());
    out.extend_from_slice(&(packet.data.len() as u32).to_le_bytes());
    out.extend_from_slice(&packet.data);
}

/// Decode every record in a capture buffer.
///
/// # Errors
///
/// Returns a `RecordError` naming the offset of the first malformed record.
pub fn decode_records(bytes: &[u8]) -> std::result::Result<Vec<UsbPacket>, RecordError> {
    let mut packets = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let invalid = |reason| RecordError {
            offset: offset as u64,
            reason,
        };

        let header = bytes
            .get(offset..offset + RECORD_HEADER_LEN)
            .ok_or_else(|| invalid("truncated record header"))?;

        let conversation = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&header[4..12]);
        let sequence = u64::from_le_bytes(seq);
        let transfer_type =
            TransferType::from_byte(header[12]).ok_or_else(|| invalid("unknown transfer type"))?;
        let endpoint_address = header[13];
        let flags = header[14];
        let mut setup_bytes = [0u8; 8];
        setup_bytes.copy_from_slice(&header[15..23]);
        let reported_len = u32::from_le_bytes([header[23], header[24], header[25], header[26]]);
        let captured_len = u32::from_le_bytes([header[27], header[28], header[29], header[30]]);

        if captured_len > reported_len {
            return Err(invalid("captured length exceeds reported length"));
        }

        let data_start = offset + RECORD_HEADER_LEN;
        let data_end = data_start + captured_len as usize;
        let data = bytes
            .get(data_start..data_end)
            .ok_or_else(|| invalid("record extends past end of capture"))?;

        let direction = if endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        let setup = (transfer_type == TransferType::Control)
            .then(|| SetupFields::from_bytes(setup_bytes));

        packets.push(UsbPacket {
            conversation: ConversationId(conversation),
            sequence,
            transfer_type,
            direction,
            endpoint: endpoint_address & 0x7F,
            setup,
            is_setup: flags & FLAG_SETUP_STAGE != 0,
            reported_len: reported_len as usize,
            data: data.to_vec(),
        });

        offset = data_end;
    }

    Ok(packets)
}

/// Writes packets to a capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if file operations fail.
pub fn write_packets(path: &Path, packets: &[UsbPacket]) -> Result<()> {
    let mut buffer = Vec::new();
    for packet in packets {
        encode_record(packet, &mut buffer);
    }

    let mut file = std::fs::File::create(path)?;
    file.write_all(&buffer)?;
    file.flush()?;
    log::debug!("Saved {} packets to {}", packets.len(), path.display());
    Ok(())
}

/// Writes capture metadata to a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be written.
/// Returns `CaptureError::Json` if serialization fails.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Reads packets from a capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::InvalidRecord` if a record is malformed.
pub fn read_packets(path: &Path) -> Result<Vec<UsbPacket>> {
    let bytes = std::fs::read(path)?;
    Ok(decode_records(&bytes)?)
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn sample_packets() -> Vec<UsbPacket> {
        let setup = SetupFields::vendor(Direction::Out, 0x12, 0, 0, 4);
        vec![
            UsbPacket::control_setup(ConversationId(1), 0, setup, vec![1, 2, 3, 4]),
            UsbPacket::bulk(ConversationId(1), 1, Direction::Out, 2, vec![0xAA; 40])
                .with_reported_len(512),
            UsbPacket::interrupt(ConversationId(2), 0, Direction::In, 3, vec![0x01]),
        ]
    }

    #[test]
    fn test_capture_state_new() {
        let state = CaptureState::new();
        assert!(!state.is_capturing());
        assert_eq!(state.packet_count(), 0);
        assert_eq!(state.byte_count(), 0);
    }

    #[test]
    fn test_start_capture_already_active() {
        let state = CaptureState::new();
        state.start_capture(CaptureMetadata::default()).unwrap();
        assert!(state.is_capturing());
        assert!(matches!(
            state.start_capture(CaptureMetadata::default()),
            Err(CaptureError::AlreadyActive)
        ));
    }

    #[test]
    fn test_record_packet_when_not_capturing() {
        let state = CaptureState::new();
        state.record_packet(&sample_packets()[0]);
        state.record_unit();
        assert_eq!(state.packet_count(), 0);
    }

    #[test]
    fn test_cancel_capture() {
        let state = CaptureState::new();
        state.start_capture(CaptureMetadata::default()).unwrap();
        state.record_packet(&sample_packets()[1]);
        state.cancel_capture();
        assert!(!state.is_capturing());

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            state.stop_capture(dir.path()),
            Err(CaptureError::NotActive)
        ));
    }

    #[test]
    fn test_stop_capture_missing_directory() {
        let state = CaptureState::new();
        state.start_capture(CaptureMetadata::default()).unwrap();
        let result = state.stop_capture(Path::new("/nonexistent/trigger-dissect"));
        assert!(matches!(result, Err(CaptureError::DirectoryNotFound(_))));
    }

    #[test]
    fn test_concurrent_packet_recording() {
        let state = Arc::new(CaptureState::new());
        state.start_capture(CaptureMetadata::default()).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for i in 0..50 {
                        let packet = UsbPacket::bulk(
                            ConversationId(t),
                            i,
                            Direction::Out,
                            2,
                            vec![0u8; 10],
                        );
                        state.record_packet(&packet);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(state.packet_count(), 200);
        assert_eq!(state.byte_count(), 2000);
    }

    #[test]
    fn test_record_round_trip() {
        let packets = sample_packets();
        let mut buffer = Vec::new();
        for packet in &packets {
            encode_record(packet, &mut buffer);
        }
        assert_eq!(
            buffer.len(),
            3 * RECORD_HEADER_LEN + 4 + 40 + 1
        );

        let decoded = decode_records(&buffer).unwrap();
        assert_eq!(decoded, packets);
        assert!(decoded[1].is_truncated());
        assert_eq!(decoded[0].setup.unwrap().request, 0x12);
        assert!(decoded[0].is_setup);
        assert_eq!(decoded[2].setup, None);
    }

    #[test]
    fn test_decode_rejects_malformed_records() {
        let mut buffer = Vec::new();
        encode_record(&sample_packets()[1], &mut buffer);
        let first_len = buffer.len();
        encode_record(&sample_packets()[2], &mut buffer);

        let err = decode_records(&buffer[..buffer.len() - 1]).unwrap_err();
        assert_eq!(err.offset, first_len as u64);
        assert_eq!(err.reason, "record extends past end of capture");

        let err = decode_records(&buffer[..10]).unwrap_err();
        assert_eq!(err.offset, 0);
        assert_eq!(err.reason, "truncated record header");

        let mut bad_type = buffer.clone();
        bad_type[12] = 1;
        assert_eq!(
            decode_records(&bad_type).unwrap_err().reason,
            "unknown transfer type"
        );

        let mut oversized = buffer;
        // captured length larger than reported length
        oversized[27..31].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(
            decode_records(&oversized).unwrap_err().reason,
            "captured length exceeds reported length"
        );
    }

    #[test]
    fn test_full_capture_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let state = CaptureState::new();
        state
            .start_capture(CaptureMetadata {
                vendor_id: 0x0711,
                product_id: 0x5601,
                description: "workflow".to_string(),
                ..Default::default()
            })
            .unwrap();

        for packet in sample_packets() {
            state.record_packet(&packet);
        }
        state.record_unit();

        let result = state.stop_capture(dir.path()).unwrap();
        assert!(!state.is_capturing());
        assert_eq!(result.metadata.total_packets, 3);
        assert_eq!(result.metadata.total_bytes, 45);
        assert_eq!(result.metadata.total_units, 1);
        assert!(result.capture_path.contains("capture_"));

        let packets = read_packets(Path::new(&result.capture_path)).unwrap();
        assert_eq!(packets, sample_packets());

        let metadata = read_metadata(Path::new(&result.metadata_path)).unwrap();
        assert_eq!(metadata, result.metadata);
        assert_eq!(
            metadata.resolved_variant(),
            Some(ProtocolVariant::Trigger6)
        );
    }
}
