//! Capture replay through the dissector.
//!
//! Loads a recorded transaction stream (see [`crate::capture`]) and feeds it
//! to a fresh [`Dissector`], either synchronously, lazily as an iterator, or
//! on a background thread that hands reassembled units over a channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use trigger_dissect_lib::replay::PacketReplay;
//!
//! let mut replay = PacketReplay::load(Path::new("capture_12345.bin"))?;
//!
//! // Start replay and receive units via channel
//! let receiver = replay.start()?;
//!
//! while let Ok(unit) = receiver.recv() {
//!     inspect(&unit);
//! }
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::capture::{decode_records, read_metadata, CaptureMetadata, RecordError};
use crate::config::DissectorConfig;
use crate::dissector::Dissector;
use crate::packet::UsbPacket;
use crate::reassembly::ReassembledUnit;

/// Errors that can occur during packet replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// File not found or cannot be opened.
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    /// Corrupted record in the capture file.
    #[error(transparent)]
    InvalidRecord(#[from] RecordError),

    /// Metadata file exists but could not be read.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Replay is already running.
    #[error("replay is already running")]
    AlreadyRunning,

    /// Replay is not running.
    #[error("replay is not running")]
    NotRunning,
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for packet replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// Dissector settings; the variant is replaced by the one the metadata identifies.
    pub dissector: DissectorConfig,
    /// Delay between packets on the background thread (zero = as fast as possible).
    pub packet_interval: Duration,
    /// Restart from the first packet, with a fresh dissector, when reaching the end.
    pub loop_playback: bool,
}

/// Replays a recorded capture through a dissector.
pub struct PacketReplay {
    /// Loaded packets ready for replay.
    packets: Vec<UsbPacket>,
    /// Optional metadata from the capture session.
    metadata: Option<CaptureMetadata>,
    /// Replay configuration.
    config: ReplayConfig,
    /// Handle to the replay thread (if running).
    thread_handle: Option<JoinHandle<()>>,
    /// Sender to stop the replay.
    stop_sender: Option<Sender<()>>,
}

impl PacketReplay {
    /// Load a capture file and its companion metadata.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::FileOpen` if the file cannot be read.
    /// Returns `ReplayError::InvalidRecord` if the file holds a malformed record.
    /// Returns `ReplayError::Metadata` if a metadata file exists but is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_config(path, ReplayConfig::default())
    }

    /// Load a capture file with a custom configuration.
    ///
    /// # Errors
    ///
    /// Same as [`PacketReplay::load`].
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let packets = read_capture(path)?;
        let metadata = find_metadata(path)?;

        log::info!("Loaded {} packets from {}", packets.len(), path.display());
        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: {:04x}:{:04x}, {} packets, {} units, {} ms",
                meta.vendor_id,
                meta.product_id,
                meta.total_packets,
                meta.total_units,
                meta.duration_ms
            );
        }

        Ok(Self {
            packets,
            metadata,
            config,
            thread_handle: None,
            stop_sender: None,
        })
    }

    /// Get the loaded metadata, if available.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Get the number of loaded packets.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Loaded packets in capture order.
    #[must_use]
    pub fn packets(&self) -> &[UsbPacket] {
        &self.packets
    }

    /// Set the replay configuration.
    pub fn set_config(&mut self, config: ReplayConfig) {
        self.config = config;
    }

    /// Check if replay is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Dissector configured for this capture.
    #[must_use]
    pub fn create_dissector(&self) -> Dissector {
        create_dissector(&self.config, self.metadata.as_ref())
    }

    /// Replay every packet on the calling thread.
    ///
    /// Returns the dissector, for its frame cache and counters, together
    /// with every unit delivered, including those closed at end of capture.
    pub fn replay_sync(&self) -> (Dissector, Vec<Arc<ReassembledUnit>>) {
        let mut dissector = self.create_dissector();
        let mut units: Vec<Arc<ReassembledUnit>> = Vec::new();
        for packet in &self.packets {
            dissector.process_with(packet, &mut units);
        }
        dissector.finish_with(&mut units);
        (dissector, units)
    }

    /// Start replaying packets in a background thread.
    ///
    /// Returns a receiver that yields reassembled units.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::AlreadyRunning` if replay is already in progress.
    pub fn start(&mut self) -> Result<Receiver<Arc<ReassembledUnit>>> {
        if self.is_running() {
            return Err(ReplayError::AlreadyRunning);
        }

        let (unit_tx, unit_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let packets = self.packets.clone();
        let config = self.config.clone();
        let metadata = self.metadata.clone();

        let handle = thread::spawn(move || {
            replay_thread(packets, config, metadata, unit_tx, stop_rx);
        });

        self.thread_handle = Some(handle);
        self.stop_sender = Some(stop_tx);

        log::info!("Packet replay started");
        Ok(unit_rx)
    }

    /// Stop the replay thread.
    ///
    /// Blocks until the thread has finished.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotRunning` if replay is not in progress.
    pub fn stop(&mut self) -> Result<()> {
        let stop_tx = self.stop_sender.take().ok_or(ReplayError::NotRunning)?;
        let handle = self.thread_handle.take().ok_or(ReplayError::NotRunning)?;

        // The thread may already have exited
        let _ = stop_tx.send(());
        handle.join().map_err(|_| ReplayError::NotRunning)?;

        log::info!("Packet replay stopped");
        Ok(())
    }
}

impl Drop for PacketReplay {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn read_capture(path: &Path) -> Result<Vec<UsbPacket>> {
    let bytes = std::fs::read(path)?;
    Ok(decode_records(&bytes)?)
}

/// Companion metadata: `<name>.json`, then `metadata_<id>.json` for `capture_<id>.bin`
fn metadata_candidates(path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![path.with_extension("json")];
    if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
        if let Some(id) = file_name.strip_prefix("capture_") {
            let stem = id.strip_suffix(".bin").unwrap_or(id);
            candidates.push(path.with_file_name(format!("metadata_{}.json", stem)));
        }
    }
    candidates
}

fn find_metadata(path: &Path) -> Result<Option<CaptureMetadata>> {
    for candidate in metadata_candidates(path) {
        if candidate.exists() {
            let metadata = read_metadata(&candidate)
                .map_err(|e| ReplayError::Metadata(format!("{}: {}", candidate.display(), e)))?;
            log::debug!("Using metadata from {}", candidate.display());
            return Ok(Some(metadata));
        }
    }
    Ok(None)
}

fn create_dissector(config: &ReplayConfig, metadata: Option<&CaptureMetadata>) -> Dissector {
    let mut dissector_config = config.dissector.clone();
    if let Some(variant) = metadata.and_then(CaptureMetadata::resolved_variant) {
        dissector_config.variant = variant;
    }
    Dissector::new(dissector_config)
}

/// Send units to the receiver; false once it has gone away
fn forward(units: &mut Vec<Arc<ReassembledUnit>>, unit_tx: &Sender<Arc<ReassembledUnit>>) -> bool {
    for unit in units.drain(..) {
        if unit_tx.send(unit).is_err() {
            log::debug!("Unit receiver dropped, stopping replay");
            return false;
        }
    }
    true
}

fn replay_thread(
    packets: Vec<UsbPacket>,
    config: ReplayConfig,
    metadata: Option<CaptureMetadata>,
    unit_tx: Sender<Arc<ReassembledUnit>>,
    stop_rx: Receiver<()>,
) {
    let mut units: Vec<Arc<ReassembledUnit>> = Vec::new();

    loop {
        let mut dissector = create_dissector(&config, metadata.as_ref());

        for packet in &packets {
            if stop_rx.try_recv().is_ok() {
                log::debug!("Replay thread received stop signal");
                return;
            }

            if !config.packet_interval.is_zero() {
                thread::sleep(config.packet_interval);
            }

            dissector.process_with(packet, &mut units);
            if !forward(&mut units, &unit_tx) {
                return;
            }
        }

        dissector.finish_with(&mut units);
        if !forward(&mut units, &unit_tx) {
            return;
        }

        if config.loop_playback {
            log::debug!("Replay loop completed, restarting");
        } else {
            log::debug!("Replay completed");
            break;
        }
    }
}

/// Synchronous replay of a capture file.
///
/// Returns every unit delivered, including lineages still open when the
/// capture ended.
///
/// # Errors
///
/// Returns `ReplayError` if the file cannot be loaded or contains invalid data.
pub fn replay_all_units(path: &Path) -> Result<Vec<Arc<ReassembledUnit>>> {
    let replay = PacketReplay::load(path)?;
    let (_, units) = replay.replay_sync();
    Ok(units)
}

/// Lazily replays a capture, yielding units as packets finish them.
pub struct UnitIterator {
    packets: std::vec::IntoIter<UsbPacket>,
    dissector: Dissector,
    pending: VecDeque<Arc<ReassembledUnit>>,
    finished: bool,
}

impl UnitIterator {
    /// Create a new unit iterator from a capture file.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_config(path, ReplayConfig::default())
    }

    /// Create with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or contains invalid records.
    pub fn with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let packets = read_capture(path)?;
        let metadata = find_metadata(path)?;
        let dissector = create_dissector(&config, metadata.as_ref());

        Ok(Self {
            packets: packets.into_iter(),
            dissector,
            pending: VecDeque::new(),
            finished: false,
        })
    }

    /// Dissector state so far.
    pub fn dissector(&self) -> &Dissector {
        &self.dissector
    }
}

impl Iterator for UnitIterator {
    type Item = Arc<ReassembledUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch: Vec<Arc<ReassembledUnit>> = Vec::new();
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(unit);
            }
            if self.finished {
                return None;
            }

            match self.packets.next() {
                Some(packet) => {
                    self.dissector.process_with(&packet, &mut batch);
                }
                None => {
                    self.dissector.finish_with(&mut batch);
                    self.finished = true;
                }
            }
            self.pending.extend(batch.drain(..));
        }
    }
}
