//! `trigger-dissect` - MCT Trigger 5/6 USB display adapter dissection
//!
//! Reassembles the logical payloads these adapters split across bulk
//! transfers, and decodes the vendor control requests that set video modes
//! and query the adapter.
//!
//! Packets are fed one at a time, in wire order, to a [`Dissector`]:
//!
//! ```rust,ignore
//! use trigger_dissect_lib::{Dissector, DissectorConfig};
//!
//! let mut dissector = Dissector::new(DissectorConfig::default());
//! let mut units = Vec::new();
//! for packet in &packets {
//!     let info = dissector.process_with(packet, &mut units);
//!     log::debug!("seq {}: {:?}", info.sequence, info.class);
//! }
//! dissector.finish_with(&mut units);
//! ```

pub mod capture;
pub mod checksum;
pub mod classifier;
pub mod config;
pub mod control;
pub mod dissector;
pub mod framing;
pub mod packet;
pub mod reassembly;
pub mod registry;
pub mod replay;
pub mod sink;
pub mod test_utils;
pub mod timing;

pub use config::{DissectorConfig, HardwarePlatform};
pub use control::ControlContent;
pub use dissector::Dissector;
pub use framing::GoverningRecord;
pub use packet::{ConversationId, Direction, ProtocolVariant, SetupFields, TransferType, UsbPacket};
pub use reassembly::{Completeness, FrameClass, ReassembledUnit, StreamKey};
pub use registry::{ConversationStats, FrameInfo};
pub use sink::UnitSink;
pub use timing::VideoModeTiming;

/// Initialize logging with `RUST_LOG` support, defaulting to `info`
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
