//! `trigger-dissect` command-line entry point
//!
//! Replays a recorded capture through the dissector and logs what it found.
//!
//! Usage: `trigger-dissect <capture.bin> [config.json]`

use anyhow::{bail, Context};
use std::path::PathBuf;

use trigger_dissect_lib::replay::{PacketReplay, ReplayConfig};
use trigger_dissect_lib::DissectorConfig;

fn main() -> anyhow::Result<()> {
    trigger_dissect_lib::init_logging();

    let mut args = std::env::args_os().skip(1);
    let Some(capture_path) = args.next().map(PathBuf::from) else {
        bail!("usage: trigger-dissect <capture.bin> [config.json]");
    };

    let dissector_config = match args.next().map(PathBuf::from) {
        Some(path) => DissectorConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DissectorConfig::default(),
    }
    .with_env_overrides();

    let config = ReplayConfig {
        dissector: dissector_config,
        ..Default::default()
    };
    let replay = PacketReplay::load_with_config(&capture_path, config)
        .with_context(|| format!("loading capture {}", capture_path.display()))?;

    let (dissector, units) = replay.replay_sync();

    for conversation in dissector.registry().conversations() {
        let stats = conversation.stats();
        log::info!(
            "{} ({}): {} packets, {} headers, {} continuations, {} control, {} checksum failures",
            conversation.id(),
            conversation.variant(),
            stats.packets,
            stats.header_packets,
            stats.continuation_packets,
            stats.control_packets,
            stats.checksum_failures
        );
    }

    for packet in replay.packets() {
        let Some(frame) = dissector.lookup_frame(packet.conversation, packet.sequence) else {
            continue;
        };
        if let Some(control) = &frame.control {
            log::info!(
                "{} seq {}: {}",
                packet.conversation,
                packet.sequence,
                control.kind()
            );
            log::debug!("{:?}", control);
        }
    }

    let totals = dissector.stats();
    log::info!(
        "{} units: {} complete, {} truncated, {} abandoned, {} open at end ({} bytes)",
        units.len(),
        totals.complete_units,
        totals.truncated_units,
        totals.abandoned_units,
        totals.capture_ended_units,
        totals.unit_bytes
    );

    println!("{}", serde_json::to_string_pretty(&totals)?);
    Ok(())
}
