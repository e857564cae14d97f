//! Standalone transcoding demo
//!
//! Loads a DBC file, pushes pseudo-random frames for every message it
//! defines through a transcoder, and prints the resulting counters.
//!
//! Usage:
//!   transcode_dbc <file.dbc> <output> [--sql] [--frames <count>] [--config <file.toml>]
//!
//! Without `--sql` the output is a directory of CSV files; with it, the
//! output is a SQLite database path.
//!
//! Example:
//!   cargo run --example transcode_dbc -- powertrain.dbc out --frames 100000

use can_transcoder::{
    CanFrame, Destination, TimestampedFrame, Transcoder, TranscoderConfig,
};
use std::env;
use std::path::PathBuf;
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} <file.dbc> <output> [--sql] [--frames <count>] [--config <file.toml>]",
            args[0]
        );
        std::process::exit(1);
    }

    let dbc_file = PathBuf::from(&args[1]);
    let output = PathBuf::from(&args[2]);
    let mut use_sql = false;
    let mut frame_count: u64 = 100_000;
    let mut config = TranscoderConfig::default();

    // Parse arguments
    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--sql" => use_sql = true,
            "--frames" => {
                i += 1;
                if i < args.len() {
                    frame_count = args[i].parse()?;
                }
            }
            "--config" => {
                i += 1;
                if i < args.len() {
                    config = TranscoderConfig::load(PathBuf::from(&args[i]).as_path())?;
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
            }
        }
        i += 1;
    }

    let destination = if use_sql {
        Destination::Sql(output)
    } else {
        Destination::Csv(output)
    };

    let transcoder = Transcoder::create(destination, config)?;
    let db_stats = transcoder.parse_dbc_file(&dbc_file)?;
    println!(
        "Loaded {:?}: {} messages, {} signals",
        dbc_file, db_stats.num_messages, db_stats.num_signals
    );

    let network = transcoder.network();
    let targets: Vec<(u32, bool, usize)> = network
        .messages()
        .iter()
        .map(|m| (m.id, m.is_extended, m.size.min(8)))
        .collect();
    if targets.is_empty() {
        eprintln!("DBC defines no messages");
        std::process::exit(1);
    }

    let started = Instant::now();
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for seq in 0..frame_count {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;

        let (id, extended, size) = targets[(seq % targets.len() as u64) as usize];
        let payload = state.to_le_bytes();
        let frame = if extended {
            CanFrame::new_extended(id, &payload[..size])?
        } else {
            CanFrame::new(id, &payload[..size])?
        };
        transcoder.receive_raw_message(TimestampedFrame::now(frame))?;
    }
    let submitted = started.elapsed();

    transcoder.flush_all_batches()?;
    let flushed = started.elapsed();

    println!("\n=== TRANSCODING SUMMARY ===");
    println!("Frames submitted: {} in {:?}", frame_count, submitted);
    println!("All batches flushed after {:?}", flushed);
    println!("{}", transcoder.stats().to_json()?);

    transcoder.shutdown()?;
    Ok(())
}
