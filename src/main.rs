//! h264-depay - H.264 RTP depacketizer
//!
//! Replays rtpdump captures through the depacketizer and writes an Annex B
//! elementary stream.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use h264_depay::config::Config;
use h264_depay::h264::{
    is_key_frame, nal_unit_type, Depacketizer, KeyFrameRequester, FU_END_BIT, FU_START_BIT,
    NAL_TYPE_FU_A,
};
use h264_depay::rtp::rtcp::{self, PliRequester};
use h264_depay::rtp::{self as rtp_packet, rtpdump::RtpDumpReader};

/// PLIs waiting to be "sent" before requests start failing.
const PLI_QUEUE_SIZE: usize = 16;

#[derive(Parser)]
#[command(name = "h264-depay")]
#[command(about = "Reassemble H.264 NAL units from RTP captures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the per-user config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Depacketize an rtpdump capture into an Annex B stream
    Replay {
        /// rtpdump file to read
        input: PathBuf,

        /// Where to write the H.264 elementary stream
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only process RTP packets with this payload type
        #[arg(long)]
        payload_type: Option<u8>,

        /// Pace packets by their capture timestamps
        #[arg(long)]
        realtime: bool,

        /// Discard NAL units interrupted by packet loss instead of flushing them
        #[arg(long)]
        no_incomplete: bool,
    },

    /// Print one line per packet of an rtpdump capture
    Inspect {
        /// rtpdump file to read
        input: PathBuf,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Replay {
            input,
            output,
            payload_type,
            realtime,
            no_incomplete,
        } => {
            let mut config = config;
            if no_incomplete {
                config.depacketizer.output_incomplete_nal_units = false;
            }
            replay(&config, &input, output.as_deref(), payload_type, realtime).await?;
        }
        Commands::Inspect { input } => {
            inspect(&input)?;
        }
        Commands::Config => {
            match &cli.config {
                Some(path) => println!("# {}", path.display()),
                None => println!("# {}", Config::config_path()?.display()),
            }
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn open_dump(path: &Path) -> Result<RtpDumpReader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    RtpDumpReader::new(BufReader::new(file))
}

async fn replay(
    config: &Config,
    input: &Path,
    output: Option<&Path>,
    payload_type: Option<u8>,
    realtime: bool,
) -> Result<()> {
    let reader = open_dump(input)?;
    let mut out = match output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => None,
    };

    // Stand-in for an RTCP socket: PLIs are logged.
    let (pli_tx, pli_rx) = mpsc::sync_channel::<Vec<u8>>(PLI_QUEUE_SIZE);
    let mut pli_tx = Some(pli_tx);
    let pli_logger = tokio::task::spawn_blocking(move || {
        let mut count = 0u64;
        for pli in pli_rx {
            count += 1;
            tracing::info!("Sending PLI: {:?}", rtcp::parse_rtcp(&pli));
        }
        count
    });

    let mut depacketizer = Depacketizer::new(config.depacketizer.clone());
    depacketizer.open();

    let start = tokio::time::Instant::now();
    let mut units_written = 0u64;
    let mut bytes_written = 0u64;

    for record in reader {
        let record = record?;
        if record.is_rtcp {
            tracing::debug!("RTCP: {:?}", rtcp::parse_rtcp(&record.data));
            continue;
        }

        let packet = match rtp_packet::decode(&record.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Skipping packet: {}", e);
                continue;
            }
        };
        if payload_type.is_some_and(|pt| pt != packet.payload_type) {
            continue;
        }

        // The media SSRC is known once the first packet arrives.
        if let Some(tx) = pli_tx.take() {
            let requester: Arc<dyn KeyFrameRequester> = Arc::new(PliRequester::new(packet.ssrc, tx)?);
            depacketizer.set_key_frame_control(Some(Arc::new(vec![requester])));
        }

        if realtime {
            tokio::time::sleep_until(start + record.offset).await;
        }

        for nal in depacketizer.push(&packet.payload, packet.sequence_number, packet.marker)? {
            if !nal.is_complete() {
                tracing::info!(
                    "Incomplete NAL unit of type {} before seq {}",
                    nal.nal_unit_type(),
                    packet.sequence_number
                );
            }
            if let Some(out) = out.as_mut() {
                out.write_all(nal.data()).context("Failed to write output")?;
            }
            units_written += 1;
            bytes_written += nal.len() as u64;
        }
    }

    if let Some(mut out) = out {
        out.flush().context("Failed to write output")?;
    }

    let stats = depacketizer.stats();
    let requests = depacketizer.key_frame_requests_sent();
    depacketizer.set_key_frame_control(None);
    depacketizer.close();
    drop(depacketizer);
    drop(pli_tx);
    let plis = pli_logger.await.context("PLI logger panicked")?;

    println!("Packets received:   {}", stats.packets_received);
    println!("Packets dropped:    {}", stats.packets_dropped);
    println!("Sequence losses:    {}", stats.sequence_losses);
    println!("NAL units complete: {}", stats.nals_complete);
    println!("NAL units flushed:  {}", stats.nals_incomplete);
    println!("Frames:             {}", stats.frames_received);
    println!("Key frame requests: {} ({} PLIs)", requests, plis);
    println!("Written:            {} units, {} bytes", units_written, bytes_written);

    Ok(())
}

fn inspect(input: &Path) -> Result<()> {
    let reader = open_dump(input)?;
    println!("# {}", reader.header().endpoint);

    let mut first_timestamp = None;
    for record in reader {
        let record = record?;
        if record.is_rtcp {
            println!(
                "{:>8}ms  RTCP {:?}",
                record.offset.as_millis(),
                rtcp::parse_rtcp(&record.data)
            );
            continue;
        }

        let packet = match rtp_packet::decode(&record.data) {
            Ok(p) => p,
            Err(e) => {
                println!("{:>8}ms  invalid RTP: {}", record.offset.as_millis(), e);
                continue;
            }
        };

        let base = *first_timestamp.get_or_insert(packet.timestamp);
        let payload = &packet.payload;
        let kind = match payload.first().map(|&b| nal_unit_type(b)) {
            None => "empty".to_string(),
            Some(NAL_TYPE_FU_A) if payload.len() >= 2 => format!(
                "FU-A({}{}{})",
                nal_unit_type(payload[1]),
                if payload[1] & FU_START_BIT != 0 { ",S" } else { "" },
                if payload[1] & FU_END_BIT != 0 { ",E" } else { "" }
            ),
            Some(t) => format!("{}", t),
        };

        println!(
            "{:>8}ms  seq={:<5} ts={:<10} t={:>9.3}s pt={:<3} {} nal={:<12} {:>5}B{}",
            record.offset.as_millis(),
            packet.sequence_number,
            packet.timestamp,
            rtp_packet::media_time(packet.timestamp, base).as_secs_f64(),
            packet.payload_type,
            if packet.marker { "M" } else { " " },
            kind,
            payload.len(),
            if is_key_frame(payload) { "  key" } else { "" }
        );
    }

    Ok(())
}
