//! filterchain - drive a filter chain against simulated hardware
//!
//! Usage:
//!   filterchain                          # Run the built-in sample chain
//!   filterchain --config chain.toml      # Run a chain from a config file
//!   filterchain --write-sample chain.toml
//!   filterchain --frames 100 --m2m --json

use anyhow::{bail, Context};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use filterchain_rs::{
    buffer::{Buffer, PixelFormat},
    chain::{ChainBuilder, StageKind},
    config::ChainConfig,
    filter::{ChannelListener, Completion},
    hw::SimulatedGdc,
    logging::init_tracing,
    stages::StageFactory,
    types::{ParamValue, Work},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "filterchain")]
#[command(about = "Push frames through a filter chain backed by simulated hardware")]
struct Args {
    /// Chain description (.toml or .json); the sample chain when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the sample chain to this path and exit
    #[arg(long)]
    write_sample: Option<PathBuf>,

    /// Number of frames to push
    #[arg(short, long, default_value_t = 16)]
    frames: u64,

    /// Let the GDC hand results straight on instead of waiting per job
    #[arg(long)]
    m2m: bool,

    /// Base latency of the simulated GDC in milliseconds
    #[arg(long, default_value_t = 2)]
    latency_ms: u64,

    /// Frame width and height
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Seconds to wait for the chain to drain
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Print the stage report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.write_sample {
        ChainConfig::sample()
            .save(path)
            .with_context(|| format!("Failed to write sample to {:?}", path))?;
        println!("Sample chain written to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => ChainConfig::load(path).with_context(|| format!("Loading {:?}", path))?,
        None => ChainConfig::sample(),
    };
    if args.m2m {
        for stage in config.stages.iter_mut().filter(|s| s.kind == StageKind::Gdc) {
            stage.options.insert("m2m".into(), ParamValue::Bool(true));
        }
    }

    let _log_guard = init_tracing(&config.logging).context("Failed to initialise logging")?;
    tracing::info!(stages = config.stages.len(), frames = args.frames, "Starting filter chain");

    let gdc = SimulatedGdc::new(args.m2m, Duration::from_millis(args.latency_ms))?;
    let factory = StageFactory::new(config.engine.clone()).with_gdc_device(Arc::new(gdc));
    let (listener, mailbox) = ChannelListener::new(config.engine.mailbox_capacity);
    let chain = ChainBuilder::from_config(&config, &factory, listener)?;
    let head = chain.head().context("Chain has no stages")?;

    chain.start()?;
    let started = Instant::now();
    for frame_index in 0..args.frames {
        let frame = Buffer::graphic(args.width, args.height, PixelFormat::Nv12);
        frame.set_param("frame", ParamValue::Int(frame_index as i64));
        let work = Work::new(frame_index, vec![frame]).with_drain(frame_index + 1 == args.frames);
        head.queue_work(work)
            .with_context(|| format!("Frame {} rejected", frame_index))?;
    }

    let deadline = started + Duration::from_secs(args.timeout_secs);
    let (mut done, mut buffers_out, mut errors) = (0u64, 0usize, 0usize);
    while done < args.frames {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("Timed out with {} of {} frames done", done, args.frames);
        }
        match mailbox.recv_timeout(remaining) {
            Ok(Completion::Done { work, .. }) => {
                done += 1;
                buffers_out += work.unconsumed_count();
                if work.is_failed() {
                    errors += 1;
                }
            }
            Ok(Completion::Error { from, kind }) => {
                tracing::warn!(%from, %kind, "Stage reported an error");
            }
            Ok(Completion::Flushed { from, works }) => {
                tracing::info!(%from, count = works.len(), "Works returned by flush");
                done += works.len() as u64;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("Mailbox closed early"),
        }
    }
    let elapsed = started.elapsed();

    chain.flush()?;
    chain.stop()?;
    let report = chain.get_filter_list_info();
    chain.release()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} frames in {:.1?} ({} buffers out, {} failed)",
            done, elapsed, buffers_out, errors
        );
        for info in &report {
            println!(
                "  {:<10} {:<12} admitted={:<5} processed={:<5} bypassed={:<5} retired={}",
                info.name,
                info.state.to_string(),
                info.stats.admitted,
                info.stats.processed,
                info.stats.bypassed,
                info.stats.retired
            );
        }
    }
    Ok(())
}
