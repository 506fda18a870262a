use crate::cli::args::{Cli, Commands, CountArgs};
use crate::core::engine::{self, CountConfig};
use crate::core::model::CountMode;
use anyhow::{bail, Result};
use clap::Parser;
use std::time::Instant;

pub fn entry() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Count(args) => count(args),
    }
}

fn count(args: CountArgs) -> Result<()> {
    if args.mer_len == 0 || args.mer_len > 32 {
        bail!("--mer-len must be in 1..=32");
    }
    if args.threads == 0 {
        bail!("--threads must be >= 1");
    }
    if args.size == 0 {
        bail!("--size must be >= 1");
    }
    for file in &args.files {
        if !file.is_file() {
            bail!("input file not found: {}", file.display());
        }
    }
    if let Some(dir) = &args.tmp_dir {
        if !dir.is_dir() {
            bail!("tmp dir not found: {}", dir.display());
        }
    }

    let mode = if args.quake {
        CountMode::Quake {
            quality_start: args.quality_start,
        }
    } else {
        CountMode::Count
    };

    let mut cfg = CountConfig::new(args.files, args.mer_len, args.size, args.output.clone());
    cfg.counter_bits = args.counter_bits;
    cfg.out_counter_bits = args.out_counter_bits;
    cfg.reprobe_limit = args.reprobe_limit;
    cfg.threads = args.threads;
    cfg.canonical = args.canonical;
    cfg.mode = mode;
    cfg.tmp_dir = args.tmp_dir;
    cfg.buffer_size = args.buffer_size;
    cfg.nb_buffers = 3 * args.threads + 2;

    let t0 = Instant::now();
    let summary = engine::run(cfg)?;
    eprintln!(
        "{} distinct mers from {} counted ({} bytes, {} spills) in {:.3}s -> {}",
        summary.distinct,
        summary.total,
        summary.bytes,
        summary.spills,
        t0.elapsed().as_secs_f64(),
        args.output.display()
    );
    Ok(())
}
