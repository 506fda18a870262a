use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mercount", version, about = "Fast multithreaded k-mer counting for FASTA/FASTQ")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    Count(CountArgs),
}

#[derive(Parser)]
pub struct CountArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[arg(short = 'm', long)]
    pub mer_len: u32,

    #[arg(short = 's', long)]
    pub size: u64,

    #[arg(short = 't', long, default_value_t = num_cpus::get())]
    pub threads: usize,

    #[arg(short = 'o', long, default_value = "mer_counts.mc")]
    pub output: PathBuf,

    #[arg(long, default_value_t = 7)]
    pub counter_bits: u32,

    #[arg(long, default_value_t = 32)]
    pub out_counter_bits: u32,

    #[arg(long, default_value_t = 62)]
    pub reprobe_limit: u32,

    #[arg(short = 'C', long, default_value_t = false)]
    pub canonical: bool,

    #[arg(long, default_value_t = false)]
    pub quake: bool,

    #[arg(long, default_value_t = b'!')]
    pub quality_start: u8,

    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub buffer_size: usize,
}
