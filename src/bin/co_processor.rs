use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use cozip_offload::{
    CoprocessingConfig, DeviceGeneration, GEN2_MAX_BUFFER_SIZE, SubmissionStrategy, WaitMode,
    WorkerOutcome, Workload,
};
use tracing_subscriber::EnvFilter;

/// Runs a workload on the CPU, the accelerator, or both at once, and writes
/// one timing report per path.
#[derive(Debug, Parser)]
#[command(name = "co_processor", version, about)]
struct Args {
    /// Spawn the CPU path when greater than 0.
    #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
    cpu_pct: u8,

    /// Spawn the accelerator path when greater than 0.
    #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
    accel_pct: u8,

    /// compress-deflate, decompress-deflate, decompress-lz4 or regex.
    #[arg(long, default_value = "compress-deflate")]
    workload: Workload,

    /// Bytes of input to process.
    #[arg(long, default_value_t = 300 * 1024 * 1024)]
    original_file_size: usize,

    /// Accelerator generation, 2 or 3.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(2..=3))]
    device_generation: u8,

    /// Requested chunk size; capped at the device maximum.
    #[arg(long, default_value_t = GEN2_MAX_BUFFER_SIZE)]
    chunk_size: usize,

    /// Tasks kept in flight by the pipelined strategy.
    #[arg(long, default_value_t = 1)]
    num_chunks: usize,

    #[arg(long, env = "COZIP_OFFLOAD_INPUT", default_value = "input.bin")]
    input: PathBuf,

    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// eager or pipelined.
    #[arg(long, default_value = "eager")]
    strategy: SubmissionStrategy,

    /// busy-poll or notify.
    #[arg(long, default_value = "busy-poll")]
    wait: WaitMode,

    /// DEFLATE level, 0 to 9.
    #[arg(long, default_value_t = 6)]
    level: u32,
}

impl Args {
    fn into_config(self) -> Result<CoprocessingConfig, String> {
        let device_generation = DeviceGeneration::try_from(self.device_generation)
            .map_err(|error| error.to_string())?;
        let strategy = match self.strategy {
            SubmissionStrategy::Pipelined { .. } => SubmissionStrategy::Pipelined {
                depth: self.num_chunks,
            },
            SubmissionStrategy::Eager => SubmissionStrategy::Eager,
        };
        if self.num_chunks == 0 {
            return Err("num_chunks must be greater than 0".to_string());
        }

        Ok(CoprocessingConfig {
            cpu_percent: self.cpu_pct,
            accel_percent: self.accel_pct,
            workload: self.workload,
            input_path: self.input,
            output_dir: self.output_dir,
            original_file_size: self.original_file_size,
            device_generation,
            chunk_size: self.chunk_size,
            strategy,
            wait_mode: self.wait,
            compression_level: self.level,
            write_reports: true,
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = config.validate() {
        eprintln!("error: {error}");
        return ExitCode::FAILURE;
    }

    let run = match cozip_offload::run(&config) {
        Ok(run) => run,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };

    for worker in &run.workers {
        println!("{}: {:?}", worker.name, worker.outcome);
        if let Some(report) = &worker.report {
            for (phase, elapsed) in report.phases() {
                println!(
                    "  {phase:<28} {}s",
                    cozip_offload::format_seconds(*elapsed)
                );
            }
        }
        if let Some(path) = &worker.report_path {
            println!("  report: {}", path.display());
        }
        if let Some(error) = &worker.report_error {
            println!("  report not written: {error}");
        }
    }

    let failed = run
        .workers
        .iter()
        .any(|worker| matches!(worker.outcome, WorkerOutcome::Failed(_)));
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
