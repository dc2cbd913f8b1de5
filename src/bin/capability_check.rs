use std::process::ExitCode;

use clap::Parser;
use cozip_offload::{Accelerator, DeviceGeneration, SoftAccelerator, TaskKind};
use serde::Serialize;

/// Lists the emulated accelerator devices and what each one can run.
#[derive(Debug, Parser)]
#[command(name = "capability_check", version, about)]
struct Args {
    /// Only list devices of this generation (2 or 3).
    #[arg(long, value_parser = clap::value_parser!(u8).range(2..=3))]
    generation: Option<u8>,

    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct DeviceRow {
    id: usize,
    name: String,
    generation: u8,
    max_concurrent_tasks: usize,
    kinds: Vec<KindRow>,
}

#[derive(Debug, Serialize)]
struct KindRow {
    kind: &'static str,
    supported: bool,
    max_buffer_size: Option<usize>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let accelerator = match args.generation {
        Some(number) => match DeviceGeneration::try_from(number) {
            Ok(generation) => SoftAccelerator::with_generations(&[generation]),
            Err(error) => {
                eprintln!("error: {error}");
                return ExitCode::FAILURE;
            }
        },
        None => SoftAccelerator::default(),
    };

    let rows: Vec<DeviceRow> = accelerator
        .list_devices()
        .into_iter()
        .map(|info| DeviceRow {
            id: info.id,
            generation: info.generation.number(),
            max_concurrent_tasks: info.max_concurrent_tasks(),
            kinds: TaskKind::ALL
                .iter()
                .map(|kind| KindRow {
                    kind: kind.name(),
                    supported: info.supports(*kind),
                    max_buffer_size: info.max_buffer_size(*kind),
                })
                .collect(),
            name: info.name,
        })
        .collect();

    if args.json {
        match serde_json::to_string_pretty(&rows) {
            Ok(text) => println!("{text}"),
            Err(error) => {
                eprintln!("error: {error}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    for row in &rows {
        println!(
            "[{}] {} (gen{}, max tasks {})",
            row.id, row.name, row.generation, row.max_concurrent_tasks
        );
        for kind in &row.kinds {
            match kind.max_buffer_size {
                Some(size) => println!("    {:<20} yes  max buffer {size} bytes", kind.kind),
                None => println!("    {:<20} no", kind.kind),
            }
        }
    }
    ExitCode::SUCCESS
}
