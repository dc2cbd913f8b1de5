use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

mod barrier;
mod context;
mod cpu;
mod device;
mod engine;
mod harness;
mod inventory;
mod mmap;
mod report;
mod session;

pub use barrier::SimpleBarrier;
pub use context::{ContextCore, ContextState, OffloadContext, Task, TaskHandler, TaskId, TaskState};
pub use cpu::{CpuPipe, Lz4Pipe, RegexOptions, RegexPipe, ZPipe, cpu_pipe_for};
pub use device::{
    Accelerator, AcceleratorDevice, DeviceGeneration, DeviceInfo, FaultPlan, SoftAccelerator,
    TaskOutput,
};
pub use engine::{
    ChunkResult, ChunkedOffload, OffloadTimings, PreparedChunk, ProgressEngine,
    SubmissionStrategy, WaitMode, poll_until_drained, prepare_eager, submit_all,
};
pub use harness::{CoprocessingConfig, CoprocessingRun, WorkerOutcome, WorkerReport, run, run_with};
pub use inventory::{
    BufferHandle, BufferInventory, Chunk, ChunkPlan, effective_capacity, plan, read_into_plan,
};
pub use mmap::{LOCAL_READ, LOCAL_READ_WRITE, LOCAL_WRITE, MemoryRegion, RegionState, SharedMemory};
pub use report::{PhaseReport, format_seconds};
pub use session::{OffloadOptions, OffloadSession, SessionSummary};

use engine::{Completion, CompletionQueue};

pub const GEN2_MAX_BUFFER_SIZE: usize = 134_217_728;
pub const GEN3_MAX_BUFFER_SIZE: usize = 2_097_152;
const GEN2_MAX_TASKS: usize = 16_384;
const GEN3_MAX_TASKS: usize = 65_536;
const NOTIFY_WAIT_MS: u64 = 10;
const DEFAULT_PIPELINE_DEPTH: usize = 1;
const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Operation an accelerator context is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    CompressDeflate,
    DecompressDeflate,
    DecompressLz4,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::CompressDeflate,
        TaskKind::DecompressDeflate,
        TaskKind::DecompressLz4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CompressDeflate => "compress-deflate",
            Self::DecompressDeflate => "decompress-deflate",
            Self::DecompressLz4 => "decompress-lz4",
        }
    }

    pub fn is_decompress(self) -> bool {
        !matches!(self, Self::CompressDeflate)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Benchmark workload. Regex has no accelerator task kind and only runs on the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workload {
    CompressDeflate,
    DecompressDeflate,
    DecompressLz4,
    Regex,
}

impl Workload {
    pub fn task_kind(self) -> Option<TaskKind> {
        match self {
            Self::CompressDeflate => Some(TaskKind::CompressDeflate),
            Self::DecompressDeflate => Some(TaskKind::DecompressDeflate),
            Self::DecompressLz4 => Some(TaskKind::DecompressLz4),
            Self::Regex => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CompressDeflate => "compress-deflate",
            Self::DecompressDeflate => "decompress-deflate",
            Self::DecompressLz4 => "decompress-lz4",
            Self::Regex => "regex",
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Workload {
    type Err = CozipOffloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "compress-deflate" | "compress" => Ok(Self::CompressDeflate),
            "decompress-deflate" | "inflate" => Ok(Self::DecompressDeflate),
            "decompress-lz4" | "lz4" => Ok(Self::DecompressLz4),
            "regex" => Ok(Self::Regex),
            _ => Err(CozipOffloadError::InvalidConfiguration("unknown workload")),
        }
    }
}

#[derive(Debug, Error)]
pub enum CozipOffloadError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("no accelerator device available for {0}")]
    DeviceNotFound(&'static str),
    #[error("context is not connected to this progress engine")]
    NotConnected,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(&'static str),
    #[error("task for chunk {index} failed: {source}")]
    TaskFailed { index: usize, source: TaskError },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report serialization failed: {0}")]
    Report(#[from] serde_json::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Status carried by a task that completed through the error path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task flushed by context stop")]
    Flushed,
    #[error("device reported a forced fault")]
    Injected,
    #[error("input data is corrupt")]
    BadInput,
    #[error("output needs {needed} bytes but destination holds {capacity}")]
    OutputOverflow { needed: usize, capacity: usize },
    #[error("task allocation failed")]
    AllocFailed,
    #[error("submission rejected: {0}")]
    SubmitRejected(&'static str),
    #[error("registered memory is unavailable")]
    MemoryAccess,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<std::sync::MutexGuard<'a, T>, CozipOffloadError> {
    mutex
        .lock()
        .map_err(|_| CozipOffloadError::Internal("mutex poisoned"))
}

fn span(end: Option<Instant>, start: Option<Instant>) -> Duration {
    match (end, start) {
        (Some(end), Some(start)) => end.saturating_duration_since(start),
        _ => Duration::ZERO,
    }
}

/// Worst-case raw DEFLATE output for `len` input bytes.
pub fn deflate_bound(len: usize) -> usize {
    len.saturating_add(len >> 3)
        .saturating_add(len >> 6)
        .saturating_add(64)
}

pub fn lz4_bound(len: usize) -> usize {
    lz4_flex::block::get_maximum_output_size(len)
}

fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65_521;
    const NMAX: usize = 5_552;

    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for block in data.chunks(NMAX) {
        for &byte in block {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}
