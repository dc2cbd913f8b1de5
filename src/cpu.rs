use super::*;

use std::fs;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use regex::Regex;

const REGEX_PATTERNS: [&str; 4] = [
    "At (.+)Exit (.+)",
    "(.+) on (.+) at Exit (.+)",
    "on (.+) at (.+)",
    "Ramp to (.+)",
];
const MIB: f64 = 1_048_576.0;

/// CPU reference implementation driven through `init`, `execute` and
/// `cleanup`. Only `execute` runs inside the timed window.
pub trait CpuPipe: Send {
    fn name(&self) -> &'static str;
    fn init(&mut self, input: &Path, output: &Path) -> Result<(), CozipOffloadError>;
    fn execute(&mut self) -> Result<(), CozipOffloadError>;
    fn cleanup(&mut self) -> Result<(), CozipOffloadError>;
}

pub fn cpu_pipe_for(workload: Workload, level: u32) -> Box<dyn CpuPipe> {
    match workload {
        Workload::CompressDeflate => Box::new(ZPipe::compressor(level)),
        Workload::DecompressDeflate => Box::new(ZPipe::decompressor(level)),
        Workload::DecompressLz4 => Box::new(Lz4Pipe::new()),
        Workload::Regex => Box::new(RegexPipe::new(RegexOptions::default())),
    }
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>, CozipOffloadError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, CozipOffloadError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|error| CozipOffloadError::Codec(error.to_string()))?;
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZMode {
    Deflate,
    Inflate,
}

/// zlib-wrapped DEFLATE on the CPU. The inflate direction compresses its
/// input during `init` so `execute` measures decompression alone.
#[derive(Debug)]
pub struct ZPipe {
    mode: ZMode,
    level: u32,
    original_len: usize,
    staged: Vec<u8>,
    produced: Vec<u8>,
    output_path: Option<PathBuf>,
    size_mismatch: bool,
}

impl ZPipe {
    pub fn compressor(level: u32) -> Self {
        Self::with_mode(ZMode::Deflate, level)
    }

    pub fn decompressor(level: u32) -> Self {
        Self::with_mode(ZMode::Inflate, level)
    }

    fn with_mode(mode: ZMode, level: u32) -> Self {
        Self {
            mode,
            level,
            original_len: 0,
            staged: Vec::new(),
            produced: Vec::new(),
            output_path: None,
            size_mismatch: false,
        }
    }

    pub fn produced(&self) -> &[u8] {
        &self.produced
    }

    pub fn size_mismatch(&self) -> bool {
        self.size_mismatch
    }
}

impl CpuPipe for ZPipe {
    fn name(&self) -> &'static str {
        match self.mode {
            ZMode::Deflate => "zpipe-deflate",
            ZMode::Inflate => "zpipe-inflate",
        }
    }

    fn init(&mut self, input: &Path, output: &Path) -> Result<(), CozipOffloadError> {
        let raw = fs::read(input)?;
        self.original_len = raw.len();
        self.staged = match self.mode {
            ZMode::Deflate => raw,
            ZMode::Inflate => deflate(&raw, self.level)?,
        };
        self.output_path = Some(output.to_path_buf());
        debug!(pipe = self.name(), bytes = self.original_len, "cpu pipe ready");
        Ok(())
    }

    fn execute(&mut self) -> Result<(), CozipOffloadError> {
        self.produced = match self.mode {
            ZMode::Deflate => deflate(&self.staged, self.level)?,
            ZMode::Inflate => inflate(&self.staged)?,
        };
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), CozipOffloadError> {
        if self.mode == ZMode::Inflate && self.produced.len() != self.original_len {
            self.size_mismatch = true;
            warn!(
                expected = self.original_len,
                actual = self.produced.len(),
                "decompressed size mismatch"
            );
        }
        if let Some(path) = self.output_path.take() {
            fs::write(&path, &self.produced)?;
        }
        self.staged = Vec::new();
        Ok(())
    }
}

/// LZ4 block decompression on the CPU, compressing the input during `init`.
#[derive(Debug, Default)]
pub struct Lz4Pipe {
    original_len: usize,
    compressed: Vec<u8>,
    produced: Vec<u8>,
    output_path: Option<PathBuf>,
    size_mismatch: bool,
}

impl Lz4Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn produced(&self) -> &[u8] {
        &self.produced
    }

    pub fn size_mismatch(&self) -> bool {
        self.size_mismatch
    }
}

impl CpuPipe for Lz4Pipe {
    fn name(&self) -> &'static str {
        "lz4-decompress"
    }

    fn init(&mut self, input: &Path, output: &Path) -> Result<(), CozipOffloadError> {
        let raw = fs::read(input)?;
        self.original_len = raw.len();
        self.compressed = lz4_flex::block::compress(&raw);
        self.output_path = Some(output.to_path_buf());
        debug!(
            bytes = self.original_len,
            compressed = self.compressed.len(),
            "lz4 pipe ready"
        );
        Ok(())
    }

    fn execute(&mut self) -> Result<(), CozipOffloadError> {
        self.produced = lz4_flex::block::decompress(&self.compressed, self.original_len)
            .map_err(|error| CozipOffloadError::Codec(error.to_string()))?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), CozipOffloadError> {
        if self.produced.len() != self.original_len {
            self.size_mismatch = true;
            warn!(
                expected = self.original_len,
                actual = self.produced.len(),
                "decompressed size mismatch"
            );
        }
        if let Some(path) = self.output_path.take() {
            fs::write(&path, &self.produced)?;
        }
        self.compressed = Vec::new();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RegexOptions {
    /// Zero-based CSV column holding the text to match.
    pub column: usize,
    pub iterations: usize,
    pub skip_header: bool,
}

impl Default for RegexOptions {
    fn default() -> Self {
        Self {
            column: 9,
            iterations: 3,
            skip_header: true,
        }
    }
}

/// Full-match regex benchmark over one CSV column.
#[derive(Debug)]
pub struct RegexPipe {
    options: RegexOptions,
    regexes: Vec<Regex>,
    lines: Vec<String>,
    total_bytes: usize,
    matches: Vec<usize>,
    durations: Vec<Duration>,
    output_path: Option<PathBuf>,
}

impl RegexPipe {
    pub fn new(options: RegexOptions) -> Self {
        Self {
            options,
            regexes: Vec::new(),
            lines: Vec::new(),
            total_bytes: 0,
            matches: Vec::new(),
            durations: Vec::new(),
            output_path: None,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Matching lines per pattern from the last `execute`.
    pub fn matches(&self) -> &[usize] {
        &self.matches
    }

    /// Throughput per pattern in MiB/s, averaged over the iterations.
    pub fn throughput(&self) -> Vec<f64> {
        self.durations
            .iter()
            .map(|duration| {
                let secs = duration.as_secs_f64();
                if secs > 0.0 {
                    self.total_bytes as f64 / secs / MIB
                } else {
                    0.0
                }
            })
            .collect()
    }
}

impl CpuPipe for RegexPipe {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn init(&mut self, input: &Path, output: &Path) -> Result<(), CozipOffloadError> {
        if self.options.iterations == 0 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "regex iterations must be greater than 0",
            ));
        }

        self.regexes = REGEX_PATTERNS
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})$"))
                    .map_err(|error| CozipOffloadError::Codec(error.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let text = fs::read_to_string(input)?;
        self.lines.clear();
        self.total_bytes = 0;
        for line in text.lines() {
            let line = line.replace('\r', "");
            if let Some(field) = line.split(',').nth(self.options.column) {
                self.total_bytes += field.len();
                self.lines.push(field.to_string());
            }
        }
        if self.options.skip_header && !self.lines.is_empty() {
            let header = self.lines.remove(0);
            self.total_bytes -= header.len();
        }

        self.output_path = Some(output.to_path_buf());
        debug!(lines = self.lines.len(), bytes = self.total_bytes, "regex pipe ready");
        Ok(())
    }

    fn execute(&mut self) -> Result<(), CozipOffloadError> {
        self.matches.clear();
        self.durations.clear();
        for regex in &self.regexes {
            let mut total = Duration::ZERO;
            let mut matched = 0;
            for _ in 0..self.options.iterations {
                let start = Instant::now();
                matched = self
                    .lines
                    .iter()
                    .filter(|line| regex.captures(line).is_some())
                    .count();
                total += start.elapsed();
            }
            self.matches.push(matched);
            self.durations
                .push(total / self.options.iterations as u32);
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), CozipOffloadError> {
        let mut summary = String::from("query_id,device,full_mib_s,matches\n");
        for (idx, (throughput, matches)) in self.throughput().iter().zip(&self.matches).enumerate() {
            summary.push_str(&format!("q{},cpu_regex,{throughput:.3},{matches}\n", idx + 1));
        }
        info!(queries = self.matches.len(), "regex benchmark finished");
        if let Some(path) = self.output_path.take() {
            fs::write(&path, summary)?;
        }
        Ok(())
    }
}
