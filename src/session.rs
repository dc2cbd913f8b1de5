use super::*;

use std::fs::File;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

/// Outcome of an accelerator offload once the context has drained.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub chunks: usize,
    pub completed: usize,
    pub failed: usize,
    pub mismatched: usize,
    pub output_bytes: usize,
    pub phases: Vec<(&'static str, Duration)>,
}

/// Sizing and submission settings for one offload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadOptions {
    /// Bytes to read from the source.
    pub total_size: usize,
    /// Requested chunk size; 0 or anything above the device limit uses the
    /// limit.
    pub chunk_size: usize,
    pub strategy: SubmissionStrategy,
    pub wait: WaitMode,
    pub level: u32,
}

impl Default for OffloadOptions {
    fn default() -> Self {
        Self {
            total_size: 0,
            chunk_size: 0,
            strategy: SubmissionStrategy::default(),
            wait: WaitMode::default(),
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Every accelerator resource one worker holds. Fields are declared so that
/// dropping the session releases them in reverse order of acquisition: the
/// context is torn down first, then inventory, regions, the progress engine
/// and finally the device inside the context.
pub struct OffloadSession {
    inventory: BufferInventory,
    output_region: MemoryRegion,
    input_region: MemoryRegion,
    engine: ProgressEngine,
    ctx: OffloadContext<ChunkedOffload>,
    plan: ChunkPlan,
    source: Vec<u8>,
    wait: WaitMode,
    /// `(offset, len)` of every finished chunk in the output region, in
    /// chunk order. Filled by `finish`.
    harvested: Vec<(usize, usize)>,
}

impl OffloadSession {
    /// Opens a device for `kind`, stages `reader` into registered memory and
    /// prepares one task per chunk. Nothing here is timed.
    pub fn prepare<R: Read>(
        accelerator: &dyn Accelerator,
        kind: TaskKind,
        reader: &mut R,
        options: OffloadOptions,
    ) -> Result<Self, CozipOffloadError> {
        validate_options(&options)?;
        let OffloadOptions {
            total_size,
            chunk_size,
            strategy,
            wait,
            level,
        } = options;
        let mut ctx = OffloadContext::<ChunkedOffload>::open(accelerator, kind)?;
        ctx.set_compression_level(level);
        let max_buffer = ctx
            .device_info()
            .max_buffer_size(kind)
            .ok_or(CozipOffloadError::DeviceNotFound(kind.name()))?;
        let capacity = effective_capacity(max_buffer, chunk_size);

        let planned = plan(total_size, capacity)?;
        let mut source = vec![0u8; planned.total];
        let plan = read_into_plan(reader, planned, planned.chunk_capacity, &mut source)?;
        source.truncate(plan.total);
        if plan.num_chunks == 0 {
            return Err(CozipOffloadError::InvalidConfiguration("input is empty"));
        }
        if plan.num_chunks != planned.num_chunks {
            warn!(
                planned = planned.num_chunks,
                actual = plan.num_chunks,
                "input shorter than configured size"
            );
        }

        let (staged, in_stride, in_lens, out_stride) = stage_input(kind, &plan, &source, level)?;

        let engine = ProgressEngine::new();
        let input_len = staged.len();
        let input_region = MemoryRegion::register(
            Arc::new(Mutex::new(staged)),
            input_len,
            ctx.device(),
            LOCAL_READ,
        )?;
        let output_len = plan.num_chunks * out_stride;
        let output_region = MemoryRegion::register(
            Arc::new(Mutex::new(vec![0u8; output_len])),
            output_len,
            ctx.device(),
            LOCAL_READ_WRITE,
        )?;
        let inventory = BufferInventory::new(plan.num_chunks * 2, ctx.device())?;

        let mut prepared = Vec::with_capacity(plan.num_chunks);
        for (chunk, in_len) in plan.chunks().zip(in_lens) {
            prepared.push(PreparedChunk {
                chunk,
                input: inventory.derive(
                    &input_region,
                    chunk.index,
                    in_stride,
                    in_len,
                    LOCAL_READ,
                )?,
                output: inventory.derive(
                    &output_region,
                    chunk.index,
                    out_stride,
                    out_stride,
                    LOCAL_WRITE,
                )?,
            });
        }

        // The context owns the handles from here on; the session drop
        // releases them before the regions.
        let mut session = Self {
            inventory,
            output_region,
            input_region,
            engine,
            ctx,
            plan,
            source,
            wait,
            harvested: Vec::new(),
        };
        session.configure(strategy, prepared)?;

        info!(
            kind = %kind,
            device = %session.ctx.device_info().name,
            chunks = plan.num_chunks,
            capacity = plan.chunk_capacity,
            ?strategy,
            "offload session prepared"
        );
        Ok(session)
    }

    fn configure(
        &mut self,
        strategy: SubmissionStrategy,
        prepared: Vec<PreparedChunk>,
    ) -> Result<(), CozipOffloadError> {
        let max_tasks = match strategy {
            SubmissionStrategy::Eager => self.plan.num_chunks,
            SubmissionStrategy::Pipelined { depth } => depth.clamp(1, self.plan.num_chunks),
        };
        self.ctx
            .set_task_conf(ChunkedOffload::new(strategy, prepared), max_tasks)?;
        self.ctx.connect(&self.engine)?;

        if strategy == SubmissionStrategy::Eager {
            self.ctx.start()?;
            prepare_eager(&mut self.ctx)?;
        }
        Ok(())
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    pub fn context(&self) -> &OffloadContext<ChunkedOffload> {
        &self.ctx
    }

    /// The timed part: submit and drain.
    pub fn run(&mut self) -> Result<(), CozipOffloadError> {
        submit_all(&mut self.ctx)?;
        poll_until_drained(&self.engine, &mut self.ctx, self.wait)
    }

    /// Stops the context and verifies each finished chunk against the source.
    /// Nothing is written; see [`OffloadSession::write_output`].
    pub fn finish(&mut self) -> Result<SessionSummary, CozipOffloadError> {
        if self.ctx.state() == ContextState::Running {
            self.ctx.stop()?;
        }
        while self.ctx.state() != ContextState::Idle {
            if !self.engine.progress(&mut self.ctx)? {
                self.engine
                    .wait_notification(Duration::from_millis(NOTIFY_WAIT_MS));
                self.engine.clear_notification();
            }
        }

        let handler = self
            .ctx
            .teardown()?
            .ok_or(CozipOffloadError::InvalidState("task callbacks are not configured"))?;
        let kind = self.ctx.kind();

        let mut mismatched = 0;
        let mut output_bytes = 0;
        self.harvested.clear();

        for (chunk, result) in self.plan.chunks().zip(handler.results()) {
            let ChunkResult::Done {
                output_offset,
                output_len,
                crc32,
                ..
            } = result
            else {
                continue;
            };
            let produced = self.output_region.read_at(*output_offset, *output_len)?;
            if crc32fast::hash(&produced) != *crc32 {
                warn!(chunk = chunk.index, "output checksum does not match device report");
            }
            let expected = &self.source[chunk.offset..chunk.offset + chunk.len];
            if !chunk_matches(kind, &produced, expected) {
                mismatched += 1;
                warn!(
                    chunk = chunk.index,
                    expected = chunk.len,
                    actual = produced.len(),
                    "chunk output does not match source"
                );
            }
            output_bytes += produced.len();
            self.harvested.push((*output_offset, *output_len));
        }

        Ok(SessionSummary {
            chunks: self.plan.num_chunks,
            completed: handler.completed_chunks(),
            failed: handler.failed_chunks(),
            mismatched,
            output_bytes,
            phases: handler.timings().phases(),
        })
    }

    /// Writes the chunks harvested by `finish` to `path` in chunk order and
    /// returns the number of bytes written.
    pub fn write_output(&self, path: &Path) -> Result<usize, CozipOffloadError> {
        let mut file = File::create(path)?;
        let mut written = 0;
        for &(offset, len) in &self.harvested {
            file.write_all(&self.output_region.read_at(offset, len)?)?;
            written += len;
        }
        Ok(written)
    }
}

impl Drop for OffloadSession {
    fn drop(&mut self) {
        if let Err(error) = self.ctx.teardown() {
            warn!(%error, "offload session teardown failed");
        }
        debug!(
            in_use = self.inventory.in_use(),
            input_buffers = self.input_region.outstanding_buffers(),
            output_buffers = self.output_region.outstanding_buffers(),
            "offload session released"
        );
    }
}

fn validate_options(options: &OffloadOptions) -> Result<(), CozipOffloadError> {
    if options.total_size == 0 {
        return Err(CozipOffloadError::InvalidConfiguration(
            "total_size must be greater than 0",
        ));
    }

    if options.level > 9 {
        return Err(CozipOffloadError::InvalidConfiguration(
            "compression level must be in range 0..=9",
        ));
    }

    if options.strategy == (SubmissionStrategy::Pipelined { depth: 0 }) {
        return Err(CozipOffloadError::InvalidConfiguration(
            "pipeline depth must be greater than 0",
        ));
    }

    Ok(())
}

type StagedInput = (Vec<u8>, usize, Vec<usize>, usize);

/// Lays the source out in the input region. Compression reads raw chunks;
/// decompression reads one independently compressed member per chunk.
fn stage_input(
    kind: TaskKind,
    plan: &ChunkPlan,
    source: &[u8],
    level: u32,
) -> Result<StagedInput, CozipOffloadError> {
    let capacity = plan.chunk_capacity;
    match kind {
        TaskKind::CompressDeflate => {
            let mut staged = vec![0u8; plan.num_chunks * capacity];
            let mut lens = Vec::with_capacity(plan.num_chunks);
            for chunk in plan.chunks() {
                let start = chunk.index * capacity;
                staged[start..start + chunk.len]
                    .copy_from_slice(&source[chunk.offset..chunk.offset + chunk.len]);
                lens.push(chunk.len);
            }
            Ok((staged, capacity, lens, deflate_bound(capacity)))
        }
        TaskKind::DecompressDeflate | TaskKind::DecompressLz4 => {
            let stride = match kind {
                TaskKind::DecompressLz4 => lz4_bound(capacity),
                _ => deflate_bound(capacity),
            };
            let mut staged = vec![0u8; plan.num_chunks * stride];
            let mut lens = Vec::with_capacity(plan.num_chunks);
            for chunk in plan.chunks() {
                let raw = &source[chunk.offset..chunk.offset + chunk.len];
                let member = match kind {
                    TaskKind::DecompressLz4 => lz4_flex::block::compress(raw),
                    _ => {
                        let mut encoder =
                            DeflateEncoder::new(Vec::new(), Compression::new(level.min(9)));
                        encoder.write_all(raw)?;
                        encoder.finish()?
                    }
                };
                if member.len() > stride {
                    return Err(CozipOffloadError::Internal(
                        "compressed member exceeds its bound",
                    ));
                }
                let start = chunk.index * stride;
                staged[start..start + member.len()].copy_from_slice(&member);
                lens.push(member.len());
            }
            Ok((staged, stride, lens, capacity))
        }
    }
}

fn chunk_matches(kind: TaskKind, produced: &[u8], expected: &[u8]) -> bool {
    if kind.is_decompress() {
        return produced == expected;
    }
    let mut restored = Vec::with_capacity(expected.len());
    DeflateDecoder::new(produced)
        .read_to_end(&mut restored)
        .is_ok()
        && restored == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_data(bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes);
        let mut state: u32 = 0x1234_5678;
        while out.len() < bytes {
            match (out.len() / 4096) % 3 {
                0 => out.extend_from_slice(b"cozip-cpu-accel-offload-"),
                1 => out.extend_from_slice(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
                _ => {
                    state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    out.push((state >> 24) as u8);
                }
            }
        }
        out.truncate(bytes);
        out
    }

    fn session(
        accel: &SoftAccelerator,
        kind: TaskKind,
        data: &[u8],
        chunk: usize,
        strategy: SubmissionStrategy,
        wait: WaitMode,
    ) -> OffloadSession {
        OffloadSession::prepare(
            accel,
            kind,
            &mut &data[..],
            OffloadOptions {
                total_size: data.len(),
                chunk_size: chunk,
                strategy,
                wait,
                ..OffloadOptions::default()
            },
        )
        .expect("session should prepare")
    }

    #[test]
    fn gen3_lz4_decompression_restores_chunks() {
        let accel = SoftAccelerator::default();
        let data = mixed_data(200_000);
        let mut session = session(
            &accel,
            TaskKind::DecompressLz4,
            &data,
            32 * 1024,
            SubmissionStrategy::Eager,
            WaitMode::Notify,
        );
        assert_eq!(
            session.context().device_info().generation,
            DeviceGeneration::Gen3
        );

        session.run().expect("run should succeed");
        let summary = session.finish().expect("finish should succeed");
        assert_eq!(summary.completed, 7);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.mismatched, 0);
        assert_eq!(summary.output_bytes, data.len());
    }

    #[test]
    fn deflate_roundtrip_through_the_device() {
        let accel = SoftAccelerator::default();
        let data = mixed_data(100_000);
        let dir = tempfile::tempdir().expect("tempdir should be created");

        let mut compress = session(
            &accel,
            TaskKind::CompressDeflate,
            &data,
            16 * 1024,
            SubmissionStrategy::Pipelined { depth: 2 },
            WaitMode::BusyPoll,
        );
        compress.run().expect("compress run should succeed");
        let path = dir.path().join("compressed.bin");
        let summary = compress.finish().expect("finish should succeed");
        assert_eq!(summary.completed, 7);
        assert_eq!(summary.mismatched, 0);
        let written = compress
            .write_output(&path)
            .expect("output should be written");
        assert_eq!(written, summary.output_bytes);
        assert_eq!(
            std::fs::metadata(&path).expect("output written").len() as usize,
            summary.output_bytes
        );
        drop(compress);

        let mut inflate = session(
            &accel,
            TaskKind::DecompressDeflate,
            &data,
            16 * 1024,
            SubmissionStrategy::Eager,
            WaitMode::BusyPoll,
        );
        inflate.run().expect("inflate run should succeed");
        let summary = inflate.finish().expect("finish should succeed");
        assert_eq!(summary.completed, 7);
        assert_eq!(summary.mismatched, 0);
    }

    #[test]
    fn short_source_shrinks_the_plan() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = mixed_data(10_000);
        let session = OffloadSession::prepare(
            &accel,
            TaskKind::CompressDeflate,
            &mut &data[..],
            OffloadOptions {
                total_size: 40_000,
                chunk_size: 4096,
                ..OffloadOptions::default()
            },
        )
        .expect("session should prepare");
        assert_eq!(session.plan().num_chunks, 3);
        assert_eq!(session.plan().total, 10_000);
    }

    #[test]
    fn invalid_options_are_rejected_before_open() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = mixed_data(100);
        for options in [
            OffloadOptions::default(),
            OffloadOptions {
                total_size: 100,
                level: 12,
                ..OffloadOptions::default()
            },
            OffloadOptions {
                total_size: 100,
                strategy: SubmissionStrategy::Pipelined { depth: 0 },
                ..OffloadOptions::default()
            },
        ] {
            let result =
                OffloadSession::prepare(&accel, TaskKind::CompressDeflate, &mut &data[..], options);
            assert!(matches!(
                result,
                Err(CozipOffloadError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn task_limit_failure_releases_every_resource() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = mixed_data(GEN2_MAX_TASKS + 1);
        let result = OffloadSession::prepare(
            &accel,
            TaskKind::CompressDeflate,
            &mut &data[..],
            OffloadOptions {
                total_size: data.len(),
                chunk_size: 1,
                ..OffloadOptions::default()
            },
        );
        assert!(matches!(
            result,
            Err(CozipOffloadError::ResourceExhaustion(_))
        ));

        let info = accel.list_devices()[0].clone();
        accel
            .open_device(&info)
            .expect("device should be closed after failed setup");
    }

    #[test]
    fn dropping_a_session_releases_the_device() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = mixed_data(50_000);
        let mut first = session(
            &accel,
            TaskKind::CompressDeflate,
            &data,
            8 * 1024,
            SubmissionStrategy::Eager,
            WaitMode::BusyPoll,
        );
        first.run().expect("run should succeed");
        drop(first);

        let second = OffloadSession::prepare(
            &accel,
            TaskKind::CompressDeflate,
            &mut &data[..],
            OffloadOptions {
                total_size: data.len(),
                chunk_size: 8 * 1024,
                ..OffloadOptions::default()
            },
        );
        assert!(second.is_ok());
    }

    #[test]
    fn registration_failure_closes_the_device() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2])
            .with_faults(0, FaultPlan::default().max_registered_bytes(1024));
        let data = mixed_data(50_000);
        let result = OffloadSession::prepare(
            &accel,
            TaskKind::CompressDeflate,
            &mut &data[..],
            OffloadOptions {
                total_size: data.len(),
                chunk_size: 8 * 1024,
                ..OffloadOptions::default()
            },
        );
        assert!(matches!(
            result,
            Err(CozipOffloadError::ResourceExhaustion(_))
        ));

        let info = accel.list_devices()[0].clone();
        accel
            .open_device(&info)
            .expect("device should be closed after failed setup");
    }
}
