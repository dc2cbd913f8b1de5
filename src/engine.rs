use super::*;

pub(crate) struct Completion {
    pub(crate) task_id: TaskId,
    pub(crate) result: Result<TaskOutput, TaskError>,
}

/// Completion queue fed by device engines, plus the wake signal used by the
/// notification wait mode.
pub(crate) struct CompletionQueue {
    events: Mutex<VecDeque<Completion>>,
    signaled: Mutex<bool>,
    wake: Condvar,
}

impl CompletionQueue {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            signaled: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, completion: Completion) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(completion);
        self.notify();
    }

    pub(crate) fn pop(&self) -> Option<Completion> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn has_events(&self) -> bool {
        !self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    fn notify(&self) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *signaled = true;
        self.wake.notify_all();
    }

    fn arm(&self) {
        if self.has_events() {
            self.notify();
        }
    }

    pub(crate) fn wait(&self, timeout: Duration) {
        if let Ok(signaled) = self.signaled.lock() {
            if !*signaled {
                let _ = self.wake.wait_timeout(signaled, timeout);
            }
        }
    }

    fn clear(&self) {
        if let Ok(mut signaled) = self.signaled.lock() {
            *signaled = false;
        }
    }
}

/// Source of completion events for the contexts connected to it. Only the
/// thread that owns the context calls `progress`.
pub struct ProgressEngine {
    queue: Arc<CompletionQueue>,
}

impl Default for ProgressEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressEngine {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(CompletionQueue::new()),
        }
    }

    pub(crate) fn queue(&self) -> Arc<CompletionQueue> {
        Arc::clone(&self.queue)
    }

    /// Delivers at most one ready completion to `ctx`. Returns whether one
    /// was delivered.
    pub fn progress<H: TaskHandler>(
        &self,
        ctx: &mut OffloadContext<H>,
    ) -> Result<bool, CozipOffloadError> {
        if !ctx.is_connected_to(&self.queue) {
            return Err(CozipOffloadError::NotConnected);
        }
        match self.queue.pop() {
            Some(completion) => {
                ctx.dispatch(completion);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Arms the wake signal. It fires right away if completions are queued.
    pub fn request_notification(&self) {
        self.queue.arm();
    }

    pub fn wait_notification(&self, timeout: Duration) {
        self.queue.wait(timeout);
    }

    pub fn clear_notification(&self) {
        self.queue.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmissionStrategy {
    /// Allocate every task up front and submit them in one batch.
    #[default]
    Eager,
    /// Keep `depth` tasks in flight, refilling from each completion.
    Pipelined { depth: usize },
}

impl FromStr for SubmissionStrategy {
    type Err = CozipOffloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "eager" | "batch" => Ok(Self::Eager),
            "pipelined" => Ok(Self::Pipelined {
                depth: DEFAULT_PIPELINE_DEPTH,
            }),
            _ => Err(CozipOffloadError::InvalidConfiguration(
                "strategy must be eager or pipelined",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    #[default]
    BusyPoll,
    Notify,
}

impl FromStr for WaitMode {
    type Err = CozipOffloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "busy-poll" | "poll" => Ok(Self::BusyPoll),
            "notify" | "event" => Ok(Self::Notify),
            _ => Err(CozipOffloadError::InvalidConfiguration(
                "wait mode must be busy-poll or notify",
            )),
        }
    }
}

/// Chunk with its buffers, waiting to become a task.
#[derive(Debug)]
pub struct PreparedChunk {
    pub chunk: Chunk,
    pub input: BufferHandle,
    pub output: BufferHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResult {
    Pending,
    Done {
        output_offset: usize,
        output_len: usize,
        crc32: u32,
        adler32: u32,
    },
    Failed(TaskError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OffloadTimings {
    pub submit_start: Option<Instant>,
    pub submit_end: Option<Instant>,
    pub drain_end: Option<Instant>,
    pub callbacks_done: Option<Instant>,
    pub running_at: Option<Instant>,
    pub stop_requested: Option<Instant>,
    pub idle_at: Option<Instant>,
}

impl OffloadTimings {
    /// Named phase durations in report order.
    pub fn phases(&self) -> Vec<(&'static str, Duration)> {
        vec![
            (
                "overall_submission_elapsed",
                span(self.drain_end, self.submit_start),
            ),
            (
                "task_submission_elapsed",
                span(self.submit_end, self.submit_start),
            ),
            ("busy_wait_elapsed", span(self.drain_end, self.submit_end)),
            ("cb_elapsed", span(self.callbacks_done, self.submit_start)),
            ("cb_end_elapsed", span(self.drain_end, self.callbacks_done)),
            ("ctx_stop_elapsed", span(self.idle_at, self.stop_requested)),
        ]
    }
}

/// Task handler that offloads a list of chunks and collects one result slot
/// per chunk.
#[derive(Debug)]
pub struct ChunkedOffload {
    strategy: SubmissionStrategy,
    pending: VecDeque<PreparedChunk>,
    allocated: Vec<(usize, TaskId)>,
    slots: Vec<ChunkResult>,
    remaining: usize,
    timings: OffloadTimings,
}

impl ChunkedOffload {
    pub fn new(strategy: SubmissionStrategy, chunks: Vec<PreparedChunk>) -> Self {
        let count = chunks.len();
        Self {
            strategy,
            pending: chunks.into(),
            allocated: Vec::new(),
            slots: vec![ChunkResult::Pending; count],
            remaining: count,
            timings: OffloadTimings::default(),
        }
    }

    pub fn strategy(&self) -> SubmissionStrategy {
        self.strategy
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn results(&self) -> &[ChunkResult] {
        &self.slots
    }

    pub fn completed_chunks(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, ChunkResult::Done { .. }))
            .count()
    }

    pub fn failed_chunks(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, ChunkResult::Failed(_)))
            .count()
    }

    /// The first failed chunk as an error.
    pub fn check(&self) -> Result<(), CozipOffloadError> {
        for (index, slot) in self.slots.iter().enumerate() {
            if let ChunkResult::Failed(source) = slot {
                return Err(CozipOffloadError::TaskFailed {
                    index,
                    source: source.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn timings(&self) -> &OffloadTimings {
        &self.timings
    }

    fn is_drained(&self, state: ContextState) -> bool {
        match self.strategy {
            SubmissionStrategy::Eager => self.remaining == 0,
            SubmissionStrategy::Pipelined { .. } => {
                self.remaining == 0 && state == ContextState::Idle
            }
        }
    }

    /// Allocates a task for every pending chunk. Chunks whose allocation
    /// fails are recorded as failed.
    fn allocate_all(&mut self, ctx: &mut ContextCore) {
        while let Some(prepared) = self.pending.pop_front() {
            let index = prepared.chunk.index;
            match ctx.alloc_task(index, prepared.input, prepared.output) {
                Ok(id) => self.allocated.push((index, id)),
                Err(error) => self.finish(ctx, index, ChunkResult::Failed(error)),
            }
        }
    }

    fn submit_allocated(&mut self, ctx: &mut ContextCore) {
        for (index, id) in std::mem::take(&mut self.allocated) {
            if let Err(error) = ctx.submit(id) {
                self.finish(ctx, index, ChunkResult::Failed(error));
            }
        }
    }

    /// Offloads the next chunk that has not been submitted yet. Returns
    /// false once nothing is left to submit.
    fn offload_next(&mut self, ctx: &mut ContextCore) -> bool {
        while let Some(prepared) = self.pending.pop_front() {
            let index = prepared.chunk.index;
            if ctx.state() != ContextState::Running {
                self.finish(ctx, index, ChunkResult::Failed(TaskError::Flushed));
                continue;
            }
            let submitted = ctx
                .alloc_task(index, prepared.input, prepared.output)
                .and_then(|id| ctx.submit(id));
            match submitted {
                Ok(()) => return true,
                Err(error) => self.finish(ctx, index, ChunkResult::Failed(error)),
            }
        }
        false
    }

    fn finish(&mut self, ctx: &mut ContextCore, index: usize, result: ChunkResult) {
        if let ChunkResult::Failed(error) = &result {
            error!(chunk = index, %error, kind = %ctx.kind(), "chunk failed");
        }
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = result;
        }
        self.remaining = self.remaining.saturating_sub(1);

        if self.remaining == 0 {
            self.timings.callbacks_done = Some(Instant::now());
            if matches!(self.strategy, SubmissionStrategy::Pipelined { .. })
                && ctx.state() == ContextState::Running
            {
                if let Err(error) = ctx.stop() {
                    warn!(%error, "stopping drained context failed");
                }
            }
        }
    }

    fn refill(&mut self, ctx: &mut ContextCore) {
        if matches!(self.strategy, SubmissionStrategy::Pipelined { .. }) {
            self.offload_next(ctx);
        }
    }
}

impl TaskHandler for ChunkedOffload {
    fn on_state_changed(
        &mut self,
        ctx: &mut ContextCore,
        previous: ContextState,
        next: ContextState,
    ) {
        let now = Instant::now();
        match next {
            ContextState::Running => {
                self.timings.running_at = Some(now);
                if let SubmissionStrategy::Pipelined { depth } = self.strategy {
                    for _ in 0..depth.max(1) {
                        if !self.offload_next(ctx) {
                            break;
                        }
                    }
                    if self.remaining == 0 && ctx.state() == ContextState::Running {
                        if let Err(error) = ctx.stop() {
                            warn!(%error, "stopping empty context failed");
                        }
                    }
                }
            }
            ContextState::Stopping => {
                self.timings.stop_requested = Some(now);
            }
            ContextState::Idle if previous == ContextState::Stopping => {
                self.timings.idle_at = Some(now);
            }
            _ => {}
        }
    }

    fn on_completed(&mut self, ctx: &mut ContextCore, task: Task, output: TaskOutput) {
        let index = task.correlation();
        let output_offset = task.output().offset();
        ctx.free_task(task);

        self.refill(ctx);
        self.finish(
            ctx,
            index,
            ChunkResult::Done {
                output_offset,
                output_len: output.len,
                crc32: output.crc32,
                adler32: output.adler32,
            },
        );
    }

    fn on_error(&mut self, ctx: &mut ContextCore, task: Task, error: TaskError) {
        let index = task.correlation();
        ctx.free_task(task);

        if error != TaskError::Flushed {
            self.refill(ctx);
        }
        self.finish(ctx, index, ChunkResult::Failed(error));
    }
}

/// Allocates every task ahead of submission. Eager mode only; the context
/// must already be running.
pub fn prepare_eager(ctx: &mut OffloadContext<ChunkedOffload>) -> Result<(), CozipOffloadError> {
    if ctx.state() != ContextState::Running {
        return Err(CozipOffloadError::InvalidState(
            "eager tasks are allocated on a running context",
        ));
    }
    ctx.with_handler(|core, handler| {
        if handler.strategy == SubmissionStrategy::Eager {
            handler.allocate_all(core);
        }
    })
}

/// Starts offloading. Eager mode submits every allocated task; pipelined
/// mode starts the context and lets the running callback submit the first
/// window. A context that refuses to start fails the whole call.
pub fn submit_all(ctx: &mut OffloadContext<ChunkedOffload>) -> Result<(), CozipOffloadError> {
    let strategy = ctx
        .handler()
        .map(ChunkedOffload::strategy)
        .ok_or(CozipOffloadError::InvalidState("task callbacks are not configured"))?;
    let submit_start = Instant::now();

    match strategy {
        SubmissionStrategy::Eager => {
            ctx.with_handler(|core, handler| {
                handler.timings.submit_start = Some(submit_start);
                handler.allocate_all(core);
                handler.submit_allocated(core);
                handler.timings.submit_end = Some(Instant::now());
            })?;
        }
        SubmissionStrategy::Pipelined { .. } => {
            if let Some(handler) = ctx.handler_mut() {
                handler.timings.submit_start = Some(submit_start);
            }
            ctx.start()?;
            if let Some(handler) = ctx.handler_mut() {
                handler.timings.submit_end = Some(Instant::now());
            }
        }
    }
    Ok(())
}

/// Drives the engine until every chunk has a result. Pipelined runs also
/// wait for the context to return to idle.
pub fn poll_until_drained(
    engine: &ProgressEngine,
    ctx: &mut OffloadContext<ChunkedOffload>,
    wait: WaitMode,
) -> Result<(), CozipOffloadError> {
    let drained = |ctx: &OffloadContext<ChunkedOffload>| {
        ctx.handler()
            .is_none_or(|handler| handler.is_drained(ctx.state()))
    };

    match wait {
        WaitMode::BusyPoll => {
            while !drained(&*ctx) {
                if !engine.progress(ctx)? {
                    std::hint::spin_loop();
                }
            }
        }
        WaitMode::Notify => {
            while !drained(&*ctx) {
                engine.request_notification();
                engine.wait_notification(Duration::from_millis(NOTIFY_WAIT_MS));
                engine.clear_notification();
                while engine.progress(ctx)? {}
            }
        }
    }

    if let Some(handler) = ctx.handler_mut() {
        handler.timings.drain_end = Some(Instant::now());
        info!(
            completed = handler.completed_chunks(),
            failed = handler.failed_chunks(),
            "offload drained"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rig {
        engine: ProgressEngine,
        ctx: OffloadContext<ChunkedOffload>,
        input: MemoryRegion,
        output: MemoryRegion,
        inventory: BufferInventory,
        plan: ChunkPlan,
    }

    fn patterned_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i as u32 * 31 + 7) % 251) as u8).collect()
    }

    fn rig(accel: &SoftAccelerator, data: &[u8], capacity: usize) -> Rig {
        let mut ctx = OffloadContext::open(accel, TaskKind::CompressDeflate)
            .expect("open should succeed");
        let plan = plan(data.len(), capacity).expect("plan should succeed");
        let out_stride = deflate_bound(plan.chunk_capacity);

        let mut staged = vec![0u8; plan.num_chunks * plan.chunk_capacity];
        staged[..data.len()].copy_from_slice(data);
        let input = MemoryRegion::register(
            Arc::new(Mutex::new(staged)),
            plan.num_chunks * plan.chunk_capacity,
            ctx.device(),
            LOCAL_READ,
        )
        .expect("input region");
        let output = MemoryRegion::register(
            Arc::new(Mutex::new(vec![0u8; plan.num_chunks * out_stride])),
            plan.num_chunks * out_stride,
            ctx.device(),
            LOCAL_READ_WRITE,
        )
        .expect("output region");
        let inventory =
            BufferInventory::new(plan.num_chunks * 2, ctx.device()).expect("inventory");
        let engine = ProgressEngine::new();
        ctx.connect(&engine).expect("connect should succeed");

        Rig {
            engine,
            ctx,
            input,
            output,
            inventory,
            plan,
        }
    }

    impl Rig {
        fn configure(&mut self, strategy: SubmissionStrategy, max_tasks: usize) {
            let out_stride = deflate_bound(self.plan.chunk_capacity);
            let prepared = self
                .plan
                .chunks()
                .map(|chunk| PreparedChunk {
                    chunk,
                    input: self
                        .inventory
                        .derive(
                            &self.input,
                            chunk.index,
                            self.plan.chunk_capacity,
                            chunk.len,
                            LOCAL_READ,
                        )
                        .expect("input buffer"),
                    output: self
                        .inventory
                        .derive(&self.output, chunk.index, out_stride, out_stride, LOCAL_WRITE)
                        .expect("output buffer"),
                })
                .collect();
            self.ctx
                .set_task_conf(ChunkedOffload::new(strategy, prepared), max_tasks)
                .expect("task conf should succeed");
        }

        fn inflate_chunk(&self, index: usize) -> Vec<u8> {
            let Some(ChunkResult::Done {
                output_offset,
                output_len,
                ..
            }) = self.ctx.handler().map(|h| h.results()[index].clone())
            else {
                panic!("chunk {index} did not complete");
            };
            let compressed = self
                .output
                .read_at(output_offset, output_len)
                .expect("read output");
            let mut restored = Vec::new();
            std::io::Read::read_to_end(
                &mut flate2::read::DeflateDecoder::new(compressed.as_slice()),
                &mut restored,
            )
            .expect("inflate should succeed");
            restored
        }
    }

    #[test]
    fn eager_batch_compresses_every_chunk() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = patterned_data(10_000);
        let mut rig = rig(&accel, &data, 4096);
        rig.configure(SubmissionStrategy::Eager, rig.plan.num_chunks);

        rig.ctx.start().expect("start should succeed");
        prepare_eager(&mut rig.ctx).expect("prepare should succeed");
        submit_all(&mut rig.ctx).expect("submit should succeed");
        poll_until_drained(&rig.engine, &mut rig.ctx, WaitMode::BusyPoll)
            .expect("drain should succeed");

        let handler = rig.ctx.handler().expect("handler bound");
        assert_eq!(handler.remaining(), 0);
        assert_eq!(handler.completed_chunks(), 3);
        assert_eq!(rig.ctx.state(), ContextState::Running);

        let mut restored = Vec::new();
        for chunk in rig.plan.chunks() {
            restored.extend(rig.inflate_chunk(chunk.index));
        }
        assert_eq!(restored, data);

        rig.ctx.stop().expect("stop should succeed");
        assert_eq!(rig.ctx.state(), ContextState::Idle);
        let phases = rig
            .ctx
            .handler()
            .expect("handler bound")
            .timings()
            .phases();
        assert_eq!(phases.len(), 6);
        assert_eq!(phases[0].0, "overall_submission_elapsed");
    }

    #[test]
    fn pipelined_run_survives_a_failed_chunk() {
        const KIB: usize = 1024;
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2])
            .with_faults(0, FaultPlan::default().fail_chunk(1));
        let data = patterned_data(300 * KIB);
        let mut rig = rig(&accel, &data, 128 * KIB);
        assert_eq!(rig.plan.num_chunks, 3);
        let lengths: Vec<usize> = rig.plan.chunks().map(|chunk| chunk.len).collect();
        assert_eq!(lengths, vec![128 * KIB, 128 * KIB, 44 * KIB]);

        rig.configure(SubmissionStrategy::Pipelined { depth: 1 }, 1);
        submit_all(&mut rig.ctx).expect("submit should succeed");
        poll_until_drained(&rig.engine, &mut rig.ctx, WaitMode::BusyPoll)
            .expect("drain should succeed");

        let handler = rig.ctx.handler().expect("handler bound");
        assert_eq!(handler.remaining(), 0);
        assert_eq!(handler.failed_chunks(), 1);
        assert!(matches!(handler.results()[0], ChunkResult::Done { .. }));
        assert_eq!(
            handler.results()[1],
            ChunkResult::Failed(TaskError::Injected)
        );
        assert!(matches!(handler.results()[2], ChunkResult::Done { .. }));
        assert!(matches!(
            handler.check(),
            Err(CozipOffloadError::TaskFailed {
                index: 1,
                source: TaskError::Injected
            })
        ));
        assert_eq!(rig.ctx.state(), ContextState::Idle);
        assert_eq!(
            rig.ctx.transitions(),
            &[
                ContextState::Idle,
                ContextState::Starting,
                ContextState::Running,
                ContextState::Stopping,
                ContextState::Idle,
            ]
        );

        assert_eq!(rig.inflate_chunk(0), &data[..128 * KIB]);
        assert_eq!(rig.inflate_chunk(2), &data[256 * KIB..]);
        assert_eq!(rig.inventory.in_use(), 0);
    }

    #[test]
    fn notify_mode_drains_a_deeper_pipeline() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = patterned_data(64 * 1024 + 17);
        let mut rig = rig(&accel, &data, 8 * 1024);
        rig.configure(SubmissionStrategy::Pipelined { depth: 3 }, 3);

        submit_all(&mut rig.ctx).expect("submit should succeed");
        poll_until_drained(&rig.engine, &mut rig.ctx, WaitMode::Notify)
            .expect("drain should succeed");

        let handler = rig.ctx.handler().expect("handler bound");
        assert_eq!(handler.completed_chunks(), rig.plan.num_chunks);
        assert_eq!(rig.ctx.state(), ContextState::Idle);
        let mut restored = Vec::new();
        for chunk in rig.plan.chunks() {
            restored.extend(rig.inflate_chunk(chunk.index));
        }
        assert_eq!(restored, data);
    }

    #[test]
    fn allocation_failure_only_fails_that_chunk() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = patterned_data(4 * 1000);
        let mut rig = rig(&accel, &data, 1000);
        rig.configure(SubmissionStrategy::Eager, 3);

        rig.ctx.start().expect("start should succeed");
        prepare_eager(&mut rig.ctx).expect("prepare should succeed");
        submit_all(&mut rig.ctx).expect("submit should succeed");
        poll_until_drained(&rig.engine, &mut rig.ctx, WaitMode::Notify)
            .expect("drain should succeed");

        let handler = rig.ctx.handler().expect("handler bound");
        assert_eq!(handler.remaining(), 0);
        assert_eq!(handler.completed_chunks(), 3);
        assert_eq!(
            handler.results()[3],
            ChunkResult::Failed(TaskError::AllocFailed)
        );
    }

    #[test]
    fn progress_rejects_foreign_engine() {
        let accel = SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]);
        let data = patterned_data(100);
        let mut rig = rig(&accel, &data, 100);
        rig.configure(SubmissionStrategy::Eager, 1);
        let other = ProgressEngine::new();
        assert!(matches!(
            other.progress(&mut rig.ctx),
            Err(CozipOffloadError::NotConnected)
        ));
    }
}
