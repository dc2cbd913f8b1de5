use super::*;

use crate::device::DeviceJob;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Allocated,
    Submitted,
    Completed(Result<(), TaskError>),
}

/// One accelerator operation bound to an input and an output buffer.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    correlation: usize,
    input: BufferHandle,
    output: BufferHandle,
    state: TaskState,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Index of the chunk this task works on.
    pub fn correlation(&self) -> usize {
        self.correlation
    }

    pub fn input(&self) -> &BufferHandle {
        &self.input
    }

    pub fn output(&self) -> &BufferHandle {
        &self.output
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }
}

/// Callbacks bound to a context. They run on the thread that drives the
/// progress engine and receive the context core so they can allocate,
/// submit or stop without re-entering the callback machinery.
pub trait TaskHandler {
    fn on_state_changed(
        &mut self,
        _ctx: &mut ContextCore,
        _previous: ContextState,
        _next: ContextState,
    ) {
    }

    fn on_completed(&mut self, ctx: &mut ContextCore, task: Task, output: TaskOutput);

    fn on_error(&mut self, ctx: &mut ContextCore, task: Task, error: TaskError);
}

/// Context state shared with callbacks.
pub struct ContextCore {
    kind: TaskKind,
    level: u32,
    device: AcceleratorDevice,
    state: ContextState,
    transitions: Vec<ContextState>,
    has_run: bool,
    max_tasks: usize,
    connection: Option<Arc<CompletionQueue>>,
    tasks: BTreeMap<TaskId, Task>,
    next_task_id: TaskId,
    in_flight: usize,
    flushing: Arc<AtomicBool>,
    events: VecDeque<(ContextState, ContextState)>,
}

impl ContextCore {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn device(&self) -> &AcceleratorDevice {
        &self.device
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn allocated(&self) -> usize {
        self.tasks.len()
    }

    pub fn set_compression_level(&mut self, level: u32) {
        self.level = level.min(9);
    }

    fn transition(&mut self, next: ContextState) -> Result<(), CozipOffloadError> {
        let allowed = matches!(
            (self.state, next),
            (ContextState::Idle, ContextState::Starting)
                | (ContextState::Starting, ContextState::Running)
                | (ContextState::Running, ContextState::Stopping)
                | (ContextState::Stopping, ContextState::Idle)
        );
        if !allowed {
            return Err(CozipOffloadError::Internal("illegal context transition"));
        }

        let previous = self.state;
        self.state = next;
        self.transitions.push(next);
        self.events.push_back((previous, next));
        debug!(kind = %self.kind, ?previous, ?next, "context state changed");
        Ok(())
    }

    /// Allocates a task for chunk `correlation`. The buffers are released if
    /// allocation fails.
    pub fn alloc_task(
        &mut self,
        correlation: usize,
        input: BufferHandle,
        output: BufferHandle,
    ) -> Result<TaskId, TaskError> {
        if self.state != ContextState::Running {
            return Err(TaskError::AllocFailed);
        }
        if self.tasks.len() >= self.max_tasks {
            return Err(TaskError::AllocFailed);
        }

        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.insert(
            id,
            Task {
                id,
                correlation,
                input,
                output,
                state: TaskState::Allocated,
            },
        );
        Ok(id)
    }

    /// Hands an allocated task to the device. A rejected task is freed.
    pub fn submit(&mut self, id: TaskId) -> Result<(), TaskError> {
        match self.tasks.get(&id).map(|task| task.state == TaskState::Allocated) {
            None => return Err(TaskError::SubmitRejected("unknown task")),
            Some(false) => return Err(TaskError::SubmitRejected("task was already submitted")),
            Some(true) => {}
        }

        let sink = match (self.state, self.connection.as_ref()) {
            (ContextState::Running, Some(sink)) => Arc::clone(sink),
            (ContextState::Running, None) => {
                self.tasks.remove(&id);
                return Err(TaskError::SubmitRejected("context has no completion source"));
            }
            _ => {
                self.tasks.remove(&id);
                return Err(TaskError::SubmitRejected("context is not running"));
            }
        };

        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(TaskError::SubmitRejected("unknown task"));
        };
        let job = DeviceJob {
            correlation: task.correlation,
            task_id: id,
            kind: self.kind,
            input: task.input.view(),
            output: task.output.view(),
            level: self.level,
            flushing: Arc::clone(&self.flushing),
            sink,
        };
        task.state = TaskState::Submitted;

        match self.device.execute(job) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(())
            }
            Err(error) => {
                self.tasks.remove(&id);
                Err(error)
            }
        }
    }

    pub fn free_task(&mut self, task: Task) {
        debug_assert!(matches!(task.state, TaskState::Completed(_)));
        drop(task);
    }

    /// Stops a running context. Tasks still in flight come back through the
    /// error callback with `TaskError::Flushed` before the context is idle.
    pub fn stop(&mut self) -> Result<(), CozipOffloadError> {
        match self.state {
            ContextState::Idle => Err(CozipOffloadError::InvalidState("context is idle")),
            ContextState::Starting => Err(CozipOffloadError::InvalidState("context is starting")),
            ContextState::Stopping => Err(CozipOffloadError::InvalidState(
                "context is already stopping",
            )),
            ContextState::Running => {
                self.transition(ContextState::Stopping)?;
                self.flushing.store(true, Ordering::Release);
                self.flush_allocated();
                if self.in_flight == 0 {
                    self.transition(ContextState::Idle)?;
                }
                Ok(())
            }
        }
    }

    fn flush_allocated(&mut self) {
        let Some(sink) = self.connection.as_ref() else {
            return;
        };
        let pending: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Allocated)
            .map(|task| task.id)
            .collect();

        for id in pending {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.state = TaskState::Submitted;
            }
            self.in_flight += 1;
            sink.push(Completion {
                task_id: id,
                result: Err(TaskError::Flushed),
            });
        }
    }

    fn take_completed(
        &mut self,
        completion: Completion,
    ) -> Option<(Task, Result<TaskOutput, TaskError>)> {
        let mut task = self.tasks.remove(&completion.task_id)?;
        self.in_flight = self.in_flight.saturating_sub(1);
        task.state = TaskState::Completed(match &completion.result {
            Ok(_) => Ok(()),
            Err(error) => Err(error.clone()),
        });
        Some((task, completion.result))
    }
}

/// One offload session bound to a device and a task kind.
pub struct OffloadContext<H: TaskHandler> {
    core: ContextCore,
    handler: Option<H>,
}

impl<H: TaskHandler> OffloadContext<H> {
    /// Opens the first device that supports `kind` and accepts the open.
    pub fn open(accelerator: &dyn Accelerator, kind: TaskKind) -> Result<Self, CozipOffloadError> {
        for info in accelerator.list_devices() {
            if !info.supports(kind) {
                continue;
            }
            match accelerator.open_device(&info) {
                Ok(device) => {
                    debug!(device = %info.name, %kind, "context created");
                    return Ok(Self {
                        core: ContextCore {
                            kind,
                            level: DEFAULT_COMPRESSION_LEVEL,
                            device,
                            state: ContextState::Idle,
                            transitions: vec![ContextState::Idle],
                            has_run: false,
                            max_tasks: 0,
                            connection: None,
                            tasks: BTreeMap::new(),
                            next_task_id: 0,
                            in_flight: 0,
                            flushing: Arc::new(AtomicBool::new(false)),
                            events: VecDeque::new(),
                        },
                        handler: None,
                    });
                }
                Err(error) => {
                    debug!(device = %info.name, %error, "device open failed, trying next");
                }
            }
        }
        Err(CozipOffloadError::DeviceNotFound(kind.name()))
    }

    /// Binds callbacks and the task limit.
    pub fn set_task_conf(&mut self, handler: H, max_tasks: usize) -> Result<(), CozipOffloadError> {
        if self.core.state != ContextState::Idle {
            return Err(CozipOffloadError::InvalidState(
                "task configuration requires an idle context",
            ));
        }
        if max_tasks == 0 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "max tasks must be greater than 0",
            ));
        }
        if max_tasks > self.core.device.info().max_concurrent_tasks() {
            return Err(CozipOffloadError::ResourceExhaustion(
                "device cannot hold that many tasks",
            ));
        }
        self.core.max_tasks = max_tasks;
        self.handler = Some(handler);
        Ok(())
    }

    pub fn connect(&mut self, engine: &ProgressEngine) -> Result<(), CozipOffloadError> {
        if self.core.state != ContextState::Idle {
            return Err(CozipOffloadError::InvalidState(
                "connection requires an idle context",
            ));
        }
        self.core.connection = Some(engine.queue());
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), CozipOffloadError> {
        if self.core.state != ContextState::Idle {
            return Err(CozipOffloadError::InvalidState("context is not idle"));
        }
        if self.core.has_run {
            return Err(CozipOffloadError::InvalidState(
                "context already entered running",
            ));
        }
        if self.handler.is_none() {
            return Err(CozipOffloadError::InvalidState(
                "task callbacks are not configured",
            ));
        }
        if self.core.connection.is_none() {
            return Err(CozipOffloadError::InvalidState(
                "context is not connected to a progress engine",
            ));
        }

        self.core.flushing.store(false, Ordering::Release);
        self.core.transition(ContextState::Starting)?;
        self.core.transition(ContextState::Running)?;
        self.core.has_run = true;
        self.deliver_events();
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), CozipOffloadError> {
        self.core.stop()?;
        self.deliver_events();
        Ok(())
    }

    pub fn state(&self) -> ContextState {
        self.core.state
    }

    /// Every state the context has been in, starting with `Idle`.
    pub fn transitions(&self) -> &[ContextState] {
        &self.core.transitions
    }

    pub fn kind(&self) -> TaskKind {
        self.core.kind
    }

    pub fn device(&self) -> &AcceleratorDevice {
        &self.core.device
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.core.device.info()
    }

    pub fn in_flight(&self) -> usize {
        self.core.in_flight
    }

    pub fn set_compression_level(&mut self, level: u32) {
        self.core.set_compression_level(level);
    }

    pub fn handler(&self) -> Option<&H> {
        self.handler.as_ref()
    }

    pub fn handler_mut(&mut self) -> Option<&mut H> {
        self.handler.as_mut()
    }

    /// Runs `f` with both the core and the handler, then delivers any state
    /// changes it caused.
    pub fn with_handler<R>(
        &mut self,
        f: impl FnOnce(&mut ContextCore, &mut H) -> R,
    ) -> Result<R, CozipOffloadError> {
        let mut handler = self.handler.take().ok_or(CozipOffloadError::InvalidState(
            "task callbacks are not configured",
        ))?;
        let result = f(&mut self.core, &mut handler);
        self.handler = Some(handler);
        self.deliver_events();
        Ok(result)
    }

    pub(crate) fn is_connected_to(&self, queue: &Arc<CompletionQueue>) -> bool {
        self.core
            .connection
            .as_ref()
            .is_some_and(|connection| Arc::ptr_eq(connection, queue))
    }

    pub(crate) fn dispatch(&mut self, completion: Completion) {
        let Some((task, result)) = self.core.take_completed(completion) else {
            warn!("completion for unknown task dropped");
            return;
        };

        if let Some(mut handler) = self.handler.take() {
            match result {
                Ok(output) => handler.on_completed(&mut self.core, task, output),
                Err(error) => handler.on_error(&mut self.core, task, error),
            }
            self.handler = Some(handler);
        }

        if self.core.state == ContextState::Stopping && self.core.in_flight == 0 {
            if let Err(error) = self.core.transition(ContextState::Idle) {
                error!(%error, "context failed to reach idle");
            }
        }
        self.deliver_events();
    }

    fn deliver_events(&mut self) {
        while let Some((previous, next)) = self.core.events.pop_front() {
            if let Some(mut handler) = self.handler.take() {
                handler.on_state_changed(&mut self.core, previous, next);
                self.handler = Some(handler);
            }
        }
    }

    /// Stops the context if needed, drains every outstanding completion and
    /// hands back the handler. The context is idle afterwards.
    pub fn teardown(&mut self) -> Result<Option<H>, CozipOffloadError> {
        if self.core.state == ContextState::Running {
            self.stop()?;
        }

        if self.core.in_flight > 0 {
            let queue = self
                .core
                .connection
                .as_ref()
                .map(Arc::clone)
                .ok_or(CozipOffloadError::NotConnected)?;
            while self.core.in_flight > 0 {
                match queue.pop() {
                    Some(completion) => self.dispatch(completion),
                    None => queue.wait(Duration::from_millis(NOTIFY_WAIT_MS)),
                }
            }
        }

        self.deliver_events();
        self.core.tasks.clear();
        Ok(self.handler.take())
    }

    /// Tears the context down and returns its handler.
    pub fn destroy(mut self) -> Result<Option<H>, CozipOffloadError> {
        let handler = self.teardown()?;
        if self.core.state != ContextState::Idle {
            return Err(CozipOffloadError::InvalidState(
                "context must be idle before destroy",
            ));
        }
        Ok(handler)
    }
}

impl<H: TaskHandler> Drop for OffloadContext<H> {
    fn drop(&mut self) {
        if let Err(error) = self.teardown() {
            warn!(%error, "context teardown failed");
        }
        debug!(kind = %self.core.kind, "context destroyed");
    }
}
