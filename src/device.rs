use super::*;

use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::inventory::BufferView;

/// Accelerator hardware generation. Sets the per-task buffer limit and which
/// task kinds the device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceGeneration {
    Gen2,
    Gen3,
}

impl DeviceGeneration {
    pub fn supports(self, kind: TaskKind) -> bool {
        match (self, kind) {
            (Self::Gen2, TaskKind::CompressDeflate) => true,
            (Self::Gen2, TaskKind::DecompressDeflate) => true,
            (Self::Gen2, TaskKind::DecompressLz4) => false,
            (Self::Gen3, TaskKind::CompressDeflate) => false,
            (Self::Gen3, TaskKind::DecompressDeflate) => true,
            (Self::Gen3, TaskKind::DecompressLz4) => true,
        }
    }

    pub fn max_buffer_size(self) -> usize {
        match self {
            Self::Gen2 => GEN2_MAX_BUFFER_SIZE,
            Self::Gen3 => GEN3_MAX_BUFFER_SIZE,
        }
    }

    pub fn max_tasks(self) -> usize {
        match self {
            Self::Gen2 => GEN2_MAX_TASKS,
            Self::Gen3 => GEN3_MAX_TASKS,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Gen2 => 2,
            Self::Gen3 => 3,
        }
    }
}

impl TryFrom<u8> for DeviceGeneration {
    type Error = CozipOffloadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Gen2),
            3 => Ok(Self::Gen3),
            _ => Err(CozipOffloadError::InvalidConfiguration(
                "device generation must be 2 or 3",
            )),
        }
    }
}

/// Capability record for one enumerated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: usize,
    pub name: String,
    pub generation: DeviceGeneration,
}

impl DeviceInfo {
    pub fn supports(&self, kind: TaskKind) -> bool {
        self.generation.supports(kind)
    }

    pub fn max_buffer_size(&self, kind: TaskKind) -> Option<usize> {
        self.supports(kind)
            .then(|| self.generation.max_buffer_size())
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.generation.max_tasks()
    }
}

/// Result of a task the device finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutput {
    pub len: usize,
    pub crc32: u32,
    pub adler32: u32,
}

/// Device-side faults used to exercise error paths.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_chunks: BTreeSet<usize>,
    pub refuse_open: bool,
    pub max_registered_bytes: Option<usize>,
    pub max_inventory_buffers: Option<usize>,
}

impl FaultPlan {
    pub fn fail_chunk(mut self, index: usize) -> Self {
        self.fail_chunks.insert(index);
        self
    }

    pub fn refuse_open(mut self) -> Self {
        self.refuse_open = true;
        self
    }

    pub fn max_registered_bytes(mut self, limit: usize) -> Self {
        self.max_registered_bytes = Some(limit);
        self
    }

    pub fn max_inventory_buffers(mut self, limit: usize) -> Self {
        self.max_inventory_buffers = Some(limit);
        self
    }
}

/// Device enumeration and open, the boundary to the accelerator SDK.
pub trait Accelerator: Send + Sync {
    fn list_devices(&self) -> Vec<DeviceInfo>;
    fn open_device(&self, info: &DeviceInfo) -> Result<AcceleratorDevice, CozipOffloadError>;
}

struct SoftSlot {
    info: DeviceInfo,
    in_use: Arc<AtomicBool>,
    faults: Arc<FaultPlan>,
}

/// In-process accelerator. Every opened device runs its own engine thread
/// that executes tasks against registered memory and posts completions.
pub struct SoftAccelerator {
    slots: Vec<SoftSlot>,
}

impl Default for SoftAccelerator {
    fn default() -> Self {
        Self::with_generations(&[DeviceGeneration::Gen2, DeviceGeneration::Gen3])
    }
}

impl SoftAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generations(generations: &[DeviceGeneration]) -> Self {
        let slots = generations
            .iter()
            .enumerate()
            .map(|(id, generation)| SoftSlot {
                info: DeviceInfo {
                    id,
                    name: format!("soft-accel-gen{}-{id}", generation.number()),
                    generation: *generation,
                },
                in_use: Arc::new(AtomicBool::new(false)),
                faults: Arc::new(FaultPlan::default()),
            })
            .collect();
        Self { slots }
    }

    pub fn with_faults(mut self, device_id: usize, faults: FaultPlan) -> Self {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.info.id == device_id) {
            slot.faults = Arc::new(faults);
        }
        self
    }
}

impl Accelerator for SoftAccelerator {
    fn list_devices(&self) -> Vec<DeviceInfo> {
        self.slots.iter().map(|slot| slot.info.clone()).collect()
    }

    fn open_device(&self, info: &DeviceInfo) -> Result<AcceleratorDevice, CozipOffloadError> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.info.id == info.id)
            .ok_or(CozipOffloadError::DeviceNotFound("unknown device id"))?;

        if slot.faults.refuse_open {
            return Err(CozipOffloadError::InvalidState("device refused open"));
        }

        if slot
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CozipOffloadError::InvalidState("device is already open"));
        }

        AcceleratorDevice::spawn(
            slot.info.clone(),
            Arc::clone(&slot.in_use),
            Arc::clone(&slot.faults),
        )
    }
}

/// Bytes registered against one device, shared with its memory regions.
#[derive(Debug)]
pub(crate) struct RegistrationLedger {
    registered: AtomicUsize,
    limit: Option<usize>,
}

impl RegistrationLedger {
    pub(crate) fn reserve(&self, len: usize) -> Result<(), CozipOffloadError> {
        let mut current = self.registered.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(len)
                .ok_or(CozipOffloadError::ResourceExhaustion("registration size overflow"))?;
            if self.limit.is_some_and(|limit| next > limit) {
                return Err(CozipOffloadError::ResourceExhaustion(
                    "device registration limit reached",
                ));
            }
            match self.registered.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn release(&self, len: usize) {
        let _ = self
            .registered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(len))
            });
    }

    pub(crate) fn registered(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }
}

pub(crate) struct DeviceJob {
    pub(crate) correlation: usize,
    pub(crate) task_id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) input: BufferView,
    pub(crate) output: BufferView,
    pub(crate) level: u32,
    pub(crate) flushing: Arc<AtomicBool>,
    pub(crate) sink: Arc<CompletionQueue>,
}

/// An exclusively opened device. Dropping it closes the device: the job
/// queue is disconnected and the engine thread joined.
pub struct AcceleratorDevice {
    info: DeviceInfo,
    in_use: Arc<AtomicBool>,
    faults: Arc<FaultPlan>,
    ledger: Arc<RegistrationLedger>,
    jobs: Option<mpsc::Sender<DeviceJob>>,
    engine: Option<thread::JoinHandle<()>>,
}

impl AcceleratorDevice {
    fn spawn(
        info: DeviceInfo,
        in_use: Arc<AtomicBool>,
        faults: Arc<FaultPlan>,
    ) -> Result<Self, CozipOffloadError> {
        let (tx, rx) = mpsc::channel::<DeviceJob>();
        let engine_faults = Arc::clone(&faults);
        let spawned = thread::Builder::new()
            .name(format!("{}-engine", info.name))
            .spawn(move || run_device_engine(rx, engine_faults));

        let engine = match spawned {
            Ok(handle) => handle,
            Err(error) => {
                in_use.store(false, Ordering::Release);
                return Err(CozipOffloadError::Io(error));
            }
        };

        debug!(device = %info.name, "accelerator device opened");
        let ledger = Arc::new(RegistrationLedger {
            registered: AtomicUsize::new(0),
            limit: faults.max_registered_bytes,
        });

        Ok(Self {
            info,
            in_use,
            faults,
            ledger,
            jobs: Some(tx),
            engine: Some(engine),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn registered_bytes(&self) -> usize {
        self.ledger.registered()
    }

    pub(crate) fn ledger(&self) -> Arc<RegistrationLedger> {
        Arc::clone(&self.ledger)
    }

    pub(crate) fn max_inventory_buffers(&self) -> Option<usize> {
        self.faults.max_inventory_buffers
    }

    pub(crate) fn execute(&self, job: DeviceJob) -> Result<(), TaskError> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or(TaskError::SubmitRejected("device is closed"))?;
        jobs.send(job)
            .map_err(|_| TaskError::SubmitRejected("device engine stopped"))
    }
}

impl Drop for AcceleratorDevice {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(engine) = self.engine.take() {
            if engine.join().is_err() {
                warn!(device = %self.info.name, "device engine thread panicked");
            }
        }
        let leaked = self.ledger.registered();
        if leaked > 0 {
            warn!(device = %self.info.name, leaked, "device closed with registered memory");
        }
        self.in_use.store(false, Ordering::Release);
        debug!(device = %self.info.name, "accelerator device closed");
    }
}

fn run_device_engine(jobs: mpsc::Receiver<DeviceJob>, faults: Arc<FaultPlan>) {
    while let Ok(job) = jobs.recv() {
        let result = if job.flushing.load(Ordering::Acquire) {
            Err(TaskError::Flushed)
        } else if faults.fail_chunks.contains(&job.correlation) {
            Err(TaskError::Injected)
        } else {
            execute_job(&job)
        };

        job.sink.push(Completion {
            task_id: job.task_id,
            result,
        });
    }
}

fn execute_job(job: &DeviceJob) -> Result<TaskOutput, TaskError> {
    if !job.input.permits(LOCAL_READ) || !job.output.permits(LOCAL_WRITE) {
        return Err(TaskError::MemoryAccess);
    }
    let input = job.input.read().map_err(|_| TaskError::MemoryAccess)?;
    let capacity = job.output.len();

    let (produced, adler) = match job.kind {
        TaskKind::CompressDeflate => {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(deflate_bound(input.len())),
                Compression::new(job.level),
            );
            encoder
                .write_all(&input)
                .map_err(|_| TaskError::BadInput)?;
            let compressed = encoder.finish().map_err(|_| TaskError::BadInput)?;
            let adler = adler32(&input);
            (compressed, adler)
        }
        TaskKind::DecompressDeflate => {
            let mut restored = Vec::with_capacity(capacity);
            DeflateDecoder::new(input.as_slice())
                .take(capacity as u64 + 1)
                .read_to_end(&mut restored)
                .map_err(|_| TaskError::BadInput)?;
            let adler = adler32(&restored);
            (restored, adler)
        }
        TaskKind::DecompressLz4 => {
            let mut restored = vec![0u8; capacity];
            let written = match lz4_flex::block::decompress_into(&input, &mut restored) {
                Ok(written) => written,
                Err(lz4_flex::block::DecompressError::OutputTooSmall { .. }) => {
                    return Err(TaskError::OutputOverflow {
                        needed: capacity + 1,
                        capacity,
                    });
                }
                Err(_) => return Err(TaskError::BadInput),
            };
            restored.truncate(written);
            (restored, 0)
        }
    };

    if produced.len() > capacity {
        return Err(TaskError::OutputOverflow {
            needed: produced.len(),
            capacity,
        });
    }

    job.output
        .write(&produced)
        .map_err(|_| TaskError::MemoryAccess)?;

    Ok(TaskOutput {
        len: produced.len(),
        crc32: crc32fast::hash(&produced),
        adler32: adler,
    })
}
