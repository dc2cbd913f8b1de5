use super::*;

use crate::device::RegistrationLedger;

pub const LOCAL_READ: u32 = 0b01;
pub const LOCAL_WRITE: u32 = 0b10;
pub const LOCAL_READ_WRITE: u32 = LOCAL_READ | LOCAL_WRITE;

/// Process memory a device may access directly.
pub type SharedMemory = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationStep {
    Create,
    SetRange,
    SetPermissions,
    AttachDevice,
    Start,
}

/// Registration in progress. Dropping it without `commit` undoes every
/// completed step, last one first.
struct PendingRegistration {
    completed: Vec<RegistrationStep>,
    ledger: Option<Arc<RegistrationLedger>>,
    len: usize,
    committed: bool,
}

impl PendingRegistration {
    fn new() -> Self {
        Self {
            completed: Vec::with_capacity(5),
            ledger: None,
            len: 0,
            committed: false,
        }
    }

    fn done(&mut self, step: RegistrationStep) {
        self.completed.push(step);
    }

    fn attached(&mut self, ledger: Arc<RegistrationLedger>, len: usize) {
        self.ledger = Some(ledger);
        self.len = len;
        self.done(RegistrationStep::AttachDevice);
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingRegistration {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(step) = self.completed.pop() {
            match step {
                RegistrationStep::Start => debug!("region registration undo: stop"),
                RegistrationStep::AttachDevice => {
                    if let Some(ledger) = self.ledger.take() {
                        ledger.release(self.len);
                    }
                    debug!("region registration undo: detach device");
                }
                RegistrationStep::SetPermissions => {
                    debug!("region registration undo: clear permissions")
                }
                RegistrationStep::SetRange => debug!("region registration undo: clear range"),
                RegistrationStep::Create => debug!("region registration undo: destroy"),
            }
        }
    }
}

/// Memory range registered with one device.
pub struct MemoryRegion {
    memory: SharedMemory,
    len: usize,
    permissions: u32,
    state: RegionState,
    ledger: Arc<RegistrationLedger>,
    outstanding: Arc<AtomicUsize>,
}

impl MemoryRegion {
    /// Runs create, set range, set permissions, attach device and start in
    /// that order.
    pub fn register(
        memory: SharedMemory,
        len: usize,
        device: &AcceleratorDevice,
        permissions: u32,
    ) -> Result<Self, CozipOffloadError> {
        let mut pending = PendingRegistration::new();
        pending.done(RegistrationStep::Create);

        let backing_len = lock(&memory)?.len();
        if len == 0 || len > backing_len {
            return Err(CozipOffloadError::InvalidConfiguration(
                "region range must be non-empty and inside its memory",
            ));
        }
        pending.done(RegistrationStep::SetRange);

        if permissions == 0 || permissions & !LOCAL_READ_WRITE != 0 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "region permissions must be a non-empty local access mask",
            ));
        }
        pending.done(RegistrationStep::SetPermissions);

        let ledger = device.ledger();
        ledger.reserve(len)?;
        pending.attached(Arc::clone(&ledger), len);

        pending.done(RegistrationStep::Start);
        pending.commit();

        debug!(len, permissions, device = %device.info().name, "memory region started");
        Ok(Self {
            memory,
            len,
            permissions,
            state: RegionState::Started,
            ledger,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    pub fn permits(&self, mask: u32) -> bool {
        self.permissions & mask == mask
    }

    pub fn memory(&self) -> SharedMemory {
        Arc::clone(&self.memory)
    }

    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn outstanding(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.outstanding)
    }

    /// Copies `len` bytes at `offset` out of the region.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>, CozipOffloadError> {
        let memory = lock(&self.memory)?;
        memory
            .get(offset..offset.saturating_add(len))
            .map(<[u8]>::to_vec)
            .ok_or(CozipOffloadError::InvalidConfiguration(
                "read outside region memory",
            ))
    }

    pub fn stop(&mut self) -> Result<(), CozipOffloadError> {
        if self.state == RegionState::Stopped {
            return Ok(());
        }
        let outstanding = self.outstanding_buffers();
        if outstanding > 0 {
            return Err(CozipOffloadError::InvalidState(
                "region still has buffers derived from it",
            ));
        }
        self.state = RegionState::Stopped;
        debug!(len = self.len, "memory region stopped");
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.outstanding_buffers(),
            0,
            "memory region dropped while buffers derived from it are live"
        );
        if let Err(error) = self.stop() {
            warn!(
                %error,
                outstanding = self.outstanding_buffers(),
                "memory region destroyed while buffers are live"
            );
            self.state = RegionState::Stopped;
        }
        self.ledger.release(self.len);
        debug!(len = self.len, "memory region destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen2_device(faults: FaultPlan) -> (SoftAccelerator, AcceleratorDevice) {
        let accel =
            SoftAccelerator::with_generations(&[DeviceGeneration::Gen2]).with_faults(0, faults);
        let info = accel.list_devices()[0].clone();
        let device = accel.open_device(&info).expect("open should succeed");
        (accel, device)
    }

    fn memory(len: usize) -> SharedMemory {
        Arc::new(Mutex::new(vec![0u8; len]))
    }

    #[test]
    fn registered_region_is_started_and_accounted() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let region = MemoryRegion::register(memory(4096), 4096, &device, LOCAL_READ_WRITE)
            .expect("register should succeed");

        assert_eq!(region.state(), RegionState::Started);
        assert!(region.permits(LOCAL_WRITE));
        assert_eq!(device.registered_bytes(), 4096);

        drop(region);
        assert_eq!(device.registered_bytes(), 0);
    }

    #[test]
    fn range_beyond_memory_is_rejected() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let result = MemoryRegion::register(memory(100), 200, &device, LOCAL_READ);
        assert!(matches!(
            result,
            Err(CozipOffloadError::InvalidConfiguration(_))
        ));
        assert_eq!(device.registered_bytes(), 0);
    }

    #[test]
    fn empty_permissions_are_rejected() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let result = MemoryRegion::register(memory(100), 100, &device, 0);
        assert!(result.is_err());
        assert_eq!(device.registered_bytes(), 0);
    }

    #[test]
    fn failed_attach_unwinds_without_leaking() {
        let (_accel, device) = gen2_device(FaultPlan::default().max_registered_bytes(6000));
        let first = MemoryRegion::register(memory(4096), 4096, &device, LOCAL_READ)
            .expect("first region fits");

        let second = MemoryRegion::register(memory(4096), 4096, &device, LOCAL_READ_WRITE);
        assert!(matches!(
            second,
            Err(CozipOffloadError::ResourceExhaustion(_))
        ));
        assert_eq!(device.registered_bytes(), 4096);

        drop(first);
        assert_eq!(device.registered_bytes(), 0);
    }

    #[test]
    fn stop_waits_for_derived_buffers() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let mut region = MemoryRegion::register(memory(1024), 1024, &device, LOCAL_READ)
            .expect("register should succeed");
        let inventory = BufferInventory::new(2, &device).expect("inventory should start");

        let buffer = inventory
            .derive(&region, 1, 512, 512, LOCAL_READ)
            .expect("derive should succeed");
        assert_eq!(buffer.offset(), 512);
        assert!(matches!(
            region.stop(),
            Err(CozipOffloadError::InvalidState(_))
        ));

        drop(buffer);
        region.stop().expect("stop should succeed once buffers return");
        assert!(matches!(
            inventory.derive(&region, 0, 512, 512, LOCAL_READ),
            Err(CozipOffloadError::InvalidState(_))
        ));
    }

    #[test]
    fn derive_requires_granted_access() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let read_only = MemoryRegion::register(memory(256), 256, &device, LOCAL_READ)
            .expect("register should succeed");
        let inventory = BufferInventory::new(4, &device).expect("inventory should start");

        assert!(matches!(
            inventory.derive(&read_only, 0, 128, 128, LOCAL_WRITE),
            Err(CozipOffloadError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            inventory.derive(&read_only, 0, 128, 128, LOCAL_READ_WRITE),
            Err(CozipOffloadError::InvalidConfiguration(_))
        ));
        assert_eq!(inventory.in_use(), 0);
        assert_eq!(read_only.outstanding_buffers(), 0);

        let buffer = inventory
            .derive(&read_only, 1, 128, 128, LOCAL_READ)
            .expect("read access is granted");
        assert_eq!(buffer.permissions(), LOCAL_READ);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "buffers derived from it are live")]
    fn dropping_region_with_live_buffers_panics_in_debug() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let inventory = BufferInventory::new(1, &device).expect("inventory should start");
        let region = MemoryRegion::register(memory(64), 64, &device, LOCAL_READ)
            .expect("register should succeed");
        let buffer = inventory
            .derive(&region, 0, 64, 64, LOCAL_READ)
            .expect("derive should succeed");
        drop(region);
        drop(buffer);
    }

    #[test]
    fn derive_never_leaves_region() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let region = MemoryRegion::register(memory(1000), 1000, &device, LOCAL_READ)
            .expect("register should succeed");
        let inventory = BufferInventory::new(4, &device).expect("inventory should start");

        assert!(inventory.derive(&region, 2, 400, 200, LOCAL_READ).is_ok());
        assert!(matches!(
            inventory.derive(&region, 2, 400, 400, LOCAL_READ),
            Err(CozipOffloadError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn inventory_slots_return_on_drop() {
        let (_accel, device) = gen2_device(FaultPlan::default());
        let region = MemoryRegion::register(memory(64), 64, &device, LOCAL_READ)
            .expect("register should succeed");
        let inventory = BufferInventory::new(1, &device).expect("inventory should start");

        let held = inventory
            .derive(&region, 0, 32, 32, LOCAL_READ)
            .expect("first slot available");
        assert!(matches!(
            inventory.derive(&region, 1, 32, 32, LOCAL_READ),
            Err(CozipOffloadError::ResourceExhaustion(_))
        ));
        drop(held);
        assert_eq!(inventory.in_use(), 0);
        inventory
            .derive(&region, 1, 32, 32, LOCAL_READ)
            .expect("slot reusable after release");
    }
}
