use super::*;

use std::io::{ErrorKind, Read};

/// One slice of the input assigned to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub num_chunks: usize,
    pub chunk_capacity: usize,
    pub total: usize,
}

impl ChunkPlan {
    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.num_chunks).map(move |index| {
            let offset = index * self.chunk_capacity;
            Chunk {
                index,
                offset,
                len: self.chunk_capacity.min(self.total - offset),
            }
        })
    }

    /// Plan for a source that produced only `bytes_read` bytes. The chunk
    /// count shrinks so the last chunk absorbs the remainder.
    pub fn truncated(&self, bytes_read: usize) -> ChunkPlan {
        let total = bytes_read.min(self.total);
        let num_chunks = if self.chunk_capacity == 0 {
            0
        } else {
            total.div_ceil(self.chunk_capacity)
        };
        ChunkPlan {
            num_chunks,
            chunk_capacity: self.chunk_capacity,
            total,
        }
    }
}

/// Capacity used for each chunk: a requested size below the device limit
/// wins, anything else falls back to the limit.
pub fn effective_capacity(max_chunk_capacity: usize, requested: usize) -> usize {
    if requested > 0 && requested < max_chunk_capacity {
        requested
    } else {
        max_chunk_capacity
    }
}

pub fn plan(total_size: usize, max_chunk_capacity: usize) -> Result<ChunkPlan, CozipOffloadError> {
    if max_chunk_capacity == 0 {
        return Err(CozipOffloadError::InvalidConfiguration(
            "max chunk capacity must be greater than 0",
        ));
    }

    if total_size == 0 {
        return Ok(ChunkPlan {
            num_chunks: 0,
            chunk_capacity: 0,
            total: 0,
        });
    }

    if total_size <= max_chunk_capacity {
        return Ok(ChunkPlan {
            num_chunks: 1,
            chunk_capacity: total_size,
            total: total_size,
        });
    }

    Ok(ChunkPlan {
        num_chunks: total_size.div_ceil(max_chunk_capacity),
        chunk_capacity: max_chunk_capacity,
        total: total_size,
    })
}

/// Reads each planned chunk from `reader` into `dest` at `index * stride`.
/// Returns the plan reduced to what the reader actually delivered.
pub fn read_into_plan<R: Read>(
    reader: &mut R,
    plan: ChunkPlan,
    stride: usize,
    dest: &mut [u8],
) -> Result<ChunkPlan, CozipOffloadError> {
    let mut bytes_read = 0usize;

    for chunk in plan.chunks() {
        let start = chunk.index * stride;
        let window = dest
            .get_mut(start..start + chunk.len)
            .ok_or(CozipOffloadError::InvalidConfiguration(
                "destination is smaller than the chunk plan",
            ))?;
        let filled = read_full(reader, window)?;
        bytes_read += filled;
        if filled < chunk.len {
            debug!(
                planned = plan.num_chunks,
                chunk = chunk.index,
                bytes_read,
                "short read, reducing chunk plan"
            );
            break;
        }
    }

    Ok(plan.truncated(bytes_read))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, CozipOffloadError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => return Err(CozipOffloadError::Io(error)),
        }
    }
    Ok(filled)
}

/// Raw window into registered memory handed to the device engine.
pub(crate) struct BufferView {
    memory: SharedMemory,
    offset: usize,
    len: usize,
    permissions: u32,
}

impl BufferView {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn permits(&self, mask: u32) -> bool {
        self.permissions & mask == mask
    }

    pub(crate) fn read(&self) -> Result<Vec<u8>, CozipOffloadError> {
        let memory = lock(&self.memory)?;
        memory
            .get(self.offset..self.offset + self.len)
            .map(<[u8]>::to_vec)
            .ok_or(CozipOffloadError::Internal("buffer view outside memory"))
    }

    pub(crate) fn write(&self, data: &[u8]) -> Result<(), CozipOffloadError> {
        if data.len() > self.len {
            return Err(CozipOffloadError::Internal("write larger than buffer view"));
        }
        let mut memory = lock(&self.memory)?;
        let window = memory
            .get_mut(self.offset..self.offset + data.len())
            .ok_or(CozipOffloadError::Internal("buffer view outside memory"))?;
        window.copy_from_slice(data);
        Ok(())
    }
}

#[derive(Debug)]
struct InventoryShared {
    capacity: usize,
    in_use: AtomicUsize,
}

/// Fixed pool of buffer handles. Handles go back to the pool when dropped.
#[derive(Debug)]
pub struct BufferInventory {
    shared: Arc<InventoryShared>,
}

impl BufferInventory {
    pub fn new(capacity: usize, device: &AcceleratorDevice) -> Result<Self, CozipOffloadError> {
        if capacity == 0 {
            return Err(CozipOffloadError::InvalidConfiguration(
                "buffer inventory needs at least one slot",
            ));
        }
        if device
            .max_inventory_buffers()
            .is_some_and(|limit| capacity > limit)
        {
            return Err(CozipOffloadError::ResourceExhaustion(
                "device cannot back that many buffers",
            ));
        }

        debug!(capacity, "buffer inventory started");
        Ok(Self {
            shared: Arc::new(InventoryShared {
                capacity,
                in_use: AtomicUsize::new(0),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Acquire)
    }

    /// Buffer for chunk `index` in a region laid out at `stride` bytes per
    /// chunk, holding `len` bytes of data. The region must grant `access`.
    pub fn derive(
        &self,
        region: &MemoryRegion,
        index: usize,
        stride: usize,
        len: usize,
        access: u32,
    ) -> Result<BufferHandle, CozipOffloadError> {
        if region.state() != RegionState::Started {
            return Err(CozipOffloadError::InvalidState(
                "buffers can only be derived from a started region",
            ));
        }
        if access == 0 || !region.permits(access) {
            return Err(CozipOffloadError::InvalidConfiguration(
                "region does not grant the requested access",
            ));
        }
        if len > stride {
            return Err(CozipOffloadError::InvalidConfiguration(
                "buffer length exceeds chunk stride",
            ));
        }

        let offset = index
            .checked_mul(stride)
            .ok_or(CozipOffloadError::InvalidConfiguration("buffer offset overflow"))?;
        let end = offset
            .checked_add(len)
            .ok_or(CozipOffloadError::InvalidConfiguration("buffer offset overflow"))?;
        if end > region.len() {
            return Err(CozipOffloadError::InvalidConfiguration(
                "buffer range exceeds region length",
            ));
        }

        let shared = &self.shared;
        shared
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                (in_use < shared.capacity).then_some(in_use + 1)
            })
            .map_err(|_| CozipOffloadError::ResourceExhaustion("buffer inventory exhausted"))?;

        let region_refs = region.outstanding();
        region_refs.fetch_add(1, Ordering::AcqRel);

        Ok(BufferHandle {
            memory: region.memory(),
            offset,
            len,
            permissions: region.permissions(),
            region_refs,
            inventory: Arc::clone(&self.shared),
        })
    }
}

impl Drop for BufferInventory {
    fn drop(&mut self) {
        let in_use = self.in_use();
        if in_use > 0 {
            warn!(in_use, "buffer inventory destroyed with handles outstanding");
        }
        debug!("buffer inventory destroyed");
    }
}

/// View of one chunk inside a registered region.
pub struct BufferHandle {
    memory: SharedMemory,
    offset: usize,
    len: usize,
    permissions: u32,
    region_refs: Arc<AtomicUsize>,
    inventory: Arc<InventoryShared>,
}

impl BufferHandle {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access mask of the region this buffer was derived from.
    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    pub(crate) fn view(&self) -> BufferView {
        BufferView {
            memory: Arc::clone(&self.memory),
            offset: self.offset,
            len: self.len,
            permissions: self.permissions,
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("permissions", &self.permissions)
            .finish()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.region_refs.fetch_sub(1, Ordering::AcqRel);
        self.inventory.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: usize = 1024 * 1024;

    fn chunk_lengths(plan: &ChunkPlan) -> Vec<usize> {
        plan.chunks().map(|chunk| chunk.len).collect()
    }

    #[test]
    fn small_input_is_one_exact_chunk() {
        let plan = plan(1000, 4096).expect("plan should succeed");
        assert_eq!(plan.num_chunks, 1);
        assert_eq!(plan.chunk_capacity, 1000);
        assert_eq!(chunk_lengths(&plan), vec![1000]);
    }

    #[test]
    fn three_hundred_mib_over_gen2_limit() {
        let plan = plan(300 * MIB, GEN2_MAX_BUFFER_SIZE).expect("plan should succeed");
        assert_eq!(plan.num_chunks, 3);
        assert_eq!(chunk_lengths(&plan), vec![128 * MIB, 128 * MIB, 44 * MIB]);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            plan(10, 0),
            Err(CozipOffloadError::InvalidConfiguration(_))
        ));
        assert_eq!(plan(0, 10).expect("empty plan").num_chunks, 0);
    }

    #[test]
    fn requested_capacity_only_shrinks() {
        assert_eq!(effective_capacity(GEN3_MAX_BUFFER_SIZE, 4096), 4096);
        assert_eq!(
            effective_capacity(GEN3_MAX_BUFFER_SIZE, 0),
            GEN3_MAX_BUFFER_SIZE
        );
        assert_eq!(
            effective_capacity(GEN3_MAX_BUFFER_SIZE, GEN2_MAX_BUFFER_SIZE),
            GEN3_MAX_BUFFER_SIZE
        );
    }

    #[test]
    fn short_read_reduces_chunk_count() {
        let planned = plan(10_000, 4096).expect("plan should succeed");
        assert_eq!(planned.num_chunks, 3);

        let source = vec![7u8; 5000];
        let mut dest = vec![0u8; planned.num_chunks * 4096];
        let read = read_into_plan(&mut source.as_slice(), planned, 4096, &mut dest)
            .expect("read should succeed");

        assert_eq!(read.num_chunks, 2);
        assert_eq!(read.total, 5000);
        assert_eq!(chunk_lengths(&read), vec![4096, 904]);
        assert!(dest[..5000].iter().all(|&b| b == 7));
        assert!(dest[5000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_places_chunks_at_stride() {
        let planned = plan(10, 4).expect("plan should succeed");
        let source: Vec<u8> = (1..=10).collect();
        let mut dest = vec![0u8; 3 * 6];
        let read = read_into_plan(&mut source.as_slice(), planned, 6, &mut dest)
            .expect("read should succeed");

        assert_eq!(read, planned);
        assert_eq!(&dest[0..4], &[1, 2, 3, 4]);
        assert_eq!(&dest[6..10], &[5, 6, 7, 8]);
        assert_eq!(&dest[12..14], &[9, 10]);
    }

    proptest! {
        #[test]
        fn plan_covers_input_exactly(total in 1usize..1_000_000, capacity in 1usize..100_000) {
            let plan = plan(total, capacity).expect("plan should succeed");
            let lengths = chunk_lengths(&plan);

            prop_assert_eq!(lengths.iter().sum::<usize>(), total);
            if total > capacity {
                prop_assert_eq!(plan.num_chunks, total.div_ceil(capacity));
                prop_assert!(lengths[..lengths.len() - 1].iter().all(|&len| len == capacity));
            } else {
                prop_assert_eq!(lengths, vec![total]);
            }
        }

        #[test]
        fn truncation_keeps_sum_equal_to_bytes(
            total in 1usize..200_000,
            capacity in 1usize..20_000,
            cut in 0usize..200_000,
        ) {
            let plan = plan(total, capacity).expect("plan should succeed");
            let reduced = plan.truncated(cut);
            let lengths = chunk_lengths(&reduced);

            prop_assert_eq!(lengths.iter().sum::<usize>(), cut.min(total));
            prop_assert!(reduced.num_chunks <= plan.num_chunks);
            prop_assert!(lengths.iter().all(|&len| len > 0 && len <= plan.chunk_capacity));
        }
    }
}
