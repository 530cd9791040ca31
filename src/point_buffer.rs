use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Number of numeric dimensions stored per point: latitude, longitude, population.
pub const DIMS: usize = 3;

/// One point's numeric vector.
pub type PointVector = [f64; DIMS];

/// Fixed-capacity, append-only point storage shared by reference across threads.
///
/// Producers claim a slot with [`allocate_slot`](Self::allocate_slot) and then
/// [`write`](Self::write) the vector into it. Claiming is a single atomic
/// read-modify-write, so no two producers ever receive the same slot and no
/// lock is taken on the write path. Values are kept as `f64` bit patterns in
/// atomic cells, one column per dimension.
///
/// Once ingestion is over the buffer is treated as frozen; readers only look
/// at indices below [`committed_count`](Self::committed_count).
pub struct SharedPointBuffer {
    columns: [Box<[AtomicU64]>; DIMS],
    ready: Box<[AtomicBool]>,
    write_index: AtomicUsize,
    capacity: usize,
}

impl SharedPointBuffer {
    /// Allocates room for `capacity` points.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Allocation("capacity must be greater than 0".into()));
        }

        let columns = [
            atomic_column(capacity)?,
            atomic_column(capacity)?,
            atomic_column(capacity)?,
        ];

        let mut ready = Vec::new();
        ready
            .try_reserve_exact(capacity)
            .map_err(|e| Error::Allocation(format!("ready flags for {capacity} slots: {e}")))?;
        ready.extend((0..capacity).map(|_| AtomicBool::new(false)));

        Ok(Self {
            columns,
            ready: ready.into_boxed_slice(),
            write_index: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Claims the next free slot and returns its index.
    ///
    /// Safe to call from any number of producers at once. Once the buffer is
    /// full every call fails with [`Error::CapacityExceeded`] and the cursor
    /// stays at `capacity`.
    pub fn allocate_slot(&self) -> Result<usize> {
        let capacity = self.capacity;
        self.write_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .map_err(|_| Error::CapacityExceeded { capacity })
    }

    /// Stores `vector` at `slot`.
    ///
    /// `slot` must come from [`allocate_slot`](Self::allocate_slot) and must not be
    /// written twice or read while this call is in progress.
    pub fn write(&self, slot: usize, vector: PointVector) {
        debug_assert!(
            slot < self.committed_count(),
            "slot {slot} written before it was allocated"
        );
        for (column, value) in self.columns.iter().zip(vector) {
            column[slot].store(value.to_bits(), Ordering::Relaxed);
        }
        self.ready[slot].store(true, Ordering::Release);
    }

    /// Returns the vector at `slot` if it has been claimed and fully written.
    pub fn read(&self, slot: usize) -> Option<PointVector> {
        if slot >= self.committed_count() || !self.ready[slot].load(Ordering::Acquire) {
            return None;
        }
        Some([
            f64::from_bits(self.columns[0][slot].load(Ordering::Relaxed)),
            f64::from_bits(self.columns[1][slot].load(Ordering::Relaxed)),
            f64::from_bits(self.columns[2][slot].load(Ordering::Relaxed)),
        ])
    }

    /// Number of slots claimed so far.
    pub fn committed_count(&self) -> usize {
        self.write_index.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.committed_count() == 0
    }

    /// Copies out every committed vector in slot order.
    ///
    /// Fails with [`Error::UncommittedSlot`] if a claimed slot was never written.
    pub fn committed_vectors(&self) -> Result<Vec<PointVector>> {
        (0..self.committed_count())
            .map(|slot| self.read(slot).ok_or(Error::UncommittedSlot { slot }))
            .collect()
    }
}

fn atomic_column(capacity: usize) -> Result<Box<[AtomicU64]>> {
    let mut column = Vec::new();
    column
        .try_reserve_exact(capacity)
        .map_err(|e| Error::Allocation(format!("column of {capacity} values: {e}")))?;
    column.extend((0..capacity).map(|_| AtomicU64::new(0)));
    Ok(column.into_boxed_slice())
}
