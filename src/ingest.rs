//! Filling the shared buffer from concurrent producers.
//!
//! Numeric vectors go straight into the [`SharedPointBuffer`]. Identities do
//! not fit there, so each writer sends `(slot, point)` over a channel and the
//! session, the table's only writer, files it by slot when ingestion finishes.

use crate::error::{Error, Result};
use crate::point_buffer::SharedPointBuffer;
use crate::point_store::Point;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Owns the buffer and the identity channel while producers run.
pub struct IngestionSession {
    buffer: Arc<SharedPointBuffer>,
    tx: Sender<(usize, Point)>,
    rx: Receiver<(usize, Point)>,
}

impl IngestionSession {
    pub fn new(capacity: usize) -> Result<Self> {
        let buffer = Arc::new(SharedPointBuffer::new(capacity)?);
        let (tx, rx) = unbounded();
        Ok(IngestionSession { buffer, tx, rx })
    }

    /// A handle for one producer. Cheap to clone; move clones into threads.
    pub fn writer(&self) -> IngestionWriter {
        IngestionWriter {
            buffer: Arc::clone(&self.buffer),
            tx: self.tx.clone(),
        }
    }

    pub fn buffer(&self) -> &Arc<SharedPointBuffer> {
        &self.buffer
    }

    /// Freezes ingestion and builds the identity table.
    ///
    /// Blocks until every [`IngestionWriter`] has been dropped, so the
    /// returned buffer no longer changes.
    ///
    /// # Deadlocks
    ///
    /// Never returns while the calling thread itself still holds a writer.
    /// Drop every writer first, or use [`finish_timeout`](Self::finish_timeout).
    pub fn finish(self) -> IngestedPoints {
        let IngestionSession { buffer, tx, rx } = self;
        drop(tx);

        let received: Vec<(usize, Point)> = rx.iter().collect();
        Self::freeze(buffer, received)
    }

    /// Like [`finish`](Self::finish), but gives up with
    /// [`Error::IngestionTimeout`] if writers are still alive after `timeout`.
    pub fn finish_timeout(self, timeout: Duration) -> Result<IngestedPoints> {
        let IngestionSession { buffer, tx, rx } = self;
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut received = Vec::new();
        loop {
            match rx.recv_deadline(deadline) {
                Ok(pair) => received.push(pair),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("ingestion writers still alive after {:?}", timeout);
                    return Err(Error::IngestionTimeout(timeout));
                }
            }
        }
        Ok(Self::freeze(buffer, received))
    }

    fn freeze(buffer: Arc<SharedPointBuffer>, received: Vec<(usize, Point)>) -> IngestedPoints {
        let mut identities = IdentityTable::with_len(buffer.committed_count());
        for (slot, point) in received {
            identities.insert(slot, point);
        }

        debug!(
            "ingestion finished: {} slots committed, {} identities resolved",
            buffer.committed_count(),
            identities.resolved_count()
        );

        IngestedPoints { buffer, identities }
    }
}

/// Producer-side handle: claims a slot, writes the vector, reports the identity.
#[derive(Clone)]
pub struct IngestionWriter {
    buffer: Arc<SharedPointBuffer>,
    tx: Sender<(usize, Point)>,
}

impl IngestionWriter {
    /// Stores one point and returns its slot.
    ///
    /// Fails with [`Error::InvalidPoint`] before claiming a slot if a value is
    /// not finite, and with [`Error::CapacityExceeded`] once the buffer is full.
    pub fn write_point(&self, point: Point) -> Result<usize> {
        point.validate()?;
        let slot = self.buffer.allocate_slot()?;
        self.buffer.write(slot, point.vector());
        self.tx
            .send((slot, point))
            .map_err(|_| Error::IngestionClosed)?;
        Ok(slot)
    }

    /// Writes points until the buffer fills up. Invalid points are skipped.
    pub fn write_all<I>(&self, points: I) -> Result<IngestStats>
    where
        I: IntoIterator<Item = Point>,
    {
        let mut stats = IngestStats::default();
        let mut points = points.into_iter();

        while let Some(point) = points.next() {
            stats.record(self.write_point(point))?;
            if stats.rejected > 0 {
                stats.rejected += points.count();
                break;
            }
        }

        Ok(stats)
    }
}

/// Counters for one or more producers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub written: usize,
    /// Points turned away because the buffer was full.
    pub rejected: usize,
    /// Points skipped because a value was not finite.
    pub invalid: usize,
}

impl IngestStats {
    /// Folds the outcome of one `write_point` call in. Fatal errors are passed back.
    pub fn record(&mut self, outcome: Result<usize>) -> Result<()> {
        match outcome {
            Ok(_) => self.written += 1,
            Err(Error::CapacityExceeded { .. }) => self.rejected += 1,
            Err(Error::InvalidPoint { id, reason }) => {
                warn!("skipping point {}: {}", id, reason);
                self.invalid += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub fn merge(self, other: IngestStats) -> IngestStats {
        IngestStats {
            written: self.written + other.written,
            rejected: self.rejected + other.rejected,
            invalid: self.invalid + other.invalid,
        }
    }
}

/// Slot-indexed identities, owned by the coordinating side.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    records: Vec<Option<Point>>,
}

impl IdentityTable {
    fn with_len(len: usize) -> Self {
        IdentityTable {
            records: vec![None; len],
        }
    }

    fn insert(&mut self, slot: usize, point: Point) {
        if slot >= self.records.len() {
            self.records.resize(slot + 1, None);
        }
        self.records[slot] = Some(point);
    }

    pub fn get(&self, slot: usize) -> Option<&Point> {
        self.records.get(slot).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }
}

/// A frozen buffer together with the identity of each slot.
pub struct IngestedPoints {
    pub buffer: Arc<SharedPointBuffer>,
    pub identities: IdentityTable,
}

impl IngestedPoints {
    /// Single-producer shortcut: ingests `points` into a buffer sized to fit them.
    pub fn from_points(points: Vec<Point>) -> Result<(Self, IngestStats)> {
        let session = IngestionSession::new(points.len().max(1))?;
        let stats = session.writer().write_all(points)?;
        Ok((session.finish(), stats))
    }

    pub fn len(&self) -> usize {
        self.buffer.committed_count()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
