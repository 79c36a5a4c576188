//! The one address range a memory-load process owns, and the bookkeeping of which part of it is
//! live.
//!
//! The range is laid out as: live | discardable | reserved.
//!
//! We grow the footprint by:
//!   - If it was previously shrunk: writing to the discardable pages to bring them back.
//!   - Else: committing more of the reserved range and writing to every page of it.
//!
//! We shrink the footprint by marking the tail of the live segment discardable and asking the
//! platform to evict it from our working set, which moves the live/discardable boundary left.

use crate::plat::PlatFailed;
use crate::units::is_multiple;

/// The platform side of a reservation: operations on byte ranges given as offsets from its base.
pub trait Backing {
    /// Make the range accessible. Physical backing arrives when each page is first written.
    fn commit(&mut self, offset: usize, len: usize) -> Result<(), PlatFailed>;

    /// Write one byte into every page of the range, so every page is physically backed.
    fn touch(&mut self, offset: usize, len: usize);

    /// Mark committed pages as disposable.
    fn reset(&mut self, offset: usize, len: usize) -> Result<(), PlatFailed>;

    /// Best-effort removal of the pages from the working set. Never reports failure.
    fn evict_from_working_set(&mut self, offset: usize, len: usize);
}

#[derive(Debug)]
pub struct Reservation<B: Backing> {
    backing: B,
    granularity: usize,
    // Total size of the range. Also total physical memory, rounded down to `granularity`.
    total_memory: usize,
    committed_bytes: usize,
    reset_bytes: usize,
}

impl<B: Backing> Reservation<B> {
    pub fn new(backing: B, total_memory: usize, granularity: usize) -> Self {
        assert!(granularity > 0);
        assert!(is_multiple(total_memory, granularity), "{total_memory} is not a multiple of {granularity}");
        Self { backing, granularity, total_memory, committed_bytes: 0, reset_bytes: 0 }
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    pub fn reset_bytes(&self) -> usize {
        self.reset_bytes
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Bring back up to `n` bytes of the discardable segment by writing to it. Returns the number
    /// of bytes that became live.
    pub fn grow_from_discardable(&mut self, n: usize) -> usize {
        self.check_request(n);
        assert!(self.reset_bytes > 0, "nothing discardable to grow from");

        let size = self.reset_bytes.min(n);
        // The pages keep their protection after a reset, so writing is all it takes.
        self.backing.touch(self.committed_bytes, size);
        self.committed_bytes += size;
        self.reset_bytes -= size;

        self.check_invariants();
        size
    }

    /// Commit up to `n` fresh bytes right after the live segment and write to every page of
    /// them. Returns the number of bytes that became live.
    pub fn grow_fresh(&mut self, n: usize) -> Result<usize, PlatFailed> {
        self.check_request(n);
        assert!(self.reset_bytes == 0, "discardable memory must be reused before committing more");

        let size = (self.total_memory - self.committed_bytes).min(n);
        if size > 0 {
            self.backing.commit(self.committed_bytes, size)?;
            self.backing.touch(self.committed_bytes, size);
            self.committed_bytes += size;
        }

        self.check_invariants();
        Ok(size)
    }

    /// Mark up to `n` bytes at the end of the live segment discardable. Returns the number of
    /// bytes released, which is 0 when nothing is live.
    pub fn shrink(&mut self, n: usize) -> Result<usize, PlatFailed> {
        self.check_request(n);

        let size = n.min(self.committed_bytes);
        if size > 0 {
            let new_committed_bytes = self.committed_bytes - size;
            self.backing.reset(new_committed_bytes, size)?;
            self.backing.evict_from_working_set(new_committed_bytes, size);
            self.committed_bytes = new_committed_bytes;
            self.reset_bytes += size;
        }

        self.check_invariants();
        Ok(size)
    }

    fn check_request(&self, n: usize) {
        self.check_invariants();
        assert!(is_multiple(n, self.granularity), "request of {n} bytes is not a multiple of {}", self.granularity);
    }

    fn check_invariants(&self) {
        assert!(is_multiple(self.committed_bytes, self.granularity));
        assert!(is_multiple(self.reset_bytes, self.granularity));
        assert!(self.committed_bytes + self.reset_bytes <= self.total_memory);
    }
}
