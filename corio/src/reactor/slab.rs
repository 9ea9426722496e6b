use crate::error::Error;
use crate::reactor::operation::Operation;
use crate::runtime::SPILL_TO_HEAP_THRESHOLD;
use slab::{Slab, VacantEntry};
use smallvec::SmallVec;
use std::ops::{Deref, DerefMut};

/// Arena of in-flight [`Operation`] records.
///
/// Insertion follows a "Reserve-Commit" pattern: a slot is only permanently
/// occupied once the matching SQE made it into the submission ring.
pub(crate) struct OperationSlab {
    slab: Slab<Operation>,
}

impl std::fmt::Debug for OperationSlab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationSlab")
            .field("len", &self.slab.len())
            .field("capacity", &self.slab.capacity())
            .finish()
    }
}

impl OperationSlab {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
        }
    }

    pub(crate) fn reserve_entry(&mut self) -> Result<SlabReservedEntry<'_>, Error> {
        if self.slab.len() == self.slab.capacity() {
            return Err(Error::SlabFull);
        }

        Ok(SlabReservedEntry {
            entry: self.slab.vacant_entry(),
        })
    }

    /// Reserve N slots at once. We can't borrow N vacant entries mutably, so
    /// placeholders are inserted and swapped for the real records on commit,
    /// or removed if the batch is dropped uncommitted.
    pub(crate) fn reserve_batch(&mut self, size: usize) -> Result<SlabReservedBatch<'_>, Error> {
        if self.slab.len() + size > self.slab.capacity() {
            return Err(Error::SlabFull);
        }

        let indices = (0..size)
            .map(|_| self.slab.insert(Operation::detached(None)))
            .collect::<SmallVec<_>>();

        Ok(SlabReservedBatch {
            indices,
            slab: self,
            committed: false,
        })
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> Result<&mut Operation, Error> {
        self.slab.get_mut(key).ok_or(Error::SlabInvalidState)
    }
}

#[doc(hidden)]
impl Deref for OperationSlab {
    type Target = Slab<Operation>;

    fn deref(&self) -> &Self::Target {
        &self.slab
    }
}

#[doc(hidden)]
impl DerefMut for OperationSlab {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slab
    }
}

pub(crate) struct SlabReservedEntry<'a> {
    entry: VacantEntry<'a, Operation>,
}

impl<'a> SlabReservedEntry<'a> {
    /// Key the record will be stored under, used as the SQE `user_data`.
    pub(crate) fn key(&self) -> usize {
        self.entry.key()
    }

    pub(crate) fn commit(self, value: Operation) -> &'a mut Operation {
        self.entry.insert(value)
    }
}

pub(crate) struct SlabReservedBatch<'a> {
    indices: SmallVec<[usize; SPILL_TO_HEAP_THRESHOLD]>,
    slab: &'a mut OperationSlab,
    committed: bool,
}

impl SlabReservedBatch<'_> {
    pub(crate) fn keys(&self) -> &[usize] {
        &self.indices
    }

    pub(crate) fn commit<I>(mut self, values: I) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = Operation>,
    {
        if values.len() != self.indices.len() {
            return Err(anyhow::anyhow!(
                "You need to insert *exactly* {} values, got {}.",
                self.indices.len(),
                values.len()
            )
            .into());
        }

        for (idx, value) in self.indices.iter().zip(values) {
            *self.slab.get_mut(*idx)? = value;
        }

        self.committed = true;
        Ok(())
    }
}

impl Drop for SlabReservedBatch<'_> {
    fn drop(&mut self) {
        if !self.committed {
            for idx in &self.indices {
                self.slab.remove(*idx);
            }
        }
    }
}
