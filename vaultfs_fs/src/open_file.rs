//! Process-scoped open-file table. Descriptors are small integers indexing
//! a slab; closing a descriptor frees its slot for reuse.

use std::sync::Mutex;
use vaultfs_core::{BlockId, VaultFsError, VaultFsResult};

pub type FileDescriptor = u64;

#[derive(Default)]
struct Slab {
    slots: Vec<Option<BlockId>>,
    free: Vec<usize>,
}

pub struct OpenFileTable {
    inner: Mutex<Slab>,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slab::default()),
        }
    }

    /// Closed -> Open(descriptor). Multiple independent opens of the same
    /// blob are permitted and get distinct descriptors.
    pub fn open(&self, blob_id: BlockId) -> FileDescriptor {
        let mut slab = self.inner.lock().unwrap();
        if let Some(idx) = slab.free.pop() {
            slab.slots[idx] = Some(blob_id);
            idx as FileDescriptor
        } else {
            slab.slots.push(Some(blob_id));
            (slab.slots.len() - 1) as FileDescriptor
        }
    }

    pub fn blob_id_of(&self, fd: FileDescriptor) -> VaultFsResult<BlockId> {
        let slab = self.inner.lock().unwrap();
        slab.slots
            .get(fd as usize)
            .and_then(|slot| *slot)
            .ok_or(VaultFsError::InvalidArgument(format!("file descriptor {fd} is not open")))
    }

    /// Open(descriptor) -> Closed.
    pub fn close(&self, fd: FileDescriptor) -> VaultFsResult<BlockId> {
        let mut slab = self.inner.lock().unwrap();
        let slot = slab
            .slots
            .get_mut(fd as usize)
            .ok_or(VaultFsError::InvalidArgument(format!("file descriptor {fd} is not open")))?;
        let blob_id = slot.take().ok_or(VaultFsError::InvalidArgument(format!("file descriptor {fd} is not open")))?;
        slab.free.push(fd as usize);
        Ok(blob_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_reuses_freed_descriptor() {
        let table = OpenFileTable::new();
        let id = BlockId::random();
        let fd1 = table.open(id);
        table.close(fd1).unwrap();
        let fd2 = table.open(BlockId::random());
        assert_eq!(fd1, fd2);
    }

    #[test]
    fn distinct_opens_of_same_blob_get_distinct_descriptors() {
        let table = OpenFileTable::new();
        let id = BlockId::random();
        let fd1 = table.open(id);
        let fd2 = table.open(id);
        assert_ne!(fd1, fd2);
        assert_eq!(table.blob_id_of(fd1).unwrap(), id);
        assert_eq!(table.blob_id_of(fd2).unwrap(), id);
    }

    #[test]
    fn operations_on_closed_descriptor_are_rejected() {
        let table = OpenFileTable::new();
        let fd = table.open(BlockId::random());
        table.close(fd).unwrap();
        assert!(table.blob_id_of(fd).is_err());
        assert!(table.close(fd).is_err());
    }
}
