//! L6: the in-memory representation of a directory's payload.
//!
//! On-disk entry layout:
//! `kind(1) | child-blob-id(16) | mode(4) | uid(4) | gid(4) | atime(8+4) |
//!  mtime(8+4) | ctime(8+4) | name-length(LEB128 varint) | name-bytes`

use crate::fsblob::FsBlobKind;
use std::time::{SystemTime, UNIX_EPOCH};
use vaultfs_core::{BlockId, VaultFsError, VaultFsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        }
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.secs.to_le_bytes());
        out.extend_from_slice(&self.nanos.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let secs = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let nanos = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        Self { secs, nanos }
    }

    const ENCODED_LEN: usize = 12;
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub kind: FsBlobKind,
    pub child_id: BlockId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub name: String,
}

#[derive(Debug, Default, Clone)]
pub struct DirEntryList {
    entries: Vec<DirEntry>,
}

impl DirEntryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn get_by_name(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get_by_id(&self, id: BlockId) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.child_id == id)
    }

    pub fn get_mut_by_name(&mut self, name: &str) -> Option<&mut DirEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        name: impl Into<String>,
        kind: FsBlobKind,
        child_id: BlockId,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> VaultFsResult<()> {
        let name = name.into();
        if self.get_by_name(&name).is_some() {
            return Err(VaultFsError::AlreadyExists);
        }
        let now = Timestamp::now();
        self.entries.push(DirEntry {
            kind,
            child_id,
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            name,
        });
        Ok(())
    }

    /// `add`, but if `name` already names a kind-compatible entry, the old
    /// entry is replaced instead of returning `AlreadyExists`. `on_overwrite`
    /// is invoked with the displaced child-id so the caller can free its
    /// blob. The caller is responsible for having already checked that a
    /// displaced directory is empty.
    #[allow(clippy::too_many_arguments)]
    pub fn add_or_overwrite(
        &mut self,
        name: impl Into<String>,
        kind: FsBlobKind,
        child_id: BlockId,
        mode: u32,
        uid: u32,
        gid: u32,
        on_overwrite: impl FnOnce(BlockId),
    ) -> VaultFsResult<()> {
        let name = name.into();
        if let Some(existing) = self.get_by_name(&name) {
            match (existing.kind, kind) {
                (FsBlobKind::Dir, FsBlobKind::Dir)
                | (FsBlobKind::File, FsBlobKind::File)
                | (FsBlobKind::Symlink, FsBlobKind::Symlink) => {}
                (FsBlobKind::Dir, _) => return Err(VaultFsError::IsADirectory),
                (_, FsBlobKind::Dir) => return Err(VaultFsError::NotADirectory),
                _ => return Err(VaultFsError::InvalidArgument("incompatible overwrite kinds".into())),
            }
            let old_id = existing.child_id;
            self.entries.retain(|e| e.name != name);
            on_overwrite(old_id);
        }
        self.add(name, kind, child_id, mode, uid, gid)
    }

    pub fn remove_by_name(&mut self, name: &str) -> VaultFsResult<DirEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(VaultFsError::NotFound)?;
        Ok(self.entries.remove(idx))
    }

    pub fn remove_by_id(&mut self, id: BlockId) -> VaultFsResult<DirEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.child_id == id)
            .ok_or(VaultFsError::NotFound)?;
        Ok(self.entries.remove(idx))
    }

    /// Renames the entry identified by `id` to `new_name` in place, without
    /// touching the child blob. Used for same-directory renames; a
    /// cross-directory move is `remove_by_name` + `add_or_overwrite`.
    pub fn rename(&mut self, id: BlockId, new_name: impl Into<String>) -> VaultFsResult<()> {
        let new_name = new_name.into();
        if self.get_by_id(id).is_none() {
            return Err(VaultFsError::NotFound);
        }
        if self.get_by_name(&new_name).map(|e| e.child_id) == Some(id) {
            return Ok(());
        }
        if self.get_by_name(&new_name).is_some() {
            return Err(VaultFsError::AlreadyExists);
        }
        let entry = self.entries.iter_mut().find(|e| e.child_id == id).unwrap();
        entry.name = new_name;
        entry.ctime = Timestamp::now();
        Ok(())
    }

    pub fn update_access_time(&mut self, id: BlockId, atime: Timestamp) -> VaultFsResult<()> {
        let entry = self.entries.iter_mut().find(|e| e.child_id == id).ok_or(VaultFsError::NotFound)?;
        entry.atime = atime;
        Ok(())
    }

    pub fn update_modification_time(&mut self, id: BlockId) -> VaultFsResult<()> {
        let entry = self.entries.iter_mut().find(|e| e.child_id == id).ok_or(VaultFsError::NotFound)?;
        let now = Timestamp::now();
        entry.mtime = now;
        entry.ctime = now;
        Ok(())
    }

    pub fn touch_ctime(&mut self, id: BlockId) -> VaultFsResult<()> {
        let entry = self.entries.iter_mut().find(|e| e.child_id == id).ok_or(VaultFsError::NotFound)?;
        entry.ctime = Timestamp::now();
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.push(match entry.kind {
                FsBlobKind::Dir => 0x00,
                FsBlobKind::File => 0x01,
                FsBlobKind::Symlink => 0x02,
            });
            out.extend_from_slice(entry.child_id.as_bytes());
            out.extend_from_slice(&entry.mode.to_le_bytes());
            out.extend_from_slice(&entry.uid.to_le_bytes());
            out.extend_from_slice(&entry.gid.to_le_bytes());
            entry.atime.encode(&mut out);
            entry.mtime.encode(&mut out);
            entry.ctime.encode(&mut out);
            write_varint(&mut out, entry.name.len() as u64);
            out.extend_from_slice(entry.name.as_bytes());
        }
        out
    }

    pub fn deserialize(mut bytes: &[u8]) -> VaultFsResult<Self> {
        let mut entries = Vec::new();
        while !bytes.is_empty() {
            if bytes.len() < 1 + vaultfs_core::BLOCK_ID_LEN + 12 + 3 * Timestamp::ENCODED_LEN {
                return Err(VaultFsError::BadFormat("directory entry truncated".into()));
            }
            let kind = match bytes[0] {
                0x00 => FsBlobKind::Dir,
                0x01 => FsBlobKind::File,
                0x02 => FsBlobKind::Symlink,
                other => return Err(VaultFsError::BadFormat(format!("unknown directory entry kind {other:#x}"))),
            };
            let mut pos = 1;
            let mut id_raw = [0u8; vaultfs_core::BLOCK_ID_LEN];
            id_raw.copy_from_slice(&bytes[pos..pos + vaultfs_core::BLOCK_ID_LEN]);
            let child_id = BlockId::from_bytes(id_raw);
            pos += vaultfs_core::BLOCK_ID_LEN;
            let mode = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let uid = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let gid = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let atime = Timestamp::decode(&bytes[pos..pos + Timestamp::ENCODED_LEN]);
            pos += Timestamp::ENCODED_LEN;
            let mtime = Timestamp::decode(&bytes[pos..pos + Timestamp::ENCODED_LEN]);
            pos += Timestamp::ENCODED_LEN;
            let ctime = Timestamp::decode(&bytes[pos..pos + Timestamp::ENCODED_LEN]);
            pos += Timestamp::ENCODED_LEN;
            let (name_len, varint_len) = read_varint(&bytes[pos..])?;
            pos += varint_len;
            let name_len = name_len as usize;
            if bytes.len() < pos + name_len {
                return Err(VaultFsError::BadFormat("directory entry name truncated".into()));
            }
            let name = String::from_utf8(bytes[pos..pos + name_len].to_vec())
                .map_err(|_| VaultFsError::BadFormat("directory entry name is not valid UTF-8".into()))?;
            pos += name_len;
            entries.push(DirEntry {
                kind,
                child_id,
                mode,
                uid,
                gid,
                atime,
                mtime,
                ctime,
                name,
            });
            bytes = &bytes[pos..];
        }
        Ok(Self { entries })
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8]) -> VaultFsResult<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(VaultFsError::BadFormat("varint too long".into()));
        }
    }
    Err(VaultFsError::BadFormat("truncated varint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_id() -> BlockId {
        BlockId::random()
    }

    #[test]
    fn add_rejects_duplicate_name() {
        let mut list = DirEntryList::new();
        list.add("f", FsBlobKind::File, entry_id(), 0o644, 0, 0).unwrap();
        assert!(matches!(
            list.add("f", FsBlobKind::File, entry_id(), 0o644, 0, 0),
            Err(VaultFsError::AlreadyExists)
        ));
    }

    #[test]
    fn add_or_overwrite_replaces_compatible_kind_and_calls_callback() {
        let mut list = DirEntryList::new();
        let old_id = entry_id();
        list.add("f", FsBlobKind::File, old_id, 0o644, 0, 0).unwrap();

        let mut freed = None;
        let new_id = entry_id();
        list.add_or_overwrite("f", FsBlobKind::File, new_id, 0o644, 0, 0, |id| freed = Some(id))
            .unwrap();

        assert_eq!(freed, Some(old_id));
        assert_eq!(list.get_by_name("f").unwrap().child_id, new_id);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn add_or_overwrite_rejects_incompatible_kind() {
        let mut list = DirEntryList::new();
        list.add("f", FsBlobKind::File, entry_id(), 0o644, 0, 0).unwrap();
        assert!(matches!(
            list.add_or_overwrite("f", FsBlobKind::Dir, entry_id(), 0o755, 0, 0, |_| {}),
            Err(VaultFsError::NotADirectory)
        ));
    }

    #[test]
    fn serialize_deserialize_roundtrips_as_a_set() {
        let mut list = DirEntryList::new();
        list.add("alpha", FsBlobKind::File, entry_id(), 0o644, 1, 1).unwrap();
        list.add("beta", FsBlobKind::Dir, entry_id(), 0o755, 2, 2).unwrap();
        list.add("gamma", FsBlobKind::Symlink, entry_id(), 0o777, 3, 3).unwrap();

        let bytes = list.serialize();
        let decoded = DirEntryList::deserialize(&bytes).unwrap();

        let mut original: Vec<&str> = list.list().iter().map(|e| e.name.as_str()).collect();
        let mut roundtripped: Vec<&str> = decoded.list().iter().map(|e| e.name.as_str()).collect();
        original.sort();
        roundtripped.sort();
        assert_eq!(original, roundtripped);
        for name in original {
            let a = list.get_by_name(name).unwrap();
            let b = decoded.get_by_name(name).unwrap();
            assert_eq!(a.child_id, b.child_id);
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.mode, b.mode);
        }
    }

    #[test]
    fn remove_by_name_and_by_id() {
        let mut list = DirEntryList::new();
        let id = entry_id();
        list.add("f", FsBlobKind::File, id, 0o644, 0, 0).unwrap();
        list.remove_by_name("f").unwrap();
        assert!(list.is_empty());

        list.add("g", FsBlobKind::File, id, 0o644, 0, 0).unwrap();
        list.remove_by_id(id).unwrap();
        assert!(list.is_empty());
    }
}
