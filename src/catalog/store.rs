//! `ChildAddrList`/`AddressItems` binary framing, and the thin `sled`
//! wrapper the catalog drives them through.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::catalog::key::Key;
use crate::error::Result;

pub const PADDING_SIZE: u64 = 256;
/// `(block_size: u32, addr_size: u32, item_id: u64)`.
pub const HDR_LEN: usize = 16;
const ADDR_LEN: usize = 8;

/// The set of child item ids registered under one directory's `(item_id)`
/// slot within an `AddressItems` blob. Multiple `ChildAddrList`s share one
/// KV value when their owning items' names collide on the same Adler-32
/// hash.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildAddrList {
    pub item_id: u64,
    pub child_ids: Vec<u64>,
}

impl ChildAddrList {
    pub fn new(item_id: u64) -> Self {
        Self {
            item_id,
            child_ids: Vec::new(),
        }
    }

    pub fn dump(&self) -> Vec<u8> {
        let addr_size = (HDR_LEN + self.child_ids.len() * ADDR_LEN) as u32;
        let block_size = (((addr_size as u64 / PADDING_SIZE) + 1) * PADDING_SIZE) as u32;

        let mut out = Vec::with_capacity(block_size as usize);
        out.write_u32::<LittleEndian>(block_size).unwrap();
        out.write_u32::<LittleEndian>(addr_size).unwrap();
        out.write_u64::<LittleEndian>(self.item_id).unwrap();
        for id in &self.child_ids {
            out.write_u64::<LittleEndian>(*id).unwrap();
        }
        out.resize(block_size as usize, b' ');
        out
    }

    /// Parse one `ChildAddrList` off the front of `dumped`, returning it
    /// along with the remaining bytes (the next record, if any).
    pub fn from_dump(dumped: &[u8]) -> Option<(Self, &[u8])> {
        if dumped.len() < HDR_LEN {
            return None;
        }
        let mut hdr = Cursor::new(&dumped[..HDR_LEN]);
        let block_size = hdr.read_u32::<LittleEndian>().ok()? as usize;
        let addr_size = hdr.read_u32::<LittleEndian>().ok()? as usize;
        let item_id = hdr.read_u64::<LittleEndian>().ok()?;

        if addr_size < HDR_LEN || block_size > dumped.len() {
            return None;
        }
        let mut child_ids = Vec::new();
        let mut cur = Cursor::new(&dumped[HDR_LEN..addr_size]);
        while (cur.position() as usize) < addr_size - HDR_LEN {
            child_ids.push(cur.read_u64::<LittleEndian>().ok()?);
        }
        Some((Self { item_id, child_ids }, &dumped[block_size..]))
    }

    /// Read just the header (item_id) and skip to the next record, without
    /// materializing the child list — used for `exists`/`find` scans.
    pub fn header_from_dump(dumped: &[u8]) -> Option<(u64, &[u8])> {
        if dumped.len() < HDR_LEN {
            return None;
        }
        let mut hdr = Cursor::new(&dumped[..HDR_LEN]);
        let block_size = hdr.read_u32::<LittleEndian>().ok()? as usize;
        let _addr_size = hdr.read_u32::<LittleEndian>().ok()?;
        let item_id = hdr.read_u64::<LittleEndian>().ok()?;
        if block_size > dumped.len() {
            return None;
        }
        Some((item_id, &dumped[block_size..]))
    }
}

/// A sequence of `ChildAddrList` records sharing one `AddrKey` slot —
/// normally one, more than one only on a name-hash collision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressItems {
    pub lists: Vec<ChildAddrList>,
}

impl AddressItems {
    pub fn from_dump(mut dumped: &[u8]) -> Self {
        let mut lists = Vec::new();
        while let Some((list, rest)) = ChildAddrList::from_dump(dumped) {
            lists.push(list);
            if rest.is_empty() {
                break;
            }
            dumped = rest;
        }
        Self { lists }
    }

    pub fn iter_item_ids(mut dumped: &[u8]) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some((id, rest)) = ChildAddrList::header_from_dump(dumped) {
            ids.push(id);
            if rest.is_empty() {
                break;
            }
            dumped = rest;
        }
        ids
    }

    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for list in &self.lists {
            out.extend(list.dump());
        }
        out
    }

    pub fn find_mut(&mut self, item_id: u64) -> Option<&mut ChildAddrList> {
        self.lists.iter_mut().find(|l| l.item_id == item_id)
    }

    pub fn remove(&mut self, item_id: u64) -> Option<ChildAddrList> {
        let idx = self.lists.iter().position(|l| l.item_id == item_id)?;
        Some(self.lists.remove(idx))
    }
}

/// Thin wrapper over `sled::Db` keyed by [`Key::dump`].
pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    pub fn wipe_and_reopen(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Self::open(path)
    }

    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.dump())?.map(|v| v.to_vec()))
    }

    pub fn set(&self, key: &Key, value: &[u8]) -> Result<()> {
        self.db.insert(key.dump(), value)?;
        Ok(())
    }

    pub fn remove(&self, key: &Key) -> Result<()> {
        self.db.remove(key.dump())?;
        Ok(())
    }

    pub fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(name)?.map(|v| v.to_vec()))
    }

    pub fn set_meta(&self, name: &str, value: &[u8]) -> Result<()> {
        self.db.insert(name, value)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_addr_list_round_trips() {
        let mut list = ChildAddrList::new(7);
        list.child_ids = vec![1, 2, 3];
        let dumped = list.dump();
        assert_eq!(dumped.len() % PADDING_SIZE as usize, 0);
        let (parsed, rest) = ChildAddrList::from_dump(&dumped).unwrap();
        assert_eq!(parsed, list);
        assert!(rest.is_empty());
    }

    #[test]
    fn address_items_handles_multiple_colliding_lists() {
        let mut a = ChildAddrList::new(1);
        a.child_ids = vec![10];
        let mut b = ChildAddrList::new(2);
        b.child_ids = vec![20, 21];

        let items = AddressItems {
            lists: vec![a.clone(), b.clone()],
        };
        let dumped = items.dump();
        let parsed = AddressItems::from_dump(&dumped);
        assert_eq!(parsed.lists, vec![a, b]);

        let ids = AddressItems::iter_item_ids(&dumped);
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn address_items_remove() {
        let mut items = AddressItems {
            lists: vec![ChildAddrList::new(1), ChildAddrList::new(2)],
        };
        let removed = items.remove(1).unwrap();
        assert_eq!(removed.item_id, 1);
        assert_eq!(items.lists.len(), 1);
    }
}
