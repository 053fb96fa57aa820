//! Directory-tree entries and their binary KV payload encoding.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub const IT_FILE: u8 = 0x0e;
pub const IT_DIRECTORY: u8 = 0x0f;
pub const ITEM_PADDING_SIZE: u64 = 128;
/// `(block_size: u32, item_size: u32, item_type: u8)`.
pub const ITEM_HDR_SIZE: usize = 9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRef {
    pub seek: u64,
    pub chunk_size: u64,
    pub remote_key: Option<String>,
    pub replica_count: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ItemKind {
    Directory,
    File { size: u64, chunks: Vec<ChunkRef> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub item_id: u64,
    pub parent_dir_id: u64,
    pub name: String,
    pub create_datetime: DateTime<Utc>,
    pub modify_datetime: DateTime<Utc>,
    /// Never journaled, never replicated — set for tempfile-pattern writes.
    #[serde(default)]
    pub is_local: bool,
    pub kind: ItemKind,
}

impl Item {
    pub fn root() -> Self {
        let now = Utc::now();
        Self {
            item_id: 0,
            parent_dir_id: 0,
            name: "/".to_string(),
            create_datetime: now,
            modify_datetime: now,
            is_local: false,
            kind: ItemKind::Directory,
        }
    }

    pub fn new_directory(item_id: u64, parent_dir_id: u64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            item_id,
            parent_dir_id,
            name: name.into(),
            create_datetime: now,
            modify_datetime: now,
            is_local: false,
            kind: ItemKind::Directory,
        }
    }

    pub fn new_file(item_id: u64, parent_dir_id: u64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            item_id,
            parent_dir_id,
            name: name.into(),
            create_datetime: now,
            modify_datetime: now,
            is_local: false,
            kind: ItemKind::File {
                size: 0,
                chunks: Vec::new(),
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ItemKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn touch(&mut self) {
        self.modify_datetime = Utc::now();
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            ItemKind::File { size, .. } => *size,
            ItemKind::Directory => 0,
        }
    }

    pub fn chunks(&self) -> &[ChunkRef] {
        match &self.kind {
            ItemKind::File { chunks, .. } => chunks,
            ItemKind::Directory => &[],
        }
    }

    /// Pack as `hdr(block_size, item_size, item_type) || serde_json(item) || padding`,
    /// padded to a multiple of [`ITEM_PADDING_SIZE`], mirroring the original's
    /// fixed-size-slot item records.
    pub fn pack(&self) -> Vec<u8> {
        let item_type = if self.is_dir() { IT_DIRECTORY } else { IT_FILE };
        let payload = serde_json::to_vec(self).expect("Item serialization is infallible");
        let item_size = (ITEM_HDR_SIZE + payload.len()) as u32;
        let block_size = (((item_size as u64 / ITEM_PADDING_SIZE) + 1) * ITEM_PADDING_SIZE) as u32;

        let mut out = Vec::with_capacity(block_size as usize);
        out.write_u32::<LittleEndian>(block_size).unwrap();
        out.write_u32::<LittleEndian>(item_size).unwrap();
        out.write_u8(item_type).unwrap();
        out.extend_from_slice(&payload);
        out.resize(block_size as usize, b' ');
        out
    }

    pub fn unpack(raw: &[u8]) -> Option<Self> {
        if raw.len() < ITEM_HDR_SIZE {
            return None;
        }
        let mut hdr = Cursor::new(&raw[..ITEM_HDR_SIZE]);
        let _block_size = hdr.read_u32::<LittleEndian>().ok()?;
        let item_size = hdr.read_u32::<LittleEndian>().ok()? as usize;
        let _item_type = hdr.read_u8().ok()?;
        if item_size < ITEM_HDR_SIZE || item_size > raw.len() {
            return None;
        }
        let payload = &raw[ITEM_HDR_SIZE..item_size];
        serde_json::from_slice(payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips_directory() {
        let item = Item::new_directory(3, 0, "docs");
        let packed = item.pack();
        assert_eq!(packed.len() % ITEM_PADDING_SIZE as usize, 0);
        let unpacked = Item::unpack(&packed).unwrap();
        assert_eq!(unpacked, item);
    }

    #[test]
    fn pack_unpack_round_trips_file_with_chunks() {
        let mut item = Item::new_file(9, 3, "report.pdf");
        item.kind = ItemKind::File {
            size: 42,
            chunks: vec![ChunkRef {
                seek: 0,
                chunk_size: 42,
                remote_key: Some("abc123".into()),
                replica_count: 2,
            }],
        };
        let packed = item.pack();
        let unpacked = Item::unpack(&packed).unwrap();
        assert_eq!(unpacked, item);
    }
}
