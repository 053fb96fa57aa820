//! Bit-exact binary key encoding for the catalog's KV store.
//!
//! `(parent_id: u64, item_hash: u32, key_type: u8)`, all little-endian,
//! packed with no padding — 13 bytes per key.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const KT_ADDR: u8 = 1;
pub const KT_ITEM: u8 = 2;

pub const KEY_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub key_type: u8,
    pub parent_id: u64,
    pub item_hash: u32,
}

impl Key {
    pub fn item(item_id: u64) -> Self {
        Self {
            key_type: KT_ITEM,
            parent_id: item_id,
            item_hash: 0,
        }
    }

    pub fn addr(parent_id: u64, item_hash: u32) -> Self {
        Self {
            key_type: KT_ADDR,
            parent_id,
            item_hash,
        }
    }

    pub fn dump(&self) -> [u8; KEY_LEN] {
        let mut buf = [0u8; KEY_LEN];
        {
            let mut w = &mut buf[..];
            w.write_u64::<LittleEndian>(self.parent_id).unwrap();
            w.write_u32::<LittleEndian>(self.item_hash).unwrap();
            w.write_u8(self.key_type).unwrap();
        }
        buf
    }

    pub fn from_dump(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut r = bytes;
        let parent_id = r.read_u64::<LittleEndian>().ok()?;
        let item_hash = r.read_u32::<LittleEndian>().ok()?;
        let key_type = r.read_u8().ok()?;
        Some(Self {
            key_type,
            parent_id,
            item_hash,
        })
    }
}

/// Adler-32 over the UTF-8 name bytes, matching the original `zlib.adler32`
/// hash used to bucket directory children.
pub fn hash_name(name: &str) -> u32 {
    adler32::adler32(name.as_bytes()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips() {
        let k = Key::addr(42, 0xdead_beef);
        let dumped = k.dump();
        assert_eq!(dumped.len(), KEY_LEN);
        let k2 = Key::from_dump(&dumped).unwrap();
        assert_eq!(k, k2);
    }

    #[test]
    fn item_key_has_zero_hash() {
        let k = Key::item(7);
        assert_eq!(k.item_hash, 0);
        assert_eq!(k.key_type, KT_ITEM);
    }

    #[test]
    fn hash_name_is_deterministic() {
        assert_eq!(hash_name("a.txt"), hash_name("a.txt"));
    }
}
