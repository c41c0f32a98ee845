use crate::bdoc::{read_varint, write_varint};
use crate::btree::Comparator;
use crate::error::{Error, Result};
use crate::kv::DbHandle;
use crate::pointer::Pointer;

/// KV database holding one packed descriptor record per collection.
pub const META_DB_ID: u32 = 1;

/// Longest allowed collection name, in bytes.
pub const COLLECTION_NAME_MAX_LEN: usize = 255;

pub const IDX_UNIQUE: u8 = 0x01;
pub const IDX_STR: u8 = 0x04;
pub const IDX_I64: u8 = 0x08;
pub const IDX_F64: u8 = 0x10;

/// Index mode bitmask: exactly one of STR | I64 | F64, optionally UNIQUE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMode(pub u8);

impl IndexMode {
    pub fn unique(self) -> bool {
        self.0 & IDX_UNIQUE != 0
    }

    pub fn type_bits(self) -> u8 {
        self.0 & (IDX_STR | IDX_I64 | IDX_F64)
    }

    pub fn validate(self) -> Result<()> {
        let known = IDX_UNIQUE | IDX_STR | IDX_I64 | IDX_F64;
        if self.0 & !known != 0 {
            return Err(Error::InvalidIndexMode(self.0));
        }
        match self.type_bits() {
            IDX_STR | IDX_I64 | IDX_F64 => Ok(()),
            _ => Err(Error::InvalidIndexMode(self.0)),
        }
    }

    pub fn comparator(self) -> Comparator {
        match self.type_bits() {
            IDX_I64 => Comparator::Int64,
            IDX_F64 => Comparator::Decimal,
            _ => Comparator::Lexical,
        }
    }
}

/// Descriptor of one index within a collection.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    /// Canonical JSON pointer text of the indexed path.
    pub path: String,
    pub mode: IndexMode,
    pub db_id: u32,
}

/// Descriptor of one collection: primary database, id seed and indexes.
#[derive(Debug, Clone)]
pub struct CollectionMeta {
    pub name: String,
    pub db_id: u32,
    /// Strictly greater than every assigned document id.
    pub id_seed: i64,
    pub indexes: Vec<IndexMeta>,
}

impl CollectionMeta {
    pub fn new(name: &str, db_id: u32) -> CollectionMeta {
        CollectionMeta {
            name: name.to_string(),
            db_id,
            id_seed: 1,
            indexes: Vec::new(),
        }
    }

    /// Record value layout: db_id u32, id_seed i64, index count varint, then
    /// per index: db_id u32, mode u8, path (varint length + bytes).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.db_id.to_le_bytes());
        buf.extend_from_slice(&self.id_seed.to_le_bytes());
        write_varint(&mut buf, self.indexes.len() as u64);
        for idx in &self.indexes {
            buf.extend_from_slice(&idx.db_id.to_le_bytes());
            buf.push(idx.mode.0);
            write_varint(&mut buf, idx.path.len() as u64);
            buf.extend_from_slice(idx.path.as_bytes());
        }
        buf
    }

    pub fn decode(name: &str, data: &[u8]) -> Result<CollectionMeta> {
        let corrupt = || Error::Corrupt(format!("bad collection descriptor for '{name}'"));
        let mut pos = 0usize;
        let db_id = u32::from_le_bytes(data.get(0..4).ok_or_else(corrupt)?.try_into().unwrap());
        let id_seed = i64::from_le_bytes(data.get(4..12).ok_or_else(corrupt)?.try_into().unwrap());
        pos += 12;
        let n = read_varint(data, &mut pos)?;
        let mut indexes = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let idb = u32::from_le_bytes(
                data.get(pos..pos + 4).ok_or_else(corrupt)?.try_into().unwrap(),
            );
            pos += 4;
            let mode = IndexMode(*data.get(pos).ok_or_else(corrupt)?);
            pos += 1;
            let plen = read_varint(data, &mut pos)? as usize;
            let path = std::str::from_utf8(data.get(pos..pos + plen).ok_or_else(corrupt)?)
                .map_err(|_| corrupt())?
                .to_string();
            pos += plen;
            mode.validate()?;
            indexes.push(IndexMeta {
                path,
                mode,
                db_id: idb,
            });
        }
        if pos != data.len() {
            return Err(corrupt());
        }
        Ok(CollectionMeta {
            name: name.to_string(),
            db_id,
            id_seed,
            indexes,
        })
    }

    pub fn index_for(&self, path: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.path == path)
    }
}

pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > COLLECTION_NAME_MAX_LEN {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// An index path must be absolute, simple (no wildcards) and non-root.
pub fn validate_index_path(path: &str) -> Result<Pointer> {
    let ptr = Pointer::parse(path)?;
    if ptr.is_root() || !ptr.is_simple() {
        return Err(Error::InvalidArgument(format!(
            "index path must be a plain absolute pointer: {path}"
        )));
    }
    Ok(ptr)
}

/// Load every collection descriptor stored in the metadata database.
pub fn load_all(meta_db: &DbHandle) -> Result<Vec<CollectionMeta>> {
    let mut out = Vec::new();
    let mut cursor: Option<Vec<u8>> = None;
    loop {
        let entry = match &cursor {
            None => meta_db.first(),
            Some(last) => meta_db.next_above(last, false),
        };
        let Some((key, value)) = entry else {
            break;
        };
        let name = std::str::from_utf8(&key)
            .map_err(|_| Error::Corrupt("collection name is not valid utf-8".into()))?;
        out.push(CollectionMeta::decode(name, &value)?);
        cursor = Some(key);
    }
    Ok(out)
}
