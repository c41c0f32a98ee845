use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crc32fast::Hasher;
use fs2::FileExt;

use crate::bdoc::{read_varint, write_varint};
use crate::error::{Error, Result};

/// Size of the opaque per-database header region reserved for engine use.
pub const OPAQUE_HEADER_SIZE: usize = 112;

const MAGIC: &[u8; 4] = b"OPKV";
const VERSION: u32 = 1;

const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;
const OP_HEADER: u8 = 3;
const OP_DROP_DB: u8 = 4;

/// Open flags for the storage file.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub truncate: bool,
    pub readonly: bool,
    pub no_lock: bool,
    pub lock_nonblocking: bool,
    /// fsync the data file on every committed transaction.
    pub tsync: bool,
}

/// Write-ahead log settings.
#[derive(Debug, Clone)]
pub struct WalOpts {
    pub enabled: bool,
    pub check_crc_on_checkpoint: bool,
    /// WAL size that triggers a checkpoint.
    pub checkpoint_buffer_sz: u64,
    pub checkpoint_timeout_sec: u32,
    pub savepoint_timeout_sec: u32,
    pub wal_buffer_sz: usize,
}

impl Default for WalOpts {
    fn default() -> Self {
        WalOpts {
            enabled: true,
            check_crc_on_checkpoint: true,
            checkpoint_buffer_sz: 64 * 1024 * 1024,
            checkpoint_timeout_sec: 300,
            savepoint_timeout_sec: 10,
            wal_buffer_sz: 8 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// The KV store contract consumed by the engine
// ---------------------------------------------------------------------------

/// Ordered transactional KV store: named databases within one file, addressed
/// by a 32-bit id, each with byte-ordered keys and an opaque header region.
pub trait Kv: Send + Sync {
    /// Get or create a database handle.
    fn database(&self, id: u32) -> Result<DbHandle>;
    /// Drop a database and all its contents.
    fn drop_database(&self, id: u32) -> Result<()>;
    fn database_ids(&self) -> Vec<u32>;
    /// Begin a buffered write transaction spanning any number of databases.
    fn begin(&self) -> Result<Box<dyn KvTxn>>;
    /// Pin a read view of the whole store.
    fn snapshot(&self) -> Box<dyn KvSnapshot>;
    /// Force a checkpoint of all committed state.
    fn sync(&self) -> Result<()>;
    /// Write a consistent copy of the store to `target` while writers proceed.
    fn online_copy(&self, target: &Path) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// One named database within the store.
pub trait KvDb: Send + Sync {
    fn id(&self) -> u32;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn count(&self) -> u64;
    /// First entry with key > `key` (or >= when `inclusive`).
    fn next_above(&self, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)>;
    /// Last entry with key < `key` (or <= when `inclusive`).
    fn prev_below(&self, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)>;
    fn first(&self) -> Option<(Vec<u8>, Vec<u8>)>;
    fn last(&self) -> Option<(Vec<u8>, Vec<u8>)>;
    fn read_header(&self) -> Result<[u8; OPAQUE_HEADER_SIZE]>;
    /// Immediate durable header write outside any transaction.
    fn write_header(&self, data: &[u8]) -> Result<()>;
}

pub type DbHandle = Arc<dyn KvDb>;

/// Buffered write transaction. Dropping without `commit` discards all ops.
pub trait KvTxn: Send {
    fn put(&mut self, db: u32, key: Vec<u8>, value: Vec<u8>);
    fn del(&mut self, db: u32, key: Vec<u8>);
    fn write_header(&mut self, db: u32, data: Vec<u8>);
    /// Drop a whole database with the transaction.
    fn drop_db(&mut self, db: u32);
    fn commit(self: Box<Self>) -> Result<()>;
}

/// A stable read view. Writers proceed; the view does not change.
pub trait KvSnapshot: Send {
    fn get(&self, db: u32, key: &[u8]) -> Option<Vec<u8>>;
    fn next_above(&self, db: u32, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)>;
    fn prev_below(&self, db: u32, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)>;
    fn first(&self, db: u32) -> Option<(Vec<u8>, Vec<u8>)>;
    fn last(&self, db: u32) -> Option<(Vec<u8>, Vec<u8>)>;
    fn count(&self, db: u32) -> u64;
}

// ---------------------------------------------------------------------------
// Bundled single-file implementation
// ---------------------------------------------------------------------------

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone)]
struct DbState {
    map: Arc<Map>,
    header: [u8; OPAQUE_HEADER_SIZE],
}

impl DbState {
    fn new() -> Self {
        DbState {
            map: Arc::new(BTreeMap::new()),
            header: [0; OPAQUE_HEADER_SIZE],
        }
    }
}

struct Shared {
    data_path: PathBuf,
    wal_path: PathBuf,
    flags: OpenFlags,
    wal_opts: WalOpts,
    dbs: RwLock<HashMap<u32, DbState>>,
    /// Serializes commits and checkpoints.
    commit_mu: Mutex<()>,
    wal_file: Mutex<Option<File>>,
    wal_bytes: AtomicU64,
    lock_file: Mutex<Option<File>>,
}

/// Single-file KV store: the committed dataset lives in a checkpoint file,
/// mutations go through a CRC-framed WAL replayed on open.
pub struct FileKv {
    shared: Arc<Shared>,
}

impl FileKv {
    pub fn open(path: &Path, flags: OpenFlags, wal_opts: WalOpts) -> Result<FileKv> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let wal_path = wal_sibling(path);

        if flags.truncate && !flags.readonly {
            let _ = fs::remove_file(path);
            let _ = fs::remove_file(&wal_path);
        }

        let lock_file = if flags.no_lock {
            None
        } else {
            let f = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;
            if flags.readonly {
                if flags.lock_nonblocking {
                    FileExt::try_lock_shared(&f).map_err(|_| Error::LockedNonblocking)?;
                } else {
                    FileExt::lock_shared(&f)?;
                }
            } else if flags.lock_nonblocking {
                FileExt::try_lock_exclusive(&f).map_err(|_| Error::LockedNonblocking)?;
            } else {
                FileExt::lock_exclusive(&f)?;
            }
            Some(f)
        };

        let mut dbs = load_checkpoint(path)?;
        let replayed = replay_wal(&wal_path, &mut dbs)?;

        let shared = Arc::new(Shared {
            data_path: path.to_path_buf(),
            wal_path,
            flags,
            wal_opts,
            dbs: RwLock::new(dbs),
            commit_mu: Mutex::new(()),
            wal_file: Mutex::new(None),
            wal_bytes: AtomicU64::new(0),
            lock_file: Mutex::new(lock_file),
        });

        let kv = FileKv { shared };
        if !flags.readonly {
            // Fold any replayed WAL into a fresh checkpoint, then start clean.
            if replayed > 0 {
                kv.checkpoint()?;
                fs::remove_file(&kv.shared.wal_path)?;
            }
            kv.shared.open_wal()?;
        }
        Ok(kv)
    }

    fn checkpoint(&self) -> Result<()> {
        let _guard = self.shared.commit_mu.lock().unwrap();
        self.shared.checkpoint_locked()
    }
}

fn wal_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push("-wal");
    PathBuf::from(os)
}

impl Shared {
    fn open_wal(&self) -> Result<()> {
        if !self.wal_opts.enabled {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.wal_path)?;
        self.wal_bytes.store(file.metadata()?.len(), Ordering::Relaxed);
        *self.wal_file.lock().unwrap() = Some(file);
        Ok(())
    }

    /// Write the whole committed dataset to the checkpoint file (tmp +
    /// rename) and truncate the WAL. Caller holds `commit_mu`.
    fn checkpoint_locked(&self) -> Result<()> {
        let states: Vec<(u32, DbState)> = {
            let dbs = self.dbs.read().unwrap();
            let mut v: Vec<_> = dbs.iter().map(|(id, st)| (*id, st.clone())).collect();
            v.sort_by_key(|(id, _)| *id);
            v
        };
        write_checkpoint_file(&self.data_path, &states)?;
        let mut wal = self.wal_file.lock().unwrap();
        if let Some(f) = wal.as_mut() {
            f.set_len(0)?;
            f.sync_data()?;
        }
        self.wal_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn apply_ops(&self, ops: &[TxnOp]) {
        let mut dbs = self.dbs.write().unwrap();
        for op in ops {
            match op {
                TxnOp::Put { db, key, value } => {
                    let st = dbs.entry(*db).or_insert_with(DbState::new);
                    Arc::make_mut(&mut st.map).insert(key.clone(), value.clone());
                }
                TxnOp::Del { db, key } => {
                    if let Some(st) = dbs.get_mut(db) {
                        Arc::make_mut(&mut st.map).remove(key);
                    }
                }
                TxnOp::Header { db, data } => {
                    let st = dbs.entry(*db).or_insert_with(DbState::new);
                    let n = data.len().min(OPAQUE_HEADER_SIZE);
                    st.header[..n].copy_from_slice(&data[..n]);
                }
                TxnOp::DropDb { db } => {
                    dbs.remove(db);
                }
            }
        }
    }

    fn commit_ops(&self, ops: Vec<TxnOp>) -> Result<()> {
        if self.flags.readonly {
            return Err(Error::InvalidState("store is read-only".into()));
        }
        if ops.is_empty() {
            return Ok(());
        }
        let _guard = self.commit_mu.lock().unwrap();
        // WAL first, then the in-memory maps.
        if self.wal_opts.enabled {
            let payload = encode_ops(&ops);
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let crc = hasher.finalize();

            let mut wal = self.wal_file.lock().unwrap();
            let file = wal
                .as_mut()
                .ok_or_else(|| Error::InvalidState("wal is not open".into()))?;
            file.seek(SeekFrom::End(0))?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_data()?;
            self.wal_bytes
                .fetch_add(8 + payload.len() as u64, Ordering::Relaxed);
        }
        self.apply_ops(&ops);
        drop(_guard);

        if !self.wal_opts.enabled
            || self.flags.tsync
            || self.wal_bytes.load(Ordering::Relaxed) > self.wal_opts.checkpoint_buffer_sz
        {
            let _guard = self.commit_mu.lock().unwrap();
            self.checkpoint_locked()?;
        }
        Ok(())
    }
}

impl Kv for FileKv {
    fn database(&self, id: u32) -> Result<DbHandle> {
        {
            let mut dbs = self.shared.dbs.write().unwrap();
            dbs.entry(id).or_insert_with(DbState::new);
        }
        Ok(Arc::new(FileKvDb {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    fn drop_database(&self, id: u32) -> Result<()> {
        self.shared.commit_ops(vec![TxnOp::DropDb { db: id }])
    }

    fn database_ids(&self) -> Vec<u32> {
        let dbs = self.shared.dbs.read().unwrap();
        let mut ids: Vec<u32> = dbs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn begin(&self) -> Result<Box<dyn KvTxn>> {
        if self.shared.flags.readonly {
            return Err(Error::InvalidState("store is read-only".into()));
        }
        Ok(Box::new(FileTxn {
            shared: Arc::clone(&self.shared),
            ops: Vec::new(),
        }))
    }

    fn snapshot(&self) -> Box<dyn KvSnapshot> {
        let dbs = self.shared.dbs.read().unwrap();
        Box::new(FileSnapshot {
            dbs: dbs
                .iter()
                .map(|(id, st)| (*id, Arc::clone(&st.map)))
                .collect(),
        })
    }

    fn sync(&self) -> Result<()> {
        if self.shared.flags.readonly {
            return Ok(());
        }
        self.checkpoint()
    }

    fn online_copy(&self, target: &Path) -> Result<()> {
        // Clone the Arcs under the read lock, serialize without it.
        let states: Vec<(u32, DbState)> = {
            let dbs = self.shared.dbs.read().unwrap();
            let mut v: Vec<_> = dbs.iter().map(|(id, st)| (*id, st.clone())).collect();
            v.sort_by_key(|(id, _)| *id);
            v
        };
        write_checkpoint_file(target, &states)
    }

    fn close(&self) -> Result<()> {
        if !self.shared.flags.readonly {
            self.checkpoint()?;
            let _ = fs::remove_file(&self.shared.wal_path);
        }
        if let Some(f) = self.shared.lock_file.lock().unwrap().take() {
            let _ = fs2::FileExt::unlock(&f);
        }
        Ok(())
    }
}

struct FileKvDb {
    shared: Arc<Shared>,
    id: u32,
}

impl FileKvDb {
    fn map(&self) -> Option<Arc<Map>> {
        let dbs = self.shared.dbs.read().unwrap();
        dbs.get(&self.id).map(|st| Arc::clone(&st.map))
    }
}

impl KvDb for FileKvDb {
    fn id(&self) -> u32 {
        self.id
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map().and_then(|m| m.get(key).cloned()))
    }

    fn count(&self) -> u64 {
        self.map().map(|m| m.len() as u64).unwrap_or(0)
    }

    fn next_above(&self, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        let map = self.map()?;
        let lo = if inclusive {
            Bound::Included(key.to_vec())
        } else {
            Bound::Excluded(key.to_vec())
        };
        map.range((lo, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn prev_below(&self, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        let map = self.map()?;
        let hi = if inclusive {
            Bound::Included(key.to_vec())
        } else {
            Bound::Excluded(key.to_vec())
        };
        map.range((Bound::Unbounded, hi))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn first(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let map = self.map()?;
        map.iter().next().map(|(k, v)| (k.clone(), v.clone()))
    }

    fn last(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let map = self.map()?;
        map.iter().next_back().map(|(k, v)| (k.clone(), v.clone()))
    }

    fn read_header(&self) -> Result<[u8; OPAQUE_HEADER_SIZE]> {
        let dbs = self.shared.dbs.read().unwrap();
        Ok(dbs
            .get(&self.id)
            .map(|st| st.header)
            .unwrap_or([0; OPAQUE_HEADER_SIZE]))
    }

    fn write_header(&self, data: &[u8]) -> Result<()> {
        self.shared.commit_ops(vec![TxnOp::Header {
            db: self.id,
            data: data.to_vec(),
        }])
    }
}

#[derive(Debug, Clone)]
enum TxnOp {
    Put { db: u32, key: Vec<u8>, value: Vec<u8> },
    Del { db: u32, key: Vec<u8> },
    Header { db: u32, data: Vec<u8> },
    DropDb { db: u32 },
}

struct FileTxn {
    shared: Arc<Shared>,
    ops: Vec<TxnOp>,
}

impl KvTxn for FileTxn {
    fn put(&mut self, db: u32, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(TxnOp::Put { db, key, value });
    }

    fn del(&mut self, db: u32, key: Vec<u8>) {
        self.ops.push(TxnOp::Del { db, key });
    }

    fn write_header(&mut self, db: u32, data: Vec<u8>) {
        self.ops.push(TxnOp::Header { db, data });
    }

    fn drop_db(&mut self, db: u32) {
        self.ops.push(TxnOp::DropDb { db });
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let FileTxn { shared, ops } = *self;
        shared.commit_ops(ops)
    }
}

struct FileSnapshot {
    dbs: HashMap<u32, Arc<Map>>,
}

impl KvSnapshot for FileSnapshot {
    fn get(&self, db: u32, key: &[u8]) -> Option<Vec<u8>> {
        self.dbs.get(&db)?.get(key).cloned()
    }

    fn next_above(&self, db: u32, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        let lo = if inclusive {
            Bound::Included(key.to_vec())
        } else {
            Bound::Excluded(key.to_vec())
        };
        self.dbs
            .get(&db)?
            .range((lo, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn prev_below(&self, db: u32, key: &[u8], inclusive: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        let hi = if inclusive {
            Bound::Included(key.to_vec())
        } else {
            Bound::Excluded(key.to_vec())
        };
        self.dbs
            .get(&db)?
            .range((Bound::Unbounded, hi))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn first(&self, db: u32) -> Option<(Vec<u8>, Vec<u8>)> {
        self.dbs
            .get(&db)?
            .iter()
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn last(&self, db: u32) -> Option<(Vec<u8>, Vec<u8>)> {
        self.dbs
            .get(&db)?
            .iter()
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn count(&self, db: u32) -> u64 {
        self.dbs.get(&db).map(|m| m.len() as u64).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// File formats
// ---------------------------------------------------------------------------

fn encode_ops(ops: &[TxnOp]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_varint(&mut buf, ops.len() as u64);
    for op in ops {
        match op {
            TxnOp::Put { db, key, value } => {
                buf.push(OP_PUT);
                buf.extend_from_slice(&db.to_le_bytes());
                write_varint(&mut buf, key.len() as u64);
                buf.extend_from_slice(key);
                write_varint(&mut buf, value.len() as u64);
                buf.extend_from_slice(value);
            }
            TxnOp::Del { db, key } => {
                buf.push(OP_DEL);
                buf.extend_from_slice(&db.to_le_bytes());
                write_varint(&mut buf, key.len() as u64);
                buf.extend_from_slice(key);
            }
            TxnOp::Header { db, data } => {
                buf.push(OP_HEADER);
                buf.extend_from_slice(&db.to_le_bytes());
                write_varint(&mut buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            TxnOp::DropDb { db } => {
                buf.push(OP_DROP_DB);
                buf.extend_from_slice(&db.to_le_bytes());
            }
        }
    }
    buf
}

fn decode_ops(payload: &[u8]) -> Result<Vec<TxnOp>> {
    let mut pos = 0usize;
    let count = read_varint(payload, &mut pos)?;
    let mut ops = Vec::with_capacity(count as usize);
    let take = |payload: &[u8], pos: &mut usize, n: usize| -> Result<Vec<u8>> {
        let end = *pos + n;
        let slice = payload
            .get(*pos..end)
            .ok_or_else(|| Error::Corrupt("truncated wal op".into()))?;
        *pos = end;
        Ok(slice.to_vec())
    };
    for _ in 0..count {
        let tag = *payload
            .get(pos)
            .ok_or_else(|| Error::Corrupt("truncated wal op".into()))?;
        pos += 1;
        let db_bytes = take(payload, &mut pos, 4)?;
        let db = u32::from_le_bytes(db_bytes.try_into().unwrap());
        match tag {
            OP_PUT => {
                let klen = read_varint(payload, &mut pos)? as usize;
                let key = take(payload, &mut pos, klen)?;
                let vlen = read_varint(payload, &mut pos)? as usize;
                let value = take(payload, &mut pos, vlen)?;
                ops.push(TxnOp::Put { db, key, value });
            }
            OP_DEL => {
                let klen = read_varint(payload, &mut pos)? as usize;
                let key = take(payload, &mut pos, klen)?;
                ops.push(TxnOp::Del { db, key });
            }
            OP_HEADER => {
                let dlen = read_varint(payload, &mut pos)? as usize;
                let data = take(payload, &mut pos, dlen)?;
                ops.push(TxnOp::Header { db, data });
            }
            OP_DROP_DB => ops.push(TxnOp::DropDb { db }),
            other => return Err(Error::Corrupt(format!("unknown wal op tag {other}"))),
        }
    }
    Ok(ops)
}

/// Checkpoint layout: MAGIC, VERSION, body_len u64, body_crc u32, body.
/// Body: db_count u32, then per db: id u32, opaque header, entry_count u64,
/// entries as (klen varint, key, vlen varint, value).
fn write_checkpoint_file(path: &Path, states: &[(u32, DbState)]) -> Result<()> {
    let mut body = Vec::with_capacity(4096);
    body.extend_from_slice(&(states.len() as u32).to_le_bytes());
    for (id, st) in states {
        body.extend_from_slice(&id.to_le_bytes());
        body.extend_from_slice(&st.header);
        body.extend_from_slice(&(st.map.len() as u64).to_le_bytes());
        for (k, v) in st.map.iter() {
            write_varint(&mut body, k.len() as u64);
            body.extend_from_slice(k);
            write_varint(&mut body, v.len() as u64);
            body.extend_from_slice(v);
        }
    }
    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(MAGIC)?;
        f.write_all(&VERSION.to_le_bytes())?;
        f.write_all(&(body.len() as u64).to_le_bytes())?;
        f.write_all(&crc.to_le_bytes())?;
        f.write_all(&body)?;
        f.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_checkpoint(path: &Path) -> Result<HashMap<u32, DbState>> {
    let mut dbs = HashMap::new();
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dbs),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        // Freshly created by the lock-file open.
        return Ok(dbs);
    }
    if data.len() < 20 || &data[0..4] != MAGIC {
        return Err(Error::Corrupt("bad storage file magic".into()));
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if version != VERSION {
        return Err(Error::Corrupt(format!("unsupported storage version {version}")));
    }
    let body_len = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;
    let stored_crc = u32::from_le_bytes(data[16..20].try_into().unwrap());
    let body = data
        .get(20..20 + body_len)
        .ok_or_else(|| Error::Corrupt("truncated storage file".into()))?;
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(Error::Corrupt("storage file crc mismatch".into()));
    }

    let mut pos = 0usize;
    let db_count = u32::from_le_bytes(
        body.get(pos..pos + 4)
            .ok_or_else(|| Error::Corrupt("truncated storage body".into()))?
            .try_into()
            .unwrap(),
    );
    pos += 4;
    for _ in 0..db_count {
        let id = u32::from_le_bytes(
            body.get(pos..pos + 4)
                .ok_or_else(|| Error::Corrupt("truncated db record".into()))?
                .try_into()
                .unwrap(),
        );
        pos += 4;
        let header: [u8; OPAQUE_HEADER_SIZE] = body
            .get(pos..pos + OPAQUE_HEADER_SIZE)
            .ok_or_else(|| Error::Corrupt("truncated db header".into()))?
            .try_into()
            .unwrap();
        pos += OPAQUE_HEADER_SIZE;
        let entry_count = u64::from_le_bytes(
            body.get(pos..pos + 8)
                .ok_or_else(|| Error::Corrupt("truncated db record".into()))?
                .try_into()
                .unwrap(),
        );
        pos += 8;
        let mut map = BTreeMap::new();
        for _ in 0..entry_count {
            let klen = read_varint(body, &mut pos)? as usize;
            let key = body
                .get(pos..pos + klen)
                .ok_or_else(|| Error::Corrupt("truncated entry key".into()))?
                .to_vec();
            pos += klen;
            let vlen = read_varint(body, &mut pos)? as usize;
            let value = body
                .get(pos..pos + vlen)
                .ok_or_else(|| Error::Corrupt("truncated entry value".into()))?
                .to_vec();
            pos += vlen;
            map.insert(key, value);
        }
        dbs.insert(
            id,
            DbState {
                map: Arc::new(map),
                header,
            },
        );
    }
    Ok(dbs)
}

/// Replay WAL frames into `dbs`. Stops at the first truncated or corrupt
/// frame (everything before it is the committed prefix). Returns the number
/// of frames applied.
fn replay_wal(path: &Path, dbs: &mut HashMap<u32, DbState>) -> Result<usize> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut pos = 0usize;
    let mut frames = 0usize;
    while pos + 8 <= data.len() {
        let stored_crc = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        let len = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let Some(payload) = data.get(pos + 8..pos + 8 + len) else {
            break;
        };
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            break;
        }
        let Ok(ops) = decode_ops(payload) else {
            break;
        };
        for op in &ops {
            match op {
                TxnOp::Put { db, key, value } => {
                    let st = dbs.entry(*db).or_insert_with(DbState::new);
                    Arc::make_mut(&mut st.map).insert(key.clone(), value.clone());
                }
                TxnOp::Del { db, key } => {
                    if let Some(st) = dbs.get_mut(db) {
                        Arc::make_mut(&mut st.map).remove(key);
                    }
                }
                TxnOp::Header { db, data } => {
                    let st = dbs.entry(*db).or_insert_with(DbState::new);
                    let n = data.len().min(OPAQUE_HEADER_SIZE);
                    st.header[..n].copy_from_slice(&data[..n]);
                }
                TxnOp::DropDb { db } => {
                    dbs.remove(db);
                }
            }
        }
        frames += 1;
        pos += 8 + len;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FileKv {
        FileKv::open(
            &dir.path().join("kv.dat"),
            OpenFlags::default(),
            WalOpts::default(),
        )
        .unwrap()
    }

    #[test]
    fn put_get_across_txn() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let db = kv.database(2).unwrap();
        let mut txn = kv.begin().unwrap();
        txn.put(2, b"k1".to_vec(), b"v1".to_vec());
        txn.put(2, b"k2".to_vec(), b"v2".to_vec());
        txn.commit().unwrap();
        assert_eq!(db.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.count(), 2);
    }

    #[test]
    fn dropped_txn_discards_ops() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let db = kv.database(2).unwrap();
        {
            let mut txn = kv.begin().unwrap();
            txn.put(2, b"k".to_vec(), b"v".to_vec());
            // dropped, never committed
        }
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn wal_replay_after_unclean_shutdown() {
        let dir = TempDir::new().unwrap();
        {
            let kv = open(&dir);
            let mut txn = kv.begin().unwrap();
            txn.put(3, b"a".to_vec(), b"1".to_vec());
            txn.commit().unwrap();
            // No close(): data lives only in the WAL.
        }
        let kv = open(&dir);
        let db = kv.database(3).unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn clean_close_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = open(&dir);
            let mut txn = kv.begin().unwrap();
            txn.put(1, b"meta".to_vec(), b"m".to_vec());
            txn.write_header(1, b"HDR".to_vec());
            txn.commit().unwrap();
            kv.close().unwrap();
        }
        let kv = open(&dir);
        let db = kv.database(1).unwrap();
        assert_eq!(db.get(b"meta").unwrap(), Some(b"m".to_vec()));
        assert_eq!(&db.read_header().unwrap()[..3], b"HDR");
    }

    #[test]
    fn snapshot_is_stable_under_writes() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let mut txn = kv.begin().unwrap();
        txn.put(2, b"k".to_vec(), b"old".to_vec());
        txn.commit().unwrap();

        let snap = kv.snapshot();
        let mut txn = kv.begin().unwrap();
        txn.put(2, b"k".to_vec(), b"new".to_vec());
        txn.put(2, b"k2".to_vec(), b"x".to_vec());
        txn.commit().unwrap();

        assert_eq!(snap.get(2, b"k"), Some(b"old".to_vec()));
        assert_eq!(snap.count(2), 1);
        let db = kv.database(2).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn range_stepping() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let db = kv.database(2).unwrap();
        let mut txn = kv.begin().unwrap();
        for k in ["b", "d", "f"] {
            txn.put(2, k.as_bytes().to_vec(), vec![]);
        }
        txn.commit().unwrap();

        assert_eq!(db.next_above(b"a", true).unwrap().0, b"b".to_vec());
        assert_eq!(db.next_above(b"b", false).unwrap().0, b"d".to_vec());
        assert_eq!(db.prev_below(b"e", true).unwrap().0, b"d".to_vec());
        assert_eq!(db.prev_below(b"b", false), None);
        assert_eq!(db.first().unwrap().0, b"b".to_vec());
        assert_eq!(db.last().unwrap().0, b"f".to_vec());
    }

    #[test]
    fn drop_database_removes_contents() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let mut txn = kv.begin().unwrap();
        txn.put(7, b"k".to_vec(), b"v".to_vec());
        txn.commit().unwrap();
        kv.drop_database(7).unwrap();
        let db = kv.database(7).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn online_copy_is_openable() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let mut txn = kv.begin().unwrap();
        txn.put(2, b"k".to_vec(), b"v".to_vec());
        txn.commit().unwrap();

        let target = dir.path().join("backup.dat");
        kv.online_copy(&target).unwrap();

        let copy = FileKv::open(&target, OpenFlags::default(), WalOpts::default()).unwrap();
        let db = copy.database(2).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn nonblocking_lock_conflict() {
        let dir = TempDir::new().unwrap();
        let _kv = open(&dir);
        let flags = OpenFlags {
            lock_nonblocking: true,
            ..Default::default()
        };
        let err = FileKv::open(&dir.path().join("kv.dat"), flags, WalOpts::default());
        assert!(matches!(err, Err(Error::LockedNonblocking)));
    }

    #[test]
    fn readonly_rejects_writes() {
        let dir = TempDir::new().unwrap();
        {
            let kv = open(&dir);
            kv.close().unwrap();
        }
        let flags = OpenFlags {
            readonly: true,
            no_lock: true,
            ..Default::default()
        };
        let kv = FileKv::open(&dir.path().join("kv.dat"), flags, WalOpts::default()).unwrap();
        assert!(kv.begin().is_err());
    }

    #[test]
    fn corrupt_checkpoint_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.dat");
        {
            let kv = FileKv::open(&path, OpenFlags::default(), WalOpts::default()).unwrap();
            let mut txn = kv.begin().unwrap();
            txn.put(2, b"k".to_vec(), b"v".to_vec());
            txn.commit().unwrap();
            kv.close().unwrap();
        }
        let mut data = fs::read(&path).unwrap();
        let n = data.len();
        data[n - 1] ^= 0xff;
        fs::write(&path, &data).unwrap();
        let err = FileKv::open(&path, OpenFlags::default(), WalOpts::default());
        assert!(matches!(err, Err(Error::Corrupt(_))));
    }
}
