use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::Path;

use crc::{Crc, CRC_64_REDIS};

use crate::db::{Databases, Db};
use crate::dynstr::DynStr;
use crate::error::ServerError;
use crate::obj::{SortedSet, Value};

const MAGIC: &[u8; 4] = b"RTDB";
const VERSION: u16 = 1;

const OP_SELECTDB: u8 = 0xFE;
const OP_EXPIRE_MS: u8 = 0xFD;
const OP_EOF: u8 = 0xFF;

const TAG_STRING: u8 = 0;
const TAG_LIST: u8 = 1;
const TAG_SET: u8 = 2;
const TAG_ZSET: u8 = 3;
const TAG_HASH: u8 = 4;

const STR_RAW: u8 = 0;
const STR_LZF: u8 = 1;

/// Strings shorter than this are never worth the lzf attempt.
const COMPRESS_MIN: usize = 32;

const CHECKSUM: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Length-prefixed byte string, lzf-compressed when it pays off.
fn put_string(buf: &mut Vec<u8>, data: &[u8], compression: bool) {
    if compression && data.len() > COMPRESS_MIN {
        if let Ok(compressed) = lzf::compress(data) {
            if compressed.len() < data.len() {
                buf.push(STR_LZF);
                put_u32(buf, data.len() as u32);
                put_u32(buf, compressed.len() as u32);
                buf.extend_from_slice(&compressed);
                return;
            }
        }
    }
    buf.push(STR_RAW);
    put_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

fn tag_of(value: &Value) -> u8 {
    match value {
        Value::Str(_) => TAG_STRING,
        Value::List(_) => TAG_LIST,
        Value::Set(_) => TAG_SET,
        Value::ZSet(_) => TAG_ZSET,
        Value::Hash(_) => TAG_HASH,
    }
}

fn put_payload(buf: &mut Vec<u8>, value: &Value, compression: bool) {
    match value {
        Value::Str(s) => put_string(buf, s.bytes(), compression),
        Value::List(list) => {
            put_u32(buf, list.len() as u32);
            for item in list {
                put_string(buf, item, compression);
            }
        }
        Value::Set(set) => {
            put_u32(buf, set.len() as u32);
            for member in set {
                put_string(buf, member, compression);
            }
        }
        Value::ZSet(zset) => {
            put_u32(buf, zset.len() as u32);
            for (member, score) in zset.iter() {
                put_string(buf, member, compression);
                put_u64(buf, score.to_bits());
            }
        }
        Value::Hash(hash) => {
            put_u32(buf, hash.len() as u32);
            for (field, value) in hash {
                put_string(buf, field, compression);
                put_string(buf, value, compression);
            }
        }
    }
}

/// Serialize a point-in-time view of the keyspaces. The same bytes go
/// to a snapshot file or, for replication full resync, straight to a
/// memory buffer.
pub fn serialize(dbs: &Databases, compression: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 * 1024);
    buf.extend_from_slice(MAGIC);
    put_u16(&mut buf, VERSION);
    for (index, db) in dbs.iter() {
        if db.is_empty() {
            continue;
        }
        buf.push(OP_SELECTDB);
        put_u32(&mut buf, index as u32);
        for (key, value) in &db.dict {
            if let Some(&at) = db.expires.get(key) {
                buf.push(OP_EXPIRE_MS);
                put_u64(&mut buf, at);
            }
            buf.push(tag_of(value));
            put_u32(&mut buf, key.len() as u32);
            buf.extend_from_slice(key);
            put_payload(&mut buf, value, compression);
        }
    }
    buf.push(OP_EOF);
    let sum = CHECKSUM.checksum(&buf);
    put_u64(&mut buf, sum);
    buf
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn corrupt(msg: &str) -> ServerError {
        ServerError::Persistence(format!("bad snapshot: {}", msg))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ServerError> {
        if self.pos + n > self.buf.len() {
            return Err(Self::corrupt("unexpected end of file"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ServerError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ServerError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ServerError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ServerError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn string(&mut self) -> Result<Vec<u8>, ServerError> {
        match self.u8()? {
            STR_RAW => {
                let len = self.u32()? as usize;
                Ok(self.take(len)?.to_vec())
            }
            STR_LZF => {
                let ulen = self.u32()? as usize;
                let clen = self.u32()? as usize;
                let compressed = self.take(clen)?;
                let data = lzf::decompress(compressed, ulen)
                    .map_err(|e| Self::corrupt(&format!("lzf: {:?}", e)))?;
                if data.len() != ulen {
                    return Err(Self::corrupt("lzf length mismatch"));
                }
                Ok(data)
            }
            _ => Err(Self::corrupt("unknown string encoding")),
        }
    }

    fn value(&mut self, tag: u8) -> Result<Value, ServerError> {
        match tag {
            TAG_STRING => Ok(Value::Str(DynStr::from_bytes(&self.string()?))),
            TAG_LIST => {
                let count = self.u32()?;
                let mut list = VecDeque::with_capacity(count as usize);
                for _ in 0..count {
                    list.push_back(self.string()?);
                }
                Ok(Value::List(list))
            }
            TAG_SET => {
                let count = self.u32()?;
                let mut set = HashSet::with_capacity(count as usize);
                for _ in 0..count {
                    set.insert(self.string()?);
                }
                Ok(Value::Set(set))
            }
            TAG_ZSET => {
                let count = self.u32()?;
                let mut zset = SortedSet::new();
                for _ in 0..count {
                    let member = self.string()?;
                    let score = f64::from_bits(self.u64()?);
                    zset.insert(member, score);
                }
                Ok(Value::ZSet(zset))
            }
            TAG_HASH => {
                let count = self.u32()?;
                let mut hash = HashMap::with_capacity(count as usize);
                for _ in 0..count {
                    let field = self.string()?;
                    let value = self.string()?;
                    hash.insert(field, value);
                }
                Ok(Value::Hash(hash))
            }
            _ => Err(Self::corrupt("unknown value tag")),
        }
    }
}

/// Decode a snapshot, verifying the header and the checksum before
/// applying anything. Entries whose expiration already passed are
/// dropped.
pub fn load_from_bytes(
    bytes: &[u8],
    db_count: usize,
    now_ms: u64,
) -> Result<Databases, ServerError> {
    if bytes.len() < MAGIC.len() + 2 + 1 + 8 {
        return Err(ServerError::Persistence("snapshot too short".to_string()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 8);
    let mut sum = [0u8; 8];
    sum.copy_from_slice(trailer);
    if CHECKSUM.checksum(body) != u64::from_be_bytes(sum) {
        return Err(ServerError::Persistence("checksum mismatch".to_string()));
    }

    let mut r = Reader { buf: body, pos: 0 };
    if r.take(4)? != MAGIC {
        return Err(ServerError::Persistence("bad magic".to_string()));
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(ServerError::Persistence(format!(
            "unsupported snapshot version {}",
            version
        )));
    }

    let mut dbs = Databases::new(db_count);
    let mut current = 0usize;
    let mut pending_expire: Option<u64> = None;
    loop {
        let op = r.u8()?;
        match op {
            OP_EOF => break,
            OP_SELECTDB => {
                let index = r.u32()? as usize;
                if index >= db_count {
                    return Err(ServerError::Persistence(format!(
                        "snapshot db index {} out of range",
                        index
                    )));
                }
                current = index;
            }
            OP_EXPIRE_MS => {
                pending_expire = Some(r.u64()?);
            }
            tag => {
                let key_len = r.u32()? as usize;
                let key = r.take(key_len)?.to_vec();
                let value = r.value(tag)?;
                let expire = pending_expire.take();
                if let Some(at) = expire {
                    if at <= now_ms {
                        continue;
                    }
                }
                let db: &mut Db = dbs.get_mut(current);
                db.set_value(key.clone(), value);
                if let Some(at) = expire {
                    db.set_expire(&key, at);
                }
            }
        }
    }
    Ok(dbs)
}

/// Foreground save: serialize, write a temporary file, fsync, rename
/// over the target.
pub fn save_to_file(
    dbs: &Databases,
    path: &str,
    compression: bool,
) -> Result<(), ServerError> {
    let bytes = serialize(dbs, compression);
    let tmp = format!("{}.tmp-{}", path, std::process::id());
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Load a snapshot file if present. Ok(None) when there is nothing to
/// load; corruption is an error that refuses startup.
pub fn load_file(
    path: &str,
    db_count: usize,
    now_ms: u64,
) -> Result<Option<Databases>, ServerError> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    Ok(Some(load_from_bytes(&bytes, db_count, now_ms)?))
}
