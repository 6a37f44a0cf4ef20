//! Saving and loading snapshots.
//!
//! Layout (big-endian, strings are a `u16` length followed by UTF-8):
//!
//! ```text
//! "CPRF" version:u32 begin_time:i64 time_taken:i64 two_timestamps:u8
//! table_len:u32 entry_count:u32 { id:u16 class method signature }*
//! thread_count:u32 {
//!     thread_id:u32 name two_timestamps:u8 compact_len:u32 compact_bytes
//!     node_size:u32 gross_time:u64 x2 pure_time:u64 x2 net_time:u64 x2
//!     total_invocations:u64 display_whole_thread_cpu:u8
//! }*
//! ```
//!
//! The method table is written sparsely: slots that were only padding
//! between real ids (see [`MethodName::is_placeholder`]) are skipped and
//! `table_len` restores them on load.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use callprof_protocol::{MethodId, MethodName, SharedStr, THREAD_METHOD_ID};
use thiserror::Error;
use tracing::debug;

use crate::compact::{CompactError, CompactTree, header_size};
use crate::model::{CpuSnapshot, MethodTable, ThreadData, ThreadTimes};

const MAGIC: &[u8; 4] = b"CPRF";
pub const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not a snapshot file")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("compact tree: {0}")]
    Compact(#[from] CompactError),
}

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<(), SnapshotError> {
    let len = u16::try_from(s.len()).map_err(|_| SnapshotError::Corrupt("string longer than 65535 bytes"))?;
    w.write_u16::<BigEndian>(len)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(r: &mut R) -> Result<SharedStr, SnapshotError> {
    let len = usize::from(r.read_u16::<BigEndian>()?);
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let s = String::from_utf8(buf).map_err(|_| SnapshotError::InvalidUtf8)?;
    Ok(s.into())
}

fn read_bool<R: Read>(r: &mut R) -> Result<bool, SnapshotError> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(SnapshotError::Corrupt("flag byte is neither 0 nor 1")),
    }
}

fn count_u32(n: usize, what: &'static str) -> Result<u32, SnapshotError> {
    u32::try_from(n).map_err(|_| SnapshotError::Corrupt(what))
}

pub fn write_snapshot<W: Write>(snapshot: &CpuSnapshot, w: &mut W) -> Result<(), SnapshotError> {
    w.write_all(MAGIC)?;
    w.write_u32::<BigEndian>(FORMAT_VERSION)?;
    w.write_i64::<BigEndian>(snapshot.begin_time())?;
    w.write_i64::<BigEndian>(snapshot.time_taken())?;
    w.write_u8(u8::from(snapshot.two_timestamps()))?;

    let methods = snapshot.methods().as_slice();
    // Slot 0 is the thread pseudo-method and is implied.
    let stored: Vec<(MethodId, &MethodName)> = methods
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, m)| !m.is_placeholder())
        .filter_map(|(i, m)| MethodId::try_from(i).ok().map(|id| (id, m)))
        .collect();
    w.write_u32::<BigEndian>(count_u32(methods.len(), "too many methods")?)?;
    w.write_u32::<BigEndian>(count_u32(stored.len(), "too many methods")?)?;
    for (id, m) in stored {
        w.write_u16::<BigEndian>(id)?;
        write_str(w, &m.class)?;
        write_str(w, &m.method)?;
        write_str(w, &m.signature)?;
    }

    let threads = snapshot.threads();
    w.write_u32::<BigEndian>(count_u32(threads.len(), "too many threads")?)?;
    for t in threads {
        let tree = t.method_tree();
        w.write_u32::<BigEndian>(t.id)?;
        write_str(w, &t.name)?;
        w.write_u8(u8::from(tree.two_timestamps()))?;
        w.write_u32::<BigEndian>(count_u32(tree.byte_len(), "compact tree over 4 GiB")?)?;
        w.write_all(tree.as_bytes())?;
        w.write_u32::<BigEndian>(count_u32(tree.node_size(), "node size")?)?;
        let times = &t.times;
        for v in times
            .gross_time
            .iter()
            .chain(&times.pure_time)
            .chain(&times.net_time)
        {
            w.write_u64::<BigEndian>(*v)?;
        }
        w.write_u64::<BigEndian>(times.total_invocations)?;
        w.write_u8(u8::from(times.display_whole_thread_cpu))?;
    }
    Ok(())
}

pub fn read_snapshot<R: Read>(r: &mut R) -> Result<CpuSnapshot, SnapshotError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = r.read_u32::<BigEndian>()?;
    if version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let begin_time = r.read_i64::<BigEndian>()?;
    let time_taken = r.read_i64::<BigEndian>()?;
    let two_timestamps = read_bool(r)?;

    let table_len = r.read_u32::<BigEndian>()? as usize;
    let method_count = r.read_u32::<BigEndian>()? as usize;
    if table_len > usize::from(u16::MAX) + 1 || method_count >= table_len.max(1) {
        return Err(SnapshotError::Corrupt("method count exceeds the id space"));
    }
    let mut methods = MethodTable::new();
    let mut last_id = THREAD_METHOD_ID;
    for _ in 0..method_count {
        let id = r.read_u16::<BigEndian>()?;
        if id <= last_id || usize::from(id) >= table_len {
            return Err(SnapshotError::Corrupt("method ids out of order"));
        }
        last_id = id;
        let class = read_str(r)?;
        let method = read_str(r)?;
        let signature = read_str(r)?;
        methods.set(
            id,
            MethodName {
                class,
                method,
                signature,
            },
        );
    }
    if let Some(last) = table_len.checked_sub(1).and_then(|i| MethodId::try_from(i).ok()) {
        if methods.len() < table_len {
            methods.set(last, MethodName::owner(""));
        }
    }

    let thread_count = r.read_u32::<BigEndian>()?;
    let mut threads = Vec::new();
    for _ in 0..thread_count {
        let id = r.read_u32::<BigEndian>()?;
        let name = read_str(r)?;
        let thread_two_ts = read_bool(r)?;
        let len = r.read_u32::<BigEndian>()? as usize;
        let mut data = Vec::new();
        r.by_ref().take(len as u64).read_to_end(&mut data)?;
        if data.len() != len {
            return Err(SnapshotError::Corrupt("compact data truncated"));
        }
        let node_size = r.read_u32::<BigEndian>()? as usize;
        if node_size != header_size(thread_two_ts) {
            return Err(SnapshotError::Corrupt("node size does not match layout"));
        }
        let tree = CompactTree::from_bytes(data, thread_two_ts)?;

        let mut fields = [0u64; 6];
        for f in &mut fields {
            *f = r.read_u64::<BigEndian>()?;
        }
        let times = ThreadTimes {
            gross_time: [fields[0], fields[1]],
            pure_time: [fields[2], fields[3]],
            net_time: [fields[4], fields[5]],
            total_invocations: r.read_u64::<BigEndian>()?,
            display_whole_thread_cpu: read_bool(r)?,
        };
        threads.push(ThreadData::new(id, name, tree, times));
    }
    debug!(methods = method_count, threads = threads.len(), "snapshot loaded");

    Ok(CpuSnapshot::new(
        begin_time,
        time_taken,
        two_timestamps,
        methods,
        threads,
    ))
}

pub fn to_bytes(snapshot: &CpuSnapshot) -> Result<Vec<u8>, SnapshotError> {
    let mut out = Vec::new();
    write_snapshot(snapshot, &mut out)?;
    Ok(out)
}

pub fn from_bytes(mut bytes: &[u8]) -> Result<CpuSnapshot, SnapshotError> {
    read_snapshot(&mut bytes)
}

pub fn save(snapshot: &CpuSnapshot, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
    let mut w = BufWriter::new(File::create(path)?);
    write_snapshot(snapshot, &mut w)?;
    w.flush()?;
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<CpuSnapshot, SnapshotError> {
    let mut r = BufReader::new(File::open(path)?);
    read_snapshot(&mut r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::OwnedNode;

    fn methods() -> MethodTable {
        MethodTable::from_methods([
            MethodName::new("app.Main", "run", "()V"),
            MethodName::new("app.Work", "step", "(I)J"),
        ])
    }

    fn snapshot() -> CpuSnapshot {
        snapshot_with(methods())
    }

    fn snapshot_with(methods: MethodTable) -> CpuSnapshot {
        let root = OwnedNode::new(0, 1, 0, 30)
            .with_children(vec![OwnedNode::new(1, 1, 10, 30).with_children(vec![OwnedNode::new(2, 3, 20, 20)])]);
        let times = ThreadTimes {
            gross_time: [35, 0],
            pure_time: [31, 0],
            net_time: [30, 0],
            total_invocations: 4,
            display_whole_thread_cpu: false,
        };
        CpuSnapshot::new(
            1_700_000_000_000,
            2500,
            false,
            methods,
            vec![ThreadData::new(3, "main", CompactTree::from_owned(&root, false), times)],
        )
    }

    #[test]
    fn round_trip_in_memory() {
        let original = snapshot();
        let bytes = to_bytes(&original).unwrap();
        assert_eq!(&bytes[..4], b"CPRF");
        let loaded = from_bytes(&bytes).unwrap();

        assert_eq!(loaded.begin_time(), original.begin_time());
        assert_eq!(loaded.time_taken(), 2500);
        assert_eq!(loaded.methods().as_ref(), original.methods().as_ref());
        let (a, b) = (&loaded.threads()[0], &original.threads()[0]);
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, b.name);
        assert_eq!(a.times, b.times);
        assert_eq!(a.method_tree().as_ref(), b.method_tree().as_ref());
    }

    #[test]
    fn padding_between_ids_is_not_written() {
        let mut methods = methods();
        methods.set(0xFFFF, MethodName::new("[servlet]", "/checkout", ""));
        let original = snapshot_with(methods);
        let bytes = to_bytes(&original).unwrap();
        assert!(bytes.len() < 512, "{} bytes", bytes.len());

        let loaded = from_bytes(&bytes).unwrap();
        assert_eq!(loaded.methods().len(), 0x10000);
        assert_eq!(loaded.methods().as_ref(), original.methods().as_ref());
        assert_eq!(loaded.methods().get(0xFFFF).unwrap().method.as_ref(), "/checkout");
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(from_bytes(b"NOPE\0\0\0\x01"), Err(SnapshotError::BadMagic)));
        let mut bytes = to_bytes(&snapshot()).unwrap();
        bytes[7] = 9;
        assert!(matches!(
            from_bytes(&bytes),
            Err(SnapshotError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = to_bytes(&snapshot()).unwrap();
        for cut in [3, 20, bytes.len() - 1] {
            assert!(from_bytes(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }
}
