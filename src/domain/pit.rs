//! Partition Information Table codec
//!
//! The PIT is a little-endian binary table the bootloader serves in
//! download mode: a 28-byte header followed by 132-byte entries. Legacy
//! bootloaders disagree on which column holds the begin block, so
//! parsing applies a heuristic over the whole table before deriving
//! per-partition geometry.

use log::debug;

use crate::error::{Error, Result};

pub const PIT_MAGIC: i32 = 0x1234_9876;

pub const HEADER_LEN: usize = 28;
pub const ENTRY_LEN: usize = 132;

const NAME_LEN: usize = 32;

/// One partition, with geometry already derived from the raw table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub id: i32,
    pub dev_type: i32,

    /// First block of the partition on its device.
    pub begin_block: i32,
    /// Bytes per block: 4096 on UFS (dev_type 8), 512 otherwise.
    pub block_bytes: i32,
    /// Length in blocks, derived from the neighbour's begin block.
    pub block_size: i32,
    /// Derived byte size (`block_bytes * block_size`).
    pub file_size: u64,

    pub name: String,
    pub file_name: String,
}

/// A parsed partition information table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PitTable {
    pub com_tar2: String,
    /// Bootloader/SoC family id; must match across a device group.
    pub cpu_bl_id: String,
    pub lu_count: u16,

    pub partitions: Vec<Partition>,
}

impl PitTable {
    /// Linear scan for the first partition whose `file_name` matches.
    pub fn find_by_file_name(&self, basename: &str) -> Option<&Partition> {
        if basename.is_empty() {
            return None;
        }
        self.partitions.iter().find(|p| p.file_name == basename)
    }
}

fn fail(msg: impl Into<String>) -> Error {
    Error::PitParse(msg.into())
}

fn read_i32(bytes: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
}

/// NUL-terminated fixed field, lossy on non-UTF-8 firmware strings.
fn trim_nul_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Fixed field with trailing whitespace also stripped (header strings).
fn trim_fixed_field(bytes: &[u8]) -> String {
    let mut s = trim_nul_string(bytes);
    while s.ends_with([' ', '\t', '\r', '\n']) {
        s.pop();
    }
    s
}

fn block_bytes_for_dev_type(dev_type: i32) -> i32 {
    if dev_type == 8 {
        4096
    } else {
        512
    }
}

/// Raw wire fields of one entry, before geometry derivation.
#[derive(Clone, Default)]
struct RawEntry {
    dev_type: i32,
    id: i32,
    block_size_field: i32,
    block_length: i32,
    offset: i32,
    name: String,
    file_name: String,
}

/// Parse a PIT blob into a table.
pub fn parse(bytes: &[u8]) -> Result<PitTable> {
    if bytes.len() < HEADER_LEN {
        return Err(fail("buffer too small for header"));
    }

    let magic = read_i32(bytes, 0);
    if magic != PIT_MAGIC {
        return Err(fail(format!("bad magic 0x{:08x}", magic as u32)));
    }

    let count = read_i32(bytes, 4);
    if count < 0 {
        return Err(fail("negative partition count"));
    }
    let count = count as usize;

    let required = HEADER_LEN + count * ENTRY_LEN;
    if bytes.len() < required {
        return Err(fail("buffer smaller than declared partition table"));
    }

    let mut out = PitTable {
        com_tar2: trim_fixed_field(&bytes[8..16]),
        cpu_bl_id: trim_fixed_field(&bytes[16..24]),
        lu_count: read_u16(bytes, 24),
        partitions: Vec::with_capacity(count),
    };

    let mut raw = Vec::with_capacity(count);
    for i in 0..count {
        let e = &bytes[HEADER_LEN + i * ENTRY_LEN..HEADER_LEN + (i + 1) * ENTRY_LEN];
        raw.push(RawEntry {
            dev_type: read_i32(e, 4),
            id: read_i32(e, 8),
            block_size_field: read_i32(e, 20),
            block_length: read_i32(e, 24),
            offset: read_i32(e, 28),
            name: trim_nul_string(&e[36..36 + NAME_LEN]),
            file_name: trim_nul_string(&e[68..68 + NAME_LEN]),
        });
    }

    // Legacy tables disagree on which column is the begin block. If any
    // blockSize exceeds 4096 while every offset stays within 4096, the
    // blockSize column is the begin block; otherwise offset is.
    let max_block_size = raw.iter().map(|r| r.block_size_field).max().unwrap_or(0);
    let max_offset = raw.iter().map(|r| r.offset).max().unwrap_or(0);
    let block_size_is_begin = max_block_size > 4096 && max_offset <= 4096;

    for r in &raw {
        let begin_block = if block_size_is_begin {
            r.block_size_field
        } else {
            r.offset
        };
        out.partitions.push(Partition {
            id: r.id,
            dev_type: r.dev_type,
            begin_block,
            block_bytes: block_bytes_for_dev_type(r.dev_type),
            block_size: 0,
            file_size: 0,
            name: r.name.clone(),
            file_name: r.file_name.clone(),
        });
    }

    // Per device type: each partition runs up to its successor's begin
    // block; the terminal one keeps the declared block length.
    let mut dev_types: Vec<i32> = raw.iter().map(|r| r.dev_type).collect();
    dev_types.sort_unstable();
    dev_types.dedup();

    for dev in dev_types {
        let mut idxs: Vec<usize> = (0..out.partitions.len())
            .filter(|&i| out.partitions[i].dev_type == dev)
            .collect();
        idxs.sort_by_key(|&i| out.partitions[i].begin_block);

        for k in 0..idxs.len() {
            let i = idxs[k];
            let blocks = if k + 1 < idxs.len() {
                let next_begin = out.partitions[idxs[k + 1]].begin_block;
                let cur_begin = out.partitions[i].begin_block;
                if next_begin > cur_begin {
                    next_begin - cur_begin
                } else {
                    0
                }
            } else if raw[i].block_length > 0 {
                raw[i].block_length
            } else {
                0
            };

            let p = &mut out.partitions[i];
            p.block_size = blocks;
            let bb = if p.block_bytes > 0 { p.block_bytes as u64 } else { 0 };
            let bc = if p.block_size > 0 { p.block_size as u64 } else { 0 };
            p.file_size = bb * bc;
        }
    }

    debug!(
        "Parsed PIT: {} partitions, cpu_bl_id='{}'",
        out.partitions.len(),
        out.cpu_bl_id
    );
    Ok(out)
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_fixed_str(out: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (len - n), 0);
}

/// Encode a table back into the wire layout `parse` accepts.
///
/// Begin blocks land in the `offset` column and block counts in the
/// declared block length, so the begin-block heuristic resolves the
/// same way on re-parse.
pub fn synthesize(table: &PitTable) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + table.partitions.len() * ENTRY_LEN);

    put_i32(&mut out, PIT_MAGIC);
    put_i32(&mut out, table.partitions.len() as i32);
    put_fixed_str(&mut out, &table.com_tar2, 8);
    put_fixed_str(&mut out, &table.cpu_bl_id, 8);
    out.extend_from_slice(&table.lu_count.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    for p in &table.partitions {
        put_i32(&mut out, 0); // bin type
        put_i32(&mut out, p.dev_type);
        put_i32(&mut out, p.id);
        put_i32(&mut out, 0); // attribute
        put_i32(&mut out, 0); // update attribute
        put_i32(&mut out, 0); // block size column unused on encode
        put_i32(&mut out, p.block_size);
        put_i32(&mut out, p.begin_block);
        put_i32(&mut out, 0); // file size column is always derived
        put_fixed_str(&mut out, &p.name, NAME_LEN);
        put_fixed_str(&mut out, &p.file_name, NAME_LEN);
        out.resize(out.len() + NAME_LEN, 0); // delta name
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(id: i32, dev_type: i32, begin: i32, blocks: i32, name: &str, file: &str) -> Partition {
        let block_bytes = block_bytes_for_dev_type(dev_type);
        Partition {
            id,
            dev_type,
            begin_block: begin,
            block_bytes,
            block_size: blocks,
            file_size: block_bytes as u64 * blocks as u64,
            name: name.to_string(),
            file_name: file.to_string(),
        }
    }

    fn sample_table() -> PitTable {
        PitTable {
            com_tar2: "COM_TAR2".into(),
            cpu_bl_id: "EXYNOS".into(),
            lu_count: 3,
            partitions: vec![
                part(1, 8, 0, 8192, "BOOTLOADER", "sboot.bin"),
                part(2, 8, 8192, 16384, "BOOT", "boot.img"),
                part(3, 8, 24576, 4096, "USERDATA", "userdata.img"),
                part(80, 2, 0, 1024, "CP", "modem.bin"),
            ],
        }
    }

    #[test]
    fn round_trip_preserves_table() {
        let table = sample_table();
        let bytes = synthesize(&table);
        assert_eq!(bytes.len(), HEADER_LEN + 4 * ENTRY_LEN);

        let reparsed = parse(&bytes).unwrap();
        assert_eq!(reparsed, table);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = synthesize(&sample_table());
        bytes[0] ^= 0xFF;
        assert!(matches!(parse(&bytes), Err(Error::PitParse(_))));
    }

    #[test]
    fn rejects_truncated_table() {
        let bytes = synthesize(&sample_table());
        assert!(parse(&bytes[..bytes.len() - 1]).is_err());
        assert!(parse(&bytes[..HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn block_size_column_heuristic() {
        // Table where the blockSize column carries the begin block and
        // offsets stay small: the heuristic must flip.
        let table = sample_table();
        let mut bytes = synthesize(&table);
        for (i, p) in table.partitions.iter().enumerate() {
            let e = HEADER_LEN + i * ENTRY_LEN;
            bytes[e + 20..e + 24].copy_from_slice(&p.begin_block.to_le_bytes());
            bytes[e + 28..e + 32].copy_from_slice(&0i32.to_le_bytes());
        }
        let reparsed = parse(&bytes).unwrap();
        assert_eq!(reparsed, table);
    }

    #[test]
    fn ufs_block_bytes() {
        let table = parse(&synthesize(&sample_table())).unwrap();
        let boot = table.find_by_file_name("boot.img").unwrap();
        assert_eq!(boot.block_bytes, 4096);
        assert_eq!(boot.file_size, 4096 * 16384);

        let modem = table.find_by_file_name("modem.bin").unwrap();
        assert_eq!(modem.block_bytes, 512);
    }

    #[test]
    fn derived_block_size_uses_successor_delta() {
        let mut table = sample_table();
        // Declare a bogus block count on a non-terminal partition; the
        // delta to the next begin block must win on parse.
        table.partitions[0].block_size = 1;
        let parsed = parse(&synthesize(&table)).unwrap();
        assert_eq!(parsed.partitions[0].block_size, 8192);
        // Terminal partition keeps its declared length.
        assert_eq!(parsed.partitions[2].block_size, 4096);
    }

    #[test]
    fn find_by_file_name_misses() {
        let table = sample_table();
        assert!(table.find_by_file_name("recovery.img").is_none());
        assert!(table.find_by_file_name("").is_none());
    }
}
