//! LZ4 frame reading
//!
//! Firmware images may ship as standard LZ4 frames (`.lz4` suffix).
//! Two views exist over the same stream: a block-granular reader that
//! hands frame blocks to the wire verbatim (the bootloader decompresses
//! them itself), and a transparent decompressing [`ByteSource`] for
//! bootloaders without compressed-download support.
//!
//! Only the profile the bootloader accepts is allowed: independent
//! blocks, no block checksums, no dictionary, content size present,
//! blocks of at most 1 MiB.

use crate::error::{Error, Result};
use crate::infrastructure::io::source::{read_exact, ByteSource};

pub const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

pub const ONE_MIB: u64 = 1024 * 1024;

fn fail(msg: impl Into<String>) -> Error {
    Error::Lz4Parse(msg.into())
}

/// Validated frame header fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4FrameHeader {
    pub flg: u8,
    pub bd: u8,
    pub content_size: u64,
    pub max_block_size: u64,
    pub content_checksum: bool,
    pub header_bytes: u64,
}

fn max_block_size_from_bd(bd: u8) -> u64 {
    match (bd >> 4) & 0x07 {
        4 => 64 * 1024,
        5 => 256 * 1024,
        6 => 1024 * 1024,
        7 => 4 * 1024 * 1024,
        _ => 0,
    }
}

/// Parse and validate a frame header, consuming it from `src`.
pub fn parse_frame_header(src: &mut dyn ByteSource) -> Result<Lz4FrameHeader> {
    let mut magic = [0u8; 4];
    read_exact(src, &mut magic)?;
    if magic != LZ4_MAGIC {
        return Err(fail("bad magic (not a standard LZ4 frame)"));
    }

    let mut fb = [0u8; 2];
    read_exact(src, &mut fb)?;
    let (flg, bd) = (fb[0], fb[1]);

    if (flg >> 6) & 0x03 != 1 {
        return Err(fail("unsupported frame version"));
    }
    if flg & 0x20 == 0 {
        return Err(fail("frame must use independent blocks"));
    }
    if flg & 0x10 != 0 {
        return Err(fail("block checksum not supported"));
    }
    if flg & 0x01 != 0 {
        return Err(fail("dictionary ID not supported"));
    }
    if flg & 0x08 == 0 {
        return Err(fail("content size missing (compress with --content-size)"));
    }

    let max_block_size = max_block_size_from_bd(bd);
    if max_block_size == 0 {
        return Err(fail("invalid BD/max block size"));
    }
    if max_block_size > ONE_MIB {
        return Err(fail("max block size > 1MiB not supported"));
    }

    let mut cs = [0u8; 8];
    read_exact(src, &mut cs)?;
    let content_size = u64::from_le_bytes(cs);

    if content_size > ONE_MIB && max_block_size != ONE_MIB {
        return Err(fail("content > 1MiB requires 1MiB blocks (compress with -B6)"));
    }

    // Header checksum byte is skipped, not validated.
    let mut hc = [0u8; 1];
    read_exact(src, &mut hc)?;

    Ok(Lz4FrameHeader {
        flg,
        bd,
        content_size,
        max_block_size,
        content_checksum: flg & 0x04 != 0,
        header_bytes: 4 + 1 + 1 + 8 + 1,
    })
}

/// Block-granular reader: yields raw frame blocks (4-byte size prefix
/// plus payload) without decoding them.
pub struct Lz4BlockReader {
    src: Box<dyn ByteSource>,
    header: Lz4FrameHeader,
    blocks_read: usize,
}

impl Lz4BlockReader {
    pub fn open(mut src: Box<dyn ByteSource>) -> Result<Lz4BlockReader> {
        let header = parse_frame_header(&mut src)?;
        Ok(Lz4BlockReader {
            src,
            header,
            blocks_read: 0,
        })
    }

    pub fn content_size(&self) -> u64 {
        self.header.content_size
    }

    /// Number of 1 MiB blocks the whole frame decodes to.
    pub fn total_blocks_1m(&self) -> usize {
        if self.header.content_size == 0 {
            0
        } else {
            self.header.content_size.div_ceil(ONE_MIB) as usize
        }
    }

    pub fn blocks_remaining_1m(&self) -> usize {
        self.total_blocks_1m().saturating_sub(self.blocks_read)
    }

    /// Append exactly `n` frame blocks to `out`, size prefixes included.
    /// Returns the number of bytes appended. An end-mark inside the
    /// requested range is an error.
    pub fn read_blocks(&mut self, n: usize, out: &mut Vec<u8>) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }
        if self.blocks_read + n > self.total_blocks_1m() {
            return Err(fail("too many blocks requested"));
        }

        let before = out.len();
        for _ in 0..n {
            let mut szb = [0u8; 4];
            read_exact(self.src.as_mut(), &mut szb)?;

            let raw_sz = u32::from_le_bytes(szb);
            if raw_sz == 0 {
                return Err(fail("encountered endmark unexpectedly"));
            }
            // MSB set means the block is stored uncompressed.
            let payload = (raw_sz & 0x7FFF_FFFF) as usize;

            let off = out.len();
            out.resize(off + 4 + payload, 0);
            out[off..off + 4].copy_from_slice(&szb);
            if payload > 0 {
                read_exact(self.src.as_mut(), &mut out[off + 4..])?;
            }

            self.blocks_read += 1;
        }

        Ok(out.len() - before)
    }
}

/// Transparent decompressing source: serves reads from a 1 MiB block
/// buffer, refilling on demand until `content_size` bytes are produced.
pub struct Lz4DecompressedSource {
    src: Box<dyn ByteSource>,
    display: String,
    total_out: u64,
    produced: u64,
    block_out: Vec<u8>,
    block_off: usize,
    comp_payload: Vec<u8>,
}

impl Lz4DecompressedSource {
    pub fn open(mut src: Box<dyn ByteSource>) -> Result<Box<dyn ByteSource>> {
        let header = parse_frame_header(&mut src)?;
        let display = src.display_name();
        Ok(Box::new(Lz4DecompressedSource {
            src,
            display,
            total_out: header.content_size,
            produced: 0,
            block_out: Vec::with_capacity(ONE_MIB as usize),
            block_off: 0,
            comp_payload: Vec::with_capacity(ONE_MIB as usize + 64),
        }))
    }

    fn fill_next_block(&mut self) -> Result<()> {
        let remaining = self.total_out - self.produced;
        let expected_out = remaining.min(ONE_MIB) as usize;

        let mut szb = [0u8; 4];
        read_exact(self.src.as_mut(), &mut szb)?;

        let raw_sz = u32::from_le_bytes(szb);
        if raw_sz == 0 {
            return Err(fail("encountered endmark unexpectedly while decoding"));
        }

        let uncompressed = raw_sz & 0x8000_0000 != 0;
        let payload = (raw_sz & 0x7FFF_FFFF) as usize;

        self.comp_payload.resize(payload, 0);
        if payload > 0 {
            read_exact(self.src.as_mut(), &mut self.comp_payload)?;
        }

        self.block_out.resize(expected_out, 0);

        if uncompressed {
            if payload != expected_out {
                return Err(fail("uncompressed block size mismatch"));
            }
            self.block_out.copy_from_slice(&self.comp_payload);
        } else {
            let written = lz4_flex::block::decompress_into(&self.comp_payload, &mut self.block_out)
                .map_err(|e| fail(format!("decompression failed: {e}")))?;
            if written != expected_out {
                return Err(fail("decompression produced unexpected size"));
            }
        }

        self.produced += expected_out as u64;
        self.block_off = 0;
        Ok(())
    }
}

impl ByteSource for Lz4DecompressedSource {
    fn display_name(&self) -> String {
        self.display.clone()
    }

    fn size(&self) -> u64 {
        self.total_out
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        while written < out.len() {
            if self.block_off >= self.block_out.len() {
                self.block_out.clear();
                self.block_off = 0;

                if self.produced >= self.total_out {
                    break;
                }
                self.fill_next_block()?;
            }

            let avail = self.block_out.len() - self.block_off;
            let want = avail.min(out.len() - written);
            out[written..written + want]
                .copy_from_slice(&self.block_out[self.block_off..self.block_off + want]);

            self.block_off += want;
            written += want;
        }

        Ok(written)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    struct MemSource(std::io::Cursor<Vec<u8>>, u64);

    impl ByteSource for MemSource {
        fn display_name(&self) -> String {
            "mem".into()
        }
        fn size(&self) -> u64 {
            self.1
        }
        fn read(&mut self, out: &mut [u8]) -> Result<usize> {
            Ok(std::io::Read::read(&mut self.0, out)?)
        }
    }

    fn mem(bytes: Vec<u8>) -> Box<dyn ByteSource> {
        let len = bytes.len() as u64;
        Box::new(MemSource(std::io::Cursor::new(bytes), len))
    }

    /// Build a frame in the accepted profile: BD as given, content size
    /// present, 1 MiB independent blocks, no checksums.
    pub(crate) fn build_frame(data: &[u8], bd_id: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&LZ4_MAGIC);
        out.push(0b0110_1000); // version 1, independent, content size
        out.push(bd_id << 4);
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        out.push(0); // header checksum, never validated

        for chunk in data.chunks(ONE_MIB as usize) {
            let comp = lz4_flex::block::compress(chunk);
            if comp.len() < chunk.len() {
                out.extend_from_slice(&(comp.len() as u32).to_le_bytes());
                out.extend_from_slice(&comp);
            } else {
                out.extend_from_slice(&(chunk.len() as u32 | 0x8000_0000).to_le_bytes());
                out.extend_from_slice(chunk);
            }
        }
        out.extend_from_slice(&0u32.to_le_bytes()); // endmark
        out
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn header_gates() {
        let good = build_frame(b"hello", 4);
        assert!(parse_frame_header(&mut mem(good.clone())).is_ok());

        let mut bad_magic = good.clone();
        bad_magic[0] = 0;
        assert!(parse_frame_header(&mut mem(bad_magic)).is_err());

        let mut dependent = good.clone();
        dependent[4] &= !0x20;
        assert!(parse_frame_header(&mut mem(dependent)).is_err());

        let mut block_checksum = good.clone();
        block_checksum[4] |= 0x10;
        assert!(parse_frame_header(&mut mem(block_checksum)).is_err());

        let mut dict = good.clone();
        dict[4] |= 0x01;
        assert!(parse_frame_header(&mut mem(dict)).is_err());

        let mut no_size = good.clone();
        no_size[4] &= !0x08;
        assert!(parse_frame_header(&mut mem(no_size)).is_err());

        let mut huge_blocks = good;
        huge_blocks[5] = 7 << 4;
        assert!(parse_frame_header(&mut mem(huge_blocks)).is_err());
    }

    #[test]
    fn large_content_requires_1m_blocks() {
        let data = patterned(ONE_MIB as usize + 1);
        let bad = build_frame(&data, 5);
        assert!(matches!(
            parse_frame_header(&mut mem(bad)),
            Err(Error::Lz4Parse(_))
        ));

        let good = build_frame(&data, 6);
        let h = parse_frame_header(&mut mem(good)).unwrap();
        assert_eq!(h.content_size, ONE_MIB + 1);
    }

    #[test]
    fn small_content_any_bd() {
        for bd in [4u8, 5, 6] {
            let frame = build_frame(b"tiny", bd);
            assert!(parse_frame_header(&mut mem(frame)).is_ok());
        }
    }

    #[test]
    fn decompressed_source_yields_exact_content() {
        let data = patterned(2 * ONE_MIB as usize + 12345);
        let frame = build_frame(&data, 6);

        let mut src = Lz4DecompressedSource::open(mem(frame)).unwrap();
        assert_eq!(src.size(), data.len() as u64);

        let mut out = Vec::new();
        let mut buf = [0u8; 70000];
        loop {
            let n = src.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);

        // Past the end: nothing more, even though the endmark follows.
        assert_eq!(src.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn block_reader_passes_blocks_verbatim() {
        let data = patterned(2 * ONE_MIB as usize + 777);
        let frame = build_frame(&data, 6);

        let mut r = Lz4BlockReader::open(mem(frame.clone())).unwrap();
        assert_eq!(r.total_blocks_1m(), 3);
        assert_eq!(r.blocks_remaining_1m(), 3);

        let mut out = Vec::new();
        let n = r.read_blocks(2, &mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(r.blocks_remaining_1m(), 1);

        // The bytes must match the frame body verbatim.
        let body_off = 15; // magic+FLG+BD+content size+HC
        assert_eq!(&frame[body_off..body_off + out.len()], &out[..]);

        let mut rest = Vec::new();
        r.read_blocks(1, &mut rest).unwrap();
        assert_eq!(r.blocks_remaining_1m(), 0);
        assert!(r.read_blocks(1, &mut rest).is_err());
    }

    #[test]
    fn endmark_mid_stream_is_error() {
        let mut frame = build_frame(b"abc", 4);
        // Replace the single data block with an endmark.
        frame.truncate(15);
        frame.extend_from_slice(&0u32.to_le_bytes());

        let mut r = Lz4BlockReader::open(mem(frame)).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            r.read_blocks(1, &mut out),
            Err(Error::Lz4Parse(_))
        ));
    }
}
