//! `.tar.md5` package verification
//!
//! Odin packages often ship with an ASCII MD5 trailer appended to the
//! archive: `<32 hex digits>  <name>`. The digest covers every byte
//! before it. Verification runs before any device I/O; a mismatch
//! aborts the whole run.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::info;
use md5::{Digest, Md5};

use crate::application::flasher::{PlanItem, PlanKind, UiHooks};
use crate::error::{Error, Result};
use crate::infrastructure::io::tar::TarArchive;
use crate::infrastructure::io::TwoSlotPrefetcher;

/// The trailer must live in the last 16 KiB of the file.
const TRAILER_MAX_BYTES: u64 = 16 * 1024;
const MD5_HEX_CHARS: usize = 32;

const HASH_BUF: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Md5Job {
    pub path: PathBuf,
    pub bytes_to_hash: u64,
    pub expected: [u8; 16],
}

fn is_hex(c: u8) -> bool {
    c.is_ascii_hexdigit()
}

/// Look for a trailer in the tail of `path`. `None` when the file
/// carries no checksum.
fn detect_md5_job(path: &Path) -> Result<Option<Md5Job>> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    if file_size < (MD5_HEX_CHARS as u64 + 2) {
        return Ok(None);
    }

    let tail_off = file_size.saturating_sub(TRAILER_MAX_BYTES);
    let tail_len = (file_size - tail_off) as usize;

    let mut tail = vec![0u8; tail_len];
    file.seek(SeekFrom::Start(tail_off))?;
    file.read_exact(&mut tail)?;

    // Scan backwards for "<32 hex>  " (digest, two spaces).
    let mut delim: Option<usize> = None;
    for i in (0..tail.len().saturating_sub(1)).rev() {
        if tail[i] != b' ' || tail[i + 1] != b' ' {
            continue;
        }
        let Some(start) = i.checked_sub(MD5_HEX_CHARS) else {
            continue;
        };
        if tail[start..i].iter().all(|&c| is_hex(c)) {
            delim = Some(i);
            break;
        }
    }
    let Some(delim) = delim else {
        return Ok(None);
    };

    let hex_str = std::str::from_utf8(&tail[delim - MD5_HEX_CHARS..delim]).unwrap();
    let decoded = hex::decode(hex_str).expect("scanned digits are hex");
    let mut expected = [0u8; 16];
    expected.copy_from_slice(&decoded);

    let bytes_to_hash = tail_off + (delim - MD5_HEX_CHARS) as u64;
    if file_size - bytes_to_hash > TRAILER_MAX_BYTES {
        return Err(Error::ArchiveParse(format!(
            "MD5 trailer too large: {}",
            path.display()
        )));
    }

    Ok(Some(Md5Job {
        path: path.to_path_buf(),
        bytes_to_hash,
        expected,
    }))
}

/// Collect verification jobs for the archive inputs.
pub fn md5_jobs(inputs: &[PathBuf]) -> Result<Vec<Md5Job>> {
    let mut jobs = Vec::new();
    for p in inputs {
        if !TarArchive::is_tar_file(p) {
            continue;
        }
        if let Some(j) = detect_md5_job(p)? {
            jobs.push(j);
        }
    }
    Ok(jobs)
}

/// Hash the package body with read-ahead, reporting progress against
/// the combined total.
fn md5_hash_prefetch(
    job: &Md5Job,
    done: &AtomicU64,
    total: u64,
    ui: &UiHooks,
) -> Result<[u8; 16]> {
    struct Slot {
        buf: Vec<u8>,
        n: usize,
    }

    let mut file = File::open(&job.path)?;
    let mut remaining = job.bytes_to_hash;
    let path = job.path.clone();

    let mut pf = TwoSlotPrefetcher::new(
        move |s: &mut Slot| {
            if remaining == 0 {
                return Ok(false);
            }
            let want = remaining.min(HASH_BUF as u64) as usize;
            file.read_exact(&mut s.buf[..want]).map_err(|e| {
                Error::ArchiveParse(format!("short read while hashing {}: {e}", path.display()))
            })?;
            s.n = want;
            remaining -= want as u64;
            Ok(true)
        },
        || Slot {
            buf: vec![0u8; HASH_BUF],
            n: 0,
        },
    );

    let mut hasher = Md5::new();
    let mut processed = 0u64;

    while processed < job.bytes_to_hash {
        let Some(s) = pf.next()? else {
            break;
        };
        if s.n == 0 {
            break;
        }

        hasher.update(&s.buf[..s.n]);
        processed += s.n as u64;

        let new_done = done.fetch_add(s.n as u64, Ordering::Relaxed) + s.n as u64;
        ui.progress(new_done, total, new_done, total);
    }

    if processed != job.bytes_to_hash {
        return Err(Error::ArchiveParse(format!(
            "MD5 hashing terminated early: {} (processed {processed}, expected {})",
            job.path.display(),
            job.bytes_to_hash
        )));
    }

    Ok(hasher.finalize().into())
}

/// Verify every job; the first mismatch or read failure aborts.
pub fn md5_verify(jobs: &[Md5Job], ui: &UiHooks) -> Result<()> {
    if jobs.is_empty() {
        return Ok(());
    }

    let total: u64 = jobs.iter().map(|j| j.bytes_to_hash).sum();

    ui.stage("Checking package checksums");
    info!(
        "Checking MD5 on {} package(s), {} bytes total",
        jobs.len(),
        total
    );

    let plan = vec![PlanItem {
        kind: PlanKind::Part,
        part_id: 0,
        dev_type: 0,
        part_name: "Checksums".into(),
        pit_file_name: String::new(),
        source_base: format!("{} package(s)", jobs.len()),
        size: total,
    }];
    ui.plan(&plan, total);
    ui.item_active(0);
    ui.progress(0, total, 0, total);

    let done = AtomicU64::new(0);
    let results: Vec<Result<()>> = std::thread::scope(|s| {
        let done = &done;
        let handles: Vec<_> = jobs
            .iter()
            .map(|job| {
                s.spawn(move || -> Result<()> {
                    let digest = md5_hash_prefetch(job, done, total, ui)?;
                    if digest != job.expected {
                        return Err(Error::ArchiveParse(format!(
                            "MD5 mismatch: {}\n  expected:   {}\n  calculated: {}\n  byte count: {}",
                            job.path.display(),
                            hex::encode(job.expected),
                            hex::encode(digest),
                            job.bytes_to_hash
                        )));
                    }
                    Ok(())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for r in results {
        r?;
    }

    ui.item_done(0);
    info!("MD5 OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn md5_hex(data: &[u8]) -> String {
        let mut h = Md5::new();
        h.update(data);
        hex::encode(h.finalize())
    }

    fn write_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn detects_and_verifies_trailer() {
        let body = vec![0x5Au8; 4096];
        let mut pkg = body.clone();
        pkg.extend_from_slice(format!("{}  pkg.tar\n", md5_hex(&body)).as_bytes());

        let f = write_file(&pkg);
        let job = detect_md5_job(f.path()).unwrap().unwrap();
        assert_eq!(job.bytes_to_hash, 4096);

        let ui = UiHooks::default();
        md5_verify(&[job], &ui).unwrap();
    }

    #[test]
    fn mismatch_fails() {
        let body = vec![0x5Au8; 1024];
        let mut pkg = body.clone();
        pkg.extend_from_slice(format!("{}  pkg.tar\n", md5_hex(b"other")).as_bytes());

        let f = write_file(&pkg);
        let job = detect_md5_job(f.path()).unwrap().unwrap();
        let ui = UiHooks::default();
        assert!(matches!(
            md5_verify(&[job], &ui),
            Err(Error::ArchiveParse(_))
        ));
    }

    #[test]
    fn no_trailer_detected() {
        let f = write_file(&[0u8; 2048]);
        assert!(detect_md5_job(f.path()).unwrap().is_none());

        let tiny = write_file(b"short");
        assert!(detect_md5_job(tiny.path()).unwrap().is_none());
    }
}
