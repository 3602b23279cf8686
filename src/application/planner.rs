//! Flash planning
//!
//! Expands the host-supplied inputs (raw images and tar packages) into
//! [`ImageSpec`]s, honors the optional in-package download list, and
//! binds specs to PIT partitions.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use log::error;

use crate::domain::pit::{Partition, PitTable};
use crate::error::{Error, Result};
use crate::infrastructure::io::lz4;
use crate::infrastructure::io::tar::{basename_of, TarArchive, TarEntry};
use crate::infrastructure::io::{open_raw_file, open_tar_entry, ByteSource};

/// Archive member that switches planning into download-list mode.
const DOWNLOAD_LIST_NAMES: [&str; 2] = [
    "meta-data/download-list.txt",
    "./meta-data/download-list.txt",
];

const DOWNLOAD_LIST_MAX_BYTES: u64 = 128 * 1024;

/// Where an image's bytes live.
#[derive(Debug, Clone)]
pub enum SpecOrigin {
    RawFile(PathBuf),
    TarMember(PathBuf, TarEntry),
}

/// One host-side image mapped (later) onto a partition.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub origin: SpecOrigin,

    /// On-disk name.
    pub source_basename: String,
    /// `source_basename` with a `.lz4` suffix removed.
    pub basename: String,

    /// Compressed size on disk.
    pub disk_size: u64,
    /// Logical size: decompressed for LZ4 inputs.
    pub size: u64,

    pub lz4: bool,
    pub download_list_mode: bool,

    /// Human-readable origin for messages.
    pub display: String,
}

impl ImageSpec {
    pub fn open(&self) -> Result<Box<dyn ByteSource>> {
        match &self.origin {
            SpecOrigin::RawFile(p) => open_raw_file(p),
            SpecOrigin::TarMember(tar, entry) => open_tar_entry(tar, entry),
        }
    }
}

/// A source bound to the partition it flashes.
#[derive(Debug, Clone)]
pub struct FlashItem {
    pub part: Partition,
    pub spec: ImageSpec,
}

fn is_lz4_name(base: &str) -> bool {
    base.len() >= 4 && base[base.len() - 4..].eq_ignore_ascii_case(".lz4")
}

fn strip_lz4_suffix(base: &str) -> String {
    if is_lz4_name(base) {
        base[..base.len() - 4].to_string()
    } else {
        base.to_string()
    }
}

fn is_download_list_name(name: &str) -> bool {
    DOWNLOAD_LIST_NAMES.contains(&name)
}

/// Whole-source read for small metadata members.
fn read_text(src: &mut dyn ByteSource, max_bytes: u64, what: &str) -> Result<String> {
    let n = src.size();
    if n > max_bytes {
        return Err(Error::ArchiveParse(format!(
            "{what} is too large: {n} bytes (limit {max_bytes})"
        )));
    }

    let mut buf = vec![0u8; n as usize];
    crate::infrastructure::io::read_exact(src, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Newline-separated basenames; trimmed, empty lines skipped,
/// duplicates rejected, an empty list rejected.
fn parse_download_list(text: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut seen = HashSet::new();

    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !seen.insert(line.to_string()) {
            return Err(Error::ArchiveParse(format!(
                "duplicate entry in download-list.txt: '{line}'"
            )));
        }
        names.push(line.to_string());
    }

    if names.is_empty() {
        return Err(Error::ArchiveParse("download-list.txt is empty".into()));
    }
    Ok(names)
}

fn find_download_list_entry(tar: &TarArchive) -> Option<TarEntry> {
    tar.entries()
        .iter()
        .find(|e| is_download_list_name(&e.name))
        .cloned()
}

struct Candidate {
    origin: SpecOrigin,
    source_basename: String,
    display: String,
    disk_size: u64,
}

fn finalize(c: &Candidate, dl_mode: bool) -> Result<ImageSpec> {
    make_spec(
        c.origin.clone(),
        c.display.clone(),
        c.source_basename.clone(),
        c.disk_size,
        dl_mode,
    )
}

fn make_spec(
    origin: SpecOrigin,
    display: String,
    source_basename: String,
    disk_size: u64,
    dl_mode: bool,
) -> Result<ImageSpec> {
    let lz4 = is_lz4_name(&source_basename);
    let basename = strip_lz4_suffix(&source_basename);

    let mut spec = ImageSpec {
        origin,
        source_basename,
        basename,
        disk_size,
        size: disk_size,
        lz4,
        download_list_mode: dl_mode,
        display,
    };

    if spec.lz4 {
        let mut src = spec.open()?;
        spec.size = lz4::parse_frame_header(src.as_mut())?.content_size;
    }
    Ok(spec)
}

/// Expand raw files and archives into specs.
///
/// When any archive carries `meta-data/download-list.txt`, the list
/// dictates both membership and order; every contributing archive must
/// agree on its contents.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<ImageSpec>> {
    let mut dl: Option<Vec<String>> = None;

    for p in inputs {
        if !TarArchive::is_tar_file(p) {
            continue;
        }
        let tar = TarArchive::open(p)?;
        let Some(e) = find_download_list_entry(&tar) else {
            continue;
        };

        let mut src = open_tar_entry(p, &e)?;
        let text = read_text(src.as_mut(), DOWNLOAD_LIST_MAX_BYTES, "download-list.txt")?;
        let names = parse_download_list(&text)?;

        match &dl {
            None => dl = Some(names),
            Some(existing) if *existing != names => {
                error!(
                    "conflicting download-list.txt in '{}': contents differ from previously read list",
                    p.display()
                );
                return Err(Error::ArchiveParse(
                    "conflicting download-list.txt across archives".into(),
                ));
            }
            Some(_) => {}
        }
    }

    if let Some(dl) = dl {
        let mut cands: HashMap<String, Candidate> = HashMap::new();

        for p in inputs {
            if TarArchive::is_tar_file(p) {
                let tar = TarArchive::open(p)?;
                for e in tar.entries() {
                    if is_download_list_name(&e.name) {
                        continue;
                    }
                    let sb = basename_of(&e.name).to_string();
                    if sb.is_empty() {
                        continue;
                    }
                    // Later candidates overwrite earlier ones.
                    cands.insert(
                        strip_lz4_suffix(&sb),
                        Candidate {
                            origin: SpecOrigin::TarMember(p.clone(), e.clone()),
                            source_basename: sb,
                            display: format!("{}:{}", p.display(), e.name),
                            disk_size: e.size,
                        },
                    );
                }
                continue;
            }

            let src = open_raw_file(p)?;
            let sb = basename_of(&p.display().to_string()).to_string();
            cands.insert(
                strip_lz4_suffix(&sb),
                Candidate {
                    origin: SpecOrigin::RawFile(p.clone()),
                    source_basename: sb,
                    display: p.display().to_string(),
                    disk_size: src.size(),
                },
            );
        }

        let mut out = Vec::with_capacity(dl.len());
        for name in &dl {
            let Some(c) = cands.get(name) else {
                return Err(Error::Mapping(format!(
                    "download-list.txt references missing file: {name}"
                )));
            };
            out.push(finalize(c, true)?);
        }
        return Ok(out);
    }

    let mut out = Vec::new();
    for p in inputs {
        if TarArchive::is_tar_file(p) {
            let tar = TarArchive::open(p)?;
            for e in tar.entries() {
                if is_download_list_name(&e.name) {
                    continue;
                }
                let sb = basename_of(&e.name).to_string();
                if sb.is_empty() {
                    continue;
                }
                out.push(make_spec(
                    SpecOrigin::TarMember(p.clone(), e.clone()),
                    format!("{}:{}", p.display(), e.name),
                    sb,
                    e.size,
                    false,
                )?);
            }
            continue;
        }

        let src = open_raw_file(p)?;
        out.push(make_spec(
            SpecOrigin::RawFile(p.clone()),
            p.display().to_string(),
            basename_of(&p.display().to_string()).to_string(),
            src.size(),
            false,
        )?);
    }

    Ok(out)
}

/// Bind specs to partitions; for a partition referenced more than once
/// the last spec wins.
pub fn map_to_pit(pit_table: &PitTable, sources: &[ImageSpec]) -> Result<Vec<FlashItem>> {
    let mut items: Vec<FlashItem> = Vec::with_capacity(sources.len());
    let mut by_part: HashMap<i32, usize> = HashMap::new();

    for s in sources {
        if s.basename.is_empty() {
            continue;
        }
        let Some(part) = pit_table.find_by_file_name(&s.basename) else {
            continue;
        };

        let item = FlashItem {
            part: part.clone(),
            spec: s.clone(),
        };
        match by_part.get(&part.id) {
            Some(&i) => items[i] = item,
            None => {
                by_part.insert(part.id, items.len());
                items.push(item);
            }
        }
    }

    if items.is_empty() {
        error!("none of the input files match any partition in the PIT");
        return Err(Error::Mapping("no matching partitions".into()));
    }
    Ok(items)
}

/// Keep only sources that map on every device, and require all devices
/// to agree on `(id, dev_type)` for each kept source.
pub fn sources_common_mapping(pits: &[&PitTable], sources: &[ImageSpec]) -> Result<Vec<ImageSpec>> {
    let mut out = Vec::with_capacity(sources.len());
    let Some(first) = pits.first() else {
        return Ok(out);
    };

    'next: for s in sources {
        let Some(reference) = first.find_by_file_name(&s.basename) else {
            continue;
        };

        for pit in pits {
            let Some(p) = pit.find_by_file_name(&s.basename) else {
                continue 'next;
            };
            if p.id != reference.id || p.dev_type != reference.dev_type {
                return Err(Error::Mapping("PIT mapping differs across devices".into()));
            }
        }

        out.push(s.clone());
    }

    Ok(out)
}

/// `true` for PIT files shipped inside a package or given directly.
pub fn is_pit_name(base: &str) -> bool {
    base.len() >= 4 && base[base.len() - 4..].eq_ignore_ascii_case(".pit")
}

/// Pick the last `.pit` member of the specs and read it whole.
pub fn pit_from_specs(specs: &[ImageSpec]) -> Option<Vec<u8>> {
    let pit = specs.iter().rev().find(|s| is_pit_name(&s.basename))?;

    let mut src = match pit.open() {
        Ok(s) => s,
        Err(e) => {
            error!("PIT open failed: {e}");
            return None;
        }
    };
    let mut buf = vec![0u8; src.size() as usize];
    if let Err(e) = crate::infrastructure::io::read_exact(src.as_mut(), &mut buf) {
        error!("PIT read failed: {e}");
        return None;
    }
    Some(buf)
}
