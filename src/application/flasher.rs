//! Multi-device flash coordinator
//!
//! Drives N devices through the download-mode stage sequence in lock
//! step. Payload bytes must reach every device byte-identically, so the
//! coordinator reads (and for compressed mode, re-blocks) each window
//! once and all device workers consume the same shared buffer.
//!
//! Between stages a failed device is dropped from the active set and
//! the run continues; during the transfer loop failed workers keep
//! arriving at the barrier as no-ops so the barrier's party count never
//! changes. The first recorded error is what the run returns if every
//! device dies.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use log::info;

use crate::application::planner::{self, FlashItem, ImageSpec};
use crate::domain::pit::{self, PitTable};
use crate::error::{Error, Result};
use crate::infrastructure::io::lz4::{Lz4BlockReader, Lz4DecompressedSource, ONE_MIB};
use crate::infrastructure::io::{read_exact, ByteSource, TwoSlotPrefetcher};
use crate::infrastructure::odin::commands::{
    InitTargetInfo, OdinLink, ProtocolVersion, ShutdownMode, DEFAULT_RETRIES,
};
use crate::infrastructure::odin::pit_transfer::download_pit_bytes;
use crate::infrastructure::odin::wire::cmd;
use crate::infrastructure::transport::Transport;

/// One device session. Created by the caller, mutated only here.
pub struct Target {
    pub id: String,
    pub link: Box<dyn Transport>,

    pub init: InitTargetInfo,
    pub proto: ProtocolVersion,

    pub pit_bytes: Vec<u8>,
    pub pit_table: PitTable,
}

impl Target {
    pub fn new(id: impl Into<String>, link: Box<dyn Transport>) -> Target {
        Target {
            id: id.into(),
            link,
            init: InitTargetInfo::default(),
            proto: ProtocolVersion::V1,
            pit_bytes: Vec::new(),
            pit_table: PitTable::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// Read-ahead window size before rounding.
    pub buffer_bytes: u64,
    /// Packet size when every device speaks v2 or later.
    pub pkt_all_v2plus: usize,
    /// Packet size when any device is stuck on v1.
    pub pkt_any_old: usize,

    pub preflash_timeout: Duration,
    pub preflash_retries: u32,
    pub flash_timeout: Duration,

    pub reboot_after: bool,
    pub redownload_after: bool,
}

impl Default for FlashConfig {
    fn default() -> FlashConfig {
        FlashConfig {
            buffer_bytes: 30 * 1024 * 1024,
            pkt_all_v2plus: 1024 * 1024,
            pkt_any_old: 128 * 1024,
            preflash_timeout: Duration::from_secs(1),
            preflash_retries: 2,
            flash_timeout: Duration::from_secs(45),
            reboot_after: true,
            redownload_after: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Pit,
    Part,
}

/// UI-visible transfer step.
#[derive(Debug, Clone)]
pub struct PlanItem {
    pub kind: PlanKind,
    pub part_id: i32,
    pub dev_type: i32,
    pub part_name: String,
    pub pit_file_name: String,
    pub source_base: String,
    pub size: u64,
}

/// Progress and status callbacks, all optional. Callbacks may fire from
/// worker threads.
#[derive(Default)]
pub struct UiHooks {
    pub on_devices: Option<Box<dyn Fn(usize, &[String]) + Send + Sync>>,
    pub on_model: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_stage: Option<Box<dyn Fn(&str) + Send + Sync>>,

    pub on_plan: Option<Box<dyn Fn(&[PlanItem], u64) + Send + Sync>>,
    pub on_item_active: Option<Box<dyn Fn(usize) + Send + Sync>>,
    pub on_item_done: Option<Box<dyn Fn(usize) + Send + Sync>>,

    /// (overall done, overall total, item done, item total)
    pub on_progress: Option<Box<dyn Fn(u64, u64, u64, u64) + Send + Sync>>,

    pub on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_done: Option<Box<dyn Fn() + Send + Sync>>,
}

impl UiHooks {
    pub fn devices(&self, n: usize, ids: &[String]) {
        if let Some(f) = &self.on_devices {
            f(n, ids);
        }
    }

    pub fn model(&self, m: &str) {
        if let Some(f) = &self.on_model {
            f(m);
        }
    }

    pub fn stage(&self, s: &str) {
        if let Some(f) = &self.on_stage {
            f(s);
        }
    }

    pub fn plan(&self, p: &[PlanItem], total: u64) {
        if let Some(f) = &self.on_plan {
            f(p, total);
        }
    }

    pub fn item_active(&self, i: usize) {
        if let Some(f) = &self.on_item_active {
            f(i);
        }
    }

    pub fn item_done(&self, i: usize) {
        if let Some(f) = &self.on_item_done {
            f(i);
        }
    }

    pub fn progress(&self, od: u64, ot: u64, id: u64, it: u64) {
        if let Some(f) = &self.on_progress {
            f(od, ot, id, it);
        }
    }

    pub fn error(&self, msg: &str) {
        if let Some(f) = &self.on_error {
            f(msg);
        }
    }

    pub fn done(&self) {
        if let Some(f) = &self.on_done {
            f();
        }
    }
}

const STAGE_HANDSHAKE: &str = "ODIN handshake";
const STAGE_PKT: &str = "Negotiating transfer options";
const STAGE_PIT_DL: &str = "Downloading PIT(s)";
const STAGE_PIT_UP: &str = "Uploading PIT";
const STAGE_CPU_CHECK: &str = "Checking if devices are equal";
const STAGE_MAP_CHECK: &str = "Verifying PIT mapping";
const STAGE_TOTAL: &str = "Sending total size";
const STAGE_FLASH_FAST: &str = "Flashing (Speed: Enhanced)";
const STAGE_FLASH_NORM: &str = "Flashing (Speed: Normal)";
const STAGE_REBOOT: &str = "Rebooting devices";

fn final_stage_label(m: ShutdownMode) -> &'static str {
    match m {
        ShutdownMode::ReDownload => "Finalizing + redownload",
        ShutdownMode::Reboot => "Finalizing + reboot",
        ShutdownMode::NoReboot => "Finalizing",
    }
}

fn shutdown_mode_final(cfg: &FlashConfig) -> ShutdownMode {
    if cfg.redownload_after {
        ShutdownMode::ReDownload
    } else if cfg.reboot_after {
        ShutdownMode::Reboot
    } else {
        ShutdownMode::NoReboot
    }
}

fn log_summary(total: usize, failed: usize) {
    let bad = failed.min(total);
    info!("{} threads succeeded, {} failed.", total - bad, bad);
}

fn log_shutdown_action(m: ShutdownMode) {
    match m {
        ShutdownMode::ReDownload => info!("Re-download"),
        ShutdownMode::Reboot => info!("Reset"),
        ShutdownMode::NoReboot => info!("No Reboot"),
    }
}

fn emit_devfail(ui: &UiHooks, orig_idx: usize, msg: &str) {
    ui.error(&format!("DEVFAIL idx={orig_idx} {msg}"));
}

/// First-seen error slot shared across stages and workers.
#[derive(Default)]
struct FirstError(Mutex<Option<Error>>);

impl FirstError {
    fn set(&self, e: Error) {
        let mut g = self.0.lock().unwrap();
        if g.is_none() {
            *g = Some(e);
        }
    }

    fn take(&self) -> Option<Error> {
        self.0.lock().unwrap().take()
    }

    fn has(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }
}

type ActiveSet<'t> = Vec<(usize, &'t mut Target)>;

/// Run `f` on every active device in parallel; drop the devices whose
/// closure failed. Errors only propagate once the set is empty.
fn fanout_keep<'t, F>(
    active: &mut ActiveSet<'t>,
    ui: &UiHooks,
    first_err: &FirstError,
    failed_total: &mut usize,
    f: F,
) -> Result<()>
where
    F: Fn(&mut Target) -> Result<()> + Sync,
{
    if active.is_empty() {
        return Err(Error::DeviceGone("no active devices".into()));
    }

    let results: Vec<Result<()>> = std::thread::scope(|s| {
        let f = &f;
        let mut handles = Vec::with_capacity(active.len());
        for entry in active.iter_mut() {
            handles.push(s.spawn(move || f(&mut *entry.1)));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let old = std::mem::take(active);
    for ((orig, t), res) in old.into_iter().zip(results) {
        match res {
            Ok(()) => active.push((orig, t)),
            Err(e) => {
                *failed_total += 1;
                emit_devfail(ui, orig, &e.to_string());
                first_err.set(e);
            }
        }
    }

    if active.is_empty() {
        return Err(first_err
            .take()
            .unwrap_or_else(|| Error::DeviceGone("all devices failed".into())));
    }
    Ok(())
}

/// One barrier-synchronized step of the transfer loop. The coordinator
/// writes the step before arriving; workers read it after arriving.
#[derive(Clone)]
enum Step {
    Quit,
    Begin {
        comp: bool,
        size: u64,
    },
    Data {
        data: Arc<Vec<u8>>,
        off: usize,
        len: usize,
    },
    End {
        comp: bool,
        size: u64,
        part_id: i32,
        dev_type: i32,
        last: bool,
    },
}

fn exec_step(target: &mut Target, step: &Step) -> Result<()> {
    let mut odin = OdinLink::new(target.link.as_mut());
    match step {
        Step::Quit => Ok(()),
        Step::Begin { comp: false, size } => odin.begin_download(*size as i32, DEFAULT_RETRIES),
        Step::Begin { comp: true, size } => {
            odin.begin_download_compressed(*size as i32, DEFAULT_RETRIES)
        }
        Step::Data { data, off, len } => {
            odin.send_raw(&data[*off..*off + *len], DEFAULT_RETRIES)?;
            odin.recv_checked_response(cmd::EMPTY, false, DEFAULT_RETRIES)?;
            Ok(())
        }
        Step::End {
            comp,
            size,
            part_id,
            dev_type,
            last,
        } => {
            if *comp {
                odin.end_download_compressed(
                    *size as i32,
                    *part_id,
                    *dev_type,
                    *last,
                    DEFAULT_RETRIES,
                )
            } else {
                odin.end_download(*size as i32, *part_id, *dev_type, *last, DEFAULT_RETRIES)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker_idx: usize,
    orig_idx: usize,
    target: &mut Target,
    barrier: &Barrier,
    cur: &Mutex<Step>,
    dead: &[AtomicBool],
    failed_count: &AtomicU32,
    berr: &FirstError,
    ui: &UiHooks,
) {
    let mut dead_local = false;
    loop {
        barrier.wait();
        let step = cur.lock().unwrap().clone();
        let quit = matches!(step, Step::Quit);

        if !quit && !dead_local {
            if let Err(e) = exec_step(target, &step) {
                dead[worker_idx].store(true, Ordering::Relaxed);
                failed_count.fetch_add(1, Ordering::Relaxed);
                emit_devfail(ui, orig_idx, &e.to_string());
                berr.set(e);
                dead_local = true;
            }
        }

        // Release the window Arc before signalling step completion so
        // the producer can reclaim the buffer.
        drop(step);
        barrier.wait();
        if quit {
            break;
        }
    }
}

/// One prepared transfer window, shared read-only with the workers.
struct Window {
    stream: Arc<Vec<u8>>,
    /// Size announced in XMIT/START: rounded for plain windows, the
    /// unpadded compressed size for LZ4 windows.
    begin: u64,
    /// Size announced in XMIT/COMPLETE: payload bytes for plain
    /// windows, the decompressed size for LZ4 windows.
    end: u64,
    /// Bytes actually on the wire (multiple of the packet size).
    rounded: u64,
    last: bool,
}

fn empty_window() -> Window {
    Window {
        stream: Arc::new(Vec::new()),
        begin: 0,
        end: 0,
        rounded: 0,
        last: false,
    }
}

pub(crate) fn round_up(n: u64, base: u64) -> u64 {
    if base == 0 {
        return n;
    }
    match n % base {
        0 => n,
        r => n + (base - r),
    }
}

const MAX_NONFINAL_LZ4_BLOCKS: u64 = 31;

pub(crate) fn lz4_nonfinal_block_limit(buffer_bytes: u64) -> u64 {
    (buffer_bytes / ONE_MIB).min(MAX_NONFINAL_LZ4_BLOCKS)
}

fn checked_add_total(acc: &mut u64, v: u64) -> Result<()> {
    *acc = acc
        .checked_add(v)
        .ok_or_else(|| Error::protocol("overflow while computing TOTALSIZE"))?;
    Ok(())
}

struct TransferCtx<'c> {
    barrier: &'c Barrier,
    cur: &'c Mutex<Step>,
    failed_count: &'c AtomicU32,
    ndevs: usize,
    pkt: usize,
    total: u64,
    ui: &'c UiHooks,
}

impl TransferCtx<'_> {
    fn emit(&self, step: Step) {
        *self.cur.lock().unwrap() = step;
        self.barrier.wait();
        self.barrier.wait();
    }

    fn all_dead(&self) -> bool {
        self.failed_count.load(Ordering::Relaxed) as usize >= self.ndevs
    }

    /// Drain the prefetcher: one Begin/Data.../End cycle per window.
    /// Progress is accounted in decompressed bytes for both modes.
    fn send_windows(
        &self,
        pf: &mut TwoSlotPrefetcher<Window>,
        comp: bool,
        part_id: i32,
        dev_type: i32,
        item_total: u64,
        overall_done: &mut u64,
        item_done: &mut u64,
    ) -> Result<()> {
        let pkt64 = self.pkt as u64;

        loop {
            if self.all_dead() {
                break;
            }
            let Some(w) = pf.next()? else {
                break;
            };

            let packets = w.rounded / pkt64;
            self.emit(Step::Begin {
                comp,
                size: w.begin,
            });

            let mut plain_rem = w.end;
            for p in 0..packets {
                if self.all_dead() {
                    break;
                }
                self.emit(Step::Data {
                    data: Arc::clone(&w.stream),
                    off: (p * pkt64) as usize,
                    len: self.pkt,
                });

                // Plain windows contribute real payload bytes; LZ4
                // windows spread the decompressed size evenly over the
                // compressed-packet axis.
                let add = if comp {
                    ((p + 1) * w.end) / packets - (p * w.end) / packets
                } else {
                    let a = pkt64.min(plain_rem);
                    plain_rem -= a;
                    a
                };

                *item_done += add;
                *overall_done += add;
                self.ui
                    .progress(*overall_done, self.total, *item_done, item_total);
            }

            let (last, end) = (w.last, w.end);
            self.emit(Step::End {
                comp,
                size: end,
                part_id,
                dev_type,
                last,
            });

            drop(w);
            if last || self.all_dead() {
                break;
            }
        }

        Ok(())
    }
}

/// Build the per-item prefetcher for compressed transfer: windows of
/// whole 1-MiB LZ4 blocks, at most `max_blocks` per non-final window.
fn lz4_window_prefetcher(
    spec: &ImageSpec,
    max_blocks: u64,
    pkt: usize,
) -> Result<TwoSlotPrefetcher<Window>> {
    let mut reader = Lz4BlockReader::open(spec.open()?)?;
    let total_decomp = reader.content_size();
    if total_decomp == 0 {
        return Err(Error::Lz4Parse(format!(
            "LZ4 content size is zero: {}",
            spec.display
        )));
    }

    let pkt64 = pkt as u64;
    let mut sent = 0u64;

    let pf = TwoSlotPrefetcher::new(
        move |w: &mut Window| {
            if sent >= total_decomp {
                return Ok(false);
            }

            let rem = total_decomp - sent;
            let last = rem <= max_blocks * ONE_MIB;
            let decomp = if last { rem } else { max_blocks * ONE_MIB };
            let blocks = if last {
                reader.blocks_remaining_1m()
            } else {
                (decomp / ONE_MIB) as usize
            };

            let buf = Arc::make_mut(&mut w.stream);
            buf.clear();
            let comp_sz = reader.read_blocks(blocks, buf)? as u64;
            let rounded = round_up(comp_sz, pkt64);
            buf.resize(rounded as usize, 0);

            w.begin = comp_sz;
            w.end = decomp;
            w.rounded = rounded;
            w.last = last;
            sent += decomp;
            Ok(true)
        },
        empty_window,
    );

    Ok(pf)
}

/// Prefetcher for plain transfer (including host-side decompression of
/// LZ4 sources when a device lacks compressed-download support).
fn plain_window_prefetcher(
    spec: &ImageSpec,
    buffer_bytes: u64,
    pkt: usize,
) -> Result<TwoSlotPrefetcher<Window>> {
    let mut src: Box<dyn ByteSource> = if spec.lz4 {
        Lz4DecompressedSource::open(spec.open()?)?
    } else {
        spec.open()?
    };

    let file_sz = src.size();
    if file_sz == 0 {
        return Err(Error::Mapping(format!("empty source: {}", spec.display)));
    }

    let pkt64 = pkt as u64;
    let mut sent = 0u64;

    Ok(TwoSlotPrefetcher::new(
        move |w: &mut Window| {
            if sent >= file_sz {
                return Ok(false);
            }

            let rem = file_sz - sent;
            let actual = rem.min(buffer_bytes);
            let rounded = round_up(actual, pkt64);

            let buf = Arc::make_mut(&mut w.stream);
            buf.resize(rounded as usize, 0);
            read_exact(src.as_mut(), &mut buf[..actual as usize])?;
            // Short final windows are zero-padded to the packet size.
            buf[actual as usize..].fill(0);

            w.begin = rounded;
            w.end = actual;
            w.rounded = rounded;
            w.last = sent + actual >= file_sz;
            sent += actual;
            Ok(true)
        },
        empty_window,
    ))
}

/// The lock-step transfer stage: spawns one worker per device plus the
/// window producer, then walks the plan.
#[allow(clippy::too_many_arguments)]
fn transfer_stage(
    active: &mut ActiveSet<'_>,
    items: &[FlashItem],
    plan_off: usize,
    total: u64,
    pkt: usize,
    use_lz4: bool,
    cfg: &FlashConfig,
    ui: &UiHooks,
    first_err: &FirstError,
    failed_total: &mut usize,
) -> Result<()> {
    let ndevs = active.len();
    if ndevs == 0 {
        return Err(Error::DeviceGone("no active devices".into()));
    }

    let barrier = Barrier::new(ndevs + 1);
    let cur = Mutex::new(Step::Quit);
    let failed_count = AtomicU32::new(0);
    let dead: Vec<AtomicBool> = (0..ndevs).map(|_| AtomicBool::new(false)).collect();
    let berr = FirstError::default();

    std::thread::scope(|s| {
        for (worker_idx, entry) in active.iter_mut().enumerate() {
            let (barrier, cur, dead, failed_count, berr) =
                (&barrier, &cur, &dead[..], &failed_count, &berr);
            s.spawn(move || {
                worker_loop(
                    worker_idx,
                    entry.0,
                    &mut *entry.1,
                    barrier,
                    cur,
                    dead,
                    failed_count,
                    berr,
                    ui,
                )
            });
        }

        let ctx = TransferCtx {
            barrier: &barrier,
            cur: &cur,
            failed_count: &failed_count,
            ndevs,
            pkt,
            total,
            ui,
        };

        let coordinator = || -> Result<()> {
            let mut overall_done = 0u64;

            for (idx, item) in items.iter().enumerate() {
                if ctx.all_dead() {
                    break;
                }

                let plan_idx = plan_off + idx;
                ui.item_active(plan_idx);

                let item_total = item.spec.size;
                let mut item_done = 0u64;
                let comp = item.spec.lz4 && use_lz4;

                let mut pf = if comp {
                    let max_blocks = lz4_nonfinal_block_limit(cfg.buffer_bytes);
                    if max_blocks == 0 {
                        return Err(Error::Lz4Parse(
                            "buffer too small for compressed download (needs >= 1MiB)".into(),
                        ));
                    }
                    lz4_window_prefetcher(&item.spec, max_blocks, pkt)?
                } else {
                    plain_window_prefetcher(&item.spec, cfg.buffer_bytes, pkt)?
                };

                ui.progress(overall_done, total, item_done, item_total);
                ctx.send_windows(
                    &mut pf,
                    comp,
                    item.part.id,
                    item.part.dev_type,
                    item_total,
                    &mut overall_done,
                    &mut item_done,
                )?;

                ui.item_done(plan_idx);
            }

            Ok(())
        };

        if let Err(e) = coordinator() {
            berr.set(e);
        }

        ctx.emit(Step::Quit);
    });

    let bad = failed_count.load(Ordering::Relaxed) as usize;
    *failed_total += bad;
    if bad > 0 {
        if let Some(e) = berr.take() {
            first_err.set(e);
        }
    } else if let Some(e) = berr.take() {
        // Coordinator-side failure with every device still healthy
        // (bad window source, LZ4 error): the run cannot continue.
        return Err(e);
    }

    // Keep the survivors.
    let old = std::mem::take(active);
    for (worker_idx, entry) in old.into_iter().enumerate() {
        if !dead[worker_idx].load(Ordering::Relaxed) {
            active.push(entry);
        }
    }

    Ok(())
}

/// Flash `sources` (and/or upload a PIT) to every target.
///
/// Intent is derived from the arguments: no sources and no PIT means a
/// reboot-only run; a PIT without sources is a repartition-only run.
pub fn flash(
    targets: &mut [Target],
    sources: &[ImageSpec],
    pit_to_upload: Option<Arc<Vec<u8>>>,
    cfg: &FlashConfig,
    ui: &UiHooks,
) -> Result<()> {
    #[derive(PartialEq, Clone, Copy)]
    enum Intent {
        RebootOnly,
        PitOnly,
        Flash,
    }

    if targets.is_empty() {
        return Err(Error::DeviceGone("flash: no devices".into()));
    }
    for t in targets.iter() {
        if !t.link.connected() {
            return Err(Error::DeviceGone(format!("{}: transport not connected", t.id)));
        }
    }

    let has_pit = pit_to_upload.as_deref().is_some_and(|p| !p.is_empty());
    let intent = if !sources.is_empty() {
        Intent::Flash
    } else if has_pit {
        Intent::PitOnly
    } else {
        Intent::RebootOnly
    };

    let total_devices = targets.len();
    let sm_final = shutdown_mode_final(cfg);
    let first_err = FirstError::default();
    let mut failed_total = 0usize;

    let mut active: ActiveSet<'_> = targets.iter_mut().enumerate().collect();

    let mut run = || -> Result<()> {
        info!("HANDSHAKE");
        ui.stage(STAGE_HANDSHAKE);
        let preflash_timeout = cfg.preflash_timeout;
        let preflash_retries = cfg.preflash_retries;
        fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
            t.link.set_timeout(preflash_timeout);
            let mut odin = OdinLink::new(t.link.as_mut());
            odin.handshake(preflash_retries)?;
            let info = odin.get_version(preflash_retries)?;
            t.init = info;
            t.proto = info.protocol();
            Ok(())
        })?;

        if intent == Intent::RebootOnly {
            let m = if cfg.reboot_after {
                ShutdownMode::Reboot
            } else {
                ShutdownMode::NoReboot
            };
            log_shutdown_action(m);
            ui.stage(STAGE_REBOOT);
            return fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
                OdinLink::new(t.link.as_mut()).shutdown(m, preflash_retries)
            });
        }

        // Packet size: 1 MiB if every device is v2+, 128 KiB otherwise.
        let pkt = if active.iter().any(|(_, t)| t.proto < ProtocolVersion::V2) {
            cfg.pkt_any_old
        } else {
            cfg.pkt_all_v2plus
        };
        ui.stage(STAGE_PKT);
        fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
            if t.proto < ProtocolVersion::V2 {
                return Ok(());
            }
            t.link.set_timeout(preflash_timeout);
            OdinLink::new(t.link.as_mut()).setup_transfer_packet_size(pkt as i32, preflash_retries)
        })?;
        for (_, t) in active.iter_mut() {
            t.link.set_timeout(cfg.flash_timeout);
        }

        if has_pit {
            let pit_bytes = pit_to_upload.as_ref().unwrap();
            info!("Uploading PIT");
            ui.stage(STAGE_PIT_UP);
            let pit_ref: &[u8] = pit_bytes;
            fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
                OdinLink::new(t.link.as_mut()).set_pit(pit_ref, preflash_retries)
            })?;
        }

        if intent == Intent::PitOnly {
            let pit_bytes = pit_to_upload.as_ref().unwrap();
            let table = pit::parse(pit_bytes)?;
            ui.model(&table.cpu_bl_id);

            let n = pit_bytes.len() as u64;
            let plan = vec![PlanItem {
                kind: PlanKind::Pit,
                part_id: -1,
                dev_type: 0,
                part_name: "PIT (repartition)".into(),
                pit_file_name: "PIT".into(),
                source_base: "PIT".into(),
                size: n,
            }];
            ui.plan(&plan, n);
            ui.item_active(0);
            ui.progress(0, n, 0, n);
            ui.progress(n, n, n, n);
            ui.item_done(0);

            log_shutdown_action(sm_final);
            ui.stage(final_stage_label(sm_final));
            return fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
                OdinLink::new(t.link.as_mut()).shutdown(sm_final, preflash_retries)
            });
        }

        // Flash intent from here on.
        info!("Get PIT for mapping");
        ui.stage(STAGE_PIT_DL);
        fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
            let mut odin = OdinLink::new(t.link.as_mut());
            let bytes = download_pit_bytes(&mut odin, preflash_retries)?;
            t.pit_table = pit::parse(&bytes)?;
            t.pit_bytes = bytes;
            Ok(())
        })?;

        ui.stage(STAGE_CPU_CHECK);
        let reference = active[0].1.pit_table.cpu_bl_id.clone();
        if reference.is_empty() {
            return Err(Error::Mapping("PIT cpu_bl_id missing".into()));
        }
        if active.iter().any(|(_, t)| t.pit_table.cpu_bl_id != reference) {
            return Err(Error::Mapping("cpu_bl_id mismatch across devices".into()));
        }
        ui.model(&reference);

        info!("Verifying PIT mapping");
        ui.stage(STAGE_MAP_CHECK);
        let pits: Vec<&PitTable> = active.iter().map(|(_, t)| &t.pit_table).collect();
        let effective = planner::sources_common_mapping(&pits, sources)?;
        let items = planner::map_to_pit(&active[0].1.pit_table, &effective)?;

        let mut total = 0u64;
        for it in &items {
            checked_add_total(&mut total, it.spec.size)?;
        }

        let mut plan = Vec::with_capacity(items.len() + usize::from(has_pit));
        if has_pit {
            plan.push(PlanItem {
                kind: PlanKind::Pit,
                part_id: -1,
                dev_type: 0,
                part_name: "PIT (repartition)".into(),
                pit_file_name: "PIT".into(),
                source_base: "PIT".into(),
                size: pit_to_upload.as_ref().unwrap().len() as u64,
            });
        }
        for it in &items {
            plan.push(PlanItem {
                kind: PlanKind::Part,
                part_id: it.part.id,
                dev_type: it.part.dev_type,
                part_name: if it.part.name.is_empty() {
                    it.part.file_name.clone()
                } else {
                    it.part.name.clone()
                },
                pit_file_name: it.part.file_name.clone(),
                source_base: if it.spec.source_basename.is_empty() {
                    it.spec.basename.clone()
                } else {
                    it.spec.source_basename.clone()
                },
                size: it.spec.size,
            });
        }
        ui.plan(&plan, total);

        ui.stage(STAGE_TOTAL);
        fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
            OdinLink::new(t.link.as_mut()).send_total_size(total, t.proto, preflash_retries)
        })?;

        info!("Flashing has begun!");
        let use_lz4 = effective.iter().any(|s| s.lz4)
            && active
                .iter()
                .all(|(_, t)| t.init.supports_compressed_download());
        info!("Speed: {}", if use_lz4 { "Enhanced" } else { "Normal" });
        ui.stage(if use_lz4 { STAGE_FLASH_FAST } else { STAGE_FLASH_NORM });

        let plan_off = usize::from(has_pit);
        if has_pit {
            ui.item_active(0);
            ui.item_done(0);
        }
        transfer_stage(
            &mut active,
            &items,
            plan_off,
            total,
            pkt,
            use_lz4,
            cfg,
            ui,
            &first_err,
            &mut failed_total,
        )?;

        if !active.is_empty() {
            log_shutdown_action(sm_final);
            ui.stage(final_stage_label(sm_final));
            fanout_keep(&mut active, ui, &first_err, &mut failed_total, |t| {
                OdinLink::new(t.link.as_mut()).shutdown(sm_final, preflash_retries)
            })?;
        }

        Ok(())
    };

    let result = run();

    match result {
        Err(e) => {
            log_summary(total_devices, total_devices);
            Err(e)
        }
        Ok(()) => {
            if intent != Intent::Flash {
                ui.done();
            }
            log_summary(total_devices, failed_total);
            if failed_total > 0 || first_err.has() {
                Err(first_err
                    .take()
                    .unwrap_or_else(|| Error::DeviceGone("device failed during flash".into())))
            } else {
                if intent == Intent::Flash {
                    ui.done();
                }
                Ok(())
            }
        }
    }
}
