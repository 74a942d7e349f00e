// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Disk spillover: per-source append-only frame files.
//!
//! When the RAM pool runs hot, the engine moves the oldest sectors of the
//! longest chains into `<spool_dir>/<source>/<ordinal>.mm2`. Each file is a
//! sequence of CRC-framed sector images:
//!
//! ```text
//! +----------------------------------------------------------+
//! | magic (4) | version (2) | record_count (2) | crc32 (4)   |
//! +----------------------------------------------------------+
//! | sensor_id (2) | kind (1) | reserved (1) | record data    |
//! |   TSD: base utc_ms (8) + record_count x u32 values       |
//! |   EVT: record_count x { u32 value, u64 utc_ms }          |
//! +----------------------------------------------------------+
//! ```
//!
//! All fields little-endian; the CRC covers everything after the header.
//! Files are sealed at a size cap and the next ordinal opened. A sibling
//! `<ordinal>.mm2.ack` sentinel is touched once every frame in the file is
//! acknowledged, making the following delete idempotent across a crash:
//! recovery removes any file whose sentinel survived.
//!
//! Recovery walks every source directory in ordinal order, drops frames
//! that fail magic/version/CRC checks (truncating the file there - a crash
//! mid-spill leaves at most one partial trailing frame), and rebuilds the
//! per-source per-sensor disk record counts. Acknowledgement state is not
//! persisted; recovered records are replayed, which keeps delivery
//! at-least-once.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::UploadSource;
use crate::diag::{DiagEvent, Hub, DBG_SPOOL};
use crate::storage::sector::SectorKind;
use crate::storage::Record;

/// Frame magic: "MM2 " (0x4D4D3220) little-endian on disk.
pub const FRAME_MAGIC: u32 = 0x4D4D_3220;

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// Frame header size: magic + version + record count + CRC.
pub const FRAME_HEADER: usize = 12;

/// Payload meta size: sensor id + kind + reserved.
const PAYLOAD_META: usize = 4;

/// Spool file errors.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame magic in {file} at offset {offset}")]
    BadMagic { file: String, offset: u64 },

    #[error("frame version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    #[error("CRC mismatch in {file} frame {frame}")]
    CrcMismatch { file: String, frame: usize },

    #[error("unknown sector kind tag {0}")]
    BadKind(u8),
}

impl From<SpoolError> for crate::Error {
    fn from(e: SpoolError) -> Self {
        match e {
            SpoolError::Io(io) => crate::Error::DiskIo(io),
            SpoolError::CrcMismatch { file, frame } => crate::Error::DiskFrameCrc { file, frame },
            other => crate::Error::DiskIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other.to_string(),
            )),
        }
    }
}

/// Records taken out of one RAM sector, ready for framing.
#[derive(Debug, Clone)]
pub enum SpillRecords {
    /// Packed time-series: base stamp of the first spilled value.
    Tsd { base_ms: u64, values: Vec<u32> },
    /// Events with explicit stamps.
    Evt { pairs: Vec<(u32, u64)> },
}

impl SpillRecords {
    fn count(&self) -> usize {
        match self {
            SpillRecords::Tsd { values, .. } => values.len(),
            SpillRecords::Evt { pairs } => pairs.len(),
        }
    }

    fn kind(&self) -> SectorKind {
        match self {
            SpillRecords::Tsd { .. } => SectorKind::Tsd,
            SpillRecords::Evt { .. } => SectorKind::Evt,
        }
    }
}

#[derive(Debug, Clone)]
struct FrameMeta {
    sensor: u16,
    kind: SectorKind,
    /// Index of the frame's first record in the per-(source, sensor) stream.
    abs_start: u64,
    count: u16,
    /// Byte offset of the frame header within its file.
    offset: u64,
}

#[derive(Debug)]
struct SpoolFile {
    ordinal: u64,
    path: PathBuf,
    frames: Vec<FrameMeta>,
    len_bytes: u64,
    sealed: bool,
}

struct SourceSpool {
    dir: PathBuf,
    files: VecDeque<SpoolFile>,
    next_ordinal: u64,
    /// Records ever appended, per sensor.
    appended: HashMap<u16, u64>,
    /// Records acknowledged, per sensor.
    acked: HashMap<u16, u64>,
}

impl SourceSpool {
    fn active_file(&self) -> Option<&SpoolFile> {
        self.files.back().filter(|f| !f.sealed)
    }
}

/// Per-source spillover store.
pub struct DiskSpool {
    file_cap: u64,
    hub: Arc<Hub>,
    sources: [SourceSpool; UploadSource::COUNT],
}

/// Disk record counts rebuilt by recovery: (source, sensor) -> records.
pub type RecoveredCounts = HashMap<(UploadSource, u16), u64>;

impl DiskSpool {
    /// Open (creating directories as needed) the spool rooted at `root`.
    pub fn new(root: &Path, file_cap: u64, hub: Arc<Hub>) -> Result<Self, SpoolError> {
        let sources = UploadSource::ALL.map(|s| {
            let dir = root.join(s.as_str());
            SourceSpool {
                dir,
                files: VecDeque::new(),
                next_ordinal: 0,
                appended: HashMap::new(),
                acked: HashMap::new(),
            }
        });
        for src in &sources {
            fs::create_dir_all(&src.dir)?;
        }
        Ok(Self {
            file_cap: file_cap.max(1),
            hub,
            sources,
        })
    }

    /// Scan the spool directories, validate frames, truncate trailing
    /// garbage, and rebuild per-source per-sensor disk record counts.
    pub fn recover(&mut self) -> Result<RecoveredCounts, SpoolError> {
        let mut counts = RecoveredCounts::new();
        for source in UploadSource::ALL {
            self.recover_source(source, &mut counts)?;
        }
        Ok(counts)
    }

    fn recover_source(
        &mut self,
        source: UploadSource,
        counts: &mut RecoveredCounts,
    ) -> Result<(), SpoolError> {
        let spool = &mut self.sources[source.index()];
        spool.files.clear();
        spool.appended.clear();
        spool.acked.clear();

        let mut ordinals: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&spool.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".mm2") {
                if let Ok(ordinal) = stem.parse::<u64>() {
                    ordinals.push(ordinal);
                }
            }
        }
        ordinals.sort_unstable();

        let mut abs: HashMap<u16, u64> = HashMap::new();
        for ordinal in &ordinals {
            let path = spool.dir.join(format!("{:08}.mm2", ordinal));
            let sentinel = ack_sentinel(&path);

            // A surviving sentinel means every frame was acknowledged before
            // the crash; finish the interrupted delete.
            if sentinel.exists() {
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(&sentinel);
                log::info!(
                    "[DiskSpool::recover] removed acknowledged file {}",
                    path.display()
                );
                continue;
            }

            match scan_file(&path, &mut abs) {
                Ok(Some(file)) => {
                    spool.files.push_back(SpoolFile {
                        ordinal: *ordinal,
                        sealed: true, // recovered files never grow again
                        ..file
                    });
                }
                Ok(None) => {
                    // File held nothing valid; drop it.
                    let _ = fs::remove_file(&path);
                }
                Err(e) => return Err(e),
            }
        }

        spool.next_ordinal = ordinals.last().map_or(0, |o| o + 1);
        for (sensor, total) in &abs {
            spool.appended.insert(*sensor, *total);
            counts.insert((source, *sensor), *total);
        }
        Ok(())
    }

    /// Append one frame of spilled records for `source`/`sensor`.
    ///
    /// Returns the absolute stream index of the frame's first record.
    pub fn append(
        &mut self,
        source: UploadSource,
        sensor: u16,
        records: &SpillRecords,
    ) -> Result<u64, SpoolError> {
        let file_cap = self.file_cap;
        let spool = &mut self.sources[source.index()];
        let count = records.count() as u16;
        debug_assert!(count > 0, "empty spill frame");

        // Seal the active file once it hits the cap.
        if let Some(back) = spool.files.back_mut() {
            if !back.sealed && back.len_bytes >= file_cap {
                back.sealed = true;
            }
        }

        if spool.active_file().is_none() {
            let ordinal = spool.next_ordinal;
            spool.next_ordinal += 1;
            let path = spool.dir.join(format!("{:08}.mm2", ordinal));
            spool.files.push_back(SpoolFile {
                ordinal,
                path,
                frames: Vec::new(),
                len_bytes: 0,
                sealed: false,
            });
        }

        let abs_start = *spool.appended.get(&sensor).unwrap_or(&0);
        let frame = encode_frame(sensor, records);

        let file = spool
            .files
            .back_mut()
            .expect("active file ensured above (verified by the push)");
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.path)?;
        handle.write_all(&frame)?;
        handle.flush()?;

        file.frames.push(FrameMeta {
            sensor,
            kind: records.kind(),
            abs_start,
            count,
            offset: file.len_bytes,
        });
        file.len_bytes += frame.len() as u64;
        *spool.appended.entry(sensor).or_insert(0) += u64::from(count);

        self.hub.publish(&DiagEvent::SpillFrame {
            source: source.index() as u8,
            sensor,
            records: count,
        });
        crate::diag_debug!(
            DBG_SPOOL,
            "[DiskSpool::append] {}/{}: frame of {} records at abs {}",
            source,
            sensor,
            count,
            abs_start
        );
        Ok(abs_start)
    }

    /// Read up to `max` records of `sensor` for `source` starting at stream
    /// index `from_abs`, in spill order.
    pub fn read(
        &self,
        source: UploadSource,
        sensor: u16,
        from_abs: u64,
        max: usize,
        period_ms: u32,
    ) -> Result<Vec<Record>, SpoolError> {
        let spool = &self.sources[source.index()];
        let mut out = Vec::new();

        'files: for file in &spool.files {
            for (idx, frame) in file.frames.iter().enumerate() {
                if frame.sensor != sensor {
                    continue;
                }
                let frame_end = frame.abs_start + u64::from(frame.count);
                if frame_end <= from_abs {
                    continue;
                }
                if out.len() >= max {
                    break 'files;
                }
                let records = read_frame(file, idx, frame, period_ms)?;
                let skip = from_abs.saturating_sub(frame.abs_start) as usize;
                for rec in records.into_iter().skip(skip) {
                    if out.len() >= max {
                        break 'files;
                    }
                    out.push(rec);
                }
            }
        }
        Ok(out)
    }

    /// Record the acknowledged stream position for `source`/`sensor`.
    pub fn ack(&mut self, source: UploadSource, sensor: u16, acked_abs: u64) {
        let spool = &mut self.sources[source.index()];
        let entry = spool.acked.entry(sensor).or_insert(0);
        if acked_abs > *entry {
            *entry = acked_abs;
        }
    }

    /// Delete files whose every frame is acknowledged (the disk cleanup
    /// hook invoked by the ACK path). Returns the number of files removed.
    pub fn cleanup(&mut self, source: UploadSource) -> Result<usize, SpoolError> {
        let hub = self.hub.clone();
        let spool = &mut self.sources[source.index()];
        let mut deleted = 0usize;

        let mut keep: VecDeque<SpoolFile> = VecDeque::new();
        while let Some(file) = spool.files.pop_front() {
            let fully_acked = file.frames.iter().all(|f| {
                spool.acked.get(&f.sensor).copied().unwrap_or(0)
                    >= f.abs_start + u64::from(f.count)
            });
            if fully_acked && !file.frames.is_empty() {
                // Sentinel first, so a crash between the two unlinks is
                // resolved by recovery instead of replaying acked data.
                let sentinel = ack_sentinel(&file.path);
                File::create(&sentinel)?;
                fs::remove_file(&file.path)?;
                let _ = fs::remove_file(&sentinel);
                hub.publish(&DiagEvent::SpoolFileDeleted {
                    source: source.index() as u8,
                    ordinal: file.ordinal,
                });
                crate::diag_debug!(
                    DBG_SPOOL,
                    "[DiskSpool::cleanup] {}: deleted {}",
                    source,
                    file.path.display()
                );
                deleted += 1;
            } else {
                keep.push_back(file);
            }
        }
        spool.files = keep;
        Ok(deleted)
    }

    /// Records ever appended for `source`/`sensor` (recovery wiring).
    pub fn appended(&self, source: UploadSource, sensor: u16) -> u64 {
        self.sources[source.index()]
            .appended
            .get(&sensor)
            .copied()
            .unwrap_or(0)
    }

    /// Spool file count for a source (console reporting).
    pub fn file_count(&self, source: UploadSource) -> usize {
        self.sources[source.index()].files.len()
    }
}

fn ack_sentinel(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".ack");
    PathBuf::from(name)
}

fn encode_frame(sensor: u16, records: &SpillRecords) -> Vec<u8> {
    let count = records.count();
    let mut payload = Vec::with_capacity(PAYLOAD_META + count * 12);
    let mut scratch = [0u8; 8];

    LittleEndian::write_u16(&mut scratch[..2], sensor);
    payload.extend_from_slice(&scratch[..2]);
    payload.push(records.kind().tag());
    payload.push(0); // reserved

    match records {
        SpillRecords::Tsd { base_ms, values } => {
            LittleEndian::write_u64(&mut scratch, *base_ms);
            payload.extend_from_slice(&scratch);
            for v in values {
                LittleEndian::write_u32(&mut scratch[..4], *v);
                payload.extend_from_slice(&scratch[..4]);
            }
        }
        SpillRecords::Evt { pairs } => {
            for (value, stamp) in pairs {
                LittleEndian::write_u32(&mut scratch[..4], *value);
                payload.extend_from_slice(&scratch[..4]);
                LittleEndian::write_u64(&mut scratch, *stamp);
                payload.extend_from_slice(&scratch);
            }
        }
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    LittleEndian::write_u32(&mut scratch[..4], FRAME_MAGIC);
    frame.extend_from_slice(&scratch[..4]);
    LittleEndian::write_u16(&mut scratch[..2], FRAME_VERSION);
    frame.extend_from_slice(&scratch[..2]);
    LittleEndian::write_u16(&mut scratch[..2], count as u16);
    frame.extend_from_slice(&scratch[..2]);
    LittleEndian::write_u32(&mut scratch[..4], crc32fast::hash(&payload));
    frame.extend_from_slice(&scratch[..4]);
    frame.extend_from_slice(&payload);
    frame
}

fn payload_len(kind: SectorKind, count: usize) -> usize {
    PAYLOAD_META
        + match kind {
            SectorKind::Tsd => 8 + count * 4,
            SectorKind::Evt => count * 12,
        }
}

fn decode_payload(payload: &[u8], count: usize, period_ms: u32) -> Result<Vec<Record>, SpoolError> {
    let sensor = LittleEndian::read_u16(&payload[0..2]);
    let kind = SectorKind::from_tag(payload[2]).ok_or(SpoolError::BadKind(payload[2]))?;
    let mut out = Vec::with_capacity(count);
    match kind {
        SectorKind::Tsd => {
            let base = LittleEndian::read_u64(&payload[4..12]);
            for i in 0..count {
                let off = 12 + i * 4;
                out.push(Record {
                    sensor,
                    value: LittleEndian::read_u32(&payload[off..off + 4]),
                    utc_ms: base + i as u64 * u64::from(period_ms),
                });
            }
        }
        SectorKind::Evt => {
            for i in 0..count {
                let off = 4 + i * 12;
                out.push(Record {
                    sensor,
                    value: LittleEndian::read_u32(&payload[off..off + 4]),
                    utc_ms: LittleEndian::read_u64(&payload[off + 4..off + 12]),
                });
            }
        }
    }
    Ok(out)
}

fn read_frame(
    file: &SpoolFile,
    frame_idx: usize,
    frame: &FrameMeta,
    period_ms: u32,
) -> Result<Vec<Record>, SpoolError> {
    let mut handle = File::open(&file.path)?;
    handle.seek(SeekFrom::Start(frame.offset))?;

    let mut header = [0u8; FRAME_HEADER];
    handle.read_exact(&mut header)?;
    if LittleEndian::read_u32(&header[0..4]) != FRAME_MAGIC {
        return Err(SpoolError::BadMagic {
            file: file.path.display().to_string(),
            offset: frame.offset,
        });
    }
    let expected_crc = LittleEndian::read_u32(&header[8..12]);

    let mut payload = vec![0u8; payload_len(frame.kind, usize::from(frame.count))];
    handle.read_exact(&mut payload)?;
    if crc32fast::hash(&payload) != expected_crc {
        return Err(SpoolError::CrcMismatch {
            file: file.path.display().to_string(),
            frame: frame_idx,
        });
    }
    decode_payload(&payload, usize::from(frame.count), period_ms)
}

/// Scan one file during recovery. Returns `None` when no valid frame
/// survives. Truncates the file at the first bad or partial frame.
fn scan_file(path: &Path, abs: &mut HashMap<u16, u64>) -> Result<Option<SpoolFile>, SpoolError> {
    let mut handle = File::open(path)?;
    let file_len = handle.metadata()?.len();
    let mut frames = Vec::new();
    let mut offset = 0u64;
    let mut truncate_at: Option<u64> = None;

    while offset < file_len {
        if file_len - offset < FRAME_HEADER as u64 {
            truncate_at = Some(offset);
            break;
        }
        let mut header = [0u8; FRAME_HEADER];
        handle.seek(SeekFrom::Start(offset))?;
        handle.read_exact(&mut header)?;

        let magic = LittleEndian::read_u32(&header[0..4]);
        let version = LittleEndian::read_u16(&header[4..6]);
        let count = LittleEndian::read_u16(&header[6..8]);
        let crc = LittleEndian::read_u32(&header[8..12]);
        if magic != FRAME_MAGIC || version != FRAME_VERSION || count == 0 {
            truncate_at = Some(offset);
            break;
        }

        // Kind byte lives in the payload; peek it to size the frame.
        let mut meta = [0u8; PAYLOAD_META];
        if file_len - offset < (FRAME_HEADER + PAYLOAD_META) as u64 {
            truncate_at = Some(offset);
            break;
        }
        handle.read_exact(&mut meta)?;
        let Some(kind) = SectorKind::from_tag(meta[2]) else {
            truncate_at = Some(offset);
            break;
        };

        let plen = payload_len(kind, usize::from(count)) as u64;
        if file_len - offset < FRAME_HEADER as u64 + plen {
            truncate_at = Some(offset);
            break;
        }
        let mut payload = vec![0u8; plen as usize];
        handle.seek(SeekFrom::Start(offset + FRAME_HEADER as u64))?;
        handle.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            log::warn!(
                "[DiskSpool::recover] CRC mismatch in {} at offset {}, discarding tail",
                path.display(),
                offset
            );
            truncate_at = Some(offset);
            break;
        }

        let sensor = LittleEndian::read_u16(&payload[0..2]);
        let abs_start = *abs.get(&sensor).unwrap_or(&0);
        frames.push(FrameMeta {
            sensor,
            kind,
            abs_start,
            count,
            offset,
        });
        *abs.entry(sensor).or_insert(0) += u64::from(count);
        offset += FRAME_HEADER as u64 + plen;
    }

    let final_len = truncate_at.unwrap_or(file_len);
    if let Some(at) = truncate_at {
        drop(handle);
        let f = OpenOptions::new().write(true).open(path)?;
        f.set_len(at)?;
        log::warn!(
            "[DiskSpool::recover] truncated {} to {} bytes",
            path.display(),
            at
        );
    }

    if frames.is_empty() {
        return Ok(None);
    }
    Ok(Some(SpoolFile {
        ordinal: 0, // caller overwrites
        path: path.to_path_buf(),
        frames,
        len_bytes: final_len,
        sealed: true,
    }))
}

// ============================================================================
// TESTS
// ============================================================================
