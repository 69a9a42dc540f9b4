#![forbid(unsafe_code)]
//! Append-only journal of committed page images.
//!
//! Each frame is a 36-byte header followed by its payload:
//!
//! | bytes  | field                                       |
//! |--------|---------------------------------------------|
//! | 0..4   | magic `PNJF`                                |
//! | 4..6   | format version (BE)                         |
//! | 6      | kind: 1 full, 2 diff, 3 freed, 4 commit     |
//! | 7      | reserved, zero                              |
//! | 8..16  | page id (BE)                                |
//! | 16..24 | transaction id (BE)                         |
//! | 24..28 | payload length (BE)                         |
//! | 28..32 | pages spanned by the image (BE)             |
//! | 32..36 | crc32 of header (crc zeroed) + payload (BE) |
//!
//! Diff payloads use the [`crate::storage::diff`] encoding against the previous
//! journaled image of the page when it spans the same number of pages, or
//! against zeros otherwise.
//!
//! Every transaction ends with a commit frame whose 4-byte payload is the
//! number of page frames before it. Replay applies a transaction only once its
//! commit frame checks out, so a torn transaction leaves no trace.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::storage::diff;
use crate::storage::page_table::PagePosition;
use crate::storage::scratch::ScratchBufferPool;
use crate::types::{frame_crc32, PageId, PenumbraError, Result, TxId};

const FRAME_MAGIC: [u8; 4] = *b"PNJF";
const FRAME_FORMAT_VERSION: u16 = 2;
/// Length of an encoded frame header.
pub const FRAME_HEADER_LEN: usize = 36;

/// What a journal frame's payload holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    /// Raw page image.
    Full,
    /// Diff against the previous image of the page.
    Diff,
    /// The page was deleted; no payload.
    Freed,
    /// End of a transaction; the payload is its page frame count.
    Commit,
}

impl FrameKind {
    fn encode(self) -> u8 {
        match self {
            FrameKind::Full => 1,
            FrameKind::Diff => 2,
            FrameKind::Freed => 3,
            FrameKind::Commit => 4,
        }
    }

    fn decode(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(FrameKind::Full),
            2 => Ok(FrameKind::Diff),
            3 => Ok(FrameKind::Freed),
            4 => Ok(FrameKind::Commit),
            _ => Err(PenumbraError::Corruption("unknown journal frame kind")),
        }
    }
}

/// Decoded journal frame header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    /// Payload kind.
    pub kind: FrameKind,
    /// Page the frame describes.
    pub page: PageId,
    /// Transaction that committed the page.
    pub tx: TxId,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Pages spanned by the image; zero for freed and commit frames.
    pub pages: u32,
}

impl FrameHeader {
    fn encode_without_crc(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&FRAME_MAGIC);
        buf[4..6].copy_from_slice(&FRAME_FORMAT_VERSION.to_be_bytes());
        buf[6] = self.kind.encode();
        buf[8..16].copy_from_slice(&self.page.0.to_be_bytes());
        buf[16..24].copy_from_slice(&self.tx.0.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[28..32].copy_from_slice(&self.pages.to_be_bytes());
        buf
    }

    /// Encodes the header with the crc over itself and `payload`.
    pub fn encode(&self, payload: &[u8]) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = self.encode_without_crc();
        let crc = frame_crc32(&buf, payload);
        buf[32..36].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes a header, returning it with the stored crc.
    pub fn decode(src: &[u8]) -> Result<(Self, u32)> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(PenumbraError::Corruption("journal frame header truncated"));
        }
        if src[0..4] != FRAME_MAGIC {
            return Err(PenumbraError::Corruption("journal frame magic mismatch"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().unwrap());
        if version != FRAME_FORMAT_VERSION {
            return Err(PenumbraError::Corruption("journal format version mismatch"));
        }
        if src[7] != 0 {
            return Err(PenumbraError::Corruption("journal reserved byte non-zero"));
        }
        let kind = FrameKind::decode(src[6])?;
        let page = PageId(u64::from_be_bytes(src[8..16].try_into().unwrap()));
        let tx = TxId(u64::from_be_bytes(src[16..24].try_into().unwrap()));
        let payload_len = u32::from_be_bytes(src[24..28].try_into().unwrap());
        let pages = u32::from_be_bytes(src[28..32].try_into().unwrap());
        let crc = u32::from_be_bytes(src[32..36].try_into().unwrap());
        Ok((
            Self {
                kind,
                page,
                tx,
                payload_len,
                pages,
            },
            crc,
        ))
    }

    /// Verifies `crc` against this header and `payload`.
    pub fn verify(&self, payload: &[u8], crc: u32) -> bool {
        frame_crc32(&self.encode_without_crc(), payload) == crc
    }
}

/// Per-transaction journaling counters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JournalTxStats {
    /// Frames written.
    pub frames: usize,
    /// Frames storing a raw image.
    pub full: usize,
    /// Frames storing a diff.
    pub diffs: usize,
    /// Pages skipped because they matched their last journaled image.
    pub skipped: usize,
    /// Bytes appended, commit frame included.
    pub bytes: u64,
}

/// Appends committed page versions to the journal.
pub struct JournalWriter {
    io: Arc<dyn FileIo>,
    page_size: usize,
    offset: u64,
    last_images: FxHashMap<PageId, Vec<u8>>,
    last_journaled: TxId,
}

impl JournalWriter {
    /// Opens a journal, replaying existing frames and dropping any torn tail.
    pub fn open(io: Arc<dyn FileIo>, page_size: usize) -> Result<Self> {
        let replay = JournalReader::new(Arc::clone(&io), page_size).replay()?;
        if replay.torn {
            io.truncate(replay.valid_len)?;
        }
        debug!(
            offset = replay.valid_len,
            pages = replay.pages.len(),
            last_tx = replay.last_tx.0,
            "journal.open"
        );
        Ok(Self {
            io,
            page_size,
            offset: replay.valid_len,
            last_images: replay.pages.into_iter().collect(),
            last_journaled: replay.last_tx,
        })
    }

    /// Newest transaction fully written to the journal.
    pub fn last_journaled(&self) -> TxId {
        self.last_journaled
    }

    /// Bytes of valid journal content.
    pub fn len(&self) -> u64 {
        self.offset
    }

    /// Returns `true` when nothing has been journaled.
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Last journaled image of `page`.
    pub fn last_image(&self, page: PageId) -> Option<&[u8]> {
        self.last_images.get(&page).map(Vec::as_slice)
    }

    /// Last journaled image of every live page.
    pub fn images(&self) -> impl Iterator<Item = (PageId, &[u8])> {
        self.last_images
            .iter()
            .map(|(&page, image)| (page, image.as_slice()))
    }

    /// Appends the pages committed by `tx`, reading their images from `scratch`,
    /// followed by the commit frame. A transaction with nothing to write still
    /// gets its commit frame.
    pub fn write_transaction(
        &mut self,
        tx: TxId,
        pages: &FxHashMap<PageId, PagePosition>,
        scratch: &ScratchBufferPool,
    ) -> Result<JournalTxStats> {
        if tx <= self.last_journaled {
            return Err(PenumbraError::InvariantViolation(format!(
                "journal transaction {} not after {}",
                tx, self.last_journaled
            )));
        }
        let mut ordered: Vec<(&PageId, &PagePosition)> = pages.iter().collect();
        ordered.sort_by_key(|(page, _)| **page);
        let mut stats = JournalTxStats::default();
        let mut out = Vec::new();
        let mut images = Vec::with_capacity(ordered.len());
        for (&page, position) in ordered {
            let Some(location) = position.location else {
                append_frame(&mut out, FrameKind::Freed, page, tx, 0, &[]);
                images.push((page, None));
                stats.frames += 1;
                continue;
            };
            let pages_spanned = u32::try_from(location.pages)
                .ok()
                .filter(|&pages| pages > 0)
                .ok_or(PenumbraError::Invalid("page version span out of range"))?;
            let image = scratch
                .read_page(location.file, location.position, location.pages)?
                .to_vec();
            let size = image.len();
            if size != pages_spanned as usize * self.page_size {
                return Err(PenumbraError::Corruption("scratch span size mismatch"));
            }
            let previous = self
                .last_images
                .get(&page)
                .filter(|previous| previous.len() == size);
            let encoded = match previous {
                Some(previous) => diff::compute_diff(previous, &image, size)?,
                None => diff::compute_new(&image, size)?,
            };
            if encoded.is_empty() && previous.is_some() {
                stats.skipped += 1;
                continue;
            }
            if encoded.is_diff() {
                append_frame(
                    &mut out,
                    FrameKind::Diff,
                    page,
                    tx,
                    pages_spanned,
                    encoded.as_bytes(),
                );
                stats.diffs += 1;
            } else {
                append_frame(&mut out, FrameKind::Full, page, tx, pages_spanned, &image);
                stats.full += 1;
            }
            stats.frames += 1;
            images.push((page, Some(image)));
        }
        let frame_count = u32::try_from(stats.frames)
            .map_err(|_| PenumbraError::Invalid("too many frames in one transaction"))?;
        append_frame(
            &mut out,
            FrameKind::Commit,
            PageId(0),
            tx,
            0,
            &frame_count.to_be_bytes(),
        );
        self.io.write_at(self.offset, &out)?;
        self.offset += out.len() as u64;
        for (page, image) in images {
            match image {
                Some(image) => {
                    self.last_images.insert(page, image);
                }
                None => {
                    self.last_images.remove(&page);
                }
            }
        }
        self.last_journaled = tx;
        stats.bytes = out.len() as u64;
        debug!(
            tx = tx.0,
            frames = stats.frames,
            diffs = stats.diffs,
            skipped = stats.skipped,
            bytes = stats.bytes,
            "journal.write_transaction"
        );
        Ok(stats)
    }

    /// Makes appended frames durable.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}

fn append_frame(
    out: &mut Vec<u8>,
    kind: FrameKind,
    page: PageId,
    tx: TxId,
    pages: u32,
    payload: &[u8],
) {
    let header = FrameHeader {
        kind,
        page,
        tx,
        payload_len: payload.len() as u32,
        pages,
    };
    out.extend_from_slice(&header.encode(payload));
    out.extend_from_slice(payload);
}

/// Result of replaying a journal.
#[derive(Clone, Debug, Default)]
pub struct ReplayOutcome {
    /// Latest image of every live page.
    pub pages: BTreeMap<PageId, Vec<u8>>,
    /// Newest transaction whose commit frame was replayed.
    pub last_tx: TxId,
    /// Page frames applied from committed transactions.
    pub frames: usize,
    /// Committed transactions applied.
    pub transactions: usize,
    /// Length of the prefix ending at the last commit frame, in bytes.
    pub valid_len: u64,
    /// Whether replay stopped at a torn, corrupt or uncommitted tail.
    pub torn: bool,
}

/// Rebuilds page images from a journal.
pub struct JournalReader {
    io: Arc<dyn FileIo>,
    page_size: usize,
}

impl JournalReader {
    /// Creates a reader over `io`.
    pub fn new(io: Arc<dyn FileIo>, page_size: usize) -> Self {
        Self { io, page_size }
    }

    /// Replays committed transactions in order, stopping at the first torn or
    /// corrupt frame. Frames of a transaction without a valid commit frame are
    /// dropped.
    pub fn replay(&self) -> Result<ReplayOutcome> {
        let len = self.io.len()?;
        let mut outcome = ReplayOutcome::default();
        let mut staged: Vec<(FrameHeader, Vec<u8>)> = Vec::new();
        let mut offset = 0u64;
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        while offset < len {
            if len - offset < FRAME_HEADER_LEN as u64 {
                warn!(offset, "journal.replay.torn_header");
                outcome.torn = true;
                break;
            }
            self.io.read_at(offset, &mut header_buf)?;
            let (header, crc) = match FrameHeader::decode(&header_buf) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(offset, error = %err, "journal.replay.bad_header");
                    outcome.torn = true;
                    break;
                }
            };
            let payload_start = offset + FRAME_HEADER_LEN as u64;
            if len - payload_start < header.payload_len as u64 {
                warn!(offset, "journal.replay.torn_payload");
                outcome.torn = true;
                break;
            }
            let mut payload = vec![0u8; header.payload_len as usize];
            self.io.read_at(payload_start, &mut payload)?;
            if !header.verify(&payload, crc) {
                warn!(offset, page = header.page.0, "journal.replay.crc_mismatch");
                outcome.torn = true;
                break;
            }
            offset = payload_start + header.payload_len as u64;
            if header.tx <= outcome.last_tx
                || staged.first().is_some_and(|(first, _)| first.tx != header.tx)
            {
                warn!(offset, tx = header.tx.0, "journal.replay.out_of_order");
                outcome.torn = true;
                break;
            }
            if header.kind != FrameKind::Commit {
                staged.push((header, payload));
                continue;
            }
            let applied = commit_count(&payload)
                .filter(|&count| count == staged.len())
                .ok_or(PenumbraError::Corruption("commit frame count mismatch"))
                .and_then(|_| self.apply_transaction(&mut outcome.pages, &staged));
            if let Err(err) = applied {
                warn!(offset, tx = header.tx.0, error = %err, "journal.replay.bad_transaction");
                outcome.torn = true;
                break;
            }
            outcome.frames += staged.len();
            outcome.transactions += 1;
            outcome.last_tx = header.tx;
            outcome.valid_len = offset;
            staged.clear();
        }
        if !outcome.torn && !staged.is_empty() {
            warn!(
                frames = staged.len(),
                offset = outcome.valid_len,
                "journal.replay.uncommitted_tail"
            );
            outcome.torn = true;
        }
        debug!(
            frames = outcome.frames,
            transactions = outcome.transactions,
            last_tx = outcome.last_tx.0,
            torn = outcome.torn,
            "journal.replay"
        );
        Ok(outcome)
    }

    /// Applies one committed transaction; nothing changes when a frame fails.
    fn apply_transaction(
        &self,
        pages: &mut BTreeMap<PageId, Vec<u8>>,
        frames: &[(FrameHeader, Vec<u8>)],
    ) -> Result<()> {
        let mut staged: BTreeMap<PageId, Option<Vec<u8>>> = BTreeMap::new();
        for (header, payload) in frames {
            let image = self.decode_image(pages.get(&header.page), header, payload)?;
            staged.insert(header.page, image);
        }
        for (page, image) in staged {
            match image {
                Some(image) => {
                    pages.insert(page, image);
                }
                None => {
                    pages.remove(&page);
                }
            }
        }
        Ok(())
    }

    fn decode_image(
        &self,
        previous: Option<&Vec<u8>>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let size = (header.pages as usize)
            .checked_mul(self.page_size)
            .ok_or(PenumbraError::Corruption("journal frame span overflow"))?;
        match header.kind {
            FrameKind::Full => {
                if size == 0 || payload.len() != size {
                    return Err(PenumbraError::Corruption("full frame size mismatch"));
                }
                Ok(Some(payload.to_vec()))
            }
            FrameKind::Diff => {
                if size == 0 {
                    return Err(PenumbraError::Corruption("diff frame without pages"));
                }
                let mut image = previous
                    .filter(|previous| previous.len() == size)
                    .cloned()
                    .unwrap_or_else(|| vec![0u8; size]);
                diff::apply(&mut image, payload, size)?;
                Ok(Some(image))
            }
            FrameKind::Freed => Ok(None),
            FrameKind::Commit => Err(PenumbraError::Corruption("nested commit frame")),
        }
    }
}

fn commit_count(payload: &[u8]) -> Option<usize> {
    let raw: [u8; 4] = payload.try_into().ok()?;
    Some(u32::from_be_bytes(raw) as usize)
}
