use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use rkyv::Deserialize;
use tracing::{info, warn};

use crate::model::{BookId, HistoryRecord, Record};

// Frame layout: [Length u32 LE][SeaHash u64 LE][rkyv bytes]
const HEADER_LEN: usize = 4 + 8;

/// One change to the current or history table.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Mutation {
    /// Insert or replace the active row.
    Put(Record),
    /// Append to the history table.
    Append(HistoryRecord),
    /// Drop the active row.
    Remove(BookId),
    /// Drop the active row and every history row.
    Purge(BookId),
}

/// Everything one logical mutation wrote. Replayed all-or-nothing.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Commit {
    pub txn: [u8; 16],
    pub ops: Vec<Mutation>,
}

/// Append-only journal file.
#[derive(Debug)]
pub struct Segment {
    pub file_path: PathBuf,
    file: File,
    current_offset: u64,
    strict: bool,
}

impl Segment {
    /// Opens (or creates) the journal and returns every intact commit in it.
    /// A torn or corrupt tail is cut off so later appends start on a frame boundary.
    pub fn open(path: &Path, strict: bool) -> io::Result<(Self, Vec<Commit>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let (commits, valid_len) = if file_len == 0 {
            (Vec::new(), 0)
        } else {
            // Read-only scan; the map is dropped before the file is touched again.
            let map = unsafe { Mmap::map(&file)? };
            scan(&map)
        };

        if valid_len < file_len {
            warn!(
                path = %path.display(),
                dropped = file_len - valid_len,
                "journal tail is torn, truncating"
            );
            file.set_len(valid_len)?;
        }

        let mut segment = Self {
            file_path: path.to_path_buf(),
            file,
            current_offset: valid_len,
            strict,
        };
        segment.file.seek(SeekFrom::Start(valid_len))?;

        info!(path = %path.display(), commits = commits.len(), "journal opened");
        Ok((segment, commits))
    }

    pub fn append(&mut self, commit: &Commit) -> io::Result<u64> {
        let frame = encode(commit)?;
        let start = self.current_offset;

        if let Err(e) = self.write_frame(start, &frame) {
            // A failed append must leave nothing past the last good frame.
            warn!(offset = start, error = %e, "journal append failed, rolling back");
            if let Err(undo) = self.truncate_to(start) {
                warn!(offset = start, error = %undo, "journal rollback failed");
            }
            return Err(e);
        }

        self.current_offset += frame.len() as u64;
        Ok(start)
    }

    fn write_frame(&mut self, start: u64, frame: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(frame)?;
        if self.strict {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn truncate_to(&mut self, offset: u64) -> io::Result<()> {
        self.file.set_len(offset)?;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Replaces the journal with a single frame, via a sibling file and a rename.
    pub fn rewrite(&mut self, checkpoint: &Commit) -> io::Result<()> {
        let new_path = self.file_path.with_extension("compacted");
        {
            let mut out = File::create(&new_path)?;
            out.write_all(&encode(checkpoint)?)?;
            out.sync_all()?;
        }
        fs::rename(&new_path, &self.file_path)?;

        // Re-open at original path to maintain consistent file handle
        let (reopened, _) = Segment::open(&self.file_path, self.strict)?;
        *self = reopened;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.current_offset
    }

    pub fn is_empty(&self) -> bool {
        self.current_offset == 0
    }
}

fn encode(commit: &Commit) -> io::Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<_, 4096>(commit)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let len = frame_len(bytes.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&seahash::hash(&bytes).to_le_bytes());
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

fn frame_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("journal frame of {} bytes exceeds u32 length", len))
    })
}

fn decode(bytes: &[u8]) -> io::Result<Commit> {
    // rkyv wants its input aligned; mmap offsets after the header are not.
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    let archived = rkyv::check_archived_root::<Commit>(&aligned)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)))
}

/// Walks frames until the first one that is short, fails its checksum, or won't decode.
fn scan(bytes: &[u8]) -> (Vec<Commit>, u64) {
    let mut commits = Vec::new();
    let mut pos = 0usize;

    while pos + HEADER_LEN <= bytes.len() {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[pos..pos + 4]);
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut hash_buf = [0u8; 8];
        hash_buf.copy_from_slice(&bytes[pos + 4..pos + HEADER_LEN]);
        let expected = u64::from_le_bytes(hash_buf);

        let body_start = pos + HEADER_LEN;
        let Some(body) = bytes.get(body_start..body_start + len) else {
            break;
        };
        if seahash::hash(body) != expected {
            warn!(offset = pos, "journal frame checksum mismatch");
            break;
        }
        match decode(body) {
            Ok(commit) => commits.push(commit),
            Err(e) => {
                warn!(offset = pos, error = %e, "journal frame does not decode");
                break;
            }
        }
        pos = body_start + len;
    }

    (commits, pos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Book;

    fn commit(id: BookId, ts: u64) -> Commit {
        Commit {
            txn: [id as u8; 16],
            ops: vec![Mutation::Put(Record::new(id, Book::new(format!("b{id}"), 1), ts))],
        }
    }

    #[test]
    fn reopen_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.journal");
        {
            let (mut seg, replay) = Segment::open(&path, true).unwrap();
            assert!(replay.is_empty());
            assert_eq!(seg.append(&commit(1, 10)).unwrap(), 0);
            assert!(seg.append(&commit(2, 20)).unwrap() > 0);
        }
        let (_, replay) = Segment::open(&path, true).unwrap();
        assert_eq!(replay, vec![commit(1, 10), commit(2, 20)]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.journal");
        let good_len = {
            let (mut seg, _) = Segment::open(&path, false).unwrap();
            seg.append(&commit(1, 10)).unwrap();
            let len = seg.len();
            seg.append(&commit(2, 20)).unwrap();
            len
        };
        // Chop the second frame in half.
        let full = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(good_len + (full - good_len) / 2).unwrap();
        drop(f);

        let (seg, replay) = Segment::open(&path, false).unwrap();
        assert_eq!(replay, vec![commit(1, 10)]);
        assert_eq!(seg.len(), good_len);
    }

    #[test]
    fn corrupt_frame_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.journal");
        {
            let (mut seg, _) = Segment::open(&path, false).unwrap();
            seg.append(&commit(1, 10)).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let (seg, replay) = Segment::open(&path, false).unwrap();
        assert!(replay.is_empty());
        assert!(seg.is_empty());
    }

    #[test]
    fn append_after_stray_bytes_keeps_later_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.journal");
        {
            let (mut seg, _) = Segment::open(&path, false).unwrap();
            seg.append(&commit(1, 10)).unwrap();
            // Half a frame that never made it: cursor moved, offset did not.
            let frame = encode(&commit(2, 20)).unwrap();
            seg.file.write_all(&frame[..10]).unwrap();
            seg.append(&commit(3, 30)).unwrap();
        }

        let (_, replay) = Segment::open(&path, false).unwrap();
        assert_eq!(replay, vec![commit(1, 10), commit(3, 30)]);
    }

    #[test]
    fn rollback_drops_partial_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.journal");
        let (mut seg, _) = Segment::open(&path, false).unwrap();
        seg.append(&commit(1, 10)).unwrap();
        let good_len = seg.len();

        let frame = encode(&commit(2, 20)).unwrap();
        seg.file.write_all(&frame[..10]).unwrap();
        seg.truncate_to(good_len).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        seg.append(&commit(3, 30)).unwrap();
        drop(seg);
        let (_, replay) = Segment::open(&path, false).unwrap();
        assert_eq!(replay, vec![commit(1, 10), commit(3, 30)]);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversized_frame_is_refused() {
        assert_eq!(frame_len(12).unwrap(), 12);
        let err = frame_len(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rewrite_leaves_single_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.journal");
        let (mut seg, _) = Segment::open(&path, false).unwrap();
        for i in 0..5 {
            seg.append(&commit(i, i as u64)).unwrap();
        }
        seg.rewrite(&commit(9, 90)).unwrap();
        seg.append(&commit(10, 100)).unwrap();
        drop(seg);

        let (_, replay) = Segment::open(&path, false).unwrap();
        assert_eq!(replay, vec![commit(9, 90), commit(10, 100)]);
    }
}
