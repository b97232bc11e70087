use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Reservation;

/// Bytes of framing around each payload: u32 length before, u32 crc32 after.
const FRAME_OVERHEAD: u64 = 8;

fn write_frame(writer: &mut impl Write, record: &Reservation) -> io::Result<()> {
    let payload = bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record larger than 4 GiB"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Frame {
    /// An intact record and the number of bytes its frame occupies.
    Record(Reservation, u64),
    End,
    /// Unusable tail: a crash mid-write or a bad checksum.
    Torn(&'static str),
}

/// `read_exact` that reports a short read as `Ok(false)`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    let mut first = [0u8; 1];
    // A clean end of log falls exactly on a frame boundary.
    if !fill(reader, &mut first)? {
        return Ok(Frame::End);
    }
    word[0] = first[0];
    if !fill(reader, &mut word[1..])? {
        return Ok(Frame::Torn("partial length"));
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(reader, &mut payload)? {
        return Ok(Frame::Torn("partial payload"));
    }
    if !fill(reader, &mut word)? {
        return Ok(Frame::Torn("missing checksum"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    let size = FRAME_OVERHEAD + payload.len() as u64;
    match bincode::deserialize(&payload) {
        Ok(record) => Ok(Frame::Record(record, size)),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// Result of reading a log from disk.
#[derive(Debug)]
pub struct Replay {
    pub records: Vec<Reservation>,
    /// Length of the intact prefix. Anything after it is a torn tail.
    pub valid_len: u64,
    pub file_len: u64,
}

impl Replay {
    pub fn is_torn(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Append-only log of reservation snapshots; for each id the last one wins.
///
/// Frame: `[u32 len][bincode Reservation][u32 crc32]`, little endian.
///
/// The file only ever holds whole, acknowledged frames:
/// [`Wal::recover`] cuts a torn tail off before appending resumes, and a
/// batch that fails to reach disk is rolled back to the last durable length.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
    /// Frames buffered since the last `flush_sync`.
    buffered: u64,
    appends_since_compact: u64,
    /// Set when a rollback itself failed; appends are refused until reopen.
    failed: bool,
    #[cfg(test)]
    pub(crate) fail_appends_after: Option<u64>,
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl Wal {
    /// Open for appending at the current end of file. Use [`Wal::recover`]
    /// for a log that may end in a torn frame.
    pub fn open(path: &Path) -> io::Result<Self> {
        let writer = open_for_append(path)?;
        let durable_len = writer.get_ref().metadata()?.len();
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            durable_len,
            buffered: 0,
            appends_since_compact: 0,
            failed: false,
            #[cfg(test)]
            fail_appends_after: None,
        })
    }

    /// Replay the log, truncate any torn tail, and open it for appending
    /// right after the last intact frame.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Reservation>)> {
        let replay = Self::read(path)?;
        if replay.is_torn() {
            warn!(
                "{}: dropping {} bytes of torn tail at byte {}",
                path.display(),
                replay.file_len - replay.valid_len,
                replay.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, replay.records))
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &Reservation) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Nothing is durable until the next `flush_sync`.
    pub fn append_buffered(&mut self, record: &Reservation) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::other("log writer failed; reopen required"));
        }
        self.injected_failure()?;
        write_frame(&mut self.writer, record)?;
        self.buffered += 1;
        Ok(())
    }

    #[cfg(test)]
    fn injected_failure(&self) -> io::Result<()> {
        if self.fail_appends_after == Some(self.buffered) {
            return Err(io::Error::other("injected append failure"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> io::Result<()> {
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += self.buffered;
        self.buffered = 0;
        Ok(())
    }

    /// Discard everything since the last successful `flush_sync`, both the
    /// buffered bytes and whatever already spilled into the file. If that
    /// fails too, the writer refuses further appends.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.buffered = 0;
        let result = self.truncate_to_durable();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let fresh = open_for_append(&self.path)?;
        // Dropping a BufWriter flushes it; `into_parts` hands back the
        // buffer instead.
        let (_, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    pub fn durable_len(&self) -> u64 {
        self.durable_len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// First half of compaction: write `records` to a staging file next to
    /// the log and fsync it. The live log is untouched.
    pub fn write_compact_file(path: &Path, records: &[Reservation]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::staging_path(path))?);
        for record in records {
            write_frame(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Second half: atomically replace the log with the staging file and
    /// continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::staging_path(&self.path), &self.path)?;
        self.writer = open_for_append(&self.path)?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.buffered = 0;
        self.appends_since_compact = 0;
        self.failed = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[Reservation]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact record in append order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Reservation>> {
        Ok(Self::read(path)?.records)
    }

    /// Like [`Wal::replay`], also reporting where the intact prefix ends.
    pub fn read(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    records: Vec::new(),
                    valid_len: 0,
                    file_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;
        loop {
            match read_frame(&mut reader)? {
                Frame::Record(record, size) => {
                    valid_len += size;
                    records.push(record);
                }
                Frame::End => break,
                Frame::Torn(why) => {
                    warn!("{}: {why} at byte {valid_len}", path.display());
                    break;
                }
            }
        }
        Ok(Replay {
            records,
            valid_len,
            file_len,
        })
    }
}
