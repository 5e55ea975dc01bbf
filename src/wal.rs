//! Durable event log for the library.
//!
//! Record layout: `[u32 le: len][bincode: Event][u32 le: crc32 of payload]`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes can only come from a torn or corrupt record.
const MAX_RECORD_LEN: usize = 1 << 20;

const FRAME_OVERHEAD: u64 = 8;

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `Ok(false)` on a clean or torn end of file.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of reading a log back.
#[derive(Debug, Default)]
pub struct Recovered {
    pub events: Vec<Event>,
    /// Bytes covered by the valid records.
    pub valid_len: u64,
    /// Bytes after the last valid record (torn write or corruption).
    pub discarded: u64,
}

/// The durable file under a [`Wal`].
pub trait LogFile: Write {
    /// Make everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the file back to `len` bytes, durably.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }
}

/// Append-only log of every committed catalog, membership and ledger
/// mutation. Only the engine's writer task holds one open.
///
/// Appends collect in `pending` until `flush_sync`. A failed flush cuts the
/// file back to `durable_len`, so records the caller was told failed never
/// surface later. If even that fails the log is poisoned and refuses all
/// further writes.
pub struct Wal<F: LogFile = File> {
    file: F,
    pending: Vec<u8>,
    durable_len: u64,
    poisoned: bool,
    path: PathBuf,
}

impl Wal<File> {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::with_file(file, len, path.to_path_buf()))
    }

    /// Read the log and cut off anything after the last valid record, so
    /// later appends are not stranded behind a torn tail.
    pub fn recover(path: &Path) -> io::Result<Recovered> {
        let recovered = Self::replay(path)?;
        if recovered.discarded > 0 {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = recovered.discarded,
                "truncating WAL after last valid record"
            );
            let mut file = OpenOptions::new().write(true).open(path)?;
            file.truncate(recovered.valid_len)?;
        }
        Ok(recovered)
    }

    /// Read every valid record without modifying the file.
    pub fn replay(path: &Path) -> io::Result<Recovered> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Recovered::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        read_records(BufReader::new(file), file_len, path)
    }
}

/// Decode records until the first torn, oversized or corrupt one.
fn read_records(mut reader: impl Read, total_len: u64, path: &Path) -> io::Result<Recovered> {
    let mut recovered = Recovered::default();
    loop {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            tracing::warn!(path = %path.display(), len, "WAL record length out of range");
            break;
        }

        let mut payload = vec![0u8; len];
        let mut crc_buf = [0u8; 4];
        if !read_exact_or_eof(&mut reader, &mut payload)? || !read_exact_or_eof(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!(path = %path.display(), offset = recovered.valid_len, "WAL record failed CRC check");
            break;
        }
        let Ok(event) = bincode::deserialize::<Event>(&payload) else {
            tracing::warn!(path = %path.display(), offset = recovered.valid_len, "WAL record does not decode");
            break;
        };

        recovered.events.push(event);
        recovered.valid_len += len as u64 + FRAME_OVERHEAD;
    }

    recovered.discarded = total_len.saturating_sub(recovered.valid_len);
    Ok(recovered)
}

fn poisoned_error() -> io::Error {
    io::Error::other("WAL poisoned by an earlier failed rollback")
}

impl<F: LogFile> Wal<F> {
    /// Wrap `file`, which already holds `durable_len` bytes of valid records.
    pub fn with_file(file: F, durable_len: u64, path: PathBuf) -> Self {
        Self {
            file,
            pending: Vec::new(),
            durable_len,
            poisoned: false,
            path,
        }
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing reaches the file until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned_error());
        }
        encode_record(&mut self.pending, event)
    }

    /// Write and fsync everything buffered. On failure the buffered records
    /// are dropped and the file is cut back to its last durable length.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned_error());
        }
        let written = self.file.write_all(&self.pending).and_then(|()| self.file.flush());
        match written.and_then(|()| self.file.sync()) {
            Ok(()) => {
                self.durable_len += self.pending.len() as u64;
                self.pending.clear();
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Drop buffered records and undo any partial write of them.
    pub fn rollback(&mut self) {
        self.pending.clear();
        if let Err(e) = self.file.truncate(self.durable_len) {
            tracing::error!(path = %self.path.display(), "WAL rollback failed, refusing further writes: {e}");
            self.poisoned = true;
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn durable_len(&self) -> u64 {
        self.durable_len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// In-memory [`LogFile`] whose writes and truncation can be made to fail.
#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::LogFile;

    #[derive(Clone)]
    pub(crate) struct FlakyFile {
        pub data: Arc<Mutex<Vec<u8>>>,
        /// Bytes that may still be written before writes fail.
        pub budget: Arc<AtomicUsize>,
        pub truncate_fails: Arc<AtomicBool>,
    }

    impl FlakyFile {
        pub(crate) fn new() -> Self {
            Self {
                data: Arc::default(),
                budget: Arc::new(AtomicUsize::new(usize::MAX)),
                truncate_fails: Arc::default(),
            }
        }

        pub(crate) fn fail_after(&self, bytes: usize) {
            self.budget.store(bytes, Ordering::SeqCst);
        }

        pub(crate) fn heal(&self) {
            self.budget.store(usize::MAX, Ordering::SeqCst);
        }

        pub(crate) fn bytes(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let budget = self.budget.load(Ordering::SeqCst);
            if budget == 0 {
                return Err(io::Error::other("no space left on device"));
            }
            let n = buf.len().min(budget);
            self.data.lock().unwrap().extend_from_slice(&buf[..n]);
            if budget != usize::MAX {
                self.budget.store(budget - n, Ordering::SeqCst);
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for FlakyFile {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails.load(Ordering::SeqCst) {
                return Err(io::Error::other("read-only file system"));
            }
            self.data.lock().unwrap().truncate(len as usize);
            Ok(())
        }
    }

    /// Decode whatever valid records the file holds.
    pub(crate) fn events(file: &FlakyFile) -> Vec<crate::model::Event> {
        let bytes = file.bytes();
        super::read_records(bytes.as_slice(), bytes.len() as u64, std::path::Path::new("flaky.wal"))
            .unwrap()
            .events
    }
}
