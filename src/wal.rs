use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const HEADER_LEN: u64 = 4;
const CRC_LEN: u64 = 4;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

enum Entry {
    Event(Event, u64),
    End,
    Torn(&'static str),
}

/// `read_exact` that reports a clean EOF as `Ok(false)`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// `remaining` bounds the payload length so a corrupt prefix cannot force a huge allocation.
fn read_entry(reader: &mut impl Read, remaining: u64) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    match reader.read(&mut len_buf[..1])? {
        0 => return Ok(Entry::End),
        _ if !fill(reader, &mut len_buf[1..])? => return Ok(Entry::Torn("length prefix")),
        _ => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len as u64 + HEADER_LEN + CRC_LEN > remaining {
        return Ok(Entry::Torn("length prefix"));
    }

    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? {
        return Ok(Entry::Torn("payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut crc_buf)? {
        return Ok(Entry::Torn("checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Entry::Event(event, HEADER_LEN + len as u64 + CRC_LEN)),
        Err(_) => Ok(Entry::Torn("undecodable event")),
    }
}

/// Append-only Write-Ahead Log of one practice.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// `len` counts the payload only. A torn or corrupt tail left by a crash is
/// cut off during [`Wal::recover`].
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length and append count as of the last successful `flush_sync`.
    synced_len: u64,
    synced_appends: u64,
    /// A discard failed part way; retried before the next append.
    discard_pending: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            synced_appends: 0,
            discard_pending: false,
        })
    }

    /// Append a single event and fsync. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.discard_pending {
            self.discard_unsynced()?;
        }
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.synced_appends = self.appends_since_compact;
        Ok(())
    }

    /// Drop every append since the last successful `flush_sync`, both the
    /// buffered bytes and any that already reached the file.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        self.discard_pending = true;
        let reopened = OpenOptions::new().append(true).open(&self.path)?;
        let (file, _unwritten) = std::mem::replace(&mut self.writer, BufWriter::new(reopened))
            .into_parts();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.synced_appends;
        self.discard_pending = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.synced_appends = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from disk. A torn or corrupt tail is logged
    /// and truncated so later appends are not stranded behind it.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid = 0u64;

        loop {
            match read_entry(&mut reader, total - valid)? {
                Entry::Event(event, size) => {
                    events.push(event);
                    valid += size;
                }
                Entry::End => break,
                Entry::Torn(what) => {
                    warn!(
                        "{}: discarding {} bytes after offset {valid} (bad {what})",
                        path.display(),
                        total - valid
                    );
                    OpenOptions::new().write(true).open(path)?.set_len(valid)?;
                    break;
                }
            }
        }
        Ok(events)
    }
}
