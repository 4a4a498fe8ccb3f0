//! Write-ahead journal.
//!
//! Every mutation is appended as one JSON line before it is applied in
//! memory, while the locks of the rows it touches are held. Each line carries
//! a global sequence number; rows and prototypes remember the highest
//! sequence applied to them so replay after a crash applies every entry at
//! most once.
//!
//! ```text
//! {"seq":12,"op":"reassign","from":"topic:a","to":"topic:b","vector":[...],"record":{"table":"chunks","id":7}}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult, IoContext};
use crate::prototype::{PrototypeKey, PrototypeMetadata};
use crate::vector::{EntityTable, RecordId};

pub const JOURNAL_FILE: &str = "journal.log";

/// A record whose membership changes along with a prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub table: EntityTable,
    pub id: RecordId,
}

/// Prototype side effect of a store write on a member record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub key: PrototypeKey,
    /// Vector the prototype currently counts for this member.
    pub old: Vec<f32>,
    /// Replacement vector; `None` drops the membership.
    pub new: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Upsert {
        table: EntityTable,
        id: RecordId,
        vector: Option<Vec<f32>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member: Option<MemberUpdate>,
        /// The row's membership pointed at a missing or empty prototype and
        /// was dropped without a prototype update.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        clear_membership: bool,
    },
    SetEmbedding {
        table: EntityTable,
        id: RecordId,
        vector: Option<Vec<f32>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member: Option<MemberUpdate>,
        /// The row's membership pointed at a missing or empty prototype and
        /// was dropped without a prototype update.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        clear_membership: bool,
    },
    Remove {
        table: EntityTable,
        id: RecordId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member: Option<MemberUpdate>,
    },
    Assign {
        key: PrototypeKey,
        vector: Vec<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<RecordRef>,
    },
    Unassign {
        key: PrototypeKey,
        vector: Vec<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<RecordRef>,
    },
    Reassign {
        from: PrototypeKey,
        to: PrototypeKey,
        vector: Vec<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<RecordRef>,
    },
    Register {
        key: PrototypeKey,
        topic: Option<String>,
        document: Option<String>,
        #[serde(default)]
        metadata: PrototypeMetadata,
    },
    Overwrite {
        key: PrototypeKey,
        mean: Vec<f64>,
        member_count: u64,
        #[serde(default)]
        metadata: PrototypeMetadata,
    },
    DeletePrototype {
        key: PrototypeKey,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub mutation: Mutation,
}

#[derive(Debug)]
struct Writer {
    /// `None` when journaling is disabled; sequences are still issued.
    out: Option<BufWriter<File>>,
    last_seq: u64,
    /// Byte length of the complete entries in the file.
    len: u64,
    /// A failed append could not be cut back; no further appends.
    poisoned: bool,
    #[cfg(test)]
    fail_next: bool,
}

impl Writer {
    fn new(out: Option<BufWriter<File>>, last_seq: u64, len: u64) -> Self {
        Self {
            out,
            last_seq,
            len,
            poisoned: false,
            #[cfg(test)]
            fail_next: false,
        }
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next) {
            out.write_all(&line[..line.len() / 2])?;
            out.flush()?;
            return Err(std::io::Error::other("injected write failure"));
        }
        out.write_all(line)?;
        out.flush()
    }

    /// Cuts the file back to the last complete entry after a failed append,
    /// dropping whatever the buffer still holds.
    fn roll_back(&mut self) {
        let Some(out) = self.out.take() else {
            return;
        };
        let (file, _unwritten) = out.into_parts();
        match file.set_len(self.len) {
            Ok(()) => self.out = Some(BufWriter::new(file)),
            Err(e) => {
                tracing::error!("[journal] could not cut back a failed append: {e}");
                self.poisoned = true;
            }
        }
    }
}

/// Appends mutations and hands out sequence numbers.
#[derive(Debug)]
pub struct Journal {
    path: Option<PathBuf>,
    writer: Mutex<Writer>,
}

impl Journal {
    /// A journal that only counts. Used for in-memory substrates and when
    /// `storage.journal` is off.
    pub fn disabled(last_seq: u64) -> Self {
        Self {
            path: None,
            writer: Mutex::new(Writer::new(None, last_seq, 0)),
        }
    }

    /// Opens `dir/journal.log` for appending and returns the entries it
    /// already holds. A torn final line is cut off with a warning.
    pub fn open(dir: &Path, checkpoint_seq: u64) -> EmbedResult<(Self, Vec<JournalEntry>)> {
        let path = dir.join(JOURNAL_FILE);
        let (entries, valid_len) = if path.exists() {
            read_entries(&path)?
        } else {
            (Vec::new(), 0)
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_path(&path)?;
        let len = file.metadata().with_path(&path)?.len();
        if len > valid_len {
            tracing::warn!(
                "[journal] dropping {} bytes of torn entry at the end of {}",
                len - valid_len,
                path.display()
            );
            file.set_len(valid_len).with_path(&path)?;
        }
        drop(file);
        let len = len.min(valid_len);

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_path(&path)?;
        let last_seq = entries
            .last()
            .map_or(checkpoint_seq, |e| e.seq.max(checkpoint_seq));

        tracing::debug!(
            "[journal] opened {} with {} entries, last seq {last_seq}",
            path.display(),
            entries.len()
        );

        Ok((
            Self {
                path: Some(path),
                writer: Mutex::new(Writer::new(Some(BufWriter::new(file)), last_seq, len)),
            },
            entries,
        ))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn last_seq(&self) -> u64 {
        self.writer.lock().last_seq
    }

    /// Appends `mutation` and returns its sequence number. The line is
    /// flushed to the OS before this returns. A failed append leaves the
    /// file ending at the previous entry.
    pub fn append(&self, mutation: &Mutation) -> EmbedResult<u64> {
        let mut writer = self.writer.lock();
        if writer.poisoned {
            return Err(EmbedError::Journal(
                "journal is unusable after a failed append; reopen the store".to_string(),
            ));
        }
        let seq = writer.last_seq + 1;

        if writer.out.is_some() {
            let entry = JournalEntryRef { seq, mutation };
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            if let Err(e) = writer.write_line(&line) {
                writer.roll_back();
                return Err(EmbedError::Journal(format!("append of seq {seq} failed: {e}")));
            }
            writer.len += line.len() as u64;
        }

        writer.last_seq = seq;
        Ok(seq)
    }

    /// Forces appended entries to disk.
    pub fn sync(&self) -> EmbedResult<()> {
        let mut writer = self.writer.lock();
        if let Some(out) = writer.out.as_mut() {
            out.flush()
                .and_then(|()| out.get_ref().sync_data())
                .map_err(|e| EmbedError::Journal(format!("sync failed: {e}")))?;
        }
        Ok(())
    }

    /// Drops every entry with `seq <= upto`. Appends wait while this runs.
    pub fn compact(&self, upto: u64) -> EmbedResult<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };
        let mut writer = self.writer.lock();
        if let Some(out) = writer.out.as_mut() {
            out.flush().with_path(path)?;
        }

        let (entries, _) = read_entries(path)?;
        let before = entries.len();
        let kept: Vec<&JournalEntry> = entries.iter().filter(|e| e.seq > upto).collect();

        let tmp = path.with_extension("log.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp).with_path(&tmp)?);
            for entry in &kept {
                serde_json::to_writer(&mut out, entry)?;
                out.write_all(b"\n").with_path(&tmp)?;
            }
            out.flush().with_path(&tmp)?;
            out.get_ref().sync_all().with_path(&tmp)?;
        }
        std::fs::rename(&tmp, path).with_path(path)?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_path(path)?;
        writer.len = file.metadata().with_path(path)?.len();
        writer.out = Some(BufWriter::new(file));

        let dropped = before - kept.len();
        tracing::info!(
            "[journal] compacted {} entries, {} kept",
            dropped,
            kept.len()
        );
        Ok(dropped)
    }
}

/// Serialization view that avoids cloning the mutation.
#[derive(Serialize)]
struct JournalEntryRef<'a> {
    seq: u64,
    #[serde(flatten)]
    mutation: &'a Mutation,
}

/// Reads every complete entry. Returns the entries and the byte length of the
/// well-formed prefix.
fn read_entries(path: &Path) -> EmbedResult<(Vec<JournalEntry>, u64)> {
    let file = File::open(path).with_path(path)?;
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader.read_line(&mut line).with_path(path)?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let complete = line.ends_with('\n');
        let text = line.trim_end();
        if text.is_empty() {
            if complete {
                valid_len += read as u64;
            }
            continue;
        }

        match serde_json::from_str::<JournalEntry>(text) {
            Ok(entry) if complete => {
                entries.push(entry);
                valid_len += read as u64;
            }
            // Parsed but unterminated: the write was cut short after the
            // closing brace. Treat it as torn like any other partial line.
            Ok(_) => break,
            Err(e) => {
                let mut rest = String::new();
                let trailing = reader.read_line(&mut rest).with_path(path)?;
                if trailing == 0 {
                    tracing::warn!(
                        "[journal] ignoring torn entry at line {line_no} of {}: {e}",
                        path.display()
                    );
                    break;
                }
                return Err(EmbedError::Journal(format!(
                    "corrupt entry at line {line_no} of {}: {e}",
                    path.display()
                )));
            }
        }
    }

    Ok((entries, valid_len))
}
