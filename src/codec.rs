//! Binary encoding of change sets and tree snapshots
//!
//! Encoding uses bincode with big-endian fixed-width integers. Sum types are
//! written by hand so the wire tags stay fixed regardless of how the Rust
//! enums evolve:
//!
//! ```text
//! ChangeSet := id:u64 timestamp:u64 name:Option<String> count:u32 Change*
//! Change    := tag:u32 id:u64 <variant fields>
//! Content   := present:bool [handle:u64]
//! Entry     := is_dir:bool name:String (content timestamp:u64 read_only:bool | children:Vec<Entry>)
//! ```
//!
//! Transient content has no persistent form; encoding it fails.

use crate::change::{Change, ChangeKind, ChangeSet};
use crate::content::Content;
use crate::entry::{DirectoryEntry, Entry, FileEntry};
use crate::error::{ChronikError, Result};
use bincode::config::{BigEndian, Configuration, Fixint, Limit};
use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};

/// Most bytes a single decode may claim for containers
pub(crate) const DECODE_LIMIT: usize = 256 * 1024 * 1024;

/// Wire configuration shared by every encoded structure
pub(crate) const CONFIG: Configuration<BigEndian, Fixint, Limit<DECODE_LIMIT>> = bincode::config::standard()
    .with_big_endian()
    .with_fixed_int_encoding()
    .with_limit::<DECODE_LIMIT>();

impl Encode for Content {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> std::result::Result<(), EncodeError> {
        match self {
            Content::Stored(id) => {
                true.encode(encoder)?;
                id.encode(encoder)
            }
            Content::Unavailable => false.encode(encoder),
            Content::Transient(_) => Err(EncodeError::Other("transient content cannot be persisted")),
        }
    }
}

impl<Context> Decode<Context> for Content {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> std::result::Result<Self, DecodeError> {
        let present: bool = Decode::decode(decoder)?;
        if present {
            Ok(Content::Stored(Decode::decode(decoder)?))
        } else {
            Ok(Content::Unavailable)
        }
    }
}

impl Encode for Entry {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> std::result::Result<(), EncodeError> {
        match self {
            Entry::File(f) => {
                false.encode(encoder)?;
                f.name.encode(encoder)?;
                f.content.encode(encoder)?;
                f.timestamp.encode(encoder)?;
                f.read_only.encode(encoder)
            }
            Entry::Directory(d) => {
                true.encode(encoder)?;
                d.name.encode(encoder)?;
                d.children.encode(encoder)
            }
        }
    }
}

impl<Context> Decode<Context> for Entry {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> std::result::Result<Self, DecodeError> {
        let is_directory: bool = Decode::decode(decoder)?;
        let name: String = Decode::decode(decoder)?;
        if is_directory {
            Ok(Entry::Directory(DirectoryEntry {
                name,
                children: Decode::decode(decoder)?,
            }))
        } else {
            Ok(Entry::File(FileEntry {
                name,
                content: Decode::decode(decoder)?,
                timestamp: Decode::decode(decoder)?,
                read_only: Decode::decode(decoder)?,
            }))
        }
    }
}

impl Encode for Change {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> std::result::Result<(), EncodeError> {
        self.tag().encode(encoder)?;
        self.id.encode(encoder)?;
        match &self.kind {
            ChangeKind::CreateFile { path, content, timestamp, read_only } => {
                path.encode(encoder)?;
                content.encode(encoder)?;
                timestamp.encode(encoder)?;
                read_only.encode(encoder)
            }
            ChangeKind::CreateDirectory { path } => path.encode(encoder),
            ChangeKind::ContentChange {
                path,
                old_content,
                old_timestamp,
                new_content,
                new_timestamp,
            } => {
                path.encode(encoder)?;
                old_content.encode(encoder)?;
                old_timestamp.encode(encoder)?;
                new_content.encode(encoder)?;
                new_timestamp.encode(encoder)
            }
            ChangeKind::Rename { path, old_name } => {
                path.encode(encoder)?;
                old_name.encode(encoder)
            }
            ChangeKind::Move { path, old_parent_path } => {
                path.encode(encoder)?;
                old_parent_path.encode(encoder)
            }
            ChangeKind::ReadOnlyStatusChange { path, old_read_only } => {
                path.encode(encoder)?;
                old_read_only.encode(encoder)
            }
            ChangeKind::Delete { path, deleted } => {
                path.encode(encoder)?;
                deleted.encode(encoder)
            }
            ChangeKind::PutUserLabel { name, project_id, timestamp } => {
                name.encode(encoder)?;
                project_id.encode(encoder)?;
                timestamp.encode(encoder)
            }
            ChangeKind::PutSystemLabel { name, project_id, color, timestamp } => {
                name.encode(encoder)?;
                project_id.encode(encoder)?;
                color.encode(encoder)?;
                timestamp.encode(encoder)
            }
        }
    }
}

impl<Context> Decode<Context> for Change {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> std::result::Result<Self, DecodeError> {
        let tag: u32 = Decode::decode(decoder)?;
        let id: u64 = Decode::decode(decoder)?;
        let kind = match tag {
            1 => ChangeKind::CreateFile {
                path: Decode::decode(decoder)?,
                content: Decode::decode(decoder)?,
                timestamp: Decode::decode(decoder)?,
                read_only: Decode::decode(decoder)?,
            },
            2 => ChangeKind::CreateDirectory {
                path: Decode::decode(decoder)?,
            },
            3 => ChangeKind::ContentChange {
                path: Decode::decode(decoder)?,
                old_content: Decode::decode(decoder)?,
                old_timestamp: Decode::decode(decoder)?,
                new_content: Decode::decode(decoder)?,
                new_timestamp: Decode::decode(decoder)?,
            },
            4 => ChangeKind::Rename {
                path: Decode::decode(decoder)?,
                old_name: Decode::decode(decoder)?,
            },
            5 => ChangeKind::Move {
                path: Decode::decode(decoder)?,
                old_parent_path: Decode::decode(decoder)?,
            },
            6 => ChangeKind::ReadOnlyStatusChange {
                path: Decode::decode(decoder)?,
                old_read_only: Decode::decode(decoder)?,
            },
            7 => ChangeKind::Delete {
                path: Decode::decode(decoder)?,
                deleted: Decode::decode(decoder)?,
            },
            8 => ChangeKind::PutUserLabel {
                name: Decode::decode(decoder)?,
                project_id: Decode::decode(decoder)?,
                timestamp: Decode::decode(decoder)?,
            },
            9 => ChangeKind::PutSystemLabel {
                name: Decode::decode(decoder)?,
                project_id: Decode::decode(decoder)?,
                color: Decode::decode(decoder)?,
                timestamp: Decode::decode(decoder)?,
            },
            _ => return Err(DecodeError::Other("unknown change tag")),
        };
        Ok(Change { id, kind })
    }
}

impl Encode for ChangeSet {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> std::result::Result<(), EncodeError> {
        self.id.encode(encoder)?;
        self.timestamp.encode(encoder)?;
        self.name.encode(encoder)?;
        let count = u32::try_from(self.changes.len())
            .map_err(|_| EncodeError::Other("too many changes in one change set"))?;
        count.encode(encoder)?;
        for change in &self.changes {
            change.encode(encoder)?;
        }
        Ok(())
    }
}

impl<Context> Decode<Context> for ChangeSet {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> std::result::Result<Self, DecodeError> {
        let id: u64 = Decode::decode(decoder)?;
        let timestamp: u64 = Decode::decode(decoder)?;
        let name: Option<String> = Decode::decode(decoder)?;
        let count: u32 = Decode::decode(decoder)?;
        if count == 0 {
            return Err(DecodeError::Other("empty change set"));
        }
        let mut changes = Vec::new();
        for _ in 0..count {
            changes.push(Decode::decode(decoder)?);
        }
        Ok(ChangeSet {
            id,
            timestamp,
            name,
            locked: true,
            changes,
        })
    }
}

/// Encode a closed change set into a log record payload
pub fn encode_change_set(set: &ChangeSet) -> Result<Vec<u8>> {
    if set.is_empty() {
        return Err(ChronikError::internal(format!("change set {} is empty", set.id)));
    }
    if set.changes.iter().any(holds_transient) {
        return Err(ChronikError::TransientContent);
    }
    Ok(bincode::encode_to_vec(set, CONFIG)?)
}

/// Decode a log record payload
pub fn decode_change_set(bytes: &[u8]) -> Result<ChangeSet> {
    decode_exact(bytes)
}

/// Encode a tree snapshot
pub fn encode_entry(entry: &Entry) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(entry, CONFIG)?)
}

/// Decode a tree snapshot
pub fn decode_entry(bytes: &[u8]) -> Result<Entry> {
    decode_exact(bytes)
}

fn decode_exact<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (value, read) = bincode::decode_from_slice(bytes, CONFIG)?;
    if read != bytes.len() {
        return Err(ChronikError::corruption(format!(
            "{} trailing bytes after record payload",
            bytes.len() - read
        )));
    }
    Ok(value)
}

fn holds_transient(change: &Change) -> bool {
    fn entry_holds_transient(entry: &Entry) -> bool {
        match entry {
            Entry::File(f) => matches!(f.content, Content::Transient(_)),
            Entry::Directory(d) => d.children.iter().any(entry_holds_transient),
        }
    }
    match &change.kind {
        ChangeKind::CreateFile { content, .. } => matches!(content, Content::Transient(_)),
        ChangeKind::ContentChange { old_content, new_content, .. } => {
            matches!(old_content, Content::Transient(_)) || matches!(new_content, Content::Transient(_))
        }
        ChangeKind::Delete { deleted, .. } => entry_holds_transient(deleted),
        _ => false,
    }
}
