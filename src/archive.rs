//! Reading data files out of uploaded zip archives.

use crate::error::IngestError;
use crate::models::FileSpec;
use crate::object_store::base_name;

use bytes::Bytes;
use std::io::{Cursor, Read};
use zip::ZipArchive;

/// Upper bound on the buffer reserved up front for an entry.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// An opened zip archive held in memory.
pub struct Archive {
    zip: ZipArchive<Cursor<Bytes>>,
    max_entry_size: u64,
}

impl Archive {
    /// Open an archive.
    ///
    /// Fails with [IngestError::ArchiveUnreadable] if the data is not a zip archive.
    ///
    /// # Arguments
    ///
    /// * `data`: The archive
    /// * `max_entry_size`: Maximum uncompressed size of any entry that is read
    pub fn open(data: Bytes, max_entry_size: u64) -> Result<Self, IngestError> {
        let zip = ZipArchive::new(Cursor::new(data))?;
        Ok(Self {
            zip,
            max_entry_size,
        })
    }

    /// Returns the names of all file entries, sorted. Directory entries are omitted.
    pub fn list_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .zip
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    /// Read the uncompressed contents of an entry.
    ///
    /// Fails with [IngestError::ArchiveEntryTooLarge] if the entry decompresses to more than the
    /// archive's entry size limit, whatever size its header declares.
    pub fn read_entry(&mut self, name: &str) -> Result<Bytes, IngestError> {
        let limit = self.max_entry_size;
        let too_large = || IngestError::ArchiveEntryTooLarge {
            name: name.to_string(),
            limit,
        };
        let mut file = self.zip.by_name(name)?;
        if file.size() > limit {
            return Err(too_large());
        }
        let capacity = file.size().min(MAX_PREALLOCATION);
        let mut buf = Vec::with_capacity(usize::try_from(capacity)?);
        file.by_ref()
            .take(limit.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|source| IngestError::ArchiveEntryRead {
                name: name.to_string(),
                source,
            })?;
        if u64::try_from(buf.len())? > limit {
            return Err(too_large());
        }
        Ok(buf.into())
    }

    /// Returns the entries belonging to a file spec, at any directory depth.
    pub fn matching_entries(&self, spec: &FileSpec) -> Vec<String> {
        self.list_entries()
            .into_iter()
            .filter(|name| spec.matches(base_name(name)))
            .collect()
    }
}
