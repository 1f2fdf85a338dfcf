//! Durable record of completed instances, one JSON file per identifier.
//!
//! A record exists only for identifiers whose workflow reached `completed`.
//! The create endpoint consults it to avoid provisioning twice, and the
//! janitor treats registered instances as live.

use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::Identifier;

const RECORD_EXTENSION: &str = "json";

/// Completed instance bound to an identifier.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    /// Identifier the instance serves.
    pub identifier: Identifier,
    /// Public IPv4 address of the instance.
    pub ip: String,
    /// Provider instance identifier.
    pub instance_id: String,
    /// Provider instance name.
    pub name: String,
    /// When the workflow completed.
    pub recorded_at: DateTime<Utc>,
}

/// Errors raised while reading or writing registry records.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a record cannot be decoded.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Storage for [`InstanceRecord`]s.
pub trait InstanceRegistry: Send + Sync {
    /// Returns the record for `id`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the record cannot be read.
    fn get(&self, id: &Identifier) -> Result<Option<InstanceRecord>, RegistryError>;

    /// Stores `record`, replacing any previous record for its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the record cannot be written.
    fn put(&self, record: &InstanceRecord) -> Result<(), RegistryError>;

    /// Removes the record for `id`. A missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the record exists but cannot be removed.
    fn remove(&self, id: &Identifier) -> Result<(), RegistryError>;

    /// Lists every stored record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the registry cannot be read.
    fn list(&self) -> Result<Vec<InstanceRecord>, RegistryError>;
}

/// Registry persisted as JSON files under a directory.
#[derive(Clone, Debug)]
pub struct FileRegistry {
    root: Utf8PathBuf,
}

impl FileRegistry {
    /// Creates a registry rooted at `root`. The directory is created on the
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the records.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn file_name(id: &Identifier) -> String {
        format!("{}.{RECORD_EXTENSION}", id.as_str())
    }

    fn io_error(path: &Utf8Path, err: &io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    fn open_dir(&self) -> Result<Option<Dir>, RegistryError> {
        match Dir::open_ambient_dir(&self.root, ambient_authority()) {
            Ok(dir) => Ok(Some(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(&self.root, &err)),
        }
    }

    fn read_record(&self, dir: &Dir, file_name: &str) -> Result<InstanceRecord, RegistryError> {
        let path = self.root.join(file_name);
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| Self::io_error(&path, &err))?;
        serde_json::from_str(&contents).map_err(|err| RegistryError::Parse {
            path,
            message: err.to_string(),
        })
    }
}

impl InstanceRegistry for FileRegistry {
    fn get(&self, id: &Identifier) -> Result<Option<InstanceRecord>, RegistryError> {
        let Some(dir) = self.open_dir()? else {
            return Ok(None);
        };
        let file_name = Self::file_name(id);
        let exists = dir
            .try_exists(&file_name)
            .map_err(|err| Self::io_error(&self.root.join(&file_name), &err))?;
        if !exists {
            return Ok(None);
        }
        self.read_record(&dir, &file_name).map(Some)
    }

    fn put(&self, record: &InstanceRecord) -> Result<(), RegistryError> {
        Dir::create_ambient_dir_all(&self.root, ambient_authority())
            .map_err(|err| Self::io_error(&self.root, &err))?;
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| Self::io_error(&self.root, &err))?;

        let file_name = Self::file_name(&record.identifier);
        let staging = format!(".{file_name}.tmp");
        let contents = serde_json::to_string_pretty(record).map_err(|err| RegistryError::Parse {
            path: self.root.join(&file_name),
            message: err.to_string(),
        })?;
        dir.write(&staging, contents)
            .map_err(|err| Self::io_error(&self.root.join(&staging), &err))?;
        dir.rename(&staging, &dir, &file_name)
            .map_err(|err| Self::io_error(&self.root.join(&file_name), &err))
    }

    fn remove(&self, id: &Identifier) -> Result<(), RegistryError> {
        let Some(dir) = self.open_dir()? else {
            return Ok(());
        };
        let file_name = Self::file_name(id);
        match dir.remove_file(&file_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&self.root.join(&file_name), &err)),
        }
    }

    fn list(&self) -> Result<Vec<InstanceRecord>, RegistryError> {
        let Some(dir) = self.open_dir()? else {
            return Ok(Vec::new());
        };
        let entries = dir
            .entries()
            .map_err(|err| Self::io_error(&self.root, &err))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Self::io_error(&self.root, &err))?;
            let file_name = entry
                .file_name()
                .map_err(|err| Self::io_error(&self.root, &err))?;
            let is_record = Utf8Path::new(&file_name).extension() == Some(RECORD_EXTENSION)
                && !file_name.starts_with('.');
            if is_record {
                records.push(self.read_record(&dir, &file_name)?);
            }
        }
        records.sort_by(|left, right| left.identifier.cmp(&right.identifier));
        Ok(records)
    }
}

/// In-memory registry for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<Identifier, InstanceRecord>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceRegistry for MemoryRegistry {
    fn get(&self, id: &Identifier) -> Result<Option<InstanceRecord>, RegistryError> {
        let records = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(records.get(id).cloned())
    }

    fn put(&self, record: &InstanceRecord) -> Result<(), RegistryError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records.insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &Identifier) -> Result<(), RegistryError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<InstanceRecord>, RegistryError> {
        let records = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut listed: Vec<_> = records.values().cloned().collect();
        listed.sort_by(|left, right| left.identifier.cmp(&right.identifier));
        Ok(listed)
    }
}
