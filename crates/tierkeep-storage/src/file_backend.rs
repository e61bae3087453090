use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tierkeep_core::{
    AccessPolicy, ErrorKind, KeystoreError, NewRecord, Record, RecordClass, RecordQuery, Result,
    SecureBackend,
};
use tracing::{debug, instrument, warn};

/// File-backed [`SecureBackend`]: one JSON document per record.
///
/// Layout is `<root>/<class>/<service>/<account>.json` with service and account
/// base64url encoded. Adds go through a temp file persisted without clobbering, so
/// a record is either fully present or absent and an existing one is never replaced.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn class_dir(&self, class: RecordClass) -> PathBuf {
        self.root.join(class.as_str())
    }

    fn service_dir(&self, class: RecordClass, service: &str) -> Result<PathBuf> {
        let dir = encode_name(service, "")
            .ok_or_else(|| name_too_long(service, None))?;
        Ok(self.class_dir(class).join(dir))
    }

    fn path_for(&self, class: RecordClass, account: &str, service: &str) -> Result<PathBuf> {
        let file = encode_name(account, RECORD_EXTENSION)
            .ok_or_else(|| name_too_long(service, Some(account)))?;
        Ok(self.service_dir(class, service)?.join(file))
    }
}

const RECORD_EXTENSION: &str = ".json";

/// Longest file name most filesystems accept.
const MAX_FILE_NAME: usize = 255;

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    account: String,
    service: String,
    value: String,
    #[serde(default)]
    access: AccessPolicy,
    #[serde(default)]
    description: Option<String>,
}

impl StoredRecord {
    fn into_record(self, class: RecordClass) -> Result<Record> {
        let value = URL_SAFE_NO_PAD
            .decode(self.value)
            .map_err(|_| KeystoreError::new(ErrorKind::DecodeFailure))?;
        Ok(Record {
            class,
            account: self.account,
            service: self.service,
            value,
            access: self.access,
            description: self.description,
        })
    }
}

impl SecureBackend for FileBackend {
    #[instrument(skip_all, fields(class = record.class.as_str(), account = record.account))]
    fn add(&self, record: NewRecord<'_>) -> Result<()> {
        let path = self.path_for(record.class, record.account, record.service)?;
        let stored = StoredRecord {
            account: record.account.to_string(),
            service: record.service.to_string(),
            value: URL_SAFE_NO_PAD.encode(record.value),
            access: record.access,
            description: record.description.map(str::to_string),
        };
        write_record(&path, &stored)
    }

    #[instrument(skip(self), fields(class = class.as_str()))]
    fn delete(&self, class: RecordClass, account: &str, service: &str) -> Result<()> {
        match fs::remove_file(self.path_for(class, account, service)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(KeystoreError::new(ErrorKind::ItemNotFound))
            }
            Err(err) => Err(io_err(err)),
        }
    }

    #[instrument(skip_all, fields(class = query.class.as_str()))]
    fn query(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        match (&query.service, &query.account) {
            (Some(service), Some(account)) => {
                if let Some(record) = read_record(&self.path_for(query.class, account, service)?)? {
                    records.push(record.into_record(query.class)?);
                }
            }
            (Some(service), None) => {
                collect_dir(&self.service_dir(query.class, service)?, query, &mut records)?;
            }
            (None, _) => {
                for dir in list_dir(&self.class_dir(query.class))? {
                    collect_dir(&dir, query, &mut records)?;
                }
            }
        }

        if !query.match_all {
            records.truncate(1);
        }
        if records.is_empty() {
            return Err(KeystoreError::new(ErrorKind::ItemNotFound));
        }
        debug!(count = records.len(), "query matched");
        Ok(records)
    }
}

fn collect_dir(dir: &Path, query: &RecordQuery, out: &mut Vec<Record>) -> Result<()> {
    for path in list_dir(dir)? {
        if !path.to_string_lossy().ends_with(RECORD_EXTENSION) {
            continue;
        }
        let Some(stored) = read_record(&path)? else {
            // Deleted between listing and reading.
            continue;
        };
        if query
            .account
            .as_deref()
            .is_some_and(|account| account != stored.account)
        {
            continue;
        }
        out.push(stored.into_record(query.class)?);
    }
    Ok(())
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(err)),
    };
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()).map_err(io_err))
        .collect::<Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

fn write_record(path: &Path, stored: &StoredRecord) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| KeystoreError::new(ErrorKind::InvalidParameter))?;
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    let json = serde_json::to_vec(stored).map_err(|_| KeystoreError::new(ErrorKind::IoFailure))?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            Err(KeystoreError::new(ErrorKind::DuplicateItem))
        }
        Err(err) => Err(io_err(err.error)),
    }
}

fn read_record(path: &Path) -> Result<Option<StoredRecord>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(err)),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(io_err)?;
    serde_json::from_slice(&buf).map(Some).map_err(|err| {
        warn!(path = %path.display(), error = %err, "unreadable record file");
        KeystoreError::new(ErrorKind::DecodeFailure)
    })
}

/// Encodes `name` into a file name, or `None` if the result would not fit.
fn encode_name(name: &str, extension: &str) -> Option<String> {
    let encoded = URL_SAFE_NO_PAD.encode(name) + extension;
    (encoded.len() <= MAX_FILE_NAME).then_some(encoded)
}

fn name_too_long(service: &str, account: Option<&str>) -> KeystoreError {
    debug!(service_len = service.len(), "record name exceeds file name limit");
    KeystoreError::new(ErrorKind::InvalidParameter).with_item(service, account.unwrap_or(""))
}

fn io_err(err: io::Error) -> KeystoreError {
    let kind = match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::AuthenticationFailed,
        io::ErrorKind::OutOfMemory => ErrorKind::AllocationFailure,
        _ => ErrorKind::IoFailure,
    };
    debug!(error = %err, "file backend i/o error");
    KeystoreError::new(kind)
}
