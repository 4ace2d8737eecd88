// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! First run state: the data directory, the persisted config record and the data store.
//!
//! Every operation here is idempotent. Existing files are never rewritten or truncated.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Layout, DEFAULT_PORT};
use crate::error::ErrorKind;
use crate::Error;

/// The durable first-run record, `config.json` in the data directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub first_run: bool,
    pub port: u16,
    pub initialized: bool,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            first_run: true,
            port: DEFAULT_PORT,
            initialized: false,
        }
    }
}

/// Whether an `ensure_*` call found the thing already present or made it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ensured {
    Existing,
    Created,
}

impl Ensured {
    pub fn created(self) -> bool {
        self == Ensured::Created
    }
}

/// Creates the data directory if missing.
pub fn ensure_data_directory(data_dir: &Path) -> Result<Ensured, Error> {
    if data_dir.is_dir() {
        return Ok(Ensured::Existing);
    }

    fs::create_dir_all(data_dir).map_err(|source| ErrorKind::Bootstrap {
        path: data_dir.to_path_buf(),
        source,
    })?;

    info!("created data directory: {}", data_dir.display());
    Ok(Ensured::Created)
}

/// Reads the persisted config, writing the default record first if there is none.
///
/// The record is written to a staging file and only linked into place once it is complete, so
/// `path` exists only with a whole record in it.
pub fn ensure_persisted_config(path: &Path) -> Result<(PersistedConfig, Ensured), Error> {
    if path.exists() {
        return read_persisted_config(path).map(|config| (config, Ensured::Existing));
    }

    let default = PersistedConfig::default();
    let staging = staging_path(path);

    if let Err(e) = write_synced(&staging, &serde_json::to_vec_pretty(&default)?) {
        remove_staging(&staging);
        return Err(e.into());
    }

    // hard_link refuses to replace a record written by a concurrent run
    let linked = fs::hard_link(&staging, path);
    remove_staging(&staging);

    match linked {
        Ok(()) => {
            info!("wrote default config: {}", path.display());
            Ok((default, Ensured::Created))
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            read_persisted_config(path).map(|config| (config, Ensured::Existing))
        }
        Err(e) => Err(e.into()),
    }
}

fn read_persisted_config(path: &Path) -> Result<PersistedConfig, Error> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// `.config.json.<pid>.tmp` next to the record
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn remove_staging(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove {}: {}", path.display(), e);
        }
    }
}

/// Handle to the on-disk database file; the web server owns its schema.
#[derive(Clone, Debug)]
pub struct DataStore {
    path: PathBuf,
}

impl DataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Creates an empty store if absent.
    pub fn ensure(&self) -> Result<Ensured, Error> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {
                info!("initialized data store: {}", self.path.display());
                Ok(Ensured::Created)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Ensured::Existing),
            Err(source) => Err(ErrorKind::Bootstrap {
                path: self.path.clone(),
                source,
            }
            .into()),
        }
    }
}

/// What the bootstrap found and did
#[derive(Debug)]
pub struct Bootstrap {
    pub data_dir: Ensured,
    pub config: PersistedConfig,
    /// `None` when the record could not be read or written, defaults were used in memory
    pub config_file: Option<Ensured>,
    pub data_store: Ensured,
    pub store: DataStore,
}

/// Runs the three steps in order.
///
/// Data directory and data store failures are returned, a broken config record is logged and
/// replaced in memory by the defaults.
pub fn bootstrap(layout: &Layout) -> Result<Bootstrap, Error> {
    let data_dir = ensure_data_directory(&layout.data_dir)?;

    let (config, config_file) = match ensure_persisted_config(&layout.config_file) {
        Ok((config, ensured)) => (config, Some(ensured)),
        Err(e) => {
            warn!(
                "could not load {}, using defaults: {}",
                layout.config_file.display(),
                e
            );
            (PersistedConfig::default(), None)
        }
    };

    let store = DataStore::new(&layout.data_store);
    let data_store = store.ensure()?;

    Ok(Bootstrap {
        data_dir,
        config,
        config_file,
        data_store,
        store,
    })
}
