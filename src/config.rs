// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration computed once, before any child is started.
//!
//! Nothing in here touches the process environment. The binary gathers the inputs
//! (base directory, CLI options, the inherited `PATH`) and hands them to
//! [`RuntimeConfig::new`]; the result is shared as an `Arc` and exported to every child
//! through [`RuntimeConfig::to_env`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_SECRET_KEY: &str = "standalone_local_secret_key";

const DATA_DIR: &str = "data";
const CONFIG_FILE: &str = "config.json";
const DATA_STORE_FILE: &str = "posthog.db";
const MANAGE_SCRIPT: &str = "manage.py";
const PYTHON_DIR: &str = "python";
const NODE_DIR: &str = "node";

/// Where everything lives on disk, relative to the installation base directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_store: PathBuf,
    pub manage_script: PathBuf,
    pub plugin_server_entry: PathBuf,
    /// Present only when the bundle ships its own interpreter
    pub bundled_python: Option<PathBuf>,
    pub python: PathBuf,
    pub node: PathBuf,
}

impl Layout {
    /// Derives the layout from `base_dir`.
    ///
    /// Checks for the bundled runtimes are the only filesystem access; when they are missing
    /// the interpreters are looked up on `PATH` by the child spawn.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let data_dir = base_dir.join(DATA_DIR);

        let python_dir = base_dir.join(PYTHON_DIR);
        let bundled_python = if python_dir.is_dir() {
            Some(python_dir)
        } else {
            None
        };

        let python = bundled_python
            .as_ref()
            .map(|dir| dir.join("bin").join("python3"))
            .filter(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("python3"));

        let node = Some(base_dir.join(NODE_DIR).join("bin").join("node"))
            .filter(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("node"));

        Self {
            config_file: data_dir.join(CONFIG_FILE),
            data_store: data_dir.join(DATA_STORE_FILE),
            manage_script: base_dir.join(MANAGE_SCRIPT),
            plugin_server_entry: base_dir.join("plugin-server").join("dist").join("index.js"),
            data_dir,
            bundled_python,
            python,
            node,
            base_dir,
        }
    }
}

/// Options the operator may override, everything else is derived.
#[derive(Clone, Debug)]
pub struct Options {
    pub port: u16,
    pub secret_key: String,
    /// `PATH` as inherited by this process
    pub inherited_path: Option<OsString>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            inherited_path: None,
        }
    }
}

/// Process wide settings, immutable once built.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    layout: Layout,
    port: u16,
    database_url: String,
    site_url: String,
    secret_key: String,
    debug: bool,
    ssl_redirect: bool,
    allowed_hosts: String,
    search_path: Option<OsString>,
}

impl RuntimeConfig {
    pub fn new(layout: Layout, options: Options) -> Self {
        let database_url = format!("sqlite:///{}", layout.data_store.display());
        let site_url = format!("http://localhost:{}", options.port);

        let search_path = match (&layout.bundled_python, options.inherited_path) {
            (Some(python_dir), inherited) => {
                let mut paths = vec![python_dir.join("bin")];
                if let Some(inherited) = inherited {
                    paths.extend(std::env::split_paths(&inherited));
                }
                std::env::join_paths(paths).ok()
            }
            (None, inherited) => inherited,
        };

        Self {
            layout,
            port: options.port,
            database_url,
            site_url,
            secret_key: options.secret_key,
            debug: false,
            ssl_redirect: false,
            allowed_hosts: "*".to_string(),
            search_path,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn data_dir(&self) -> &Path {
        &self.layout.data_dir
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    /// Address handed to `runserver`
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// The environment exported to every child process, on top of the inherited one.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();

        let mut env = BTreeMap::new();
        env.insert("DEBUG".to_string(), flag(self.debug));
        env.insert("DATABASE_URL".to_string(), self.database_url.clone());
        // an empty url selects the in-process fake
        env.insert("REDIS_URL".to_string(), String::new());
        env.insert("SECRET_KEY".to_string(), self.secret_key.clone());
        env.insert(
            "DISABLE_SECURE_SSL_REDIRECT".to_string(),
            flag(!self.ssl_redirect),
        );
        env.insert(
            "SKIP_SERVICE_VERSION_REQUIREMENTS".to_string(),
            "1".to_string(),
        );
        env.insert(
            "POSTHOG_PLUGIN_SERVER_STARTUP_RETRY_COUNT".to_string(),
            "0".to_string(),
        );
        env.insert("SITE_URL".to_string(), self.site_url.clone());
        env.insert("ALLOWED_HOSTS".to_string(), self.allowed_hosts.clone());
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.insert("CLICKHOUSE_ENABLED".to_string(), "false".to_string());
        env.insert("KAFKA_ENABLED".to_string(), "false".to_string());

        if let Some(python_dir) = &self.layout.bundled_python {
            env.insert(
                "PYTHONHOME".to_string(),
                python_dir.to_string_lossy().into_owned(),
            );
            env.insert(
                "PYTHONPATH".to_string(),
                python_dir.join("lib").to_string_lossy().into_owned(),
            );
            if let Some(path) = &self.search_path {
                env.insert("PATH".to_string(), path.to_string_lossy().into_owned());
            }
        }

        env
    }
}
