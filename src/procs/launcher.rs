// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{error, info};

use crate::config::RuntimeConfig;
use crate::error::ErrorKind;
use crate::pipe::drain_output;
use crate::procs::{Children, ManagedProcess, PLUGIN_SERVER};
use crate::Error;

/// Standard io for a launched child
pub struct StdIoConf {
    pub stdin: Stdio,
    pub stderr: Stdio,
    pub stdout: Stdio,
}

impl Default for StdIoConf {
    fn default() -> Self {
        StdIoConf {
            // nothing is ever written to the children
            stdin: Stdio::null(),
            // both are drained into the log
            stderr: Stdio::piped(),
            stdout: Stdio::piped(),
        }
    }
}

/// Starts `<runtime> <entry>` as an independent child with the runtime config as environment.
///
/// The child is appended to `children` before this returns, so it is reachable for cleanup
/// even if it dies on its own right after. On error nothing is added.
pub fn launch(
    name: &'static str,
    runtime: &Path,
    entry: &Path,
    config: &RuntimeConfig,
    children: &Children,
) -> Result<libc::pid_t, Error> {
    let stdio = StdIoConf::default();
    let launch_error = |source| ErrorKind::WorkerLaunch {
        program: runtime.to_path_buf(),
        source,
    };

    // no kill_on_drop, cleanup sends SIGTERM and lets it exit on its own terms
    let mut child = Command::new(runtime)
        .arg(entry)
        .current_dir(&config.layout().base_dir)
        .envs(config.to_env())
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr)
        .spawn()
        .map_err(launch_error)?;

    let pid = child
        .id()
        .ok_or_else(|| Error::from("launched process exited before it had a pid"))?
        as libc::pid_t;

    drain_output(name, pid, child.stdout.take(), child.stderr.take());
    children.push(ManagedProcess::new(name, pid, child));

    info!(
        "started {} ({}): {} {}",
        name,
        pid,
        runtime.display(),
        entry.display()
    );
    Ok(pid)
}

/// Starts the plugin server with the script runtime from the layout.
pub fn launch_plugin_server(
    config: &RuntimeConfig,
    children: &Children,
) -> Result<libc::pid_t, Error> {
    let layout = config.layout();
    info!("starting plugin server");

    launch(
        PLUGIN_SERVER,
        &layout.node,
        &layout.plugin_server_entry,
        config,
        children,
    )
    .map_err(|e| {
        error!("error starting plugin server: {}", e);
        e
    })
}
