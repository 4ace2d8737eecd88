// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::command::CommandRunner;
use crate::manage::{Manage, ManageCommand};

/// How the worker ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStop {
    /// The command returned on its own before shutdown
    Finished,
    /// Shutdown was requested and the worker let go of its command
    Stopped,
    /// The task did not finish within the join timeout and was aborted
    TimedOut,
    /// The task panicked or was cancelled
    Failed,
}

/// Background task processing, run off the main sequence.
///
/// Runs the task command on its own tokio task. The command is raced against the shutdown
/// channel, so a stop request drops it (and kills the child) instead of abandoning it.
pub struct BackgroundWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<WorkerStop>,
}

impl BackgroundWorker {
    pub fn start<R: CommandRunner>(manage: Manage<R>, command: ManageCommand) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        info!("starting worker: {}", command);

        let handle = tokio::spawn(async move {
            tokio::select! {
                ok = manage.run(&command) => {
                    if ok {
                        info!("worker command finished: {}", command);
                    } else {
                        error!("worker command failed: {}", command);
                    }
                    WorkerStop::Finished
                }
                _ = shutdown_rx.changed() => {
                    info!("worker stop requested");
                    WorkerStop::Stopped
                }
            }
        });

        Self { shutdown, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the worker and waits up to `timeout` for it to let go.
    pub async fn stop(self, timeout: Duration) -> WorkerStop {
        let BackgroundWorker { shutdown, mut handle } = self;

        // the receiver is gone once the task has finished
        shutdown.send(true).ok();

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(stop)) => stop,
            Ok(Err(e)) => {
                error!("worker task failed: {}", e);
                WorkerStop::Failed
            }
            Err(_) => {
                warn!("worker did not stop within {:?}, aborting", timeout);
                handle.abort();
                WorkerStop::TimedOut
            }
        }
    }
}
