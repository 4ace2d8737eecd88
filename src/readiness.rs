// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How to tell that the launched worker is up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Only the grace period
    GracePeriod,
    /// Something accepts connections on `host:port`
    Tcp(String),
    /// The worker has written a marker file
    MarkerFile(PathBuf),
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::GracePeriod
    }
}

impl FromStr for Readiness {
    type Err = Error;

    /// `host:port`, or `file:<path>`
    fn from_str(s: &str) -> Result<Self, Error> {
        if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err("marker file path is empty".into());
            }
            return Ok(Readiness::MarkerFile(PathBuf::from(path)));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Readiness::Tcp(s.to_string()))
            }
            _ => Err(format!("expected host:port or file:<path>, got {}", s).into()),
        }
    }
}

impl Readiness {
    async fn probe(&self) -> bool {
        match self {
            Readiness::GracePeriod => true,
            // a silently dropped SYN must not hold the probe past its deadline
            Readiness::Tcp(addr) => matches!(
                tokio::time::timeout(POLL_INTERVAL, TcpStream::connect(addr.as_str())).await,
                Ok(Ok(_))
            ),
            Readiness::MarkerFile(path) => tokio::fs::metadata(path).await.is_ok(),
        }
    }

    /// Sleeps for `grace`, then polls the probe until it passes or `timeout` runs out.
    ///
    /// The grace period is always waited in full, a probe can only add to it.
    pub async fn wait(&self, grace: Duration, timeout: Duration) -> Result<Duration, Error> {
        let start = Instant::now();
        tokio::time::sleep(grace).await;

        if let Readiness::GracePeriod = self {
            return Ok(start.elapsed());
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.probe().await {
                let waited = start.elapsed();
                info!("worker ready after {:?}", waited);
                return Ok(waited);
            }

            if Instant::now() >= deadline {
                return Err(ErrorKind::WorkerNotReady {
                    waited: start.elapsed(),
                }
                .into());
            }

            debug!("worker not ready yet: {:?}", self);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
