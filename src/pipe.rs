// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Draining of child output pipes into the log.
//!
//! Children started by the launcher never inherit our stdout/stderr, their pipes are read
//! until EOF here. An unread pipe would eventually block the child on a full buffer.

use std::borrow::Cow;

use tokio::io::{self, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Log target of every drained line; the plugin server is the only child drained this way
pub const OUTPUT_TARGET: &str = "hogrc::plugin_server";

/// Which of the two streams a line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn display(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Reads `reader` line by line until EOF, handing every line to `sink`.
///
/// Bytes that are not utf-8 are replaced, they never end the drain. After a read error the
/// rest of the stream is discarded, the pipe stays open until the child closes it.
///
/// Returns the number of lines read.
pub async fn drain_lines<R, F>(reader: R, mut sink: F) -> usize
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                count += 1;
                let line = trim_line(&buf);
                sink(&*line);
            }
            Err(e) => {
                warn!("discarding the rest of the child output: {}", e);
                if let Err(e) = io::copy(&mut reader, &mut io::sink()).await {
                    warn!("child output closed: {}", e);
                }
                break;
            }
        }
    }

    count
}

fn trim_line(buf: &[u8]) -> Cow<'_, str> {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

fn spawn_drain<R>(
    name: &'static str,
    pid: libc::pid_t,
    stream: Stream,
    reader: R,
) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        drain_lines(reader, |line| {
            info!(
                target: OUTPUT_TARGET,
                "{}[{}] {}: {}",
                name,
                pid,
                stream.display(),
                line
            )
        })
        .await
    })
}

/// Spawns one drain task per stream that is present.
///
/// Lines go to [`OUTPUT_TARGET`], tagged with `name` and `pid`.
pub fn drain_output(
    name: &'static str,
    pid: libc::pid_t,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> Vec<JoinHandle<usize>> {
    let mut handles = Vec::with_capacity(2);

    if let Some(out) = stdout {
        handles.push(spawn_drain(name, pid, Stream::Stdout, out));
    }
    if let Some(err) = stderr {
        handles.push(spawn_drain(name, pid, Stream::Stderr, err));
    }

    handles
}
