// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod launcher;
mod supervisor;
mod worker;

pub use launcher::launch_plugin_server;
pub use supervisor::{Notice, Outcome, Phase, Settings, Supervisor};
pub use worker::{BackgroundWorker, WorkerStop};

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{error, info};

use crate::error::ErrorKind;
use crate::Error;

pub const PLUGIN_SERVER: &str = "plugin-server";

/// Locks `mutex`, a panic elsewhere does not make the data unusable here
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a termination request found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM delivered
    Signaled,
    /// The process was already gone, with its exit code when known
    AlreadyExited(Option<i32>),
}

/// Something the supervisor can ask to stop
pub trait Terminate: Send + Debug {
    fn name(&self) -> &str;

    fn pid(&self) -> libc::pid_t;

    fn terminate(&mut self) -> Result<Termination, Error>;
}

/// A child process started by the launcher
#[derive(Debug)]
pub struct ManagedProcess {
    name: &'static str,
    pid: libc::pid_t,
    child: tokio::process::Child,
}

impl ManagedProcess {
    pub fn new(name: &'static str, pid: libc::pid_t, child: tokio::process::Child) -> Self {
        Self { name, pid, child }
    }

    /// Reaps the child if it has exited
    pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>, Error> {
        Ok(self.child.try_wait()?)
    }
}

impl Terminate for ManagedProcess {
    fn name(&self) -> &str {
        self.name
    }

    fn pid(&self) -> libc::pid_t {
        self.pid
    }

    fn terminate(&mut self) -> Result<Termination, Error> {
        if let Some(status) = self.try_wait()? {
            return Ok(Termination::AlreadyExited(status.code()));
        }

        match kill(Pid::from_raw(self.pid), Signal::SIGTERM) {
            Ok(()) => Ok(Termination::Signaled),
            Err(Errno::ESRCH) => Ok(Termination::AlreadyExited(None)),
            Err(source) => Err(ErrorKind::Termination {
                pid: self.pid,
                source,
            }
            .into()),
        }
    }
}

/// Tally of one cleanup pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub requested: usize,
    pub signaled: usize,
    pub already_exited: usize,
    pub failed: usize,
}

/// The live children, in launch order.
///
/// Children are only ever appended; the single cleanup pass drains the list. The pass runs at
/// most once per `Children`, whichever exit path gets there first, and at the latest when the
/// last owner drops it.
#[derive(Debug)]
pub struct Children<P: Terminate = ManagedProcess> {
    live: Mutex<Vec<P>>,
    cleaned: AtomicBool,
}

impl<P: Terminate> Default for Children<P> {
    fn default() -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }
}

impl<P: Terminate> Children<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, child: P) {
        lock(&self.live).push(child);
    }

    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<libc::pid_t> {
        lock(&self.live).iter().map(Terminate::pid).collect()
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Requests termination of every live child.
    ///
    /// Returns `None` if cleanup already ran. A failing child is logged and the rest are still
    /// asked to stop.
    pub fn cleanup(&self) -> Option<CleanupReport> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return None;
        }

        info!("cleaning up processes");
        let children = std::mem::take(&mut *lock(&self.live));

        let mut report = CleanupReport::default();
        for mut child in children {
            report.requested += 1;

            match child.terminate() {
                Ok(Termination::Signaled) => {
                    report.signaled += 1;
                    info!("terminated {} ({})", child.name(), child.pid());
                }
                Ok(Termination::AlreadyExited(code)) => {
                    report.already_exited += 1;
                    info!(
                        "{} ({}) had already exited: {:?}",
                        child.name(),
                        child.pid(),
                        code
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!("failed to terminate {} ({}): {}", child.name(), child.pid(), e);
                }
            }
        }

        Some(report)
    }
}

impl<P: Terminate> Drop for Children<P> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    /// Counts termination requests, optionally failing them
    #[derive(Debug)]
    pub(crate) struct FakeChild {
        pub(crate) pid: libc::pid_t,
        pub(crate) outcome: Result<Termination, ()>,
        pub(crate) requests: Arc<AtomicUsize>,
    }

    impl Terminate for FakeChild {
        fn name(&self) -> &str {
            "fake"
        }

        fn pid(&self) -> libc::pid_t {
            self.pid
        }

        fn terminate(&mut self) -> Result<Termination, Error> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.outcome.map_err(|()| {
                Error::from(ErrorKind::Termination {
                    pid: self.pid,
                    source: Errno::EPERM,
                })
            })
        }
    }

    fn fake(
        pid: libc::pid_t,
        outcome: Result<Termination, ()>,
        requests: &Arc<AtomicUsize>,
    ) -> FakeChild {
        FakeChild {
            pid,
            outcome,
            requests: Arc::clone(requests),
        }
    }

    #[test]
    fn cleanup_of_nothing_is_empty() {
        let children = Children::<FakeChild>::new();
        assert_eq!(children.cleanup(), Some(CleanupReport::default()));
    }

    #[test]
    fn every_child_is_asked_even_when_one_fails() {
        let requests = Arc::new(AtomicUsize::new(0));
        let children = Children::new();
        children.push(fake(10, Ok(Termination::Signaled), &requests));
        children.push(fake(11, Err(()), &requests));
        children.push(fake(12, Ok(Termination::AlreadyExited(Some(0))), &requests));
        children.push(fake(13, Ok(Termination::Signaled), &requests));

        let report = children.cleanup().expect("first cleanup");

        assert_eq!(requests.load(Ordering::SeqCst), 4);
        assert_eq!(
            report,
            CleanupReport {
                requested: 4,
                signaled: 2,
                already_exited: 1,
                failed: 1,
            }
        );
        assert!(children.is_empty());
    }

    #[test]
    fn cleanup_runs_once() {
        let requests = Arc::new(AtomicUsize::new(0));
        let children = Children::new();
        children.push(fake(20, Ok(Termination::Signaled), &requests));
        children.push(fake(21, Ok(Termination::Signaled), &requests));

        assert!(children.cleanup().is_some());
        assert!(children.cleanup().is_none());
        drop(children);

        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_the_last_owner_cleans_up() {
        let requests = Arc::new(AtomicUsize::new(0));
        let children = Arc::new(Children::new());
        children.push(fake(30, Ok(Termination::Signaled), &requests));

        let other = Arc::clone(&children);
        drop(children);
        assert_eq!(requests.load(Ordering::SeqCst), 0);

        drop(other);
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keeps_launch_order() {
        let requests = Arc::new(AtomicUsize::new(0));
        let children = Children::new();
        children.push(fake(3, Ok(Termination::Signaled), &requests));
        children.push(fake(1, Ok(Termination::Signaled), &requests));

        assert_eq!(children.pids(), vec![3, 1]);
        assert_eq!(children.len(), 2);
    }
}
