// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::FutureExt;
use futures::{pin_mut, select};
use tracing::{debug, error, info, warn};

use crate::browser::Browser;
use crate::command::{CommandRunner, RetryPolicy};
use crate::config::RuntimeConfig;
use crate::manage::{Manage, ManageCommand};
use crate::procs::{launch_plugin_server, lock, BackgroundWorker, Children, CleanupReport};
use crate::readiness::Readiness;
use crate::state;
use crate::Error;

/// Lifecycle states, entered strictly in this order.
///
/// A fatal failure jumps straight to `ShuttingDown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    Bootstrapping,
    LaunchingWorker,
    StartingBackgroundWorker,
    AwaitingReadiness,
    Serving,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Configuring => "CONFIGURING",
            Phase::Bootstrapping => "BOOTSTRAPPING",
            Phase::LaunchingWorker => "LAUNCHING_WORKER",
            Phase::StartingBackgroundWorker => "STARTING_BACKGROUND_WORKER",
            Phase::AwaitingReadiness => "AWAITING_READINESS",
            Phase::Serving => "SERVING",
            Phase::ShuttingDown => "SHUTTING_DOWN",
            Phase::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Timing and feature switches for one supervisor run
#[derive(Clone, Debug)]
pub struct Settings {
    pub grace_period: Duration,
    pub readiness: Readiness,
    pub ready_timeout: Duration,
    pub migrate_retry: RetryPolicy,
    pub worker_stop_timeout: Duration,
    pub plugin_server: bool,
    pub background_worker: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            readiness: Readiness::GracePeriod,
            ready_timeout: Duration::from_secs(30),
            migrate_retry: RetryPolicy::once(),
            worker_stop_timeout: Duration::from_secs(5),
            plugin_server: true,
            background_worker: true,
        }
    }
}

/// Why the foreground ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The web server returned on its own
    ServerExited,
    /// The web server command failed after migration had succeeded
    ServerFailed,
    /// Interrupt or terminate signal
    Interrupted,
}

/// Messages for the operator at the terminal, emitted when they happen
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The plugin server did not start, the web UI comes up without it
    Degraded(String),
    /// About to open the browser at this url
    OpeningBrowser(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Degraded(reason) => write!(
                f,
                "Failed to start plugin server, continuing without it: {}",
                reason
            ),
            Notice::OpeningBrowser(url) => write!(f, "Opening browser at {}...", url),
        }
    }
}

type Notify = Box<dyn Fn(&Notice) + Send + Sync>;

/// Sequences startup, serving and shutdown of every supervised piece.
pub struct Supervisor<R: CommandRunner, B: Browser> {
    config: Arc<RuntimeConfig>,
    settings: Settings,
    manage: Manage<R>,
    browser: B,
    notify: Notify,
    children: Arc<Children>,
    worker: Mutex<Option<BackgroundWorker>>,
    phases: Mutex<Vec<Phase>>,
    degraded: AtomicBool,
    cleanup: Mutex<Option<CleanupReport>>,
}

impl<R: CommandRunner, B: Browser> Supervisor<R, B> {
    pub fn new(
        config: Arc<RuntimeConfig>,
        settings: Settings,
        runner: Arc<R>,
        browser: B,
    ) -> Self {
        let manage = Manage::new(runner, &config);

        Self {
            config,
            settings,
            manage,
            browser,
            notify: Box::new(|_| ()),
            children: Arc::new(Children::new()),
            worker: Mutex::new(None),
            phases: Mutex::new(Vec::new()),
            degraded: AtomicBool::new(false),
            cleanup: Mutex::new(None),
        }
    }

    /// Calls `notify` with every operator notice as it happens.
    pub fn with_notices<F>(mut self, notify: F) -> Self
    where
        F: Fn(&Notice) + Send + Sync + 'static,
    {
        self.notify = Box::new(notify);
        self
    }

    /// The live children, shared with anything that needs to clean up on a fault path
    pub fn children(&self) -> &Arc<Children> {
        &self.children
    }

    /// Every phase entered so far
    pub fn phases(&self) -> Vec<Phase> {
        lock(&self.phases).clone()
    }

    /// True if the plugin server could not be started
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Result of the cleanup pass, once shutdown has run
    pub fn cleanup_report(&self) -> Option<CleanupReport> {
        lock(&self.cleanup).clone()
    }

    /// Runs the whole lifecycle until the web server returns or `shutdown` resolves.
    ///
    /// Cleanup of the children happens on every path before this returns. Errors are the fatal
    /// ones, bootstrap and migration.
    pub async fn run<S>(&self, shutdown: S) -> Result<Outcome, Error>
    where
        S: Future<Output = ()>,
    {
        let result = {
            let lifecycle = self.start_and_serve().fuse();
            let shutdown = shutdown.fuse();
            pin_mut!(lifecycle, shutdown);

            select! {
                result = lifecycle => result,
                () = shutdown => {
                    info!("interrupt received");
                    Ok(Outcome::Interrupted)
                }
            }
        };

        self.shut_down().await;
        result
    }

    fn enter(&self, phase: Phase) {
        info!("entering {}", phase);
        lock(&self.phases).push(phase);
    }

    async fn start_and_serve(&self) -> Result<Outcome, Error> {
        self.enter(Phase::Configuring);
        info!(
            "base directory: {}, site: {}",
            self.config.layout().base_dir.display(),
            self.config.site_url()
        );

        self.enter(Phase::Bootstrapping);
        let boot = state::bootstrap(self.config.layout()).map_err(|e| {
            error!("bootstrap failed: {}", e);
            e
        })?;
        info!(
            "data directory {:?}, config {:?} (first run: {}), data store {:?}",
            boot.data_dir, boot.config_file, boot.config.first_run, boot.data_store
        );

        self.enter(Phase::LaunchingWorker);
        if self.settings.plugin_server {
            if let Err(e) = launch_plugin_server(&self.config, &self.children) {
                self.degraded.store(true, Ordering::SeqCst);
                warn!(
                    "plugin server is not running, continuing in degraded mode: {}",
                    e
                );
                (self.notify)(&Notice::Degraded(e.to_string()));
            }
        } else {
            info!("plugin server disabled");
        }

        self.enter(Phase::StartingBackgroundWorker);
        if self.settings.background_worker {
            let worker =
                BackgroundWorker::start(self.manage.clone(), ManageCommand::celery_worker());
            *lock(&self.worker) = Some(worker);
        } else {
            info!("background worker disabled");
        }

        self.enter(Phase::AwaitingReadiness);
        // nothing to probe if the plugin server never started
        let readiness = if self.is_degraded() || !self.settings.plugin_server {
            Readiness::GracePeriod
        } else {
            self.settings.readiness.clone()
        };
        if let Err(e) = readiness
            .wait(self.settings.grace_period, self.settings.ready_timeout)
            .await
        {
            warn!("continuing anyway: {}", e);
        }

        info!("opening browser at {}", self.config.site_url());
        (self.notify)(&Notice::OpeningBrowser(self.config.site_url().to_string()));
        if let Err(e) = self.browser.open(self.config.site_url()) {
            warn!("could not open a browser: {}", e);
        }

        self.enter(Phase::Serving);
        let manage = &self.manage;
        let migrate = &ManageCommand::migrate();
        self.settings
            .migrate_retry
            .retry(move || manage.invoke(migrate))
            .await
            .map_err(|e| {
                error!("migration failed, not starting the web server: {}", e);
                e
            })?;

        let runserver = ManageCommand::runserver(&self.config.bind_addr());
        match self.manage.invoke(&runserver).await {
            Ok(_) => Ok(Outcome::ServerExited),
            Err(e) => {
                error!("web server stopped with an error: {}", e);
                Ok(Outcome::ServerFailed)
            }
        }
    }

    async fn shut_down(&self) {
        self.enter(Phase::ShuttingDown);

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            let stop = worker.stop(self.settings.worker_stop_timeout).await;
            info!("background worker: {:?}", stop);
        }

        match self.children.cleanup() {
            Some(report) => {
                info!(
                    "cleanup: {} requested, {} terminated, {} already exited, {} failed",
                    report.requested, report.signaled, report.already_exited, report.failed
                );
                *lock(&self.cleanup) = Some(report);
            }
            None => debug!("cleanup already ran"),
        }

        self.enter(Phase::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;

    use super::*;
    use crate::command::{CommandOutput, Invocation};
    use crate::config::{Layout, Options};
    use crate::error::ErrorKind;
    use crate::manage::tests::RecordingRunner;

    #[derive(Default)]
    struct RecordingBrowser {
        opened: Mutex<Vec<String>>,
    }

    impl Browser for RecordingBrowser {
        fn open(&self, url: &str) -> Result<(), Error> {
            lock(&self.opened).push(url.to_string());
            Ok(())
        }
    }

    /// Serves forever, everything else succeeds
    #[derive(Default)]
    struct ServesForever {
        inner: RecordingRunner,
    }

    #[async_trait]
    impl CommandRunner for ServesForever {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, Error> {
            let output = self.inner.run(invocation).await?;
            if invocation.args.iter().any(|a| a == "runserver") {
                futures::future::pending::<()>().await;
            }
            Ok(output)
        }
    }

    fn settings() -> Settings {
        Settings {
            grace_period: Duration::from_millis(0),
            background_worker: false,
            ..Settings::default()
        }
    }

    /// A layout whose plugin server is `/bin/sh <script>`
    fn layout(base: &Path, script: &str) -> Layout {
        let entry = base.join("index.sh");
        fs::write(&entry, script).expect("write");

        let mut layout = Layout::new(base);
        layout.node = PathBuf::from("/bin/sh");
        layout.plugin_server_entry = entry;
        layout
    }

    fn supervisor<R: CommandRunner>(
        layout: Layout,
        settings: Settings,
        runner: &Arc<R>,
    ) -> Supervisor<R, RecordingBrowser> {
        let config = Arc::new(RuntimeConfig::new(layout, Options::default()));
        Supervisor::new(
            config,
            settings,
            Arc::clone(runner),
            RecordingBrowser::default(),
        )
    }

    #[tokio::test]
    async fn fresh_start_runs_every_phase_in_order() {
        let base = tempfile::tempdir().expect("tempdir");
        let layout = layout(base.path(), "exec sleep 30\n");
        let runner = Arc::new(RecordingRunner::default());
        let supervisor = supervisor(layout.clone(), settings(), &runner);

        let outcome = supervisor
            .run(futures::future::pending())
            .await
            .expect("run");

        assert_eq!(outcome, Outcome::ServerExited);
        assert_eq!(
            supervisor.phases(),
            vec![
                Phase::Configuring,
                Phase::Bootstrapping,
                Phase::LaunchingWorker,
                Phase::StartingBackgroundWorker,
                Phase::AwaitingReadiness,
                Phase::Serving,
                Phase::ShuttingDown,
                Phase::Terminated,
            ]
        );
        assert!(layout.data_dir.is_dir());
        assert!(layout.config_file.is_file());
        assert!(layout.data_store.is_file());
        assert!(!supervisor.is_degraded());
        assert_eq!(
            *lock(&supervisor.browser.opened),
            vec!["http://localhost:8000"]
        );
        assert_eq!(
            runner.commands(),
            vec!["migrate --noinput", "runserver 0.0.0.0:8000"]
        );

        let report = supervisor.cleanup_report().expect("cleanup ran");
        assert_eq!(report.requested, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn launch_failure_still_serves() {
        let base = tempfile::tempdir().expect("tempdir");
        let mut layout = Layout::new(base.path());
        layout.node = PathBuf::from("/nonexistent/node");
        fs::create_dir_all(&layout.data_dir).expect("mkdir");
        fs::write(&layout.data_store, b"").expect("write");

        let runner = Arc::new(RecordingRunner::default());
        let notices = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&notices);
        let supervisor = supervisor(layout, settings(), &runner)
            .with_notices(move |notice| lock(&recorded).push(notice.clone()));

        let outcome = supervisor
            .run(futures::future::pending())
            .await
            .expect("run");

        assert_eq!(outcome, Outcome::ServerExited);
        assert!(supervisor.is_degraded());
        assert!(supervisor.phases().contains(&Phase::Serving));
        assert_eq!(lock(&supervisor.browser.opened).len(), 1);

        let notices = lock(&notices).clone();
        assert_eq!(notices.len(), 2);
        assert!(matches!(notices[0], Notice::Degraded(_)));
        assert_eq!(
            notices[1],
            Notice::OpeningBrowser("http://localhost:8000".to_string())
        );
        assert_eq!(supervisor.cleanup_report().expect("cleanup").requested, 0);
    }

    #[tokio::test]
    async fn failed_migration_never_starts_the_server() {
        let base = tempfile::tempdir().expect("tempdir");
        let layout = layout(base.path(), "exec sleep 30\n");
        let runner = Arc::new(RecordingRunner::failing_on("migrate"));
        let supervisor = supervisor(layout, settings(), &runner);

        let err = supervisor
            .run(futures::future::pending())
            .await
            .expect_err("migration failure is fatal");

        assert!(matches!(err.kind(), ErrorKind::CommandFailed { .. }));
        assert_eq!(runner.commands(), vec!["migrate --noinput"]);
        assert_eq!(
            supervisor.phases().last().copied(),
            Some(Phase::Terminated)
        );
        assert_eq!(supervisor.cleanup_report().expect("cleanup").requested, 1);
    }

    #[tokio::test]
    async fn migration_is_retried_until_exhausted() {
        let base = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(RecordingRunner::failing_on("migrate"));
        let settings = Settings {
            plugin_server: false,
            migrate_retry: RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(1),
            },
            ..settings()
        };
        let supervisor = supervisor(Layout::new(base.path()), settings, &runner);

        let err = supervisor
            .run(futures::future::pending())
            .await
            .expect_err("should fail");

        assert!(matches!(
            err.kind(),
            ErrorKind::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(runner.commands().len(), 3);
        assert!(runner.commands().iter().all(|c| c == "migrate --noinput"));
    }

    #[tokio::test]
    async fn bootstrap_failure_starts_nothing() {
        let base = tempfile::tempdir().expect("tempdir");
        let layout = layout(base.path(), "exec sleep 30\n");
        // a file where the data directory should be
        fs::write(&layout.data_dir, b"").expect("write");

        let runner = Arc::new(RecordingRunner::default());
        let supervisor = supervisor(layout, settings(), &runner);

        let err = supervisor
            .run(futures::future::pending())
            .await
            .expect_err("bootstrap failure is fatal");

        assert!(matches!(err.kind(), ErrorKind::Bootstrap { .. }));
        assert_eq!(
            supervisor.phases(),
            vec![
                Phase::Configuring,
                Phase::Bootstrapping,
                Phase::ShuttingDown,
                Phase::Terminated,
            ]
        );
        assert!(runner.commands().is_empty());
        assert!(lock(&supervisor.browser.opened).is_empty());
        assert_eq!(supervisor.cleanup_report().expect("cleanup").requested, 0);
    }

    #[tokio::test]
    async fn interrupt_while_serving_cleans_up_once() {
        let base = tempfile::tempdir().expect("tempdir");
        let layout = layout(base.path(), "exec sleep 30\n");
        let runner = Arc::new(ServesForever::default());
        let settings = Settings {
            background_worker: true,
            ..settings()
        };
        let supervisor = supervisor(layout, settings, &runner);

        let outcome = supervisor
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .expect("run");

        assert_eq!(outcome, Outcome::Interrupted);
        assert!(supervisor.phases().contains(&Phase::Serving));
        assert_eq!(
            supervisor.cleanup_report().expect("cleanup").requested,
            1
        );

        // a later normal exit path finds nothing left to do
        assert!(supervisor.children().cleanup().is_none());
        assert!(supervisor.children().is_cleaned());
        assert_eq!(
            supervisor.phases().last().copied(),
            Some(Phase::Terminated)
        );
    }
}
