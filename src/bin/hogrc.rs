// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg, ArgMatches, SubCommand};
use tokio::runtime;
use tracing::{error, info};

use hogrc::browser::{Browser, NoBrowser, SystemBrowser};
use hogrc::command::{RetryPolicy, SystemRunner};
use hogrc::config::{Layout, Options, RuntimeConfig, DEFAULT_SECRET_KEY};
use hogrc::logging::{init_logging, DEFAULT_LOG_FILE};
use hogrc::procs::{Outcome, Settings, Supervisor};
use hogrc::readiness::Readiness;
use hogrc::{state, Error, ErrorKind};

const START: &str = "start";
const INIT: &str = "init";

const BASE_DIR: &str = "base-dir";
const PORT: &str = "port";
const SECRET_KEY: &str = "secret-key";
const LOG_FILE: &str = "log-file";
const GRACE_PERIOD: &str = "grace-period";
const READY_TIMEOUT: &str = "ready-timeout";
const WORKER_PROBE: &str = "worker-probe";
const MIGRATE_ATTEMPTS: &str = "migrate-attempts";
const MIGRATE_BACKOFF: &str = "migrate-backoff";
const WORKER_STOP_TIMEOUT: &str = "worker-stop-timeout";
const NO_BROWSER: &str = "no-browser";
const NO_PLUGIN_SERVER: &str = "no-plugin-server";
const NO_WORKER: &str = "no-worker";
const QUIET: &str = "quiet";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
}

impl<'a, 'b> SetupClapApp for App<'a, 'b> {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }
}

fn is_number<T: FromStr>(v: String) -> Result<(), String> {
    v.parse::<T>()
        .map(|_| ())
        .map_err(|_| format!("number was expected, got {}", v))
}

fn option(name: &'static str, env: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .long(name)
        .env(env)
        .takes_value(true)
        .help(help)
}

fn flag(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name).long(name).help(help)
}

fn app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            option(
                BASE_DIR,
                "HOGRC_BASE_DIR",
                "installation directory, defaults to the directory of this executable",
            )
            .value_name("DIR"),
        )
        .arg(
            option(PORT, "HOGRC_PORT", "port of the web server")
                .value_name("PORT")
                .default_value("8000")
                .validator(is_number::<u16>),
        )
        .arg(
            option(SECRET_KEY, "HOGRC_SECRET_KEY", "signing key for the web server")
                .value_name("KEY")
                .hide_env_values(true),
        )
        .arg(
            option(
                LOG_FILE,
                "HOGRC_LOG_FILE",
                "log file, defaults to hogrc.log in the base directory",
            )
            .value_name("PATH"),
        )
        .arg(
            option(
                GRACE_PERIOD,
                "HOGRC_GRACE_PERIOD",
                "seconds to wait for the workers before opening the browser",
            )
            .value_name("SECS")
            .default_value("5")
            .validator(is_number::<u64>),
        )
        .arg(
            option(
                READY_TIMEOUT,
                "HOGRC_READY_TIMEOUT",
                "seconds to keep probing the plugin server after the grace period",
            )
            .value_name("SECS")
            .default_value("30")
            .validator(is_number::<u64>),
        )
        .arg(
            option(
                WORKER_PROBE,
                "HOGRC_WORKER_PROBE",
                "plugin server readiness probe, host:port or file:<path>",
            )
            .value_name("PROBE")
            .validator(|v| v.parse::<Readiness>().map(|_| ()).map_err(|e| e.to_string())),
        )
        .arg(
            option(
                MIGRATE_ATTEMPTS,
                "HOGRC_MIGRATE_ATTEMPTS",
                "how often to try the database migration",
            )
            .value_name("N")
            .default_value("1")
            .validator(is_number::<usize>),
        )
        .arg(
            option(
                MIGRATE_BACKOFF,
                "HOGRC_MIGRATE_BACKOFF",
                "seconds between migration attempts",
            )
            .value_name("SECS")
            .default_value("2")
            .validator(is_number::<u64>),
        )
        .arg(
            option(
                WORKER_STOP_TIMEOUT,
                "HOGRC_WORKER_STOP_TIMEOUT",
                "seconds to wait for the background worker on shutdown",
            )
            .value_name("SECS")
            .default_value("5")
            .validator(is_number::<u64>),
        )
        .arg(flag(NO_BROWSER, "do not open a browser"))
        .arg(flag(NO_PLUGIN_SERVER, "do not start the plugin server"))
        .arg(flag(NO_WORKER, "do not start the background worker"))
        .arg(flag(QUIET, "only show warnings and errors on the console").short("q"))
        .subcommand(
            SubCommand::with_name(START)
                .about("start every service and run the web server (default)")
                .setup_clap_app(),
        )
        .subcommand(
            SubCommand::with_name(INIT)
                .about("prepare the data directory and exit")
                .setup_clap_app(),
        )
}

fn main() {
    let args = app().get_matches();

    let code = match run(&args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", explain(&e));
            1
        }
    };

    std::process::exit(code);
}

/// A plain language message for the operator
fn explain(e: &Error) -> String {
    match e.kind() {
        ErrorKind::Bootstrap { path, .. } => format!(
            "Failed to initialize {}, see the log for details: {}",
            path.display(),
            e
        ),
        ErrorKind::CommandFailed { .. } | ErrorKind::RetriesExhausted { .. } => format!(
            "Failed to migrate the database, the web server was not started: {}",
            e
        ),
        _ => format!("hogrc failed: {}", e),
    }
}

fn seconds(args: &ArgMatches<'_>, name: &str) -> Duration {
    Duration::from_secs(value(args, name).unwrap_or_default())
}

fn value<T: FromStr>(args: &ArgMatches<'_>, name: &str) -> Option<T> {
    args.value_of(name).and_then(|v| v.parse().ok())
}

fn base_dir(args: &ArgMatches<'_>) -> Result<PathBuf, Error> {
    if let Some(dir) = args.value_of_os(BASE_DIR) {
        return Ok(PathBuf::from(dir));
    }

    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::from("executable has no parent directory"))
}

fn run(args: &ArgMatches<'_>) -> Result<(), Error> {
    let base_dir = base_dir(args)?;
    let log_file = args
        .value_of_os(LOG_FILE)
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir.join(DEFAULT_LOG_FILE));

    init_logging(&log_file, args.is_present(QUIET))?;
    info!("base directory: {}", base_dir.display());

    let options = Options {
        port: value(args, PORT).unwrap_or(hogrc::config::DEFAULT_PORT),
        secret_key: args
            .value_of(SECRET_KEY)
            .unwrap_or(DEFAULT_SECRET_KEY)
            .to_string(),
        inherited_path: std::env::var_os("PATH"),
    };
    let config = Arc::new(RuntimeConfig::new(Layout::new(&base_dir), options));

    match args.subcommand() {
        (INIT, Some(_)) => init(&config),
        (START, _) | ("", None) => {
            println!("Starting... (this may take a minute)");
            println!("Check {} for detailed logs", log_file.display());

            let settings = settings(args);
            if args.is_present(NO_BROWSER) {
                start(config, settings, NoBrowser)
            } else {
                start(config, settings, SystemBrowser)
            }
        }
        (arg, _) => Err(format!("unexpected argument: {}", arg).into()),
    }
}

fn settings(args: &ArgMatches<'_>) -> Settings {
    Settings {
        grace_period: seconds(args, GRACE_PERIOD),
        readiness: value(args, WORKER_PROBE).unwrap_or_default(),
        ready_timeout: seconds(args, READY_TIMEOUT),
        migrate_retry: RetryPolicy {
            attempts: value(args, MIGRATE_ATTEMPTS).unwrap_or(1),
            backoff: seconds(args, MIGRATE_BACKOFF),
        },
        worker_stop_timeout: seconds(args, WORKER_STOP_TIMEOUT),
        plugin_server: !args.is_present(NO_PLUGIN_SERVER),
        background_worker: !args.is_present(NO_WORKER),
    }
}

fn init(config: &RuntimeConfig) -> Result<(), Error> {
    let boot = state::bootstrap(config.layout())?;

    println!("data directory: {}", config.data_dir().display());
    println!(
        "config: {} ({:?})",
        config.layout().config_file.display(),
        boot.config_file
    );
    println!(
        "data store: {} ({:?})",
        boot.store.path().display(),
        boot.data_store
    );
    Ok(())
}

fn start<B: Browser>(
    config: Arc<RuntimeConfig>,
    settings: Settings,
    browser: B,
) -> Result<(), Error> {
    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let supervisor = Supervisor::new(config, settings, Arc::new(SystemRunner), browser)
        .with_notices(|notice| println!("{}", notice));
    let outcome = runtime.block_on(supervisor.run(shutdown_signal()))?;

    match outcome {
        Outcome::ServerExited => info!("web server exited"),
        Outcome::ServerFailed => error!("web server failed, see above"),
        Outcome::Interrupted => info!("stopped"),
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("could not listen for SIGTERM: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
