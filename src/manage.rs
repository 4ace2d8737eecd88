// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::config::RuntimeConfig;
use crate::Error;

/// A management command, i.e. `<interpreter> manage.py <name> [args...]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManageCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl ManageCommand {
    pub fn new<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn migrate() -> Self {
        Self::new("migrate", vec!["--noinput"])
    }

    pub fn runserver(bind_addr: &str) -> Self {
        Self::new("runserver", vec![bind_addr])
    }

    pub fn celery_worker() -> Self {
        Self::new("celery", vec!["worker", "--loglevel=info"])
    }
}

impl fmt::Display for ManageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Invokes management commands against the bootstrapped state
pub struct Manage<R: CommandRunner> {
    runner: Arc<R>,
    interpreter: PathBuf,
    script: PathBuf,
    cwd: PathBuf,
    env: Arc<BTreeMap<String, String>>,
}

impl<R: CommandRunner> Clone for Manage<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            interpreter: self.interpreter.clone(),
            script: self.script.clone(),
            cwd: self.cwd.clone(),
            env: Arc::clone(&self.env),
        }
    }
}

impl<R: CommandRunner> Manage<R> {
    pub fn new(runner: Arc<R>, config: &RuntimeConfig) -> Self {
        let layout = config.layout();

        Self {
            runner,
            interpreter: layout.python.clone(),
            script: layout.manage_script.clone(),
            cwd: layout.base_dir.clone(),
            env: Arc::new(config.to_env()),
        }
    }

    pub fn invocation(&self, command: &ManageCommand) -> Invocation {
        Invocation::new(&self.interpreter, &self.cwd)
            .arg(self.script.to_string_lossy())
            .arg(command.name.as_str())
            .args(command.args.iter().map(String::as_str))
            .envs(&self.env)
    }

    /// Runs the command and logs what it printed
    pub async fn invoke(&self, command: &ManageCommand) -> Result<CommandOutput, Error> {
        info!("running management command: {}", command);

        match self.runner.run(&self.invocation(command)).await {
            Ok(output) => {
                info!("{} finished with status {:?}", command, output.exit_code);
                Ok(output)
            }
            Err(e) => {
                error!("{} failed: {}", command, e);
                Err(e)
            }
        }
    }

    /// Same as `invoke` but only reports success
    pub async fn run(&self, command: &ManageCommand) -> bool {
        self.invoke(command).await.is_ok()
    }
}
