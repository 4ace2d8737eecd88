// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use tracing::info;

use crate::Error;

/// Points the operator at the running site
pub trait Browser: Send + Sync {
    fn open(&self, url: &str) -> Result<(), Error>;
}

/// The desktop's default browser
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), Error> {
        open::that(url)?;
        Ok(())
    }
}

/// For headless runs, `--no-browser`
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBrowser;

impl Browser for NoBrowser {
    fn open(&self, url: &str) -> Result<(), Error> {
        info!("not opening a browser, site is at {}", url);
        Ok(())
    }
}
