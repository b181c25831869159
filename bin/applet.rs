use crate::host::Chromium;
use anyhow::Error as Anyhow;
use clap::Subcommand;
use derive_more::From;
use lib::config::Config;

mod console;
mod snapshot;

#[derive(From, Subcommand)]
pub enum Applet {
    Console(console::Console),
    Snapshot(snapshot::Snapshot),
}

impl Default for Applet {
    fn default() -> Self {
        console::Console::default().into()
    }
}

impl Applet {
    pub async fn execute(self, browser: Chromium, config: Config) -> Result<(), Anyhow> {
        match self {
            Applet::Console(a) => a.execute(browser, config).await,
            Applet::Snapshot(a) => a.execute(browser, config).await,
        }
    }
}
