use crate::{applet::Applet, host::Chromium};
use anyhow::{Context, Error as Anyhow};
use clap::Parser;
use lib::config::Config;
use std::{cmp::min, io::stderr, path::PathBuf};
use tracing::{error, instrument, Level};
use tracing_subscriber::fmt::{format::FmtSpan, layer};
use tracing_subscriber::{filter::Targets, prelude::*, registry, util::SubscriberInitExt};

/// Command line interface.
#[derive(Parser)]
#[clap(author, version, about)]
pub struct Cli {
    /// Verbosity level.
    #[clap(short, long)]
    #[cfg_attr(not(debug_assertions), clap(default_value_t = Level::INFO))]
    #[cfg_attr(debug_assertions, clap(default_value_t = Level::DEBUG))]
    verbosity: Level,

    /// Path to a configuration file in RON.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// The Chromium executable.
    #[clap(long, default_value = "chromium")]
    chromium: String,

    #[clap(subcommand)]
    applet: Option<Applet>,
}

impl Cli {
    async fn config(&self) -> Result<Config, Anyhow> {
        let Some(path) = &self.config else {
            return Ok(Config::default());
        };

        let ron = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;

        ron.parse()
            .with_context(|| format!("invalid configuration in '{}'", path.display()))
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn execute(self) -> Result<(), Anyhow> {
        let filter = Targets::new()
            .with_target("cli", self.verbosity)
            .with_target("lib", self.verbosity)
            .with_default(min(Level::WARN, self.verbosity));

        let writer = layer()
            .pretty()
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(stderr);

        registry().with(filter).with(writer).init();

        let config = self.config().await?;
        let browser = Chromium::launch(&self.chromium, config.timeout).await?;
        let result = self.applet.unwrap_or_default().execute(browser.clone(), config).await;

        if let Err(e) = browser.shutdown().await {
            error!("{:?}", e);
        }

        result
    }
}
