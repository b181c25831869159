use anyhow::{bail, Context, Error as Anyhow};
use clap::Parser;
use lib::bridge::{Bridge, NewGame, Outcome};
use lib::config::Config;
use lib::host::Browser;
use lib::session::ConversationKey;
use std::path::PathBuf;
use tracing::{info, instrument};

/// Renders a position to a PNG file.
#[derive(Debug, Parser)]
#[clap(disable_help_flag = true, disable_version_flag = true)]
pub struct Snapshot {
    /// The variant to play.
    #[clap(short, long)]
    variant: Option<String>,

    /// Frame the full board.
    #[clap(short, long)]
    full: bool,

    /// Where the image is written to.
    output: PathBuf,

    /// The position, or the variant's starting position if omitted.
    position: Option<String>,
}

impl Snapshot {
    #[instrument(level = "trace", skip(browser, config), err)]
    pub async fn execute<B: Browser>(self, browser: B, config: Config) -> Result<(), Anyhow> {
        let bridge = Bridge::new(browser, config);
        let key = ConversationKey::from("snapshot");

        let game = NewGame {
            position: self.position.unwrap_or_default(),
            variant: self.variant,
            replace: true,
            full: self.full,
        };

        let outcome = bridge.start(&key, game).await;
        bridge.end_all().await;

        match outcome? {
            Outcome::Rejected(reason) => bail!("the position was rejected: {reason}"),
            Outcome::Frame(frame) => {
                info!(%frame, output = %self.output.display());
                tokio::fs::write(&self.output, frame.into_png())
                    .await
                    .with_context(|| format!("failed to write '{}'", self.output.display()))?;
            }
        }

        Ok(())
    }
}
