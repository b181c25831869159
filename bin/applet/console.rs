use crate::io::{Io, Pipe};
use anyhow::{Context, Error as Anyhow};
use async_trait::async_trait;
use clap::Parser;
use lib::bot::{Author, Bot, Message, Outbox};
use lib::config::Config;
use lib::host::Browser;
use std::{io, path::PathBuf};
use tokio::io::{stdin, stdout};
use tracing::{info, instrument};

/// A chat over the standard streams.
///
/// Every line is a command, optionally addressed as `@user` or `@user@group`. Lines ending with
/// a backslash continue on the next one. Images are written to files and replied to by path.
#[derive(Debug, Default, Parser)]
#[clap(disable_help_flag = true, disable_version_flag = true)]
pub struct Console {
    /// Where images are written to.
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// The privilege level of whoever is typing.
    #[clap(short, long, default_value_t)]
    authority: u8,
}

impl Console {
    #[instrument(level = "trace", skip(self, browser, config), err)]
    pub async fn execute<B: Browser>(self, browser: B, config: Config) -> Result<(), Anyhow> {
        let bot = Bot::activate(browser, config);
        let mut chat = Chat::new(Pipe::new(stdout(), stdin()), self.out.unwrap_or_default());
        let result = chat.run(&bot, self.authority).await;
        info!(ended = bot.dispose().await, "deactivated");
        result
    }
}

/// Splits the optional `@user[@group]` address off a command.
fn address(line: &str, authority: u8) -> (Author, &str) {
    let addressed = line
        .strip_prefix('@')
        .and_then(|l| l.split_once(char::is_whitespace));

    match addressed {
        None => (
            Author {
                guild: None,
                user: "console".into(),
                authority,
            },
            line,
        ),

        Some((who, cmd)) => {
            let (user, guild) = match who.split_once('@') {
                Some((u, g)) => (u, Some(g.to_string())),
                None => (who, None),
            };

            let author = Author {
                guild,
                user: user.into(),
                authority,
            };

            (author, cmd.trim_start())
        }
    }
}

struct Chat<T: Io> {
    io: T,
    out: PathBuf,
    frames: usize,
}

impl<T: Io> Chat<T> {
    fn new(io: T, out: PathBuf) -> Self {
        Chat { io, out, frames: 0 }
    }

    /// Reads a command, joining continued lines.
    async fn read(&mut self) -> io::Result<Option<String>> {
        let mut buf = String::new();

        while let Some(line) = self.io.recv().await? {
            match line.strip_suffix('\\') {
                Some(l) => {
                    buf.push_str(l);
                    buf.push('\n');
                }

                None => {
                    buf.push_str(&line);
                    return Ok(Some(buf));
                }
            }
        }

        Ok(Some(buf).filter(|b| !b.is_empty()))
    }

    async fn deliver(&mut self, msg: Message) -> io::Result<()> {
        match msg {
            Message::Text(text) => self.io.send(&text).await?,
            Message::Image(png) => {
                self.frames += 1;
                let path = self.out.join(format!("frame-{}.png", self.frames));
                tokio::fs::write(&path, png).await?;
                self.io.send(&path.display().to_string()).await?;
            }
        }

        self.io.flush().await
    }

    async fn run<B: Browser>(&mut self, bot: &Bot<B>, authority: u8) -> Result<(), Anyhow> {
        while let Some(line) = self.read().await? {
            let (author, cmd) = address(&line, authority);

            if !cmd.trim().is_empty() {
                let reply = bot.handle(&author, cmd, self).await;
                self.deliver(reply).await.context("failed to deliver reply")?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<T: Io> Outbox for Chat<T> {
    async fn send(&mut self, msg: Message) -> io::Result<()> {
        self.deliver(msg).await
    }
}
