use crate::bridge::{Bridge, BridgeError, NewGame, Outcome};
use crate::command::{self, Command};
use crate::config::Config;
use crate::game::Variant;
use crate::host::Browser;
use crate::session::ConversationKey;
use async_trait::async_trait;
use derive_more::Display;
use std::io;
use tracing::{info, instrument, warn};

/// The notice sent before a page is created.
pub const NOTICE: &str = "Creating a new game…";

/// Who sent a command.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct Author {
    /// The group the command was sent in, if any.
    pub guild: Option<String>,

    /// The sender.
    pub user: String,

    /// The sender's privilege level.
    pub authority: u8,
}

impl Author {
    /// The conversation this author is talking in.
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.guild.as_deref(), &self.user)
    }
}

/// A chat message.
#[derive(Debug, Display, Clone, Eq, PartialEq)]
pub enum Message {
    #[display(fmt = "{}", _0)]
    Text(String),

    /// A PNG image.
    #[display(fmt = "Image({} bytes)", "_0.len()")]
    Image(Vec<u8>),
}

impl From<Outcome> for Message {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Frame(f) => Message::Image(f.into_png()),
            Outcome::Rejected(r) => Message::Text(r),
        }
    }
}

/// Where messages are delivered ahead of the reply.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Outbox: Send {
    /// Sends a message to the conversation.
    async fn send(&mut self, msg: Message) -> io::Result<()>;
}

/// The chat plugin.
pub struct Bot<B: Browser> {
    bridge: Bridge<B>,
}

impl<B: Browser> Bot<B> {
    /// Activates the plugin with no games in progress.
    pub fn activate(browser: B, config: Config) -> Self {
        info!(%config, "activated");

        Bot {
            bridge: Bridge::new(browser, config),
        }
    }

    /// The runtime configuration.
    pub fn config(&self) -> &Config {
        self.bridge.config()
    }

    /// Handles one chat line from `author` and returns the reply.
    ///
    /// Failures are replied to rather than propagated.
    #[instrument(level = "debug", skip(self, outbox), fields(key = %author.key()))]
    pub async fn handle<O: Outbox + ?Sized>(
        &self,
        author: &Author,
        line: &str,
        outbox: &mut O,
    ) -> Message {
        let cmd = match line.parse::<Command>() {
            Ok(cmd) => cmd,
            Err(e) => return Message::Text(e.to_string()),
        };

        match self.dispatch(author, cmd, outbox).await {
            Ok(msg) => msg,
            Err(e) => Message::Text(explain(&e)),
        }
    }

    async fn dispatch<O: Outbox + ?Sized>(
        &self,
        author: &Author,
        cmd: Command,
        outbox: &mut O,
    ) -> Result<Message, BridgeError> {
        let key = author.key();

        let msg = match cmd {
            Command::Start(s) => {
                let game = NewGame {
                    position: s.position.unwrap_or_default(),
                    variant: s.variant,
                    replace: s.replace,
                    full: s.full,
                };

                self.create(&key, game, outbox).await?.into()
            }

            Command::Import(i) => {
                let game = NewGame {
                    position: i.content,
                    variant: i.variant,
                    replace: i.replace,
                    full: i.full,
                };

                self.create(&key, game, outbox).await?.into()
            }

            Command::Show(s) => Message::Image(self.bridge.show(&key, s.full).await?.into_png()),
            Command::Move(m) => self.bridge.play(&key, &m.input, m.full).await?.into(),
            Command::Export(e) => Message::Text(self.bridge.export(&key, e.format).await?),
            Command::List => Message::Text(listing(&self.bridge.list().await)),

            Command::End(command::End { all: false }) => {
                if self.bridge.end(&key).await {
                    Message::Text(format!("Ended game '{key}'."))
                } else {
                    Message::Text("No game in progress.".into())
                }
            }

            Command::End(command::End { all: true }) if author.authority < self.config().admin => {
                warn!(user = %author.user, authority = author.authority, "permission denied");
                Message::Text("Permission denied.".into())
            }

            Command::End(command::End { all: true }) => {
                Message::Text(format!("Ended all {} games.", self.bridge.end_all().await))
            }

            Command::Debug => match self.bridge.last_frame().await {
                Some(f) => Message::Image(f.into_png()),
                None => Message::Text("No frame captured yet.".into()),
            },
        };

        Ok(msg)
    }

    async fn create<O: Outbox + ?Sized>(
        &self,
        key: &ConversationKey,
        game: NewGame,
        outbox: &mut O,
    ) -> Result<Outcome, BridgeError> {
        if let Some(v) = &game.variant {
            v.parse::<Variant>()?;
        }

        if game.replace || !self.bridge.is_active(key).await {
            if let Err(e) = outbox.send(Message::Text(NOTICE.into())).await {
                warn!(error = %e, "failed to send notice");
            }
        }

        self.bridge.start(key, game).await
    }

    /// Deactivates the plugin, ending every game and returning how many there were.
    #[instrument(level = "debug", skip(self), ret)]
    pub async fn dispose(self) -> usize {
        self.bridge.end_all().await
    }
}

fn listing(keys: &[ConversationKey]) -> String {
    if keys.is_empty() {
        return "No games in progress.".into();
    }

    let names: Vec<_> = keys.iter().map(|k| format!("'{k}'")).collect();
    format!("There are {} games in progress: {}", keys.len(), names.join(", "))
}

fn explain(e: &BridgeError) -> String {
    match e {
        BridgeError::NoActiveSession => "No game in progress, create one with `start` first.".into(),
        BridgeError::Conflict(_) => {
            "A game is already in progress, pass --override to replace it.".into()
        }
        BridgeError::UnknownVariant(e) => format!("Unknown variant '{}'.", e.0),
        BridgeError::Host(e) => format!("The game host failed ({e}), no game is in progress."),
    }
}
