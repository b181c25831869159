use crate::config::Config;
use crate::frame::Frame;
use crate::game::{ExportFormat, ParseVariantError, Variant};
use crate::host::{bounded, Browser, Call, HostError, Page, Reply};
use crate::session::{ConversationKey, CreateError, Registry, RenderSize, Session, SessionGuard};
use derive_more::{Display, Error, From};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, instrument};

/// The reason why a game command failed.
#[derive(Debug, Display, Error, From)]
pub enum BridgeError {
    #[display(fmt = "no game is in progress")]
    #[from(ignore)]
    NoActiveSession,

    #[display(fmt = "a game is already in progress for '{}'", _0)]
    #[from(ignore)]
    Conflict(#[error(not(source))] ConversationKey),

    #[display(fmt = "{}", _0)]
    UnknownVariant(ParseVariantError),

    #[display(fmt = "the render host failed")]
    Host(HostError),
}

impl From<CreateError> for BridgeError {
    fn from(e: CreateError) -> Self {
        match e {
            CreateError::Conflict(k) => BridgeError::Conflict(k),
            CreateError::Host(e) => BridgeError::Host(e),
        }
    }
}

/// How to set up a new game.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct NewGame {
    /// The game to import, or empty for the starting position.
    pub position: String,

    /// The variant name, or `None` for the configured default.
    pub variant: Option<String>,

    /// Whether to replace a game already in progress.
    pub replace: bool,

    /// Whether to frame the full board rather than the present.
    pub full: bool,
}

/// The result of a command that changes the game.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// The board after the change.
    Frame(Frame),

    /// Why the rules engine refused the change.
    Rejected(String),
}

/// Drives the games bound to each conversation.
pub struct Bridge<B: Browser> {
    registry: Registry<B>,
    config: Config,
    last: Mutex<Option<Frame>>,
}

impl<B: Browser> Bridge<B> {
    /// Constructs a bridge with no games in progress.
    pub fn new(browser: B, config: Config) -> Self {
        Bridge {
            registry: Registry::new(
                browser,
                config.bootstrap.clone(),
                config.render_size,
                config.timeout,
            ),
            config,
            last: Mutex::new(None),
        }
    }

    /// The runtime configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn invoke(&self, page: &B::Page, call: &Call) -> Result<Reply, HostError> {
        bounded(self.config.timeout, page.call(call)).await
    }

    async fn complete(&self, page: &B::Page, call: &Call) -> Result<(), HostError> {
        match self.invoke(page, call).await? {
            Reply::Done => Ok(()),
            Reply::Rejected { reason } => Err(HostError::Script(reason)),
            r => Err(HostError::unexpected(r)),
        }
    }

    /// Resizes the session so the full board fits.
    async fn fit(&self, session: &mut Session<B::Page>) -> Result<(), HostError> {
        let extent = match self.invoke(session.page(), &Call::FullBoard).await? {
            Reply::Extent { width, height } => RenderSize::new(width, height),
            r => return Err(HostError::unexpected(r)),
        };

        let size = extent.fit(self.config.max_render_size);
        bounded(self.config.timeout, session.page().resize(size)).await?;

        let resize = Call::Resize {
            width: size.width,
            height: size.height,
        };

        self.complete(session.page(), &resize).await?;
        session.resize(size);
        Ok(())
    }

    async fn capture(&self, session: &Session<B::Page>) -> Result<Frame, HostError> {
        let frame = self
            .config
            .capture
            .settle(session.page(), Some(session.render_size()), self.config.timeout)
            .await?;

        *self.last.lock().await = Some(frame.clone());
        Ok(frame)
    }

    async fn render(
        &self,
        session: &mut Session<B::Page>,
        call: &Call,
        full: bool,
    ) -> Result<Outcome, HostError> {
        match self.invoke(session.page(), call).await? {
            Reply::Done => {}
            Reply::Rejected { reason } => return Ok(Outcome::Rejected(reason)),
            r => return Err(HostError::unexpected(r)),
        }

        if full {
            self.fit(session).await?;
        }

        Ok(Outcome::Frame(self.capture(session).await?))
    }

    /// Tears down the session if the render host failed.
    async fn check<T>(
        &self,
        session: SessionGuard<B::Page>,
        result: Result<T, HostError>,
    ) -> Result<T, BridgeError> {
        match result {
            Ok(t) => Ok(t),
            Err(e) => {
                error!(key = %session.key(), "{:?}", e);
                self.registry.discard(session).await;
                Err(e.into())
            }
        }
    }

    /// Starts a new game for `key`.
    ///
    /// A game the rules engine refuses to set up leaves no session behind.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn start(&self, key: &ConversationKey, game: NewGame) -> Result<Outcome, BridgeError> {
        let variant = match &game.variant {
            None => self.config.variant,
            Some(v) => v.parse::<Variant>()?,
        };

        let mut session = self.registry.create(key, game.replace).await?;

        let call = Call::Start {
            position: game.position,
            variant,
            skip_detection: self.config.skip_detection,
            zoom: self.config.zoom,
        };

        match self.render(&mut session, &call, game.full).await {
            Ok(Outcome::Rejected(reason)) => {
                self.registry.discard(session).await;
                Ok(Outcome::Rejected(reason))
            }

            result => self.check(session, result).await,
        }
    }

    /// Captures the board of the game in progress for `key`.
    ///
    /// The camera is framed on the present timelines, or on the full board if `full` is set.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn show(&self, key: &ConversationKey, full: bool) -> Result<Frame, BridgeError> {
        let mut session = self
            .registry
            .resolve(key)
            .await
            .ok_or(BridgeError::NoActiveSession)?;

        let result = async {
            if full {
                self.fit(&mut session).await?;
            } else {
                let present = Call::Present {
                    zoom: self.config.zoom,
                };

                self.complete(session.page(), &present).await?;
            }

            self.capture(&session).await
        }
        .await;

        self.check(session, result).await
    }

    /// Plays a move in the game in progress for `key`.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn play(
        &self,
        key: &ConversationKey,
        input: &str,
        full: bool,
    ) -> Result<Outcome, BridgeError> {
        let mut session = self
            .registry
            .resolve(key)
            .await
            .ok_or(BridgeError::NoActiveSession)?;

        let call = Call::Move {
            input: input.to_string(),
            zoom: self.config.zoom,
        };

        let result = self.render(&mut session, &call, full).await;
        self.check(session, result).await
    }

    /// Exports the game in progress for `key`.
    ///
    /// Textual exports are returned verbatim, structured ones as JSON.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn export(
        &self,
        key: &ConversationKey,
        format: Option<ExportFormat>,
    ) -> Result<String, BridgeError> {
        let session = self
            .registry
            .resolve(key)
            .await
            .ok_or(BridgeError::NoActiveSession)?;

        let call = Call::Export {
            format: format.unwrap_or(self.config.format),
        };

        let result = match self.invoke(session.page(), &call).await {
            Ok(Reply::Exported {
                content: Value::String(s),
            }) => Ok(s),
            Ok(Reply::Exported { content }) => Ok(content.to_string()),
            Ok(Reply::Rejected { reason }) => Ok(reason),
            Ok(r) => Err(HostError::unexpected(r)),
            Err(e) => Err(e),
        };

        self.check(session, result).await
    }

    /// Whether a game is in progress for `key`.
    pub async fn is_active(&self, key: &ConversationKey) -> bool {
        self.registry.contains(key).await
    }

    /// The conversations with a game in progress.
    pub async fn list(&self) -> Vec<ConversationKey> {
        self.registry.list().await
    }

    /// Ends the game in progress for `key`, returning whether there was one.
    pub async fn end(&self, key: &ConversationKey) -> bool {
        self.registry.end(key).await
    }

    /// Ends every game, returning how many there were.
    pub async fn end_all(&self) -> usize {
        self.registry.end_all().await
    }

    /// The most recently captured frame.
    pub async fn last_frame(&self) -> Option<Frame> {
        self.last.lock().await.clone()
    }
}
