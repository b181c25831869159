use super::{ConversationKey, RenderSize, Session};
use crate::host::{bounded, Browser, HostError, Page};
use derive_more::{Display, Error, From};
use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};

/// The reason why a [`Session`] could not be created.
#[derive(Debug, Display, Error, From)]
pub enum CreateError {
    #[display(fmt = "a game is already in progress for '{}'", _0)]
    #[from(ignore)]
    Conflict(#[error(not(source))] ConversationKey),

    #[display(fmt = "{}", _0)]
    Host(HostError),
}

type Slot<P> = Arc<Mutex<Option<Session<P>>>>;

/// Exclusive access to an active [`Session`].
///
/// Other operations on the same conversation wait until the guard is dropped.
#[derive(Debug)]
pub struct SessionGuard<P> {
    slot: OwnedMutexGuard<Option<Session<P>>>,
}

impl<P> Deref for SessionGuard<P> {
    type Target = Session<P>;

    fn deref(&self) -> &Self::Target {
        match &*self.slot {
            Some(s) => s,
            None => unreachable!(),
        }
    }
}

impl<P> DerefMut for SessionGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut *self.slot {
            Some(s) => s,
            None => unreachable!(),
        }
    }
}

/// Maps conversations to the [`Session`] bound to them.
///
/// Holds at most one session per [`ConversationKey`] and is the sole owner of the pages.
pub struct Registry<B: Browser> {
    browser: B,
    bootstrap: String,
    size: RenderSize,
    timeout: Duration,
    slots: Mutex<HashMap<ConversationKey, Slot<B::Page>>>,
    active: Mutex<BTreeSet<ConversationKey>>,
}

impl<B: Browser> Registry<B> {
    /// Constructs an empty registry that opens pages of `size` on `browser`.
    ///
    /// New pages are navigated to `bootstrap` and every remote call is bounded by `timeout`.
    pub fn new(browser: B, bootstrap: String, size: RenderSize, timeout: Duration) -> Self {
        Registry {
            browser,
            bootstrap,
            size,
            timeout,
            slots: Mutex::new(HashMap::new()),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    async fn slot(&self, key: &ConversationKey) -> Option<Slot<B::Page>> {
        self.slots.lock().await.get(key).cloned()
    }

    async fn slots(&self) -> Vec<Slot<B::Page>> {
        self.slots.lock().await.values().cloned().collect()
    }

    /// Forgets slots that are empty and that nobody else is waiting on.
    async fn prune(&self) {
        self.slots.lock().await.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |s| s.is_some())
        });
    }

    async fn close(&self, session: Session<B::Page>) {
        self.active.lock().await.remove(session.key());
        session.close(self.timeout).await;
    }

    async fn open(&self) -> Result<B::Page, HostError> {
        let page = bounded(self.timeout, self.browser.open()).await?;

        let loaded = async {
            bounded(self.timeout, page.resize(self.size)).await?;
            bounded(self.timeout, page.goto(&self.bootstrap)).await
        };

        if let Err(e) = loaded.await {
            if let Err(c) = bounded(self.timeout, page.close()).await {
                info!(error = %c, "failed to close page that did not load");
            }

            return Err(e);
        }

        Ok(page)
    }

    /// Looks up the session bound to `key`.
    pub async fn resolve(&self, key: &ConversationKey) -> Option<SessionGuard<B::Page>> {
        let slot = self.slot(key).await?.lock_owned().await;
        slot.is_some().then_some(SessionGuard { slot })
    }

    /// Whether a session is bound to `key`.
    pub async fn contains(&self, key: &ConversationKey) -> bool {
        self.active.lock().await.contains(key)
    }

    /// Binds a new session to `key`.
    ///
    /// If a session is already bound to `key`, it is closed first when `replace` is set,
    /// otherwise [`CreateError::Conflict`] is returned and nothing changes.
    /// A page that fails to load is closed and leaves no session behind.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn create(
        &self,
        key: &ConversationKey,
        replace: bool,
    ) -> Result<SessionGuard<B::Page>, CreateError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key.clone()).or_default().clone()
        };

        let mut slot = slot.lock_owned().await;

        if slot.is_some() && !replace {
            return Err(CreateError::Conflict(key.clone()));
        }

        if let Some(s) = slot.take() {
            self.close(s).await;
        }

        match self.open().await {
            Ok(page) => {
                info!(%key, size = %self.size, "page opened");
                *slot = Some(Session::new(key.clone(), page, self.size));
                self.active.lock().await.insert(key.clone());
                Ok(SessionGuard { slot })
            }

            Err(e) => {
                drop(slot);
                self.prune().await;
                Err(e.into())
            }
        }
    }

    /// Closes the session held by `guard`.
    #[instrument(level = "debug", skip(self, guard), fields(key = %guard.key()))]
    pub async fn discard(&self, mut guard: SessionGuard<B::Page>) {
        if let Some(s) = guard.slot.take() {
            self.close(s).await;
        }

        drop(guard);
        self.prune().await;
    }

    /// Closes the session bound to `key`, if any.
    ///
    /// Returns whether there was one.
    #[instrument(level = "debug", skip(self), ret)]
    pub async fn end(&self, key: &ConversationKey) -> bool {
        match self.resolve(key).await {
            None => false,
            Some(guard) => {
                self.discard(guard).await;
                true
            }
        }
    }

    /// Closes every session.
    ///
    /// Returns how many there were.
    #[instrument(level = "debug", skip(self), ret)]
    pub async fn end_all(&self) -> usize {
        let mut count = 0;

        for slot in self.slots().await {
            let session = slot.lock().await.take();
            if let Some(s) = session {
                self.close(s).await;
                count += 1;
            }
        }

        self.prune().await;
        count
    }

    /// The conversations with an active session, in order.
    ///
    /// Never waits on operations in progress.
    pub async fn list(&self) -> Vec<ConversationKey> {
        self.active.lock().await.iter().cloned().collect()
    }

    /// The number of active sessions.
    pub async fn len(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Whether there are no active sessions.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
