use crate::host::{bounded, Page};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

mod registry;

pub use registry::*;

/// Identifies the conversation a game is bound to.
#[derive(Debug, Display, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, From)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct ConversationKey(#[from(forward)] String);

impl ConversationKey {
    /// The key for a message sent by `user`, optionally within `guild`.
    ///
    /// Group conversations are keyed by the group alone, so everyone in a group shares a game,
    /// whereas direct conversations are keyed by the user prefixed with `#`.
    pub fn new(guild: Option<&str>, user: &str) -> Self {
        match guild {
            Some(g) => ConversationKey(g.to_string()),
            None => ConversationKey(format!("#{user}")),
        }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The dimensions of the surface a game is rendered to.
#[derive(Debug, Display, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[display(fmt = "{}x{}", width, height)]
pub struct RenderSize {
    #[cfg_attr(test, strategy(1u32..=8192))]
    pub width: u32,
    #[cfg_attr(test, strategy(1u32..=8192))]
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        RenderSize { width, height }
    }

    /// The number of pixels.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Scales `self` to the largest size that fits within `bounds`, preserving the aspect ratio.
    pub fn fit(&self, bounds: RenderSize) -> RenderSize {
        let w = f64::from(self.width.max(1));
        let h = f64::from(self.height.max(1));
        let scale = f64::min(f64::from(bounds.width) / w, f64::from(bounds.height) / h);

        RenderSize {
            width: ((w * scale).floor() as u32).clamp(1, bounds.width.max(1)),
            height: ((h * scale).floor() as u32).clamp(1, bounds.height.max(1)),
        }
    }
}

impl Default for RenderSize {
    fn default() -> Self {
        RenderSize::new(1600, 1200)
    }
}

/// One game bound to one conversation.
///
/// A session exclusively owns its page, which is closed when the session is.
#[derive(Debug)]
pub struct Session<P> {
    key: ConversationKey,
    page: P,
    size: RenderSize,
}

impl<P: Page> Session<P> {
    pub fn new(key: ConversationKey, page: P, size: RenderSize) -> Self {
        Session { key, page, size }
    }

    /// The conversation this session is bound to.
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The page this session renders to.
    pub fn page(&self) -> &P {
        &self.page
    }

    /// The last known size of the render surface.
    pub fn render_size(&self) -> RenderSize {
        self.size
    }

    /// Records a new size for the render surface.
    pub fn resize(&mut self, size: RenderSize) {
        self.size = size;
    }

    /// Closes the page, consuming the session.
    ///
    /// Gives up after `limit`. Failures are logged and otherwise ignored.
    #[instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub async fn close(self, limit: Duration) {
        match bounded(limit, self.page.close()).await {
            Ok(()) => info!("page closed"),
            Err(e) => warn!(error = %e, "failed to close page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Call, HostError, MockPage, Reply};
    use std::future::pending;
    use test_strategy::proptest;
    use tokio::{runtime, time::timeout};

    const LIMIT: Duration = Duration::from_secs(1);

    #[proptest]
    fn group_conversations_are_keyed_by_group(g: String, u: String) {
        assert_eq!(ConversationKey::new(Some(&g), &u).as_str(), g);
    }

    #[proptest]
    fn direct_conversations_are_keyed_by_prefixed_user(u: String) {
        assert_eq!(ConversationKey::new(None, &u).to_string(), format!("#{u}"));
    }

    #[proptest]
    fn fitted_size_is_within_bounds(s: RenderSize, b: RenderSize) {
        let f = s.fit(b);
        assert!(f.width <= b.width);
        assert!(f.height <= b.height);
        assert!(f.width >= 1 && f.height >= 1);
    }

    #[test]
    fn fitting_preserves_aspect_ratio() {
        let s = RenderSize::new(800, 400).fit(RenderSize::new(4000, 3000));
        assert_eq!(s, RenderSize::new(4000, 2000));
    }

    #[test]
    fn default_render_size_is_1600_by_1200() {
        assert_eq!(RenderSize::default().area(), 1600 * 1200);
    }

    #[proptest]
    fn resize_updates_render_size(k: ConversationKey, a: RenderSize, b: RenderSize) {
        let mut s = Session::new(k, MockPage::new(), a);
        s.resize(b);
        assert_eq!(s.render_size(), b);
    }

    #[proptest]
    fn close_closes_the_page_once(k: ConversationKey, s: RenderSize) {
        let rt = runtime::Builder::new_multi_thread().enable_time().build()?;

        let mut page = MockPage::new();
        page.expect_close().once().returning(|| Ok(()));

        rt.block_on(Session::new(k, page, s).close(LIMIT));
    }

    #[proptest]
    fn close_swallows_failures(k: ConversationKey, s: RenderSize) {
        let rt = runtime::Builder::new_multi_thread().enable_time().build()?;

        let mut page = MockPage::new();
        page.expect_close()
            .once()
            .returning(|| Err(HostError::Unavailable("gone".into())));

        rt.block_on(Session::new(k, page, s).close(LIMIT));
    }

    #[derive(Debug)]
    struct Stalled;

    #[async_trait::async_trait]
    impl Page for Stalled {
        async fn goto(&self, _: &str) -> Result<(), HostError> {
            pending().await
        }

        async fn resize(&self, _: RenderSize) -> Result<(), HostError> {
            pending().await
        }

        async fn call(&self, _: &Call) -> Result<Reply, HostError> {
            pending().await
        }

        async fn screenshot(&self) -> Result<Vec<u8>, HostError> {
            pending().await
        }

        async fn close(&self) -> Result<(), HostError> {
            pending().await
        }
    }

    #[proptest]
    fn close_gives_up_on_stalled_pages(k: ConversationKey, s: RenderSize) {
        let rt = runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()?;

        let closing = Session::new(k, Stalled, s).close(LIMIT);
        assert!(rt.block_on(async { timeout(LIMIT * 2, closing).await }).is_ok());
    }
}
