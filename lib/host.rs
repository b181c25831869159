use crate::game::{ExportFormat, Variant};
use crate::session::RenderSize;
use async_trait::async_trait;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::{future::Future, io, time::Duration};
use tokio::time::timeout;

/// The reason why the render host failed.
#[derive(Debug, Display, Error)]
pub enum HostError {
    #[display(fmt = "the render host did not respond in time")]
    Timeout,

    #[display(fmt = "failed to navigate to the bootstrap document: {}", _0)]
    Navigation(#[error(not(source))] String),

    #[display(fmt = "the page raised an exception: {}", _0)]
    Script(#[error(not(source))] String),

    #[display(fmt = "unexpected message from the render host: {}", _0)]
    Protocol(#[error(not(source))] String),

    #[display(fmt = "the render host is unavailable: {}", _0)]
    Unavailable(#[error(not(source))] String),

    #[display(fmt = "the render host failed during IO")]
    Io(io::Error),
}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        HostError::Io(e)
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        HostError::Protocol(e.to_string())
    }
}

impl HostError {
    /// A reply the caller did not ask for.
    pub fn unexpected(reply: Reply) -> Self {
        HostError::Protocol(format!("{reply:?}"))
    }
}

/// Awaits a remote operation for at most `limit`.
pub async fn bounded<T, F>(limit: Duration, f: F) -> Result<T, HostError>
where
    F: Future<Output = Result<T, HostError>>,
{
    timeout(limit, f).await.map_err(|_| HostError::Timeout)?
}

/// A request to the bridge running inside a page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Call {
    /// Starts a fresh game and frames the present.
    Start {
        position: String,
        variant: Variant,
        skip_detection: bool,
        zoom: f64,
    },

    /// Plays and submits a move, then frames the present.
    Move { input: String, zoom: f64 },

    /// Frames the present timelines.
    Present { zoom: f64 },

    /// Frames the full board and replies with its extent.
    FullBoard,

    /// Recreates the renderer at the given size and frames the full board.
    Resize { width: u32, height: u32 },

    /// Exports the game.
    Export { format: ExportFormat },
}

/// A response from the bridge running inside a page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reply {
    /// The call completed and the camera has settled.
    Done,

    /// The rules engine refused the call.
    Rejected { reason: String },

    /// The size of the full board.
    Extent { width: u32, height: u32 },

    /// The exported game.
    Exported { content: serde_json::Value },
}

/// A browser page driven remotely.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Page: Send + Sync {
    /// Navigates to `url` and installs the bridge.
    async fn goto(&self, url: &str) -> Result<(), HostError>;

    /// Resizes the viewport.
    async fn resize(&self, size: RenderSize) -> Result<(), HostError>;

    /// Invokes the bridge and waits for it to settle.
    async fn call(&self, call: &Call) -> Result<Reply, HostError>;

    /// Captures the page body as PNG.
    async fn screenshot(&self) -> Result<Vec<u8>, HostError>;

    /// Closes the page.
    async fn close(&self) -> Result<(), HostError>;
}

/// A browser that hands out [`Page`]s.
#[cfg_attr(test, mockall::automock(type Page = MockPage;))]
#[async_trait]
pub trait Browser: Send + Sync {
    /// The pages this browser opens.
    type Page: Page + 'static;

    /// Opens a blank page.
    async fn open(&self) -> Result<Self::Page, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::future::pending;
    use test_strategy::proptest;
    use tokio::runtime;

    #[proptest]
    fn start_is_tagged_by_operation(p: String, v: Variant, s: bool) {
        let call = Call::Start {
            position: p.clone(),
            variant: v,
            skip_detection: s,
            zoom: 1.5,
        };

        assert_eq!(
            serde_json::to_value(&call)?,
            json!({ "op": "start", "position": p, "variant": v.to_string(), "skip_detection": s, "zoom": 1.5 })
        );
    }

    #[test]
    fn full_board_is_camel_cased() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_value(&Call::FullBoard)?, json!({ "op": "fullBoard" }));
        Ok(())
    }

    #[proptest]
    fn rejection_carries_reason(r: String) {
        let reply: Reply = serde_json::from_value(json!({ "kind": "rejected", "reason": r }))?;
        assert_eq!(reply, Reply::Rejected { reason: r });
    }

    #[proptest]
    fn extent_carries_dimensions(w: u32, h: u32) {
        let reply: Reply = serde_json::from_value(json!({ "kind": "extent", "width": w, "height": h }))?;
        assert_eq!(reply, Reply::Extent { width: w, height: h });
    }

    #[test]
    fn unknown_reply_is_a_protocol_error() {
        let e: HostError = serde_json::from_value::<Reply>(json!({ "kind": "?" }))
            .unwrap_err()
            .into();

        assert!(matches!(e, HostError::Protocol(_)));
    }

    #[test]
    fn bounded_times_out_stalled_operations() -> Result<(), io::Error> {
        let rt = runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()?;

        let result = rt.block_on(bounded(Duration::from_secs(1), pending::<Result<(), _>>()));
        assert!(matches!(result, Err(HostError::Timeout)));
        Ok(())
    }

    #[test]
    fn bounded_forwards_results() -> Result<(), io::Error> {
        let rt = runtime::Builder::new_current_thread().enable_time().build()?;
        let result = rt.block_on(bounded(Duration::from_secs(1), async { Ok(42) }));
        assert!(matches!(result, Ok(42)));
        Ok(())
    }
}
