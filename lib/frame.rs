use crate::host::{bounded, HostError, Page};
use crate::session::RenderSize;
use derive_more::{Deref, Display};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// A PNG image captured from a page.
#[derive(Debug, Display, Clone, Eq, PartialEq, Deref)]
#[display(fmt = "Frame({} bytes)", "png.len()")]
pub struct Frame {
    #[deref]
    png: Vec<u8>,
    retries: usize,
}

impl Frame {
    /// How many captures were discarded before this one.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// The encoded image.
    pub fn into_png(self) -> Vec<u8> {
        self.png
    }
}

/// Policy for capturing a [`Frame`] once the page has settled.
///
/// Screenshots taken right after the page has changed may come out blank or partially rendered,
/// which shows as an unusually small PNG. Captures below a threshold are therefore retried
/// after a backoff, at most a bounded number of times.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Capture {
    /// Minimum encoded bytes per pixel of render surface.
    pub bytes_per_pixel: f64,

    /// Minimum encoded bytes regardless of render size.
    pub min_bytes: usize,

    /// How long to wait between captures.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,

    /// How many captures to discard before giving up and keeping the last one.
    pub retries: usize,
}

impl Default for Capture {
    fn default() -> Self {
        Capture {
            bytes_per_pixel: 0.01,
            min_bytes: 10000,
            backoff: Duration::from_millis(500),
            retries: 20,
        }
    }
}

impl Capture {
    /// The smallest capture considered complete for a surface of the given size.
    pub fn threshold(&self, size: Option<RenderSize>) -> usize {
        match size {
            None => self.min_bytes,
            Some(s) => {
                let scaled = (s.area() as f64 * self.bytes_per_pixel).ceil() as usize;
                scaled.max(self.min_bytes)
            }
        }
    }

    /// Captures `page` until the screenshot meets the [threshold](Self::threshold).
    ///
    /// Each screenshot is bounded by `limit`.
    #[instrument(level = "debug", skip(self, page), ret(Display), err)]
    pub async fn settle<P: Page + ?Sized>(
        &self,
        page: &P,
        size: Option<RenderSize>,
        limit: Duration,
    ) -> Result<Frame, HostError> {
        let threshold = self.threshold(size);
        let mut retries = 0;

        loop {
            let png = bounded(limit, page.screenshot()).await?;

            if png.len() >= threshold {
                break Ok(Frame { png, retries });
            } else if retries >= self.retries {
                warn!(bytes = png.len(), threshold, retries, "page never settled");
                break Ok(Frame { png, retries });
            }

            debug!(bytes = png.len(), threshold, "discarding incomplete capture");
            retries += 1;
            sleep(self.backoff).await;
        }
    }
}
