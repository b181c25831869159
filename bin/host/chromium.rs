use super::cdp::{Connection, Request, Transport};
use super::tab::Tab;
use anyhow::{bail, Context, Error as Anyhow};
use async_trait::async_trait;
use lib::host::{bounded, Browser, HostError};
use serde_json::json;
use std::{io, process::Stdio, sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::{sync::Mutex, time::timeout};
use tracing::{error, info, instrument, trace, warn};

/// How long Chromium is given to exit on its own.
const GRACE: Duration = Duration::from_secs(5);

#[async_trait]
#[cfg_attr(test, mockall::automock)]
trait Child: Send {
    async fn wait(&mut self) -> io::Result<String>;
    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
impl Child for tokio::process::Child {
    async fn wait(&mut self) -> io::Result<String> {
        Ok(tokio::process::Child::wait(self).await?.to_string())
    }

    async fn kill(&mut self) -> io::Result<()> {
        tokio::process::Child::kill(self).await
    }
}

/// Waits for `child` to exit, killing it if it takes longer than `grace`.
async fn terminate<C: Child + ?Sized>(child: &mut C, grace: Duration) -> Result<String, Anyhow> {
    match timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            child.kill().await?;
            bail!(
                "timed out after {}s waiting for the browser to exit",
                grace.as_secs()
            );
        }
    }
}

/// Extracts the DevTools endpoint from a line Chromium prints to stderr on startup.
fn devtools_url(line: &str) -> Option<&str> {
    let url = line.trim().strip_prefix("DevTools listening on ")?;
    url.starts_with("ws://").then_some(url)
}

struct Inner {
    cdp: Arc<Connection>,
    child: Mutex<tokio::process::Child>,
    _profile: TempDir,
}

/// A headless Chromium process driven over the DevTools protocol.
#[derive(Clone)]
pub struct Chromium {
    inner: Arc<Inner>,
}

impl Chromium {
    /// Launches `program` headless with a throwaway profile.
    ///
    /// Startup, as well as every page opened later, is bounded by `limit`.
    #[instrument(level = "debug", err)]
    pub async fn launch(program: &str, limit: Duration) -> Result<Self, Anyhow> {
        let profile = tempfile::tempdir().context("failed to create a browser profile")?;

        let mut child = Command::new(program)
            .arg("--headless=new")
            .arg("--remote-debugging-port=0")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--hide-scrollbars")
            .arg("--allow-file-access-from-files")
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn '{program}'"))?;

        let stderr = child
            .stderr
            .take()
            .context("failed to open the browser's stderr")?;

        let mut lines = BufReader::new(stderr).lines();

        let url = timeout(limit, async {
            while let Some(line) = lines.next_line().await? {
                trace!(%line);
                if let Some(url) = devtools_url(&line) {
                    return Ok(url.to_string());
                }
            }

            Err(io::Error::from(io::ErrorKind::UnexpectedEof))
        })
        .await
        .context("timed out waiting for the DevTools endpoint")?
        .context("the browser exited before announcing its DevTools endpoint")?;

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(%line);
            }
        });

        let cdp = Connection::connect(&url).await?;
        info!(%url, "browser launched");

        Ok(Chromium {
            inner: Arc::new(Inner {
                cdp: Arc::new(cdp),
                child: Mutex::new(child),
                _profile: profile,
            }),
        })
    }

    /// Asks the browser to close, killing it if it does not exit in time.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn shutdown(&self) -> Result<(), Anyhow> {
        let close = Request::browser("Browser.close", json!({}));
        if let Err(e) = bounded(GRACE, self.inner.cdp.request(close)).await {
            warn!(error = %e, "browser did not acknowledge close");
        }

        let mut child = self.inner.child.lock().await;
        match terminate(&mut *child, GRACE).await {
            Ok(status) => info!(%status, "browser exited"),
            Err(e) => error!("{:?}", e),
        }

        Ok(())
    }
}

#[async_trait]
impl Browser for Chromium {
    type Page = Tab<Connection>;

    async fn open(&self) -> Result<Self::Page, HostError> {
        Tab::open(self.inner.cdp.clone()).await
    }
}
