use super::cdp::{Request, Transport};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lib::host::{Call, HostError, Page, Reply};
use lib::session::RenderSize;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{instrument, warn};

const BRIDGE: &str = include_str!("../../assets/bridge.js");

const LOADED: &str = "new Promise(r => document.readyState === 'complete' \
    ? r() : window.addEventListener('load', () => r(), { once: true }))";

const BODY: &str = "(() => { const r = document.body.getBoundingClientRect(); \
    return { x: r.x, y: r.y, width: r.width, height: r.height } })()";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Evaluation {
    #[serde(default)]
    result: Option<RemoteObject>,
    exception_details: Option<ExceptionDetails>,
}

#[derive(Debug, Deserialize)]
struct RemoteObject {
    #[serde(default)]
    value: Value,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExceptionDetails {
    text: String,
    exception: Option<RemoteObject>,
}

#[derive(Debug, Deserialize)]
struct Clip {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// A browser tab attached over the DevTools protocol.
#[derive(Debug)]
pub struct Tab<T: Transport> {
    cdp: Arc<T>,
    target: String,
    session: String,
}

/// A target that was created but not yet handed out as a [`Tab`].
///
/// Closed in the background if dropped while still unclaimed.
struct Unclaimed<T: Transport + 'static> {
    cdp: Arc<T>,
    target: Option<String>,
}

impl<T: Transport + 'static> Unclaimed<T> {
    fn claim(mut self) -> Option<String> {
        self.target.take()
    }
}

impl<T: Transport + 'static> Drop for Unclaimed<T> {
    fn drop(&mut self) {
        let (Some(target), Ok(rt)) = (self.target.take(), Handle::try_current()) else {
            return;
        };

        let cdp = self.cdp.clone();
        rt.spawn(async move {
            let params = json!({ "targetId": target });
            if let Err(e) = cdp.request(Request::browser("Target.closeTarget", params)).await {
                warn!(error = %e, %target, "failed to close unclaimed target");
            }
        });
    }
}

impl<T: Transport + 'static> Tab<T> {
    /// Opens a blank tab and attaches to it.
    #[instrument(level = "debug", skip(cdp), err)]
    pub async fn open(cdp: Arc<T>) -> Result<Self, HostError> {
        let created = cdp
            .request(Request::browser(
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            ))
            .await?;

        let unclaimed = Unclaimed {
            cdp: cdp.clone(),
            target: Some(field(&created, "targetId")?),
        };

        let attached = cdp
            .request(Request::browser(
                "Target.attachToTarget",
                json!({ "targetId": unclaimed.target, "flatten": true }),
            ))
            .await?;

        let session = field(&attached, "sessionId")?;

        let target = unclaimed
            .claim()
            .ok_or_else(|| HostError::Protocol("target claimed twice".into()))?;

        Ok(Tab {
            cdp,
            target,
            session,
        })
    }
}

impl<T: Transport> Tab<T> {
    async fn send(&self, method: &'static str, params: Value) -> Result<Value, HostError> {
        self.cdp
            .request(Request::page(&self.session, method, params))
            .await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, HostError> {
        let params = json!({
            "expression": expression,
            "awaitPromise": true,
            "returnByValue": true,
        });

        let e: Evaluation = serde_json::from_value(self.send("Runtime.evaluate", params).await?)?;

        match (e.exception_details, e.result) {
            (Some(d), _) => {
                let description = d.exception.and_then(|o| o.description);
                Err(HostError::Script(description.unwrap_or(d.text)))
            }

            (None, Some(o)) => Ok(o.value),
            (None, None) => Ok(Value::Null),
        }
    }
}

fn field(value: &Value, name: &str) -> Result<String, HostError> {
    value[name]
        .as_str()
        .map(String::from)
        .ok_or_else(|| HostError::Protocol(format!("missing '{name}' in {value}")))
}

#[async_trait]
impl<T: Transport> Page for Tab<T> {
    #[instrument(level = "debug", skip(self), fields(target = %self.target), err)]
    async fn goto(&self, url: &str) -> Result<(), HostError> {
        let navigated = self.send("Page.navigate", json!({ "url": url })).await?;

        match navigated["errorText"].as_str() {
            Some(e) if !e.is_empty() => return Err(HostError::Navigation(e.to_string())),
            _ => {}
        }

        self.evaluate(LOADED).await?;
        self.evaluate(BRIDGE).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(target = %self.target), err)]
    async fn resize(&self, size: RenderSize) -> Result<(), HostError> {
        let params = json!({
            "width": size.width,
            "height": size.height,
            "deviceScaleFactor": 1,
            "mobile": false,
        });

        self.send("Emulation.setDeviceMetricsOverride", params).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(target = %self.target), err)]
    async fn call(&self, call: &Call) -> Result<Reply, HostError> {
        let expression = format!("window.bridge.dispatch({})", serde_json::to_string(call)?);
        Ok(serde_json::from_value(self.evaluate(&expression).await?)?)
    }

    #[instrument(level = "trace", skip(self), fields(target = %self.target), err)]
    async fn screenshot(&self) -> Result<Vec<u8>, HostError> {
        let clip: Clip = serde_json::from_value(self.evaluate(BODY).await?)?;

        let params = json!({
            "format": "png",
            "clip": {
                "x": clip.x,
                "y": clip.y,
                "width": clip.width,
                "height": clip.height,
                "scale": 1,
            },
        });

        let captured = self.send("Page.captureScreenshot", params).await?;

        STANDARD
            .decode(field(&captured, "data")?)
            .map_err(|e| HostError::Protocol(e.to_string()))
    }

    #[instrument(level = "debug", skip(self), fields(target = %self.target), err)]
    async fn close(&self) -> Result<(), HostError> {
        let params = json!({ "targetId": self.target });
        self.cdp
            .request(Request::browser("Target.closeTarget", params))
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::cdp::MockTransport;
    use lib::game::Variant;
    use mockall::predicate::eq;
    use test_strategy::proptest;
    use tokio::runtime;

    fn attached(t: &str, s: &str) -> MockTransport {
        let mut cdp = MockTransport::new();
        let (target, session) = (t.to_string(), s.to_string());

        cdp.expect_request()
            .once()
            .withf(|r| r.method == "Target.createTarget")
            .return_once(move |_| Ok(json!({ "targetId": target })));

        let target = t.to_string();
        cdp.expect_request()
            .once()
            .withf(move |r| {
                r.method == "Target.attachToTarget" && r.params["targetId"] == json!(target)
            })
            .return_once(move |_| Ok(json!({ "sessionId": session })));

        cdp
    }

    fn evaluated(value: Value) -> Value {
        json!({ "result": { "type": "object", "value": value } })
    }

    #[proptest]
    fn open_attaches_to_a_new_target(t: String, s: String) {
        let rt = runtime::Builder::new_current_thread().build()?;
        let tab = rt.block_on(Tab::open(Arc::new(attached(&t, &s))))?;
        assert_eq!((tab.target, tab.session), (t, s));
    }

    #[proptest]
    fn navigation_errors_are_reported(t: String, s: String, #[strategy(".+")] e: String) {
        let rt = runtime::Builder::new_current_thread().build()?;

        let mut cdp = attached(&t, &s);
        let error = e.clone();
        cdp.expect_request()
            .once()
            .withf(move |r| r.method == "Page.navigate" && r.session_id == Some(s.clone()))
            .return_once(move |_| Ok(json!({ "frameId": "f", "errorText": error })));

        let tab = rt.block_on(Tab::open(Arc::new(cdp)))?;

        assert!(matches!(
            rt.block_on(tab.goto("file:///index.html")),
            Err(HostError::Navigation(m)) if m == e
        ));
    }

    #[proptest]
    fn calls_are_dispatched_to_the_bridge(
        t: String,
        s: String,
        #[strategy(proptest::sample::select(Variant::ALL.to_vec()))] v: Variant,
    ) {
        let rt = runtime::Builder::new_current_thread().build()?;

        let call = Call::Start {
            position: String::new(),
            variant: v,
            skip_detection: true,
            zoom: 1.5,
        };

        let expression = format!("window.bridge.dispatch({})", serde_json::to_string(&call)?);

        let mut cdp = attached(&t, &s);
        cdp.expect_request()
            .once()
            .withf(move |r| {
                r.method == "Runtime.evaluate" && r.params["expression"] == json!(expression)
            })
            .return_once(|_| Ok(evaluated(json!({ "kind": "done" }))));

        let tab = rt.block_on(Tab::open(Arc::new(cdp)))?;
        assert_eq!(rt.block_on(tab.call(&call))?, Reply::Done);
    }

    #[proptest]
    fn exceptions_are_script_errors(t: String, s: String, d: String) {
        let rt = runtime::Builder::new_current_thread().build()?;

        let mut cdp = attached(&t, &s);
        let description = d.clone();
        cdp.expect_request()
            .once()
            .withf(|r| r.method == "Runtime.evaluate")
            .return_once(move |_| {
                Ok(json!({
                    "result": { "type": "object" },
                    "exceptionDetails": {
                        "text": "Uncaught",
                        "exception": { "type": "object", "description": description },
                    },
                }))
            });

        let tab = rt.block_on(Tab::open(Arc::new(cdp)))?;

        assert!(matches!(
            rt.block_on(tab.call(&Call::FullBoard)),
            Err(HostError::Script(m)) if m == d
        ));
    }

    #[proptest]
    fn screenshots_are_decoded(t: String, s: String, png: Vec<u8>) {
        let rt = runtime::Builder::new_current_thread().build()?;

        let mut cdp = attached(&t, &s);
        cdp.expect_request()
            .once()
            .withf(|r| r.method == "Runtime.evaluate")
            .return_once(|_| {
                Ok(evaluated(
                    json!({ "x": 0, "y": 0, "width": 1600, "height": 1200 }),
                ))
            });

        let data = STANDARD.encode(&png);
        cdp.expect_request()
            .once()
            .withf(|r| r.method == "Page.captureScreenshot" && r.params["clip"]["width"] == 1600.0)
            .return_once(move |_| Ok(json!({ "data": data })));

        let tab = rt.block_on(Tab::open(Arc::new(cdp)))?;
        assert_eq!(rt.block_on(tab.screenshot())?, png);
    }

    #[proptest]
    fn close_closes_the_target(t: String, s: String) {
        let rt = runtime::Builder::new_current_thread().build()?;

        let mut cdp = attached(&t, &s);
        cdp.expect_request()
            .once()
            .with(eq(Request::browser(
                "Target.closeTarget",
                json!({ "targetId": t }),
            )))
            .return_once(|_| Ok(json!({ "success": true })));

        let tab = rt.block_on(Tab::open(Arc::new(cdp)))?;
        rt.block_on(tab.close())?;
    }

    #[proptest]
    fn targets_that_fail_to_attach_are_closed(t: String, e: String) {
        let rt = runtime::Builder::new_current_thread().build()?;

        let mut cdp = MockTransport::new();
        let target = t.clone();
        cdp.expect_request()
            .once()
            .withf(|r| r.method == "Target.createTarget")
            .return_once(move |_| Ok(json!({ "targetId": target })));

        cdp.expect_request()
            .once()
            .withf(|r| r.method == "Target.attachToTarget")
            .return_once(move |_| Err(HostError::Protocol(e)));

        cdp.expect_request()
            .once()
            .with(eq(Request::browser(
                "Target.closeTarget",
                json!({ "targetId": t }),
            )))
            .return_once(|_| Ok(json!({ "success": true })));

        let opened = rt.block_on(async {
            let opened = Tab::open(Arc::new(cdp)).await;
            tokio::task::yield_now().await;
            opened
        });

        assert!(matches!(opened, Err(HostError::Protocol(_))));
    }
}
