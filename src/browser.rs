//! Browser capability used by the dispatcher, and its CDP implementation.
//!
//! The dispatcher only sees the `Launcher`, `Browser` and `Page` traits. The
//! CDP backend either attaches to a remote browser through its DevTools
//! websocket or launches a local Chromium for every request.

use crate::payload::Viewport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::{
    cdp::browser_protocol::{
        dom::Rect,
        emulation::{ClearDeviceMetricsOverrideParams, SetDeviceMetricsOverrideParams},
        network::{EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent},
        page::{
            CaptureScreenshotFormat, CaptureScreenshotParams, PrintToPdfParams, Viewport as Clip,
        },
    },
    BrowserConfig,
};
use futures::{stream, Stream, StreamExt};
use std::{collections::HashSet, path::PathBuf, pin::Pin, time::Duration};
use tokio::{task::JoinHandle, time::Instant};

/// How quiet the network has to be before a page counts as loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// No requests in flight.
    NetworkIdle0,
    /// At most two requests in flight.
    NetworkIdle2,
}

impl WaitUntil {
    pub fn max_inflight(self) -> usize {
        match self {
            WaitUntil::NetworkIdle0 => 0,
            WaitUntil::NetworkIdle2 => 2,
        }
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Browser>>;
}

#[async_trait]
pub trait Browser: Send {
    async fn new_page(&mut self) -> Result<Box<dyn Page>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Page: Send {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()>;

    async fn set_content(&mut self, html: &str, wait: WaitUntil) -> Result<()>;

    async fn goto(&mut self, url: &str, wait: WaitUntil) -> Result<()>;

    /// Captures a PNG of the viewport, or of the whole document when `full_page` is set.
    async fn screenshot(&mut self, full_page: bool) -> Result<Vec<u8>>;

    async fn pdf(&mut self, print_background: bool) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    /// DevTools websocket of an already running browser.
    Remote(String),
    /// Spawn a local Chromium, optionally from an explicit executable.
    Local(Option<PathBuf>),
}

#[derive(Debug, Clone)]
pub struct CdpLauncher {
    endpoint: Endpoint,
    idle: Duration,
    nav_timeout: Duration,
}

impl CdpLauncher {
    pub fn new(endpoint: Endpoint, idle: Duration, nav_timeout: Duration) -> Self {
        Self {
            endpoint,
            idle,
            nav_timeout,
        }
    }
}

#[async_trait]
impl Launcher for CdpLauncher {
    async fn launch(&self) -> Result<Box<dyn Browser>> {
        let (inner, mut handler) = match &self.endpoint {
            Endpoint::Remote(url) => chromiumoxide::Browser::connect(url.clone())
                .await
                .with_context(|| format!("failed to connect to browser at {}", url))?,
            Endpoint::Local(executable) => {
                let mut builder = BrowserConfig::builder();
                if let Some(path) = executable {
                    builder = builder.chrome_executable(path);
                }
                let config = builder.build().map_err(anyhow::Error::msg)?;
                chromiumoxide::Browser::launch(config)
                    .await
                    .context("failed to launch browser")?
            }
        };

        // The connection only makes progress while its handler is polled.
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    tracing::debug!("browser connection: {}", err);
                }
            }
        });

        Ok(Box::new(CdpBrowser {
            inner,
            events,
            owned: matches!(self.endpoint, Endpoint::Local(_)),
            idle: self.idle,
            nav_timeout: self.nav_timeout,
        }))
    }
}

struct CdpBrowser {
    inner: chromiumoxide::Browser,
    events: JoinHandle<()>,
    owned: bool,
    idle: Duration,
    nav_timeout: Duration,
}

#[async_trait]
impl Browser for CdpBrowser {
    async fn new_page(&mut self) -> Result<Box<dyn Page>> {
        let page = self
            .inner
            .new_page("about:blank")
            .await
            .context("failed to open page")?;

        Ok(Box::new(CdpPage {
            page,
            viewport: None,
            idle: self.idle,
            nav_timeout: self.nav_timeout,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        // A remote browser is shared with other clients; only drop our connection to it.
        let result = if self.owned {
            self.inner
                .close()
                .await
                .context("failed to close browser")
                .map(drop)
        } else {
            Ok(())
        };

        if self.owned {
            if let Err(err) = self.inner.wait().await {
                tracing::warn!("browser process did not exit cleanly: {}", err);
            }
        }

        self.events.abort();
        result
    }
}

enum Traffic {
    Started(String),
    Done(String),
}

type TrafficStream = Pin<Box<dyn Stream<Item = Traffic> + Send>>;

struct CdpPage {
    page: chromiumoxide::Page,
    /// Last override applied through `set_viewport`, restored after full-page capture.
    viewport: Option<Viewport>,
    idle: Duration,
    nav_timeout: Duration,
}

impl CdpPage {
    async fn traffic(&self) -> Result<TrafficStream> {
        let started = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await?
            .map(|event| Traffic::Started(event.request_id.inner().clone()));
        let finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await?
            .map(|event| Traffic::Done(event.request_id.inner().clone()));
        let failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await?
            .map(|event| Traffic::Done(event.request_id.inner().clone()));

        Ok(Box::pin(stream::select(
            started,
            stream::select(finished, failed),
        )))
    }

    async fn wait_for_idle(&self, traffic: TrafficStream, wait: WaitUntil) {
        if !settle(traffic, wait, self.idle, self.nav_timeout).await {
            tracing::warn!(
                "network did not settle within {:?}, capturing anyway",
                self.nav_timeout
            );
        }
    }

    fn scale(&self) -> f64 {
        self.viewport.map_or(1.0, |viewport| viewport.device_scale_factor)
    }

    async fn capture(&self, params: CaptureScreenshotParams) -> Result<Vec<u8>> {
        let shot = self.page.execute(params).await?.result;
        let data: &str = shot.data.as_ref();
        Ok(base64::decode(data)?)
    }

    async fn capture_full_page(&self) -> Result<Vec<u8>> {
        let metrics = self.page.layout_metrics().await?;
        let (metrics, params) = full_page_capture(&metrics.css_content_size, self.scale());
        self.page.execute(metrics).await?;

        let shot = self.capture(params).await;

        match self.viewport {
            Some(viewport) => {
                self.page.execute(device_metrics(viewport)).await?;
            }
            None => {
                self.page.execute(ClearDeviceMetricsOverrideParams {}).await?;
            }
        }
        shot
    }
}

fn device_metrics(viewport: Viewport) -> SetDeviceMetricsOverrideParams {
    SetDeviceMetricsOverrideParams::new(
        i64::from(viewport.width),
        i64::from(viewport.height),
        viewport.device_scale_factor,
        false,
    )
}

/// Sizes the viewport to the whole document at `scale` and clips the capture to it.
fn full_page_capture(
    content: &Rect,
    scale: f64,
) -> (SetDeviceMetricsOverrideParams, CaptureScreenshotParams) {
    let metrics = SetDeviceMetricsOverrideParams::new(
        content.width.ceil() as i64,
        content.height.ceil() as i64,
        scale,
        false,
    );
    let capture = CaptureScreenshotParams {
        format: Some(CaptureScreenshotFormat::Png),
        clip: Some(Clip {
            x: 0.,
            y: 0.,
            width: content.width,
            height: content.height,
            scale: 1.,
        }),
        capture_beyond_viewport: Some(true),
        ..Default::default()
    };
    (metrics, capture)
}

/// Follows request traffic until the in-flight count has stayed within
/// `wait`'s bound for the `idle` window. Returns false if `timeout` ran out first.
async fn settle(
    mut traffic: TrafficStream,
    wait: WaitUntil,
    idle: Duration,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut inflight = HashSet::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }

        let quiet = inflight.len() <= wait.max_inflight();
        let window = if quiet { idle.min(remaining) } else { remaining };

        match tokio::time::timeout(window, traffic.next()).await {
            Err(_) => return quiet,
            Ok(Some(Traffic::Started(id))) => {
                inflight.insert(id);
            }
            Ok(Some(Traffic::Done(id))) => {
                inflight.remove(&id);
            }
            Ok(None) => return true,
        }
    }
}

#[async_trait]
impl Page for CdpPage {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.page
            .execute(device_metrics(viewport))
            .await
            .context("failed to set viewport")?;
        self.viewport = Some(viewport);
        Ok(())
    }

    async fn set_content(&mut self, html: &str, wait: WaitUntil) -> Result<()> {
        let traffic = self.traffic().await?;
        self.page
            .set_content(html)
            .await
            .context("failed to set page content")?;
        self.wait_for_idle(traffic, wait).await;
        Ok(())
    }

    async fn goto(&mut self, url: &str, wait: WaitUntil) -> Result<()> {
        let traffic = self.traffic().await?;
        tokio::time::timeout(self.nav_timeout, self.page.goto(url))
            .await
            .with_context(|| format!("navigation to {} timed out", url))?
            .with_context(|| format!("failed to navigate to {}", url))?;
        self.wait_for_idle(traffic, wait).await;
        Ok(())
    }

    async fn screenshot(&mut self, full_page: bool) -> Result<Vec<u8>> {
        self.page.activate().await?;
        let shot = if full_page {
            self.capture_full_page().await
        } else {
            let params = CaptureScreenshotParams {
                format: Some(CaptureScreenshotFormat::Png),
                ..Default::default()
            };
            self.capture(params).await
        };
        shot.context("failed to capture screenshot")
    }

    async fn pdf(&mut self, print_background: bool) -> Result<Vec<u8>> {
        let params = PrintToPdfParams {
            print_background: Some(print_background),
            ..Default::default()
        };
        self.page.pdf(params).await.context("failed to print pdf")
    }

    async fn close(&mut self) -> Result<()> {
        self.page
            .clone()
            .close()
            .await
            .context("failed to close page")
    }
}
