use crate::{
    browser::{CdpLauncher, Endpoint},
    render::Dispatcher,
};
use clap::Args;
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Extra wait after HTML content goes idle, before the screenshot.
    pub settle_delay: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// Where the browser lives and how long to give it.
#[derive(Debug, Clone, Args)]
pub struct BrowserArgs {
    /// DevTools websocket URL of a running browser; a local Chromium is launched when unset
    #[arg(long = "browser-ws", env = "PAGECAP_BROWSER_WS")]
    pub browser_ws: Option<String>,

    /// Chromium executable to launch instead of the auto-detected one
    #[arg(long, env = "PAGECAP_CHROME")]
    pub chrome: Option<PathBuf>,

    /// Milliseconds to wait after HTML content has loaded before capturing
    #[arg(long = "settle-ms", env = "PAGECAP_SETTLE_MS", default_value_t = 2000)]
    pub settle_ms: u64,

    /// Milliseconds the network must stay quiet for a page to count as idle
    #[arg(long = "idle-ms", env = "PAGECAP_IDLE_MS", default_value_t = 500)]
    pub idle_ms: u64,

    /// Upper bound on navigation plus idle waiting, in milliseconds
    #[arg(long = "nav-timeout-ms", env = "PAGECAP_NAV_TIMEOUT_MS", default_value_t = 30_000)]
    pub nav_timeout_ms: u64,
}

impl BrowserArgs {
    pub fn endpoint(&self) -> Endpoint {
        match &self.browser_ws {
            Some(url) => Endpoint::Remote(url.clone()),
            None => Endpoint::Local(self.chrome.clone()),
        }
    }

    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            settle_delay: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        let launcher = CdpLauncher::new(
            self.endpoint(),
            Duration::from_millis(self.idle_ms),
            Duration::from_millis(self.nav_timeout_ms),
        );
        Dispatcher::new(Arc::new(launcher), self.render_config())
    }
}
