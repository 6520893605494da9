use crate::{
    browser::{Browser, Launcher, Page, WaitUntil},
    config::RenderConfig,
    error::Error,
    lambda::LambdaResponse,
    payload::{Mode, RenderRequest},
};
use std::sync::Arc;

/// Turns render requests into envelopes, one browser session per request.
pub struct Dispatcher {
    launcher: Arc<dyn Launcher>,
    config: RenderConfig,
}

impl Dispatcher {
    pub fn new(launcher: Arc<dyn Launcher>, config: RenderConfig) -> Self {
        Self { launcher, config }
    }

    pub async fn dispatch(&self, request: &RenderRequest) -> Result<LambdaResponse, Error> {
        let mode = request.mode().ok_or(Error::NoValidPayload)?;

        if request.source_count() > 1 {
            tracing::warn!(
                mode = mode.name(),
                "payload names more than one source, using the first"
            );
        }
        tracing::info!(mode = mode.name(), "rendering");

        let bytes = self.capture(&mode).await.map_err(|err| {
            tracing::error!(mode = mode.name(), "render failed: {:#}", err);
            Error::Render(format!("{:#}", err))
        })?;

        tracing::debug!(mode = mode.name(), bytes = bytes.len(), "rendered");
        Ok(LambdaResponse::encoded(&mode.content_type(), &bytes))
    }

    async fn capture(&self, mode: &Mode<'_>) -> anyhow::Result<Vec<u8>> {
        let mut browser = self.launcher.launch().await?;
        let result = self.capture_in(browser.as_mut(), mode).await;

        if let Err(err) = browser.close().await {
            tracing::warn!("failed to release browser: {:#}", err);
        }
        result
    }

    async fn capture_in(&self, browser: &mut dyn Browser, mode: &Mode<'_>) -> anyhow::Result<Vec<u8>> {
        let mut page = browser.new_page().await?;
        let result = self.drive(page.as_mut(), mode).await;

        if let Err(err) = page.close().await {
            tracing::warn!("failed to release page: {:#}", err);
        }
        result
    }

    async fn drive(&self, page: &mut dyn Page, mode: &Mode<'_>) -> anyhow::Result<Vec<u8>> {
        match *mode {
            Mode::Html {
                html,
                viewport,
                full_page,
            } => {
                if let Some(viewport) = viewport {
                    page.set_viewport(viewport).await?;
                }
                page.set_content(html, WaitUntil::NetworkIdle2).await?;

                // Script-driven content (charts and the like) keeps painting after load.
                tokio::time::sleep(self.config.settle_delay).await;

                page.screenshot(full_page).await
            }
            Mode::Url { url, viewport } => {
                page.set_viewport(viewport).await?;
                page.goto(url, WaitUntil::NetworkIdle0).await?;
                page.screenshot(true).await
            }
            Mode::Pdf { url } => {
                page.goto(url, WaitUntil::NetworkIdle0).await?;
                page.pdf(true).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        browser::fake::{Call, FailAt, FakeLauncher, PNG_SIGNATURE},
        payload::Viewport,
    };
    use std::time::Duration;
    use tokio::time::Instant;

    fn dispatcher(launcher: &FakeLauncher) -> Dispatcher {
        Dispatcher::new(
            Arc::new(launcher.clone()),
            RenderConfig {
                settle_delay: Duration::from_secs(2),
            },
        )
    }

    fn request(json: &str) -> RenderRequest {
        serde_json::from_str(json).unwrap()
    }

    fn decode(response: &LambdaResponse) -> Vec<u8> {
        response.decode_body().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn html_full_page() {
        let launcher = FakeLauncher::default();
        let response = dispatcher(&launcher)
            .dispatch(&request(r#"{"html": "<h1>hi</h1>"}"#))
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.content_type(), Some("image/png"));
        assert!(response.is_base64_encoded);
        assert!(decode(&response).starts_with(PNG_SIGNATURE));
        assert_eq!(
            launcher.calls(),
            vec![
                Call::Launch,
                Call::NewPage,
                Call::SetContent("<h1>hi</h1>".into(), WaitUntil::NetworkIdle2),
                Call::Screenshot {
                    full_page: true,
                    scale: 1.0,
                },
                Call::ClosePage,
                Call::CloseBrowser,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_page_output_follows_content() {
        let launcher = FakeLauncher::default();
        let dispatcher = dispatcher(&launcher);

        let short = dispatcher
            .dispatch(&request(r#"{"html": "<p>a</p>"}"#))
            .await
            .unwrap();
        let tall = dispatcher
            .dispatch(&request(r#"{"html": "<div style='height: 2000px'><p>a</p></div>"}"#))
            .await
            .unwrap();

        assert!(decode(&tall).len() > decode(&short).len());
    }

    #[tokio::test(start_paused = true)]
    async fn html_viewport_capture() {
        let launcher = FakeLauncher::default();
        let dispatcher = dispatcher(&launcher);

        let viewport = dispatcher
            .dispatch(&request(
                r#"{"html": "<p>a</p>", "width": 800, "height": 600, "qualityFactor": 2}"#,
            ))
            .await
            .unwrap();
        let calls = launcher.calls();
        assert!(calls.contains(&Call::SetViewport(Viewport {
            width: 800,
            height: 600,
            device_scale_factor: 2.0,
        })));
        assert!(calls.contains(&Call::Screenshot {
            full_page: false,
            scale: 2.0,
        }));

        let full = dispatcher
            .dispatch(&request(r#"{"html": "<p>a</p>"}"#))
            .await
            .unwrap();
        assert_ne!(decode(&viewport).len(), decode(&full).len());
    }

    #[tokio::test(start_paused = true)]
    async fn quality_factor_applies_to_full_page_capture() {
        let launcher = FakeLauncher::default();
        let dispatcher = dispatcher(&launcher);

        let sharp = dispatcher
            .dispatch(&request(r#"{"html": "<p>a</p>", "qualityFactor": 2}"#))
            .await
            .unwrap();
        assert_eq!(
            launcher.calls()[2..5],
            [
                Call::SetViewport(Viewport {
                    width: 0,
                    height: 0,
                    device_scale_factor: 2.0,
                }),
                Call::SetContent("<p>a</p>".into(), WaitUntil::NetworkIdle2),
                Call::Screenshot {
                    full_page: true,
                    scale: 2.0,
                },
            ]
        );

        let plain = dispatcher
            .dispatch(&request(r#"{"html": "<p>a</p>"}"#))
            .await
            .unwrap();
        assert!(decode(&sharp).len() > decode(&plain).len());
    }

    #[tokio::test(start_paused = true)]
    async fn html_waits_for_settle_delay() {
        let launcher = FakeLauncher::default();
        let start = Instant::now();
        dispatcher(&launcher)
            .dispatch(&request(r#"{"html": "<p>a</p>"}"#))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn url_screenshot() {
        let launcher = FakeLauncher::default();
        let response = dispatcher(&launcher)
            .dispatch(&request(r#"{"url": "https://example.com"}"#))
            .await
            .unwrap();

        assert_eq!(response.content_type(), Some("image/png"));
        assert_eq!(
            launcher.calls(),
            vec![
                Call::Launch,
                Call::NewPage,
                Call::SetViewport(Viewport {
                    width: 1280,
                    height: 0,
                    device_scale_factor: 1.0,
                }),
                Call::Goto("https://example.com".into(), WaitUntil::NetworkIdle0),
                Call::Screenshot {
                    full_page: true,
                    scale: 1.0,
                },
                Call::ClosePage,
                Call::CloseBrowser,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn url_mode_skips_settle_delay() {
        let launcher = FakeLauncher::default();
        let start = Instant::now();
        dispatcher(&launcher)
            .dispatch(&request(r#"{"url": "https://example.com", "width": 640}"#))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pdf_with_background() {
        let launcher = FakeLauncher::default();
        let response = dispatcher(&launcher)
            .dispatch(&request(r#"{"pdfURL": "https://example.com"}"#))
            .await
            .unwrap();

        assert_eq!(response.content_type(), Some("application/pdf"));
        assert!(decode(&response).starts_with(b"%PDF"));
        assert_eq!(
            launcher.calls(),
            vec![
                Call::Launch,
                Call::NewPage,
                Call::Goto("https://example.com".into(), WaitUntil::NetworkIdle0),
                Call::Pdf {
                    print_background: true
                },
                Call::ClosePage,
                Call::CloseBrowser,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_source_is_rejected_without_a_browser() {
        let launcher = FakeLauncher::default();
        let err = dispatcher(&launcher)
            .dispatch(&request(r#"{"invalid": "payload"}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoValidPayload));
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_is_a_render_error() {
        let launcher = FakeLauncher::failing(FailAt::Launch);
        let err = dispatcher(&launcher)
            .dispatch(&request(r#"{"url": "https://example.com"}"#))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Error: simulated Launch failure");
        assert_eq!(launcher.calls(), vec![Call::Launch]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_still_release_resources() {
        for step in [FailAt::NewPage, FailAt::Load, FailAt::Capture] {
            let launcher = FakeLauncher::failing(step);
            let err = dispatcher(&launcher)
                .dispatch(&request(r#"{"pdfURL": "https://example.com"}"#))
                .await
                .unwrap_err();

            assert!(matches!(err, Error::Render(_)));
            let calls = launcher.calls();
            assert_eq!(calls.last(), Some(&Call::CloseBrowser), "{:?}", step);
            if step != FailAt::NewPage {
                assert!(calls.contains(&Call::ClosePage), "{:?}", step);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_requests_are_independent() {
        let launcher = FakeLauncher::default();
        let dispatcher = dispatcher(&launcher);
        let request = request(r#"{"url": "https://example.com", "width": 1280}"#);

        let first = dispatcher.dispatch(&request).await.unwrap();
        let second = dispatcher.dispatch(&request).await.unwrap();

        assert_eq!(first.content_type(), second.content_type());
        assert_eq!(first.is_base64_encoded, second.is_base64_encoded);
        let launches = launcher
            .calls()
            .into_iter()
            .filter(|call| *call == Call::Launch)
            .count();
        assert_eq!(launches, 2);
    }
}
