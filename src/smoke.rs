//! Fixed request suite run against a live gateway.

use crate::lambda::LambdaResponse;
use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::Args;
use hyper::{
    body::Bytes, client::HttpConnector, header::CONTENT_TYPE, Body, Client, Method, Request,
    StatusCode, Uri,
};
use serde_json::{json, Value};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Args)]
pub struct SmokeArgs {
    /// Gateway to exercise
    #[arg(long, default_value = "http://localhost:8787")]
    pub target: Uri,

    /// Directory the decoded outputs are written to
    #[arg(long = "out-dir", default_value = ".")]
    pub out_dir: PathBuf,
}

struct Case {
    name: &'static str,
    payload: Value,
    content_type: &'static str,
    output: &'static str,
}

fn cases() -> Vec<Case> {
    vec![
        Case {
            name: "HTML to Image",
            payload: json!({
                "html": "<html><body style=\"font-family: Arial; padding: 20px; background: linear-gradient(45deg, #ff6b6b, #4ecdc4);\"><h1 style=\"color: white; text-align: center;\">Hello from pagecap!</h1><p style=\"color: white; text-align: center;\">This is a test HTML to image conversion</p></body></html>",
                "width": 800,
                "height": 600,
                "qualityFactor": 2
            }),
            content_type: "image/png",
            output: "test-html-output.png",
        },
        Case {
            name: "HTML to Image (Full Page)",
            payload: json!({
                "html": "<html><body style=\"font-family: Arial; padding: 20px;\"><h1>Full Page Test</h1><div style=\"height: 2000px; background: linear-gradient(to bottom, red, blue);\"><p>This is a very tall page to test full page capture</p></div></body></html>"
            }),
            content_type: "image/png",
            output: "test-html-fullpage.png",
        },
        Case {
            name: "URL Screenshot",
            payload: json!({ "url": "https://example.com", "width": 1280 }),
            content_type: "image/png",
            output: "test-url-output.png",
        },
        Case {
            name: "PDF Generation",
            payload: json!({ "pdfURL": "https://example.com" }),
            content_type: "application/pdf",
            output: "test-pdf-output.pdf",
        },
    ]
}

fn signature(content_type: &str) -> &'static [u8] {
    match content_type {
        "application/pdf" => b"%PDF",
        _ => b"\x89PNG",
    }
}

/// Validates a gateway reply and returns the decoded document.
fn check(status: StatusCode, body: &[u8], content_type: &str) -> Result<Vec<u8>> {
    if !status.is_success() {
        bail!("HTTP {}: {}", status, String::from_utf8_lossy(body));
    }

    let envelope: LambdaResponse =
        serde_json::from_slice(body).context("response is not an envelope")?;

    ensure!(
        envelope.status_code == 200,
        "wrong status code: {}",
        envelope.status_code
    );
    ensure!(
        envelope.headers.get("Content-Type").map(String::as_str) == Some(content_type),
        "wrong content type: {:?}",
        envelope.headers.get("Content-Type")
    );
    ensure!(envelope.is_base64_encoded, "response should be base64 encoded");
    ensure!(
        envelope.body.as_deref().map_or(false, |body| !body.is_empty()),
        "no body in response"
    );

    let bytes = envelope.decode_body()?;
    ensure!(
        bytes.starts_with(signature(content_type)),
        "decoded body is not {}",
        content_type
    );
    Ok(bytes)
}

struct Gateway {
    client: Client<HttpConnector>,
    target: Uri,
}

impl Gateway {
    async fn send(&self, method: Method, body: Body) -> Result<(StatusCode, Bytes)> {
        let request = Request::builder()
            .method(method)
            .uri(self.target.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)?;
        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("failed to reach {}", self.target))?;

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, body))
    }

    async fn post(&self, payload: &Value) -> Result<(StatusCode, Bytes)> {
        self.send(Method::POST, Body::from(serde_json::to_vec(payload)?))
            .await
    }

    async fn expect_status(&self, name: &str, method: Method, body: Body, expected: StatusCode) {
        match self.send(method, body).await {
            Ok((status, _)) if status == expected => {
                tracing::info!("{}: rejected with {}", name, status);
            }
            Ok((status, body)) => tracing::error!(
                "{}: expected {}, got {} ({})",
                name,
                expected,
                status,
                String::from_utf8_lossy(&body)
            ),
            Err(err) => tracing::error!("{}: {:#}", name, err),
        }
    }

    async fn run_case(&self, case: &Case, args: &SmokeArgs) -> Result<usize> {
        let (status, body) = self.post(&case.payload).await?;
        let bytes = check(status, &body, case.content_type)?;

        let path = args.out_dir.join(case.output);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(bytes.len())
    }
}

pub async fn run(args: SmokeArgs) -> Result<()> {
    let gateway = Gateway {
        client: Client::new(),
        target: args.target.clone(),
    };

    tracing::info!("testing against {}", gateway.target);
    gateway
        .send(Method::GET, Body::empty())
        .await
        .context("gateway not accessible, is it running?")?;

    gateway
        .expect_status("GET request", Method::GET, Body::empty(), StatusCode::METHOD_NOT_ALLOWED)
        .await;
    gateway
        .expect_status(
            "invalid payload",
            Method::POST,
            Body::from(json!({ "invalid": "payload" }).to_string()),
            StatusCode::BAD_REQUEST,
        )
        .await;

    let cases = cases();
    let mut passed = 0;
    for case in &cases {
        match gateway.run_case(case, &args).await {
            Ok(size) => {
                tracing::info!("{}: passed, saved {} ({} bytes)", case.name, case.output, size);
                passed += 1;
            }
            Err(err) => tracing::error!("{}: failed: {:#}", case.name, err),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    tracing::info!("{}/{} tests passed", passed, cases.len());
    if passed != cases.len() {
        return Err(anyhow!("{} of {} tests failed", cases.len() - passed, cases.len()));
    }
    Ok(())
}
