use mime::Mime;
use serde::Deserialize;

/// Viewport width used for URL screenshots when the request doesn't name one.
pub const DEFAULT_URL_WIDTH: u32 = 1280;

#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub html: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "pdfURL")]
    pub pdf_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality_factor: Option<f64>,
}

/// Emulated device metrics. A zero width or height leaves that dimension
/// unoverridden, so the page sizes it on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            device_scale_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mode<'a> {
    Html {
        html: &'a str,
        viewport: Option<Viewport>,
        full_page: bool,
    },
    Url {
        url: &'a str,
        viewport: Viewport,
    },
    Pdf {
        url: &'a str,
    },
}

impl<'a> Mode<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Html { .. } => "html",
            Mode::Url { .. } => "url",
            Mode::Pdf { .. } => "pdf",
        }
    }

    pub fn content_type(&self) -> Mime {
        match self {
            Mode::Html { .. } | Mode::Url { .. } => mime::IMAGE_PNG,
            Mode::Pdf { .. } => mime::APPLICATION_PDF,
        }
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|value| !value.is_empty())
}

impl RenderRequest {
    fn width(&self) -> Option<u32> {
        self.width.filter(|&width| width > 0)
    }

    fn height(&self) -> Option<u32> {
        self.height.filter(|&height| height > 0)
    }

    fn quality_factor(&self) -> Option<f64> {
        self.quality_factor
            .filter(|&factor| factor.is_finite() && factor > 0.0)
    }

    /// How many of `html`, `url` and `pdfURL` are set.
    pub fn source_count(&self) -> usize {
        [&self.html, &self.url, &self.pdf_url]
            .into_iter()
            .filter(|field| present(field).is_some())
            .count()
    }

    /// Picks the render mode. `html` wins over `url`, which wins over `pdfURL`.
    pub fn mode(&self) -> Option<Mode<'_>> {
        if let Some(html) = present(&self.html) {
            let dimensions = self.width().zip(self.height());
            let mut viewport = dimensions.map(|(width, height)| Viewport {
                width,
                height,
                ..Viewport::default()
            });

            if let Some(factor) = self.quality_factor() {
                viewport.get_or_insert_with(Viewport::default).device_scale_factor = factor;
            }

            return Some(Mode::Html {
                html,
                viewport,
                full_page: dimensions.is_none(),
            });
        }

        if let Some(url) = present(&self.url) {
            return Some(Mode::Url {
                url,
                viewport: Viewport {
                    width: self.width().unwrap_or(DEFAULT_URL_WIDTH),
                    ..Viewport::default()
                },
            });
        }

        present(&self.pdf_url).map(|url| Mode::Pdf { url })
    }
}
