// src/engine/text.rs
//
// Glyph rendering for text watermarks. Text is laid out as SVG <text> lines and
// rasterized with resvg against the system font database; the result is a
// coverage mask (0 = no ink, 255 = full ink).

use crate::error::PixformError;
use image::GrayImage;
use resvg::usvg::{self, fontdb};
use std::sync::{Arc, OnceLock};
use tracing::debug;

type TextResult<T> = std::result::Result<T, PixformError>;

/// Tried in order when picking the generic sans-serif face.
const SANS_CANDIDATES: &[&str] = &[
    "DejaVu Sans",
    "Liberation Sans",
    "Noto Sans",
    "Arial",
    "Helvetica",
];

const LINE_SPACING: f32 = 1.2;

/// Process-wide font database, loaded from the system on first use.
pub(crate) fn font_database() -> Arc<fontdb::Database> {
    static FONTS: OnceLock<Arc<fontdb::Database>> = OnceLock::new();
    FONTS
        .get_or_init(|| {
            let mut db = fontdb::Database::new();
            db.load_system_fonts();
            let families: Vec<String> = db
                .faces()
                .filter_map(|face| face.families.first().map(|(name, _)| name.clone()))
                .collect();
            let sans = SANS_CANDIDATES
                .iter()
                .find(|candidate| families.iter().any(|f| f == *candidate))
                .map(|s| s.to_string())
                .or_else(|| families.first().cloned());
            if let Some(sans) = sans {
                db.set_sans_serif_family(sans);
            }
            debug!(target: "pixform::engine", faces = db.len(), "font database loaded");
            Arc::new(db)
        })
        .clone()
}

/// Renders text into a coverage mask.
pub trait GlyphRenderer: Send + Sync {
    /// `font` follows the `"family [style] size"` convention, size in points.
    /// Lines wrap at `max_width` pixels; `dpi` converts points to pixels.
    fn render(&self, text: &str, font: &str, max_width: u32, dpi: u32) -> TextResult<GrayImage>;
}

/// Parsed `"family [style] size"` descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct FontDescriptor {
    pub family: String,
    pub bold: bool,
    pub italic: bool,
    pub size_pt: f32,
}

impl Default for FontDescriptor {
    fn default() -> Self {
        Self {
            family: "sans".to_string(),
            bold: false,
            italic: false,
            size_pt: 10.0,
        }
    }
}

impl FontDescriptor {
    pub fn parse(descriptor: &str) -> Self {
        let mut tokens: Vec<&str> = descriptor.split_whitespace().collect();
        let mut font = FontDescriptor::default();

        if let Some(size) = tokens.last().and_then(|t| t.parse::<f32>().ok()) {
            if size.is_finite() && size > 0.0 {
                font.size_pt = size;
            }
            tokens.pop();
        }
        while let Some(last) = tokens.last() {
            match last.to_ascii_lowercase().as_str() {
                "bold" => font.bold = true,
                "italic" | "oblique" => font.italic = true,
                "regular" | "normal" => {}
                _ => break,
            }
            tokens.pop();
        }
        if !tokens.is_empty() {
            font.family = tokens.join(" ");
        }
        font
    }

    fn pixel_size(&self, dpi: u32) -> f32 {
        self.size_pt * dpi as f32 / 72.0
    }

    fn svg_family(&self) -> String {
        match self.family.to_ascii_lowercase().as_str() {
            "sans" | "sans-serif" => "sans-serif".to_string(),
            "serif" => "serif".to_string(),
            "mono" | "monospace" => "monospace".to_string(),
            _ => format!("'{}', sans-serif", escape_xml(&self.family)),
        }
    }
}

/// Default renderer backed by resvg and the system fonts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SvgGlyphRenderer;

impl SvgGlyphRenderer {
    fn text_element(font: &FontDescriptor, px: f32, y: f32, line: &str) -> String {
        format!(
            r#"<text x="0" y="{y}" font-family="{family}" font-size="{px}" font-weight="{weight}" font-style="{style}" fill="black" xml:space="preserve">{text}</text>"#,
            family = font.svg_family(),
            weight = if font.bold { "bold" } else { "normal" },
            style = if font.italic { "italic" } else { "normal" },
            text = escape_xml(line),
        )
    }

    fn parse(svg: &str) -> TextResult<usvg::Tree> {
        let options = usvg::Options {
            fontdb: font_database(),
            ..Default::default()
        };
        usvg::Tree::from_str(svg, &options)
            .map_err(|e| PixformError::engine_failure("text", format!("layout failed: {e}")))
    }

    /// Advance width of a single line in pixels.
    fn measure(font: &FontDescriptor, px: f32, line: &str) -> TextResult<f32> {
        if line.is_empty() {
            return Ok(0.0);
        }
        let svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1">{}</svg>"#,
            Self::text_element(font, px, px, line)
        );
        let tree = Self::parse(&svg)?;
        Ok(tree.root().abs_bounding_box().right().max(0.0))
    }

    fn wrap(font: &FontDescriptor, px: f32, text: &str, max_width: u32) -> TextResult<Vec<String>> {
        let mut lines = Vec::new();
        for paragraph in text.lines() {
            let mut current = String::new();
            for word in paragraph.split_whitespace() {
                let candidate = if current.is_empty() {
                    word.to_string()
                } else {
                    format!("{current} {word}")
                };
                if !current.is_empty() && Self::measure(font, px, &candidate)? > max_width as f32 {
                    lines.push(std::mem::replace(&mut current, word.to_string()));
                } else {
                    current = candidate;
                }
            }
            lines.push(current);
        }
        Ok(lines)
    }
}

impl GlyphRenderer for SvgGlyphRenderer {
    fn render(&self, text: &str, font: &str, max_width: u32, dpi: u32) -> TextResult<GrayImage> {
        if max_width == 0 || dpi == 0 {
            return Err(PixformError::invalid_argument(
                "text",
                "max_width/dpi",
                format!("{max_width}/{dpi}"),
                "width and dpi must be positive",
            ));
        }
        let font = FontDescriptor::parse(font);
        let px = font.pixel_size(dpi);
        let lines = Self::wrap(&font, px, text, max_width)?;

        let mut widest = 0.0f32;
        for line in &lines {
            widest = widest.max(Self::measure(&font, px, line)?);
        }
        let line_height = px * LINE_SPACING;
        let canvas_w = (widest.ceil() as u32).max(max_width).saturating_add(2);
        let canvas_h = ((lines.len() as f32 * line_height + px * 0.5).ceil() as u32).max(1);

        let body: String = lines
            .iter()
            .enumerate()
            .map(|(i, line)| Self::text_element(&font, px, px + i as f32 * line_height, line))
            .collect();
        let svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{canvas_w}" height="{canvas_h}">{body}</svg>"#
        );
        let tree = Self::parse(&svg)?;
        let mut pixmap = resvg::tiny_skia::Pixmap::new(canvas_w, canvas_h)
            .ok_or_else(|| PixformError::out_of_memory("failed to allocate text pixmap"))?;
        resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap.as_mut());

        let coverage: Vec<u8> = pixmap.data().chunks_exact(4).map(|px| px[3]).collect();
        let mask = GrayImage::from_raw(canvas_w, canvas_h, coverage)
            .ok_or_else(|| PixformError::engine_failure("text", "pixmap size mismatch"))?;

        let mask = trim_mask(mask).ok_or_else(|| {
            PixformError::engine_failure(
                "text",
                format!("no glyphs rendered for {:?} with font {:?}", text, font.family),
            )
        })?;
        debug!(
            target: "pixform::pipeline",
            lines = lines.len(),
            width = mask.width(),
            height = mask.height(),
            px,
            "text rendered"
        );
        Ok(mask)
    }
}

/// Crops a mask to its inked bounding box; `None` when nothing is inked.
pub(crate) fn trim_mask(mask: GrayImage) -> Option<GrayImage> {
    let (w, h) = mask.dimensions();
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in mask.enumerate_pixels() {
        if p.0[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
        });
    }
    let (l, t, r, b) = bounds?;
    if (l, t, r, b) == (0, 0, w - 1, h - 1) {
        return Some(mask);
    }
    Some(image::imageops::crop_imm(&mask, l, t, r - l + 1, b - t + 1).to_image())
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
