//! Report rendering to PDF via `printpdf`.

use std::io::BufWriter;
use std::path::{Path, PathBuf};

use ::image::RgbImage;
use printpdf::*;

use super::report::{HighlightSpan, Report};
use super::types::{Explanation, ExplanationOutcome, Modality};
use super::PipelineError;

pub const REPORT_TITLE: &str = "Lung Cancer Detection Report";

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const TOP: f32 = 280.0;
const BOTTOM: f32 = 20.0;
const LEFT: f32 = 20.0;

/// Rendered images are this wide on the page.
const IMAGE_WIDTH_MM: f32 = 80.0;
const IMAGE_GAP_MM: f32 = 10.0;

const BODY_SIZE: f32 = 10.0;
const MONO_SIZE: f32 = 9.0;
/// Courier advance width is 0.6 em.
const MONO_CHAR_MM: f32 = MONO_SIZE * 0.6 * 25.4 / 72.0;
const MONO_COLUMNS: usize = 90;

/// Turns a populated `Report` into a document at `output`.
///
/// The report is taken by value: it is consumed exactly once.
pub trait ReportRenderer: Send + Sync {
    fn render(&self, report: Report, output: &Path) -> Result<RenderedReport, PipelineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReport {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub pages: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfReportRenderer;

impl ReportRenderer for PdfReportRenderer {
    fn render(&self, report: Report, output: &Path) -> Result<RenderedReport, PipelineError> {
        let (bytes, pages) = generate_report_pdf(&report)?;
        std::fs::write(output, &bytes).map_err(|e| {
            let _ = std::fs::remove_file(output);
            PipelineError::RenderingFailure(format!("Writing {}: {e}", output.display()))
        })?;

        tracing::debug!(
            path = %output.display(),
            size_bytes = bytes.len(),
            pages,
            "Report rendered"
        );
        Ok(RenderedReport {
            path: output.to_path_buf(),
            size_bytes: bytes.len() as u64,
            pages,
        })
    }
}

fn pdf_err<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> PipelineError {
    move |e| PipelineError::RenderingFailure(format!("PDF {context} error: {e}"))
}

// ─── Page writer ─────────────────────────────────────────────────────────────

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    mono: IndirectFontRef,
    mono_bold: IndirectFontRef,
}

/// Cursor over the document that starts a new page when content would run
/// past the bottom margin.
struct PageWriter<'a> {
    doc: &'a PdfDocumentReference,
    layer: PdfLayerReference,
    fonts: Fonts,
    y: f32,
    pages: usize,
}

impl<'a> PageWriter<'a> {
    fn ensure(&mut self, height: f32) {
        if self.y - height < BOTTOM {
            let (page, layer) = self.doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = TOP;
            self.pages += 1;
        }
    }

    fn line(&mut self, text: &str, size: f32, bold: bool) {
        let step = size * 0.5;
        self.ensure(step);
        let font = if bold { &self.fonts.bold } else { &self.fonts.regular };
        self.layer.use_text(text, size, Mm(LEFT), Mm(self.y), font);
        self.y -= step;
    }

    fn wrapped(&mut self, text: &str, size: f32, max_chars: usize) {
        for line in wrap_text(text, max_chars) {
            self.line(&line, size, false);
        }
    }

    fn gap(&mut self, mm: f32) {
        self.y -= mm;
    }

    fn mono_line(&mut self, runs: &[(String, bool)]) {
        let step = MONO_SIZE * 0.5;
        self.ensure(step);
        let mut column = 0usize;
        for (text, bold) in runs {
            let font = if *bold { &self.fonts.mono_bold } else { &self.fonts.mono };
            let x = LEFT + column as f32 * MONO_CHAR_MM;
            self.layer.use_text(text, MONO_SIZE, Mm(x), Mm(self.y), font);
            column += text.chars().count();
        }
        self.y -= step;
    }

    /// Images side by side, each with a caption above it.
    fn images(&mut self, images: &[(&str, &RgbImage)]) {
        let height = images
            .iter()
            .map(|(_, img)| IMAGE_WIDTH_MM * img.height() as f32 / img.width().max(1) as f32)
            .fold(0.0, f32::max);
        self.ensure(height + 8.0);

        let caption_y = self.y;
        let image_bottom = self.y - 3.0 - height;
        for (i, (caption, img)) in images.iter().enumerate() {
            let x = LEFT + i as f32 * (IMAGE_WIDTH_MM + IMAGE_GAP_MM);
            self.layer
                .use_text(*caption, BODY_SIZE, Mm(x), Mm(caption_y), &self.fonts.bold);
            let dpi = img.width().max(1) as f32 * 25.4 / IMAGE_WIDTH_MM;
            pdf_image(img).add_to_layer(
                self.layer.clone(),
                ImageTransform {
                    translate_x: Some(Mm(x)),
                    translate_y: Some(Mm(image_bottom)),
                    dpi: Some(dpi),
                    ..Default::default()
                },
            );
        }
        self.y = image_bottom - 6.0;
    }
}

fn pdf_image(img: &RgbImage) -> Image {
    Image::from(ImageXObject {
        width: Px(img.width() as usize),
        height: Px(img.height() as usize),
        color_space: ColorSpace::Rgb,
        bits_per_component: ColorBits::Bit8,
        interpolate: false,
        image_data: img.as_raw().clone(),
        image_filter: None,
        smask: None,
        clipping_bbox: None,
    })
}

// ─── Document ────────────────────────────────────────────────────────────────

/// Render the report into PDF bytes. Returns the bytes and the page count.
pub fn generate_report_pdf(report: &Report) -> Result<(Vec<u8>, usize), PipelineError> {
    let (doc, page1, layer1) =
        PdfDocument::new(REPORT_TITLE, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
    let fonts = Fonts {
        regular: doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_err("font"))?,
        bold: doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(pdf_err("font"))?,
        mono: doc.add_builtin_font(BuiltinFont::Courier).map_err(pdf_err("font"))?,
        mono_bold: doc.add_builtin_font(BuiltinFont::CourierBold).map_err(pdf_err("font"))?,
    };
    let layer = doc.get_page(page1).get_layer(layer1);

    let pages = {
        let mut w = PageWriter {
            doc: &doc,
            layer,
            fonts,
            y: TOP,
            pages: 1,
        };

        w.line(REPORT_TITLE, 16.0, true);
        w.gap(4.0);
        let prediction = report.prediction();
        w.line(&format!("Type: {}", report.modality().display_name()), 12.0, false);
        w.line(&format!("Predicted Class: {}", prediction.label()), 12.0, false);
        if let Some(confidence) = prediction.confidence() {
            w.line(&format!("Prediction Probability: {confidence:.4}"), 12.0, false);
        }
        for warning in report.warnings() {
            w.line(&format!("Warning: {}", warning.message()), BODY_SIZE, false);
        }
        w.gap(4.0);

        if let ExplanationOutcome::Unavailable { reason } = report.explanation() {
            w.wrapped(&format!("Explanation unavailable: {reason}"), BODY_SIZE, 95);
            w.gap(4.0);
        }

        match report.modality() {
            Modality::CtScan => write_ct_section(&mut w, report),
            Modality::TextReport => write_text_section(&mut w, report),
        }
        w.pages
    };

    let mut buf = BufWriter::new(Vec::new());
    doc.save(&mut buf).map_err(pdf_err("save"))?;
    let bytes = buf
        .into_inner()
        .map_err(|e| PipelineError::RenderingFailure(format!("PDF buffer error: {e}")))?;
    Ok((bytes, pages))
}

fn write_ct_section(w: &mut PageWriter<'_>, report: &Report) {
    let overlay = match report.explanation().explanation() {
        Some(Explanation::RegionHighlight(region)) => Some(&region.overlay),
        _ => None,
    };
    let mut images: Vec<(&str, &RgbImage)> = Vec::new();
    if let Some(source) = report.source_image() {
        images.push(("CT Scan:", source));
    }
    if let Some(overlay) = overlay {
        images.push(("LIME Explanation (CT Scan):", overlay));
    }
    if !images.is_empty() {
        w.images(&images);
    }
}

fn write_text_section(w: &mut PageWriter<'_>, report: &Report) {
    w.line("Extracted Text:", 12.0, true);
    match report.highlighted_text() {
        Some(spans) if spans.iter().any(|s| !s.text.trim().is_empty()) => {
            for runs in layout_highlighted(spans, MONO_COLUMNS) {
                w.mono_line(&runs);
            }
        }
        _ => w.line("(no text extracted)", BODY_SIZE, false),
    }
    w.gap(4.0);

    if let Some(Explanation::TokenWeights(tokens)) = report.explanation().explanation() {
        w.line("LIME Explanation:", 12.0, true);
        for tw in tokens {
            w.line(&format!("{}: {:.4}", tw.token, tw.weight), BODY_SIZE, false);
        }
    }
}

// ─── Text layout ─────────────────────────────────────────────────────────────

/// Lay highlighted spans out in fixed-width lines of at most `max_chars`,
/// breaking at spaces where possible. Each line is a list of
/// `(text, highlighted)` runs.
pub fn layout_highlighted(spans: &[HighlightSpan], max_chars: usize) -> Vec<Vec<(String, bool)>> {
    let max_chars = max_chars.max(1);
    let mut lines: Vec<Vec<(char, bool)>> = vec![Vec::new()];

    for span in spans {
        let marked = span.weight.is_some();
        for c in span.text.chars() {
            if c == '\n' {
                lines.push(Vec::new());
                continue;
            }
            let c = if c.is_whitespace() { ' ' } else { c };
            let Some(current) = lines.last_mut() else { continue };
            current.push((c, marked));
            if current.len() > max_chars {
                let split = current
                    .iter()
                    .rposition(|(ch, _)| *ch == ' ')
                    .filter(|&i| i > 0)
                    .unwrap_or(max_chars);
                let mut rest = current.split_off(split);
                if rest.first().is_some_and(|(ch, _)| *ch == ' ') {
                    rest.remove(0);
                }
                lines.push(rest);
            }
        }
    }

    lines
        .into_iter()
        .map(|line| {
            let mut runs: Vec<(String, bool)> = Vec::new();
            for (c, marked) in line {
                match runs.last_mut() {
                    Some((text, m)) if *m == marked => text.push(c),
                    _ => runs.push((c.to_string(), marked)),
                }
            }
            runs
        })
        .collect()
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.len() + word.len() + 1 > max_chars && !current.is_empty() {
            lines.push(current.clone());
            current.clear();
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

// ─── Tests ───────────────────────────────────────────────────────────────────
