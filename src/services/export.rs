//! Plain-text and PDF renderings of a finished story.
//!
//! The PDF path is split in two: [`layout_story`] places every line on a
//! page (word wrap, page breaks), and [`render_pdf`] draws those pages with
//! the built-in Helvetica faces. Keeping layout separate lets pagination be
//! checked without decoding a PDF.

use anyhow::{Context, Result};
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument};
use std::fmt;

use crate::core::state::StoryData;
use crate::utils::text::wrap_text;

pub const TITLE: &str = "AI Story Weaver";
const SUBTITLE: &str = "Your AI-Generated Story";

/// Millimetres per typographic point.
const MM_PER_PT: f32 = 0.3528;
/// Average Helvetica glyph width as a fraction of the font size.
const AVG_GLYPH_EM: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Txt,
    Pdf,
}

impl ExportFormat {
    pub fn file_name(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "story.txt",
            ExportFormat::Pdf => "story.pdf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Txt => f.write_str("a .txt file"),
            ExportFormat::Pdf => f.write_str("a PDF"),
        }
    }
}

pub fn format_story_txt(premise: &str, story: &StoryData, chapters: &[String]) -> String {
    let mut content = format!("{}\n================\n\n", TITLE);
    content += &format!("Premise:\n--------\n{}\n\n", premise);
    content += &format!(
        "Character Arcs:\n---------------\n{}\n\n",
        story.character_arcs
    );
    content += "Outline:\n--------\n";
    for (i, item) in story.outline.iter().enumerate() {
        content += &format!("{}. {}\n", i + 1, item);
    }
    content += "\n================\n\n";

    for (i, chapter) in chapters.iter().enumerate() {
        content += &format!("Chapter {}\n----------------\n\n{}\n\n\n", i + 1, chapter);
    }

    content
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontStyle {
    Normal,
    Bold,
    Italic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
}

/// One line of text; `y_mm` is the baseline measured from the top edge.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedLine {
    pub text: String,
    pub size_pt: f32,
    pub style: FontStyle,
    pub x_mm: f32,
    pub y_mm: f32,
    pub align: Align,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub lines: Vec<PlacedLine>,
}

#[derive(Debug, Clone, Copy)]
pub struct PageGeometry {
    pub width_mm: f32,
    pub height_mm: f32,
    pub margin_mm: f32,
}

impl PageGeometry {
    pub fn a4() -> Self {
        Self {
            width_mm: 210.0,
            height_mm: 297.0,
            margin_mm: 15.0,
        }
    }

    fn printable_width(&self) -> f32 {
        self.width_mm - self.margin_mm * 2.0
    }

    /// How many average glyphs of the given size fit on one line.
    pub fn chars_per_line(&self, size_pt: f32) -> usize {
        let glyph_mm = size_pt * MM_PER_PT * AVG_GLYPH_EM;
        ((self.printable_width() / glyph_mm).floor() as usize).max(1)
    }
}

struct Layout {
    geometry: PageGeometry,
    pages: Vec<Page>,
    y: f32,
}

impl Layout {
    fn new(geometry: PageGeometry) -> Self {
        Self {
            geometry,
            pages: vec![Page::default()],
            y: geometry.margin_mm,
        }
    }

    fn new_page(&mut self) {
        self.pages.push(Page::default());
        self.y = self.geometry.margin_mm;
    }

    fn current(&mut self) -> &mut Page {
        // `pages` always holds at least the first page.
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn centered(&mut self, text: &str, size_pt: f32, style: FontStyle, y_mm: f32) {
        let x_mm = self.geometry.width_mm / 2.0;
        self.current().lines.push(PlacedLine {
            text: text.to_string(),
            size_pt,
            style,
            x_mm,
            y_mm,
            align: Align::Center,
        });
    }

    fn wrapped(&mut self, text: &str, size_pt: f32, style: FontStyle, heading: bool) {
        let bottom = self.geometry.height_mm - self.geometry.margin_mm;
        for line in wrap_text(text, self.geometry.chars_per_line(size_pt)) {
            if self.y > bottom {
                self.new_page();
            }
            let (x_mm, y_mm) = (self.geometry.margin_mm, self.y);
            self.current().lines.push(PlacedLine {
                text: line,
                size_pt,
                style,
                x_mm,
                y_mm,
                align: Align::Left,
            });
            self.y += size_pt * 0.5;
        }
        self.y += if heading { 8.0 } else { 4.0 };
    }
}

pub fn layout_story(
    premise: &str,
    story: &StoryData,
    chapters: &[String],
    geometry: &PageGeometry,
) -> Vec<Page> {
    let mut layout = Layout::new(*geometry);

    layout.centered(TITLE, 28.0, FontStyle::Bold, 40.0);
    layout.centered(SUBTITLE, 14.0, FontStyle::Italic, 52.0);

    layout.new_page();
    layout.wrapped("Premise", 16.0, FontStyle::Bold, true);
    layout.wrapped(premise, 12.0, FontStyle::Normal, false);

    layout.wrapped("Character Arcs", 16.0, FontStyle::Bold, true);
    layout.wrapped(&story.character_arcs, 12.0, FontStyle::Normal, false);

    layout.wrapped("Outline", 16.0, FontStyle::Bold, true);
    let outline = story
        .outline
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n");
    layout.wrapped(&outline, 12.0, FontStyle::Normal, false);

    for (i, chapter) in chapters.iter().enumerate() {
        layout.new_page();
        layout.wrapped(&format!("Chapter {}", i + 1), 18.0, FontStyle::Bold, true);
        layout.wrapped(chapter, 12.0, FontStyle::Normal, false);
    }

    layout.pages
}

struct Fonts {
    normal: IndirectFontRef,
    bold: IndirectFontRef,
    italic: IndirectFontRef,
}

impl Fonts {
    fn get(&self, style: FontStyle) -> &IndirectFontRef {
        match style {
            FontStyle::Normal => &self.normal,
            FontStyle::Bold => &self.bold,
            FontStyle::Italic => &self.italic,
        }
    }
}

pub fn render_pdf(pages: &[Page], geometry: &PageGeometry) -> Result<Vec<u8>> {
    let (width, height) = (Mm(geometry.width_mm), Mm(geometry.height_mm));
    let (doc, first_page, first_layer) = PdfDocument::new(TITLE, width, height, "Layer 1");

    let fonts = Fonts {
        normal: doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .context("Failed to load Helvetica")?,
        bold: doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .context("Failed to load Helvetica Bold")?,
        italic: doc
            .add_builtin_font(BuiltinFont::HelveticaOblique)
            .context("Failed to load Helvetica Oblique")?,
    };

    for (i, page) in pages.iter().enumerate() {
        let (page_index, layer_index) = if i == 0 {
            (first_page, first_layer)
        } else {
            doc.add_page(width, height, "Layer 1")
        };
        let layer = doc.get_page(page_index).get_layer(layer_index);

        for line in &page.lines {
            let x = match line.align {
                Align::Left => line.x_mm,
                Align::Center => {
                    let text_width =
                        line.text.chars().count() as f32 * line.size_pt * MM_PER_PT * AVG_GLYPH_EM;
                    (line.x_mm - text_width / 2.0).max(0.0)
                }
            };
            layer.use_text(
                line.text.as_str(),
                line.size_pt,
                Mm(x),
                Mm(geometry.height_mm - line.y_mm),
                fonts.get(line.style),
            );
        }
    }

    doc.save_to_bytes().context("Failed to encode PDF")
}
