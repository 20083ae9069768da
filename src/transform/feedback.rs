//! Fill blank feedback cells from text completions.
//!
//! For each row of the first worksheet at or below the start row, if the
//! input column holds text and the output column is blank, the completer is
//! asked for feedback on the input text and the answer is written into the
//! output cell. Rows that already have output are left alone, so a
//! partially filled workbook only pays for the missing rows.

use super::workbook::{column_index, CellRef, Workbook};
use super::Transform;
use crate::lm::{build_completer, LmSettings, TextCompleter};
use crate::util::truncate_string;
use anyhow::{anyhow, Context, Result};

const FEEDBACK_PROMPT: &str = include_str!("../../prompts/feedback.md");

/// How much feedback to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Depth {
    Light,
    #[default]
    Medium,
    Heavy,
}

impl Depth {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "light" => Some(Self::Light),
            "medium" => Some(Self::Medium),
            "heavy" => Some(Self::Heavy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }

    fn length_guidance(&self) -> &'static str {
        match self {
            Self::Light => "two or three sentences.",
            Self::Medium => "one short paragraph of four to six sentences.",
            Self::Heavy => {
                "two or three paragraphs covering strengths, risks and concrete next steps."
            }
        }
    }
}

/// Where to read and write, and how much to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackSettings {
    /// 1-based column index.
    pub input_col: u32,
    pub output_col: u32,
    /// First data row; rows above it are headers.
    pub start_row: u32,
    pub depth: Depth,
    /// Input text cap in bytes.
    pub max_input_chars: usize,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            input_col: 1,
            output_col: 2,
            start_row: 2,
            depth: Depth::Medium,
            max_input_chars: 80_000,
        }
    }
}

impl FeedbackSettings {
    /// Parse a column given as letters (`B`).
    pub fn column(raw: &str) -> Result<u32> {
        column_index(raw.trim()).ok_or_else(|| anyhow!("invalid column {raw:?}"))
    }
}

enum CompleterSource {
    Ready(Box<dyn TextCompleter>),
    Deferred(LmSettings),
}

/// The feedback-fill transform.
pub struct FeedbackFill {
    settings: FeedbackSettings,
    source: CompleterSource,
}

impl FeedbackFill {
    /// Build the completer on first use, so a missing API key only fails
    /// the files that need it.
    pub fn new(settings: FeedbackSettings, lm: LmSettings) -> Self {
        Self {
            settings,
            source: CompleterSource::Deferred(lm),
        }
    }

    pub fn with_completer(settings: FeedbackSettings, completer: Box<dyn TextCompleter>) -> Self {
        Self {
            settings,
            source: CompleterSource::Ready(completer),
        }
    }

    fn completer(&mut self) -> Result<&mut dyn TextCompleter> {
        if let CompleterSource::Deferred(lm) = &self.source {
            let built = build_completer(lm).context("set up text completion")?;
            tracing::info!(backend = %built.label(), "text completion ready");
            self.source = CompleterSource::Ready(built);
        }
        match &mut self.source {
            CompleterSource::Ready(completer) => Ok(completer.as_mut()),
            CompleterSource::Deferred(_) => Err(anyhow!("text completion unavailable")),
        }
    }

    fn prompt(&self, entry: &str, filename: &str) -> String {
        let entry = truncate_string(entry.trim(), self.settings.max_input_chars);
        FEEDBACK_PROMPT
            .replace("{length_guidance}", self.settings.depth.length_guidance())
            .replace("{filename}", filename)
            .replace("{entry}", &entry)
    }
}

impl Transform for FeedbackFill {
    fn apply(&mut self, input: &[u8], filename: &str) -> Result<Vec<u8>> {
        let mut workbook =
            Workbook::open(input).with_context(|| format!("open workbook {filename}"))?;
        let cells = workbook.cells();
        let targets: Vec<(CellRef, String)> = cells
            .iter()
            .filter(|(at, text)| {
                at.col == self.settings.input_col
                    && at.row >= self.settings.start_row
                    && !text.trim().is_empty()
            })
            .map(|(at, text)| {
                let out = CellRef {
                    row: at.row,
                    col: self.settings.output_col,
                };
                (out, text.clone())
            })
            .filter(|(out, _)| cells.get(out).is_none_or(|text| text.trim().is_empty()))
            .collect();

        if targets.is_empty() {
            tracing::info!(filename, "no blank feedback cells; copying unchanged");
            return Ok(input.to_vec());
        }

        tracing::info!(filename, cells = targets.len(), depth = self.settings.depth.as_str(), "filling feedback");
        for (out, entry) in &targets {
            let prompt = self.prompt(entry, filename);
            let feedback = self
                .completer()?
                .complete(&prompt)
                .with_context(|| format!("complete feedback for {}", out.label()))?;
            workbook
                .set_text(*out, &feedback)
                .with_context(|| format!("write {}", out.label()))?;
        }
        workbook.to_bytes()
    }
}
