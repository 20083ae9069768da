//! Stage layout for the monthly pipeline.
//!
//! A pipeline is an ordered list of stages; each stage owns three store
//! directories (IN, OUT, DONE) and knows which transform it applies.
use crate::store::path::{join, normalize};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;

/// Two-digit stage ordinal (`"00"`, `"10"`, ...). Ordered numerically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    /// Parse a stage id, padding a single digit (`"2"` becomes `"02"`).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(anyhow!("invalid stage id {raw:?}: expected digits"));
        }
        let padded = if raw.len() == 1 {
            format!("0{raw}")
        } else {
            raw.to_string()
        };
        if padded.len() != 2 {
            return Err(anyhow!("invalid stage id {raw:?}: expected two digits"));
        }
        Ok(Self(padded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a stage does to each file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Copy bytes through unchanged.
    PassThrough,
    /// Fill blank feedback cells with text completions.
    FeedbackFill,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::PassThrough => "pass_through",
            StageKind::FeedbackFill => "feedback_fill",
        }
    }
}

/// One pipeline stage and its directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDescriptor {
    pub id: StageId,
    pub name: String,
    pub kind: StageKind,
    pub input_dir: String,
    pub output_dir: String,
    pub done_dir: String,
}

impl StageDescriptor {
    /// Stage rooted at `root` with the conventional `IN`/`OUT`/`DONE` folders.
    pub fn rooted(id: StageId, name: &str, kind: StageKind, root: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            input_dir: join(root, "IN"),
            output_dir: join(root, "OUT"),
            done_dir: join(root, "DONE"),
        }
    }

    /// Ledger marker recording which run handled a key.
    pub fn marker(&self, run_id: &str) -> String {
        format!("stage{}:{run_id}", self.id)
    }

    /// All three directories, for layout checks.
    pub fn dirs(&self) -> [&str; 3] {
        [
            self.input_dir.as_str(),
            self.output_dir.as_str(),
            self.done_dir.as_str(),
        ]
    }
}

/// Ordered stages with a strict successor relation.
#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
}

impl Pipeline {
    /// Build a pipeline, ordering stages by id and rejecting duplicates.
    pub fn new(mut stages: Vec<StageDescriptor>) -> Result<Self> {
        if stages.is_empty() {
            return Err(anyhow!("pipeline has no stages"));
        }
        stages.sort_by(|a, b| a.id.cmp(&b.id));
        for pair in stages.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(anyhow!("duplicate stage id {}", pair[0].id));
            }
        }
        for stage in &mut stages {
            stage.input_dir = normalize(&stage.input_dir);
            stage.output_dir = normalize(&stage.output_dir);
            stage.done_dir = normalize(&stage.done_dir);
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn get(&self, id: &StageId) -> Option<&StageDescriptor> {
        self.stages.iter().find(|stage| &stage.id == id)
    }

    pub fn position(&self, id: &StageId) -> Option<usize> {
        self.stages.iter().position(|stage| &stage.id == id)
    }

    /// The stage after `id`, or `None` for the last stage.
    pub fn next(&self, id: &StageId) -> Option<&StageDescriptor> {
        let idx = self.position(id)?;
        self.stages.get(idx + 1)
    }

    pub fn ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id.to_string()).collect()
    }
}
