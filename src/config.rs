//! Run configuration resolved from environment variables and CLI flags.
//!
//! Everything goes through a lookup function so tests can resolve a
//! configuration without touching the process environment. Empty values
//! count as unset, since CI secrets that are not configured arrive as "".

use crate::lm::{LmSettings, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::selector::{FileFilter, StageHint};
use crate::stage::{Pipeline, StageDescriptor, StageId, StageKind};
use crate::store::path::normalize;
use crate::store::DropboxAuth;
use crate::transform::{Depth, FeedbackSettings};
use crate::util::file_tag;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_FILES: usize = 200;
pub const DEFAULT_STATE_PATH: &str = "/_system/state.json";
pub const DEFAULT_LOGS_DIR: &str = "/_system/logs";

/// Built-in stage layout.
struct StageDefault {
    id: &'static str,
    name: &'static str,
    kind: StageKind,
    /// Older variable naming the stage root.
    legacy_root: Option<&'static str>,
}

const STAGES: [StageDefault; 5] = [
    StageDefault {
        id: "00",
        name: "inbox_raw",
        kind: StageKind::PassThrough,
        legacy_root: Some("MONTHLY_INBOX_PATH"),
    },
    StageDefault {
        id: "10",
        name: "preformat_py",
        kind: StageKind::PassThrough,
        legacy_root: Some("MONTHLY_PREP_DIR"),
    },
    StageDefault {
        id: "20",
        name: "overview_api",
        kind: StageKind::FeedbackFill,
        legacy_root: Some("MONTHLY_OVERVIEW_DIR"),
    },
    StageDefault {
        id: "30",
        name: "personalize_py",
        kind: StageKind::PassThrough,
        legacy_root: Some("MONTHLY_OUTBOX_DIR"),
    },
    StageDefault {
        id: "40",
        name: "trends_py",
        kind: StageKind::PassThrough,
        legacy_root: None,
    },
];

/// Values given on the command line; each wins over its variable.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub stage: Option<String>,
    pub max_files: Option<usize>,
    pub model: Option<String>,
    pub depth: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_input_chars: Option<usize>,
    pub max_output_tokens: Option<u32>,
}

/// Immutable configuration for one invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: String,
    pub stage_hint: StageHint,
    pub max_files_per_run: usize,
    pub pipeline: Pipeline,
    pub state_path: String,
    pub logs_dir: String,
    pub filter: FileFilter,
    pub feedback: FeedbackSettings,
    pub lm: LmSettings,
}

/// Read a variable from the process environment.
pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// First set variable among `names`.
    fn first(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| self.get(name))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|err| anyhow!("{name}={raw:?}: {err}"))
            })
            .transpose()
    }
}

impl RunConfig {
    pub fn resolve(
        lookup: impl Fn(&str) -> Option<String>,
        overrides: &Overrides,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let env = Env { lookup };

        let stage_raw = overrides
            .stage
            .clone()
            .or_else(|| env.get("MONTHLY_STAGE"))
            .unwrap_or_else(|| "auto".to_string());
        let stage_hint = StageHint::parse(&stage_raw).context("resolve MONTHLY_STAGE")?;

        let max_files_per_run = match overrides.max_files {
            Some(max) => max,
            None => env
                .parse::<usize>("MAX_FILES_PER_RUN")?
                .unwrap_or(DEFAULT_MAX_FILES),
        };
        if max_files_per_run == 0 {
            return Err(anyhow!("MAX_FILES_PER_RUN must be at least 1"));
        }

        let pipeline = resolve_pipeline(&env)?;
        if let StageHint::Stage(id) = &stage_hint {
            if pipeline.get(id).is_none() {
                return Err(anyhow!(
                    "unknown stage {id} (known: {})",
                    pipeline.ids().join(", ")
                ));
            }
        }

        let state_path = normalize(
            &env.first(&["MONTHLY_STATE_PATH", "STATE_PATH"])
                .unwrap_or_else(|| DEFAULT_STATE_PATH.to_string()),
        );
        let logs_dir = normalize(
            &env.first(&["MONTHLY_LOGS_DIR", "LOGS_DIR"])
                .unwrap_or_else(|| DEFAULT_LOGS_DIR.to_string()),
        );
        let filter = match env.get("MONTHLY_EXTENSIONS") {
            Some(raw) => FileFilter::parse(&raw).context("resolve MONTHLY_EXTENSIONS")?,
            None => FileFilter::default(),
        };

        Ok(Self {
            run_id: run_id(&env, now),
            stage_hint,
            max_files_per_run,
            pipeline,
            state_path,
            logs_dir,
            filter,
            feedback: resolve_feedback(&env, overrides)?,
            lm: resolve_lm(&env, overrides)?,
        })
    }

    /// Every directory the pipeline expects to exist.
    pub fn layout_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self
            .pipeline
            .stages()
            .iter()
            .flat_map(|stage| stage.dirs().map(str::to_string))
            .collect();
        dirs.push(self.logs_dir.clone());
        dirs.push(crate::store::path::parent(&self.state_path));
        dirs.dedup();
        dirs
    }
}

fn resolve_pipeline<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Pipeline> {
    let stages = STAGES
        .iter()
        .map(|default| {
            let id = StageId::parse(default.id)?;
            let root_var = format!("STAGE{}_ROOT", default.id);
            let root = env
                .get(&root_var)
                .or_else(|| default.legacy_root.and_then(|name| env.get(name)))
                .unwrap_or_else(|| format!("/{}_{}", default.id, default.name));
            let mut stage = StageDescriptor::rooted(id, default.name, default.kind, &root);
            let dir = |suffix: &str| env.get(&format!("STAGE{}_{suffix}", default.id));
            if let Some(input) = dir("IN") {
                stage.input_dir = input;
            }
            if let Some(output) = dir("OUT") {
                stage.output_dir = output;
            }
            if let Some(done) = dir("DONE") {
                stage.done_dir = done;
            }
            Ok(stage)
        })
        .collect::<Result<Vec<_>>>()?;
    Pipeline::new(stages)
}

fn resolve_feedback<F: Fn(&str) -> Option<String>>(
    env: &Env<F>,
    overrides: &Overrides,
) -> Result<FeedbackSettings> {
    let defaults = FeedbackSettings::default();
    let depth_raw = overrides.depth.clone().or_else(|| env.get("DEPTH"));
    let depth = match depth_raw {
        Some(raw) => Depth::parse(&raw).unwrap_or_else(|| {
            tracing::warn!(depth = %raw, "unknown DEPTH; using medium");
            Depth::Medium
        }),
        None => Depth::Medium,
    };
    let column = |name: &str, fallback: u32| -> Result<u32> {
        env.get(name)
            .map(|raw| FeedbackSettings::column(&raw).with_context(|| format!("resolve {name}")))
            .transpose()
            .map(|col| col.unwrap_or(fallback))
    };
    let start_row = env
        .parse::<u32>("EXCEL_START_ROW")?
        .unwrap_or(defaults.start_row);
    if start_row == 0 {
        return Err(anyhow!("EXCEL_START_ROW must be at least 1"));
    }
    let max_input_chars = match overrides.max_input_chars {
        Some(max) => max,
        None => env
            .parse::<usize>("MAX_INPUT_CHARS")?
            .unwrap_or(defaults.max_input_chars),
    };
    Ok(FeedbackSettings {
        input_col: column("EXCEL_INPUT_COL", defaults.input_col)?,
        output_col: column("EXCEL_OUTPUT_COL", defaults.output_col)?,
        start_row,
        depth,
        max_input_chars,
    })
}

fn resolve_lm<F: Fn(&str) -> Option<String>>(
    env: &Env<F>,
    overrides: &Overrides,
) -> Result<LmSettings> {
    let defaults = LmSettings::default();
    let timeout_secs = match overrides.timeout_secs {
        Some(secs) => Some(secs),
        None => env.parse::<u64>("OPENAI_TIMEOUT")?,
    };
    let max_output_tokens = match overrides.max_output_tokens {
        Some(tokens) => Some(tokens),
        None => env.parse::<u32>("OPENAI_MAX_OUTPUT_TOKENS")?,
    };
    Ok(LmSettings {
        command: env.get("MONTHLY_LM_COMMAND"),
        api_key: env.get("OPENAI_API_KEY"),
        model: overrides
            .model
            .clone()
            .or_else(|| env.get("OPENAI_MODEL"))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        base_url: env
            .get("OPENAI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        timeout: timeout_secs.map_or(defaults.timeout, Duration::from_secs),
        max_retries: env
            .parse::<u32>("OPENAI_MAX_RETRIES")?
            .unwrap_or(defaults.max_retries),
        max_output_tokens: max_output_tokens.unwrap_or(defaults.max_output_tokens),
    })
}

/// `gh-{run}-{attempt}` under GitHub Actions, otherwise `local-{timestamp}`.
fn run_id<F: Fn(&str) -> Option<String>>(env: &Env<F>, now: DateTime<Utc>) -> String {
    match env.get("GITHUB_RUN_ID") {
        Some(run) => {
            let attempt = env
                .get("GITHUB_RUN_ATTEMPT")
                .unwrap_or_else(|| "1".to_string());
            format!("gh-{run}-{attempt}")
        }
        None => format!("local-{}", file_tag(now)),
    }
}

/// Dropbox credentials: a refresh-token triple wins over a bare token.
pub fn dropbox_auth(lookup: impl Fn(&str) -> Option<String>) -> Result<DropboxAuth> {
    let env = Env { lookup };
    let refresh = (
        env.get("DROPBOX_REFRESH_TOKEN"),
        env.get("DROPBOX_APP_KEY"),
        env.get("DROPBOX_APP_SECRET"),
    );
    match refresh {
        (Some(refresh_token), Some(app_key), Some(app_secret)) => Ok(DropboxAuth::Refresh {
            refresh_token,
            app_key,
            app_secret,
        }),
        (Some(_), _, _) => Err(anyhow!(
            "DROPBOX_REFRESH_TOKEN is set but DROPBOX_APP_KEY or DROPBOX_APP_SECRET is missing"
        )),
        _ => env
            .get("DROPBOX_ACCESS_TOKEN")
            .map(DropboxAuth::AccessToken)
            .ok_or_else(|| {
                anyhow!(
                    "no Dropbox credentials: set DROPBOX_ACCESS_TOKEN or \
                     DROPBOX_REFRESH_TOKEN with DROPBOX_APP_KEY and DROPBOX_APP_SECRET"
                )
            }),
    }
}

/// Store request timeout (`DROPBOX_TIMEOUT`, seconds).
pub fn store_timeout(lookup: impl Fn(&str) -> Option<String>) -> Result<Duration> {
    let env = Env { lookup };
    Ok(Duration::from_secs(
        env.parse::<u64>("DROPBOX_TIMEOUT")?.unwrap_or(60),
    ))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
