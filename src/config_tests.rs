use super::*;
use chrono::TimeZone;
use std::collections::HashMap;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 5).unwrap()
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name: &str| map.get(name).cloned()
}

fn resolve(pairs: &[(&str, &str)]) -> Result<RunConfig> {
    RunConfig::resolve(env(pairs), &Overrides::default(), now())
}

#[test]
fn defaults_match_the_documented_layout() {
    let config = resolve(&[]).expect("config");
    assert_eq!(config.stage_hint, StageHint::Auto);
    assert_eq!(config.max_files_per_run, 200);
    assert_eq!(config.state_path, "/_system/state.json");
    assert_eq!(config.logs_dir, "/_system/logs");
    assert_eq!(config.run_id, "local-20261018-093005");
    assert_eq!(config.pipeline.ids(), vec!["00", "10", "20", "30", "40"]);

    let stage = config.pipeline.stages()[2].clone();
    assert_eq!(stage.input_dir, "/20_overview_api/IN");
    assert_eq!(stage.output_dir, "/20_overview_api/OUT");
    assert_eq!(stage.done_dir, "/20_overview_api/DONE");
    assert_eq!(stage.kind, StageKind::FeedbackFill);
    assert_eq!(config.pipeline.stages()[4].input_dir, "/40_trends_py/IN");

    assert_eq!(config.feedback, FeedbackSettings::default());
    assert_eq!(config.lm.model, "gpt-5-mini");
    assert_eq!(config.lm.timeout, Duration::from_secs(120));
    assert_eq!(config.lm.max_retries, 2);
    assert!(config.lm.api_key.is_none());
}

#[test]
fn stage_directories_follow_root_legacy_and_explicit_overrides() {
    let config = resolve(&[
        ("STAGE00_ROOT", "/Monthly/inbox/"),
        ("MONTHLY_PREP_DIR", "Monthly/prep"),
        ("STAGE10_DONE", "/archive/prep"),
        ("STAGE30_ROOT", "/custom30"),
        ("MONTHLY_OUTBOX_DIR", "/ignored"),
    ])
    .expect("config");
    let stages = config.pipeline.stages();
    assert_eq!(stages[0].input_dir, "/Monthly/inbox/IN");
    assert_eq!(stages[1].input_dir, "/Monthly/prep/IN");
    assert_eq!(stages[1].done_dir, "/archive/prep");
    assert_eq!(stages[3].output_dir, "/custom30/OUT");
}

#[test]
fn scalar_settings_and_run_id_come_from_env() {
    let config = resolve(&[
        ("MONTHLY_STAGE", "stage20"),
        ("MAX_FILES_PER_RUN", "5"),
        ("STATE_PATH", "state/ledger.json"),
        ("MONTHLY_LOGS_DIR", "/logs//"),
        ("MONTHLY_EXTENSIONS", "xlsx,xlsm"),
        ("DEPTH", "heavy"),
        ("EXCEL_OUTPUT_COL", "D"),
        ("MAX_INPUT_CHARS", "1000"),
        ("OPENAI_API_KEY", "sk-test"),
        ("OPENAI_TIMEOUT", "30"),
        ("GITHUB_RUN_ID", "9876"),
        ("GITHUB_RUN_ATTEMPT", "2"),
    ])
    .expect("config");
    assert_eq!(config.stage_hint.as_str(), "20");
    assert_eq!(config.max_files_per_run, 5);
    assert_eq!(config.state_path, "/state/ledger.json");
    assert_eq!(config.logs_dir, "/logs");
    assert!(config.filter.matches("a.xlsm"));
    assert_eq!(config.feedback.depth, Depth::Heavy);
    assert_eq!(config.feedback.output_col, 4);
    assert_eq!(config.feedback.max_input_chars, 1000);
    assert_eq!(config.lm.api_key.as_deref(), Some("sk-test"));
    assert_eq!(config.lm.timeout, Duration::from_secs(30));
    assert_eq!(config.run_id, "gh-9876-2");
}

#[test]
fn unknown_stage_hint_is_rejected() {
    // "2" pads to "02", which is not a configured stage.
    let err = resolve(&[("MONTHLY_STAGE", "2")]).expect_err("02 is not a stage");
    assert!(err.to_string().contains("unknown stage"));
    assert!(resolve(&[("MONTHLY_STAGE", "0")]).is_ok());
    assert!(resolve(&[("MONTHLY_STAGE", "next")]).is_err());
}

#[test]
fn overrides_win_over_env() {
    let overrides = Overrides {
        stage: Some("20".to_string()),
        max_files: Some(3),
        model: Some("gpt-test".to_string()),
        depth: Some("light".to_string()),
        timeout_secs: Some(7),
        max_input_chars: Some(10),
        max_output_tokens: Some(50),
    };
    let config = RunConfig::resolve(
        env(&[
            ("MONTHLY_STAGE", "00"),
            ("MAX_FILES_PER_RUN", "100"),
            ("OPENAI_MODEL", "gpt-env"),
            ("DEPTH", "heavy"),
        ]),
        &overrides,
        now(),
    )
    .expect("config");
    assert_eq!(config.stage_hint.as_str(), "20");
    assert_eq!(config.max_files_per_run, 3);
    assert_eq!(config.lm.model, "gpt-test");
    assert_eq!(config.feedback.depth, Depth::Light);
    assert_eq!(config.lm.timeout, Duration::from_secs(7));
    assert_eq!(config.feedback.max_input_chars, 10);
    assert_eq!(config.lm.max_output_tokens, 50);
}

#[test]
fn invalid_values_are_setup_errors() {
    assert!(resolve(&[("MAX_FILES_PER_RUN", "0")]).is_err());
    assert!(resolve(&[("MAX_FILES_PER_RUN", "many")]).is_err());
    assert!(resolve(&[("EXCEL_INPUT_COL", "7")]).is_err());
    assert!(resolve(&[("EXCEL_START_ROW", "0")]).is_err());
    assert!(resolve(&[("MONTHLY_EXTENSIONS", ",")]).is_err());
}

#[test]
fn empty_values_count_as_unset_and_unknown_depth_falls_back() {
    let config = resolve(&[("MAX_FILES_PER_RUN", "  "), ("DEPTH", "extreme")]).expect("config");
    assert_eq!(config.max_files_per_run, 200);
    assert_eq!(config.feedback.depth, Depth::Medium);
}

#[test]
fn layout_dirs_cover_stages_logs_and_state() {
    let config = resolve(&[]).expect("config");
    let dirs = config.layout_dirs();
    assert_eq!(dirs.len(), 17);
    assert!(dirs.contains(&"/00_inbox_raw/DONE".to_string()));
    assert!(dirs.contains(&"/_system/logs".to_string()));
    assert!(dirs.contains(&"/_system".to_string()));
}

#[test]
fn dropbox_auth_prefers_refresh_credentials() {
    let auth = dropbox_auth(env(&[
        ("DROPBOX_ACCESS_TOKEN", "short"),
        ("DROPBOX_REFRESH_TOKEN", "r"),
        ("DROPBOX_APP_KEY", "k"),
        ("DROPBOX_APP_SECRET", "s"),
    ]))
    .expect("auth");
    assert!(matches!(auth, DropboxAuth::Refresh { .. }));

    let token = dropbox_auth(env(&[("DROPBOX_ACCESS_TOKEN", "short")])).expect("auth");
    assert!(matches!(token, DropboxAuth::AccessToken(ref t) if t == "short"));

    assert!(dropbox_auth(env(&[("DROPBOX_REFRESH_TOKEN", "r")])).is_err());
    assert!(dropbox_auth(env(&[])).is_err());
    assert_eq!(
        store_timeout(env(&[("DROPBOX_TIMEOUT", "15")])).expect("timeout"),
        Duration::from_secs(15)
    );
}
