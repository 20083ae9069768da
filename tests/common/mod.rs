//! Shared test infrastructure for integration tests.
//!
//! Every test drives the real `monthly` binary against a local store rooted
//! in a temporary directory, with a scrubbed environment.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Variables the binary reads; cleared so the host environment cannot leak in.
const SCRUBBED: &[&str] = &[
    "MONTHLY_STAGE",
    "MAX_FILES_PER_RUN",
    "MONTHLY_STATE_PATH",
    "STATE_PATH",
    "MONTHLY_LOGS_DIR",
    "LOGS_DIR",
    "MONTHLY_EXTENSIONS",
    "MONTHLY_LM_COMMAND",
    "OPENAI_API_KEY",
    "OPENAI_MODEL",
    "DEPTH",
    "DROPBOX_ACCESS_TOKEN",
    "DROPBOX_REFRESH_TOKEN",
    "DROPBOX_APP_KEY",
    "DROPBOX_APP_SECRET",
    "GITHUB_RUN_ID",
    "GITHUB_RUN_ATTEMPT",
];

pub fn manifest_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// A temporary store root plus helpers for seeding and inspecting it.
pub struct Sandbox {
    pub dir: TempDir,
    env: Vec<(String, String)>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
            env: vec![("GITHUB_RUN_ID".into(), "4242".into())],
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.push((key.to_string(), value.to_string()));
    }

    /// Write `bytes` at a store path such as `/00_inbox_raw/IN/a.xlsx`.
    pub fn seed(&self, store_path: &str, bytes: &[u8]) {
        let path = self.path(store_path);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
        std::fs::write(&path, bytes).expect("seed file");
    }

    pub fn path(&self, store_path: &str) -> PathBuf {
        self.root().join(store_path.trim_start_matches('/'))
    }

    /// File names directly under a store directory, sorted.
    pub fn names(&self, store_dir: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path(store_dir))
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_file())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Run `monthly --store local --root <sandbox> <args>`.
    pub fn monthly(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_monthly"));
        cmd.arg("--store").arg("local").arg("--root").arg(self.root());
        cmd.args(args);
        self.configure(&mut cmd);
        cmd.output().expect("run monthly")
    }

    /// Run `monthly` with no store flags.
    pub fn monthly_bare(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_monthly"));
        cmd.args(args);
        self.configure(&mut cmd);
        cmd.output().expect("run monthly")
    }

    fn configure(&self, cmd: &mut Command) {
        for key in SCRUBBED {
            cmd.env_remove(key);
        }
        cmd.env("RUST_LOG", "warn");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
    }
}

pub fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "monthly failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

/// A one-sheet workbook: header row, then one row per comment with a blank
/// feedback cell.
pub fn feedback_workbook(comments: &[&str]) -> Vec<u8> {
    let mut rows = String::from(
        r#"<row r="1"><c r="A1" t="inlineStr"><is><t>Comment</t></is></c><c r="B1" t="inlineStr"><is><t>Feedback</t></is></c></row>"#,
    );
    for (idx, comment) in comments.iter().enumerate() {
        let n = idx + 2;
        rows.push_str(&format!(
            r#"<row r="{n}"><c r="A{n}" t="inlineStr"><is><t>{comment}</t></is></c></row>"#
        ));
    }
    let sheet = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{rows}</sheetData></worksheet>"#
    );
    let parts = [
        (
            "[Content_Types].xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#.to_string(),
        ),
        (
            "_rels/.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#.to_string(),
        ),
        (
            "xl/workbook.xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#.to_string(),
        ),
        (
            "xl/_rels/workbook.xml.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#.to_string(),
        ),
        ("xl/worksheets/sheet1.xml", sheet),
    ];
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in parts {
        writer
            .start_file(name, SimpleFileOptions::default())
            .expect("start part");
        writer.write_all(body.as_bytes()).expect("write part");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Raw XML of the first worksheet in `bytes`.
pub fn sheet_xml(bytes: &[u8]) -> String {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("open zip");
    let mut sheet = archive
        .by_name("xl/worksheets/sheet1.xml")
        .expect("sheet part");
    let mut xml = String::new();
    std::io::Read::read_to_string(&mut sheet, &mut xml).expect("read sheet");
    xml
}
