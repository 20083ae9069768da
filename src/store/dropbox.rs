//! Dropbox HTTP adapter.
//!
//! Talks to the Dropbox v2 HTTP API directly with `ureq`. RPC endpoints take
//! a JSON body; content endpoints (upload/download) carry their arguments in
//! the `Dropbox-API-Arg` header, which must be ASCII-only JSON.
//!
//! Error mapping:
//! - 409 with a `*/not_found/*` summary is [`StoreError::NotFound`]
//! - 409 with a `*/conflict/*` summary is [`StoreError::Conflict`]
//! - 401/403 and other 4xx are [`StoreError::Fatal`]
//! - 429, 5xx and transport failures are [`StoreError::Transient`]
use super::path::normalize;
use super::{with_retry, BlobStore, FileEntry, StoreError, StoreResult, WriteMode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use ureq::http::Response;
use ureq::Body;

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

/// Workbooks are small, but the default body cap (10 MiB) is too tight for
/// scanned attachments.
const MAX_DOWNLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Refresh this long before the server-side expiry.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// How the adapter authenticates.
#[derive(Clone)]
pub enum DropboxAuth {
    /// A long-lived (legacy) access token.
    AccessToken(String),
    /// The OAuth refresh-token grant.
    Refresh {
        refresh_token: String,
        app_key: String,
        app_secret: String,
    },
}

impl std::fmt::Debug for DropboxAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessToken(_) => write!(f, "AccessToken(<redacted>)"),
            Self::Refresh { app_key, .. } => write!(f, "Refresh {{ app_key: {app_key}, .. }}"),
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

pub struct DropboxStore {
    agent: ureq::Agent,
    auth: DropboxAuth,
    token: Mutex<Option<CachedToken>>,
    backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    path_lower: Option<String>,
    #[serde(default)]
    rev: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl DropboxStore {
    /// Build the adapter and verify the credentials with one account lookup.
    ///
    /// Any failure here is a setup failure: nothing can proceed without a
    /// working store.
    pub fn connect(auth: DropboxAuth, timeout: Duration) -> StoreResult<Self> {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        let store = Self {
            agent: ureq::Agent::new_with_config(config),
            auth,
            token: Mutex::new(None),
            backoff: Duration::from_millis(1500),
        };
        store.rpc("users/get_current_account", None)?;
        tracing::info!("dropbox credentials verified");
        Ok(store)
    }

    fn access_token(&self, force_refresh: bool) -> StoreResult<String> {
        let mut cached = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if let DropboxAuth::AccessToken(token) = &self.auth {
            return Ok(token.clone());
        }
        let fresh = cached.as_ref().is_some_and(|token| {
            token
                .expires_at
                .is_none_or(|deadline| Instant::now() < deadline)
        });
        if fresh && !force_refresh {
            if let Some(token) = cached.as_ref() {
                return Ok(token.value.clone());
            }
        }
        let token = self.refresh_token()?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    fn refresh_token(&self) -> StoreResult<CachedToken> {
        let DropboxAuth::Refresh {
            refresh_token,
            app_key,
            app_secret,
        } = &self.auth
        else {
            return Err(StoreError::Fatal {
                operation: "refresh_token",
                message: "no refresh credentials configured".to_string(),
            });
        };
        let mut response = self
            .agent
            .post(TOKEN_URL)
            .send_form([
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", app_key.as_str()),
                ("client_secret", app_secret.as_str()),
            ])
            .map_err(|err| transport_error("refresh_token", err))?;
        let status = response.status().as_u16();
        if status != 200 {
            let body = read_text(&mut response);
            return Err(StoreError::Fatal {
                operation: "refresh_token",
                message: format!("HTTP {status}: {}", crate::util::truncate_string(&body, 300)),
            });
        }
        let parsed: TokenResponse =
            response
                .body_mut()
                .read_json()
                .map_err(|err| StoreError::Decode {
                    operation: "refresh_token",
                    message: err.to_string(),
                })?;
        tracing::debug!(expires_in = ?parsed.expires_in, "dropbox access token refreshed");
        Ok(CachedToken {
            value: parsed.access_token,
            expires_at: parsed.expires_in.map(|secs| {
                Instant::now() + Duration::from_secs(secs).saturating_sub(TOKEN_EXPIRY_SLACK)
            }),
        })
    }

    /// Send one authorized request with retries, refreshing an expired
    /// token once per attempt.
    fn send(
        &self,
        operation: &'static str,
        request: impl Fn(&str) -> Result<Response<Body>, ureq::Error>,
    ) -> StoreResult<Response<Body>> {
        with_retry(operation, self.backoff, || self.send_once(operation, &request))
    }

    fn send_once(
        &self,
        operation: &'static str,
        request: &impl Fn(&str) -> Result<Response<Body>, ureq::Error>,
    ) -> StoreResult<Response<Body>> {
        let token = self.access_token(false)?;
        let mut response = request(&token).map_err(|err| transport_error(operation, err))?;
        if response.status().as_u16() == 401 && matches!(self.auth, DropboxAuth::Refresh { .. }) {
            let body = read_text(&mut response);
            if body.contains("expired_access_token") {
                let token = self.access_token(true)?;
                response = request(&token).map_err(|err| transport_error(operation, err))?;
            } else {
                return Err(status_error(operation, 401, &body));
            }
        }
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let body = read_text(&mut response);
        Err(status_error(operation, status, &body))
    }

    /// Call a JSON RPC endpoint and decode the JSON result.
    fn rpc(&self, endpoint: &'static str, args: Option<Value>) -> StoreResult<Value> {
        let url = format!("{API_BASE}/{endpoint}");
        let mut response = self.send(endpoint, |token| {
            let request = self
                .agent
                .post(&url)
                .header("Authorization", &format!("Bearer {token}"));
            match &args {
                Some(args) => request.send_json(args),
                None => request.send_empty(),
            }
        })?;
        let text = read_text(&mut response);
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| StoreError::Decode {
            operation: endpoint,
            message: err.to_string(),
        })
    }

    fn list_page(&self, value: Value) -> StoreResult<ListFolderResult> {
        serde_json::from_value(value).map_err(|err| StoreError::Decode {
            operation: "list",
            message: err.to_string(),
        })
    }
}

impl BlobStore for DropboxStore {
    fn list(&self, dir: &str) -> StoreResult<Vec<FileEntry>> {
        let page = match self.rpc(
            "files/list_folder",
            Some(json!({
                "path": api_path(dir),
                "recursive": false,
                "include_deleted": false,
            })),
        ) {
            Ok(value) => self.list_page(value)?,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut entries = Vec::new();
        let mut page = page;
        loop {
            entries.extend(page.entries.into_iter().filter_map(file_entry));
            if !page.has_more {
                break;
            }
            let next = self.rpc(
                "files/list_folder/continue",
                Some(json!({ "cursor": page.cursor })),
            )?;
            page = self.list_page(next)?;
        }
        Ok(entries)
    }

    fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        let arg = header_json(&json!({ "path": api_path(path) }));
        let request = |token: &str| {
            self.agent
                .post(format!("{CONTENT_BASE}/files/download"))
                .header("Authorization", &format!("Bearer {token}"))
                .header("Dropbox-API-Arg", &arg)
                .send_empty()
        };
        // The body streams after the headers, so a dropped connection
        // mid-download retries the whole request.
        with_retry("read", self.backoff, || {
            let mut response = self.send_once("read", &request)?;
            response
                .body_mut()
                .with_config()
                .limit(MAX_DOWNLOAD_BYTES)
                .read_to_vec()
                .map_err(|err| body_error("read", err))
        })
        .map_err(|err| with_path(err, path))
    }

    fn write(&self, path: &str, bytes: &[u8], mode: WriteMode) -> StoreResult<()> {
        let mode = match mode {
            WriteMode::Overwrite => "overwrite",
            WriteMode::Create => "add",
        };
        let arg = header_json(&json!({
            "path": api_path(path),
            "mode": mode,
            "autorename": false,
            "mute": true,
        }));
        self.send("write", |token| {
            self.agent
                .post(format!("{CONTENT_BASE}/files/upload"))
                .header("Authorization", &format!("Bearer {token}"))
                .header("Dropbox-API-Arg", &arg)
                .header("Content-Type", "application/octet-stream")
                .send(bytes)
        })
        .map(|_| ())
        .map_err(|err| with_path(err, path))
    }

    fn move_file(&self, src: &str, dst: &str) -> StoreResult<()> {
        let result = self.rpc(
            "files/move_v2",
            Some(json!({
                "from_path": api_path(src),
                "to_path": api_path(dst),
                "autorename": false,
                "allow_ownership_transfer": false,
            })),
        );
        match result {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => Err(StoreError::Conflict {
                path: normalize(dst),
            }),
            Err(StoreError::NotFound { .. }) => Err(StoreError::NotFound {
                path: normalize(src),
            }),
            Err(err) => Err(err),
        }
    }

    fn ensure_dir(&self, dir: &str) -> StoreResult<()> {
        if normalize(dir) == "/" {
            return Ok(());
        }
        match self.rpc(
            "files/create_folder_v2",
            Some(json!({ "path": api_path(dir), "autorename": false })),
        ) {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn describe(&self) -> String {
        "dropbox".to_string()
    }
}

/// Dropbox spells the root folder as the empty string.
fn api_path(path: &str) -> String {
    let normalized = normalize(path);
    if normalized == "/" {
        String::new()
    } else {
        normalized
    }
}

fn file_entry(meta: Metadata) -> Option<FileEntry> {
    if meta.tag != "file" {
        return None;
    }
    let path = meta.path_display.or(meta.path_lower)?;
    Some(FileEntry {
        path: normalize(&path),
        name: meta.name,
        revision: meta.rev,
        size: meta.size.unwrap_or(0),
    })
}

/// Serialize JSON for an HTTP header, escaping everything outside ASCII.
pub(crate) fn header_json(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            out.push(ch);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{unit:04x}"));
        }
    }
    out
}

fn read_text(response: &mut Response<Body>) -> String {
    response.body_mut().read_to_string().unwrap_or_default()
}

fn transport_error(operation: &'static str, err: ureq::Error) -> StoreError {
    StoreError::Transient {
        operation,
        message: err.to_string(),
    }
}

/// An oversized body will not shrink on retry; anything else is transport.
fn body_error(operation: &'static str, err: ureq::Error) -> StoreError {
    match err {
        ureq::Error::BodyExceedsLimit(limit) => StoreError::Decode {
            operation,
            message: format!("body exceeds {limit} bytes"),
        },
        other => transport_error(operation, other),
    }
}

fn status_error(operation: &'static str, status: u16, body: &str) -> StoreError {
    let summary = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error_summary")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| crate::util::truncate_string(body.trim(), 300));
    match status {
        409 if summary.contains("not_found") => StoreError::NotFound { path: summary },
        409 if summary.contains("conflict") => StoreError::Conflict { path: summary },
        429 | 500..=599 => StoreError::Transient {
            operation,
            message: format!("HTTP {status}: {summary}"),
        },
        _ => StoreError::Fatal {
            operation,
            message: format!("HTTP {status}: {summary}"),
        },
    }
}

/// Replace the error summary carried by path-less errors with the path.
fn with_path(err: StoreError, path: &str) -> StoreError {
    match err {
        StoreError::NotFound { .. } => StoreError::NotFound {
            path: normalize(path),
        },
        StoreError::Conflict { .. } => StoreError::Conflict {
            path: normalize(path),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_json_escapes_non_ascii() {
        let arg = header_json(&json!({ "path": "/00/IN/月報.xlsx" }));
        assert!(arg.is_ascii());
        assert_eq!(arg, r#"{"path":"/00/IN/\u6708\u5831.xlsx"}"#);
        let back: Value = serde_json::from_str(&arg).expect("still valid JSON");
        assert_eq!(back["path"], "/00/IN/月報.xlsx");
    }

    #[test]
    fn header_json_escapes_astral_characters_as_surrogate_pairs() {
        let arg = header_json(&json!({ "path": "/😀.xlsx" }));
        assert_eq!(arg, r#"{"path":"/\ud83d\ude00.xlsx"}"#);
    }

    #[test]
    fn api_path_uses_empty_string_for_root() {
        assert_eq!(api_path("/"), "");
        assert_eq!(api_path(""), "");
        assert_eq!(api_path("00_inbox_raw/IN/"), "/00_inbox_raw/IN");
    }

    #[test]
    fn status_errors_map_to_kinds() {
        let not_found = status_error(
            "read",
            409,
            r#"{"error_summary": "path/not_found/..", "error": {}}"#,
        );
        assert!(not_found.is_not_found());
        let conflict = status_error("move", 409, r#"{"error_summary": "to/conflict/file/.."}"#);
        assert!(conflict.is_conflict());
        assert!(status_error("list", 429, "too_many_requests").is_transient());
        assert!(status_error("list", 503, "").is_transient());
        assert!(status_error("list", 401, "invalid_access_token").is_fatal());
        assert!(status_error("list", 400, "bad request").is_fatal());
    }

    #[test]
    fn body_errors_retry_unless_oversized() {
        assert!(!body_error("read", ureq::Error::BodyExceedsLimit(10)).is_transient());
        let reset = ureq::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset mid-body",
        ));
        assert!(body_error("read", reset).is_transient());
    }

    #[test]
    fn file_entry_skips_folders_and_keeps_rev() {
        let folder = Metadata {
            tag: "folder".to_string(),
            name: "IN".to_string(),
            path_display: Some("/00/IN".to_string()),
            path_lower: Some("/00/in".to_string()),
            rev: None,
            size: None,
        };
        assert!(file_entry(folder).is_none());

        let file = Metadata {
            tag: "file".to_string(),
            name: "Report.xlsx".to_string(),
            path_display: Some("/00/IN/Report.xlsx".to_string()),
            path_lower: Some("/00/in/report.xlsx".to_string()),
            rev: Some("015f1a2b3c".to_string()),
            size: Some(2048),
        };
        let entry = file_entry(file).expect("file entry");
        assert_eq!(entry.path, "/00/IN/Report.xlsx");
        assert_eq!(entry.revision.as_deref(), Some("015f1a2b3c"));
        assert_eq!(entry.size, 2048);
    }

    #[test]
    fn list_page_decodes_dropbox_shape() {
        let value = json!({
            "entries": [
                {".tag": "file", "name": "a.xlsx", "path_display": "/x/IN/a.xlsx",
                 "path_lower": "/x/in/a.xlsx", "id": "id:1", "rev": "01", "size": 10},
                {".tag": "folder", "name": "sub", "path_display": "/x/IN/sub",
                 "path_lower": "/x/in/sub", "id": "id:2"}
            ],
            "cursor": "AAA",
            "has_more": false
        });
        let page: ListFolderResult = serde_json::from_value(value).expect("decode");
        assert_eq!(page.entries.len(), 2);
        assert!(!page.has_more);
        let files: Vec<FileEntry> = page.entries.into_iter().filter_map(file_entry).collect();
        assert_eq!(files.len(), 1);
    }
}
