//! Store path normalization.
//!
//! Every store path goes through [`normalize`] before it reaches an adapter,
//! so directory listings, ledger keys and audit records all agree on one
//! spelling of a path.

/// Normalize a store path.
///
/// The result always has a leading slash, never a trailing slash (except the
/// root `/` itself), no doubled slashes, and uses `/` as the separator even
/// when the input used backslashes. Surrounding whitespace is trimmed.
pub fn normalize(path: &str) -> String {
    let cleaned = path.trim().replace('\\', "/");
    let parts: Vec<&str> = cleaned.split('/').filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(cleaned.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Join a directory and a file name into a normalized path.
pub fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{}/{}", normalize(dir), name))
}

/// Parent directory of a normalized path; the root is its own parent.
pub fn parent(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Last path component, empty for the root.
#[cfg(test)]
pub fn file_name(path: &str) -> String {
    let path = normalize(path);
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Split a file name into `(base, ext)` where `ext` keeps its leading dot.
///
/// Dotfiles (`.env`) are treated as having no extension.
pub fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_leading_slash_and_strips_trailing() {
        assert_eq!(normalize("00_inbox_raw/IN/"), "/00_inbox_raw/IN");
        assert_eq!(normalize("/00_inbox_raw/IN"), "/00_inbox_raw/IN");
    }

    #[test]
    fn normalize_collapses_doubled_slashes_and_backslashes() {
        assert_eq!(normalize("//_system//logs///"), "/_system/logs");
        assert_eq!(normalize("\\_system\\state.json"), "/_system/state.json");
    }

    #[test]
    fn normalize_maps_empty_input_to_root() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("  / "), "/");
        assert_eq!(normalize("///"), "/");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["a/b", "/a//b/", "\\a", "", "/"] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn join_parent_and_file_name_agree() {
        let path = join("/10_preformat_py/IN/", "report.xlsx");
        assert_eq!(path, "/10_preformat_py/IN/report.xlsx");
        assert_eq!(parent(&path), "/10_preformat_py/IN");
        assert_eq!(file_name(&path), "report.xlsx");
        assert_eq!(parent("/top"), "/");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn split_ext_keeps_dot_and_ignores_dotfiles() {
        assert_eq!(split_ext("report.xlsx"), ("report", ".xlsx"));
        assert_eq!(split_ext("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_ext("README"), ("README", ""));
        assert_eq!(split_ext(".env"), (".env", ""));
    }
}
