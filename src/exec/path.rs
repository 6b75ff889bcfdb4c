//! Shared wildcard expansion and path-safety checks.
//!
//! Both executors funnel their destructive and copying operations through
//! these helpers so the rules live in one place:
//!
//! * globbing (`*`/`?`) applies to the **final path segment only** —
//!   directory components are never expanded;
//! * deletes refuse filesystem roots, `.`/`..` and wildcard patterns
//!   unless the caller explicitly allows wildcards, and even then a
//!   pattern without a parent directory (a bare `*`) is rejected.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ExecError, ExecResult};

static WILDCARD_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[*?]").unwrap_or_else(|e| unreachable!("static pattern is valid: {e}"))
});

/// Does the string contain glob metacharacters?
pub(crate) fn has_wildcard(s: &str) -> bool {
    WILDCARD_CHARS.is_match(s)
}

/// Translate a filename glob (`*`, `?`) into an anchored regex.
///
/// Every other character is matched literally.
pub(crate) fn wildcard_to_regex(pattern: &str) -> ExecResult<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');

    Regex::new(&translated)
        .map_err(|e| ExecError::Protocol(format!("invalid wildcard pattern `{}`: {}", pattern, e)))
}

/// Expand a local path whose final segment may contain a glob.
///
/// Without a wildcard the path is returned as-is (no existence check).
/// With one, the parent directory is listed and entries whose file name
/// matches are returned in sorted order. Wildcards in directory
/// components are not expanded and will simply fail the directory listing.
pub(crate) fn expand_local(path: &str) -> ExecResult<Vec<PathBuf>> {
    let path_buf = PathBuf::from(path);

    let Some(file_name) = path_buf.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return Ok(vec![path_buf]);
    };

    if !has_wildcard(&file_name) {
        return Ok(vec![path_buf]);
    }

    let pattern = wildcard_to_regex(&file_name)?;
    let parent = match path_buf.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let entries = std::fs::read_dir(&parent)
        .map_err(|e| ExecError::path(parent.display().to_string(), e))?;

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ExecError::path(parent.display().to_string(), e))?;
        if pattern.is_match(&entry.file_name().to_string_lossy()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Validate a delete target before anything is removed.
///
/// Rejects empty paths, filesystem roots, `.`/`..` targets, and wildcard
/// patterns unless `allow_wildcard`. A permitted wildcard must still be
/// scoped under some parent directory.
pub(crate) fn validate_delete_path(path: &str, allow_wildcard: bool) -> ExecResult<()> {
    let refuse = |reason: &str| {
        Err(ExecError::UnsafePath {
            path: path.to_string(),
            reason: reason.to_string(),
        })
    };

    let trimmed = path.trim_end_matches('/');
    if path.is_empty() || trimmed.is_empty() {
        return refuse("refusing to delete a filesystem root");
    }

    let path_buf = PathBuf::from(trimmed);
    let components: Vec<Component> = path_buf.components().collect();

    if components
        .iter()
        .all(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
    {
        return refuse("refusing to delete a filesystem root");
    }

    match components.last() {
        Some(Component::CurDir) => return refuse("refusing to delete `.`"),
        Some(Component::ParentDir) => return refuse("refusing to delete `..`"),
        _ => {}
    }

    if has_wildcard(trimmed) {
        if !allow_wildcard {
            return refuse("wildcard delete not permitted");
        }
        // Even a permitted wildcard must not erase a whole root or the
        // working directory: require a real parent component.
        let parent_ok = path_buf
            .parent()
            .is_some_and(|p| !p.as_os_str().is_empty() && p != Path::new("/"));
        if !parent_ok {
            return refuse("unscoped wildcard delete");
        }
    }

    Ok(())
}

/// Quote a path for inclusion in a remote shell command.
pub(crate) fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// Quote a path while leaving `*`/`?` live for the remote shell.
///
/// Literal runs are single-quoted; the glob characters themselves stay
/// bare so the remote side expands them.
pub(crate) fn shell_quote_wildcard(path: &str) -> String {
    let mut quoted = String::new();
    let mut literal = String::new();
    for ch in path.chars() {
        if ch == '*' || ch == '?' {
            if !literal.is_empty() {
                quoted.push_str(&shell_quote(&literal));
                literal.clear();
            }
            quoted.push(ch);
        } else {
            literal.push(ch);
        }
    }
    if !literal.is_empty() {
        quoted.push_str(&shell_quote(&literal));
    }
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    mod wildcards {
        use super::*;

        #[test]
        fn test_has_wildcard() {
            assert!(has_wildcard("a.*"));
            assert!(has_wildcard("file?.txt"));
            assert!(!has_wildcard("plain/file.txt"));
        }

        #[test]
        fn test_translation_matches_like_a_glob() {
            let re = wildcard_to_regex("a.*").unwrap();
            assert!(re.is_match("a.txt"));
            assert!(re.is_match("a.log"));
            assert!(!re.is_match("b.txt"));
            assert!(!re.is_match("xa.txt"));
        }

        #[test]
        fn test_question_mark_matches_one_char() {
            let re = wildcard_to_regex("f?.bin").unwrap();
            assert!(re.is_match("f1.bin"));
            assert!(!re.is_match("f12.bin"));
        }

        #[test]
        fn test_regex_metacharacters_are_literal() {
            let re = wildcard_to_regex("a+b.txt").unwrap();
            assert!(re.is_match("a+b.txt"));
            assert!(!re.is_match("aab.txt"));
        }
    }

    mod expansion {
        use super::*;

        #[test]
        fn test_expands_last_segment_only() {
            let dir = tempfile::tempdir().unwrap();
            for name in ["a.txt", "b.txt", "a.log"] {
                File::create(dir.path().join(name)).unwrap();
            }

            let pattern = dir.path().join("a.*");
            let mut matches = expand_local(&pattern.to_string_lossy()).unwrap();
            matches.sort();

            let names: Vec<_> = matches
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
                .collect();
            assert_eq!(names, vec!["a.log", "a.txt"]);
        }

        #[test]
        fn test_plain_path_passes_through() {
            let matches = expand_local("/tmp/no/such/file.txt").unwrap();
            assert_eq!(matches, vec![PathBuf::from("/tmp/no/such/file.txt")]);
        }

        #[test]
        fn test_no_matches_is_empty() {
            let dir = tempfile::tempdir().unwrap();
            let pattern = dir.path().join("*.rs");
            assert!(expand_local(&pattern.to_string_lossy()).unwrap().is_empty());
        }
    }

    mod delete_guards {
        use super::*;

        #[test]
        fn test_rejects_roots_and_dots() {
            assert!(validate_delete_path("/", false).is_err());
            assert!(validate_delete_path("", false).is_err());
            assert!(validate_delete_path(".", false).is_err());
            assert!(validate_delete_path("..", false).is_err());
            assert!(validate_delete_path("/tmp/..", false).is_err());
            assert!(validate_delete_path("///", false).is_err());
        }

        #[test]
        fn test_rejects_wildcard_without_permission() {
            assert!(validate_delete_path("/tmp/work/*.log", false).is_err());
        }

        #[test]
        fn test_allows_scoped_wildcard_when_permitted() {
            assert!(validate_delete_path("/tmp/work/*.log", true).is_ok());
        }

        #[test]
        fn test_rejects_unscoped_wildcard_even_when_permitted() {
            assert!(validate_delete_path("*", true).is_err());
            assert!(validate_delete_path("/*", true).is_err());
        }

        #[test]
        fn test_allows_ordinary_paths() {
            assert!(validate_delete_path("/tmp/work/out.log", false).is_ok());
            assert!(validate_delete_path("relative/file", false).is_ok());
        }
    }

    mod quoting {
        use super::*;

        #[test]
        fn test_plain_path() {
            assert_eq!(shell_quote("/tmp/file"), "'/tmp/file'");
        }

        #[test]
        fn test_embedded_single_quote() {
            assert_eq!(shell_quote("it's"), r"'it'\''s'");
        }

        #[test]
        fn test_wildcard_quoting_keeps_globs_live() {
            assert_eq!(shell_quote_wildcard("/tmp/a.*"), "'/tmp/a.'*");
            assert_eq!(shell_quote_wildcard("/tmp/f?.bin"), "'/tmp/f'?'.bin'");
            assert_eq!(shell_quote_wildcard("/tmp/plain"), "'/tmp/plain'");
            assert_eq!(shell_quote_wildcard("*"), "*");
        }
    }
}
