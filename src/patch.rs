//! Region patching for line-oriented configuration files
//!
//! A region starts at the first line matching a begin marker and runs
//! through the first later line matching an end marker (the terminator is
//! part of the region). The whole region is replaced; nothing outside it is
//! touched. With no end marker the region runs to end of file.
//!
//! Patching is a replace, not an append, so applying the same replacement
//! twice leaves the file exactly as one application did.

use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::ConfigPatchError;

/// Begin marker of the salt `file_roots` section, commented or not
pub const FILE_ROOTS_BEGIN: &str = r"^#?file_roots:";

/// A blank line ends a section
pub const BLANK_LINE: &str = r"^$";

/// Half-open line span `[begin, end)` of a region, terminator included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub begin: usize,
    pub end: usize,
}

/// Locate the region in `lines`
pub fn find_region(lines: &[String], begin: &Regex, end: &Regex) -> Option<Region> {
    let start = lines.iter().position(|line| begin.is_match(line))?;
    let stop = lines[start + 1..]
        .iter()
        .position(|line| end.is_match(line))
        .map(|offset| start + 1 + offset + 1)
        .unwrap_or(lines.len());

    Some(Region {
        begin: start,
        end: stop,
    })
}

/// Replace the region in `lines` with `replacement`
pub fn replace_region(lines: &[String], region: Region, replacement: &[String]) -> Vec<String> {
    let mut patched = Vec::with_capacity(lines.len() - (region.end - region.begin) + replacement.len());
    patched.extend_from_slice(&lines[..region.begin]);
    patched.extend_from_slice(replacement);
    patched.extend_from_slice(&lines[region.end..]);
    patched
}

/// Rewrite the region of `path` delimited by `begin_pattern`/`end_pattern`.
///
/// The original is copied to `<path>.bak` first, and the new content is
/// written to a sibling temp file and renamed over the original.
pub fn patch_region(
    path: &Path,
    begin_pattern: &str,
    end_pattern: &str,
    replacement: &[String],
) -> Result<(), ConfigPatchError> {
    let begin = compile(begin_pattern)?;
    let end = compile(end_pattern)?;

    let backup = backup_path(path);
    fs::copy(path, &backup).map_err(|source| ConfigPatchError::Backup {
        path: backup.clone(),
        source,
    })?;
    debug!("Backed up {} to {}", path.display(), backup.display());

    let content = fs::read_to_string(path).map_err(|source| ConfigPatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let lines: Vec<String> = content.lines().map(str::to_string).collect();

    let region =
        find_region(&lines, &begin, &end).ok_or_else(|| ConfigPatchError::RegionNotFound {
            path: path.to_path_buf(),
            pattern: begin_pattern.to_string(),
        })?;
    if region.end == lines.len() {
        debug!("No end marker after line {}, region runs to end of file", region.begin + 1);
    }

    let eol = line_ending(&content);
    let patched = replace_region(&lines, region, replacement);
    let mut output = patched.join(eol);
    if content.ends_with('\n') || content.is_empty() {
        output.push_str(eol);
    }

    write_atomic(path, output.as_bytes()).map_err(|source| ConfigPatchError::WriteFailure {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        "Patched lines {}..{} of {}",
        region.begin + 1,
        region.end,
        path.display()
    );
    Ok(())
}

/// Line terminator used by `content`; CRLF when its first line ends that way
fn line_ending(content: &str) -> &'static str {
    match content.find('\n') {
        Some(i) if content[..i].ends_with('\r') => "\r\n",
        _ => "\n",
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigPatchError> {
    Regex::new(pattern).map_err(|e| ConfigPatchError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    fn markers() -> (Regex, Regex) {
        (
            Regex::new(FILE_ROOTS_BEGIN).unwrap(),
            Regex::new(BLANK_LINE).unwrap(),
        )
    }

    #[test]
    fn test_find_region_includes_terminator() {
        let (begin, end) = markers();
        let doc = lines("a\n#file_roots:\n#  base:\n\nb");
        assert_eq!(
            find_region(&doc, &begin, &end),
            Some(Region { begin: 1, end: 4 })
        );
    }

    #[test]
    fn test_find_region_first_begin_wins() {
        let (begin, end) = markers();
        let doc = lines("file_roots:\n  x\n\nfile_roots:\n  y\n");
        assert_eq!(
            find_region(&doc, &begin, &end),
            Some(Region { begin: 0, end: 3 })
        );
    }

    #[test]
    fn test_find_region_at_line_zero() {
        let (begin, end) = markers();
        let doc = lines("file_roots:\n\nrest");
        assert_eq!(
            find_region(&doc, &begin, &end),
            Some(Region { begin: 0, end: 2 })
        );
    }

    #[test]
    fn test_find_region_runs_to_eof() {
        let (begin, end) = markers();
        let doc = lines("a\nfile_roots:\n  base:\n    - /srv");
        assert_eq!(
            find_region(&doc, &begin, &end),
            Some(Region { begin: 1, end: 4 })
        );
    }

    #[test]
    fn test_find_region_missing() {
        let (begin, end) = markers();
        let doc = lines("pillar_roots:\n\n");
        assert_eq!(find_region(&doc, &begin, &end), None);
    }

    #[test]
    fn test_indented_marker_is_not_a_begin() {
        let (begin, end) = markers();
        let doc = lines("  file_roots:\n");
        assert_eq!(find_region(&doc, &begin, &end), None);
    }

    #[test]
    fn test_replace_region() {
        let doc = lines("a\nold\n\nb");
        let patched = replace_region(&doc, Region { begin: 1, end: 3 }, &lines("new\n"));
        assert_eq!(patched, vec!["a", "new", "b"]);
    }

    #[test]
    fn test_invalid_pattern() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("minion");
        fs::write(&path, "file_roots:\n").unwrap();
        let err = patch_region(&path, "(", BLANK_LINE, &[]).unwrap_err();
        assert!(matches!(err, ConfigPatchError::InvalidPattern { .. }));
    }

    #[test]
    fn test_line_ending() {
        assert_eq!(line_ending("a\r\nb\r\n"), "\r\n");
        assert_eq!(line_ending("a\nb\r\n"), "\n");
        assert_eq!(line_ending("no newline"), "\n");
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/etc/salt/minion")),
            PathBuf::from("/etc/salt/minion.bak")
        );
    }
}
