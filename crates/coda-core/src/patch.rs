//! The textual patch engine (C2, spec §4.2). A pure function of patch text
//! plus a filesystem facade (§3's ownership note: "the Patch engine owns no
//! state"). Tolerant of the common model mistakes the normalization
//! pre-pass and fuzzy context resolution are built to absorb.

use std::collections::HashSet;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Data model (§3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub orig_index: usize,
    pub del_lines: Vec<String>,
    pub ins_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    Add { content: String },
    Delete,
    Update {
        chunks: Vec<Chunk>,
        move_path: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub actions: Vec<(String, PatchAction)>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DiffError {
    #[error("patch is missing the `*** End Patch` marker")]
    MissingEndPatch,
    #[error("duplicate path in patch: {0}")]
    DuplicatePath(String),
    #[error("cannot delete or update a file that does not exist: {0}")]
    MissingFile(String),
    #[error("cannot add a file that already exists: {0}")]
    FileExists(String),
    #[error("unrecognized line in patch body: {0:?}")]
    UnknownLine(String),
    #[error("could not locate context for hunk:\n{0}")]
    InvalidContext(String),
    #[error("could not locate end-of-file context for hunk:\n{0}")]
    InvalidEOFContext(String),
    #[error("patch body is too short to contain any file actions")]
    PatchTooShort,
    #[error("patch is missing `*** Begin Patch`/`*** Update|Add|Delete File:` markers")]
    MissingMarkers,
    #[error("patch paths must be repository-relative, not absolute: {0}")]
    AbsolutePath(String),
    #[error("io error: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Normalization pre-pass (§4.2)
// ---------------------------------------------------------------------------

/// Decode HTML entities, strip a surrounding markdown fence, unescape
/// literal `\n`, rewrite `--- a/<p>`/`+++ b/<p>` into `*** Update File: <p>`,
/// left-trim `@@` lines, and wrap a bare file-action body in the
/// `*** Begin/End Patch` envelope if it's missing.
pub fn normalize(text: &str) -> String {
    let mut s = text.to_string();

    for (from, to) in [
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("\\u003c", "<"),
        ("\\u003e", ">"),
        ("&amp;", "&"),
    ] {
        s = s.replace(from, to);
    }

    let trimmed = s.trim();
    if trimmed.len() > 6 && trimmed.starts_with("```") && trimmed.ends_with("```") {
        let inner = &trimmed[3..trimmed.len() - 3];
        let inner = match inner.find('\n') {
            Some(nl) if !inner[..nl].trim().is_empty() && !inner[..nl].trim().contains(' ') => {
                &inner[nl + 1..]
            }
            _ => inner,
        };
        s = inner.to_string();
    }

    s = s.replace("\\n", "\n");

    let mut lines: Vec<String> = s.lines().map(str::to_string).collect();
    let mut i = 0;
    while i < lines.len() {
        if let Some(rest) = lines[i].strip_prefix("--- a/") {
            let rest = rest.to_string();
            if i + 1 < lines.len() && lines[i + 1].starts_with("+++ b/") {
                lines[i] = format!("*** Update File: {rest}");
                lines.remove(i + 1);
            }
        }
        i += 1;
    }
    for line in &mut lines {
        if line.trim_start().starts_with("@@") {
            *line = line.trim_start().to_string();
        }
    }
    let mut s = lines.join("\n");

    let has_envelope = s.contains("*** Begin Patch");
    let has_markers = s.contains("*** Update File:")
        || s.contains("*** Add File:")
        || s.contains("*** Delete File:");
    if !has_envelope && has_markers {
        s = format!("*** Begin Patch\n{s}\n*** End Patch");
    }

    s
}

// ---------------------------------------------------------------------------
// Raw parsing (single pass over normalized lines)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RawLine {
    Keep(String),
    Del(String),
    Ins(String),
    /// No leading +/-/space marker; resolved against new-file-ness later.
    Ambiguous(String),
}

#[derive(Debug, Clone, Default)]
struct RawHunk {
    anchor: Option<String>,
    lines: Vec<RawLine>,
    is_eof: bool,
}

#[derive(Debug, Clone)]
enum RawAction {
    Add(Vec<String>),
    Delete,
    Update {
        hunks: Vec<RawHunk>,
        move_path: Option<String>,
    },
}

fn check_path(path: &str) -> Result<(), DiffError> {
    if path.starts_with('/') || PathBuf::from(path).is_absolute() {
        return Err(DiffError::AbsolutePath(path.to_string()));
    }
    Ok(())
}

fn classify_line(line: &str) -> RawLine {
    match line.chars().next() {
        Some('+') => RawLine::Ins(line.get(1..).unwrap_or("").to_string()),
        Some('-') => RawLine::Del(line.get(1..).unwrap_or("").to_string()),
        Some(' ') => RawLine::Keep(line.get(1..).unwrap_or("").to_string()),
        _ => RawLine::Ambiguous(line.to_string()),
    }
}

fn parse_hunks(lines: &[&str], mut i: usize) -> (Vec<RawHunk>, usize) {
    let mut hunks = Vec::new();
    let mut current: Option<RawHunk> = None;

    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("*** ") {
            break;
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            let anchor = trimmed.trim_start_matches("@@").trim();
            current = Some(RawHunk {
                anchor: if anchor.is_empty() {
                    None
                } else {
                    Some(anchor.to_string())
                },
                ..Default::default()
            });
            i += 1;
            continue;
        }
        if trimmed == "*** End Of File" {
            if let Some(h) = current.as_mut() {
                h.is_eof = true;
            }
            i += 1;
            continue;
        }
        if line.is_empty() {
            // blank line inside a hunk body is a context line for an empty line
            current.get_or_insert_with(RawHunk::default)
                .lines
                .push(RawLine::Keep(String::new()));
            i += 1;
            continue;
        }
        current
            .get_or_insert_with(RawHunk::default)
            .lines
            .push(classify_line(line));
        i += 1;
    }
    if let Some(h) = current.take() {
        hunks.push(h);
    }
    (hunks, i)
}

fn parse_raw(text: &str) -> Result<Vec<(String, RawAction)>, DiffError> {
    let normalized = normalize(text);
    let lines: Vec<&str> = normalized.lines().collect();

    let Some(begin_idx) = lines.iter().position(|l| l.trim() == "*** Begin Patch") else {
        return Err(DiffError::MissingMarkers);
    };

    let mut i = begin_idx + 1;
    let mut actions: Vec<(String, RawAction)> = Vec::new();
    let mut seen_paths: HashSet<String> = HashSet::new();
    let mut found_end = false;

    while i < lines.len() {
        let line = lines[i];
        if line.trim() == "*** End Patch" {
            found_end = true;
            i += 1;
            break;
        } else if let Some(path) = line.strip_prefix("*** Update File: ") {
            let path = path.trim().to_string();
            check_path(&path)?;
            if !seen_paths.insert(path.clone()) {
                return Err(DiffError::DuplicatePath(path));
            }
            i += 1;
            let mut move_path = None;
            if i < lines.len()
                && let Some(mv) = lines[i].strip_prefix("*** Move to: ")
            {
                move_path = Some(mv.trim().to_string());
                i += 1;
            }
            let (hunks, next_i) = parse_hunks(&lines, i);
            i = next_i;
            actions.push((path, RawAction::Update { hunks, move_path }));
        } else if let Some(path) = line.strip_prefix("*** Add File: ") {
            let path = path.trim().to_string();
            check_path(&path)?;
            if !seen_paths.insert(path.clone()) {
                return Err(DiffError::DuplicatePath(path));
            }
            i += 1;
            let mut content_lines = Vec::new();
            while i < lines.len() && !lines[i].starts_with("*** ") {
                let l = lines[i];
                content_lines.push(l.strip_prefix('+').unwrap_or(l).to_string());
                i += 1;
            }
            actions.push((path, RawAction::Add(content_lines)));
        } else if let Some(path) = line.strip_prefix("*** Delete File: ") {
            let path = path.trim().to_string();
            check_path(&path)?;
            if !seen_paths.insert(path.clone()) {
                return Err(DiffError::DuplicatePath(path));
            }
            i += 1;
            actions.push((path, RawAction::Delete));
        } else if line.trim().is_empty() {
            i += 1;
        } else {
            return Err(DiffError::UnknownLine(line.to_string()));
        }
    }

    if !found_end {
        return Err(DiffError::MissingEndPatch);
    }
    if actions.is_empty() {
        return Err(DiffError::PatchTooShort);
    }

    Ok(actions)
}

// ---------------------------------------------------------------------------
// Line utilities
// ---------------------------------------------------------------------------

fn split_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (Vec::new(), false);
    }
    let trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    if trailing_newline {
        lines.pop();
    }
    (lines, trailing_newline)
}

fn render_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut s = lines.join("\n");
    if trailing_newline && !lines.is_empty() {
        s.push('\n');
    }
    s
}

fn render_hunk_body(hunk: &RawHunk) -> String {
    hunk.lines
        .iter()
        .map(|l| match l {
            RawLine::Keep(s) => format!(" {s}"),
            RawLine::Del(s) => format!("-{s}"),
            RawLine::Ins(s) => format!("+{s}"),
            RawLine::Ambiguous(s) => s.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Context resolution (§4.2)
// ---------------------------------------------------------------------------

fn lines_equal_exact(a: &str, b: &str) -> bool {
    a == b
}
fn lines_equal_right_trim(a: &str, b: &str) -> bool {
    a.trim_end() == b.trim_end()
}
fn lines_equal_full_trim(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

/// Try every position in `[from, file_lines.len() - needle.len()]` with one
/// comparison tier. Returns the first (leftmost) match.
fn scan_with(
    file_lines: &[String],
    needle: &[String],
    from: usize,
    cmp: fn(&str, &str) -> bool,
) -> Option<usize> {
    if needle.len() > file_lines.len() {
        return None;
    }
    let max_start = file_lines.len() - needle.len();
    if from > max_start {
        return None;
    }
    (from..=max_start).find(|&start| (0..needle.len()).all(|k| cmp(&file_lines[start + k], &needle[k])))
}

/// Exact, then right-trimmed (+1 fuzz), then fully-trimmed (+100 fuzz).
fn scan(file_lines: &[String], needle: &[String], from: usize) -> Option<(usize, u32)> {
    if let Some(start) = scan_with(file_lines, needle, from, lines_equal_exact) {
        return Some((start, 0));
    }
    if let Some(start) = scan_with(file_lines, needle, from, lines_equal_right_trim) {
        return Some((start, 1));
    }
    if let Some(start) = scan_with(file_lines, needle, from, lines_equal_full_trim) {
        return Some((start, 100));
    }
    None
}

fn match_at(file_lines: &[String], needle: &[String], start: usize) -> Option<u32> {
    if start + needle.len() > file_lines.len() {
        return None;
    }
    if (0..needle.len()).all(|k| lines_equal_exact(&file_lines[start + k], &needle[k])) {
        return Some(0);
    }
    if (0..needle.len()).all(|k| lines_equal_right_trim(&file_lines[start + k], &needle[k])) {
        return Some(1);
    }
    if (0..needle.len()).all(|k| lines_equal_full_trim(&file_lines[start + k], &needle[k])) {
        return Some(100);
    }
    None
}

/// Locate `needle` (the hunk's keep+del lines, in file order) in
/// `file_lines`. EOF hunks try the fixed tail position first, falling back
/// to a forward scan with a +10000 fuzz penalty (§4.2).
fn locate(file_lines: &[String], needle: &[String], from: usize, is_eof: bool) -> Option<(usize, u32)> {
    if needle.is_empty() {
        return Some((from, 0));
    }

    if is_eof {
        let fixed_start = file_lines.len().saturating_sub(needle.len());
        if let Some(fuzz) = match_at(file_lines, needle, fixed_start) {
            return Some((fixed_start, fuzz));
        }
        return scan(file_lines, needle, from).map(|(start, fuzz)| (start, fuzz + 10_000));
    }

    scan(file_lines, needle, from)
}

fn resolve_update(
    hunks: Vec<RawHunk>,
    move_path: Option<String>,
    original: &str,
) -> Result<(PatchAction, u32), DiffError> {
    let (file_lines, _trailing_newline) = split_lines(original);
    let mut cursor = 0usize;
    let mut chunks = Vec::new();
    let mut total_fuzz = 0u32;

    for raw_hunk in &hunks {
        let is_new_file = file_lines.is_empty()
            || raw_hunk
                .anchor
                .as_deref()
                .is_some_and(|a| a.contains("-0,0") || a.contains("-1,1"));

        let mut old_lines: Vec<String> = Vec::new();
        let mut del_lines: Vec<String> = Vec::new();
        let mut ins_lines: Vec<String> = Vec::new();
        let mut split_point: Option<usize> = None;

        for raw_line in &raw_hunk.lines {
            match raw_line {
                RawLine::Keep(s) => old_lines.push(s.clone()),
                RawLine::Del(s) => {
                    split_point.get_or_insert(old_lines.len());
                    old_lines.push(s.clone());
                    del_lines.push(s.clone());
                }
                RawLine::Ins(s) => {
                    split_point.get_or_insert(old_lines.len());
                    ins_lines.push(s.clone());
                }
                RawLine::Ambiguous(s) => {
                    if is_new_file {
                        split_point.get_or_insert(old_lines.len());
                        ins_lines.push(s.clone());
                    } else {
                        old_lines.push(s.clone());
                    }
                }
            }
        }
        let split_point = split_point.unwrap_or(old_lines.len());

        let (match_start, fuzz) = locate(&file_lines, &old_lines, cursor, raw_hunk.is_eof)
            .ok_or_else(|| {
                let body = render_hunk_body(raw_hunk);
                if raw_hunk.is_eof {
                    DiffError::InvalidEOFContext(body)
                } else {
                    DiffError::InvalidContext(body)
                }
            })?;
        total_fuzz += fuzz;

        let orig_index = match_start + split_point;
        cursor = orig_index + del_lines.len();
        chunks.push(Chunk {
            orig_index,
            del_lines,
            ins_lines,
        });
    }

    Ok((PatchAction::Update { chunks, move_path }, total_fuzz))
}

// ---------------------------------------------------------------------------
// Parse + resolve
// ---------------------------------------------------------------------------

/// Parse `text` into a [`Patch`], resolving Update hunks' context against
/// `original_lookup` (queried per-path). Returns the patch and the total
/// accumulated fuzz (§3 invariant 2: deterministic given the same text and
/// lookup results).
pub fn parse_and_resolve(
    text: &str,
    original_lookup: impl Fn(&str) -> Option<String>,
) -> Result<(Patch, u32), DiffError> {
    let raw_actions = parse_raw(text)?;
    let mut actions = Vec::new();
    let mut total_fuzz = 0u32;

    for (path, raw) in raw_actions {
        match raw {
            RawAction::Add(lines) => {
                let content = render_lines(&lines, true);
                actions.push((path, PatchAction::Add { content }));
            }
            RawAction::Delete => actions.push((path, PatchAction::Delete)),
            RawAction::Update { hunks, move_path } => {
                let original = original_lookup(&path).unwrap_or_default();
                let (action, fuzz) = resolve_update(hunks, move_path, &original)?;
                total_fuzz += fuzz;
                actions.push((path, action));
            }
        }
    }

    Ok((Patch { actions }, total_fuzz))
}

/// Rebuild a file's new content from its resolved Update chunks (§4.2
/// "Application").
pub fn apply_update_chunks(original: &str, chunks: &[Chunk]) -> String {
    let (file_lines, trailing_newline) = split_lines(original);
    let mut new_lines = Vec::new();
    let mut cursor = 0usize;
    for chunk in chunks {
        new_lines.extend_from_slice(&file_lines[cursor..chunk.orig_index]);
        new_lines.extend(chunk.ins_lines.iter().cloned());
        cursor = chunk.orig_index + chunk.del_lines.len();
    }
    new_lines.extend_from_slice(&file_lines[cursor..]);
    render_lines(&new_lines, trailing_newline || !chunks.is_empty())
}

// ---------------------------------------------------------------------------
// Filesystem facade (§3: "a pure function of input text plus a filesystem
// facade")
// ---------------------------------------------------------------------------

pub trait PatchFs {
    fn read_to_string(&self, path: &str) -> Option<String>;
    fn exists(&self, path: &str) -> bool;
    fn write(&mut self, path: &str, content: &str) -> std::io::Result<()>;
    fn remove(&mut self, path: &str) -> std::io::Result<()>;
}

/// Real-filesystem [`PatchFs`] rooted at a working directory.
pub struct FsPatchFs {
    pub root: PathBuf,
}

impl FsPatchFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PatchFs for FsPatchFs {
    fn read_to_string(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(path)).ok()
    }

    fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }

    fn write(&mut self, path: &str, content: &str) -> std::io::Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, content)
    }

    fn remove(&mut self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.root.join(path))
    }
}

fn io_err(path: &str, e: std::io::Error) -> DiffError {
    DiffError::Io(format!("{path}: {e}"))
}

fn validate(patch: &Patch, fs: &dyn PatchFs) -> Result<(), DiffError> {
    for (path, action) in &patch.actions {
        match action {
            PatchAction::Add { .. } => {
                if fs.exists(path) {
                    return Err(DiffError::FileExists(path.clone()));
                }
            }
            PatchAction::Delete | PatchAction::Update { .. } => {
                if !fs.exists(path) {
                    return Err(DiffError::MissingFile(path.clone()));
                }
            }
        }
    }
    Ok(())
}

fn write_all(patch: &Patch, fs: &mut dyn PatchFs) -> Result<(), DiffError> {
    for (path, action) in &patch.actions {
        match action {
            PatchAction::Add { content } => {
                fs.write(path, content).map_err(|e| io_err(path, e))?;
            }
            PatchAction::Delete => {
                fs.remove(path).map_err(|e| io_err(path, e))?;
            }
            PatchAction::Update { chunks, move_path } => {
                let original = fs.read_to_string(path).unwrap_or_default();
                let new_content = apply_update_chunks(&original, chunks);
                match move_path {
                    Some(new_path) => {
                        fs.write(new_path, &new_content).map_err(|e| io_err(new_path, e))?;
                        fs.remove(path).map_err(|e| io_err(path, e))?;
                    }
                    None => fs.write(path, &new_content).map_err(|e| io_err(path, e))?,
                }
            }
        }
    }
    Ok(())
}

/// Parse, resolve, validate, and apply a patch against `fs` in one shot.
/// Errors abort before any file is touched — partial application never
/// happens (§4.2 "Failure modes").
pub fn apply_patch_text(text: &str, fs: &mut dyn PatchFs) -> Result<u32, DiffError> {
    let (patch, fuzz) = parse_and_resolve(text, |p| fs.read_to_string(p))?;
    validate(&patch, fs)?;
    write_all(&patch, fs)?;
    Ok(fuzz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct MemFs(HashMap<String, String>);

    impl PatchFs for MemFs {
        fn read_to_string(&self, path: &str) -> Option<String> {
            self.0.get(path).cloned()
        }
        fn exists(&self, path: &str) -> bool {
            self.0.contains_key(path)
        }
        fn write(&mut self, path: &str, content: &str) -> std::io::Result<()> {
            self.0.insert(path.to_string(), content.to_string());
            Ok(())
        }
        fn remove(&mut self, path: &str) -> std::io::Result<()> {
            self.0
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path))
        }
    }

    #[test]
    fn normalize_decodes_html_entities() {
        let out = normalize("*** Begin Patch\n*** Update File: a\n@@\n-x &lt;y&gt;\n+x <y>\n*** End Patch");
        assert!(out.contains("-x <y>"));
    }

    #[test]
    fn normalize_unescapes_newlines_and_wraps_bare_body() {
        let out = normalize("*** Add File: a.txt\\n+hello");
        assert_eq!(out, "*** Begin Patch\n*** Add File: a.txt\n+hello\n*** End Patch");
    }

    #[test]
    fn s7_patch_on_new_file() {
        let text = "*** Begin Patch\n*** Update File: new_file.txt\n@@ -0,0 +1 @@\n+New Content\n*** End Patch";
        let mut fs = MemFs(HashMap::new());
        fs.0.insert("new_file.txt".to_string(), String::new());
        apply_patch_text(text, &mut fs).unwrap();
        assert_eq!(fs.0.get("new_file.txt").unwrap(), "New Content");
    }

    #[test]
    fn add_file_creates_new_content() {
        let text = "*** Begin Patch\n*** Add File: hello.txt\n+line one\n+line two\n*** End Patch";
        let mut fs = MemFs(HashMap::new());
        apply_patch_text(text, &mut fs).unwrap();
        assert_eq!(fs.0.get("hello.txt").unwrap(), "line one\nline two\n");
    }

    #[test]
    fn update_replaces_context_matched_lines() {
        let mut fs = MemFs(HashMap::new());
        fs.0.insert("a.rs".to_string(), "fn main() {\n    old();\n}\n".to_string());
        let text = "*** Begin Patch\n*** Update File: a.rs\n@@\n fn main() {\n-    old();\n+    new();\n }\n*** End Patch";
        apply_patch_text(text, &mut fs).unwrap();
        assert_eq!(fs.0.get("a.rs").unwrap(), "fn main() {\n    new();\n}\n");
    }

    #[test]
    fn delete_file_removes_it() {
        let mut fs = MemFs(HashMap::new());
        fs.0.insert("gone.txt".to_string(), "bye".to_string());
        let text = "*** Begin Patch\n*** Delete File: gone.txt\n*** End Patch";
        apply_patch_text(text, &mut fs).unwrap();
        assert!(!fs.0.contains_key("gone.txt"));
    }

    #[test]
    fn move_to_renames_file() {
        let mut fs = MemFs(HashMap::new());
        fs.0.insert("old.rs".to_string(), "x\n".to_string());
        let text =
            "*** Begin Patch\n*** Update File: old.rs\n*** Move to: new.rs\n@@\n-x\n+y\n*** End Patch";
        apply_patch_text(text, &mut fs).unwrap();
        assert!(!fs.0.contains_key("old.rs"));
        assert_eq!(fs.0.get("new.rs").unwrap(), "y\n");
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let text = "*** Begin Patch\n*** Delete File: a\n*** Delete File: a\n*** End Patch";
        let mut fs = MemFs(HashMap::from([("a".to_string(), "x".to_string())]));
        assert!(matches!(
            apply_patch_text(text, &mut fs),
            Err(DiffError::DuplicatePath(_))
        ));
    }

    #[test]
    fn delete_missing_file_is_rejected() {
        let text = "*** Begin Patch\n*** Delete File: missing.txt\n*** End Patch";
        let mut fs = MemFs(HashMap::new());
        assert!(matches!(
            apply_patch_text(text, &mut fs),
            Err(DiffError::MissingFile(_))
        ));
    }

    #[test]
    fn add_existing_file_is_rejected() {
        let text = "*** Begin Patch\n*** Add File: a.txt\n+x\n*** End Patch";
        let mut fs = MemFs(HashMap::from([("a.txt".to_string(), "already here".to_string())]));
        assert!(matches!(
            apply_patch_text(text, &mut fs),
            Err(DiffError::FileExists(_))
        ));
    }

    #[test]
    fn absolute_path_is_rejected() {
        let text = "*** Begin Patch\n*** Add File: /etc/passwd\n+x\n*** End Patch";
        let mut fs = MemFs(HashMap::new());
        assert!(matches!(
            apply_patch_text(text, &mut fs),
            Err(DiffError::AbsolutePath(_))
        ));
    }

    #[test]
    fn missing_envelope_is_rejected() {
        let text = "just some text, no markers at all";
        let mut fs = MemFs(HashMap::new());
        assert!(matches!(
            apply_patch_text(text, &mut fs),
            Err(DiffError::MissingMarkers)
        ));
    }

    #[test]
    fn missing_end_patch_is_rejected() {
        let text = "*** Begin Patch\n*** Delete File: a";
        let mut fs = MemFs(HashMap::from([("a".to_string(), "x".to_string())]));
        assert!(matches!(
            apply_patch_text(text, &mut fs),
            Err(DiffError::MissingEndPatch)
        ));
    }

    #[test]
    fn invalid_context_is_reported() {
        let mut fs = MemFs(HashMap::new());
        fs.0.insert("a.rs".to_string(), "one\ntwo\nthree\n".to_string());
        let text = "*** Begin Patch\n*** Update File: a.rs\n@@\n-nonexistent\n+replacement\n*** End Patch";
        assert!(matches!(
            apply_patch_text(text, &mut fs),
            Err(DiffError::InvalidContext(_))
        ));
    }

    #[test]
    fn fuzzy_context_matches_with_trailing_whitespace() {
        let mut fs = MemFs(HashMap::new());
        fs.0.insert("a.rs".to_string(), "one  \ntwo\nthree\n".to_string());
        let text = "*** Begin Patch\n*** Update File: a.rs\n@@\n-one\n+uno\n*** End Patch";
        let fuzz = apply_patch_text(text, &mut fs).unwrap();
        assert_eq!(fuzz, 1);
        assert_eq!(fs.0.get("a.rs").unwrap(), "uno\ntwo\nthree\n");
    }

    /// Invariant 2: same patch text + same input file map ⇒ same output
    /// file map and fuzz count.
    #[test]
    fn invariant_parse_is_deterministic() {
        let text = "*** Begin Patch\n*** Update File: a.rs\n@@\n-one\n+uno\n*** End Patch";
        let lookup = |_: &str| Some("one\ntwo\n".to_string());
        let (patch1, fuzz1) = parse_and_resolve(text, lookup).unwrap();
        let (patch2, fuzz2) = parse_and_resolve(text, lookup).unwrap();
        assert_eq!(fuzz1, fuzz2);
        assert_eq!(patch1, patch2);
    }

    #[test]
    fn eof_hunk_matches_tail_of_file_first() {
        let mut fs = MemFs(HashMap::new());
        fs.0.insert("a.txt".to_string(), "one\ntwo\n".to_string());
        let text = "*** Begin Patch\n*** Update File: a.txt\n@@\n two\n*** End Of File\n+three\n*** End Patch";
        apply_patch_text(text, &mut fs).unwrap();
        assert_eq!(fs.0.get("a.txt").unwrap(), "one\ntwo\nthree\n");
    }
}
