use std::time::Instant;

use coda_llm::{Describe, Property, Schema};
use serde::Deserialize;

use crate::handler::finish;
use crate::tool::Tool;

fn describe_path(description: &str) -> Schema {
    Schema::Object {
        description: Some(description.to_string()),
        properties: vec![Property {
            name: "path".into(),
            schema: Schema::String {
                description: Some("File path, relative to the working directory".into()),
                enumeration: None,
            },
        }],
        required: vec!["path".into()],
    }
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct ReadFileInput {
    pub path: String,
}

impl Describe for ReadFileInput {
    fn describe() -> Schema {
        describe_path("Read a file's full contents")
    }
}

#[derive(Clone)]
pub struct ReadFileTool {
    pub(crate) cwd: std::path::PathBuf,
}

impl ReadFileTool {
    pub fn new(cwd: std::path::PathBuf) -> Self {
        Self { cwd }
    }
}

impl Tool for ReadFileTool {
    type Input = ReadFileInput;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's full contents."
    }

    async fn call(&self, input: ReadFileInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let path = self.cwd.join(&input.path);
        let result = match tokio::fs::read_to_string(&path).await {
            Ok(content) => finish(start, content, 0),
            Err(e) => finish(start, format!("{}: {e}", path.display()), 1),
        };
        Ok(result.to_content())
    }
}

// ---------------------------------------------------------------------------
// read_file_lines
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct ReadFileLinesInput {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl Describe for ReadFileLinesInput {
    fn describe() -> Schema {
        Schema::Object {
            description: Some("Read an inclusive 1-based line range from a file".into()),
            properties: vec![
                Property {
                    name: "path".into(),
                    schema: Schema::String {
                        description: Some("File path, relative to the working directory".into()),
                        enumeration: None,
                    },
                },
                Property {
                    name: "start_line".into(),
                    schema: Schema::Integer {
                        description: Some("First line to read (1-based, inclusive)".into()),
                    },
                },
                Property {
                    name: "end_line".into(),
                    schema: Schema::Integer {
                        description: Some("Last line to read (1-based, inclusive)".into()),
                    },
                },
            ],
            required: vec!["path".into(), "start_line".into(), "end_line".into()],
        }
    }
}

#[derive(Clone)]
pub struct ReadFileLinesTool {
    pub(crate) cwd: std::path::PathBuf,
}

impl ReadFileLinesTool {
    pub fn new(cwd: std::path::PathBuf) -> Self {
        Self { cwd }
    }
}

impl Tool for ReadFileLinesTool {
    type Input = ReadFileLinesInput;

    fn name(&self) -> &str {
        "read_file_lines"
    }

    fn description(&self) -> &str {
        "Read an inclusive 1-based line range from a file."
    }

    async fn call(&self, input: ReadFileLinesInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let path = self.cwd.join(&input.path);
        let result = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let start_idx = input.start_line.saturating_sub(1) as usize;
                let end_idx = input.end_line as usize;
                let lines: Vec<&str> = content.lines().collect();
                let slice = lines
                    .get(start_idx..end_idx.min(lines.len()))
                    .unwrap_or(&[]);
                finish(start, slice.join("\n"), 0)
            }
            Err(e) => finish(start, format!("{}: {e}", path.display()), 1),
        };
        Ok(result.to_content())
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct WriteFileInput {
    pub path: String,
    pub content: String,
}

impl Describe for WriteFileInput {
    fn describe() -> Schema {
        Schema::Object {
            description: Some("Write (creating or replacing) a file's contents".into()),
            properties: vec![
                Property {
                    name: "path".into(),
                    schema: Schema::String {
                        description: Some("File path, relative to the working directory".into()),
                        enumeration: None,
                    },
                },
                Property {
                    name: "content".into(),
                    schema: Schema::String {
                        description: Some("The full content to write".into()),
                        enumeration: None,
                    },
                },
            ],
            required: vec!["path".into(), "content".into()],
        }
    }
}

#[derive(Clone)]
pub struct WriteFileTool {
    pub(crate) cwd: std::path::PathBuf,
}

impl WriteFileTool {
    pub fn new(cwd: std::path::PathBuf) -> Self {
        Self { cwd }
    }
}

impl Tool for WriteFileTool {
    type Input = WriteFileInput;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write (creating or replacing) a file's contents. Creates parent directories as needed."
    }

    async fn call(&self, input: WriteFileInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let path = self.cwd.join(&input.path);
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &input.content).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        let result = match result {
            Ok(()) => finish(start, format!("wrote {} bytes to {}", input.content.len(), input.path), 0),
            Err(e) => finish(start, format!("{}: {e}", path.display()), 1),
        };
        Ok(result.to_content())
    }
}

// ---------------------------------------------------------------------------
// delete_file
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct DeleteFileInput {
    pub path: String,
}

impl Describe for DeleteFileInput {
    fn describe() -> Schema {
        describe_path("Delete a file")
    }
}

#[derive(Clone)]
pub struct DeleteFileTool {
    pub(crate) cwd: std::path::PathBuf,
}

impl DeleteFileTool {
    pub fn new(cwd: std::path::PathBuf) -> Self {
        Self { cwd }
    }
}

impl Tool for DeleteFileTool {
    type Input = DeleteFileInput;

    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file."
    }

    async fn call(&self, input: DeleteFileInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let path = self.cwd.join(&input.path);
        let result = match tokio::fs::remove_file(&path).await {
            Ok(()) => finish(start, format!("deleted {}", input.path), 0),
            Err(e) => finish(start, format!("{}: {e}", path.display()), 1),
        };
        Ok(result.to_content())
    }
}

// ---------------------------------------------------------------------------
// list_directory
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct ListDirectoryInput {
    #[serde(default)]
    pub path: Option<String>,
}

impl Describe for ListDirectoryInput {
    fn describe() -> Schema {
        Schema::Object {
            description: Some("List the immediate entries of a directory".into()),
            properties: vec![Property {
                name: "path".into(),
                schema: Schema::String {
                    description: Some(
                        "Directory path, relative to the working directory (default: \".\")".into(),
                    ),
                    enumeration: None,
                },
            }],
            required: vec![],
        }
    }
}

#[derive(Clone)]
pub struct ListDirectoryTool {
    pub(crate) cwd: std::path::PathBuf,
}

impl ListDirectoryTool {
    pub fn new(cwd: std::path::PathBuf) -> Self {
        Self { cwd }
    }
}

impl Tool for ListDirectoryTool {
    type Input = ListDirectoryInput;

    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the immediate entries of a directory."
    }

    async fn call(&self, input: ListDirectoryInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let path = self.cwd.join(input.path.as_deref().unwrap_or("."));
        let result = match tokio::fs::read_dir(&path).await {
            Ok(mut entries) => {
                let mut names = Vec::new();
                loop {
                    match entries.next_entry().await {
                        Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
                        Ok(None) => break,
                        Err(e) => return Ok(finish(start, format!("{}: {e}", path.display()), 1).to_content()),
                    }
                }
                names.sort();
                finish(start, names.join("\n"), 0)
            }
            Err(e) => finish(start, format!("{}: {e}", path.display()), 1),
        };
        Ok(result.to_content())
    }
}

// ---------------------------------------------------------------------------
// list_files_recursive
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct ListFilesRecursiveInput {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
}

impl Describe for ListFilesRecursiveInput {
    fn describe() -> Schema {
        Schema::Object {
            description: Some("Recursively list files under a directory, bounded by depth".into()),
            properties: vec![
                Property {
                    name: "path".into(),
                    schema: Schema::String {
                        description: Some("Root path, relative to the working directory (default: \".\")".into()),
                        enumeration: None,
                    },
                },
                Property {
                    name: "depth".into(),
                    schema: Schema::Integer {
                        description: Some("Maximum recursion depth (default: unbounded)".into()),
                    },
                },
            ],
            required: vec![],
        }
    }
}

#[derive(Clone)]
pub struct ListFilesRecursiveTool {
    pub(crate) cwd: std::path::PathBuf,
}

impl ListFilesRecursiveTool {
    pub fn new(cwd: std::path::PathBuf) -> Self {
        Self { cwd }
    }
}

impl Tool for ListFilesRecursiveTool {
    type Input = ListFilesRecursiveInput;

    fn name(&self) -> &str {
        "list_files_recursive"
    }

    fn description(&self) -> &str {
        "Recursively list files under a directory, bounded by depth."
    }

    async fn call(&self, input: ListFilesRecursiveInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let root = self.cwd.join(input.path.as_deref().unwrap_or("."));
        let depth_limit = input.depth.unwrap_or(u32::MAX);
        let root_clone = root.clone();
        let result = tokio::task::spawn_blocking(move || walk(&root_clone, depth_limit))
            .await
            .unwrap_or_else(|e| Err(e.to_string()));
        let result = match result {
            Ok(paths) => finish(start, paths.join("\n"), 0),
            Err(e) => finish(start, format!("{}: {e}", root.display()), 1),
        };
        Ok(result.to_content())
    }
}

fn walk(root: &std::path::Path, depth_limit: u32) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    walk_inner(root, root, 0, depth_limit, &mut out).map_err(|e| e.to_string())?;
    out.sort();
    Ok(out)
}

fn walk_inner(
    root: &std::path::Path,
    dir: &std::path::Path,
    depth: u32,
    depth_limit: u32,
    out: &mut Vec<String>,
) -> std::io::Result<()> {
    if depth > depth_limit {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            walk_inner(root, &path, depth + 1, depth_limit, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().into_owned());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path().to_path_buf());
        write
            .call(WriteFileInput {
                path: "a.txt".to_string(),
                content: "hello\nworld\n".to_string(),
            })
            .await
            .unwrap();

        let read = ReadFileTool::new(dir.path().to_path_buf());
        let content = read
            .call(ReadFileInput {
                path: "a.txt".to_string(),
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_eq!(result.output, "hello\nworld\n");
    }

    #[tokio::test]
    async fn read_lines_is_inclusive_1_based() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let tool = ReadFileLinesTool::new(dir.path().to_path_buf());
        let content = tool
            .call(ReadFileLinesInput {
                path: "a.txt".to_string(),
                start_line: 2,
                end_line: 3,
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_eq!(result.output, "two\nthree");
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let tool = DeleteFileTool::new(dir.path().to_path_buf());
        tool.call(DeleteFileInput {
            path: "a.txt".to_string(),
        })
        .await
        .unwrap();
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn list_directory_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let tool = ListDirectoryTool::new(dir.path().to_path_buf());
        let content = tool.call(ListDirectoryInput { path: None }).await.unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_eq!(result.output, "a.txt\nb.txt");
    }

    #[tokio::test]
    async fn list_files_recursive_respects_depth() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("top.txt"), "").unwrap();
        std::fs::write(dir.path().join("sub/mid.txt"), "").unwrap();
        std::fs::write(dir.path().join("sub/deep/bottom.txt"), "").unwrap();

        let tool = ListFilesRecursiveTool::new(dir.path().to_path_buf());
        let content = tool
            .call(ListFilesRecursiveInput {
                path: None,
                depth: Some(1),
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert!(result.output.contains("top.txt"));
        assert!(result.output.contains("sub/mid.txt"));
        assert!(!result.output.contains("bottom.txt"));
    }
}
