//! Built-in tool handlers (C4, spec §4.4).

mod edit;
mod file_ops;
mod memory;
mod search;
mod shell;
mod skill;

pub use edit::{EditInput, EditTool};
pub use file_ops::{
    DeleteFileInput, DeleteFileTool, ListDirectoryInput, ListDirectoryTool,
    ListFilesRecursiveInput, ListFilesRecursiveTool, ReadFileInput, ReadFileLinesInput,
    ReadFileLinesTool, ReadFileTool, WriteFileInput, WriteFileTool,
};
pub use memory::{PersistentMemoryInput, PersistentMemoryTool};
pub use search::{SearchCodebaseInput, SearchCodebaseTool};
pub use shell::{ShellInput, ShellTool};
pub use skill::{SkillInput, SkillTool};
