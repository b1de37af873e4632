use std::sync::Arc;

use warden_common::SecurityConfig;
use warden_memory::MemoryStore;

use crate::Tool;

mod exec;
mod file_ops;
mod memory;
mod web;

pub use exec::ExecCmdTool;
pub use file_ops::{EditFileTool, ListDirTool, ReadFileTool, SearchTextTool, WriteFileTool};
pub use memory::{ManageMemoryTool, namespace_digest};
pub use web::{WebFetchTool, validate_public_https};

/// Largest tool output handed back to the model.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Tools that need nothing beyond the store and security settings.
pub fn standard_tools(store: Arc<MemoryStore>, security: &SecurityConfig) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ExecCmdTool::new(security.command_timeout_secs)),
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(EditFileTool),
        Arc::new(ListDirTool),
        Arc::new(SearchTextTool),
        Arc::new(WebFetchTool::default()),
        Arc::new(ManageMemoryTool::new(store)),
    ]
}

/// Cuts `text` to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn cap_output(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[output truncated]");
    text
}
