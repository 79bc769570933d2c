//! Capability discovery
//!
//! Agents may invoke pre-installed capability packages. The orchestrator's
//! only job is to discover the installed names by scanning the well-known
//! directory and hand them to the prompt builder.

use std::path::Path;

use tracing::{debug, warn};

/// List installed capability names
///
/// Each capability is a directory under the skills root. A missing root is
/// normal (nothing installed) and yields an empty list; discovery never
/// blocks startup.
pub fn discover(skills_dir: &Path) -> Vec<String> {
    if !skills_dir.exists() {
        debug!(dir = %skills_dir.display(), "skills: directory absent, none installed");
        return Vec::new();
    }

    let entries = match std::fs::read_dir(skills_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %skills_dir.display(), error = %e, "skills: could not read directory");
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();

    debug!(count = names.len(), "skills: discovered capabilities");
    names
}
