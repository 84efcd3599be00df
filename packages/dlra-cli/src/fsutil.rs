// Filesystem helpers
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively delete `path`, including write-protected content.
///
/// git-annex removes write permission from object directories, which a
/// plain `remove_dir_all` cannot get through.
pub fn force_remove_dir(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mut perms = meta.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                let _ = std::fs::set_permissions(entry.path(), perms);
            }
        }
    }

    std::fs::remove_dir_all(path)
}
