// Ignore rules shared by the scanner and the watcher

use std::path::Path;

use walkdir::DirEntry;

use crate::constants::{IGNORED_DIR_NAMES, IGNORED_FILE_EXTENSIONS, IGNORED_FILE_NAMES};

/// Hidden names, Office lock files and editor swap/backup files
fn is_hidden_or_lock(name: &str) -> bool {
    name.starts_with('.') || name.starts_with("~$") || name.ends_with('~') || name.starts_with(".#")
}

pub fn is_ignored_dir_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    name.starts_with('.') || IGNORED_DIR_NAMES.contains(&lower.as_str())
}

pub fn is_ignored_file_name(name: &str) -> bool {
    if is_hidden_or_lock(name) {
        return true;
    }
    let lower = name.to_lowercase();
    if IGNORED_FILE_NAMES.contains(&lower.as_str()) {
        return true;
    }
    match Path::new(&lower).extension().and_then(|e| e.to_str()) {
        Some(ext) => IGNORED_FILE_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// walkdir filter: prune ignored directories, skip ignored files
pub fn is_ignored_entry(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        is_ignored_dir_name(&name)
    } else {
        is_ignored_file_name(&name)
    }
}

/// True when `path` (a file under `root`) or any directory between them is
/// ignored. Paths outside `root` are ignored.
pub fn is_ignored_path(root: &Path, path: &Path) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return true,
    };
    let mut components: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    let file_name = match components.pop() {
        Some(name) => name,
        None => return true,
    };
    components.iter().any(|dir| is_ignored_dir_name(dir)) || is_ignored_file_name(&file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert!(is_ignored_file_name(".hidden.jpg"));
        assert!(is_ignored_file_name("~$report.docx"));
        assert!(is_ignored_file_name("Thumbs.db"));
        assert!(is_ignored_file_name("desktop.ini"));
        assert!(is_ignored_file_name(".DS_Store"));
        assert!(is_ignored_file_name("movie.mp4.part"));
        assert!(is_ignored_file_name("movie.mp4.crdownload"));
        assert!(is_ignored_file_name("setup.EXE"));
        assert!(is_ignored_file_name("notes.txt~"));

        assert!(!is_ignored_file_name("IMG_0001.JPG"));
        assert!(!is_ignored_file_name("thing.xyz"));
        assert!(!is_ignored_file_name("README"));
    }

    #[test]
    fn test_dir_names() {
        assert!(is_ignored_dir_name(".git"));
        assert!(is_ignored_dir_name("node_modules"));
        assert!(is_ignored_dir_name("$RECYCLE.BIN"));
        assert!(is_ignored_dir_name("System Volume Information"));
        assert!(!is_ignored_dir_name("2024-06 Trip"));
    }

    #[test]
    fn test_paths_relative_to_root() {
        let root = Path::new("/media/.library");
        // A hidden root itself is fine
        assert!(!is_ignored_path(root, Path::new("/media/.library/a.jpg")));
        assert!(is_ignored_path(root, Path::new("/media/.library/.cache/a.jpg")));
        assert!(is_ignored_path(root, Path::new("/media/.library/x/node_modules/y/a.jpg")));
        assert!(is_ignored_path(root, Path::new("/elsewhere/a.jpg")));
        assert!(is_ignored_path(root, root));
    }
}
