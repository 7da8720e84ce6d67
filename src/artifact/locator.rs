//! Model locator.
//!
//! Probes an ordered list of candidate paths and returns the first one that
//! is an existing regular file. Order is priority: the requested path is
//! always probed first, then each search root in the order given.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Build the ordered candidate list: `requested` verbatim, then every root.
pub fn candidates<P: AsRef<Path>>(requested: &Path, search_roots: &[P]) -> Vec<PathBuf> {
    let mut list = Vec::with_capacity(search_roots.len() + 1);
    list.push(requested.to_path_buf());
    list.extend(search_roots.iter().map(|root| root.as_ref().to_path_buf()));
    list
}

/// Join `file_name` onto each directory, preserving directory order.
///
/// This is the call-site policy used for configured storage directories,
/// which hold models rather than name them.
pub fn join_file_name<P: AsRef<Path>>(file_name: &Path, dirs: &[P]) -> Vec<PathBuf> {
    dirs.iter().map(|dir| dir.as_ref().join(file_name)).collect()
}

/// Locate the first existing regular file among `requested` and `search_roots`.
///
/// Returns `None` when no candidate exists. Probes are read-only and stop at
/// the first match.
pub fn locate<P: AsRef<Path>>(requested: &Path, search_roots: &[P]) -> Option<PathBuf> {
    for candidate in candidates(requested, search_roots) {
        if is_regular_file(&candidate) {
            info!(path = %candidate.display(), "Found model file");
            return Some(candidate);
        }
        debug!(path = %candidate.display(), "Candidate not present");
    }

    debug!(
        requested = %requested.display(),
        roots = search_roots.len(),
        "Model file not found in any candidate location"
    );
    None
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_path_comes_first() {
        let list = candidates(Path::new("/a/m.gguf"), &["/b/m.gguf", "/c/m.gguf"]);
        assert_eq!(
            list,
            vec![
                PathBuf::from("/a/m.gguf"),
                PathBuf::from("/b/m.gguf"),
                PathBuf::from("/c/m.gguf"),
            ]
        );
    }

    #[test]
    fn test_join_file_name_keeps_order() {
        let joined = join_file_name(Path::new("m.gguf"), &["/x", "/y"]);
        assert_eq!(joined, vec![PathBuf::from("/x/m.gguf"), PathBuf::from("/y/m.gguf")]);
    }

    #[test]
    fn test_directory_is_not_a_match() {
        let dir = tempfile::tempdir().unwrap();
        let roots: [&Path; 0] = [];
        assert!(locate(dir.path(), &roots).is_none());
    }

    #[test]
    fn test_first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.gguf");
        let second = dir.path().join("second.gguf");
        std::fs::write(&first, b"GGUF").unwrap();
        std::fs::write(&second, b"GGUF").unwrap();

        let found = locate(Path::new("/missing/m.gguf"), &[dir.path().join("absent.gguf"), first.clone(), second]);
        assert_eq!(found, Some(first));
    }

    #[test]
    fn test_missing_everywhere() {
        let found = locate(Path::new("/definitely/not/here.gguf"), &["/nor/here.gguf"]);
        assert!(found.is_none());
    }
}
