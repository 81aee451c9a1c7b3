//! The known-hosts store the Pool enforces strict host-key policy against.
//!
//! Loaded once by the caller and handed to [`crate::ssh::SshPool::new`]. An
//! empty store refuses every connection unless the operator has explicitly
//! opted into trust-on-first-use (spec §4.2, §9).

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// A parsed OpenSSH-format `known_hosts` file, reduced to the set of
/// `host:port` entries it vouches for. The actual key-comparison is
/// delegated to the SSH transport's own `ServerCheckMethod::KnownHostsFile`
/// handling; this store's job is only to decide, strictly and up front,
/// whether any entry exists at all for a target — so an empty file never
/// silently becomes trust-on-first-use.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    path: PathBuf,
    entries: HashSet<String>,
}

impl KnownHosts {
    /// Loads entries from `path`. A missing file is treated the same as an
    /// empty one — both produce a store with no entries.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries = HashSet::new();
        if let Ok(file) = std::fs::File::open(&path) {
            let reader = std::io::BufReader::new(file);
            for line in reader.lines().map_while(Result::ok) {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(host_field) = line.split_whitespace().next() {
                    entries.insert(host_field.to_string());
                }
            }
        }
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry plausibly covers `host:port` (either a bare host
    /// match or a `[host]:port` bracketed match, per OpenSSH convention).
    pub fn has_entry_for(&self, host: &str, port: u16) -> bool {
        let bracketed = format!("[{host}]:{port}");
        self.entries.iter().any(|e| e == host || e == &bracketed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_empty_store() {
        let store = KnownHosts::load("/nonexistent/path/known_hosts");
        assert!(store.is_empty());
    }

    #[test]
    fn entries_are_parsed_and_matched() {
        let mut file = tempfile_with_contents(
            "github.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI...\n[10.0.0.5]:2222 ssh-rsa AAAA...\n",
        );
        let path = file.0.clone();
        file.1.flush().unwrap();
        let store = KnownHosts::load(path);
        assert!(store.has_entry_for("github.com", 22));
        assert!(store.has_entry_for("10.0.0.5", 2222));
        assert!(!store.has_entry_for("10.0.0.5", 22));
    }

    fn tempfile_with_contents(contents: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "cwatcher-known-hosts-test-{}",
            uuid::Uuid::new_v4()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (path, file)
    }
}
