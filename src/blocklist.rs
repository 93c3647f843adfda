use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
const MAX_DOMAINS: usize = 10_000_000;
const BUFFER_SIZE: usize = 256 * 1024;

/// Hostnames the proxy refuses to forward or tunnel to.
///
/// Built once before the accept loop starts and only read afterwards, so it
/// is shared between connections behind a plain `Arc`.
#[derive(Debug, Default)]
pub struct Blocklist {
    exact: HashSet<String>,
}

impl Blocklist {
    /// Loads the list, falling back to an empty (non-blocking) list when the
    /// file cannot be read.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Blocklist unavailable, blocking nothing: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for blocklist file: {:?}", path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("blocklist file too large: {:?}", path);
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open blocklist file: {:?}", path))?;

        let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
        let mut exact = HashSet::new();
        let mut line = Vec::new();
        let mut raw_count = 0;

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .with_context(|| format!("Failed to read blocklist file: {:?}", path))?;
            if read == 0 {
                break;
            }
            raw_count += 1;

            let Some(entry) = parse_line(&line) else {
                continue;
            };

            if exact.len() >= MAX_DOMAINS {
                tracing::warn!(
                    "Blocklist capped at {} entries, ignoring the rest of {:?}",
                    MAX_DOMAINS,
                    path
                );
                break;
            }
            exact.insert(entry);
        }

        tracing::info!(
            "Loaded blocklist: {} entries from {} lines",
            exact.len(),
            raw_count
        );

        Ok(Self { exact })
    }

    /// Exact, ASCII case-insensitive membership.
    pub fn is_blocked(&self, host: &str) -> bool {
        if host.is_empty() || self.is_empty() {
            return false;
        }
        self.exact.contains(&host.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

#[cfg(test)]
impl Blocklist {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exact = entries
            .into_iter()
            .map(|e| e.as_ref().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { exact }
    }
}

// The entry ends at the first CR or LF; everything before it is kept as is.
fn parse_line(raw: &[u8]) -> Option<String> {
    let end = raw
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(raw.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase())
}
