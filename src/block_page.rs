use std::path::{Path, PathBuf};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// The 403 response sent in place of a blocked request.
///
/// The body is read from disk on every use, so the page can be edited while
/// the proxy runs.
#[derive(Debug, Clone)]
pub struct BlockPage {
    path: PathBuf,
}

impl BlockPage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the full 403 response. If the body cannot be read nothing is
    /// sent at all.
    pub async fn respond<W>(&self, client: &mut W)
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to read block page {:?}: {}", self.path, e);
                return;
            }
        };

        let header = format!(
            "HTTP/1.1 403 Forbidden\r\n\
             Content-Type: text/html\r\n\
             Content-Length: {}\r\n\
             \r\n",
            body.len()
        );

        if let Err(e) = client.write_all(header.as_bytes()).await {
            debug!("Failed to send block page header: {}", e);
            return;
        }
        if let Err(e) = client.write_all(&body).await {
            debug!("Failed to send block page body: {}", e);
            return;
        }
        let _ = client.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_file(name: &str, body: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "block-page-{}-{}.html",
            std::process::id(),
            name
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_response_carries_exact_body_length() {
        let body = "<html><body>Blocked \u{1f6ab}</body></html>\n";
        let path = page_file("exact", body.as_bytes());
        let page = BlockPage::new(&path);

        let mut out: Vec<u8> = Vec::new();
        page.respond(&mut out).await;
        std::fs::remove_file(&path).ok();

        let expected = format!(
            "HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        assert_eq!(out, expected.as_bytes());
    }

    #[tokio::test]
    async fn test_empty_body() {
        let path = page_file("empty", b"");
        let page = BlockPage::new(&path);

        let mut out: Vec<u8> = Vec::new();
        page.respond(&mut out).await;
        std::fs::remove_file(&path).ok();

        assert!(out.ends_with(b"Content-Length: 0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_missing_page_sends_nothing() {
        let page = BlockPage::new(std::env::temp_dir().join("block-page-missing.html"));

        let mut out: Vec<u8> = Vec::new();
        page.respond(&mut out).await;
        assert!(out.is_empty());
    }
}
