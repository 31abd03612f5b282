//! `cdm add <url>` – enqueue a new download.

use anyhow::{bail, Context, Result};
use cdm_core::config::CdmConfig;
use cdm_core::store::{DownloadSpec, Store};
use std::path::PathBuf;

pub async fn run_add(
    store: &Store,
    cfg: &CdmConfig,
    url: &str,
    id: i64,
    title: Option<String>,
    save_path: Option<PathBuf>,
    dir: Option<PathBuf>,
    size: u64,
    priority: i32,
) -> Result<()> {
    let title = match title {
        Some(t) => t,
        None => default_title(url)?,
    };
    let save_path = match save_path {
        Some(p) => p,
        None => {
            let dir = match dir {
                Some(d) => d,
                None => std::env::current_dir().context("resolve current directory")?,
            };
            dir.join(&title)
        }
    };

    let spec = DownloadSpec {
        id,
        title: title.clone(),
        url: url.to_string(),
        save_path: save_path.to_string_lossy().to_string(),
        total_bytes: size,
        priority,
    };
    let row = store.add_download(&spec, cfg.max_queue_size).await?;
    println!(
        "Added download {} ({}) -> {}",
        row.id, row.title, row.save_path
    );
    Ok(())
}

/// Last path segment of the URL, as a filename fallback.
fn default_title(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {}", url))?;
    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    match name {
        Some(n) => Ok(n),
        None => bail!("URL has no file name; pass --title"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_from_url_path() {
        assert_eq!(
            default_title("https://example.com/a/b/file.iso").unwrap(),
            "file.iso"
        );
    }

    #[test]
    fn bare_host_needs_explicit_title() {
        assert!(default_title("https://example.com/").is_err());
    }
}
