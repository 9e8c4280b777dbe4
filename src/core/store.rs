//! Atomic JSON document persistence for the registry, the generated engine
//! configs and the installed-version record.

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::fs;

/// Load a JSON document, creating it with defaults when missing. A corrupted
/// file is backed up next to the original and replaced with defaults, and an
/// error describing the corruption is returned so the caller can surface it.
pub async fn load_or_init<T>(path: &Path) -> anyhow::Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<T>(&contents) {
            Ok(value) => Ok(value),
            Err(parse_error) => {
                tracing::error!("Corrupted JSON document at {}: {}", path.display(), parse_error);

                let backup_path = path.with_extension("json.bak");
                if let Err(e) = fs::copy(path, &backup_path).await {
                    tracing::warn!("Failed to create backup of corrupted document: {}", e);
                } else {
                    tracing::info!(
                        "Created backup of corrupted document at {}",
                        backup_path.display()
                    );
                }

                let default_value = T::default();
                save(path, &default_value).await.with_context(|| {
                    format!(
                        "Failed to create new document after corruption at {}",
                        path.display()
                    )
                })?;

                Err(anyhow::anyhow!(
                    "Document was corrupted and has been replaced with defaults. Backup saved to {}. Error: {}",
                    backup_path.display(),
                    parse_error
                ))
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let default_value = T::default();
            save(path, &default_value).await.with_context(|| {
                format!("Failed to create default document at {}", path.display())
            })?;
            Ok(default_value)
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read document from {}", path.display()))
        }
    }
}

// Atomic write with temp file
pub async fn save<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json_content =
        serde_json::to_string_pretty(value).context("Failed to serialize document to JSON")?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, json_content.as_bytes())
        .await
        .with_context(|| format!("Failed to write temporary document to {}", tmp_path.display()))
        .map_err(|e| {
            if e.to_string().contains("No space left on device")
                || e.to_string().contains("disk full")
            {
                anyhow::anyhow!(
                    "Disk space exhausted. Cannot save document. Free up disk space and try again."
                )
            } else {
                e
            }
        })?;

    #[cfg(unix)]
    {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .context("Failed to open temp file for fsync")?;
        file.sync_all().await.context("Failed to fsync temp file")?;
    }

    fs::rename(&tmp_path, path).await.with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Doc {
        items: Vec<String>,
    }

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "xray_manager_store_{}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst),
            name
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("doc.json")
    }

    #[tokio::test]
    async fn missing_file_initialized_with_defaults() {
        let path = scratch_path("init");
        let doc: Doc = load_or_init(&path).await.unwrap();
        assert_eq!(doc, Doc::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn save_then_load_round_trip() {
        let path = scratch_path("round");
        let doc = Doc {
            items: vec!["a".to_string(), "b".to_string()],
        };
        save(&path, &doc).await.unwrap();
        let loaded: Doc = load_or_init(&path).await.unwrap();
        assert_eq!(loaded, doc);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn corrupted_file_backed_up_and_reset() {
        let path = scratch_path("corrupt");
        std::fs::write(&path, "{ not json").unwrap();

        let result: anyhow::Result<Doc> = load_or_init(&path).await;
        assert!(result.is_err());
        assert!(path.with_extension("json.bak").exists());

        // A second load sees the freshly written defaults.
        let doc: Doc = load_or_init(&path).await.unwrap();
        assert_eq!(doc, Doc::default());
    }
}
