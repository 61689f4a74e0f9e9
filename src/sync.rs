//! Directory sync: scan a folder and ingest every supported file.
//!
//! Each file becomes one document whose source name is the file stem
//! (`contracts/supply-2024.docx` → `supply-2024`). Sources already in the
//! index are skipped unless `replace` is set, in which case they are
//! re-chunked and swapped in.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::engine::Engine;
use crate::extract::extract_blocks;

/// A file picked up by [`scan_directory`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncItem {
    pub source: String,
    pub path: PathBuf,
    /// Path relative to the sync root, `/`-separated.
    pub relative: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SyncSummary {
    pub found: usize,
    pub ingested: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
    pub chunks: usize,
}

/// List files under `[sync].root` matching the include globs, sorted by path.
///
/// Two files with the same stem would map to one source; the first in path
/// order wins and the rest are logged and dropped.
pub fn scan_directory(config: &SyncConfig) -> Result<Vec<SyncItem>> {
    let root = config
        .root
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("sync.root is not configured"))?;
    if !root.is_dir() {
        bail!("Sync root does not exist: {}", root.display());
    }

    let include = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string(), "**/~$*".to_string()];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude = build_globset(&excludes)?;

    let mut items = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if exclude.is_match(&relative) || !include.is_match(&relative) {
            continue;
        }
        let Some(source) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        items.push(SyncItem {
            source,
            path: path.to_path_buf(),
            relative,
        });
    }
    items.sort_by(|a, b| a.relative.cmp(&b.relative));

    let mut seen = HashSet::new();
    items.retain(|item| {
        let fresh = seen.insert(item.source.clone());
        if !fresh {
            tracing::warn!(file = %item.relative, source = %item.source, "duplicate source name, skipping");
        }
        fresh
    });
    Ok(items)
}

/// Ingest everything [`scan_directory`] finds. A file that fails to parse
/// or embed is recorded in [`SyncSummary::failed`] and the sync continues.
pub async fn run_sync(engine: &Engine, config: &SyncConfig, replace: bool, dry_run: bool) -> Result<SyncSummary> {
    let items = scan_directory(config)?;
    let mut summary = SyncSummary {
        found: items.len(),
        ..Default::default()
    };

    for item in &items {
        let exists = engine.exists(&item.source).await;
        if exists && !replace {
            summary.skipped += 1;
            continue;
        }
        if dry_run {
            if exists {
                summary.replaced += 1;
            } else {
                summary.ingested += 1;
            }
            continue;
        }

        match sync_file(engine, &item.source, &item.path, exists).await {
            Ok(chunks) => {
                summary.chunks += chunks;
                if exists {
                    summary.replaced += 1;
                } else {
                    summary.ingested += 1;
                }
            }
            Err(e) => {
                tracing::warn!(file = %item.relative, error = %e, "sync failed");
                summary.failed.push((item.relative.clone(), format!("{:#}", e)));
            }
        }
    }

    tracing::info!(
        found = summary.found,
        ingested = summary.ingested,
        replaced = summary.replaced,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        "sync finished"
    );
    Ok(summary)
}

async fn sync_file(engine: &Engine, source: &str, path: &Path, exists: bool) -> Result<usize> {
    let blocks = extract_blocks(path).with_context(|| format!("Failed to extract {}", path.display()))?;
    let report = if exists {
        engine.replace(source, &blocks).await?
    } else {
        engine.ingest(source, &blocks).await?
    };
    Ok(report.chunks)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::embedding::DisabledEmbedder;
    use crate::index::{HybridIndex, IndexParams};
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::new(
            HybridIndex::new(IndexParams::default()),
            Arc::new(DisabledEmbedder),
            EngineOptions::default(),
        )
    }

    fn sync_config(root: &Path) -> SyncConfig {
        SyncConfig {
            root: Some(root.to_path_buf()),
            ..Default::default()
        }
    }

    fn write_tree(root: &Path) {
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("alpha.txt"), "Delivery within ten days.\n\nPenalty is one percent.").unwrap();
        std::fs::write(root.join("sub/beta.md"), "# Beta\n\nPayment within thirty days.").unwrap();
        std::fs::write(root.join("image.png"), [0u8, 1, 2]).unwrap();
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        std::fs::write(dir.path().join("sub/alpha.json"), "[]").unwrap();

        let items = scan_directory(&sync_config(dir.path())).unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.relative.as_str()).collect();
        assert_eq!(names, vec!["alpha.txt", "sub/beta.md"]);
        assert_eq!(items[0].source, "alpha");
    }

    #[test]
    fn test_scan_excludes() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let mut cfg = sync_config(dir.path());
        cfg.exclude_globs = vec!["sub/**".to_string()];
        let items = scan_directory(&cfg).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_scan_requires_root() {
        assert!(scan_directory(&SyncConfig::default()).is_err());
        let cfg = sync_config(Path::new("/definitely/not/here"));
        assert!(scan_directory(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_run_sync_skips_then_replaces() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let engine = engine();
        let cfg = sync_config(dir.path());

        let first = run_sync(&engine, &cfg, false, false).await.unwrap();
        assert_eq!((first.found, first.ingested, first.skipped), (2, 2, 0));
        assert!(engine.exists("alpha").await);
        assert!(engine.exists("beta").await);

        let second = run_sync(&engine, &cfg, false, false).await.unwrap();
        assert_eq!((second.ingested, second.skipped), (0, 2));

        let third = run_sync(&engine, &cfg, true, false).await.unwrap();
        assert_eq!(third.replaced, 2);
        assert!(third.failed.is_empty());
    }

    #[tokio::test]
    async fn test_run_sync_records_empty_file_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        std::fs::write(dir.path().join("empty.txt"), "  \n\n").unwrap();
        let engine = engine();

        let summary = run_sync(&engine, &sync_config(dir.path()), false, false).await.unwrap();
        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "empty.txt");
        assert!(summary.failed[0].1.contains("no chunks"));
        assert!(!engine.exists("empty").await);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_index_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let engine = engine();
        let summary = run_sync(&engine, &sync_config(dir.path()), false, true).await.unwrap();
        assert_eq!(summary.ingested, 2);
        assert!(engine.sources().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_file_is_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        std::fs::write(dir.path().join("broken.docx"), b"not a zip").unwrap();
        let engine = engine();
        let summary = run_sync(&engine, &sync_config(dir.path()), false, false).await.unwrap();
        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "broken.docx");
    }
}
