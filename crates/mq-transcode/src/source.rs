//! Content resolution: content id to source file and duration.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use mq_core::config::LibraryConfig;
use mq_core::{ContentId, Error, Result};
use serde::Serialize;
use walkdir::WalkDir;

/// A playable source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMedia {
    pub path: PathBuf,
    pub duration_secs: f64,
}

/// Supplies the source path and total duration for a content id.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Fails with [`Error::NotFound`] for unknown content and
    /// [`Error::SourceUnavailable`] when the file exists but cannot be used.
    async fn resolve(&self, content: &ContentId) -> Result<SourceMedia>;
}

// ---------------------------------------------------------------------------
// StaticResolver
// ---------------------------------------------------------------------------

/// Fixed in-memory table of sources.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: DashMap<ContentId, SourceMedia>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, content: ContentId, media: SourceMedia) {
        self.entries.insert(content, media);
    }

    pub fn with(self, content: &str, path: impl Into<PathBuf>, duration_secs: f64) -> Result<Self> {
        self.insert(
            ContentId::parse(content)?,
            SourceMedia {
                path: path.into(),
                duration_secs,
            },
        );
        Ok(self)
    }
}

#[async_trait]
impl SourceResolver for StaticResolver {
    async fn resolve(&self, content: &ContentId) -> Result<SourceMedia> {
        let media = self
            .entries
            .get(content)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("content", content))?;
        if !media.duration_secs.is_finite() || media.duration_secs <= 0.0 {
            return Err(Error::source_unavailable(
                content,
                format!("invalid duration {}", media.duration_secs),
            ));
        }
        Ok(media)
    }
}

// ---------------------------------------------------------------------------
// LibraryResolver
// ---------------------------------------------------------------------------

/// Resolves content ids to files under the media root by file stem and
/// probes their duration with ffprobe. Results are cached.
pub struct LibraryResolver {
    media_root: PathBuf,
    extensions: Vec<String>,
    ffprobe: Option<PathBuf>,
    cache: DashMap<ContentId, SourceMedia>,
}

impl LibraryResolver {
    pub fn new(config: &LibraryConfig, ffprobe: Option<PathBuf>) -> Self {
        Self {
            media_root: config.media_root.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            ffprobe,
            cache: DashMap::new(),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    async fn locate(&self, content: &ContentId) -> Result<PathBuf> {
        if !self.media_root.is_dir() {
            return Err(Error::source_unavailable(
                content,
                format!("media root {} is not a directory", self.media_root.display()),
            ));
        }

        let root = self.media_root.clone();
        let extensions = self.extensions.clone();
        let stem = content.as_str().to_string();

        tokio::task::spawn_blocking(move || find_by_stem(&root, &extensions, &stem))
            .await
            .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))?
            .ok_or_else(|| Error::not_found("content", content))
    }
}

/// First file (in name order) whose stem is `stem` and whose extension is
/// one of `extensions`.
fn find_by_stem(root: &Path, extensions: &[String], stem: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .find(|path| {
            let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(stem);
            let ext_matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
                .unwrap_or(false);
            stem_matches && ext_matches
        })
}

#[async_trait]
impl SourceResolver for LibraryResolver {
    async fn resolve(&self, content: &ContentId) -> Result<SourceMedia> {
        if let Some(cached) = self.cache.get(content) {
            if cached.path.exists() {
                return Ok(cached.value().clone());
            }
        }
        self.cache.remove(content);

        let path = self.locate(content).await?;
        let ffprobe = self
            .ffprobe
            .as_deref()
            .ok_or_else(|| Error::source_unavailable(content, "ffprobe is not available"))?;

        let duration_secs = mq_av::probe::probe_duration(ffprobe, &path)
            .await
            .map_err(|e| Error::source_unavailable(content, e.to_string()))?;

        tracing::debug!(content = %content, path = %path.display(), duration_secs, "source resolved");

        let media = SourceMedia {
            path,
            duration_secs,
        };
        self.cache.insert(content.clone(), media.clone());
        Ok(media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(s: &str) -> ContentId {
        ContentId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn static_resolver_lookup() {
        let resolver = StaticResolver::new()
            .with("movie", "/media/movie.mkv", 300.0)
            .unwrap();
        let media = resolver.resolve(&content("movie")).await.unwrap();
        assert_eq!(media.path, PathBuf::from("/media/movie.mkv"));
        assert_eq!(media.duration_secs, 300.0);

        let err = resolver.resolve(&content("other")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn static_resolver_rejects_zero_duration() {
        let resolver = StaticResolver::new().with("empty", "/media/empty.mkv", 0.0).unwrap();
        let err = resolver.resolve(&content("empty")).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[test]
    fn finds_files_by_stem_in_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("films/2001")).unwrap();
        std::fs::write(dir.path().join("films/2001/movie.MKV"), b"x").unwrap();
        std::fs::write(dir.path().join("films/movie.txt"), b"x").unwrap();

        let exts = vec!["mkv".to_string(), "mp4".to_string()];
        let found = find_by_stem(dir.path(), &exts, "movie").unwrap();
        assert!(found.ends_with("films/2001/movie.MKV"));
        assert_eq!(find_by_stem(dir.path(), &exts, "missing"), None);
    }

    #[tokio::test]
    async fn library_resolver_unknown_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = LibraryConfig {
            media_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let resolver = LibraryResolver::new(&config, None);
        let err = resolver.resolve(&content("nothing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn library_resolver_without_ffprobe_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"x").unwrap();
        let config = LibraryConfig {
            media_root: dir.path().to_path_buf(),
            extensions: vec![".mkv".into()],
        };
        let resolver = LibraryResolver::new(&config, None);
        let err = resolver.resolve(&content("movie")).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn library_resolver_missing_root() {
        let config = LibraryConfig {
            media_root: PathBuf::from("/nonexistent/marquee-media"),
            ..Default::default()
        };
        let resolver = LibraryResolver::new(&config, None);
        let err = resolver.resolve(&content("movie")).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }
}
