use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::models::job::{Job, Metadata};

/// URL prefix under which the static directory is published.
pub const PUBLIC_PREFIX: &str = "/static";
const UPLOADS: &str = "uploads";
const RESULTS: &str = "results";
const ARTIFACT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];
const OVERLAY_SUFFIX: &str = "_overlay.png";

/// A stored crop, addressed both publicly and on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Stable public path, also the feature cache key.
    pub public_path: String,
    pub file_path: PathBuf,
}

/// Local filesystem storage for uploads and segmentation results.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
}

impl ArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS)
    }

    /// Output directory for one job's crops and overlay.
    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.results_dir().join(job_id.to_string())
    }

    pub async fn ensure_layout(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.uploads_dir()).await?;
        tokio::fs::create_dir_all(self.results_dir()).await?;
        Ok(())
    }

    /// Map a public path (`/static/...`) onto disk. `None` for anything
    /// that would land outside the storage root.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        public_relative(path).map(|rel| self.root.join(rel))
    }

    /// Public path of a file in a job's result directory:
    /// `/static/results/{job_id}/{filename}`.
    pub fn public_result_path(&self, job_id: Uuid, file: &Path) -> Option<String> {
        let name = file.file_name()?.to_str()?;
        Some(format!("{}/{}/{}/{}", PUBLIC_PREFIX, RESULTS, job_id, name))
    }

    /// Public path for any file under the storage root.
    pub fn public_path(&self, file: &Path) -> Option<String> {
        let rel = file.strip_prefix(&self.root).ok()?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");
        Some(format!("{}/{}", PUBLIC_PREFIX, rel))
    }

    /// Store an upload as `{uuid}_{sanitized name}`.
    pub async fn save_upload(&self, bytes: &[u8], filename: &str) -> Result<(Uuid, PathBuf), StorageError> {
        let file_id = Uuid::new_v4();
        let dir = self.uploads_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}_{}", file_id, sanitize_filename(filename)));
        tokio::fs::write(&path, bytes).await?;
        Ok((file_id, path))
    }

    /// Remove the input image, overlay, crops and result directory of a
    /// job. Best effort: individual failures are logged. Paths that do not
    /// resolve inside the storage root are never touched.
    pub async fn delete_job_artifacts(&self, job: &Job) {
        let referenced = std::iter::once(job.image_path.as_str())
            .chain(job.overlay_path.as_deref())
            .chain(job.regions.iter().map(|r| r.path.as_str()));

        for public in referenced {
            let Some(path) = self.resolve(public) else {
                tracing::warn!(job_id = %job.id, path = public, "Refusing to delete path outside static root");
                continue;
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_id = %job.id, path = %path.display(), error = %e, "Failed to delete artifact");
                }
            }
        }

        self.discard_results(job.id).await;
    }

    /// Remove a job's result directory and everything in it.
    pub async fn discard_results(&self, job_id: Uuid) {
        if let Err(e) = tokio::fs::remove_dir_all(self.job_dir(job_id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to delete result directory");
            }
        }
    }

    /// Every sticker crop under the results directory, sorted by path.
    /// Overlays are excluded.
    pub async fn list_artifacts(&self) -> Result<Vec<Artifact>, StorageError> {
        let mut found = Vec::new();
        let mut pending = vec![self.results_dir()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if is_sticker_file(&path) {
                    if let Some(public_path) = self.public_path(&path) {
                        found.push(Artifact {
                            public_path,
                            file_path: path,
                        });
                    }
                }
            }
        }

        found.sort_by(|a, b| a.public_path.cmp(&b.public_path));
        Ok(found)
    }

    /// Empty the uploads and results directories.
    pub async fn wipe(&self) -> Result<(), StorageError> {
        for dir in [self.uploads_dir(), self.results_dir()] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.ensure_layout().await
    }
}

fn is_sticker_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.ends_with(OVERLAY_SUFFIX) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ARTIFACT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// The part of a public path below `/static/`, if it only descends.
fn public_relative(path: &str) -> Option<&Path> {
    let rel = Path::new(path.strip_prefix(PUBLIC_PREFIX)?.strip_prefix('/')?);
    let descends = rel.components().next().is_some()
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    descends.then_some(rel)
}

/// Whether `path` is a public path that resolves inside the storage root.
pub fn is_public_path(path: &str) -> bool {
    public_relative(path).is_some()
}

/// Keep only ASCII alphanumerics and `._-`.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|&c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// SHA-256 content fingerprint, hex encoded.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Derive `artist` and `source_url` from an `.../Artist/PostId_rest.ext`
/// upload path.
pub fn metadata_from_relative_path(relative_path: &str) -> Metadata {
    let mut metadata = Metadata::new();
    let parts: Vec<&str> = relative_path.split('/').filter(|p| !p.is_empty()).collect();
    if let [.., artist, filename] = parts.as_slice() {
        let stem = filename.split('.').next().unwrap_or_default();
        let post_id = stem.split('_').next().unwrap_or_default();
        metadata.insert("artist".into(), (*artist).into());
        metadata.insert(
            "source_url".into(),
            format!("https://x.com/{}/status/{}", artist, post_id).into(),
        );
    }
    metadata
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::Thresholds;

    #[test]
    fn test_resolve_stays_under_root() {
        let storage = ArtifactStorage::new("/srv/static");
        assert_eq!(
            storage.resolve("/static/uploads/a.png"),
            Some(PathBuf::from("/srv/static/uploads/a.png"))
        );
        assert_eq!(storage.resolve("/tmp/b.png"), None);
        assert_eq!(storage.resolve("/staticfoo/c.png"), None);
        assert_eq!(storage.resolve("/static/../victim.txt"), None);
        assert_eq!(storage.resolve("/static/uploads/../../victim.txt"), None);
        assert_eq!(storage.resolve("/static//etc/passwd"), None);
        assert_eq!(storage.resolve("/static/"), None);
        assert!(is_public_path("/static/results/x/a_sticker_0.png"));
        assert!(!is_public_path("relative/a.png"));
    }

    #[test]
    fn test_public_result_path_scheme() {
        let storage = ArtifactStorage::new("/srv/static");
        let id = Uuid::new_v4();
        let public = storage
            .public_result_path(id, Path::new("/anywhere/else/img_sticker_0.png"))
            .unwrap();
        assert_eq!(public, format!("/static/results/{}/img_sticker_0.png", id));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my photo (1).PNG"), "myphoto1.PNG");
        assert_eq!(sanitize_filename("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_filename("///"), "upload");
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_metadata_from_relative_path() {
        let meta = metadata_from_relative_path("dump/someartist/1234567_2.jpg");
        assert_eq!(meta["artist"], "someartist");
        assert_eq!(meta["source_url"], "https://x.com/someartist/status/1234567");
        assert!(metadata_from_relative_path("lonely.jpg").is_empty());
    }

    #[tokio::test]
    async fn test_list_artifacts_skips_overlays() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(dir.path());
        let job_dir = storage.job_dir(Uuid::nil());
        std::fs::create_dir_all(&job_dir).unwrap();
        for name in ["b_sticker_1.png", "a_sticker_0.jpg", "a_overlay.png", "notes.txt"] {
            std::fs::write(job_dir.join(name), b"x").unwrap();
        }

        let artifacts = storage.list_artifacts().await.unwrap();
        let public: Vec<String> = artifacts.into_iter().map(|a| a.public_path).collect();
        let prefix = format!("/static/results/{}", Uuid::nil());
        assert_eq!(
            public,
            vec![
                format!("{}/a_sticker_0.jpg", prefix),
                format!("{}/b_sticker_1.png", prefix),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_artifacts_without_results_dir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(dir.path().join("missing"));
        assert!(storage.list_artifacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_job_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(dir.path());
        let (_, upload) = storage.save_upload(b"img", "a.png").await.unwrap();

        let mut job = Job::new(
            storage.public_path(&upload).unwrap(),
            Thresholds::default(),
            Metadata::new(),
        );
        job.id = Uuid::new_v4();
        let job_dir = storage.job_dir(job.id);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("a_sticker_0.png"), b"x").unwrap();

        storage.delete_job_artifacts(&job).await;
        assert!(!upload.exists());
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn test_delete_job_artifacts_ignores_outside_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(dir.path().join("static"));
        storage.ensure_layout().await.unwrap();
        let victim = dir.path().join("victim.txt");
        std::fs::write(&victim, b"keep me").unwrap();

        for image_path in ["/static/../victim.txt".to_string(), victim.display().to_string()] {
            let job = Job::new(image_path, Thresholds::default(), Metadata::new());
            storage.delete_job_artifacts(&job).await;
        }
        assert!(victim.exists());
    }
}
