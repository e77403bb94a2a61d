//! Producer/consumer image ingestion.
//!
//! A fixed set of launcher tasks pulls from one shared launch queue and
//! fetches. Every outcome, success or failure, is pushed to a single
//! post-process task, which runs the [`PostProcessor`] for successful
//! fetches and then settles the owning group's outstanding count. A
//! group's completion callback therefore fires only after every one of its
//! post-process calls has returned.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use visor_core::logging::{COMPONENT, ERROR_MSG, GROUP_ID, IMAGE_COUNT, SOURCE};
use visor_core::{defaults, Error, Result};

use crate::fetcher::ImageFetcher;

/// Called once when every download of a group has been post-processed.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Fetched through the [`ImageFetcher`] into the cache.
    Url(String),
    /// Already on disk; post-processed in place.
    Local(PathBuf),
}

impl Source {
    /// `http(s)://` is a URL, `file://` and anything else a local path.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Source::Url(raw.to_string())
        } else {
            Source::Local(PathBuf::from(raw.strip_prefix("file://").unwrap_or(raw)))
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Url(url) => f.write_str(url),
            Source::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Consumer side of the pipeline, run on the post-process task.
///
/// Calls are strictly sequential. `process` runs on the blocking thread
/// pool and may do CPU-heavy work.
pub trait PostProcessor<D>: Send + Sync {
    /// Handle a fetched image at `path`.
    fn process(&self, path: &Path, source: &Source, extra: &D) -> Result<()>;

    /// Handle a failed fetch. The group is settled either way.
    fn fetch_failed(&self, _source: &Source, _error: &Error, _extra: &D) {}
}

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Number of concurrent launcher tasks.
    pub workers: usize,
    /// Root directory for fetched images.
    pub cache_dir: PathBuf,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            workers: defaults::DOWNLOAD_WORKERS,
            cache_dir: PathBuf::from(defaults::IMAGE_CACHE_PATH),
        }
    }
}

impl DownloaderConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }
}

struct DownloadTask<D> {
    source: Source,
    dest: PathBuf,
    extra: D,
    group: u64,
}

struct Finished<D> {
    task: DownloadTask<D>,
    outcome: Result<()>,
}

struct Group {
    outstanding: usize,
    on_complete: Option<CompletionCallback>,
}

type Groups = Arc<Mutex<HashMap<u64, Group>>>;

/// Concurrent image fetcher with per-group completion accounting.
pub struct ImageDownloader<D> {
    launch_tx: Mutex<Option<mpsc::UnboundedSender<DownloadTask<D>>>>,
    groups: Groups,
    next_group: AtomicU64,
    cache_dir: PathBuf,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Send + Sync + 'static> ImageDownloader<D> {
    /// Spawn the launcher tasks and the post-process task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: DownloaderConfig,
        fetcher: Arc<dyn ImageFetcher>,
        processor: Arc<dyn PostProcessor<D>>,
    ) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("download workers must be at least 1".to_string()));
        }

        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let launch_rx = Arc::new(tokio::sync::Mutex::new(launch_rx));
        let groups: Groups = Arc::new(Mutex::new(HashMap::new()));

        let mut handles = Vec::with_capacity(config.workers + 1);
        for index in 0..config.workers {
            handles.push(tokio::spawn(launcher(
                index,
                launch_rx.clone(),
                done_tx.clone(),
                fetcher.clone(),
            )));
        }
        drop(done_tx);
        handles.push(tokio::spawn(post_process(done_rx, processor, groups.clone())));

        info!(
            workers = config.workers,
            cache_dir = %config.cache_dir.display(),
            "Image downloader started"
        );

        Ok(Self {
            launch_tx: Mutex::new(Some(launch_tx)),
            groups,
            next_group: AtomicU64::new(1),
            cache_dir: config.cache_dir,
            handles: Mutex::new(handles),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Groups with downloads still in flight.
    pub fn pending_groups(&self) -> usize {
        self.groups.lock().len()
    }

    /// Fetch `urls` into `<cache>/<subdir>/` and post-process each.
    ///
    /// Entries that are not `http(s)://` URLs are treated as local paths.
    /// Returns the group id. An empty list completes immediately.
    #[instrument(skip(self, urls, extra, on_complete), fields(image_count = urls.len()))]
    pub fn download_urls(
        &self,
        urls: &[String],
        subdir: &str,
        extra: D,
        on_complete: Option<CompletionCallback>,
    ) -> Result<u64>
    where
        D: Clone,
    {
        let tasks = urls
            .iter()
            .map(|raw| match Source::parse(raw) {
                Source::Url(url) => {
                    let dest = cache_file_path(&self.cache_dir, subdir, &url);
                    (Source::Url(url), dest)
                }
                Source::Local(path) => (Source::Local(path.clone()), path),
            })
            .collect();
        self.submit(tasks, extra, on_complete)
    }

    /// Post-process files already on disk, without fetching.
    #[instrument(skip(self, paths, extra, on_complete), fields(image_count = paths.len()))]
    pub fn process_files(
        &self,
        paths: &[PathBuf],
        extra: D,
        on_complete: Option<CompletionCallback>,
    ) -> Result<u64>
    where
        D: Clone,
    {
        let tasks = paths
            .iter()
            .map(|p| (Source::Local(p.clone()), p.clone()))
            .collect();
        self.submit(tasks, extra, on_complete)
    }

    fn submit(
        &self,
        tasks: Vec<(Source, PathBuf)>,
        extra: D,
        on_complete: Option<CompletionCallback>,
    ) -> Result<u64>
    where
        D: Clone,
    {
        let guard = self.launch_tx.lock();
        let Some(launch_tx) = guard.as_ref() else {
            return Err(Error::Internal("image downloader has shut down".to_string()));
        };

        let group = self.next_group.fetch_add(1, Ordering::Relaxed);
        if tasks.is_empty() {
            drop(guard);
            debug!({ GROUP_ID } = group, "Empty download group completes immediately");
            if let Some(callback) = on_complete {
                callback();
            }
            return Ok(group);
        }

        self.groups.lock().insert(
            group,
            Group {
                outstanding: tasks.len(),
                on_complete,
            },
        );
        debug!({ GROUP_ID } = group, { IMAGE_COUNT } = tasks.len(), "Download group queued");

        for (source, dest) in tasks {
            let task = DownloadTask {
                source,
                dest,
                extra: extra.clone(),
                group,
            };
            if launch_tx.send(task).is_err() {
                settle(&self.groups, group);
            }
        }
        Ok(group)
    }

    /// Stop accepting work and wait for queued downloads to drain.
    pub async fn shutdown(&self) {
        drop(self.launch_tx.lock().take());
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!({ COMPONENT } = "downloader", { ERROR_MSG } = ?e, "Downloader task panicked");
            }
        }
        info!("Image downloader stopped");
    }
}

async fn launcher<D>(
    index: usize,
    launch_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DownloadTask<D>>>>,
    done_tx: mpsc::UnboundedSender<Finished<D>>,
    fetcher: Arc<dyn ImageFetcher>,
) {
    loop {
        let next = launch_rx.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        let outcome = match &task.source {
            Source::Url(url) => fetcher.fetch(url, &task.dest).await,
            Source::Local(path) => match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() => Ok(()),
                _ => Err(Error::InvalidRequest(format!("{} does not exist", path.display()))),
            },
        };
        if done_tx.send(Finished { task, outcome }).is_err() {
            break;
        }
    }
    debug!({ COMPONENT } = "launcher", launcher = index, "Download launcher stopped");
}

async fn post_process<D: Send + Sync + 'static>(
    mut done_rx: mpsc::UnboundedReceiver<Finished<D>>,
    processor: Arc<dyn PostProcessor<D>>,
    groups: Groups,
) {
    while let Some(Finished { task, outcome }) = done_rx.recv().await {
        let group = task.group;
        match outcome {
            Ok(()) => {
                let processor = processor.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let result = processor.process(&task.dest, &task.source, &task.extra);
                    (task.source, result)
                })
                .await;
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((source, Err(e))) => {
                        warn!({ SOURCE } = %source, { ERROR_MSG } = %e, "Image post-processing failed");
                    }
                    Err(e) => error!(
                        { COMPONENT } = "post_process",
                        { ERROR_MSG } = ?e,
                        "Image post-processor panicked"
                    ),
                }
            }
            Err(e) => {
                warn!({ SOURCE } = %task.source, { ERROR_MSG } = %e, "Image fetch failed");
                processor.fetch_failed(&task.source, &e, &task.extra);
            }
        }
        settle(&groups, group);
    }
}

/// Count one download of `group` as done, firing its callback at zero.
fn settle(groups: &Mutex<HashMap<u64, Group>>, group: u64) {
    let callback = {
        let mut groups = groups.lock();
        let Some(entry) = groups.get_mut(&group) else {
            return;
        };
        entry.outstanding = entry.outstanding.saturating_sub(1);
        if entry.outstanding > 0 {
            return;
        }
        groups.remove(&group).and_then(|g| g.on_complete)
    };
    debug!({ GROUP_ID } = group, "Download group complete");
    if let Some(callback) = callback {
        callback();
    }
}

/// `<cache>/<subdir>/<sha256(url) prefix>.<ext>`.
///
/// `subdir` is reduced to a single safe path component.
pub fn cache_file_path(cache_dir: &Path, subdir: &str, url: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let name = format!("{}.{}", &digest[..16], url_extension(url));
    cache_dir.join(sanitize_component(subdir)).join(name)
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}

fn url_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "img".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parse() {
        assert_eq!(
            Source::parse("https://example.com/a.jpg"),
            Source::Url("https://example.com/a.jpg".to_string())
        );
        assert_eq!(
            Source::parse("file:///data/a.jpg"),
            Source::Local(PathBuf::from("/data/a.jpg"))
        );
        assert_eq!(Source::parse("rel/a.jpg"), Source::Local(PathBuf::from("rel/a.jpg")));
    }

    #[test]
    fn test_cache_file_path_is_stable_and_keeps_extension() {
        let cache = Path::new("/cache");
        let a = cache_file_path(cache, "cat", "http://h/x/photo.JPG?size=large");
        let b = cache_file_path(cache, "cat", "http://h/x/photo.JPG?size=large");
        assert_eq!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/cache/cat")));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("jpg"));

        let other = cache_file_path(cache, "cat", "http://h/x/photo.JPG?size=small");
        assert_ne!(a, other);
    }

    #[test]
    fn test_cache_file_path_without_extension() {
        let p = cache_file_path(Path::new("/c"), "t", "http://h/download?id=7");
        assert_eq!(p.extension().and_then(|e| e.to_str()), Some("img"));
    }

    #[test]
    fn test_subdir_cannot_escape_cache() {
        let p = cache_file_path(Path::new("/c"), "../../etc", "http://h/a.png");
        assert!(p.starts_with("/c"));
        assert_eq!(p.components().count(), 4);
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("my cat"), "my_cat");
    }

    #[test]
    fn test_settle_fires_callback_once_at_zero() {
        let groups: Groups = Arc::new(Mutex::new(HashMap::new()));
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        groups.lock().insert(
            7,
            Group {
                outstanding: 2,
                on_complete: Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );

        settle(&groups, 7);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        settle(&groups, 7);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        settle(&groups, 7);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(groups.lock().is_empty());
    }
}
