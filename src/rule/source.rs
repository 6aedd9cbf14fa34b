//! Rule sources
//!
//! A [`ConfigSource`] hands the rule manager its initial rules and pushes
//! later changes through a callback. Sources always deliver the full rule
//! list they know about; the manager diffs it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::model::Rule;
use crate::config::parse_rules;
use crate::error::{Error, Result};

/// Receives each rule list a source delivers.
pub type RulesCallback = Arc<dyn Fn(Vec<Rule>) + Send + Sync>;

/// Default polling interval for [`YamlFileConfigSource`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Short name for logs
    fn kind(&self) -> &str;

    /// Rules as of now.
    async fn current(&self) -> Result<Vec<Rule>>;

    /// Deliver the current rules once, then every change until shutdown.
    async fn subscribe(&self, callback: RulesCallback) -> Result<()>;

    async fn shutdown(&self);
}

// =============================================================================
// Static
// =============================================================================

/// Fixed rule list, delivered once.
pub struct StaticConfigSource {
    rules: Vec<Rule>,
}

impl StaticConfigSource {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    fn kind(&self) -> &str {
        "static"
    }

    async fn current(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.clone())
    }

    async fn subscribe(&self, callback: RulesCallback) -> Result<()> {
        debug!(count = self.rules.len(), "Delivering static rules");
        callback(self.rules.clone());
        Ok(())
    }

    async fn shutdown(&self) {}
}

// =============================================================================
// YAML File
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Rules read from a YAML file, re-read when the file changes.
///
/// The file holds either a settings document with a `rules` list or a bare
/// list of rules.
pub struct YamlFileConfigSource {
    path: PathBuf,
    poll_interval: Duration,
    last_content: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl YamlFileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            last_content: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(path: &Path) -> Result<(String, Vec<Rule>)> {
        let content = tokio::fs::read_to_string(path).await?;
        let rules = parse_rules(&content)?;
        Ok((content, rules))
    }

    async fn stamp(path: &Path) -> Option<FileStamp> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        Some(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

#[async_trait]
impl ConfigSource for YamlFileConfigSource {
    fn kind(&self) -> &str {
        "yaml-file"
    }

    async fn current(&self) -> Result<Vec<Rule>> {
        let (_, rules) = Self::read(&self.path).await?;
        Ok(rules)
    }

    async fn subscribe(&self, callback: RulesCallback) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let (content, rules) = Self::read(&self.path).await?;
        info!(path = %self.path.display(), count = rules.len(), "Rules file loaded");
        *self.last_content.lock() = Some(content);
        callback(rules);

        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        let last_content = Arc::clone(&self.last_content);
        let cancel = self.cancel.clone();
        let mut last_stamp = Self::stamp(&path).await;

        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let stamp = Self::stamp(&path).await;
                        if stamp.is_none() {
                            warn!(path = %path.display(), "Rules file missing, keeping current rules");
                            continue;
                        }
                        if stamp == last_stamp {
                            continue;
                        }
                        last_stamp = stamp;

                        match Self::read(&path).await {
                            Ok((content, rules)) => {
                                let changed = last_content.lock().as_deref() != Some(content.as_str());
                                if !changed {
                                    continue;
                                }
                                info!(path = %path.display(), count = rules.len(), "Rules file changed");
                                *last_content.lock() = Some(content);
                                callback(rules);
                            }
                            Err(e) => {
                                error!(path = %path.display(), error = %e, "Rules file unreadable, keeping current rules");
                            }
                        }
                    }
                }
            }
            debug!(path = %path.display(), "Rules file watcher stopped");
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_err;

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hotshield-{}-{}.yaml", name, uuid::Uuid::new_v4()))
    }

    fn collector() -> (RulesCallback, Arc<Mutex<Vec<Vec<Rule>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: RulesCallback = Arc::new(move |rules: Vec<Rule>| sink.lock().push(rules));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_static_source_delivers_once() {
        let source = StaticConfigSource::new(vec![Rule::new("a")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        source
            .subscribe(Arc::new(move |rules: Vec<Rule>| {
                assert_eq!(rules.len(), 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.kind(), "static");
        assert_eq!(source.current().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_yaml_source_missing_file() {
        let source = YamlFileConfigSource::new(temp_file("missing"));
        let (callback, _) = collector();
        assert_err!(source.subscribe(callback).await);
    }

    #[tokio::test]
    async fn test_yaml_source_reloads_on_change() {
        let path = temp_file("reload");
        std::fs::write(&path, "- resource: a\n").unwrap();

        let source = YamlFileConfigSource::new(&path).with_poll_interval(Duration::from_millis(20));
        let (callback, seen) = collector();
        source.subscribe(callback).await.unwrap();
        assert_eq!(seen.lock().len(), 1);

        std::fs::write(&path, "rules:\n  - resource: a\n  - resource: b\n").unwrap();

        let mut delivered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if seen.lock().len() >= 2 {
                delivered = true;
                break;
            }
        }
        assert!(delivered);
        assert_eq!(seen.lock()[1].len(), 2);

        source.shutdown().await;
        assert!(source.subscribe(collector().0).await.is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_yaml_source_keeps_rules_on_bad_edit() {
        let path = temp_file("bad-edit");
        std::fs::write(&path, "- resource: a\n").unwrap();

        let source = YamlFileConfigSource::new(&path).with_poll_interval(Duration::from_millis(20));
        let (callback, seen) = collector();
        source.subscribe(callback).await.unwrap();

        std::fs::write(&path, "rules: [unterminated\n").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(seen.lock().len(), 1);

        source.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }
}
