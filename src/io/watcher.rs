//! Recursive directory watcher forwarding change notifications into a channel

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Bursts beyond this many pending notifications are dropped; one is enough
/// to wake the consumer
const EVENT_BUFFER: usize = 64;

pub struct DirectoryWatcher {
    // Kept alive for as long as notifications are wanted
    _watcher: RecommendedWatcher,
    receiver: mpsc::Receiver<Vec<PathBuf>>,
    root: PathBuf,
}

impl DirectoryWatcher {
    /// Watch `path` recursively; the directory must exist
    pub fn new(path: impl AsRef<Path>) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_content_change(&event.kind) => {
                    if tx.try_send(event.paths).is_err() {
                        trace!("Watch event dropped, consumer already notified");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Watch error: {}", e),
            },
            Config::default(),
        )?;

        let root = path.as_ref().to_path_buf();
        info!("Watching directory: {}", root.display());
        watcher.watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the next batch of changed paths
    pub async fn next_change(&mut self) -> Option<Vec<PathBuf>> {
        self.receiver.recv().await
    }

    /// Discard notifications that piled up, e.g. from our own writes
    pub fn drain(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DirectoryWatcher::new(dir.path()).unwrap();
        assert_eq!(watcher.root(), dir.path());

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("index-1.json"), "{}").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), watcher.next_change())
            .await
            .unwrap()
            .unwrap();
        assert!(
            changed
                .iter()
                .any(|p| p.file_name().is_some_and(|n| n == "index-1.json"))
        );
    }

    #[test]
    fn test_missing_directory_is_error() {
        assert!(DirectoryWatcher::new("/definitely/not/here").is_err());
    }

    #[test]
    fn test_content_change_kinds() {
        use notify::event::{AccessKind, CreateKind};
        assert!(is_content_change(&EventKind::Create(CreateKind::File)));
        assert!(!is_content_change(&EventKind::Access(AccessKind::Any)));
    }
}
