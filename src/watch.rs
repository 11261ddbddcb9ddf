//! Exclude-list file watching for hot-reload.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::routing::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Reload,
    Clear,
    /// Renamed: reload if something now sits at the path, clear otherwise.
    Renamed,
    Ignore,
}

fn classify(kind: &EventKind) -> Action {
    match kind {
        EventKind::Create(_) => Action::Reload,
        EventKind::Modify(ModifyKind::Name(_)) => Action::Renamed,
        EventKind::Modify(ModifyKind::Metadata(_)) => Action::Ignore,
        EventKind::Modify(_) => Action::Reload,
        EventKind::Remove(_) => Action::Clear,
        _ => Action::Ignore,
    }
}

/// Keeps the filesystem watch alive; dropping it stops reloads.
pub struct ExcludeWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch the directory holding `path` and apply changes to `router`.
///
/// Notifications are handed to a dedicated task over a channel and applied
/// one after another; query handling never waits on it.
pub fn spawn(router: Arc<Router>, path: PathBuf) -> notify::Result<ExcludeWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        },
        Config::default(),
    )?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(file = %path.display(), "watching exclude list");

    let file_name: Option<OsString> = path.file_name().map(ToOwned::to_owned);
    tokio::spawn(async move {
        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "watch error");
                    continue;
                }
            };
            let targets_file = event
                .paths
                .iter()
                .any(|p| p.file_name() == file_name.as_deref());
            if !targets_file {
                continue;
            }
            debug!(kind = ?event.kind, "exclude list changed");
            apply(&router, &path, classify(&event.kind)).await;
        }
    });

    Ok(ExcludeWatcher { _watcher: watcher })
}

async fn apply(router: &Router, path: &Path, action: Action) {
    let action = match action {
        Action::Renamed if path.exists() => Action::Reload,
        Action::Renamed => Action::Clear,
        other => other,
    };
    match action {
        Action::Reload => {
            if let Err(e) = router.reload(path).await {
                error!(file = %path.display(), error = %e, "failed to reload exclude list");
            }
        }
        Action::Clear => {
            info!(file = %path.display(), "exclude list removed");
            router.clear().await;
        }
        Action::Renamed | Action::Ignore => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{RoutingTable, Tier, parse_exclude_list};
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::time::Duration;

    fn router(patterns: &str) -> Arc<Router> {
        let empty = || Tier::new("empty", Vec::new());
        let table = RoutingTable::new(empty(), empty(), empty());
        Arc::new(Router::new(table.with_patterns(parse_exclude_list(patterns))))
    }

    #[test]
    fn classify_events() {
        assert_eq!(classify(&EventKind::Create(CreateKind::File)), Action::Reload);
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Action::Reload
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Action::Renamed
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            Action::Ignore
        );
        assert_eq!(classify(&EventKind::Remove(RemoveKind::File)), Action::Clear);
    }

    #[tokio::test]
    async fn rename_away_clears_and_rename_into_place_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exclude.list");
        let router = router("blocked.example");

        apply(&router, &path, Action::Renamed).await;
        assert!(router.snapshot().patterns().is_empty());

        std::fs::write(&path, "other.example\n").unwrap();
        apply(&router, &path, Action::Renamed).await;
        assert!(router.snapshot().is_excluded("other.example."));
    }

    #[tokio::test]
    async fn watcher_picks_up_writes_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exclude.list");
        std::fs::write(&path, "").unwrap();
        let router = router("");
        let _watcher = spawn(router.clone(), path.clone()).unwrap();

        std::fs::write(&path, "blocked.example\n").unwrap();
        let mut excluded = false;
        for _ in 0..100 {
            if router.snapshot().is_excluded("blocked.example.") {
                excluded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(excluded);

        std::fs::remove_file(&path).unwrap();
        let mut cleared = false;
        for _ in 0..100 {
            if router.snapshot().patterns().is_empty() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(cleared);
    }
}
