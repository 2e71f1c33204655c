use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Quiet gap a save must leave before the file is read back. Editors and
/// the atomic-save path both emit several filesystem events per write.
const SETTLE: Duration = Duration::from_millis(250);

/// Watch the config file for external edits. Each successfully re-read and
/// validated config arrives on the returned channel; a broken edit is
/// logged and produces nothing, leaving whatever the caller last applied
/// in force.
///
/// The watch is on the parent directory: saves that replace the file
/// (rename-over, editor temp files) swap the inode, which would silently
/// detach a file-level watch.
pub fn watch_config_file(path: &Path) -> Result<(mpsc::Receiver<Config>, JoinHandle<()>)> {
    let target = path
        .canonicalize()
        .with_context(|| format!("cannot canonicalize config path: {}", path.display()))?;
    let dir = target
        .parent()
        .ok_or_else(|| anyhow!("config path has no parent directory"))?
        .to_path_buf();

    let (fs_tx, mut fs_rx) = mpsc::channel::<notify::Result<notify::Event>>(32);
    let mut backend: RecommendedWatcher = Watcher::new(
        move |outcome| {
            let _ = fs_tx.blocking_send(outcome);
        },
        notify::Config::default(),
    )
    .context("failed to create file watcher")?;
    backend
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch directory: {}", dir.display()))?;

    let (update_tx, updates) = mpsc::channel(4);
    let task = tokio::spawn(async move {
        // The backend stops when dropped; park it in the task.
        let _backend = backend;

        while let Some(outcome) = fs_rx.recv().await {
            if !touches_target(&outcome, &target) {
                continue;
            }

            // Coalesce the burst: keep absorbing events until the
            // filesystem has been quiet for a full settle window.
            loop {
                match tokio::time::timeout(SETTLE, fs_rx.recv()).await {
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            match read_back(&target) {
                Ok(config) => {
                    info!("config file changed; applying new snapshot");
                    if update_tx.send(config).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("ignoring config edit that failed to load: {:#}", e);
                }
            }
        }
    });

    info!("watching {} for edits", path.display());
    Ok((updates, task))
}

/// Does this filesystem event concern the config file? Access events never
/// do; everything else counts when any reported path names the target
/// (directly, or by filename for rename-over saves).
fn touches_target(outcome: &notify::Result<notify::Event>, target: &Path) -> bool {
    let event = match outcome {
        Ok(event) => event,
        Err(e) => {
            warn!("file watch backend error: {}", e);
            return false;
        }
    };
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    let wanted = target.file_name();
    event
        .paths
        .iter()
        .any(|p| p == target || (wanted.is_some() && p.file_name() == wanted))
}

/// A watched edit must both parse and validate to be applied; the file on
/// disk being gone mid-edit also keeps the previous config in force.
fn read_back(path: &PathBuf) -> Result<Config> {
    if !path.exists() {
        return Err(anyhow!("config file is gone"));
    }
    let config = super::loader::load_config(Some(path))?;
    config
        .validate()
        .map_err(|e| anyhow!("edited config is invalid: {}", e))?;
    Ok(config)
}
