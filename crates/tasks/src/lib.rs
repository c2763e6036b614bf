//! Root task management: named worker tasks, cooperative shutdown, and
//! failure propagation so one dead critical task takes the process down
//! cleanly instead of leaving it half-alive.

use std::{future::Future, thread};

use tokio::sync::{mpsc, watch};
use tracing::*;

/// Cloneable handle workers poll (or await) to learn about shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownGuard {
    rx: watch::Receiver<bool>,
}

impl ShutdownGuard {
    pub fn should_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered.
    pub async fn wait_for_shutdown(&mut self) {
        // An error means the manager is gone, which is shutdown too.
        let _ = self.rx.wait_for(|flag| *flag).await;
    }
}

#[derive(Debug)]
struct TaskExit {
    name: &'static str,
    result: anyhow::Result<()>,
}

/// Spawns named critical tasks.  Cheap to clone into whatever needs to
/// start workers.
#[derive(Clone, Debug)]
pub struct TaskExecutor {
    shutdown_rx: watch::Receiver<bool>,
    exit_tx: mpsc::UnboundedSender<TaskExit>,
}

impl TaskExecutor {
    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            rx: self.shutdown_rx.clone(),
        }
    }

    /// Spawns an async critical task.  Its exit, clean or not, triggers
    /// process shutdown.
    pub fn spawn_critical_async<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce(ShutdownGuard) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = self.shutdown_guard();
        let exit_tx = self.exit_tx.clone();
        let fut = f(guard);
        tokio::spawn(async move {
            let result = fut.await;
            let _ = exit_tx.send(TaskExit { name, result });
        });
    }

    /// Spawns a blocking critical task on a dedicated thread.  Used for
    /// the serialized state-machine workers.
    pub fn spawn_critical<F>(&self, name: &'static str, f: F)
    where
        F: FnOnce(ShutdownGuard) -> anyhow::Result<()> + Send + 'static,
    {
        let guard = self.shutdown_guard();
        let exit_tx = self.exit_tx.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = f(guard);
                let _ = exit_tx.send(TaskExit { name, result });
            })
            .expect("tasks: spawn thread");
    }
}

/// Owns the shutdown flag and watches for the first critical exit.
#[derive(Debug)]
pub struct TaskManager {
    shutdown_tx: watch::Sender<bool>,
    exit_rx: mpsc::UnboundedReceiver<TaskExit>,
    exit_tx: mpsc::UnboundedSender<TaskExit>,
}

impl TaskManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            shutdown_tx,
            exit_rx,
            exit_tx,
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            shutdown_rx: self.shutdown_tx.subscribe(),
            exit_tx: self.exit_tx.clone(),
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Blocks until ctrl-c or the first critical task exits, then flips
    /// the shutdown flag so everything else winds down.
    pub async fn monitor(&mut self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
            }
            exit = self.exit_rx.recv() => {
                match exit {
                    Some(TaskExit { name, result: Ok(()) }) => {
                        info!(task = %name, "critical task finished, shutting down");
                    }
                    Some(TaskExit { name, result: Err(e) }) => {
                        error!(task = %name, err = %e, "critical task failed, shutting down");
                    }
                    None => {}
                }
            }
        }
        self.trigger_shutdown();
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
