//! One-for-one supervisor for channel adapters.
//!
//! Each child is described by a factory that produces its long-running
//! future. When the future returns an error or panics, the supervisor
//! records the crash in a sliding window and restarts the child, until the
//! window holds more crashes than the restart budget allows; then it gives
//! up on that child and says so, leaving siblings untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RESTART_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    ChildStarted { id: String },
    ChildCrashed { id: String, error: String },
    ChildRestarted { id: String, attempt: u32 },
    MaxRestartsExceeded { id: String },
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub max_restarts: usize,
    pub window: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

type ChildFactory = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Descriptor for one supervised child.
#[derive(Clone)]
pub struct ChildSpec {
    pub id: String,
    factory: ChildFactory,
}

impl ChildSpec {
    pub fn new<F>(id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            factory: Arc::new(factory),
        }
    }
}

pub struct ChannelSupervisor {
    options: SupervisorOptions,
    children: Mutex<Vec<ChildSpec>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<SupervisorEvent>,
    shutdown: CancellationToken,
    running: std::sync::atomic::AtomicBool,
}

impl ChannelSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            options,
            children: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Registers a child. If the supervisor is already running the child is
    /// spawned immediately.
    pub async fn add_child(&self, spec: ChildSpec) {
        self.children.lock().await.push(spec.clone());
        if self.is_running() {
            self.spawn_child(spec).await;
        }
    }

    /// Boots every registered child.
    pub async fn start(&self) {
        self.running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let specs: Vec<_> = self.children.lock().await.clone();
        for spec in specs {
            self.spawn_child(spec).await;
        }
        info!("Channel supervisor started");
    }

    /// Stops all children, newest first.
    pub async fn stop(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.cancel();

        let ids: Vec<String> = {
            let children = self.children.lock().await;
            children.iter().rev().map(|c| c.id.clone()).collect()
        };
        let mut tasks = self.tasks.lock().await;
        for id in ids {
            if let Some(handle) = tasks.remove(&id) {
                let _ = handle.await;
            }
        }
        info!("Channel supervisor stopped");
    }

    async fn spawn_child(&self, spec: ChildSpec) {
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let options = self.options;
        let spec_id = spec.id.clone();

        let monitor = tokio::spawn(async move {
            let mut crashes: Vec<Instant> = Vec::new();
            let mut attempt: u32 = 0;
            let _ = events.send(SupervisorEvent::ChildStarted {
                id: spec.id.clone(),
            });

            loop {
                // The child runs in its own task so a panic is contained
                // and observable as a JoinError.
                let mut child = tokio::spawn((spec.factory)());
                let result = tokio::select! {
                    _ = shutdown.cancelled() => {
                        child.abort();
                        return;
                    }
                    result = &mut child => result,
                };

                let crash_reason = match result {
                    Ok(Ok(())) => {
                        info!(child = %spec.id, "Child exited cleanly");
                        return;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(join_err) if join_err.is_panic() => "child panicked".to_string(),
                    Err(join_err) => join_err.to_string(),
                };

                warn!(child = %spec.id, error = %crash_reason, "Child crashed");
                let _ = events.send(SupervisorEvent::ChildCrashed {
                    id: spec.id.clone(),
                    error: crash_reason,
                });

                let now = Instant::now();
                crashes.retain(|t| now.duration_since(*t) < options.window);
                crashes.push(now);
                if crashes.len() > options.max_restarts {
                    error!(
                        child = %spec.id,
                        crashes = crashes.len(),
                        window_secs = options.window.as_secs(),
                        "Restart budget exhausted, giving up on child"
                    );
                    let _ = events.send(SupervisorEvent::MaxRestartsExceeded {
                        id: spec.id.clone(),
                    });
                    return;
                }

                attempt += 1;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
                let _ = events.send(SupervisorEvent::ChildRestarted {
                    id: spec.id.clone(),
                    attempt,
                });
            }
        });

        self.tasks.lock().await.insert(spec_id, monitor);
    }
}
