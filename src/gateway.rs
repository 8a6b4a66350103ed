//! Gateway daemon assembly.
//!
//! [`Gateway::new`] wires every subsystem from the loaded config;
//! [`Gateway::run`] starts the long-lived tasks and blocks until a
//! shutdown signal, then tears everything down in order: scheduler first
//! (no new cron triggers), channels next (no new inbound), drain in-flight
//! loops, close the worker pool and memory backend, and finally stop the
//! HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::router::AgentRouter;
use crate::agent::tools::filesystem::{FileReadTool, FileWriteTool};
use crate::agent::tools::{ToolError, ToolRegistry};
use crate::channels::pipeline::{InboundPipeline, PipelineConfig};
use crate::channels::supervisor::{ChannelSupervisor, ChildSpec, SupervisorOptions};
use crate::channels::{Channel, ChannelContext};
use crate::config::schema::Config;
use crate::engine::Engine;
use crate::engine::mock::MockEngine;
use crate::memory::{InMemoryBackend, MemoryBackend, MemoryRecallHooks};
use crate::pairing::PairingManager;
use crate::scheduler::{CronJob, Scheduler};
use crate::server::{AppState, build_router};
use crate::session::{MessageRouter, SessionConfig, SessionManager};
use crate::utils::security::SecurityPolicy;
use crate::utils::workerpool::WorkerPool;

const CHANNEL_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MEMORY_WARNING_THRESHOLD_MB: u64 = 300;

pub struct Gateway {
    config: Config,
    sessions: Arc<SessionManager>,
    pipeline: Arc<InboundPipeline>,
    supervisor: Arc<ChannelSupervisor>,
    scheduler: Arc<Scheduler>,
    pairing: Option<Arc<PairingManager>>,
    memory: Option<Arc<dyn MemoryBackend>>,
    worker_pool: Arc<WorkerPool<Result<String, ToolError>>>,
    shutdown: CancellationToken,
    inbound_tx: mpsc::Sender<crate::channels::types::InboundMessage>,
    inbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<crate::channels::types::InboundMessage>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    pub async fn new(config: Config) -> Result<Self> {
        let sessions = Arc::new(SessionManager::new());

        let default_session_config = SessionConfig {
            channel_id: String::new(),
            user_id: None,
            model: Some(config.agent.model.clone()),
            max_iterations: config.agent.max_iterations,
        };
        let message_router = Arc::new(MessageRouter::new(
            Arc::clone(&sessions),
            default_session_config,
        ));

        let agent_router = Arc::new(
            AgentRouter::new(config.routing.rules.clone(), config.routing.agents.clone())
                .context("failed to compile routing rules")?,
        );

        let engine = build_engine(&config)?;
        info!(engine = %engine.name(), "Engine ready");

        let workspace = dirs::home_dir()
            .map(|home| home.join(".omnigate").join("workspace"))
            .context("could not determine home directory")?;
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("failed to create workspace at {}", workspace.display()))?;

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FileReadTool::new(workspace.clone())));
        tools.register(Arc::new(FileWriteTool::new(workspace.clone())));
        info!(tools = ?tools.names(), "Tool registry ready");

        let security = SecurityPolicy {
            autonomy: config
                .autonomy
                .level
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,
            allowed_paths: config.security.allowed_paths.iter().map(Into::into).collect(),
            blocked_commands: config.security.blocked_commands.clone(),
        };

        let memory: Option<Arc<dyn MemoryBackend>> = config
            .memory
            .enabled
            .then(|| Arc::new(InMemoryBackend::new()) as Arc<dyn MemoryBackend>);

        let worker_pool: Arc<WorkerPool<Result<String, ToolError>>> =
            Arc::new(WorkerPool::with_defaults());

        let pipeline_config = PipelineConfig {
            default_system_prompt: config.agent.system_prompt.clone(),
            autonomy: security.autonomy,
            mesh_enabled: config.routing.mesh_enabled,
            enable_state_snapshots: true,
            context: Default::default(),
            security,
            max_retries: 2,
        };
        let mut pipeline = InboundPipeline::new(
            Arc::clone(&engine),
            tools,
            Arc::clone(&sessions),
            message_router,
            agent_router,
            pipeline_config,
        )
        .with_worker_pool(Arc::clone(&worker_pool));
        if let Some(memory) = &memory {
            pipeline = pipeline.with_hooks(Arc::new(MemoryRecallHooks::new(Arc::clone(memory))));
        }
        let pipeline = Arc::new(pipeline);

        let supervisor = Arc::new(ChannelSupervisor::new(SupervisorOptions::default()));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&pipeline)));
        for job in &config.scheduler.jobs {
            let mut cron_job = CronJob::new(&job.name, &job.schedule, &job.message);
            cron_job.enabled = job.enabled;
            cron_job.user_id = job.user_id.clone();
            scheduler
                .add_job(cron_job)
                .await
                .with_context(|| format!("invalid scheduler job '{}'", job.name))?;
        }

        let pairing = config
            .gateway
            .pairing_enabled
            .then(|| Arc::new(PairingManager::new()));

        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        Ok(Self {
            config,
            sessions,
            pipeline,
            supervisor,
            scheduler,
            pairing,
            memory,
            worker_pool,
            shutdown: CancellationToken::new(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn pipeline(&self) -> Arc<InboundPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn pairing(&self) -> Option<Arc<PairingManager>> {
        self.pairing.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Registers a channel adapter: outbound sends go through the pipeline
    /// registry, lifecycle goes under the supervisor with a periodic health
    /// probe that forces a restart when the adapter reports unhealthy.
    pub async fn add_channel(&self, channel: Arc<dyn Channel>) {
        self.pipeline.register_channel(Arc::clone(&channel)).await;

        let (presence_tx, mut presence_rx) =
            mpsc::channel::<crate::channels::PresenceEvent>(64);
        tokio::spawn(async move {
            while let Some(event) = presence_rx.recv().await {
                debug!(channel = %event.channel_id, status = %event.status, "Presence update");
            }
        });

        let ctx = ChannelContext {
            inbound: self.inbound_tx.clone(),
            presence: presence_tx,
        };
        let id = channel.id().to_string();
        self.supervisor
            .add_child(ChildSpec::new(id, move || {
                let channel = Arc::clone(&channel);
                let ctx = ctx.clone();
                Box::pin(async move {
                    channel
                        .start(ctx)
                        .await
                        .map_err(|e| anyhow::anyhow!("channel start failed: {e}"))?;
                    loop {
                        tokio::time::sleep(CHANNEL_HEALTH_INTERVAL).await;
                        if !channel.is_healthy() {
                            anyhow::bail!("channel reported unhealthy");
                        }
                    }
                })
            }))
            .await;
    }

    /// Runs the gateway until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            port = self.config.gateway.port,
            "Starting gateway daemon"
        );

        // Inbound dispatcher: channel adapters -> pipeline tasks.
        let mut inbound_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .context("gateway already running")?;
        let pipeline = Arc::clone(&self.pipeline);
        let dispatcher_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatcher_shutdown.cancelled() => break,
                    msg = inbound_rx.recv() => match msg {
                        Some(msg) => pipeline.dispatch(msg),
                        None => break,
                    }
                }
            }
        });

        self.supervisor.start().await;
        self.scheduler.start().await;
        self.spawn_eviction_sweep();
        self.spawn_memory_monitor();

        if let Some(pairing) = &self.pairing {
            match pairing.generate_code(Some("first-device".into())) {
                Ok(code) => {
                    info!("=======================================================");
                    info!("Pairing code (one-time, expires in 5 minutes):");
                    info!("  {}", code.code);
                    info!("=======================================================");
                }
                Err(e) => warn!(error = %e, "Could not mint initial pairing code"),
            }
        }

        // HTTP control plane.
        let mut state = AppState::new(
            Arc::clone(&self.sessions),
            self.pairing.clone(),
            Arc::clone(&self.pipeline),
        )
        .with_identity(self.config.gateway.identity_enabled);
        if self.config.tunnel.enabled {
            state.tunnel_connected = Some(false);
        }
        let router = build_router(state);
        let addr = std::net::SocketAddr::new(
            self.config
                .gateway
                .host
                .parse()
                .context("gateway.host is not an IP address")?,
            self.config.port(),
        );
        let http_shutdown = CancellationToken::new();
        let server = tokio::spawn(crate::server::serve(
            router,
            addr,
            http_shutdown.clone(),
        ));

        info!("Gateway is running. Press Ctrl+C to stop.");
        wait_for_signal().await;
        info!("Shutdown signal received, starting graceful shutdown");

        // 1. No new cron triggers.
        self.scheduler.stop().await;
        // 2. No new inbound messages.
        self.supervisor.stop().await;
        self.shutdown.cancel();
        // 3. Drain in-flight loops.
        let drain_timeout = Duration::from_secs(self.config.gateway.drain_timeout_secs);
        if self.pipeline.wait_for_drain(drain_timeout).await {
            info!("All in-flight loops drained");
        } else {
            warn!(
                remaining = self.pipeline.in_flight_count(),
                "Drain timeout hit, abandoning remaining loops"
            );
        }
        // 4. Worker pool, then the memory backend.
        self.worker_pool.close().await;
        if let Some(memory) = &self.memory {
            if let Err(e) = memory.close().await {
                error!(error = %e, "Memory backend close failed");
            }
        }
        // 5. HTTP server last, so health stays observable during drain.
        http_shutdown.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server error"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }

        info!("Gateway stopped");
        Ok(())
    }

    fn spawn_eviction_sweep(&self) {
        let sessions = Arc::clone(&self.sessions);
        let max_idle_ms = (self.config.gateway.session_idle_minutes * 60 * 1000) as i64;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        sessions.evict_idle(max_idle_ms).await;
                    }
                }
            }
        });
    }

    fn spawn_memory_monitor(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            use sysinfo::{System, get_current_pid};

            let Ok(pid) = get_current_pid() else {
                warn!("Cannot determine own pid, memory monitor disabled");
                return;
            };
            let mut system = System::new();
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        system.refresh_all();
                        if let Some(process) = system.process(pid) {
                            let memory_mb = process.memory() / (1024 * 1024);
                            if memory_mb > MEMORY_WARNING_THRESHOLD_MB {
                                warn!(memory_mb, threshold_mb = MEMORY_WARNING_THRESHOLD_MB, "Memory usage exceeds threshold");
                            } else {
                                debug!(memory_mb, "Memory usage");
                            }
                        }
                    }
                }
            }
        });
    }
}

fn build_engine(config: &Config) -> Result<Arc<dyn Engine>> {
    match config.engines.default.as_str() {
        "mock" => {
            let engine = MockEngine::new();
            engine.set_default_turn(vec![
                crate::engine::EngineEvent::Started,
                crate::engine::EngineEvent::Completed {
                    answer: "No engine transport is configured; this is the built-in mock."
                        .to_string(),
                    usage: crate::engine::Usage::default(),
                },
            ]);
            Ok(Arc::new(engine))
        }
        "subprocess" => {
            let command = config
                .engines
                .subprocess_command
                .as_deref()
                .context("engines.subprocess_command is required for the subprocess engine")?;
            let engine = crate::engine::subprocess::SubprocessEngine::new(command)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(Arc::new(engine))
        }
        other => anyhow::bail!(
            "engine '{other}' is not available in this build; configure engines.default = \"mock\" or \"subprocess\""
        ),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Signal listener failed");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
