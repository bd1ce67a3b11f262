use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use orion_error::compat_prelude::*;
use orion_error::op_context;
use orion_error::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tick_config::{ConfigOverrides, EngineConfig};
use tick_core::node::{
    BatchQuerier, HttpOutRegistry, SideloadRegistry, UdfConfig, UdfRegistry,
};

use crate::alert_service::AlertService;
use crate::error::{RuntimeReason, RuntimeResult};
use crate::ingest::IngestRouter;
use crate::model::ApiResult;
use crate::receiver::Receiver;
use crate::replay::ReplayService;
use crate::store::FsStore;
use crate::task::TaskManager;

// ---------------------------------------------------------------------------
// TaskGroup — named collection of async tasks for ordered shutdown
// ---------------------------------------------------------------------------

/// A named group of async tasks that are shut down together.
///
/// Groups are assembled in start order and joined in reverse (LIFO) during
/// [`Server::wait`]: the receiver stops first so no new points arrive, then
/// task DAGs drain, then the alert workers flush.
struct TaskGroup {
    name: &'static str,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
        }
    }

    fn push(&mut self, handle: JoinHandle<anyhow::Result<()>>) {
        self.handles.push(handle);
    }

    async fn wait(self) -> RuntimeResult<()> {
        for handle in self.handles {
            handle
                .await
                .map_err(|e| {
                    StructError::from(RuntimeReason::Shutdown)
                        .with_detail(format!("task join error: {e}"))
                })?
                .owe(RuntimeReason::Shutdown)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The running engine: durable store, alert service, task manager, replay
/// service, and the TCP receiver, with cooperative LIFO shutdown.
pub struct Server {
    cancel: CancellationToken,
    groups: Vec<TaskGroup>,
    listen_addr: SocketAddr,
    pub manager: Arc<TaskManager>,
    pub alerts: Arc<AlertService>,
    pub replays: Arc<ReplayService>,
    pub overrides: Arc<ConfigOverrides>,
    pub http_out: Arc<HttpOutRegistry>,
    pub router: Arc<IngestRouter>,
    sideloads: Arc<SideloadRegistry>,
}

pub struct ServerBuilder {
    config: EngineConfig,
    base_dir: PathBuf,
    querier: Option<Arc<dyn BatchQuerier>>,
}

impl ServerBuilder {
    /// Inject the upstream DB boundary used by batch query nodes. Without
    /// one, query tasks log transient errors until an upstream is wired.
    pub fn querier(mut self, querier: Arc<dyn BatchQuerier>) -> Self {
        self.querier = Some(querier);
        self
    }

    pub async fn start(self) -> RuntimeResult<Server> {
        Server::start_inner(self.config, &self.base_dir, self.querier).await
    }
}

impl Server {
    pub fn builder(config: EngineConfig, base_dir: &Path) -> ServerBuilder {
        ServerBuilder {
            config,
            base_dir: base_dir.to_path_buf(),
            querier: None,
        }
    }

    /// Bootstrap from config: open the store, restore alert topics and
    /// tasks, then start accepting points.
    pub async fn start(config: EngineConfig, base_dir: &Path) -> RuntimeResult<Server> {
        Self::start_inner(config, base_dir, None).await
    }

    async fn start_inner(
        config: EngineConfig,
        base_dir: &Path,
        querier: Option<Arc<dyn BatchQuerier>>,
    ) -> RuntimeResult<Server> {
        let mut op = op_context!("engine-bootstrap").with_auto_log();
        op.record("listen", config.server.listen.as_str());
        op.record("base_dir", base_dir.display().to_string().as_str());

        let cancel = CancellationToken::new();

        let storage_dir = resolve(base_dir, &config.storage.dir);
        let store = Arc::new(FsStore::open(&storage_dir).owe(RuntimeReason::Storage)?);

        let alerts = AlertService::new(
            Arc::clone(&store),
            config.alert.clone(),
            base_dir.to_path_buf(),
        );
        let restored_topics = alerts.restore().owe(RuntimeReason::Bootstrap)?;

        let http_out = Arc::new(HttpOutRegistry::default());
        let sideloads = Arc::new(SideloadRegistry::default());
        let udfs = Arc::new(UdfRegistry {
            procs: config
                .udf
                .functions
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        UdfConfig {
                            command: f.command.clone(),
                            args: f.args.clone(),
                            timeout: f.timeout.map(|t| t.as_duration()),
                        },
                    )
                })
                .collect(),
            default_timeout: config.udf.timeout.as_duration(),
        });
        let router = Arc::new(IngestRouter::default());

        let manager = TaskManager::new(
            Arc::clone(&store),
            Arc::clone(&alerts),
            Arc::clone(&router),
            Arc::clone(&http_out),
            Arc::clone(&sideloads),
            Arc::clone(&udfs),
            querier,
            base_dir.to_path_buf(),
        );
        let (total_tasks, started_tasks) =
            manager.restore().await.owe(RuntimeReason::Bootstrap)?;

        let artifacts = resolve(base_dir, &config.storage.recordings_dir());
        let replays = ReplayService::new(
            Arc::clone(&store),
            artifacts,
            Arc::clone(&router),
            Arc::clone(&manager),
        )
        .owe(RuntimeReason::Bootstrap)?;

        td_info!(
            sys,
            topics = restored_topics,
            tasks = total_tasks,
            enabled = started_tasks,
            "state restored"
        );

        // Receiver last: points only flow once everything is ready.
        let receiver = Receiver::bind(&config.server.listen, Arc::clone(&router))
            .await
            .owe_sys()?;
        let listen_addr = receiver.local_addr().owe_sys()?;
        let receiver_cancel = receiver.cancel_token();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            watch_cancel.cancelled().await;
            receiver_cancel.cancel();
        });
        let mut receiver_group = TaskGroup::new("receiver");
        receiver_group.push(tokio::spawn(async move { receiver.run().await }));

        let overrides = Arc::new(ConfigOverrides::new(config));

        op.mark_suc();
        Ok(Server {
            cancel,
            groups: vec![receiver_group],
            listen_addr,
            manager,
            alerts,
            replays,
            overrides,
            http_out,
            router,
            sideloads,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        td_info!(sys, "initiating graceful shutdown");
        self.cancel.cancel();
    }

    /// Join everything in reverse start order: receiver first (no new
    /// points), then the task DAGs drain, then alert delivery flushes.
    pub async fn wait(mut self) -> RuntimeResult<()> {
        while let Some(group) = self.groups.pop() {
            let name = group.name;
            td_debug!(sys, task_group = name, "waiting for task group to finish");
            group.wait().await?;
            td_debug!(sys, task_group = name, "task group finished");
        }
        self.manager.stop_all().await;
        self.alerts.shutdown().await;
        Ok(())
    }

    /// Re-read reloadable inputs (sideload sources).
    pub fn reload(&self) {
        self.sideloads.reload_all();
        td_info!(conf, "sideload sources reloaded");
    }

    /// Apply a config-element override: publish the new snapshot, then
    /// restart the tasks that depend on the changed section (quiesced on
    /// the old snapshot first).
    pub async fn update_config(
        &self,
        section: &str,
        index: Option<usize>,
        set: &serde_json::Map<String, serde_json::Value>,
    ) -> ApiResult<()> {
        self.overrides
            .update_element(section, index, set)
            .map_err(crate::model::ApiError::Internal)?;
        if section == "upstream" {
            let current = self.manager.current_querier();
            self.manager.set_querier(current).await?;
        }
        td_info!(conf, section = section, "configuration override applied");
        Ok(())
    }

    /// `/debug/vars` counters.
    pub fn debug_vars(&self) -> serde_json::Value {
        serde_json::json!({
            "num_tasks": self.manager.num_tasks(),
            "num_enabled_tasks": self.manager.num_enabled_tasks(),
        })
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Register Ctrl-C (SIGINT) and SIGTERM handling; cancel the engine on the
/// first signal received.
pub async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                td_info!(sys, signal = "SIGINT", "received signal, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                td_info!(sys, signal = "SIGTERM", "received signal, initiating graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
        td_info!(sys, "received shutdown signal, initiating graceful shutdown");
    }
    cancel.cancel();
}
