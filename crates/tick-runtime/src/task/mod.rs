use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::Mutex;

use tick_core::node::{BatchQuerier, HttpOutRegistry, SideloadRegistry, UdfRegistry};
use tick_lang::compiler::{Dag, NodeSpec, QuerySpec};

use crate::alert_service::AlertService;
use crate::ingest::IngestRouter;
use crate::model::{
    ApiError, ApiResult, DbrpRecord, Task, TaskStatus, Template, VarRecord, bind_vars, valid_id,
};
use crate::store::FsStore;

mod exec;
mod template;


pub use exec::{ExecDeps, TaskExec, start_dag};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub id: String,
    pub template_id: Option<String>,
    /// Ignored when `template_id` is set; the template supplies the script.
    pub script: String,
    pub dbrps: Vec<DbrpRecord>,
    pub vars: BTreeMap<String, VarRecord>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTask {
    pub new_id: Option<String>,
    pub script: Option<String>,
    pub dbrps: Option<Vec<DbrpRecord>>,
    pub vars: Option<BTreeMap<String, VarRecord>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Wildcard pattern over task ids (`*` and `?`).
    pub pattern: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
    /// Field projection for [`TaskManager::list_projected`]; empty keeps
    /// every field.
    pub fields: Vec<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct TaskEntry {
    record: Task,
    dag: Arc<Dag>,
    exec: Option<TaskExec>,
}

struct Registry {
    tasks: HashMap<String, TaskEntry>,
    templates: HashMap<String, Template>,
}

/// Owns every task: records, compiled DAGs, and running executions.
///
/// Mutations go through one lock; reads use a snapshot that is swapped
/// under that lock, so enumeration never contends with task churn.
pub struct TaskManager {
    store: Arc<FsStore>,
    alerts: Arc<AlertService>,
    router: Arc<IngestRouter>,
    http_out: Arc<HttpOutRegistry>,
    sideloads: Arc<SideloadRegistry>,
    udfs: Arc<UdfRegistry>,
    querier: ArcSwap<Option<Arc<dyn BatchQuerier>>>,
    base_dir: PathBuf,
    inner: Mutex<Registry>,
    snapshot: ArcSwap<Vec<Task>>,
    num_tasks: AtomicU64,
    num_enabled: AtomicU64,
    weak_self: Weak<TaskManager>,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<FsStore>,
        alerts: Arc<AlertService>,
        router: Arc<IngestRouter>,
        http_out: Arc<HttpOutRegistry>,
        sideloads: Arc<SideloadRegistry>,
        udfs: Arc<UdfRegistry>,
        querier: Option<Arc<dyn BatchQuerier>>,
        base_dir: PathBuf,
    ) -> Arc<TaskManager> {
        Arc::new_cyclic(|weak| TaskManager {
            store,
            alerts,
            router,
            http_out,
            sideloads,
            udfs,
            querier: ArcSwap::from_pointee(querier),
            base_dir,
            inner: Mutex::new(Registry {
                tasks: HashMap::new(),
                templates: HashMap::new(),
            }),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            num_tasks: AtomicU64::new(0),
            num_enabled: AtomicU64::new(0),
            weak_self: weak.clone(),
        })
    }

    // -- compile helpers ----------------------------------------------------

    pub(crate) fn compile_script(
        script: &str,
        vars: &BTreeMap<String, VarRecord>,
    ) -> anyhow::Result<Dag> {
        let program = tick_lang::parse_program(script)?;
        let values = bind_vars(vars)?;
        tick_lang::compile(&program, &values)
    }

    /// Implicit (script) OR explicit (request) dbrps, never a conflicting
    /// both.
    fn resolve_dbrps(dag: &Dag, explicit: &[DbrpRecord]) -> ApiResult<Vec<DbrpRecord>> {
        let implicit: BTreeSet<DbrpRecord> = dag.dbrps.iter().map(DbrpRecord::from).collect();
        let explicit: BTreeSet<DbrpRecord> = explicit.iter().cloned().collect();
        let chosen = match (implicit.is_empty(), explicit.is_empty()) {
            (false, false) => {
                if implicit != explicit {
                    return Err(ApiError::Validation(
                        "dbrps given in both the script and the request must match exactly"
                            .to_string(),
                    ));
                }
                implicit
            }
            (false, true) => implicit,
            (true, false) => explicit,
            (true, true) => {
                return Err(ApiError::Validation(
                    "task defines no dbrp; declare one in the script or the request".to_string(),
                ));
            }
        };
        Ok(chosen.into_iter().collect())
    }

    fn exec_deps(&self) -> ExecDeps {
        ExecDeps {
            events: self.alerts.clone(),
            http_out: Arc::clone(&self.http_out),
            sideloads: Arc::clone(&self.sideloads),
            udfs: Arc::clone(&self.udfs),
            querier: (**self.querier.load()).clone(),
            base_dir: self.base_dir.clone(),
        }
    }

    fn start_entry(&self, entry: &mut TaskEntry) -> ApiResult<()> {
        let id = entry.record.id.clone();
        let weak = self.weak_self.clone();
        let fatal_id = id.clone();
        let on_fatal = Box::new(move |msg: String| {
            if let Some(manager) = weak.upgrade() {
                tokio::spawn(async move {
                    manager.mark_failed(&fatal_id, msg).await;
                });
            }
        });
        let exec = start_dag(&id, &entry.dag, &self.exec_deps(), on_fatal)
            .map_err(ApiError::Internal)?;
        self.router
            .register_task(&id, &entry.record.dbrps, exec.input.clone());
        entry.exec = Some(exec);
        entry.record.last_enabled = Some(Utc::now());
        Ok(())
    }

    async fn stop_entry(&self, id: &str, entry: &mut TaskEntry) {
        self.router.unregister_task(id);
        self.http_out.remove_prefix(&format!("/tasks/{id}/"));
        if let Some(exec) = entry.exec.take() {
            exec.stop(DRAIN_TIMEOUT).await;
        }
    }

    /// First fatal node error: record it, tear down, keep the
    /// administrative status so a restart re-attempts.
    async fn mark_failed(&self, id: &str, msg: String) {
        let mut reg = self.inner.lock().await;
        let Some(entry) = reg.tasks.get_mut(id) else {
            return;
        };
        entry.record.error = msg;
        entry.record.modified = Utc::now();
        self.router.unregister_task(id);
        if let Some(exec) = entry.exec.take() {
            // The supervisor has already cancelled the DAG.
            exec.stop(Duration::from_millis(100)).await;
        }
        let _ = self.store.put(&format!("tasks/{id}"), &entry.record);
        self.refresh_snapshot(&reg);
    }

    fn refresh_snapshot(&self, reg: &Registry) {
        let mut tasks: Vec<Task> = reg.tasks.values().map(|e| e.record.clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        self.num_tasks.store(tasks.len() as u64, Ordering::Relaxed);
        self.num_enabled.store(
            tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Enabled)
                .count() as u64,
            Ordering::Relaxed,
        );
        self.snapshot.store(Arc::new(tasks));
    }

    fn persist(&self, record: &Task) -> ApiResult<()> {
        self.store
            .put(&format!("tasks/{}", record.id), record)
            .map_err(ApiError::Internal)
    }

    // -- task CRUD ----------------------------------------------------------

    pub async fn create(&self, req: CreateTask) -> ApiResult<Task> {
        if !valid_id(&req.id) {
            return Err(ApiError::Validation(format!(
                "invalid task id {:?}: must match [A-Za-z0-9._-]+",
                req.id
            )));
        }
        let mut reg = self.inner.lock().await;
        if reg.tasks.contains_key(&req.id) {
            return Err(ApiError::Conflict(format!(
                "task already exists: {}",
                req.id
            )));
        }

        let script = match &req.template_id {
            Some(tid) => reg
                .templates
                .get(tid)
                .ok_or_else(|| ApiError::NotFound(format!("no template exists: {tid}")))?
                .script
                .clone(),
            None => req.script.clone(),
        };

        let dag = Self::compile_script(&script, &req.vars)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        let dbrps = Self::resolve_dbrps(&dag, &req.dbrps)?;

        let now = Utc::now();
        let record = Task {
            id: req.id.clone(),
            task_type: dag.task_type.name().to_string(),
            dbrps,
            script,
            status: if req.enabled {
                TaskStatus::Enabled
            } else {
                TaskStatus::Disabled
            },
            template_id: req.template_id.clone(),
            vars: req.vars,
            created: now,
            modified: now,
            last_enabled: None,
            error: String::new(),
        };
        self.persist(&record)?;

        let mut entry = TaskEntry {
            record,
            dag: Arc::new(dag),
            exec: None,
        };
        if req.enabled {
            if let Err(e) = self.start_entry(&mut entry) {
                entry.record.error = e.to_string();
                let _ = self.persist(&entry.record);
                reg.tasks.insert(req.id, entry);
                self.refresh_snapshot(&reg);
                return Err(e);
            }
            self.persist(&entry.record)?;
        }
        let task = entry.record.clone();
        reg.tasks.insert(req.id, entry);
        self.refresh_snapshot(&reg);
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        let reg = self.inner.lock().await;
        reg.tasks.get(id).map(|e| e.record.clone())
    }

    /// Paged listing over the read snapshot.
    pub fn list(&self, filter: &ListFilter) -> Vec<Task> {
        let snapshot = self.snapshot.load();
        let matcher = filter
            .pattern
            .as_deref()
            .map(wildmatch::WildMatch::new);
        snapshot
            .iter()
            .filter(|t| matcher.as_ref().map(|m| m.matches(&t.id)).unwrap_or(true))
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Listing with field projection: each task rendered as a JSON object
    /// restricted to the requested fields.
    pub fn list_projected(&self, filter: &ListFilter) -> Vec<serde_json::Value> {
        self.list(filter)
            .into_iter()
            .map(|t| {
                let mut v = serde_json::to_value(&t).expect("task serializes");
                if !filter.fields.is_empty()
                    && let serde_json::Value::Object(map) = &mut v
                {
                    map.retain(|k, _| filter.fields.iter().any(|f| f == k));
                }
                v
            })
            .collect()
    }

    /// Per-node counters of a running task.
    pub async fn describe(
        &self,
        id: &str,
    ) -> ApiResult<Vec<(String, tick_core::node::NodeStatsSnapshot)>> {
        let reg = self.inner.lock().await;
        let entry = reg
            .tasks
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("no task exists: {id}")))?;
        let Some(exec) = &entry.exec else {
            return Err(ApiError::Validation(format!("task {id} is not running")));
        };
        Ok(exec
            .stats
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect())
    }

    pub async fn update(&self, id: &str, req: UpdateTask) -> ApiResult<Task> {
        let mut reg = self.inner.lock().await;
        if !reg.tasks.contains_key(id) {
            return Err(ApiError::NotFound(format!("no task exists: {id}")));
        }

        let new_id = match &req.new_id {
            Some(nid) if nid != id => {
                if !valid_id(nid) {
                    return Err(ApiError::Validation(format!("invalid task id {nid:?}")));
                }
                if reg.tasks.contains_key(nid) {
                    return Err(ApiError::Conflict(format!("name conflict: {nid}")));
                }
                Some(nid.clone())
            }
            _ => None,
        };

        let entry = reg.tasks.get(id).expect("checked above");
        let script = req.script.clone().unwrap_or_else(|| entry.record.script.clone());
        let vars = req.vars.clone().unwrap_or_else(|| entry.record.vars.clone());
        let dag = Self::compile_script(&script, &vars)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        let explicit = req.dbrps.unwrap_or_else(|| entry.record.dbrps.clone());
        let dbrps = Self::resolve_dbrps(&dag, &explicit)?;

        let mut entry = reg.tasks.remove(id).expect("checked above");
        let was_running = entry.exec.is_some();
        if was_running {
            self.stop_entry(id, &mut entry).await;
        }
        if let Some(nid) = &new_id {
            self.store
                .delete(&format!("tasks/{id}"))
                .map_err(ApiError::Internal)?;
            entry.record.id = nid.clone();
        }
        entry.record.script = script;
        entry.record.vars = vars;
        entry.record.dbrps = dbrps;
        entry.record.task_type = dag.task_type.name().to_string();
        entry.record.modified = Utc::now();
        entry.record.error = String::new();
        entry.dag = Arc::new(dag);

        if was_running
            && let Err(e) = self.start_entry(&mut entry)
        {
            reg.tasks.insert(entry.record.id.clone(), entry);
            self.refresh_snapshot(&reg);
            return Err(e);
        }
        self.persist(&entry.record)?;
        let task = entry.record.clone();
        reg.tasks.insert(task.id.clone(), entry);
        self.refresh_snapshot(&reg);
        Ok(task)
    }

    /// Idempotent enable: compiles are already cached, so this only starts
    /// the DAG and flips the status.
    pub async fn enable(&self, id: &str) -> ApiResult<Task> {
        let mut reg = self.inner.lock().await;
        let Some(mut entry) = reg.tasks.remove(id) else {
            return Err(ApiError::NotFound(format!("no task exists: {id}")));
        };
        if entry.exec.is_none() {
            entry.record.error = String::new();
            if let Err(e) = self.start_entry(&mut entry) {
                reg.tasks.insert(id.to_string(), entry);
                return Err(e);
            }
        }
        entry.record.status = TaskStatus::Enabled;
        self.persist(&entry.record)?;
        let task = entry.record.clone();
        reg.tasks.insert(id.to_string(), entry);
        self.refresh_snapshot(&reg);
        Ok(task)
    }

    /// Idempotent disable: cancels the DAG cooperatively and waits for it,
    /// then drops the task's anonymous topic state.
    pub async fn disable(&self, id: &str) -> ApiResult<Task> {
        let mut reg = self.inner.lock().await;
        if !reg.tasks.contains_key(id) {
            return Err(ApiError::NotFound(format!("no task exists: {id}")));
        }
        let mut entry = reg.tasks.remove(id).expect("present");
        self.stop_entry(id, &mut entry).await;
        self.alerts
            .remove_task_topics(id)
            .map_err(ApiError::Internal)?;
        entry.record.status = TaskStatus::Disabled;
        self.persist(&entry.record)?;
        let task = entry.record.clone();
        reg.tasks.insert(id.to_string(), entry);
        self.refresh_snapshot(&reg);
        Ok(task)
    }

    pub async fn delete(&self, id: &str) -> ApiResult<()> {
        let mut reg = self.inner.lock().await;
        let Some(mut entry) = reg.tasks.remove(id) else {
            return Err(ApiError::NotFound(format!("no task exists: {id}")));
        };
        self.stop_entry(id, &mut entry).await;
        self.alerts
            .remove_task_topics(id)
            .map_err(ApiError::Internal)?;
        self.store
            .delete(&format!("tasks/{id}"))
            .map_err(ApiError::Internal)?;
        self.refresh_snapshot(&reg);
        Ok(())
    }

    // -- execution plumbing -------------------------------------------------

    /// DOT rendering of the compiled DAG for debugging output.
    pub async fn dot(&self, id: &str) -> ApiResult<String> {
        let reg = self.inner.lock().await;
        let entry = reg
            .tasks
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("no task exists: {id}")))?;
        Ok(entry.dag.dot(id))
    }

    /// Inject a message into a running task's input edge (replays).
    pub async fn inject(&self, id: &str, msg: tick_core::point::Message) -> ApiResult<()> {
        let input = {
            let reg = self.inner.lock().await;
            let entry = reg
                .tasks
                .get(id)
                .ok_or_else(|| ApiError::NotFound(format!("no task exists: {id}")))?;
            let Some(exec) = &entry.exec else {
                return Err(ApiError::Validation(format!("task {id} is not enabled")));
            };
            exec.input.clone()
        };
        input
            .send(msg)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
        Ok(())
    }

    pub async fn task_dbrps(&self, id: &str) -> ApiResult<Vec<DbrpRecord>> {
        self.get(id)
            .await
            .map(|t| t.dbrps)
            .ok_or_else(|| ApiError::NotFound(format!("no task exists: {id}")))
    }

    /// Query specs of a batch task's roots (recording re-execution).
    pub async fn task_queries(&self, id: &str) -> ApiResult<Vec<QuerySpec>> {
        let reg = self.inner.lock().await;
        let entry = reg
            .tasks
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("no task exists: {id}")))?;
        Ok(entry
            .dag
            .nodes
            .iter()
            .filter_map(|n| match n {
                NodeSpec::Query(q) => Some(q.clone()),
                _ => None,
            })
            .collect())
    }

    pub fn current_querier(&self) -> Option<Arc<dyn BatchQuerier>> {
        (**self.querier.load()).clone()
    }

    /// Swap the upstream boundary and restart enabled query tasks: quiesce
    /// on the old snapshot, start on the new.
    pub async fn set_querier(&self, querier: Option<Arc<dyn BatchQuerier>>) -> ApiResult<()> {
        self.querier.store(Arc::new(querier));
        let ids: Vec<String> = {
            let reg = self.inner.lock().await;
            reg.tasks
                .values()
                .filter(|e| {
                    e.exec.is_some()
                        && e.dag.nodes.iter().any(|n| matches!(n, NodeSpec::Query(_)))
                })
                .map(|e| e.record.id.clone())
                .collect()
        };
        for id in ids {
            let mut reg = self.inner.lock().await;
            if let Some(mut entry) = reg.tasks.remove(&id) {
                self.stop_entry(&id, &mut entry).await;
                self.start_entry(&mut entry)?;
                reg.tasks.insert(id, entry);
            }
        }
        Ok(())
    }

    // -- startup ------------------------------------------------------------

    /// Load persisted tasks and templates; re-start the enabled ones. A
    /// task that fails to compile or start keeps its enabled status and
    /// records the error.
    pub async fn restore(&self) -> anyhow::Result<(usize, usize)> {
        let mut reg = self.inner.lock().await;

        for id in self.store.list("templates")? {
            if let Some(t) = self.store.get::<Template>(&format!("templates/{id}"))? {
                reg.templates.insert(id, t);
            }
        }

        let mut started = 0usize;
        let ids = self.store.list("tasks")?;
        let total = ids.len();
        for id in ids {
            let Some(mut record) = self.store.get::<Task>(&format!("tasks/{id}"))? else {
                continue;
            };
            match Self::compile_script(&record.script, &record.vars) {
                Ok(dag) => {
                    let mut entry = TaskEntry {
                        record,
                        dag: Arc::new(dag),
                        exec: None,
                    };
                    if entry.record.status == TaskStatus::Enabled {
                        match self.start_entry(&mut entry) {
                            Ok(()) => started += 1,
                            Err(e) => {
                                entry.record.error = e.to_string();
                            }
                        }
                    }
                    reg.tasks.insert(id, entry);
                }
                Err(e) => {
                    td_warn!(task, task = %id, error = %e, "stored task no longer compiles");
                    record.error = e.to_string();
                    // Keep the record visible even though it cannot run.
                    let dag = Arc::new(Dag {
                        task_type: tick_lang::TaskType::Stream,
                        dbrps: Vec::new(),
                        nodes: Vec::new(),
                        edges: Vec::new(),
                    });
                    reg.tasks.insert(
                        id,
                        TaskEntry {
                            record,
                            dag,
                            exec: None,
                        },
                    );
                }
            }
        }
        self.refresh_snapshot(&reg);
        Ok((total, started))
    }

    /// Stop every running task without touching administrative status
    /// (server shutdown path).
    pub async fn stop_all(&self) {
        let mut reg = self.inner.lock().await;
        let ids: Vec<String> = reg
            .tasks
            .iter()
            .filter(|(_, e)| e.exec.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(mut entry) = reg.tasks.remove(&id) {
                self.stop_entry(&id, &mut entry).await;
                reg.tasks.insert(id, entry);
            }
        }
    }

    pub fn num_tasks(&self) -> u64 {
        self.num_tasks.load(Ordering::Relaxed)
    }

    pub fn num_enabled_tasks(&self) -> u64 {
        self.num_enabled.load(Ordering::Relaxed)
    }
}
