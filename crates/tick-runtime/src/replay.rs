use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tick_core::point::{Message, Point};

use crate::ingest::IngestRouter;
use crate::model::{ApiError, ApiResult, Recording, Replay, ReplayClock, RunStatus, valid_id};
use crate::store::FsStore;
use crate::task::TaskManager;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Captures task inputs to append-only artifacts and replays them under a
/// chosen clock. Artifacts are JSONL files of [`Message`]s, addressed by
/// recording id under the artifacts directory.
pub struct ReplayService {
    store: Arc<FsStore>,
    artifacts: PathBuf,
    router: Arc<IngestRouter>,
    manager: Arc<TaskManager>,
    recordings: Mutex<HashMap<String, RecordingHandle>>,
    /// recording id → number of running replays reading it.
    replaying: Mutex<HashMap<String, usize>>,
    replays: Mutex<HashMap<String, JoinHandle<()>>>,
    weak_self: std::sync::Weak<ReplayService>,
}

struct RecordingHandle {
    cancel: CancellationToken,
    writer: JoinHandle<()>,
}

impl ReplayService {
    pub fn new(
        store: Arc<FsStore>,
        artifacts: PathBuf,
        router: Arc<IngestRouter>,
        manager: Arc<TaskManager>,
    ) -> Result<Arc<ReplayService>> {
        std::fs::create_dir_all(&artifacts)
            .with_context(|| format!("create artifacts dir {}", artifacts.display()))?;
        Ok(Arc::new_cyclic(|weak| ReplayService {
            store,
            artifacts,
            router,
            manager,
            recordings: Mutex::new(HashMap::new()),
            replaying: Mutex::new(HashMap::new()),
            replays: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        }))
    }

    fn strong(&self) -> Arc<ReplayService> {
        self.weak_self.upgrade().expect("service alive")
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.artifacts.join(id)
    }

    fn persist_recording(&self, rec: &Recording) -> ApiResult<()> {
        self.store
            .put(&format!("recordings/{}", rec.id), rec)
            .map_err(ApiError::Internal)
    }

    fn persist_replay(&self, rep: &Replay) -> ApiResult<()> {
        self.store
            .put(&format!("replays/{}", rep.id), rep)
            .map_err(ApiError::Internal)
    }

    // -- recording ----------------------------------------------------------

    /// Tee a stream task's input into an artifact until `stop` (point time)
    /// or an explicit [`stop_recording`](Self::stop_recording).
    pub async fn record_stream(
        &self,
        id: &str,
        task_id: &str,
        stop: Option<DateTime<Utc>>,
    ) -> ApiResult<Recording> {
        if !valid_id(id) {
            return Err(ApiError::Validation(format!("invalid recording id {id:?}")));
        }
        if self
            .store
            .get::<Recording>(&format!("recordings/{id}"))
            .map_err(ApiError::Internal)?
            .is_some()
        {
            return Err(ApiError::Conflict(format!(
                "recording already exists: {id}"
            )));
        }
        let dbrps = self.manager.task_dbrps(task_id).await?;

        let rec = Recording {
            id: id.to_string(),
            kind: "stream".into(),
            status: RunStatus::Running,
            size: 0,
            date: Utc::now(),
            error: None,
            sha256: String::new(),
        };
        self.persist_recording(&rec)?;

        let (tee_tx, mut tee_rx) = mpsc::channel::<Point>(1024);
        self.router.add_tee(id, &dbrps, tee_tx);

        let cancel = CancellationToken::new();
        let writer_cancel = cancel.clone();
        let service = self.strong();
        let rec_id = id.to_string();
        let writer = tokio::spawn(async move {
            let result = service
                .write_stream_artifact(&rec_id, &mut tee_rx, stop, writer_cancel)
                .await;
            service.router.remove_tee(&rec_id);
            service.finish_recording(&rec_id, result);
        });

        self.recordings
            .lock()
            .expect("recordings lock")
            .insert(id.to_string(), RecordingHandle { cancel, writer });
        Ok(rec)
    }

    async fn write_stream_artifact(
        &self,
        id: &str,
        tee_rx: &mut mpsc::Receiver<Point>,
        stop: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Result<(u64, String)> {
        let path = self.artifact_path(id);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("create artifact {}", path.display()))?;
        let mut out = std::io::BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        loop {
            let point = tokio::select! {
                p = tee_rx.recv() => p,
                _ = cancel.cancelled() => None,
            };
            let Some(point) = point else { break };
            if let Some(stop) = stop
                && point.time >= stop
            {
                break;
            }
            let line = serde_json::to_string(&Message::Point(point))?;
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
            size += line.len() as u64 + 1;
        }
        out.flush()?;
        Ok((size, format!("{:x}", hasher.finalize())))
    }

    fn finish_recording(&self, id: &str, result: Result<(u64, String)>) {
        let mut rec = match self.store.get::<Recording>(&format!("recordings/{id}")) {
            Ok(Some(r)) => r,
            _ => return,
        };
        match result {
            Ok((size, sha256)) => {
                rec.status = RunStatus::Finished;
                rec.size = size;
                rec.sha256 = sha256;
            }
            Err(e) => {
                rec.status = RunStatus::Failed;
                rec.error = Some(e.to_string());
            }
        }
        let _ = self.store.put(&format!("recordings/{id}"), &rec);
    }

    /// Stop a running stream recording and wait for the artifact to be
    /// finalized.
    pub async fn stop_recording(&self, id: &str) -> ApiResult<Recording> {
        let handle = self
            .recordings
            .lock()
            .expect("recordings lock")
            .remove(id);
        match handle {
            Some(h) => {
                h.cancel.cancel();
                let _ = h.writer.await;
            }
            None => {
                return Err(ApiError::NotFound(format!(
                    "no running recording: {id}"
                )));
            }
        }
        self.get_recording(id)
    }

    /// Re-execute a batch task's queries over `[start, stop]` into an
    /// artifact; runs to completion before returning.
    pub async fn record_batch(
        &self,
        id: &str,
        task_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> ApiResult<Recording> {
        if !valid_id(id) {
            return Err(ApiError::Validation(format!("invalid recording id {id:?}")));
        }
        let queries = self.manager.task_queries(task_id).await?;
        if queries.is_empty() {
            return Err(ApiError::Validation(format!(
                "task {task_id} has no query nodes to record"
            )));
        }
        let Some(querier) = self.manager.current_querier() else {
            return Err(ApiError::Validation(
                "no upstream configured for batch queries".to_string(),
            ));
        };

        let mut rec = Recording {
            id: id.to_string(),
            kind: "batch".into(),
            status: RunStatus::Running,
            size: 0,
            date: Utc::now(),
            error: None,
            sha256: String::new(),
        };
        self.persist_recording(&rec)?;

        let result: Result<(u64, String)> = async {
            let path = self.artifact_path(id);
            let file = std::fs::File::create(&path)?;
            let mut out = std::io::BufWriter::new(file);
            let mut hasher = Sha256::new();
            let mut size = 0u64;
            for q in &queries {
                let mut window_stop = start + ChronoDuration::nanoseconds(q.period);
                while window_stop <= stop {
                    let window_start = window_stop - ChronoDuration::nanoseconds(q.period);
                    let batches = querier
                        .query(&q.query, window_start, window_stop, q.cluster.as_deref())
                        .await?;
                    for b in batches {
                        let line = serde_json::to_string(&Message::Batch(b))?;
                        out.write_all(line.as_bytes())?;
                        out.write_all(b"\n")?;
                        hasher.update(line.as_bytes());
                        hasher.update(b"\n");
                        size += line.len() as u64 + 1;
                    }
                    window_stop += ChronoDuration::nanoseconds(q.every.max(1));
                }
            }
            out.flush()?;
            Ok((size, format!("{:x}", hasher.finalize())))
        }
        .await;

        match result {
            Ok((size, sha256)) => {
                rec.status = RunStatus::Finished;
                rec.size = size;
                rec.sha256 = sha256;
            }
            Err(e) => {
                rec.status = RunStatus::Failed;
                rec.error = Some(e.to_string());
            }
        }
        self.persist_recording(&rec)?;
        Ok(rec)
    }

    pub fn get_recording(&self, id: &str) -> ApiResult<Recording> {
        self.store
            .get(&format!("recordings/{id}"))
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::NotFound(format!("no recording exists: {id}")))
    }

    pub fn list_recordings(&self) -> ApiResult<Vec<Recording>> {
        let ids = self.store.list("recordings").map_err(ApiError::Internal)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self
                .store
                .get(&format!("recordings/{id}"))
                .map_err(ApiError::Internal)?
            {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Deletion is refused while a running replay references the artifact.
    pub fn delete_recording(&self, id: &str) -> ApiResult<()> {
        if self
            .replaying
            .lock()
            .expect("replaying lock")
            .get(id)
            .copied()
            .unwrap_or(0)
            > 0
        {
            return Err(ApiError::Conflict(format!(
                "recording {id} is referenced by a running replay"
            )));
        }
        if !self
            .store
            .delete(&format!("recordings/{id}"))
            .map_err(ApiError::Internal)?
        {
            return Err(ApiError::NotFound(format!("no recording exists: {id}")));
        }
        let _ = std::fs::remove_file(self.artifact_path(id));
        Ok(())
    }

    // -- replay -------------------------------------------------------------

    /// Re-inject a finished recording into a running task.
    pub async fn replay(
        &self,
        id: &str,
        task_id: &str,
        recording_id: &str,
        clock: ReplayClock,
        recording_time: bool,
    ) -> ApiResult<Replay> {
        if !valid_id(id) {
            return Err(ApiError::Validation(format!("invalid replay id {id:?}")));
        }
        let rec = self.get_recording(recording_id)?;
        if rec.status != RunStatus::Finished {
            return Err(ApiError::Validation(format!(
                "recording {recording_id} is not finished"
            )));
        }
        if self.manager.get(task_id).await.is_none() {
            return Err(ApiError::NotFound(format!("no task exists: {task_id}")));
        }

        let rep = Replay {
            id: id.to_string(),
            task: task_id.to_string(),
            recording: recording_id.to_string(),
            clock,
            recording_time,
            status: RunStatus::Running,
            date: Utc::now(),
            error: None,
        };
        self.persist_replay(&rep)?;
        *self
            .replaying
            .lock()
            .expect("replaying lock")
            .entry(recording_id.to_string())
            .or_insert(0) += 1;

        let service = self.strong();
        let rep_id = id.to_string();
        let recording_id = recording_id.to_string();
        let task_id = task_id.to_string();
        let handle = tokio::spawn(async move {
            let result = service
                .deliver(&task_id, &recording_id, clock, recording_time)
                .await;
            let mut replaying = service.replaying.lock().expect("replaying lock");
            if let Some(n) = replaying.get_mut(&recording_id) {
                *n = n.saturating_sub(1);
            }
            drop(replaying);
            service.finish_replay(&rep_id, result);
        });
        self.replays
            .lock()
            .expect("replays lock")
            .insert(id.to_string(), handle);
        Ok(rep)
    }

    async fn deliver(
        &self,
        task_id: &str,
        recording_id: &str,
        clock: ReplayClock,
        recording_time: bool,
    ) -> Result<()> {
        let path = self.artifact_path(recording_id);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("open artifact {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut offset: Option<ChronoDuration> = None;
        let mut prev_time: Option<DateTime<Utc>> = None;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut msg: Message = serde_json::from_str(&line)?;

            let item_time = message_time(&msg);
            if clock == ReplayClock::Real
                && let Some(prev) = prev_time
            {
                let delta = (item_time - prev).to_std().unwrap_or_default();
                tokio::time::sleep(delta).await;
            }
            prev_time = Some(item_time);

            if !recording_time {
                let shift = *offset.get_or_insert_with(|| Utc::now() - item_time);
                shift_message(&mut msg, shift);
            }

            self.manager
                .inject(task_id, msg)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        Ok(())
    }

    fn finish_replay(&self, id: &str, result: Result<()>) {
        let mut rep = match self.store.get::<Replay>(&format!("replays/{id}")) {
            Ok(Some(r)) => r,
            _ => return,
        };
        match result {
            Ok(()) => rep.status = RunStatus::Finished,
            Err(e) => {
                rep.status = RunStatus::Failed;
                rep.error = Some(e.to_string());
            }
        }
        let _ = self.store.put(&format!("replays/{id}"), &rep);
    }

    /// Wait until a replay has delivered everything; used by callers that
    /// need the result synchronously.
    pub async fn wait_replay(&self, id: &str) -> ApiResult<Replay> {
        let handle = self.replays.lock().expect("replays lock").remove(id);
        if let Some(h) = handle {
            let _ = h.await;
        }
        self.get_replay(id)
    }

    pub fn get_replay(&self, id: &str) -> ApiResult<Replay> {
        self.store
            .get(&format!("replays/{id}"))
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::NotFound(format!("no replay exists: {id}")))
    }

    pub fn list_replays(&self) -> ApiResult<Vec<Replay>> {
        let ids = self.store.list("replays").map_err(ApiError::Internal)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self
                .store
                .get(&format!("replays/{id}"))
                .map_err(ApiError::Internal)?
            {
                out.push(r);
            }
        }
        Ok(out)
    }
}

fn message_time(msg: &Message) -> DateTime<Utc> {
    match msg {
        Message::Point(p) => p.time,
        Message::Batch(b) => b.t_max,
        Message::Barrier(b) => b.time,
    }
}

fn shift_message(msg: &mut Message, shift: ChronoDuration) {
    match msg {
        Message::Point(p) => p.time += shift,
        Message::Batch(b) => {
            b.t_min += shift;
            b.t_max += shift;
            for p in &mut b.points {
                p.time += shift;
            }
        }
        Message::Barrier(b) => b.time += shift,
    }
}
