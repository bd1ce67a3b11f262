//! End-to-end: record a stream task's input, replay it at a fast clock with
//! recording time preserved, and observe the alert it produces.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use tick_config::EngineConfig;
use tick_core::alert::{AlertEvent, Level};
use tick_core::point::{FieldValue, Point};
use tick_runtime::Server;
use tick_runtime::model::{DbrpRecord, ReplayClock, RunStatus};
use tick_runtime::task::CreateTask;

fn test_config(dir: &TempDir) -> EngineConfig {
    let toml = format!(
        r#"
[server]
listen = "tcp://127.0.0.1:0"

[storage]
dir = "{}"
"#,
        dir.path().join("data").display()
    );
    toml.parse().unwrap()
}

fn point(secs: i64, millis: u32, value: f64) -> Point {
    let mut p = Point::new(
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap(),
        "test",
    );
    p.fields.insert("value".into(), FieldValue::Float(value));
    p
}

#[tokio::test]
async fn record_then_fast_replay_preserving_time() {
    let dir = TempDir::new().unwrap();
    let server = Server::start(test_config(&dir), dir.path()).await.unwrap();
    let alert_log = dir.path().join("replay-alerts.log");

    // Created disabled: the recording tee captures the input while the
    // DAG stays quiet, so only the replay produces alerts.
    server
        .manager
        .create(CreateTask {
            id: "rp_task".into(),
            script: format!(
                "stream\n    |from()\n        .measurement('test')\n    |window()\n        .period(10s)\n        .every(10s)\n    |count('value')\n    |alert()\n        .crit(lambda: \"count\" > 14)\n        .log('{}')",
                alert_log.display()
            ),
            dbrps: vec![DbrpRecord {
                db: "telegraf".into(),
                rp: "autogen".into(),
            }],
            enabled: false,
            ..Default::default()
        })
        .await
        .unwrap();

    let rec = server
        .replays
        .record_stream("rec1", "rp_task", None)
        .await
        .unwrap();
    assert_eq!(rec.status, RunStatus::Running);

    // 15 points inside the window plus the boundary point that closes it.
    for i in 0..15u32 {
        server
            .router
            .write_point("telegraf", "autogen", point(0, i * 600, 1.0))
            .await;
    }
    server
        .router
        .write_point("telegraf", "autogen", point(10, 0, 1.0))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rec = server.replays.stop_recording("rec1").await.unwrap();
    assert_eq!(rec.status, RunStatus::Finished);
    assert!(rec.size > 0);
    assert_eq!(rec.sha256.len(), 64);

    // Replay through the now-enabled task.
    server.manager.enable("rp_task").await.unwrap();
    server
        .replays
        .replay("rp1", "rp_task", "rec1", ReplayClock::Fast, true)
        .await
        .unwrap();

    // Deleting a recording under an active replay is refused.
    let del = server.replays.delete_recording("rec1");
    assert!(del.is_err() || server.replays.get_replay("rp1").unwrap().status != RunStatus::Running);

    let replay = server.replays.wait_replay("rp1").await.unwrap();
    assert_eq!(replay.status, RunStatus::Finished, "{:?}", replay.error);

    // Exactly one CRITICAL event, stamped with the recorded window close.
    let mut events: Vec<AlertEvent> = Vec::new();
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(&alert_log) {
            events = contents
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect();
            if !events.is_empty() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(events.len(), 1, "events: {events:?}");
    assert_eq!(events[0].level, Level::Critical);
    assert_eq!(events[0].time, Utc.timestamp_opt(10, 0).unwrap());
    assert_eq!(
        events[0].data.points[0].fields["count"],
        FieldValue::Int(15)
    );

    // With the replay finished the recording can go away.
    server.replays.delete_recording("rec1").unwrap();
    assert!(server.replays.get_recording("rec1").is_err());

    server.shutdown();
    server.wait().await.unwrap();
}

// ---------------------------------------------------------------------------
// Batch recording through an injected upstream boundary
// ---------------------------------------------------------------------------

struct FakeQuerier;

#[async_trait::async_trait]
impl tick_core::node::BatchQuerier for FakeQuerier {
    async fn query(
        &self,
        _q: &str,
        start: chrono::DateTime<Utc>,
        stop: chrono::DateTime<Utc>,
        _cluster: Option<&str>,
    ) -> anyhow::Result<Vec<tick_core::point::Batch>> {
        // Three synthetic rows per queried window.
        let points: Vec<Point> = (0..3)
            .map(|i| {
                let mut p = Point::new(start + chrono::Duration::seconds(i), "m");
                p.fields
                    .insert("value".into(), FieldValue::Float(i as f64));
                p
            })
            .collect();
        Ok(vec![tick_core::point::Batch {
            name: "m".into(),
            tags: Default::default(),
            group: tick_core::point::GroupKey::new("m", &Default::default(), &[]),
            t_min: start,
            t_max: stop,
            points,
        }])
    }
}

#[tokio::test]
async fn batch_recording_replays_through_query_task() {
    let dir = TempDir::new().unwrap();
    let server = Server::builder(test_config(&dir), dir.path())
        .querier(std::sync::Arc::new(FakeQuerier))
        .start()
        .await
        .unwrap();

    server
        .manager
        .create(CreateTask {
            id: "batch_task".into(),
            script: "batch\n    |query('SELECT value FROM \"db\".\"rp\".m')\n        .period(10s)\n        .every(10s)\n    |count('value')\n    |httpOut('count')"
                .into(),
            dbrps: vec![DbrpRecord {
                db: "db".into(),
                rp: "rp".into(),
            }],
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        server.manager.get("batch_task").await.unwrap().task_type,
        "batch"
    );

    // Re-execute the task's query over a fixed hour.
    let rec = server
        .replays
        .record_batch(
            "brec",
            "batch_task",
            Utc.timestamp_opt(0, 0).unwrap(),
            Utc.timestamp_opt(40, 0).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rec.status, RunStatus::Finished);
    assert!(rec.size > 0);

    server
        .replays
        .replay("brep", "batch_task", "brec", ReplayClock::Fast, true)
        .await
        .unwrap();
    let replay = server.replays.wait_replay("brep").await.unwrap();
    assert_eq!(replay.status, RunStatus::Finished, "{:?}", replay.error);

    // Each replayed batch carries 3 rows; the latest window wins.
    for _ in 0..100 {
        if server.http_out.get("/tasks/batch_task/count").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let value = server.http_out.get("/tasks/batch_task/count").unwrap();
    let p: Point =
        serde_json::from_value(value["series"][0]["points"][0].clone()).unwrap();
    assert_eq!(p.fields["count"], FieldValue::Int(3));

    server.shutdown();
    server.wait().await.unwrap();
}

#[tokio::test]
async fn replay_against_unknown_recording_fails() {
    let dir = TempDir::new().unwrap();
    let server = Server::start(test_config(&dir), dir.path()).await.unwrap();
    server
        .manager
        .create(CreateTask {
            id: "t".into(),
            script: "stream|from().measurement('x')|httpOut('o')".into(),
            dbrps: vec![DbrpRecord {
                db: "db".into(),
                rp: "rp".into(),
            }],
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let err = server
        .replays
        .replay("r", "t", "missing", ReplayClock::Fast, true)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no recording exists"), "{err}");

    server.shutdown();
    server.wait().await.unwrap();
}
