//! End-to-end: alert state machine through anonymous topics, node-local log
//! handlers, and the inhibition matrix.

use std::path::Path;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use tick_config::EngineConfig;
use tick_core::alert::{AlertEvent, Level};
use tick_core::point::{FieldValue, Point};
use tick_runtime::Server;
use tick_runtime::model::DbrpRecord;
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

fn dbrps() -> Vec<DbrpRecord> {
    vec![DbrpRecord {
        db: "telegraf".into(),
        rp: "autogen".into(),
    }]
}

fn read_events(path: &Path) -> Vec<AlertEvent> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(|l| serde_json::from_str(l).expect("event line"))
        .collect()
}

async fn wait_for_events(path: &Path, n: usize) -> Vec<AlertEvent> {
    for _ in 0..100 {
        let events = read_events(path);
        if events.len() >= n {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "timed out waiting for {n} events in {} (have {})",
        path.display(),
        read_events(path).len()
    );
}

// ---------------------------------------------------------------------------
// Hysteresis & duration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn alert_escalation_tracks_duration() {
    let dir = TempDir::new().unwrap();
    let server = Server::start(test_config(&dir), dir.path()).await.unwrap();
    let log = dir.path().join("alerts.log");

    server
        .manager
        .create(CreateTask {
            id: "al_task".into(),
            script: format!(
                "stream\n    |from()\n        .measurement('test')\n    |alert()\n        .warn(lambda: \"value\" <= 1.0)\n        .crit(lambda: \"value\" > 1.0)\n        .log('{}')",
                log.display()
            ),
            dbrps: dbrps(),
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let mut p1 = Point::new(Utc.timestamp_opt(0, 0).unwrap(), "test");
    p1.fields.insert("value".into(), FieldValue::Float(1.0));
    server.router.write_point("telegraf", "autogen", p1).await;

    let mut p2 = Point::new(Utc.timestamp_opt(1, 0).unwrap(), "test");
    p2.fields.insert("value".into(), FieldValue::Float(3.0));
    server.router.write_point("telegraf", "autogen", p2).await;

    let events = wait_for_events(&log, 2).await;

    // The alert node is at DAG position 2 (stream0, from1, alert2).
    assert_eq!(events[0].topic, "main:al_task:alert2");
    assert_eq!(events[0].level, Level::Warning);
    assert_eq!(events[0].previous_level, Level::Ok);
    assert_eq!(events[0].duration, 0);
    assert_eq!(events[0].time, Utc.timestamp_opt(0, 0).unwrap());

    assert_eq!(events[1].level, Level::Critical);
    assert_eq!(events[1].previous_level, Level::Warning);
    assert_eq!(events[1].duration, 1_000_000_000);

    // The anonymous topic exists while the task is enabled...
    assert!(server.alerts.get_topic("main:al_task:alert2").is_some());
    assert_eq!(
        server.alerts.get_topic("main:al_task:alert2").unwrap().level(),
        Level::Critical
    );

    // ...and its durable state is removed on disable.
    server.manager.disable("al_task").await.unwrap();
    assert!(server.alerts.get_topic("main:al_task:alert2").is_none());

    server.shutdown();
    server.wait().await.unwrap();
}

// ---------------------------------------------------------------------------
// Inhibition
// ---------------------------------------------------------------------------

fn alert_script(measurement: &str, extra: &str, log: &Path) -> String {
    format!(
        "stream\n    |from()\n        .measurement('{measurement}')\n        .groupBy('host', 'region')\n    |alert()\n        .crit(lambda: \"status\" > 0.0){extra}\n        .log('{}')",
        log.display()
    )
}

fn health_point(secs: i64, measurement: &str, host: &str, region: &str, status: f64) -> Point {
    let mut p = Point::new(Utc.timestamp_opt(secs, 0).unwrap(), measurement);
    p.tags.insert("host".into(), host.into());
    p.tags.insert("region".into(), region.into());
    p.fields.insert("status".into(), FieldValue::Float(status));
    p
}

#[tokio::test]
async fn inhibition_matrix_suppresses_scoped_alerts() {
    let dir = TempDir::new().unwrap();
    let server = Server::start(test_config(&dir), dir.path()).await.unwrap();
    let sink = dir.path().join("sink.log");

    // region-up CRITICAL inhibits host-up, cpu, mem for its region;
    // host-up CRITICAL inhibits cpu, mem for its host. The up-tasks use
    // hysteresis; cpu/mem emit on every point so suppression is visible.
    let tasks = [
        (
            "region_up",
            alert_script(
                "region_health",
                "\n        .stateChangesOnly()\n        .category('region-up')\n        .inhibit('host-up', 'region')\n        .inhibit('cpu', 'region')\n        .inhibit('mem', 'region')",
                &sink,
            ),
        ),
        (
            "host_up",
            alert_script(
                "host_health",
                "\n        .stateChangesOnly()\n        .category('host-up')\n        .inhibit('cpu', 'host')\n        .inhibit('mem', 'host')",
                &sink,
            ),
        ),
        ("cpu", alert_script("cpu_usage", "\n        .category('cpu')", &sink)),
        ("mem", alert_script("mem_usage", "\n        .category('mem')", &sink)),
    ];
    for (id, script) in tasks {
        server
            .manager
            .create(CreateTask {
                id: id.into(),
                script,
                dbrps: dbrps(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let write = |p: Point| {
        let router = server.router.clone();
        async move { router.write_point("telegraf", "autogen", p).await }
    };
    let settle = || tokio::time::sleep(Duration::from_millis(300));

    // Phase 1: plain cpu alert on h1 is delivered.
    write(health_point(1, "cpu_usage", "h1", "east", 1.0)).await;
    settle().await;

    // Phase 2: host h1 goes down; its cpu/mem alerts are suppressed while
    // another host's cpu alert still fires.
    write(health_point(2, "host_health", "h1", "east", 1.0)).await;
    settle().await;
    write(health_point(4, "cpu_usage", "h1", "east", 1.0)).await; // inhibited by host-up
    write(health_point(5, "mem_usage", "h1", "east", 1.0)).await; // inhibited by host-up
    write(health_point(6, "cpu_usage", "h2", "east", 1.0)).await; // delivered
    settle().await;

    // Phase 3: the whole east region goes down; h2's host alert and a
    // west-region cpu alert behave differently.
    write(health_point(7, "region_health", "h0", "east", 1.0)).await;
    settle().await;
    write(health_point(8, "host_health", "h2", "east", 1.0)).await; // inhibited by region-up
    write(health_point(9, "cpu_usage", "h3", "west", 1.0)).await; // other region, delivered
    settle().await;

    let events = wait_for_events(&sink, 5).await;
    let summary: Vec<(String, String, Level)> = events
        .iter()
        .map(|e| {
            (
                e.data.name.clone(),
                e.data.tags.get("host").cloned().unwrap_or_default(),
                e.level,
            )
        })
        .collect();

    let expected = vec![
        ("cpu_usage".to_string(), "h1".to_string(), Level::Critical),
        ("host_health".to_string(), "h1".to_string(), Level::Critical),
        ("cpu_usage".to_string(), "h2".to_string(), Level::Critical),
        ("region_health".to_string(), "h0".to_string(), Level::Critical),
        ("cpu_usage".to_string(), "h3".to_string(), Level::Critical),
    ];
    assert_eq!(summary, expected, "delivered events: {summary:?}");

    server.shutdown();
    server.wait().await.unwrap();
}
