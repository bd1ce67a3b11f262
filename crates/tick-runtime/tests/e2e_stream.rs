//! End-to-end: live stream ingestion through window/count to httpOut.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use tick_config::EngineConfig;
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

fn point(secs: i64, millis: u32, value: f64) -> Point {
    let mut p = Point::new(
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap(),
        "test",
    );
    p.fields.insert("value".into(), FieldValue::Float(value));
    p
}

async fn wait_until(mut probe: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn stream_count_to_http_out() {
    let dir = TempDir::new().unwrap();
    let server = Server::start(test_config(&dir), dir.path()).await.unwrap();

    server
        .manager
        .create(CreateTask {
            id: "count_task".into(),
            script: "stream\n    |from()\n        .measurement('test')\n    |window()\n        .period(10s)\n        .every(10s)\n    |count('value')\n    |httpOut('count')"
                .into(),
            dbrps: vec![DbrpRecord {
                db: "telegraf".into(),
                rp: "autogen".into(),
            }],
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // 15 points inside the first window, then one past the boundary to
    // close it.
    for i in 0..15u32 {
        server
            .router
            .write_point("telegraf", "autogen", point(0, i * 600, 1.0))
            .await;
    }
    server
        .router
        .write_point("telegraf", "autogen", point(11, 0, 1.0))
        .await;

    let http_out = server.http_out.clone();
    wait_until(
        || http_out.get("/tasks/count_task/count").is_some(),
        "httpOut value",
    )
    .await;

    let value = http_out.get("/tasks/count_task/count").unwrap();
    let series = value["series"].as_array().unwrap();
    assert_eq!(series.len(), 1);
    let points = series[0]["points"].as_array().unwrap();
    assert_eq!(points.len(), 1);

    let p: Point = serde_json::from_value(points[0].clone()).unwrap();
    assert_eq!(p.fields["count"], FieldValue::Int(15));
    assert_eq!(p.time, Utc.timestamp_opt(10, 0).unwrap());

    assert_eq!(server.debug_vars()["num_enabled_tasks"], 1);

    server.shutdown();
    server.wait().await.unwrap();
}

#[tokio::test]
async fn disabled_task_receives_nothing() {
    let dir = TempDir::new().unwrap();
    let server = Server::start(test_config(&dir), dir.path()).await.unwrap();

    server
        .manager
        .create(CreateTask {
            id: "idle".into(),
            script: "stream|from().measurement('test')|httpOut('latest')".into(),
            dbrps: vec![DbrpRecord {
                db: "telegraf".into(),
                rp: "autogen".into(),
            }],
            enabled: false,
            ..Default::default()
        })
        .await
        .unwrap();

    server
        .router
        .write_point("telegraf", "autogen", point(1, 0, 1.0))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.http_out.get("/tasks/idle/latest").is_none());

    server.shutdown();
    server.wait().await.unwrap();
}
