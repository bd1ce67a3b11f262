use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;

use tick_core::edge::EdgeTx;
use tick_core::point::{Message, Point};

use crate::model::DbrpRecord;

struct Route {
    task_id: String,
    dbrps: HashSet<DbrpRecord>,
    input: EdgeTx,
}

struct Tee {
    id: String,
    dbrps: HashSet<DbrpRecord>,
    tx: mpsc::Sender<Point>,
}

/// Routes incoming points to every enabled task whose declared `(db, rp)`
/// pairs match, plus any recording tees. Send blocks when a task's input
/// edge is full, so ingestion backpressure reaches the writer.
#[derive(Default)]
pub struct IngestRouter {
    inner: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    routes: Vec<Route>,
    tees: Vec<Tee>,
}

impl IngestRouter {
    pub fn register_task(&self, task_id: &str, dbrps: &[DbrpRecord], input: EdgeTx) {
        let mut st = self.inner.lock().expect("router lock");
        st.routes.retain(|r| r.task_id != task_id);
        st.routes.push(Route {
            task_id: task_id.to_string(),
            dbrps: dbrps.iter().cloned().collect(),
            input,
        });
    }

    pub fn unregister_task(&self, task_id: &str) {
        self.inner
            .lock()
            .expect("router lock")
            .routes
            .retain(|r| r.task_id != task_id);
    }

    /// Attach a recording tee; every matching point is copied to `tx`.
    pub fn add_tee(&self, id: &str, dbrps: &[DbrpRecord], tx: mpsc::Sender<Point>) {
        let mut st = self.inner.lock().expect("router lock");
        st.tees.retain(|t| t.id != id);
        st.tees.push(Tee {
            id: id.to_string(),
            dbrps: dbrps.iter().cloned().collect(),
            tx,
        });
    }

    pub fn remove_tee(&self, id: &str) {
        self.inner
            .lock()
            .expect("router lock")
            .tees
            .retain(|t| t.id != id);
    }

    /// Fan one point out to matching tasks and tees.
    pub async fn write_point(&self, db: &str, rp: &str, point: Point) {
        let dbrp = DbrpRecord {
            db: db.to_string(),
            rp: rp.to_string(),
        };
        // Snapshot the senders under the lock, send outside it.
        let (inputs, tees): (Vec<EdgeTx>, Vec<mpsc::Sender<Point>>) = {
            let st = self.inner.lock().expect("router lock");
            (
                st.routes
                    .iter()
                    .filter(|r| r.dbrps.contains(&dbrp))
                    .map(|r| r.input.clone())
                    .collect(),
                st.tees
                    .iter()
                    .filter(|t| t.dbrps.contains(&dbrp))
                    .map(|t| t.tx.clone())
                    .collect(),
            )
        };
        for tee in tees {
            let _ = tee.send(point.clone()).await;
        }
        for input in inputs {
            let _ = input.send(Message::Point(point.clone())).await;
        }
    }

    pub async fn write_points(&self, db: &str, rp: &str, points: Vec<Point>) {
        for p in points {
            self.write_point(db, rp, p).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tick_core::edge::edge;

    fn dbrp(db: &str, rp: &str) -> DbrpRecord {
        DbrpRecord {
            db: db.into(),
            rp: rp.into(),
        }
    }

    fn point(secs: i64) -> Point {
        Point::new(Utc.timestamp_opt(secs, 0).unwrap(), "m")
    }

    #[tokio::test]
    async fn routes_by_dbrp() {
        let router = IngestRouter::default();
        let (tx_a, mut rx_a) = edge(8);
        let (tx_b, mut rx_b) = edge(8);
        router.register_task("a", &[dbrp("telegraf", "autogen")], tx_a);
        router.register_task("b", &[dbrp("other", "autogen")], tx_b);

        router.write_point("telegraf", "autogen", point(1)).await;

        assert!(matches!(rx_a.recv().await, Some(Message::Point(_))));
        drop(router);
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn tee_receives_copies() {
        let router = IngestRouter::default();
        let (task_tx, mut task_rx) = edge(8);
        router.register_task("a", &[dbrp("db", "rp")], task_tx);
        let (tee_tx, mut tee_rx) = mpsc::channel(8);
        router.add_tee("rec1", &[dbrp("db", "rp")], tee_tx);

        router.write_point("db", "rp", point(5)).await;

        assert_eq!(tee_rx.recv().await.unwrap().time.timestamp(), 5);
        assert!(matches!(task_rx.recv().await, Some(Message::Point(_))));

        router.remove_tee("rec1");
        router.write_point("db", "rp", point(6)).await;
        assert!(matches!(task_rx.recv().await, Some(Message::Point(_))));
        drop(router);
        assert!(tee_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_stops_routing() {
        let router = IngestRouter::default();
        let (tx, mut rx) = edge(8);
        router.register_task("a", &[dbrp("db", "rp")], tx);
        router.unregister_task("a");
        router.write_point("db", "rp", point(1)).await;
        assert!(rx.recv().await.is_none());
    }
}
