//! Catalog Watcher: polls the catalog files on a fixed interval and drives
//! the Manager's reconciliation so that edits to `labs.json`/`thresholds.json`
//! on disk take effect without a restart. A read or parse failure on any
//! step is logged and the loop simply tries again next tick — the running
//! system keeps serving its last-known-good configuration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::catalog;
use crate::manager::Manager;

pub async fn run(manager: Arc<Manager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        tick(&manager).await;
    }
}

async fn tick(manager: &Arc<Manager>) {
    let labs = match catalog::load_labs(manager.catalog_dir()) {
        Ok(labs) => labs,
        Err(e) => {
            warn!("catalog watcher: failed to reload labs: {e}");
            return;
        }
    };
    let thresholds_map = match catalog::load_thresholds(manager.catalog_dir()) {
        Ok(map) => map,
        Err(e) => {
            warn!("catalog watcher: failed to reload thresholds: {e}");
            return;
        }
    };

    let wanted: HashSet<String> = labs.into_iter().map(|l| l.lab_id).collect();
    let merged = wanted
        .iter()
        .map(|lab_id| (lab_id.clone(), catalog::resolve_thresholds(lab_id, &thresholds_map)))
        .collect();

    manager.reconcile(&wanted, &merged).await;

    if let Err(e) = manager.reload_devices().await {
        warn!("catalog watcher: failed to reload device catalog: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusAdapter;
    use crate::state::StateMemory;
    use std::time::Duration as StdDuration;

    fn write_catalog(dir: &std::path::Path, labs: &[&str]) {
        let labs_json: Vec<String> = labs
            .iter()
            .map(|id| format!(r#"{{"lab_id":"{id}","name":"","notes":""}}"#))
            .collect();
        std::fs::write(
            dir.join("labs.json"),
            format!(r#"{{"last_update":"x","labs":[{}]}}"#, labs_json.join(",")),
        )
        .unwrap();
        std::fs::write(
            dir.join("devices.json"),
            r#"{"last_update":"x","sensors":[],"actuators":[]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("thresholds.json"),
            r#"{"last_update":"x","default":{},"per_lab":{}}"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn tick_reconciles_added_and_removed_labs() {
        let dir = std::env::temp_dir().join(format!("watcher-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_catalog(&dir, &["lab1"]);

        let state = Arc::new(StateMemory::new());
        let (bus, _el) = BusAdapter::connect("test-watcher", "127.0.0.1", 1883, StdDuration::from_secs(5));
        let manager = Arc::new(Manager::new(
            dir.to_str().unwrap(),
            state,
            bus,
            StdDuration::from_secs(5),
            StdDuration::from_secs(30),
        ));
        manager.start().await.unwrap();
        assert_eq!(manager.running_labs().await, vec!["lab1".to_string()]);

        write_catalog(&dir, &["lab2"]);
        tick(&manager).await;
        assert_eq!(manager.running_labs().await, vec!["lab2".to_string()]);

        manager.stop().await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn tick_tolerates_missing_catalog_without_panicking() {
        let dir = std::env::temp_dir().join(format!("watcher-test-missing-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let state = Arc::new(StateMemory::new());
        let (bus, _el) = BusAdapter::connect("test-watcher-2", "127.0.0.1", 1883, StdDuration::from_secs(5));
        let manager = Arc::new(Manager::new(
            dir.to_str().unwrap(),
            state,
            bus,
            StdDuration::from_secs(5),
            StdDuration::from_secs(30),
        ));
        tick(&manager).await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
