use std::sync::Arc;

use anyhow::{Result, bail};
use arc_swap::ArcSwap;
use serde_json::Value;

use crate::engine::EngineConfig;
use crate::validate;

const REDACTED: &str = "<redacted>";

/// Atomic configuration snapshot with element-level overrides.
///
/// Readers take the current snapshot and hold it for the duration of a
/// request; `update` validates the changed config and publishes a new
/// snapshot atomically, returning it so callers can restart the tasks that
/// depend on the changed section.
pub struct ConfigOverrides {
    current: ArcSwap<EngineConfig>,
}

impl ConfigOverrides {
    pub fn new(config: EngineConfig) -> ConfigOverrides {
        ConfigOverrides {
            current: ArcSwap::from_pointee(config),
        }
    }

    pub fn load(&self) -> Arc<EngineConfig> {
        self.current.load_full()
    }

    pub fn sections() -> &'static [&'static str] {
        &["server", "storage", "logging", "alert", "udf", "upstream"]
    }

    /// JSON rendering of one section with secret fields redacted.
    pub fn element(&self, section: &str) -> Result<Value> {
        let cfg = self.load();
        let mut value = match section {
            "server" => serde_json::to_value(&cfg.server)?,
            "storage" => serde_json::to_value(&cfg.storage)?,
            "logging" => serde_json::to_value(&cfg.logging)?,
            "alert" => serde_json::to_value(&cfg.alert)?,
            "udf" => serde_json::to_value(&cfg.udf)?,
            "upstream" => serde_json::to_value(&cfg.upstreams)?,
            other => bail!("unknown config section {other:?}"),
        };
        redact(&mut value);
        Ok(value)
    }

    /// Apply a mutation and publish the new snapshot. The update is
    /// all-or-nothing: a validation failure leaves the current snapshot in
    /// place.
    pub fn update(
        &self,
        mutate: impl FnOnce(&mut EngineConfig) -> Result<()>,
    ) -> Result<Arc<EngineConfig>> {
        let mut next = (*self.load()).clone();
        mutate(&mut next)?;
        validate::validate(&next)?;
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        Ok(next)
    }

    /// Set or delete fields of one section element by key. For the
    /// `upstream` list an index selects the element; `value: null` deletes
    /// the key (restoring the default on reload).
    pub fn update_element(
        &self,
        section: &str,
        index: Option<usize>,
        set: &serde_json::Map<String, Value>,
    ) -> Result<Arc<EngineConfig>> {
        self.update(|cfg| {
            match section {
                "server" => patch(&mut cfg.server, set)?,
                "storage" => patch(&mut cfg.storage, set)?,
                "logging" => patch(&mut cfg.logging, set)?,
                "alert" => patch(&mut cfg.alert, set)?,
                "udf" => patch(&mut cfg.udf, set)?,
                "upstream" => {
                    let i = index.unwrap_or(0);
                    let len = cfg.upstreams.len();
                    let Some(up) = cfg.upstreams.get_mut(i) else {
                        bail!("upstream index {i} out of range (have {len})");
                    };
                    patch(up, set)?;
                }
                other => bail!("unknown config section {other:?}"),
            }
            Ok(())
        })
    }
}

/// Round-trip a section through JSON to apply key-level set/delete.
fn patch<T: serde::Serialize + serde::de::DeserializeOwned>(
    target: &mut T,
    set: &serde_json::Map<String, Value>,
) -> Result<()> {
    let mut value = serde_json::to_value(&*target)?;
    let Value::Object(map) = &mut value else {
        bail!("section is not an object");
    };
    for (k, v) in set {
        if v.is_null() {
            map.remove(k);
        } else {
            map.insert(k.clone(), v.clone());
        }
    }
    *target = serde_json::from_value(value)?;
    Ok(())
}

/// Blank out secret fields anywhere in the rendered tree.
fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if k == "password" && !v.is_null() {
                    *v = Value::String(REDACTED.to_string());
                } else {
                    redact(v);
                }
            }
        }
        Value::Array(items) => {
            for v in items {
                redact(v);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_upstream() -> EngineConfig {
        r#"
[[upstream]]
name = "metrics"
url = "http://localhost:8086"
password = "hunter2"
"#
        .parse()
        .unwrap()
    }

    #[test]
    fn element_redacts_password() {
        let ov = ConfigOverrides::new(config_with_upstream());
        let v = ov.element("upstream").unwrap();
        assert_eq!(v[0]["password"], "<redacted>");
        assert_eq!(v[0]["url"], "http://localhost:8086");
    }

    #[test]
    fn update_publishes_new_snapshot() {
        let ov = ConfigOverrides::new(config_with_upstream());
        let old = ov.load();
        let mut set = serde_json::Map::new();
        set.insert("url".into(), serde_json::json!("http://db:8086"));
        ov.update_element("upstream", Some(0), &set).unwrap();

        // Old snapshot is unchanged; new snapshot carries the override.
        assert_eq!(old.upstreams[0].url, "http://localhost:8086");
        assert_eq!(ov.load().upstreams[0].url, "http://db:8086");
    }

    #[test]
    fn failed_update_leaves_snapshot() {
        let ov = ConfigOverrides::new(config_with_upstream());
        let mut set = serde_json::Map::new();
        set.insert("url".into(), serde_json::json!(""));
        assert!(ov.update_element("upstream", Some(0), &set).is_err());
        assert_eq!(ov.load().upstreams[0].url, "http://localhost:8086");
    }

    #[test]
    fn delete_restores_default() {
        let ov = ConfigOverrides::new(config_with_upstream());
        let mut set = serde_json::Map::new();
        set.insert("password".into(), Value::Null);
        let next = ov.update_element("upstream", Some(0), &set).unwrap();
        assert_eq!(next.upstreams[0].password, None);
    }

    #[test]
    fn unknown_section_rejected() {
        let ov = ConfigOverrides::new(EngineConfig::default());
        assert!(ov.element("nope").is_err());
    }
}
