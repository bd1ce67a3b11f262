use std::collections::HashSet;

use anyhow::bail;

use crate::engine::EngineConfig;

/// Cross-field validation run after parsing (and again after env overrides).
pub fn validate(config: &EngineConfig) -> anyhow::Result<()> {
    if !config.server.listen.starts_with("tcp://") {
        bail!(
            "server.listen must be a tcp:// address, got {:?}",
            config.server.listen
        );
    }

    if config.storage.dir.as_os_str().is_empty() {
        bail!("storage.dir must not be empty");
    }

    if config.alert.max_attempts == 0 {
        bail!("alert.max_attempts must be at least 1");
    }
    if config.alert.queue_capacity == 0 {
        bail!("alert.queue_capacity must be at least 1");
    }
    if config.alert.backoff_base.as_duration() > config.alert.backoff_max.as_duration() {
        bail!("alert.backoff_base exceeds alert.backoff_max");
    }

    let mut names = HashSet::new();
    for up in &config.upstreams {
        if up.name.is_empty() {
            bail!("upstream entries require a name");
        }
        if up.url.is_empty() {
            bail!("upstream {:?} requires a url", up.name);
        }
        if !names.insert(up.name.as_str()) {
            bail!("duplicate upstream name {:?}", up.name);
        }
    }

    for (name, f) in &config.udf.functions {
        if f.command.is_empty() {
            bail!("udf function {name:?} requires a command");
        }
    }

    Ok(())
}
