use anyhow::{Context, Result, bail};

use crate::engine::EngineConfig;
use crate::types::HumanDuration;
use crate::upstream::UpstreamConfig;

/// Apply `<PREFIX>_<SECTION>_<FIELD>` environment overrides on top of a
/// parsed config. Env values win over TOML. Unknown variables under the
/// prefix are ignored; a recognized variable with an unparseable value is
/// an error.
///
/// Forms:
/// - scalars: `TICKD_SERVER_LISTEN`, `TICKD_ALERT_MAX_ATTEMPTS`, ...
/// - indexed list elements: `TICKD_UPSTREAM_0_URL`; index 0 on an empty
///   list materializes the element, otherwise the index must be in range.
/// - map entries: `TICKD_LOGGING_MODULES_<KEY>`, where `__` in the key
///   stands for `::` (env names cannot carry colons).
///
/// Duration fields accept duration literals (`10s`, `5m`, `500ms`).
pub fn apply_env_overrides<I>(config: &mut EngineConfig, prefix: &str, env: I) -> Result<()>
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefix = format!("{prefix}_");
    for (key, value) in env {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        apply_one(config, rest, &value)
            .with_context(|| format!("applying env override {key}"))?;
    }
    Ok(())
}

fn apply_one(config: &mut EngineConfig, rest: &str, value: &str) -> Result<()> {
    // Map entries first; their keys may collide with scalar prefixes.
    if let Some(module) = rest.strip_prefix("LOGGING_MODULES_") {
        let module = module.to_lowercase().replace("__", "::");
        config.logging.modules.insert(module, value.to_string());
        return Ok(());
    }
    if let Some(tail) = rest.strip_prefix("UPSTREAM_") {
        return apply_upstream(config, tail, value);
    }

    match rest {
        "SERVER_LISTEN" => config.server.listen = value.to_string(),
        "STORAGE_DIR" => config.storage.dir = value.into(),
        "STORAGE_RECORDINGS" => config.storage.recordings = Some(value.into()),
        "LOGGING_LEVEL" => config.logging.level = value.to_string(),
        "LOGGING_FILE" => config.logging.file = Some(value.into()),
        "LOGGING_FORMAT" => {
            config.logging.format = match value {
                "plain" => crate::logging::LogFormat::Plain,
                "json" => crate::logging::LogFormat::Json,
                other => bail!("unknown log format {other:?}"),
            }
        }
        "ALERT_MAX_ATTEMPTS" => config.alert.max_attempts = parse_num(value)?,
        "ALERT_QUEUE_CAPACITY" => config.alert.queue_capacity = parse_num(value)?,
        "ALERT_BACKOFF_BASE" => config.alert.backoff_base = parse_duration(value)?,
        "ALERT_BACKOFF_MAX" => config.alert.backoff_max = parse_duration(value)?,
        "UDF_TIMEOUT" => config.udf.timeout = parse_duration(value)?,
        // Unknown vars under the prefix are ignored.
        _ => {}
    }
    Ok(())
}

fn apply_upstream(config: &mut EngineConfig, tail: &str, value: &str) -> Result<()> {
    let Some((index, field)) = tail.split_once('_') else {
        return Ok(());
    };
    let Ok(index) = index.parse::<usize>() else {
        return Ok(());
    };

    if index == 0 && config.upstreams.is_empty() {
        config.upstreams.push(UpstreamConfig::default());
    }
    let len = config.upstreams.len();
    let Some(up) = config.upstreams.get_mut(index) else {
        bail!("upstream index {index} out of range (have {len})");
    };

    match field {
        "NAME" => up.name = value.to_string(),
        "URL" => up.url = value.to_string(),
        "USERNAME" => up.username = Some(value.to_string()),
        "PASSWORD" => up.password = Some(value.to_string()),
        "TIMEOUT" => up.timeout = parse_duration(value)?,
        _ => {}
    }
    Ok(())
}

fn parse_duration(value: &str) -> Result<HumanDuration> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid duration {value:?}: {e}"))
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid number {value:?}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
