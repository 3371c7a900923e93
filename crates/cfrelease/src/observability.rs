//! Observability setup: structured JSONL logging.
//!
//! Nightly runs are unattended, so every record carries the run id and the
//! fields of the spans it was emitted in (`step`, `exe`, `path`, ...). That is
//! enough to reconstruct a failed night from the log file alone.
//!
//! Nothing here writes to stdout: `--json` output must stay parseable.

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::Event;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

const ENV_LOG_PATH: &str = "CFRELEASE_LOG_PATH";
const ENV_LOG_DIR: &str = "CFRELEASE_LOG_DIR";
const LOG_FILE_SUFFIX: &str = ".jsonl";

/// Configuration for observability setup.
#[derive(Clone, Debug)]
pub struct ObservabilityConfig {
    /// Service name, used for the log file name and the `service` field.
    pub service: String,
    /// Directory for JSONL log files from the config file.
    pub log_dir: Option<Utf8PathBuf>,
    /// Directory tried last when nothing else is writable.
    pub fallback_dir: Option<Utf8PathBuf>,
}

impl ObservabilityConfig {
    /// Config for this binary with the given log directory override.
    pub fn new(log_dir: Option<Utf8PathBuf>, fallback_dir: Option<Utf8PathBuf>) -> Self {
        Self {
            service: env!("CARGO_PKG_NAME").to_string(),
            log_dir,
            fallback_dir,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct LogTarget {
    dir: Utf8PathBuf,
    file_name: String,
}

/// Keeps the background log writer alive; drop it last.
pub struct ObservabilityGuard {
    _log_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Install the JSONL subscriber.
///
/// Falls back to stderr when no log location is writable.
pub fn init_observability(cfg: &ObservabilityConfig, env_filter: EnvFilter) -> Result<ObservabilityGuard> {
    let (writer, guard) = match resolve_log_target(cfg) {
        Ok(target) => {
            let appender = tracing_appender::rolling::daily(&target.dir, &target.file_name);
            tracing_appender::non_blocking(appender)
        }
        Err(err) => {
            eprintln!("Warning: {err:#}. Falling back to stderr logging.");
            tracing_appender::non_blocking(std::io::stderr())
        }
    };

    let run_id = run_id();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(JsonLogLayer::new(writer, &cfg.service, &run_id))
        .try_init()
        .context("a global subscriber is already installed")?;

    tracing::debug!(run_id = %run_id, "observability initialized");

    Ok(ObservabilityGuard { _log_guard: guard })
}

/// Build an `EnvFilter` from CLI flags, `RUST_LOG` and the configured level.
///
/// `-q` wins over `-v`, which wins over `RUST_LOG`.
pub fn env_filter(quiet: bool, verbose: u8, default_level: &str) -> EnvFilter {
    match (quiet, verbose) {
        (true, _) => EnvFilter::new("error"),
        (false, 0) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        (false, 1) => EnvFilter::new("debug"),
        (false, _) => EnvFilter::new("trace"),
    }
}

/// Identifier shared by every record of one invocation.
fn run_id() -> String {
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{started:x}-{:x}", std::process::id())
}

struct JsonLogLayer<W> {
    writer: W,
    service: Value,
    run_id: Value,
}

impl<W> JsonLogLayer<W> {
    fn new(writer: W, service: &str, run_id: &str) -> Self {
        Self {
            writer,
            service: Value::String(service.to_string()),
            run_id: Value::String(run_id.to_string()),
        }
    }
}

impl<S, W> tracing_subscriber::Layer<S> for JsonLogLayer<W>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: LayerContext<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut fields = SpanFields::default();
            attrs.record(&mut fields);
            span.extensions_mut().insert(fields);
        }
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        ctx: LayerContext<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => values.record(fields),
            None => {
                let mut fields = SpanFields::default();
                values.record(&mut fields);
                extensions.insert(fields);
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        let mut record = Map::new();
        record.insert("timestamp".into(), Value::String(rfc3339_now()));
        record.insert("level".into(), Value::String(metadata.level().as_str().to_lowercase()));
        record.insert("target".into(), Value::String(metadata.target().to_string()));
        record.insert("service".into(), self.service.clone());
        record.insert("run_id".into(), self.run_id.clone());

        if let Some(scope) = ctx.event_scope(event) {
            let mut names = Vec::new();
            for span in scope.from_root() {
                names.push(span.name());
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    record.extend(fields.0.clone());
                }
            }
            record.insert("spans".into(), Value::String(names.join(":")));
        }

        let mut fields = SpanFields::default();
        event.record(&mut fields);
        record.extend(fields.0);

        let mut writer = self.writer.make_writer();
        if serde_json::to_writer(&mut writer, &Value::Object(record)).is_ok() {
            let _ = writer.write_all(b"\n");
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SpanFields(Map<String, Value>);

impl SpanFields {
    fn put(&mut self, field: &tracing::field::Field, value: Value) {
        self.0.insert(field.name().to_string(), value);
    }
}

impl tracing::field::Visit for SpanFields {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(number));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_error(&mut self, field: &tracing::field::Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
fn rfc3339_now() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let of_day = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        of_day / 3600,
        of_day % 3600 / 60,
        of_day % 60,
        now.subsec_millis(),
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
const fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

// Log target resolution

fn resolve_log_target(cfg: &ObservabilityConfig) -> Result<LogTarget> {
    let env_path = std::env::var(ENV_LOG_PATH).ok().map(Utf8PathBuf::from);
    let env_dir = std::env::var(ENV_LOG_DIR).ok().map(Utf8PathBuf::from);
    let data_dir = cfrelease_core::config::user_data_local_dir().map(|dir| dir.join("logs"));
    resolve_log_target_with(cfg, env_path, env_dir, data_dir)
}

/// Explicit choices (env path, env dir, config dir) fail hard; the defaults
/// (user data dir, then the fallback dir) are tried in turn.
fn resolve_log_target_with(
    cfg: &ObservabilityConfig,
    env_path: Option<Utf8PathBuf>,
    env_dir: Option<Utf8PathBuf>,
    data_dir: Option<Utf8PathBuf>,
) -> Result<LogTarget> {
    if let Some(path) = env_path {
        return log_target_from_path(&path);
    }

    let file_name = format!("{}{LOG_FILE_SUFFIX}", cfg.service);
    if let Some(dir) = env_dir.or_else(|| cfg.log_dir.clone()) {
        ensure_writable(&dir, &file_name)?;
        return Ok(LogTarget { dir, file_name });
    }

    for dir in data_dir.into_iter().chain(cfg.fallback_dir.clone()) {
        if ensure_writable(&dir, &file_name).is_ok() {
            return Ok(LogTarget { dir, file_name });
        }
    }
    bail!("no writable log directory found")
}

fn log_target_from_path(path: &Utf8Path) -> Result<LogTarget> {
    let Some(file_name) = path.file_name() else {
        bail!("{ENV_LOG_PATH} must include a file name");
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    ensure_writable(&dir, file_name)?;
    Ok(LogTarget {
        dir,
        file_name: file_name.to_string(),
    })
}

fn ensure_writable(dir: &Utf8Path, file_name: &str) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create log directory {dir}"))?;
    let path = dir.join(file_name);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8_dir(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap()
    }

    fn config(log_dir: Option<Utf8PathBuf>, fallback_dir: Option<Utf8PathBuf>) -> ObservabilityConfig {
        ObservabilityConfig {
            service: "demo".into(),
            log_dir,
            fallback_dir,
        }
    }

    #[test]
    fn quiet_beats_verbose() {
        assert_eq!(env_filter(true, 2, "info").to_string(), "error");
    }

    #[test]
    fn verbose_maps_to_debug_and_trace() {
        assert_eq!(env_filter(false, 1, "info").to_string(), "debug");
        assert_eq!(env_filter(false, 3, "info").to_string(), "trace");
    }

    #[test]
    fn env_path_wins() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8_dir(&tmp);
        let cfg = config(Some(dir.join("config")), None);

        let target = resolve_log_target_with(
            &cfg,
            Some(dir.join("nightly").join("run.jsonl")),
            Some(dir.join("env")),
            None,
        )
        .unwrap();

        assert_eq!(target.dir, dir.join("nightly"));
        assert_eq!(target.file_name, "run.jsonl");
        assert!(dir.join("nightly/run.jsonl").exists());
    }

    #[test]
    fn env_dir_beats_config_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8_dir(&tmp);
        let cfg = config(Some(dir.join("config")), None);

        let target = resolve_log_target_with(&cfg, None, Some(dir.join("env")), None).unwrap();
        assert_eq!(target.dir, dir.join("env"));
        assert_eq!(target.file_name, "demo.jsonl");
    }

    #[test]
    fn config_dir_beats_defaults() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8_dir(&tmp);
        let cfg = config(Some(dir.join("config")), Some(dir.join("fallback")));

        let target = resolve_log_target_with(&cfg, None, None, Some(dir.join("data"))).unwrap();
        assert_eq!(target.dir, dir.join("config"));
    }

    #[test]
    fn unwritable_data_dir_falls_through() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8_dir(&tmp);
        let blocker = dir.join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let cfg = config(None, Some(dir.join("fallback")));

        let target = resolve_log_target_with(&cfg, None, None, Some(blocker.join("logs"))).unwrap();
        assert_eq!(target.dir, dir.join("fallback"));
    }

    #[test]
    fn nothing_writable_is_an_error() {
        let cfg = config(None, None);
        assert!(resolve_log_target_with(&cfg, None, None, None).is_err());
    }

    #[test]
    fn run_id_has_two_parts() {
        let id = run_id();
        let (started, pid) = id.split_once('-').unwrap();
        assert!(u64::from_str_radix(started, 16).is_ok());
        assert_eq!(u32::from_str_radix(pid, 16).unwrap(), std::process::id());
    }

    #[test]
    fn timestamp_shape() {
        let ts = rfc3339_now();
        assert_eq!(ts.len(), 24, "{ts}");
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(10_957), (2000, 1, 1));
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }
}
