//! Process-wide logging and metrics.
//!
//! The logger is initialized once at startup and never replaced. Request logs
//! use a canonical field vocabulary across all components: `request_id`,
//! `correlation_id`, `project_id`, `token_id`, `client_ip`, `method`, `path`,
//! `status_code`, `duration_ms`.

pub mod metrics;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
	Json,
	Console,
}

impl std::str::FromStr for LogFormat {
	type Err = anyhow::Error;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"json" => Ok(LogFormat::Json),
			"console" => Ok(LogFormat::Console),
			other => anyhow::bail!("unknown log format {other:?} (expected json or console)"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct LogConfig {
	/// debug | info | warn | error (any EnvFilter directive works).
	pub level: String,
	pub format: LogFormat,
	pub file: Option<String>,
}

impl Default for LogConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			format: LogFormat::Console,
			file: None,
		}
	}
}

/// Install the global subscriber. The returned guard must be held for the
/// process lifetime when logging to a file.
pub fn init_tracing(cfg: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
	let filter = EnvFilter::try_new(&cfg.level).or_else(|_| EnvFilter::try_new("info"))?;
	match &cfg.file {
		Some(path) => {
			let path = std::path::Path::new(path);
			let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
			let name = path.file_name().unwrap_or_else(|| "keygate.log".as_ref());
			let appender = tracing_appender::rolling::never(dir, name);
			let (writer, guard) = tracing_appender::non_blocking(appender);
			let builder = tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_writer(writer)
				.with_ansi(false);
			match cfg.format {
				LogFormat::Json => builder.json().init(),
				LogFormat::Console => builder.init(),
			}
			Ok(Some(guard))
		},
		None => {
			let builder = tracing_subscriber::fmt().with_env_filter(filter);
			match cfg.format {
				LogFormat::Json => builder.json().init(),
				LogFormat::Console => builder.init(),
			}
			Ok(None)
		},
	}
}
