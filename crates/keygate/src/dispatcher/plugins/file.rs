//! JSONL file sink: one payload per line, appended.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{BackendPlugin, Payload, PluginError};

pub struct FilePlugin {
	path: std::path::PathBuf,
}

impl FilePlugin {
	pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[async_trait]
impl BackendPlugin for FilePlugin {
	fn name(&self) -> &'static str {
		"file"
	}

	async fn send_events(&self, payloads: &[Payload]) -> Result<(), PluginError> {
		let mut lines = String::new();
		for p in payloads {
			let line =
				serde_json::to_string(p).map_err(|e| PluginError::Permanent(e.to_string()))?;
			lines.push_str(&line);
			lines.push('\n');
		}
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await
			.map_err(|e| PluginError::Transient(e.to_string()))?;
		file
			.write_all(lines.as_bytes())
			.await
			.map_err(|e| PluginError::Transient(e.to_string()))?;
		file
			.flush()
			.await
			.map_err(|e| PluginError::Transient(e.to_string()))?;
		Ok(())
	}
}
