use crate::association::negotiation::default_transfer_syntaxes;
use crate::association::AssociationOptions;
use crate::dimse::cstore::storescp::StoreServiceClassProviderOptions;
use crate::dimse::cstore::DEFAULT_STORAGE_SOP_CLASSES;
use crate::forward::ForwardOptions;
use crate::node::{Node, NodeError};
use crate::types::{AE, UI};
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	/// The calling AE title of outbound associations.
	pub aet: AE,
	/// Remote nodes by name.
	#[serde(default)]
	pub nodes: HashMap<String, Node>,
	pub dimse: DimseConfig,
	pub forward: ForwardConfig,
	pub retrieve: RetrieveConfig,
	pub scp: ScpConfig,
}

impl AppConfig {
	/// Loads the embedded defaults, then `config.toml` if present, then `DICOM_RELAY_*`
	/// environment variables.
	pub fn new() -> Result<Self, ConfigError> {
		Self::load(None)
	}

	/// Like [`AppConfig::new`], but reads the given file instead of `config.toml`.
	/// The file must exist.
	pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
		let file = match path {
			Some(path) => File::with_name(path).required(true),
			None => File::with_name("config.toml").required(false),
		};
		defaults()
			.add_source(file)
			.add_source(
				Environment::with_prefix("DICOM_RELAY")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?
			.try_deserialize()
	}

	/// Looks up a configured node by name. Anything else is parsed as `AET@host:port`.
	pub fn node(&self, name: &str) -> Result<Node, NodeError> {
		if let Some(node) = self.nodes.get(name) {
			node.validate()?;
			return Ok(node.clone());
		}
		name.parse()
	}

	pub fn association_options(&self) -> AssociationOptions {
		AssociationOptions {
			calling_aet: self.aet.clone(),
			max_pdu_length: self.dimse.max_pdu_length,
			connect_timeout: Duration::from_secs(self.dimse.connect_timeout),
			release_timeout: Duration::from_secs(self.dimse.release_timeout),
		}
	}

	pub const fn timeout(&self) -> Duration {
		Duration::from_secs(self.dimse.timeout)
	}

	pub fn forward_options(&self) -> ForwardOptions {
		ForwardOptions {
			idle_timeout: Duration::from_secs(self.forward.idle_timeout),
			renegotiation_timeout: Duration::from_secs(self.forward.renegotiation_timeout),
			transfer_syntax: self.forward.transfer_syntax.clone(),
			sop_classes: self.forward.sop_classes.clone(),
		}
	}

	pub fn scp_options(&self) -> StoreServiceClassProviderOptions {
		StoreServiceClassProviderOptions {
			aet: self.scp.aet.clone(),
			interface: self.scp.interface,
			port: self.scp.port,
			uncompressed: self.scp.uncompressed,
			max_pdu_length: self.dimse.max_pdu_length,
			timeout: self.timeout(),
		}
	}
}

fn defaults() -> ConfigBuilder<config::builder::DefaultState> {
	Config::builder().add_source(File::from_str(
		include_str!("defaults.toml"),
		FileFormat::Toml,
	))
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default directive of the log filter. RUST_LOG takes precedence.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
	/// DSN of the Sentry project.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
	let level = String::deserialize(deserializer)?;
	level.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimseConfig {
	/// Seconds to wait for a DIMSE message.
	pub timeout: u64,
	pub connect_timeout: u64,
	pub release_timeout: u64,
	pub max_pdu_length: u32,
	pub cancel_after: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
	pub idle_timeout: u64,
	pub renegotiation_timeout: u64,
	pub transfer_syntax: Option<UI>,
	#[serde(default)]
	pub sop_classes: Vec<UI>,
	#[serde(default)]
	pub edits: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveConfig {
	#[serde(default)]
	pub sop_classes: Vec<UI>,
	#[serde(default)]
	pub transfer_syntaxes: Vec<UI>,
}

impl RetrieveConfig {
	pub fn storage_sop_classes(&self) -> Vec<UI> {
		if self.sop_classes.is_empty() {
			DEFAULT_STORAGE_SOP_CLASSES
				.iter()
				.map(|&uid| UI::from(uid))
				.collect()
		} else {
			self.sop_classes.clone()
		}
	}

	pub fn transfer_syntaxes(&self) -> Vec<UI> {
		if self.transfer_syntaxes.is_empty() {
			default_transfer_syntaxes()
		} else {
			self.transfer_syntaxes.clone()
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScpConfig {
	pub aet: AE,
	pub interface: IpAddr,
	pub port: u16,
	pub uncompressed: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(toml: &str) -> AppConfig {
		defaults()
			.add_source(File::from_str(toml, FileFormat::Toml))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap()
	}

	#[test]
	fn embedded_defaults_are_complete() {
		let config = parse("");
		assert_eq!(config.aet, "DICOM-RELAY");
		assert_eq!(config.telemetry.level, Level::INFO);
		assert!(config.telemetry.sentry.is_none());
		assert!(config.nodes.is_empty());
		assert_eq!(config.timeout(), Duration::from_secs(30));

		let forward = config.forward_options();
		assert_eq!(forward.idle_timeout, Duration::from_secs(15));
		assert_eq!(forward.renegotiation_timeout, Duration::from_secs(60));
		assert!(forward.transfer_syntax.is_none());

		assert_eq!(
			config.retrieve.storage_sop_classes().len(),
			DEFAULT_STORAGE_SOP_CLASSES.len()
		);
		assert_eq!(config.retrieve.transfer_syntaxes(), default_transfer_syntaxes());
		assert_eq!(config.scp_options().port, 11112);
	}

	#[test]
	fn resolves_named_nodes() {
		let config = parse(
			r#"
			aet = "RELAY"

			[telemetry]
			level = "debug"

			[nodes.pacs]
			aet = "PACS"
			host = "10.0.0.1"
			port = 104
			"#,
		);
		assert_eq!(config.telemetry.level, Level::DEBUG);
		assert_eq!(config.association_options().calling_aet, "RELAY");
		assert_eq!(config.node("pacs"), Ok(Node::new("PACS", "10.0.0.1", 104)));
		assert_eq!(
			config.node("ARCHIVE@archive:11112"),
			Ok(Node::new("ARCHIVE", "archive", 11112))
		);
		assert!(config.node("unknown").is_err());
	}

	#[test]
	fn rejects_invalid_level() {
		let result = defaults()
			.add_source(File::from_str("[telemetry]\nlevel = \"loud\"", FileFormat::Toml))
			.build()
			.unwrap()
			.try_deserialize::<AppConfig>();
		assert!(result.is_err());
	}
}
