use crate::types::AE;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Application entity titles are limited to 16 characters.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part05/sect_6.2.html>
pub const MAX_AE_TITLE_LENGTH: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
	#[error("AE title must not be empty")]
	EmptyAeTitle,
	#[error("AE title '{0}' exceeds {MAX_AE_TITLE_LENGTH} characters")]
	AeTitleTooLong(AE),
	#[error("AE title '{0}' contains invalid characters")]
	InvalidAeTitle(AE),
	#[error("Host must not be empty")]
	EmptyHost,
	#[error("Port must be greater than zero")]
	InvalidPort,
	#[error("Invalid node address '{0}', expected AET@host:port")]
	InvalidAddress(String),
}

/// Optional TLS settings of a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsOptions {
	/// PEM encoded CA certificates used to verify the peer.
	pub ca_file: Option<PathBuf>,
	/// PEM encoded client certificate.
	pub certificate_file: Option<PathBuf>,
	/// PEM encoded private key of the client certificate.
	pub key_file: Option<PathBuf>,
}

/// A remote application entity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Node {
	pub aet: AE,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub tls: Option<TlsOptions>,
}

impl Node {
	pub fn new(aet: impl Into<AE>, host: impl Into<String>, port: u16) -> Self {
		Self {
			aet: aet.into(),
			host: host.into(),
			port,
			tls: None,
		}
	}

	pub fn validate(&self) -> Result<(), NodeError> {
		validate_ae_title(&self.aet)?;
		if self.host.trim().is_empty() {
			return Err(NodeError::EmptyHost);
		}
		if self.port == 0 {
			return Err(NodeError::InvalidPort);
		}
		Ok(())
	}
}

impl Display for Node {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}:{}", self.aet, self.host, self.port)
	}
}

impl FromStr for Node {
	type Err = NodeError;

	/// Parses the `AET@host:port` notation.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || NodeError::InvalidAddress(s.to_owned());
		let (aet, address) = s.split_once('@').ok_or_else(invalid)?;
		let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
		let port = port.parse::<u16>().map_err(|_| invalid())?;
		let node = Self::new(aet, host, port);
		node.validate()?;
		Ok(node)
	}
}

/// Checks the length and character repertoire of an AE title.
pub fn validate_ae_title(aet: &str) -> Result<(), NodeError> {
	let trimmed = aet.trim();
	if trimmed.is_empty() {
		return Err(NodeError::EmptyAeTitle);
	}
	if aet.len() > MAX_AE_TITLE_LENGTH {
		return Err(NodeError::AeTitleTooLong(aet.to_owned()));
	}
	if aet.chars().any(|c| c.is_control() || c == '\\' || !c.is_ascii()) {
		return Err(NodeError::InvalidAeTitle(aet.to_owned()));
	}
	Ok(())
}
