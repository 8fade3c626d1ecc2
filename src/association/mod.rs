//! Association transport and lifecycle.
//!
//! [`Connector`] and [`Association`] are the seams to the upper layer. The production
//! implementation runs the blocking `dicom-ul` association on a thread of its own.

use crate::node::{Node, NodeError};
use crate::types::AE;
use dicom::ul::Pdu;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

mod active;
pub mod client;
pub mod manager;
pub mod negotiation;
pub mod server;
mod worker;

pub use active::ActiveAssociation;
pub use client::DicomUlConnector;
pub use manager::{AssociationLease, AssociationManager, AssociationOptions, AssociationState};
pub use negotiation::{NegotiatedContext, NegotiationError, PresentationContexts};
pub use worker::UlAssociation;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error(transparent)]
	Association(#[from] dicom::ul::association::Error),
	#[error("Invalid node configuration: {0}")]
	InvalidNode(#[from] NodeError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Association is not idle (state: {0})")]
	NotIdle(AssociationState),
	#[error("Association is not open")]
	NotOpen,
	#[error("TLS connections are not supported by this connector")]
	TlsUnsupported,
	#[error("Timed out after {0:?} while waiting for outstanding operations")]
	Outstanding(Duration),
	#[error("Failed to connect to {node}: {source}")]
	Connect {
		node: String,
		source: std::io::Error,
	},
}

/// The transport of an established association.
pub trait Association: Send + Sync + 'static {
	fn receive(
		&self,
		timeout: Duration,
	) -> impl Future<Output = Result<Pdu, AssociationError>> + Send;

	fn send(
		&self,
		pdu: Pdu,
		timeout: Duration,
	) -> impl Future<Output = Result<(), AssociationError>> + Send;

	/// Performs the A-RELEASE handshake. The transport is unusable afterward.
	fn release(&self, timeout: Duration) -> impl Future<Output = Result<(), AssociationError>> + Send;

	/// Tears down the association immediately.
	fn abort(&self);

	/// The accepted presentation contexts.
	fn presentation_contexts(&self) -> &[NegotiatedContext];

	/// The maximum PDU length announced by the peer.
	fn acceptor_max_pdu_length(&self) -> u32;
}

/// Everything needed to request an association with a remote node.
#[derive(Debug, Clone)]
pub struct AssociationRequest {
	pub calling_aet: AE,
	pub node: Node,
	pub contexts: PresentationContexts,
	pub max_pdu_length: u32,
	pub timeout: Duration,
}

/// Establishes outbound associations.
pub trait Connector: Clone + Send + Sync + 'static {
	type Association: Association;

	fn connect(
		&self,
		request: AssociationRequest,
	) -> impl Future<Output = Result<Self::Association, AssociationError>> + Send;
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

pub trait AskPattern<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError>;
}

impl<T> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError> {
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;

			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}
