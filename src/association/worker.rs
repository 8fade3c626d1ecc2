//! The OS thread that owns a blocking `dicom-ul` association.
//!
//! The handshake and every read and write happen on that thread. Async code sends it
//! [`Command`]s through a bounded channel and waits for the reply (see [`AskPattern`]).
//! The thread aborts the association once the handle is dropped.

use super::negotiation::NegotiatedContext;
use super::{AskPattern, Association, AssociationError, ChannelError};
use crate::types::AE;
use dicom::ul::Pdu;
use std::convert::identity;
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info_span, warn};

#[derive(Debug)]
pub(super) enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
	Release(oneshot::Sender<Result<(), AssociationError>>),
}

/// The blocking side of an established association.
pub(super) trait UpperLayer: Send + 'static {
	fn send(&mut self, pdu: &Pdu) -> Result<(), AssociationError>;

	fn receive(&mut self) -> Result<Pdu, AssociationError>;

	/// Ends the association on behalf of the local node.
	fn release(self) -> Result<(), AssociationError>;

	fn abort(self);
}

/// What the async side needs to know about an established association.
pub(super) struct Handshake {
	pub peer_aet: AE,
	pub contexts: Vec<NegotiatedContext>,
	pub max_pdu_length: u32,
	/// A clone of the socket, used to tear the association down from outside its thread.
	pub stream: TcpStream,
}

/// An association driven by `dicom-ul` on a dedicated thread.
#[derive(Debug)]
pub struct UlAssociation {
	channel: mpsc::Sender<Command>,
	peer_aet: AE,
	presentation_contexts: Vec<NegotiatedContext>,
	max_pdu_length: u32,
	stream: TcpStream,
}

impl UlAssociation {
	/// Runs `establish` on a new thread and keeps serving the association there.
	pub(super) async fn spawn<U, F>(
		name: String,
		timeout: Duration,
		establish: F,
	) -> Result<Self, AssociationError>
	where
		U: UpperLayer,
		F: FnOnce() -> Result<(U, Handshake), AssociationError> + Send + 'static,
	{
		let (tx, rx) = mpsc::channel::<Command>(1);
		let (ready_tx, ready) = oneshot::channel();

		let span = info_span!("UL", thread = %name);
		thread::Builder::new()
			.name(name)
			.spawn(move || {
				let _entered = span.enter();
				match establish() {
					Ok((association, handshake)) => {
						if ready_tx.send(Ok(handshake)).is_ok() {
							serve(association, rx);
						} else {
							debug!("Nobody is waiting for the handshake anymore");
							association.abort();
						}
					}
					Err(err) => {
						let _ = ready_tx.send(Err(err));
					}
				}
			})
			.map_err(AssociationError::OsThread)?;

		let handshake = tokio::time::timeout(timeout, ready)
			.await
			.map_err(|_| ChannelError::Timeout)?
			.map_err(|_| ChannelError::Closed)??;

		Ok(Self {
			channel: tx,
			peer_aet: handshake.peer_aet,
			presentation_contexts: handshake.contexts,
			max_pdu_length: handshake.max_pdu_length,
			stream: handshake.stream,
		})
	}

	/// The AE title of the other side.
	pub fn peer_aet(&self) -> &str {
		&self.peer_aet
	}

	fn shutdown(&self) {
		if let Err(err) = self.stream.shutdown(Shutdown::Both) {
			debug!("Failed to shut down TCP stream: {err}");
		}
	}
}

fn serve<U: UpperLayer>(mut association: U, mut commands: mpsc::Receiver<Command>) {
	while let Some(command) = commands.blocking_recv() {
		let delivered = match command {
			Command::Send(pdu, reply_to) => reply_to.send(association.send(&pdu)).is_ok(),
			Command::Receive(reply_to) => reply_to.send(association.receive()).is_ok(),
			Command::Release(reply_to) => {
				let _ = reply_to.send(association.release());
				return;
			}
		};
		if !delivered {
			error!("Caller stopped waiting for the association");
			break;
		}
	}

	commands.close();
	association.abort();
}

impl Drop for UlAssociation {
	fn drop(&mut self) {
		self.shutdown();
	}
}

impl Association for UlAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn release(&self, timeout: Duration) -> Result<(), AssociationError> {
		let result = self
			.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity);
		if let Err(err) = &result {
			warn!(peer_aet = self.peer_aet, "Graceful release failed: {err}");
		}
		result
	}

	fn abort(&self) {
		self.shutdown();
	}

	fn presentation_contexts(&self) -> &[NegotiatedContext] {
		&self.presentation_contexts
	}

	fn acceptor_max_pdu_length(&self) -> u32 {
		self.max_pdu_length
	}
}
