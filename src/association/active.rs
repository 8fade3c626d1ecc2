use super::negotiation::{accepted_context, select_context, NegotiatedContext};
use super::{Association, AssociationError};
use crate::dimse::{encode_message, DicomMessage, MessageAssembler, ReadError, WriteError};
use crate::types::{AE, US};
use dicom::ul::Pdu;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{instrument, trace};
use uuid::Uuid;

/// An established association together with its negotiated state.
///
/// Message ids are unique per association and start at 1.
/// Only one DIMSE operation runs at a time (see [`Self::lock_operations`]); asynchronous
/// requests from the peer that arrive while an operation is running are handled by that
/// operation's reader.
pub struct ActiveAssociation<A> {
	transport: A,
	uuid: Uuid,
	calling_aet: AE,
	called_aet: AE,
	contexts: Vec<NegotiatedContext>,
	message_ids: AtomicU16,
	assembler: Mutex<MessageAssembler>,
	operations: Mutex<()>,
}

impl<A: Association> ActiveAssociation<A> {
	pub fn new(transport: A, calling_aet: impl Into<AE>, called_aet: impl Into<AE>) -> Self {
		let contexts = transport.presentation_contexts().to_vec();
		Self {
			transport,
			uuid: Uuid::new_v4(),
			calling_aet: calling_aet.into(),
			called_aet: called_aet.into(),
			contexts,
			message_ids: AtomicU16::new(1),
			assembler: Mutex::new(MessageAssembler::default()),
			operations: Mutex::new(()),
		}
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	pub fn called_aet(&self) -> &str {
		&self.called_aet
	}

	pub const fn transport(&self) -> &A {
		&self.transport
	}

	pub fn presentation_contexts(&self) -> &[NegotiatedContext] {
		&self.contexts
	}

	/// The accepted context for the abstract syntax, preferring the given transfer syntax.
	pub fn context_for(
		&self,
		abstract_syntax: &str,
		transfer_syntax: Option<&str>,
	) -> Option<&NegotiatedContext> {
		select_context(&self.contexts, abstract_syntax, transfer_syntax)
	}

	/// The accepted context for exactly this abstract syntax and transfer syntax.
	pub fn accepted(
		&self,
		abstract_syntax: &str,
		transfer_syntax: &str,
	) -> Option<&NegotiatedContext> {
		accepted_context(&self.contexts, abstract_syntax, transfer_syntax)
	}

	/// Returns a message id that is unique on this association.
	pub fn next_message_id(&self) -> US {
		loop {
			let id = self.message_ids.fetch_add(1, Ordering::SeqCst);
			if id != 0 {
				return id;
			}
		}
	}

	/// Serializes DIMSE operations on this association.
	pub async fn lock_operations(&self) -> MutexGuard<'_, ()> {
		self.operations.lock().await
	}

	/// Reads the next complete DIMSE message.
	/// A release request from the peer is answered and reported as [`ReadError::Released`].
	#[instrument(skip_all)]
	pub async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut assembler = self.assembler.lock().await;
		loop {
			if let Some(message) = assembler.pop() {
				return Ok(message);
			}

			match self.transport.receive(timeout).await? {
				Pdu::PData { data } => {
					for pdv in data {
						trace!(
							presentation_context_id = pdv.presentation_context_id,
							"Received fragment (last={})",
							pdv.is_last
						);
						assembler.push(pdv, &self.contexts)?;
					}
				}
				Pdu::ReleaseRQ => {
					self.transport.send(Pdu::ReleaseRP, timeout).await?;
					return Err(ReadError::Released);
				}
				Pdu::AbortRQ { .. } => return Err(ReadError::Aborted),
				pdu => return Err(ReadError::UnexpectedPdu(pdu)),
			}
		}
	}

	/// Writes a DIMSE message on the given presentation context.
	#[instrument(skip_all)]
	pub async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: u8,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let context = self
			.contexts
			.iter()
			.find(|pc| pc.id == presentation_context_id)
			.ok_or(crate::association::NegotiationError::NoPresentationContext)?;

		for pdu in encode_message(message.into(), context.id, &context.transfer_syntax)? {
			self.transport.send(pdu, timeout).await?;
		}
		Ok(())
	}

	pub async fn release(&self, timeout: Duration) -> Result<(), AssociationError> {
		self.transport.release(timeout).await
	}

	pub fn abort(&self) {
		self.transport.abort();
	}
}
