//! Relays instances to a third node.
//!
//! Instances arrive through a [`StoreHandler`], either as C-GET sub-operations of a
//! [`RetrieveForwardSession`] or on associations accepted by the store service class provider.
//! They leave through one outbound association owned by a [`ForwardDestination`].

pub mod codec;
mod destination;
pub mod session;

pub use codec::{AttributeEditor, AttributeEdits, CodecError, DatasetCodec, NativeCodec};
pub use destination::{ForwardDestination, Permit};
pub use session::RetrieveForwardSession;

use crate::association::{AssociationError, Connector, NegotiationError};
use crate::dimse::cstore::{CompositeStoreRequest, InboundObject, StoreHandler};
use crate::dimse::dispatcher::DispatchError;
use crate::dimse::{status, DataSet, DimseOperation, Dispatcher, StatusType};
use crate::progress::Progress;
use crate::types::{trim_uid, Priority, UI, US};
use async_trait::async_trait;
use bytes::Bytes;
use dicom::dictionary_std::uids;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone)]
pub struct ForwardOptions {
	/// The outbound association is released after this long without instances.
	pub idle_timeout: Duration,
	/// How long a renegotiation waits for instances in flight.
	pub renegotiation_timeout: Duration,
	/// Transfer syntax requested for all forwarded instances. Instances keep their transfer
	/// syntax if not set.
	pub transfer_syntax: Option<UI>,
	/// SOP classes proposed on the first association, before any instance arrived.
	pub sop_classes: Vec<UI>,
}

impl Default for ForwardOptions {
	fn default() -> Self {
		Self {
			idle_timeout: Duration::from_secs(15),
			renegotiation_timeout: Duration::from_secs(60),
			transfer_syntax: None,
			sop_classes: Vec::new(),
		}
	}
}

impl ForwardOptions {
	pub fn preferred_transfer_syntax(&self) -> &str {
		self.transfer_syntax
			.as_deref()
			.unwrap_or(uids::EXPLICIT_VR_LITTLE_ENDIAN)
	}
}

#[derive(Debug, Error)]
pub enum ForwardError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("The destination did not accept SOP class {0}")]
	NotAccepted(UI),
	#[error(transparent)]
	Codec(#[from] CodecError),
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	#[error("Transcoding task failed: {0}")]
	Task(#[from] tokio::task::JoinError),
	#[error("The forward destination is shut down")]
	Closed,
}

impl ForwardError {
	/// The status reported for the instance that failed.
	pub const fn status(&self) -> US {
		match self {
			Self::NotAccepted(_) => status::SOP_CLASS_NOT_SUPPORTED,
			Self::Codec(_) | Self::Task(_) => status::UNABLE_TO_PROCESS,
			Self::Dispatch(_) => status::PROCESSING_FAILURE,
			Self::Association(_) | Self::Negotiation(_) | Self::Closed => status::OUT_OF_RESOURCES,
		}
	}
}

/// Forwards every received instance and answers with the status of the outbound C-STORE.
/// Instances are passed through unchanged if no edits are configured and the destination
/// accepted their transfer syntax. Otherwise they are transcoded.
pub struct ForwardStoreHandler<C: Connector> {
	destination: ForwardDestination<C>,
	dispatcher: Dispatcher,
	codec: Arc<dyn DatasetCodec>,
	editor: Option<Arc<dyn AttributeEditor>>,
	priority: Priority,
	progress: Progress,
}

impl<C: Connector> ForwardStoreHandler<C> {
	pub fn new(destination: ForwardDestination<C>, timeout: Duration) -> Self {
		Self {
			destination,
			dispatcher: Dispatcher::new(timeout),
			codec: Arc::new(NativeCodec),
			editor: None,
			priority: Priority::Medium,
			progress: Progress::counting(),
		}
	}

	#[must_use]
	pub fn with_codec(mut self, codec: Arc<dyn DatasetCodec>) -> Self {
		self.codec = codec;
		self
	}

	#[must_use]
	pub fn with_editor(mut self, editor: Arc<dyn AttributeEditor>) -> Self {
		self.editor = Some(editor);
		self
	}

	#[must_use]
	pub const fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	/// Outcomes of the outbound C-STOREs are recorded here.
	#[must_use]
	pub fn with_progress(mut self, progress: Progress) -> Self {
		self.progress = progress;
		self
	}

	pub const fn destination(&self) -> &ForwardDestination<C> {
		&self.destination
	}

	pub const fn progress(&self) -> &Progress {
		&self.progress
	}

	async fn forward(&self, object: InboundObject) -> Result<(US, u64), ForwardError> {
		let mut permit = self
			.destination
			.acquire(&object.sop_class_uid, &object.sop_instance_uid, &object.transfer_syntax)
			.await?;
		let transfer_syntax = UI::from(permit.transfer_syntax());

		let bytes = self.prepare(&object, &transfer_syntax).await?;
		let length = bytes.len() as u64;
		let request = CompositeStoreRequest {
			affected_sop_class_uid: object.sop_class_uid,
			affected_sop_instance_uid: object.sop_instance_uid,
			move_originator_aet: object.move_originator_aet,
			move_originator_message_id: object.move_originator_message_id,
			message_id: 0,
			priority: self.priority as US,
			data_set: DataSet::Encoded {
				bytes,
				transfer_syntax,
			},
		};

		let response = match self.dispatcher.send(
			permit.lease().clone(),
			DimseOperation::Store(request),
			None,
		) {
			Ok(handle) => handle.final_response().await,
			Err(err) => Err(err),
		};
		match response {
			Ok(response) => {
				let transferred = match response.status_type() {
					StatusType::Success | StatusType::Warning => length,
					_ => 0,
				};
				Ok((response.status, transferred))
			}
			Err(err) => {
				permit.poison();
				Err(err.into())
			}
		}
	}

	/// The bytes to send with the negotiated transfer syntax.
	async fn prepare(&self, object: &InboundObject, transfer_syntax: &str) -> Result<Bytes, ForwardError> {
		if self.editor.is_none() && trim_uid(&object.transfer_syntax) == trim_uid(transfer_syntax) {
			trace!("Passing instance through");
			return Ok(object.data.clone());
		}

		debug!(
			from = object.transfer_syntax,
			to = transfer_syntax,
			"Transcoding instance"
		);
		let codec = Arc::clone(&self.codec);
		let editor = self.editor.clone();
		let data = object.data.clone();
		let from = object.transfer_syntax.clone();
		let to = UI::from(transfer_syntax);
		let bytes =
			tokio::task::spawn_blocking(move || codec.transcode(&data, &from, &to, editor.as_deref()))
				.await??;
		Ok(bytes)
	}
}

#[async_trait]
impl<C: Connector> StoreHandler for ForwardStoreHandler<C> {
	#[instrument(skip_all, fields(sop_instance_uid = %object.sop_instance_uid))]
	async fn store(&self, object: InboundObject) -> US {
		let sop_instance_uid = object.sop_instance_uid.clone();
		let (code, bytes) = match self.forward(object).await {
			Ok(outcome) => outcome,
			Err(err) => {
				warn!("Failed to forward instance: {err}");
				(err.status(), 0)
			}
		};
		self.progress
			.on_sub_operation(Some(sop_instance_uid.as_str()), code, bytes);
		code
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn errors_map_to_store_status() {
		assert_eq!(
			ForwardError::NotAccepted(UI::from("1.2.3")).status(),
			status::SOP_CLASS_NOT_SUPPORTED
		);
		assert_eq!(ForwardError::Closed.status(), status::OUT_OF_RESOURCES);
		assert_eq!(
			ForwardError::Codec(CodecError::Unsupported {
				from: UI::from("1.2.840.10008.1.2.1"),
				to: UI::from("1.2.840.10008.1.2.4.50"),
			})
			.status(),
			status::UNABLE_TO_PROCESS
		);
	}

	#[test]
	fn prefers_explicit_little_endian() {
		let options = ForwardOptions::default();
		assert_eq!(options.preferred_transfer_syntax(), uids::EXPLICIT_VR_LITTLE_ENDIAN);
		assert_eq!(options.idle_timeout, Duration::from_secs(15));
		assert_eq!(options.renegotiation_timeout, Duration::from_secs(60));
	}
}
