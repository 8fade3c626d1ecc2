//! Storage commitment push model, service class user side.
//!
//! The request is an N-ACTION carrying a transaction UID and the instances to commit. The
//! result arrives as an N-EVENT-REPORT, either on the same association or on an association
//! that the peer opens later towards our store service class provider. Both paths publish
//! the result into a [`CommitmentMediator`] keyed by the transaction UID.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part04/chapter_J.html>

use super::mediator::{Mediator, MediatorError};
use super::{EventReport, EventReportHandler, NormalizedActionRequest};
use crate::association::{AssociationError, Connector, NegotiationError, PresentationContexts};
use crate::association::negotiation::default_transfer_syntaxes;
use crate::dimse::dispatcher::DispatchError;
use crate::dimse::{status, DimseOperation, Dispatcher, ReadError, RemoteEntity, StatusType};
use crate::progress::Progress;
use crate::types::{new_uid, trim_uid, UI, US};
use async_trait::async_trait;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const STORAGE_COMMITMENT_PUSH_MODEL: &str = "1.2.840.10008.1.20.1";
/// The well-known SOP instance of the push model.
pub const STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE: &str = "1.2.840.10008.1.20.1.1";
pub const ACTION_TYPE_REQUEST_COMMITMENT: US = 1;
pub const EVENT_TYPE_SUCCESS: US = 1;
pub const EVENT_TYPE_FAILURES: US = 2;

pub type CommitmentMediator = Mediator<UI, CommitmentResult>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReference {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

impl InstanceReference {
	fn to_item(&self) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::REFERENCED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, self.sop_class_uid.clone())),
			DataElement::new(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, self.sop_instance_uid.clone())),
		])
	}

	fn from_item(item: &InMemDicomObject) -> Option<Self> {
		Some(Self {
			sop_class_uid: read_uid(item, tags::REFERENCED_SOP_CLASS_UID)?,
			sop_instance_uid: read_uid(item, tags::REFERENCED_SOP_INSTANCE_UID)?,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedReference {
	pub reference: InstanceReference,
	pub failure_reason: Option<US>,
}

/// The outcome of a storage commitment transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentResult {
	pub transaction_uid: UI,
	pub committed: Vec<InstanceReference>,
	pub failed: Vec<FailedReference>,
}

impl CommitmentResult {
	pub fn from_event(report: &EventReport) -> Result<Self, ReadError> {
		let information = report
			.event_information
			.as_ref()
			.ok_or(ReadError::MissingAttribute(tags::TRANSACTION_UID))?;
		let transaction_uid = read_uid(information, tags::TRANSACTION_UID)
			.ok_or(ReadError::MissingAttribute(tags::TRANSACTION_UID))?;

		let committed = items(information, tags::REFERENCED_SOP_SEQUENCE)
			.iter()
			.filter_map(InstanceReference::from_item)
			.collect();
		let failed = items(information, tags::FAILED_SOP_SEQUENCE)
			.iter()
			.filter_map(|item| {
				Some(FailedReference {
					reference: InstanceReference::from_item(item)?,
					failure_reason: item
						.get(tags::FAILURE_REASON)
						.map(InMemElement::to_int::<US>)
						.and_then(Result::ok),
				})
			})
			.collect();

		Ok(Self {
			transaction_uid,
			committed,
			failed,
		})
	}

	/// The event information of the N-EVENT-REPORT that carries this result.
	pub fn to_event_information(&self) -> InMemDicomObject {
		let mut object = InMemDicomObject::from_element_iter([DataElement::new(
			tags::TRANSACTION_UID,
			VR::UI,
			dicom_value!(Str, self.transaction_uid.clone()),
		)]);
		object.put(sequence(
			tags::REFERENCED_SOP_SEQUENCE,
			self.committed.iter().map(InstanceReference::to_item),
		));
		if !self.failed.is_empty() {
			object.put(sequence(
				tags::FAILED_SOP_SEQUENCE,
				self.failed.iter().map(|failed| {
					let mut item = failed.reference.to_item();
					if let Some(reason) = failed.failure_reason {
						item.put(DataElement::new(tags::FAILURE_REASON, VR::US, dicom_value!(U16, [reason])));
					}
					item
				}),
			));
		}
		object
	}

	pub fn event_type_id(&self) -> US {
		if self.failed.is_empty() {
			EVENT_TYPE_SUCCESS
		} else {
			EVENT_TYPE_FAILURES
		}
	}
}

fn read_uid(object: &InMemDicomObject, tag: Tag) -> Option<UI> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| UI::from(trim_uid(&value)))
}

fn items(object: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
	object
		.get(tag)
		.and_then(InMemElement::items)
		.unwrap_or_default()
}

fn sequence(tag: Tag, items: impl Iterator<Item = InMemDicomObject>) -> InMemElement {
	let mut element = InMemElement::new(tag, VR::SQ, Value::Sequence(DataSetSequence::empty()));
	if let Some(sequence) = element.items_mut() {
		sequence.extend(items);
	}
	element
}

/// Publishes storage commitment results received through N-EVENT-REPORT.
pub struct CommitmentEventHandler {
	mediator: CommitmentMediator,
}

impl CommitmentEventHandler {
	pub const fn new(mediator: CommitmentMediator) -> Self {
		Self { mediator }
	}
}

#[async_trait]
impl EventReportHandler for CommitmentEventHandler {
	async fn on_event(&self, report: EventReport) -> US {
		if trim_uid(&report.sop_class_uid) != STORAGE_COMMITMENT_PUSH_MODEL {
			warn!(sop_class_uid = report.sop_class_uid, "Unsupported event report");
			return status::NO_SUCH_SOP_CLASS;
		}
		let result = match CommitmentResult::from_event(&report) {
			Ok(result) => result,
			Err(err) => {
				warn!(source_aet = report.source_aet, "Invalid storage commitment result: {err}");
				return status::PROCESSING_FAILURE;
			}
		};

		let transaction_uid = result.transaction_uid.clone();
		match self.mediator.publish(&transaction_uid, result).await {
			Ok(()) => debug!(transaction_uid, "Published storage commitment result"),
			Err(err @ MediatorError::MissingCallback { .. }) => info!("{err}"),
			Err(err) => warn!("{err}"),
		}
		status::SUCCESS
	}
}

pub struct StorageCommitmentOptions {
	pub instances: Vec<InstanceReference>,
	/// Generated if not set.
	pub transaction_uid: Option<UI>,
	/// How long to wait for the result.
	pub wait: Duration,
	/// Wait for the N-EVENT-REPORT on the association that carried the request.
	/// Otherwise the association is released and the result is expected on a later
	/// association accepted by the store service class provider.
	pub same_association: bool,
}

/// Service class user for the storage commitment push model.
pub struct StorageCommitmentServiceClassUser<C: Connector> {
	remote: RemoteEntity<C>,
	dispatcher: Dispatcher,
	mediator: CommitmentMediator,
}

impl<C: Connector> StorageCommitmentServiceClassUser<C> {
	pub fn new(remote: RemoteEntity<C>, mediator: CommitmentMediator) -> Self {
		let dispatcher = Dispatcher::new(remote.timeout())
			.with_event_handler(Arc::new(CommitmentEventHandler::new(mediator.clone())));
		Self {
			remote,
			dispatcher,
			mediator,
		}
	}

	#[instrument(skip_all, name = "STORAGE-COMMITMENT")]
	pub async fn request(
		&self,
		options: StorageCommitmentOptions,
		progress: &Progress,
	) -> Result<CommitmentResult, CommitmentError> {
		let transaction_uid = options.transaction_uid.unwrap_or_else(new_uid);
		let mut subscription = self.mediator.subscribe(transaction_uid.clone());

		let mut contexts = PresentationContexts::new();
		contexts.add(STORAGE_COMMITMENT_PUSH_MODEL, default_transfer_syntaxes())?;
		let (manager, lease) = self.remote.associate(contexts, progress).await?;

		let action_information = sequence(
			tags::REFERENCED_SOP_SEQUENCE,
			options.instances.iter().map(InstanceReference::to_item),
		);
		let mut information = InMemDicomObject::from_element_iter([DataElement::new(
			tags::TRANSACTION_UID,
			VR::UI,
			dicom_value!(Str, transaction_uid.clone()),
		)]);
		information.put(action_information);

		let request = NormalizedActionRequest {
			message_id: 0,
			requested_sop_class_uid: UI::from(STORAGE_COMMITMENT_PUSH_MODEL),
			requested_sop_instance_uid: UI::from(STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE),
			action_type_id: ACTION_TYPE_REQUEST_COMMITMENT,
			action_information: Some(information),
		};
		let response = match self
			.dispatcher
			.send(lease.clone(), DimseOperation::Action(request), None)
		{
			Ok(handle) => handle.final_response().await,
			Err(err) => Err(err),
		};
		let response = match response {
			Ok(response) => response,
			Err(err) => {
				drop(lease);
				manager.close(true).await;
				return Err(err.into());
			}
		};
		progress.on_final(response.status, response.error_comment.clone());
		if response.status_type() == StatusType::Failure {
			drop(lease);
			manager.close(false).await;
			return Err(CommitmentError::Rejected(response.status));
		}
		info!(transaction_uid, instances = options.instances.len(), "Requested storage commitment");

		let result = if options.same_association {
			let deadline = Instant::now() + options.wait;
			// A report that arrived before the N-ACTION-RSP was published while waiting for it.
			let mut result = subscription.try_recv();
			while result.is_none() {
				let remaining = deadline.saturating_duration_since(Instant::now());
				match self.dispatcher.next_event_report(&*lease, remaining).await {
					Ok(Some(_)) => result = subscription.try_recv(),
					Ok(None) => break,
					Err(err) => {
						warn!("Stopped waiting for the storage commitment result: {err}");
						break;
					}
				}
			}
			drop(lease);
			manager.close(false).await;
			result
		} else {
			drop(lease);
			manager.close(false).await;
			tokio::time::timeout(options.wait, subscription.recv())
				.await
				.ok()
				.flatten()
		};

		let result = result.ok_or(CommitmentError::Timeout(options.wait))?;
		for committed in &result.committed {
			progress.on_sub_operation(Some(committed.sop_instance_uid.as_str()), status::SUCCESS, 0);
		}
		for failed in &result.failed {
			progress.on_sub_operation(
				Some(failed.reference.sop_instance_uid.as_str()),
				failed.failure_reason.unwrap_or(status::PROCESSING_FAILURE),
				0,
			);
		}
		Ok(result)
	}
}

#[derive(Debug, Error)]
pub enum CommitmentError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	#[error("The peer rejected the storage commitment request with status {0:#06x}")]
	Rejected(US),
	#[error("No storage commitment result within {0:?}")]
	Timeout(Duration),
}
