//! Drives DIMSE request/response exchanges on an association.
//!
//! [`Dispatcher::send`] writes the request and hands the rest of the exchange to a task that
//! reads the responses and publishes them as [`DimseEvent`]s, pending responses first and the
//! final response last. Requests that the peer sends while an operation is running, such as
//! C-STORE sub-operations of a C-GET or storage commitment event reports, are answered by the
//! same task.

use super::ccancel::CompositeCancelRequest;
use super::cecho::{
	CompositeEchoRequest, CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST,
	COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE,
};
use super::cfind::{CompositeFindRequest, COMMAND_FIELD_COMPOSITE_FIND_RESPONSE};
use super::cget::{CompositeGetRequest, COMMAND_FIELD_COMPOSITE_GET_RESPONSE};
use super::cmove::{CompositeMoveRequest, COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE};
use super::cstore::{
	CompositeStoreRequest, CompositeStoreResponse, InboundObject, StoreHandler,
	COMMAND_FIELD_COMPOSITE_STORE_REQUEST, COMMAND_FIELD_COMPOSITE_STORE_RESPONSE,
};
use super::ncommand::{
	EventReport, EventReportHandler, NormalizedActionRequest, NormalizedCreateRequest,
	NormalizedSetRequest, COMMAND_FIELD_ACTION_RESPONSE, COMMAND_FIELD_CREATE_RESPONSE,
	COMMAND_FIELD_EVENT_REPORT_REQUEST, COMMAND_FIELD_SET_RESPONSE,
};
use super::{status, DataSet, DicomMessage, ReadError, StatusType, WriteError};
use crate::association::{
	ActiveAssociation, Association, AssociationError, AssociationLease, ChannelError,
	NegotiationError,
};
use crate::progress::{Progress, SubOperationCounters};
use crate::types::{UI, US};
use dicom::dictionary_std::{tags, uids};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Number of events buffered before the dispatcher waits for the consumer.
const EVENT_BUFFER: usize = 32;

#[derive(Debug)]
pub enum DimseOperation {
	Echo(CompositeEchoRequest),
	Find {
		request: CompositeFindRequest,
		/// Number of matches after which the query is cancelled.
		cancel_after: Option<usize>,
	},
	Get(CompositeGetRequest),
	Move(CompositeMoveRequest),
	Store(CompositeStoreRequest),
	Action(NormalizedActionRequest),
	Create(NormalizedCreateRequest),
	Set(NormalizedSetRequest),
}

impl DimseOperation {
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::Echo(_) => "C-ECHO",
			Self::Find { .. } => "C-FIND",
			Self::Get(_) => "C-GET",
			Self::Move(_) => "C-MOVE",
			Self::Store(_) => "C-STORE",
			Self::Action(_) => "N-ACTION",
			Self::Create(_) => "N-CREATE",
			Self::Set(_) => "N-SET",
		}
	}

	pub const fn response_command_field(&self) -> US {
		match self {
			Self::Echo(_) => COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE,
			Self::Find { .. } => COMMAND_FIELD_COMPOSITE_FIND_RESPONSE,
			Self::Get(_) => COMMAND_FIELD_COMPOSITE_GET_RESPONSE,
			Self::Move(_) => COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE,
			Self::Store(_) => COMMAND_FIELD_COMPOSITE_STORE_RESPONSE,
			Self::Action(_) => COMMAND_FIELD_ACTION_RESPONSE,
			Self::Create(_) => COMMAND_FIELD_CREATE_RESPONSE,
			Self::Set(_) => COMMAND_FIELD_SET_RESPONSE,
		}
	}

	/// The abstract syntax of the presentation context the request is sent on.
	pub fn abstract_syntax(&self) -> &str {
		match self {
			Self::Echo(_) => uids::VERIFICATION,
			Self::Find { request, .. } => &request.affected_sop_class_uid,
			Self::Get(request) => &request.affected_sop_class_uid,
			Self::Move(request) => &request.affected_sop_class_uid,
			Self::Store(request) => &request.affected_sop_class_uid,
			Self::Action(request) => &request.requested_sop_class_uid,
			Self::Create(request) => &request.affected_sop_class_uid,
			Self::Set(request) => &request.requested_sop_class_uid,
		}
	}

	/// The transfer syntax the data set is already encoded with, if any.
	pub fn transfer_syntax(&self) -> Option<&str> {
		match self {
			Self::Store(CompositeStoreRequest {
				data_set: DataSet::Encoded {
					transfer_syntax, ..
				},
				..
			}) => Some(transfer_syntax),
			_ => None,
		}
	}

	pub fn set_message_id(&mut self, message_id: US) {
		match self {
			Self::Echo(request) => request.message_id = message_id,
			Self::Find { request, .. } => request.message_id = message_id,
			Self::Get(request) => request.message_id = message_id,
			Self::Move(request) => request.message_id = message_id,
			Self::Store(request) => request.message_id = message_id,
			Self::Action(request) => request.message_id = message_id,
			Self::Create(request) => request.message_id = message_id,
			Self::Set(request) => request.message_id = message_id,
		}
	}

	pub const fn cancel_after(&self) -> Option<usize> {
		match self {
			Self::Find { cancel_after, .. } => *cancel_after,
			_ => None,
		}
	}

	/// Only operations with pending responses can be cancelled.
	pub const fn is_cancellable(&self) -> bool {
		matches!(self, Self::Find { .. } | Self::Get(_) | Self::Move(_))
	}

	pub fn into_message(self) -> DicomMessage {
		match self {
			Self::Echo(request) => request.into(),
			Self::Find { request, .. } => request.into(),
			Self::Get(request) => request.into(),
			Self::Move(request) => request.into(),
			Self::Store(request) => request.into(),
			Self::Action(request) => request.into(),
			Self::Create(request) => request.into(),
			Self::Set(request) => request.into(),
		}
	}
}

/// A response to a request sent through the [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DimseResponse {
	pub command_field: US,
	pub status: US,
	pub message_id_being_responded_to: US,
	pub affected_sop_instance_uid: Option<UI>,
	pub error_comment: Option<String>,
	/// Sub-operation counters of C-GET and C-MOVE responses.
	pub counters: Option<SubOperationCounters>,
	pub data: Option<DataSet>,
}

impl DimseResponse {
	pub fn status_type(&self) -> StatusType {
		StatusType::classify(self.status)
	}
}

impl TryFrom<DicomMessage> for DimseResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let command_field = message
			.command_field()
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_FIELD))?;
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;
		let message_id_being_responded_to = message
			.message_id_being_responded_to()
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID_BEING_RESPONDED_TO))?;

		let remaining = message.command_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS);
		let completed = message.command_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS);
		let failed = message.command_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS);
		let warning = message.command_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS);
		let counters = if [remaining, completed, failed, warning]
			.iter()
			.any(Option::is_some)
		{
			Some(SubOperationCounters {
				remaining: u32::from(remaining.unwrap_or_default()),
				completed: u32::from(completed.unwrap_or_default()),
				failed: u32::from(failed.unwrap_or_default()),
				warning: u32::from(warning.unwrap_or_default()),
			})
		} else {
			None
		};

		Ok(Self {
			command_field,
			status,
			message_id_being_responded_to,
			affected_sop_instance_uid: message.affected_sop_instance_uid(),
			error_comment: message.command_str(tags::ERROR_COMMENT),
			counters,
			data: message.data,
		})
	}
}

#[derive(Debug)]
pub enum DimseEvent {
	Pending(DimseResponse),
	Final(DimseResponse),
}

#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("No presentation context was accepted for abstract syntax '{0}'")]
	NoPresentationContext(UI),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("The operation ended without a final response")]
	Interrupted,
}

/// Cancellation flag of a single operation.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
	/// Requests cancellation. Returns false if it was already requested.
	pub fn cancel(&self) -> bool {
		!self.0.swap(true, Ordering::SeqCst)
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

type Registry = HashMap<(Uuid, US), CancelHandle>;

#[derive(Clone)]
pub struct Dispatcher {
	timeout: Duration,
	store_handler: Option<Arc<dyn StoreHandler>>,
	event_handler: Option<Arc<dyn EventReportHandler>>,
	in_flight: Arc<Mutex<Registry>>,
}

impl Dispatcher {
	/// Creates a dispatcher that waits at most `timeout` for every single message.
	pub fn new(timeout: Duration) -> Self {
		Self {
			timeout,
			store_handler: None,
			event_handler: None,
			in_flight: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	#[must_use]
	pub fn with_store_handler(mut self, handler: Arc<dyn StoreHandler>) -> Self {
		self.store_handler = Some(handler);
		self
	}

	#[must_use]
	pub fn with_event_handler(mut self, handler: Arc<dyn EventReportHandler>) -> Self {
		self.event_handler = Some(handler);
		self
	}

	pub const fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Sends the request and returns a handle that yields the responses.
	/// The lease is held until the final response arrived.
	pub fn send<A: Association>(
		&self,
		lease: AssociationLease<A>,
		mut operation: DimseOperation,
		progress: Option<Progress>,
	) -> Result<OperationHandle, DispatchError> {
		let presentation_context_id = lease
			.context_for(operation.abstract_syntax(), operation.transfer_syntax())
			.map(|pc| pc.id)
			.ok_or_else(|| DispatchError::NoPresentationContext(UI::from(operation.abstract_syntax())))?;

		let message_id = lease.next_message_id();
		operation.set_message_id(message_id);

		let association_id = *lease.uuid();
		let cancel = CancelHandle::default();
		self.registry()
			.insert((association_id, message_id), cancel.clone());

		let (tx, rx) = mpsc::channel(EVENT_BUFFER);
		let span = info_span!(
			"DIMSE",
			kind = operation.kind(),
			message_id,
			association_id = association_id.to_string()
		);
		let exchange = Exchange {
			dispatcher: self.clone(),
			message_id,
			presentation_context_id,
			cancel: cancel.clone(),
			progress,
			events: tx,
		};
		tokio::spawn(exchange.run(lease, operation).instrument(span));

		Ok(OperationHandle {
			message_id,
			events: rx,
			cancel,
		})
	}

	/// Requests cancellation of an operation in flight.
	/// Only the first call for an operation has an effect, later calls and calls for finished
	/// operations return false.
	pub fn cancel(&self, association_id: &Uuid, message_id: US) -> bool {
		self.registry()
			.get(&(*association_id, message_id))
			.is_some_and(CancelHandle::cancel)
	}

	/// Number of operations that have not received their final response yet.
	pub fn in_flight(&self) -> usize {
		self.registry().len()
	}

	/// Waits for an N-EVENT-REPORT from the peer, answering other requests in the meantime.
	/// Returns `None` if no report arrived within the timeout.
	pub async fn next_event_report<A: Association>(
		&self,
		association: &ActiveAssociation<A>,
		timeout: Duration,
	) -> Result<Option<EventReport>, DispatchError> {
		let _operations = association.lock_operations().await;
		let deadline = Instant::now() + timeout;
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Ok(None);
			}
			let message = match association.read_message(remaining).await {
				Ok(message) => message,
				Err(ReadError::Association(AssociationError::Channel(ChannelError::Timeout))) => {
					return Ok(None);
				}
				Err(err) => return Err(err.into()),
			};

			if message.command_field() == Some(COMMAND_FIELD_EVENT_REPORT_REQUEST) {
				return self
					.on_event_report(association, association.called_aet(), message)
					.await;
			}
			if !self
				.respond(association, association.called_aet(), message, None)
				.await?
			{
				debug!("Ignored unexpected DIMSE message while waiting for an event report");
			}
		}
	}

	/// Answers a request sent by the peer: C-ECHO, C-STORE and N-EVENT-REPORT.
	/// Returns false if the message is not a request this dispatcher handles.
	pub async fn respond<A: Association>(
		&self,
		association: &ActiveAssociation<A>,
		source_aet: &str,
		message: DicomMessage,
		progress: Option<&Progress>,
	) -> Result<bool, DispatchError> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
				let presentation_context_id = context_of(&message)?;
				let response = CompositeEchoResponse {
					message_id_being_responded_to: message.message_id().unwrap_or_default(),
					status: status::SUCCESS,
				};
				association
					.write_message(response, presentation_context_id, self.timeout)
					.await?;
				debug!(source_aet, "Answered C-ECHO-RQ");
				Ok(true)
			}
			Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
				self.on_store_request(association, source_aet, message, progress)
					.await?;
				Ok(true)
			}
			Some(COMMAND_FIELD_EVENT_REPORT_REQUEST) => {
				self.on_event_report(association, source_aet, message)
					.await?;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn on_store_request<A: Association>(
		&self,
		association: &ActiveAssociation<A>,
		source_aet: &str,
		message: DicomMessage,
		progress: Option<&Progress>,
	) -> Result<(), DispatchError> {
		let presentation_context_id = context_of(&message)?;
		let message_id = message.message_id();
		let sop_class_uid = message.affected_sop_class_uid().unwrap_or_default();
		let sop_instance_uid = message.affected_sop_instance_uid().unwrap_or_default();

		let (response, bytes) = match InboundObject::from_request(message, source_aet) {
			Ok(object) => {
				trace!(
					sop_instance_uid = object.sop_instance_uid,
					sop_class_uid = object.sop_class_uid,
					"Received C-STORE-RQ"
				);
				let bytes = object.data.len() as u64;
				let mut response = object.response(status::SUCCESS);
				response.status = match &self.store_handler {
					Some(handler) => handler.store(object).await,
					None => {
						warn!(sop_class_uid, "No store handler for C-STORE-RQ");
						status::UNABLE_TO_PROCESS
					}
				};
				(response, bytes)
			}
			Err(err) => {
				warn!(sop_instance_uid, "Rejected C-STORE-RQ: {err}");
				let response = CompositeStoreResponse {
					message_id: message_id.unwrap_or_default(),
					sop_class_uid,
					sop_instance_uid,
					status: status::UNABLE_TO_PROCESS,
				};
				(response, 0)
			}
		};

		if let Some(progress) = progress {
			let bytes = match StatusType::classify(response.status) {
				StatusType::Success | StatusType::Warning => bytes,
				_ => 0,
			};
			progress.on_sub_operation(
				Some(response.sop_instance_uid.as_str()),
				response.status,
				bytes,
			);
		}

		association
			.write_message(response, presentation_context_id, self.timeout)
			.await?;
		Ok(())
	}

	async fn on_event_report<A: Association>(
		&self,
		association: &ActiveAssociation<A>,
		source_aet: &str,
		message: DicomMessage,
	) -> Result<Option<EventReport>, DispatchError> {
		let presentation_context_id = context_of(&message)?;
		let report = EventReport::from_request(message, source_aet)?;
		info!(
			source_aet,
			sop_class_uid = report.sop_class_uid,
			event_type_id = report.event_type_id,
			"Received N-EVENT-REPORT-RQ"
		);

		let status = match &self.event_handler {
			Some(handler) => handler.on_event(report.clone()).await,
			None => status::SUCCESS,
		};
		association
			.write_message(report.response(status), presentation_context_id, self.timeout)
			.await?;
		Ok(Some(report))
	}

	fn registry(&self) -> MutexGuard<'_, Registry> {
		self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

fn context_of(message: &DicomMessage) -> Result<u8, DispatchError> {
	message
		.presentation_context_id
		.ok_or_else(|| ReadError::from(NegotiationError::NoPresentationContext).into())
}

/// The task that owns one request/response exchange.
struct Exchange {
	dispatcher: Dispatcher,
	message_id: US,
	presentation_context_id: u8,
	cancel: CancelHandle,
	progress: Option<Progress>,
	events: mpsc::Sender<Result<DimseEvent, DispatchError>>,
}

impl Exchange {
	async fn run<A: Association>(self, lease: AssociationLease<A>, operation: DimseOperation) {
		if let Err(err) = self.exchange(&lease, operation).await {
			warn!("DIMSE operation failed: {err}");
			let _ = self.events.send(Err(err)).await;
		}
		self.dispatcher
			.registry()
			.remove(&(*lease.uuid(), self.message_id));
	}

	async fn exchange<A: Association>(
		&self,
		lease: &AssociationLease<A>,
		operation: DimseOperation,
	) -> Result<(), DispatchError> {
		let _operations = lease.lock_operations().await;
		let kind = operation.kind();
		let response_field = operation.response_command_field();
		let cancellable = operation.is_cancellable();
		let cancel_after = operation.cancel_after();
		let timeout = self.dispatcher.timeout;

		lease
			.write_message(operation.into_message(), self.presentation_context_id, timeout)
			.await?;
		debug!("Sent {kind}-RQ");

		let mut cancel_sent = false;
		let mut delivered = 0;
		loop {
			if cancellable && !cancel_sent && self.cancel_requested() {
				let request = CompositeCancelRequest {
					message_id_being_responded_to: self.message_id,
				};
				lease
					.write_message(request, self.presentation_context_id, timeout)
					.await?;
				info!(delivered, "Sent C-CANCEL-RQ");
				cancel_sent = true;
			}

			let message = lease.read_message(timeout).await?;
			match message.command_field() {
				Some(field) if field == response_field => {
					let response = DimseResponse::try_from(message)?;
					if response.message_id_being_responded_to != self.message_id {
						warn!(
							message_id_being_responded_to = response.message_id_being_responded_to,
							"Ignored response to another request"
						);
						continue;
					}

					if response.status_type() != StatusType::Pending {
						debug!(status = response.status, "Received final {kind}-RSP");
						let _ = self.events.send(Ok(DimseEvent::Final(response))).await;
						return Ok(());
					}

					if cancel_sent {
						trace!("Discarded pending {kind}-RSP after cancellation");
						continue;
					}
					delivered += 1;
					if self
						.events
						.send(Ok(DimseEvent::Pending(response)))
						.await
						.is_err()
					{
						debug!("Receiver of {kind} responses is gone");
					}
					if cancel_after.is_some_and(|limit| delivered >= limit) {
						self.cancel.cancel();
					}
				}
				_ => {
					let source_aet = lease.called_aet();
					if !self
						.dispatcher
						.respond(lease, source_aet, message, self.progress.as_ref())
						.await?
					{
						warn!("Ignored unexpected DIMSE message during {kind}");
					}
				}
			}
		}
	}

	fn cancel_requested(&self) -> bool {
		self.cancel.is_cancelled()
			|| self.events.is_closed()
			|| self
				.progress
				.as_ref()
				.is_some_and(Progress::cancel_requested)
	}
}

/// Receives the responses of one operation.
pub struct OperationHandle {
	message_id: US,
	events: mpsc::Receiver<Result<DimseEvent, DispatchError>>,
	cancel: CancelHandle,
}

impl OperationHandle {
	pub const fn message_id(&self) -> US {
		self.message_id
	}

	/// The next response. Pending responses arrive in the order the peer sent them, the final
	/// response is the last event.
	pub async fn next(&mut self) -> Option<Result<DimseEvent, DispatchError>> {
		self.events.recv().await
	}

	/// Requests cancellation. See [`Dispatcher::cancel`].
	pub fn cancel(&self) -> bool {
		self.cancel.cancel()
	}

	/// Skips pending responses and returns the final one.
	pub async fn final_response(mut self) -> Result<DimseResponse, DispatchError> {
		while let Some(event) = self.next().await {
			if let DimseEvent::Final(response) = event? {
				return Ok(response);
			}
		}
		Err(DispatchError::Interrupted)
	}

	/// Feeds the responses into the progress until the final response arrived.
	pub async fn track(mut self, progress: &Progress) -> Option<DimseResponse> {
		while let Some(event) = self.next().await {
			match event {
				Ok(DimseEvent::Pending(response)) => {
					if let Some(counters) = response.counters {
						progress.on_counters(counters);
					}
				}
				Ok(DimseEvent::Final(response)) => {
					if let Some(counters) = response.counters {
						progress.on_counters(counters);
					}
					progress.on_final(response.status, response.error_comment.clone());
					return Some(response);
				}
				Err(err) => {
					progress.on_error(err.to_string());
					return None;
				}
			}
		}
		progress.on_error(DispatchError::Interrupted.to_string());
		None
	}
}
