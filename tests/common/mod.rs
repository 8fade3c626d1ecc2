//! In-memory transport and scripted peers for the integration tests.
//!
//! [`FakeConnector`] negotiates like a permissive SCP and hands out [`FakeAssociation`]s. Every
//! message the engine sends is reassembled with the real codec and passed to a [`Peer`], whose
//! replies are encoded again and delivered through `receive`. Everything that happens on the
//! wire is recorded in a [`Log`].
#![allow(dead_code)]

use bytes::Bytes;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use dicom::ul::Pdu;
use dicom_relay::association::negotiation::select_context;
use dicom_relay::association::{
	Association, AssociationError, AssociationOptions, AssociationRequest, ChannelError, Connector,
	NegotiatedContext, NegotiationError, PresentationContexts,
};
use dicom_relay::dimse::ccancel::COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST;
use dicom_relay::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use dicom_relay::dimse::cfind::{COMMAND_FIELD_COMPOSITE_FIND_REQUEST, COMMAND_FIELD_COMPOSITE_FIND_RESPONSE};
use dicom_relay::dimse::cget::{COMMAND_FIELD_COMPOSITE_GET_REQUEST, COMMAND_FIELD_COMPOSITE_GET_RESPONSE};
use dicom_relay::dimse::cstore::{
	CompositeStoreRequest, CompositeStoreResponse, InboundObject, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
	COMMAND_FIELD_COMPOSITE_STORE_RESPONSE,
};
use dicom_relay::dimse::ncommand::commitment::{
	CommitmentResult, FailedReference, InstanceReference, STORAGE_COMMITMENT_PUSH_MODEL,
	STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
};
use dicom_relay::dimse::ncommand::{
	EventReportRequest, COMMAND_FIELD_ACTION_REQUEST, COMMAND_FIELD_ACTION_RESPONSE,
	COMMAND_FIELD_EVENT_REPORT_RESPONSE,
};
use dicom_relay::dimse::{
	encode_message, status, DataSet, DicomMessage, MessageAssembler, RemoteEntity, StatusType,
	DATA_SET_EXISTS, DATA_SET_MISSING,
};
use dicom_relay::node::Node;
use dicom_relay::types::{UI, US};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const CT: &str = uids::CT_IMAGE_STORAGE;
pub const MR: &str = uids::MR_IMAGE_STORAGE;
pub const EXPLICIT: &str = uids::EXPLICIT_VR_LITTLE_ENDIAN;
pub const IMPLICIT: &str = uids::IMPLICIT_VR_LITTLE_ENDIAN;
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

/// A message sent by the peer, optionally held back for a while.
pub struct Reply {
	pub message: DicomMessage,
	pub delay: Duration,
}

impl Reply {
	pub fn delayed(message: impl Into<DicomMessage>, delay: Duration) -> Self {
		Self {
			message: message.into(),
			delay,
		}
	}
}

impl From<DicomMessage> for Reply {
	fn from(message: DicomMessage) -> Self {
		Self {
			message,
			delay: Duration::ZERO,
		}
	}
}

/// Scripted behavior of the remote application entity.
pub trait Peer: Send {
	/// Called for every complete message the engine sent.
	fn on_message(&mut self, message: &DicomMessage) -> Vec<Reply>;

	/// Called whenever the engine waits for a message and nothing is queued.
	fn poll(&mut self) -> Option<Reply> {
		None
	}

	/// Called when nothing is queued and `poll` had nothing to send.
	/// Returning true makes the peer send an A-RELEASE-RQ.
	fn release(&mut self) -> bool {
		false
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	Connect(usize),
	Received {
		association: usize,
		command_field: US,
		sop_instance_uid: Option<UI>,
	},
	Delivered {
		association: usize,
		command_field: US,
		sop_instance_uid: Option<UI>,
	},
	Release(usize),
	Abort(usize),
}

/// An instance received through C-STORE.
#[derive(Debug, Clone)]
pub struct Stored {
	pub association: usize,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub transfer_syntax: UI,
	pub bytes: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct Log {
	pub connects: usize,
	pub proposals: Vec<PresentationContexts>,
	pub events: Vec<Event>,
	pub stored: Vec<Stored>,
}

impl Log {
	/// Number of messages with the command field the peer received.
	pub fn received(&self, command_field: US) -> usize {
		self.events
			.iter()
			.filter(|event| matches!(event, Event::Received { command_field: field, .. } if *field == command_field))
			.count()
	}

	pub fn releases(&self) -> usize {
		self.events
			.iter()
			.filter(|event| matches!(event, Event::Release(_)))
			.count()
	}

	pub fn aborts(&self) -> usize {
		self.events
			.iter()
			.filter(|event| matches!(event, Event::Abort(_)))
			.count()
	}

	pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
		self.events.iter().position(predicate)
	}
}

type PeerFactory = Box<dyn Fn() -> Box<dyn Peer> + Send + Sync>;

struct Shared {
	peer: PeerFactory,
	transfer_syntaxes: Option<Vec<UI>>,
	rejected: Vec<UI>,
	refuse: bool,
	log: Mutex<Log>,
}

impl Shared {
	fn log(&self) -> MutexGuard<'_, Log> {
		self.log.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn record(&self, event: Event) {
		self.log().events.push(event);
	}

	fn negotiate(&self, contexts: &PresentationContexts) -> Vec<NegotiatedContext> {
		contexts
			.iter()
			.filter(|pc| !self.rejected.contains(&pc.abstract_syntax))
			.filter_map(|pc| {
				let transfer_syntax = match &self.transfer_syntaxes {
					Some(accepted) => pc.transfer_syntaxes.iter().find(|ts| accepted.contains(ts)),
					None => pc.transfer_syntaxes.first(),
				}?;
				Some(NegotiatedContext {
					id: pc.id,
					abstract_syntax: pc.abstract_syntax.clone(),
					transfer_syntax: transfer_syntax.clone(),
				})
			})
			.collect()
	}
}

/// Opens in-memory associations with a scripted peer.
#[derive(Clone)]
pub struct FakeConnector {
	shared: Arc<Shared>,
}

impl FakeConnector {
	/// Every association talks to a fresh clone of the peer.
	pub fn new<P: Peer + Clone + Sync + 'static>(peer: P) -> Self {
		Self {
			shared: Arc::new(Shared {
				peer: Box::new(move || Box::new(peer.clone())),
				transfer_syntaxes: None,
				rejected: Vec::new(),
				refuse: false,
				log: Mutex::new(Log::default()),
			}),
		}
	}

	/// Only accept these transfer syntaxes. By default the first proposed one is accepted.
	pub fn accepting(mut self, transfer_syntaxes: &[&str]) -> Self {
		self.configure().transfer_syntaxes =
			Some(transfer_syntaxes.iter().map(|&ts| UI::from(ts)).collect());
		self
	}

	pub fn rejecting(mut self, abstract_syntax: &str) -> Self {
		self.configure().rejected.push(UI::from(abstract_syntax));
		self
	}

	/// Refuse every association request.
	pub fn refusing(mut self) -> Self {
		self.configure().refuse = true;
		self
	}

	fn configure(&mut self) -> &mut Shared {
		Arc::get_mut(&mut self.shared).expect("connector is configured before it is cloned")
	}

	pub fn log(&self) -> Log {
		self.shared.log().clone()
	}
}

impl FakeConnector {
	/// An association the peer opened, as the acceptor sees it after negotiating `contexts`.
	pub fn incoming(&self, contexts: &PresentationContexts) -> Result<FakeAssociation, AssociationError> {
		self.establish(contexts)
	}

	fn establish(&self, proposal: &PresentationContexts) -> Result<FakeAssociation, AssociationError> {
		let contexts = self.shared.negotiate(proposal);
		if contexts.is_empty() {
			return Err(NegotiationError::NoPresentationContext.into());
		}

		let id = {
			let mut log = self.shared.log();
			log.connects += 1;
			log.proposals.push(proposal.clone());
			let id = log.connects;
			log.events.push(Event::Connect(id));
			id
		};

		Ok(FakeAssociation {
			id,
			contexts,
			conversation: Mutex::new(Conversation {
				peer: (self.shared.peer)(),
				assembler: MessageAssembler::default(),
				outbox: VecDeque::new(),
				last_ready: Instant::now(),
				request_context: None,
				closed: false,
			}),
			notify: Notify::new(),
			shared: Arc::clone(&self.shared),
		})
	}
}

impl Connector for FakeConnector {
	type Association = FakeAssociation;

	async fn connect(&self, request: AssociationRequest) -> Result<FakeAssociation, AssociationError> {
		if self.shared.refuse {
			return Err(AssociationError::Connect {
				node: request.node.to_string(),
				source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
			});
		}
		self.establish(&request.contexts)
	}
}

struct Outgoing {
	ready: Instant,
	pdu: Pdu,
	/// Set on the last PDU of a message.
	delivered: Option<(US, Option<UI>)>,
}

struct Conversation {
	peer: Box<dyn Peer>,
	assembler: MessageAssembler,
	outbox: VecDeque<Outgoing>,
	last_ready: Instant,
	/// Context of the last request the engine sent, used for replies without a SOP class.
	request_context: Option<u8>,
	closed: bool,
}

impl Conversation {
	fn enqueue(&mut self, reply: Reply, contexts: &[NegotiatedContext]) {
		let message = reply.message;
		let presentation_context_id = message
			.presentation_context_id
			.or_else(|| {
				message
					.affected_sop_class_uid()
					.and_then(|uid| select_context(contexts, &uid, None))
					.map(|pc| pc.id)
			})
			.or(self.request_context)
			.expect("a presentation context for the reply");
		let transfer_syntax = contexts
			.iter()
			.find(|pc| pc.id == presentation_context_id)
			.map(|pc| pc.transfer_syntax.clone())
			.expect("an accepted presentation context");

		let command_field = message.command_field().unwrap_or_default();
		let sop_instance_uid = message.affected_sop_instance_uid();
		let pdus = encode_message(message, presentation_context_id, &transfer_syntax)
			.expect("replies are encodable");

		let ready = self.last_ready.max(Instant::now() + reply.delay);
		self.last_ready = ready;
		let count = pdus.len();
		for (index, pdu) in pdus.into_iter().enumerate() {
			self.outbox.push_back(Outgoing {
				ready,
				pdu,
				delivered: (index + 1 == count).then(|| (command_field, sop_instance_uid.clone())),
			});
		}
	}
}

enum Next {
	Ready(Pdu),
	Wait(Option<Instant>),
}

pub struct FakeAssociation {
	id: usize,
	contexts: Vec<NegotiatedContext>,
	conversation: Mutex<Conversation>,
	notify: Notify,
	shared: Arc<Shared>,
}

impl FakeAssociation {
	pub const fn id(&self) -> usize {
		self.id
	}

	fn conversation(&self) -> MutexGuard<'_, Conversation> {
		self.conversation.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn accept(&self, pdu: Pdu) -> Result<(), AssociationError> {
		let mut conversation = self.conversation();
		if conversation.closed {
			return Err(ChannelError::Closed.into());
		}
		let Pdu::PData { data } = pdu else {
			return Ok(());
		};
		for pdv in data {
			conversation
				.assembler
				.push(pdv, &self.contexts)
				.expect("well-formed P-DATA");
		}

		while let Some(message) = conversation.assembler.pop() {
			let command_field = message.command_field().unwrap_or_default();
			let sop_instance_uid = message.affected_sop_instance_uid();
			{
				let mut log = self.shared.log();
				if command_field == COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
					if let Some(DataSet::Encoded {
						bytes,
						transfer_syntax,
					}) = &message.data
					{
						log.stored.push(Stored {
							association: self.id,
							sop_class_uid: message.affected_sop_class_uid().unwrap_or_default(),
							sop_instance_uid: sop_instance_uid.clone().unwrap_or_default(),
							transfer_syntax: transfer_syntax.clone(),
							bytes: bytes.clone(),
						});
					}
				}
				log.events.push(Event::Received {
					association: self.id,
					command_field,
					sop_instance_uid,
				});
			}

			if command_field & 0x8000 == 0 {
				conversation.request_context = message.presentation_context_id;
			}
			let replies = conversation.peer.on_message(&message);
			for reply in replies {
				conversation.enqueue(reply, &self.contexts);
			}
		}
		self.notify.notify_one();
		Ok(())
	}

	fn next(&self) -> Result<Next, AssociationError> {
		let mut conversation = self.conversation();
		if conversation.closed {
			return Err(ChannelError::Closed.into());
		}
		if conversation.outbox.is_empty() {
			if let Some(reply) = conversation.peer.poll() {
				conversation.enqueue(reply, &self.contexts);
			} else if conversation.peer.release() {
				conversation.outbox.push_back(Outgoing {
					ready: Instant::now(),
					pdu: Pdu::ReleaseRQ,
					delivered: None,
				});
			}
		}

		let ready = conversation.outbox.front().map(|outgoing| outgoing.ready);
		match ready {
			Some(ready) if ready <= Instant::now() => {
				let outgoing = conversation
					.outbox
					.pop_front()
					.expect("the front element exists");
				if let Some((command_field, sop_instance_uid)) = outgoing.delivered {
					self.shared.record(Event::Delivered {
						association: self.id,
						command_field,
						sop_instance_uid,
					});
				}
				Ok(Next::Ready(outgoing.pdu))
			}
			ready => Ok(Next::Wait(ready)),
		}
	}

	fn close(&self, event: Event) -> Result<(), AssociationError> {
		let mut conversation = self.conversation();
		if conversation.closed {
			return Err(ChannelError::Closed.into());
		}
		conversation.closed = true;
		conversation.outbox.clear();
		self.shared.record(event);
		self.notify.notify_one();
		Ok(())
	}
}

impl Association for FakeAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		let deadline = Instant::now() + timeout;
		loop {
			let notified = self.notify.notified();
			match self.next()? {
				Next::Ready(pdu) => return Ok(pdu),
				Next::Wait(ready) => {
					if Instant::now() >= deadline {
						return Err(ChannelError::Timeout.into());
					}
					let wake = ready.map_or(deadline, |ready| ready.min(deadline));
					tokio::select! {
						() = tokio::time::sleep_until(wake) => {}
						() = notified => {}
					}
				}
			}
		}
	}

	async fn send(&self, pdu: Pdu, _timeout: Duration) -> Result<(), AssociationError> {
		self.accept(pdu)
	}

	async fn release(&self, _timeout: Duration) -> Result<(), AssociationError> {
		self.close(Event::Release(self.id))
	}

	fn abort(&self) {
		// Aborting twice is harmless.
		let _ = self.close(Event::Abort(self.id));
	}

	fn presentation_contexts(&self) -> &[NegotiatedContext] {
		&self.contexts
	}

	fn acceptor_max_pdu_length(&self) -> u32 {
		16_384
	}
}

pub fn node() -> Node {
	Node::new("PEER", "127.0.0.1", 11112)
}

pub fn association_options() -> AssociationOptions {
	let mut options = AssociationOptions::new("RELAY");
	options.connect_timeout = Duration::from_secs(2);
	options.release_timeout = Duration::from_secs(2);
	options
}

pub fn remote(connector: FakeConnector) -> RemoteEntity<FakeConnector> {
	RemoteEntity::new(connector, node(), association_options(), Duration::from_secs(2))
}

pub fn instance(sop_class_uid: &str, sop_instance_uid: &str) -> InMemDicomObject {
	InMemDicomObject::from_element_iter([
		DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(sop_class_uid)),
		DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
		DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^Jane")),
		DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("4711")),
	])
}

/// An instance as it arrives from a C-STORE-RQ, encoded with Explicit VR Little Endian.
pub fn inbound(sop_class_uid: &str, sop_instance_uid: &str) -> InboundObject {
	let data = DataSet::Object(instance(sop_class_uid, sop_instance_uid))
		.encode(EXPLICIT)
		.expect("encodable instance");
	InboundObject {
		message_id: 1,
		sop_class_uid: UI::from(sop_class_uid),
		sop_instance_uid: UI::from(sop_instance_uid),
		transfer_syntax: UI::from(EXPLICIT),
		data,
		source_aet: String::from("SOURCE"),
		move_originator_aet: None,
		move_originator_message_id: None,
	}
}

/// An instance that the sender announced in `transfer_syntax`. The data is left as encoded by
/// [`inbound`], which is enough for instances that are passed through.
pub fn labelled(sop_class_uid: &str, sop_instance_uid: &str, transfer_syntax: &str) -> InboundObject {
	InboundObject {
		transfer_syntax: UI::from(transfer_syntax),
		..inbound(sop_class_uid, sop_instance_uid)
	}
}

/// A response command with optional extra elements and data set.
pub fn response(
	command_field: US,
	message_id_being_responded_to: US,
	status: US,
	extra: Vec<InMemElement>,
	data: Option<InMemDicomObject>,
) -> DicomMessage {
	let data_set_type = if data.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
	let mut elements = vec![
		DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
		DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id_being_responded_to])),
		DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
		DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
	];
	elements.extend(extra);
	DicomMessage {
		command: InMemDicomObject::command_from_element_iter(elements),
		data: data.map(DataSet::from),
		presentation_context_id: None,
	}
}

fn counters(remaining: US, completed: US, failed: US, warning: US) -> Vec<InMemElement> {
	vec![
		DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, dicom_value!(U16, [remaining])),
		DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, dicom_value!(U16, [completed])),
		DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [failed])),
		DataElement::new(tags::NUMBER_OF_WARNING_SUBOPERATIONS, VR::US, dicom_value!(U16, [warning])),
	]
}

/// Answers C-ECHO and C-STORE requests.
#[derive(Clone, Default)]
pub struct StorePeer {
	statuses: HashMap<UI, US>,
	delays: HashMap<UI, Duration>,
}

impl StorePeer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_status(mut self, sop_instance_uid: &str, status: US) -> Self {
		self.statuses.insert(UI::from(sop_instance_uid), status);
		self
	}

	pub fn with_delay(mut self, sop_instance_uid: &str, delay: Duration) -> Self {
		self.delays.insert(UI::from(sop_instance_uid), delay);
		self
	}
}

impl Peer for StorePeer {
	fn on_message(&mut self, message: &DicomMessage) -> Vec<Reply> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
				let response = CompositeEchoResponse {
					message_id_being_responded_to: message.message_id().unwrap_or_default(),
					status: status::SUCCESS,
				};
				vec![Reply::from(DicomMessage::from(response))]
			}
			Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
				let sop_instance_uid = message.affected_sop_instance_uid().unwrap_or_default();
				let response = CompositeStoreResponse {
					message_id: message.message_id().unwrap_or_default(),
					sop_class_uid: message.affected_sop_class_uid().unwrap_or_default(),
					status: self
						.statuses
						.get(&sop_instance_uid)
						.copied()
						.unwrap_or(status::SUCCESS),
					sop_instance_uid: sop_instance_uid.clone(),
				};
				let delay = self.delays.get(&sop_instance_uid).copied().unwrap_or_default();
				vec![Reply::delayed(response, delay)]
			}
			_ => Vec::new(),
		}
	}
}

/// Answers C-FIND requests with a number of matches, produced one at a time.
/// After a C-CANCEL it still sends a few pending responses before the final one.
#[derive(Clone)]
pub struct FindPeer {
	matches: usize,
	after_cancel: usize,
	message_id: Option<US>,
	sent: usize,
	cancel_remaining: Option<usize>,
}

impl FindPeer {
	pub const fn new(matches: usize) -> Self {
		Self {
			matches,
			after_cancel: 2,
			message_id: None,
			sent: 0,
			cancel_remaining: None,
		}
	}

	fn pending(&mut self, message_id: US) -> Reply {
		self.sent += 1;
		let identifier = InMemDicomObject::from_element_iter([
			DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, PrimitiveValue::from("PATIENT")),
			DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(format!("P{}", self.sent))),
		]);
		Reply::from(response(
			COMMAND_FIELD_COMPOSITE_FIND_RESPONSE,
			message_id,
			status::PENDING,
			Vec::new(),
			Some(identifier),
		))
	}

	fn finish(&mut self, message_id: US, status: US) -> Reply {
		self.message_id = None;
		Reply::from(response(
			COMMAND_FIELD_COMPOSITE_FIND_RESPONSE,
			message_id,
			status,
			Vec::new(),
			None,
		))
	}
}

impl Peer for FindPeer {
	fn on_message(&mut self, message: &DicomMessage) -> Vec<Reply> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_FIND_REQUEST) => {
				self.message_id = message.message_id();
				self.sent = 0;
				self.cancel_remaining = None;
			}
			Some(COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST) => {
				if self.message_id.is_some() && self.cancel_remaining.is_none() {
					self.cancel_remaining = Some(self.after_cancel);
				}
			}
			_ => {}
		}
		Vec::new()
	}

	fn poll(&mut self) -> Option<Reply> {
		let message_id = self.message_id?;
		let reply = match self.cancel_remaining {
			Some(0) => self.finish(message_id, status::CANCEL),
			Some(remaining) => {
				self.cancel_remaining = Some(remaining - 1);
				self.pending(message_id)
			}
			None if self.sent < self.matches => self.pending(message_id),
			None => self.finish(message_id, status::SUCCESS),
		};
		Some(reply)
	}
}

/// Answers C-GET requests by sending the instances as C-STORE sub-operations, one at a time,
/// with a pending C-GET-RSP after every sub-operation.
#[derive(Clone)]
pub struct GetPeer {
	instances: Vec<(UI, UI)>,
	message_id: US,
	next: usize,
	completed: US,
	failed: US,
	warning: US,
}

impl GetPeer {
	pub fn new(instances: &[(&str, &str)]) -> Self {
		Self {
			instances: instances
				.iter()
				.map(|&(sop_class_uid, sop_instance_uid)| (UI::from(sop_class_uid), UI::from(sop_instance_uid)))
				.collect(),
			message_id: 0,
			next: 0,
			completed: 0,
			failed: 0,
			warning: 0,
		}
	}

	#[allow(clippy::cast_possible_truncation)]
	fn step(&mut self) -> Reply {
		if let Some((sop_class_uid, sop_instance_uid)) = self.instances.get(self.next).cloned() {
			self.next += 1;
			let request = CompositeStoreRequest {
				data_set: DataSet::Object(instance(&sop_class_uid, &sop_instance_uid)),
				affected_sop_class_uid: sop_class_uid,
				affected_sop_instance_uid: sop_instance_uid,
				move_originator_aet: None,
				move_originator_message_id: None,
				message_id: 100 + self.next as US,
				priority: 0,
			};
			return Reply::from(DicomMessage::from(request));
		}

		let status = if self.failed + self.warning == 0 {
			status::SUCCESS
		} else {
			status::SUB_OPERATIONS_WARNING
		};
		Reply::from(response(
			COMMAND_FIELD_COMPOSITE_GET_RESPONSE,
			self.message_id,
			status,
			counters(0, self.completed, self.failed, self.warning),
			None,
		))
	}
}

impl Peer for GetPeer {
	#[allow(clippy::cast_possible_truncation)]
	fn on_message(&mut self, message: &DicomMessage) -> Vec<Reply> {
		match message.command_field() {
			Some(COMMAND_FIELD_COMPOSITE_GET_REQUEST) => {
				self.message_id = message.message_id().unwrap_or_default();
				vec![self.step()]
			}
			Some(COMMAND_FIELD_COMPOSITE_STORE_RESPONSE) => {
				match StatusType::classify(message.status().unwrap_or(status::PROCESSING_FAILURE)) {
					StatusType::Success => self.completed += 1,
					StatusType::Warning => self.warning += 1,
					_ => self.failed += 1,
				}
				let remaining = (self.instances.len() - self.next) as US;
				let pending = Reply::from(response(
					COMMAND_FIELD_COMPOSITE_GET_RESPONSE,
					self.message_id,
					status::PENDING,
					counters(remaining, self.completed, self.failed, self.warning),
					None,
				));
				vec![pending, self.step()]
			}
			_ => Vec::new(),
		}
	}
}

/// Accepts storage commitment requests and reports the result on the same association.
#[derive(Clone)]
pub struct CommitmentPeer {
	delay: Duration,
	failed: Vec<UI>,
	report: bool,
	report_first: bool,
}

impl CommitmentPeer {
	pub const fn new(delay: Duration) -> Self {
		Self {
			delay,
			failed: Vec::new(),
			report: true,
			report_first: false,
		}
	}

	pub fn failing(mut self, sop_instance_uid: &str) -> Self {
		self.failed.push(UI::from(sop_instance_uid));
		self
	}

	/// Sends the N-EVENT-REPORT before the N-ACTION-RSP.
	pub fn reporting_first(mut self) -> Self {
		self.report_first = true;
		self
	}

	/// Only answers the N-ACTION, the result is reported on another association.
	pub fn without_report(mut self) -> Self {
		self.report = false;
		self
	}
}

/// The N-EVENT-REPORT-RQ that carries a storage commitment result.
pub fn commitment_report(result: &CommitmentResult) -> EventReportRequest {
	EventReportRequest {
		message_id: 1,
		affected_sop_class_uid: UI::from(STORAGE_COMMITMENT_PUSH_MODEL),
		affected_sop_instance_uid: UI::from(STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE),
		event_type_id: result.event_type_id(),
		event_information: Some(result.to_event_information()),
	}
}

fn read_str(object: &InMemDicomObject, tag: dicom::core::Tag) -> UI {
	object
		.element(tag)
		.ok()
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.unwrap_or_default()
}

impl Peer for CommitmentPeer {
	fn on_message(&mut self, message: &DicomMessage) -> Vec<Reply> {
		if message.command_field() != Some(COMMAND_FIELD_ACTION_REQUEST) {
			return Vec::new();
		}
		let information = message
			.data
			.as_ref()
			.expect("action information")
			.decode()
			.expect("decodable action information");

		let mut result = CommitmentResult {
			transaction_uid: read_str(&information, tags::TRANSACTION_UID),
			committed: Vec::new(),
			failed: Vec::new(),
		};
		let items = information
			.get(tags::REFERENCED_SOP_SEQUENCE)
			.and_then(InMemElement::items)
			.unwrap_or_default();
		for item in items {
			let reference = InstanceReference {
				sop_class_uid: read_str(item, tags::REFERENCED_SOP_CLASS_UID),
				sop_instance_uid: read_str(item, tags::REFERENCED_SOP_INSTANCE_UID),
			};
			if self.failed.contains(&reference.sop_instance_uid) {
				result.failed.push(FailedReference {
					reference,
					failure_reason: Some(0x0112),
				});
			} else {
				result.committed.push(reference);
			}
		}

		let action_response = response(
			COMMAND_FIELD_ACTION_RESPONSE,
			message.message_id().unwrap_or_default(),
			status::SUCCESS,
			Vec::new(),
			None,
		);
		if !self.report {
			return vec![Reply::from(action_response)];
		}
		let event_report = Reply::delayed(commitment_report(&result), self.delay);
		if self.report_first {
			vec![event_report, Reply::from(action_response)]
		} else {
			vec![Reply::from(action_response), event_report]
		}
	}
}

/// Opens an association towards the engine, reports a storage commitment result and releases
/// the association once the N-EVENT-REPORT-RSP arrived.
#[derive(Clone)]
pub struct ReportingPeer {
	result: Option<CommitmentResult>,
	answered: bool,
	released: bool,
}

impl ReportingPeer {
	pub const fn new(result: CommitmentResult) -> Self {
		Self {
			result: Some(result),
			answered: false,
			released: false,
		}
	}
}

impl Peer for ReportingPeer {
	fn on_message(&mut self, message: &DicomMessage) -> Vec<Reply> {
		if message.command_field() == Some(COMMAND_FIELD_EVENT_REPORT_RESPONSE) {
			self.answered = true;
		}
		Vec::new()
	}

	fn poll(&mut self) -> Option<Reply> {
		self.result
			.take()
			.map(|result| Reply::from(DicomMessage::from(commitment_report(&result))))
	}

	fn release(&mut self) -> bool {
		if self.answered && !self.released {
			self.released = true;
			return true;
		}
		false
	}
}
