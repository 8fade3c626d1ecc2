//! DIMSE messages and services.
//! - C-ECHO, C-FIND, C-GET, C-MOVE and C-STORE service class users
//! - A store service class provider that also accepts verification and event reports
//! - Storage commitment and modality performed procedure step service class users
//!
//! All request/response exchanges go through the [`Dispatcher`].

pub mod ccancel;
pub mod cecho;
pub mod cfind;
pub mod cget;
pub mod cmove;
pub mod cstore;
pub mod dispatcher;
pub mod ncommand;
mod remote;

use crate::association::{AssociationError, NegotiatedContext, NegotiationError};
use crate::types::{trim_uid, UI, US};
use bytes::Bytes;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::{TransferSyntax, TransferSyntaxRegistry};
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use thiserror::Error;
use tracing::trace;

pub use dispatcher::{DimseEvent, DimseOperation, DimseResponse, Dispatcher, OperationHandle};
pub use remote::RemoteEntity;

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// This is the recommended value when creating new [`InMemDicomObject`]s for compatibility reasons.
/// For reading DICOM messages, prefer checking if (command_data_set_type != DATA_SET_MISSING) as
/// AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Status codes used by this crate.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
pub mod status {
	use crate::types::US;

	pub const SUCCESS: US = 0x0000;
	pub const PENDING: US = 0xFF00;
	pub const PENDING_WITH_WARNINGS: US = 0xFF01;
	pub const CANCEL: US = 0xFE00;
	/// Sub-operations complete, one or more failures or warnings.
	pub const SUB_OPERATIONS_WARNING: US = 0xB000;
	pub const COERCION_OF_DATA_ELEMENTS: US = 0xB000;
	pub const PROCESSING_FAILURE: US = 0x0110;
	pub const NO_SUCH_SOP_CLASS: US = 0x0118;
	pub const SOP_CLASS_NOT_SUPPORTED: US = 0x0122;
	pub const UNRECOGNIZED_OPERATION: US = 0x0211;
	pub const OUT_OF_RESOURCES: US = 0xA700;
	pub const MOVE_DESTINATION_UNKNOWN: US = 0xA801;
	pub const UNABLE_TO_PROCESS: US = 0xC000;
}

/// The data set of a DICOM message.
/// Received data sets stay encoded until a consumer needs the attributes, so that they can be
/// passed on without re-encoding.
#[derive(Clone)]
pub enum DataSet {
	Object(InMemDicomObject),
	Encoded { bytes: Bytes, transfer_syntax: UI },
}

impl Debug for DataSet {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Object(_) => write!(f, "DataSet::Object"),
			Self::Encoded {
				bytes,
				transfer_syntax,
			} => write!(f, "DataSet::Encoded({} bytes, {transfer_syntax})", bytes.len()),
		}
	}
}

impl DataSet {
	/// Decodes the data set if necessary.
	pub fn decode(&self) -> Result<InMemDicomObject, ReadError> {
		match self {
			Self::Object(object) => Ok(object.clone()),
			Self::Encoded {
				bytes,
				transfer_syntax,
			} => decode_data_set(bytes, transfer_syntax),
		}
	}

	pub fn into_object(self) -> Result<InMemDicomObject, ReadError> {
		match self {
			Self::Object(object) => Ok(object),
			encoded @ Self::Encoded { .. } => encoded.decode(),
		}
	}

	/// Encodes the data set with the transfer syntax.
	/// Encoded data sets are only accepted if they already use that transfer syntax.
	pub fn encode(self, transfer_syntax: &str) -> Result<Bytes, WriteError> {
		match self {
			Self::Object(object) => {
				let ts = lookup_transfer_syntax(transfer_syntax)?;
				let mut buffer = Vec::new();
				object.write_dataset_with_ts(&mut buffer, ts)?;
				Ok(Bytes::from(buffer))
			}
			Self::Encoded {
				bytes,
				transfer_syntax: encoded_with,
			} => {
				if trim_uid(&encoded_with) == trim_uid(transfer_syntax) {
					Ok(bytes)
				} else {
					Err(WriteError::TransferSyntaxMismatch {
						expected: UI::from(trim_uid(transfer_syntax)),
						actual: encoded_with,
					})
				}
			}
		}
	}
}

impl From<InMemDicomObject> for DataSet {
	fn from(object: InMemDicomObject) -> Self {
		Self::Object(object)
	}
}

pub fn lookup_transfer_syntax(uid: &str) -> Result<&'static TransferSyntax, NegotiationError> {
	TransferSyntaxRegistry
		.get(trim_uid(uid))
		.ok_or_else(|| NegotiationError::UnknownTransferSyntax(UI::from(trim_uid(uid))))
}

pub fn decode_data_set(bytes: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject, ReadError> {
	let ts = lookup_transfer_syntax(transfer_syntax)?;
	Ok(InMemDicomObject::read_dataset_with_ts(bytes, ts)?)
}

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
#[derive(Clone)]
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<DataSet>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let command_field = self.command_field().unwrap_or_default();
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command: {command_field:#06x}, data }}")
		} else {
			write!(f, "DicomMessage {{ command: {command_field:#06x} }}")
		}
	}
}

impl DicomMessage {
	pub fn command_u16(&self, tag: Tag) -> Option<US> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn command_str(&self, tag: Tag) -> Option<String> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
	}

	pub fn command_field(&self) -> Option<US> {
		self.command_u16(tags::COMMAND_FIELD)
	}

	pub fn message_id(&self) -> Option<US> {
		self.command_u16(tags::MESSAGE_ID)
	}

	pub fn message_id_being_responded_to(&self) -> Option<US> {
		self.command_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
	}

	pub fn status(&self) -> Option<US> {
		self.command_u16(tags::STATUS)
	}

	pub fn affected_sop_class_uid(&self) -> Option<UI> {
		self.command_str(tags::AFFECTED_SOP_CLASS_UID)
	}

	pub fn affected_sop_instance_uid(&self) -> Option<UI> {
		self.command_str(tags::AFFECTED_SOP_INSTANCE_UID)
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl StatusType {
	/// Ordering used when several statuses are combined into one.
	pub const fn severity(self) -> u8 {
		match self {
			Self::Success | Self::Pending => 0,
			Self::Warning => 1,
			Self::Cancel => 2,
			Self::Failure => 3,
		}
	}

	/// Classifies a status code. Codes outside the known ranges are failures.
	pub fn classify(status: US) -> Self {
		Self::try_from(status).unwrap_or(Self::Failure)
	}
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0xC000..=0xCFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute is missing")]
	MissingAttribute(Tag),
	#[error("Failed to encode received data set: {0}")]
	Encode(#[from] WriteError),
	#[error("Peer released the association")]
	Released,
	#[error("Peer aborted the association")]
	Aborted,
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("Data set is encoded with {actual} but the presentation context requires {expected}")]
	TransferSyntaxMismatch { expected: UI, actual: UI },
}

/// Encodes a message into one P-DATA-TF for the command set and one for the data set.
/// Large data sets are split by the association transport according to the peer's maximum
/// PDU length.
pub fn encode_message(
	message: DicomMessage,
	presentation_context_id: u8,
	transfer_syntax: &str,
) -> Result<Vec<Pdu>, WriteError> {
	let mut command_buf = Vec::new();
	message
		.command
		.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

	let mut pdus = vec![Pdu::PData {
		data: vec![PDataValue {
			value_type: PDataValueType::Command,
			presentation_context_id,
			is_last: true,
			data: command_buf,
		}],
	}];

	if let Some(data) = message.data {
		let data_buf = data.encode(transfer_syntax)?;
		pdus.push(Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id,
				is_last: true,
				data: data_buf.to_vec(),
			}],
		});
	}

	Ok(pdus)
}

/// Reassembles DICOM messages from presentation data value fragments.
#[derive(Debug, Default)]
pub struct MessageAssembler {
	command_fragments: Vec<u8>,
	data_fragments: Vec<u8>,
	command: Option<(InMemDicomObject, u8)>,
	ready: VecDeque<DicomMessage>,
}

impl MessageAssembler {
	/// Returns the next complete message.
	pub fn pop(&mut self) -> Option<DicomMessage> {
		self.ready.pop_front()
	}

	/// Adds a fragment. The contexts are needed to record the transfer syntax of data sets.
	pub fn push(
		&mut self,
		mut pdv: PDataValue,
		contexts: &[NegotiatedContext],
	) -> Result<(), ReadError> {
		match pdv.value_type {
			PDataValueType::Command => {
				if self.command.is_some() {
					// Already received the full command set.
					// Receiving another command fragment is not expected.
					return Err(ReadError::OutOfOrder);
				}
				self.command_fragments.append(&mut pdv.data);
				if pdv.is_last {
					let fragments = std::mem::take(&mut self.command_fragments);
					let command = InMemDicomObject::read_dataset_with_ts(
						fragments.as_slice(),
						&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
					)?;
					let has_data_set = command
						.get(tags::COMMAND_DATA_SET_TYPE)
						.map(InMemElement::to_int::<US>)
						.and_then(Result::ok)
						.is_some_and(|value| value != DATA_SET_MISSING);

					if has_data_set {
						self.command = Some((command, pdv.presentation_context_id));
					} else {
						trace!("Assembled message without data set");
						self.ready.push_back(DicomMessage {
							command,
							data: None,
							presentation_context_id: Some(pdv.presentation_context_id),
						});
					}
				}
			}
			PDataValueType::Data => {
				if self.command.is_none() {
					// Cannot handle data fragments before the entire command set is received.
					return Err(ReadError::OutOfOrder);
				}
				self.data_fragments.append(&mut pdv.data);
				if pdv.is_last {
					let context = contexts
						.iter()
						.find(|pc| pc.id == pdv.presentation_context_id)
						.ok_or(NegotiationError::NoPresentationContext)?;
					let bytes = Bytes::from(std::mem::take(&mut self.data_fragments));
					let (command, presentation_context_id) =
						self.command.take().ok_or(ReadError::OutOfOrder)?;
					trace!(bytes = bytes.len(), "Assembled message with data set");
					self.ready.push_back(DicomMessage {
						command,
						data: Some(DataSet::Encoded {
							bytes,
							transfer_syntax: UI::from(trim_uid(&context.transfer_syntax)),
						}),
						presentation_context_id: Some(presentation_context_id),
					});
				}
			}
		}
		Ok(())
	}
}
