pub mod directory;
pub mod storescp;
pub mod storescu;

use super::{DataSet, DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use bytes::Bytes;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::fmt::{Debug, Formatter};

pub use directory::DirectoryStore;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// Storage SOP classes proposed for C-GET sub-operations unless configured otherwise.
pub const DEFAULT_STORAGE_SOP_CLASSES: &[&str] = &[
	"1.2.840.10008.5.1.4.1.1.1",     // Computed Radiography Image Storage
	"1.2.840.10008.5.1.4.1.1.1.1",   // Digital X-Ray Image Storage - For Presentation
	"1.2.840.10008.5.1.4.1.1.1.2",   // Digital Mammography X-Ray Image Storage - For Presentation
	uids::CT_IMAGE_STORAGE,
	"1.2.840.10008.5.1.4.1.1.2.1",   // Enhanced CT Image Storage
	uids::MR_IMAGE_STORAGE,
	"1.2.840.10008.5.1.4.1.1.4.1",   // Enhanced MR Image Storage
	"1.2.840.10008.5.1.4.1.1.6.1",   // Ultrasound Image Storage
	"1.2.840.10008.5.1.4.1.1.3.1",   // Ultrasound Multi-frame Image Storage
	uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
	"1.2.840.10008.5.1.4.1.1.12.1",  // X-Ray Angiographic Image Storage
	"1.2.840.10008.5.1.4.1.1.20",    // Nuclear Medicine Image Storage
	"1.2.840.10008.5.1.4.1.1.128",   // Positron Emission Tomography Image Storage
	"1.2.840.10008.5.1.4.1.1.481.1", // RT Image Storage
	"1.2.840.10008.5.1.4.1.1.481.2", // RT Dose Storage
	"1.2.840.10008.5.1.4.1.1.481.3", // RT Structure Set Storage
	"1.2.840.10008.5.1.4.1.1.481.5", // RT Plan Storage
	"1.2.840.10008.5.1.4.1.1.66.4",  // Segmentation Storage
	"1.2.840.10008.5.1.4.1.1.88.11", // Basic Text SR Storage
	"1.2.840.10008.5.1.4.1.1.88.22", // Enhanced SR Storage
	"1.2.840.10008.5.1.4.1.1.88.33", // Comprehensive SR Storage
	"1.2.840.10008.5.1.4.1.1.88.59", // Key Object Selection Document Storage
	"1.2.840.10008.5.1.4.1.1.11.1",  // Grayscale Softcopy Presentation State Storage
	"1.2.840.10008.5.1.4.1.1.104.1", // Encapsulated PDF Storage
];

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: DataSet,
}

impl Debug for CompositeStoreRequest {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CompositeStoreRequest")
			.field("affected_sop_class_uid", &self.affected_sop_class_uid)
			.field("affected_sop_instance_uid", &self.affected_sop_instance_uid)
			.field("message_id", &self.message_id)
			.field("data_set", &self.data_set)
			.finish_non_exhaustive()
	}
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
		]);

		if let Some(move_originator_message_id) = request.move_originator_message_id {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
		}

		if let Some(move_originator_aet) = request.move_originator_aet {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
		}

		Self {
			command,
			data: Some(request.data_set),
			presentation_context_id: None,
		}
	}
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// An instance received through a C-STORE-RQ, still encoded with the transfer syntax of its
/// presentation context.
#[derive(Clone)]
pub struct InboundObject {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub transfer_syntax: UI,
	pub data: Bytes,
	/// The AE title of the peer that sent the instance.
	pub source_aet: AE,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
}

impl Debug for InboundObject {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InboundObject")
			.field("sop_class_uid", &self.sop_class_uid)
			.field("sop_instance_uid", &self.sop_instance_uid)
			.field("transfer_syntax", &self.transfer_syntax)
			.field("bytes", &self.data.len())
			.finish_non_exhaustive()
	}
}

impl InboundObject {
	/// Extracts the instance from a C-STORE-RQ.
	pub fn from_request(message: DicomMessage, source_aet: impl Into<AE>) -> Result<Self, ReadError> {
		let message_id = message
			.message_id()
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?;
		let sop_class_uid = message
			.affected_sop_class_uid()
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let sop_instance_uid = message
			.affected_sop_instance_uid()
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?;
		let move_originator_aet = message.command_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE);
		let move_originator_message_id = message.command_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID);

		let (data, transfer_syntax) = match message.data {
			Some(DataSet::Encoded {
				bytes,
				transfer_syntax,
			}) => (bytes, transfer_syntax),
			Some(DataSet::Object(object)) => {
				let transfer_syntax = UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN);
				let bytes = DataSet::Object(object).encode(&transfer_syntax)?;
				(bytes, transfer_syntax)
			}
			None => return Err(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE)),
		};

		Ok(Self {
			message_id,
			sop_class_uid,
			sop_instance_uid,
			transfer_syntax,
			data,
			source_aet: source_aet.into(),
			move_originator_aet,
			move_originator_message_id,
		})
	}

	pub fn response(&self, status: US) -> CompositeStoreResponse {
		CompositeStoreResponse {
			message_id: self.message_id,
			sop_class_uid: self.sop_class_uid.clone(),
			sop_instance_uid: self.sop_instance_uid.clone(),
			status,
		}
	}
}

/// Receives instances from C-STORE requests, either C-GET sub-operations or requests accepted
/// by the store service class provider. Returns the status for the C-STORE-RSP.
#[async_trait]
pub trait StoreHandler: Send + Sync {
	async fn store(&self, object: InboundObject) -> US;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::association::NegotiationError;
	use crate::dimse::WriteError;
	use dicom::core::PrimitiveValue;

	fn object() -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
			DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.1")),
			DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("4711")),
		])
	}

	fn request(data_set: DataSet) -> DicomMessage {
		DicomMessage::from(CompositeStoreRequest {
			affected_sop_class_uid: UI::from(uids::CT_IMAGE_STORAGE),
			affected_sop_instance_uid: UI::from("1.2.3.1"),
			move_originator_aet: None,
			move_originator_message_id: None,
			message_id: 7,
			priority: 0,
			data_set,
		})
	}

	#[test]
	fn decoded_data_set_is_encoded_as_explicit_vr() {
		let inbound = InboundObject::from_request(request(DataSet::Object(object())), "SOURCE").unwrap();
		assert_eq!(inbound.message_id, 7);
		assert_eq!(inbound.transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
		assert_eq!(inbound.source_aet, "SOURCE");
		assert!(!inbound.data.is_empty());
	}

	#[test]
	fn encode_failure_keeps_its_cause() {
		let err = DataSet::Object(object())
			.encode("1.2.3.4.5.6")
			.map_err(ReadError::from)
			.unwrap_err();
		assert!(matches!(
			err,
			ReadError::Encode(WriteError::Negotiation(NegotiationError::UnknownTransferSyntax(ref uid))) if uid == "1.2.3.4.5.6"
		));
		assert!(err.to_string().contains("1.2.3.4.5.6"));
	}
}
