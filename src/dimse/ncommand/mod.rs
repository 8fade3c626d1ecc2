//! DIMSE-N messages used by the storage commitment and modality performed procedure step
//! service class users.

pub mod commitment;
pub mod mediator;
pub mod mpps;

use super::{DataSet, DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_EVENT_REPORT_REQUEST: US = 0x0100;
pub const COMMAND_FIELD_EVENT_REPORT_RESPONSE: US = 0x8100;
pub const COMMAND_FIELD_SET_REQUEST: US = 0x0120;
pub const COMMAND_FIELD_SET_RESPONSE: US = 0x8120;
pub const COMMAND_FIELD_ACTION_REQUEST: US = 0x0130;
pub const COMMAND_FIELD_ACTION_RESPONSE: US = 0x8130;
pub const COMMAND_FIELD_CREATE_REQUEST: US = 0x0140;
pub const COMMAND_FIELD_CREATE_RESPONSE: US = 0x8140;

/// N-ACTION-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.4.html>
#[derive(Debug)]
pub struct NormalizedActionRequest {
	pub message_id: US,
	pub requested_sop_class_uid: UI,
	pub requested_sop_instance_uid: UI,
	pub action_type_id: US,
	pub action_information: Option<InMemDicomObject>,
}

impl From<NormalizedActionRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: NormalizedActionRequest) -> Self {
		let data_set_type = if request.action_information.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_ACTION_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::REQUESTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.requested_sop_class_uid)),
			DataElement::new(tags::REQUESTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.requested_sop_instance_uid)),
			DataElement::new(tags::ACTION_TYPE_ID, VR::US, dicom_value!(U16, [request.action_type_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
		]);

		Self {
			command,
			data: request.action_information.map(DataSet::from),
			presentation_context_id: None,
		}
	}
}

/// N-CREATE-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.5.html>
#[derive(Debug)]
pub struct NormalizedCreateRequest {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	/// Left empty to let the peer assign the instance UID.
	pub affected_sop_instance_uid: Option<UI>,
	pub attributes: InMemDicomObject,
}

impl From<NormalizedCreateRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: NormalizedCreateRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_CREATE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);
		if let Some(sop_instance_uid) = request.affected_sop_instance_uid {
			command.put_element(DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)));
		}

		Self {
			command,
			data: Some(request.attributes.into()),
			presentation_context_id: None,
		}
	}
}

/// N-SET-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.3.html>
#[derive(Debug)]
pub struct NormalizedSetRequest {
	pub message_id: US,
	pub requested_sop_class_uid: UI,
	pub requested_sop_instance_uid: UI,
	pub modifications: InMemDicomObject,
}

impl From<NormalizedSetRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: NormalizedSetRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_SET_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::REQUESTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.requested_sop_class_uid)),
			DataElement::new(tags::REQUESTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.requested_sop_instance_uid)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.modifications.into()),
			presentation_context_id: None,
		}
	}
}

/// N-EVENT-REPORT-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.1.html>
#[derive(Debug)]
pub struct EventReportRequest {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub event_type_id: US,
	pub event_information: Option<InMemDicomObject>,
}

impl From<EventReportRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: EventReportRequest) -> Self {
		let data_set_type = if request.event_information.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_EVENT_REPORT_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
			DataElement::new(tags::EVENT_TYPE_ID, VR::US, dicom_value!(U16, [request.event_type_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
		]);

		Self {
			command,
			data: request.event_information.map(DataSet::from),
			presentation_context_id: None,
		}
	}
}

/// N-EVENT-REPORT-RSP
#[derive(Debug)]
pub struct EventReportResponse {
	pub message_id_being_responded_to: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub event_type_id: US,
	pub status: US,
}

impl From<EventReportResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: EventReportResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_EVENT_REPORT_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id_being_responded_to])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.affected_sop_instance_uid)),
			DataElement::new(tags::EVENT_TYPE_ID, VR::US, dicom_value!(U16, [response.event_type_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// An event report received from a peer, on an outbound association or on one accepted by
/// the store service class provider.
#[derive(Debug, Clone)]
pub struct EventReport {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub event_type_id: US,
	pub source_aet: AE,
	pub event_information: Option<InMemDicomObject>,
}

impl EventReport {
	pub fn from_request(message: DicomMessage, source_aet: impl Into<AE>) -> Result<Self, ReadError> {
		let message_id = message
			.message_id()
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?;
		let sop_class_uid = message
			.affected_sop_class_uid()
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let sop_instance_uid = message.affected_sop_instance_uid().unwrap_or_default();
		let event_type_id = message
			.command_u16(tags::EVENT_TYPE_ID)
			.ok_or(ReadError::MissingAttribute(tags::EVENT_TYPE_ID))?;
		let event_information = message.data.map(DataSet::into_object).transpose()?;

		Ok(Self {
			message_id,
			sop_class_uid,
			sop_instance_uid,
			event_type_id,
			source_aet: source_aet.into(),
			event_information,
		})
	}

	pub fn response(&self, status: US) -> EventReportResponse {
		EventReportResponse {
			message_id_being_responded_to: self.message_id,
			affected_sop_class_uid: self.sop_class_uid.clone(),
			affected_sop_instance_uid: self.sop_instance_uid.clone(),
			event_type_id: self.event_type_id,
			status,
		}
	}
}

/// Receives N-EVENT-REPORT requests. Returns the status for the N-EVENT-REPORT-RSP.
#[async_trait]
pub trait EventReportHandler: Send + Sync {
	async fn on_event(&self, report: EventReport) -> US;
}
