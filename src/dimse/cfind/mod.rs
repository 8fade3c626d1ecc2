use super::{DicomMessage, DATA_SET_EXISTS};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub mod findscu;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
#[derive(Debug)]
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier.into()),
			presentation_context_id: None,
		}
	}
}
