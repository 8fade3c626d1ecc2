use super::{DicomMessage, DATA_SET_MISSING};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub const COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST: US = 0x0FFF;

/// C-CANCEL-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.2.3.html>
#[derive(Debug)]
pub struct CompositeCancelRequest {
	pub message_id_being_responded_to: US,
}

impl From<CompositeCancelRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeCancelRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [request.message_id_being_responded_to])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}
