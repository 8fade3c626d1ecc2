//! Turns an inbound data set into the bytes that are sent to the forward destination.
//!
//! Both strategies are passed to the session on construction. Instances that need neither a
//! transfer syntax change nor attribute edits never reach them.

use crate::dimse::{decode_data_set, lookup_transfer_syntax, DataSet, ReadError, WriteError};
use crate::types::{parse_attribute, trim_uid, UI};
use bytes::Bytes;
use dicom::core::ops::{ApplyOp, AttributeAction, AttributeOp, AttributeSelector};
use dicom::object::ops::ApplyError;
use dicom::core::PrimitiveValue;
use dicom::object::InMemDicomObject;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("Failed to edit attributes: {0}")]
	Edit(#[from] ApplyError),
	#[error("Cannot transcode from {from} to {to} without a pixel data codec")]
	Unsupported { from: UI, to: UI },
	#[error("Invalid attribute edit: {0}")]
	InvalidEdit(String),
}

/// Modifies instances before they are forwarded.
pub trait AttributeEditor: Send + Sync {
	fn edit(&self, object: &mut InMemDicomObject) -> Result<(), CodecError>;
}

impl<F> AttributeEditor for F
where
	F: Fn(&mut InMemDicomObject) -> Result<(), CodecError> + Send + Sync,
{
	fn edit(&self, object: &mut InMemDicomObject) -> Result<(), CodecError> {
		self(object)
	}
}

/// A list of attribute operations, applied in order.
#[derive(Debug, Clone, Default)]
pub struct AttributeEdits {
	operations: Vec<AttributeOp>,
}

impl AttributeEdits {
	pub const fn new() -> Self {
		Self {
			operations: Vec::new(),
		}
	}

	/// Parses assignments like `InstitutionName=Relay`. An assignment without a value
	/// removes the attribute.
	pub fn parse<I, S>(assignments: I) -> Result<Self, CodecError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut edits = Self::new();
		for assignment in assignments {
			let assignment = assignment.as_ref();
			let (tag, value) = parse_attribute(assignment).map_err(CodecError::InvalidEdit)?;
			edits = if assignment.contains('=') {
				edits.set(tag, PrimitiveValue::from(value))
			} else {
				edits.remove(tag)
			};
		}
		Ok(edits)
	}

	#[must_use]
	pub fn set(mut self, selector: impl Into<AttributeSelector>, value: PrimitiveValue) -> Self {
		self.operations
			.push(AttributeOp::new(selector, AttributeAction::Set(value)));
		self
	}

	#[must_use]
	pub fn remove(mut self, selector: impl Into<AttributeSelector>) -> Self {
		self.operations
			.push(AttributeOp::new(selector, AttributeAction::Remove));
		self
	}

	pub fn is_empty(&self) -> bool {
		self.operations.is_empty()
	}

	pub fn len(&self) -> usize {
		self.operations.len()
	}
}

impl AttributeEditor for AttributeEdits {
	fn edit(&self, object: &mut InMemDicomObject) -> Result<(), CodecError> {
		for operation in &self.operations {
			object.apply(operation.clone())?;
		}
		Ok(())
	}
}

/// Decodes and encodes data sets for the transcode path.
pub trait DatasetCodec: Send + Sync {
	fn decode(&self, bytes: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject, CodecError>;

	fn encode(&self, object: InMemDicomObject, transfer_syntax: &str) -> Result<Bytes, CodecError>;

	/// Whether data sets can be converted between the two transfer syntaxes.
	fn supports(&self, from: &str, to: &str) -> bool;

	/// Decodes the data set, applies the edits and encodes it with the target transfer syntax.
	fn transcode(
		&self,
		bytes: &[u8],
		from: &str,
		to: &str,
		editor: Option<&dyn AttributeEditor>,
	) -> Result<Bytes, CodecError> {
		if !self.supports(from, to) {
			return Err(CodecError::Unsupported {
				from: UI::from(trim_uid(from)),
				to: UI::from(trim_uid(to)),
			});
		}
		let mut object = self.decode(bytes, from)?;
		if let Some(editor) = editor {
			editor.edit(&mut object)?;
		}
		self.encode(object, to)
	}
}

/// Codec backed by dicom-object. It converts between transfer syntaxes that store pixel data
/// natively. Encapsulated data sets are only re-encoded with their own transfer syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCodec;

impl DatasetCodec for NativeCodec {
	fn decode(&self, bytes: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject, CodecError> {
		Ok(decode_data_set(bytes, transfer_syntax)?)
	}

	fn encode(&self, object: InMemDicomObject, transfer_syntax: &str) -> Result<Bytes, CodecError> {
		Ok(DataSet::Object(object).encode(transfer_syntax)?)
	}

	fn supports(&self, from: &str, to: &str) -> bool {
		if trim_uid(from) == trim_uid(to) {
			return lookup_transfer_syntax(from).is_ok();
		}
		[from, to]
			.into_iter()
			.all(|uid| lookup_transfer_syntax(uid).is_ok_and(|ts| ts.is_codec_free()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use dicom::dictionary_std::{tags, uids};

	const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

	fn object() -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^Jane")),
			DataElement::new(tags::INSTITUTION_NAME, VR::LO, PrimitiveValue::from("Hospital")),
		])
	}

	#[test]
	fn edits_are_applied_in_order() {
		let edits = AttributeEdits::parse(["PatientName=Anonymous", "InstitutionName"]).unwrap();
		assert_eq!(edits.len(), 2);

		let mut object = object();
		edits.edit(&mut object).unwrap();
		assert_eq!(
			object.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
			"Anonymous"
		);
		assert!(object.element(tags::INSTITUTION_NAME).is_err());
	}

	#[test]
	fn closures_are_editors() {
		let editor = |object: &mut InMemDicomObject| {
			object.remove_element(tags::PATIENT_NAME);
			Ok::<(), CodecError>(())
		};
		let mut object = object();
		editor.edit(&mut object).unwrap();
		assert!(object.element(tags::PATIENT_NAME).is_err());
	}

	#[test]
	fn rejects_unknown_attributes() {
		assert!(matches!(
			AttributeEdits::parse(["Unknown=1"]),
			Err(CodecError::InvalidEdit(_))
		));
	}

	#[test]
	fn transcodes_between_native_transfer_syntaxes() {
		let codec = NativeCodec;
		let explicit = codec
			.encode(object(), uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.unwrap();
		let edits = AttributeEdits::new().set(tags::PATIENT_NAME, PrimitiveValue::from("X"));

		let implicit = codec
			.transcode(
				&explicit,
				uids::EXPLICIT_VR_LITTLE_ENDIAN,
				uids::IMPLICIT_VR_LITTLE_ENDIAN,
				Some(&edits),
			)
			.unwrap();
		let decoded = codec
			.decode(&implicit, uids::IMPLICIT_VR_LITTLE_ENDIAN)
			.unwrap();
		assert_eq!(decoded.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(), "X");
	}

	#[test]
	fn refuses_pixel_data_compression() {
		let codec = NativeCodec;
		assert!(!codec.supports(uids::EXPLICIT_VR_LITTLE_ENDIAN, JPEG_BASELINE));
		assert!(codec.supports(JPEG_BASELINE, JPEG_BASELINE));
		assert!(matches!(
			codec.transcode(&[], uids::EXPLICIT_VR_LITTLE_ENDIAN, JPEG_BASELINE, None),
			Err(CodecError::Unsupported { .. })
		));
	}
}
