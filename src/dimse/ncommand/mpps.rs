use super::{NormalizedCreateRequest, NormalizedSetRequest};
use crate::association::negotiation::default_transfer_syntaxes;
use crate::association::{AssociationError, Connector, NegotiationError, PresentationContexts};
use crate::dimse::dispatcher::DispatchError;
use crate::dimse::{DimseOperation, DimseResponse, Dispatcher, RemoteEntity};
use crate::progress::{Progress, Status};
use crate::types::{new_uid, UI};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, instrument};

/// Modality Performed Procedure Step SOP class.
pub const MODALITY_PERFORMED_PROCEDURE_STEP: &str = "1.2.840.10008.3.1.2.3.3";

/// Performed Procedure Step Status (0040,0252)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcedureStepStatus {
	InProgress,
	Completed,
	Discontinued,
}

impl ProcedureStepStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::InProgress => "IN PROGRESS",
			Self::Completed => "COMPLETED",
			Self::Discontinued => "DISCONTINUED",
		}
	}
}

impl Display for ProcedureStepStatus {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ProcedureStepStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().replace('_', " ").as_str() {
			"IN PROGRESS" => Ok(Self::InProgress),
			"COMPLETED" => Ok(Self::Completed),
			"DISCONTINUED" => Ok(Self::Discontinued),
			other => Err(format!("unknown procedure step status `{other}`")),
		}
	}
}

/// Result of an MPPS request. The SOP instance UID identifies the procedure step in later
/// N-SET requests.
#[derive(Debug)]
pub struct ProcedureStep {
	pub sop_instance_uid: UI,
	pub status: Status,
}

/// Service class user for Modality Performed Procedure Step.
/// N-CREATE starts a procedure step, N-SET completes or discontinues it.
pub struct MppsServiceClassUser<C: Connector> {
	remote: RemoteEntity<C>,
	dispatcher: Dispatcher,
}

impl<C: Connector> MppsServiceClassUser<C> {
	pub fn new(remote: RemoteEntity<C>) -> Self {
		let dispatcher = Dispatcher::new(remote.timeout());
		Self { remote, dispatcher }
	}

	/// Creates a procedure step in status IN PROGRESS.
	/// A SOP instance UID is generated if none is given.
	#[instrument(skip_all, name = "N-CREATE")]
	pub async fn create(
		&self,
		mut attributes: InMemDicomObject,
		sop_instance_uid: Option<UI>,
		progress: &Progress,
	) -> Result<ProcedureStep, MppsError> {
		if attributes.get(tags::PERFORMED_PROCEDURE_STEP_STATUS).is_none() {
			attributes.put(status_element(ProcedureStepStatus::InProgress));
		}
		let sop_instance_uid = sop_instance_uid.unwrap_or_else(new_uid);
		let request = NormalizedCreateRequest {
			message_id: 0,
			affected_sop_class_uid: UI::from(MODALITY_PERFORMED_PROCEDURE_STEP),
			affected_sop_instance_uid: Some(sop_instance_uid.clone()),
			attributes,
		};

		let response = self.exchange(DimseOperation::Create(request), progress).await?;
		// The peer may assign its own UID.
		let sop_instance_uid = response
			.and_then(|response| response.affected_sop_instance_uid)
			.unwrap_or(sop_instance_uid);
		info!(sop_instance_uid, "Created procedure step");

		Ok(ProcedureStep {
			sop_instance_uid,
			status: progress.finalize(),
		})
	}

	/// Sets the final status of a procedure step together with further modifications.
	#[instrument(skip_all, name = "N-SET", fields(sop_instance_uid = sop_instance_uid))]
	pub async fn set(
		&self,
		sop_instance_uid: &str,
		step_status: ProcedureStepStatus,
		mut modifications: InMemDicomObject,
		progress: &Progress,
	) -> Result<ProcedureStep, MppsError> {
		modifications.put(status_element(step_status));
		let request = NormalizedSetRequest {
			message_id: 0,
			requested_sop_class_uid: UI::from(MODALITY_PERFORMED_PROCEDURE_STEP),
			requested_sop_instance_uid: UI::from(sop_instance_uid),
			modifications,
		};

		self.exchange(DimseOperation::Set(request), progress).await?;
		info!(%step_status, "Updated procedure step");

		Ok(ProcedureStep {
			sop_instance_uid: UI::from(sop_instance_uid),
			status: progress.finalize(),
		})
	}

	async fn exchange(
		&self,
		operation: DimseOperation,
		progress: &Progress,
	) -> Result<Option<DimseResponse>, MppsError> {
		let mut contexts = PresentationContexts::new();
		contexts.add(MODALITY_PERFORMED_PROCEDURE_STEP, default_transfer_syntaxes())?;
		let (manager, lease) = self.remote.associate(contexts, progress).await?;

		let response = match self.dispatcher.send(lease, operation, None) {
			Ok(handle) => handle.final_response().await,
			Err(err) => Err(err),
		};
		let response = match response {
			Ok(response) => {
				progress.on_final(response.status, response.error_comment.clone());
				Some(response)
			}
			Err(err) => {
				progress.on_error(err.to_string());
				None
			}
		};

		manager.close(false).await;
		Ok(response)
	}
}

fn status_element(status: ProcedureStepStatus) -> InMemElement {
	DataElement::new(
		tags::PERFORMED_PROCEDURE_STEP_STATUS,
		VR::CS,
		PrimitiveValue::from(status.as_str()),
	)
}

#[derive(Debug, Error)]
pub enum MppsError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
}
