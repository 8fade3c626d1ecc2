use super::CompositeMoveRequest;
use crate::association::{AssociationError, Connector, NegotiationError, PresentationContexts};
use crate::dimse::{DimseOperation, Dispatcher, RemoteEntity};
use crate::node::{validate_ae_title, NodeError};
use crate::progress::{Progress, Status};
use crate::types::{Priority, QueryInformationModel, AE};
use dicom::object::InMemDicomObject;
use thiserror::Error;
use tracing::{info, instrument};

/// Service class user for C-MOVE.
/// The instances are sent by the peer to the move destination on a separate association. This
/// side only observes the sub-operation counters reported in the C-MOVE responses.
pub struct MoveServiceClassUser<C: Connector> {
	remote: RemoteEntity<C>,
	dispatcher: Dispatcher,
}

pub struct MoveServiceClassUserOptions {
	pub query_information_model: QueryInformationModel,
	pub identifier: InMemDicomObject,
	pub priority: Priority,
	pub destination: AE,
}

impl<C: Connector> MoveServiceClassUser<C> {
	pub fn new(remote: RemoteEntity<C>) -> Self {
		let dispatcher = Dispatcher::new(remote.timeout());
		Self { remote, dispatcher }
	}

	#[instrument(skip_all, name = "C-MOVE", fields(destination = %options.destination))]
	pub async fn invoke(
		&self,
		options: MoveServiceClassUserOptions,
		progress: &Progress,
	) -> Result<Status, MoveError> {
		validate_ae_title(&options.destination)?;
		let model = options.query_information_model;
		let sop_class = model
			.as_move_sop_class()
			.ok_or(MoveError::UnsupportedModel(model))?;

		let (manager, lease) = self
			.remote
			.associate(PresentationContexts::for_move(sop_class)?, progress)
			.await?;

		let request = CompositeMoveRequest::new(options.destination)
			.sop_class(sop_class)
			.priority(options.priority)
			.identifier(options.identifier);
		match self
			.dispatcher
			.send(lease, DimseOperation::Move(request), Some(progress.clone()))
		{
			Ok(handle) => {
				info!(message_id = handle.message_id(), "Sent C-MOVE-RQ");
				handle.track(progress).await;
			}
			Err(err) => progress.on_error(err.to_string()),
		}

		manager.close(false).await;
		Ok(progress.finalize())
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error("The {0:?} information model does not support C-MOVE")]
	UnsupportedModel(QueryInformationModel),
	#[error("Invalid move destination: {0}")]
	Destination(#[from] NodeError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}
