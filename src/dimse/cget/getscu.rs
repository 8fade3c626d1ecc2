use super::CompositeGetRequest;
use crate::association::{AssociationError, Connector, NegotiationError, PresentationContexts};
use crate::dimse::cstore::StoreHandler;
use crate::dimse::{DimseOperation, Dispatcher, RemoteEntity};
use crate::progress::{Progress, Status};
use crate::types::{Priority, QueryInformationModel, UI, US};
use dicom::object::InMemDicomObject;
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, trace};

/// Service class user for C-GET.
/// The peer sends the matching instances as C-STORE sub-operations on the same association.
/// They are handed to a [`StoreHandler`] and answered with the status it returns.
pub struct GetServiceClassUser<C: Connector> {
	remote: RemoteEntity<C>,
	dispatcher: Dispatcher,
}

pub struct GetServiceClassUserOptions {
	pub query_information_model: QueryInformationModel,
	pub identifier: InMemDicomObject,
	pub priority: Priority,
	/// Storage SOP classes proposed with the SCP role.
	pub storage_sop_classes: Vec<UI>,
	/// Transfer syntaxes accepted for the storage sub-operations.
	pub transfer_syntaxes: Vec<UI>,
}

impl<C: Connector> GetServiceClassUser<C> {
	pub fn new(remote: RemoteEntity<C>) -> Self {
		let dispatcher = Dispatcher::new(remote.timeout());
		Self { remote, dispatcher }
	}

	#[instrument(skip_all, name = "C-GET")]
	pub async fn get(
		&self,
		options: GetServiceClassUserOptions,
		handler: Arc<dyn StoreHandler>,
		progress: &Progress,
	) -> Result<Status, GetError> {
		let model = options.query_information_model;
		let sop_class = model
			.as_get_sop_class()
			.ok_or(GetError::UnsupportedModel(model))?;
		let contexts = PresentationContexts::for_get(
			sop_class,
			&options.storage_sop_classes,
			&options.transfer_syntaxes,
		)?;

		let (manager, lease) = self.remote.associate(contexts, progress).await?;
		let request = CompositeGetRequest {
			message_id: 0,
			priority: options.priority as US,
			affected_sop_class_uid: UI::from(sop_class),
			identifier: options.identifier,
		};

		let dispatcher = self.dispatcher.clone().with_store_handler(handler);
		match dispatcher.send(lease, DimseOperation::Get(request), Some(progress.clone())) {
			Ok(handle) => {
				trace!(message_id = handle.message_id(), "Sent C-GET-RQ");
				handle.track(progress).await;
			}
			Err(err) => progress.on_error(err.to_string()),
		}

		manager.close(false).await;
		Ok(progress.finalize())
	}
}

#[derive(Debug, Error)]
pub enum GetError {
	#[error("The {0:?} information model does not support C-GET")]
	UnsupportedModel(QueryInformationModel),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}
