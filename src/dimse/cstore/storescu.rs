use super::CompositeStoreRequest;
use crate::association::{AssociationError, Connector, NegotiationError, PresentationContexts};
use crate::dimse::{status, DataSet, DimseOperation, Dispatcher, RemoteEntity, StatusType};
use crate::progress::{Progress, Status};
use crate::types::{trim_uid, Priority, UI, US};
use dicom::object::{FileDicomObject, InMemDicomObject};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Service class user for C-STORE.
/// All instances are sent on one association that proposes a context for every SOP class and
/// transfer syntax found in the files. A failed instance does not stop the remaining ones.
pub struct StoreServiceClassUser<C: Connector> {
	remote: RemoteEntity<C>,
	dispatcher: Dispatcher,
}

impl<C: Connector> StoreServiceClassUser<C> {
	pub fn new(remote: RemoteEntity<C>) -> Self {
		let dispatcher = Dispatcher::new(remote.timeout());
		Self { remote, dispatcher }
	}

	#[instrument(skip_all, name = "C-STORE", fields(instances = files.len()))]
	pub async fn store(
		&self,
		files: Vec<FileDicomObject<InMemDicomObject>>,
		priority: Priority,
		progress: &Progress,
	) -> Result<Status, StoreError> {
		let presentation: Vec<(UI, UI)> = files
			.iter()
			.map(|file| {
				(
					UI::from(trim_uid(file.meta().media_storage_sop_class_uid())),
					UI::from(trim_uid(file.meta().transfer_syntax())),
				)
			})
			.collect();
		let contexts = PresentationContexts::for_storage(
			presentation
				.iter()
				.map(|(sop_class, ts)| (sop_class.as_str(), ts.as_str())),
		)?;

		let (manager, lease) = self.remote.associate(contexts, progress).await?;

		for (file, (sop_class_uid, transfer_syntax)) in files.into_iter().zip(presentation) {
			if progress.cancel_requested() {
				break;
			}
			let sop_instance_uid = UI::from(trim_uid(file.meta().media_storage_sop_instance_uid()));

			let Some(context) = lease.context_for(&sop_class_uid, Some(&transfer_syntax)) else {
				warn!(sop_class_uid, "No presentation context accepted");
				progress.on_sub_operation(Some(&sop_instance_uid), status::SOP_CLASS_NOT_SUPPORTED, 0);
				continue;
			};
			let context_ts = context.transfer_syntax.clone();

			let bytes = match DataSet::Object(file.into_inner()).encode(&context_ts) {
				Ok(bytes) => bytes,
				Err(err) => {
					warn!(sop_instance_uid, "Failed to encode instance: {err}");
					progress.on_sub_operation(Some(&sop_instance_uid), status::PROCESSING_FAILURE, 0);
					continue;
				}
			};
			let length = bytes.len() as u64;

			let request = CompositeStoreRequest {
				affected_sop_class_uid: sop_class_uid,
				affected_sop_instance_uid: sop_instance_uid.clone(),
				move_originator_aet: None,
				move_originator_message_id: None,
				message_id: 0,
				priority: priority as US,
				data_set: DataSet::Encoded {
					bytes,
					transfer_syntax: context_ts,
				},
			};

			let response = match self
				.dispatcher
				.send(lease.clone(), DimseOperation::Store(request), None)
			{
				Ok(handle) => handle.final_response().await,
				Err(err) => Err(err),
			};
			match response {
				Ok(response) => {
					debug!(sop_instance_uid, status = response.status, "Received C-STORE-RSP");
					let transferred = match response.status_type() {
						StatusType::Success | StatusType::Warning => length,
						_ => 0,
					};
					progress.on_sub_operation(Some(&sop_instance_uid), response.status, transferred);
				}
				Err(err) => {
					warn!(sop_instance_uid, "C-STORE failed: {err}");
					progress.on_sub_operation(Some(&sop_instance_uid), status::PROCESSING_FAILURE, 0);
				}
			}
		}

		drop(lease);
		manager.close(false).await;
		Ok(progress.finalize())
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}
