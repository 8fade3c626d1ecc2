use super::CompositeFindRequest;
use crate::association::{AssociationError, Connector, NegotiationError, PresentationContexts};
use crate::dimse::dispatcher::DispatchError;
use crate::dimse::{DimseEvent, DimseOperation, Dispatcher, ReadError, RemoteEntity};
use crate::progress::{Progress, Status};
use crate::types::{Priority, QueryInformationModel, UI, US};
use async_stream::try_stream;
use dicom::object::InMemDicomObject;
use futures::{Stream, TryStreamExt};
use thiserror::Error;
use tracing::{debug, instrument, trace};

pub struct FindServiceClassUser<C: Connector> {
	remote: RemoteEntity<C>,
	dispatcher: Dispatcher,
}

pub struct FindServiceClassUserOptions {
	pub query_information_model: QueryInformationModel,
	pub identifier: InMemDicomObject,
	pub priority: Priority,
	/// Announce relational queries through extended negotiation.
	pub relational: bool,
	/// Send a C-CANCEL after this many matches.
	pub cancel_after: Option<usize>,
}

impl FindServiceClassUserOptions {
	pub fn new(query_information_model: QueryInformationModel, identifier: InMemDicomObject) -> Self {
		Self {
			query_information_model,
			identifier,
			priority: Priority::default(),
			relational: false,
			cancel_after: None,
		}
	}
}

impl From<FindServiceClassUserOptions> for CompositeFindRequest {
	fn from(options: FindServiceClassUserOptions) -> Self {
		Self {
			identifier: options.identifier,
			message_id: 0,
			priority: options.priority as US,
			affected_sop_class_uid: UI::from(options.query_information_model.as_sop_class()),
		}
	}
}

impl<C: Connector> FindServiceClassUser<C> {
	pub fn new(remote: RemoteEntity<C>) -> Self {
		let dispatcher = Dispatcher::new(remote.timeout());
		Self { remote, dispatcher }
	}

	/// Streams the matches of a C-FIND query.
	/// Statuses and counts are recorded in the progress.
	pub fn invoke(
		&self,
		options: FindServiceClassUserOptions,
		progress: Progress,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + '_ {
		try_stream! {
			let contexts = PresentationContexts::for_find(
				options.query_information_model.as_sop_class(),
				options.relational,
			)?;
			let (manager, lease) = self.remote.associate(contexts, &progress).await?;
			let cancel_after = options.cancel_after;
			let request = CompositeFindRequest::from(options);
			let mut handle = self.dispatcher.send(
				lease,
				DimseOperation::Find { request, cancel_after },
				Some(progress.clone()),
			)?;
			trace!("Sent C-FIND-RQ");

			while let Some(event) = handle.next().await {
				match event {
					Ok(DimseEvent::Pending(response)) => {
						trace!("Received C-FIND-RSP (pending)");
						if let Some(data) = response.data {
							let identifier = data.into_object()?;
							progress.on_match(&identifier);
							yield identifier;
						}
					}
					Ok(DimseEvent::Final(response)) => {
						debug!(
							status = response.status,
							"Received final C-FIND-RSP ({:?})",
							response.status_type()
						);
						progress.on_final(response.status, response.error_comment);
						break;
					}
					Err(err) => {
						progress.on_error(err.to_string());
						break;
					}
				}
			}

			manager.close(false).await;
		}
	}

	/// Runs a C-FIND query and collects the matches into the final status.
	#[instrument(skip_all, name = "C-FIND")]
	pub async fn find(
		&self,
		options: FindServiceClassUserOptions,
		progress: &Progress,
	) -> Result<Status, FindError> {
		let stream = self.invoke(options, progress.clone());
		futures::pin_mut!(stream);
		while stream.try_next().await?.is_some() {}
		Ok(progress.finalize())
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}
