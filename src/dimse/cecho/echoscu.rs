use super::CompositeEchoRequest;
use crate::association::{AssociationError, Connector, PresentationContexts};
use crate::dimse::dispatcher::DispatchError;
use crate::dimse::{DimseOperation, Dispatcher, RemoteEntity};
use crate::progress::{Progress, Status};
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// Service class user for the Verification SOP class.
/// It simply sends a C-ECHO-RQ and waits for a C-ECHO-RSP.
/// The response contains the Status attribute that indicates the current connection status.
pub struct EchoServiceClassUser<C: Connector> {
	remote: RemoteEntity<C>,
	dispatcher: Dispatcher,
}

impl<C: Connector> EchoServiceClassUser<C> {
	pub fn new(remote: RemoteEntity<C>) -> Self {
		let dispatcher = Dispatcher::new(remote.timeout());
		Self { remote, dispatcher }
	}

	/// Initiates the C-ECHO protocol.
	#[instrument(skip_all, name = "C-ECHO")]
	pub async fn echo(&self) -> Result<Status, EchoError> {
		trace!("Initiated C-ECHO protocol");
		let progress = Progress::new();
		let (manager, lease) = self
			.remote
			.associate(PresentationContexts::verification(), &progress)
			.await?;

		let handle = self.dispatcher.send(
			lease,
			DimseOperation::Echo(CompositeEchoRequest::default()),
			None,
		)?;
		match handle.final_response().await {
			Ok(response) => {
				debug!(
					status = response.status,
					"Received C-ECHO-RSP ({:?})",
					response.status_type()
				);
				progress.on_final(response.status, response.error_comment);
			}
			Err(err) => progress.on_error(err.to_string()),
		}

		manager.close(false).await;
		Ok(progress.finalize())
	}
}

/// Errors that can occur for the echoscu.
#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
}
