use super::ForwardStoreHandler;
use crate::association::Connector;
use crate::dimse::cget::getscu::{GetError, GetServiceClassUser, GetServiceClassUserOptions};
use crate::dimse::cstore::StoreHandler;
use crate::dimse::RemoteEntity;
use crate::progress::{Progress, Status};
use std::sync::Arc;
use tracing::{info, instrument};

/// Outcome of a retrieve-forward session.
#[derive(Debug)]
pub struct ForwardReport {
	/// The C-GET as reported by the source.
	pub retrieve: Status,
	/// The C-STORE requests sent to the destination.
	pub forward: Status,
}

/// Retrieves instances from a source with C-GET and relays each one to a destination while
/// the retrieve is still running.
pub struct RetrieveForwardSession<S: Connector, D: Connector> {
	source: GetServiceClassUser<S>,
	handler: Arc<ForwardStoreHandler<D>>,
}

impl<S: Connector, D: Connector> RetrieveForwardSession<S, D> {
	pub fn new(source: RemoteEntity<S>, handler: ForwardStoreHandler<D>) -> Self {
		Self {
			source: GetServiceClassUser::new(source),
			handler: Arc::new(handler),
		}
	}

	/// Runs the retrieve and waits until every instance was forwarded and the outbound
	/// association is released.
	#[instrument(skip_all, name = "RETRIEVE-FORWARD")]
	pub async fn run(
		self,
		options: GetServiceClassUserOptions,
		progress: &Progress,
	) -> Result<ForwardReport, GetError> {
		let handler: Arc<dyn StoreHandler> = Arc::clone(&self.handler) as Arc<dyn StoreHandler>;
		let result = self.source.get(options, handler, progress).await;
		self.handler.destination().shutdown().await;
		let retrieve = result?;
		let forward = self.handler.progress().finalize();

		info!(
			retrieved = retrieve.counters.completed + retrieve.counters.warning,
			forwarded = forward.counters.completed + forward.counters.warning,
			failed = forward.counters.failed,
			"Retrieve-forward session finished"
		);
		Ok(ForwardReport { retrieve, forward })
	}
}
