use crate::association::{
	AssociationError, AssociationLease, AssociationManager, AssociationOptions, Connector,
	PresentationContexts,
};
use crate::node::Node;
use crate::progress::Progress;
use std::time::{Duration, Instant};

/// A remote application entity that service class users open associations with.
/// Every invocation gets its own [`AssociationManager`], so one entity can serve concurrent
/// operations.
#[derive(Clone)]
pub struct RemoteEntity<C: Connector> {
	connector: C,
	node: Node,
	options: AssociationOptions,
	timeout: Duration,
}

impl<C: Connector> RemoteEntity<C> {
	pub const fn new(connector: C, node: Node, options: AssociationOptions, timeout: Duration) -> Self {
		Self {
			connector,
			node,
			options,
			timeout,
		}
	}

	pub const fn node(&self) -> &Node {
		&self.node
	}

	pub fn calling_aet(&self) -> &str {
		&self.options.calling_aet
	}

	/// Timeout for a single DIMSE message.
	pub const fn timeout(&self) -> Duration {
		self.timeout
	}

	pub fn manager(&self) -> AssociationManager<C> {
		AssociationManager::new(self.connector.clone(), self.options.clone())
	}

	/// Opens an association and records the connect time.
	pub async fn associate(
		&self,
		contexts: PresentationContexts,
		progress: &Progress,
	) -> Result<(AssociationManager<C>, AssociationLease<C::Association>), AssociationError> {
		let manager = self.manager();
		let started = Instant::now();
		let lease = manager.open(&self.node, contexts).await?;
		progress.connected(started.elapsed());
		Ok((manager, lease))
	}
}
