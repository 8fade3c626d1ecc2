//! Lifecycle of a single outbound association.
//!
//! ```text
//! Idle ──open──▶ Opening ──▶ Ready ──close(false)──▶ Releasing ──▶ Idle
//!                   │          └─────close(true)──────────────────▶ Idle
//!                   └──failure──▶ Idle
//! ```
//!
//! Opening, closing and reopening are serialized by a single guard so that there is never more
//! than one transition in progress. Operations hold an [`AssociationLease`] while they use the
//! association; a graceful close waits until all leases are dropped.

use super::active::ActiveAssociation;
use super::negotiation::PresentationContexts;
use super::{AssociationError, AssociationRequest, Connector};
use crate::node::Node;
use crate::types::AE;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
	Idle,
	Opening,
	Ready,
	Releasing,
}

impl Display for AssociationState {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Idle => write!(f, "idle"),
			Self::Opening => write!(f, "opening"),
			Self::Ready => write!(f, "ready"),
			Self::Releasing => write!(f, "releasing"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct AssociationOptions {
	pub calling_aet: AE,
	pub max_pdu_length: u32,
	pub connect_timeout: Duration,
	/// How long a graceful close waits for outstanding operations and the release handshake.
	pub release_timeout: Duration,
}

impl AssociationOptions {
	pub fn new(calling_aet: impl Into<AE>) -> Self {
		Self {
			calling_aet: calling_aet.into(),
			max_pdu_length: 16_384,
			connect_timeout: Duration::from_secs(30),
			release_timeout: Duration::from_secs(10),
		}
	}
}

struct Slot<A> {
	active: Option<Arc<ActiveAssociation<A>>>,
	node: Option<Node>,
	contexts: PresentationContexts,
}

pub struct AssociationManager<C: Connector> {
	connector: C,
	options: AssociationOptions,
	slot: Mutex<Slot<C::Association>>,
	state: watch::Sender<AssociationState>,
	outstanding: Arc<watch::Sender<usize>>,
}

impl<C: Connector> AssociationManager<C> {
	pub fn new(connector: C, options: AssociationOptions) -> Self {
		Self {
			connector,
			options,
			slot: Mutex::new(Slot {
				active: None,
				node: None,
				contexts: PresentationContexts::new(),
			}),
			state: watch::Sender::new(AssociationState::Idle),
			outstanding: Arc::new(watch::Sender::new(0)),
		}
	}

	pub const fn options(&self) -> &AssociationOptions {
		&self.options
	}

	pub fn state(&self) -> AssociationState {
		*self.state.borrow()
	}

	pub fn subscribe(&self) -> watch::Receiver<AssociationState> {
		self.state.subscribe()
	}

	pub fn is_ready(&self) -> bool {
		self.state() == AssociationState::Ready
	}

	/// Number of leases currently held by operations.
	pub fn outstanding(&self) -> usize {
		*self.outstanding.borrow()
	}

	/// Requests a new association with the node.
	/// Fails with [`AssociationError::NotIdle`] if an association is already open.
	pub async fn open(
		&self,
		node: &Node,
		contexts: PresentationContexts,
	) -> Result<AssociationLease<C::Association>, AssociationError> {
		let mut slot = self.slot.lock().await;
		self.open_locked(&mut slot, node, contexts).await
	}

	/// Returns a lease on the open association, if any.
	pub async fn lease(&self) -> Option<AssociationLease<C::Association>> {
		let slot = self.slot.lock().await;
		slot.active.as_ref().map(|active| self.lease_of(Arc::clone(active)))
	}

	/// The presentation contexts proposed for the current or last association.
	pub async fn proposed_contexts(&self) -> PresentationContexts {
		self.slot.lock().await.contexts.clone()
	}

	/// Closes the association. A forced close aborts immediately, otherwise the association is
	/// released once all outstanding operations finished.
	pub async fn close(&self, force: bool) {
		let mut slot = self.slot.lock().await;
		self.close_locked(&mut slot, force).await;
	}

	/// Aborts the current association and opens a new one with the same node and proposal.
	pub async fn reopen(&self) -> Result<AssociationLease<C::Association>, AssociationError> {
		self.reopen_with(None).await
	}

	/// Aborts the current association and opens a new one, optionally with a new proposal.
	pub async fn reopen_with(
		&self,
		contexts: Option<PresentationContexts>,
	) -> Result<AssociationLease<C::Association>, AssociationError> {
		let mut slot = self.slot.lock().await;
		let node = slot.node.clone().ok_or(AssociationError::NotOpen)?;
		let contexts = contexts.unwrap_or_else(|| slot.contexts.clone());
		self.close_locked(&mut slot, true).await;
		self.open_locked(&mut slot, &node, contexts).await
	}

	/// Waits until no leases are outstanding.
	pub async fn wait_for_outstanding(&self, timeout: Duration) -> Result<(), AssociationError> {
		let mut outstanding = self.outstanding.subscribe();
		let drained = tokio::time::timeout(timeout, outstanding.wait_for(|count| *count == 0))
			.await
			.map_err(|_| AssociationError::Outstanding(timeout))?
			.map(|_| ())
			.map_err(|_| AssociationError::NotOpen);
		drained
	}

	async fn open_locked(
		&self,
		slot: &mut Slot<C::Association>,
		node: &Node,
		contexts: PresentationContexts,
	) -> Result<AssociationLease<C::Association>, AssociationError> {
		let state = self.state();
		if state != AssociationState::Idle || slot.active.is_some() {
			return Err(AssociationError::NotIdle(state));
		}
		node.validate()?;

		self.state.send_replace(AssociationState::Opening);
		let started = Instant::now();
		let request = AssociationRequest {
			calling_aet: self.options.calling_aet.clone(),
			node: node.clone(),
			contexts: contexts.clone(),
			max_pdu_length: self.options.max_pdu_length,
			timeout: self.options.connect_timeout,
		};

		match self.connector.connect(request).await {
			Ok(transport) => {
				let active = Arc::new(ActiveAssociation::new(
					transport,
					self.options.calling_aet.clone(),
					node.aet.clone(),
				));
				info!(
					association_id = active.uuid().to_string(),
					calling_aet = self.options.calling_aet,
					called_aet = node.aet,
					proposed = contexts.len(),
					accepted = active.presentation_contexts().len(),
					"Opened association in {:?}",
					started.elapsed()
				);
				slot.active = Some(Arc::clone(&active));
				slot.node = Some(node.clone());
				slot.contexts = contexts;
				self.state.send_replace(AssociationState::Ready);
				Ok(self.lease_of(active))
			}
			Err(err) => {
				warn!(called_aet = node.aet, "Failed to open association: {err}");
				slot.node = Some(node.clone());
				slot.contexts = contexts;
				self.state.send_replace(AssociationState::Idle);
				Err(err)
			}
		}
	}

	async fn close_locked(&self, slot: &mut Slot<C::Association>, force: bool) {
		let Some(active) = slot.active.take() else {
			return;
		};
		let association_id = active.uuid().to_string();

		if force {
			active.abort();
			info!(association_id, "Aborted association");
		} else {
			self.state.send_replace(AssociationState::Releasing);
			let timeout = self.options.release_timeout;
			if let Err(err) = self.wait_for_outstanding(timeout).await {
				warn!(association_id, "Aborting association: {err}");
				active.abort();
			} else if let Err(err) = active.release(timeout).await {
				debug!(association_id, "Release failed, aborting: {err}");
				active.abort();
			} else {
				info!(association_id, "Released association");
			}
		}

		self.state.send_replace(AssociationState::Idle);
	}

	fn lease_of(&self, active: Arc<ActiveAssociation<C::Association>>) -> AssociationLease<C::Association> {
		self.outstanding.send_modify(|count| *count += 1);
		AssociationLease {
			association: active,
			outstanding: Arc::clone(&self.outstanding),
		}
	}
}

/// Shared access to an open association.
/// Dropping the lease marks the operation that used it as finished.
pub struct AssociationLease<A> {
	association: Arc<ActiveAssociation<A>>,
	outstanding: Arc<watch::Sender<usize>>,
}

impl<A> AssociationLease<A> {
	/// Detached lease that is not tracked by a manager, used for associations accepted by a
	/// service class provider.
	pub fn detached(association: ActiveAssociation<A>) -> Self {
		Self {
			association: Arc::new(association),
			outstanding: Arc::new(watch::Sender::new(1)),
		}
	}
}

impl<A> Clone for AssociationLease<A> {
	fn clone(&self) -> Self {
		self.outstanding.send_modify(|count| *count += 1);
		Self {
			association: Arc::clone(&self.association),
			outstanding: Arc::clone(&self.outstanding),
		}
	}
}

impl<A> Deref for AssociationLease<A> {
	type Target = ActiveAssociation<A>;

	fn deref(&self) -> &Self::Target {
		&self.association
	}
}

impl<A> Drop for AssociationLease<A> {
	fn drop(&mut self) {
		self.outstanding
			.send_modify(|count| *count = count.saturating_sub(1));
	}
}
