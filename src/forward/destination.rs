//! The outbound side of a forward session.
//!
//! A single task owns the [`AssociationManager`] of the destination and makes every open, close
//! and renegotiation decision. Senders ask it for a [`Permit`] before they send an instance and
//! give the permit back by dropping it. The task keeps track of the instances in flight, so it
//! never closes the association underneath a running C-STORE.

use super::{ForwardError, ForwardOptions};
use crate::association::{AssociationLease, AssociationManager, AssociationOptions, Connector, PresentationContexts};
use crate::node::Node;
use crate::types::{trim_uid, UI};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument};

enum Command<A> {
	Acquire {
		request: AcquireRequest,
		reply: oneshot::Sender<Result<Permit<A>, ForwardError>>,
	},
	Release {
		sop_instance_uid: UI,
		generation: u64,
		poisoned: bool,
	},
	Shutdown {
		reply: oneshot::Sender<()>,
	},
}

struct AcquireRequest {
	sop_class_uid: UI,
	sop_instance_uid: UI,
	transfer_syntax: UI,
}

/// Permission to send one instance on the outbound association.
/// Dropping the permit marks the instance as no longer in flight.
pub struct Permit<A> {
	// Dropped before the release message is sent.
	lease: AssociationLease<A>,
	transfer_syntax: UI,
	release: ReleaseGuard<A>,
}

impl<A> Permit<A> {
	pub const fn lease(&self) -> &AssociationLease<A> {
		&self.lease
	}

	/// The transfer syntax of the accepted presentation context.
	pub fn transfer_syntax(&self) -> &str {
		&self.transfer_syntax
	}

	/// Reports that the association failed while sending. It is replaced before the next
	/// instance is sent.
	pub fn poison(&mut self) {
		self.release.poisoned = true;
	}
}

struct ReleaseGuard<A> {
	sop_instance_uid: UI,
	generation: u64,
	poisoned: bool,
	commands: mpsc::UnboundedSender<Command<A>>,
}

impl<A> Drop for ReleaseGuard<A> {
	fn drop(&mut self) {
		// The task is gone if this fails, nothing left to release.
		let _ = self.commands.send(Command::Release {
			sop_instance_uid: std::mem::take(&mut self.sop_instance_uid),
			generation: self.generation,
			poisoned: self.poisoned,
		});
	}
}

/// Handle to the task that owns the outbound association of a forward session.
pub struct ForwardDestination<C: Connector> {
	commands: mpsc::UnboundedSender<Command<C::Association>>,
}

impl<C: Connector> Clone for ForwardDestination<C> {
	fn clone(&self) -> Self {
		Self {
			commands: self.commands.clone(),
		}
	}
}

impl<C: Connector> ForwardDestination<C> {
	/// Starts the task. Nothing is opened until the first instance arrives.
	pub fn spawn(
		connector: C,
		node: Node,
		association: AssociationOptions,
		options: ForwardOptions,
	) -> Result<Self, ForwardError> {
		let mut proposal = PresentationContexts::new();
		for sop_class_uid in &options.sop_classes {
			proposal.add_preferring(sop_class_uid, options.preferred_transfer_syntax())?;
		}

		let (tx, rx) = mpsc::unbounded_channel();
		let span = info_span!("FORWARD", called_aet = node.aet);
		let actor = DestinationActor {
			manager: AssociationManager::new(connector, association),
			node,
			options,
			proposal,
			in_flight: HashMap::new(),
			generation: 0,
			broken: false,
			idle_deadline: None,
			deferred: VecDeque::new(),
			receiver: rx,
			commands: tx.downgrade(),
		};
		tokio::spawn(actor.run().instrument(span));

		Ok(Self { commands: tx })
	}

	/// Waits until the instance can be sent. Opens or renegotiates the association if needed.
	pub async fn acquire(
		&self,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		transfer_syntax: &str,
	) -> Result<Permit<C::Association>, ForwardError> {
		let (reply, rx) = oneshot::channel();
		let request = AcquireRequest {
			sop_class_uid: UI::from(trim_uid(sop_class_uid)),
			sop_instance_uid: UI::from(trim_uid(sop_instance_uid)),
			transfer_syntax: UI::from(trim_uid(transfer_syntax)),
		};
		self.commands
			.send(Command::Acquire { request, reply })
			.map_err(|_| ForwardError::Closed)?;
		rx.await.map_err(|_| ForwardError::Closed)?
	}

	/// Waits for the instances in flight, releases the association and stops the task.
	pub async fn shutdown(&self) {
		let (reply, rx) = oneshot::channel();
		if self.commands.send(Command::Shutdown { reply }).is_ok() {
			let _ = rx.await;
		}
	}
}

struct DestinationActor<C: Connector> {
	manager: AssociationManager<C>,
	node: Node,
	options: ForwardOptions,
	/// A context for every (SOP class, transfer syntax) combination seen so far.
	proposal: PresentationContexts,
	in_flight: HashMap<UI, usize>,
	/// Incremented for every association, so that late releases of a previous one are ignored.
	generation: u64,
	broken: bool,
	idle_deadline: Option<Instant>,
	/// Requests that arrived while waiting for the instances in flight.
	deferred: VecDeque<Command<C::Association>>,
	receiver: mpsc::UnboundedReceiver<Command<C::Association>>,
	commands: mpsc::WeakUnboundedSender<Command<C::Association>>,
}

impl<C: Connector> DestinationActor<C> {
	async fn run(mut self) {
		loop {
			let command = if let Some(command) = self.deferred.pop_front() {
				Some(command)
			} else {
				tokio::select! {
					command = self.receiver.recv() => command,
					() = sleep_until(self.idle_deadline) => {
						self.close_idle().await;
						continue;
					}
				}
			};

			match command {
				Some(Command::Acquire { request, reply }) => {
					let result = self.acquire(request).await;
					// A dropped permit sends its own release.
					let _ = reply.send(result);
				}
				Some(Command::Release {
					sop_instance_uid,
					generation,
					poisoned,
				}) => self.release(&sop_instance_uid, generation, poisoned),
				Some(Command::Shutdown { reply }) => {
					self.shutdown().await;
					let _ = reply.send(());
					return;
				}
				None => {
					self.shutdown().await;
					return;
				}
			}

			if self.in_flight.is_empty() && self.idle_deadline.is_none() && self.manager.is_ready() {
				self.idle_deadline = Some(Instant::now() + self.options.idle_timeout);
			}
		}
	}

	async fn acquire(&mut self, request: AcquireRequest) -> Result<Permit<C::Association>, ForwardError> {
		self.idle_deadline = None;
		let desired = self
			.options
			.transfer_syntax
			.clone()
			.unwrap_or_else(|| request.transfer_syntax.clone());

		let lease = match self.manager.lease().await {
			Some(lease) if !self.broken => {
				if lease.accepted(&request.sop_class_uid, &desired).is_some() {
					lease
				} else if self.extend_proposal(&request.sop_class_uid, &desired)? {
					drop(lease);
					self.renegotiate().await?
				} else {
					// Proposed already and declined by the peer, the instance is transcoded.
					lease
				}
			}
			Some(lease) => {
				drop(lease);
				self.extend_proposal(&request.sop_class_uid, &desired)?;
				self.renegotiate().await?
			}
			None => {
				self.extend_proposal(&request.sop_class_uid, &desired)?;
				self.open().await?
			}
		};

		let transfer_syntax = lease
			.context_for(&request.sop_class_uid, Some(&desired))
			.map(|context| context.transfer_syntax.clone())
			.ok_or_else(|| ForwardError::NotAccepted(request.sop_class_uid.clone()))?;
		let commands = self.commands.upgrade().ok_or(ForwardError::Closed)?;

		*self
			.in_flight
			.entry(request.sop_instance_uid.clone())
			.or_default() += 1;
		trace!(
			sop_instance_uid = request.sop_instance_uid,
			in_flight = self.in_flight.len(),
			"Acquired permit"
		);

		Ok(Permit {
			lease,
			transfer_syntax,
			release: ReleaseGuard {
				sop_instance_uid: request.sop_instance_uid,
				generation: self.generation,
				poisoned: false,
				commands,
			},
		})
	}

	/// Proposes the transfer syntax as first choice for the SOP class.
	/// Returns false if the proposal already did, i.e. the next association would not differ.
	fn extend_proposal(
		&mut self,
		sop_class_uid: &str,
		transfer_syntax: &str,
	) -> Result<bool, ForwardError> {
		if self.proposal.preferred(sop_class_uid, transfer_syntax).is_some() {
			return Ok(false);
		}
		debug!(sop_class_uid, transfer_syntax, "Extending the proposal");
		self.proposal.add_preferring(sop_class_uid, transfer_syntax)?;
		Ok(true)
	}

	fn release(&mut self, sop_instance_uid: &str, generation: u64, poisoned: bool) {
		if generation != self.generation {
			trace!(sop_instance_uid, "Ignored release for a previous association");
			return;
		}
		if let Some(count) = self.in_flight.get_mut(sop_instance_uid) {
			*count -= 1;
			if *count == 0 {
				self.in_flight.remove(sop_instance_uid);
			}
		}
		if poisoned {
			debug!(sop_instance_uid, "Association failed while sending");
			self.broken = true;
		}
	}

	async fn open(&mut self) -> Result<AssociationLease<C::Association>, ForwardError> {
		let lease = self.manager.open(&self.node, self.proposal.clone()).await?;
		self.generation += 1;
		self.broken = false;
		Ok(lease)
	}

	/// Replaces the association with one that proposes the extended context list.
	async fn renegotiate(&mut self) -> Result<AssociationLease<C::Association>, ForwardError> {
		info!(
			in_flight = self.in_flight.len(),
			proposed = self.proposal.len(),
			"Renegotiating outbound association"
		);
		self.drain().await;
		let lease = self.manager.reopen_with(Some(self.proposal.clone())).await?;
		self.generation += 1;
		self.broken = false;
		Ok(lease)
	}

	/// Waits until no instance is in flight. Acquire requests are deferred meanwhile.
	/// After the renegotiation timeout the remaining instances are given up on.
	async fn drain(&mut self) {
		let timeout = self.options.renegotiation_timeout;
		let deadline = Instant::now() + timeout;
		while !self.in_flight.is_empty() {
			match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
				Ok(Some(Command::Release {
					sop_instance_uid,
					generation,
					poisoned,
				})) => self.release(&sop_instance_uid, generation, poisoned),
				Ok(Some(command)) => self.deferred.push_back(command),
				Ok(None) => return,
				Err(_) => {
					let stuck: Vec<&UI> = self.in_flight.keys().collect();
					warn!(
						?stuck,
						"Instances still in flight after {timeout:?}, proceeding without them"
					);
					self.in_flight.clear();
					return;
				}
			}
		}
	}

	async fn close_idle(&mut self) {
		self.idle_deadline = None;
		if self.in_flight.is_empty() && self.manager.is_ready() {
			info!("Closing idle outbound association");
			self.manager.close(false).await;
		}
	}

	async fn shutdown(&mut self) {
		self.drain().await;
		self.manager.close(false).await;
		debug!("Forward destination stopped");
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}
