use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Routes results that arrive on one association to the task that waits for them on another.
/// Subscribers register a key, publishers deliver values for that key.
pub struct Mediator<K, V> {
	callbacks: Arc<Mutex<HashMap<K, mpsc::Sender<V>>>>,
}

impl<K, V> Clone for Mediator<K, V> {
	fn clone(&self) -> Self {
		Self {
			callbacks: Arc::clone(&self.callbacks),
		}
	}
}

impl<K, V> Default for Mediator<K, V> {
	fn default() -> Self {
		Self {
			callbacks: Arc::new(Mutex::new(HashMap::new())),
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediatorError {
	#[error("No subscriber for topic {topic}")]
	MissingCallback { topic: String },
	#[error("Subscriber for topic {topic} is gone")]
	ChannelClosed { topic: String },
}

impl<K, V> Mediator<K, V>
where
	K: Clone + Eq + Hash + Debug,
{
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a subscriber. A previous subscriber for the same key is replaced.
	pub fn subscribe(&self, key: K) -> Subscription<K, V> {
		let (tx, rx) = mpsc::channel(8);
		self.callbacks().insert(key.clone(), tx.clone());
		trace!(?key, "Added subscription");
		Subscription {
			key,
			sender: tx,
			receiver: rx,
			callbacks: Arc::clone(&self.callbacks),
		}
	}

	pub async fn publish(&self, key: &K, value: V) -> Result<(), MediatorError> {
		let callback = self
			.callbacks()
			.get(key)
			.cloned()
			.ok_or_else(|| MediatorError::MissingCallback {
				topic: format!("{key:?}"),
			})?;
		callback
			.send(value)
			.await
			.map_err(|_| MediatorError::ChannelClosed {
				topic: format!("{key:?}"),
			})
	}

	pub fn is_subscribed(&self, key: &K) -> bool {
		self.callbacks().contains_key(key)
	}

	fn callbacks(&self) -> MutexGuard<'_, HashMap<K, mpsc::Sender<V>>> {
		self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Receives the values published for one key. Dropping it removes the key.
pub struct Subscription<K: Eq + Hash, V> {
	key: K,
	sender: mpsc::Sender<V>,
	receiver: mpsc::Receiver<V>,
	callbacks: Arc<Mutex<HashMap<K, mpsc::Sender<V>>>>,
}

impl<K: Eq + Hash, V> Subscription<K, V> {
	pub async fn recv(&mut self) -> Option<V> {
		self.receiver.recv().await
	}

	pub fn try_recv(&mut self) -> Option<V> {
		self.receiver.try_recv().ok()
	}
}

impl<K: Eq + Hash, V> Drop for Subscription<K, V> {
	fn drop(&mut self) {
		let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
		// Only remove the sender if it still belongs to this subscription.
		if callbacks
			.get(&self.key)
			.is_some_and(|sender| sender.same_channel(&self.sender))
		{
			callbacks.remove(&self.key);
		}
	}
}
