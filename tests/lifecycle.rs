mod common;

use common::{association_options, node, Event, FakeConnector, StorePeer};
use dicom::dictionary_std::uids;
use dicom_relay::association::{
	AssociationError, AssociationManager, AssociationState, NegotiationError, PresentationContexts,
};
use dicom_relay::node::Node;
use std::sync::Arc;
use std::time::Duration;

fn manager(connector: &FakeConnector) -> AssociationManager<FakeConnector> {
	AssociationManager::new(connector.clone(), association_options())
}

#[tokio::test]
async fn opening_an_open_association_is_rejected() {
	let connector = FakeConnector::new(StorePeer::new());
	let manager = manager(&connector);

	let lease = manager
		.open(&node(), PresentationContexts::verification())
		.await
		.unwrap();
	assert_eq!(manager.state(), AssociationState::Ready);

	let Err(err) = manager
		.open(&node(), PresentationContexts::verification())
		.await
	else {
		panic!("second open must fail");
	};
	assert!(matches!(err, AssociationError::NotIdle(AssociationState::Ready)));

	drop(lease);
	manager.close(false).await;
	assert_eq!(manager.state(), AssociationState::Idle);

	let log = connector.log();
	assert_eq!(log.connects, 1);
	assert_eq!(log.events, vec![Event::Connect(1), Event::Release(1)]);
}

#[tokio::test]
async fn failed_open_returns_to_idle() {
	let connector = FakeConnector::new(StorePeer::new()).refusing();
	let manager = manager(&connector);

	let result = manager
		.open(&node(), PresentationContexts::verification())
		.await;
	assert!(matches!(result, Err(AssociationError::Connect { .. })));
	assert_eq!(manager.state(), AssociationState::Idle);
	assert!(manager.lease().await.is_none());
	assert_eq!(connector.log().connects, 0);
}

#[tokio::test]
async fn rejected_proposal_is_a_negotiation_error() {
	let connector = FakeConnector::new(StorePeer::new()).rejecting(uids::VERIFICATION);
	let manager = manager(&connector);

	let result = manager
		.open(&node(), PresentationContexts::verification())
		.await;
	assert!(matches!(
		result,
		Err(AssociationError::Negotiation(NegotiationError::NoPresentationContext))
	));
	assert_eq!(manager.state(), AssociationState::Idle);
}

#[tokio::test]
async fn invalid_node_is_never_connected() {
	let connector = FakeConnector::new(StorePeer::new());
	let manager = manager(&connector);

	let result = manager
		.open(&Node::new("", "localhost", 104), PresentationContexts::verification())
		.await;
	assert!(matches!(result, Err(AssociationError::InvalidNode(_))));
	assert_eq!(manager.state(), AssociationState::Idle);
	assert_eq!(connector.log().connects, 0);
}

#[tokio::test]
async fn graceful_close_waits_for_outstanding_leases() {
	let connector = FakeConnector::new(StorePeer::new());
	let manager = Arc::new(manager(&connector));
	let lease = manager
		.open(&node(), PresentationContexts::verification())
		.await
		.unwrap();
	assert_eq!(manager.outstanding(), 1);

	let closing = tokio::spawn({
		let manager = Arc::clone(&manager);
		async move { manager.close(false).await }
	});
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(manager.state(), AssociationState::Releasing);
	assert_eq!(connector.log().releases(), 0);

	drop(lease);
	closing.await.unwrap();
	assert_eq!(manager.state(), AssociationState::Idle);
	assert_eq!(manager.outstanding(), 0);

	let log = connector.log();
	assert_eq!(log.releases(), 1);
	assert_eq!(log.aborts(), 0);
}

#[tokio::test]
async fn graceful_close_aborts_after_release_timeout() {
	let connector = FakeConnector::new(StorePeer::new());
	let mut options = association_options();
	options.release_timeout = Duration::from_millis(100);
	let manager = AssociationManager::new(connector.clone(), options);

	let _lease = manager
		.open(&node(), PresentationContexts::verification())
		.await
		.unwrap();
	manager.close(false).await;

	assert_eq!(manager.state(), AssociationState::Idle);
	let log = connector.log();
	assert_eq!(log.releases(), 0);
	assert_eq!(log.aborts(), 1);
}

#[tokio::test]
async fn waiting_for_outstanding_leases_times_out() {
	let connector = FakeConnector::new(StorePeer::new());
	let manager = manager(&connector);
	let timeout = Duration::from_millis(100);

	assert!(manager.wait_for_outstanding(timeout).await.is_ok());

	let lease = manager
		.open(&node(), PresentationContexts::verification())
		.await
		.unwrap();
	let result = manager.wait_for_outstanding(timeout).await;
	assert!(matches!(result, Err(AssociationError::Outstanding(waited)) if waited == timeout));

	drop(lease);
	assert!(manager.wait_for_outstanding(timeout).await.is_ok());
	manager.close(false).await;
	assert_eq!(connector.log().releases(), 1);
}

#[tokio::test]
async fn forced_close_does_not_wait() {
	let connector = FakeConnector::new(StorePeer::new());
	let manager = manager(&connector);

	let _lease = manager
		.open(&node(), PresentationContexts::verification())
		.await
		.unwrap();
	tokio::time::timeout(Duration::from_millis(500), manager.close(true))
		.await
		.expect("forced close returns immediately");

	assert_eq!(manager.state(), AssociationState::Idle);
	assert_eq!(connector.log().aborts(), 1);
}

#[tokio::test]
async fn reopen_replaces_the_association() {
	let connector = FakeConnector::new(StorePeer::new());
	let manager = manager(&connector);

	assert!(matches!(manager.reopen().await, Err(AssociationError::NotOpen)));

	let first = manager
		.open(&node(), PresentationContexts::verification())
		.await
		.unwrap();
	let first_id = *first.uuid();
	drop(first);

	let mut contexts = PresentationContexts::verification();
	contexts
		.add(uids::CT_IMAGE_STORAGE, [uids::EXPLICIT_VR_LITTLE_ENDIAN])
		.unwrap();
	let second = manager.reopen_with(Some(contexts)).await.unwrap();
	assert_ne!(*second.uuid(), first_id);
	assert_eq!(second.presentation_contexts().len(), 2);
	assert_eq!(manager.state(), AssociationState::Ready);
	drop(second);

	manager.close(false).await;
	let log = connector.log();
	assert_eq!(
		log.events,
		vec![
			Event::Connect(1),
			Event::Abort(1),
			Event::Connect(2),
			Event::Release(2)
		]
	);
	assert_eq!(manager.proposed_contexts().await.len(), 2);
}
