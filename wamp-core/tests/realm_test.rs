use anyhow::Result;
use wamp_core::{
    core::{
        error::InteractionError,
        uri::Uri,
    },
    peer::{
        Peer,
        PeerConfig,
        PeerNotConnectedError,
    },
    router::{
        EmptyPubSubPolicies,
        EmptyRpcPolicies,
        RealmConfig,
        Router,
        RouterConfig,
        RouterHandle,
    },
};

const REALM: &str = "com.example.realm";
const OTHER_REALM: &str = "com.example.other";

async fn start_router(dynamic_realms: bool) -> Result<RouterHandle> {
    let mut config = RouterConfig {
        dynamic_realms,
        ..Default::default()
    };
    config.realms.push(RealmConfig::dynamic(Uri::try_from(REALM)?));
    config
        .realms
        .push(RealmConfig::dynamic(Uri::try_from(OTHER_REALM)?));
    let router = Router::new(
        config,
        Box::new(EmptyPubSubPolicies::default()),
        Box::new(EmptyRpcPolicies::default()),
    )?;
    router.start().await
}

fn create_peer(name: &str) -> Result<Peer> {
    Peer::new(PeerConfig {
        name: name.to_owned(),
        ..Default::default()
    })
}

#[tokio::test]
async fn peer_joins_and_leaves_realm() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router(false).await.unwrap();
    let peer = create_peer("peer").unwrap();
    assert_matches::assert_matches!(peer.connect(&router_handle.url()).await, Ok(()));

    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(()));
    assert_matches::assert_matches!(peer.current_session_id().await, Some(_));
    assert_matches::assert_matches!(peer.leave_realm().await, Ok(()));
    pretty_assertions::assert_eq!(peer.current_session_id().await, None);

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn peer_joins_multiple_realms_over_one_connection() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router(false).await.unwrap();
    let peer = create_peer("peer").unwrap();
    assert_matches::assert_matches!(peer.connect(&router_handle.url()).await, Ok(()));

    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(()));
    assert_matches::assert_matches!(peer.leave_realm().await, Ok(()));
    assert_matches::assert_matches!(peer.join_realm(OTHER_REALM).await, Ok(()));
    assert_matches::assert_matches!(peer.leave_realm().await, Ok(()));
    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(()));

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn peer_cannot_join_missing_realm() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router(false).await.unwrap();
    let peer = create_peer("peer").unwrap();
    assert_matches::assert_matches!(peer.connect(&router_handle.url()).await, Ok(()));

    assert_matches::assert_matches!(peer.join_realm("com.example.missing").await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::NoSuchRealm));
    });

    // The router closes the connection after aborting.
    assert_matches::assert_matches!(peer.join_realm(REALM).await, Err(_));

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn peer_joins_dynamic_realm() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router(true).await.unwrap();
    let a = create_peer("a").unwrap();
    let b = create_peer("b").unwrap();
    assert_matches::assert_matches!(a.connect(&router_handle.url()).await, Ok(()));
    assert_matches::assert_matches!(b.connect(&router_handle.url()).await, Ok(()));

    assert_matches::assert_matches!(a.join_realm("com.example.dynamic").await, Ok(()));
    assert_matches::assert_matches!(b.join_realm("com.example.dynamic").await, Ok(()));

    // Both sessions share the realm.
    let mut subscription = b.subscribe("com.example.topic").await.unwrap();
    assert_matches::assert_matches!(
        a.publish("com.example.topic", Default::default()).await,
        Ok(())
    );
    assert_matches::assert_matches!(subscription.event_rx.recv().await, Ok(_));

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn peer_cannot_join_realm_with_invalid_uri() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router(true).await.unwrap();
    let peer = create_peer("peer").unwrap();
    assert_matches::assert_matches!(peer.connect(&router_handle.url()).await, Ok(()));

    assert_matches::assert_matches!(peer.join_realm("com.example#realm").await, Err(_));

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn peer_cannot_interact_without_session() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router(false).await.unwrap();
    let peer = create_peer("peer").unwrap();
    assert_matches::assert_matches!(peer.leave_realm().await, Err(err) => {
        assert!(err.is::<PeerNotConnectedError>(), "{err:?}");
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}
