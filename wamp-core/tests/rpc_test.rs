use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    sync::broadcast::error::RecvError,
    task::JoinHandle,
};
use wamp_core::{
    auth::anonymous::AnonymousClientAuthenticator,
    core::{
        error::{
            BasicError,
            InteractionError,
            WampError,
        },
        invocation_policy::InvocationPolicy,
        match_style::MatchStyle,
        types::{
            List,
            Value,
        },
        uri::Uri,
    },
    peer::{
        Invocation,
        Peer,
        PeerConfig,
        Procedure,
        ProcedureOptions,
        RpcCall,
        RpcYield,
    },
    router::{
        EmptyPubSubPolicies,
        EmptyRpcPolicies,
        RealmConfig,
        Router,
        RouterConfig,
        RouterHandle,
        RpcPolicies,
        SessionInfo,
    },
};

const REALM: &str = "com.example.realm";

async fn start_router_with_policies(rpc_policies: Box<dyn RpcPolicies>) -> Result<RouterHandle> {
    let mut config = RouterConfig::default();
    config.realms.push(RealmConfig::dynamic(Uri::try_from(REALM)?));
    let router = Router::new(
        config,
        Box::new(EmptyPubSubPolicies::default()),
        rpc_policies,
    )?;
    router.start().await
}

async fn start_router() -> Result<RouterHandle> {
    start_router_with_policies(Box::new(EmptyRpcPolicies::default())).await
}

async fn connect_peer(name: &str, router_handle: &RouterHandle) -> Result<Peer> {
    let peer = Peer::new(PeerConfig {
        name: name.to_owned(),
        ..Default::default()
    })?;
    peer.connect(&router_handle.url()).await?;
    peer.join_realm(REALM).await?;
    Ok(peer)
}

fn integers(values: &[Value]) -> Result<Vec<u64>> {
    values
        .iter()
        .map(|value| {
            value
                .integer()
                .ok_or_else(|| Error::msg(format!("expected integer, got {value:?}")))
        })
        .collect()
}

fn add(invocation: &Invocation) -> Result<RpcYield> {
    let values = integers(invocation.payload.arguments())?;
    if values.is_empty() {
        return Err(WampError::new(
            Uri::try_from("com.example.error.no_operands")?,
            "nothing to add",
        )
        .into());
    }
    Ok(RpcYield {
        arguments: List::from_iter([Value::Integer(values.into_iter().sum())]),
        ..Default::default()
    })
}

fn serve<F>(mut procedure: Procedure, handler: F) -> JoinHandle<()>
where
    F: Fn(&Invocation) -> Result<RpcYield> + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(invocation) = procedure.invocation_rx.recv().await {
            let result = handler(&invocation);
            invocation.respond(result).ok();
        }
    })
}

fn integer_call(values: &[u64]) -> RpcCall {
    RpcCall {
        arguments: values.iter().map(|value| Value::Integer(*value)).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn caller_receives_callee_result() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let procedure = callee.register("com.example.add").await.unwrap();
    let handler = serve(procedure, add);

    assert_matches::assert_matches!(caller.call("com.example.add", integer_call(&[1, 2, 3])).await, Ok(result) => {
        pretty_assertions::assert_eq!(result.payload.arguments(), &List::from_iter([Value::Integer(6)]));
        assert!(!result.progress);
    });

    // Calls may run concurrently.
    let results = futures_util::future::join_all(
        (0..5).map(|i| caller.call("com.example.add", integer_call(&[i, 10]))),
    )
    .await;
    for (i, result) in results.into_iter().enumerate() {
        assert_matches::assert_matches!(result, Ok(result) => {
            pretty_assertions::assert_eq!(
                result.payload.arguments(),
                &List::from_iter([Value::Integer(i as u64 + 10)])
            );
        });
    }

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
    handler.await.unwrap();
}

#[tokio::test]
async fn callee_errors_reach_caller() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let procedure = callee.register("com.example.add").await.unwrap();
    let handler = serve(procedure, add);

    assert_matches::assert_matches!(caller.call("com.example.add", RpcCall::default()).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<WampError>(), Ok(err) => {
            pretty_assertions::assert_eq!(err.uri().as_ref(), "com.example.error.no_operands");
            pretty_assertions::assert_eq!(err.to_string(), "nothing to add");
        });
    });

    // Errors that are not application-defined are internal.
    assert_matches::assert_matches!(
        caller
            .call(
                "com.example.add",
                RpcCall {
                    arguments: List::from_iter([Value::String("one".to_owned())]),
                    ..Default::default()
                }
            )
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast::<BasicError>(), Ok(BasicError::Internal(_)));
        }
    );

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
    handler.await.unwrap();
}

#[tokio::test]
async fn calling_missing_procedure_fails() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    assert_matches::assert_matches!(caller.call("com.example.missing", RpcCall::default()).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::NoSuchProcedure));
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn progressive_results_arrive_in_order() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let mut procedure = callee.register("com.example.count").await.unwrap();
    let handler = tokio::spawn(async move {
        while let Ok(invocation) = procedure.invocation_rx.recv().await {
            let count = invocation
                .payload
                .arguments()
                .first()
                .and_then(Value::integer)
                .unwrap_or_default();
            for i in 1..count {
                invocation
                    .progress(RpcYield {
                        arguments: List::from_iter([Value::Integer(i)]),
                        ..Default::default()
                    })
                    .unwrap();
            }
            invocation
                .respond_ok(RpcYield {
                    arguments: List::from_iter([Value::Integer(count)]),
                    ..Default::default()
                })
                .unwrap();
        }
    });

    let pending = caller
        .call_with_progress("com.example.count", integer_call(&[3]))
        .await
        .unwrap();
    let results = pending
        .into_stream()
        .map(|result| {
            result.map(|result| (result.payload.arguments().to_vec(), result.progress))
        })
        .collect::<Vec<_>>()
        .await;
    assert_matches::assert_matches!(results.as_slice(), [Ok(first), Ok(second), Ok(last)] => {
        pretty_assertions::assert_eq!(first, &(Vec::from_iter([Value::Integer(1)]), true));
        pretty_assertions::assert_eq!(second, &(Vec::from_iter([Value::Integer(2)]), true));
        pretty_assertions::assert_eq!(last, &(Vec::from_iter([Value::Integer(3)]), false));
    });

    // Plain calls skip progressive results entirely.
    assert_matches::assert_matches!(caller.call("com.example.count", integer_call(&[2])).await, Ok(result) => {
        pretty_assertions::assert_eq!(result.payload.arguments(), &List::from_iter([Value::Integer(2)]));
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
    handler.await.unwrap();
}

#[tokio::test]
async fn callee_cannot_send_progress_when_not_requested() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let procedure = callee.register("com.example.echo").await.unwrap();
    let handler = serve(procedure, |invocation| {
        match invocation.progress(RpcYield::default()) {
            Ok(()) => Err(Error::msg("progress was allowed")),
            Err(_) => Ok(RpcYield {
                arguments: invocation.payload.arguments().to_vec(),
                ..Default::default()
            }),
        }
    });

    assert_matches::assert_matches!(caller.call("com.example.echo", integer_call(&[1])).await, Ok(result) => {
        pretty_assertions::assert_eq!(result.payload.arguments(), &List::from_iter([Value::Integer(1)]));
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
    handler.await.unwrap();
}

#[tokio::test]
async fn pending_call_is_canceled_when_callee_leaves() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let mut procedure = callee.register("com.example.slow").await.unwrap();
    let pending = caller
        .call_with_progress("com.example.slow", RpcCall::default())
        .await
        .unwrap();

    // The invocation is held and never answered.
    let _invocation = procedure.invocation_rx.recv().await.unwrap();
    assert_matches::assert_matches!(callee.leave_realm().await, Ok(()));

    assert_matches::assert_matches!(
        tokio::time::timeout(Duration::from_secs(5), pending.result()).await,
        Ok(Err(err)) => {
            assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::Canceled(message)) => {
                pretty_assertions::assert_eq!(message, "callee disconnected");
            });
        }
    );

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn procedure_cannot_be_registered_twice() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let a = connect_peer("a", &router_handle).await.unwrap();
    let b = connect_peer("b", &router_handle).await.unwrap();

    assert_matches::assert_matches!(a.register("com.example.add").await, Ok(_));
    assert_matches::assert_matches!(b.register("com.example.add").await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::ProcedureAlreadyExists));
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[derive(Default)]
struct OwnerRegistersOnly {}

#[async_trait]
impl RpcPolicies for OwnerRegistersOnly {
    async fn authorize_register(
        &self,
        session: &SessionInfo,
        _: &Uri,
        _: MatchStyle,
    ) -> Result<bool> {
        Ok(session.identity.id == "owner")
    }
}

async fn connect_peer_as(id: &str, router_handle: &RouterHandle) -> Result<Peer> {
    let peer = Peer::new(PeerConfig {
        name: id.to_owned(),
        ..Default::default()
    })?;
    peer.connect(&router_handle.url()).await?;
    peer.join_realm_with_authentication(
        REALM,
        Box::new(AnonymousClientAuthenticator::with_id(id.to_owned())),
    )
    .await?;
    Ok(peer)
}

#[tokio::test]
async fn registered_procedure_is_reported_before_authorization() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router_with_policies(Box::new(OwnerRegistersOnly::default()))
        .await
        .unwrap();
    let owner = connect_peer_as("owner", &router_handle).await.unwrap();
    let intruder = connect_peer_as("intruder", &router_handle).await.unwrap();

    assert_matches::assert_matches!(owner.register("com.example.add").await, Ok(_));
    assert_matches::assert_matches!(intruder.register("com.example.add").await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::ProcedureAlreadyExists));
    });
    assert_matches::assert_matches!(intruder.register("com.example.other").await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::NotAuthorized(_)));
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn callee_keeps_serving_after_caller_leaves() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let mut procedure = callee.register("com.example.add").await.unwrap();
    let pending = caller
        .call_with_progress("com.example.add", integer_call(&[1, 2]))
        .await
        .unwrap();
    let invocation = procedure.invocation_rx.recv().await.unwrap();

    drop(pending);
    assert_matches::assert_matches!(caller.leave_realm().await, Ok(()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The answer to the abandoned invocation is dropped without ending the callee's session.
    let result = add(&invocation);
    assert_matches::assert_matches!(invocation.respond(result), Ok(()));

    let handler = serve(procedure, add);
    let caller = connect_peer("caller", &router_handle).await.unwrap();
    assert_matches::assert_matches!(caller.call("com.example.add", integer_call(&[3, 4])).await, Ok(result) => {
        pretty_assertions::assert_eq!(result.payload.arguments(), &List::from_iter([Value::Integer(7)]));
    });
    assert!(callee.current_session_id().await.is_some());

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
    handler.await.unwrap();
}

#[tokio::test]
async fn force_reregister_revokes_previous_callee() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let a = connect_peer("a", &router_handle).await.unwrap();
    let b = connect_peer("b", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let mut a_procedure = a.register("com.example.add").await.unwrap();
    let b_procedure = b
        .register_with_options(
            "com.example.add",
            ProcedureOptions {
                force_reregister: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_matches::assert_matches!(
        tokio::time::timeout(Duration::from_secs(5), a_procedure.invocation_rx.recv()).await,
        Ok(Err(RecvError::Closed))
    );

    let handler = serve(b_procedure, add);
    assert_matches::assert_matches!(caller.call("com.example.add", integer_call(&[2, 2])).await, Ok(result) => {
        pretty_assertions::assert_eq!(result.payload.arguments(), &List::from_iter([Value::Integer(4)]));
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
    handler.await.unwrap();
}

#[tokio::test]
async fn shared_registration_rotates_callees() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();
    let mut callees = Vec::new();
    let mut handlers = Vec::new();
    for name in ["a", "b"] {
        let callee = connect_peer(name, &router_handle).await.unwrap();
        let procedure = callee
            .register_with_options(
                "com.example.whoami",
                ProcedureOptions {
                    invocation_policy: InvocationPolicy::RoundRobin,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        handlers.push(serve(procedure, move |_| {
            Ok(RpcYield {
                arguments: List::from_iter([Value::String(name.to_owned())]),
                ..Default::default()
            })
        }));
        callees.push(callee);
    }

    // A shared registration only accepts callees with the same policy.
    let other = connect_peer("other", &router_handle).await.unwrap();
    assert_matches::assert_matches!(other.register("com.example.whoami").await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::ProcedureAlreadyExists));
    });

    let mut names = Vec::new();
    for _ in 0..4 {
        let result = caller
            .call("com.example.whoami", RpcCall::default())
            .await
            .unwrap();
        names.push(result.payload.arguments()[0].string().unwrap().to_owned());
    }
    pretty_assertions::assert_eq!(names, Vec::from_iter(["a", "b", "a", "b"]));

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
    for handler in handlers {
        handler.await.unwrap();
    }
}

#[tokio::test]
async fn pattern_registration_discloses_procedure_and_caller() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let mut procedure = callee
        .register_with_options(
            "com.example..get",
            ProcedureOptions {
                match_style: Some(MatchStyle::Wildcard),
                disclose_caller: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pending = caller
        .call_with_progress("com.example.user.get", RpcCall::default())
        .await
        .unwrap();
    let invocation = procedure.invocation_rx.recv().await.unwrap();
    pretty_assertions::assert_eq!(invocation.procedure(), Some("com.example.user.get"));
    pretty_assertions::assert_eq!(invocation.caller(), caller.current_session_id().await);
    assert!(invocation.receive_progress());
    invocation.respond_ok(RpcYield::default()).unwrap();
    assert_matches::assert_matches!(pending.result().await, Ok(_));

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn unregistering_closes_invocation_stream() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let callee = connect_peer("callee", &router_handle).await.unwrap();
    let caller = connect_peer("caller", &router_handle).await.unwrap();

    let mut procedure = callee.register("com.example.add").await.unwrap();
    assert_matches::assert_matches!(callee.unregister(procedure.id).await, Ok(()));
    assert_matches::assert_matches!(procedure.invocation_rx.recv().await, Err(RecvError::Closed));

    assert_matches::assert_matches!(caller.call("com.example.add", RpcCall::default()).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::NoSuchProcedure));
    });
    assert_matches::assert_matches!(callee.unregister(procedure.id).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<InteractionError>(), Ok(InteractionError::NoSuchRegistration));
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}
