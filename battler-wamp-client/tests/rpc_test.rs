use anyhow::Result;
use battler_wamp_client::{
    core::{
        cancel::CallCancelMode,
        error::{
            SessionError,
            WampError,
        },
        id::Id,
        invocation_policy::InvocationPolicy,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::{
        ErrorMessage,
        InterruptMessage,
        InvocationMessage,
        Message,
        MessageKind,
        RegisteredMessage,
        ResultMessage,
        UnregisteredMessage,
        WelcomeMessage,
    },
    peer::{
        CallOptions,
        Connection,
        ConnectionConfig,
        Invocation,
        ProcedureOptions,
        Registration,
        RpcCall,
        RpcYield,
    },
    transport::direct_transport::{
        DirectAcceptor,
        DirectEndpoint,
        DirectTransportFactory,
    },
};
use futures_util::FutureExt;

async fn establish() -> (Connection, DirectAcceptor, DirectEndpoint) {
    let (factory, mut acceptor) = DirectTransportFactory::new();
    let connection = Connection::new(
        ConnectionConfig {
            name: "rpc".to_owned(),
            endpoint: "direct://router".to_owned(),
            realm: Uri::try_from("com.battler.test").unwrap(),
            ..Default::default()
        },
        Box::new(factory),
    )
    .unwrap();
    let (opened, endpoint) = tokio::join!(connection.open(), async {
        let mut endpoint = acceptor.accept().await.unwrap();
        assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Hello(_)));
        endpoint
            .send(&Message::Welcome(WelcomeMessage {
                session: Id::try_from(1).unwrap(),
                details: Dictionary::default(),
            }))
            .unwrap();
        endpoint
    });
    opened.unwrap();
    (connection, acceptor, endpoint)
}

fn result_message(request: Id, arguments: List, progress: bool) -> Message {
    let mut details = Dictionary::default();
    if progress {
        details.insert("progress".to_owned(), Value::Bool(true));
    }
    Message::Result(ResultMessage {
        call_request: request,
        details,
        arguments,
        arguments_keyword: Dictionary::default(),
    })
}

async fn register<F, Fut>(
    connection: &Connection,
    endpoint: &mut DirectEndpoint,
    procedure: &str,
    registration: u64,
    options: ProcedureOptions,
    handler: F,
) -> (Registration, Dictionary)
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcYield>> + Send + 'static,
{
    let (registered, options) = tokio::join!(
        connection.register_with_options(WildcardUri::try_from(procedure).unwrap(), handler, options),
        async {
            let register = assert_matches::assert_matches!(
                endpoint.receive().await,
                Some(Message::Register(register)) => register
            );
            assert_eq!(register.procedure.as_ref(), procedure);
            endpoint
                .send(&Message::Registered(RegisteredMessage {
                    register_request: register.request,
                    registration: Id::try_from(registration).unwrap(),
                }))
                .unwrap();
            register.options
        }
    );
    (registered.unwrap(), options)
}

fn invocation_message(request: u64, registration: u64, arguments: List, details: Dictionary) -> Message {
    Message::Invocation(InvocationMessage {
        request: Id::try_from(request).unwrap(),
        registered_registration: Id::try_from(registration).unwrap(),
        details,
        arguments,
        arguments_keyword: Dictionary::default(),
    })
}

async fn sum(invocation: Invocation) -> Result<RpcYield> {
    let sum = invocation
        .arguments
        .iter()
        .filter_map(Value::integer)
        .sum::<u64>();
    Ok(RpcYield {
        arguments: List::from_iter([Value::Integer(sum)]),
        ..Default::default()
    })
}

#[tokio::test]
async fn calls_procedure_and_receives_result() {
    test_utils::setup::setup_test_environment();

    let (connection, _acceptor, mut endpoint) = establish().await;
    let rpc = connection
        .call(
            Uri::try_from("com.battler.add").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::Integer(1), Value::Integer(2)]),
                options: CallOptions {
                    timeout: Some(std::time::Duration::from_secs(2)),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let call = assert_matches::assert_matches!(
        endpoint.receive().await,
        Some(Message::Call(call)) => call
    );
    assert_eq!(call.request, rpc.request_id());
    assert_eq!(call.procedure.as_ref(), "com.battler.add");
    assert_eq!(call.options.get("timeout"), Some(&Value::Integer(2000)));
    endpoint
        .send(&result_message(
            call.request,
            List::from_iter([Value::Integer(3)]),
            false,
        ))
        .unwrap();
    assert_matches::assert_matches!(rpc.result().await, Ok(result) => {
        pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Integer(3)]));
        assert!(!result.progress());
    });
}

#[tokio::test]
async fn call_error_fails_call() {
    test_utils::setup::setup_test_environment();

    let (connection, _acceptor, mut endpoint) = establish().await;
    let rpc = connection
        .call(Uri::try_from("com.battler.missing").unwrap(), RpcCall::default())
        .await
        .unwrap();
    let call = assert_matches::assert_matches!(
        endpoint.receive().await,
        Some(Message::Call(call)) => call
    );
    endpoint
        .send(&Message::Error(ErrorMessage {
            request_type: MessageKind::Call.tag(),
            request: call.request,
            error: Uri::try_from("wamp.error.no_such_procedure").unwrap(),
            arguments: List::from_iter([Value::String("no such procedure".to_owned())]),
            ..Default::default()
        }))
        .unwrap();
    assert_matches::assert_matches!(rpc.result().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(err) => {
            assert_eq!(err.reason.as_ref(), "wamp.error.no_such_procedure");
            assert_eq!(err.message(), Some("no such procedure"));
        });
    });
}

#[tokio::test]
async fn call_and_wait_follows_progressive_results() {
    test_utils::setup::setup_test_environment();

    let (connection, _acceptor, mut endpoint) = establish().await;
    let (result, ()) = tokio::join!(
        connection.call_and_wait(
            Uri::try_from("com.battler.count").unwrap(),
            RpcCall {
                options: CallOptions {
                    receive_progress: true,
                    ..Default::default()
                },
                ..Default::default()
            },
        ),
        async {
            let call = assert_matches::assert_matches!(
                endpoint.receive().await,
                Some(Message::Call(call)) => call
            );
            assert_eq!(call.options.get("receive_progress"), Some(&Value::Bool(true)));
            for i in 1..=2 {
                endpoint
                    .send(&result_message(
                        call.request,
                        List::from_iter([Value::Integer(i)]),
                        true,
                    ))
                    .unwrap();
            }
            endpoint
                .send(&result_message(
                    call.request,
                    List::from_iter([Value::Integer(3)]),
                    false,
                ))
                .unwrap();
        }
    );
    assert_matches::assert_matches!(result, Ok(result) => {
        pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Integer(3)]));
    });
}

#[tokio::test]
async fn cancels_pending_call() {
    test_utils::setup::setup_test_environment();

    let (connection, _acceptor, mut endpoint) = establish().await;
    let rpc = connection
        .call(Uri::try_from("com.battler.slow").unwrap(), RpcCall::default())
        .await
        .unwrap();
    let call = assert_matches::assert_matches!(
        endpoint.receive().await,
        Some(Message::Call(call)) => call
    );
    connection
        .cancel_call(rpc.request_id(), Some(CallCancelMode::Kill))
        .await
        .unwrap();
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Cancel(cancel)) => {
        assert_eq!(cancel.call_request, call.request);
        assert_eq!(cancel.options.get("mode"), Some(&Value::String("kill".to_owned())));
    });
    endpoint
        .send(&Message::Error(ErrorMessage {
            request_type: MessageKind::Call.tag(),
            request: call.request,
            error: Uri::try_from("wamp.error.canceled").unwrap(),
            ..Default::default()
        }))
        .unwrap();
    assert_matches::assert_matches!(rpc.result().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(err) => {
            assert_eq!(err.reason.as_ref(), "wamp.error.canceled");
        });
    });
    assert_matches::assert_matches!(
        connection.cancel_call(call.request, None).await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<SessionError>(),
                Some(SessionError::NoSuchPendingCall)
            );
        }
    );
}

#[tokio::test]
async fn pending_call_fails_when_session_closes() {
    test_utils::setup::setup_test_environment();

    let (connection, _acceptor, mut endpoint) = establish().await;
    let rpc = connection
        .call(Uri::try_from("com.battler.slow").unwrap(), RpcCall::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Call(_)));
    endpoint.fail("connection reset");
    assert_matches::assert_matches!(rpc.result().await, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Closing(_))
        );
    });
}

#[tokio::test]
async fn invokes_registered_procedure() {
    test_utils::setup::setup_test_environment();

    let (connection, _acceptor, mut endpoint) = establish().await;
    let (registration, options) = register(
        &connection,
        &mut endpoint,
        "com.battler.add",
        10,
        ProcedureOptions {
            invocation_policy: InvocationPolicy::RoundRobin,
            ..Default::default()
        },
        sum,
    )
    .await;
    assert_eq!(registration.id(), Id::try_from(10).unwrap());
    assert_eq!(options.get("invoke"), Some(&Value::String("roundrobin".to_owned())));

    endpoint
        .send(&invocation_message(
            1,
            10,
            List::from_iter([Value::Integer(2), Value::Integer(3)]),
            Dictionary::default(),
        ))
        .unwrap();
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Yield(message)) => {
        assert_eq!(message.invocation_request, Id::try_from(1).unwrap());
        assert!(message.options.is_empty());
        pretty_assertions::assert_eq!(message.arguments, List::from_iter([Value::Integer(5)]));
    });
}

#[tokio::test]
async fn sends_progressive_yields_when_caller_accepts_them() {
    test_utils::setup::setup_test_environment();

    async fn count(invocation: Invocation) -> Result<RpcYield> {
        assert!(invocation.receive_progress);
        let last = async {
            Ok(RpcYield {
                arguments: List::from_iter([Value::Integer(2)]),
                ..Default::default()
            })
        };
        Ok(RpcYield {
            arguments: List::from_iter([Value::Integer(1)]),
            next_yield: Some(last.boxed()),
            ..Default::default()
        })
    }

    let (connection, _acceptor, mut endpoint) = establish().await;
    register(
        &connection,
        &mut endpoint,
        "com.battler.count",
        11,
        ProcedureOptions::default(),
        count,
    )
    .await;

    endpoint
        .send(&invocation_message(
            2,
            11,
            List::default(),
            Dictionary::from_iter([("receive_progress".to_owned(), Value::Bool(true))]),
        ))
        .unwrap();
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Yield(message)) => {
        assert_eq!(message.options.get("progress"), Some(&Value::Bool(true)));
        pretty_assertions::assert_eq!(message.arguments, List::from_iter([Value::Integer(1)]));
    });
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Yield(message)) => {
        assert!(message.options.is_empty());
        pretty_assertions::assert_eq!(message.arguments, List::from_iter([Value::Integer(2)]));
    });
}

#[tokio::test]
async fn reports_handler_errors_to_router() {
    test_utils::setup::setup_test_environment();

    async fn fail(_: Invocation) -> Result<RpcYield> {
        Err(WampError::new(Uri::try_from("com.battler.error.bad_input").unwrap()).into())
    }

    let (connection, _acceptor, mut endpoint) = establish().await;
    register(
        &connection,
        &mut endpoint,
        "com.battler.fail",
        12,
        ProcedureOptions::default(),
        fail,
    )
    .await;

    endpoint
        .send(&invocation_message(3, 12, List::default(), Dictionary::default()))
        .unwrap();
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Error(error)) => {
        assert_eq!(error.request_type, MessageKind::Invocation.tag());
        assert_eq!(error.request, Id::try_from(3).unwrap());
        assert_eq!(error.error.as_ref(), "com.battler.error.bad_input");
    });
}

#[tokio::test]
async fn interrupt_cancels_running_invocation() {
    test_utils::setup::setup_test_environment();

    async fn wait_for_cancellation(invocation: Invocation) -> Result<RpcYield> {
        invocation.cancellation().canceled().await;
        Err(WampError::new(Uri::try_from("wamp.error.canceled").unwrap()).into())
    }

    let (connection, _acceptor, mut endpoint) = establish().await;
    register(
        &connection,
        &mut endpoint,
        "com.battler.slow",
        13,
        ProcedureOptions::default(),
        wait_for_cancellation,
    )
    .await;

    endpoint
        .send(&invocation_message(4, 13, List::default(), Dictionary::default()))
        .unwrap();
    endpoint
        .send(&Message::Interrupt(InterruptMessage {
            invocation_request: Id::try_from(4).unwrap(),
            options: Dictionary::from_iter([(
                "mode".to_owned(),
                Value::String("kill".to_owned()),
            )]),
        }))
        .unwrap();
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Error(error)) => {
        assert_eq!(error.request, Id::try_from(4).unwrap());
        assert_eq!(error.error.as_ref(), "wamp.error.canceled");
    });
}

#[tokio::test]
async fn unregisters_procedure() {
    test_utils::setup::setup_test_environment();

    let (connection, _acceptor, mut endpoint) = establish().await;
    let (registration, _) = register(
        &connection,
        &mut endpoint,
        "com.battler.add",
        14,
        ProcedureOptions::default(),
        sum,
    )
    .await;

    let (unregistered, ()) = tokio::join!(connection.unregister(&registration), async {
        assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Unregister(unregister)) => {
            assert_eq!(unregister.registered_registration, Id::try_from(14).unwrap());
            endpoint
                .send(&Message::Unregistered(UnregisteredMessage {
                    unregister_request: unregister.request.value(),
                    details: Dictionary::default(),
                }))
                .unwrap();
        });
    });
    assert_matches::assert_matches!(unregistered, Ok(()));
    assert_matches::assert_matches!(registration.unregistered().await, Ok(()));

    // Invocations for the old registration are now violations.
    endpoint
        .send(&invocation_message(5, 14, List::default(), Dictionary::default()))
        .unwrap();
    assert_matches::assert_matches!(endpoint.receive().await, Some(Message::Abort(abort)) => {
        assert_eq!(
            abort.details.get("message"),
            Some(&Value::String("unexpected INVOCATION".to_owned()))
        );
    });
}
