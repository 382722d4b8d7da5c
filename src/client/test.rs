use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Bson},
    cmap::Connector,
    error::{Error, ErrorKind},
    event::command::CommandEvent,
    operation::RunCommand,
    options::{ClientOptions, ListDatabasesOptions},
    test::{mock_options, EventRecorder, Failure, MockDeployment, TestClient},
    Client,
    ClientSession,
};

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_the_client() {
    TestClient::new()
        .run(|client, _| async move {
            client.shutdown().await.unwrap();
            // A second shutdown is a no-op.
            client.shutdown().await.unwrap();

            let error = client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
                .unwrap_err();
            assert!(error.is_logic_error());
            assert!(client.start_session(None).unwrap_err().is_logic_error());
            assert!(client.acquire_connection(None).await.unwrap_err().is_logic_error());
            assert_eq!(client.pool_status().total, 0);
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_compare_by_identity() {
    TestClient::new()
        .run(|first, _| async move {
            TestClient::new()
                .run(|second, _| async move {
                    assert_eq!(first.clone(), first);
                    assert_ne!(first, second);
                    assert_ne!(first.id(), second.id());
                })
                .await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uri_options_fill_in_unset_fields() {
    let deployment = MockDeployment::default();
    let mut options = mock_options(&deployment);
    options.thread_pool_size = Some(2);

    let client = Client::with_uri_str(
        "mongodb://ignored.test:27017/inventory?maxPoolSize=7&threadPoolSize=3&appName=reports",
        options,
    )
    .unwrap();

    TestClient { client, deployment }
        .run(|client, deployment| async move {
            let options = client.options();
            assert_eq!(options.hosts, vec![deployment.address()]);
            assert_eq!(options.thread_pool_size, Some(2));
            assert_eq!(options.max_pool_size, Some(7));
            assert_eq!(options.app_name.as_deref(), Some("reports"));
            assert_eq!(options.default_database.as_deref(), Some("inventory"));
            assert_eq!(client.pool_status().max_pool_size, 7);
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uri_hosts_apply_when_builder_sets_none() {
    let deployment = MockDeployment::default();
    let options = ClientOptions::builder()
        .max_pool_size(50u32)
        .connector(Arc::new(deployment.clone()) as Arc<dyn Connector>)
        .build();

    let client = Client::with_uri_str(
        format!("mongodb://{}/?heartbeatFrequencyMS=500", deployment.address()),
        options,
    )
    .unwrap();

    TestClient { client, deployment }
        .run(|client, deployment| async move {
            let options = client.options();
            assert_eq!(options.hosts, vec![deployment.address()]);
            assert_eq!(options.max_pool_size, Some(50));
            client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
                .unwrap();
            assert_eq!(deployment.commands_named("ping").len(), 1);
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_options_are_rejected() {
    let mut options = mock_options(&MockDeployment::default());
    options.max_pool_size = Some(0);
    let error = Client::with_options(options).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));

    let error = Client::with_uri_str("postgres://localhost", None).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn list_databases_in_both_shapes() {
    TestClient::new()
        .run(|client, deployment| async move {
            let names = client.list_database_names(None, None, None).await.unwrap();
            assert_eq!(names, vec!["admin", "inventory"]);

            let specs = client
                .list_databases(
                    doc! { "name": "inventory" },
                    ListDatabasesOptions::builder()
                        .authorized_databases(true)
                        .build(),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(specs.len(), 2);
            assert_eq!(specs[0].name, "admin");
            assert_eq!(specs[0].size_on_disk, 40960);
            assert_eq!(specs[1].size_on_disk, 8192);

            let databases = client.list_mongo_databases(None, None, None).await.unwrap();
            let db_names: Vec<&str> = databases.iter().map(|db| db.name()).collect();
            assert_eq!(db_names, vec!["admin", "inventory"]);

            let sent = deployment.commands_named("listDatabases");
            assert_eq!(sent.len(), 3);
            assert_eq!(sent[0].get_bool("nameOnly"), Ok(true));
            assert_eq!(sent[1].get_bool("nameOnly"), Ok(false));
            assert_eq!(sent[1].get_document("filter"), Ok(&doc! { "name": "inventory" }));
            assert_eq!(sent[1].get_bool("authorizedDatabases"), Ok(true));
            assert_eq!(sent[1].get_str("$db"), Ok("admin"));
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn command_events_are_published() {
    TestClient::new()
        .run(|client, deployment| async move {
            let recorder = Arc::new(EventRecorder::default());
            client.add_command_event_handler(&recorder);

            let callback_names = Arc::new(Mutex::new(Vec::new()));
            let sink = callback_names.clone();
            client.add_command_event_callback(move |event| {
                sink.lock().unwrap().push(event.command_name().to_string());
            });

            let db = client.database("inventory");
            db.run_command(doc! { "ping": 1 }, None).await.unwrap();
            deployment.fail_next(
                "ping",
                Failure::Command {
                    code: 8000,
                    message: "nope".to_string(),
                },
            );
            db.run_command(doc! { "ping": 1 }, None).await.unwrap_err();

            let events = recorder.events();
            assert_eq!(events.len(), 4);
            match (&events[0], &events[1]) {
                (CommandEvent::Started(started), CommandEvent::Succeeded(succeeded)) => {
                    assert_eq!(started.command_name, "ping");
                    assert_eq!(started.db, "inventory");
                    assert_eq!(started.command.get_str("$db"), Ok("inventory"));
                    assert_eq!(started.request_id, succeeded.request_id);
                    assert_eq!(succeeded.reply.get("ok"), Some(&Bson::Int32(1)));
                    assert_eq!(started.connection.address, deployment.address());
                }
                other => panic!("expected started then succeeded, got {other:?}"),
            }
            match &events[3] {
                CommandEvent::Failed(failed) => {
                    assert_eq!(failed.command_name, "ping");
                    assert!(failed.failure.is_command_error());
                }
                other => panic!("expected a failed event, got {other:?}"),
            }
            assert_eq!(*callback_names.lock().unwrap(), vec!["ping"; 4]);

            // Handlers are held weakly.
            drop(recorder);
            db.run_command(doc! { "ping": 1 }, None).await.unwrap();
            assert_eq!(callback_names.lock().unwrap().len(), 6);
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn session_from_another_client_is_rejected() {
    TestClient::new()
        .run(|owner, _| async move {
            let session = owner.start_session(None).unwrap();
            TestClient::new()
                .run(|other, deployment| {
                    let session = session.clone();
                    async move {
                        let error = other
                            .database("inventory")
                            .run_command(doc! { "ping": 1 }, Some(&session))
                            .await
                            .unwrap_err();
                        assert!(error.is_logic_error());
                        assert!(deployment.commands().is_empty());
                    }
                })
                .await;
            session.end().await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ended_session_cannot_be_used() {
    TestClient::new()
        .run(|client, _| async move {
            let session = client.start_session(None).unwrap();
            session.end().await;
            let error = client
                .database("inventory")
                .run_command(doc! { "ping": 1 }, Some(&session))
                .await
                .unwrap_err();
            assert_eq!(error.kind.to_string(), "Logic error: Tried to use an ended session");
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn with_session_ends_the_session() {
    TestClient::new()
        .run(|client, deployment| async move {
            let captured: Arc<Mutex<Option<ClientSession>>> = Default::default();
            let db = client.database("inventory");

            let slot = captured.clone();
            let reply = client
                .with_session(None, move |session| {
                    *slot.lock().unwrap() = Some(session.clone());
                    Ok(async move { db.run_command(doc! { "ping": 1 }, Some(&session)).await })
                })
                .await
                .unwrap();
            assert_eq!(reply.get("ok"), Some(&Bson::Int32(1)));

            let session = captured.lock().unwrap().take().unwrap();
            assert!(session.is_ended());
            assert_eq!(
                deployment.commands_named("ping")[0].get_document("lsid"),
                Ok(session.id())
            );
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn with_session_ends_the_session_when_the_body_fails() {
    TestClient::new()
        .run(|client, _| async move {
            let captured: Arc<Mutex<Option<ClientSession>>> = Default::default();

            let slot = captured.clone();
            let error = client
                .with_session(None, move |session| {
                    *slot.lock().unwrap() = Some(session);
                    Err::<std::future::Ready<crate::error::Result<()>>, _>(Error::internal(
                        "body could not start",
                    ))
                })
                .await
                .unwrap_err();
            assert!(matches!(*error.kind, ErrorKind::Internal { .. }));

            let session = captured.lock().unwrap().take().unwrap();
            assert!(session.is_ended());
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn with_session_ends_the_session_when_the_body_future_fails() {
    TestClient::new()
        .run(|client, deployment| async move {
            let captured: Arc<Mutex<Option<ClientSession>>> = Default::default();
            let db = client.database("inventory");
            deployment.fail_next(
                "ping",
                Failure::Command {
                    code: 8000,
                    message: "ping refused".to_string(),
                },
            );

            let slot = captured.clone();
            let error = client
                .with_session(None, move |session| {
                    *slot.lock().unwrap() = Some(session.clone());
                    Ok(async move { db.run_command(doc! { "ping": 1 }, Some(&session)).await })
                })
                .await
                .unwrap_err();
            match *error.kind {
                ErrorKind::Command(ref command_error) => {
                    assert_eq!(command_error.code, 8000);
                    assert_eq!(command_error.message, "ping refused");
                }
                ref other => panic!("expected a command error, got {other:?}"),
            }

            let session = captured.lock().unwrap().take().unwrap();
            assert!(session.is_ended());
            assert_eq!(client.pool_status().in_use, 0);
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn operation_runs_on_supplied_connection() {
    TestClient::new()
        .run(|client, _| async move {
            let recorder = Arc::new(EventRecorder::default());
            client.add_command_event_handler(&recorder);

            let connection = client.acquire_connection(None).await.unwrap();
            let connection_id = connection.id();
            assert_eq!(client.pool_status().in_use, 1);

            let op = RunCommand::new("inventory".to_string(), doc! { "ping": 1 }, None);
            client.execute_operation(op, connection, None).await.unwrap();

            let started = recorder.started("ping");
            assert_eq!(started.len(), 1);
            assert_eq!(started[0].connection.id, connection_id);
            assert_eq!(client.pool_status().in_use, 0);
            assert_eq!(client.pool_status().available, 1);
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn network_error_discards_the_connection() {
    TestClient::new()
        .run(|client, deployment| async move {
            let db = client.database("inventory");
            db.run_command(doc! { "ping": 1 }, None).await.unwrap();
            assert_eq!(client.pool_status().total, 1);

            deployment.fail_next("ping", Failure::Network);
            let error = db.run_command(doc! { "ping": 1 }, None).await.unwrap_err();
            assert!(error.is_network_error());
            assert_eq!(client.pool_status().total, 0);

            // The monitor checks the server again right away, after which it is selectable.
            let mut recovered = None;
            for _ in 0..40 {
                match db.run_command(doc! { "ping": 1 }, None).await {
                    Ok(reply) => {
                        recovered = Some(reply);
                        break;
                    }
                    Err(error) => {
                        assert!(error.is_network_error());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            assert!(recovered.is_some());
            assert_eq!(client.pool_status().total, 1);
        })
        .await;
}
