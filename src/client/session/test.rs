use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Bson, Timestamp},
    client::session::{ClusterTime, TransactionState},
    error::ErrorKind,
    options::{SessionOptions, TransactionOptions, WriteConcern},
    test::{EventRecorder, TestClient},
};

fn logic_message(error: crate::error::Error) -> String {
    match *error.kind {
        ErrorKind::Logic { message } => message,
        other => panic!("expected a logic error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn end_is_idempotent() {
    TestClient::new()
        .run(|client, _| async move {
            let session = client.start_session(None).unwrap();
            assert!(!session.is_ended());
            session.end().await;
            session.end().await;
            assert!(session.is_ended());

            let error = client
                .database("inventory")
                .run_command(doc! { "ping": 1 }, Some(&session))
                .await
                .unwrap_err();
            assert!(error.is_logic_error());

            let error = session.start_transaction(None).await.unwrap_err();
            assert!(error.is_logic_error());
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_carry_session_id() {
    TestClient::new()
        .run(|client, deployment| async move {
            let session = client.start_session(None).unwrap();
            let db = client.database("inventory");
            for _ in 0..2 {
                db.run_command(doc! { "ping": 1 }, Some(&session))
                    .await
                    .unwrap();
            }

            let pings = deployment.commands_named("ping");
            assert_eq!(pings.len(), 2);
            for ping in &pings {
                assert_eq!(ping.get_document("lsid").unwrap(), session.id());
                assert!(!ping.contains_key("txnNumber"));
            }
            // The first reply's cluster time is gossiped back on the next command.
            assert!(pings[1].contains_key("$clusterTime"));

            // Replies carry an operation time, which the session records.
            assert!(session.operation_time().is_some());
            assert!(session.cluster_time().is_some());
            session.end().await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_time_only_moves_forward() {
    TestClient::new()
        .run(|client, _| async move {
            let session = client.start_session(None).unwrap();
            let later = ClusterTime {
                cluster_time: Timestamp {
                    time: 20,
                    increment: 1,
                },
                signature: doc! {},
            };
            let earlier = ClusterTime {
                cluster_time: Timestamp {
                    time: 10,
                    increment: 5,
                },
                signature: doc! {},
            };

            session.advance_cluster_time(&later);
            session.advance_cluster_time(&earlier);
            assert_eq!(session.cluster_time(), Some(later));

            session.advance_operation_time(Timestamp {
                time: 5,
                increment: 2,
            });
            session.advance_operation_time(Timestamp {
                time: 5,
                increment: 1,
            });
            assert_eq!(
                session.operation_time(),
                Some(Timestamp {
                    time: 5,
                    increment: 2
                })
            );
            session.end().await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transaction_runs_on_pinned_connection() {
    TestClient::new()
        .run(|client, deployment| async move {
            let recorder = Arc::new(EventRecorder::default());
            client.add_command_event_handler(&recorder);

            let session = client.start_session(None).unwrap();
            session.start_transaction(None).await.unwrap();
            assert!(session.is_pinned());
            assert_eq!(session.transaction_state(), TransactionState::Starting);
            assert_eq!(client.pool_status().in_use, 1);

            let db = client.database("inventory");
            db.run_command(doc! { "ping": 1 }, Some(&session))
                .await
                .unwrap();
            assert_eq!(session.transaction_state(), TransactionState::InProgress);
            db.run_command(doc! { "ping": 1 }, Some(&session))
                .await
                .unwrap();
            session.commit_transaction().await.unwrap();
            assert!(!session.is_pinned());
            assert_eq!(session.transaction_state(), TransactionState::Committed);

            let pings = deployment.commands_named("ping");
            assert_eq!(pings.len(), 2);
            assert_eq!(pings[0].get_bool("startTransaction"), Ok(true));
            assert!(!pings[1].contains_key("startTransaction"));
            for ping in &pings {
                assert_eq!(ping.get_i64("txnNumber"), Ok(1));
                assert_eq!(ping.get_bool("autocommit"), Ok(false));
            }

            let commits = deployment.commands_named("commitTransaction");
            assert_eq!(commits.len(), 1);
            assert_eq!(commits[0].get_str("$db"), Ok("admin"));
            assert_eq!(commits[0].get_i64("txnNumber"), Ok(1));

            let connection_ids: Vec<u32> = recorder
                .events()
                .iter()
                .map(|event| event.connection().id)
                .collect();
            assert_eq!(connection_ids.len(), 6);
            assert!(connection_ids.iter().all(|id| *id == connection_ids[0]));

            let status = client.pool_status();
            assert_eq!(status.in_use, 0);
            assert_eq!(status.available, 1);
            session.end().await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_transaction_commits_locally() {
    TestClient::new()
        .run(|client, deployment| async move {
            let session = client.start_session(None).unwrap();
            session.start_transaction(None).await.unwrap();
            session.commit_transaction().await.unwrap();
            assert!(deployment.commands_named("commitTransaction").is_empty());
            assert!(!session.is_pinned());

            // A second transaction gets the next transaction number.
            session.start_transaction(None).await.unwrap();
            client
                .database("inventory")
                .run_command(doc! { "ping": 1 }, Some(&session))
                .await
                .unwrap();
            session.abort_transaction().await.unwrap();
            let aborts = deployment.commands_named("abortTransaction");
            assert_eq!(aborts.len(), 1);
            assert_eq!(aborts[0].get_i64("txnNumber"), Ok(2));
            session.end().await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transaction_misuse_is_a_logic_error() {
    TestClient::new()
        .run(|client, _| async move {
            let session = client.start_session(None).unwrap();
            assert_eq!(
                logic_message(session.commit_transaction().await.unwrap_err()),
                "No transaction started"
            );
            assert_eq!(
                logic_message(session.abort_transaction().await.unwrap_err()),
                "No transaction started"
            );

            session.start_transaction(None).await.unwrap();
            assert_eq!(
                logic_message(session.start_transaction(None).await.unwrap_err()),
                "Transaction already in progress"
            );
            session.commit_transaction().await.unwrap();
            assert_eq!(
                logic_message(session.commit_transaction().await.unwrap_err()),
                "Transaction already committed"
            );
            assert_eq!(
                logic_message(session.abort_transaction().await.unwrap_err()),
                "Cannot call abortTransaction after calling commitTransaction"
            );

            session.start_transaction(None).await.unwrap();
            session.abort_transaction().await.unwrap();
            assert_eq!(
                logic_message(session.abort_transaction().await.unwrap_err()),
                "Cannot call abortTransaction twice"
            );
            assert_eq!(
                logic_message(session.commit_transaction().await.unwrap_err()),
                "Cannot call commitTransaction after calling abortTransaction"
            );
            session.end().await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn end_aborts_transaction_in_progress() {
    TestClient::new()
        .run(|client, deployment| async move {
            let options = SessionOptions::builder()
                .default_transaction_options(
                    TransactionOptions::builder()
                        .write_concern(WriteConcern::majority())
                        .build(),
                )
                .build();
            let session = client.start_session(options).unwrap();
            session.start_transaction(None).await.unwrap();
            client
                .database("inventory")
                .run_command(doc! { "ping": 1 }, Some(&session))
                .await
                .unwrap();

            session.end().await;
            assert!(session.is_ended());
            assert!(!session.is_pinned());
            assert_eq!(session.transaction_state(), TransactionState::Aborted);

            let aborts = deployment.commands_named("abortTransaction");
            assert_eq!(aborts.len(), 1);
            assert_eq!(
                aborts[0].get("writeConcern"),
                Some(&Bson::Document(doc! { "w": "majority" }))
            );
            assert_eq!(client.pool_status().in_use, 0);
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_error_during_abort_is_ignored() {
    TestClient::new()
        .run(|client, deployment| async move {
            let session = client.start_session(None).unwrap();
            session.start_transaction(None).await.unwrap();
            client
                .database("inventory")
                .run_command(doc! { "ping": 1 }, Some(&session))
                .await
                .unwrap();
            deployment.fail_next(
                "abortTransaction",
                crate::test::Failure::Command {
                    code: 251,
                    message: "NoSuchTransaction".to_string(),
                },
            );
            session.abort_transaction().await.unwrap();
            assert_eq!(session.transaction_state(), TransactionState::Aborted);
            session.end().await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn end_does_not_wait_for_a_held_pin_once_the_client_is_gone() {
    let TestClient { client, deployment } = TestClient::new();
    let session = client.start_session(None).unwrap();
    session.start_transaction(None).await.unwrap();

    // Leave the pinned connection checked out, as an unfinished operation would.
    let held = session.inner().take_pinned_connection();
    assert!(held.is_some());

    client.shutdown().await.unwrap();
    drop(client);
    assert!(session.client().is_none());

    tokio::time::timeout(Duration::from_secs(5), session.end())
        .await
        .expect("ending the session should not wait for the held connection");
    assert!(session.is_ended());
    assert!(!session.is_pinned());

    drop(held);
    drop(deployment);
}
