use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde::Deserialize;

use super::{
    event::{ChangeStreamEventSource, OperationType, ResumeToken},
    options::{ChangeStreamOptions, FullDocumentType},
};
use crate::{
    bson::{doc, Bson, Document},
    error::ErrorKind,
    test::{Failure, MockDeployment, TestClient, CURSOR_ID},
    Namespace,
};

fn token(data: &str) -> Option<ResumeToken> {
    Some(ResumeToken::from_document(doc! { "_data": data }))
}

/// Waits for a command sent by a background job, such as `killCursors` on drop.
async fn wait_for_command(deployment: &MockDeployment, name: &str) -> Vec<Document> {
    for _ in 0..50 {
        let sent = deployment.commands_named(name);
        if !sent.is_empty() {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    deployment.commands_named(name)
}

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    #[serde(rename = "_id")]
    id: i32,
    name: String,
}

#[tokio::test(flavor = "multi_thread")]
async fn client_stream_watches_the_whole_cluster() {
    TestClient::new()
        .run(|client, deployment| async move {
            let options = ChangeStreamOptions::builder()
                .full_document(FullDocumentType::UpdateLookup)
                .batch_size(5u32)
                .max_await_time(Duration::from_millis(300))
                .build();
            let mut stream = client
                .watch([doc! { "$match": { "operationType": "insert" } }], options, None)
                .await
                .unwrap();

            assert!(stream.is_alive());
            assert_eq!(stream.namespace(), &Namespace::new("admin", "$cmd.aggregate"));
            assert_eq!(stream.resume_token(), None);

            let aggregate = &deployment.commands_named("aggregate")[0];
            assert_eq!(aggregate.get_str("$db"), Ok("admin"));
            assert_eq!(
                aggregate.get_array("pipeline").unwrap(),
                &vec![
                    Bson::Document(doc! {
                        "$changeStream": {
                            "allChangesForCluster": true,
                            "fullDocument": "updateLookup",
                        }
                    }),
                    Bson::Document(doc! { "$match": { "operationType": "insert" } }),
                ]
            );
            assert_eq!(aggregate.get_document("cursor"), Ok(&doc! { "batchSize": 5 }));

            let event = stream.next().await.unwrap().unwrap();
            assert_eq!(event.id, token("event-1").unwrap());
            assert_eq!(event.operation_type, OperationType::Insert);
            assert_eq!(event.document_key, Some(doc! { "_id": 1 }));
            assert!(matches!(
                event.ns,
                Some(ChangeStreamEventSource::Namespace(ref ns))
                    if ns == &Namespace::new("inventory", "items")
            ));
            assert_eq!(stream.resume_token(), token("event-1"));

            assert!(stream.next_if_any().await.unwrap().is_none());
            assert_eq!(stream.resume_token(), token("idle"));
            assert!(stream.is_alive());

            let get_more = &deployment.commands_named("getMore")[0];
            assert_eq!(get_more.get_i64("getMore"), Ok(CURSOR_ID));
            assert_eq!(get_more.get_str("collection"), Ok("$cmd.aggregate"));
            assert_eq!(get_more.get_str("$db"), Ok("admin"));
            assert_eq!(get_more.get("batchSize"), Some(&Bson::Int32(5)));
            assert!(get_more.contains_key("maxTimeMS"));

            drop(stream);
            let killed = wait_for_command(&deployment, "killCursors").await;
            assert_eq!(killed.len(), 1);
            assert_eq!(killed[0].get_str("killCursors"), Ok("$cmd.aggregate"));
            assert_eq!(
                killed[0].get_array("cursors"),
                Ok(&vec![Bson::Int64(CURSOR_ID)])
            );
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn database_stream_is_scoped_to_the_database() {
    TestClient::new()
        .run(|client, deployment| async move {
            let stream = client
                .database("inventory")
                .watch(None::<Document>, None, None)
                .await
                .unwrap();
            assert_eq!(stream.namespace().db, "inventory");

            let aggregate = &deployment.commands_named("aggregate")[0];
            assert_eq!(aggregate.get_str("$db"), Ok("inventory"));
            assert_eq!(
                aggregate.get_array("pipeline").unwrap(),
                &vec![Bson::Document(doc! { "$changeStream": {} })]
            );
            drop(stream);
            wait_for_command(&deployment, "killCursors").await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_options_are_sent_in_the_stage() {
    TestClient::new()
        .run(|client, deployment| async move {
            deployment.reply_next(
                "aggregate",
                doc! {
                    "cursor": {
                        "id": 0_i64,
                        "ns": "admin.$cmd.aggregate",
                        "firstBatch": [],
                    },
                },
            );
            let options = ChangeStreamOptions::builder()
                .start_after(token("saved"))
                .build();
            let mut stream = client.watch(None, options, None).await.unwrap();

            // With nothing returned yet, the token the stream started after is the one to resume
            // from.
            assert_eq!(stream.resume_token(), token("saved"));
            assert!(!stream.is_alive());
            assert!(stream.next().await.is_none());

            let stage = deployment.commands_named("aggregate")[0]
                .get_array("pipeline")
                .unwrap()[0]
                .as_document()
                .unwrap()
                .get_document("$changeStream")
                .unwrap()
                .clone();
            assert_eq!(
                stage,
                doc! { "allChangesForCluster": true, "startAfter": { "_data": "saved" } }
            );
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_first_batch_uses_post_batch_token() {
    TestClient::new()
        .run(|client, deployment| async move {
            deployment.reply_next(
                "aggregate",
                doc! {
                    "cursor": {
                        "id": CURSOR_ID,
                        "ns": "admin.$cmd.aggregate",
                        "firstBatch": [],
                        "postBatchResumeToken": { "_data": "start" },
                    },
                },
            );
            let stream = client.watch(None, None, None).await.unwrap();
            assert_eq!(stream.resume_token(), token("start"));
            drop(stream);
            wait_for_command(&deployment, "killCursors").await;
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_cursor_ends_the_stream() {
    TestClient::new()
        .run(|client, deployment| async move {
            deployment.reply_next(
                "getMore",
                doc! {
                    "cursor": {
                        "id": 0_i64,
                        "ns": "admin.$cmd.aggregate",
                        "nextBatch": [MockDeployment::change_event("event-2", 2)],
                        "postBatchResumeToken": { "_data": "event-2" },
                    },
                },
            );
            let stream = client
                .watch_with_full_document_type::<Item>(None, None, None)
                .await
                .unwrap();

            let events: Vec<_> = stream.collect().await;
            let documents: Vec<Item> = events
                .into_iter()
                .map(|event| event.unwrap().full_document.unwrap())
                .collect();
            assert_eq!(
                documents,
                vec![
                    Item {
                        id: 1,
                        name: "item1".to_string()
                    },
                    Item {
                        id: 2,
                        name: "item2".to_string()
                    },
                ]
            );

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(deployment.commands_named("killCursors").is_empty());
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn get_more_failure_closes_the_stream() {
    TestClient::new()
        .run(|client, deployment| async move {
            let mut stream = client.watch(None, None, None).await.unwrap();
            stream.next().await.unwrap().unwrap();

            deployment.fail_next(
                "getMore",
                Failure::Command {
                    code: 43,
                    message: "cursor not found".to_string(),
                },
            );
            let error = stream.next_if_any().await.unwrap_err();
            assert!(error.is_command_error());
            assert!(!stream.is_alive());
            assert!(stream.next().await.is_none());

            drop(stream);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(deployment.commands_named("killCursors").is_empty());
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn event_without_resume_token_is_an_error() {
    TestClient::new()
        .run(|client, deployment| async move {
            deployment.reply_next(
                "aggregate",
                doc! {
                    "cursor": {
                        "id": 0_i64,
                        "ns": "admin.$cmd.aggregate",
                        "firstBatch": [{ "operationType": "insert" }],
                    },
                },
            );
            let mut stream = client.watch(None, None, None).await.unwrap();
            let error = stream.next().await.unwrap().unwrap_err();
            assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn session_is_carried_through_get_more() {
    TestClient::new()
        .run(|client, deployment| async move {
            let session = client.start_session(None).unwrap();
            let mut stream = client.watch(None, None, Some(&session)).await.unwrap();
            stream.next().await.unwrap().unwrap();
            assert!(stream.next_if_any().await.unwrap().is_none());

            let aggregate = &deployment.commands_named("aggregate")[0];
            let get_more = &deployment.commands_named("getMore")[0];
            assert_eq!(aggregate.get_document("lsid"), Ok(session.id()));
            assert_eq!(get_more.get_document("lsid"), Ok(session.id()));

            drop(stream);
            let killed = wait_for_command(&deployment, "killCursors").await;
            assert!(!killed[0].contains_key("lsid"));
            session.end().await;
        })
        .await;
}
