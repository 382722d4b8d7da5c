//! An in-process deployment that answers the wire protocol from scripted replies.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};

use crate::{
    bson::{doc, Bson, Document, Timestamp},
    cmap::{conn::wire::Message, ConnectOptions, Connector, WireStream},
    error::{Error, Result},
    options::ServerAddress,
};

pub(crate) const CURSOR_ID: i64 = 4242;

/// How the mock describes itself in `hello` replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MockTopology {
    Standalone,
    ReplicaSet,
    Sharded,
}

/// A scripted failure for the next command with a given name.
#[derive(Clone, Debug)]
pub(crate) enum Failure {
    /// The stream breaks before a reply arrives.
    Network,
    /// The server replies with `ok: 0`.
    Command { code: i32, message: String },
}

#[derive(Debug)]
struct Script {
    topology: MockTopology,
    latency: Option<Duration>,
    refuse_connections: bool,
    failures: HashMap<String, VecDeque<Failure>>,
    replies: HashMap<String, VecDeque<Document>>,
}

#[derive(Debug)]
struct MockState {
    address: ServerAddress,
    script: Mutex<Script>,
    commands: Mutex<Vec<Document>>,
    streams_opened: AtomicU32,
    active: AtomicUsize,
    peak: AtomicUsize,
    clock: AtomicI64,
}

/// A mock deployment with a single server. Cloning it yields a handle to the same deployment.
#[derive(Clone, Debug)]
pub(crate) struct MockDeployment {
    state: Arc<MockState>,
}

impl MockDeployment {
    pub(crate) fn new(topology: MockTopology) -> Self {
        Self {
            state: Arc::new(MockState {
                address: ServerAddress::parse("mock.test:27017").unwrap(),
                script: Mutex::new(Script {
                    topology,
                    latency: None,
                    refuse_connections: false,
                    failures: HashMap::new(),
                    replies: HashMap::new(),
                }),
                commands: Mutex::new(Vec::new()),
                streams_opened: AtomicU32::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                clock: AtomicI64::new(100),
            }),
        }
    }

    pub(crate) fn address(&self) -> ServerAddress {
        self.state.address.clone()
    }

    /// Every round trip sleeps this long before replying.
    pub(crate) fn set_latency(&self, latency: Duration) {
        self.script().latency = Some(latency);
    }

    pub(crate) fn refuse_connections(&self, refuse: bool) {
        self.script().refuse_connections = refuse;
    }

    /// Makes the next command named `command_name` fail.
    pub(crate) fn fail_next(&self, command_name: &str, failure: Failure) {
        self.script()
            .failures
            .entry(command_name.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Queues a reply for the next command named `command_name`. `ok: 1` is added.
    pub(crate) fn reply_next(&self, command_name: &str, reply: Document) {
        self.script()
            .replies
            .entry(command_name.to_string())
            .or_default()
            .push_back(reply);
    }

    /// The commands received so far, excluding handshakes and heartbeats.
    pub(crate) fn commands(&self) -> Vec<Document> {
        self.state
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn commands_named(&self, name: &str) -> Vec<Document> {
        self.commands()
            .into_iter()
            .filter(|command| command_name(command) == name)
            .collect()
    }

    /// The most round trips, excluding heartbeats, that were ever in progress at once.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn streams_opened(&self) -> u32 {
        self.state.streams_opened.load(Ordering::SeqCst)
    }

    /// The cluster time the next reply will report.
    pub(crate) fn next_timestamp(&self) -> Timestamp {
        Timestamp {
            time: self.state.clock.load(Ordering::SeqCst) as u32,
            increment: 1,
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.state
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> Timestamp {
        Timestamp {
            time: self.state.clock.fetch_add(1, Ordering::SeqCst) as u32,
            increment: 1,
        }
    }

    fn respond(&self, command: &Document) -> Result<Document> {
        let name = command_name(command).to_string();
        let is_handshake = name == "hello" || name == "isMaster" || name == "ismaster";

        let (topology, latency, failure, scripted) = {
            let mut script = self.script();
            let failure = script.failures.get_mut(&name).and_then(VecDeque::pop_front);
            let scripted = script.replies.get_mut(&name).and_then(VecDeque::pop_front);
            (script.topology, script.latency, failure, scripted)
        };

        if is_handshake {
            return Ok(self.hello_reply(topology));
        }

        self.state
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());

        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(active, Ordering::SeqCst);
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        self.state.active.fetch_sub(1, Ordering::SeqCst);

        let mut reply = match failure {
            Some(Failure::Network) => {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
            }
            Some(Failure::Command { code, message }) => {
                doc! { "ok": 0, "code": code, "codeName": "MockFailure", "errmsg": message }
            }
            None => {
                let mut reply = match scripted {
                    Some(reply) => reply,
                    None => default_reply(&name, command)?,
                };
                reply.insert("ok", 1);
                reply
            }
        };

        let now = self.tick();
        reply.insert("operationTime", now);
        reply.insert(
            "$clusterTime",
            doc! { "clusterTime": now, "signature": { "keyId": 0_i64 } },
        );
        Ok(reply)
    }

    fn hello_reply(&self, topology: MockTopology) -> Document {
        let mut reply = doc! {
            "ok": 1,
            "helloOk": true,
            "isWritablePrimary": true,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
        };
        match topology {
            MockTopology::Standalone => {}
            MockTopology::ReplicaSet => {
                reply.insert("setName", "rs0");
                reply.insert("hosts", vec![Bson::String(self.state.address.to_string())]);
            }
            MockTopology::Sharded => {
                reply.insert("msg", "isdbgrid");
            }
        }
        reply
    }

    /// A change event as the server would report it.
    pub(crate) fn change_event(token: &str, id: i32) -> Document {
        doc! {
            "_id": { "_data": token },
            "operationType": "insert",
            "ns": { "db": "inventory", "coll": "items" },
            "documentKey": { "_id": id },
            "fullDocument": { "_id": id, "name": format!("item{id}") },
            "clusterTime": Timestamp { time: 50, increment: id as u32 },
        }
    }
}

impl Default for MockDeployment {
    fn default() -> Self {
        Self::new(MockTopology::ReplicaSet)
    }
}

fn command_name(command: &Document) -> &str {
    command.keys().next().map(String::as_str).unwrap_or_default()
}

fn default_reply(name: &str, command: &Document) -> Result<Document> {
    let db = command.get_str("$db").unwrap_or("admin");
    let reply = match name {
        "listDatabases" => {
            if command.get_bool("nameOnly").unwrap_or(false) {
                doc! { "databases": [{ "name": "admin" }, { "name": "inventory" }] }
            } else {
                doc! {
                    "databases": [
                        { "name": "admin", "sizeOnDisk": 40960_i64, "empty": false },
                        { "name": "inventory", "sizeOnDisk": 8192.0, "empty": false },
                    ],
                    "totalSize": 49152_i64,
                }
            }
        }
        "aggregate" => doc! {
            "cursor": {
                "id": CURSOR_ID,
                "ns": format!("{db}.$cmd.aggregate"),
                "firstBatch": [MockDeployment::change_event("event-1", 1)],
                "postBatchResumeToken": { "_data": "event-1" },
            },
        },
        "getMore" => {
            let id = command.get_i64("getMore").map_err(|_| {
                Error::invalid_argument("mock getMore without an int64 cursor id")
            })?;
            let collection = command.get_str("collection").unwrap_or("$cmd.aggregate");
            doc! {
                "cursor": {
                    "id": id,
                    "ns": format!("{db}.{collection}"),
                    "nextBatch": [],
                    "postBatchResumeToken": { "_data": "idle" },
                },
            }
        }
        "killCursors" => {
            let cursors = command.get_array("cursors").cloned().unwrap_or_default();
            doc! { "cursorsKilled": cursors }
        }
        _ => doc! {},
    };
    Ok(reply)
}

impl Connector for MockDeployment {
    fn connect(
        &self,
        address: &ServerAddress,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn WireStream>> {
        if self.script().refuse_connections || address != &self.state.address {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        self.state.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            deployment: self.clone(),
        }))
    }
}

#[derive(Debug)]
struct MockStream {
    deployment: MockDeployment,
}

impl WireStream for MockStream {
    fn round_trip(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let request = Message::decode(message)?;
        let reply = self.deployment.respond(&request.document_payload)?;
        Message::reply_to(request.request_id, reply).encode()
    }
}
