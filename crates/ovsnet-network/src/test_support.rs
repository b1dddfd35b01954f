//! Scripted OVSDB server for adapter tests

use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

use crate::ovsdb::{DbEndpoint, OvsdbClient, RpcSettings};

type Responder = dyn Fn(&Value) -> Value + Send + Sync;

pub struct FakeOvsdb {
    pub path: PathBuf,
    pub requests: Arc<Mutex<Vec<Value>>>,
    _dir: tempfile::TempDir,
}

impl FakeOvsdb {
    /// Start a server answering every request with `{"id", "error": null, "result": respond(params)}`.
    pub fn start(respond: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<Responder> = Arc::new(respond);

        let log = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = log.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let request = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Ok(v) = serde_json::from_slice::<Value>(&buf) {
                            break v;
                        }
                    };
                    log.lock().unwrap().push(request.clone());
                    let response = serde_json::json!({
                        "id": request["id"],
                        "error": null,
                        "result": respond(&request["params"]),
                    });
                    // Two writes so the client has to reassemble the message.
                    let bytes = serde_json::to_vec(&response).unwrap();
                    let (head, tail) = bytes.split_at(bytes.len() / 2);
                    let _ = stream.write_all(head).await;
                    let _ = stream.flush().await;
                    let _ = stream.write_all(tail).await;
                });
            }
        });

        Self {
            path,
            requests,
            _dir: dir,
        }
    }

    pub fn client(&self, database: &str) -> OvsdbClient {
        OvsdbClient::new(DbEndpoint::Unix(self.path.clone()), database, RpcSettings::default())
    }

    /// Operations sent in every transact so far, flattened.
    pub fn operations(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r["params"].as_array().cloned())
            .flat_map(|params| params.into_iter().skip(1))
            .collect()
    }

    /// Ops of the given kind (`insert`, `mutate`, ...).
    pub fn ops_named(&self, op: &str) -> Vec<Value> {
        self.operations().into_iter().filter(|o| o["op"] == op).collect()
    }
}

/// Answer each operation of a transact: selects from `rows(table, where)`, everything else `{}`/`count`.
pub fn table_responder(
    rows: impl Fn(&str, &Value) -> Vec<Value> + Send + Sync + 'static,
) -> impl Fn(&Value) -> Value + Send + Sync + 'static {
    move |params: &Value| {
        let ops = params.as_array().cloned().unwrap_or_default();
        let results: Vec<Value> = ops
            .iter()
            .skip(1)
            .map(|op| match op["op"].as_str() {
                Some("select") => serde_json::json!({
                    "rows": rows(op["table"].as_str().unwrap_or_default(), &op["where"])
                }),
                Some("insert") => serde_json::json!({"uuid": ["uuid", "00000000-0000-0000-0000-000000000001"]}),
                _ => serde_json::json!({"count": 1}),
            })
            .collect();
        Value::Array(results)
    }
}
