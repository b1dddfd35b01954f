//! Direct OVSDB JSON-RPC client (RFC 7047) - no ovs-vsctl / ovn-nbctl wrappers
//!
//! One client type talks to both the local `Open_vSwitch` database over its
//! unix socket and the OVN `OVN_Northbound` database over TCP. Every call is
//! bounded by a timeout; transient failures are retried a fixed number of
//! times with a fixed backoff before the last error is surfaced.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use crate::ovs_error::{OvsError, OvsResult};

/// Local OVSDB socket locations, in priority order
pub const OVSDB_SOCKET_PATHS: &[&str] = &["/var/run/openvswitch/db.sock", "/run/openvswitch/db.sock"];

/// Where an OVSDB server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl DbEndpoint {
    /// Parse an OVSDB connection string: `tcp:<host>:<port>` or `unix:<path>`.
    pub fn parse(conn: &str) -> OvsResult<Self> {
        let conn = conn.trim();
        if let Some(addr) = conn.strip_prefix("tcp:") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| OvsError::InvalidEndpoint(conn.to_string()))?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(OvsError::InvalidEndpoint(conn.to_string()));
            }
            return Ok(DbEndpoint::Tcp(addr.to_string()));
        }
        if let Some(path) = conn.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(OvsError::InvalidEndpoint(conn.to_string()));
            }
            return Ok(DbEndpoint::Unix(PathBuf::from(path)));
        }
        Err(OvsError::InvalidEndpoint(conn.to_string()))
    }

    /// The local `Open_vSwitch` socket, falling back to the first well-known path.
    pub fn local_switch() -> Self {
        let path = OVSDB_SOCKET_PATHS
            .iter()
            .find(|p| Path::new(p).exists())
            .unwrap_or(&OVSDB_SOCKET_PATHS[0]);
        DbEndpoint::Unix(PathBuf::from(path))
    }

    /// Host part of a TCP endpoint.
    pub fn host(&self) -> Option<&str> {
        match self {
            DbEndpoint::Tcp(addr) => addr.rsplit_once(':').map(|(host, _)| host),
            DbEndpoint::Unix(_) => None,
        }
    }

    /// Port part of a TCP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            DbEndpoint::Tcp(addr) => addr.rsplit_once(':').and_then(|(_, p)| p.parse().ok()),
            DbEndpoint::Unix(_) => None,
        }
    }

    /// Can a connection be opened within `timeout`? Timeouts count as unreachable.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let attempt = async {
            match self {
                DbEndpoint::Unix(path) => UnixStream::connect(path).await.map(|_| ()),
                DbEndpoint::Tcp(addr) => TcpStream::connect(addr.as_str()).await.map(|_| ()),
            }
        };
        matches!(tokio::time::timeout(timeout, attempt).await, Ok(Ok(())))
    }
}

impl fmt::Display for DbEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            DbEndpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Timeout and retry budget applied to every RPC
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// OVSDB JSON-RPC client bound to one database on one server
pub struct OvsdbClient {
    endpoint: DbEndpoint,
    database: String,
    settings: RpcSettings,
    next_id: AtomicU64,
}

impl OvsdbClient {
    pub fn new(endpoint: DbEndpoint, database: impl Into<String>, settings: RpcSettings) -> Self {
        Self {
            endpoint,
            database: database.into(),
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &DbEndpoint {
        &self.endpoint
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Send a JSON-RPC request, retrying transient failures.
    pub async fn rpc_call(&self, method: &str, params: Value) -> OvsResult<Value> {
        let mut attempt = 0;
        loop {
            match self.call_once(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.settings.retries => {
                    attempt += 1;
                    warn!(
                        "OVSDB {} on {} failed ({}), retry {}/{}",
                        method, self.endpoint, e, attempt, self.settings.retries
                    );
                    tokio::time::sleep(self.settings.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, method: &str, params: Value) -> OvsResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "method": method, "params": params, "id": id });
        let timeout_ms = self.settings.timeout.as_millis() as u64;

        let exchange = async {
            match &self.endpoint {
                DbEndpoint::Unix(path) => {
                    if !path.exists() {
                        return Err(OvsError::SocketNotFound(path.display().to_string()));
                    }
                    let stream = UnixStream::connect(path)
                        .await
                        .map_err(|e| OvsError::Connection(self.endpoint.to_string(), e))?;
                    exchange(stream, &request, id, &self.endpoint).await
                }
                DbEndpoint::Tcp(addr) => {
                    let stream = TcpStream::connect(addr.as_str())
                        .await
                        .map_err(|e| OvsError::Connection(self.endpoint.to_string(), e))?;
                    exchange(stream, &request, id, &self.endpoint).await
                }
            }
        };

        let response = tokio::time::timeout(self.settings.timeout, exchange)
            .await
            .map_err(|_| OvsError::Timeout(timeout_ms, format!("{} on {}", method, self.endpoint)))??;

        match response.get("error") {
            Some(error) if !error.is_null() => Err(OvsError::Rpc(error.to_string())),
            _ => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
        }
    }

    /// List all databases served by the endpoint
    pub async fn list_dbs(&self) -> OvsResult<Vec<String>> {
        let result = self.rpc_call("list_dbs", json!([])).await?;
        serde_json::from_value(result).map_err(|e| OvsError::Parse(e.to_string()))
    }

    /// Execute operations atomically; any per-operation error fails the whole call.
    pub async fn transact(&self, operations: Vec<Value>) -> OvsResult<Vec<Value>> {
        let mut params = Vec::with_capacity(operations.len() + 1);
        params.push(json!(self.database));
        params.extend(operations);

        debug!("OVSDB transact on {}: {}", self.endpoint, serde_json::Value::Array(params.clone()));
        let result = self.rpc_call("transact", Value::Array(params)).await?;
        let results = match result {
            Value::Array(results) => results,
            other => return Err(OvsError::Parse(format!("transact result is not an array: {}", other))),
        };

        for outcome in &results {
            if let Some(error) = outcome.get("error").and_then(Value::as_str) {
                return Err(OvsError::Transaction {
                    error: error.to_string(),
                    details: outcome
                        .get("details")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        Ok(results)
    }

    /// Select rows from one table.
    pub async fn select(&self, table: &str, conditions: Value, columns: &[&str]) -> OvsResult<Vec<Value>> {
        let mut op = json!({ "op": "select", "table": table, "where": conditions });
        if !columns.is_empty() {
            op["columns"] = json!(columns);
        }
        let results = self.transact(vec![op]).await?;
        Ok(results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// First row whose `name` column equals `name`.
    pub async fn find_by_name(&self, table: &str, name: &str, columns: &[&str]) -> OvsResult<Option<Value>> {
        let rows = self.select(table, json!([["name", "==", name]]), columns).await?;
        Ok(rows.into_iter().next())
    }
}

async fn exchange<S>(mut stream: S, request: &Value, id: u64, endpoint: &DbEndpoint) -> OvsResult<Value>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(request).map_err(|e| OvsError::Parse(e.to_string()))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| OvsError::Connection(endpoint.to_string(), e))?;
    stream
        .flush()
        .await
        .map_err(|e| OvsError::Connection(endpoint.to_string(), e))?;

    // Responses are not newline framed; parse incrementally until a complete
    // message with our id arrives, skipping notifications and echo requests.
    let mut buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|e| OvsError::Connection(endpoint.to_string(), e))?;
        if read == 0 {
            return Err(OvsError::ConnectionClosed(endpoint.to_string()));
        }
        buffer.extend_from_slice(&chunk[..read]);

        loop {
            let mut messages = serde_json::Deserializer::from_slice(&buffer).into_iter::<Value>();
            match messages.next() {
                Some(Ok(message)) => {
                    let consumed = messages.byte_offset();
                    if message.get("id").and_then(Value::as_u64) == Some(id) {
                        return Ok(message);
                    }
                    debug!("Skipping unrelated OVSDB message: {}", message);
                    buffer.drain(..consumed);
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(OvsError::Parse(e.to_string())),
                None => break,
            }
        }
    }
}

// ============================================================================
// OVSDB datum helpers
// ============================================================================

/// `["uuid", "<uuid>"]`
pub fn uuid(value: &str) -> Value {
    json!(["uuid", value])
}

/// `["named-uuid", "<name>"]`, a reference to a row inserted in the same transaction
pub fn named_uuid(name: &str) -> Value {
    json!(["named-uuid", name])
}

/// `["set", [...]]`
pub fn ovs_set(items: Vec<Value>) -> Value {
    json!(["set", items])
}

/// `["map", [[k, v], ...]]`
pub fn ovs_map(entries: &BTreeMap<String, String>) -> Value {
    let pairs: Vec<Value> = entries.iter().map(|(k, v)| json!([k, v])).collect();
    json!(["map", pairs])
}

/// `wait` op that fails the transaction at once ("timed out") unless the
/// rows matching `conditions` equal `rows` on `columns`. Placed ahead of an
/// insert so a concurrent writer or a re-sent request cannot add a second row.
pub fn wait_for_rows(table: &str, conditions: Value, columns: &[&str], rows: Vec<Value>) -> Value {
    json!({
        "op": "wait",
        "table": table,
        "where": conditions,
        "columns": columns,
        "until": "==",
        "rows": rows,
        "timeout": 0
    })
}

/// Turn an arbitrary name into a valid `uuid-name` (letters, digits, underscore).
pub fn row_name(prefix: &str, name: &str) -> String {
    let clean: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", prefix, clean)
}

/// `_uuid` of a selected row.
pub fn row_uuid(row: &Value) -> Option<String> {
    match row.get("_uuid")?.as_array()?.as_slice() {
        [tag, Value::String(id)] if tag == "uuid" => Some(id.clone()),
        _ => None,
    }
}

/// Atoms of a set datum. A single atom is a one-element set.
pub fn parse_set(datum: &Value) -> Vec<Value> {
    match datum.as_array().map(Vec::as_slice) {
        Some([tag, Value::Array(items)]) if tag == "set" => items.clone(),
        Some([tag, _]) if tag == "uuid" || tag == "named-uuid" => vec![datum.clone()],
        _ if datum.is_null() => Vec::new(),
        _ => vec![datum.clone()],
    }
}

/// UUIDs of a set-of-references datum.
pub fn parse_uuid_set(datum: &Value) -> Vec<String> {
    parse_set(datum)
        .iter()
        .filter_map(|atom| match atom.as_array().map(Vec::as_slice) {
            Some([tag, Value::String(id)]) if tag == "uuid" => Some(id.clone()),
            _ => None,
        })
        .collect()
}

/// Strings of a set-of-strings datum.
pub fn parse_string_set(datum: &Value) -> Vec<String> {
    parse_set(datum)
        .iter()
        .filter_map(|atom| atom.as_str().map(str::to_string))
        .collect()
}

/// Optional integer column (`["set", []]` when empty).
pub fn parse_optional_int(datum: &Value) -> Option<i64> {
    parse_set(datum).first().and_then(Value::as_i64)
}

/// String-to-string map datum.
pub fn parse_map(datum: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some([tag, Value::Array(pairs)]) = datum.as_array().map(Vec::as_slice) {
        if tag == "map" {
            for pair in pairs {
                if let Some([Value::String(k), v]) = pair.as_array().map(Vec::as_slice) {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out.insert(k.clone(), value);
                }
            }
        }
    }
    out
}
