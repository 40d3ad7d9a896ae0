//! JSON-RPC bridge to the external chain and identity services.
//!
//! The daemon holds no chain or wallet credentials. A deployment runs a
//! small bridge process in front of its chain node and channel wallet
//! and exposes the methods below over a TCP socket, one JSON-RPC 2.0
//! request and one response per line. Binary values travel hex-encoded.
//!
//! Chain methods: `getblockcount`, `getblockhash`, `getblock`.
//! Identity methods: `getlocalnode`, `listchannels`, `getnodechannels`,
//! `signmessage`, `verifymessage`, `getnodeaddresses`.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::chain::{Block, ChainError, ChainService, Transaction, TxOut};
use crate::identity::{Channel, IdentityError, IdentityService, NodeId, SIGNATURE_SIZE};

/// Errors from the bridge transport.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Json(#[from] serde_json::Error),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

struct RpcConn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_id: u64,
}

/// Line-delimited JSON-RPC client over one TCP connection.
pub struct RpcClient {
    conn: Mutex<RpcConn>,
}

impl RpcClient {
    /// Connect to a bridge endpoint (`host:port`).
    pub fn connect(endpoint: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(endpoint)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            conn: Mutex::new(RpcConn {
                reader,
                writer: stream,
                next_id: 0,
            }),
        })
    }

    fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, RpcError> {
        let mut conn = self.conn.lock();
        conn.next_id += 1;
        let mut line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: conn.next_id,
            method,
            params,
        })?;
        line.push('\n');
        conn.writer.write_all(line.as_bytes())?;

        let mut response_line = String::new();
        conn.reader.read_line(&mut response_line)?;
        if response_line.is_empty() {
            return Err(RpcError::Malformed("connection closed".into()));
        }
        let response: RpcResponse = serde_json::from_str(&response_line)?;
        if let Some(error) = response.error {
            return Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        let result = response
            .result
            .ok_or_else(|| RpcError::Malformed("missing result".into()))?;
        Ok(serde_json::from_value(result)?)
    }
}

fn chain_err(err: RpcError) -> ChainError {
    match err {
        RpcError::Io(e) => ChainError::Unavailable(e.to_string()),
        other => ChainError::Service(other.to_string()),
    }
}

fn identity_err(err: RpcError) -> IdentityError {
    match err {
        RpcError::Io(e) => IdentityError::Unavailable(e.to_string()),
        other => IdentityError::Service(other.to_string()),
    }
}

#[derive(Deserialize)]
struct BlockJson {
    tx: Vec<TxJson>,
}

#[derive(Deserialize)]
struct TxJson {
    txid: String,
    vout: Vec<VoutJson>,
}

#[derive(Deserialize)]
struct VoutJson {
    script: String,
}

/// Chain service over the bridge.
pub struct RpcChainService {
    client: RpcClient,
}

impl RpcChainService {
    /// Connect to the bridge endpoint.
    pub fn connect(endpoint: &str) -> Result<Self, RpcError> {
        Ok(Self {
            client: RpcClient::connect(endpoint)?,
        })
    }
}

impl ChainService for RpcChainService {
    fn block_count(&self) -> Result<u64, ChainError> {
        self.client.call("getblockcount", json!([])).map_err(chain_err)
    }

    fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        self.client
            .call("getblockhash", json!([height]))
            .map_err(chain_err)
    }

    fn block(&self, hash: &str) -> Result<Block, ChainError> {
        let block: BlockJson = self.client.call("getblock", json!([hash])).map_err(chain_err)?;
        let mut txs = Vec::with_capacity(block.tx.len());
        for tx in block.tx {
            let txid: [u8; 32] = hex::decode(&tx.txid)
                .map_err(|e| ChainError::Malformed(e.to_string()))?
                .try_into()
                .map_err(|_| ChainError::Malformed(format!("txid length in {}", tx.txid)))?;
            let outputs = tx
                .vout
                .into_iter()
                .map(|vout| {
                    hex::decode(&vout.script)
                        .map(|script| TxOut { script })
                        .map_err(|e| ChainError::Malformed(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            txs.push(Transaction { txid, outputs });
        }
        Ok(Block { txs })
    }
}

#[derive(Deserialize)]
struct ChannelJson {
    remote: String,
    local_balance: i64,
}

#[derive(Deserialize)]
struct VerifyJson {
    valid: bool,
    #[serde(default)]
    node: Option<String>,
}

/// Identity service over the bridge.
pub struct RpcIdentityService {
    client: RpcClient,
}

impl RpcIdentityService {
    /// Connect to the bridge endpoint.
    pub fn connect(endpoint: &str) -> Result<Self, RpcError> {
        Ok(Self {
            client: RpcClient::connect(endpoint)?,
        })
    }
}

impl IdentityService for RpcIdentityService {
    fn local_node(&self) -> Result<NodeId, IdentityError> {
        let id: String = self
            .client
            .call("getlocalnode", json!([]))
            .map_err(identity_err)?;
        id.parse()
    }

    fn channels(&self) -> Result<Vec<Channel>, IdentityError> {
        let channels: Vec<ChannelJson> = self
            .client
            .call("listchannels", json!([]))
            .map_err(identity_err)?;
        channels
            .into_iter()
            .map(|channel| {
                Ok(Channel {
                    remote: channel.remote.parse()?,
                    local_balance: channel.local_balance,
                })
            })
            .collect()
    }

    fn node_neighbors(&self, node: &NodeId) -> Result<Vec<NodeId>, IdentityError> {
        let neighbors: Vec<String> = self
            .client
            .call("getnodechannels", json!([node.to_string()]))
            .map_err(identity_err)?;
        neighbors.into_iter().map(|n| n.parse()).collect()
    }

    fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_SIZE], IdentityError> {
        let signature: String = self
            .client
            .call("signmessage", json!([hex::encode(message)]))
            .map_err(identity_err)?;
        let bytes =
            hex::decode(&signature).map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| IdentityError::Service("signature is not 65 bytes".into()))
    }

    fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<Option<NodeId>, IdentityError> {
        let verdict: VerifyJson = self
            .client
            .call(
                "verifymessage",
                json!([hex::encode(message), hex::encode(signature)]),
            )
            .map_err(identity_err)?;
        if !verdict.valid {
            return Ok(None);
        }
        verdict.node.map(|node| node.parse()).transpose()
    }

    fn network_addresses(&self, node: &NodeId) -> Result<Vec<String>, IdentityError> {
        self.client
            .call("getnodeaddresses", json!([node.to_string()]))
            .map_err(identity_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Serve canned results on a one-connection bridge, echoing request
    /// ids back.
    fn serve(results: Vec<serde_json::Value>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            for result in results {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    return;
                }
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": result,
                });
                let mut out = response.to_string();
                out.push('\n');
                writer.write_all(out.as_bytes()).unwrap();
            }
        });
        endpoint
    }

    #[test]
    fn test_block_count_call() {
        let endpoint = serve(vec![json!(42)]);
        let chain = RpcChainService::connect(&endpoint).unwrap();
        assert_eq!(chain.block_count().unwrap(), 42);
    }

    #[test]
    fn test_block_decodes_hex_fields() {
        let endpoint = serve(vec![json!({
            "tx": [{
                "txid": hex::encode([7u8; 32]),
                "vout": [{"script": "6a4c4c"}, {"script": ""}],
            }],
        })]);
        let chain = RpcChainService::connect(&endpoint).unwrap();
        let block = chain.block("whatever").unwrap();
        assert_eq!(block.txs.len(), 1);
        assert_eq!(block.txs[0].txid, [7u8; 32]);
        assert_eq!(block.txs[0].outputs[0].script, vec![0x6a, 0x4c, 0x4c]);
        assert!(block.txs[0].outputs[1].script.is_empty());
    }

    #[test]
    fn test_identity_calls() {
        let node_hex = hex::encode([2u8; 33]);
        let endpoint = serve(vec![
            json!(node_hex.clone()),
            json!([{"remote": node_hex.clone(), "local_balance": 500}]),
            json!({"valid": true, "node": node_hex.clone()}),
            json!({"valid": false}),
        ]);
        let identity = RpcIdentityService::connect(&endpoint).unwrap();

        let local = identity.local_node().unwrap();
        assert_eq!(local.as_bytes(), &[2u8; 33]);

        let channels = identity.channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].local_balance, 500);

        let recovered = identity.verify(b"msg", &[0u8; SIGNATURE_SIZE]).unwrap();
        assert_eq!(recovered, Some(local));
        let invalid = identity.verify(b"msg", &[0u8; SIGNATURE_SIZE]).unwrap();
        assert_eq!(invalid, None);
    }

    #[test]
    fn test_remote_error_surfaces() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            let response = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -5, "message": "block not found"},
            });
            let mut out = response.to_string();
            out.push('\n');
            writer.write_all(out.as_bytes()).unwrap();
        });

        let chain = RpcChainService::connect(&endpoint).unwrap();
        let err = chain.block_hash(999).unwrap_err();
        assert!(matches!(err, ChainError::Service(_)));
    }
}
