//! Client requests served by a node

use manifold_core::{ByteKey, KeyRange, ManifoldResult, Value};
use manifold_reactor::{BincodeCodec, Reactor};
use manifold_txn::{Transaction, TransactionEngine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Port on which every node accepts client writes
pub const CLIENT_PORT: &str = "node/client";

pub fn client_port() -> ManifoldResult<ByteKey> {
    ByteKey::from_str_key(CLIENT_PORT)
}

/// A single-key write run as its own transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Put { key: ByteKey, value: Value },
    Delete { key: ByteKey },
}

impl ClientRequest {
    pub fn key(&self) -> &ByteKey {
        match self {
            ClientRequest::Put { key, .. } => key,
            ClientRequest::Delete { key } => key,
        }
    }
}

pub type ClientCodec = BincodeCodec<ClientRequest>;

/// Run `request` in a fresh transaction on `engine`. Contention suspends the
/// request until the key is released; a lost validation is logged.
pub fn serve_request(engine: &TransactionEngine, request: ClientRequest) {
    let txn = engine.begin();
    let range = KeyRange::point(request.key().clone());
    txn.lock_range(range, move |mut txn, locked, reactor| {
        if let Err(err) = locked.and_then(|_| write_and_commit(&mut txn, request, reactor)) {
            warn!("Client request on {} failed: {}", reactor.node(), err);
            txn.close();
        }
    });
}

fn write_and_commit(txn: &mut Transaction, request: ClientRequest, reactor: &Reactor) -> ManifoldResult<()> {
    match request {
        ClientRequest::Put { key, value } => txn.write(key, value)?,
        ClientRequest::Delete { key } => txn.delete(&key)?,
    }
    if txn.commit()? {
        debug!("{} committed a client write at {:?}", reactor.node(), txn.commit_stamp());
    } else {
        warn!("{} lost a client write to a concurrent commit", reactor.node());
    }
    Ok(())
}
