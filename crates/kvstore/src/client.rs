//! In-process handle to the store loop.
//!
//! This is what the other subsystems hold: a cloneable client that sends
//! commands over a channel and subscribes to the publication bus. The
//! `persist_key` helper keeps an advertised key alive the way the prefix
//! and link modules do, refreshing its TTL and re-advertising with a
//! bumped version if someone else overwrote it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use eyre::{bail, eyre, Result as EyreResult};
use meridian_primitives::{
    KeyDumpParams, KeyGetParams, KeySetParams, KvRequest, KvResponse, PeerAddParams, PeerCmdReply,
    PeerDelParams, PeerSpec, Publication, Value,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

pub(crate) struct ClientCommand {
    pub request: KvRequest,
    pub reply: oneshot::Sender<KvResponse>,
}

#[derive(Clone, Debug)]
pub struct KvStoreClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    publications: broadcast::Sender<Publication>,
    cmd_addr: SocketAddr,
    pub_addr: SocketAddr,
}

impl KvStoreClient {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<ClientCommand>,
        publications: broadcast::Sender<Publication>,
        cmd_addr: SocketAddr,
        pub_addr: SocketAddr,
    ) -> Self {
        Self {
            cmd_tx,
            publications,
            cmd_addr,
            pub_addr,
        }
    }

    /// Where the command listener actually bound (useful with port 0).
    pub fn cmd_addr(&self) -> SocketAddr {
        self.cmd_addr
    }

    pub fn pub_addr(&self) -> SocketAddr {
        self.pub_addr
    }

    /// Live stream of everything the store publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.publications.subscribe()
    }

    pub async fn request(&self, request: KvRequest) -> EyreResult<KvResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| eyre!("key-value store is gone"))?;
        reply_rx
            .await
            .map_err(|_| eyre!("key-value store dropped the request"))
    }

    pub async fn set_key(&self, key: &str, value: Value) -> EyreResult<()> {
        let mut key_vals = BTreeMap::new();
        let _ = key_vals.insert(key.to_owned(), value);
        let params = KeySetParams {
            key_vals,
            solicit_response: true,
            ..Default::default()
        };
        match self.request(KvRequest::KeySet(params)).await? {
            KvResponse::Ok => Ok(()),
            KvResponse::Error(reason) => bail!("key-set rejected: {reason}"),
            other => bail!("unexpected key-set response: {other:?}"),
        }
    }

    pub async fn get_key(&self, key: &str) -> EyreResult<Option<Value>> {
        let params = KeyGetParams {
            keys: vec![key.to_owned()],
        };
        match self.request(KvRequest::KeyGet(params)).await? {
            KvResponse::Publication(mut publication) => Ok(publication.key_vals.remove(key)),
            KvResponse::Error(reason) => bail!("key-get rejected: {reason}"),
            other => bail!("unexpected key-get response: {other:?}"),
        }
    }

    /// Dump of every entry matching the comma-separated prefix list.
    pub async fn dump_all(&self, prefix: &str) -> EyreResult<BTreeMap<String, Value>> {
        let params = KeyDumpParams {
            prefix: prefix.to_owned(),
            ..Default::default()
        };
        match self.request(KvRequest::KeyDump(params)).await? {
            KvResponse::Publication(publication) => Ok(publication.key_vals),
            KvResponse::Error(reason) => bail!("key-dump rejected: {reason}"),
            other => bail!("unexpected key-dump response: {other:?}"),
        }
    }

    pub async fn add_peers(&self, peers: BTreeMap<String, PeerSpec>) -> EyreResult<PeerCmdReply> {
        match self
            .request(KvRequest::PeerAdd(PeerAddParams { peers }))
            .await?
        {
            KvResponse::Peers(reply) => Ok(reply),
            KvResponse::Error(reason) => bail!("peer-add rejected: {reason}"),
            other => bail!("unexpected peer-add response: {other:?}"),
        }
    }

    pub async fn del_peers(&self, peer_names: Vec<String>) -> EyreResult<PeerCmdReply> {
        match self
            .request(KvRequest::PeerDel(PeerDelParams { peer_names }))
            .await?
        {
            KvResponse::Peers(reply) => Ok(reply),
            KvResponse::Error(reason) => bail!("peer-del rejected: {reason}"),
            other => bail!("unexpected peer-del response: {other:?}"),
        }
    }

    pub async fn dump_peers(&self) -> EyreResult<PeerCmdReply> {
        match self.request(KvRequest::PeerDump).await? {
            KvResponse::Peers(reply) => Ok(reply),
            other => bail!("unexpected peer-dump response: {other:?}"),
        }
    }

    pub async fn counters(&self) -> EyreResult<BTreeMap<String, i64>> {
        match self.request(KvRequest::CountersGet).await? {
            KvResponse::Counters(counters) => Ok(counters),
            other => bail!("unexpected counters response: {other:?}"),
        }
    }

    /// Keeps `key` advertised: refreshes the TTL while our record is
    /// current and re-advertises with a bumped version whenever another
    /// record displaced ours. Abort the handle to stop persisting.
    pub fn persist_key(
        &self,
        key: String,
        payload: Vec<u8>,
        ttl_ms: i64,
        originator_id: String,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            // Refresh well before expiry.
            let refresh = Duration::from_millis((ttl_ms.max(4) as u64) * 3 / 4);
            let mut ticks = interval(refresh);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let _ = ticks.tick().await;
                if let Err(err) =
                    advertise(&client, &key, &payload, ttl_ms, &originator_id).await
                {
                    warn!(%key, %err, "failed to advertise persistent key");
                }
            }
        })
    }
}

async fn advertise(
    client: &KvStoreClient,
    key: &str,
    payload: &[u8],
    ttl_ms: i64,
    originator_id: &str,
) -> EyreResult<()> {
    let existing = client.get_key(key).await?;

    let value = match &existing {
        Some(current)
            if current.originator_id == originator_id
                && current.value.as_deref() == Some(payload) =>
        {
            debug!(%key, ttl_version = current.ttl_version + 1, "refreshing key ttl");
            Value::ttl_refresh(
                current.version,
                originator_id,
                ttl_ms,
                current.ttl_version + 1,
            )
        }
        _ => {
            let version = existing.map_or(0, |current| current.version) + 1;
            debug!(%key, version, "advertising key");
            Value::new(version, originator_id, payload.to_vec(), ttl_ms)
        }
    };

    client.set_key(key, value).await
}
