use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use common::config::ServerConfig;

/// the services that make up the media server backend
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ServiceType {
    Fs,
    Cache,
    FileOps,
}

/// entanglement-style message passing: without higher-kinded types, an
/// enum-of-enums lets every service share one channel type
pub type ESMSender = tokio::sync::mpsc::Sender<ESM>;
pub type ESMReceiver = tokio::sync::mpsc::Receiver<ESM>;

/// message responses are carried back via oneshot channels
pub type ESMResp<T> = tokio::sync::oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub enum ESM {
    Fs(crate::fs::msg::FsMsg),
    Cache(crate::cache::msg::CacheMsg),
    FileOps(crate::fileops::msg::FileOpsMsg),
}

/// service registry: each service is instantiated once and shares one
/// message namespace, so callers look up a sender by `ServiceType` rather
/// than holding direct references to each other
#[derive(Clone, Debug)]
pub struct ESMRegistry(Arc<DashMap<ServiceType, ESMSender>>);

impl ESMRegistry {
    pub fn new() -> Self {
        ESMRegistry(Arc::new(DashMap::new()))
    }

    pub fn insert(&self, k: ServiceType, v: ESMSender) -> Result<()> {
        match self.0.insert(k.clone(), v) {
            None => Ok(()),
            Some(prev) => {
                self.0.insert(k, prev);
                Err(anyhow::Error::msg(
                    "internal error: a sender was added twice to the registry",
                ))
            }
        }
    }

    pub fn get(&self, k: &ServiceType) -> Result<ESMSender> {
        Ok(self
            .0
            .get(k)
            .ok_or_else(|| {
                anyhow::Error::msg(format!(
                    "internal error: a service was started without a necessary dependency ({k:?})"
                ))
            })?
            .clone())
    }
}

impl Default for ESMRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait EntanglementService: Send + Sync + 'static {
    type Inner: ESInner;

    fn create(config: Arc<ServerConfig>, registry: &ESMRegistry) -> Self;

    async fn start(&self, registry: &ESMRegistry) -> Result<()>;
}

/// service message responder: in the spirit of tower, rpc calls route
/// through `message_handler` and reply via `respond` rather than writing to
/// their oneshot channel directly, so the rpc methods themselves stay
/// callable from other rpc methods without juggling `Option<resp>`
#[async_trait]
pub trait ESInner: Sized + Send + Sync + 'static {
    fn new(config: Arc<ServerConfig>, registry: ESMRegistry) -> Result<Self>;

    fn registry(&self) -> ESMRegistry;

    async fn message_handler(&self, esm: ESM) -> Result<()>;

    async fn respond<T, Fut>(&self, resp: ESMResp<T>, fut: Fut) -> Result<()>
    where
        T: Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        resp.send(fut.await).map_err(|_| {
            anyhow::Error::msg(format!(
                "failed to respond to a {} message",
                std::any::type_name::<T>()
            ))
        })
    }
}
