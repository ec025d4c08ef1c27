//! The protocol context: export, refer, destroy.

use std::sync::{Arc, Mutex};

use captains_log::filter::LogFilter;
use rustc_hash::FxHashMap;

use crate::dispatch::ServiceDispatcher;
use crate::exporter::{ExportEntry, Exporter, ExporterMap};
use crate::invoker::{ProviderInvoker, RpcInvoker};
use crate::pool::{RefCountedClient, SharedClientPool};
use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::{Endpoint, Serializer};
use trunk_rpc_exchange::transport::FrameTransport;
use trunk_rpc_exchange::{ExchangeContext, ExchangeFacts, ExchangeServer};

type Dispatcher<S> = ServiceDispatcher<S>;
type Server<F, T, S> = ExchangeServer<F, Dispatcher<S>, T>;

/// One protocol instance: exporter map, one listening server per bind
/// address, and the shared consumer pool, all owned here, nothing global.
/// Tests run as many isolated instances as they like.
pub struct RpcProtocol<F, T, S>
where
    F: ExchangeFacts,
    T: FrameTransport<F::IO>,
    S: Serializer,
{
    facts: Arc<F>,
    ctx: Arc<ExchangeContext>,
    exporters: ExporterMap,
    dispatcher: Arc<Dispatcher<S>>,
    servers: Mutex<FxHashMap<String, Arc<Server<F, T, S>>>>,
    pool: SharedClientPool<F, Dispatcher<S>, T>,
    logger: Arc<LogFilter>,
}

impl<F, T, S> RpcProtocol<F, T, S>
where
    F: ExchangeFacts,
    T: FrameTransport<F::IO>,
    S: Serializer,
{
    pub fn new(facts: Arc<F>) -> Arc<Self> {
        let ctx = ExchangeContext::new();
        ctx.start_ticker(facts.as_ref());
        let exporters: ExporterMap = Arc::new(Mutex::new(FxHashMap::default()));
        let dispatcher = ServiceDispatcher::new(exporters.clone(), facts.new_logger());
        let pool = SharedClientPool::new(facts.clone(), ctx.clone(), dispatcher.clone());
        let logger = facts.new_logger();
        Arc::new(Self { facts, ctx, exporters, dispatcher, servers: Mutex::new(FxHashMap::default()), pool, logger })
    }

    #[inline]
    pub fn context(&self) -> &Arc<ExchangeContext> {
        &self.ctx
    }

    /// Register `invoker` under the URL's service key and make sure a
    /// server listens on the URL's bind address (one per address, reset on
    /// re-use). Binding port 0 rewrites the advertised port to the real
    /// one.
    pub fn export(
        &self, url: Endpoint, invoker: Arc<dyn ProviderInvoker>,
    ) -> Result<Exporter, RemotingError> {
        let server = self.open_server(&url)?;
        let url = if url.port() == 0 { url.with_port(server.local_port()) } else { url };
        let key = url.service_key();
        {
            let mut map = self.exporters.lock().unwrap();
            if map.contains_key(&key) {
                return Err(RemotingError::DuplicateExport(key));
            }
            map.insert(key.clone(), ExportEntry { url: url.clone(), invoker });
        }
        logger_info!(self.logger, "exported {} at {}", key, url.address());
        Ok(Exporter::new(key, url, &self.exporters))
    }

    fn open_server(&self, url: &Endpoint) -> Result<Arc<Server<F, T, S>>, RemotingError> {
        let addr = url.address();
        let mut servers = self.servers.lock().unwrap();
        if let Some(server) = servers.get(&addr) {
            // an export over a live address resets the live tunables
            server.reset(url);
            return Ok(server.clone());
        }
        let server = Arc::new(ExchangeServer::bind(
            self.facts.clone(),
            self.ctx.clone(),
            url.clone(),
            self.dispatcher.clone(),
        )?);
        servers.insert(addr, server.clone());
        Ok(server)
    }

    /// Build a consumer invoker for `url`: dedicated clients when
    /// `connections > 0`, otherwise the shared pool sized by
    /// `share-connections`.
    pub async fn refer(&self, url: Endpoint) -> Result<RpcInvoker<F, T, S>, RemotingError> {
        let dedicated = url.connections();
        let clients = if dedicated > 0 {
            let mut list = Vec::with_capacity(dedicated);
            for _ in 0..dedicated {
                list.push(
                    RefCountedClient::build(
                        self.facts.clone(),
                        self.ctx.clone(),
                        self.dispatcher.clone(),
                        url.clone(),
                    )
                    .await?,
                );
            }
            list
        } else {
            self.pool.get(&url, url.share_connections()).await?
        };
        logger_debug!(self.logger, "referred {} with {} clients", url.address(), clients.len());
        Ok(RpcInvoker::new(url, clients))
    }

    /// Tear the whole instance down: close every server with its shutdown
    /// timeout (readonly broadcast included), release every pooled client,
    /// forget the exporters.
    pub async fn destroy(&self) {
        let servers: Vec<Arc<Server<F, T, S>>> = {
            let mut map = self.servers.lock().unwrap();
            map.drain().map(|(_, s)| s).collect()
        };
        for server in servers {
            server.close(server.shutdown_timeout()).await;
        }
        self.pool.close_all().await;
        self.exporters.lock().unwrap().clear();
        logger_info!(self.logger, "protocol instance destroyed");
    }
}
