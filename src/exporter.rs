//! Provider-side export bookkeeping.

use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;

use crate::invoker::ProviderInvoker;
use trunk_rpc_core::Endpoint;

pub(crate) struct ExportEntry {
    pub url: Endpoint,
    pub invoker: Arc<dyn ProviderInvoker>,
}

pub(crate) type ExporterMap = Arc<Mutex<FxHashMap<String, ExportEntry>>>;

/// Handle of one exported service. Dropping it changes nothing; call
/// [Exporter::unexport] (or `RpcProtocol::destroy`) to withdraw the
/// service.
pub struct Exporter {
    key: String,
    url: Endpoint,
    map: Weak<Mutex<FxHashMap<String, ExportEntry>>>,
}

impl Exporter {
    pub(crate) fn new(key: String, url: Endpoint, map: &ExporterMap) -> Self {
        Self { key, url, map: Arc::downgrade(map) }
    }

    #[inline]
    pub fn service_key(&self) -> &str {
        &self.key
    }

    /// The effective endpoint, with the real port when the export bound
    /// port 0.
    #[inline]
    pub fn url(&self) -> &Endpoint {
        &self.url
    }

    pub fn unexport(&self) {
        if let Some(map) = self.map.upgrade() {
            if map.lock().unwrap().remove(&self.key).is_some() {
                info!("unexported {}", self.key);
            }
        }
    }
}
