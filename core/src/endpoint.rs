//! Endpoint configuration model.
//!
//! An [Endpoint] is an opaque `host:port/path?key=value` bag. Every tunable
//! of the stack (timeouts, heartbeat, payload bound, pool sizing, codec and
//! serialization names) is read from it through typed accessors with
//! defaults, so transports and the exchange layer never carry their own
//! config structs around. An Endpoint is immutable; reconfiguration builds
//! a new value via [Endpoint::with_param] and re-derives dependent state.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Recognized parameter keys and their process-wide defaults.
pub mod params {
    use std::time::Duration;

    pub const VERSION: &str = "version";
    pub const GROUP: &str = "group";
    pub const TIMEOUT: &str = "timeout";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PAYLOAD: &str = "payload";
    pub const ACCEPTS: &str = "accepts";
    pub const CONNECTIONS: &str = "connections";
    pub const SHARE_CONNECTIONS: &str = "share-connections";
    pub const SERIALIZATION: &str = "serialization";
    pub const CODEC: &str = "codec";
    pub const CLIENT: &str = "client";
    pub const SERVER: &str = "server";
    pub const LAZY: &str = "lazy";
    pub const LAZY_INITIAL_STATE: &str = "connect.lazy.initial.state";
    pub const ANYHOST: &str = "anyhost";
    pub const BIND_IP: &str = "bind.ip";
    pub const BIND_PORT: &str = "bind.port";
    pub const QUEUES: &str = "queues";
    pub const INFLIGHTS: &str = "inflights";
    pub const CONNECT_TIMEOUT: &str = "connect.timeout";
    pub const WRITE_TIMEOUT: &str = "write.timeout";
    pub const BUFFER: &str = "buffer";
    pub const RECONNECT: &str = "reconnect";
    pub const RECONNECT_WARN_PERIOD: &str = "reconnect.warning.period";
    pub const SHUTDOWN_TIMEOUT: &str = "shutdown.timeout";
    pub const READONLY_SENT: &str = "channel.readonly.sent";
    pub const ON_CONNECT: &str = "onconnect";
    pub const ON_DISCONNECT: &str = "ondisconnect";
    pub const STUB_EVENT: &str = "stub.event";
    pub const CALLBACK_SERVICE_KEY: &str = "callback.service.key";

    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(60_000);
    /// 8 MiB serialized body bound; 0 disables the check.
    pub const DEFAULT_PAYLOAD: usize = 8 * 1024 * 1024;
    /// 0 means unlimited concurrent channels.
    pub const DEFAULT_ACCEPTS: usize = 0;
    pub const DEFAULT_SHARE_CONNECTIONS: usize = 1;
    pub const DEFAULT_SERIALIZATION: &str = "msgpack";
    pub const DEFAULT_CODEC: &str = "exchange";
    pub const DEFAULT_TRANSPORT: &str = "tcp";
    pub const DEFAULT_QUEUES: usize = 128;
    /// Bound of concurrently executing server invocations per channel.
    pub const DEFAULT_INFLIGHTS: usize = 200;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const DEFAULT_BUFFER: usize = 8 * 1024;
    /// Reconnect probes never run more often than this.
    pub const MIN_RECONNECT: Duration = Duration::from_millis(2000);
    pub const DEFAULT_RECONNECT_WARN_PERIOD: u64 = 10;
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(10_000);
}

/// Compose the unique provider-side service key `{group/}{path}{:version}:{port}`.
pub fn service_key(group: Option<&str>, path: &str, version: Option<&str>, port: u16) -> String {
    let mut key = String::with_capacity(path.len() + 16);
    if let Some(g) = group {
        if !g.is_empty() {
            key.push_str(g);
            key.push('/');
        }
    }
    key.push_str(path);
    if let Some(v) = version {
        if !v.is_empty() {
            key.push(':');
            key.push_str(v);
        }
    }
    key.push(':');
    key.push_str(&port.to_string());
    key
}

#[derive(Clone, Default)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
    params: HashMap<String, String>,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, path: &str) -> Self {
        Self { host: host.to_string(), port, path: path.to_string(), params: HashMap::new() }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The service interface name this endpoint exports or refers.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port` of the remote (or advertised local) address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The address a server socket should bind, honoring `bind.ip`,
    /// `bind.port` and `anyhost`. An invalid or wildcard-ish bind host
    /// falls back to `0.0.0.0`.
    pub fn bind_addr(&self) -> String {
        let mut ip = self.param(params::BIND_IP).unwrap_or(&self.host);
        if self.bool_param(params::ANYHOST, false) || !valid_bind_host(ip) {
            ip = "0.0.0.0";
        }
        let port = self
            .param(params::BIND_PORT)
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(self.port);
        format!("{}:{}", ip, port)
    }

    /// Rewrite the advertised port, used when binding port 0 resolved to an
    /// ephemeral one.
    pub fn with_port(&self, port: u16) -> Self {
        let mut url = self.clone();
        url.port = port;
        url
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn with_param(&self, key: &str, value: &str) -> Self {
        let mut url = self.clone();
        url.params.insert(key.to_string(), value.to_string());
        url
    }

    pub fn with_param_if_absent(&self, key: &str, value: &str) -> Self {
        if self.params.contains_key(key) {
            return self.clone();
        }
        self.with_param(key, value)
    }

    /// Merge `other`'s parameters over this endpoint, the reset operation:
    /// the result is a fresh Endpoint, derived state must be rebuilt.
    pub fn with_params_of(&self, other: &Endpoint) -> Self {
        let mut url = self.clone();
        for (k, v) in other.params.iter() {
            url.params.insert(k.clone(), v.clone());
        }
        url
    }

    pub fn bool_param(&self, key: &str, default: bool) -> bool {
        match self.param(key) {
            Some(v) => v == "true" || v == "1",
            None => default,
        }
    }

    pub fn usize_param(&self, key: &str, default: usize) -> usize {
        self.param(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn u64_param(&self, key: &str, default: u64) -> u64 {
        self.param(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Millisecond duration parameter; non-positive values fall back.
    pub fn ms_param(&self, key: &str, default: Duration) -> Duration {
        match self.param(key).and_then(|v| v.parse::<i64>().ok()) {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => default,
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.param(params::VERSION)
    }

    pub fn group(&self) -> Option<&str> {
        self.param(params::GROUP)
    }

    pub fn timeout(&self) -> Duration {
        self.ms_param(params::TIMEOUT, params::DEFAULT_TIMEOUT)
    }

    /// Heartbeat interval; zero disables the watcher.
    pub fn heartbeat(&self) -> Duration {
        match self.param(params::HEARTBEAT).and_then(|v| v.parse::<i64>().ok()) {
            Some(ms) if ms <= 0 => Duration::ZERO,
            Some(ms) => Duration::from_millis(ms as u64),
            None => params::DEFAULT_HEARTBEAT,
        }
    }

    pub fn payload_limit(&self) -> usize {
        self.usize_param(params::PAYLOAD, params::DEFAULT_PAYLOAD)
    }

    pub fn accepts(&self) -> usize {
        self.usize_param(params::ACCEPTS, params::DEFAULT_ACCEPTS)
    }

    pub fn connections(&self) -> usize {
        self.usize_param(params::CONNECTIONS, 0)
    }

    pub fn share_connections(&self) -> usize {
        self.usize_param(params::SHARE_CONNECTIONS, params::DEFAULT_SHARE_CONNECTIONS).max(1)
    }

    pub fn serialization(&self) -> &str {
        self.param(params::SERIALIZATION).unwrap_or(params::DEFAULT_SERIALIZATION)
    }

    pub fn codec_name(&self) -> &str {
        self.param(params::CODEC).unwrap_or(params::DEFAULT_CODEC)
    }

    pub fn lazy(&self) -> bool {
        self.bool_param(params::LAZY, false)
    }

    pub fn queues(&self) -> usize {
        self.usize_param(params::QUEUES, params::DEFAULT_QUEUES).max(1)
    }

    pub fn inflight_limit(&self) -> usize {
        self.usize_param(params::INFLIGHTS, params::DEFAULT_INFLIGHTS)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.ms_param(params::CONNECT_TIMEOUT, params::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn write_timeout(&self) -> Duration {
        self.ms_param(params::WRITE_TIMEOUT, params::DEFAULT_WRITE_TIMEOUT)
    }

    pub fn buffer_size(&self) -> usize {
        self.usize_param(params::BUFFER, params::DEFAULT_BUFFER).max(512)
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.ms_param(params::RECONNECT, params::MIN_RECONNECT).max(params::MIN_RECONNECT)
    }

    pub fn reconnect_warn_period(&self) -> u64 {
        self.u64_param(params::RECONNECT_WARN_PERIOD, params::DEFAULT_RECONNECT_WARN_PERIOD)
            .max(1)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.ms_param(params::SHUTDOWN_TIMEOUT, params::DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn readonly_sent(&self) -> bool {
        self.bool_param(params::READONLY_SENT, true)
    }

    pub fn on_connect(&self) -> Option<&str> {
        self.param(params::ON_CONNECT).filter(|m| !m.is_empty())
    }

    pub fn on_disconnect(&self) -> Option<&str> {
        self.param(params::ON_DISCONNECT).filter(|m| !m.is_empty())
    }

    pub fn stub_event(&self) -> bool {
        self.bool_param(params::STUB_EVENT, false)
    }

    /// `{group/}{path}{:version}:{port}` of this endpoint.
    pub fn service_key(&self) -> String {
        service_key(self.group(), &self.path, self.version(), self.port)
    }
}

fn valid_bind_host(host: &str) -> bool {
    if host.is_empty() || host == "localhost" || host == "0.0.0.0" {
        return false;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => !ip.is_unspecified(),
        // hostname, leave it to the resolver
        Err(_) => true,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint {0:?}")]
pub struct InvalidEndpoint(String);

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    /// Parse `host:port[/path][?key=value[&key=value]*]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_path, query) = match s.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (s, None),
        };
        let (addr, path) = match addr_path.split_once('/') {
            Some((a, p)) => (a, p),
            None => (addr_path, ""),
        };
        let (host, port_str) =
            addr.rsplit_once(':').ok_or_else(|| InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(InvalidEndpoint(s.to_string()));
        }
        let port = port_str.parse::<u16>().map_err(|_| InvalidEndpoint(s.to_string()))?;
        let mut url = Endpoint::new(host, port, path);
        if let Some(q) = query {
            for pair in q.split('&') {
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((k, v)) => url.params.insert(k.to_string(), v.to_string()),
                    None => url.params.insert(pair.to_string(), "true".to_string()),
                };
            }
        }
        Ok(url)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        if !self.params.is_empty() {
            let mut keys: Vec<&String> = self.params.keys().collect();
            keys.sort();
            for (i, k) in keys.into_iter().enumerate() {
                write!(f, "{}{}={}", if i == 0 { "?" } else { "&" }, k, &self.params[k])?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let url: Endpoint =
            "10.0.0.3:20880/com.acme.Echo?group=g1&timeout=500&version=1.0.0".parse().expect("parse");
        assert_eq!(url.host(), "10.0.0.3");
        assert_eq!(url.port(), 20880);
        assert_eq!(url.path(), "com.acme.Echo");
        assert_eq!(url.timeout(), Duration::from_millis(500));
        assert_eq!(url.version(), Some("1.0.0"));
        assert_eq!(url.service_key(), "g1/com.acme.Echo:1.0.0:20880");
        let s = url.to_string();
        let url2: Endpoint = s.parse().expect("reparse");
        assert_eq!(url2.to_string(), s);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("hostonly".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_defaults() {
        let url: Endpoint = "127.0.0.1:0/svc".parse().unwrap();
        assert_eq!(url.timeout(), params::DEFAULT_TIMEOUT);
        assert_eq!(url.heartbeat(), params::DEFAULT_HEARTBEAT);
        assert_eq!(url.payload_limit(), 8 * 1024 * 1024);
        assert_eq!(url.accepts(), 0);
        assert_eq!(url.share_connections(), 1);
        assert_eq!(url.serialization(), "msgpack");
        assert!(url.readonly_sent());
        assert!(!url.lazy());
        assert_eq!(url.service_key(), "svc:0");
    }

    #[test]
    fn test_heartbeat_disable() {
        let url: Endpoint = "127.0.0.1:1/svc?heartbeat=0".parse().unwrap();
        assert_eq!(url.heartbeat(), Duration::ZERO);
        let url: Endpoint = "127.0.0.1:1/svc?heartbeat=-1".parse().unwrap();
        assert_eq!(url.heartbeat(), Duration::ZERO);
    }

    #[test]
    fn test_bind_addr() {
        let url: Endpoint = "10.1.2.3:7000/svc".parse().unwrap();
        assert_eq!(url.bind_addr(), "10.1.2.3:7000");
        let url = url.with_param(params::ANYHOST, "true");
        assert_eq!(url.bind_addr(), "0.0.0.0:7000");
        let url: Endpoint = "localhost:7000/svc?bind.port=7001".parse().unwrap();
        assert_eq!(url.bind_addr(), "0.0.0.0:7001");
        let url: Endpoint = "example.com:7000/svc?bind.ip=192.168.0.9".parse().unwrap();
        assert_eq!(url.bind_addr(), "192.168.0.9:7000");
    }

    #[test]
    fn test_reconnect_floor() {
        let url: Endpoint = "127.0.0.1:1/svc?reconnect=100".parse().unwrap();
        assert_eq!(url.reconnect_interval(), params::MIN_RECONNECT);
        let url: Endpoint = "127.0.0.1:1/svc?reconnect=5000".parse().unwrap();
        assert_eq!(url.reconnect_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_reset_produces_new_value() {
        let url: Endpoint = "127.0.0.1:1/svc?accepts=10".parse().unwrap();
        let patch: Endpoint = "127.0.0.1:1/svc?accepts=20&queues=4".parse().unwrap();
        let updated = url.with_params_of(&patch);
        assert_eq!(url.accepts(), 10);
        assert_eq!(updated.accepts(), 20);
        assert_eq!(updated.queues(), 4);
    }
}
