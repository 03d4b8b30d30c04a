#![forbid(unsafe_code)]

//! milli-tls — sans-io TLS termination and origination for shared-memory
//! stream dataplanes.
//!
//! The module owns no sockets and spawns no threads.  The host dataplane
//! feeds it encoded stream messages (`BEGIN`/`DATA`/`END`/`ABORT`/
//! `WINDOW`/`RESET`/`SIGNAL`) through [`TlsModule::on_message`] and
//! drains the messages it produces through [`TlsModule::poll_message`] —
//! the same feed/poll discipline as the rest of the milli family.
//!
//! Server role: ciphertext on a peer-initiated network stream is
//! decrypted toward an application target selected by SNI/ALPN route
//! matching.  Client role: application cleartext is encrypted toward a
//! route's remote address.  TLS itself comes from `rustls`; delegated
//! engine work runs on a host-supplied [`exec::Executor`] and resumes via
//! SIGNAL messages.

pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod exec;
pub mod frame;
pub mod ids;
pub mod route;
pub mod slab;
pub mod store;

mod client;
mod host;
mod server;

pub use config::TlsConfig;
pub use counters::{Counter, Counters};
pub use engine::{
    AlpnChoice, ClientHelloInfo, EngineProvider, EngineResult, HandshakeStatus, IoStatus,
    RustlsEngine, TlsEngine,
};
pub use error::Error;
pub use exec::{DeferredExecutor, DelegatedTask, Executor, TaskHandle};
pub use frame::{Message, TlsBeginEx, MAX_PAYLOAD_LENGTH, REPLY_BIT};
pub use ids::{SequenceIds, StreamIds};
pub use route::{Route, RouteKind, RouteTable, TlsRouteEx};
pub use store::PemProvider;

use std::collections::VecDeque;

use tracing::{debug, warn};

use client::ClientFactory;
use counters::{add, RouteCounters};
use host::Host;
use server::ServerFactory;

/// One TLS module instance, owning both role factories and their shared
/// registries.  Initialize once at worker start; drop on worker shutdown.
pub struct TlsModule<P: EngineProvider = PemProvider, X: Executor = DeferredExecutor> {
    routes: RouteTable,
    provider: P,
    counters: Counters,
    ids: Box<dyn StreamIds>,
    executor: X,
    server: ServerFactory<P::Engine>,
    client: ClientFactory<P::Engine>,
    out: VecDeque<Vec<u8>>,
    frozen: bool,
}

impl TlsModule<PemProvider, DeferredExecutor> {
    /// Module with the PEM store provider and a deferred executor the
    /// host drains itself.
    pub fn new(config: TlsConfig) -> Self {
        let provider = PemProvider::new(&config);
        Self::with_parts(config, provider, DeferredExecutor::new())
    }
}

impl<P: EngineProvider, X: Executor> TlsModule<P, X> {
    pub fn with_parts(config: TlsConfig, provider: P, executor: X) -> Self {
        let mut counters = Counters::new();
        let server = ServerFactory::new("server", &config, &mut counters);
        let client = ClientFactory::new("client", &config, &mut counters);
        Self {
            routes: RouteTable::new(),
            provider,
            counters,
            ids: Box::new(SequenceIds::default()),
            executor,
            server,
            client,
            out: VecDeque::new(),
            frozen: false,
        }
    }

    /// Replace the id supplier (the host's allocator facade).
    pub fn with_ids(mut self, ids: Box<dyn StreamIds>) -> Self {
        self.ids = ids;
        self
    }

    /// Control plane: register a route.  Loads (or re-references) its
    /// store context; a load failure or store-index overflow rejects the
    /// route.
    pub fn handle_route(&mut self, route: Route) -> bool {
        if self.frozen {
            return false;
        }
        let store = route.extension.store.clone();
        if let Err(err) = self.provider.attach_store(store.as_deref()) {
            warn!(route_id = route.route_id, %err, "route rejected");
            return false;
        }
        if !self.routes.insert(route) {
            self.provider.detach_store(store.as_deref());
            return false;
        }
        true
    }

    /// Control plane: remove a route and drop its store reference.
    pub fn handle_unroute(&mut self, route_id: u64) -> bool {
        match self.routes.remove(route_id) {
            None => false,
            Some(route) => {
                self.provider
                    .detach_store(route.extension.store.as_deref());
                true
            }
        }
    }

    /// Control plane: stop accepting route changes.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Feed one encoded stream message from the host.
    pub fn on_message(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let msg = Message::decode(bytes)?;
        self.receive(msg);
        Ok(())
    }

    /// Feed one decoded stream message.
    pub fn receive(&mut self, msg: Message) {
        let route_counters = RouteCounters::supply(&mut self.counters, msg.route_id());
        add(&route_counters.frames_read, 1);
        if let Message::Data(data) = &msg {
            add(&route_counters.bytes_read, data.payload.len() as u64);
        }

        let Self {
            routes,
            provider,
            counters,
            ids,
            executor,
            server,
            client,
            out,
            ..
        } = self;
        let mut host = Host {
            routes,
            ids: ids.as_mut(),
            executor,
            counters,
            out,
        };

        let stream_id = msg.stream_id();
        if server.owns(stream_id) {
            server.on_message(&mut host, msg);
        } else if client.owns(stream_id) {
            client.on_message(&mut host, msg);
        } else if let Message::Begin(begin) = msg {
            if begin.stream_id & REPLY_BIT == 0 {
                new_stream(&mut host, provider, server, client, &begin);
            } else if server.owns_correlation(begin.correlation_id) {
                server.on_reply_begin(&mut host, &begin);
            } else if client.owns_correlation(begin.correlation_id) {
                client.on_reply_begin(&mut host, &begin);
            } else {
                debug!(
                    stream_id = begin.stream_id,
                    correlation_id = begin.correlation_id,
                    "reply begin without correlation"
                );
                host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
            }
        }
        // Non-BEGIN messages for unknown streams are dropped.
    }

    /// Next encoded message for the host, if any.
    pub fn poll_message(&mut self) -> Option<Vec<u8>> {
        self.out.pop_front()
    }

    /// Current value of a named accumulator.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.value(name)
    }

    pub fn executor_mut(&mut self) -> &mut X {
        &mut self.executor
    }
}

/// Stream-factory dispatch for a new accept-direction stream: resolve
/// the route named by the BEGIN, check its store context, and hand the
/// stream to the matching role factory.  Streams nobody can serve are
/// reset.
fn new_stream<P: EngineProvider>(
    host: &mut Host<'_>,
    provider: &mut P,
    server: &mut ServerFactory<P::Engine>,
    client: &mut ClientFactory<P::Engine>,
    begin: &frame::Begin,
) {
    let Some(route) = host.routes.get(begin.route_id) else {
        debug!(route_id = begin.route_id, "begin for unknown route");
        host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
        return;
    };
    let store = route.extension.store.clone();

    match route.kind {
        RouteKind::Server => match provider.server_engine(store.as_deref()) {
            Ok(engine) => server.new_accept(host, engine, begin),
            Err(err) => {
                debug!(route_id = begin.route_id, %err, "no server context for route");
                host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
            }
        },
        RouteKind::Client => {
            let ex = match TlsBeginEx::decode(&begin.extension) {
                Ok(ex) => ex,
                Err(err) => {
                    debug!(stream_id = begin.stream_id, %err, "malformed begin extension");
                    host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
                    return;
                }
            };
            let hostname = ex.hostname.or_else(|| route.extension.hostname.clone());
            let protocol = ex
                .application_protocol
                .or_else(|| route.extension.application_protocol.clone());
            let route_id = route.route_id;
            match provider.client_engine(store.as_deref(), hostname.as_deref(), protocol.as_deref())
            {
                Ok(engine) => client.new_accept(host, engine, begin, route_id),
                Err(err) => {
                    debug!(route_id = begin.route_id, %err, "no client context for route");
                    host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
                }
            }
        }
    }
}
