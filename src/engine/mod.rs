//! TLS engine facade.
//!
//! A thin, non-blocking wrapper over the TLS library with explicit
//! statuses instead of callbacks: the record pumps feed ciphertext through
//! [`TlsEngine::unwrap`], drain ciphertext through [`TlsEngine::wrap`],
//! and branch on the [`HandshakeStatus`] each call reports.  One call to
//! `unwrap` processes at most one TLS record; one call to `wrap` produces
//! at most one record of application data.
//!
//! The engine is not re-entrant while delegated work is outstanding: once
//! a task has been scheduled and before its completion signal arrives, no
//! further engine call may be made for that connection.

pub mod record;
mod rustls_engine;

pub use rustls_engine::RustlsEngine;

use crate::error::Error;
use crate::exec::DelegatedTask;

/// Handshake progress reported alongside every engine result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake complete (or not started); payload may flow.
    NotHandshaking,
    /// The engine needs more peer records before it can progress.
    NeedUnwrap,
    /// The engine has handshake records to send; call `wrap`.
    NeedWrap,
    /// Delegated work is pending; drain `delegated_task` and park.
    NeedTask,
    /// The ClientHello is available; the caller must select a route and
    /// answer with [`TlsEngine::resolve_client_hello`].
    NeedClientHello,
    /// Reported exactly once, by the call that completed the handshake.
    Finished,
}

/// Record-level outcome of a `wrap`/`unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    /// `unwrap`: the source holds less than one complete record.
    BufferUnderflow,
    /// The destination cannot hold one record's worth of output; nothing
    /// was consumed.
    BufferOverflow,
    /// The direction is closed; no bytes move.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: IoStatus,
    pub handshake: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

/// ClientHello facts exposed while the engine reports
/// [`HandshakeStatus::NeedClientHello`].
#[derive(Debug, Clone, Default)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    /// ALPN protocols the client offered, in preference order.
    pub alpn: Vec<String>,
}

/// Answer to a ClientHello: mirrors the protocol-selector contract of the
/// originating TLS APIs — a concrete protocol, an explicit opt-out of
/// ALPN, or rejection of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlpnChoice {
    Protocol(String),
    NoAlpn,
    Reject,
}

pub trait TlsEngine {
    fn begin_handshake(&mut self) -> Result<(), Error>;

    /// Decrypt at most one record from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error>;

    /// Encrypt up to one record of `src` into `dst`.  With empty `src`,
    /// flushes pending handshake or close records.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error>;

    /// Current status.  Never returns [`HandshakeStatus::Finished`]; the
    /// completion edge is only visible on the result that produced it.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Next pending delegated task, if any.
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// ClientHello facts, while status is `NeedClientHello`.
    fn client_hello(&self) -> Option<&ClientHelloInfo> {
        None
    }

    /// Answer a pending ClientHello.  `Reject` fails the handshake.
    fn resolve_client_hello(&mut self, _choice: AlpnChoice) -> Result<(), Error> {
        Err(Error::EngineState(self.handshake_status()))
    }

    /// Mark the read side closed.  Permitted before the peer's
    /// close_notify; doing so forfeits session resumption for the peer.
    fn close_inbound(&mut self);

    /// Queue close_notify; flushed by the next `wrap`.
    fn close_outbound(&mut self);

    fn is_inbound_done(&self) -> bool;
    fn is_outbound_done(&self) -> bool;

    /// SNI host name requested by the peer, once known.
    fn server_name(&self) -> Option<&str>;

    /// Negotiated ALPN protocol, once the handshake finished.  `None`
    /// when ALPN was not negotiated.
    fn alpn_protocol(&self) -> Option<&str>;
}

/// Supplies engines from named store contexts.
///
/// Store contexts are reference-counted by route registrations: a route
/// naming a store attaches it; unrouting detaches, and the context is
/// dropped at zero.
pub trait EngineProvider {
    type Engine: TlsEngine;

    /// Load (or re-reference) the named store context.  Fails on
    /// unreadable material, an unsupported store type, or exhaustion of
    /// the 256-entry store index space.
    fn attach_store(&mut self, store: Option<&str>) -> Result<(), Error>;

    /// Drop one reference to the named store context.
    fn detach_store(&mut self, store: Option<&str>);

    /// Whether the named store context is currently loaded.
    fn has_context(&self, store: Option<&str>) -> bool;

    /// Server-role engine over the named store.
    fn server_engine(&self, store: Option<&str>) -> Result<Self::Engine, Error>;

    /// Client-role engine trusting the named store, offering
    /// `server_name` as SNI and `alpn` (when present) as the protocol.
    fn client_engine(
        &self,
        store: Option<&str>,
        server_name: Option<&str>,
        alpn: Option<&str>,
    ) -> Result<Self::Engine, Error>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted engine for exercising the pumps and the handshake
    //! coordinator without real TLS.  Records every call so tests can
    //! assert the parked-connection re-entrancy contract.

    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Call {
        BeginHandshake,
        Unwrap,
        Wrap,
        DelegatedTask,
        ResolveClientHello,
        CloseInbound,
        CloseOutbound,
    }

    /// One scripted `unwrap`/`wrap` outcome.
    #[derive(Clone)]
    pub struct Step {
        pub consume: usize,
        pub produce: Vec<u8>,
        pub status: IoStatus,
        pub handshake: HandshakeStatus,
    }

    impl Step {
        pub fn ok(consume: usize, produce: &[u8], handshake: HandshakeStatus) -> Self {
            Self {
                consume,
                produce: produce.to_vec(),
                status: IoStatus::Ok,
                handshake,
            }
        }

        pub fn underflow() -> Self {
            Self {
                consume: 0,
                produce: Vec::new(),
                status: IoStatus::BufferUnderflow,
                handshake: HandshakeStatus::NeedUnwrap,
            }
        }
    }

    pub struct MockEngine {
        pub calls: Vec<Call>,
        pub unwraps: VecDeque<Step>,
        pub wraps: VecDeque<Step>,
        pub tasks: VecDeque<DelegatedTask>,
        pub status: HandshakeStatus,
        pub hello: Option<ClientHelloInfo>,
        pub resolved_with: Option<AlpnChoice>,
        pub inbound_done: bool,
        pub outbound_done: bool,
        pub sni: Option<String>,
        pub alpn: Option<String>,
        pub fail_unwrap: bool,
    }

    impl Default for MockEngine {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                unwraps: VecDeque::new(),
                wraps: VecDeque::new(),
                tasks: VecDeque::new(),
                status: HandshakeStatus::NeedUnwrap,
                hello: None,
                resolved_with: None,
                inbound_done: false,
                outbound_done: false,
                sni: None,
                alpn: None,
                fail_unwrap: false,
            }
        }
    }

    impl MockEngine {
        pub fn calls_of(&self, kind: Call) -> usize {
            self.calls.iter().filter(|c| **c == kind).count()
        }
    }

    impl TlsEngine for MockEngine {
        fn begin_handshake(&mut self) -> Result<(), Error> {
            self.calls.push(Call::BeginHandshake);
            Ok(())
        }

        fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
            self.calls.push(Call::Unwrap);
            if self.fail_unwrap {
                return Err(Error::Tls(rustls::Error::General("scripted failure".into())));
            }
            let step = self.unwraps.pop_front().unwrap_or_else(Step::underflow);
            assert!(step.consume <= src.len(), "script consumed more than fed");
            dst[..step.produce.len()].copy_from_slice(&step.produce);
            self.status = match step.handshake {
                HandshakeStatus::Finished => HandshakeStatus::NotHandshaking,
                other => other,
            };
            Ok(EngineResult {
                status: step.status,
                handshake: step.handshake,
                bytes_consumed: step.consume,
                bytes_produced: step.produce.len(),
            })
        }

        fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
            self.calls.push(Call::Wrap);
            let step = self.wraps.pop_front().unwrap_or(Step {
                consume: src.len().min(record::MAX_PLAINTEXT),
                produce: src[..src.len().min(record::MAX_PLAINTEXT)].to_vec(),
                status: IoStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
            });
            dst[..step.produce.len()].copy_from_slice(&step.produce);
            self.status = match step.handshake {
                HandshakeStatus::Finished => HandshakeStatus::NotHandshaking,
                other => other,
            };
            Ok(EngineResult {
                status: step.status,
                handshake: step.handshake,
                bytes_consumed: step.consume,
                bytes_produced: step.produce.len(),
            })
        }

        fn handshake_status(&self) -> HandshakeStatus {
            self.status
        }

        fn delegated_task(&mut self) -> Option<DelegatedTask> {
            self.calls.push(Call::DelegatedTask);
            self.tasks.pop_front()
        }

        fn client_hello(&self) -> Option<&ClientHelloInfo> {
            self.hello.as_ref()
        }

        fn resolve_client_hello(&mut self, choice: AlpnChoice) -> Result<(), Error> {
            self.calls.push(Call::ResolveClientHello);
            if choice == AlpnChoice::Reject {
                return Err(Error::Tls(rustls::Error::NoApplicationProtocol));
            }
            self.resolved_with = Some(choice);
            self.hello = None;
            self.status = HandshakeStatus::NeedWrap;
            Ok(())
        }

        fn close_inbound(&mut self) {
            self.calls.push(Call::CloseInbound);
            self.inbound_done = true;
        }

        fn close_outbound(&mut self) {
            self.calls.push(Call::CloseOutbound);
            self.outbound_done = true;
        }

        fn is_inbound_done(&self) -> bool {
            self.inbound_done
        }

        fn is_outbound_done(&self) -> bool {
            self.outbound_done
        }

        fn server_name(&self) -> Option<&str> {
            self.sni.as_deref()
        }

        fn alpn_protocol(&self) -> Option<&str> {
            self.alpn.as_deref()
        }
    }
}
