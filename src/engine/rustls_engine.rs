//! rustls-backed engine.
//!
//! Server handshakes start in [`rustls::server::Acceptor`] so the
//! ClientHello can drive route selection before a connection exists; the
//! chosen route's protocol becomes the per-connection `ServerConfig`
//! ALPN.  After that (and for the client role from the start) the engine
//! is a record pump over [`rustls::Connection`]:
//! `read_tls` → `process_new_packets` → `reader()` on unwrap,
//! `writer()` → `write_tls` on wrap.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::server::{Accepted, Acceptor};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig};

use super::record;
use super::{AlpnChoice, ClientHelloInfo, EngineResult, HandshakeStatus, IoStatus, TlsEngine};
use crate::error::Error;
use crate::exec::DelegatedTask;

enum Phase {
    /// Reading ClientHello records.
    Accepting(Acceptor),
    /// ClientHello parsed; waiting for `resolve_client_hello`.
    Hello(Box<Accepted>),
    /// Connection built; records flow.
    Active(Box<Connection>),
    /// Fatal failure mid-transition; every operation reports closed.
    Poisoned,
}

pub struct RustlsEngine {
    phase: Phase,
    /// Store-level server config; ALPN replaced per ClientHello.
    base: Option<Arc<ServerConfig>>,
    hello: Option<ClientHelloInfo>,
    handshaking: bool,
    /// Finished edge, reported once on the completing result.
    finished: bool,
    inbound_done: bool,
    outbound_closing: bool,
    sni: Option<String>,
    alpn: Option<String>,
}

impl RustlsEngine {
    /// Server-role engine over the store's base config.
    pub fn server(base: Arc<ServerConfig>) -> Self {
        Self {
            phase: Phase::Accepting(Acceptor::default()),
            base: Some(base),
            hello: None,
            handshaking: true,
            finished: false,
            inbound_done: false,
            outbound_closing: false,
            sni: None,
            alpn: None,
        }
    }

    /// Client-role engine; `server_name` is the SNI to offer.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::Tls(rustls::Error::General("invalid server name".into())))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            phase: Phase::Active(Box::new(Connection::from(conn))),
            base: None,
            hello: None,
            handshaking: true,
            finished: false,
            inbound_done: false,
            outbound_closing: false,
            sni: Some(server_name.to_string()),
            alpn: None,
        })
    }

    /// The completion edge waits for the final flight to flush (a client
    /// finishes internally on the server's Finished but must still send
    /// its own), so `Finished` is only reported once nothing is pending.
    fn note_handshake_edge(&mut self, conn: &Connection) {
        if self.handshaking && !conn.is_handshaking() && !conn.wants_write() {
            self.handshaking = false;
            self.finished = true;
            self.alpn = conn
                .alpn_protocol()
                .and_then(|p| std::str::from_utf8(p).ok())
                .map(str::to_string);
            if let Connection::Server(server) = conn {
                if let Some(name) = server.server_name() {
                    self.sni = Some(name.to_string());
                }
            }
        }
    }

    fn take_result_status(&mut self, conn: &Connection) -> HandshakeStatus {
        if self.finished {
            self.finished = false;
            return HandshakeStatus::Finished;
        }
        self.active_status(conn)
    }

    fn active_status(&self, conn: &Connection) -> HandshakeStatus {
        if self.handshaking {
            if conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn unwrap_active(
        &mut self,
        conn: &mut Connection,
        src: &[u8],
        total: usize,
        dst: &mut [u8],
    ) -> Result<EngineResult, Error> {
        if dst.len() < record::MAX_PLAINTEXT {
            return Ok(EngineResult {
                status: IoStatus::BufferOverflow,
                handshake: self.take_result_status(conn),
                bytes_consumed: 0,
                bytes_produced: 0,
            });
        }

        let mut cursor = io::Cursor::new(&src[..total]);
        while (cursor.position() as usize) < total {
            if conn.read_tls(&mut cursor)? == 0 {
                break;
            }
        }
        let state = conn.process_new_packets().map_err(|e| {
            self.inbound_done = true;
            Error::Tls(e)
        })?;
        if state.peer_has_closed() {
            self.inbound_done = true;
        }

        let mut produced = 0;
        loop {
            match conn.reader().read(&mut dst[produced..]) {
                Ok(0) => break,
                Ok(n) => {
                    produced += n;
                    if produced == dst.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.inbound_done = true;
                    break;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        self.note_handshake_edge(conn);
        Ok(EngineResult {
            status: IoStatus::Ok,
            handshake: self.take_result_status(conn),
            bytes_consumed: total,
            bytes_produced: produced,
        })
    }

    fn wrap_active(
        &mut self,
        conn: &mut Connection,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<EngineResult, Error> {
        let mut consumed = 0;
        if !src.is_empty() && !conn.is_handshaking() && !self.outbound_closing {
            consumed = conn
                .writer()
                .write(&src[..src.len().min(record::MAX_PLAINTEXT)])?;
        }

        let mut produced = 0;
        while conn.wants_write() && produced < dst.len() {
            let mut cursor = io::Cursor::new(&mut dst[produced..]);
            let n = conn.write_tls(&mut cursor)?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        self.note_handshake_edge(conn);
        Ok(EngineResult {
            status: IoStatus::Ok,
            handshake: self.take_result_status(conn),
            bytes_consumed: consumed,
            bytes_produced: produced,
        })
    }
}

fn extract_hello(accepted: &Accepted) -> ClientHelloInfo {
    let hello = accepted.client_hello();
    ClientHelloInfo {
        server_name: hello.server_name().map(str::to_string),
        alpn: hello
            .alpn()
            .map(|protocols| {
                protocols
                    .filter_map(|p| std::str::from_utf8(p).ok().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), Error> {
        // The server waits for the ClientHello; the client connection was
        // built with its hello already queued.
        Ok(())
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
        if self.inbound_done {
            return Ok(EngineResult {
                status: IoStatus::Closed,
                handshake: self.handshake_status(),
                bytes_consumed: 0,
                bytes_produced: 0,
            });
        }
        let total = match record::complete_record_len(src)? {
            None => {
                return Ok(EngineResult {
                    status: IoStatus::BufferUnderflow,
                    handshake: self.handshake_status(),
                    bytes_consumed: 0,
                    bytes_produced: 0,
                })
            }
            Some(total) => total,
        };

        match std::mem::replace(&mut self.phase, Phase::Poisoned) {
            Phase::Accepting(mut acceptor) => {
                let mut cursor = io::Cursor::new(&src[..total]);
                while (cursor.position() as usize) < total {
                    if acceptor.read_tls(&mut cursor)? == 0 {
                        break;
                    }
                }
                match acceptor.accept() {
                    Ok(None) => {
                        self.phase = Phase::Accepting(acceptor);
                        Ok(EngineResult {
                            status: IoStatus::Ok,
                            handshake: HandshakeStatus::NeedUnwrap,
                            bytes_consumed: total,
                            bytes_produced: 0,
                        })
                    }
                    Ok(Some(accepted)) => {
                        self.hello = Some(extract_hello(&accepted));
                        self.sni = self.hello.as_ref().and_then(|h| h.server_name.clone());
                        self.phase = Phase::Hello(Box::new(accepted));
                        Ok(EngineResult {
                            status: IoStatus::Ok,
                            handshake: HandshakeStatus::NeedClientHello,
                            bytes_consumed: total,
                            bytes_produced: 0,
                        })
                    }
                    Err((e, _alert)) => Err(Error::Tls(e)),
                }
            }
            Phase::Hello(accepted) => {
                self.phase = Phase::Hello(accepted);
                Ok(EngineResult {
                    status: IoStatus::Ok,
                    handshake: HandshakeStatus::NeedClientHello,
                    bytes_consumed: 0,
                    bytes_produced: 0,
                })
            }
            Phase::Active(mut conn) => {
                let result = self.unwrap_active(&mut conn, src, total, dst);
                self.phase = Phase::Active(conn);
                result
            }
            Phase::Poisoned => Ok(EngineResult {
                status: IoStatus::Closed,
                handshake: HandshakeStatus::NotHandshaking,
                bytes_consumed: 0,
                bytes_produced: 0,
            }),
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
        match std::mem::replace(&mut self.phase, Phase::Poisoned) {
            Phase::Active(mut conn) => {
                let result = self.wrap_active(&mut conn, src, dst);
                self.phase = Phase::Active(conn);
                result
            }
            other => {
                let handshake = match &other {
                    Phase::Accepting(_) => HandshakeStatus::NeedUnwrap,
                    Phase::Hello(_) => HandshakeStatus::NeedClientHello,
                    _ => HandshakeStatus::NotHandshaking,
                };
                self.phase = other;
                Ok(EngineResult {
                    status: IoStatus::Ok,
                    handshake,
                    bytes_consumed: 0,
                    bytes_produced: 0,
                })
            }
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match &self.phase {
            Phase::Accepting(_) => HandshakeStatus::NeedUnwrap,
            Phase::Hello(_) => HandshakeStatus::NeedClientHello,
            Phase::Active(conn) => self.active_status(conn),
            Phase::Poisoned => HandshakeStatus::NotHandshaking,
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        // rustls runs its cryptography inline.
        None
    }

    fn client_hello(&self) -> Option<&ClientHelloInfo> {
        self.hello.as_ref()
    }

    fn resolve_client_hello(&mut self, choice: AlpnChoice) -> Result<(), Error> {
        let accepted = match std::mem::replace(&mut self.phase, Phase::Poisoned) {
            Phase::Hello(accepted) => accepted,
            other => {
                self.phase = other;
                return Err(Error::EngineState(self.handshake_status()));
            }
        };
        let alpn = match choice {
            AlpnChoice::Reject => return Err(Error::Tls(rustls::Error::NoApplicationProtocol)),
            AlpnChoice::NoAlpn => Vec::new(),
            AlpnChoice::Protocol(p) => vec![p.into_bytes()],
        };
        let base = self
            .base
            .as_ref()
            .ok_or(Error::EngineState(HandshakeStatus::NotHandshaking))?;
        let mut config = (**base).clone();
        config.alpn_protocols = alpn;
        self.hello = None;
        match accepted.into_connection(Arc::new(config)) {
            Ok(conn) => {
                self.phase = Phase::Active(Box::new(Connection::from(conn)));
                Ok(())
            }
            Err((e, _alert)) => Err(Error::Tls(e)),
        }
    }

    fn close_inbound(&mut self) {
        self.inbound_done = true;
    }

    fn close_outbound(&mut self) {
        if self.outbound_closing {
            return;
        }
        self.outbound_closing = true;
        if let Phase::Active(conn) = &mut self.phase {
            conn.send_close_notify();
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        match &self.phase {
            Phase::Active(conn) => self.outbound_closing && !conn.wants_write(),
            _ => self.outbound_closing,
        }
    }

    fn server_name(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    fn alpn_protocol(&self) -> Option<&str> {
        self.alpn.as_deref()
    }
}
