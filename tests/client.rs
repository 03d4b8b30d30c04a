//! Client-role integration tests: the module originates TLS toward a
//! real `rustls::ServerConnection` playing the remote network peer,
//! while a scripted application drives cleartext through it.

use std::io::Read;
use std::sync::Arc;

use milli_tls::frame::{Begin, Data, End, Message, TlsBeginEx, Window};
use milli_tls::{Route, RouteKind, TlsConfig, TlsModule, TlsRouteEx, REPLY_BIT};

const ROUTE_ID: u64 = 9;
const APP_ID: u64 = 2000;
const APP_REPLY_ID: u64 = REPLY_BIT | APP_ID;
const APP_CORRELATION: u64 = 0xBEEF;
const NET_REPLY_ID: u64 = REPLY_BIT | 7000;

struct TestCert {
    cert_der: rustls::pki_types::CertificateDer<'static>,
    cert_pem: String,
    key_der: Vec<u8>,
}

fn test_cert() -> TestCert {
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    TestCert {
        cert_der: signed.cert.der().clone(),
        cert_pem: signed.cert.pem(),
        key_der: signed.key_pair.serialize_der(),
    }
}

fn make_module(dir: &tempfile::TempDir, cert: &TestCert) -> TlsModule {
    let tls_dir = dir.path().join("tls");
    std::fs::create_dir_all(&tls_dir).unwrap();
    std::fs::write(tls_dir.join("trust"), &cert.cert_pem).unwrap();

    let mut module = TlsModule::new(TlsConfig::new(dir.path()));
    assert!(module.handle_route(Route {
        route_id: ROUTE_ID,
        kind: RouteKind::Client,
        local_address: "app#0".into(),
        remote_address: "net#0".into(),
        extension: TlsRouteEx {
            store: None,
            hostname: Some("localhost".into()),
            application_protocol: None,
        },
    }));
    module
}

fn make_server(cert: &TestCert) -> rustls::ServerConnection {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.cert_der.clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_der.clone())),
        )
        .unwrap();
    rustls::ServerConnection::new(Arc::new(config)).unwrap()
}

struct Harness {
    module: TlsModule,
    server: rustls::ServerConnection,

    net_id: Option<u64>,
    net_correlation: u64,
    net_reply_opened: bool,
    /// Credit the module granted us for ciphertext on the reply stream.
    reply_budget: i32,
    reply_padding: i32,
    pending_net: Vec<u8>,
    server_rx: Vec<u8>,
    server_saw_eof: bool,
    net_ended: bool,

    app_window: i32,
    app_reply_begin: Option<Begin>,
    app_budget: i32,
    app_padding: i32,
    app_rx: Vec<u8>,
    app_reply_ended: bool,
    app_reset: bool,
}

impl Harness {
    fn new(module: TlsModule, server: rustls::ServerConnection) -> Self {
        Self {
            module,
            server,
            net_id: None,
            net_correlation: 0,
            net_reply_opened: false,
            reply_budget: 0,
            reply_padding: 0,
            pending_net: Vec::new(),
            server_rx: Vec::new(),
            server_saw_eof: false,
            net_ended: false,
            app_window: 1 << 20,
            app_reply_begin: None,
            app_budget: 0,
            app_padding: 0,
            app_rx: Vec::new(),
            app_reply_ended: false,
            app_reset: false,
        }
    }

    fn begin_application_stream(&mut self) {
        self.module.receive(Message::Begin(Begin {
            route_id: ROUTE_ID,
            stream_id: APP_ID,
            trace_id: 1,
            authorization: 0,
            correlation_id: APP_CORRELATION,
            extension: TlsBeginEx::default().encode(),
        }));
    }

    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(bytes) = self.module.poll_message() {
                self.on_module_message(Message::decode(&bytes).unwrap());
                progressed = true;
            }
            if self.flush_server_to_module() {
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn on_module_message(&mut self, msg: Message) {
        match msg {
            // The module opening its network stream toward us.
            Message::Begin(b) if b.stream_id & REPLY_BIT == 0 && self.net_id.is_none() => {
                self.net_id = Some(b.stream_id);
                self.net_correlation = b.correlation_id;
                let stream_id = b.stream_id;
                self.module.receive(Message::Window(Window {
                    route_id: ROUTE_ID,
                    stream_id,
                    trace_id: 0,
                    credit: 1 << 20,
                    padding: 0,
                    group_id: 0,
                }));
                // Open the reply stream carrying the ciphertext back.
                self.module.receive(Message::Begin(Begin {
                    route_id: ROUTE_ID,
                    stream_id: NET_REPLY_ID,
                    trace_id: 0,
                    authorization: 0,
                    correlation_id: self.net_correlation,
                    extension: Vec::new(),
                }));
                self.net_reply_opened = true;
            }
            Message::Data(d) if Some(d.stream_id) == self.net_id => {
                let mut src = &d.payload[..];
                while !src.is_empty() {
                    assert!(self.server.read_tls(&mut src).unwrap() > 0);
                }
                let state = self.server.process_new_packets().unwrap();
                if state.peer_has_closed() {
                    self.server_saw_eof = true;
                }
                let mut buf = [0u8; 32768];
                loop {
                    match self.server.reader().read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => self.server_rx.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => panic!("server read: {e}"),
                    }
                }
            }
            Message::End(e) if Some(e.stream_id) == self.net_id => self.net_ended = true,
            Message::Window(w) if w.stream_id == NET_REPLY_ID => {
                self.reply_budget += w.credit;
                self.reply_padding = w.padding;
            }

            Message::Begin(b) if b.stream_id == APP_REPLY_ID => {
                self.app_reply_begin = Some(b);
                let credit = self.app_window;
                self.module.receive(Message::Window(Window {
                    route_id: ROUTE_ID,
                    stream_id: APP_REPLY_ID,
                    trace_id: 0,
                    credit,
                    padding: 0,
                    group_id: 0,
                }));
            }
            Message::Window(w) if w.stream_id == APP_ID => {
                self.app_budget += w.credit;
                self.app_padding = w.padding;
            }
            Message::Data(d) if d.stream_id == APP_REPLY_ID => {
                self.app_rx.extend_from_slice(&d.payload);
                let credit = d.payload.len() as i32 + d.padding;
                self.module.receive(Message::Window(Window {
                    route_id: ROUTE_ID,
                    stream_id: APP_REPLY_ID,
                    trace_id: 0,
                    credit,
                    padding: 0,
                    group_id: 0,
                }));
            }
            Message::End(e) if e.stream_id == APP_REPLY_ID => self.app_reply_ended = true,
            Message::Reset(r) if r.stream_id == APP_ID => self.app_reset = true,
            other => panic!("unrouted module message: {other:?}"),
        }
    }

    /// Deliver pending server ciphertext on the reply stream, within the
    /// module's granted credit.
    fn flush_server_to_module(&mut self) -> bool {
        while self.server.wants_write() {
            self.server.write_tls(&mut self.pending_net).unwrap();
        }
        if !self.net_reply_opened
            || self.pending_net.is_empty()
            || self.reply_budget <= self.reply_padding
        {
            return false;
        }
        let len = self
            .pending_net
            .len()
            .min((self.reply_budget - self.reply_padding) as usize);
        let payload: Vec<u8> = self.pending_net.drain(..len).collect();
        self.reply_budget -= payload.len() as i32 + self.reply_padding;
        let padding = self.reply_padding;
        self.module.receive(Message::Data(Data {
            route_id: ROUTE_ID,
            stream_id: NET_REPLY_ID,
            trace_id: 0,
            authorization: 0,
            group_id: 0,
            padding,
            payload,
        }));
        true
    }

    fn send_app_data(&mut self, payload: &[u8]) {
        assert!(
            self.app_budget >= payload.len() as i32 + self.app_padding,
            "application overran its window"
        );
        self.app_budget -= payload.len() as i32;
        self.module.receive(Message::Data(Data {
            route_id: ROUTE_ID,
            stream_id: APP_ID,
            trace_id: 0,
            authorization: 0,
            group_id: 0,
            padding: 0,
            payload: payload.to_vec(),
        }));
        self.pump();
    }

    fn slots_balanced(&self) -> bool {
        self.module.counter("client.network.acquires")
            == self.module.counter("client.network.releases")
            && self.module.counter("client.application.acquires")
                == self.module.counter("client.application.releases")
    }
}

fn established() -> Harness {
    let cert = test_cert();
    let dir = tempfile::tempdir().unwrap();
    let module = make_module(&dir, &cert);
    let server = make_server(&cert);

    let mut harness = Harness::new(module, server);
    harness.begin_application_stream();
    harness.pump();

    assert!(!harness.server.is_handshaking(), "handshake incomplete");
    assert!(
        harness.app_reply_begin.is_some(),
        "application reply never opened"
    );
    assert!(harness.app_budget > 0, "no cleartext window granted");
    harness
}

#[test]
fn client_handshake_opens_application_reply() {
    let harness = established();
    let begin = harness.app_reply_begin.clone().unwrap();
    assert_eq!(begin.correlation_id, APP_CORRELATION);
    let ex = TlsBeginEx::decode(&begin.extension).unwrap();
    assert_eq!(ex.hostname.as_deref(), Some("localhost"));
}

#[test]
fn cleartext_round_trips_through_the_tunnel() {
    let mut harness = established();

    let outbound: Vec<u8> = (0..10_240u32).map(|i| (i % 239) as u8).collect();
    for chunk in outbound.chunks(4096) {
        harness.send_app_data(chunk);
    }
    assert_eq!(harness.server_rx, outbound, "server saw different bytes");

    use std::io::Write;
    let inbound: Vec<u8> = (0..10_240u32).map(|i| (i % 233) as u8).collect();
    harness.server.writer().write_all(&inbound).unwrap();
    harness.pump();
    assert_eq!(harness.app_rx, inbound, "application saw different bytes");
    assert!(harness.slots_balanced());
}

#[test]
fn application_end_closes_the_network_write_side() {
    let mut harness = established();
    harness.module.receive(Message::End(End {
        route_id: ROUTE_ID,
        stream_id: APP_ID,
        trace_id: 0,
        authorization: 0,
    }));
    harness.pump();

    assert!(harness.server_saw_eof, "server never saw close_notify");
    assert!(harness.net_ended, "network stream not ended");
    assert!(harness.slots_balanced());
}

#[test]
fn server_close_ends_the_application_reply() {
    let mut harness = established();
    harness.server.send_close_notify();
    harness.pump();

    assert!(harness.app_reply_ended);
    assert!(harness.slots_balanced());
}
