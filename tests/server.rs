//! Server-role integration tests exercising the module through its public
//! API only.  A real `rustls::ClientConnection` plays the network peer;
//! a scripted application plays the downstream target.  Messages shuttle
//! in memory — no sockets, no threads.

use std::io::Read;
use std::sync::Arc;

use milli_tls::frame::{Abort, Begin, Data, End, Message, TlsBeginEx, Window};
use milli_tls::{Route, RouteKind, TlsConfig, TlsModule, TlsRouteEx, MAX_PAYLOAD_LENGTH, REPLY_BIT};

const ROUTE_ID: u64 = 9;
const NET_ID: u64 = 1000;
const NET_REPLY_ID: u64 = REPLY_BIT | NET_ID;
const NET_CORRELATION: u64 = 0xC0FFEE;
const APP_REPLY_ID: u64 = REPLY_BIT | 0x5000;

/// Padding the "network" declares when granting reply-side credit.
const NET_REPLY_PADDING: i32 = 11;

struct TestCert {
    cert_der: rustls::pki_types::CertificateDer<'static>,
    keys_pem: String,
}

fn test_cert() -> TestCert {
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let mut keys_pem = signed.cert.pem();
    keys_pem.push_str(&signed.key_pair.serialize_pem());
    TestCert {
        cert_der: signed.cert.der().clone(),
        keys_pem,
    }
}

fn make_module(dir: &tempfile::TempDir, cert: &TestCert, route_ex: TlsRouteEx) -> TlsModule {
    let tls_dir = dir.path().join("tls");
    std::fs::create_dir_all(&tls_dir).unwrap();
    std::fs::write(tls_dir.join("keys"), &cert.keys_pem).unwrap();

    let mut module = TlsModule::new(TlsConfig::new(dir.path()));
    assert!(module.handle_route(Route {
        route_id: ROUTE_ID,
        kind: RouteKind::Server,
        local_address: "net#0".into(),
        remote_address: "app#0".into(),
        extension: route_ex,
    }));
    module
}

fn make_client(cert: &TestCert, alpn: &[&str]) -> rustls::ClientConnection {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert_der.clone()).unwrap();
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    rustls::ClientConnection::new(
        Arc::new(config),
        rustls::pki_types::ServerName::try_from("localhost").unwrap(),
    )
    .unwrap()
}

/// In-memory host: shuttles messages between the module, the rustls
/// client, and a scripted application side.
struct Harness {
    module: TlsModule,
    client: rustls::ClientConnection,

    // Network side, as seen by the client.
    net_budget: i32,
    net_padding: i32,
    reply_credit_outstanding: i64,
    pending_net: Vec<u8>,
    client_rx: Vec<u8>,
    client_saw_eof: bool,
    net_reply_begun: bool,
    net_reply_ended: bool,
    net_reset: bool,
    net_reply_aborted: bool,

    // Application side.
    app_window_chunk: i32,
    echo: bool,
    app_begin: Option<Begin>,
    app_rx: Vec<u8>,
    app_ended: bool,
    app_aborted: bool,
    app_reply_open: bool,
    app_reply_budget: i32,
    app_reply_padding: i32,
    app_reply_windows: Vec<Window>,
    app_reply_reset: bool,
    echo_pending: Vec<u8>,

    max_data_seen: usize,
}

impl Harness {
    fn new(module: TlsModule, client: rustls::ClientConnection) -> Self {
        Self {
            module,
            client,
            net_budget: 0,
            net_padding: 0,
            reply_credit_outstanding: 0,
            pending_net: Vec::new(),
            client_rx: Vec::new(),
            client_saw_eof: false,
            net_reply_begun: false,
            net_reply_ended: false,
            net_reset: false,
            net_reply_aborted: false,
            app_window_chunk: 1 << 20,
            echo: false,
            app_begin: None,
            app_rx: Vec::new(),
            app_ended: false,
            app_aborted: false,
            app_reply_open: false,
            app_reply_budget: 0,
            app_reply_padding: 0,
            app_reply_windows: Vec::new(),
            app_reply_reset: false,
            echo_pending: Vec::new(),
            max_data_seen: 0,
        }
    }

    fn begin_network_stream(&mut self) {
        self.module.receive(Message::Begin(Begin {
            route_id: ROUTE_ID,
            stream_id: NET_ID,
            trace_id: 1,
            authorization: 0,
            correlation_id: NET_CORRELATION,
            extension: Vec::new(),
        }));
    }

    /// Run the shuttle until nothing moves.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(bytes) = self.module.poll_message() {
                self.on_module_message(Message::decode(&bytes).unwrap());
                progressed = true;
            }
            if self.flush_client_to_module() {
                progressed = true;
            }
            if self.flush_echo() {
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn on_module_message(&mut self, msg: Message) {
        match msg {
            Message::Window(w) if w.stream_id == NET_ID => {
                self.net_budget += w.credit;
                self.net_padding = w.padding;
            }
            Message::Begin(b) if b.stream_id == NET_REPLY_ID => {
                assert_eq!(b.correlation_id, NET_CORRELATION);
                self.net_reply_begun = true;
                self.grant_reply_credit(1 << 20);
            }
            Message::Data(d) if d.stream_id == NET_REPLY_ID => {
                self.max_data_seen = self.max_data_seen.max(d.payload.len());
                self.reply_credit_outstanding -= (d.payload.len() as i64) + d.padding as i64;
                assert!(
                    self.reply_credit_outstanding >= 0,
                    "module overran the reply credit"
                );
                let mut src = &d.payload[..];
                while !src.is_empty() {
                    let n = self.client.read_tls(&mut src).unwrap();
                    assert!(n > 0);
                }
                let state = self.client.process_new_packets().unwrap();
                if state.peer_has_closed() {
                    self.client_saw_eof = true;
                }
                let mut buf = [0u8; 32768];
                loop {
                    match self.client.reader().read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => self.client_rx.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => panic!("client read: {e}"),
                    }
                }
                // Slide the reply window by what was just consumed.
                self.grant_reply_credit(d.payload.len() as i32 + d.padding);
            }
            Message::End(e) if e.stream_id == NET_REPLY_ID => self.net_reply_ended = true,
            Message::Abort(a) if a.stream_id == NET_REPLY_ID => self.net_reply_aborted = true,
            Message::Reset(r) if r.stream_id == NET_ID => self.net_reset = true,

            Message::Begin(b) if b.stream_id & REPLY_BIT == 0 && b.route_id == ROUTE_ID => {
                // The application target accepting the decrypted stream.
                let stream_id = b.stream_id;
                self.app_begin = Some(b);
                let credit = self.app_window_chunk;
                self.module.receive(Message::Window(Window {
                    route_id: ROUTE_ID,
                    stream_id,
                    trace_id: 0,
                    credit,
                    padding: 0,
                    group_id: 0,
                }));
            }
            Message::Data(d) if d.stream_id & REPLY_BIT == 0 => {
                self.app_rx.extend_from_slice(&d.payload);
                if self.echo {
                    self.echo_pending.extend_from_slice(&d.payload);
                }
                let stream_id = d.stream_id;
                let credit = d.payload.len() as i32 + d.padding;
                self.module.receive(Message::Window(Window {
                    route_id: ROUTE_ID,
                    stream_id,
                    trace_id: 0,
                    credit,
                    padding: 0,
                    group_id: 0,
                }));
            }
            Message::End(e) if e.stream_id & REPLY_BIT == 0 => self.app_ended = true,
            Message::Abort(a) if a.stream_id & REPLY_BIT == 0 => self.app_aborted = true,

            Message::Window(w) if w.stream_id == APP_REPLY_ID => {
                self.app_reply_budget += w.credit;
                self.app_reply_padding = w.padding;
                self.app_reply_windows.push(w);
            }
            Message::Reset(r) if r.stream_id == APP_REPLY_ID => self.app_reply_reset = true,
            other => panic!("unrouted module message: {other:?}"),
        }
    }

    fn grant_reply_credit(&mut self, credit: i32) {
        self.reply_credit_outstanding += credit as i64;
        self.module.receive(Message::Window(Window {
            route_id: ROUTE_ID,
            stream_id: NET_REPLY_ID,
            trace_id: 0,
            credit,
            padding: NET_REPLY_PADDING,
            group_id: 0,
        }));
    }

    /// Move pending client ciphertext into the module, honoring the
    /// credit the module granted.
    fn flush_client_to_module(&mut self) -> bool {
        while self.client.wants_write() {
            self.client.write_tls(&mut self.pending_net).unwrap();
        }
        if self.pending_net.is_empty() || self.net_budget <= self.net_padding {
            return false;
        }
        let len = self
            .pending_net
            .len()
            .min((self.net_budget - self.net_padding) as usize);
        let payload: Vec<u8> = self.pending_net.drain(..len).collect();
        self.net_budget -= payload.len() as i32 + self.net_padding;
        let padding = self.net_padding;
        self.module.receive(Message::Data(Data {
            route_id: ROUTE_ID,
            stream_id: NET_ID,
            trace_id: 0,
            authorization: 0,
            group_id: 0,
            padding,
            payload,
        }));
        true
    }

    /// The application opens its reply stream once it has seen BEGIN.
    fn open_app_reply(&mut self) {
        let correlation_id = self
            .app_begin
            .as_ref()
            .expect("application begin first")
            .correlation_id;
        self.module.receive(Message::Begin(Begin {
            route_id: ROUTE_ID,
            stream_id: APP_REPLY_ID,
            trace_id: 0,
            authorization: 0,
            correlation_id,
            extension: Vec::new(),
        }));
        self.app_reply_open = true;
        self.pump();
    }

    /// Echo buffered application bytes back within the reply window.
    fn flush_echo(&mut self) -> bool {
        if !self.app_reply_open || self.echo_pending.is_empty() {
            return false;
        }
        let window = self.app_reply_budget - self.app_reply_padding;
        if window <= 0 {
            return false;
        }
        let len = self
            .echo_pending
            .len()
            .min(window as usize)
            .min(MAX_PAYLOAD_LENGTH);
        let payload: Vec<u8> = self.echo_pending.drain(..len).collect();
        self.app_reply_budget -= payload.len() as i32;
        self.module.receive(Message::Data(Data {
            route_id: ROUTE_ID,
            stream_id: APP_REPLY_ID,
            trace_id: 0,
            authorization: 0,
            group_id: 0,
            padding: 0,
            payload,
        }));
        true
    }

    fn end_app_reply(&mut self) {
        self.module.receive(Message::End(End {
            route_id: ROUTE_ID,
            stream_id: APP_REPLY_ID,
            trace_id: 0,
            authorization: 0,
        }));
        self.pump();
    }

    fn slots_balanced(&self) -> bool {
        self.module.counter("server.network.acquires")
            == self.module.counter("server.network.releases")
            && self.module.counter("server.application.acquires")
                == self.module.counter("server.application.releases")
    }
}

fn established(route_ex: TlsRouteEx, alpn: &[&str], echo: bool) -> Harness {
    established_with_window(route_ex, alpn, echo, 1 << 20)
}

fn established_with_window(
    route_ex: TlsRouteEx,
    alpn: &[&str],
    echo: bool,
    app_window: i32,
) -> Harness {
    let cert = test_cert();
    let dir = tempfile::tempdir().unwrap();
    let module = make_module(&dir, &cert, route_ex);
    let client = make_client(&cert, alpn);

    let mut harness = Harness::new(module, client);
    harness.echo = echo;
    harness.app_window_chunk = app_window;
    harness.begin_network_stream();
    harness.pump();
    assert!(harness.net_reply_begun, "reply stream never opened");
    assert!(
        !harness.client.is_handshaking(),
        "handshake did not complete"
    );
    assert!(harness.app_begin.is_some(), "application begin not emitted");
    harness
}

#[test]
fn connection_established_without_payload() {
    let mut harness = established(TlsRouteEx::default(), &[], false);

    let begin = harness.app_begin.clone().unwrap();
    let ex = TlsBeginEx::decode(&begin.extension).unwrap();
    assert_eq!(ex.hostname.as_deref(), Some("localhost"));
    assert_eq!(ex.application_protocol, None);
    assert!(harness.app_rx.is_empty());

    harness.open_app_reply();

    // Clean close from the client; the application sees END.
    harness.client.send_close_notify();
    harness.pump();
    assert!(harness.app_ended);

    // The application closes its write side; the client reads EOF.
    harness.end_app_reply();
    assert!(harness.client_saw_eof);
    assert!(harness.net_reply_ended);
    assert!(harness.slots_balanced());
}

#[test]
fn established_connection_reports_sni_and_alpn() {
    let route_ex = TlsRouteEx {
        store: None,
        hostname: Some("localhost".into()),
        application_protocol: Some("h2".into()),
    };
    let harness = established(route_ex, &["h2"], false);

    assert_eq!(harness.client.alpn_protocol(), Some(b"h2".as_slice()));
    let begin = harness.app_begin.clone().unwrap();
    let ex = TlsBeginEx::decode(&begin.extension).unwrap();
    assert_eq!(ex.hostname.as_deref(), Some("localhost"));
    assert_eq!(ex.application_protocol.as_deref(), Some("h2"));
}

#[test]
fn echo_10k() {
    let mut harness = established(TlsRouteEx::default(), &[], true);
    harness.open_app_reply();

    let payload: Vec<u8> = (0..10_240u32).map(|i| (i % 251) as u8).collect();
    use std::io::Write;
    harness.client.writer().write_all(&payload).unwrap();
    harness.pump();

    assert_eq!(harness.app_rx, payload, "decrypted bytes differ");
    assert_eq!(harness.client_rx, payload, "echoed bytes differ");
    assert!(harness.slots_balanced());
}

#[test]
fn echo_100k() {
    let mut harness = established(TlsRouteEx::default(), &[], true);
    harness.open_app_reply();

    let payload: Vec<u8> = (0..102_400u32).map(|i| (i % 253) as u8).collect();
    use std::io::Write;
    let mut written = 0;
    while written < payload.len() {
        written += harness.client.writer().write(&payload[written..]).unwrap();
        harness.pump();
    }
    harness.pump();

    assert_eq!(harness.app_rx, payload);
    assert_eq!(harness.client_rx, payload);
    assert!(harness.slots_balanced());
}

#[test]
fn echo_1000k_with_8k_application_window() {
    let mut harness = established_with_window(TlsRouteEx::default(), &[], true, 8192);
    harness.open_app_reply();

    let payload: Vec<u8> = (0..1_024_000u32).map(|i| (i % 241) as u8).collect();
    use std::io::Write;
    let mut written = 0;
    while written < payload.len() {
        let n = harness
            .client
            .writer()
            .write(&payload[written..])
            .unwrap();
        written += n;
        harness.pump();
    }
    harness.pump();

    assert_eq!(harness.app_rx.len(), 1_024_000);
    assert_eq!(harness.app_rx, payload);
    assert_eq!(harness.client_rx, payload);
    assert!(harness.max_data_seen <= MAX_PAYLOAD_LENGTH);
    assert!(harness.slots_balanced());
}

#[test]
fn reply_window_padding_uplifts_network_padding() {
    let mut harness = established(TlsRouteEx::default(), &[], false);
    harness.open_app_reply();

    // 281 = record header + MAC + padding reserve.
    assert!(!harness.app_reply_windows.is_empty());
    for window in &harness.app_reply_windows {
        assert_eq!(window.padding, NET_REPLY_PADDING + 281);
    }
}

#[test]
fn server_sent_write_close() {
    let mut harness = established(TlsRouteEx::default(), &[], false);
    harness.open_app_reply();

    harness.end_app_reply();

    // close_notify reached the client and the reply stream ended.
    assert!(harness.client_saw_eof);
    assert!(harness.net_reply_ended);
    assert!(!harness.net_reply_aborted);
    assert!(harness.slots_balanced());
}

#[test]
fn client_sent_abort_mid_stream() {
    let mut harness = established(TlsRouteEx::default(), &[], false);
    harness.open_app_reply();

    use std::io::Write;
    harness.client.writer().write_all(b"partial").unwrap();
    harness.pump();

    harness.module.receive(Message::Abort(Abort {
        route_id: ROUTE_ID,
        stream_id: NET_ID,
        trace_id: 0,
        authorization: 0,
    }));
    harness.pump();

    assert!(harness.app_aborted);
    assert!(harness.slots_balanced());
}

#[test]
fn alpn_mismatch_fails_handshake() {
    let cert = test_cert();
    let dir = tempfile::tempdir().unwrap();
    let route_ex = TlsRouteEx {
        store: None,
        hostname: None,
        application_protocol: Some("http/1.1".into()),
    };
    let module = make_module(&dir, &cert, route_ex);
    let client = make_client(&cert, &["h2"]);

    let mut harness = Harness::new(module, client);
    harness.begin_network_stream();
    harness.pump();

    assert!(harness.net_reset, "expected RESET on the network stream");
    assert!(harness.net_reply_aborted, "expected ABORT on the reply");
    assert!(harness.app_begin.is_none());
    assert!(harness.slots_balanced());
}

#[test]
fn sni_mismatch_fails_handshake() {
    let cert = test_cert();
    let dir = tempfile::tempdir().unwrap();
    let route_ex = TlsRouteEx {
        store: None,
        hostname: Some("other.example".into()),
        application_protocol: None,
    };
    let module = make_module(&dir, &cert, route_ex);
    let client = make_client(&cert, &[]);

    let mut harness = Harness::new(module, client);
    harness.begin_network_stream();
    harness.pump();

    assert!(harness.net_reset);
    assert!(harness.net_reply_aborted);
    assert!(harness.app_begin.is_none());
    assert!(harness.slots_balanced());
}

#[test]
fn reply_begin_after_cleanup_is_reset() {
    let mut harness = established(TlsRouteEx::default(), &[], false);

    // The network aborts before the application ever opens its reply.
    harness.module.receive(Message::Abort(Abort {
        route_id: ROUTE_ID,
        stream_id: NET_ID,
        trace_id: 0,
        authorization: 0,
    }));
    harness.pump();
    assert!(harness.app_aborted);

    // A late reply BEGIN finds no correlation and is reset.
    let correlation_id = harness.app_begin.as_ref().unwrap().correlation_id;
    harness.module.receive(Message::Begin(Begin {
        route_id: ROUTE_ID,
        stream_id: APP_REPLY_ID,
        trace_id: 0,
        authorization: 0,
        correlation_id,
        extension: Vec::new(),
    }));
    harness.pump();
    assert!(harness.app_reply_reset);
    assert!(harness.slots_balanced());
}

#[test]
fn frames_and_bytes_counters_accumulate() {
    let mut harness = established(TlsRouteEx::default(), &[], true);
    harness.open_app_reply();

    use std::io::Write;
    harness.client.writer().write_all(&[7u8; 4096]).unwrap();
    harness.pump();

    let key = format!("{ROUTE_ID}.bytes.written");
    assert!(harness.module.counter(&key) > 0);
    let key = format!("{ROUTE_ID}.frames.read");
    assert!(harness.module.counter(&key) > 0);
}
