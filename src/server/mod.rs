//! Server-role stream factory.
//!
//! Owns every per-connection structure, indexed by stream id: accept
//! streams, reply streams, the correlation registry, and the throttle
//! table that routes WINDOW/RESET back to whichever side currently owns
//! a stream we opened.  Connection objects hold ids, never references to
//! each other; the paired pumps share their TLS engine alone.

pub(crate) mod accept;
pub(crate) mod handshake;
pub(crate) mod reply;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::config::TlsConfig;
use crate::counters::Counters;
use crate::engine::record::MAX_HEADER_SIZE;
use crate::engine::TlsEngine;
use crate::frame::{Begin, Message, MAX_PAYLOAD_LENGTH};
use crate::host::Host;
use crate::slab::SlotPool;

use accept::{AcceptOutcome, AcceptStream, StreamState};
use handshake::{Handshake, HsEvent};
use reply::{ReplyOutcome, ReplyStream};

/// Where WINDOW/RESET for a stream we opened should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Throttle {
    /// Network reply stream, owned by the handshake until the reply
    /// stream attaches.  `correlation_id` is set once FINISHED moved the
    /// handshake into the registry.
    HandshakeReply {
        network_id: u64,
        correlation_id: Option<u64>,
    },
    /// Application stream opened at FINISHED; window flows to the accept
    /// pump.
    AcceptApplication { network_id: u64 },
    /// Network reply stream after the reply attached.
    ReplyNetwork { reply_id: u64 },
}

/// Factory state the per-stream pumps borrow during one dispatch.
pub(crate) struct Shared<'f, E: TlsEngine> {
    pub network_pool: &'f mut SlotPool,
    pub application_pool: &'f mut SlotPool,
    pub throttles: &'f mut HashMap<u64, Throttle>,
    pub correlations: &'f mut HashMap<u64, Handshake<E>>,
    pub out_net: &'f mut Vec<u8>,
    pub out_app: &'f mut Vec<u8>,
}

pub(crate) struct ServerFactory<E: TlsEngine> {
    handshake_budget: i32,
    network_pool: SlotPool,
    application_pool: SlotPool,
    accepts: HashMap<u64, AcceptStream<E>>,
    replies: HashMap<u64, ReplyStream<E>>,
    throttles: HashMap<u64, Throttle>,
    correlations: HashMap<u64, Handshake<E>>,
    out_net: Vec<u8>,
    out_app: Vec<u8>,
}

impl<E: TlsEngine> ServerFactory<E> {
    pub fn new(role: &str, config: &TlsConfig, counters: &mut Counters) -> Self {
        Self {
            handshake_budget: config.effective_handshake_window() as i32,
            network_pool: SlotPool::new(
                config.slot_count,
                config.slot_capacity,
                counters.accumulator(&format!("{role}.network.acquires")),
                counters.accumulator(&format!("{role}.network.releases")),
            ),
            application_pool: SlotPool::new(
                config.slot_count,
                config.slot_capacity,
                counters.accumulator(&format!("{role}.application.acquires")),
                counters.accumulator(&format!("{role}.application.releases")),
            ),
            accepts: HashMap::new(),
            replies: HashMap::new(),
            throttles: HashMap::new(),
            correlations: HashMap::new(),
            out_net: vec![0; MAX_PAYLOAD_LENGTH],
            out_app: vec![0; config.slot_capacity],
        }
    }

    fn shared(&mut self) -> Shared<'_, E> {
        Shared {
            network_pool: &mut self.network_pool,
            application_pool: &mut self.application_pool,
            throttles: &mut self.throttles,
            correlations: &mut self.correlations,
            out_net: &mut self.out_net,
            out_app: &mut self.out_app,
        }
    }

    pub fn owns(&self, stream_id: u64) -> bool {
        self.accepts.contains_key(&stream_id)
            || self.replies.contains_key(&stream_id)
            || self.throttles.contains_key(&stream_id)
    }

    pub fn owns_correlation(&self, correlation_id: u64) -> bool {
        self.correlations.contains_key(&correlation_id)
    }

    /// New peer-initiated network stream (factory dispatch already
    /// checked the route and store context).
    pub fn new_accept(&mut self, host: &mut Host<'_>, engine: E, begin: &Begin) {
        let mut stream = AcceptStream::new(
            Rc::new(RefCell::new(engine)),
            begin.route_id,
            begin.stream_id,
            begin.authorization,
        );
        debug!(network_id = begin.stream_id, route_id = begin.route_id, "accept stream");

        stream.network_correlation_id = begin.correlation_id;
        stream.network_reply_id = host.ids.supply_reply_id(begin.stream_id);
        let hs = Handshake::new(
            stream.engine.clone(),
            stream.network_route_id,
            stream.network_id,
            stream.network_reply_id,
            stream.authorization,
        );

        stream.network_budget += self.handshake_budget;
        host.do_window(
            stream.network_route_id,
            stream.network_id,
            begin.trace_id,
            stream.network_budget,
            stream.network_padding,
        );
        host.do_begin(
            stream.network_route_id,
            stream.network_reply_id,
            begin.trace_id,
            0,
            stream.network_correlation_id,
            Vec::new(),
        );
        self.throttles.insert(
            stream.network_reply_id,
            Throttle::HandshakeReply {
                network_id: stream.network_id,
                correlation_id: None,
            },
        );
        stream.state = StreamState::Handshaking;

        let begun = stream.engine.borrow_mut().begin_handshake();
        match begun {
            Ok(()) => {
                stream.handshake = Some(hs);
                self.accepts.insert(stream.network_id, stream);
            }
            Err(err) => {
                debug!(network_id = begin.stream_id, %err, "begin handshake failed");
                host.do_reset(stream.network_route_id, stream.network_id, begin.trace_id);
                host.do_abort(stream.network_route_id, stream.network_reply_id, begin.trace_id, 0);
                self.drop_throttle(stream.network_reply_id, |t| {
                    matches!(t, Throttle::HandshakeReply { .. })
                });
            }
        }
    }

    /// Reply-direction BEGIN whose correlation this factory registered.
    pub fn on_reply_begin(&mut self, host: &mut Host<'_>, begin: &Begin) {
        match self.correlations.remove(&begin.correlation_id) {
            None => {
                // Tolerates BEGIN racing an earlier RESET cleanup.
                host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
            }
            Some(mut hs) => {
                debug_assert_eq!(hs.pending_tasks, 0);
                let mut reply = ReplyStream {
                    engine: hs.engine.clone(),
                    application_route_id: begin.route_id,
                    application_reply_id: begin.stream_id,
                    application_reply_budget: 0,
                    application_reply_padding: hs.network_reply_padding + MAX_HEADER_SIZE as i32,
                    network_route_id: hs.network_route_id,
                    network_reply_id: hs.network_reply_id,
                    network_reply_budget: hs.network_reply_budget,
                    network_reply_padding: hs.network_reply_padding,
                    application_open: true,
                    trace_id: begin.trace_id,
                };
                debug!(
                    application_reply_id = begin.stream_id,
                    network_reply_id = hs.network_reply_id,
                    "reply stream attached"
                );
                self.throttles.insert(
                    hs.network_reply_id,
                    Throttle::ReplyNetwork {
                        reply_id: begin.stream_id,
                    },
                );
                reply.send_application_window(host, begin.trace_id);
                self.replies.insert(begin.stream_id, reply);
                let mut shared = self.shared();
                hs.teardown(&mut shared);
            }
        }
    }

    /// Everything except new-stream BEGINs.
    pub fn on_message(&mut self, host: &mut Host<'_>, msg: Message) {
        match msg {
            Message::Window(window) => self.on_throttle_window(host, window),
            Message::Reset(reset) => self.on_throttle_reset(host, reset.stream_id, reset.trace_id),
            other => {
                let stream_id = other.stream_id();
                if self.accepts.contains_key(&stream_id) {
                    self.on_accept_event(host, stream_id, other);
                } else if self.replies.contains_key(&stream_id) {
                    self.on_reply_event(host, stream_id, other);
                }
            }
        }
    }

    fn on_accept_event(&mut self, host: &mut Host<'_>, network_id: u64, msg: Message) {
        let Some(mut stream) = self.accepts.remove(&network_id) else {
            return;
        };
        match stream.state {
            StreamState::BeforeBegin => {
                // The factory only creates streams on BEGIN, so anything
                // landing here is a protocol violation.
                let trace = host.ids.supply_trace_id();
                host.do_reset(stream.network_route_id, stream.network_id, trace);
                self.finish_accept(stream, None);
            }
            StreamState::Handshaking => {
                let mut hs = stream.handshake.take().expect("handshaking state");
                let outcome = {
                    let mut shared = self.shared();
                    handshake::on_stream(&mut hs, &mut stream, &mut shared, host, msg)
                };
                self.apply_handshake_outcome(stream, hs, outcome);
            }
            StreamState::AfterHandshake => {
                let outcome = {
                    let mut shared = self.shared();
                    match msg {
                        Message::Data(data) => stream.on_data(&mut shared, host, data),
                        Message::End(end) => stream.on_end(&mut shared, host, end),
                        Message::Abort(abort) => stream.on_abort(host, abort.trace_id),
                        _ => {
                            let trace = host.ids.supply_trace_id();
                            host.do_reset(stream.network_route_id, stream.network_id, trace);
                            AcceptOutcome::Remove
                        }
                    }
                };
                match outcome {
                    AcceptOutcome::Keep => {
                        self.accepts.insert(network_id, stream);
                    }
                    AcceptOutcome::Remove => self.finish_accept(stream, None),
                }
            }
        }
    }

    fn apply_handshake_outcome(
        &mut self,
        mut stream: AcceptStream<E>,
        mut hs: Handshake<E>,
        outcome: HsEvent,
    ) {
        match outcome {
            HsEvent::Keep => {
                stream.handshake = Some(hs);
                self.accepts.insert(stream.network_id, stream);
            }
            HsEvent::Finished { correlation_id } => {
                // Unconsumed ciphertext moves from the handshake into the
                // accept pump.
                if hs.network_slot_offset != 0 {
                    stream.network_slot = hs.network_slot.take();
                    stream.network_slot_offset = hs.network_slot_offset;
                    hs.network_slot_offset = 0;
                }
                self.correlations.insert(correlation_id, hs);
                self.accepts.insert(stream.network_id, stream);
            }
            HsEvent::Remove => self.finish_accept(stream, Some(hs)),
        }
    }

    /// Tear an accept stream (and its handshake, when still present) out
    /// of every table, releasing its slots.  Sweeps the correlation
    /// registry so a reply BEGIN arriving after this cleanup is reset.
    fn finish_accept(&mut self, mut stream: AcceptStream<E>, hs: Option<Handshake<E>>) {
        let orphaned = match stream.state {
            StreamState::AfterHandshake => {
                self.correlations.remove(&stream.application_correlation_id)
            }
            _ => None,
        };
        {
            let mut shared = self.shared();
            if let Some(mut hs) = hs {
                hs.teardown(&mut shared);
            }
            if let Some(mut hs) = orphaned {
                hs.teardown(&mut shared);
            }
            stream.teardown(&mut shared);
        }
        let network_id = stream.network_id;
        self.drop_throttle(stream.network_reply_id, |t| {
            matches!(t, Throttle::HandshakeReply { network_id: id, .. } if *id == network_id)
        });
        if stream.application_id != 0 {
            self.drop_throttle(stream.application_id, |t| {
                matches!(t, Throttle::AcceptApplication { network_id: id } if *id == network_id)
            });
        }
    }

    fn on_reply_event(&mut self, host: &mut Host<'_>, stream_id: u64, msg: Message) {
        let Some(mut reply) = self.replies.remove(&stream_id) else {
            return;
        };
        let outcome = {
            let mut shared = self.shared();
            match msg {
                Message::Data(data) => reply.on_data(&mut shared, host, data),
                Message::End(end) => reply.on_end(&mut shared, host, end.trace_id, end.authorization),
                Message::Abort(abort) => reply.on_abort(host, abort.trace_id),
                _ => {
                    let trace = host.ids.supply_trace_id();
                    host.do_reset(reply.application_route_id, reply.application_reply_id, trace);
                    ReplyOutcome::Remove
                }
            }
        };
        match outcome {
            ReplyOutcome::Keep => {
                self.replies.insert(stream_id, reply);
            }
            ReplyOutcome::Remove => self.finish_reply(reply),
        }
    }

    fn finish_reply(&mut self, reply: ReplyStream<E>) {
        let reply_id = reply.application_reply_id;
        self.drop_throttle(reply.network_reply_id, |t| {
            matches!(t, Throttle::ReplyNetwork { reply_id: id } if *id == reply_id)
        });
    }

    fn on_throttle_window(&mut self, host: &mut Host<'_>, window: crate::frame::Window) {
        match self.throttles.get(&window.stream_id).copied() {
            None => {}
            Some(Throttle::HandshakeReply {
                network_id,
                correlation_id: None,
            }) => {
                let Some(mut stream) = self.accepts.remove(&network_id) else {
                    return;
                };
                let Some(mut hs) = stream.handshake.take() else {
                    self.accepts.insert(network_id, stream);
                    return;
                };
                let outcome = {
                    let mut shared = self.shared();
                    handshake::on_reply_window(
                        &mut hs,
                        &mut stream,
                        &mut shared,
                        host,
                        window.credit,
                        window.padding,
                    )
                };
                self.apply_handshake_outcome(stream, hs, outcome);
            }
            Some(Throttle::HandshakeReply {
                correlation_id: Some(correlation_id),
                ..
            }) => {
                // Credit accrues on the parked handshake until the reply
                // stream inherits it.
                if let Some(hs) = self.correlations.get_mut(&correlation_id) {
                    hs.network_reply_budget += window.credit;
                    hs.network_reply_padding = window.padding;
                }
            }
            Some(Throttle::AcceptApplication { network_id }) => {
                let Some(mut stream) = self.accepts.remove(&network_id) else {
                    return;
                };
                let outcome = {
                    let mut shared = self.shared();
                    stream.on_application_window(&mut shared, host, window)
                };
                match outcome {
                    AcceptOutcome::Keep => {
                        self.accepts.insert(network_id, stream);
                    }
                    AcceptOutcome::Remove => self.finish_accept(stream, None),
                }
            }
            Some(Throttle::ReplyNetwork { reply_id }) => {
                let Some(mut reply) = self.replies.remove(&reply_id) else {
                    return;
                };
                match reply.on_network_window(host, window) {
                    ReplyOutcome::Keep => {
                        self.replies.insert(reply_id, reply);
                    }
                    ReplyOutcome::Remove => self.finish_reply(reply),
                }
            }
        }
    }

    fn on_throttle_reset(&mut self, host: &mut Host<'_>, stream_id: u64, trace_id: u64) {
        match self.throttles.get(&stream_id).copied() {
            None => {}
            Some(Throttle::HandshakeReply {
                network_id,
                correlation_id: None,
            }) => {
                if let Some(stream) = self.accepts.get_mut(&network_id) {
                    if let Some(hs) = stream.handshake.as_mut() {
                        handshake::on_reply_reset(hs);
                    }
                }
            }
            Some(Throttle::HandshakeReply {
                correlation_id: Some(correlation_id),
                ..
            }) => {
                if let Some(mut hs) = self.correlations.remove(&correlation_id) {
                    let mut shared = self.shared();
                    hs.teardown(&mut shared);
                }
                self.throttles.remove(&stream_id);
            }
            Some(Throttle::AcceptApplication { network_id }) => {
                let Some(mut stream) = self.accepts.remove(&network_id) else {
                    return;
                };
                let outcome = stream.on_application_reset(host, trace_id);
                debug_assert_eq!(outcome, AcceptOutcome::Remove);
                self.finish_accept(stream, None);
            }
            Some(Throttle::ReplyNetwork { reply_id }) => {
                let Some(mut reply) = self.replies.remove(&reply_id) else {
                    return;
                };
                let outcome = reply.on_network_reset(host, trace_id);
                debug_assert_eq!(outcome, ReplyOutcome::Remove);
                self.finish_reply(reply);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn slots_in_use(&self) -> usize {
        self.network_pool.in_use() + self.application_pool.in_use()
    }

    fn drop_throttle(&mut self, stream_id: u64, pred: impl Fn(&Throttle) -> bool) {
        if let Some(entry) = self.throttles.get(&stream_id) {
            if pred(entry) {
                self.throttles.remove(&stream_id);
            }
        }
    }
}
