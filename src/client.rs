//! Client-role stream factory: the mirror of the server engine with
//! `use_client_mode = true` and no SNI-selection filter.
//!
//! An application-initiated accept stream carries cleartext in; the
//! factory opens a network stream toward the route's remote address and
//! wraps outbound records onto it.  The network peer's reply stream
//! carries ciphertext back, which unwraps toward the application reply
//! stream.  Same correlation hand-off, slot discipline and handshake
//! coordination as the server factory, with the encrypt/decrypt sides
//! swapped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::config::TlsConfig;
use crate::counters::Counters;
use crate::engine::record::MAX_HEADER_SIZE;
use crate::engine::{HandshakeStatus, IoStatus, TlsEngine};
use crate::exec::TaskHandle;
use crate::frame::{
    Begin, Data, Message, TlsBeginEx, Window, FLUSH_HANDSHAKE_SIGNAL, MAX_PAYLOAD_LENGTH,
};
use crate::host::Host;
use crate::slab::{compact, Slot, SlotPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Handshaking,
    AfterHandshake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Keep,
    Remove,
}

/// Where WINDOW/RESET for streams this factory opened should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Throttle {
    /// The network stream we opened; encrypt-side budget.
    Network { accept_id: u64 },
    /// The application reply stream we opened at FINISHED; decrypt-side
    /// flush budget.
    Application { accept_id: u64 },
}

/// Handshake-only state for a client connection, hosted by its accept
/// stream until FINISHED.
struct Handshake<E: TlsEngine> {
    engine: Rc<RefCell<E>>,
    network_route_id: u64,
    network_id: u64,
    pending_tasks: u32,
    pending_handles: Vec<Box<dyn TaskHandle>>,
    network_slot: Option<Slot>,
    network_slot_offset: usize,
    network_trace_id: u64,
}

/// Application-side accept stream: the encrypt pump.
struct ClientAccept<E: TlsEngine> {
    engine: Rc<RefCell<E>>,
    application_route_id: u64,
    application_id: u64,
    application_reply_id: u64,
    application_correlation_id: u64,
    authorization: u64,

    network_route_id: u64,
    network_id: u64,
    network_correlation_id: u64,

    state: StreamState,
    handshake: Option<Handshake<E>>,

    /// Credit the network grants us on the stream we opened.
    network_budget: i32,
    network_padding: i32,
    /// Credit we granted the application for cleartext.
    application_budget: i32,

    application_open: bool,
    reply_id: Option<u64>,
    trace_id: u64,
}

/// Network reply stream: the decrypt pump.
struct ClientReply<E: TlsEngine> {
    engine: Rc<RefCell<E>>,
    network_route_id: u64,
    network_reply_id: u64,
    accept_id: u64,

    /// Credit we granted the network peer for ciphertext.
    network_budget: i32,
    network_padding: i32,

    network_slot: Option<Slot>,
    network_slot_offset: usize,
    application_slot: Option<Slot>,
    application_slot_offset: usize,

    application_route_id: u64,
    application_reply_id: u64,
    application_reply_budget: i32,
    application_reply_padding: i32,

    trace_id: u64,
}

pub(crate) struct ClientFactory<E: TlsEngine> {
    handshake_budget: i32,
    network_pool: SlotPool,
    application_pool: SlotPool,
    accepts: HashMap<u64, ClientAccept<E>>,
    replies: HashMap<u64, ClientReply<E>>,
    throttles: HashMap<u64, Throttle>,
    /// correlation id of the opened network stream → accept stream id.
    correlations: HashMap<u64, u64>,
    out_net: Vec<u8>,
    out_app: Vec<u8>,
}

impl<E: TlsEngine> ClientFactory<E> {
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

    pub fn owns(&self, stream_id: u64) -> bool {
        self.accepts.contains_key(&stream_id)
            || self.replies.contains_key(&stream_id)
            || self.throttles.contains_key(&stream_id)
    }

    pub fn owns_correlation(&self, correlation_id: u64) -> bool {
        self.correlations.contains_key(&correlation_id)
    }

    /// New application-initiated stream over a client route.
    pub fn new_accept(
        &mut self,
        host: &mut Host<'_>,
        engine: E,
        begin: &Begin,
        network_route_id: u64,
    ) {
        let engine = Rc::new(RefCell::new(engine));
        let application_reply_id = host.ids.supply_reply_id(begin.stream_id);
        let network_id = host.ids.supply_initial_id();
        let network_correlation_id = host.ids.supply_correlation_id();
        debug!(
            application_id = begin.stream_id,
            network_id, network_route_id, "client accept stream"
        );

        let mut stream = ClientAccept {
            engine: engine.clone(),
            application_route_id: begin.route_id,
            application_id: begin.stream_id,
            application_reply_id,
            application_correlation_id: begin.correlation_id,
            authorization: begin.authorization,
            network_route_id,
            network_id,
            network_correlation_id,
            state: StreamState::Handshaking,
            handshake: None,
            network_budget: 0,
            network_padding: 0,
            application_budget: 0,
            application_open: true,
            reply_id: None,
            trace_id: begin.trace_id,
        };

        host.do_begin(
            network_route_id,
            network_id,
            begin.trace_id,
            begin.authorization,
            network_correlation_id,
            Vec::new(),
        );
        self.correlations
            .insert(network_correlation_id, begin.stream_id);
        self.throttles.insert(
            network_id,
            Throttle::Network {
                accept_id: begin.stream_id,
            },
        );

        let begun = engine.borrow_mut().begin_handshake();
        match begun {
            Ok(()) => {
                stream.handshake = Some(Handshake {
                    engine,
                    network_route_id,
                    network_id,
                    pending_tasks: 0,
                    pending_handles: Vec::new(),
                    network_slot: None,
                    network_slot_offset: 0,
                    network_trace_id: begin.trace_id,
                });
                self.accepts.insert(begin.stream_id, stream);
            }
            Err(err) => {
                debug!(application_id = begin.stream_id, %err, "client handshake failed to start");
                host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
                host.do_abort(network_route_id, network_id, begin.trace_id, 0);
                self.correlations.remove(&network_correlation_id);
                self.throttles.remove(&network_id);
            }
        }
    }

    /// Reply-direction BEGIN carrying one of our network correlations.
    pub fn on_reply_begin(&mut self, host: &mut Host<'_>, begin: &Begin) {
        let Some(accept_id) = self.correlations.remove(&begin.correlation_id) else {
            host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
            return;
        };
        let Some(accept) = self.accepts.get_mut(&accept_id) else {
            host.do_reset(begin.route_id, begin.stream_id, begin.trace_id);
            return;
        };
        accept.reply_id = Some(begin.stream_id);

        let mut reply = ClientReply {
            engine: accept.engine.clone(),
            network_route_id: begin.route_id,
            network_reply_id: begin.stream_id,
            accept_id,
            network_budget: 0,
            network_padding: 0,
            network_slot: None,
            network_slot_offset: 0,
            application_slot: None,
            application_slot_offset: 0,
            application_route_id: accept.application_route_id,
            application_reply_id: accept.application_reply_id,
            application_reply_budget: 0,
            application_reply_padding: 0,
            trace_id: begin.trace_id,
        };
        reply.network_budget += self.handshake_budget;
        host.do_window(
            reply.network_route_id,
            reply.network_reply_id,
            begin.trace_id,
            reply.network_budget,
            reply.network_padding,
        );
        debug!(
            network_reply_id = begin.stream_id,
            accept_id, "client network reply attached"
        );
        self.replies.insert(begin.stream_id, reply);
    }

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

    // ------------------------------------------------------------------
    // Application accept stream: encrypt pump
    // ------------------------------------------------------------------

    fn on_accept_event(&mut self, host: &mut Host<'_>, accept_id: u64, msg: Message) {
        let Some(mut accept) = self.accepts.remove(&accept_id) else {
            return;
        };
        let outcome = match (accept.state, msg) {
            (StreamState::Handshaking, Message::Signal(signal)) => {
                if signal.signal_id == FLUSH_HANDSHAKE_SIGNAL {
                    self.flush_handshake(host, &mut accept)
                } else {
                    Outcome::Keep
                }
            }
            (StreamState::Handshaking, Message::Data(data)) => {
                // No cleartext credit is granted before FINISHED.
                debug!(accept_id, "application data during client handshake");
                host.do_reset(accept.application_route_id, accept.application_id, data.trace_id);
                accept.application_open = false;
                self.abort_network(host, &mut accept, data.trace_id);
                Outcome::Remove
            }
            (StreamState::Handshaking, Message::End(end)) => {
                self.cancel_handshake(&mut accept);
                accept.application_open = false;
                self.abort_network(host, &mut accept, end.trace_id);
                Outcome::Remove
            }
            (StreamState::Handshaking, Message::Abort(abort)) => {
                self.cancel_handshake(&mut accept);
                accept.application_open = false;
                self.abort_network(host, &mut accept, abort.trace_id);
                Outcome::Remove
            }
            (StreamState::AfterHandshake, Message::Data(data)) => {
                self.on_application_data(host, &mut accept, data)
            }
            (StreamState::AfterHandshake, Message::End(end)) => {
                accept.application_open = false;
                accept.trace_id = end.trace_id;
                self.close_network_outbound(host, &mut accept, end.authorization);
                Outcome::Remove
            }
            (StreamState::AfterHandshake, Message::Abort(abort)) => {
                accept.application_open = false;
                accept.engine.borrow_mut().close_outbound();
                host.do_abort(accept.network_route_id, accept.network_id, abort.trace_id, 0);
                Outcome::Remove
            }
            (_, other) => {
                let trace = host.ids.supply_trace_id();
                host.do_reset(accept.application_route_id, other.stream_id(), trace);
                Outcome::Remove
            }
        };
        match outcome {
            Outcome::Keep => {
                self.accepts.insert(accept_id, accept);
            }
            Outcome::Remove => self.finish_accept(accept),
        }
    }

    fn on_application_data(
        &mut self,
        host: &mut Host<'_>,
        accept: &mut ClientAccept<E>,
        data: Data,
    ) -> Outcome {
        accept.trace_id = data.trace_id;
        accept.application_budget -= data.payload.len() as i32 + data.padding;

        if accept.application_budget < 0 {
            debug!(
                application_id = accept.application_id,
                budget = accept.application_budget,
                "application budget violated"
            );
            host.do_reset(accept.application_route_id, accept.application_id, data.trace_id);
            accept.application_open = false;
            self.close_network_outbound(host, accept, data.authorization);
            return Outcome::Remove;
        }

        let payload = &data.payload;
        let mut offset = 0;
        while offset < payload.len() && !accept.engine.borrow().is_outbound_done() {
            let result = {
                let mut engine = accept.engine.borrow_mut();
                engine.wrap(&payload[offset..], &mut self.out_net)
            };
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    debug!(application_id = accept.application_id, %err, "wrap failed");
                    host.do_reset(
                        accept.application_route_id,
                        accept.application_id,
                        data.trace_id,
                    );
                    accept.application_open = false;
                    host.do_abort(accept.network_route_id, accept.network_id, data.trace_id, 0);
                    return Outcome::Remove;
                }
            };
            offset += result.bytes_consumed;
            if result.bytes_produced > 0 {
                accept.network_budget -= result.bytes_produced as i32 + accept.network_padding;
                host.do_data(
                    accept.network_route_id,
                    accept.network_id,
                    data.trace_id,
                    accept.network_padding,
                    data.authorization,
                    &self.out_net[..result.bytes_produced],
                );
            }
            if result.bytes_consumed == 0 && result.bytes_produced == 0 {
                break;
            }
        }
        Outcome::Keep
    }

    fn close_network_outbound(
        &mut self,
        host: &mut Host<'_>,
        accept: &mut ClientAccept<E>,
        authorization: u64,
    ) {
        let flushed = {
            let mut engine = accept.engine.borrow_mut();
            engine.close_outbound();
            engine.wrap(&[], &mut self.out_net)
        };
        match flushed {
            Ok(result) => {
                if result.bytes_produced > 0 {
                    accept.network_budget -=
                        result.bytes_produced as i32 + accept.network_padding;
                    host.do_data(
                        accept.network_route_id,
                        accept.network_id,
                        accept.trace_id,
                        accept.network_padding,
                        authorization,
                        &self.out_net[..result.bytes_produced],
                    );
                }
                if accept.engine.borrow().is_outbound_done() {
                    host.do_end(
                        accept.network_route_id,
                        accept.network_id,
                        accept.trace_id,
                        authorization,
                    );
                }
            }
            Err(_) => {
                host.do_abort(accept.network_route_id, accept.network_id, accept.trace_id, 0);
            }
        }
    }

    fn abort_network(&mut self, host: &mut Host<'_>, accept: &mut ClientAccept<E>, trace_id: u64) {
        accept.engine.borrow_mut().close_outbound();
        host.do_abort(accept.network_route_id, accept.network_id, trace_id, 0);
    }

    fn cancel_handshake(&mut self, accept: &mut ClientAccept<E>) {
        if let Some(hs) = accept.handshake.as_mut() {
            for handle in hs.pending_handles.drain(..) {
                handle.cancel();
            }
            hs.pending_tasks = 0;
        }
    }

    fn finish_accept(&mut self, mut accept: ClientAccept<E>) {
        if let Some(hs) = accept.handshake.as_mut() {
            for handle in hs.pending_handles.drain(..) {
                handle.cancel();
            }
            if let Some(slot) = hs.network_slot.take() {
                self.network_pool.release(slot);
            }
        }
        self.correlations.remove(&accept.network_correlation_id);
        let accept_id = accept.application_id;
        self.drop_throttle(accept.network_id, |t| {
            matches!(t, Throttle::Network { accept_id: id } if *id == accept_id)
        });
        self.drop_throttle(accept.application_reply_id, |t| {
            matches!(t, Throttle::Application { accept_id: id } if *id == accept_id)
        });
    }

    // ------------------------------------------------------------------
    // Network reply stream: decrypt pump
    // ------------------------------------------------------------------

    fn on_reply_event(&mut self, host: &mut Host<'_>, reply_id: u64, msg: Message) {
        let Some(mut reply) = self.replies.remove(&reply_id) else {
            return;
        };
        let handshaking = self
            .accepts
            .get(&reply.accept_id)
            .map(|a| a.state == StreamState::Handshaking)
            .unwrap_or(false);

        let outcome = if handshaking {
            self.on_reply_handshake_event(host, &mut reply, msg)
        } else {
            match msg {
                Message::Data(data) => self.on_network_data(host, &mut reply, data),
                Message::End(end) => self.on_network_end(host, &mut reply, end.trace_id),
                Message::Abort(abort) => {
                    reply.engine.borrow_mut().close_inbound();
                    host.do_abort(
                        reply.application_route_id,
                        reply.application_reply_id,
                        abort.trace_id,
                        0,
                    );
                    Outcome::Remove
                }
                _ => {
                    let trace = host.ids.supply_trace_id();
                    host.do_reset(reply.network_route_id, reply.network_reply_id, trace);
                    Outcome::Remove
                }
            }
        };
        match outcome {
            Outcome::Keep => {
                self.replies.insert(reply_id, reply);
            }
            Outcome::Remove => self.finish_reply(reply),
        }
    }

    /// Ciphertext (or END/ABORT) on the reply stream while the accept
    /// stream is still handshaking.
    fn on_reply_handshake_event(
        &mut self,
        host: &mut Host<'_>,
        reply: &mut ClientReply<E>,
        msg: Message,
    ) -> Outcome {
        match msg {
            Message::Data(data) => {
                let Some(mut accept) = self.accepts.remove(&reply.accept_id) else {
                    return Outcome::Remove;
                };
                let mut hs = accept.handshake.take().expect("handshaking state");
                let outcome = self.on_handshake_data(host, &mut accept, &mut hs, reply, data);
                match outcome {
                    Outcome::Keep => {
                        if accept.state == StreamState::Handshaking {
                            accept.handshake = Some(hs);
                        } else {
                            // FINISHED: decrypt residue moves to the
                            // reply pump.
                            if hs.network_slot_offset != 0 {
                                reply.network_slot = hs.network_slot.take();
                                reply.network_slot_offset = hs.network_slot_offset;
                            } else if let Some(slot) = hs.network_slot.take() {
                                self.network_pool.release(slot);
                            }
                        }
                        self.accepts.insert(reply.accept_id, accept);
                        Outcome::Keep
                    }
                    Outcome::Remove => {
                        if let Some(slot) = hs.network_slot.take() {
                            self.network_pool.release(slot);
                        }
                        self.finish_accept(accept);
                        Outcome::Remove
                    }
                }
            }
            Message::End(end) => self.fail_handshake(host, reply, end.trace_id),
            Message::Abort(abort) => self.fail_handshake(host, reply, abort.trace_id),
            _ => {
                let trace = host.ids.supply_trace_id();
                host.do_reset(reply.network_route_id, reply.network_reply_id, trace);
                Outcome::Remove
            }
        }
    }

    fn fail_handshake(
        &mut self,
        host: &mut Host<'_>,
        reply: &mut ClientReply<E>,
        trace_id: u64,
    ) -> Outcome {
        if let Some(mut accept) = self.accepts.remove(&reply.accept_id) {
            self.cancel_handshake(&mut accept);
            accept.engine.borrow_mut().close_outbound();
            host.do_abort(accept.network_route_id, accept.network_id, trace_id, 0);
            if accept.application_open {
                host.do_reset(accept.application_route_id, accept.application_id, trace_id);
            }
            self.finish_accept(accept);
        }
        Outcome::Remove
    }

    fn on_handshake_data(
        &mut self,
        host: &mut Host<'_>,
        accept: &mut ClientAccept<E>,
        hs: &mut Handshake<E>,
        reply: &mut ClientReply<E>,
        data: Data,
    ) -> Outcome {
        hs.network_trace_id = data.trace_id;
        let payload_len = data.payload.len();
        reply.network_budget -= payload_len as i32 + data.padding;

        if hs.network_slot.is_none() {
            hs.network_slot = self.network_pool.acquire();
        }
        let capacity = self.network_pool.slot_capacity();
        let overrun = hs.network_slot_offset + payload_len > capacity;

        let outcome = if hs.network_slot.is_none() || reply.network_budget < 0 || overrun {
            debug!(
                network_reply_id = reply.network_reply_id,
                budget = reply.network_budget,
                "reply budget violated or slot exhausted during handshake"
            );
            host.do_reset(reply.network_route_id, reply.network_reply_id, data.trace_id);
            self.abort_network(host, accept, data.trace_id);
            if accept.application_open {
                accept.application_open = false;
                host.do_reset(accept.application_route_id, accept.application_id, data.trace_id);
            }
            hs.network_slot_offset = 0;
            Outcome::Remove
        } else {
            let slot = hs.network_slot.as_ref().expect("slot acquired");
            let offset = hs.network_slot_offset;
            self.network_pool.buffer(slot)[offset..offset + payload_len]
                .copy_from_slice(&data.payload);
            hs.network_slot_offset = offset + payload_len;

            match self.process_handshake_network(host, accept, hs) {
                Ok(()) => {
                    reply.network_budget += payload_len as i32;
                    host.do_window(
                        reply.network_route_id,
                        reply.network_reply_id,
                        data.trace_id,
                        payload_len as i32,
                        reply.network_padding,
                    );
                    Outcome::Keep
                }
                Err(err) => {
                    debug!(network_reply_id = reply.network_reply_id, %err, "client handshake failed");
                    hs.network_slot_offset = 0;
                    host.do_reset(reply.network_route_id, reply.network_reply_id, data.trace_id);
                    self.abort_network(host, accept, data.trace_id);
                    if accept.application_open {
                        accept.application_open = false;
                        host.do_reset(
                            accept.application_route_id,
                            accept.application_id,
                            data.trace_id,
                        );
                    }
                    Outcome::Remove
                }
            }
        };

        if hs.network_slot_offset == 0 {
            if let Some(slot) = hs.network_slot.take() {
                self.network_pool.release(slot);
            }
        }
        outcome
    }

    fn process_handshake_network(
        &mut self,
        host: &mut Host<'_>,
        accept: &mut ClientAccept<E>,
        hs: &mut Handshake<E>,
    ) -> Result<(), crate::error::Error> {
        let total = hs.network_slot_offset;
        let mut pos = 0;

        loop {
            if pos >= total || hs.engine.borrow().is_inbound_done() {
                break;
            }
            let status = hs.engine.borrow().handshake_status();
            if hs.pending_tasks != 0 || status == HandshakeStatus::NotHandshaking {
                break;
            }

            let result = {
                let slot = hs.network_slot.as_ref().expect("residue slot");
                let buf = self.network_pool.buffer(slot);
                let mut engine = hs.engine.borrow_mut();
                engine.unwrap(&buf[pos..total], &mut self.out_app[..])?
            };
            if result.bytes_produced != 0 {
                return Err(crate::error::Error::Tls(rustls::Error::General(
                    "application data before handshake completion".into(),
                )));
            }
            match result.status {
                IoStatus::BufferUnderflow
                | IoStatus::BufferOverflow
                | IoStatus::Closed => break,
                IoStatus::Ok => {
                    pos += result.bytes_consumed;
                    self.drive_handshake(host, accept, hs, result.handshake)?;
                }
            }
        }

        let remaining = total - pos;
        if remaining > 0 {
            let slot = hs.network_slot.as_ref().expect("residue slot");
            compact(self.network_pool.buffer(slot), pos, remaining);
        }
        hs.network_slot_offset = remaining;
        Ok(())
    }

    fn drive_handshake(
        &mut self,
        host: &mut Host<'_>,
        accept: &mut ClientAccept<E>,
        hs: &mut Handshake<E>,
        mut status: HandshakeStatus,
    ) -> Result<(), crate::error::Error> {
        loop {
            match status {
                HandshakeStatus::NeedTask => {
                    loop {
                        let task = hs.engine.borrow_mut().delegated_task();
                        let Some(task) = task else { break };
                        hs.pending_tasks += 1;
                        let handle = host.executor.execute(
                            task,
                            accept.application_route_id,
                            accept.application_id,
                            FLUSH_HANDSHAKE_SIGNAL,
                        );
                        hs.pending_handles.push(handle);
                    }
                    if hs.pending_tasks != 0 {
                        break;
                    }
                    status = hs.engine.borrow().handshake_status();
                }
                HandshakeStatus::NeedWrap => {
                    let result = {
                        let mut engine = hs.engine.borrow_mut();
                        engine.wrap(&[], &mut self.out_net)?
                    };
                    if result.bytes_produced > 0 {
                        accept.network_budget -=
                            result.bytes_produced as i32 + accept.network_padding;
                        host.do_data(
                            hs.network_route_id,
                            hs.network_id,
                            hs.network_trace_id,
                            0,
                            0,
                            &self.out_net[..result.bytes_produced],
                        );
                    }
                    status = result.handshake;
                    if status == HandshakeStatus::NeedWrap && result.bytes_produced == 0 {
                        break;
                    }
                }
                HandshakeStatus::Finished => {
                    self.on_finished(host, accept, hs);
                    status = hs.engine.borrow().handshake_status();
                }
                HandshakeStatus::NeedClientHello => {
                    return Err(crate::error::Error::EngineState(status));
                }
                HandshakeStatus::NotHandshaking | HandshakeStatus::NeedUnwrap => break,
            }
        }
        Ok(())
    }

    /// Handshake completion on the client side: open the application
    /// reply stream with the negotiated metadata and grant the
    /// application its cleartext window.  No route re-selection (the
    /// route was chosen at BEGIN; there is no SNI filter).
    fn on_finished(
        &mut self,
        host: &mut Host<'_>,
        accept: &mut ClientAccept<E>,
        hs: &mut Handshake<E>,
    ) {
        let (hostname, protocol) = {
            let engine = hs.engine.borrow();
            (
                engine.server_name().map(str::to_string),
                engine
                    .alpn_protocol()
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
            )
        };
        debug!(
            application_id = accept.application_id,
            sni = ?hostname,
            alpn = ?protocol,
            "client handshake finished"
        );

        let extension = TlsBeginEx {
            hostname,
            application_protocol: protocol,
        }
        .encode();
        host.do_begin(
            accept.application_route_id,
            accept.application_reply_id,
            hs.network_trace_id,
            accept.authorization,
            accept.application_correlation_id,
            extension,
        );
        self.throttles.insert(
            accept.application_reply_id,
            Throttle::Application {
                accept_id: accept.application_id,
            },
        );

        accept.state = StreamState::AfterHandshake;
        self.send_application_window(host, accept, hs.network_trace_id);
    }

    /// Pass the network's credit surplus to the application, uplifted by
    /// the record overhead the wrap will add.
    fn send_application_window(
        &mut self,
        host: &mut Host<'_>,
        accept: &mut ClientAccept<E>,
        trace_id: u64,
    ) {
        let credit = accept.network_budget - accept.application_budget;
        if credit > 0 {
            accept.application_budget += credit;
            host.do_window(
                accept.application_route_id,
                accept.application_id,
                trace_id,
                credit,
                accept.network_padding + MAX_HEADER_SIZE as i32,
            );
        }
    }

    fn flush_handshake(&mut self, host: &mut Host<'_>, accept: &mut ClientAccept<E>) -> Outcome {
        let Some(mut hs) = accept.handshake.take() else {
            return Outcome::Keep;
        };
        hs.pending_tasks = hs.pending_tasks.saturating_sub(1);
        if hs.pending_tasks != 0 {
            accept.handshake = Some(hs);
            return Outcome::Keep;
        }
        hs.pending_handles.clear();
        trace!(application_id = accept.application_id, "client handshake tasks drained");

        let resumed = if hs.network_slot.is_some() && hs.network_slot_offset > 0 {
            self.process_handshake_network(host, accept, &mut hs)
        } else {
            let status = hs.engine.borrow().handshake_status();
            self.drive_handshake(host, accept, &mut hs, status)
        };

        match resumed {
            Ok(()) => {
                if accept.state == StreamState::Handshaking {
                    accept.handshake = Some(hs);
                } else {
                    self.retire_handshake(accept.reply_id, hs);
                }
                Outcome::Keep
            }
            Err(err) => {
                debug!(application_id = accept.application_id, %err, "client resume failed");
                if let Some(slot) = hs.network_slot.take() {
                    self.network_pool.release(slot);
                }
                self.abort_network(host, accept, hs.network_trace_id);
                if accept.application_open {
                    accept.application_open = false;
                    host.do_reset(
                        accept.application_route_id,
                        accept.application_id,
                        hs.network_trace_id,
                    );
                }
                Outcome::Remove
            }
        }
    }

    /// After FINISHED, any ciphertext residue the handshake held moves to
    /// the reply pump; otherwise the slot goes back to the pool.
    fn retire_handshake(&mut self, reply_id: Option<u64>, mut hs: Handshake<E>) {
        if hs.network_slot_offset != 0 {
            if let Some(reply) = reply_id.and_then(|id| self.replies.get_mut(&id)) {
                reply.network_slot = hs.network_slot.take();
                reply.network_slot_offset = hs.network_slot_offset;
                hs.network_slot_offset = 0;
            }
        }
        if let Some(slot) = hs.network_slot.take() {
            self.network_pool.release(slot);
        }
    }

    fn on_network_data(
        &mut self,
        host: &mut Host<'_>,
        reply: &mut ClientReply<E>,
        data: Data,
    ) -> Outcome {
        reply.trace_id = data.trace_id;
        let payload_len = data.payload.len();
        reply.network_budget -= payload_len as i32 + data.padding;

        if reply.network_slot.is_none() {
            reply.network_slot = self.network_pool.acquire();
        }
        let capacity = self.network_pool.slot_capacity();
        let overrun = reply.network_slot_offset + payload_len > capacity;

        let outcome = if reply.network_slot.is_none() || reply.network_budget < 0 || overrun {
            debug!(
                network_reply_id = reply.network_reply_id,
                budget = reply.network_budget,
                "network reply budget violated or slot exhausted"
            );
            reply.engine.borrow_mut().close_inbound();
            host.do_reset(reply.network_route_id, reply.network_reply_id, data.trace_id);
            host.do_abort(
                reply.application_route_id,
                reply.application_reply_id,
                data.trace_id,
                0,
            );
            reply.network_slot_offset = 0;
            Outcome::Remove
        } else {
            let slot = reply.network_slot.as_ref().expect("slot acquired");
            let offset = reply.network_slot_offset;
            self.network_pool.buffer(slot)[offset..offset + payload_len]
                .copy_from_slice(&data.payload);
            reply.network_slot_offset = offset + payload_len;

            match self.unwrap_reply_data(host, reply) {
                Ok(outcome) => outcome,
                Err(err) => {
                    debug!(network_reply_id = reply.network_reply_id, %err, "unwrap failed");
                    host.do_reset(reply.network_route_id, reply.network_reply_id, data.trace_id);
                    host.do_abort(
                        reply.application_route_id,
                        reply.application_reply_id,
                        data.trace_id,
                        0,
                    );
                    reply.network_slot_offset = 0;
                    reply.application_slot_offset = 0;
                    Outcome::Remove
                }
            }
        };

        self.release_idle_reply_slots(reply);
        outcome
    }

    fn unwrap_reply_data(
        &mut self,
        host: &mut Host<'_>,
        reply: &mut ClientReply<E>,
    ) -> Result<Outcome, crate::error::Error> {
        if reply.application_slot.is_none() {
            reply.application_slot = self.application_pool.acquire();
        }
        let Some(application_slot) = &reply.application_slot else {
            debug!(
                network_reply_id = reply.network_reply_id,
                "application pool exhausted"
            );
            reply.engine.borrow_mut().close_inbound();
            host.do_reset(reply.network_route_id, reply.network_reply_id, reply.trace_id);
            host.do_abort(
                reply.application_route_id,
                reply.application_reply_id,
                reply.trace_id,
                0,
            );
            reply.network_slot_offset = 0;
            return Ok(Outcome::Remove);
        };

        let network_slot = reply.network_slot.as_ref().expect("network residue");
        let capacity = self.network_pool.slot_capacity();
        let total = reply.network_slot_offset;
        let mut pos = 0;
        let mut fatal = false;

        loop {
            if pos >= total || reply.engine.borrow().is_inbound_done() {
                let remaining = total - pos;
                compact(self.network_pool.buffer(network_slot), pos, remaining);
                reply.network_slot_offset = remaining;
                break;
            }
            let result = {
                let net = self.network_pool.buffer(network_slot);
                let app = self.application_pool.buffer(application_slot);
                let mut engine = reply.engine.borrow_mut();
                engine.unwrap(&net[pos..total], &mut app[reply.application_slot_offset..])?
            };
            match result.status {
                IoStatus::BufferUnderflow | IoStatus::BufferOverflow => {
                    let remaining = total - pos;
                    compact(self.network_pool.buffer(network_slot), pos, remaining);
                    reply.network_slot_offset = remaining;
                    if remaining == capacity && result.status == IoStatus::BufferUnderflow {
                        reply.network_slot_offset = 0;
                        fatal = true;
                    } else {
                        let credit = (capacity as i32
                            - reply.network_slot_offset as i32
                            - reply.network_budget)
                            .max(0);
                        if credit > 0 {
                            reply.network_budget += credit;
                            host.do_window(
                                reply.network_route_id,
                                reply.network_reply_id,
                                reply.trace_id,
                                credit,
                                reply.network_padding,
                            );
                        }
                    }
                    break;
                }
                IoStatus::Closed => {
                    let remaining = total - pos;
                    compact(self.network_pool.buffer(network_slot), pos, remaining);
                    reply.network_slot_offset = remaining;
                    break;
                }
                IoStatus::Ok => {
                    pos += result.bytes_consumed;
                    reply.network_slot_offset = total - pos;
                    reply.application_slot_offset += result.bytes_produced;
                }
            }
        }

        if fatal {
            debug!(network_reply_id = reply.network_reply_id, "slot-filling partial record");
            host.do_reset(reply.network_route_id, reply.network_reply_id, reply.trace_id);
            host.do_abort(
                reply.application_route_id,
                reply.application_reply_id,
                reply.trace_id,
                0,
            );
            reply.engine.borrow_mut().close_inbound();
            return Ok(Outcome::Remove);
        }

        Ok(self.flush_reply_app_data(host, reply))
    }

    fn flush_reply_app_data(&mut self, host: &mut Host<'_>, reply: &mut ClientReply<E>) -> Outcome {
        if reply.application_slot_offset > 0 {
            let slot = reply.application_slot.as_ref().expect("application residue");
            let window = (reply.application_reply_budget - reply.application_reply_padding)
                .min(MAX_PAYLOAD_LENGTH as i32);
            let consumed = (reply.application_slot_offset as i32).min(window);
            if consumed > 0 {
                let consumed = consumed as usize;
                let app = self.application_pool.buffer(slot);
                host.do_data(
                    reply.application_route_id,
                    reply.application_reply_id,
                    reply.trace_id,
                    reply.application_reply_padding,
                    0,
                    &app[..consumed],
                );
                reply.application_reply_budget -=
                    consumed as i32 + reply.application_reply_padding;
                reply.application_slot_offset -= consumed;
                compact(
                    self.application_pool.buffer(slot),
                    consumed,
                    reply.application_slot_offset,
                );
            }
        }
        if reply.application_slot_offset == 0 && reply.engine.borrow().is_inbound_done() {
            trace!(
                network_reply_id = reply.network_reply_id,
                "inbound drained, ending application reply"
            );
            host.do_end(
                reply.application_route_id,
                reply.application_reply_id,
                reply.trace_id,
                0,
            );
            return Outcome::Remove;
        }
        Outcome::Keep
    }

    fn on_network_end(
        &mut self,
        host: &mut Host<'_>,
        reply: &mut ClientReply<E>,
        trace_id: u64,
    ) -> Outcome {
        let inbound_done = reply.engine.borrow().is_inbound_done();
        if !inbound_done {
            host.do_end(
                reply.application_route_id,
                reply.application_reply_id,
                trace_id,
                0,
            );
            return Outcome::Remove;
        }
        if reply.application_slot_offset > 0 {
            return Outcome::Keep;
        }
        Outcome::Remove
    }

    fn release_idle_reply_slots(&mut self, reply: &mut ClientReply<E>) {
        if reply.network_slot_offset == 0 {
            if let Some(slot) = reply.network_slot.take() {
                self.network_pool.release(slot);
            }
        }
        if reply.application_slot_offset == 0 {
            if let Some(slot) = reply.application_slot.take() {
                self.application_pool.release(slot);
            }
        }
    }

    fn finish_reply(&mut self, mut reply: ClientReply<E>) {
        if let Some(slot) = reply.network_slot.take() {
            self.network_pool.release(slot);
        }
        if let Some(slot) = reply.application_slot.take() {
            self.application_pool.release(slot);
        }
    }

    // ------------------------------------------------------------------
    // Throttles
    // ------------------------------------------------------------------

    fn on_throttle_window(&mut self, host: &mut Host<'_>, window: Window) {
        match self.throttles.get(&window.stream_id).copied() {
            None => {}
            Some(Throttle::Network { accept_id }) => {
                let Some(mut accept) = self.accepts.remove(&accept_id) else {
                    return;
                };
                accept.network_budget += window.credit;
                accept.network_padding = window.padding;
                match accept.state {
                    StreamState::Handshaking => {
                        let mut hs = accept.handshake.take().expect("handshaking state");
                        if hs.pending_tasks == 0 {
                            let status = hs.engine.borrow().handshake_status();
                            if let Err(err) =
                                self.drive_handshake(host, &mut accept, &mut hs, status)
                            {
                                debug!(accept_id, %err, "client handshake wrap failed");
                                if let Some(slot) = hs.network_slot.take() {
                                    self.network_pool.release(slot);
                                }
                                self.abort_network(host, &mut accept, window.trace_id);
                                if accept.application_open {
                                    accept.application_open = false;
                                    host.do_reset(
                                        accept.application_route_id,
                                        accept.application_id,
                                        window.trace_id,
                                    );
                                }
                                self.finish_accept(accept);
                                return;
                            }
                        }
                        if accept.state == StreamState::Handshaking {
                            accept.handshake = Some(hs);
                        } else {
                            self.retire_handshake(accept.reply_id, hs);
                        }
                        self.accepts.insert(accept_id, accept);
                    }
                    StreamState::AfterHandshake => {
                        self.send_application_window(host, &mut accept, window.trace_id);
                        self.accepts.insert(accept_id, accept);
                    }
                }
            }
            Some(Throttle::Application { accept_id }) => {
                let reply_id = self.accepts.get(&accept_id).and_then(|a| a.reply_id);
                let Some(reply_id) = reply_id.or_else(|| {
                    self.replies
                        .iter()
                        .find(|(_, r)| r.accept_id == accept_id)
                        .map(|(id, _)| *id)
                }) else {
                    return;
                };
                let Some(mut reply) = self.replies.remove(&reply_id) else {
                    return;
                };
                reply.application_reply_budget += window.credit;
                reply.application_reply_padding = window.padding;
                reply.network_padding = window.padding;

                let mut outcome = Outcome::Keep;
                if reply.application_slot_offset != 0 {
                    outcome = self.flush_reply_app_data(host, &mut reply);
                }
                if outcome == Outcome::Keep && reply.network_slot_offset != 0 {
                    outcome = match self.unwrap_reply_data(host, &mut reply) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            debug!(reply_id, %err, "unwrap on window failed");
                            host.do_reset(
                                reply.network_route_id,
                                reply.network_reply_id,
                                window.trace_id,
                            );
                            host.do_abort(
                                reply.application_route_id,
                                reply.application_reply_id,
                                window.trace_id,
                                0,
                            );
                            reply.network_slot_offset = 0;
                            reply.application_slot_offset = 0;
                            Outcome::Remove
                        }
                    };
                }
                self.release_idle_reply_slots(&mut reply);
                if outcome == Outcome::Keep {
                    let capacity = self.network_pool.slot_capacity() as i32;
                    let credit = reply.application_reply_budget.min(capacity)
                        - reply.network_budget
                        - reply.network_slot_offset as i32;
                    if credit > 0 {
                        reply.network_budget += credit;
                        host.do_window(
                            reply.network_route_id,
                            reply.network_reply_id,
                            window.trace_id,
                            credit,
                            reply.network_padding,
                        );
                    }
                    self.replies.insert(reply_id, reply);
                } else {
                    self.finish_reply(reply);
                }
            }
        }
    }

    fn on_throttle_reset(&mut self, host: &mut Host<'_>, stream_id: u64, trace_id: u64) {
        match self.throttles.get(&stream_id).copied() {
            None => {}
            Some(Throttle::Network { accept_id }) => {
                let Some(mut accept) = self.accepts.remove(&accept_id) else {
                    return;
                };
                accept.engine.borrow_mut().close_outbound();
                if accept.application_open {
                    accept.application_open = false;
                    host.do_reset(accept.application_route_id, accept.application_id, trace_id);
                }
                self.finish_accept(accept);
            }
            Some(Throttle::Application { accept_id }) => {
                let reply_id = self
                    .replies
                    .iter()
                    .find(|(_, r)| r.accept_id == accept_id)
                    .map(|(id, _)| *id);
                if let Some(reply_id) = reply_id {
                    if let Some(mut reply) = self.replies.remove(&reply_id) {
                        reply.engine.borrow_mut().close_inbound();
                        host.do_reset(reply.network_route_id, reply.network_reply_id, trace_id);
                        self.finish_reply(reply);
                    }
                }
                self.throttles.remove(&stream_id);
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
