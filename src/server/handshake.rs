//! Handshake coordinator for server-role accept streams.
//!
//! Owns the handshake-only state: the ciphertext residue slot, the reply
//! budget the network grants us before any reply stream exists, and the
//! delegated-task bookkeeping.  While `pending_tasks > 0` the connection
//! is parked and no call into the engine is made; the executor's
//! FLUSH_HANDSHAKE signal re-enters the loop.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::engine::{AlpnChoice, HandshakeStatus, IoStatus, TlsEngine};
use crate::error::Error;
use crate::exec::TaskHandle;
use crate::frame::{
    Data, Message, Signal, TlsBeginEx, FLUSH_HANDSHAKE_SIGNAL,
};
use crate::host::Host;
use crate::route::{matches_client_hello, matches_session, RouteKind};
use crate::slab::compact;

use super::accept::{AcceptStream, StreamState};
use super::{Shared, Throttle};

/// Per-connection handshake state, handed from the accept stream to the
/// correlation registry at FINISHED and from there to the reply stream.
pub(crate) struct Handshake<E: TlsEngine> {
    pub engine: Rc<RefCell<E>>,
    pub network_route_id: u64,
    pub network_id: u64,
    pub network_reply_id: u64,
    pub authorization: u64,

    pub pending_tasks: u32,
    pub pending_handles: Vec<Box<dyn TaskHandle>>,

    pub network_slot: Option<crate::slab::Slot>,
    pub network_slot_offset: usize,

    pub network_reply_budget: i32,
    pub network_reply_padding: i32,
    pub network_trace_id: u64,

    /// Set at FINISHED; switches the reply-throttle RESET disposition.
    pub finished: bool,
}

impl<E: TlsEngine> Handshake<E> {
    pub fn new(
        engine: Rc<RefCell<E>>,
        network_route_id: u64,
        network_id: u64,
        network_reply_id: u64,
        authorization: u64,
    ) -> Self {
        Self {
            engine,
            network_route_id,
            network_id,
            network_reply_id,
            authorization,
            pending_tasks: 0,
            pending_handles: Vec::new(),
            network_slot: None,
            network_slot_offset: 0,
            network_reply_budget: 0,
            network_reply_padding: 0,
            network_trace_id: 0,
            finished: false,
        }
    }

    /// Cancel outstanding tasks and give back the residue slot.
    pub fn teardown(&mut self, shared: &mut Shared<'_, E>) {
        for handle in self.pending_handles.drain(..) {
            handle.cancel();
        }
        if let Some(slot) = self.network_slot.take() {
            shared.network_pool.release(slot);
        }
        self.network_slot_offset = 0;
    }
}

/// Coordinator outcome visible to the factory.
pub(crate) enum HsEvent {
    Keep,
    /// Handshake finished; move it into the correlation registry.
    Finished { correlation_id: u64 },
    /// Connection is dead; tear everything down.
    Remove,
}

/// FINISHED disposition inside one status-loop run.
enum Finish {
    Completed { correlation_id: u64 },
    RouteMiss,
}

/// Stream-direction messages while handshaking.
pub(crate) fn on_stream<E: TlsEngine>(
    hs: &mut Handshake<E>,
    accept: &mut AcceptStream<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
    msg: Message,
) -> HsEvent {
    match msg {
        Message::Data(data) => on_data(hs, accept, shared, host, data),
        Message::End(end) => {
            cancel_and_abort(hs, host, end.trace_id);
            HsEvent::Remove
        }
        Message::Abort(abort) => {
            cancel_and_abort(hs, host, abort.trace_id);
            HsEvent::Remove
        }
        Message::Signal(signal) => on_signal(hs, accept, shared, host, signal),
        _ => {
            let trace = host.ids.supply_trace_id();
            host.do_reset(hs.network_route_id, hs.network_id, trace);
            HsEvent::Remove
        }
    }
}

fn cancel_and_abort<E: TlsEngine>(hs: &mut Handshake<E>, host: &mut Host<'_>, trace_id: u64) {
    for handle in hs.pending_handles.drain(..) {
        handle.cancel();
    }
    hs.pending_tasks = 0;
    hs.engine.borrow_mut().close_outbound();
    host.do_abort(hs.network_route_id, hs.network_reply_id, trace_id, 0);
}

fn on_data<E: TlsEngine>(
    hs: &mut Handshake<E>,
    accept: &mut AcceptStream<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
    data: Data,
) -> HsEvent {
    hs.network_trace_id = data.trace_id;
    let payload_len = data.payload.len();
    accept.network_budget -= payload_len as i32 + data.padding;

    if hs.network_slot.is_none() {
        hs.network_slot = shared.network_pool.acquire();
    }

    let capacity = shared.network_pool.slot_capacity();
    let overrun = hs
        .network_slot
        .as_ref()
        .map(|_| hs.network_slot_offset + payload_len > capacity)
        .unwrap_or(false);

    let outcome = if hs.network_slot.is_none() || accept.network_budget < 0 || overrun {
        close_outbound_and_flush(hs, shared, host);
        host.do_reset(hs.network_route_id, hs.network_id, data.trace_id);
        host.do_abort(hs.network_route_id, hs.network_reply_id, data.trace_id, 0);
        HsEvent::Remove
    } else {
        let slot = hs.network_slot.as_ref().expect("slot acquired");
        let offset = hs.network_slot_offset;
        shared.network_pool.buffer(slot)[offset..offset + payload_len]
            .copy_from_slice(&data.payload);
        hs.network_slot_offset = offset + payload_len;

        match process_network(hs, accept, shared, host) {
            Ok(finish) => {
                accept.network_budget += payload_len as i32;
                host.do_window(
                    hs.network_route_id,
                    hs.network_id,
                    data.trace_id,
                    payload_len as i32,
                    accept.network_padding,
                );
                match finish {
                    None => HsEvent::Keep,
                    Some(Finish::Completed { correlation_id }) => {
                        HsEvent::Finished { correlation_id }
                    }
                    Some(Finish::RouteMiss) => HsEvent::Remove,
                }
            }
            Err(err) => {
                debug!(network_id = hs.network_id, %err, "handshake failed");
                hs.network_slot_offset = 0;
                host.do_reset(hs.network_route_id, hs.network_id, data.trace_id);
                host.do_abort(hs.network_route_id, hs.network_reply_id, data.trace_id, 0);
                HsEvent::Remove
            }
        }
    };

    if hs.network_slot_offset == 0 {
        if let Some(slot) = hs.network_slot.take() {
            shared.network_pool.release(slot);
        }
    }
    outcome
}

fn on_signal<E: TlsEngine>(
    hs: &mut Handshake<E>,
    accept: &mut AcceptStream<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
    signal: Signal,
) -> HsEvent {
    if signal.signal_id != FLUSH_HANDSHAKE_SIGNAL {
        return HsEvent::Keep;
    }
    hs.pending_tasks = hs.pending_tasks.saturating_sub(1);
    if hs.pending_tasks != 0 {
        return HsEvent::Keep;
    }
    hs.pending_handles.clear();
    trace!(network_id = hs.network_id, "handshake tasks drained, resuming");

    let resumed = if hs.network_slot.is_some() && hs.network_slot_offset > 0 {
        process_network(hs, accept, shared, host)
    } else {
        let status = hs.engine.borrow().handshake_status();
        drive_status(status, hs, accept, shared, host)
    };

    let outcome = match resumed {
        Ok(None) => HsEvent::Keep,
        Ok(Some(Finish::Completed { correlation_id })) => HsEvent::Finished { correlation_id },
        Ok(Some(Finish::RouteMiss)) => HsEvent::Remove,
        Err(err) => {
            debug!(network_id = hs.network_id, %err, "handshake resume failed");
            hs.network_slot_offset = 0;
            let trace = host.ids.supply_trace_id();
            host.do_reset(hs.network_route_id, hs.network_id, trace);
            host.do_abort(hs.network_route_id, hs.network_reply_id, trace, 0);
            HsEvent::Remove
        }
    };

    if hs.network_slot_offset == 0 {
        if let Some(slot) = hs.network_slot.take() {
            shared.network_pool.release(slot);
        }
    }
    outcome
}

/// WINDOW from the network on the reply stream while still handshaking.
pub(crate) fn on_reply_window<E: TlsEngine>(
    hs: &mut Handshake<E>,
    accept: &mut AcceptStream<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
    credit: i32,
    padding: i32,
) -> HsEvent {
    hs.network_reply_budget += credit;
    hs.network_reply_padding = padding;

    // The engine is off-limits while delegated work is in flight.
    if hs.pending_tasks != 0 {
        return HsEvent::Keep;
    }
    let status = hs.engine.borrow().handshake_status();
    match drive_status(status, hs, accept, shared, host) {
        Ok(None) => HsEvent::Keep,
        Ok(Some(Finish::Completed { correlation_id })) => HsEvent::Finished { correlation_id },
        Ok(Some(Finish::RouteMiss)) => HsEvent::Remove,
        Err(err) => {
            debug!(network_id = hs.network_id, %err, "handshake wrap failed");
            let trace = host.ids.supply_trace_id();
            host.do_reset(hs.network_route_id, hs.network_id, trace);
            host.do_abort(hs.network_route_id, hs.network_reply_id, trace, 0);
            HsEvent::Remove
        }
    }
}

/// RESET from the network on the reply stream before the reply attached.
pub(crate) fn on_reply_reset<E: TlsEngine>(hs: &mut Handshake<E>) {
    if !hs.finished {
        hs.engine.borrow_mut().close_inbound();
    }
}

/// Unwrap buffered ciphertext one record at a time, dispatching each
/// reported status through the coordinator loop.
fn process_network<E: TlsEngine>(
    hs: &mut Handshake<E>,
    accept: &mut AcceptStream<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
) -> Result<Option<Finish>, Error> {
    let total = hs.network_slot_offset;
    let mut pos = 0;
    let mut finish = None;

    loop {
        if pos >= total || hs.engine.borrow().is_inbound_done() {
            break;
        }

        // Parked, or nothing left to negotiate: keep the residue and stop.
        let status = hs.engine.borrow().handshake_status();
        if hs.pending_tasks != 0 || status == HandshakeStatus::NotHandshaking {
            break;
        }

        let result = {
            let slot = hs.network_slot.as_ref().expect("residue slot");
            let buf = shared.network_pool.buffer(slot);
            let mut engine = hs.engine.borrow_mut();
            engine.unwrap(&buf[pos..total], &mut shared.out_app[..])?
        };

        // The peer must not interleave application data into the
        // handshake.
        if result.bytes_produced != 0 {
            return Err(Error::Tls(rustls::Error::General(
                "application data before handshake completion".into(),
            )));
        }

        match result.status {
            IoStatus::BufferUnderflow | IoStatus::BufferOverflow => break,
            IoStatus::Closed => break,
            IoStatus::Ok => {
                pos += result.bytes_consumed;
                if finish.is_none() {
                    finish = drive_status(result.handshake, hs, accept, shared, host)?;
                }
            }
        }
    }

    let remaining = total - pos;
    if remaining > 0 {
        let slot = hs.network_slot.as_ref().expect("residue slot");
        compact(shared.network_pool.buffer(slot), pos, remaining);
    }
    hs.network_slot_offset = remaining;
    Ok(finish)
}

/// The status-dispatch loop: delegated tasks are offloaded and park the
/// connection, `NeedWrap` flushes ciphertext onto the network reply, the
/// ClientHello selects a route for ALPN, and `Finished` performs route
/// selection and the application-side BEGIN.
fn drive_status<E: TlsEngine>(
    mut status: HandshakeStatus,
    hs: &mut Handshake<E>,
    accept: &mut AcceptStream<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
) -> Result<Option<Finish>, Error> {
    let mut finish = None;
    loop {
        match status {
            HandshakeStatus::NeedTask => {
                loop {
                    let task = hs.engine.borrow_mut().delegated_task();
                    let Some(task) = task else { break };
                    hs.pending_tasks += 1;
                    let handle = host.executor.execute(
                        task,
                        hs.network_route_id,
                        hs.network_id,
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
                    engine.wrap(&[], &mut shared.out_net[..])?
                };
                if result.bytes_produced > 0 {
                    hs.network_reply_budget -=
                        result.bytes_produced as i32 + hs.network_reply_padding;
                    host.do_data(
                        hs.network_route_id,
                        hs.network_reply_id,
                        hs.network_trace_id,
                        0,
                        0,
                        &shared.out_net[..result.bytes_produced],
                    );
                }
                if hs.engine.borrow().is_outbound_done() {
                    host.do_end(hs.network_route_id, hs.network_reply_id, hs.network_trace_id, 0);
                }
                status = result.handshake;
                if status == HandshakeStatus::NeedWrap && result.bytes_produced == 0 {
                    // Nothing moved: wait for reply-side window.
                    break;
                }
            }
            HandshakeStatus::NeedClientHello => {
                let hello = hs
                    .engine
                    .borrow()
                    .client_hello()
                    .cloned()
                    .unwrap_or_default();
                let choice = select_application_protocol(host, &hello);
                trace!(
                    network_id = hs.network_id,
                    sni = ?hello.server_name,
                    offered = ?hello.alpn,
                    choice = ?choice,
                    "client hello resolved"
                );
                hs.engine.borrow_mut().resolve_client_hello(choice)?;
                status = hs.engine.borrow().handshake_status();
            }
            HandshakeStatus::Finished => {
                finish = Some(on_finished(hs, accept, shared, host));
                status = hs.engine.borrow().handshake_status();
            }
            HandshakeStatus::NotHandshaking | HandshakeStatus::NeedUnwrap => break,
        }
    }
    Ok(finish)
}

/// The ALPN selection callback, route-table driven: a route matching the
/// hello's SNI and offered protocols supplies the protocol; a protocol-
/// free route opts out of ALPN; no route rejects the handshake.
fn select_application_protocol(
    host: &Host<'_>,
    hello: &crate::engine::ClientHelloInfo,
) -> AlpnChoice {
    let route = host.routes.resolve(RouteKind::Server, 0, |r| {
        matches_client_hello(r, hello.server_name.as_deref(), &hello.alpn)
    });
    match route {
        None => AlpnChoice::Reject,
        Some(route) => match route.extension.application_protocol.as_deref() {
            None => AlpnChoice::NoAlpn,
            Some(protocol) => AlpnChoice::Protocol(protocol.to_string()),
        },
    }
}

/// Route selection over the finished session, application-side BEGIN, and
/// transition of the accept stream to `AfterHandshake`.
fn on_finished<E: TlsEngine>(
    hs: &mut Handshake<E>,
    accept: &mut AcceptStream<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
) -> Finish {
    let (hostname, protocol) = {
        let engine = hs.engine.borrow();
        (
            engine.server_name().map(str::to_string),
            engine.alpn_protocol().filter(|p| !p.is_empty()).map(str::to_string),
        )
    };

    let route = host.routes.resolve(RouteKind::Server, accept.authorization, |r| {
        matches_session(r, hostname.as_deref(), protocol.as_deref())
    });
    let Some(route) = route else {
        debug!(
            network_id = hs.network_id,
            sni = ?hostname,
            alpn = ?protocol,
            "no route for finished handshake"
        );
        host.do_reset(hs.network_route_id, hs.network_id, hs.network_trace_id);
        host.do_abort(hs.network_route_id, hs.network_reply_id, hs.network_trace_id, 0);
        return Finish::RouteMiss;
    };

    let application_route_id = route.route_id;
    let correlation_id = host.ids.supply_correlation_id();
    let application_id = host.ids.supply_initial_id();

    let extension = TlsBeginEx {
        hostname: hostname.clone(),
        application_protocol: protocol.clone(),
    }
    .encode();
    host.do_begin(
        application_route_id,
        application_id,
        hs.network_trace_id,
        accept.authorization,
        correlation_id,
        extension,
    );
    shared.throttles.insert(
        application_id,
        Throttle::AcceptApplication {
            network_id: hs.network_id,
        },
    );
    shared.throttles.insert(
        hs.network_reply_id,
        Throttle::HandshakeReply {
            network_id: hs.network_id,
            correlation_id: Some(correlation_id),
        },
    );

    accept.application_route_id = application_route_id;
    accept.application_id = application_id;
    accept.application_correlation_id = correlation_id;
    accept.state = StreamState::AfterHandshake;
    hs.finished = true;

    debug!(
        network_id = hs.network_id,
        application_id,
        correlation_id,
        sni = ?hostname,
        alpn = ?protocol,
        "handshake finished"
    );
    Finish::Completed { correlation_id }
}

/// Close the write side and flush whatever close record that produced.
fn close_outbound_and_flush<E: TlsEngine>(
    hs: &mut Handshake<E>,
    shared: &mut Shared<'_, E>,
    host: &mut Host<'_>,
) {
    let produced = {
        let mut engine = hs.engine.borrow_mut();
        engine.close_outbound();
        match engine.wrap(&[], &mut shared.out_net[..]) {
            Ok(result) => result.bytes_produced,
            Err(_) => 0,
        }
    };
    if produced > 0 {
        hs.network_reply_budget -= produced as i32 + hs.network_reply_padding;
        host.do_data(
            hs.network_route_id,
            hs.network_reply_id,
            hs.network_trace_id,
            hs.network_reply_padding,
            0,
            &shared.out_net[..produced],
        );
    }
    if hs.engine.borrow().is_outbound_done() {
        host.do_end(hs.network_route_id, hs.network_reply_id, hs.network_trace_id, 0);
    }
}
