//! Server accept stream: the decrypt record pump.
//!
//! Network ciphertext arrives as DATA, accumulates in the network slot,
//! and is unwrapped one record at a time into the application slot, which
//! drains downstream as the application grants window.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::engine::{HandshakeStatus, IoStatus, TlsEngine};
use crate::frame::{Data, End, Window, MAX_PAYLOAD_LENGTH};
use crate::host::Host;
use crate::slab::{compact, Slot};

use super::handshake::Handshake;
use super::Shared;

/// Accept-stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    BeforeBegin,
    Handshaking,
    AfterHandshake,
}

/// Whether the stream survives the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptOutcome {
    Keep,
    Remove,
}

pub(crate) struct AcceptStream<E: TlsEngine> {
    pub engine: Rc<RefCell<E>>,
    pub network_route_id: u64,
    pub network_id: u64,
    pub network_reply_id: u64,
    pub authorization: u64,
    pub network_correlation_id: u64,

    pub state: StreamState,
    pub handshake: Option<Handshake<E>>,

    pub network_slot: Option<Slot>,
    pub network_slot_offset: usize,
    pub application_slot: Option<Slot>,
    pub application_slot_offset: usize,

    pub network_budget: i32,
    pub network_padding: i32,
    pub application_budget: i32,
    pub application_padding: i32,

    pub application_route_id: u64,
    pub application_id: u64,
    pub application_correlation_id: u64,

    pub network_trace_id: u64,
}

impl<E: TlsEngine> AcceptStream<E> {
    pub fn new(
        engine: Rc<RefCell<E>>,
        network_route_id: u64,
        network_id: u64,
        authorization: u64,
    ) -> Self {
        Self {
            engine,
            network_route_id,
            network_id,
            network_reply_id: 0,
            authorization,
            network_correlation_id: 0,
            state: StreamState::BeforeBegin,
            handshake: None,
            network_slot: None,
            network_slot_offset: 0,
            application_slot: None,
            application_slot_offset: 0,
            network_budget: 0,
            network_padding: 0,
            application_budget: 0,
            application_padding: 0,
            application_route_id: 0,
            application_id: 0,
            application_correlation_id: 0,
            network_trace_id: 0,
        }
    }

    /// Release both slots.  Every terminal path ends here.
    pub fn teardown(&mut self, shared: &mut Shared<'_, E>) {
        if let Some(slot) = self.network_slot.take() {
            shared.network_pool.release(slot);
        }
        self.network_slot_offset = 0;
        if let Some(slot) = self.application_slot.take() {
            shared.application_pool.release(slot);
        }
        self.application_slot_offset = 0;
        if let Some(hs) = self.handshake.as_mut() {
            hs.teardown(shared);
        }
    }

    /// Network DATA after the handshake.
    pub fn on_data(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
        data: Data,
    ) -> AcceptOutcome {
        self.network_trace_id = data.trace_id;
        let payload_len = data.payload.len();
        self.network_budget -= payload_len as i32 + data.padding;

        if self.network_slot.is_none() {
            self.network_slot = shared.network_pool.acquire();
        }

        let capacity = shared.network_pool.slot_capacity();
        let overrun = self.network_slot_offset + payload_len > capacity;

        let outcome = if self.network_slot.is_none() || self.network_budget < 0 || overrun {
            debug!(
                network_id = self.network_id,
                budget = self.network_budget,
                "network budget violated or slot exhausted"
            );
            self.engine.borrow_mut().close_inbound();
            host.do_reset(self.network_route_id, self.network_id, data.trace_id);
            host.do_abort(
                self.application_route_id,
                self.application_id,
                data.trace_id,
                self.authorization,
            );
            self.network_slot_offset = 0;
            AcceptOutcome::Remove
        } else {
            let slot = self.network_slot.as_ref().expect("slot acquired");
            let offset = self.network_slot_offset;
            shared.network_pool.buffer(slot)[offset..offset + payload_len]
                .copy_from_slice(&data.payload);
            self.network_slot_offset = offset + payload_len;

            match self.unwrap_network_data(shared, host) {
                Ok(outcome) => outcome,
                Err(err) => {
                    debug!(network_id = self.network_id, %err, "unwrap failed");
                    host.do_reset(self.network_route_id, self.network_id, data.trace_id);
                    host.do_abort(
                        self.application_route_id,
                        self.application_id,
                        data.trace_id,
                        self.authorization,
                    );
                    self.network_slot_offset = 0;
                    self.application_slot_offset = 0;
                    AcceptOutcome::Remove
                }
            }
        };

        self.release_idle_slots(shared);
        outcome
    }

    /// The unwrap loop: one record per engine call, compaction on
    /// partial records, credit regrant while the slot has room.
    fn unwrap_network_data(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
    ) -> Result<AcceptOutcome, crate::error::Error> {
        if self.network_slot_offset == 0 {
            return Ok(self.flush_app_data(shared, host));
        }

        if self.application_slot.is_none() {
            self.application_slot = shared.application_pool.acquire();
        }
        let Some(application_slot) = &self.application_slot else {
            debug!(network_id = self.network_id, "application pool exhausted");
            self.engine.borrow_mut().close_inbound();
            host.do_reset(self.network_route_id, self.network_id, self.network_trace_id);
            host.do_abort(
                self.application_route_id,
                self.application_id,
                self.network_trace_id,
                self.authorization,
            );
            self.network_slot_offset = 0;
            return Ok(AcceptOutcome::Remove);
        };

        let network_slot = self.network_slot.as_ref().expect("network residue");
        let capacity = shared.network_pool.slot_capacity();
        let total = self.network_slot_offset;
        let mut pos = 0;
        let mut fatal = false;

        loop {
            if pos >= total || self.engine.borrow().is_inbound_done() {
                let remaining = total - pos;
                compact(shared.network_pool.buffer(network_slot), pos, remaining);
                self.network_slot_offset = remaining;
                break;
            }

            let result = {
                let net = shared.network_pool.buffer(network_slot);
                let app = shared.application_pool.buffer(application_slot);
                let mut engine = self.engine.borrow_mut();
                engine.unwrap(&net[pos..total], &mut app[self.application_slot_offset..])?
            };

            match result.status {
                IoStatus::BufferUnderflow | IoStatus::BufferOverflow => {
                    let remaining = total - pos;
                    compact(shared.network_pool.buffer(network_slot), pos, remaining);
                    self.network_slot_offset = remaining;

                    if remaining == capacity && result.status == IoStatus::BufferUnderflow {
                        // A record larger than a whole slot: corruption.
                        self.network_slot_offset = 0;
                        fatal = true;
                    } else {
                        let credit = (capacity as i32
                            - self.network_slot_offset as i32
                            - self.network_budget)
                            .max(0);
                        if credit > 0 {
                            self.network_budget += credit;
                            host.do_window(
                                self.network_route_id,
                                self.network_id,
                                self.network_trace_id,
                                credit,
                                self.network_padding,
                            );
                        }
                    }
                    break;
                }
                IoStatus::Closed => {
                    let remaining = total - pos;
                    compact(shared.network_pool.buffer(network_slot), pos, remaining);
                    self.network_slot_offset = remaining;
                    break;
                }
                IoStatus::Ok => {
                    pos += result.bytes_consumed;
                    self.network_slot_offset = total - pos;
                    self.application_slot_offset += result.bytes_produced;
                    debug_assert_eq!(result.handshake, HandshakeStatus::NotHandshaking);
                }
            }
        }

        if fatal {
            debug!(network_id = self.network_id, "slot-filling partial record");
            host.do_reset(self.network_route_id, self.network_id, self.network_trace_id);
            host.do_abort(
                self.application_route_id,
                self.application_id,
                self.network_trace_id,
                self.authorization,
            );
            self.engine.borrow_mut().close_inbound();
            return Ok(AcceptOutcome::Remove);
        }

        Ok(self.flush_app_data(shared, host))
    }

    /// Drain decrypted bytes downstream within the application window;
    /// emit END once the slot is empty and TLS inbound is done.
    pub fn flush_app_data(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
    ) -> AcceptOutcome {
        if self.application_slot_offset > 0 {
            let slot = self.application_slot.as_ref().expect("application residue");
            let window = (self.application_budget - self.application_padding)
                .min(MAX_PAYLOAD_LENGTH as i32);
            let consumed = (self.application_slot_offset as i32).min(window);

            if consumed > 0 {
                let consumed = consumed as usize;
                let app = shared.application_pool.buffer(slot);
                host.do_data(
                    self.application_route_id,
                    self.application_id,
                    self.network_trace_id,
                    self.application_padding,
                    self.authorization,
                    &app[..consumed],
                );
                self.application_budget -= consumed as i32 + self.application_padding;
                self.application_slot_offset -= consumed;
                compact(
                    shared.application_pool.buffer(slot),
                    consumed,
                    self.application_slot_offset,
                );
            }
        }

        if self.application_slot_offset == 0 && self.engine.borrow().is_inbound_done() {
            trace!(network_id = self.network_id, "inbound drained, ending application stream");
            host.do_end(
                self.application_route_id,
                self.application_id,
                self.network_trace_id,
                self.authorization,
            );
            return AcceptOutcome::Remove;
        }
        AcceptOutcome::Keep
    }

    /// Application-side WINDOW: drain buffered cleartext, resume the
    /// unwrap loop on any ciphertext residue, then pass credit upstream.
    pub fn on_application_window(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
        window: Window,
    ) -> AcceptOutcome {
        self.application_budget += window.credit;
        self.application_padding = window.padding;
        self.network_padding = window.padding;

        if self.application_slot_offset != 0 {
            if self.flush_app_data(shared, host) == AcceptOutcome::Remove {
                self.release_idle_slots(shared);
                return AcceptOutcome::Remove;
            }
        }

        if self.network_slot_offset != 0 {
            match self.unwrap_network_data(shared, host) {
                Ok(AcceptOutcome::Remove) => {
                    self.release_idle_slots(shared);
                    return AcceptOutcome::Remove;
                }
                Ok(AcceptOutcome::Keep) => {}
                Err(err) => {
                    debug!(network_id = self.network_id, %err, "unwrap on window failed");
                    host.do_reset(self.network_route_id, self.network_id, window.trace_id);
                    host.do_abort(
                        self.application_route_id,
                        self.application_id,
                        window.trace_id,
                        self.authorization,
                    );
                    self.network_slot_offset = 0;
                    self.application_slot_offset = 0;
                    self.release_idle_slots(shared);
                    return AcceptOutcome::Remove;
                }
            }
        }
        self.release_idle_slots(shared);

        let capacity = shared.network_pool.slot_capacity() as i32;
        let credit = self.application_budget.min(capacity)
            - self.network_budget
            - self.network_slot_offset as i32;
        if credit > 0 {
            self.network_budget += credit;
            host.do_window(
                self.network_route_id,
                self.network_id,
                window.trace_id,
                credit,
                self.network_padding,
            );
        }
        AcceptOutcome::Keep
    }

    /// Application-side RESET.
    pub fn on_application_reset(&mut self, host: &mut Host<'_>, trace_id: u64) -> AcceptOutcome {
        self.engine.borrow_mut().close_inbound();
        host.do_reset(self.network_route_id, self.network_id, trace_id);
        AcceptOutcome::Remove
    }

    /// Network END.  Permitted without close_notify: the half-close is
    /// propagated, and resumption for this peer was already forfeited by
    /// `close_inbound`.
    pub fn on_end(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
        end: End,
    ) -> AcceptOutcome {
        let inbound_done = self.engine.borrow().is_inbound_done();
        if !inbound_done {
            host.do_end(
                self.application_route_id,
                self.application_id,
                end.trace_id,
                self.authorization,
            );
            if let Some(mut hs) = shared.correlations.remove(&self.application_correlation_id) {
                hs.teardown(shared);
                self.engine.borrow_mut().close_outbound();
                host.do_end(
                    self.network_route_id,
                    self.network_reply_id,
                    end.trace_id,
                    end.authorization,
                );
            }
            return AcceptOutcome::Remove;
        }
        if self.application_slot_offset > 0 {
            // close_notify already drained the TLS stream; keep the
            // buffered cleartext until the application window takes it.
            return AcceptOutcome::Keep;
        }
        AcceptOutcome::Remove
    }

    /// Network ABORT.
    pub fn on_abort(&mut self, host: &mut Host<'_>, trace_id: u64) -> AcceptOutcome {
        self.engine.borrow_mut().close_inbound();
        host.do_abort(
            self.application_route_id,
            self.application_id,
            trace_id,
            self.authorization,
        );
        AcceptOutcome::Remove
    }

    fn release_idle_slots(&mut self, shared: &mut Shared<'_, E>) {
        if self.network_slot_offset == 0 {
            if let Some(slot) = self.network_slot.take() {
                shared.network_pool.release(slot);
            }
        }
        if self.application_slot_offset == 0 {
            if let Some(slot) = self.application_slot.take() {
                shared.application_pool.release(slot);
            }
        }
    }
}
