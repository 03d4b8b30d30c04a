//! Server connect-reply stream: the encrypt record pump.
//!
//! Cleartext from the application reply stream is wrapped into TLS
//! records and emitted as ciphertext DATA on the network reply stream the
//! handshake opened.  The application-side padding reserves room for the
//! worst-case record overhead on top of whatever the network reserves.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::engine::{record::MAX_HEADER_SIZE, HandshakeStatus, TlsEngine};
use crate::frame::{Data, Window};
use crate::host::Host;

use super::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    Keep,
    Remove,
}

pub(crate) struct ReplyStream<E: TlsEngine> {
    pub engine: Rc<RefCell<E>>,
    pub application_route_id: u64,
    pub application_reply_id: u64,

    pub application_reply_budget: i32,
    pub application_reply_padding: i32,

    pub network_route_id: u64,
    pub network_reply_id: u64,
    pub network_reply_budget: i32,
    pub network_reply_padding: i32,

    /// Cleared once the application reply stream is done (END/RESET sent
    /// or received); gates the RESET we owe it on network teardown.
    pub application_open: bool,

    pub trace_id: u64,
}

impl<E: TlsEngine> ReplyStream<E> {
    /// Initial WINDOW toward the application: everything the network has
    /// granted us, with the padding uplift.
    pub fn send_application_window(&mut self, host: &mut Host<'_>, trace_id: u64) {
        let credit = self.network_reply_budget - self.application_reply_budget;
        if credit > 0 {
            self.application_reply_budget += credit;
            host.do_window(
                self.application_route_id,
                self.application_reply_id,
                trace_id,
                credit,
                self.application_reply_padding,
            );
        }
    }

    /// Application cleartext: wrap and flush, one record per iteration.
    pub fn on_data(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
        data: Data,
    ) -> ReplyOutcome {
        self.trace_id = data.trace_id;
        self.application_reply_budget -= data.payload.len() as i32 + data.padding;

        if self.application_reply_budget < 0 {
            debug!(
                application_reply_id = self.application_reply_id,
                budget = self.application_reply_budget,
                "application reply budget violated"
            );
            host.do_reset(self.application_route_id, self.application_reply_id, data.trace_id);
            self.application_open = false;
            self.close_outbound_and_flush(shared, host, data.authorization);
            return ReplyOutcome::Remove;
        }

        let payload = &data.payload;
        let mut offset = 0;
        while offset < payload.len() && !self.engine.borrow().is_outbound_done() {
            let result = {
                let mut engine = self.engine.borrow_mut();
                engine.wrap(&payload[offset..], &mut shared.out_net[..])
            };
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    debug!(
                        application_reply_id = self.application_reply_id,
                        %err,
                        "wrap failed"
                    );
                    host.do_reset(
                        self.application_route_id,
                        self.application_reply_id,
                        data.trace_id,
                    );
                    host.do_abort(self.network_route_id, self.network_reply_id, data.trace_id, 0);
                    return ReplyOutcome::Remove;
                }
            };

            offset += result.bytes_consumed;
            if result.bytes_produced > 0 {
                self.network_reply_budget -=
                    result.bytes_produced as i32 + self.network_reply_padding;
                host.do_data(
                    self.network_route_id,
                    self.network_reply_id,
                    data.trace_id,
                    self.network_reply_padding,
                    data.authorization,
                    &shared.out_net[..result.bytes_produced],
                );
            }
            // Renegotiation has no TLS 1.3 counterpart; the dispatch stays
            // as a no-op hook.
            debug_assert_ne!(result.handshake, HandshakeStatus::NeedTask);

            if result.bytes_consumed == 0 && result.bytes_produced == 0 {
                break;
            }
        }
        ReplyOutcome::Keep
    }

    /// Application END: close the write side, flush the close_notify
    /// record, and end the network reply.
    pub fn on_end(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
        trace_id: u64,
        authorization: u64,
    ) -> ReplyOutcome {
        trace!(application_reply_id = self.application_reply_id, "application write close");
        self.application_open = false;
        self.trace_id = trace_id;
        self.close_outbound_and_flush(shared, host, authorization);
        ReplyOutcome::Remove
    }

    /// Application ABORT: drop the write side without close_notify.
    pub fn on_abort(&mut self, host: &mut Host<'_>, trace_id: u64) -> ReplyOutcome {
        self.application_open = false;
        self.engine.borrow_mut().close_outbound();
        host.do_abort(self.network_route_id, self.network_reply_id, trace_id, 0);
        ReplyOutcome::Remove
    }

    /// WINDOW from the network reply: take the credit, refresh paddings,
    /// and pass the surplus to the application.
    pub fn on_network_window(&mut self, host: &mut Host<'_>, window: Window) -> ReplyOutcome {
        self.network_reply_budget += window.credit;
        self.network_reply_padding = window.padding;
        self.application_reply_padding = window.padding + MAX_HEADER_SIZE as i32;
        self.send_application_window(host, window.trace_id);
        ReplyOutcome::Keep
    }

    /// RESET from the network reply.
    pub fn on_network_reset(&mut self, host: &mut Host<'_>, trace_id: u64) -> ReplyOutcome {
        self.engine.borrow_mut().close_outbound();
        if self.application_open {
            self.application_open = false;
            host.do_reset(self.application_route_id, self.application_reply_id, trace_id);
        }
        ReplyOutcome::Remove
    }

    fn close_outbound_and_flush(
        &mut self,
        shared: &mut Shared<'_, E>,
        host: &mut Host<'_>,
        authorization: u64,
    ) {
        let flushed = {
            let mut engine = self.engine.borrow_mut();
            engine.close_outbound();
            engine.wrap(&[], &mut shared.out_net[..])
        };
        match flushed {
            Ok(result) => {
                if result.bytes_produced > 0 {
                    self.network_reply_budget -=
                        result.bytes_produced as i32 + self.network_reply_padding;
                    host.do_data(
                        self.network_route_id,
                        self.network_reply_id,
                        self.trace_id,
                        self.network_reply_padding,
                        authorization,
                        &shared.out_net[..result.bytes_produced],
                    );
                }
                if self.engine.borrow().is_outbound_done() {
                    host.do_end(
                        self.network_route_id,
                        self.network_reply_id,
                        self.trace_id,
                        authorization,
                    );
                    if self.application_open {
                        self.application_open = false;
                        host.do_reset(
                            self.application_route_id,
                            self.application_reply_id,
                            self.trace_id,
                        );
                    }
                }
            }
            Err(_) => {
                host.do_abort(self.network_route_id, self.network_reply_id, self.trace_id, 0);
            }
        }
    }
}
