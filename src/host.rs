//! Per-dispatch view of the host facilities the record pumps consume.
//!
//! The module owns these collaborators; a `Host` borrows them disjointly
//! for the duration of one message dispatch so stream state and shared
//! state never alias.

use std::collections::VecDeque;

use crate::counters::{add, Counters, RouteCounters};
use crate::exec::Executor;
use crate::frame::{Abort, Begin, Data, End, Message, Reset, Window};
use crate::ids::StreamIds;
use crate::route::RouteTable;

pub(crate) struct Host<'a> {
    pub routes: &'a RouteTable,
    pub ids: &'a mut dyn StreamIds,
    pub executor: &'a mut dyn Executor,
    pub counters: &'a mut Counters,
    pub out: &'a mut VecDeque<Vec<u8>>,
}

impl Host<'_> {
    /// Queue `msg` for the host, bumping the route's write accumulators.
    pub fn emit(&mut self, msg: Message) {
        let counters = RouteCounters::supply(self.counters, msg.route_id());
        add(&counters.frames_written, 1);
        if let Message::Data(data) = &msg {
            add(&counters.bytes_written, data.payload.len() as u64);
        }
        self.out.push_back(msg.encode());
    }

    pub fn do_begin(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        authorization: u64,
        correlation_id: u64,
        extension: Vec<u8>,
    ) {
        self.emit(Message::Begin(Begin {
            route_id,
            stream_id,
            trace_id,
            authorization,
            correlation_id,
            extension,
        }));
    }

    pub fn do_data(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        padding: i32,
        authorization: u64,
        payload: &[u8],
    ) {
        self.emit(Message::Data(Data {
            route_id,
            stream_id,
            trace_id,
            authorization,
            group_id: 0,
            padding,
            payload: payload.to_vec(),
        }));
    }

    pub fn do_end(&mut self, route_id: u64, stream_id: u64, trace_id: u64, authorization: u64) {
        self.emit(Message::End(End {
            route_id,
            stream_id,
            trace_id,
            authorization,
        }));
    }

    pub fn do_abort(&mut self, route_id: u64, stream_id: u64, trace_id: u64, authorization: u64) {
        self.emit(Message::Abort(Abort {
            route_id,
            stream_id,
            trace_id,
            authorization,
        }));
    }

    pub fn do_window(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        credit: i32,
        padding: i32,
    ) {
        self.emit(Message::Window(Window {
            route_id,
            stream_id,
            trace_id,
            credit,
            padding,
            group_id: 0,
        }));
    }

    pub fn do_reset(&mut self, route_id: u64, stream_id: u64, trace_id: u64) {
        self.emit(Message::Reset(Reset {
            route_id,
            stream_id,
            trace_id,
        }));
    }
}
