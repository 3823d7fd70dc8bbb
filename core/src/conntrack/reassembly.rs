//! Best-effort TCP stream reassembly.
//!
//! Each direction of a connection is tracked independently. In-order payload is written to the
//! direction's stream as soon as it arrives; segments from the future are held in a bounded
//! out-of-order buffer until the gap is filled. A FIN or RST closes the direction's stream, as
//! does overflow of the out-of-order buffer.
//!
//! Directions stay tracked after their stream is closed, so that retransmissions and late
//! segments are discarded instead of being mistaken for a new connection. They are evicted once
//! they have been idle for longer than the maximum age passed to
//! [Assembler::flush_older_than].

use super::conn_id::FourTuple;
use super::pdu::{L4Pdu, FIN, RST, SYN};
use super::stream::StreamWriter;
use super::FlowTable;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};

/// Reassembles TCP segments into directional streams obtained from a [FlowTable].
pub struct Assembler {
    /// Tracked directions, least recently updated first.
    flows: LinkedHashMap<FourTuple, TcpFlow>,
    table: Arc<FlowTable>,
    max_out_of_order: usize,
}

impl Assembler {
    pub fn new(table: Arc<FlowTable>, max_out_of_order: usize) -> Self {
        Assembler {
            flows: LinkedHashMap::new(),
            table,
            max_out_of_order,
        }
    }

    /// Processes a single TCP segment observed at `now`.
    pub fn process(&mut self, segment: L4Pdu, now: Instant) {
        let key = segment.endpoints();
        match self.flows.raw_entry_mut().from_key(&key) {
            RawEntryMut::Occupied(mut occupied) => {
                let flow = occupied.get_mut();
                // A SYN on a finished direction is a new connection reusing the four-tuple.
                if !(segment.flags() & SYN != 0 && flow.is_closed()) {
                    flow.last_seen = now;
                    flow.insert_segment(segment);
                    occupied.to_back();
                    return;
                }
                occupied.remove();
            }
            RawEntryMut::Vacant(_) => (),
        }

        // Empty segments without SYN (bare ACKs, late FINs) carry no evidence of who initiated
        // the connection.
        if segment.flags() & SYN == 0 && segment.length() == 0 {
            return;
        }
        let writer = self.table.resolve(key);
        let mut flow = TcpFlow::new(self.max_out_of_order, writer, now);
        flow.insert_segment(segment);
        self.flows.insert(key, flow);
    }

    /// Delivers buffered data and closes every direction idle since before `cutoff`, skipping
    /// sequence gaps. Returns the number of directions evicted.
    pub fn flush_older_than(&mut self, cutoff: Instant) -> usize {
        let mut evicted = 0;
        while let Some((_, flow)) = self.flows.front() {
            if flow.last_seen >= cutoff {
                break;
            }
            if let Some((key, mut flow)) = self.flows.pop_front() {
                log::debug!("Flushing idle stream {}", key);
                flow.flush_gaps();
                evicted += 1;
            }
        }
        evicted
    }

    /// Delivers buffered data and closes every tracked direction.
    pub fn flush_all(&mut self) -> usize {
        let evicted = self.flows.len();
        while let Some((_, mut flow)) = self.flows.pop_front() {
            flow.flush_gaps();
        }
        evicted
    }

    /// Returns the number of tracked directions.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }
}

/// Represents a uni-directional TCP flow
#[derive(Debug)]
pub(crate) struct TcpFlow {
    /// Expected sequence number of next segment
    next_seq: Option<u32>,
    /// Out-of-order buffer
    ooo_buf: OutOfOrderBuffer,
    /// Write half of the direction's stream, `None` once closed.
    writer: Option<StreamWriter>,
    last_seen: Instant,
}

impl TcpFlow {
    fn new(capacity: usize, writer: StreamWriter, now: Instant) -> Self {
        TcpFlow {
            next_seq: None,
            ooo_buf: OutOfOrderBuffer::new(capacity),
            writer: Some(writer),
            last_seen: now,
        }
    }

    fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Attempt to insert incoming data segment into flow.
    /// Buffer future segments and drop old segments.
    /// Closes the stream if the incoming segment causes out-of-order buffer overflow.
    fn insert_segment(&mut self, mut segment: L4Pdu) {
        if self.is_closed() {
            return;
        }
        let cur_seq = segment.seq_no();

        let next_seq = match self.next_seq {
            Some(next_seq) => next_seq,
            None if segment.flags() & SYN != 0 => {
                // The SYN occupies one sequence number.
                let data_seq = cur_seq.wrapping_add(1);
                segment.ctxt.seq_no = data_seq;
                data_seq
            }
            // Stream picked up mid-connection.
            None => cur_seq,
        };
        self.next_seq = Some(next_seq);
        let cur_seq = segment.seq_no();

        if next_seq == cur_seq {
            // Segment is the next expected segment in the sequence
            let expected_seq = self.consume(segment);
            self.flush_ooo_buffer(expected_seq);
        } else if wrapping_lt(next_seq, cur_seq) {
            // Segment comes after the next expected segment
            self.buffer_ooo_seg(segment);
        } else if overlap(&mut segment, next_seq).is_some() {
            // Segment starts before the next expected segment but has new data
            let expected_seq = self.consume(segment);
            self.flush_ooo_buffer(expected_seq);
        } else if segment.flags() & (FIN | RST) != 0 && segment.length() == 0 {
            // Retransmitted or early-acknowledged control segment.
            self.consume(segment);
        } else {
            log::trace!(
                "Dropping old segment. cur: {} expect: {}",
                cur_seq,
                next_seq
            );
        }
    }

    /// Writes an in-order segment and returns the sequence number expected after it.
    fn consume(&mut self, segment: L4Pdu) -> u32 {
        let next_seq = next_seq_after(&segment);
        deliver(&mut self.writer, segment);
        next_seq
    }

    /// Insert packet into ooo buffer and handle overflow
    fn buffer_ooo_seg(&mut self, segment: L4Pdu) {
        if self.ooo_buf.insert_back(segment).is_err() {
            log::warn!("Out-of-order buffer overflow, closing stream");
            self.ooo_buf.clear();
            self.writer = None;
        }
    }

    /// Flushes the flow's out-of-order buffer given the next expected
    /// sequence number and updates the flow's new next expected
    /// sequence number after the flush.
    fn flush_ooo_buffer(&mut self, expected_seq: u32) {
        let next_seq = self.ooo_buf.flush_ordered(expected_seq, &mut self.writer);
        self.next_seq = Some(next_seq);
    }

    /// Delivers every buffered segment in sequence order, jumping over missing data, then
    /// closes the stream.
    fn flush_gaps(&mut self) {
        while !self.is_closed() {
            let next_seq = match self.ooo_buf.earliest_after(self.next_seq) {
                Some(seq) => seq,
                None => break,
            };
            log::debug!("Skipping gap {:?} -> {}", self.next_seq, next_seq);
            self.flush_ooo_buffer(next_seq);
        }
        self.ooo_buf.clear();
        self.writer = None;
    }
}

/// Writes the payload of `segment` and closes the stream on FIN or RST.
fn deliver(writer: &mut Option<StreamWriter>, segment: L4Pdu) {
    if let Some(stream) = writer {
        if !segment.payload().is_empty() && !stream.write(segment.payload()) {
            // The reader is gone; nothing more will be read from this direction.
            *writer = None;
            return;
        }
    }
    if segment.flags() & (FIN | RST) != 0 {
        *writer = None;
    }
}

/// Sequence number following `segment`, counting a FIN as one byte.
fn next_seq_after(segment: &L4Pdu) -> u32 {
    let mut next_seq = segment.seq_no().wrapping_add(segment.length() as u32);
    if segment.flags() & FIN != 0 {
        next_seq = next_seq.wrapping_add(1);
    }
    next_seq
}

/// A buffer to hold reordered TCP segments
#[derive(Debug)]
pub(crate) struct OutOfOrderBuffer {
    capacity: usize,
    buf: VecDeque<L4Pdu>,
}

#[derive(Debug)]
pub(crate) struct Overflow;

impl OutOfOrderBuffer {
    /// Creates a new OutOfOrderBuffer with capacity
    fn new(capacity: usize) -> Self {
        OutOfOrderBuffer {
            capacity,
            buf: VecDeque::new(),
        }
    }

    /// Returns the number of elements in the buffer
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    fn clear(&mut self) {
        self.buf.clear();
    }

    /// Inserts segment at the end of the buffer.
    fn insert_back(&mut self, segment: L4Pdu) -> Result<(), Overflow> {
        log::trace!("insert with seq : {:#?}", segment.seq_no());
        if self.len() >= self.capacity {
            return Err(Overflow);
        }
        self.buf.push_back(segment);
        Ok(())
    }

    /// Returns the buffered sequence number closest after `next_seq`.
    fn earliest_after(&self, next_seq: Option<u32>) -> Option<u32> {
        let base = next_seq.unwrap_or_default();
        self.buf
            .iter()
            .map(|segment| segment.seq_no())
            .min_by_key(|seq| seq.wrapping_sub(base))
    }

    /// Consumes segments with expected data, retains segments with future data,
    /// and drops segments with old data.
    /// Returns the next expected sequence number.
    fn flush_ordered(
        &mut self,
        expected_seq: u32,
        writer: &mut Option<StreamWriter>,
    ) -> u32 {
        let mut next_seq = expected_seq;
        let mut index = 0;
        while index < self.len() {
            if writer.is_none() {
                self.buf.clear();
                return next_seq;
            }

            let cur_seq = self.buf[index].seq_no();
            log::trace!("Flushing...current seq: {:#?}", cur_seq);

            if next_seq == cur_seq {
                if let Some(segment) = self.buf.remove(index) {
                    next_seq = next_seq_after(&segment);
                    deliver(writer, segment);
                }
                index = 0;
            } else if wrapping_lt(next_seq, cur_seq) {
                index += 1;
            } else if let Some(mut segment) = self.buf.remove(index) {
                if let Some(update_seq) = overlap(&mut segment, next_seq) {
                    next_seq = update_seq;
                    deliver(writer, segment);
                    index = 0;
                } else {
                    log::trace!("Dropping old segment during flush.");
                }
            }
        }
        next_seq
    }
}

pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // From RFC1323:
    //     TCP determines if a data segment is "old" or "new" by testing
    //     whether its sequence number is within 2**31 bytes of the left edge
    //     of the window, and if it is not, discarding the data as "old".
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Check if a segment has overlapping data with the received bytes.
/// Trims the already-received prefix and returns the new expected sequence number if there is
/// new data.
fn overlap(segment: &mut L4Pdu, expected_seq: u32) -> Option<u32> {
    let length = segment.length();
    let cur_seq = segment.seq_no();
    let end_seq = cur_seq.wrapping_add(length as u32);

    if wrapping_lt(expected_seq, end_seq) {
        let new_data_len = end_seq.wrapping_sub(expected_seq) as usize;
        let overlap_data_len = expected_seq.wrapping_sub(cur_seq) as usize;

        log::trace!("Overlap with new data size : {:#?}", new_data_len);
        segment.payload.drain(..overlap_data_len);
        segment.ctxt.seq_no = expected_seq;
        segment.ctxt.length = new_data_len;
        Some(next_seq_after(segment))
    } else {
        None
    }
}
