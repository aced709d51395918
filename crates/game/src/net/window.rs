use std::collections::{BTreeSet, HashMap, VecDeque};

use super::error::{ProtocolError, TransportError};
use super::protocol::{
    FIRST_FRAGMENT_BITS, FRAGMENT_BITS, LENGTH_BITS, MAX_MESSAGE_BITS, is_handshake,
    sequence_greater_than,
};
use crate::bits::BitBuffer;

const MAX_PRE_HANDSHAKE: usize = 64;
/// Longest run of skipped sequences a single datagram may open.
const MAX_TRACKED_GAP: u32 = 1 << 16;

/// A datagram ready for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub sequence: u32,
    pub bytes: Vec<u8>,
}

/// Outgoing half of a connection: numbers datagrams and keeps what a NACK
/// may ask for again.
#[derive(Debug)]
pub struct SendWindow {
    next_sequence: u32,
    stored: HashMap<u32, Vec<u8>>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl SendWindow {
    pub fn new(initial_sequence: u32, capacity: usize) -> Self {
        Self {
            next_sequence: initial_sequence,
            stored: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Splits `payload` into numbered datagrams. Each one is stored in full
    /// when `retransmit` is set, otherwise as a stub carrying only its
    /// sequence number and a zero length.
    pub fn prepare(
        &mut self,
        payload: &BitBuffer,
        retransmit: bool,
    ) -> Result<Vec<Datagram>, TransportError> {
        let bits = payload.len();
        if bits == 0 || bits > MAX_MESSAGE_BITS || (!retransmit && bits > FIRST_FRAGMENT_BITS) {
            return Err(TransportError::MessageTooLarge { bits });
        }

        let source = payload.clone();
        source.set_read_position(0);

        let extra = (bits - FIRST_FRAGMENT_BITS.min(bits)).div_ceil(FRAGMENT_BITS);
        let mut datagrams = Vec::with_capacity(1 + extra);
        let mut first = true;
        while source.remaining() > 0 {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);

            let datagram = BitBuffer::new();
            datagram.write(&sequence);
            let room = if first {
                datagram.write(&(bits as u16));
                FIRST_FRAGMENT_BITS
            } else {
                FRAGMENT_BITS
            };
            let chunk = source.remaining().min(room);
            if let Some(part) = source.take(chunk) {
                datagram.append(&part);
            }
            first = false;

            let bytes = datagram.to_bytes();
            let stored = if retransmit { bytes.clone() } else { Self::stub(sequence) };
            self.store(sequence, stored);
            datagrams.push(Datagram { sequence, bytes });
        }
        Ok(datagrams)
    }

    fn stub(sequence: u32) -> Vec<u8> {
        let stub = BitBuffer::new();
        stub.write(&sequence);
        stub.write(&0u16);
        stub.to_bytes()
    }

    fn store(&mut self, sequence: u32, bytes: Vec<u8>) {
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.stored.remove(&oldest);
            }
        }
        self.order.push_back(sequence);
        self.stored.insert(sequence, bytes);
    }

    /// Stored datagrams for `count` sequences from `first`. Sequences that
    /// were never sent or have been evicted are skipped.
    pub fn resend(&self, first: u32, count: u32) -> Vec<Datagram> {
        (0..count)
            .map(|offset| first.wrapping_add(offset))
            .filter_map(|sequence| {
                self.stored.get(&sequence).map(|bytes| Datagram {
                    sequence,
                    bytes: bytes.clone(),
                })
            })
            .collect()
    }

    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }
}

/// Everything one incoming datagram produced.
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// Complete messages in sequence order, each starting at its type id.
    pub messages: Vec<BitBuffer>,
    /// Ranges to request again, as `(first, count)`.
    pub nacks: Vec<(u32, u32)>,
    pub duplicate: bool,
    pub handshake: bool,
    pub lost: u32,
    pub errors: Vec<ProtocolError>,
}

/// Incoming half of a connection: orders datagrams by sequence number,
/// tracks gaps and reassembles messages.
#[derive(Debug)]
pub struct ReceiveWindow {
    expected: u32,
    highest_seen: u32,
    initialized: bool,
    pre_handshake: Vec<(u32, BitBuffer)>,
    reorder: HashMap<u32, BitBuffer>,
    missing: BTreeSet<u32>,
    partial: BitBuffer,
    remaining_bits: usize,
    stream: BitBuffer,
    max_nack_range: u32,
    max_reorder: usize,
}

impl ReceiveWindow {
    pub fn new(max_nack_range: u32, max_reorder: usize) -> Self {
        Self {
            expected: 0,
            highest_seen: 0,
            initialized: false,
            pre_handshake: Vec::new(),
            reorder: HashMap::new(),
            missing: BTreeSet::new(),
            partial: BitBuffer::new(),
            remaining_bits: 0,
            stream: BitBuffer::new(),
            max_nack_range: max_nack_range.max(1),
            max_reorder: max_reorder.max(1),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.missing.iter().copied()
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Feeds one datagram. `body` is positioned just after the sequence
    /// number.
    pub fn receive(&mut self, sequence: u32, body: BitBuffer) -> ReceiveOutcome {
        let mut outcome = ReceiveOutcome::default();
        self.receive_into(sequence, body, &mut outcome);
        outcome
    }

    fn receive_into(&mut self, sequence: u32, body: BitBuffer, outcome: &mut ReceiveOutcome) {
        if !self.initialized {
            if !is_handshake(&body) {
                if self.pre_handshake.len() < MAX_PRE_HANDSHAKE {
                    self.pre_handshake.push((sequence, body));
                }
                return;
            }
            self.initialized = true;
            self.expected = sequence;
            self.highest_seen = sequence.wrapping_sub(1);
            outcome.handshake = true;
            self.receive_into(sequence, body, outcome);
            for (sequence, body) in std::mem::take(&mut self.pre_handshake) {
                self.receive_into(sequence, body, outcome);
            }
            return;
        }

        if sequence == self.expected {
            self.missing.remove(&sequence);
            self.deliver(body, outcome);
            self.expected = self.expected.wrapping_add(1);
            while let Some(next) = self.reorder.remove(&self.expected) {
                self.missing.remove(&self.expected);
                self.deliver(next, outcome);
                self.expected = self.expected.wrapping_add(1);
            }
            if sequence_greater_than(sequence, self.highest_seen) {
                self.highest_seen = sequence;
            }
            self.drain_stream(outcome);
        } else if sequence_greater_than(sequence, self.expected) {
            if self.reorder.contains_key(&sequence) {
                outcome.duplicate = true;
                return;
            }
            if self.reorder.len() >= self.max_reorder {
                outcome.errors.push(ProtocolError::ReorderOverflow { sequence });
                self.mark_lost(sequence, outcome);
                return;
            }
            if !self.extend_to(sequence, false, outcome) {
                return;
            }
            self.missing.remove(&sequence);
            self.reorder.insert(sequence, body);
        } else {
            outcome.duplicate = true;
        }
    }

    fn gap_start(&self) -> u32 {
        let next = self.highest_seen.wrapping_add(1);
        if sequence_greater_than(next, self.expected) {
            next
        } else {
            self.expected
        }
    }

    /// Moves `highest_seen` up to `sequence`, marking every sequence skipped
    /// on the way as missing. Returns false when the jump is too long to
    /// track, in which case nothing changes.
    fn extend_to(&mut self, sequence: u32, inclusive: bool, outcome: &mut ReceiveOutcome) -> bool {
        if !sequence_greater_than(sequence, self.highest_seen) {
            return true;
        }
        let first = self.gap_start();
        let count = sequence
            .wrapping_sub(first)
            .wrapping_add(u32::from(inclusive));
        if count > MAX_TRACKED_GAP {
            outcome.errors.push(ProtocolError::NackRangeTooLarge { count });
            return false;
        }
        for offset in 0..count {
            if self.missing.insert(first.wrapping_add(offset)) {
                outcome.lost += 1;
            }
        }
        self.push_nacks(first, count, outcome);
        self.highest_seen = sequence;
        true
    }

    fn push_nacks(&self, first: u32, count: u32, outcome: &mut ReceiveOutcome) {
        let mut offset = 0;
        while offset < count {
            let chunk = (count - offset).min(self.max_nack_range);
            outcome.nacks.push((first.wrapping_add(offset), chunk));
            offset += chunk;
        }
    }

    fn mark_lost(&mut self, sequence: u32, outcome: &mut ReceiveOutcome) {
        if sequence_greater_than(sequence, self.highest_seen) {
            self.extend_to(sequence, true, outcome);
            return;
        }
        if self.missing.insert(sequence) {
            outcome.lost += 1;
        }
        outcome.nacks.push((sequence, 1));
    }

    /// Treats a datagram as lost on arrival and reports the NACKs to send.
    pub fn lose(&mut self, sequence: u32) -> ReceiveOutcome {
        let mut outcome = ReceiveOutcome::default();
        let ahead = sequence == self.expected || sequence_greater_than(sequence, self.expected);
        if self.initialized && ahead && !self.reorder.contains_key(&sequence) {
            self.mark_lost(sequence, &mut outcome);
        }
        outcome
    }

    /// Every missing sequence grouped into contiguous ranges.
    pub fn outstanding(&self) -> Vec<(u32, u32)> {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for &sequence in &self.missing {
            match ranges.last_mut() {
                Some((first, count))
                    if first.wrapping_add(*count) == sequence && *count < self.max_nack_range =>
                {
                    *count += 1;
                }
                _ => ranges.push((sequence, 1)),
            }
        }
        ranges
    }

    fn deliver(&mut self, body: BitBuffer, outcome: &mut ReceiveOutcome) {
        if self.remaining_bits == 0 {
            let Some(length) = body.peek_bits(LENGTH_BITS) else {
                outcome.errors.push(ProtocolError::Malformed("datagram without length"));
                return;
            };
            if length == 0 {
                return;
            }
            body.skip(LENGTH_BITS as usize);
            self.partial.clear();
            self.partial.write_bits(length, LENGTH_BITS);
            self.remaining_bits = length as usize;
        }

        let take = self.remaining_bits.min(body.remaining());
        if take == 0 {
            outcome.errors.push(ProtocolError::Truncated {
                needed: self.remaining_bits,
                available: 0,
            });
            self.partial.clear();
            self.remaining_bits = 0;
            return;
        }
        if let Some(part) = body.take(take) {
            self.partial.append(&part);
        }
        self.remaining_bits -= take;
        if self.remaining_bits == 0 {
            self.stream.append(&self.partial);
            self.partial.clear();
        }
    }

    /// Pulls every complete `[length][payload]` frame off the stream.
    fn drain_stream(&mut self, outcome: &mut ReceiveOutcome) {
        while let Some(length) = self.stream.peek_bits(LENGTH_BITS) {
            let length = length as usize;
            if self.stream.remaining() < LENGTH_BITS as usize + length {
                break;
            }
            self.stream.skip(LENGTH_BITS as usize);
            if length == 0 {
                continue;
            }
            if let Some(message) = self.stream.take(length) {
                outcome.messages.push(message);
            }
        }
        if self.stream.remaining() == 0 {
            self.stream.clear();
        }
    }
}
