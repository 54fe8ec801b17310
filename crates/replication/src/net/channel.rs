//! Per-channel sequencing: reliable-ordered with retransmission and
//! fragmentation, and unreliable latest-wins.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::frame::{MAX_FRAGMENT_COUNT, MAX_FRAGMENT_SIZE};
use super::tracking::{ReceiveTracker, is_acked, sequence_greater_than};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub sequence: u32,
    pub index: u16,
    pub count: u16,
    pub data: Vec<u8>,
}

/// Splits a message into fragment payloads. `None` if it needs more than
/// the fragment limit.
pub fn split_message(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    if data.is_empty() {
        return Some(vec![Vec::new()]);
    }
    let chunks: Vec<Vec<u8>> = data
        .chunks(MAX_FRAGMENT_SIZE)
        .map(<[u8]>::to_vec)
        .collect();
    (chunks.len() <= MAX_FRAGMENT_COUNT).then_some(chunks)
}

#[derive(Debug)]
struct InFlight {
    fragment: Fragment,
    last_sent: Instant,
    sends: u32,
}

/// What an ack released: how many frames, plus RTT samples from frames
/// that were sent exactly once.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub acknowledged: usize,
    pub rtt_samples_ms: Vec<f32>,
}

#[derive(Debug)]
pub struct ReliableSender {
    next_sequence: u32,
    window: usize,
    in_flight: VecDeque<InFlight>,
    backlog: VecDeque<Fragment>,
}

impl ReliableSender {
    pub fn new(window: usize) -> Self {
        Self {
            next_sequence: 1,
            window,
            in_flight: VecDeque::new(),
            backlog: VecDeque::new(),
        }
    }

    /// Queues one message. Returns false if it is too large to fragment.
    pub fn push(&mut self, data: &[u8]) -> bool {
        let Some(chunks) = split_message(data) else {
            return false;
        };
        let count = chunks.len() as u16;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            self.backlog.push_back(Fragment {
                sequence,
                index: index as u16,
                count,
                data: chunk,
            });
        }
        true
    }

    /// Fragments due for (re)transmission: expired in-flight frames first,
    /// then backlog frames while the window has room. The `bool` marks a
    /// retransmission.
    pub fn poll_transmit(&mut self, now: Instant, rto: Duration, max_rto: Duration) -> Vec<(Fragment, bool)> {
        let mut out = Vec::new();

        for entry in &mut self.in_flight {
            let backoff = rto
                .saturating_mul(1 << entry.sends.saturating_sub(1).min(5))
                .min(max_rto);
            if now.duration_since(entry.last_sent) >= backoff {
                entry.last_sent = now;
                entry.sends += 1;
                out.push((entry.fragment.clone(), true));
            }
        }

        // The window spans sequence numbers from the oldest unacked frame,
        // which is what the receiver is willing to buffer.
        while let Some(next) = self.backlog.front() {
            let base = self
                .in_flight
                .front()
                .map_or(next.sequence, |entry| entry.fragment.sequence);
            if next.sequence.wrapping_sub(base) as usize >= self.window {
                break;
            }
            let Some(fragment) = self.backlog.pop_front() else {
                break;
            };
            out.push((fragment.clone(), false));
            self.in_flight.push_back(InFlight {
                fragment,
                last_sent: now,
                sends: 1,
            });
        }

        out
    }

    pub fn on_ack(&mut self, cumulative: u32, ack: u32, ack_bitfield: u32, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        self.in_flight.retain(|entry| {
            if !is_acked(entry.fragment.sequence, cumulative, ack, ack_bitfield) {
                return true;
            }
            outcome.acknowledged += 1;
            // Karn: a retransmitted frame's ack is ambiguous.
            if entry.sends == 1 {
                let rtt = now.duration_since(entry.last_sent).as_secs_f32() * 1000.0;
                outcome.rtt_samples_ms.push(rtt);
            }
            false
        });
        outcome
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.backlog.is_empty()
    }
}

#[derive(Debug)]
struct Reassembly {
    count: u16,
    next_index: u16,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u32,
    window: u32,
    buffered: HashMap<u32, Fragment>,
    reassembly: Option<Reassembly>,
    tracker: ReceiveTracker,
    ack_pending: bool,
}

impl ReliableReceiver {
    /// `window` matches the sender's: nothing further ahead of the next
    /// expected sequence is buffered.
    pub fn new(window: usize) -> Self {
        Self {
            next_expected: 1,
            window: u32::try_from(window).unwrap_or(u32::MAX).max(1),
            buffered: HashMap::new(),
            reassembly: None,
            tracker: ReceiveTracker::new(),
            ack_pending: false,
        }
    }

    /// Accepts one fragment and returns every message that became
    /// deliverable in order.
    pub fn receive(&mut self, fragment: Fragment) -> Vec<Vec<u8>> {
        let sequence = fragment.sequence;
        let ahead = sequence.wrapping_sub(self.next_expected);
        if ahead >= self.window {
            if sequence_greater_than(sequence, self.next_expected) {
                log::debug!("Dropping fragment {} beyond the receive window", sequence);
            } else {
                // Already delivered; the ack for it was probably lost.
                self.ack_pending = true;
            }
            return Vec::new();
        }

        self.ack_pending = true;
        self.tracker.record_received(sequence);
        self.buffered.entry(sequence).or_insert(fragment);

        let mut delivered = Vec::new();
        while let Some(next) = self.buffered.remove(&self.next_expected) {
            self.next_expected = self.next_expected.wrapping_add(1);
            if let Some(message) = self.reassemble(next) {
                delivered.push(message);
            }
        }
        delivered
    }

    fn reassemble(&mut self, fragment: Fragment) -> Option<Vec<u8>> {
        if fragment.count <= 1 {
            if self.reassembly.take().is_some() {
                log::warn!("Discarding incomplete fragmented message");
            }
            return Some(fragment.data);
        }

        if fragment.index == 0 {
            if self.reassembly.is_some() {
                log::warn!("Discarding incomplete fragmented message");
            }
            self.reassembly = Some(Reassembly {
                count: fragment.count,
                next_index: 1,
                data: fragment.data,
            });
            return None;
        }

        let Some(partial) = self.reassembly.as_mut() else {
            log::warn!(
                "Fragment {}/{} arrived without a message start",
                fragment.index,
                fragment.count
            );
            return None;
        };
        if partial.count != fragment.count || partial.next_index != fragment.index {
            log::warn!("Fragment sequence mismatch, dropping message");
            self.reassembly = None;
            return None;
        }

        partial.data.extend_from_slice(&fragment.data);
        partial.next_index += 1;
        if partial.next_index == partial.count {
            return self.reassembly.take().map(|done| done.data);
        }
        None
    }

    /// `(cumulative, ack, ack_bitfield)` if an ack is owed since the last call.
    pub fn take_ack(&mut self) -> Option<(u32, u32, u32)> {
        if !self.ack_pending {
            return None;
        }
        self.ack_pending = false;
        let (ack, bitfield) = self.tracker.ack_data();
        Some((self.next_expected.wrapping_sub(1), ack, bitfield))
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }
}

/// Unreliable sequenced stream state for one channel.
#[derive(Debug, Default)]
pub struct UnreliableChannel {
    next_sequence: u32,
    latest_received: Option<u32>,
}

impl UnreliableChannel {
    pub fn next_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    /// True if `sequence` is newer than anything delivered so far.
    pub fn accept(&mut self, sequence: u32) -> bool {
        match self.latest_received {
            Some(latest) if !sequence_greater_than(sequence, latest) => false,
            _ => {
                self.latest_received = Some(sequence);
                true
            }
        }
    }
}
