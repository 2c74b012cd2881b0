use tracing::{debug, warn};

use crate::hal::toa::lgw_time_on_air;
use crate::hal::{LgwPktTx, TxMode};

pub const JIT_QUEUE_MAX: usize = 32;            /* max number of programmed TX per RF chain */
pub const JIT_NUM_BEACON_IN_QUEUE: usize = 8;   /* beacon lookahead kept programmed */

pub const TX_START_DELAY: u32 = 1500;       /* us, modem programming lead required by the radio */
pub const TX_MARGIN_DELAY: u32 = 1000;      /* us, margin kept between programmed TX windows */
pub const TX_JIT_DELAY: u32 = 30000;        /* us, lead at which the dispatcher hands a packet to the radio */
pub const TX_MAX_ADVANCE_DELAY: u32 =
    ((JIT_NUM_BEACON_IN_QUEUE as u32) + 1) * 128_000_000; /* us, how far ahead a TX may be scheduled */

pub const BEACON_GUARD: u32 = 3_000_000;    /* us, no TX allowed before a beacon slot */
pub const BEACON_RESERVED: u32 = 2_120_000; /* us, no TX allowed after a beacon starts */

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum JitError {
    #[error("JIT_ERROR_FULL")]
    Full,
    #[error("JIT_ERROR_TOO_LATE")]
    TooLate,
    #[error("JIT_ERROR_TOO_EARLY")]
    TooEarly,
    #[error("JIT_ERROR_COLLISION_PACKET")]
    CollisionPacket,
    #[error("JIT_ERROR_COLLISION_BEACON")]
    CollisionBeacon,
    #[error("JIT_ERROR_TX_FREQ")]
    TxFreq,
    #[error("JIT_ERROR_TX_POWER")]
    TxPower,
    #[error("JIT_ERROR_GPS_UNLOCKED")]
    GpsUnlocked,
    #[error("JIT_ERROR_INVALID")]
    Invalid,
}

impl JitError {
    /* token used in the TX_ACK JSON */
    pub fn ack_token(&self) -> &'static str {
        match self {
            /* a full queue is reported as a collision, per the UDP protocol */
            JitError::Full | JitError::CollisionPacket => "COLLISION_PACKET",
            JitError::TooLate => "TOO_LATE",
            JitError::TooEarly => "TOO_EARLY",
            JitError::CollisionBeacon => "COLLISION_BEACON",
            JitError::TxFreq => "TX_FREQ",
            JitError::TxPower => "TX_POWER",
            JitError::GpsUnlocked => "GPS_UNLOCKED",
            JitError::Invalid => "UNKNOWN",
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, JitError::TxPower)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JitPktType {
    DownlinkClassA,
    DownlinkClassB,
    DownlinkClassC,
    Beacon,
}

/* wrap-safe "a happens before b" on the 32-bit microsecond counter */
pub fn less_recent(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[derive(Debug, Clone)]
struct JitNode {
    pkt: LgwPktTx,
    pkt_type: JitPktType,
    pre_delay: u32,     /* lead the radio needs before pkt.count_us (incl. beacon guard) */
    post_delay: u32,    /* time on air, or the beacon reserved slot */
}

/* two TX windows [count_us - pre, count_us + post] may not overlap */
fn collides(a: &JitNode, b: &JitNode) -> bool {
    (a.pkt.count_us.wrapping_sub(b.pkt.count_us)
        <= a.pre_delay + b.post_delay + TX_MARGIN_DELAY)
        || (b.pkt.count_us.wrapping_sub(a.pkt.count_us)
            <= b.pre_delay + a.post_delay + TX_MARGIN_DELAY)
}

/**
@struct JitQueue
@brief Ordered reservation of future transmissions for one RF chain.

Entries stay sorted by target counter under wrap-safe comparison; every
public operation is atomic from the caller's point of view (the queue sits
behind one mutex per RF chain).
*/
#[derive(Debug)]
pub struct JitQueue {
    nodes: Vec<JitNode>,
    num_beacon: usize,
}

impl Default for JitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JitQueue {
    pub fn new() -> Self {
        Self { nodes: Vec::with_capacity(JIT_QUEUE_MAX), num_beacon: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_beacon(&self) -> usize {
        self.num_beacon
    }

    /**
    @brief Reserve a TX slot for pkt.

    time_us is the current concentrator counter. The queue is left untouched
    on any rejection.
    */
    pub fn enqueue(
        &mut self,
        time_us: u32,
        pkt: &LgwPktTx,
        pkt_type: JitPktType,
    ) -> Result<(), JitError> {
        if self.nodes.len() >= JIT_QUEUE_MAX {
            warn!("WARNING: JIT queue is full");
            return Err(JitError::Full);
        }
        if pkt.size as usize > 255 {
            return Err(JitError::Invalid);
        }

        let toa = lgw_time_on_air(pkt).map_err(|_| JitError::Invalid)?;

        let mut node = JitNode {
            pkt: *pkt,
            pkt_type,
            pre_delay: TX_START_DELAY,
            post_delay: toa,
        };
        if pkt_type == JitPktType::Beacon {
            node.pre_delay += BEACON_GUARD;
            node.post_delay = BEACON_RESERVED;
        }

        match pkt.tx_mode {
            TxMode::IMMEDIATE => {
                /* no contention allowed with any scheduled frame on that chain */
                if !self.nodes.is_empty() {
                    return Err(JitError::CollisionPacket);
                }
                /* dispatch ASAP: make it due at the next dispatcher pass */
                node.pkt.count_us = time_us.wrapping_add(TX_JIT_DELAY);
            }
            TxMode::TIMESTAMPED | TxMode::ON_GPS => {
                let lead = node.pkt.count_us.wrapping_sub(time_us);
                if (lead as i32) <= (TX_START_DELAY + TX_MARGIN_DELAY + TX_JIT_DELAY) as i32 {
                    debug!(
                        "jit: too late to queue packet (lead {} us)",
                        lead as i32
                    );
                    return Err(JitError::TooLate);
                }
                if (lead as i32) > TX_MAX_ADVANCE_DELAY as i32 {
                    debug!("jit: packet too much in advance (lead {} us)", lead as i32);
                    return Err(JitError::TooEarly);
                }
            }
        }

        /* check overlap against every resident reservation */
        for other in &self.nodes {
            if collides(&node, other) {
                if other.pkt_type == JitPktType::Beacon || pkt_type == JitPktType::Beacon {
                    return Err(JitError::CollisionBeacon);
                }
                return Err(JitError::CollisionPacket);
            }
        }

        /* keep ascending target order, stable for equal targets */
        let pos = self
            .nodes
            .iter()
            .position(|other| less_recent(node.pkt.count_us, other.pkt.count_us))
            .unwrap_or(self.nodes.len());
        self.nodes.insert(pos, node);
        if pkt_type == JitPktType::Beacon {
            self.num_beacon += 1;
        }
        Ok(())
    }

    /**
    @brief Index of the earliest entry due for dispatch, if any.

    An entry whose target already passed is still returned; the dispatcher
    evicts it and records the failure.
    */
    pub fn peek(&self, time_us: u32) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        /* entries are sorted, the head is the earliest */
        let lead = self.nodes[0].pkt.count_us.wrapping_sub(time_us) as i32;
        if lead <= TX_JIT_DELAY as i32 {
            Some(0)
        } else {
            None
        }
    }

    pub fn dequeue(&mut self, index: usize) -> Result<(LgwPktTx, JitPktType), JitError> {
        if index >= self.nodes.len() {
            return Err(JitError::Invalid);
        }
        let node = self.nodes.remove(index);
        if node.pkt_type == JitPktType::Beacon {
            self.num_beacon -= 1;
        }
        Ok((node.pkt, node.pkt_type))
    }

    /* one-line content description for the statistics report */
    pub fn summary(&self) -> String {
        if self.nodes.is_empty() {
            return "queue is empty".to_string();
        }
        let entries: Vec<String> = self
            .nodes
            .iter()
            .map(|n| format!("{:?}@{}", n.pkt_type, n.pkt.count_us))
            .collect();
        format!("{} entries ({} beacon): {}", self.nodes.len(), self.num_beacon, entries.join(", "))
    }

    #[cfg(test)]
    fn targets(&self) -> Vec<u32> {
        self.nodes.iter().map(|n| n.pkt.count_us).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Modulation, BW_125KHZ, CR_LORA_4_5, DR_LORA_SF9};

    fn downlink(count_us: u32) -> LgwPktTx {
        let mut pkt = LgwPktTx::default();
        pkt.freq_hz = 868_500_000;
        pkt.tx_mode = TxMode::TIMESTAMPED;
        pkt.count_us = count_us;
        pkt.modulation = Modulation::LORA;
        pkt.bandwidth = BW_125KHZ;
        pkt.datarate = DR_LORA_SF9;
        pkt.coderate = CR_LORA_4_5;
        pkt.size = 16;
        pkt
    }

    fn beacon(count_us: u32) -> LgwPktTx {
        let mut pkt = downlink(count_us);
        pkt.tx_mode = TxMode::ON_GPS;
        pkt.no_crc = true;
        pkt.no_header = true;
        pkt.preamble = 10;
        pkt
    }

    #[test]
    fn rejects_too_late_and_too_early() {
        let mut q = JitQueue::new();
        let now = 1_000_000u32;
        assert_eq!(
            q.enqueue(now, &downlink(now + 500), JitPktType::DownlinkClassA),
            Err(JitError::TooLate)
        );
        assert_eq!(
            q.enqueue(now, &downlink(now + 32_500), JitPktType::DownlinkClassA),
            Err(JitError::TooLate)
        );
        assert_eq!(
            q.enqueue(
                now,
                &downlink(now.wrapping_add(TX_MAX_ADVANCE_DELAY + 1)),
                JitPktType::DownlinkClassA
            ),
            Err(JitError::TooEarly)
        );
        assert!(q.is_empty());
        assert!(q
            .enqueue(now, &downlink(now + 1_000_000), JitPktType::DownlinkClassA)
            .is_ok());
    }

    #[test]
    fn keeps_entries_ordered() {
        let mut q = JitQueue::new();
        let now = 0u32;
        for target in [5_000_000u32, 1_000_000, 3_000_000, 7_000_000] {
            q.enqueue(now, &downlink(target), JitPktType::DownlinkClassA).unwrap();
        }
        let targets = q.targets();
        for w in targets.windows(2) {
            assert!(less_recent(w[0], w[1]));
        }
        assert_eq!(targets[0], 1_000_000);
    }

    #[test]
    fn ordering_is_shift_invariant_across_wrap() {
        /* same schedule, once near 0 and once straddling the 2^32 wrap */
        let offsets: [u32; 4] = [200_000, 1_000_000, 2_500_000, 4_000_000];
        let base_low = 0u32;
        let base_wrap = u32::MAX - 2_000_000;

        let mut q_low = JitQueue::new();
        let mut q_wrap = JitQueue::new();
        for off in offsets {
            let r1 = q_low.enqueue(
                base_low,
                &downlink(base_low.wrapping_add(off)),
                JitPktType::DownlinkClassA,
            );
            let r2 = q_wrap.enqueue(
                base_wrap,
                &downlink(base_wrap.wrapping_add(off)),
                JitPktType::DownlinkClassA,
            );
            assert_eq!(r1, r2);
        }
        let rel_low: Vec<u32> =
            q_low.targets().iter().map(|t| t.wrapping_sub(base_low)).collect();
        let rel_wrap: Vec<u32> =
            q_wrap.targets().iter().map(|t| t.wrapping_sub(base_wrap)).collect();
        assert_eq!(rel_low, rel_wrap);
    }

    #[test]
    fn overlapping_windows_collide() {
        let mut q = JitQueue::new();
        let now = 0u32;
        let first = downlink(1_000_000);
        q.enqueue(now, &first, JitPktType::DownlinkClassA).unwrap();
        /* SF9/16B is ~165 ms on air: 50 ms later is well inside the window */
        assert_eq!(
            q.enqueue(now, &downlink(1_050_000), JitPktType::DownlinkClassA),
            Err(JitError::CollisionPacket)
        );
        /* queue unchanged on failure */
        assert_eq!(q.targets(), vec![1_000_000]);
        /* far enough apart is accepted */
        q.enqueue(now, &downlink(2_000_000), JitPktType::DownlinkClassA).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn beacon_collisions_are_reported_as_beacon() {
        let mut q = JitQueue::new();
        let now = 0u32;
        q.enqueue(now, &beacon(10_000_000), JitPktType::Beacon).unwrap();
        assert_eq!(q.num_beacon(), 1);
        /* downlink inside the beacon guard */
        assert_eq!(
            q.enqueue(now, &downlink(9_000_000), JitPktType::DownlinkClassA),
            Err(JitError::CollisionBeacon)
        );
        /* beacon refused when it would land on a queued downlink */
        q.enqueue(now, &downlink(20_000_000), JitPktType::DownlinkClassA).unwrap();
        assert_eq!(
            q.enqueue(now, &beacon(20_100_000), JitPktType::Beacon),
            Err(JitError::CollisionBeacon)
        );
    }

    #[test]
    fn immediate_only_into_empty_queue() {
        let mut q = JitQueue::new();
        let now = 5_000_000u32;
        let mut imm = downlink(0);
        imm.tx_mode = TxMode::IMMEDIATE;
        q.enqueue(now, &imm, JitPktType::DownlinkClassC).unwrap();
        /* scheduled as "dispatch ASAP": due by the next dispatcher pass */
        assert_eq!(q.peek(now + 10_000), Some(0));
        let (pkt, _) = q.dequeue(0).unwrap();
        assert_eq!(pkt.count_us, now.wrapping_add(TX_JIT_DELAY));

        q.enqueue(now, &downlink(now + 1_000_000), JitPktType::DownlinkClassA).unwrap();
        assert_eq!(
            q.enqueue(now, &imm, JitPktType::DownlinkClassC),
            Err(JitError::CollisionPacket)
        );
    }

    #[test]
    fn peek_respects_dispatch_lead() {
        let mut q = JitQueue::new();
        let now = 0u32;
        q.enqueue(now, &downlink(1_000_000), JitPktType::DownlinkClassA).unwrap();
        assert_eq!(q.peek(now), None);
        /* due exactly at target - dispatch lead, not one poll later */
        assert_eq!(q.peek(1_000_000 - TX_JIT_DELAY - 1), None);
        assert_eq!(q.peek(1_000_000 - TX_JIT_DELAY), Some(0));
        assert_eq!(q.peek(1_000_000 - TX_JIT_DELAY + 1), Some(0));
        /* an entry whose target already passed is still surfaced */
        assert_eq!(q.peek(1_500_000), Some(0));
    }

    #[test]
    fn queue_full() {
        let mut q = JitQueue::new();
        let now = 0u32;
        let mut target = 10_000_000u32;
        for _ in 0..JIT_QUEUE_MAX {
            q.enqueue(now, &downlink(target), JitPktType::DownlinkClassA).unwrap();
            target += 5_000_000;
        }
        assert_eq!(
            q.enqueue(now, &downlink(target), JitPktType::DownlinkClassA),
            Err(JitError::Full)
        );
    }

    #[test]
    fn collision_freedom_invariant() {
        /* after arbitrary enqueues/dequeues, all remaining windows are disjoint */
        let mut q = JitQueue::new();
        let now = 0u32;
        let mut target = 1_000_000u32;
        for i in 0..40u32 {
            let _ = q.enqueue(now, &downlink(target), JitPktType::DownlinkClassA);
            target = target.wrapping_add(400_000 + 137_000 * (i % 5));
            if i % 7 == 0 && !q.is_empty() {
                q.dequeue(0).unwrap();
            }
        }
        let targets = q.targets();
        for (i, a) in targets.iter().enumerate() {
            for b in targets.iter().skip(i + 1) {
                /* SF9 16-byte airtime ~165 ms, margin 1 ms, start delay 1.5 ms */
                let gap = b.wrapping_sub(*a).min(a.wrapping_sub(*b));
                assert!(gap > 165_000, "windows too close: {} vs {}", a, b);
            }
        }
    }
}
