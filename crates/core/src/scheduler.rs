//! Time-ordered event list driving hardware subsystem updates.
//!
//! Every subsystem owns exactly one slot in a fixed-capacity arena. Slots are
//! chained into a doubly linked list sorted by wake time and bounded by two
//! sentinels: a leading one fixed at time zero and a trailing one fixed at
//! [`EVENT_DISABLED`]. Neither sentinel ever fires.
//!
//! # Rescheduling
//!
//! [`EventList::schedule`] moves a slot by walking from its current position
//! towards the target. Handlers nearly always re-arm themselves a short
//! distance away, so the walk is short in practice.
//!
//! Events sharing a wake time fire in the order they were scheduled at that
//! time: a slot moved onto an occupied time is spliced after the slots
//! already there.
//!
//! # Timestamps
//!
//! Timestamps are signed 32-bit bus cycles. Armed events must lie in
//! `0..TIMESTAMP_LIMIT`; callers keep magnitudes small by calling
//! [`EventList::rebase`] between frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bus-cycle timestamp.
pub type Timestamp = i32;

/// Wake time of a disabled event. Also the fixed time of the trailing sentinel.
pub const EVENT_DISABLED: Timestamp = 0x7FFF_FFFF;

/// Exclusive upper bound for armed wake times.
pub const TIMESTAMP_LIMIT: Timestamp = 0x4000_0000;

const FIRST: usize = 0;
const NIL: usize = usize::MAX;

/// Step-loop state, consulted whenever the cached next wake time is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Outside of any frame.
    Idle,
    /// Inside the step loop.
    Running,
    /// Leave the inner loop, do outer-loop housekeeping, then resume the frame.
    ExitRequested,
    /// Leave the step loop; the frame is complete.
    FrameDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    time: Timestamp,
    prev: usize,
    next: usize,
}

/// Receives due events.
///
/// `handle` gets the event index and the wake time it was armed for, and
/// returns the next wake time (or [`EVENT_DISABLED`]). The list is passed
/// back in so a handler can re-arm other events.
pub trait EventHandler {
    fn handle(&mut self, event: usize, timestamp: Timestamp, events: &mut EventList) -> Timestamp;
}

impl<F> EventHandler for F
where
    F: FnMut(usize, Timestamp, &mut EventList) -> Timestamp,
{
    fn handle(&mut self, event: usize, timestamp: Timestamp, events: &mut EventList) -> Timestamp {
        self(event, timestamp, events)
    }
}

/// Event wake times and list order, as captured in a snapshot.
///
/// `times` is indexed by event; `order` lists event indices in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedEvents {
    pub times: Vec<Timestamp>,
    pub order: Vec<u8>,
}

/// Reasons packed event data is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventRestoreError {
    #[error("expected {expected} events, got {times} times and {order} order entries")]
    Length {
        expected: usize,
        times: usize,
        order: usize,
    },
    #[error("event index {0} out of range")]
    OutOfRange(usize),
    #[error("event index {0} used more than once")]
    Duplicate(usize),
    #[error("event {event} wakes at {time}, before the leading sentinel")]
    BeforeFirst { event: usize, time: Timestamp },
    #[error("broken link at slot {0}")]
    Link(usize),
    #[error("wake times out of order at slot {0}")]
    Order(usize),
    #[error("sentinel misplaced")]
    Sentinel,
}

/// Arena-backed sorted event list.
#[derive(Debug, Clone)]
pub struct EventList {
    slots: Vec<Slot>,
    initially_disabled: Vec<bool>,
    next_wake: Timestamp,
    state: RunState,
}

impl EventList {
    /// Create a list of `count` events in its default arming.
    pub fn new(count: usize) -> Self {
        assert!(count <= u8::MAX as usize, "event indices must fit a byte");
        let mut list = Self {
            slots: vec![
                Slot {
                    time: 0,
                    prev: NIL,
                    next: NIL,
                };
                count + 2
            ],
            initially_disabled: vec![false; count],
            next_wake: 0,
            state: RunState::Idle,
        };
        list.reset();
        list
    }

    /// Mark `event` as disabled in the default arming and re-arm.
    pub fn with_initially_disabled(mut self, event: usize) -> Self {
        self.initially_disabled[event] = true;
        self.reset();
        self
    }

    /// Number of events, sentinels excluded.
    pub fn len(&self) -> usize {
        self.slots.len() - 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn last(&self) -> usize {
        self.slots.len() - 1
    }

    fn slot_of(&self, event: usize) -> usize {
        debug_assert!(event < self.len(), "event {} out of range", event);
        event + 1
    }

    /// Restore the default arming: enabled events at time zero in index
    /// order, followed by the initially disabled ones.
    pub fn reset(&mut self) {
        let last = self.last();
        let mut chain = Vec::with_capacity(self.slots.len());
        chain.push(FIRST);
        chain.extend((0..self.len()).filter(|&e| !self.initially_disabled[e]).map(|e| e + 1));
        chain.extend((0..self.len()).filter(|&e| self.initially_disabled[e]).map(|e| e + 1));
        chain.push(last);

        for (pos, &slot) in chain.iter().enumerate() {
            let time = if slot == FIRST {
                0
            } else if slot == last || self.initially_disabled[slot - 1] {
                EVENT_DISABLED
            } else {
                0
            };
            self.slots[slot] = Slot {
                time,
                prev: if pos == 0 { NIL } else { chain[pos - 1] },
                next: chain.get(pos + 1).copied().unwrap_or(NIL),
            };
        }
        self.refresh_next_wake();
    }

    /// Wake time of `event`.
    pub fn time(&self, event: usize) -> Timestamp {
        self.slots[self.slot_of(event)].time
    }

    pub fn is_enabled(&self, event: usize) -> bool {
        self.time(event) != EVENT_DISABLED
    }

    /// Cached wake time of the earliest event, or 0 while not running so the
    /// step loop drops into the event check at the next opportunity.
    #[inline]
    pub fn next_wake(&self) -> Timestamp {
        self.next_wake
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Enter (or re-enter) the step loop.
    pub fn begin_running(&mut self) {
        self.state = RunState::Running;
        self.refresh_next_wake();
    }

    /// Ask the step loop to come back out to its outer boundary. Ignored
    /// outside of a frame.
    pub fn request_exit(&mut self) {
        if matches!(self.state, RunState::Running | RunState::ExitRequested) {
            self.state = RunState::ExitRequested;
            self.next_wake = 0;
        }
    }

    /// End the current frame.
    pub fn request_frame_end(&mut self) {
        self.state = RunState::FrameDone;
        self.next_wake = 0;
    }

    pub fn set_idle(&mut self) {
        self.state = RunState::Idle;
        self.refresh_next_wake();
    }

    fn refresh_next_wake(&mut self) {
        self.next_wake = if self.state == RunState::Running {
            self.slots[self.slots[FIRST].next].time
        } else {
            0
        };
    }

    /// Index of the earliest event, if any.
    pub fn head(&self) -> Option<usize> {
        let head = self.slots[FIRST].next;
        (head != self.last()).then(|| head - 1)
    }

    /// Events in list order with their wake times.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Timestamp)> + '_ {
        let last = self.last();
        let mut cur = self.slots[FIRST].next;
        std::iter::from_fn(move || {
            if cur == last || cur == NIL {
                return None;
            }
            let item = (cur - 1, self.slots[cur].time);
            cur = self.slots[cur].next;
            Some(item)
        })
    }

    fn unlink(&mut self, s: usize) {
        let Slot { prev, next, .. } = self.slots[s];
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    fn link_after(&mut self, anchor: usize, s: usize) {
        let next = self.slots[anchor].next;
        self.slots[s].prev = anchor;
        self.slots[s].next = next;
        self.slots[next].prev = s;
        self.slots[anchor].next = s;
    }

    fn link_before(&mut self, anchor: usize, s: usize) {
        let prev = self.slots[anchor].prev;
        self.slots[s].prev = prev;
        self.slots[s].next = anchor;
        self.slots[prev].next = s;
        self.slots[anchor].prev = s;
    }

    /// Move `event` to wake at `next`.
    pub fn schedule(&mut self, event: usize, next: Timestamp) {
        debug_assert!(
            next == EVENT_DISABLED || (0..TIMESTAMP_LIMIT).contains(&next),
            "event {}: bad next timestamp {:#010x}",
            event,
            next
        );

        let s = self.slot_of(event);
        let cur = self.slots[s].time;

        if next < cur {
            let mut fe = s;
            loop {
                fe = self.slots[fe].prev;
                if fe == FIRST || next >= self.slots[fe].time {
                    break;
                }
            }
            self.unlink(s);
            self.link_after(fe, s);
        } else if next > cur {
            let last = self.last();
            let mut fe = s;
            loop {
                fe = self.slots[fe].next;
                if fe == last || next < self.slots[fe].time {
                    break;
                }
            }
            self.unlink(s);
            self.link_before(fe, s);
        }

        self.slots[s].time = next;
        self.refresh_next_wake();
    }

    pub fn disable(&mut self, event: usize) {
        self.schedule(event, EVENT_DISABLED);
    }

    /// Fire every event due at or before `timestamp`, earliest first.
    ///
    /// Returns whether the step loop should keep running.
    pub fn run_to<H: EventHandler + ?Sized>(&mut self, timestamp: Timestamp, handler: &mut H) -> bool {
        let last = self.last();
        loop {
            let head = self.slots[FIRST].next;
            if head == last || timestamp < self.slots[head].time {
                break;
            }

            let event = head - 1;
            let et = self.slots[head].time;
            let nt = handler.handle(event, et, self);
            debug_assert!(
                nt > et,
                "event {} rescheduled to {} from {} (timestamp {})",
                event,
                nt,
                et,
                timestamp
            );
            self.schedule(event, nt);
        }

        self.state == RunState::Running
    }

    /// Call every enabled event's handler once with `timestamp` and re-arm it
    /// with the result.
    pub fn force_update<H: EventHandler + ?Sized>(&mut self, timestamp: Timestamp, handler: &mut H) {
        for event in 0..self.len() {
            if self.is_enabled(event) {
                let nt = handler.handle(event, timestamp, self);
                self.schedule(event, nt);
            }
        }
        self.refresh_next_wake();
    }

    /// Shift every armed wake time down by `origin`.
    pub fn rebase(&mut self, origin: Timestamp) {
        let last = self.last();
        for slot in &mut self.slots[FIRST + 1..last] {
            if slot.time != EVENT_DISABLED {
                debug_assert!(slot.time >= origin, "event at {} behind rebase origin {}", slot.time, origin);
                slot.time -= origin;
            }
        }
        self.refresh_next_wake();
    }

    /// Capture wake times and list order.
    pub fn pack(&self) -> PackedEvents {
        PackedEvents {
            times: (0..self.len()).map(|e| self.time(e)).collect(),
            order: self.iter().map(|(e, _)| e as u8).collect(),
        }
    }

    /// Re-link from packed data.
    ///
    /// On any validation failure the list falls back to its default arming
    /// and the reason is returned.
    pub fn restore(&mut self, packed: &PackedEvents) -> Result<(), EventRestoreError> {
        match self.relink(packed) {
            Ok(slots) => {
                self.slots = slots;
                self.refresh_next_wake();
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// Check packed data without touching the list.
    pub fn validate(&self, packed: &PackedEvents) -> Result<(), EventRestoreError> {
        self.relink(packed).map(|_| ())
    }

    fn relink(&self, packed: &PackedEvents) -> Result<Vec<Slot>, EventRestoreError> {
        let count = self.len();
        if packed.times.len() != count || packed.order.len() != count {
            return Err(EventRestoreError::Length {
                expected: count,
                times: packed.times.len(),
                order: packed.order.len(),
            });
        }

        let last = self.last();
        let mut slots = self.slots.clone();
        let mut used = vec![false; count];
        let mut prev = FIRST;

        for (event, (&time, &eo)) in packed.times.iter().zip(&packed.order).enumerate() {
            let eo = eo as usize;
            if eo >= count {
                return Err(EventRestoreError::OutOfRange(eo));
            }
            if used[eo] {
                return Err(EventRestoreError::Duplicate(eo));
            }
            used[eo] = true;

            if time < slots[FIRST].time {
                return Err(EventRestoreError::BeforeFirst { event, time });
            }
            slots[event + 1].time = time;

            slots[prev].next = eo + 1;
            slots[eo + 1].prev = prev;
            prev = eo + 1;
        }
        slots[prev].next = last;
        slots[last].prev = prev;

        Self::verify(&slots)?;
        Ok(slots)
    }

    /// Walk the list both ways checking link symmetry, sentinel placement and
    /// time order.
    pub fn check_links(&self) -> Result<(), EventRestoreError> {
        Self::verify(&self.slots)
    }

    fn verify(slots: &[Slot]) -> Result<(), EventRestoreError> {
        let last = slots.len() - 1;
        if slots[FIRST].time != 0 || slots[last].time != EVENT_DISABLED {
            return Err(EventRestoreError::Sentinel);
        }

        for (i, slot) in slots.iter().enumerate() {
            if i == last {
                if slot.next != NIL {
                    return Err(EventRestoreError::Sentinel);
                }
            } else {
                let next = slots.get(slot.next).ok_or(EventRestoreError::Link(i))?;
                if next.prev != i {
                    return Err(EventRestoreError::Link(i));
                }
                if next.time < slot.time {
                    return Err(EventRestoreError::Order(i));
                }
            }

            if i == FIRST {
                if slot.prev != NIL {
                    return Err(EventRestoreError::Sentinel);
                }
            } else {
                let prev = slots.get(slot.prev).ok_or(EventRestoreError::Link(i))?;
                if prev.next != i {
                    return Err(EventRestoreError::Link(i));
                }
                if prev.time > slot.time {
                    return Err(EventRestoreError::Order(i));
                }
            }
        }

        // Symmetric links can still form a detached cycle; make sure the
        // forward walk reaches every slot.
        let mut seen = 1;
        let mut cur = FIRST;
        while cur != last {
            cur = slots[cur].next;
            seen += 1;
            if seen > slots.len() {
                return Err(EventRestoreError::Link(cur));
            }
        }
        if seen != slots.len() {
            return Err(EventRestoreError::Link(last));
        }

        Ok(())
    }
}
