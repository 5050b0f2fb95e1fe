//! Coarse timer wheel
//!
//! Idle-session expiry on 100 ms ticks. The common case is a re-arm on
//! every matched packet, so `start`/`update` are constant-time intrusive
//! list moves; `advance` walks the cursor up to "now" and drains every
//! slot it passes. No allocation happens on the packet path.

/// Wheel tick length in seconds.
pub const TICK_SECS: f64 = 0.1;

/// Wheel slot count. Must exceed the largest timeout in ticks.
pub const WHEEL_SLOTS: usize = 512;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Link {
    next: u32,
    prev: u32,
    slot: u32,
}

impl Link {
    const UNLINKED: Self = Self {
        next: NIL,
        prev: NIL,
        slot: NIL,
    };
}

/// Timer wheel over session indices.
///
/// A timer armed for `ticks` fires no earlier than `ticks` whole ticks and
/// no later than `ticks + 1` after arming.
pub struct TimerWheel {
    slots: Box<[u32]>,
    links: Box<[Link]>,
    mask: usize,
    cursor: usize,
    ticks_done: u64,
    epoch: f64,
}

impl TimerWheel {
    /// Create a wheel able to track `max_sessions` timers, with tick zero
    /// anchored at `now`.
    pub fn new(max_sessions: usize, now: f64) -> Self {
        Self {
            slots: vec![NIL; WHEEL_SLOTS].into_boxed_slice(),
            links: vec![Link::UNLINKED; max_sessions].into_boxed_slice(),
            mask: WHEEL_SLOTS - 1,
            cursor: 0,
            ticks_done: 0,
            epoch: now,
        }
    }

    /// Arm (or re-arm) the timer for session `index` to fire in `ticks`.
    pub fn start(&mut self, index: u32, ticks: u32) {
        self.stop(index);
        let ticks = (ticks as usize).min(WHEEL_SLOTS - 2);
        let slot = (self.cursor + ticks + 1) & self.mask;

        let head = self.slots[slot];
        self.links[index as usize] = Link {
            next: head,
            prev: NIL,
            slot: slot as u32,
        };
        if head != NIL {
            self.links[head as usize].prev = index;
        }
        self.slots[slot] = index;
    }

    /// Move an armed timer to a new deadline. Constant time.
    #[inline]
    pub fn update(&mut self, index: u32, ticks: u32) {
        self.start(index, ticks);
    }

    /// Disarm the timer for session `index`, if armed.
    pub fn stop(&mut self, index: u32) {
        let link = self.links[index as usize];
        if link.slot == NIL {
            return;
        }
        if link.prev != NIL {
            self.links[link.prev as usize].next = link.next;
        } else {
            self.slots[link.slot as usize] = link.next;
        }
        if link.next != NIL {
            self.links[link.next as usize].prev = link.prev;
        }
        self.links[index as usize] = Link::UNLINKED;
    }

    /// Advance the cursor up to `now`, collecting expired session indices.
    ///
    /// Cheap when no tick boundary was crossed. A jump farther than a full
    /// wheel revolution drains every slot exactly once.
    pub fn advance(&mut self, now: f64, expired: &mut Vec<u32>) {
        let target = ((now - self.epoch) / TICK_SECS) as u64;
        if target <= self.ticks_done {
            return;
        }
        let steps = (target - self.ticks_done).min(WHEEL_SLOTS as u64);
        for _ in 0..steps {
            self.cursor = (self.cursor + 1) & self.mask;
            let mut head = self.slots[self.cursor];
            while head != NIL {
                let next = self.links[head as usize].next;
                self.links[head as usize] = Link::UNLINKED;
                expired.push(head);
                head = next;
            }
            self.slots[self.cursor] = NIL;
        }
        self.ticks_done = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expire_at(wheel: &mut TimerWheel, now: f64) -> Vec<u32> {
        let mut out = Vec::new();
        wheel.advance(now, &mut out);
        out
    }

    #[test]
    fn test_fires_within_one_tick_after_deadline() {
        let mut wheel = TimerWheel::new(8, 0.0);
        wheel.start(3, 300);

        // Not yet at the deadline (mid-tick 300)
        assert!(expire_at(&mut wheel, 30.05).is_empty());
        // One tick past the deadline it must have fired (mid-tick 301)
        assert_eq!(expire_at(&mut wheel, 30.15), vec![3]);
    }

    #[test]
    fn test_rearm_moves_deadline() {
        let mut wheel = TimerWheel::new(8, 0.0);
        wheel.start(1, 10);
        expire_at(&mut wheel, 0.5);
        wheel.update(1, 10);

        // Original deadline passes without firing
        assert!(expire_at(&mut wheel, 1.15).is_empty());
        // New deadline (armed at tick 5) fires by tick 16
        assert_eq!(expire_at(&mut wheel, 1.65), vec![1]);
    }

    #[test]
    fn test_stop_disarms() {
        let mut wheel = TimerWheel::new(8, 0.0);
        wheel.start(2, 5);
        wheel.stop(2);
        assert!(expire_at(&mut wheel, 10.0).is_empty());
    }

    #[test]
    fn test_multiple_in_same_slot() {
        let mut wheel = TimerWheel::new(8, 0.0);
        wheel.start(0, 5);
        wheel.start(1, 5);
        wheel.start(2, 5);
        wheel.stop(1);

        let mut fired = expire_at(&mut wheel, 1.0);
        fired.sort_unstable();
        assert_eq!(fired, vec![0, 2]);
    }

    #[test]
    fn test_large_clock_jump_drains_everything() {
        let mut wheel = TimerWheel::new(8, 0.0);
        wheel.start(0, 10);
        wheel.start(1, 300);
        let mut fired = expire_at(&mut wheel, 1_000_000.0);
        fired.sort_unstable();
        assert_eq!(fired, vec![0, 1]);
        // And nothing fires twice
        assert!(expire_at(&mut wheel, 2_000_000.0).is_empty());
    }
}
