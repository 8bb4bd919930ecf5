//! Version stamp issuance

use manifold_core::VersionStamp;
use std::cell::RefCell;
use std::rc::Rc;

/// Issues strictly increasing version stamps for one node.
///
/// Stamps are `(counter, node_tag)`; observing a remote stamp pulls the
/// counter forward so every later local stamp orders after it.
#[derive(Debug, Clone)]
pub struct StampClock {
    node_tag: u64,
    counter: u64,
    last: VersionStamp,
}

impl StampClock {
    pub fn new(node_tag: u64) -> Self {
        Self {
            node_tag,
            counter: 0,
            last: VersionStamp::ZERO,
        }
    }

    pub fn node_tag(&self) -> u64 {
        self.node_tag
    }

    /// Newest stamp issued or observed.
    pub fn last(&self) -> VersionStamp {
        self.last
    }

    pub fn next(&mut self) -> VersionStamp {
        self.counter += 1;
        let stamp = VersionStamp::from_parts(self.counter, self.node_tag);
        self.last = self.last.max(stamp);
        stamp
    }

    pub fn observe(&mut self, stamp: VersionStamp) {
        if stamp.counter() > self.counter {
            self.counter = stamp.counter();
        }
        self.last = self.last.max(stamp);
    }
}

/// Clock shared by everything on one reactor thread.
pub type SharedClock = Rc<RefCell<StampClock>>;

pub fn create_clock(node_tag: u64) -> SharedClock {
    Rc::new(RefCell::new(StampClock::new(node_tag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamps_strictly_increase() {
        let mut clock = StampClock::new(7);
        let mut previous = VersionStamp::ZERO;
        for _ in 0..100 {
            let stamp = clock.next();
            assert!(stamp > previous);
            assert_eq!(stamp.node_tag(), 7);
            previous = stamp;
        }
    }

    #[test]
    fn test_observe_remote() {
        let mut clock = StampClock::new(1);
        clock.next();
        let remote = VersionStamp::from_parts(50, 9);
        clock.observe(remote);
        assert_eq!(clock.last(), remote);
        let next = clock.next();
        assert!(next > remote);
        assert_eq!(next.counter(), 51);

        // observing an older stamp never moves the clock backwards
        clock.observe(VersionStamp::from_parts(3, 2));
        assert!(clock.next() > next);
    }
}
