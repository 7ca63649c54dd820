use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

/// A gauge that remembers the highest value it has reached.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    peak: AtomicIsize,
}

impl Counter {
    pub const fn new() -> Self {
        Counter { current: AtomicIsize::new(0), peak: AtomicIsize::new(0) }
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1)
    }

    #[inline]
    pub fn dec(&self) {
        self.add(-1)
    }

    /// Moves the gauge by `delta` and raises the peak if needed.
    pub fn add(&self, delta: isize) {
        let now = self.current.fetch_add(delta, Ordering::AcqRel) + delta;
        if delta > 0 {
            self.peak.fetch_max(now, Ordering::AcqRel);
        }
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count(), "max": self.max() })
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count(), self.max())
    }
}

#[cfg(test)]
mod tests {
    use super::Counter;

    #[test]
    fn peak_survives_decrements() {
        let c = Counter::new();
        c.add(3);
        c.dec();
        c.inc();
        c.add(-2);
        assert_eq!((c.count(), c.max()), (1, 3));
        c.add(6);
        assert_eq!(c.to_json(), serde_json::json!({ "count": 7, "max": 7 }));
        assert_eq!(format!("{:?}", c), "7/7");
    }
}
