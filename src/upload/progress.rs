/// Turns a running byte count into a whole-number percentage that never goes down
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u64,
    sent: u64,
    percent: u8,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            sent: 0,
            percent: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Record `bytes` more sent; returns the new percentage if it went up
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.sent = self.sent.saturating_add(bytes);
        let percent = if self.total == 0 {
            100
        } else {
            (self.sent.min(self.total) * 100 / self.total) as u8
        };
        self.raise(percent)
    }

    /// Jump to 100%, e.g. once the service acknowledged the payload
    pub fn complete(&mut self) -> Option<u8> {
        self.sent = self.total;
        self.raise(100)
    }

    fn raise(&mut self, percent: u8) -> Option<u8> {
        if percent > self.percent {
            self.percent = percent;
            Some(percent)
        } else {
            None
        }
    }
}

/// Where a transport reports bytes sent
///
/// Only increases are forwarded to the listener.
pub struct ProgressSink {
    tracker: ProgressTracker,
    listener: Box<dyn FnMut(u8) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(total: u64, listener: impl FnMut(u8) + Send + Sync + 'static) -> Self {
        Self {
            tracker: ProgressTracker::new(total),
            listener: Box::new(listener),
        }
    }

    /// A sink nobody listens to
    pub fn discard(total: u64) -> Self {
        Self::new(total, |_| {})
    }

    pub fn advance(&mut self, bytes: u64) {
        if let Some(percent) = self.tracker.advance(bytes) {
            (self.listener)(percent);
        }
    }

    pub fn complete(&mut self) {
        if let Some(percent) = self.tracker.complete() {
            (self.listener)(percent);
        }
    }

    pub fn percent(&self) -> u8 {
        self.tracker.percent()
    }
}
