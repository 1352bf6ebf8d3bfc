//! Credit window for one subscription.
//!
//! The window is owned by a single acknowledgement controller and is only
//! ever touched from the subscription's serial executor, so plain integers
//! are enough; no atomics or locks.

/// Flow-control window: how many messages may be outstanding at once.
///
/// `current_credit` is the window size negotiated with the peer (receive
/// maximum, link credit, prefetch). `consumed` tallies the units handed out by
/// [`decrement`](Self::decrement) and not yet returned by
/// [`increment`](Self::increment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditWindow {
    current_credit: u32,
    consumed: u32,
}

impl CreditWindow {
    /// Create a window of the given size with nothing consumed.
    pub fn new(initial: u32) -> Self {
        Self {
            current_credit: initial,
            consumed: 0,
        }
    }

    /// Get the window size.
    pub fn current_credit(&self) -> u32 {
        self.current_credit
    }

    /// Replace the window size.
    ///
    /// Shrinking below the number of outstanding messages is legal; sends stay
    /// blocked until enough of them are acknowledged.
    ///
    /// Returns true if the window grew.
    pub fn set_current_credit(&mut self, credit: u32) -> bool {
        let grew = credit > self.current_credit;
        self.current_credit = credit;
        grew
    }

    /// Consume one unit of credit for a message handed to the transport.
    pub fn decrement(&mut self) {
        self.consumed = self.consumed.saturating_add(1);
    }

    /// Return one unit of credit.
    pub fn increment(&mut self) {
        self.consumed = self.consumed.saturating_sub(1);
    }

    /// Units currently consumed.
    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    /// Units still available, zero when the window is over-committed.
    pub fn available(&self) -> u32 {
        self.current_credit.saturating_sub(self.consumed)
    }

    /// Forget every consumed unit without changing the window size.
    ///
    /// Returns the previous consumed count.
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.consumed)
    }
}

impl Default for CreditWindow {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_closed() {
        let window = CreditWindow::default();
        assert_eq!(window.current_credit(), 0);
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn test_decrement_and_increment() {
        let mut window = CreditWindow::new(3);
        window.decrement();
        window.decrement();
        assert_eq!(window.consumed(), 2);
        assert_eq!(window.available(), 1);

        window.increment();
        assert_eq!(window.available(), 2);
    }

    #[test]
    fn test_increment_saturates_at_zero() {
        let mut window = CreditWindow::new(2);
        window.increment();
        assert_eq!(window.consumed(), 0);
        assert_eq!(window.available(), 2);
    }

    #[test]
    fn test_shrink_below_consumed() {
        let mut window = CreditWindow::new(4);
        for _ in 0..3 {
            window.decrement();
        }
        assert!(!window.set_current_credit(1));
        assert_eq!(window.available(), 0);
        assert_eq!(window.consumed(), 3);
    }

    #[test]
    fn test_grow_reports_true() {
        let mut window = CreditWindow::new(1);
        assert!(window.set_current_credit(5));
        assert!(!window.set_current_credit(5));
    }

    #[test]
    fn test_reset() {
        let mut window = CreditWindow::new(10);
        window.decrement();
        window.decrement();
        assert_eq!(window.reset(), 2);
        assert_eq!(window.consumed(), 0);
        assert_eq!(window.current_credit(), 10);
    }
}
