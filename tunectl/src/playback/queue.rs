//! Ordered track queue with a current index

/// Track identifiers plus the index of the current entry
///
/// The index always points inside the queue when the queue is non-empty;
/// moves that would leave the queue are refused and reported to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    tracks: Vec<String>,
    index: usize,
}

impl Queue {
    pub fn new(tracks: Vec<String>) -> Self {
        Self { tracks, index: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tracks(&self) -> &[String] {
        &self.tracks
    }

    pub fn current(&self) -> Option<&str> {
        self.tracks.get(self.index).map(String::as_str)
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.tracks.len()
    }

    /// Move to the next entry; `false` when already at the last one
    pub fn advance(&mut self) -> bool {
        if self.is_last() {
            return false;
        }
        self.index += 1;
        true
    }

    /// Move to the previous entry; `false` when already at the first one
    pub fn retreat(&mut self) -> bool {
        if self.index == 0 {
            return false;
        }
        self.index -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Queue {
        Queue::new(vec!["A".into(), "B".into(), "C".into()])
    }

    #[test]
    fn test_advance_stops_at_last_entry() {
        let mut queue = abc();
        assert!(queue.advance());
        assert!(queue.advance());
        assert!(!queue.advance());
        assert_eq!(queue.current(), Some("C"));
    }

    #[test]
    fn test_retreat_stops_at_first_entry() {
        let mut queue = abc();
        assert!(!queue.retreat());
        assert_eq!(queue.index(), 0);
        queue.advance();
        assert!(queue.retreat());
        assert_eq!(queue.current(), Some("A"));
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = Queue::default();
        assert!(queue.is_empty());
        assert!(queue.current().is_none());
        assert!(!queue.advance());
        assert!(!queue.retreat());
    }
}
