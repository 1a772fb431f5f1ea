use std::collections::VecDeque;

use crate::protocol::Message;

/// Bounded FIFO of recent chat messages, oldest first
#[derive(Debug, Clone)]
pub struct MessageHistory {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl MessageHistory {
    /// Create an empty history; a zero capacity is bumped to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message, evicting the oldest one when full
    pub fn push(&mut self, message: Message) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Replace the whole buffer, keeping only the newest `capacity` entries
    pub fn replace(&mut self, messages: Vec<Message>) {
        let skip = messages.len().saturating_sub(self.capacity);
        self.messages = messages.into_iter().skip(skip).collect();
    }

    /// Copy of the newest `limit` messages (all when `None`), newest last
    pub fn recent(&self, limit: Option<usize>) -> Vec<Message> {
        let take = limit.unwrap_or(self.messages.len()).min(self.messages.len());
        self.messages
            .iter()
            .skip(self.messages.len() - take)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<Message> {
        self.messages.back().cloned()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: usize) -> Message {
        Message {
            id: id.to_string(),
            message: format!("message {}", id),
            ..Default::default()
        }
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn test_fills_up_to_capacity() {
        for n in 0..=5 {
            let mut history = MessageHistory::new(5);
            for i in 0..n {
                history.push(message(i));
            }
            assert_eq!(history.len(), n);
        }
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut history = MessageHistory::new(0);
        assert_eq!(history.capacity(), 1);
        history.push(message(1));
        history.push(message(2));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut history = MessageHistory::new(3);
        for i in 0..3 {
            history.push(message(i));
        }
        history.push(message(3));

        assert_eq!(history.len(), 3);
        assert_eq!(ids(&history.recent(None)), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_replace_keeps_newest_in_order() {
        let mut history = MessageHistory::new(3);
        history.push(message(99));
        history.replace((0..7).map(message).collect());

        assert_eq!(ids(&history.recent(None)), vec!["4", "5", "6"]);
    }

    #[test]
    fn test_recent_and_latest() {
        let mut history = MessageHistory::new(10);
        assert!(history.latest().is_none());
        for i in 0..4 {
            history.push(message(i));
        }

        assert_eq!(ids(&history.recent(Some(2))), vec!["2", "3"]);
        assert_eq!(ids(&history.recent(Some(50))).len(), 4);
        assert_eq!(history.latest().unwrap().id, "3");

        // Callers get copies
        let mut copy = history.recent(None);
        copy.clear();
        assert_eq!(history.len(), 4);
    }
}
