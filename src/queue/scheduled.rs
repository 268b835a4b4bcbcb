use std::collections::BTreeMap;

use crate::message::MessageReference;

/// References waiting for their delivery time, ordered by time and then by
/// arrival.
#[derive(Debug, Default)]
pub struct ScheduledReferences {
    entries: BTreeMap<(u64, u64), MessageReference>,
    next_seq: u64,
}

impl ScheduledReferences {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, reference: MessageReference) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((reference.scheduled_delivery, seq), reference);
    }

    /// Removes and returns the references due at `now`, earliest first.
    pub fn take_due(&mut self, now: u64) -> Vec<MessageReference> {
        let later = self.entries.split_off(&(now.saturating_add(1), 0));
        std::mem::replace(&mut self.entries, later).into_values().collect()
    }

    pub fn next_due(&self) -> Option<u64> {
        self.entries.keys().next().map(|&(time, _)| time)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageReference> {
        self.entries.values()
    }

    pub fn remove_where(&mut self, mut pred: impl FnMut(&MessageReference) -> bool) -> Vec<MessageReference> {
        let keys: Vec<(u64, u64)> = self
            .entries
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(k, _)| *k)
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, ServerMessage};

    fn reference(id: u64, at: u64) -> MessageReference {
        let mut message = Message::new("a", "x");
        message.id = id;
        let mut reference = MessageReference::new(ServerMessage::new(message), 1, false);
        reference.scheduled_delivery = at;
        reference
    }

    #[test]
    fn due_references_come_out_in_time_order() {
        let mut scheduled = ScheduledReferences::default();
        scheduled.add(reference(1, 300));
        scheduled.add(reference(2, 100));
        scheduled.add(reference(3, 200));
        scheduled.add(reference(4, 200));
        assert_eq!(scheduled.next_due(), Some(100));

        let due: Vec<u64> = scheduled.take_due(200).iter().map(|r| r.message_id()).collect();
        assert_eq!(due, vec![2, 3, 4]);
        assert_eq!(scheduled.len(), 1);
        assert!(scheduled.take_due(299).is_empty());
        assert_eq!(scheduled.take_due(300).len(), 1);
    }
}
