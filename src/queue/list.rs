use std::collections::VecDeque;

use crate::message::MAX_PRIORITY;

pub const LEVELS: usize = MAX_PRIORITY as usize + 1;

/// FIFO lists, one per priority level, iterated highest priority first.
#[derive(Debug)]
pub struct PriorityList<T> {
    levels: [VecDeque<T>; LEVELS],
    len: usize,
}

impl<T> Default for PriorityList<T> {
    fn default() -> Self {
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
            len: 0,
        }
    }
}

fn level(priority: u8) -> usize {
    usize::from(priority.min(MAX_PRIORITY))
}

impl<T> PriorityList<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn add_last(&mut self, item: T, priority: u8) {
        self.levels[level(priority)].push_back(item);
        self.len += 1;
    }

    pub fn add_first(&mut self, item: T, priority: u8) {
        self.levels[level(priority)].push_front(item);
        self.len += 1;
    }

    pub fn poll_first(&mut self) -> Option<T> {
        let item = self.levels.iter_mut().rev().find_map(VecDeque::pop_front)?;
        self.len -= 1;
        Some(item)
    }

    pub fn peek_first(&self) -> Option<&T> {
        self.levels.iter().rev().find_map(VecDeque::front)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.levels.iter().rev().flat_map(VecDeque::iter)
    }

    /// Removes every item matching `pred`, keeping the order of the rest.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        for level in self.levels.iter_mut().rev() {
            let mut kept = VecDeque::with_capacity(level.len());
            for item in level.drain(..) {
                if pred(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *level = kept;
        }
        self.len -= removed.len();
        removed
    }

    /// Walks the items highest priority first. `visit` decides per item
    /// whether to keep it, take it out, or stop the walk.
    pub fn scan(&mut self, mut visit: impl FnMut(&T) -> Scan) -> Vec<T> {
        let mut taken = Vec::new();
        'levels: for level in self.levels.iter_mut().rev() {
            let mut i = 0;
            while i < level.len() {
                match visit(&level[i]) {
                    Scan::Keep => i += 1,
                    Scan::Take => {
                        if let Some(item) = level.remove(i) {
                            taken.push(item);
                        }
                    }
                    Scan::Stop => break 'levels,
                }
            }
        }
        self.len -= taken.len();
        taken
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Keep,
    Take,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_first_fifo_within_level() {
        let mut list = PriorityList::default();
        list.add_last("a4", 4);
        list.add_last("b9", 9);
        list.add_last("c4", 4);
        list.add_first("d4", 4);
        list.add_last("e0", 0);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec!["b9", "d4", "a4", "c4", "e0"]);
        assert_eq!(list.poll_first(), Some("b9"));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn scan_takes_and_stops() {
        let mut list = PriorityList::default();
        for i in 0..6u8 {
            list.add_last(i, i % 2);
        }
        let mut seen = 0;
        let taken = list.scan(|item| {
            seen += 1;
            match (*item, seen) {
                (_, 3) => Scan::Stop,
                (x, _) if x % 2 == 1 => Scan::Take,
                _ => Scan::Keep,
            }
        });
        assert_eq!(taken, vec![1, 3]);
        assert_eq!(list.len(), 4);
        assert_eq!(list.remove_where(|x| *x == 0), vec![0]);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![5, 2, 4]);
    }
}
