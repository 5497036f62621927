//! Three ordered tiers shared by the request scheduler and the work queue.
//!
//! Tiers are strictly ordered: nothing in `Normal` is handed out while
//! `High` has items, and likewise for `Low`. A steady stream of high
//! priority work therefore starves the lower tiers; callers that need
//! fairness must pace their high-priority submissions.

use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Normal,
  Low,
}

impl Priority {
  /// Service order.
  pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Priority::High => write!(f, "high"),
      Priority::Normal => write!(f, "normal"),
      Priority::Low => write!(f, "low"),
    }
  }
}

/// FIFO queue per priority tier.
#[derive(Debug)]
pub struct PriorityQueues<T> {
  high: VecDeque<T>,
  normal: VecDeque<T>,
  low: VecDeque<T>,
}

impl<T> Default for PriorityQueues<T> {
  fn default() -> Self {
    Self {
      high: VecDeque::new(),
      normal: VecDeque::new(),
      low: VecDeque::new(),
    }
  }
}

impl<T> PriorityQueues<T> {
  pub fn new() -> Self {
    Self::default()
  }

  fn tier(&self, priority: Priority) -> &VecDeque<T> {
    match priority {
      Priority::High => &self.high,
      Priority::Normal => &self.normal,
      Priority::Low => &self.low,
    }
  }

  fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<T> {
    match priority {
      Priority::High => &mut self.high,
      Priority::Normal => &mut self.normal,
      Priority::Low => &mut self.low,
    }
  }

  /// Append to the tail of the item's tier.
  pub fn push(&mut self, priority: Priority, item: T) {
    self.tier_mut(priority).push_back(item);
  }

  /// Take the head of the highest non-empty tier.
  pub fn pop(&mut self) -> Option<(Priority, T)> {
    Priority::ALL
      .into_iter()
      .find_map(|priority| self.tier_mut(priority).pop_front().map(|item| (priority, item)))
  }

  pub fn peek(&self) -> Option<(Priority, &T)> {
    Priority::ALL
      .into_iter()
      .find_map(|priority| self.tier(priority).front().map(|item| (priority, item)))
  }

  pub fn len(&self) -> usize {
    self.high.len() + self.normal.len() + self.low.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn len_of(&self, priority: Priority) -> usize {
    self.tier(priority).len()
  }

  /// Remove the items matching `remove`, returning them in service order.
  pub fn extract_if<F>(&mut self, mut remove: F) -> Vec<T>
  where
    F: FnMut(&T) -> bool,
  {
    let mut removed = Vec::new();
    for priority in Priority::ALL {
      let tier = self.tier_mut(priority);
      let mut kept = VecDeque::with_capacity(tier.len());
      for item in tier.drain(..) {
        if remove(&item) {
          removed.push(item);
        } else {
          kept.push_back(item);
        }
      }
      *tier = kept;
    }
    removed
  }

  /// Empty every tier, returning the items in service order.
  pub fn drain_all(&mut self) -> Vec<T> {
    self.extract_if(|_| true)
  }
}
