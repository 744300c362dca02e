//! Append conditions: callbacks run after records became durable.

use parking_lot::RwLock;
use quill_core::types::Position;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a registered append condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionId(u64);

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "condition_{}", self.0)
    }
}

type Condition = Arc<dyn Fn(Position) + Send + Sync>;

/// Registered append conditions of one log stream.
///
/// Conditions run on the appender's turn with the new durable position and
/// must not block.
#[derive(Default)]
pub(crate) struct AppendConditions {
    next_id: AtomicU64,
    conditions: RwLock<Vec<(ConditionId, Condition)>>,
}

impl AppendConditions {
    pub(crate) fn register<F>(&self, condition: F) -> ConditionId
    where
        F: Fn(Position) + Send + Sync + 'static,
    {
        let id = ConditionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.conditions.write().push((id, Arc::new(condition)));
        id
    }

    /// Returns false if the id was not registered.
    pub(crate) fn remove(&self, id: ConditionId) -> bool {
        let mut conditions = self.conditions.write();
        let before = conditions.len();
        conditions.retain(|(registered, _)| *registered != id);
        conditions.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.conditions.read().len()
    }

    pub(crate) fn signal(&self, position: Position) {
        // Snapshot so a condition may register or remove conditions.
        let conditions: Vec<Condition> = self
            .conditions
            .read()
            .iter()
            .map(|(_, condition)| Arc::clone(condition))
            .collect();
        for condition in conditions {
            condition(position);
        }
    }
}

impl fmt::Debug for AppendConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendConditions")
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_reaches_every_condition() {
        let conditions = AppendConditions::default();
        let seen = Arc::new(AtomicU64::new(0));

        let first = Arc::clone(&seen);
        conditions.register(move |position| {
            first.fetch_add(position.as_u64(), Ordering::SeqCst);
        });
        let second = Arc::clone(&seen);
        conditions.register(move |position| {
            second.fetch_add(position.as_u64(), Ordering::SeqCst);
        });

        conditions.signal(Position::new(5));
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn removed_condition_is_not_signalled() {
        let conditions = AppendConditions::default();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let id = conditions.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(conditions.remove(id));
        assert!(!conditions.remove(id));
        conditions.signal(Position::new(1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(conditions.len(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let conditions = AppendConditions::default();
        let a = conditions.register(|_| {});
        let b = conditions.register(|_| {});
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "condition_0");
    }
}
