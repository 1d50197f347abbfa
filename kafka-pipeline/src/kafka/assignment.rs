//! Partition ownership as seen by one consumer instance.
//!
//! Only the broker client mutates this, in response to assignment and
//! revocation events. Each owned partition remembers the generation it was
//! assigned in; a commit handle issued under an older generation is stale.
//!
//! Pauses are held per [`PauseReason`]. A partition paused by the source for
//! backpressure and by the router for queueing fetches again only once both
//! have released it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::CommitError;
use crate::kafka::types::Partition;

/// Who holds a pause on a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseReason {
    /// The source's buffer is full
    Backpressure,
    /// The partition waits for a free worker slot
    Queued,
}

impl PauseReason {
    fn bit(self) -> u8 {
        match self {
            Self::Backpressure => 0b01,
            Self::Queued => 0b10,
        }
    }
}

#[derive(Debug, Default)]
pub struct PartitionAssignment {
    owned: DashMap<Partition, u64>,
    /// Bit set of [`PauseReason`]s holding each paused partition
    paused: DashMap<Partition, u8>,
    generation: AtomicU64,
}

impl PartitionAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `partitions` under a fresh generation and return it.
    /// Partitions already owned are re-stamped with the new generation.
    pub fn assign(&self, partitions: &[Partition]) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        for partition in partitions {
            self.owned.insert(partition.clone(), generation);
            self.paused.remove(partition);
        }
        generation
    }

    /// Drop ownership. Returns the partitions that were actually owned.
    pub fn revoke(&self, partitions: &[Partition]) -> Vec<Partition> {
        let mut revoked = Vec::with_capacity(partitions.len());
        for partition in partitions {
            if self.owned.remove(partition).is_some() {
                revoked.push(partition.clone());
            }
            self.paused.remove(partition);
        }
        revoked
    }

    pub fn revoke_all(&self) -> Vec<Partition> {
        let all = self.partitions();
        self.revoke(&all)
    }

    pub fn generation_of(&self, partition: &Partition) -> Option<u64> {
        self.owned.get(partition).map(|g| *g)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_owned(&self, partition: &Partition) -> bool {
        self.owned.contains_key(partition)
    }

    pub fn partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<_> = self.owned.iter().map(|e| e.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn len(&self) -> usize {
        self.owned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }

    /// Hold a pause on an owned partition. Returns true when the partition
    /// was fetching until now.
    pub fn pause(&self, partition: &Partition, reason: PauseReason) -> bool {
        if !self.is_owned(partition) {
            return false;
        }
        let mut holders = self.paused.entry(partition.clone()).or_insert(0);
        let was_fetching = *holders == 0;
        *holders |= reason.bit();
        was_fetching
    }

    /// Release the pause held by `reason`. Returns true when no holder is
    /// left and the partition may fetch again.
    pub fn resume(&self, partition: &Partition, reason: PauseReason) -> bool {
        match self.paused.get_mut(partition) {
            Some(mut holders) => *holders &= !reason.bit(),
            None => return false,
        }
        self.paused
            .remove_if(partition, |_, holders| *holders == 0)
            .is_some()
    }

    pub fn is_paused(&self, partition: &Partition) -> bool {
        self.paused.contains_key(partition)
    }

    pub fn is_paused_by(&self, partition: &Partition, reason: PauseReason) -> bool {
        self.paused
            .get(partition)
            .is_some_and(|holders| *holders & reason.bit() != 0)
    }

    pub fn paused(&self) -> Vec<Partition> {
        let mut paused: Vec<_> = self.paused.iter().map(|p| p.key().clone()).collect();
        paused.sort();
        paused
    }

    /// Check that a handle issued under `generation` may still commit `partition`
    pub fn validate(&self, partition: &Partition, generation: u64) -> Result<(), CommitError> {
        match self.generation_of(partition) {
            Some(current) if current == generation => Ok(()),
            current => Err(CommitError::StaleGeneration {
                partition: partition.clone(),
                handle_generation: generation,
                current_generation: current,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i32) -> Partition {
        Partition::new("events", n)
    }

    #[test]
    fn test_assign_stamps_generation() {
        let assignment = PartitionAssignment::new();
        let g1 = assignment.assign(&[p(0), p(1)]);
        assert_eq!(g1, 1);
        assert_eq!(assignment.generation_of(&p(0)), Some(1));
        assert_eq!(assignment.partitions(), vec![p(0), p(1)]);

        let g2 = assignment.assign(&[p(2)]);
        assert_eq!(g2, 2);
        // Retained partitions keep their original generation
        assert_eq!(assignment.generation_of(&p(0)), Some(1));
        assert_eq!(assignment.generation_of(&p(2)), Some(2));
    }

    #[test]
    fn test_revoke_only_reports_owned() {
        let assignment = PartitionAssignment::new();
        assignment.assign(&[p(0)]);
        let revoked = assignment.revoke(&[p(0), p(5)]);
        assert_eq!(revoked, vec![p(0)]);
        assert!(assignment.is_empty());
    }

    #[test]
    fn test_validate_detects_stale_generation() {
        let assignment = PartitionAssignment::new();
        let g1 = assignment.assign(&[p(0)]);
        assert!(assignment.validate(&p(0), g1).is_ok());

        assignment.revoke(&[p(0)]);
        let g2 = assignment.assign(&[p(0)]);
        assert_ne!(g1, g2);

        match assignment.validate(&p(0), g1) {
            Err(CommitError::StaleGeneration {
                current_generation, ..
            }) => assert_eq!(current_generation, Some(g2)),
            other => panic!("expected stale generation, got {other:?}"),
        }

        assignment.revoke(&[p(0)]);
        assert!(matches!(
            assignment.validate(&p(0), g2),
            Err(CommitError::StaleGeneration {
                current_generation: None,
                ..
            })
        ));
    }

    #[test]
    fn test_pause_requires_ownership_and_clears_on_revoke() {
        let assignment = PartitionAssignment::new();
        assert!(!assignment.pause(&p(0), PauseReason::Backpressure));
        assert!(!assignment.is_paused(&p(0)));

        assignment.assign(&[p(0)]);
        assert!(assignment.pause(&p(0), PauseReason::Backpressure));
        assert_eq!(assignment.paused(), vec![p(0)]);

        assignment.revoke(&[p(0)]);
        assert!(assignment.paused().is_empty());
    }

    #[test]
    fn test_pause_is_released_only_by_every_holder() {
        let assignment = PartitionAssignment::new();
        assignment.assign(&[p(0)]);

        assert!(assignment.pause(&p(0), PauseReason::Queued));
        // Already paused, the second holder does not pause again
        assert!(!assignment.pause(&p(0), PauseReason::Backpressure));

        assert!(!assignment.resume(&p(0), PauseReason::Backpressure));
        assert!(assignment.is_paused(&p(0)));
        assert!(assignment.is_paused_by(&p(0), PauseReason::Queued));
        assert!(!assignment.is_paused_by(&p(0), PauseReason::Backpressure));

        assert!(assignment.resume(&p(0), PauseReason::Queued));
        assert!(!assignment.is_paused(&p(0)));
        assert!(!assignment.resume(&p(0), PauseReason::Queued));
    }
}
