//! Resume position between extraction cycles.
//!
//! A checkpoint lives for one epoch: the span between two resets during
//! which the age cutoff is held fixed. It is owned by the scheduler and
//! handed to the extractor by reference; it does no locking of its own.

use chrono::{DateTime, Utc};
use common::config::Ordering as OrderingPolicy;

use crate::record::RecordId;
use crate::source::{Comparison, Field, Filter, FilterValue};

/// Keyset position of the last record extracted in the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPosition {
    pub id: RecordId,
    /// Age field value; only tracked under [`OrderingPolicy::AgeThenIdentifier`]
    pub age: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    last_seen: Option<CursorPosition>,
    epoch_cutoff: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_none() && self.epoch_cutoff.is_none()
    }

    pub fn last_seen_key(&self) -> Option<&RecordId> {
        self.last_seen.as_ref().map(|p| &p.id)
    }

    pub fn last_seen_age(&self) -> Option<DateTime<Utc>> {
        self.last_seen.as_ref().and_then(|p| p.age)
    }

    pub fn epoch_cutoff(&self) -> Option<DateTime<Utc>> {
        self.epoch_cutoff
    }

    /// Cutoff for the current epoch, fixing it to `candidate` when the epoch
    /// has not started yet.
    pub fn begin_epoch(&mut self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        *self.epoch_cutoff.get_or_insert(candidate)
    }

    /// Move the resume position to the last record of a staged batch.
    pub fn advance(&mut self, position: CursorPosition) {
        if let Some(current) = &self.last_seen {
            debug_assert!(
                position_key(current) <= position_key(&position),
                "checkpoint moved backwards"
            );
        }
        self.last_seen = Some(position);
    }

    /// Start a new epoch: the next extraction recomputes its cutoff and
    /// scans from the beginning.
    pub fn reset(&mut self) {
        self.last_seen = None;
        self.epoch_cutoff = None;
    }

    /// Predicate selecting records after the resume position, or `None`
    /// before the first batch of an epoch.
    pub fn resume_filter(&self, policy: OrderingPolicy, age_field: &str) -> Option<Filter> {
        let position = self.last_seen.as_ref()?;
        match (policy, position.age) {
            (OrderingPolicy::AgeThenIdentifier, Some(age)) => {
                let field = Field::Named(age_field.to_string());
                Some(Filter::Any(vec![
                    Filter::compare(field.clone(), Comparison::Gt, FilterValue::Timestamp(age)),
                    Filter::All(vec![
                        Filter::compare(field, Comparison::Eq, FilterValue::Timestamp(age)),
                        Filter::id_after(position.id.clone()),
                    ]),
                ]))
            }
            _ => Some(Filter::id_after(position.id.clone())),
        }
    }
}

fn position_key(position: &CursorPosition) -> (Option<DateTime<Utc>>, &RecordId) {
    (position.age, &position.id)
}

/// Sort order matching a policy's resume predicate.
pub fn sort_fields(policy: OrderingPolicy, age_field: &str) -> Vec<Field> {
    match policy {
        OrderingPolicy::AgeThenIdentifier => {
            vec![Field::Named(age_field.to_string()), Field::Identifier]
        }
        OrderingPolicy::Identifier => vec![Field::Identifier],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_epoch_cutoff_is_fixed_until_reset() {
        let mut checkpoint = Checkpoint::new();
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        assert_eq!(checkpoint.begin_epoch(first), first);
        assert_eq!(checkpoint.begin_epoch(later), first);

        checkpoint.reset();
        assert!(checkpoint.is_empty());
        assert_eq!(checkpoint.begin_epoch(later), later);
    }

    #[test]
    fn test_resume_filter_per_policy() {
        let mut checkpoint = Checkpoint::new();
        assert!(
            checkpoint
                .resume_filter(OrderingPolicy::AgeThenIdentifier, "createdAt")
                .is_none()
        );

        let age = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        checkpoint.advance(CursorPosition {
            id: RecordId::Int(5),
            age: Some(age),
        });
        assert_eq!(checkpoint.last_seen_key(), Some(&RecordId::Int(5)));
        assert_eq!(checkpoint.last_seen_age(), Some(age));

        assert_eq!(
            checkpoint.resume_filter(OrderingPolicy::Identifier, "createdAt"),
            Some(Filter::id_after(RecordId::Int(5)))
        );
        assert!(matches!(
            checkpoint.resume_filter(OrderingPolicy::AgeThenIdentifier, "createdAt"),
            Some(Filter::Any(_))
        ));
    }

    #[test]
    fn test_sort_fields() {
        assert_eq!(
            sort_fields(OrderingPolicy::Identifier, "createdAt"),
            vec![Field::Identifier]
        );
        assert_eq!(
            sort_fields(OrderingPolicy::AgeThenIdentifier, "createdAt"),
            vec![Field::Named("createdAt".to_string()), Field::Identifier]
        );
    }
}
