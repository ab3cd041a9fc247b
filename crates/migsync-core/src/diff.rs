//! Desired-vs-actual diffing and execution ordering.
//!
//! Pure computation: partitions every service's migrations into rollback,
//! apply, and already-satisfied sets, merges the partitions across
//! services by migration name, and fixes the execution order on which the
//! apply/rollback protocol depends.

use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::{DesiredState, ServiceDesired};
use crate::handler::AppliedMigrations;

/// One migration scheduled for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMigration {
    /// Migration name (`module:file`).
    pub name: String,
    /// Store-point time: minimum creation time across services.
    pub time: i64,
    /// Step→service assignments, ordered for execution (ascending for
    /// apply, descending for rollback).
    pub steps: Vec<(u32, String)>,
    /// Services receiving the finalize dispatch: reporters for rollback,
    /// distinct step owners for apply.
    pub services: Vec<String>,
}

/// The ordered outcome of one diff.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Migrations to undo, most recent first.
    pub rollback: Vec<PlannedMigration>,
    /// Migrations to apply, oldest first.
    pub apply: Vec<PlannedMigration>,
    /// Migrations present and desired, or assumed applied via the
    /// permanent watermark.
    pub satisfied: Vec<String>,
}

#[derive(Debug, Default)]
struct Accumulator {
    time: Option<i64>,
    steps: BTreeMap<u32, String>,
    reporters: BTreeSet<String>,
}

impl Accumulator {
    fn merge_time(&mut self, created: i64) {
        self.time = Some(self.time.map_or(created, |t| t.min(created)));
    }
}

impl SyncPlan {
    /// Diff desired state against the listings actually returned.
    ///
    /// Services that failed their list query are simply absent from
    /// `actual` and contribute nothing. A desired migration at or below a
    /// service's effective watermark (the max of the reported and
    /// definition-derived baselines) is reclassified as satisfied rather
    /// than applied.
    pub fn compute(desired: &DesiredState, actual: &BTreeMap<String, AppliedMigrations>) -> Self {
        let empty = ServiceDesired::default();
        let mut rollback_acc: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut apply_acc: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut satisfied = BTreeSet::new();

        for (service, listing) in actual {
            let wanted = desired.services.get(service).unwrap_or(&empty);
            let watermark = match (listing.watermark, wanted.watermark) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };

            for (name, entry) in &listing.entries {
                if wanted.entries.contains_key(name) {
                    satisfied.insert(name.clone());
                    continue;
                }
                let acc = rollback_acc.entry(name.clone()).or_default();
                acc.merge_time(entry.created);
                acc.reporters.insert(service.clone());
                for step in &entry.steps {
                    acc.steps.insert(*step, service.clone());
                }
            }

            for (name, entry) in &wanted.entries {
                if listing.entries.contains_key(name) {
                    continue;
                }
                if watermark.is_some_and(|w| entry.created <= w) {
                    satisfied.insert(name.clone());
                    continue;
                }
                let acc = apply_acc.entry(name.clone()).or_default();
                acc.merge_time(entry.created);
                for step in &entry.steps {
                    acc.steps.insert(*step, service.clone());
                }
            }
        }

        let mut rollback: Vec<PlannedMigration> = rollback_acc
            .into_iter()
            .map(|(name, acc)| PlannedMigration {
                name,
                time: acc.time.unwrap_or_default(),
                steps: acc.steps.into_iter().rev().collect(),
                services: acc.reporters.into_iter().collect(),
            })
            .collect();
        rollback.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.name.cmp(&a.name)));

        let mut apply: Vec<PlannedMigration> = apply_acc
            .into_iter()
            .map(|(name, acc)| {
                let services: BTreeSet<String> = acc.steps.values().cloned().collect();
                PlannedMigration {
                    name,
                    time: acc.time.unwrap_or_default(),
                    steps: acc.steps.into_iter().collect(),
                    services: services.into_iter().collect(),
                }
            })
            .collect();
        apply.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.name.cmp(&b.name)));

        tracing::debug!(
            rollback = rollback.len(),
            apply = apply.len(),
            satisfied = satisfied.len(),
            "diff computed"
        );

        Self {
            rollback,
            apply,
            satisfied: satisfied.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DesiredEntry;
    use crate::handler::AppliedEntry;

    fn desired_entry(created: i64, steps: &[u32]) -> DesiredEntry {
        DesiredEntry {
            created,
            steps: steps.iter().copied().collect(),
        }
    }

    fn applied_entry(created: i64, steps: &[u32]) -> AppliedEntry {
        AppliedEntry {
            created,
            steps: steps.iter().copied().collect(),
        }
    }

    fn one_service(
        service: &str,
        entries: Vec<(&str, DesiredEntry)>,
        watermark: Option<i64>,
    ) -> DesiredState {
        let mut state = DesiredState::default();
        let svc = state.services.entry(service.to_string()).or_default();
        for (name, entry) in entries {
            svc.entries.insert(name.to_string(), entry);
        }
        svc.watermark = watermark;
        state.total = 1;
        state
    }

    fn listing(entries: Vec<(&str, AppliedEntry)>, watermark: Option<i64>) -> AppliedMigrations {
        AppliedMigrations {
            entries: entries
                .into_iter()
                .map(|(n, e)| (n.to_string(), e))
                .collect(),
            watermark,
        }
    }

    #[test]
    fn test_partitions_without_filters() {
        // apply = desired - actual; rollback = actual - desired.
        let desired = one_service(
            "db",
            vec![
                ("app:keep", desired_entry(100, &[1])),
                ("app:new", desired_entry(200, &[1, 2])),
            ],
            None,
        );
        let actual = [(
            "db".to_string(),
            listing(
                vec![
                    ("app:keep", applied_entry(100, &[1])),
                    ("app:old", applied_entry(50, &[1])),
                ],
                None,
            ),
        )]
        .into();

        let plan = SyncPlan::compute(&desired, &actual);
        assert_eq!(plan.apply.len(), 1);
        assert_eq!(plan.apply[0].name, "app:new");
        assert_eq!(plan.rollback.len(), 1);
        assert_eq!(plan.rollback[0].name, "app:old");
        assert_eq!(plan.satisfied, vec!["app:keep".to_string()]);
    }

    #[test]
    fn test_watermark_reclassifies_apply() {
        let desired = one_service(
            "db",
            vec![
                ("app:ancient", desired_entry(100, &[1])),
                ("app:fresh", desired_entry(500, &[1])),
            ],
            None,
        );
        let actual = [("db".to_string(), listing(vec![], Some(300)))].into();

        let plan = SyncPlan::compute(&desired, &actual);
        assert_eq!(plan.apply.len(), 1);
        assert_eq!(plan.apply[0].name, "app:fresh");
        assert_eq!(plan.satisfied, vec!["app:ancient".to_string()]);
    }

    #[test]
    fn test_effective_watermark_is_max_of_both() {
        let desired = one_service("db", vec![("app:x", desired_entry(250, &[1]))], Some(300));
        let actual = [("db".to_string(), listing(vec![], Some(100)))].into();

        let plan = SyncPlan::compute(&desired, &actual);
        assert!(plan.apply.is_empty());
        assert_eq!(plan.satisfied, vec!["app:x".to_string()]);
    }

    #[test]
    fn test_watermark_does_not_shield_rollback() {
        // A recorded migration that is no longer desired rolls back even
        // below the watermark: there is durable data to reverse.
        let desired = one_service("db", vec![], Some(1_000));
        let actual = [(
            "db".to_string(),
            listing(vec![("app:gone", applied_entry(100, &[1]))], Some(1_000)),
        )]
        .into();

        let plan = SyncPlan::compute(&desired, &actual);
        assert_eq!(plan.rollback.len(), 1);
        assert_eq!(plan.rollback[0].name, "app:gone");
    }

    #[test]
    fn test_rollback_ordering_is_time_descending_steps_descending() {
        let desired = one_service("db", vec![], None);
        let actual = [(
            "db".to_string(),
            listing(
                vec![
                    ("app:older", applied_entry(100, &[1, 3])),
                    ("app:newer", applied_entry(200, &[1, 2])),
                ],
                None,
            ),
        )]
        .into();

        let plan = SyncPlan::compute(&desired, &actual);
        let names: Vec<_> = plan.rollback.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["app:newer", "app:older"]);
        let steps: Vec<u32> = plan.rollback[0].steps.iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![2, 1]);
    }

    #[test]
    fn test_apply_ordering_is_time_ascending_steps_ascending() {
        let desired = one_service(
            "db",
            vec![
                ("app:b", desired_entry(200, &[2, 1])),
                ("app:a", desired_entry(100, &[3, 1])),
            ],
            None,
        );
        let actual = [("db".to_string(), listing(vec![], None))].into();

        let plan = SyncPlan::compute(&desired, &actual);
        let names: Vec<_> = plan.apply.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["app:a", "app:b"]);
        let steps: Vec<u32> = plan.apply[0].steps.iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![1, 3]);
    }

    #[test]
    fn test_merge_across_services_takes_min_time() {
        let mut desired = DesiredState::default();
        desired
            .services
            .entry("db".to_string())
            .or_default()
            .entries
            .insert("app:x".to_string(), desired_entry(200, &[1]));
        desired
            .services
            .entry("files".to_string())
            .or_default()
            .entries
            .insert("app:x".to_string(), desired_entry(150, &[2]));

        let actual = [
            ("db".to_string(), listing(vec![], None)),
            ("files".to_string(), listing(vec![], None)),
        ]
        .into();

        let plan = SyncPlan::compute(&desired, &actual);
        assert_eq!(plan.apply.len(), 1);
        assert_eq!(plan.apply[0].time, 150);
        assert_eq!(
            plan.apply[0].steps,
            vec![(1, "db".to_string()), (2, "files".to_string())]
        );
        assert_eq!(plan.apply[0].services, vec!["db", "files"]);
    }

    #[test]
    fn test_finalize_only_entry_has_no_steps() {
        let desired = one_service("files", vec![("app:x", desired_entry(100, &[]))], None);
        let actual = [("files".to_string(), listing(vec![], None))].into();

        let plan = SyncPlan::compute(&desired, &actual);
        assert_eq!(plan.apply.len(), 1);
        assert!(plan.apply[0].steps.is_empty());
        assert!(plan.apply[0].services.is_empty());
    }

    #[test]
    fn test_unlisted_service_contributes_nothing() {
        let desired = one_service("db", vec![("app:x", desired_entry(100, &[1]))], None);
        let actual = BTreeMap::new();

        let plan = SyncPlan::compute(&desired, &actual);
        assert!(plan.apply.is_empty());
        assert!(plan.rollback.is_empty());
    }
}
