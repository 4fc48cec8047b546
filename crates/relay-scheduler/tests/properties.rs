use chrono::{Duration, Utc};
use proptest::prelude::*;
use relay_core::RunId;
use relay_core::job::{JobContext, TriggerKind};
use relay_core::pipeline::PipelineConfig;
use relay_scheduler::resolver::Dispatch;
use relay_scheduler::{ConflictResolver, ResourceManager, SchedulerState};
use std::collections::BTreeMap;

const CAPACITIES: [(&str, u32); 2] = [("db", 3), ("api", 2)];

#[derive(Debug, Clone)]
enum Op {
    Submit(usize),
    Cycle,
    Finish(usize),
}

fn pipeline_strategy(index: usize) -> impl Strategy<Value = PipelineConfig> {
    (
        -5i32..20,
        0u32..=3,
        0u32..=2,
        proptest::collection::vec(0usize..6, 0..2),
    )
        .prop_map(move |(priority, db, api, conflicts)| {
            let mut config = PipelineConfig::new(format!("p{index}"), priority)
                .with_resource("db", db)
                .with_resource("api", api);
            for other in conflicts {
                config = config.with_conflict(format!("p{other}"));
            }
            config
        })
}

fn pipelines_strategy() -> impl Strategy<Value = Vec<PipelineConfig>> {
    (0..6usize)
        .map(pipeline_strategy)
        .collect::<Vec<_>>()
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..6).prop_map(Op::Submit),
        Just(Op::Cycle),
        any::<usize>().prop_map(Op::Finish),
    ]
}

fn check_invariants(state: &SchedulerState, running: &[Dispatch]) -> Result<(), TestCaseError> {
    let mut held: BTreeMap<&str, u32> = BTreeMap::new();
    for dispatch in running {
        for lock in dispatch.grant.locks() {
            *held.entry(lock.resource.as_str()).or_default() += lock.quantity;
        }
    }

    for usage in state.resource_usage() {
        prop_assert!(usage.outstanding <= usage.capacity, "{usage:?}");
        prop_assert_eq!(
            usage.outstanding,
            held.get(usage.resource.as_str()).copied().unwrap_or(0)
        );
    }

    let active: Vec<&JobContext> = state.running().collect();
    prop_assert_eq!(active.len(), running.len());
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            prop_assert!(
                !a.conflicts_with(&b.pipeline, &b.spec.conflicts_with),
                "{} and {} running together",
                a.pipeline,
                b.pipeline
            );
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn test_capacity_and_conflicts_hold_under_any_schedule(
        pipelines in pipelines_strategy(),
        ops in proptest::collection::vec(op_strategy(), 1..60),
        threshold in 1u32..4,
    ) {
        let resolver = ConflictResolver::new(threshold, 10);
        let mut state = SchedulerState::new(ResourceManager::new(CAPACITIES));
        let mut running: Vec<Dispatch> = Vec::new();
        let start = Utc::now();

        for (step, op) in ops.into_iter().enumerate() {
            let now = start + Duration::milliseconds(step as i64);
            match op {
                Op::Submit(i) => {
                    state.insert(JobContext::new(&pipelines[i], None, TriggerKind::Manual, now));
                }
                Op::Cycle => {
                    running.extend(resolver.select(&mut state, now));
                }
                Op::Finish(i) => {
                    if !running.is_empty() {
                        let dispatch = running.remove(i % running.len());
                        state.remove(dispatch.job.run_id);
                    }
                }
            }
            check_invariants(&state, &running)?;
        }
    }

    #[test]
    fn test_dispatch_order_is_deterministic(
        jobs in proptest::collection::vec((-10i32..10, 0i64..5), 1..20),
        seed in any::<u64>(),
    ) {
        let resolver = ConflictResolver::default();
        let t0 = Utc::now();
        let contexts: Vec<JobContext> = jobs
            .iter()
            .enumerate()
            .map(|(i, (priority, offset))| {
                JobContext::new(
                    &PipelineConfig::new(format!("p{i}"), *priority),
                    None,
                    TriggerKind::Manual,
                    t0 + Duration::seconds(*offset),
                )
            })
            .collect();

        let ordered: Vec<RunId> = resolver.order(&contexts).into_iter().map(|j| j.run_id).collect();

        let mut shuffled: Vec<&JobContext> = contexts.iter().collect();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();
        let reordered: Vec<RunId> = resolver.order(shuffled).into_iter().map(|j| j.run_id).collect();
        prop_assert_eq!(&ordered, &reordered);

        let by_id: BTreeMap<RunId, &JobContext> = contexts.iter().map(|j| (j.run_id, j)).collect();
        for pair in ordered.windows(2) {
            let (a, b) = (by_id[&pair[0]], by_id[&pair[1]]);
            prop_assert!(
                a.priority > b.priority
                    || (a.priority == b.priority && a.submitted_at <= b.submitted_at)
            );
        }
    }
}
