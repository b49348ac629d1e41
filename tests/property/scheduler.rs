use std::collections::{BTreeMap, BTreeSet, HashSet};

use builddag::dag::UnitSpec;
use builddag::engine::{CoreCommand, CoreRuntime, IntakeSource, RuntimeEvent, RuntimeOptions};
use builddag::exec::{LaunchRequest, PipelineFailure, PipelineOutcome};
use builddag::types::UnitStatus;
use builddag_test_utils::builders::unit;
use proptest::prelude::*;

// Acyclic by construction: unit N may only depend on units 0..N-1.
fn dag_strategy(max_units: usize) -> impl Strategy<Value = Vec<UnitSpec>> {
    (1..=max_units).prop_flat_map(|count| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), count).prop_map(
            |raw_deps| {
                raw_deps
                    .into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let deps: BTreeSet<String> = picks
                            .into_iter()
                            .filter(|_| i > 0)
                            .map(|p| format!("u{}", p % i))
                            .collect();
                        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                        unit(&format!("u{i}"), &deps)
                    })
                    .collect()
            },
        )
    })
}

fn launches(commands: &[CoreCommand]) -> Vec<LaunchRequest> {
    commands
        .iter()
        .filter_map(|c| match c {
            CoreCommand::Launch(requests) => Some(requests.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

proptest! {
    #[test]
    fn launches_respect_dependencies_and_the_cap(
        units in dag_strategy(12),
        concurrency in 1usize..4,
        failing in proptest::collection::vec(0..12usize, 0..3),
        picks in proptest::collection::vec(any::<usize>(), 0..40),
    ) {
        let deps: BTreeMap<String, Vec<String>> = units
            .iter()
            .map(|u| (u.id.clone(), u.dependencies.clone()))
            .collect();
        let failing: HashSet<String> = failing.into_iter().map(|i| format!("u{i}")).collect();

        let mut core = CoreRuntime::new(RuntimeOptions {
            concurrency,
            ..RuntimeOptions::default()
        });

        let step = core.step(RuntimeEvent::UnitsArrived {
            units: units.clone(),
            source: IntakeSource::Manual,
        });

        let mut running: Vec<LaunchRequest> = Vec::new();
        let mut succeeded: BTreeSet<String> = BTreeSet::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut launched_once: HashSet<String> = HashSet::new();
        let mut pending = launches(&step.commands);
        let mut picks = picks.into_iter();

        loop {
            for request in pending.drain(..) {
                let id = request.unit.id.clone();
                for dep in &deps[&id] {
                    prop_assert!(succeeded.contains(dep), "{} launched before {} completed", id, dep);
                }
                prop_assert!(launched_once.insert(id.clone()), "{} launched twice", id);
                running.push(request);
            }
            prop_assert!(running.len() <= concurrency, "{} running with cap {}", running.len(), concurrency);

            if running.is_empty() {
                break;
            }

            let index = picks.next().unwrap_or(0) % running.len();
            let done = running.remove(index);
            let outcome = if failing.contains(&done.unit.id) {
                failed.insert(done.unit.id.clone());
                PipelineOutcome::Failed(PipelineFailure::Build { message: "boom".to_string() })
            } else {
                succeeded.insert(done.unit.id.clone());
                PipelineOutcome::Succeeded
            };

            let step = core.step(RuntimeEvent::PipelineFinished {
                unit: done.unit.id.clone(),
                execution_id: done.execution_id.clone(),
                outcome,
            });
            pending = launches(&step.commands);
        }

        // Everything not built is behind a failure.
        for (id, unit_deps) in &deps {
            let status = core.unit_status(id);
            if succeeded.contains(id) {
                prop_assert_eq!(status, Some(UnitStatus::Completed));
            } else if failed.contains(id) {
                prop_assert_eq!(status, Some(UnitStatus::Failed));
            } else {
                prop_assert!(
                    unit_deps.iter().any(|d| !succeeded.contains(d)),
                    "{} never launched although its dependencies completed", id
                );
            }
        }

        let outcome = core.outcome();
        prop_assert_eq!(
            outcome.completed.len() + outcome.failed.len() + outcome.blocked.len(),
            units.len()
        );
    }

    #[test]
    fn adjusting_concurrency_never_exceeds_the_new_cap(
        units in dag_strategy(10),
        caps in proptest::collection::vec(0usize..5, 1..6),
    ) {
        let mut core = CoreRuntime::new(RuntimeOptions {
            concurrency: 1,
            ..RuntimeOptions::default()
        });
        let step = core.step(RuntimeEvent::UnitsArrived {
            units,
            source: IntakeSource::Manual,
        });
        let mut running = launches(&step.commands).len();

        for cap in caps {
            let step = core.step(RuntimeEvent::Control(
                builddag::engine::ControlCommand::AdjustConcurrency(cap),
            ));
            running += launches(&step.commands).len();
            // Lowering the cap never stops work already running.
            prop_assert!(running <= cap.max(1) || launches(&step.commands).is_empty());
            prop_assert_eq!(core.concurrency_limit(), cap.max(1));
            prop_assert_eq!(core.active().len(), running);
        }
    }
}
