// tests/tracker_properties.rs

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use proptest::prelude::*;

use jobvisor::engine::tracker::{BuildCompletion, BuildWait, ParkedBuild};
use jobvisor::engine::{BuildKind, RunTracker};

#[derive(Debug, Clone)]
enum Op {
    Acquire(u64),
    Release(u64),
    Finish(u64),
    BeginBuild(u64),
    ParkBuild(u64, bool),
    FinishBuild(u64),
    FinishStaleBuild(u64),
    Delay(u64),
    FireDelayed(u64, bool),
    WaitForBuild(u64, u64),
    TakeBuildWaits(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4u64).prop_map(Op::Acquire),
        (0..4u64).prop_map(Op::Release),
        (0..4u64).prop_map(Op::Finish),
        (0..3u64).prop_map(Op::BeginBuild),
        ((0..3u64), any::<bool>()).prop_map(|(task, init)| Op::ParkBuild(task, init)),
        (0..3u64).prop_map(Op::FinishBuild),
        (0..3u64).prop_map(Op::FinishStaleBuild),
        (0..4u64).prop_map(Op::Delay),
        ((0..4u64), any::<bool>()).prop_map(|(job, fresh)| Op::FireDelayed(job, fresh)),
        ((0..4u64), (0..3u64)).prop_map(|(job, task)| Op::WaitForBuild(job, task)),
        (0..3u64).prop_map(Op::TakeBuildWaits),
    ]
}

fn parked(init: bool) -> ParkedBuild {
    ParkedBuild {
        kind: if init { BuildKind::Init } else { BuildKind::Build },
        code: "print('next')".to_string(),
        dest_dir: PathBuf::from("dist"),
    }
}

fn wait(task: u64, run_id: u64) -> BuildWait {
    BuildWait {
        task_id: task,
        task_name: format!("task_{task}"),
        run_id,
        task_dir: PathBuf::from(format!("content/{task}/dist")),
    }
}

proptest! {
    // Replays random operation sequences against a plain model and checks the
    // tracker agrees on every observable answer.
    #[test]
    fn tracker_matches_model(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut tracker = RunTracker::new();

        let mut live: HashSet<u64> = HashSet::new();
        // task -> (generation, kind of the parked build)
        let mut builds: HashMap<u64, (u64, Option<BuildKind>)> = HashMap::new();
        let mut delayed: HashMap<u64, u64> = HashMap::new();
        let mut waits: HashMap<u64, u64> = HashMap::new();
        let mut next_run = 100;

        for op in ops {
            match op {
                Op::Acquire(job) => {
                    prop_assert_eq!(tracker.try_acquire(job), live.insert(job));
                }
                Op::Release(job) => {
                    tracker.release(job);
                    live.remove(&job);
                }
                Op::Finish(job) => {
                    tracker.finish_run(job, next_run);
                    live.remove(&job);
                }
                Op::BeginBuild(task) => {
                    prop_assert_eq!(tracker.is_building(task), builds.contains_key(&task));
                    // The worker never starts a second build of a running task.
                    if !builds.contains_key(&task) {
                        let generation = tracker.begin_build(task);
                        if let Some((last, _)) = builds.values().max_by_key(|(g, _)| *g) {
                            prop_assert!(generation > *last);
                        }
                        builds.insert(task, (generation, None));
                    }
                }
                Op::ParkBuild(task, init) => {
                    tracker.park_build(task, parked(init));
                    if let Some((_, slot)) = builds.get_mut(&task) {
                        let kind = parked(init).kind;
                        *slot = Some(match slot {
                            Some(BuildKind::Init) => BuildKind::Init,
                            _ => kind,
                        });
                    }
                }
                Op::FinishBuild(task) => match builds.remove(&task) {
                    Some((generation, slot)) => {
                        let completion = tracker.finish_build(task, generation);
                        match slot {
                            Some(kind) => match completion {
                                BuildCompletion::Superseded(next) => {
                                    prop_assert_eq!(next.kind, kind);
                                }
                                other => prop_assert!(false, "expected parked build, got {:?}", other),
                            },
                            None => prop_assert_eq!(completion, BuildCompletion::Latest),
                        }
                        prop_assert!(!tracker.is_building(task));
                    }
                    None => prop_assert_eq!(tracker.finish_build(task, u64::MAX), BuildCompletion::Stale),
                },
                Op::FinishStaleBuild(task) => {
                    if let Some((generation, _)) = builds.get(&task) {
                        prop_assert_eq!(
                            tracker.finish_build(task, generation + 1_000),
                            BuildCompletion::Stale
                        );
                        prop_assert!(tracker.is_building(task));
                    }
                }
                Op::Delay(job) => {
                    next_run += 1;
                    let token = tracker.delay(job, next_run, PathBuf::from("dist"));
                    delayed.insert(job, token);
                }
                Op::FireDelayed(job, fresh) => {
                    match delayed.get(&job).copied() {
                        Some(token) if fresh => {
                            let taken = tracker.take_delayed(job, token);
                            prop_assert_eq!(taken.map(|d| d.token), Some(token));
                            delayed.remove(&job);
                        }
                        Some(token) => {
                            prop_assert!(tracker.take_delayed(job, token + 1_000).is_none());
                        }
                        None => prop_assert!(tracker.take_delayed(job, 0).is_none()),
                    }
                }
                Op::WaitForBuild(job, task) => {
                    next_run += 1;
                    let accepted = tracker.wait_for_build(job, wait(task, next_run));
                    prop_assert_eq!(accepted, !waits.contains_key(&job));
                    if accepted {
                        waits.insert(job, task);
                    }
                    prop_assert!(tracker.is_waiting_for_build(job));
                }
                Op::TakeBuildWaits(task) => {
                    let taken: Vec<u64> = tracker
                        .take_build_waits(task)
                        .into_iter()
                        .map(|(job, w)| {
                            assert_eq!(w.task_id, task);
                            job
                        })
                        .collect();
                    let mut expected: Vec<u64> = waits
                        .iter()
                        .filter(|(_, t)| **t == task)
                        .map(|(job, _)| *job)
                        .collect();
                    expected.sort_unstable();
                    waits.retain(|_, t| *t != task);
                    prop_assert_eq!(taken, expected);
                }
            }

            for job in 0..4u64 {
                prop_assert_eq!(tracker.is_live(job), live.contains(&job));
            }

            let view = tracker.view(0);
            let mut expected_live: Vec<u64> = live.iter().copied().collect();
            expected_live.sort_unstable();
            prop_assert_eq!(&view.live_jobs, &expected_live);
            prop_assert_eq!(view.delayed_runs.len(), delayed.len());
            prop_assert_eq!(view.build_waiting_runs.len(), waits.len());
            prop_assert!(view.delayed_runs.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}

#[test]
fn stopping_a_run_frees_its_job() {
    let mut tracker = RunTracker::new();
    assert!(tracker.try_acquire(1));
    tracker.start_executing(10, 1, jobvisor::types::TaskType::Python);
    assert!(!tracker.try_acquire(1));

    tracker.finish_run(1, 10);

    assert!(tracker.executing(10).is_none());
    assert!(tracker.try_acquire(1));
}

#[test]
fn cancelling_requires_the_matching_run() {
    let mut tracker = RunTracker::new();
    tracker.delay(1, 10, PathBuf::from("dist"));
    assert!(tracker.wait_for_build(2, wait(5, 20)));

    assert!(tracker.cancel_delayed(1, 11).is_none());
    assert!(tracker.cancel_build_wait(2, 21).is_none());
    assert_eq!(tracker.cancel_delayed(1, 10).map(|d| d.run_id), Some(10));
    assert_eq!(tracker.cancel_build_wait(2, 20).map(|w| w.task_id), Some(5));
    assert_eq!(tracker.view(0), Default::default());
}

#[test]
fn parked_init_is_not_downgraded() {
    let mut tracker = RunTracker::new();
    let generation = tracker.begin_build(3);
    tracker.park_build(3, parked(true));
    tracker.park_build(3, parked(false));

    match tracker.finish_build(3, generation) {
        BuildCompletion::Superseded(next) => assert_eq!(next.kind, BuildKind::Init),
        other => panic!("expected parked build, got {other:?}"),
    }
    assert!(!tracker.is_building(3));
}
