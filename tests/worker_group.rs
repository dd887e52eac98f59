mod common;

use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use orchestra_backend::{BackendError, WorkerGroup};
use tokio_test::assert_ok;

use common::{Script, ScriptedTrainer, connect, cpu_cluster, group_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_timeout_leaves_no_orphans() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script {
        hang_on_start: Some(2),
        ..Default::default()
    };
    let live = Arc::clone(&script.live);

    let mut config = group_config(2, 2);
    config.coordination_timeout = Duration::from_secs(1);

    let started = Instant::now();
    let err = WorkerGroup::<ScriptedTrainer>::start(context.tasks().unwrap(), config, script)
        .await
        .err()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(
        err,
        BackendError::WorkerGroupStartTimeout {
            ready: 3,
            expected: 4,
            ..
        }
    ));
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_failure_tears_down_started_workers() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script {
        fail_start_on: Some(1),
        ..Default::default()
    };
    let live = Arc::clone(&script.live);

    let tasks = context.tasks().unwrap();
    let err = WorkerGroup::<ScriptedTrainer>::start(tasks, group_config(3, 1), script)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, BackendError::WorkerExecution { rank: 1, .. }));
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn results_follow_rank_order() {
    let context = connect(&cpu_cluster(1, 4));
    let mut group = WorkerGroup::<ScriptedTrainer>::start(
        context.tasks().unwrap(),
        group_config(2, 3),
        Script::default(),
    )
    .await
    .unwrap();

    let placements = group
        .execute(|trainer| Ok((trainer.ctx.rank, trainer.ctx.host, trainer.ctx.local_rank)))
        .await
        .unwrap();

    assert_eq!(
        placements,
        [(0, 0, 0), (1, 0, 1), (2, 1, 0), (3, 1, 1), (4, 2, 0), (5, 2, 1)]
    );
    assert_eq!(group.execute_single(|trainer| Ok(trainer.ctx.rank)).await.unwrap(), 0);

    group.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failing_worker_fails_the_whole_call() {
    let context = connect(&cpu_cluster(1, 4));
    let mut group = WorkerGroup::<ScriptedTrainer>::start(
        context.tasks().unwrap(),
        group_config(4, 1),
        Script::default(),
    )
    .await
    .unwrap();

    let err = group
        .execute(|trainer| match trainer.ctx.rank {
            2 => Err(BackendError::InvalidConfig("bad batch".into())),
            rank => Ok(rank),
        })
        .await
        .unwrap_err();

    match err {
        BackendError::WorkerExecution { rank, msg } => {
            assert_eq!(rank, 2);
            assert!(msg.contains("bad batch"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The group is still usable after a failed call.
    assert_ok!(group.execute(|trainer| Ok(trainer.ctx.rank)).await);
    group.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panics_become_worker_errors() {
    let context = connect(&cpu_cluster(1, 4));
    let mut group = WorkerGroup::<ScriptedTrainer>::start(
        context.tasks().unwrap(),
        group_config(2, 1),
        Script::default(),
    )
    .await
    .unwrap();

    let err = group
        .execute(|trainer| {
            if trainer.ctx.rank == 1 {
                panic!("out of memory");
            }
            Ok(())
        })
        .await
        .unwrap_err();

    match err {
        BackendError::WorkerExecution { rank, msg } => {
            assert_eq!(rank, 1);
            assert!(msg.contains("out of memory"));
        }
        other => panic!("unexpected error: {other}"),
    }
    group.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent_and_final() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script::default();
    let live = Arc::clone(&script.live);

    let mut group =
        WorkerGroup::<ScriptedTrainer>::start(context.tasks().unwrap(), group_config(2, 2), script)
            .await
            .unwrap();
    assert_eq!(live.load(Ordering::SeqCst), 4);

    group.shutdown().await;
    group.shutdown().await;

    assert!(!group.is_active());
    assert_eq!(live.load(Ordering::SeqCst), 0);

    let err = group.execute(|trainer| Ok(trainer.ctx.rank)).await.unwrap_err();
    assert!(matches!(err, BackendError::WorkerGroupStopped));

    let err = group.execute_single(|_| Ok(())).await.unwrap_err();
    assert!(matches!(err, BackendError::WorkerGroupStopped));
}
