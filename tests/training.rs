mod common;

use std::{sync::Arc, time::Duration};

use orchestra_backend::{BackendError, TrainingCoordinator, training::CoordinatorState};

use common::{Line, Script, ScriptedTrainer, connect, cpu_cluster, eventually, group_config};

type Coordinator = TrainingCoordinator<Line, ScriptedTrainer>;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_worker_weights_are_canonical() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script {
        divergent: true,
        ..Default::default()
    };
    let mut trainer = Coordinator::start(context, group_config(3, 1), script, false)
        .await
        .unwrap();

    let mut model = Line::zeros(2);
    let stats = trainer.train(&mut model, &1.0).await.unwrap();

    // Ranks 1 and 2 hold 2.0 and 3.0, only rank 0's weights are applied.
    assert_eq!(model.weights, [1.0, 1.0]);
    assert_eq!(stats, [0.0]);
    assert_eq!(trainer.state(), CoordinatorState::Idle);

    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consistency_check_rejects_divergent_replicas() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script {
        divergent: true,
        ..Default::default()
    };
    let mut trainer = Coordinator::start(context, group_config(3, 1), script, true)
        .await
        .unwrap();

    let mut model = Line::zeros(2);
    let err = trainer.train(&mut model, &1.0).await.unwrap_err();

    assert!(matches!(err, BackendError::ReplicaDivergence { rank: 1 }));
    assert_eq!(model.weights, [0.0, 0.0]);
    assert!(!trainer.is_trained());

    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_failure_leaves_the_model_untouched() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script {
        fail_on: Some(2),
        ..Default::default()
    };
    let mut trainer = Coordinator::start(context, group_config(2, 2), script, false)
        .await
        .unwrap();

    let mut model = Line {
        weights: vec![0.5, -0.5],
    };
    let err = trainer.train(&mut model, &1.0).await.unwrap_err();

    assert!(matches!(err, BackendError::WorkerExecution { rank: 2, .. }));
    assert_eq!(model.weights, [0.5, -0.5]);
    assert_eq!(trainer.state(), CoordinatorState::Idle);

    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_worker_fails_train_online() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script {
        panic_on: Some(0),
        ..Default::default()
    };
    let mut trainer = Coordinator::start(context, group_config(2, 1), script, false)
        .await
        .unwrap();

    let mut model = Line::zeros(1);
    let err = trainer.train_online(&mut model, &1.0).await.unwrap_err();

    assert!(matches!(err, BackendError::WorkerExecution { rank: 0, .. }));
    assert_eq!(model.weights, [0.0]);

    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn train_online_applies_one_step() {
    let context = connect(&cpu_cluster(1, 4));
    let mut trainer = Coordinator::start(context, group_config(2, 1), Script::default(), true)
        .await
        .unwrap();

    let mut model = Line::zeros(3);
    trainer.train_online(&mut model, &0.25).await.unwrap();
    trainer.train_online(&mut model, &0.25).await.unwrap();

    assert_eq!(model.weights, [0.5, 0.5, 0.5]);
    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validation_metadata_requires_training() {
    let context = connect(&cpu_cluster(1, 4));
    let mut trainer = Coordinator::start(context, group_config(2, 1), Script::default(), false)
        .await
        .unwrap();

    let err = trainer.validation_field().await.unwrap_err();
    assert!(matches!(err, BackendError::NotYetTrained(_)));
    let err = trainer.validation_metric().await.unwrap_err();
    assert!(matches!(err, BackendError::NotYetTrained(_)));

    let mut model = Line::zeros(1);
    trainer.train(&mut model, &1.0).await.unwrap();

    assert_eq!(trainer.validation_field().await.unwrap(), "label");
    assert_eq!(trainer.validation_metric().await.unwrap(), "loss");

    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn each_call_captures_the_model_once() {
    let cluster = cpu_cluster(1, 4);
    let store = cluster.store();
    let context = connect(&cluster);
    let mut trainer = Coordinator::start(context, group_config(4, 1), Script::default(), false)
        .await
        .unwrap();

    let mut model = Line::zeros(2);
    trainer.train(&mut model, &1.0).await.unwrap();
    trainer.train(&mut model, &1.0).await.unwrap();

    assert_eq!(model.weights, [2.0, 2.0]);
    assert_eq!(store.puts(), 2);
    assert_eq!(store.gets(), 8);

    // Every handle is released once its call is over.
    assert!(eventually(|| store.is_empty()).await);

    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_finite_weights_make_the_round_trip() {
    let context = connect(&cpu_cluster(1, 4));
    let mut trainer = Coordinator::start(context, group_config(2, 1), Script::default(), true)
        .await
        .unwrap();

    let mut model = Line {
        weights: vec![f32::INFINITY, f32::NAN, 0.0],
    };
    trainer.train(&mut model, &1.0).await.unwrap();

    assert_eq!(model.weights[0], f32::INFINITY);
    assert!(model.weights[1].is_nan());
    assert_eq!(model.weights[2], 1.0);

    trainer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_train_calls_run_one_after_the_other() {
    let context = connect(&cpu_cluster(1, 4));
    let script = Script {
        step_delay: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let journal = Arc::clone(&script.journal);
    let mut trainer = Coordinator::start(context, group_config(2, 1), script, false)
        .await
        .unwrap();

    let first = async {
        let mut model = Line::zeros(1);
        trainer.train(&mut model, &1.0).await.unwrap();

        // The second call only starts dispatching once the first one is over.
        assert!(eventually(|| trainer.state() == CoordinatorState::Dispatching).await);
        model
    };
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut model = Line::zeros(1);
        trainer.train(&mut model, &2.0).await.unwrap();
        model
    };

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.weights, [1.0]);
    assert_eq!(second.weights, [2.0]);
    assert_eq!(trainer.state(), CoordinatorState::Idle);

    for rank in 0..2 {
        let steps: Vec<f32> = journal
            .lock()
            .iter()
            .filter(|(r, _)| *r == rank)
            .map(|(_, step)| *step)
            .collect();
        assert_eq!(steps, [1.0, 2.0]);
    }

    trainer.shutdown().await;
}
