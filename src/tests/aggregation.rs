use tokio::time;

use crate::{
    aggregator::WeightingStrategy,
    ledger::Ledger,
    services::{ServiceError, Services},
    settings::RetentionSettings,
    state_machine::{RoundError, RoundOutcome},
    storage::{keys::EntryState, KeyValueStore},
    tests::utils::*,
};

const SITES: [(&str, u64, [f64; 4]); 3] = [
    ("siteA", 120, [1.0, -0.4, 0.3, 0.8]),
    ("siteB", 150, [1.2, -0.6, 0.1, 0.7]),
    ("siteC", 100, [0.9, -0.5, 0.2, 0.9]),
];

async fn submit_sites<S: KeyValueStore>(
    services: &mut Services<S>,
    sites: &[(&str, u64, [f64; 4])],
) {
    for (i, (site_id, samples, layer0)) in sites.iter().enumerate() {
        let raw = payload(site_id, *samples, layer0, &format!("nonce-{}", i), now());
        services
            .submit_update(&raw, &signature(&raw), &site())
            .await
            .unwrap();
    }
}

fn assert_close(actual: &[f64], expected: &[f64], tolerance: f64) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!(
            (a - e).abs() < tolerance,
            "{:?} is not close to {:?}",
            actual,
            expected
        );
    }
}

#[tokio::test]
async fn test_weighted_round_end_to_end() {
    enable_logging();
    let store = memory();
    let mut services = services(store.clone(), 3);
    submit_sites(&mut services, &SITES).await;

    let metrics = services.read_metrics(MODEL).await.unwrap();
    assert_eq!(metrics.pending, 3);
    assert_eq!(metrics.active_model_count, 1);
    assert_eq!(metrics.min_participants, 3);
    assert_eq!(metrics.aggregation_threshold, 3);

    let outcome = services.trigger_aggregation(MODEL, &admin()).await.unwrap();
    let version = match outcome {
        RoundOutcome::Aggregated {
            version,
            participants: 3,
        } => version,
        outcome => panic!("unexpected outcome {:?}", outcome),
    };

    let view = services.read_model(MODEL, None).await.unwrap();
    assert_eq!(view.model.version, version);
    assert_eq!(view.history, vec![version]);
    assert_eq!(view.model.metadata.participants, 3);
    assert_eq!(view.model.metadata.sites, vec!["siteA", "siteB", "siteC"]);
    // weighted by 120, 150 and 100 samples
    assert_close(
        &view.model.weights["layer0"],
        &[390.0 / 370.0, -188.0 / 370.0, 71.0 / 370.0, 291.0 / 370.0],
        1e-3,
    );

    let serialized = serde_json::to_value(&view).unwrap();
    assert_eq!(serialized["modelName"], MODEL);
    assert_eq!(serialized["version"], version);
    assert_eq!(serialized["history"][0], version);

    let mut ledger = Ledger::new(store);
    assert_eq!(ledger.count_pending(MODEL).await.unwrap(), 0);
    assert_eq!(
        ledger.count(MODEL, EntryState::Processing).await.unwrap(),
        0
    );
    assert_eq!(services.read_metrics(MODEL).await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_uniform_round_is_unweighted_mean() {
    let mut services = Services::new(
        memory(),
        security(),
        aggregation(3, WeightingStrategy::Uniform),
        RetentionSettings::default(),
    );
    submit_sites(&mut services, &SITES).await;

    assert!(services
        .trigger_aggregation(MODEL, &admin())
        .await
        .unwrap()
        .is_aggregated());
    let view = services.read_model(MODEL, None).await.unwrap();
    assert_close(
        &view.model.weights["layer0"],
        &[3.1 / 3.0, -0.5, 0.2, 0.8],
        1e-9,
    );
}

#[tokio::test]
async fn test_too_few_participants_stay_pending() {
    let store = memory();
    let mut services = services(store.clone(), 3);
    submit_sites(&mut services, &SITES[..2]).await;

    let outcome = services.trigger_aggregation(MODEL, &admin()).await.unwrap();
    assert_eq!(
        outcome,
        RoundOutcome::NotEnoughParticipants { participants: 2 }
    );
    assert_eq!(
        serde_json::to_value(&outcome).unwrap(),
        serde_json::json!({
            "aggregated": false,
            "reason": "not_enough_participants",
            "participants": 2
        })
    );

    let mut ledger = Ledger::new(store);
    let pending = ledger.list_entries(MODEL, EntryState::Pending).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(
        ledger.count(MODEL, EntryState::Processing).await.unwrap(),
        0
    );
    assert!(matches!(
        services.read_model(MODEL, None).await,
        Err(ServiceError::NotFound)
    ));
}

#[tokio::test]
async fn test_updates_after_a_round_wait_for_the_next() {
    let mut services = services(memory(), 1);
    submit_sites(&mut services, &SITES[..1]).await;
    let first = services.trigger_aggregation(MODEL, &admin()).await.unwrap();

    let raw = payload("siteB", 150, &SITES[1].2, "later", now());
    services
        .submit_update(&raw, &signature(&raw), &site())
        .await
        .unwrap();
    let second = services.trigger_aggregation(MODEL, &admin()).await.unwrap();

    let (first, second) = match (first, second) {
        (
            RoundOutcome::Aggregated { version: first, .. },
            RoundOutcome::Aggregated { version: second, .. },
        ) => (first, second),
        outcomes => panic!("unexpected outcomes {:?}", outcomes),
    };
    assert!(second > first);

    let view = services.read_model(MODEL, None).await.unwrap();
    assert_eq!(view.model.version, second);
    assert_eq!(view.history, vec![second, first]);
    assert_close(&view.model.weights["layer0"], &SITES[1].2, 1e-9);
    let old = services.read_model(MODEL, Some(first)).await.unwrap();
    assert_close(&old.model.weights["layer0"], &SITES[0].2, 1e-9);
}

#[tokio::test]
async fn test_invalid_model_names() {
    let mut services = services(memory(), 1);
    for model_name in ["", "has space", "{fl:x}"] {
        assert!(matches!(
            services.trigger_aggregation(model_name, &admin()).await,
            Err(ServiceError::InvalidModelName(_))
        ));
        assert!(matches!(
            services.read_model(model_name, None).await,
            Err(ServiceError::InvalidModelName(_))
        ));
    }
}

#[tokio::test]
async fn test_unknown_version_is_not_found() {
    let mut services = services(memory(), 1);
    submit_sites(&mut services, &SITES[..1]).await;
    services.trigger_aggregation(MODEL, &admin()).await.unwrap();

    assert!(matches!(
        services.read_model(MODEL, Some(1)).await,
        Err(ServiceError::NotFound)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_round_commits_once() {
    let store = memory();
    let mut services = services(FaultyPipelines::stalling(store.clone(), ":latest"), 2);
    submit_sites(&mut services, &SITES[..2]).await;

    let error = services.trigger_aggregation(MODEL, &admin()).await.unwrap_err();
    assert!(matches!(error, ServiceError::Timeout));

    // the round runs to its end and releases the lock
    time::sleep(STALL).await;
    assert_eq!(
        services.trigger_aggregation(MODEL, &admin()).await.unwrap(),
        RoundOutcome::NotEnoughParticipants { participants: 0 }
    );

    let view = services.read_model(MODEL, None).await.unwrap();
    assert_eq!(view.history, vec![view.model.version]);
    assert_eq!(view.model.metadata.participants, 2);
    let mut ledger = Ledger::new(store);
    assert_eq!(
        ledger.count(MODEL, EntryState::Processing).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_failed_commit_is_not_counted_twice() {
    let store = memory();
    let mut failing = services(FaultyPipelines::failing(store.clone(), ":latest"), 2);
    submit_sites(&mut failing, &SITES[..2]).await;

    assert!(matches!(
        failing.trigger_aggregation(MODEL, &admin()).await,
        Err(ServiceError::Round(RoundError::Commit(_)))
    ));
    let mut ledger = Ledger::new(store.clone());
    assert_eq!(
        ledger.count(MODEL, EntryState::Processing).await.unwrap(),
        2
    );

    // the retried round publishes one version and consumes the updates with it
    let mut healthy = super::utils::services(store, 2);
    assert!(healthy
        .trigger_aggregation(MODEL, &admin())
        .await
        .unwrap()
        .is_aggregated());
    assert_eq!(
        healthy.trigger_aggregation(MODEL, &admin()).await.unwrap(),
        RoundOutcome::NotEnoughParticipants { participants: 0 }
    );
    let view = healthy.read_model(MODEL, None).await.unwrap();
    assert_eq!(view.history, vec![view.model.version]);
    assert_eq!(
        ledger.count(MODEL, EntryState::Processing).await.unwrap(),
        0
    );
}
