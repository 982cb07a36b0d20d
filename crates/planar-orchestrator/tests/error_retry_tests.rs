//! Operator recovery: transport faults surface as plate errors and
//! RetryStep / SkipStep / Abort resolve them.

mod common;

use std::time::Duration;

use planar_core::Position;
use planar_orchestrator::{OrchestratorConfig, PlateControl, PlatePhase, RetryPolicy};

/// No automatic retries, so a single injected fault reaches the plate.
fn fragile_config() -> OrchestratorConfig {
    OrchestratorConfig::for_tests().with_retry(RetryPolicy {
        max_retries: 0,
        base_backoff_ms: 1,
        max_backoff_ms: 1,
    })
}

#[tokio::test]
async fn transport_fault_enters_error_and_retry_completes() {
    let rig = common::rig(&[(1, Position::new(0.0, 0.0))], fragile_config()).await;
    let (_sid, mut events) = rig
        .orchestrator
        .subscribe("plate.*")
        .await
        .expect("subscription");

    // The route to the reader crosses the track, so it carries a
    // `follow` command for the fault to hit.
    rig.driver.fail_next_follow(1).await;

    rig.orchestrator
        .spawn_plate(
            "P1",
            common::single_step_workflow(common::reader_step(Duration::from_millis(500))),
            vec![],
            None,
        )
        .await
        .expect("plate admitted");

    assert!(
        common::wait_for_phase(
            &rig.orchestrator,
            "P1",
            PlatePhase::Error,
            Duration::from_secs(20)
        )
        .await,
        "plate should surface the transport fault"
    );

    let snapshot = rig
        .orchestrator
        .get_plate_state("P1")
        .await
        .expect("snapshot");
    let error = snapshot.last_error.expect("error recorded");
    assert_eq!(error.step_index, 0);
    assert!(error.message.contains("transport"));

    rig.orchestrator
        .control_plate("P1", PlateControl::RetryStep)
        .await
        .expect("retry control");

    assert!(
        common::wait_for_phase(
            &rig.orchestrator,
            "P1",
            PlatePhase::Completed,
            Duration::from_secs(30)
        )
        .await,
        "retry should run the step to completion; state = {:?}",
        rig.orchestrator.get_plate_state("P1").await
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = common::drain(&mut events);
    let errors = events
        .iter()
        .filter(|e| e.event_type == "plate.error")
        .count();
    assert_eq!(errors, 1, "exactly one error before the retry");
    assert!(events
        .iter()
        .any(|e| e.event_type == "plate.step_retry"));
    assert!(events
        .iter()
        .any(|e| e.event_type == "plate.workflow_completed"));

    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn skip_step_advances_past_the_failure() {
    let rig = common::rig(&[(1, Position::new(0.0, 0.0))], fragile_config()).await;

    rig.driver.fail_next_follow(1).await;
    rig.orchestrator
        .spawn_plate(
            "P1",
            common::single_step_workflow(common::reader_step(Duration::from_millis(200))),
            vec![],
            None,
        )
        .await
        .expect("plate admitted");

    assert!(
        common::wait_for_phase(
            &rig.orchestrator,
            "P1",
            PlatePhase::Error,
            Duration::from_secs(20)
        )
        .await
    );

    rig.orchestrator
        .control_plate("P1", PlateControl::SkipStep { reason: "operator".into() })
        .await
        .expect("skip control");

    // Skipping the only step exhausts the workflow.
    assert!(
        common::wait_for_phase(
            &rig.orchestrator,
            "P1",
            PlatePhase::Completed,
            Duration::from_secs(20)
        )
        .await
    );
    let snapshot = rig
        .orchestrator
        .get_plate_state("P1")
        .await
        .expect("snapshot");
    assert_eq!(snapshot.step_index, 1);
    assert_eq!(snapshot.last_error, None);

    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn abort_from_error_releases_everything() {
    let rig = common::rig(&[(1, Position::new(0.0, 0.0))], fragile_config()).await;

    rig.driver.fail_next_follow(1).await;
    rig.orchestrator
        .spawn_plate(
            "P1",
            common::single_step_workflow(common::reader_step(Duration::from_millis(200))),
            vec![],
            None,
        )
        .await
        .expect("plate admitted");
    assert!(
        common::wait_for_phase(
            &rig.orchestrator,
            "P1",
            PlatePhase::Error,
            Duration::from_secs(20)
        )
        .await
    );

    rig.orchestrator
        .control_plate("P1", PlateControl::Abort { reason: "give up".into() })
        .await
        .expect("abort control");
    assert!(
        common::wait_for_phase(
            &rig.orchestrator,
            "P1",
            PlatePhase::Aborted,
            Duration::from_secs(20)
        )
        .await
    );

    // The mover held at the time of the fault goes back to the pool.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let movers = rig.orchestrator.list_movers().await;
    assert_eq!(movers[0].assigned_plate, None);

    rig.orchestrator.shutdown().await;
}
