mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{engine_with, spec_for, test_config, wait_terminal, TEMPLATE_PWNED};
use promptstrike::campaign::CampaignStatus;
use promptstrike::error::{CampaignError, ErrorKind};
use promptstrike::provider::{ScriptedAdapter, ScriptedStep};
use promptstrike::store::Page;

fn slow_adapter(name: &str, delay: Duration, count: usize, text: &str) -> ScriptedAdapter {
    let steps = (0..count)
        .map(|_| ScriptedStep::Respond {
            text: text.to_string(),
            delay: Some(delay),
        })
        .collect();
    ScriptedAdapter::sequence(name, steps, text)
}

const TEMPLATE_MANY: &str = r#"
id: many-1
version: "1.0.0"
category: prompt_injection
info:
  name: "Fan out"
  severity: low
prompt: "probe {{n}}"
variables:
  n: ["1", "2", "3", "4", "5", "6", "7", "8"]
detection:
  type: string_match
  substr: "PWNED"
"#;

// ============================================================================
// pause / resume
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn pause_suspends_dispatch_and_resume_completes() {
    let adapter = Arc::new(slow_adapter(
        "stub",
        Duration::from_millis(100),
        16,
        "PWNED",
    ));
    let mut config = test_config();
    config.workers = Some(2);
    config.per_target_concurrency = 2;
    let controller = engine_with(config, adapter, &[TEMPLATE_MANY]);

    let id = controller
        .start(spec_for("stub", "stub-model"))
        .await
        .unwrap();
    controller.pause(id).unwrap();
    assert_eq!(controller.status(id).unwrap().status, CampaignStatus::Paused);

    // Give in-flight probes time to drain; paused dispatch must not
    // chew through the remaining queue.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let paused_total = controller.status(id).unwrap().counters.total();
    assert!(
        paused_total <= 4,
        "paused campaign kept dispatching: {paused_total} results"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        controller.status(id).unwrap().counters.total(),
        paused_total,
        "no new results while paused"
    );

    controller.resume(id).unwrap();
    let view = wait_terminal(&controller, id, Duration::from_secs(20)).await;
    assert_eq!(view.status, CampaignStatus::Completed);
    assert_eq!(view.counters.total(), 8);

    controller.shutdown().await;
}

// ============================================================================
// cancel
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn cancel_terminates_with_cancelled_results() {
    let adapter = Arc::new(slow_adapter(
        "stub",
        Duration::from_millis(200),
        16,
        "PWNED",
    ));
    let mut config = test_config();
    config.workers = Some(2);
    let controller = engine_with(config, adapter, &[TEMPLATE_MANY]);

    let id = controller
        .start(spec_for("stub", "stub-model"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.cancel(id).unwrap();

    let view = controller.status(id).unwrap();
    assert_eq!(view.status, CampaignStatus::Cancelled);
    // Terminal status is immutable.
    assert!(matches!(
        controller.pause(id),
        Err(CampaignError::InvalidTransition { .. })
    ));

    // Every enqueued job still drains to exactly one result.
    common::wait_results(&controller, id, 8, Duration::from_secs(20)).await;
    let results = controller.results(id, Page { offset: 0, limit: 100 });
    assert_eq!(results.len(), 8);
    assert!(
        results
            .iter()
            .any(|r| r.error_kind == Some(ErrorKind::Cancelled)),
        "cancelled probes should surface as cancelled results"
    );

    controller.shutdown().await;
}

// ============================================================================
// budgets
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn job_budget_caps_enqueued_probes() {
    let adapter = Arc::new(ScriptedAdapter::always("stub", "PWNED"));
    let controller = engine_with(test_config(), adapter, &[TEMPLATE_MANY]);

    let mut spec = spec_for("stub", "stub-model");
    spec.budget.max_jobs = Some(3);
    let id = controller.start(spec).await.unwrap();
    let view = wait_terminal(&controller, id, Duration::from_secs(10)).await;

    assert_eq!(view.jobs_enqueued, 3);
    assert_eq!(view.counters.total(), 3);

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn target_vulnerable_budget_stops_early() {
    let adapter = Arc::new(slow_adapter(
        "stub",
        Duration::from_millis(50),
        16,
        "PWNED",
    ));
    let mut config = test_config();
    config.workers = Some(1);
    config.per_target_concurrency = 1;
    let controller = engine_with(config, adapter, &[TEMPLATE_MANY]);

    let mut spec = spec_for("stub", "stub-model");
    spec.budget.target_vulnerable = Some(2);
    let id = controller.start(spec).await.unwrap();
    let view = wait_terminal(&controller, id, Duration::from_secs(20)).await;

    assert_eq!(view.status, CampaignStatus::Completed);
    assert!(view.counters.vulnerable >= 2);
    // Once the target count was reached, the rest were cut short
    // instead of probed.
    assert!(
        view.counters.vulnerable < 8,
        "budget should stop the campaign early: {:?}",
        view.counters
    );

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fail_fast_fails_campaign_on_first_error() {
    // Overload errors normally leave a campaign completing with a mix
    // of verdicts; fail_fast turns the first terminal error into a
    // campaign failure.
    let adapter = Arc::new(ScriptedAdapter::always_overloaded("hot"));
    let mut config = test_config();
    config.workers = Some(1);

    let providers = Arc::new(promptstrike::provider::ProviderRegistry::new(&config));
    providers.register(Arc::clone(&adapter) as Arc<dyn promptstrike::provider::ProviderAdapter>);
    let templates = Arc::new(promptstrike::template::TemplateStore::new(
        common::snapshot_from_yaml(&[TEMPLATE_MANY]),
    ));
    let controller =
        promptstrike::campaign::CampaignController::new(config, templates, providers);

    let mut spec = spec_for("hot", "hot-model");
    spec.fail_fast = true;
    let id = controller.start(spec).await.unwrap();
    let view = wait_terminal(&controller, id, Duration::from_secs(20)).await;

    assert_eq!(view.status, CampaignStatus::Failed);
    assert!(view.counters.error >= 1);

    controller.shutdown().await;
}

// ============================================================================
// spec validation at submit
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn invalid_spec_is_rejected_at_submit() {
    let adapter = Arc::new(ScriptedAdapter::always("stub", "ok"));
    let controller = engine_with(test_config(), adapter, &[TEMPLATE_PWNED]);

    let mut spec = spec_for("wrong-provider", "m");
    spec.budget.wall_clock = Some("not a duration".to_string());
    let err = controller.start(spec).await.unwrap_err();
    match err {
        CampaignError::InvalidSpec { errors } => {
            assert!(errors.len() >= 2, "{errors:?}");
        }
        other => panic!("expected InvalidSpec, got {other}"),
    }

    // Unknown template ids are caught too.
    let mut spec = spec_for("stub", "stub-model");
    spec.templates.ids = vec!["inj-definitely-missing".to_string()];
    assert!(matches!(
        controller.start(spec).await,
        Err(CampaignError::InvalidSpec { .. })
    ));

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_filter_match_fails_cleanly() {
    let adapter = Arc::new(ScriptedAdapter::always("stub", "ok"));
    let controller = engine_with(test_config(), adapter, &[TEMPLATE_PWNED]);

    let mut spec = spec_for("stub", "stub-model");
    spec.templates.min_severity = Some(promptstrike::template::Severity::Critical);
    assert!(matches!(
        controller.start(spec).await,
        Err(CampaignError::NoTemplatesMatched)
    ));

    controller.shutdown().await;
}

// ============================================================================
// detector timeout surfaces as inconclusive
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn detector_timeout_yields_inconclusive() {
    let adapter = Arc::new(ScriptedAdapter::always("stub", "PWNED"));
    let mut config = test_config();
    config.detector_budget = Duration::ZERO;
    let controller = engine_with(config, adapter, &[TEMPLATE_PWNED]);

    let id = controller
        .start(spec_for("stub", "stub-model"))
        .await
        .unwrap();
    let view = wait_terminal(&controller, id, Duration::from_secs(10)).await;

    assert_eq!(view.counters.inconclusive, 1);
    let results = controller.results(id, Page::default());
    let result = &results[0];
    assert_eq!(result.verdict(), promptstrike::Verdict::Inconclusive);
    // A detector timeout is not a probe error.
    assert!(result.error_kind.is_none());
    assert!(result.detection.timed_out);
    assert!(
        result
            .detection
            .trace
            .iter()
            .any(|t| t.reason.as_deref() == Some("detector_timeout")),
        "trace should carry the timeout reason"
    );

    controller.shutdown().await;
}
