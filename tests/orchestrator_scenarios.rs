//! End-to-end tracking runs against the simulated hub and carrier site.

mod support;

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use shiptrack_rs::cache::CacheRecord;
use shiptrack_rs::instruction::{ActionScript, Instruction};
use shiptrack_rs::milestone::Milestone;
use shiptrack_rs::service::TrackRequest;

use support::{
    ARRIVAL, BOOKING_ID, CARRIER_URL, HUB_URL, LOGIN_URL, RESULT_URL, SimFactory, SiteOracles,
    VOYAGE, read_jsonl, service, test_config,
};

#[tokio::test]
async fn first_run_walks_every_milestone_through_the_oracles() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let oracles = Arc::new(SiteOracles::default());
    let factory = Arc::new(SimFactory::new(RESULT_URL));
    let service = service(test_config(dir.path()), Arc::clone(&oracles), Arc::clone(&factory));

    let response = service
        .track(TrackRequest::new(BOOKING_ID).carrier("hmm"))
        .await?;

    assert!(response.success);
    assert!(!response.used_cache);
    assert_eq!(response.voyage_number.as_deref(), Some(VOYAGE));
    assert_eq!(response.arrival_date.as_deref(), Some(ARRIVAL));
    assert_eq!(response.extracted_data["voyage_number"], VOYAGE);
    assert!(oracles.calls("reasoning") >= 3);
    assert!(oracles.calls("generate") >= 3);

    let browser = factory.last().expect("a browser was connected");
    assert_eq!(browser.navigations(), vec![HUB_URL.to_string()]);
    assert_eq!(browser.typed(), vec![BOOKING_ID.to_string()]);
    let open = browser.open_pages();
    assert_eq!(open.len(), 1, "ad tab and hub page are closed: {open:?}");
    assert_eq!(open[0].1, RESULT_URL);

    let record: CacheRecord = serde_json::from_str(&std::fs::read_to_string(
        service.cache().path_for("hmm", BOOKING_ID),
    )?)?;
    for milestone in [
        Milestone::ReachedHub,
        Milestone::ReachedCarrierSite,
        Milestone::SubmittedTrackingQuery,
        Milestone::ResultsDisplayed,
    ] {
        assert!(
            record.milestones.contains_key(milestone.id()),
            "{milestone} should be cached"
        );
    }
    let finals = record.final_results.expect("final results cached");
    assert_eq!(finals.voyage_number, VOYAGE);
    assert_eq!(finals.arrival_date, ARRIVAL);
    assert!(!finals.verification_scripts.is_empty());

    let pipeline = read_jsonl(&dir.path().join("logs").join(BOOKING_ID).join("pipeline.jsonl"));
    assert!(!pipeline.is_empty());
    assert_eq!(
        pipeline.last().and_then(|step| step["milestone"].as_str()),
        Some("Data extracted")
    );
    Ok(())
}

#[tokio::test]
async fn second_run_replays_the_cache_without_planning_oracles() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let oracles = Arc::new(SiteOracles::default());
    let factory = Arc::new(SimFactory::new(RESULT_URL));
    let service = service(test_config(dir.path()), Arc::clone(&oracles), Arc::clone(&factory));

    let first = service.track(TrackRequest::new(BOOKING_ID)).await?;
    assert!(first.success);
    oracles.reset();

    let second = service.track(TrackRequest::new(BOOKING_ID)).await?;
    assert!(second.success);
    assert!(second.used_cache);
    assert_eq!(second.voyage_number, first.voyage_number);
    assert_eq!(second.arrival_date, first.arrival_date);
    for kind in ["reasoning", "vision", "language", "generate", "judge", "extract"] {
        assert_eq!(oracles.calls(kind), 0, "{kind} oracle consulted on replay");
    }

    let browser = factory.last().expect("a browser was connected");
    assert_eq!(browser.open_pages()[0].1, RESULT_URL);
    Ok(())
}

#[tokio::test]
async fn force_fresh_ignores_the_cache() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let oracles = Arc::new(SiteOracles::default());
    let factory = Arc::new(SimFactory::new(RESULT_URL));
    let service = service(test_config(dir.path()), Arc::clone(&oracles), factory);

    service.track(TrackRequest::new(BOOKING_ID)).await?;
    oracles.reset();
    let response = service
        .track(TrackRequest::new(BOOKING_ID).force_fresh(true))
        .await?;
    assert!(response.success);
    assert!(!response.used_cache);
    assert!(oracles.calls("reasoning") > 0);
    Ok(())
}

#[tokio::test]
async fn expired_cache_is_not_replayed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let oracles = Arc::new(SiteOracles::default());
    let factory = Arc::new(SimFactory::new(RESULT_URL));
    let service = service(test_config(dir.path()), Arc::clone(&oracles), factory);

    service.track(TrackRequest::new(BOOKING_ID)).await?;

    let path = service.cache().path_for("hmm", BOOKING_ID);
    let mut record: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    record["cached_at"] = serde_json::to_value(Utc::now() - ChronoDuration::days(15))?;
    std::fs::write(&path, serde_json::to_string(&record)?)?;

    oracles.reset();
    let response = service.track(TrackRequest::new(BOOKING_ID)).await?;
    assert!(response.success);
    assert!(!response.used_cache);
    assert!(oracles.calls("reasoning") > 0);
    Ok(())
}

#[tokio::test]
async fn cached_navigation_outside_the_allow_list_is_never_replayed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let oracles = Arc::new(SiteOracles::default());
    let factory = Arc::new(SimFactory::new(RESULT_URL));
    let service = service(test_config(dir.path()), Arc::clone(&oracles), Arc::clone(&factory));

    let forbidden = ActionScript {
        steps: vec![Instruction::Navigate {
            url: "https://evil.example/steal".to_string(),
        }],
    };
    service
        .cache()
        .save_milestone("hmm", BOOKING_ID, Milestone::ReachedHub, &forbidden, &[])
        .await?;

    let response = service.track(TrackRequest::new(BOOKING_ID)).await?;
    assert!(response.success);
    assert!(oracles.calls("reasoning") > 0);

    let browser = factory.last().expect("a browser was connected");
    let navigations = browser.navigations();
    assert!(
        navigations.iter().all(|url| !url.contains("evil.example")),
        "{navigations:?}"
    );

    let complete = read_jsonl(&dir.path().join("logs").join(BOOKING_ID).join("complete.jsonl"));
    assert!(complete.iter().any(|line| {
        line["operation"]["operation"] == "cache_replay"
            && line["operation"]["success"] == false
            && line["operation"]["error_kind"] == "compilation"
    }));

    // The oracle-driven hub step replaces the rejected record.
    let hub = service
        .cache()
        .get("hmm", BOOKING_ID, Milestone::ReachedHub)
        .await
        .expect("hub step re-cached");
    assert_ne!(hub.script, forbidden);
    Ok(())
}

#[tokio::test]
async fn hijacked_page_is_recovered_from_the_hub() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // Third planning call happens on the carrier site.
    let oracles = Arc::new(SiteOracles::hijacking_on(3));
    let factory = Arc::new(SimFactory::new(RESULT_URL));
    let service = service(test_config(dir.path()), Arc::clone(&oracles), Arc::clone(&factory));

    let response = service.track(TrackRequest::new(BOOKING_ID)).await?;
    assert!(response.success);

    let browser = factory.last().expect("a browser was connected");
    let navigations = browser.navigations();
    assert_eq!(navigations.len(), 3, "{navigations:?}");
    assert!(navigations.iter().all(|url| url == HUB_URL));

    let pipeline = read_jsonl(&dir.path().join("logs").join(BOOKING_ID).join("pipeline.jsonl"));
    let recovery = pipeline
        .iter()
        .find(|step| {
            step["operations"]
                .as_array()
                .map(|ops| ops.iter().any(|op| op == "Ad recovery to Reached hub site"))
                .unwrap_or(false)
        })
        .expect("recovery step recorded");
    assert_eq!(recovery["success"], true);
    assert_eq!(recovery["current_url"], HUB_URL);
    assert!(recovery["errors"].as_array().unwrap().is_empty());

    // The milestones reached before the hijack come back from the cache.
    let complete = read_jsonl(&dir.path().join("logs").join(BOOKING_ID).join("complete.jsonl"));
    let replays = complete
        .iter()
        .filter(|line| line["operation"]["operation"] == "cache_replay")
        .count();
    assert!(replays >= 2, "expected replays after recovery, saw {replays}");
    Ok(())
}

#[tokio::test]
async fn login_wall_never_counts_as_results_and_the_budget_ends_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = test_config(dir.path());
    config.max_steps = 8;
    let oracles = Arc::new(SiteOracles::default());
    let factory = Arc::new(SimFactory::new(LOGIN_URL));
    let service = service(config, Arc::clone(&oracles), Arc::clone(&factory));

    let response = service.track(TrackRequest::new(BOOKING_ID)).await?;
    assert!(!response.success);
    assert!(response.voyage_number.is_none());
    assert!(response.extracted_data.is_empty());

    let pipeline = read_jsonl(&dir.path().join("logs").join(BOOKING_ID).join("pipeline.jsonl"));
    assert_eq!(pipeline.len(), 8);
    let rejected = pipeline
        .iter()
        .flat_map(|step| step["errors"].as_array().cloned().unwrap_or_default())
        .filter(|error| error["operation"] == "evaluate")
        .filter(|error| {
            error["data"]["reasoning"]
                .as_str()
                .map(|reason| reason.contains("Login page"))
                .unwrap_or(false)
        })
        .count();
    assert!(rejected >= 2);

    let complete = read_jsonl(&dir.path().join("logs").join(BOOKING_ID).join("complete.jsonl"));
    assert!(
        complete
            .iter()
            .any(|line| line["operation"]["operation"] == "failure_alert"),
        "repeated failures raise an alert"
    );

    let browser = factory.last().expect("a browser was connected");
    assert_eq!(browser.open_pages()[0].1, LOGIN_URL);
    assert!(browser.open_pages().iter().all(|(_, url)| url != CARRIER_URL));
    Ok(())
}
