mod common;

use chrono::{Duration, Utc};

use cafe_api::clock::Clock;
use cafe_api::db::kv::KeyValueStore;
use cafe_api::db::repo::Repository;
use cafe_api::jobs::analytics::AnalyticsJob;
use cafe_api::jobs::badges::{BadgeAwardJob, BadgeExpiryJob};
use cafe_api::jobs::proactive::ProactiveJob;
use cafe_api::jobs::Job;
use cafe_api::models::cafe::Cafe;
use cafe_api::models::message::MESSAGE_TYPE_PROACTIVE;

async fn add_cafe(app: &common::TestApp, id: &str, proactive_enabled: bool) {
    app.repo
        .upsert_cafe(&Cafe {
            id: id.to_string(),
            name: format!("Cafe {id}"),
            proactive_enabled,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn analytics_rollup_is_idempotent() {
    let app = common::test_app();
    add_cafe(&app, "cafe_1", false).await;
    add_cafe(&app, "cafe_2", false).await;

    app.clock.advance(Duration::minutes(5));
    let a = app.join("usr_a", "cafe_1", true).await;
    let b = app.join("usr_b", "cafe_1", false).await;
    app.state.chat.send_message(&a, "morning flat white").await.unwrap();
    app.state.chat.send_message(&b, "anyone tried the new roast").await.unwrap();
    app.state.chat.send_message(&a, "yes it is great").await.unwrap();

    app.clock.advance(Duration::hours(1));
    let job = AnalyticsJob::new(app.repo.clone());
    let first = job.run(app.clock.now()).await;
    assert_eq!(first.processed, 2);
    assert_eq!(first.failed, 0);

    let second = job.run(app.clock.now()).await;
    assert_eq!(second, first);

    let date = app.clock.now().date_naive();
    let rows = app.repo.hourly_analytics("cafe_1", date).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].bucket_hour, 10);
    assert_eq!(rows[0].message_count, 3);
    assert_eq!(rows[0].active_users, 2);

    let quiet = app.repo.hourly_analytics("cafe_2", date).await.unwrap();
    assert_eq!(quiet.len(), 1);
    assert_eq!(quiet[0].message_count, 0);
}

#[tokio::test]
async fn analytics_failure_in_one_cafe_does_not_stop_the_rest() {
    let app = common::test_app();
    add_cafe(&app, "cafe_1", false).await;
    add_cafe(&app, "cafe_broken", false).await;
    add_cafe(&app, "cafe_3", false).await;
    app.repo.fail_cafe("cafe_broken");

    app.clock.advance(Duration::hours(1));
    let report = AnalyticsJob::new(app.repo.clone()).run(app.clock.now()).await;
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 1);

    let date = app.clock.now().date_naive();
    assert_eq!(app.repo.hourly_analytics("cafe_3", date).await.unwrap().len(), 1);
    assert!(app.repo.hourly_analytics("cafe_broken", date).await.unwrap().is_empty());
}

#[tokio::test]
async fn award_job_refreshes_the_cached_tier() {
    let app = common::test_app();

    // One message on each weekday, Monday through Friday.
    for day in 0..5 {
        if day > 0 {
            app.clock.advance(Duration::days(1));
        }
        let session = app.join("usr_regular", "cafe_1", true).await;
        app.state
            .chat
            .send_message(&session, &format!("back again, day {day}"))
            .await
            .unwrap();
    }
    assert!(!app.state.chat.has_badge("usr_regular").await.unwrap());

    let report = BadgeAwardJob::new(app.repo.clone(), app.store.clone())
        .run(app.clock.now())
        .await;
    assert_eq!(report.failed, 0);
    assert!(report.processed >= 1);
    assert!(app.state.chat.has_badge("usr_regular").await.unwrap());

    // Awarding again in the same week changes nothing.
    let badges = app.repo.badges().len();
    BadgeAwardJob::new(app.repo.clone(), app.store.clone())
        .run(app.clock.now())
        .await;
    assert_eq!(app.repo.badges().len(), badges);

    app.clock.advance(Duration::days(8));
    let expired = BadgeExpiryJob::new(app.repo.clone(), app.store.clone())
        .run(app.clock.now())
        .await;
    assert_eq!(expired.processed, 1);
    assert!(!app.state.chat.has_badge("usr_regular").await.unwrap());
}

#[tokio::test]
async fn proactive_message_respects_presence_and_cooldown() {
    let app = common::test_app();
    add_cafe(&app, "cafe_busy", true).await;
    add_cafe(&app, "cafe_quiet", true).await;
    add_cafe(&app, "cafe_off", false).await;

    app.join("usr_a", "cafe_busy", true).await;
    app.join("usr_b", "cafe_busy", true).await;
    app.join("usr_c", "cafe_quiet", true).await;
    app.join("usr_d", "cafe_off", true).await;
    app.join("usr_e", "cafe_off", true).await;

    let job = ProactiveJob::new(app.repo.clone(), app.store.clone(), app.state.chat.clone());
    let report = job.run(app.clock.now()).await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);

    let sends = app.repo.proactive_sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].cafe_id, "cafe_busy");
    assert_eq!(sends[0].present_users, 2);
    assert!(sends[0].template_key.starts_with("morning"));

    let history = app.state.chat.room.history("cafe_busy", 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].type_, MESSAGE_TYPE_PROACTIVE);

    // Within the cooldown nothing is sent.
    app.clock.advance(Duration::minutes(2));
    let again = job.run(app.clock.now()).await;
    assert_eq!(again.processed, 0);
    assert_eq!(app.repo.proactive_sends().len(), 1);

    app.clock.advance(Duration::minutes(9));
    let later = job.run(app.clock.now()).await;
    assert_eq!(later.processed, 1);
    assert_eq!(app.repo.proactive_sends().len(), 2);
}

#[tokio::test]
async fn failed_proactive_post_releases_the_cooldown() {
    let app = common::test_app();
    add_cafe(&app, "cafe_busy", true).await;
    app.join("usr_a", "cafe_busy", true).await;
    app.join("usr_b", "cafe_busy", true).await;
    app.repo.fail_cafe("cafe_busy");

    let job = ProactiveJob::new(app.repo.clone(), app.store.clone(), app.state.chat.clone());
    let report = job.run(app.clock.now()).await;
    assert_eq!(report.failed, 1);
    assert!(app
        .store
        .get("proactive:cooldown:cafe_busy")
        .await
        .unwrap()
        .is_none());

    // The next tick tries again instead of sitting out the cooldown.
    app.clock.advance(Duration::minutes(2));
    let retry = job.run(app.clock.now()).await;
    assert_eq!((retry.failed, retry.skipped), (1, 0));
    assert!(app.repo.proactive_sends().is_empty());
}

#[tokio::test]
async fn room_opened_before_registration_is_counted_once_registered() {
    let app = common::test_app();
    let a = app.join("usr_a", "cafe_popup", true).await;
    app.state.chat.send_message(&a, "pop-up espresso bar").await.unwrap();
    assert_eq!(app.repo.recent_messages("cafe_popup", 10).await.unwrap().len(), 1);

    add_cafe(&app, "cafe_popup", false).await;
    app.clock.advance(Duration::hours(1));
    let report = AnalyticsJob::new(app.repo.clone()).run(app.clock.now()).await;
    assert_eq!(report.processed, 1);

    let rows = app
        .repo
        .hourly_analytics("cafe_popup", app.clock.now().date_naive())
        .await
        .unwrap();
    assert_eq!(rows[0].message_count, 1);
}

#[test]
fn message_and_poke_rows_do_not_need_a_registered_cafe() {
    let up = include_str!("../migrations/2026-01-01-000000_create_core_tables/up.sql");
    for table in ["messages", "pokes"] {
        let body = up
            .split(&format!("CREATE TABLE {table} ("))
            .nth(1)
            .and_then(|rest| rest.split(");").next())
            .unwrap_or_else(|| panic!("{table} table missing"));
        assert!(!body.contains("REFERENCES"), "{table} references cafes");
    }
}
