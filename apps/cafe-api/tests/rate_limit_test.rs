mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveTime};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;

use cafe_api::chat::agent::{AgentBackend, AgentPrompt};
use cafe_api::clock::Clock;
use cafe_api::error::{AgentError, ChatError};
use cafe_api::models::badge::{Badge, BadgeKind, BADGE_VALIDITY_DAYS};

struct EchoBackend;

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn stream(
        &self,
        prompt: &AgentPrompt,
    ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError> {
        let answer = format!("You asked: {}", prompt.question);
        Ok(futures_util::stream::iter(vec![Ok(answer)]).boxed())
    }
}

#[tokio::test]
async fn twenty_ninth_thirtieth_and_thirty_first_message() {
    let app = common::test_app();
    let session = app.join("usr_a", "cafe_1", true).await;

    for i in 1..=28 {
        app.state
            .chat
            .send_message(&session, &format!("warming up {i}"))
            .await
            .expect("within limit");
    }

    app.state.chat.send_message(&session, "twenty-ninth").await.expect("29th allowed");
    let status = app.state.chat.limiter.status("usr_a", false).await.unwrap();
    assert_eq!(status.message.remaining, 1);

    app.state.chat.send_message(&session, "thirtieth").await.expect("30th allowed");
    let status = app.state.chat.limiter.status("usr_a", false).await.unwrap();
    assert_eq!(status.message.remaining, 0);

    let err = app
        .state
        .chat
        .send_message(&session, "thirty-first")
        .await
        .unwrap_err();
    match err {
        ChatError::RateLimited { action, reset_at, .. } => {
            assert_eq!(action, "message");
            assert_eq!(reset_at, app.clock.now() + Duration::hours(1));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn window_resets_after_an_hour() {
    let app = common::test_app();
    let session = app.join("usr_a", "cafe_1", true).await;
    for i in 0..30 {
        app.state.chat.send_message(&session, &format!("m{i}")).await.unwrap();
    }
    assert!(app.state.chat.send_message(&session, "blocked").await.is_err());

    app.clock.advance(Duration::minutes(61));
    let session = app.join("usr_a", "cafe_1", true).await;
    app.state
        .chat
        .send_message(&session, "fresh window")
        .await
        .expect("new window");
    let status = app.state.chat.limiter.status("usr_a", false).await.unwrap();
    assert_eq!(status.message.used, 1);
}

#[tokio::test]
async fn badge_holders_get_the_higher_ceiling() {
    let app = common::test_app();
    let now = app.clock.now();
    app.repo.insert_badge(Badge {
        id: "bdg_1".into(),
        user_id: "usr_b".into(),
        kind: BadgeKind::EarlyBird.as_str().into(),
        period_start: now.date_naive(),
        awarded_at: now.date_naive().and_time(NaiveTime::MIN).and_utc(),
        expires_at: now + Duration::days(BADGE_VALIDITY_DAYS),
        active: true,
    });

    let session = app.join("usr_b", "cafe_1", false).await;
    for i in 0..45 {
        app.state
            .chat
            .send_message(&session, &format!("badge message {i}"))
            .await
            .expect("badge tier allows 60");
    }
}

#[tokio::test]
async fn agent_global_cooldown_blocks_other_users() {
    let app = common::test_app_with(Arc::new(EchoBackend));
    let first = app.join("usr_a", "cafe_1", true).await;
    let second = app.join("usr_b", "cafe_1", true).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let answer = app
        .state
        .chat
        .mention_agent(&first, "@barista", "what is the wifi password?", &tx)
        .await
        .expect("first question answered");
    assert_eq!(answer.content, "You asked: what is the wifi password?");
    assert!(rx.try_recv().is_ok());

    let err = app
        .state
        .chat
        .mention_agent(&second, "@barista", "opening hours?", &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::RateLimited { action: "agent", .. }));

    app.clock.advance(Duration::seconds(121));
    app.state
        .chat
        .mention_agent(&second, "@barista", "opening hours?", &tx)
        .await
        .expect("cooldown over");

    let history = app.state.chat.room.history("cafe_1", 10, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|m| m.username == "barista"));
}
