mod common;

use common::{
    executor, init_tracing, orchestrator, raw_article, subscriber, FakeArticleSource, FakeSubscribers,
    FakeSummarizer, RecordingMailer, Reply,
};
use news_digest::digest::today_label;
use news_digest::prompts::DEFAULT_WELCOME_INTRO;
use news_digest::{
    InMemoryStepStore, Result, RunStatus, SignUpEvent, SqliteStepStore, StepStatus, StepStore, Trigger,
    TriggerOutcome, WelcomeWorkflow, WorkflowDispatcher,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

fn market_source() -> FakeArticleSource {
    FakeArticleSource::new()
        .with_tag("AAPL", vec![raw_article(1, "Apple raises guidance", 300), raw_article(2, "Apple buyback", 200)])
        .with_tag("MSFT", vec![raw_article(11, "Microsoft cloud growth", 400)])
        .with_tag("TSLA", vec![raw_article(21, "Tesla deliveries", 500)])
        .with_general(vec![raw_article(100, "Stocks close higher", 600)])
}

#[tokio::test]
async fn test_one_subscriber_failure_does_not_affect_others() -> Result<()> {
    init_tracing();

    let (a, b, c) = (subscriber("alice"), subscriber("bob"), subscriber("carol"));
    let subscribers = Arc::new(
        FakeSubscribers::new(vec![a.clone(), b.clone(), c.clone()])
            .with_tags(&a.email, &["AAPL"])
            .with_tags(&b.email, &["ZZZZ"])
            .with_tags(&c.email, &["MSFT"]),
    );
    // Bob has no company news and the general feed is down, so his aggregation errors
    let source = Arc::new(market_source().with_failing_general());
    let summarizer = Arc::new(FakeSummarizer::replying("<p>Your market summary</p>"));
    let mailer = Arc::new(RecordingMailer::new());

    let digest = orchestrator(
        executor(Arc::new(InMemoryStepStore::new()), summarizer.clone()),
        subscribers,
        source,
        mailer.clone(),
    );
    let report = digest.run(Uuid::new_v4()).await?;

    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(report.outcomes.len(), 3);

    let bob = report.outcome_for("bob").unwrap();
    assert!(bob.articles.is_empty());
    assert_eq!(bob.summary_text, None);
    assert!(!bob.delivered);

    for id in ["alice", "carol"] {
        let outcome = report.outcome_for(id).unwrap();
        assert!(!outcome.articles.is_empty());
        assert!(outcome.delivered, "{} should be delivered", id);
    }
    assert_eq!(mailer.recipients(), vec!["alice@example.com", "carol@example.com"]);
    assert_eq!(summarizer.call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_ai_text_excludes_subscriber_from_delivery() -> Result<()> {
    init_tracing();

    let (a, t) = (subscriber("alice"), subscriber("tom"));
    let subscribers = Arc::new(
        FakeSubscribers::new(vec![a.clone(), t.clone()])
            .with_tags(&a.email, &["AAPL"])
            .with_tags(&t.email, &["TSLA"]),
    );
    let summarizer = Arc::new(FakeSummarizer::replying("<p>Apple news</p>").with_rule("Tesla deliveries", Reply::NoText));
    let mailer = Arc::new(RecordingMailer::new());

    let digest = orchestrator(
        executor(Arc::new(InMemoryStepStore::new()), summarizer.clone()),
        subscribers,
        Arc::new(market_source()),
        mailer.clone(),
    );
    let report = digest.run(Uuid::new_v4()).await?;

    assert_eq!(report.run.status, RunStatus::Completed);
    let tom = report.outcome_for("tom").unwrap();
    assert_eq!(tom.articles.len(), 1);
    assert_eq!(tom.summary_text, None);
    assert!(!tom.delivered);

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@example.com");
    assert_eq!(sent[0].subject, format!("Your Daily Market Summary — {}", today_label()));
    assert!(sent[0].html_body.contains("<p>Apple news</p>"));
    Ok(())
}

#[tokio::test]
async fn test_summary_prompt_carries_articles_as_json() -> Result<()> {
    init_tracing();

    let a = subscriber("alice");
    let subscribers = Arc::new(FakeSubscribers::new(vec![a.clone()]).with_tags(&a.email, &["aapl"]));
    let summarizer = Arc::new(FakeSummarizer::replying("<p>ok</p>"));

    let digest = orchestrator(
        executor(Arc::new(InMemoryStepStore::new()), summarizer.clone()),
        subscribers,
        Arc::new(market_source()),
        Arc::new(RecordingMailer::new()),
    );
    let report = digest.run(Uuid::new_v4()).await?;

    let headlines: Vec<&str> = report.outcomes[0].articles.iter().map(|a| a.headline.as_str()).collect();
    assert_eq!(headlines, vec!["Apple raises guidance", "Apple buyback"]);

    let prompts = summarizer.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("\"headline\": \"Apple raises guidance\""));
    assert!(prompts[0].contains("\"related_symbol\": \"AAPL\""));
    assert!(!prompts[0].contains("{{newsData}}"));
    Ok(())
}

#[tokio::test]
async fn test_subscriber_listing_failure_fails_the_run() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStepStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let digest = orchestrator(
        executor(store.clone(), Arc::new(FakeSummarizer::replying("unused"))),
        Arc::new(FakeSubscribers::failing()),
        Arc::new(market_source()),
        mailer.clone(),
    );

    let run_id = Uuid::new_v4();
    let report = digest.run(run_id).await?;

    assert_eq!(report.run.status, RunStatus::Failed);
    assert!(report.run.error.as_deref().unwrap_or_default().contains("get-all-users"));
    assert!(report.outcomes.is_empty());
    assert!(mailer.sent().is_empty());

    let stored = store.load_run(run_id).await?.unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_no_subscribers_completes_without_outcomes() -> Result<()> {
    init_tracing();

    let store = Arc::new(InMemoryStepStore::new());
    let digest = orchestrator(
        executor(store.clone(), Arc::new(FakeSummarizer::replying("unused"))),
        Arc::new(FakeSubscribers::new(Vec::new())),
        Arc::new(market_source()),
        Arc::new(RecordingMailer::new()),
    );

    let run_id = Uuid::new_v4();
    let report = digest.run(run_id).await?;

    assert_eq!(report.run.status, RunStatus::Completed);
    assert!(report.outcomes.is_empty());
    let steps: Vec<String> = store.step_results(run_id).await.into_iter().map(|s| s.step_name).collect();
    assert_eq!(steps, vec!["get-all-users"]);
    Ok(())
}

#[tokio::test]
async fn test_no_articles_means_no_ai_call() -> Result<()> {
    init_tracing();

    let a = subscriber("alice");
    let subscribers = Arc::new(FakeSubscribers::new(vec![a.clone()]).with_tags(&a.email, &["NONE"]));
    let source = Arc::new(FakeArticleSource::new().with_general(Vec::new()));
    let summarizer = Arc::new(FakeSummarizer::replying("unused"));
    let mailer = Arc::new(RecordingMailer::new());

    let digest = orchestrator(
        executor(Arc::new(InMemoryStepStore::new()), summarizer.clone()),
        subscribers,
        source.clone(),
        mailer.clone(),
    );
    let report = digest.run(Uuid::new_v4()).await?;

    assert_eq!(report.run.status, RunStatus::Completed);
    let alice = report.outcome_for("alice").unwrap();
    assert!(alice.articles.is_empty());
    assert_eq!(alice.summary_text, None);
    assert_eq!(summarizer.call_count(), 0);
    assert!(mailer.sent().is_empty());
    // Aggregator fallback, then the orchestrator's own general retry
    assert_eq!(source.general_call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_watchlist_failure_falls_back_to_general_news() -> Result<()> {
    init_tracing();

    let a = subscriber("alice");
    let subscribers = Arc::new(FakeSubscribers::new(vec![a.clone()]).with_failing_watchlist(&a.email));
    let mailer = Arc::new(RecordingMailer::new());

    let digest = orchestrator(
        executor(Arc::new(InMemoryStepStore::new()), Arc::new(FakeSummarizer::replying("<p>general</p>"))),
        subscribers,
        Arc::new(market_source()),
        mailer.clone(),
    );
    let report = digest.run(Uuid::new_v4()).await?;

    let alice = report.outcome_for("alice").unwrap();
    assert_eq!(alice.articles.len(), 1);
    assert_eq!(alice.articles[0].headline, "Stocks close higher");
    assert!(alice.delivered);
    Ok(())
}

#[tokio::test]
async fn test_send_failure_is_recorded_per_subscriber() -> Result<()> {
    init_tracing();

    let (a, c) = (subscriber("alice"), subscriber("carol"));
    let subscribers = Arc::new(
        FakeSubscribers::new(vec![a.clone(), c.clone()])
            .with_tags(&a.email, &["AAPL"])
            .with_tags(&c.email, &["MSFT"]),
    );
    let mailer = Arc::new(RecordingMailer::new().failing_for(&a.email));

    let digest = orchestrator(
        executor(Arc::new(InMemoryStepStore::new()), Arc::new(FakeSummarizer::replying("<p>summary</p>"))),
        subscribers,
        Arc::new(market_source()),
        mailer.clone(),
    );
    let report = digest.run(Uuid::new_v4()).await?;

    assert_eq!(report.run.status, RunStatus::Completed);
    assert!(!report.outcome_for("alice").unwrap().delivered);
    assert!(report.outcome_for("carol").unwrap().delivered);
    assert_eq!(report.delivered_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_resumed_run_does_not_resend_or_resummarize() -> Result<()> {
    init_tracing();

    let store = Arc::new(SqliteStepStore::new("sqlite::memory:").await?);
    let a = subscriber("alice");
    let subscribers = Arc::new(FakeSubscribers::new(vec![a.clone()]).with_tags(&a.email, &["AAPL"]));
    let source = Arc::new(market_source());
    let summarizer = Arc::new(FakeSummarizer::replying("<p>summary</p>"));
    let mailer = Arc::new(RecordingMailer::new());
    let run_id = Uuid::new_v4();

    let first = orchestrator(executor(store.clone(), summarizer.clone()), subscribers.clone(), source.clone(), mailer.clone());
    let report = first.run(run_id).await?;
    assert_eq!(report.delivered_count(), 1);
    drop(first);

    // A fresh process: new executor, same durable store
    let second = orchestrator(executor(store.clone(), summarizer.clone()), subscribers.clone(), source.clone(), mailer.clone());
    let replay = second.run(run_id).await?;

    assert_eq!(replay.run.status, RunStatus::Completed);
    assert_eq!(replay.outcomes, report.outcomes);
    assert_eq!(mailer.sent().len(), 1);
    assert_eq!(summarizer.call_count(), 1);
    assert_eq!(subscribers.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(source.tag_calls.lock().unwrap().len(), 1);

    let steps = store.step_results(run_id).await?;
    let names: Vec<&str> = steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, vec!["fetch-news-alice", "get-all-users", "send-news-emails", "summarize-news-alice"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Succeeded));
    Ok(())
}

fn sign_up(email: &str) -> SignUpEvent {
    SignUpEvent {
        email: email.to_string(),
        name: "Dana".to_string(),
        country: "US".to_string(),
        investment_goals: "Growth".to_string(),
        risk_tolerance: "Medium".to_string(),
        preferred_industry: "Technology".to_string(),
    }
}

fn dispatcher(summarizer: Arc<FakeSummarizer>, mailer: Arc<RecordingMailer>) -> WorkflowDispatcher {
    let executor = executor(Arc::new(InMemoryStepStore::new()), summarizer);
    let digest = orchestrator(
        executor.clone(),
        Arc::new(FakeSubscribers::new(Vec::new())),
        Arc::new(market_source()),
        mailer.clone(),
    );
    WorkflowDispatcher::new(Arc::new(digest), Arc::new(WelcomeWorkflow::new(executor, mailer)))
}

#[tokio::test]
async fn test_welcome_email_uses_generated_intro() -> Result<()> {
    init_tracing();

    let summarizer = Arc::new(FakeSummarizer::replying("Tech growth investors will feel at home here."));
    let mailer = Arc::new(RecordingMailer::new());
    let dispatcher = dispatcher(summarizer.clone(), mailer.clone());

    let outcome = dispatcher
        .dispatch(Trigger::UserCreated(sign_up("dana@example.com")), Uuid::new_v4())
        .await?;

    let welcome = match outcome {
        TriggerOutcome::Welcome(welcome) => welcome,
        other => panic!("expected welcome outcome, got {:?}", other),
    };
    assert_eq!(welcome.run.status, RunStatus::Completed);
    assert!(welcome.delivered);
    assert_eq!(welcome.intro, "Tech growth investors will feel at home here.");

    let prompts = summarizer.prompts.lock().unwrap().clone();
    assert!(prompts[0].contains("- Preferred industry: Technology"));

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "dana@example.com");
    assert!(sent[0].html_body.contains("Tech growth investors will feel at home here."));
    Ok(())
}

#[tokio::test]
async fn test_welcome_email_falls_back_to_default_intro() -> Result<()> {
    init_tracing();

    let mailer = Arc::new(RecordingMailer::new());
    let dispatcher = dispatcher(Arc::new(FakeSummarizer::with_default(Reply::Fail)), mailer.clone());

    let outcome = dispatcher
        .dispatch(Trigger::UserCreated(sign_up("dana@example.com")), Uuid::new_v4())
        .await?;

    assert_eq!(outcome.status(), RunStatus::Completed);
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].html_body.contains(DEFAULT_WELCOME_INTRO));
    Ok(())
}

#[tokio::test]
async fn test_welcome_send_failure_fails_the_run() -> Result<()> {
    init_tracing();

    let mailer = Arc::new(RecordingMailer::new().failing_for("dana@example.com"));
    let dispatcher = dispatcher(Arc::new(FakeSummarizer::replying("Hello.")), mailer.clone());

    let outcome = dispatcher
        .dispatch(Trigger::UserCreated(sign_up("dana@example.com")), Uuid::new_v4())
        .await?;

    match outcome {
        TriggerOutcome::Welcome(welcome) => {
            assert_eq!(welcome.run.status, RunStatus::Failed);
            assert!(!welcome.delivered);
        }
        other => panic!("expected welcome outcome, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_manual_event_runs_the_digest() -> Result<()> {
    init_tracing();

    let dispatcher = dispatcher(Arc::new(FakeSummarizer::replying("unused")), Arc::new(RecordingMailer::new()));
    let outcome = dispatcher.dispatch(Trigger::ManualEvent, Uuid::new_v4()).await?;

    assert!(matches!(outcome, TriggerOutcome::Digest(_)));
    assert_eq!(outcome.status(), RunStatus::Completed);
    Ok(())
}
