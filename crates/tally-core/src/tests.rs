/// Scenario tests for the query dispatcher and the job poller.
///
/// Uses ScriptedMockService so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod dispatcher_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tally_service::{
        AnalysisService, HistoryEntry, QueryResponse, Role, ScriptedMockService, ServiceError,
        StreamEvent, StreamScript, StructuredPayload,
    };
    use tokio::sync::mpsc;

    use crate::{
        DispatchOptions, HistoryError, QueryDispatcher, Rollback, SubmitError, TurnContext,
        TurnEvent, TurnFailure, TurnObserver, TurnOutcome, TurnState,
    };

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn streaming(service: ScriptedMockService) -> QueryDispatcher {
        QueryDispatcher::new(Arc::new(service), DispatchOptions::default())
    }

    fn single_shot(service: ScriptedMockService) -> QueryDispatcher {
        let options = DispatchOptions { stream: false, ..DispatchOptions::default() };
        QueryDispatcher::new(Arc::new(service), options)
    }

    fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    async fn wait_for_state(d: &QueryDispatcher, session: &str, state: TurnState) {
        while d.state(session) != state {
            tokio::task::yield_now().await;
        }
    }

    // ── Successful turns ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn n_single_shot_turns_leave_2n_ordered_messages() {
        let service = ScriptedMockService::new()
            .with_answer("one")
            .with_answer("two")
            .with_answer("three");
        let d = single_shot(service);

        for q in ["first?", "second?", "third?"] {
            let outcome = d.submit("s", q, None).await.unwrap();
            assert!(outcome.is_reconciled());
        }

        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 6);
        assert!(msgs.windows(2).all(|w| w[0].order < w[1].order));
        let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant].repeat(3));
        assert_eq!(msgs[4].content, "third?");
        assert_eq!(msgs[5].content, "three");
        assert_eq!(d.state("s"), TurnState::Reconciled);
    }

    #[tokio::test]
    async fn n_streamed_turns_leave_2n_messages() {
        let service = ScriptedMockService::new()
            .with_stream(StreamScript::answer(&["Rev", "enue"], "Revenue"))
            .with_stream(StreamScript::answer(&["Cost"], "Cost"));
        let d = streaming(service);

        d.submit("s", "a", None).await.unwrap();
        d.submit("s", "b", None).await.unwrap();

        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].content, "Revenue");
        assert_eq!(msgs[3].content, "Cost");
    }

    #[tokio::test]
    async fn single_shot_payload_is_kept() {
        let mut data = StructuredPayload::new();
        data.insert("calculated_metrics", json!({"revenue": 4200000}));
        let service = ScriptedMockService::new()
            .with_response(QueryResponse { answer: "4.2M".into(), data });
        let d = single_shot(service);

        let outcome = d.submit("s", "What is Q3 revenue?", None).await.unwrap();
        let msg = outcome.message().unwrap();
        assert_eq!(msg.content, "4.2M");
        assert!(msg.data.as_ref().unwrap().get("calculated_metrics").is_some());
        assert_eq!(d.messages("s")[1], *msg);
    }

    #[tokio::test]
    async fn stream_events_arrive_in_order_and_done_wins() {
        let script = StreamScript::events(&[
            StreamEvent::new("status", json!("Analyzing data...")),
            StreamEvent::new("token", json!("Rev")),
            StreamEvent::new("metrics", json!({"revenue": 4.2})),
            StreamEvent::new("token", json!("enue")),
            StreamEvent::new("done", json!({"answer": "Revenue was 4.2M", "status": "success"})),
        ]);
        let d = streaming(ScriptedMockService::new().with_stream(script));
        let (tx, rx) = mpsc::channel(64);

        let outcome = d.submit("s", "revenue?", Some(tx)).await.unwrap();
        let events = drain(rx);

        assert_eq!(events[0], TurnEvent::Dispatched { session: "s".into() });
        assert_eq!(events[1], TurnEvent::Status("Analyzing data...".into()));
        assert_eq!(events[2], TurnEvent::Delta("Rev".into()));
        assert!(matches!(&events[3], TurnEvent::PayloadUpdated { key, .. } if key == "metrics"));
        assert_eq!(events[4], TurnEvent::Delta("enue".into()));
        assert!(matches!(&events[5], TurnEvent::Reconciled(m) if m.content == "Revenue was 4.2M"));
        assert_eq!(events.len(), 6);

        let data = outcome.message().unwrap().data.clone().unwrap();
        assert_eq!(data.get("metrics"), Some(&json!({"revenue": 4.2})));
        assert_eq!(data.get("status"), Some(&json!("success")));
    }

    #[tokio::test]
    async fn chunking_does_not_change_the_answer() {
        let body = concat!(
            "data: {\"type\": \"token\", \"data\": \"Q3 \"}\n\n",
            "data: {\"type\": \"token\", \"data\": \"was strong\"}\n\n",
        );
        let d = streaming(ScriptedMockService::new().with_stream(StreamScript::raw(body.as_bytes(), 3)));

        let outcome = d.submit("s", "q", None).await.unwrap();
        assert_eq!(outcome.message().unwrap().content, "Q3 was strong");
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped_mid_turn() {
        let body = concat!(
            "data: {\"type\": \"token\", \"data\": \"A\"}\n\n",
            "data: {not json}\n\n",
            "data: {\"type\": \"token\", \"data\": \"B\"}\n\n",
        );
        let d = streaming(ScriptedMockService::new().with_stream(StreamScript::raw(body.as_bytes(), 64)));

        let outcome = d.submit("s", "q", None).await.unwrap();
        assert_eq!(outcome.message().unwrap().content, "AB");
    }

    #[tokio::test]
    async fn turn_context_reaches_the_request() {
        let service = Arc::new(ScriptedMockService::new());
        let d = QueryDispatcher::new(service.clone(), DispatchOptions::default());
        let ctx = TurnContext {
            file: Some("revenue.csv".into()),
            group: Some("finance".into()),
            model: Some("gpt-4o-mini".into()),
            ..TurnContext::default()
        };

        d.submit_with("q3", "  trimmed  ", &ctx, None).await.unwrap();
        let reqs = service.recorded_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].question, "trimmed");
        assert_eq!(reqs[0].session_id, "q3");
        assert_eq!(reqs[0].filename.as_deref(), Some("revenue.csv"));
        assert_eq!(reqs[0].group.as_deref(), Some("finance"));
        assert_eq!(d.messages("q3")[0].content, "trimmed");
    }

    // ── Refusals ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_input_changes_nothing() {
        let d = streaming(ScriptedMockService::new());
        assert_eq!(d.submit("s", "   \n", None).await.unwrap_err(), SubmitError::EmptyInput);
        assert!(d.messages("s").is_empty());
        assert_eq!(d.state("s"), TurnState::Idle);
    }

    #[tokio::test]
    async fn second_submit_while_streaming_is_refused() {
        let service = Arc::new(ScriptedMockService::new().with_stream(StreamScript::Hang));
        let observer = Arc::new(SessionRefresher { service: service.clone(), calls: AtomicU32::new(0) });
        let d = Arc::new(
            QueryDispatcher::new(service.clone(), DispatchOptions::default())
                .with_observer(observer.clone()),
        );

        let (tx, rx) = mpsc::channel(16);
        let first = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.submit("s", "What is Q3 revenue?", Some(tx)).await })
        };
        wait_for_state(&d, "s", TurnState::Streaming).await;

        for _ in 0..3 {
            let err = d.submit("s", "again", None).await.unwrap_err();
            assert_eq!(err, SubmitError::TurnInFlight { session: "s".into() });
        }
        assert_eq!(d.messages("s").len(), 2);
        assert!(d.is_pending("s"));

        // Other sessions are unaffected.
        let other = d.submit("t", "hello", None).await.unwrap();
        assert!(other.is_reconciled());
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);

        first.abort();
        let _ = first.await;
        assert_eq!(d.state("s"), TurnState::RolledBack);
        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "Error: request cancelled");

        // The cancelled turn is a terminal transition like any other.
        for _ in 0..100 {
            if observer.calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(observer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            drain(rx).last(),
            Some(&TurnEvent::RolledBack {
                failure: TurnFailure::Cancelled,
                rollback: Rollback::ErrorShown,
            })
        );
    }

    #[tokio::test]
    async fn history_operations_are_refused_while_pending() {
        let service = ScriptedMockService::new().with_stream(StreamScript::Hang);
        let d = Arc::new(streaming(service));
        let task = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.submit("s", "q", None).await })
        };
        wait_for_state(&d, "s", TurnState::Streaming).await;

        assert!(matches!(d.load_history("s").await, Err(HistoryError::TurnInFlight { .. })));
        assert!(matches!(d.clear_history("s").await, Err(HistoryError::TurnInFlight { .. })));
        assert_eq!(d.messages("s").len(), 2);
        task.abort();
    }

    // ── Rollback ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn transport_failure_leaves_user_message_and_visible_error() {
        let service = ScriptedMockService::new()
            .with_stream(StreamScript::Fail(ServiceError::Transport("connection refused".into())));
        let d = streaming(service);

        let outcome = d.submit("s", "What is Q3 revenue?", None).await.unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::RolledBack { rollback: Rollback::ErrorShown, .. }
        ));

        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].content, "What is Q3 revenue?");
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs[1].content.starts_with("Error:"));
        assert!(msgs[1].content.contains("connection refused"));
        assert_eq!(d.state("s"), TurnState::RolledBack);
    }

    #[tokio::test]
    async fn single_shot_server_error_shows_detail() {
        let service = ScriptedMockService::new().with_query_error(ServiceError::Status {
            status: 500,
            detail: "No files found for group: hr".into(),
        });
        let d = single_shot(service);

        d.submit("s", "headcount?", None).await.unwrap();
        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].content.contains("No files found for group: hr"));
    }

    #[tokio::test]
    async fn pre_transport_failure_reverts_whole_turn() {
        let service = ScriptedMockService::new()
            .with_answer("earlier answer")
            .with_query_error(ServiceError::Request("invalid base URL".into()));
        let d = single_shot(service);

        d.submit("s", "earlier", None).await.unwrap();
        let outcome = d.submit("s", "doomed", None).await.unwrap();

        assert!(matches!(outcome, TurnOutcome::RolledBack { rollback: Rollback::Reverted, .. }));
        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "earlier answer");
        assert_eq!(d.state("s"), TurnState::RolledBack);
    }

    #[tokio::test]
    async fn error_event_rolls_back_streamed_text() {
        let script = StreamScript::events(&[
            StreamEvent::new("token", json!("partial")),
            StreamEvent::new("error", json!("LLM quota exceeded")),
            StreamEvent::new("token", json!("never applied")),
        ]);
        let d = streaming(ScriptedMockService::new().with_stream(script));

        let outcome = d.submit("s", "q", None).await.unwrap();
        assert_eq!(outcome.failure(), Some(&TurnFailure::Remote("LLM quota exceeded".into())));
        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "Error: LLM quota exceeded");
    }

    #[tokio::test]
    async fn mid_stream_transport_error_is_a_failure() {
        let frame = b"data: {\"type\": \"token\", \"data\": \"Rev\"}\n\n".to_vec();
        let script = StreamScript::Chunks(vec![
            Ok(frame),
            Err(ServiceError::Transport("connection reset".into())),
        ]);
        let d = streaming(ScriptedMockService::new().with_stream(script));
        let (tx, rx) = mpsc::channel(64);

        let outcome = d.submit("s", "q", Some(tx)).await.unwrap();
        assert!(matches!(outcome.failure(), Some(TurnFailure::Transport(_))));

        let events = drain(rx);
        assert_eq!(events[1], TurnEvent::Delta("Rev".into()));
        assert!(matches!(events.last(), Some(TurnEvent::RolledBack { rollback: Rollback::ErrorShown, .. })));
        assert_eq!(d.messages("s").len(), 2);
    }

    #[tokio::test]
    async fn stream_without_done_keeps_tokens_or_fails_when_empty() {
        let service = ScriptedMockService::new()
            .with_stream(StreamScript::events(&[StreamEvent::new("token", json!("just tokens"))]))
            .with_stream(StreamScript::events(&[StreamEvent::new("status", json!("thinking"))]));
        let d = streaming(service);

        let kept = d.submit("s", "a", None).await.unwrap();
        assert_eq!(kept.message().unwrap().content, "just tokens");

        let empty = d.submit("s", "b", None).await.unwrap();
        assert_eq!(empty.failure(), Some(&TurnFailure::EmptyResponse));
        assert_eq!(d.messages("s").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_stream_times_out_when_configured() {
        let service = ScriptedMockService::new().with_stream(StreamScript::Hang);
        let options = DispatchOptions {
            turn_timeout: Some(Duration::from_secs(30)),
            ..DispatchOptions::default()
        };
        let d = QueryDispatcher::new(Arc::new(service), options);

        let start = tokio::time::Instant::now();
        let outcome = d.submit("s", "q", None).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(outcome.failure(), Some(&TurnFailure::TimedOut(Duration::from_secs(30))));
        assert_eq!(d.messages("s").len(), 2);
        assert!(!d.is_pending("s"));
    }

    // ── Observer ──────────────────────────────────────────────────────────────

    struct SessionRefresher {
        service: Arc<ScriptedMockService>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TurnObserver for SessionRefresher {
        async fn turn_completed(&self, _session: &str, _outcome: &TurnOutcome) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.service.list_sessions().await;
        }
    }

    #[tokio::test]
    async fn observer_sees_every_terminal_transition() {
        let service = Arc::new(
            ScriptedMockService::new()
                .with_answer("ok")
                .with_query_error(ServiceError::Transport("down".into()))
                .with_sessions(&["s"]),
        );
        let observer = Arc::new(SessionRefresher { service: service.clone(), calls: AtomicU32::new(0) });
        let options = DispatchOptions { stream: false, ..DispatchOptions::default() };
        let d = QueryDispatcher::new(service.clone(), options).with_observer(observer.clone());

        d.submit("s", "one", None).await.unwrap();
        d.submit("s", "two", None).await.unwrap();
        let _ = d.submit("s", "", None).await;

        assert_eq!(observer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.session_list_calls(), 2);
    }

    // ── History ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn load_then_clear_history() {
        let service = ScriptedMockService::new().with_history(
            "q3",
            vec![
                HistoryEntry { role: Role::User, content: "What is Q3 revenue?".into() },
                HistoryEntry { role: Role::Assistant, content: "4.2M".into() },
            ],
        );
        let d = streaming(service);

        assert_eq!(d.load_history("q3").await.unwrap(), 2);
        let msgs = d.messages("q3");
        assert_eq!(msgs[1].content, "4.2M");
        assert!(msgs[0].order < msgs[1].order);

        d.clear_history("q3").await.unwrap();
        assert!(d.messages("q3").is_empty());
        assert_eq!(d.load_history("q3").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_finished_during_history_fetch_is_kept() {
        let service = ScriptedMockService::new()
            .with_history("s", vec![HistoryEntry { role: Role::User, content: "old".into() }])
            .with_history_delay(Duration::from_secs(5))
            .with_stream(StreamScript::answer(&["new"], "new answer"));
        let d = Arc::new(streaming(service));

        let load = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.load_history("s").await })
        };
        tokio::task::yield_now().await;

        let outcome = d.submit("s", "fresh question", None).await.unwrap();
        assert!(outcome.is_reconciled());

        let result = load.await.unwrap();
        assert_eq!(result, Err(HistoryError::Changed { session: "s".into() }));
        let msgs = d.messages("s");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "fresh question");
        assert_eq!(msgs[1].content, "new answer");
    }
}

#[cfg(test)]
mod poller_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tally_service::{JobStatus, ScriptedMockService, ServiceError, UploadAccepted, UploadJob};
    use tokio::sync::mpsc;

    use crate::{JobError, JobOutcome, JobPoller, PollPolicy, Sleeper};

    fn status(status: JobStatus, progress: u8) -> Result<UploadJob, ServiceError> {
        let mut job = UploadJob::queued("b7f3");
        job.status = status;
        job.progress = progress;
        Ok(job)
    }

    /// Counts waits without waiting.
    #[derive(Default)]
    struct CountingSleeper {
        sleeps: AtomicU32,
    }

    #[async_trait]
    impl Sleeper for CountingSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn poller(service: Arc<ScriptedMockService>) -> (JobPoller, Arc<CountingSleeper>) {
        let sleeper = Arc::new(CountingSleeper::default());
        let poller = JobPoller::new(service, PollPolicy::default()).with_sleeper(sleeper.clone());
        (poller, sleeper)
    }

    #[tokio::test]
    async fn completes_after_exactly_four_polls() {
        let mut done = UploadJob::queued("b7f3");
        done.status = JobStatus::Completed;
        done.progress = 100;
        done.result = Some(json!({"filename": "revenue.csv", "chunks": 10}));
        let service = Arc::new(ScriptedMockService::new().with_statuses(vec![
            status(JobStatus::Queued, 0),
            status(JobStatus::Processing, 40),
            status(JobStatus::Processing, 80),
            Ok(done),
        ]));
        let (poller, sleeper) = poller(service.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let outcome = poller.poll("b7f3", Some(tx)).await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.attempts(), 4);
        assert_eq!(service.status_polls(), 4);
        assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.result(), Some(&json!({"filename": "revenue.csv", "chunks": 10})));

        let mut progress = Vec::new();
        while let Ok(p) = rx.try_recv() {
            progress.push(p.progress);
        }
        assert_eq!(progress, vec![0, 40, 80]);
    }

    #[tokio::test]
    async fn failed_job_returns_error_verbatim_without_repolling() {
        let mut failed = UploadJob::queued("b7f3");
        failed.status = JobStatus::Failed;
        failed.error = Some("Sheet 'Q3' has no header row".into());
        let service = Arc::new(ScriptedMockService::new().with_statuses(vec![
            status(JobStatus::Processing, 10),
            Ok(failed),
        ]));
        let (poller, _) = poller(service.clone());

        let outcome = poller.poll("b7f3", None).await;
        assert_eq!(outcome.error(), Some(JobError::Failed("Sheet 'Q3' has no header row".into())));
        assert_eq!(service.status_polls(), 2);
    }

    #[tokio::test]
    async fn transport_error_is_immediately_terminal() {
        let service = Arc::new(ScriptedMockService::new().with_statuses(vec![
            status(JobStatus::Processing, 10),
            Err(ServiceError::Transport("connection reset".into())),
            status(JobStatus::Completed, 100),
        ]));
        let (poller, _) = poller(service.clone());

        let outcome = poller.poll("b7f3", None).await;
        assert!(matches!(outcome, JobOutcome::TransportFailed { attempts: 2, .. }));
        assert_eq!(service.status_polls(), 2);
    }

    #[tokio::test]
    async fn never_terminal_job_stops_at_attempt_bound() {
        let service = Arc::new(
            ScriptedMockService::new().with_statuses(vec![status(JobStatus::Processing, 50)]),
        );
        let (poller, sleeper) = poller(service.clone());

        let outcome = poller.poll("b7f3", None).await;
        match &outcome {
            JobOutcome::TimedOut { attempts, last, .. } => {
                assert_eq!(*attempts, 60);
                assert_eq!(last.as_ref().map(|j| j.progress), Some(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(service.status_polls(), 60);
        assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_takes_sixty_seconds_of_virtual_time() {
        let service = Arc::new(
            ScriptedMockService::new().with_statuses(vec![status(JobStatus::Queued, 0)]),
        );
        let poller = JobPoller::new(service.clone(), PollPolicy::default());

        let start = tokio::time::Instant::now();
        let outcome = poller.poll("b7f3", None).await;

        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(outcome.error(), Some(JobError::Timeout { attempts: 60 }));
        assert_eq!(service.status_polls(), 60);
    }

    #[tokio::test]
    async fn upload_and_poll_follows_the_returned_job() {
        let service = Arc::new(
            ScriptedMockService::new()
                .with_upload_result(Ok(UploadAccepted { job_id: "b7f3".into(), message: None }))
                .with_statuses(vec![status(JobStatus::Completed, 100)]),
        );
        let (poller, _) = poller(service.clone());

        let outcome = poller
            .upload_and_poll(std::path::Path::new("revenue.csv"), None)
            .await
            .unwrap();
        match outcome {
            JobOutcome::Completed { job, attempts } => {
                assert_eq!(job.job_id, "b7f3");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_upload_is_an_error() {
        let service = Arc::new(ScriptedMockService::new().with_upload_result(Err(
            ServiceError::Status { status: 400, detail: "Only .xlsx and .csv files are allowed".into() },
        )));
        let (poller, _) = poller(service.clone());

        let err = poller.upload_and_poll(std::path::Path::new("notes.txt"), None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 400, .. }));
        assert_eq!(service.status_polls(), 0);
    }
}
