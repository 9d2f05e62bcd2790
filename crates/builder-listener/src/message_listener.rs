// MessageListener: routes inbound frames. Keepalive probes are answered
// inline; everything else is treated as a job request and handed to the
// dispatcher, which never waits on a build.

use builder_common::{AckMode, Topics};
use builder_sdk::TraceWriter;
use std::sync::Arc;

use crate::broker::connection::error_message;
use crate::broker::{send_within, MessageSink, StompCommand, StompFrame, SEND_TIMEOUT};
use crate::job::FailureKind;
use crate::job_dispatcher::JobDispatcher;
use crate::keepalive::KeepaliveResponder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Keepalive,
    JobRequest,
}

pub struct MessageListener {
    topics: Topics,
    ack_mode: AckMode,
    sink: Arc<dyn MessageSink>,
    keepalive: KeepaliveResponder,
    dispatcher: JobDispatcher,
    trace: Arc<dyn TraceWriter>,
}

impl MessageListener {
    pub fn new(
        topics: Topics,
        ack_mode: AckMode,
        sink: Arc<dyn MessageSink>,
        keepalive: KeepaliveResponder,
        dispatcher: JobDispatcher,
        trace: Arc<dyn TraceWriter>,
    ) -> Self {
        Self {
            topics,
            ack_mode,
            sink,
            keepalive,
            dispatcher,
            trace,
        }
    }

    /// Anything not addressed to the keepalive topic is a job request.
    pub fn route(&self, destination: &str) -> Route {
        if destination == self.topics.keepalive {
            Route::Keepalive
        } else {
            Route::JobRequest
        }
    }

    /// Handle one inbound frame. Never fails: problems are logged and the
    /// frame is dropped.
    pub async fn on_frame(&self, frame: &StompFrame) {
        match frame.command {
            StompCommand::Message => self.on_message(frame).await,
            StompCommand::Error => self
                .trace
                .error(&format!("Broker reported an error: {}", error_message(frame))),
            command => self.trace.verbose(&format!("Ignoring {command} frame")),
        }
    }

    async fn on_message(&self, frame: &StompFrame) {
        self.acknowledge(frame).await;

        let destination = frame.destination().unwrap_or_default();
        match self.route(destination) {
            Route::Keepalive => match self.keepalive.respond().await {
                Ok(()) => self.trace.verbose("Answered keepalive probe"),
                Err(e) => self
                    .trace
                    .warning(&format!("Failed to answer keepalive probe: {e}")),
            },
            Route::JobRequest => {
                let Ok(body) = frame.body_str() else {
                    self.trace.warning(&format!(
                        "Dropping message on {destination}: body is not UTF-8"
                    ));
                    return;
                };
                match self.dispatcher.dispatch(body) {
                    Ok(stats) => self.trace.verbose(&format!("Queued job ({stats})")),
                    Err(e) => match e.kind() {
                        FailureKind::MalformedInput => self
                            .trace
                            .warning(&format!("Dropping message on {destination}: {e}")),
                        _ => self.trace.error(&format!(
                            "{e} ({})",
                            self.dispatcher.stats()
                        )),
                    },
                }
            }
        }
    }

    async fn acknowledge(&self, frame: &StompFrame) {
        if !self.ack_mode.requires_ack() {
            return;
        }
        let Some(ack_id) = frame
            .get_header("ack")
            .or_else(|| frame.get_header("message-id"))
        else {
            self.trace
                .warning("Cannot acknowledge message without an ack or message-id header");
            return;
        };
        if let Err(e) = send_within(SEND_TIMEOUT, self.sink.ack(ack_id)).await {
            self.trace
                .warning(&format!("Failed to acknowledge message {ack_id}: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_runner::{BuildRunner, BuildRunnerConfig};
    use crate::event_publisher::EventPublisher;
    use crate::test_support::{message, wait_for_file, RecordingSink};
    use crate::worker_pool::WorkerPool;
    use builder_sdk::{CollectingTraceWriter, NullTraceWriter, TraceLevel};
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    const JOBS: &str = "/topic/buildjobs";
    const EVENTS: &str = "/topic/builderevents";
    const KEEPALIVE: &str = "/topic/keepalive";
    const KEEPALIVE_RESPONSE: &str = "/topic/keepalive_response";

    struct Harness {
        _dir: tempfile::TempDir,
        home: PathBuf,
        sink: Arc<RecordingSink>,
        trace: Arc<CollectingTraceWriter>,
        pool: WorkerPool,
        listener: MessageListener,
    }

    impl Harness {
        fn new(build_script: &str, ack_mode: AckMode) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let home = dir.path().to_path_buf();
            let program = install_program(&home, build_script);

            let sink = Arc::new(RecordingSink::new());
            let trace = Arc::new(CollectingTraceWriter::new());
            let runner = BuildRunner::new(
                BuildRunnerConfig {
                    builder_id: "linux1".to_string(),
                    jobs_root: home.join("jobs"),
                    build_program: program,
                    working_directory: home.clone(),
                    spawn_attempts: 1,
                    spawn_retry_delay: Duration::from_millis(10),
                },
                EventPublisher::new(sink.clone(), EVENTS),
                Arc::new(NullTraceWriter),
            );
            let pool = WorkerPool::start(2, 8, Arc::new(runner), Arc::new(NullTraceWriter));
            let dispatcher = JobDispatcher::new(pool.handle(), trace.clone());
            let keepalive =
                KeepaliveResponder::new(sink.clone(), KEEPALIVE_RESPONSE, "linux1.local", "builder-listener");
            let listener = MessageListener::new(
                Topics::default(),
                ack_mode,
                sink.clone(),
                keepalive,
                dispatcher,
                trace.clone(),
            );

            Self {
                _dir: dir,
                home,
                sink,
                trace,
                pool,
                listener,
            }
        }
    }

    #[cfg(unix)]
    fn install_program(home: &Path, body: &str) -> PathBuf {
        crate::test_support::write_script(home, "linux1.sh", body)
    }

    #[cfg(not(unix))]
    fn install_program(home: &Path, _body: &str) -> PathBuf {
        home.join("linux1.bat")
    }

    #[tokio::test]
    async fn routes_by_destination() {
        let h = Harness::new("true", AckMode::Auto);
        assert_eq!(h.listener.route(KEEPALIVE), Route::Keepalive);
        assert_eq!(h.listener.route(JOBS), Route::JobRequest);
        assert_eq!(h.listener.route("/topic/other"), Route::JobRequest);
        assert_eq!(h.listener.route(""), Route::JobRequest);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn accepted_job_writes_manifest_and_publishes_one_event() {
        let h = Harness::new("true", AckMode::Auto);
        let body = r#"{"job_id":"j1","bioc_version":"3.1","client_id":"c1"}"#;

        h.listener.on_frame(&message(JOBS, body)).await;

        let events = h.sink.wait_for(EVENTS, 1).await;
        let manifest = h.home.join("jobs/j1/manifest.json");
        assert_eq!(std::fs::read(&manifest).unwrap(), body.as_bytes());
        assert!(h.home.join("jobs/j1/R-libs").is_dir());

        let event = events[0].json();
        assert_eq!(event["first_message"], true);
        assert_eq!(event["job_id"], "j1");
        assert_eq!(event["body"], "Got build request...");
        assert_eq!(events[0].header("persistent"), Some("true"));

        h.pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(h.sink.sent_to(EVENTS).len(), 1);
    }

    #[tokio::test]
    async fn request_without_job_id_leaves_no_trace_but_a_log_line() {
        let h = Harness::new("true", AckMode::Auto);

        h.listener
            .on_frame(&message(JOBS, r#"{"bioc_version":"3.1"}"#))
            .await;
        h.pool.shutdown(Duration::from_secs(5)).await;

        assert!(!h.home.join("jobs").exists());
        assert!(h.sink.sent().is_empty());
        assert_eq!(h.trace.count(TraceLevel::Warning), 1);
        assert!(h.trace.contains(TraceLevel::Warning, "missing job_id"));
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_and_loop_keeps_serving() {
        let h = Harness::new("true", AckMode::Auto);

        h.listener.on_frame(&message(JOBS, "not-json")).await;
        h.listener.on_frame(&message(KEEPALIVE, "")).await;

        assert!(!h.home.join("jobs").exists());
        assert!(h.sink.sent_to(EVENTS).is_empty());
        assert_eq!(h.sink.sent_to(KEEPALIVE_RESPONSE).len(), 1);
        assert!(h.trace.contains(TraceLevel::Warning, "body is not JSON"));
    }

    #[tokio::test]
    async fn keepalive_probe_gets_exactly_one_response() {
        let h = Harness::new("true", AckMode::Auto);

        h.listener
            .on_frame(&message(KEEPALIVE, "this is not json either"))
            .await;

        let responses = h.sink.sent_to(KEEPALIVE_RESPONSE);
        assert_eq!(responses.len(), 1);
        let body = responses[0].json();
        assert_eq!(body["host"], "linux1.local");
        assert_eq!(body["script"], "builder-listener");
        assert!(h.sink.sent_to(EVENTS).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn keepalive_is_prompt_while_a_build_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let release = dir.path().join("release");
        let started = dir.path().join("started");
        let script = format!(
            "touch '{}'; while [ ! -f '{}' ]; do sleep 0.05; done",
            started.display(),
            release.display()
        );
        let h = Harness::new(&script, AckMode::Auto);

        h.listener
            .on_frame(&message(JOBS, r#"{"job_id":"long","bioc_version":"3.1"}"#))
            .await;
        wait_for_file(&started).await;
        assert_eq!(h.pool.stats().running, 1);

        let begin = Instant::now();
        h.listener.on_frame(&message(KEEPALIVE, "")).await;
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert_eq!(h.sink.sent_to(KEEPALIVE_RESPONSE).len(), 1);
        assert_eq!(h.pool.stats().running, 1);

        std::fs::write(&release, "").unwrap();
        h.pool.shutdown(Duration::from_secs(5)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_jobs_keep_to_their_own_workspace() {
        let h = Harness::new(r#"echo "manifest=$1"; sleep 0.2; echo "version=$2""#, AckMode::Auto);

        h.listener
            .on_frame(&message(JOBS, r#"{"job_id":"ja","bioc_version":"3.18"}"#))
            .await;
        h.listener
            .on_frame(&message(JOBS, r#"{"job_id":"jb","bioc_version":"3.19"}"#))
            .await;
        h.sink.wait_for(EVENTS, 2).await;
        h.pool.shutdown(Duration::from_secs(10)).await;

        for (id, version, other) in [("ja", "3.18", "jb"), ("jb", "3.19", "ja")] {
            let job_dir = h.home.join("jobs").join(id);
            let manifest = std::fs::read_to_string(job_dir.join("manifest.json")).unwrap();
            assert!(manifest.contains(id));
            assert!(!manifest.contains(other));

            let log = std::fs::read_to_string(job_dir.join("builder.log")).unwrap();
            assert!(log.contains(&format!("jobs/{id}/manifest.json")), "{log}");
            assert!(log.contains(&format!("version={version}")), "{log}");
            assert!(!log.contains(&format!("jobs/{other}/")), "{log}");
        }
    }

    #[tokio::test]
    async fn client_ack_mode_acknowledges_on_receipt() {
        let h = Harness::new("true", AckMode::ClientIndividual);
        h.listener.on_frame(&message(JOBS, "not-json")).await;
        h.listener.on_frame(&message(KEEPALIVE, "")).await;
        assert_eq!(h.sink.acks(), vec!["ack-1", "ack-1"]);

        let auto = Harness::new("true", AckMode::Auto);
        auto.listener.on_frame(&message(KEEPALIVE, "")).await;
        assert!(auto.sink.acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_ack_does_not_hold_up_keepalive() {
        let h = Harness::new("true", AckMode::ClientIndividual);
        h.sink.stall_acks();

        let started = tokio::time::Instant::now();
        h.listener.on_frame(&message(KEEPALIVE, "")).await;

        assert!(started.elapsed() <= SEND_TIMEOUT + Duration::from_secs(1));
        assert_eq!(h.sink.sent_to(KEEPALIVE_RESPONSE).len(), 1);
        assert!(h.trace.contains(TraceLevel::Warning, "Failed to acknowledge message ack-1"));
    }

    #[tokio::test]
    async fn broker_error_frame_is_logged() {
        let h = Harness::new("true", AckMode::Auto);
        let frame = StompFrame::new(StompCommand::Error).header("message", "queue quota exceeded");
        h.listener.on_frame(&frame).await;
        assert!(h.trace.contains(TraceLevel::Error, "queue quota exceeded"));
        assert!(h.sink.sent().is_empty());
    }
}
