// Runner: the top-level orchestrator. Loads settings, builds the component
// graph, owns the broker session and its reconnect loop, and shuts the worker
// down gracefully.

use anyhow::{Context, Result};
use builder_common::constants::{return_code, WORKER_NAME};
use builder_common::host_context::{config_file_in, default_root_directory};
use builder_common::tracing::error_chain;
use builder_common::{
    resolve_builder_id, BuilderSettings, ConfigError, ConfigurationStore, ConnectionState,
    Credentials, HostContext, IdentityError, IdentityInputs, ShutdownReason, Tracing,
    WellKnownConfigFile, CURRENT_PLATFORM,
};
use builder_sdk::TraceWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerConnection, BrokerSender, ConnectError, MessageSink};
use crate::build_runner::{BuildRunner, BuildRunnerConfig, SPAWN_RETRY_DELAY};
use crate::command_settings::CommandSettings;
use crate::error_throttler::{ErrorThrottler, Throttle};
use crate::event_publisher::EventPublisher;
use crate::job_dispatcher::JobDispatcher;
use crate::keepalive::KeepaliveResponder;
use crate::message_listener::MessageListener;
use crate::worker_pool::WorkerPool;

/// How long running builds get to finish once shutdown starts.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// How long to wait for the broker's receipt of DISCONNECT.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Settings file, then environment overrides, then `--home`; validated.
pub fn load_settings<F>(command: &CommandSettings, env_lookup: F) -> Result<BuilderSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let config_path = command
        .get_config()
        .unwrap_or_else(|| config_file_in(&default_root_directory(), WellKnownConfigFile::Builder));
    let store = ConfigurationStore::new(config_path);
    if !store.is_configured() {
        tracing::info!(
            "No settings file at {}; using defaults and environment",
            store.config_file_path().display()
        );
    }

    let mut settings = store.get_settings()?;
    settings.apply_env_overrides(env_lookup)?;
    if let Some(home) = command.get_home() {
        settings.packagebuilder_home = Some(home);
    }
    settings.validate()?;
    Ok(settings)
}

/// Load settings, resolve the builder identity and create the host context.
pub fn load_context(command: &CommandSettings) -> Result<Arc<HostContext>, StartupError> {
    let settings = load_settings(command, |name| std::env::var(name).ok())?;
    let inputs = IdentityInputs::detect(settings.builder_host.clone())?;
    let builder_id = resolve_builder_id(&inputs)?;
    Ok(HostContext::new(settings, builder_id, inputs.node_name))
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

pub struct Runner {
    context: Arc<HostContext>,
    trace: Tracing,
    shutdown_grace: Duration,
}

impl Runner {
    pub fn new(context: Arc<HostContext>) -> Self {
        let trace = context.get_trace("Runner");
        Self {
            context,
            trace,
            shutdown_grace: SHUTDOWN_GRACE_PERIOD,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Print the effective configuration. Fails when the build program is missing.
    pub fn check(&self) -> Result<i32> {
        let settings = self.context.settings();
        let build_program = settings.build_program(self.context.builder_id(), CURRENT_PLATFORM)?;
        let jobs_root = settings.jobs_root()?;
        let credentials = settings.broker_credentials()?;

        println!("Builder id:    {}", self.context.builder_id());
        println!("Host name:     {}", self.context.host_name());
        println!(
            "Broker:        {}:{} ({}, {})",
            settings.broker_host,
            settings.broker_port,
            settings.environment,
            match credentials {
                Some(ref c) => format!("login '{}'", c.username),
                None => "no credentials".to_string(),
            }
        );
        println!("Jobs topic:    {} (ack {})", settings.topics.jobs, settings.ack_mode.as_header());
        println!("Events topic:  {}", settings.topics.events);
        println!(
            "Keepalive:     {} -> {}",
            settings.topics.keepalive, settings.topics.keepalive_response
        );
        println!("Jobs root:     {}", jobs_root.display());
        println!(
            "Workers:       {} (queue {})",
            settings.max_concurrent_jobs, settings.job_queue_capacity
        );
        println!("Build program: {}", build_program.display());

        if build_program.is_file() {
            Ok(return_code::SUCCESS)
        } else {
            println!("Build program does not exist.");
            Ok(return_code::CONFIGURATION_ERROR)
        }
    }

    /// Run until shutdown. Installs Ctrl-C and SIGTERM handlers first.
    pub async fn run_async(&self) -> Result<i32> {
        self.install_signal_handlers();
        self.run_message_loop().await
    }

    fn install_signal_handlers(&self) {
        let context = self.context.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Cannot listen for Ctrl-C: {e}");
                return;
            }
            tracing::info!("Ctrl-C received, shutting down");
            context.shutdown(ShutdownReason::UserCancelled);
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let context = self.context.clone();
            tokio::spawn(async move {
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        tracing::warn!("Cannot listen for SIGTERM: {e}");
                        return;
                    }
                };
                sigterm.recv().await;
                tracing::info!("SIGTERM received, shutting down");
                context.shutdown(ShutdownReason::OperatingSystemShutdown);
            });
        }
    }

    /// Connect, subscribe and serve frames until shutdown or until the broker
    /// is given up on. The initial connection failure is returned as an error.
    pub async fn run_message_loop(&self) -> Result<i32> {
        let settings = self.context.settings();
        let credentials = settings.broker_credentials()?;
        let jobs_root = settings.jobs_root()?;
        let build_program = settings.build_program(self.context.builder_id(), CURRENT_PLATFORM)?;
        let working_directory = settings
            .packagebuilder_home
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        self.trace.info(&format!(
            "Builder {} on {}: jobs in {}, build program {}",
            self.context.builder_id(),
            self.context.host_name(),
            jobs_root.display(),
            build_program.display()
        ));
        if !build_program.is_file() {
            self.trace.warning(&format!(
                "Build program {} does not exist; jobs will fail to start",
                build_program.display()
            ));
        }

        let sender = BrokerSender::new();
        let sink: Arc<dyn MessageSink> = Arc::new(sender.clone());

        let build_runner = BuildRunner::new(
            BuildRunnerConfig {
                builder_id: self.context.builder_id().to_string(),
                jobs_root,
                build_program,
                working_directory,
                spawn_attempts: settings.spawn_attempts,
                spawn_retry_delay: SPAWN_RETRY_DELAY,
            },
            EventPublisher::new(sink.clone(), settings.topics.events.as_str()),
            Arc::new(self.context.get_trace("BuildRunner")),
        );
        let pool = WorkerPool::start(
            settings.max_concurrent_jobs,
            settings.job_queue_capacity,
            Arc::new(build_runner),
            Arc::new(self.context.get_trace("WorkerPool")),
        );
        let listener = MessageListener::new(
            settings.topics.clone(),
            settings.ack_mode,
            sink.clone(),
            KeepaliveResponder::new(
                sink.clone(),
                settings.topics.keepalive_response.as_str(),
                self.context.host_name(),
                WORKER_NAME,
            ),
            JobDispatcher::new(pool.handle(), Arc::new(self.context.get_trace("JobDispatcher"))),
            Arc::new(self.context.get_trace("MessageListener")),
        );

        self.context.set_connection_state(ConnectionState::Connecting);
        let connection = match self.open_session(&sender, credentials.as_ref()).await {
            Ok(connection) => connection,
            Err(e) => {
                pool.shutdown(Duration::ZERO).await;
                self.context.set_connection_state(ConnectionState::Closed);
                return Err(anyhow::Error::new(e).context("Could not connect to the broker"));
            }
        };

        let (exit_code, connection) = self
            .serve(connection, &sender, credentials.as_ref(), &listener)
            .await;

        drop(listener);
        match self.context.shutdown_reason() {
            Some(reason) => self.trace.info(&format!("Shutting down for {reason}")),
            None => self.trace.warning("Shutting down after losing the broker"),
        }
        let stats = pool.stats();
        self.trace.info(&format!("Stopping job workers ({stats})"));
        pool.shutdown(self.shutdown_grace).await;

        if let Some(connection) = connection {
            if let Err(e) = connection.disconnect(DISCONNECT_TIMEOUT).await {
                self.trace.warning(&format!("Failed to disconnect cleanly: {e}"));
            }
        }
        sender.detach().await;
        self.context.set_connection_state(ConnectionState::Closed);

        Ok(exit_code)
    }

    /// Pump frames, reconnecting after a dropped session. Returns the exit
    /// code and the live session, if any, for a clean DISCONNECT.
    async fn serve(
        &self,
        mut connection: BrokerConnection,
        sender: &BrokerSender,
        credentials: Option<&Credentials>,
        listener: &MessageListener,
    ) -> (i32, Option<BrokerConnection>) {
        let shutdown = self.context.shutdown_token();
        let mut throttler = ErrorThrottler::with_max_attempts(self.context.settings().max_reconnect_attempts);

        loop {
            self.context.set_connection_state(ConnectionState::Connected);
            throttler.reset();

            match self.pump(&mut connection, listener, &shutdown).await {
                SessionEnd::Shutdown => return (return_code::SUCCESS, Some(connection)),
                SessionEnd::Dropped(reason) => {
                    sender.detach().await;
                    self.context.set_connection_state(ConnectionState::Disconnected);
                    self.trace
                        .warning(&format!("Lost the broker session: {reason}"));
                }
            }

            match self
                .reconnect(sender, credentials, &mut throttler, &shutdown)
                .await
            {
                Some(next) => connection = next,
                None if shutdown.is_cancelled() => return (return_code::SUCCESS, None),
                None => return (return_code::TERMINATED_ERROR, None),
            }
        }
    }

    async fn pump(
        &self,
        connection: &mut BrokerConnection,
        listener: &MessageListener,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                frame = connection.next_frame() => frame,
            };
            match frame {
                Ok(Some(frame)) => listener.on_frame(&frame).await,
                Ok(None) => return SessionEnd::Dropped("broker closed the connection".to_string()),
                Err(e) => return SessionEnd::Dropped(e.to_string()),
            }
        }
    }

    async fn reconnect(
        &self,
        sender: &BrokerSender,
        credentials: Option<&Credentials>,
        throttler: &mut ErrorThrottler,
        shutdown: &CancellationToken,
    ) -> Option<BrokerConnection> {
        loop {
            match throttler.wait(shutdown).await {
                Throttle::Ready => {}
                Throttle::Cancelled => return None,
                Throttle::Exhausted => {
                    self.trace.error(&format!(
                        "Giving up on the broker after {} reconnect attempt(s)",
                        throttler.attempts()
                    ));
                    return None;
                }
            }

            self.context.set_connection_state(ConnectionState::Connecting);
            match self.open_session(sender, credentials).await {
                Ok(connection) => {
                    self.trace.info(&format!(
                        "Reconnected to the broker after {} attempt(s)",
                        throttler.attempts()
                    ));
                    return Some(connection);
                }
                Err(e) => {
                    self.context.set_connection_state(ConnectionState::Disconnected);
                    self.trace.warning(&format!(
                        "Reconnect attempt {} failed: {}",
                        throttler.attempts(),
                        error_chain(&e)
                    ));
                }
            }
        }
    }

    async fn open_session(
        &self,
        sender: &BrokerSender,
        credentials: Option<&Credentials>,
    ) -> Result<BrokerConnection, ConnectError> {
        let settings = self.context.settings();
        self.trace.info(&format!(
            "Connecting to broker at {}:{} ({})",
            settings.broker_host,
            settings.broker_port,
            if credentials.is_some() {
                "with credentials"
            } else {
                "without credentials"
            }
        ));

        let connection = BrokerConnection::connect(
            &settings.broker_host,
            settings.broker_port,
            credentials,
            Duration::from_secs(settings.connect_timeout_secs),
            sender,
        )
        .await?;

        for topic in [&settings.topics.jobs, &settings.topics.keepalive] {
            if let Err(e) = connection.subscribe(topic, settings.ack_mode).await {
                sender.detach().await;
                return Err(e);
            }
        }

        self.trace.info(&format!(
            "Connected to {}{}; subscribed to {} and {}",
            connection.address(),
            connection
                .server()
                .map(|s| format!(" ({s})"))
                .unwrap_or_default(),
            settings.topics.jobs,
            settings.topics.keepalive
        ));
        Ok(connection)
    }
}

/// Map a startup failure to a process exit code, logging it.
pub fn startup_failure(err: &StartupError) -> i32 {
    tracing::error!("{}", error_chain(err));
    return_code::CONFIGURATION_ERROR
}

/// Used by `main` for anything that escapes `Runner`.
pub fn fatal(err: &anyhow::Error) -> i32 {
    tracing::error!("{:#}", err);
    return_code::TERMINATED_ERROR
}

/// Convenience for `main`: parse, load and run.
pub async fn execute_command(command: &CommandSettings) -> i32 {
    let context = match load_context(command) {
        Ok(context) => context,
        Err(e) => return startup_failure(&e),
    };
    let runner = Runner::new(context);

    let result = if command.is_check() {
        runner.check()
    } else {
        runner.run_async().await
    };
    result
        .context("builder-listener stopped")
        .unwrap_or_else(|e| fatal(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{StompCommand, StompFrame};
    use crate::test_support::{expect_frame, message, FakeBroker};
    use builder_common::AckMode;
    use futures::SinkExt;
    use std::collections::HashMap;
    use std::path::Path;

    fn settings(home: &Path, port: u16) -> BuilderSettings {
        BuilderSettings {
            broker_host: "127.0.0.1".to_string(),
            broker_port: port,
            environment: "production".to_string(),
            packagebuilder_home: Some(home.to_path_buf()),
            connect_timeout_secs: 5,
            ..BuilderSettings::default()
        }
    }

    fn runner(settings: BuilderSettings) -> (Arc<HostContext>, Runner) {
        let context = HostContext::new(settings, "linux1", "linux1.local");
        let runner = Runner::new(context.clone()).with_shutdown_grace(Duration::from_secs(5));
        (context, runner)
    }

    #[test]
    fn load_settings_layers_file_env_and_home() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("settings.json");
        std::fs::write(
            &config,
            r#"{"broker_host":"mq.example.org","packagebuilder_home":"/from/file","max_concurrent_jobs":2}"#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = [("SPB_ENVIRONMENT", "production"), ("BROKER_PORT", "61999")]
            .into_iter()
            .collect();
        let command = CommandSettings::parse_from(&[
            "--config".to_string(),
            config.display().to_string(),
            "--home".to_string(),
            "/from/cli".to_string(),
        ]);

        let settings = load_settings(&command, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.broker_host, "mq.example.org");
        assert_eq!(settings.broker_port, 61999);
        assert_eq!(settings.max_concurrent_jobs, 2);
        assert_eq!(settings.packagebuilder_home, Some(PathBuf::from("/from/cli")));
        assert!(settings.is_production());
    }

    #[test]
    fn load_settings_requires_credentials_outside_production() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSettings::parse_from(&[
            "--config".to_string(),
            dir.path().join("missing.json").display().to_string(),
            "--home".to_string(),
            dir.path().display().to_string(),
        ]);
        let err = load_settings(&command, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredentials));
    }

    #[tokio::test]
    async fn initial_connect_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let port = FakeBroker::bind().await.port();
        let (context, runner) = runner(settings(dir.path(), port));

        let err = runner.run_message_loop().await.unwrap_err();
        assert!(format!("{err:#}").contains("Could not connect to the broker"));
        assert_eq!(context.connection_state(), ConnectionState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serves_keepalive_and_jobs_then_disconnects_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        crate::test_support::write_script(dir.path(), "linux1.sh", "true");
        let broker = FakeBroker::bind().await;
        let (context, runner) = runner(settings(dir.path(), broker.port()));
        let run = tokio::spawn(async move { runner.run_message_loop().await });

        let (mut stream, connect) = broker.accept_session().await;
        assert_eq!(connect.get_header("login"), None);
        let mut subscribed = vec![
            expect_frame(&mut stream, StompCommand::Subscribe).await,
            expect_frame(&mut stream, StompCommand::Subscribe).await,
        ]
        .into_iter()
        .map(|f| f.destination().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
        subscribed.sort();
        assert_eq!(subscribed, vec!["/topic/buildjobs", "/topic/keepalive"]);

        stream.send(message("/topic/keepalive", "")).await.unwrap();
        let response = expect_frame(&mut stream, StompCommand::Send).await;
        assert_eq!(response.destination(), Some("/topic/keepalive_response"));

        let body = r#"{"job_id":"j1","bioc_version":"3.1","client_id":"c1"}"#;
        stream.send(message("/topic/buildjobs", body)).await.unwrap();
        let event = expect_frame(&mut stream, StompCommand::Send).await;
        assert_eq!(event.destination(), Some("/topic/builderevents"));
        assert_eq!(event.get_header("persistent"), Some("true"));
        let json: serde_json::Value = serde_json::from_slice(&event.body).unwrap();
        assert_eq!(json["builder_id"], "linux1");
        assert_eq!(json["job_id"], "j1");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("jobs/j1/manifest.json")).unwrap(),
            body
        );
        assert_eq!(context.connection_state(), ConnectionState::Connected);

        context.shutdown(ShutdownReason::UserCancelled);
        let disconnect = expect_frame(&mut stream, StompCommand::Disconnect).await;
        let receipt = disconnect.get_header("receipt").unwrap_or_default().to_string();
        stream
            .send(StompFrame::new(StompCommand::Receipt).header("receipt-id", receipt))
            .await
            .unwrap();

        assert_eq!(run.await.unwrap().unwrap(), return_code::SUCCESS);
        assert_eq!(context.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnects_after_the_session_drops() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FakeBroker::bind().await;
        let mut settings = settings(dir.path(), broker.port());
        settings.ack_mode = AckMode::Client;
        let (context, runner) = runner(settings);
        let mut states = context.watch_connection_state();
        let run = tokio::spawn(async move { runner.run_message_loop().await });

        let (mut first, _) = broker.accept_session().await;
        expect_frame(&mut first, StompCommand::Subscribe).await;
        expect_frame(&mut first, StompCommand::Subscribe).await;
        drop(first);

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        let (mut second, _) = broker.accept_session().await;
        let subscribe = expect_frame(&mut second, StompCommand::Subscribe).await;
        assert_eq!(subscribe.get_header("ack"), Some("client"));
        expect_frame(&mut second, StompCommand::Subscribe).await;

        second.send(message("/topic/keepalive", "")).await.unwrap();
        let ack = expect_frame(&mut second, StompCommand::Ack).await;
        assert_eq!(ack.get_header("id"), Some("ack-1"));
        expect_frame(&mut second, StompCommand::Send).await;

        context.shutdown(ShutdownReason::OperatingSystemShutdown);
        expect_frame(&mut second, StompCommand::Disconnect).await;
        drop(second);
        assert_eq!(run.await.unwrap().unwrap(), return_code::SUCCESS);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FakeBroker::bind().await;
        let mut settings = settings(dir.path(), broker.port());
        settings.max_reconnect_attempts = 1;
        let (context, runner) = runner(settings);
        let run = tokio::spawn(async move { runner.run_message_loop().await });

        let (mut stream, _) = broker.accept_session().await;
        expect_frame(&mut stream, StompCommand::Subscribe).await;
        expect_frame(&mut stream, StompCommand::Subscribe).await;
        drop(stream);
        drop(broker);

        let exit = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, return_code::TERMINATED_ERROR);
        assert_eq!(context.connection_state(), ConnectionState::Closed);
    }
}
