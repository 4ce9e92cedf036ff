//! A single monitor: one probe, one failure counter, one state machine.
//!
//! Monitors come in two shapes. Check-type monitors poll a probe on an
//! interval; the probe must produce an outcome in every case, including its
//! own errors. Watch-type monitors hold a server stream open and treat every
//! receive error (end-of-stream included) as one failed observation, then
//! re-open the stream after the configured retry sleep.
//!
//! The failure counter is mutated in exactly one place, [`Monitor::record`]:
//! a failure increments it, a success resets it to zero. Crossing the
//! threshold flips the state to unhealthy; a reset flips it to healthy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, StatusPayload, WatchStream};
use crate::config::HealthConfig;
use crate::metrics;
use crate::provider::cache::PodKey;
use k8s_openapi::api::core::v1::PodStatus;

/// What a monitor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// The agent's own gRPC channel and health service.
    AgentChannel,
    /// The application the agent launched for the pod.
    Application,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::AgentChannel => write!(f, "agent-channel"),
            Subject::Application => write!(f, "application"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// What one probe execution observed.
#[derive(Debug, Default)]
pub struct ProbeOutcome {
    pub failed: bool,
    pub message: String,
    pub pod_status: Option<PodStatus>,
}

impl ProbeOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            failed: false,
            message: message.into(),
            pod_status: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            failed: true,
            message: message.into(),
            pod_status: None,
        }
    }

    pub fn with_status(mut self, pod_status: Option<PodStatus>) -> Self {
        self.pod_status = pod_status;
        self
    }
}

/// A polling probe. Must not fail: errors become failed outcomes.
#[async_trait]
pub trait CheckProbe: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}

/// Produces a fresh watch stream each time the monitor (re)connects.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn WatchStream>, AgentError>;
}

/// The two monitor shapes.
pub enum Probe {
    Check(Arc<dyn CheckProbe>),
    Watch(Arc<dyn StreamFactory>),
}

struct MonitorStatus {
    failures: u32,
    state: MonitoringState,
    is_monitoring: bool,
}

pub struct Monitor {
    subject: Subject,
    name: String,
    pod_key: PodKey,
    probe: Probe,
    config: HealthConfig,
    status: RwLock<MonitorStatus>,
}

/// One observation, routed to the check handler. Carries its monitor so the
/// handler can branch on the state the result produced.
pub struct CheckResult {
    pub monitor: Arc<Monitor>,
    pub failed: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub pod_status: Option<PodStatus>,
}

impl Monitor {
    pub fn check(
        subject: Subject,
        name: impl Into<String>,
        pod_key: PodKey,
        probe: Arc<dyn CheckProbe>,
        config: HealthConfig,
    ) -> Arc<Self> {
        Self::new(subject, name, pod_key, Probe::Check(probe), config)
    }

    pub fn watch(
        subject: Subject,
        name: impl Into<String>,
        pod_key: PodKey,
        factory: Arc<dyn StreamFactory>,
        config: HealthConfig,
    ) -> Arc<Self> {
        Self::new(subject, name, pod_key, Probe::Watch(factory), config)
    }

    fn new(
        subject: Subject,
        name: impl Into<String>,
        pod_key: PodKey,
        probe: Probe,
        config: HealthConfig,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            subject,
            name: name.into(),
            pod_key,
            probe,
            config,
            status: RwLock::new(MonitorStatus {
                failures: 0,
                state: MonitoringState::Unknown,
                is_monitoring: false,
            }),
        });
        debug!(monitor = monitor.name, subject = %monitor.subject, "Created monitor");
        monitor
    }

    pub fn subject(&self) -> Subject {
        self.subject
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pod_key(&self) -> &PodKey {
        &self.pod_key
    }

    pub fn state(&self) -> MonitoringState {
        self.status.read().state
    }

    pub fn failures(&self) -> u32 {
        self.status.read().failures
    }

    pub fn is_monitoring(&self) -> bool {
        self.status.read().is_monitoring
    }

    /// Turn a probe outcome into a check result. The only place the failure
    /// counter and state change while the monitor runs.
    pub(crate) fn record(self: &Arc<Self>, outcome: ProbeOutcome) -> CheckResult {
        {
            let mut status = self.status.write();
            if outcome.failed {
                status.failures += 1;
                if status.failures >= self.config.unhealthy_threshold_count {
                    if status.state != MonitoringState::Unhealthy {
                        info!(
                            monitor = self.name,
                            pod = %self.pod_key,
                            failures = status.failures,
                            "Monitor reached unhealthy threshold"
                        );
                    }
                    status.state = MonitoringState::Unhealthy;
                    metrics::HEALTH_STATE_UNHEALTHY.inc();
                }
            } else {
                if status.failures > 0 {
                    debug!(monitor = self.name, pod = %self.pod_key, "Failure counter reset");
                    metrics::HEALTH_STATE_RESET.inc();
                }
                status.failures = 0;
                status.state = MonitoringState::Healthy;
            }
        }

        CheckResult {
            monitor: Arc::clone(self),
            failed: outcome.failed,
            message: outcome.message,
            timestamp: Utc::now(),
            pod_status: outcome.pod_status,
        }
    }

    fn reset_on_stop(&self) {
        let mut status = self.status.write();
        status.failures = 0;
        status.state = MonitoringState::Unknown;
        status.is_monitoring = false;
    }

    /// Run the monitoring loop until the cancel channel flips.
    pub(crate) fn run(
        self: Arc<Self>,
        results: mpsc::Sender<CheckResult>,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.status.write().is_monitoring = true;
            info!(monitor = self.name, pod = %self.pod_key, "Monitor started");

            match &self.probe {
                Probe::Check(probe) => {
                    let probe = Arc::clone(probe);
                    self.check_loop(probe, &results, &mut cancel).await;
                }
                Probe::Watch(factory) => {
                    let factory = Arc::clone(factory);
                    self.watch_loop(factory, &results, &mut cancel).await;
                }
            }

            self.reset_on_stop();
            info!(monitor = self.name, pod = %self.pod_key, "Monitor stopped");
        })
    }

    async fn check_loop(
        self: &Arc<Self>,
        probe: Arc<dyn CheckProbe>,
        results: &mpsc::Sender<CheckResult>,
        cancel: &mut watch::Receiver<bool>,
    ) {
        let interval = Duration::from_secs(self.config.health_check_interval_seconds);

        loop {
            debug!(monitor = self.name, pod = %self.pod_key, "Initiating check");
            let outcome = probe.check().await;
            let result = self.record(outcome);

            if !self.send_result(result, results, cancel).await {
                return;
            }

            tokio::select! {
                _ = cancel.changed() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn watch_loop(
        self: &Arc<Self>,
        factory: Arc<dyn StreamFactory>,
        results: &mpsc::Sender<CheckResult>,
        cancel: &mut watch::Receiver<bool>,
    ) {
        let retry = Duration::from_secs(self.config.stream_retry_interval_seconds);

        'reconnect: loop {
            debug!(monitor = self.name, pod = %self.pod_key, "Connecting stream...");
            let opened = tokio::select! {
                _ = cancel.changed() => return,
                opened = factory.open() => opened,
            };

            let mut stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    metrics::WATCH_STREAM_ERRORS.inc();
                    let result = self.record(ProbeOutcome::failure(format!(
                        "can't open {} stream for pod {}: {err}",
                        self.name, self.pod_key
                    )));
                    warn!(monitor = self.name, "Premature check failure: {}", result.message);
                    if !self.send_result(result, results, cancel).await {
                        return;
                    }
                    if !self.sleep_or_cancel(retry, cancel).await {
                        return;
                    }
                    continue 'reconnect;
                }
            };

            loop {
                let received = tokio::select! {
                    _ = cancel.changed() => return,
                    received = stream.recv() => received,
                };

                match received {
                    Ok(StatusPayload {
                        pod_status,
                        message,
                    }) => {
                        let result =
                            self.record(ProbeOutcome::success(message).with_status(pod_status));
                        if !self.send_result(result, results, cancel).await {
                            return;
                        }
                    }
                    Err(err) => {
                        metrics::WATCH_STREAM_ERRORS.inc();
                        let result = self.record(ProbeOutcome::failure(format!(
                            "error receiving {} stream for pod {}: {err}",
                            self.name, self.pod_key
                        )));
                        warn!(monitor = self.name, "Premature check failure: {}", result.message);
                        if !self.send_result(result, results, cancel).await {
                            return;
                        }
                        if !self.sleep_or_cancel(retry, cancel).await {
                            return;
                        }
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    /// Send a result to the handler, giving up on cancellation so shutdown
    /// can never deadlock on a full channel. Returns false when the loop
    /// should exit.
    async fn send_result(
        &self,
        result: CheckResult,
        results: &mpsc::Sender<CheckResult>,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        tokio::select! {
            _ = cancel.changed() => false,
            sent = results.send(result) => sent.is_ok(),
        }
    }

    /// Returns false when cancelled during the sleep.
    async fn sleep_or_cancel(&self, duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = cancel.changed() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn test_key() -> PodKey {
        PodKey::new("default", "app1")
    }

    fn health_config(threshold: u32, retry_secs: u64) -> HealthConfig {
        HealthConfig {
            unhealthy_threshold_count: threshold,
            health_check_interval_seconds: 1,
            stream_retry_interval_seconds: retry_secs,
        }
    }

    /// Probe scripted with a fixed outcome sequence, then successes.
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<bool>>,
    }

    #[async_trait]
    impl CheckProbe for ScriptedProbe {
        async fn check(&self) -> ProbeOutcome {
            let failed = self.outcomes.lock().await.pop_front().unwrap_or(false);
            if failed {
                ProbeOutcome::failure("scripted failure")
            } else {
                ProbeOutcome::success("scripted success")
            }
        }
    }

    /// Stream scripted with receive results; pends forever once empty.
    pub(crate) struct ScriptedStream {
        pub events: VecDeque<Result<StatusPayload, AgentError>>,
    }

    #[async_trait]
    impl WatchStream for ScriptedStream {
        async fn recv(&mut self) -> Result<StatusPayload, AgentError> {
            match self.events.pop_front() {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }
    }

    /// Factory handing out scripted streams in order; pends when exhausted.
    pub(crate) struct ScriptedFactory {
        pub streams: Mutex<VecDeque<Box<dyn WatchStream>>>,
        pub opens: AtomicUsize,
    }

    impl ScriptedFactory {
        pub fn new(streams: Vec<Box<dyn WatchStream>>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
                opens: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamFactory for ScriptedFactory {
        async fn open(&self) -> Result<Box<dyn WatchStream>, AgentError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().await.pop_front() {
                Some(stream) => Ok(stream),
                None => std::future::pending().await,
            }
        }
    }

    fn dummy_check_monitor(threshold: u32) -> Arc<Monitor> {
        Monitor::check(
            Subject::Application,
            "app.health",
            test_key(),
            Arc::new(ScriptedProbe {
                outcomes: Mutex::new(VecDeque::new()),
            }),
            health_config(threshold, 1),
        )
    }

    #[test]
    fn failure_threshold_flips_state() {
        let monitor = dummy_check_monitor(3);
        assert_eq!(monitor.state(), MonitoringState::Unknown);

        monitor.record(ProbeOutcome::failure("f1"));
        monitor.record(ProbeOutcome::failure("f2"));
        assert_eq!(monitor.state(), MonitoringState::Unknown);
        assert_eq!(monitor.failures(), 2);

        monitor.record(ProbeOutcome::failure("f3"));
        assert_eq!(monitor.state(), MonitoringState::Unhealthy);

        // one success resets immediately
        monitor.record(ProbeOutcome::success("ok"));
        assert_eq!(monitor.state(), MonitoringState::Healthy);
        assert_eq!(monitor.failures(), 0);
    }

    #[test]
    fn threshold_of_one_is_immediate() {
        let monitor = dummy_check_monitor(1);
        monitor.record(ProbeOutcome::failure("f1"));
        assert_eq!(monitor.state(), MonitoringState::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn check_loop_emits_results_on_the_interval() {
        let monitor = Monitor::check(
            Subject::Application,
            "app.health",
            test_key(),
            Arc::new(ScriptedProbe {
                outcomes: Mutex::new(VecDeque::from([true, false])),
            }),
            health_config(5, 1),
        );

        let (tx, mut rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = monitor.clone().run(tx, cancel_rx);

        let first = rx.recv().await.unwrap();
        assert!(first.failed);
        let second = rx.recv().await.unwrap();
        assert!(!second.failed);

        cancel_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(monitor.state(), MonitoringState::Unknown);
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_loop_recovers_from_stream_errors() {
        // first stream: one good message, then EOF; second stream: one good
        // message, then pends
        let stream1 = Box::new(ScriptedStream {
            events: VecDeque::from([
                Ok(StatusPayload {
                    pod_status: None,
                    message: "first".to_string(),
                }),
                Err(AgentError::StreamClosed),
            ]),
        });
        let stream2 = Box::new(ScriptedStream {
            events: VecDeque::from([Ok(StatusPayload {
                pod_status: None,
                message: "second".to_string(),
            })]),
        });

        let factory = Arc::new(ScriptedFactory::new(vec![stream1, stream2]));
        let monitor = Monitor::watch(
            Subject::Application,
            "app.watch",
            test_key(),
            factory.clone(),
            health_config(5, 1),
        );

        let (tx, mut rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = monitor.clone().run(tx, cancel_rx);

        let first = rx.recv().await.unwrap();
        assert!(!first.failed);

        // EOF produces exactly one failed result, then a reconnect
        let eof = rx.recv().await.unwrap();
        assert!(eof.failed);
        assert_eq!(monitor.failures(), 1);

        let recovered = rx.recv().await.unwrap();
        assert!(!recovered.failed);
        assert_eq!(monitor.failures(), 0);
        assert_eq!(monitor.state(), MonitoringState::Healthy);
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);

        cancel_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(monitor.state(), MonitoringState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_factory_retries_after_the_interval() {
        struct FailingFactory {
            opens: AtomicUsize,
        }

        #[async_trait]
        impl StreamFactory for FailingFactory {
            async fn open(&self) -> Result<Box<dyn WatchStream>, AgentError> {
                self.opens.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::NotReady("pod has no ip".to_string()))
            }
        }

        let factory = Arc::new(FailingFactory {
            opens: AtomicUsize::new(0),
        });
        let monitor = Monitor::watch(
            Subject::AgentChannel,
            "agent.watch",
            test_key(),
            factory.clone(),
            health_config(5, 1),
        );

        let (tx, mut rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = monitor.clone().run(tx, cancel_rx);

        let first = rx.recv().await.unwrap();
        assert!(first.failed);
        let second = rx.recv().await.unwrap();
        assert!(second.failed);
        assert!(factory.opens.load(Ordering::SeqCst) >= 2);

        cancel_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_receive() {
        // a stream that never yields
        let stream = Box::new(ScriptedStream {
            events: VecDeque::new(),
        });
        let factory = Arc::new(ScriptedFactory::new(vec![stream]));
        let monitor = Monitor::watch(
            Subject::Application,
            "app.watch",
            test_key(),
            factory,
            health_config(5, 1),
        );

        let (tx, _rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = monitor.clone().run(tx, cancel_rx);

        // give the loop a moment to block in recv
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(!monitor.is_monitoring());
        assert_eq!(monitor.state(), MonitoringState::Unknown);
    }
}
