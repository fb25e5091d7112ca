//! Connection Status Monitor - client-side health polling
//!
//! `StatusMonitor` is a pure state machine: every input carries the current
//! instant and every output is a command for the driver (arm a timer, start a
//! poll, deliver a notification). `run_status_monitor` drives it on tokio.
//!
//! - Base interval plus random jitter between successful polls
//! - Exponential backoff on errors, capped; reset by the next success
//! - HTTP 429 waits exactly `Retry-After`
//! - Suspended while hidden or offline, resumed immediately on restoration
//! - Connected/disconnected changes are notified once per change
//! - Nothing fires after teardown

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::sync::api::parse_retry_after;
use crate::token_manager::TokenManager;

/// Fallback wait for a 429 without a usable `Retry-After`
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub base_interval: Duration,
    /// Upper bound of the random delay added to each interval
    pub max_jitter: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            max_jitter: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Not started yet
    Idle,
    /// Timer armed for the next regular poll
    Waiting,
    Polling,
    /// Timer armed after an error or a 429
    Backoff,
    /// Hidden or offline
    Suspended,
    Stopped,
}

/// Result of one status poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Observed { connected: bool },
    RateLimited { retry_after: Duration },
    Failed(String),
}

/// The one armed timer; a handle whose id is not current is stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub id: u64,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    Schedule(TimerHandle),
    StartPoll,
    Notify { connected: bool },
}

pub trait Jitter: Send {
    /// A delay in `[0, max]`
    fn sample(&mut self, max: Duration) -> Duration;
}

pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&mut self, max: Duration) -> Duration {
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

pub struct StatusMonitor<J: Jitter> {
    config: MonitorConfig,
    jitter: J,
    phase: MonitorPhase,
    timer: Option<TimerHandle>,
    next_timer_id: u64,
    consecutive_failures: u32,
    last_connected: Option<bool>,
    visible: bool,
    online: bool,
    poll_in_flight: bool,
}

impl<J: Jitter> StatusMonitor<J> {
    pub fn new(config: MonitorConfig, jitter: J) -> Self {
        Self {
            config,
            jitter,
            phase: MonitorPhase::Idle,
            timer: None,
            next_timer_id: 0,
            consecutive_failures: 0,
            last_connected: None,
            visible: true,
            online: true,
            poll_in_flight: false,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn last_connected(&self) -> Option<bool> {
        self.last_connected
    }

    pub fn pending_timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    /// Delay applied after the current run of consecutive failures
    pub fn current_backoff(&self) -> Duration {
        backoff_delay(&self.config, self.consecutive_failures)
    }

    fn active(&self) -> bool {
        self.visible && self.online
    }

    pub fn start(&mut self, _now: Instant) -> Vec<MonitorCommand> {
        if self.phase != MonitorPhase::Idle {
            return Vec::new();
        }
        if !self.active() {
            log::debug!("Status monitor starting suspended");
            self.phase = MonitorPhase::Suspended;
            return Vec::new();
        }
        self.begin_poll()
    }

    pub fn timer_fired(&mut self, handle: TimerHandle, now: Instant) -> Vec<MonitorCommand> {
        if self.timer != Some(handle) || now < handle.deadline {
            return Vec::new();
        }
        if !matches!(self.phase, MonitorPhase::Waiting | MonitorPhase::Backoff) {
            return Vec::new();
        }
        self.timer = None;
        self.begin_poll()
    }

    pub fn poll_completed(&mut self, outcome: PollOutcome, now: Instant) -> Vec<MonitorCommand> {
        if self.phase == MonitorPhase::Stopped || !self.poll_in_flight {
            return Vec::new();
        }
        self.poll_in_flight = false;

        let mut commands = Vec::new();
        let (next_phase, delay) = match outcome {
            PollOutcome::Observed { connected } => {
                self.consecutive_failures = 0;
                if let Some(previous) = self.last_connected {
                    if previous != connected {
                        log::info!(
                            "Accounting connection is now {}",
                            if connected { "connected" } else { "disconnected" }
                        );
                        commands.push(MonitorCommand::Notify { connected });
                    }
                }
                self.last_connected = Some(connected);
                let jitter = self.jitter.sample(self.config.max_jitter);
                (MonitorPhase::Waiting, self.config.base_interval + jitter)
            }
            PollOutcome::RateLimited { retry_after } => {
                log::warn!("Status poll rate limited, retrying in {:?}", retry_after);
                (MonitorPhase::Backoff, retry_after)
            }
            PollOutcome::Failed(reason) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let delay = self.current_backoff();
                log::warn!("Status poll failed ({}), retrying in {:?}", reason, delay);
                (MonitorPhase::Backoff, delay)
            }
        };

        if self.phase == MonitorPhase::Polling {
            self.phase = next_phase;
            commands.push(self.arm(now + delay));
        }
        commands
    }

    pub fn set_visible(&mut self, visible: bool, _now: Instant) -> Vec<MonitorCommand> {
        self.visible = visible;
        self.environment_changed()
    }

    pub fn set_online(&mut self, online: bool, _now: Instant) -> Vec<MonitorCommand> {
        self.online = online;
        self.environment_changed()
    }

    /// Cancel the timer and refuse every later input
    pub fn teardown(&mut self) {
        self.phase = MonitorPhase::Stopped;
        self.timer = None;
        self.poll_in_flight = false;
    }

    fn environment_changed(&mut self) -> Vec<MonitorCommand> {
        match self.phase {
            MonitorPhase::Idle | MonitorPhase::Stopped => Vec::new(),
            MonitorPhase::Suspended if self.active() => {
                log::debug!("Status monitor resumed");
                if self.poll_in_flight {
                    self.phase = MonitorPhase::Polling;
                    Vec::new()
                } else {
                    self.begin_poll()
                }
            }
            MonitorPhase::Suspended => Vec::new(),
            _ if !self.active() => {
                log::debug!("Status monitor suspended");
                self.phase = MonitorPhase::Suspended;
                self.timer = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn begin_poll(&mut self) -> Vec<MonitorCommand> {
        self.phase = MonitorPhase::Polling;
        self.timer = None;
        self.poll_in_flight = true;
        vec![MonitorCommand::StartPoll]
    }

    fn arm(&mut self, deadline: Instant) -> MonitorCommand {
        self.next_timer_id += 1;
        let handle = TimerHandle {
            id: self.next_timer_id,
            deadline,
        };
        self.timer = Some(handle);
        MonitorCommand::Schedule(handle)
    }
}

/// `backoff_base * 2^(failures - 1)`, capped; zero without failures
pub fn backoff_delay(config: &MonitorConfig, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow((failures - 1).min(16));
    config.backoff_base.saturating_mul(factor).min(config.backoff_max)
}

// ============================================================================
// Status sources
// ============================================================================

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn poll(&self) -> PollOutcome;
}

#[derive(serde::Deserialize)]
struct StatusBody {
    connected: bool,
}

/// Polls a status endpoint answering `{ "connected": bool, ... }`
pub struct HttpStatusSource {
    client: Client,
    url: String,
}

impl HttpStatusSource {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(request_timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn poll(&self) -> PollOutcome {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => return PollOutcome::Failed(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers()).unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
            return PollOutcome::RateLimited { retry_after };
        }
        if !status.is_success() {
            return PollOutcome::Failed(format!("status endpoint returned {}", status));
        }

        match response.json::<StatusBody>().await {
            Ok(body) => PollOutcome::Observed {
                connected: body.connected,
            },
            Err(e) => PollOutcome::Failed(format!("invalid status response: {}", e)),
        }
    }
}

/// Reads the connection status straight from the token manager
pub struct LocalStatusSource {
    tokens: Arc<TokenManager>,
}

impl LocalStatusSource {
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl StatusSource for LocalStatusSource {
    async fn poll(&self) -> PollOutcome {
        match self.tokens.connection_status().await {
            Ok(status) => PollOutcome::Observed {
                connected: status.connected,
            },
            Err(e) => PollOutcome::Failed(e.to_string()),
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    Visible(bool),
    Online(bool),
}

type PollFuture = Pin<Box<dyn Future<Output = PollOutcome> + Send>>;

/// Run `monitor` until `cancel` fires. `on_change` receives every
/// connected/disconnected transition.
pub async fn run_status_monitor<J, S, F>(
    mut monitor: StatusMonitor<J>,
    source: Arc<S>,
    mut signals: mpsc::Receiver<EnvironmentSignal>,
    cancel: CancellationToken,
    mut on_change: F,
) -> MonitorPhase
where
    J: Jitter,
    S: StatusSource + ?Sized + 'static,
    F: FnMut(bool) + Send,
{
    let mut in_flight: Option<PollFuture> = None;
    let mut signals_open = true;
    let mut commands = monitor.start(Instant::now());

    loop {
        for command in commands.drain(..) {
            match command {
                MonitorCommand::Schedule(handle) => log::debug!(
                    "Next status poll in {:?}",
                    handle.deadline.saturating_duration_since(Instant::now())
                ),
                MonitorCommand::StartPoll => {
                    let source = source.clone();
                    in_flight = Some(Box::pin(async move { source.poll().await }));
                }
                MonitorCommand::Notify { connected } => on_change(connected),
            }
        }
        let timer = monitor.pending_timer();
        let deadline = timer.map(|handle| handle.deadline);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                monitor.teardown();
                break;
            }

            outcome = async {
                match in_flight.as_mut() {
                    Some(poll) => poll.await,
                    None => pending().await,
                }
            }, if in_flight.is_some() => {
                in_flight = None;
                commands = monitor.poll_completed(outcome, Instant::now());
            }

            _ = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending().await,
                }
            }, if deadline.is_some() => {
                commands = match timer {
                    Some(handle) => monitor.timer_fired(handle, Instant::now()),
                    None => Vec::new(),
                };
            }

            signal = signals.recv(), if signals_open => {
                let now = Instant::now();
                commands = match signal {
                    Some(EnvironmentSignal::Visible(visible)) => monitor.set_visible(visible, now),
                    Some(EnvironmentSignal::Online(online)) => monitor.set_online(online, now),
                    None => {
                        signals_open = false;
                        Vec::new()
                    }
                };
            }
        }
    }

    log::debug!("Status monitor stopped");
    monitor.phase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct NoJitter;

    impl Jitter for NoJitter {
        fn sample(&mut self, _max: Duration) -> Duration {
            Duration::ZERO
        }
    }

    struct FixedJitter(Duration);

    impl Jitter for FixedJitter {
        fn sample(&mut self, max: Duration) -> Duration {
            self.0.min(max)
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            base_interval: Duration::from_secs(30),
            max_jitter: Duration::from_secs(5),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(20),
        }
    }

    fn scheduled(commands: &[MonitorCommand]) -> Option<TimerHandle> {
        commands.iter().find_map(|c| match c {
            MonitorCommand::Schedule(handle) => Some(*handle),
            _ => None,
        })
    }

    fn notifications(commands: &[MonitorCommand]) -> Vec<bool> {
        commands
            .iter()
            .filter_map(|c| match c {
                MonitorCommand::Notify { connected } => Some(*connected),
                _ => None,
            })
            .collect()
    }

    fn observed(connected: bool) -> PollOutcome {
        PollOutcome::Observed { connected }
    }

    #[test]
    fn test_start_polls_immediately() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let now = Instant::now();

        assert_eq!(monitor.start(now), vec![MonitorCommand::StartPoll]);
        assert_eq!(monitor.phase(), MonitorPhase::Polling);
        assert!(monitor.start(now).is_empty());
    }

    #[test]
    fn test_success_waits_interval_plus_jitter() {
        let mut monitor = StatusMonitor::new(config(), FixedJitter(Duration::from_secs(3)));
        let now = Instant::now();
        monitor.start(now);

        let commands = monitor.poll_completed(observed(true), now);
        let handle = scheduled(&commands).unwrap();
        assert_eq!(handle.deadline, now + Duration::from_secs(33));
        assert_eq!(monitor.phase(), MonitorPhase::Waiting);

        // Early or stale firings do nothing
        assert!(monitor.timer_fired(handle, now).is_empty());
        let stale = TimerHandle { id: handle.id + 7, deadline: now };
        assert!(monitor.timer_fired(stale, handle.deadline).is_empty());

        assert_eq!(
            monitor.timer_fired(handle, handle.deadline),
            vec![MonitorCommand::StartPoll]
        );
    }

    #[test]
    fn test_random_jitter_stays_in_bounds() {
        let mut jitter = RandomJitter;
        for _ in 0..100 {
            assert!(jitter.sample(Duration::from_millis(250)) <= Duration::from_millis(250));
        }
        assert_eq!(jitter.sample(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_transitions_notified_once_per_change() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let mut now = Instant::now();
        monitor.start(now);

        let mut seen = Vec::new();
        for connected in [true, true, false, false, false, true, true] {
            let commands = monitor.poll_completed(observed(connected), now);
            seen.extend(notifications(&commands));
            let handle = scheduled(&commands).unwrap();
            now = handle.deadline;
            monitor.timer_fired(handle, now);
        }

        // The first observation establishes the baseline
        assert_eq!(seen, vec![false, true]);
        assert_eq!(monitor.last_connected(), Some(true));
    }

    #[test]
    fn test_backoff_grows_to_max_and_resets() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let mut now = Instant::now();
        monitor.start(now);

        let mut delays = Vec::new();
        for _ in 0..6 {
            let commands = monitor.poll_completed(PollOutcome::Failed("503".to_string()), now);
            let handle = scheduled(&commands).unwrap();
            delays.push(handle.deadline - now);
            now = handle.deadline;
            monitor.timer_fired(handle, now);
        }

        let secs: Vec<u64> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 20, 20]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(monitor.phase(), MonitorPhase::Polling);

        let commands = monitor.poll_completed(observed(true), now);
        assert_eq!(monitor.current_backoff(), Duration::ZERO);
        assert_eq!(scheduled(&commands).unwrap().deadline - now, Duration::from_secs(30));

        let commands = monitor.poll_completed(PollOutcome::Failed("503".to_string()), now);
        assert!(commands.is_empty(), "no poll was in flight");
    }

    #[test]
    fn test_backoff_delay_function() {
        let cfg = config();
        assert_eq!(backoff_delay(&cfg, 0), Duration::ZERO);
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(&cfg, 40), Duration::from_secs(20));
    }

    #[test]
    fn test_rate_limit_waits_exactly_retry_after() {
        let mut monitor = StatusMonitor::new(config(), FixedJitter(Duration::from_secs(4)));
        let now = Instant::now();
        monitor.start(now);

        let commands = monitor.poll_completed(
            PollOutcome::RateLimited {
                retry_after: Duration::from_secs(17),
            },
            now,
        );
        assert_eq!(scheduled(&commands).unwrap().deadline, now + Duration::from_secs(17));
        assert_eq!(monitor.phase(), MonitorPhase::Backoff);
    }

    #[test]
    fn test_hidden_suspends_and_visible_resumes_immediately() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let now = Instant::now();
        monitor.start(now);
        let handle = scheduled(&monitor.poll_completed(observed(true), now)).unwrap();

        assert!(monitor.set_visible(false, now).is_empty());
        assert_eq!(monitor.phase(), MonitorPhase::Suspended);
        assert!(monitor.pending_timer().is_none());
        assert!(monitor.timer_fired(handle, handle.deadline).is_empty());

        let later = now + Duration::from_secs(5);
        assert_eq!(monitor.set_visible(true, later), vec![MonitorCommand::StartPoll]);
        assert_eq!(monitor.phase(), MonitorPhase::Polling);
    }

    #[test]
    fn test_offline_suspends_until_online() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let now = Instant::now();
        monitor.set_online(false, now);
        assert!(monitor.start(now).is_empty());
        assert_eq!(monitor.phase(), MonitorPhase::Suspended);

        // Still hidden after coming online: stays suspended
        monitor.set_visible(false, now);
        assert!(monitor.set_online(true, now).is_empty());
        assert_eq!(monitor.set_visible(true, now), vec![MonitorCommand::StartPoll]);
    }

    #[test]
    fn test_resume_with_poll_in_flight_does_not_double_poll() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let now = Instant::now();
        monitor.start(now);

        monitor.set_visible(false, now);
        // Result of the poll that was running when the page was hidden
        assert!(monitor.set_visible(true, now).is_empty());
        assert_eq!(monitor.phase(), MonitorPhase::Polling);

        let commands = monitor.poll_completed(observed(true), now);
        assert!(scheduled(&commands).is_some());
    }

    #[test]
    fn test_result_while_suspended_does_not_schedule() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let now = Instant::now();
        monitor.start(now);
        monitor.set_online(false, now);

        let commands = monitor.poll_completed(observed(true), now);
        assert!(commands.is_empty());
        assert_eq!(monitor.phase(), MonitorPhase::Suspended);
    }

    #[test]
    fn test_teardown_silences_everything() {
        let mut monitor = StatusMonitor::new(config(), NoJitter);
        let now = Instant::now();
        monitor.start(now);
        let handle = scheduled(&monitor.poll_completed(observed(true), now)).unwrap();
        monitor.timer_fired(handle, handle.deadline);

        monitor.teardown();
        assert_eq!(monitor.phase(), MonitorPhase::Stopped);
        assert!(monitor.poll_completed(observed(false), now).is_empty());
        assert!(monitor.timer_fired(handle, handle.deadline).is_empty());
        assert!(monitor.set_visible(true, now).is_empty());
        assert!(monitor.start(now).is_empty());
    }

    // ------------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------------

    struct ScriptedSource {
        outcomes: Mutex<VecDeque<PollOutcome>>,
        polls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSource {
        fn new(outcomes: Vec<PollOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                polls: Mutex::new(Vec::new()),
            })
        }

        fn poll_times(&self) -> Vec<Instant> {
            self.polls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn poll(&self) -> PollOutcome {
            self.polls.lock().unwrap().push(Instant::now());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PollOutcome::Observed { connected: true })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_polls_and_notifies() {
        let source = ScriptedSource::new(vec![
            observed(true),
            PollOutcome::Failed("boom".to_string()),
            observed(false),
            observed(true),
        ]);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let sink = changes.clone();
        let task = tokio::spawn(run_status_monitor(
            StatusMonitor::new(config(), NoJitter),
            source.clone(),
            rx,
            cancel.clone(),
            move |connected| sink.lock().unwrap().push(connected),
        ));

        // t=0 poll, t=30 fail, t=32 disconnected, t=62 connected
        tokio::time::sleep(Duration::from_secs(70)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), MonitorPhase::Stopped);

        assert_eq!(*changes.lock().unwrap(), vec![false, true]);
        let times = source.poll_times();
        assert_eq!(times.len(), 4);
        assert_eq!(times[1] - times[0], Duration::from_secs(30));
        assert_eq!(times[2] - times[1], Duration::from_secs(2));

        // Nothing runs after teardown
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.poll_times().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_suspends_while_hidden() {
        let source = ScriptedSource::new(Vec::new());
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_status_monitor(
            StatusMonitor::new(config(), NoJitter),
            source.clone(),
            rx,
            cancel.clone(),
            |_| {},
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(EnvironmentSignal::Visible(false)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.poll_times().len(), 1);

        tx.send(EnvironmentSignal::Visible(true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.poll_times().len(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    // ------------------------------------------------------------------------
    // HTTP source
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_http_source_parses_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"connected": false, "reason": "revoked", "token_expired": true}"#)
            .create_async()
            .await;

        let source = HttpStatusSource::new(format!("{}/status", server.url()), Duration::from_secs(5)).unwrap();
        assert_eq!(source.poll().await, PollOutcome::Observed { connected: false });
    }

    #[tokio::test]
    async fn test_http_source_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status")
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let source = HttpStatusSource::new(format!("{}/status", server.url()), Duration::from_secs(5)).unwrap();
        assert_eq!(
            source.poll().await,
            PollOutcome::RateLimited {
                retry_after: Duration::from_secs(7)
            }
        );
    }

    #[tokio::test]
    async fn test_http_source_server_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/status").with_status(503).create_async().await;

        let source = HttpStatusSource::new(format!("{}/status", server.url()), Duration::from_secs(5)).unwrap();
        assert!(matches!(source.poll().await, PollOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_local_source_reports_disconnected() {
        let harness = crate::test_support::TestHarness::new();
        let source = LocalStatusSource::new(harness.tokens.clone());
        assert_eq!(source.poll().await, observed(true));

        harness.tokens.disconnect().unwrap();
        assert_eq!(source.poll().await, observed(false));
    }
}
