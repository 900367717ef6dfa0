use crate::error::AppError;
use crate::telemetry::bridge::{
    open_bridge, BridgeHandle, BridgeReceiver, BridgeSignal, SyntheticTransport, UpdateStream,
    UpdateTransport,
};
use crate::telemetry::client::{GraphqlWsTransport, ScadaClient};
use crate::telemetry::engine::{AppendOutcome, SeriesEngine};
use crate::telemetry::history::{HistoryFetcher, HistorySnapshot, HistorySource, SyntheticHistory};
use crate::telemetry::identity::{MetricIdentifier, MetricKey};
use crate::telemetry::now_unix_ms;
use crate::telemetry::types::{
    HistoryRequest, MetricHistoryWire, MetricInfo, SeriesChanged, SessionConfig, SessionState,
    SessionStatusSnapshot,
};
use crate::telemetry::window::{ChartMode, RefreshPolicy, ResolvedWindow, WindowSelection};
use crate::telemetry::{SERIES_CHANGED_EVENT, SESSION_STATUS_EVENT};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const SESSION_EVENT_CAPACITY: usize = 256;
pub const SESSION_COMMAND_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub enum SessionCommand {
    SetWindow(WindowSelection),
    SetMetrics(Vec<MetricInfo>),
    Reconnect,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SeriesChanged(SeriesChanged),
    Status(SessionStatusSnapshot),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SeriesChanged(_) => SERIES_CHANGED_EVENT,
            Self::Status(_) => SESSION_STATUS_EVENT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionShared {
    pub engine: Arc<Mutex<SeriesEngine>>,
    pub status: Arc<RwLock<SessionStatusSnapshot>>,
    pub events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionShared {
    fn default() -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            engine: Arc::new(Mutex::new(SeriesEngine::new())),
            status: Arc::new(RwLock::new(SessionStatusSnapshot::idle(Some(
                "no session started".to_string(),
            )))),
            events,
        }
    }
}

pub trait LiveTransportFactory: Send + Sync + 'static {
    type Transport: UpdateTransport;

    fn live_transport(&self, metrics: &[MetricInfo]) -> Result<Self::Transport, AppError>;
}

#[derive(Debug, Clone)]
pub enum DashboardTransport {
    Platform(GraphqlWsTransport),
    Synthetic(SyntheticTransport),
}

impl UpdateTransport for DashboardTransport {
    async fn connect(self) -> Result<UpdateStream, AppError> {
        match self {
            Self::Platform(transport) => transport.connect().await,
            Self::Synthetic(transport) => transport.connect().await,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DashboardHistory {
    Platform(ScadaClient),
    Synthetic(SyntheticHistory),
}

impl HistorySource for DashboardHistory {
    async fn fetch_history(
        &self,
        request: HistoryRequest,
    ) -> Result<Vec<MetricHistoryWire>, AppError> {
        match self {
            Self::Platform(client) => client.fetch_history(request).await,
            Self::Synthetic(synthetic) => synthetic.fetch_history(request).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DashboardSources {
    client: ScadaClient,
    mock_mode: bool,
}

impl DashboardSources {
    pub fn new(client: ScadaClient, mock_mode: bool) -> Self {
        Self { client, mock_mode }
    }

    pub fn history(&self) -> HistoryFetcher<DashboardHistory> {
        if self.mock_mode {
            HistoryFetcher::new(DashboardHistory::Synthetic(SyntheticHistory))
        } else {
            HistoryFetcher::new(DashboardHistory::Platform(self.client.clone()))
        }
    }
}

impl LiveTransportFactory for DashboardSources {
    type Transport = DashboardTransport;

    fn live_transport(&self, metrics: &[MetricInfo]) -> Result<Self::Transport, AppError> {
        if self.mock_mode {
            Ok(DashboardTransport::Synthetic(SyntheticTransport::new(
                metrics.to_vec(),
            )))
        } else {
            Ok(DashboardTransport::Platform(self.client.live_transport()?))
        }
    }
}

#[derive(Debug)]
struct HistoryLoaded {
    generation: u64,
    result: Result<HistorySnapshot, AppError>,
}

struct OpenBridge {
    handle: BridgeHandle,
    receiver: BridgeReceiver,
}

struct SessionRuntime<H: HistorySource, F: LiveTransportFactory> {
    config: SessionConfig,
    shared: SessionShared,
    history: Arc<HistoryFetcher<H>>,
    transports: F,
    history_sender: mpsc::Sender<HistoryLoaded>,
    generation: u64,
    window: ResolvedWindow,
    bridge: Option<OpenBridge>,
    load_task: Option<JoinHandle<()>>,
    faulted: bool,
    seeded: bool,
}

impl<H: HistorySource, F: LiveTransportFactory> SessionRuntime<H, F> {
    fn active_keys(&self) -> HashSet<MetricKey> {
        self.config.metrics.iter().map(MetricInfo::key).collect()
    }

    fn close_bridge(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.handle.close();
        }
    }

    /// Earlier loads still in flight are left to finish; their results carry
    /// an older generation and are dropped on arrival.
    async fn begin_load(&mut self) {
        self.close_bridge();

        self.generation = self.generation.saturating_add(1);
        self.faulted = false;
        self.seeded = false;
        self.window = self.config.window.resolve(now_unix_ms());

        {
            let keys = self.active_keys();
            let mut engine = self.shared.engine.lock();
            engine.set_active(&keys);
            engine.reset();
        }

        let generation = self.generation;
        let window = self.window;
        let identifiers: Vec<MetricIdentifier> = self
            .config
            .metrics
            .iter()
            .map(|metric| metric.identifier.clone())
            .collect();
        let options = self.config.history.clone();
        let fetcher = Arc::clone(&self.history);
        let sender = self.history_sender.clone();
        self.load_task = Some(tokio::spawn(async move {
            let result = fetcher.fetch(window, &identifiers, &options).await;
            let _ = sender.send(HistoryLoaded { generation, result }).await;
        }));

        if self.config.window.mode() == ChartMode::Realtime {
            match self.transports.live_transport(&self.config.metrics) {
                Ok(transport) => {
                    let (handle, receiver) = open_bridge(transport);
                    self.bridge = Some(OpenBridge { handle, receiver });
                }
                Err(error) => {
                    self.fault(format!("live stream unavailable: {error}")).await;
                    return;
                }
            }
        }

        info!(
            generation,
            metrics = self.config.metrics.len(),
            mode = ?self.config.window.mode(),
            "loading dashboard window"
        );
        self.publish_status(SessionState::Loading, Some("loading history".to_string()))
            .await;
    }

    async fn on_history_loaded(&mut self, loaded: HistoryLoaded) {
        if loaded.generation != self.generation {
            debug!(
                stale = loaded.generation,
                current = self.generation,
                "discarding stale history result"
            );
            return;
        }
        self.load_task = None;
        if self.faulted {
            debug!(generation = loaded.generation, "dropping history for a faulted session");
            return;
        }

        let mut snapshot = match loaded.result {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.fault(format!("history fetch failed: {error}")).await;
                return;
            }
        };

        {
            let keys = self.active_keys();
            let mut engine = self.shared.engine.lock();
            for key in &keys {
                let samples = snapshot.remove(key).unwrap_or_default();
                if let Err(error) = engine.seed(key, samples) {
                    warn!("{error}");
                }
            }
            engine.prune_all(self.window.start_ms);
        }
        self.seeded = true;

        let state = match self.config.window.mode() {
            ChartMode::Realtime => SessionState::Live,
            ChartMode::Historical => SessionState::Historical,
        };
        self.publish_status(state, None).await;
    }

    async fn on_bridge_signal(&mut self, signal: Option<BridgeSignal>) {
        match signal {
            None => {
                self.bridge = None;
            }
            Some(BridgeSignal::Event(event)) => {
                if self.faulted {
                    return;
                }
                let outcome = self.shared.engine.lock().append(&event.key, event.sample);
                match outcome {
                    Ok(AppendOutcome::Inserted { .. }) | Ok(AppendOutcome::Queued) => {}
                    Ok(outcome) => trace!(metric = %event.key, ?outcome, "live event not applied"),
                    Err(error) => warn!("{error}"),
                }
            }
            Some(BridgeSignal::Error(error)) => {
                self.fault(format!("live stream failed: {error}")).await;
            }
            Some(BridgeSignal::Complete) => {
                self.bridge = None;
                let state = if self.seeded {
                    SessionState::Live
                } else {
                    SessionState::Loading
                };
                self.publish_status(state, Some("live stream completed".to_string()))
                    .await;
            }
        }
    }

    fn on_window_tick(&mut self) {
        if self.faulted {
            return;
        }
        let RefreshPolicy::Sliding { .. } = self.config.window.policy() else {
            return;
        };
        self.window = self.config.window.resolve(now_unix_ms());
        let removed = self.shared.engine.lock().prune_all(self.window.start_ms);
        if removed > 0 {
            trace!(removed, "pruned samples behind the window");
        }
    }

    async fn on_window_advanced(&self) {
        let mut writable = self.shared.status.write().await;
        if writable.generation == self.generation {
            writable.window = Some(self.window);
        }
    }

    fn on_emit_tick(&self) {
        let changed = self.shared.engine.lock().take_changes();
        if let Some(changed) = changed {
            let _ = self.shared.events.send(SessionEvent::SeriesChanged(changed));
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetWindow(window) => {
                self.config.window = window;
            }
            SessionCommand::SetMetrics(metrics) => {
                self.config.metrics = metrics;
            }
            SessionCommand::Reconnect => {
                info!("reconnecting dashboard session");
            }
        }
        self.begin_load().await;
    }

    async fn fault(&mut self, reason: String) {
        warn!("{reason}");
        self.faulted = true;
        self.close_bridge();
        self.publish_status(SessionState::Error, Some(reason)).await;
    }

    async fn publish_status(&self, state: SessionState, reason: Option<String>) {
        publish_status(
            &self.shared,
            SessionStatusSnapshot {
                state,
                mode: Some(self.config.window.mode()),
                window: Some(self.window),
                metric_count: self.config.metrics.len(),
                generation: self.generation,
                stream_open: self.bridge.is_some(),
                reason,
            },
        )
        .await;
    }

    async fn shutdown(&mut self) {
        self.close_bridge();
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        self.on_emit_tick();
        self.shared.engine.lock().close();
        self.publish_status(
            SessionState::Stopped,
            Some("session stopped".to_string()),
        )
        .await;
    }
}

async fn recv_bridge_signal(bridge: Option<&mut OpenBridge>) -> Option<BridgeSignal> {
    match bridge {
        Some(bridge) => bridge.receiver.recv().await,
        None => std::future::pending().await,
    }
}

pub async fn publish_status(shared: &SessionShared, snapshot: SessionStatusSnapshot) {
    {
        let mut writable = shared.status.write().await;
        *writable = snapshot.clone();
    }
    let _ = shared.events.send(SessionEvent::Status(snapshot));
}

pub async fn run_dashboard_session<H, F>(
    config: SessionConfig,
    history: HistoryFetcher<H>,
    transports: F,
    shared: SessionShared,
    mut commands: mpsc::Receiver<SessionCommand>,
    cancel_token: CancellationToken,
) where
    H: HistorySource,
    F: LiveTransportFactory,
{
    *shared.engine.lock() = SeriesEngine::new();

    let (history_sender, mut history_receiver) = mpsc::channel(4);
    let window = config.window.resolve(now_unix_ms());
    let emit_interval_ms = config.emit_interval_ms;
    let window_tick_ms = config.window_tick_ms;

    let mut runtime = SessionRuntime {
        config,
        shared,
        history: Arc::new(history),
        transports,
        history_sender,
        generation: 0,
        window,
        bridge: None,
        load_task: None,
        faulted: false,
        seeded: false,
    };
    runtime.begin_load().await;

    let mut emit_ticker = tokio::time::interval(Duration::from_millis(emit_interval_ms));
    emit_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut window_ticker = tokio::time::interval(Duration::from_millis(window_tick_ms));
    window_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            command = commands.recv() => {
                match command {
                    Some(command) => runtime.on_command(command).await,
                    None => break,
                }
            }
            Some(loaded) = history_receiver.recv() => {
                runtime.on_history_loaded(loaded).await;
            }
            signal = recv_bridge_signal(runtime.bridge.as_mut()) => {
                runtime.on_bridge_signal(signal).await;
            }
            _ = window_ticker.tick() => {
                runtime.on_window_tick();
                runtime.on_window_advanced().await;
            }
            _ = emit_ticker.tick() => {
                runtime.on_emit_tick();
            }
        }
    }

    runtime.shutdown().await;
    info!("dashboard session stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::bridge::ChannelTransport;
    use crate::telemetry::history::from_unix_ms;
    use crate::telemetry::types::{
        HistoryOptions, HistoryPointWire, MetricUpdate, Sample, WireValue,
    };
    use crate::telemetry::window::TimeRangePreset;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout, Instant};

    fn metric(metric_id: &str) -> MetricInfo {
        MetricInfo {
            identifier: MetricIdentifier::new("plant", "edge", "pump", metric_id),
            name: metric_id.to_string(),
            type_name: "Float".to_string(),
        }
    }

    fn config(metrics: Vec<MetricInfo>, window: WindowSelection) -> SessionConfig {
        SessionConfig {
            metrics,
            window,
            emit_interval_ms: 20,
            window_tick_ms: 250,
            mock_mode: false,
            history: HistoryOptions::default(),
        }
    }

    /// Answers every request with one point per metric, one second before
    /// the window end (or `lead_ms` after its start), optionally after a
    /// delay on the first call.
    #[derive(Clone, Default)]
    struct FixedHistory {
        calls: Arc<AtomicUsize>,
        first_delay_ms: u64,
        lead_ms: Option<i64>,
        fail: bool,
    }

    impl HistorySource for FixedHistory {
        async fn fetch_history(
            &self,
            request: HistoryRequest,
        ) -> Result<Vec<MetricHistoryWire>, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 && self.first_delay_ms > 0 {
                sleep(Duration::from_millis(self.first_delay_ms)).await;
            }
            if self.fail {
                return Err(AppError::Fetch("API request failed: 503".to_string()));
            }
            let timestamp = match self.lead_ms {
                Some(lead_ms) => request.start.timestamp_millis() + lead_ms,
                None => request.end.timestamp_millis() - 1_000,
            };
            request
                .metrics
                .into_iter()
                .map(|identifier| {
                    Ok(MetricHistoryWire {
                        identifier,
                        history: vec![HistoryPointWire {
                            value: Some(call as f64),
                            timestamp: from_unix_ms(timestamp)?,
                        }],
                    })
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct ScriptedTransports {
        queue: Mutex<VecDeque<ChannelTransport>>,
        opened: AtomicUsize,
    }

    impl LiveTransportFactory for Arc<ScriptedTransports> {
        type Transport = ChannelTransport;

        fn live_transport(&self, _metrics: &[MetricInfo]) -> Result<ChannelTransport, AppError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.queue
                .lock()
                .pop_front()
                .ok_or_else(|| AppError::Stream("no transport scripted".to_string()))
        }
    }

    struct Harness {
        shared: SessionShared,
        commands: mpsc::Sender<SessionCommand>,
        cancel_token: CancellationToken,
        join_handle: JoinHandle<()>,
    }

    fn spawn_session<H: HistorySource>(
        config: SessionConfig,
        history: H,
        transports: Arc<ScriptedTransports>,
    ) -> Harness {
        let shared = SessionShared::default();
        let (commands, command_receiver) = mpsc::channel(SESSION_COMMAND_CAPACITY);
        let cancel_token = CancellationToken::new();
        let join_handle = tokio::spawn(run_dashboard_session(
            config,
            HistoryFetcher::new(history),
            transports,
            shared.clone(),
            command_receiver,
            cancel_token.clone(),
        ));
        Harness {
            shared,
            commands,
            cancel_token,
            join_handle,
        }
    }

    async fn wait_for_state(shared: &SessionShared, state: SessionState) -> SessionStatusSnapshot {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let snapshot = shared.status.read().await.clone();
            if snapshot.state == state {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {state:?}, last status {snapshot:?}"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn live_update(metric_id: &str, value: f64, timestamp: i64) -> MetricUpdate {
        MetricUpdate {
            identifier: MetricIdentifier::new("plant", "edge", "pump", metric_id),
            value: WireValue::Number(value),
            timestamp,
        }
    }

    fn series(shared: &SessionShared, metric_id: &str) -> Vec<Sample> {
        shared
            .engine
            .lock()
            .snapshot_owned(&metric(metric_id).key())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn historical_session_seeds_without_opening_a_bridge() {
        let now = now_unix_ms();
        let transports = Arc::new(ScriptedTransports::default());
        let harness = spawn_session(
            config(
                vec![metric("pressure"), metric("flow")],
                WindowSelection::Historical {
                    start_ms: now - 60_000,
                    end_ms: now,
                },
            ),
            FixedHistory::default(),
            Arc::clone(&transports),
        );

        let status = wait_for_state(&harness.shared, SessionState::Historical).await;

        assert_eq!(status.mode, Some(ChartMode::Historical));
        assert_eq!(status.metric_count, 2);
        assert!(!status.stream_open);
        assert_eq!(transports.opened.load(Ordering::SeqCst), 0);
        assert_eq!(series(&harness.shared, "pressure"), vec![Sample::new(0.0, now - 1_000)]);

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
        assert_eq!(
            harness.shared.status.read().await.state,
            SessionState::Stopped
        );
    }

    #[tokio::test]
    async fn realtime_session_folds_live_events_and_signals_changes() {
        let (sender, transport) = ChannelTransport::new(16);
        let transports = Arc::new(ScriptedTransports::default());
        transports.queue.lock().push_back(transport);

        let harness = spawn_session(
            config(
                vec![metric("pressure")],
                WindowSelection::Realtime {
                    preset: TimeRangePreset::M5,
                },
            ),
            FixedHistory::default(),
            Arc::clone(&transports),
        );
        let mut events = harness.shared.events.subscribe();

        let status = wait_for_state(&harness.shared, SessionState::Live).await;
        assert!(status.stream_open);

        let now = now_unix_ms();
        sender
            .send(Ok(live_update("pressure", 7.0, now)))
            .await
            .expect("bridge should accept updates");

        let changed = timeout(Duration::from_secs(3), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::SeriesChanged(changed))
                        if series(&harness.shared, "pressure").len() == 2 =>
                    {
                        return changed;
                    }
                    Ok(_) => continue,
                    Err(error) => panic!("event channel failed: {error}"),
                }
            }
        })
        .await
        .expect("live event should produce a change notification");

        assert_eq!(changed.metrics, vec![metric("pressure").key()]);
        let samples = series(&harness.shared, "pressure");
        assert_eq!(samples.last(), Some(&Sample::new(7.0, now)));
        assert!(samples
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
    }

    #[tokio::test]
    async fn stream_error_freezes_buffers_until_reconnect() {
        let (sender, transport) = ChannelTransport::new(16);
        let (second_sender, second_transport) = ChannelTransport::new(16);
        let transports = Arc::new(ScriptedTransports::default());
        transports.queue.lock().push_back(transport);
        transports.queue.lock().push_back(second_transport);

        let harness = spawn_session(
            config(
                vec![metric("pressure")],
                WindowSelection::Realtime {
                    preset: TimeRangePreset::M5,
                },
            ),
            FixedHistory::default(),
            Arc::clone(&transports),
        );
        wait_for_state(&harness.shared, SessionState::Live).await;

        sender
            .send(Err(AppError::Stream("socket reset".to_string())))
            .await
            .expect("bridge should accept errors");
        let status = wait_for_state(&harness.shared, SessionState::Error).await;
        assert!(!status.stream_open);
        assert!(status
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("socket reset")));
        let frozen = series(&harness.shared, "pressure");

        let _ = sender.send(Ok(live_update("pressure", 9.0, now_unix_ms()))).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(series(&harness.shared, "pressure"), frozen);

        harness
            .commands
            .send(SessionCommand::Reconnect)
            .await
            .expect("session should accept commands");
        let status = wait_for_state(&harness.shared, SessionState::Live).await;
        assert!(status.generation > 1);

        let now = now_unix_ms();
        second_sender
            .send(Ok(live_update("pressure", 3.0, now)))
            .await
            .expect("fresh bridge should accept updates");
        let deadline = Instant::now() + Duration::from_secs(3);
        while !series(&harness.shared, "pressure").contains(&Sample::new(3.0, now)) {
            assert!(Instant::now() < deadline, "reconnected bridge never applied");
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transports.opened.load(Ordering::SeqCst), 2);

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
    }

    #[tokio::test]
    async fn stream_error_during_load_keeps_the_session_faulted() {
        let (sender, transport) = ChannelTransport::new(16);
        sender
            .send(Err(AppError::Stream("socket reset".to_string())))
            .await
            .expect("bridge should accept errors");
        let transports = Arc::new(ScriptedTransports::default());
        transports.queue.lock().push_back(transport);

        let harness = spawn_session(
            config(
                vec![metric("pressure")],
                WindowSelection::Realtime {
                    preset: TimeRangePreset::M5,
                },
            ),
            FixedHistory {
                first_delay_ms: 300,
                ..FixedHistory::default()
            },
            Arc::clone(&transports),
        );

        wait_for_state(&harness.shared, SessionState::Error).await;
        sleep(Duration::from_millis(450)).await;

        let status = harness.shared.status.read().await.clone();
        assert_eq!(status.state, SessionState::Error);
        assert!(status
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("socket reset")));
        assert!(series(&harness.shared, "pressure").is_empty());

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
    }

    #[tokio::test]
    async fn realtime_window_slides_and_prunes_without_new_data() {
        let (_sender, transport) = ChannelTransport::new(16);
        let transports = Arc::new(ScriptedTransports::default());
        transports.queue.lock().push_back(transport);

        let harness = spawn_session(
            config(
                vec![metric("pressure")],
                WindowSelection::Realtime {
                    preset: TimeRangePreset::M5,
                },
            ),
            FixedHistory {
                lead_ms: Some(300),
                ..FixedHistory::default()
            },
            Arc::clone(&transports),
        );

        let status = wait_for_state(&harness.shared, SessionState::Live).await;
        let loaded_start = status
            .window
            .map(|window| window.start_ms)
            .expect("live session should report its window");
        assert_eq!(series(&harness.shared, "pressure").len(), 1);

        let deadline = Instant::now() + Duration::from_secs(3);
        while !series(&harness.shared, "pressure").is_empty() {
            assert!(Instant::now() < deadline, "stale point was never pruned");
            sleep(Duration::from_millis(20)).await;
        }
        sleep(Duration::from_millis(300)).await;

        let status = harness.shared.status.read().await.clone();
        assert_eq!(status.state, SessionState::Live);
        let advanced_start = status
            .window
            .map(|window| window.start_ms)
            .expect("live session should report its window");
        assert!(advanced_start > loaded_start);

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
    }

    #[tokio::test]
    async fn window_change_discards_the_slow_earlier_load() {
        let now = now_unix_ms();
        let history = FixedHistory {
            first_delay_ms: 300,
            ..FixedHistory::default()
        };
        let calls = Arc::clone(&history.calls);
        let harness = spawn_session(
            config(
                vec![metric("pressure")],
                WindowSelection::Historical {
                    start_ms: now - 120_000,
                    end_ms: now - 60_000,
                },
            ),
            history,
            Arc::new(ScriptedTransports::default()),
        );

        harness
            .commands
            .send(SessionCommand::SetWindow(WindowSelection::Historical {
                start_ms: now - 60_000,
                end_ms: now,
            }))
            .await
            .expect("session should accept commands");

        let status = wait_for_state(&harness.shared, SessionState::Historical).await;
        sleep(Duration::from_millis(400)).await;

        assert_eq!(status.generation, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(series(&harness.shared, "pressure"), vec![Sample::new(1.0, now - 1_000)]);

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
    }

    #[tokio::test]
    async fn fetch_failure_reports_error_state() {
        let now = now_unix_ms();
        let harness = spawn_session(
            config(
                vec![metric("pressure")],
                WindowSelection::Historical {
                    start_ms: now - 60_000,
                    end_ms: now,
                },
            ),
            FixedHistory {
                fail: true,
                ..FixedHistory::default()
            },
            Arc::new(ScriptedTransports::default()),
        );

        let status = wait_for_state(&harness.shared, SessionState::Error).await;
        assert!(status
            .reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with("history fetch failed")));

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
    }

    #[tokio::test]
    async fn metric_change_activates_the_new_set() {
        let now = now_unix_ms();
        let harness = spawn_session(
            config(
                vec![metric("pressure")],
                WindowSelection::Historical {
                    start_ms: now - 60_000,
                    end_ms: now,
                },
            ),
            FixedHistory::default(),
            Arc::new(ScriptedTransports::default()),
        );
        wait_for_state(&harness.shared, SessionState::Historical).await;

        harness
            .commands
            .send(SessionCommand::SetMetrics(vec![metric("flow")]))
            .await
            .expect("session should accept commands");

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let status = harness.shared.status.read().await.clone();
            if status.generation == 2 && status.state == SessionState::Historical {
                break;
            }
            assert!(Instant::now() < deadline, "metric change never reloaded");
            sleep(Duration::from_millis(10)).await;
        }

        let engine = harness.shared.engine.lock();
        assert!(!engine.is_active(&metric("pressure").key()));
        assert_eq!(
            engine.snapshot(&metric("flow").key()).map(<[Sample]>::len),
            Some(1)
        );
        drop(engine);

        harness.cancel_token.cancel();
        let _ = harness.join_handle.await;
    }
}
