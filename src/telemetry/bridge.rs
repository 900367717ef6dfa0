use crate::error::AppError;
use crate::telemetry::history::{synthetic_phase, synthetic_value};
use crate::telemetry::now_unix_ms;
use crate::telemetry::types::{LiveEvent, MetricInfo, MetricKind, MetricUpdate, WireValue};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BRIDGE_CHANNEL_CAPACITY: usize = 1_024;
pub const SYNTHETIC_UPDATE_INTERVAL_MS: u64 = 200;

pub type UpdateStream = BoxStream<'static, Result<MetricUpdate, AppError>>;

pub trait UpdateTransport: Send + 'static {
    fn connect(self) -> impl Future<Output = Result<UpdateStream, AppError>> + Send;
}

#[derive(Debug)]
pub enum BridgeSignal {
    Event(LiveEvent),
    Error(AppError),
    Complete,
}

impl BridgeSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Event(_))
    }
}

#[derive(Debug)]
pub struct BridgeHandle {
    cancel_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Idempotent; after it returns the paired receiver yields nothing more.
    pub fn close(&mut self) {
        self.cancel_token.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
pub struct BridgeReceiver {
    receiver: mpsc::Receiver<BridgeSignal>,
    cancel_token: CancellationToken,
}

impl BridgeReceiver {
    pub async fn recv(&mut self) -> Option<BridgeSignal> {
        if self.cancel_token.is_cancelled() {
            return None;
        }
        let signal = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return None,
            signal = self.receiver.recv() => signal,
        };
        if self.cancel_token.is_cancelled() {
            return None;
        }
        signal
    }
}

pub fn open_bridge<T: UpdateTransport>(transport: T) -> (BridgeHandle, BridgeReceiver) {
    let cancel_token = CancellationToken::new();
    let (sender, receiver) = mpsc::channel(BRIDGE_CHANNEL_CAPACITY);

    let pump_cancel = cancel_token.clone();
    let join_handle = tokio::spawn(async move {
        run_bridge_pump(transport, sender, pump_cancel).await;
    });

    (
        BridgeHandle {
            cancel_token: cancel_token.clone(),
            join_handle: Some(join_handle),
        },
        BridgeReceiver {
            receiver,
            cancel_token,
        },
    )
}

async fn run_bridge_pump<T: UpdateTransport>(
    transport: T,
    sender: mpsc::Sender<BridgeSignal>,
    cancel_token: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel_token.cancelled() => return,
        connected = transport.connect() => connected,
    };

    let mut stream = match connected {
        Ok(stream) => stream,
        Err(error) => {
            warn!("live transport failed to connect: {error}");
            let _ = sender.send(BridgeSignal::Error(error)).await;
            return;
        }
    };
    debug!("live bridge connected");

    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => return,
            next = stream.next() => next,
        };

        let signal = match next {
            None => BridgeSignal::Complete,
            Some(Err(error)) => BridgeSignal::Error(error),
            Some(Ok(update)) => match LiveEvent::try_from(&update) {
                Ok(event) => BridgeSignal::Event(event),
                Err(error) => {
                    warn!(metric = %update.identifier.key(), "dropping live update: {error}");
                    continue;
                }
            },
        };

        let terminal = signal.is_terminal();
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            sent = sender.send(signal) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        if terminal {
            return;
        }
    }
}

#[derive(Debug)]
pub struct ChannelTransport {
    receiver: mpsc::Receiver<Result<MetricUpdate, AppError>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (mpsc::Sender<Result<MetricUpdate, AppError>>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self { receiver })
    }
}

impl UpdateTransport for ChannelTransport {
    async fn connect(self) -> Result<UpdateStream, AppError> {
        let stream = futures_util::stream::unfold(self.receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticTransport {
    metrics: Vec<MetricInfo>,
    interval_ms: u64,
}

impl SyntheticTransport {
    pub fn new(metrics: Vec<MetricInfo>) -> Self {
        Self::with_interval(metrics, SYNTHETIC_UPDATE_INTERVAL_MS)
    }

    pub fn with_interval(metrics: Vec<MetricInfo>, interval_ms: u64) -> Self {
        Self {
            metrics,
            interval_ms: interval_ms.max(1),
        }
    }
}

fn synthetic_update(metric: &MetricInfo, step: u64, timestamp: i64) -> MetricUpdate {
    let value = match metric.kind() {
        MetricKind::Boolean => WireValue::Text((step % 2 == 0).to_string()),
        MetricKind::Numeric => {
            let phase = synthetic_phase(&metric.key());
            WireValue::Text(format!("{:.3}", synthetic_value(phase, timestamp)))
        }
    };
    MetricUpdate {
        identifier: metric.identifier.clone(),
        value,
        timestamp,
    }
}

impl UpdateTransport for SyntheticTransport {
    async fn connect(self) -> Result<UpdateStream, AppError> {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stream = futures_util::stream::unfold(
            (self.metrics, ticker, 0_u64),
            |(metrics, mut ticker, step)| async move {
                if metrics.is_empty() {
                    return None;
                }
                ticker.tick().await;
                let metric = &metrics[(step % metrics.len() as u64) as usize];
                let update = synthetic_update(metric, step / metrics.len() as u64, now_unix_ms());
                Some((Ok(update), (metrics, ticker, step.saturating_add(1))))
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::identity::MetricIdentifier;
    use crate::telemetry::types::Sample;

    fn update(metric_id: &str, value: &str, timestamp: i64) -> MetricUpdate {
        MetricUpdate {
            identifier: MetricIdentifier::new("plant", "edge", "pump", metric_id),
            value: WireValue::Text(value.to_string()),
            timestamp,
        }
    }

    fn metric(metric_id: &str, type_name: &str) -> MetricInfo {
        MetricInfo {
            identifier: MetricIdentifier::new("plant", "edge", "pump", metric_id),
            name: metric_id.to_string(),
            type_name: type_name.to_string(),
        }
    }

    struct RefusingTransport;

    impl UpdateTransport for RefusingTransport {
        async fn connect(self) -> Result<UpdateStream, AppError> {
            Err(AppError::Stream("handshake rejected".to_string()))
        }
    }

    #[tokio::test]
    async fn forwards_events_then_completes() {
        let (sender, transport) = ChannelTransport::new(8);
        let (_handle, mut receiver) = open_bridge(transport);

        sender
            .send(Ok(update("pressure", "2.5", 1_000)))
            .await
            .expect("bridge should accept updates");
        drop(sender);

        let Some(BridgeSignal::Event(event)) = receiver.recv().await else {
            panic!("expected an event");
        };
        assert_eq!(event.key.as_str(), "plant/edge/pump/pressure");
        assert_eq!(event.sample, Sample::new(2.5, 1_000));

        assert!(matches!(receiver.recv().await, Some(BridgeSignal::Complete)));
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn undecodable_values_are_skipped() {
        let (sender, transport) = ChannelTransport::new(8);
        let (_handle, mut receiver) = open_bridge(transport);

        sender
            .send(Ok(update("pressure", "garbage", 1_000)))
            .await
            .expect("bridge should accept updates");
        sender
            .send(Ok(update("pressure", "true", 2_000)))
            .await
            .expect("bridge should accept updates");

        let Some(BridgeSignal::Event(event)) = receiver.recv().await else {
            panic!("expected the valid event");
        };
        assert_eq!(event.sample, Sample::new(1.0, 2_000));
    }

    #[tokio::test]
    async fn transport_error_is_delivered_once_and_ends_the_stream() {
        let (sender, transport) = ChannelTransport::new(8);
        let (_handle, mut receiver) = open_bridge(transport);

        sender
            .send(Err(AppError::Stream("socket reset".to_string())))
            .await
            .expect("bridge should accept errors");
        let _ = sender.send(Ok(update("pressure", "1", 1_000))).await;

        assert!(matches!(
            receiver.recv().await,
            Some(BridgeSignal::Error(AppError::Stream(_)))
        ));
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_stream_error() {
        let (_handle, mut receiver) = open_bridge(RefusingTransport);

        assert!(matches!(
            receiver.recv().await,
            Some(BridgeSignal::Error(AppError::Stream(_)))
        ));
    }

    #[tokio::test]
    async fn nothing_is_delivered_after_close() {
        let (sender, transport) = ChannelTransport::new(8);
        let (mut handle, mut receiver) = open_bridge(transport);

        sender
            .send(Ok(update("pressure", "1", 1_000)))
            .await
            .expect("bridge should accept updates");
        tokio::task::yield_now().await;

        handle.close();
        handle.close();
        let _ = sender.send(Ok(update("pressure", "2", 2_000))).await;

        assert!(handle.is_closed());
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn synthetic_transport_cycles_through_metrics() {
        let transport = SyntheticTransport::with_interval(
            vec![metric("pressure", "Float"), metric("running", "Boolean")],
            10,
        );
        let (_handle, mut receiver) = open_bridge(transport);

        let mut keys = Vec::new();
        for _ in 0..4 {
            let Some(BridgeSignal::Event(event)) = receiver.recv().await else {
                panic!("expected synthetic events");
            };
            keys.push(event.key.as_str().to_string());
            if event.key.as_str().ends_with("running") {
                assert!(event.sample.value == 0.0 || event.sample.value == 1.0);
            }
        }

        assert_eq!(
            keys,
            vec![
                "plant/edge/pump/pressure",
                "plant/edge/pump/running",
                "plant/edge/pump/pressure",
                "plant/edge/pump/running",
            ]
        );
    }
}
