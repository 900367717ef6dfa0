use crate::config::ServiceConfig;
use crate::error::AppError;
use crate::telemetry::client::ScadaClient;
use crate::telemetry::session::{SessionCommand, SessionShared};
use crate::telemetry::window::WindowModel;
use reqwest::Client;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SessionHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        let _ = self.join_handle.await;
    }
}

pub struct AppState {
    pub started_at: Instant,
    pub client: ScadaClient,
    pub window_model: WindowModel,
    pub session: Mutex<Option<SessionHandle>>,
    pub shared: SessionShared,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            started_at: Instant::now(),
            client: ScadaClient::new(Client::new(), config),
            window_model: WindowModel::default(),
            session: Mutex::new(None),
            shared: SessionShared::default(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        self.client.config()
    }

    /// Forwards a command to the running session.
    pub async fn send_command(&self, command: SessionCommand) -> Result<(), AppError> {
        let commands = {
            let slot = self.session.lock().await;
            slot.as_ref()
                .map(|handle| handle.commands.clone())
                .ok_or_else(|| AppError::State("no dashboard session is running".to_string()))?
        };
        commands
            .send(command)
            .await
            .map_err(|_| AppError::State("dashboard session has stopped".to_string()))
    }
}
