use crate::config::ServiceConfig;
use crate::error::AppError;
use crate::telemetry::bridge::{UpdateStream, UpdateTransport};
use crate::telemetry::types::{HistoryRequest, MetricHistoryWire, MetricUpdate, SparkplugGroupWire};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const GRAPHQL_WS_PROTOCOL: &str = "graphql-transport-ws";
const SUBSCRIPTION_ID: &str = "metric-update";

const HISTORY_QUERY: &str = r#"
query History($start: DateTime!, $end: DateTime!, $metrics: [MetricHistoryEntry!]!, $interval: String, $samples: Int, $raw: Boolean) {
  history(start: $start, end: $end, metrics: $metrics, interval: $interval, samples: $samples, raw: $raw) {
    groupId
    nodeId
    deviceId
    metricId
    history { value timestamp }
  }
}
"#;

const GROUPS_QUERY: &str = r#"
query GetGroups {
  groups {
    id
    nodes {
      id
      metrics { id name value type scanRate }
      devices {
        id
        metrics { id name value type scanRate }
      }
    }
  }
}
"#;

const METRIC_UPDATE_SUBSCRIPTION: &str = r#"
subscription {
  metricUpdate {
    groupId
    nodeId
    deviceId
    metricId
    value
    timestamp
  }
}
"#;

pub type ScadaWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn subscription_endpoint(ws_url: &str, api_key: &str) -> String {
    let separator = if ws_url.contains('?') { '&' } else { '?' };
    format!("{ws_url}{separator}token={api_key}")
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a, V: Serialize> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<V>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorWire {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<GraphqlErrorWire>>,
}

fn join_error_messages(errors: &[GraphqlErrorWire]) -> String {
    errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_graphql<T>(payload: GraphqlResponse<T>) -> Result<T, AppError> {
    if let Some(errors) = payload.errors.filter(|errors| !errors.is_empty()) {
        return Err(AppError::Fetch(format!(
            "GraphQL errors: {}",
            join_error_messages(&errors)
        )));
    }
    payload
        .data
        .ok_or_else(|| AppError::Fetch("GraphQL response carried no data".to_string()))
}

#[derive(Debug, Deserialize)]
struct HistoryData {
    history: Vec<MetricHistoryWire>,
}

#[derive(Debug, Deserialize)]
struct GroupsData {
    groups: Vec<SparkplugGroupWire>,
}

#[derive(Debug, Clone)]
pub struct ScadaClient {
    http: Client,
    config: ServiceConfig,
}

impl ScadaClient {
    pub fn new(http: Client, config: ServiceConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn query<T, V>(&self, query: &str, variables: Option<V>) -> Result<T, AppError>
    where
        T: DeserializeOwned,
        V: Serialize,
    {
        let api_key = self.config.require_api_key()?;
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&GraphqlRequest { query, variables })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Fetch(format!(
                "API request failed: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            )));
        }

        let payload = response.json::<GraphqlResponse<T>>().await?;
        decode_graphql(payload)
    }

    pub async fn fetch_history_wire(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<MetricHistoryWire>, AppError> {
        let data: HistoryData = self.query(HISTORY_QUERY, Some(request)).await?;
        Ok(data.history)
    }

    pub async fn fetch_groups(&self) -> Result<Vec<SparkplugGroupWire>, AppError> {
        let data: GroupsData = self.query::<_, ()>(GROUPS_QUERY, None).await?;
        Ok(data.groups)
    }

    pub fn live_transport(&self) -> Result<GraphqlWsTransport, AppError> {
        Ok(GraphqlWsTransport {
            ws_url: self.config.ws_url.clone(),
            api_key: self.config.require_api_key()?.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmptyPayload {}

#[derive(Debug, Serialize)]
struct SubscribePayload<'a> {
    query: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
    ConnectionInit { payload: EmptyPayload },
    Subscribe {
        id: &'a str,
        payload: SubscribePayload<'a>,
    },
    Pong {},
}

impl ClientFrame<'_> {
    fn to_message(&self) -> Result<Message, AppError> {
        let text = serde_json::to_string(self)
            .map_err(|error| AppError::Stream(format!("failed to encode frame: {error}")))?;
        Ok(Message::Text(text))
    }
}

#[derive(Debug, Deserialize)]
struct ServerFrameWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricUpdateDataWire {
    metric_update: Option<MetricUpdate>,
}

#[derive(Debug, Deserialize)]
struct NextPayloadWire {
    data: Option<MetricUpdateDataWire>,
    #[serde(default)]
    errors: Option<Vec<GraphqlErrorWire>>,
}

#[derive(Debug, Clone, PartialEq)]
enum ServerFrame {
    ConnectionAck,
    Next(MetricUpdate),
    Error(String),
    Complete,
    Ping,
    Ignored,
}

fn decode_server_frame(payload: &[u8]) -> Result<ServerFrame, AppError> {
    let wire: ServerFrameWire = serde_json::from_slice(payload)
        .map_err(|error| AppError::Stream(format!("invalid subscription frame: {error}")))?;

    let frame = match wire.kind.as_str() {
        "connection_ack" => ServerFrame::ConnectionAck,
        "ping" => ServerFrame::Ping,
        "complete" => ServerFrame::Complete,
        "next" => {
            let Some(payload) = wire.payload else {
                return Ok(ServerFrame::Ignored);
            };
            let next: NextPayloadWire = serde_json::from_value(payload).map_err(|error| {
                AppError::Stream(format!("invalid metricUpdate payload: {error}"))
            })?;
            if let Some(errors) = next.errors.filter(|errors| !errors.is_empty()) {
                ServerFrame::Error(join_error_messages(&errors))
            } else {
                match next.data.and_then(|data| data.metric_update) {
                    Some(update) => ServerFrame::Next(update),
                    None => ServerFrame::Ignored,
                }
            }
        }
        "error" | "connection_error" => {
            let message = match wire.payload {
                Some(payload) => serde_json::from_value::<Vec<GraphqlErrorWire>>(payload.clone())
                    .map(|errors| join_error_messages(&errors))
                    .unwrap_or_else(|_| payload.to_string()),
                None => "subscription rejected".to_string(),
            };
            ServerFrame::Error(message)
        }
        _ => ServerFrame::Ignored,
    };
    Ok(frame)
}

pub async fn connect_metric_update_stream(
    ws_url: &str,
    api_key: &str,
) -> Result<ScadaWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let mut request = subscription_endpoint(ws_url, api_key).into_client_request()?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(GRAPHQL_WS_PROTOCOL),
    );
    let (mut stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;

    stream
        .send(
            ClientFrame::ConnectionInit {
                payload: EmptyPayload {},
            }
            .to_message()?,
        )
        .await?;

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match decode_server_frame(text.as_bytes())? {
                ServerFrame::ConnectionAck => break,
                ServerFrame::Ping => stream.send(ClientFrame::Pong {}.to_message()?).await?,
                ServerFrame::Error(message) => {
                    return Err(AppError::Stream(format!("connection rejected: {message}")))
                }
                _ => {}
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(AppError::Stream(
                    "connection closed before acknowledgement".to_string(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => return Err(error.into()),
        }
    }

    stream
        .send(
            ClientFrame::Subscribe {
                id: SUBSCRIPTION_ID,
                payload: SubscribePayload {
                    query: METRIC_UPDATE_SUBSCRIPTION,
                },
            }
            .to_message()?,
        )
        .await?;

    debug!("metricUpdate subscription started");
    Ok(stream)
}

fn into_update_stream(stream: ScadaWsStream) -> UpdateStream {
    futures_util::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        loop {
            let message = match stream.next().await {
                None => return None,
                Some(Err(error)) => return Some((Err(error.into()), None)),
                Some(Ok(message)) => message,
            };
            let payload = match message {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => return None,
                _ => continue,
            };
            match decode_server_frame(&payload) {
                Ok(ServerFrame::Next(update)) => return Some((Ok(update), Some(stream))),
                Ok(ServerFrame::Complete) => return None,
                Ok(ServerFrame::Error(message)) => {
                    return Some((Err(AppError::Stream(message)), None))
                }
                Ok(ServerFrame::Ping) => {
                    let frame = ClientFrame::Pong {};
                    let pong = match frame.to_message() {
                        Ok(pong) => pong,
                        Err(error) => return Some((Err(error), None)),
                    };
                    if let Err(error) = stream.send(pong).await {
                        return Some((Err(error.into()), None));
                    }
                }
                Ok(ServerFrame::ConnectionAck | ServerFrame::Ignored) => {}
                Err(error) => warn!("skipping subscription frame: {error}"),
            }
        }
    })
    .boxed()
}

#[derive(Debug, Clone)]
pub struct GraphqlWsTransport {
    ws_url: String,
    api_key: String,
}

impl UpdateTransport for GraphqlWsTransport {
    async fn connect(self) -> Result<UpdateStream, AppError> {
        let stream = connect_metric_update_stream(&self.ws_url, &self.api_key).await?;
        Ok(into_update_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_endpoint_carries_token() {
        let endpoint = subscription_endpoint("wss://api.anywherescada.com/graphql", "as_live_1");
        assert_eq!(endpoint, "wss://api.anywherescada.com/graphql?token=as_live_1");

        let with_query = subscription_endpoint("wss://host/graphql?v=2", "k");
        assert!(with_query.ends_with("?v=2&token=k"));
    }

    #[test]
    fn client_frames_use_protocol_type_tags() {
        let init = serde_json::to_string(&ClientFrame::ConnectionInit {
            payload: EmptyPayload {},
        })
        .expect("init frame should encode");
        assert_eq!(init, r#"{"type":"connection_init","payload":{}}"#);

        let pong = serde_json::to_string(&ClientFrame::Pong {}).expect("pong should encode");
        assert_eq!(pong, r#"{"type":"pong"}"#);
    }

    #[test]
    fn decodes_next_frame_into_metric_update() {
        let frame = decode_server_frame(
            br#"{"id":"metric-update","type":"next","payload":{"data":{"metricUpdate":{"groupId":"g","nodeId":"n","deviceId":"d","metricId":"m","value":"3.5","timestamp":1700000000000}}}}"#,
        )
        .expect("next frame should decode");

        let ServerFrame::Next(update) = frame else {
            panic!("expected next frame, got {frame:?}");
        };
        assert_eq!(update.identifier.key().as_str(), "g/n/d/m");
        assert_eq!(update.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn decodes_error_frame_messages() {
        let frame = decode_server_frame(
            br#"{"id":"metric-update","type":"error","payload":[{"message":"unauthorized"},{"message":"try again"}]}"#,
        )
        .expect("error frame should decode");
        assert_eq!(frame, ServerFrame::Error("unauthorized, try again".to_string()));
    }

    #[test]
    fn control_frames_are_recognized() {
        assert_eq!(
            decode_server_frame(br#"{"type":"connection_ack"}"#).ok(),
            Some(ServerFrame::ConnectionAck)
        );
        assert_eq!(
            decode_server_frame(br#"{"type":"ping","payload":{}}"#).ok(),
            Some(ServerFrame::Ping)
        );
        assert_eq!(
            decode_server_frame(br#"{"id":"metric-update","type":"complete"}"#).ok(),
            Some(ServerFrame::Complete)
        );
        assert!(decode_server_frame(b"not json").is_err());
    }

    #[test]
    fn graphql_errors_become_fetch_errors() {
        let payload: GraphqlResponse<HistoryData> = serde_json::from_str(
            r#"{"data":null,"errors":[{"message":"bad range"},{"message":"too many metrics"}]}"#,
        )
        .expect("envelope should decode");

        let result = decode_graphql(payload);
        let Err(AppError::Fetch(message)) = result else {
            panic!("expected fetch error");
        };
        assert_eq!(message, "GraphQL errors: bad range, too many metrics");
    }

    #[test]
    fn missing_key_blocks_live_transport() {
        let client = ScadaClient::new(Client::new(), ServiceConfig::from_lookup(|_| None));
        assert!(matches!(
            client.live_transport(),
            Err(AppError::Configuration(_))
        ));
    }
}
