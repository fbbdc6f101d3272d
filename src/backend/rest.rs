use super::{Backend, ChangeFeed, FeedScope, Predicate, Query, SubscriptionId};
use crate::error::BackendError;
use crate::settings::settings;
use crate::utils::logs;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::OnceCell;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub user_id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
}

enum Command {
    Join {
        topic: String,
        scope: FeedScope,
        token: String,
        events: UnboundedSender<Value>,
    },
    Leave {
        topic: String,
    },
}

/// Hosted backend over HTTPS (PostgREST tables, password auth) with change
/// feeds multiplexed over a single realtime websocket.
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    schema: String,
    heartbeat: Duration,
    session: ArcSwapOption<Session>,
    realtime: OnceCell<UnboundedSender<Command>>,
    next_subscription: AtomicU64,
    topics: Mutex<HashMap<u64, String>>,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let s = &settings().backend;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(s.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            schema: s.schema.clone(),
            heartbeat: Duration::from_secs(s.heartbeat_secs.max(1)),
            session: ArcSwapOption::empty(),
            realtime: OnceCell::new(),
            next_subscription: AtomicU64::new(0),
            topics: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings() -> Result<Self, BackendError> {
        let s = &settings().backend;
        Self::new(s.url.clone(), s.anon_key.clone())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    fn bearer(&self) -> String {
        self.session
            .load_full()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
            .header("Accept-Profile", &self.schema)
            .header("Content-Profile", &self.schema)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthenticated);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.base_url);
        let builder = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&PasswordGrant { email, password });

        let token: TokenResponse = self.send(builder).await?.json().await?;
        let session = Session {
            access_token: token.access_token,
            user_id: token.user.id,
            email: token.user.email,
        };
        self.session.store(Some(Arc::new(session.clone())));
        logs::log_signed_in(session.user_id, session.email.as_deref());
        Ok(session)
    }

    /// Exact row count for `query`, ignoring its paging.
    pub async fn count(&self, query: &Query) -> Result<usize, BackendError> {
        let mut unpaged = query.clone();
        unpaged.limit = None;
        unpaged.offset = 0;
        let path = format!("{}?{}", unpaged.table, query_string(&unpaged));

        let response = self
            .send(
                self.request(Method::HEAD, &path)
                    .header("Prefer", "count=exact"),
            )
            .await?;
        response
            .headers()
            .get("content-range")
            .and_then(|h| h.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| BackendError::Status {
                status: response.status().as_u16(),
                body: "missing content-range".to_string(),
            })
    }

    async fn connect(&self) -> Result<UnboundedSender<Command>, BackendError> {
        let ws_base = if let Some(host) = self.base_url.strip_prefix("https://") {
            format!("wss://{host}")
        } else if let Some(host) = self.base_url.strip_prefix("http://") {
            format!("ws://{host}")
        } else {
            self.base_url.clone()
        };
        let url = format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base,
            urlencoding::encode(&self.anon_key)
        );

        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BackendError::Socket(e.to_string()))?;
        logs::log_realtime_connected(&ws_base);

        let (tx, rx) = unbounded_channel();
        tokio::spawn(run_socket(socket, rx, self.heartbeat, self.schema.clone()));
        Ok(tx)
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        let path = format!("{}?{}", query.table, query_string(query));
        let rows = self
            .send(self.request(Method::GET, &path))
            .await?
            .json()
            .await?;
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        let rows: Vec<Value> = self
            .send(
                self.request(Method::POST, table)
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?
            .json()
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(format!("{table}: insert returned no row")))
    }

    async fn update(&self, table: &str, id: Uuid, patch: Value) -> Result<Value, BackendError> {
        let rows: Vec<Value> = self
            .send(
                self.request(Method::PATCH, &format!("{table}?id=eq.{id}"))
                    .header("Prefer", "return=representation")
                    .json(&patch),
            )
            .await?
            .json()
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(format!("{table}/{id}")))
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), BackendError> {
        self.send(self.request(Method::DELETE, &format!("{table}?id=eq.{id}")))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, scope: &FeedScope) -> Result<ChangeFeed, BackendError> {
        let commands = self.realtime.get_or_try_init(|| self.connect()).await?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        let topic = format!("realtime:{}:{}", scope.table, id);
        let (tx, rx) = unbounded_channel();

        commands
            .send(Command::Join {
                topic: topic.clone(),
                scope: scope.clone(),
                token: self.bearer(),
                events: tx,
            })
            .map_err(|_| BackendError::Socket("realtime connection closed".to_string()))?;

        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, topic);

        Ok(ChangeFeed {
            id: SubscriptionId(id),
            events: rx,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let topic = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0);
        if let (Some(topic), Some(commands)) = (topic, self.realtime.get()) {
            let _ = commands.send(Command::Leave { topic });
        }
    }

    fn current_user(&self) -> Option<Uuid> {
        self.session.load_full().map(|s| s.user_id)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let Some(session) = self.session.swap(None) else {
            return Ok(());
        };
        let url = format!("{}/auth/v1/logout", self.base_url);
        self.send(
            self.client
                .post(url)
                .header("apikey", &self.anon_key)
                .header("Authorization", format!("Bearer {}", session.access_token)),
        )
        .await?;
        Ok(())
    }
}

fn encode_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn array_literal(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| quote(v)).collect();
    format!("{{{}}}", items.join(","))
}

fn predicate_param(predicate: &Predicate) -> (String, String) {
    match predicate {
        Predicate::Eq(column, Value::Null) => (column.clone(), "is.null".to_string()),
        Predicate::Eq(column, value) => (column.clone(), format!("eq.{}", encode_scalar(value))),
        Predicate::In(column, values) => {
            let items: Vec<String> = values.iter().map(|v| quote(&encode_scalar(v))).collect();
            (column.clone(), format!("in.({})", items.join(",")))
        }
        Predicate::Contains(column, values) => {
            (column.clone(), format!("cs.{}", array_literal(values)))
        }
        Predicate::Overlaps(column, values) => {
            (column.clone(), format!("ov.{}", array_literal(values)))
        }
        Predicate::Gte(column, value) => (column.clone(), format!("gte.{}", encode_scalar(value))),
        Predicate::Lte(column, value) => (column.clone(), format!("lte.{}", encode_scalar(value))),
        Predicate::IsNot(column, value) => (column.clone(), format!("not.is.{value}")),
        Predicate::After { cursor, descending } => {
            let op = if *descending { "lt" } else { "gt" };
            let branches: Vec<String> = (0..cursor.len())
                .map(|i| {
                    let mut terms: Vec<String> = cursor[..i]
                        .iter()
                        .map(|(column, value)| format!("{column}.eq.{}", quote(&encode_scalar(value))))
                        .collect();
                    let (column, value) = &cursor[i];
                    terms.push(format!("{column}.{op}.{}", quote(&encode_scalar(value))));
                    if terms.len() == 1 {
                        terms.remove(0)
                    } else {
                        format!("and({})", terms.join(","))
                    }
                })
                .collect();
            ("or".to_string(), format!("({})", branches.join(",")))
        }
    }
}

pub(crate) fn query_string(query: &Query) -> String {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(query.predicates.iter().map(predicate_param));

    if !query.order.is_empty() {
        let order: Vec<String> = query
            .order
            .iter()
            .map(|o| {
                format!(
                    "{}.{}",
                    o.column,
                    if o.descending { "desc" } else { "asc" }
                )
            })
            .collect();
        params.push(("order".to_string(), order.join(",")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if query.offset > 0 {
        params.push(("offset".to_string(), query.offset.to_string()));
    }

    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

static CONTENT_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+-\d+|\*)/(\d+)$").unwrap());

fn content_range_total(header: &str) -> Option<usize> {
    let caps = CONTENT_RANGE.captures(header.trim())?;
    caps.get(1)?.as_str().parse().ok()
}

fn join_message(topic: &str, scope: &FeedScope, schema: &str, token: &str) -> Value {
    let mut change = json!({
        "event": "*",
        "schema": schema,
        "table": scope.table,
    });
    if let Some((column, value)) = &scope.row_filter {
        change["filter"] = json!(format!("{column}=eq.{value}"));
    }
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": token,
        },
    })
}

/// Turns a realtime frame into `(topic, change event)` when it carries a row
/// change. Other frames are reported and yield `None`.
fn translate_frame(text: &str) -> Option<(String, Value)> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            logs::log_event_dropped("realtime", &format!("unreadable frame: {e}"));
            return None;
        }
    };
    let topic = frame["topic"].as_str().unwrap_or_default().to_string();

    match frame["event"].as_str() {
        Some("postgres_changes") => {
            let data = &frame["payload"]["data"];
            let event = json!({
                "eventType": data["type"],
                "new": data["record"],
                "old": data["old_record"],
            });
            Some((topic, event))
        }
        Some("phx_reply") | Some("system") if frame["payload"]["status"] == "error" => {
            logs::log_realtime_rejected(&topic, &frame["payload"].to_string());
            None
        }
        _ => None,
    }
}

async fn run_socket(
    socket: Socket,
    mut commands: UnboundedReceiver<Command>,
    heartbeat: Duration,
    schema: String,
) {
    let (mut sink, mut stream) = socket.split();
    let mut routes: HashMap<String, UnboundedSender<Value>> = HashMap::new();
    let mut ticker = tokio::time::interval(heartbeat);
    let mut next_ref: u64 = 0;

    loop {
        let outgoing = tokio::select! {
            _ = ticker.tick() => Some(json!({
                "topic": "phoenix",
                "event": "heartbeat",
                "payload": {},
            })),
            command = commands.recv() => match command {
                Some(Command::Join { topic, scope, token, events }) => {
                    let message = join_message(&topic, &scope, &schema, &token);
                    routes.insert(topic, events);
                    Some(message)
                }
                Some(Command::Leave { topic }) => {
                    routes.remove(&topic);
                    Some(json!({ "topic": topic, "event": "phx_leave", "payload": {} }))
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some((topic, event)) = translate_frame(&text) {
                        if let Some(tx) = routes.get(&topic) {
                            let _ = tx.send(event);
                        }
                    }
                    None
                }
                Some(Ok(Message::Close(_))) | None => {
                    logs::log_realtime_closed("server closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    logs::log_realtime_closed(&e.to_string());
                    break;
                }
                Some(Ok(_)) => None,
            },
        };

        if let Some(mut message) = outgoing {
            next_ref += 1;
            message["ref"] = json!(next_ref.to_string());
            if let Err(e) = sink.send(Message::Text(message.to_string())).await {
                logs::log_realtime_closed(&e.to_string());
                break;
            }
        }
    }
}
