//! In-process fakes of the three upstream systems, for tests only

use crate::config::{MqttConfig, MeteringConfig, NetworkServerConfig};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_xlsxwriter::Workbook;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A local port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

// --- metering backend -------------------------------------------------------

#[derive(Default)]
pub struct MeteringState(Mutex<MeteringInner>);

#[derive(Default)]
struct MeteringInner {
    logins: usize,
    reject_logins: bool,
    report: Vec<u8>,
    expire_reports: usize,
    fail_reports: bool,
    report_calls: usize,
    last_request: Option<Value>,
    last_auth: Option<String>,
}

impl MeteringState {
    fn lock(&self) -> MutexGuard<'_, MeteringInner> {
        self.0.lock().unwrap()
    }

    pub fn logins(&self) -> usize {
        self.lock().logins
    }

    pub fn reject_logins(&self) {
        self.lock().reject_logins = true;
    }

    pub fn set_report(&self, body: Vec<u8>) {
        self.lock().report = body;
    }

    /// Answer the next `n` report requests with 401
    pub fn expire_reports(&self, n: usize) {
        self.lock().expire_reports = n;
    }

    pub fn fail_reports(&self) {
        self.lock().fail_reports = true;
    }

    pub fn report_calls(&self) -> usize {
        self.lock().report_calls
    }

    pub fn last_report_request(&self) -> Option<Value> {
        self.lock().last_request.clone()
    }

    pub fn last_report_auth(&self) -> Option<String> {
        self.lock().last_auth.clone()
    }
}

pub struct FakeMetering {
    addr: SocketAddr,
    pub state: Arc<MeteringState>,
}

impl FakeMetering {
    pub async fn start() -> Self {
        let state = Arc::new(MeteringState::default());
        let router = Router::new()
            .route("/api/v1/account/login", post(metering_login))
            .route("/api/v1/record/read/group", post(metering_report))
            .with_state(state.clone());

        Self {
            addr: serve(router).await,
            state,
        }
    }

    pub fn config(&self) -> MeteringConfig {
        MeteringConfig {
            base_url: format!("http://{}/api/v1", self.addr),
            login: "operator".to_string(),
            password: "secret".to_string(),
            meters: Vec::new(),
        }
    }
}

async fn metering_login(State(state): State<Arc<MeteringState>>, Json(body): Json<Value>) -> Response {
    let mut inner = state.lock();
    if inner.reject_logins || body["login"] != "operator" {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad credentials"}))).into_response();
    }
    inner.logins += 1;
    Json(json!({"accessToken": format!("metering-token-{}", inner.logins)})).into_response()
}

async fn metering_report(
    State(state): State<Arc<MeteringState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut inner = state.lock();
    inner.report_calls += 1;
    inner.last_request = Some(body);
    inner.last_auth = authorization(&headers);

    if inner.expire_reports > 0 {
        inner.expire_reports -= 1;
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if inner.fail_reports {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    inner.report.clone().into_response()
}

// --- network server ---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub search: String,
    pub limit: u32,
    pub auth: Option<String>,
}

#[derive(Default)]
pub struct NetworkServerState(Mutex<NetworkServerInner>);

#[derive(Default)]
struct NetworkServerInner {
    logins: usize,
    reject_logins: bool,
    omit_token: bool,
    hits: HashMap<String, Vec<Value>>,
    expire_searches: usize,
    fail_searches_after: Option<usize>,
    garble_searches: bool,
    searches: Vec<SearchQuery>,
}

impl NetworkServerState {
    fn lock(&self) -> MutexGuard<'_, NetworkServerInner> {
        self.0.lock().unwrap()
    }

    pub fn logins(&self) -> usize {
        self.lock().logins
    }

    pub fn reject_logins(&self) {
        self.lock().reject_logins = true;
    }

    pub fn omit_token(&self) {
        self.lock().omit_token = true;
    }

    pub fn add_hits(&self, search: &str, hits: Vec<Value>) {
        self.lock().hits.insert(search.to_string(), hits);
    }

    /// Answer the next `n` searches with 401
    pub fn expire_searches(&self, n: usize) {
        self.lock().expire_searches = n;
    }

    /// Answer every search after the first `n` with 500
    pub fn fail_searches_after(&self, n: usize) {
        self.lock().fail_searches_after = Some(n);
    }

    pub fn fail_searches(&self) {
        self.fail_searches_after(0);
    }

    /// Answer searches with 200 and a body that is not JSON
    pub fn garble_searches(&self) {
        self.lock().garble_searches = true;
    }

    pub fn search_calls(&self) -> usize {
        self.lock().searches.len()
    }

    pub fn last_search(&self) -> Option<SearchQuery> {
        self.lock().searches.last().cloned()
    }
}

pub struct FakeNetworkServer {
    addr: SocketAddr,
    pub state: Arc<NetworkServerState>,
}

impl FakeNetworkServer {
    pub async fn start() -> Self {
        let state = Arc::new(NetworkServerState::default());
        let router = Router::new()
            .route("/api/internal/login", post(network_login))
            .route("/api/internal/search", get(network_search))
            .with_state(state.clone());

        Self {
            addr: serve(router).await,
            state,
        }
    }

    pub fn config(&self) -> NetworkServerConfig {
        NetworkServerConfig {
            base_url: format!("http://{}/api", self.addr),
            email: "admin".to_string(),
            password: "admin".to_string(),
            search_limit: 10,
        }
    }
}

async fn network_login(
    State(state): State<Arc<NetworkServerState>>,
    Json(body): Json<Value>,
) -> Response {
    let mut inner = state.lock();
    if inner.reject_logins || body["email"] != "admin" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    inner.logins += 1;
    if inner.omit_token {
        return Json(json!({})).into_response();
    }
    Json(json!({"jwt": format!("network-token-{}", inner.logins)})).into_response()
}

async fn network_search(
    State(state): State<Arc<NetworkServerState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut inner = state.lock();
    let search = params.get("search").cloned().unwrap_or_default();
    inner.searches.push(SearchQuery {
        search: search.clone(),
        limit: params.get("limit").and_then(|l| l.parse().ok()).unwrap_or(0),
        auth: authorization(&headers),
    });

    if inner.expire_searches > 0 {
        inner.expire_searches -= 1;
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if matches!(inner.fail_searches_after, Some(n) if inner.searches.len() > n) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "search backend unavailable").into_response();
    }
    if inner.garble_searches {
        return "<html>Bad Gateway</html>".into_response();
    }
    let hits = inner.hits.get(&search).cloned().unwrap_or_default();
    Json(json!({ "totalCount": hits.len(), "result": hits })).into_response()
}

// --- MQTT broker ------------------------------------------------------------

/// How the fake broker treats clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    /// CONNACK and PUBACK everything
    Ack,
    /// CONNACK with "not authorized"
    Refuse,
    /// Never answer CONNECT
    Silent,
    /// CONNACK, but never PUBACK
    NoPubAck,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub qos: u8,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct BrokerState(Mutex<BrokerInner>);

#[derive(Default)]
struct BrokerInner {
    connections: usize,
    closed: usize,
    client_ids: Vec<String>,
    published: Vec<Published>,
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.0.lock().unwrap()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.lock().client_ids.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Wait until at least `n` client connections have gone away
    pub async fn wait_for_closed(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.lock().closed >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.lock().closed >= n
    }
}

/// Just enough MQTT 3.1.1 to answer CONNECT, PUBLISH, PINGREQ and DISCONNECT
pub struct FakeBroker {
    addr: SocketAddr,
    pub state: Arc<BrokerState>,
}

impl FakeBroker {
    pub async fn start(mode: BrokerMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_client(stream, mode, accept_state.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn config(&self) -> MqttConfig {
        MqttConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..MqttConfig::default()
        }
    }
}

async fn handle_client(mut stream: TcpStream, mode: BrokerMode, state: Arc<BrokerState>) {
    state.lock().connections += 1;

    while let Some((header, body)) = read_packet(&mut stream).await {
        let reply: Option<Vec<u8>> = match header >> 4 {
            // CONNECT
            1 => {
                state.lock().client_ids.push(connect_client_id(&body));
                match mode {
                    BrokerMode::Silent => None,
                    BrokerMode::Refuse => Some(vec![0x20, 0x02, 0x00, 0x05]),
                    BrokerMode::Ack | BrokerMode::NoPubAck => Some(vec![0x20, 0x02, 0x00, 0x00]),
                }
            }
            // PUBLISH
            3 => {
                let qos = (header >> 1) & 0x03;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                let mut rest = &body[2 + topic_len..];
                let pkid = if qos > 0 {
                    let pkid = [rest[0], rest[1]];
                    rest = &rest[2..];
                    Some(pkid)
                } else {
                    None
                };
                state.lock().published.push(Published {
                    topic,
                    qos,
                    payload: rest.to_vec(),
                });
                match (mode, pkid) {
                    (BrokerMode::Ack, Some([hi, lo])) => Some(vec![0x40, 0x02, hi, lo]),
                    _ => None,
                }
            }
            // PINGREQ
            12 => Some(vec![0xD0, 0x00]),
            // DISCONNECT
            14 => break,
            _ => None,
        };

        if let Some(reply) = reply {
            if stream.write_all(&reply).await.is_err() {
                break;
            }
        }
    }

    state.lock().closed += 1;
}

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;

    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return None;
        }
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

/// Client id from a 3.1.1 CONNECT body (10-byte variable header first)
fn connect_client_id(body: &[u8]) -> String {
    let Some(len) = body.get(10..12) else {
        return String::new();
    };
    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
    body.get(12..12 + len)
        .map(|id| String::from_utf8_lossy(id).into_owned())
        .unwrap_or_default()
}

// --- report fixtures --------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Reading {
    Blank,
    Number(f64),
    Text(&'static str),
}

/// Daily archive workbook: two title rows, header on row 3, one row per meter
pub fn report_xlsx(rows: &[(&str, Reading)]) -> Vec<u8> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();

    sheet.write_string(0, 0, "Суточный архив показаний").unwrap();
    sheet.write_string(1, 0, "Период: 01.05.2024").unwrap();
    for (col, title) in ["№", "Номер прибора", "Показания"].into_iter().enumerate() {
        sheet.write_string(3, col as u16, title).unwrap();
    }

    for (i, (id, reading)) in rows.iter().enumerate() {
        let row = 4 + i as u32;
        sheet.write_number(row, 0, (i + 1) as f64).unwrap();
        sheet.write_string(row, 1, *id).unwrap();
        match reading {
            Reading::Blank => {}
            Reading::Number(value) => {
                sheet.write_number(row, 2, *value).unwrap();
            }
            Reading::Text(text) => {
                sheet.write_string(row, 2, *text).unwrap();
            }
        }
    }

    workbook.save_to_buffer().unwrap()
}
