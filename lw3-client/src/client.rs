//! High-level client API.
//!
//! [`Client`] turns the signature-tagged wire protocol into async request
//! methods and a callback-based subscription API over one reconnecting
//! [`Connection`].

use crate::connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
use crate::error::ClientError;
use crate::view::NodeView;
use lw3_protocol::{
    convert_value, escape, line_value, unescape, BlockAssembler, Change, ErrorCode, Incoming,
    Signature, SignatureCounter, Value,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Default time a request waits for its response block.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Subscription callback: `(node path, property, converted value)`.
pub type ChangeCallback = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Engine options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Time a request waits for its response before failing with
    /// [`ClientError::Timeout`].
    pub request_timeout: Duration,
    /// Keep at most one request on the wire; later requests queue FIFO.
    pub wait_responses: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            wait_responses: false,
        }
    }
}

impl ClientOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_wait_responses(mut self, wait: bool) -> Self {
        self.wait_responses = wait;
        self
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Error(String),
}

type Responder = oneshot::Sender<Result<Vec<String>, ClientError>>;

/// Checks a response block under the engine lock, before later lines are
/// processed and before `sync()` waiters are released. State changes made
/// here are ordered with the notifications that follow the block.
type Accept = Box<dyn FnOnce(&mut EngineState, &[String]) -> Result<(), ClientError> + Send>;

fn checked<F>(check: F) -> Accept
where
    F: FnOnce(&mut EngineState, &[String]) -> Result<(), ClientError> + Send + 'static,
{
    Box::new(check)
}

fn accept_with(check: fn(&[String]) -> Result<(), ClientError>) -> Accept {
    checked(move |_, lines| check(lines))
}

struct Pending {
    id: u64,
    signature: Signature,
    line: String,
    sent: bool,
    accept: Option<Accept>,
    responder: Option<Responder>,
}

impl Pending {
    fn reply(&mut self, result: Result<Vec<String>, ClientError>) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(result);
        }
    }
}

struct Subscriber {
    id: u64,
    path: String,
    property: String,
    value: String,
    callback: ChangeCallback,
    remaining: Option<u32>,
}

impl Subscriber {
    fn matches(&self, change: &Change) -> bool {
        self.path == change.path
            && (self.property.is_empty() || self.property == change.property)
            && (self.value.is_empty() || self.value == change.raw_value())
    }
}

struct EngineState {
    counter: SignatureCounter,
    next_request: u64,
    pending: Vec<Pending>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    /// Unescaped property values of open nodes.
    cache: HashMap<String, HashMap<String, String>>,
    assembler: BlockAssembler,
    sync_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    connected: bool,
}

impl EngineState {
    fn new() -> Self {
        Self {
            counter: SignatureCounter::new(),
            next_request: 0,
            pending: Vec::new(),
            subscribers: Vec::new(),
            next_subscription: 1,
            cache: HashMap::new(),
            assembler: BlockAssembler::new(),
            sync_waiters: Vec::new(),
            connected: false,
        }
    }

    fn is_subscribed(&self, path: &str) -> bool {
        self.subscribers.iter().any(|s| s.path == path)
    }

    fn subscribed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for sub in &self.subscribers {
            if !paths.contains(&sub.path) {
                paths.push(sub.path.clone());
            }
        }
        paths
    }

    fn fail_sync(&mut self, reason: &str) {
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::SyncInterrupted(reason.to_string())));
        }
    }

    fn resolve_sync(&mut self) {
        if self.pending.is_empty() {
            for waiter in self.sync_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }
}

struct Inner {
    connection: Connection,
    options: ClientOptions,
    state: Mutex<EngineState>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ClientEvent>,
}

/// LW3 client.
///
/// Cloning is cheap; clones share the connection. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Creates a client with default options and starts connecting.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_options(config, ClientOptions::default())
    }

    pub fn with_options(config: ConnectionConfig, options: ClientOptions) -> Self {
        let (connection, events_rx) = Connection::spawn(config);
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            connection,
            options,
            state: Mutex::new(EngineState::new()),
            connected,
            events,
        });
        tokio::spawn(run_engine(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    /// Returns whether the engine is connected and accepting requests.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Returns the transport state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Waits until the engine is connected.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.inner.connected.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|connected| *connected))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(())
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the underlying transport.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&self) {
        self.inner.connection.close();
    }

    /// Reconnects after [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        self.inner.connection.reopen();
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Reads one property (`/NODE.Property`).
    ///
    /// Properties of open nodes are answered from the cache; a round trip
    /// to an open node refreshes its cache entry.
    pub async fn get(&self, path: &str) -> Result<Value, ClientError> {
        let (node, property) = split_property_path(path)?;
        if let Some(value) = self.cached_raw(node, property) {
            return Ok(convert_value(&value));
        }

        let (node, property) = (node.to_string(), property.to_string());
        let accept = checked(move |state, lines| {
            let value = property_value(lines)?;
            if let Some(slot) = state.cache.get_mut(&node) {
                slot.insert(property, unescape(value));
            }
            Ok(())
        });
        let lines = self.send(&format!("GET {}", path), accept).await?;
        Ok(convert_value(&unescape(property_value(&lines)?)))
    }

    /// Writes one property (`/NODE.Property`).
    pub async fn set(&self, path: &str, value: impl Into<Value>) -> Result<(), ClientError> {
        let value = value.into().to_string();
        self.send(
            &format!("SET {}={}", path, escape(&value)),
            accept_with(expect_acknowledged),
        )
        .await?;
        Ok(())
    }

    /// Invokes a method (`/NODE:method`) with a comma separated argument
    /// string and returns its unescaped result.
    pub async fn call(&self, path: &str, args: &str) -> Result<String, ClientError> {
        let lines = self
            .send(
                &format!("CALL {}({})", path, escape(args)),
                accept_with(|lines| method_result(lines).map(|_| ())),
            )
            .await?;
        method_result(&lines)
    }

    /// Reads all properties of a node.
    pub async fn fetch_all(&self, path: &str) -> Result<Vec<(String, Value)>, ClientError> {
        let path = normalize_path(path);
        let node = path.to_string();
        let accept = checked(move |state, lines| {
            let raw = property_list(lines)?;
            if let Some(slot) = state.cache.get_mut(&node) {
                slot.extend(raw);
            }
            Ok(())
        });
        let lines = self.send(&format!("GET {}.*", path), accept).await?;
        Ok(property_list(&lines)?
            .into_iter()
            .map(|(name, value)| {
                let value = convert_value(&value);
                (name, value)
            })
            .collect())
    }

    /// Lists the child node paths of a node.
    pub async fn children(&self, path: &str) -> Result<Vec<String>, ClientError> {
        let path = normalize_path(path);
        let lines = self
            .send(&format!("GET {}", path), accept_with(expect_no_error))
            .await?;
        Ok(lines
            .iter()
            .filter_map(|line| line.strip_prefix("n- "))
            .map(str::to_string)
            .collect())
    }

    /// Fetches manuals: `/NODE.*`, `/NODE.Property` or `/NODE:method`.
    ///
    /// Returns `(target, manual)` pairs.
    pub async fn manual(&self, target: &str) -> Result<Vec<(String, String)>, ClientError> {
        let lines = self
            .send(
                &format!("MAN {}", target),
                accept_with(|lines| manual_list(lines).map(|_| ())),
            )
            .await?;
        manual_list(&lines)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes to changes of a node.
    ///
    /// `rule` is `Property`, `Property=value` or empty / `*` for every
    /// property; the value filter compares the escaped wire value. With a
    /// `count` the subscription closes itself after that many calls.
    ///
    /// One `OPEN` is sent per path; later subscriptions to the same path
    /// share it. The subscription is live from the confirmation on, so a
    /// change sent right behind it is delivered. Returns the subscription id.
    pub async fn open<F>(
        &self,
        path: &str,
        rule: &str,
        count: Option<u32>,
        callback: F,
    ) -> Result<u64, ClientError>
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        let path = normalize_path(path);
        let (property, value) = parse_rule(rule);

        let (id, rx) = {
            let mut state = self.inner.state.lock();
            let id = state.next_subscription;
            state.next_subscription += 1;
            let subscriber = Subscriber {
                id,
                path: path.to_string(),
                property: property.to_string(),
                value: value.to_string(),
                callback: Arc::new(callback),
                remaining: count.filter(|n| *n > 0),
            };
            if state.is_subscribed(path) {
                state.subscribers.push(subscriber);
                tracing::debug!("Subscription {} added on {}", id, path);
                return Ok(id);
            }

            let node = path.to_string();
            let accept = checked(move |state, lines| {
                check_open_response(lines, &node)?;
                state.cache.entry(node).or_default();
                state.subscribers.push(subscriber);
                Ok(())
            });
            (id, self.submit_locked(&mut state, &format!("OPEN {}", path), accept)?)
        };
        rx.await.map_err(|_| ClientError::ConnectionClosed)??;
        tracing::debug!("Subscription {} opened on {}", id, path);
        Ok(id)
    }

    /// Drops a subscription.
    ///
    /// `CLOSE` is sent only when no other subscription uses the path; the
    /// path's cache is invalidated once the server confirms.
    pub async fn close(&self, subscription: u64) -> Result<(), ClientError> {
        let (path, last) = {
            let mut state = self.inner.state.lock();
            let pos = state
                .subscribers
                .iter()
                .position(|s| s.id == subscription)
                .ok_or(ClientError::UnknownSubscription(subscription))?;
            let sub = state.subscribers.remove(pos);
            let last = !state.is_subscribed(&sub.path);
            (sub.path, last)
        };
        tracing::debug!("Subscription {} closed on {}", subscription, path);
        if last {
            self.close_path(&path).await?;
        }
        Ok(())
    }

    /// Waits for the first change matching `rule` on `path`.
    pub async fn wait_for(&self, path: &str, rule: &str) -> Result<Value, ClientError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.open(path, rule, Some(1), move |_, _, value| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(value.clone());
            }
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Opens a live view of a node: a property snapshot kept current by
    /// change notifications.
    pub async fn view(&self, path: &str) -> Result<NodeView, ClientError> {
        let path = normalize_path(path).to_string();
        let values = Arc::new(RwLock::new(BTreeMap::new()));
        let sink = values.clone();
        let subscription = self
            .open(&path, "", None, move |_, property, value| {
                sink.write().insert(property.to_string(), value.clone());
            })
            .await?;

        match self.fetch_all(&path).await {
            Ok(properties) => {
                let mut values = values.write();
                for (name, value) in properties {
                    // Notifications seen meanwhile are at least as recent.
                    values.entry(name).or_insert(value);
                }
            }
            Err(e) => {
                let _ = self.close(subscription).await;
                return Err(e);
            }
        }
        Ok(NodeView::new(self.clone(), path, subscription, values))
    }

    /// Returns the number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Returns the cached value of a property of an open node.
    pub fn cached(&self, path: &str) -> Option<Value> {
        let (node, property) = split_property_path(path).ok()?;
        self.cached_raw(node, property).map(|v| convert_value(&v))
    }

    /// Resolves once no request is pending.
    ///
    /// Fails if a request times out, is answered with an error or a
    /// malformed block, or the connection drops meanwhile.
    pub async fn sync(&self) -> Result<(), ClientError> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.pending.is_empty() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.sync_waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    // =========================================================================
    // Engine
    // =========================================================================

    fn cached_raw(&self, node: &str, property: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .cache
            .get(node)
            .and_then(|slot| slot.get(property))
            .cloned()
    }

    async fn send(&self, command: &str, accept: Accept) -> Result<Vec<String>, ClientError> {
        let rx = self.submit(command, accept)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    fn submit(
        &self,
        command: &str,
        accept: Accept,
    ) -> Result<oneshot::Receiver<Result<Vec<String>, ClientError>>, ClientError> {
        let mut state = self.inner.state.lock();
        self.submit_locked(&mut state, command, accept)
    }

    /// Registers a request and writes it unless it has to queue.
    fn submit_locked(
        &self,
        state: &mut EngineState,
        command: &str,
        accept: Accept,
    ) -> Result<oneshot::Receiver<Result<Vec<String>, ClientError>>, ClientError> {
        if !state.connected {
            return Err(ClientError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        let signature = state.counter.allocate();
        let id = state.next_request;
        state.next_request += 1;
        let line = format!("{}#{}\n", signature, command);
        let send_now = !self.inner.options.wait_responses || state.pending.is_empty();
        if send_now {
            self.inner.connection.write(line.as_str())?;
        }
        state.pending.push(Pending {
            id,
            signature,
            line,
            sent: send_now,
            accept: Some(accept),
            responder: Some(tx),
        });

        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.options.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Client { inner }.expire(id);
            }
        });
        Ok(rx)
    }

    fn expire(&self, id: u64) {
        let mut state = self.inner.state.lock();
        let Some(pos) = state.pending.iter().position(|p| p.id == id) else {
            return;
        };
        let mut pending = state.pending.remove(pos);
        tracing::warn!(
            "[{}] No answer, timeout: {}",
            pending.signature,
            pending.line.trim_end()
        );
        pending.reply(Err(ClientError::Timeout));
        state.fail_sync(&ClientError::Timeout.to_string());
        self.release_next(&mut state);
        state.resolve_sync();
    }

    /// Writes the oldest queued request when nothing is on the wire.
    fn release_next(&self, state: &mut EngineState) {
        if !self.inner.options.wait_responses || state.pending.iter().any(|p| p.sent) {
            return;
        }
        while let Some(pos) = state.pending.iter().position(|p| !p.sent) {
            match self.inner.connection.write(state.pending[pos].line.as_str()) {
                Ok(()) => {
                    state.pending[pos].sent = true;
                    return;
                }
                Err(e) => {
                    let mut pending = state.pending.remove(pos);
                    state.fail_sync(&e.to_string());
                    pending.reply(Err(e));
                }
            }
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected(),
            ConnectionEvent::Disconnected => self.on_disconnected(),
            ConnectionEvent::Error(message) => {
                tracing::warn!("Connection error: {}", message);
                let _ = self.inner.events.send(ClientEvent::Error(message));
            }
            ConnectionEvent::Line(line) => {
                let incoming = self.inner.state.lock().assembler.push(&line);
                match incoming {
                    Some(Incoming::Change(change)) => self.dispatch_change(change),
                    Some(Incoming::Block { signature, lines }) => {
                        self.resolve_block(signature, lines)
                    }
                    Some(Incoming::Stray(line)) => {
                        tracing::warn!("Unexpected line dropped: {}", line)
                    }
                    None => {}
                }
            }
        }
    }

    fn on_connected(&self) {
        let paths = {
            let mut state = self.inner.state.lock();
            state.counter.reset();
            for mut pending in state.pending.drain(..) {
                pending.reply(Err(ClientError::ConnectionClosed));
            }
            state.assembler.reset();
            state.cache.clear();
            let paths = state.subscribed_paths();
            for path in &paths {
                state.cache.insert(path.clone(), HashMap::new());
            }
            state.connected = true;
            paths
        };
        self.inner.connected.send_replace(true);
        let _ = self.inner.events.send(ClientEvent::Connected);

        for path in paths {
            let node = path.clone();
            let accept = checked(move |_, lines| check_open_response(lines, &node));
            match self.submit(&format!("OPEN {}", path), accept) {
                Ok(rx) => {
                    tokio::spawn(async move {
                        if let Ok(Err(e)) = rx.await {
                            tracing::warn!("Reopening {} failed: {}", path, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Reopening {} failed: {}", path, e),
            }
        }
    }

    fn on_disconnected(&self) {
        {
            let mut state = self.inner.state.lock();
            state.connected = false;
            for mut pending in state.pending.drain(..) {
                pending.reply(Err(ClientError::ConnectionClosed));
            }
            state.fail_sync(&ClientError::ConnectionClosed.to_string());
            state.assembler.reset();
        }
        self.inner.connected.send_replace(false);
        let _ = self.inner.events.send(ClientEvent::Disconnected);
    }

    fn resolve_block(&self, signature: Signature, lines: Vec<String>) {
        let mut state = self.inner.state.lock();
        let Some(pos) = state
            .pending
            .iter()
            .position(|p| p.sent && p.signature == signature)
        else {
            tracing::warn!("Unexpected response block {} dropped", signature);
            return;
        };
        let mut pending = state.pending.remove(pos);
        self.release_next(&mut state);
        let verdict = match pending.accept.take() {
            Some(accept) => accept(&mut state, &lines),
            None => Ok(()),
        };
        match verdict {
            Ok(()) => pending.reply(Ok(lines)),
            Err(e) => {
                tracing::debug!("[{}] Request failed: {}", signature, e);
                state.fail_sync(&e.to_string());
                pending.reply(Err(e));
            }
        }
        state.resolve_sync();
    }

    fn dispatch_change(&self, change: Change) {
        let mut fired: Vec<ChangeCallback> = Vec::new();
        let mut exhausted: Vec<String> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(slot) = state.cache.get_mut(&change.path) {
                slot.insert(change.property.clone(), change.value());
            }
            state.subscribers.retain_mut(|sub| {
                if !sub.matches(&change) {
                    return true;
                }
                fired.push(sub.callback.clone());
                match sub.remaining.as_mut() {
                    Some(n) => {
                        *n -= 1;
                        if *n == 0 {
                            exhausted.push(sub.path.clone());
                            return false;
                        }
                        true
                    }
                    None => true,
                }
            });
            exhausted.retain(|path| !state.is_subscribed(path));
            exhausted.dedup();
        }

        let value = change.converted();
        for callback in fired {
            let result = catch_unwind(AssertUnwindSafe(|| {
                callback(&change.path, &change.property, &value)
            }));
            if result.is_err() {
                tracing::warn!("Subscriber callback for {} panicked", change);
            }
        }

        for path in exhausted {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.close_path(&path).await {
                    tracing::warn!("Closing {} failed: {}", path, e);
                }
            });
        }
    }

    async fn close_path(&self, path: &str) -> Result<(), ClientError> {
        let node = path.to_string();
        let accept = checked(move |state, lines| {
            let line = first_line(lines)?;
            if !line.starts_with("c-") {
                return Err(error_line(line)
                    .unwrap_or_else(|| ClientError::MalformedResponse(line.to_string())));
            }
            if !state.is_subscribed(&node) {
                state.cache.remove(&node);
            }
            Ok(())
        });
        self.send(&format!("CLOSE {}", path), accept).await?;
        Ok(())
    }
}

async fn run_engine(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Client { inner }.handle_event(event);
    }
    tracing::debug!("Client engine stopped");
}

fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

/// Splits `/NODE.Property`; the path must contain exactly one `.`.
fn split_property_path(path: &str) -> Result<(&str, &str), ClientError> {
    if path.matches('.').count() != 1 {
        return Err(ClientError::InvalidPath(path.to_string()));
    }
    path.split_once('.')
        .ok_or_else(|| ClientError::InvalidPath(path.to_string()))
}

/// Splits an OPEN rule into property and value filters.
fn parse_rule(rule: &str) -> (&str, &str) {
    let (property, value) = rule.split_once('=').unwrap_or((rule, ""));
    if property == "*" {
        ("", value)
    } else {
        (property, value)
    }
}

fn first_line(lines: &[String]) -> Result<&str, ClientError> {
    lines
        .first()
        .map(String::as_str)
        .ok_or_else(|| ClientError::MalformedResponse("empty response".into()))
}

fn expect_no_error(lines: &[String]) -> Result<(), ClientError> {
    match lines.iter().find_map(|line| error_line(line)) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn expect_acknowledged(lines: &[String]) -> Result<(), ClientError> {
    first_line(lines)?;
    expect_no_error(lines)
}

/// Escaped value of the single property line answering `GET /NODE.Property`.
fn property_value(lines: &[String]) -> Result<&str, ClientError> {
    let line = match lines {
        [line] => line.as_str(),
        [] => return Err(ClientError::MalformedResponse("empty response".into())),
        _ => {
            return Err(ClientError::MalformedResponse(format!(
                "{} lines in a single property response",
                lines.len()
            )))
        }
    };
    if let Some(err) = error_line(line) {
        return Err(err);
    }
    if !line.starts_with('p') {
        return Err(ClientError::MalformedResponse(line.to_string()));
    }
    line_value(line).ok_or_else(|| ClientError::MalformedResponse(line.to_string()))
}

/// Unescaped `(name, value)` pairs of the property lines of `GET /NODE.*`.
fn property_list(lines: &[String]) -> Result<Vec<(String, String)>, ClientError> {
    expect_no_error(lines)?;
    let mut raw = Vec::new();
    for line in lines.iter().filter(|line| line.starts_with('p')) {
        let (target, value) = line
            .get(3..)
            .and_then(|rest| rest.split_once('='))
            .ok_or_else(|| ClientError::MalformedResponse(line.clone()))?;
        let name = target.rsplit_once('.').map(|(_, name)| name).unwrap_or(target);
        raw.push((name.to_string(), unescape(value)));
    }
    Ok(raw)
}

fn manual_list(lines: &[String]) -> Result<Vec<(String, String)>, ClientError> {
    expect_no_error(lines)?;
    let mut manuals = Vec::new();
    for line in lines {
        if !(line.starts_with("pm ") || line.starts_with("mm ")) {
            return Err(ClientError::MalformedResponse(line.clone()));
        }
        match line[3..].split_once('=') {
            Some((name, manual)) => manuals.push((name.to_string(), unescape(manual))),
            None => manuals.push((line[3..].to_string(), String::new())),
        }
    }
    Ok(manuals)
}

/// Unescaped result of a `mO` line, or the failure it reports.
fn method_result(lines: &[String]) -> Result<String, ClientError> {
    let line = first_line(lines)?;
    if line.starts_with("mO") {
        return Ok(line_value(line).map(unescape).unwrap_or_default());
    }
    if line.starts_with("mE") {
        let code = ErrorCode::from_header(line).unwrap_or(ErrorCode::InternalError);
        return Err(ClientError::Method {
            code,
            message: method_error_message(line, code),
        });
    }
    Err(error_line(line).unwrap_or_else(|| ClientError::MalformedResponse(line.to_string())))
}

/// Maps an error line (`-E`, `pE`, `oE`, `cE`, ...) to a protocol error.
fn error_line(line: &str) -> Option<ClientError> {
    if line.as_bytes().get(1) != Some(&b'E') {
        return None;
    }
    Some(match ErrorCode::from_header(line) {
        Ok(code) => ClientError::Protocol {
            code,
            message: line.to_string(),
        },
        Err(_) => ClientError::MalformedResponse(line.to_string()),
    })
}

/// Extracts the message of `mE /A:m=message %E010:Internal error`, falling
/// back to the code's description.
fn method_error_message(line: &str, code: ErrorCode) -> String {
    let header = line.rfind(" %E").unwrap_or(line.len());
    match line[..header].split_once('=') {
        Some((_, message)) => unescape(message),
        None => code.description().to_string(),
    }
}

fn check_open_response(lines: &[String], path: &str) -> Result<(), ClientError> {
    let line = first_line(lines)?;
    if line.starts_with("o-") && line.contains(path) {
        return Ok(());
    }
    if line.starts_with("oE") && ErrorCode::from_header(line).ok() == Some(ErrorCode::AlreadyExists)
    {
        return Ok(());
    }
    Err(error_line(line).unwrap_or_else(|| ClientError::MalformedResponse(line.to_string())))
}
