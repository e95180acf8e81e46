// =============================================================================
// Resilient Streaming Connection — one socket per URL, auto-reconnecting
// =============================================================================
//
// A single actor task owns the socket and the table of wanted subscriptions
// (channel -> set of products). Callers talk to it through a cheap, clonable
// handle that only enqueues commands.
//
// Lifecycle:
//   Disconnected --subscribe--> Connecting --> Open
//   Open --close()--> Closing --> Disconnected (actor exits)
//   Open --socket lost, table non-empty--> Reconnecting{n} --> Connecting ...
//   Open --socket lost, table empty--> Disconnected (no reconnect storm)
//   Reconnecting{n > max} --> Disconnected + disconnect handler (gives up
//   until the next subscribe command restarts it)
//
// On every open the heartbeat channel is subscribed and the whole table is
// replayed, because the server forgets subscriptions with the socket. While
// open, subscribe / unsubscribe commands put only the delta against the table
// on the wire.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::coinbase::TokenSigner;
use crate::stream::message::{
    decode_frame, encode_control, heartbeat_subscription, ControlAction, StreamMessage,
};
use crate::stream::transport::{FrameSink, FrameStream, StreamTransport};

/// Receives every decoded ticker / candle frame, in wire order.
pub type MessageHandler = Arc<dyn Fn(StreamMessage) + Send + Sync>;

/// Invoked once with a reason when reconnection is abandoned.
pub type DisconnectHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Tunables for one streaming connection.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

/// Explicit connection state, observable through [`StreamConnection::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe {
        channel: String,
        product_ids: Vec<String>,
    },
    Unsubscribe {
        channel: String,
        product_ids: Option<Vec<String>>,
    },
    Close,
}

// ---------------------------------------------------------------------------
// Subscription table
// ---------------------------------------------------------------------------

/// Channel -> wanted products. A channel with an empty set is a channel-level
/// subscription (no `product_ids` on the wire).
#[derive(Debug, Default)]
struct SubscriptionTable {
    channels: BTreeMap<String, BTreeSet<String>>,
}

impl SubscriptionTable {
    /// Record a subscribe intent; returns the products that are new on the
    /// wire, or `None` when nothing needs sending.
    fn add(&mut self, channel: &str, product_ids: &[String]) -> Option<Vec<String>> {
        let is_new_channel = !self.channels.contains_key(channel);
        let set = self.channels.entry(channel.to_string()).or_default();
        let added: Vec<String> = product_ids
            .iter()
            .filter(|id| set.insert((*id).clone()))
            .cloned()
            .collect();

        if !added.is_empty() || (is_new_channel && product_ids.is_empty()) {
            Some(added)
        } else {
            None
        }
    }

    /// Record an unsubscribe intent; returns the products that must be
    /// removed on the wire. `None` products drops the whole channel.
    fn remove(&mut self, channel: &str, product_ids: Option<&[String]>) -> Option<Vec<String>> {
        let set = self.channels.get_mut(channel)?;
        let removed: Vec<String> = match product_ids {
            None => {
                let all = std::mem::take(set).into_iter().collect();
                self.channels.remove(channel);
                return Some(all);
            }
            Some(ids) => ids.iter().filter(|id| set.remove(*id)).cloned().collect(),
        };
        if set.is_empty() {
            self.channels.remove(channel);
        }
        if removed.is_empty() {
            None
        } else {
            Some(removed)
        }
    }

    fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.channels
            .iter()
            .map(|(channel, ids)| (channel.clone(), ids.iter().cloned().collect()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a streaming connection actor. Cloning shares the same socket.
#[derive(Clone)]
pub struct StreamConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamConnection {
    /// Spawn the actor. Nothing is dialled until the first subscribe.
    pub fn spawn(
        settings: StreamSettings,
        transport: Arc<dyn StreamTransport>,
        signer: Arc<dyn TokenSigner>,
        on_message: MessageHandler,
        on_disconnect: DisconnectHandler,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ConnectionActor {
            settings,
            transport,
            signer,
            on_message,
            on_disconnect,
            commands: commands_rx,
            table: SubscriptionTable::default(),
            state: state_tx,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Want `product_ids` on `channel` (or the channel itself when `None`).
    pub fn subscribe(&self, channel: &str, product_ids: Option<&[String]>) {
        self.send(Command::Subscribe {
            channel: channel.to_string(),
            product_ids: product_ids.map(<[String]>::to_vec).unwrap_or_default(),
        });
    }

    /// Stop wanting `product_ids` on `channel` (the whole channel when `None`).
    pub fn unsubscribe(&self, channel: &str, product_ids: Option<&[String]>) {
        self.send(Command::Unsubscribe {
            channel: channel.to_string(),
            product_ids: product_ids.map(<[String]>::to_vec),
        });
    }

    /// Close the socket and stop the actor.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("stream connection actor has stopped; command dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Why the actor left the connected part of its lifecycle.
enum Lifecycle {
    /// Back to `Disconnected`; wait for the next subscribe.
    Idle,
    /// `close()` was called or every handle was dropped.
    Closed,
}

enum ServeOutcome {
    Closed,
    Dropped(String),
}

struct ConnectionActor {
    settings: StreamSettings,
    transport: Arc<dyn StreamTransport>,
    signer: Arc<dyn TokenSigner>,
    on_message: MessageHandler,
    on_disconnect: DisconnectHandler,
    commands: mpsc::UnboundedReceiver<Command>,
    table: SubscriptionTable,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Disconnected);

            let Some(command) = self.commands.recv().await else {
                break;
            };
            match command {
                Command::Close => break,
                Command::Subscribe {
                    channel,
                    product_ids,
                } => {
                    self.table.add(&channel, &product_ids);
                }
                Command::Unsubscribe {
                    channel,
                    product_ids,
                } => {
                    self.table.remove(&channel, product_ids.as_deref());
                    continue;
                }
            }

            if self.table.is_empty() {
                continue;
            }
            if let Lifecycle::Closed = self.connect_and_serve().await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(url = %self.settings.url, "stream connection actor stopped");
    }

    /// Dial, serve, and reconnect with exponential backoff until the socket
    /// is closed on purpose, the table empties, or attempts run out.
    async fn connect_and_serve(&mut self) -> Lifecycle {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            match self.open().await {
                Ok(Some((sink, stream))) => {
                    attempt = 0;
                    match self.serve(sink, stream).await {
                        ServeOutcome::Closed => return Lifecycle::Closed,
                        ServeOutcome::Dropped(reason) => {
                            if self.table.is_empty() {
                                info!(reason = %reason, "idle stream connection dropped; not reconnecting");
                                return Lifecycle::Idle;
                            }
                            warn!(reason = %reason, "stream connection lost");
                        }
                    }
                }
                Ok(None) => return Lifecycle::Closed,
                Err(e) => {
                    warn!(attempt, error = %e, "stream connect failed");
                }
            }

            attempt += 1;
            if attempt > self.settings.max_reconnect_attempts {
                let reason = format!(
                    "stream connection to {} lost: gave up after {} reconnect attempts",
                    self.settings.url, self.settings.max_reconnect_attempts
                );
                error!(reason = %reason, "stream reconnection abandoned");
                (self.on_disconnect)(&reason);
                return Lifecycle::Idle;
            }

            let delay = backoff_delay(self.settings.reconnect_base_delay, attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            warn!(
                attempt,
                max_attempts = self.settings.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting stream"
            );

            if !self.wait_backoff(delay).await {
                return Lifecycle::Closed;
            }
            if self.table.is_empty() {
                info!("nothing left to stream; abandoning reconnect");
                return Lifecycle::Idle;
            }
        }
    }

    /// Dial the transport while still accepting commands. `Ok(None)` means
    /// the caller closed the connection mid-dial.
    async fn open(&mut self) -> Result<Option<(FrameSink, FrameStream)>> {
        let transport = Arc::clone(&self.transport);
        let url = self.settings.url.clone();
        let connect = transport.connect(&url);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return result.map(Some),
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return Ok(None),
                    Some(command) => self.track_only(command),
                },
            }
        }
    }

    async fn serve(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> ServeOutcome {
        self.set_state(ConnectionState::Open);
        info!(url = %self.settings.url, "stream connection open");

        if let Err(e) = self.replay_subscriptions(&mut sink).await {
            return ServeOutcome::Dropped(format!("failed to resubscribe: {e:#}"));
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => {
                        self.set_state(ConnectionState::Closing);
                        if let Err(e) = sink.close().await {
                            debug!(error = %e, "error while closing stream socket");
                        }
                        return ServeOutcome::Closed;
                    }
                    Some(Command::Subscribe { channel, product_ids }) => {
                        if let Some(delta) = self.table.add(&channel, &product_ids) {
                            debug!(channel = %channel, products = ?delta, "subscribe delta");
                            if let Err(e) = self.send_control(&mut sink, ControlAction::Subscribe, &channel, &delta).await {
                                return ServeOutcome::Dropped(format!("{e:#}"));
                            }
                        }
                    }
                    Some(Command::Unsubscribe { channel, product_ids }) => {
                        if let Some(delta) = self.table.remove(&channel, product_ids.as_deref()) {
                            debug!(channel = %channel, products = ?delta, "unsubscribe delta");
                            if let Err(e) = self.send_control(&mut sink, ControlAction::Unsubscribe, &channel, &delta).await {
                                return ServeOutcome::Dropped(format!("{e:#}"));
                            }
                        }
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => return ServeOutcome::Dropped(format!("{e:#}")),
                    None => return ServeOutcome::Dropped("socket closed by peer".into()),
                },
            }
        }
    }

    /// Heartbeats first, then every tracked channel as a fresh subscribe.
    async fn replay_subscriptions(&mut self, sink: &mut FrameSink) -> Result<()> {
        sink.send(heartbeat_subscription()?).await?;
        for (channel, products) in self.table.snapshot() {
            self.send_control(sink, ControlAction::Subscribe, &channel, &products)
                .await?;
        }
        Ok(())
    }

    /// Send one control frame with a freshly minted token. Signing and socket
    /// failures are both returned: the table already holds the intent, so
    /// the caller drops the socket and the reconnect replays it.
    async fn send_control(
        &self,
        sink: &mut FrameSink,
        action: ControlAction,
        channel: &str,
        product_ids: &[String],
    ) -> Result<()> {
        let token = self
            .signer
            .stream_token()
            .with_context(|| format!("failed to sign {action} frame for {channel}"))?;
        let ids = (!product_ids.is_empty()).then_some(product_ids);
        let frame = encode_control(action, channel, ids, token.as_deref())?;
        sink.send(frame).await
    }

    fn dispatch(&self, text: &str) {
        match decode_frame(text) {
            Ok(message @ (StreamMessage::Tickers(_) | StreamMessage::Candles(_))) => {
                (self.on_message)(message);
            }
            Ok(StreamMessage::Heartbeat { counter }) => {
                debug!(counter, "heartbeat");
            }
            Ok(StreamMessage::Subscriptions(active)) => {
                debug!(subscriptions = ?active, "server acknowledged subscriptions");
            }
            Ok(StreamMessage::Error(message)) => {
                warn!(message = %message, "stream reported an error");
            }
            Ok(StreamMessage::Ignored(channel)) => {
                debug!(channel = %channel, "ignoring frame from unused channel");
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed stream frame");
            }
        }
    }

    /// Sleep out a backoff delay while still tracking commands. Returns
    /// `false` when the connection was closed meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return false,
                    Some(command) => self.track_only(command),
                },
            }
        }
    }

    /// Apply a command to the table without touching the wire; the table is
    /// replayed in full on the next open.
    fn track_only(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                channel,
                product_ids,
            } => {
                self.table.add(&channel, &product_ids);
            }
            Command::Unsubscribe {
                channel,
                product_ids,
            } => {
                self.table.remove(&channel, product_ids.as_deref());
            }
            Command::Close => {}
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// `base * 2^(attempt-1)`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
