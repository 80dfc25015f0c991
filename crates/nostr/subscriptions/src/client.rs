//! Client handle and the coordinator task behind it.
//!
//! [`Client`] is a cheap, cloneable handle. Every subscription operation is
//! sent as a command to a single coordinator task that owns the
//! [`SubscriptionManager`]; the same task consumes the pool's events and
//! fires subscription timeouts. REQ fan-outs run as detached futures polled by
//! the coordinator, so relay frames keep flowing while a send backs off.

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::listener::{ChannelListener, ListenerId, SubscriptionListener, SubscriptionNotification};
use crate::manager::{
    ActivationReport, ActivationStep, ManagerConfig, SubscriptionManager, parse_filters,
};
use crate::message::{Filter, RelayMessage};
use crate::pool::{ConnectReport, PoolEvent, RelayPool};
use crate::subscription::{
    SubscriptionInfo, SubscriptionOptions, SubscriptionResult, SubscriptionStats,
};
use crate::transport::{Connector, WebSocketConnector};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

enum Command {
    Subscribe {
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        listeners: Vec<Box<dyn SubscriptionListener>>,
        reply: oneshot::Sender<SubscriptionResult>,
    },
    Activate {
        id: String,
        reply: oneshot::Sender<SubscriptionResult>,
    },
    Close {
        id: String,
        reason: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    CloseAll {
        reason: Option<String>,
        reply: oneshot::Sender<usize>,
    },
    AddListener {
        id: String,
        listener: Box<dyn SubscriptionListener>,
        reply: oneshot::Sender<Option<ListenerId>>,
    },
    RemoveListener {
        id: String,
        listener: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    ActiveSubscriptions {
        reply: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    Stats {
        id: String,
        reply: oneshot::Sender<Option<SubscriptionStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running subscription coordinator.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    pool: RelayPool,
    default_options: SubscriptionOptions,
}

impl Client {
    /// WebSocket client for `config`. Must be called inside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Client using `connector` to reach relays.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = RelayPool::new(config.relays, config.pool, connector);
        Self::from_parts(pool, Arc::new(SystemClock), config.manager)
    }

    /// Start a coordinator over an existing pool.
    pub fn from_parts(pool: RelayPool, clock: Arc<dyn Clock>, config: ManagerConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            chunk_size: config.ingest_chunk_size.max(1),
            pool_events: pool.register_observer(),
            default_options: config.default_options.clone(),
            manager: SubscriptionManager::new(pool.clone(), clock.clone(), config),
            clock,
            commands: commands_rx,
            activations: FuturesUnordered::new(),
        };
        let default_options = coordinator.default_options.clone();
        tokio::spawn(coordinator.run());

        Self {
            commands,
            pool,
            default_options,
        }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Options configured as the default for this client.
    pub fn default_options(&self) -> SubscriptionOptions {
        self.default_options.clone()
    }

    /// Connect the configured relays.
    pub async fn connect(&self) -> Result<ConnectReport> {
        self.pool.connect().await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ClientError::Disposed)?;
        rx.await.map_err(|_| ClientError::Disposed)
    }

    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionResult> {
        self.subscribe_with(filters, options, Vec::new()).await
    }

    /// Subscribe with `listener` attached from the first frame on.
    pub async fn subscribe_with_listener(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        listener: impl SubscriptionListener + 'static,
    ) -> Result<SubscriptionResult> {
        self.subscribe_with(filters, options, vec![Box::new(listener)])
            .await
    }

    /// Subscribe and receive notifications through a channel.
    pub async fn subscribe_channel(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Result<(
        SubscriptionResult,
        mpsc::UnboundedReceiver<SubscriptionNotification>,
    )> {
        let (listener, rx) = ChannelListener::new();
        let result = self.subscribe_with_listener(filters, options, listener).await?;
        Ok((result, rx))
    }

    /// Subscribe with filters given as raw JSON values.
    pub async fn subscribe_json(
        &self,
        filters: Vec<Value>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionResult> {
        match parse_filters(filters) {
            Ok(filters) => self.subscribe(filters, options).await,
            Err(error) => Ok(SubscriptionResult::failed(error)),
        }
    }

    async fn subscribe_with(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        listeners: Vec<Box<dyn SubscriptionListener>>,
    ) -> Result<SubscriptionResult> {
        self.request(|reply| Command::Subscribe {
            filters,
            options,
            listeners,
            reply,
        })
        .await
    }

    pub async fn activate(&self, id: &str) -> Result<SubscriptionResult> {
        let id = id.to_string();
        self.request(|reply| Command::Activate { id, reply }).await
    }

    /// Close a subscription. `Ok(false)` if it was not active.
    pub async fn close(&self, id: &str, reason: Option<&str>) -> Result<bool> {
        let id = id.to_string();
        let reason = reason.map(str::to_string);
        self.request(|reply| Command::Close { id, reason, reply })
            .await
    }

    pub async fn close_all(&self) -> Result<usize> {
        self.request(|reply| Command::CloseAll {
            reason: None,
            reply,
        })
        .await
    }

    pub async fn add_listener(
        &self,
        id: &str,
        listener: impl SubscriptionListener + 'static,
    ) -> Result<Option<ListenerId>> {
        let id = id.to_string();
        let listener: Box<dyn SubscriptionListener> = Box::new(listener);
        self.request(|reply| Command::AddListener {
            id,
            listener,
            reply,
        })
        .await
    }

    pub async fn remove_listener(&self, id: &str, listener: ListenerId) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| Command::RemoveListener {
            id,
            listener,
            reply,
        })
        .await
    }

    pub async fn active_subscriptions(&self) -> Result<Vec<SubscriptionInfo>> {
        self.request(|reply| Command::ActiveSubscriptions { reply })
            .await
    }

    pub async fn subscription(&self, id: &str) -> Result<Option<SubscriptionInfo>> {
        Ok(self.subscription_stats(id).await?.map(|stats| stats.info))
    }

    pub async fn subscription_stats(&self, id: &str) -> Result<Option<SubscriptionStats>> {
        let id = id.to_string();
        self.request(|reply| Command::Stats { id, reply }).await
    }

    /// Close every subscription, stop the coordinator and disconnect.
    /// Every later call returns [`ClientError::Disposed`].
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        self.pool.disconnect_all().await;
        Ok(())
    }
}

type PendingActivation =
    BoxFuture<'static, (ActivationReport, Option<oneshot::Sender<SubscriptionResult>>)>;

struct Coordinator {
    manager: SubscriptionManager,
    clock: Arc<dyn Clock>,
    commands: mpsc::UnboundedReceiver<Command>,
    pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    activations: FuturesUnordered<PendingActivation>,
    default_options: SubscriptionOptions,
    chunk_size: usize,
}

impl Coordinator {
    async fn run(mut self) {
        debug!("Subscription coordinator started");
        loop {
            let timer = self.timer();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let closed = self.manager.close_all(Some("client shutdown")).await;
                        info!("Coordinator shutting down, closed {} subscriptions", closed);
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.pool_events.recv() => self.ingest(event).await,
                Some((report, reply)) = self.activations.next(), if !self.activations.is_empty() => {
                    let result = self.manager.finish_activation(report).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                _ = timer => {
                    self.manager.check_timeouts().await;
                }
            }
        }
        debug!("Subscription coordinator stopped");
    }

    /// Fires at the nearest subscription deadline.
    fn timer(&self) -> BoxFuture<'static, ()> {
        match self.manager.next_deadline() {
            Some(deadline) => self
                .clock
                .sleep(deadline.saturating_duration_since(self.clock.now())),
            None => Box::pin(futures::future::pending()),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                filters,
                options,
                listeners,
                reply,
            } => {
                let step = self.manager.prepare_subscribe(filters, options, listeners).await;
                self.dispatch(step, reply);
            }
            Command::Activate { id, reply } => {
                let step = self.manager.prepare_activation(&id);
                self.dispatch(step, reply);
            }
            Command::Close { id, reason, reply } => {
                let closed = self.manager.close(&id, reason.as_deref()).await;
                let _ = reply.send(closed);
            }
            Command::CloseAll { reason, reply } => {
                let closed = self.manager.close_all(reason.as_deref()).await;
                let _ = reply.send(closed);
            }
            Command::AddListener {
                id,
                listener,
                reply,
            } => {
                let _ = reply.send(self.manager.add_listener(&id, listener));
            }
            Command::RemoveListener {
                id,
                listener,
                reply,
            } => {
                let _ = reply.send(self.manager.remove_listener(&id, listener));
            }
            Command::ActiveSubscriptions { reply } => {
                let _ = reply.send(self.manager.active_subscriptions());
            }
            Command::Stats { id, reply } => {
                let _ = reply.send(self.manager.subscription_stats(&id));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn dispatch(&mut self, step: ActivationStep, reply: oneshot::Sender<SubscriptionResult>) {
        match step {
            ActivationStep::Done(result) => {
                let _ = reply.send(result);
            }
            ActivationStep::Send(job) => {
                self.activations
                    .push(Box::pin(async move { (job.run().await, Some(reply)) }));
            }
        }
    }

    /// Route `first` plus whatever else is already queued, up to one chunk,
    /// then yield.
    async fn ingest(&mut self, first: PoolEvent) {
        let mut chunk = Vec::with_capacity(self.chunk_size.min(64));
        chunk.push(first);
        while chunk.len() < self.chunk_size {
            match self.pool_events.try_recv() {
                Ok(event) => chunk.push(event),
                Err(_) => break,
            }
        }

        let mut pending: Option<(String, String, Vec<Event>)> = None;
        for event in chunk {
            match event {
                PoolEvent::Message {
                    relay_url,
                    message:
                        RelayMessage::Event {
                            subscription_id,
                            event,
                        },
                } => {
                    if let Some((relay, sub, events)) = pending.as_mut()
                        && *relay == relay_url
                        && *sub == subscription_id
                    {
                        events.push(event);
                        continue;
                    }
                    self.flush(pending.take());
                    pending = Some((relay_url, subscription_id, vec![event]));
                }
                other => {
                    self.flush(pending.take());
                    self.handle_pool_event(other).await;
                }
            }
        }
        self.flush(pending);
        tokio::task::yield_now().await;
    }

    fn flush(&mut self, batch: Option<(String, String, Vec<Event>)>) {
        if let Some((relay_url, subscription_id, events)) = batch {
            self.manager
                .handle_relay_events(&relay_url, &subscription_id, &events);
        }
    }

    async fn handle_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Connected { relay_url } => {
                self.manager.handle_relay_reconnection(&relay_url).await;
            }
            PoolEvent::Disconnected { relay_url, .. } => {
                self.manager.handle_relay_disconnection(&relay_url);
            }
            PoolEvent::Message { relay_url, message } => {
                self.manager.handle_relay_message(&relay_url, message);
            }
        }
    }
}
