// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the single live broker connection of a bridge and the two channels opened on it: the
//! publisher channel, handed to the [`PublisherConfirmTracker`], and the consumer channel,
//! handed to the [`ConsumerPool`].
//!
//! Every established connection is a *session*. Failure callbacks, channel events and
//! recovery attempts carry the session they belong to and are ignored once that session has
//! been torn down, so a late signal from a dead connection can never disturb its successor.

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector, ChannelEvent},
    config::{ConfiguredTarget, ConnectionDescription},
    consumer::{ConsumerMetrics, InboundHandler},
    dispatcher::{self, ConsumerPool},
    envelope::OutboundMessage,
    errors::{AmqpError, ConfigError},
    factory::{BrokerConnectionFactory, ConnectionTuning, FailureHandler},
    publisher::{PublishHandle, PublisherConfirmTracker},
    status::{StatusReporter, StatusSink, CONNECTION_RESOURCE},
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Share of the remaining connect budget a channel creation may use.
const CHANNEL_TIMEOUT_RATIO: f64 = 0.8;

/// Time budget of one connect attempt. Every step is bounded by what is left of it.
#[derive(Debug, Clone, Copy)]
struct Budget {
    total: Duration,
    deadline: Instant,
}

impl Budget {
    fn new(total: Duration) -> Budget {
        Budget {
            total,
            deadline: Instant::now() + total,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn for_channel(&self) -> Duration {
        self.remaining().mul_f64(CHANNEL_TIMEOUT_RATIO)
    }

    /// Caps a broker rpc timeout so the call cannot outlive the budget.
    fn cap(&self, rpc_timeout: Duration) -> Duration {
        rpc_timeout.min(self.remaining())
    }

    fn exceeded(&self, step: &str) -> AmqpError {
        AmqpError::Timeout(step.to_owned(), self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    TestingOnly,
}

/// Resources of one established session.
struct Live {
    session: u64,
    connection: Arc<dyn BrokerConnection>,
    publisher: Option<Arc<dyn BrokerChannel>>,
    consumer: Option<Arc<dyn BrokerChannel>>,
    publisher_events: Option<JoinHandle<()>>,
    consumer_events: Option<JoinHandle<()>>,
}

struct Inner {
    state: ConnectionState,
    live: Option<Live>,
    recovery: Option<JoinHandle<()>>,
    connect_timeout: Duration,
}

struct Shared {
    description: ConnectionDescription,
    factory: BrokerConnectionFactory,
    connector: Arc<dyn BrokerConnector>,
    tuning: ConnectionTuning,
    targets: Vec<ConfiguredTarget>,
    reporter: StatusReporter,
    tracker: PublisherConfirmTracker,
    pool: ConsumerPool,
    sessions: AtomicU64,
    inner: Mutex<Inner>,
}

/// Handle to the supervisor of one bridge. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    /// Creates the supervisor of the bridge described by `description`. Nothing is opened
    /// until [`Self::connect`].
    ///
    /// # Errors
    /// `ConfigError` when a target address or a tuning value is malformed.
    pub fn new(
        description: ConnectionDescription,
        factory: BrokerConnectionFactory,
        connector: Arc<dyn BrokerConnector>,
        handler: Arc<dyn InboundHandler>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<ConnectionSupervisor, ConfigError> {
        let targets = description.configured_targets()?;
        let tuning = ConnectionTuning::from_params(&description.specific_config)?;
        let reporter = StatusReporter::new(sink);

        let tracker = PublisherConfirmTracker::new(description.pending_ack_ttl(), reporter.clone());
        let pool = ConsumerPool::new(
            description.sources.clone(),
            handler,
            reporter.clone(),
            tuning.channel_rpc_timeout,
            description.consumer_stop_timeout(),
        );

        Ok(ConnectionSupervisor {
            shared: Arc::new(Shared {
                description,
                factory,
                connector,
                tuning,
                targets,
                reporter,
                tracker,
                pool,
                sessions: AtomicU64::new(0),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    live: None,
                    recovery: None,
                    connect_timeout: Duration::ZERO,
                }),
            }),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.state
    }

    pub fn targets(&self) -> &[ConfiguredTarget] {
        &self.shared.targets
    }

    pub fn tracker(&self) -> &PublisherConfirmTracker {
        &self.shared.tracker
    }

    pub fn consumer_metrics(&self) -> Arc<ConsumerMetrics> {
        self.shared.pool.metrics()
    }

    /// Number of consumer tasks currently running.
    pub async fn consumers(&self) -> usize {
        self.shared.pool.running().await
    }

    /// Opens the live connection with its channels and, when configured to consume, starts
    /// every consumer. Returns at once when already connected.
    ///
    /// # Errors
    /// The first failure observed: a configuration error, a failure reported by the broker
    /// client, a channel creation timeout or missing queues. Nothing is left open on error.
    pub async fn connect(&self, timeout: Duration) -> Result<(), AmqpError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            return Ok(());
        }

        if let Some(recovery) = inner.recovery.take() {
            recovery.abort();
        }
        inner.state = ConnectionState::Connecting;
        inner.connect_timeout = timeout;

        let session = self.shared.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        match self.shared.establish(session, timeout).await {
            Ok(live) => {
                inner.live = Some(live);
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                inner.state = ConnectionState::Idle;
                self.shared.reporter.failure(CONNECTION_RESOURCE, &err);
                Err(err)
            }
        }
    }

    /// Checks that the broker described by `description` is reachable with its credentials
    /// and that every source queue exists. The test connection is independent of the live one
    /// and is always closed afterwards; no consumer is ever started.
    pub async fn connect_for_test(
        &self,
        description: &ConnectionDescription,
        timeout: Duration,
    ) -> Result<(), AmqpError> {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == ConnectionState::Idle {
                inner.state = ConnectionState::TestingOnly;
            }
        }

        let tested = self.shared.test_connection(description, timeout).await;

        let mut inner = self.shared.inner.lock().await;
        if inner.state == ConnectionState::TestingOnly {
            inner.state = ConnectionState::Idle;
        }

        tested
    }

    /// Stops consumers, closes both channels and the connection. Safe to call at any time.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;

        if let Some(recovery) = inner.recovery.take() {
            recovery.abort();
        }
        self.shared.sessions.fetch_add(1, Ordering::SeqCst);

        if let Some(live) = inner.live.take() {
            self.shared.teardown(live).await;
            info!(id = self.shared.description.id, "disconnected");
        }
        inner.state = ConnectionState::Idle;
    }

    /// Publishes on the publisher channel. See [`PublisherConfirmTracker::publish`].
    pub async fn publish(&self, message: OutboundMessage) -> PublishHandle {
        self.shared.tracker.publish(message).await
    }
}

impl Shared {
    /// Opens a connection, its publisher channel and, when consuming, its consumer channel.
    async fn establish(self: &Arc<Self>, session: u64, timeout: Duration) -> Result<Live, AmqpError> {
        let (failures_tx, mut failures) = mpsc::unbounded_channel::<AmqpError>();
        let failure_handler: FailureHandler = Arc::new(move |err: AmqpError| {
            let _ = failures_tx.send(err);
        });
        let budget = Budget::new(timeout);
        let params = self.factory.build(&self.description, failure_handler)?;

        debug!(endpoint = params.endpoint(), session, "connecting...");

        let connection = tokio::select! {
            biased;

            Some(err) = failures.recv() => return Err(err),
            connected = tokio::time::timeout_at(budget.deadline, self.connector.connect(&params)) => match connected {
                Ok(connected) => connected?,
                Err(_) => return Err(budget.exceeded("connect")),
            },
        };

        let mut live = Live {
            session,
            connection,
            publisher: None,
            consumer: None,
            publisher_events: None,
            consumer_events: None,
        };

        let opened = tokio::select! {
            biased;

            Some(err) = failures.recv() => Err(err),
            opened = self.open_channels(&mut live, budget) => opened,
        };

        if let Err(err) = opened {
            error!(error = err.to_string(), session, "failure to set up channels");
            self.teardown(live).await;
            return Err(err);
        }

        spawn_failure_watch(self, session, failures);

        info!(endpoint = params.endpoint(), session, "connected");
        self.reporter.open(CONNECTION_RESOURCE, "connected");
        for target in &self.targets {
            self.reporter.open(&target.address, "publisher channel ready");
        }

        Ok(live)
    }

    async fn open_channels(
        self: &Arc<Self>,
        live: &mut Live,
        budget: Budget,
    ) -> Result<(), AmqpError> {
        let (publisher, events) = self
            .open_publisher(live.connection.as_ref(), live.session, budget)
            .await?;
        live.publisher = Some(publisher);
        live.publisher_events = Some(events);

        if self.description.is_consuming() {
            let (consumer, events) = self
                .open_consumer(live.connection.as_ref(), live.session, budget)
                .await?;
            live.consumer = Some(consumer);
            live.consumer_events = Some(events);
        }

        Ok(())
    }

    /// Creates a publisher channel and hands it to the tracker.
    async fn open_publisher(
        self: &Arc<Self>,
        connection: &dyn BrokerConnection,
        session: u64,
        budget: Budget,
    ) -> Result<(Arc<dyn BrokerChannel>, JoinHandle<()>), AmqpError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let channel =
            create_channel(connection, events_tx, budget.for_channel(), "publisher channel").await?;

        let epoch = self
            .tracker
            .attach(channel.clone(), budget.cap(self.tuning.channel_rpc_timeout))
            .await;
        let dispatch = spawn_publisher_events(self, session, channel.clone(), epoch, events);

        Ok((channel, dispatch))
    }

    /// Creates a consumer channel and starts every consumer on it.
    async fn open_consumer(
        self: &Arc<Self>,
        connection: &dyn BrokerConnection,
        session: u64,
        budget: Budget,
    ) -> Result<(Arc<dyn BrokerChannel>, JoinHandle<()>), AmqpError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let channel =
            create_channel(connection, events_tx, budget.for_channel(), "consumer channel").await?;

        let started = tokio::time::timeout_at(budget.deadline, self.pool.start(channel.clone()))
            .await
            .unwrap_or_else(|_| Err(budget.exceeded("consumer start")));
        if let Err(err) = started {
            close_channel(channel.as_ref()).await;
            return Err(err);
        }
        let dispatch = spawn_consumer_events(self, session, channel.clone(), events);

        Ok((channel, dispatch))
    }

    async fn teardown(&self, live: Live) {
        for dispatch in [live.publisher_events, live.consumer_events].into_iter().flatten() {
            dispatch.abort();
        }

        self.pool.stop().await;
        self.tracker.detach(None).await;

        for channel in [live.consumer, live.publisher].into_iter().flatten() {
            close_channel(channel.as_ref()).await;
        }
        if let Err(err) = live.connection.close().await {
            debug!(error = err.to_string(), session = live.session, "failure to close connection");
        }
    }

    async fn test_connection(
        &self,
        description: &ConnectionDescription,
        timeout: Duration,
    ) -> Result<(), AmqpError> {
        let (failures_tx, mut failures) = mpsc::unbounded_channel::<AmqpError>();
        let failure_handler: FailureHandler = Arc::new(move |err: AmqpError| {
            let _ = failures_tx.send(err);
        });
        let budget = Budget::new(timeout);
        let params = self.factory.build(description, failure_handler)?;
        let tuning = params.tuning.clone();

        let connection = tokio::select! {
            biased;

            Some(err) = failures.recv() => return Err(err),
            connected = tokio::time::timeout_at(budget.deadline, self.connector.connect(&params)) => match connected {
                Ok(connected) => connected?,
                Err(_) => return Err(budget.exceeded("connect")),
            },
        };

        let checked = tokio::select! {
            biased;

            Some(err) = failures.recv() => Err(err),
            checked = async {
                let (events_tx, _events) = mpsc::unbounded_channel();
                let channel = create_channel(
                    connection.as_ref(),
                    events_tx,
                    budget.for_channel(),
                    "test channel",
                )
                .await?;

                let addresses = description.source_addresses();
                let checked = tokio::time::timeout_at(
                    budget.deadline,
                    dispatcher::check_queues(
                        channel.as_ref(),
                        &addresses,
                        budget.cap(tuning.channel_rpc_timeout),
                    ),
                )
                .await
                .unwrap_or_else(|_| Err(budget.exceeded("queue check")));
                close_channel(channel.as_ref()).await;
                checked
            } => checked,
        };

        if let Err(err) = connection.close().await {
            debug!(error = err.to_string(), "failure to close test connection");
        }

        match &checked {
            Ok(()) => debug!(endpoint = params.endpoint(), "test connection succeeded"),
            Err(err) => warn!(error = err.to_string(), endpoint = params.endpoint(), "test connection failed"),
        }
        checked
    }

    fn is_current(&self, inner: &Inner, session: u64) -> bool {
        inner.live.as_ref().is_some_and(|live| live.session == session)
    }

    /// The connection of `session` failed: drop it and, if enabled, start recovering.
    async fn connection_lost(self: &Arc<Self>, session: u64, err: AmqpError) {
        let mut inner = self.inner.lock().await;
        if !self.is_current(&inner, session) {
            return;
        }

        error!(error = err.to_string(), session, "connection lost");
        if let Some(live) = inner.live.take() {
            self.teardown(live).await;
        }

        self.reporter.failure(CONNECTION_RESOURCE, &err);
        for target in &self.targets {
            self.reporter.failure(&target.address, &err);
        }

        if self.tuning.topology_recovery_enabled {
            inner.state = ConnectionState::Connecting;
            inner.recovery = Some(spawn_recovery(self));
        } else {
            inner.state = ConnectionState::Idle;
        }
    }

    /// One recovery attempt. Returns true once no further attempt is needed.
    async fn try_recover(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connecting || inner.live.is_some() {
            return true;
        }

        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        match self.establish(session, inner.connect_timeout).await {
            Ok(live) => {
                info!(session, "connection recovered");
                inner.live = Some(live);
                inner.state = ConnectionState::Connected;
                inner.recovery = None;
                true
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    retry_in = ?self.tuning.network_recovery_interval,
                    "failure to recover connection"
                );
                self.reporter.failure(CONNECTION_RESOURCE, &err);
                false
            }
        }
    }

    /// The publisher channel of `session` shut down: replace it with a fresh one.
    async fn publisher_lost(self: &Arc<Self>, session: u64, epoch: u64, err: AmqpError) {
        let mut inner = self.inner.lock().await;
        if !self.is_current(&inner, session) {
            return;
        }

        warn!(error = err.to_string(), session, "publisher channel shut down");
        self.tracker.detach(Some(epoch)).await;
        for target in &self.targets {
            self.reporter.failure(&target.address, &err);
        }

        let budget = Budget::new(inner.connect_timeout);
        let Some(live) = inner.live.as_mut() else {
            return;
        };
        live.publisher = None;

        match self
            .open_publisher(live.connection.as_ref(), session, budget)
            .await
        {
            Ok((channel, events)) => {
                live.publisher = Some(channel);
                live.publisher_events = Some(events);
                for target in &self.targets {
                    self.reporter.open(&target.address, "publisher channel recreated");
                }
            }
            Err(err) => error!(error = err.to_string(), session, "failure to recreate publisher channel"),
        }
    }

    /// The consumer channel of `session` shut down: stop its consumers and start over on a
    /// fresh channel.
    async fn consumer_lost(self: &Arc<Self>, session: u64, err: AmqpError) {
        let mut inner = self.inner.lock().await;
        if !self.is_current(&inner, session) {
            return;
        }

        warn!(error = err.to_string(), session, "consumer channel shut down");
        self.pool.stop().await;
        for address in self.description.source_addresses() {
            self.reporter.failure(&address, &err);
        }

        let budget = Budget::new(inner.connect_timeout);
        let Some(live) = inner.live.as_mut() else {
            return;
        };
        live.consumer = None;

        match self
            .open_consumer(live.connection.as_ref(), session, budget)
            .await
        {
            Ok((channel, events)) => {
                live.consumer = Some(channel);
                live.consumer_events = Some(events);
            }
            Err(err) => error!(error = err.to_string(), session, "failure to restart consumers"),
        }
    }
}

async fn create_channel(
    connection: &dyn BrokerConnection,
    events: crate::broker::ChannelEventSender,
    timeout: Duration,
    purpose: &str,
) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
    tokio::time::timeout(timeout, connection.create_channel(events))
        .await
        .map_err(|_| AmqpError::Timeout(purpose.to_owned(), timeout))?
}

async fn close_channel(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), channel = channel.id(), "failure to close channel");
    }
}

fn spawn_failure_watch(
    shared: &Arc<Shared>,
    session: u64,
    mut failures: mpsc::UnboundedReceiver<AmqpError>,
) {
    let shared = Arc::downgrade(shared);
    tokio::spawn(async move {
        if let Some(err) = failures.recv().await {
            if let Some(shared) = shared.upgrade() {
                shared.connection_lost(session, err).await;
            }
        }
    });
}

fn spawn_recovery(shared: &Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(recover(Arc::downgrade(shared)))
}

/// Retries the full establish sequence until it succeeds, the bridge disconnects
/// or the supervisor is dropped.
async fn recover(shared: Weak<Shared>) {
    loop {
        let Some(interval) = shared
            .upgrade()
            .map(|shared| shared.tuning.network_recovery_interval)
        else {
            return;
        };
        tokio::time::sleep(interval).await;

        let Some(shared) = shared.upgrade() else {
            debug!("supervisor dropped, recovery stopped");
            return;
        };
        if shared.try_recover().await {
            return;
        }
    }
}

fn spawn_publisher_events(
    shared: &Arc<Shared>,
    session: u64,
    channel: Arc<dyn BrokerChannel>,
    epoch: u64,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(publisher_events(
        Arc::downgrade(shared),
        session,
        channel,
        epoch,
        events,
    ))
}

fn spawn_consumer_events(
    shared: &Arc<Shared>,
    session: u64,
    channel: Arc<dyn BrokerChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(consumer_events(
        Arc::downgrade(shared),
        session,
        channel,
        events,
    ))
}

/// Dispatch loop of a publisher channel.
async fn publisher_events(
    shared: Weak<Shared>,
    session: u64,
    channel: Arc<dyn BrokerChannel>,
    mut epoch: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        match event {
            ChannelEvent::Shutdown(err) => {
                tokio::spawn(async move { shared.publisher_lost(session, epoch, err).await });
                return;
            }
            ChannelEvent::Recovered => {
                debug!(channel = channel.id(), "publisher channel recovered");
                if shared.tracker.current_epoch() != Some(epoch) {
                    return;
                }
                epoch = shared
                    .tracker
                    .attach(channel.clone(), shared.tuning.channel_rpc_timeout)
                    .await;
            }
            event => shared.tracker.handle_event(epoch, &event),
        }
    }
}

/// Dispatch loop of a consumer channel.
async fn consumer_events(
    shared: Weak<Shared>,
    session: u64,
    channel: Arc<dyn BrokerChannel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        match event {
            ChannelEvent::Shutdown(err) => {
                tokio::spawn(async move { shared.consumer_lost(session, err).await });
                return;
            }
            ChannelEvent::Recovered => {
                debug!(channel = channel.id(), "consumer channel recovered");
                if let Err(err) = shared.pool.start(channel.clone()).await {
                    error!(error = err.to_string(), "failure to restart consumers after recovery");
                }
            }
            _ => {}
        }
    }
}
