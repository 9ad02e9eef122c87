// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Pool
//!
//! Starts one consumer per configured (queue, replica) on the consumer channel. Starting is
//! all-or-nothing: every queue is passively checked first and a single missing queue means no
//! consumer is started at all. Every start tears down whatever consumers were running before,
//! so it is also how consumers are re-established after a channel was recreated.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    config::Source,
    consumer::{self, ConsumerContext, ConsumerMetrics, InboundHandler},
    errors::AmqpError,
    status::StatusReporter,
};
use futures_util::future::join_all;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

struct RunningConsumers {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Consumers of every configured source, bound to one consumer channel at a time.
pub struct ConsumerPool {
    sources: Vec<Source>,
    handler: Arc<dyn InboundHandler>,
    reporter: StatusReporter,
    metrics: Arc<ConsumerMetrics>,
    rpc_timeout: Duration,
    stop_timeout: Duration,
    running: tokio::sync::Mutex<Option<RunningConsumers>>,
}

impl ConsumerPool {
    /// Creates a new consumer pool.
    ///
    /// # Parameters
    /// * `sources` - Sources whose addresses are consumed
    /// * `handler` - Downstream pipeline receiving every delivery
    /// * `reporter` - Receives per-address status updates
    /// * `rpc_timeout` - Bound of each broker call made while starting
    /// * `stop_timeout` - How long a stop waits for consumer tasks before abandoning them
    pub fn new(
        sources: Vec<Source>,
        handler: Arc<dyn InboundHandler>,
        reporter: StatusReporter,
        rpc_timeout: Duration,
        stop_timeout: Duration,
    ) -> ConsumerPool {
        ConsumerPool {
            sources,
            handler,
            reporter,
            metrics: Arc::new(ConsumerMetrics::default()),
            rpc_timeout,
            stop_timeout,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Number of consumer tasks still running.
    pub async fn running(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.tasks.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }

    /// Validates every source queue on `channel` and (re)starts all consumers on it.
    ///
    /// # Errors
    /// `AmqpError::MissingQueues` listing every missing queue, or the first other failure.
    /// Previously running consumers are stopped either way, and nothing new is started on
    /// failure.
    pub async fn start(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let mut running = self.running.lock().await;

        let addresses = self.addresses();
        let checked = check_queues(channel.as_ref(), &addresses, self.rpc_timeout).await;

        stop_consumers(running.take(), self.stop_timeout).await;

        if let Err(err) = checked {
            self.report_start_failure(&addresses, &err);
            return Err(err);
        }

        if let Some(prefetch) = self.sources.iter().filter_map(|s| s.qos).max() {
            let qos = tokio::time::timeout(self.rpc_timeout, channel.basic_qos(prefetch))
                .await
                .unwrap_or_else(|_| Err(AmqpError::Timeout("basic.qos".to_owned(), self.rpc_timeout)));
            if let Err(err) = qos {
                error!(error = err.to_string(), prefetch, "failure to configure qos");
                self.report_start_failure(&addresses, &err);
                return Err(err);
            }
        }

        let mut consumers: Vec<(ConsumerContext, DeliveryStream)> = vec![];
        for source in &self.sources {
            for address in &source.addresses {
                for replica in 0..source.consumer_count {
                    let consumer_tag = format!("{}-{}-{}", address, replica, Uuid::new_v4());

                    match channel.basic_consume(address, &consumer_tag).await {
                        Ok(deliveries) => consumers.push((
                            ConsumerContext {
                                address: address.clone(),
                                consumer_tag,
                                channel: channel.clone(),
                                handler: self.handler.clone(),
                                metrics: self.metrics.clone(),
                                reporter: self.reporter.clone(),
                            },
                            deliveries,
                        )),
                        Err(err) => {
                            error!(error = err.to_string(), address, "failure to create the consumer");
                            let created = consumers
                                .drain(..)
                                .map(|(ctx, _)| ctx.consumer_tag)
                                .collect::<Vec<_>>();
                            cancel_consumers(channel.as_ref(), created).await;
                            self.report_start_failure(&addresses, &err);
                            return Err(err);
                        }
                    }
                }
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let tasks = consumers
            .into_iter()
            .map(|(ctx, deliveries)| tokio::spawn(consumer::run(ctx, deliveries, stop_rx.clone())))
            .collect::<Vec<_>>();

        debug!(
            channel = channel.id(),
            consumers = tasks.len(),
            "consumers started"
        );
        *running = Some(RunningConsumers { stop, tasks });

        Ok(())
    }

    /// Stops every running consumer. Safe to call with none running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        stop_consumers(running.take(), self.stop_timeout).await;
    }

    fn addresses(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.sources
            .iter()
            .flat_map(|s| s.addresses.iter())
            .filter(|a| seen.insert(a.as_str()))
            .cloned()
            .collect()
    }

    fn report_start_failure(&self, addresses: &[String], err: &AmqpError) {
        match err {
            AmqpError::MissingQueues(missing) => {
                for address in missing {
                    self.reporter
                        .failure(address, &AmqpError::QueueNotFound(address.clone()));
                }
            }
            _ => {
                for address in addresses {
                    self.reporter.failure(address, err);
                }
            }
        }
    }
}

/// Passively checks that every address exists.
///
/// # Errors
/// `AmqpError::MissingQueues` with every missing address, in order; any other failure seen
/// before the first missing queue is returned as is.
pub async fn check_queues(
    channel: &dyn BrokerChannel,
    addresses: &[String],
    rpc_timeout: Duration,
) -> Result<(), AmqpError> {
    let mut missing = vec![];

    for address in addresses {
        let checked = tokio::time::timeout(rpc_timeout, channel.queue_exists(address))
            .await
            .unwrap_or_else(|_| Err(AmqpError::Timeout(format!("queue check `{address}`"), rpc_timeout)));

        match checked {
            Ok(()) => debug!(address, "queue exists"),
            Err(AmqpError::QueueNotFound(_)) => {
                warn!(address, "queue does not exist");
                missing.push(address.clone());
            }
            // The broker closes the channel on the first missing queue, so every later check
            // on it fails as well. Those failures say nothing about the later queues.
            Err(err) if !missing.is_empty() => {
                debug!(error = err.to_string(), address, "ignoring error after missing queue");
            }
            Err(err) => {
                error!(error = err.to_string(), address, "failure to check queue");
                return Err(err);
            }
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AmqpError::MissingQueues(missing))
    }
}

async fn cancel_consumers(channel: &dyn BrokerChannel, consumer_tags: Vec<String>) {
    for consumer_tag in consumer_tags {
        if let Err(err) = channel.basic_cancel(&consumer_tag).await {
            debug!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
        }
    }
}

/// Broadcasts stop and waits up to `timeout`; tasks still running after that are abandoned,
/// not aborted, so in-flight acks can finish.
async fn stop_consumers(running: Option<RunningConsumers>, timeout: Duration) {
    let Some(running) = running else {
        return;
    };

    let _ = running.stop.send(true);
    let count = running.tasks.len();

    if tokio::time::timeout(timeout, join_all(running.tasks))
        .await
        .is_err()
    {
        warn!(consumers = count, "consumers did not stop in time, abandoning them");
    } else {
        debug!(consumers = count, "consumers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel,
        consumer::tests::ScriptedHandler,
        status::{ConnectivityStatus, StatusBoard},
    };
    use futures_util::{stream, StreamExt};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn source(addresses: &[&str], consumer_count: usize, qos: Option<u16>) -> Source {
        Source {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            consumer_count,
            qos,
            enforcement: None,
        }
    }

    fn pool(sources: Vec<Source>) -> (ConsumerPool, StatusBoard) {
        let board = StatusBoard::new();
        let pool = ConsumerPool::new(
            sources,
            Arc::new(ScriptedHandler::default()),
            StatusReporter::new(Arc::new(board.clone())),
            TIMEOUT,
            TIMEOUT,
        );
        (pool, board)
    }

    /// Channel where `missing` queues are absent and every later check fails with a
    /// closed channel, like a broker does.
    fn channel(missing: &[&str], consumed: Arc<Mutex<Vec<String>>>) -> MockBrokerChannel {
        let missing: Vec<String> = missing.iter().map(|m| m.to_string()).collect();
        let closed = Arc::new(Mutex::new(false));
        let mut channel = MockBrokerChannel::new();

        channel.expect_id().return_const(2u16);
        channel.expect_queue_exists().returning(move |queue| {
            let mut closed = closed.lock().unwrap();
            if *closed {
                return Err(AmqpError::ChannelClosed(0, "channel closed".to_owned()));
            }
            if missing.iter().any(|m| m == queue) {
                *closed = true;
                return Err(AmqpError::QueueNotFound(queue.to_owned()));
            }
            Ok(())
        });
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel.expect_basic_consume().returning(move |queue, _| {
            consumed.lock().unwrap().push(queue.to_owned());
            Ok(stream::pending().boxed())
        });
        channel.expect_basic_cancel().returning(|_| Ok(()));
        channel
    }

    #[tokio::test]
    async fn should_start_nothing_when_a_queue_is_missing() {
        let consumed = Arc::new(Mutex::new(vec![]));
        let (pool, board) = pool(vec![source(&["a", "b", "c"], 1, None)]);

        let err = pool
            .start(Arc::new(channel(&["b"], consumed.clone())))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::MissingQueues(vec!["b".to_owned()]));
        assert!(consumed.lock().unwrap().is_empty());
        assert_eq!(pool.running().await, 0);
        assert_eq!(board.status("b"), ConnectivityStatus::Misconfigured);
    }

    #[tokio::test]
    async fn should_list_every_missing_queue() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_queue_exists().returning(|queue| {
            if queue == "present" {
                Ok(())
            } else {
                Err(AmqpError::QueueNotFound(queue.to_owned()))
            }
        });

        let addresses = ["x", "present", "y"].map(str::to_owned);
        let err = check_queues(&channel, &addresses, TIMEOUT).await.unwrap_err();

        assert_eq!(
            err,
            AmqpError::MissingQueues(vec!["x".to_owned(), "y".to_owned()])
        );
    }

    #[tokio::test]
    async fn should_propagate_error_before_any_missing_queue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_queue_exists()
            .returning(|_| Err(AmqpError::AccessRefused("queue 'a' in vhost '/'".to_owned())));

        let addresses = ["a".to_owned(), "b".to_owned()];
        let err = check_queues(&channel, &addresses, TIMEOUT).await.unwrap_err();

        assert!(matches!(err, AmqpError::AccessRefused(_)));
    }

    #[tokio::test]
    async fn should_start_one_consumer_per_address_and_replica() {
        let consumed = Arc::new(Mutex::new(vec![]));
        let mut channel = MockBrokerChannel::new();
        let qos = Arc::new(AtomicUsize::new(0));
        let q = qos.clone();
        let consumed_by = consumed.clone();
        channel.expect_id().return_const(2u16);
        channel.expect_queue_exists().returning(|_| Ok(()));
        channel.expect_basic_qos().returning(move |prefetch| {
            q.store(prefetch as usize, Ordering::SeqCst);
            Ok(())
        });
        channel.expect_basic_consume().returning(move |queue, _| {
            consumed_by.lock().unwrap().push(queue.to_owned());
            Ok(stream::pending().boxed())
        });
        channel.expect_basic_cancel().times(5).returning(|_| Ok(()));

        let (pool, board) = pool(vec![
            source(&["orders", "invoices"], 2, Some(10)),
            source(&["audit"], 1, Some(50)),
        ]);

        pool.start(Arc::new(channel)).await.unwrap();

        assert_eq!(pool.running().await, 5);
        assert_eq!(qos.load(Ordering::SeqCst), 50);
        assert_eq!(
            *consumed.lock().unwrap(),
            vec!["orders", "orders", "invoices", "invoices", "audit"]
        );

        pool.stop().await;
        assert_eq!(pool.running().await, 0);
        assert_eq!(board.status("orders"), ConnectivityStatus::Open);
    }

    #[tokio::test]
    async fn should_replace_running_consumers_on_restart() {
        let consumed = Arc::new(Mutex::new(vec![]));
        let (pool, _) = pool(vec![source(&["orders"], 2, None)]);

        pool.start(Arc::new(channel(&[], consumed.clone())))
            .await
            .unwrap();
        pool.start(Arc::new(channel(&[], consumed.clone())))
            .await
            .unwrap();

        assert_eq!(pool.running().await, 2);
        assert_eq!(consumed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn should_stop_previous_consumers_when_restart_fails() {
        let consumed = Arc::new(Mutex::new(vec![]));
        let (pool, _) = pool(vec![source(&["orders"], 1, None)]);

        pool.start(Arc::new(channel(&[], consumed.clone())))
            .await
            .unwrap();
        assert_eq!(pool.running().await, 1);

        let err = pool
            .start(Arc::new(channel(&["orders"], consumed.clone())))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::MissingQueues(vec!["orders".to_owned()]));
        assert_eq!(pool.running().await, 0);
    }

    #[tokio::test]
    async fn should_cancel_created_consumers_when_one_fails() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = cancelled.clone();
        let mut channel = MockBrokerChannel::new();
        channel.expect_id().return_const(2u16);
        channel.expect_queue_exists().returning(|_| Ok(()));
        channel.expect_basic_consume().returning(|queue, _| {
            if queue == "broken" {
                Err(AmqpError::ConsumerDeclarationError(
                    queue.to_owned(),
                    "exclusive".to_owned(),
                ))
            } else {
                Ok(stream::pending().boxed())
            }
        });
        channel.expect_basic_cancel().returning(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (pool, _) = pool(vec![source(&["orders", "broken"], 1, None)]);

        assert!(pool.start(Arc::new(channel)).await.is_err());
        assert_eq!(pool.running().await, 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_start_and_roll_back_from_a_spawned_task() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_id().return_const(2u16);
        channel.expect_queue_exists().returning(|_| Ok(()));
        channel.expect_basic_consume().returning(|queue, _| {
            if queue == "broken" {
                Err(AmqpError::ConsumerDeclarationError(
                    queue.to_owned(),
                    "exclusive".to_owned(),
                ))
            } else {
                Ok(stream::pending().boxed())
            }
        });
        channel
            .expect_basic_cancel()
            .times(2)
            .returning(|_| Err(AmqpError::ChannelClosed(0, "channel closed".to_owned())));

        let (pool, _) = pool(vec![source(&["orders", "broken"], 2, None)]);
        let pool = Arc::new(pool);
        let spawned = pool.clone();

        let started = tokio::spawn(async move { spawned.start(Arc::new(channel)).await })
            .await
            .unwrap();

        assert!(matches!(
            started,
            Err(AmqpError::ConsumerDeclarationError(..))
        ));
        assert_eq!(pool.running().await, 0);
    }
}
