// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirm Tracking
//!
//! Publishes messages on the publisher channel and turns the broker's confirmation signals
//! into exactly one [`PublishOutcome`] per publish call.
//!
//! The broker confirms by sequence number, possibly several at once (`multiple`), and reports
//! unroutable messages through a separate return signal that only names the exchange and
//! routing key. Outstanding publications are therefore indexed twice:
//! - by sequence number in an ordered map, for exact and "everything up to N" confirms;
//! - by target in FIFO queues, so the n-th return for a target resolves the n-th oldest
//!   outstanding publication to it. The broker does not correlate returns any closer than
//!   that, so concurrent publishes to one target absorb returns in publish order.
//!
//! Whichever of ack, nack, return or TTL expiry removes an entry from the sequence index
//! resolves it; anything arriving later finds nothing and is ignored.

use crate::{
    broker::{BrokerChannel, ChannelEvent},
    envelope::OutboundMessage,
    errors::{AmqpError, PublishError},
    status::StatusReporter,
    target::PublishTarget,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    task::{self, Poll},
    time::Duration,
};
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, error, warn};

/// Whether the current publisher channel is in publisher confirm mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    /// No publisher channel has been set up yet.
    #[default]
    Unknown,
    Active,
    /// The broker refused confirm mode.
    Inactive,
}

/// Successful publish result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub message_id: String,
    /// Sequence number the broker confirmed, absent when confirms were not in use.
    pub sequence_number: Option<u64>,
}

pub type PublishOutcome = Result<PublishAck, PublishError>;

/// Resolves to the outcome of one publish call.
#[derive(Debug)]
pub struct PublishHandle {
    rx: oneshot::Receiver<PublishOutcome>,
}

impl PublishHandle {
    fn resolved(outcome: PublishOutcome) -> PublishHandle {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        PublishHandle { rx }
    }
}

impl Future for PublishHandle {
    type Output = PublishOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(PublishError::ChannelLost)))
    }
}

struct Outstanding {
    message_id: String,
    target: PublishTarget,
    result: oneshot::Sender<PublishOutcome>,
    /// Pending-ack TTL timer, aborted as soon as the publication resolves.
    timer: Option<AbortHandle>,
}

impl Outstanding {
    fn succeed(mut self, sequence_number: u64) {
        self.disarm();
        let _ = self.result.send(Ok(PublishAck {
            message_id: self.message_id,
            sequence_number: Some(sequence_number),
        }));
    }

    fn fail(mut self, err: PublishError) {
        self.disarm();
        let _ = self.result.send(Err(err));
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Both indices over the outstanding publications of one channel session.
#[derive(Default)]
struct PendingPublications {
    epoch: u64,
    by_sequence: BTreeMap<u64, Outstanding>,
    by_target: HashMap<PublishTarget, VecDeque<u64>>,
}

impl PendingPublications {
    fn register(&mut self, sequence_number: u64, outstanding: Outstanding) {
        self.by_target
            .entry(outstanding.target.clone())
            .or_default()
            .push_back(sequence_number);
        self.by_sequence.insert(sequence_number, outstanding);
    }

    fn take(&mut self, epoch: u64, sequence_number: u64) -> Option<Outstanding> {
        if epoch != self.epoch {
            return None;
        }

        let outstanding = self.by_sequence.remove(&sequence_number)?;
        self.unlink(&outstanding.target, sequence_number);
        Some(outstanding)
    }

    /// Removes every entry with a sequence number up to and including `sequence_number`,
    /// in ascending order.
    fn take_through(&mut self, epoch: u64, sequence_number: u64) -> Vec<(u64, Outstanding)> {
        if epoch != self.epoch {
            return vec![];
        }

        let remaining = match sequence_number.checked_add(1) {
            Some(next) => self.by_sequence.split_off(&next),
            None => BTreeMap::new(),
        };
        let confirmed = std::mem::replace(&mut self.by_sequence, remaining);

        for (seq, outstanding) in &confirmed {
            self.unlink(&outstanding.target, *seq);
        }

        confirmed.into_iter().collect()
    }

    fn take_oldest_for(
        &mut self,
        epoch: u64,
        target: &PublishTarget,
    ) -> Option<(u64, Outstanding)> {
        if epoch != self.epoch {
            return None;
        }

        let queue = self.by_target.get_mut(target)?;
        let mut found = None;
        while let Some(seq) = queue.pop_front() {
            if let Some(outstanding) = self.by_sequence.remove(&seq) {
                found = Some((seq, outstanding));
                break;
            }
        }
        if queue.is_empty() {
            self.by_target.remove(target);
        }

        found
    }

    fn unlink(&mut self, target: &PublishTarget, sequence_number: u64) {
        if let Some(queue) = self.by_target.get_mut(target) {
            queue.retain(|seq| *seq != sequence_number);
            if queue.is_empty() {
                self.by_target.remove(target);
            }
        }
    }

    /// Starts a new session, handing back everything left over from the previous one.
    fn reset(&mut self, epoch: u64) -> Vec<Outstanding> {
        self.epoch = epoch;
        self.by_target.clear();
        std::mem::take(&mut self.by_sequence).into_values().collect()
    }
}

#[derive(Clone)]
struct Session {
    epoch: u64,
    channel: Arc<dyn BrokerChannel>,
    confirm_mode: ConfirmMode,
}

/// Publishes on the publisher channel and tracks broker confirmations.
pub struct PublisherConfirmTracker {
    session: RwLock<Option<Session>>,
    writer: tokio::sync::Mutex<()>,
    pending: Arc<Mutex<PendingPublications>>,
    epochs: AtomicU64,
    pending_ack_ttl: Duration,
    reporter: StatusReporter,
}

impl PublisherConfirmTracker {
    pub fn new(pending_ack_ttl: Duration, reporter: StatusReporter) -> PublisherConfirmTracker {
        PublisherConfirmTracker {
            session: RwLock::new(None),
            writer: tokio::sync::Mutex::new(()),
            pending: Arc::new(Mutex::new(PendingPublications::default())),
            epochs: AtomicU64::new(0),
            pending_ack_ttl,
            reporter,
        }
    }

    /// Takes over a freshly (re)created publisher channel and negotiates confirm mode on it.
    ///
    /// Publications still outstanding on the previous channel can no longer be confirmed
    /// and fail with `PublishError::ChannelLost`.
    ///
    /// # Returns
    /// The epoch identifying this channel session; confirmation events must be passed to
    /// [`Self::handle_event`] with it.
    pub async fn attach(&self, channel: Arc<dyn BrokerChannel>, rpc_timeout: Duration) -> u64 {
        let confirm_mode =
            match tokio::time::timeout(rpc_timeout, channel.confirm_select()).await {
                Ok(Ok(())) => ConfirmMode::Active,
                Ok(Err(err)) => {
                    warn!(
                        error = err.to_string(),
                        channel = channel.id(),
                        "publisher confirms not supported"
                    );
                    ConfirmMode::Inactive
                }
                Err(_) => {
                    warn!(
                        channel = channel.id(),
                        "timed out enabling publisher confirms"
                    );
                    ConfirmMode::Inactive
                }
            };

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;

        let _writer = self.writer.lock().await;
        let stale = self.pending().reset(epoch);
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Session {
            epoch,
            channel: channel.clone(),
            confirm_mode,
        });

        debug!(
            channel = channel.id(),
            epoch,
            ?confirm_mode,
            "publisher channel attached"
        );

        fail_all(stale, PublishError::ChannelLost);
        epoch
    }

    /// Drops the publisher channel of session `epoch`, or whatever channel is current when
    /// `epoch` is `None`.
    ///
    /// # Returns
    /// Whether a channel was detached.
    pub async fn detach(&self, epoch: Option<u64>) -> bool {
        let _writer = self.writer.lock().await;

        let detached = {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            match session.as_ref() {
                Some(s) if epoch.map_or(true, |e| e == s.epoch) => session.take(),
                _ => None,
            }
        };

        let Some(session) = detached else {
            return false;
        };

        let next = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let stale = self.pending().reset(next);
        debug!(
            channel = session.channel.id(),
            outstanding = stale.len(),
            "publisher channel detached"
        );
        fail_all(stale, PublishError::ChannelLost);

        true
    }

    pub fn confirm_mode(&self) -> ConfirmMode {
        self.current()
            .map(|s| s.confirm_mode)
            .unwrap_or(ConfirmMode::Unknown)
    }

    pub fn has_channel(&self) -> bool {
        self.current().is_some()
    }

    pub(crate) fn current_epoch(&self) -> Option<u64> {
        self.current().map(|s| s.epoch)
    }

    /// Number of publications waiting for a confirmation.
    pub fn outstanding(&self) -> usize {
        self.pending().by_sequence.len()
    }

    /// Publishes `message` and returns a handle resolving to its outcome.
    ///
    /// Missing channel and missing routing key resolve the handle immediately. Otherwise the
    /// frame is written under the channel writer lock; the handle then resolves on the
    /// broker's confirmation, or at once when the channel is not in confirm mode.
    pub async fn publish(&self, message: OutboundMessage) -> PublishHandle {
        if self.current().is_none() {
            return PublishHandle::resolved(Err(PublishError::NoChannel));
        }

        let Some(routing_key) = message.target.routing_key().map(str::to_owned) else {
            return PublishHandle::resolved(Err(PublishError::NoRoutingKey(
                message.target.to_string(),
            )));
        };

        let properties = message.properties(&Context::current());
        let exchange = message.target.exchange().to_owned();

        let writer = self.writer.lock().await;

        // The session may have been swapped while waiting for the writer.
        let Some(session) = self.current() else {
            return PublishHandle::resolved(Err(PublishError::NoChannel));
        };

        let (tx, rx) = oneshot::channel();

        if session.confirm_mode != ConfirmMode::Active {
            let written = session
                .channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    true,
                    message.payload.as_bytes(),
                    properties,
                )
                .await;
            drop(writer);

            let outcome = match written {
                Err(err) => {
                    self.publish_failed(&message.target, &err.to_string());
                    Err(PublishError::PublishFailed(err.to_string()))
                }
                Ok(()) if message.requires_ack => Err(PublishError::ConfirmsUnsupported),
                Ok(()) => Ok(PublishAck {
                    message_id: message.id,
                    sequence_number: None,
                }),
            };
            let _ = tx.send(outcome);

            return PublishHandle { rx };
        }

        let sequence_number = session.channel.next_publish_seq_no();
        {
            // the timer cannot take the entry before it is registered
            let mut pending = self.pending();
            let timer = self.arm_timeout(session.epoch, sequence_number);
            pending.register(
                sequence_number,
                Outstanding {
                    message_id: message.id.clone(),
                    target: message.target.clone(),
                    result: tx,
                    timer: Some(timer),
                },
            );
        }

        let written = session
            .channel
            .basic_publish(
                &exchange,
                &routing_key,
                true,
                message.payload.as_bytes(),
                properties,
            )
            .await;
        drop(writer);

        if let Err(err) = written {
            self.publish_failed(&message.target, &err.to_string());
            if let Some(outstanding) = self.pending().take(session.epoch, sequence_number) {
                outstanding.fail(PublishError::PublishFailed(err.to_string()));
            }
        }

        PublishHandle { rx }
    }

    /// Applies a confirmation signal of channel session `epoch`. Events of any other
    /// session, and events other than ack, nack and return, are ignored.
    pub(crate) fn handle_event(&self, epoch: u64, event: &ChannelEvent) {
        match event {
            ChannelEvent::Ack {
                delivery_tag,
                multiple,
            } => {
                for (seq, outstanding) in self.take_confirmed(epoch, *delivery_tag, *multiple) {
                    outstanding.succeed(seq);
                }
            }
            ChannelEvent::Nack {
                delivery_tag,
                multiple,
            } => {
                for (seq, outstanding) in self.take_confirmed(epoch, *delivery_tag, *multiple) {
                    debug!(sequence_number = seq, "publication negatively confirmed");
                    outstanding.fail(PublishError::Nacked);
                }
            }
            ChannelEvent::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                let target = PublishTarget::new(exchange, Some(routing_key.as_str()));
                let returned = self.pending().take_oldest_for(epoch, &target);
                match returned {
                    Some((seq, outstanding)) => {
                        debug!(
                            sequence_number = seq,
                            target = %target,
                            reply_code,
                            "publication returned"
                        );
                        outstanding.fail(PublishError::Returned(*reply_code, reply_text.clone()));
                    }
                    None => debug!(target = %target, "return without outstanding publication"),
                }
            }
            ChannelEvent::Shutdown(_) | ChannelEvent::Recovered => {}
        }
    }

    fn take_confirmed(
        &self,
        epoch: u64,
        delivery_tag: u64,
        multiple: bool,
    ) -> Vec<(u64, Outstanding)> {
        let mut pending = self.pending();
        if multiple {
            pending.take_through(epoch, delivery_tag)
        } else {
            pending
                .take(epoch, delivery_tag)
                .map(|o| vec![(delivery_tag, o)])
                .unwrap_or_default()
        }
    }

    fn arm_timeout(&self, epoch: u64, sequence_number: u64) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let ttl = self.pending_ack_ttl;

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;

            let expired = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(epoch, sequence_number);

            if let Some(mut outstanding) = expired {
                outstanding.timer = None;
                warn!(
                    sequence_number,
                    target = %outstanding.target,
                    "no confirm arrived within the pending-ack ttl"
                );
                outstanding.fail(PublishError::ConfirmTimeout(ttl));
            }
        })
        .abort_handle()
    }

    fn publish_failed(&self, target: &PublishTarget, err: &str) {
        error!(error = err, target = %target, "error publishing message");
        self.reporter.failure(
            &target.to_string(),
            &AmqpError::PublishingError(err.to_owned()),
        );
    }

    fn current(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn pending(&self) -> MutexGuard<'_, PendingPublications> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fail_all(outstanding: Vec<Outstanding>, err: PublishError) {
    for o in outstanding {
        o.fail(err.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel,
        envelope::Payload,
        status::{ConnectivityStatus, StatusBoard},
    };
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicU64;

    const TTL: Duration = Duration::from_millis(200);
    const RPC_TIMEOUT: Duration = Duration::from_secs(1);

    fn channel(confirms: bool) -> Arc<MockBrokerChannel> {
        let mut channel = MockBrokerChannel::new();
        let seq = Arc::new(AtomicU64::new(1));
        let next = seq.clone();

        channel.expect_id().return_const(1u16);
        channel.expect_confirm_select().returning(move || {
            if confirms {
                Ok(())
            } else {
                Err(AmqpError::ConfirmSelectError("not implemented".to_owned()))
            }
        });
        channel
            .expect_next_publish_seq_no()
            .returning(move || next.load(Ordering::SeqCst));
        channel.expect_basic_publish().returning(move |_, _, _, _, _| {
            seq.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        Arc::new(channel)
    }

    fn tracker() -> (PublisherConfirmTracker, StatusBoard) {
        let board = StatusBoard::new();
        let reporter = StatusReporter::new(Arc::new(board.clone()));
        (PublisherConfirmTracker::new(TTL, reporter), board)
    }

    fn message(address: &str) -> OutboundMessage {
        OutboundMessage::new(
            PublishTarget::parse(address).unwrap(),
            Payload::Text("payload".to_owned()),
        )
    }

    fn ack(delivery_tag: u64, multiple: bool) -> ChannelEvent {
        ChannelEvent::Ack {
            delivery_tag,
            multiple,
        }
    }

    fn nack(delivery_tag: u64, multiple: bool) -> ChannelEvent {
        ChannelEvent::Nack {
            delivery_tag,
            multiple,
        }
    }

    fn returned(exchange: &str, routing_key: &str) -> ChannelEvent {
        ChannelEvent::Return {
            reply_code: 312,
            reply_text: "NO_ROUTE".to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }

    #[tokio::test]
    async fn should_fail_without_channel() {
        let (tracker, _) = tracker();

        let outcome = tracker.publish(message("ex/rk")).await.await;

        assert_eq!(outcome, Err(PublishError::NoChannel));
        assert_eq!(tracker.confirm_mode(), ConfirmMode::Unknown);
    }

    #[tokio::test]
    async fn should_fail_without_routing_key() {
        let (tracker, _) = tracker();
        tracker.attach(channel(true), RPC_TIMEOUT).await;

        let outcome = tracker.publish(message("ex")).await.await;

        assert_eq!(outcome, Err(PublishError::NoRoutingKey("ex".to_owned())));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn should_resolve_ack_then_nack_in_order() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;
        assert_eq!(tracker.confirm_mode(), ConfirmMode::Active);

        let first = tracker.publish(message("ex/rk").with_id("m1")).await;
        let second = tracker.publish(message("ex/rk").with_id("m2")).await;
        let third = tracker.publish(message("ex/rk").with_id("m3")).await;
        assert_eq!(tracker.outstanding(), 3);

        tracker.handle_event(epoch, &ack(2, true));
        tracker.handle_event(epoch, &nack(3, false));

        assert_eq!(
            first.await,
            Ok(PublishAck {
                message_id: "m1".to_owned(),
                sequence_number: Some(1)
            })
        );
        assert_eq!(second.await.unwrap().sequence_number, Some(2));
        assert_eq!(third.await, Err(PublishError::Nacked));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn should_resolve_multiple_ack_up_to_tag_only() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;

        let mut handles = vec![];
        for _ in 0..4 {
            handles.push(tracker.publish(message("ex/rk")).await);
        }

        tracker.handle_event(epoch, &ack(2, true));

        let mut handles = handles.into_iter();
        assert!(handles.next().unwrap().await.is_ok());
        assert!(handles.next().unwrap().await.is_ok());
        let mut third = handles.next().unwrap();
        let mut fourth = handles.next().unwrap();
        assert!((&mut third).now_or_never().is_none());
        assert!((&mut fourth).now_or_never().is_none());
        assert_eq!(tracker.outstanding(), 2);
    }

    #[tokio::test]
    async fn should_fail_only_the_nacked_publication() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;

        let first = tracker.publish(message("ex/rk")).await;
        let second = tracker.publish(message("ex/rk")).await;
        let third = tracker.publish(message("ex/rk")).await;

        tracker.handle_event(epoch, &nack(2, false));
        tracker.handle_event(epoch, &ack(1, false));
        tracker.handle_event(epoch, &ack(3, false));

        assert!(first.await.is_ok());
        assert_eq!(second.await, Err(PublishError::Nacked));
        assert!(third.await.is_ok());
    }

    #[tokio::test]
    async fn should_match_returns_in_publish_order() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;

        let mut first = tracker.publish(message("ex/rk")).await;
        let mut second = tracker.publish(message("ex/rk")).await;
        let mut other = tracker.publish(message("ex/other")).await;

        tracker.handle_event(epoch, &returned("ex", "rk"));
        assert_eq!(
            (&mut first).now_or_never(),
            Some(Err(PublishError::Returned(312, "NO_ROUTE".to_owned())))
        );
        assert!((&mut second).now_or_never().is_none());

        tracker.handle_event(epoch, &returned("ex", "rk"));
        assert_eq!(
            (&mut second).now_or_never(),
            Some(Err(PublishError::Returned(312, "NO_ROUTE".to_owned())))
        );
        assert!((&mut other).now_or_never().is_none());
        assert_eq!(tracker.outstanding(), 1);
    }

    #[tokio::test]
    async fn should_resolve_exactly_once() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;

        let first = tracker.publish(message("ex/rk")).await;
        let second = tracker.publish(message("ex/rk")).await;

        tracker.handle_event(epoch, &returned("ex", "rk"));
        // the broker still confirms a returned message afterwards
        tracker.handle_event(epoch, &ack(1, false));
        tracker.handle_event(epoch, &ack(2, false));
        tracker.handle_event(epoch, &nack(2, false));
        tracker.handle_event(epoch, &ack(2, true));
        tracker.handle_event(epoch, &returned("ex", "rk"));

        assert!(matches!(first.await, Err(PublishError::Returned(..))));
        assert!(second.await.is_ok());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_unconfirmed_publication() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;

        let started = tokio::time::Instant::now();
        let handle = tracker.publish(message("ex/rk")).await;

        assert_eq!(handle.await, Err(PublishError::ConfirmTimeout(TTL)));
        assert!(started.elapsed() >= TTL);
        assert_eq!(tracker.outstanding(), 0);

        // a late confirm finds nothing to resolve
        tracker.handle_event(epoch, &ack(1, false));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_time_out_confirmed_publication() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;

        let handle = tracker.publish(message("ex/rk")).await;
        tracker.handle_event(epoch, &ack(1, false));
        tokio::time::sleep(TTL * 2).await;

        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_ttl_timers_of_resolved_publications() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;
        let metrics = tokio::runtime::Handle::current().metrics();

        let first = tracker.publish(message("ex/rk")).await;
        let second = tracker.publish(message("ex/rk")).await;
        let third = tracker.publish(message("ex/other")).await;
        assert_eq!(metrics.num_alive_tasks(), 3);

        tracker.handle_event(epoch, &ack(2, true));
        tracker.handle_event(epoch, &nack(3, false));
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(metrics.num_alive_tasks(), 0);
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
        assert_eq!(third.await, Err(PublishError::Nacked));
    }

    #[tokio::test]
    async fn should_resolve_immediately_when_confirms_inactive() {
        let (tracker, _) = tracker();
        tracker.attach(channel(false), RPC_TIMEOUT).await;
        assert_eq!(tracker.confirm_mode(), ConfirmMode::Inactive);

        let plain = tracker.publish(message("ex/rk").with_id("m1")).await;
        let acked = tracker.publish(message("ex/rk").requiring_ack()).await;

        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(
            plain.await,
            Ok(PublishAck {
                message_id: "m1".to_owned(),
                sequence_number: None
            })
        );
        let err = acked.await.unwrap_err();
        assert_eq!(err, PublishError::ConfirmsUnsupported);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn should_fail_outstanding_on_detach() {
        let (tracker, _) = tracker();
        let epoch = tracker.attach(channel(true), RPC_TIMEOUT).await;

        let handle = tracker.publish(message("ex/rk")).await;

        assert!(!tracker.detach(Some(epoch + 100)).await);
        assert!(tracker.detach(Some(epoch)).await);

        assert_eq!(handle.await, Err(PublishError::ChannelLost));
        assert!(!tracker.has_channel());
        assert_eq!(
            tracker.publish(message("ex/rk")).await.await,
            Err(PublishError::NoChannel)
        );
    }

    #[tokio::test]
    async fn should_ignore_events_of_previous_channel() {
        let (tracker, _) = tracker();
        let old = tracker.attach(channel(true), RPC_TIMEOUT).await;
        let stale = tracker.publish(message("ex/rk")).await;

        let current = tracker.attach(channel(true), RPC_TIMEOUT).await;
        assert_ne!(old, current);
        assert_eq!(stale.await, Err(PublishError::ChannelLost));

        let mut handle = tracker.publish(message("ex/rk")).await;
        tracker.handle_event(old, &ack(1, true));
        assert!((&mut handle).now_or_never().is_none());

        tracker.handle_event(current, &ack(1, false));
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn should_fail_and_report_unwritable_publication() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_id().return_const(1u16);
        channel.expect_confirm_select().returning(|| Ok(()));
        channel.expect_next_publish_seq_no().return_const(1u64);
        channel
            .expect_basic_publish()
            .returning(|_, _, _, _, _| Err(AmqpError::PublishingError("socket closed".to_owned())));

        let (tracker, board) = tracker();
        tracker.attach(Arc::new(channel), RPC_TIMEOUT).await;

        let outcome = tracker.publish(message("ex/rk")).await.await;

        assert!(matches!(outcome, Err(PublishError::PublishFailed(_))));
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(board.status("ex/rk"), ConnectivityStatus::Failed);
    }
}
