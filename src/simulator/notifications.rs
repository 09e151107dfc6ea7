//! Device set change notifications
//!
//! The hub keeps one registration with the device set no matter how many
//! subscribers it has, and fans every mutation out to each subscription's own
//! channel. A dispatcher task owns all hub state; the public methods only send it
//! commands, so subscribing, unsubscribing and delivery never interleave.
//!
//! Guarantees:
//! - a new subscription first receives one [`SimulatorEvent::Snapshot`] per device
//!   in the set, queued before `subscribe` returns;
//! - events of one subscription arrive in the order the set changed;
//! - once `unsubscribe` returns nothing new is queued for that subscription.
//!   Events queued before that still drain, so a handler may run once more
//!   after `unsubscribe` returned;
//! - a subscription that falls [`SimulatorNotificationHub::BACKLOG`] events
//!   behind is closed: it drains what was queued and then ends.

use std::{
    collections::BTreeMap,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, warn};

use super::{DeviceSetNotification, RegistrationId, SimServiceContext, SimulatorDeviceRecord};
use crate::LocsimError;

pub type SubscriptionId = u64;

/// What a subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatorEvent {
    /// The device was in the set when the subscription started
    Snapshot(SimulatorDeviceRecord),
    /// The device was added or changed state
    Changed(SimulatorDeviceRecord),
    Removed(SimulatorDeviceRecord),
}

impl From<DeviceSetNotification> for SimulatorEvent {
    fn from(value: DeviceSetNotification) -> Self {
        match value {
            DeviceSetNotification::Changed(r) => Self::Changed(r),
            DeviceSetNotification::Removed(r) => Self::Removed(r),
        }
    }
}

/// The receiving end of one subscription
///
/// The stream ends after `unsubscribe`, or after the subscription fell too far
/// behind, once the queued events are drained.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::Receiver<SimulatorEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<SimulatorEvent> {
        self.events.recv().await
    }

    /// Takes an already queued event without waiting
    pub fn try_recv(&mut self) -> Option<SimulatorEvent> {
        self.events.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = SimulatorEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

enum Command {
    Subscribe(oneshot::Sender<Result<Subscription, LocsimError>>),
    Unsubscribe(SubscriptionId, oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

/// Fans device set mutations out to any number of subscribers
///
/// Must be created inside a tokio runtime. Dropping the hub releases the
/// registration with the device set.
#[derive(Debug)]
pub struct SimulatorNotificationHub {
    commands: mpsc::UnboundedSender<Command>,
}

impl SimulatorNotificationHub {
    /// Undelivered events a subscription may hold beyond its snapshot
    pub const BACKLOG: usize = 1024;

    pub fn new(context: SimServiceContext) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            context,
            subscribers: BTreeMap::new(),
            next_id: 0,
            registration: None,
            notifications,
        };
        tokio::spawn(dispatcher.run(command_rx, notification_rx));

        Self { commands }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LocsimError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| LocsimError::HubClosed)?;
        rx.await.map_err(|_| LocsimError::HubClosed)
    }

    /// Starts a subscription, with a snapshot of the current set already queued
    ///
    /// # Errors
    /// Fails if the device set can't be registered with or listed
    pub async fn subscribe(&self) -> Result<Subscription, LocsimError> {
        self.request(Command::Subscribe).await?
    }

    /// Starts a subscription whose events are passed to `handler` on a task of its own
    pub async fn subscribe_with<F>(&self, mut handler: F) -> Result<SubscriptionId, LocsimError>
    where
        F: FnMut(SimulatorEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe().await?;
        let id = subscription.id();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
            debug!("Subscription {id} drained");
        });
        Ok(id)
    }

    /// Ends a subscription
    ///
    /// Returns false if `id` is unknown or was already unsubscribed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.request(|reply| Command::Unsubscribe(id, reply))
            .await
            .unwrap_or(false)
    }

    /// Ends every subscription and releases the device set registration
    pub async fn shutdown(&self) {
        if self.request(Command::Shutdown).await.is_err() {
            debug!("Notification hub already shut down");
        }
    }
}

struct Dispatcher {
    context: SimServiceContext,
    subscribers: BTreeMap<SubscriptionId, mpsc::Sender<SimulatorEvent>>,
    next_id: SubscriptionId,
    registration: Option<RegistrationId>,
    notifications: mpsc::UnboundedSender<DeviceSetNotification>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notifications: mpsc::UnboundedReceiver<DeviceSetNotification>,
    ) {
        loop {
            tokio::select! {
                // Mutations that already happened go out before a new snapshot is taken
                biased;
                Some(notification) = notifications.recv() => self.fan_out(notification).await,
                command = commands.recv() => match command {
                    Some(Command::Subscribe(reply)) => {
                        let result = self.subscribe().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Unsubscribe(id, reply)) => {
                        let removed = self.unsubscribe(id).await;
                        let _ = reply.send(removed);
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.subscribers.clear();
                        self.release().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.subscribers.clear();
                        self.release().await;
                        break;
                    }
                },
            }
        }
        debug!("Notification dispatcher stopped");
    }

    async fn subscribe(&mut self) -> Result<Subscription, LocsimError> {
        if self.registration.is_none() {
            let id = self
                .context
                .device_set()
                .register_notifications(self.notifications.clone())
                .await?;
            debug!("Registered with device set as {id}");
            self.registration = Some(id);
        }

        let records = match self.context.records().await {
            Ok(r) => r,
            Err(e) => {
                if self.subscribers.is_empty() {
                    self.release().await;
                }
                return Err(e);
            }
        };

        let (tx, events) = mpsc::channel(records.len() + SimulatorNotificationHub::BACKLOG);
        for record in records {
            let _ = tx.try_send(SimulatorEvent::Snapshot(record));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, tx);
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed && self.subscribers.is_empty() {
            self.release().await;
        }
        removed
    }

    async fn fan_out(&mut self, notification: DeviceSetNotification) {
        let event = SimulatorEvent::from(notification);
        // Subscriptions whose receiver was dropped count as unsubscribed
        self.subscribers
            .retain(|id, tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscription {id} fell behind, closing it");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        if self.subscribers.is_empty() {
            self.release().await;
        }
    }

    async fn release(&mut self) {
        let Some(id) = self.registration.take() else {
            return;
        };
        match self.context.device_set().unregister_notifications(id).await {
            Ok(true) => debug!("Released device set registration {id}"),
            Ok(false) => warn!("Device set registration {id} was already gone"),
            Err(e) => warn!("Failed to release device set registration {id}: {e}"),
        }
    }
}
