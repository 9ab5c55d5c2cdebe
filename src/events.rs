//! Realtime events pushed over the dealer channel.
//!
//! State updates arrive as frames carrying a `payloads` array. Every payload
//! names its `update_reason`, which is the event name handlers subscribe to:
//!
//! * `DEVICE_STATE_CHANGED` - a device joined, left or changed volume
//! * `PLAYER_STATE_CHANGED` - playback started, paused or changed track
//! * `DEVICES_DISAPPEARED` - devices went offline
//!
//! Handlers run in subscription order on the receive loop. A handler error
//! stops the loop; the error is returned by [`EventManager::stop`].
//!
//! # Example
//!
//! ```rust
//! use spotweb::events::{handler, EventManager};
//!
//! let mut manager = EventManager::start(channel).await?;
//! manager.subscribe("PLAYER_STATE_CHANGED", handler(|payload| {
//!     println!("{payload}");
//!     Ok(())
//! }))?;
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    dealer::Channel,
    error::{Error, Result},
    protocol::dealer::Frame,
};

/// Callback invoked with the payload of an event.
pub type Handler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event name to ordered list of distinct handlers.
#[derive(Default)]
pub struct EventRegistry {
    handlers: std::sync::Mutex<HashMap<String, Vec<Handler>>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the handlers of `event`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Validation`](crate::error::ErrorKind::Validation)
    /// if the same handler is already subscribed to `event`.
    pub fn subscribe(&self, event: &str, handler: Handler) -> Result<()> {
        let mut handlers = self.handlers.lock()?;
        let subscribed = handlers.entry(event.to_owned()).or_default();

        if subscribed.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            return Err(Error::validation(format!(
                "handler already subscribed to {event}"
            )));
        }

        subscribed.push(handler);
        Ok(())
    }

    /// Removes `handler` from `event`. Returns whether it was subscribed.
    ///
    /// # Errors
    ///
    /// Returns error if the registry lock is poisoned.
    pub fn unsubscribe(&self, event: &str, handler: &Handler) -> Result<bool> {
        let mut handlers = self.handlers.lock()?;
        let Some(subscribed) = handlers.get_mut(event) else {
            return Ok(false);
        };

        let before = subscribed.len();
        subscribed.retain(|existing| !Arc::ptr_eq(existing, handler));
        let removed = subscribed.len() != before;

        if subscribed.is_empty() {
            handlers.remove(event);
        }
        Ok(removed)
    }

    /// Number of handlers subscribed to `event`.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .map(|handlers| handlers.get(event).map_or(0, Vec::len))
            .unwrap_or_default()
    }

    /// Calls the handlers of `event` in subscription order.
    ///
    /// Handlers are snapshotted first, so they may subscribe or unsubscribe
    /// without deadlocking.
    ///
    /// # Errors
    ///
    /// Returns the first handler error; later handlers are not called.
    pub fn emit(&self, event: &str, payload: &Value) -> Result<()> {
        let snapshot: Vec<Handler> = self
            .handlers
            .lock()?
            .get(event)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            trace!("no handlers for {event}");
        }

        for handler in snapshot {
            handler(payload)?;
        }
        Ok(())
    }

    /// Emits every update in `frame` by its update reason.
    ///
    /// Frames without payloads are ignored.
    ///
    /// # Errors
    ///
    /// Returns the first handler error.
    pub fn dispatch_frame(&self, frame: &Frame) -> Result<()> {
        for (reason, payload) in frame.updates() {
            debug!("event: {reason}");
            self.emit(reason, payload)?;
        }
        Ok(())
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<String> = self
            .handlers
            .lock()
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("EventRegistry")
            .field("events", &events)
            .finish()
    }
}

/// Owns the receive loop of a channel and dispatches its events.
pub struct EventManager {
    channel: Arc<Channel>,
    registry: Arc<EventRegistry>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl EventManager {
    /// Registers the device, pulls the initial state and starts receiving.
    ///
    /// # Errors
    ///
    /// Returns error if registration or the initial pull fails.
    pub async fn start(channel: Arc<Channel>) -> Result<Self> {
        channel.register_device().await?;
        channel.renew_state().await?;
        Ok(Self::listen(channel))
    }

    /// Starts receiving on a channel that is already registered.
    #[must_use]
    pub fn listen(channel: Arc<Channel>) -> Self {
        Self::listen_with(channel, Arc::new(EventRegistry::new()))
    }

    /// Starts receiving with handlers that are already subscribed, so that
    /// no early frame is missed.
    #[must_use]
    pub fn listen_with(channel: Arc<Channel>, registry: Arc<EventRegistry>) -> Self {
        let cancel = channel.cancellation_token().child_token();

        let task = tokio::spawn(Self::receive_loop(
            Arc::clone(&channel),
            Arc::clone(&registry),
            cancel.clone(),
        ));

        Self {
            channel,
            registry,
            cancel,
            task: Some(task),
        }
    }

    async fn receive_loop(
        channel: Arc<Channel>,
        registry: Arc<EventRegistry>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("listening for realtime events");
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = channel.receive() => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = channel.absorb(&frame) {
                        warn!("ignoring pushed state: {e}");
                    }
                    if let Err(e) = registry.dispatch_frame(&frame) {
                        warn!("event handler failed, stopping: {e}");
                        return Err(e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    error!("realtime channel failed: {e}");
                    return Err(e);
                }
            }
        }

        debug!("stopped listening for realtime events");
        Ok(())
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Subscribes `handler` to `event`.
    ///
    /// # Errors
    ///
    /// As [`EventRegistry::subscribe`].
    pub fn subscribe(&self, event: &str, handler: Handler) -> Result<()> {
        self.registry.subscribe(event, handler)
    }

    /// Unsubscribes `handler` from `event`.
    ///
    /// # Errors
    ///
    /// As [`EventRegistry::unsubscribe`].
    pub fn unsubscribe(&self, event: &str, handler: &Handler) -> Result<bool> {
        self.registry.unsubscribe(event, handler)
    }

    /// Whether the receive loop is still running.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the receive loop and returns how it ended.
    ///
    /// # Errors
    ///
    /// Returns the handler or channel error that ended the loop.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::internal(format!("receive loop panicked: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        dealer::tests::{config_for, dealer_server, seeded_session, INIT},
        error::ErrorKind,
    };
    use wiremock::MockServer;

    #[test]
    fn duplicate_handlers_are_rejected() {
        let registry = EventRegistry::new();
        let first = handler(|_| Ok(()));
        let second = handler(|_| Ok(()));

        registry.subscribe("PLAYER_STATE_CHANGED", Arc::clone(&first)).unwrap();
        registry.subscribe("PLAYER_STATE_CHANGED", Arc::clone(&second)).unwrap();
        let err = registry
            .subscribe("PLAYER_STATE_CHANGED", Arc::clone(&first))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        // The same handler may serve another event.
        registry.subscribe("DEVICE_STATE_CHANGED", Arc::clone(&first)).unwrap();

        assert!(registry.unsubscribe("PLAYER_STATE_CHANGED", &first).unwrap());
        assert!(!registry.unsubscribe("PLAYER_STATE_CHANGED", &first).unwrap());
        assert_eq!(registry.count("PLAYER_STATE_CHANGED"), 1);
    }

    #[test]
    fn one_handler_serves_several_events() {
        let registry = EventRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let shared = handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.subscribe("PLAYER_STATE_CHANGED", Arc::clone(&shared)).unwrap();
        registry.subscribe("DEVICE_STATE_CHANGED", Arc::clone(&shared)).unwrap();

        let frame: Frame = serde_json::from_str(
            r#"{"payloads":[
                {"update_reason":"PLAYER_STATE_CHANGED"},
                {"update_reason":"DEVICE_STATE_CHANGED"}
            ]}"#,
        )
        .unwrap();
        registry.dispatch_frame(&frame).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(registry.unsubscribe("DEVICE_STATE_CHANGED", &shared).unwrap());
        registry.dispatch_frame(&frame).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn handlers_run_in_order() {
        let registry = EventRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry
                .subscribe(
                    "PLAYER_STATE_CHANGED",
                    handler(move |_| {
                        order.lock().unwrap().push(name);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        registry
            .emit("PLAYER_STATE_CHANGED", &serde_json::json!({}))
            .unwrap();
        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn frames_dispatch_by_update_reason() {
        let registry = EventRegistry::new();
        let devices = Arc::new(AtomicUsize::new(0));
        let players = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&devices);
        registry
            .subscribe(
                "DEVICE_STATE_CHANGED",
                handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        let counter = Arc::clone(&players);
        registry
            .subscribe(
                "PLAYER_STATE_CHANGED",
                handler(move |payload| {
                    assert_eq!(payload["cluster"]["active_device_id"], "A");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let frame: Frame = serde_json::from_str(
            r#"{"payloads":[
                {"update_reason":"DEVICE_STATE_CHANGED"},
                {"update_reason":"PLAYER_STATE_CHANGED","cluster":{"active_device_id":"A"}},
                {"update_reason":"DEVICE_STATE_CHANGED"}
            ]}"#,
        )
        .unwrap();
        registry.dispatch_frame(&frame).unwrap();

        let pong: Frame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        registry.dispatch_frame(&pong).unwrap();

        assert_eq!(devices.load(Ordering::SeqCst), 2);
        assert_eq!(players.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_errors_stop_dispatch() {
        let registry = EventRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry
            .subscribe("X", handler(|_| Err(Error::internal("boom"))))
            .unwrap();
        let counter = Arc::clone(&calls);
        registry
            .subscribe(
                "X",
                handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        assert!(registry.emit("X", &Value::Null).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn receive_loop_dispatches_pushed_frames() {
        let server = MockServer::start().await;
        let dealer = dealer_server(
            INIT,
            vec![r#"{"type":"message","payloads":[{"update_reason":"PLAYER_STATE_CHANGED","cluster":{"active_device_id":"PUSHED"}}]}"#.to_owned()],
        )
        .await;
        let config = config_for(&server, dealer);
        let channel = Arc::new(
            Channel::open(seeded_session(&config), &config, "DEVICE")
                .await
                .unwrap(),
        );

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = Arc::new(EventRegistry::new());
        registry
            .subscribe(
                "PLAYER_STATE_CHANGED",
                handler(move |payload| {
                    let _ = tx.send(payload["cluster"]["active_device_id"].clone());
                    Ok(())
                }),
            )
            .unwrap();
        let mut manager = EventManager::listen_with(Arc::clone(&channel), registry);

        let pushed = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("pushed frame was not dispatched")
            .unwrap();
        assert_eq!(pushed, "PUSHED");
        assert!(manager.is_listening());

        // The snapshot is replaced before handlers run.
        let saved = channel.saved_state().unwrap().unwrap();
        assert_eq!(saved.active_device_id.as_deref(), Some("PUSHED"));

        channel.close().await.unwrap();
        manager.stop().await.unwrap();
        assert!(!manager.is_listening());
    }
}
