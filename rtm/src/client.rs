use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::config::ClientBuilder;
use crate::error::{ErrorKind, Result};
use crate::logger::Logger;
use crate::pdu::{
    self, Action, CloseEvent, Pdu, Reply, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
use crate::subscription::{
    EventKind, ReadOptions, SubscribeOptions, SubscriptionContext, SubscriptionEvent,
    SubscriptionHandler,
};
use crate::transport::{FrameKind, ReadStatus, Transport, TransportEvent, READ_SLICE};

/// Receives the outcome of one request.
pub type ReplyHandler = Box<dyn FnOnce(Reply) + Send>;

type OpenListener = Arc<dyn Fn() + Send + Sync>;
type CloseListener = Arc<dyn Fn(&CloseEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Open,
    Closed,
}

// What to do with the reply of a request.
enum Pending {
    Reply(ReplyHandler),
    Subscribe(SubscriptionContext),
    Unsubscribe {
        subscription_id: String,
        on_reply: Option<ReplyHandler>,
    },
    Handshake {
        secret: String,
        on_reply: ReplyHandler,
    },
}

struct Shared {
    state: ConnectionState,
    connect_called: bool,
    next_id: u64,
    pending: BTreeMap<u64, Pending>,
    subscriptions: BTreeMap<String, SubscriptionContext>,
}

#[derive(Default)]
struct Listeners {
    open: Vec<OpenListener>,
    close: Vec<CloseListener>,
}

/// A single-use connection to the RTM service.
///
/// Nothing happens in the background: replies, subscription events and
/// the disconnect notifications are delivered from inside the read calls
/// ([`Client::sock_read`], [`Client::wait_all_replies`], ...). The client
/// can be shared between a reading thread and any number of sending
/// threads.
pub struct Client {
    url: String,
    transport: Box<dyn Transport>,
    logger: Logger,
    shared: Mutex<Shared>,
    listeners: Mutex<Listeners>,
}

fn not_connected() -> crate::error::Error {
    crate::context!(ErrorKind::abnormal("Client is not connected"))
}

fn str_field<'a>(body: &'a Value, key: &str) -> &'a str {
    body.get(key).and_then(Value::as_str).unwrap_or("")
}

fn isolate<F: FnOnce()>(what: &str, f: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        error!("{} handler panicked: {}", what, message);
    }
}

impl Client {
    pub fn new(endpoint: &str, appkey: &str) -> Result<Self> {
        ClientBuilder::new(endpoint, appkey).build()
    }

    pub fn builder(endpoint: &str, appkey: &str) -> ClientBuilder {
        ClientBuilder::new(endpoint, appkey)
    }

    pub(crate) fn from_parts(url: String, transport: Box<dyn Transport>, logger: Logger) -> Self {
        Client {
            url,
            transport,
            logger,
            shared: Mutex::new(Shared {
                state: ConnectionState::Init,
                connect_called: false,
                next_id: 0,
                pending: BTreeMap::new(),
                subscriptions: BTreeMap::new(),
            }),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// The installed subscription with this id.
    pub fn subscription(&self, subscription_id: &str) -> Option<SubscriptionContext> {
        self.shared
            .lock()
            .subscriptions
            .get(subscription_id)
            .cloned()
    }

    pub fn on_open<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.lock().open.push(Arc::new(f));
    }

    /// Called once when the connection is closed or can't be established.
    pub fn on_close<F>(&self, f: F)
    where
        F: Fn(&CloseEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().close.push(Arc::new(f));
    }

    // ----- I/O

    fn sink(&self) -> impl FnMut(TransportEvent) + '_ {
        move |ev| self.handle_event(ev)
    }

    /// Connects to the service. A client can only be connected once.
    pub fn connect(&self) -> Result<()> {
        self.logger.scope(|| {
            {
                let mut shared = self.shared.lock();
                if shared.connect_called || shared.state != ConnectionState::Init {
                    return Err(crate::context!(ErrorKind::SingleUse));
                }
                shared.connect_called = true;
            }

            info!("connecting to {}", self.url);
            if let Err(e) = self.transport.connect(&self.url, &mut self.sink()) {
                let reason = match e.kind() {
                    ErrorKind::Connection { reason, .. } => reason.clone(),
                    kind => kind.to_string(),
                };
                self.handle_close(CloseEvent::new(
                    CLOSE_ABNORMAL,
                    format!("Connect exception: {}", reason),
                ));
                return Err(e);
            }
            Ok(())
        })
    }

    /// Closes the connection normally.
    pub fn close(&self) -> Result<()> {
        self.logger
            .scope(|| self.transport.close(CLOSE_NORMAL, "", &mut self.sink()))
    }

    /// Reads at least one frame, waiting at most `timeout`.
    ///
    /// `None` blocks until a frame arrives; a zero timeout does not block.
    pub fn sock_read(&self, timeout: Option<Duration>) -> Result<ReadStatus> {
        self.logger.scope(|| match timeout {
            Some(t) => self.transport.read_with_timeout(t, &mut self.sink()),
            None => self.transport.read(&mut self.sink()),
        })
    }

    pub fn sock_read_nonblock(&self) -> Result<ReadStatus> {
        self.logger
            .scope(|| self.transport.read_nonblock(&mut self.sink()))
    }

    /// Keeps reading for `duration`, or forever with `None`.
    pub fn sock_read_repeatedly(&self, duration: Option<Duration>) -> Result<()> {
        self.logger.scope(|| {
            let start = Instant::now();
            loop {
                match duration {
                    Some(d) => {
                        let elapsed = start.elapsed();
                        if elapsed >= d {
                            return Ok(());
                        }
                        self.transport
                            .read_with_timeout(d - elapsed, &mut self.sink())?;
                    }
                    None => {
                        self.transport.read(&mut self.sink())?;
                    }
                }
            }
        })
    }

    /// Reads until every pending request got its reply.
    ///
    /// Requests sent from reply handlers meanwhile are waited for too.
    /// Returns [`ReadStatus::Timeout`] if `timeout` passes first.
    pub fn wait_all_replies(&self, timeout: Option<Duration>) -> Result<ReadStatus> {
        self.logger.scope(|| {
            let start = Instant::now();
            loop {
                if self.shared.lock().pending.is_empty() {
                    return Ok(ReadStatus::Ok);
                }
                let slice = match timeout {
                    Some(t) => {
                        let elapsed = start.elapsed();
                        if elapsed >= t {
                            return Ok(ReadStatus::Timeout);
                        }
                        t - elapsed
                    }
                    None => READ_SLICE,
                };
                self.transport.read_with_timeout(slice, &mut self.sink())?;
            }
        })
    }

    // ----- operations

    pub fn publish<T: Serialize>(
        &self,
        channel: &str,
        message: &T,
        on_reply: Option<ReplyHandler>,
    ) -> Result<()> {
        let message = serde_json::to_value(message).map_err(crate::map_context!())?;
        self.request(
            Action::Publish,
            json!({ "channel": channel, "message": message }),
            on_reply,
        )
    }

    /// Reads the message at `options.position`, or the latest one.
    pub fn read(
        &self,
        channel: &str,
        options: ReadOptions,
        on_reply: Option<ReplyHandler>,
    ) -> Result<()> {
        let mut body = serde_json::to_value(&options).map_err(crate::map_context!())?;
        pdu::insert_field(&mut body, "channel", Value::from(channel));
        self.request(Action::Read, body, on_reply)
    }

    pub fn write<T: Serialize>(
        &self,
        channel: &str,
        message: &T,
        on_reply: Option<ReplyHandler>,
    ) -> Result<()> {
        let message = serde_json::to_value(message).map_err(crate::map_context!())?;
        self.request(
            Action::Write,
            json!({ "channel": channel, "message": message }),
            on_reply,
        )
    }

    /// Same as writing `null` to the channel.
    pub fn delete(&self, channel: &str, on_reply: Option<ReplyHandler>) -> Result<()> {
        self.request(Action::Delete, json!({ "channel": channel }), on_reply)
    }

    /// Subscribes `handler` to `subscription_id`.
    ///
    /// The handler sees an [`EventKind::Init`](crate::EventKind::Init)
    /// event before this function sends anything, then every change of the
    /// returned context.
    pub fn subscribe<F>(
        &self,
        subscription_id: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<SubscriptionContext>
    where
        F: Fn(&SubscriptionContext, &SubscriptionEvent) + Send + Sync + 'static,
    {
        self.subscribe_with_handler(subscription_id, options, Arc::new(handler))
    }

    /// Like [`Client::subscribe`] with a shared handler, for example the one
    /// of an earlier [`SubscriptionContext`].
    pub fn subscribe_with_handler(
        &self,
        subscription_id: &str,
        options: SubscribeOptions,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionContext> {
        self.logger.scope(|| {
            let body = options.request_body(subscription_id)?;
            let context = SubscriptionContext::new(subscription_id, options, handler);
            context.deliver(&context.init_event());
            self.send(
                Action::Subscribe,
                body,
                Some(Pending::Subscribe(context.clone())),
            )?;
            Ok(context)
        })
    }

    /// Ends a subscription. Its handler gets the final event and `on_reply`
    /// the raw reply.
    pub fn unsubscribe(&self, subscription_id: &str, on_reply: Option<ReplyHandler>) -> Result<()> {
        self.logger.scope(|| {
            self.send(
                Action::Unsubscribe,
                json!({ "subscription_id": subscription_id }),
                Some(Pending::Unsubscribe {
                    subscription_id: subscription_id.to_string(),
                    on_reply,
                }),
            )
        })
    }

    /// Authenticates as `role`.
    ///
    /// `on_reply` gets the reply of `auth/authenticate`, or the failed
    /// handshake reply.
    pub fn authenticate<F>(&self, role: &str, secret: &str, on_reply: F) -> Result<()>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.logger.scope(|| {
            self.send(
                Action::Handshake,
                auth::handshake_body(role),
                Some(Pending::Handshake {
                    secret: secret.to_string(),
                    on_reply: Box::new(on_reply),
                }),
            )
        })
    }

    fn request(&self, action: Action, body: Value, on_reply: Option<ReplyHandler>) -> Result<()> {
        self.logger
            .scope(|| self.send(action, body, on_reply.map(Pending::Reply)))
    }

    // Sends one PDU. An attached continuation is completed exactly once,
    // with a disconnect outcome if the PDU could not be sent.
    fn send(&self, action: Action, body: Value, pending: Option<Pending>) -> Result<()> {
        let mut pdu = Pdu::new(action, body);

        if let Some(p) = pending {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Open {
                drop(shared);
                self.complete_disconnected(p);
                return Err(not_connected());
            }
            shared.next_id += 1;
            let id = shared.next_id;
            shared.pending.insert(id, p);
            pdu.id = Some(id);
        }

        debug!("-> {}", pdu);
        let result = pdu.encode().and_then(|data| {
            self.transport
                .send(data.as_bytes(), FrameKind::Text, &mut self.sink())
        });
        if let Err(e) = result {
            if let Some(id) = pdu.id {
                // a failed send may already have run the disconnect fan-out
                let p = self.shared.lock().pending.remove(&id);
                if let Some(p) = p {
                    self.complete_disconnected(p);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    // ----- dispatch

    fn handle_event(&self, ev: TransportEvent) {
        match ev {
            TransportEvent::Open => self.handle_open(),
            TransportEvent::Message { data, .. } => self.handle_message(&data),
            TransportEvent::Pong(_) => debug!("pong"),
            TransportEvent::Close(ev) => self.handle_close(ev),
        }
    }

    fn handle_open(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Init {
                return;
            }
            shared.state = ConnectionState::Open;
        }
        info!("connection is opened");
        let listeners = self.listeners.lock().open.clone();
        for l in listeners {
            l();
        }
    }

    fn handle_message(&self, data: &[u8]) {
        let pdu = match Pdu::decode(data) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("dropping frame: {}", e);
                return;
            }
        };
        debug!("<- {}", pdu);

        match pdu.id {
            Some(id) => {
                let pending = self.shared.lock().pending.remove(&id);
                if let Some(p) = pending {
                    self.complete(p, pdu);
                }
            }
            None => self.handle_unsolicited(pdu),
        }
    }

    fn handle_unsolicited(&self, pdu: Pdu) {
        if pdu.action == Action::SystemError {
            let reason = format!(
                "Unclassified RTM error is received: {} -- {}",
                str_field(&pdu.body, "error"),
                str_field(&pdu.body, "reason")
            );
            if let Err(e) = self
                .transport
                .close(CLOSE_POLICY_VIOLATION, &reason, &mut self.sink())
            {
                warn!("fail to close connection: {}", e);
            }
        } else if pdu.action.is_subscription() {
            let context = pdu
                .body
                .get("subscription_id")
                .and_then(Value::as_str)
                .and_then(|sid| self.subscription(sid));
            match context {
                Some(context) => {
                    let event = context.handle_pdu(pdu);
                    context.deliver(&event);
                }
                None => debug!("no subscription for {}", pdu),
            }
        } else {
            debug!("ignoring {}", pdu);
        }
    }

    fn complete(&self, pending: Pending, pdu: Pdu) {
        match pending {
            Pending::Reply(on_reply) => on_reply(Reply::from(pdu)),
            Pending::Subscribe(context) => self.complete_subscribe(context, pdu),
            Pending::Unsubscribe {
                subscription_id,
                on_reply,
            } => {
                let context = self.shared.lock().subscriptions.remove(&subscription_id);
                if let Some(context) = context {
                    let event = context.handle_pdu(pdu.clone());
                    context.deliver(&event);
                }
                if let Some(on_reply) = on_reply {
                    on_reply(Reply::from(pdu));
                }
            }
            Pending::Handshake { secret, on_reply } => {
                self.complete_handshake(&secret, on_reply, Reply::from(pdu))
            }
        }
    }

    fn complete_subscribe(&self, context: SubscriptionContext, pdu: Pdu) {
        let mut event = context.handle_pdu(pdu);
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Open {
                // the disconnect fan-out ran after this reply was taken
                drop(shared);
                event = context.handle_disconnect();
                context.deliver(&event);
                return;
            }
            let sid = context.subscription_id();
            let superseded = shared
                .subscriptions
                .get(sid)
                .map_or(false, |prev| !prev.same(&context));
            if superseded {
                if let Some(prev) = shared.subscriptions.remove(sid) {
                    prev.mark_resubscribed();
                }
            }
            if event.kind == EventKind::Subscribed {
                shared
                    .subscriptions
                    .insert(sid.to_string(), context.clone());
            }
        }
        context.deliver(&event);
    }

    fn complete_handshake(&self, secret: &str, on_reply: ReplyHandler, reply: Reply) {
        if !reply.is_success() {
            return on_reply(reply);
        }
        let hash = match auth::nonce(reply.data()) {
            Some(nonce) => auth::hmac_md5(nonce, secret),
            None => {
                return on_reply(Reply::local_error(
                    "invalid_format",
                    "Handshake reply carries no nonce",
                ))
            }
        };
        let hash = match hash {
            Ok(hash) => hash,
            Err(e) => return on_reply(Reply::local_error("invalid_key", &e.to_string())),
        };
        if let Err(e) = self.send(
            Action::Authenticate,
            auth::authenticate_body(&hash),
            Some(Pending::Reply(on_reply)),
        ) {
            debug!("authenticate request is not sent: {}", e);
        }
    }

    fn complete_disconnected(&self, pending: Pending) {
        match pending {
            Pending::Reply(on_reply)
            | Pending::Handshake { on_reply, .. }
            | Pending::Unsubscribe {
                on_reply: Some(on_reply),
                ..
            } => on_reply(Reply::disconnect()),
            Pending::Unsubscribe { on_reply: None, .. } => {}
            Pending::Subscribe(context) => {
                let event = context.handle_disconnect();
                context.deliver(&event);
            }
        }
    }

    fn handle_close(&self, ev: CloseEvent) {
        let (pending, subscriptions) = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.state = ConnectionState::Closed;
            (
                std::mem::take(&mut shared.pending),
                std::mem::take(&mut shared.subscriptions),
            )
        };

        if ev.is_normal() {
            info!("connection is closed normally");
        } else {
            warn!("connection is closed with code: '{}' -- '{}'", ev.code, ev.reason);
        }

        // BTreeMap iterates in ascending id order
        for (_, p) in pending {
            isolate("reply", || self.complete_disconnected(p));
        }
        for (_, context) in subscriptions {
            let event = context.handle_disconnect();
            isolate("subscription", || context.deliver(&event));
        }

        let listeners = self.listeners.lock().close.clone();
        for l in listeners {
            isolate("close", || l(&ev));
        }
    }
}
