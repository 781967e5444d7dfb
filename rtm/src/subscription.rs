//! Subscription options, events and the per-subscription state machine.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::pdu::{self, Action, Pdu};

/// Error codes after which a stored position can't be used to resume.
pub const POSITION_INVALID_ERRORS: &[&str] = &["expired_position", "out_of_sync"];

/// The `history` option of a subscribe request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
}

/// Options of an `rtm/subscribe` request.
///
/// Fields this type doesn't know go into `extra` and are sent verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<History>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_forward: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn position<S: Into<String>>(mut self, position: S) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    fn has_source(&self) -> bool {
        self.channel.is_some()
            || self.filter.is_some()
            || self.view.is_some()
            || ["channel", "filter", "view"]
                .iter()
                .any(|k| self.extra.contains_key(*k))
    }

    /// Body of the subscribe request for `subscription_id`.
    ///
    /// Without a channel, filter or view the subscription id doubles as the
    /// channel name.
    pub(crate) fn request_body(&self, subscription_id: &str) -> Result<Value> {
        let mut body = serde_json::to_value(self).map_err(crate::map_context!())?;
        pdu::insert_field(
            &mut body,
            "subscription_id",
            Value::from(subscription_id),
        );
        if !self.has_source() {
            pdu::insert_field(&mut body, "channel", Value::from(subscription_id));
        }
        Ok(body)
    }
}

/// Options of an `rtm/read` request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Init,
    Subscribed,
    Unsubscribed,
    Error,
    Disconnect,
    /// Replaced by a newer subscription with the same id.
    Resubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Delivered by `subscribe` before the request is sent.
    Init,
    Subscribed,
    Unsubscribed,
    Data,
    Info,
    Error,
    Disconnect,
    Unknown,
}

impl From<&Action> for EventKind {
    fn from(action: &Action) -> Self {
        match action {
            Action::SubscribeOk => EventKind::Subscribed,
            Action::UnsubscribeOk => EventKind::Unsubscribed,
            Action::SubscriptionData => EventKind::Data,
            Action::SubscriptionInfo => EventKind::Info,
            Action::SubscribeError | Action::SubscriptionError | Action::UnsubscribeError => {
                EventKind::Error
            }
            _ => EventKind::Unknown,
        }
    }
}

/// A change of a subscription, or data received for it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub kind: EventKind,
    /// The PDU body, `Null` for [`EventKind::Init`].
    pub data: Value,
}

impl SubscriptionEvent {
    pub fn is_error(&self) -> bool {
        self.kind == EventKind::Error
    }

    /// Messages of a [`EventKind::Data`] event.
    pub fn messages(&self) -> &[Value] {
        self.data
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.data.get("subscription_id").and_then(Value::as_str)
    }

    pub fn position(&self) -> Option<&str> {
        self.data.get("position").and_then(Value::as_str)
    }

    pub fn error(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    pub fn reason(&self) -> Option<&str> {
        self.data.get("reason").and_then(Value::as_str)
    }

    /// The service rejected the position. Subscribing again with
    /// [`SubscriptionContext::options_without_position`] recovers.
    pub fn is_position_invalid(&self) -> bool {
        self.is_error()
            && self
                .error()
                .map_or(false, |e| POSITION_INVALID_ERRORS.contains(&e))
    }
}

/// Callback receiving every event of a subscription.
pub type SubscriptionHandler = Arc<dyn Fn(&SubscriptionContext, &SubscriptionEvent) + Send + Sync>;

struct Status {
    state: SubscriptionState,
    position: Option<String>,
}

struct Context {
    subscription_id: String,
    options: SubscribeOptions,
    handler: SubscriptionHandler,
    status: Mutex<Status>,
}

/// Settings and live state of one subscription.
///
/// Cloning is cheap; clones refer to the same subscription.
#[derive(Clone)]
pub struct SubscriptionContext {
    inner: Arc<Context>,
}

impl SubscriptionContext {
    pub(crate) fn new(
        subscription_id: &str,
        options: SubscribeOptions,
        handler: SubscriptionHandler,
    ) -> Self {
        SubscriptionContext {
            inner: Arc::new(Context {
                subscription_id: subscription_id.to_string(),
                options,
                handler,
                status: Mutex::new(Status {
                    state: SubscriptionState::Init,
                    position: None,
                }),
            }),
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.inner.subscription_id
    }

    /// The options the subscription was created with.
    pub fn options(&self) -> &SubscribeOptions {
        &self.inner.options
    }

    pub fn options_without_position(&self) -> SubscribeOptions {
        SubscribeOptions {
            position: None,
            ..self.inner.options.clone()
        }
    }

    pub fn handler(&self) -> SubscriptionHandler {
        self.inner.handler.clone()
    }

    /// The last position seen in a reply or event.
    pub fn position(&self) -> Option<String> {
        self.inner.status.lock().position.clone()
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.status.lock().state
    }

    /// Both handles refer to the same subscription.
    pub fn same(&self, other: &SubscriptionContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn init_event(&self) -> SubscriptionEvent {
        SubscriptionEvent {
            kind: EventKind::Init,
            data: Value::Null,
        }
    }

    pub(crate) fn handle_pdu(&self, pdu: Pdu) -> SubscriptionEvent {
        let event = SubscriptionEvent {
            kind: EventKind::from(&pdu.action),
            data: pdu.body,
        };
        self.apply(&event);
        event
    }

    pub(crate) fn handle_disconnect(&self) -> SubscriptionEvent {
        let mut data = pdu::disconnect_body();
        pdu::insert_field(
            &mut data,
            "subscription_id",
            Value::from(self.subscription_id()),
        );
        let event = SubscriptionEvent {
            kind: EventKind::Disconnect,
            data,
        };
        self.apply(&event);
        event
    }

    pub(crate) fn mark_resubscribed(&self) {
        self.inner.status.lock().state = SubscriptionState::Resubscribed;
    }

    pub(crate) fn deliver(&self, event: &SubscriptionEvent) {
        (self.inner.handler)(self, event)
    }

    fn apply(&self, event: &SubscriptionEvent) {
        let mut status = self.inner.status.lock();
        if let Some(position) = event.position() {
            status.position = Some(position.to_string());
        }
        status.state = match event.kind {
            EventKind::Subscribed => SubscriptionState::Subscribed,
            EventKind::Unsubscribed => SubscriptionState::Unsubscribed,
            EventKind::Error => SubscriptionState::Error,
            EventKind::Disconnect => SubscriptionState::Disconnect,
            _ => status.state,
        };
    }
}

impl PartialEq for SubscriptionContext {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for SubscriptionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("SubscriptionContext")
            .field("subscription_id", &self.inner.subscription_id)
            .field("state", &status.state)
            .field("position", &status.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> SubscriptionHandler {
        Arc::new(|_: &SubscriptionContext, _: &SubscriptionEvent| {})
    }

    fn pdu(action: Action, body: Value) -> Pdu {
        Pdu::new(action, body)
    }

    #[test]
    fn channel_defaults_to_subscription_id() {
        let body = SubscribeOptions::new().request_body("animals").unwrap();
        assert_eq!(
            body,
            json!({"subscription_id": "animals", "channel": "animals"})
        );

        let body = SubscribeOptions::new()
            .filter("select * from animals")
            .request_body("zoo")
            .unwrap();
        assert_eq!(
            body,
            json!({"subscription_id": "zoo", "filter": "select * from animals"})
        );

        let mut opts = SubscribeOptions::new();
        opts.extra.insert("view".into(), json!("select 1"));
        let body = opts.request_body("v").unwrap();
        assert!(body.get("channel").is_none());
    }

    #[test]
    fn request_body_carries_options() {
        let body = SubscribeOptions::new()
            .channel("birds")
            .position("1479315802:0")
            .history(History {
                count: Some(10),
                age: None,
            })
            .request_body("sub")
            .unwrap();
        assert_eq!(
            body,
            json!({
                "subscription_id": "sub",
                "channel": "birds",
                "position": "1479315802:0",
                "history": {"count": 10},
            })
        );
    }

    #[test]
    fn state_machine() {
        let ctx = SubscriptionContext::new("c", SubscribeOptions::new(), noop());
        assert_eq!(ctx.state(), SubscriptionState::Init);
        assert_eq!(ctx.position(), None);

        let ev = ctx.handle_pdu(pdu(Action::SubscribeOk, json!({"position": "1:0"})));
        assert_eq!(ev.kind, EventKind::Subscribed);
        assert_eq!(ctx.state(), SubscriptionState::Subscribed);
        assert_eq!(ctx.position().as_deref(), Some("1:0"));

        let ev = ctx.handle_pdu(pdu(
            Action::SubscriptionData,
            json!({"position": "2:0", "messages": [1, 2]}),
        ));
        assert_eq!(ev.messages(), &[json!(1), json!(2)]);
        assert_eq!(ctx.state(), SubscriptionState::Subscribed);
        assert_eq!(ctx.position().as_deref(), Some("2:0"));

        // no position: keep the last one
        ctx.handle_pdu(pdu(Action::SubscriptionInfo, json!({"info": "fast_forward"})));
        assert_eq!(ctx.position().as_deref(), Some("2:0"));

        let ev = ctx.handle_disconnect();
        assert_eq!(ev.kind, EventKind::Disconnect);
        assert_eq!(ev.subscription_id(), Some("c"));
        assert_eq!(ev.error(), Some("disconnect"));
        assert_eq!(ctx.state(), SubscriptionState::Disconnect);
        assert_eq!(ctx.position().as_deref(), Some("2:0"));

        ctx.mark_resubscribed();
        assert_eq!(ctx.state(), SubscriptionState::Resubscribed);
        assert_eq!(ctx.position().as_deref(), Some("2:0"));
    }

    #[test]
    fn errors_and_unknown_actions() {
        let ctx = SubscriptionContext::new("c", SubscribeOptions::new(), noop());
        let ev = ctx.handle_pdu(pdu(
            Action::SubscriptionError,
            json!({"error": "out_of_sync", "reason": "too slow", "position": "9:9"}),
        ));
        assert!(ev.is_error());
        assert!(ev.is_position_invalid());
        assert_eq!(ctx.state(), SubscriptionState::Error);
        assert_eq!(ctx.position().as_deref(), Some("9:9"));

        let ev = ctx.handle_pdu(pdu(Action::from("rtm/subscription/new"), json!({})));
        assert_eq!(ev.kind, EventKind::Unknown);
        assert_eq!(ctx.state(), SubscriptionState::Error);

        let ev = ctx.handle_pdu(pdu(
            Action::SubscribeError,
            json!({"error": "invalid_format"}),
        ));
        assert!(!ev.is_position_invalid());
    }

    #[test]
    fn recovery_helpers() {
        let opts = SubscribeOptions::new().channel("c").position("5:0");
        let ctx = SubscriptionContext::new("s", opts, noop());
        let clean = ctx.options_without_position();
        assert_eq!(clean.position, None);
        assert_eq!(clean.channel.as_deref(), Some("c"));
        assert_eq!(ctx.options().position.as_deref(), Some("5:0"));

        let other = SubscriptionContext::new("s", SubscribeOptions::new(), ctx.handler());
        assert!(Arc::ptr_eq(&ctx.handler(), &other.handler()));
        assert_ne!(ctx, other);
        assert_eq!(ctx, ctx.clone());
    }
}
