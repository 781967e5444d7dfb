//! A small in-process RTM service for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

pub const APPKEY: &str = "0123456789abcdef";
pub const ROLE: &str = "superuser";
pub const SECRET: &str = "B37Ab888CAB4343434bAE98AAAAAABC1";
pub const NONCE: &str = "MTI0Mjc2MzQ1NjczOTc4NTE0Mw==";

/// Publishing here is refused.
pub const RESTRICTED: &str = "restricted";
/// Publishing here makes the service push an unclassified `/error`.
pub const SYSTEM_ERROR: &str = "system-error";
/// Publishing here makes the service close with code 4000.
pub const SERVER_CLOSE: &str = "server-close";
/// Subscribing with this position fails with `expired_position`.
pub const EXPIRED: &str = "1:expired";

#[derive(Default)]
struct Store {
    counter: u64,
    values: HashMap<String, Value>,
}

impl Store {
    fn next_position(&mut self) -> String {
        self.counter += 1;
        format!("{}:0", self.counter)
    }
}

enum Out {
    Send(Value),
    Close(u16, &'static str),
}

#[derive(Default)]
struct Session {
    authenticated: bool,
    // subscription id -> channel
    subscriptions: HashMap<String, String>,
}

fn reply(pdu: &Value, suffix: &str, body: Value) -> Out {
    Out::Send(json!({
        "action": format!("{}/{}", pdu["action"].as_str().unwrap_or(""), suffix),
        "id": pdu["id"],
        "body": body,
    }))
}

fn handle(pdu: &Value, session: &mut Session, store: &Mutex<Store>) -> Vec<Out> {
    let body = &pdu["body"];
    let channel = body["channel"].as_str().unwrap_or("").to_string();
    let mut store = store.lock().unwrap();

    match pdu["action"].as_str().unwrap_or("") {
        "auth/handshake" => {
            if body["data"]["role"].as_str().unwrap_or("").is_empty() {
                vec![reply(pdu, "error", json!({"error": "authentication_failed", "reason": "Unknown role"}))]
            } else {
                vec![reply(pdu, "ok", json!({"data": {"nonce": NONCE}}))]
            }
        }
        "auth/authenticate" => {
            let expected = rtm::auth::hmac_md5(NONCE, SECRET).unwrap();
            if body["credentials"]["hash"] == expected {
                session.authenticated = true;
                vec![reply(pdu, "ok", json!({}))]
            } else {
                vec![reply(pdu, "error", json!({"error": "authentication_failed", "reason": "Unauthenticated"}))]
            }
        }
        "rtm/publish" | "rtm/write" => {
            if channel == SYSTEM_ERROR {
                return vec![Out::Send(json!({
                    "action": "/error",
                    "body": {"error": "invalid_service", "reason": "Service is going away"},
                }))];
            }
            if channel == SERVER_CLOSE {
                return vec![Out::Close(4000, "bye")];
            }
            if channel == RESTRICTED && !session.authenticated {
                return vec![reply(pdu, "error", json!({"error": "authorization_denied", "reason": "Unauthorized"}))];
            }
            let position = store.next_position();
            let message = body["message"].clone();
            store.values.insert(channel.clone(), message.clone());

            let mut out = Vec::new();
            if pdu.get("id").is_some() {
                out.push(reply(pdu, "ok", json!({"position": position})));
            }
            for (sid, ch) in &session.subscriptions {
                if *ch == channel {
                    out.push(Out::Send(json!({
                        "action": "rtm/subscription/data",
                        "body": {"subscription_id": sid, "position": position, "messages": [message]},
                    })));
                }
            }
            out
        }
        "rtm/read" => {
            let message = store.values.get(&channel).cloned().unwrap_or(Value::Null);
            let position = store.next_position();
            vec![reply(pdu, "ok", json!({"position": position, "message": message}))]
        }
        "rtm/delete" => {
            store.values.remove(&channel);
            let position = store.next_position();
            vec![reply(pdu, "ok", json!({"position": position}))]
        }
        "rtm/subscribe" => {
            let sid = body["subscription_id"].as_str().unwrap_or("").to_string();
            if body["position"] == EXPIRED {
                return vec![reply(pdu, "error", json!({
                    "error": "expired_position",
                    "reason": "Position is expired",
                    "subscription_id": sid,
                }))];
            }
            let ch = match body["filter"].as_str() {
                Some(filter) => filter.rsplit(' ').next().unwrap_or("").to_string(),
                None => channel,
            };
            session.subscriptions.insert(sid.clone(), ch);
            let position = store.next_position();
            vec![reply(pdu, "ok", json!({"subscription_id": sid, "position": position}))]
        }
        "rtm/unsubscribe" => {
            let sid = body["subscription_id"].as_str().unwrap_or("").to_string();
            if session.subscriptions.remove(&sid).is_some() {
                let position = store.next_position();
                vec![reply(pdu, "ok", json!({"subscription_id": sid, "position": position}))]
            } else {
                vec![reply(pdu, "error", json!({"error": "invalid_format", "reason": "Unknown subscription"}))]
            }
        }
        _ => vec![reply(pdu, "error", json!({"error": "invalid_operation", "reason": "Unknown action"}))],
    }
}

fn check_appkey(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    let expected = format!("appkey={}", APPKEY);
    if req.uri().path() == "/v2" && req.uri().query() == Some(expected.as_str()) {
        return Ok(resp);
    }
    let mut err = ErrorResponse::new(Some("invalid appkey".to_string()));
    *err.status_mut() = StatusCode::UNAUTHORIZED;
    Err(err)
}

fn serve(stream: TcpStream, store: Arc<Mutex<Store>>) {
    let mut ws = match tungstenite::accept_hdr(stream, check_appkey) {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let mut session = Session::default();
    loop {
        let text = match ws.read() {
            Ok(Message::Text(text)) => text,
            Ok(_) => continue,
            Err(_) => return,
        };
        let pdu: Value = match serde_json::from_str(&text) {
            Ok(pdu) => pdu,
            Err(_) => continue,
        };
        for out in handle(&pdu, &mut session, &store) {
            let sent = match out {
                Out::Send(v) => ws.send(Message::Text(v.to_string())),
                Out::Close(code, reason) => ws.close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
            };
            if sent.is_err() {
                return;
            }
        }
    }
}

/// Starts the service and returns its endpoint, `ws://127.0.0.1:<port>`.
pub fn start() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let store = Arc::new(Mutex::new(Store::default()));
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => continue,
            };
            let store = store.clone();
            thread::spawn(move || serve(stream, store));
        }
    });
    endpoint
}

/// A closed local port.
pub fn refused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    endpoint
}
