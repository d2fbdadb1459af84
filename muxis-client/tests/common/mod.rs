//! In-process RESP server for integration tests.
//!
//! Supports a small command set plus fault injection:
//! - `SLEEP ms`: reply `+OK` after a delay
//! - `HANG`: never reply
//! - `GARBAGE`: reply with an invalid type byte
//! - `PARTIAL`: reply with a truncated bulk string
//! - `EXTRA`: reply twice
//! - `KILL`: close the connection without replying
//!
//! Channels prefixed with `sticky:` stay registered after `UNSUBSCRIBE`, so
//! messages keep arriving after the confirmation. A `SUBSCRIBE` naming any
//! `denied:` channel, or an `UNSUBSCRIBE` naming any `locked:` channel, is
//! refused as a whole with a single `-NOPERM` error.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use muxis_client::{ConnectionConfig, Endpoint};
use muxis_protocol::{Decoder, Frame};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
}

#[derive(Default)]
struct Store {
    values: HashMap<String, Bytes>,
    versions: HashMap<String, u64>,
}

impl Store {
    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_default() += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

struct Subscriber {
    channels: HashSet<String>,
    patterns: HashSet<String>,
    resp3: bool,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct State {
    store: Mutex<Store>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    password: Option<String>,
    kill: broadcast::Sender<()>,
    accepted: AtomicU64,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    pub async fn start_with_password(password: &str) -> Self {
        Self::start_with(Some(password.to_string())).await
    }

    async fn start_with(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            store: Mutex::new(Store::default()),
            subscribers: Mutex::new(HashMap::new()),
            password,
            kill: broadcast::channel(4).0,
            accepted: AtomicU64::new(0),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(accept_state.clone(), stream, id));
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connection config with timeouts suited to tests.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new(Endpoint::from(self.addr))
            .with_connect_timeout(Duration::from_secs(2))
            .with_request_timeout(Duration::from_secs(5))
            .with_read_timeout(Duration::from_millis(300))
    }

    /// Closes every open connection.
    pub fn drop_connections(&self) {
        let _ = self.state.kill.send(());
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.state.store.lock().values.get(key).cloned()
    }
}

enum Flow {
    Continue,
    Close,
}

struct Session {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    resp3: bool,
    authed: bool,
    multi: Option<Vec<Vec<Bytes>>>,
    multi_error: bool,
    watched: Vec<(String, u64)>,
}

async fn serve(state: Arc<State>, stream: TcpStream, id: u64) {
    let (mut rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if wr.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut kill = state.kill.subscribe();
    let mut session = Session {
        id,
        tx,
        resp3: false,
        authed: state.password.is_none(),
        multi: None,
        multi_error: false,
        watched: Vec::new(),
    };
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 4096];
    let mut killed = false;

    'conn: loop {
        while let Ok(Some(frame)) = decoder.decode_frame() {
            let args = match frame {
                Frame::Array(items) => items
                    .into_iter()
                    .filter_map(|f| match f {
                        Frame::Bulk(b) => Some(b),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
                _ => break 'conn,
            };
            if args.is_empty() {
                break 'conn;
            }
            if let Flow::Close = session.handle(&state, args).await {
                killed = true;
                break 'conn;
            }
        }

        tokio::select! {
            read = rd.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => decoder.extend(&buf[..n]),
            },
            _ = kill.recv() => {
                killed = true;
                break;
            }
        }
    }

    state.subscribers.lock().remove(&id);
    drop(session);
    if killed {
        writer.abort();
    } else {
        let _ = writer.await;
    }
}

fn text(b: &Bytes) -> String {
    String::from_utf8_lossy(b).into_owned()
}

fn ok() -> Frame {
    Frame::Simple("OK".into())
}

fn err(msg: &str) -> Frame {
    Frame::Error(msg.to_string())
}

impl Session {
    fn reply(&self, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let _ = self.tx.send(buf.freeze());
    }

    fn raw(&self, bytes: &'static [u8]) {
        let _ = self.tx.send(Bytes::from_static(bytes));
    }

    fn pubsub_frame(&self, items: Vec<Frame>) -> Frame {
        if self.resp3 {
            Frame::Push(items)
        } else {
            Frame::Array(items)
        }
    }

    async fn handle(&mut self, state: &State, args: Vec<Bytes>) -> Flow {
        let name = text(&args[0]).to_uppercase();

        if !self.authed && name != "AUTH" && name != "HELLO" {
            self.reply(err("NOAUTH Authentication required."));
            return Flow::Continue;
        }

        match name.as_str() {
            "SLEEP" => {
                let ms = args.get(1).map(text).and_then(|s| s.parse().ok()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.reply(ok());
                return Flow::Continue;
            }
            "HANG" => return Flow::Continue,
            "GARBAGE" => {
                self.raw(b"?garbage\r\n");
                return Flow::Continue;
            }
            "PARTIAL" => {
                self.raw(b"$10\r\nabc");
                return Flow::Continue;
            }
            "EXTRA" => {
                self.reply(ok());
                self.reply(ok());
                return Flow::Continue;
            }
            "KILL" => return Flow::Close,
            _ => {}
        }

        if self.multi.is_some() && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH")
        {
            if is_data_command(&name) {
                if let Some(queued) = self.multi.as_mut() {
                    queued.push(args);
                }
                self.reply(Frame::Simple("QUEUED".into()));
            } else {
                self.multi_error = true;
                self.reply(err(&format!("ERR unknown command '{}'", name)));
            }
            return Flow::Continue;
        }

        let frame = match name.as_str() {
            "HELLO" => self.hello(state, &args),
            "AUTH" => self.auth(state, &args),
            "CLIENT" | "SELECT" => ok(),
            "MULTI" => {
                if self.multi.is_some() {
                    err("ERR MULTI calls can not be nested")
                } else {
                    self.multi = Some(Vec::new());
                    ok()
                }
            }
            "EXEC" => self.exec(state),
            "DISCARD" => {
                if self.multi.take().is_some() {
                    self.multi_error = false;
                    self.watched.clear();
                    ok()
                } else {
                    err("ERR DISCARD without MULTI")
                }
            }
            "WATCH" => {
                if self.multi.is_some() {
                    err("ERR WATCH inside MULTI is not allowed")
                } else {
                    let store = state.store.lock();
                    for key in &args[1..] {
                        let key = text(key);
                        let version = store.version(&key);
                        self.watched.push((key, version));
                    }
                    ok()
                }
            }
            "UNWATCH" => {
                self.watched.clear();
                ok()
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                self.subscribe(state, &name, &args[1..]);
                return Flow::Continue;
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                self.unsubscribe(state, &name, &args[1..]);
                return Flow::Continue;
            }
            "PUBLISH" if args.len() == 3 => Frame::Integer(publish(state, &text(&args[1]), &args[2])),
            _ if is_data_command(&name) => execute(&mut state.store.lock(), &name, &args),
            _ => err(&format!("ERR unknown command '{}'", name)),
        };
        self.reply(frame);
        Flow::Continue
    }

    fn hello(&mut self, state: &State, args: &[Bytes]) -> Frame {
        let version = args.get(1).map(text).unwrap_or_else(|| "2".into());
        if let Some(pos) = args.iter().position(|a| text(a).eq_ignore_ascii_case("AUTH")) {
            let password = args.get(pos + 2).map(text);
            if state.password.is_some() && password != state.password {
                return err("WRONGPASS invalid username-password pair or user is disabled.");
            }
            self.authed = true;
        }
        if !self.authed {
            return err("NOAUTH HELLO must be called with the client already authenticated");
        }
        self.resp3 = version == "3";
        Frame::Map(vec![
            (Frame::bulk("server"), Frame::bulk("muxis-mock")),
            (Frame::bulk("proto"), Frame::Integer(if self.resp3 { 3 } else { 2 })),
        ])
    }

    fn auth(&mut self, state: &State, args: &[Bytes]) -> Frame {
        let given = args.last().map(text);
        match state.password {
            None => err("ERR AUTH called without any password configured"),
            Some(ref password) if given.as_ref() == Some(password) => {
                self.authed = true;
                ok()
            }
            Some(_) => err("WRONGPASS invalid username-password pair or user is disabled."),
        }
    }

    fn exec(&mut self, state: &State) -> Frame {
        let queued = match self.multi.take() {
            Some(queued) => queued,
            None => return err("ERR EXEC without MULTI"),
        };
        let watched = std::mem::take(&mut self.watched);
        if std::mem::take(&mut self.multi_error) {
            return err("EXECABORT Transaction discarded because of previous errors.");
        }

        let mut store = state.store.lock();
        if watched.iter().any(|(key, v)| store.version(key) != *v) {
            return Frame::Null;
        }
        Frame::Array(
            queued
                .iter()
                .map(|args| execute(&mut store, &text(&args[0]).to_uppercase(), args))
                .collect(),
        )
    }

    fn subscribe(&mut self, state: &State, name: &str, names: &[Bytes]) {
        let pattern = name == "PSUBSCRIBE";
        let kind = if pattern { "psubscribe" } else { "subscribe" };
        if let Some(refused) = names.iter().map(text).find(|n| n.starts_with("denied:")) {
            self.reply(no_permission(&refused));
            return;
        }
        let mut subscribers = state.subscribers.lock();
        let entry = subscribers.entry(self.id).or_insert_with(|| Subscriber {
            channels: HashSet::new(),
            patterns: HashSet::new(),
            resp3: self.resp3,
            tx: self.tx.clone(),
        });
        for n in names {
            if pattern {
                entry.patterns.insert(text(n));
            } else {
                entry.channels.insert(text(n));
            }
            let count = (entry.channels.len() + entry.patterns.len()) as i64;
            self.reply(self.pubsub_frame(vec![
                Frame::bulk(kind),
                Frame::Bulk(n.clone()),
                Frame::Integer(count),
            ]));
        }
    }

    fn unsubscribe(&mut self, state: &State, name: &str, names: &[Bytes]) {
        let pattern = name == "PUNSUBSCRIBE";
        let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
        if let Some(refused) = names.iter().map(text).find(|n| n.starts_with("locked:")) {
            self.reply(no_permission(&refused));
            return;
        }
        let mut subscribers = state.subscribers.lock();
        for n in names {
            let channel = text(n);
            let count = match subscribers.get_mut(&self.id) {
                Some(entry) => {
                    if !channel.starts_with("sticky:") {
                        if pattern {
                            entry.patterns.remove(&channel);
                        } else {
                            entry.channels.remove(&channel);
                        }
                    }
                    entry
                        .channels
                        .iter()
                        .chain(entry.patterns.iter())
                        .filter(|c| !c.starts_with("sticky:"))
                        .count() as i64
                }
                None => 0,
            };
            self.reply(self.pubsub_frame(vec![
                Frame::bulk(kind),
                Frame::Bulk(n.clone()),
                Frame::Integer(count),
            ]));
        }
    }
}

fn no_permission(channel: &str) -> Frame {
    err(&format!(
        "NOPERM User default has no permissions to access the '{}' channel",
        channel
    ))
}

fn is_data_command(name: &str) -> bool {
    matches!(name, "GET" | "SET" | "INCR" | "DEL" | "PING" | "ECHO")
}

fn execute(store: &mut Store, name: &str, args: &[Bytes]) -> Frame {
    match (name, args.len()) {
        ("PING", 1) => Frame::Simple("PONG".into()),
        ("ECHO", 2) => Frame::Bulk(args[1].clone()),
        ("GET", 2) => match store.values.get(&text(&args[1])) {
            Some(v) => Frame::Bulk(v.clone()),
            None => Frame::Null,
        },
        ("SET", n) if n >= 3 => {
            let key = text(&args[1]);
            store.values.insert(key.clone(), args[2].clone());
            store.bump(&key);
            ok()
        }
        ("INCR", 2) => {
            let key = text(&args[1]);
            let current = match store.values.get(&key) {
                Some(v) => match text(v).parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => return err("ERR value is not an integer or out of range"),
                },
                None => 0,
            };
            store
                .values
                .insert(key.clone(), Bytes::from((current + 1).to_string()));
            store.bump(&key);
            Frame::Integer(current + 1)
        }
        ("DEL", n) if n >= 2 => {
            let mut removed = 0;
            for key in &args[1..] {
                let key = text(key);
                if store.values.remove(&key).is_some() {
                    store.bump(&key);
                    removed += 1;
                }
            }
            Frame::Integer(removed)
        }
        _ => err(&format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_lowercase()
        )),
    }
}

fn publish(state: &State, channel: &str, payload: &Bytes) -> i64 {
    let subscribers = state.subscribers.lock();
    let mut delivered = 0;
    for sub in subscribers.values() {
        let wrap = |items: Vec<Frame>| {
            if sub.resp3 {
                Frame::Push(items)
            } else {
                Frame::Array(items)
            }
        };
        if sub.channels.contains(channel) {
            let frame = wrap(vec![
                Frame::bulk("message"),
                Frame::bulk(channel.to_string()),
                Frame::Bulk(payload.clone()),
            ]);
            let _ = sub.tx.send(frame.to_bytes());
            delivered += 1;
        }
        for pattern in &sub.patterns {
            if glob(pattern.as_bytes(), channel.as_bytes()) {
                let frame = wrap(vec![
                    Frame::bulk("pmessage"),
                    Frame::bulk(pattern.clone()),
                    Frame::bulk(channel.to_string()),
                    Frame::Bulk(payload.clone()),
                ]);
                let _ = sub.tx.send(frame.to_bytes());
                delivered += 1;
            }
        }
    }
    delivered
}

fn glob(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob(&pattern[1..], text) || (!text.is_empty() && glob(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
