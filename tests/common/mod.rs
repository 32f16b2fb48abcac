//! Shared harness for the interception integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use pipetap::host::local::{LocalConnection, LocalListener, LocalServer};
use pipetap::host::{Connection, ConnectionRef};
use pipetap::pipeline::{Stage, StageCall, StageContext, StageRole, WriteAck};
use pipetap::{Message, PipelineError};

pub const ANCHOR: &str = "packet_handler";

/// Every string read by a core stage, tagged with the connection id.
#[derive(Default)]
pub struct Seen(Mutex<Vec<(String, String)>>);

impl Seen {
    pub fn push(&self, conn: &str, line: String) {
        self.0.lock().push((conn.to_string(), line));
    }

    /// Lines read on one connection, in order.
    pub fn lines(&self, conn: &Arc<LocalConnection>) -> Vec<String> {
        let id = conn.id().to_string();
        self.0
            .lock()
            .iter()
            .filter(|(c, _)| *c == id)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Core stage: records each string it reads and, with `reply`, writes back
/// `"re:<line>"`.
pub struct RecordingCore {
    seen: Arc<Seen>,
    reply: bool,
}

impl Stage for RecordingCore {
    fn role(&self) -> StageRole {
        StageRole::Inbound
    }

    fn on_call(&self, _ctx: &dyn StageContext, _call: StageCall) -> Result<(), PipelineError> {
        Ok(())
    }

    fn on_read(&self, ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
        let Ok(line) = msg.downcast::<String>() else {
            return Ok(());
        };
        let conn = ctx
            .connection()
            .map(|c| c.id().to_string())
            .unwrap_or_default();
        self.seen.push(&conn, line.clone());
        if self.reply {
            ctx.write(Message::new(format!("re:{line}")), WriteAck::detached())?;
        }
        Ok(())
    }
}

pub struct Harness {
    pub server: LocalServer,
    pub listener: Arc<LocalListener>,
    pub seen: Arc<Seen>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_reply(false)
    }

    pub fn with_reply(reply: bool) -> Self {
        let seen = Arc::new(Seen::default());
        let core_seen = seen.clone();
        let server = LocalServer::new(ANCHOR, move |_: &ConnectionRef| -> Arc<dyn Stage> {
            Arc::new(RecordingCore {
                seen: core_seen.clone(),
                reply,
            })
        });
        let listener = server.listen("127.0.0.1:25565".parse().unwrap());
        Self {
            server,
            listener,
            seen,
        }
    }

    /// Accept a connection and wait until it is fully wired.
    pub async fn accept(&self, remote: &str) -> Arc<LocalConnection> {
        let remote: SocketAddr = remote.parse().unwrap();
        let conn = self.server.accept(&self.listener, remote).unwrap();
        conn.idle().await;
        conn
    }

    /// Wait until every connection's executor has drained.
    pub async fn settle(&self) {
        for conn in self.server.connections() {
            conn.idle().await;
        }
    }
}

pub fn line(text: &str) -> Message {
    Message::new(text.to_string())
}

pub async fn send_line(conn: &Arc<LocalConnection>, text: &str) {
    conn.receive(line(text)).unwrap();
    conn.idle().await;
}

/// Next string that reached the transport, if one arrives in time.
pub async fn next_out(outbox: &mut UnboundedReceiver<Message>) -> Option<String> {
    let msg = tokio::time::timeout(Duration::from_secs(2), outbox.recv())
        .await
        .ok()??;
    msg.downcast::<String>().ok()
}

/// Pending strings in the outbox, without waiting.
pub fn drain_out(outbox: &mut UnboundedReceiver<Message>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(msg) = outbox.try_recv() {
        if let Ok(text) = msg.downcast::<String>() {
            out.push(text);
        }
    }
    out
}
