//! Line-based TCP transport for the local host.
//!
//! Every line is one `String` message. A line of the form `/login <uuid>`
//! is consumed by the host's session layer: it logs the connection in under
//! that identity and joins it.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};

use crate::host::local::{LocalConnection, LocalListener, LocalServer};
use crate::host::{Connection, Identity};
use crate::pipeline::Message;

const LOGIN_PREFIX: &str = "/login ";

/// Accept connections on `listener` until `shutdown` fires.
///
/// `socket` is the host-side listening socket accepted connections are read
/// through; open it with [`LocalServer::listen`] before interception begins.
pub async fn serve(
    server: LocalServer,
    socket: Arc<LocalListener>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                };
                match server.accept(&socket, peer) {
                    Ok(conn) => {
                        tokio::spawn(drive(server.clone(), conn, stream));
                    }
                    Err(e) => {
                        tracing::error!(peer = %peer, error = %e, "Failed to wire TCP connection");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!(address = %local_addr, "Transport stopping");
                break;
            }
        }
    }
    Ok(())
}

async fn drive(server: LocalServer, conn: Arc<LocalConnection>, stream: TcpStream) {
    let Some(mut outbox) = conn.take_outbox() else {
        return;
    };
    let (mut sink, mut lines) = Framed::new(stream, LinesCodec::new()).split();

    let id = conn.id();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            let line = match msg.downcast::<String>() {
                Ok(line) => line,
                Err(other) => {
                    tracing::warn!(connection = %id, message = other.type_name(), "Cannot encode message");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                tracing::debug!(connection = %id, error = %e, "Write failed");
                break;
            }
        }
    });

    while let Some(frame) = lines.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(connection = %id, error = %e, "Read failed");
                break;
            }
        };
        if let Some(raw) = line.strip_prefix(LOGIN_PREFIX) {
            match raw.trim().parse::<Identity>() {
                Ok(identity) => {
                    server.login(identity, &conn);
                    server.join(identity);
                }
                Err(e) => tracing::warn!(connection = %id, error = %e, "Invalid login identity"),
            }
            continue;
        }
        if conn.receive(Message::new(line)).is_err() {
            break;
        }
    }

    server.disconnect(&conn);
    writer.abort();
}
