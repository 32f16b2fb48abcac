//! Interception over real sockets through the line transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};

use common::{line, Harness};
use pipetap::host::tcp;
use pipetap::{Identity, Interceptor, Message};

async fn next_line(framed: &mut Framed<TcpStream, LinesCodec>) -> String {
    tokio::time::timeout(Duration::from_secs(2), framed.next())
        .await
        .expect("timed out waiting for a reply")
        .expect("connection closed")
        .expect("invalid line")
}

#[tokio::test]
async fn lines_are_intercepted_both_ways() {
    let harness = Harness::with_reply(true);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let socket = harness.server.listen(addr);

    let tap = Interceptor::new("e2e", Arc::new(harness.server.clone())).unwrap();
    tap.set_inbound_handler(|_, msg| match msg.downcast::<String>() {
        Ok(text) if text == "ping" => Ok(Some(line("pong"))),
        Ok(text) => Ok(Some(Message::new(text))),
        Err(other) => Ok(Some(other)),
    });
    tap.set_outbound_handler(|handle, msg| {
        let Ok(identity) = handle.identity() else {
            return Ok(Some(msg));
        };
        match msg.downcast::<String>() {
            Ok(text) => Ok(Some(Message::new(format!("[{identity}] {text}")))),
            Err(other) => Ok(Some(other)),
        }
    });
    tap.begin();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let transport = tokio::spawn(tcp::serve(
        harness.server.clone(),
        socket,
        listener,
        shutdown_rx,
    ));

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, LinesCodec::new());

    framed.send("ping").await.unwrap();
    assert_eq!(next_line(&mut framed).await, "re:pong");

    let identity = Identity::random();
    framed.send(format!("/login {identity}")).await.unwrap();
    framed.send("hello").await.unwrap();
    assert_eq!(next_line(&mut framed).await, format!("[{identity}] re:hello"));

    let handle = tap.connection(&identity).unwrap();
    assert_eq!(handle.send(line("direct")).wait().await, Ok(()));
    assert_eq!(next_line(&mut framed).await, format!("[{identity}] direct"));

    shutdown_tx.send(()).unwrap();
    transport.await.unwrap().unwrap();
}
