//! Endpoint pairs over real framing: duplex pipes and TCP sockets.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use tether_session::{Endpoint, EndpointConfig, EndpointState, InvokeFault, SubjectStub};
use tether_stream::{connect, establish, ConnectError, Listener};
use tether_wire::{encode_value, GrainId, PayloadReader};

struct AdderStub {
    marker: Arc<()>,
}

impl AdderStub {
    fn new() -> Arc<dyn SubjectStub> {
        Arc::new(Self {
            marker: Arc::new(()),
        })
    }
}

impl SubjectStub for AdderStub {
    fn interface_name(&self) -> &str {
        "IAdder"
    }

    fn subject(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.marker) as Arc<dyn Any + Send + Sync>
    }

    fn invoke<'a>(
        &'a self,
        method: &'a str,
        mut args: PayloadReader<'a>,
    ) -> BoxFuture<'a, Result<Vec<u8>, InvokeFault>> {
        Box::pin(async move {
            match method {
                "Add" => {
                    let (a, b) = <(i32, i32) as tether_wire::WireValue>::parse(&mut args)
                        .map_err(InvokeFault::BadArguments)?;
                    Ok(encode_value(&(a + b)))
                }
                _ => Err(InvokeFault::NoSuchMethod),
            }
        })
    }
}

#[tokio::test]
async fn duplex_pair_handshakes_and_calls() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let a = Endpoint::new(EndpointConfig::default().with_name("initiator"));
    let b = Endpoint::new(EndpointConfig::default().with_name("acceptor"));

    let b2 = b.clone();
    let acceptor = tokio::spawn(async move { establish(&b2, right).await });
    establish(&a, left).await.unwrap();
    acceptor.await.unwrap().unwrap();

    assert_eq!(a.state(), EndpointState::Connected);
    assert_eq!(a.peer_name().as_deref(), Some("acceptor"));
    assert_eq!(b.peer_name().as_deref(), Some("initiator"));

    b.registry()
        .create_servant(GrainId::new(100), AdderStub::new())
        .unwrap();
    let proxy = a.registry().get_or_create_proxy(GrainId::new(100), "IAdder");
    let sum: i32 = proxy.call("Add", &(2i32, 3i32)).await.unwrap();
    assert_eq!(sum, 5);

    a.disconnect().await;
    let mut states = b.state_changes();
    states
        .wait_for(|s| *s == EndpointState::Disconnected)
        .await
        .unwrap();
}

#[tokio::test]
async fn tcp_pair_end_to_end() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Endpoint::new(EndpointConfig::default().with_name("server"));
    server
        .registry()
        .create_servant(GrainId::new(100), AdderStub::new())
        .unwrap();
    let server2 = server.clone();
    let accept = tokio::spawn(async move { listener.accept(&server2).await });

    let client = Endpoint::new(EndpointConfig::default().with_name("client"));
    connect(&client, addr, Duration::from_secs(1)).await.unwrap();
    accept.await.unwrap().unwrap();

    let proxy = client
        .registry()
        .get_or_create_proxy(GrainId::new(100), "IAdder");
    let sum: i32 = proxy.call("Add", &(40i32, 2i32)).await.unwrap();
    assert_eq!(sum, 42);

    client.ping().await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn bad_magic_is_a_handshake_failure() {
    let (left, mut right) = tokio::io::duplex(1024);
    let a = Endpoint::new(EndpointConfig::default());

    let feeder = tokio::spawn(async move {
        right.write_all(&[0xffu8; 64]).await.unwrap();
        right
    });

    let err = establish(&a, left).await.unwrap_err();
    assert!(err.is_handshake_failure());
    assert!(matches!(
        err,
        ConnectError::Handshake(tether_wire::HandshakeError::BadMagic)
    ));
    assert_eq!(a.state(), EndpointState::Disconnected);
    drop(feeder);
}

#[tokio::test]
async fn wrong_version_is_a_handshake_failure() {
    let (left, mut right) = tokio::io::duplex(1024);
    let a = Endpoint::new(EndpointConfig::default());

    let feeder = tokio::spawn(async move {
        let mut block = tether_wire::Handshake::new("peer").encode();
        block[16] = 0x2a; // version word
        right.write_all(&block).await.unwrap();
        right
    });

    let err = establish(&a, left).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Handshake(tether_wire::HandshakeError::UnsupportedVersion(0x2a))
    ));
    drop(feeder);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_the_handshake() {
    let (left, _right) = tokio::io::duplex(1024);
    let mut config = EndpointConfig::default();
    config.handshake_timeout = Duration::from_millis(200);
    let a = Endpoint::new(config);

    let err = establish(&a, left).await.unwrap_err();
    assert!(matches!(err, ConnectError::HandshakeTimeout));
    assert_eq!(a.state(), EndpointState::Disconnected);
}

#[tokio::test]
async fn connect_refused_leaves_the_endpoint_disconnected() {
    // Bind then drop to get a port with (very likely) nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Endpoint::new(EndpointConfig::default());
    let err = connect(&client, addr, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Io(_) | ConnectError::ConnectTimeout
    ));
    assert_eq!(client.state(), EndpointState::Disconnected);
}
