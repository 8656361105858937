//! End-to-end tests: a real `EndpointServer` driven by a tungstenite client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use parking_lot::Mutex;
use tidewire_core::{
    Arguments, EndpointClass, EndpointDescriptor, IdleKind, InstanceProvider, Lifecycle,
    MethodDecl, ParamDecl, ProviderError, RegistrationError,
};
use tidewire_server::{EndpointRegistry, EndpointServer};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Chat {
    opens: AtomicUsize,
    closes: AtomicUsize,
    paths: Mutex<Vec<String>>,
    protocols: Mutex<Vec<Option<String>>>,
    events: Mutex<Vec<IdleKind>>,
    errors: Mutex<Vec<String>>,
}

fn chat_class() -> EndpointClass<Chat> {
    EndpointClass::new("Chat")
        .method(
            MethodDecl::new("on_open", |chat: &Chat, args: &mut Arguments| {
                chat.paths.lock().push(args.text(1)?.to_owned());
                chat.protocols
                    .lock()
                    .push(args.optional_text(2)?.map(str::to_owned));
                let _ = chat.opens.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on(Lifecycle::Open)
            .param(ParamDecl::session("session"))
            .param(ParamDecl::path("path"))
            .param(ParamDecl::subprotocol("protocol")),
        )
        .method(
            MethodDecl::new("on_message", |_: &Chat, args: &mut Arguments| {
                let reply = format!("echo:{}", args.text(1)?);
                let _ = args.session(0)?.send_text(reply);
                Ok(())
            })
            .on(Lifecycle::Message)
            .param(ParamDecl::session("session"))
            .param(ParamDecl::text("message")),
        )
        .method(
            MethodDecl::new("on_binary", |_: &Chat, args: &mut Arguments| {
                let data = args.bytes(1)?.clone();
                let _ = args.session(0)?.send_binary(data);
                Ok(())
            })
            .on(Lifecycle::Binary)
            .param(ParamDecl::session("session"))
            .param(ParamDecl::bytes("data")),
        )
        .method(
            MethodDecl::new("on_event", |chat: &Chat, args: &mut Arguments| {
                chat.events.lock().push(args.event(0)?.kind);
                Ok(())
            })
            .on(Lifecycle::Event)
            .param(ParamDecl::event("event")),
        )
        .method(
            MethodDecl::new("on_close", |chat: &Chat, _: &mut Arguments| {
                let _ = chat.closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on(Lifecycle::Close),
        )
        .method(
            MethodDecl::new("on_error", |chat: &Chat, args: &mut Arguments| {
                chat.errors.lock().push(args.error(0)?.to_string());
                Ok(())
            })
            .on(Lifecycle::Error)
            .param(ParamDecl::error("cause")),
        )
}

struct Fixture {
    server: EndpointServer<Chat>,
    chat: Arc<Chat>,
    created: Arc<AtomicUsize>,
    addr: SocketAddr,
}

impl Fixture {
    fn start(tweak: impl FnOnce(&mut EndpointDescriptor)) -> Self {
        let mut descriptor = EndpointDescriptor {
            io_threads: 2,
            path: "/chat".into(),
            all_idle_secs: 0,
            ..EndpointDescriptor::new("127.0.0.1", 0)
        };
        tweak(&mut descriptor);

        let chat = Arc::new(Chat::default());
        let created = Arc::new(AtomicUsize::new(0));
        let (shared, count) = (Arc::clone(&chat), Arc::clone(&created));
        let provider: Arc<dyn InstanceProvider<Chat>> =
            Arc::new(move || -> Result<Arc<Chat>, ProviderError> {
                let _ = count.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::clone(&shared))
            });

        let server = EndpointServer::new(&chat_class(), descriptor, provider).unwrap();
        let addr = server.open().unwrap();
        Self {
            server,
            chat,
            created,
            addr,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    async fn connect(&self) -> Client {
        let (client, _) = connect_async(self.url("/chat")).await.unwrap();
        client
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_message(client: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("no frame within 5s")
        .expect("stream ended")
        .expect("read failed")
}

#[tokio::test]
async fn text_and_binary_round_trip() {
    let fx = Fixture::start(|_| {});
    let mut client = fx.connect().await;
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;

    client.send(Message::text("hello")).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::text("echo:hello"));

    client
        .send(Message::binary(vec![1_u8, 2, 3]))
        .await
        .unwrap();
    assert_eq!(next_message(&mut client).await, Message::binary(vec![1_u8, 2, 3]));

    assert_eq!(fx.chat.paths.lock().as_slice(), ["/chat"]);
    assert_eq!(fx.server.manager().live_connections(), 1);
}

#[tokio::test]
async fn instance_created_once_per_connection() {
    let fx = Fixture::start(|_| {});
    let mut client = fx.connect().await;
    for i in 0..5 {
        client.send(Message::text(format!("m{i}"))).await.unwrap();
        let _ = next_message(&mut client).await;
    }
    assert_eq!(fx.created.load(Ordering::SeqCst), 1);

    let _second = fx.connect().await;
    eventually("second open", || fx.chat.opens.load(Ordering::SeqCst) == 2).await;
    assert_eq!(fx.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_close_fires_close_once() {
    let fx = Fixture::start(|_| {});
    let mut client = fx.connect().await;
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;

    client.close(None).await.unwrap();
    eventually("close", || fx.chat.closes.load(Ordering::SeqCst) == 1).await;
    eventually("registry empty", || fx.server.manager().live_connections() == 0).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.chat.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wrong_path_is_rejected_with_404() {
    let fx = Fixture::start(|_| {});
    let err = connect_async(fx.url("/elsewhere")).await.unwrap_err();
    assert_matches!(err, WsError::Http(response) if response.status() == 404);

    eventually("registry empty", || fx.server.manager().live_connections() == 0).await;
    assert_eq!(fx.chat.opens.load(Ordering::SeqCst), 0);
    assert_eq!(fx.chat.closes.load(Ordering::SeqCst), 0);
    assert_eq!(fx.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn query_string_is_kept_in_path() {
    let fx = Fixture::start(|_| {});
    let (_client, _) = connect_async(fx.url("/chat?room=7")).await.unwrap();
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;
    assert_eq!(fx.chat.paths.lock().as_slice(), ["/chat?room=7"]);
}

#[tokio::test]
async fn connections_over_the_ceiling_are_closed_without_callbacks() {
    let fx = Fixture::start(|d| d.max_connections = 1);
    let _first = fx.connect().await;
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;

    let rejected = connect_async(fx.url("/chat")).await;
    assert!(rejected.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.chat.opens.load(Ordering::SeqCst), 1);
    assert_eq!(fx.chat.closes.load(Ordering::SeqCst), 0);
    assert_eq!(fx.created.load(Ordering::SeqCst), 1);
    assert_eq!(fx.server.manager().live_connections(), 1);
}

#[tokio::test]
async fn quiet_connection_gets_one_all_idle_event() {
    let fx = Fixture::start(|d| d.all_idle_secs = 1);
    let _client = fx.connect().await;
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(fx.chat.events.lock().as_slice(), [IdleKind::AllIdle]);
}

#[tokio::test]
async fn subprotocol_is_negotiated() {
    let fx = Fixture::start(|d| d.subprotocols = vec!["v2.chat".into(), "v1.chat".into()]);

    let mut request = fx.url("/chat").into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("sec-websocket-protocol", HeaderValue::from_static("v1.chat"));
    let (_client, response) = connect_async(request).await.unwrap();

    assert_eq!(response.headers()["sec-websocket-protocol"], "v1.chat");
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;
    assert_eq!(
        fx.chat.protocols.lock().as_slice(),
        [Some("v1.chat".to_owned())]
    );
}

#[tokio::test]
async fn oversized_message_reaches_error_callback() {
    let fx = Fixture::start(|d| d.max_payload_bytes = 64);
    let mut client = fx.connect().await;
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;

    client.send(Message::text("x".repeat(256))).await.unwrap();
    eventually("error", || !fx.chat.errors.lock().is_empty()).await;
    eventually("close", || fx.chat.closes.load(Ordering::SeqCst) == 1).await;
    assert!(fx.chat.errors.lock()[0].starts_with("capacity"));
}

#[tokio::test]
async fn graceful_shutdown_closes_connections() {
    let fx = Fixture::start(|_| {});
    let mut client = fx.connect().await;
    eventually("open", || fx.chat.opens.load(Ordering::SeqCst) == 1).await;

    assert!(fx.server.shutdown(Duration::from_secs(5)).await);
    assert!(fx.server.is_closed());
    assert_eq!(fx.chat.closes.load(Ordering::SeqCst), 1);
    assert_eq!(fx.server.manager().live_connections(), 0);

    assert_matches!(next_message(&mut client).await, Message::Close(_));
    assert!(TcpStream::connect(fx.addr).await.is_err());
}

#[tokio::test]
async fn duplicate_address_fails_before_any_server_opens() {
    let provider = || -> Arc<dyn InstanceProvider<Chat>> {
        Arc::new(|| -> Result<Arc<Chat>, ProviderError> { Ok(Arc::new(Chat::default())) })
    };
    let descriptor = EndpointDescriptor::new("127.0.0.1", 47_311);

    let mut registry = EndpointRegistry::new();
    registry
        .register(&chat_class(), descriptor.clone(), provider())
        .unwrap();
    let err = registry
        .register(&chat_class(), descriptor, provider())
        .unwrap_err();

    assert_matches!(
        err.as_registration(),
        Some(RegistrationError::DuplicateAddress { .. })
    );
    assert!(registry.endpoints().iter().all(|e| e.local_addr().is_none()));
}
