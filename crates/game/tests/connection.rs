use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata::net::DisconnectReason;
use strata::reflect::lerp;
use strata::{
    BitBuffer, Connection, ConnectionState, Dispatcher, HistoryConfig, Message, ReplicationHistory,
    Replicator, SceneId, Server, TransportConfig, TransportError, TransportEvent, TypeRegistry,
    World,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

#[derive(Debug, Clone, PartialEq)]
struct Chat {
    index: u32,
    text: String,
}

impl Message for Chat {
    fn serialize(&self, buffer: &BitBuffer) {
        buffer.write(&self.index);
        buffer.write(&self.text);
    }

    fn deserialize(buffer: &BitBuffer) -> Option<Self> {
        Some(Chat {
            index: buffer.read()?,
            text: buffer.read()?,
        })
    }
}

/// Not retransmitted, so it must fit a single datagram.
#[derive(Debug, Clone, PartialEq)]
struct Blob {
    bytes: Vec<u8>,
}

impl Message for Blob {
    fn serialize(&self, buffer: &BitBuffer) {
        buffer.write(&(self.bytes.len() as u16));
        buffer.write_bytes(&self.bytes, self.bytes.len() * 8);
    }

    fn deserialize(buffer: &BitBuffer) -> Option<Self> {
        let len = buffer.read::<u16>()? as usize;
        Some(Blob {
            bytes: buffer.read_bytes(len * 8)?,
        })
    }

    fn should_retransmit(&self) -> bool {
        false
    }
}

type Inbox = Arc<Mutex<Vec<Chat>>>;

fn chat_dispatcher() -> (Arc<Dispatcher>, Inbox) {
    let inbox: Inbox = Arc::default();
    let dispatcher = Arc::new(Dispatcher::new());
    let sink = Arc::clone(&inbox);
    dispatcher.on::<Chat, _>(move |chat, _peer, _direction| sink.lock().push(chat));
    (dispatcher, inbox)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

struct Pair {
    server: Server,
    client: Connection,
    server_inbox: Inbox,
    client_inbox: Inbox,
}

impl Pair {
    fn connect() -> Self {
        let port = next_port();
        let (server_dispatcher, server_inbox) = chat_dispatcher();
        let (client_dispatcher, client_inbox) = chat_dispatcher();

        let server =
            Server::bind(("127.0.0.1", port), server_dispatcher, TransportConfig::default())
                .unwrap();
        let client = Connection::connect(
            &format!("127.0.0.1:{port}"),
            client_dispatcher,
            TransportConfig::default(),
        )
        .unwrap();

        assert!(client.wait_connected(Duration::from_secs(2)));
        assert!(wait_until(Duration::from_secs(2), || server.connected_count() == 1));
        Pair {
            server,
            client,
            server_inbox,
            client_inbox,
        }
    }

    fn client_addr(&self) -> SocketAddr {
        let port = self.client.local_addr().port();
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn tick(&self) {
        self.server.tick();
        self.client.tick();
    }
}

fn chats(count: u32) -> Vec<Chat> {
    (0..count)
        .map(|index| Chat {
            index,
            text: format!("message {index}"),
        })
        .collect()
}

#[test]
fn test_handshake_connects_both_sides() {
    let pair = Pair::connect();

    assert_eq!(pair.client.state(), ConnectionState::Connected);
    let events = pair.server.events();
    assert_eq!(events, vec![TransportEvent::Connected(pair.client_addr())]);
    assert_eq!(
        pair.client.events(),
        vec![TransportEvent::Connected(pair.client.remote_addr())]
    );
}

#[test]
fn test_messages_arrive_in_order() {
    let pair = Pair::connect();
    let sent = chats(200);
    for chat in &sent {
        pair.client.send(chat).unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || pair.server_inbox.lock().len() == sent.len()));
    assert_eq!(*pair.server_inbox.lock(), sent);
}

#[test]
fn test_large_message_is_fragmented_and_reassembled() {
    let pair = Pair::connect();
    let chat = Chat {
        index: 7,
        text: "x".repeat(5000),
    };
    let before = pair.server.peer(&pair.client_addr()).unwrap().next_sequence();
    pair.server.send_to(&pair.client_addr(), &chat).unwrap();
    let after = pair.server.peer(&pair.client_addr()).unwrap().next_sequence();
    assert!(after.wrapping_sub(before) >= 4);

    assert!(wait_until(Duration::from_secs(2), || !pair.client_inbox.lock().is_empty()));
    assert_eq!(pair.client_inbox.lock()[0], chat);
}

#[test]
fn test_oversized_unreliable_message_is_rejected() {
    let pair = Pair::connect();
    let blob = Blob {
        bytes: vec![0xab; 2000],
    };
    let result = pair.client.send(&blob);
    assert!(matches!(result, Err(TransportError::MessageTooLarge { .. })));

    // The connection keeps working afterwards.
    pair.client.send(&chats(1)[0]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || pair.server_inbox.lock().len() == 1));
}

#[test]
fn test_simulated_loss_is_recovered_by_nack() {
    let pair = Pair::connect();
    pair.client.peer().set_drop_probability(0.3);

    let sent = chats(100);
    for chat in &sent {
        pair.server.broadcast(chat);
    }

    let delivered = wait_until(Duration::from_secs(10), || {
        pair.tick();
        pair.client_inbox.lock().len() == sent.len()
    });
    pair.client.peer().set_drop_probability(0.0);

    assert!(delivered);
    assert_eq!(*pair.client_inbox.lock(), sent);
    let stats = pair.client.stats();
    assert!(stats.packets_lost > 0);
    let server_stats = pair.server.peer(&pair.client_addr()).unwrap().stats();
    assert!(server_stats.packets_resent > 0);
}

#[test]
fn test_unregistered_message_is_dropped_without_breaking_stream() {
    let pair = Pair::connect();
    pair.client.send(&Blob { bytes: vec![1, 2, 3] }).unwrap();
    pair.client.send(&chats(1)[0]).unwrap();

    assert!(wait_until(Duration::from_secs(2), || pair.server_inbox.lock().len() == 1));
    assert_eq!(pair.server_inbox.lock()[0].index, 0);
}

#[test]
fn test_disconnect_is_seen_by_server() {
    let pair = Pair::connect();
    let client_addr = pair.client_addr();
    pair.server.events();

    pair.client.disconnect();
    assert_eq!(pair.client.state(), ConnectionState::Disconnected);
    assert!(matches!(pair.client.send(&chats(1)[0]), Err(TransportError::NotConnected)));

    assert!(wait_until(Duration::from_secs(2), || pair.server.peer(&client_addr).is_none()));
    assert_eq!(
        pair.server.events(),
        vec![TransportEvent::Disconnected {
            addr: client_addr,
            reason: DisconnectReason::Remote,
        }]
    );
}

#[test]
fn test_kick_disconnects_client() {
    let pair = Pair::connect();
    let client_addr = pair.client_addr();

    assert!(pair.server.kick(&client_addr));
    assert!(!pair.server.kick(&client_addr));
    assert!(wait_until(Duration::from_secs(2), || {
        pair.client.state() == ConnectionState::Disconnected
    }));
}

#[test]
fn test_ping_updates_round_trip_time() {
    let pair = Pair::connect();
    assert!(wait_until(Duration::from_secs(2), || {
        pair.tick();
        pair.client.stats().rtt_ms > 0.0
    }));
    assert!(!pair.client.peer().bandwidth().is_empty());
}

#[test]
fn test_datagrams_from_strangers_are_ignored() {
    let port = next_port();
    let (dispatcher, _) = chat_dispatcher();
    let server = Server::bind(("127.0.0.1", port), dispatcher, TransportConfig::default()).unwrap();

    let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    stranger
        .send_to(&[0, 0, 0, 1, 0, 32, 1, 2, 3, 4], ("127.0.0.1", port))
        .unwrap();
    thread::sleep(Duration::from_millis(50));

    assert!(server.peers().is_empty());
    assert!(server.events().is_empty());
}

#[derive(Debug, Default)]
struct Lamp {
    brightness: f32,
}

strata::impl_replicable!(Lamp);

fn lamp_history() -> Arc<ReplicationHistory> {
    let mut registry = TypeRegistry::new();
    registry.register_replicable::<Lamp>();
    strata::reflect_field!(registry, Lamp, brightness);
    registry
        .set_interpolator::<Lamp>("brightness", lerp::<f32>())
        .unwrap();
    Arc::new(ReplicationHistory::new(Arc::new(registry), HistoryConfig::default()))
}

#[test]
fn test_history_replicates_to_client() {
    const SCENE: SceneId = SceneId(3);
    let port = next_port();

    let source = Arc::new(Replicator::new(lamp_history()));
    let server = Server::bind(
        ("127.0.0.1", port),
        Arc::new(Dispatcher::new()),
        TransportConfig::default(),
    )
    .unwrap();

    let replica = Arc::new(Replicator::new(lamp_history()));
    let client_dispatcher = Arc::new(Dispatcher::new());
    replica.install(&client_dispatcher);
    let client = Connection::connect(
        &format!("127.0.0.1:{port}"),
        client_dispatcher,
        TransportConfig::default(),
    )
    .unwrap();
    assert!(client.wait_connected(Duration::from_secs(2)));
    assert!(wait_until(Duration::from_secs(2), || server.connected_count() == 1));

    let world = World::new(SCENE);
    let id = world.add(Lamp::default());
    source.history().log(&world, 0);
    assert_eq!(source.sync_all(&server), 1);

    world.get_mut(id, |lamp: &mut Lamp| lamp.brightness = 1.0);
    source.history().log(&world, 100);
    assert_eq!(source.sync_all(&server), 1);
    assert_eq!(source.sync_all(&server), 0);

    let brightness = || {
        replica
            .history()
            .get_state(SCENE, 25, id, "brightness")
            .and_then(|value| value.read::<f32>())
    };
    assert!(wait_until(Duration::from_secs(2), || brightness() == Some(0.25)));

    let rebuilt = World::new(SCENE);
    replica.history().apply_state(&rebuilt, 100);
    assert_eq!(rebuilt.get(id, |lamp: &Lamp| lamp.brightness), Some(1.0));
}
