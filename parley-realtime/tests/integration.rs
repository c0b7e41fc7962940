//! Integration tests for presence and room broadcast over real WebSockets.
//!
//! These tests start a real server and connect real clients.

mod common;

use common::{assert_silent, connect, eventually, recv, send, start_test_server};
use parley_realtime::client::{ClientConfig, ConnectionManager, ConnectionState, ReconcileConfig, Timeline};
use parley_realtime::protocol::{ChatMessage, ClientEvent, RoomId, ServerEvent, TypingPayload, UserId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, hub) = start_test_server().await;
    let _ws = connect(port).await;
    eventually(|| {
        let hub = hub.clone();
        async move { hub.stats().await.active_connections == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_multi_tab_presence() {
    let (port, hub) = start_test_server().await;
    let mut watcher = connect(port).await;

    let mut tab1 = connect(port).await;
    send(&mut tab1, ClientEvent::Identify(UserId::from("C"))).await;
    assert_eq!(recv(&mut watcher).await, ServerEvent::UserOnline(UserId::from("C")));

    let mut tab2 = connect(port).await;
    send(&mut tab2, ClientEvent::Identify(UserId::from("C"))).await;
    eventually(|| {
        let hub = hub.clone();
        async move { hub.presence().connections_of(&UserId::from("C")).await.len() == 2 }
    })
    .await;

    // Closing one tab is invisible.
    tab1.close(None).await.unwrap();
    eventually(|| {
        let hub = hub.clone();
        async move { hub.presence().connections_of(&UserId::from("C")).await.len() == 1 }
    })
    .await;
    assert_silent(&mut watcher, 200).await;

    // Closing the last tab goes offline exactly once.
    tab2.close(None).await.unwrap();
    assert_eq!(recv(&mut watcher).await, ServerEvent::UserOffline(UserId::from("C")));
    assert_silent(&mut watcher, 200).await;

    // Coming back goes online exactly once.
    let mut tab3 = connect(port).await;
    send(&mut tab3, ClientEvent::Identify(UserId::from("C"))).await;
    assert_eq!(recv(&mut watcher).await, ServerEvent::UserOnline(UserId::from("C")));
    assert_silent(&mut watcher, 200).await;
}

#[tokio::test]
async fn test_peer_broadcast_excludes_origin_and_collapses() {
    let (port, hub) = start_test_server().await;
    let room = RoomId::from("r1");

    let mut a = connect(port).await;
    let mut b = connect(port).await;
    send(&mut a, ClientEvent::Identify(UserId::from("A"))).await;
    send(&mut b, ClientEvent::Identify(UserId::from("B"))).await;
    send(&mut a, ClientEvent::JoinRoom(room.clone())).await;
    send(&mut b, ClientEvent::JoinRoom(room.clone())).await;
    eventually(|| {
        let hub = hub.clone();
        let room = room.clone();
        async move { hub.rooms().members_of(&room).await.len() == 2 }
    })
    .await;
    // Drain presence announcements.
    while timeout(Duration::from_millis(100), recv(&mut a)).await.is_ok() {}
    while timeout(Duration::from_millis(100), recv(&mut b)).await.is_ok() {}

    let peer = ChatMessage::with_id("tmp_1", "r1", "A", "hi");
    send(&mut a, ClientEvent::SendMessage(peer)).await;
    let first = recv(&mut b).await;
    match &first {
        ServerEvent::ReceiveMessage(m) => assert_eq!(m.id.as_str(), "tmp_1"),
        other => panic!("Expected ReceiveMessage, got {other:?}"),
    }
    assert_silent(&mut a, 200).await;

    let count = hub
        .publish_persisted(ChatMessage::with_id("m_42", "r1", "A", "hi"))
        .await
        .unwrap();
    assert_eq!(count, 2);
    let second = recv(&mut b).await;
    match recv(&mut a).await {
        ServerEvent::ReceiveMessage(m) => assert_eq!(m.id.as_str(), "m_42"),
        other => panic!("Expected ReceiveMessage, got {other:?}"),
    }

    // B's view holds exactly one message, with the durable id.
    let mut timeline = Timeline::new(UserId::from("B"), ReconcileConfig::default());
    timeline.set_room(Some(room));
    let now = Instant::now();
    for event in [first, second] {
        if let ServerEvent::ReceiveMessage(m) = event {
            timeline.receive(m, now);
        }
    }
    assert_eq!(timeline.messages().len(), 1);
    assert_eq!(timeline.messages()[0].id.as_str(), "m_42");
}

#[tokio::test]
async fn test_typing_reaches_room() {
    let (port, hub) = start_test_server().await;
    let mut a = connect(port).await;
    let mut b = connect(port).await;
    send(&mut a, ClientEvent::JoinRoom(RoomId::from("r1"))).await;
    send(&mut b, ClientEvent::JoinRoom(RoomId::from("r1"))).await;
    send(&mut a, ClientEvent::Identify(UserId::from("A"))).await;
    eventually(|| {
        let hub = hub.clone();
        async move { hub.rooms().members_of(&RoomId::from("r1")).await.len() == 2 }
    })
    .await;
    while timeout(Duration::from_millis(100), recv(&mut b)).await.is_ok() {}

    send(
        &mut a,
        ClientEvent::Typing(TypingPayload {
            room_id: RoomId::from("r1"),
            user_id: UserId::from("spoofed"),
            user_name: Some("Alice".into()),
        }),
    )
    .await;
    match recv(&mut b).await {
        ServerEvent::UserTyping(p) => assert_eq!(p.user_id, UserId::from("A")),
        other => panic!("Expected UserTyping, got {other:?}"),
    }
}

#[tokio::test]
async fn test_online_users_rate_limited() {
    let (port, _hub) = start_test_server().await;
    let mut ws = connect(port).await;
    send(&mut ws, ClientEvent::Identify(UserId::from("A"))).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::UserOnline(UserId::from("A")));

    send(&mut ws, ClientEvent::GetOnlineUsers).await;
    send(&mut ws, ClientEvent::GetOnlineUsers).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::OnlineUsers(vec![UserId::from("A")]));
    assert_silent(&mut ws, 300).await;
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let (port, hub) = start_test_server().await;
    let mut ws = connect(port).await;
    use futures_util::SinkExt;
    ws.send(tokio_tungstenite::tungstenite::Message::Text("not json".into()))
        .await
        .unwrap();
    send(&mut ws, ClientEvent::Identify(UserId::from("A"))).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::UserOnline(UserId::from("A")));
    assert!(hub.presence().is_online(&UserId::from("A")).await);
}

#[tokio::test]
async fn test_connection_manager_identifies_and_rejoins() {
    let (port, hub) = start_test_server().await;
    let manager = ConnectionManager::new(ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        user_id: Some(UserId::from("A")),
        ..ClientConfig::default()
    });
    // Joined before connecting; replayed by the session handshake.
    manager.join_room(RoomId::from("r1")).await.unwrap();
    let mut events = manager.subscribe();

    manager.connect().await.unwrap();
    manager.wait_connected(Duration::from_secs(3)).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    eventually(|| {
        let hub = hub.clone();
        async move {
            hub.presence().is_online(&UserId::from("A")).await
                && hub.rooms().members_of(&RoomId::from("r1")).await.len() == 1
        }
    })
    .await;

    hub.publish_persisted(ChatMessage::with_id("m_1", "r1", "B", "hello"))
        .await
        .unwrap();
    let received = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(ServerEvent::ReceiveMessage(m)) => return m,
                Ok(_) => {}
                Err(e) => panic!("Event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("no message received");
    assert_eq!(received.id.as_str(), "m_1");

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    eventually(|| {
        let hub = hub.clone();
        async move { !hub.presence().is_online(&UserId::from("A")).await }
    })
    .await;
}

#[tokio::test]
async fn test_connection_manager_repeats_handshake_after_drop() {
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    // Bare WebSocket endpoint that records the handshake of each session
    // and drops the first one.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<(usize, ClientEvent)>();
    tokio::spawn(async move {
        for session in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut seen = 0;
            while seen < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event = ClientEvent::decode(text.as_str()).unwrap();
                        frames_tx.send((session, event)).unwrap();
                        seen += 1;
                    }
                    Some(Ok(_)) => {}
                    other => panic!("Session {session} ended early: {other:?}"),
                }
            }
            if session == 1 {
                // Hold the second session open until the client leaves.
                while let Some(Ok(_)) = ws.next().await {}
            }
        }
    });

    let manager = ConnectionManager::new(ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        user_id: Some(UserId::from("A")),
        reconnect_initial_ms: 50,
        ..ClientConfig::default()
    });
    manager.join_room(RoomId::from("r1")).await.unwrap();
    manager.connect().await.unwrap();

    let mut frames = Vec::new();
    while frames.len() < 4 {
        let frame = timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .expect("handshake frames not received")
            .expect("listener stopped");
        frames.push(frame);
    }
    let expected = |session| {
        vec![
            (session, ClientEvent::Identify(UserId::from("A"))),
            (session, ClientEvent::JoinRoom(RoomId::from("r1"))),
        ]
    };
    assert_eq!(frames[..2], expected(0)[..]);
    assert_eq!(frames[2..], expected(1)[..]);

    manager.wait_connected(Duration::from_secs(3)).await.unwrap();
    manager.disconnect().await;
}

#[tokio::test]
async fn test_rooms_joined_while_session_starts_are_not_lost() {
    let (port, hub) = start_test_server().await;
    let manager = ConnectionManager::new(ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        user_id: Some(UserId::from("A")),
        ..ClientConfig::default()
    });
    manager.join_room(RoomId::from("r0")).await.unwrap();
    manager.connect().await.unwrap();

    // Joins land before, during and after the session handshake.
    for i in 1..40 {
        manager.join_room(RoomId::from(format!("r{i}"))).await.unwrap();
        tokio::task::yield_now().await;
    }
    manager.wait_connected(Duration::from_secs(3)).await.unwrap();

    eventually(|| {
        let hub = hub.clone();
        async move {
            let mut joined = 0;
            for i in 0..40 {
                let room = RoomId::from(format!("r{i}"));
                joined += hub.rooms().members_of(&room).await.len();
            }
            joined == 40
        }
    })
    .await;

    manager.disconnect().await;
}
