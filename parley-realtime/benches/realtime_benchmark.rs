use criterion::{criterion_group, criterion_main, Criterion};
use parley_realtime::broadcast::{plan, BroadcastRouter, Route, Audience};
use parley_realtime::client::{ActionPayload, ActionQueue, ReconcileConfig, Timeline};
use parley_realtime::protocol::{
    ChatMessage, ClientEvent, ConnectionId, MessageId, MessageUpdate, RoomId, ServerEvent, UserId,
};
use parley_realtime::rooms::RoomMembership;
use std::hint::black_box;
use std::sync::Arc;
use tokio::time::Instant;

fn sample_message(i: usize) -> ChatMessage {
    ChatMessage::with_id(format!("m_{i}"), "r1", "A", "The quick brown fox jumps over the lazy dog")
}

// ─── Protocol ───────────────────────────────────────────────────

fn bench_envelope_encode(c: &mut Criterion) {
    let event = ServerEvent::ReceiveMessage(sample_message(1));

    c.bench_function("envelope_encode_receive_message", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = ClientEvent::SendMessage(sample_message(1)).encode().unwrap();

    c.bench_function("envelope_decode_send_message", |b| {
        b.iter(|| {
            black_box(ClientEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

// ─── Routing ────────────────────────────────────────────────────

fn bench_plan_peer_send(c: &mut Criterion) {
    let conn = ConnectionId::new();
    let user = UserId::from("A");
    let message = ChatMessage::with_id("tmp_1", "r1", "A", "hi");

    c.bench_function("plan_peer_send", |b| {
        b.iter(|| {
            let event = ClientEvent::SendMessage(message.clone());
            black_box(plan(conn, Some(&user), black_box(event)).unwrap());
        })
    });
}

fn bench_dispatch_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rooms = Arc::new(RoomMembership::new());
    let router = BroadcastRouter::new(rooms.clone(), 4096);

    let receivers = rt.block_on(async {
        let mut receivers = Vec::new();
        for _ in 0..100 {
            let conn = ConnectionId::new();
            rooms.join(RoomId::from("r1"), conn).await;
            receivers.push(router.register(conn).await);
        }
        receivers
    });

    let route = Route {
        audience: Audience::Room {
            room: RoomId::from("r1"),
            except: None,
        },
        event: ServerEvent::ReceiveMessage(sample_message(1)),
    };

    c.bench_function("dispatch_1_msg_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(router.dispatch(black_box(&route)).await.unwrap());
            });
        })
    });
    drop(receivers);
}

// ─── Reconciliation ─────────────────────────────────────────────

fn bench_reconcile_1000_messages(c: &mut Criterion) {
    let messages: Vec<ChatMessage> = (0..1000).map(sample_message).collect();

    c.bench_function("reconcile_1000_peer_messages", |b| {
        b.iter(|| {
            let mut timeline = Timeline::new(UserId::from("B"), ReconcileConfig::default());
            timeline.set_room(Some(RoomId::from("r1")));
            let now = Instant::now();
            for message in &messages {
                black_box(timeline.receive(message.clone(), now));
            }
            black_box(timeline.messages().len());
        })
    });
}

fn bench_action_queue_1000(c: &mut Criterion) {
    c.bench_function("action_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = ActionQueue::new(10_000);
            for i in 0..1000 {
                let _ = queue.enqueue(ActionPayload::Edit(MessageUpdate {
                    message_id: MessageId::new(format!("m_{i}")),
                    content: "edited".to_string(),
                    room_id: RoomId::from("r1"),
                }));
            }
            while let Some(action) = queue.pop_front() {
                black_box(action);
            }
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_plan_peer_send,
    bench_dispatch_100_members,
    bench_reconcile_1000_messages,
    bench_action_queue_1000,
);
criterion_main!(benches);
