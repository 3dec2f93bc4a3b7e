use criterion::{criterion_group, criterion_main, Criterion};
use quill_collab::{
    ClientConnection, ClientMessage, CollabMetrics, MemoryLog, OutboundQueue, Role, Room,
    ServerFrame, ServerMessage, StreamConfig,
};
use quill_collab::broker::DistributedLog;
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

fn bench_frame_encode(c: &mut Criterion) {
    let frame = ServerFrame::from_client(
        42,
        ServerMessage::ContentUpdate {
            update: vec![0u8; 64],
        },
    );

    c.bench_function("frame_encode_64B", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = ClientMessage::content(vec![0u8; 64]).encode().unwrap();

    c.bench_function("client_message_decode_64B", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

/// Room with `peers` local clients. Queues are drained after every
/// iteration so none of them fills up.
fn populated_room(rt: &Runtime, peers: u64) -> (Room, Vec<OutboundQueue>) {
    rt.block_on(async {
        let log = MemoryLog::new();
        log.ensure_stream(StreamConfig::for_category("bench"))
            .await
            .unwrap();
        let room = Room::new(1, "bench", Arc::new(log), Arc::new(CollabMetrics::new("bench")));
        let mut queues = Vec::new();
        for id in 0..peers {
            let (conn, queue) = ClientConnection::new(id, Uuid::new_v4(), Role::Writer, 1, 32);
            room.join(conn).await.unwrap();
            queues.push(queue);
        }
        (room, queues)
    })
}

fn bench_room_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (room, mut queues) = populated_room(&rt, 100);
    let frame = Arc::new(ServerFrame::from_client(
        0,
        ServerMessage::ContentUpdate {
            update: vec![0u8; 64],
        },
    ));

    c.bench_function("room_forward_to_local_100_peers", |b| {
        b.iter(|| {
            let delivered = rt.block_on(room.forward_to_local(Some(0), Arc::clone(&frame)));
            for queue in queues.iter_mut() {
                while queue.try_recv().is_some() {}
            }
            black_box(delivered)
        })
    });
}

fn bench_room_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (room, mut queues) = populated_room(&rt, 10);

    c.bench_function("room_broadcast_10_peers", |b| {
        b.iter(|| {
            rt.block_on(room.broadcast(
                0,
                ServerMessage::AwarenessPing {
                    update: vec![1, 0, 1, 126],
                },
            ));
            for queue in queues.iter_mut() {
                while queue.try_recv().is_some() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_room_fan_out,
    bench_room_broadcast,
);
criterion_main!(benches);
