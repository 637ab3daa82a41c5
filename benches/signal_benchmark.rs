use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use signalhub::signaling::{ClientMessage, ServerMessage, UserInfo};

const JOIN: &[u8] = br#"{"type":"joinRoom","data":{"id":"u1","name":"Alice","room_id":"r1"}}"#;

/// a realistic candidate frame
const CANDIDATE: &[u8] = br#"{"type":"candidate","data":{"to":"u2","room_id":"r1","candidate":{"candidate":"candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 0.0.0.0 rport 0 generation 0","sdpMid":"0","sdpMLineIndex":0}}}"#;

/// envelope parsing benchmark
fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parsing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("joinRoom", |b| {
        b.iter(|| {
            let msg = ClientMessage::parse(black_box(JOIN)).unwrap();
            black_box(msg)
        })
    });

    group.bench_function("candidate", |b| {
        b.iter(|| {
            let msg = ClientMessage::parse(black_box(CANDIDATE)).unwrap();
            black_box(msg)
        })
    });

    group.finish();
}

/// user list serialization benchmark
fn bench_user_list(c: &mut Criterion) {
    let users: Vec<UserInfo> = (0..16)
        .map(|i| UserInfo {
            id: format!("user-{i}"),
            name: format!("Participant {i}"),
        })
        .collect();

    let mut group = c.benchmark_group("Broadcast");
    group.throughput(Throughput::Elements(1));

    group.bench_function("updateUserList_16", |b| {
        b.iter(|| {
            let msg = ServerMessage::UpdateUserList(black_box(users.clone()));
            black_box(msg.to_outbound())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_parsing, bench_user_list);
criterion_main!(benches);
