use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use lobby_core::{DuelEvent, Lobby, Player};
use std::hint::black_box;

fn bench_create_game(c: &mut Criterion) {
    let host = Player::with_id("host", "host");

    c.bench_function("create_game", |b| {
        let mut lobby = Lobby::new("bench");
        b.iter(|| {
            black_box(lobby.create_game(black_box(&host)).unwrap());
            lobby.take_outgoing();
        })
    });
}

fn bench_list_games_100(c: &mut Criterion) {
    let mut lobby = Lobby::new("bench");
    for i in 0..100 {
        lobby
            .create_game(&Player::with_id(format!("p{i}"), "player"))
            .unwrap();
    }

    c.bench_function("list_games_100", |b| {
        b.iter(|| black_box(lobby.list_games()))
    });
}

fn bench_remote_join(c: &mut Criterion) {
    c.bench_function("remote_join_reconcile", |b| {
        b.iter_batched(
            || {
                let mut source = Lobby::new("bench");
                let id = source
                    .create_game(&Player::with_id("host", "host"))
                    .unwrap();
                let mut replica = Lobby::new("bench");
                replica.apply_remote_update(&source.encode_state()).unwrap();
                source.take_outgoing();
                source
                    .join_game(&id, &Player::with_id("guest", "guest"))
                    .unwrap();
                (replica, source.take_outgoing())
            },
            |(mut replica, updates)| {
                for update in &updates {
                    replica.apply_remote_update(black_box(update)).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_lifecycle(c: &mut Criterion) {
    c.bench_function("duel_lifecycle_local", |b| {
        b.iter(|| {
            let mut lobby = Lobby::new("bench");
            let id = lobby.create_game(&Player::with_id("a", "a")).unwrap();
            lobby.join_game(&id, &Player::with_id("b", "b")).unwrap();
            lobby.send_event(&id, DuelEvent::Start);
            if let Some(deadline) = lobby.next_deadline() {
                lobby.advance_timers(deadline);
            }
            black_box(lobby.take_outgoing())
        })
    });
}

criterion_group!(
    benches,
    bench_create_game,
    bench_list_games_100,
    bench_remote_join,
    bench_lifecycle,
);
criterion_main!(benches);
