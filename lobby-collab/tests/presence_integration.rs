//! Presence carried through a real relay.

use lobby_collab::peer::{LobbyPeer, PeerConfig};
use lobby_collab::presence::{PresenceField, Vec2, ViewportSize};
use lobby_collab::server::{RelayServer, ServerConfig};
use lobby_core::Player;
use tokio::net::TcpListener;
use tokio::time::Duration;

async fn start_test_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = RelayServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

fn peer(url: &str, name: &str) -> LobbyPeer {
    let config = PeerConfig {
        server_url: url.to_string(),
        ..PeerConfig::default()
    };
    LobbyPeer::new(Player::with_id(name, name), config)
}

async fn settle(a: &mut LobbyPeer, b: &mut LobbyPeer, millis: u64) {
    let window = Duration::from_millis(millis);
    let (ra, rb) = tokio::join!(a.run_for(window), b.run_for(window));
    ra.unwrap();
    rb.unwrap();
}

async fn connected_pair() -> (LobbyPeer, LobbyPeer) {
    let url = start_test_server().await;
    let mut a = peer(&url, "alice");
    let mut b = peer(&url, "bob");
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    settle(&mut a, &mut b, 150).await;
    (a, b)
}

#[tokio::test]
async fn test_peers_see_each_other() {
    let (a, b) = connected_pair().await;

    let seen_by_a = a.presence().peer(&b.peer_id()).expect("a sees b");
    let seen_by_b = b.presence().peer(&a.peer_id()).expect("b sees a");
    assert_eq!(seen_by_a.username, "bob");
    assert_eq!(seen_by_b.username, "alice");
    assert_eq!(seen_by_b.color, a.player().color);
}

#[tokio::test]
async fn test_cursor_is_scaled_to_local_viewport() {
    let (mut a, mut b) = connected_pair().await;

    a.update_presence(PresenceField::ViewportSize(Some(ViewportSize::new(2000.0, 1600.0))))
        .await
        .unwrap();
    a.update_presence(PresenceField::Position(Some(Vec2::new(500.0, 400.0))))
        .await
        .unwrap();
    settle(&mut a, &mut b, 100).await;

    let cursors = b.presence().remote_cursors(ViewportSize::new(1000.0, 800.0));
    assert_eq!(cursors.len(), 1);
    assert_eq!(cursors[0].0, a.peer_id());
    assert_eq!(cursors[0].2, Vec2::new(250.0, 200.0));
}

#[tokio::test]
async fn test_throttled_position_trailing_value_arrives() {
    let (mut a, mut b) = connected_pair().await;

    for x in 0..20 {
        a.update_presence(PresenceField::Position(Some(Vec2::new(x as f32, 0.0))))
            .await
            .unwrap();
    }
    settle(&mut a, &mut b, 400).await;

    let seen = b.presence().peer(&a.peer_id()).and_then(|r| r.position);
    assert_eq!(seen, Some(Vec2::new(19.0, 0.0)));
}

#[tokio::test]
async fn test_element_focus_chips() {
    let (mut a, mut b) = connected_pair().await;

    a.update_presence(PresenceField::ElementIndex(Some(2))).await.unwrap();
    settle(&mut a, &mut b, 100).await;

    assert_eq!(b.presence().peers_at_element(2), vec![a.player().color]);
    assert!(b.presence().peers_at_element(0).is_empty());
}

#[tokio::test]
async fn test_disconnect_removes_presence() {
    let (mut a, mut b) = connected_pair().await;
    assert_eq!(b.presence().peer_count(), 1);

    a.disconnect().await.unwrap();
    b.run_for(Duration::from_millis(200)).await.unwrap();

    assert_eq!(b.presence().peer_count(), 0);
    assert_eq!(a.presence().peer_count(), 0);
}

#[tokio::test]
async fn test_identity_change_is_announced() {
    let (mut a, mut b) = connected_pair().await;

    let color = lobby_core::PlayerColor::rgb(10, 20, 30);
    a.set_identity("alicia", color).await.unwrap();
    settle(&mut a, &mut b, 100).await;

    let seen = b.presence().peer(&a.peer_id()).unwrap();
    assert_eq!(seen.username, "alicia");
    assert_eq!(seen.color, color);
}
