use super::*;
use crate::test_helpers::{MockServer, eventually, pixel};
use crate::types::Pixel;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn canvas_channel() -> Channel<Pixel> {
    Channel::new(Feed::Canvas, Duration::from_secs(2))
}

fn collector(channel: &Channel<Pixel>) -> mpsc::UnboundedReceiver<Pixel> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.subscribe(move |p: &Pixel| {
        let _ = tx.send(p.clone());
    });
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Pixel>) -> Pixel {
    timeout(WAIT, rx.recv())
        .await
        .expect("delivery timed out")
        .expect("collector closed unexpectedly")
}

/// Passes on silence and on a closed collector (its subscription was dropped).
async fn assert_nothing(rx: &mut mpsc::UnboundedReceiver<Pixel>) {
    let delivered = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(!matches!(delivered, Ok(Some(_))), "expected no delivery, got {delivered:?}");
}

#[test]
fn state_display_and_terminal() {
    assert_eq!(ChannelState::Open.to_string(), "open");
    assert_eq!(ChannelState::Failed("boom".into()).to_string(), "failed: boom");
    assert!(ChannelState::Closed.is_terminal());
    assert!(ChannelState::Failed(String::new()).is_terminal());
    assert!(!ChannelState::Closing.is_terminal());
    assert!(!ChannelState::Idle.is_open());
}

#[tokio::test]
async fn new_channel_is_idle_and_refuses_send() {
    let channel = canvas_channel();
    assert_eq!(channel.state(), ChannelState::Idle);
    assert_eq!(channel.feed(), Feed::Canvas);

    let err = channel.send(&pixel(0, 0, "#000000", "a", 0)).unwrap_err();
    assert_eq!(err, TransportError::ChannelNotReady(ChannelState::Idle));
}

#[tokio::test]
async fn open_against_refused_port_fails() {
    let channel = canvas_channel();
    let mut rx = collector(&channel);

    let err = channel.open("ws://127.0.0.1:1/ws/canvas").await.unwrap_err();
    assert!(matches!(err, TransportError::Connect(_) | TransportError::Timeout(_)), "{err:?}");
    assert!(matches!(channel.state(), ChannelState::Failed(_)));
    assert!(channel.ready().await.is_err());
    assert_nothing(&mut rx).await;
}

#[tokio::test]
async fn second_open_is_refused() {
    let server = MockServer::start().await;
    let channel = canvas_channel();
    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();

    let err = channel.open(&server.ws_url(Feed::Canvas)).await.unwrap_err();
    assert_eq!(err, TransportError::AlreadyOpened(ChannelState::Open));
    channel.close().await;
}

#[tokio::test]
async fn delivers_to_every_subscriber_in_order() {
    let server = MockServer::start().await;
    let channel = canvas_channel();
    let mut first = collector(&channel);
    let mut second = collector(&channel);

    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();
    channel.ready().await.unwrap();
    server.wait_for_subscribers(Feed::Canvas, 1).await;

    for i in 0..3 {
        server.push_pixel(&pixel(i, 0, "#ff0000", "ann", i64::from(i)));
    }
    for i in 0..3 {
        assert_eq!(recv(&mut first).await.x, i);
        assert_eq!(recv(&mut second).await.x, i);
    }
    channel.close().await;
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_channel_stays_open() {
    let server = MockServer::start().await;
    let channel = canvas_channel();
    let mut rx = collector(&channel);
    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();
    server.wait_for_subscribers(Feed::Canvas, 1).await;

    server.push_raw(Feed::Canvas, "{not json");
    server.push_raw(Feed::Canvas, r##"{"x":-1,"y":0,"color":"#fff","userId":"a"}"##);
    server.push_pixel(&pixel(4, 5, "#00ff00", "bo", 9));

    let got = recv(&mut rx).await;
    assert_eq!(got.key(), (4, 5));
    assert!(channel.state().is_open());
    channel.close().await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let server = MockServer::start().await;
    let channel = canvas_channel();
    let (tx, mut dropped) = mpsc::unbounded_channel();
    let id = channel.subscribe(move |p: &Pixel| {
        let _ = tx.send(p.clone());
    });
    let mut kept = collector(&channel);

    assert!(channel.unsubscribe(id));
    assert!(!channel.unsubscribe(id));
    assert_eq!(channel.subscriber_count(), 1);

    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();
    server.wait_for_subscribers(Feed::Canvas, 1).await;
    server.push_pixel(&pixel(1, 1, "#123456", "cy", 1));

    assert_eq!(recv(&mut kept).await.key(), (1, 1));
    assert_nothing(&mut dropped).await;
    channel.close().await;
}

#[tokio::test]
async fn handler_may_unsubscribe_itself_during_dispatch() {
    let server = MockServer::start().await;
    let channel = Arc::new(canvas_channel());
    let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));
    let (tx, mut once) = mpsc::unbounded_channel();

    let id = {
        let handle = Arc::clone(&channel);
        let own_id = Arc::clone(&own_id);
        channel.subscribe(move |p: &Pixel| {
            let _ = tx.send(p.clone());
            if let Some(id) = *own_id.lock().unwrap() {
                handle.unsubscribe(id);
            }
        })
    };
    *own_id.lock().unwrap() = Some(id);
    let mut rest = collector(&channel);

    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();
    server.wait_for_subscribers(Feed::Canvas, 1).await;
    server.push_pixel(&pixel(0, 0, "#000000", "a", 1));
    server.push_pixel(&pixel(1, 0, "#000000", "a", 2));

    assert_eq!(recv(&mut rest).await.x, 0);
    assert_eq!(recv(&mut rest).await.x, 1);
    assert_eq!(recv(&mut once).await.x, 0);
    assert_nothing(&mut once).await;
    channel.close().await;
}

#[tokio::test]
async fn remote_drop_moves_to_failed() {
    let server = MockServer::start().await;
    let channel = canvas_channel();
    let mut states = channel.watch_state();
    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();
    server.wait_for_subscribers(Feed::Canvas, 1).await;

    server.kick(Feed::Canvas);
    let settled = timeout(WAIT, states.wait_for(ChannelState::is_terminal))
        .await
        .expect("state change timed out")
        .unwrap()
        .clone();
    assert!(matches!(settled, ChannelState::Failed(_)), "{settled:?}");

    let err = channel.send(&pixel(0, 0, "#000000", "a", 0)).unwrap_err();
    assert!(matches!(err, TransportError::ChannelNotReady(ChannelState::Failed(_))));

    // Closing a failed channel keeps the failure visible.
    channel.close().await;
    assert!(matches!(channel.state(), ChannelState::Failed(_)));
}

#[tokio::test]
async fn close_is_idempotent_and_clears_subscribers() {
    let server = MockServer::start().await;
    let channel = canvas_channel();
    let mut rx = collector(&channel);
    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();
    server.wait_for_subscribers(Feed::Canvas, 1).await;

    channel.close().await;
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.subscriber_count(), 0);

    assert!(eventually(WAIT, || server.subscriber_count(Feed::Canvas) == 0).await);
    server.push_pixel(&pixel(2, 2, "#ffffff", "a", 1));
    assert_nothing(&mut rx).await;
}

#[tokio::test]
async fn close_before_open_ends_closed() {
    let channel = canvas_channel();
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);

    let err = channel.open("ws://127.0.0.1:1/ws/canvas").await.unwrap_err();
    assert_eq!(err, TransportError::AlreadyOpened(ChannelState::Closed));
}

#[tokio::test]
async fn send_reaches_server_when_open() {
    let server = MockServer::start().await;
    let channel = canvas_channel();
    channel.open(&server.ws_url(Feed::Canvas)).await.unwrap();

    channel.send(&pixel(3, 3, "#abcdef", "a", 1)).unwrap();
    assert!(channel.state().is_open());
    channel.close().await;
}
