use std::sync::Arc;
use std::time::Duration;

use application::{
    FanoutBus, FanoutEvent, GroupName, ManualClock, PresenceTracker, RateLimiter,
    RedisPresenceTracker, RedisRateLimiter, SessionSink,
};
use chrono::{DurationRound, Utc};
use domain::UserId;
use infrastructure::RedisFanoutBus;
use redis::aio::ConnectionManager;
use serde_json::json;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const KEY_PREFIX: &str = "chat-test";

async fn start() -> (testcontainers::ContainerAsync<Redis>, redis::Client) {
    let node = Redis::default().start().await.expect("start redis");
    let port = node.get_host_port_ipv4(6379u16).await.expect("port");
    let client = redis::Client::open(format!("redis://127.0.0.1:{port}")).expect("client");
    (node, client)
}

async fn connection(client: &redis::Client) -> ConnectionManager {
    client
        .get_connection_manager()
        .await
        .expect("connection manager")
}

fn clock() -> Arc<ManualClock> {
    let now = Utc::now()
        .duration_trunc(chrono::Duration::milliseconds(1))
        .expect("truncate");
    Arc::new(ManualClock::new(now))
}

// 模式订阅在后台建立，发布方重试到对端收到为止
async fn publish_until_received(
    bus: &RedisFanoutBus,
    group: GroupName,
    event: FanoutEvent,
    rx: &mut mpsc::Receiver<FanoutEvent>,
) -> FanoutEvent {
    for _ in 0..20 {
        bus.publish(group, event.clone()).await.expect("publish");
        if let Ok(Some(received)) = timeout(Duration::from_millis(250), rx.recv()).await {
            return received;
        }
    }
    panic!("event never crossed the bus");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn events_cross_between_two_processes() {
    let (_node, client) = start().await;
    let shutdown = CancellationToken::new();
    let sender_node = RedisFanoutBus::connect(client.clone(), KEY_PREFIX, shutdown.clone())
        .await
        .expect("sender bus");
    let receiver_node = RedisFanoutBus::connect(client, KEY_PREFIX, shutdown.clone())
        .await
        .expect("receiver bus");

    let user = UserId::generate();
    let (sink, mut rx) = SessionSink::channel(16);
    let handle = receiver_node
        .subscribe(GroupName::User(user), sink)
        .await
        .expect("subscribe");

    let event = FanoutEvent::durable("notification.new", json!({ "n": 1 }));
    let received =
        publish_until_received(&sender_node, GroupName::User(user), event, &mut rx).await;
    assert_eq!(received.event_type, "notification.new");
    assert_eq!(received.data["n"], 1);

    // 其它分组的事件不会落到这个会话上
    sender_node
        .publish(
            GroupName::User(UserId::generate()),
            FanoutEvent::durable("notification.new", json!({ "n": 2 })),
        )
        .await
        .expect("publish elsewhere");

    receiver_node.unsubscribe(handle).await.expect("unsubscribe");
    sender_node
        .publish(
            GroupName::User(user),
            FanoutEvent::durable("notification.new", json!({ "n": 3 })),
        )
        .await
        .expect("publish after unsubscribe");

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(leftover) = rx.try_recv() {
        // 重试期间可能多收到几份第一条
        assert_eq!(leftover.data["n"], 1);
    }
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn thirty_first_send_is_rejected_across_connections() {
    let (_node, client) = start().await;
    let clock = clock();
    // 两个实例共用同一个 Redis，模拟同一用户落在两个进程上
    let first = RedisRateLimiter::new(connection(&client).await, KEY_PREFIX, clock.clone());
    let second = RedisRateLimiter::new(connection(&client).await, KEY_PREFIX, clock.clone());
    let user = UserId::generate();
    let window = Duration::from_secs(30);

    for i in 0..30u32 {
        let limiter = if i % 2 == 0 { &first } else { &second };
        let decision = limiter
            .allow(user, "send_message", 30, window)
            .await
            .expect("allow");
        assert!(decision.allowed, "request {i} should pass");
        assert_eq!(decision.remaining, 29 - i);
        clock.advance(chrono::Duration::milliseconds(100));
    }

    let rejected = first
        .allow(user, "send_message", 30, window)
        .await
        .expect("allow");
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);

    let other_action = first
        .allow(user, "typing", 30, window)
        .await
        .expect("allow");
    assert!(other_action.allowed);

    clock.advance(chrono::Duration::seconds(31));
    let reopened = second
        .allow(user, "send_message", 30, window)
        .await
        .expect("allow");
    assert!(reopened.allowed);
    assert_eq!(reopened.remaining, 29);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn presence_round_trips_through_redis() {
    let (_node, client) = start().await;
    let clock = clock();
    let presence = RedisPresenceTracker::new(connection(&client).await, KEY_PREFIX, clock.clone());
    let user = UserId::generate();

    assert!(!presence.is_online(user).await.expect("is_online"));
    assert_eq!(presence.last_seen(user).await.expect("last_seen"), None);

    let online_at = presence.mark_online(user).await.expect("mark_online");
    assert!(presence.is_online(user).await.expect("is_online"));
    assert_eq!(
        presence.last_seen(user).await.expect("last_seen"),
        Some(online_at)
    );

    clock.advance(chrono::Duration::minutes(3));
    presence.mark_offline(user).await.expect("mark_offline");
    assert!(!presence.is_online(user).await.expect("is_online"));
    assert_eq!(
        presence.last_seen(user).await.expect("last_seen"),
        Some(online_at + chrono::Duration::minutes(3))
    );
}
