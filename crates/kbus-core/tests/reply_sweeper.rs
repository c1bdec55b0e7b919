//! Reply deadlines expire through the background sweeper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kbus_core::{
    Bus, BusConfig, Credentials, DEFAULT_ENDPOINT, Envelope, Hello, Message, Notification,
    ProcessMetadata, spawn_reply_sweeper,
};

fn connect(bus: &Bus) -> u64 {
    bus.hello(
        DEFAULT_ENDPOINT,
        ProcessMetadata::with_creds(Credentials::new(1000, 1000)),
        Hello::default(),
    )
    .unwrap()
    .id
}

#[tokio::test]
async fn test_sweeper_delivers_reply_timeout() {
    let bus = Arc::new(Bus::create(BusConfig::for_testing(), Credentials::new(0, 0)).unwrap());
    let client = connect(&bus);
    let service = connect(&bus);
    let shutdown = Arc::new(AtomicBool::new(false));
    let sweeper = spawn_reply_sweeper(
        Arc::clone(&bus),
        Duration::from_millis(5),
        Arc::clone(&shutdown),
    );

    bus.send(client, Message::to_id(service, 31).expect_reply(1_000_000))
        .unwrap();

    let mut note = None;
    for _ in 0..200 {
        if let Some(received) = bus.receive(client).unwrap() {
            note = Some(bus.read_message(client, received.offset).unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        note,
        Some(Envelope::Kernel(Notification::ReplyTimeout { cookie: 31 }))
    );
    assert_eq!(bus.pending_replies(), 0);

    shutdown.store(true, Ordering::Release);
    sweeper.await.unwrap();
}

#[tokio::test]
async fn test_answered_request_never_times_out() {
    let bus = Arc::new(Bus::create(BusConfig::for_testing(), Credentials::new(0, 0)).unwrap());
    let client = connect(&bus);
    let service = connect(&bus);
    let shutdown = Arc::new(AtomicBool::new(false));
    let sweeper = spawn_reply_sweeper(
        Arc::clone(&bus),
        Duration::from_millis(5),
        Arc::clone(&shutdown),
    );

    bus.send(client, Message::to_id(service, 8).expect_reply(20_000_000))
        .unwrap();
    bus.send(service, Message::to_id(client, 1).reply_to(8))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = bus.receive(client).unwrap().unwrap();
    assert!(matches!(
        bus.read_message(client, received.offset).unwrap(),
        Envelope::User(_)
    ));
    bus.free(client, received.offset).unwrap();
    assert!(bus.receive(client).unwrap().is_none());

    shutdown.store(true, Ordering::Release);
    sweeper.await.unwrap();
}
