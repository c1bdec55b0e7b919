//! End-to-end routing scenarios against a single bus.
//!
//! Each test drives a [`Bus`] purely through its public operations, the way
//! a transport would on behalf of connected processes, and inspects what
//! lands in the recipients' pools.

use std::time::{Duration, Instant};

use kbus_core::{
    AcquireStatus, AttachFlags, BloomFilter, Bus, BusConfig, BusError, ConnFlags, Credentials,
    DEFAULT_ENDPOINT, Envelope, Hello, Item, ListFlags, MakeFlags, MatchItem, MatchRule,
    Message, NameChange, NameFlags, NameQuery, Notification, PolicyAccess, PolicyBits,
    ProcessMetadata,
};

// ============================================================================
// Helpers
// ============================================================================

fn open_bus() -> Bus {
    Bus::create(BusConfig::for_testing(), Credentials::new(0, 0)).unwrap()
}

fn meta(uid: u64) -> ProcessMetadata {
    ProcessMetadata::with_creds(Credentials::new(uid, uid))
}

fn connect(bus: &Bus, uid: u64) -> u64 {
    connect_with(bus, meta(uid), AttachFlags::empty())
}

fn connect_with(bus: &Bus, metadata: ProcessMetadata, attach: AttachFlags) -> u64 {
    bus.hello(
        DEFAULT_ENDPOINT,
        metadata,
        Hello {
            attach_flags: attach,
            ..Hello::default()
        },
    )
    .unwrap()
    .id
}

/// Reads and frees every queued message of `id`.
fn drain(bus: &Bus, id: u64) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Some(received) = bus.receive(id).unwrap() {
        out.push(bus.read_message(id, received.offset).unwrap());
        bus.free(id, received.offset).unwrap();
    }
    out
}

fn user_messages(bus: &Bus, id: u64) -> Vec<Message> {
    drain(bus, id)
        .into_iter()
        .filter_map(|env| match env {
            Envelope::User(msg) => Some(msg),
            Envelope::Kernel(_) => None,
        })
        .collect()
}

fn signal_filter() -> BloomFilter {
    BloomFilter::new(8).unwrap().with(b"interface:org.example.Signals")
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_name_addressed_delivery_attaches_requested_items_only() {
    let bus = open_bus();
    let service = connect_with(&bus, meta(1000), AttachFlags::CREDS | AttachFlags::NAMES);

    let mut sender_meta = meta(1001);
    sender_meta.pid_comm = Some("client".to_string());
    sender_meta.exe = Some("/usr/bin/client".to_string());
    let client = connect_with(&bus, sender_meta, AttachFlags::empty());

    bus.name_acquire(service, "org.x", NameFlags::empty())
        .unwrap();
    bus.name_acquire(client, "org.client", NameFlags::empty())
        .unwrap();
    bus.send(client, Message::to_name("org.x", 9).with_payload(&b"body"[..]))
        .unwrap();

    let received = bus.receive(service).unwrap().unwrap();
    let Envelope::User(msg) = bus.read_message(service, received.offset).unwrap() else {
        panic!("expected a user message");
    };
    assert_eq!(msg.src_id, client);
    assert_eq!(msg.cookie, 9);
    assert!(msg.items.contains(&Item::Creds(Credentials::new(1001, 1001))));
    assert!(
        msg.items
            .contains(&Item::Names(vec!["org.client".to_string()]))
    );
    assert!(!msg.items.iter().any(|item| matches!(
        item,
        Item::PidComm(_) | Item::Exe(_) | Item::Timestamp(_)
    )));
    assert_eq!(&bus.read_payload(service, received.offset).unwrap()[..], b"body");
}

#[test]
fn test_disconnect_promotes_queued_claimant_and_notifies() {
    let bus = open_bus();
    let a = connect(&bus, 1000);
    let b = connect(&bus, 1000);
    let watcher = connect(&bus, 1000);
    bus.match_add(
        watcher,
        MatchRule::new(1).with(MatchItem::NameChange("org.x".to_string())),
    )
    .unwrap();

    assert_eq!(
        bus.name_acquire(a, "org.x", NameFlags::empty()).unwrap(),
        AcquireStatus::Owned
    );
    assert_eq!(
        bus.name_acquire(b, "org.x", NameFlags::QUEUE).unwrap(),
        AcquireStatus::Queued
    );

    bus.disconnect(a).unwrap();

    assert_eq!(
        drain(&bus, watcher),
        vec![Envelope::Kernel(Notification::NameChange(NameChange {
            old_id: a,
            new_id: b,
            flags: NameFlags::QUEUE.bits(),
            name: "org.x".to_string(),
        }))]
    );
    assert_eq!(
        bus.info(&NameQuery::Name("org.x".to_string())).unwrap().id,
        b
    );
}

#[test]
fn test_fifo_promotion_never_skips() {
    let bus = open_bus();
    let a = connect(&bus, 1000);
    let b = connect(&bus, 1000);
    let c = connect(&bus, 1000);
    bus.name_acquire(a, "org.x", NameFlags::empty()).unwrap();
    bus.name_acquire(b, "org.x", NameFlags::QUEUE).unwrap();
    bus.name_acquire(c, "org.x", NameFlags::QUEUE).unwrap();

    let owner = |bus: &Bus| bus.info(&NameQuery::Name("org.x".to_string())).unwrap().id;
    bus.name_release(a, "org.x").unwrap();
    assert_eq!(owner(&bus), b);
    bus.name_release(b, "org.x").unwrap();
    assert_eq!(owner(&bus), c);
    bus.name_release(c, "org.x").unwrap();
    assert!(matches!(
        bus.info(&NameQuery::Name("org.x".to_string())),
        Err(BusError::NameNotFound { .. })
    ));
}

#[test]
fn test_reply_timeout_after_deadline() {
    let bus = open_bus();
    let client = connect(&bus, 1000);
    let service = connect(&bus, 1000);

    bus.send(client, Message::to_id(service, 77).expect_reply(1000))
        .unwrap();
    assert_eq!(user_messages(&bus, service).len(), 1);

    let expired = bus.sweep_expired_replies_at(Instant::now() + Duration::from_millis(1));
    assert_eq!(expired, 1);
    assert_eq!(
        drain(&bus, client),
        vec![Envelope::Kernel(Notification::ReplyTimeout { cookie: 77 })]
    );

    // A late reply is an ordinary message again.
    bus.send(service, Message::to_id(client, 1).reply_to(77))
        .unwrap();
    assert_eq!(bus.pending_replies(), 0);
}

#[test]
fn test_broadcast_survives_one_exhausted_pool() {
    let config = BusConfig {
        pool_size: 512,
        ..BusConfig::for_testing()
    };
    let bus = Bus::create(config, Credentials::new(0, 0)).unwrap();
    let sender = connect(&bus, 1000);
    let full = connect(&bus, 1000);
    let healthy = [connect(&bus, 1000), connect(&bus, 1000)];

    let rule = MatchRule::new(1).with(MatchItem::Bloom(signal_filter().as_bytes().to_vec()));
    for id in [full, healthy[0], healthy[1]] {
        bus.match_add(id, rule.clone()).unwrap();
    }

    bus.send(sender, Message::to_id(full, 1).with_payload(vec![1u8; 200]))
        .unwrap();
    assert!(matches!(
        bus.send(sender, Message::to_id(full, 2).with_payload(vec![1u8; 200])),
        Err(BusError::PoolExhausted { .. })
    ));

    let signal = Message::broadcast(3)
        .with_item(Item::Bloom(signal_filter().into_bytes()))
        .with_payload(vec![2u8; 200]);
    bus.send(sender, signal).unwrap();

    for id in healthy {
        let received = user_messages(&bus, id);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].cookie, 3);
    }
    let cookies: Vec<u64> = user_messages(&bus, full).iter().map(|m| m.cookie).collect();
    assert_eq!(cookies, vec![1]);
    assert!(user_messages(&bus, sender).is_empty());
}

#[test]
fn test_broadcast_needs_matching_bloom() {
    let bus = open_bus();
    let sender = connect(&bus, 1000);
    let subscribed = connect(&bus, 1000);
    let other = connect(&bus, 1000);
    let silent = connect(&bus, 1000);

    bus.match_add(
        subscribed,
        MatchRule::new(1).with(MatchItem::Bloom(signal_filter().as_bytes().to_vec())),
    )
    .unwrap();
    let unrelated = BloomFilter::new(8).unwrap().with(b"interface:org.other");
    bus.match_add(
        other,
        MatchRule::new(1).with(MatchItem::Bloom(unrelated.as_bytes().to_vec())),
    )
    .unwrap();

    let filter = signal_filter().with(b"member:Changed");
    bus.send(
        sender,
        Message::broadcast(5).with_item(Item::Bloom(filter.into_bytes())),
    )
    .unwrap();

    assert_eq!(user_messages(&bus, subscribed).len(), 1);
    let other_got = user_messages(&bus, other).len();
    assert!(other_got <= 1, "false positives allowed, duplicates are not");
    assert!(user_messages(&bus, silent).is_empty());
}

#[test]
fn test_priority_order_in_queue() {
    let bus = open_bus();
    let a = connect(&bus, 1000);
    let b = connect(&bus, 1000);
    for (cookie, priority) in [(1, 0), (2, 5), (3, -3), (4, 0)] {
        bus.send(
            a,
            Message::to_id(b, cookie).with_item(Item::Priority(priority)),
        )
        .unwrap();
    }
    let order: Vec<u64> = user_messages(&bus, b).iter().map(|m| m.cookie).collect();
    assert_eq!(order, vec![3, 1, 4, 2]);
}

#[test]
fn test_user_entry_overrides_world_for_send() {
    let config = BusConfig {
        make_flags: MakeFlags::ACCESS_WORLD,
        ..BusConfig::for_testing()
    };
    let bus = Bus::create(config, Credentials::new(0, 0)).unwrap();
    let service = connect(&bus, 0);
    let denied = connect(&bus, 1000);
    let allowed = connect(&bus, 1001);

    bus.policy_set(
        service,
        "org.x",
        vec![
            PolicyAccess::world(PolicyBits::OWN | PolicyBits::SEND),
            PolicyAccess::user(1000, PolicyBits::empty()),
        ],
    )
    .unwrap();
    bus.name_acquire(service, "org.x", NameFlags::empty())
        .unwrap();

    assert!(matches!(
        bus.send(denied, Message::to_name("org.x", 1)),
        Err(BusError::PolicyDenied { .. })
    ));
    bus.send(allowed, Message::to_name("org.x", 2)).unwrap();

    let cookies: Vec<u64> = user_messages(&bus, service)
        .iter()
        .map(|m| m.cookie)
        .collect();
    assert_eq!(cookies, vec![2]);
}

#[test]
fn test_own_policy_checked_before_transfer() {
    let config = BusConfig {
        make_flags: MakeFlags::ACCESS_WORLD,
        ..BusConfig::for_testing()
    };
    let bus = Bus::create(config, Credentials::new(0, 0)).unwrap();
    let root = connect(&bus, 0);
    let owner = connect(&bus, 1000);
    let usurper = connect(&bus, 1001);
    bus.policy_set(root, "org.x", vec![PolicyAccess::user(1000, PolicyBits::OWN)])
        .unwrap();

    bus.name_acquire(owner, "org.x", NameFlags::ALLOW_REPLACEMENT)
        .unwrap();
    assert!(matches!(
        bus.name_acquire(usurper, "org.x", NameFlags::REPLACE_EXISTING),
        Err(BusError::PolicyDenied { .. })
    ));
    assert_eq!(
        bus.info(&NameQuery::Name("org.x".to_string())).unwrap().id,
        owner
    );
}

#[test]
fn test_name_list_and_info() {
    let bus = open_bus();
    let a = connect(&bus, 1000);
    let b = connect(&bus, 1000);
    bus.name_acquire(a, "org.a", NameFlags::empty()).unwrap();
    bus.name_acquire(b, "org.a", NameFlags::QUEUE).unwrap();

    let unique = bus.name_list(ListFlags::UNIQUE);
    assert_eq!(
        unique.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![a, b]
    );
    assert!(unique.iter().all(|e| e.name.is_none()));

    let with_queue = bus.name_list(ListFlags::NAMES | ListFlags::QUEUED);
    assert_eq!(with_queue.len(), 2);
    assert!(
        with_queue
            .iter()
            .any(|e| e.id == b && e.flags.contains(NameFlags::IN_QUEUE))
    );

    let info = bus.info(&NameQuery::Id(a)).unwrap();
    assert_eq!(info.names, vec!["org.a".to_string()]);
    assert_eq!(info.endpoint, DEFAULT_ENDPOINT);
    assert!(matches!(
        bus.info(&NameQuery::Id(999)),
        Err(BusError::ConnectionNotFound { id: 999 })
    ));
}

#[test]
fn test_operations_fail_after_disconnect() {
    let bus = open_bus();
    let a = connect(&bus, 1000);
    let b = connect(&bus, 1000);
    bus.disconnect(a).unwrap();

    assert_eq!(
        bus.send(a, Message::to_id(b, 1)),
        Err(BusError::ConnectionNotFound { id: a })
    );
    assert_eq!(
        bus.send(b, Message::to_id(a, 1)),
        Err(BusError::ConnectionNotFound { id: a })
    );
    assert!(bus.disconnect(a).is_err());
}

#[test]
fn test_encoded_send_is_routed() {
    let bus = open_bus();
    let a = connect(&bus, 1000);
    let b = connect(&bus, 1000);

    let wire = Message::to_id(b, 11).with_payload(&b"raw"[..]).encode();
    bus.send_raw(a, &wire).unwrap();
    let received = bus.receive(b).unwrap().unwrap();
    assert_eq!(&bus.read_payload(b, received.offset).unwrap()[..], b"raw");

    let mut truncated = wire.clone();
    truncated.truncate(wire.len() - 8);
    assert!(matches!(
        bus.send_raw(a, &truncated),
        Err(BusError::MalformedChain { .. })
    ));
}

#[test]
fn test_activated_request_answered_by_new_owner() {
    let bus = open_bus();
    let starter = bus
        .hello(
            DEFAULT_ENDPOINT,
            meta(0),
            Hello {
                conn_flags: ConnFlags::STARTER,
                items: vec![Item::StarterName("org.x".to_string())],
                ..Hello::default()
            },
        )
        .unwrap()
        .id;
    let client = connect(&bus, 1001);
    let hour = 3_600_000_000_000;
    bus.send(client, Message::to_name("org.x", 7).expect_reply(hour))
        .unwrap();
    bus.send(client, Message::to_name("org.x", 8).expect_reply(hour))
        .unwrap();
    assert_eq!(bus.pending_replies(), 2);

    let service = connect(&bus, 1000);
    bus.name_acquire(service, "org.x", NameFlags::empty())
        .unwrap();
    let cookies: Vec<u64> = user_messages(&bus, service)
        .iter()
        .map(|msg| msg.cookie)
        .collect();
    assert_eq!(cookies, vec![7, 8]);

    bus.send(service, Message::to_id(client, 1).reply_to(7))
        .unwrap();
    assert_eq!(bus.pending_replies(), 1);

    // The activator no longer owes anything.
    bus.disconnect(starter).unwrap();
    let replies = drain(&bus, client);
    assert_eq!(replies.len(), 1);
    assert!(matches!(
        &replies[0],
        Envelope::User(msg) if msg.src_id == service
    ));

    // The new owner owes cookie 8.
    bus.disconnect(service).unwrap();
    assert_eq!(
        drain(&bus, client),
        vec![Envelope::Kernel(Notification::ReplyDead { cookie: 8 })]
    );
    assert_eq!(bus.pending_replies(), 0);
}

#[test]
fn test_replacement_notifies_and_requeues_displaced_owner() {
    let bus = open_bus();
    let a = connect(&bus, 1000);
    let b = connect(&bus, 1000);
    let watcher = connect(&bus, 1000);
    bus.match_add(
        watcher,
        MatchRule::new(1).with(MatchItem::NameChange("org.x".to_string())),
    )
    .unwrap();

    bus.name_acquire(a, "org.x", NameFlags::ALLOW_REPLACEMENT | NameFlags::QUEUE)
        .unwrap();
    assert_eq!(
        bus.name_acquire(b, "org.x", NameFlags::REPLACE_EXISTING)
            .unwrap(),
        AcquireStatus::Owned
    );

    assert_eq!(
        drain(&bus, watcher),
        vec![Envelope::Kernel(Notification::NameChange(NameChange {
            old_id: a,
            new_id: b,
            flags: NameFlags::REPLACE_EXISTING.bits(),
            name: "org.x".to_string(),
        }))]
    );
    let queued: Vec<u64> = bus
        .name_list(ListFlags::QUEUED)
        .iter()
        .map(|entry| entry.id)
        .collect();
    assert_eq!(queued, vec![a]);

    bus.send(watcher, Message::to_name("org.x", 3)).unwrap();
    assert_eq!(user_messages(&bus, b).len(), 1);
    assert!(user_messages(&bus, a).is_empty());

    bus.name_release(b, "org.x").unwrap();
    assert_eq!(
        drain(&bus, watcher),
        vec![Envelope::Kernel(Notification::NameChange(NameChange {
            old_id: b,
            new_id: a,
            flags: (NameFlags::ALLOW_REPLACEMENT | NameFlags::QUEUE).bits(),
            name: "org.x".to_string(),
        }))]
    );
}
