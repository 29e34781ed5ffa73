//! Wormhole behaviour: eager dial, direct send bypassing the route table,
//! id reuse, close semantics and state reporting.

use msg_router::{Context, ErrorKind, InitFlags, WormholeError};

fn ctx(port: u16) -> Context {
    Context::init(Some(port), 0, InitFlags::NOTHREAD).expect("context init")
}

#[test]
fn wormhole_send_bypasses_route_table() {
    let sender = ctx(21300);
    let receiver = ctx(21301);

    // no route table anywhere; the wormhole alone carries traffic
    let wh = sender.wh_open("127.0.0.1:21301").expect("wormhole open");
    assert!(sender.wh_state(wh).is_ok());

    let mut m = sender.alloc_msg(32);
    m.mtype = 77;
    m.str2payload("tunnelled").unwrap();
    let fresh = sender.wh_send_msg(wh, m).expect("wormhole send");
    assert!(fresh.payload_size() > 0);

    let got = receiver.torcv_msg(5000).expect("delivery");
    assert_eq!(got.mtype, 77);
    assert_eq!(&got.payload()[..9], b"tunnelled");
}

#[test]
fn duplicate_open_returns_same_id() {
    let sender = ctx(21310);
    let _receiver = ctx(21311);

    let a = sender.wh_open("127.0.0.1:21311").expect("first open");
    let b = sender.wh_open("127.0.0.1:21311").expect("second open");
    assert_eq!(a, b);
}

#[test]
fn open_to_unreachable_target_fails() {
    let sender = ctx(21320);
    // nothing listens there
    let err = sender.wh_open("127.0.0.1:21329").unwrap_err();
    assert!(matches!(err, WormholeError::Connect { .. }));

    let err = sender.wh_open("").unwrap_err();
    assert!(matches!(err, WormholeError::BadTarget));
}

#[test]
fn closed_wormhole_rejects_sends() {
    let sender = ctx(21330);
    let _receiver = ctx(21331);

    let wh = sender.wh_open("127.0.0.1:21331").expect("open");
    sender.wh_close(wh);

    let m = sender.alloc_msg(16);
    let err = sender.wh_send_msg(wh, m).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadWhId);
    assert!(err.msg.is_some());

    // state reporting agrees
    assert!(matches!(
        sender.wh_state(wh),
        Err(WormholeError::BadId(_))
    ));
}

#[test]
fn state_before_any_open_is_not_open() {
    let sender = ctx(21340);
    assert!(matches!(
        sender.wh_state(msg_router::Whid(0)),
        Err(WormholeError::NotOpen)
    ));
}
