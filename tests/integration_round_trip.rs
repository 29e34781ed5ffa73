//! End-to-end routing over loopback: two contexts, a routed send, the
//! round-robin and fallback rules, and return-to-sender.

use anyhow::Result;
use msg_router::{Context, ErrorKind, InitFlags, MsgState};

fn ctx(port: u16) -> Context {
    Context::init(Some(port), 0, InitFlags::NOTHREAD).expect("context init")
}

/// Pop the next message, tolerating delivery latency.
fn expect_msg(ctx: &Context) -> msg_router::MsgBuf {
    ctx.torcv_msg(5000).expect("expected a message in time")
}

#[test]
fn routed_send_reaches_receiver() -> Result<()> {
    let sender = Context::init(Some(21100), 0, InitFlags::NOTHREAD)?;
    let receiver = Context::init(Some(21101), 0, InitFlags::NOTHREAD)?;

    sender.load_route_table("newrt|start|rt1\nrte|7|127.0.0.1:21101\nnewrt|end|1\n");
    assert!(sender.ready());

    let mut m = sender.alloc_msg(64);
    m.mtype = 7;
    m.str2payload("first contact")?;
    let next = sender.send_msg(m).expect("routed send");
    // a fresh buffer comes back ready for the next send
    assert!(next.payload_size() > 0);

    let got = expect_msg(&receiver);
    assert_eq!(got.mtype, 7);
    assert_eq!(got.state, MsgState::Ok);
    assert_eq!(&got.payload()[..got.len()], b"first contact\0");
    assert_eq!(got.get_src(), sender.my_name());
    Ok(())
}

#[test]
fn round_robin_splits_across_group() {
    let sender = ctx(21110);
    let r1 = ctx(21111);
    let r2 = ctx(21112);

    sender.load_route_table(
        "newrt|start|rr\nrte|7|127.0.0.1:21111,127.0.0.1:21112\nnewrt|end|1\n",
    );

    for i in 0..4 {
        let mut m = sender.alloc_msg(32);
        m.mtype = 7;
        m.bytes2payload(&[i as u8]).unwrap();
        sender.send_msg(m).expect("send");
    }

    // two messages land on each group member
    for r in [&r1, &r2] {
        let a = expect_msg(r);
        let b = expect_msg(r);
        assert_eq!(a.mtype, 7);
        assert_eq!(b.mtype, 7);
        assert!(r.torcv_msg(100).is_err(), "only two messages expected");
    }
}

#[test]
fn sub_id_falls_back_to_type_entry() {
    let sender = ctx(21120);
    let ep_x = ctx(21121);
    let ep_y = ctx(21122);

    sender.load_route_table(
        "newrt|start|fb\n\
         mse|9|3|127.0.0.1:21121\n\
         mse|9|-1|127.0.0.1:21122\n\
         newrt|end|2\n",
    );

    let send = |sub_id: i32, tag: &[u8]| {
        let mut m = sender.alloc_msg(16);
        m.mtype = 9;
        m.sub_id = sub_id;
        m.bytes2payload(tag).unwrap();
        sender.send_msg(m).expect("send");
    };

    send(3, b"x"); // exact entry
    send(4, b"y1"); // no (9,4) entry: falls back to the -1 entry
    send(-1, b"y2"); // unset goes to the -1 entry directly

    let got = expect_msg(&ep_x);
    assert_eq!(&got.payload()[..1], b"x");
    assert_eq!(got.sub_id, 3);

    let a = expect_msg(&ep_y);
    let b = expect_msg(&ep_y);
    assert_eq!(&a.payload()[..2], b"y1");
    assert_eq!(&b.payload()[..2], b"y2");
}

#[test]
fn multi_group_fanout_delivers_to_every_group() {
    let sender = ctx(21130);
    let rr_member = ctx(21131);
    let always = ctx(21132);

    sender.load_route_table(
        "newrt|start|fan\nrte|11|127.0.0.1:21131;127.0.0.1:21132\nnewrt|end|1\n",
    );

    let mut m = sender.alloc_msg(16);
    m.mtype = 11;
    m.str2payload("both").unwrap();
    sender.send_msg(m).expect("fanout send");

    // one copy lands in each group
    let a = expect_msg(&rr_member);
    let b = expect_msg(&always);
    assert_eq!(&a.payload()[..4], b"both");
    assert_eq!(&b.payload()[..4], b"both");
}

#[test]
fn rts_returns_on_the_arrival_connection() {
    let requester = ctx(21140);
    let responder = ctx(21141);

    // only the requester has a route; the responder answers blind
    requester.load_route_table("newrt|start|rts\nrte|5|127.0.0.1:21141\nnewrt|end|1\n");

    let mut m = requester.alloc_msg(64);
    m.mtype = 5;
    m.str2payload("question").unwrap();
    requester.send_msg(m).expect("send question");

    let mut q = expect_msg(&responder);
    assert_eq!(&q.payload()[..8], b"question");
    let asker = q.get_src();

    q.str2payload("answer").unwrap();
    q.mtype = 6;
    let back = responder.rts_msg(q).expect("rts");
    // the returned buffer carries the original sender identity again
    assert_eq!(back.get_src(), asker);

    let a = expect_msg(&requester);
    assert_eq!(a.mtype, 6);
    assert_eq!(&a.payload()[..6], b"answer");
    assert_eq!(a.get_src(), responder.my_name());
}

#[test]
fn send_without_route_reports_no_endpoint() {
    let sender = ctx(21150);
    sender.load_route_table("newrt|start|e\nrte|1|127.0.0.1:21151\nnewrt|end|1\n");

    let mut m = sender.alloc_msg(16);
    m.mtype = 99; // no entry for this type
    m.str2payload("lost").unwrap();
    let err = sender.send_msg(m).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoEndpoint);
    // the buffer comes back for reuse
    let back = err.into_msg().unwrap();
    assert_eq!(&back.payload()[..4], b"lost");
}

#[test]
fn poll_and_timed_receive() {
    let lonely = ctx(21160);
    let err = lonely.torcv_msg(0).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    let start = std::time::Instant::now();
    let err = lonely.torcv_msg(120).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(start.elapsed() >= std::time::Duration::from_millis(100));
}
