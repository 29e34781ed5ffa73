//! Multi-threaded call correlation over loopback: concurrent callers on
//! distinct call ids each get their own response, regardless of the order
//! the responses come back in.

use msg_router::{Context, ErrorKind, InitFlags};
use std::sync::Arc;
use std::time::Duration;

fn ctx(port: u16) -> Arc<Context> {
    Arc::new(Context::init(Some(port), 0, InitFlags::NOTHREAD).expect("context init"))
}

#[test]
fn concurrent_calls_do_not_crosstalk() {
    let client = ctx(21200);
    let server = ctx(21201);

    client.load_route_table("newrt|start|c1\nrte|40|127.0.0.1:21201\nnewrt|end|1\n");

    // server: collect both requests first, then answer in reverse order
    // to force cross-delivery of the responses
    let server2 = server.clone();
    let server_thread = std::thread::spawn(move || {
        let mut pending = Vec::new();
        for _ in 0..2 {
            let m = server2.torcv_msg(5000).expect("server receive");
            pending.push(m);
        }
        pending.sort_by_key(|m| std::cmp::Reverse(m.get_xact()[0]));
        for mut m in pending {
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&m.payload()[..m.len()]);
            m.bytes2payload(&reply).unwrap();
            server2.rts_msg(m).expect("server rts");
        }
    });

    let call = |id: u8, xid: &'static str, body: &'static [u8]| {
        let client = client.clone();
        std::thread::spawn(move || {
            let mut m = client.alloc_msg(64);
            m.mtype = 40;
            m.str2xact(xid).unwrap();
            m.bytes2payload(body).unwrap();
            client.mt_call(m, id, 5000).expect("call response")
        })
    };

    let a = call(7, "AAAAAAAAAAAAAAAA", b"alpha");
    let b = call(8, "BBBBBBBBBBBBBBBB", b"beta");

    let ra = a.join().unwrap();
    let rb = b.join().unwrap();
    server_thread.join().unwrap();

    assert_eq!(&ra.payload()[..8], b"re:alpha");
    assert_eq!(&ra.get_xact()[..16], b"AAAAAAAAAAAAAAAA");
    assert_eq!(&rb.payload()[..7], b"re:beta");
    assert_eq!(&rb.get_xact()[..16], b"BBBBBBBBBBBBBBBB");
}

#[test]
fn call_times_out_without_responder() {
    let client = ctx(21210);
    let silent = ctx(21211);

    client.load_route_table("newrt|start|c2\nrte|41|127.0.0.1:21211\nnewrt|end|1\n");

    let mut m = client.alloc_msg(32);
    m.mtype = 41;
    m.str2xact("never-answered").unwrap();
    m.str2payload("hello?").unwrap();

    let start = std::time::Instant::now();
    let err = client.mt_call(m, 9, 250).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(200));

    // the request did arrive; the server just never answered
    let got = silent.torcv_msg(2000).expect("request delivered");
    assert_eq!(got.mtype, 41);
}

#[test]
fn call_id_range_is_enforced() {
    let client = ctx(21220);
    let m = client.alloc_msg(16);
    let err = client.mt_call(m, 1, 100).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadArg);
    assert!(err.msg.is_some(), "buffer is handed back on bad args");
}

#[test]
fn call_send_failure_returns_buffer() {
    let client = ctx(21230);
    // no route table at all
    let mut m = client.alloc_msg(16);
    m.mtype = 1;
    m.str2payload("undeliverable").unwrap();
    let err = client.mt_call(m, 5, 100).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoEndpoint);
    let back = err.msg.expect("failed request returned");
    assert_eq!(&back.payload()[..13], b"undeliverable");
}

#[test]
fn rcv_specific_queues_nonmatching() {
    let sender = ctx(21240);
    let receiver = ctx(21241);

    sender.load_route_table("newrt|start|c3\nrte|42|127.0.0.1:21241\nnewrt|end|1\n");

    for xid in ["one-transaction-", "two-transaction-"] {
        let mut m = sender.alloc_msg(32);
        m.mtype = 42;
        m.str2xact(xid).unwrap();
        m.str2payload(xid).unwrap();
        sender.send_msg(m).expect("send");
    }

    // give both messages time to queue, then ask for the second one
    std::thread::sleep(Duration::from_millis(300));
    let got = receiver
        .rcv_specific(b"two-transaction-", 4)
        .expect("specific receive");
    assert_eq!(&got.payload()[..16], b"two-transaction-");

    // the non-matching message went back on the ring
    let other = receiver.torcv_msg(1000).expect("requeued message");
    assert_eq!(&other.payload()[..16], b"one-transaction-");
}
