//! End-to-end scenarios over the default loopback stack.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, Icmpv4Repr, Ipv4Address, Ipv4Packet};

use smolsock::{counters, module_init, InetAddr, MsgFlags, PollSet, Socket};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    module_init().unwrap();
}

fn lo(port: u16) -> InetAddr {
    InetAddr::v4(127, 0, 0, 1, port)
}

#[test]
fn udp_echo() {
    init();
    let rx_before = counters::get(counters::UDP_RX_BYTES).unwrap();
    let tx_before = counters::get(counters::UDP_TX_BYTES).unwrap();

    let mut a = Socket::open_udp().unwrap();
    a.bind(lo(5001)).unwrap();
    let mut b = Socket::open_udp().unwrap();
    b.bind(lo(5002)).unwrap();

    assert_eq!(
        b.send_to(b"ping", MsgFlags::empty(), Some(lo(5001))).unwrap(),
        4
    );

    let mut buf = [0u8; 16];
    let (n, from) = a.recv_from(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, Some(lo(5002)));

    assert!(counters::get(counters::UDP_RX_BYTES).unwrap() >= rx_before + 4);
    assert!(counters::get(counters::UDP_TX_BYTES).unwrap() >= tx_before + 4);
}

#[test]
fn udp_truncation_preserves_datagram_boundary() {
    init();
    let mut a = Socket::open_udp().unwrap();
    a.bind(lo(5003)).unwrap();
    let mut b = Socket::open_udp().unwrap();

    let payload = [0xabu8; 100];
    assert_eq!(
        b.send_to(&payload, MsgFlags::empty(), Some(lo(5003))).unwrap(),
        100
    );

    let mut buf = [0u8; 10];
    let (n, _) = a.recv_from(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(n, 10);
    assert_eq!(buf, [0xab; 10]);

    // The tail of the truncated datagram is gone; the next read blocks
    // until a fresh packet arrives.
    let (tx, rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 10];
        let n = a.read(&mut buf).unwrap();
        tx.send((n, buf)).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    assert_eq!(
        b.send_to(b"again", MsgFlags::empty(), Some(lo(5003))).unwrap(),
        5
    );
    let (n, buf) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"again");
    reader.join().unwrap();
}

#[test]
fn udp_drops_packets_while_one_is_held() {
    init();
    let mut a = Socket::open_udp().unwrap();
    a.bind(lo(5005)).unwrap();
    let mut b = Socket::open_udp().unwrap();

    b.send_to(b"first", MsgFlags::empty(), Some(lo(5005))).unwrap();
    // The slot is occupied, so this one is dropped on arrival.
    b.send_to(b"second", MsgFlags::empty(), Some(lo(5005))).unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = a.recv_from(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(&buf[..n], b"first");

    b.send_to(b"third", MsgFlags::empty(), Some(lo(5005))).unwrap();
    let (n, _) = a.recv_from(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(&buf[..n], b"third");
}

#[test]
fn tcp_round_trip() {
    init();
    let accepts_before = counters::get(counters::TCP_ACCEPTS).unwrap();
    let rx_before = counters::get(counters::TCP_RX_BYTES).unwrap();
    let tx_before = counters::get(counters::TCP_TX_BYTES).unwrap();

    let mut listener = Socket::open_tcp().unwrap();
    listener.bind(lo(6001)).unwrap();
    listener.listen(1).unwrap();

    let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    let sent = payload.clone();
    let client = thread::spawn(move || {
        let mut c = Socket::open_tcp().unwrap();
        c.connect(lo(6001)).unwrap();
        assert_eq!(c.write(&sent).unwrap(), 1500);
        // Keep the connection open until the server has read everything.
        c
    });

    let (mut server, peer) = listener.accept().unwrap();
    assert_eq!(peer.addr, Ipv4Address::new(127, 0, 0, 1));

    let mut buf = vec![0u8; 1500];
    assert_eq!(server.read(&mut buf).unwrap(), 1500);
    assert_eq!(buf, payload);

    client.join().unwrap();
    assert!(counters::get(counters::TCP_ACCEPTS).unwrap() >= accepts_before + 1);
    assert!(counters::get(counters::TCP_RX_BYTES).unwrap() >= rx_before + 1500);
    assert!(counters::get(counters::TCP_TX_BYTES).unwrap() >= tx_before + 1500);
}

#[test]
fn tcp_send_chunks_through_small_transmit_ring() {
    init();
    let tx_before = counters::get(counters::TCP_TX_BYTES).unwrap();

    let mut listener = Socket::open_tcp().unwrap();
    listener.bind(lo(6002)).unwrap();
    listener.listen(1).unwrap();

    let reader = thread::spawn(move || {
        let mut c = Socket::open_tcp().unwrap();
        c.connect(lo(6002)).unwrap();
        let mut collected = Vec::with_capacity(64 * 1024);
        let mut chunk = vec![0u8; 4096];
        for _ in 0..16 {
            assert_eq!(c.read(&mut chunk).unwrap(), 4096);
            collected.extend_from_slice(&chunk);
        }
        collected
    });

    let (mut server, _) = listener.accept().unwrap();
    let payload: Vec<u8> = (0..65536u32).map(|i| (i % 249) as u8).collect();
    // One call; the transmit ring takes it 2 KiB at a time.
    assert_eq!(server.write(&payload).unwrap(), 65536);

    let collected = reader.join().unwrap();
    assert_eq!(collected, payload);
    assert!(counters::get(counters::TCP_TX_BYTES).unwrap() >= tx_before + 65536);
}

#[test]
fn tcp_read_returns_zero_after_peer_close() {
    init();
    let mut listener = Socket::open_tcp().unwrap();
    listener.bind(lo(6003)).unwrap();
    listener.listen(1).unwrap();

    let client = thread::spawn(move || {
        let mut c = Socket::open_tcp().unwrap();
        c.connect(lo(6003)).unwrap();
        assert_eq!(c.write(b"bye").unwrap(), 3);
        c.close().unwrap();
    });

    let (mut server, _) = listener.accept().unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(server.read(&mut buf).unwrap(), 3);
    assert_eq!(&buf, b"bye");
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    client.join().unwrap();
}

#[test]
fn second_connect_refused_while_accept_pending() {
    init();
    let mut listener = Socket::open_tcp().unwrap();
    listener.bind(lo(6004)).unwrap();
    listener.listen(1).unwrap();

    let mut c1 = Socket::open_tcp().unwrap();
    c1.connect(lo(6004)).unwrap();

    // c1 occupies the single pending-connection slot; until accept
    // drains it the port has no listener and connects are refused.
    let mut c2 = Socket::open_tcp().unwrap();
    assert!(c2.connect(lo(6004)).is_err());

    let (server1, _) = listener.accept().unwrap();

    // accept re-armed the listener; a fresh connect succeeds.
    let mut c3 = Socket::open_tcp().unwrap();
    c3.connect(lo(6004)).unwrap();
    let (server2, _) = listener.accept().unwrap();

    drop((c1, c2, c3, server1, server2));
}

#[test]
fn raw_icmp_ping_over_loopback() {
    init();
    let tx_before = counters::get(counters::RAW_TX_BYTES).unwrap();
    let rx_before = counters::get(counters::RAW_RX_BYTES).unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let mut sock = Socket::open_raw().unwrap();
        started_tx.send(()).unwrap();
        // First the looped-back request, then the interface's reply.
        let mut packets = Vec::new();
        for _ in 0..2 {
            let mut buf = [0u8; 256];
            let (n, from) = sock.recv_from(&mut buf, MsgFlags::empty()).unwrap();
            packets.push((buf[..n].to_vec(), from));
        }
        packets
    });
    started_rx.recv().unwrap();
    // Let the reader park before the request flies.
    thread::sleep(Duration::from_millis(200));

    let mut sender = Socket::open_raw().unwrap();
    let echo = Icmpv4Repr::EchoRequest {
        ident: 0x22,
        seq_no: 1,
        data: b"ping-ping",
    };
    let mut request = vec![0u8; echo.buffer_len()];
    let mut packet = Icmpv4Packet::new_unchecked(&mut request[..]);
    echo.emit(&mut packet, &ChecksumCapabilities::default());

    assert_eq!(
        sender
            .send_to(&request, MsgFlags::empty(), Some(lo(0)))
            .unwrap(),
        request.len()
    );
    assert!(counters::get(counters::RAW_TX_BYTES).unwrap() >= tx_before + request.len() as u64);

    let packets = reader.join().unwrap();
    let reply = packets
        .iter()
        .find(|(frame, _)| {
            let ip = Ipv4Packet::new_checked(&frame[..]).unwrap();
            let icmp = Icmpv4Packet::new_unchecked(ip.payload());
            icmp.msg_type() == Icmpv4Message::EchoReply
        })
        .expect("no echo reply received");

    let (frame, from) = reply;
    assert_eq!(*from, Some(lo(0)));
    let ip = Ipv4Packet::new_checked(&frame[..]).unwrap();
    assert_eq!(ip.src_addr(), Ipv4Address::new(127, 0, 0, 1));
    let icmp = Icmpv4Packet::new_unchecked(ip.payload());
    assert_eq!(icmp.echo_ident(), 0x22);
    assert_eq!(icmp.data(), b"ping-ping");
    assert!(counters::get(counters::RAW_RX_BYTES).unwrap() > rx_before);
}

#[test]
fn module_init_is_idempotent_and_counters_monotonic() {
    init();
    module_init().unwrap();
    let first = counters::snapshot();
    assert_eq!(first.len(), 7);
    module_init().unwrap();
    let second = counters::snapshot();
    assert_eq!(second.len(), 7);
    for ((name_a, before), (name_b, after)) in first.iter().zip(second.iter()) {
        assert_eq!(name_a, name_b);
        assert!(after >= before);
    }
}

#[test]
fn poll_set_reports_the_readable_socket() {
    init();
    let mut a = Socket::open_udp().unwrap();
    a.bind(lo(5007)).unwrap();
    let mut b = Socket::open_udp().unwrap();
    b.bind(lo(5008)).unwrap();
    let mut c = Socket::open_udp().unwrap();

    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        c.send_to(b"wake", MsgFlags::empty(), Some(lo(5008))).unwrap();
        c
    });

    {
        let mut set = PollSet::new();
        set.add(&a).add(&b);
        assert_eq!(set.wait().unwrap(), 1);
    }
    let mut buf = [0u8; 8];
    assert_eq!(b.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"wake");

    // A socket that is already readable short-circuits the park.
    let mut c = sender.join().unwrap();
    c.send_to(b"more", MsgFlags::empty(), Some(lo(5007))).unwrap();
    {
        let mut set = PollSet::new();
        set.add(&a).add(&b);
        assert_eq!(set.wait().unwrap(), 0);
    }
    let (n, _) = a.recv_from(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(n, 4);
}
