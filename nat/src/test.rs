// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#[cfg(test)]
mod tests {
    use crate::mangle::MangleError;
    use crate::seqadj::SeqOffset;
    use crate::stats::testing::CountingRecorder;
    use crate::{
        BindingError, BindingRequest, ConnDirection, ConnTable, Endpoint, ExpectTemplate,
        HelperContext, HelperError, HookPoint, ManipType, Mapping, NatConfig, NatEngine, NatPort,
        RegistryError, Tuple, TupleMask, Verdict,
    };
    use etherparse::IpNumber;
    use net::buffer::TestBuffer;
    use net::checksum::ChecksumMut;
    use net::icmp4::icmp_type;
    use net::packet::test_utils::{
        TcpTemplate, checksums_valid, icmp_echo_bytes, icmp_error_bytes, packet_from_bytes, sock,
        udp_bytes,
    };
    use net::packet::{DoneReason, InterfaceId, Packet};
    use net::route::{Route, RouteKey};
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex, mpsc};
    use std::thread;
    use std::time::Duration;
    use tracing_test::traced_test;

    const PUBLIC: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
    const WEB_SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const SYN_OPTIONS: [u8; 8] = [2, 4, 0x05, 0xb4, 4, 2, 1, 1];

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().expect("Bad IPv4 address")
    }

    fn tcp_tuple(src: &str, dst: &str) -> Tuple {
        let (src, dst) = (sock(src), sock(dst));
        Tuple::new(
            IpNumber::TCP,
            Endpoint::new(*src.ip(), src.port()),
            Endpoint::new(*dst.ip(), dst.port()),
        )
    }

    /// Masquerade 10.0.0.0/8 behind [`PUBLIC`] (port + 30000), forward [`PUBLIC`]:8080 to the
    /// web server.
    fn resolve(req: &BindingRequest) -> Result<Option<Mapping>, BindingError> {
        let t = req.tuple;
        match req.manip {
            ManipType::Src if t.src.addr.octets()[0] == 10 => {
                let port = NatPort::for_protocol(t.proto, t.src.port.wrapping_add(30000))
                    .map_err(|e| BindingError::Refused(e.to_string()))?;
                Ok(Some(Mapping::new(PUBLIC, Some(port))))
            }
            ManipType::Dst if t.dst == Endpoint::new(PUBLIC, 8080) => Ok(Some(Mapping::new(
                WEB_SERVER,
                NatPort::new_port_checked(80).ok(),
            ))),
            ManipType::Src | ManipType::Dst => Ok(None),
        }
    }

    static RESOLVER_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_resolve(req: &BindingRequest) -> Result<Option<Mapping>, BindingError> {
        RESOLVER_CALLS.fetch_add(1, Ordering::Relaxed);
        resolve(req)
    }

    static CONCURRENT_RESOLVER_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn concurrent_resolve(req: &BindingRequest) -> Result<Option<Mapping>, BindingError> {
        CONCURRENT_RESOLVER_CALLS.fetch_add(1, Ordering::Relaxed);
        resolve(req)
    }

    /// Everything but 198.51.100.0/24 is reachable through interface 2
    fn route(key: &RouteKey) -> Option<Arc<Route>> {
        (key.dst.octets()[..3] != [198, 51, 100]).then(|| {
            Arc::new(Route {
                oif: InterfaceId::new(2),
                gateway: None,
            })
        })
    }

    fn engine(config: NatConfig) -> (Arc<ConnTable>, NatEngine<TestBuffer>) {
        let table = Arc::new(ConnTable::new(config.expect_timeout));
        let engine = NatEngine::new(config, table.clone(), resolve, route).unwrap();
        (table, engine)
    }

    /// Pass a packet through the forwarding path
    fn forward(engine: &NatEngine<TestBuffer>, packet: &mut Packet<TestBuffer>) -> Verdict {
        match engine.hook(
            HookPoint::PreRouting,
            packet,
            Some(InterfaceId::new(1)),
            None,
        ) {
            Verdict::Accept => engine.hook(
                HookPoint::PostRouting,
                packet,
                None,
                Some(InterfaceId::new(2)),
            ),
            verdict => verdict,
        }
    }

    /// Pass a packet generated by the local host through the output path
    fn local_out(engine: &NatEngine<TestBuffer>, packet: &mut Packet<TestBuffer>) -> Verdict {
        match engine.hook(HookPoint::LocalOut, packet, None, None) {
            Verdict::Accept => engine.hook(HookPoint::PostRouting, packet, None, None),
            verdict => verdict,
        }
    }

    /// Pass a packet addressed to the local host through the input path
    fn deliver(engine: &NatEngine<TestBuffer>, packet: &mut Packet<TestBuffer>) -> Verdict {
        engine.hook(
            HookPoint::PreRouting,
            packet,
            Some(InterfaceId::new(1)),
            None,
        )
    }

    /// Helper match on the destination port of TCP connections
    fn on_port(port: u16) -> Tuple {
        Tuple::new(
            IpNumber::TCP,
            Endpoint::new(Ipv4Addr::UNSPECIFIED, 0),
            Endpoint::new(Ipv4Addr::UNSPECIFIED, port),
        )
    }

    fn parse_port_command(args: &[u8]) -> Option<Endpoint> {
        let text = std::str::from_utf8(args).ok()?;
        let numbers = text
            .split(',')
            .map(|n| n.parse::<u8>().ok())
            .collect::<Option<Vec<u8>>>()?;
        let [a, b, c, d, hi, lo] = numbers[..] else {
            return None;
        };
        Some(Endpoint::new(
            Ipv4Addr::new(a, b, c, d),
            u16::from_be_bytes([hi, lo]),
        ))
    }

    /// Active mode FTP: expect the data connection announced by PORT and announce the
    /// translated endpoint instead.
    fn port_helper(
        ctx: &HelperContext<'_>,
        packet: &mut Packet<TestBuffer>,
    ) -> Result<Verdict, HelperError> {
        if ctx.info.dir != ConnDirection::Original {
            return Ok(Verdict::Accept);
        }
        let payload = packet
            .tcp()
            .map_err(MangleError::from)?
            .payload()
            .to_vec();
        let Some(args) = payload.strip_prefix(b"PORT ") else {
            return Ok(Verdict::Accept);
        };
        let len = args
            .iter()
            .position(|&b| b == b'\r')
            .ok_or_else(|| HelperError::Protocol("unterminated PORT command".to_string()))?;
        let announced = parse_port_command(&args[..len])
            .ok_or_else(|| HelperError::Protocol("malformed PORT command".to_string()))?;
        let reply = ctx.conn.tuple(ConnDirection::Reply);
        let expected = ctx.expect(&ExpectTemplate {
            tuple: Tuple::new(
                IpNumber::TCP,
                Endpoint::new(reply.src.addr, 0),
                Endpoint::new(reply.dst.addr, announced.port),
            ),
            mask: TupleMask::any_src_port(),
            saved: Some(announced),
        })?;
        let [a, b, c, d] = expected.dst.addr.octets();
        let [hi, lo] = expected.dst.port.to_be_bytes();
        let text = format!("{a},{b},{c},{d},{hi},{lo}");
        ctx.mangle_tcp(packet, 5, len, text.as_bytes())?;
        Ok(Verdict::Accept)
    }

    /// Grow "EDIT" commands by 8 octets
    fn edit_helper(
        ctx: &HelperContext<'_>,
        packet: &mut Packet<TestBuffer>,
    ) -> Result<Verdict, HelperError> {
        let is_edit = packet
            .tcp()
            .map_err(MangleError::from)?
            .payload()
            .starts_with(b"EDIT");
        if ctx.info.dir == ConnDirection::Original && is_edit {
            ctx.mangle_tcp(packet, 12, 10, b"eighteen-octets!!!")?;
        }
        Ok(Verdict::Accept)
    }

    fn inflate_helper(
        ctx: &HelperContext<'_>,
        packet: &mut Packet<TestBuffer>,
    ) -> Result<Verdict, HelperError> {
        let empty = packet
            .tcp()
            .map_err(MangleError::from)?
            .payload()
            .is_empty();
        if ctx.info.dir == ConnDirection::Original && !empty {
            ctx.mangle_tcp(packet, 0, 1, &[b'x'; 65535])?;
        }
        Ok(Verdict::Accept)
    }

    fn refuse_helper(
        _: &HelperContext<'_>,
        packet: &mut Packet<TestBuffer>,
    ) -> Result<Verdict, HelperError> {
        let bad = packet
            .tcp()
            .map_err(MangleError::from)?
            .payload()
            .starts_with(b"BAD");
        Ok(if bad { Verdict::Drop } else { Verdict::Accept })
    }

    /// SYN (seq 999) and SYN-ACK (seq 4999); the client's source is masqueraded
    fn handshake(engine: &NatEngine<TestBuffer>, client: SocketAddrV4, server: SocketAddrV4) {
        let mut syn = TcpTemplate::new(client, server).seq(999).syn().packet();
        assert_eq!(forward(engine, &mut syn), Verdict::Accept);
        let public = SocketAddrV4::new(PUBLIC, client.port() + 30000);
        assert_eq!(syn.ipv4().unwrap().source(), PUBLIC);
        assert_eq!(syn.tcp().unwrap().source(), public.port());

        let mut syn_ack = TcpTemplate::new(server, public)
            .seq(4999)
            .syn()
            .ack(1000)
            .packet();
        assert_eq!(forward(engine, &mut syn_ack), Verdict::Accept);
        assert_eq!(syn_ack.ipv4().unwrap().destination(), *client.ip());
        assert_eq!(syn_ack.tcp().unwrap().destination(), client.port());
    }

    fn option_kinds(packet: &Packet<TestBuffer>) -> Vec<u8> {
        packet.tcp().unwrap().options().map(|o| o.kind).collect()
    }

    #[test]
    #[traced_test]
    fn active_mode_data_connection() {
        let (table, engine) = engine(NatConfig::default());
        engine
            .helpers()
            .register(on_port(21), TupleMask::proto_dst_port(), "ftp", port_helper)
            .unwrap();
        let client = sock("10.0.0.1:1234");
        let server = sock("192.0.2.1:21");
        handshake(&engine, client, server);

        let recorder = CountingRecorder::default();
        let mut command = TcpTemplate::new(client, server)
            .seq(1000)
            .ack(5000)
            .payload(b"PORT 10,0,0,1,19,137\r\n")
            .packet();
        let verdict = metrics::with_local_recorder(&recorder, || forward(&engine, &mut command));
        assert_eq!(verdict, Verdict::Accept);
        let tcp = command.tcp().unwrap();
        assert_eq!(tcp.payload(), b"PORT 203,0,113,1,19,137\r\n");
        assert_eq!(tcp.sequence(), 1000);
        assert!(checksums_valid(&command));
        assert_eq!(table.expectation_count(), 1);
        assert_eq!(
            recorder.get("natalg_nat_expectations_total{result=ok}"),
            1
        );
        assert_eq!(recorder.get("natalg_nat_mangles_total{proto=tcp}"), 1);

        // the server acknowledges the longer command
        let mut ack = TcpTemplate::new(server, sock("203.0.113.1:31234"))
            .seq(5000)
            .ack(1000 + 25)
            .packet();
        assert_eq!(forward(&engine, &mut ack), Verdict::Accept);
        assert_eq!(ack.tcp().unwrap().acknowledgment(), 1000 + 22);
        assert!(checksums_valid(&ack));

        // the next command is shifted by the growth
        let mut list = TcpTemplate::new(client, server)
            .seq(1022)
            .ack(5000)
            .payload(b"LIST\r\n")
            .packet();
        assert_eq!(forward(&engine, &mut list), Verdict::Accept);
        assert_eq!(list.tcp().unwrap().sequence(), 1025);
        assert!(checksums_valid(&list));

        // the server opens the data connection to the announced endpoint
        let mut data = TcpTemplate::new(sock("192.0.2.1:20"), sock("203.0.113.1:5001"))
            .syn()
            .packet();
        assert_eq!(forward(&engine, &mut data), Verdict::Accept);
        assert_eq!(data.ipv4().unwrap().source(), addr("192.0.2.1"));
        assert_eq!(data.ipv4().unwrap().destination(), addr("10.0.0.1"));
        assert_eq!(data.tcp().unwrap().source(), 20);
        assert_eq!(data.tcp().unwrap().destination(), 5001);
        assert!(checksums_valid(&data));
        assert_eq!(table.expectation_count(), 0);

        let (conn, dir) = table
            .get(&tcp_tuple("192.0.2.1:20", "203.0.113.1:5001"))
            .unwrap();
        assert_eq!(dir, ConnDirection::Original);
        assert!(conn.is_expected());
        assert_eq!(conn.nat.helper(), None);
        assert_eq!(
            conn.tuple(ConnDirection::Reply),
            tcp_tuple("10.0.0.1:5001", "192.0.2.1:20")
        );

        let mut data_reply = TcpTemplate::new(sock("10.0.0.1:5001"), sock("192.0.2.1:20"))
            .syn()
            .ack(1001)
            .packet();
        assert_eq!(forward(&engine, &mut data_reply), Verdict::Accept);
        assert_eq!(data_reply.ipv4().unwrap().source(), PUBLIC);
        assert_eq!(data_reply.tcp().unwrap().source(), 5001);
        assert!(checksums_valid(&data_reply));

        // expectations are single use
        let mut other = TcpTemplate::new(sock("192.0.2.1:2020"), sock("203.0.113.1:5001"))
            .syn()
            .packet();
        assert_eq!(forward(&engine, &mut other), Verdict::Accept);
        assert_eq!(other.ipv4().unwrap().destination(), PUBLIC);
        let (other, _) = table
            .get(&tcp_tuple("192.0.2.1:2020", "203.0.113.1:5001"))
            .unwrap();
        assert!(!other.is_expected());
    }

    #[test]
    #[traced_test]
    fn length_changing_rewrite_shifts_sequence_space() {
        let (table, engine) = engine(NatConfig::default());
        engine
            .helpers()
            .register(on_port(7000), TupleMask::proto_dst_port(), "edit", edit_helper)
            .unwrap();
        let client = sock("10.0.0.1:1234");
        let server = sock("192.0.2.1:7000");
        let public = sock("203.0.113.1:31234");
        handshake(&engine, client, server);

        let segment = |seq: u32, payload: &[u8]| {
            TcpTemplate::new(client, server)
                .seq(seq)
                .ack(5000)
                .payload(payload)
                .packet()
        };

        let mut edit = segment(1000, b"EDIT 000000 0123456789\r\n");
        assert_eq!(forward(&engine, &mut edit), Verdict::Accept);
        let tcp = edit.tcp().unwrap();
        assert_eq!(tcp.payload(), b"EDIT 000000 eighteen-octets!!!\r\n");
        assert_eq!(tcp.sequence(), 1000);
        assert!(checksums_valid(&edit));

        let (conn, _) = table.get(&tcp_tuple("10.0.0.1:1234", "192.0.2.1:7000")).unwrap();
        let expected = SeqOffset {
            correction_pos: 1000,
            offset_before: 0,
            offset_after: 8,
        };
        assert_eq!(conn.nat.seq_offsets(ConnDirection::Original).0, expected);

        // after the edit: shifted
        let mut later = segment(1100, b"");
        assert_eq!(forward(&engine, &mut later), Verdict::Accept);
        assert_eq!(later.tcp().unwrap().sequence(), 1108);
        assert!(checksums_valid(&later));

        // before the edit: untouched
        let mut earlier = segment(995, b"");
        assert_eq!(forward(&engine, &mut earlier), Verdict::Accept);
        assert_eq!(earlier.tcp().unwrap().sequence(), 995);

        // the peer acknowledges in the shifted space
        let mut ack = TcpTemplate::new(server, public).seq(5000).ack(1032).packet();
        assert_eq!(forward(&engine, &mut ack), Verdict::Accept);
        assert_eq!(ack.tcp().unwrap().acknowledgment(), 1024);
        assert!(checksums_valid(&ack));

        // a retransmission is rewritten again but not accounted twice
        let mut retransmit = segment(1000, b"EDIT 000000 0123456789\r\n");
        assert_eq!(forward(&engine, &mut retransmit), Verdict::Accept);
        assert_eq!(
            retransmit.tcp().unwrap().payload(),
            b"EDIT 000000 eighteen-octets!!!\r\n"
        );
        assert_eq!(retransmit.tcp().unwrap().sequence(), 1000);
        assert_eq!(conn.nat.seq_offsets(ConnDirection::Original).0, expected);
    }

    #[test]
    fn locally_delivered_replies_are_adjusted() {
        let (_, engine) = engine(NatConfig::default());
        engine
            .helpers()
            .register(on_port(7000), TupleMask::proto_dst_port(), "edit", edit_helper)
            .unwrap();
        let client = sock("10.0.0.9:4000");
        let server = sock("192.0.2.1:7000");
        let public = sock("203.0.113.1:34000");

        let mut syn = TcpTemplate::new(client, server).seq(999).syn().packet();
        assert_eq!(local_out(&engine, &mut syn), Verdict::Accept);
        assert_eq!(syn.ipv4().unwrap().source(), PUBLIC);
        let mut syn_ack = TcpTemplate::new(server, public)
            .seq(4999)
            .syn()
            .ack(1000)
            .packet();
        assert_eq!(deliver(&engine, &mut syn_ack), Verdict::Accept);
        assert_eq!(syn_ack.ipv4().unwrap().destination(), *client.ip());

        let mut edit = TcpTemplate::new(client, server)
            .seq(1000)
            .ack(5000)
            .payload(b"EDIT 000000 0123456789\r\n")
            .packet();
        assert_eq!(local_out(&engine, &mut edit), Verdict::Accept);
        assert_eq!(
            edit.tcp().unwrap().payload(),
            b"EDIT 000000 eighteen-octets!!!\r\n"
        );

        // the reply never reaches post-routing
        let mut ack = TcpTemplate::new(server, public).seq(5000).ack(1032).packet();
        assert_eq!(deliver(&engine, &mut ack), Verdict::Accept);
        assert_eq!(ack.ipv4().unwrap().destination(), *client.ip());
        assert_eq!(ack.tcp().unwrap().destination(), client.port());
        assert_eq!(ack.tcp().unwrap().acknowledgment(), 1024);
        assert!(checksums_valid(&ack));
    }

    #[test]
    #[traced_test]
    fn rewrite_behind_the_correction_window_is_reported() {
        let (table, engine) = engine(NatConfig::default());
        engine
            .helpers()
            .register(on_port(7000), TupleMask::proto_dst_port(), "edit", edit_helper)
            .unwrap();
        let client = sock("10.0.0.1:1234");
        let server = sock("192.0.2.1:7000");
        handshake(&engine, client, server);

        let segment = |seq: u32| {
            TcpTemplate::new(client, server)
                .seq(seq)
                .ack(5000)
                .payload(b"EDIT 000000 0123456789\r\n")
                .packet()
        };
        let mut edit = segment(1000);
        assert_eq!(forward(&engine, &mut edit), Verdict::Accept);
        let (conn, _) = table.get(&tcp_tuple("10.0.0.1:1234", "192.0.2.1:7000")).unwrap();
        let recorded = conn.nat.seq_offsets(ConnDirection::Original).0;
        assert!(!logs_contain("behind the correction window"));

        // an older segment is rewritten too, but its growth cannot be accounted for
        let mut older = segment(990);
        assert_eq!(forward(&engine, &mut older), Verdict::Accept);
        assert_eq!(
            older.tcp().unwrap().payload(),
            b"EDIT 000000 eighteen-octets!!!\r\n"
        );
        assert_eq!(older.tcp().unwrap().sequence(), 990);
        assert!(checksums_valid(&older));
        assert!(logs_contain(
            "original rewrite behind the correction window, sequence space not adjusted"
        ));
        assert_eq!(conn.nat.seq_offsets(ConnDirection::Original).0, recorded);
    }

    #[test]
    #[traced_test]
    fn unregistering_a_helper_tears_down_its_connections() {
        let (table, engine) = engine(NatConfig::default());
        let helpers = engine.helpers();
        let id = helpers
            .register(on_port(21), TupleMask::proto_dst_port(), "ftp", port_helper)
            .unwrap();
        assert!(matches!(
            helpers.register(on_port(21), TupleMask::proto_dst_port(), "ftp-again", port_helper),
            Err(RegistryError::AlreadyRegistered { existing, .. }) if existing == id
        ));

        let client = sock("10.0.0.1:1234");
        let server = sock("192.0.2.1:21");
        handshake(&engine, client, server);
        let mut web = TcpTemplate::new(sock("10.0.0.2:4321"), sock("192.0.2.1:80"))
            .syn()
            .packet();
        assert_eq!(forward(&engine, &mut web), Verdict::Accept);
        assert_eq!(table.len(), 2);

        let recorder = CountingRecorder::default();
        let torn_down =
            metrics::with_local_recorder(&recorder, || helpers.unregister(id)).unwrap();
        assert_eq!(torn_down, 1);
        assert_eq!(recorder.get("natalg_nat_helper_teardowns_total"), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(helpers.unregister(id), Err(RegistryError::NotRegistered(id)));

        // the connection is gone and its next segment is not an initial SYN
        let mut late = TcpTemplate::new(client, server)
            .seq(1000)
            .ack(5000)
            .payload(b"NOOP\r\n")
            .packet();
        assert_eq!(forward(&engine, &mut late), Verdict::Drop);
        assert_eq!(late.done_reason(), Some(DoneReason::Untracked));
        assert!(logs_contain("dropping packet (untracked)"));

        let again = helpers
            .register(on_port(21), TupleMask::proto_dst_port(), "ftp", port_helper)
            .unwrap();
        assert_ne!(again, id);
    }

    #[test]
    fn sack_permitted_stripped_for_helper_connections() {
        let (_, engine) = engine(NatConfig::default());
        engine
            .helpers()
            .register(on_port(21), TupleMask::proto_dst_port(), "ftp", port_helper)
            .unwrap();

        let mut syn = TcpTemplate::new(sock("10.0.0.1:1234"), sock("192.0.2.1:21"))
            .syn()
            .options(&SYN_OPTIONS)
            .packet();
        let len = syn.total_len();
        assert_eq!(forward(&engine, &mut syn), Verdict::Accept);
        assert_eq!(option_kinds(&syn), vec![2, 1, 1, 1, 1]);
        assert_eq!(syn.total_len(), len);
        assert!(checksums_valid(&syn));

        // no helper, nothing to strip
        let mut syn = TcpTemplate::new(sock("10.0.0.1:1235"), sock("192.0.2.1:80"))
            .syn()
            .options(&SYN_OPTIONS)
            .packet();
        assert_eq!(forward(&engine, &mut syn), Verdict::Accept);
        assert_eq!(option_kinds(&syn), vec![2, 4, 1, 1]);
    }

    #[test]
    fn sack_permitted_kept_when_disabled() {
        let (_, engine) = engine(NatConfig {
            strip_sack: false,
            ..NatConfig::default()
        });
        engine
            .helpers()
            .register(on_port(21), TupleMask::proto_dst_port(), "ftp", port_helper)
            .unwrap();
        let mut syn = TcpTemplate::new(sock("10.0.0.1:1234"), sock("192.0.2.1:21"))
            .syn()
            .options(&SYN_OPTIONS)
            .packet();
        assert_eq!(forward(&engine, &mut syn), Verdict::Accept);
        assert_eq!(option_kinds(&syn), vec![2, 4, 1, 1]);
    }

    #[test]
    fn bindings_are_computed_once() {
        let config = NatConfig::default();
        let table = Arc::new(ConnTable::new(config.expect_timeout));
        let engine: NatEngine<TestBuffer> =
            NatEngine::new(config, table.clone(), counting_resolve, route).unwrap();

        let syn = TcpTemplate::new(sock("10.0.0.1:1234"), sock("192.0.2.1:80"))
            .syn()
            .packet();
        let mut first = syn.share();
        assert_eq!(forward(&engine, &mut first), Verdict::Accept);
        // one call per manipulation
        assert_eq!(RESOLVER_CALLS.load(Ordering::Relaxed), 2);

        let mut retransmit = TcpTemplate::new(sock("10.0.0.1:1234"), sock("192.0.2.1:80"))
            .syn()
            .packet();
        assert_eq!(forward(&engine, &mut retransmit), Verdict::Accept);
        assert_eq!(RESOLVER_CALLS.load(Ordering::Relaxed), 2);
        assert_eq!(first.tcp().unwrap().source(), 31234);
        assert_eq!(retransmit.tcp().unwrap().source(), 31234);

        // the buffer was shared: the original packet is untouched
        assert_eq!(syn.tcp().unwrap().source(), 1234);

        let (conn, _) = table.get(&tcp_tuple("10.0.0.1:1234", "192.0.2.1:80")).unwrap();
        assert!(conn.nat.is_initialized(ManipType::Src));
        assert!(conn.nat.is_initialized(ManipType::Dst));
        assert!(conn.nat.is_translated(ManipType::Src));
        assert!(!conn.nat.is_translated(ManipType::Dst));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_first_packets_bind_once() {
        const THREADS: usize = 8;
        let config = NatConfig::default();
        let table = Arc::new(ConnTable::new(config.expect_timeout));
        let engine: NatEngine<TestBuffer> =
            NatEngine::new(config, table.clone(), concurrent_resolve, route).unwrap();
        let start = Barrier::new(THREADS);

        let ports: Vec<u16> = thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let mut syn =
                            TcpTemplate::new(sock("10.0.0.1:1234"), sock("192.0.2.1:80"))
                                .syn()
                                .packet();
                        start.wait();
                        assert_eq!(forward(&engine, &mut syn), Verdict::Accept);
                        assert!(checksums_valid(&syn));
                        syn.tcp().unwrap().source()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(ports, vec![31234; THREADS]);
        // one call per manipulation, whichever thread got there first
        assert_eq!(CONCURRENT_RESOLVER_CALLS.load(Ordering::Relaxed), 2);
        assert_eq!(table.len(), 1);
        let (conn, dir) = table
            .get(&tcp_tuple("192.0.2.1:80", "203.0.113.1:31234"))
            .unwrap();
        assert_eq!(dir, ConnDirection::Reply);
        assert!(table.get(&tcp_tuple("192.0.2.1:80", "10.0.0.1:1234")).is_none());
        assert!(conn.nat.is_translated(ManipType::Src));
    }

    #[test]
    fn unregister_waits_for_packets_in_flight() {
        let (table, engine) = engine(NatConfig::default());
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let gate = move |ctx: &HelperContext<'_>,
                         packet: &mut Packet<TestBuffer>|
              -> Result<Verdict, HelperError> {
            let hold = packet
                .tcp()
                .map_err(MangleError::from)?
                .payload()
                .starts_with(b"HOLD");
            if ctx.info.dir == ConnDirection::Original && hold {
                entered_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
            Ok(Verdict::Accept)
        };
        let id = engine
            .helpers()
            .register(on_port(7000), TupleMask::proto_dst_port(), "gate", gate)
            .unwrap();
        let client = sock("10.0.0.1:1234");
        let server = sock("192.0.2.1:7000");
        handshake(&engine, client, server);
        let (conn, _) = table.get(&tcp_tuple("10.0.0.1:1234", "192.0.2.1:7000")).unwrap();
        let unregistered = AtomicBool::new(false);

        thread::scope(|s| {
            let in_flight = s.spawn(|| {
                let mut packet = TcpTemplate::new(client, server)
                    .seq(1000)
                    .ack(5000)
                    .payload(b"HOLD\r\n")
                    .packet();
                forward(&engine, &mut packet)
            });
            entered.recv().unwrap();
            let unregister = s.spawn(|| {
                let torn_down = engine.helpers().unregister(id);
                unregistered.store(true, Ordering::Release);
                torn_down
            });

            // the helper is still running: the connection must outlive it
            thread::sleep(Duration::from_millis(100));
            let while_held = (unregistered.load(Ordering::Acquire), conn.is_dying());
            release.send(()).unwrap();

            assert_eq!(in_flight.join().unwrap(), Verdict::Accept);
            assert_eq!(unregister.join().unwrap(), Ok(1));
            assert_eq!(while_held, (false, false));
        });
        assert!(conn.is_dying());
        assert_eq!(table.len(), 0);
    }

    #[test]
    #[traced_test]
    fn oversized_rewrite_drops_the_packet() {
        let (table, engine) = engine(NatConfig::default());
        engine
            .helpers()
            .register(on_port(7000), TupleMask::proto_dst_port(), "inflate", inflate_helper)
            .unwrap();
        let client = sock("10.0.0.1:1234");
        let server = sock("192.0.2.1:7000");
        handshake(&engine, client, server);

        let recorder = CountingRecorder::default();
        let mut packet = TcpTemplate::new(client, server)
            .seq(1000)
            .ack(5000)
            .payload(b"grow\r\n")
            .packet();
        let verdict = metrics::with_local_recorder(&recorder, || forward(&engine, &mut packet));
        assert_eq!(verdict, Verdict::Drop);
        assert_eq!(packet.done_reason(), Some(DoneReason::TooLong));
        assert_eq!(packet.tcp().unwrap().payload(), b"grow\r\n");
        assert_eq!(recorder.get("natalg_nat_drops_total{reason=too_long}"), 1);

        let (conn, _) = table.get(&tcp_tuple("10.0.0.1:1234", "192.0.2.1:7000")).unwrap();
        assert!(conn.nat.seq_offsets(ConnDirection::Original).0.is_identity());
    }

    #[test]
    #[traced_test]
    fn helper_drop_verdict() {
        let (_, engine) = engine(NatConfig::default());
        engine
            .helpers()
            .register(on_port(25), TupleMask::proto_dst_port(), "refuse", refuse_helper)
            .unwrap();
        let client = sock("10.0.0.1:1234");
        let server = sock("192.0.2.1:25");
        handshake(&engine, client, server);

        let recorder = CountingRecorder::default();
        let mut packet = TcpTemplate::new(client, server)
            .seq(1000)
            .ack(5000)
            .payload(b"BAD command\r\n")
            .packet();
        let verdict = metrics::with_local_recorder(&recorder, || forward(&engine, &mut packet));
        assert_eq!(verdict, Verdict::Drop);
        assert_eq!(packet.done_reason(), Some(DoneReason::HelperFailure));
        assert_eq!(
            recorder.get("natalg_nat_drops_total{reason=helper_failure}"),
            1
        );
    }

    #[test]
    fn port_forward() {
        let (table, engine) = engine(NatConfig::default());
        let mut syn = TcpTemplate::new(sock("198.51.100.9:5000"), sock("203.0.113.1:8080"))
            .syn()
            .packet();
        assert_eq!(forward(&engine, &mut syn), Verdict::Accept);
        assert_eq!(syn.ipv4().unwrap().source(), addr("198.51.100.9"));
        assert_eq!(syn.ipv4().unwrap().destination(), WEB_SERVER);
        assert_eq!(syn.tcp().unwrap().source(), 5000);
        assert_eq!(syn.tcp().unwrap().destination(), 80);
        assert!(checksums_valid(&syn));

        let mut syn_ack = TcpTemplate::new(sock("10.0.0.5:80"), sock("198.51.100.9:5000"))
            .syn()
            .ack(1001)
            .packet();
        assert_eq!(forward(&engine, &mut syn_ack), Verdict::Accept);
        assert_eq!(syn_ack.ipv4().unwrap().source(), PUBLIC);
        assert_eq!(syn_ack.tcp().unwrap().source(), 8080);
        assert!(checksums_valid(&syn_ack));

        let (_, dir) = table
            .get(&tcp_tuple("10.0.0.5:80", "198.51.100.9:5000"))
            .unwrap();
        assert_eq!(dir, ConnDirection::Reply);
    }

    #[test]
    fn icmp_error_follows_the_binding() {
        let (_, engine) = engine(NatConfig::default());
        let sent = udp_bytes(sock("10.0.0.1:1000"), sock("192.0.2.1:53"), b"query");
        let mut query = packet_from_bytes(&sent);
        assert_eq!(forward(&engine, &mut query), Verdict::Accept);
        assert_eq!(query.ipv4().unwrap().source(), PUBLIC);
        assert_eq!(query.udp().unwrap().source(), 31000);
        assert!(checksums_valid(&query));

        let mut error = packet_from_bytes(&icmp_error_bytes(
            addr("198.51.100.1"),
            PUBLIC,
            icmp_type::DEST_UNREACHABLE,
            3,
            query.data(),
        ));
        assert_eq!(forward(&engine, &mut error), Verdict::Accept);
        assert_eq!(error.ipv4().unwrap().source(), addr("198.51.100.1"));
        assert_eq!(error.ipv4().unwrap().destination(), addr("10.0.0.1"));
        assert!(checksums_valid(&error));
        let quoted = error.icmp4().unwrap().payload().to_vec();
        assert_eq!(quoted, sent[..quoted.len()]);
    }

    #[test]
    #[traced_test]
    fn corrupted_icmp_error_is_dropped() {
        let (_, engine) = engine(NatConfig::default());
        let mut query = packet_from_bytes(&udp_bytes(
            sock("10.0.0.1:1000"),
            sock("192.0.2.1:53"),
            b"query",
        ));
        assert_eq!(forward(&engine, &mut query), Verdict::Accept);

        let mut bytes = icmp_error_bytes(
            addr("198.51.100.1"),
            PUBLIC,
            icmp_type::DEST_UNREACHABLE,
            3,
            query.data(),
        );
        bytes[22] ^= 0xff;
        let mut error = packet_from_bytes(&bytes);
        assert_eq!(forward(&engine, &mut error), Verdict::Drop);
        assert_eq!(error.done_reason(), Some(DoneReason::Malformed));
        assert!(logs_contain("pre-routing: dropping packet (malformed)"));
    }

    #[test]
    fn echo_identifier_translated() {
        let (_, engine) = engine(NatConfig::default());
        let mut request = packet_from_bytes(&icmp_echo_bytes(
            addr("10.0.0.1"),
            addr("192.0.2.1"),
            77,
            1,
        ));
        assert_eq!(forward(&engine, &mut request), Verdict::Accept);
        assert_eq!(request.ipv4().unwrap().source(), PUBLIC);
        assert_eq!(request.icmp4().unwrap().identifier(), 30077);
        assert!(checksums_valid(&request));

        let mut reply = packet_from_bytes(&icmp_echo_bytes(addr("192.0.2.1"), PUBLIC, 30077, 1));
        reply.data_mut().unwrap()[20] = icmp_type::ECHO_REPLY;
        reply.icmp4_mut().unwrap().update_checksum(&()).unwrap();
        assert_eq!(forward(&engine, &mut reply), Verdict::Accept);
        assert_eq!(reply.ipv4().unwrap().destination(), addr("10.0.0.1"));
        assert_eq!(reply.icmp4().unwrap().identifier(), 77);
        assert!(checksums_valid(&reply));
    }

    #[test]
    fn local_output_is_rerouted_after_translation() {
        let (_, engine) = engine(NatConfig::default());
        let mut packet = TcpTemplate::new(sock("10.0.0.9:4000"), sock("192.0.2.1:80"))
            .syn()
            .packet();
        assert_eq!(
            engine.hook(HookPoint::LocalOut, &mut packet, None, None),
            Verdict::Accept
        );
        assert_eq!(packet.ipv4().unwrap().source(), PUBLIC);
        assert_eq!(packet.meta.oif, Some(InterfaceId::new(2)));
        assert_eq!(
            packet.meta.route.as_ref().map(|r| r.oif),
            Some(InterfaceId::new(2))
        );
        assert_eq!(
            engine.hook(HookPoint::PostRouting, &mut packet, None, None),
            Verdict::Accept
        );
        assert_eq!(packet.tcp().unwrap().source(), 34000);
        assert!(checksums_valid(&packet));

        // untranslated packets keep the route they came with
        let mut packet = TcpTemplate::new(sock("203.0.113.1:4000"), sock("192.0.2.1:80"))
            .syn()
            .packet();
        assert_eq!(
            engine.hook(HookPoint::LocalOut, &mut packet, None, None),
            Verdict::Accept
        );
        assert!(packet.meta.route.is_none());
    }

    #[test]
    #[traced_test]
    fn local_output_without_route_is_dropped() {
        let (_, engine) = engine(NatConfig::default());
        let mut packet = TcpTemplate::new(sock("10.0.0.9:4000"), sock("198.51.100.1:80"))
            .syn()
            .packet();
        assert_eq!(
            engine.hook(HookPoint::LocalOut, &mut packet, None, None),
            Verdict::Drop
        );
        assert_eq!(packet.done_reason(), Some(DoneReason::RouteFailure));
        assert!(logs_contain("local-out: dropping packet (route_failure)"));
    }
}
