//! End-to-end tests against mock nameservers on loopback.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, PTR};
use hickory_proto::rr::{Name, RData, Record as WireRecord, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use dns_stub::{
    Cache, Config, KnownHosts, Record, ResolutionError, SharedCache, StaticConfigLoader,
    StubResolver,
};

type Handler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

fn test_config(nameservers: Vec<SocketAddr>) -> Config {
    Config::new(nameservers)
        .unwrap()
        .with_timeout(Duration::from_millis(250))
}

fn wire_name(name: &str) -> Name {
    Name::from_ascii(name).unwrap()
}

fn a_record(name: &str, address: Ipv4Addr, ttl: u32) -> WireRecord {
    WireRecord::from_rdata(wire_name(name), ttl, RData::A(A(address)))
}

fn ptr_record(name: &str, target: &str, ttl: u32) -> WireRecord {
    WireRecord::from_rdata(wire_name(name), ttl, RData::PTR(PTR(wire_name(target))))
}

fn respond(
    request: &Message,
    answers: Vec<WireRecord>,
    rcode: ResponseCode,
    truncated: bool,
) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(rcode)
        .set_truncated(truncated);
    response.add_queries(request.queries().to_vec());
    response.add_answers(answers);
    response
}

fn answer(request: &Message, answers: Vec<WireRecord>) -> Message {
    respond(request, answers, ResponseCode::NoError, false)
}

async fn serve_udp(socket: UdpSocket, handler: Handler, hits: Arc<AtomicUsize>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (received, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => break,
        };
        hits.fetch_add(1, Ordering::SeqCst);
        let request = match Message::from_vec(&buf[..received]) {
            Ok(request) => request,
            Err(_) => continue,
        };
        if let Some(response) = handler(&request) {
            let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
        }
    }
}

async fn serve_tcp_connection(mut stream: TcpStream, handler: Handler, hits: Arc<AtomicUsize>) {
    loop {
        let expected = match stream.read_u16().await {
            Ok(length) => usize::from(length),
            Err(_) => break,
        };
        let mut buf = vec![0u8; expected];
        if stream.read_exact(&mut buf).await.is_err() {
            break;
        }
        hits.fetch_add(1, Ordering::SeqCst);
        let request = match Message::from_vec(&buf) {
            Ok(request) => request,
            Err(_) => break,
        };
        if let Some(response) = handler(&request) {
            let bytes = response.to_vec().unwrap();
            let length = u16::try_from(bytes.len()).unwrap();
            if stream.write_all(&length.to_be_bytes()).await.is_err() {
                break;
            }
            if stream.write_all(&bytes).await.is_err() {
                break;
            }
        }
    }
}

/// A UDP nameserver which answers with `handler` and counts requests.
async fn spawn_udp(handler: Handler) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = Arc::clone(&hits);
    tokio::spawn(async move { serve_udp(socket, handler, task_hits).await });

    (address, hits)
}

/// A nameserver reachable over both transports on the same port, with
/// separate handlers and request counters per transport.
async fn spawn_udp_tcp_pair(
    udp_handler: Handler,
    tcp_handler: Handler,
) -> (SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = listener.local_addr().unwrap();
    let socket = UdpSocket::bind(address).await.unwrap();

    let udp_hits = Arc::new(AtomicUsize::new(0));
    let task_hits = Arc::clone(&udp_hits);
    tokio::spawn(async move { serve_udp(socket, udp_handler, task_hits).await });

    let tcp_hits = Arc::new(AtomicUsize::new(0));
    let task_hits = Arc::clone(&tcp_hits);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let handler = Arc::clone(&tcp_handler);
            let hits = Arc::clone(&task_hits);
            tokio::spawn(async move { serve_tcp_connection(stream, handler, hits).await });
        }
    });

    (address, udp_hits, tcp_hits)
}

fn silent() -> Handler {
    Arc::new(|_request: &Message| None)
}

#[tokio::test]
async fn resolve_answers_ip_literals_inline() {
    // the nameserver is a port nothing listens on: a literal never needs it
    let resolver = StubResolver::with_config(test_config(vec!["127.0.0.1:1".parse().unwrap()]));

    let records = resolver.resolve("127.0.0.1", None).await.unwrap();
    assert_eq!(
        vec![Record::new("127.0.0.1".to_string(), RecordType::A, None)],
        records
    );

    let records = resolver.resolve("::1", None).await.unwrap();
    assert_eq!(
        vec![Record::new("::1".to_string(), RecordType::AAAA, None)],
        records
    );
}

#[tokio::test]
async fn resolve_rejects_literals_of_the_wrong_family() {
    let resolver = StubResolver::with_config(test_config(vec!["127.0.0.1:1".parse().unwrap()]));

    let result = resolver.resolve("::1", Some(RecordType::A)).await;
    assert!(matches!(
        result,
        Err(ResolutionError::LiteralFamilyMismatch { .. })
    ));
}

#[tokio::test]
async fn resolve_rejects_non_address_restrictions() {
    let resolver = StubResolver::with_config(test_config(vec!["127.0.0.1:1".parse().unwrap()]));

    let result = resolver.resolve("example.test", Some(RecordType::MX)).await;
    assert!(matches!(
        result,
        Err(ResolutionError::InvalidRestriction { .. })
    ));
}

#[tokio::test]
async fn resolve_prefers_hosts_table() {
    let (address, hits) = spawn_udp(silent()).await;
    let known_hosts = KnownHosts::deserialise("127.0.0.1 localhost\n::1 localhost\n");
    let config = test_config(vec![address]).with_known_hosts(known_hosts);
    let resolver = StubResolver::with_config(config);

    let records = resolver.resolve("LocalHost.", None).await.unwrap();
    assert_eq!(
        vec![
            Record::new("127.0.0.1".to_string(), RecordType::A, None),
            Record::new("::1".to_string(), RecordType::AAAA, None),
        ],
        records
    );

    let records = resolver
        .resolve("localhost", Some(RecordType::AAAA))
        .await
        .unwrap();
    assert_eq!(
        vec![Record::new("::1".to_string(), RecordType::AAAA, None)],
        records
    );

    assert_eq!(0, hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn query_returns_minimum_ttl_and_caches() {
    let handler: Handler = Arc::new(|request: &Message| {
        Some(answer(
            request,
            vec![
                a_record("example.test.", Ipv4Addr::new(1, 2, 3, 4), 60),
                a_record("example.test.", Ipv4Addr::new(5, 6, 7, 8), 90),
            ],
        ))
    });
    let (address, hits) = spawn_udp(handler).await;

    let cache = SharedCache::new();
    let loader = StaticConfigLoader::new(test_config(vec![address]));
    let resolver = StubResolver::with_parts(loader, cache.clone());

    let records = resolver.query("example.test", RecordType::A).await.unwrap();
    assert_eq!(
        vec![
            Record::new("1.2.3.4".to_string(), RecordType::A, Some(60)),
            Record::new("5.6.7.8".to_string(), RecordType::A, Some(60)),
        ],
        records
    );
    assert_eq!(1, hits.load(Ordering::SeqCst));

    let entry = cache.get("amphp.dns.example.test#1").await.unwrap();
    assert_eq!(Some(br#"["1.2.3.4","5.6.7.8"]"#.to_vec()), entry);

    // the second query is served from cache: no further traffic, no TTLs
    let records = resolver.query("example.test", RecordType::A).await.unwrap();
    assert_eq!(
        vec![
            Record::new("1.2.3.4".to_string(), RecordType::A, None),
            Record::new("5.6.7.8".to_string(), RecordType::A, None),
        ],
        records
    );
    assert_eq!(1, hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn query_cache_is_case_insensitive() {
    let handler: Handler = Arc::new(|request: &Message| {
        Some(answer(
            request,
            vec![a_record("cached.test.", Ipv4Addr::new(1, 1, 1, 1), 60)],
        ))
    });
    let (address, hits) = spawn_udp(handler).await;
    let resolver = StubResolver::with_config(test_config(vec![address]));

    resolver.query("CACHED.test", RecordType::A).await.unwrap();
    resolver.query("cached.test", RecordType::A).await.unwrap();

    assert_eq!(1, hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn truncated_udp_response_retries_over_tcp() {
    let udp_handler: Handler =
        Arc::new(|request: &Message| Some(respond(request, Vec::new(), ResponseCode::NoError, true)));
    let tcp_handler: Handler = Arc::new(|request: &Message| {
        Some(answer(
            request,
            vec![a_record("big.test.", Ipv4Addr::new(9, 9, 9, 9), 30)],
        ))
    });
    let (address, udp_hits, tcp_hits) = spawn_udp_tcp_pair(udp_handler, tcp_handler).await;

    // attempts = 1: the truncated reply must not consume the budget
    let config = test_config(vec![address]).with_attempts(1);
    let resolver = StubResolver::with_config(config);

    let records = resolver.query("big.test", RecordType::A).await.unwrap();
    assert_eq!(
        vec![Record::new("9.9.9.9".to_string(), RecordType::A, Some(30))],
        records
    );
    assert_eq!(1, udp_hits.load(Ordering::SeqCst));
    assert_eq!(1, tcp_hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn truncated_tcp_response_is_fatal() {
    let truncating: Handler =
        Arc::new(|request: &Message| Some(respond(request, Vec::new(), ResponseCode::NoError, true)));
    let (address, _, tcp_hits) = spawn_udp_tcp_pair(truncating.clone(), truncating).await;

    let resolver = StubResolver::with_config(test_config(vec![address]));

    let result = resolver.query("big.test", RecordType::A).await;
    assert!(matches!(result, Err(ResolutionError::Truncated)));
    assert_eq!(1, tcp_hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn error_response_code_is_fatal() {
    let (first, first_hits) = spawn_udp(silent()).await;
    let nx: Handler = Arc::new(|request: &Message| {
        Some(respond(request, Vec::new(), ResponseCode::NXDomain, false))
    });
    let (second, second_hits) = spawn_udp(nx).await;

    let config = test_config(vec![first, second]).with_attempts(4);
    let resolver = StubResolver::with_config(config);

    match resolver.query("missing.test", RecordType::A).await {
        Err(ResolutionError::ErrorResponse { rcode }) => {
            assert_eq!(ResponseCode::NXDomain, rcode);
        }
        other => panic!("expected an error response failure, got {other:?}"),
    }

    // the timeout on the first server consumed one attempt, the error
    // response on the second stopped the query outright
    assert_eq!(1, first_hits.load(Ordering::SeqCst));
    assert_eq!(1, second_hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn attempts_rotate_round_robin() {
    let (first, first_hits) = spawn_udp(silent()).await;
    let (second, second_hits) = spawn_udp(silent()).await;

    let config = test_config(vec![first, second]).with_attempts(4);
    let resolver = StubResolver::with_config(config);

    match resolver.query("slow.test", RecordType::A).await {
        Err(ResolutionError::NoResponse { attempts, .. }) => assert_eq!(4, attempts),
        other => panic!("expected an exhausted-attempts failure, got {other:?}"),
    }

    assert_eq!(2, first_hits.load(Ordering::SeqCst));
    assert_eq!(2, second_hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn absent_records_cache_negatively() {
    let empty: Handler = Arc::new(|request: &Message| Some(answer(request, Vec::new())));
    let (address, hits) = spawn_udp(empty).await;

    let cache = SharedCache::new();
    let loader = StaticConfigLoader::new(test_config(vec![address]));
    let resolver = StubResolver::with_parts(loader, cache.clone());

    let result = resolver.query("empty.test", RecordType::A).await;
    assert!(matches!(
        result,
        Err(ResolutionError::NoRecords { cached: false, .. })
    ));
    assert_eq!(1, hits.load(Ordering::SeqCst));

    let entry = cache.get("amphp.dns.empty.test#1").await.unwrap();
    assert_eq!(Some(b"[]".to_vec()), entry);

    let result = resolver.query("empty.test", RecordType::A).await;
    assert!(matches!(
        result,
        Err(ResolutionError::NoRecords { cached: true, .. })
    ));
    assert_eq!(1, hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unrestricted_resolve_tolerates_one_failing_family() {
    let handler: Handler = Arc::new(|request: &Message| {
        if request.queries()[0].query_type() == RecordType::A {
            Some(answer(
                request,
                vec![a_record("half.test.", Ipv4Addr::new(1, 1, 1, 1), 60)],
            ))
        } else {
            Some(answer(request, Vec::new()))
        }
    });
    let (address, _) = spawn_udp(handler).await;
    let resolver = StubResolver::with_config(test_config(vec![address]));

    let records = resolver.resolve("half.test", None).await.unwrap();
    assert_eq!(
        vec![Record::new("1.1.1.1".to_string(), RecordType::A, Some(60))],
        records
    );
}

#[tokio::test]
async fn unrestricted_resolve_aggregates_failures() {
    let failing: Handler = Arc::new(|request: &Message| {
        Some(respond(request, Vec::new(), ResponseCode::ServFail, false))
    });
    let (address, _) = spawn_udp(failing).await;
    let resolver = StubResolver::with_config(test_config(vec![address]));

    match resolver.resolve("gone.test", None).await {
        Err(ResolutionError::AllFailed { a, aaaa }) => {
            assert!(matches!(*a, ResolutionError::ErrorResponse { .. }));
            assert!(matches!(*aaaa, ResolutionError::ErrorResponse { .. }));
        }
        other => panic!("expected an aggregate failure, got {other:?}"),
    }
}

#[tokio::test]
async fn ptr_queries_for_literals_use_the_reverse_name() {
    let handler: Handler = Arc::new(|request: &Message| {
        let query = &request.queries()[0];
        if query.query_type() != RecordType::PTR
            || query.name().to_ascii() != "1.2.0.192.in-addr.arpa."
        {
            return None;
        }
        Some(answer(
            request,
            vec![ptr_record(
                "1.2.0.192.in-addr.arpa.",
                "host.example.test.",
                120,
            )],
        ))
    });
    let (address, _) = spawn_udp(handler).await;
    let resolver = StubResolver::with_config(test_config(vec![address]));

    let records = resolver.query("192.0.2.1", RecordType::PTR).await.unwrap();
    assert_eq!(
        vec![Record::new(
            "host.example.test".to_string(),
            RecordType::PTR,
            Some(120)
        )],
        records
    );
}

#[tokio::test]
async fn one_connection_per_nameserver_across_queries() {
    let handler: Handler = Arc::new(|request: &Message| {
        let name = request.queries()[0].name().to_ascii();
        Some(answer(
            request,
            vec![a_record(&name, Ipv4Addr::new(3, 3, 3, 3), 60)],
        ))
    });
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = socket.local_addr().unwrap();

    let peers = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
    let task_peers = Arc::clone(&peers);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (received, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => break,
            };
            task_peers.lock().unwrap().insert(peer);
            if let Ok(request) = Message::from_vec(&buf[..received]) {
                if let Some(response) = handler(&request) {
                    let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
                }
            }
        }
    });

    let resolver = StubResolver::with_config(test_config(vec![address]));
    resolver.query("one.test", RecordType::A).await.unwrap();
    resolver.query("two.test", RecordType::A).await.unwrap();

    // both queries went out the same socket: the registry reused the server
    assert_eq!(1, peers.lock().unwrap().len());
}
