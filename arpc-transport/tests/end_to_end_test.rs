use std::sync::Arc;
use std::time::Duration;

use arpc_proto::SymphonyHeader;
use arpc_transport::congestion::{CcConfig, CcHandler};
use arpc_transport::flow::{FcConfig, FcHandler};
use arpc_transport::reliable::{ReliableConfig, ReliableHandler};
use arpc_transport::{
    ClientConfig, ElementChain, ElementContext, Role, RpcClient, RpcElement, RpcError, RpcServer,
    ServerConfig, TransportConfig, UdpTransport,
};

fn framed(public: &[u8]) -> Vec<u8> {
    SymphonyHeader {
        version: 1,
        offset_to_private: 0,
        service_id: 0,
        method_id: 0,
    }
    .frame(public, &[])
}

/// Server with an echo method at (1, 1), full reliable + CC + FC stack.
fn start_echo_server() -> (RpcServer, String) {
    let transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default()).unwrap();
    ReliableHandler::new(
        Role::Server,
        transport.sender().clone(),
        transport.timers().clone(),
        ReliableConfig::default(),
    )
    .register(transport.chains());
    CcHandler::new(
        Role::Server,
        transport.sender().clone(),
        transport.timers().clone(),
        CcConfig::default(),
    )
    .register(transport.chains(), Role::Server);
    FcHandler::new(
        Role::Server,
        transport.sender().clone(),
        transport.timers().clone(),
        FcConfig::default(),
    )
    .register(transport.chains(), Role::Server);

    let addr = transport.local_addr().unwrap().to_string();
    let server = RpcServer::new(transport, ElementChain::new(), ServerConfig::default());
    server.register_method(1, 1, Arc::new(|_ctx, req| Ok(req.to_vec())));
    server.register_method(
        1,
        2,
        Arc::new(|_ctx, _req| Err(RpcError::RemoteFail("kaboom".to_string()))),
    );
    server.start().unwrap();
    (server, addr)
}

fn make_client(addr: &str, elements: ElementChain) -> Arc<RpcClient> {
    let transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default()).unwrap();
    ReliableHandler::new(
        Role::Client,
        transport.sender().clone(),
        transport.timers().clone(),
        ReliableConfig::default(),
    )
    .register(transport.chains());
    CcHandler::new(
        Role::Client,
        transport.sender().clone(),
        transport.timers().clone(),
        CcConfig::default(),
    )
    .register(transport.chains(), Role::Client);
    FcHandler::new(
        Role::Client,
        transport.sender().clone(),
        transport.timers().clone(),
        FcConfig::default(),
    )
    .register(transport.chains(), Role::Client);
    RpcClient::new(
        transport,
        addr,
        elements,
        ClientConfig {
            call_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        },
    )
}

#[test]
fn test_round_trip_nine_bytes() {
    let (server, addr) = start_echo_server();
    let client = make_client(&addr, ElementChain::new());

    let payload: Vec<u8> = (0u8..9).collect();
    let request = framed(&payload);
    let response = client.call(1, 1, &request).unwrap();

    // Byte-for-byte echo, framing included, with the routing IDs stamped.
    let header = SymphonyHeader::parse(&response).unwrap();
    assert_eq!(header.service_id, 1);
    assert_eq!(header.method_id, 1);
    assert_eq!(&response[13..], &payload[..]);
    assert_eq!(response.len(), request.len());

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_round_trip_fragmented_payload() {
    let (server, addr) = start_echo_server();
    let client = make_client(&addr, ElementChain::new());

    // Well past one datagram: fragmentation and reassembly on both legs.
    let payload: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
    let request = framed(&payload);
    let response = client.call(1, 1, &request).unwrap();
    assert_eq!(&response[13..], &payload[..]);

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_sequential_calls_reuse_connection() {
    let (server, addr) = start_echo_server();
    let client = make_client(&addr, ElementChain::new());

    for i in 0..5u8 {
        let request = framed(&[i; 32]);
        let response = client.call(1, 1, &request).unwrap();
        assert_eq!(&response[13..], &[i; 32]);
    }

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_remote_error_surfaces() {
    let (server, addr) = start_echo_server();
    let client = make_client(&addr, ElementChain::new());

    let err = client.call(1, 2, &framed(b"boom")).unwrap_err();
    match err {
        RpcError::RemoteFail(message) => assert!(message.contains("kaboom")),
        other => panic!("expected remote failure, got {other}"),
    }

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_unknown_method_reports_error() {
    let (server, addr) = start_echo_server();
    let client = make_client(&addr, ElementChain::new());

    let err = client.call(9, 9, &framed(b"?")).unwrap_err();
    assert!(matches!(err, RpcError::RemoteFail(_)));

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_element_rejection_short_circuits() {
    struct Firewall;
    impl RpcElement for Firewall {
        fn process_request(
            &self,
            _ctx: &mut ElementContext,
            req: Vec<u8>,
        ) -> Result<Vec<u8>, RpcError> {
            if req.windows(4).any(|w| w == b"deny") {
                return Err(RpcError::ElementReject("denied by firewall".to_string()));
            }
            Ok(req)
        }
    }

    let (server, addr) = start_echo_server();
    let mut elements = ElementChain::new();
    elements.push(Arc::new(Firewall));
    let client = make_client(&addr, elements);

    let err = client.call(1, 1, &framed(b"deny this")).unwrap_err();
    assert!(matches!(err, RpcError::ElementReject(_)));

    // Clean payloads still pass.
    let response = client.call(1, 1, &framed(b"allow")).unwrap();
    assert_eq!(&response[13..], b"allow");

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_call_timeout_when_peer_absent() {
    // Nothing listens on this port.
    let client = make_client("127.0.0.1:1", ElementChain::new());
    let err = client
        .call_with_timeout(1, 1, &framed(b"x"), Duration::from_millis(300))
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));
    client.shutdown();
}
