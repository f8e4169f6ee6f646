#![cfg(feature = "quic")]

use std::{sync::Arc, time::Duration};

use dendrite::{
    common::Scheduler,
    config::{ClientConfig, RegistryConfig},
    registry::{Coordinator, MemoryRegistry},
    remoting::{
        ChannelRegistry, Client, Identity, QuicConfig, QuicServer,
        QuicTransport,
    },
    rpc::{
        CommandTable, Exporter, InvokerResolver, RpcCall, RpcCommand,
        RpcResponse, ServiceReference, TransportProtocol,
    },
    EndpointAddress, Error,
};

fn echo() -> RpcCommand {
    RpcCommand::new("echo::Echo", "echo", &["Vec<u8>"])
}

fn serve(identity: &Identity) -> QuicServer {
    let table = CommandTable::new();
    table
        .register(&echo(), |payload: Vec<u8>| async move {
            Ok::<_, Error>(payload)
        })
        .unwrap();
    QuicServer::bind(
        ([127, 0, 0, 1], 0).into(),
        identity,
        table,
        QuicConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn client_round_trip_over_quic() {
    let identity = Identity::self_signed(vec!["localhost".into()]).unwrap();
    let server = serve(&identity);
    let port = server.local_addr().unwrap().port();

    let transport = Arc::new(
        QuicTransport::new(identity.certificates(), QuicConfig::default())
            .unwrap(),
    );
    let client = Client::new(
        EndpointAddress::parse(&format!(
            "quic://127.0.0.1:{port}?serverName=localhost"
        ))
        .unwrap(),
        ClientConfig::default(),
        transport,
        ChannelRegistry::new(),
        Arc::new(Scheduler::current().unwrap()),
    );

    let call = RpcCall::new("g", echo(), b"over quic".to_vec());
    let response = client
        .request(&call)
        .get_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response, RpcResponse::value(b"over quic".to_vec()));
    assert!(client.is_connected());
    assert_eq!(server.connections(), 1);

    // a large frame crosses in one piece
    let large = RpcCall::new("g", echo(), vec![7; 1 << 20]);
    let response = client
        .request(&large)
        .get_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response.value.map(|v| v.len()), Some(1 << 20));

    server.close();
    let after = client.request(&call).get_timeout(Duration::from_secs(5)).await;
    assert!(after.is_err());
}

#[tokio::test]
async fn untrusted_server_is_refused() {
    let identity = Identity::self_signed(vec!["localhost".into()]).unwrap();
    let server = serve(&identity);
    let port = server.local_addr().unwrap().port();

    let stranger = Identity::self_signed(vec!["localhost".into()]).unwrap();
    let transport = Arc::new(
        QuicTransport::new(stranger.certificates(), QuicConfig::default())
            .unwrap(),
    );
    let client = Client::new(
        EndpointAddress::parse(&format!(
            "quic://127.0.0.1:{port}?serverName=localhost"
        ))
        .unwrap(),
        ClientConfig::default(),
        transport,
        ChannelRegistry::new(),
        Arc::new(Scheduler::current().unwrap()),
    );
    assert!(matches!(
        client.connect().await,
        Err(Error::Remoting { .. })
    ));
}

#[tokio::test]
async fn registry_driven_calls_over_quic() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(Scheduler::current().unwrap());
    let registry = Arc::new(MemoryRegistry::new(
        EndpointAddress::new("coord", 2181),
        Coordinator::new(),
        RegistryConfig::builder().cache_dir(dir.path()).build(),
        scheduler.clone(),
    ));

    let identity = Identity::self_signed(vec!["localhost".into()]).unwrap();
    let server = serve(&identity);
    let port = server.local_addr().unwrap().port();
    let exporter = Exporter::new(
        registry.clone(),
        EndpointAddress::parse(&format!(
            "quic://127.0.0.1:{port}?serverName=localhost&connections=2"
        ))
        .unwrap(),
    );
    exporter.export("tools", &[echo()]).await.unwrap();

    let transport = Arc::new(
        QuicTransport::new(identity.certificates(), QuicConfig::default())
            .unwrap(),
    );
    let resolver = Arc::new(
        InvokerResolver::new(registry.clone())
            .with_protocol("quic", TransportProtocol::new(transport, scheduler)),
    );
    let reference = ServiceReference::builder().resolver(resolver).build();

    let call = RpcCall::new("tools", echo(), vec![1, 2, 3]);
    for _ in 0..4 {
        assert_eq!(reference.call(&call).await.unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(server.connections(), 2);
}
