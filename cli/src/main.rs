use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use dendrite::{
    common::{address::CONNECTIONS, Scheduler},
    config::RegistryConfig,
    registry::{properties, Coordinator, MemoryRegistry, Registry},
    remoting::{
        Identity, LoopbackTransport, QuicConfig, QuicServer, QuicTransport,
    },
    rpc::{
        CommandTable, Exporter, InvokerResolver, RpcCall, RpcCommand,
        ServiceReference, TransportProtocol,
    },
    EndpointAddress, Error, Result,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dendrite", version, about = "dendrite RPC runtime tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse an address and print its parts
    Parse { address: String },
    /// Print the entries of a registry cache file
    Cache { file: PathBuf },
    /// Print the command string and registry path of a method
    Command {
        interface: String,
        method: String,
        parameters: Vec<String>,
        #[arg(long, default_value = "default")]
        group: String,
    },
    /// Run a provider and a caller in this process and time the calls
    Demo {
        #[arg(long, default_value_t = 1000)]
        calls: usize,
        #[arg(long, default_value_t = 1)]
        connections: usize,
        /// Call over QUIC on localhost instead of in memory
        #[arg(long)]
        quic: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Parse { address } => parse(&address),
        Command::Cache { file } => cache(file),
        Command::Command {
            interface,
            method,
            parameters,
            group,
        } => {
            let parameters: Vec<&str> =
                parameters.iter().map(String::as_str).collect();
            let command = RpcCommand::new(&interface, &method, &parameters);
            println!("command: {command}");
            println!("lookup:  /{}", command.service_path(&group));
            Ok(())
        }
        Command::Demo {
            calls,
            connections,
            quic,
        } => demo(calls, connections, quic).await,
    }
}

fn parse(text: &str) -> Result<()> {
    let address = EndpointAddress::parse(text)?;
    println!("protocol: {}", address.protocol().unwrap_or("-"));
    if let Some(username) = address.username() {
        println!("username: {username}");
    }
    println!("host:     {}", address.host().unwrap_or("-"));
    println!("port:     {}", address.port());
    println!("path:     {}", address.path().unwrap_or("-"));
    for (key, value) in address.parameters() {
        println!("  {key} = {value}");
    }
    println!("service key: {}", dendrite::registry::service_key(&address));
    println!("canonical:   {address}");
    Ok(())
}

fn cache(file: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&file)?;
    let mut entries = properties::parse(&text);
    entries.sort();
    for (key, value) in entries {
        println!("{key}");
        for address in value.split_whitespace() {
            println!("    {address}");
        }
    }
    Ok(())
}

async fn demo(calls: usize, connections: usize, quic: bool) -> Result<()> {
    let dir = std::env::temp_dir()
        .join(format!("dendrite-demo-{}", std::process::id()));
    let scheduler = Arc::new(Scheduler::current()?);
    let registry = Arc::new(MemoryRegistry::new(
        EndpointAddress::new("demo", 0),
        Coordinator::new(),
        RegistryConfig::builder().cache_dir(dir.clone()).build(),
        scheduler.clone(),
    ));

    let command = RpcCommand::new("demo::Echo", "echo", &["Vec<u8>"]);
    let table = CommandTable::new();
    table.register(&command, |payload: Vec<u8>| async move {
        Ok::<_, Error>(payload)
    })?;

    let (provider, protocol, server) = if quic {
        let identity = Identity::self_signed(vec!["localhost".into()])?;
        let server = QuicServer::bind(
            ([127, 0, 0, 1], 0).into(),
            &identity,
            table.clone(),
            QuicConfig::default(),
        )?;
        let transport = Arc::new(QuicTransport::new(
            identity.certificates(),
            QuicConfig::default(),
        )?);
        let port = server.local_addr()?.port();
        (
            format!("quic://127.0.0.1:{port}?serverName=localhost"),
            TransportProtocol::new(transport, scheduler.clone()),
            Some(server),
        )
    } else {
        (
            "loop://demo:1".to_owned(),
            TransportProtocol::new(
                LoopbackTransport::new(table.clone()),
                scheduler.clone(),
            ),
            None,
        )
    };
    let provider = EndpointAddress::parse(&provider)?
        .with_parameter(CONNECTIONS, connections.to_string());
    let scheme = provider.protocol().unwrap_or_default().to_owned();

    let exporter = Exporter::new(registry.clone(), provider);
    exporter.export("demo", &table.commands()).await?;
    let resolver = Arc::new(
        InvokerResolver::new(registry.clone()).with_protocol(scheme, protocol),
    );
    let reference = ServiceReference::builder()
        .resolver(resolver.clone())
        .build();

    let call = RpcCall::new("demo", command, vec![0; 64]);
    let started = Instant::now();
    let mut slowest = Duration::ZERO;
    for _ in 0..calls {
        let sent = Instant::now();
        reference.call(&call).await?;
        slowest = slowest.max(sent.elapsed());
    }
    let elapsed = started.elapsed();
    println!(
        "{calls} calls over {} in {elapsed:?}, mean {:?}, slowest {slowest:?}",
        if quic { "quic" } else { "loopback" },
        elapsed / calls.max(1) as u32,
    );

    resolver.close();
    exporter.unexport().await?;
    registry.close().await;
    if let Some(server) = server {
        server.close();
    }
    if let Err(e) = std::fs::remove_dir_all(&dir) {
        tracing::debug!(%e, "demo cache directory left behind");
    }
    Ok(())
}
