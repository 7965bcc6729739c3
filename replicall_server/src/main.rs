//! Replicall demo server node executable: hosts clustered services behind
//! the invocation API until terminated.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use bytes::Bytes;

use clap::Parser;

use replicall::{
    logger_init, pf_error, pf_info, pf_warn, Deployment, Endpoint,
    InvocationApi, InvocationContext, InvocationDispatcher, LocalDirectory,
    ReplicallError, ReplicantDirectory, ServiceIdentity, ServiceInvoker,
    TargetRegistry, ME,
};

use tokio::sync::watch;

/// Demo application service: echoes or transforms the payload bytes.
#[derive(Debug)]
struct EchoService;

#[async_trait]
impl ServiceInvoker for EchoService {
    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        method: &str,
        args: Bytes,
    ) -> Result<Bytes, Bytes> {
        match method {
            "echo" => Ok(args),
            "reverse" => {
                let mut payload = args.to_vec();
                payload.reverse();
                Ok(Bytes::from(payload))
            }
            _ => Err(Bytes::from(format!("unknown method '{}'", method))),
        }
    }
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(about = "Replicall demo service host node")]
struct CliArgs {
    /// Invocation API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// Logical service identities to deploy on this node.
    #[arg(short, long, default_value = "echo")]
    services: Vec<String>,

    /// Additional replicant endpoints seeded as static membership
    /// (e.g. '-p host1:52700 -p host2:52700').
    #[arg(short, long)]
    peers: Vec<SocketAddr>,
}

impl CliArgs {
    /// Sanitizes command line arguments.
    fn sanitize(&self) -> Result<(), ReplicallError> {
        if self.api_port <= 1024 {
            return Err(ReplicallError::msg(format!(
                "api_port {} is invalid",
                self.api_port
            )));
        }
        if self.services.is_empty() {
            return Err(ReplicallError::msg("no services to deploy given"));
        }

        let mut name_set = HashSet::new();
        for name in self.services.iter() {
            if !name_set.insert(name) {
                return Err(ReplicallError::msg(format!(
                    "duplicate service name {} given",
                    name
                )));
            }
        }

        let mut peer_set = HashSet::new();
        for peer in self.peers.iter() {
            if !peer_set.insert(peer) {
                return Err(ReplicallError::msg(format!(
                    "duplicate peer address {} given",
                    peer
                )));
            }
        }
        Ok(())
    }
}

// Server node executable main entrance.
#[tokio::main]
async fn main() -> Result<(), ReplicallError> {
    logger_init();

    let args = CliArgs::parse();
    args.sanitize()?;
    let _ = ME.set(format!("s{}", args.api_port));

    let api_addr: SocketAddr =
        format!("127.0.0.1:{}", args.api_port).parse()?;
    let endpoint = Endpoint::new(api_addr);

    let registry = Arc::new(TargetRegistry::new());
    let directory = Arc::new(LocalDirectory::new());
    let dispatcher = Arc::new(InvocationDispatcher::new(registry.clone()));

    // deploy every requested service on this node, seed static membership,
    // then authorize invocations
    let mut deployments = Vec::new();
    for name in &args.services {
        let service = ServiceIdentity::new(name);
        let deployment = Deployment::deploy(
            registry.clone(),
            directory.clone() as Arc<dyn ReplicantDirectory>,
            service.clone(),
            endpoint.clone(),
            Arc::new(EchoService),
        )
        .await?;

        for peer in &args.peers {
            directory.publish(&service, Endpoint::new(*peer)).await?;
        }

        deployment.fully_started();
        deployments.push(deployment);
    }

    let _api = InvocationApi::new_and_setup(dispatcher, api_addr).await?;
    pf_info!(
        "node up, serving {} service(s) on {}",
        deployments.len(),
        api_addr
    );

    // wait for termination signal, then tear the deployments down in order
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            eprintln!("error sending to term channel: {}", e);
        }
    })
    .map_err(ReplicallError::msg)?;

    rx_term.changed().await.map_err(ReplicallError::msg)?;
    pf_warn!("server caught termination signal");

    for mut deployment in deployments {
        if let Err(e) = deployment.about_to_stop().await {
            pf_error!(
                "error undeploying '{}': {}",
                deployment.service(),
                e
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod server_args_tests {
    use super::CliArgs;

    #[test]
    fn sanitize_valid() {
        let args = CliArgs {
            api_port: 52700,
            services: vec!["echo".into(), "cache".into()],
            peers: vec![
                "127.0.0.1:52701".parse().unwrap(),
                "127.0.0.1:52702".parse().unwrap(),
            ],
        };
        assert!(args.sanitize().is_ok());
    }

    #[test]
    fn sanitize_invalid_api_port() {
        let args = CliArgs {
            api_port: 1023,
            services: vec!["echo".into()],
            peers: vec![],
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_duplicate_service() {
        let args = CliArgs {
            api_port: 52700,
            services: vec!["echo".into(), "echo".into()],
            peers: vec![],
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_duplicate_peer() {
        let args = CliArgs {
            api_port: 52700,
            services: vec!["echo".into()],
            peers: vec![
                "127.0.0.1:52701".parse().unwrap(),
                "127.0.0.1:52701".parse().unwrap(),
            ],
        };
        assert!(args.sanitize().is_err());
    }
}
