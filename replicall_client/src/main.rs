//! Replicall demo client executable: drives calls against a clustered
//! service through the failover proxy.

use std::collections::HashSet;
use std::net::SocketAddr;

use bytes::Bytes;

use clap::Parser;

use rand::Rng;

use replicall::{
    logger_init, pf_error, pf_info, BalancePolicyKind, ClientId,
    ClientProxy, Endpoint, ReplicallError, ServiceIdentity, ME,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(about = "Replicall demo invocation client")]
struct CliArgs {
    /// Server replicant addresses seeding the initial view
    /// (e.g. '-s host1:52700 -s host2:52700').
    #[arg(short, long, required = true)]
    servers: Vec<SocketAddr>,

    /// Logical service identity to call.
    #[arg(long, default_value = "echo")]
    service: String,

    /// Method selector.
    #[arg(short, long, default_value = "echo")]
    method: String,

    /// Payload string sent as call arguments.
    #[arg(long, default_value = "hello")]
    payload: String,

    /// Name of load balance policy to use.
    #[arg(long, default_value = "RoundRobin")]
    policy: String,

    /// Optional sticky-session affinity key.
    #[arg(long)]
    affinity: Option<String>,

    /// Number of calls to issue.
    #[arg(short, long, default_value_t = 3)]
    repeat: u32,

    /// Proxy configuration TOML string
    /// (e.g. --config "attempt_timeout_ms = 500").
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitizes command line arguments, returning the parsed policy kind.
    fn sanitize(&self) -> Result<BalancePolicyKind, ReplicallError> {
        let mut server_set = HashSet::new();
        for server in self.servers.iter() {
            if !server_set.insert(server) {
                return Err(ReplicallError::msg(format!(
                    "duplicate server address {} given",
                    server
                )));
            }
        }

        BalancePolicyKind::parse_name(&self.policy).ok_or_else(|| {
            ReplicallError::msg(format!(
                "policy name {} unrecognized",
                self.policy
            ))
        })
    }
}

// Client executable main entrance.
#[tokio::main]
async fn main() -> Result<(), ReplicallError> {
    logger_init();

    let args = CliArgs::parse();
    let policy_kind = args.sanitize()?;

    let id: ClientId = rand::thread_rng().gen();
    let _ = ME.set(format!("c{}", id % 10000));

    let seeds: Vec<Endpoint> =
        args.servers.iter().map(|&addr| Endpoint::new(addr)).collect();
    let mut proxy = ClientProxy::new_tcp(
        id,
        ServiceIdentity::new(&args.service),
        seeds,
        policy_kind,
        args.config.as_deref(),
    )?;

    let payload = Bytes::from(args.payload.clone().into_bytes());
    for seq in 0..args.repeat {
        match proxy
            .invoke(&args.method, payload.clone(), args.affinity.as_deref())
            .await
        {
            Ok(result) => {
                pf_info!(
                    "call {} ok: '{}' (view {})",
                    seq,
                    String::from_utf8_lossy(&result),
                    proxy.cached_view().view_id()
                );
            }
            Err(e) => {
                pf_error!("call {} failed: {}", seq, e);
            }
        }
    }

    proxy.leave().await;
    Ok(())
}

#[cfg(test)]
mod client_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() {
        let args = CliArgs {
            servers: vec!["127.0.0.1:52700".parse().unwrap()],
            service: "echo".into(),
            method: "echo".into(),
            payload: "hello".into(),
            policy: "StickyByKey".into(),
            affinity: Some("session-1".into()),
            repeat: 1,
            config: None,
        };
        assert_eq!(args.sanitize(), Ok(BalancePolicyKind::StickyByKey));
    }

    #[test]
    fn sanitize_duplicate_server() {
        let args = CliArgs {
            servers: vec![
                "127.0.0.1:52700".parse().unwrap(),
                "127.0.0.1:52700".parse().unwrap(),
            ],
            service: "echo".into(),
            method: "echo".into(),
            payload: "hello".into(),
            policy: "RoundRobin".into(),
            affinity: None,
            repeat: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_policy() {
        let args = CliArgs {
            servers: vec!["127.0.0.1:52700".parse().unwrap()],
            service: "echo".into(),
            method: "echo".into(),
            payload: "hello".into(),
            policy: "Fanciest".into(),
            affinity: None,
            repeat: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
    }
}
