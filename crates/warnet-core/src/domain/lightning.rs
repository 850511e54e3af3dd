//! Launch configuration of a tank's Lightning node.

use crate::domain::graph::{LnImpl, LnSpec};
use crate::domain::tank::{TankSpec, ZMQ_BLOCK_PORT, ZMQ_TX_PORT};

pub const LN_RPC_PORT: u16 = 10009;
pub const LN_P2P_PORT: u16 = 9735;

pub const DEFAULT_LND_IMAGE: &str = "lightninglabs/lnd:v0.17.0-beta";
pub const DEFAULT_CLN_IMAGE: &str = "elementsproject/lightningd:v23.11";

/// Data directory of LND, shared with the circuit breaker sidecar
pub const LND_MOUNT_PATH: &str = "/root/.lnd";

const LND_BASE_ARGS: &[&str] = &[
    "--noseedbackup",
    "--norest",
    "--debuglevel=debug",
    "--accept-keysend",
    "--bitcoin.active",
    "--bitcoin.regtest",
    "--bitcoin.node=bitcoind",
    "--maxpendingchannels=64",
    "--trickledelay=1",
];

const CLN_BASE_ARGS: &[&str] = &[
    "--network=regtest",
    "--database-upgrade=true",
    "--bitcoin-retry-timeout=600",
    "--bind-addr=0.0.0.0:9735",
    "--developer",
    "--dev-fast-gossip",
    "--log-level=debug",
];

impl LnImpl {
    /// CLI prefix used for every RPC call inside the container
    pub fn cli(self) -> &'static str {
        match self {
            LnImpl::Lnd => "lncli --network=regtest",
            LnImpl::Cln => "lightning-cli --network=regtest",
        }
    }

    /// Name of the daemon process inside the container
    pub fn daemon(self) -> &'static str {
        match self {
            LnImpl::Lnd => "lnd",
            LnImpl::Cln => "lightningd",
        }
    }

    pub fn default_image(self) -> &'static str {
        match self {
            LnImpl::Lnd => DEFAULT_LND_IMAGE,
            LnImpl::Cln => DEFAULT_CLN_IMAGE,
        }
    }
}

impl LnSpec {
    pub fn image(&self) -> &str {
        self.image
            .as_deref()
            .unwrap_or_else(|| self.implementation.default_image())
    }

    /// Readiness check run inside the container
    pub fn ready_command(&self) -> String {
        format!("{} getinfo", self.implementation.cli())
    }

    /// Daemon arguments. `ln_host` is the name other nodes dial, `bitcoin_host`
    /// reaches the tank's bitcoind.
    pub fn node_args(&self, tank: &TankSpec, ln_host: &str, bitcoin_host: &str) -> Vec<String> {
        let mut args: Vec<String> = match self.implementation {
            LnImpl::Lnd => {
                let mut args: Vec<String> = LND_BASE_ARGS.iter().map(|a| a.to_string()).collect();
                args.extend([
                    format!("--bitcoind.rpcuser={}", tank.rpc.user),
                    format!("--bitcoind.rpcpass={}", tank.rpc.password),
                    format!("--bitcoind.rpchost={bitcoin_host}:{}", tank.rpc.port),
                    format!("--bitcoind.zmqpubrawblock=tcp://{bitcoin_host}:{ZMQ_BLOCK_PORT}"),
                    format!("--bitcoind.zmqpubrawtx=tcp://{bitcoin_host}:{ZMQ_TX_PORT}"),
                    format!("--rpclisten=0.0.0.0:{LN_RPC_PORT}"),
                    format!("--alias={}", tank.index),
                    format!("--externalhosts={ln_host}"),
                    format!("--tlsextradomain={ln_host}"),
                ]);
                args
            }
            LnImpl::Cln => {
                let mut args: Vec<String> = CLN_BASE_ARGS.iter().map(|a| a.to_string()).collect();
                args.extend([
                    format!("--alias={}", tank.index),
                    format!("--grpc-port={LN_RPC_PORT}"),
                    format!("--bitcoin-rpcuser={}", tank.rpc.user),
                    format!("--bitcoin-rpcpassword={}", tank.rpc.password),
                    format!("--bitcoin-rpcconnect={bitcoin_host}"),
                    format!("--bitcoin-rpcport={}", tank.rpc.port),
                    format!("--announce-addr=dns:{ln_host}:{LN_P2P_PORT}"),
                ]);
                args
            }
        };
        if let Some(extra) = &self.config {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args
    }

    /// Circuit breaker sidecar arguments, when one is declared on an LND node
    pub fn circuit_breaker_args(&self) -> Option<Vec<String>> {
        if self.implementation != LnImpl::Lnd || self.cb_image.is_none() {
            return None;
        }
        Some(vec![
            "--network=regtest".to_string(),
            format!("--rpcserver=127.0.0.1:{LN_RPC_PORT}"),
            format!("--tlscertpath={LND_MOUNT_PATH}/tls.cert"),
            format!("--macaroonpath={LND_MOUNT_PATH}/data/chain/bitcoin/regtest/admin.macaroon"),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::TopologyGraph;

    fn tank_with(ln: &str) -> TankSpec {
        let doc = format!(
            r#"{{"nodes": [{{"id": 0, "ln": "{ln}", "ln_config": "--color=ff0000"}}], "edges": []}}"#
        );
        let graph = TopologyGraph::parse(doc.as_bytes()).unwrap();
        TankSpec::from_node(&graph.nodes()[0], &graph, "warnet").unwrap()
    }

    #[test]
    fn test_lnd_args_point_at_bitcoind() {
        let tank = tank_with("lnd");
        let ln = tank.ln.as_ref().unwrap();
        let args = ln.node_args(&tank, "ln-host", "btc-host");
        assert!(args.contains(&"--bitcoind.rpchost=btc-host:18443".to_string()));
        assert!(args.contains(&"--externalhosts=ln-host".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--color=ff0000"));
        assert_eq!(ln.image(), DEFAULT_LND_IMAGE);
    }

    #[test]
    fn test_cln_announces_dns_address() {
        let tank = tank_with("cln");
        let ln = tank.ln.as_ref().unwrap();
        let args = ln.node_args(&tank, "ln-host", "btc-host");
        assert!(args.contains(&"--announce-addr=dns:ln-host:9735".to_string()));
        assert!(ln.circuit_breaker_args().is_none());
        assert_eq!(ln.ready_command(), "lightning-cli --network=regtest getinfo");
    }
}
