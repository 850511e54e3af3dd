//! # Scheduler Flows
//!
//! Topology files parsed by `TopologyGraph` and handed to the
//! `ChannelOpenScheduler` over the in-memory regtest network.
//!
//! ## Flow Tested:
//!
//! 1. **multi-block layout**: channels declared across several blocks confirm
//!    at exactly their `(block, index)` and nowhere else
//! 2. **declared policies**: source and target policies show up in the
//!    gossiped graph of every node
//! 3. **mixed implementations**: LND and CLN endpoints in one schedule

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use warnet_core::adapters::mock::{MockLightning, MockNetwork};
    use warnet_core::config::SchedulerConfig;
    use warnet_core::domain::graph::LnImpl;
    use warnet_core::ports::LightningNode;
    use warnet_core::{ChannelOpenScheduler, GraphError, TopologyGraph};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    const FOUR_NODES: &str = r#"{
        "nodes": [{"id": 0, "ln": "lnd"}, {"id": 1, "ln": "lnd"}, {"id": 2, "ln": "cln"}, {"id": 3, "ln": "lnd"}],
        "edges": [
            {"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 100000,
                "source_policy": {"base_fee_msat": 2000, "fee_rate_ppm": 150}}},
            {"source": 1, "target": 2, "channel": {"block": 300, "index": 2, "capacity": 250000, "push_amt": 1000}},
            {"source": 2, "target": 3, "channel": {"block": 300, "index": 3, "capacity": 100000,
                "target_policy": {"fee_rate_ppm": 900, "cltv_expiry_delta": 80}}},
            {"source": 3, "target": 0, "channel": {"block": 304, "index": 1, "capacity": 500000}},
            {"source": 1, "target": 3, "channel": {"block": 304, "index": 2, "capacity": 500000}}
        ]}"#;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            connect_stagger: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            mempool_timeout: Duration::from_millis(300),
            funding_timeout: Duration::from_millis(300),
            gossip_attempts: 10,
            policy_attempts: 10,
            ..Default::default()
        }
    }

    /// Lightning nodes for every graph node, ids matching graph indices
    fn lightning_nodes(graph: &TopologyGraph, network: &Arc<MockNetwork>) -> Vec<Arc<MockLightning>> {
        graph
            .nodes()
            .iter()
            .filter_map(|node| node.ln.as_ref())
            .map(|ln| network.add_node(ln.implementation))
            .collect()
    }

    fn scheduler(network: &Arc<MockNetwork>, nodes: &[Arc<MockLightning>]) -> ChannelOpenScheduler {
        let nodes: BTreeMap<usize, Arc<dyn LightningNode>> = nodes
            .iter()
            .map(|n| (n.id(), Arc::clone(n) as Arc<dyn LightningNode>))
            .collect();
        ChannelOpenScheduler::new(fast_config(), network.chain(), nodes)
    }

    // =============================================================================
    // INTEGRATION TESTS: GRAPH → SCHEDULER → CHAIN
    // =============================================================================

    #[tokio::test]
    async fn test_multi_block_layout_lands_exactly() {
        let graph = TopologyGraph::parse(FOUR_NODES.as_bytes()).unwrap();
        let network = MockNetwork::new();
        let nodes = lightning_nodes(&graph, &network);

        let report = scheduler(&network, &nodes).run(graph.channel_edges()).await.unwrap();

        assert_eq!(report.channels.len(), 5);
        assert_eq!(network.height(), 304);
        for channel in &report.channels {
            let block = network.block(channel.id.block).unwrap();
            assert_eq!(block[channel.id.index as usize], channel.point.txid, "{:?}", channel.id);
            assert_eq!(
                channel.short_chan_id,
                format!("{}x{}x{}", channel.id.block, channel.id.index, channel.point.output)
            );
        }
        // blocks between the two batches carry no funding transactions
        for height in 301..304 {
            assert_eq!(network.block(height).unwrap().len(), 1, "block {height}");
        }
    }

    #[tokio::test]
    async fn test_declared_policies_reach_every_graph() {
        let graph = TopologyGraph::parse(FOUR_NODES.as_bytes()).unwrap();
        let network = MockNetwork::new();
        let nodes = lightning_nodes(&graph, &network);

        let report = scheduler(&network, &nodes).run(graph.channel_edges()).await.unwrap();
        assert_eq!(report.policies_applied, 2);

        let first = report.channels.iter().find(|c| c.short_chan_id == "300x1x0").unwrap();
        for node in &nodes {
            let channels = node.graph_channels().await.unwrap();
            let channel = channels.iter().find(|c| c.short_chan_id == first.short_chan_id).unwrap();
            let policy = channel.policy_of(&nodes[0].pubkey()).unwrap();
            assert_eq!(policy.base_fee_msat, Some(2000));
            assert_eq!(policy.fee_rate_ppm, Some(150));
        }

        let third = report.channels.iter().find(|c| c.short_chan_id == "300x3x0").unwrap();
        let channels = nodes[1].graph_channels().await.unwrap();
        let channel = channels.iter().find(|c| c.short_chan_id == third.short_chan_id).unwrap();
        let policy = channel.policy_of(&nodes[3].pubkey()).unwrap();
        assert_eq!(policy.fee_rate_ppm, Some(900));
        assert_eq!(policy.cltv_expiry_delta, Some(80));
    }

    #[test]
    fn test_channel_to_plain_tank_is_rejected_before_scheduling() {
        let doc = r#"{"nodes": [{"id": 0, "ln": "lnd"}, {"id": 1}],
            "edges": [{"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 100000}}]}"#;
        let err = TopologyGraph::parse(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, GraphError::Topology(msg) if msg.contains("tank 1")));
    }

    #[tokio::test]
    async fn test_mixed_implementation_pubkeys_are_distinct() {
        let graph = TopologyGraph::parse(FOUR_NODES.as_bytes()).unwrap();
        let network = MockNetwork::new();
        let nodes = lightning_nodes(&graph, &network);
        assert_eq!(nodes[2].implementation(), LnImpl::Cln);

        scheduler(&network, &nodes).run(graph.channel_edges()).await.unwrap();

        let mut pubkeys: Vec<String> = nodes.iter().map(|n| n.pubkey()).collect();
        pubkeys.sort();
        pubkeys.dedup();
        assert_eq!(pubkeys.len(), 4);
        assert_eq!(network.channels().len(), 5);
    }
}
