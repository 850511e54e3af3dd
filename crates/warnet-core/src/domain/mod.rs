//! Domain layer: topology, tank specs and the values exchanged with backends.

pub mod channel;
pub mod graph;
pub mod ip_pool;
pub mod lightning;
pub mod messages;
pub mod scenario;
pub mod status;
pub mod tank;

pub use channel::{policy_satisfies, ChannelPoint, LnChannel};
pub use graph::{
    ChannelEdge, ChannelId, ChannelPolicy, GraphDocument, LnImpl, LnSpec, NodeSpec, P2pEdge,
    TopologyGraph,
};
pub use ip_pool::{Ipv4Pool, Subnet};
pub use messages::MessageRecord;
pub use scenario::{CommanderJob, ScenarioRun, ScenarioStatus, TankSnapshot};
pub use status::{RunningStatus, ServiceType, TankStatus};
pub use tank::{RpcCredentials, SourceBuild, TankSpec};
