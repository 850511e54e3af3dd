//! IPv4 address pool of a network's subnet.
//!
//! Addresses are drawn at random from the subnet, skipping reserved ranges,
//! and each address is handed out at most once per pool. Lookups by tank
//! index are stable: asking twice returns the same address.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Ranges never handed out (RFC 6890 special-purpose blocks)
const RESERVED: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 88, 99, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
];

/// Random draws before concluding the pool is exhausted
const MAX_DRAWS: usize = 10_000;

/// An IPv4 CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, String> {
        if prefix > 32 {
            return Err(format!("prefix length {prefix} exceeds 32"));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == u32::from(self.network)
    }

    /// Gateway address conventionally assigned to the first host
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network).saturating_add(1))
    }

    fn host_range(&self) -> (u32, u32) {
        let base = u32::from(self.network);
        let size = if self.prefix == 0 {
            u32::MAX
        } else {
            (1u32 << (32 - self.prefix)) - 1
        };
        // Skip network, gateway and broadcast
        (base.saturating_add(2), base.saturating_add(size).saturating_sub(1))
    }
}

impl Default for Subnet {
    /// `100.0.0.0/8`
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(100, 0, 0, 0),
            prefix: 8,
        }
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn is_reserved(addr: Ipv4Addr) -> bool {
    RESERVED.iter().any(|(net, prefix)| {
        u32::from(addr) & mask(*prefix) == u32::from(*net)
    })
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("subnet {s:?} is missing a prefix length"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("invalid subnet address {addr:?}: {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid prefix length {prefix:?}: {e}"))?;
        Subnet::new(addr, prefix)
    }
}

impl TryFrom<String> for Subnet {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    by_index: HashMap<usize, Ipv4Addr>,
    used: HashSet<Ipv4Addr>,
}

/// Address pool bound to one subnet
#[derive(Debug)]
pub struct Ipv4Pool {
    subnet: Subnet,
    state: Mutex<PoolState>,
}

impl Ipv4Pool {
    pub fn new(subnet: Subnet) -> Self {
        Self {
            subnet,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// Address of tank `index`, allocating one on first use.
    pub fn address_for(&self, index: usize) -> Option<Ipv4Addr> {
        self.address_for_with(index, &mut rand::thread_rng())
    }

    pub fn address_for_with<R: Rng>(&self, index: usize, rng: &mut R) -> Option<Ipv4Addr> {
        let mut state = self.state.lock();
        if let Some(addr) = state.by_index.get(&index) {
            return Some(*addr);
        }
        let (low, high) = self.subnet.host_range();
        if low > high {
            return None;
        }
        for _ in 0..MAX_DRAWS {
            let candidate = Ipv4Addr::from(rng.gen_range(low..=high));
            if is_reserved(candidate) || state.used.contains(&candidate) {
                continue;
            }
            state.used.insert(candidate);
            state.by_index.insert(index, candidate);
            return Some(candidate);
        }
        None
    }

    /// Record an address observed on a live resource.
    ///
    /// Returns false when the address already belongs to another tank.
    pub fn claim(&self, index: usize, addr: Ipv4Addr) -> bool {
        let mut state = self.state.lock();
        match state.by_index.get(&index) {
            Some(existing) if *existing == addr => return true,
            Some(_) => return false,
            None => {}
        }
        if !state.used.insert(addr) {
            return false;
        }
        state.by_index.insert(index, addr);
        true
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().used.len()
    }
}
