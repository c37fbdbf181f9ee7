//! Networking utilities for the fleet.
//!
//! This library provides helpers for:
//! - Deterministic MAC addresses for instance network adapters
//! - Parsing `ip -o addr` output from the host bridge
//! - VPC address pools and the release contract the control plane relies on

use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use fleet_id::{InstanceId, VpcId};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// No address pool is registered for the VPC.
    #[error("no address pool for {0}")]
    UnknownVpc(VpcId),

    /// Address pool exhausted.
    #[error("address pool exhausted: {0}")]
    PoolExhausted(String),

    /// The backing pool store failed.
    #[error("address pool backend error: {0}")]
    Backend(String),
}

// ============================================================================
// MAC derivation
// ============================================================================

/// Derive the MAC address of an instance's adapter.
///
/// `02:` marks the address locally administered and unicast; the remaining
/// five octets are the head of SHA-256(instance id || vpc id). An unbound
/// adapter hashes the instance id alone. The same pair always yields the
/// same address.
pub fn derive_mac(instance: &InstanceId, vpc: Option<&VpcId>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance.to_string().as_bytes());
    if let Some(vpc) = vpc {
        hasher.update(vpc.to_string().as_bytes());
    }
    let digest = hasher.finalize();

    let mut mac = String::with_capacity(17);
    mac.push_str("02");
    for byte in &digest[..5] {
        mac.push_str(&format!(":{byte:02x}"));
    }
    mac
}

// ============================================================================
// Bridge address discovery
// ============================================================================

/// Global-scope addresses found on an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceAddresses {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl InterfaceAddresses {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }
}

/// Parse the one-line-per-address output of `ip -o addr show dev <iface>`.
///
/// Only `scope global` addresses are returned. Lines that do not parse are
/// skipped.
pub fn parse_ip_addr_output(output: &str) -> InterfaceAddresses {
    let mut addrs = InterfaceAddresses::default();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let global = fields
            .windows(2)
            .any(|pair| pair[0] == "scope" && pair[1] == "global");
        if !global {
            continue;
        }

        let addr = fields[3].split('/').next().unwrap_or_default();
        match fields[2] {
            "inet" => {
                if let Ok(ip) = Ipv4Addr::from_str(addr) {
                    addrs.ipv4.push(ip);
                }
            }
            "inet6" => {
                if let Ok(ip) = Ipv6Addr::from_str(addr) {
                    addrs.ipv6.push(ip);
                }
            }
            _ => {}
        }
    }

    addrs
}

// ============================================================================
// IPv4 networks
// ============================================================================

/// IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Network {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, PoolError> {
        if prefix_len > 30 {
            return Err(PoolError::InvalidPrefix(format!(
                "prefix length {prefix_len} leaves no host addresses"
            )));
        }

        let bits = u32::from(address) & mask_v4(prefix_len);
        Ok(Self {
            address: Ipv4Addr::from(bits),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.196.0.0/16").
    pub fn from_cidr(s: &str) -> Result<Self, PoolError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(PoolError::InvalidPrefix(format!("missing '/' in CIDR: {s}")));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| PoolError::InvalidAddress(addr_str.to_string()))?;
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| PoolError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_v4(self.prefix_len) == u32::from(self.address)
    }

    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }
}

impl std::fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

/// Sequential host allocator for one network.
///
/// Offset 0 is the network address, offset 1 the gateway and the last offset
/// the broadcast address; none of them are handed out. Released offsets are
/// reused lowest first.
#[derive(Debug)]
struct Ipv4Allocator {
    network: Ipv4Network,
    next_offset: u64,
    max_offset: u64,
    free: BTreeSet<u64>,
}

impl Ipv4Allocator {
    fn new(network: Ipv4Network) -> Self {
        Self {
            network,
            next_offset: 2,
            max_offset: network.size() - 1,
            free: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> Result<Ipv4Addr, PoolError> {
        let offset = match self.free.pop_first() {
            Some(offset) => offset,
            None => {
                if self.next_offset >= self.max_offset {
                    return Err(PoolError::PoolExhausted(self.network.to_string()));
                }
                let offset = self.next_offset;
                self.next_offset += 1;
                offset
            }
        };

        Ok(self.addr_at(offset))
    }

    fn free(&mut self, addr: Ipv4Addr) {
        if self.network.contains(addr) {
            let offset = u64::from(u32::from(addr) - u32::from(self.network.address));
            self.free.insert(offset);
        }
    }

    fn addr_at(&self, offset: u64) -> Ipv4Addr {
        // offset < size, so the sum stays inside the network
        Ipv4Addr::from(u32::from(self.network.address) + offset as u32)
    }
}

// ============================================================================
// Address pools
// ============================================================================

/// The address-pool collaborator.
///
/// One instance holds at most one address per VPC; the pool enforces that.
/// Releasing a reservation that does not exist is a no-op.
#[async_trait]
pub trait AddressPool: Send + Sync {
    /// Return the instance's address in `vpc` to the free pool.
    async fn release(&self, instance: InstanceId, vpc: VpcId) -> Result<(), PoolError>;

    /// Return every address the instance holds, in any VPC.
    async fn release_all(&self, instance: InstanceId) -> Result<(), PoolError>;
}

#[derive(Debug, Default)]
struct PoolState {
    allocators: HashMap<VpcId, Ipv4Allocator>,
    reservations: HashMap<(VpcId, InstanceId), Ipv4Addr>,
}

/// In-memory per-VPC IPv4 address pool.
#[derive(Debug, Default)]
pub struct VpcAddressPool {
    state: Mutex<PoolState>,
}

impl VpcAddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a VPC network. Existing reservations in the VPC are kept.
    pub fn add_vpc(&self, vpc: VpcId, network: Ipv4Network) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .allocators
            .entry(vpc)
            .or_insert_with(|| Ipv4Allocator::new(network));
    }

    /// Reserve an address for the instance in `vpc`.
    ///
    /// Returns the existing reservation if the instance already holds one.
    pub fn reserve(&self, instance: InstanceId, vpc: VpcId) -> Result<Ipv4Addr, PoolError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(addr) = state.reservations.get(&(vpc, instance)) {
            return Ok(*addr);
        }

        let allocator = state
            .allocators
            .get_mut(&vpc)
            .ok_or(PoolError::UnknownVpc(vpc))?;
        let addr = allocator.allocate()?;
        state.reservations.insert((vpc, instance), addr);

        debug!(instance_id = %instance, vpc_id = %vpc, address = %addr, "Reserved address");
        Ok(addr)
    }

    /// The address the instance holds in `vpc`, if any.
    pub fn reservation(&self, instance: InstanceId, vpc: VpcId) -> Option<Ipv4Addr> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.reservations.get(&(vpc, instance)).copied()
    }

    /// Number of addresses reserved in `vpc`.
    pub fn reserved_count(&self, vpc: VpcId) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.reservations.keys().filter(|(v, _)| *v == vpc).count()
    }
}

impl PoolState {
    fn release(&mut self, instance: InstanceId, vpc: VpcId) {
        let Some(addr) = self.reservations.remove(&(vpc, instance)) else {
            return;
        };

        if let Some(allocator) = self.allocators.get_mut(&vpc) {
            allocator.free(addr);
        }

        debug!(instance_id = %instance, vpc_id = %vpc, address = %addr, "Released address");
    }
}

#[async_trait]
impl AddressPool for VpcAddressPool {
    async fn release(&self, instance: InstanceId, vpc: VpcId) -> Result<(), PoolError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.release(instance, vpc);
        Ok(())
    }

    async fn release_all(&self, instance: InstanceId) -> Result<(), PoolError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let held: Vec<VpcId> = state
            .reservations
            .keys()
            .filter(|(_, inst)| *inst == instance)
            .map(|(vpc, _)| *vpc)
            .collect();

        for vpc in held {
            state.release(instance, vpc);
        }
        Ok(())
    }
}
