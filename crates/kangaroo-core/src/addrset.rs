//! Named address sets compiled from literal and CIDR strings.
//!
//! Every entry is normalized to a network prefix: `10.1.2.3/8` becomes
//! `10.0.0.0/8`, a bare `192.168.1.1` becomes `192.168.1.1/32` and a bare
//! IPv6 literal a `/128`. Compiled sets are immutable.

use crate::error::{KangarooError, KangarooResult};
use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Name of the set that covers the whole address space when no sets are configured.
pub const ALL_SET: &str = "All";

/// A named, ordered list of normalized prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    name: String,
    prefixes: Vec<IpNet>,
}

impl AddressSet {
    /// Compile one set. Fails on the first entry that is neither an IP nor a CIDR.
    pub fn compile<S: AsRef<str>>(name: &str, entries: &[S]) -> KangarooResult<Self> {
        let prefixes = entries
            .iter()
            .map(|entry| compile_entry(entry.as_ref()).ok_or_else(|| invalid(name, entry.as_ref())))
            .collect::<KangarooResult<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            prefixes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefixes(&self) -> &[IpNet] {
        &self.prefixes
    }

    /// True if `ip` falls inside at least one prefix of the set.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.prefixes.iter().any(|net| prefix_contains(net, ip))
    }
}

impl fmt::Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [", self.name)?;
        for (i, net) in self.prefixes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{net}")?;
        }
        f.write_str("]")
    }
}

fn compile_entry(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if entry.contains('/') {
        entry.parse::<IpNet>().ok().map(|net| net.trunc())
    } else {
        entry.parse::<IpAddr>().ok().map(IpNet::from)
    }
}

fn invalid(set: &str, entry: &str) -> KangarooError {
    KangarooError::InvalidAddress {
        set: set.to_string(),
        entry: entry.to_string(),
    }
}

/// Prefix containment across families: an IPv4 address is also matched by
/// IPv6 prefixes through its `::ffff:a.b.c.d` form, and an IPv4-mapped IPv6
/// address by IPv4 prefixes.
fn prefix_contains(net: &IpNet, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpNet::V4(net), IpAddr::V4(addr)) => net.contains(&addr),
        (IpNet::V6(net), IpAddr::V6(addr)) => net.contains(&addr),
        (IpNet::V6(net), IpAddr::V4(addr)) => net.contains(&addr.to_ipv6_mapped()),
        (IpNet::V4(net), IpAddr::V6(addr)) => addr
            .to_ipv4_mapped()
            .is_some_and(|mapped| net.contains(&mapped)),
    }
}

/// All compiled sets, in configuration order, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct AddressSets {
    sets: Vec<AddressSet>,
    index: HashMap<String, usize>,
}

impl AddressSets {
    /// Compile every `(name, entries)` pair. Names must be unique.
    pub fn compile<I, N, S>(entries: I) -> KangarooResult<Self>
    where
        I: IntoIterator<Item = (N, Vec<S>)>,
        N: Into<String>,
        S: AsRef<str>,
    {
        let mut compiled = Self::default();
        for (name, list) in entries {
            let name = name.into();
            let set = AddressSet::compile(&name, &list)?;
            compiled.insert(set)?;
        }
        Ok(compiled)
    }

    /// Add the `All = ::/0` set unless a set with that name already exists.
    pub fn with_default_all(mut self) -> KangarooResult<Self> {
        if !self.index.contains_key(ALL_SET) {
            self.insert(AddressSet::compile(ALL_SET, &["::/0"])?)?;
        }
        Ok(self)
    }

    fn insert(&mut self, set: AddressSet) -> KangarooResult<()> {
        if self.index.contains_key(set.name()) {
            return Err(KangarooError::DuplicateSet(set.name().to_string()));
        }
        self.index.insert(set.name().to_string(), self.sets.len());
        self.sets.push(set);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AddressSet> {
        self.index.get(name).map(|&i| &self.sets[i])
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn by_position(&self, position: usize) -> &AddressSet {
        &self.sets[position]
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressSet> {
        self.sets.iter()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
