//! Longest-prefix-match tree.
//!
//! A binary trie over the bits of an address. IPv4 and IPv6 each get their
//! own tree, so 32-bit and 128-bit keys never share nodes. Nodes are owned
//! boxes and are released when the tree is dropped.

use std::marker::PhantomData;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address types the tree can be keyed by
pub trait AddressBits: Copy {
    /// Width of the address in bits
    const BITS: u8;

    /// Bit at `index`, counting from the most significant bit
    fn bit(&self, index: u8) -> bool;
}

impl AddressBits for Ipv4Addr {
    const BITS: u8 = 32;

    fn bit(&self, index: u8) -> bool {
        (u32::from(*self) >> (31 - index as u32)) & 1 == 1
    }
}

impl AddressBits for Ipv6Addr {
    const BITS: u8 = 128;

    fn bit(&self, index: u8) -> bool {
        (u128::from(*self) >> (127 - index as u32)) & 1 == 1
    }
}

struct Node<V> {
    value: Option<V>,
    children: [Option<Box<Node<V>>>; 2],
}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: [None, None],
        }
    }
}

pub struct PrefixTree<A, V> {
    root: Node<V>,
    len: usize,
    _address: PhantomData<A>,
}

impl<A: AddressBits, V> PrefixTree<A, V> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
            _address: PhantomData,
        }
    }

    /// Store `value` for the prefix `address/prefix_len`.
    ///
    /// Inserting the same prefix twice replaces the earlier value, which is
    /// handed back to the caller.
    pub fn insert(&mut self, address: A, prefix_len: u8, value: V) -> Option<V> {
        let prefix_len = prefix_len.min(A::BITS);
        let mut node = &mut self.root;

        for index in 0..prefix_len {
            let branch = address.bit(index) as usize;
            node = &mut **node.children[branch].get_or_insert_with(|| Box::new(Node::new()));
        }

        let replaced = node.value.replace(value);
        if replaced.is_none() {
            self.len += 1;
        }
        replaced
    }

    /// Most specific stored prefix covering `address`, with its length.
    pub fn lookup_best(&self, address: A) -> Option<(u8, &V)> {
        let mut node = &self.root;
        let mut best = node.value.as_ref().map(|value| (0, value));

        for index in 0..A::BITS {
            match &node.children[address.bit(index) as usize] {
                Some(child) => {
                    node = &**child;
                    if let Some(value) = &node.value {
                        best = Some((index + 1, value));
                    }
                }
                None => break,
            }
        }

        best
    }

    /// Value stored for exactly `address/prefix_len`
    pub fn lookup_exact(&self, address: A, prefix_len: u8) -> Option<&V> {
        let mut node = &self.root;
        for index in 0..prefix_len.min(A::BITS) {
            node = node.children[address.bit(index) as usize].as_deref()?;
        }
        node.value.as_ref()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<A: AddressBits, V> Default for PrefixTree<A, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn v6(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_positive_lookup_ipv6_prefix() {
        let mut tree = PrefixTree::new();
        tree.insert(v6("2a03:f480::"), 32, "customer");

        let found = tree.lookup_best(v6("2a03:f480:2130:cf05:face:b00c::1"));
        assert_eq!(found, Some((32, &"customer")));
    }

    #[test]
    fn test_negative_lookup_ipv6_prefix() {
        let mut tree = PrefixTree::new();
        tree.insert(v6("2a03:f480::"), 32, "customer");

        assert!(tree.lookup_best(v6("2a03:2880:2130:cf05:face:b00c::1")).is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut tree = PrefixTree::new();
        tree.insert(v4("10.0.0.0"), 8, "wide");
        tree.insert(v4("10.20.0.0"), 16, "narrow");
        tree.insert(v4("10.20.30.40"), 32, "host");

        assert_eq!(tree.lookup_best(v4("10.1.1.1")), Some((8, &"wide")));
        assert_eq!(tree.lookup_best(v4("10.20.1.1")), Some((16, &"narrow")));
        assert_eq!(tree.lookup_best(v4("10.20.30.40")), Some((32, &"host")));
        assert_eq!(tree.lookup_best(v4("11.0.0.1")), None);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_default_route_matches_everything() {
        let mut tree = PrefixTree::new();
        tree.insert(v4("0.0.0.0"), 0, "any");
        tree.insert(v4("192.168.0.0"), 24, "lan");

        assert_eq!(tree.lookup_best(v4("8.8.8.8")), Some((0, &"any")));
        assert_eq!(tree.lookup_best(v4("192.168.0.7")), Some((24, &"lan")));
    }

    #[test]
    fn test_same_prefix_last_write_wins() {
        let mut tree = PrefixTree::new();
        assert_eq!(tree.insert(v4("172.16.0.0"), 12, "first"), None);
        assert_eq!(tree.insert(v4("172.16.0.0"), 12, "second"), Some("first"));

        assert_eq!(tree.lookup_best(v4("172.20.1.1")), Some((12, &"second")));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_lookup_exact() {
        let mut tree = PrefixTree::new();
        tree.insert(v4("10.0.0.0"), 8, 1);

        assert_eq!(tree.lookup_exact(v4("10.0.0.0"), 8), Some(&1));
        assert_eq!(tree.lookup_exact(v4("10.0.0.0"), 16), None);
        assert_eq!(tree.lookup_exact(v4("10.0.0.0"), 4), None);
    }

    #[test]
    fn test_matches_linear_scan() {
        let prefixes = [
            (v4("10.0.0.0"), 8u8),
            (v4("10.128.0.0"), 9),
            (v4("10.128.64.0"), 18),
            (v4("192.168.1.0"), 24),
            (v4("192.168.1.128"), 25),
            (v4("203.0.113.7"), 32),
        ];
        let mut tree = PrefixTree::new();
        for (index, (address, length)) in prefixes.iter().enumerate() {
            tree.insert(*address, *length, index);
        }

        let covers = |network: Ipv4Addr, length: u8, ip: Ipv4Addr| {
            let mask = if length == 0 { 0 } else { u32::MAX << (32 - length as u32) };
            u32::from(network) & mask == u32::from(ip) & mask
        };

        let mut seed: u32 = 0x9e37_79b9;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            // bias half the samples into the configured ranges
            let ip = if seed & 1 == 0 {
                let (network, _) = prefixes[(seed as usize >> 1) % prefixes.len()];
                Ipv4Addr::from(u32::from(network) ^ (seed >> 20))
            } else {
                Ipv4Addr::from(seed)
            };

            let expected = prefixes
                .iter()
                .enumerate()
                .filter(|(_, (network, length))| covers(*network, *length, ip))
                .max_by_key(|(_, (_, length))| *length)
                .map(|(index, (_, length))| (*length, index));

            let actual = tree.lookup_best(ip).map(|(length, index)| (length, *index));
            assert_eq!(actual, expected, "mismatch for {}", ip);
        }
    }
}
