use std::net::IpAddr;

use ipnet::IpNet;

/// A set of CIDR blocks tested against a peer address.
///
/// A peer matches iff any block contains it. Peers without an IP address
/// (UNIX-domain sockets) and families the list does not cover simply do
/// not match; an ACL test is never an error.
#[derive(Debug, Clone)]
pub struct Acl {
    pub name: Option<String>,
    nets: Vec<IpNet>,
}

impl Acl {
    pub fn new(name: Option<String>, nets: Vec<IpNet>) -> Self {
        Acl { name, nets }
    }

    pub fn matches(&self, peer: Option<IpAddr>) -> bool {
        match peer {
            Some(ip) => self.nets.iter().any(|net| net.contains(&ip)),
            None => false,
        }
    }
}
