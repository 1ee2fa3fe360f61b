use std::net::SocketAddr;

/// The fixed set of candidate upstreams, in broadcast order.
#[derive(Clone, Debug)]
pub struct UpstreamSet {
    addrs: Vec<SocketAddr>,
}

impl UpstreamSet {
    pub fn new(addrs: Vec<SocketAddr>) -> UpstreamSet {
        let mut unique: Vec<SocketAddr> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        Self { addrs: unique }
    }
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.addrs.contains(addr)
    }
    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.addrs.iter()
    }
    pub fn len(&self) -> usize {
        self.addrs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_exact() {
        let set = UpstreamSet::new(vec![
            "169.254.4.1:8080".parse().unwrap(),
            "169.254.5.1:8080".parse().unwrap(),
            "169.254.4.1:8080".parse().unwrap(),
        ]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&"169.254.5.1:8080".parse().unwrap()));
        // same host, other port
        assert!(!set.contains(&"169.254.5.1:8081".parse().unwrap()));
        let order: Vec<_> = set.iter().map(|addr| addr.ip().to_string()).collect();
        assert_eq!(order, ["169.254.4.1", "169.254.5.1"]);
    }
}
