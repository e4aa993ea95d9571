//! In-memory network between simulated peers.
//!
//! Every ordered pair of peers has a FIFO link. Messages are never lost or
//! reordered on a link, but delivery can be delayed arbitrarily, which is
//! what produces concurrent edits.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct Network {
    peers: usize,
    /// `links[from * peers + to]`
    links: Vec<VecDeque<Vec<u8>>>,
    sent: usize,
    bytes: usize,
}

impl Network {
    pub fn new(peers: usize) -> Self {
        Self {
            peers,
            links: (0..peers * peers).map(|_| VecDeque::new()).collect(),
            sent: 0,
            bytes: 0,
        }
    }

    /// Queue `msg` from `from` to every other peer.
    pub fn broadcast(&mut self, from: usize, msg: &[u8]) {
        for to in (0..self.peers).filter(|&to| to != from) {
            self.links[from * self.peers + to].push_back(msg.to_vec());
            self.sent += 1;
            self.bytes += msg.len();
        }
    }

    /// Take up to `limit` queued messages from `from` to `to`, oldest first.
    pub fn take(&mut self, from: usize, to: usize, limit: usize) -> Vec<Vec<u8>> {
        let link = &mut self.links[from * self.peers + to];
        let n = limit.min(link.len());
        link.drain(..n).collect()
    }

    pub fn pending(&self, from: usize, to: usize) -> usize {
        self.links[from * self.peers + to].len()
    }

    pub fn is_idle(&self) -> bool {
        self.links.iter().all(VecDeque::is_empty)
    }

    /// Messages sent so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links_are_fifo_and_directed() {
        let mut net = Network::new(3);
        net.broadcast(0, b"one");
        net.broadcast(0, b"two");

        assert_eq!(net.pending(0, 1), 2);
        assert_eq!(net.pending(1, 0), 0);
        assert_eq!(net.take(0, 1, 1), vec![b"one".to_vec()]);
        assert_eq!(net.take(0, 1, 10), vec![b"two".to_vec()]);
        assert!(!net.is_idle());
        net.take(0, 2, 10);
        assert!(net.is_idle());
        assert_eq!(net.sent(), 4);
        assert_eq!(net.bytes(), 12);
    }
}
