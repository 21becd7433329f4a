//! Connection bookkeeping for players at the table
//!
//! This module tracks who is connected to the server:
//! - Player id assignment and capacity limits
//! - Address lookup for incoming datagrams
//! - Heartbeat tracking and timeout detection
//!
//! It knows nothing about turns; the network layer mirrors joins and leaves
//! into the [`TurnedGame`](crate::game::TurnedGame).

use log::info;
use shared::PlayerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Clients silent for longer than this are dropped
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected player
#[derive(Debug)]
pub struct Client {
    pub id: PlayerId,
    pub addr: SocketAddr,
    pub name: String,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
}

impl Client {
    pub fn new(id: PlayerId, addr: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            id,
            addr,
            name: name.into(),
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

pub struct ClientManager {
    clients: HashMap<PlayerId, Client>,
    next_client_id: PlayerId,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a client, returning its id, or `None` when the server is full
    pub fn add_client(&mut self, addr: SocketAddr, name: impl Into<String>) -> Option<PlayerId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr, name);
        info!(
            "Client {} ({}) connected from {}",
            client_id, client.name, addr
        );
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: &PlayerId) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: PlayerId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Refreshes the client's heartbeat; false if the id is unknown
    pub fn touch(&mut self, client_id: PlayerId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    /// Removes clients that have been silent too long and returns their ids
    pub fn check_timeouts(&mut self) -> Vec<PlayerId> {
        self.remove_timed_out(CLIENT_TIMEOUT)
    }

    fn remove_timed_out(&mut self, timeout: Duration) -> Vec<PlayerId> {
        let timed_out: Vec<PlayerId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    pub fn get_client_addrs(&self) -> Vec<(PlayerId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = Client::new(1, test_addr(), "alice");

        assert_eq!(client.id, 1);
        assert_eq!(client.addr, test_addr());
        assert_eq!(client.name, "alice");
        assert!(!client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_client_timeout_and_touch() {
        let mut client = Client::new(1, test_addr(), "alice");
        client.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(client.is_timed_out(Duration::from_secs(1)));

        client.touch();
        assert!(!client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(5);
        assert_eq!(manager.max_clients, 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_add_multiple_clients() {
        let mut manager = ClientManager::new(3);

        let id1 = manager.add_client(test_addr(), "alice").unwrap();
        let id2 = manager.add_client(test_addr2(), "bob").unwrap();

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.get(id2).map(|c| c.name.as_str()), Some("bob"));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);

        assert!(manager.add_client(test_addr(), "alice").is_some());
        assert!(manager.add_client(test_addr2(), "bob").is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_ids_not_reused_after_removal() {
        let mut manager = ClientManager::new(2);

        let id1 = manager.add_client(test_addr(), "alice").unwrap();
        assert!(manager.remove_client(&id1));
        assert!(!manager.remove_client(&id1));

        let id2 = manager.add_client(test_addr(), "alice").unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_find_client_by_addr() {
        let mut manager = ClientManager::new(2);
        let id = manager.add_client(test_addr(), "alice").unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(id));
        assert_eq!(manager.find_client_by_addr(test_addr2()), None);
    }

    #[test]
    fn test_touch_unknown_client() {
        let mut manager = ClientManager::new(2);
        let id = manager.add_client(test_addr(), "alice").unwrap();

        assert!(manager.touch(id));
        assert!(!manager.touch(id + 1));
    }

    #[test]
    fn test_remove_timed_out_clients() {
        let mut manager = ClientManager::new(2);
        let stale = manager.add_client(test_addr(), "alice").unwrap();
        let fresh = manager.add_client(test_addr2(), "bob").unwrap();

        if let Some(client) = manager.clients.get_mut(&stale) {
            client.last_seen = Instant::now() - Duration::from_secs(10);
        }

        assert_eq!(manager.check_timeouts(), vec![stale]);
        assert_eq!(manager.len(), 1);
        assert!(manager.get(fresh).is_some());
    }

    #[test]
    fn test_client_addrs() {
        let mut manager = ClientManager::new(2);
        let id1 = manager.add_client(test_addr(), "alice").unwrap();
        let id2 = manager.add_client(test_addr2(), "bob").unwrap();

        let mut addrs = manager.get_client_addrs();
        addrs.sort_by_key(|(id, _)| *id);
        assert_eq!(addrs, vec![(id1, test_addr()), (id2, test_addr2())]);
    }
}
