//! Live connection set
//!
//! The registry is the only place that maps a [`ClientId`] to a writable
//! connection. Once a client is unregistered, deliveries for its id are
//! refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::core::{ClientId, ReplySink};
use crate::log_debug;

pub type Outbound = mpsc::UnboundedSender<String>;

struct ClientSlot {
    nick: String,
    outbound: Outbound,
}

pub struct ClientRegistry {
    server_name: String,
    next_id: AtomicU64,
    clients: RwLock<HashMap<ClientId, ClientSlot>>,
}

impl ClientRegistry {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            next_id: AtomicU64::new(1),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ClientId, ClientSlot>> {
        self.clients.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, ClientSlot>> {
        self.clients.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a connection and return its id and nick
    pub fn register(&self, outbound: Outbound) -> (ClientId, String) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let nick = format!("client{}", id.0);
        self.write().insert(
            id,
            ClientSlot {
                nick: nick.clone(),
                outbound,
            },
        );
        log_debug!("Registered {} as {}", id, nick);
        (id, nick)
    }

    pub fn unregister(&self, id: ClientId) {
        if self.write().remove(&id).is_some() {
            log_debug!("Unregistered {}", id);
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn format_numeric(&self, nick: &str, numeric: u16, text: &str) -> String {
        format!(":{} {:03} {} {}\r\n", self.server_name, numeric, nick, text)
    }
}

impl ReplySink for ClientRegistry {
    fn is_live(&self, client: ClientId) -> bool {
        self.read().contains_key(&client)
    }

    fn deliver(&self, destination: ClientId, numeric: u16, text: &str) -> bool {
        let clients = self.read();
        let Some(slot) = clients.get(&destination) else {
            return false;
        };
        let line = self.format_numeric(&slot.nick, numeric, text);
        slot.outbound.send(line).is_ok()
    }
}
