//! Single-use terminal tickets.
//!
//! A ticket is issued over an authenticated request and redeemed once at
//! websocket handshake time, so the long-lived bearer token never appears in
//! a URL.

use ctf_common::{CtfError, Identity, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Ticket {
    subject: String,
    instance_id: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedTicket {
    pub ticket: String,
    /// Seconds until the ticket can no longer be redeemed.
    pub expires_in: u64,
}

pub struct TicketStore {
    tickets: DashMap<String, Ticket>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: DashMap::new(),
            ttl,
        }
    }

    pub fn issue(&self, identity: &Identity, instance_id: &str) -> IssuedTicket {
        self.purge_expired();
        let ticket = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.tickets.insert(
            ticket.clone(),
            Ticket {
                subject: identity.subject.clone(),
                instance_id: instance_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(subject = %identity, %instance_id, "Issued terminal ticket");
        IssuedTicket {
            ticket,
            expires_in: self.ttl.as_secs(),
        }
    }

    /// Consumes `ticket`. It is gone after this call whatever the outcome.
    pub fn redeem(&self, ticket: &str, instance_id: &str) -> Result<Identity> {
        let (_, entry) = self
            .tickets
            .remove(ticket)
            .ok_or_else(|| CtfError::Unauthorized("unknown ticket".to_string()))?;
        if entry.expires_at <= Instant::now() {
            return Err(CtfError::Unauthorized("ticket expired".to_string()));
        }
        if entry.instance_id != instance_id {
            return Err(CtfError::Unauthorized(
                "ticket issued for another instance".to_string(),
            ));
        }
        Ok(Identity {
            subject: entry.subject,
        })
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.tickets.retain(|_, t| t.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            subject: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ticket_is_single_use() {
        let store = TicketStore::new(Duration::from_secs(30));
        let issued = store.issue(&alice(), "inst-1");
        assert_eq!(issued.expires_in, 30);
        assert_eq!(issued.ticket.len(), 64);

        assert_eq!(store.redeem(&issued.ticket, "inst-1").unwrap(), alice());
        assert!(store.redeem(&issued.ticket, "inst-1").is_err());
    }

    #[tokio::test]
    async fn test_ticket_bound_to_instance() {
        let store = TicketStore::new(Duration::from_secs(30));
        let issued = store.issue(&alice(), "inst-1");
        assert!(store.redeem(&issued.ticket, "inst-2").is_err());
        // A mismatched attempt still burns the ticket.
        assert!(store.redeem(&issued.ticket, "inst-1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_expires() {
        let store = TicketStore::new(Duration::from_secs(30));
        let issued = store.issue(&alice(), "inst-1");
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            store.redeem(&issued.ticket, "inst-1"),
            Err(CtfError::Unauthorized(_))
        ));

        store.issue(&alice(), "inst-1");
        tokio::time::advance(Duration::from_secs(31)).await;
        store.issue(&alice(), "inst-2");
        assert_eq!(store.len(), 1);
    }
}
