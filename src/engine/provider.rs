//! Ticket source interface and an in-memory implementation
//!
//! A provider hands the engine two streams per channel: ordinary tickets and
//! backfill tickets. Each stream ends when its sender is dropped.

use crate::error::Result;
use crate::request::{BackfillTicket, MatchmakingRequest};
use async_trait::async_trait;
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Push-style source of tickets for one matchmaking tick
#[async_trait]
pub trait TicketProvider: Send + Sync {
    /// Tickets waiting for a new session
    async fn tickets(&self, channel: &str) -> Result<mpsc::Receiver<MatchmakingRequest>>;

    /// Sessions waiting for more players
    async fn backfill_tickets(&self, channel: &str) -> Result<mpsc::Receiver<BackfillTicket>>;
}

/// Provider backed by fixed lists, used by the CLI and in tests
#[derive(Debug, Default)]
pub struct StaticTicketProvider {
    tickets: RwLock<Vec<MatchmakingRequest>>,
    backfill_tickets: RwLock<Vec<BackfillTicket>>,
}

impl StaticTicketProvider {
    pub fn new(tickets: Vec<MatchmakingRequest>, backfill_tickets: Vec<BackfillTicket>) -> Self {
        Self {
            tickets: RwLock::new(tickets),
            backfill_tickets: RwLock::new(backfill_tickets),
        }
    }

    pub fn add_ticket(&self, ticket: MatchmakingRequest) {
        if let Ok(mut tickets) = self.tickets.write() {
            tickets.push(ticket);
        }
    }

    pub fn add_backfill_ticket(&self, ticket: BackfillTicket) {
        if let Ok(mut tickets) = self.backfill_tickets.write() {
            tickets.push(ticket);
        }
    }
}

/// Load `items` into a closed, pre-filled channel
fn prefilled<T: Send + 'static>(items: Vec<T>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        // capacity covers every item
        let _ = tx.try_send(item);
    }
    rx
}

#[async_trait]
impl TicketProvider for StaticTicketProvider {
    async fn tickets(&self, channel: &str) -> Result<mpsc::Receiver<MatchmakingRequest>> {
        let tickets: Vec<MatchmakingRequest> = self
            .tickets
            .read()
            .map(|tickets| {
                tickets
                    .iter()
                    .filter(|ticket| ticket.channel == channel)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(prefilled(tickets))
    }

    async fn backfill_tickets(&self, channel: &str) -> Result<mpsc::Receiver<BackfillTicket>> {
        let tickets: Vec<BackfillTicket> = self
            .backfill_tickets
            .read()
            .map(|tickets| {
                tickets
                    .iter()
                    .filter(|ticket| ticket.session.channel == channel)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(prefilled(tickets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::MatchmakingResult;
    use crate::utils::current_timestamp;

    fn create_test_ticket(id: &str, channel: &str) -> MatchmakingRequest {
        MatchmakingRequest::new(id, current_timestamp()).with_channel(channel)
    }

    #[tokio::test]
    async fn test_static_provider_filters_by_channel() {
        let provider = StaticTicketProvider::new(
            vec![
                create_test_ticket("a", "ranked"),
                create_test_ticket("b", "casual"),
                create_test_ticket("c", "ranked"),
            ],
            Vec::new(),
        );

        let mut rx = provider.tickets("ranked").await.unwrap();
        let mut ids = Vec::new();
        while let Some(ticket) = rx.recv().await {
            ids.push(ticket.ticket_id);
        }
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_empty_streams_close_immediately() {
        let provider = StaticTicketProvider::default();
        tokio_test::block_on(async {
            assert!(provider.tickets("ranked").await.unwrap().recv().await.is_none());
            assert!(provider
                .backfill_tickets("ranked")
                .await
                .unwrap()
                .recv()
                .await
                .is_none());
        });
    }

    #[tokio::test]
    async fn test_added_backfill_tickets_are_served() {
        let provider = StaticTicketProvider::default();
        provider.add_backfill_ticket(BackfillTicket::new(MatchmakingResult::new(
            "ranked",
            current_timestamp(),
        )));
        provider.add_ticket(create_test_ticket("a", "ranked"));

        let mut sessions = provider.backfill_tickets("ranked").await.unwrap();
        assert!(sessions.recv().await.is_some());
        assert!(sessions.recv().await.is_none());
    }
}
