//! Ticket authority
//!
//! Issues and validates watch tickets. At most one ticket is active per
//! (user, video) pair: re-requesting a ticket while one is active returns the
//! existing ticket instead of minting a second one. Issuance for the same pair
//! is serialized by the entry lock of the active index; different pairs never
//! contend.

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::WatchError;
use crate::types::{PlaylistId, Ticket, TicketId, TicketStatus, UserId, VideoId};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Issues, validates and retires tickets
#[derive(Debug)]
pub struct TicketAuthority {
    tickets: DashMap<TicketId, Ticket>,
    /// (user, video) -> currently active ticket
    active: DashMap<(UserId, VideoId), TicketId>,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl TicketAuthority {
    /// Create authority with a fixed ticket TTL
    #[must_use]
    pub fn new(catalog: Arc<dyn Catalog>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            tickets: DashMap::new(),
            active: DashMap::new(),
            catalog,
            clock,
            ttl,
        }
    }

    /// Issue a ticket, reusing the active one for the same (user, video)
    ///
    /// # Errors
    /// - `WatchError::InvalidTarget` if the catalog does not know the pair
    /// - `WatchError::Catalog` if the catalog is unreachable
    pub async fn issue(
        &self,
        user_id: UserId,
        video_id: VideoId,
        playlist_id: PlaylistId,
    ) -> Result<Ticket, WatchError> {
        if self.catalog.resolve(&video_id, &playlist_id).await?.is_none() {
            tracing::debug!("Rejecting ticket for unknown target {}/{}", playlist_id, video_id);
            return Err(WatchError::InvalidTarget {
                video_id,
                playlist_id,
            });
        }

        let now = self.clock.now();
        match self.active.entry((user_id, video_id.clone())) {
            Entry::Occupied(mut slot) => {
                let current = *slot.get();
                if let Some(mut existing) = self.tickets.get_mut(&current) {
                    if existing.status_at(now) == TicketStatus::Active {
                        tracing::debug!("Reusing active ticket {} for user {}", current, user_id);
                        return Ok(existing.clone());
                    }
                    if existing.status == TicketStatus::Active {
                        existing.status = TicketStatus::Expired;
                    }
                }
                let ticket = self.mint(user_id, video_id, playlist_id, now);
                slot.insert(ticket.ticket_id);
                tracing::info!("Superseded stale ticket {} with {}", current, ticket.ticket_id);
                Ok(ticket)
            }
            Entry::Vacant(slot) => {
                let ticket = self.mint(user_id, video_id, playlist_id, now);
                slot.insert(ticket.ticket_id);
                tracing::info!("Issued ticket {} for user {}", ticket.ticket_id, user_id);
                Ok(ticket)
            }
        }
    }

    fn mint(
        &self,
        user_id: UserId,
        video_id: VideoId,
        playlist_id: PlaylistId,
        now: DateTime<Utc>,
    ) -> Ticket {
        loop {
            let ticket = Ticket::mint(user_id, video_id.clone(), playlist_id, now, self.ttl);
            if let Entry::Vacant(slot) = self.tickets.entry(ticket.ticket_id) {
                slot.insert(ticket.clone());
                return ticket;
            }
        }
    }

    /// Validate a ticket without side effects
    ///
    /// # Errors
    /// - `WatchError::TicketNotFound` for unknown ids
    /// - `WatchError::TicketExpired` once the TTL elapsed or the ticket was retired or consumed
    pub fn validate(&self, ticket_id: &TicketId) -> Result<Ticket, WatchError> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .map(|t| t.value().clone())
            .ok_or(WatchError::TicketNotFound(*ticket_id))?;
        match ticket.status_at(self.clock.now()) {
            TicketStatus::Active => Ok(ticket),
            TicketStatus::Expired | TicketStatus::Consumed => {
                Err(WatchError::TicketExpired(*ticket_id))
            }
        }
    }

    /// Ticket record regardless of status
    #[must_use]
    pub fn get(&self, ticket_id: &TicketId) -> Option<Ticket> {
        self.tickets.get(ticket_id).map(|t| t.value().clone())
    }

    /// Active ticket for a (user, video) pair
    #[must_use]
    pub fn current(&self, user_id: UserId, video_id: &VideoId) -> Option<Ticket> {
        let ticket_id = *self.active.get(&(user_id, video_id.clone()))?;
        self.validate(&ticket_id).ok()
    }

    /// Advance the playback segment of an active ticket
    ///
    /// # Errors
    /// Same as [`TicketAuthority::validate`].
    pub fn next_segment(&self, ticket_id: &TicketId) -> Result<Ticket, WatchError> {
        let now = self.clock.now();
        let mut ticket = self
            .tickets
            .get_mut(ticket_id)
            .ok_or(WatchError::TicketNotFound(*ticket_id))?;
        if ticket.status_at(now) != TicketStatus::Active {
            return Err(WatchError::TicketExpired(*ticket_id));
        }
        ticket.segment += 1;
        tracing::debug!("Ticket {} advanced to segment {}", ticket_id, ticket.segment);
        Ok(ticket.clone())
    }

    /// Mark consumed after its session closed
    pub fn consume(&self, ticket_id: &TicketId) {
        self.finish(ticket_id, TicketStatus::Consumed);
    }

    /// Mark expired after its session lapsed
    pub fn retire(&self, ticket_id: &TicketId) {
        self.finish(ticket_id, TicketStatus::Expired);
    }

    fn finish(&self, ticket_id: &TicketId, status: TicketStatus) {
        let key = {
            let Some(mut ticket) = self.tickets.get_mut(ticket_id) else {
                return;
            };
            if ticket.status == TicketStatus::Active {
                ticket.status = status;
            }
            (ticket.user_id, ticket.video_id.clone())
        };
        // ticket guard released first: issue() locks active before tickets
        self.active.remove_if(&key, |_, id| id == ticket_id);
    }

    /// Tickets whose lifetime ended before `cutoff`
    #[must_use]
    pub fn stale(&self, cutoff: DateTime<Utc>) -> Vec<TicketId> {
        self.tickets
            .iter()
            .filter(|t| t.expires_at < cutoff)
            .map(|t| t.ticket_id)
            .collect()
    }

    /// Drop a ticket that is no longer active
    ///
    /// Returns whether a record was removed.
    pub fn forget(&self, ticket_id: &TicketId) -> bool {
        let now = self.clock.now();
        let Some((_, ticket)) = self
            .tickets
            .remove_if(ticket_id, |_, t| t.status_at(now) != TicketStatus::Active)
        else {
            return false;
        };
        self.active
            .remove_if(&(ticket.user_id, ticket.video_id), |_, id| id == ticket_id);
        true
    }

    /// Tickets currently held
    #[inline]
    #[must_use]
    pub fn issued_count(&self) -> usize {
        self.tickets.len()
    }

    /// Pairs with an active ticket
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::clock::ManualClock;
    use crate::types::VideoInfo;
    use chrono::Utc;

    fn authority() -> (TicketAuthority, Arc<ManualClock>) {
        let catalog = InMemoryCatalog::new();
        catalog.insert(PlaylistId(7), VideoInfo::new(VideoId::new("v1"), 300.0));
        catalog.insert(PlaylistId(7), VideoInfo::new(VideoId::new("v2"), 300.0));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let authority = TicketAuthority::new(Arc::new(catalog), clock.clone(), Duration::seconds(600));
        (authority, clock)
    }

    #[tokio::test]
    async fn issue_twice_reuses_active_ticket() {
        let (authority, _) = authority();
        let first = authority.issue(UserId(42), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        let second = authority.issue(UserId(42), VideoId::new("v1"), PlaylistId(7)).await.unwrap();

        assert_eq!(first.ticket_id, second.ticket_id);
        assert_eq!(authority.issued_count(), 1);
    }

    #[tokio::test]
    async fn distinct_pairs_get_distinct_tickets() {
        let (authority, _) = authority();
        let a = authority.issue(UserId(42), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        let b = authority.issue(UserId(42), VideoId::new("v2"), PlaylistId(7)).await.unwrap();
        let c = authority.issue(UserId(43), VideoId::new("v1"), PlaylistId(7)).await.unwrap();

        assert_ne!(a.ticket_id, b.ticket_id);
        assert_ne!(a.ticket_id, c.ticket_id);
        assert_eq!(authority.active_count(), 3);
    }

    #[tokio::test]
    async fn unknown_target_is_rejected() {
        let (authority, _) = authority();
        let result = authority.issue(UserId(1), VideoId::new("nope"), PlaylistId(7)).await;
        assert!(matches!(result, Err(WatchError::InvalidTarget { .. })));

        let result = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(8)).await;
        assert!(matches!(result, Err(WatchError::InvalidTarget { .. })));
        assert_eq!(authority.issued_count(), 0);
    }

    #[tokio::test]
    async fn validate_reports_expiry_after_ttl() {
        let (authority, clock) = authority();
        let ticket = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        assert!(authority.validate(&ticket.ticket_id).is_ok());

        clock.advance(Duration::seconds(600));
        assert!(matches!(
            authority.validate(&ticket.ticket_id),
            Err(WatchError::TicketExpired(_))
        ));
        // validation is side-effect free
        assert_eq!(authority.get(&ticket.ticket_id).unwrap().status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn validate_unknown_ticket() {
        let (authority, _) = authority();
        let result = authority.validate(&TicketId::generate());
        assert!(matches!(result, Err(WatchError::TicketNotFound(_))));
    }

    #[tokio::test]
    async fn expired_ticket_is_superseded() {
        let (authority, clock) = authority();
        let old = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        clock.advance(Duration::seconds(601));

        let new = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        assert_ne!(old.ticket_id, new.ticket_id);
        assert_eq!(authority.get(&old.ticket_id).unwrap().status, TicketStatus::Expired);
        assert_eq!(authority.current(UserId(1), &VideoId::new("v1")).unwrap().ticket_id, new.ticket_id);
    }

    #[tokio::test]
    async fn consumed_ticket_is_not_reused() {
        let (authority, _) = authority();
        let old = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        authority.consume(&old.ticket_id);

        assert!(authority.current(UserId(1), &VideoId::new("v1")).is_none());
        assert!(matches!(
            authority.validate(&old.ticket_id),
            Err(WatchError::TicketExpired(_))
        ));

        let new = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        assert_ne!(old.ticket_id, new.ticket_id);
    }

    #[tokio::test]
    async fn finish_never_revives() {
        let (authority, _) = authority();
        let ticket = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        authority.consume(&ticket.ticket_id);
        authority.retire(&ticket.ticket_id);
        assert_eq!(authority.get(&ticket.ticket_id).unwrap().status, TicketStatus::Consumed);
    }

    #[tokio::test]
    async fn segments_advance_on_active_tickets_only() {
        let (authority, clock) = authority();
        let ticket = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        assert_eq!(ticket.segment, 1);
        assert_eq!(authority.next_segment(&ticket.ticket_id).unwrap().segment, 2);
        assert_eq!(authority.next_segment(&ticket.ticket_id).unwrap().segment, 3);

        clock.advance(Duration::seconds(600));
        assert!(authority.next_segment(&ticket.ticket_id).is_err());
    }

    #[tokio::test]
    async fn forget_drops_finished_tickets_only() {
        let (authority, clock) = authority();
        let live = authority.issue(UserId(1), VideoId::new("v1"), PlaylistId(7)).await.unwrap();
        let done = authority.issue(UserId(1), VideoId::new("v2"), PlaylistId(7)).await.unwrap();
        authority.consume(&done.ticket_id);

        assert!(!authority.forget(&live.ticket_id));
        assert!(authority.forget(&done.ticket_id));
        assert!(authority.get(&done.ticket_id).is_none());
        assert_eq!(authority.issued_count(), 1);

        // lapsed by TTL without ever being finished
        clock.advance(Duration::seconds(601));
        assert_eq!(authority.stale(clock.now()), vec![live.ticket_id]);
        assert!(authority.forget(&live.ticket_id));
        assert_eq!(authority.active_count(), 0);
        assert!(authority.stale(clock.now()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_issue_converges() {
        let (authority, _) = authority();
        let authority = Arc::new(authority);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let authority = authority.clone();
                tokio::spawn(async move {
                    authority
                        .issue(UserId(9), VideoId::new("v1"), PlaylistId(7))
                        .await
                        .unwrap()
                        .ticket_id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(authority.issued_count(), 1);
    }
}
