//! Address pool and lease table.
//!
//! The pool is a fixed run of IPv4 addresses `[start, start + size)`. Each
//! pool index maps to exactly one address and holds at most one [`Lease`].
//! An index without an entry is free; an index whose lease expired is
//! reclaimable. Expired entries are never purged in the background, only
//! overwritten when [`LeaseTable::free_lease`] hands their index out again.
//!
//! The table also remembers the last OFFER made to each client for a short
//! while, so repeated DISCOVERs see the same address.
//!
//! # Thread Safety
//!
//! [`LeaseTable`] is a plain data structure. The
//! [`LeaseManager`](crate::LeaseManager) owns it behind a single mutex.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// How long an OFFER is remembered for the client it was made to.
///
/// A remembered offer does not reserve its index; it only lets a client that
/// re-sends DISCOVER see the same address again while nobody else has bound it.
const OFFER_TIMEOUT_SECONDS: i64 = 60;

/// Formats a client hardware address as lowercase colon-separated hex,
/// e.g. `aa:bb:cc:dd:ee:01`.
pub fn format_hardware_address(chaddr: &[u8]) -> String {
    chaddr
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// A time-bounded assignment of one pool address to one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Client hardware address, as produced by [`format_hardware_address`].
    pub client_id: String,

    /// When this lease expires (UTC).
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Creates a lease running for `duration_seconds` from `now`.
    pub fn new(client_id: impl Into<String>, now: DateTime<Utc>, duration_seconds: u32) -> Self {
        Self {
            client_id: client_id.into(),
            expires_at: now + TimeDelta::seconds(i64::from(duration_seconds)),
        }
    }

    /// True once the expiry lies strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// The contiguous range of addresses the server hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePool {
    start: Ipv4Addr,
    size: usize,
}

impl LeasePool {
    pub fn new(start: Ipv4Addr, size: usize) -> Self {
        Self { start, size }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pool_start, config.pool_size as usize)
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Address of pool index `index`, or `None` past the end of the pool.
    pub fn address(&self, index: usize) -> Option<Ipv4Addr> {
        if index >= self.size {
            return None;
        }
        let offset = u32::try_from(index).ok()?;
        u32::from(self.start).checked_add(offset).map(Ipv4Addr::from)
    }

    /// Pool index of `ip`, or `None` when `ip` lies outside the pool.
    pub fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let offset = u32::from(ip).checked_sub(u32::from(self.start))?;
        let index = usize::try_from(offset).ok()?;
        (index < self.size).then_some(index)
    }
}

/// Outcome of [`LeaseTable::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The index was free (or expired) and now belongs to the client.
    Bound(Lease),
    /// The client already held the index; its expiry was extended.
    Renewed(Lease),
    /// The index lies outside the pool.
    OutOfRange,
    /// Another client holds an unexpired lease on the index.
    Conflict { holder: String },
}

/// An OFFER made to a client that has not yet sent REQUEST.
#[derive(Debug, Clone, Copy)]
struct PendingOffer {
    index: usize,
    expires_at: DateTime<Utc>,
}

/// Lease entries keyed by pool index.
#[derive(Debug, Clone)]
pub struct LeaseTable {
    pool: LeasePool,
    leases: HashMap<usize, Lease>,
    offers: HashMap<String, PendingOffer>,
}

impl LeaseTable {
    pub fn new(pool: LeasePool) -> Self {
        Self {
            pool,
            leases: HashMap::new(),
            offers: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &LeasePool {
        &self.pool
    }

    pub fn get(&self, index: usize) -> Option<&Lease> {
        self.leases.get(&index)
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Entries in pool order.
    pub fn entries(&self) -> Vec<(usize, &Lease)> {
        let mut entries: Vec<_> = self.leases.iter().map(|(index, lease)| (*index, lease)).collect();
        entries.sort_by_key(|(index, _)| *index);
        entries
    }

    /// Index held by `client_id`, expired or not.
    ///
    /// Linear scan over the table. Pools are tens of addresses, so there is
    /// no reverse client → index map to keep in sync.
    pub fn find_client(&self, client_id: &str) -> Option<usize> {
        self.leases
            .iter()
            .filter(|(_, lease)| lease.client_id == client_id)
            .map(|(index, _)| *index)
            .min()
    }

    /// True when `index` has no entry or its lease expired before `now`.
    pub fn is_available(&self, index: usize, now: DateTime<Utc>) -> bool {
        self.leases
            .get(&index)
            .is_none_or(|lease| lease.is_expired_at(now))
    }

    /// Picks an index for a new client, starting the scan at a random index.
    ///
    /// Returns `None` only when every index holds an unexpired lease.
    pub fn free_lease<R: Rng>(&self, now: DateTime<Utc>, rng: &mut R) -> Option<usize> {
        if self.pool.is_empty() {
            return None;
        }
        let start = rng.gen_range(0..self.pool.len());
        self.free_lease_from(start, now)
    }

    /// Scans `start..size`, then wraps to `0..start`, and returns the first
    /// available index.
    pub fn free_lease_from(&self, start: usize, now: DateTime<Utc>) -> Option<usize> {
        let size = self.pool.len();
        let start = start.min(size);
        (start..size)
            .chain(0..start)
            .find(|index| self.is_available(*index, now))
    }

    /// Index last offered to `client_id`, if the offer is recent and nobody
    /// else has bound the index since.
    pub fn offer_for(&self, client_id: &str, now: DateTime<Utc>) -> Option<usize> {
        let offer = self.offers.get(client_id)?;
        let current = offer.expires_at >= now
            && self
                .leases
                .get(&offer.index)
                .is_none_or(|lease| lease.client_id == client_id || lease.is_expired_at(now));
        current.then_some(offer.index)
    }

    /// Records that `index` was offered to `client_id`. Stale offers from
    /// other clients are dropped on the way.
    pub fn remember_offer(&mut self, client_id: &str, index: usize, now: DateTime<Utc>) {
        self.offers.retain(|_, offer| offer.expires_at >= now);
        self.offers.insert(
            client_id.to_string(),
            PendingOffer {
                index,
                expires_at: now + TimeDelta::seconds(OFFER_TIMEOUT_SECONDS),
            },
        );
    }

    /// Number of remembered offers.
    pub fn pending_offers(&self) -> usize {
        self.offers.len()
    }

    /// Binds `index` to `client_id` until `now + duration_seconds`.
    ///
    /// Succeeds when the index is free, expired, or already held by the
    /// same client. Any other index the client still held is released so a
    /// client never owns two entries.
    pub fn claim(
        &mut self,
        index: usize,
        client_id: &str,
        now: DateTime<Utc>,
        duration_seconds: u32,
    ) -> Claim {
        if index >= self.pool.len() {
            return Claim::OutOfRange;
        }

        let renewing = match self.leases.get(&index) {
            Some(lease) if lease.client_id == client_id => true,
            Some(lease) if !lease.is_expired_at(now) => {
                return Claim::Conflict {
                    holder: lease.client_id.clone(),
                };
            }
            _ => false,
        };

        self.leases
            .retain(|held, lease| *held == index || lease.client_id != client_id);
        self.offers.remove(client_id);

        let lease = Lease::new(client_id, now, duration_seconds);
        self.leases.insert(index, lease.clone());

        if renewing {
            Claim::Renewed(lease)
        } else {
            Claim::Bound(lease)
        }
    }

    /// Removes the entry held by `client_id` and returns its index.
    pub fn release_client(&mut self, client_id: &str) -> Option<usize> {
        self.offers.remove(client_id);
        let index = self.find_client(client_id)?;
        self.leases.remove(&index);
        Some(index)
    }

    /// Test and tooling hook: forces an entry regardless of ownership.
    pub fn insert(&mut self, index: usize, lease: Lease) -> Option<Lease> {
        self.leases.insert(index, lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const CLIENT_A: &str = "aa:bb:cc:dd:ee:01";
    const CLIENT_B: &str = "aa:bb:cc:dd:ee:02";

    fn pool() -> LeasePool {
        LeasePool::new(Ipv4Addr::new(10, 0, 0, 10), 50)
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_format_hardware_address() {
        assert_eq!(
            format_hardware_address(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
            CLIENT_A
        );
        assert_eq!(format_hardware_address(&[]), "");
    }

    #[test]
    fn test_lease_expiry_is_strict() {
        let lease = Lease::new(CLIENT_A, now(), 0);
        assert!(!lease.is_expired_at(now()));
        assert!(lease.is_expired_at(now() + TimeDelta::seconds(1)));

        let lease = Lease::new(CLIENT_A, now(), 7200);
        assert_eq!(lease.remaining_seconds_at(now()), 7200);
        assert_eq!(lease.remaining_seconds_at(now() + TimeDelta::hours(3)), 0);
    }

    #[test]
    fn test_pool_addressing() {
        let pool = pool();
        assert_eq!(pool.address(0), Some(Ipv4Addr::new(10, 0, 0, 10)));
        assert_eq!(pool.address(49), Some(Ipv4Addr::new(10, 0, 0, 59)));
        assert_eq!(pool.address(50), None);

        assert_eq!(pool.index_of(Ipv4Addr::new(10, 0, 0, 10)), Some(0));
        assert_eq!(pool.index_of(Ipv4Addr::new(10, 0, 0, 59)), Some(49));
        assert_eq!(pool.index_of(Ipv4Addr::new(10, 0, 0, 60)), None);
        assert_eq!(pool.index_of(Ipv4Addr::new(10, 0, 0, 9)), None);
        assert_eq!(pool.index_of(Ipv4Addr::new(0, 0, 0, 0)), None);
    }

    #[test]
    fn test_free_lease_scans_forward_then_wraps() {
        let mut table = LeaseTable::new(pool());
        for index in 40..50 {
            table.insert(index, Lease::new(format!("client-{}", index), now(), 3600));
        }

        assert_eq!(table.free_lease_from(10, now()), Some(10));
        assert_eq!(table.free_lease_from(45, now()), Some(0));
    }

    #[test]
    fn test_free_lease_reclaims_expired() {
        let mut table = LeaseTable::new(LeasePool::new(Ipv4Addr::new(10, 0, 0, 10), 3));
        table.insert(0, Lease::new("a", now(), 3600));
        table.insert(1, Lease::new("b", now() - TimeDelta::hours(3), 3600));
        table.insert(2, Lease::new("c", now(), 3600));

        assert_eq!(table.free_lease_from(0, now()), Some(1));
        assert_eq!(table.free_lease_from(2, now()), Some(1));
    }

    #[test]
    fn test_free_lease_exhausted() {
        let mut table = LeaseTable::new(LeasePool::new(Ipv4Addr::new(10, 0, 0, 10), 4));
        for index in 0..4 {
            table.insert(index, Lease::new(format!("client-{}", index), now(), 3600));
        }

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(table.free_lease(now(), &mut rng), None);
        assert_eq!(table.free_lease_from(0, now()), None);
    }

    #[test]
    fn test_free_lease_random_start_stays_in_range() {
        let table = LeaseTable::new(pool());
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let index = table.free_lease(now(), &mut rng).unwrap();
            assert!(index < 50);
        }
    }

    #[test]
    fn test_claim_free_index() {
        let mut table = LeaseTable::new(pool());
        let claim = table.claim(5, CLIENT_A, now(), 7200);

        assert!(matches!(claim, Claim::Bound(ref lease) if lease.client_id == CLIENT_A));
        assert_eq!(table.find_client(CLIENT_A), Some(5));
        assert_eq!(
            table.get(5).unwrap().expires_at,
            now() + TimeDelta::hours(2)
        );
    }

    #[test]
    fn test_claim_renews_own_lease() {
        let mut table = LeaseTable::new(pool());
        table.claim(5, CLIENT_A, now(), 7200);

        let later = now() + TimeDelta::minutes(30);
        let claim = table.claim(5, CLIENT_A, later, 7200);

        assert!(matches!(claim, Claim::Renewed(_)));
        assert_eq!(table.get(5).unwrap().expires_at, later + TimeDelta::hours(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_claim_conflict_leaves_binding() {
        let mut table = LeaseTable::new(pool());
        table.claim(5, CLIENT_A, now(), 7200);

        let claim = table.claim(5, CLIENT_B, now(), 7200);
        assert_eq!(
            claim,
            Claim::Conflict {
                holder: CLIENT_A.to_string()
            }
        );
        assert_eq!(table.get(5).unwrap().client_id, CLIENT_A);
        assert_eq!(table.find_client(CLIENT_B), None);
    }

    #[test]
    fn test_claim_takes_over_expired_lease() {
        let mut table = LeaseTable::new(pool());
        table.claim(5, CLIENT_A, now() - TimeDelta::hours(3), 7200);

        let claim = table.claim(5, CLIENT_B, now(), 7200);
        assert!(matches!(claim, Claim::Bound(_)));
        assert_eq!(table.get(5).unwrap().client_id, CLIENT_B);
        assert_eq!(table.find_client(CLIENT_A), None);
    }

    #[test]
    fn test_claim_out_of_range() {
        let mut table = LeaseTable::new(pool());
        assert_eq!(table.claim(50, CLIENT_A, now(), 7200), Claim::OutOfRange);
        assert!(table.is_empty());
    }

    #[test]
    fn test_claim_moves_client_binding() {
        let mut table = LeaseTable::new(pool());
        table.claim(5, CLIENT_A, now(), 7200);
        table.claim(9, CLIENT_A, now(), 7200);

        assert_eq!(table.len(), 1);
        assert_eq!(table.find_client(CLIENT_A), Some(9));
        assert!(table.get(5).is_none());
    }

    #[test]
    fn test_release_client() {
        let mut table = LeaseTable::new(pool());
        table.claim(5, CLIENT_A, now(), 7200);

        assert_eq!(table.release_client(CLIENT_A), Some(5));
        assert!(table.is_available(5, now()));
        assert_eq!(table.release_client(CLIENT_A), None);
    }

    #[test]
    fn test_offer_remembered_until_timeout() {
        let mut table = LeaseTable::new(pool());
        table.remember_offer(CLIENT_A, 7, now());

        assert_eq!(table.offer_for(CLIENT_A, now()), Some(7));
        assert_eq!(table.offer_for(CLIENT_A, now() + TimeDelta::seconds(60)), Some(7));
        assert_eq!(table.offer_for(CLIENT_A, now() + TimeDelta::seconds(61)), None);
        assert_eq!(table.offer_for(CLIENT_B, now()), None);
    }

    #[test]
    fn test_offer_does_not_reserve_index() {
        let mut table = LeaseTable::new(pool());
        table.remember_offer(CLIENT_A, 7, now());

        assert!(table.is_available(7, now()));
        assert!(matches!(table.claim(7, CLIENT_B, now(), 7200), Claim::Bound(_)));
        assert_eq!(table.offer_for(CLIENT_A, now()), None);
    }

    #[test]
    fn test_claim_and_release_forget_offer() {
        let mut table = LeaseTable::new(pool());
        table.remember_offer(CLIENT_A, 7, now());
        table.claim(7, CLIENT_A, now(), 7200);
        assert_eq!(table.pending_offers(), 0);

        table.remember_offer(CLIENT_B, 8, now());
        table.release_client(CLIENT_B);
        assert_eq!(table.pending_offers(), 0);
    }

    #[test]
    fn test_stale_offers_pruned() {
        let mut table = LeaseTable::new(pool());
        table.remember_offer(CLIENT_A, 7, now());
        table.remember_offer(CLIENT_B, 8, now() + TimeDelta::minutes(5));
        assert_eq!(table.pending_offers(), 1);
    }

    #[test]
    fn test_large_pool_allocates_lazily() {
        let mut table = LeaseTable::new(LeasePool::new(Ipv4Addr::new(10, 0, 0, 0), u32::MAX as usize));
        assert!(table.is_empty());

        assert_eq!(table.free_lease_from(1_000_000, now()), Some(1_000_000));
        assert!(matches!(table.claim(1_000_000, CLIENT_A, now(), 7200), Claim::Bound(_)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.pool().address(1_000_000), Some(Ipv4Addr::new(10, 15, 66, 64)));
    }

    #[test]
    fn test_entries_in_pool_order() {
        let mut table = LeaseTable::new(pool());
        table.claim(9, CLIENT_B, now(), 7200);
        table.claim(2, CLIENT_A, now(), 7200);

        let indices: Vec<usize> = table.entries().into_iter().map(|(index, _)| index).collect();
        assert_eq!(indices, vec![2, 9]);
    }
}
