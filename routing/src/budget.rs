//! Budget accounting and admission control.
//!
//! Spend is tracked per (scope, scope_id) ledger — session, UTC day, and
//! user — each behind its own lock. A request reserves its estimated cost
//! before the call goes out, then either commits the actual cost or
//! releases the reservation. Denial at any one scope denies the request.
//!
//! Costs are carried as micro-dollars (1 USD = 1 000 000) so long-running
//! aggregation never drifts the way repeated float addition would.
//!
//! Commit and release are idempotent per request id: settling the same
//! request twice changes the ledgers exactly once.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Convert USD to micro-dollars.
pub fn usd_to_micro(usd: f64) -> u64 {
    if usd <= 0.0 {
        0
    } else {
        (usd * 1_000_000.0) as u64
    }
}

/// Convert micro-dollars to USD.
pub fn micro_to_usd(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

/// Accounting boundary against which spend is checked.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// One conversation/session; the ledger is dropped when the session ends.
    Session,
    /// Rolling UTC day; the ledger resets when the date changes.
    Day,
    /// One user, for the process lifetime.
    User,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Day => write!(f, "day"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Key identifying one ledger.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ScopeKey {
    pub scope: BudgetScope,
    pub id: String,
}

impl ScopeKey {
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            scope: BudgetScope::Session,
            id: id.into(),
        }
    }

    pub fn day(id: impl Into<String>) -> Self {
        Self {
            scope: BudgetScope::Day,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            scope: BudgetScope::User,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.id)
    }
}

/// Spending ceilings per scope kind, in micro-dollars. `None` = unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub session_micro: Option<u64>,
    pub day_micro: Option<u64>,
    pub user_micro: Option<u64>,
}

impl BudgetLimits {
    fn limit_for(&self, scope: BudgetScope) -> Option<u64> {
        match scope {
            BudgetScope::Session => self.session_micro,
            BudgetScope::Day => self.day_micro,
            BudgetScope::User => self.user_micro,
        }
    }
}

#[derive(Debug)]
struct Ledger {
    scope: BudgetScope,
    limit_micro: Option<u64>,
    committed_micro: u64,
    reserved_micro: u64,
    window_day: NaiveDate,
}

impl Ledger {
    fn new(scope: BudgetScope, limit_micro: Option<u64>) -> Self {
        Self {
            scope,
            limit_micro,
            committed_micro: 0,
            reserved_micro: 0,
            window_day: Utc::now().date_naive(),
        }
    }

    /// Day ledgers reset when the UTC date rolls over; checked lazily on
    /// every access, no timer.
    fn roll_if_stale(&mut self, today: NaiveDate) {
        if self.scope == BudgetScope::Day && self.window_day != today {
            self.committed_micro = 0;
            self.reserved_micro = 0;
            self.window_day = today;
        }
    }

    fn would_exceed(&self, estimated_micro: u64) -> bool {
        match self.limit_micro {
            None => false,
            Some(limit) => {
                self.committed_micro
                    .saturating_add(self.reserved_micro)
                    .saturating_add(estimated_micro)
                    > limit
            }
        }
    }
}

#[derive(Debug)]
struct Reservation {
    keys: Vec<ScopeKey>,
    amount_micro: u64,
}

/// How many settled request ids are retained for replay detection.
const SETTLED_CAPACITY: usize = 4096;

/// Settled request ids with insertion-ordered eviction, so a long-running
/// process does not retain a Uuid per request forever. Replays older than
/// the retained window are indistinguishable from unknown ids, which settle
/// as no-ops anyway once their reservation is gone.
#[derive(Debug, Default)]
struct SettledSet {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SettledSet {
    /// Returns false if the id was already settled.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > SETTLED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Point-in-time usage of one ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub scope: BudgetScope,
    pub id: String,
    pub committed_micro: u64,
    pub reserved_micro: u64,
    pub limit_micro: Option<u64>,
}

/// Tracks spend against session/day/user ceilings.
///
/// Every ledger has its own lock; multi-ledger operations lock in sorted key
/// order so concurrent requests touching overlapping scopes cannot deadlock.
#[derive(Debug)]
pub struct BudgetGovernor {
    limits: BudgetLimits,
    ledgers: RwLock<HashMap<ScopeKey, Arc<Mutex<Ledger>>>>,
    reservations: Mutex<HashMap<Uuid, Reservation>>,
    settled: Mutex<SettledSet>,
}

impl BudgetGovernor {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            ledgers: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            settled: Mutex::new(SettledSet::default()),
        }
    }

    fn ledger(&self, key: &ScopeKey) -> Arc<Mutex<Ledger>> {
        if let Ok(map) = self.ledgers.read() {
            if let Some(l) = map.get(key) {
                return Arc::clone(l);
            }
        }
        let mut map = self.ledgers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(Ledger::new(
                key.scope,
                self.limits.limit_for(key.scope),
            )))
        }))
    }

    fn lock_sorted<'a>(
        &self,
        arcs: &'a [Arc<Mutex<Ledger>>],
    ) -> Vec<MutexGuard<'a, Ledger>> {
        arcs.iter()
            .map(|a| a.lock().unwrap_or_else(|e| e.into_inner()))
            .collect()
    }

    /// Check every scope and, if all permit, reserve the estimate.
    ///
    /// Returns false (and reserves nothing) when committed + reserved +
    /// estimate would exceed the limit at any scope.
    pub fn check_and_reserve(
        &self,
        request_id: Uuid,
        scope_keys: &[ScopeKey],
        estimated_micro: u64,
    ) -> bool {
        let mut keys: Vec<ScopeKey> = scope_keys.to_vec();
        keys.sort();
        keys.dedup();

        let arcs: Vec<Arc<Mutex<Ledger>>> = keys.iter().map(|k| self.ledger(k)).collect();
        let mut guards = self.lock_sorted(&arcs);

        let today = Utc::now().date_naive();
        for ledger in guards.iter_mut() {
            ledger.roll_if_stale(today);
        }
        if guards.iter().any(|l| l.would_exceed(estimated_micro)) {
            return false;
        }
        for ledger in guards.iter_mut() {
            ledger.reserved_micro = ledger.reserved_micro.saturating_add(estimated_micro);
        }
        drop(guards);

        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        reservations.insert(
            request_id,
            Reservation {
                keys,
                amount_micro: estimated_micro,
            },
        );
        true
    }

    /// Replace a reservation with the actual cost of the completed call.
    ///
    /// Idempotent: a second commit (or a commit after release) for the same
    /// request id is ignored. Unknown ids are logged and ignored.
    pub fn commit_actual(&self, request_id: Uuid, actual_micro: u64) {
        if !self.begin_settlement(request_id) {
            return;
        }
        let Some(reservation) = self.take_reservation(request_id) else {
            warn!(%request_id, "commit for unknown reservation, ignoring");
            return;
        };
        let arcs: Vec<Arc<Mutex<Ledger>>> =
            reservation.keys.iter().map(|k| self.ledger(k)).collect();
        let mut guards = self.lock_sorted(&arcs);
        let today = Utc::now().date_naive();
        for ledger in guards.iter_mut() {
            ledger.roll_if_stale(today);
            ledger.reserved_micro = ledger.reserved_micro.saturating_sub(reservation.amount_micro);
            ledger.committed_micro = ledger.committed_micro.saturating_add(actual_micro);
        }
    }

    /// Return a reservation untouched when the call never happened.
    ///
    /// Idempotent under the same settlement rules as
    /// [`BudgetGovernor::commit_actual`].
    pub fn release_reservation(&self, request_id: Uuid) {
        if !self.begin_settlement(request_id) {
            return;
        }
        let Some(reservation) = self.take_reservation(request_id) else {
            warn!(%request_id, "release for unknown reservation, ignoring");
            return;
        };
        let arcs: Vec<Arc<Mutex<Ledger>>> =
            reservation.keys.iter().map(|k| self.ledger(k)).collect();
        let mut guards = self.lock_sorted(&arcs);
        for ledger in guards.iter_mut() {
            ledger.reserved_micro = ledger.reserved_micro.saturating_sub(reservation.amount_micro);
        }
    }

    /// Drop a session's ledger (the session window has ended).
    pub fn end_session(&self, session_id: &str) {
        let mut map = self.ledgers.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&ScopeKey::session(session_id));
    }

    /// Usage snapshot for every known ledger, sorted by key.
    pub fn usage(&self) -> Vec<BudgetUsage> {
        let map = self.ledgers.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<BudgetUsage> = map
            .iter()
            .map(|(key, ledger)| {
                let ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
                BudgetUsage {
                    scope: key.scope,
                    id: key.id.clone(),
                    committed_micro: ledger.committed_micro,
                    reserved_micro: ledger.reserved_micro,
                    limit_micro: ledger.limit_micro,
                }
            })
            .collect();
        entries.sort_by(|a, b| (a.scope, &a.id).cmp(&(b.scope, &b.id)));
        entries
    }

    /// Mark a request as settled; returns false if it already was.
    fn begin_settlement(&self, request_id: Uuid) -> bool {
        let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
        settled.insert(request_id)
    }

    fn take_reservation(&self, request_id: Uuid) -> Option<Reservation> {
        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        reservations.remove(&request_id)
    }

    #[cfg(test)]
    fn settled_len(&self) -> usize {
        self.settled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ids
            .len()
    }

    #[cfg(test)]
    fn force_window_day(&self, key: &ScopeKey, day: NaiveDate) {
        let ledger = self.ledger(key);
        let mut ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.window_day = day;
    }
}
