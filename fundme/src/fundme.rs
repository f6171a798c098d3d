//! Custodial Funding Ledger
//!
//! This module implements the bookkeeping core of a custodial funding
//! pool. It guarantees:
//! 1. Conservation of funds - the pool balance equals the sum of live
//!    contributions at all times between completed operations
//! 2. Threshold gating - contributions worth less than the USD minimum
//!    are rejected before any state is written
//! 3. Owner exclusivity - only the identity recorded at initialization
//!    can withdraw
//! 4. All-or-nothing operations - a call that returns Err leaves the
//!    ledger bit-identical
//!
//! All data structures are laid out in a single contiguous memory chunk,
//! suitable for a single Solana account.

#![no_std]
#![forbid(unsafe_code)]

// ============================================================================
// Constants
// ============================================================================

// MAX_FUNDING_EVENTS is feature-configured, not target-configured.
// This ensures x86 and SBF builds use the same sizes for a given feature set.
#[cfg(feature = "test")]
pub const MAX_FUNDING_EVENTS: usize = 64; // Small for tests

#[cfg(not(feature = "test"))]
pub const MAX_FUNDING_EVENTS: usize = 4096; // Production

/// Minimum accepted contribution value, in USD micro-units (e6).
pub const MINIMUM_USD_E6: u64 = 50_000_000; // $50

// ============================================================================
// Core Data Structures
// ============================================================================

/// One funder's cumulative contribution.
///
/// Slots persist once created: a withdrawal zeroes `amount` but keeps the
/// key, so a returning funder reuses the same slot. Through the read API a
/// zeroed slot is indistinguishable from an absent one.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Contribution {
    pub funder: [u8; 32],
    pub amount: u64,
}

fn empty_contribution() -> Contribution {
    Contribution {
        funder: [0u8; 32],
        amount: 0,
    }
}

/// Custodial funding ledger.
///
/// Field order matches the on-chain slab layout: scalars first, then the
/// two fixed arrays (roster, contribution table).
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingLedger {
    /// Withdrawal authority, fixed at initialization and never reassigned
    pub owner: [u8; 32],

    /// Pooled contributions in native subunits.
    /// Equals the sum of live contribution amounts (conservation invariant).
    pub pool_balance: u64,

    /// Number of live roster entries = successful fund calls since the
    /// last successful withdrawal
    pub funding_events: u32,

    /// Number of occupied contribution slots (never shrinks)
    pub contributions_len: u32,

    /// Decimal places of the native unit: 10^unit_decimals subunits per
    /// whole unit. Set at initialization from the deployment's mint.
    pub unit_decimals: u8,

    pub _padding: [u8; 7],

    /// Funder roster: append-only log of funder identities, one entry per
    /// successful fund call, duplicates included. Reset by withdrawal.
    pub funders: [[u8; 32]; MAX_FUNDING_EVENTS],

    /// Contribution table: identity -> cumulative amount
    pub contributions: [Contribution; MAX_FUNDING_EVENTS],
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerError {
    /// Caller is not the recorded owner
    NotOwner,

    /// Contribution value below the USD minimum
    InsufficientContribution,

    /// Roster index past the end
    IndexOutOfRange,

    /// Fixed-capacity storage exhausted
    LedgerFull,

    /// Arithmetic overflow
    Overflow,
}

pub type Result<T> = core::result::Result<T, LedgerError>;

// ============================================================================
// Math Helpers (Checked Arithmetic - Conservation Has No Slack)
// ============================================================================

#[inline]
fn add_u64(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b).ok_or(LedgerError::Overflow)
}

#[inline]
fn pow10_u128(exp: u8) -> Result<u128> {
    10u128.checked_pow(exp as u32).ok_or(LedgerError::Overflow)
}

// ============================================================================
// Core Implementation
// ============================================================================

impl FundingLedger {
    /// Create a new ledger (stack-allocates the full struct - avoid in BPF!)
    ///
    /// WARNING: This allocates ~290KB on the stack at MAX_FUNDING_EVENTS=4096.
    /// For Solana BPF programs, use `init_in_place` instead.
    pub fn new(owner: [u8; 32], unit_decimals: u8) -> Self {
        Self {
            owner,
            pool_balance: 0,
            funding_events: 0,
            contributions_len: 0,
            unit_decimals,
            _padding: [0u8; 7],
            funders: [[0u8; 32]; MAX_FUNDING_EVENTS],
            contributions: [empty_contribution(); MAX_FUNDING_EVENTS],
        }
    }

    /// Initialize a FundingLedger in place (zero-copy friendly).
    ///
    /// PREREQUISITE: The memory backing `self` MUST be zeroed before calling.
    /// This method only sets non-zero fields to avoid touching the full slab.
    ///
    /// This is the correct way to initialize FundingLedger in Solana BPF
    /// programs where stack space is limited to 4KB.
    pub fn init_in_place(&mut self, owner: [u8; 32], unit_decimals: u8) {
        self.owner = owner;
        self.unit_decimals = unit_decimals;
        // All other fields are zero which is correct for:
        // - pool_balance = 0, funding_events = 0, contributions_len = 0
        // - funders / contributions = all zeros (empty roster and table)
    }

    // ========================================
    // Price Conversion
    // ========================================

    /// USD value of `amount` native subunits, in micro-units (e6).
    ///
    /// `price_e6` is USD micro-units per whole native unit. The multiply
    /// runs before the divide, in u128, so nothing is truncated ahead of
    /// the final division.
    pub fn usd_value_e6(amount: u64, price_e6: u64, unit_decimals: u8) -> Result<u64> {
        let scale = pow10_u128(unit_decimals)?;
        // u64 * u64 always fits u128
        let usd = (amount as u128) * (price_e6 as u128) / scale;
        if usd > u64::MAX as u128 {
            return Err(LedgerError::Overflow);
        }
        Ok(usd as u64)
    }

    // ========================================
    // Fund
    // ========================================

    /// Record a contribution of `amount` native subunits from `funder`,
    /// valued at `price_e6` USD micro-units per whole unit.
    ///
    /// Rejects with `InsufficientContribution` when the contribution is
    /// worth less than `MINIMUM_USD_E6`; a value exactly at the minimum
    /// passes. On success the roster gains one entry (repeat funders
    /// appear once per call), the funder's cumulative amount and the pool
    /// both grow by `amount`.
    ///
    /// All checks complete before the commit; on Err nothing is written.
    pub fn fund(&mut self, funder: [u8; 32], amount: u64, price_e6: u64) -> Result<()> {
        let usd_e6 = Self::usd_value_e6(amount, price_e6, self.unit_decimals)?;
        if usd_e6 < MINIMUM_USD_E6 {
            return Err(LedgerError::InsufficientContribution);
        }

        let event = self.funding_events as usize;
        if event >= MAX_FUNDING_EVENTS {
            return Err(LedgerError::LedgerFull);
        }

        // Contribution slots outlive withdrawals, so the table can fill
        // independently of the roster.
        let (slot, fresh) = match self.position_of(&funder) {
            Some(idx) => (idx, false),
            None => {
                let next = self.contributions_len as usize;
                if next >= MAX_FUNDING_EVENTS {
                    return Err(LedgerError::LedgerFull);
                }
                (next, true)
            }
        };
        let new_amount = add_u64(self.contributions[slot].amount, amount)?;
        let new_pool = add_u64(self.pool_balance, amount)?;

        // Commit
        if fresh {
            self.contributions[slot].funder = funder;
            self.contributions_len += 1;
        }
        self.contributions[slot].amount = new_amount;
        self.funders[event] = funder;
        self.funding_events += 1;
        self.pool_balance = new_pool;
        Ok(())
    }

    // ========================================
    // Withdraw
    // ========================================

    /// Withdraw the entire pool, clearing every recorded contribution.
    ///
    /// Owner-only. Returns the drained pool balance; an empty ledger
    /// withdraws 0. Bookkeeping completes before the caller moves any
    /// tokens; if the outer transfer then fails, the whole Solana
    /// transaction aborts and this state change is discarded with it.
    ///
    /// Clearing walks the roster in insertion order and zeroes the
    /// matching contribution per element, re-reading the roster length
    /// every iteration; funders appearing multiple times are re-zeroed
    /// idempotently. `cheaper_withdraw` is the single-pass equivalent.
    pub fn withdraw(&mut self, caller: &[u8; 32]) -> Result<u64> {
        self.require_owner(caller)?;

        let mut i = 0usize;
        while i < self.funding_events as usize {
            let funder = self.funders[i];
            self.zero_contribution(&funder);
            i += 1;
        }

        Ok(self.finish_withdrawal())
    }

    /// Withdraw the entire pool, clearing every recorded contribution.
    ///
    /// Observably identical to `withdraw` for every input and state, but
    /// clears in one pass over the contribution table instead of one
    /// table scan per roster element. Every slot with a nonzero amount
    /// was written by a fund call that also appended to the roster, so
    /// both strategies zero exactly the same set.
    pub fn cheaper_withdraw(&mut self, caller: &[u8; 32]) -> Result<u64> {
        self.require_owner(caller)?;

        let n = self.contributions_len as usize;
        for contribution in self.contributions[..n].iter_mut() {
            contribution.amount = 0;
        }

        Ok(self.finish_withdrawal())
    }

    fn require_owner(&self, caller: &[u8; 32]) -> Result<()> {
        if *caller != self.owner {
            return Err(LedgerError::NotOwner);
        }
        Ok(())
    }

    fn zero_contribution(&mut self, funder: &[u8; 32]) {
        if let Some(idx) = self.position_of(funder) {
            self.contributions[idx].amount = 0;
        }
    }

    /// Completion step shared by both withdrawal algorithms: reset the
    /// roster and drain the pool, returning the drained amount.
    fn finish_withdrawal(&mut self) -> u64 {
        self.funding_events = 0;
        let payout = self.pool_balance;
        self.pool_balance = 0;
        payout
    }

    // ========================================
    // Read Accessors
    // ========================================

    /// Cumulative amount funded by `funder`; 0 for unknown identities.
    pub fn amount_funded(&self, funder: &[u8; 32]) -> u64 {
        match self.position_of(funder) {
            Some(idx) => self.contributions[idx].amount,
            None => 0,
        }
    }

    /// Funder identity at roster position `index` (insertion order,
    /// duplicates included).
    pub fn funder(&self, index: usize) -> Result<[u8; 32]> {
        if index >= self.funding_events as usize {
            return Err(LedgerError::IndexOutOfRange);
        }
        Ok(self.funders[index])
    }

    /// Roster length: successful fund calls since the last withdrawal.
    pub fn funder_count(&self) -> usize {
        self.funding_events as usize
    }

    fn position_of(&self, funder: &[u8; 32]) -> Option<usize> {
        let n = self.contributions_len as usize;
        self.contributions[..n]
            .iter()
            .position(|c| c.funder == *funder)
    }

    // ========================================
    // Invariant Checks
    // ========================================

    /// Conservation invariant: the pool equals the sum of live
    /// contribution amounts exactly. The bookkeeping has no rounding
    /// anywhere, so there is no slack term.
    pub fn check_conservation(&self) -> bool {
        let n = self.contributions_len as usize;
        let mut total: u128 = 0;
        for contribution in self.contributions[..n].iter() {
            total += contribution.amount as u128;
        }
        total == self.pool_balance as u128
    }
}
