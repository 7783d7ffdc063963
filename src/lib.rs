//! # Time-Locked Custody Contracts
//!
//! Accounting logic for a time-locked custody system: users deposit a
//! fungible token into a **ledger** tied to a fixed unlock delay, later
//! request withdrawal, wait out the delay, then withdraw — or cancel
//! before the delay elapses. A shared **vault** custodies tokens during
//! the request-to-withdraw window across all ledgers.
//!
//! The centerpiece is the rebase-aware proportional accounting engine:
//! the underlying token's balance held by a ledger or the vault can
//! drift independently of explicit deposits and withdrawals
//! (fee-on-transfer, rebasing, or airdrop-style tokens). Every entry
//! point reconciles recorded totals against observed balances and folds
//! any drift into a pool-wide scaling factor, so each holder's share
//! moves proportionally without eagerly rescaling every account.
//!
//! ## Design Principles
//!
//! 1. All monetary operations check for overflow — `checked_add`,
//!    `checked_sub`, and wide intermediates everywhere, because wrapping
//!    arithmetic and money do not mix.
//! 2. Recorded totals are anchored to observed balances: after any
//!    reconciliation step, a pool's recorded deposits equal the ledger's
//!    actual held balance for that token.
//! 3. The vault is a thin, auditable token mover plus anchor store; the
//!    ledger allow-list is its sole trust boundary.
//! 4. Every public state type is serializable (serde) for wire transport
//!    and persistent storage.

pub mod guard;
pub mod ledger;
pub mod math;
pub mod tier;
pub mod token;
pub mod vault;
