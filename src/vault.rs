//! # Shared Custody Vault
//!
//! Holds tokens that ledgers have moved out of their pools during the
//! request-to-withdraw window. One vault instance is shared by every
//! ledger tier in a deployment, so its per-token **anchor** — a believed
//! held balance plus a cumulative drift factor — is contributed to by
//! all ledgers holding that token.
//!
//! ## Security Model
//!
//! - **Allow-list gating**: every mutating call names its calling ledger,
//!   checked against the set wired in at `initialize`. The allow-list is
//!   immutable afterward and is the vault's sole trust boundary.
//! - **Thin mover**: [`Vault::external_transfer`] is the only
//!   token-movement primitive in the system; it performs no anchor
//!   bookkeeping of its own. Anchors are pushed explicitly by the calling
//!   ledger via [`Vault::update_data`] / [`Vault::reset_data`], keeping
//!   the vault a small, auditable component.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::guard::{CallGuard, ReentrancyError};
use crate::math::SCALE_UNIT;
use crate::token::{TokenError, TokenId, TokenRegistry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The vault has not been wired to its ledgers yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// `initialize` was called a second time.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// The caller is not an allow-listed ledger.
    #[error("unauthorized caller: {0} is not an allow-listed ledger")]
    UnauthorizedLedger(String),

    /// The caller is not the owner or a designated manager.
    #[error("unauthorized: owner or manager required")]
    Unauthorized,

    /// A lost-token sweep was attempted while the anchor still records
    /// custodied funds.
    #[error("cannot sweep: anchor still records {recorded} in custody")]
    ActiveAnchor {
        /// Amount the anchor currently records.
        recorded: u64,
    },

    /// An underlying token operation failed.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// A reentrant call was rejected.
    #[error(transparent)]
    Reentered(#[from] ReentrancyError),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-token anchor shared by all ledgers holding that token.
///
/// `deposited` is the vault's believed held balance; `div_factor` is the
/// cumulative proportional drift since the anchor was last reset. A
/// stored factor of zero means "no drift" — the canonical clean state
/// that keeps the factor from compounding across years of operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultTokenAnchor {
    /// Believed total held balance for this token.
    pub deposited: u64,
    /// Cumulative drift factor, or 0 when unset/clean.
    pub div_factor: u128,
}

/// The shared custody vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    address: String,
    owner: String,
    managers: HashSet<String>,
    ledgers: HashSet<String>,
    initialized: bool,
    anchors: HashMap<TokenId, VaultTokenAnchor>,
    free_deposit_credits: u64,
    #[serde(skip)]
    guard: CallGuard,
}

impl Vault {
    /// Creates a vault with the given account address and administrative
    /// owner. The ledger allow-list is wired separately via
    /// [`initialize`](Self::initialize).
    pub fn new(address: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            owner: owner.into(),
            managers: HashSet::new(),
            ledgers: HashSet::new(),
            initialized: false,
            anchors: HashMap::new(),
            free_deposit_credits: 0,
            guard: CallGuard::new(),
        }
    }

    /// The vault's own account address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Remaining free-deposit credits.
    pub fn free_deposit_credits(&self) -> u64 {
        self.free_deposit_credits
    }

    /// Returns the anchor for a token, zeroed if never touched.
    pub fn anchor(&self, token: &str) -> VaultTokenAnchor {
        self.anchors.get(token).copied().unwrap_or_default()
    }

    /// One-time wiring of the ledger allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AlreadyInitialized`] on a second call.
    pub fn initialize(
        &mut self,
        ledgers: impl IntoIterator<Item = String>,
    ) -> Result<(), VaultError> {
        if self.initialized {
            return Err(VaultError::AlreadyInitialized);
        }
        self.ledgers = ledgers.into_iter().collect();
        self.initialized = true;
        tracing::info!(
            vault = %self.address,
            ledgers = self.ledgers.len(),
            "vault initialized"
        );
        Ok(())
    }

    /// Moves tokens on behalf of an allow-listed ledger.
    ///
    /// If `sender` is the vault itself, performs an outbound transfer to
    /// `recipient`; otherwise pulls from `sender` to `recipient` using
    /// the vault's allowance. A fee-required inbound transfer to a
    /// non-vault recipient consumes one free-deposit credit if any
    /// remain.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::UnauthorizedLedger`] if `caller` is not
    /// allow-listed, or the underlying [`TokenError`] if the movement
    /// fails. Failures leave no partial state.
    pub fn external_transfer(
        &mut self,
        tokens: &mut TokenRegistry,
        caller: &str,
        token: &str,
        sender: &str,
        recipient: &str,
        amount: u64,
        fee_required: bool,
    ) -> Result<(), VaultError> {
        self.guard.try_engage()?;
        let out =
            self.external_transfer_inner(tokens, caller, token, sender, recipient, amount, fee_required);
        self.guard.release();
        out
    }

    fn external_transfer_inner(
        &mut self,
        tokens: &mut TokenRegistry,
        caller: &str,
        token: &str,
        sender: &str,
        recipient: &str,
        amount: u64,
        fee_required: bool,
    ) -> Result<(), VaultError> {
        self.require_ledger(caller)?;

        if sender == self.address {
            tokens.transfer(token, &self.address, recipient, amount)?;
        } else {
            tokens.transfer_from(token, &self.address, sender, recipient, amount)?;
            if recipient != self.address && fee_required && self.free_deposit_credits > 0 {
                self.free_deposit_credits -= 1;
            }
        }

        tracing::debug!(
            vault = %self.address,
            ledger = %caller,
            token = %token,
            sender = %sender,
            recipient = %recipient,
            amount,
            "vault transfer executed"
        );
        Ok(())
    }

    /// Overwrites a token's anchor on behalf of an allow-listed ledger.
    ///
    /// `balance` replaces the anchor's `deposited` unconditionally. The
    /// factor contract: exactly [`SCALE_UNIT`] clears the stored factor
    /// (canonical "no drift"), any other positive value replaces it, and
    /// zero leaves the existing factor untouched.
    pub fn update_data(
        &mut self,
        caller: &str,
        token: &str,
        balance: u64,
        div_factor: u128,
    ) -> Result<(), VaultError> {
        self.guard.try_engage()?;
        let out = self.update_data_inner(caller, token, balance, div_factor);
        self.guard.release();
        out
    }

    fn update_data_inner(
        &mut self,
        caller: &str,
        token: &str,
        balance: u64,
        div_factor: u128,
    ) -> Result<(), VaultError> {
        self.require_ledger(caller)?;

        let anchor = self.anchors.entry(token.to_string()).or_default();
        anchor.deposited = balance;
        if div_factor == SCALE_UNIT {
            anchor.div_factor = 0;
        } else if div_factor > 0 {
            anchor.div_factor = div_factor;
        }

        tracing::debug!(
            vault = %self.address,
            ledger = %caller,
            token = %token,
            balance,
            div_factor,
            "anchor updated"
        );
        Ok(())
    }

    /// Clears a token's anchor — the clean-slate operation a ledger
    /// triggers once it observes the vault's actual balance for the
    /// token has reached zero.
    pub fn reset_data(&mut self, caller: &str, token: &str) -> Result<(), VaultError> {
        self.guard.try_engage()?;
        let out = self.reset_data_inner(caller, token);
        self.guard.release();
        out
    }

    fn reset_data_inner(&mut self, caller: &str, token: &str) -> Result<(), VaultError> {
        self.require_ledger(caller)?;
        self.anchors.insert(token.to_string(), VaultTokenAnchor::default());
        tracing::debug!(vault = %self.address, ledger = %caller, token = %token, "anchor reset");
        Ok(())
    }

    /// Grants or revokes an address's manager flag. Owner only.
    pub fn set_manager(&mut self, caller: &str, who: &str, enabled: bool) -> Result<(), VaultError> {
        if caller != self.owner {
            return Err(VaultError::Unauthorized);
        }
        if enabled {
            self.managers.insert(who.to_string());
        } else {
            self.managers.remove(who);
        }
        Ok(())
    }

    /// Adjusts the free-deposit credit counter. Owner or manager.
    pub fn set_free_deposit_credits(&mut self, caller: &str, credits: u64) -> Result<(), VaultError> {
        self.require_admin(caller)?;
        self.free_deposit_credits = credits;
        tracing::info!(vault = %self.address, credits, "free-deposit credits set");
        Ok(())
    }

    /// Recovers tokens the vault holds but does not account for. Only
    /// valid while the anchor records nothing in custody. Owner only.
    pub fn sweep_lost_tokens(
        &mut self,
        tokens: &mut TokenRegistry,
        caller: &str,
        token: &str,
    ) -> Result<u64, VaultError> {
        if caller != self.owner {
            return Err(VaultError::Unauthorized);
        }
        let recorded = self.anchor(token).deposited;
        if recorded > 0 {
            return Err(VaultError::ActiveAnchor { recorded });
        }
        let held = tokens.balance_of(token, &self.address);
        if held > 0 {
            tokens.transfer(token, &self.address, &self.owner, held)?;
        }
        tracing::info!(vault = %self.address, token = %token, amount = held, "lost tokens swept");
        Ok(held)
    }

    fn require_ledger(&self, caller: &str) -> Result<(), VaultError> {
        if !self.initialized {
            return Err(VaultError::NotInitialized);
        }
        if !self.ledgers.contains(caller) {
            return Err(VaultError::UnauthorizedLedger(caller.to_string()));
        }
        Ok(())
    }

    fn require_admin(&self, caller: &str) -> Result<(), VaultError> {
        if caller == self.owner || self.managers.contains(caller) {
            Ok(())
        } else {
            Err(VaultError::Unauthorized)
        }
    }
}
