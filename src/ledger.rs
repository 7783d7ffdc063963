//! # Time-Locked Custody Ledger
//!
//! Tracks per-account and aggregate deposit/request balances for one
//! unlock-delay tier. The lifecycle per (account, token) is:
//!
//! 1. **Deposit** — tokens move from the depositor into the ledger's
//!    pool and are credited to a receiver.
//! 2. **Request** — an account asks to withdraw; the amount moves from
//!    the ledger to the shared [`Vault`] and an unlock timestamp is set.
//! 3. **Cancel** — before the delay elapses, the request is reversed
//!    back into deposited state.
//! 4. **Withdraw** — after the delay elapses, the requested amount is
//!    paid out to the account.
//!
//! Deposited and requested balances are not mutually exclusive: a new
//! deposit may land while a request is pending, but a second request is
//! rejected until the first resolves.
//!
//! ## Rebase Reconciliation
//!
//! The underlying token's balance held by the ledger or the vault can
//! drift between any two operations (fee-on-transfer, rebasing,
//! airdrops). Every entry point therefore reconciles recorded totals
//! against observed balances before mutating anything: drift is folded
//! into a pool-wide scaling factor, and individual accounts are
//! normalized lazily against the current factor when touched. The same
//! two-level scheme runs at the vault via its shared per-token anchor.
//! Keeping the account- and pool-level factors mutually consistent on
//! every branch is the single most security-sensitive property of the
//! system: desynchronized factors let one account inflate its share at
//! the expense of others.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::guard::{CallGuard, ReentrancyError};
use crate::math::{clamp_share, effective_scale, mul_div, rescale, MathError, SCALE_UNIT};
use crate::tier::UnlockTier;
use crate::token::{TokenError, TokenId, TokenRegistry, UNLIMITED_ALLOWANCE};
use crate::vault::{Vault, VaultError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger has not been wired to its vault yet.
    #[error("ledger is not initialized")]
    NotInitialized,

    /// `initialize` was called a second time.
    #[error("ledger is already initialized")]
    AlreadyInitialized,

    /// The vault passed to an operation is not the one wired at
    /// initialization.
    #[error("wrong vault: ledger is wired to a different vault")]
    WrongVault,

    /// The caller is not the owner or a designated manager.
    #[error("unauthorized: owner or manager required")]
    Unauthorized,

    /// The ledger is globally disabled.
    #[error("ledger is disabled")]
    Disabled,

    /// Deposits for this token are disabled.
    #[error("token is disabled: {0}")]
    TokenDisabled(String),

    /// The deposit token is not a registered token contract.
    #[error("token {0} is not a contract")]
    TokenNotContract(String),

    /// The receiver is a contract account, which may not hold deposits.
    #[error("receiver {0} is a contract account")]
    ContractReceiver(String),

    /// The caller does not satisfy the fee-token requirement.
    #[error("fee requirement not met: {required} of the fee token required, caller holds {held}")]
    FeeRequired {
        /// Fee-token amount required.
        required: u64,
        /// Fee-token amount the caller holds.
        held: u64,
    },

    /// A withdrawal request is already active for this account and token.
    #[error("a withdrawal request is already active for this token")]
    AlreadyRequested,

    /// The account has no deposited balance to request.
    #[error("nothing deposited for this token")]
    NothingDeposited,

    /// The account has no active request to cancel or withdraw.
    #[error("no active withdrawal request for this token")]
    NothingRequested,

    /// The unlock delay has not elapsed yet.
    #[error("patience: request unlocks at {unlock_at}")]
    Locked {
        /// Timestamp at which the request becomes withdrawable.
        unlock_at: DateTime<Utc>,
    },

    /// Recorded deposits are nonzero but the observed balance is zero.
    /// Aborting avoids compounding a detected inconsistency.
    #[error("accounting inconsistency: recorded {recorded} deposited but no balance held")]
    Inconsistent {
        /// Amount the pool currently records.
        recorded: u64,
    },

    /// The held balance decreased across a deposit transfer.
    #[error("balance regression: held balance decreased across a transfer")]
    BalanceRegression,

    /// The one-time unlimited approval to the vault did not take effect.
    #[error("vault approval for token {0} did not take effect")]
    ApprovalFailed(String),

    /// A nonzero fee amount was configured without naming a fee token.
    #[error("fee amount is nonzero but no fee token is configured")]
    FeeTokenUnset,

    /// A lost-token sweep was attempted while the pool still records
    /// deposits.
    #[error("cannot sweep: pool still records {recorded} deposited")]
    ActiveDeposits {
        /// Amount the pool currently records.
        recorded: u64,
    },

    /// Scale arithmetic failed.
    #[error(transparent)]
    Math(#[from] MathError),

    /// An underlying token operation failed.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// A vault call failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// A reentrant call was rejected.
    #[error(transparent)]
    Reentered(#[from] ReentrancyError),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-account, per-token record.
///
/// Fields are individually cleared when their balance empties; the map
/// entry itself is never removed and stays addressable with zero values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTokenRecord {
    /// Amount currently credited to this account in the ledger's pool.
    pub deposited: u64,
    /// Pool-wide scaling factor in effect when `deposited` was last
    /// normalized. Zero when unset.
    pub deposited_scale: u128,
    /// Amount currently in an active withdrawal request.
    pub requested: u64,
    /// Vault-wide scaling factor in effect when `requested` was last
    /// normalized. Zero when unset.
    pub requested_scale: u128,
    /// When a request is pending: the timestamp after which it becomes
    /// withdrawable. Otherwise: the time of the last deposit.
    pub unlock_at: Option<DateTime<Utc>>,
    /// Fee-token amount required of this account, snapshotted at its
    /// last deposit and grandfathered until the next one.
    pub fee_rate: u64,
}

/// Ledger-wide per-token aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPool {
    /// Total deposited for this token; anchored to the ledger's actual
    /// held balance after every reconciliation.
    pub deposited: u64,
    /// Current pool scaling factor. Zero when unset.
    pub deposited_scale: u128,
    /// Total currently in flight to the vault for this token.
    pub requested: u64,
    /// Scaling factor mirroring the vault's shared factor. Zero when
    /// unset.
    pub requested_scale: u128,
    /// Deposits for this token are disabled.
    pub disabled: bool,
    /// The one-time unlimited vault approval has been granted.
    pub approved: bool,
}

/// Outcome of a withdrawal request.
///
/// The request path can succeed without performing the nominal action:
/// if normalization rounds the account's deposited balance down to zero
/// there is nothing to move, and the call reports
/// [`NothingToRequest`](RequestOutcome::NothingToRequest) rather than
/// failing. Callers must not assume success implies a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOutcome {
    /// A request was recorded and the amount moved to the vault.
    Requested {
        /// Amount actually placed in the request, after clamping and
        /// transfer-time drift.
        amount: u64,
    },
    /// The normalized deposited balance rounded to zero; no request was
    /// recorded.
    NothingToRequest,
}

/// A time-locked custody ledger for one unlock-delay tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    address: String,
    owner: String,
    managers: HashSet<String>,
    vault_address: Option<String>,
    unlock_delay_secs: i64,
    fee_token: Option<TokenId>,
    fee_amount: u64,
    disabled: bool,
    pools: HashMap<TokenId, TokenPool>,
    accounts: HashMap<String, HashMap<TokenId, AccountTokenRecord>>,
    #[serde(skip)]
    guard: CallGuard,
}

impl Ledger {
    /// Creates a ledger with an explicit unlock delay and fee
    /// requirement. Most deployments construct through
    /// [`for_tier`](Self::for_tier) instead.
    pub fn new(
        address: impl Into<String>,
        owner: impl Into<String>,
        unlock_delay: Duration,
        fee_token: Option<TokenId>,
        fee_amount: u64,
    ) -> Self {
        Self {
            address: address.into(),
            owner: owner.into(),
            managers: HashSet::new(),
            vault_address: None,
            unlock_delay_secs: unlock_delay.num_seconds(),
            fee_token,
            fee_amount,
            disabled: false,
            pools: HashMap::new(),
            accounts: HashMap::new(),
            guard: CallGuard::new(),
        }
    }

    /// Creates a ledger for a standard duration tier, fixing the unlock
    /// delay and fee-token amount from the tier's constants.
    pub fn for_tier(
        address: impl Into<String>,
        owner: impl Into<String>,
        tier: UnlockTier,
        fee_token: Option<TokenId>,
    ) -> Self {
        Self::new(address, owner, tier.delay(), fee_token, tier.fee_amount())
    }

    /// The ledger's own account address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The unlock delay applied to withdrawal requests.
    pub fn unlock_delay(&self) -> Duration {
        Duration::seconds(self.unlock_delay_secs)
    }

    /// Returns the pool for a token, if one has been touched.
    pub fn pool(&self, token: &str) -> Option<&TokenPool> {
        self.pools.get(token)
    }

    /// Returns the record for an account and token, if one has been
    /// touched.
    pub fn account(&self, who: &str, token: &str) -> Option<&AccountTokenRecord> {
        self.accounts.get(who).and_then(|m| m.get(token))
    }

    /// One-time wiring to the shared vault.
    pub fn initialize(&mut self, vault_address: impl Into<String>) -> Result<(), LedgerError> {
        if self.vault_address.is_some() {
            return Err(LedgerError::AlreadyInitialized);
        }
        self.vault_address = Some(vault_address.into());
        tracing::info!(ledger = %self.address, "ledger initialized");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // User operations
    // -----------------------------------------------------------------------

    /// Deposits `amount` of `token` from `caller`, crediting `receiver`.
    ///
    /// Reconciles the pool against the ledger's observed balance first,
    /// then moves tokens through the vault and credits the actual
    /// post-transfer delta (fee-on-transfer tokens deliver less than the
    /// nominal amount). Any precondition failure aborts the whole call
    /// with no state change.
    ///
    /// # Errors
    ///
    /// See the [`LedgerError`] precondition variants; notably
    /// [`LedgerError::ContractReceiver`] (contract accounts may not hold
    /// deposits) and [`LedgerError::FeeRequired`] when neither a
    /// free-deposit credit nor the caller's fee-token balance satisfies
    /// the requirement.
    pub fn deposit(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
        amount: u64,
        receiver: &str,
    ) -> Result<(), LedgerError> {
        self.guard.try_engage()?;
        let out = self.deposit_inner(tokens, vault, caller, token, amount, receiver);
        self.guard.release();
        out
    }

    /// Requests withdrawal of `amount` of `token` for `caller`.
    ///
    /// An `amount` of 0 requests the entire deposited balance;
    /// requesting more than the deposited balance is clamped to it
    /// rather than failing. The amount moves to the vault and becomes
    /// withdrawable once the ledger's unlock delay elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyRequested`] while a request is
    /// pending and [`LedgerError::NothingDeposited`] with no balance.
    pub fn request(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
        amount: u64,
    ) -> Result<RequestOutcome, LedgerError> {
        self.guard.try_engage()?;
        let out = self.request_inner(tokens, vault, caller, token, amount);
        self.guard.release();
        out
    }

    /// Cancels `caller`'s active request, returning the reconciled
    /// amount to deposited state. Returns the amount moved back.
    ///
    /// If the vault's held balance for the token is already zero, the
    /// request is voided with no token movement and 0 is returned.
    pub fn cancel(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
    ) -> Result<u64, LedgerError> {
        self.guard.try_engage()?;
        let out = self.cancel_inner(tokens, vault, caller, token);
        self.guard.release();
        out
    }

    /// Pays out `caller`'s active request once the unlock delay has
    /// elapsed. Returns the amount paid.
    ///
    /// A request whose reconciled amount rounds to zero is cleared with
    /// no token movement.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Locked`] before the unlock timestamp.
    /// Withdrawal is allowed at the exact unlock instant.
    pub fn withdraw(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
    ) -> Result<u64, LedgerError> {
        self.guard.try_engage()?;
        let out = self.withdraw_inner(tokens, vault, caller, token);
        self.guard.release();
        out
    }

    fn deposit_inner(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
        amount: u64,
        receiver: &str,
    ) -> Result<(), LedgerError> {
        self.check_vault(vault)?;
        if self.disabled {
            return Err(LedgerError::Disabled);
        }
        if self.pools.get(token).map_or(false, |p| p.disabled) {
            return Err(LedgerError::TokenDisabled(token.to_string()));
        }
        if !tokens.exists(token) {
            return Err(LedgerError::TokenNotContract(token.to_string()));
        }
        if receiver == self.address || receiver == vault.address() || tokens.is_contract(receiver) {
            return Err(LedgerError::ContractReceiver(receiver.to_string()));
        }

        let fee_required = self.fee_amount > 0 && self.fee_token.as_deref() != Some(token);
        if fee_required && vault.free_deposit_credits() == 0 {
            let fee_token = self.fee_token.as_deref().ok_or(LedgerError::FeeTokenUnset)?;
            let held = tokens.balance_of(fee_token, caller);
            if held < self.fee_amount {
                return Err(LedgerError::FeeRequired {
                    required: self.fee_amount,
                    held,
                });
            }
        }
        let granted = tokens.allowance(token, caller, vault.address());
        if granted < amount {
            return Err(TokenError::InsufficientAllowance {
                allowance: granted,
                amount,
            }
            .into());
        }
        let held = tokens.balance_of(token, caller);
        if held < amount {
            return Err(TokenError::InsufficientBalance {
                balance: held,
                amount,
            }
            .into());
        }

        // One-time unlimited approval so the vault can later pull the
        // requested amounts out of this ledger. Verified, not assumed.
        let needs_approval = !self.pools.entry(token.to_string()).or_default().approved;
        if needs_approval {
            tokens.approve(token, &self.address, vault.address(), UNLIMITED_ALLOWANCE)?;
            if tokens.allowance(token, &self.address, vault.address()) != UNLIMITED_ALLOWANCE {
                return Err(LedgerError::ApprovalFailed(token.to_string()));
            }
            if let Some(pool) = self.pools.get_mut(token) {
                pool.approved = true;
            }
        }

        self.reconcile_deposits(tokens, token)?;
        self.normalize_account_deposited(token, receiver)?;

        // Fee-rate snapshot: zero when a free-deposit credit will cover
        // this deposit, else the current requirement. Grandfathered
        // until the receiver's next deposit.
        let fee_snapshot = if fee_required && vault.free_deposit_credits() > 0 {
            0
        } else if fee_required {
            self.fee_amount
        } else {
            0
        };

        let recipient = self.address.clone();
        vault.external_transfer(tokens, &self.address, token, caller, &recipient, amount, fee_required)?;

        // Credit the actual post-transfer delta, not the nominal amount.
        let held_after = tokens.balance_of(token, &self.address);
        let pool = self.pools.entry(token.to_string()).or_default();
        let credited = held_after
            .checked_sub(pool.deposited)
            .ok_or(LedgerError::BalanceRegression)?;
        pool.deposited = held_after;

        let rec = self
            .accounts
            .entry(receiver.to_string())
            .or_default()
            .entry(token.to_string())
            .or_default();
        rec.deposited = rec
            .deposited
            .checked_add(credited)
            .ok_or(MathError::Overflow)?;
        rec.fee_rate = fee_snapshot;
        if rec.requested == 0 {
            rec.unlock_at = Some(Utc::now());
        }

        tracing::info!(
            ledger = %self.address,
            depositor = %caller,
            receiver = %receiver,
            token = %token,
            amount = credited,
            "deposit credited"
        );
        Ok(())
    }

    fn request_inner(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
        amount: u64,
    ) -> Result<RequestOutcome, LedgerError> {
        self.check_vault(vault)?;
        self.check_fee_snapshot(tokens, caller, token)?;
        {
            let rec = self.account(caller, token).cloned().unwrap_or_default();
            if rec.requested > 0 {
                return Err(LedgerError::AlreadyRequested);
            }
            if rec.deposited == 0 {
                return Err(LedgerError::NothingDeposited);
            }
        }

        self.reconcile_deposits(tokens, token)?;
        self.normalize_account_deposited(token, caller)?;

        // Normalization can round a dust balance down to zero. That is a
        // successful no-op, reported distinctly so callers can tell.
        let deposited = self.account(caller, token).map(|r| r.deposited).unwrap_or(0);
        if deposited == 0 {
            let rec = self
                .accounts
                .entry(caller.to_string())
                .or_default()
                .entry(token.to_string())
                .or_default();
            rec.deposited_scale = 0;
            rec.requested_scale = 0;
            tracing::info!(
                ledger = %self.address,
                account = %caller,
                token = %token,
                "request no-op: normalized balance is zero"
            );
            return Ok(RequestOutcome::NothingToRequest);
        }

        let div = match self.reconcile_vault_anchor(tokens, vault, token)? {
            Some(div) => div,
            // Clean slate: the vault holds nothing for this token, so
            // the new request starts from an undrifted factor.
            None => SCALE_UNIT,
        };
        self.reconcile_requested_scale(token, div)?;

        let now = Utc::now();
        let unlock_at = now + Duration::seconds(self.unlock_delay_secs);
        let amt;
        {
            let pool = self.pools.entry(token.to_string()).or_default();
            let rec = self
                .accounts
                .entry(caller.to_string())
                .or_default()
                .entry(token.to_string())
                .or_default();

            // Requests above the deposited balance clamp to it; zero
            // means "everything".
            amt = if amount == 0 || amount > rec.deposited {
                rec.deposited
            } else {
                amount
            };

            pool.deposited = pool.deposited.checked_sub(amt).ok_or(MathError::Overflow)?;
            pool.requested = pool.requested.checked_add(amt).ok_or(MathError::Overflow)?;
            rec.deposited -= amt;
            rec.requested = amt;
            rec.requested_scale = pool.requested_scale;
            if rec.deposited == 0 {
                rec.deposited_scale = 0;
                if pool.deposited == 0 {
                    pool.deposited_scale = 0;
                }
            }
            rec.unlock_at = Some(unlock_at);
        }

        // Move the amount into the vault and push the refreshed anchor.
        let vault_addr = vault.address().to_string();
        let vault_before = tokens.balance_of(token, &vault_addr);
        let sender = self.address.clone();
        vault.external_transfer(tokens, &self.address, token, &sender, &vault_addr, amt, false)?;
        let vault_after = tokens.balance_of(token, &vault_addr);
        let delivered = vault_after
            .checked_sub(vault_before)
            .ok_or(LedgerError::BalanceRegression)?;

        if delivered != amt {
            // Transfer-time fees shaved the in-flight amount; track what
            // actually arrived.
            let pool = self.pools.entry(token.to_string()).or_default();
            pool.requested = pool
                .requested
                .checked_sub(amt)
                .and_then(|v| v.checked_add(delivered))
                .ok_or(MathError::Overflow)?;
            let rec = self
                .accounts
                .entry(caller.to_string())
                .or_default()
                .entry(token.to_string())
                .or_default();
            rec.requested = delivered;
        }
        vault.update_data(&self.address, token, vault_after, div)?;

        tracing::info!(
            ledger = %self.address,
            account = %caller,
            token = %token,
            amount = delivered,
            unlock_at = %unlock_at,
            "withdrawal requested"
        );
        Ok(RequestOutcome::Requested { amount: delivered })
    }

    fn cancel_inner(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
    ) -> Result<u64, LedgerError> {
        self.check_vault(vault)?;
        if self.account(caller, token).map(|r| r.requested).unwrap_or(0) == 0 {
            return Err(LedgerError::NothingRequested);
        }

        self.reconcile_deposits(tokens, token)?;
        self.normalize_account_deposited(token, caller)?;

        let div = match self.reconcile_vault_anchor(tokens, vault, token)? {
            Some(div) => div,
            None => {
                // The vault holds nothing: there are no tokens to
                // return, so the request is unconditionally voided.
                self.clear_request_state(caller, token);
                tracing::info!(
                    ledger = %self.address,
                    account = %caller,
                    token = %token,
                    "request voided: vault holds no balance"
                );
                return Ok(0);
            }
        };
        self.reconcile_requested_scale(token, div)?;
        self.normalize_account_requested(token, caller)?;

        let amt = self.account(caller, token).map(|r| r.requested).unwrap_or(0);
        if amt == 0 {
            self.clear_request_state(caller, token);
            return Ok(0);
        }

        let vault_addr = vault.address().to_string();
        let before = tokens.balance_of(token, &self.address);
        let recipient = self.address.clone();
        vault.external_transfer(tokens, &self.address, token, &vault_addr, &recipient, amt, false)?;
        let delivered = tokens
            .balance_of(token, &self.address)
            .checked_sub(before)
            .ok_or(LedgerError::BalanceRegression)?;

        {
            let pool = self.pools.entry(token.to_string()).or_default();
            let rec = self
                .accounts
                .entry(caller.to_string())
                .or_default()
                .entry(token.to_string())
                .or_default();
            pool.requested = pool.requested.checked_sub(amt).ok_or(MathError::Overflow)?;
            pool.deposited = pool
                .deposited
                .checked_add(delivered)
                .ok_or(MathError::Overflow)?;
            rec.deposited = rec
                .deposited
                .checked_add(delivered)
                .ok_or(MathError::Overflow)?;
            rec.deposited_scale = pool.deposited_scale;
            rec.requested = 0;
            rec.requested_scale = 0;
            rec.unlock_at = None;
            if pool.requested == 0 {
                pool.requested_scale = 0;
            }
        }

        let remaining = tokens.balance_of(token, &vault_addr);
        if remaining == 0 {
            vault.reset_data(&self.address, token)?;
        } else {
            vault.update_data(&self.address, token, remaining, div)?;
        }

        tracing::info!(
            ledger = %self.address,
            account = %caller,
            token = %token,
            amount = delivered,
            "request cancelled"
        );
        Ok(delivered)
    }

    fn withdraw_inner(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        caller: &str,
        token: &str,
    ) -> Result<u64, LedgerError> {
        self.check_vault(vault)?;
        self.check_fee_snapshot(tokens, caller, token)?;
        {
            let rec = self.account(caller, token).cloned().unwrap_or_default();
            if rec.requested == 0 {
                return Err(LedgerError::NothingRequested);
            }
            let now = Utc::now();
            if let Some(unlock_at) = rec.unlock_at {
                // Withdrawable at the exact unlock instant and after.
                if now < unlock_at {
                    return Err(LedgerError::Locked { unlock_at });
                }
            }
        }

        self.reconcile_deposits(tokens, token)?;
        self.normalize_account_deposited(token, caller)?;

        let div = match self.reconcile_vault_anchor(tokens, vault, token)? {
            Some(div) => div,
            None => {
                self.clear_request_state(caller, token);
                tracing::info!(
                    ledger = %self.address,
                    account = %caller,
                    token = %token,
                    "withdrawal cleared: vault holds no balance"
                );
                return Ok(0);
            }
        };
        self.reconcile_requested_scale(token, div)?;
        self.normalize_account_requested(token, caller)?;

        let amt = self.account(caller, token).map(|r| r.requested).unwrap_or(0);
        if amt == 0 {
            self.clear_request_state(caller, token);
            return Ok(0);
        }

        let vault_addr = vault.address().to_string();
        vault.external_transfer(tokens, &self.address, token, &vault_addr, caller, amt, false)?;

        {
            let pool = self.pools.entry(token.to_string()).or_default();
            let rec = self
                .accounts
                .entry(caller.to_string())
                .or_default()
                .entry(token.to_string())
                .or_default();
            pool.requested = pool.requested.checked_sub(amt).ok_or(MathError::Overflow)?;
            rec.requested = 0;
            rec.requested_scale = 0;
            rec.unlock_at = None;
            if pool.requested == 0 {
                pool.requested_scale = 0;
            }
        }

        let remaining = tokens.balance_of(token, &vault_addr);
        if remaining == 0 {
            vault.reset_data(&self.address, token)?;
        } else {
            vault.update_data(&self.address, token, remaining, div)?;
        }

        tracing::info!(
            ledger = %self.address,
            account = %caller,
            token = %token,
            amount = amt,
            "withdrawal paid"
        );
        Ok(amt)
    }

    // -----------------------------------------------------------------------
    // Reconciliation primitives
    // -----------------------------------------------------------------------

    /// Anchors the pool's recorded deposits to the ledger's observed
    /// balance, folding any drift into the pool scaling factor.
    fn reconcile_deposits(&mut self, tokens: &mut TokenRegistry, token: &str) -> Result<(), LedgerError> {
        let held = tokens.balance_of(token, &self.address);
        let address = self.address.clone();
        let owner = self.owner.clone();
        let pool = self.pools.entry(token.to_string()).or_default();
        if pool.deposited_scale == 0 {
            pool.deposited_scale = SCALE_UNIT;
        }
        if held == pool.deposited {
            return Ok(());
        }
        if pool.deposited == 0 {
            // Rebase residue with no depositors to attribute it to:
            // swept to the owner, never credited to the next depositor.
            tokens.transfer(token, &address, &owner, held)?;
            tracing::warn!(
                ledger = %address,
                token = %token,
                amount = held,
                "orphaned balance swept to owner"
            );
            return Ok(());
        }
        if held == 0 {
            return Err(LedgerError::Inconsistent {
                recorded: pool.deposited,
            });
        }
        pool.deposited_scale = rescale(pool.deposited_scale, held, pool.deposited)?;
        pool.deposited = held;
        Ok(())
    }

    /// Normalizes one account's deposited share against the current pool
    /// factor, adopting it afterward.
    fn normalize_account_deposited(&mut self, token: &str, who: &str) -> Result<(), LedgerError> {
        let (pool_scale, pool_total) = {
            let pool = self.pools.entry(token.to_string()).or_default();
            (pool.deposited_scale, pool.deposited)
        };
        let rec = self
            .accounts
            .entry(who.to_string())
            .or_default()
            .entry(token.to_string())
            .or_default();
        if rec.deposited == 0 {
            rec.deposited_scale = pool_scale;
            return Ok(());
        }
        if rec.deposited_scale != pool_scale {
            let normalized = mul_div(rec.deposited, pool_scale, effective_scale(rec.deposited_scale))?;
            rec.deposited = clamp_share(normalized, pool_total);
            rec.deposited_scale = pool_scale;
        }
        Ok(())
    }

    /// Normalizes one account's requested share against the pool's
    /// requested factor.
    fn normalize_account_requested(&mut self, token: &str, who: &str) -> Result<(), LedgerError> {
        let (pool_scale, pool_total) = {
            let pool = self.pools.entry(token.to_string()).or_default();
            (pool.requested_scale, pool.requested)
        };
        let rec = self
            .accounts
            .entry(who.to_string())
            .or_default()
            .entry(token.to_string())
            .or_default();
        if rec.requested == 0 {
            rec.requested_scale = pool_scale;
            return Ok(());
        }
        if rec.requested_scale != pool_scale {
            let normalized = mul_div(rec.requested, pool_scale, effective_scale(rec.requested_scale))?;
            rec.requested = clamp_share(normalized, pool_total);
            rec.requested_scale = pool_scale;
        }
        Ok(())
    }

    /// Reconciles the vault's shared anchor for `token` against its
    /// observed balance.
    ///
    /// Returns the current drift factor, or `None` after a clean-slate
    /// event (the vault holds nothing for the token), in which case any
    /// lingering ledger-side requested state has been cleared.
    fn reconcile_vault_anchor(
        &mut self,
        tokens: &mut TokenRegistry,
        vault: &mut Vault,
        token: &str,
    ) -> Result<Option<u128>, LedgerError> {
        let vault_addr = vault.address().to_string();
        let held = tokens.balance_of(token, &vault_addr);
        if held == 0 {
            vault.reset_data(&self.address, token)?;
            let pool = self.pools.entry(token.to_string()).or_default();
            pool.requested = 0;
            pool.requested_scale = 0;
            return Ok(None);
        }

        let anchor = vault.anchor(token);
        let mut div = effective_scale(anchor.div_factor);
        if anchor.deposited != held {
            if anchor.deposited > 0 {
                div = rescale(div, held, anchor.deposited)?;
                vault.update_data(&self.address, token, held, div)?;
            } else {
                // Residue with no outstanding requests anywhere: sweep
                // to the owner, then treat the token as clean.
                let owner = self.owner.clone();
                vault.external_transfer(tokens, &self.address, token, &vault_addr, &owner, held, false)?;
                tracing::warn!(
                    ledger = %self.address,
                    token = %token,
                    amount = held,
                    "orphaned vault balance swept to owner"
                );
                let pool = self.pools.entry(token.to_string()).or_default();
                pool.requested = 0;
                pool.requested_scale = 0;
                return Ok(None);
            }
        }
        Ok(Some(div))
    }

    /// Adopts the vault's drift factor as the pool's requested scale,
    /// rescaling any in-flight total across the factor change.
    fn reconcile_requested_scale(&mut self, token: &str, div: u128) -> Result<(), LedgerError> {
        let pool = self.pools.entry(token.to_string()).or_default();
        let current = effective_scale(pool.requested_scale);
        if current != div && pool.requested > 0 {
            pool.requested = mul_div(pool.requested, div, current)?;
        }
        pool.requested_scale = div;
        Ok(())
    }

    fn clear_request_state(&mut self, who: &str, token: &str) {
        let rec = self
            .accounts
            .entry(who.to_string())
            .or_default()
            .entry(token.to_string())
            .or_default();
        rec.requested = 0;
        rec.requested_scale = 0;
        rec.unlock_at = None;
    }

    fn check_fee_snapshot(
        &self,
        tokens: &TokenRegistry,
        caller: &str,
        token: &str,
    ) -> Result<(), LedgerError> {
        let fee_rate = self
            .account(caller, token)
            .map(|r| r.fee_rate)
            .unwrap_or(0);
        if fee_rate == 0 || self.fee_token.as_deref() == Some(token) {
            return Ok(());
        }
        let Some(fee_token) = self.fee_token.as_deref() else {
            return Ok(());
        };
        let held = tokens.balance_of(fee_token, caller);
        if held < fee_rate {
            return Err(LedgerError::FeeRequired {
                required: fee_rate,
                held,
            });
        }
        Ok(())
    }

    fn check_vault(&self, vault: &Vault) -> Result<(), LedgerError> {
        match self.vault_address.as_deref() {
            Some(addr) if addr == vault.address() => Ok(()),
            Some(_) => Err(LedgerError::WrongVault),
            None => Err(LedgerError::NotInitialized),
        }
    }

    fn require_admin(&self, caller: &str) -> Result<(), LedgerError> {
        if caller == self.owner || self.managers.contains(caller) {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized)
        }
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Globally enables or disables deposits. Owner or manager.
    pub fn set_disabled(&mut self, caller: &str, disabled: bool) -> Result<(), LedgerError> {
        self.require_admin(caller)?;
        self.disabled = disabled;
        tracing::info!(ledger = %self.address, disabled, "ledger disablement set");
        Ok(())
    }

    /// Enables or disables deposits for one token. Owner or manager.
    pub fn set_token_disabled(
        &mut self,
        caller: &str,
        token: &str,
        disabled: bool,
    ) -> Result<(), LedgerError> {
        self.require_admin(caller)?;
        self.pools.entry(token.to_string()).or_default().disabled = disabled;
        tracing::info!(ledger = %self.address, token = %token, disabled, "token disablement set");
        Ok(())
    }

    /// Adjusts the fee-token requirement. Owner or manager. A nonzero
    /// amount requires a fee token to be named.
    pub fn set_fee_requirement(
        &mut self,
        caller: &str,
        fee_token: Option<TokenId>,
        amount: u64,
    ) -> Result<(), LedgerError> {
        self.require_admin(caller)?;
        if amount > 0 && fee_token.is_none() {
            return Err(LedgerError::FeeTokenUnset);
        }
        self.fee_token = fee_token;
        self.fee_amount = amount;
        tracing::info!(ledger = %self.address, amount, "fee requirement set");
        Ok(())
    }

    /// Grants or revokes an address's manager flag. Owner only.
    pub fn set_manager(&mut self, caller: &str, who: &str, enabled: bool) -> Result<(), LedgerError> {
        if caller != self.owner {
            return Err(LedgerError::Unauthorized);
        }
        if enabled {
            self.managers.insert(who.to_string());
        } else {
            self.managers.remove(who);
        }
        Ok(())
    }

    /// Recovers tokens the ledger holds but does not account for. Only
    /// valid while the pool records no deposits. Owner only.
    pub fn sweep_lost_tokens(
        &mut self,
        tokens: &mut TokenRegistry,
        caller: &str,
        token: &str,
    ) -> Result<u64, LedgerError> {
        if caller != self.owner {
            return Err(LedgerError::Unauthorized);
        }
        let recorded = self.pool(token).map(|p| p.deposited).unwrap_or(0);
        if recorded > 0 {
            return Err(LedgerError::ActiveDeposits { recorded });
        }
        let held = tokens.balance_of(token, &self.address);
        if held > 0 {
            tokens.transfer(token, &self.address, &self.owner, held)?;
        }
        tracing::info!(ledger = %self.address, token = %token, amount = held, "lost tokens swept");
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One ledger, one vault, one well-behaved token, two funded users.
    fn setup(unlock_secs: i64) -> (TokenRegistry, Vault, Ledger, TokenId) {
        let mut tokens = TokenRegistry::new();
        let token = tokens.register_token("Test Token", "TST", 8, 0);
        tokens.mint(&token, "alice", 1_000_000).unwrap();
        tokens.mint(&token, "bob", 1_000_000).unwrap();

        let mut vault = Vault::new("vault", "owner");
        vault.initialize(vec!["ledger".to_string()]).unwrap();
        let mut ledger = Ledger::new("ledger", "owner", Duration::seconds(unlock_secs), None, 0);
        ledger.initialize("vault").unwrap();

        tokens.register_contract("vault");
        tokens.register_contract("ledger");

        tokens.approve(&token, "alice", "vault", UNLIMITED_ALLOWANCE).unwrap();
        tokens.approve(&token, "bob", "vault", UNLIMITED_ALLOWANCE).unwrap();

        (tokens, vault, ledger, token)
    }

    #[test]
    fn deposit_credits_receiver_and_pool() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();

        let pool = ledger.pool(&token).unwrap();
        assert_eq!(pool.deposited, 1000);
        assert_eq!(pool.deposited_scale, SCALE_UNIT);
        let rec = ledger.account("alice", &token).unwrap();
        assert_eq!(rec.deposited, 1000);
        assert_eq!(rec.deposited_scale, SCALE_UNIT);
        assert_eq!(tokens.balance_of(&token, "ledger"), 1000);
    }

    #[test]
    fn deposit_to_contract_receiver_rejected() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        let result = ledger.deposit(&mut tokens, &mut vault, "alice", &token, 1000, "vault");
        assert!(matches!(result, Err(LedgerError::ContractReceiver(_))));
    }

    #[test]
    fn deposit_unknown_token_rejected() {
        let (mut tokens, mut vault, mut ledger, _) = setup(0);
        let result = ledger.deposit(&mut tokens, &mut vault, "alice", "no-such-token", 1, "alice");
        assert!(matches!(result, Err(LedgerError::TokenNotContract(_))));
    }

    #[test]
    fn deposit_without_allowance_rejected() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        tokens.approve(&token, "alice", "vault", 0).unwrap();
        let result = ledger.deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice");
        assert!(matches!(
            result,
            Err(LedgerError::Token(TokenError::InsufficientAllowance { .. }))
        ));
    }

    #[test]
    fn disabled_ledger_rejects_deposits() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger.set_disabled("owner", true).unwrap();
        let result = ledger.deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice");
        assert!(matches!(result, Err(LedgerError::Disabled)));
    }

    #[test]
    fn disabled_token_rejects_deposits() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger.set_token_disabled("owner", &token, true).unwrap();
        let result = ledger.deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice");
        assert!(matches!(result, Err(LedgerError::TokenDisabled(_))));
    }

    #[test]
    fn request_moves_amount_to_vault() {
        let (mut tokens, mut vault, mut ledger, token) = setup(60);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        let outcome = ledger
            .request(&mut tokens, &mut vault, "alice", &token, 400)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Requested { amount: 400 });

        let pool = ledger.pool(&token).unwrap();
        assert_eq!(pool.deposited, 600);
        assert_eq!(pool.requested, 400);
        assert_eq!(tokens.balance_of(&token, "vault"), 400);
        assert_eq!(vault.anchor(&token).deposited, 400);

        let rec = ledger.account("alice", &token).unwrap();
        assert_eq!(rec.requested, 400);
        assert!(rec.unlock_at.is_some());
    }

    #[test]
    fn second_request_rejected() {
        let (mut tokens, mut vault, mut ledger, token) = setup(60);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        ledger
            .request(&mut tokens, &mut vault, "alice", &token, 400)
            .unwrap();
        let result = ledger.request(&mut tokens, &mut vault, "alice", &token, 100);
        assert!(matches!(result, Err(LedgerError::AlreadyRequested)));
    }

    #[test]
    fn request_without_deposit_rejected() {
        let (mut tokens, mut vault, mut ledger, token) = setup(60);
        let result = ledger.request(&mut tokens, &mut vault, "alice", &token, 100);
        assert!(matches!(result, Err(LedgerError::NothingDeposited)));
    }

    #[test]
    fn oversized_request_clamps_to_deposited() {
        let (mut tokens, mut vault, mut ledger, token) = setup(60);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        let outcome = ledger
            .request(&mut tokens, &mut vault, "alice", &token, 5000)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Requested { amount: 1000 });
        assert_eq!(ledger.account("alice", &token).unwrap().deposited, 0);
    }

    #[test]
    fn zero_request_means_everything() {
        let (mut tokens, mut vault, mut ledger, token) = setup(60);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        let outcome = ledger
            .request(&mut tokens, &mut vault, "alice", &token, 0)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Requested { amount: 1000 });
    }

    #[test]
    fn withdraw_before_unlock_aborts_with_patience() {
        let (mut tokens, mut vault, mut ledger, token) = setup(3600);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        ledger
            .request(&mut tokens, &mut vault, "alice", &token, 1000)
            .unwrap();
        let result = ledger.withdraw(&mut tokens, &mut vault, "alice", &token);
        match result {
            Err(LedgerError::Locked { .. }) => {}
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn withdraw_after_unlock_pays_out() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        ledger
            .request(&mut tokens, &mut vault, "alice", &token, 1000)
            .unwrap();
        let paid = ledger.withdraw(&mut tokens, &mut vault, "alice", &token).unwrap();
        assert_eq!(paid, 1000);
        assert_eq!(tokens.balance_of(&token, "alice"), 1_000_000);
        assert_eq!(ledger.account("alice", &token).unwrap().requested, 0);
        // Last request for the token: vault anchor is clean.
        assert_eq!(vault.anchor(&token).deposited, 0);
        assert_eq!(vault.anchor(&token).div_factor, 0);
    }

    #[test]
    fn cancel_returns_request_to_deposited() {
        let (mut tokens, mut vault, mut ledger, token) = setup(3600);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        ledger
            .request(&mut tokens, &mut vault, "alice", &token, 600)
            .unwrap();
        let returned = ledger.cancel(&mut tokens, &mut vault, "alice", &token).unwrap();
        assert_eq!(returned, 600);

        let rec = ledger.account("alice", &token).unwrap();
        assert_eq!(rec.deposited, 1000);
        assert_eq!(rec.requested, 0);
        assert_eq!(rec.unlock_at, None);
        assert_eq!(ledger.pool(&token).unwrap().deposited, 1000);
        assert_eq!(tokens.balance_of(&token, "vault"), 0);
    }

    #[test]
    fn cancel_without_request_rejected() {
        let (mut tokens, mut vault, mut ledger, token) = setup(60);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        let result = ledger.cancel(&mut tokens, &mut vault, "alice", &token);
        assert!(matches!(result, Err(LedgerError::NothingRequested)));
    }

    #[test]
    fn deposit_while_request_pending_allowed() {
        let (mut tokens, mut vault, mut ledger, token) = setup(3600);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        ledger
            .request(&mut tokens, &mut vault, "alice", &token, 1000)
            .unwrap();
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 500, "alice")
            .unwrap();
        let rec = ledger.account("alice", &token).unwrap();
        assert_eq!(rec.deposited, 500);
        assert_eq!(rec.requested, 1000);
    }

    #[test]
    fn pool_rebase_distributes_proportionally() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        ledger
            .deposit(&mut tokens, &mut vault, "bob", &token, 3000, "bob")
            .unwrap();

        // The ledger's balance drifts up by 400 with no deposit.
        tokens.rebase_add(&token, "ledger", 400).unwrap();

        // Alice requests everything: she holds a quarter of the pool,
        // so she is entitled to a quarter of the drift.
        let outcome = ledger
            .request(&mut tokens, &mut vault, "alice", &token, 0)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Requested { amount: 1100 });

        // Bob gets the rest, within one rounding unit.
        let outcome = ledger
            .request(&mut tokens, &mut vault, "bob", &token, 0)
            .unwrap();
        match outcome {
            RequestOutcome::Requested { amount } => assert!((3299..=3300).contains(&amount)),
            other => panic!("expected a request, got {other:?}"),
        }
        assert_eq!(tokens.balance_of(&token, "ledger"), 0);
    }

    #[test]
    fn orphaned_ledger_balance_swept_to_owner() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        // Balance appears with no recorded deposits.
        tokens.rebase_add(&token, "ledger", 999).unwrap();
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();

        assert_eq!(tokens.balance_of(&token, "owner"), 999);
        assert_eq!(ledger.pool(&token).unwrap().deposited, 1000);
        assert_eq!(ledger.account("alice", &token).unwrap().deposited, 1000);
    }

    #[test]
    fn rebase_to_zero_aborts_as_inconsistent() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        tokens.rebase_remove(&token, "ledger", 1000).unwrap();
        let result = ledger.request(&mut tokens, &mut vault, "alice", &token, 0);
        assert!(matches!(result, Err(LedgerError::Inconsistent { recorded: 1000 })));
    }

    #[test]
    fn dust_balance_request_is_a_reported_noop() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1, "alice")
            .unwrap();
        ledger
            .deposit(&mut tokens, &mut vault, "bob", &token, 10_000, "bob")
            .unwrap();

        // Pool shrinks to under half: alice's single unit rounds to zero.
        tokens.rebase_remove(&token, "ledger", 6_000).unwrap();

        let outcome = ledger
            .request(&mut tokens, &mut vault, "alice", &token, 0)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::NothingToRequest);
        let rec = ledger.account("alice", &token).unwrap();
        assert_eq!(rec.deposited, 0);
        assert_eq!(rec.deposited_scale, 0);
    }

    #[test]
    fn fee_on_transfer_deposit_credits_delivered_amount() {
        let (mut tokens, mut vault, mut ledger, _) = setup(0);
        let fee_token = tokens.register_token("Fee Token", "FEE", 8, 100); // 1%
        tokens.mint(&fee_token, "alice", 100_000).unwrap();
        tokens
            .approve(&fee_token, "alice", "vault", UNLIMITED_ALLOWANCE)
            .unwrap();

        ledger
            .deposit(&mut tokens, &mut vault, "alice", &fee_token, 10_000, "alice")
            .unwrap();
        // 1% shaved in transit; the delivered delta is what gets credited.
        assert_eq!(ledger.account("alice", &fee_token).unwrap().deposited, 9_900);
        assert_eq!(ledger.pool(&fee_token).unwrap().deposited, 9_900);
    }

    #[test]
    fn fee_requirement_gates_deposit_and_snapshots() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        let fee_token = tokens.register_token("Fee Token", "FEE", 8, 0);
        ledger
            .set_fee_requirement("owner", Some(fee_token.clone()), 50)
            .unwrap();

        // Alice holds no fee token and no credits remain.
        let result = ledger.deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice");
        assert!(matches!(result, Err(LedgerError::FeeRequired { required: 50, .. })));

        // With enough fee token the deposit goes through and the rate is
        // snapshotted on the record.
        tokens.mint(&fee_token, "alice", 50).unwrap();
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        assert_eq!(ledger.account("alice", &token).unwrap().fee_rate, 50);

        // Losing the fee token afterwards blocks request.
        tokens.rebase_remove(&fee_token, "alice", 50).unwrap();
        let result = ledger.request(&mut tokens, &mut vault, "alice", &token, 0);
        assert!(matches!(result, Err(LedgerError::FeeRequired { required: 50, .. })));
    }

    #[test]
    fn free_deposit_credit_bypasses_fee_and_zeroes_snapshot() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        let fee_token = tokens.register_token("Fee Token", "FEE", 8, 0);
        ledger
            .set_fee_requirement("owner", Some(fee_token), 50)
            .unwrap();
        vault.set_free_deposit_credits("owner", 1).unwrap();

        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        assert_eq!(vault.free_deposit_credits(), 0);
        assert_eq!(ledger.account("alice", &token).unwrap().fee_rate, 0);
    }

    #[test]
    fn uninitialized_ledger_rejects_operations() {
        let mut tokens = TokenRegistry::new();
        let token = tokens.register_token("T", "TOK", 8, 0);
        let mut vault = Vault::new("vault", "owner");
        vault.initialize(vec!["ledger".to_string()]).unwrap();
        let mut ledger = Ledger::new("ledger", "owner", Duration::zero(), None, 0);
        let result = ledger.deposit(&mut tokens, &mut vault, "alice", &token, 1, "alice");
        assert!(matches!(result, Err(LedgerError::NotInitialized)));
    }

    #[test]
    fn wrong_vault_rejected() {
        let (mut tokens, _, mut ledger, token) = setup(0);
        let mut other = Vault::new("other-vault", "owner");
        other.initialize(vec!["ledger".to_string()]).unwrap();
        let result = ledger.deposit(&mut tokens, &mut other, "alice", &token, 1, "alice");
        assert!(matches!(result, Err(LedgerError::WrongVault)));
    }

    #[test]
    fn sweep_lost_tokens_requires_empty_pool() {
        let (mut tokens, mut vault, mut ledger, token) = setup(0);
        ledger
            .deposit(&mut tokens, &mut vault, "alice", &token, 1000, "alice")
            .unwrap();
        let result = ledger.sweep_lost_tokens(&mut tokens, "owner", &token);
        assert!(matches!(result, Err(LedgerError::ActiveDeposits { recorded: 1000 })));
    }
}
