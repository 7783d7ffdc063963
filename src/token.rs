//! In-memory fungible-token registry.
//!
//! Models the external token contracts the custody system collaborates
//! with: per-token balances and allowances with the usual
//! `balance_of` / `approve` / `transfer` / `transfer_from` surface.
//! Tokens are deliberately allowed to misbehave the way real ones do —
//! a per-token fee-on-transfer rate shaves every movement, and the
//! explicit rebase mutators change a holder's balance without any
//! transfer, so the ledger and vault reconciliation paths can be
//! exercised against genuine drift.
//!
//! The registry also tracks which addresses are contract accounts, used
//! by the ledger's anti-exploit receiver guard.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a token, assigned by the registry at creation time.
pub type TokenId = String;

/// Unlimited allowance sentinel: grants at this value never deplete.
pub const UNLIMITED_ALLOWANCE: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during token operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The referenced token does not exist.
    #[error("token not found: {0}")]
    UnknownToken(String),

    /// The sender does not hold enough tokens.
    #[error("insufficient balance: account has {balance}, tried to move {amount}")]
    InsufficientBalance {
        /// Current balance of the sender.
        balance: u64,
        /// Amount the caller tried to move.
        amount: u64,
    },

    /// The spender's allowance does not cover the transfer.
    #[error("insufficient allowance: granted {allowance}, tried to move {amount}")]
    InsufficientAllowance {
        /// Allowance currently granted to the spender.
        allowance: u64,
        /// Amount the caller tried to move.
        amount: u64,
    },

    /// A balance or supply update would overflow u64.
    #[error("supply overflow: operation would exceed u64::MAX")]
    SupplyOverflow,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// State for a single registered token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Human-readable token name.
    pub name: String,
    /// Ticker symbol.
    pub symbol: String,
    /// Number of decimal places.
    pub decimals: u8,
    /// Fee-on-transfer rate in basis points, shaved from every movement
    /// and burned. Zero for well-behaved tokens.
    pub transfer_fee_bps: u32,
    /// Current total supply in the smallest denomination.
    pub total_supply: u64,
    /// Per-address balances.
    balances: HashMap<String, u64>,
    /// Per-owner, per-spender allowances: `owner -> (spender -> amount)`.
    allowances: HashMap<String, HashMap<String, u64>>,
}

/// The token registry — holds every registered token's balances and
/// allowances, plus the set of known contract addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRegistry {
    tokens: HashMap<TokenId, Token>,
    contracts: HashSet<String>,
}

impl TokenRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new token and returns its unique ID.
    pub fn register_token(
        &mut self,
        name: impl Into<String>,
        symbol: impl Into<String>,
        decimals: u8,
        transfer_fee_bps: u32,
    ) -> TokenId {
        let token_id = Uuid::new_v4().to_string();
        self.tokens.insert(
            token_id.clone(),
            Token {
                name: name.into(),
                symbol: symbol.into(),
                decimals,
                transfer_fee_bps,
                total_supply: 0,
                balances: HashMap::new(),
                allowances: HashMap::new(),
            },
        );
        token_id
    }

    /// Marks an address as a contract account.
    pub fn register_contract(&mut self, address: impl Into<String>) {
        self.contracts.insert(address.into());
    }

    /// Whether an address is a known contract account.
    pub fn is_contract(&self, address: &str) -> bool {
        self.contracts.contains(address)
    }

    /// Whether a token ID refers to a registered token contract.
    pub fn exists(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    /// Mints tokens to an address, growing total supply.
    pub fn mint(&mut self, token: &str, to: &str, amount: u64) -> Result<(), TokenError> {
        let state = self.token_mut(token)?;
        state.total_supply = state
            .total_supply
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow)?;
        let balance = state.balances.entry(to.to_string()).or_insert(0);
        *balance = balance.checked_add(amount).ok_or(TokenError::SupplyOverflow)?;
        Ok(())
    }

    /// Returns the balance of `holder`, or 0 for unknown tokens/holders.
    pub fn balance_of(&self, token: &str, holder: &str) -> u64 {
        self.tokens
            .get(token)
            .and_then(|t| t.balances.get(holder))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the allowance granted by `owner` to `spender`, or 0.
    pub fn allowance(&self, token: &str, owner: &str, spender: &str) -> u64 {
        self.tokens
            .get(token)
            .and_then(|t| t.allowances.get(owner))
            .and_then(|grants| grants.get(spender))
            .copied()
            .unwrap_or(0)
    }

    /// Sets the allowance granted by `owner` to `spender`.
    pub fn approve(
        &mut self,
        token: &str,
        owner: &str,
        spender: &str,
        amount: u64,
    ) -> Result<(), TokenError> {
        let state = self.token_mut(token)?;
        state
            .allowances
            .entry(owner.to_string())
            .or_default()
            .insert(spender.to_string(), amount);
        Ok(())
    }

    /// Moves tokens from `from` to `to`, returning the delivered amount
    /// (less than `amount` for fee-on-transfer tokens).
    pub fn transfer(
        &mut self,
        token: &str,
        from: &str,
        to: &str,
        amount: u64,
    ) -> Result<u64, TokenError> {
        let state = self.token_mut(token)?;
        Self::move_tokens(state, from, to, amount)
    }

    /// Moves tokens from `from` to `to` on behalf of `spender`,
    /// consuming allowance unless the grant is unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InsufficientAllowance`] if the spender's
    /// grant does not cover `amount`.
    pub fn transfer_from(
        &mut self,
        token: &str,
        spender: &str,
        from: &str,
        to: &str,
        amount: u64,
    ) -> Result<u64, TokenError> {
        let state = self.token_mut(token)?;

        let granted = state
            .allowances
            .get(from)
            .and_then(|grants| grants.get(spender))
            .copied()
            .unwrap_or(0);
        if granted < amount {
            return Err(TokenError::InsufficientAllowance {
                allowance: granted,
                amount,
            });
        }
        if granted != UNLIMITED_ALLOWANCE {
            if let Some(grants) = state.allowances.get_mut(from) {
                grants.insert(spender.to_string(), granted - amount);
            }
        }

        Self::move_tokens(state, from, to, amount)
    }

    /// Rebase upward: credits `amount` to `holder` with no transfer.
    pub fn rebase_add(&mut self, token: &str, holder: &str, amount: u64) -> Result<(), TokenError> {
        self.mint(token, holder, amount)
    }

    /// Rebase downward: debits `amount` from `holder` with no transfer.
    pub fn rebase_remove(
        &mut self,
        token: &str,
        holder: &str,
        amount: u64,
    ) -> Result<(), TokenError> {
        let state = self.token_mut(token)?;
        let balance = state.balances.entry(holder.to_string()).or_insert(0);
        if *balance < amount {
            return Err(TokenError::InsufficientBalance {
                balance: *balance,
                amount,
            });
        }
        *balance -= amount;
        state.total_supply = state.total_supply.saturating_sub(amount);
        Ok(())
    }

    fn token_mut(&mut self, token: &str) -> Result<&mut Token, TokenError> {
        self.tokens
            .get_mut(token)
            .ok_or_else(|| TokenError::UnknownToken(token.to_string()))
    }

    fn move_tokens(state: &mut Token, from: &str, to: &str, amount: u64) -> Result<u64, TokenError> {
        let held = state.balances.get(from).copied().unwrap_or(0);
        if held < amount {
            return Err(TokenError::InsufficientBalance {
                balance: held,
                amount,
            });
        }

        // Fee is shaved from the moved amount and burned.
        let fee = ((amount as u128 * state.transfer_fee_bps as u128) / 10_000) as u64;
        let delivered = amount - fee;

        state.balances.insert(from.to_string(), held - amount);
        let recipient = state.balances.entry(to.to_string()).or_insert(0);
        *recipient = recipient
            .checked_add(delivered)
            .ok_or(TokenError::SupplyOverflow)?;
        state.total_supply = state.total_supply.saturating_sub(fee);

        Ok(delivered)
    }
}
