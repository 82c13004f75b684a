// 10.5: module accounts. quote collateral of every subaccount sits in the
// `Subaccounts` module account; fees and the insurance fund are separate accounts.

use crate::store::{get_value, set_value, key_with_suffix, KvStore, StoreError, MODULE_BALANCE_PREFIX};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModuleAccount {
    Subaccounts,
    FeeCollector,
    InsuranceFund,
}

impl ModuleAccount {
    fn name(&self) -> &'static str {
        match self {
            ModuleAccount::Subaccounts => "subaccounts",
            ModuleAccount::FeeCollector => "fee_collector",
            ModuleAccount::InsuranceFund => "insurance_fund",
        }
    }
}

impl fmt::Display for ModuleAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BankError {
    #[error("insufficient funds in {module}: balance {balance}, requested {amount}")]
    InsufficientFunds {
        module: ModuleAccount,
        balance: u64,
        amount: u64,
    },

    #[error("balance overflow in {0}")]
    Overflow(ModuleAccount),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Transfer interface between module accounts.
pub trait BankKeeper: Send + Sync {
    fn balance(&self, store: &dyn KvStore, module: ModuleAccount) -> Result<u64, BankError>;

    fn transfer(
        &self,
        store: &mut dyn KvStore,
        from: ModuleAccount,
        to: ModuleAccount,
        amount: u64,
    ) -> Result<(), BankError>;

    /// Moves `amount` from `from` to `to` when positive and the other way when negative.
    fn transfer_signed(
        &self,
        store: &mut dyn KvStore,
        from: ModuleAccount,
        to: ModuleAccount,
        amount: i128,
    ) -> Result<(), BankError> {
        let magnitude = u64::try_from(amount.unsigned_abs()).map_err(|_| BankError::Overflow(from))?;
        match amount.signum() {
            1 => self.transfer(store, from, to, magnitude),
            -1 => self.transfer(store, to, from, magnitude),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleBank;

impl ModuleBank {
    pub fn new() -> Self {
        Self
    }

    fn key(module: ModuleAccount) -> Vec<u8> {
        key_with_suffix(MODULE_BALANCE_PREFIX, module.name().as_bytes())
    }

    fn set_balance(
        &self,
        store: &mut dyn KvStore,
        module: ModuleAccount,
        balance: u64,
    ) -> Result<(), BankError> {
        set_value(store, &Self::key(module), &balance)?;
        Ok(())
    }

    /// Credits a module out of thin air. genesis and tests only.
    pub fn mint(&self, store: &mut dyn KvStore, module: ModuleAccount, amount: u64) -> Result<(), BankError> {
        let balance = self.balance(store, module)?;
        let next = balance.checked_add(amount).ok_or(BankError::Overflow(module))?;
        self.set_balance(store, module, next)
    }
}

impl BankKeeper for ModuleBank {
    fn balance(&self, store: &dyn KvStore, module: ModuleAccount) -> Result<u64, BankError> {
        Ok(get_value(store, &Self::key(module))?.unwrap_or(0))
    }

    fn transfer(
        &self,
        store: &mut dyn KvStore,
        from: ModuleAccount,
        to: ModuleAccount,
        amount: u64,
    ) -> Result<(), BankError> {
        if amount == 0 || from == to {
            return Ok(());
        }
        let from_balance = self.balance(store, from)?;
        if from_balance < amount {
            return Err(BankError::InsufficientFunds {
                module: from,
                balance: from_balance,
                amount,
            });
        }
        let to_balance = self.balance(store, to)?;
        let credited = to_balance.checked_add(amount).ok_or(BankError::Overflow(to))?;
        self.set_balance(store, from, from_balance - amount)?;
        self.set_balance(store, to, credited)
    }
}
