//! Subaccount ledger.
//!
//! A subaccount holds a quote balance and one position per perpetual. Every
//! update settles outstanding funding on the touched subaccount first, then
//! applies the deltas and, unless the update kind skips it, runs the collateral
//! check. A batch of updates is all-or-nothing: nothing is written unless every
//! update in the batch passes.

use crate::margin::{funding_settlement, RiskSummary};
use crate::registry::{PerpetualsRegistry, RegistryError};
use crate::store::{encoded_key, get_all_values, get_value, set_value, KvStore, StoreError, SUBACCOUNT_PREFIX};
use crate::types::{PerpetualId, SubaccountId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualPosition {
    pub perpetual_id: PerpetualId,
    /// Signed base quantums. longs positive.
    pub quantums: i64,
    /// Perpetual funding index at the last settlement.
    pub funding_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subaccount {
    pub id: SubaccountId,
    pub quote_balance: i64,
    /// Sorted by perpetual id, never holds a zero position.
    pub perpetual_positions: Vec<PerpetualPosition>,
}

impl Subaccount {
    pub fn empty(id: SubaccountId) -> Self {
        Self {
            id,
            quote_balance: 0,
            perpetual_positions: Vec::new(),
        }
    }

    pub fn with_quote(id: SubaccountId, quote_balance: i64) -> Self {
        Self {
            quote_balance,
            ..Self::empty(id)
        }
    }

    pub fn position(&self, perpetual_id: PerpetualId) -> Option<&PerpetualPosition> {
        self.perpetual_positions
            .iter()
            .find(|p| p.perpetual_id == perpetual_id)
    }

    /// Signed position size, zero when flat.
    pub fn position_quantums(&self, perpetual_id: PerpetualId) -> i128 {
        self.position(perpetual_id).map(|p| p.quantums as i128).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.quote_balance == 0 && self.perpetual_positions.is_empty()
    }

    /// Replaces the position in `perpetual_id`; zero removes it.
    pub fn set_position(&mut self, perpetual_id: PerpetualId, quantums: i64, funding_index: i64) {
        self.perpetual_positions.retain(|p| p.perpetual_id != perpetual_id);
        if quantums != 0 {
            self.perpetual_positions.push(PerpetualPosition {
                perpetual_id,
                quantums,
                funding_index,
            });
            self.perpetual_positions.sort_by_key(|p| p.perpetual_id);
        }
    }

    pub fn with_position(mut self, perpetual_id: PerpetualId, quantums: i64, funding_index: i64) -> Self {
        self.set_position(perpetual_id, quantums, funding_index);
        self
    }
}

/// Deltas applied to one subaccount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountUpdate {
    pub subaccount_id: SubaccountId,
    pub quote_delta: i128,
    pub perpetual_deltas: Vec<(PerpetualId, i128)>,
}

impl SubaccountUpdate {
    pub fn quote_only(subaccount_id: SubaccountId, quote_delta: i128) -> Self {
        Self {
            subaccount_id,
            quote_delta,
            perpetual_deltas: Vec::new(),
        }
    }

    pub fn trade(subaccount_id: SubaccountId, quote_delta: i128, perpetual_id: PerpetualId, quantums_delta: i128) -> Self {
        Self {
            subaccount_id,
            quote_delta,
            perpetual_deltas: vec![(perpetual_id, quantums_delta)],
        }
    }
}

/// Why the ledger is being updated. decides whether the collateral check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Match,
    Liquidation,
    Deleveraging,
    Transfer,
}

impl UpdateKind {
    pub fn is_collateral_checked(&self) -> bool {
        !matches!(self, UpdateKind::Deleveraging)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollateralFailure {
    /// Was collateralized (or flat) and would no longer be.
    NewlyUndercollateralized,
    /// Already undercollateralized and the collateral ratio would get worse.
    StillUndercollateralized,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubaccountError {
    #[error("subaccount {subaccount_id} update rejected: {failure:?} (net collateral {net_collateral}, initial margin {initial_margin})")]
    Undercollateralized {
        subaccount_id: SubaccountId,
        failure: CollateralFailure,
        net_collateral: i128,
        initial_margin: i128,
    },

    #[error("balance overflow for subaccount {0}")]
    Overflow(SubaccountId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// 4.1: collateral rule.
//
// passes if the new state meets initial margin. otherwise only a subaccount that
// was already below initial margin with risk open may proceed, and only if its
// net collateral to maintenance margin ratio does not get worse.
pub fn check_collateral(old: &RiskSummary, new: &RiskSummary) -> Result<(), CollateralFailure> {
    if new.is_initial_collateralized() {
        return Ok(());
    }
    if old.is_initial_collateralized() || old.maintenance_margin == 0 {
        return Err(CollateralFailure::NewlyUndercollateralized);
    }
    if new.maintenance_margin == 0 {
        return if new.net_collateral >= 0 {
            Ok(())
        } else {
            Err(CollateralFailure::StillUndercollateralized)
        };
    }
    // both maintenance margins positive: compare nc/mmr by cross multiplication
    let lhs = new.net_collateral.checked_mul(old.maintenance_margin);
    let rhs = old.net_collateral.checked_mul(new.maintenance_margin);
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) if lhs >= rhs => Ok(()),
        _ => Err(CollateralFailure::StillUndercollateralized),
    }
}

/// Ledger interface the CLOB writes balances through.
pub trait SubaccountLedger: Send + Sync {
    /// Missing subaccounts read as empty.
    fn get_subaccount(&self, store: &dyn KvStore, id: &SubaccountId) -> Result<Subaccount, SubaccountError>;

    fn set_subaccount(&self, store: &mut dyn KvStore, subaccount: &Subaccount) -> Result<(), SubaccountError>;

    /// Every stored subaccount, ordered by id.
    fn get_all_subaccounts(&self, store: &dyn KvStore) -> Result<Vec<Subaccount>, SubaccountError>;

    fn get_net_collateral_and_margin_requirements(
        &self,
        store: &dyn KvStore,
        id: &SubaccountId,
    ) -> Result<RiskSummary, SubaccountError>;

    fn update_subaccounts(
        &self,
        store: &mut dyn KvStore,
        updates: &[SubaccountUpdate],
        kind: UpdateKind,
    ) -> Result<(), SubaccountError>;

    fn is_liquidatable(&self, store: &dyn KvStore, id: &SubaccountId) -> Result<bool, SubaccountError> {
        Ok(self
            .get_net_collateral_and_margin_requirements(store, id)?
            .is_liquidatable())
    }
}

/// Store-backed ledger. Prices and margin parameters come from the registry.
#[derive(Clone)]
pub struct SubaccountsKeeper {
    registry: Arc<dyn PerpetualsRegistry>,
}

impl SubaccountsKeeper {
    pub fn new(registry: Arc<dyn PerpetualsRegistry>) -> Self {
        Self { registry }
    }

    fn key(id: &SubaccountId) -> Result<Vec<u8>, StoreError> {
        encoded_key(SUBACCOUNT_PREFIX, id)
    }

    /// Risk of an in-memory subaccount at current prices.
    pub fn risk_of(&self, store: &dyn KvStore, subaccount: &Subaccount) -> Result<RiskSummary, SubaccountError> {
        let mut summary = RiskSummary {
            net_collateral: subaccount.quote_balance as i128,
            ..RiskSummary::default()
        };
        for position in &subaccount.perpetual_positions {
            let quantums = position.quantums as i128;
            let notional = self
                .registry
                .get_net_notional(store, position.perpetual_id, quantums)?;
            let (initial, maintenance) =
                self.registry
                    .get_margin_requirements(store, position.perpetual_id, quantums)?;
            summary.add_position(notional, initial, maintenance);
        }
        Ok(summary)
    }

    // 4.2: funding settlement. moves owed funding into the quote balance and
    // resets every position's index to its perpetual's current one.
    fn settle_funding(&self, store: &dyn KvStore, subaccount: &mut Subaccount) -> Result<(), SubaccountError> {
        let mut settled: i128 = 0;
        for position in subaccount.perpetual_positions.iter_mut() {
            let perpetual = self.registry.get_perpetual(store, position.perpetual_id)?;
            let delta = perpetual.funding_index as i128 - position.funding_index as i128;
            let delta = i64::try_from(delta).map_err(|_| SubaccountError::Overflow(subaccount.id.clone()))?;
            settled += funding_settlement(delta, position.quantums as i128);
            position.funding_index = perpetual.funding_index;
        }
        if settled != 0 {
            debug!(subaccount = %subaccount.id, settled, "settled funding");
        }
        apply_quote(subaccount, settled)
    }

    fn apply_update(
        &self,
        store: &dyn KvStore,
        subaccount: &mut Subaccount,
        update: &SubaccountUpdate,
    ) -> Result<(), SubaccountError> {
        apply_quote(subaccount, update.quote_delta)?;
        for (perpetual_id, delta) in &update.perpetual_deltas {
            if *delta == 0 {
                continue;
            }
            let current = subaccount.position_quantums(*perpetual_id);
            let next = current
                .checked_add(*delta)
                .and_then(|q| i64::try_from(q).ok())
                .ok_or_else(|| SubaccountError::Overflow(subaccount.id.clone()))?;
            let funding_index = match subaccount.position(*perpetual_id) {
                Some(position) => position.funding_index,
                None => self.registry.get_perpetual(store, *perpetual_id)?.funding_index,
            };
            subaccount.set_position(*perpetual_id, next, funding_index);
        }
        Ok(())
    }

    /// Ledger side of a deposit into a subaccount.
    pub fn deposit(&self, store: &mut dyn KvStore, id: &SubaccountId, amount: u64) -> Result<(), SubaccountError> {
        let update = SubaccountUpdate::quote_only(id.clone(), amount as i128);
        self.update_subaccounts(store, &[update], UpdateKind::Transfer)
    }

    /// Ledger side of a withdrawal. collateral checked.
    pub fn withdraw(&self, store: &mut dyn KvStore, id: &SubaccountId, amount: u64) -> Result<(), SubaccountError> {
        let update = SubaccountUpdate::quote_only(id.clone(), -(amount as i128));
        self.update_subaccounts(store, &[update], UpdateKind::Transfer)
    }
}

fn apply_quote(subaccount: &mut Subaccount, delta: i128) -> Result<(), SubaccountError> {
    let next = (subaccount.quote_balance as i128)
        .checked_add(delta)
        .and_then(|q| i64::try_from(q).ok())
        .ok_or_else(|| SubaccountError::Overflow(subaccount.id.clone()))?;
    subaccount.quote_balance = next;
    Ok(())
}

impl SubaccountLedger for SubaccountsKeeper {
    fn get_subaccount(&self, store: &dyn KvStore, id: &SubaccountId) -> Result<Subaccount, SubaccountError> {
        Ok(get_value(store, &Self::key(id)?)?.unwrap_or_else(|| Subaccount::empty(id.clone())))
    }

    fn set_subaccount(&self, store: &mut dyn KvStore, subaccount: &Subaccount) -> Result<(), SubaccountError> {
        set_value(store, &Self::key(&subaccount.id)?, subaccount)?;
        Ok(())
    }

    fn get_all_subaccounts(&self, store: &dyn KvStore) -> Result<Vec<Subaccount>, SubaccountError> {
        let mut all: Vec<Subaccount> = get_all_values(store, SUBACCOUNT_PREFIX)?;
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn get_net_collateral_and_margin_requirements(
        &self,
        store: &dyn KvStore,
        id: &SubaccountId,
    ) -> Result<RiskSummary, SubaccountError> {
        let mut subaccount = self.get_subaccount(store, id)?;
        self.settle_funding(store, &mut subaccount)?;
        self.risk_of(store, &subaccount)
    }

    fn update_subaccounts(
        &self,
        store: &mut dyn KvStore,
        updates: &[SubaccountUpdate],
        kind: UpdateKind,
    ) -> Result<(), SubaccountError> {
        // (settled before the batch, working copy)
        let mut working: BTreeMap<SubaccountId, (RiskSummary, Subaccount)> = BTreeMap::new();

        for update in updates {
            if !working.contains_key(&update.subaccount_id) {
                let mut subaccount = self.get_subaccount(store, &update.subaccount_id)?;
                self.settle_funding(store, &mut subaccount)?;
                let risk = self.risk_of(store, &subaccount)?;
                working.insert(update.subaccount_id.clone(), (risk, subaccount));
            }
            if let Some((_, subaccount)) = working.get_mut(&update.subaccount_id) {
                self.apply_update(store, subaccount, update)?;
            }
        }

        if kind.is_collateral_checked() {
            for (id, (old, subaccount)) in &working {
                let new = self.risk_of(store, subaccount)?;
                check_collateral(old, &new).map_err(|failure| SubaccountError::Undercollateralized {
                    subaccount_id: id.clone(),
                    failure,
                    net_collateral: new.net_collateral,
                    initial_margin: new.initial_margin,
                })?;
            }
        }

        for (_, subaccount) in working.values() {
            self.set_subaccount(store, subaccount)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::margin::LiquidityTier;
    use crate::registry::{MarketPrice, Perpetual, PerpetualsKeeper};
    use crate::store::MemStore;
    use crate::types::{LiquidityTierId, MarketId};

    const BTC: PerpetualId = PerpetualId(0);
    const ONE_BTC: i64 = 100_000_000;
    const USDC: i64 = 1_000_000;

    fn setup() -> (MemStore, Arc<PerpetualsKeeper>, SubaccountsKeeper) {
        let mut store = MemStore::new();
        let registry = Arc::new(PerpetualsKeeper::new());
        registry
            .create_market(
                &mut store,
                MarketPrice {
                    id: MarketId(0),
                    exponent: -5,
                    price: 5_000_000_000,
                },
            )
            .unwrap();
        registry
            .create_liquidity_tier(&mut store, LiquidityTier::twenty_percent_initial(LiquidityTierId(0)))
            .unwrap();
        registry
            .create_perpetual(
                &mut store,
                Perpetual {
                    id: BTC,
                    ticker: "BTC-USD".to_string(),
                    market_id: MarketId(0),
                    atomic_resolution: -8,
                    default_funding_ppm: 0,
                    liquidity_tier: LiquidityTierId(0),
                    funding_index: 0,
                },
            )
            .unwrap();
        let ledger = SubaccountsKeeper::new(registry.clone());
        (store, registry, ledger)
    }

    fn alice() -> SubaccountId {
        SubaccountId::new("alice", 0)
    }

    #[test]
    fn missing_subaccount_reads_empty() {
        let (store, _, ledger) = setup();
        let sub = ledger.get_subaccount(&store, &alice()).unwrap();
        assert!(sub.is_empty());
    }

    #[test]
    fn trade_opens_position() {
        let (mut store, _, ledger) = setup();
        ledger
            .set_subaccount(&mut store, &Subaccount::with_quote(alice(), 100_000 * USDC))
            .unwrap();
        let update = SubaccountUpdate::trade(alice(), -(50_000 * USDC) as i128, BTC, ONE_BTC as i128);
        ledger.update_subaccounts(&mut store, &[update], UpdateKind::Match).unwrap();

        let sub = ledger.get_subaccount(&store, &alice()).unwrap();
        assert_eq!(sub.quote_balance, 50_000 * USDC);
        assert_eq!(sub.position_quantums(BTC), ONE_BTC as i128);
        assert_eq!(sub.position(BTC).unwrap().funding_index, 0);
    }

    #[test]
    fn undercollateralized_update_is_rejected_and_not_written() {
        let (mut store, _, ledger) = setup();
        ledger
            .set_subaccount(&mut store, &Subaccount::with_quote(alice(), 5_000 * USDC))
            .unwrap();
        // 1 BTC needs $10,000 initial margin
        let update = SubaccountUpdate::trade(alice(), -(50_000 * USDC) as i128, BTC, ONE_BTC as i128);
        let err = ledger
            .update_subaccounts(&mut store, &[update], UpdateKind::Match)
            .unwrap_err();
        assert!(matches!(
            err,
            SubaccountError::Undercollateralized {
                failure: CollateralFailure::NewlyUndercollateralized,
                ..
            }
        ));
        assert_eq!(ledger.get_subaccount(&store, &alice()).unwrap().quote_balance, 5_000 * USDC);
    }

    #[test]
    fn deleveraging_skips_collateral_check() {
        let (mut store, _, ledger) = setup();
        let update = SubaccountUpdate::trade(alice(), -(50_000 * USDC) as i128, BTC, ONE_BTC as i128);
        ledger
            .update_subaccounts(&mut store, &[update], UpdateKind::Deleveraging)
            .unwrap();
        assert_eq!(ledger.get_subaccount(&store, &alice()).unwrap().quote_balance, -50_000 * USDC);
    }

    #[test]
    fn funding_settles_on_update() {
        let (mut store, registry, ledger) = setup();
        ledger
            .set_subaccount(
                &mut store,
                &Subaccount::with_quote(alice(), 100_000 * USDC).with_position(BTC, ONE_BTC, 0),
            )
            .unwrap();
        registry.set_funding_index(&mut store, BTC, 10).unwrap();
        ledger.deposit(&mut store, &alice(), 0).unwrap();

        let sub = ledger.get_subaccount(&store, &alice()).unwrap();
        // long pays 10 * 1e8 / 1e6
        assert_eq!(sub.quote_balance, 100_000 * USDC - 1_000);
        assert_eq!(sub.position(BTC).unwrap().funding_index, 10);
    }

    #[test]
    fn closing_position_removes_it() {
        let (mut store, _, ledger) = setup();
        ledger
            .set_subaccount(
                &mut store,
                &Subaccount::with_quote(alice(), 0).with_position(BTC, ONE_BTC, 0),
            )
            .unwrap();
        let update = SubaccountUpdate::trade(alice(), (50_000 * USDC) as i128, BTC, -(ONE_BTC as i128));
        ledger.update_subaccounts(&mut store, &[update], UpdateKind::Match).unwrap();
        let sub = ledger.get_subaccount(&store, &alice()).unwrap();
        assert!(sub.perpetual_positions.is_empty());
    }

    #[test]
    fn withdraw_beyond_free_collateral_fails() {
        let (mut store, _, ledger) = setup();
        ledger
            .set_subaccount(
                &mut store,
                &Subaccount::with_quote(alice(), -40_000 * USDC).with_position(BTC, ONE_BTC, 0),
            )
            .unwrap();
        // net collateral $10,000, initial margin $10,000
        assert!(ledger.withdraw(&mut store, &alice(), 1).is_err());
        ledger.deposit(&mut store, &alice(), 1).unwrap();
    }

    #[test]
    fn collateral_rule() {
        let risk = |nc, imr, mmr| RiskSummary {
            net_collateral: nc,
            initial_margin: imr,
            maintenance_margin: mmr,
        };
        assert!(check_collateral(&risk(0, 0, 0), &risk(10, 10, 5)).is_ok());
        assert_eq!(
            check_collateral(&risk(0, 0, 0), &risk(-1, 0, 0)),
            Err(CollateralFailure::NewlyUndercollateralized)
        );
        // ratio 4/5 improves to 3/2
        assert!(check_collateral(&risk(4, 10, 5), &risk(3, 4, 2)).is_ok());
        assert_eq!(
            check_collateral(&risk(4, 10, 5), &risk(1, 4, 2)),
            Err(CollateralFailure::StillUndercollateralized)
        );
        // fully closed but bankrupt
        assert_eq!(
            check_collateral(&risk(4, 10, 5), &risk(-1, 0, 0)),
            Err(CollateralFailure::StillUndercollateralized)
        );
    }
}
