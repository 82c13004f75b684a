// 8.6 engine/liquidations.rs: closing positions of liquidatable subaccounts.
//
// a liquidation is a synthetic taker priced at the fillable price. the
// difference between each fill and the bankruptcy price goes to or comes out of
// the insurance fund. whatever the book cannot absorb is deleveraged.

use super::core::{ClobKeeper, OPERATIONS_TX_INDEX};
use super::matches::{classify_rejected_fill, reduces_position, AppliedFill, FillRejection};
use super::results::{ClobError, LiquidationResult, ProcessProposerMatchesEvents};
use crate::bank::ModuleAccount;
use crate::clob_pair::ClobPair;
use crate::indexer::{OrderFillEventV1, PendingEvents, SUBTYPE_ORDER_FILL};
use crate::liquidation::{
    bankruptcy_quote_quantums, fillable_price_subticks, insurance_fund_delta, PositionRisk, SubaccountLiquidationInfo,
};
use crate::matching::{fee_for_quote, match_order, FillDecision, MatchOutcome, MatchWithOrders};
use crate::operations::{MatchPerpetualDeleveraging, MatchPerpetualLiquidation};
use crate::order::{crosses, LiquidationOrder, MatchableOrder, Order, OrderId, OrderRemovalReason};
use crate::store::{encoded_key, get_value, set_value, CacheStore, KvStore, SUBACCOUNT_LIQUIDATION_INFO_PREFIX};
use crate::subaccount::{SubaccountUpdate, UpdateKind};
use crate::types::{fill_amount_to_quote_quantums, PerpetualId, SubaccountId};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

fn invalid(subaccount_id: &SubaccountId, reason: String) -> ClobError {
    ClobError::InvalidLiquidation {
        subaccount_id: subaccount_id.clone(),
        reason,
    }
}

impl ClobKeeper {
    pub fn get_subaccount_liquidation_info(
        &self,
        store: &dyn KvStore,
        subaccount_id: &SubaccountId,
    ) -> Result<SubaccountLiquidationInfo, ClobError> {
        let key = encoded_key(SUBACCOUNT_LIQUIDATION_INFO_PREFIX, subaccount_id)?;
        Ok(get_value(store, &key)?.unwrap_or_default())
    }

    fn set_subaccount_liquidation_info(
        &self,
        store: &mut dyn KvStore,
        subaccount_id: &SubaccountId,
        info: &SubaccountLiquidationInfo,
    ) -> Result<(), ClobError> {
        let key = encoded_key(SUBACCOUNT_LIQUIDATION_INFO_PREFIX, subaccount_id)?;
        set_value(store, &key, info)?;
        Ok(())
    }

    /// Every subaccount with open positions that is below maintenance margin.
    pub fn get_liquidatable_subaccount_ids(&self, store: &dyn KvStore) -> Result<Vec<SubaccountId>, ClobError> {
        let mut ids = Vec::new();
        for subaccount in self.subaccounts.get_all_subaccounts(store)? {
            if subaccount.perpetual_positions.is_empty() {
                continue;
            }
            if self.subaccounts.is_liquidatable(store, &subaccount.id)? {
                ids.push(subaccount.id);
            }
        }
        Ok(ids)
    }

    pub(super) fn position_risk(
        &self,
        store: &dyn KvStore,
        subaccount_id: &SubaccountId,
        perpetual_id: PerpetualId,
    ) -> Result<PositionRisk, ClobError> {
        let total = self.subaccounts.get_net_collateral_and_margin_requirements(store, subaccount_id)?;
        let position_quantums = self
            .subaccounts
            .get_subaccount(store, subaccount_id)?
            .position_quantums(perpetual_id);
        let position_net_notional = self.perpetuals.get_net_notional(store, perpetual_id, position_quantums)?;
        let (_, position_maintenance_margin) =
            self.perpetuals.get_margin_requirements(store, perpetual_id, position_quantums)?;
        Ok(PositionRisk {
            total_net_collateral: total.net_collateral,
            total_maintenance_margin: total.maintenance_margin,
            position_net_notional,
            position_maintenance_margin,
            position_quantums,
        })
    }

    /// Quote delta that would leave the subaccount bankrupt after its position
    /// changes by `delta_quantums`.
    pub(super) fn bankruptcy_quote(
        &self,
        store: &dyn KvStore,
        subaccount_id: &SubaccountId,
        perpetual_id: PerpetualId,
        delta_quantums: i128,
    ) -> Result<i128, ClobError> {
        let risk = self.position_risk(store, subaccount_id, perpetual_id)?;
        let after = risk.position_quantums + delta_quantums;
        let notional_after = self.perpetuals.get_net_notional(store, perpetual_id, after)?;
        let (_, mmr_after) = self.perpetuals.get_margin_requirements(store, perpetual_id, after)?;
        Ok(bankruptcy_quote_quantums(
            risk.total_net_collateral,
            risk.total_maintenance_margin,
            notional_after - risk.position_net_notional,
            risk.position_maintenance_margin - mmr_after,
        ))
    }

    // 8.6.1: one liquidation fill. the liquidated side pays no taker fee; what
    // it pays beyond the bankruptcy price (or is short of it) is the insurance delta.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn process_liquidation_fill(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        tx_index: u32,
        pair: &ClobPair,
        liquidation: &LiquidationOrder,
        maker: &Order,
        fill_amount: u64,
    ) -> Result<AppliedFill, ClobError> {
        let liquidated = &liquidation.subaccount_id;
        let side = liquidation.side();
        if maker.order_id.clob_pair_id != liquidation.clob_pair_id || pair.id != liquidation.clob_pair_id {
            return Err(invalid(liquidated, format!("maker {} trades on another pair", maker.order_id)));
        }
        if maker.side == side {
            return Err(invalid(liquidated, format!("maker {} is on the liquidation's side", maker.order_id)));
        }
        if !crosses(side, liquidation.subticks, maker.subticks) {
            return Err(invalid(
                liquidated,
                format!(
                    "maker {} at {} is beyond the fillable price {}",
                    maker.order_id, maker.subticks, liquidation.subticks
                ),
            ));
        }
        if &maker.order_id.subaccount_id == liquidated {
            return Err(invalid(liquidated, format!("maker {} is the liquidated subaccount", maker.order_id)));
        }
        if pair.step_base_quantums > 0 && fill_amount % pair.step_base_quantums != 0 {
            return Err(ClobError::FillNotMultipleOfStep {
                fill_amount,
                step: pair.step_base_quantums,
            });
        }

        let maker_total = self.checked_total_fill(store, maker, fill_amount)?;
        let perpetual_id = liquidation.perpetual_id;
        let delta = side.sign() * fill_amount as i128;
        if maker.reduce_only {
            let position = self
                .subaccounts
                .get_subaccount(store, &maker.order_id.subaccount_id)?
                .position_quantums(perpetual_id);
            if !reduces_position(position, -delta) {
                return Err(ClobError::InvalidReduceOnly(maker.order_id.clone()));
            }
        }

        let quote = fill_amount_to_quote_quantums(maker.subticks, fill_amount, pair.quantum_conversion_exponent)
            .ok_or(ClobError::Overflow("fill quote quantums"))?;
        let bankruptcy = self.bankruptcy_quote(store, liquidated, perpetual_id, delta)?;
        let liquidated_quote = -side.sign() * quote as i128;
        let insurance_delta = insurance_fund_delta(
            liquidated_quote,
            bankruptcy,
            quote,
            self.config.liquidations.max_liquidation_fee_ppm,
        );
        let insurance_lost = u64::try_from((-insurance_delta).max(0)).map_err(|_| ClobError::Overflow("insurance fund delta"))?;
        if insurance_lost > 0 {
            let available = self.bank.balance(store, ModuleAccount::InsuranceFund)?;
            if available < insurance_lost {
                return Err(ClobError::InsufficientInsuranceFunds {
                    required: insurance_lost,
                    available,
                });
            }
        }

        let limits = &self.config.liquidations.subaccount_block_limits;
        let mut info = self.get_subaccount_liquidation_info(store, liquidated)?;
        info.notional_liquidated = info.notional_liquidated.saturating_add(quote);
        info.quantums_insurance_lost = info.quantums_insurance_lost.saturating_add(insurance_lost);
        if info.notional_liquidated > limits.max_notional_liquidated {
            return Err(ClobError::LiquidationExceedsBlockLimits {
                subaccount_id: liquidated.clone(),
                reason: format!(
                    "notional liquidated {} above {}",
                    info.notional_liquidated, limits.max_notional_liquidated
                ),
            });
        }
        if info.quantums_insurance_lost > limits.max_quantums_insurance_lost {
            return Err(ClobError::LiquidationExceedsBlockLimits {
                subaccount_id: liquidated.clone(),
                reason: format!(
                    "insurance lost {} above {}",
                    info.quantums_insurance_lost, limits.max_quantums_insurance_lost
                ),
            });
        }

        let maker_fee = fee_for_quote(quote, pair.fee_ppm(false)).ok_or(ClobError::Overflow("maker fee"))?;
        self.subaccounts.update_subaccounts(
            store,
            &[
                SubaccountUpdate::trade(liquidated.clone(), liquidated_quote - insurance_delta, perpetual_id, delta),
                SubaccountUpdate::trade(
                    maker.order_id.subaccount_id.clone(),
                    side.sign() * quote as i128 - maker_fee as i128,
                    perpetual_id,
                    -delta,
                ),
            ],
            UpdateKind::Liquidation,
        )?;
        self.bank
            .transfer_signed(store, ModuleAccount::Subaccounts, ModuleAccount::InsuranceFund, insurance_delta)?;
        self.bank
            .transfer_signed(store, ModuleAccount::Subaccounts, ModuleAccount::FeeCollector, maker_fee as i128)?;

        self.record_order_fill(store, maker, maker_total)?;
        self.set_subaccount_liquidation_info(store, liquidated, &info)?;
        self.stats
            .record_fill(store, &liquidated.owner, &maker.order_id.subaccount_id.owner, quote)?;

        let insurance_fee = i64::try_from(insurance_delta).map_err(|_| ClobError::Overflow("insurance fund delta"))?;
        events.add_txn(
            tx_index,
            SUBTYPE_ORDER_FILL,
            &OrderFillEventV1::liquidation(
                maker.clone(),
                liquidation.clone(),
                fill_amount,
                maker_fee,
                insurance_fee,
                maker_total,
            ),
        )?;
        self.emit_subaccount_update(store, events, tx_index, liquidated)?;
        self.emit_subaccount_update(store, events, tx_index, &maker.order_id.subaccount_id)?;

        debug!(%liquidated, maker = %maker.order_id, fill_amount, insurance_delta, "applied liquidation fill");
        Ok(AppliedFill {
            match_with_orders: MatchWithOrders {
                taker: MatchableOrder::Liquidation(liquidation.clone()),
                maker: maker.clone(),
                fill_amount,
                maker_fee,
                taker_fee: insurance_fee,
            },
            quote_quantums: quote,
            taker_total_filled: 0,
            maker_total_filled: maker_total,
        })
    }

    /// Rebuilds the liquidation order for a position, priced at the fillable price.
    fn liquidation_order(
        &self,
        store: &dyn KvStore,
        pair: &ClobPair,
        subaccount_id: &SubaccountId,
        perpetual_id: PerpetualId,
        total_size: u64,
    ) -> Result<LiquidationOrder, ClobError> {
        let risk = self.position_risk(store, subaccount_id, perpetual_id)?;
        if risk.position_quantums == 0 {
            return Err(invalid(subaccount_id, format!("no position in perpetual {perpetual_id}")));
        }
        let subticks = fillable_price_subticks(&self.config.liquidations.fillable_price_config, &risk, pair)
            .ok_or_else(|| invalid(subaccount_id, "fillable price is undefined".to_string()))?;
        Ok(LiquidationOrder {
            subaccount_id: subaccount_id.clone(),
            clob_pair_id: pair.id,
            perpetual_id,
            total_size,
            is_buy: risk.position_quantums < 0,
            subticks,
        })
    }

    // 8.6.2: replay of a proposed liquidation match.
    pub(super) fn replay_liquidation(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        summary: &mut ProcessProposerMatchesEvents,
        placed: &BTreeMap<OrderId, Order>,
        liquidation_match: &MatchPerpetualLiquidation,
    ) -> Result<(), ClobError> {
        let liquidated = &liquidation_match.liquidated;
        let perpetual_id = liquidation_match.perpetual_id;
        if self.get_subaccount_liquidation_info(store, liquidated)?.has_liquidated(perpetual_id) {
            return Err(ClobError::SubaccountAlreadyLiquidated {
                subaccount_id: liquidated.clone(),
                perpetual_id,
            });
        }
        if !self.subaccounts.is_liquidatable(store, liquidated)? {
            return Err(ClobError::SubaccountNotLiquidatable(liquidated.clone()));
        }
        let clob_pair_id = self.get_clob_pair_for_perpetual(perpetual_id)?;
        if clob_pair_id != liquidation_match.clob_pair_id {
            return Err(invalid(
                liquidated,
                format!("perpetual {perpetual_id} trades on {clob_pair_id}, not {}", liquidation_match.clob_pair_id),
            ));
        }
        let pair = self.clob_pair_matching(store, clob_pair_id)?;

        let liquidation = self.liquidation_order(store, &pair, liquidated, perpetual_id, liquidation_match.total_size)?;
        if liquidation.is_buy != liquidation_match.is_buy {
            return Err(invalid(liquidated, "liquidation side does not close the position".to_string()));
        }
        let position = self.subaccounts.get_subaccount(store, liquidated)?.position_quantums(perpetual_id);
        if position.unsigned_abs() < liquidation_match.total_size as u128 {
            return Err(invalid(
                liquidated,
                format!("total size {} exceeds position {position}", liquidation_match.total_size),
            ));
        }
        let filled: u64 = liquidation_match.fills.iter().map(|f| f.fill_amount).sum();
        if filled > liquidation_match.total_size {
            return Err(invalid(
                liquidated,
                format!("fills {filled} exceed total size {}", liquidation_match.total_size),
            ));
        }

        for fill in &liquidation_match.fills {
            let maker = self.resolve_order(store, placed, &fill.maker_order_id)?;
            let applied = self.process_liquidation_fill(
                store,
                events,
                OPERATIONS_TX_INDEX,
                &pair,
                &liquidation,
                &maker,
                fill.fill_amount,
            )?;
            summary.order_ids_filled_in_last_block.push(maker.order_id.clone());
            if applied.maker_fully_filled() && maker.is_stateful() {
                self.remove_stateful_order(
                    store,
                    events,
                    OPERATIONS_TX_INDEX,
                    &maker.order_id,
                    OrderRemovalReason::FullyFilled,
                )?;
                summary.add_removed(maker.order_id.clone());
            }
        }

        // fills moved the notional and insurance totals
        let mut info = self.get_subaccount_liquidation_info(store, liquidated)?;
        info.perpetuals_liquidated.push(perpetual_id);
        self.set_subaccount_liquidation_info(store, liquidated, &info)
    }

    // largest notional first; ties go to the lower perpetual id
    fn position_to_liquidate(
        &self,
        store: &dyn KvStore,
        subaccount_id: &SubaccountId,
        info: &SubaccountLiquidationInfo,
    ) -> Result<Option<(PerpetualId, i128)>, ClobError> {
        let subaccount = self.subaccounts.get_subaccount(store, subaccount_id)?;
        let mut best: Option<(PerpetualId, i128, u128)> = None;
        for position in &subaccount.perpetual_positions {
            let perpetual_id = position.perpetual_id;
            if position.quantums == 0
                || info.has_liquidated(perpetual_id)
                || self.get_clob_pair_for_perpetual(perpetual_id).is_err()
            {
                continue;
            }
            let quantums = position.quantums as i128;
            let notional = self
                .perpetuals
                .get_net_notional(store, perpetual_id, quantums)?
                .unsigned_abs();
            let better = match best {
                Some((best_id, _, best_notional)) => {
                    notional > best_notional || (notional == best_notional && perpetual_id < best_id)
                }
                None => true,
            };
            if better {
                best = Some((perpetual_id, quantums, notional));
            }
        }
        Ok(best.map(|(id, quantums, _)| (id, quantums)))
    }

    /// Writes that follow the book match of a local liquidation: maker
    /// removals, the per-block record, deleveraging of what the book left and
    /// the queued operations. returns the deleveraged quantums.
    fn settle_liquidation(
        &self,
        branch: &mut dyn KvStore,
        liquidation: &LiquidationOrder,
        outcome: &MatchOutcome,
        position_size: u64,
    ) -> Result<u64, ClobError> {
        let subaccount_id = &liquidation.subaccount_id;
        let perpetual_id = liquidation.perpetual_id;
        let mut removals = Vec::new();
        for (order_id, reason) in &outcome.removed_makers {
            if order_id.is_stateful() && self.delete_stateful_order(branch, order_id)? {
                removals.push((order_id.clone(), *reason));
            }
        }

        let mut info = self.get_subaccount_liquidation_info(branch, subaccount_id)?;
        info.perpetuals_liquidated.push(perpetual_id);
        self.set_subaccount_liquidation_info(branch, subaccount_id, &info)?;

        let remaining = position_size - outcome.filled();
        let mut deleveraging: Option<MatchPerpetualDeleveraging> = None;
        if remaining > 0 && self.subaccounts.is_liquidatable(branch, subaccount_id)? {
            deleveraging = self.deleverage_locally(branch, subaccount_id, perpetual_id, remaining)?;
        }
        let deleveraged = deleveraging
            .as_ref()
            .map(|m| m.fills.iter().map(|f| f.fill_amount).sum())
            .unwrap_or(0);

        let mut operations = self.operations_queue()?;
        for (order_id, reason) in removals {
            operations.add_order_removal(order_id, reason)?;
        }
        if !outcome.fills.is_empty() {
            operations.add_liquidation_match(liquidation, &outcome.fills)?;
        }
        if let Some(m) = deleveraging {
            operations.add_deleveraging_match(m)?;
        }
        Ok(deleveraged)
    }

    // 8.6.3: local liquidation. matches against the book, then deleverages
    // what the book could not absorb while the subaccount stays liquidatable.
    pub fn liquidate_subaccount(
        &self,
        store: &mut dyn KvStore,
        subaccount_id: &SubaccountId,
    ) -> Result<LiquidationResult, ClobError> {
        if !self.subaccounts.is_liquidatable(store, subaccount_id)? {
            return Err(ClobError::SubaccountNotLiquidatable(subaccount_id.clone()));
        }
        let info = self.get_subaccount_liquidation_info(store, subaccount_id)?;
        let Some((perpetual_id, position)) = self.position_to_liquidate(store, subaccount_id, &info)? else {
            return Err(invalid(subaccount_id, "no position left to liquidate this block".to_string()));
        };
        let clob_pair_id = self.get_clob_pair_for_perpetual(perpetual_id)?;
        let pair = self.clob_pair_matching(store, clob_pair_id)?;
        let position_size = u64::try_from(position.unsigned_abs()).map_err(|_| ClobError::Overflow("position size"))?;
        let total_size = pair.round_down_to_step(position_size);
        let liquidation = self.liquidation_order(store, &pair, subaccount_id, perpetual_id, total_size)?;

        let mut branch = CacheStore::new(store);
        let mut result = LiquidationResult {
            subaccount_id: Some(subaccount_id.clone()),
            perpetual_id: Some(perpetual_id),
            ..LiquidationResult::default()
        };

        let mut memclob = self.write_memclob()?;
        let book = memclob
            .book_mut(pair.id)
            .map_err(|_| ClobError::ClobPairNotFound(pair.id))?;
        let mut fatal: Option<ClobError> = None;
        let mut applied: Vec<AppliedFill> = Vec::new();
        let mut outcome = match_order(
            book,
            &MatchableOrder::Liquidation(liquidation.clone()),
            total_size,
            self.config.self_trade_policy,
            |maker, fill_amount| {
                let mut fill_store = CacheStore::new(&mut branch);
                let mut fill_events = PendingEvents::new();
                let attempt = self
                    .process_liquidation_fill(
                        &mut fill_store,
                        &mut fill_events,
                        OPERATIONS_TX_INDEX,
                        &pair,
                        &liquidation,
                        maker,
                        fill_amount,
                    )
                    .and_then(|fill| {
                        if fill.maker_fully_filled() && maker.is_stateful() {
                            self.delete_stateful_order(&mut fill_store, &maker.order_id)?;
                        }
                        Ok(fill)
                    });
                match attempt {
                    Ok(fill) => {
                        fill_store.commit();
                        applied.push(fill);
                        FillDecision::Accept
                    }
                    Err(
                        err @ (ClobError::InsufficientInsuranceFunds { .. }
                        | ClobError::LiquidationExceedsBlockLimits { .. }),
                    ) => {
                        debug!(%subaccount_id, error = %err, "liquidation stopped");
                        FillDecision::StopTaker
                    }
                    Err(err) => match classify_rejected_fill(err, maker) {
                        FillRejection::RemoveMaker(reason) => FillDecision::RemoveMaker(reason),
                        FillRejection::StopTaker(_) => FillDecision::StopTaker,
                        FillRejection::Fatal(err) => {
                            fatal = Some(err);
                            FillDecision::StopTaker
                        }
                    },
                }
            },
        )?;
        let undo = std::mem::take(&mut outcome.undo);
        if let Some(err) = fatal {
            book.restore(undo);
            return Err(err);
        }

        result.liquidated_quantums = outcome.filled();
        result.insurance_fund_delta = applied.iter().map(|f| f.match_with_orders.taker_fee as i128).sum();
        result.matches = applied.into_iter().map(|f| f.match_with_orders).collect();
        match self.settle_liquidation(&mut branch, &liquidation, &outcome, position_size) {
            Ok(deleveraged) => result.deleveraged_quantums = deleveraged,
            Err(err) => {
                book.restore(undo);
                return Err(err);
            }
        }
        branch.commit();

        if result.liquidated_quantums == 0 && result.deleveraged_quantums == 0 {
            warn!(%subaccount_id, %perpetual_id, "liquidation closed nothing");
        } else {
            info!(
                %subaccount_id,
                %perpetual_id,
                liquidated = result.liquidated_quantums,
                deleveraged = result.deleveraged_quantums,
                insurance_fund_delta = result.insurance_fund_delta,
                "liquidated subaccount"
            );
        }
        Ok(result)
    }
}
