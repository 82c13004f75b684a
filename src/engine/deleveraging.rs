// 8.7 engine/deleveraging.rs: offsetting a liquidated position against
// opposite positions at the liquidated subaccount's bankruptcy price.

use super::core::{ClobKeeper, OPERATIONS_TX_INDEX};
use super::results::ClobError;
use crate::deleveraging::{allocate_offsetting_fills, rank_offsetting_candidates, OffsettingCandidate};
use crate::indexer::{DeleveragingEventV1, PendingEvents, SUBTYPE_DELEVERAGING};
use crate::operations::{DeleveragingFill, MatchPerpetualDeleveraging};
use crate::store::{CacheStore, KvStore};
use crate::subaccount::{SubaccountUpdate, UpdateKind};
use crate::types::{PerpetualId, SubaccountId};
use tracing::{debug, warn};

impl ClobKeeper {
    // 8.7.1: applies every fill or none. the liquidated subaccount must be
    // liquidatable when the match starts; the fills themselves skip the
    // collateral check.
    pub(super) fn apply_deleveraging(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        tx_index: u32,
        deleveraging: &MatchPerpetualDeleveraging,
    ) -> Result<u64, ClobError> {
        let liquidated = &deleveraging.liquidated;
        let perpetual_id = deleveraging.perpetual_id;
        if !self.subaccounts.is_liquidatable(store, liquidated)? {
            return Err(ClobError::DeleveragedSubaccountNotLiquidatable(liquidated.clone()));
        }

        let mut total = 0u64;
        for fill in &deleveraging.fills {
            let offsetting = &fill.offsetting_subaccount_id;
            let amount = fill.fill_amount as i128;
            if offsetting == liquidated {
                return Err(ClobError::InvalidDeleveragingFill(format!(
                    "{liquidated} cannot offset its own position"
                )));
            }
            let liquidated_position = self.subaccounts.get_subaccount(store, liquidated)?.position_quantums(perpetual_id);
            if liquidated_position == 0 || liquidated_position.abs() < amount {
                return Err(ClobError::InvalidDeleveragingFill(format!(
                    "fill {} exceeds position {liquidated_position} of {liquidated}",
                    fill.fill_amount
                )));
            }
            let offsetting_position = self.subaccounts.get_subaccount(store, offsetting)?.position_quantums(perpetual_id);
            if offsetting_position.signum() != -liquidated_position.signum() || offsetting_position.abs() < amount {
                return Err(ClobError::InvalidDeleveragingFill(format!(
                    "{offsetting} with position {offsetting_position} cannot offset {} of {liquidated}",
                    fill.fill_amount
                )));
            }

            let delta = -liquidated_position.signum() * amount;
            let bankruptcy = self.bankruptcy_quote(store, liquidated, perpetual_id, delta)?;
            self.subaccounts.update_subaccounts(
                store,
                &[
                    SubaccountUpdate::trade(liquidated.clone(), bankruptcy, perpetual_id, delta),
                    SubaccountUpdate::trade(offsetting.clone(), -bankruptcy, perpetual_id, -delta),
                ],
                UpdateKind::Deleveraging,
            )?;

            events.add_txn(
                tx_index,
                SUBTYPE_DELEVERAGING,
                &DeleveragingEventV1 {
                    liquidated: liquidated.clone(),
                    offsetting: offsetting.clone(),
                    perpetual_id,
                    fill_amount: fill.fill_amount,
                    total_quote_quantums: u64::try_from(bankruptcy.unsigned_abs())
                        .map_err(|_| ClobError::Overflow("deleveraging quote"))?,
                    is_buy: delta > 0,
                },
            )?;
            self.emit_subaccount_update(store, events, tx_index, liquidated)?;
            self.emit_subaccount_update(store, events, tx_index, offsetting)?;
            total += fill.fill_amount;
            debug!(%liquidated, %offsetting, fill_amount = fill.fill_amount, bankruptcy, "deleveraged");
        }
        Ok(total)
    }

    /// Most levered opposite positions first, up to `quantums`.
    pub fn offsetting_fills(
        &self,
        store: &dyn KvStore,
        liquidated: &SubaccountId,
        perpetual_id: PerpetualId,
        quantums: u64,
    ) -> Result<Vec<DeleveragingFill>, ClobError> {
        let position = self.subaccounts.get_subaccount(store, liquidated)?.position_quantums(perpetual_id);
        let mut candidates = Vec::new();
        for subaccount in self.subaccounts.get_all_subaccounts(store)? {
            let quantums = subaccount.position_quantums(perpetual_id);
            if quantums == 0 || &subaccount.id == liquidated {
                continue;
            }
            let notional = self.perpetuals.get_net_notional(store, perpetual_id, quantums)?;
            let risk = self
                .subaccounts
                .get_net_collateral_and_margin_requirements(store, &subaccount.id)?;
            candidates.push(OffsettingCandidate::new(subaccount.id, quantums, notional, &risk));
        }
        let ranked = rank_offsetting_candidates(candidates, liquidated, position);
        Ok(allocate_offsetting_fills(&ranked, quantums, &self.config.deleveraging)
            .into_iter()
            .map(|(offsetting_subaccount_id, fill_amount)| DeleveragingFill {
                offsetting_subaccount_id,
                fill_amount,
            })
            .collect())
    }

    // 8.7.2: local deleveraging inside a liquidation. returns the match to
    // propose, or None when nothing could be offset.
    pub(super) fn deleverage_locally(
        &self,
        store: &mut dyn KvStore,
        liquidated: &SubaccountId,
        perpetual_id: PerpetualId,
        quantums: u64,
    ) -> Result<Option<MatchPerpetualDeleveraging>, ClobError> {
        let fills = self.offsetting_fills(store, liquidated, perpetual_id, quantums)?;
        if fills.is_empty() {
            warn!(%liquidated, %perpetual_id, quantums, "no offsetting positions");
            return Ok(None);
        }
        let deleveraging = MatchPerpetualDeleveraging {
            liquidated: liquidated.clone(),
            perpetual_id,
            fills,
        };
        let mut branch = CacheStore::new(store);
        match self.apply_deleveraging(&mut branch, &mut PendingEvents::new(), OPERATIONS_TX_INDEX, &deleveraging) {
            Ok(_) => {
                branch.commit();
                Ok(Some(deleveraging))
            }
            Err(err) => {
                warn!(%liquidated, error = %err, "local deleveraging failed");
                Ok(None)
            }
        }
    }
}
