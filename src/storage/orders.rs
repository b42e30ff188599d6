//! Contract events, orders and settlement records.
//!
//! Every state change here is a conditional UPDATE so that two callers
//! racing on the same deposit or order cannot both succeed.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, warn};

use super::{Page, Store, StoreResult};
use crate::types::{
    AppError, ContractEvent, ContractEventKind, NewDeposit, NewOrder, Order, OrderStatus,
    SettlementNotice, SettlementRecord,
};

/// Result of delivering a settlement notice.
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Applied(Order),
    /// Already recorded; the order is returned unchanged.
    Duplicate(Order),
}

impl SettlementOutcome {
    pub fn order(&self) -> &Order {
        match self {
            SettlementOutcome::Applied(o) | SettlementOutcome::Duplicate(o) => o,
        }
    }
}

/// Error describing why a deposit is not available for use.
pub fn deposit_unavailable(contract_order_id: &str, deposit: Option<&ContractEvent>) -> AppError {
    match deposit {
        None => AppError::NotFound(format!("deposit {contract_order_id} not found")),
        Some(d) if d.is_refunded() => {
            AppError::Conflict(format!("deposit {contract_order_id} already refunded"))
        }
        Some(d) if d.processed => {
            AppError::Conflict(format!("deposit {contract_order_id} already processed"))
        }
        Some(_) => AppError::Conflict(format!("deposit {contract_order_id} changed concurrently")),
    }
}

impl Store {
    // -- Contract events -------------------------------------------------

    /// Persist a decoded escrow log. Returns false when it was already known.
    pub async fn record_contract_event(
        &self,
        kind: ContractEventKind,
        ev: &NewDeposit,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            "INSERT INTO contract_events (tx_hash, block_number, event_type, contract_order_id, \
                 user_wallet, deposit_amount, fund_currency, processed, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&ev.tx_hash)
        .bind(ev.block_number)
        .bind(kind)
        .bind(&ev.contract_order_id)
        .bind(&ev.user_wallet)
        .bind(ev.deposit_amount)
        .bind(&ev.fund_currency)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let inserted = res.rows_affected() == 1;
        if !inserted {
            debug!(tx_hash = %ev.tx_hash, kind = %kind, "Contract event already recorded");
        }
        Ok(inserted)
    }

    pub async fn insert_deposit(&self, ev: &NewDeposit) -> StoreResult<bool> {
        self.record_contract_event(ContractEventKind::DepositSuccess, ev).await
    }

    pub async fn find_deposit(&self, contract_order_id: &str) -> StoreResult<Option<ContractEvent>> {
        let row = sqlx::query_as::<_, ContractEvent>(
            "SELECT * FROM contract_events WHERE contract_order_id = ? AND event_type = ?",
        )
        .bind(contract_order_id)
        .bind(ContractEventKind::DepositSuccess)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Deposit that is neither processed nor refunded, or the reason it is not.
    pub async fn usable_deposit(&self, contract_order_id: &str) -> StoreResult<ContractEvent> {
        match self.find_deposit(contract_order_id).await? {
            Some(d) if !d.processed && !d.is_refunded() => Ok(d),
            other => Err(deposit_unavailable(contract_order_id, other.as_ref())),
        }
    }

    /// Mark an unused deposit refunded.
    pub async fn mark_deposit_refunded(
        &self,
        contract_order_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE contract_events SET refunded_at = ? \
             WHERE contract_order_id = ? AND event_type = ? AND processed = 0 AND refunded_at IS NULL",
        )
        .bind(at)
        .bind(contract_order_id)
        .bind(ContractEventKind::DepositSuccess)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            let current = self.find_deposit(contract_order_id).await?;
            return Err(deposit_unavailable(contract_order_id, current.as_ref()));
        }
        Ok(())
    }

    // -- Orders ----------------------------------------------------------

    /// Consume the deposit and create its order atomically.
    pub async fn create_order_for_deposit(&self, o: &NewOrder) -> StoreResult<Order> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE contract_events SET processed = 1 \
             WHERE contract_order_id = ? AND event_type = ? AND processed = 0 AND refunded_at IS NULL",
        )
        .bind(&o.order_uuid)
        .bind(ContractEventKind::DepositSuccess)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            let current = self.find_deposit(&o.order_uuid).await?;
            return Err(deposit_unavailable(&o.order_uuid, current.as_ref()));
        }

        let now = Utc::now();
        let order = sqlx::query_as::<_, Order>(
            "INSERT INTO orders (order_uuid, user_wallet, event_id, platform_id, platform_order_id, \
                 bet_option, bet_amount, fund_currency, locked_odds, expected_profit, actual_profit, \
                 status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?) \
             RETURNING *",
        )
        .bind(&o.order_uuid)
        .bind(&o.user_wallet)
        .bind(o.event_id)
        .bind(o.platform_id)
        .bind(&o.platform_order_id)
        .bind(&o.bet_option)
        .bind(o.bet_amount)
        .bind(&o.fund_currency)
        .bind(o.locked_odds)
        .bind(o.expected_profit)
        .bind(OrderStatus::Placed)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(order)
    }

    pub async fn get_order(&self, order_uuid: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_uuid = ?")
            .bind(order_uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// A wallet's orders, newest first, with the total count.
    pub async fn list_orders_by_wallet(
        &self,
        wallet: &str,
        status: Option<OrderStatus>,
        page: Page,
    ) -> StoreResult<(Vec<Order>, i64)> {
        let mut count: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM orders WHERE lower(user_wallet) = lower(");
        count.push_bind(wallet.to_string()).push(")");
        if let Some(s) = status {
            count.push(" AND status = ").push_bind(s);
        }
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM orders WHERE lower(user_wallet) = lower(");
        qb.push_bind(wallet.to_string()).push(")");
        if let Some(s) = status {
            qb.push(" AND status = ").push_bind(s);
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows = qb.build_query_as::<Order>().fetch_all(&self.pool).await?;
        Ok((rows, total))
    }

    /// Move an order from any of `from` to `to`. False if it was not in `from`.
    pub async fn transition_order(
        &self,
        order_uuid: &str,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> StoreResult<bool> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE orders SET status = ");
        qb.push_bind(to)
            .push(", updated_at = ")
            .push_bind(Utc::now())
            .push(" WHERE order_uuid = ")
            .push_bind(order_uuid.to_string())
            .push(" AND status IN (");
        let mut sep = qb.separated(", ");
        for s in from {
            sep.push_bind(*s);
        }
        sep.push_unseparated(")");
        let res = qb.build().execute(&self.pool).await?;
        Ok(res.rows_affected() == 1)
    }

    /// Placed orders on `event_id` that bet on `result` become settlable.
    pub async fn mark_winning_orders_settlable(&self, event_id: i64, result: &str) -> StoreResult<u64> {
        let res = sqlx::query(
            "UPDATE orders SET status = ?, updated_at = ? \
             WHERE event_id = ? AND status = ? AND lower(bet_option) = lower(?)",
        )
        .bind(OrderStatus::Settlable)
        .bind(Utc::now())
        .bind(event_id)
        .bind(OrderStatus::Placed)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    // -- Settlements -----------------------------------------------------

    /// Settle an order and record its payout, once per order and per tx.
    pub async fn apply_settlement(&self, n: &SettlementNotice) -> StoreResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_uuid = ?")
            .bind(&n.order_uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {} not found", n.order_uuid)))?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT tx_hash FROM settlement_records WHERE tx_hash = ? OR order_uuid = ?",
        )
        .bind(&n.tx_hash)
        .bind(&n.order_uuid)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((recorded_tx,)) = existing {
            tx.rollback().await?;
            if recorded_tx != n.tx_hash {
                warn!(
                    order_uuid = %n.order_uuid,
                    recorded = %recorded_tx,
                    received = %n.tx_hash,
                    "Order already settled by another transaction"
                );
            }
            return Ok(SettlementOutcome::Duplicate(order));
        }

        if !order.status.accepts_settlement() {
            tx.rollback().await?;
            return Err(AppError::Conflict(format!(
                "order {} cannot settle from status {}",
                n.order_uuid, order.status
            )));
        }

        let now = Utc::now();
        let updated = sqlx::query_as::<_, Order>(
            "UPDATE orders SET status = ?, settlement_tx_hash = ?, actual_profit = ?, updated_at = ? \
             WHERE order_uuid = ? RETURNING *",
        )
        .bind(OrderStatus::Settled)
        .bind(&n.tx_hash)
        .bind(n.settlement_amount - order.bet_amount)
        .bind(now)
        .bind(&n.order_uuid)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO settlement_records (tx_hash, order_uuid, settlement_amount, manage_fee, gas_fee, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&n.tx_hash)
        .bind(&n.order_uuid)
        .bind(n.settlement_amount)
        .bind(n.manage_fee)
        .bind(n.gas_fee)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SettlementOutcome::Applied(updated))
    }

    pub async fn settlement_records_for(&self, order_uuid: &str) -> StoreResult<Vec<SettlementRecord>> {
        let rows = sqlx::query_as::<_, SettlementRecord>(
            "SELECT * FROM settlement_records WHERE order_uuid = ? ORDER BY id",
        )
        .bind(order_uuid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
