//! Order lifecycle: deposit, quote, place, settle, withdraw.
//!
//! An on-chain deposit is the only way into the lifecycle. The deposit
//! row is consumed exactly once, either by placing an order (in the same
//! transaction that creates the order) or by a refund; the store's
//! conditional updates make the two mutually exclusive.
//!
//! ```text
//! deposited --prepare--> quoted --place--> placed --result--> settlable
//!     |                                      |                   |
//!     +--unfreeze--> refunded                +----settlement-----+--> settled
//!                                                                      |
//!                            withdraw_requested (on-chain) / withdrawn (fiat)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::router::{Router, Selection};
use super::venue_error;
use crate::chain::escrow::FundsReleaser;
use crate::chain::listener::ChainEventSink;
use crate::chain::signature::verify_signer;
use crate::chain::{amount_to_units, bet_id, normalize_order_id, parse_address, DEPOSIT_CURRENCY};
use crate::fiat::FiatConverter;
use crate::platforms::{PlaceOrderRequest, VenueRegistry};
use crate::storage::{SettlementOutcome, Store};
use crate::types::{
    expected_profit, AppError, ContractEventKind, NewDeposit, NewOrder, Order, OrderStatus,
    SettlementNotice, AMOUNT_TOLERANCE, PLATFORM_KALSHI,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Lifetime of a signed order intent.
pub const QUOTE_TTL_SECS: i64 = 300;

pub const MIN_LOCKED_ODDS: f64 = 0.01;
pub const MAX_LOCKED_ODDS: f64 = 0.99;

/// Fee on positive profit for orders paid out in fiat.
pub const FIAT_PAYOUT_FEE_RATE: f64 = 0.01;

const INTENT_PREFIX: &str = "PlaceOrder";

/// Price offered to the user for signing.
pub fn lock_odds(price: f64) -> f64 {
    price.clamp(MIN_LOCKED_ODDS, MAX_LOCKED_ODDS)
}

// ---------------------------------------------------------------------------
// Signed intent
// ---------------------------------------------------------------------------

/// Fields of a `PlaceOrder:{id}:{event}:{option}:{odds}:{expires}` message.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedIntent {
    pub contract_order_id: String,
    pub event_id: String,
    pub bet_option: String,
    pub locked_odds: f64,
    /// Unix seconds.
    pub expires_at: i64,
}

impl SignedIntent {
    pub fn message(&self) -> String {
        format!(
            "{INTENT_PREFIX}:{}:{}:{}:{:.6}:{}",
            self.contract_order_id, self.event_id, self.bet_option, self.locked_odds, self.expires_at
        )
    }

    /// Parse a message. The trailing numeric fields are split from the
    /// right so an option label may itself contain `:`.
    pub fn parse(message: &str) -> Result<Self, AppError> {
        let malformed = || AppError::InvalidInput("malformed message_to_sign".into());
        let mut tail = message.trim().rsplitn(3, ':');
        let expires_at = tail.next().and_then(|s| s.parse::<i64>().ok()).ok_or_else(malformed)?;
        let locked_odds = tail.next().and_then(|s| s.parse::<f64>().ok()).ok_or_else(malformed)?;
        let head = tail.next().ok_or_else(malformed)?;

        let mut parts = head.splitn(4, ':');
        if parts.next() != Some(INTENT_PREFIX) {
            return Err(malformed());
        }
        let contract_order_id = parts.next().ok_or_else(malformed)?.to_string();
        let event_id = parts.next().ok_or_else(malformed)?.to_string();
        let bet_option = parts.next().ok_or_else(malformed)?.to_string();
        Ok(Self {
            contract_order_id,
            event_id,
            bet_option,
            locked_odds,
            expires_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PrepareRequest {
    pub contract_order_id: String,
    /// Event uuid or numeric canonical id.
    pub event_uuid: String,
    pub bet_option: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreparedOrder {
    pub contract_order_id: String,
    pub event_uuid: String,
    pub bet_option: String,
    pub platform_id: i64,
    pub option_name: String,
    pub best_price: f64,
    pub locked_odds: f64,
    pub message_to_sign: String,
    /// Milliseconds; the signed message carries seconds.
    #[serde(rename = "expires_at")]
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceRequest {
    pub contract_order_id: String,
    pub event_uuid: String,
    pub bet_option: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub locked_odds: f64,
    #[serde(default)]
    pub message_to_sign: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub order_uuid: String,
    pub platform_order_id: String,
    pub platform_id: i64,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnfreezeRequest {
    pub contract_order_id: String,
    #[serde(default)]
    pub wallet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnfreezeReceipt {
    pub contract_order_id: String,
    pub tx_hash: String,
    /// Milliseconds.
    pub refunded_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawMethod {
    /// Paid out by an external fiat service; no chain action from the user.
    FiatPayout,
    /// The user submits the described call on chain.
    Onchain,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawInfo {
    pub order_uuid: String,
    pub platform_id: i64,
    pub method: WithdrawMethod,
    pub currency: String,
    pub bet_amount: f64,
    pub actual_profit: f64,
    pub payout: f64,
    pub fee: f64,
    pub user_amount: f64,
    pub bet_id: Option<String>,
    pub to: Option<String>,
    pub amount_units: Option<String>,
    pub contract: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawOutcome {
    #[serde(flatten)]
    pub info: WithdrawInfo,
    pub status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OrderCoordinator {
    store: Store,
    router: Router,
    registry: VenueRegistry,
    fiat: Arc<dyn FiatConverter>,
    releaser: Option<Arc<dyn FundsReleaser>>,
    settlement_contract: Option<String>,
    cancel: CancellationToken,
}

impl OrderCoordinator {
    pub fn new(store: Store, registry: VenueRegistry, fiat: Arc<dyn FiatConverter>) -> Self {
        Self {
            router: Router::new(store.clone(), registry.clone()),
            store,
            registry,
            fiat,
            releaser: None,
            settlement_contract: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_releaser(mut self, releaser: Arc<dyn FundsReleaser>) -> Self {
        self.releaser = Some(releaser);
        self
    }

    pub fn with_settlement_contract(mut self, address: Option<String>) -> Self {
        self.settlement_contract = address.filter(|a| !a.trim().is_empty());
        self
    }

    /// Parent token for receipt polling during refunds.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    // -- Deposits ----------------------------------------------------------

    /// Record a `FundsLocked` observation. Returns false for a replay.
    pub async fn save_deposit(&self, deposit: &NewDeposit) -> Result<bool, AppError> {
        if deposit.tx_hash.trim().is_empty() || deposit.user_wallet.trim().is_empty() {
            return Err(AppError::InvalidInput("deposit requires tx_hash and user_wallet".into()));
        }
        if !deposit.deposit_amount.is_finite() || deposit.deposit_amount < 0.0 {
            return Err(AppError::InvalidInput(format!(
                "invalid deposit amount {}",
                deposit.deposit_amount
            )));
        }
        let normalized = NewDeposit {
            contract_order_id: normalize_order_id(&deposit.contract_order_id)?,
            ..deposit.clone()
        };
        let inserted = self.store.insert_deposit(&normalized).await?;
        if inserted {
            info!(
                contract_order_id = %normalized.contract_order_id,
                wallet = %normalized.user_wallet,
                amount = normalized.deposit_amount,
                tx_hash = %normalized.tx_hash,
                "Deposit recorded"
            );
        } else {
            debug!(tx_hash = %normalized.tx_hash, "Duplicate deposit log ignored");
        }
        Ok(inserted)
    }

    // -- Quote and place ---------------------------------------------------

    /// Quote the best live price and produce the message the user signs.
    pub async fn prepare(&self, req: &PrepareRequest) -> Result<PreparedOrder, AppError> {
        let coid = normalize_order_id(&req.contract_order_id)?;
        let bet_option = required("bet_option", &req.bet_option)?;
        let event_id = required("event_uuid", &req.event_uuid)?;
        self.store.usable_deposit(&coid).await?;

        let route = self.router.quote(event_id, bet_option).await?;
        let Selection {
            platform_id,
            price,
            option_name,
        } = route.selection;
        let now = Utc::now();
        let intent = SignedIntent {
            contract_order_id: coid.clone(),
            event_id: event_id.to_string(),
            bet_option: bet_option.to_string(),
            locked_odds: lock_odds(price),
            expires_at: now.timestamp() + QUOTE_TTL_SECS,
        };
        debug!(contract_order_id = %coid, platform_id, price, "Order prepared");
        Ok(PreparedOrder {
            contract_order_id: coid,
            event_uuid: event_id.to_string(),
            bet_option: bet_option.to_string(),
            platform_id,
            option_name,
            best_price: price,
            locked_odds: intent.locked_odds,
            message_to_sign: intent.message(),
            expires_at_ms: intent.expires_at * 1000,
        })
    }

    /// Place the deposit's bet on the best venue and create its order.
    pub async fn place(&self, req: &PlaceRequest) -> Result<PlacedOrder, AppError> {
        let coid = normalize_order_id(&req.contract_order_id)?;
        let bet_option = required("bet_option", &req.bet_option)?;
        let event_id = required("event_uuid", &req.event_uuid)?;
        let deposit = self.store.usable_deposit(&coid).await?;

        if !req.signature.trim().is_empty() {
            self.verify_intent(&coid, event_id, bet_option, req, &deposit.user_wallet)?;
        }
        if req.amount > 0.0 && (req.amount - deposit.deposit_amount).abs() > AMOUNT_TOLERANCE {
            return Err(AppError::InvalidInput(format!(
                "amount {} does not match deposit {}",
                req.amount, deposit.deposit_amount
            )));
        }

        let route = self.router.quote(event_id, bet_option).await?;
        let selection = &route.selection;
        let adapter = self.registry.get(selection.platform_id).ok_or_else(|| {
            AppError::Internal(format!("no adapter for platform {}", selection.platform_id))
        })?;
        let trading = adapter
            .trading()
            .ok_or_else(|| AppError::venue(adapter.name(), "order entry is not supported"))?;

        let venue_amount = if selection.platform_id == PLATFORM_KALSHI {
            self.fiat
                .to_usd(deposit.deposit_amount, &deposit.fund_currency)
                .await?
        } else {
            deposit.deposit_amount
        };

        let order_req = PlaceOrderRequest {
            platform_event_id: route.target.platform_event_id.clone(),
            bet_option: selection.option_name.clone(),
            amount: venue_amount,
            locked_odds: lock_odds(selection.price),
            client_order_id: coid.clone(),
        };
        let receipt = trading
            .place_order(&order_req)
            .await
            .map_err(|e| venue_error(adapter.name(), e))?;
        info!(
            contract_order_id = %coid,
            platform = adapter.name(),
            platform_order_id = %receipt.platform_order_id,
            ticker = %order_req.platform_event_id,
            option = %order_req.bet_option,
            amount = venue_amount,
            "Venue accepted order"
        );

        let new_order = NewOrder {
            order_uuid: coid.clone(),
            user_wallet: deposit.user_wallet.clone(),
            event_id: route.target.id,
            platform_id: selection.platform_id,
            platform_order_id: receipt.platform_order_id.clone(),
            bet_option: selection.option_name.clone(),
            bet_amount: deposit.deposit_amount,
            fund_currency: deposit.fund_currency.clone(),
            locked_odds: selection.price,
            expected_profit: expected_profit(deposit.deposit_amount, selection.price),
        };
        let order = self.store.create_order_for_deposit(&new_order).await.map_err(|e| {
            error!(
                contract_order_id = %coid,
                platform_order_id = %receipt.platform_order_id,
                error = %e,
                "Venue order placed but not recorded"
            );
            e
        })?;

        Ok(PlacedOrder {
            order_uuid: order.order_uuid,
            platform_order_id: order.platform_order_id,
            platform_id: order.platform_id,
            status: order.status,
        })
    }

    fn verify_intent(
        &self,
        coid: &str,
        event_id: &str,
        bet_option: &str,
        req: &PlaceRequest,
        wallet: &str,
    ) -> Result<(), AppError> {
        if req.message_to_sign.trim().is_empty() {
            return Err(AppError::InvalidInput("message_to_sign is required with a signature".into()));
        }
        let intent = SignedIntent::parse(&req.message_to_sign)?;
        let same_order = normalize_order_id(&intent.contract_order_id).ok().as_deref() == Some(coid)
            && intent.event_id == event_id
            && intent.bet_option.eq_ignore_ascii_case(bet_option);
        if !same_order {
            return Err(AppError::InvalidInput("signed message does not match the order".into()));
        }
        if intent.expires_at < Utc::now().timestamp() {
            return Err(AppError::InvalidInput("signed order has expired".into()));
        }
        verify_signer(&req.message_to_sign, &req.signature, wallet)
    }

    // -- Refund --------------------------------------------------------------

    /// Release an unused deposit back to its owner on chain.
    pub async fn unfreeze(&self, req: &UnfreezeRequest) -> Result<UnfreezeReceipt, AppError> {
        let coid = normalize_order_id(&req.contract_order_id)?;
        let deposit = self.store.usable_deposit(&coid).await?;
        if let Some(wallet) = req.wallet.as_deref().map(str::trim).filter(|w| !w.is_empty()) {
            if !wallet.eq_ignore_ascii_case(deposit.user_wallet.trim()) {
                return Err(AppError::InvalidInput(format!(
                    "wallet {wallet} does not own deposit {coid}"
                )));
            }
        }
        let releaser = self
            .releaser
            .as_ref()
            .ok_or_else(|| AppError::Internal("chain executor is not configured".into()))?;

        let amount = amount_to_units(deposit.deposit_amount)?;
        let tx_hash = releaser
            .release_funds(
                bet_id(&coid)?,
                parse_address(&deposit.user_wallet)?,
                amount,
                self.cancel.child_token(),
            )
            .await?;

        let refunded_at = Utc::now();
        self.store
            .mark_deposit_refunded(&coid, refunded_at)
            .await
            .map_err(|e| {
                error!(contract_order_id = %coid, tx_hash = %tx_hash, error = %e, "Funds released but refund not recorded");
                e
            })?;
        info!(contract_order_id = %coid, tx_hash = %tx_hash, units = %amount, "Deposit refunded");
        Ok(UnfreezeReceipt {
            contract_order_id: coid,
            tx_hash,
            refunded_at: refunded_at.timestamp_millis(),
        })
    }

    // -- Settlement ----------------------------------------------------------

    pub async fn on_settlement_completed(
        &self,
        notice: &SettlementNotice,
    ) -> Result<SettlementOutcome, AppError> {
        let notice = SettlementNotice {
            order_uuid: normalize_order_id(&notice.order_uuid)?,
            ..notice.clone()
        };
        let outcome = self.store.apply_settlement(&notice).await?;
        match &outcome {
            SettlementOutcome::Applied(order) => info!(
                order_uuid = %order.order_uuid,
                tx_hash = %notice.tx_hash,
                payout = notice.settlement_amount,
                profit = order.actual_profit,
                "Order settled"
            ),
            SettlementOutcome::Duplicate(_) => {
                debug!(order_uuid = %notice.order_uuid, tx_hash = %notice.tx_hash, "Duplicate settlement ignored")
            }
        }
        Ok(outcome)
    }

    // -- Withdraw ------------------------------------------------------------

    pub async fn get_withdraw_info(&self, order_uuid: &str) -> Result<WithdrawInfo, AppError> {
        let order = self.settled_order(order_uuid).await?;
        self.describe_withdraw(&order)
    }

    /// Start the payout of a settled order.
    pub async fn request_withdraw(&self, order_uuid: &str) -> Result<WithdrawOutcome, AppError> {
        let order = self.settled_order(order_uuid).await?;
        let info = self.describe_withdraw(&order)?;
        let next = match info.method {
            WithdrawMethod::FiatPayout => OrderStatus::Withdrawn,
            WithdrawMethod::Onchain => OrderStatus::WithdrawRequested,
        };
        if !self
            .store
            .transition_order(&order.order_uuid, &[OrderStatus::Settled], next)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "order {} changed while requesting withdraw",
                order.order_uuid
            )));
        }
        info!(order_uuid = %order.order_uuid, status = %next, user_amount = info.user_amount, "Withdraw requested");
        Ok(WithdrawOutcome { info, status: next })
    }

    async fn settled_order(&self, order_uuid: &str) -> Result<Order, AppError> {
        let uuid = normalize_order_id(order_uuid)?;
        let order = self
            .store
            .get_order(&uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {uuid} not found")))?;
        if order.status != OrderStatus::Settled {
            return Err(AppError::InvalidInput(format!(
                "order {uuid} is {}, withdraw requires settled",
                order.status
            )));
        }
        Ok(order)
    }

    fn describe_withdraw(&self, order: &Order) -> Result<WithdrawInfo, AppError> {
        let payout = (order.bet_amount + order.actual_profit).max(0.0);
        let mut info = WithdrawInfo {
            order_uuid: order.order_uuid.clone(),
            platform_id: order.platform_id,
            method: WithdrawMethod::Onchain,
            currency: order.fund_currency.clone(),
            bet_amount: order.bet_amount,
            actual_profit: order.actual_profit,
            payout,
            fee: 0.0,
            user_amount: payout,
            bet_id: None,
            to: None,
            amount_units: None,
            contract: None,
        };
        if order.platform_id == PLATFORM_KALSHI {
            info.method = WithdrawMethod::FiatPayout;
            info.fee = order.actual_profit.max(0.0) * FIAT_PAYOUT_FEE_RATE;
            info.user_amount = payout - info.fee;
        } else {
            info.bet_id = Some(format!("0x{}", order.order_uuid));
            info.to = Some(order.user_wallet.clone());
            info.amount_units = Some(amount_to_units(info.user_amount)?.to_string());
            info.contract = self.settlement_contract.clone();
        }
        Ok(info)
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput(format!("{field} is required")));
    }
    Ok(trimmed)
}

#[async_trait]
impl ChainEventSink for OrderCoordinator {
    async fn on_deposit(&self, deposit: NewDeposit) -> Result<(), AppError> {
        self.save_deposit(&deposit).await.map(|_| ())
    }

    async fn on_settlement(&self, notice: SettlementNotice, block_number: i64) -> Result<(), AppError> {
        let log = NewDeposit {
            tx_hash: notice.tx_hash.clone(),
            block_number,
            contract_order_id: notice.order_uuid.clone(),
            user_wallet: String::new(),
            deposit_amount: notice.settlement_amount,
            fund_currency: DEPOSIT_CURRENCY.to_string(),
        };
        self.store
            .record_contract_event(ContractEventKind::Settled, &log)
            .await?;
        self.on_settlement_completed(&notice).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::escrow::MockFundsReleaser;
    use crate::engine::aggregator::Aggregator;
    use crate::fiat::StablecoinParity;
    use crate::platforms::convert::to_event_record;
    use crate::platforms::{
        BatchSink, PlaceOrderReceipt, StreamStats, TradingVenue, VenueAdapter,
    };
    use crate::types::{EventResult, NewOdds, OptionType, RawEvent, RawMarket, PLATFORM_POLYMARKET};
    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;
    use anyhow::{anyhow, Result};
    use std::sync::Mutex;

    const COID: &str = "ab00000000000000000000000000000000000000000000000000000000000001";

    struct FixedVenue {
        id: i64,
        name: &'static str,
        yes: f64,
        live_fails: bool,
        place_fails: bool,
        placed: Mutex<Vec<PlaceOrderRequest>>,
    }

    impl FixedVenue {
        fn new(id: i64, name: &'static str, yes: f64) -> Self {
            Self {
                id,
                name,
                yes,
                live_fails: false,
                place_fails: false,
                placed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VenueAdapter for FixedVenue {
        fn name(&self) -> &str {
            self.name
        }

        fn platform_id(&self) -> i64 {
            self.id
        }

        async fn fetch_events_stream(&self, _t: &str, _sink: &mut dyn BatchSink) -> Result<StreamStats> {
            Ok(StreamStats::default())
        }

        async fn fetch_live_odds(&self, id: &str) -> Result<Vec<NewOdds>> {
            if self.live_fails {
                return Err(anyhow!("HTTP 503"));
            }
            Ok(vec![
                NewOdds::new(self.id, id, "YES", OptionType::Win, self.yes),
                NewOdds::new(self.id, id, "NO", OptionType::Lose, 1.0 - self.yes),
            ])
        }

        async fn fetch_event_result(&self, _id: &str) -> Result<Option<EventResult>> {
            Ok(None)
        }

        fn trading(&self) -> Option<&dyn TradingVenue> {
            Some(self)
        }
    }

    #[async_trait]
    impl TradingVenue for FixedVenue {
        async fn place_order(&self, req: &PlaceOrderRequest) -> Result<PlaceOrderReceipt> {
            if self.place_fails {
                return Err(anyhow!("HTTP 400: insufficient liquidity"));
            }
            let mut placed = self.placed.lock().unwrap();
            placed.push(req.clone());
            Ok(PlaceOrderReceipt {
                platform_order_id: format!("{}-{}", self.name, placed.len()),
                status: "resting".into(),
            })
        }
    }

    struct Fixture {
        store: Store,
        poly: Arc<FixedVenue>,
        kalshi: Arc<FixedVenue>,
        wallet: PrivateKeySigner,
    }

    fn raw(id: &str, title: &str) -> RawEvent {
        RawEvent {
            platform_event_id: id.into(),
            title: title.into(),
            event_type: "sports".into(),
            start_time: Some("2026-07-01T19:00:00Z".into()),
            status: "open".into(),
            markets: vec![RawMarket {
                market_id: id.into(),
                outcomes: vec!["YES".into(), "NO".into()],
                prices: vec![0.5, 0.5],
            }],
            ..Default::default()
        }
    }

    async fn fixture(poly: FixedVenue, kalshi: FixedVenue) -> (Fixture, OrderCoordinator) {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_event_records(&[
                to_event_record(PLATFORM_POLYMARKET, &raw("p1", "Lakers vs Celtics")),
                to_event_record(PLATFORM_KALSHI, &raw("K1", "lakers vs celtics")),
            ])
            .await
            .unwrap();
        Aggregator::new(store.clone()).run("sports", None).await.unwrap();

        let poly = Arc::new(poly);
        let kalshi = Arc::new(kalshi);
        let mut registry = VenueRegistry::new();
        registry.insert(poly.clone());
        registry.insert(kalshi.clone());
        let coordinator = OrderCoordinator::new(store.clone(), registry, Arc::new(StablecoinParity))
            .with_settlement_contract(Some("0x00000000000000000000000000000000000000e6".into()));
        let fx = Fixture {
            store,
            poly,
            kalshi,
            wallet: PrivateKeySigner::random(),
        };
        (fx, coordinator)
    }

    fn deposit(fx: &Fixture, amount: f64, currency: &str) -> NewDeposit {
        NewDeposit {
            tx_hash: "0xdep".into(),
            block_number: 1,
            contract_order_id: format!("0x{COID}"),
            user_wallet: fx.wallet.address().to_string(),
            deposit_amount: amount,
            fund_currency: currency.into(),
        }
    }

    fn place_req(option: &str) -> PlaceRequest {
        PlaceRequest {
            contract_order_id: COID.into(),
            event_uuid: "1_p1".into(),
            bet_option: option.into(),
            ..Default::default()
        }
    }

    fn signed(fx: &Fixture, message: &str) -> String {
        let sig = fx.wallet.sign_message_sync(message.as_bytes()).unwrap();
        format!("0x{}", hex::encode(sig.as_bytes()))
    }

    // -- intent tests --

    #[test]
    fn test_intent_message_roundtrip_with_colon_in_option() {
        let intent = SignedIntent {
            contract_order_id: COID.into(),
            event_id: "2_KX-1".into(),
            bet_option: "Over 2:30".into(),
            locked_odds: 0.99,
            expires_at: 1_780_000_000,
        };
        let msg = intent.message();
        assert_eq!(msg, format!("PlaceOrder:{COID}:2_KX-1:Over 2:30:0.990000:1780000000"));
        assert_eq!(SignedIntent::parse(&msg).unwrap(), intent);
        assert!(SignedIntent::parse("Order:a:b:c:0.5:1").is_err());
        assert!(SignedIntent::parse("PlaceOrder:a:b").is_err());
    }

    #[test]
    fn test_lock_odds_clamps() {
        assert_eq!(lock_odds(0.0), 0.01);
        assert_eq!(lock_odds(1.0), 0.99);
        assert_eq!(lock_odds(0.62), 0.62);
    }

    // -- prepare tests --

    #[tokio::test]
    async fn test_prepare_quotes_best_venue_and_clamps() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.55), FixedVenue::new(2, "kalshi", 1.0)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();

        let prepared = c
            .prepare(&PrepareRequest {
                contract_order_id: COID.into(),
                event_uuid: "1_p1".into(),
                bet_option: "YES".into(),
            })
            .await
            .unwrap();
        assert_eq!(prepared.platform_id, 2);
        assert_eq!(prepared.best_price, 1.0);
        assert_eq!(prepared.locked_odds, 0.99);
        let intent = SignedIntent::parse(&prepared.message_to_sign).unwrap();
        assert_eq!(intent.locked_odds, 0.99);
        assert_eq!(intent.expires_at * 1000, prepared.expires_at_ms);
        assert!(prepared.message_to_sign.starts_with(&format!("PlaceOrder:{COID}:1_p1:YES:0.990000:")));
    }

    #[tokio::test]
    async fn test_prepare_without_deposit_is_not_found() {
        let (_fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.5)).await;
        let err = c
            .prepare(&PrepareRequest {
                contract_order_id: COID.into(),
                event_uuid: "1_p1".into(),
                bet_option: "YES".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    // -- place tests --

    #[tokio::test]
    async fn test_place_routes_to_best_venue() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.55), FixedVenue::new(2, "kalshi", 0.62)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDT")).await.unwrap();

        let placed = c.place(&place_req("YES")).await.unwrap();
        assert_eq!(placed.platform_id, 2);
        assert_eq!(placed.order_uuid, COID);
        assert_eq!(placed.status, OrderStatus::Placed);

        let sent = fx.kalshi.placed.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].platform_event_id, "K1");
        assert_eq!(sent[0].amount, 10.0);
        assert!(fx.poly.placed.lock().unwrap().is_empty());

        let order = fx.store.get_order(COID).await.unwrap().unwrap();
        assert_eq!(order.bet_amount, 10.0);
        assert_eq!(order.fund_currency, "USDT");
        assert!((order.locked_odds - 0.62).abs() < 1e-9);
        assert!(fx.store.find_deposit(COID).await.unwrap().unwrap().processed);

        // Live prices were written back.
        let k1 = fx.store.get_event_by_uuid("2_K1").await.unwrap().unwrap();
        let odds = fx.store.odds_for_event(k1.id).await.unwrap();
        assert!(odds.iter().any(|o| (o.price - 0.62).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_place_with_valid_signature() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.7), FixedVenue::new(2, "kalshi", 0.4)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        let prepared = c
            .prepare(&PrepareRequest {
                contract_order_id: COID.into(),
                event_uuid: "1_p1".into(),
                bet_option: "YES".into(),
            })
            .await
            .unwrap();

        let mut req = place_req("YES");
        req.amount = 10.005;
        req.signature = signed(&fx, &prepared.message_to_sign);
        req.message_to_sign = prepared.message_to_sign;
        let placed = c.place(&req).await.unwrap();
        assert_eq!(placed.platform_id, 1);
        assert_eq!(placed.platform_order_id, "polymarket-1");
    }

    #[tokio::test]
    async fn test_place_rejects_expired_foreign_or_mismatched_intents() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.7), FixedVenue::new(2, "kalshi", 0.4)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();

        let expired = SignedIntent {
            contract_order_id: COID.into(),
            event_id: "1_p1".into(),
            bet_option: "YES".into(),
            locked_odds: 0.7,
            expires_at: Utc::now().timestamp() - 1,
        }
        .message();
        let mut req = place_req("YES");
        req.signature = signed(&fx, &expired);
        req.message_to_sign = expired;
        let err = c.place(&req).await.unwrap_err();
        assert!(err.to_string().contains("expired"));

        let fresh = SignedIntent {
            contract_order_id: COID.into(),
            event_id: "1_p1".into(),
            bet_option: "YES".into(),
            locked_odds: 0.7,
            expires_at: Utc::now().timestamp() + 60,
        }
        .message();
        let stranger = PrivateKeySigner::random();
        let mut req = place_req("YES");
        req.signature = format!("0x{}", hex::encode(stranger.sign_message_sync(fresh.as_bytes()).unwrap().as_bytes()));
        req.message_to_sign = fresh.clone();
        assert!(matches!(c.place(&req).await, Err(AppError::InvalidInput(_))));

        let mut req = place_req("NO");
        req.signature = signed(&fx, &fresh);
        req.message_to_sign = fresh;
        let err = c.place(&req).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));

        assert!(fx.poly.placed.lock().unwrap().is_empty());
        assert!(!fx.store.find_deposit(COID).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_place_rejects_amount_mismatch() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.7), FixedVenue::new(2, "kalshi", 0.4)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        let mut req = place_req("YES");
        req.amount = 10.5;
        assert!(matches!(c.place(&req).await, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_venue_failure_leaves_no_order() {
        let mut kalshi = FixedVenue::new(2, "kalshi", 0.9);
        kalshi.place_fails = true;
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), kalshi).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();

        let err = c.place(&place_req("YES")).await.unwrap_err();
        assert_eq!(err.kind(), "upstream_venue");
        assert!(err.to_string().contains("insufficient liquidity"));
        assert!(fx.store.get_order(COID).await.unwrap().is_none());
        assert!(!fx.store.find_deposit(COID).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_unknown_currency_blocks_fiat_venue() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.9)).await;
        c.save_deposit(&deposit(&fx, 10.0, "DOGE")).await.unwrap();
        assert!(matches!(c.place(&place_req("YES")).await, Err(AppError::InvalidInput(_))));
        assert!(fx.kalshi.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stored_prices_back_a_failed_live_fetch() {
        let mut kalshi = FixedVenue::new(2, "kalshi", 0.99);
        kalshi.live_fails = true;
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.45), kalshi).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();

        // Stored Kalshi YES is 0.5 from ingest, beating Polymarket's live 0.45.
        let route = c.router().quote("1_p1", "YES").await.unwrap();
        assert_eq!(route.selection.platform_id, 2);
        assert_eq!(route.selection.price, 0.5);
        assert_eq!(route.stale_platforms, vec![2]);
        assert_eq!(route.target.event_uuid, "2_K1");
    }

    // -- unfreeze tests --

    #[tokio::test]
    async fn test_unfreeze_releases_and_blocks_place() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.5)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();

        let mut mock = MockFundsReleaser::new();
        let owner = fx.wallet.address();
        mock.expect_release_funds()
            .times(1)
            .withf(move |_, to, amount, _| *to == owner && *amount == U256::from(10_000_000u64))
            .returning(|_, _, _, _| Ok("0xfeed".to_string()));
        let c = c.with_releaser(Arc::new(mock));

        let receipt = c
            .unfreeze(&UnfreezeRequest {
                contract_order_id: COID.into(),
                wallet: Some(fx.wallet.address().to_string().to_lowercase()),
            })
            .await
            .unwrap();
        assert_eq!(receipt.tx_hash, "0xfeed");
        assert!(fx.store.find_deposit(COID).await.unwrap().unwrap().is_refunded());

        let err = c.place(&place_req("YES")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m.contains("already refunded")));
    }

    #[tokio::test]
    async fn test_unfreeze_after_place_conflicts_without_chain_call() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.5)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        c.place(&place_req("YES")).await.unwrap();

        let mut mock = MockFundsReleaser::new();
        mock.expect_release_funds().times(0);
        let c = c.with_releaser(Arc::new(mock));
        let err = c
            .unfreeze(&UnfreezeRequest {
                contract_order_id: COID.into(),
                wallet: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m.contains("already processed")));
    }

    #[tokio::test]
    async fn test_unfreeze_chain_failure_keeps_deposit() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.5)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        let mut mock = MockFundsReleaser::new();
        mock.expect_release_funds()
            .returning(|_, _, _, _| Err(AppError::UpstreamChain("execution reverted".into())));
        let c = c.with_releaser(Arc::new(mock));

        let req = UnfreezeRequest {
            contract_order_id: COID.into(),
            wallet: None,
        };
        assert!(matches!(c.unfreeze(&req).await, Err(AppError::UpstreamChain(_))));
        let d = fx.store.find_deposit(COID).await.unwrap().unwrap();
        assert!(!d.is_refunded() && !d.processed);
    }

    #[tokio::test]
    async fn test_unfreeze_rejects_other_wallet_and_missing_executor() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.5)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        let err = c
            .unfreeze(&UnfreezeRequest {
                contract_order_id: COID.into(),
                wallet: Some("0x0000000000000000000000000000000000000001".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        let err = c
            .unfreeze(&UnfreezeRequest {
                contract_order_id: COID.into(),
                wallet: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    // -- settlement and withdraw tests --

    fn notice(tx: &str, amount: f64) -> SettlementNotice {
        SettlementNotice {
            order_uuid: COID.into(),
            tx_hash: tx.into(),
            settlement_amount: amount,
            manage_fee: 0.12,
            gas_fee: 0.0,
        }
    }

    #[tokio::test]
    async fn test_duplicate_settled_log_is_idempotent() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.4)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        c.place(&place_req("YES")).await.unwrap();

        c.on_settlement(notice("0xs1", 12.0), 5).await.unwrap();
        c.on_settlement(notice("0xs1", 12.0), 5).await.unwrap();

        let order = fx.store.get_order(COID).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Settled);
        assert_eq!(order.settlement_tx_hash.as_deref(), Some("0xs1"));
        assert_eq!(fx.store.settlement_records_for(COID).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_for_unknown_order_is_hard_failure() {
        let (_fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.5), FixedVenue::new(2, "kalshi", 0.4)).await;
        let err = c.on_settlement_completed(&notice("0xs1", 12.0)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fiat_withdraw_charges_fee_and_completes() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.4), FixedVenue::new(2, "kalshi", 0.5)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        c.place(&place_req("YES")).await.unwrap();

        let err = c.get_withdraw_info(COID).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        c.on_settlement_completed(&notice("0xs1", 20.0)).await.unwrap();
        let info = c.get_withdraw_info(COID).await.unwrap();
        assert_eq!(info.method, WithdrawMethod::FiatPayout);
        assert!((info.payout - 20.0).abs() < 1e-9);
        assert!((info.fee - 0.1).abs() < 1e-9);
        assert!((info.user_amount - 19.9).abs() < 1e-9);
        assert!(info.bet_id.is_none());

        let out = c.request_withdraw(COID).await.unwrap();
        assert_eq!(out.status, OrderStatus::Withdrawn);
        assert!(matches!(c.request_withdraw(COID).await, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_onchain_withdraw_descriptor() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.6), FixedVenue::new(2, "kalshi", 0.5)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        c.place(&place_req("YES")).await.unwrap();
        c.on_settlement_completed(&notice("0xs1", 16.5)).await.unwrap();

        let info = c.get_withdraw_info(COID).await.unwrap();
        assert_eq!(info.method, WithdrawMethod::Onchain);
        assert_eq!(info.fee, 0.0);
        assert_eq!(info.bet_id.as_deref(), Some(format!("0x{COID}").as_str()));
        assert_eq!(info.amount_units.as_deref(), Some("16500000"));
        assert_eq!(info.contract.as_deref(), Some("0x00000000000000000000000000000000000000e6"));

        let out = c.request_withdraw(COID).await.unwrap();
        assert_eq!(out.status, OrderStatus::WithdrawRequested);
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["method"], "onchain");
        assert_eq!(json["status"], "withdraw_requested");
    }

    #[tokio::test]
    async fn test_loss_payout_floors_at_zero() {
        let (fx, c) = fixture(FixedVenue::new(1, "polymarket", 0.6), FixedVenue::new(2, "kalshi", 0.5)).await;
        c.save_deposit(&deposit(&fx, 10.0, "USDC")).await.unwrap();
        c.place(&place_req("YES")).await.unwrap();
        c.on_settlement_completed(&notice("0xs1", 0.0)).await.unwrap();
        let info = c.get_withdraw_info(COID).await.unwrap();
        assert_eq!(info.payout, 0.0);
        assert_eq!(info.amount_units.as_deref(), Some("0"));
    }
}
