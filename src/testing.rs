// =============================================================================
// Test fixtures — scripted mock exchange and account builders
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::alerts::AlertSink;
use crate::config::AccountCreds;
use crate::grvt::client::{
    ClientError, ExchangeApi, GrvtAccount, OrderPayload, TransferAck, TransferRequest,
};
use crate::types::{AccountSide, Instrument, Observation, Position};

/// Well-known throwaway key (the go-ethereum documentation key).
pub const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe512961708279f1d17fc8d6e335d5e1";

/// Everything the mocks saw, in call order, tagged with the mock's label.
pub type CallLog = Arc<Mutex<Vec<(String, MockCall)>>>;

#[derive(Debug, Clone)]
pub enum MockCall {
    Summary(String),
    FundingBalance,
    Positions(String),
    Instrument(String),
    Transfer(TransferRequest),
    Order(OrderPayload),
}

pub fn new_call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A scripted exchange endpoint. Observation queues pop per call and hold
/// their last value; transfer/order result queues default to success.
pub struct MockExchange {
    label: String,
    log: CallLog,
    observations: Mutex<VecDeque<Observation>>,
    funding_balance: Mutex<Decimal>,
    positions: Mutex<Vec<Position>>,
    instruments: Mutex<HashMap<String, Instrument>>,
    transfer_results: Mutex<VecDeque<Result<TransferAck, ClientError>>>,
    order_results: Mutex<VecDeque<Result<serde_json::Value, ClientError>>>,
    transfer_seq: Mutex<u32>,
}

impl MockExchange {
    pub fn new(label: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            log,
            observations: Mutex::new(VecDeque::new()),
            funding_balance: Mutex::new(Decimal::ZERO),
            positions: Mutex::new(Vec::new()),
            instruments: Mutex::new(HashMap::new()),
            transfer_results: Mutex::new(VecDeque::new()),
            order_results: Mutex::new(VecDeque::new()),
            transfer_seq: Mutex::new(0),
        })
    }

    pub fn push_observation(&self, obs: Observation) {
        self.observations.lock().push_back(obs);
    }

    pub fn set_funding_balance(&self, balance: Decimal) {
        *self.funding_balance.lock() = balance;
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock() = positions;
    }

    pub fn insert_instrument(&self, instrument: Instrument) {
        self.instruments
            .lock()
            .insert(instrument.instrument.clone(), instrument);
    }

    pub fn push_transfer_result(&self, result: Result<TransferAck, ClientError>) {
        self.transfer_results.lock().push_back(result);
    }

    pub fn push_order_result(&self, result: Result<serde_json::Value, ClientError>) {
        self.order_results.lock().push_back(result);
    }

    fn record(&self, call: MockCall) {
        self.log.lock().push((self.label.clone(), call));
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn sub_account_summary(&self, sub_id: &str) -> Observation {
        self.record(MockCall::Summary(sub_id.to_string()));
        let mut queue = self.observations.lock();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap_or_default()
        }
    }

    async fn funding_usdt_balance(&self, _currency: &str) -> Decimal {
        self.record(MockCall::FundingBalance);
        *self.funding_balance.lock()
    }

    async fn positions(&self, sub_id: &str) -> Vec<Position> {
        self.record(MockCall::Positions(sub_id.to_string()));
        self.positions.lock().clone()
    }

    async fn get_instrument(&self, instrument: &str) -> Result<Instrument, ClientError> {
        self.record(MockCall::Instrument(instrument.to_string()));
        self.instruments
            .lock()
            .get(instrument)
            .cloned()
            .ok_or_else(|| ClientError::Validation(format!("unknown instrument {instrument}")))
    }

    async fn transfer(&self, req: TransferRequest) -> Result<TransferAck, ClientError> {
        self.record(MockCall::Transfer(req));
        if let Some(result) = self.transfer_results.lock().pop_front() {
            return result;
        }
        let mut seq = self.transfer_seq.lock();
        *seq += 1;
        Ok(TransferAck {
            ack: true,
            tx_id: Some(format!("tx-{}-{}", self.label, *seq)),
        })
    }

    async fn create_order(&self, order: OrderPayload) -> Result<serde_json::Value, ClientError> {
        self.record(MockCall::Order(order));
        if let Some(result) = self.order_results.lock().pop_front() {
            return result;
        }
        Ok(serde_json::json!({ "result": { "order_id": "1" } }))
    }
}

/// Credentials for a fake account; both roles sign with [`TEST_KEY`].
pub fn test_creds(side: AccountSide) -> AccountCreds {
    let (addr, sub_id, account_id) = match side {
        AccountSide::A => (
            "0x1111111111111111111111111111111111111111",
            "1001",
            "0xa1",
        ),
        AccountSide::B => (
            "0x2222222222222222222222222222222222222222",
            "2002",
            "0xb2",
        ),
    };
    AccountCreds {
        account_id: account_id.into(),
        funding_account_address: addr.into(),
        trading_account_id: sub_id.into(),
        funding_key: "test-funding-key".into(),
        funding_secret: TEST_KEY.into(),
        trading_key: "test-trading-key".into(),
        trading_secret: TEST_KEY.into(),
        chain_id: None,
        currency: "USDT".into(),
    }
}

/// Build an account whose trading and funding endpoints are fresh mocks
/// sharing `log`.
pub fn mock_account(side: AccountSide, log: &CallLog) -> (GrvtAccount, Arc<MockExchange>, Arc<MockExchange>) {
    let trading = MockExchange::new(&format!("{side}.trading"), log.clone());
    let funding = MockExchange::new(&format!("{side}.funding"), log.clone());
    let account = GrvtAccount::with_clients(
        side,
        test_creds(side),
        trading.clone(),
        funding.clone(),
    );
    (account, trading, funding)
}

/// An alert sink over a unique temp directory with no Telegram client.
pub fn temp_alert_sink(tag: &str) -> (Arc<AlertSink>, PathBuf) {
    let dir = std::env::temp_dir().join(format!(
        "grvt-sentinel-fixture-{tag}-{}-{}",
        std::process::id(),
        rand::random::<u32>()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    (Arc::new(AlertSink::new(&dir, None)), dir)
}

pub fn obs(eq: Decimal, mm: Decimal, avail: Decimal) -> Observation {
    Observation {
        total_equity: eq,
        maintenance_margin: mm,
        available_balance: avail,
        event_time_ns: Some(1_704_067_200_000_000_000),
    }
}

pub fn position(instrument: &str, size: Decimal, notional: Decimal, pnl: Decimal) -> Position {
    Position {
        instrument: instrument.into(),
        size,
        notional,
        unrealized_pnl: pnl,
    }
}

pub fn instrument(name: &str, base_decimals: u32, min_size: Decimal, tick_size: Decimal) -> Instrument {
    Instrument {
        instrument: name.into(),
        instrument_hash: "0x030501".into(),
        base_decimals,
        min_size,
        tick_size,
    }
}
