// =============================================================================
// Transfer Flow — the three-hop cross-account funds move, plus the sweeper
// =============================================================================
//
// The only sanctioned way to move USDT between the two trading sub-accounts:
//
//   1. internal            source trading → source funding   (trading key)
//   2. funding-to-funding  source funding → dest funding     (funding key)
//   3. deposit             dest funding   → dest trading     (dest funding key)
//
// Hops run strictly in order; a failed hop aborts the chain and nothing is
// rolled back. Funds stranded in a funding wallet are picked up by the next
// pass's sweep.
// =============================================================================

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::grvt::client::{ClientError, GrvtAccount, TransferAck, TransferRequest};
use crate::grvt::signing::{sign_transfer, TransferMessage};
use crate::types::TransferTxIds;

/// Sub-account id addressing the funding wallet in transfer requests.
const FUNDING_SUB_ID: &str = "0";

#[derive(Debug, Error)]
#[error("{hop} transfer failed: {source}")]
pub struct FlowError {
    pub hop: &'static str,
    #[source]
    pub source: ClientError,
}

/// Results of the three hops, in order.
#[derive(Debug, Clone)]
pub struct FlowReceipts {
    pub internal: TransferAck,
    pub funding_to_funding: TransferAck,
    pub deposit: TransferAck,
}

impl FlowReceipts {
    /// The chain succeeded only if every hop was acknowledged.
    pub fn success(&self) -> bool {
        self.internal.ack && self.funding_to_funding.ack && self.deposit.ack
    }

    pub fn tx_ids(&self) -> TransferTxIds {
        TransferTxIds {
            internal: self.internal.tx_id.clone(),
            funding_to_funding: self.funding_to_funding.tx_id.clone(),
            deposit: self.deposit.tx_id.clone(),
        }
    }
}

/// Build and sign one hop's wire request.
fn build_request(
    signing_key: &str,
    chain_id: u64,
    from_addr: &str,
    from_sub: &str,
    to_addr: &str,
    to_sub: &str,
    currency: &str,
    amount: Decimal,
) -> Result<TransferRequest, ClientError> {
    let msg = TransferMessage {
        from_account: from_addr.to_string(),
        from_sub_account: from_sub.parse().unwrap_or(0),
        to_account: to_addr.to_string(),
        to_sub_account: to_sub.parse().unwrap_or(0),
        num_tokens: amount,
    };
    let signature = sign_transfer(signing_key, chain_id, &msg)?;
    Ok(TransferRequest {
        from_account_id: from_addr.to_string(),
        from_sub_account_id: from_sub.to_string(),
        to_account_id: to_addr.to_string(),
        to_sub_account_id: to_sub.to_string(),
        currency: currency.to_string(),
        num_tokens: format!("{amount:.6}"),
        signature,
        transfer_type: "STANDARD".to_string(),
        transfer_metadata: String::new(),
    })
}

async fn throttle(throttle_ms: u64) {
    if throttle_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(throttle_ms)).await;
    }
}

pub struct TransferFlow;

impl TransferFlow {
    /// Move `amount` USDT from `src`'s trading sub-account to `dst`'s.
    pub async fn execute(
        src: &GrvtAccount,
        dst: &GrvtAccount,
        amount: Decimal,
        chain_id: u64,
        throttle_ms: u64,
    ) -> Result<FlowReceipts, FlowError> {
        let currency = src.creds.currency.as_str();
        let src_addr = src.creds.funding_account_address.as_str();
        let dst_addr = dst.creds.funding_account_address.as_str();

        // Hop 1: source trading → source funding, signed by the trading key.
        let req = build_request(
            &src.creds.trading_secret,
            chain_id,
            src_addr,
            src.trading_sub_id(),
            src_addr,
            FUNDING_SUB_ID,
            currency,
            amount,
        )
        .map_err(|source| FlowError { hop: "internal", source })?;
        let internal = src
            .trading
            .transfer(req)
            .await
            .map_err(|source| FlowError { hop: "internal", source })?;
        info!(hop = "internal", tx_id = ?internal.tx_id, ack = internal.ack, "transfer hop done");

        throttle(throttle_ms).await;

        // Hop 2: source funding → destination funding, signed by the source
        // funding key.
        let req = build_request(
            &src.creds.funding_secret,
            chain_id,
            src_addr,
            FUNDING_SUB_ID,
            dst_addr,
            FUNDING_SUB_ID,
            currency,
            amount,
        )
        .map_err(|source| FlowError { hop: "funding_to_funding", source })?;
        let funding_to_funding = src
            .funding
            .transfer(req)
            .await
            .map_err(|source| FlowError { hop: "funding_to_funding", source })?;
        info!(
            hop = "funding_to_funding",
            tx_id = ?funding_to_funding.tx_id,
            ack = funding_to_funding.ack,
            "transfer hop done"
        );

        throttle(throttle_ms).await;

        // Hop 3: destination funding → destination trading, signed by the
        // destination funding key.
        let req = build_request(
            &dst.creds.funding_secret,
            chain_id,
            dst_addr,
            FUNDING_SUB_ID,
            dst_addr,
            dst.trading_sub_id(),
            currency,
            amount,
        )
        .map_err(|source| FlowError { hop: "deposit", source })?;
        let deposit = dst
            .funding
            .transfer(req)
            .await
            .map_err(|source| FlowError { hop: "deposit", source })?;
        info!(hop = "deposit", tx_id = ?deposit.tx_id, ack = deposit.ack, "transfer hop done");

        Ok(FlowReceipts {
            internal,
            funding_to_funding,
            deposit,
        })
    }
}

// =============================================================================
// Balance sweeper
// =============================================================================

pub struct BalanceSweeper;

impl BalanceSweeper {
    /// Deposit any funding-wallet USDT above `threshold` back into trading.
    /// Failures are logged and swallowed; the next pass tries again.
    pub async fn sweep(
        account: &GrvtAccount,
        threshold: Decimal,
        chain_id: u64,
        throttle_ms: u64,
    ) -> Option<TransferAck> {
        let currency = account.creds.currency.clone();
        let balance = account.funding.funding_usdt_balance(&currency).await;
        if balance <= threshold {
            return None;
        }

        let addr = account.creds.funding_account_address.as_str();
        let req = match build_request(
            &account.creds.funding_secret,
            chain_id,
            addr,
            FUNDING_SUB_ID,
            addr,
            account.trading_sub_id(),
            &currency,
            balance,
        ) {
            Ok(req) => req,
            Err(e) => {
                warn!(side = %account.side, error = %e, "funding sweep signing failed");
                return None;
            }
        };

        throttle(throttle_ms).await;

        match account.funding.transfer(req).await {
            Ok(ack) => {
                info!(
                    side = %account.side,
                    pre_balance = %balance,
                    tx_id = ?ack.tx_id,
                    "funding sweep executed"
                );
                Some(ack)
            }
            Err(e) => {
                warn!(side = %account.side, error = %e, "funding sweep failed");
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::grvt::client::ClientError;
    use crate::testing::{mock_account, new_call_log, MockCall};
    use crate::types::AccountSide;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn three_hops_run_in_order_with_correct_routing() {
        let log = new_call_log();
        let (a, _a_trading, _a_funding) = mock_account(AccountSide::A, &log);
        let (b, _b_trading, _b_funding) = mock_account(AccountSide::B, &log);

        let receipts = TransferFlow::execute(&a, &b, dec!(2000), 325, 0)
            .await
            .unwrap();
        assert!(receipts.success());
        assert!(receipts.tx_ids().internal.is_some());

        let calls = log.lock().clone();
        let transfers: Vec<_> = calls
            .iter()
            .filter_map(|(label, call)| match call {
                MockCall::Transfer(req) => Some((label.clone(), req.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(transfers.len(), 3);

        // Hop 1: source trading client, trading sub → funding wallet.
        assert_eq!(transfers[0].0, "A.trading");
        assert_eq!(transfers[0].1.from_sub_account_id, "1001");
        assert_eq!(transfers[0].1.to_sub_account_id, "0");

        // Hop 2: source funding client, wallet → wallet across accounts.
        assert_eq!(transfers[1].0, "A.funding");
        assert_eq!(
            transfers[1].1.from_account_id,
            "0x1111111111111111111111111111111111111111"
        );
        assert_eq!(
            transfers[1].1.to_account_id,
            "0x2222222222222222222222222222222222222222"
        );

        // Hop 3: destination funding client, wallet → trading sub.
        assert_eq!(transfers[2].0, "B.funding");
        assert_eq!(transfers[2].1.to_sub_account_id, "2002");

        // Amounts are fixed six-decimal strings on every hop.
        assert!(transfers.iter().all(|(_, r)| r.num_tokens == "2000.000000"));
        assert!(transfers.iter().all(|(_, r)| r.transfer_type == "STANDARD"));
    }

    #[tokio::test]
    async fn failed_hop_aborts_without_later_hops() {
        let log = new_call_log();
        let (a, _a_trading, a_funding) = mock_account(AccountSide::A, &log);
        let (b, _b_trading, _b_funding) = mock_account(AccountSide::B, &log);

        a_funding.push_transfer_result(Err(ClientError::Business {
            code: 2001,
            status: 400,
            message: "insufficient balance".into(),
        }));

        let err = TransferFlow::execute(&a, &b, dec!(500), 325, 0)
            .await
            .unwrap_err();
        assert_eq!(err.hop, "funding_to_funding");

        let transfer_count = log
            .lock()
            .iter()
            .filter(|(_, call)| matches!(call, MockCall::Transfer(_)))
            .count();
        // Hop 1 and the failed hop 2; the deposit never ran.
        assert_eq!(transfer_count, 2);
    }

    #[tokio::test]
    async fn sweep_only_fires_above_threshold() {
        let log = new_call_log();
        let (a, _a_trading, a_funding) = mock_account(AccountSide::A, &log);

        a_funding.set_funding_balance(dec!(0.05));
        assert!(BalanceSweeper::sweep(&a, dec!(0.1), 325, 0).await.is_none());

        a_funding.set_funding_balance(dec!(350.5));
        let ack = BalanceSweeper::sweep(&a, dec!(0.1), 325, 0).await.unwrap();
        assert!(ack.ack);

        let calls = log.lock().clone();
        let sweep_req = calls
            .iter()
            .find_map(|(_, call)| match call {
                MockCall::Transfer(req) => Some(req.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(sweep_req.from_sub_account_id, "0");
        assert_eq!(sweep_req.to_sub_account_id, "1001");
        assert_eq!(sweep_req.num_tokens, "350.500000");
    }
}
