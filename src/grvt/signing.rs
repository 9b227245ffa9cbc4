// =============================================================================
// EIP-712 signing for GRVT transfers and orders
// =============================================================================
//
// Domain: { name: "GRVT Exchange", version: "0", chainId }. Two message
// types: Transfer (cross-account funds moves) and Order with nested
// OrderLeg[] (reduce-only market orders). Struct hashes are assembled by
// hand so the byte layout is explicit and testable; the wallet signs the
// final `\x19\x01 ‖ domainSeparator ‖ structHash` digest.
// =============================================================================

use ethers_core::types::transaction::eip712::EIP712Domain;
use ethers_core::types::{H160, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::grvt::client::ClientError;

/// USDT currency id in the venue's typed data.
const CURRENCY_ID_USDT: u8 = 3;
/// USDT on-chain decimals; `numTokens` is scaled by this.
const USDT_DECIMALS: u32 = 6;
/// Signatures expire 15 minutes after creation.
const EXPIRY_NS: i64 = 15 * 60 * 1_000_000_000;

const TRANSFER_TYPE: &str = "Transfer(address fromAccount,uint64 fromSubAccount,address toAccount,uint64 toSubAccount,uint8 tokenCurrency,uint64 numTokens,uint32 nonce,int64 expiration)";
const ORDER_TYPE: &str = "Order(uint64 subAccountID,bool isMarket,uint8 timeInForce,bool postOnly,bool reduceOnly,OrderLeg[] legs,uint32 nonce,int64 expiration)OrderLeg(uint256 assetID,uint64 contractSize,uint64 limitPrice,bool isBuyingContract)";
const ORDER_LEG_TYPE: &str =
    "OrderLeg(uint256 assetID,uint64 contractSize,uint64 limitPrice,bool isBuyingContract)";

/// Time-in-force codes used inside the signed payload.
pub mod time_in_force {
    pub const GOOD_TILL_TIME: u8 = 1;
    pub const ALL_OR_NONE: u8 = 2;
    pub const IMMEDIATE_OR_CANCEL: u8 = 3;
    pub const FILL_OR_KILL: u8 = 4;
}

/// Wire representation of a signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSignature {
    pub signer: String,
    pub r: String,
    pub s: String,
    pub v: u8,
    /// Expiration in nanoseconds, stringified on the wire.
    pub expiration: String,
    pub nonce: u32,
}

fn domain(chain_id: u64) -> EIP712Domain {
    EIP712Domain {
        name: Some("GRVT Exchange".to_string()),
        version: Some("0".to_string()),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: None,
        salt: None,
    }
}

/// Stable domain separator for a given chain id.
pub fn domain_separator(chain_id: u64) -> [u8; 32] {
    domain(chain_id).separator()
}

// ── ABI word encoders ────────────────────────────────────────────────────────

fn word_u256(v: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    v.to_big_endian(&mut out);
    out
}

fn word_u64(v: u64) -> [u8; 32] {
    word_u256(U256::from(v))
}

fn word_i64(v: i64) -> [u8; 32] {
    // Two's-complement sign extension to 256 bits.
    if v >= 0 {
        word_u256(U256::from(v as u64))
    } else {
        let mut out = [0xffu8; 32];
        out[24..].copy_from_slice(&v.to_be_bytes());
        out
    }
}

fn word_bool(v: bool) -> [u8; 32] {
    word_u64(u64::from(v))
}

fn word_address(addr: H160) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(addr.as_bytes());
    out
}

fn parse_address(s: &str) -> Result<H160, ClientError> {
    H160::from_str(s.trim())
        .map_err(|e| ClientError::Validation(format!("invalid address {s:?}: {e}")))
}

/// Parse a hex (`0x…`) or decimal uint256.
pub fn parse_u256(s: &str) -> Result<U256, ClientError> {
    let s = s.trim();
    let parsed = if let Some(hexpart) = s.strip_prefix("0x") {
        U256::from_str_radix(hexpart, 16).ok()
    } else {
        U256::from_dec_str(s).ok()
    };
    parsed.ok_or_else(|| ClientError::Validation(format!("invalid uint256 {s:?}")))
}

fn wallet_from_key(private_key: &str) -> Result<LocalWallet, ClientError> {
    LocalWallet::from_str(private_key.trim().trim_start_matches("0x"))
        .map_err(|e| ClientError::Validation(format!("malformed private key: {e}")))
}

fn sign_digest(wallet: &LocalWallet, digest: [u8; 32], nonce: u32, expiration_ns: i64) -> Result<WireSignature, ClientError> {
    let sig = wallet
        .sign_hash(H256::from(digest))
        .map_err(|e| ClientError::Validation(format!("signing failed: {e}")))?;
    Ok(WireSignature {
        signer: format!("0x{}", hex::encode(wallet.address().as_bytes())),
        r: format!("0x{:064x}", sig.r),
        s: format!("0x{:064x}", sig.s),
        v: sig.v as u8,
        expiration: expiration_ns.to_string(),
        nonce,
    })
}

fn eip712_digest(chain_id: u64, struct_hash: [u8; 32]) -> [u8; 32] {
    let mut payload = Vec::with_capacity(2 + 32 + 32);
    payload.extend_from_slice(&[0x19, 0x01]);
    payload.extend_from_slice(&domain_separator(chain_id));
    payload.extend_from_slice(&struct_hash);
    keccak256(&payload)
}

/// Expiration timestamp for a signature created now.
pub fn expiration_ns() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        + EXPIRY_NS
}

/// Uniform random 31-bit transfer nonce.
pub fn transfer_nonce() -> u32 {
    rand::thread_rng().gen_range(1..=(i32::MAX as u32))
}

/// Uniform random 32-bit order nonce.
pub fn order_nonce() -> u32 {
    rand::thread_rng().gen()
}

/// Client order id in the venue-mandated `[2^63, 2^64)` range.
pub fn client_order_id() -> u64 {
    rand::thread_rng().gen_range(1u64 << 63..=u64::MAX)
}

// =============================================================================
// Transfer
// =============================================================================

/// The fields that go into a Transfer struct hash.
#[derive(Debug, Clone)]
pub struct TransferMessage {
    pub from_account: String,
    pub from_sub_account: u64,
    pub to_account: String,
    pub to_sub_account: u64,
    /// USDT amount; scaled to 6-decimal integer units for signing.
    pub num_tokens: Decimal,
}

/// Struct hash for a transfer message.
pub fn transfer_struct_hash(
    msg: &TransferMessage,
    nonce: u32,
    expiration_ns: i64,
) -> Result<[u8; 32], ClientError> {
    let scale = Decimal::from(10u64.pow(USDT_DECIMALS));
    let scaled = (msg.num_tokens * scale).trunc();
    let num_tokens = scaled
        .to_u64()
        .ok_or_else(|| ClientError::Validation(format!("transfer amount out of range: {}", msg.num_tokens)))?;

    let mut encoded = Vec::with_capacity(32 * 9);
    encoded.extend_from_slice(&keccak256(TRANSFER_TYPE.as_bytes()));
    encoded.extend_from_slice(&word_address(parse_address(&msg.from_account)?));
    encoded.extend_from_slice(&word_u64(msg.from_sub_account));
    encoded.extend_from_slice(&word_address(parse_address(&msg.to_account)?));
    encoded.extend_from_slice(&word_u64(msg.to_sub_account));
    encoded.extend_from_slice(&word_u64(u64::from(CURRENCY_ID_USDT)));
    encoded.extend_from_slice(&word_u64(num_tokens));
    encoded.extend_from_slice(&word_u64(u64::from(nonce)));
    encoded.extend_from_slice(&word_i64(expiration_ns));
    Ok(keccak256(&encoded))
}

/// Sign a transfer with the given private key; returns the wire signature.
pub fn sign_transfer(
    private_key: &str,
    chain_id: u64,
    msg: &TransferMessage,
) -> Result<WireSignature, ClientError> {
    let wallet = wallet_from_key(private_key)?;
    let nonce = transfer_nonce();
    let exp = expiration_ns();
    let struct_hash = transfer_struct_hash(msg, nonce, exp)?;
    sign_digest(&wallet, eip712_digest(chain_id, struct_hash), nonce, exp)
}

// =============================================================================
// Order
// =============================================================================

/// One signed order leg.
#[derive(Debug, Clone)]
pub struct OrderLegMessage {
    pub asset_id: U256,
    pub contract_size: u64,
    /// Zero for market orders.
    pub limit_price: u64,
    pub is_buying_contract: bool,
}

/// The fields that go into an Order struct hash.
#[derive(Debug, Clone)]
pub struct OrderMessage {
    pub sub_account_id: u64,
    pub is_market: bool,
    pub time_in_force: u8,
    pub post_only: bool,
    pub reduce_only: bool,
    pub legs: Vec<OrderLegMessage>,
}

fn leg_struct_hash(leg: &OrderLegMessage) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(32 * 5);
    encoded.extend_from_slice(&keccak256(ORDER_LEG_TYPE.as_bytes()));
    encoded.extend_from_slice(&word_u256(leg.asset_id));
    encoded.extend_from_slice(&word_u64(leg.contract_size));
    encoded.extend_from_slice(&word_u64(leg.limit_price));
    encoded.extend_from_slice(&word_bool(leg.is_buying_contract));
    keccak256(&encoded)
}

/// Struct hash for an order message (legs hashed per the EIP-712
/// array-of-structs rule: keccak of the concatenated leg struct hashes).
pub fn order_struct_hash(msg: &OrderMessage, nonce: u32, expiration_ns: i64) -> [u8; 32] {
    let mut legs_concat = Vec::with_capacity(32 * msg.legs.len());
    for leg in &msg.legs {
        legs_concat.extend_from_slice(&leg_struct_hash(leg));
    }
    let legs_hash = keccak256(&legs_concat);

    let mut encoded = Vec::with_capacity(32 * 9);
    encoded.extend_from_slice(&keccak256(ORDER_TYPE.as_bytes()));
    encoded.extend_from_slice(&word_u64(msg.sub_account_id));
    encoded.extend_from_slice(&word_bool(msg.is_market));
    encoded.extend_from_slice(&word_u64(u64::from(msg.time_in_force)));
    encoded.extend_from_slice(&word_bool(msg.post_only));
    encoded.extend_from_slice(&word_bool(msg.reduce_only));
    encoded.extend_from_slice(&legs_hash);
    encoded.extend_from_slice(&word_u64(u64::from(nonce)));
    encoded.extend_from_slice(&word_i64(expiration_ns));
    keccak256(&encoded)
}

/// Sign an order with the given private key; returns the wire signature.
pub fn sign_order(
    private_key: &str,
    chain_id: u64,
    msg: &OrderMessage,
) -> Result<WireSignature, ClientError> {
    let wallet = wallet_from_key(private_key)?;
    let nonce = order_nonce();
    let exp = expiration_ns();
    let struct_hash = order_struct_hash(msg, nonce, exp);
    sign_digest(&wallet, eip712_digest(chain_id, struct_hash), nonce, exp)
}

/// `floor(size · 10^base_decimals)` as the signed contract size.
pub fn contract_size(size: Decimal, base_decimals: u32) -> Result<u64, ClientError> {
    let scale = Decimal::from(10u64.pow(base_decimals.min(18)));
    (size * scale)
        .trunc()
        .to_u64()
        .ok_or_else(|| ClientError::Validation(format!("order size out of range: {size}")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe512961708279f1d17fc8d6e335d5e1";
    const TEST_ADDR_A: &str = "0x1111111111111111111111111111111111111111";
    const TEST_ADDR_B: &str = "0x2222222222222222222222222222222222222222";

    fn transfer_msg() -> TransferMessage {
        TransferMessage {
            from_account: TEST_ADDR_A.into(),
            from_sub_account: 0,
            to_account: TEST_ADDR_B.into(),
            to_sub_account: 9_876_543_210,
            num_tokens: dec!(1234.567891),
        }
    }

    #[test]
    fn domain_separator_is_stable_and_chain_dependent() {
        assert_eq!(domain_separator(325), domain_separator(325));
        assert_ne!(domain_separator(325), domain_separator(326));
    }

    #[test]
    fn transfer_hash_is_deterministic_modulo_nonce() {
        let msg = transfer_msg();
        let h1 = transfer_struct_hash(&msg, 42, 1_000).unwrap();
        let h2 = transfer_struct_hash(&msg, 42, 1_000).unwrap();
        assert_eq!(h1, h2);
        let h3 = transfer_struct_hash(&msg, 43, 1_000).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn transfer_amount_is_scaled_to_six_decimals() {
        // 0.0000001 USDT truncates to zero raw units but must not error.
        let mut msg = transfer_msg();
        msg.num_tokens = dec!(0.0000001);
        transfer_struct_hash(&msg, 1, 1).unwrap();
        // Negative amounts cannot be signed.
        msg.num_tokens = dec!(-1);
        assert!(transfer_struct_hash(&msg, 1, 1).is_err());
    }

    #[test]
    fn invalid_address_is_a_validation_error() {
        let mut msg = transfer_msg();
        msg.from_account = "not-an-address".into();
        let err = transfer_struct_hash(&msg, 1, 1).unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[test]
    fn order_hash_changes_with_each_field() {
        let base = OrderMessage {
            sub_account_id: 123,
            is_market: true,
            time_in_force: time_in_force::IMMEDIATE_OR_CANCEL,
            post_only: false,
            reduce_only: true,
            legs: vec![OrderLegMessage {
                asset_id: U256::from(7777u64),
                contract_size: 250,
                limit_price: 0,
                is_buying_contract: true,
            }],
        };
        let h = order_struct_hash(&base, 1, 2);
        assert_eq!(h, order_struct_hash(&base, 1, 2));

        let mut flipped = base.clone();
        flipped.reduce_only = false;
        assert_ne!(h, order_struct_hash(&flipped, 1, 2));

        let mut resized = base.clone();
        resized.legs[0].contract_size = 251;
        assert_ne!(h, order_struct_hash(&resized, 1, 2));

        let mut sold = base.clone();
        sold.legs[0].is_buying_contract = false;
        assert_ne!(h, order_struct_hash(&sold, 1, 2));
    }

    #[test]
    fn signatures_carry_padded_r_s_and_signer() {
        let sig = sign_transfer(TEST_KEY, 325, &transfer_msg()).unwrap();
        assert_eq!(sig.r.len(), 66);
        assert_eq!(sig.s.len(), 66);
        assert!(sig.r.starts_with("0x"));
        assert!(sig.v == 27 || sig.v == 28);
        assert_eq!(
            sig.signer,
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
        assert!(sig.nonce >= 1);
    }

    #[test]
    fn malformed_key_is_a_validation_error() {
        let err = sign_transfer("zz", 325, &transfer_msg()).unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[test]
    fn contract_size_floors() {
        assert_eq!(contract_size(dec!(0.2519), 3).unwrap(), 251);
        assert_eq!(contract_size(dec!(1), 9).unwrap(), 1_000_000_000);
        assert_eq!(contract_size(dec!(0.0001), 3).unwrap(), 0);
        assert!(contract_size(dec!(-1), 3).is_err());
    }

    #[test]
    fn parse_u256_accepts_hex_and_decimal() {
        assert_eq!(parse_u256("0xff").unwrap(), U256::from(255u64));
        assert_eq!(parse_u256("255").unwrap(), U256::from(255u64));
        assert!(parse_u256("0xzz").is_err());
        assert!(parse_u256("abc").is_err());
    }

    #[test]
    fn time_in_force_code_table_is_fixed() {
        assert_eq!(time_in_force::GOOD_TILL_TIME, 1);
        assert_eq!(time_in_force::ALL_OR_NONE, 2);
        assert_eq!(time_in_force::IMMEDIATE_OR_CANCEL, 3);
        assert_eq!(time_in_force::FILL_OR_KILL, 4);
    }

    #[test]
    fn nonce_and_order_id_ranges() {
        for _ in 0..64 {
            let n = transfer_nonce();
            assert!(n >= 1 && n <= i32::MAX as u32);
            assert!(client_order_id() >= 1u64 << 63);
        }
    }
}
