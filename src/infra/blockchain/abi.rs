//! Minimal ABI helpers for ERC-20 transfers and uint256 view calls.

use ethers::abi::{ParamType, Token};
use ethers::types::{Address, U256};

use crate::domain::InvalidPaymentError;

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// `balanceOf(address)`
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// 4-byte selector of a function signature such as `totalSold()`
#[must_use]
pub fn selector(signature: &str) -> [u8; 4] {
    ethers::utils::id(signature)
}

/// Decode `0x`-prefixed hex into bytes
pub fn decode_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let body = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(body)
}

#[must_use]
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[must_use]
pub fn address_to_string(address: &Address) -> String {
    encode_hex(address.as_bytes())
}

/// Decode calldata of an ERC-20 `transfer(address,uint256)` call.
///
/// Returns `Ok(None)` when the calldata is not a transfer call at all, and an
/// error when it carries the transfer selector but the arguments are invalid.
pub fn decode_transfer_call(input: &str) -> Result<Option<(String, u128)>, InvalidPaymentError> {
    let data = decode_hex(input)
        .map_err(|e| InvalidPaymentError::MalformedTransfer(format!("calldata is not hex: {}", e)))?;
    if data.len() < 4 || data[..4] != TRANSFER_SELECTOR {
        return Ok(None);
    }

    let tokens = ethers::abi::decode(&[ParamType::Address, ParamType::Uint(256)], &data[4..])
        .map_err(|e| InvalidPaymentError::MalformedTransfer(e.to_string()))?;

    match tokens.as_slice() {
        [Token::Address(recipient), Token::Uint(amount)] => {
            let amount = u256_to_u128(*amount).ok_or_else(|| {
                InvalidPaymentError::MalformedTransfer(format!("amount {} overflows", amount))
            })?;
            Ok(Some((address_to_string(recipient), amount)))
        }
        _ => Err(InvalidPaymentError::MalformedTransfer(
            "unexpected transfer arguments".to_string(),
        )),
    }
}

/// Calldata for `transfer(to, amount)`
#[must_use]
pub fn encode_transfer_call(to: Address, amount: U256) -> Vec<u8> {
    let mut data = TRANSFER_SELECTOR.to_vec();
    data.extend(ethers::abi::encode(&[Token::Address(to), Token::Uint(amount)]));
    data
}

/// Calldata for `balanceOf(holder)`
#[must_use]
pub fn encode_balance_of_call(holder: Address) -> Vec<u8> {
    let mut data = BALANCE_OF_SELECTOR.to_vec();
    data.extend(ethers::abi::encode(&[Token::Address(holder)]));
    data
}

#[must_use]
pub fn u256_to_u128(value: U256) -> Option<u128> {
    if value > U256::from(u128::MAX) {
        None
    } else {
        Some(value.as_u128())
    }
}

/// Split an ABI return blob into 32-byte words, ignoring a trailing partial word
#[must_use]
pub fn split_words(data: &[u8]) -> Vec<[u8; 32]> {
    data.chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect()
}

#[must_use]
pub fn word_to_u128(word: &[u8; 32]) -> Option<u128> {
    u256_to_u128(U256::from_big_endian(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";

    #[test]
    fn test_transfer_selector_matches_signature() {
        assert_eq!(selector("transfer(address,uint256)"), TRANSFER_SELECTOR);
    }

    #[test]
    fn test_balance_of_call_layout() {
        assert_eq!(selector("balanceOf(address)"), BALANCE_OF_SELECTOR);
        let data = encode_balance_of_call(Address::from_str(RECIPIENT).unwrap());
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &BALANCE_OF_SELECTOR);
        assert_eq!(&data[16..], &[0x11; 20]);
    }

    #[test]
    fn test_transfer_call_roundtrip() {
        let to = Address::from_str(RECIPIENT).unwrap();
        let data = encode_transfer_call(to, U256::from(250_000_000u64));
        assert_eq!(data.len(), 68);

        let decoded = decode_transfer_call(&encode_hex(&data)).unwrap().unwrap();
        assert_eq!(decoded.0, RECIPIENT);
        assert_eq!(decoded.1, 250_000_000);
    }

    #[test]
    fn test_non_transfer_calldata_is_ignored() {
        assert_eq!(decode_transfer_call("0x").unwrap(), None);
        let approve = format!("0x095ea7b3{}", "00".repeat(64));
        assert_eq!(decode_transfer_call(&approve).unwrap(), None);
    }

    #[test]
    fn test_truncated_transfer_is_malformed() {
        let truncated = format!("0xa9059cbb{}", "00".repeat(40));
        assert!(matches!(
            decode_transfer_call(&truncated),
            Err(InvalidPaymentError::MalformedTransfer(_))
        ));
        assert!(decode_transfer_call("0xzz").is_err());
    }

    #[test]
    fn test_word_helpers() {
        let mut word = [0u8; 32];
        word[31] = 7;
        assert_eq!(word_to_u128(&word), Some(7));
        let overflow = [0xffu8; 32];
        assert_eq!(word_to_u128(&overflow), None);

        let mut blob = vec![0u8; 70];
        blob[31] = 1;
        blob[63] = 2;
        let words = split_words(&blob);
        assert_eq!(words.len(), 2);
        assert_eq!(word_to_u128(&words[1]), Some(2));
    }
}
