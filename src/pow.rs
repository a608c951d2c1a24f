//! Proof-of-work arithmetic: compact targets, block work, difficulty

use num_bigint::{BigInt, Sign};
use num_traits::{FromPrimitive, One, Signed, ToPrimitive, Zero};
use tracing::warn;

use crate::constants::MAINNET_HIGHEST_TARGET_BITS;
use crate::error::{ChainError, Result};
use crate::types::BlockHeader;

/// Decode the compact "nBits" representation without any policy bound.
///
/// The bottom three bytes are the mantissa (signed encoding, so at most
/// 0x7fffff), the top byte is a byte exponent: target = mantissa *
/// 2^(8*(exponent-3)).
fn decode_target(bits: u32) -> Result<BigInt> {
    let mantissa = bits & 0x00ff_ffff;
    if mantissa > 0x007f_ffff {
        return Err(ChainError::structural(format!(
            "target mantissa out of range in bits {bits:#010x}"
        )));
    }
    let exponent = bits >> 24;
    if exponent > 32 {
        return Err(ChainError::structural(format!(
            "target exponent out of range in bits {bits:#010x}"
        )));
    }
    let target = if exponent <= 3 {
        BigInt::from(mantissa) >> (8 * (3 - exponent) as usize)
    } else {
        BigInt::from(mantissa) << (8 * (exponent - 3) as usize)
    };
    Ok(target)
}

/// Decode compact bits, rejecting targets above the chain's maximum.
pub fn bits_to_target(bits: u32, highest_target_bits: u32) -> Result<BigInt> {
    let target = decode_target(bits)?;
    let highest = decode_target(highest_target_bits)?;
    if target > highest {
        return Err(ChainError::structural(format!(
            "bits {bits:#010x} encode a target above the chain maximum {highest_target_bits:#010x}"
        )));
    }
    Ok(target)
}

/// Encode a target in compact form: minimal byte-aligned exponent with the
/// mantissa in three bytes. If the mantissa's top bit would be set (sign
/// ambiguity in the signed encoding) the mantissa is shifted down a byte and
/// the exponent bumped.
pub fn target_to_bits(target: &BigInt) -> Result<u32> {
    if target.is_negative() {
        return Err(ChainError::structural("cannot encode a negative target"));
    }
    if target.is_zero() {
        return Ok(0);
    }
    let (_, bytes) = target.to_bytes_be();
    let mut size = bytes.len();
    let mut compact: u32 = if size <= 3 {
        let mut value = 0u32;
        for &byte in &bytes {
            value = (value << 8) | byte as u32;
        }
        value << (8 * (3 - size))
    } else {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    if size > 32 {
        return Err(ChainError::structural("target wider than 256 bits"));
    }
    Ok(compact | ((size as u32) << 24))
}

/// Expected hash attempts this header's target represents: 2^256 / target.
///
/// Corrupt bits must not crash chain indexing, so this logs and returns the
/// -1 sentinel instead of failing; cumulative-work comparison tolerates a
/// negative contribution, and such a chain can never win against an honest
/// one.
pub fn calculate_work(header: &BlockHeader) -> BigInt {
    match decode_target(header.bits) {
        Ok(target) if target.is_positive() => (BigInt::one() << 256usize) / target,
        Ok(_) => {
            warn!(bits = header.bits, "zero target while computing block work");
            BigInt::from(-1)
        }
        Err(err) => {
            warn!(bits = header.bits, %err, "corrupt bits while computing block work");
            BigInt::from(-1)
        }
    }
}

/// The mainnet maximum target (minimum difficulty), difficulty 1.0.
pub fn max_target() -> BigInt {
    BigInt::from(0x0000_ffff) << (8 * (0x1d - 3) as usize)
}

/// Difficulty relative to the minimum-difficulty target.
pub fn target_to_difficulty(target: &BigInt) -> Result<f64> {
    if !target.is_positive() {
        return Err(ChainError::structural(
            "difficulty is undefined for a non-positive target",
        ));
    }
    let max = max_target()
        .to_f64()
        .ok_or_else(|| ChainError::structural("maximum target not representable"))?;
    let target = target
        .to_f64()
        .ok_or_else(|| ChainError::structural("target not representable"))?;
    Ok(max / target)
}

pub fn difficulty_to_target(difficulty: f64) -> Result<BigInt> {
    if !(difficulty > 0.0) || !difficulty.is_finite() {
        return Err(ChainError::structural(format!(
            "difficulty out of range: {difficulty}"
        )));
    }
    let max = max_target()
        .to_f64()
        .ok_or_else(|| ChainError::structural("maximum target not representable"))?;
    BigInt::from_f64(max / difficulty)
        .ok_or_else(|| ChainError::structural("difficulty produces no representable target"))
}

/// Check that the header hash, read as a 256-bit little-endian integer, does
/// not exceed the target its bits encode.
pub fn check_proof_of_work(header: &BlockHeader, highest_target_bits: u32) -> Result<()> {
    let target = bits_to_target(header.bits, highest_target_bits)?;
    let hash_value = BigInt::from_bytes_le(Sign::Plus, &header.hash());
    if hash_value > target {
        return Err(ChainError::validation(format!(
            "proof of work: hash above target for bits {:#010x}",
            header.bits
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::REGTEST_HIGHEST_TARGET_BITS;
    use crate::types::ZERO_HASH;

    fn header_with_bits(bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_block_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            time: 1231006505,
            bits,
            nonce: 0,
        }
    }

    #[test]
    fn test_bits_round_trip() {
        for bits in [
            0x1d00ffffu32,
            0x1b0404cb,
            0x207fffff,
            0x1c05a3f4,
            0x03123456,
            0x181bc330,
        ] {
            let target = decode_target(bits).unwrap();
            assert_eq!(target_to_bits(&target).unwrap(), bits, "bits {bits:#010x}");
        }
    }

    #[test]
    fn test_target_round_trip() {
        // Representable targets survive encode/decode exactly.
        let target = BigInt::from(0x0404cb) << (8 * (0x1b - 3) as usize);
        let bits = target_to_bits(&target).unwrap();
        assert_eq!(decode_target(bits).unwrap(), target);
    }

    #[test]
    fn test_mantissa_sign_bit_shifts_exponent() {
        // 0x800000 would read as negative in the signed mantissa encoding, so
        // the encoder must emit 0x008000 with the exponent bumped by one.
        let target = BigInt::from(0x0080_0000u32);
        assert_eq!(target_to_bits(&target).unwrap(), 0x04008000);
    }

    #[test]
    fn test_bits_above_chain_maximum_rejected() {
        assert!(bits_to_target(0x1d00ffff, MAINNET_HIGHEST_TARGET_BITS).is_ok());
        assert!(bits_to_target(0x1e00ffff, MAINNET_HIGHEST_TARGET_BITS).is_err());
        assert!(bits_to_target(0x1d010000, MAINNET_HIGHEST_TARGET_BITS).is_err());
        // A looser chain maximum admits the same bits.
        assert!(bits_to_target(0x1e00ffff, REGTEST_HIGHEST_TARGET_BITS).is_ok());
    }

    #[test]
    fn test_mantissa_out_of_range_is_structural() {
        let result = decode_target(0x1dffffff);
        assert!(matches!(result, Err(ChainError::Structural(_))));
    }

    #[test]
    fn test_exponent_out_of_range_is_structural() {
        assert!(decode_target(0x2100ffff).is_err());
        assert!(decode_target(0xff00ffff).is_err());
    }

    #[test]
    fn test_small_exponent_shifts_down() {
        // exponent 1: mantissa shifted right two bytes
        assert_eq!(decode_target(0x01120000).unwrap(), BigInt::from(0x12));
        assert_eq!(decode_target(0x00120000).unwrap(), BigInt::zero());
    }

    #[test]
    fn test_difficulty_one_at_highest_target() {
        let target = decode_target(0x1d00ffff).unwrap();
        let difficulty = target_to_difficulty(&target).unwrap();
        assert!((difficulty - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_known_historical_difficulty() {
        // Block 100,800's bits
        let target = decode_target(0x1b0404cb).unwrap();
        let difficulty = target_to_difficulty(&target).unwrap();
        let expected = 16307.420938524;
        assert!(
            ((difficulty - expected) / expected).abs() < 1e-9,
            "difficulty {difficulty}"
        );
    }

    #[test]
    fn test_difficulty_round_trip() {
        for bits in [0x1d00ffffu32, 0x1b0404cb, 0x1c05a3f4] {
            let target = decode_target(bits).unwrap();
            let difficulty = target_to_difficulty(&target).unwrap();
            let back = difficulty_to_target(difficulty).unwrap();
            let back_difficulty = target_to_difficulty(&back).unwrap();
            assert!(((back_difficulty - difficulty) / difficulty).abs() < 1e-9);
        }
    }

    #[test]
    fn test_difficulty_rejects_nonsense() {
        assert!(target_to_difficulty(&BigInt::zero()).is_err());
        assert!(target_to_difficulty(&BigInt::from(-5)).is_err());
        assert!(difficulty_to_target(0.0).is_err());
        assert!(difficulty_to_target(-1.0).is_err());
        assert!(difficulty_to_target(f64::NAN).is_err());
    }

    #[test]
    fn test_calculate_work_is_inverse_of_target() {
        // Easy target: roughly two expected attempts per block.
        let work = calculate_work(&header_with_bits(0x207fffff));
        assert_eq!(work, BigInt::from(2));

        // Harder target means more work.
        let hard = calculate_work(&header_with_bits(0x1d00ffff));
        assert!(hard > work);
    }

    #[test]
    fn test_calculate_work_sentinel_on_corrupt_bits() {
        assert_eq!(calculate_work(&header_with_bits(0)), BigInt::from(-1));
        assert_eq!(
            calculate_work(&header_with_bits(0xff00ffff)),
            BigInt::from(-1)
        );
        assert_eq!(
            calculate_work(&header_with_bits(0x1dffffff)),
            BigInt::from(-1)
        );
    }

    #[test]
    fn test_check_proof_of_work_easy_target() {
        // At the regtest maximum target roughly half of all hashes pass, and
        // any hash at all fails against a zero-mantissa target.
        let header = header_with_bits(REGTEST_HIGHEST_TARGET_BITS);
        let hash_value = BigInt::from_bytes_le(Sign::Plus, &header.hash());
        let target = decode_target(REGTEST_HIGHEST_TARGET_BITS).unwrap();
        let result = check_proof_of_work(&header, REGTEST_HIGHEST_TARGET_BITS);
        assert_eq!(result.is_ok(), hash_value <= target);
    }

    #[test]
    fn test_check_proof_of_work_corrupt_bits_is_error() {
        let header = header_with_bits(0x1dffffff);
        assert!(check_proof_of_work(&header, MAINNET_HIGHEST_TARGET_BITS).is_err());
    }
}
