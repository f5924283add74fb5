use ledgerd_consensus::{consensus_params, Network};
use ledgerd_pow::difficulty::{
    block_proof, compact_to_target, hash_meets_target, target_to_compact, CompactError,
};
use ledgerd_pow::validation::{check_pow, validate_pow_header, PowError};
use ledgerd_primitives::genesis_block;

#[test]
fn regtest_limit_expands_to_top_bytes() {
    let target = compact_to_target(0x207fffff).expect("target");
    assert!(target[..29].iter().all(|byte| *byte == 0));
    assert_eq!(&target[29..], &[0xff, 0xff, 0x7f]);
    assert_eq!(target_to_compact(&target), 0x207fffff);
}

#[test]
fn compact_sign_and_overflow_are_rejected() {
    assert_eq!(compact_to_target(0x04923456), Err(CompactError::Negative));
    assert_eq!(compact_to_target(0xff123456), Err(CompactError::Overflow));
    // A zero mantissa is zero whatever the sign bit says.
    assert_eq!(compact_to_target(0x01800000), Ok([0u8; 32]));
}

#[test]
fn targets_compare_as_little_endian_numbers() {
    let mut target = [0u8; 32];
    target[31] = 0x01;
    let mut low_hash = [0xffu8; 32];
    low_hash[31] = 0x00;
    assert!(hash_meets_target(&low_hash, &target));
    assert!(hash_meets_target(&target, &target));
    assert!(!hash_meets_target(&[0xffu8; 32], &target));
}

#[test]
fn genesis_headers_carry_valid_work() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        let params = consensus_params(network);
        let block = genesis_block(&params);
        validate_pow_header(&block.header, &params).expect("genesis pow");
        assert!(!block_proof(block.header.bits).expect("proof").is_zero());
    }
}

#[test]
fn rejects_unmined_and_out_of_range_headers() {
    let params = consensus_params(Network::Mainnet);
    let header = genesis_block(&params).header;
    let hash = header.hash();
    check_pow(&hash, header.bits, &params).expect("genesis target");

    assert_eq!(check_pow(&[0xff; 32], header.bits, &params), Err(PowError::HighHash));
    assert_eq!(
        check_pow(&hash, 0x207fffff, &params),
        Err(PowError::AboveLimit { bits: 0x207fffff })
    );
    assert_eq!(check_pow(&hash, 0, &params), Err(PowError::ZeroTarget));
    assert_eq!(
        check_pow(&hash, 0x04923456, &params),
        Err(PowError::Compact(CompactError::Negative))
    );
}
