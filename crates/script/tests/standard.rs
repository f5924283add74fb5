use ledgerd_primitives::hash::hash160;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut};
use ledgerd_script::ops::push_data;
use ledgerd_script::standard::{
    classify_script_pubkey, extract_destination, p2pkh_script, p2sh_script, Destination,
    ScriptType,
};
use ledgerd_script::verify::{CommitmentVerifier, ScriptError, ScriptVerifier};

#[test]
fn classify_p2pkh() {
    let script = p2pkh_script(&[0x11; 20]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pkh);
    assert_eq!(
        extract_destination(&script),
        Some(Destination::PubKeyHash([0x11; 20]))
    );
}

#[test]
fn classify_p2sh() {
    let script = p2sh_script(&[0x22; 20]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Sh);
    assert_eq!(
        extract_destination(&script),
        Some(Destination::ScriptHash([0x22; 20]))
    );
}

#[test]
fn classify_witness_programs() {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&[0x33; 20]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Wpkh);
    assert_eq!(extract_destination(&script), None);

    let mut script = vec![0x00, 0x20];
    script.extend_from_slice(&[0x44; 32]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Wsh);
}

#[test]
fn p2pk_shares_address_with_p2pkh() {
    let key = [0x02; 33];
    let mut script = vec![33];
    script.extend_from_slice(&key);
    script.push(0xac);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pk);
    assert_eq!(
        extract_destination(&script),
        extract_destination(&p2pkh_script(&hash160(&key)))
    );
}

#[test]
fn classify_null_data() {
    let script = vec![0x6a, 0x01, 0x01];
    assert_eq!(classify_script_pubkey(&script), ScriptType::NullData);
    assert_eq!(classify_script_pubkey(&[0x51]), ScriptType::Unknown);
}

#[test]
fn destination_key_roundtrip() {
    let dest = Destination::ScriptHash([9u8; 20]);
    let key = dest.to_key();
    assert_eq!(key[0], 1);
    assert_eq!(Destination::from_key(&key), Some(dest));
    assert_eq!(Destination::from_key(&key[..20]), None);
}

fn spending_tx(script_sig: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([1u8; 32], 0),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 1,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[test]
fn p2pkh_spend_must_reveal_committed_key() {
    let key = [0x03u8; 33];
    let script_pubkey = p2pkh_script(&hash160(&key));
    let verifier = CommitmentVerifier;

    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &[0x30; 71]);
    push_data(&mut script_sig, &key);
    verifier
        .verify_input(&script_pubkey, &spending_tx(script_sig), 0)
        .expect("matching key");

    let mut wrong = Vec::new();
    push_data(&mut wrong, &[0x30; 71]);
    push_data(&mut wrong, &[0x04; 33]);
    assert_eq!(
        verifier.verify_input(&script_pubkey, &spending_tx(wrong), 0),
        Err(ScriptError::CommitmentMismatch)
    );

    let mut not_push_only = Vec::new();
    push_data(&mut not_push_only, &key);
    not_push_only.push(0x76);
    assert_eq!(
        verifier.verify_input(&script_pubkey, &spending_tx(not_push_only), 0),
        Err(ScriptError::SigPushOnly)
    );

    assert_eq!(
        verifier.verify_input(&script_pubkey, &spending_tx(Vec::new()), 0),
        Err(ScriptError::MissingPush)
    );
}

#[test]
fn p2sh_spend_must_reveal_redeem_script() {
    let redeem_script = vec![0x51];
    let script_pubkey = p2sh_script(&hash160(&redeem_script));
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &redeem_script);
    CommitmentVerifier
        .verify_input(&script_pubkey, &spending_tx(script_sig), 0)
        .expect("redeem script");
}

#[test]
fn null_data_is_never_spendable() {
    let verifier = CommitmentVerifier;
    assert_eq!(
        verifier.verify_input(&[0x6a], &spending_tx(vec![0x51]), 0),
        Err(ScriptError::Unspendable)
    );
    assert_eq!(
        verifier.verify_input(&[0x51], &spending_tx(vec![0x51]), 3),
        Err(ScriptError::InputIndex)
    );
}

#[test]
fn signature_bytes_are_not_checked() {
    let key = [0x03u8; 33];
    let script_pubkey = p2pkh_script(&hash160(&key));
    for signature in [vec![0u8; 71], vec![0xff; 9], Vec::new()] {
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &signature);
        push_data(&mut script_sig, &key);
        CommitmentVerifier
            .verify_input(&script_pubkey, &spending_tx(script_sig), 0)
            .expect("commitment alone authorizes");
    }
}
