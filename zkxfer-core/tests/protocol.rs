//! End-to-end protocol tests against the deterministic fixtures.

use std::sync::Arc;

use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use zkxfer_common::{address_digest, encode_u64_word, StageTag, MAX_FRIENDS, MERKLE_DEPTH};
use zkxfer_core::{
    client::{self, FriendSet},
    Blake3Compression, Compressor, Digest, InMemoryLedger, MerkleAccumulator, Notification,
    OracleError, ProtocolEngine, ProtocolError, RecordKind, VerificationTree, U256,
};
use zkxfer_test_fixtures::{
    friend, keypair, new_owner, nonce, reference_root, sample_invitations, sender, stranger, FailingHash,
    FailingSettlement, Scenario, ScriptedProofOracle, VerificationInputs, SAMPLE_PROOF,
};

#[test]
fn test_end_to_end_transfer() {
    let mut s = Scenario::new();
    let c = Compressor::new(Blake3Compression);

    // Sender side: friend tree and commitment root from the client builders.
    let friends = FriendSet::new(vec![friend(0), friend(1), friend(2)]).unwrap();
    let passphrase = client::passphrase_word("correct horse").unwrap();
    let threshold = U256::one();
    let commit_nonce = nonce(10);
    let extended = friends.extend(&passphrase, threshold, &commit_nonce);
    let friends_root = extended.merkle_root(&c).unwrap();
    let commitment_root =
        client::commit_root(&c, &friends_root, &passphrase, threshold, &commit_nonce).unwrap();
    let commitment_root_t =
        client::commit_root_t(&c, &friends_root, &passphrase, threshold, &new_owner()).unwrap();

    s.ledger.deposit(sender(), U256::from(500u64)).unwrap();
    let commit_index = s.engine.commit(
        commitment_root,
        U256::from(100u64),
        commit_nonce,
        sender(),
        "rent",
    );
    assert_eq!(commit_index, 0);

    // One sealed invitation per friend, padded and shuffled to MAX_FRIENDS.
    let mut rng = ChaCha20Rng::seed_from_u64(77);
    let friend_keys: Vec<_> = (0..3).map(|n| keypair(40 + n)).collect();
    let (owner_secret, owner_public) = keypair(50);
    let sealed = friends
        .friends()
        .iter()
        .zip(&friend_keys)
        .map(|(f, (_, pk))| client::invitation(pk, f, "please vouch", &mut rng).unwrap())
        .collect();
    let invitations = client::padded_invitations(sealed, &mut rng).unwrap();

    let pt = s
        .engine
        .pre_transfer(
            commit_index,
            commitment_root_t,
            SAMPLE_PROOF,
            invitations,
            new_owner(),
        )
        .unwrap();
    assert_eq!(pt, 0);

    // Friend 0 finds its invitation among the relayed payloads.
    let opened: Vec<_> = s
        .engine
        .notifications_since(0)
        .iter()
        .filter_map(|n| match &n.notification {
            Notification::InvitationIssued { payload } => {
                client::try_open_invitation(&friend_keys[0].0, payload)
            }
            _ => None,
        })
        .collect();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].friend, friend(0));
    assert_eq!(opened[0].note, "please vouch");

    // Friend 0 verifies and leaves a receipt only the new owner can read.
    let nonce1 = nonce(20);
    let nonce2 = nonce(21);
    let ptc = client::pre_transfer_commitment(&c, pt, &nonce1).unwrap();
    let digest = client::verification_digest(&c, &ptc, &friend(0), &nonce2).unwrap();
    let receipt = client::receipt(&owner_public, pt, &nonce1, &mut rng).unwrap();
    s.engine
        .verification(digest, ptc, nonce2, receipt, friend(0))
        .unwrap();
    let root = s.engine.current_root();
    assert_eq!(s.engine.root_history(), &[root]);

    let receipt = s
        .engine
        .notifications_since(0)
        .iter()
        .find_map(|n| match &n.notification {
            Notification::VerificationCreated { receipt, .. } => {
                client::try_open_receipt(&owner_secret, receipt)
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(receipt.pre_transfer_index, pt);
    assert_eq!(
        client::pre_transfer_commitment(&c, receipt.pre_transfer_index, &receipt.nonce).unwrap(),
        ptc
    );

    let slot = extended.resolve_slot(0).unwrap() as u64;
    s.engine
        .preparation(pt, slot, root, SAMPLE_PROOF, new_owner())
        .unwrap();
    assert_eq!(s.engine.verified_friends(pt).unwrap(), vec![slot as usize]);

    let amount = s.engine.transfer(pt, SAMPLE_PROOF, new_owner()).unwrap();
    assert_eq!(amount, U256::from(100u64));
    assert_eq!(s.ledger.balance_of(&sender()), U256::from(400u64));
    assert!(s.engine.commit_is_used(commit_index));

    let transfer_request = s.oracle.last_request().unwrap();
    assert_eq!(transfer_request.stage, StageTag::Transfer);
    let set_bits: Vec<usize> = transfer_request.fixed_inputs[1..]
        .iter()
        .enumerate()
        .filter(|(_, word)| word[31] == 1)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(set_bits, vec![slot as usize]);

    assert!(matches!(
        s.engine.pre_transfer(
            commit_index,
            commitment_root_t,
            SAMPLE_PROOF,
            sample_invitations(),
            new_owner()
        ),
        Err(ProtocolError::InvalidIndex {
            kind: RecordKind::Commit,
            index: 0
        })
    ));

    let kinds: Vec<&str> = s
        .engine
        .notifications_since(0)
        .iter()
        .map(|n| match n.notification {
            Notification::CommitCreated { .. } => "commit",
            Notification::Invalidated { .. } => "invalidated",
            Notification::PreTransferCreated { .. } => "pre_transfer",
            Notification::InvitationIssued { .. } => "invitation",
            Notification::VerificationCreated { .. } => "verification",
            Notification::TransferSettled { .. } => "transfer",
        })
        .collect();
    assert_eq!(kinds.len(), 4 + MAX_FRIENDS);
    assert_eq!(kinds[0], "commit");
    assert_eq!(kinds[1], "pre_transfer");
    assert!(kinds[2..2 + MAX_FRIENDS].iter().all(|k| *k == "invitation"));
    assert_eq!(kinds[2 + MAX_FRIENDS], "verification");
    assert_eq!(kinds[3 + MAX_FRIENDS], "transfer");
}

#[test]
fn test_invalidated_commit_is_final() {
    let mut s = Scenario::new();
    let index = s.funded_commit(100, 50);
    let pt = s.pre_transfer(index);

    assert!(matches!(
        s.engine.invalidate(index, stranger()),
        Err(ProtocolError::PermissionDenied { .. })
    ));
    s.engine.invalidate(index, sender()).unwrap();

    assert!(matches!(
        s.engine.invalidate(index, sender()),
        Err(ProtocolError::InvalidIndex { .. })
    ));
    assert!(matches!(
        s.engine.transfer(pt, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::InvalidIndex {
            kind: RecordKind::Commit,
            ..
        })
    ));
    let root = s.verify_as(pt, friend(1), 3);
    assert!(matches!(
        s.engine.preparation(pt, 0, root, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::InvalidIndex { .. })
    ));
    assert_eq!(s.ledger.balance_of(&sender()), U256::from(100u64));
}

#[test]
fn test_transferred_pre_transfer_is_consumed() {
    let mut s = Scenario::new();
    let index = s.funded_commit(10, 10);
    let pt = s.pre_transfer(index);
    s.engine.transfer(pt, SAMPLE_PROOF, new_owner()).unwrap();

    assert!(s.engine.pre_transfer_record(pt).unwrap().consumed);
    assert!(matches!(
        s.engine.transfer(pt, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::InvalidIndex {
            kind: RecordKind::PreTransfer,
            ..
        })
    ));
    assert!(matches!(
        s.engine.invalidate(index, sender()),
        Err(ProtocolError::InvalidIndex { .. })
    ));
}

#[test]
fn test_transfer_requires_pre_transfer_owner() {
    let mut s = Scenario::new();
    let index = s.funded_commit(10, 10);
    let pt = s.pre_transfer(index);

    assert!(matches!(
        s.engine.transfer(pt, SAMPLE_PROOF, sender()),
        Err(ProtocolError::PermissionDenied { .. })
    ));
    assert!(!s.engine.commit_is_used(index));
}

#[test]
fn test_preparation_is_idempotent_per_friend() {
    let mut s = Scenario::new();
    let index = s.funded_commit(10, 10);
    let pt = s.pre_transfer(index);
    let root = s.verify_as(pt, friend(0), 1);

    s.engine
        .preparation(pt, 3, root, SAMPLE_PROOF, new_owner())
        .unwrap();
    let frames_after_first = s.oracle.frames().len();
    assert!(matches!(
        s.engine.preparation(pt, 3, root, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::InvalidFriendIndex { index: 3 })
    ));
    assert_eq!(s.oracle.frames().len(), frames_after_first);
    assert_eq!(s.engine.verified_friends(pt).unwrap(), vec![3]);
}

#[test]
fn test_preparation_accepts_historical_roots() {
    let mut s = Scenario::new();
    let index = s.funded_commit(10, 10);
    let pt = s.pre_transfer(index);

    let first_root = s.verify_as(pt, friend(0), 1);
    for n in 1..5 {
        s.verify_as(pt, friend(n), 10 + u64::from(n));
    }
    assert_ne!(s.engine.current_root(), first_root);

    s.engine
        .preparation(pt, 0, first_root, SAMPLE_PROOF, new_owner())
        .unwrap();

    let request = s.oracle.last_request().unwrap();
    let commit = s.engine.commit_record(index).unwrap().clone();
    assert_eq!(request.stage, StageTag::Preparation);
    assert_eq!(
        request.fixed_inputs,
        vec![
            commit.commitment_root.to_fixed_bytes(),
            encode_u64_word(0),
            commit.nonce.to_fixed_bytes(),
            encode_u64_word(pt),
            first_root.to_fixed_bytes(),
        ]
    );
}

#[test]
fn test_root_history_is_monotonic() {
    let mut s = Scenario::new();
    let mut seen = Vec::new();
    for n in 0..6u8 {
        let root = s.verify_as(n as u64, friend(n), u64::from(n) * 2);
        seen.push(root);
        assert_eq!(s.engine.root_history().len(), seen.len());
        assert!(seen.iter().all(|r| s.engine.is_known_root(r)));
    }
    assert_eq!(s.engine.root_history(), seen.as_slice());
    assert_eq!(s.engine.verification_count(), 6);

    for i in 0..6 {
        let proof = s.engine.inclusion_proof(i).unwrap();
        assert_eq!(proof.root, s.engine.current_root());
        assert!(proof.verify(s.engine.compressor()).unwrap());
    }
}

#[test]
fn test_verification_from_wrong_caller_is_rejected() {
    let mut s = Scenario::new();
    let inputs = VerificationInputs::for_friend(s.engine.compressor(), 0, &friend(0), 5).unwrap();

    assert!(matches!(
        s.engine.verification(
            inputs.verification_digest,
            inputs.pre_transfer_commitment,
            inputs.nonce,
            vec![],
            friend(1),
        ),
        Err(ProtocolError::VerificationMismatch)
    ));
    assert_eq!(s.engine.verification_count(), 0);
    assert_eq!(s.engine.sequence(), 0);
}

#[test]
fn test_rejected_and_failed_proofs_have_no_effect() {
    let mut s = Scenario::new();
    let index = s.funded_commit(10, 10);
    let sequence = s.engine.sequence();

    s.oracle.reject(StageTag::PreTransfer);
    assert!(matches!(
        s.engine.pre_transfer(
            index,
            Digest::zero(),
            SAMPLE_PROOF,
            sample_invitations(),
            new_owner()
        ),
        Err(ProtocolError::InvalidProof {
            stage: StageTag::PreTransfer
        })
    ));

    s.oracle.accept(StageTag::PreTransfer);
    s.oracle.fail_with(OracleError::Unavailable("prover offline".into()));
    assert!(matches!(
        s.engine.pre_transfer(
            index,
            Digest::zero(),
            SAMPLE_PROOF,
            sample_invitations(),
            new_owner()
        ),
        Err(ProtocolError::Oracle(OracleError::Unavailable(_)))
    ));

    assert_eq!(s.engine.pre_transfer_count(), 0);
    assert_eq!(s.engine.sequence(), sequence);
    assert_eq!(s.engine.notifications_since(0).len(), 1);

    s.oracle.recover();
    assert_eq!(s.pre_transfer(index), 0);
}

#[test]
fn test_rejected_preparation_proof_has_no_effect() {
    let mut s = Scenario::new();
    let index = s.funded_commit(10, 10);
    let pt = s.pre_transfer(index);
    let root = s.verify_as(pt, friend(0), 1);
    let sequence = s.engine.sequence();
    let logged = s.engine.notifications_since(0).len();

    s.oracle.reject(StageTag::Preparation);
    assert!(matches!(
        s.engine.preparation(pt, 2, root, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::InvalidProof {
            stage: StageTag::Preparation
        })
    ));
    assert!(s.engine.verified_friends(pt).unwrap().is_empty());
    assert_eq!(s.engine.sequence(), sequence);

    s.oracle.accept(StageTag::Preparation);
    s.oracle.fail_with(OracleError::Unavailable("prover offline".into()));
    assert!(matches!(
        s.engine.preparation(pt, 2, root, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::Oracle(OracleError::Unavailable(_)))
    ));
    assert!(s.engine.verified_friends(pt).unwrap().is_empty());
    assert_eq!(s.engine.sequence(), sequence);
    assert_eq!(s.engine.notifications_since(0).len(), logged);

    s.oracle.recover();
    s.engine
        .preparation(pt, 2, root, SAMPLE_PROOF, new_owner())
        .unwrap();
    assert_eq!(s.engine.verified_friends(pt).unwrap(), vec![2]);
}

fn assert_transfer_left_no_trace(s: &Scenario, commit_index: u64, pt: u64, sequence: u64) {
    assert_eq!(s.ledger.balance_of(&sender()), U256::from(50u64));
    assert!(!s.engine.commit_is_used(commit_index));
    assert!(!s.engine.pre_transfer_record(pt).unwrap().consumed);
    assert_eq!(s.engine.sequence(), sequence);
    assert!(!s
        .engine
        .notifications_since(0)
        .iter()
        .any(|n| matches!(n.notification, Notification::TransferSettled { .. })));
}

#[test]
fn test_rejected_transfer_proof_has_no_effect() {
    let mut s = Scenario::new();
    let index = s.funded_commit(50, 20);
    let pt = s.pre_transfer(index);
    let sequence = s.engine.sequence();

    s.oracle.reject(StageTag::Transfer);
    assert!(matches!(
        s.engine.transfer(pt, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::InvalidProof {
            stage: StageTag::Transfer
        })
    ));
    assert_transfer_left_no_trace(&s, index, pt, sequence);

    s.oracle.accept(StageTag::Transfer);
    s.oracle.fail_with(OracleError::Unavailable("prover offline".into()));
    assert!(matches!(
        s.engine.transfer(pt, SAMPLE_PROOF, new_owner()),
        Err(ProtocolError::Oracle(OracleError::Unavailable(_)))
    ));
    assert_transfer_left_no_trace(&s, index, pt, sequence);

    s.oracle.recover();
    assert_eq!(
        s.engine.transfer(pt, SAMPLE_PROOF, new_owner()).unwrap(),
        U256::from(20u64)
    );
    assert_eq!(s.ledger.balance_of(&sender()), U256::from(30u64));
}

#[test]
fn test_hash_failure_mid_append_rolls_back() {
    let hash = FailingHash::new();
    let mut s = Scenario::with_hash(hash.clone());
    let good_root = s.verify_as(0, friend(0), 1);

    let inputs = VerificationInputs::for_friend(s.engine.compressor(), 0, &friend(1), 9).unwrap();
    // Two commitment hashes, then fail partway up the accumulator path.
    hash.arm(2 + 10);
    let err = s
        .engine
        .verification(
            inputs.verification_digest,
            inputs.pre_transfer_commitment,
            inputs.nonce,
            vec![],
            friend(1),
        )
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Oracle(_)));
    assert_eq!(err.suggested_status_code(), 502);

    assert_eq!(s.engine.verification_count(), 1);
    assert_eq!(s.engine.current_root(), good_root);
    assert_eq!(s.engine.root_history(), &[good_root]);
    assert!(matches!(
        s.engine.inclusion_proof(1),
        Err(ProtocolError::OutOfRange { index: 1, len: 1 })
    ));

    hash.disarm();
    let index = s
        .engine
        .verification(
            inputs.verification_digest,
            inputs.pre_transfer_commitment,
            inputs.nonce,
            vec![],
            friend(1),
        )
        .unwrap();
    assert_eq!(index, 1);
    assert_eq!(
        s.engine.current_root(),
        reference_root(
            &[
                s.engine.verification_record(0).unwrap().verification_digest,
                inputs.verification_digest
            ],
            MERKLE_DEPTH,
            s.engine.compressor()
        )
        .unwrap()
    );
}

#[test]
fn test_settlement_failure_rolls_back_transfer() {
    let oracle = ScriptedProofOracle::new();
    let mut engine = ProtocolEngine::new(oracle, FailingSettlement, Blake3Compression).unwrap();
    let index = engine.commit(Digest::zero(), U256::from(10u64), nonce(1), sender(), "");
    let pt = engine
        .pre_transfer(index, Digest::zero(), SAMPLE_PROOF, sample_invitations(), new_owner())
        .unwrap();
    let logged = engine.notifications_since(0).len();

    let err = engine.transfer(pt, SAMPLE_PROOF, new_owner()).unwrap_err();
    assert!(matches!(err, ProtocolError::Settlement(_)));
    assert!(!engine.commit_is_used(index));
    assert!(!engine.pre_transfer_record(pt).unwrap().consumed);
    assert_eq!(engine.notifications_since(0).len(), logged);
}

#[test]
fn test_ledger_settles_what_is_escrowed() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.deposit(sender(), U256::from(30u64)).unwrap();
    let mut engine =
        ProtocolEngine::new(ScriptedProofOracle::new(), Arc::clone(&ledger), Blake3Compression).unwrap();
    let index = engine.commit(Digest::zero(), U256::from(100u64), nonce(1), sender(), "");
    let pt = engine
        .pre_transfer(index, Digest::zero(), SAMPLE_PROOF, sample_invitations(), new_owner())
        .unwrap();

    assert_eq!(engine.transfer(pt, SAMPLE_PROOF, new_owner()).unwrap(), U256::from(30u64));
    assert!(ledger.balance_of(&sender()).is_zero());
}

#[test]
fn test_pre_transfer_binds_caller_digest() {
    let mut s = Scenario::new();
    let index = s.funded_commit(10, 10);
    s.pre_transfer(index);

    let request = s.oracle.last_request().unwrap();
    assert_eq!(request.fixed_inputs[2], address_digest(&new_owner()).to_fixed_bytes());
    assert_eq!(s.engine.pre_transfer_record(0).unwrap().owner, new_owner());
}

#[test]
fn test_null_digests_match_empty_reference_trees() {
    let c = Compressor::new(Blake3Compression);
    let tree = VerificationTree::new(&c).unwrap();
    assert_eq!(tree.null_digest(MERKLE_DEPTH), Some(Digest::zero()));
    for level in [0, 1, 16, 31] {
        assert_eq!(
            tree.null_digest(level).unwrap(),
            reference_root(&[], MERKLE_DEPTH - level, &c).unwrap()
        );
    }
}

fn leaves(max: usize) -> impl Strategy<Value = Vec<Digest>> {
    proptest::collection::vec(any::<[u8; 32]>().prop_map(Digest::from), 1..max)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_full_depth_root_matches_reference(leaves in leaves(12)) {
        let c = Compressor::new(Blake3Compression);
        let mut tree = VerificationTree::new(&c).unwrap();
        for (i, leaf) in leaves.iter().enumerate() {
            let (index, root) = tree.append(*leaf, &c).unwrap();
            prop_assert_eq!(index, i as u64);
            prop_assert_eq!(root, reference_root(&leaves[..=i], MERKLE_DEPTH, &c).unwrap());
        }
        for i in 0..leaves.len() as u64 {
            let proof = tree.inclusion_proof(i).unwrap();
            prop_assert_eq!(proof.compute_root(&c).unwrap(), tree.current_root());
        }
    }

    #[test]
    fn prop_small_tree_fills_to_capacity(leaves in leaves(17)) {
        let c = Compressor::new(Blake3Compression);
        let mut tree = MerkleAccumulator::<4>::new(&c).unwrap();
        for leaf in &leaves {
            tree.append(*leaf, &c).unwrap();
        }
        prop_assert_eq!(tree.current_root(), reference_root(&leaves, 4, &c).unwrap());

        let target = leaves.len() as u64 - 1;
        let mut proof = tree.inclusion_proof(target).unwrap();
        prop_assert!(proof.verify(&c).unwrap());
        proof.leaf = Digest::from(encode_u64_word(target + 1_000));
        prop_assert!(!proof.verify(&c).unwrap());
    }
}
