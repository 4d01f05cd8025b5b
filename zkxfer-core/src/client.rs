//! Client-side builders for the digests the engine checks.
//!
//! Nothing here produces proofs. These helpers derive the commitment roots,
//! the friend tree and the verification digests a sender or friend needs
//! before calling into the engine, using the same [`Compressor`] the engine
//! holds.

use ethers_core::types::{Address, H256, U256};
use rand::{seq::index, seq::SliceRandom, CryptoRng, Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use zkxfer_common::{
    address_digest, decode_u256, encode_u256, encode_u64_word, Word, FRIENDS_MERKLE_DEPTH,
    IDENTITY_BYTES, MAX_FRIENDS, WORD_BYTES,
};

use crate::{
    accumulator::{AccumulatorError, InclusionProof, MerkleAccumulator},
    envelope::{self, EnvelopeError, PublicKey, SecretKey, ENVELOPE_OVERHEAD},
    hash::{CompressionHash, Compressor},
    oracle::OracleError,
};

/// Tree over the extended friend slots.
pub type FriendTree = MerkleAccumulator<FRIENDS_MERKLE_DEPTH>;

/// Longest invitation note, in UTF-8 bytes. Shorter notes are padded with random bytes.
pub const MAX_NOTE_LEN: usize = 64;

/// Plaintext invitation: friend word, note length byte, padded note.
const INVITATION_PLAINTEXT_LEN: usize = WORD_BYTES + 1 + MAX_NOTE_LEN;

/// Every sealed invitation, and every filler entry, has this length.
pub const INVITATION_LEN: usize = INVITATION_PLAINTEXT_LEN + ENVELOPE_OVERHEAD;

const RECEIPT_PLAINTEXT_LEN: usize = 2 * WORD_BYTES;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{count} friends given, at most {MAX_FRIENDS} allowed")]
    TooManyFriends { count: usize },

    #[error("the zero address cannot be a friend")]
    NullFriend,

    #[error("passphrase is {len} bytes, at most {WORD_BYTES} allowed")]
    PassphraseTooLong { len: usize },

    #[error("friend slot {slot} is empty")]
    EmptySlot { slot: usize },

    #[error("friend index {index} does not resolve to a slot")]
    SlotOutOfRange { index: usize },

    #[error("hashing failed: {0}")]
    Hash(#[from] OracleError),

    #[error("friend tree: {0}")]
    Tree(#[from] AccumulatorError),

    #[error("note is {len} bytes, at most {MAX_NOTE_LEN} allowed")]
    NoteTooLong { len: usize },

    #[error("invitation is {len} bytes, expected {INVITATION_LEN}")]
    InvitationLength { len: usize },

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// A decrypted invitation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedInvitation {
    pub friend: Address,
    pub note: String,
}

/// A decrypted verification receipt: which pre-transfer the friend verified,
/// and the nonce behind its pre-transfer commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenedReceipt {
    pub pre_transfer_index: u64,
    pub nonce: H256,
}

/// A sender's friends, sorted and deduplicated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FriendSet {
    friends: Vec<Address>,
}

impl FriendSet {
    pub fn new(friends: impl IntoIterator<Item = Address>) -> Result<Self, ClientError> {
        let mut friends: Vec<Address> = friends.into_iter().collect();
        friends.sort();
        friends.dedup();
        if friends.len() > MAX_FRIENDS {
            return Err(ClientError::TooManyFriends {
                count: friends.len(),
            });
        }
        if friends.iter().any(|f| f.is_zero()) {
            return Err(ClientError::NullFriend);
        }
        Ok(Self { friends })
    }

    pub fn friends(&self) -> &[Address] {
        &self.friends
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }

    /// Scatter the friends over `MAX_FRIENDS` slots. Placement is a pure
    /// function of the inputs, so the sender can rebuild it at every stage.
    pub fn extend(&self, passphrase: &H256, threshold: U256, nonce: &H256) -> ExtendedFriends {
        let mut seed_input = Sha256::new();
        for friend in &self.friends {
            seed_input.update(friend.as_bytes());
        }
        seed_input.update(passphrase.as_bytes());
        seed_input.update(encode_u256(threshold));
        seed_input.update(nonce.as_bytes());
        let mut rng = ChaCha20Rng::from_seed(seed_input.finalize().into());

        let mut slots = [Address::zero(); MAX_FRIENDS];
        let placement = index::sample(&mut rng, MAX_FRIENDS, self.friends.len());
        for (friend, slot) in self.friends.iter().zip(placement.iter()) {
            slots[slot] = *friend;
        }

        ExtendedFriends {
            friends: self.friends.clone(),
            slots,
        }
    }
}

/// Friends placed at their slots; unused slots hold the zero address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedFriends {
    friends: Vec<Address>,
    slots: [Address; MAX_FRIENDS],
}

impl ExtendedFriends {
    pub fn slots(&self) -> &[Address; MAX_FRIENDS] {
        &self.slots
    }

    pub fn friend_at(&self, slot: usize) -> Result<Address, ClientError> {
        match self.slots.get(slot) {
            Some(friend) if !friend.is_zero() => Ok(*friend),
            Some(_) => Err(ClientError::EmptySlot { slot }),
            None => Err(ClientError::SlotOutOfRange { index: slot }),
        }
    }

    /// Map a friend position to its slot. Positions `0..len` name the sorted
    /// friends; positions past that name the empty slots in order.
    pub fn resolve_slot(&self, friend_index: usize) -> Result<usize, ClientError> {
        if let Some(friend) = self.friends.get(friend_index) {
            return self
                .slots
                .iter()
                .position(|slot| slot == friend)
                .ok_or(ClientError::SlotOutOfRange {
                    index: friend_index,
                });
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_zero())
            .nth(friend_index - self.friends.len())
            .map(|(slot, _)| slot)
            .ok_or(ClientError::SlotOutOfRange {
                index: friend_index,
            })
    }

    pub fn tree<H: CompressionHash>(&self, compressor: &Compressor<H>) -> Result<FriendTree, ClientError> {
        let mut tree = FriendTree::new(compressor)?;
        for friend in &self.slots {
            tree.append(address_digest(friend), compressor)?;
        }
        Ok(tree)
    }

    pub fn merkle_root<H: CompressionHash>(&self, compressor: &Compressor<H>) -> Result<H256, ClientError> {
        Ok(self.tree(compressor)?.current_root())
    }

    pub fn merkle_proof<H: CompressionHash>(
        &self,
        slot: usize,
        compressor: &Compressor<H>,
    ) -> Result<InclusionProof<FRIENDS_MERKLE_DEPTH>, ClientError> {
        if slot >= MAX_FRIENDS {
            return Err(ClientError::SlotOutOfRange { index: slot });
        }
        Ok(self.tree(compressor)?.inclusion_proof(slot as u64)?)
    }
}

/// Root a sender commits to.
pub fn commit_root<H: CompressionHash>(
    compressor: &Compressor<H>,
    friends_root: &H256,
    passphrase: &H256,
    threshold: U256,
    nonce: &H256,
) -> Result<H256, ClientError> {
    Ok(compressor.accumulate(&[*friends_root, *passphrase, H256(encode_u256(threshold)), *nonce])?)
}

/// Root binding the same plan to the new owner, proven in a pre-transfer.
pub fn commit_root_t<H: CompressionHash>(
    compressor: &Compressor<H>,
    friends_root: &H256,
    passphrase: &H256,
    threshold: U256,
    new_owner: &Address,
) -> Result<H256, ClientError> {
    Ok(compressor.accumulate(&[
        *friends_root,
        *passphrase,
        H256(encode_u256(threshold)),
        address_digest(new_owner),
    ])?)
}

pub fn pre_transfer_commitment<H: CompressionHash>(
    compressor: &Compressor<H>,
    pre_transfer_index: u64,
    nonce: &H256,
) -> Result<H256, ClientError> {
    Ok(compressor.accumulate(&[H256(encode_u64_word(pre_transfer_index)), *nonce])?)
}

/// The digest a friend submits; equals the engine's recomputation for `friend`.
pub fn verification_digest<H: CompressionHash>(
    compressor: &Compressor<H>,
    pre_transfer_commitment: &H256,
    friend: &Address,
    nonce: &H256,
) -> Result<H256, ClientError> {
    Ok(compressor.accumulate(&[*pre_transfer_commitment, address_digest(friend), *nonce])?)
}

/// UTF-8 bytes right-padded with zeros to a word.
pub fn passphrase_word(passphrase: &str) -> Result<H256, ClientError> {
    let bytes = passphrase.as_bytes();
    if bytes.len() > WORD_BYTES {
        return Err(ClientError::PassphraseTooLong { len: bytes.len() });
    }
    let mut word = [0u8; WORD_BYTES];
    word[..bytes.len()].copy_from_slice(bytes);
    Ok(H256(word))
}

pub fn random_nonce() -> H256 {
    nonce_from_rng(&mut rand::thread_rng())
}

/// 31 random bytes and a trailing zero, so the value stays below a 255-bit field modulus.
pub fn nonce_from_rng<R: Rng>(rng: &mut R) -> H256 {
    let mut nonce = [0u8; WORD_BYTES];
    rng.fill(&mut nonce[..WORD_BYTES - 1]);
    H256(nonce)
}

/// Invitation for `friend`, sealed to the friend's public key.
pub fn invitation<R: RngCore + CryptoRng>(
    recipient: &PublicKey,
    friend: &Address,
    note: &str,
    rng: &mut R,
) -> Result<Vec<u8>, ClientError> {
    let note = note.as_bytes();
    if note.len() > MAX_NOTE_LEN {
        return Err(ClientError::NoteTooLong { len: note.len() });
    }
    let mut plaintext = [0u8; INVITATION_PLAINTEXT_LEN];
    plaintext[..WORD_BYTES].copy_from_slice(address_digest(friend).as_bytes());
    plaintext[WORD_BYTES] = note.len() as u8;
    let body = &mut plaintext[WORD_BYTES + 1..];
    body[..note.len()].copy_from_slice(note);
    rng.fill_bytes(&mut body[note.len()..]);
    Ok(envelope::seal(recipient, &plaintext, rng)?)
}

/// Fill `sealed` up to `MAX_FRIENDS` entries with random blobs of the same
/// length and shuffle, so occupied entries cannot be told from filler.
pub fn padded_invitations<R: RngCore + CryptoRng>(
    sealed: Vec<Vec<u8>>,
    rng: &mut R,
) -> Result<[Vec<u8>; MAX_FRIENDS], ClientError> {
    if sealed.len() > MAX_FRIENDS {
        return Err(ClientError::TooManyFriends { count: sealed.len() });
    }
    if let Some(bad) = sealed.iter().find(|inv| inv.len() != INVITATION_LEN) {
        return Err(ClientError::InvitationLength { len: bad.len() });
    }

    let mut all = sealed;
    while all.len() < MAX_FRIENDS {
        let mut filler = vec![0u8; INVITATION_LEN];
        rng.fill_bytes(&mut filler);
        // Same leading byte a compressed SEC1 point carries.
        filler[0] = 0x02 | (filler[0] & 0x01);
        all.push(filler);
    }
    all.shuffle(rng);
    all.try_into()
        .map_err(|all: Vec<Vec<u8>>| ClientError::TooManyFriends { count: all.len() })
}

/// Open one invitation payload. `None` for filler or invitations sealed to
/// another key.
pub fn try_open_invitation(secret: &SecretKey, payload: &[u8]) -> Option<OpenedInvitation> {
    let plaintext = envelope::open(secret, payload).ok()?;
    if plaintext.len() != INVITATION_PLAINTEXT_LEN {
        return None;
    }
    let (word, rest) = plaintext.split_at(WORD_BYTES);
    if word[..WORD_BYTES - IDENTITY_BYTES].iter().any(|b| *b != 0) {
        return None;
    }
    let note_len = usize::from(rest[0]);
    if note_len > MAX_NOTE_LEN {
        return None;
    }
    let note = std::str::from_utf8(&rest[1..1 + note_len]).ok()?;
    Some(OpenedInvitation {
        friend: Address::from_slice(&word[WORD_BYTES - IDENTITY_BYTES..]),
        note: note.to_owned(),
    })
}

/// Receipt a friend attaches to a verification, sealed to the new owner so
/// they can rebuild the pre-transfer commitment for their preparation proof.
pub fn receipt<R: RngCore + CryptoRng>(
    new_owner: &PublicKey,
    pre_transfer_index: u64,
    nonce: &H256,
    rng: &mut R,
) -> Result<Vec<u8>, ClientError> {
    let mut plaintext = [0u8; RECEIPT_PLAINTEXT_LEN];
    plaintext[..WORD_BYTES].copy_from_slice(&encode_u64_word(pre_transfer_index));
    plaintext[WORD_BYTES..].copy_from_slice(nonce.as_bytes());
    Ok(envelope::seal(new_owner, &plaintext, rng)?)
}

pub fn try_open_receipt(secret: &SecretKey, payload: &[u8]) -> Option<OpenedReceipt> {
    let plaintext = envelope::open(secret, payload).ok()?;
    if plaintext.len() != RECEIPT_PLAINTEXT_LEN {
        return None;
    }
    let mut index: Word = [0u8; WORD_BYTES];
    index.copy_from_slice(&plaintext[..WORD_BYTES]);
    let index = decode_u256(&index);
    if index > U256::from(u64::MAX) {
        return None;
    }
    Some(OpenedReceipt {
        pre_transfer_index: index.low_u64(),
        nonce: H256::from_slice(&plaintext[WORD_BYTES..]),
    })
}
