//! Payload codec for destination handlers
//!
//! Every integer is a big-endian, left-padded 32-byte word and every dynamic
//! field is preceded by its length as a 32-byte word:
//!
//! - Fungible:    `amount ++ len(recipient) ++ recipient`
//! - NonFungible: `tokenID ++ len(recipient) ++ recipient ++ len(metadata) ++ metadata`
//! - Generic:     `len(metadata) ++ metadata`
//!
//! [`encode`] builds proposal data for the writer. [`decode`] reads the same
//! layout back out of a deposit event's `data` field for the listener.

use alloy::primitives::{Bytes, U256};
use thiserror::Error;

use crate::types::{Payload, TransferType};

const WORD: usize = 32;

/// Encoding failures. Never retryable: the message is dropped and reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("message declares {declared} transfer but carries a {actual} payload")]
    TransferTypeMismatch {
        declared: TransferType,
        actual: TransferType,
    },
}

/// Deposit data that does not follow the handler layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{transfer_type} data truncated: need {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        transfer_type: TransferType,
        offset: usize,
        needed: usize,
        len: usize,
    },
    #[error("{transfer_type} data has a length prefix that does not fit in memory")]
    LengthOverflow { transfer_type: TransferType },
    #[error("{transfer_type} data has {extra} unexpected trailing bytes")]
    TrailingBytes {
        transfer_type: TransferType,
        extra: usize,
    },
}

/// Encode a payload into the byte layout its destination handler expects.
///
/// `transfer_type` must agree with the payload variant; nothing is encoded
/// otherwise.
pub fn encode(transfer_type: TransferType, payload: &Payload) -> Result<Bytes, EncodingError> {
    let actual = payload.transfer_type();
    if actual != transfer_type {
        return Err(EncodingError::TransferTypeMismatch {
            declared: transfer_type,
            actual,
        });
    }

    let mut out = Vec::new();
    match payload {
        Payload::Fungible { amount, recipient } => {
            out.reserve(2 * WORD + recipient.len());
            push_word(&mut out, *amount);
            push_dynamic(&mut out, recipient);
        }
        Payload::NonFungible {
            token_id,
            recipient,
            metadata,
        } => {
            out.reserve(3 * WORD + recipient.len() + metadata.len());
            push_word(&mut out, *token_id);
            push_dynamic(&mut out, recipient);
            push_dynamic(&mut out, metadata);
        }
        Payload::Generic { metadata } => {
            out.reserve(WORD + metadata.len());
            push_dynamic(&mut out, metadata);
        }
    }

    Ok(Bytes::from(out))
}

/// Decode handler calldata back into a typed payload.
///
/// The non-fungible metadata section is optional: data that ends right after
/// the recipient decodes with empty metadata.
pub fn decode(transfer_type: TransferType, data: &[u8]) -> Result<Payload, DecodeError> {
    let mut reader = Reader {
        transfer_type,
        data,
        offset: 0,
    };

    let payload = match transfer_type {
        TransferType::Fungible => {
            let amount = reader.word()?;
            let recipient = reader.dynamic()?;
            Payload::Fungible { amount, recipient }
        }
        TransferType::NonFungible => {
            let token_id = reader.word()?;
            let recipient = reader.dynamic()?;
            let metadata = if reader.remaining() == 0 {
                Bytes::new()
            } else {
                reader.dynamic()?
            };
            Payload::NonFungible {
                token_id,
                recipient,
                metadata,
            }
        }
        TransferType::Generic => {
            let metadata = reader.dynamic()?;
            Payload::Generic { metadata }
        }
    };

    reader.finish()?;
    Ok(payload)
}

fn push_word(out: &mut Vec<u8>, value: U256) {
    out.extend_from_slice(&value.to_be_bytes::<WORD>());
}

fn push_dynamic(out: &mut Vec<u8>, bytes: &[u8]) {
    push_word(out, U256::from(bytes.len()));
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    transfer_type: TransferType,
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::Truncated {
                transfer_type: self.transfer_type,
                offset: self.offset,
                needed,
                len: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    fn word(&mut self) -> Result<U256, DecodeError> {
        Ok(U256::from_be_slice(self.take(WORD)?))
    }

    fn dynamic(&mut self) -> Result<Bytes, DecodeError> {
        let len: usize = self
            .word()?
            .try_into()
            .map_err(|_| DecodeError::LengthOverflow {
                transfer_type: self.transfer_type,
            })?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes {
                transfer_type: self.transfer_type,
                extra,
            }),
        }
    }
}
