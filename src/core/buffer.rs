//! Caller-owned result of an encode call.
//!
//! The buffer is decoder code followed by the encoded payload, optionally
//! followed by a trailer the decoder needs after the payload (terminators,
//! the tail of a call-over layout). It is a plain owned value: the engine
//! keeps no reference to it once `encode` returns, and
//! [`OutputBuffer::release`] is the explicit consuming release that mirrors
//! `sgn_free_byte_array` on the C side.

use std::ops::{Deref, Range};

use super::error::AllocationFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    /// Where the encoded payload sits; control enters the payload at `payload.start`.
    payload: Range<usize>,
}

impl OutputBuffer {
    /// Concatenate `stub` and `encoded_payload` into a freshly reserved buffer.
    pub(crate) fn assemble(stub: &[u8], encoded_payload: &[u8]) -> Result<Self, AllocationFailure> {
        Self::assemble_parts(stub, encoded_payload, &[])
    }

    /// Concatenate `prefix`, `encoded_payload` and `trailer`.
    pub(crate) fn assemble_parts(
        prefix: &[u8],
        encoded_payload: &[u8],
        trailer: &[u8],
    ) -> Result<Self, AllocationFailure> {
        let requested = prefix
            .len()
            .checked_add(encoded_payload.len())
            .and_then(|len| len.checked_add(trailer.len()))
            .ok_or(AllocationFailure { requested: usize::MAX })?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(requested)
            .map_err(|_| AllocationFailure { requested })?;
        bytes.extend_from_slice(prefix);
        bytes.extend_from_slice(encoded_payload);
        bytes.extend_from_slice(trailer);

        let start = prefix.len();
        Ok(Self {
            bytes,
            payload: start..start + encoded_payload.len(),
        })
    }

    /// Whole buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decoder bytes in front of the payload.
    pub fn stub(&self) -> &[u8] {
        &self.bytes[..self.payload.start]
    }

    /// Encoded payload; same length as the input payload.
    pub fn encoded_payload(&self) -> &[u8] {
        &self.bytes[self.payload.clone()]
    }

    /// Bytes after the payload; empty for SGN output.
    pub fn trailer(&self) -> &[u8] {
        &self.bytes[self.payload.end..]
    }

    pub fn payload_range(&self) -> Range<usize> {
        self.payload.clone()
    }

    pub fn stub_len(&self) -> usize {
        self.payload.start
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Take ownership of the raw bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// Release the buffer. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for OutputBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for OutputBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
