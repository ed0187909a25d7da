//! Bounds-checked readers for fixed-layout structures.

use crate::error::{constants, ProtocolError, Result};
use crate::types::{GroupId, GroupIdentity, Identity, MessageId, IDENTITY_LENGTH};
use bytes::Buf;

#[inline]
pub(crate) fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::DecodeError(format!(
            "{}: need {needed} bytes, have {}",
            constants::ERR_TRUNCATED_PAYLOAD,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn read_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn read_u64(buf: &mut &[u8]) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub(crate) fn read_bytes<'a>(buf: &mut &'a [u8], length: usize) -> Result<&'a [u8]> {
    ensure(buf, length)?;
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(length);
    *buf = tail;
    Ok(head)
}

pub(crate) fn read_identity(buf: &mut &[u8]) -> Result<Identity> {
    Identity::from_bytes(read_array::<IDENTITY_LENGTH>(buf)?)
}

pub(crate) fn read_message_id(buf: &mut &[u8]) -> Result<MessageId> {
    Ok(MessageId(read_u64(buf)?))
}

pub(crate) fn read_group(buf: &mut &[u8]) -> Result<GroupIdentity> {
    let creator = read_identity(buf)?;
    let group_id = GroupId(read_u64(buf)?);
    Ok(GroupIdentity { creator, group_id })
}

pub(crate) fn read_utf8(buf: &[u8]) -> Result<String> {
    String::from_utf8(buf.to_vec())
        .map_err(|e| ProtocolError::DecodeError(format!("Invalid UTF-8: {e}")))
}

pub(crate) fn write_group(out: &mut Vec<u8>, group: &GroupIdentity) {
    out.extend_from_slice(group.creator.as_bytes());
    out.extend_from_slice(&group.group_id.0.to_le_bytes());
}
