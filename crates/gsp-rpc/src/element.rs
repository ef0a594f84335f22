//! Element framing: element header, RPC record, zero padding and checksum.

use crate::checksum;
use crate::error::TransportFault;
use crate::layout::{align_up, MsgElementHeader, MAX_ELEMENT_SLOTS};
use crate::message::RpcMessage;

/// Builds the final, checksummed image of one element.
///
/// The image is padded to a whole number of `page_size` slots.
pub fn encode(seq: u32, msg: &RpcMessage, page_size: usize) -> Vec<u8> {
    let raw_len = MsgElementHeader::SIZE_BYTES + msg.record_len();
    let padded = align_up(raw_len, page_size);
    let mut out = vec![0u8; padded];

    let header = MsgElementHeader {
        seq_num: seq,
        elem_count: (padded / page_size) as u32,
        ..Default::default()
    };
    out[..MsgElementHeader::SIZE_BYTES].copy_from_slice(bytemuck::bytes_of(&header));
    out[MsgElementHeader::SIZE_BYTES..raw_len].copy_from_slice(&msg.encode_record());
    checksum::stamp(&mut out);
    out
}

pub fn header(element: &[u8]) -> Result<MsgElementHeader, TransportFault> {
    if element.len() < MsgElementHeader::SIZE_BYTES {
        return Err(TransportFault::Malformed("element shorter than its header"));
    }
    Ok(bytemuck::pod_read_unaligned(&element[..MsgElementHeader::SIZE_BYTES]))
}

/// Number of slots an element claims, validated against the ring.
pub fn slot_count(header: &MsgElementHeader, occupied: u32) -> Result<u32, TransportFault> {
    let count = header.elem_count;
    if count == 0 || count as usize > MAX_ELEMENT_SLOTS {
        return Err(TransportFault::Desync("element count out of range"));
    }
    if count > occupied {
        return Err(TransportFault::Desync("element count exceeds occupied slots"));
    }
    Ok(count)
}

/// Parses the record carried by a verified element.
pub fn decode(element: &[u8]) -> Result<(MsgElementHeader, RpcMessage), TransportFault> {
    let header = header(element)?;
    let msg = RpcMessage::decode_record(&element[MsgElementHeader::SIZE_BYTES..])?;
    Ok((header, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Function, RESULT_SUCCESS};

    #[test]
    fn small_message_fills_one_slot() {
        let msg = RpcMessage::response(Function(42), RESULT_SUCCESS, b"AB".to_vec());
        let element = encode(7, &msg, 64);
        assert_eq!(element.len(), 64);
        assert!(checksum::verify(&element));

        let (hdr, decoded) = decode(&element).unwrap();
        assert_eq!(hdr.seq_num, 7);
        assert_eq!(hdr.elem_count, 1);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn element_spans_slots() {
        let msg = RpcMessage::new(Function::GSP_RM_CONTROL, vec![0x5a; 100]);
        let element = encode(0, &msg, 64);
        // 44 + 16 + 100 = 160 bytes
        assert_eq!(element.len(), 192);
        assert_eq!(header(&element).unwrap().elem_count, 3);
    }

    #[test]
    fn slot_count_is_bounded() {
        let mut hdr = MsgElementHeader {
            elem_count: 0,
            ..Default::default()
        };
        assert!(slot_count(&hdr, 4).is_err());
        hdr.elem_count = 17;
        assert!(slot_count(&hdr, 32).is_err());
        hdr.elem_count = 3;
        assert!(slot_count(&hdr, 2).is_err());
        assert_eq!(slot_count(&hdr, 3).unwrap(), 3);
    }
}
