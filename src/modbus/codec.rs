//! MODBUS/TCP frame codec.
//!
//! An ADU is the 7-byte MBAP header followed by the PDU:
//!
//! ```text
//! | transaction id (2) | protocol id (2) | length (2) | unit id (1) | function (1) | data ... |
//! ```
//!
//! `length` counts every byte after itself (unit id + PDU). All multi-byte
//! fields are big-endian. Encoding and decoding are pure; `FrameBuffer`
//! is the only stateful piece and only reassembles the inbound stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::protocol::{
    FunctionCode, ModbusRequest, ModbusResponse, RequestPayload, ResponseBody, ResponseData,
    EXCEPTION_FLAG,
};
use crate::utils::error::ModbusError;

pub const MBAP_HEADER_LEN: usize = 7;
/// MBAP header plus at least a function code.
pub const MIN_ADU_LEN: usize = 8;
pub const MAX_ADU_LEN: usize = 260;
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Bytes preceding (and including) the length field.
const LENGTH_PREFIX_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

/// Builds the ADU for `request`. The length field and buffer size follow
/// the actual payload, so multi-value writes of any legal size encode
/// correctly.
pub fn encode(transaction_id: u16, request: &ModbusRequest) -> Result<Bytes, ModbusError> {
    request.validate()?;

    let pdu = encode_pdu(request);
    let length = (pdu.len() + 1) as u16;

    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(MODBUS_PROTOCOL_ID);
    frame.put_u16(length);
    frame.put_u8(request.unit_id);
    frame.extend_from_slice(&pdu);

    Ok(frame.freeze())
}

fn encode_pdu(request: &ModbusRequest) -> BytesMut {
    let mut pdu = BytesMut::with_capacity(pdu_len(&request.payload));
    pdu.put_u8(request.function.code());
    pdu.put_u16(request.address);

    match &request.payload {
        RequestPayload::Quantity(quantity) => pdu.put_u16(*quantity),
        RequestPayload::Register(value) => pdu.put_u16(*value),
        RequestPayload::Coil(on) => pdu.put_u16(if *on { 0xFF00 } else { 0x0000 }),
        RequestPayload::Registers(values) => {
            pdu.put_u16(values.len() as u16);
            pdu.put_u8((values.len() * 2) as u8);
            for value in values {
                pdu.put_u16(*value);
            }
        }
        RequestPayload::Coils(values) => {
            let packed = pack_bits(values);
            pdu.put_u16(values.len() as u16);
            pdu.put_u8(packed.len() as u8);
            pdu.extend_from_slice(&packed);
        }
    }

    pdu
}

fn pdu_len(payload: &RequestPayload) -> usize {
    match payload {
        RequestPayload::Quantity(_) | RequestPayload::Register(_) | RequestPayload::Coil(_) => 5,
        RequestPayload::Registers(values) => 6 + values.len() * 2,
        RequestPayload::Coils(values) => 6 + (values.len() + 7) / 8,
    }
}

/// Packs booleans LSB-first within each byte.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; (values.len() + 7) / 8];
    for (i, _) in values.iter().enumerate().filter(|(_, on)| **on) {
        packed[i / 8] |= 1 << (i % 8);
    }
    packed
}

/// Unpacks `count` booleans, LSB-first within each byte.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

/// Splits a complete ADU into its header and PDU.
///
/// Fails when the buffer is shorter than `MIN_ADU_LEN`, carries a
/// non-MODBUS protocol id, or when the declared length does not match the
/// bytes present.
pub fn parse_frame(buffer: &[u8]) -> Result<(MbapHeader, &[u8]), ModbusError> {
    if buffer.len() < MIN_ADU_LEN {
        return Err(ModbusError::FrameParse(format!(
            "frame too short: {} bytes",
            buffer.len()
        )));
    }

    let mut cursor = &buffer[..MBAP_HEADER_LEN];
    let header = MbapHeader {
        transaction_id: cursor.get_u16(),
        protocol_id: cursor.get_u16(),
        length: cursor.get_u16(),
        unit_id: cursor.get_u8(),
    };

    if header.protocol_id != MODBUS_PROTOCOL_ID {
        return Err(ModbusError::FrameParse(format!(
            "unexpected protocol id {}",
            header.protocol_id
        )));
    }

    if LENGTH_PREFIX_LEN + header.length as usize != buffer.len() {
        return Err(ModbusError::FrameParse(format!(
            "declared length {} does not match {} available bytes",
            header.length,
            buffer.len() - LENGTH_PREFIX_LEN
        )));
    }

    Ok((header, &buffer[MBAP_HEADER_LEN..]))
}

/// Decodes a response ADU against the request that produced it.
pub fn decode(buffer: &[u8], request: &ModbusRequest) -> Result<ModbusResponse, ModbusError> {
    let (header, pdu) = parse_frame(buffer)?;
    let function_code = pdu[0];
    let expected = request.function.code();

    if function_code & !EXCEPTION_FLAG != expected {
        return Err(ModbusError::FrameParse(format!(
            "function code 0x{:02X} does not answer 0x{:02X}",
            function_code, expected
        )));
    }

    let body = if function_code & EXCEPTION_FLAG != 0 {
        let code = *pdu.get(1).ok_or_else(|| {
            ModbusError::FrameParse("exception response without exception code".to_string())
        })?;
        ResponseBody::Exception(code)
    } else {
        ResponseBody::Data(decode_data(request, &pdu[1..])?)
    };

    Ok(ModbusResponse {
        transaction_id: header.transaction_id,
        unit_id: header.unit_id,
        function_code,
        body,
    })
}

fn decode_data(request: &ModbusRequest, data: &[u8]) -> Result<ResponseData, ModbusError> {
    let quantity = request.quantity() as usize;

    match request.function {
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let values = read_payload(data)?;
            if values.len() != quantity * 2 {
                return Err(ModbusError::FrameParse(format!(
                    "expected {} register bytes, got {}",
                    quantity * 2,
                    values.len()
                )));
            }
            Ok(ResponseData::Registers(
                values
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            ))
        }
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let values = read_payload(data)?;
            let needed = (quantity + 7) / 8;
            if values.len() < needed {
                return Err(ModbusError::FrameParse(format!(
                    "expected {} status bytes, got {}",
                    needed,
                    values.len()
                )));
            }
            Ok(ResponseData::Bits(unpack_bits(values, quantity)))
        }
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => {
            if data.len() != 4 {
                return Err(ModbusError::FrameParse(format!(
                    "write echo must be 4 bytes, got {}",
                    data.len()
                )));
            }
            let mut cursor = data;
            Ok(ResponseData::WriteAck {
                address: cursor.get_u16(),
                value: cursor.get_u16(),
            })
        }
    }
}

/// Returns the bytes announced by a read response's byte-count field.
fn read_payload(data: &[u8]) -> Result<&[u8], ModbusError> {
    let (&byte_count, rest) = data
        .split_first()
        .ok_or_else(|| ModbusError::FrameParse("read response without byte count".to_string()))?;
    if rest.len() != byte_count as usize {
        return Err(ModbusError::FrameParse(format!(
            "byte count {} does not match {} data bytes",
            byte_count,
            rest.len()
        )));
    }
    Ok(rest)
}

/// Reassembles ADUs from a TCP byte stream that may split or coalesce
/// frames arbitrarily.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_ADU_LEN * 2),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pops the next complete ADU, or `Ok(None)` until enough bytes arrive.
    ///
    /// A header that cannot belong to a MODBUS frame means the stream lost
    /// sync; the buffered bytes are discarded and an error returned.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ModbusError> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let protocol_id = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        let length = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;

        if protocol_id != MODBUS_PROTOCOL_ID || length < 2 || length > MAX_ADU_LEN - LENGTH_PREFIX_LEN {
            let discarded = self.buf.len();
            self.buf.clear();
            return Err(ModbusError::FrameParse(format!(
                "invalid MBAP header (protocol {}, length {}), discarded {} bytes",
                protocol_id, length, discarded
            )));
        }

        let total = LENGTH_PREFIX_LEN + length;
        if self.buf.len() < total {
            return Ok(None);
        }

        Ok(Some(self.buf.split_to(total).freeze()))
    }
}
