//! ATT PDU encoding and decoding

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::constants::*;
use super::error::{AttErrorCode, DecodeError, EncodeError};

/// One Attribute Protocol PDU.
///
/// Covers the client-side subset of ATT: MTU exchange, reads, writes, the
/// write command, value notifications/indications and the indication
/// confirmation, plus the Error Response. Every request variant pairs with
/// exactly one response variant (or an Error Response); notifications and
/// indications carry no request correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorResponse {
        request_opcode: u8,
        handle: u16,
        error_code: AttErrorCode,
    },
    ExchangeMtuRequest {
        client_mtu: u16,
    },
    ExchangeMtuResponse {
        server_mtu: u16,
    },
    ReadRequest {
        handle: u16,
    },
    ReadResponse {
        value: Vec<u8>,
    },
    WriteRequest {
        handle: u16,
        value: Vec<u8>,
    },
    WriteResponse,
    WriteCommand {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueNotification {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueIndication {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueConfirmation,
}

impl AttPdu {
    /// Wire opcode for this PDU.
    pub fn opcode(&self) -> u8 {
        match self {
            AttPdu::ErrorResponse { .. } => ATT_ERROR_RSP,
            AttPdu::ExchangeMtuRequest { .. } => ATT_EXCHANGE_MTU_REQ,
            AttPdu::ExchangeMtuResponse { .. } => ATT_EXCHANGE_MTU_RSP,
            AttPdu::ReadRequest { .. } => ATT_READ_REQ,
            AttPdu::ReadResponse { .. } => ATT_READ_RSP,
            AttPdu::WriteRequest { .. } => ATT_WRITE_REQ,
            AttPdu::WriteResponse => ATT_WRITE_RSP,
            AttPdu::WriteCommand { .. } => ATT_WRITE_CMD,
            AttPdu::HandleValueNotification { .. } => ATT_HANDLE_VALUE_NTF,
            AttPdu::HandleValueIndication { .. } => ATT_HANDLE_VALUE_IND,
            AttPdu::HandleValueConfirmation => ATT_HANDLE_VALUE_CONF,
        }
    }

    /// The response opcode a request opcode pairs with, if it is a request.
    pub fn response_opcode_for(request_opcode: u8) -> Option<u8> {
        match request_opcode {
            ATT_EXCHANGE_MTU_REQ => Some(ATT_EXCHANGE_MTU_RSP),
            ATT_READ_REQ => Some(ATT_READ_RSP),
            ATT_WRITE_REQ => Some(ATT_WRITE_RSP),
            _ => None,
        }
    }

    /// Whether this PDU is a request that expects a response.
    pub fn is_request(&self) -> bool {
        Self::response_opcode_for(self.opcode()).is_some()
    }

    /// Whether this PDU is a peer-initiated value push.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            AttPdu::HandleValueNotification { .. } | AttPdu::HandleValueIndication { .. }
        )
    }

    /// Encode to wire bytes, checking value payloads against the MTU.
    pub fn encode(&self, mtu: u16) -> Result<Vec<u8>, EncodeError> {
        match self {
            AttPdu::ErrorResponse {
                request_opcode,
                handle,
                error_code,
            } => {
                let mut packet = Vec::with_capacity(5);
                packet.push(ATT_ERROR_RSP);
                packet.push(*request_opcode);
                packet.extend_from_slice(&handle.to_le_bytes());
                packet.push((*error_code).into());
                Ok(packet)
            }
            AttPdu::ExchangeMtuRequest { client_mtu } => {
                let mut packet = Vec::with_capacity(3);
                packet.push(ATT_EXCHANGE_MTU_REQ);
                packet.extend_from_slice(&client_mtu.to_le_bytes());
                Ok(packet)
            }
            AttPdu::ExchangeMtuResponse { server_mtu } => {
                let mut packet = Vec::with_capacity(3);
                packet.push(ATT_EXCHANGE_MTU_RSP);
                packet.extend_from_slice(&server_mtu.to_le_bytes());
                Ok(packet)
            }
            AttPdu::ReadRequest { handle } => {
                let mut packet = Vec::with_capacity(3);
                packet.push(ATT_READ_REQ);
                packet.extend_from_slice(&handle.to_le_bytes());
                Ok(packet)
            }
            AttPdu::ReadResponse { value } => {
                Self::check_value_len(value.len(), mtu, 1)?;
                let mut packet = Vec::with_capacity(1 + value.len());
                packet.push(ATT_READ_RSP);
                packet.extend_from_slice(value);
                Ok(packet)
            }
            AttPdu::WriteRequest { handle, value } => {
                Self::encode_handle_value(ATT_WRITE_REQ, *handle, value, mtu)
            }
            AttPdu::WriteResponse => Ok(vec![ATT_WRITE_RSP]),
            AttPdu::WriteCommand { handle, value } => {
                Self::encode_handle_value(ATT_WRITE_CMD, *handle, value, mtu)
            }
            AttPdu::HandleValueNotification { handle, value } => {
                Self::encode_handle_value(ATT_HANDLE_VALUE_NTF, *handle, value, mtu)
            }
            AttPdu::HandleValueIndication { handle, value } => {
                Self::encode_handle_value(ATT_HANDLE_VALUE_IND, *handle, value, mtu)
            }
            AttPdu::HandleValueConfirmation => Ok(vec![ATT_HANDLE_VALUE_CONF]),
        }
    }

    /// Decode wire bytes into a PDU.
    ///
    /// Decoding is strict: fixed-size PDUs must match their exact wire
    /// length and variable-size PDUs must meet their minimum header
    /// length. Anything else is a decode failure, never a partial success.
    pub fn decode(data: &[u8]) -> Result<AttPdu, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }

        let opcode = data[0];
        match opcode {
            ATT_ERROR_RSP => {
                Self::check_exact_len(opcode, data, 5)?;
                let request_opcode = data[1];
                let mut cursor = Cursor::new(&data[2..4]);
                let handle = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| Self::truncated(opcode, data, 5))?;
                Ok(AttPdu::ErrorResponse {
                    request_opcode,
                    handle,
                    error_code: data[4].into(),
                })
            }
            ATT_EXCHANGE_MTU_REQ => {
                Self::check_exact_len(opcode, data, 3)?;
                Ok(AttPdu::ExchangeMtuRequest {
                    client_mtu: Self::read_u16_at(opcode, data, 1)?,
                })
            }
            ATT_EXCHANGE_MTU_RSP => {
                Self::check_exact_len(opcode, data, 3)?;
                Ok(AttPdu::ExchangeMtuResponse {
                    server_mtu: Self::read_u16_at(opcode, data, 1)?,
                })
            }
            ATT_READ_REQ => {
                Self::check_exact_len(opcode, data, 3)?;
                Ok(AttPdu::ReadRequest {
                    handle: Self::read_u16_at(opcode, data, 1)?,
                })
            }
            ATT_READ_RSP => Ok(AttPdu::ReadResponse {
                value: data[1..].to_vec(),
            }),
            ATT_WRITE_REQ => {
                let (handle, value) = Self::decode_handle_value(opcode, data)?;
                Ok(AttPdu::WriteRequest { handle, value })
            }
            ATT_WRITE_RSP => {
                Self::check_exact_len(opcode, data, 1)?;
                Ok(AttPdu::WriteResponse)
            }
            ATT_WRITE_CMD => {
                let (handle, value) = Self::decode_handle_value(opcode, data)?;
                Ok(AttPdu::WriteCommand { handle, value })
            }
            ATT_HANDLE_VALUE_NTF => {
                let (handle, value) = Self::decode_handle_value(opcode, data)?;
                Ok(AttPdu::HandleValueNotification { handle, value })
            }
            ATT_HANDLE_VALUE_IND => {
                let (handle, value) = Self::decode_handle_value(opcode, data)?;
                Ok(AttPdu::HandleValueIndication { handle, value })
            }
            ATT_HANDLE_VALUE_CONF => {
                Self::check_exact_len(opcode, data, 1)?;
                Ok(AttPdu::HandleValueConfirmation)
            }
            _ => Err(DecodeError::UnknownOpcode(opcode)),
        }
    }

    fn encode_handle_value(
        opcode: u8,
        handle: u16,
        value: &[u8],
        mtu: u16,
    ) -> Result<Vec<u8>, EncodeError> {
        Self::check_value_len(value.len(), mtu, ATT_VALUE_HEADER_SIZE)?;
        let mut packet = Vec::with_capacity(ATT_VALUE_HEADER_SIZE + value.len());
        packet.push(opcode);
        packet.extend_from_slice(&handle.to_le_bytes());
        packet.extend_from_slice(value);
        Ok(packet)
    }

    fn decode_handle_value(opcode: u8, data: &[u8]) -> Result<(u16, Vec<u8>), DecodeError> {
        if data.len() < ATT_VALUE_HEADER_SIZE {
            return Err(Self::truncated(opcode, data, ATT_VALUE_HEADER_SIZE));
        }
        let handle = Self::read_u16_at(opcode, data, 1)?;
        Ok((handle, data[ATT_VALUE_HEADER_SIZE..].to_vec()))
    }

    fn read_u16_at(opcode: u8, data: &[u8], offset: usize) -> Result<u16, DecodeError> {
        let mut cursor = Cursor::new(&data[offset..]);
        cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Self::truncated(opcode, data, offset + 2))
    }

    fn check_exact_len(opcode: u8, data: &[u8], expected: usize) -> Result<(), DecodeError> {
        if data.len() < expected {
            Err(Self::truncated(opcode, data, expected))
        } else if data.len() > expected {
            Err(DecodeError::InvalidLength {
                opcode,
                expected,
                actual: data.len(),
            })
        } else {
            Ok(())
        }
    }

    fn check_value_len(value_len: usize, mtu: u16, header: usize) -> Result<(), EncodeError> {
        let max = (mtu as usize).saturating_sub(header);
        if value_len > max {
            Err(EncodeError::ValueTooLong {
                value_len,
                mtu,
                max,
            })
        } else {
            Ok(())
        }
    }

    fn truncated(opcode: u8, data: &[u8], expected: usize) -> DecodeError {
        DecodeError::Truncated {
            opcode,
            expected,
            actual: data.len(),
        }
    }
}
