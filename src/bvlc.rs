//! BVLC-SC Control Message Codec
//!
//! This module implements encoding and decoding of the BACnet Virtual Link
//! Control messages carried over secure-connect WebSocket connections.
//! Every PDU exchanged on the overlay is a BVLC-SC message: a fixed header
//! (function, control octet, message id), optional originating and
//! destination VMACs, optional header options, and a function-specific
//! payload.
//!
//! # Message Format
//!
//! BVLC-SC message:
//! - Function (1 byte)
//! - Control (1 byte): which optional header fields follow
//! - Message ID (2 bytes, big endian)
//! - Originating VMAC (6 bytes, if control bit set)
//! - Destination VMAC (6 bytes, if control bit set)
//! - Destination options (if control bit set)
//! - Data options (if control bit set)
//! - Payload (0..n bytes)
//!
//! Header options are chained: each starts with a marker octet whose low
//! five bits are the option type and whose high bits flag "more options
//! follow", "must understand" and "header data present". An option the
//! receiver does not understand but which is flagged must-understand
//! forces a RESULT NAK back to the originator.

use bitflags::bitflags;
use bytes::BufMut;
use thiserror::Error;

use crate::util::{Vmac, VMAC_SIZE};

/// Result type for codec operations.
pub type Result<T> = core::result::Result<T, BvlcError>;

/// Errors produced while encoding or decoding BVLC-SC messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BvlcError {
    /// The message ended before a required field.
    #[error("truncated message")]
    Truncated,
    /// A header field had an invalid or unknown value.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    /// The encoded message would exceed the permitted size.
    #[error("message too large")]
    Overflow,
}

/// BVLC-SC function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcFunction {
    /// BVLC-Result: ACK or NAK for a previously sent message
    Result = 0x00,
    /// Encapsulated-NPDU: an application NPDU in transit
    EncapsulatedNpdu = 0x01,
    /// Address-Resolution: request the direct-connect URLs of a VMAC
    AddressResolution = 0x02,
    /// Address-Resolution-ACK: URL list answering an Address-Resolution
    AddressResolutionAck = 0x03,
    /// Advertisement: node status notification
    Advertisement = 0x04,
    /// Advertisement-Solicitation: request an Advertisement
    AdvertisementSolicitation = 0x05,
    /// Connect-Request (handled by the transport handshake)
    ConnectRequest = 0x06,
    /// Connect-Accept (handled by the transport handshake)
    ConnectAccept = 0x07,
    /// Disconnect-Request (handled by the transport)
    DisconnectRequest = 0x08,
    /// Disconnect-ACK (handled by the transport)
    DisconnectAck = 0x09,
    /// Heartbeat-Request (handled by the transport)
    HeartbeatRequest = 0x0A,
    /// Heartbeat-ACK (handled by the transport)
    HeartbeatAck = 0x0B,
    /// Proprietary-Message
    ProprietaryMessage = 0x0C,
}

impl BvlcFunction {
    /// Convert from the wire octet.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Result),
            0x01 => Some(Self::EncapsulatedNpdu),
            0x02 => Some(Self::AddressResolution),
            0x03 => Some(Self::AddressResolutionAck),
            0x04 => Some(Self::Advertisement),
            0x05 => Some(Self::AdvertisementSolicitation),
            0x06 => Some(Self::ConnectRequest),
            0x07 => Some(Self::ConnectAccept),
            0x08 => Some(Self::DisconnectRequest),
            0x09 => Some(Self::DisconnectAck),
            0x0A => Some(Self::HeartbeatRequest),
            0x0B => Some(Self::HeartbeatAck),
            0x0C => Some(Self::ProprietaryMessage),
            _ => None,
        }
    }
}

bitflags! {
    /// Control octet: which optional header fields are present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        /// Data options follow the destination options
        const DATA_OPTIONS = 0x01;
        /// Destination options follow the VMAC fields
        const DEST_OPTIONS = 0x02;
        /// Destination VMAC present
        const DEST_VMAC = 0x04;
        /// Originating VMAC present
        const ORIG_VMAC = 0x08;
    }
}

/// Header-option marker bit: more options follow this one.
pub const OPTION_MORE: u8 = 0x80;
/// Header-option marker bit: receiver must understand this option or NAK.
pub const OPTION_MUST_UNDERSTAND: u8 = 0x40;
/// Header-option marker bit: a length-prefixed data body follows.
pub const OPTION_HAS_DATA: u8 = 0x20;
/// Mask extracting the option type from the marker octet.
pub const OPTION_TYPE_MASK: u8 = 0x1F;

/// Secure-Path option type.
pub const OPTION_TYPE_SECURE_PATH: u8 = 1;
/// Proprietary option type.
pub const OPTION_TYPE_PROPRIETARY: u8 = 31;

/// BVLC-Result code: the referenced message was accepted.
pub const RESULT_ACK: u8 = 0;
/// BVLC-Result code: the referenced message was rejected.
pub const RESULT_NAK: u8 = 1;

/// Error class used by all connection-management NAKs.
pub const ERROR_CLASS_COMMUNICATION: u16 = 5;
/// Error code: a must-understand header option was not understood.
pub const ERROR_CODE_HEADER_NOT_UNDERSTOOD: u16 = 143;
/// Error code: the requested optional functionality is not implemented.
pub const ERROR_CODE_OPTIONAL_FUNCTIONALITY_NOT_SUPPORTED: u16 = 45;

/// Advertisement octet: current hub connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdvHubStatus {
    /// No connection to any hub
    NoHubConnection = 0,
    /// Connected to the primary hub
    ConnectedToPrimary = 1,
    /// Connected to the failover hub
    ConnectedToFailover = 2,
}

impl AdvHubStatus {
    /// Convert from the wire octet.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoHubConnection),
            1 => Some(Self::ConnectedToPrimary),
            2 => Some(Self::ConnectedToFailover),
            _ => None,
        }
    }
}

/// Advertisement octet: whether the node accepts direct connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdvDirectStatus {
    /// Direct connections are not accepted
    Unsupported = 0,
    /// Direct connections are accepted
    Supported = 1,
}

impl AdvDirectStatus {
    /// Convert from the wire octet.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unsupported),
            1 => Some(Self::Supported),
            _ => None,
        }
    }
}

/// A decoded header option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOption {
    /// The packed marker octet as received (echoed in NAKs)
    pub marker: u8,
    /// Option type (low five marker bits)
    pub option_type: u8,
    /// Receiver must understand this option or reject the PDU
    pub must_understand: bool,
    /// Option body, when the marker flags one
    pub data: Option<Vec<u8>>,
}

/// Payload of a BVLC-Result message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPayload {
    /// The function the result refers to
    pub function: BvlcFunction,
    /// `RESULT_ACK` or `RESULT_NAK`
    pub result_code: u8,
    /// On NAK: marker octet of the offending header option, if any
    pub error_header_marker: Option<u8>,
    /// On NAK: error class
    pub error_class: Option<u16>,
    /// On NAK: error code
    pub error_code: Option<u16>,
    /// On NAK: human-readable detail string
    pub details: Option<String>,
}

impl ResultPayload {
    /// True when the result is a negative acknowledgement.
    pub fn is_nak(&self) -> bool {
        self.result_code == RESULT_NAK
    }
}

/// Function-specific payload of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// BVLC-Result
    Result(ResultPayload),
    /// Encapsulated NPDU bytes
    EncapsulatedNpdu(Vec<u8>),
    /// Address-Resolution (no payload)
    AddressResolution,
    /// Address-Resolution-ACK: space-separated WebSocket URL list
    AddressResolutionAck {
        /// UTF-8 URL list, URLs separated by 0x20
        uri_list: String,
    },
    /// Advertisement
    Advertisement {
        /// Hub connection status of the advertising node
        hub_status: AdvHubStatus,
        /// Direct-connection capability of the advertising node
        direct_status: AdvDirectStatus,
        /// Maximum BVLC message size the node accepts
        max_bvlc_len: u16,
        /// Maximum NPDU size the node accepts
        max_npdu_len: u16,
    },
    /// Advertisement-Solicitation (no payload)
    AdvertisementSolicitation,
    /// Payload of a function this layer does not interpret
    Other(Vec<u8>),
}

/// A fully decoded BVLC-SC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// BVLC function
    pub function: BvlcFunction,
    /// Message id correlating requests with results
    pub message_id: u16,
    /// Originating VMAC, when present
    pub origin: Option<Vmac>,
    /// Destination VMAC, when present
    pub dest: Option<Vmac>,
    /// Destination header options
    pub dest_options: Vec<HeaderOption>,
    /// Data header options
    pub data_options: Vec<HeaderOption>,
    /// Function-specific payload
    pub payload: Payload,
}

impl Decoded {
    /// Decode a BVLC-SC message.
    pub fn decode(pdu: &[u8]) -> Result<Decoded> {
        if pdu.len() < 4 {
            return Err(BvlcError::Truncated);
        }
        let function = BvlcFunction::from_u8(pdu[0])
            .ok_or(BvlcError::InvalidHeader("unknown function"))?;
        let control = ControlFlags::from_bits(pdu[1])
            .ok_or(BvlcError::InvalidHeader("reserved control bits set"))?;
        let message_id = u16::from_be_bytes([pdu[2], pdu[3]]);
        let mut offset = 4;

        let origin = if control.contains(ControlFlags::ORIG_VMAC) {
            Some(take_vmac(pdu, &mut offset)?)
        } else {
            None
        };
        let dest = if control.contains(ControlFlags::DEST_VMAC) {
            Some(take_vmac(pdu, &mut offset)?)
        } else {
            None
        };
        let dest_options = if control.contains(ControlFlags::DEST_OPTIONS) {
            take_options(pdu, &mut offset)?
        } else {
            Vec::new()
        };
        let data_options = if control.contains(ControlFlags::DATA_OPTIONS) {
            take_options(pdu, &mut offset)?
        } else {
            Vec::new()
        };

        let body = &pdu[offset..];
        let payload = match function {
            BvlcFunction::Result => Payload::Result(decode_result_payload(body)?),
            BvlcFunction::EncapsulatedNpdu => Payload::EncapsulatedNpdu(body.to_vec()),
            BvlcFunction::AddressResolution => Payload::AddressResolution,
            BvlcFunction::AddressResolutionAck => Payload::AddressResolutionAck {
                uri_list: String::from_utf8_lossy(body).into_owned(),
            },
            BvlcFunction::Advertisement => {
                if body.len() < 6 {
                    return Err(BvlcError::Truncated);
                }
                Payload::Advertisement {
                    hub_status: AdvHubStatus::from_u8(body[0])
                        .ok_or(BvlcError::InvalidHeader("bad hub status"))?,
                    direct_status: AdvDirectStatus::from_u8(body[1])
                        .ok_or(BvlcError::InvalidHeader("bad direct status"))?,
                    max_bvlc_len: u16::from_be_bytes([body[2], body[3]]),
                    max_npdu_len: u16::from_be_bytes([body[4], body[5]]),
                }
            }
            BvlcFunction::AdvertisementSolicitation => Payload::AdvertisementSolicitation,
            _ => Payload::Other(body.to_vec()),
        };

        Ok(Decoded {
            function,
            message_id,
            origin,
            dest,
            dest_options,
            data_options,
            payload,
        })
    }

    /// True when a failure to process this message must be answered with a
    /// BVLC-Result NAK. Results and acknowledgements never are; requests
    /// and notifications carrying an originator expectation are.
    pub fn needs_result(&self) -> bool {
        !matches!(
            self.function,
            BvlcFunction::Result
                | BvlcFunction::Advertisement
                | BvlcFunction::AddressResolutionAck
                | BvlcFunction::ConnectAccept
                | BvlcFunction::DisconnectAck
                | BvlcFunction::HeartbeatAck
        )
    }
}

fn take_vmac(pdu: &[u8], offset: &mut usize) -> Result<Vmac> {
    if pdu.len() < *offset + VMAC_SIZE {
        return Err(BvlcError::Truncated);
    }
    let mut octets = [0u8; VMAC_SIZE];
    octets.copy_from_slice(&pdu[*offset..*offset + VMAC_SIZE]);
    *offset += VMAC_SIZE;
    Ok(Vmac(octets))
}

fn take_options(pdu: &[u8], offset: &mut usize) -> Result<Vec<HeaderOption>> {
    let mut options = Vec::new();
    loop {
        if pdu.len() <= *offset {
            return Err(BvlcError::Truncated);
        }
        let marker = pdu[*offset];
        *offset += 1;
        let data = if marker & OPTION_HAS_DATA != 0 {
            if pdu.len() < *offset + 2 {
                return Err(BvlcError::Truncated);
            }
            let len = u16::from_be_bytes([pdu[*offset], pdu[*offset + 1]]) as usize;
            *offset += 2;
            if pdu.len() < *offset + len {
                return Err(BvlcError::Truncated);
            }
            let body = pdu[*offset..*offset + len].to_vec();
            *offset += len;
            Some(body)
        } else {
            None
        };
        options.push(HeaderOption {
            marker,
            option_type: marker & OPTION_TYPE_MASK,
            must_understand: marker & OPTION_MUST_UNDERSTAND != 0,
            data,
        });
        if marker & OPTION_MORE == 0 {
            break;
        }
    }
    Ok(options)
}

fn decode_result_payload(body: &[u8]) -> Result<ResultPayload> {
    if body.len() < 2 {
        return Err(BvlcError::Truncated);
    }
    let function = BvlcFunction::from_u8(body[0])
        .ok_or(BvlcError::InvalidHeader("unknown function in result"))?;
    let result_code = body[1];
    if result_code == RESULT_ACK {
        return Ok(ResultPayload {
            function,
            result_code,
            error_header_marker: None,
            error_class: None,
            error_code: None,
            details: None,
        });
    }
    if result_code != RESULT_NAK || body.len() < 7 {
        return Err(BvlcError::InvalidHeader("malformed result"));
    }
    let details = if body.len() > 7 {
        Some(String::from_utf8_lossy(&body[7..]).into_owned())
    } else {
        None
    };
    Ok(ResultPayload {
        function,
        result_code,
        error_header_marker: Some(body[2]),
        error_class: Some(u16::from_be_bytes([body[3], body[4]])),
        error_code: Some(u16::from_be_bytes([body[5], body[6]])),
        details,
    })
}

fn encode_header(
    out: &mut Vec<u8>,
    function: BvlcFunction,
    message_id: u16,
    origin: Option<&Vmac>,
    dest: Option<&Vmac>,
) {
    let mut control = ControlFlags::empty();
    if origin.is_some() {
        control |= ControlFlags::ORIG_VMAC;
    }
    if dest.is_some() {
        control |= ControlFlags::DEST_VMAC;
    }
    out.put_u8(function as u8);
    out.put_u8(control.bits());
    out.put_u16(message_id);
    if let Some(vmac) = origin {
        out.put_slice(&vmac.0);
    }
    if let Some(vmac) = dest {
        out.put_slice(&vmac.0);
    }
}

fn check_size(out: Vec<u8>) -> Result<Vec<u8>> {
    if out.len() > u16::MAX as usize {
        return Err(BvlcError::Overflow);
    }
    Ok(out)
}

/// Encode a BVLC-Result. `error` carries (class, code) and makes the
/// result a NAK; without it an ACK is produced.
pub fn encode_result(
    message_id: u16,
    origin: Option<&Vmac>,
    dest: Option<&Vmac>,
    result_function: BvlcFunction,
    error_header_marker: Option<u8>,
    error: Option<(u16, u16)>,
    details: Option<&str>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(32);
    encode_header(&mut out, BvlcFunction::Result, message_id, origin, dest);
    out.put_u8(result_function as u8);
    match error {
        None => out.put_u8(RESULT_ACK),
        Some((class, code)) => {
            out.put_u8(RESULT_NAK);
            out.put_u8(error_header_marker.unwrap_or(0));
            out.put_u16(class);
            out.put_u16(code);
            if let Some(details) = details {
                out.put_slice(details.as_bytes());
            }
        }
    }
    check_size(out)
}

/// Encode an Encapsulated-NPDU carrying `npdu`.
pub fn encode_encapsulated_npdu(
    message_id: u16,
    origin: Option<&Vmac>,
    dest: Option<&Vmac>,
    npdu: &[u8],
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + npdu.len());
    encode_header(
        &mut out,
        BvlcFunction::EncapsulatedNpdu,
        message_id,
        origin,
        dest,
    );
    out.put_slice(npdu);
    check_size(out)
}

/// Encode an Address-Resolution request.
pub fn encode_address_resolution(
    message_id: u16,
    origin: Option<&Vmac>,
    dest: Option<&Vmac>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    encode_header(
        &mut out,
        BvlcFunction::AddressResolution,
        message_id,
        origin,
        dest,
    );
    check_size(out)
}

/// Encode an Address-Resolution-ACK carrying a space-separated URL list.
pub fn encode_address_resolution_ack(
    message_id: u16,
    origin: Option<&Vmac>,
    dest: Option<&Vmac>,
    uri_list: &str,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + uri_list.len());
    encode_header(
        &mut out,
        BvlcFunction::AddressResolutionAck,
        message_id,
        origin,
        dest,
    );
    out.put_slice(uri_list.as_bytes());
    check_size(out)
}

/// Encode an Advertisement.
pub fn encode_advertisement(
    message_id: u16,
    origin: Option<&Vmac>,
    dest: Option<&Vmac>,
    hub_status: AdvHubStatus,
    direct_status: AdvDirectStatus,
    max_bvlc_len: u16,
    max_npdu_len: u16,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(24);
    encode_header(
        &mut out,
        BvlcFunction::Advertisement,
        message_id,
        origin,
        dest,
    );
    out.put_u8(hub_status as u8);
    out.put_u8(direct_status as u8);
    out.put_u16(max_bvlc_len);
    out.put_u16(max_npdu_len);
    check_size(out)
}

/// Encode an Advertisement-Solicitation.
pub fn encode_advertisement_solicitation(
    message_id: u16,
    origin: Option<&Vmac>,
    dest: Option<&Vmac>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    encode_header(
        &mut out,
        BvlcFunction::AdvertisementSolicitation,
        message_id,
        origin,
        dest,
    );
    check_size(out)
}

/// Rewrite `pdu` so its header carries `origin` as the originating VMAC.
///
/// Used by the hub relay: a PDU arriving from a peer without an explicit
/// originator must be stamped before being forwarded, so the receiving
/// peer learns which VMAC it came from. A PDU that already names an
/// originator is returned unchanged.
pub fn insert_origin(pdu: &[u8], origin: &Vmac) -> Result<Vec<u8>> {
    if pdu.len() < 4 {
        return Err(BvlcError::Truncated);
    }
    let control = ControlFlags::from_bits(pdu[1])
        .ok_or(BvlcError::InvalidHeader("reserved control bits set"))?;
    if control.contains(ControlFlags::ORIG_VMAC) {
        return Ok(pdu.to_vec());
    }
    let mut out = Vec::with_capacity(pdu.len() + VMAC_SIZE);
    out.put_slice(&pdu[..4]);
    out[1] = (control | ControlFlags::ORIG_VMAC).bits();
    out.put_slice(&origin.0);
    out.put_slice(&pdu[4..]);
    check_size(out)
}
