//! PDU reader module
//!
//! Decoding is done in two steps:
//! the fixed 6-byte [`PduHeader`] is interpreted first,
//! so that the caller can check the declared length
//! before reading the body,
//! and then the body is decoded with [`read_pdu_body`].
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU header"))]
    ReadHeader {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU body of {} bytes", length))]
    ReadBody {
        length: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU header is truncated ({} bytes available)", available))]
    TruncatedHeader {
        available: usize,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU length mismatch: header declares {} bytes but {} are available",
        declared,
        available
    ))]
    LengthMismatch {
        declared: u32,
        available: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Unknown PDU type {:#04x}", pdu_type))]
    UnknownPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display(
        "PDU type {:#04x} has a body of {} bytes instead of {}",
        pdu_type,
        length,
        FIXED_BODY_LENGTH
    ))]
    FixedBodyLength {
        pdu_type: u8,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },

    #[snafu(display("unknown presentation context sub-item {:#04x}", item_type))]
    UnknownPresentationContextSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The fixed-size portion of every PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub pdu_type: u8,
    /// the number of bytes following the header
    pub length: u32,
}

impl PduHeader {
    /// Interpret the 6 header bytes:
    /// type, reserved byte, and a big endian 32-bit length.
    pub fn parse(bytes: [u8; 6]) -> Self {
        PduHeader {
            pdu_type: bytes[0],
            length: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }

    /// Check the declared length against the local maximum.
    ///
    /// A maximum of 0 means that no limit applies.
    /// In non-strict mode,
    /// lengths above the maximum are tolerated with a warning
    /// up to [`MAXIMUM_PDU_SIZE`].
    pub fn check_length(&self, max_pdu_length: u32, strict: bool) -> Result<()> {
        let pdu_length = self.length;
        if max_pdu_length == 0 || pdu_length <= max_pdu_length {
            return Ok(());
        }
        if strict {
            return PduTooLargeSnafu {
                pdu_length,
                max_pdu_length,
            }
            .fail();
        }
        let hard_limit = max_pdu_length.max(MAXIMUM_PDU_SIZE);
        ensure!(
            pdu_length <= hard_limit,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: hard_limit
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
        Ok(())
    }
}

/// Read a full PDU from a blocking reader.
///
/// Fails with [`Error::NoPduAvailable`]
/// if the stream ended before the first byte of the PDU.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    let mut bytes = [0; 6];
    let mut first = [0; 1];
    loop {
        match reader.read(&mut first) {
            Ok(0) => return NoPduAvailableSnafu.fail(),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context(ReadHeaderSnafu),
        }
    }
    bytes[0] = first[0];
    reader
        .read_exact(&mut bytes[1..])
        .context(ReadHeaderSnafu)?;

    let header = PduHeader::parse(bytes);
    header.check_length(max_pdu_length, strict)?;

    let body = read_n(reader, header.length as usize).context(ReadBodySnafu {
        length: header.length,
    })?;
    read_pdu_body(header.pdu_type, &body)
}

/// Decode a PDU from a buffer holding exactly one PDU, header included.
///
/// Unlike [`read_pdu_body`], unknown PDU types are rejected here.
pub fn decode_pdu(bytes: &[u8], max_pdu_length: u32, strict: bool) -> Result<Pdu> {
    let header: [u8; 6] = bytes
        .get(..PDU_HEADER_SIZE as usize)
        .and_then(|h| h.try_into().ok())
        .context(TruncatedHeaderSnafu {
            available: bytes.len(),
        })?;
    let header = PduHeader::parse(header);
    let body = &bytes[PDU_HEADER_SIZE as usize..];
    ensure!(
        body.len() == header.length as usize,
        LengthMismatchSnafu {
            declared: header.length,
            available: body.len(),
        }
    );
    ensure!(
        (0x01..=0x07).contains(&header.pdu_type),
        UnknownPduTypeSnafu {
            pdu_type: header.pdu_type
        }
    );
    header.check_length(max_pdu_length, strict)?;
    read_pdu_body(header.pdu_type, body)
}

/// Decode the body of a PDU of the given type.
///
/// PDUs of unknown type are returned as [`Pdu::Unknown`],
/// so that the caller can decide whether to ignore them.
pub fn read_pdu_body(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    if matches!(pdu_type, 0x03 | 0x05 | 0x06 | 0x07) {
        ensure!(
            body.len() == FIXED_BODY_LENGTH,
            FixedBodyLengthSnafu {
                pdu_type,
                length: body.len(),
            }
        );
    }
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => read_association_rq(&mut cursor, &codec).map(Pdu::AssociationRQ),
        0x02 => read_association_ac(&mut cursor, &codec).map(Pdu::AssociationAC),
        0x03 => read_association_rj(&mut cursor).map(Pdu::AssociationRJ),
        0x04 => read_pdata(&mut cursor).map(|data| Pdu::PData { data }),
        0x05 => {
            // 7-10 - Reserved
            read_reserved(&mut cursor, 4)?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // 7-10 - Reserved
            read_reserved(&mut cursor, 4)?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // 7-8 - Reserved
            read_reserved(&mut cursor, 2)?;

            // 9 - Source: 0 service-user, 1 reserved, 2 service-provider
            // 10 - Reason/Diag, only significant for the service provider
            let source = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag",
            })?;
            let source = AbortRQSource::from_codes(source, reason)
                .context(InvalidAbortSourceOrReasonSnafu)?;
            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: body.to_vec(),
        }),
    }
}

/// Body length of A-ASSOCIATE-RJ, A-RELEASE-RQ, A-RELEASE-RP and A-ABORT.
const FIXED_BODY_LENGTH: usize = 4;

/// The fixed part shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
struct AssociationFixedFields {
    protocol_version: u16,
    called_ae_title: String,
    calling_ae_title: String,
}

fn read_association_fixed_fields(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<AssociationFixedFields> {
    // 7-8 - Protocol-version, one bit per supported version (bit 0 for version 1)
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;

    // 9-10 - Reserved
    read_reserved(cursor, 2)?;

    // 11-26 - Called-AE-title, 27-42 - Calling-AE-title:
    // 16 characters each, leading and trailing spaces being non-significant
    let called_ae_title = read_ae_title(cursor, codec, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(cursor, codec, "Calling-AE-title")?;

    // 43-74 - Reserved
    read_reserved(cursor, 32)?;

    Ok(AssociationFixedFields {
        protocol_version,
        called_ae_title,
        calling_ae_title,
    })
}

fn read_association_rq(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<AssociationRQ> {
    let fixed = read_association_fixed_fields(cursor, codec)?;

    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    // 75-xxx - Variable items: one application context item,
    // one or more presentation context items and one user information item
    while has_remaining(cursor) {
        match read_pdu_variable(cursor, codec)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextProposed(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            PduVariableItem::Unknown(item_type) => {
                warn!("Ignoring unknown A-ASSOCIATE-RQ item {:#04x}", item_type);
            }
            var_item => {
                return InvalidPduVariableSnafu { var_item }.fail();
            }
        }
    }

    Ok(AssociationRQ {
        protocol_version: fixed.protocol_version,
        calling_ae_title: fixed.calling_ae_title,
        called_ae_title: fixed.called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_ac(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<AssociationAC> {
    // the AE title fields are echoed back from the request
    // and are not meant to be tested
    let fixed = read_association_fixed_fields(cursor, codec)?;

    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    while has_remaining(cursor) {
        match read_pdu_variable(cursor, codec)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextResult(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            PduVariableItem::Unknown(item_type) => {
                warn!("Ignoring unknown A-ASSOCIATE-AC item {:#04x}", item_type);
            }
            var_item => {
                return InvalidPduVariableSnafu { var_item }.fail();
            }
        }
    }

    Ok(AssociationAC {
        protocol_version: fixed.protocol_version,
        calling_ae_title: fixed.calling_ae_title,
        called_ae_title: fixed.called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_rj(cursor: &mut Cursor<&[u8]>) -> Result<AssociationRJ> {
    // 7 - Reserved
    read_reserved(cursor, 1)?;

    // 8 - Result: 1 rejected-permanent, 2 rejected-transient
    let result = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Result" })?;
    let result = AssociationRJResult::from_code(result).context(InvalidRejectSourceOrReasonSnafu)?;

    // 9 - Source, 10 - Reason/Diag.
    let source = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Source" })?;
    let reason = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "Reason/Diag.",
    })?;
    let source =
        AssociationRJSource::from_codes(source, reason).context(InvalidRejectSourceOrReasonSnafu)?;

    Ok(AssociationRJ { result, source })
}

fn read_pdata(cursor: &mut Cursor<&[u8]>) -> Result<Vec<PDataValue>> {
    let mut values = vec![];
    while has_remaining(cursor) {
        // 1-4 - Item-length, counting the context ID,
        // the control header and the fragment
        let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
            field: "Item-Length",
        })?;

        ensure!(
            item_length >= 2,
            InvalidItemLengthSnafu {
                length: item_length
            }
        );

        // 5 - Presentation-context-ID
        let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
            field: "Presentation-context-ID",
        })?;

        // 6 - Message Control Header:
        // bit 0 set for command information, bit 1 set on the last fragment
        let header = cursor.read_u8().context(ReadPduFieldSnafu {
            field: "Message Control Header",
        })?;

        let value_type = if header & 0x01 != 0 {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        };
        let is_last = header & 0x02 != 0;

        let data = read_n(cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
            field: "Presentation-data-value",
        })?;

        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data,
        });
    }
    Ok(values)
}

fn has_remaining(cursor: &Cursor<&[u8]>) -> bool {
    (cursor.position() as usize) < cursor.get_ref().len()
}

fn read_reserved<R: Read>(reader: &mut R, bytes: u32) -> Result<()> {
    let mut buf = [0u8; 32];
    reader
        .read_exact(&mut buf[..bytes as usize])
        .context(ReadReservedSnafu { bytes })
}

/// Read exactly `bytes_to_read` bytes.
///
/// The buffer grows with the data actually available,
/// so a bogus length cannot trigger a huge allocation.
fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() < bytes_to_read {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!(
                "expected {} bytes, only {} available",
                bytes_to_read,
                result.len()
            ),
        ));
    }
    Ok(result)
}

fn decode_text(codec: &dyn TextCodec, bytes: &[u8], field: &'static str) -> Result<String> {
    let text = codec.decode(bytes).context(DecodeTextSnafu { field })?;
    Ok(text
        .trim_end_matches('\0')
        .trim()
        .to_string())
}

fn read_text<R: Read>(
    reader: &mut R,
    codec: &dyn TextCodec,
    length: usize,
    field: &'static str,
) -> Result<String> {
    let bytes = read_n(reader, length).context(ReadPduFieldSnafu { field })?;
    decode_text(codec, &bytes, field)
}

fn read_ae_title<R: Read>(
    reader: &mut R,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    let mut ae_bytes = [0; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    decode_text(codec, &ae_bytes, field)
}

/// Read an item header (type, reserved byte, 16-bit length)
/// followed by its content.
fn read_item<R: Read>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    read_reserved(reader, 1)?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    let data = read_n(reader, item_length as usize).context(ReadPduFieldSnafu {
        field: "Item-data",
    })?;
    Ok((item_type, data))
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let (item_type, bytes) = read_item(reader)?;
    let mut cursor = Cursor::new(bytes.as_slice());

    match item_type {
        0x10 => {
            // Application Context Item: a single UID
            let val = decode_text(codec, &bytes, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => read_presentation_context_proposed(&mut cursor, codec)
            .map(PduVariableItem::PresentationContextProposed),
        0x21 => read_presentation_context_result(&mut cursor, codec)
            .map(PduVariableItem::PresentationContextResult),
        0x50 => {
            // User Information Item: a sequence of sub-items (PS3.7 Annex D)
            let mut user_variables = vec![];
            while has_remaining(&cursor) {
                let (sub_item_type, data) = read_item(&mut cursor)?;
                if let Some(item) = read_user_variable(sub_item_type, data, codec)? {
                    user_variables.push(item);
                }
            }
            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

fn read_presentation_context_proposed(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<PresentationContextProposed> {
    // 5 - Presentation-context-ID, an odd integer between 1 and 255
    let id = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "Presentation-context-ID",
    })?;

    // 6-8 - Reserved
    read_reserved(cursor, 3)?;

    // 9-xxx - one abstract syntax sub-item
    // and one or more transfer syntax sub-items
    let mut abstract_syntax: Option<String> = None;
    let mut transfer_syntaxes = vec![];
    while has_remaining(cursor) {
        let (item_type, data) = read_item(cursor)?;
        match item_type {
            0x30 => {
                abstract_syntax = Some(decode_text(codec, &data, "Abstract-syntax-name")?);
            }
            0x40 => {
                transfer_syntaxes.push(decode_text(codec, &data, "Transfer-syntax-name")?);
            }
            _ => {
                return UnknownPresentationContextSubItemSnafu { item_type }.fail();
            }
        }
    }

    Ok(PresentationContextProposed {
        id,
        abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
        transfer_syntaxes,
    })
}

fn read_presentation_context_result(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<PresentationContextResult> {
    // 5 - Presentation-context-ID
    let id = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "Presentation-context-ID",
    })?;

    // 6 - Reserved
    read_reserved(cursor, 1)?;

    // 7 - Result/Reason
    let reason = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "Result/Reason",
    })?;
    let reason = PresentationContextResultReason::from_code(reason)
        .context(InvalidPresentationContextResultReasonSnafu)?;

    // 8 - Reserved
    read_reserved(cursor, 1)?;

    // 9-xxx - exactly one transfer syntax sub-item,
    // not significant unless the context was accepted
    let mut transfer_syntax: Option<String> = None;
    while has_remaining(cursor) {
        let (item_type, data) = read_item(cursor)?;
        ensure!(item_type == 0x40, InvalidTransferSyntaxSubItemSnafu);
        ensure!(
            transfer_syntax.is_none(),
            MultipleTransferSyntaxesAcceptedSnafu
        );
        transfer_syntax = Some(decode_text(codec, &data, "Transfer-syntax-name")?);
    }

    let transfer_syntax = match (transfer_syntax, reason) {
        (Some(ts), _) => ts,
        (None, PresentationContextResultReason::Acceptance) => {
            return MissingTransferSyntaxSnafu.fail();
        }
        (None, _) => String::new(),
    };

    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax,
    })
}

/// Interpret one user information sub-item.
///
/// Returns `None` for sub-items which are recognized but cannot be represented,
/// such as a user identity of an unknown type.
fn read_user_variable(
    item_type: u8,
    data: Vec<u8>,
    codec: &dyn TextCodec,
) -> Result<Option<UserVariableItem>> {
    let mut cursor = Cursor::new(data.as_slice());
    let item = match item_type {
        0x51 => {
            // Maximum-length-received, 0 meaning no maximum
            let max_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-length-received",
            })?;
            UserVariableItem::MaxLength(max_length)
        }
        0x52 => UserVariableItem::ImplementationClassUID(decode_text(
            codec,
            &data,
            "Implementation-class-uid",
        )?),
        0x53 => {
            let max_operations_invoked =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
            let max_operations_performed =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })?;
            UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked,
                max_operations_performed,
            }
        }
        0x54 => {
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "UID-length",
            })?;
            let sop_class_uid =
                read_text(&mut cursor, codec, uid_length as usize, "SOP-class-uid")?;
            let scu_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            let scp_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            UserVariableItem::RoleSelection {
                sop_class_uid,
                scu_role: scu_role != 0,
                scp_role: scp_role != 0,
            }
        }
        0x55 => UserVariableItem::ImplementationVersionName(decode_text(
            codec,
            &data,
            "Implementation-version-name",
        )?),
        0x56 => {
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let sop_class_uid =
                read_text(&mut cursor, codec, uid_length as usize, "SOP-class-uid")?;
            // the service class application information takes the rest of the item
            let mut info = Vec::new();
            cursor
                .read_to_end(&mut info)
                .context(ReadPduFieldSnafu {
                    field: "Service-class-application-information",
                })?;
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, info)
        }
        0x58 => {
            let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-type",
            })?;
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Positive-response-requested",
            })?;
            let primary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Primary-field-length",
                })?;
            let primary_field =
                read_n(&mut cursor, primary_field_length as usize).context(ReadPduFieldSnafu {
                    field: "Primary-field",
                })?;
            // only non-zero for username and passcode
            let secondary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Secondary-field-length",
                })?;
            let secondary_field = read_n(&mut cursor, secondary_field_length as usize).context(
                ReadPduFieldSnafu {
                    field: "Secondary-field",
                },
            )?;

            match UserIdentityType::from_code(user_identity_type) {
                Some(identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    identity_type,
                    primary_field,
                    secondary_field,
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", user_identity_type);
                    return Ok(None);
                }
            }
        }
        _ => UserVariableItem::Unknown(item_type, data),
    };
    Ok(Some(item))
}
