//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode field `{}`", field))]
    EncodeField {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("{} of {} bytes does not fit its length field", name, length))]
    ChunkTooLong {
        name: &'static str,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("AE title `{}` is longer than 16 characters", ae_title))]
    AeTitleTooLong {
        ae_title: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Write the output of `func` preceded by its length as a big endian `u32`.
fn write_chunk_u32<F>(writer: &mut dyn Write, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    ensure!(
        data.len() <= u32::MAX as usize,
        ChunkTooLongSnafu {
            name,
            length: data.len()
        }
    );
    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteFieldSnafu { field: name })?;
    writer
        .write_all(&data)
        .context(WriteFieldSnafu { field: name })
}

/// Write the output of `func` preceded by its length as a big endian `u16`.
fn write_chunk_u16<F>(writer: &mut dyn Write, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    ensure!(
        data.len() <= u16::MAX as usize,
        ChunkTooLongSnafu {
            name,
            length: data.len()
        }
    );
    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteFieldSnafu { field: name })?;
    writer
        .write_all(&data)
        .context(WriteFieldSnafu { field: name })
}

/// Write the PDU type followed by the reserved byte.
fn write_type(writer: &mut dyn Write, pdu_type: u8) -> Result<()> {
    writer
        .write_u8(pdu_type)
        .context(WriteFieldSnafu { field: "PDU-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })
}

fn write_text(
    writer: &mut dyn Write,
    codec: &dyn TextCodec,
    text: &str,
    field: &'static str,
) -> Result<()> {
    let bytes = codec.encode(text).context(EncodeFieldSnafu { field })?;
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

fn write_ae_title(
    writer: &mut dyn Write,
    codec: &dyn TextCodec,
    ae_title: &str,
    field: &'static str,
) -> Result<()> {
    let mut bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    ensure!(
        bytes.len() <= 16,
        AeTitleTooLongSnafu {
            ae_title: ae_title.to_string()
        }
    );
    bytes.resize(16, b' ');
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

/// Encode a PDU into a new byte vector.
pub fn encode_pdu(pdu: &Pdu) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_pdu(&mut out, pdu)?;
    Ok(out)
}

/// Write a full PDU, header included.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    write_type(writer, pdu.pdu_type())?;

    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => write_chunk_u32(writer, "A-ASSOCIATE-RQ", |writer| {
            write_association_fixed_fields(
                writer,
                &codec,
                *protocol_version,
                called_ae_title,
                calling_ae_title,
            )?;

            // 75-xxx - Variable items
            write_pdu_variable_application_context_name(writer, application_context_name, &codec)?;
            for presentation_context in presentation_contexts {
                write_pdu_variable_presentation_context_proposed(
                    writer,
                    presentation_context,
                    &codec,
                )?;
            }
            write_pdu_variable_user_variables(writer, user_variables, &codec)
        }),
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => write_chunk_u32(writer, "A-ASSOCIATE-AC", |writer| {
            // the AE title fields repeat the values of the A-ASSOCIATE-RQ
            write_association_fixed_fields(
                writer,
                &codec,
                *protocol_version,
                called_ae_title,
                calling_ae_title,
            )?;

            write_pdu_variable_application_context_name(writer, application_context_name, &codec)?;
            for presentation_context in presentation_contexts {
                write_pdu_variable_presentation_context_result(
                    writer,
                    presentation_context,
                    &codec,
                )?;
            }
            write_pdu_variable_user_variables(writer, user_variables, &codec)
        }),
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            write_chunk_u32(writer, "A-ASSOCIATE-RJ", |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;
                // 8 - Result
                writer
                    .write_u8(result.code())
                    .context(WriteFieldSnafu { field: "Result" })?;
                // 9 - Source, 10 - Reason/Diag.
                let (source, reason) = source.codes();
                writer
                    .write_u8(source)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })
            })
        }
        Pdu::PData { data } => write_chunk_u32(writer, "P-DATA-TF", |writer| {
            for pdv in data {
                write_chunk_u32(writer, "Presentation-data-value item", |writer| {
                    writer
                        .write_u8(pdv.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;
                    writer
                        .write_u8(pdv.control_header())
                        .context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;
                    writer.write_all(&pdv.data).context(WriteFieldSnafu {
                        field: "Presentation-data-value",
                    })
                })?;
            }
            Ok(())
        }),
        Pdu::ReleaseRQ | Pdu::ReleaseRP => write_chunk_u32(writer, "A-RELEASE", |writer| {
            // 7-10 - Reserved
            writer
                .write_all(&[0u8; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })
        }),
        Pdu::AbortRQ { source } => write_chunk_u32(writer, "A-ABORT", |writer| {
            // 7-8 - Reserved
            writer
                .write_all(&[0u8; 2])
                .context(WriteReservedSnafu { bytes: 2_u32 })?;
            // 9 - Source, 10 - Reason/Diag.
            let (source, reason) = source.codes();
            writer
                .write_all(&[source, reason])
                .context(WriteFieldSnafu {
                    field: "AbortRQSource",
                })
        }),
        Pdu::Unknown { data, .. } => write_chunk_u32(writer, "Unknown", |writer| {
            writer.write_all(data).context(WriteFieldSnafu {
                field: "Unknown data",
            })
        }),
    }
}

fn write_association_fixed_fields(
    writer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    // 7-8 - Protocol-version
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;

    // 9-10 - Reserved
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title, 27-42 - Calling-AE-title,
    // padded with trailing spaces
    write_ae_title(writer, codec, called_ae_title, "Called-AE-title")?;
    write_ae_title(writer, codec, calling_ae_title, "Calling-AE-title")?;

    // 43-74 - Reserved
    writer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })
}

/// Write an item header with the given type
/// followed by the output of `func` as its content.
fn write_item<F>(writer: &mut dyn Write, item_type: u8, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, name, func)
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x10, "Application Context Item", |writer| {
        write_text(
            writer,
            codec,
            application_context_name,
            "Application-context-name",
        )
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x20, "Presentation Context Item", |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6-8 - Reserved
        writer
            .write_all(&[0u8; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // 9-xxx - one abstract syntax sub-item, then the transfer syntaxes
        write_item(writer, 0x30, "Abstract Syntax Sub-Item", |writer| {
            write_text(
                writer,
                codec,
                &presentation_context.abstract_syntax,
                "Abstract-syntax-name",
            )
        })?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_item(writer, 0x40, "Transfer Syntax Sub-Item", |writer| {
                write_text(writer, codec, transfer_syntax, "Transfer-syntax-name")
            })?;
        }

        Ok(())
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x21, "Presentation Context Item", |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6 - Reserved, 7 - Result/Reason, 8 - Reserved
        writer
            .write_all(&[0x00, presentation_context.reason.code(), 0x00])
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;

        // 9-xxx - Transfer syntax sub-item
        write_item(writer, 0x40, "Transfer Syntax Sub-Item", |writer| {
            write_text(
                writer,
                codec,
                &presentation_context.transfer_syntax,
                "Transfer-syntax-name",
            )
        })
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item(writer, 0x50, "User Information Item", |writer| {
        for user_variable in user_variables {
            write_user_variable(writer, user_variable, codec)?;
        }
        Ok(())
    })
}

fn write_user_variable(
    writer: &mut dyn Write,
    user_variable: &UserVariableItem,
    codec: &dyn TextCodec,
) -> Result<()> {
    match user_variable {
        UserVariableItem::MaxLength(max_length) => {
            write_item(writer, 0x51, "Maximum Length Sub-Item", |writer| {
                writer
                    .write_u32::<BigEndian>(*max_length)
                    .context(WriteFieldSnafu {
                        field: "Maximum-length-received",
                    })
            })
        }
        UserVariableItem::ImplementationClassUID(uid) => {
            write_item(writer, 0x52, "Implementation Class UID Sub-Item", |writer| {
                write_text(writer, codec, uid, "Implementation-class-uid")
            })
        }
        UserVariableItem::AsyncOperationsWindow {
            max_operations_invoked,
            max_operations_performed,
        } => write_item(writer, 0x53, "Asynchronous Operations Window Sub-Item", |writer| {
            writer
                .write_u16::<BigEndian>(*max_operations_invoked)
                .context(WriteFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
            writer
                .write_u16::<BigEndian>(*max_operations_performed)
                .context(WriteFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })
        }),
        UserVariableItem::RoleSelection {
            sop_class_uid,
            scu_role,
            scp_role,
        } => write_item(writer, 0x54, "SCP/SCU Role Selection Sub-Item", |writer| {
            write_chunk_u16(writer, "SOP-class-uid", |writer| {
                write_text(writer, codec, sop_class_uid, "SOP-class-uid")
            })?;
            writer
                .write_all(&[*scu_role as u8, *scp_role as u8])
                .context(WriteFieldSnafu { field: "SCU/SCP-role" })
        }),
        UserVariableItem::ImplementationVersionName(name) => {
            write_item(writer, 0x55, "Implementation Version Name Sub-Item", |writer| {
                write_text(writer, codec, name, "Implementation-version-name")
            })
        }
        UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => write_item(
            writer,
            0x56,
            "SOP Class Extended Negotiation Sub-Item",
            |writer| {
                write_chunk_u16(writer, "SOP-class-uid", |writer| {
                    write_text(writer, codec, sop_class_uid, "SOP-class-uid")
                })?;
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Service-class-application-information",
                })
            },
        ),
        UserVariableItem::UserIdentityItem(user_identity) => {
            write_item(writer, 0x58, "User Identity Sub-Item", |writer| {
                writer
                    .write_u8(user_identity.identity_type().code())
                    .context(WriteFieldSnafu {
                        field: "User-Identity-type",
                    })?;
                writer
                    .write_u8(user_identity.positive_response_requested() as u8)
                    .context(WriteFieldSnafu {
                        field: "Positive-response-requested",
                    })?;
                write_chunk_u16(writer, "Primary-field", |writer| {
                    writer
                        .write_all(user_identity.primary_field())
                        .context(WriteFieldSnafu {
                            field: "Primary-field",
                        })
                })?;
                write_chunk_u16(writer, "Secondary-field", |writer| {
                    writer
                        .write_all(user_identity.secondary_field())
                        .context(WriteFieldSnafu {
                            field: "Secondary-field",
                        })
                })
            })
        }
        UserVariableItem::Unknown(item_type, data) => {
            write_item(writer, *item_type, "Unknown Sub-Item", |writer| {
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Unknown Data",
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() -> Result<()> {
        let mut bytes = vec![0u8; 0];
        write_chunk_u32(&mut bytes, "Chunk1", |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u32(writer, "Chunk2", |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })
            })
        })?;

        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
        Ok(())
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() -> Result<()> {
        let mut bytes = vec![0u8; 0];
        write_chunk_u16(&mut bytes, "Chunk1", |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u16(writer, "Chunk2", |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })
            })
        })?;

        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);
        Ok(())
    }

    #[test]
    fn u16_chunk_overflow_is_reported() {
        let mut bytes = vec![];
        let res = write_chunk_u16(&mut bytes, "Big", |writer| {
            writer
                .write_all(&vec![0u8; 70_000])
                .context(WriteFieldSnafu { field: "Big" })
        });
        assert_matches!(res, Err(Error::ChunkTooLong { length: 70_000, .. }));
        assert!(bytes.is_empty());
    }

    #[test]
    fn release_and_abort_layout() -> Result<()> {
        assert_eq!(
            encode_pdu(&Pdu::ReleaseRQ)?,
            &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode_pdu(&Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPdu
                )
            })?,
            &[0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x01]
        );
        Ok(())
    }

    #[test]
    fn accept_echoes_ae_titles() -> Result<()> {
        let pdu = Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "ARCHIVE".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        });
        let bytes = encode_pdu(&pdu)?;
        assert_eq!(&bytes[10..26], b"ARCHIVE         ");
        assert_eq!(&bytes[26..42], b"STORE-SCU       ");
        Ok(())
    }

    #[test]
    fn result_item_reserved_bytes_are_zero() -> Result<()> {
        let mut bytes = vec![];
        write_pdu_variable_presentation_context_result(
            &mut bytes,
            &PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            &DefaultCharacterSetCodec,
        )?;
        // item header, id, reserved, reason, reserved, then the sub-item header
        assert_eq!(&bytes[..10], &[0x21, 0x00, 0x00, 25, 0x01, 0x00, 0x00, 0x00, 0x40, 0x00]);
        Ok(())
    }
}
