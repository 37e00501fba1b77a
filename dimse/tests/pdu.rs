//! Wire format of every PDU type,
//! checked by encoding and decoding through the public codec.
use dicom_dimse::pdu::{
    decode_pdu, encode_pdu, read_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
    AssociationRQ, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserIdentity, UserIdentityType,
    UserVariableItem, APPLICATION_CONTEXT_NAME, DEFAULT_MAX_PDU,
};
use dicom_dimse::pdu::reader::Error as ReadError;
use matches::assert_matches;
use rstest::rstest;

fn every_user_variable() -> Vec<UserVariableItem> {
    vec![
        UserVariableItem::MaxLength(32_768),
        UserVariableItem::ImplementationClassUID("1.2.3.4.55".to_string()),
        UserVariableItem::AsyncOperationsWindow {
            max_operations_invoked: 4,
            max_operations_performed: 2,
        },
        UserVariableItem::RoleSelection {
            sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
            scu_role: true,
            scp_role: false,
        },
        UserVariableItem::ImplementationVersionName("DICOM-DIMSE 0.1".to_string()),
        UserVariableItem::SopClassExtendedNegotiationSubItem(
            "1.2.840.10008.5.1.4.1.2.1.1".to_string(),
            vec![1, 0, 1],
        ),
        UserVariableItem::UserIdentityItem(UserIdentity::new(
            true,
            UserIdentityType::UsernamePassword,
            b"operator".to_vec(),
            b"secret".to_vec(),
        )),
        UserVariableItem::Unknown(0x5A, vec![0xCA, 0xFE]),
    ]
}

fn association_rq() -> Pdu {
    Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
        ],
        user_variables: every_user_variable(),
    })
}

fn association_ac() -> Pdu {
    Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.3.4.55".to_string()),
            UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked: 1,
                max_operations_performed: 1,
            },
        ],
    })
}

fn association_rj() -> Pdu {
    Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    })
}

fn p_data() -> Pdu {
    Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x02, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x55; 100],
            },
        ],
    }
}

#[rstest]
#[case::association_rq(association_rq())]
#[case::association_ac(association_ac())]
#[case::association_rj(association_rj())]
#[case::p_data(p_data())]
#[case::release_rq(Pdu::ReleaseRQ)]
#[case::release_rp(Pdu::ReleaseRP)]
#[case::abort_user(Pdu::AbortRQ { source: AbortRQSource::ServiceUser })]
#[case::abort_provider(Pdu::AbortRQ {
    source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
})]
fn pdu_survives_the_wire(#[case] pdu: Pdu) {
    let bytes = encode_pdu(&pdu).expect("PDU should encode");
    assert_eq!(bytes[0], pdu.pdu_type());
    assert_eq!(bytes.len() - 6, u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize);

    let decoded = decode_pdu(&bytes, DEFAULT_MAX_PDU, true).expect("PDU should decode");
    assert_eq!(decoded, pdu);

    let read = read_pdu(&mut bytes.as_slice(), DEFAULT_MAX_PDU, true).expect("PDU should be read");
    assert_eq!(read, pdu);
}

#[test]
fn user_information_keeps_every_sub_item_in_order() {
    let bytes = encode_pdu(&association_rq()).unwrap();
    let Pdu::AssociationRQ(rq) = decode_pdu(&bytes, 0, true).unwrap() else {
        panic!("expected an association request");
    };
    assert_eq!(rq.user_variables, every_user_variable());
}

#[test]
fn fixed_size_pdus_have_known_layout() {
    assert_eq!(
        encode_pdu(&Pdu::ReleaseRQ).unwrap(),
        [0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(
        encode_pdu(&Pdu::ReleaseRP).unwrap(),
        [0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(
        encode_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter)
        })
        .unwrap(),
        [0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x06]
    );
    assert_eq!(
        encode_pdu(&association_rj()).unwrap(),
        [0x03, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x01, 0x07]
    );
}

#[rstest]
#[case::release_rq([0x05, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0xAA, 0xBB])]
#[case::release_rp([0x06, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0xAA, 0xBB])]
#[case::abort([0x07, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0xAA, 0xBB])]
#[case::reject([0x03, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x01, 0x01, 0x07, 0xAA, 0xBB])]
fn fixed_size_pdu_with_trailing_bytes_is_refused(#[case] bytes: [u8; 12]) {
    assert_matches!(
        decode_pdu(&bytes, DEFAULT_MAX_PDU, true),
        Err(ReadError::FixedBodyLength { length: 6, .. })
    );
    let mut reader: &[u8] = &bytes;
    assert_matches!(
        read_pdu(&mut reader, DEFAULT_MAX_PDU, true),
        Err(ReadError::FixedBodyLength { .. })
    );
}

#[test]
fn p_data_control_header_is_on_the_wire() {
    let bytes = encode_pdu(&p_data()).unwrap();
    // item length (4), context id, then the control header
    assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x00, 0x0A]);
    assert_eq!(bytes[10], 1);
    assert_eq!(bytes[11], 0x03);
}

#[test]
fn oversized_pdu_is_refused_in_strict_mode() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 20_000],
        }],
    };
    let bytes = encode_pdu(&pdu).unwrap();
    assert!(decode_pdu(&bytes, DEFAULT_MAX_PDU, true).is_err());
    assert_matches!(decode_pdu(&bytes, DEFAULT_MAX_PDU, false), Ok(Pdu::PData { .. }));
}

#[test]
fn unknown_pdu_type_is_reported() {
    let bytes = [0x09, 0x00, 0x00, 0x00, 0x00, 0x02, 0xAB, 0xCD];
    assert!(decode_pdu(&bytes, 0, false).is_err());
    assert_eq!(
        dicom_dimse::pdu::read_pdu_body(0x09, &bytes[6..]).unwrap(),
        Pdu::Unknown {
            pdu_type: 0x09,
            data: vec![0xAB, 0xCD]
        }
    );
}
