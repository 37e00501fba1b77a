//! Shared fixtures of the connection engine tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_dimse::association::{AcceptorPolicy, Association};
use dicom_dimse::message::{Dataset, DicomMessage, DicomRequest, DicomResponse, Status};
use dicom_dimse::pdu::{
    encode_pdu, read_pdu_body, AssociationAC, AssociationRQ, PDataValue, PDataValueType, Pdu,
    PduHeader, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem, APPLICATION_CONTEXT_NAME,
};
use dicom_dimse::service::PDataFragmenter;
use dicom_dimse::provider::{CEchoProvider, CStoreProvider};
use dicom_object::InMemDicomObject;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub type Result<T, E = Box<dyn std::error::Error + Send + Sync>> = std::result::Result<T, E>;

pub static SCU_AE_TITLE: &str = "THIS-SCU";
pub static SCP_AE_TITLE: &str = "THIS-SCP";

pub static VERIFICATION: &str = uids::VERIFICATION;
pub static SECONDARY_CAPTURE: &str = uids::SECONDARY_CAPTURE_IMAGE_STORAGE;
pub static IMPLICIT_VR_LE: &str = uids::IMPLICIT_VR_LITTLE_ENDIAN;
pub static EXPLICIT_VR_LE: &str = uids::EXPLICIT_VR_LITTLE_ENDIAN;

/// An association proposing verification
/// and secondary capture storage, in that order.
pub fn proposed_association() -> Association {
    let mut association =
        Association::new(SCU_AE_TITLE, SCP_AE_TITLE).expect("valid AE titles");
    association
        .add_presentation_context(VERIFICATION, [IMPLICIT_VR_LE])
        .expect("valid context");
    association
        .add_presentation_context(SECONDARY_CAPTURE, [EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .expect("valid context");
    association
}

pub fn acceptor_policy() -> AcceptorPolicy {
    AcceptorPolicy::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .with_abstract_syntax(SECONDARY_CAPTURE)
}

/// An A-ASSOCIATE-RQ as a bare requester would send it.
pub fn association_rq(called_ae_title: &str, user_variables: Vec<UserVariableItem>) -> AssociationRQ {
    AssociationRQ {
        protocol_version: 1,
        calling_ae_title: SCU_AE_TITLE.to_string(),
        called_ae_title: called_ae_title.to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: SECONDARY_CAPTURE.to_string(),
                transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
            },
        ],
        user_variables,
    }
}

/// Accept every proposed context with its first transfer syntax.
pub fn accept_all(rq: &AssociationRQ, user_variables: Vec<UserVariableItem>) -> AssociationAC {
    AssociationAC {
        protocol_version: 1,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: rq
            .presentation_contexts
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: pc.transfer_syntaxes[0].clone(),
            })
            .collect(),
        user_variables,
    }
}

/// The P-DATA-TF PDUs of a message, as the engine would cut them.
pub fn message_pdus(message: &DicomMessage, presentation_context_id: u8, max_pdu_length: u32) -> Vec<Pdu> {
    let command = message.encode_command().expect("command should encode");
    let dataset = message
        .dataset()
        .map(|dataset| dataset.encode().expect("data set should encode"));
    PDataFragmenter::new(presentation_context_id, max_pdu_length, max_pdu_length, max_pdu_length)
        .fragments(&command, dataset.as_deref())
        .collect()
}

/// A single P-DATA-TF PDU with one value.
pub fn single_pdv(presentation_context_id: u8, value_type: PDataValueType, data: Vec<u8>) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data,
        }],
    }
}

/// Interpret a PDU holding a whole command set.
pub fn command_message(pdu: Pdu) -> DicomMessage {
    let Pdu::PData { data } = pdu else {
        panic!("expected P-DATA-TF, got {:?}", pdu);
    };
    assert_eq!(data.len(), 1, "command should fit in one value");
    let pdv = &data[0];
    assert_eq!(pdv.value_type, PDataValueType::Command);
    assert!(pdv.is_last);
    let command = DicomMessage::decode_command(&pdv.data).expect("command should decode");
    let mut message = DicomMessage::new(command);
    message.set_presentation_context_id(pdv.presentation_context_id);
    message
}

pub fn response_of(pdu: Pdu) -> DicomResponse {
    DicomResponse::from_message(command_message(pdu)).expect("should be a response")
}

pub fn request_of(pdu: Pdu) -> DicomRequest {
    DicomRequest::from_message(command_message(pdu)).expect("should be a request")
}

/// A minimal secondary capture instance.
pub fn secondary_capture(sop_instance_uid: &str) -> Dataset {
    let object = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(SECONDARY_CAPTURE),
        ),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^John")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("OT")),
    ]);
    Dataset::new(object)
}

/// The peer end of a connection, speaking PDUs directly.
pub struct RawPeer {
    stream: DuplexStream,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        RawPeer { stream }
    }

    pub async fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let bytes = encode_pdu(pdu)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Receive the next PDU,
    /// or `None` once the engine has closed the connection.
    pub async fn receive(&mut self) -> Result<Option<Pdu>> {
        let mut header = [0u8; 6];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = PduHeader::parse(header);
        let mut body = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut body).await?;
        Ok(Some(read_pdu_body(header.pdu_type, &body)?))
    }

    pub async fn expect(&mut self) -> Pdu {
        self.receive()
            .await
            .expect("PDU should be readable")
            .expect("connection should still be open")
    }
}

/// Counts C-ECHO requests, answering each with success.
#[derive(Debug, Default, Clone)]
pub struct CountingEcho {
    pub count: Arc<AtomicUsize>,
}

impl CEchoProvider for CountingEcho {
    fn on_c_echo_request(&self, request: &DicomRequest) -> DicomResponse {
        self.count.fetch_add(1, Ordering::SeqCst);
        DicomResponse::new(request, Status::SUCCESS)
    }
}

/// Keeps the patient name of every stored instance.
#[derive(Debug, Default, Clone)]
pub struct RecordingStore {
    pub received: Arc<Mutex<Vec<String>>>,
    pub failures: Arc<AtomicUsize>,
}

impl CStoreProvider for RecordingStore {
    fn on_c_store_request(&self, request: &mut DicomRequest) -> DicomResponse {
        let name = request
            .received_instance()
            .and_then(|instance| {
                instance
                    .dataset()
                    .object()
                    .element(tags::PATIENT_NAME)
                    .ok()
                    .and_then(|e| e.to_str().ok())
                    .map(|name| name.trim().to_string())
            })
            .unwrap_or_default();
        self.received.lock().unwrap().push(name);
        DicomResponse::new(request, Status::SUCCESS)
    }

    fn on_c_store_request_exception(
        &self,
        _meta: &dicom_dimse::storage::StoreMeta,
        _error: &dicom_dimse::storage::Error,
    ) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}
