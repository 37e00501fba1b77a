//! DIMSE message model.
//!
//! A DIMSE message is a command set, always encoded in
//! _Implicit VR Little Endian_, optionally followed by a data set
//! encoded in the transfer syntax accepted for its presentation context.
//! This module provides the typed views used by the connection engine:
//! [`DicomRequest`] and [`DicomResponse`], plus the raw [`DicomMessage`]
//! they both wrap.
use std::borrow::Cow;
use std::fmt;
use std::io::Read;

use dicom_core::value::{ConvertValueError, PrimitiveValue};
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::association::uid::trim_uid;
use crate::storage::ReceivedInstance;

pub mod status;

pub use status::{Status, StatusState};

/// Value of _Command Data Set Type_ indicating that no data set follows.
pub const NO_DATASET: u16 = 0x0101;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not decode command set"))]
    DecodeCommand {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not encode command set"))]
    EncodeCommand {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not decode data set in transfer syntax {}", transfer_syntax))]
    DecodeDataset {
        transfer_syntax: String,
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not encode data set in transfer syntax {}", transfer_syntax))]
    EncodeDataset {
        transfer_syntax: String,
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },
    #[snafu(display("Missing element {}", name))]
    MissingElement {
        name: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not convert element {}", name))]
    ConvertElement {
        name: &'static str,
        source: ConvertValueError,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown transfer syntax {}", uid))]
    UnknownTransferSyntax { uid: String, backtrace: Backtrace },
    #[snafu(display("Unknown command field {:#06x}", code))]
    UnknownCommandField { code: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The _Command Field_ (0000,0100) of a DIMSE message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
    CCancelRsp = 0x8FFF,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        use CommandField::*;
        let field = match code {
            0x0001 => CStoreRq,
            0x8001 => CStoreRsp,
            0x0010 => CGetRq,
            0x8010 => CGetRsp,
            0x0020 => CFindRq,
            0x8020 => CFindRsp,
            0x0021 => CMoveRq,
            0x8021 => CMoveRsp,
            0x0030 => CEchoRq,
            0x8030 => CEchoRsp,
            0x0100 => NEventReportRq,
            0x8100 => NEventReportRsp,
            0x0110 => NGetRq,
            0x8110 => NGetRsp,
            0x0120 => NSetRq,
            0x8120 => NSetRsp,
            0x0130 => NActionRq,
            0x8130 => NActionRsp,
            0x0140 => NCreateRq,
            0x8140 => NCreateRsp,
            0x0150 => NDeleteRq,
            0x8150 => NDeleteRsp,
            0x0FFF => CCancelRq,
            0x8FFF => CCancelRsp,
            _ => return None,
        };
        Some(field)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this is the command field of a request.
    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0
    }

    /// The response command field matching this request.
    /// Response fields map to themselves.
    pub fn response(self) -> CommandField {
        match CommandField::from_code(self.code() | 0x8000) {
            Some(field) => field,
            None => self,
        }
    }

    pub fn name(self) -> &'static str {
        use CommandField::*;
        match self {
            CStoreRq => "C-STORE-RQ",
            CStoreRsp => "C-STORE-RSP",
            CGetRq => "C-GET-RQ",
            CGetRsp => "C-GET-RSP",
            CFindRq => "C-FIND-RQ",
            CFindRsp => "C-FIND-RSP",
            CMoveRq => "C-MOVE-RQ",
            CMoveRsp => "C-MOVE-RSP",
            CEchoRq => "C-ECHO-RQ",
            CEchoRsp => "C-ECHO-RSP",
            NEventReportRq => "N-EVENT-REPORT-RQ",
            NEventReportRsp => "N-EVENT-REPORT-RSP",
            NGetRq => "N-GET-RQ",
            NGetRsp => "N-GET-RSP",
            NSetRq => "N-SET-RQ",
            NSetRsp => "N-SET-RSP",
            NActionRq => "N-ACTION-RQ",
            NActionRsp => "N-ACTION-RSP",
            NCreateRq => "N-CREATE-RQ",
            NCreateRsp => "N-CREATE-RSP",
            NDeleteRq => "N-DELETE-RQ",
            NDeleteRsp => "N-DELETE-RSP",
            CCancelRq => "C-CANCEL-RQ",
            CCancelRsp => "C-CANCEL-RSP",
        }
    }
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Priority of a C-STORE, C-FIND, C-GET or C-MOVE request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Priority {
    Low = 0x0002,
    #[default]
    Medium = 0x0000,
    High = 0x0001,
}

impl Priority {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0002 => Some(Priority::Low),
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// A data set together with the transfer syntax it is (or will be) encoded in.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    object: InMemDicomObject,
    transfer_syntax: String,
}

impl Dataset {
    /// Wrap an object to be sent in _Explicit VR Little Endian_.
    pub fn new(object: InMemDicomObject) -> Self {
        Dataset::with_transfer_syntax(object, uids::EXPLICIT_VR_LITTLE_ENDIAN)
    }

    pub fn with_transfer_syntax(object: InMemDicomObject, transfer_syntax: impl Into<String>) -> Self {
        Dataset {
            object,
            transfer_syntax: trim_uid(transfer_syntax.into()),
        }
    }

    pub fn object(&self) -> &InMemDicomObject {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut InMemDicomObject {
        &mut self.object
    }

    pub fn into_object(self) -> InMemDicomObject {
        self.object
    }

    pub fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    pub fn set_transfer_syntax(&mut self, transfer_syntax: impl Into<String>) {
        self.transfer_syntax = trim_uid(transfer_syntax.into());
    }

    /// Decode a data set from its raw bytes.
    pub fn decode(bytes: &[u8], transfer_syntax: &str) -> Result<Self> {
        Dataset::read_from(bytes, transfer_syntax)
    }

    /// Decode a data set from a reader positioned at its first element.
    pub fn read_from<R: Read>(reader: R, transfer_syntax: &str) -> Result<Self> {
        let ts = lookup_transfer_syntax(transfer_syntax)?;
        let object = InMemDicomObject::read_dataset_with_ts(reader, ts).context(
            DecodeDatasetSnafu {
                transfer_syntax: transfer_syntax.to_string(),
            },
        )?;
        Ok(Dataset::with_transfer_syntax(object, transfer_syntax))
    }

    /// Encode the data set in its current transfer syntax.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let ts = lookup_transfer_syntax(&self.transfer_syntax)?;
        let mut bytes = Vec::new();
        self.object
            .write_dataset_with_ts(&mut bytes, ts)
            .context(EncodeDatasetSnafu {
                transfer_syntax: self.transfer_syntax.clone(),
            })?;
        Ok(bytes)
    }

    /// Remove all group length elements (gggg,0000) from the top level.
    pub fn remove_group_lengths(&mut self) {
        let group_lengths: Vec<Tag> = (&self.object)
            .into_iter()
            .map(|e| e.header().tag)
            .filter(|tag| tag.element() == 0x0000)
            .collect();
        for tag in group_lengths {
            self.object.remove_element(tag);
        }
    }
}

fn lookup_transfer_syntax(
    uid: &str,
) -> Result<&'static dicom_encoding::transfer_syntax::TransferSyntax> {
    TransferSyntaxRegistry
        .get(uid)
        .context(UnknownTransferSyntaxSnafu { uid })
}

/// A DIMSE message: a command set and an optional data set.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomMessage {
    command: InMemDicomObject,
    dataset: Option<Dataset>,
    presentation_context_id: Option<u8>,
}

impl DicomMessage {
    pub fn new(command: InMemDicomObject) -> Self {
        DicomMessage {
            command,
            dataset: None,
            presentation_context_id: None,
        }
    }

    pub fn command(&self) -> &InMemDicomObject {
        &self.command
    }

    pub fn command_mut(&mut self) -> &mut InMemDicomObject {
        &mut self.command
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    pub fn dataset_mut(&mut self) -> Option<&mut Dataset> {
        self.dataset.as_mut()
    }

    pub fn set_dataset(&mut self, dataset: Option<Dataset>) {
        self.dataset = dataset;
        self.update_dataset_type();
    }

    pub fn take_dataset(&mut self) -> Option<Dataset> {
        let dataset = self.dataset.take();
        self.update_dataset_type();
        dataset
    }

    pub fn presentation_context_id(&self) -> Option<u8> {
        self.presentation_context_id
    }

    pub fn set_presentation_context_id(&mut self, id: u8) {
        self.presentation_context_id = Some(id);
    }

    /// The raw _Command Field_ value.
    pub fn command_field_code(&self) -> Result<u16> {
        required_u16(&self.command, tags::COMMAND_FIELD, "CommandField")
    }

    pub fn command_field(&self) -> Option<CommandField> {
        self.command_field_code()
            .ok()
            .and_then(CommandField::from_code)
    }

    pub fn message_id(&self) -> Option<u16> {
        optional_u16(&self.command, tags::MESSAGE_ID)
    }

    pub fn set_message_id(&mut self, message_id: u16) {
        put_u16(&mut self.command, tags::MESSAGE_ID, message_id);
    }

    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        optional_u16(&self.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        optional_uid(&self.command, tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        optional_uid(&self.command, tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Option<String> {
        optional_uid(&self.command, tags::REQUESTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_instance_uid(&self) -> Option<String> {
        optional_uid(&self.command, tags::REQUESTED_SOP_INSTANCE_UID)
    }

    /// The SOP class this message operates on, affected or requested.
    pub fn sop_class_uid(&self) -> Option<String> {
        self.affected_sop_class_uid()
            .or_else(|| self.requested_sop_class_uid())
    }

    /// Whether the command set announces a data set.
    pub fn has_dataset(&self) -> bool {
        optional_u16(&self.command, tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != NO_DATASET)
            .unwrap_or(false)
    }

    fn update_dataset_type(&mut self) {
        let value = if self.dataset.is_some() { 0x0001 } else { NO_DATASET };
        put_u16(&mut self.command, tags::COMMAND_DATA_SET_TYPE, value);
    }

    /// Encode the command set in _Implicit VR Little Endian_,
    /// recomputing the _Command Group Length_ element.
    pub fn encode_command(&self) -> Result<Vec<u8>> {
        let mut command = self.command.clone();
        command.remove_element(tags::COMMAND_GROUP_LENGTH);
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();

        let mut body = Vec::new();
        command
            .write_dataset_with_ts(&mut body, &ts)
            .context(EncodeCommandSnafu)?;

        command.put(DataElement::new(
            tags::COMMAND_GROUP_LENGTH,
            VR::UL,
            PrimitiveValue::from(body.len() as u32),
        ));
        let mut bytes = Vec::with_capacity(body.len() + 12);
        command
            .write_dataset_with_ts(&mut bytes, &ts)
            .context(EncodeCommandSnafu)?;
        Ok(bytes)
    }

    /// Decode a command set from its _Implicit VR Little Endian_ encoding.
    pub fn decode_command(bytes: &[u8]) -> Result<InMemDicomObject> {
        InMemDicomObject::read_dataset_with_ts(bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(DecodeCommandSnafu)
    }
}

/// A received message, classified by its command field.
#[derive(Debug)]
pub enum Message {
    Request(DicomRequest),
    Response(DicomResponse),
    /// A command whose field is not known to this implementation.
    Unknown(DicomMessage),
}

impl Message {
    pub fn from_message(message: DicomMessage) -> Message {
        match message.command_field() {
            Some(field) if field.is_request() => Message::Request(DicomRequest {
                message,
                field,
                received: None,
            }),
            Some(field) => Message::Response(DicomResponse { message, field }),
            None => Message::Unknown(message),
        }
    }
}

/// A DIMSE request message.
#[derive(Debug)]
pub struct DicomRequest {
    message: DicomMessage,
    field: CommandField,
    received: Option<ReceivedInstance>,
}

impl DicomRequest {
    fn with_command(field: CommandField, elements: Vec<DataElement<InMemDicomObject>>) -> Self {
        let mut command = InMemDicomObject::from_element_iter(elements);
        put_u16(&mut command, tags::COMMAND_FIELD, field.code());
        let mut message = DicomMessage::new(command);
        message.update_dataset_type();
        DicomRequest {
            message,
            field,
            received: None,
        }
    }

    /// Build a request from an already parsed command.
    pub fn from_message(message: DicomMessage) -> Result<Self> {
        let code = message.command_field_code()?;
        let field = CommandField::from_code(code)
            .filter(|f| f.is_request())
            .context(UnknownCommandFieldSnafu { code })?;
        Ok(DicomRequest {
            message,
            field,
            received: None,
        })
    }

    /// A C-ECHO request on the Verification SOP class.
    pub fn c_echo() -> Self {
        DicomRequest::with_command(
            CommandField::CEchoRq,
            vec![uid_element(tags::AFFECTED_SOP_CLASS_UID, uids::VERIFICATION)],
        )
    }

    /// A C-STORE request for the given data set.
    ///
    /// The affected SOP class and instance are taken from the data set.
    pub fn c_store(dataset: Dataset) -> Result<Self> {
        let sop_class_uid = optional_uid(dataset.object(), tags::SOP_CLASS_UID)
            .context(MissingElementSnafu { name: "SOPClassUID" })?;
        let sop_instance_uid = optional_uid(dataset.object(), tags::SOP_INSTANCE_UID)
            .context(MissingElementSnafu {
                name: "SOPInstanceUID",
            })?;
        let mut request = DicomRequest::with_command(
            CommandField::CStoreRq,
            vec![
                uid_element(tags::AFFECTED_SOP_CLASS_UID, &sop_class_uid),
                uid_element(tags::AFFECTED_SOP_INSTANCE_UID, &sop_instance_uid),
                u16_element(tags::PRIORITY, Priority::Medium.code()),
            ],
        );
        request.message.set_dataset(Some(dataset));
        Ok(request)
    }

    pub fn c_find(sop_class_uid: &str, identifier: Dataset) -> Self {
        let mut request = DicomRequest::with_command(
            CommandField::CFindRq,
            vec![
                uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
                u16_element(tags::PRIORITY, Priority::Medium.code()),
            ],
        );
        request.message.set_dataset(Some(identifier));
        request
    }

    pub fn c_get(sop_class_uid: &str, identifier: Dataset) -> Self {
        let mut request = DicomRequest::with_command(
            CommandField::CGetRq,
            vec![
                uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
                u16_element(tags::PRIORITY, Priority::Medium.code()),
            ],
        );
        request.message.set_dataset(Some(identifier));
        request
    }

    pub fn c_move(sop_class_uid: &str, destination_ae: &str, identifier: Dataset) -> Self {
        let mut request = DicomRequest::with_command(
            CommandField::CMoveRq,
            vec![
                uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
                u16_element(tags::PRIORITY, Priority::Medium.code()),
                DataElement::new(
                    tags::MOVE_DESTINATION,
                    VR::AE,
                    PrimitiveValue::from(destination_ae),
                ),
            ],
        );
        request.message.set_dataset(Some(identifier));
        request
    }

    /// Cancel the operation started by the request with the given message ID.
    pub fn c_cancel(message_id: u16) -> Self {
        DicomRequest::with_command(
            CommandField::CCancelRq,
            vec![u16_element(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id)],
        )
    }

    pub fn n_create(
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
        attributes: Option<Dataset>,
    ) -> Self {
        let mut elements = vec![uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid)];
        if let Some(uid) = sop_instance_uid {
            elements.push(uid_element(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        let mut request = DicomRequest::with_command(CommandField::NCreateRq, elements);
        request.message.set_dataset(attributes);
        request
    }

    pub fn n_set(sop_class_uid: &str, sop_instance_uid: &str, modifications: Dataset) -> Self {
        let mut request = DicomRequest::with_command(
            CommandField::NSetRq,
            vec![
                uid_element(tags::REQUESTED_SOP_CLASS_UID, sop_class_uid),
                uid_element(tags::REQUESTED_SOP_INSTANCE_UID, sop_instance_uid),
            ],
        );
        request.message.set_dataset(Some(modifications));
        request
    }

    /// An N-GET request; an empty attribute list asks for all attributes.
    pub fn n_get(sop_class_uid: &str, sop_instance_uid: &str, attributes: &[Tag]) -> Self {
        let mut elements = vec![
            uid_element(tags::REQUESTED_SOP_CLASS_UID, sop_class_uid),
            uid_element(tags::REQUESTED_SOP_INSTANCE_UID, sop_instance_uid),
        ];
        if !attributes.is_empty() {
            elements.push(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                PrimitiveValue::Tags(attributes.iter().copied().collect()),
            ));
        }
        DicomRequest::with_command(CommandField::NGetRq, elements)
    }

    pub fn n_delete(sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        DicomRequest::with_command(
            CommandField::NDeleteRq,
            vec![
                uid_element(tags::REQUESTED_SOP_CLASS_UID, sop_class_uid),
                uid_element(tags::REQUESTED_SOP_INSTANCE_UID, sop_instance_uid),
            ],
        )
    }

    pub fn n_action(
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
        information: Option<Dataset>,
    ) -> Self {
        let mut request = DicomRequest::with_command(
            CommandField::NActionRq,
            vec![
                uid_element(tags::REQUESTED_SOP_CLASS_UID, sop_class_uid),
                uid_element(tags::REQUESTED_SOP_INSTANCE_UID, sop_instance_uid),
                u16_element(tags::ACTION_TYPE_ID, action_type_id),
            ],
        );
        request.message.set_dataset(information);
        request
    }

    pub fn n_event_report(
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
        information: Option<Dataset>,
    ) -> Self {
        let mut request = DicomRequest::with_command(
            CommandField::NEventReportRq,
            vec![
                uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
                uid_element(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
                u16_element(tags::EVENT_TYPE_ID, event_type_id),
            ],
        );
        request.message.set_dataset(information);
        request
    }

    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.message.set_message_id(message_id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        put_u16(&mut self.message.command, tags::PRIORITY, priority.code());
        self
    }

    pub fn field(&self) -> CommandField {
        self.field
    }

    pub fn message(&self) -> &DicomMessage {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut DicomMessage {
        &mut self.message
    }

    pub fn into_message(self) -> DicomMessage {
        self.message
    }

    pub fn message_id(&self) -> Option<u16> {
        self.message.message_id()
    }

    pub fn priority(&self) -> Priority {
        optional_u16(&self.message.command, tags::PRIORITY)
            .and_then(Priority::from_code)
            .unwrap_or_default()
    }

    pub fn sop_class_uid(&self) -> Option<String> {
        self.message.sop_class_uid()
    }

    pub fn sop_instance_uid(&self) -> Option<String> {
        self.message
            .affected_sop_instance_uid()
            .or_else(|| self.message.requested_sop_instance_uid())
    }

    /// The data set of the request.
    ///
    /// For a received C-STORE this is the parsed instance.
    pub fn dataset(&self) -> Option<&Dataset> {
        self.message
            .dataset()
            .or_else(|| self.received.as_ref().map(|r| r.dataset()))
    }

    /// The instance received through a storage sink, if any.
    pub fn received_instance(&self) -> Option<&ReceivedInstance> {
        self.received.as_ref()
    }

    pub fn take_received_instance(&mut self) -> Option<ReceivedInstance> {
        self.received.take()
    }

    pub(crate) fn set_received_instance(&mut self, instance: ReceivedInstance) {
        self.received = Some(instance);
    }

    /// For C-CANCEL, the message ID of the operation to cancel.
    pub fn cancelled_message_id(&self) -> Option<u16> {
        self.message.message_id_being_responded_to()
    }

    pub fn move_destination(&self) -> Option<String> {
        optional_str(&self.message.command, tags::MOVE_DESTINATION)
    }

    pub fn action_type_id(&self) -> Option<u16> {
        optional_u16(&self.message.command, tags::ACTION_TYPE_ID)
    }

    pub fn event_type_id(&self) -> Option<u16> {
        optional_u16(&self.message.command, tags::EVENT_TYPE_ID)
    }
}

impl fmt::Display for DicomRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_id() {
            Some(id) => write!(f, "{} [{}]", self.field, id),
            None => write!(f, "{}", self.field),
        }
    }
}

/// A DIMSE response message.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomResponse {
    message: DicomMessage,
    field: CommandField,
}

impl DicomResponse {
    /// Create a response to the given request with the given status.
    pub fn new(request: &DicomRequest, status: Status) -> Self {
        let field = request.field.response();
        let mut command = InMemDicomObject::new_empty();
        put_u16(&mut command, tags::COMMAND_FIELD, field.code());
        if let Some(id) = request.message_id() {
            put_u16(&mut command, tags::MESSAGE_ID_BEING_RESPONDED_TO, id);
        }
        if let Some(uid) = request.sop_class_uid() {
            command.put(uid_element(tags::AFFECTED_SOP_CLASS_UID, &uid));
        }
        if let Some(uid) = request.sop_instance_uid() {
            command.put(uid_element(tags::AFFECTED_SOP_INSTANCE_UID, &uid));
        }
        put_u16(&mut command, tags::STATUS, status.code());

        let mut message = DicomMessage::new(command);
        message.update_dataset_type();
        if let Some(id) = request.message.presentation_context_id() {
            message.set_presentation_context_id(id);
        }
        DicomResponse { message, field }
    }

    /// Build a response from an already parsed command.
    pub fn from_message(message: DicomMessage) -> Result<Self> {
        let code = message.command_field_code()?;
        let field = CommandField::from_code(code)
            .filter(|f| !f.is_request())
            .context(UnknownCommandFieldSnafu { code })?;
        Ok(DicomResponse { message, field })
    }

    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.message.set_dataset(Some(dataset));
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        put_u16(&mut self.message.command, tags::STATUS, status.code());
        self
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        let mut comment: String = comment.into();
        // LO holds at most 64 characters
        if let Some((i, _)) = comment.char_indices().nth(64) {
            comment.truncate(i);
        }
        self.message.command.put(DataElement::new(
            tags::ERROR_COMMENT,
            VR::LO,
            PrimitiveValue::from(comment),
        ));
        self
    }

    /// Set the sub-operation counters of a C-MOVE or C-GET response.
    pub fn with_sub_operations(mut self, remaining: u16, completed: u16, failed: u16, warning: u16) -> Self {
        let command = &mut self.message.command;
        put_u16(command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS, remaining);
        put_u16(command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, completed);
        put_u16(command, tags::NUMBER_OF_FAILED_SUBOPERATIONS, failed);
        put_u16(command, tags::NUMBER_OF_WARNING_SUBOPERATIONS, warning);
        self
    }

    pub fn field(&self) -> CommandField {
        self.field
    }

    pub fn message(&self) -> &DicomMessage {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut DicomMessage {
        &mut self.message
    }

    pub fn into_message(self) -> DicomMessage {
        self.message
    }

    /// The response status. A missing _Status_ element reads as a failure.
    pub fn status(&self) -> Status {
        optional_u16(&self.message.command, tags::STATUS)
            .map(Status)
            .unwrap_or(Status::PROCESSING_FAILURE)
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_pending()
    }

    /// The message ID of the request this response answers.
    pub fn request_message_id(&self) -> Option<u16> {
        self.message.message_id_being_responded_to()
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.message.dataset()
    }

    pub fn error_comment(&self) -> Option<String> {
        optional_str(&self.message.command, tags::ERROR_COMMENT)
    }

    pub fn remaining_sub_operations(&self) -> Option<u16> {
        optional_u16(&self.message.command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
    }

    pub fn completed_sub_operations(&self) -> Option<u16> {
        optional_u16(&self.message.command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)
    }

    pub fn failed_sub_operations(&self) -> Option<u16> {
        optional_u16(&self.message.command, tags::NUMBER_OF_FAILED_SUBOPERATIONS)
    }

    pub fn warning_sub_operations(&self) -> Option<u16> {
        optional_u16(&self.message.command, tags::NUMBER_OF_WARNING_SUBOPERATIONS)
    }
}

impl fmt::Display for DicomResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.request_message_id() {
            Some(id) => write!(f, "{} [{}]: {}", self.field, id, self.status())?,
            None => write!(f, "{}: {}", self.field, self.status())?,
        }
        if let (Some(remaining), Some(completed), Some(failed), Some(warning)) = (
            self.remaining_sub_operations(),
            self.completed_sub_operations(),
            self.failed_sub_operations(),
            self.warning_sub_operations(),
        ) {
            write!(
                f,
                " (remaining: {}, completed: {}, failed: {}, warnings: {})",
                remaining, completed, failed, warning
            )?;
        }
        if self.status().state() != StatusState::Success {
            if let Some(comment) = self.error_comment() {
                write!(f, " \"{}\"", comment)?;
            }
        }
        Ok(())
    }
}

fn u16_element(tag: Tag, value: u16) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn uid_element(tag: Tag, uid: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::UI, PrimitiveValue::from(uid))
}

fn put_u16(obj: &mut InMemDicomObject, tag: Tag, value: u16) {
    obj.put(u16_element(tag, value));
}

fn required_u16(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<u16> {
    obj.element(tag)
        .ok()
        .context(MissingElementSnafu { name })?
        .to_int::<u16>()
        .context(ConvertElementSnafu { name })
}

fn optional_u16(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.element(tag).ok()?.to_int::<u16>().ok()
}

fn optional_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value: Cow<str> = obj.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_end_matches(|c: char| c == '\0' || c == ' ');
    Some(value.to_string())
}

fn optional_uid(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    optional_str(obj, tag)
        .map(trim_uid)
        .filter(|uid| !uid.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CommandField::CEchoRq, CommandField::CEchoRsp)]
    #[case(CommandField::CStoreRq, CommandField::CStoreRsp)]
    #[case(CommandField::NEventReportRq, CommandField::NEventReportRsp)]
    #[case(CommandField::CCancelRq, CommandField::CCancelRsp)]
    #[case(CommandField::CFindRsp, CommandField::CFindRsp)]
    fn response_field(#[case] request: CommandField, #[case] response: CommandField) {
        assert_eq!(request.response(), response);
        assert!(!response.is_request());
        assert_eq!(CommandField::from_code(request.code()), Some(request));
    }

    #[test]
    fn echo_request_has_no_dataset() {
        let request = DicomRequest::c_echo().with_message_id(3);
        assert_eq!(request.field(), CommandField::CEchoRq);
        assert_eq!(request.message_id(), Some(3));
        assert!(!request.message().has_dataset());
        assert_eq!(
            request.sop_class_uid().as_deref(),
            Some(uids::VERIFICATION)
        );
    }

    #[test]
    fn command_round_trip_recomputes_group_length() {
        let request = DicomRequest::c_echo().with_message_id(7);
        let bytes = request.message().encode_command().unwrap();
        let command = DicomMessage::decode_command(&bytes).unwrap();

        let group_length = command
            .element(tags::COMMAND_GROUP_LENGTH)
            .unwrap()
            .to_int::<u32>()
            .unwrap();
        // the group length element itself takes 12 bytes in implicit VR
        assert_eq!(group_length as usize, bytes.len() - 12);

        let message = DicomMessage::new(command);
        assert_eq!(message.command_field(), Some(CommandField::CEchoRq));
        assert_eq!(message.message_id(), Some(7));
    }

    #[test]
    fn store_request_takes_uids_from_dataset() {
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from("1.2.3")),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")),
        ]);
        let request = DicomRequest::c_store(Dataset::new(object)).unwrap();
        assert!(request.message().has_dataset());
        assert_eq!(request.sop_class_uid().as_deref(), Some("1.2.3"));
        assert_eq!(request.sop_instance_uid().as_deref(), Some("1.2.3.4"));
        assert_eq!(request.priority(), Priority::Medium);

        let missing = DicomRequest::c_store(Dataset::new(InMemDicomObject::new_empty()));
        assert!(matches!(missing, Err(Error::MissingElement { .. })));
    }

    #[test]
    fn response_links_to_request() {
        let request = DicomRequest::c_echo().with_message_id(3);
        let response = DicomResponse::new(&request, Status::SUCCESS);
        assert_eq!(response.field(), CommandField::CEchoRsp);
        assert_eq!(response.request_message_id(), Some(3));
        assert_eq!(response.status(), Status::SUCCESS);
        assert_eq!(response.to_string(), "C-ECHO-RSP [3]: Success [0000: Success]");
    }

    #[test]
    fn response_display_with_counters_and_comment() {
        let request = DicomRequest::c_move("1.2.840.10008.5.1.4.1.2.1.2", "DEST", Dataset::new(InMemDicomObject::new_empty()))
            .with_message_id(5);
        let response = DicomResponse::new(&request, Status::PROCESSING_FAILURE)
            .with_sub_operations(0, 2, 1, 0)
            .with_error_comment("boom");
        assert_eq!(
            response.to_string(),
            "C-MOVE-RSP [5]: Failure [0110: Processing failure] \
             (remaining: 0, completed: 2, failed: 1, warnings: 0) \"boom\""
        );
    }

    #[test]
    fn cancel_request_refers_to_operation() {
        let request = DicomRequest::c_cancel(9);
        assert_eq!(request.cancelled_message_id(), Some(9));
        assert_eq!(request.message_id(), None);
        let response = DicomResponse::new(&request, Status::SUCCESS);
        assert_eq!(response.field(), CommandField::CCancelRsp);
    }

    #[test]
    fn unknown_command_field_is_kept() {
        let command = InMemDicomObject::from_element_iter([u16_element(tags::COMMAND_FIELD, 0x0999)]);
        let message = Message::from_message(DicomMessage::new(command));
        assert!(matches!(message, Message::Unknown(_)));
    }

    #[test]
    fn remove_group_lengths_from_dataset() {
        let mut dataset = Dataset::new(InMemDicomObject::from_element_iter([
            DataElement::new(Tag(0x0008, 0x0000), VR::UL, PrimitiveValue::from(10_u32)),
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from("1.2.3")),
        ]));
        dataset.remove_group_lengths();
        assert!(dataset.object().element(Tag(0x0008, 0x0000)).is_err());
        assert!(dataset.object().element(tags::SOP_CLASS_UID).is_ok());
    }

    #[test]
    fn dataset_round_trip() {
        let dataset = Dataset::new(InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Doe^John"),
        )]));
        let bytes = dataset.encode().unwrap();
        let decoded = Dataset::decode(&bytes, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(
            decoded.object().element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Doe^John"
        );
    }
}
