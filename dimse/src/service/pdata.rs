//! P-Data fragmentation and reassembly.
//!
//! Outgoing messages are cut into presentation data values
//! by a [`PDataFragmenter`],
//! which packs them into P-DATA-TF PDUs
//! no larger than the negotiated maximum length.
//! Incoming values are put back together by a [`Reassembler`]:
//! command fragments first, then data set fragments,
//! which for C-STORE requests go straight into a storage sink.
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::warn;

use crate::message::{self, CommandField, Dataset, DicomMessage};
use crate::pdu::{PDataValue, PDataValueType, Pdu, PDV_HEADER_SIZE};
use crate::storage::{self, StoreMeta, StoreSink, StoreStorage};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Received a command fragment while a data set was expected"))]
    UnexpectedCommandFragment { backtrace: Backtrace },
    #[snafu(display("Received a data set fragment without a preceding command"))]
    UnexpectedDataFragment { backtrace: Backtrace },
    #[snafu(display(
        "Fragment for presentation context {} interleaved with a message on context {}",
        got,
        expected
    ))]
    ContextMismatch {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not decode command set"))]
    DecodeCommand {
        #[snafu(backtrace)]
        source: message::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Splits encoded messages into P-DATA-TF PDUs.
#[derive(Debug, Copy, Clone)]
pub struct PDataFragmenter {
    presentation_context_id: u8,
    /// the peer's maximum PDU length, 0 for unlimited
    max_pdu_length: u32,
    max_command_buffer: u32,
    max_data_buffer: u32,
}

impl PDataFragmenter {
    pub fn new(
        presentation_context_id: u8,
        max_pdu_length: u32,
        max_command_buffer: u32,
        max_data_buffer: u32,
    ) -> Self {
        PDataFragmenter {
            presentation_context_id,
            max_pdu_length,
            max_command_buffer,
            max_data_buffer,
        }
    }

    /// The largest PDU length to use for values of the given type.
    fn pdu_budget(&self, value_type: PDataValueType) -> usize {
        let buffer = match value_type {
            PDataValueType::Command => self.max_command_buffer,
            PDataValueType::Data => self.max_data_buffer,
        };
        let budget = match self.max_pdu_length {
            0 => buffer,
            max => max.min(buffer),
        };
        // always leave room for at least one byte of payload
        budget.max(PDV_HEADER_SIZE + 1) as usize
    }

    /// Produce the PDUs carrying the given command set
    /// and optional data set, in order.
    pub fn fragments<'a>(&self, command: &'a [u8], dataset: Option<&'a [u8]>) -> Fragments<'a> {
        let mut segments = vec![(PDataValueType::Command, command)];
        if let Some(dataset) = dataset {
            segments.push((PDataValueType::Data, dataset));
        }
        Fragments {
            fragmenter: *self,
            segments,
            segment: 0,
            offset: 0,
        }
    }
}

/// Iterator over the PDUs of one message.
#[derive(Debug)]
pub struct Fragments<'a> {
    fragmenter: PDataFragmenter,
    segments: Vec<(PDataValueType, &'a [u8])>,
    segment: usize,
    offset: usize,
}

impl Iterator for Fragments<'_> {
    type Item = Pdu;

    fn next(&mut self) -> Option<Pdu> {
        let mut values = Vec::new();
        // PDU length so far, in terms of the PDU length field
        let mut used = 0_usize;

        while let Some(&(value_type, bytes)) = self.segments.get(self.segment) {
            let budget = self.fragmenter.pdu_budget(value_type);
            let room = budget.saturating_sub(used + PDV_HEADER_SIZE as usize);
            if room == 0 {
                break;
            }
            let remaining = bytes.len() - self.offset;
            let len = room.min(remaining);
            let is_last = len == remaining;
            values.push(PDataValue {
                presentation_context_id: self.fragmenter.presentation_context_id,
                value_type,
                is_last,
                data: bytes[self.offset..self.offset + len].to_vec(),
            });
            used += PDV_HEADER_SIZE as usize + len;

            if is_last {
                self.segment += 1;
                self.offset = 0;
            } else {
                self.offset += len;
                break;
            }
        }

        if values.is_empty() {
            None
        } else {
            Some(Pdu::PData { data: values })
        }
    }
}

/// Where the data set of a message in progress goes.
enum DataBuffer {
    Memory(Vec<u8>),
    Sink {
        meta: StoreMeta,
        sink: Box<dyn StoreSink>,
    },
    /// the data set is thrown away,
    /// optionally because storing it failed
    Discard {
        meta: Option<StoreMeta>,
        error: Option<storage::Error>,
    },
}

struct Partial {
    presentation_context_id: u8,
    command: Vec<u8>,
    /// the decoded command, once all its fragments arrived
    message: Option<DicomMessage>,
    data: Option<DataBuffer>,
}

/// A message put back together from its fragments.
pub enum Reassembled {
    /// a complete message, with its data set if any
    Message(DicomMessage),
    /// the data set arrived but could not be decoded
    DatasetError {
        message: DicomMessage,
        error: message::Error,
    },
    /// a C-STORE request whose data set was written to a sink
    /// which still has to be finished
    Store {
        message: DicomMessage,
        meta: StoreMeta,
        sink: Box<dyn StoreSink>,
    },
    /// a C-STORE request whose data set could not be stored
    StoreFailed {
        message: DicomMessage,
        meta: StoreMeta,
        error: storage::Error,
    },
}

impl std::fmt::Debug for Reassembled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reassembled::Message(message) => f.debug_tuple("Message").field(message).finish(),
            Reassembled::DatasetError { message, error } => f
                .debug_struct("DatasetError")
                .field("message", message)
                .field("error", error)
                .finish(),
            Reassembled::Store { message, meta, .. } => f
                .debug_struct("Store")
                .field("message", message)
                .field("meta", meta)
                .finish_non_exhaustive(),
            Reassembled::StoreFailed {
                message,
                meta,
                error,
            } => f
                .debug_struct("StoreFailed")
                .field("message", message)
                .field("meta", meta)
                .field("error", error)
                .finish(),
        }
    }
}

/// Collects incoming presentation data values into messages.
///
/// Only one message is in progress at a time.
#[derive(Default)]
pub struct Reassembler {
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler::default()
    }

    /// Whether a message is partially received.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Whether [`push`](Reassembler::push)ing this value
    /// may call into the storage,
    /// either to open a sink for a complete C-STORE command
    /// or to write a data set fragment into one.
    pub fn touches_storage(&self, pdv: &PDataValue) -> bool {
        match pdv.value_type {
            PDataValueType::Command => pdv.is_last,
            PDataValueType::Data => matches!(
                self.partial,
                Some(Partial {
                    data: Some(DataBuffer::Sink { .. }),
                    ..
                })
            ),
        }
    }

    /// Feed the next value.
    ///
    /// `transfer_syntax` is the accepted transfer syntax
    /// of the value's presentation context.
    /// `storage` receives the data sets of C-STORE requests;
    /// when absent, those data sets are discarded.
    pub fn push(
        &mut self,
        pdv: PDataValue,
        transfer_syntax: &str,
        storage: Option<&dyn StoreStorage>,
    ) -> Result<Option<Reassembled>> {
        if let Some(partial) = &self.partial {
            ensure!(
                partial.presentation_context_id == pdv.presentation_context_id,
                ContextMismatchSnafu {
                    expected: partial.presentation_context_id,
                    got: pdv.presentation_context_id,
                }
            );
        }

        match pdv.value_type {
            PDataValueType::Command => self.push_command(pdv, transfer_syntax, storage),
            PDataValueType::Data => self.push_data(pdv, transfer_syntax),
        }
    }

    fn push_command(
        &mut self,
        pdv: PDataValue,
        transfer_syntax: &str,
        storage: Option<&dyn StoreStorage>,
    ) -> Result<Option<Reassembled>> {
        let partial = self.partial.get_or_insert_with(|| Partial {
            presentation_context_id: pdv.presentation_context_id,
            command: Vec::new(),
            message: None,
            data: None,
        });
        ensure!(partial.message.is_none(), UnexpectedCommandFragmentSnafu);
        partial.command.extend_from_slice(&pdv.data);
        if !pdv.is_last {
            return Ok(None);
        }

        let bytes = std::mem::take(&mut partial.command);
        let command = match DicomMessage::decode_command(&bytes) {
            Ok(command) => command,
            Err(source) => {
                self.partial = None;
                return Err(source).context(DecodeCommandSnafu);
            }
        };
        let mut message = DicomMessage::new(command);
        message.set_presentation_context_id(pdv.presentation_context_id);

        if !message.has_dataset() {
            self.partial = None;
            return Ok(Some(Reassembled::Message(message)));
        }

        let data = if message.command_field() == Some(CommandField::CStoreRq) {
            let meta = StoreMeta {
                presentation_context_id: pdv.presentation_context_id,
                message_id: message.message_id().unwrap_or(0),
                sop_class_uid: message.affected_sop_class_uid().unwrap_or_default(),
                sop_instance_uid: message.affected_sop_instance_uid().unwrap_or_default(),
                transfer_syntax: transfer_syntax.to_string(),
            };
            match storage {
                Some(storage) => match storage.create_sink(&meta) {
                    Ok(sink) => DataBuffer::Sink { meta, sink },
                    Err(error) => DataBuffer::Discard {
                        meta: Some(meta),
                        error: Some(error),
                    },
                },
                None => DataBuffer::Discard {
                    meta: None,
                    error: None,
                },
            }
        } else {
            DataBuffer::Memory(Vec::new())
        };
        partial.message = Some(message);
        partial.data = Some(data);
        Ok(None)
    }

    fn push_data(&mut self, pdv: PDataValue, transfer_syntax: &str) -> Result<Option<Reassembled>> {
        let partial = match &mut self.partial {
            Some(partial) if partial.message.is_some() => partial,
            _ => return UnexpectedDataFragmentSnafu.fail(),
        };

        match &mut partial.data {
            Some(DataBuffer::Memory(buffer)) => buffer.extend_from_slice(&pdv.data),
            Some(DataBuffer::Sink { sink, meta }) => {
                if let Err(error) = sink.write_fragment(&pdv.data) {
                    warn!(
                        "Could not write fragment of instance {}: {}",
                        meta.sop_instance_uid, error
                    );
                    partial.data = Some(DataBuffer::Discard {
                        meta: Some(meta.clone()),
                        error: Some(error),
                    });
                }
            }
            Some(DataBuffer::Discard { .. }) | None => {}
        }

        if !pdv.is_last {
            return Ok(None);
        }

        let Some(Partial {
            message: Some(message),
            data,
            ..
        }) = self.partial.take()
        else {
            return UnexpectedDataFragmentSnafu.fail();
        };

        let out = match data {
            Some(DataBuffer::Memory(bytes)) => match Dataset::decode(&bytes, transfer_syntax) {
                Ok(dataset) => {
                    let mut message = message;
                    message.set_dataset(Some(dataset));
                    Reassembled::Message(message)
                }
                Err(error) => Reassembled::DatasetError { message, error },
            },
            Some(DataBuffer::Sink { meta, sink }) => Reassembled::Store {
                message,
                meta,
                sink,
            },
            Some(DataBuffer::Discard {
                meta: Some(meta),
                error: Some(error),
            }) => Reassembled::StoreFailed {
                message,
                meta,
                error,
            },
            Some(DataBuffer::Discard { .. }) | None => Reassembled::Message(message),
        };
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DicomRequest;
    use crate::pdu::MINIMUM_PDU_SIZE;
    use crate::storage::MemoryStorage;
    use dicom_core::value::PrimitiveValue;
    use dicom_core::{DataElement, VR};
    use dicom_dictionary_std::{tags, uids};
    use dicom_object::InMemDicomObject;
    use matches::assert_matches;

    fn pdvs(pdus: impl IntoIterator<Item = Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                pdu => panic!("Expected PData, got {:?}", pdu),
            })
            .collect()
    }

    #[test]
    fn large_data_set_is_split() {
        let command = vec![0xAA; 80];
        let dataset: Vec<u8> = (0..9000).map(|x: u32| x as u8).collect();
        let fragmenter = PDataFragmenter::new(1, MINIMUM_PDU_SIZE, 1024, 1 << 20);
        let pdus: Vec<_> = fragmenter.fragments(&command, Some(&dataset)).collect();

        for pdu in &pdus {
            let Pdu::PData { data } = pdu else {
                panic!("Expected PData, got {:?}", pdu)
            };
            let length: usize = data
                .iter()
                .map(|pdv| PDV_HEADER_SIZE as usize + pdv.data.len())
                .sum();
            assert!(length <= MINIMUM_PDU_SIZE as usize);
        }

        let values = pdvs(pdus);
        let data: Vec<_> = values
            .iter()
            .filter(|pdv| pdv.value_type == PDataValueType::Data)
            .collect();
        assert!(data.len() > 1);
        let (last, rest) = data.split_last().unwrap();
        assert!(last.is_last);
        assert!(rest.iter().all(|pdv| !pdv.is_last));

        let joined: Vec<u8> = data.iter().flat_map(|pdv| pdv.data.iter().copied()).collect();
        assert_eq!(joined, dataset);
    }

    #[test]
    fn command_buffer_limits_command_fragments() {
        let command = vec![0x11; 300];
        let fragmenter = PDataFragmenter::new(3, 0, 128, 1 << 20);
        let values = pdvs(fragmenter.fragments(&command, None));
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|pdv| pdv.data.len() <= 128 - 6));
        assert!(values.iter().all(|pdv| pdv.presentation_context_id == 3));
        assert!(values[2].is_last);
    }

    #[test]
    fn empty_data_set_still_ends() {
        let fragmenter = PDataFragmenter::new(1, 16_384, 1024, 1 << 20);
        let values = pdvs(fragmenter.fragments(&[1, 2, 3], Some(&[])));
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].value_type, PDataValueType::Data);
        assert!(values[1].is_last);
        assert!(values[1].data.is_empty());
    }

    fn push_all(
        reassembler: &mut Reassembler,
        values: Vec<PDataValue>,
    ) -> Vec<Reassembled> {
        values
            .into_iter()
            .filter_map(|pdv| {
                reassembler
                    .push(pdv, uids::EXPLICIT_VR_LITTLE_ENDIAN, Some(&MemoryStorage))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn command_only_message() {
        let request = DicomRequest::c_echo().with_message_id(1);
        let command = request.message().encode_command().unwrap();
        let fragmenter = PDataFragmenter::new(1, 0, 16, 1 << 20);
        let values = pdvs(fragmenter.fragments(&command, None));
        assert!(values.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut out = push_all(&mut reassembler, values);
        assert_eq!(out.len(), 1);
        assert!(!reassembler.in_progress());
        let Some(Reassembled::Message(message)) = out.pop() else {
            panic!("expected a message");
        };
        assert_eq!(message.command_field(), Some(CommandField::CEchoRq));
        assert_eq!(message.message_id(), Some(1));
        assert_eq!(message.presentation_context_id(), Some(1));
    }

    #[test]
    fn find_message_in_five_fragments() {
        let identifier = InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^John")),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("0123456789")),
            DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, PrimitiveValue::from("SERIES")),
        ]);
        let request = DicomRequest::c_find(
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            Dataset::new(identifier.clone()),
        )
        .with_message_id(2);
        let command = request.message().encode_command().unwrap();
        let data = request.dataset().unwrap().encode().unwrap();

        // five data fragments of roughly equal size
        let chunk = (data.len() + 4) / 5;
        let mut values = vec![PDataValue {
            presentation_context_id: 5,
            value_type: PDataValueType::Command,
            is_last: true,
            data: command,
        }];
        let chunks: Vec<_> = data.chunks(chunk).collect();
        assert_eq!(chunks.len(), 5);
        for (i, part) in chunks.iter().enumerate() {
            values.push(PDataValue {
                presentation_context_id: 5,
                value_type: PDataValueType::Data,
                is_last: i == 4,
                data: part.to_vec(),
            });
        }

        let mut reassembler = Reassembler::new();
        let mut out = push_all(&mut reassembler, values);
        assert_eq!(out.len(), 1);
        let Some(Reassembled::Message(message)) = out.pop() else {
            panic!("expected a message");
        };
        assert_eq!(message.command_field(), Some(CommandField::CFindRq));
        assert_eq!(message.message_id(), Some(2));
        let received = message.dataset().unwrap().object();
        for tag in [tags::PATIENT_NAME, tags::PATIENT_ID, tags::QUERY_RETRIEVE_LEVEL] {
            assert_eq!(
                received.element(tag).unwrap().to_str().unwrap(),
                identifier.element(tag).unwrap().to_str().unwrap(),
            );
        }
    }

    #[test]
    fn store_goes_to_sink() {
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")),
        ]);
        let request = DicomRequest::c_store(Dataset::new(object)).unwrap().with_message_id(4);
        let command = request.message().encode_command().unwrap();
        let data = request.dataset().unwrap().encode().unwrap();
        let values = pdvs(PDataFragmenter::new(1, 0, 1024, 20).fragments(&command, Some(&data)));

        let mut reassembler = Reassembler::new();
        let mut out = push_all(&mut reassembler, values);
        assert_matches!(
            out.pop(),
            Some(Reassembled::Store { meta, .. }) if meta.message_id == 4 && meta.sop_instance_uid == "1.2.3.4"
        );
    }

    #[test]
    fn only_store_fragments_touch_storage() {
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")),
        ]);
        let request = DicomRequest::c_store(Dataset::new(object)).unwrap().with_message_id(4);
        let command = request.message().encode_command().unwrap();
        let data = request.dataset().unwrap().encode().unwrap();
        let values = pdvs(PDataFragmenter::new(1, 0, 16, 20).fragments(&command, Some(&data)));

        for storage in [Some(&MemoryStorage as &dyn StoreStorage), None] {
            let mut reassembler = Reassembler::new();
            for pdv in values.clone() {
                let expected = match pdv.value_type {
                    PDataValueType::Command => pdv.is_last,
                    // without storage the data set is discarded
                    PDataValueType::Data => storage.is_some(),
                };
                assert_eq!(reassembler.touches_storage(&pdv), expected);
                reassembler
                    .push(pdv, uids::EXPLICIT_VR_LITTLE_ENDIAN, storage)
                    .unwrap();
            }
        }
    }

    #[test]
    fn out_of_order_fragments_are_rejected() {
        let mut reassembler = Reassembler::new();
        let data = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 4],
        };
        assert_matches!(
            reassembler.push(data, uids::IMPLICIT_VR_LITTLE_ENDIAN, None),
            Err(Error::UnexpectedDataFragment { .. })
        );

        let first = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: false,
            data: vec![0; 4],
        };
        let other = PDataValue {
            presentation_context_id: 3,
            ..first.clone()
        };
        assert!(reassembler
            .push(first, uids::IMPLICIT_VR_LITTLE_ENDIAN, None)
            .unwrap()
            .is_none());
        assert_matches!(
            reassembler.push(other, uids::IMPLICIT_VR_LITTLE_ENDIAN, None),
            Err(Error::ContextMismatch {
                expected: 1,
                got: 3,
                ..
            })
        );
    }
}
