//! Transfer syntax conversion of outgoing data sets.
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, Backtrace, OptionExt, Snafu};

use crate::message::Dataset;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Unknown transfer syntax {}", uid))]
    UnknownTransferSyntax { uid: String, backtrace: Backtrace },
    #[snafu(display("Cannot transcode from {} to {}", from, to))]
    Unsupported {
        from: String,
        to: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Converts data sets into the transfer syntax of a presentation context.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, dataset: &mut Dataset, transfer_syntax: &str) -> Result<()>;
}

/// Converts between native (uncompressed) transfer syntaxes.
///
/// In-memory objects are independent of their encoding, so switching
/// between codec-free transfer syntaxes only changes the syntax the data
/// set will be written with. Anything involving encapsulated pixel data
/// is refused.
#[derive(Debug, Default, Copy, Clone)]
pub struct NativeTranscoder;

impl Transcoder for NativeTranscoder {
    fn transcode(&self, dataset: &mut Dataset, transfer_syntax: &str) -> Result<()> {
        if dataset.transfer_syntax() == transfer_syntax {
            return Ok(());
        }
        let from = TransferSyntaxRegistry
            .get(dataset.transfer_syntax())
            .context(UnknownTransferSyntaxSnafu {
                uid: dataset.transfer_syntax(),
            })?;
        let to = TransferSyntaxRegistry
            .get(transfer_syntax)
            .context(UnknownTransferSyntaxSnafu {
                uid: transfer_syntax,
            })?;
        ensure!(
            from.is_codec_free() && to.is_codec_free(),
            UnsupportedSnafu {
                from: from.uid(),
                to: to.uid(),
            }
        );
        dataset.set_transfer_syntax(transfer_syntax);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::uids;
    use dicom_object::InMemDicomObject;

    #[test]
    fn native_relabel() {
        let mut dataset = Dataset::new(InMemDicomObject::new_empty());
        NativeTranscoder
            .transcode(&mut dataset, uids::IMPLICIT_VR_LITTLE_ENDIAN)
            .unwrap();
        assert_eq!(dataset.transfer_syntax(), uids::IMPLICIT_VR_LITTLE_ENDIAN);
    }

    #[test]
    fn refuses_encapsulated() {
        let mut dataset = Dataset::new(InMemDicomObject::new_empty());
        let result = NativeTranscoder.transcode(&mut dataset, uids::JPEG_BASELINE8_BIT);
        assert!(matches!(result, Err(Error::Unsupported { .. })));
        assert_eq!(dataset.transfer_syntax(), uids::EXPLICIT_VR_LITTLE_ENDIAN);
    }
}
