//! Destinations for the data sets of incoming C-STORE requests.
//!
//! Stored instances can be large, so the connection engine does not
//! buffer them like other data sets. Instead, each fragment is handed to a
//! [`StoreSink`] obtained from the service's [`StoreStorage`] as it arrives,
//! and the sink is parsed into a [`ReceivedInstance`] once the last
//! fragment has been written.
use std::fmt;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use snafu::{Backtrace, ResultExt, Snafu};
use tempfile::NamedTempFile;

use crate::message::{self, Dataset};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not create storage for instance {}", sop_instance_uid))]
    CreateSink {
        sop_instance_uid: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not write instance data"))]
    WriteSink {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not parse received instance"))]
    ParseInstance {
        #[snafu(backtrace)]
        source: message::Error,
    },
    #[snafu(display("Could not persist received instance to {}", path.display()))]
    Persist {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What is known about an instance before its data set arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMeta {
    pub presentation_context_id: u8,
    pub message_id: u16,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax accepted for the presentation context.
    pub transfer_syntax: String,
}

/// A writable destination for one incoming instance.
///
/// The connection engine calls sinks from the blocking thread pool,
/// so they may block on I/O.
pub trait StoreSink: Send {
    /// Append the next fragment of the data set.
    fn write_fragment(&mut self, data: &[u8]) -> Result<()>;

    /// Finish writing and parse the stored data set.
    fn finish(self: Box<Self>, meta: StoreMeta) -> Result<ReceivedInstance>;
}

/// A factory of [`StoreSink`]s.
pub trait StoreStorage: Send + Sync {
    fn create_sink(&self, meta: &StoreMeta) -> Result<Box<dyn StoreSink>>;
}

/// An instance received through a C-STORE request.
pub struct ReceivedInstance {
    meta: StoreMeta,
    dataset: Dataset,
    file: Option<NamedTempFile>,
}

impl fmt::Debug for ReceivedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedInstance")
            .field("meta", &self.meta)
            .field("file", &self.path())
            .finish_non_exhaustive()
    }
}

impl ReceivedInstance {
    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn into_dataset(self) -> Dataset {
        self.dataset
    }

    /// The temporary file holding the raw data set, if one was used.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    /// Move the raw data set file to a permanent location.
    ///
    /// Instances kept in memory are written out in their received encoding.
    pub fn persist(self, path: impl AsRef<Path>) -> Result<Dataset> {
        let path = path.as_ref();
        match self.file {
            Some(file) => {
                file.persist(path)
                    .map_err(|e| e.error)
                    .context(PersistSnafu { path })?;
            }
            None => {
                let bytes = self.dataset.encode().context(ParseInstanceSnafu)?;
                std::fs::write(path, bytes).context(PersistSnafu { path })?;
            }
        }
        Ok(self.dataset)
    }
}

/// Keeps incoming instances in memory.
#[derive(Debug, Default, Copy, Clone)]
pub struct MemoryStorage;

impl StoreStorage for MemoryStorage {
    fn create_sink(&self, _meta: &StoreMeta) -> Result<Box<dyn StoreSink>> {
        Ok(Box::new(MemorySink(Vec::new())))
    }
}

struct MemorySink(Vec<u8>);

impl StoreSink for MemorySink {
    fn write_fragment(&mut self, data: &[u8]) -> Result<()> {
        self.0.extend_from_slice(data);
        Ok(())
    }

    fn finish(self: Box<Self>, meta: StoreMeta) -> Result<ReceivedInstance> {
        let dataset =
            Dataset::decode(&self.0, &meta.transfer_syntax).context(ParseInstanceSnafu)?;
        Ok(ReceivedInstance {
            meta,
            dataset,
            file: None,
        })
    }
}

/// Streams incoming instances into temporary files.
#[derive(Debug, Clone, Default)]
pub struct TempFileStorage {
    dir: Option<PathBuf>,
}

impl TempFileStorage {
    /// Use the system's temporary directory.
    pub fn new() -> Self {
        TempFileStorage::default()
    }

    /// Place temporary files in the given directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        TempFileStorage {
            dir: Some(dir.into()),
        }
    }
}

impl StoreStorage for TempFileStorage {
    fn create_sink(&self, meta: &StoreMeta) -> Result<Box<dyn StoreSink>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dimse-").suffix(".dcm");
        let file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context(CreateSinkSnafu {
            sop_instance_uid: meta.sop_instance_uid.clone(),
        })?;
        Ok(Box::new(FileSink {
            writer: BufWriter::new(file),
        }))
    }
}

struct FileSink {
    writer: BufWriter<NamedTempFile>,
}

impl StoreSink for FileSink {
    fn write_fragment(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).context(WriteSinkSnafu)
    }

    fn finish(self: Box<Self>, meta: StoreMeta) -> Result<ReceivedInstance> {
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context(WriteSinkSnafu)?;
        file.as_file_mut()
            .seek(SeekFrom::Start(0))
            .context(WriteSinkSnafu)?;
        let dataset = Dataset::read_from(BufReader::new(file.as_file_mut()), &meta.transfer_syntax)
            .context(ParseInstanceSnafu)?;
        Ok(ReceivedInstance {
            meta,
            dataset,
            file: Some(file),
        })
    }
}
