//! Connection engine options.
use std::time::Duration;

use crate::pdu::DEFAULT_MAX_PDU;

/// Tuning and logging options of a [`DicomService`](super::DicomService).
///
/// ```
/// # use std::time::Duration;
/// # use dicom_dimse::service::ServiceOptions;
/// let options = ServiceOptions::new()
///     .max_pdu_length(32_768)
///     .max_async_ops_invoked(4)
///     .read_timeout(Duration::from_secs(30))
///     .log_dimse_datasets(true);
/// assert_eq!(options.get_max_pdu_length(), 32_768);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    max_pdus_in_queue: usize,
    max_command_buffer: u32,
    max_data_buffer: u32,
    max_pdu_length: u32,
    strict: bool,
    log_data_pdus: bool,
    log_dimse_datasets: bool,
    use_remote_ae_for_log_name: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_async_ops_invoked: u16,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            max_pdus_in_queue: 16,
            max_command_buffer: 1024,
            max_data_buffer: 1024 * 1024,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            log_data_pdus: false,
            log_dimse_datasets: false,
            use_remote_ae_for_log_name: false,
            read_timeout: None,
            write_timeout: None,
            max_async_ops_invoked: 1,
        }
    }
}

impl ServiceOptions {
    pub fn new() -> Self {
        ServiceOptions::default()
    }

    /// Number of outgoing PDUs which may wait for transmission
    /// before message serialization is suspended.
    pub fn max_pdus_in_queue(mut self, value: usize) -> Self {
        self.max_pdus_in_queue = value.max(1);
        self
    }

    /// Upper bound on the PDU length used when sending command sets.
    pub fn max_command_buffer(mut self, value: u32) -> Self {
        self.max_command_buffer = value;
        self
    }

    /// Upper bound on the PDU length used when sending data sets.
    pub fn max_data_buffer(mut self, value: u32) -> Self {
        self.max_data_buffer = value;
        self
    }

    /// The maximum PDU length that this node accepts to receive,
    /// advertised during association negotiation.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Whether to refuse incoming PDUs longer than
    /// the advertised maximum PDU length.
    pub fn strict(mut self, value: bool) -> Self {
        self.strict = value;
        self
    }

    /// Log every presentation data value sent and received.
    pub fn log_data_pdus(mut self, value: bool) -> Self {
        self.log_data_pdus = value;
        self
    }

    /// Log the full command and data sets of every message.
    pub fn log_dimse_datasets(mut self, value: bool) -> Self {
        self.log_dimse_datasets = value;
        self
    }

    /// Record the peer's AE title in the connection's log span.
    pub fn use_remote_ae_for_log_name(mut self, value: bool) -> Self {
        self.use_remote_ae_for_log_name = value;
        self
    }

    /// Deadline for receiving each PDU.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Deadline for transmitting each PDU.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Maximum number of outstanding operations
    /// to propose (requestor) or tolerate (acceptor), 0 for unlimited.
    pub fn max_async_ops_invoked(mut self, value: u16) -> Self {
        self.max_async_ops_invoked = value;
        self
    }

    pub fn get_max_pdus_in_queue(&self) -> usize {
        self.max_pdus_in_queue
    }

    pub fn get_max_command_buffer(&self) -> u32 {
        self.max_command_buffer
    }

    pub fn get_max_data_buffer(&self) -> u32 {
        self.max_data_buffer
    }

    pub fn get_max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn get_log_data_pdus(&self) -> bool {
        self.log_data_pdus
    }

    pub fn get_log_dimse_datasets(&self) -> bool {
        self.log_dimse_datasets
    }

    pub fn get_use_remote_ae_for_log_name(&self) -> bool {
        self.use_remote_ae_for_log_name
    }

    pub fn get_read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn get_write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn get_max_async_ops_invoked(&self) -> u16 {
        self.max_async_ops_invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ServiceOptions::default();
        assert_eq!(options.get_max_pdus_in_queue(), 16);
        assert_eq!(options.get_max_command_buffer(), 1024);
        assert_eq!(options.get_max_data_buffer(), 1024 * 1024);
        assert_eq!(options.get_max_pdu_length(), DEFAULT_MAX_PDU);
        assert!(options.is_strict());
        assert_eq!(options.get_read_timeout(), None);
        assert_eq!(options.get_max_async_ops_invoked(), 1);
    }

    #[test]
    fn queue_depth_is_at_least_one() {
        let options = ServiceOptions::new().max_pdus_in_queue(0);
        assert_eq!(options.get_max_pdus_in_queue(), 1);
    }
}
