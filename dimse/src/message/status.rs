//! DIMSE status codes (PS3.7 Annex C).
use std::fmt;

/// The general category of a DIMSE status code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatusState {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusState::Success => "Success",
            StatusState::Pending => "Pending",
            StatusState::Cancel => "Cancel",
            StatusState::Warning => "Warning",
            StatusState::Failure => "Failure",
        };
        f.write_str(name)
    }
}

/// A DIMSE status code, as found in the _Status_ (0000,0900) element.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const CANCEL: Status = Status(0xFE00);
    pub const PENDING: Status = Status(0xFF00);
    /// Pending, with one or more optional keys not supported
    pub const PENDING_WARNING: Status = Status(0xFF01);

    pub const ATTRIBUTE_LIST_ERROR: Status = Status(0x0107);
    pub const ATTRIBUTE_VALUE_OUT_OF_RANGE: Status = Status(0x0116);
    pub const COERCION_OF_DATA_ELEMENTS: Status = Status(0xB000);
    pub const ELEMENTS_DISCARDED: Status = Status(0xB006);
    pub const DATASET_DOES_NOT_MATCH_SOP_CLASS_WARNING: Status = Status(0xB007);

    pub const CLASS_INSTANCE_CONFLICT: Status = Status(0x0119);
    pub const DUPLICATE_SOP_INSTANCE: Status = Status(0x0111);
    pub const DUPLICATE_INVOCATION: Status = Status(0x0210);
    pub const INVALID_ARGUMENT_VALUE: Status = Status(0x0115);
    pub const INVALID_ATTRIBUTE_VALUE: Status = Status(0x0106);
    pub const INVALID_OBJECT_INSTANCE: Status = Status(0x0117);
    pub const MISSING_ATTRIBUTE: Status = Status(0x0120);
    pub const MISSING_ATTRIBUTE_VALUE: Status = Status(0x0121);
    pub const MISTYPED_ARGUMENT: Status = Status(0x0212);
    pub const NO_SUCH_ARGUMENT: Status = Status(0x0114);
    pub const NO_SUCH_ATTRIBUTE: Status = Status(0x0105);
    pub const NO_SUCH_EVENT_TYPE: Status = Status(0x0113);
    pub const NO_SUCH_SOP_INSTANCE: Status = Status(0x0112);
    pub const NO_SUCH_SOP_CLASS: Status = Status(0x0118);
    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    pub const RESOURCE_LIMITATION: Status = Status(0x0213);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const NOT_AUTHORIZED: Status = Status(0x0124);

    pub const OUT_OF_RESOURCES: Status = Status(0xA700);
    pub const OUT_OF_RESOURCES_NUMBER_OF_MATCHES: Status = Status(0xA701);
    pub const OUT_OF_RESOURCES_SUB_OPERATIONS: Status = Status(0xA702);
    pub const MOVE_DESTINATION_UNKNOWN: Status = Status(0xA801);
    pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: Status = Status(0xA900);
    pub const SUB_OPERATIONS_COMPLETE_WITH_FAILURES: Status = Status(0xB000);

    pub fn code(self) -> u16 {
        self.0
    }

    /// Classify the status code.
    pub fn state(self) -> StatusState {
        match self.0 {
            0x0000 => StatusState::Success,
            0xFF00 | 0xFF01 => StatusState::Pending,
            0xFE00 => StatusState::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusState::Warning,
            _ => StatusState::Failure,
        }
    }

    /// Whether more responses are to follow for the same request.
    pub fn is_pending(self) -> bool {
        self.state() == StatusState::Pending
    }

    /// Whether this status ends the operation.
    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }

    /// A short human readable description of common status codes.
    pub fn description(self) -> &'static str {
        match self.0 {
            0x0000 => "Success",
            0xFE00 => "Cancel",
            0xFF00 => "Pending",
            0xFF01 => "Pending (optional keys not supported)",
            0x0105 => "No such attribute",
            0x0106 => "Invalid attribute value",
            0x0107 => "Attribute list error",
            0x0110 => "Processing failure",
            0x0111 => "Duplicate SOP instance",
            0x0112 => "No such SOP instance",
            0x0113 => "No such event type",
            0x0114 => "No such argument",
            0x0115 => "Invalid argument value",
            0x0116 => "Attribute value out of range",
            0x0117 => "Invalid object instance",
            0x0118 => "No such SOP class",
            0x0119 => "Class-instance conflict",
            0x0120 => "Missing attribute",
            0x0121 => "Missing attribute value",
            0x0122 => "SOP class not supported",
            0x0124 => "Not authorized",
            0x0210 => "Duplicate invocation",
            0x0211 => "Unrecognized operation",
            0x0212 => "Mistyped argument",
            0x0213 => "Resource limitation",
            0xA700..=0xA7FF => "Out of resources",
            0xA801 => "Move destination unknown",
            0xA900..=0xA9FF => "Data set does not match SOP class",
            0xB000 => "Coercion of data elements / sub-operations complete with failures",
            0xB006 => "Elements discarded",
            0xB007 => "Data set does not match SOP class",
            0xC000..=0xCFFF => "Unable to process",
            _ => match self.state() {
                StatusState::Warning => "Warning",
                _ => "Failure",
            },
        }
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:04X}: {}]", self.state(), self.0, self.description())
    }
}
