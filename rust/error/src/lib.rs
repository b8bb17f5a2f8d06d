// Standard error codes shared by every silo crate, modeled on the gRPC
// status vocabulary so callers can handle errors generically.
use std::error::Error;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    // INVALID_ARGUMENT indicates the caller specified an invalid parameter.
    InvalidArgument = 3,
    // NOT_FOUND means a requested entity (e.g., an index file) was not found.
    NotFound = 5,
    // RESOURCE_EXHAUSTED indicates some resource has been exhausted.
    ResourceExhausted = 8,
    // OUT_OF_RANGE means an operation was attempted past the valid range.
    OutOfRange = 11,
    // UNIMPLEMENTED indicates an operation is not implemented or enabled.
    Unimplemented = 12,
    // INTERNAL errors are internal errors.
    Internal = 13,
    // DATA_LOSS indicates unrecoverable data loss or corruption.
    DataLoss = 15,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::Internal => "InternalError",
            ErrorCodes::DataLoss => "DataLossError",
            _ => "SiloError",
        }
    }
}

pub trait SiloError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn SiloError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

impl Error for Box<dyn SiloError> {}

impl SiloError for Box<dyn SiloError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl SiloError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}
