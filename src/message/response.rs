//! Command reply container and the status taxonomy shared by all adapters.

use bytes::Bytes;

/// Outcome classification carried by every reply.
///
/// Adapters translate these into their own vocabulary: RESP turns
/// `NotFound` into a nil bulk string and `TypeMismatch` into the
/// `WRONGTYPE` error line; the HTTP adapter maps them onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    NotFound,
    InvalidCommand,
    InvalidArguments,
    TypeMismatch,
}

impl Status {
    /// Enumerant name, used verbatim in the HTTP status header.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Error => "Error",
            Status::NotFound => "NotFound",
            Status::InvalidCommand => "InvalidCommand",
            Status::InvalidArguments => "InvalidArguments",
            Status::TypeMismatch => "TypeMismatch",
        }
    }
}

/// Reply to a single command.
///
/// Payload-carrying variants are implicitly `Status::Ok`; failures travel
/// in the `Status` variant together with a human-readable message.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Status reply with no payload, successful or not.
    Status { status: Status, message: String },
    /// Integer reply (counts, lengths, TTLs).
    Int(i64),
    /// Single binary-safe payload.
    Str(Bytes),
    /// List of binary-safe payloads.
    StrSlice(Vec<Bytes>),
}

impl Response {
    /// Plain `OK`.
    pub fn ok() -> Self {
        Response::Status {
            status: Status::Ok,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Status {
            status: Status::Error,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Response::Status {
            status: Status::NotFound,
            message: message.into(),
        }
    }

    pub fn invalid_command(message: impl Into<String>) -> Self {
        Response::Status {
            status: Status::InvalidCommand,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Response::Status {
            status: Status::InvalidArguments,
            message: message.into(),
        }
    }

    pub fn wrong_type(message: impl Into<String>) -> Self {
        Response::Status {
            status: Status::TypeMismatch,
            message: message.into(),
        }
    }

    /// Status of this reply; payload variants report `Ok`.
    pub fn status(&self) -> Status {
        match self {
            Response::Status { status, .. } => *status,
            _ => Status::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_variants_are_ok() {
        assert_eq!(Response::Int(7).status(), Status::Ok);
        assert_eq!(Response::Str(Bytes::from("x")).status(), Status::Ok);
        assert_eq!(Response::StrSlice(vec![]).status(), Status::Ok);
        assert_eq!(Response::ok().status(), Status::Ok);
    }

    #[test]
    fn status_variants_carry_their_status() {
        assert_eq!(Response::error("boom").status(), Status::Error);
        assert_eq!(Response::not_found("gone").status(), Status::NotFound);
        assert_eq!(
            Response::invalid_arguments("arity").status(),
            Status::InvalidArguments
        );
        assert_eq!(
            Response::invalid_command("nope").status(),
            Status::InvalidCommand
        );
        assert_eq!(Response::wrong_type("kind").status(), Status::TypeMismatch);
    }

    #[test]
    fn status_names() {
        assert_eq!(Status::Ok.as_str(), "Ok");
        assert_eq!(Status::TypeMismatch.as_str(), "TypeMismatch");
    }
}
