//! The driver's top-level error split (spec §7): a `User`/`Internal`
//! two-variant wrapper exactly like the teacher's `vmm::Error`, with a
//! `kind()` projection onto the wire-level taxonomy the RPC layer above
//! this core would format.

/// Bad input or a domain in the wrong state for the requested operation.
#[derive(Debug)]
pub enum UserError {
    NoDomain(String),
    InvalidDomain(String),
    InvalidArg(String),
    AlreadyActive(String),
    AlreadyDefined(String),
    NoSupport(String),
    ImageVersionUnsupported(i32),
    OperationFailed(String),
}

/// Resource exhaustion or a logical bug, never the caller's fault.
#[derive(Debug)]
pub enum InternalError {
    Launcher(launcher::Error),
    Monitor(monitor::Error),
    Registry(registry::Error),
    Epoll(std::io::Error),
    Poll(std::io::Error),
    Timer(std::io::Error),
    Io(std::io::Error),
    NoMemory,
    System(std::io::Error),
}

#[derive(Debug)]
pub enum Error {
    User(UserError),
    Internal(InternalError),
}

impl From<UserError> for Error {
    fn from(e: UserError) -> Self {
        Error::User(e)
    }
}

impl From<InternalError> for Error {
    fn from(e: InternalError) -> Self {
        Error::Internal(e)
    }
}

impl From<launcher::Error> for Error {
    fn from(e: launcher::Error) -> Self {
        Error::Internal(InternalError::Launcher(e))
    }
}

impl From<monitor::Error> for Error {
    fn from(e: monitor::Error) -> Self {
        Error::Internal(InternalError::Monitor(e))
    }
}

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        match e {
            registry::Error::NotFound(s) => Error::User(UserError::NoDomain(s)),
            registry::Error::DuplicateName(s) => Error::User(UserError::AlreadyDefined(s)),
            registry::Error::Invalid(s) => Error::User(UserError::InvalidDomain(s)),
            registry::Error::Io(e) => Error::Internal(InternalError::Io(e)),
        }
    }
}

impl From<domain::DefineError> for Error {
    fn from(e: domain::DefineError) -> Self {
        Error::User(UserError::InvalidDomain(e.to_string()))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::User(u) => match u {
                UserError::NoDomain(s) => write!(f, "no domain named '{}'", s),
                UserError::InvalidDomain(s) => write!(f, "invalid domain definition: {}", s),
                UserError::InvalidArg(s) => write!(f, "invalid argument: {}", s),
                UserError::AlreadyActive(s) => write!(f, "domain '{}' is already active", s),
                UserError::AlreadyDefined(s) => write!(f, "already defined: {}", s),
                UserError::NoSupport(s) => write!(f, "not supported: {}", s),
                UserError::ImageVersionUnsupported(v) => {
                    write!(f, "image version is not supported ({} > 1)", v)
                }
                UserError::OperationFailed(s) => write!(f, "operation failed: {}", s),
            },
            Error::Internal(i) => match i {
                InternalError::Launcher(e) => write!(f, "launcher: {}", e),
                InternalError::Monitor(e) => write!(f, "monitor: {}", e),
                InternalError::Registry(e) => write!(f, "registry: {}", e),
                InternalError::Epoll(e) => write!(f, "epoll: {}", e),
                InternalError::Poll(e) => write!(f, "poll: {}", e),
                InternalError::Timer(e) => write!(f, "timer: {}", e),
                InternalError::Io(e) => write!(f, "i/o: {}", e),
                InternalError::NoMemory => write!(f, "out of memory"),
                InternalError::System(e) => write!(f, "system error: {}", e),
            },
        }
    }
}

/// The wire-level taxonomy named in spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    NoDomain,
    InvalidDomain,
    InvalidArg,
    OperationFailed,
    NoSupport,
    InternalError,
    NoMemory,
    SystemError,
}

impl Error {
    pub fn kind(&self) -> Kind {
        match self {
            Error::User(u) => match u {
                UserError::NoDomain(_) => Kind::NoDomain,
                UserError::InvalidDomain(_) => Kind::InvalidDomain,
                UserError::InvalidArg(_) => Kind::InvalidArg,
                UserError::AlreadyActive(_) => Kind::OperationFailed,
                UserError::AlreadyDefined(_) => Kind::OperationFailed,
                UserError::NoSupport(_) => Kind::NoSupport,
                UserError::ImageVersionUnsupported(_) => Kind::OperationFailed,
                UserError::OperationFailed(_) => Kind::OperationFailed,
            },
            Error::Internal(i) => match i {
                InternalError::NoMemory => Kind::NoMemory,
                InternalError::System(_) => Kind::SystemError,
                _ => Kind::InternalError,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::from(UserError::NoDomain("x".into())).kind(),
            Kind::NoDomain
        );
        assert_eq!(
            Error::from(InternalError::NoMemory).kind(),
            Kind::NoMemory
        );
        assert_eq!(
            Error::from(InternalError::Io(std::io::Error::from(std::io::ErrorKind::Other)))
                .kind(),
            Kind::InternalError
        );
    }

    #[test]
    fn test_image_version_message() {
        let e = Error::from(UserError::ImageVersionUnsupported(2));
        assert_eq!(e.to_string(), "image version is not supported (2 > 1)");
    }
}
