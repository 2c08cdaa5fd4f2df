// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Debug, Display, Formatter, Result};
use std::io;

/// POSIX errno
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code, clippy::upper_case_acronyms)]
pub enum EpcErrorNum {
    EPERM = 1,
    ENOENT = 2,
    EINTR = 4,
    EIO = 5,
    E2BIG = 7,
    ENOMEM = 12,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    EINVAL = 22,
    ENOSPC = 28,
    ERANGE = 34,
    ENOSYS = 38,
    EBADMSG = 74,
    ERESTART = 85,
    ECANCELED = 125,
    ENOTRECOVERABLE = 131,
}

/// How a failure propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried locally with a bounded budget, never kills the enclave.
    Transient,
    /// No free pages or no backing space, surfaced to the caller.
    Resource,
    /// Verification failure on reload.
    Integrity,
    /// Irrecoverable hardware protocol failure, or the enclave is already dead.
    Protocol,
    /// Malformed request rejected at the boundary.
    Validation,
}

pub struct EpcError {
    num: EpcErrorNum,
    loc_file: &'static str,
    loc_line: u32,
    loc_col: u32,
    msg: Option<String>,
}

pub type EpcResult<T = ()> = std::result::Result<T, EpcError>;

impl EpcErrorNum {
    pub fn as_str(&self) -> &'static str {
        use EpcErrorNum::*;
        match *self {
            EPERM => "Operation not permitted",
            ENOENT => "No such file or directory",
            EINTR => "Interrupted system call",
            EIO => "I/O error",
            E2BIG => "Argument list too long",
            ENOMEM => "Out of memory",
            EFAULT => "Bad address",
            EBUSY => "Device or resource busy",
            EEXIST => "File exists",
            ENODEV => "No such device",
            EINVAL => "Invalid argument",
            ENOSPC => "No space left on device",
            ERANGE => "Math result not representable",
            ENOSYS => "Function not implemented",
            EBADMSG => "Bad message",
            ERESTART => "Interrupted system call should be restarted",
            ECANCELED => "Operation canceled",
            ENOTRECOVERABLE => "State not recoverable",
        }
    }

    pub fn code(&self) -> i32 {
        -(*self as u32 as i32)
    }

    pub fn class(&self) -> ErrorClass {
        use EpcErrorNum::*;
        match *self {
            EBUSY | EINTR | ERESTART => ErrorClass::Transient,
            ENOMEM | ENOSPC => ErrorClass::Resource,
            EBADMSG => ErrorClass::Integrity,
            EIO | ENOTRECOVERABLE => ErrorClass::Protocol,
            _ => ErrorClass::Validation,
        }
    }
}

impl EpcError {
    pub fn new(
        num: EpcErrorNum,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<String>,
    ) -> Self {
        Self {
            num,
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn num(&self) -> EpcErrorNum {
        self.num
    }

    pub fn loc_line(&self) -> u32 {
        self.loc_line
    }

    pub fn loc_col(&self) -> u32 {
        self.loc_col
    }

    pub fn loc_file(&self) -> &'static str {
        self.loc_file
    }

    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    pub fn code(&self) -> i32 {
        self.num.code()
    }

    pub fn class(&self) -> ErrorClass {
        self.num.class()
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl Debug for EpcError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file,
            self.loc_line,
            self.loc_col,
            self.num.as_str()
        )?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl Display for EpcError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.num.as_str())?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for EpcError {}

impl From<io::Error> for EpcError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        let num = match err.raw_os_error() {
            Some(28) => EpcErrorNum::ENOSPC,
            _ => match err.kind() {
                io::ErrorKind::OutOfMemory => EpcErrorNum::ENOMEM,
                io::ErrorKind::Interrupted => EpcErrorNum::EINTR,
                _ => EpcErrorNum::EIO,
            },
        };
        let loc = std::panic::Location::caller();
        Self::new(num, loc.file(), loc.line(), loc.column(), Some(err.to_string()))
    }
}

#[macro_export]
macro_rules! epc_err {
    ($num: ident) => {{
        use $crate::error::{EpcError, EpcErrorNum::*};
        EpcError::new($num, file!(), line!(), column!(), None)
    }};
    ($num: ident, $msg: expr) => {{
        use $crate::error::{EpcError, EpcErrorNum::*};
        EpcError::new($num, file!(), line!(), column!(), Some($msg.into()))
    }};
}

#[macro_export]
macro_rules! epc_result_err {
    ($num: ident) => {
        Err(epc_err!($num))
    };
    ($num: ident, $msg: expr) => {
        Err(epc_err!($num, $msg))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        assert_eq!(epc_err!(EBUSY).class(), ErrorClass::Transient);
        assert_eq!(epc_err!(ENOMEM).class(), ErrorClass::Resource);
        assert_eq!(epc_err!(EBADMSG).class(), ErrorClass::Integrity);
        assert_eq!(epc_err!(ENOTRECOVERABLE).class(), ErrorClass::Protocol);
        assert_eq!(epc_err!(EEXIST).class(), ErrorClass::Validation);
        assert_eq!(epc_err!(EINVAL).code(), -22);
    }

    #[test]
    fn test_error_debug_has_location() {
        let err = epc_err!(EFAULT, "bad page");
        let s = format!("{:?}", err);
        assert!(s.contains("error.rs"));
        assert!(s.ends_with("Bad address: bad page"));
        assert_eq!(err.msg(), Some("bad page"));
    }

    #[test]
    fn test_io_error_mapping() {
        let err: EpcError = io::Error::from_raw_os_error(28).into();
        assert_eq!(err.num(), EpcErrorNum::ENOSPC);
        let err: EpcError = io::Error::new(io::ErrorKind::Other, "x").into();
        assert_eq!(err.num(), EpcErrorNum::EIO);
    }
}
