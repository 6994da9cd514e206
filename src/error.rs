// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Error types for the engine

use std::error;
use std::fmt::{Display, Formatter};
use std::result;

use arrow::error::ArrowError;

/// Result type for operations that could result in an [Error]
pub type Result<T, E = Error> = result::Result<T, E>;

/// Engine error
#[derive(Debug)]
pub enum Error {
    /// Error returned by arrow
    ArrowError(ArrowError),
    /// Malformed aggregate expression; fatal to the query
    Parse(String),
    /// Partial results with incompatible schemas reached a merge; fatal
    SchemaMismatch(String),
    /// An operator primitive failed (device OOM, arithmetic, unsupported type)
    Compute(String),
    /// An inter-node message could not be delivered
    Transport(String),
    /// A mutating call was made on a cache after `finish()`; programming error
    ClosedCache(String),
    /// Error due to an internal invariant being broken.
    /// This error should not happen in normal usage of the engine.
    Internal(String),
}

impl From<ArrowError> for Error {
    fn from(e: ArrowError) -> Self {
        Error::ArrowError(e)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Error::ArrowError(desc) => write!(f, "Arrow error: {desc}"),
            Error::Parse(desc) => write!(f, "Parse error: {desc}"),
            Error::SchemaMismatch(desc) => write!(f, "Schema mismatch: {desc}"),
            Error::Compute(desc) => write!(f, "Compute error: {desc}"),
            Error::Transport(desc) => write!(f, "Transport error: {desc}"),
            Error::ClosedCache(desc) => {
                write!(f, "Cache was used after finish(): {desc}")
            }
            Error::Internal(desc) => {
                write!(
                    f,
                    "Internal error: {desc}. This was likely caused by a bug in the \
                     engine's code and we would welcome that you file a bug report"
                )
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ArrowError(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = Error::Parse("missing group clause".to_string());
        assert_eq!(e.to_string(), "Parse error: missing group clause");

        let e = Error::from(ArrowError::ComputeError("bad data".to_string()));
        assert!(e.to_string().contains("bad data"));
    }

    #[test]
    fn arrow_error_source_is_preserved() {
        use std::error::Error as _;
        let e = Error::from(ArrowError::ComputeError("x".to_string()));
        assert!(e.source().is_some());
        assert!(Error::Internal("y".to_string()).source().is_none());
    }
}
