// Copyright 2024 Google LLC
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

//! Anyhow context carrying the call site. Far-memory failures surface a
//! long way from where they happen (prefetch workers, evictors, the server
//! request loop), so every propagation step tags the chain with the file
//! and line it passed through.

use std::fmt;
use std::fmt::Display;

use anyhow::Context;

use crate::prelude::*;

pub struct Location {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[macro_export]
macro_rules! loc {
    () => {
        Location {
            file: file!(),
            line: line!(),
        }
    };
}
pub use loc;

/// `.location(loc!())` tags an error chain with the propagation site;
/// `.context(loc!(), msg)` / `.with_context(loc!(), || msg)` add a message
/// as well.
pub trait LocationContextExt<R, T, E>: Context<T, E> {
    fn location(self, loc: Location) -> Result<T>;

    fn context<C>(self, loc: Location, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static;

    fn with_context<C, F>(self, loc: Location, context: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<R, T, E> LocationContextExt<R, T, E> for R
where
    R: Context<T, E>,
{
    fn location(self, loc: Location) -> Result<T> {
        Context::context(self, loc)
    }

    fn context<C>(self, loc: Location, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        Context::with_context(self, || format!("{loc}: {context}"))
    }

    fn with_context<C, F>(self, loc: Location, context: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        Context::with_context(self, || format!("{loc}: {}", context()))
    }
}

/// For results that stop at a log line instead of propagating, e.g.
/// speculative work whose failure the demand path will rediscover.
pub trait LogExt<T, E>: Context<T, E> {
    fn warn(self, loc: Location) -> Result<T>;
    fn log(self, loc: Location) -> Result<T>;
}

impl<R, T, E> LogExt<T, E> for R
where
    R: Context<T, E>,
{
    fn warn(self, loc: Location) -> Result<T> {
        let res = self.location(loc);
        if let Err(e) = &res {
            warn!("{e:?}");
        }
        res
    }

    fn log(self, loc: Location) -> Result<T> {
        let res = self.location(loc);
        if let Err(e) = &res {
            error!("{e:?}");
        }
        res
    }
}

/// `?` for functions that return (): log the error and bail out.
#[macro_export]
macro_rules! log_and_return {
    ($expression:expr) => {
        match $expression {
            Ok(val) => val,
            Err(e) => {
                error!("{e:?}");
                return;
            },
        }
    };
}
pub use log_and_return;

/// `?` for loop bodies: log the error and move on to the next iteration.
#[macro_export]
macro_rules! log_and_continue {
    ($expression:expr) => {
        match $expression {
            Ok(val) => val,
            Err(e) => {
                error!("{e:?}");
                continue;
            },
        }
    };
}
pub use log_and_continue;
