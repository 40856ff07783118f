//! Shared error primitives.
//!
//! Typed errors live next to the code that produces them (as `snafu` enums). This crate covers everything else: an
//! untyped, context-carrying [`GenericError`], a macro to build one, and [`ErrorContext`] for attaching context to
//! fallible values without pulling `anyhow::Context` into scope, whose method names collide with `snafu::ResultExt`.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

/// An untyped error with an optional chain of causes.
pub type GenericError = anyhow::Error;

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

/// Builds a [`GenericError`].
///
/// Accepts a string literal, a format string followed by its arguments, or any value implementing `Debug` and
/// `Display`. When given an existing `std::error::Error`, that error's source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
    impl<T> Sealed for Option<T> {}
}

/// Attaches context to fallible values, converting them into [`GenericError`].
pub trait ErrorContext<T>: sealed::Sealed {
    /// Wraps the failure with `context`.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the failure with context that is only built if a failure actually occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|e| GenericError::new(e).context(context))
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| GenericError::new(e).context(f()))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        self.ok_or_else(|| GenericError::msg(context.to_string()))
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| GenericError::msg(f().to_string()))
    }
}
