//! Error-context helpers shared by the crate-local error types.

/// Error types that can be built from a plain message string.
///
/// Crates implement this for their own `Error` and then invoke
/// [`impl_context!`](crate::impl_context) inside their error module.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generates a crate-local `Context` trait adding `.context()` and
/// `.with_context()` to `Result` and `Option`.
///
/// The invoking module must define `Error: FromMessage` and
/// `type Result<T> = std::result::Result<T, Error>`.
///
/// ```ignore
/// // crates/config/src/error.rs
/// feedlink_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    mod local {
        #[derive(Debug, thiserror::Error)]
        #[error("{0}")]
        pub struct Error(pub String);

        impl crate::FromMessage for Error {
            fn from_message(message: String) -> Self {
                Self(message)
            }
        }

        pub type Result<T> = std::result::Result<T, Error>;

        crate::impl_context!();
    }

    use local::Context;

    #[test]
    fn context_prefixes_result_errors() {
        let res: Result<(), &str> = Err("boom");
        let err = res.context("loading credentials").unwrap_err();
        assert_eq!(err.to_string(), "loading credentials: boom");
    }

    #[test]
    fn context_on_none_uses_message() {
        let none: Option<u8> = None;
        let err = none.with_context(|| "no own account").unwrap_err();
        assert_eq!(err.0, "no own account");
    }
}
