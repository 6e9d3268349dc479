use std::fmt::Write;

/// Turns a `Result` into an `Option`, logging the error.
///
/// The logged message includes the error's whole `source()` chain, since most
/// agent errors wrap an io or runtime error that carries the actual cause.
pub trait ResultOkLogExt<T, E> {
    fn ok_log(self) -> Option<T>;

    fn ok_log_at(self, level: log::Level) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        self.ok_log_at(log::Level::Error)
    }

    fn ok_log_at(self, level: log::Level) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::log!(level, "{}", error_chain(&err));
                None
            }
        }
    }
}

/// Formats `err` followed by each of its sources, separated by `: `.
///
/// Sources already contained in their parent's message are skipped.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let msg = cause.to_string();
        if !out.contains(&msg) {
            let _ = write!(out, ": {msg}");
        }
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum Outer {
        #[error("failed to read `{0}`")]
        Read(&'static str, #[source] std::io::Error),
        #[error("lookup failed: {0}")]
        Inline(#[source] std::io::Error),
    }

    fn not_found() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no such file")
    }

    #[test]
    fn chain_appends_sources() {
        let err = Outer::Read("/proc/1/net/nf_conntrack", not_found());
        assert_eq!(
            error_chain(&err),
            "failed to read `/proc/1/net/nf_conntrack`: no such file"
        );
    }

    #[test]
    fn chain_skips_sources_already_in_message() {
        let err = Outer::Inline(not_found());
        assert_eq!(error_chain(&err), "lookup failed: no such file");
    }

    #[test]
    fn ok_log_keeps_value_and_drops_error() {
        let ok: Result<u32, Outer> = Ok(7);
        assert_eq!(ok.ok_log(), Some(7));
        let err: Result<u32, Outer> = Err(Outer::Inline(not_found()));
        assert_eq!(err.ok_log_at(log::Level::Warn), None);
    }
}
