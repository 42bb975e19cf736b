use std::borrow::Cow;
use std::fmt::Display;
use std::path::Path;

/// Display a path the way a POSIX shell would need it quoted, for log
/// messages. Plain paths are printed unchanged.
#[derive(Debug)]
pub struct PathQuotedDisplay<'a> {
    path: &'a Path,
}

impl Display for PathQuotedDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: Cow<str> = self.path.to_string_lossy();
        if s
            .chars()
            .all(|c| matches!(c, '/' | '.' | '-' | '_') || c.is_alphanumeric())
        {
            return f.write_str(&s);
        }
        match shlex::try_quote(&s) {
            Ok(q) => f.write_str(&q),
            // Only NUL bytes are unquotable; those can't appear in a path.
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl<'a> PathQuotedDisplay<'a> {
    /// Wrap `path` for display.
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P) -> PathQuotedDisplay<'a> {
        PathQuotedDisplay {
            path: path.as_ref(),
        }
    }
}
