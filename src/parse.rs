//! Extraction of tagged measurements from free-form subprocess output.
//!
//! Workloads (or the wrappers around them) report measurements as single lines of the form
//! `TAG: f1-f2-...-fN`, for example the timing wrapper's `PPROF-POLLY: 1.230000-0.040000-1.300000`. Everything else in
//! the output is noise and is ignored.

use std::fmt::{self, Display, Formatter};

/// A tag and the number of `-`-separated floating point fields that follow it.
///
/// # Examples
///
/// ```
/// use polly_bench::parse::TaggedFormat;
///
/// let format = TaggedFormat::new("PPROF-POLLY", 3);
///
/// assert_eq!(format.parse_line("PPROF-POLLY: 1.5-0.25-2"), Some(vec![1.5, 0.25, 2.0]));
/// assert_eq!(format.parse_line("some unrelated line"), None);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedFormat {
    tag: String,
    arity: usize,
}

impl TaggedFormat {
    /// Creates a format for lines starting with `tag:` followed by exactly `arity` fields.
    pub fn new(tag: impl Into<String>, arity: usize) -> Self {
        Self {
            tag: tag.into(),
            arity,
        }
    }

    /// The literal tag, without the trailing `:`.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Number of fields in each tuple.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Parses a single line, returning `None` if it does not carry the tag or is malformed.
    #[must_use]
    pub fn parse_line(&self, line: &str) -> Option<Vec<f64>> {
        let payload = line
            .trim()
            .strip_prefix(self.tag.as_str())?
            .strip_prefix(':')?
            .trim();

        let fields = split_fields(payload)
            .into_iter()
            .map(|field| field.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;

        (fields.len() == self.arity && fields.iter().all(|field| field.is_finite()))
            .then_some(fields)
    }

    /// Parses every matching line, preserving input order.
    ///
    /// Lines that do not carry the tag are skipped, as are tagged lines with the wrong number of fields or a field
    /// that is not a number. An empty result means no measurements were produced, which is not an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use polly_bench::parse::TaggedFormat;
    ///
    /// let format = TaggedFormat::new("PPROF-POLLY", 3);
    /// let output = "Command exited\nPPROF-POLLY: 0.5-0.01-0.52\nPPROF-POLLY: nope\n";
    ///
    /// assert_eq!(format.parse_lines(output.lines()), vec![vec![0.5, 0.01, 0.52]]);
    /// ```
    pub fn parse_lines<'a, I>(&self, lines: I) -> Vec<Vec<f64>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines
            .into_iter()
            .filter_map(|line| {
                let parsed = self.parse_line(line);
                if parsed.is_none() && line.trim_start().starts_with(self.tag.as_str()) {
                    log::debug!("skipping malformed {} line: {line:?}", self.tag);
                }
                parsed
            })
            .collect()
    }
}

impl Display for TaggedFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.tag)?;
        for i in 0..self.arity {
            if i > 0 {
                write!(f, "-")?;
            }
            write!(f, "%g")?;
        }
        Ok(())
    }
}

/// Splits on `-`, except where the `-` is the sign of an exponent (`1.5e-05`).
fn split_fields(payload: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut previous = None;
    for (i, c) in payload.char_indices() {
        if c == '-' && !matches!(previous, Some('e' | 'E')) {
            fields.push(&payload[start..i]);
            start = i + 1;
        }
        previous = Some(c);
    }
    fields.push(&payload[start..]);
    fields
}
