//! Completion markers for commands running in the interactive shell.
//!
//! A persistent shell has no way to tell where the output of one command ends. Every command is
//! therefore followed by a `printf` which emits `<marker>, <exit status> ---` to stdout, where the
//! marker is a fresh random token. The matcher below watches stdout for that trailer, hides it from
//! the captured output and extracts the exit status.
//!
//! The same trailer, with status 0, then goes to stderr. The two streams are read independently, so
//! the stderr trailer tells that all the stderr output of the command has been received.

use std::fmt::Write as _;

/// Every marker starts with this, followed by 64 hex digits.
const MARKER_PREFIX: &str = "--- ";
const TRAILER_SEPARATOR: &[u8] = b", ";
const TRAILER_END: &[u8] = b" ---";

/// A random token marking the end of one interactive shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(String);

impl Marker {
    /// Generates a new marker from 256 random bits.
    pub fn generate() -> Self {
        let bits: [u8; 32] = rand::random();
        let mut token = String::with_capacity(MARKER_PREFIX.len() + 64);
        token.push_str(MARKER_PREFIX);
        for byte in bits {
            let _ = write!(token, "{:02x}", byte);
        }
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shell statements printing the trailer with the exit status of the previous command to
    /// stdout, then the trailer with status 0 to stderr.
    pub fn trailer_command(&self) -> String {
        format!(
            "printf \"%s, %d ---\" \"{0}\" \"$?\"; printf \"%s, %d ---\" \"{0}\" 0 >&2\n",
            self.0
        )
    }

    /// The trailer line the shell prints for `exit_code`.
    pub fn trailer(&self, exit_code: i32) -> String {
        format!("{}, {} ---", self.0, exit_code)
    }
}

/// Result of looking at the text following a full marker.
#[derive(Debug, PartialEq, Eq)]
enum Trailer {
    /// A complete trailer of `len` bytes carrying the exit code.
    Complete { code: i32, len: usize },
    /// Could still become a valid trailer once more data arrives.
    Incomplete,
    Malformed,
}

/// Checks that `prefix` agrees with `expected` for as long as both have bytes.
fn agrees(prefix: &[u8], expected: &[u8]) -> bool {
    let n = prefix.len().min(expected.len());
    prefix[..n] == expected[..n]
}

/// Parses the text following the marker: `", " <digits> " ---"`.
fn parse_trailer(tail: &str) -> Trailer {
    let bytes = tail.as_bytes();
    if !agrees(bytes, TRAILER_SEPARATOR) {
        return Trailer::Malformed;
    }
    if bytes.len() <= TRAILER_SEPARATOR.len() {
        return Trailer::Incomplete;
    }

    let body = &bytes[TRAILER_SEPARATOR.len()..];
    let digits = body.iter().take_while(|b| b.is_ascii_digit()).count();
    let rest = &body[digits..];
    if rest.is_empty() {
        return Trailer::Incomplete;
    }
    if digits == 0 || !agrees(rest, TRAILER_END) {
        return Trailer::Malformed;
    }
    if rest.len() < TRAILER_END.len() {
        return Trailer::Incomplete;
    }

    let start = TRAILER_SEPARATOR.len();
    match tail[start..start + digits].parse::<i32>() {
        Ok(code) => Trailer::Complete {
            code,
            len: start + digits + TRAILER_END.len(),
        },
        Err(_) => Trailer::Malformed,
    }
}

/// Watches one output stream of the interactive shell for the trailer of one command.
#[derive(Debug)]
pub struct MarkerMatcher {
    marker: Marker,
    /// Output held back because it is, or may become, the trailer.
    pending: String,
}

impl MarkerMatcher {
    pub fn new(marker: Marker) -> Self {
        Self {
            marker,
            pending: String::new(),
        }
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Text held back so far.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Takes the text held back so far, for when the trailer is not going to be waited for.
    pub fn take_pending(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Feeds a piece of the stream.
    ///
    /// Returns the text which belongs to the command output and, once the trailer was seen in
    /// full, the exit code of the command. A full marker followed by something that is not a
    /// trailer is an error, the offending text is returned.
    pub fn feed(&mut self, data: &str) -> Result<(String, Option<i32>), String> {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(data);

        let marker = self.marker.as_str();
        if let Some(pos) = text.find(marker) {
            let tail = &text[pos + marker.len()..];
            return match parse_trailer(tail) {
                Trailer::Complete { code, len } => {
                    if len < tail.len() {
                        log::debug!("discarding output after the marker: {:?}", &tail[len..]);
                    }
                    Ok((text[..pos].to_string(), Some(code)))
                }
                Trailer::Incomplete => {
                    self.pending = text[pos..].to_string();
                    Ok((text[..pos].to_string(), None))
                }
                Trailer::Malformed => Err(text[pos..].to_string()),
            };
        }

        // Hold back the longest tail of the text which is the beginning of the marker. The marker
        // is ASCII, so the split point is always a character boundary.
        let bytes = text.as_bytes();
        let max = bytes.len().min(marker.len() - 1);
        let hold = (1..=max)
            .rev()
            .find(|&k| bytes.ends_with(&marker.as_bytes()[..k]))
            .unwrap_or(0);

        self.pending = text[text.len() - hold..].to_string();
        text.truncate(text.len() - hold);
        Ok((text, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(matcher: &mut MarkerMatcher, chunks: &[&str]) -> (String, Option<i32>) {
        let mut output = String::new();
        for chunk in chunks {
            let (released, code) = matcher.feed(chunk).unwrap();
            output.push_str(&released);
            if code.is_some() {
                return (output, code);
            }
        }
        (output, None)
    }

    #[test]
    fn test_marker_format() {
        let marker = Marker::generate();
        assert!(marker.as_str().starts_with("--- "));
        assert_eq!(marker.as_str().len(), 4 + 64);
        assert!(marker.as_str()[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(marker, Marker::generate());
        assert!(marker.trailer_command().contains(marker.as_str()));
        assert!(marker.trailer_command().contains("\"$?\";"));
        assert!(marker.trailer_command().ends_with(" 0 >&2\n"));
    }

    #[test]
    fn test_trailer_in_one_chunk() {
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());
        let data = format!("hello\nworld\n{}", marker.trailer(0));
        let (out, code) = feed_all(&mut matcher, &[&data]);
        assert_eq!(out, "hello\nworld\n");
        assert_eq!(code, Some(0));
    }

    #[test]
    fn test_trailer_split_byte_by_byte() {
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());
        let data = format!("a, b --- c\n{}", marker.trailer(123));
        let chunks: Vec<String> = data.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
        let (out, code) = feed_all(&mut matcher, &refs);
        assert_eq!(out, "a, b --- c\n");
        assert_eq!(code, Some(123));
        assert!(matcher.pending().is_empty());
    }

    #[test]
    fn test_output_without_trailing_newline() {
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());
        let (out, code) = feed_all(&mut matcher, &["no newline", &marker.trailer(1)]);
        assert_eq!(out, "no newline");
        assert_eq!(code, Some(1));
    }

    #[test]
    fn test_marker_like_output_is_released() {
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());

        let (out, code) = matcher.feed("--- ").unwrap();
        assert_eq!(out, "");
        assert_eq!(code, None);
        assert_eq!(matcher.pending(), "--- ");

        let (out, code) = matcher.feed("not a marker ---\n").unwrap();
        assert_eq!(out, "--- not a marker ---\n");
        assert_eq!(code, None);
        assert!(matcher.pending().is_empty());
    }

    #[test]
    fn test_previous_marker_trailer_is_not_completion() {
        let old = Marker::generate();
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());

        let adversarial = old.trailer(0);
        let (out, code) = matcher.feed(&adversarial).unwrap();
        assert_eq!(code, None);

        let (rest, code) = matcher.feed(&format!("\n{}", marker.trailer(7))).unwrap();
        assert_eq!(code, Some(7));
        assert_eq!(format!("{}{}", out, rest), format!("{}\n", adversarial));
    }

    #[test]
    fn test_marker_prefix_of_real_marker() {
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());

        // Output which shares the first half of the marker, then diverges.
        let half = &marker.as_str()[..36];
        let (out, code) = matcher.feed(half).unwrap();
        assert_eq!(out, "");
        assert_eq!(code, None);

        let (out, code) = matcher.feed("zz\n").unwrap();
        assert_eq!(out, format!("{}zz\n", half));
        assert_eq!(code, None);
    }

    #[test]
    fn test_incomplete_trailer_is_held() {
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());
        let (out, code) = matcher.feed(&format!("x\n{}, 2", marker.as_str())).unwrap();
        assert_eq!(out, "x\n");
        assert_eq!(code, None);

        let (out, code) = matcher.feed("5").unwrap();
        assert_eq!((out.as_str(), code), ("", None));

        let (out, code) = matcher.feed("5 --").unwrap();
        assert_eq!((out.as_str(), code), ("", None));

        let (out, code) = matcher.feed("-").unwrap();
        assert_eq!((out.as_str(), code), ("", Some(255)));
    }

    #[test]
    fn test_take_pending() {
        let marker = Marker::generate();
        let mut matcher = MarkerMatcher::new(marker.clone());
        let (out, code) = matcher.feed("started--- ").unwrap();
        assert_eq!((out.as_str(), code), ("started", None));
        assert_eq!(matcher.pending(), "--- ");

        assert_eq!(matcher.take_pending(), "--- ");
        assert_eq!(matcher.pending(), "");
    }

    #[test]
    fn test_malformed_trailer_is_an_error() {
        let marker = Marker::generate();

        let mut matcher = MarkerMatcher::new(marker.clone());
        let bad = format!("{}, abc ---", marker.as_str());
        assert_eq!(matcher.feed(&bad).unwrap_err(), bad);

        let mut matcher = MarkerMatcher::new(marker.clone());
        let bad = format!("{}; 0 ---", marker.as_str());
        assert!(matcher.feed(&bad).is_err());

        let mut matcher = MarkerMatcher::new(marker.clone());
        let bad = format!("{}, 1x", marker.as_str());
        assert!(matcher.feed(&bad).is_err());
    }

    #[test]
    fn test_parse_trailer() {
        assert_eq!(parse_trailer(""), Trailer::Incomplete);
        assert_eq!(parse_trailer(","), Trailer::Incomplete);
        assert_eq!(parse_trailer(", "), Trailer::Incomplete);
        assert_eq!(parse_trailer(", 1"), Trailer::Incomplete);
        assert_eq!(parse_trailer(", 1 -"), Trailer::Incomplete);
        assert_eq!(parse_trailer(", 1 ---"), Trailer::Complete { code: 1, len: 7 });
        assert_eq!(parse_trailer(", 42 ---tail"), Trailer::Complete { code: 42, len: 8 });
        assert_eq!(parse_trailer(",  ---"), Trailer::Malformed);
        assert_eq!(parse_trailer(" 1 ---"), Trailer::Malformed);
        assert_eq!(parse_trailer(", 99999999999 ---"), Trailer::Malformed);
    }
}
