//! Delimiter-prefixed message framing
//!
//! Wire format: UTF-8 text where every message starts with a literal
//! delimiter, e.g. `<msg>first<msg>second`. Each read is framed on its own;
//! there is no reassembly across reads.

/// Delimiter that prefixes every framed message
pub const MESSAGE_DELIMITER: &str = "<msg>";

/// Split a received chunk into messages.
///
/// A chunk that does not start with `delimiter` is returned unchanged as a
/// single message. Otherwise the chunk is split on every delimiter, blank
/// fragments are dropped and the delimiter is put back in front of each
/// remaining fragment.
pub fn split(buffer: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() || !buffer.starts_with(delimiter) {
        return vec![buffer.to_string()];
    }

    let messages: Vec<String> = buffer
        .split(delimiter)
        .filter(|fragment| !fragment.trim().is_empty())
        .map(|fragment| format!("{}{}", delimiter, fragment))
        .collect();

    // A lone delimiter is still one message
    if messages.is_empty() {
        return vec![buffer.to_string()];
    }

    messages
}

/// Prefix `payload` with `delimiter` unless it already starts with it
pub fn frame(payload: &str, delimiter: &str) -> String {
    if payload.starts_with(delimiter) {
        payload.to_string()
    } else {
        format!("{}{}", delimiter, payload)
    }
}

/// Decode one read and frame it.
///
/// Invalid UTF-8 is replaced, surrounding whitespace trimmed; a blank read
/// yields no messages.
pub fn decode(bytes: &[u8], delimiter: &str) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    split(text, delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: &str = MESSAGE_DELIMITER;

    #[test]
    fn test_unframed_buffer_is_one_message() {
        assert_eq!(split("hello world", D), vec!["hello world"]);
        assert_eq!(split("x<msg>y", D), vec!["x<msg>y"]);
    }

    #[test]
    fn test_two_messages() {
        assert_eq!(
            split("<msg>my message 1<msg>my message 2", D),
            vec!["<msg>my message 1", "<msg>my message 2"]
        );
    }

    #[test]
    fn test_concatenation_splits_back_into_inputs() {
        let a = "<msg>{\"cmd\":\"start\"}";
        let b = "<msg>second one";
        let joined = format!("{}{}", a, b);
        assert_eq!(split(&joined, D), vec![a, b]);
    }

    #[test]
    fn test_lone_delimiter() {
        assert_eq!(split("<msg>", D), vec!["<msg>"]);
    }

    #[test]
    fn test_consecutive_delimiters_dropped() {
        assert_eq!(split("<msg><msg>a<msg><msg>b", D), vec!["<msg>a", "<msg>b"]);
    }

    #[test]
    fn test_framer_does_not_trim_fragments() {
        assert_eq!(split("<msg> a <msg>b", D), vec!["<msg> a ", "<msg>b"]);
    }

    #[test]
    fn test_decode_whitespace_only_is_empty() {
        assert!(decode(b"   \n\t ", D).is_empty());
        assert!(decode(b"", D).is_empty());
    }

    #[test]
    fn test_decode_trims_before_framing() {
        assert_eq!(decode(b"  <msg>hello\n", D), vec!["<msg>hello"]);
    }

    #[test]
    fn test_frame_adds_delimiter_once() {
        assert_eq!(frame("hello", D), "<msg>hello");
        assert_eq!(frame("<msg>hello", D), "<msg>hello");
    }

    #[test]
    fn test_empty_delimiter_is_total() {
        assert_eq!(split("abc", ""), vec!["abc"]);
    }
}
