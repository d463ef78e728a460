//! Terminal-junk filter.
//!
//! tmux in passthrough mode can inject status-line redraw sequences into the
//! middle of the protocol stream, and interactive shells can echo keystrokes
//! ahead of a frame. This layer makes the byte stream safe before the line
//! is parsed: device-control-string spans are excised and the right-most
//! occurrence of the expected tag wins.

/// Strip tmux status-line redraw sequences of the form `ESC P = .. ESC \`.
///
/// tmux wraps the redraw in a double DCS: the outer marker is followed by a
/// second marker where the actual payload begins, then the `ESC \`
/// terminator ends the span. Repeats until no complete span remains; an
/// unterminated span truncates the buffer at its start.
pub fn strip_tmux_status_line(buf: &[u8]) -> Vec<u8> {
    const DCS: &[u8] = b"\x1bP=";
    const ST: &[u8] = b"\x1b\\";

    let mut buf = buf.to_vec();
    loop {
        let begin = match find(&buf, DCS, 0) {
            Some(i) => i,
            None => return buf,
        };
        let mid = match find(&buf, DCS, begin + DCS.len()) {
            Some(i) => i,
            None => {
                buf.truncate(begin);
                return buf;
            }
        };
        let end = match find(&buf, ST, mid + DCS.len()) {
            Some(i) => i,
            None => {
                buf.truncate(begin);
                return buf;
            }
        };
        buf.drain(begin..end + ST.len());
    }
}

/// Locate the right-most occurrence of `#<TAG>:` in a junk-polluted line and
/// return the clean tail. Falls back to the right-most bare `#` when the
/// exact tag never survived, leaving the caller to report the mismatch.
pub fn locate_frame<'a>(line: &'a [u8], expect_tag: &str) -> &'a [u8] {
    let marker = format!("#{expect_tag}:");
    if let Some(idx) = rfind(line, marker.as_bytes()) {
        return &line[idx..];
    }
    if let Some(idx) = rfind(line, b"#") {
        return &line[idx..];
    }
    line
}

fn find(buf: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > buf.len() || needle.is_empty() {
        return None;
    }
    buf[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn rfind(buf: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > buf.len() {
        return None;
    }
    buf.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_passes_clean_lines() {
        assert_eq!(strip_tmux_status_line(b"#SUCC:123"), b"#SUCC:123");
        assert_eq!(strip_tmux_status_line(b""), b"");
    }

    #[test]
    fn test_strip_excises_dcs_span() {
        let polluted = b"#SUCC\x1bP=junk\x1bP=payload\x1b\\:123";
        assert_eq!(strip_tmux_status_line(polluted), b"#SUCC:123");
    }

    #[test]
    fn test_strip_excises_repeated_spans() {
        let polluted = b"\x1bP=a\x1bP=b\x1b\\#NUM\x1bP=c\x1bP=d\x1b\\:5";
        assert_eq!(strip_tmux_status_line(polluted), b"#NUM:5");
    }

    #[test]
    fn test_strip_truncates_unterminated_span() {
        let polluted = b"#SIZE:100\x1bP=redraw in progress";
        assert_eq!(strip_tmux_status_line(polluted), b"#SIZE:100");
    }

    #[test]
    fn test_locate_frame_rightmost_tag() {
        let line = b"ls -l#SUCC:junk#SUCC:100";
        assert_eq!(locate_frame(line, "SUCC"), b"#SUCC:100");
    }

    #[test]
    fn test_locate_frame_leading_echo() {
        let line = b"echoed keystrokes#NAME:abc";
        assert_eq!(locate_frame(line, "NAME"), b"#NAME:abc");
    }

    #[test]
    fn test_locate_frame_bare_hash_fallback() {
        let line = b"noise#FAIL:oops";
        assert_eq!(locate_frame(line, "SUCC"), b"#FAIL:oops");
    }

    #[test]
    fn test_locate_frame_no_marker() {
        let line = b"no marker at all";
        assert_eq!(locate_frame(line, "SUCC"), line);
    }
}
