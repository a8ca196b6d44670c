/// Byte substituted for sequences that would corrupt the host-visible
/// document: ASCII SUB.
pub(crate) const DEFAULT_SENTINEL: u8 = 0x1A;

/// Replace sequences that would break the HTML/CSV container.
///
/// `-->` would close the HTML comment that hides the raw log regions from
/// the browser, and `\t` upsets the viewer's clipboard export; both are
/// always neutralized. With `remove_separators`, `,` and `\n` are also
/// replaced so a cell value cannot split a row.
///
/// Returns `None` when nothing needed changing, letting the caller keep the
/// original buffer.
pub(crate) fn clean_buffer(s: &[u8], remove_separators: bool, sentinel: u8) -> Option<Vec<u8>> {
    let mut cleaned: Option<Vec<u8>> = None;
    for i in 0..s.len() {
        if i + 2 < s.len() && s[i] == b'-' && s[i + 1] == b'-' && s[i + 2] == b'>' {
            let out = cleaned.get_or_insert_with(|| s.to_vec());
            out[i] = sentinel;
            out[i + 1] = sentinel;
            out[i + 2] = sentinel;
        }
        if s[i] == b'\t' || (remove_separators && (s[i] == b',' || s[i] == b'\n')) {
            cleaned.get_or_insert_with(|| s.to_vec())[i] = sentinel;
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: u8 = DEFAULT_SENTINEL;

    #[test]
    fn untouched_input_returns_none() {
        assert_eq!(clean_buffer(b"plain text", true, S), None);
        assert_eq!(clean_buffer(b"a,b\n", false, S), None);
    }

    #[test]
    fn comment_terminator_is_blanked() {
        let out = clean_buffer(b"a-->b", false, S).unwrap();
        assert_eq!(out, [b'a', S, S, S, b'b']);
    }

    #[test]
    fn terminator_at_end_of_input_is_caught() {
        let out = clean_buffer(b"x-->", false, S).unwrap();
        assert_eq!(out, [b'x', S, S, S]);
    }

    #[test]
    fn separators_only_with_flag() {
        let out = clean_buffer(b"a,b\nc\t", true, S).unwrap();
        assert_eq!(out, [b'a', S, b'b', S, b'c', S]);
        let out = clean_buffer(b"a,b\nc\t", false, S).unwrap();
        assert_eq!(out, [b'a', b',', b'b', b'\n', b'c', S]);
    }

    #[test]
    fn cleaning_is_idempotent() {
        let once = clean_buffer(b"a-->b,c\t", true, S).unwrap();
        assert_eq!(clean_buffer(&once, true, S), None);
    }

    #[test]
    fn output_never_contains_forbidden_sequences() {
        let dirty = b"-->,\t\n-->-->";
        let out = clean_buffer(dirty, true, S).unwrap();
        assert!(!out.windows(3).any(|w| w == b"-->"));
        assert!(!out.contains(&b'\t'));
        assert!(!out.contains(&b','));
        assert!(!out.contains(&b'\n'));
    }
}
