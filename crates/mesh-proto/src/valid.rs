//! Identifier validation: SIDs, UIDs, nicknames, channel names.

/// A SID is exactly three characters drawn from uppercase letters and
/// digits, e.g. `8B4` or `2AA`.
pub fn is_valid_sid(s: &str) -> bool {
    s.len() == 3 && s.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// A UID is nine characters: the owning server's SID followed by six
/// characters from the same alphabet, e.g. `8B4AAAAAB`.
pub fn is_valid_uid(s: &str) -> bool {
    s.len() == 9
        && is_valid_sid(&s[..3])
        && s[3..]
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// RFC 1459 nickname shape: first character a letter or one of the special
/// characters `` [ ] \ ` _ ^ { | } ``, remaining characters add digits and `-`.
pub fn is_valid_nick(s: &str, max_len: usize) -> bool {
    if s.is_empty() || s.len() > max_len {
        return false;
    }

    let is_special = |c: char| {
        let code = c as u32;
        (0x5B..=0x60).contains(&code) || (0x7B..=0x7D).contains(&code)
    };

    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || is_special(first)) {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || is_special(c) || c == '-')
}

/// Channel names open with `#` or `&` and contain no spaces, commas, or
/// control characters.
pub fn is_channel_name(s: &str) -> bool {
    let mut chars = s.chars();
    if !matches!(chars.next(), Some('#') | Some('&')) {
        return false;
    }

    s.len() >= 2 && s.len() <= 50 && chars.all(|c| c != ' ' && c != ',' && !c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_shape() {
        assert!(is_valid_sid("8B4"));
        assert!(is_valid_sid("2AA"));
        assert!(is_valid_sid("001"));
        assert!(!is_valid_sid("8b4"));
        assert!(!is_valid_sid("8B"));
        assert!(!is_valid_sid("8B44"));
    }

    #[test]
    fn uid_shape() {
        assert!(is_valid_uid("8B4AAAAAB"));
        assert!(is_valid_uid("2AAAAAAAB"));
        assert!(!is_valid_uid("8B4AAAAA"));
        assert!(!is_valid_uid("8B4aaaaab"));
        assert!(!is_valid_uid("8B4AAAAABC"));
    }

    #[test]
    fn nick_shape() {
        assert!(is_valid_nick("alice", 9));
        assert!(is_valid_nick("[away]", 9));
        assert!(is_valid_nick("a-b_c", 9));
        assert!(!is_valid_nick("9alice", 9));
        assert!(!is_valid_nick("-dash", 9));
        assert!(!is_valid_nick("", 9));
        assert!(!is_valid_nick("toolongnick", 9));
        assert!(!is_valid_nick("sp ace", 9));
    }

    #[test]
    fn channel_shape() {
        assert!(is_channel_name("#x"));
        assert!(is_channel_name("&local"));
        assert!(!is_channel_name("#"));
        assert!(!is_channel_name("plain"));
        assert!(!is_channel_name("#a,b"));
        assert!(!is_channel_name("#a b"));
    }
}
