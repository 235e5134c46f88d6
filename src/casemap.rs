//! IRC case mapping.
//!
//! Networks advertise how nicknames and channel names compare
//! case-insensitively via the `CASEMAPPING` ISUPPORT token. Folding is
//! byte-wise over the UTF-8 encoding: bytes in `[0x61, upper]` are shifted
//! down by 0x20, where `upper` depends on the mapping. The rfc1459 variants
//! additionally fold `{`, `|`, `}` (and `~` for plain rfc1459) onto
//! `[`, `\`, `]` (`^`).

/// Case mapping rule advertised by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CaseMapping {
    /// Fold only ASCII `a-z`.
    #[default]
    Ascii,
    /// Fold `a-z` plus `{|}~` onto `[\]^`.
    Rfc1459,
    /// Fold `a-z` plus `{|}` onto `[\]`, leaving `~` alone.
    Rfc1459Strict,
}

impl CaseMapping {
    /// Parse a `CASEMAPPING` token value. Unknown values degrade to ascii.
    pub fn parse(value: &str) -> Self {
        match value {
            "rfc1459" => Self::Rfc1459,
            "rfc1459-strict" => Self::Rfc1459Strict,
            _ => Self::Ascii,
        }
    }

    /// The token value this mapping is advertised as.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ascii => "ascii",
            Self::Rfc1459 => "rfc1459",
            Self::Rfc1459Strict => "rfc1459-strict",
        }
    }

    fn upper_bound(&self) -> u8 {
        match self {
            Self::Ascii => 0x7A,
            Self::Rfc1459 => 0x7E,
            Self::Rfc1459Strict => 0x7D,
        }
    }

    /// Fold a name to its canonical (upper) form under this mapping.
    pub fn fold(&self, s: &str) -> String {
        let upper = self.upper_bound();
        let mut bytes = s.as_bytes().to_vec();
        for b in &mut bytes {
            if (0x61..=upper).contains(b) {
                *b -= 0x20;
            }
        }
        // Folding only rewrites bytes in the ASCII range, so the result is
        // valid UTF-8 whenever the input was.
        String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }

    /// Compare two names for equality under this mapping.
    pub fn irc_eq(&self, a: &str, b: &str) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let upper = self.upper_bound();
        a.as_bytes().iter().zip(b.as_bytes()).all(|(&x, &y)| {
            let fx = if (0x61..=upper).contains(&x) { x - 0x20 } else { x };
            let fy = if (0x61..=upper).contains(&y) { y - 0x20 } else { y };
            fx == fy
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_fold() {
        assert_eq!(CaseMapping::Ascii.fold("NickName"), "NICKNAME");
        assert_eq!(CaseMapping::Ascii.fold("nick{}|~"), "NICK{}|~");
    }

    #[test]
    fn test_rfc1459_fold() {
        assert_eq!(CaseMapping::Rfc1459.fold("nick{a}|~"), "NICK[A]\\^");
        assert_eq!(CaseMapping::Rfc1459Strict.fold("nick{a}|~"), "NICK[A]\\~");
    }

    #[test]
    fn test_fold_idempotent() {
        for m in [
            CaseMapping::Ascii,
            CaseMapping::Rfc1459,
            CaseMapping::Rfc1459Strict,
        ] {
            for s in ["Foo", "foo{|}~", "日本語abc", "[\\]^"] {
                assert_eq!(m.fold(&m.fold(s)), m.fold(s));
            }
        }
    }

    #[test]
    fn test_eq() {
        assert!(CaseMapping::Rfc1459.irc_eq("foo{bar}", "FOO[BAR]"));
        assert!(!CaseMapping::Ascii.irc_eq("foo{bar}", "FOO[BAR]"));
        assert!(CaseMapping::Ascii.irc_eq("Foo", "fOO"));
        assert!(!CaseMapping::Ascii.irc_eq("foo", "fooo"));
    }

    #[test]
    fn test_parse_unknown_degrades_to_ascii() {
        assert_eq!(CaseMapping::parse("rfc7613"), CaseMapping::Ascii);
        assert_eq!(CaseMapping::parse("rfc1459"), CaseMapping::Rfc1459);
        assert_eq!(
            CaseMapping::parse("rfc1459-strict"),
            CaseMapping::Rfc1459Strict
        );
    }

    #[test]
    fn test_non_ascii_untouched() {
        assert_eq!(CaseMapping::Rfc1459.fold("café"), "CAFé");
    }
}
