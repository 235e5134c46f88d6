//! ISUPPORT (RPL_ISUPPORT, numeric 005) token handling.
//!
//! Servers advertise feature and limit tokens as `KEY[=VALUE]` pairs; a
//! leading `-` retracts a previously advertised token. The engine folds
//! every 005 line into one owned map; unspecified tokens fall back to the
//! RFC defaults below.
//!
//! # Reference
//! - <https://modern.ircdocs.horse/#rplisupport-005>

use std::collections::HashMap;

use crate::casemap::CaseMapping;

/// Default `CHANTYPES` when the server advertises none.
pub const DEFAULT_CHANTYPES: &str = "#&";
/// Default `CHANMODES` when the server advertises none.
pub const DEFAULT_CHANMODES: &str = "b,k,l,imnpst";
/// Default `PREFIX` when the server advertises none.
pub const DEFAULT_PREFIX: &str = "(ov)@+";

/// Owned map of ISUPPORT tokens with typed accessors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Isupport {
    tokens: HashMap<String, Option<String>>,
}

impl Isupport {
    /// An empty token map (all defaults apply).
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one `KEY[=VALUE]` or `-KEY` token.
    pub fn apply(&mut self, token: &str) {
        if token.is_empty() || token.starts_with(':') {
            return;
        }
        if let Some(removed) = token.strip_prefix('-') {
            let key = removed.split('=').next().unwrap_or(removed);
            self.tokens.remove(&key.to_ascii_uppercase());
            return;
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (token, None),
        };
        if key.is_empty() {
            return;
        }
        self.tokens.insert(key.to_ascii_uppercase(), value);
    }

    /// Look up a token: `None` if unadvertised, `Some(None)` for a
    /// valueless token.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.tokens
            .get(&key.to_ascii_uppercase())
            .map(|v| v.as_deref())
    }

    /// The token's value, or `default` when the token is unadvertised or
    /// valueless.
    pub fn get_or_default<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.get(key) {
            Some(Some(v)) => v,
            _ => default,
        }
    }

    /// Iterate over all advertised tokens.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.tokens.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// `CHANTYPES`, defaulting to `#&`.
    pub fn chantypes(&self) -> &str {
        self.get_or_default("CHANTYPES", DEFAULT_CHANTYPES)
    }

    /// `CASEMAPPING`, defaulting to ascii; unknown values degrade to ascii.
    pub fn casemapping(&self) -> CaseMapping {
        match self.get("CASEMAPPING") {
            Some(Some(v)) => CaseMapping::parse(v),
            _ => CaseMapping::Ascii,
        }
    }

    /// `NETWORK`, if advertised.
    pub fn network(&self) -> Option<&str> {
        self.get("NETWORK").flatten()
    }

    /// `LINELEN`, if advertised with a numeric value.
    pub fn linelen(&self) -> Option<usize> {
        self.get("LINELEN").flatten().and_then(|v| v.parse().ok())
    }

    /// `PREFIX` decomposed as `(modes)symbols`, defaulting to `(ov)@+`.
    pub fn prefix(&self) -> PrefixSpec {
        PrefixSpec::parse(self.get_or_default("PREFIX", DEFAULT_PREFIX))
            .unwrap_or_else(|| PrefixSpec::parse(DEFAULT_PREFIX).expect("default PREFIX parses"))
    }

    /// `CHANMODES` decomposed into the A/B/C/D classes, defaulting to
    /// `b,k,l,imnpst`.
    pub fn chanmodes(&self) -> ChanModes {
        ChanModes::parse(self.get_or_default("CHANMODES", DEFAULT_CHANMODES))
            .unwrap_or_else(|| ChanModes::parse(DEFAULT_CHANMODES).expect("default CHANMODES parses"))
    }
}

/// The `PREFIX` token decomposed: status mode letters and their display
/// symbols, in rank order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixSpec {
    modes: String,
    symbols: String,
}

impl PrefixSpec {
    /// Parse a `(modes)symbols` value. The two halves must be the same
    /// length and non-empty.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('(')?;
        let (modes, symbols) = rest.split_once(')')?;
        if modes.is_empty() || modes.chars().count() != symbols.chars().count() {
            return None;
        }
        Some(Self {
            modes: modes.to_string(),
            symbols: symbols.to_string(),
        })
    }

    /// Status mode letters, highest rank first.
    pub fn modes(&self) -> &str {
        &self.modes
    }

    /// Status prefix symbols, highest rank first.
    pub fn symbols(&self) -> &str {
        &self.symbols
    }

    /// The symbol for a status mode letter.
    pub fn symbol_for_mode(&self, mode: char) -> Option<char> {
        let idx = self.modes.chars().position(|c| c == mode)?;
        self.symbols.chars().nth(idx)
    }

    /// The rank of a symbol (0 is highest).
    pub fn rank_of_symbol(&self, symbol: char) -> Option<usize> {
        self.symbols.chars().position(|c| c == symbol)
    }

    /// True if `c` is one of the status symbols.
    pub fn is_symbol(&self, c: char) -> bool {
        self.symbols.contains(c)
    }

    /// True if `c` is one of the status mode letters.
    pub fn is_mode(&self, c: char) -> bool {
        self.modes.contains(c)
    }

    /// Sort a prefix string into rank order, dropping unknown symbols and
    /// duplicates.
    pub fn normalize(&self, prefixes: &str) -> String {
        let mut out = String::new();
        for sym in self.symbols.chars() {
            if prefixes.contains(sym) {
                out.push(sym);
            }
        }
        out
    }
}

/// The `CHANMODES` token decomposed into its four comma-separated classes.
///
/// Type A modes are list modes (argument, untracked); type B always take an
/// argument; type C take one only when set; type D never do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChanModes {
    a: String,
    b: String,
    c: String,
    d: String,
}

impl ChanModes {
    /// Parse an `A,B,C,D` value.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(4, ',');
        let (a, b, c, d) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        Some(Self {
            a: a.to_string(),
            b: b.to_string(),
            c: c.to_string(),
            d: d.to_string(),
        })
    }

    /// Classify a channel mode letter.
    pub fn classify(&self, mode: char) -> Option<ChanModeClass> {
        if self.a.contains(mode) {
            Some(ChanModeClass::A)
        } else if self.b.contains(mode) {
            Some(ChanModeClass::B)
        } else if self.c.contains(mode) {
            Some(ChanModeClass::C)
        } else if self.d.contains(mode) {
            Some(ChanModeClass::D)
        } else {
            None
        }
    }
}

/// Channel mode classes per the `CHANMODES` ISUPPORT token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChanModeClass {
    /// List mode: consumes an argument, not tracked in channel state.
    A,
    /// Always takes an argument.
    B,
    /// Takes an argument only when set.
    C,
    /// Never takes an argument.
    D,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_get() {
        let mut isu = Isupport::new();
        isu.apply("NETWORK=ExampleNet");
        isu.apply("EXCEPTS");
        assert_eq!(isu.get("network"), Some(Some("ExampleNet")));
        assert_eq!(isu.get("EXCEPTS"), Some(None));
        assert_eq!(isu.get("INVEX"), None);
    }

    #[test]
    fn test_apply_removal() {
        let mut isu = Isupport::new();
        isu.apply("MONITOR=100");
        isu.apply("-MONITOR");
        assert_eq!(isu.get("MONITOR"), None);
    }

    #[test]
    fn test_apply_idempotent() {
        let mut a = Isupport::new();
        a.apply("CHANTYPES=#");
        a.apply("LINELEN=1024");
        let mut b = a.clone();
        b.apply("CHANTYPES=#");
        b.apply("LINELEN=1024");
        assert_eq!(a, b);
    }

    #[test]
    fn test_defaults() {
        let isu = Isupport::new();
        assert_eq!(isu.chantypes(), "#&");
        assert_eq!(isu.casemapping(), CaseMapping::Ascii);
        let prefix = isu.prefix();
        assert_eq!(prefix.modes(), "ov");
        assert_eq!(prefix.symbols(), "@+");
        let cm = isu.chanmodes();
        assert_eq!(cm.classify('b'), Some(ChanModeClass::A));
        assert_eq!(cm.classify('k'), Some(ChanModeClass::B));
        assert_eq!(cm.classify('l'), Some(ChanModeClass::C));
        assert_eq!(cm.classify('i'), Some(ChanModeClass::D));
        assert_eq!(cm.classify('X'), None);
    }

    #[test]
    fn test_prefix_spec() {
        let spec = PrefixSpec::parse("(qaohv)~&@%+").unwrap();
        assert_eq!(spec.symbol_for_mode('o'), Some('@'));
        assert_eq!(spec.rank_of_symbol('~'), Some(0));
        assert!(spec.is_symbol('%'));
        assert!(!spec.is_symbol('#'));
        assert_eq!(spec.normalize("+~@"), "~@+");
        assert!(PrefixSpec::parse("(ov)@").is_none());
        assert!(PrefixSpec::parse("ov@+").is_none());
    }

    #[test]
    fn test_casemapping_token() {
        let mut isu = Isupport::new();
        isu.apply("CASEMAPPING=rfc1459");
        assert_eq!(isu.casemapping(), CaseMapping::Rfc1459);
        isu.apply("CASEMAPPING=bogus");
        assert_eq!(isu.casemapping(), CaseMapping::Ascii);
    }

    #[test]
    fn test_linelen() {
        let mut isu = Isupport::new();
        assert_eq!(isu.linelen(), None);
        isu.apply("LINELEN=1024");
        assert_eq!(isu.linelen(), Some(1024));
        isu.apply("LINELEN=bogus");
        assert_eq!(isu.linelen(), None);
    }
}
